//! Trace events delivered to subscribers.
//!
//! Events are immutable once built. Every contour an event references has been
//! announced by an earlier `type-load` or `new-object` event.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ContourId, EventId, FieldKey, Line, MethodKey, ObjectId, ThreadId, TypeKey};
use crate::source::LockOp;
use crate::value::{CallerRef, ValueRef};

/// The variable touched by an assign/delete event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum VariableTarget {
    /// A local of a method contour.
    Local(String),
    /// A field of an object or type contour.
    Field(FieldKey),
    /// One cell of an array contour.
    Cell(usize),
}

impl fmt::Display for VariableTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(name) => write!(f, "{name}"),
            Self::Field(field) => write!(f, "{field}"),
            Self::Cell(index) => write!(f, "[{index}]"),
        }
    }
}

/// Event payloads.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    TypeLoad {
        contour: ContourId,
        type_key: TypeKey,
        super_contour: Option<ContourId>,
    },
    NewObject {
        contour: ContourId,
        object: ObjectId,
        type_contour: ContourId,
    },
    DestroyObject {
        contour: ContourId,
        object: ObjectId,
    },
    /// A frame was pushed. `target` is the new method contour for in-model
    /// calls; `degraded` marks an entry whose own frame could not be located.
    MethodCall {
        method: MethodKey,
        caller: CallerRef,
        target: Option<ContourId>,
        receiver: Option<ValueRef>,
        in_model: bool,
        degraded: bool,
    },
    MethodEntered {
        contour: ContourId,
    },
    /// A frame was popped. `exceptional` is set when an exception unwound it.
    MethodExit {
        method: MethodKey,
        contour: Option<ContourId>,
        value: Option<ValueRef>,
        exceptional: bool,
    },
    /// Control is back in the caller, at the event's line.
    MethodReturned {
        method: MethodKey,
        contour: Option<ContourId>,
        caller: CallerRef,
        value: Option<ValueRef>,
    },
    FieldRead {
        container: ContourId,
        field: FieldKey,
        value: ValueRef,
    },
    FieldWrite {
        container: ContourId,
        field: FieldKey,
        value: ValueRef,
    },
    VariableAssign {
        context: ContourId,
        variable: VariableTarget,
        value: ValueRef,
    },
    VariableDelete {
        context: ContourId,
        variable: VariableTarget,
    },
    ExceptionThrow {
        exception: ValueRef,
        thrower: CallerRef,
        frame_popped: bool,
    },
    ExceptionCatch {
        exception: ValueRef,
        catcher: ContourId,
    },
    LockOperation {
        op: LockOp,
        lock: ValueRef,
    },
    ThreadEnd {
        name: Option<String>,
    },
    SystemExit,
}

impl EventKind {
    /// The event's kind name, as used in the trace vocabulary.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TypeLoad { .. } => "type-load",
            Self::NewObject { .. } => "new-object",
            Self::DestroyObject { .. } => "destroy-object",
            Self::MethodCall { .. } => "method-call",
            Self::MethodEntered { .. } => "method-entered",
            Self::MethodExit { .. } => "method-exit",
            Self::MethodReturned { .. } => "method-returned",
            Self::FieldRead { .. } => "field-read",
            Self::FieldWrite { .. } => "field-write",
            Self::VariableAssign { .. } => "variable-assign",
            Self::VariableDelete { .. } => "variable-delete",
            Self::ExceptionThrow { .. } => "exception-throw",
            Self::ExceptionCatch { .. } => "exception-catch",
            Self::LockOperation { .. } => "lock-operation",
            Self::ThreadEnd { .. } => "thread-end",
            Self::SystemExit => "system-exit",
        }
    }

    /// Contours referenced (not introduced) by this event.
    #[must_use]
    pub fn referenced_contours(&self) -> Vec<ContourId> {
        fn value(out: &mut Vec<ContourId>, v: &ValueRef) {
            if let Some(id) = v.as_contour() {
                out.push(id);
            }
        }
        fn caller(out: &mut Vec<ContourId>, c: &CallerRef) {
            if let Some(id) = c.contour() {
                out.push(id);
            }
        }

        let mut out = Vec::new();
        match self {
            Self::TypeLoad { super_contour, .. } => out.extend(super_contour.iter().copied()),
            Self::NewObject { type_contour, .. } => out.push(*type_contour),
            Self::DestroyObject { contour, .. } | Self::MethodEntered { contour } => out.push(*contour),
            Self::MethodCall { caller: c, receiver, .. } => {
                caller(&mut out, c);
                if let Some(r) = receiver {
                    value(&mut out, r);
                }
            }
            Self::MethodExit { contour, value: v, .. } => {
                out.extend(contour.iter().copied());
                if let Some(v) = v {
                    value(&mut out, v);
                }
            }
            Self::MethodReturned { caller: c, value: v, .. } => {
                caller(&mut out, c);
                if let Some(v) = v {
                    value(&mut out, v);
                }
            }
            Self::FieldRead { container, value: v, .. } | Self::FieldWrite { container, value: v, .. } => {
                out.push(*container);
                value(&mut out, v);
            }
            Self::VariableAssign { context, value: v, .. } => {
                out.push(*context);
                value(&mut out, v);
            }
            Self::VariableDelete { context, .. } => out.push(*context),
            Self::ExceptionThrow { exception, thrower, .. } => {
                value(&mut out, exception);
                caller(&mut out, thrower);
            }
            Self::ExceptionCatch { exception, catcher } => {
                value(&mut out, exception);
                out.push(*catcher);
            }
            Self::LockOperation { lock, .. } => value(&mut out, lock),
            Self::ThreadEnd { .. } | Self::SystemExit => {}
        }
        out
    }

    /// Contours introduced by this event.
    #[must_use]
    pub fn introduced_contour(&self) -> Option<ContourId> {
        match self {
            Self::TypeLoad { contour, .. } | Self::NewObject { contour, .. } => Some(*contour),
            Self::MethodCall { target, .. } => *target,
            _ => None,
        }
    }
}

/// One delivered trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the delivered sequence.
    pub id: EventId,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Thread the event belongs to; absent for process-wide events.
    pub thread: Option<ThreadId>,
    /// Source line the event is attributed to.
    pub line: Option<Line>,
    /// Manufactured by the engine rather than triggered by a notification.
    pub synthetic: bool,
    /// Payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TraceEvent {
    /// The event's kind name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.kind.name())?;
        if let Some(thread) = self.thread {
            write!(f, " {thread}")?;
        }
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
        }
        if self.synthetic {
            write!(f, " (synthetic)")?;
        }
        Ok(())
    }
}
