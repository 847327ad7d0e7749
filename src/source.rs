//! The monitoring source: what the engine consumes.
//!
//! The source pushes [`Notification`]s one at a time and answers on-demand
//! stack queries through [`StackSource`]. All handles it hands out are already
//! converted to value types here; the engine never holds a live handle into
//! the monitored process.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::ids::{FieldKey, Line, MethodKey, ObjectId, ThreadId, TypeKey};

/// A primitive value read from the target.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Primitive {
    Bool(bool),
    Char(char),
    Int(i64),
    Float(f64),
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Char(v) => write!(f, "'{}'", v.escape_default()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// What the source knows about an object beyond its identity.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectShape {
    /// Nothing renderable.
    Ordinary,
    /// A string; carries its contents.
    Text(String),
    /// A boxed numeric or character; carries its rendered value.
    Boxed(String),
    /// An enum constant; carries the constant name.
    Enum(String),
    /// A date/time value; carries its rendered form.
    Date(String),
    /// An array; carries the current element values.
    Array(Vec<RawValue>),
}

/// An object reference as reported by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    /// Identity in the target.
    pub id: ObjectId,
    /// Runtime type.
    pub type_key: TypeKey,
    /// Renderable content, if any.
    pub shape: ObjectShape,
}

impl RawObject {
    /// An object with no renderable content.
    #[must_use]
    pub fn ordinary(id: u64, type_key: impl Into<TypeKey>) -> Self {
        Self {
            id: ObjectId(id),
            type_key: type_key.into(),
            shape: ObjectShape::Ordinary,
        }
    }

    /// Array elements, if this object is an array.
    #[must_use]
    pub fn elements(&self) -> Option<&[RawValue]> {
        match &self.shape {
            ObjectShape::Array(elements) => Some(elements),
            _ => None,
        }
    }
}

/// A value as reported by the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Result of a `void` method.
    Void,
    /// The null reference.
    Null,
    /// A local slot that has not been assigned yet.
    Uninitialized,
    /// A primitive.
    Primitive(Primitive),
    /// An object reference.
    Object(RawObject),
}

impl RawValue {
    /// Shorthand for an integer primitive.
    #[must_use]
    pub const fn int(v: i64) -> Self {
        Self::Primitive(Primitive::Int(v))
    }

    /// The referenced object, if any.
    #[must_use]
    pub const fn as_object(&self) -> Option<&RawObject> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

/// A visible local variable of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLocal {
    /// Variable name.
    pub name: String,
    /// Current value.
    pub value: RawValue,
}

impl RawLocal {
    /// Creates a local.
    #[must_use]
    pub fn new(name: impl Into<String>, value: RawValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A real stack frame, copied out of the target while it is suspended.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Executing method.
    pub method: MethodKey,
    /// Receiver (`this`), absent for static methods.
    pub receiver: Option<RawObject>,
    /// Current line, absent when the method has no line table.
    pub line: Option<Line>,
    /// Visible locals, absent when the method has no local-variable table.
    pub locals: Option<Vec<RawLocal>>,
}

impl RawFrame {
    /// A frame with no receiver, line or locals.
    #[must_use]
    pub fn new(method: MethodKey) -> Self {
        Self {
            method,
            receiver: None,
            line: None,
            locals: None,
        }
    }

    /// Sets the current line.
    #[must_use]
    pub fn at_line(mut self, line: Line) -> Self {
        self.line = Some(line);
        self
    }

    /// Sets the receiver.
    #[must_use]
    pub fn with_receiver(mut self, receiver: RawObject) -> Self {
        self.receiver = Some(receiver);
        self
    }

    /// Sets the visible locals.
    #[must_use]
    pub fn with_locals(mut self, locals: Vec<RawLocal>) -> Self {
        self.locals = Some(locals);
        self
    }
}

/// Where a notification happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Method containing the location.
    pub method: MethodKey,
    /// Line, when known.
    pub line: Option<Line>,
}

impl Location {
    /// Creates a location.
    #[must_use]
    pub const fn new(method: MethodKey, line: Option<Line>) -> Self {
        Self { method, line }
    }
}

/// Monitor (lock) operations.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOp {
    Contended,
    Acquired,
    Wait,
    Waited,
    Released,
}

/// A notification scoped to one thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadNotification {
    /// The thread started.
    Start {
        /// Thread name.
        name: String,
    },
    /// The thread died.
    Death,
    /// A method was entered.
    Entry {
        /// Entry location (first line of the method).
        location: Location,
    },
    /// A method is about to return.
    Exit {
        /// Exit location.
        location: Location,
        /// Value being returned.
        return_value: RawValue,
    },
    /// A field was read.
    FieldAccess {
        /// Access location.
        location: Location,
        /// The field.
        field: FieldKey,
        /// Containing object; `None` for static fields.
        object: Option<RawObject>,
        /// Current value.
        value: RawValue,
    },
    /// A field is being written.
    FieldWrite {
        /// Write location.
        location: Location,
        /// The field.
        field: FieldKey,
        /// Containing object; `None` for static fields.
        object: Option<RawObject>,
        /// Value being written.
        value: RawValue,
    },
    /// An exception was thrown.
    Exception {
        /// Throw location.
        location: Location,
        /// The exception object.
        exception: RawObject,
        /// Handler location, `None` when uncaught.
        catch_location: Option<Location>,
    },
    /// A line is about to execute.
    Step {
        /// Step location.
        location: Location,
    },
    /// A lock operation.
    Monitor {
        /// The operation.
        op: LockOp,
        /// The lock object.
        lock: RawObject,
    },
}

impl ThreadNotification {
    /// Short label for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Start { .. } => "thread-start",
            Self::Death => "thread-death",
            Self::Entry { .. } => "entry",
            Self::Exit { .. } => "exit",
            Self::FieldAccess { .. } => "field-read",
            Self::FieldWrite { .. } => "field-write",
            Self::Exception { .. } => "exception-thrown",
            Self::Step { .. } => "step",
            Self::Monitor { .. } => "monitor",
        }
    }

    /// The location carried by the notification, if any.
    #[must_use]
    pub const fn location(&self) -> Option<&Location> {
        match self {
            Self::Entry { location }
            | Self::Exit { location, .. }
            | Self::FieldAccess { location, .. }
            | Self::FieldWrite { location, .. }
            | Self::Exception { location, .. }
            | Self::Step { location } => Some(location),
            Self::Start { .. } | Self::Death | Self::Monitor { .. } => None,
        }
    }
}

/// A notification pushed by the monitoring source.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Something happened on a specific thread.
    Thread {
        /// The thread.
        thread: ThreadId,
        /// What happened.
        event: ThreadNotification,
    },
    /// A type finished loading.
    ClassPrepared {
        /// The prepared type.
        type_key: TypeKey,
    },
    /// The target reclaimed an object.
    ObjectDestroyed {
        /// The reclaimed object.
        object: ObjectId,
    },
    /// The target process is exiting.
    VmDeath,
}

impl Notification {
    /// Wraps a thread-scoped notification.
    #[must_use]
    pub const fn on(thread: ThreadId, event: ThreadNotification) -> Self {
        Self::Thread { thread, event }
    }

    /// Short label for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Thread { event, .. } => event.label(),
            Self::ClassPrepared { .. } => "class-prepared",
            Self::ObjectDestroyed { .. } => "object-destroyed",
            Self::VmDeath => "vm-death",
        }
    }
}

/// On-demand access to a thread's real stack.
///
/// Frames are returned innermost first: index 0 is the executing frame.
/// Querying may fail when the thread is not suspended or a handle went stale.
pub trait StackSource: Send + Sync {
    /// Returns the real stack of `thread`.
    fn frames(&self, thread: ThreadId) -> Result<Vec<RawFrame>, SourceError>;
}
