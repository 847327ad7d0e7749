//! Per-thread execution bookkeeping.
//!
//! A [`ThreadExecutionContext`] is created on the first notification seen for
//! a thread and discarded on thread death or engine reset. It is only ever
//! touched by the notification currently being handled for its thread.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{ContourId, Line, MethodKey, ObjectId, ThreadId};
use crate::mirror::StackFrameMirror;
use crate::source::{Location, LockOp};
use crate::value::ValueRef;

/// How a mirrored frame participates in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameRole {
    /// Fully traced; owns a method contour.
    InModel,
    /// Traced only as an opaque call.
    OutOfModel,
    /// Compiler-generated accessor; mirrored for depth bookkeeping only.
    Accessor,
}

/// One entry of the mirrored stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredFrame {
    /// Stable frame identity.
    pub mirror: StackFrameMirror,
    /// Participation in the trace.
    pub role: FrameRole,
    /// Method contour, present exactly for in-model frames.
    pub contour: Option<ContourId>,
    /// Last line observed in this frame.
    pub line: Option<Line>,
}

impl MirroredFrame {
    /// Returns true for in-model frames.
    #[must_use]
    pub fn is_in_model(&self) -> bool {
        self.role == FrameRole::InModel
    }

    /// The executing method.
    #[must_use]
    pub const fn method(&self) -> &MethodKey {
        &self.mirror.method
    }
}

/// A frame that exited before the caller's resumed line was known.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReturn {
    /// Method that exited.
    pub method: MethodKey,
    /// Its contour, for in-model frames.
    pub contour: Option<ContourId>,
    /// Returned value.
    pub value: Option<ValueRef>,
}

/// Return bookkeeping, transitioned only by the next notification on the
/// thread.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReturnState {
    /// Nothing outstanding.
    #[default]
    Idle,
    /// A frame exited; its `method-returned` goes out with the next
    /// notification.
    AwaitingReturnDelivery(PendingReturn),
}

/// The exception currently propagating on a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRef {
    /// Owning thread.
    pub thread: ThreadId,
    /// The exception value.
    pub exception: ValueRef,
    /// Where it will be caught, `None` when uncaught.
    pub catch_location: Option<Location>,
    /// Mirrored depth of the frame the latest throw event was attributed to.
    pub announced_depth: usize,
}

/// Coarse thread state derived from lock operations.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Blocked,
    Waiting,
    Ended,
}

/// Inspection snapshot of one thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The thread.
    pub thread: ThreadId,
    /// Name reported at thread start.
    pub name: Option<String>,
    /// Current status.
    pub status: ThreadStatus,
    /// Mirrored stack depth.
    pub depth: usize,
    /// Number of in-model frames on the mirrored stack.
    pub in_model_depth: usize,
    /// Locks currently held, in acquisition order.
    pub locks_held: Vec<ObjectId>,
    /// Lock being waited for.
    pub waiting_on: Option<ObjectId>,
}

/// Mutable state for one monitored thread.
#[derive(Debug)]
pub struct ThreadExecutionContext {
    thread: ThreadId,
    name: Option<String>,
    stack: Vec<MirroredFrame>,
    in_model_substack: Vec<usize>,
    current_line: Option<Line>,
    return_state: ReturnState,
    in_flight: Option<ExceptionRef>,
    accessor_lines: HashMap<MethodKey, Option<Line>>,
    status: ThreadStatus,
    locks_held: Vec<ObjectId>,
    waiting_on: Option<ObjectId>,
}

impl ThreadExecutionContext {
    /// Fresh context with an empty mirrored stack.
    #[must_use]
    pub fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            name: None,
            stack: Vec::new(),
            in_model_substack: Vec::new(),
            current_line: None,
            return_state: ReturnState::Idle,
            in_flight: None,
            accessor_lines: HashMap::new(),
            status: ThreadStatus::Running,
            locks_held: Vec::new(),
            waiting_on: None,
        }
    }

    /// The thread this context mirrors.
    #[must_use]
    pub const fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Display name, once the source has reported one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sets the display name.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// The mirrored stack, bottom to top.
    #[must_use]
    pub fn stack(&self) -> &[MirroredFrame] {
        &self.stack
    }

    /// Indices into [`stack`](Self::stack) of the in-model frames.
    #[must_use]
    pub fn in_model_substack(&self) -> &[usize] {
        &self.in_model_substack
    }

    /// Number of mirrored frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The innermost mirrored frame.
    #[must_use]
    pub fn top(&self) -> Option<&MirroredFrame> {
        self.stack.last()
    }

    /// Pushes a frame, indexing it in the in-model substack when relevant.
    pub fn push(&mut self, frame: MirroredFrame) {
        if frame.is_in_model() {
            self.in_model_substack.push(self.stack.len());
        }
        self.stack.push(frame);
    }

    /// Pops the innermost frame and forgets any accessor line it held.
    pub fn pop(&mut self) -> Option<MirroredFrame> {
        let frame = self.stack.pop()?;
        if self.in_model_substack.last() == Some(&self.stack.len()) {
            self.in_model_substack.pop();
        }
        if frame.role == FrameRole::Accessor {
            self.accessor_lines.remove(frame.method());
        }
        Some(frame)
    }

    /// Line last reported for this thread.
    #[must_use]
    pub const fn current_line(&self) -> Option<Line> {
        self.current_line
    }

    /// Records the line now executing and returns the previous one.
    pub fn advance_line(&mut self, line: Option<Line>) -> Option<Line> {
        let previous = self.current_line;
        if line.is_some() {
            self.current_line = line;
            if let Some(top) = self.stack.last_mut() {
                top.line = line;
            }
        }
        previous
    }

    /// Whether an exited frame is parked awaiting delivery.
    #[must_use]
    pub const fn return_state(&self) -> &ReturnState {
        &self.return_state
    }

    /// Parks an exited frame until the next notification on this thread.
    pub fn set_pending_return(&mut self, pending: PendingReturn) {
        self.return_state = ReturnState::AwaitingReturnDelivery(pending);
    }

    /// Takes the parked frame, leaving the state idle.
    pub fn take_pending_return(&mut self) -> Option<PendingReturn> {
        match std::mem::take(&mut self.return_state) {
            ReturnState::Idle => None,
            ReturnState::AwaitingReturnDelivery(pending) => Some(pending),
        }
    }

    /// The exception currently unwinding this thread.
    #[must_use]
    pub const fn in_flight(&self) -> Option<&ExceptionRef> {
        self.in_flight.as_ref()
    }

    /// Replaces the in-flight exception; at most one exists per thread.
    pub fn set_in_flight(&mut self, exception: ExceptionRef) {
        self.in_flight = Some(exception);
    }

    /// Clears and returns the in-flight exception.
    pub fn clear_in_flight(&mut self) -> Option<ExceptionRef> {
        self.in_flight.take()
    }

    /// Remembers the caller's line on entering a synthetic accessor.
    pub fn enter_accessor(&mut self, accessor: MethodKey, line: Option<Line>) {
        self.accessor_lines.insert(accessor, line);
    }

    /// The line field events inside `accessor` are attributed to.
    #[must_use]
    pub fn accessor_line(&self, accessor: &MethodKey) -> Option<Line> {
        self.accessor_lines.get(accessor).copied().flatten()
    }

    /// Applies a lock operation to the summary.
    pub fn apply_lock(&mut self, op: LockOp, lock: ObjectId) {
        match op {
            LockOp::Contended => {
                self.status = ThreadStatus::Blocked;
                self.waiting_on = Some(lock);
            }
            LockOp::Acquired => {
                self.status = ThreadStatus::Running;
                self.waiting_on = None;
                self.locks_held.push(lock);
            }
            LockOp::Wait => {
                self.status = ThreadStatus::Waiting;
                self.waiting_on = Some(lock);
                self.release(lock);
            }
            LockOp::Waited => {
                self.status = ThreadStatus::Running;
                self.waiting_on = None;
                self.locks_held.push(lock);
            }
            LockOp::Released => self.release(lock),
        }
    }

    fn release(&mut self, lock: ObjectId) {
        if let Some(pos) = self.locks_held.iter().rposition(|held| *held == lock) {
            self.locks_held.remove(pos);
        }
    }

    /// Marks the thread dead and drops its lock bookkeeping.
    pub fn mark_ended(&mut self) {
        self.status = ThreadStatus::Ended;
        self.locks_held.clear();
        self.waiting_on = None;
    }

    /// Snapshot for observers.
    #[must_use]
    pub fn summary(&self) -> ThreadSummary {
        ThreadSummary {
            thread: self.thread,
            name: self.name.clone(),
            status: self.status,
            depth: self.stack.len(),
            in_model_depth: self.in_model_substack.len(),
            locks_held: self.locks_held.clone(),
            waiting_on: self.waiting_on,
        }
    }
}
