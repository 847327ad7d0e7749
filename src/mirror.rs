//! Stable identity for call-stack frames.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{MethodKey, ObjectId, ThreadId};
use crate::source::RawFrame;

/// A frame identity that survives the target resuming.
///
/// Equality is by value over thread, method and receiver; the transient frame
/// handle the source used to produce the frame plays no part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrameMirror {
    /// Owning thread.
    pub thread: ThreadId,
    /// Executing method.
    pub method: MethodKey,
    /// Receiver identity, absent for static methods.
    pub receiver: Option<ObjectId>,
}

impl StackFrameMirror {
    /// Creates a mirror.
    #[must_use]
    pub const fn new(thread: ThreadId, method: MethodKey, receiver: Option<ObjectId>) -> Self {
        Self {
            thread,
            method,
            receiver,
        }
    }
}

impl fmt::Display for StackFrameMirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.receiver {
            Some(r) => write!(f, "{}[{}]{}", self.method, r, self.thread),
            None => write!(f, "{}{}", self.method, self.thread),
        }
    }
}

/// Mirrors a raw frame of `thread`.
#[must_use]
pub fn mirror(raw: &RawFrame, thread: ThreadId) -> StackFrameMirror {
    StackFrameMirror::new(thread, raw.method.clone(), raw.receiver.as_ref().map(|r| r.id))
}
