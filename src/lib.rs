//! # stackmirror - execution-state reconciliation for partial call-stack traces
//!
//! A monitoring source (a debugger connection, an instrumentation agent) only
//! reports what it was asked to watch: entries and exits of some methods, some
//! field accesses, line steps. Code it was not asked to watch still runs and
//! still moves the call stack. stackmirror keeps a mirrored call stack per
//! thread, reconciles it against the real stack on every notification, and
//! emits one ordered, properly nested trace in which every call has an exit
//! and every referenced object has been announced.
//!
//! ## Core Concepts
//!
//! - **Contour**: a runtime instance of a static element (loaded type, object,
//!   method activation)
//! - **In-model / out-of-model**: whether the [`ModelFilter`] selects code for
//!   full tracing
//! - **Mirrored stack**: the engine's reconstruction of a thread's stack
//! - **Synthetic event**: an event the engine manufactures to fill a gap in the
//!   observed stream
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stackmirror::{EngineConfig, ExecutionState, PatternModelFilter, StaticSchema};
//!
//! let filter = PatternModelFilter::new([r"app\..*"], Vec::<&str>::new())?;
//! let state = ExecutionState::new(
//!     EngineConfig::default(),
//!     Arc::new(my_source),
//!     Arc::new(StaticSchema::new()),
//!     Arc::new(filter),
//! )?;
//! let (_id, events) = state.subscribe_stream()?;
//!
//! for notification in my_source.notifications() {
//!     state.handle(notification)?;
//! }
//! state.flush(Duration::from_secs(1))?;
//! for event in events.drain() {
//!     println!("{event}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Identity, errors, configuration
pub mod config;
pub mod error;
pub mod ids;

// Collaborators
pub mod filter;
pub mod schema;
pub mod source;

// Mirrored state
pub mod contour;
pub mod mirror;
pub mod thread;

// Trace production
pub mod dispatch;
pub mod engine;
pub mod event;
pub mod factory;
pub mod reconcile;
pub mod value;

// Re-export primary types at crate root for convenience
pub use config::{DispatcherConfig, EngineConfig};
pub use contour::{ContourStore, MethodContour, ObjectContour, TypeContour};
pub use dispatch::{ChannelSubscriber, Dispatcher, EventSink, EventStream, Subscriber};
pub use engine::{ExecutionState, Outcome};
pub use error::{ConfigError, DispatchError, EngineError, EngineResult, InvariantError, SourceError};
pub use event::{EventKind, TraceEvent, VariableTarget};
pub use factory::{EventFactory, Origin};
pub use filter::{AcceptAll, ModelFilter, PatternModelFilter};
pub use ids::{ContourId, EventId, FieldKey, Line, MethodKey, ObjectId, ProducerId, SubscriptionId, ThreadId, TypeKey};
pub use mirror::{mirror, StackFrameMirror};
pub use reconcile::{ReconcileKind, Reconciled, StackReconciler};
pub use schema::{DependenceInfo, FieldSchema, LocalSchema, MethodSchema, SchemaProvider, StatementKind, StaticSchema, TypeSchema};
pub use source::{
    Location, LockOp, Notification, ObjectShape, Primitive, RawFrame, RawLocal, RawObject, RawValue, StackSource,
    ThreadNotification,
};
pub use thread::{FrameRole, MirroredFrame, ReturnState, ThreadExecutionContext, ThreadStatus, ThreadSummary};
pub use value::{CallerRef, ValueRef};
