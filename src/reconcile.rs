//! Stack reconciliation.
//!
//! The source only reports what it was asked to watch, so the mirrored stack
//! drifts from the real one whenever out-of-model code runs: frames return
//! without an exit notification, and out-of-model frames appear between
//! in-model ones without an entry. Before a notification is processed the
//! reconciler pops and pushes mirrored frames until both stacks agree below
//! the notification's own frame, emitting a synthetic event for every change.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{EngineResult, InvariantError};
use crate::event::EventKind;
use crate::factory::{EventFactory, Origin};
use crate::ids::{Line, MethodKey, ThreadId};
use crate::mirror::mirror;
use crate::source::RawFrame;
use crate::thread::{FrameRole, MirroredFrame, ThreadExecutionContext};
use crate::value::ValueRef;

/// The notification being reconciled for.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileKind {
    /// Entry into the given method.
    Entry(MethodKey),
    Exit,
    FieldAccess,
    FieldWrite,
    Exception,
    Step,
    Monitor,
}

impl ReconcileKind {
    const fn executes_code(&self) -> bool {
        matches!(
            self,
            Self::Entry(_) | Self::FieldAccess | Self::FieldWrite | Self::Step | Self::Monitor
        )
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    /// Real-stack index of the notification's own frame.
    pub top: usize,
    /// The entry frame could not be located within the search cap.
    pub degraded: bool,
}

/// Brings a thread's mirrored stack in line with its real stack.
#[derive(Debug)]
pub struct StackReconciler {
    factory: Arc<EventFactory>,
    max_entry_search_depth: usize,
}

impl StackReconciler {
    /// Creates a reconciler emitting through `factory`.
    pub fn new(factory: Arc<EventFactory>, max_entry_search_depth: usize) -> Self {
        Self {
            factory,
            max_entry_search_depth: max_entry_search_depth.max(1),
        }
    }

    /// Event factory shared with the engine.
    #[must_use]
    pub fn factory(&self) -> &EventFactory {
        &self.factory
    }

    /// Reconciles `ctx` against `real` (innermost first) for a notification
    /// of the given kind.
    ///
    /// On return the mirrored stack holds exactly the frames below the
    /// notification's own frame for an entry, and every frame for all other
    /// kinds.
    pub fn reconcile(
        &self,
        ctx: &mut ThreadExecutionContext,
        real: &[RawFrame],
        kind: &ReconcileKind,
    ) -> EngineResult<Reconciled> {
        self.deliver_pending_return(ctx, real)?;

        let (top, degraded) = match kind {
            ReconcileKind::Entry(method) => self.find_entry(real, method),
            _ => (0, false),
        };
        let own = usize::from(matches!(kind, ReconcileKind::Entry(_)));
        let target = real.len().saturating_sub(top + own);

        // Frames that returned or threw without a notification of their own.
        while ctx.depth() > target {
            self.pop_frame(ctx, real)?;
        }

        // Out-of-model frames whose real counterpart has since been replaced.
        while let Some(frame) = ctx.top() {
            if frame.is_in_model() {
                break;
            }
            let Some(counterpart) = real.get(real.len() - ctx.depth()) else {
                break;
            };
            if mirror(counterpart, ctx.thread()) == frame.mirror {
                break;
            }
            self.pop_frame(ctx, real)?;
        }

        self.settle_exception(ctx, kind)?;

        let start = real.len() - ctx.depth();
        for index in (top + own..start).rev() {
            let caller_line = caller_line(ctx, real, index);
            self.push_frame(ctx, &real[index], caller_line, true, false)?;
        }

        Ok(Reconciled { top, degraded })
    }

    fn find_entry(&self, real: &[RawFrame], method: &MethodKey) -> (usize, bool) {
        let limit = real.len().min(self.max_entry_search_depth);
        match real[..limit].iter().position(|f| &f.method == method) {
            Some(index) => (index, false),
            None => {
                warn!(
                    method = %method,
                    searched = limit,
                    real_depth = real.len(),
                    "entry frame not found within search cap; degrading to frame 0"
                );
                (0, true)
            }
        }
    }

    /// Emits the deferred `method-returned` of the frame that exited last,
    /// now that the caller's resumed line is known.
    pub fn deliver_pending_return(&self, ctx: &mut ThreadExecutionContext, real: &[RawFrame]) -> EngineResult<()> {
        let Some(pending) = ctx.take_pending_return() else {
            return Ok(());
        };
        let line = resumed_line(ctx, real);
        debug!(thread = %ctx.thread(), method = %pending.method, line = ?line, "delivering pending return");
        self.factory.emit(
            Origin::at(ctx.thread(), line),
            false,
            EventKind::MethodReturned {
                method: pending.method,
                contour: pending.contour,
                caller: self.factory.resolve_caller(ctx),
                value: pending.value,
            },
        )?;
        Ok(())
    }

    fn settle_exception(&self, ctx: &mut ThreadExecutionContext, kind: &ReconcileKind) -> EngineResult<()> {
        let Some(exception) = ctx.in_flight().cloned() else {
            return Ok(());
        };
        let reached_catch = match (&exception.catch_location, ctx.top()) {
            (Some(catch), Some(top)) => top.method() == &catch.method,
            _ => false,
        };

        if reached_catch {
            if let Some(MirroredFrame {
                role: FrameRole::InModel,
                contour: Some(catcher),
                ..
            }) = ctx.top()
            {
                let line = exception.catch_location.as_ref().and_then(|c| c.line);
                self.factory.emit(
                    Origin::at(ctx.thread(), line),
                    true,
                    EventKind::ExceptionCatch {
                        exception: exception.exception,
                        catcher: *catcher,
                    },
                )?;
            }
            ctx.clear_in_flight();
        } else if kind.executes_code() {
            debug!(thread = %ctx.thread(), "exception handled outside its reported catch frame");
            ctx.clear_in_flight();
        }
        Ok(())
    }

    /// Pops the top mirrored frame without a notification of its own.
    ///
    /// With an exception in flight the frame is reported as unwound; otherwise
    /// as a normal return into the frame below.
    pub fn pop_frame(&self, ctx: &mut ThreadExecutionContext, real: &[RawFrame]) -> EngineResult<()> {
        let thread = ctx.thread();
        let Some(frame) = ctx.top().cloned() else {
            return Err(InvariantError::EmptyMirror { thread }.into());
        };
        match frame.role {
            FrameRole::Accessor => {
                ctx.pop();
                return Ok(());
            }
            FrameRole::InModel if frame.contour.is_none() => {
                return Err(InvariantError::MissingContour {
                    thread,
                    frame: frame.mirror.to_string(),
                }
                .into());
            }
            _ => {}
        }

        let origin = Origin::at(thread, frame.line);
        if let Some(exception) = ctx.in_flight().cloned() {
            if ctx.depth() != exception.announced_depth {
                self.factory.emit(
                    origin,
                    true,
                    EventKind::ExceptionThrow {
                        exception: exception.exception,
                        thrower: self.factory.resolve_caller(ctx),
                        frame_popped: true,
                    },
                )?;
            }
            self.exit_top(ctx, origin, true, None, true)?;
        } else {
            self.exit_top(ctx, origin, true, None, false)?;
            let line = resumed_line(ctx, real);
            self.factory.emit(
                Origin::at(thread, line),
                true,
                EventKind::MethodReturned {
                    method: frame.mirror.method,
                    contour: frame.contour,
                    caller: self.factory.resolve_caller(ctx),
                    value: None,
                },
            )?;
        }
        Ok(())
    }

    /// Emits `method-exit` for the top frame, pops it and retires its
    /// contour. Returns the popped frame.
    pub fn exit_top(
        &self,
        ctx: &mut ThreadExecutionContext,
        origin: Origin,
        synthetic: bool,
        value: Option<ValueRef>,
        exceptional: bool,
    ) -> EngineResult<MirroredFrame> {
        let thread = ctx.thread();
        if let Some(top) = ctx.top() {
            if top.is_in_model() && top.contour.is_none() {
                return Err(InvariantError::MissingContour {
                    thread,
                    frame: top.mirror.to_string(),
                }
                .into());
            }
        }
        let frame = ctx.pop().ok_or(InvariantError::EmptyMirror { thread })?;
        if frame.role != FrameRole::Accessor {
            self.factory.emit(
                origin,
                synthetic,
                EventKind::MethodExit {
                    method: frame.method().clone(),
                    contour: frame.contour,
                    value,
                    exceptional,
                },
            )?;
        }
        if let Some(contour) = frame.contour {
            self.factory.store().remove_method(contour)?;
        }
        Ok(frame)
    }

    /// Pops every mirrored frame, top first.
    pub fn drain(&self, ctx: &mut ThreadExecutionContext) -> EngineResult<()> {
        while ctx.depth() > 0 {
            self.pop_frame(ctx, &[])?;
        }
        Ok(())
    }

    /// Classifies a real frame.
    #[must_use]
    pub fn classify(&self, raw: &RawFrame, thread: ThreadId) -> FrameRole {
        if !self.factory.filter().accepts_method(&raw.method, thread) {
            return FrameRole::OutOfModel;
        }
        let bridge = self
            .factory
            .schema()
            .resolve_method(&raw.method.owner, &raw.method)
            .is_some_and(|m| m.is_synthetic_bridge);
        if bridge {
            FrameRole::Accessor
        } else {
            FrameRole::InModel
        }
    }

    /// Pushes a real frame onto the mirror, emitting its call events.
    ///
    /// Accessors are pushed silently; the caller's line is recorded so field
    /// events inside them can be attributed to it.
    pub fn push_frame(
        &self,
        ctx: &mut ThreadExecutionContext,
        raw: &RawFrame,
        caller_line: Option<Line>,
        synthetic: bool,
        degraded: bool,
    ) -> EngineResult<FrameRole> {
        let thread = ctx.thread();
        let role = self.classify(raw, thread);
        let origin = Origin::at(thread, caller_line);
        let mut frame = MirroredFrame {
            mirror: mirror(raw, thread),
            role,
            contour: None,
            line: raw.line,
        };

        if role == FrameRole::Accessor {
            ctx.enter_accessor(raw.method.clone(), caller_line);
            ctx.push(frame);
            return Ok(role);
        }

        let caller = self.factory.resolve_caller(ctx);
        let receiver = raw
            .receiver
            .as_ref()
            .map(|r| self.factory.resolve_object(origin, r))
            .transpose()?;

        if role == FrameRole::InModel {
            let owner = match receiver.as_ref().and_then(ValueRef::as_contour) {
                Some(id) => Some(id),
                None => self
                    .factory
                    .ensure_type(origin, &raw.method.owner, true)?
                    .map(|t| t.id),
            };
            let (contour, _) =
                self.factory
                    .store()
                    .get_or_create_method_activation(&raw.method, thread, ctx.depth(), owner)?;
            frame.contour = Some(contour.id);
            self.factory.emit(
                origin,
                synthetic,
                EventKind::MethodCall {
                    method: raw.method.clone(),
                    caller,
                    target: Some(contour.id),
                    receiver,
                    in_model: true,
                    degraded,
                },
            )?;
            self.factory.emit(
                Origin::at(thread, raw.line),
                synthetic,
                EventKind::MethodEntered { contour: contour.id },
            )?;
        } else {
            self.factory.emit(
                origin,
                synthetic,
                EventKind::MethodCall {
                    method: raw.method.clone(),
                    caller,
                    target: None,
                    receiver,
                    in_model: false,
                    degraded,
                },
            )?;
        }

        ctx.push(frame);
        Ok(role)
    }
}

/// Line of the real frame that called `real[index]`, falling back to the
/// mirrored top.
fn caller_line(ctx: &ThreadExecutionContext, real: &[RawFrame], index: usize) -> Option<Line> {
    real.get(index + 1)
        .and_then(|f| f.line)
        .or_else(|| ctx.top().and_then(|t| t.line))
}

/// Line the mirrored top frame is executing now, read from its real
/// counterpart when the two still agree.
fn resumed_line(ctx: &ThreadExecutionContext, real: &[RawFrame]) -> Option<Line> {
    let top = ctx.top()?;
    let counterpart = real
        .len()
        .checked_sub(ctx.depth())
        .and_then(|index| real.get(index))
        .filter(|f| mirror(f, ctx.thread()) == top.mirror);
    counterpart.and_then(|f| f.line).or(top.line)
}
