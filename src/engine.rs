//! The execution state: one per monitored target.
//!
//! [`ExecutionState`] owns the contour store, every thread context, the event
//! factory and the dispatcher. Notifications are handled one at a time per
//! thread; notifications for different threads may run concurrently and only
//! meet in the store's shared tables. [`ExecutionState::reset`] is exclusive
//! with every in-flight notification.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::contour::{ChangePolicy, ContourStore, VariableKey};
use crate::dispatch::{ChannelSubscriber, Dispatcher, EventSink, EventStream, Subscriber};
use crate::error::{lock_err, EngineResult, InvariantError};
use crate::event::{EventKind, VariableTarget};
use crate::factory::{raw_repr, EventFactory, Origin};
use crate::filter::ModelFilter;
use crate::ids::{ContourId, FieldKey, Line, ObjectId, ProducerId, SubscriptionId, ThreadId, TypeKey};
use crate::reconcile::{ReconcileKind, StackReconciler};
use crate::schema::{MethodSchema, SchemaProvider, StatementKind};
use crate::source::{Location, LockOp, Notification, RawFrame, RawLocal, RawObject, RawValue, StackSource, ThreadNotification};
use crate::thread::{ExceptionRef, FrameRole, MirroredFrame, PendingReturn, ThreadExecutionContext, ThreadSummary};

/// What became of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fully processed.
    Processed,
    /// Dropped because the real stack could not be read. Earlier history is
    /// untouched.
    Skipped {
        /// Why the stack query failed.
        reason: String,
    },
    /// Nothing in-model was involved.
    Filtered,
}

struct FieldNotification<'a> {
    location: &'a Location,
    field: &'a FieldKey,
    object: Option<&'a RawObject>,
    value: &'a RawValue,
    write: bool,
}

/// Reconciles notifications from one monitored target into a trace.
pub struct ExecutionState {
    config: EngineConfig,
    source: Arc<dyn StackSource>,
    store: Arc<ContourStore>,
    factory: Arc<EventFactory>,
    reconciler: StackReconciler,
    dispatcher: Arc<Dispatcher>,
    // Oldest first; bounded by `ended_thread_history`.
    ended: Mutex<VecDeque<ThreadSummary>>,
    // Shared by notification handling, exclusive for reset.
    epoch: RwLock<()>,
}

impl fmt::Debug for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionState")
            .field("config", &self.config)
            .field("producer", &self.dispatcher.producer())
            .finish_non_exhaustive()
    }
}

impl ExecutionState {
    /// Creates an execution state and starts its dispatcher.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn StackSource>,
        schema: Arc<dyn SchemaProvider>,
        filter: Arc<dyn ModelFilter>,
    ) -> EngineResult<Self> {
        let config = config.validate()?;
        let dispatcher = Arc::new(Dispatcher::new(&config.dispatcher, ProducerId::new()));
        let store = Arc::new(ContourStore::new());
        let factory = Arc::new(EventFactory::new(
            schema,
            filter,
            Arc::clone(&store),
            Arc::clone(&dispatcher) as Arc<dyn EventSink>,
            config.array_cell_ceiling,
        ));
        let reconciler = StackReconciler::new(Arc::clone(&factory), config.max_entry_search_depth);

        Ok(Self {
            config,
            source,
            store,
            factory,
            reconciler,
            dispatcher,
            ended: Mutex::new(VecDeque::new()),
            epoch: RwLock::new(()),
        })
    }

    /// Validated configuration this state was built with.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Identifier subscribers receive with every batch.
    #[must_use]
    pub fn producer_id(&self) -> ProducerId {
        self.dispatcher.producer()
    }

    /// Handles one notification from the monitoring source.
    ///
    /// Transient stack-query failures skip the notification and return
    /// `Ok(Outcome::Skipped)`. Invariant violations are returned as errors;
    /// the state should be reset before further use.
    pub fn handle(&self, notification: Notification) -> EngineResult<Outcome> {
        let _shared = self.epoch.read().map_err(|_| lock_err("engine.epoch"))?;
        trace!(kind = notification.label(), "notification");

        let result = match notification {
            Notification::Thread { thread, event } => self.handle_thread(thread, event),
            Notification::ClassPrepared { type_key } => self.handle_class_prepared(&type_key),
            Notification::ObjectDestroyed { object } => self.handle_object_destroyed(object),
            Notification::VmDeath => self.handle_vm_death(),
        };

        if let Err(err) = &result {
            if err.is_fatal() {
                error!(error = %err, "engine state desynchronized");
            }
        }
        result
    }

    fn handle_thread(&self, thread: ThreadId, event: ThreadNotification) -> EngineResult<Outcome> {
        match &event {
            ThreadNotification::Start { name } => {
                let ctx = self.store.context(thread)?;
                ctx.lock().map_err(|_| lock_err("engine.thread_context"))?.set_name(name.clone());
                return Ok(Outcome::Processed);
            }
            ThreadNotification::Death => return self.end_thread(thread, false),
            ThreadNotification::Step { location } if !self.factory.filter().accepts_step(thread, location) => {
                return Ok(Outcome::Filtered);
            }
            _ => {}
        }

        // Nothing is mutated before the real stack has been read.
        let real = match self.source.frames(thread) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(thread = %thread, kind = event.label(), error = %err, "stack query failed; notification skipped");
                return Ok(Outcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };
        if real.is_empty() {
            warn!(thread = %thread, kind = event.label(), "empty real stack; notification skipped");
            return Ok(Outcome::Skipped {
                reason: "empty real stack".to_string(),
            });
        }

        let ctx = self.store.context(thread)?;
        let mut ctx = ctx.lock().map_err(|_| lock_err("engine.thread_context"))?;

        match &event {
            ThreadNotification::Entry { location } => self.on_entry(&mut ctx, &real, location),
            ThreadNotification::Exit { location, return_value } => self.on_exit(&mut ctx, &real, location, return_value),
            ThreadNotification::FieldAccess {
                location,
                field,
                object,
                value,
            } => self.on_field(
                &mut ctx,
                &real,
                &FieldNotification {
                    location,
                    field,
                    object: object.as_ref(),
                    value,
                    write: false,
                },
            ),
            ThreadNotification::FieldWrite {
                location,
                field,
                object,
                value,
            } => self.on_field(
                &mut ctx,
                &real,
                &FieldNotification {
                    location,
                    field,
                    object: object.as_ref(),
                    value,
                    write: true,
                },
            ),
            ThreadNotification::Exception {
                location,
                exception,
                catch_location,
            } => self.on_exception(&mut ctx, &real, location, exception, catch_location.as_ref()),
            ThreadNotification::Step { location } => self.on_step(&mut ctx, &real, location),
            ThreadNotification::Monitor { op, lock } => self.on_monitor(&mut ctx, &real, *op, lock),
            ThreadNotification::Start { .. } | ThreadNotification::Death => Ok(Outcome::Processed),
        }
    }

    fn on_entry(&self, ctx: &mut ThreadExecutionContext, real: &[RawFrame], location: &Location) -> EngineResult<Outcome> {
        let reconciled = self
            .reconciler
            .reconcile(ctx, real, &ReconcileKind::Entry(location.method.clone()))?;
        let Some(raw) = real.get(reconciled.top) else {
            return Err(InvariantError::DepthMismatch {
                thread: ctx.thread(),
                mirrored: ctx.depth(),
                real: real.len(),
            }
            .into());
        };
        let caller_line = real
            .get(reconciled.top + 1)
            .and_then(|f| f.line)
            .or_else(|| ctx.top().and_then(|t| t.line));
        self.reconciler
            .push_frame(ctx, raw, caller_line, false, reconciled.degraded)?;
        ctx.advance_line(location.line.or(raw.line));
        Ok(Outcome::Processed)
    }

    fn on_exit(
        &self,
        ctx: &mut ThreadExecutionContext,
        real: &[RawFrame],
        location: &Location,
        return_value: &RawValue,
    ) -> EngineResult<Outcome> {
        self.reconciler.reconcile(ctx, real, &ReconcileKind::Exit)?;
        let thread = ctx.thread();
        let Some(top) = ctx.top() else {
            return Err(InvariantError::EmptyMirror { thread }.into());
        };
        if top.method() != &location.method {
            debug!(thread = %thread, expected = %location.method, found = %top.method(), "exit does not match mirrored top");
        }
        let (role, top_line) = (top.role, top.line);

        if role == FrameRole::Accessor {
            ctx.pop();
            return Ok(Outcome::Processed);
        }
        if ctx.in_flight().is_some() {
            self.reconciler.pop_frame(ctx, real)?;
            return Ok(Outcome::Processed);
        }

        let origin = Origin::at(thread, location.line.or(top_line));
        let value = self.factory.resolve_return(origin, return_value)?;
        let frame = self.reconciler.exit_top(ctx, origin, false, value.clone(), false)?;
        ctx.set_pending_return(PendingReturn {
            method: frame.mirror.method,
            contour: frame.contour,
            value,
        });
        Ok(Outcome::Processed)
    }

    fn on_field(
        &self,
        ctx: &mut ThreadExecutionContext,
        real: &[RawFrame],
        notification: &FieldNotification<'_>,
    ) -> EngineResult<Outcome> {
        let kind = if notification.write {
            ReconcileKind::FieldWrite
        } else {
            ReconcileKind::FieldAccess
        };
        self.reconciler.reconcile(ctx, real, &kind)?;

        // Field events inside an accessor belong to the line that called it.
        let line = match ctx.top() {
            Some(top) if top.role == FrameRole::Accessor => {
                ctx.accessor_line(top.method()).or(notification.location.line)
            }
            _ => notification.location.line,
        };
        let origin = Origin::at(ctx.thread(), line);

        let container = match notification.object {
            Some(object) => self.factory.ensure_object(origin, object)?.map(|c| c.id),
            None => self
                .factory
                .ensure_type(origin, &notification.field.owner, true)?
                .map(|t| t.id),
        };
        let Some(container) = container else {
            return Ok(Outcome::Filtered);
        };

        let field = notification.field.clone();
        let value = self.factory.resolve_value(origin, notification.value)?;
        let key = VariableKey::Field {
            container,
            field: field.clone(),
        };
        let repr = raw_repr(notification.value);

        if notification.write {
            self.factory.emit(
                origin,
                false,
                EventKind::FieldWrite {
                    container,
                    field,
                    value,
                },
            )?;
            self.store.observe_variable(key, repr, ChangePolicy::Always)?;
        } else {
            self.factory.emit(
                origin,
                false,
                EventKind::FieldRead {
                    container,
                    field: field.clone(),
                    value: value.clone(),
                },
            )?;
            let policy = if self.factory.schema().is_final_field(&field) {
                ChangePolicy::FinalOnce
            } else {
                ChangePolicy::Compare
            };
            if self.store.observe_variable(key, repr, policy)? {
                self.factory.emit(
                    origin,
                    false,
                    EventKind::VariableAssign {
                        context: container,
                        variable: VariableTarget::Field(field),
                        value,
                    },
                )?;
            }
        }

        self.track_array(ctx, origin, notification.value)?;
        Ok(Outcome::Processed)
    }

    /// Checks the cells of an in-model array seen through a field. From an
    /// in-model frame the check is immediate; from out-of-model code it is
    /// deferred to the next array-cell assignment line.
    fn track_array(&self, ctx: &ThreadExecutionContext, origin: Origin, value: &RawValue) -> EngineResult<()> {
        let Some(object) = value.as_object() else {
            return Ok(());
        };
        let Some(elements) = object.elements() else {
            return Ok(());
        };
        let Some(array) = self.factory.known_object(object.id)? else {
            return Ok(());
        };
        if elements.len() > self.factory.array_cell_ceiling() {
            return Ok(());
        }

        if ctx.top().is_some_and(MirroredFrame::is_in_model) {
            self.factory.diff_cells(origin, false, array.id, elements)?;
        } else {
            debug!(array = %array.id, "array observed from out-of-model code; deferring cell check");
            self.store.defer_cell_writes(array.id, elements.to_vec())?;
        }
        Ok(())
    }

    fn on_exception(
        &self,
        ctx: &mut ThreadExecutionContext,
        real: &[RawFrame],
        location: &Location,
        exception: &RawObject,
        catch_location: Option<&Location>,
    ) -> EngineResult<Outcome> {
        self.reconciler.reconcile(ctx, real, &ReconcileKind::Exception)?;
        let thread = ctx.thread();
        let origin = Origin::at(thread, location.line);
        let value = self.factory.resolve_object(origin, exception)?;
        let caught_here = match (catch_location, ctx.top()) {
            (Some(catch), Some(top)) => top.method() == &catch.method,
            _ => false,
        };

        self.factory.emit(
            origin,
            false,
            EventKind::ExceptionThrow {
                exception: value.clone(),
                thrower: self.factory.resolve_caller(ctx),
                frame_popped: !caught_here,
            },
        )?;

        if caught_here {
            if let Some(MirroredFrame {
                role: FrameRole::InModel,
                contour: Some(catcher),
                ..
            }) = ctx.top()
            {
                self.factory.emit(
                    Origin::at(thread, catch_location.and_then(|c| c.line)),
                    false,
                    EventKind::ExceptionCatch {
                        exception: value,
                        catcher: *catcher,
                    },
                )?;
            }
            ctx.clear_in_flight();
        } else {
            ctx.set_in_flight(ExceptionRef {
                thread,
                exception: value,
                catch_location: catch_location.cloned(),
                announced_depth: ctx.depth(),
            });
        }
        Ok(Outcome::Processed)
    }

    fn on_step(&self, ctx: &mut ThreadExecutionContext, real: &[RawFrame], location: &Location) -> EngineResult<Outcome> {
        self.reconciler.reconcile(ctx, real, &ReconcileKind::Step)?;
        let thread = ctx.thread();
        let Some(top) = ctx.top().cloned() else {
            return Err(InvariantError::EmptyMirror { thread }.into());
        };
        let previous = top.line;
        ctx.advance_line(location.line);
        if !top.is_in_model() {
            return Ok(Outcome::Processed);
        }
        let Some(contour) = top.contour else {
            return Err(InvariantError::MissingContour {
                thread,
                frame: top.mirror.to_string(),
            }
            .into());
        };

        let origin = Origin::at(thread, location.line);
        let schema = self.factory.schema().resolve_method(&top.method().owner, top.method());
        if schema.is_none() {
            debug!(method = %top.method(), "no method schema; comparing all locals");
        }

        if self.config.track_local_variables {
            // No local-variable table: no local events for this frame.
            if let Some(locals) = real.first().and_then(|f| f.locals.as_ref()) {
                self.diff_locals(origin, contour, locals, schema.as_ref(), previous)?;
            }
        }

        let on_cell_assignment = match (&schema, location.line) {
            (Some(method), Some(line)) => self
                .factory
                .schema()
                .dependence_info(method, line)
                .is_some_and(|d| d.kind == StatementKind::ArrayCellAssignment),
            _ => false,
        };
        if on_cell_assignment {
            for (array, elements) in self.store.take_pending_cell_writes()? {
                self.factory.diff_cells(origin, true, array, &elements)?;
            }
        }
        Ok(Outcome::Processed)
    }

    fn diff_locals(
        &self,
        origin: Origin,
        frame: ContourId,
        locals: &[RawLocal],
        schema: Option<&MethodSchema>,
        previous: Option<Line>,
    ) -> EngineResult<()> {
        let defined_by_previous = match (schema, previous) {
            (Some(method), Some(line)) => self.factory.schema().dependence_info(method, line),
            _ => None,
        };
        let observed: HashSet<String> = self.store.observed_locals(frame)?.into_iter().collect();
        let mut visible = HashSet::with_capacity(locals.len());

        for local in locals {
            visible.insert(local.name.as_str());
            if matches!(local.value, RawValue::Uninitialized) {
                continue;
            }
            self.check_local_array(origin, &local.value)?;

            // Only what the previous line defined can have changed.
            if let Some(info) = &defined_by_previous {
                if !info.defines(&local.name) && observed.contains(&local.name) {
                    continue;
                }
            }

            let policy = if schema.is_some_and(|m| m.is_final_local(&local.name)) {
                ChangePolicy::FinalOnce
            } else {
                ChangePolicy::Compare
            };
            let key = VariableKey::Local {
                frame,
                name: local.name.clone(),
            };
            if self.store.observe_variable(key, raw_repr(&local.value), policy)? {
                let value = self.factory.resolve_value(origin, &local.value)?;
                self.factory.emit(
                    origin,
                    false,
                    EventKind::VariableAssign {
                        context: frame,
                        variable: VariableTarget::Local(local.name.clone()),
                        value,
                    },
                )?;
            }
        }

        let mut gone: Vec<&String> = observed.iter().filter(|name| !visible.contains(name.as_str())).collect();
        gone.sort();
        for name in gone {
            self.store.forget_variable(&VariableKey::Local {
                frame,
                name: name.clone(),
            })?;
            self.factory.emit(
                origin,
                false,
                EventKind::VariableDelete {
                    context: frame,
                    variable: VariableTarget::Local(name.clone()),
                },
            )?;
        }
        Ok(())
    }

    fn check_local_array(&self, origin: Origin, value: &RawValue) -> EngineResult<()> {
        let Some(object) = value.as_object() else {
            return Ok(());
        };
        let (Some(elements), Some(array)) = (object.elements(), self.factory.known_object(object.id)?) else {
            return Ok(());
        };
        self.factory.diff_cells(origin, false, array.id, elements)?;
        Ok(())
    }

    fn on_monitor(
        &self,
        ctx: &mut ThreadExecutionContext,
        real: &[RawFrame],
        op: LockOp,
        lock: &RawObject,
    ) -> EngineResult<Outcome> {
        self.reconciler.reconcile(ctx, real, &ReconcileKind::Monitor)?;
        let origin = Origin::at(ctx.thread(), ctx.top().and_then(|t| t.line));
        let value = self.factory.resolve_object(origin, lock)?;
        ctx.apply_lock(op, lock.id);
        self.factory
            .emit(origin, false, EventKind::LockOperation { op, lock: value })?;
        Ok(Outcome::Processed)
    }

    /// Unwinds every outstanding frame of `thread`, then reports its end.
    fn end_thread(&self, thread: ThreadId, synthetic: bool) -> EngineResult<Outcome> {
        let Some(ctx) = self.store.existing_context(thread)? else {
            self.factory
                .emit(Origin::at(thread, None), synthetic, EventKind::ThreadEnd { name: None })?;
            return Ok(Outcome::Processed);
        };

        let summary = {
            let mut ctx = ctx.lock().map_err(|_| lock_err("engine.thread_context"))?;
            self.reconciler.deliver_pending_return(&mut ctx, &[])?;
            self.reconciler.drain(&mut ctx)?;
            ctx.clear_in_flight();
            self.factory.emit(
                Origin::at(thread, None),
                synthetic,
                EventKind::ThreadEnd {
                    name: ctx.name().map(str::to_string),
                },
            )?;
            ctx.mark_ended();
            ctx.summary()
        };

        self.store.remove_context(thread)?;
        let mut ended = self.ended.lock().map_err(|_| lock_err("engine.ended"))?;
        ended.push_back(summary);
        while ended.len() > self.config.ended_thread_history {
            ended.pop_front();
        }
        Ok(Outcome::Processed)
    }

    fn handle_class_prepared(&self, type_key: &TypeKey) -> EngineResult<Outcome> {
        match self.factory.ensure_type(Origin::global(), type_key, false)? {
            Some(_) => Ok(Outcome::Processed),
            None => Ok(Outcome::Filtered),
        }
    }

    fn handle_object_destroyed(&self, object: ObjectId) -> EngineResult<Outcome> {
        let Some(contour) = self.store.remove(object)? else {
            return Ok(Outcome::Filtered);
        };
        self.factory.emit(
            Origin::global(),
            false,
            EventKind::DestroyObject {
                contour: contour.id,
                object,
            },
        )?;
        Ok(Outcome::Processed)
    }

    fn handle_vm_death(&self) -> EngineResult<Outcome> {
        for thread in self.store.live_threads()? {
            self.end_thread(thread, true)?;
        }
        self.factory.emit(Origin::global(), false, EventKind::SystemExit)?;
        Ok(Outcome::Processed)
    }

    /// Discards all contours, thread contexts and undelivered events.
    ///
    /// Waits for in-flight notifications and any batch currently being
    /// delivered; afterwards the state is as freshly constructed, except that
    /// subscriptions are kept.
    pub fn reset(&self) -> EngineResult<()> {
        let _exclusive = self.epoch.write().map_err(|_| lock_err("engine.epoch"))?;
        let discarded = self.dispatcher.reset()?;
        self.store.clear()?;
        self.factory.reset_ids()?;
        self.ended.lock().map_err(|_| lock_err("engine.ended"))?.clear();
        info!(discarded, "execution state reset");
        Ok(())
    }

    /// Registers a subscriber for every event captured from now on.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> EngineResult<SubscriptionId> {
        Ok(self.dispatcher.subscribe(subscriber)?)
    }

    /// Subscribes a channel and returns its reading end.
    pub fn subscribe_stream(&self) -> EngineResult<(SubscriptionId, EventStream)> {
        let (subscriber, stream) = ChannelSubscriber::new();
        let id = self.subscribe(subscriber)?;
        Ok((id, stream))
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> EngineResult<bool> {
        Ok(self.dispatcher.unsubscribe(id)?)
    }

    /// Waits until every event captured so far has been delivered.
    pub fn flush(&self, timeout: Duration) -> EngineResult<()> {
        Ok(self.dispatcher.flush(timeout)?)
    }

    /// Snapshot of a thread's mirrored stack, bottom first. Empty for unknown
    /// threads.
    pub fn mirrored_stack(&self, thread: ThreadId) -> EngineResult<Vec<MirroredFrame>> {
        let Some(ctx) = self.store.existing_context(thread)? else {
            return Ok(Vec::new());
        };
        let ctx = ctx.lock().map_err(|_| lock_err("engine.thread_context"))?;
        Ok(ctx.stack().to_vec())
    }

    /// Summaries of every live thread and of the most recently ended ones
    /// (up to `ended_thread_history`), ordered by thread id.
    pub fn thread_summaries(&self) -> EngineResult<Vec<ThreadSummary>> {
        let mut out: Vec<ThreadSummary> = self
            .ended
            .lock()
            .map_err(|_| lock_err("engine.ended"))?
            .iter()
            .cloned()
            .collect();
        for thread in self.store.live_threads()? {
            if let Some(ctx) = self.store.existing_context(thread)? {
                out.push(ctx.lock().map_err(|_| lock_err("engine.thread_context"))?.summary());
            }
        }
        out.sort_by_key(|s| s.thread);
        Ok(out)
    }

    /// Number of live type, object and method contours.
    pub fn contour_counts(&self) -> EngineResult<(usize, usize, usize)> {
        self.store.counts()
    }
}
