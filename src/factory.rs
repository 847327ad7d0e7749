//! Value resolution and event packaging.
//!
//! The factory is the only place events are built. Before it packages a value
//! that points at a contour subscribers have not seen, it emits the
//! `type-load`/`new-object` events announcing that contour, so no delivered
//! event ever references an unannounced contour.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::contour::{ChangePolicy, ContourStore, ObjectContour, TypeContour, VariableKey};
use crate::dispatch::EventSink;
use crate::error::{lock_err, EngineResult};
use crate::event::{EventKind, TraceEvent, VariableTarget};
use crate::filter::ModelFilter;
use crate::ids::{ContourId, EventId, Line, ObjectId, ThreadId, TypeKey};
use crate::schema::SchemaProvider;
use crate::source::{ObjectShape, RawObject, RawValue};
use crate::thread::{FrameRole, ThreadExecutionContext};
use crate::value::{escape_control, CallerRef, ValueRef};

/// Thread and line an event is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Origin {
    /// Owning thread; `None` for process-wide events.
    pub thread: Option<ThreadId>,
    /// Source line.
    pub line: Option<Line>,
}

impl Origin {
    /// An event on `thread` at `line`.
    #[must_use]
    pub const fn at(thread: ThreadId, line: Option<Line>) -> Self {
        Self {
            thread: Some(thread),
            line,
        }
    }

    /// A process-wide event.
    #[must_use]
    pub const fn global() -> Self {
        Self { thread: None, line: None }
    }
}

/// Builds, stamps and publishes trace events.
pub struct EventFactory {
    schema: Arc<dyn SchemaProvider>,
    filter: Arc<dyn ModelFilter>,
    store: Arc<ContourStore>,
    sink: Arc<dyn EventSink>,
    array_cell_ceiling: usize,
    // Held across id allocation and publish so ids follow capture order.
    next_event: Mutex<u64>,
    // Held from contour creation through its announcement. A contour found
    // under this lock has already been enqueued.
    announce: Mutex<()>,
}

impl fmt::Debug for EventFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFactory")
            .field("array_cell_ceiling", &self.array_cell_ceiling)
            .finish_non_exhaustive()
    }
}

impl EventFactory {
    /// Creates a factory publishing into `sink`.
    pub fn new(
        schema: Arc<dyn SchemaProvider>,
        filter: Arc<dyn ModelFilter>,
        store: Arc<ContourStore>,
        sink: Arc<dyn EventSink>,
        array_cell_ceiling: usize,
    ) -> Self {
        Self {
            schema,
            filter,
            store,
            sink,
            array_cell_ceiling,
            next_event: Mutex::new(0),
            announce: Mutex::new(()),
        }
    }

    /// Schema lookups for loaded types.
    #[must_use]
    pub fn schema(&self) -> &dyn SchemaProvider {
        &*self.schema
    }

    /// The model filter.
    #[must_use]
    pub fn filter(&self) -> &dyn ModelFilter {
        &*self.filter
    }

    /// The contour store.
    #[must_use]
    pub fn store(&self) -> &ContourStore {
        &self.store
    }

    /// Stamps and publishes one event.
    pub fn emit(&self, origin: Origin, synthetic: bool, kind: EventKind) -> EngineResult<EventId> {
        let mut next = self.next_event.lock().map_err(|_| lock_err("factory.next_event"))?;
        *next += 1;
        let id = EventId(*next);
        if synthetic {
            debug!(event = kind.name(), thread = ?origin.thread, line = ?origin.line, "synthetic event");
        }
        self.sink.publish(TraceEvent {
            id,
            timestamp: Utc::now(),
            thread: origin.thread,
            line: origin.line,
            synthetic,
            kind,
        })?;
        Ok(id)
    }

    /// Restarts event numbering.
    pub fn reset_ids(&self) -> EngineResult<()> {
        *self.next_event.lock().map_err(|_| lock_err("factory.next_event"))? = 0;
        Ok(())
    }

    /// Returns the contour of an in-model type, announcing it and any newly
    /// registered ancestors first. Out-of-model types have no contour.
    pub fn ensure_type(&self, origin: Origin, key: &TypeKey, synthetic: bool) -> EngineResult<Option<TypeContour>> {
        if !self.filter.accepts_type(key) {
            return Ok(None);
        }
        let _announce = self.announce.lock().map_err(|_| lock_err("factory.announce"))?;
        self.announce_type(origin, key, synthetic).map(Some)
    }

    // Caller holds `announce`.
    fn announce_type(&self, origin: Origin, key: &TypeKey, synthetic: bool) -> EngineResult<TypeContour> {
        let resolution = self.store.get_or_create_type(key, &*self.schema, &*self.filter)?;
        for created in &resolution.created {
            self.emit(
                origin,
                synthetic,
                EventKind::TypeLoad {
                    contour: created.id,
                    type_key: created.key.clone(),
                    super_contour: created.super_contour,
                },
            )?;
        }
        Ok(resolution.contour)
    }

    /// Returns the contour of an in-model object, announcing it (and its type)
    /// on first sight.
    pub fn ensure_object(&self, origin: Origin, object: &RawObject) -> EngineResult<Option<ObjectContour>> {
        if !self.filter.accepts_type(&object.type_key) {
            return Ok(None);
        }
        let _announce = self.announce.lock().map_err(|_| lock_err("factory.announce"))?;
        let type_contour = self.announce_type(origin, &object.type_key, true)?;
        let (contour, created) = self.store.get_or_create_object(&type_contour, object.id)?;
        if created {
            self.emit(
                origin,
                true,
                EventKind::NewObject {
                    contour: contour.id,
                    object: object.id,
                    type_contour: type_contour.id,
                },
            )?;
            if let Some(elements) = object.elements() {
                if elements.len() <= self.array_cell_ceiling {
                    for (index, element) in elements.iter().enumerate() {
                        self.store.seed_variable(
                            VariableKey::Cell {
                                array: contour.id,
                                index,
                            },
                            raw_repr(element),
                        )?;
                    }
                }
            }
        }
        Ok(Some(contour))
    }

    /// Looks up the contour of an object without creating it. Only contours
    /// whose `new-object` event is already enqueued are returned.
    pub fn known_object(&self, object: ObjectId) -> EngineResult<Option<ObjectContour>> {
        let _announce = self.announce.lock().map_err(|_| lock_err("factory.announce"))?;
        self.store.object(object)
    }

    /// Resolves a raw value, announcing any contour it introduces.
    pub fn resolve_value(&self, origin: Origin, value: &RawValue) -> EngineResult<ValueRef> {
        Ok(match value {
            RawValue::Void | RawValue::Uninitialized => ValueRef::Uninitialized,
            RawValue::Null => ValueRef::Null,
            RawValue::Primitive(p) => ValueRef::Primitive(p.clone()),
            RawValue::Object(object) => self.resolve_object(origin, object)?,
        })
    }

    /// Resolves an object reference.
    pub fn resolve_object(&self, origin: Origin, object: &RawObject) -> EngineResult<ValueRef> {
        Ok(match self.ensure_object(origin, object)? {
            Some(contour) => ValueRef::InModel(contour.id),
            None => render_out_of_model(object),
        })
    }

    /// Resolves a method's return value; `void` has none.
    pub fn resolve_return(&self, origin: Origin, value: &RawValue) -> EngineResult<Option<ValueRef>> {
        match value {
            RawValue::Void => Ok(None),
            other => self.resolve_value(origin, other).map(Some),
        }
    }

    /// Describes the frame on top of `ctx` as a caller (or thrower).
    ///
    /// Accessor frames are transparent and skipped.
    #[must_use]
    pub fn resolve_caller(&self, ctx: &ThreadExecutionContext) -> CallerRef {
        let mut visible = ctx.stack().iter().rev().filter(|f| f.role != FrameRole::Accessor);
        match visible.next() {
            Some(frame) => match (frame.is_in_model(), frame.contour) {
                (true, Some(contour)) => CallerRef::InModel { contour },
                _ => CallerRef::OutOfModel {
                    description: frame.method().to_string(),
                    nearest_in_model: visible.find(|f| f.is_in_model()).and_then(|f| f.contour),
                },
            },
            None => CallerRef::OutOfModel {
                description: match ctx.name() {
                    Some(name) => format!("thread {name}"),
                    None => ctx.thread().to_string(),
                },
                nearest_in_model: None,
            },
        }
    }

    /// Compares every cell of an array contour against its last known state
    /// and emits a `variable-assign` per changed cell. Arrays over the cell
    /// ceiling are not tracked.
    pub fn diff_cells(
        &self,
        origin: Origin,
        synthetic: bool,
        array: ContourId,
        elements: &[RawValue],
    ) -> EngineResult<usize> {
        if elements.len() > self.array_cell_ceiling {
            return Ok(0);
        }
        let mut changed = 0;
        for (index, element) in elements.iter().enumerate() {
            let key = VariableKey::Cell { array, index };
            if self.store.observe_variable(key, raw_repr(element), ChangePolicy::Compare)? {
                let value = self.resolve_value(origin, element)?;
                self.emit(
                    origin,
                    synthetic,
                    EventKind::VariableAssign {
                        context: array,
                        variable: VariableTarget::Cell(index),
                        value,
                    },
                )?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Maximum array length tracked per cell.
    #[must_use]
    pub const fn array_cell_ceiling(&self) -> usize {
        self.array_cell_ceiling
    }
}

fn render_out_of_model(object: &RawObject) -> ValueRef {
    match &object.shape {
        ObjectShape::Text(text) | ObjectShape::Boxed(text) | ObjectShape::Enum(text) | ObjectShape::Date(text) => {
            ValueRef::OutOfModelResolved {
                text: escape_control(text),
                declared_type: object.type_key.to_string(),
            }
        }
        ObjectShape::Ordinary | ObjectShape::Array(_) => {
            ValueRef::OutOfModelOpaque(format!("{}{}", object.type_key, object.id))
        }
    }
}

/// Representation used for change detection.
///
/// Computed from the raw value so comparing never announces contours.
#[must_use]
pub fn raw_repr(value: &RawValue) -> String {
    match value {
        RawValue::Void => "void".to_string(),
        RawValue::Null => "null".to_string(),
        RawValue::Uninitialized => "<uninitialized>".to_string(),
        RawValue::Primitive(p) => p.to_string(),
        RawValue::Object(object) => match &object.shape {
            ObjectShape::Text(text) | ObjectShape::Boxed(text) | ObjectShape::Enum(text) | ObjectShape::Date(text) => {
                format!("{}:{}", object.type_key, escape_control(text))
            }
            ObjectShape::Ordinary | ObjectShape::Array(_) => format!("{}{}", object.type_key, object.id),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::filter::PatternModelFilter;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    use crate::ids::{FieldKey, MethodKey};
    use crate::mirror::StackFrameMirror;
    use crate::schema::{StaticSchema, TypeSchema};
    use crate::source::Primitive;
    use crate::thread::MirroredFrame;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TraceEvent>>);

    impl EventSink for Collect {
        fn publish(&self, event: TraceEvent) -> Result<(), DispatchError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl Collect {
        fn names(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().iter().map(TraceEvent::name).collect()
        }
    }

    fn factory(sink: Arc<Collect>) -> EventFactory {
        let schema = StaticSchema::new();
        schema.add_type(TypeSchema::new("app.Sub").extends("app.Base")).unwrap();
        schema.add_type(TypeSchema::new("app.Base")).unwrap();
        let filter = PatternModelFilter::new([r"app\..*", r"int\[\]"], Vec::<&str>::new()).unwrap();
        EventFactory::new(Arc::new(schema), Arc::new(filter), Arc::new(ContourStore::new()), sink, 4)
    }

    #[test]
    fn test_object_announced_before_reference() {
        let sink = Arc::new(Collect::default());
        let factory = factory(Arc::clone(&sink));
        let obj = RawValue::Object(RawObject::ordinary(9, "app.Sub"));

        let v = factory.resolve_value(Origin::global(), &obj).unwrap();
        assert!(v.is_in_model());
        assert_eq!(sink.names(), vec!["type-load", "type-load", "new-object"]);

        // Second resolution announces nothing.
        let again = factory.resolve_value(Origin::global(), &obj).unwrap();
        assert_eq!(v, again);
        assert_eq!(sink.names().len(), 3);

        let ids: Vec<u64> = sink.0.lock().unwrap().iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_first_sight_is_announced_before_any_reference() {
        for round in 0..200 {
            let sink = Arc::new(Collect::default());
            let factory = Arc::new(factory(Arc::clone(&sink)));
            let barrier = Arc::new(Barrier::new(2));

            let workers: Vec<_> = (1..=2)
                .map(|t| {
                    let factory = Arc::clone(&factory);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let origin = Origin::at(ThreadId(t), Some(1));
                        barrier.wait();
                        let value = factory
                            .resolve_object(origin, &RawObject::ordinary(7, "app.Sub"))
                            .unwrap();
                        let container = value.as_contour().unwrap();
                        factory
                            .emit(
                                origin,
                                false,
                                EventKind::FieldRead {
                                    container,
                                    field: FieldKey::new("app.Sub", "n"),
                                    value,
                                },
                            )
                            .unwrap();
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }

            let events = sink.0.lock().unwrap();
            assert_eq!(events.iter().filter(|e| e.name() == "new-object").count(), 1);
            let mut announced = HashSet::new();
            for event in events.iter() {
                for referenced in event.kind.referenced_contours() {
                    assert!(
                        announced.contains(&referenced),
                        "round {round}: {event} references unannounced {referenced}"
                    );
                }
                if let Some(id) = event.kind.introduced_contour() {
                    announced.insert(id);
                }
            }
        }
    }

    #[test]
    fn test_out_of_model_rendering() {
        let sink = Arc::new(Collect::default());
        let factory = factory(Arc::clone(&sink));
        let text = RawValue::Object(RawObject {
            id: ObjectId(3),
            type_key: TypeKey::new("java.lang.String"),
            shape: ObjectShape::Text("a\nb".into()),
        });
        assert_eq!(
            factory.resolve_value(Origin::global(), &text).unwrap(),
            ValueRef::OutOfModelResolved {
                text: "a\\nb".into(),
                declared_type: "java.lang.String".into(),
            }
        );
        let opaque = RawValue::Object(RawObject::ordinary(4, "java.util.HashMap"));
        assert_eq!(
            factory.resolve_value(Origin::global(), &opaque).unwrap(),
            ValueRef::OutOfModelOpaque("java.util.HashMap@4".into())
        );
        assert_eq!(factory.resolve_value(Origin::global(), &RawValue::Null).unwrap(), ValueRef::Null);
        assert_eq!(
            factory.resolve_return(Origin::global(), &RawValue::Void).unwrap(),
            None
        );
        assert!(sink.names().is_empty());
    }

    #[test]
    fn test_resolve_caller_shapes() {
        let sink = Arc::new(Collect::default());
        let factory = factory(sink);
        let thread = ThreadId(1);
        let mut ctx = ThreadExecutionContext::new(thread);
        ctx.set_name("main");
        assert_eq!(
            factory.resolve_caller(&ctx),
            CallerRef::OutOfModel {
                description: "thread main".into(),
                nearest_in_model: None,
            }
        );

        let frame = |name: &str, role, contour: Option<u64>| MirroredFrame {
            mirror: StackFrameMirror::new(thread, MethodKey::new("app.A", name), None),
            role,
            contour: contour.map(ContourId),
            line: None,
        };
        ctx.push(frame("a", FrameRole::InModel, Some(5)));
        assert_eq!(factory.resolve_caller(&ctx), CallerRef::InModel { contour: ContourId(5) });

        ctx.push(frame("b", FrameRole::OutOfModel, None));
        ctx.push(frame("access$000", FrameRole::Accessor, None));
        assert_eq!(
            factory.resolve_caller(&ctx),
            CallerRef::OutOfModel {
                description: "app.A.b".into(),
                nearest_in_model: Some(ContourId(5)),
            }
        );
    }

    #[test]
    fn test_diff_cells_reports_only_changed() {
        let sink = Arc::new(Collect::default());
        let factory = factory(Arc::clone(&sink));
        let before = RawObject {
            id: ObjectId(1),
            type_key: TypeKey::new("int[]"),
            shape: ObjectShape::Array(vec![RawValue::int(0); 3]),
        };
        let array = factory.ensure_object(Origin::global(), &before).unwrap().unwrap();

        let after = vec![RawValue::int(0), RawValue::Primitive(Primitive::Int(7)), RawValue::int(0)];
        assert_eq!(factory.diff_cells(Origin::global(), false, array.id, &after).unwrap(), 1);
        assert_eq!(factory.diff_cells(Origin::global(), false, array.id, &after).unwrap(), 0);

        let last = sink.0.lock().unwrap().last().cloned().unwrap();
        assert_eq!(
            last.kind,
            EventKind::VariableAssign {
                context: array.id,
                variable: VariableTarget::Cell(1),
                value: ValueRef::Primitive(Primitive::Int(7)),
            }
        );
    }

    #[test]
    fn test_arrays_over_ceiling_untracked() {
        let sink = Arc::new(Collect::default());
        let factory = factory(sink);
        let big = RawObject {
            id: ObjectId(2),
            type_key: TypeKey::new("int[]"),
            shape: ObjectShape::Array(vec![RawValue::int(0); 5]),
        };
        let array = factory.ensure_object(Origin::global(), &big).unwrap().unwrap();
        let changed = vec![RawValue::int(1); 5];
        assert_eq!(factory.diff_cells(Origin::global(), false, array.id, &changed).unwrap(), 0);
    }
}
