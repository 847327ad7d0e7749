//! Concurrent contour registries and per-thread bookkeeping.
//!
//! Tables are read-heavy and written occasionally, so each sits behind its own
//! `RwLock`. Notifications for different threads may interleave at the point a
//! real-stack query blocks; everything here is safe under that interleaving.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

use super::{MethodContour, ObjectContour, TypeContour};
use crate::error::{lock_err, EngineResult};
use crate::filter::ModelFilter;
use crate::ids::{ContourId, FieldKey, MethodKey, ObjectId, ThreadId, TypeKey};
use crate::schema::SchemaProvider;
use crate::source::RawValue;
use crate::thread::ThreadExecutionContext;

// Guards against cyclic super-type data from the schema provider.
const MAX_SUPER_HOPS: usize = 128;

/// Identity of an observed variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableKey {
    /// A field of an object or type contour.
    Field {
        container: ContourId,
        field: FieldKey,
    },
    /// A local of a method contour.
    Local {
        frame: ContourId,
        name: String,
    },
    /// A cell of an array contour.
    Cell {
        array: ContourId,
        index: usize,
    },
}

impl VariableKey {
    /// The contour owning the variable.
    #[must_use]
    pub const fn contour(&self) -> ContourId {
        match self {
            Self::Field { container, .. } => *container,
            Self::Local { frame, .. } => *frame,
            Self::Cell { array, .. } => *array,
        }
    }
}

/// How [`ContourStore::observe_variable`] decides whether a value changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePolicy {
    /// Report every observation as a change (field writes).
    Always,
    /// Report only the first observation (final variables).
    FinalOnce,
    /// Report when the representation differs from the cached one.
    Compare,
}

/// Result of [`ContourStore::get_or_create_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeResolution {
    /// The requested type's contour.
    pub contour: TypeContour,
    /// Contours created by this call, super types first.
    pub created: Vec<TypeContour>,
}

#[derive(Debug, Default)]
struct MethodTable {
    by_id: HashMap<ContourId, MethodContour>,
    by_activation: HashMap<(ThreadId, usize, MethodKey), ContourId>,
}

/// Registries owned by one execution state.
#[derive(Debug, Default)]
pub struct ContourStore {
    next_id: AtomicU64,
    types: RwLock<HashMap<TypeKey, TypeContour>>,
    objects: RwLock<HashMap<ObjectId, ObjectContour>>,
    methods: RwLock<MethodTable>,
    // Keyed by owning contour so a contour's variables drop in one step.
    observations: RwLock<HashMap<ContourId, HashMap<VariableKey, String>>>,
    pending_cells: Mutex<BTreeMap<ContourId, Vec<RawValue>>>,
    threads: RwLock<HashMap<ThreadId, Arc<Mutex<ThreadExecutionContext>>>>,
}

impl ContourStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&self) -> ContourId {
        ContourId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Returns the contour of `key`, creating it and every unregistered
    /// in-model ancestor first.
    ///
    /// The walk ends at an ancestor that is already registered or out of
    /// model. An ancestor the schema does not know is registered without a
    /// super type of its own.
    pub fn get_or_create_type(
        &self,
        key: &TypeKey,
        schema: &dyn SchemaProvider,
        filter: &dyn ModelFilter,
    ) -> EngineResult<TypeResolution> {
        {
            let types = self.types.read().map_err(|_| lock_err("contours.types"))?;
            if let Some(existing) = types.get(key) {
                return Ok(TypeResolution {
                    contour: existing.clone(),
                    created: Vec::new(),
                });
            }
        }

        let mut types = self.types.write().map_err(|_| lock_err("contours.types"))?;
        // Another thread may have registered it while we waited.
        if let Some(existing) = types.get(key) {
            return Ok(TypeResolution {
                contour: existing.clone(),
                created: Vec::new(),
            });
        }

        let mut ancestors = Vec::new();
        let mut parent = None;
        let mut cursor = schema.resolve_type(key).and_then(|t| t.super_type);
        while let Some(sup) = cursor.take() {
            if let Some(registered) = types.get(&sup) {
                parent = Some(registered.id);
                break;
            }
            if !filter.accepts_type(&sup) {
                break;
            }
            if ancestors.len() >= MAX_SUPER_HOPS {
                warn!(type_key = %key, "super-type chain exceeded hop limit; truncating");
                break;
            }
            cursor = schema.resolve_type(&sup).and_then(|t| t.super_type);
            ancestors.push(sup);
        }

        let mut created = Vec::with_capacity(ancestors.len() + 1);
        for type_key in ancestors.into_iter().rev() {
            let contour = TypeContour {
                id: self.allocate(),
                key: type_key.clone(),
                super_contour: parent,
            };
            parent = Some(contour.id);
            types.insert(type_key, contour.clone());
            created.push(contour);
        }
        let contour = TypeContour {
            id: self.allocate(),
            key: key.clone(),
            super_contour: parent,
        };
        types.insert(key.clone(), contour.clone());
        created.push(contour.clone());

        Ok(TypeResolution { contour, created })
    }

    /// Returns the contour for object `id`, creating it if needed. The flag is
    /// true when this call created it.
    pub fn get_or_create_object(&self, type_contour: &TypeContour, id: ObjectId) -> EngineResult<(ObjectContour, bool)> {
        {
            let objects = self.objects.read().map_err(|_| lock_err("contours.objects"))?;
            if let Some(existing) = objects.get(&id) {
                return Ok((existing.clone(), false));
            }
        }

        let mut objects = self.objects.write().map_err(|_| lock_err("contours.objects"))?;
        if let Some(existing) = objects.get(&id) {
            return Ok((existing.clone(), false));
        }
        let contour = ObjectContour {
            id: self.allocate(),
            object: id,
            type_contour: type_contour.id,
            type_key: type_contour.key.clone(),
        };
        objects.insert(id, contour.clone());
        Ok((contour, true))
    }

    /// Looks up a registered object.
    pub fn object(&self, id: ObjectId) -> EngineResult<Option<ObjectContour>> {
        let objects = self.objects.read().map_err(|_| lock_err("contours.objects"))?;
        Ok(objects.get(&id).cloned())
    }

    /// Removes an object contour. Unknown identities are a no-op.
    pub fn remove(&self, id: ObjectId) -> EngineResult<Option<ObjectContour>> {
        let removed = {
            let mut objects = self.objects.write().map_err(|_| lock_err("contours.objects"))?;
            objects.remove(&id)
        };
        if let Some(contour) = &removed {
            self.forget_contour(contour.id)?;
        }
        Ok(removed)
    }

    /// Returns the activation of `method` at `depth` on `thread`, creating it
    /// if needed.
    pub fn get_or_create_method_activation(
        &self,
        method: &MethodKey,
        thread: ThreadId,
        depth: usize,
        owner: Option<ContourId>,
    ) -> EngineResult<(MethodContour, bool)> {
        let mut table = self.methods.write().map_err(|_| lock_err("contours.methods"))?;
        let activation = (thread, depth, method.clone());
        if let Some(existing) = table.by_activation.get(&activation).and_then(|id| table.by_id.get(id)) {
            return Ok((existing.clone(), false));
        }
        let contour = MethodContour {
            id: self.allocate(),
            method: method.clone(),
            thread,
            depth,
            owner,
        };
        table.by_activation.insert(activation, contour.id);
        table.by_id.insert(contour.id, contour.clone());
        Ok((contour, true))
    }

    /// Removes an activation on exit, together with its locals.
    pub fn remove_method(&self, id: ContourId) -> EngineResult<Option<MethodContour>> {
        let removed = {
            let mut table = self.methods.write().map_err(|_| lock_err("contours.methods"))?;
            let removed = table.by_id.remove(&id);
            if let Some(m) = &removed {
                table.by_activation.remove(&(m.thread, m.depth, m.method.clone()));
            }
            removed
        };
        if removed.is_some() {
            self.forget_contour(id)?;
        }
        Ok(removed)
    }

    /// Records `repr` for `key` and reports whether it counts as a change.
    pub fn observe_variable(&self, key: VariableKey, repr: String, policy: ChangePolicy) -> EngineResult<bool> {
        let mut observations = self.observations.write().map_err(|_| lock_err("contours.observations"))?;
        let owned = observations.entry(key.contour()).or_default();
        let changed = match (policy, owned.get(&key)) {
            (ChangePolicy::Always, _) | (_, None) => true,
            (ChangePolicy::FinalOnce, Some(_)) => false,
            (ChangePolicy::Compare, Some(previous)) => *previous != repr,
        };
        if changed {
            owned.insert(key, repr);
        }
        Ok(changed)
    }

    /// Records `repr` without reporting a change.
    pub fn seed_variable(&self, key: VariableKey, repr: String) -> EngineResult<()> {
        let mut observations = self.observations.write().map_err(|_| lock_err("contours.observations"))?;
        observations.entry(key.contour()).or_default().insert(key, repr);
        Ok(())
    }

    /// Drops the cached value of `key`. Returns true if one existed.
    pub fn forget_variable(&self, key: &VariableKey) -> EngineResult<bool> {
        let mut observations = self.observations.write().map_err(|_| lock_err("contours.observations"))?;
        let Some(owned) = observations.get_mut(&key.contour()) else {
            return Ok(false);
        };
        let existed = owned.remove(key).is_some();
        if owned.is_empty() {
            observations.remove(&key.contour());
        }
        Ok(existed)
    }

    /// Names of the locals observed so far in method contour `frame`.
    pub fn observed_locals(&self, frame: ContourId) -> EngineResult<Vec<String>> {
        let observations = self.observations.read().map_err(|_| lock_err("contours.observations"))?;
        let Some(owned) = observations.get(&frame) else {
            return Ok(Vec::new());
        };
        let mut names: Vec<String> = owned
            .keys()
            .filter_map(|k| match k {
                VariableKey::Local { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn forget_contour(&self, id: ContourId) -> EngineResult<()> {
        {
            let mut observations = self.observations.write().map_err(|_| lock_err("contours.observations"))?;
            observations.remove(&id);
        }
        let mut pending = self.pending_cells.lock().map_err(|_| lock_err("contours.pending_cells"))?;
        pending.remove(&id);
        Ok(())
    }

    /// Parks an indirectly observed array state until the next array-cell
    /// assignment step. A later state for the same array replaces an earlier
    /// one.
    pub fn defer_cell_writes(&self, array: ContourId, elements: Vec<RawValue>) -> EngineResult<()> {
        let mut pending = self.pending_cells.lock().map_err(|_| lock_err("contours.pending_cells"))?;
        pending.insert(array, elements);
        Ok(())
    }

    /// Takes every parked array state, ordered by contour id.
    pub fn take_pending_cell_writes(&self) -> EngineResult<Vec<(ContourId, Vec<RawValue>)>> {
        let mut pending = self.pending_cells.lock().map_err(|_| lock_err("contours.pending_cells"))?;
        Ok(std::mem::take(&mut *pending).into_iter().collect())
    }

    /// Returns the context of `thread`, creating it on first use.
    pub fn context(&self, thread: ThreadId) -> EngineResult<Arc<Mutex<ThreadExecutionContext>>> {
        {
            let threads = self.threads.read().map_err(|_| lock_err("contours.threads"))?;
            if let Some(ctx) = threads.get(&thread) {
                return Ok(Arc::clone(ctx));
            }
        }
        let mut threads = self.threads.write().map_err(|_| lock_err("contours.threads"))?;
        Ok(Arc::clone(
            threads
                .entry(thread)
                .or_insert_with(|| Arc::new(Mutex::new(ThreadExecutionContext::new(thread)))),
        ))
    }

    /// Returns the context of `thread` if one exists.
    pub fn existing_context(&self, thread: ThreadId) -> EngineResult<Option<Arc<Mutex<ThreadExecutionContext>>>> {
        let threads = self.threads.read().map_err(|_| lock_err("contours.threads"))?;
        Ok(threads.get(&thread).cloned())
    }

    /// Discards the context of `thread`.
    pub fn remove_context(&self, thread: ThreadId) -> EngineResult<()> {
        let mut threads = self.threads.write().map_err(|_| lock_err("contours.threads"))?;
        threads.remove(&thread);
        Ok(())
    }

    /// Threads with a live context, in id order.
    pub fn live_threads(&self) -> EngineResult<Vec<ThreadId>> {
        let threads = self.threads.read().map_err(|_| lock_err("contours.threads"))?;
        let mut ids: Vec<ThreadId> = threads.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    /// Number of registered type, object and method contours.
    pub fn counts(&self) -> EngineResult<(usize, usize, usize)> {
        let types = self.types.read().map_err(|_| lock_err("contours.types"))?.len();
        let objects = self.objects.read().map_err(|_| lock_err("contours.objects"))?.len();
        let methods = self.methods.read().map_err(|_| lock_err("contours.methods"))?.by_id.len();
        Ok((types, objects, methods))
    }

    /// Drops every contour, observation and thread context.
    pub fn clear(&self) -> EngineResult<()> {
        self.types.write().map_err(|_| lock_err("contours.types"))?.clear();
        self.objects.write().map_err(|_| lock_err("contours.objects"))?.clear();
        *self.methods.write().map_err(|_| lock_err("contours.methods"))? = MethodTable::default();
        self.observations
            .write()
            .map_err(|_| lock_err("contours.observations"))?
            .clear();
        self.pending_cells
            .lock()
            .map_err(|_| lock_err("contours.pending_cells"))?
            .clear();
        self.threads.write().map_err(|_| lock_err("contours.threads"))?.clear();
        self.next_id.store(0, Ordering::Relaxed);
        Ok(())
    }
}
