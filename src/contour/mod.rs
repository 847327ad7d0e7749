//! Contours: runtime instances of static schema elements.
//!
//! A type contour exists once per loaded in-model type, an object contour once
//! per in-model object identity, and a method contour once per activation.

mod store;

pub use store::{ChangePolicy, ContourStore, TypeResolution, VariableKey};

use serde::{Deserialize, Serialize};

use crate::ids::{ContourId, MethodKey, ObjectId, ThreadId, TypeKey};

/// Contour of a loaded type. Created once, never removed.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeContour {
    pub id: ContourId,
    pub key: TypeKey,
    /// Contour of the nearest in-model super type.
    pub super_contour: Option<ContourId>,
}

/// Contour of a runtime object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectContour {
    /// Contour id.
    pub id: ContourId,
    /// Identity in the monitored process.
    pub object: ObjectId,
    /// Contour of the object's dynamic type.
    pub type_contour: ContourId,
    /// The object's dynamic type.
    pub type_key: TypeKey,
}

/// Contour of one method activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodContour {
    /// Contour id.
    pub id: ContourId,
    /// The activated method.
    pub method: MethodKey,
    /// Thread the activation runs on.
    pub thread: ThreadId,
    /// Position on the mirrored stack (0 = bottom).
    pub depth: usize,
    /// Object contour of the receiver, or type contour for static methods.
    pub owner: Option<ContourId>,
}
