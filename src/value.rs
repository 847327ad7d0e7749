//! Resolved values carried by trace events.
//!
//! Raw values from the source are resolved once, by the event factory, into a
//! [`ValueRef`]. A resolved value either points at a contour that subscribers
//! have already seen, or carries a textual rendering.

use std::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::ids::ContourId;
use crate::source::Primitive;

/// A fully resolved value.
///
/// # Examples
///
/// ```
/// use stackmirror::{ContourId, ValueRef};
///
/// let v = ValueRef::InModel(ContourId(4));
/// assert!(v.is_in_model());
/// assert_eq!(v.as_contour(), Some(ContourId(4)));
/// assert_eq!(v.to_string(), "contour#4");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ValueRef {
    /// A primitive value.
    Primitive(Primitive),
    /// The null reference.
    Null,
    /// An object or type with a contour.
    InModel(ContourId),
    /// An out-of-model object whose value could be rendered.
    OutOfModelResolved {
        /// Rendered value, control characters escaped.
        text: String,
        /// Runtime type name.
        declared_type: String,
    },
    /// An out-of-model object rendered only by type and identity.
    OutOfModelOpaque(String),
    /// A local slot not yet assigned.
    Uninitialized,
}

impl ValueRef {
    /// Returns true for `null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for a reference to an in-model object.
    #[must_use]
    pub const fn is_in_model(&self) -> bool {
        matches!(self, Self::InModel(_))
    }

    /// Returns true for primitive values.
    #[must_use]
    pub const fn is_primitive(&self) -> bool {
        matches!(self, Self::Primitive(_))
    }

    /// The referenced object contour, if in model.
    #[must_use]
    pub const fn as_contour(&self) -> Option<ContourId> {
        match self {
            Self::InModel(id) => Some(*id),
            _ => None,
        }
    }

    /// The primitive payload, if any.
    #[must_use]
    pub const fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            Self::Primitive(p) => Some(p),
            _ => None,
        }
    }

    /// Returns a human-readable variant name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Primitive(_) => "primitive",
            Self::Null => "null",
            Self::InModel(_) => "in_model",
            Self::OutOfModelResolved { .. } => "out_of_model_resolved",
            Self::OutOfModelOpaque(_) => "out_of_model_opaque",
            Self::Uninitialized => "uninitialized",
        }
    }
}

impl Default for ValueRef {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{p}"),
            Self::Null => write!(f, "null"),
            Self::InModel(id) => write!(f, "{id}"),
            Self::OutOfModelResolved { text, declared_type } => write!(f, "{declared_type}:{text}"),
            Self::OutOfModelOpaque(text) => write!(f, "{text}"),
            Self::Uninitialized => write!(f, "<uninitialized>"),
        }
    }
}

impl From<Primitive> for ValueRef {
    fn from(v: Primitive) -> Self {
        Self::Primitive(v)
    }
}

impl From<ContourId> for ValueRef {
    fn from(v: ContourId) -> Self {
        Self::InModel(v)
    }
}

/// Who performed a call, return or throw.
///
/// Exactly one of two shapes: the immediate in-model method contour, or a
/// description of the out-of-model frame plus the nearest in-model frame
/// beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallerRef {
    /// The immediate caller is in-model.
    InModel {
        /// The caller's method contour.
        contour: ContourId,
    },
    /// The immediate caller is out-of-model (or there is none).
    OutOfModel {
        /// Description of the immediate caller.
        description: String,
        /// Nearest in-model ancestor on the mirrored stack.
        nearest_in_model: Option<ContourId>,
    },
}

impl CallerRef {
    /// The in-model contour this reference ultimately resolves to, if any.
    #[must_use]
    pub const fn contour(&self) -> Option<ContourId> {
        match self {
            Self::InModel { contour } => Some(*contour),
            Self::OutOfModel { nearest_in_model, .. } => *nearest_in_model,
        }
    }

    /// Returns true for the in-model shape.
    #[must_use]
    pub const fn is_in_model(&self) -> bool {
        matches!(self, Self::InModel { .. })
    }
}

/// Escapes control characters so rendered values stay on one line.
#[must_use]
pub fn escape_control(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:04x}}}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
