//! Static schema provider.
//!
//! The engine does not parse program source. It asks a [`SchemaProvider`] for
//! the static shape of types and methods and, when available, for per-line
//! dependence information. Every query may come back empty; callers degrade to
//! schema-less behavior instead of failing.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{lock_err, EngineResult};
use crate::ids::{FieldKey, Line, MethodKey, TypeKey};

/// A declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    /// Field name.
    pub name: String,
    /// Declared `final`.
    pub is_final: bool,
    /// Declared `static`.
    pub is_static: bool,
}

/// Static shape of a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    /// The type.
    pub key: TypeKey,
    /// Direct super type, if any.
    pub super_type: Option<TypeKey>,
    /// Declared fields.
    pub fields: Vec<FieldSchema>,
}

impl TypeSchema {
    /// A type with no super type and no fields.
    #[must_use]
    pub fn new(key: impl Into<TypeKey>) -> Self {
        Self {
            key: key.into(),
            super_type: None,
            fields: Vec::new(),
        }
    }

    /// Sets the super type.
    #[must_use]
    pub fn extends(mut self, super_type: impl Into<TypeKey>) -> Self {
        self.super_type = Some(super_type.into());
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, is_final: bool) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            is_final,
            is_static: false,
        });
        self
    }

    /// Looks up a declared field.
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A declared local variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSchema {
    /// Variable name.
    pub name: String,
    /// Declared (or effectively) final.
    pub is_final: bool,
}

/// Static shape of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSchema {
    /// The method.
    pub key: MethodKey,
    /// Compiler-generated bridge or accessor.
    pub is_synthetic_bridge: bool,
    /// Declared locals.
    pub locals: Vec<LocalSchema>,
}

impl MethodSchema {
    /// An ordinary method with no declared locals.
    #[must_use]
    pub const fn new(key: MethodKey) -> Self {
        Self {
            key,
            is_synthetic_bridge: false,
            locals: Vec::new(),
        }
    }

    /// Marks the method as a compiler-generated bridge.
    #[must_use]
    pub const fn synthetic_bridge(mut self) -> Self {
        self.is_synthetic_bridge = true;
        self
    }

    /// Adds a local.
    #[must_use]
    pub fn local(mut self, name: impl Into<String>, is_final: bool) -> Self {
        self.locals.push(LocalSchema {
            name: name.into(),
            is_final,
        });
        self
    }

    /// Returns true if `name` is a final local.
    #[must_use]
    pub fn is_final_local(&self, name: &str) -> bool {
        self.locals.iter().any(|l| l.name == name && l.is_final)
    }
}

/// Classification of a statement line.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Assignment,
    ArrayCellAssignment,
    Call,
    Return,
    Other,
}

/// Dependence information for one line of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependenceInfo {
    /// Statement classification.
    pub kind: StatementKind,
    /// Variables defined on the line.
    pub defined: Vec<String>,
    /// Variables used on the line.
    pub used: Vec<String>,
}

impl DependenceInfo {
    /// Returns true if the line defines `name`.
    #[must_use]
    pub fn defines(&self, name: &str) -> bool {
        self.defined.iter().any(|d| d == name)
    }
}

/// Source of static program structure.
pub trait SchemaProvider: Send + Sync {
    /// Static shape of a type.
    fn resolve_type(&self, key: &TypeKey) -> Option<TypeSchema>;

    /// Static shape of a method declared by `owner`.
    fn resolve_method(&self, owner: &TypeKey, method: &MethodKey) -> Option<MethodSchema>;

    /// Dependence information for `line` of `method`.
    fn dependence_info(&self, method: &MethodSchema, line: Line) -> Option<DependenceInfo>;

    /// Returns true if `field` is declared final.
    fn is_final_field(&self, field: &FieldKey) -> bool {
        self.resolve_type(&field.owner)
            .and_then(|t| t.find_field(&field.name).map(|f| f.is_final))
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct SchemaTables {
    types: HashMap<TypeKey, TypeSchema>,
    methods: HashMap<MethodKey, MethodSchema>,
    lines: HashMap<(MethodKey, Line), DependenceInfo>,
}

/// Thread-safe in-memory schema, populated up front by the embedder.
#[derive(Debug, Default)]
pub struct StaticSchema {
    tables: RwLock<SchemaTables>,
}

impl StaticSchema {
    /// Create a new empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type.
    pub fn add_type(&self, schema: TypeSchema) -> EngineResult<()> {
        let mut tables = self.tables.write().map_err(|_| lock_err("schema.tables"))?;
        tables.types.insert(schema.key.clone(), schema);
        Ok(())
    }

    /// Registers a method.
    pub fn add_method(&self, schema: MethodSchema) -> EngineResult<()> {
        let mut tables = self.tables.write().map_err(|_| lock_err("schema.tables"))?;
        tables.methods.insert(schema.key.clone(), schema);
        Ok(())
    }

    /// Registers dependence information for one line.
    pub fn add_line(&self, method: &MethodKey, line: Line, info: DependenceInfo) -> EngineResult<()> {
        let mut tables = self.tables.write().map_err(|_| lock_err("schema.tables"))?;
        tables.lines.insert((method.clone(), line), info);
        Ok(())
    }
}

impl SchemaProvider for StaticSchema {
    fn resolve_type(&self, key: &TypeKey) -> Option<TypeSchema> {
        self.tables.read().ok()?.types.get(key).cloned()
    }

    fn resolve_method(&self, owner: &TypeKey, method: &MethodKey) -> Option<MethodSchema> {
        if &method.owner != owner {
            return None;
        }
        self.tables.read().ok()?.methods.get(method).cloned()
    }

    fn dependence_info(&self, method: &MethodSchema, line: Line) -> Option<DependenceInfo> {
        self.tables
            .read()
            .ok()?
            .lines
            .get(&(method.key.clone(), line))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_schema_lookup() {
        let schema = StaticSchema::new();
        schema.add_type(TypeSchema::new("app.B").extends("app.A").field("size", true)).unwrap();
        let t = schema.resolve_type(&TypeKey::new("app.B")).unwrap();
        assert_eq!(t.super_type, Some(TypeKey::new("app.A")));
        assert!(schema.is_final_field(&FieldKey::new("app.B", "size")));
        assert!(!schema.is_final_field(&FieldKey::new("app.B", "missing")));
        assert!(schema.resolve_type(&TypeKey::new("app.C")).is_none());
    }

    #[test]
    fn test_registration_reports_poisoned_tables() {
        use crate::error::{EngineError, InvariantError};
        use std::sync::Arc;

        let schema = Arc::new(StaticSchema::new());
        let holder = Arc::clone(&schema);
        let _ = std::thread::spawn(move || {
            let _tables = holder.tables.write().unwrap();
            panic!("poison schema tables");
        })
        .join();

        let err = schema.add_type(TypeSchema::new("app.A")).unwrap_err();
        assert_eq!(
            err,
            EngineError::Invariant(InvariantError::Poisoned {
                context: "schema.tables"
            })
        );
        assert!(schema.add_method(MethodSchema::new(MethodKey::new("app.A", "run"))).is_err());
    }

    #[test]
    fn test_method_owner_must_match() {
        let schema = StaticSchema::new();
        let key = MethodKey::new("app.A", "run");
        schema.add_method(MethodSchema::new(key.clone()).local("i", false)).unwrap();
        assert!(schema.resolve_method(&TypeKey::new("app.A"), &key).is_some());
        assert!(schema.resolve_method(&TypeKey::new("app.B"), &key).is_none());
    }

    #[test]
    fn test_dependence_info() {
        let schema = StaticSchema::new();
        let key = MethodKey::new("app.A", "run");
        let method = MethodSchema::new(key.clone());
        schema
            .add_line(
                &key,
                12,
                DependenceInfo {
                    kind: StatementKind::ArrayCellAssignment,
                    defined: vec!["data".to_string()],
                    used: vec!["i".to_string()],
                },
            )
            .unwrap();
        let info = schema.dependence_info(&method, 12).unwrap();
        assert_eq!(info.kind, StatementKind::ArrayCellAssignment);
        assert!(info.defines("data"));
        assert!(schema.dependence_info(&method, 13).is_none());
    }
}
