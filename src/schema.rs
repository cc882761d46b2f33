//! Schema model - named entity definitions loaded once from TOML
//!
//! A schema is resolved from `<source_dir>/<name>.toml` at configure time and
//! is immutable afterwards. It drives DDL generation, lightweight migration,
//! zero-valued inserts, and field validation of staged records.

use crate::entity::Value;
use crate::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// The storable kinds a field can take.
///
/// Each kind maps to one SQLite column type; `Reference` columns carry an
/// `ON DELETE CASCADE` foreign key to the target entity's rowid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    Bool,
    Blob,
    Uuid,
    Json,
    Reference(String),
}

impl FieldKind {
    /// Get the string representation of the field kind
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Real => "real",
            FieldKind::Bool => "bool",
            FieldKind::Blob => "blob",
            FieldKind::Uuid => "uuid",
            FieldKind::Json => "json",
            FieldKind::Reference(_) => "reference",
        }
    }

    /// SQLite column type this kind is stored as
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Text | FieldKind::Uuid | FieldKind::Json => "TEXT",
            FieldKind::Integer | FieldKind::Bool | FieldKind::Reference(_) => "INTEGER",
            FieldKind::Real => "REAL",
            FieldKind::Blob => "BLOB",
        }
    }

    /// Whether a value is storable under this kind. NULL is always
    /// accepted here; optionality is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        if matches!(value, Value::Null) {
            return true;
        }
        match self {
            FieldKind::Text => matches!(value, Value::Text(_)),
            FieldKind::Integer => matches!(value, Value::Integer(_)),
            FieldKind::Real => matches!(value, Value::Real(_) | Value::Integer(_)),
            FieldKind::Bool => matches!(value, Value::Bool(_)),
            FieldKind::Blob => matches!(value, Value::Blob(_)),
            FieldKind::Uuid => matches!(value, Value::Uuid(_)),
            FieldKind::Json => matches!(value, Value::Json(_)),
            FieldKind::Reference(_) => matches!(value, Value::Integer(_)),
        }
    }

    /// The value a freshly inserted instance carries for this kind
    pub fn zero_value(&self) -> Value {
        match self {
            FieldKind::Text => Value::Text(String::new()),
            FieldKind::Integer => Value::Integer(0),
            FieldKind::Real => Value::Real(0.0),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Blob => Value::Blob(Vec::new()),
            FieldKind::Uuid => Value::Uuid(uuid::Uuid::nil()),
            FieldKind::Json => Value::Json(serde_json::Value::Null),
            FieldKind::Reference(_) => Value::Null,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single field of an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// Optional fields accept NULL; non-optional fields always hold a value
    pub optional: bool,
    /// Indexed fields get a secondary index in the store
    pub indexed: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            indexed: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// Engine-level description of one entity: its name and fields.
///
/// The implicit `id` rowid column is not listed here; `id` is reserved and
/// cannot be declared as a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field lookup that fails with [`Error::UnknownField`]
    pub fn require_field(&self, name: &str) -> Result<&FieldDef> {
        self.field(name).ok_or_else(|| Error::UnknownField {
            entity: self.name.clone(),
            field: name.to_string(),
        })
    }

    /// Check a staged record's fields against this definition: every field
    /// must exist, hold a storable value, and be NULL only if optional
    pub fn validate_record(&self, record: &crate::entity::Record) -> Result<()> {
        for (field, value) in record.fields() {
            let field_def = self.require_field(field)?;

            let nullable =
                field_def.optional || matches!(field_def.kind, FieldKind::Reference(_));
            if matches!(value, Value::Null) && !nullable {
                return Err(Error::ValueMismatch {
                    field: field.to_string(),
                    expected: field_def.kind.as_str(),
                    actual: "null",
                });
            }

            if !field_def.kind.accepts(value) {
                return Err(Error::ValueMismatch {
                    field: field.to_string(),
                    expected: field_def.kind.as_str(),
                    actual: value.type_name(),
                });
            }
        }
        Ok(())
    }
}

/// In-memory schema description: a name plus the entity definitions it holds.
///
/// Immutable after load and owned exclusively by the stack manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
    pub entities: Vec<EntityDef>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    /// Look up an entity definition by name
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Entity lookup that fails with [`Error::UnknownEntity`].
    ///
    /// A miss here is a programmer error - the requested type is not part of
    /// the configured schema.
    pub fn require_entity(&self, name: &str) -> Result<&EntityDef> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    /// Load and validate the schema named `name` from `<source_dir>/<name>.toml`
    pub fn load(name: &str, source_dir: &Path) -> Result<Self> {
        let path = source_dir.join(format!("{name}.toml"));
        if !path.exists() {
            return Err(Error::SchemaNotFound(path));
        }

        let contents = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate a schema from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let raw: RawSchema = toml::from_str(contents)?;

        let mut entities = Vec::with_capacity(raw.entity.len());
        for raw_entity in raw.entity {
            let mut def = EntityDef::new(raw_entity.name);
            for raw_field in raw_entity.field {
                def.fields.push(raw_field.into_field_def()?);
            }
            entities.push(def);
        }

        let schema = Schema {
            name: raw.name,
            entities,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if !is_identifier(&self.name) {
            return Err(Error::SchemaInvalid(format!(
                "schema name {:?} is not a valid identifier",
                self.name
            )));
        }

        if self.entities.is_empty() {
            return Err(Error::SchemaInvalid("schema declares no entities".into()));
        }

        for entity in &self.entities {
            if !is_identifier(&entity.name) {
                return Err(Error::SchemaInvalid(format!(
                    "entity name {:?} is not a valid identifier",
                    entity.name
                )));
            }

            if self.entities.iter().filter(|e| e.name == entity.name).count() > 1 {
                return Err(Error::SchemaInvalid(format!(
                    "duplicate entity {:?}",
                    entity.name
                )));
            }

            for field in &entity.fields {
                if !is_identifier(&field.name) {
                    return Err(Error::SchemaInvalid(format!(
                        "field name {:?} on entity {:?} is not a valid identifier",
                        field.name, entity.name
                    )));
                }

                if field.name == "id" {
                    return Err(Error::SchemaInvalid(format!(
                        "entity {:?} declares reserved field \"id\"",
                        entity.name
                    )));
                }

                if entity.fields.iter().filter(|f| f.name == field.name).count() > 1 {
                    return Err(Error::SchemaInvalid(format!(
                        "duplicate field {:?} on entity {:?}",
                        field.name, entity.name
                    )));
                }

                if let FieldKind::Reference(target) = &field.kind {
                    if self.entity(target).is_none() {
                        return Err(Error::SchemaInvalid(format!(
                            "field {:?} on entity {:?} references unknown entity {:?}",
                            field.name, entity.name, target
                        )));
                    }
                    if !field.optional {
                        return Err(Error::SchemaInvalid(format!(
                            "reference field {:?} on entity {:?} must be optional",
                            field.name, entity.name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Raw serde shapes for the TOML schema file

#[derive(Debug, Deserialize)]
struct RawSchema {
    name: String,
    #[serde(default)]
    entity: Vec<RawEntity>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(default)]
    field: Vec<RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    name: String,
    kind: String,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    indexed: bool,
    /// Target entity, required when kind = "reference"
    references: Option<String>,
}

impl RawField {
    fn into_field_def(self) -> Result<FieldDef> {
        let kind = match self.kind.as_str() {
            "text" => FieldKind::Text,
            "integer" => FieldKind::Integer,
            "real" => FieldKind::Real,
            "bool" => FieldKind::Bool,
            "blob" => FieldKind::Blob,
            "uuid" => FieldKind::Uuid,
            "json" => FieldKind::Json,
            "reference" => {
                let target = self.references.ok_or_else(|| {
                    Error::SchemaInvalid(format!(
                        "reference field {:?} is missing a \"references\" target",
                        self.name
                    ))
                })?;
                FieldKind::Reference(target)
            }
            other => {
                return Err(Error::SchemaInvalid(format!(
                    "unknown field kind {:?} on field {:?}",
                    other, self.name
                )));
            }
        };

        Ok(FieldDef {
            name: self.name,
            kind,
            optional: self.optional,
            indexed: self.indexed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = r#"
name = "Model"

[[entity]]
name = "person"

[[entity.field]]
name = "name"
kind = "text"
indexed = true

[[entity.field]]
name = "test_id"
kind = "integer"

[[entity.field]]
name = "identifier"
kind = "uuid"
"#;

    #[test]
    fn test_parse_model() {
        let schema = Schema::from_toml_str(MODEL).unwrap();
        assert_eq!(schema.name, "Model");
        assert_eq!(schema.entities.len(), 1);

        let person = schema.require_entity("person").unwrap();
        assert_eq!(person.fields.len(), 3);
        assert_eq!(person.field("name").unwrap().kind, FieldKind::Text);
        assert!(person.field("name").unwrap().indexed);
        assert_eq!(person.field("test_id").unwrap().kind, FieldKind::Integer);
    }

    #[test]
    fn test_unknown_entity_fails() {
        let schema = Schema::from_toml_str(MODEL).unwrap();
        assert!(matches!(
            schema.require_entity("animal"),
            Err(Error::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_reserved_id_field_rejected() {
        let toml = r#"
name = "Model"
[[entity]]
name = "person"
[[entity.field]]
name = "id"
kind = "integer"
"#;
        assert!(matches!(
            Schema::from_toml_str(toml),
            Err(Error::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let toml = r#"
name = "Model"
[[entity]]
name = "person"
[[entity.field]]
name = "age"
kind = "decimal"
"#;
        assert!(matches!(
            Schema::from_toml_str(toml),
            Err(Error::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_reference_target_must_exist() {
        let toml = r#"
name = "Model"
[[entity]]
name = "person"
[[entity.field]]
name = "team"
kind = "reference"
references = "team"
optional = true
"#;
        assert!(matches!(
            Schema::from_toml_str(toml),
            Err(Error::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let toml = r#"
name = "Model"
[[entity]]
name = "person"
[[entity.field]]
name = "name"
kind = "text"
[[entity.field]]
name = "name"
kind = "text"
"#;
        assert!(matches!(
            Schema::from_toml_str(toml),
            Err(Error::SchemaInvalid(_))
        ));
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(FieldKind::Text.zero_value(), Value::Text(String::new()));
        assert_eq!(FieldKind::Integer.zero_value(), Value::Integer(0));
        assert_eq!(FieldKind::Bool.zero_value(), Value::Bool(false));
        assert_eq!(
            FieldKind::Uuid.zero_value(),
            Value::Uuid(uuid::Uuid::nil())
        );
        assert_eq!(FieldKind::Reference("x".into()).zero_value(), Value::Null);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Model.toml"), MODEL).unwrap();

        let schema = Schema::load("Model", dir.path()).unwrap();
        assert_eq!(schema.name, "Model");

        assert!(matches!(
            Schema::load("Missing", dir.path()),
            Err(Error::SchemaNotFound(_))
        ));
    }
}
