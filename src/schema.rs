use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{FractalError, Result};

/// SQL affinity of a generated column backing an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
    Numeric,
    /// Stored as INTEGER with the 0/1 convention.
    Boolean,
}

impl SqlType {
    pub(crate) fn column_type(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
            Self::Numeric => "NUMERIC",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_type())
    }
}

/// Declaration of one document field the engine knows about.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    /// JSON path of the field inside the document body, `$.<name>` unless
    /// overridden. Dotted names resolve to nested paths (`a.b` -> `$.a.b`).
    pub path: String,
    pub sql_type: SqlType,
    pub indexed: bool,
    pub unique: bool,
    pub nullable: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        let path = default_path(&name);
        Self {
            name,
            path,
            sql_type,
            indexed: false,
            unique: false,
            nullable: false,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Unique implies indexed.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Name of the generated column shadowing this field. The leading
    /// underscore keeps it clear of reserved column names.
    pub(crate) fn column_name(&self) -> String {
        format!("_{}", self.name)
    }
}

pub(crate) fn default_path(name: &str) -> String {
    format!("$.{}", name)
}

/// A named index over several schema fields.
#[derive(Debug, Clone)]
pub struct CompoundIndex {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl CompoundIndex {
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

pub type Validator<T> = Arc<dyn Fn(T) -> Result<T, String> + Send + Sync>;

/// Field-level schema shared by the translator and the table builder.
/// Non-generic so those layers stay independent of the document type.
#[derive(Debug, Clone)]
pub(crate) struct SchemaFields {
    pub fields: IndexMap<String, FieldDef>,
    pub compound_indexes: Vec<CompoundIndex>,
    pub timestamps: bool,
}

impl SchemaFields {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }
}

/// Declarative schema for a collection of `T` documents.
///
/// Frozen at the point the collection is first materialised; the engine
/// never reconciles it against an existing table.
#[derive(Clone)]
pub struct Schema<T> {
    pub(crate) fields: Arc<SchemaFields>,
    pub(crate) validator: Option<Validator<T>>,
}

impl<T> fmt::Debug for Schema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

impl<T> Schema<T> {
    pub fn builder() -> SchemaBuilder<T> {
        SchemaBuilder {
            fields: Vec::new(),
            compound_indexes: Vec::new(),
            timestamps: true,
            validator: None,
        }
    }

    /// Schema with no declared fields; every filter falls back to in-JSON
    /// extraction.
    pub fn empty() -> Self {
        Self {
            fields: Arc::new(SchemaFields {
                fields: IndexMap::new(),
                compound_indexes: Vec::new(),
                timestamps: true,
            }),
            validator: None,
        }
    }
}

pub struct SchemaBuilder<T> {
    fields: Vec<FieldDef>,
    compound_indexes: Vec<CompoundIndex>,
    timestamps: bool,
    validator: Option<Validator<T>>,
}

impl<T> SchemaBuilder<T> {
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn compound_index(mut self, index: CompoundIndex) -> Self {
        self.compound_indexes.push(index);
        self
    }

    /// Disables the automatic refresh of `updated_at` on update operations.
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(T) -> Result<T, String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<Schema<T>> {
        let mut fields = IndexMap::with_capacity(self.fields.len());
        for field in self.fields {
            if fields.insert(field.name.clone(), field.clone()).is_some() {
                return Err(FractalError::Validation {
                    field: Some(field.name),
                    message: "duplicate field declaration".into(),
                });
            }
        }
        for index in &self.compound_indexes {
            if index.fields.is_empty() {
                return Err(FractalError::Validation {
                    field: None,
                    message: format!("compound index `{}` has no fields", index.name),
                });
            }
            for field_name in &index.fields {
                match fields.get(field_name) {
                    None => {
                        return Err(FractalError::Validation {
                            field: Some(field_name.clone()),
                            message: format!(
                                "compound index `{}` references an undeclared field",
                                index.name
                            ),
                        })
                    }
                    Some(f) if !f.indexed => {
                        return Err(FractalError::Validation {
                            field: Some(field_name.clone()),
                            message: format!(
                                "compound index `{}` references a field that is not indexed",
                                index.name
                            ),
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(Schema {
            fields: Arc::new(SchemaFields {
                fields,
                compound_indexes: self.compound_indexes,
                timestamps: self.timestamps,
            }),
            validator: self.validator,
        })
    }
}
