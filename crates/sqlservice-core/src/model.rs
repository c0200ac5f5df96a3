//! Model trait for mapping structs to tables.
//!
//! A [`Model`] describes one mapped entity type: its table, its primary key
//! columns, how it converts to and from rows, and which relationships it
//! declares. Instances are shared through [`Obj`](crate::Obj) handles so that
//! a session's identity map and the caller observe the same object.

use crate::Result;
use crate::error::{Error, ValidationErrorKind};
use crate::relationship::{Loaded, RelationState};
use crate::row::Row;
use crate::value::Value;

/// Model-level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModelConfig {
    /// Whether this model maps to a table.
    ///
    /// Non-table models can still be converted to and from rows but are
    /// rejected by the session's save and destroy operations.
    pub table: bool,
}

impl ModelConfig {
    /// Configuration for a plain (non-table) model.
    pub const fn new() -> Self {
        Self { table: false }
    }

    /// Configuration for a table model.
    pub const fn table() -> Self {
        Self { table: true }
    }
}

/// Trait for types that can be mapped to data-store tables.
///
/// # Example
///
/// ```
/// use sqlservice_core::{Model, Result, Row, Value};
///
/// #[derive(Debug, Clone)]
/// struct Hero {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Model for Hero {
///     const TABLE_NAME: &'static str = "heroes";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     const AUTO_INCREMENT: bool = true;
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![("id", self.id.into()), ("name", self.name.clone().into())]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_named("id")?,
///             name: row.get_named("name")?,
///         })
///     }
///
///     fn primary_key_value(&self) -> Vec<Value> {
///         vec![self.id.into()]
///     }
///
///     fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
///         self.id = values.first().cloned().unwrap_or(Value::Null).try_into()?;
///         Ok(())
///     }
/// }
/// ```
pub trait Model: Clone + Send + Sync + 'static {
    /// The name of the table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Whether the store generates the first primary key column on insert.
    const AUTO_INCREMENT: bool = false;

    /// Convert this instance to `(column, value)` pairs.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a row.
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the value of the primary key column(s), in `PRIMARY_KEY` order.
    fn primary_key_value(&self) -> Vec<Value>;

    /// Overwrite the primary key column(s).
    fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()>;

    /// Check if this is a new record (some primary key column is NULL).
    fn is_new(&self) -> bool {
        self.primary_key_value().iter().any(Value::is_null)
    }

    /// Relationship attributes of this instance and their load state.
    fn relations(&self) -> Vec<(&'static str, RelationState)> {
        Vec::new()
    }

    /// Populate a relationship attribute with loaded objects.
    fn set_relation(&self, name: &str, loaded: Loaded) -> Result<()> {
        let _ = loaded;
        Err(Error::validation(
            ValidationErrorKind::UnknownRelationship,
            format!("{} has no relationship named '{}'", Self::model_name(), name),
        ))
    }

    /// Get the model configuration.
    fn model_config() -> ModelConfig {
        ModelConfig::table()
    }

    /// Short type name used in registries and log output.
    fn model_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Whether the save and destroy operations accept this type.
    fn is_mapped() -> bool {
        Self::model_config().table && !Self::PRIMARY_KEY.is_empty()
    }
}
