//! Registry of mapped model types.
//!
//! Save and destroy accept any object whose type is mapped. When a session
//! is given a [`ModelRegistry`], it additionally requires every object's
//! type to be registered, which lets applications restrict a session to a
//! known set of entities and look models up by name.

use crate::Result;
use crate::error::{Error, ValidationErrorKind};
use crate::model::Model;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

/// Metadata recorded for one registered model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    pub type_id: TypeId,
}

#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    by_name: BTreeMap<&'static str, ModelMeta>,
    by_type: HashMap<TypeId, &'static str>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M`. Unmapped types and duplicate names are rejected.
    pub fn register<M: Model>(&mut self) -> Result<()> {
        if !M::is_mapped() {
            return Err(Error::validation(
                ValidationErrorKind::UnmappedType,
                format!("{} is not a mapped table model", M::model_name()),
            ));
        }
        let name = M::model_name();
        if self.by_name.contains_key(name) {
            return Err(Error::validation(
                ValidationErrorKind::Registration,
                format!("a model named {name} is already registered"),
            ));
        }
        let meta = ModelMeta {
            name,
            table: M::TABLE_NAME,
            primary_key: M::PRIMARY_KEY,
            type_id: TypeId::of::<M>(),
        };
        self.by_type.insert(meta.type_id, name);
        self.by_name.insert(name, meta);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<M: Model>(mut self) -> Result<Self> {
        self.register::<M>()?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&ModelMeta> {
        self.by_name.get(name)
    }

    pub fn contains<M: Model>(&self) -> bool {
        self.contains_type(TypeId::of::<M>())
    }

    pub fn contains_type(&self, type_id: TypeId) -> bool {
        self.by_type.contains_key(&type_id)
    }

    /// Registered model names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
