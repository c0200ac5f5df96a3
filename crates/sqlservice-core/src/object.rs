//! Shared object handles.
//!
//! A session tracks objects by instance, not by value: two handles refer to
//! the same object when they point at the same allocation. [`Obj<M>`] is the
//! typed handle callers hold; [`AnyObj`] is the type-erased handle that flows
//! through batches, identity maps and the graph serializer.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::model::Model;
use crate::relationship::{Loaded, RelationState};
use crate::row::Row;
use crate::value::Value;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::{Any, TypeId};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Storage behind an object handle.
pub struct ObjectCell<M: Model> {
    data: RwLock<M>,
}

/// A shared, interior-mutable handle to a model instance.
pub struct Obj<M: Model>(Arc<ObjectCell<M>>);

impl<M: Model> Obj<M> {
    pub fn new(model: M) -> Self {
        Self(Arc::new(ObjectCell {
            data: RwLock::new(model),
        }))
    }

    /// Borrow the instance for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, M> {
        self.0.data.read()
    }

    /// Borrow the instance for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, M> {
        self.0.data.write()
    }

    /// Clone the current state out of the handle.
    pub fn snapshot(&self) -> M {
        self.0.data.read().clone()
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity of this object, stable for its lifetime.
    pub fn object_id(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    /// Erase the model type.
    pub fn erase(&self) -> AnyObj {
        AnyObj(self.0.clone())
    }
}

impl<M: Model> Clone for Obj<M> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<M: Model + fmt::Debug> fmt::Debug for Obj<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Obj").field(&*self.read()).finish()
    }
}

impl<M: Model> From<Obj<M>> for AnyObj {
    fn from(obj: Obj<M>) -> Self {
        AnyObj(obj.0)
    }
}

/// Object-safe view of a mapped instance.
///
/// Every method takes the instance lock for the duration of the call only,
/// so callers may freely recurse through relationships.
pub trait Entity: Send + Sync + 'static {
    fn model_name(&self) -> &'static str;
    fn table_name(&self) -> &'static str;
    fn model_type(&self) -> TypeId;
    fn primary_key_columns(&self) -> &'static [&'static str];
    fn auto_increment(&self) -> bool;
    fn is_mapped(&self) -> bool;
    fn primary_key_value(&self) -> Vec<Value>;
    fn set_primary_key_value(&self, values: &[Value]) -> Result<()>;
    fn to_row(&self) -> Vec<(&'static str, Value)>;
    fn relations(&self) -> Vec<(&'static str, RelationState)>;
    fn set_relation(&self, name: &str, loaded: Loaded) -> Result<()>;

    /// Build a new object of the same type from a row.
    fn instantiate(&self, row: &Row) -> Result<AnyObj>;

    /// A new, untracked object holding a clone of this object's state.
    fn detached_copy(&self) -> AnyObj;

    /// Overwrite this object's state with another object's state.
    fn copy_from(&self, other: &dyn Entity) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<M: Model> Entity for ObjectCell<M> {
    fn model_name(&self) -> &'static str {
        M::model_name()
    }

    fn table_name(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn model_type(&self) -> TypeId {
        TypeId::of::<M>()
    }

    fn primary_key_columns(&self) -> &'static [&'static str] {
        M::PRIMARY_KEY
    }

    fn auto_increment(&self) -> bool {
        M::AUTO_INCREMENT
    }

    fn is_mapped(&self) -> bool {
        M::is_mapped()
    }

    fn primary_key_value(&self) -> Vec<Value> {
        self.data.read().primary_key_value()
    }

    fn set_primary_key_value(&self, values: &[Value]) -> Result<()> {
        self.data.write().set_primary_key_value(values)
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        self.data.read().to_row()
    }

    fn relations(&self) -> Vec<(&'static str, RelationState)> {
        self.data.read().relations()
    }

    fn set_relation(&self, name: &str, loaded: Loaded) -> Result<()> {
        self.data.read().set_relation(name, loaded)
    }

    fn instantiate(&self, row: &Row) -> Result<AnyObj> {
        instantiate::<M>(row)
    }

    fn detached_copy(&self) -> AnyObj {
        Obj::new(self.data.read().clone()).erase()
    }

    fn copy_from(&self, other: &dyn Entity) -> Result<()> {
        let Some(source) = other.as_any().downcast_ref::<ObjectCell<M>>() else {
            return Err(Error::Type(TypeError {
                expected: M::model_name(),
                actual: other.model_name().to_string(),
                column: None,
            }));
        };
        if std::ptr::eq(source, self) {
            return Ok(());
        }
        let state = source.data.read().clone();
        *self.data.write() = state;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Row constructor usable as a plain `fn` pointer in load plans.
pub fn instantiate<M: Model>(row: &Row) -> Result<AnyObj> {
    Ok(Obj::new(M::from_row(row)?).erase())
}

/// A type-erased, shared handle to a mapped instance.
#[derive(Clone)]
pub struct AnyObj(Arc<dyn Entity>);

impl AnyObj {
    /// Address-based identity; equal to [`Obj::object_id`] of the same object.
    pub fn object_id(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    pub fn ptr_eq(&self, other: &AnyObj) -> bool {
        self.object_id() == other.object_id()
    }

    /// Whether the object is an instance of `M`.
    pub fn is<M: Model>(&self) -> bool {
        self.0.model_type() == TypeId::of::<M>()
    }

    /// Recover the typed handle.
    pub fn downcast<M: Model>(&self) -> Option<Obj<M>> {
        Arc::clone(&self.0)
            .into_any()
            .downcast::<ObjectCell<M>>()
            .ok()
            .map(Obj)
    }
}

impl Deref for AnyObj {
    type Target = dyn Entity;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for AnyObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyObj")
            .field("model", &self.0.model_name())
            .field("primary_key", &self.0.primary_key_value())
            .finish()
    }
}
