//! Relationship attributes.
//!
//! A model exposes its relationships through [`Model::relations`] as a list of
//! `(name, RelationState)` pairs. Loaded relationships hand out shared object
//! handles, so a graph of related objects may contain cycles; consumers such
//! as the graph serializer detect revisits by [`AnyObj::object_id`].

use crate::Result;
use crate::error::{Error, TypeError};
use crate::model::Model;
use crate::object::{AnyObj, Obj, instantiate};
use crate::row::Row;
use crate::statement::Filter;
use crate::value::Value;
use std::fmt;
use std::sync::OnceLock;

/// How to fetch an unloaded relationship.
#[derive(Clone)]
pub struct LoadPlan {
    /// Table holding the related rows
    pub table: &'static str,
    /// Predicate selecting the related rows
    pub filter: Filter,
    /// Whether the relationship holds a collection
    pub many: bool,
    /// Builds a related object from one of the fetched rows
    pub instantiate: fn(&Row) -> Result<AnyObj>,
}

impl fmt::Debug for LoadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPlan")
            .field("table", &self.table)
            .field("filter", &self.filter)
            .field("many", &self.many)
            .finish_non_exhaustive()
    }
}

/// Load state of one relationship attribute.
#[derive(Debug, Clone)]
pub enum RelationState {
    /// Not fetched yet
    Unloaded(LoadPlan),
    /// A single related object, or none
    One(Option<AnyObj>),
    /// A collection of related objects
    Many(Vec<AnyObj>),
}

impl RelationState {
    pub fn is_loaded(&self) -> bool {
        !matches!(self, RelationState::Unloaded(_))
    }

    /// The loaded value, if any.
    pub fn loaded(&self) -> Option<Loaded> {
        match self {
            RelationState::Unloaded(_) => None,
            RelationState::One(obj) => Some(Loaded::One(obj.clone())),
            RelationState::Many(objs) => Some(Loaded::Many(objs.clone())),
        }
    }
}

/// Objects fetched for a relationship, handed to [`Model::set_relation`].
#[derive(Debug, Clone)]
pub enum Loaded {
    One(Option<AnyObj>),
    Many(Vec<AnyObj>),
}

impl Loaded {
    /// Every object in the loaded value.
    pub fn objects(&self) -> Vec<AnyObj> {
        match self {
            Loaded::One(obj) => obj.iter().cloned().collect(),
            Loaded::Many(objs) => objs.clone(),
        }
    }
}

fn downcast_all<T: Model>(objs: Vec<AnyObj>) -> Result<Vec<Obj<T>>> {
    objs.into_iter()
        .map(|obj| {
            obj.downcast::<T>().ok_or_else(|| {
                Error::Type(TypeError {
                    expected: T::model_name(),
                    actual: obj.model_name().to_string(),
                    column: None,
                })
            })
        })
        .collect()
}

/// A related single object (many-to-one or one-to-one).
///
/// This wrapper can be in one of three states:
/// - **Empty**: no relationship (`fk_value` is None)
/// - **Unloaded**: has FK value but not fetched yet
/// - **Loaded**: the object has been fetched and cached
pub struct Related<T: Model> {
    fk_value: Option<Value>,
    loaded: OnceLock<Option<Obj<T>>>,
}

impl<T: Model> Related<T> {
    /// Create an empty relationship (null FK, not loaded).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            fk_value: None,
            loaded: OnceLock::new(),
        }
    }

    /// Create from a foreign key value (not yet loaded).
    #[must_use]
    pub fn from_fk(fk: impl Into<Value>) -> Self {
        let fk = fk.into();
        Self {
            fk_value: (!fk.is_null()).then_some(fk),
            loaded: OnceLock::new(),
        }
    }

    /// Create with an already-loaded object.
    #[must_use]
    pub fn loaded(obj: Obj<T>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(Some(obj));
        Self {
            fk_value: None,
            loaded: cell,
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<&Obj<T>> {
        self.loaded.get().and_then(|o| o.as_ref())
    }

    /// Check if the relationship has been loaded (including loaded-null).
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Check if the relationship is empty (null FK and nothing loaded).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fk_value.is_none() && self.get().is_none()
    }

    #[must_use]
    pub fn fk(&self) -> Option<&Value> {
        self.fk_value.as_ref()
    }

    pub fn set_loaded(&self, obj: Option<Obj<T>>) -> std::result::Result<(), Option<Obj<T>>> {
        self.loaded.set(obj)
    }

    /// Report the load state for [`Model::relations`].
    pub fn state(&self) -> RelationState {
        if let Some(loaded) = self.loaded.get() {
            return RelationState::One(loaded.as_ref().map(Obj::erase));
        }
        match (&self.fk_value, T::PRIMARY_KEY.first()) {
            (Some(fk), Some(pk)) => RelationState::Unloaded(LoadPlan {
                table: T::TABLE_NAME,
                filter: Filter::Eq(*pk, fk.clone()),
                many: false,
                instantiate: instantiate::<T>,
            }),
            _ => RelationState::One(None),
        }
    }

    /// Accept a loaded value from [`Model::set_relation`].
    ///
    /// An already-loaded relationship keeps its current object.
    pub fn fill(&self, loaded: Loaded) -> Result<()> {
        let objs = downcast_all::<T>(loaded.objects())?;
        let _ = self.loaded.set(objs.into_iter().next());
        Ok(())
    }
}

impl<T: Model> Default for Related<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: Model> Clone for Related<T> {
    fn clone(&self) -> Self {
        let cloned = Self {
            fk_value: self.fk_value.clone(),
            loaded: OnceLock::new(),
        };
        if let Some(value) = self.loaded.get() {
            let _ = cloned.loaded.set(value.clone());
        }
        cloned
    }
}

impl<T: Model> fmt::Debug for Related<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_loaded() {
            "loaded"
        } else if self.is_empty() {
            "empty"
        } else {
            "unloaded"
        };

        f.debug_struct("Related")
            .field("state", &state)
            .field("fk_value", &self.fk_value)
            .finish()
    }
}

/// A collection of related objects (one-to-many).
///
/// Unloaded collections fetch every row of the related table whose
/// `fk_column` equals the parent's primary key.
pub struct RelatedMany<T: Model> {
    loaded: OnceLock<Vec<Obj<T>>>,
    /// Foreign key column on the related model
    fk_column: &'static str,
    parent_pk: Option<Value>,
}

impl<T: Model> RelatedMany<T> {
    #[must_use]
    pub fn new(fk_column: &'static str) -> Self {
        Self {
            loaded: OnceLock::new(),
            fk_column,
            parent_pk: None,
        }
    }

    #[must_use]
    pub fn with_parent_pk(fk_column: &'static str, pk: impl Into<Value>) -> Self {
        let pk = pk.into();
        Self {
            loaded: OnceLock::new(),
            fk_column,
            parent_pk: (!pk.is_null()).then_some(pk),
        }
    }

    /// Create with an already-loaded collection.
    #[must_use]
    pub fn loaded(fk_column: &'static str, objects: Vec<Obj<T>>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(objects);
        Self {
            loaded: cell,
            fk_column,
            parent_pk: None,
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    #[must_use]
    pub fn get(&self) -> Option<&[Obj<T>]> {
        self.loaded.get().map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loaded.get().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Obj<T>> {
        self.loaded.get().into_iter().flatten()
    }

    #[must_use]
    pub fn fk_column(&self) -> &'static str {
        self.fk_column
    }

    #[must_use]
    pub fn parent_pk(&self) -> Option<&Value> {
        self.parent_pk.as_ref()
    }

    pub fn set_parent_pk(&mut self, pk: impl Into<Value>) {
        self.parent_pk = Some(pk.into());
    }

    pub fn set_loaded(&self, objects: Vec<Obj<T>>) -> std::result::Result<(), Vec<Obj<T>>> {
        self.loaded.set(objects)
    }

    /// Report the load state for [`Model::relations`].
    ///
    /// A collection without a parent key has nothing to fetch and reports as
    /// loaded-empty.
    pub fn state(&self) -> RelationState {
        if let Some(objs) = self.loaded.get() {
            return RelationState::Many(objs.iter().map(Obj::erase).collect());
        }
        match &self.parent_pk {
            Some(pk) => RelationState::Unloaded(LoadPlan {
                table: T::TABLE_NAME,
                filter: Filter::Eq(self.fk_column, pk.clone()),
                many: true,
                instantiate: instantiate::<T>,
            }),
            None => RelationState::Many(Vec::new()),
        }
    }

    /// Accept a loaded value from [`Model::set_relation`].
    pub fn fill(&self, loaded: Loaded) -> Result<()> {
        let objs = downcast_all::<T>(loaded.objects())?;
        let _ = self.loaded.set(objs);
        Ok(())
    }
}

impl<T: Model> Default for RelatedMany<T> {
    fn default() -> Self {
        Self::new("")
    }
}

impl<T: Model> Clone for RelatedMany<T> {
    fn clone(&self) -> Self {
        let cloned = Self {
            loaded: OnceLock::new(),
            fk_column: self.fk_column,
            parent_pk: self.parent_pk.clone(),
        };
        if let Some(objs) = self.loaded.get() {
            let _ = cloned.loaded.set(objs.clone());
        }
        cloned
    }
}

impl<T: Model> fmt::Debug for RelatedMany<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedMany")
            .field("loaded", &self.is_loaded())
            .field("len", &self.len())
            .field("fk_column", &self.fk_column)
            .field("parent_pk", &self.parent_pk)
            .finish()
    }
}

impl<'a, T: Model> IntoIterator for &'a RelatedMany<T> {
    type Item = &'a Obj<T>;
    type IntoIter = Box<dyn Iterator<Item = &'a Obj<T>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Team {
        id: Option<i64>,
    }

    impl Model for Team {
        const TABLE_NAME: &'static str = "teams";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_named("id")?,
            })
        }

        fn primary_key_value(&self) -> Vec<Value> {
            vec![self.id.into()]
        }

        fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
            self.id = values.first().cloned().unwrap_or(Value::Null).try_into()?;
            Ok(())
        }
    }

    #[test]
    fn test_related_states() {
        let empty: Related<Team> = Related::empty();
        assert!(matches!(empty.state(), RelationState::One(None)));

        let unloaded: Related<Team> = Related::from_fk(7_i64);
        match unloaded.state() {
            RelationState::Unloaded(plan) => {
                assert_eq!(plan.table, "teams");
                assert_eq!(plan.filter, Filter::Eq("id", Value::BigInt(7)));
                assert!(!plan.many);
                let row = Row::from_pairs(vec![("id", Value::BigInt(7))]);
                let obj = (plan.instantiate)(&row).unwrap();
                assert_eq!(obj.primary_key_value(), vec![Value::BigInt(7)]);
            }
            other => panic!("expected unloaded, got {other:?}"),
        }

        let team = Obj::new(Team { id: Some(7) });
        unloaded.fill(Loaded::One(Some(team.erase()))).unwrap();
        assert!(unloaded.get().unwrap().ptr_eq(&team));
        match unloaded.state() {
            RelationState::One(Some(obj)) => assert_eq!(obj.object_id(), team.object_id()),
            other => panic!("expected loaded, got {other:?}"),
        }
    }

    #[test]
    fn test_related_many_states() {
        let orphan: RelatedMany<Team> = RelatedMany::new("owner_id");
        assert!(matches!(orphan.state(), RelationState::Many(v) if v.is_empty()));

        let many: RelatedMany<Team> = RelatedMany::with_parent_pk("owner_id", 3_i64);
        assert!(matches!(
            many.state(),
            RelationState::Unloaded(LoadPlan { many: true, .. })
        ));
        many.fill(Loaded::Many(vec![
            Obj::new(Team { id: Some(1) }).erase(),
            Obj::new(Team { id: Some(2) }).erase(),
        ]))
        .unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!((&many).into_iter().count(), 2);
    }

    #[test]
    fn test_fill_rejects_foreign_types() {
        #[derive(Debug, Clone)]
        struct Other;

        impl Model for Other {
            const TABLE_NAME: &'static str = "others";
            const PRIMARY_KEY: &'static [&'static str] = &[];

            fn to_row(&self) -> Vec<(&'static str, Value)> {
                Vec::new()
            }

            fn from_row(_row: &Row) -> Result<Self> {
                Ok(Other)
            }

            fn primary_key_value(&self) -> Vec<Value> {
                Vec::new()
            }

            fn set_primary_key_value(&mut self, _values: &[Value]) -> Result<()> {
                Ok(())
            }
        }

        let rel: Related<Team> = Related::empty();
        let err = rel
            .fill(Loaded::One(Some(Obj::new(Other).erase())))
            .unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert!(!rel.is_loaded());
    }
}
