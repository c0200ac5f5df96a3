//! Batch save: insert-or-merge a heterogeneous list of objects.
//!
//! Objects with an identity are grouped by type and resolved against the
//! store with one query per type. Objects that are already attached are
//! saved as they are, objects whose identity matches an existing row are
//! merged onto it, and everything else is inserted, including objects that
//! carry an identity no row has yet. All attachments happen inside one
//! transaction scope, so a save nested in a caller's scope commits with it.
//!
//! A row inserted by another writer between the pre-fetch and the commit
//! surfaces as an integrity error from the store; it is not retried.

use crate::Session;
use crate::transaction::ScopeOptions;
use asupersync::{Cx, Outcome};
use sqlservice_core::{
    AnyObj, Connection, Error, Identity, IdentityFn, Model, Obj, ValidationError,
    ValidationErrorKind, identity_filter, primary_identity, try_outcome, try_result,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

/// Objects passed to a save, in the shape the caller used.
#[derive(Debug, Clone)]
pub enum Batch {
    One(AnyObj),
    Many(Vec<AnyObj>),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Batch::One(_) => 1,
            Batch::Many(objects) => objects.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single object of a `One` batch.
    pub fn into_one(self) -> Option<AnyObj> {
        match self {
            Batch::One(obj) => Some(obj),
            Batch::Many(_) => None,
        }
    }

    /// Every object, in order.
    pub fn into_vec(self) -> Vec<AnyObj> {
        match self {
            Batch::One(obj) => vec![obj],
            Batch::Many(objects) => objects,
        }
    }

    fn split(self) -> (Vec<AnyObj>, bool) {
        match self {
            Batch::One(obj) => (vec![obj], true),
            Batch::Many(objects) => (objects, false),
        }
    }

    fn rebuild(mut objects: Vec<AnyObj>, scalar: bool) -> Self {
        match objects.pop() {
            Some(obj) if scalar => Batch::One(obj),
            Some(obj) => {
                objects.push(obj);
                Batch::Many(objects)
            }
            None => Batch::Many(objects),
        }
    }
}

impl From<AnyObj> for Batch {
    fn from(obj: AnyObj) -> Self {
        Batch::One(obj)
    }
}

impl From<Vec<AnyObj>> for Batch {
    fn from(objects: Vec<AnyObj>) -> Self {
        Batch::Many(objects)
    }
}

impl<M: Model> From<Obj<M>> for Batch {
    fn from(obj: Obj<M>) -> Self {
        Batch::One(obj.erase())
    }
}

impl<M: Model> From<Vec<Obj<M>>> for Batch {
    fn from(objects: Vec<Obj<M>>) -> Self {
        Batch::Many(objects.iter().map(Obj::erase).collect())
    }
}

/// Called with each object and whether it is being inserted.
pub type SaveHook = Box<dyn FnMut(&AnyObj, bool) -> Result<(), Error> + Send>;

/// Identity function and hooks for a save.
pub struct SaveOptions {
    identity: IdentityFn,
    before: Option<SaveHook>,
    after: Option<SaveHook>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            identity: primary_identity(),
            before: None,
            after: None,
        }
    }
}

impl fmt::Debug for SaveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOptions")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish_non_exhaustive()
    }
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve objects against the store with `identity` instead of the
    /// primary key.
    #[must_use]
    pub fn identity(mut self, identity: IdentityFn) -> Self {
        self.identity = identity;
        self
    }

    /// Run `hook` right before each object is attached.
    #[must_use]
    pub fn before(
        mut self,
        hook: impl FnMut(&AnyObj, bool) -> Result<(), Error> + Send + 'static,
    ) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    /// Run `hook` right after each object is attached.
    #[must_use]
    pub fn after(
        mut self,
        hook: impl FnMut(&AnyObj, bool) -> Result<(), Error> + Send + 'static,
    ) -> Self {
        self.after = Some(Box::new(hook));
        self
    }
}

/// Objects of one type that carry an identity, by batch position.
struct MergeGroup {
    type_id: TypeId,
    members: Vec<(usize, Identity)>,
}

/// Split batch positions into objects to insert and identity groups to
/// resolve, rejecting duplicate identities within a group.
fn partition(
    objects: &[AnyObj],
    identity: &IdentityFn,
) -> Result<(Vec<usize>, Vec<MergeGroup>), Error> {
    let mut insertable = Vec::new();
    let mut groups: Vec<MergeGroup> = Vec::new();
    for (index, obj) in objects.iter().enumerate() {
        let Some(id) = identity(&**obj) else {
            insertable.push(index);
            continue;
        };
        let type_id = obj.model_type();
        let group = match groups.iter().position(|g| g.type_id == type_id) {
            Some(pos) => &mut groups[pos],
            None => {
                groups.push(MergeGroup {
                    type_id,
                    members: Vec::new(),
                });
                let last = groups.len() - 1;
                &mut groups[last]
            }
        };
        if group.members.iter().any(|(_, other)| *other == id) {
            return Err(Error::Validation(
                ValidationError::new(
                    ValidationErrorKind::DuplicateIdentity,
                    format!(
                        "duplicate {} identity {id} in batch",
                        obj.model_name()
                    ),
                )
                .at(index),
            ));
        }
        group.members.push((index, id));
    }
    Ok((insertable, groups))
}

impl<C: Connection> Session<C> {
    /// Save a batch of objects and commit.
    ///
    /// Returns the batch in the shape it was given. Positions whose object
    /// was merged onto an existing row hold the merged instance.
    #[tracing::instrument(level = "debug", skip_all, fields(objects = batch.len()))]
    pub async fn save(
        &mut self,
        cx: &Cx,
        batch: Batch,
        mut options: SaveOptions,
    ) -> Outcome<Batch, Error> {
        let (mut objects, scalar) = batch.split();
        if objects.is_empty() {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::EmptyBatch,
                "save requires at least one object",
            ));
        }
        for (index, obj) in objects.iter().enumerate() {
            try_result!(self.check_mapped(index, obj));
        }
        let (insertable, groups) = try_result!(partition(&objects, &options.identity));

        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self
            .save_in_scope(cx, &mut objects, insertable, groups, &mut options)
            .await;
        try_outcome!(self.end_scope(cx, guard, outcome).await);

        Outcome::Ok(Batch::rebuild(objects, scalar))
    }

    async fn save_in_scope(
        &mut self,
        cx: &Cx,
        objects: &mut [AnyObj],
        mut insertable: Vec<usize>,
        groups: Vec<MergeGroup>,
        options: &mut SaveOptions,
    ) -> Outcome<(), Error> {
        let mut updatable = Vec::new();

        for group in groups {
            let candidates: Vec<AnyObj> = group
                .members
                .iter()
                .map(|(index, _)| objects[*index].clone())
                .collect();
            let filter = identity_filter(&candidates, &options.identity);
            let sample = candidates[0].clone();
            let existing = try_outcome!(
                self.query_any(cx, sample.table_name(), Some(filter), |row| {
                    sample.instantiate(row)
                })
                .await
            );
            let mut lookup: HashMap<Identity, AnyObj> = HashMap::new();
            for row_obj in existing {
                if let Some(id) = (options.identity)(&*row_obj) {
                    lookup.insert(id, row_obj);
                }
            }
            tracing::debug!(
                model = sample.model_name(),
                candidates = candidates.len(),
                found = lookup.len(),
                "Resolved save identities"
            );

            for (index, id) in group.members {
                let obj = objects[index].clone();
                if self.contains_any(&obj) {
                    updatable.push(index);
                } else if let Some(found) = lookup.get(&id) {
                    try_result!(obj.set_primary_key_value(&found.primary_key_value()));
                    objects[index] = try_outcome!(self.merge_any(cx, obj).await);
                    updatable.push(index);
                } else {
                    insertable.push(index);
                }
            }
        }

        for (indexes, is_new) in [(insertable, true), (updatable, false)] {
            for index in indexes {
                let obj = objects[index].clone();
                if let Some(before) = options.before.as_mut() {
                    try_result!(before(&obj, is_new));
                }
                self.add_any(obj.clone());
                if let Some(after) = options.after.as_mut() {
                    try_result!(after(&obj, is_new));
                }
            }
        }
        Outcome::Ok(())
    }

    /// Save one object with primary-key identity.
    pub async fn save_one<M: Model>(&mut self, cx: &Cx, obj: &Obj<M>) -> Outcome<Obj<M>, Error> {
        let saved = try_outcome!(
            self.save(cx, Batch::from(obj.clone()), SaveOptions::default())
                .await
        );
        match saved.into_one().and_then(|one| one.downcast::<M>()) {
            Some(typed) => Outcome::Ok(typed),
            None => Outcome::Err(Error::Custom(format!(
                "save returned a different type for {}",
                M::model_name()
            ))),
        }
    }

    /// Save a list of objects of one type with primary-key identity.
    pub async fn save_all<M: Model>(
        &mut self,
        cx: &Cx,
        objects: &[Obj<M>],
    ) -> Outcome<Vec<Obj<M>>, Error> {
        let saved = try_outcome!(
            self.save(cx, Batch::from(objects.to_vec()), SaveOptions::default())
                .await
        );
        Outcome::Ok(
            saved
                .into_vec()
                .iter()
                .filter_map(AnyObj::downcast::<M>)
                .collect(),
        )
    }
}
