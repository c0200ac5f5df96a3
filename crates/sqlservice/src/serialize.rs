//! Cycle-safe conversion of object graphs to JSON maps.
//!
//! Columns become JSON scalars. Relationships become nested maps (single
//! references) or arrays of maps (collections). Relationships on the root
//! object are included unless `exclude_relationships` is set; relationships
//! further down only with `include_nested_relationships`.
//!
//! The walk records every object it enters. A single reference to an
//! object already entered is left out; a collection member already entered
//! is written as a copy of the map built for it so far, which may still be
//! missing relationships when the walk is inside that object. Unloaded
//! relationships are skipped; [`to_dict_loaded`] loads them first.

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sqlservice_core::{AnyObj, Connection, Error, Model, Obj, RelationState, try_outcome};
use sqlservice_session::Session;
use std::collections::{HashMap, HashSet};

/// A serialized object.
pub type Dict = serde_json::Map<String, Json>;

/// Which parts of the graph to serialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializeOptions {
    /// Load unloaded relationships before serializing. Only honored by
    /// [`to_dict_loaded`], which has a session to load them with.
    pub lazyload: bool,
    /// Leave out relationships of the root object.
    pub exclude_relationships: bool,
    /// Include relationships of related objects.
    pub include_nested_relationships: bool,
}

impl SerializeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lazyload(mut self) -> Self {
        self.lazyload = true;
        self
    }

    #[must_use]
    pub fn exclude_relationships(mut self) -> Self {
        self.exclude_relationships = true;
        self
    }

    #[must_use]
    pub fn include_nested_relationships(mut self) -> Self {
        self.include_nested_relationships = true;
        self
    }

    fn includes_relationships_at(&self, depth: usize) -> bool {
        if depth == 0 {
            !self.exclude_relationships
        } else {
            self.include_nested_relationships
        }
    }
}

/// Serializes object graphs with the given options.
///
/// Each [`to_dict`](Self::to_dict) call starts a fresh walk.
#[derive(Debug, Default)]
pub struct GraphSerializer {
    options: SerializeOptions,
    seen: HashSet<usize>,
    cache: HashMap<usize, Dict>,
}

impl GraphSerializer {
    /// A serializer over already-loaded relationships.
    ///
    /// `lazyload` has no effect here; use [`to_dict_loaded`] to load through a
    /// session first.
    pub fn new(options: SerializeOptions) -> Self {
        if options.lazyload {
            tracing::debug!("lazyload ignored without a session; unloaded relationships are skipped");
        }
        Self::with_loaded(options)
    }

    fn with_loaded(options: SerializeOptions) -> Self {
        Self {
            options,
            seen: HashSet::new(),
            cache: HashMap::new(),
        }
    }

    pub fn options(&self) -> &SerializeOptions {
        &self.options
    }

    pub fn to_dict(&mut self, obj: &AnyObj) -> Dict {
        self.seen.clear();
        self.cache.clear();
        self.visit(obj, 0)
    }

    fn visit(&mut self, obj: &AnyObj, depth: usize) -> Dict {
        let id = obj.object_id();
        self.seen.insert(id);

        let mut dict: Dict = obj
            .to_row()
            .into_iter()
            .map(|(column, value)| (column.to_string(), value.to_json()))
            .collect();
        self.cache.insert(id, dict.clone());

        if self.options.includes_relationships_at(depth) {
            for (name, state) in obj.relations() {
                let value = match state {
                    RelationState::Unloaded(_) => continue,
                    RelationState::One(None) => Json::Object(Dict::new()),
                    RelationState::One(Some(target)) => {
                        if self.seen.contains(&target.object_id()) {
                            continue;
                        }
                        Json::Object(self.visit(&target, depth + 1))
                    }
                    RelationState::Many(targets) => Json::Array(
                        targets
                            .iter()
                            .map(|target| Json::Object(self.member(target, depth + 1)))
                            .collect(),
                    ),
                };
                dict.insert(name.to_string(), value);
                self.cache.insert(id, dict.clone());
            }
        }
        dict
    }

    fn member(&mut self, obj: &AnyObj, depth: usize) -> Dict {
        let id = obj.object_id();
        if self.seen.contains(&id) {
            return self.cache.get(&id).cloned().unwrap_or_default();
        }
        self.visit(obj, depth)
    }
}

/// Serialize `obj`, first loading unloaded relationships through `session`
/// when `options.lazyload` is set.
///
/// Only relationships the serializer would include are loaded.
pub async fn to_dict_loaded<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    obj: &AnyObj,
    options: SerializeOptions,
) -> Outcome<Dict, Error> {
    if options.lazyload {
        let mut visited = HashSet::new();
        let mut stack = vec![(obj.clone(), 0_usize)];
        while let Some((current, depth)) = stack.pop() {
            if !visited.insert(current.object_id())
                || !options.includes_relationships_at(depth)
            {
                continue;
            }
            for (name, state) in current.relations() {
                let loaded = match state.loaded() {
                    Some(loaded) => loaded,
                    None => try_outcome!(session.load_relation(cx, &current, name).await),
                };
                stack.extend(loaded.objects().into_iter().map(|child| (child, depth + 1)));
            }
        }
        tracing::debug!(objects = visited.len(), "Loaded graph for serialization");
    }
    Outcome::Ok(GraphSerializer::with_loaded(options).to_dict(obj))
}

/// `to_dict` on object handles.
pub trait ModelExt {
    fn to_dict_with(&self, options: SerializeOptions) -> Dict;

    fn to_dict(&self) -> Dict {
        self.to_dict_with(SerializeOptions::default())
    }
}

impl ModelExt for AnyObj {
    fn to_dict_with(&self, options: SerializeOptions) -> Dict {
        GraphSerializer::new(options).to_dict(self)
    }
}

impl<M: Model> ModelExt for Obj<M> {
    fn to_dict_with(&self, options: SerializeOptions) -> Dict {
        GraphSerializer::new(options).to_dict(&self.erase())
    }
}
