//! Session and unit of work for sqlservice.
//!
//! `sqlservice-session` is the **unit-of-work layer**. A [`Session`] owns one
//! [`Connection`] and coordinates object identity, change tracking and
//! transactional persistence on it. On top of that it provides:
//!
//! - **Nestable transaction scopes** ([`transaction`]): a depth counter shared by
//!   every scope on the session, committing or rolling back only at the
//!   outermost exit and rolling back at the first scope that observes a failure.
//! - **Batch save** ([`save`]): heterogeneous upsert-style persistence with one
//!   pre-fetch query per entity type.
//! - **Destroy** ([`destroy`]): delete rows by primary key for a batch.
//! - **Bulk writes** ([`bulk`]): INSERT and grouped UPDATE statements built
//!   from plain column mappings, including a diff against previous values.
//!
//! # Identity
//!
//! The session tracks objects by instance. Rows loaded from the store are
//! attached through the identity map, so a session never holds two instances
//! with the same type and primary key.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn);
//! session.add(&hero);
//! session.commit(&cx).await?;
//!
//! let same = session.get::<Hero>(&cx, 1_i64).await?;
//! ```

pub mod bulk;
pub mod destroy;
pub mod save;
pub mod transaction;

pub use bulk::{BulkCounts, Mapping};
pub use save::{Batch, SaveHook, SaveOptions};
pub use transaction::{ScopeGuard, ScopeOptions};

use asupersync::{Cx, Outcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlservice_core::error::{QueryError, QueryErrorKind};
use sqlservice_core::{
    AnyObj, Connection, Error, EventKind, EventRegistry, Filter, Identity, Insert, Loaded, Model,
    ModelRegistry, Obj, RelationState, Row, Statement, Update, ValidationErrorKind, Value,
    instantiate, try_outcome, try_result,
};
use std::any::TypeId;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use transaction::ScopeState;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Returning `Err` aborts the operation (e.g., prevents commit).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (after flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

#[derive(Default)]
struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }

    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        for cb in self.slot(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Flush pending changes before every query.
    pub autoflush: bool,
    /// Expire persistent objects after commit: the next query that loads an
    /// expired object's row refreshes the object from the store.
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autoflush: true,
            expire_on_commit: true,
        }
    }
}

// ============================================================================
// Identity Keys and Object State
// ============================================================================

/// Key of an object in the identity map: its type plus primary key values.
#[derive(Debug, Clone)]
struct IdentityKey {
    type_id: TypeId,
    values: Vec<Value>,
}

impl IdentityKey {
    fn of(obj: &AnyObj) -> Option<Self> {
        let values = obj.primary_key_value();
        if values.is_empty() || values.iter().any(Value::is_null) {
            return None;
        }
        Some(Self {
            type_id: obj.model_type(),
            values,
        })
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        for v in &self.values {
            sqlservice_core::value::hash_value(v, state);
        }
    }
}

/// State of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Added, not yet inserted.
    New,
    /// Backed by a row in the store.
    Persistent,
    /// Persistent, refreshed from the next loaded row.
    Expired,
    /// Marked for deletion on the next flush.
    Deleted,
}

type RowSnapshot = Vec<(&'static str, Value)>;

struct TrackedObject {
    obj: AnyObj,
    state: ObjectState,
    /// Column values as last read from or written to the store
    snapshot: Option<RowSnapshot>,
    key: Option<IdentityKey>,
    seq: u64,
}

fn snapshot_filter(obj: &AnyObj, snapshot: Option<&RowSnapshot>) -> Option<Filter> {
    let pairs = obj
        .primary_key_columns()
        .iter()
        .map(|column| {
            let value = snapshot
                .and_then(|row| row.iter().find(|(c, _)| c == column))
                .map_or(Value::Null, |(_, v)| v.clone());
            (*column, value)
        })
        .collect();
    Identity::new(pairs).map(|id| id.to_filter())
}

fn changed_columns(before: &RowSnapshot, after: &RowSnapshot) -> Vec<&'static str> {
    after
        .iter()
        .filter(|(column, value)| {
            before
                .iter()
                .find(|(c, _)| c == column)
                .is_none_or(|(_, old)| !old.key_eq(value))
        })
        .map(|(column, _)| *column)
        .collect()
}

/// Put unflushed work back ahead of anything queued since.
fn restore_pending(pending: &mut Vec<usize>, unflushed: &[usize]) {
    let queued = std::mem::replace(pending, unflushed.to_vec());
    pending.extend(queued);
}

/// Debug information about session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Number of tracked objects.
    pub tracked: usize,
    /// Objects pending INSERT.
    pub pending_new: usize,
    /// Objects pending DELETE.
    pub pending_delete: usize,
    /// Whether a store transaction is open.
    pub in_transaction: bool,
    /// Current transaction scope depth.
    pub depth: usize,
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one connection.
pub struct Session<C: Connection> {
    connection: C,
    config: SessionConfig,
    in_transaction: bool,
    objects: HashMap<usize, TrackedObject>,
    identity_map: HashMap<IdentityKey, usize>,
    pending_new: Vec<usize>,
    pending_delete: Vec<usize>,
    next_seq: u64,
    /// Snapshots from before the open transaction, restored on rollback
    txn_snapshots: HashMap<usize, Option<RowSnapshot>>,
    /// Objects inserted by the open transaction, detached on rollback
    txn_inserted: Vec<usize>,
    pub(crate) scope: Arc<Mutex<ScopeState>>,
    events: Arc<EventRegistry>,
    models: Option<Arc<ModelRegistry>>,
    callbacks: SessionEventCallbacks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("state", &self.debug_state())
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        Self {
            connection,
            config,
            in_transaction: false,
            objects: HashMap::new(),
            identity_map: HashMap::new(),
            pending_new: Vec::new(),
            pending_delete: Vec::new(),
            next_seq: 0,
            txn_snapshots: HashMap::new(),
            txn_inserted: Vec::new(),
            scope: Arc::new(Mutex::new(ScopeState::new(config.autoflush))),
            events: Arc::new(EventRegistry::new()),
            models: None,
            callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Fire per-model listeners from `events` while flushing.
    #[must_use]
    pub fn with_events(mut self, events: Arc<EventRegistry>) -> Self {
        self.events = events;
        self
    }

    /// Restrict save and destroy to the types registered in `models`.
    #[must_use]
    pub fn with_models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether a store transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Current autoflush setting, including any scope override.
    pub fn autoflush(&self) -> bool {
        self.scope.lock().autoflush
    }

    pub fn set_autoflush(&mut self, enabled: bool) {
        self.scope.lock().autoflush = enabled;
    }

    pub fn pending_new_count(&self) -> usize {
        self.pending_new.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.objects.len()
    }

    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.objects.len(),
            pending_new: self.pending_new.len(),
            pending_delete: self.pending_delete.len(),
            in_transaction: self.in_transaction,
            depth: self.depth(),
        }
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback for a session lifecycle event.
    pub fn on(
        &mut self,
        event: SessionEvent,
        callback: impl FnMut() -> Result<(), Error> + Send + 'static,
    ) {
        self.callbacks.slot(event).push(Box::new(callback));
    }

    // ========================================================================
    // Object Tracking
    // ========================================================================

    /// Add an object to the session; it is inserted on the next flush.
    pub fn add<M: Model>(&mut self, obj: &Obj<M>) {
        self.add_any(obj.erase());
    }

    /// Type-erased [`add`](Self::add).
    ///
    /// Adding an object that is already tracked is a no-op, except that an
    /// object marked for deletion is restored.
    pub fn add_any(&mut self, obj: AnyObj) {
        let id = obj.object_id();
        if let Some(tracked) = self.objects.get_mut(&id) {
            if tracked.state == ObjectState::Deleted {
                tracked.state = ObjectState::Persistent;
                self.pending_delete.retain(|d| *d != id);
            }
            return;
        }
        tracing::debug!(model = obj.model_name(), "Adding object to session");
        self.track(obj, ObjectState::New, None);
        self.pending_new.push(id);
    }

    fn track(&mut self, obj: AnyObj, state: ObjectState, snapshot: Option<RowSnapshot>) {
        let id = obj.object_id();
        let key = if state == ObjectState::New {
            None
        } else {
            IdentityKey::of(&obj)
        };
        if let Some(key) = &key {
            self.identity_map.insert(key.clone(), id);
        }
        self.next_seq += 1;
        self.objects.insert(
            id,
            TrackedObject {
                obj,
                state,
                snapshot,
                key,
                seq: self.next_seq,
            },
        );
    }

    /// Whether the session tracks this instance.
    pub fn contains<M: Model>(&self, obj: &Obj<M>) -> bool {
        self.objects.contains_key(&obj.object_id())
    }

    pub fn contains_any(&self, obj: &AnyObj) -> bool {
        self.objects.contains_key(&obj.object_id())
    }

    pub fn state_of(&self, obj: &AnyObj) -> Option<ObjectState> {
        self.objects.get(&obj.object_id()).map(|t| t.state)
    }

    /// Mark an object for deletion on the next flush.
    ///
    /// A pending object is simply dropped from the session; untracked
    /// objects are ignored.
    pub fn delete<M: Model>(&mut self, obj: &Obj<M>) {
        self.delete_any(&obj.erase());
    }

    pub fn delete_any(&mut self, obj: &AnyObj) {
        let id = obj.object_id();
        let Some(tracked) = self.objects.get_mut(&id) else {
            tracing::debug!(model = obj.model_name(), "Ignoring delete of untracked object");
            return;
        };
        match tracked.state {
            ObjectState::New => {
                self.objects.remove(&id);
                self.pending_new.retain(|p| *p != id);
            }
            ObjectState::Persistent | ObjectState::Expired => {
                tracked.state = ObjectState::Deleted;
                self.pending_delete.push(id);
            }
            ObjectState::Deleted => {}
        }
    }

    /// Stop tracking an object without touching the store.
    pub fn expunge_any(&mut self, obj: &AnyObj) {
        self.forget(obj.object_id());
    }

    /// Stop tracking every object.
    pub fn expunge_all(&mut self) {
        self.objects.clear();
        self.identity_map.clear();
        self.pending_new.clear();
        self.pending_delete.clear();
        self.txn_snapshots.clear();
        self.txn_inserted.clear();
    }

    fn forget(&mut self, id: usize) {
        if let Some(tracked) = self.objects.remove(&id) {
            if let Some(key) = tracked.key {
                if self.identity_map.get(&key) == Some(&id) {
                    self.identity_map.remove(&key);
                }
            }
        }
        self.pending_new.retain(|p| *p != id);
        self.pending_delete.retain(|p| *p != id);
        self.txn_snapshots.remove(&id);
        self.txn_inserted.retain(|p| *p != id);
    }

    /// The tracked instance of `M` with the given primary key, if any.
    pub fn identity_lookup<M: Model>(&self, key: &[Value]) -> Option<Obj<M>> {
        let key = IdentityKey {
            type_id: TypeId::of::<M>(),
            values: key.to_vec(),
        };
        let id = self.identity_map.get(&key)?;
        self.objects.get(id)?.obj.downcast::<M>()
    }

    /// Track a freshly loaded object, or return the instance already tracked
    /// under its identity.
    fn attach_loaded(&mut self, fresh: AnyObj) -> Result<AnyObj, Error> {
        let Some(key) = IdentityKey::of(&fresh) else {
            return Ok(fresh);
        };
        if let Some(tracked) = self
            .identity_map
            .get(&key)
            .and_then(|id| self.objects.get_mut(id))
        {
            if tracked.state == ObjectState::Expired {
                tracked.obj.copy_from(&*fresh)?;
                tracked.snapshot = Some(fresh.to_row());
                tracked.state = ObjectState::Persistent;
            }
            return Ok(tracked.obj.clone());
        }
        let snapshot = fresh.to_row();
        self.track(fresh.clone(), ObjectState::Persistent, Some(snapshot));
        Ok(fresh)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query on `table` and attach every loaded row.
    pub(crate) async fn query_any(
        &mut self,
        cx: &Cx,
        table: &'static str,
        filter: Option<Filter>,
        build: impl Fn(&Row) -> Result<AnyObj, Error>,
    ) -> Outcome<Vec<AnyObj>, Error> {
        try_outcome!(self.settle_pending_rollback(cx).await);
        if self.autoflush() {
            try_outcome!(self.flush(cx).await);
        }
        try_outcome!(self.begin(cx).await);

        let stmt = Statement::select(table, filter);
        let rows = try_outcome!(self.connection.query(cx, &stmt).await);
        tracing::debug!(table, rows = rows.len(), "Loaded rows");

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            let fresh = try_result!(build(row));
            objects.push(try_result!(self.attach_loaded(fresh)));
        }
        Outcome::Ok(objects)
    }

    /// Load every `M` matching `filter` (all rows when `None`).
    pub async fn query<M: Model>(
        &mut self,
        cx: &Cx,
        filter: Option<Filter>,
    ) -> Outcome<Vec<Obj<M>>, Error> {
        let objects = try_outcome!(
            self.query_any(cx, M::TABLE_NAME, filter, instantiate::<M>)
                .await
        );
        Outcome::Ok(objects.iter().filter_map(AnyObj::downcast::<M>).collect())
    }

    /// The first `M` matching `filter`, if any.
    pub async fn first<M: Model>(
        &mut self,
        cx: &Cx,
        filter: Option<Filter>,
    ) -> Outcome<Option<Obj<M>>, Error> {
        let objects = try_outcome!(self.query::<M>(cx, filter).await);
        Outcome::Ok(objects.into_iter().next())
    }

    /// The single `M` matching `filter`; more than one match is an error.
    pub async fn one_or_none<M: Model>(
        &mut self,
        cx: &Cx,
        filter: Option<Filter>,
    ) -> Outcome<Option<Obj<M>>, Error> {
        let mut objects = try_outcome!(self.query::<M>(cx, filter).await);
        if objects.len() > 1 {
            return Outcome::Err(Error::Custom(format!(
                "expected at most one {} row, found {}",
                M::model_name(),
                objects.len()
            )));
        }
        Outcome::Ok(objects.pop())
    }

    /// Get an object by single-column primary key.
    ///
    /// The identity map is consulted first; a missing row is `None`.
    pub async fn get<M: Model>(
        &mut self,
        cx: &Cx,
        key: impl Into<Value>,
    ) -> Outcome<Option<Obj<M>>, Error> {
        self.get_by_key::<M>(cx, &[key.into()]).await
    }

    /// Get an object by (possibly composite) primary key.
    pub async fn get_by_key<M: Model>(
        &mut self,
        cx: &Cx,
        key: &[Value],
    ) -> Outcome<Option<Obj<M>>, Error> {
        if let Some(obj) = self.identity_lookup::<M>(key) {
            let expired = self.state_of(&obj.erase()) == Some(ObjectState::Expired);
            if !expired {
                return Outcome::Ok(Some(obj));
            }
        }
        let filter = sqlservice_core::primary_key_filter::<M>(&[key.to_vec()]);
        self.first::<M>(cx, Some(filter)).await
    }

    /// Fetch an unloaded relationship of `obj` and store it on the object.
    ///
    /// An already-loaded relationship is returned as is.
    pub async fn load_relation(
        &mut self,
        cx: &Cx,
        obj: &AnyObj,
        name: &str,
    ) -> Outcome<Loaded, Error> {
        let state = obj
            .relations()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, state)| state);
        let plan = match state {
            Some(RelationState::Unloaded(plan)) => plan,
            Some(RelationState::One(target)) => return Outcome::Ok(Loaded::One(target)),
            Some(RelationState::Many(targets)) => return Outcome::Ok(Loaded::Many(targets)),
            None => {
                return Outcome::Err(Error::validation(
                    ValidationErrorKind::UnknownRelationship,
                    format!("{} has no relationship named '{}'", obj.model_name(), name),
                ));
            }
        };

        tracing::debug!(model = obj.model_name(), relation = name, "Loading relationship");
        let objects = try_outcome!(
            self.query_any(cx, plan.table, Some(plan.filter), plan.instantiate)
                .await
        );
        let loaded = if plan.many {
            Loaded::Many(objects)
        } else {
            Loaded::One(objects.into_iter().next())
        };
        try_result!(obj.set_relation(name, loaded.clone()));
        Outcome::Ok(loaded)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge a possibly-detached object into the session.
    ///
    /// Returns the session's instance for the object's identity: the object
    /// itself if tracked, otherwise the identity-map or freshly loaded
    /// instance with the object's state copied onto it. Objects with no
    /// matching row are copied into a new pending instance.
    pub async fn merge<M: Model>(&mut self, cx: &Cx, obj: &Obj<M>) -> Outcome<Obj<M>, Error> {
        let merged = try_outcome!(self.merge_any(cx, obj.erase()).await);
        match merged.downcast::<M>() {
            Some(typed) => Outcome::Ok(typed),
            None => Outcome::Err(Error::Custom(format!(
                "merge returned a {} for a {}",
                merged.model_name(),
                M::model_name()
            ))),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, cx, obj), fields(model = obj.model_name()))]
    pub async fn merge_any(&mut self, cx: &Cx, obj: AnyObj) -> Outcome<AnyObj, Error> {
        if self.contains_any(&obj) {
            return Outcome::Ok(obj);
        }

        if let Some(key) = IdentityKey::of(&obj) {
            let existing = self
                .identity_map
                .get(&key)
                .and_then(|id| self.objects.get(id))
                .map(|t| t.obj.clone());
            let existing = match existing {
                Some(found) => Some(found),
                None => {
                    let filter = snapshot_filter(&obj, Some(&obj.to_row()));
                    let candidate = obj.clone();
                    let loaded = try_outcome!(
                        self.query_any(cx, obj.table_name(), filter, move |row| {
                            candidate.instantiate(row)
                        })
                        .await
                    );
                    loaded.into_iter().next()
                }
            };
            if let Some(existing) = existing {
                tracing::debug!("Merging into tracked instance");
                try_result!(existing.copy_from(&*obj));
                if let Some(tracked) = self.objects.get_mut(&existing.object_id()) {
                    if tracked.state == ObjectState::Expired {
                        tracked.state = ObjectState::Persistent;
                    }
                }
                return Outcome::Ok(existing);
            }
        }

        tracing::debug!("No persisted instance; adding a copy");
        let copy = obj.detached_copy();
        self.add_any(copy.clone());
        Outcome::Ok(copy)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a store transaction if none is open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction {
            return Outcome::Ok(());
        }
        try_outcome!(self.connection.begin(cx).await);
        self.in_transaction = true;
        Outcome::Ok(())
    }

    /// Issue the rollback owed by a scope that was dropped mid-flight.
    pub(crate) async fn settle_pending_rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let pending = std::mem::take(&mut self.scope.lock().rollback_pending);
        if pending {
            tracing::warn!("Rolling back transaction abandoned by a dropped scope");
            return self.rollback(cx).await;
        }
        Outcome::Ok(())
    }

    /// Execute a write statement inside the session's transaction.
    pub(crate) async fn execute(&mut self, cx: &Cx, stmt: &Statement) -> Outcome<u64, Error> {
        try_outcome!(self.settle_pending_rollback(cx).await);
        try_outcome!(self.begin(cx).await);
        self.connection.execute(cx, stmt).await
    }

    /// Flush pending changes to the store.
    ///
    /// Inserts pending objects in the order they were added, then updates
    /// persistent objects whose row differs from their snapshot, then deletes.
    /// Does not commit.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.settle_pending_rollback(cx).await);
        try_result!(self.callbacks.fire(SessionEvent::BeforeFlush));

        let inserts = std::mem::take(&mut self.pending_new);
        for (i, id) in inserts.iter().enumerate() {
            match self.flush_insert(cx, *id).await {
                Outcome::Ok(()) => {}
                failure => {
                    restore_pending(&mut self.pending_new, &inserts[i..]);
                    return failure;
                }
            }
        }

        let mut dirty: Vec<(u64, usize)> = self
            .objects
            .iter()
            .filter(|(_, t)| matches!(t.state, ObjectState::Persistent | ObjectState::Expired))
            .map(|(id, t)| (t.seq, *id))
            .collect();
        dirty.sort_unstable();
        for (_, id) in dirty {
            try_outcome!(self.flush_update(cx, id).await);
        }

        let deletes = std::mem::take(&mut self.pending_delete);
        for (i, id) in deletes.iter().enumerate() {
            match self.flush_delete(cx, *id).await {
                Outcome::Ok(()) => {}
                failure => {
                    restore_pending(&mut self.pending_delete, &deletes[i..]);
                    return failure;
                }
            }
        }

        try_result!(self.callbacks.fire(SessionEvent::AfterFlush));
        Outcome::Ok(())
    }

    async fn flush_insert(&mut self, cx: &Cx, id: usize) -> Outcome<(), Error> {
        let Some(obj) = self
            .objects
            .get(&id)
            .filter(|t| t.state == ObjectState::New)
            .map(|t| t.obj.clone())
        else {
            return Outcome::Ok(());
        };

        try_result!(self.events.fire(EventKind::BeforeInsert, &obj, None));
        try_outcome!(self.begin(cx).await);

        let mut values = obj.to_row();
        let mut returning = None;
        if obj.auto_increment() {
            if let Some(pk) = obj.primary_key_columns().first().copied() {
                let unset = values
                    .iter()
                    .find(|(c, _)| *c == pk)
                    .is_none_or(|(_, v)| v.is_null());
                if unset {
                    values.retain(|(c, _)| *c != pk);
                    returning = Some(pk);
                }
            }
        }
        let stmt = Statement::Insert(Insert {
            table: obj.table_name(),
            values,
            returning,
        });
        let generated = try_outcome!(self.connection.insert(cx, &stmt).await);
        if let Some(generated) = generated {
            let mut pk = obj.primary_key_value();
            if let Some(first) = pk.first_mut() {
                *first = generated;
            }
            try_result!(obj.set_primary_key_value(&pk));
        }

        let key = IdentityKey::of(&obj);
        if let Some(key) = &key {
            self.identity_map.insert(key.clone(), id);
        }
        if let Some(tracked) = self.objects.get_mut(&id) {
            tracked.state = ObjectState::Persistent;
            tracked.snapshot = Some(obj.to_row());
            tracked.key = key;
        }
        self.txn_inserted.push(id);
        tracing::trace!(model = obj.model_name(), "Inserted object");

        try_result!(self.events.fire(EventKind::AfterInsert, &obj, None));
        Outcome::Ok(())
    }

    async fn flush_update(&mut self, cx: &Cx, id: usize) -> Outcome<(), Error> {
        let Some((obj, snapshot)) = self
            .objects
            .get(&id)
            .map(|t| (t.obj.clone(), t.snapshot.clone()))
        else {
            return Outcome::Ok(());
        };
        let Some(before) = snapshot else {
            return Outcome::Ok(());
        };
        if changed_columns(&before, &obj.to_row()).is_empty() {
            return Outcome::Ok(());
        }

        try_result!(self.events.fire(EventKind::BeforeUpdate, &obj, None));
        let after = obj.to_row();
        let changed = changed_columns(&before, &after);
        if changed.is_empty() {
            return Outcome::Ok(());
        }
        let Some(filter) = snapshot_filter(&obj, Some(&before)) else {
            return Outcome::Ok(());
        };

        let values = after
            .iter()
            .filter(|(c, _)| changed.contains(c))
            .cloned()
            .collect();
        let stmt = Statement::Update(Update {
            table: obj.table_name(),
            values,
            filter,
        });
        let count = try_outcome!(self.execute(cx, &stmt).await);
        if count == 0 {
            return Outcome::Err(Error::Query(
                QueryError::new(
                    QueryErrorKind::NotFound,
                    format!("{} row to update no longer exists", obj.model_name()),
                )
                .with_sql(stmt.to_sql().0),
            ));
        }

        self.txn_snapshots
            .entry(id)
            .or_insert_with(|| Some(before.clone()));
        let key = IdentityKey::of(&obj);
        if let Some(tracked) = self.objects.get_mut(&id) {
            tracked.snapshot = Some(after);
            if tracked.key != key {
                if let Some(old) = tracked.key.take() {
                    self.identity_map.remove(&old);
                }
                if let Some(new) = &key {
                    self.identity_map.insert(new.clone(), id);
                }
                tracked.key = key;
            }
        }
        tracing::trace!(model = obj.model_name(), columns = ?changed, "Updated object");

        for column in &changed {
            try_result!(self.events.fire(EventKind::Modified, &obj, Some(column)));
        }
        try_result!(self.events.fire(EventKind::AfterUpdate, &obj, None));
        Outcome::Ok(())
    }

    async fn flush_delete(&mut self, cx: &Cx, id: usize) -> Outcome<(), Error> {
        let Some((obj, snapshot)) = self
            .objects
            .get(&id)
            .filter(|t| t.state == ObjectState::Deleted)
            .map(|t| (t.obj.clone(), t.snapshot.clone()))
        else {
            return Outcome::Ok(());
        };

        try_result!(self.events.fire(EventKind::BeforeDelete, &obj, None));
        if let Some(filter) = snapshot_filter(&obj, snapshot.as_ref()) {
            try_outcome!(
                self.execute(cx, &Statement::delete(obj.table_name(), filter))
                    .await
            );
        }
        self.forget(id);
        tracing::trace!(model = obj.model_name(), "Deleted object");
        try_result!(self.events.fire(EventKind::AfterDelete, &obj, None));
        Outcome::Ok(())
    }

    /// Flush and commit the current transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.flush(cx).await);
        try_result!(self.callbacks.fire(SessionEvent::BeforeCommit));

        if self.in_transaction {
            try_outcome!(self.connection.commit(cx).await);
            self.in_transaction = false;
        }
        tracing::debug!("Committed session transaction");

        self.txn_snapshots.clear();
        self.txn_inserted.clear();
        if self.config.expire_on_commit {
            for tracked in self.objects.values_mut() {
                if tracked.state == ObjectState::Persistent {
                    tracked.state = ObjectState::Expired;
                }
            }
        }

        try_result!(self.callbacks.fire(SessionEvent::AfterCommit));
        Outcome::Ok(())
    }

    /// Roll back the current transaction.
    ///
    /// Pending objects and objects inserted by the transaction are detached,
    /// pending deletes are cancelled, and updated objects get their
    /// pre-transaction snapshots back.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.scope.lock().rollback_pending = false;
        if self.in_transaction {
            try_outcome!(self.connection.rollback(cx).await);
            self.in_transaction = false;
        }
        tracing::debug!(
            pending = self.pending_new.len(),
            inserted = self.txn_inserted.len(),
            "Rolled back session transaction"
        );

        for id in std::mem::take(&mut self.pending_new) {
            self.forget(id);
        }
        for id in std::mem::take(&mut self.txn_inserted) {
            self.forget(id);
        }
        self.pending_delete.clear();
        for (id, snapshot) in std::mem::take(&mut self.txn_snapshots) {
            if let Some(tracked) = self.objects.get_mut(&id) {
                tracked.snapshot = snapshot;
            }
        }
        for tracked in self.objects.values_mut() {
            if tracked.state == ObjectState::Deleted {
                tracked.state = ObjectState::Persistent;
            }
        }

        try_result!(self.callbacks.fire(SessionEvent::AfterRollback));
        Outcome::Ok(())
    }

    /// Reject objects whose type is not mapped or not registered.
    pub(crate) fn check_mapped(&self, index: usize, obj: &AnyObj) -> Result<(), Error> {
        let registered = self
            .models
            .as_ref()
            .is_none_or(|models| models.contains_type(obj.model_type()));
        if obj.is_mapped() && registered {
            return Ok(());
        }
        Err(Error::Validation(
            sqlservice_core::ValidationError::new(
                ValidationErrorKind::UnmappedType,
                format!("{obj:?} is not an instance of a mapped entity type"),
            )
            .at(index),
        ))
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
