//! Per-model lifecycle event listeners.
//!
//! Listeners are registered once per mapped type through
//! [`EventRegistry::register`] and fired by the session while it flushes.
//! Mapper events (`BeforeInsert`, `AfterUpdate`, ...) fire once per object
//! per statement; [`EventKind::Modified`] fires once per changed column of
//! an updated object.

use crate::Result;
use crate::error::{Error, ValidationErrorKind};
use crate::model::Model;
use crate::object::{AnyObj, Obj};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lifecycle events a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    /// A column value changed; the listener names the column
    Modified,
}

impl EventKind {
    /// The events a "before save" listener is attached to.
    pub const BEFORE_SAVE: [EventKind; 2] = [EventKind::BeforeInsert, EventKind::BeforeUpdate];

    /// The events an "after save" listener is attached to.
    pub const AFTER_SAVE: [EventKind; 2] = [EventKind::AfterInsert, EventKind::AfterUpdate];

    /// Whether listeners for this kind must name a column.
    pub const fn is_attribute_event(self) -> bool {
        matches!(self, EventKind::Modified)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::BeforeInsert => "before_insert",
            EventKind::AfterInsert => "after_insert",
            EventKind::BeforeUpdate => "before_update",
            EventKind::AfterUpdate => "after_update",
            EventKind::BeforeDelete => "before_delete",
            EventKind::AfterDelete => "after_delete",
            EventKind::Modified => "modified",
        };
        f.write_str(name)
    }
}

/// A typed listener as written by callers.
pub type ModelHandler<M> = Arc<dyn Fn(&Obj<M>) -> Result<()> + Send + Sync>;

type ErasedHandler = Arc<dyn Fn(&AnyObj) -> Result<()> + Send + Sync>;

/// One listener declaration for [`EventRegistry::register`].
pub struct EventSpec<M: Model> {
    kind: EventKind,
    field: Option<&'static str>,
    handler: ModelHandler<M>,
}

impl<M: Model> EventSpec<M> {
    /// A mapper event listener.
    pub fn new(kind: EventKind, handler: impl Fn(&Obj<M>) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            kind,
            field: None,
            handler: Arc::new(handler),
        }
    }

    /// A listener for changes to one column.
    pub fn modified(
        field: &'static str,
        handler: impl Fn(&Obj<M>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: EventKind::Modified,
            field: Some(field),
            handler: Arc::new(handler),
        }
    }

    /// One listener attached to every kind in `kinds`, e.g. [`EventKind::BEFORE_SAVE`].
    pub fn each(
        kinds: &[EventKind],
        handler: impl Fn(&Obj<M>) -> Result<()> + Send + Sync + 'static,
    ) -> Vec<Self> {
        let handler: ModelHandler<M> = Arc::new(handler);
        kinds
            .iter()
            .map(|kind| Self {
                kind: *kind,
                field: None,
                handler: Arc::clone(&handler),
            })
            .collect()
    }
}

struct Listener {
    kind: EventKind,
    field: Option<&'static str>,
    handler: ErasedHandler,
}

/// Listeners for every registered model type.
#[derive(Default)]
pub struct EventRegistry {
    listeners: HashMap<TypeId, Vec<Listener>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all listeners for `M`.
    ///
    /// Registration happens once per type; a second call for the same type
    /// is rejected, as is a column listener without a column or a mapper
    /// listener with one.
    pub fn register<M: Model>(&mut self, specs: Vec<EventSpec<M>>) -> Result<()> {
        let type_id = TypeId::of::<M>();
        if self.listeners.contains_key(&type_id) {
            return Err(Error::validation(
                ValidationErrorKind::Registration,
                format!("events for {} are already registered", M::model_name()),
            ));
        }

        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            if spec.kind.is_attribute_event() != spec.field.is_some() {
                return Err(Error::validation(
                    ValidationErrorKind::Registration,
                    format!("invalid {} listener on {}", spec.kind, M::model_name()),
                ));
            }
            let handler = spec.handler;
            listeners.push(Listener {
                kind: spec.kind,
                field: spec.field,
                handler: Arc::new(move |obj: &AnyObj| match obj.downcast::<M>() {
                    Some(typed) => handler(&typed),
                    None => Ok(()),
                }),
            });
        }

        tracing::debug!(
            model = M::model_name(),
            listeners = listeners.len(),
            "Registered model events"
        );
        self.listeners.insert(type_id, listeners);
        Ok(())
    }

    /// Run every listener of `kind` registered for the object's type.
    ///
    /// For [`EventKind::Modified`], only listeners naming `field` run.
    /// The first listener error stops the remaining listeners.
    pub fn fire(&self, kind: EventKind, obj: &AnyObj, field: Option<&str>) -> Result<()> {
        let Some(listeners) = self.listeners.get(&obj.model_type()) else {
            return Ok(());
        };
        for listener in listeners
            .iter()
            .filter(|l| l.kind == kind && (!kind.is_attribute_event() || l.field == field))
        {
            tracing::trace!(model = obj.model_name(), event = %kind, "Firing event");
            (listener.handler)(obj)?;
        }
        Ok(())
    }

    /// Whether any listener is registered for `M`.
    pub fn is_registered<M: Model>(&self) -> bool {
        self.listeners.contains_key(&TypeId::of::<M>())
    }

    /// Number of listeners of `kind` registered for `M`.
    pub fn count<M: Model>(&self, kind: EventKind) -> usize {
        self.listeners
            .get(&TypeId::of::<M>())
            .map_or(0, |ls| ls.iter().filter(|l| l.kind == kind).count())
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("models", &self.listeners.len())
            .finish()
    }
}
