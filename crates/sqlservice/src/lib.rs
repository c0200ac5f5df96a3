//! sqlservice - transactions, batch upserts and graph serialization on top of
//! a unit of work.
//!
//! sqlservice layers three pieces of logic over a [`Session`]:
//!
//! - Nestable transaction scopes that commit once, at the outermost scope,
//!   and roll back once, at the first scope that sees a failure
//! - Batch save that inserts new objects and merges objects whose identity
//!   already exists, with one pre-fetch query per entity type
//! - A cycle-safe serializer from loaded object graphs to JSON maps
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlservice::prelude::*;
//!
//! async fn example(cx: &Cx, conn: MemoryConnection) -> Outcome<(), Error> {
//!     let mut session = Session::new(conn);
//!
//!     // Insert or merge, then commit once.
//!     let heroes = vec![
//!         Obj::new(Hero { id: None, name: "Deadpond".into() }),
//!         Obj::new(Hero { id: Some(7), name: "Rusty-Man".into() }),
//!     ];
//!     let saved = session.save_all(cx, &heroes).await;
//!
//!     // Several operations, one commit.
//!     session
//!         .transaction(cx, ScopeOptions::default(), |s, cx| {
//!             Box::pin(async move {
//!                 try_outcome!(s.save_one(cx, &heroes[0]).await);
//!                 s.destroy_keys::<Hero>(cx, &[vec![Value::BigInt(7)]]).await
//!             })
//!         })
//!         .await;
//!
//!     let dict = heroes[0].to_dict();
//!     Outcome::Ok(())
//! }
//! ```

pub mod serialize;

pub use serialize::{Dict, GraphSerializer, ModelExt, SerializeOptions, to_dict_loaded};

pub use sqlservice_core::{
    AnyObj,
    // Core types
    Connection,
    Cx,
    Entity,
    Error,
    // Events and registration
    EventKind,
    EventRegistry,
    EventSpec,
    Filter,
    // Identity
    Identity,
    IdentityFn,
    Loaded,
    Model,
    ModelConfig,
    ModelRegistry,
    Obj,
    Outcome,
    // Relationships
    Related,
    RelatedMany,
    RelationState,
    Result,
    Row,
    Statement,
    ValidationError,
    ValidationErrorKind,
    Value,
    identities_filter,
    identity,
    identity_filter,
    identity_value,
    make_identity,
    primary_identity,
    primary_key_filter,
    try_outcome,
    try_result,
};
pub use sqlservice_memory::{MemoryConnection, MemoryStats};
pub use sqlservice_session::{
    Batch, BulkCounts, Mapping, ObjectState, SaveHook, SaveOptions, ScopeGuard, ScopeOptions, Session, SessionConfig,
    SessionDebugInfo, SessionEvent,
};

/// Common imports.
pub mod prelude {
    pub use crate::{
        AnyObj,
        Batch,
        Connection,
        Cx,
        Error,
        Filter,
        MemoryConnection,
        Model,
        ModelExt,
        Obj,
        Outcome,
        Related,
        RelatedMany,
        Result,
        Row,
        SaveOptions,
        ScopeOptions,
        SerializeOptions,
        Session,
        Value,
    };
}
