//! Core types and traits for sqlservice.
//!
//! This crate provides the foundations shared by the session and the drivers:
//!
//! - `Model` trait for mapping structs to tables
//! - `Obj` / `AnyObj` shared object handles with instance identity
//! - `Identity` resolution over primary keys or arbitrary column sets
//! - `Statement` / `Filter` plain-data statements
//! - `Connection` trait for data stores
//! - Per-model event listeners and the model registry
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod event;
pub mod identity;
pub mod model;
pub mod object;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::Connection;
pub use error::{
    Error, QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError,
    ValidationError, ValidationErrorKind,
};
pub use event::{EventKind, EventRegistry, EventSpec, ModelHandler};
pub use identity::{
    Identity, IdentityFn, identities_filter, identity, identity_filter, identity_value, make_identity,
    primary_identity, primary_key_filter,
};
pub use model::{Model, ModelConfig};
pub use object::{AnyObj, Entity, Obj, ObjectCell, instantiate};
pub use registry::{ModelMeta, ModelRegistry};
pub use relationship::{LoadPlan, Loaded, RelatedMany, Related, RelationState};
pub use row::{ColumnInfo, Row};
pub use statement::{Delete, Filter, Insert, Select, Statement, Update};
pub use value::Value;

/// Unwrap an `Outcome`, returning early from the enclosing function on
/// anything other than `Ok`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            ::std::result::Result::Ok(value) => value,
            ::std::result::Result::Err(err) => {
                return $crate::Outcome::Err(::std::convert::From::from(err));
            }
        }
    };
}
