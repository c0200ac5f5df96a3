//! Data-store connection trait.
//!
//! A session owns one [`Connection`] and drives a single transaction on it at
//! a time: `begin`, any number of statements, then `commit` or `rollback`.
//! Statements issued outside a transaction run in autocommit mode.

use crate::error::Error;
use crate::row::Row;
use crate::statement::Statement;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A connection to a data store.
///
/// All operations integrate with asupersync's `Cx` context and return
/// `Outcome` so that cancellation and panics propagate distinctly from
/// data-store errors.
///
/// # Example
///
/// ```rust,ignore
/// conn.begin(&cx).await?;
/// conn.execute(&cx, &Statement::delete("logs", Filter::eq("id", 1_i64))).await?;
/// conn.commit(&cx).await?;
/// ```
pub trait Connection: Send + Sync {
    /// Run a `SELECT` and return all matching rows.
    fn query(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Run an `UPDATE` or `DELETE` and return the number of rows affected.
    fn execute(&self, cx: &Cx, stmt: &Statement) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Run an `INSERT`.
    ///
    /// Returns the store-generated value of the insert's `returning` column,
    /// or `None` when nothing was generated.
    fn insert(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
