//! In-memory data store for sqlservice.
//!
//! `MemoryConnection` evaluates [`Statement`]s directly against tables held
//! in memory. It is a complete [`Connection`]: transactions read and write a
//! private working copy, and commit replays the transaction's writes against
//! the committed state, so a row committed by someone else in the meantime
//! surfaces as a constraint violation at commit time just as it would on a
//! real database.
//!
//! Clones share the same store, which lets tests inspect committed state
//! while a session owns the connection.

use asupersync::{Cx, Outcome};
use parking_lot::Mutex;
use sqlservice_core::error::{QueryError, QueryErrorKind, TransactionError, TransactionErrorKind};
use sqlservice_core::{
    Connection, Delete, Error, Filter, Insert, Model, Row, Select, Statement, Update, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Statement and transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub queries: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

#[derive(Debug, Clone)]
struct Table {
    primary_key: Vec<&'static str>,
    auto_increment: bool,
    next_id: i64,
    rows: Vec<Vec<(String, Value)>>,
}

impl Table {
    fn row(values: &[(String, Value)]) -> Row {
        Row::new(
            values.iter().map(|(c, _)| c.clone()).collect(),
            values.iter().map(|(_, v)| v.clone()).collect(),
        )
    }

    fn key_of(&self, values: &[(String, Value)]) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|pk| {
                values
                    .iter()
                    .find(|(c, _)| c == pk)
                    .map_or(Value::Null, |(_, v)| v.clone())
            })
            .collect()
    }

    fn has_key(&self, key: &[Value]) -> bool {
        self.rows.iter().any(|row| same_key(&self.key_of(row), key))
    }
}

fn same_key(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| !x.is_null() && x.key_eq(y))
}

type Tables = BTreeMap<&'static str, Table>;

#[derive(Debug, Default)]
struct MemoryState {
    committed: Tables,
    /// Working copy and write log of the open transaction
    transaction: Option<(Tables, Vec<Statement>)>,
    stats: MemoryStats,
    log: Vec<String>,
}

fn constraint(message: String, stmt: &Statement) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Constraint, message).with_sql(stmt.to_sql().0))
}

fn table_mut<'a>(tables: &'a mut Tables, stmt: &Statement) -> Result<&'a mut Table, Error> {
    let name = stmt.table();
    tables.get_mut(name).ok_or_else(|| {
        Error::Query(
            QueryError::new(QueryErrorKind::NotFound, format!("no such table: {name}"))
                .with_sql(stmt.to_sql().0),
        )
    })
}

fn apply_select(tables: &mut Tables, stmt: &Statement, select: &Select) -> Result<Vec<Row>, Error> {
    let table = table_mut(tables, stmt)?;
    let rows = table
        .rows
        .iter()
        .map(|values| Table::row(values))
        .filter(|row| select.filter.as_ref().is_none_or(|f| f.matches(row)))
        .take(select.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(rows)
}

fn apply_insert(
    tables: &mut Tables,
    stmt: &Statement,
    insert: &Insert,
) -> Result<Option<Value>, Error> {
    let table = table_mut(tables, stmt)?;
    let mut values: Vec<(String, Value)> = insert
        .values
        .iter()
        .map(|(c, v)| ((*c).to_string(), v.clone()))
        .collect();

    let mut generated = None;
    if table.auto_increment {
        if let Some(pk) = table.primary_key.first().copied() {
            match values.iter_mut().find(|(c, _)| c == pk) {
                Some((_, v)) if !v.is_null() => {
                    if let Some(id) = v.as_i64() {
                        table.next_id = table.next_id.max(id.saturating_add(1));
                    }
                }
                slot => {
                    let id = Value::BigInt(table.next_id);
                    table.next_id = table.next_id.saturating_add(1);
                    match slot {
                        Some((_, v)) => *v = id.clone(),
                        None => values.push((pk.to_string(), id.clone())),
                    }
                    generated = Some(id);
                }
            }
        }
    }

    let key = table.key_of(&values);
    if key.iter().any(Value::is_null) {
        return Err(constraint(
            format!("NOT NULL constraint failed: {}", stmt.table()),
            stmt,
        ));
    }
    if table.has_key(&key) {
        return Err(constraint(
            format!("UNIQUE constraint failed: {} primary key", stmt.table()),
            stmt,
        ));
    }
    table.rows.push(values);
    Ok(generated)
}

fn apply_update(tables: &mut Tables, stmt: &Statement, update: &Update) -> Result<u64, Error> {
    let table = table_mut(tables, stmt)?;
    let mut changed = table.rows.clone();
    let mut count = 0;
    for row in &mut changed {
        if !update.filter.matches(&Table::row(row)) {
            continue;
        }
        for (column, value) in &update.values {
            match row.iter_mut().find(|(c, _)| c == column) {
                Some((_, v)) => *v = value.clone(),
                None => row.push(((*column).to_string(), value.clone())),
            }
        }
        count += 1;
    }
    let keys: Vec<Vec<Value>> = changed.iter().map(|row| table.key_of(row)).collect();
    for (i, key) in keys.iter().enumerate() {
        if keys[..i].iter().any(|other| same_key(other, key)) {
            return Err(constraint(
                format!("UNIQUE constraint failed: {} primary key", stmt.table()),
                stmt,
            ));
        }
    }
    table.rows = changed;
    Ok(count)
}

fn apply_delete(tables: &mut Tables, stmt: &Statement, delete: &Delete) -> Result<u64, Error> {
    let table = table_mut(tables, stmt)?;
    let before = table.rows.len();
    table
        .rows
        .retain(|values| !delete.filter.matches(&Table::row(values)));
    Ok((before - table.rows.len()) as u64)
}

/// Apply one write statement, returning rows affected and any generated key.
fn apply_write(tables: &mut Tables, stmt: &Statement) -> Result<(u64, Option<Value>), Error> {
    match stmt {
        Statement::Insert(insert) => apply_insert(tables, stmt, insert).map(|g| (1, g)),
        Statement::Update(update) => apply_update(tables, stmt, update).map(|n| (n, None)),
        Statement::Delete(delete) => apply_delete(tables, stmt, delete).map(|n| (n, None)),
        Statement::Select(_) => Ok((0, None)),
    }
}

/// The logged form of an insert whose key the store generated.
///
/// Commit replays the log, so the key handed back to the caller must be the
/// key replayed; a row committed under it in the meantime then fails the
/// commit instead of silently shifting this row to a new key.
fn with_generated_key(tables: &Tables, stmt: &Statement, id: &Value) -> Statement {
    let (Statement::Insert(insert), Some(pk)) = (
        stmt,
        tables
            .get(stmt.table())
            .and_then(|t| t.primary_key.first().copied()),
    ) else {
        return stmt.clone();
    };
    let mut values = insert.values.clone();
    match values.iter_mut().find(|(c, _)| *c == pk) {
        Some((_, v)) => *v = id.clone(),
        None => values.push((pk, id.clone())),
    }
    Statement::Insert(Insert {
        table: insert.table,
        values,
        returning: insert.returning,
    })
}

/// A connection to an in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the table for `M`.
    pub fn create_table<M: Model>(&self) {
        self.create_table_raw(M::TABLE_NAME, M::PRIMARY_KEY, M::AUTO_INCREMENT);
    }

    /// Create a table by name. An existing table of that name is replaced.
    pub fn create_table_raw(
        &self,
        name: &'static str,
        primary_key: &[&'static str],
        auto_increment: bool,
    ) {
        let mut state = self.state.lock();
        state.committed.insert(
            name,
            Table {
                primary_key: primary_key.to_vec(),
                auto_increment,
                next_id: 1,
                rows: Vec::new(),
            },
        );
        tracing::debug!(table = name, "Created in-memory table");
    }

    /// Insert a row directly into committed state, bypassing any open
    /// transaction. Models a concurrent writer.
    pub fn insert_committed(
        &self,
        table: &'static str,
        values: Vec<(&'static str, Value)>,
    ) -> Result<(), Error> {
        let stmt = Statement::Insert(Insert {
            table,
            values,
            returning: None,
        });
        let mut state = self.state.lock();
        apply_write(&mut state.committed, &stmt).map(|_| ())
    }

    /// Committed rows of `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock();
        state
            .committed
            .get(table)
            .map(|t| t.rows.iter().map(|values| Table::row(values)).collect())
            .unwrap_or_default()
    }

    /// Number of committed rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock();
        state.committed.get(table).map_or(0, |t| t.rows.len())
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.stats = MemoryStats::default();
        state.log.clear();
    }

    /// SQL text of every statement executed so far.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().transaction.is_some()
    }

    fn run<T>(
        &self,
        cx: &Cx,
        stmt: Option<&Statement>,
        op: impl FnOnce(&mut MemoryState) -> Result<T, Error>,
    ) -> Outcome<T, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let mut state = self.state.lock();
        if let Some(stmt) = stmt {
            let sql = stmt.to_sql().0;
            tracing::trace!(sql = %sql, "Executing statement");
            state.log.push(sql);
        }
        match op(&mut *state) {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }

    fn write(&self, cx: &Cx, stmt: &Statement) -> Outcome<(u64, Option<Value>), Error> {
        self.run(cx, Some(stmt), |state| {
            match stmt {
                Statement::Insert(_) => state.stats.inserts += 1,
                Statement::Update(_) => state.stats.updates += 1,
                Statement::Delete(_) => state.stats.deletes += 1,
                Statement::Select(_) => state.stats.queries += 1,
            }
            match &mut state.transaction {
                Some((working, writes)) => {
                    let result = apply_write(working, stmt)?;
                    writes.push(match &result.1 {
                        Some(id) => with_generated_key(working, stmt, id),
                        None => stmt.clone(),
                    });
                    Ok(result)
                }
                None => apply_write(&mut state.committed, stmt),
            }
        })
    }
}

fn not_active(action: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("cannot {action}: no transaction is active"),
    })
}

impl Connection for MemoryConnection {
    fn query(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = self.run(cx, Some(stmt), |state| {
            state.stats.queries += 1;
            let Statement::Select(select) = stmt else {
                return Err(Error::Custom(format!("not a query: {stmt}")));
            };
            let tables = match &mut state.transaction {
                Some((working, _)) => working,
                None => &mut state.committed,
            };
            apply_select(tables, stmt, select)
        });
        std::future::ready(outcome)
    }

    fn execute(&self, cx: &Cx, stmt: &Statement) -> impl Future<Output = Outcome<u64, Error>> + Send {
        std::future::ready(self.write(cx, stmt).map(|(count, _)| count))
    }

    fn insert(
        &self,
        cx: &Cx,
        stmt: &Statement,
    ) -> impl Future<Output = Outcome<Option<Value>, Error>> + Send {
        std::future::ready(self.write(cx, stmt).map(|(_, generated)| generated))
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, None, |state| {
            if state.transaction.is_some() {
                return Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::AlreadyActive,
                    message: "a transaction is already active".to_string(),
                }));
            }
            state.stats.begins += 1;
            state.log.push("BEGIN".to_string());
            state.transaction = Some((state.committed.clone(), Vec::new()));
            Ok(())
        });
        std::future::ready(outcome)
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, None, |state| {
            let Some((_, writes)) = &state.transaction else {
                return Err(not_active("commit"));
            };
            state.log.push("COMMIT".to_string());
            let mut replayed = state.committed.clone();
            for stmt in writes {
                apply_write(&mut replayed, stmt)?;
            }
            state.committed = replayed;
            state.transaction = None;
            state.stats.commits += 1;
            Ok(())
        });
        std::future::ready(outcome)
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let outcome = self.run(cx, None, |state| {
            if state.transaction.take().is_none() {
                return Err(not_active("roll back"));
            }
            state.log.push("ROLLBACK".to_string());
            state.stats.rollbacks += 1;
            Ok(())
        });
        std::future::ready(outcome)
    }
}
