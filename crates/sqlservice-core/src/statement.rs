//! Statements issued by a session against a [`Connection`](crate::Connection).
//!
//! Statements are plain data: a driver may render them to SQL with
//! [`Statement::to_sql`] or evaluate them directly, as the in-memory
//! driver does with [`Filter::matches`].

use crate::row::Row;
use crate::value::Value;
use std::fmt;

/// A boolean predicate over the columns of one table.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(&'static str, Value),
    /// `column IN (values...)`
    In(&'static str, Vec<Value>),
    /// `column IS NULL`
    IsNull(&'static str),
    /// Every inner filter holds. An empty conjunction is true.
    And(Vec<Filter>),
    /// Any inner filter holds. An empty disjunction is false.
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Filter::Eq(column, value.into())
    }

    pub fn in_list(column: &'static str, values: Vec<Value>) -> Self {
        Filter::In(column, values)
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    /// Evaluate the filter against a row.
    ///
    /// Comparisons follow SQL three-valued logic closely enough for
    /// identity lookups: a NULL never equals anything.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row
                .get_by_name(column)
                .is_some_and(|v| !v.is_null() && v.key_eq(value)),
            Filter::In(column, values) => row
                .get_by_name(column)
                .is_some_and(|v| !v.is_null() && values.iter().any(|x| v.key_eq(x))),
            Filter::IsNull(column) => row.get_by_name(column).is_none_or(Value::is_null),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
        }
    }

    fn render(&self, params: &mut Vec<Value>) -> String {
        match self {
            Filter::Eq(column, value) => {
                params.push(value.clone());
                format!("{} = ${}", quote(column), params.len())
            }
            Filter::In(column, values) => {
                if values.is_empty() {
                    return "1 = 0".to_string();
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                format!("{} IN ({})", quote(column), placeholders.join(", "))
            }
            Filter::IsNull(column) => format!("{} IS NULL", quote(column)),
            Filter::And(filters) => join(filters, " AND ", "1 = 1", params),
            Filter::Or(filters) => join(filters, " OR ", "1 = 0", params),
        }
    }
}

fn join(filters: &[Filter], sep: &str, empty: &str, params: &mut Vec<Value>) -> String {
    match filters {
        [] => empty.to_string(),
        [single] => single.render(params),
        many => {
            let parts: Vec<String> = many
                .iter()
                .map(|f| match f {
                    Filter::And(inner) | Filter::Or(inner) if inner.len() > 1 => {
                        format!("({})", f.render(params))
                    }
                    _ => f.render(params),
                })
                .collect();
            parts.join(sep)
        }
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: &'static str,
    pub filter: Option<Filter>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: &'static str,
    pub values: Vec<(&'static str, Value)>,
    /// Column whose store-generated value should be reported back
    pub returning: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: &'static str,
    pub values: Vec<(&'static str, Value)>,
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: &'static str,
    pub filter: Filter,
}

/// A single data-store statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Select),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Statement {
    pub fn select(table: &'static str, filter: Option<Filter>) -> Self {
        Statement::Select(Select {
            table,
            filter,
            limit: None,
        })
    }

    pub fn delete(table: &'static str, filter: Filter) -> Self {
        Statement::Delete(Delete { table, filter })
    }

    /// Table the statement targets.
    pub fn table(&self) -> &'static str {
        match self {
            Statement::Select(s) => s.table,
            Statement::Insert(s) => s.table,
            Statement::Update(s) => s.table,
            Statement::Delete(s) => s.table,
        }
    }

    /// Render to SQL text with `$n` placeholders and the bound parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = match self {
            Statement::Select(s) => {
                let mut sql = format!("SELECT * FROM {}", quote(s.table));
                if let Some(filter) = &s.filter {
                    sql.push_str(" WHERE ");
                    sql.push_str(&filter.render(&mut params));
                }
                if let Some(limit) = s.limit {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
                sql
            }
            Statement::Insert(s) => {
                let columns: Vec<String> = s.values.iter().map(|(c, _)| quote(c)).collect();
                let placeholders: Vec<String> = s
                    .values
                    .iter()
                    .map(|(_, v)| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                let mut sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(s.table),
                    columns.join(", "),
                    placeholders.join(", ")
                );
                if let Some(col) = s.returning {
                    sql.push_str(&format!(" RETURNING {}", quote(col)));
                }
                sql
            }
            Statement::Update(s) => {
                let sets: Vec<String> = s
                    .values
                    .iter()
                    .map(|(c, v)| {
                        params.push(v.clone());
                        format!("{} = ${}", quote(c), params.len())
                    })
                    .collect();
                let filter = s.filter.render(&mut params);
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote(s.table),
                    sets.join(", "),
                    filter
                )
            }
            Statement::Delete(s) => {
                let filter = s.filter.render(&mut params);
                format!("DELETE FROM {} WHERE {}", quote(s.table), filter)
            }
        };
        (sql, params)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql().0)
    }
}
