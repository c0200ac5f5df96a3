//! Bulk writes from plain column mappings.
//!
//! These operations build INSERT and UPDATE statements straight from
//! `(column, value)` lists. They bypass the unit of work: no objects are
//! tracked, no model events fire, and objects already tracked for the same
//! rows are not refreshed.

use crate::Session;
use crate::transaction::ScopeOptions;
use asupersync::{Cx, Outcome};
use sqlservice_core::{
    Connection, Error, Identity, Insert, Model, Statement, Update, ValidationError,
    ValidationErrorKind, Value, identities_filter, try_outcome, try_result,
};
use std::collections::HashMap;

/// One row's worth of column values.
pub type Mapping = Vec<(&'static str, Value)>;

/// Rows written by [`Session::bulk_diff_update`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkCounts {
    pub inserted: u64,
    /// Rows updated per shared value-set, in first-seen order
    pub updated: Vec<u64>,
}

impl BulkCounts {
    pub fn total_updated(&self) -> u64 {
        self.updated.iter().sum()
    }
}

/// Non-key values shared by a set of rows, with the identities of those rows.
struct UpdateGroup {
    values: Mapping,
    identities: Vec<Identity>,
}

fn lookup<'m>(mapping: &'m [(&'static str, Value)], column: &str) -> Option<&'m Value> {
    mapping.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
}

fn mapping_identity(mapping: &[(&'static str, Value)], key_columns: &[&'static str]) -> Option<Identity> {
    Identity::new(
        key_columns
            .iter()
            .map(|column| (*column, lookup(mapping, column).cloned().unwrap_or(Value::Null)))
            .collect(),
    )
}

fn check_target<M: Model>(key_columns: &[&'static str]) -> Result<(), Error> {
    if !M::is_mapped() {
        return Err(Error::validation(
            ValidationErrorKind::UnmappedType,
            format!("{} is not a mapped entity type", M::model_name()),
        ));
    }
    if key_columns.is_empty() {
        return Err(Error::validation(
            ValidationErrorKind::MissingKey,
            "bulk update requires at least one key column",
        ));
    }
    Ok(())
}

/// Group mappings by their non-key values. Mappings carrying only key
/// columns have nothing to set and are dropped.
fn group_updates(
    key_columns: &[&'static str],
    mappings: &[Mapping],
) -> Result<Vec<UpdateGroup>, Error> {
    let mut groups: Vec<UpdateGroup> = Vec::new();
    for (index, mapping) in mappings.iter().enumerate() {
        let Some(identity) = mapping_identity(mapping, key_columns) else {
            return Err(ValidationError::new(
                ValidationErrorKind::MissingKey,
                format!("mapping has no value for key columns {key_columns:?}"),
            )
            .at(index)
            .into());
        };
        let values: Mapping = mapping
            .iter()
            .filter(|(column, _)| !key_columns.contains(column))
            .cloned()
            .collect();
        if values.is_empty() {
            continue;
        }
        match groups.iter_mut().find(|g| g.values == values) {
            Some(group) => group.identities.push(identity),
            None => groups.push(UpdateGroup {
                values,
                identities: vec![identity],
            }),
        }
    }
    Ok(groups)
}

impl<C: Connection> Session<C> {
    /// Insert every mapping into `M`'s table and commit.
    ///
    /// Returns the number of rows inserted.
    #[tracing::instrument(level = "debug", skip_all, fields(model = M::model_name(), rows = mappings.len()))]
    pub async fn bulk_insert<M: Model>(&mut self, cx: &Cx, mappings: &[Mapping]) -> Outcome<u64, Error> {
        if !M::is_mapped() {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::UnmappedType,
                format!("{} is not a mapped entity type", M::model_name()),
            ));
        }
        if mappings.is_empty() {
            return Outcome::Ok(0);
        }
        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self.insert_mappings(cx, M::TABLE_NAME, mappings).await;
        self.end_scope(cx, guard, outcome).await
    }

    /// Update rows of `M` identified by `key_columns`, issuing one UPDATE per
    /// distinct set of non-key values, and commit.
    ///
    /// Every mapping must carry a non-NULL value for each key column. Returns
    /// the rows updated by each statement.
    #[tracing::instrument(level = "debug", skip_all, fields(model = M::model_name(), rows = mappings.len()))]
    pub async fn bulk_common_update<M: Model>(
        &mut self,
        cx: &Cx,
        key_columns: &[&'static str],
        mappings: &[Mapping],
    ) -> Outcome<Vec<u64>, Error> {
        try_result!(check_target::<M>(key_columns));
        let groups = try_result!(group_updates(key_columns, mappings));
        if groups.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self.update_groups(cx, M::TABLE_NAME, groups).await;
        self.end_scope(cx, guard, outcome).await
    }

    /// Write the difference between `previous` and `mappings` and commit.
    ///
    /// Mappings are matched to previous ones by `key_columns`. A matched
    /// mapping is updated with only the columns whose value changed; an
    /// unmatched one is inserted whole. Updates go through the same grouping
    /// as [`Session::bulk_common_update`]. Nothing is executed, and no
    /// transaction is opened, when nothing differs.
    #[tracing::instrument(level = "debug", skip_all, fields(model = M::model_name(), rows = mappings.len()))]
    pub async fn bulk_diff_update<M: Model>(
        &mut self,
        cx: &Cx,
        key_columns: &[&'static str],
        previous: &[Mapping],
        mappings: &[Mapping],
    ) -> Outcome<BulkCounts, Error> {
        try_result!(check_target::<M>(key_columns));
        if mappings.is_empty() {
            return Outcome::Ok(BulkCounts::default());
        }

        let previous_by_key: HashMap<Identity, &Mapping> = previous
            .iter()
            .filter_map(|mapping| mapping_identity(mapping, key_columns).map(|id| (id, mapping)))
            .collect();

        let mut inserts: Vec<Mapping> = Vec::new();
        let mut updates: Vec<Mapping> = Vec::new();
        for mapping in mappings {
            let before = mapping_identity(mapping, key_columns).and_then(|id| previous_by_key.get(&id));
            let Some(before) = before else {
                inserts.push(mapping.clone());
                continue;
            };
            let changed = |column: &str, value: &Value| lookup(before, column) != Some(value);
            if !mapping.iter().any(|(c, v)| changed(c, v)) {
                continue;
            }
            updates.push(
                mapping
                    .iter()
                    .filter(|(c, v)| key_columns.contains(c) || changed(c, v))
                    .cloned()
                    .collect(),
            );
        }
        tracing::debug!(inserts = inserts.len(), updates = updates.len(), "Computed bulk diff");
        if inserts.is_empty() && updates.is_empty() {
            return Outcome::Ok(BulkCounts::default());
        }
        let groups = try_result!(group_updates(key_columns, &updates));

        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self.write_diff(cx, M::TABLE_NAME, groups, &inserts).await;
        self.end_scope(cx, guard, outcome).await
    }

    async fn write_diff(
        &mut self,
        cx: &Cx,
        table: &'static str,
        groups: Vec<UpdateGroup>,
        inserts: &[Mapping],
    ) -> Outcome<BulkCounts, Error> {
        let updated = try_outcome!(self.update_groups(cx, table, groups).await);
        let inserted = try_outcome!(self.insert_mappings(cx, table, inserts).await);
        Outcome::Ok(BulkCounts { inserted, updated })
    }

    async fn insert_mappings(
        &mut self,
        cx: &Cx,
        table: &'static str,
        mappings: &[Mapping],
    ) -> Outcome<u64, Error> {
        let mut inserted = 0;
        for mapping in mappings {
            let stmt = Statement::Insert(Insert {
                table,
                values: mapping.clone(),
                returning: None,
            });
            inserted += try_outcome!(self.execute(cx, &stmt).await);
        }
        Outcome::Ok(inserted)
    }

    async fn update_groups(
        &mut self,
        cx: &Cx,
        table: &'static str,
        groups: Vec<UpdateGroup>,
    ) -> Outcome<Vec<u64>, Error> {
        let mut counts = Vec::with_capacity(groups.len());
        for group in groups {
            let stmt = Statement::Update(Update {
                table,
                values: group.values,
                filter: identities_filter(&group.identities),
            });
            let count = try_outcome!(self.execute(cx, &stmt).await);
            tracing::trace!(table, count, "Bulk update");
            counts.push(count);
        }
        Outcome::Ok(counts)
    }
}
