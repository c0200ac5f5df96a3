//! Delete rows by primary key.

use crate::Session;
use crate::save::Batch;
use crate::transaction::ScopeOptions;
use asupersync::{Cx, Outcome};
use sqlservice_core::{
    AnyObj, Connection, Error, Model, Statement, ValidationErrorKind, Value, identity_filter,
    primary_identity, primary_key_filter, try_outcome, try_result,
};
use std::any::TypeId;

impl<C: Connection> Session<C> {
    /// Delete the rows behind a batch of objects and commit.
    ///
    /// Issues one DELETE per type. Objects without a primary key are
    /// skipped. Deleted objects stop being tracked. Returns the number of
    /// rows deleted.
    #[tracing::instrument(level = "debug", skip_all, fields(objects = batch.len()))]
    pub async fn destroy(&mut self, cx: &Cx, batch: Batch) -> Outcome<u64, Error> {
        let objects = batch.into_vec();
        if objects.is_empty() {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::EmptyBatch,
                "destroy requires at least one object",
            ));
        }
        for (index, obj) in objects.iter().enumerate() {
            try_result!(self.check_mapped(index, obj));
        }

        let mut groups: Vec<(TypeId, Vec<AnyObj>)> = Vec::new();
        for obj in objects {
            let type_id = obj.model_type();
            match groups.iter_mut().find(|(t, _)| *t == type_id) {
                Some((_, members)) => members.push(obj),
                None => groups.push((type_id, vec![obj])),
            }
        }

        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self.destroy_groups(cx, groups).await;
        self.end_scope(cx, guard, outcome).await
    }

    async fn destroy_groups(
        &mut self,
        cx: &Cx,
        groups: Vec<(TypeId, Vec<AnyObj>)>,
    ) -> Outcome<u64, Error> {
        let identity = primary_identity();
        let mut deleted = 0;
        for (_, members) in groups {
            let keyed: Vec<AnyObj> = members
                .into_iter()
                .filter(|obj| identity(&**obj).is_some())
                .collect();
            let Some(first) = keyed.first() else {
                continue;
            };
            let stmt = Statement::delete(first.table_name(), identity_filter(&keyed, &identity));
            let count = try_outcome!(self.execute(cx, &stmt).await);
            tracing::debug!(model = first.model_name(), count, "Destroyed rows");
            deleted += count;
            for obj in &keyed {
                self.expunge_any(obj);
            }
        }
        Outcome::Ok(deleted)
    }

    /// Delete rows of `M` by primary key and commit.
    ///
    /// Each key lists one value per primary key column.
    pub async fn destroy_keys<M: Model>(
        &mut self,
        cx: &Cx,
        keys: &[Vec<Value>],
    ) -> Outcome<u64, Error> {
        if !M::is_mapped() {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::UnmappedType,
                format!("{} is not a mapped entity type", M::model_name()),
            ));
        }
        let stmt = Statement::delete(M::TABLE_NAME, primary_key_filter::<M>(keys));

        let guard = self.begin_scope(ScopeOptions::default());
        let outcome = self.execute(cx, &stmt).await;
        if let Outcome::Ok(count) = &outcome {
            tracing::debug!(model = M::model_name(), count, "Destroyed rows by key");
            for key in keys {
                if let Some(obj) = self.identity_lookup::<M>(key) {
                    self.expunge_any(&obj.erase());
                }
            }
        }
        self.end_scope(cx, guard, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{Hero, Team, hero, seed_hero, store, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use sqlservice_core::{Obj, RelatedMany};

    #[test]
    fn test_destroy_deletes_each_type_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = store();
        seed_hero(&conn, 1, "a", None);
        seed_hero(&conn, 2, "b", None);
        seed_hero(&conn, 3, "c", None);
        conn.insert_committed("teams", vec![("id", 1_i64.into()), ("name", "T".into())])
            .unwrap();
        let mut session = Session::new(conn.clone());

        let team = Obj::new(Team {
            id: Some(1),
            name: "T".into(),
            heroes: RelatedMany::new("team_id"),
        });
        rt.block_on(async {
            let tracked = unwrap_outcome(session.get::<Hero>(&cx, 1_i64).await).unwrap();
            conn.reset_stats();
            let batch = Batch::Many(vec![
                tracked.erase(),
                hero(Some(2), "b").erase(),
                team.erase(),
                hero(None, "never saved").erase(),
            ]);
            let deleted = unwrap_outcome(session.destroy(&cx, batch).await);
            assert_eq!(deleted, 3);
            assert!(!session.contains(&tracked));
        });

        assert_eq!(conn.stats().deletes, 2);
        assert_eq!(conn.stats().commits, 1);
        assert_eq!(conn.row_count("heroes"), 1);
        assert_eq!(conn.row_count("teams"), 0);
    }

    #[test]
    fn test_destroy_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = store();
        seed_hero(&conn, 1, "a", None);
        seed_hero(&conn, 2, "b", None);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let tracked = unwrap_outcome(session.get::<Hero>(&cx, 2_i64).await).unwrap();
            let keys = [vec![Value::BigInt(2)], vec![Value::BigInt(7)]];
            let deleted = unwrap_outcome(session.destroy_keys::<Hero>(&cx, &keys).await);
            assert_eq!(deleted, 1);
            assert!(!session.contains(&tracked));
        });
        assert_eq!(conn.row_count("heroes"), 1);
    }
}
