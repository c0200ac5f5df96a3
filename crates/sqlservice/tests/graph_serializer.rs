mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Hero, Team, seed_hero, seed_team, store, unwrap_outcome};
use serde_json::json;
use sqlservice::prelude::*;
use sqlservice::to_dict_loaded;

#[test]
fn unloaded_relationships_are_skipped_without_lazyload() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_team(&conn, 1, "Preventers");
    seed_hero(&conn, 1, "Deadpond", Some(1));
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let hero = unwrap_outcome(session.get::<Hero>(&cx, 1_i64).await).expect("hero");
        let queries = conn.stats().queries;
        let dict = unwrap_outcome(
            to_dict_loaded(&cx, &mut session, &hero.erase(), SerializeOptions::new()).await,
        );
        assert_eq!(
            serde_json::Value::Object(dict),
            json!({"id": 1, "name": "Deadpond", "team_id": 1})
        );
        assert_eq!(conn.stats().queries, queries);
    });
}

#[test]
fn lazyload_walks_bidirectional_graph_without_looping() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_team(&conn, 1, "Preventers");
    seed_hero(&conn, 1, "Deadpond", Some(1));
    seed_hero(&conn, 2, "Rusty-Man", Some(1));
    let mut session = Session::new(conn);

    rt.block_on(async {
        let team = unwrap_outcome(session.get::<Team>(&cx, 1_i64).await).expect("team");
        let options = SerializeOptions::new()
            .lazyload()
            .include_nested_relationships();
        let dict = unwrap_outcome(to_dict_loaded(&cx, &mut session, &team.erase(), options).await);

        assert_eq!(
            serde_json::Value::Object(dict),
            json!({
                "id": 1,
                "name": "Preventers",
                "heroes": [
                    {"id": 1, "name": "Deadpond", "team_id": 1},
                    {"id": 2, "name": "Rusty-Man", "team_id": 1},
                ],
            })
        );

        // Both directions are now loaded and point at the same instances.
        let heroes = team.read().heroes.get().expect("loaded").to_vec();
        assert!(heroes.iter().all(|h| h.read().team.get().is_some_and(|t| t.ptr_eq(&team))));
    });
}

#[test]
fn serializing_from_the_child_side_uses_cached_parent_copies() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_team(&conn, 1, "Preventers");
    seed_hero(&conn, 1, "Deadpond", Some(1));
    let mut session = Session::new(conn);

    rt.block_on(async {
        let hero = unwrap_outcome(session.get::<Hero>(&cx, 1_i64).await).expect("hero");
        let options = SerializeOptions::new()
            .lazyload()
            .include_nested_relationships();
        let dict = unwrap_outcome(to_dict_loaded(&cx, &mut session, &hero.erase(), options).await);

        assert_eq!(
            serde_json::Value::Object(dict),
            json!({
                "id": 1,
                "name": "Deadpond",
                "team_id": 1,
                "team": {
                    "id": 1,
                    "name": "Preventers",
                    "heroes": [{"id": 1, "name": "Deadpond", "team_id": 1}],
                },
            })
        );

        let shallow = hero.to_dict_with(SerializeOptions::new().exclude_relationships());
        assert!(!shallow.contains_key("team"));
    });
}

#[test]
fn hero_without_team_serializes_empty_map() {
    let hero = Hero::new(Some(3), "Loner");
    assert_eq!(hero.to_dict()["team"], json!({}));
}

#[derive(Debug, Clone)]
struct Gadget {
    id: Option<i64>,
    label: String,
    active: bool,
    weight: f64,
}

impl Model for Gadget {
    const TABLE_NAME: &'static str = "gadgets";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("label", self.label.clone().into()),
            ("active", self.active.into()),
            ("weight", self.weight.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            label: row.get_named("label")?,
            active: row.get_named("active")?,
            weight: row.get_named("weight")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
        self.id = values.first().cloned().unwrap_or(Value::Null).try_into()?;
        Ok(())
    }
}

#[test]
fn unsaved_scalar_model_serializes_exactly_its_columns() {
    let gadget = Obj::new(Gadget {
        id: None,
        label: "sprocket".into(),
        active: true,
        weight: 2.5,
    });

    assert_eq!(
        serde_json::Value::Object(gadget.to_dict()),
        json!({"id": null, "label": "sprocket", "active": true, "weight": 2.5})
    );
    assert_eq!(
        gadget.to_dict_with(
            SerializeOptions::new()
                .lazyload()
                .include_nested_relationships()
        ),
        gadget.to_dict()
    );
}
