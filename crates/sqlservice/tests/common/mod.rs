#![allow(dead_code)]

use sqlservice::prelude::*;
use sqlservice::{Loaded, ModelConfig, RelationState, SessionEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error, got Ok"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

#[derive(Debug, Clone)]
pub struct Team {
    pub id: Option<i64>,
    pub name: String,
    pub heroes: RelatedMany<Hero>,
}

impl Team {
    pub fn new(name: &str) -> Obj<Team> {
        Obj::new(Team {
            id: None,
            name: name.to_string(),
            heroes: RelatedMany::new("team_id"),
        })
    }
}

impl Model for Team {
    const TABLE_NAME: &'static str = "teams";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const AUTO_INCREMENT: bool = true;

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let id: Option<i64> = row.get_named("id")?;
        Ok(Self {
            id,
            name: row.get_named("name")?,
            heroes: RelatedMany::with_parent_pk("team_id", id),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
        self.id = values.first().cloned().unwrap_or(Value::Null).try_into()?;
        Ok(())
    }

    fn relations(&self) -> Vec<(&'static str, RelationState)> {
        vec![("heroes", self.heroes.state())]
    }

    fn set_relation(&self, _name: &str, loaded: Loaded) -> Result<()> {
        self.heroes.fill(loaded)
    }
}

#[derive(Debug, Clone)]
pub struct Hero {
    pub id: Option<i64>,
    pub name: String,
    pub team_id: Option<i64>,
    pub team: Related<Team>,
}

impl Hero {
    pub fn new(id: Option<i64>, name: &str) -> Obj<Hero> {
        Obj::new(Hero {
            id,
            name: name.to_string(),
            team_id: None,
            team: Related::empty(),
        })
    }
}

impl Model for Hero {
    const TABLE_NAME: &'static str = "heroes";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const AUTO_INCREMENT: bool = true;

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.clone().into()),
            ("team_id", self.team_id.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        let team_id: Option<i64> = row.get_named("team_id")?;
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            team_id,
            team: Related::from_fk(team_id),
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.id.into()]
    }

    fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
        self.id = values.first().cloned().unwrap_or(Value::Null).try_into()?;
        Ok(())
    }

    fn relations(&self) -> Vec<(&'static str, RelationState)> {
        vec![("team", self.team.state())]
    }

    fn set_relation(&self, _name: &str, loaded: Loaded) -> Result<()> {
        self.team.fill(loaded)
    }
}

/// A read-only projection, not mapped to a table.
#[derive(Debug, Clone)]
pub struct HeroSummary {
    pub name: String,
}

impl Model for HeroSummary {
    const TABLE_NAME: &'static str = "hero_summaries";
    const PRIMARY_KEY: &'static [&'static str] = &["name"];

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            name: row.get_named("name")?,
        })
    }

    fn primary_key_value(&self) -> Vec<Value> {
        vec![self.name.clone().into()]
    }

    fn set_primary_key_value(&mut self, values: &[Value]) -> Result<()> {
        self.name = values.first().cloned().unwrap_or(Value::Null).try_into()?;
        Ok(())
    }

    fn model_config() -> ModelConfig {
        ModelConfig::new()
    }
}

pub fn store() -> MemoryConnection {
    let conn = MemoryConnection::new();
    conn.create_table::<Team>();
    conn.create_table::<Hero>();
    conn
}

pub fn seed_hero(conn: &MemoryConnection, id: i64, name: &str, team_id: Option<i64>) {
    conn.insert_committed(
        "heroes",
        vec![
            ("id", id.into()),
            ("name", name.into()),
            ("team_id", team_id.into()),
        ],
    )
    .expect("seed hero");
}

pub fn seed_team(conn: &MemoryConnection, id: i64, name: &str) {
    conn.insert_committed("teams", vec![("id", id.into()), ("name", name.into())])
        .expect("seed team");
}

/// Count firings of a session event.
pub fn count_events<C: Connection>(session: &mut Session<C>, event: SessionEvent) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    session.on(event, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    count
}

pub fn hero_names(conn: &MemoryConnection) -> Vec<String> {
    conn.rows("heroes")
        .iter()
        .filter_map(|row| row.get_by_name("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}
