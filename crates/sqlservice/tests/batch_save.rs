mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{
    Hero, HeroSummary, Team, count_events, expect_err, hero_names, seed_hero, store,
    unwrap_outcome,
};
use sqlservice::prelude::*;
use sqlservice::{ModelRegistry, SessionEvent, ValidationErrorKind, make_identity};
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[test]
fn save_inserts_new_objects_and_upserts_unknown_identities() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());
    let commits = count_events(&mut session, SessionEvent::AfterCommit);

    let a = Hero::new(None, "a");
    let b = Hero::new(Some(5), "b");
    rt.block_on(async {
        let saved = unwrap_outcome(session.save_all(&cx, &[a.clone(), b.clone()]).await);
        assert_eq!(saved.len(), 2);
        assert!(saved[0].ptr_eq(&a));
        assert!(saved[1].ptr_eq(&b));
    });

    assert!(a.read().id.is_some());
    assert_eq!(b.read().id, Some(5));
    assert_eq!(conn.row_count("heroes"), 2);
    assert_eq!(commits.load(Ordering::SeqCst), 1);
}

#[test]
fn saving_the_same_batch_twice_does_not_duplicate_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    let heroes = vec![Hero::new(None, "x"), Hero::new(None, "y")];
    rt.block_on(async {
        unwrap_outcome(session.save_all(&cx, &heroes).await);
        heroes[1].write().name = "y2".into();
        unwrap_outcome(session.save_all(&cx, &heroes).await);
    });

    assert_eq!(hero_names(&conn), vec!["x".to_string(), "y2".to_string()]);
}

#[test]
fn detached_copies_merge_onto_persisted_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_hero(&conn, 1, "one", None);
    seed_hero(&conn, 2, "two", None);
    let mut session = Session::new(conn.clone());

    let incoming = Batch::Many(vec![
        Hero::new(Some(2), "TWO").erase(),
        Team::new("Avengers").erase(),
        Hero::new(Some(1), "ONE").erase(),
    ]);
    let originals = incoming.clone().into_vec();
    rt.block_on(async {
        let saved = unwrap_outcome(session.save(&cx, incoming, SaveOptions::default()).await);
        let saved = saved.into_vec();
        assert_eq!(saved.len(), 3);
        // Merged positions hold the session's instance, not the argument.
        assert!(!saved[0].ptr_eq(&originals[0]));
        assert!(saved[1].ptr_eq(&originals[1]));
        assert!(!saved[2].ptr_eq(&originals[2]));
        assert!(saved.iter().all(|obj| session.contains_any(obj)));
    });

    // One pre-fetch for the heroes; the team had no identity.
    assert_eq!(conn.stats().queries, 1);
    assert_eq!(hero_names(&conn), vec!["ONE".to_string(), "TWO".to_string()]);
    assert_eq!(conn.row_count("teams"), 1);
}

#[test]
fn duplicate_identities_fail_before_any_store_access() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let batch = Batch::Many(vec![
            Hero::new(Some(3), "a").erase(),
            Hero::new(None, "b").erase(),
            Hero::new(Some(3), "c").erase(),
        ]);
        let err = expect_err(session.save(&cx, batch, SaveOptions::default()).await);
        match err {
            Error::Validation(v) => {
                assert_eq!(v.kind, ValidationErrorKind::DuplicateIdentity);
                assert_eq!(v.index, Some(2));
            }
            other => panic!("expected a validation error, got {other}"),
        }
    });

    assert!(conn.statements().is_empty());
    assert_eq!(session.depth(), 0);
}

#[test]
fn unmapped_types_are_rejected_by_index() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let batch = Batch::Many(vec![
            Hero::new(None, "fine").erase(),
            Obj::new(HeroSummary {
                name: "projection".into(),
            })
            .erase(),
        ]);
        let err = expect_err(session.save(&cx, batch, SaveOptions::default()).await);
        match err {
            Error::Validation(v) => {
                assert_eq!(v.kind, ValidationErrorKind::UnmappedType);
                assert_eq!(v.index, Some(1));
                assert!(v.message.contains("HeroSummary"));
            }
            other => panic!("expected a validation error, got {other}"),
        }
    });
    assert!(conn.statements().is_empty());
}

#[test]
fn sessions_limited_to_registered_models() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let models = ModelRegistry::new().with::<Team>().expect("register team");
    let mut session = Session::new(store()).with_models(Arc::new(models));

    rt.block_on(async {
        let err = expect_err(session.save_one(&cx, &Hero::new(None, "outsider")).await);
        assert!(err.is_validation());
        unwrap_outcome(session.save_one(&cx, &Team::new("insiders")).await);
    });
}

#[test]
fn concurrent_insert_surfaces_integrity_error_after_rollback() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());
    let rollbacks = count_events(&mut session, SessionEvent::AfterRollback);

    // Another writer inserts the same key between the pre-fetch and commit.
    let racer = conn.clone();
    let options = SaveOptions::new().before(move |_, is_new| {
        if is_new {
            seed_hero(&racer, 9, "racer", None);
        }
        Ok(())
    });

    rt.block_on(async {
        let batch = Batch::from(Hero::new(Some(9), "mine"));
        let err = expect_err(session.save(&cx, batch, options).await);
        assert!(err.is_integrity(), "unexpected error: {err}");
        assert_eq!(session.depth(), 0);
        assert!(session.autoflush());
        assert!(!session.is_in_transaction());
    });

    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(hero_names(&conn), vec!["racer".to_string()]);
}

#[test]
fn custom_identity_matches_rows_by_business_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_hero(&conn, 40, "Dr. Weird", None);
    let mut session = Session::new(conn.clone());

    let by_name = SaveOptions::new().identity(make_identity(&["name"]));
    rt.block_on(async {
        let batch = Batch::Many(vec![
            Obj::new(Hero {
                id: None,
                name: "Dr. Weird".into(),
                team_id: Some(3),
                team: Related::empty(),
            })
            .erase(),
            Hero::new(None, "Captain North").erase(),
        ]);
        let saved = unwrap_outcome(session.save(&cx, batch, by_name).await).into_vec();
        let weird = saved[0].downcast::<Hero>().expect("hero");
        assert_eq!(weird.read().id, Some(40));
        assert_eq!(weird.read().team_id, Some(3));
    });

    assert_eq!(conn.row_count("heroes"), 2);
}

#[test]
fn destroy_removes_rows_and_untracks_objects() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let saved = unwrap_outcome(
            session
                .save_all(&cx, &[Hero::new(None, "a"), Hero::new(None, "b")])
                .await,
        );
        let deleted = unwrap_outcome(session.destroy(&cx, Batch::from(saved.clone())).await);
        assert_eq!(deleted, 2);
        assert!(saved.iter().all(|h| !session.contains(h)));
    });
    assert_eq!(conn.row_count("heroes"), 0);
}
