mod common;

use asupersync::runtime::RuntimeBuilder;
use common::{Hero, count_events, expect_err, seed_hero, store, unwrap_outcome};
use sqlservice::prelude::*;
use sqlservice::{SessionEvent, try_outcome};
use std::sync::atomic::Ordering;
use std::task::{Context, Poll, Waker};

#[test]
fn nested_scopes_commit_exactly_once_at_any_depth() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    for depth in 1..=4 {
        let conn = store();
        let mut session = Session::new(conn.clone());
        let commits = count_events(&mut session, SessionEvent::AfterCommit);

        rt.block_on(async {
            let mut guards = Vec::new();
            for level in 0..depth {
                guards.push(session.begin_scope(ScopeOptions::default()));
                session.add(&Hero::new(None, &format!("hero-{level}")));
            }
            assert_eq!(session.depth(), depth);
            while let Some(guard) = guards.pop() {
                unwrap_outcome(session.end_scope(&cx, guard, Outcome::Ok(())).await);
            }
        });

        assert_eq!(commits.load(Ordering::SeqCst), 1, "depth {depth}");
        assert_eq!(conn.stats().commits, 1, "depth {depth}");
        assert_eq!(conn.row_count("heroes"), depth);
        assert_eq!(session.depth(), 0);
    }
}

#[test]
fn operations_inside_an_outer_scope_share_its_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    seed_hero(&conn, 1, "old", None);
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let outcome = session
            .transaction(&cx, ScopeOptions::default(), |s, cx| {
                Box::pin(async move {
                    try_outcome!(s.save_one(cx, &Hero::new(None, "new")).await);
                    try_outcome!(s.save_one(cx, &Hero::new(Some(1), "renamed")).await);
                    assert!(s.is_in_transaction());
                    s.destroy_keys::<Hero>(cx, &[vec![Value::BigInt(1)]]).await
                })
            })
            .await;
        assert_eq!(unwrap_outcome(outcome), 1);
    });

    assert_eq!(conn.stats().commits, 1);
    assert_eq!(common::hero_names(&conn), vec!["new".to_string()]);
}

#[test]
fn rollback_scope_leaves_no_rows_and_no_commits() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        unwrap_outcome(
            session
                .transaction(&cx, ScopeOptions::new().rollback(), |s, cx| {
                    Box::pin(async move {
                        s.add(&Hero::new(None, "transient"));
                        s.flush(cx).await
                    })
                })
                .await,
        );
    });

    assert_eq!(conn.row_count("heroes"), 0);
    assert_eq!(conn.stats().commits, 0);
    assert_eq!(conn.stats().rollbacks, 1);
}

#[test]
fn failure_in_inner_scope_rolls_back_once_and_session_is_reusable() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());
    let rollbacks = count_events(&mut session, SessionEvent::AfterRollback);

    rt.block_on(async {
        let outcome: Outcome<(), Error> = session
            .transaction(&cx, ScopeOptions::new().autoflush(false), |s, cx| {
                Box::pin(async move {
                    s.add(&Hero::new(None, "outer"));
                    s.transaction(cx, ScopeOptions::default(), |s, cx| {
                        Box::pin(async move {
                            s.add(&Hero::new(None, "inner"));
                            try_outcome!(s.flush(cx).await);
                            Outcome::<(), Error>::Err(Error::Custom("inner failed".into()))
                        })
                    })
                    .await
                })
            })
            .await;
        match expect_err(outcome) {
            Error::Custom(msg) => assert_eq!(msg, "inner failed"),
            other => panic!("expected the original error, got {other}"),
        }

        assert_eq!(session.depth(), 0);
        assert!(session.autoflush());
        assert_eq!(session.tracked_count(), 0);

        let again = Hero::new(None, "after");
        unwrap_outcome(session.save_one(&cx, &again).await);
    });

    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(common::hero_names(&conn), vec!["after".to_string()]);
}

#[test]
fn autoflush_override_applies_to_outermost_scope_only() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let observed = session
            .transaction(&cx, ScopeOptions::new().autoflush(false), |s, cx| {
                Box::pin(async move {
                    s.add(&Hero::new(None, "pending"));
                    // Autoflush is off: the query does not see the pending hero.
                    let seen = try_outcome!(s.query::<Hero>(cx, None).await).len();
                    Outcome::Ok((s.autoflush(), seen))
                })
            })
            .await;
        assert_eq!(unwrap_outcome(observed), (false, 0));
    });

    assert!(session.autoflush());
    assert_eq!(conn.row_count("heroes"), 1);
}

#[test]
fn dropped_transaction_future_resets_scope_and_defers_rollback() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    {
        let mut pending = Box::pin(session.transaction(
            &cx,
            ScopeOptions::new().autoflush(false),
            |s, cx| {
                Box::pin(async move {
                    s.add(&Hero::new(None, "interrupted"));
                    try_outcome!(s.flush(cx).await);
                    std::future::pending::<()>().await;
                    Outcome::Ok(())
                })
            },
        ));
        let mut task_cx = Context::from_waker(Waker::noop());
        assert!(matches!(pending.as_mut().poll(&mut task_cx), Poll::Pending));
    }

    assert_eq!(session.depth(), 0);
    assert!(session.autoflush());

    rt.block_on(async {
        let heroes = unwrap_outcome(session.query::<Hero>(&cx, None).await);
        assert!(heroes.is_empty());
    });
    assert_eq!(conn.stats().rollbacks, 1);
    assert_eq!(conn.stats().commits, 0);
    assert_eq!(session.tracked_count(), 0);
}

#[test]
fn generated_key_taken_by_another_writer_fails_the_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = store();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let guard = session.begin_scope(ScopeOptions::default());
        let mine = Hero::new(None, "mine");
        session.add(&mine);
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(mine.read().id, Some(1));

        conn.insert_committed("heroes", vec![("name", "theirs".into()), ("team_id", Value::Null)])
            .expect("concurrent insert");
        let err = expect_err(session.end_scope(&cx, guard, Outcome::Ok(())).await);
        assert!(err.is_integrity(), "unexpected error: {err}");
        assert_eq!(session.depth(), 0);
    });

    assert_eq!(common::hero_names(&conn), vec!["theirs".to_string()]);
    assert_eq!(conn.stats().commits, 0);
}
