// Integration tests for the scoring event pipeline: ordered application,
// idempotent finish, rejection on locked matches, shutdown drain, and
// notification fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use volley_backend::notify::{BroadcastSink, NullSink, NotificationSink};
use volley_backend::scoring::{spawn_scoring_worker, ScoringChannel, ScoringEvent, Side};
use volley_backend::store::{Database, NewRound};

async fn test_db() -> Arc<Database> {
    sqlx::any::install_default_drivers();
    Arc::new(Database::new("sqlite::memory:").await.unwrap())
}

/// Create a round with `n` teams and one match per consecutive team pair.
/// Returns the match ids.
async fn fixture_matches(db: &Database, n: i64) -> Vec<i64> {
    let division = db.create_division("Gold").await.unwrap();
    let mut team_ids = Vec::new();
    for i in 1..=n {
        team_ids.push(
            db.create_team(&format!("Team {i}"), "", "")
                .await
                .unwrap()
                .meta
                .id,
        );
    }

    let mut conn = db.pool().acquire().await.unwrap();
    let round = Database::insert_round_on(
        &mut conn,
        &NewRound {
            division_id: division.meta.id,
            round_number: 1,
            selection_strategy: "top_by_points".into(),
            generation_strategy: "manual".into(),
            grouping_strategy: "no_group".into(),
            teams_per_group: None,
            groups_in_round: None,
            previous_round_id: None,
            advancing_team_count: 0,
        },
    )
    .await
    .unwrap();
    for (i, team_id) in team_ids.iter().enumerate() {
        Database::insert_round_team_on(&mut conn, round.meta.id, *team_id, Some(i as i64 + 1), None)
            .await
            .unwrap();
    }

    let mut match_ids = Vec::new();
    for (i, pair) in team_ids.chunks(2).enumerate() {
        if let [home, away] = pair {
            let m = Database::insert_match_on(
                &mut conn,
                round.meta.id,
                *home,
                *away,
                i as i64 + 1,
                1,
                None,
            )
            .await
            .unwrap();
            match_ids.push(m.meta.id);
        }
    }
    match_ids
}

fn spawn_worker(
    db: Arc<Database>,
    sink: Arc<dyn NotificationSink>,
) -> (ScoringChannel, tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (channel, handle) = spawn_scoring_worker(db, sink, 64, shutdown_rx);
    (channel, handle, shutdown_tx)
}

/// Wait until the queue is empty (all enqueued events applied).
async fn drain(channel: &ScoringChannel) {
    for _ in 0..200 {
        if channel.pending_count() == 0 {
            // one extra tick so the last transaction commit settles
            tokio::time::sleep(Duration::from_millis(10)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("scoring queue did not drain");
}

#[tokio::test]
async fn test_events_apply_in_order() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    for event in [
        ScoringEvent::MatchStart { match_id },
        ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 1,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 1,
        },
        ScoringEvent::SetEnd { match_id },
    ] {
        channel.enqueue(event).await.unwrap();
    }
    drain(&channel).await;

    // Two score changes and a set end: home up 2 points, set finished
    let sets = db.list_sets(match_id).await.unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].home_points, 2);
    assert_eq!(sets[0].away_points, 0);
    assert!(sets[0].is_finished);

    let m = db.get_match(match_id).await.unwrap().unwrap();
    assert_eq!(m.home_sets, 1);
    assert_eq!(m.away_sets, 0);
    assert!(m.actual_start_time.is_some());
    assert!(!m.is_finished);

    // Every applied event left an audit row
    let updates = db.list_match_updates(match_id).await.unwrap();
    let types: Vec<&str> = updates.iter().map(|u| u.update_type.as_str()).collect();
    assert_eq!(
        types,
        vec!["match_start", "set_start", "score_change", "score_change", "set_end"]
    );
}

#[tokio::test]
async fn test_match_finish_applies_team_results_once() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    for event in [
        ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 25,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Away,
            delta: 20,
        },
        ScoringEvent::SetEnd { match_id },
        ScoringEvent::MatchFinish { match_id },
        // duplicate finish is a no-op, not an error
        ScoringEvent::MatchFinish { match_id },
    ] {
        channel.enqueue(event).await.unwrap();
    }
    drain(&channel).await;

    let m = db.get_match(match_id).await.unwrap().unwrap();
    assert!(m.is_finished);

    let teams = db.list_round_teams(m.round_id).await.unwrap();
    let home = teams.iter().find(|t| t.team_id == m.home_team_id).unwrap();
    let away = teams.iter().find(|t| t.team_id == m.away_team_id).unwrap();

    // Result applied exactly once: 3 league points, one match played
    assert_eq!(home.points, 3);
    assert_eq!(home.matches_played, 1);
    assert_eq!(home.wins, 1);
    assert_eq!(home.score_for, 25);
    assert_eq!(home.score_against, 20);
    assert_eq!(away.points, 0);
    assert_eq!(away.matches_played, 1);
    assert_eq!(away.losses, 1);
}

#[tokio::test]
async fn test_concurrent_producers_do_not_interleave_per_match_state() {
    let db = test_db().await;
    let match_ids = fixture_matches(&db, 8).await;
    assert_eq!(match_ids.len(), 4);
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    // Each producer scores its own match concurrently
    let mut tasks = Vec::new();
    for (i, match_id) in match_ids.iter().copied().enumerate() {
        let channel = channel.clone();
        let points = (i as i64 + 1) * 5;
        tasks.push(tokio::spawn(async move {
            channel
                .enqueue(ScoringEvent::SetStart {
                    match_id,
                    set_number: 1,
                })
                .await
                .unwrap();
            for _ in 0..points {
                channel
                    .enqueue(ScoringEvent::ScoreChange {
                        match_id,
                        side: Side::Home,
                        delta: 1,
                    })
                    .await
                    .unwrap();
            }
            channel
                .enqueue(ScoringEvent::SetEnd { match_id })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    drain(&channel).await;

    // Despite concurrent enqueue timing, every match ends at its own total
    for (i, match_id) in match_ids.iter().enumerate() {
        let sets = db.list_sets(*match_id).await.unwrap();
        assert_eq!(sets.len(), 1, "match {match_id}");
        assert_eq!(sets[0].home_points, (i as i64 + 1) * 5);
        assert!(sets[0].is_finished);
    }
}

#[tokio::test]
async fn test_events_on_locked_match_are_rejected_without_partial_writes() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];

    {
        let mut conn = db.pool().acquire().await.unwrap();
        let m = Database::get_match_on(&mut conn, match_id).await.unwrap().unwrap();
        Database::set_match_flags_on(&mut conn, match_id, m.version, false, false, true)
            .await
            .unwrap();
    }

    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));
    channel
        .enqueue(ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        })
        .await
        .unwrap();
    channel
        .enqueue(ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 1,
        })
        .await
        .unwrap();
    drain(&channel).await;

    // Nothing was applied
    assert!(db.list_sets(match_id).await.unwrap().is_empty());

    // The rejections were audited
    let updates = db.list_match_updates(match_id).await.unwrap();
    let types: Vec<&str> = updates.iter().map(|u| u.update_type.as_str()).collect();
    assert_eq!(types, vec!["set_start_rejected", "score_change_rejected"]);
}

#[tokio::test]
async fn test_revert_reopens_previous_set() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    for event in [
        ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Away,
            delta: 25,
        },
        ScoringEvent::SetEnd { match_id },
        ScoringEvent::RevertToPreviousSet { match_id },
    ] {
        channel.enqueue(event).await.unwrap();
    }
    drain(&channel).await;

    // The set is open again and the away set point was taken back
    let sets = db.list_sets(match_id).await.unwrap();
    assert_eq!(sets.len(), 1);
    assert!(!sets[0].is_finished);
    let m = db.get_match(match_id).await.unwrap().unwrap();
    assert_eq!(m.away_sets, 0);
}

#[tokio::test]
async fn test_shutdown_drains_enqueued_events() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let (channel, handle, shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    channel
        .enqueue(ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        })
        .await
        .unwrap();
    for _ in 0..10 {
        channel
            .enqueue(ScoringEvent::ScoreChange {
                match_id,
                side: Side::Home,
                delta: 1,
            })
            .await
            .unwrap();
    }

    shutdown.send(true).unwrap();
    handle.await.unwrap();

    // Everything enqueued before shutdown was applied
    let sets = db.list_sets(match_id).await.unwrap();
    assert_eq!(sets[0].home_points, 10);

    // New enqueues are refused after the worker stopped
    let err = channel
        .enqueue(ScoringEvent::SetEnd { match_id })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        volley_backend::error::Error::StateConflict(_)
    ));
}

#[tokio::test]
async fn test_notifications_fan_out() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let sink = Arc::new(BroadcastSink::new(32));
    let mut rx = sink.subscribe();
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), sink.clone());

    channel
        .enqueue(ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        })
        .await
        .unwrap();
    channel
        .enqueue(ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 1,
        })
        .await
        .unwrap();
    drain(&channel).await;

    let first: serde_json::Value =
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(first["event"], "set_started");
    let second: serde_json::Value =
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
    assert_eq!(second["event"], "score_changed");
    assert_eq!(second["payload"]["points"], 1);
}

#[tokio::test]
async fn test_dispute_blocks_scoring_and_finish() {
    let db = test_db().await;
    let match_id = fixture_matches(&db, 2).await[0];
    let (channel, _handle, _shutdown) = spawn_worker(db.clone(), Arc::new(NullSink));

    for event in [
        ScoringEvent::SetStart {
            match_id,
            set_number: 1,
        },
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 5,
        },
        ScoringEvent::Dispute {
            match_id,
            reason: "rotation fault".into(),
        },
        // rejected: disputed matches cannot take score changes
        ScoringEvent::ScoreChange {
            match_id,
            side: Side::Home,
            delta: 1,
        },
    ] {
        channel.enqueue(event).await.unwrap();
    }
    drain(&channel).await;

    let m = db.get_match(match_id).await.unwrap().unwrap();
    assert!(m.is_disputed);
    let sets = db.list_sets(match_id).await.unwrap();
    assert_eq!(sets[0].home_points, 5);
}
