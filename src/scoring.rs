// Scoring event pipeline: a bounded FIFO channel fed by API callers and a
// single consumer task that applies each event as one transaction, then
// publishes a notification.
//
// The single consumer is what serializes concurrent score updates without
// per-match locks: events for the same match can never reorder because
// everything flows through one queue. Enqueue blocks under backpressure
// rather than dropping. On shutdown the worker drains what was already
// enqueued, then exits; nothing is half-applied.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics;
use crate::notify::NotificationSink;
use crate::store::{Database, Match, TeamResultDelta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Home,
    Away,
}

/// One typed variant per event kind; score changes are additive deltas and
/// are not idempotent, so at-most-once enqueue is the caller's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringEvent {
    MatchStart { match_id: i64 },
    SetStart { match_id: i64, set_number: i64 },
    ScoreChange { match_id: i64, side: Side, delta: i64 },
    SetEnd { match_id: i64 },
    RevertToPreviousSet { match_id: i64 },
    Dispute { match_id: i64, reason: String },
    MatchFinish { match_id: i64 },
}

impl ScoringEvent {
    pub fn match_id(&self) -> i64 {
        match self {
            Self::MatchStart { match_id }
            | Self::SetStart { match_id, .. }
            | Self::ScoreChange { match_id, .. }
            | Self::SetEnd { match_id }
            | Self::RevertToPreviousSet { match_id }
            | Self::Dispute { match_id, .. }
            | Self::MatchFinish { match_id } => *match_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::MatchStart { .. } => "match_start",
            Self::SetStart { .. } => "set_start",
            Self::ScoreChange { .. } => "score_change",
            Self::SetEnd { .. } => "set_end",
            Self::RevertToPreviousSet { .. } => "revert_to_previous_set",
            Self::Dispute { .. } => "dispute",
            Self::MatchFinish { .. } => "match_finish",
        }
    }
}

/// An event with its queue-assigned id, used for audit correlation.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event: ScoringEvent,
}

/// Producer handle to the scoring queue. Cheap to clone.
#[derive(Clone)]
pub struct ScoringChannel {
    tx: mpsc::Sender<EventEnvelope>,
    pending: Arc<AtomicUsize>,
}

impl ScoringChannel {
    /// Enqueue an event, awaiting while the queue is at capacity.
    /// Returns the assigned event id.
    pub async fn enqueue(&self, event: ScoringEvent) -> Result<String> {
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            event,
        };
        let event_id = envelope.event_id.clone();
        // count before sending: the worker may dequeue (and decrement)
        // the moment the send lands
        let depth = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::SCORING_QUEUE_DEPTH.set(depth as i64);
        if self.tx.send(envelope).await.is_err() {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::StateConflict("scoring worker is shut down".into()));
        }
        Ok(event_id)
    }

    /// Events enqueued but not yet applied.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// Spawn the single consumer task. Returns the producer handle and the
/// worker's join handle (awaited during graceful shutdown).
pub fn spawn_scoring_worker(
    db: Arc<Database>,
    sink: Arc<dyn NotificationSink>,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (ScoringChannel, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<EventEnvelope>(capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let channel = ScoringChannel {
        tx,
        pending: pending.clone(),
    };

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => {
                    match received {
                        Some(envelope) => {
                            process_one(&db, sink.as_ref(), &pending, envelope).await;
                        }
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    // a dropped sender counts as a shutdown signal
                    if changed.is_ok() && !*shutdown.borrow() {
                        continue;
                    }
                    // Drain everything already enqueued, then stop. close()
                    // refuses new sends while keeping buffered events.
                    rx.close();
                    while let Some(envelope) = rx.recv().await {
                        process_one(&db, sink.as_ref(), &pending, envelope).await;
                    }
                    break;
                }
            }
        }
        tracing::info!("scoring worker stopped");
    });

    (channel, handle)
}

async fn process_one(
    db: &Database,
    sink: &dyn NotificationSink,
    pending: &AtomicUsize,
    envelope: EventEnvelope,
) {
    let started = Instant::now();
    let type_name = envelope.event.type_name();
    let match_id = envelope.event.match_id();

    match apply_event(db, sink, &envelope).await {
        Ok(()) => {
            metrics::SCORING_EVENTS_TOTAL
                .with_label_values(&[type_name])
                .inc();
        }
        Err(e) => {
            metrics::SCORING_EVENTS_REJECTED_TOTAL
                .with_label_values(&[type_name])
                .inc();
            tracing::warn!(
                event_id = %envelope.event_id,
                match_id,
                event = type_name,
                error = %e,
                "scoring event rejected"
            );
            record_rejection(db, &envelope, &e).await;
        }
    }

    metrics::SCORING_APPLY_DURATION_SECONDS
        .with_label_values(&[type_name])
        .observe(started.elapsed().as_secs_f64());
    let depth = pending.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
    metrics::SCORING_QUEUE_DEPTH.set(depth as i64);
}

/// Best-effort audit entry for a rejected event, in its own transaction.
async fn record_rejection(db: &Database, envelope: &EventEnvelope, error: &Error) {
    let update_type = format!("{}_rejected", envelope.event.type_name());
    let result = async {
        let mut tx = db.begin().await?;
        Database::insert_match_update_on(
            &mut tx,
            envelope.event.match_id(),
            &envelope.event_id,
            &update_type,
            "",
            &error.to_string(),
        )
        .await?;
        tx.commit().await?;
        Ok::<(), Error>(())
    }
    .await;
    if let Err(e) = result {
        tracing::error!(event_id = %envelope.event_id, error = %e, "failed to audit rejection");
    }
}

/// Load the match and refuse mutation when it is locked.
async fn load_unlocked_match(
    conn: &mut sqlx::SqliteConnection,
    match_id: i64,
) -> Result<Match> {
    let m = Database::get_match_on(conn, match_id)
        .await?
        .ok_or(Error::NotFound {
            entity: "match",
            id: match_id,
        })?;
    if m.is_locked {
        return Err(Error::StateConflict(format!("match {match_id} is locked")));
    }
    Ok(m)
}

/// Apply one event atomically: one transaction, full-or-nothing, with an
/// audit row, then publish the corresponding notification.
async fn apply_event(
    db: &Database,
    sink: &dyn NotificationSink,
    envelope: &EventEnvelope,
) -> Result<()> {
    let event_id = envelope.event_id.as_str();
    match &envelope.event {
        ScoringEvent::MatchStart { match_id } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is already finished"
                )));
            }
            if m.actual_start_time.is_some() {
                // already started; re-applying is a no-op
                return Ok(());
            }
            let now = Utc::now().to_rfc3339();
            Database::set_match_started_on(&mut tx, *match_id, m.version, &now).await?;
            Database::insert_match_update_on(&mut tx, *match_id, event_id, "match_start", "", &now)
                .await?;
            tx.commit().await?;
            sink.publish("match_started", json!({ "match_id": match_id }));
            Ok(())
        }

        ScoringEvent::SetStart {
            match_id,
            set_number,
        } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is already finished"
                )));
            }
            let current = Database::current_set_on(&mut tx, *match_id).await?;
            if let Some(current) = &current {
                if current.set_number == *set_number && !current.is_finished {
                    // the requested set is already running
                    return Ok(());
                }
                if !current.is_finished {
                    return Err(Error::StateConflict(format!(
                        "set {} of match {match_id} is still open",
                        current.set_number
                    )));
                }
                if *set_number != current.set_number + 1 {
                    return Err(Error::Validation(format!(
                        "expected set {} next, got {set_number}",
                        current.set_number + 1
                    )));
                }
            } else if *set_number != 1 {
                return Err(Error::Validation(format!(
                    "expected set 1 first, got {set_number}"
                )));
            }
            Database::insert_set_on(&mut tx, *match_id, *set_number).await?;
            Database::insert_match_update_on(
                &mut tx,
                *match_id,
                event_id,
                "set_start",
                "",
                &set_number.to_string(),
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "set_started",
                json!({ "match_id": match_id, "set_number": set_number }),
            );
            Ok(())
        }

        ScoringEvent::ScoreChange {
            match_id,
            side,
            delta,
        } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is already finished"
                )));
            }
            if m.is_disputed {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is disputed"
                )));
            }
            let current = Database::current_set_on(&mut tx, *match_id)
                .await?
                .filter(|s| !s.is_finished)
                .ok_or_else(|| {
                    Error::StateConflict(format!("match {match_id} has no open set"))
                })?;
            let (old, new) = match side {
                Side::Home => (current.home_points, current.home_points + delta),
                Side::Away => (current.away_points, current.away_points + delta),
            };
            if new < 0 {
                return Err(Error::Validation(format!(
                    "score cannot go below zero (was {old}, delta {delta})"
                )));
            }
            let (home_delta, away_delta) = match side {
                Side::Home => (*delta, 0),
                Side::Away => (0, *delta),
            };
            Database::add_set_points_on(&mut tx, current.meta.id, home_delta, away_delta).await?;
            Database::insert_match_update_on(
                &mut tx,
                *match_id,
                event_id,
                "score_change",
                &old.to_string(),
                &new.to_string(),
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "score_changed",
                json!({
                    "match_id": match_id,
                    "set_number": current.set_number,
                    "side": side,
                    "points": new,
                }),
            );
            Ok(())
        }

        ScoringEvent::SetEnd { match_id } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is already finished"
                )));
            }
            let current = Database::current_set_on(&mut tx, *match_id)
                .await?
                .filter(|s| !s.is_finished)
                .ok_or_else(|| {
                    Error::StateConflict(format!("match {match_id} has no open set"))
                })?;
            if current.home_points == current.away_points {
                return Err(Error::Validation(format!(
                    "set {} is tied at {} and cannot end",
                    current.set_number, current.home_points
                )));
            }
            let (home_sets, away_sets) = if current.home_points > current.away_points {
                (m.home_sets + 1, m.away_sets)
            } else {
                (m.home_sets, m.away_sets + 1)
            };
            Database::set_set_finished_on(&mut tx, current.meta.id, true).await?;
            Database::set_match_sets_on(&mut tx, *match_id, m.version, home_sets, away_sets)
                .await?;
            Database::insert_match_update_on(
                &mut tx,
                *match_id,
                event_id,
                "set_end",
                &format!("{}:{}", current.home_points, current.away_points),
                &format!("{home_sets}:{away_sets}"),
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "set_ended",
                json!({
                    "match_id": match_id,
                    "set_number": current.set_number,
                    "home_sets": home_sets,
                    "away_sets": away_sets,
                }),
            );
            Ok(())
        }

        ScoringEvent::RevertToPreviousSet { match_id } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is already finished"
                )));
            }
            let current = Database::current_set_on(&mut tx, *match_id)
                .await?
                .ok_or_else(|| {
                    Error::StateConflict(format!("match {match_id} has no sets to revert"))
                })?;
            if current.is_locked {
                return Err(Error::StateConflict(format!(
                    "set {} of match {match_id} is locked",
                    current.set_number
                )));
            }
            if !current.is_finished {
                // discard the running set entirely
                Database::delete_set_on(&mut tx, current.meta.id).await?;
            } else {
                // reopen the finished set and take back its set point
                let (home_sets, away_sets) = if current.home_points > current.away_points {
                    (m.home_sets - 1, m.away_sets)
                } else {
                    (m.home_sets, m.away_sets - 1)
                };
                Database::set_set_finished_on(&mut tx, current.meta.id, false).await?;
                Database::set_match_sets_on(&mut tx, *match_id, m.version, home_sets, away_sets)
                    .await?;
            }
            Database::insert_match_update_on(
                &mut tx,
                *match_id,
                event_id,
                "revert_to_previous_set",
                &current.set_number.to_string(),
                "",
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "set_reverted",
                json!({ "match_id": match_id, "set_number": current.set_number }),
            );
            Ok(())
        }

        ScoringEvent::Dispute { match_id, reason } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_disputed {
                return Ok(());
            }
            Database::set_match_flags_on(
                &mut tx,
                *match_id,
                m.version,
                m.is_finished,
                true,
                false,
            )
            .await?;
            Database::insert_match_update_on(
                &mut tx, *match_id, event_id, "dispute", "", reason,
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "match_disputed",
                json!({ "match_id": match_id, "reason": reason }),
            );
            Ok(())
        }

        ScoringEvent::MatchFinish { match_id } => {
            let mut tx = db.begin().await?;
            let m = load_unlocked_match(&mut tx, *match_id).await?;
            if m.is_finished {
                // idempotent: finishing a finished match is a no-op
                return Ok(());
            }
            if m.is_disputed {
                return Err(Error::StateConflict(format!(
                    "match {match_id} is disputed and cannot finish"
                )));
            }
            if let Some(open) = Database::current_set_on(&mut tx, *match_id)
                .await?
                .filter(|s| !s.is_finished)
            {
                return Err(Error::StateConflict(format!(
                    "set {} of match {match_id} is still open",
                    open.set_number
                )));
            }

            let sets = Database::list_sets_on(&mut tx, *match_id).await?;
            let score_home: i64 = sets.iter().map(|s| s.home_points).sum();
            let score_away: i64 = sets.iter().map(|s| s.away_points).sum();

            let (home_delta, away_delta) =
                result_deltas(m.home_sets, m.away_sets, score_home, score_away);

            let home_rt = Database::get_round_team_on(&mut tx, m.round_id, m.home_team_id)
                .await?
                .ok_or(Error::NotFound {
                    entity: "round_team",
                    id: m.home_team_id,
                })?;
            let away_rt = Database::get_round_team_on(&mut tx, m.round_id, m.away_team_id)
                .await?
                .ok_or(Error::NotFound {
                    entity: "round_team",
                    id: m.away_team_id,
                })?;
            Database::apply_team_result_on(&mut tx, home_rt.meta.id, home_delta).await?;
            Database::apply_team_result_on(&mut tx, away_rt.meta.id, away_delta).await?;

            Database::set_match_flags_on(&mut tx, *match_id, m.version, true, false, false)
                .await?;
            Database::insert_match_update_on(
                &mut tx,
                *match_id,
                event_id,
                "match_finish",
                &format!("{}:{}", m.home_sets, m.away_sets),
                "finished",
            )
            .await?;
            tx.commit().await?;
            sink.publish(
                "match_finished",
                json!({
                    "match_id": match_id,
                    "home_sets": m.home_sets,
                    "away_sets": m.away_sets,
                }),
            );
            Ok(())
        }
    }
}

/// League points: 3 for a win, 1 each for a draw, 0 for a loss.
fn result_deltas(
    home_sets: i64,
    away_sets: i64,
    score_home: i64,
    score_away: i64,
) -> (TeamResultDelta, TeamResultDelta) {
    let (home_points, home_w, home_d, home_l) = match home_sets.cmp(&away_sets) {
        std::cmp::Ordering::Greater => (3, 1, 0, 0),
        std::cmp::Ordering::Equal => (1, 0, 1, 0),
        std::cmp::Ordering::Less => (0, 0, 0, 1),
    };
    let (away_points, away_w, away_d, away_l) = match home_points {
        3 => (0, 0, 0, 1),
        1 => (1, 0, 1, 0),
        _ => (3, 1, 0, 0),
    };
    (
        TeamResultDelta {
            points: home_points,
            wins: home_w,
            draws: home_d,
            losses: home_l,
            sets_won: home_sets,
            sets_lost: away_sets,
            score_for: score_home,
            score_against: score_away,
        },
        TeamResultDelta {
            points: away_points,
            wins: away_w,
            draws: away_d,
            losses: away_l,
            sets_won: away_sets,
            sets_lost: home_sets,
            score_for: score_away,
            score_against: score_home,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_deltas_win_loss() {
        let (home, away) = result_deltas(3, 1, 97, 80);
        assert_eq!(home.points, 3);
        assert_eq!(home.wins, 1);
        assert_eq!(home.sets_won, 3);
        assert_eq!(home.score_against, 80);
        assert_eq!(away.points, 0);
        assert_eq!(away.losses, 1);
        assert_eq!(away.sets_lost, 3);
    }

    #[test]
    fn test_result_deltas_draw() {
        let (home, away) = result_deltas(1, 1, 50, 50);
        assert_eq!(home.points, 1);
        assert_eq!(home.draws, 1);
        assert_eq!(away.points, 1);
        assert_eq!(away.draws, 1);
    }

    #[test]
    fn test_event_accessors() {
        let e = ScoringEvent::ScoreChange {
            match_id: 9,
            side: Side::Away,
            delta: 1,
        };
        assert_eq!(e.match_id(), 9);
        assert_eq!(e.type_name(), "score_change");

        let e = ScoringEvent::Dispute {
            match_id: 4,
            reason: "net touch".into(),
        };
        assert_eq!(e.match_id(), 4);
        assert_eq!(e.type_name(), "dispute");
    }

    #[test]
    fn test_event_json_shape() {
        let e = ScoringEvent::SetStart {
            match_id: 3,
            set_number: 2,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "set_start");
        assert_eq!(v["set_number"], 2);

        let back: ScoringEvent =
            serde_json::from_value(json!({ "type": "match_finish", "match_id": 3 })).unwrap();
        assert_eq!(back.type_name(), "match_finish");
    }
}
