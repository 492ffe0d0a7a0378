//! Stage engine — the event lifecycle state machine.
//!
//! Stages advance strictly forward (`preparation` → … → `results`) with
//! `cancelled` reachable from any non-terminal stage. Every other
//! subsystem *reads* the stage through [`require_stage`]; only this
//! module writes it. A transition is atomic: the stage column, the
//! transition journal row, and any internal side effect (final ranking
//! on entering `results`) commit in one transaction. Ledger mirroring
//! happens after the commit and its failure never rolls the stage back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror;
use crate::state::AppState;
use crate::types::Event;
use crate::voting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparation,
    Published,
    Registration,
    Checkin,
    TeamFormation,
    Submission,
    Voting,
    Results,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparation => "preparation",
            Self::Published => "published",
            Self::Registration => "registration",
            Self::Checkin => "checkin",
            Self::TeamFormation => "team_formation",
            Self::Submission => "submission",
            Self::Voting => "voting",
            Self::Results => "results",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "preparation" => Self::Preparation,
            "published" => Self::Published,
            "registration" => Self::Registration,
            "checkin" => Self::Checkin,
            "team_formation" => Self::TeamFormation,
            "submission" => Self::Submission,
            "voting" => Self::Voting,
            "results" => Self::Results,
            "cancelled" => Self::Cancelled,
            other => {
                return Err(EngineError::DataIntegrity(format!(
                    "unknown stage value: {other}"
                )))
            }
        })
    }

    /// The only stage a normal (non-forced) transition may move to.
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Preparation => Some(Self::Published),
            Self::Published => Some(Self::Registration),
            Self::Registration => Some(Self::Checkin),
            Self::Checkin => Some(Self::TeamFormation),
            Self::TeamFormation => Some(Self::Submission),
            Self::Submission => Some(Self::Voting),
            Self::Voting => Some(Self::Results),
            Self::Results | Self::Cancelled => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Results | Self::Cancelled)
    }

    /// Ordinal used for window ordering checks.
    pub fn position(&self) -> i64 {
        match self {
            Self::Preparation => 0,
            Self::Published => 1,
            Self::Registration => 2,
            Self::Checkin => 3,
            Self::TeamFormation => 4,
            Self::Submission => 5,
            Self::Voting => 6,
            Self::Results => 7,
            Self::Cancelled => 8,
        }
    }

    /// Stages that carry an explicit (start, end) window.
    pub fn requires_window(&self) -> bool {
        matches!(
            self,
            Self::Registration
                | Self::Checkin
                | Self::TeamFormation
                | Self::Submission
                | Self::Voting
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast on every successful `publish`/`switch_stage`.
#[derive(Debug, Clone, Serialize)]
pub struct StageTransitionEvent {
    pub event_id: i64,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub timestamp: i64,
}

/// Load the event and verify it is in `required`; the caller gets the
/// row so it does not have to re-read it.
pub async fn require_stage(pool: &SqlitePool, event_id: i64, required: Stage) -> Result<Event> {
    let event = event::load(pool, event_id).await?;
    let current = Stage::parse(&event.stage)?;
    if current != required {
        return Err(EngineError::WrongStage {
            event_id,
            current,
            required,
        });
    }
    Ok(event)
}

/// Publish an event: `preparation` → `published`.
///
/// Requires a name, a description, a valid time range, and all five
/// stage windows to be configured, so participants never see an event
/// whose schedule is still undefined.
pub async fn publish<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
) -> Result<StageTransitionEvent> {
    let event = event::load(&state.pool, event_id).await?;
    event::require_organizer(&event, organizer_id)?;

    if event.name.trim().is_empty() || event.description.trim().is_empty() {
        return Err(EngineError::Validation(
            "a name and description are required before publishing".into(),
        ));
    }
    if event.start_time >= event.end_time {
        return Err(EngineError::Validation("invalid event time range".into()));
    }
    let configured = event::windows(&state.pool, event_id).await?;
    for required in [
        Stage::Registration,
        Stage::Checkin,
        Stage::TeamFormation,
        Stage::Submission,
        Stage::Voting,
    ] {
        if !configured.iter().any(|w| w.stage == required.as_str()) {
            return Err(EngineError::Validation(format!(
                "stage window for {required} must be set before publishing"
            )));
        }
    }

    switch_stage(state, event_id, Stage::Published, false)
        .await?
        .ok_or_else(|| EngineError::StateConflict("event is already published".into()))
}

/// Move an event to `target`.
///
/// Legal when `target` is the immediate successor of the current stage,
/// or `cancelled` from any non-terminal stage, or `force` is set
/// (administrative override). Re-applying the current stage returns
/// `Ok(None)`: manual and scheduled activation share the
/// `(event, stage)` idempotency key, so a double fire is a no-op rather
/// than a duplicated side effect.
pub async fn switch_stage<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    target: Stage,
    force: bool,
) -> Result<Option<StageTransitionEvent>> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    let current = Stage::parse(&event.stage)?;

    if target == current {
        return Ok(None);
    }

    let legal = current.successor() == Some(target)
        || (target == Stage::Cancelled && !current.is_terminal())
        || force;
    if !legal {
        return Err(EngineError::InvalidStageTransition {
            from: current,
            to: target,
        });
    }

    let now = db::now();
    let mut tx = state.pool.begin().await?;

    sqlx::query("UPDATE events SET stage = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(target.as_str())
        .bind(now)
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO stage_transitions (event_id, from_stage, to_stage, occurred_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (event_id, to_stage)
        DO UPDATE SET from_stage = excluded.from_stage, occurred_at = excluded.occurred_at
        "#,
    )
    .bind(event_id)
    .bind(current.as_str())
    .bind(target.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // Internal side effects commit atomically with the stage change.
    if target == Stage::Results {
        voting::compute_ranking(&mut tx, event_id).await?;
    }

    tx.commit().await?;

    // Ledger side effects are mirrored post-commit; a gateway outage is
    // journal-visible but does not undo the transition.
    let mirror_op = match target {
        Stage::Checkin => Some(LedgerOp::ActivateEvent {
            chain_event_id: event.chain_event_id,
        }),
        Stage::Results => Some(LedgerOp::EndEvent {
            chain_event_id: event.chain_event_id,
        }),
        _ => None,
    };
    if let Some(op) = mirror_op {
        mirror::mirror_write(&state.pool, &state.gateway, &state.config, event_id, &op, None)
            .await?;
    }

    let transition = StageTransitionEvent {
        event_id,
        from_stage: current,
        to_stage: target,
        timestamp: now,
    };
    info!(
        "Event {event_id} stage {} -> {}",
        transition.from_stage, transition.to_stage
    );
    // Nobody listening is fine.
    let _ = state.stage_events.send(transition.clone());

    Ok(Some(transition))
}

/// Transition journal for an event, oldest first.
pub async fn transitions(pool: &SqlitePool, event_id: i64) -> Result<Vec<StageTransitionEvent>> {
    let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
        r#"
        SELECT event_id, from_stage, to_stage, occurred_at
        FROM   stage_transitions
        WHERE  event_id = ?1
        ORDER  BY occurred_at ASC, id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(event_id, from, to, at)| {
            Ok(StageTransitionEvent {
                event_id,
                from_stage: Stage::parse(&from)?,
                to_stage: Stage::parse(&to)?,
                timestamp: at,
            })
        })
        .collect()
}

// ─────────────────────────────────────────────────────────
// Scheduled activation
// ─────────────────────────────────────────────────────────

/// Advance every event whose next stage window has opened. Runs through
/// the same `switch_stage` path as manual activation, so a stage that
/// was already switched by hand is a no-op here.
pub async fn activate_due_stages<G: LedgerGateway>(state: &AppState<G>) -> Result<usize> {
    let now = db::now();
    let events: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, stage FROM events WHERE is_deleted = 0 AND stage NOT IN ('preparation', 'results', 'cancelled')",
    )
    .fetch_all(&state.pool)
    .await?;

    let mut advanced = 0usize;
    for (event_id, stage_str) in events {
        let current = Stage::parse(&stage_str)?;
        let Some(next) = current.successor() else {
            continue;
        };
        if !next.requires_window() {
            continue;
        }
        let due: Option<(i64,)> = sqlx::query_as(
            "SELECT start_time FROM stage_windows WHERE event_id = ?1 AND stage = ?2 AND start_time <= ?3",
        )
        .bind(event_id)
        .bind(next.as_str())
        .bind(now)
        .fetch_optional(&state.pool)
        .await?;
        if due.is_some() && switch_stage(state, event_id, next, false).await?.is_some() {
            advanced += 1;
        }
    }
    Ok(advanced)
}

/// Long-running scheduler loop, spawned from `main`.
pub async fn run_scheduler<G: LedgerGateway>(state: Arc<AppState<G>>) {
    info!("Stage scheduler starting");
    loop {
        match activate_due_stages(&state).await {
            Ok(0) => {}
            Ok(n) => info!("Scheduler advanced {n} event(s)"),
            Err(e) => error!("Scheduler error: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(state.config.scheduler_interval_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testutil::seed_event;
    use crate::state::testutil::mock_state;

    #[test]
    fn successor_chain_is_strictly_forward() {
        let order = [
            Stage::Preparation,
            Stage::Published,
            Stage::Registration,
            Stage::Checkin,
            Stage::TeamFormation,
            Stage::Submission,
            Stage::Voting,
            Stage::Results,
        ];
        for pair in order.windows(2) {
            assert_eq!(pair[0].successor(), Some(pair[1]));
        }
        assert_eq!(Stage::Results.successor(), None);
        assert_eq!(Stage::Cancelled.successor(), None);
    }

    #[tokio::test]
    async fn only_immediate_successor_is_legal() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;

        // Skipping ahead fails.
        let err = switch_stage(&state, event_id, Stage::Voting, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStageTransition {
                from: Stage::Registration,
                to: Stage::Voting
            }
        ));

        // Going backward fails.
        let err = switch_stage(&state, event_id, Stage::Published, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStageTransition { .. }));

        // The successor works.
        let t = switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.from_stage, Stage::Registration);
        assert_eq!(t.to_stage, Stage::Checkin);
    }

    #[tokio::test]
    async fn cancelled_is_reachable_from_any_non_terminal_stage() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Submission).await;
        let t = switch_stage(&state, event_id, Stage::Cancelled, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.to_stage, Stage::Cancelled);

        // Absorbing: nothing leaves cancelled without force.
        let err = switch_stage(&state, event_id, Stage::Results, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStageTransition { .. }));
    }

    #[tokio::test]
    async fn double_fire_is_a_noop() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;

        assert!(switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap()
            .is_some());
        // A second activation of the same stage (e.g. scheduler racing a
        // manual call) does nothing and emits nothing.
        assert!(switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap()
            .is_none());
        // No duplicate mirror of the activate operation either.
        assert_eq!(state.gateway.submitted_ops().len(), 1);
    }

    #[tokio::test]
    async fn entering_checkin_mirrors_activation() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();
        let ops = state.gateway.submitted_ops();
        assert!(matches!(ops[0], LedgerOp::ActivateEvent { .. }));
    }

    #[tokio::test]
    async fn entering_results_freezes_the_ranking_and_mirrors_end() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = crate::team::testutil::seed_team(&state, event_id, "A", "0xaaa").await;
        let sub =
            crate::team::testutil::seed_submission(&state, event_id, team_a, "Proj", 100).await;
        let (_, voter) = crate::team::testutil::seed_team(&state, event_id, "B", "0xbbb").await;
        crate::voting::cast_vote(&state, sub, voter, 9).await.unwrap();

        switch_stage(&state, event_id, Stage::Results, false)
            .await
            .unwrap();

        let standings = crate::voting::ranking(&state.pool, event_id).await.unwrap();
        assert_eq!(standings.len(), 1);
        assert_eq!(standings[0].total_score, 9);
        assert!(state
            .gateway
            .submitted_ops()
            .iter()
            .any(|op| matches!(op, LedgerOp::EndEvent { .. })));
    }

    #[tokio::test]
    async fn forced_override_bypasses_the_chain() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let t = switch_stage(&state, event_id, Stage::Voting, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.to_stage, Stage::Voting);
    }

    #[tokio::test]
    async fn transitions_are_journaled_and_broadcast() {
        let state = mock_state().await;
        let mut rx = state.subscribe_stage_events();
        let event_id = seed_event(&state, Stage::Registration).await;

        switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, event_id);
        assert_eq!(got.to_stage, Stage::Checkin);

        let journal = transitions(&state.pool, event_id).await.unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].to_stage, Stage::Checkin);
    }

    #[tokio::test]
    async fn publish_requires_all_windows() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Preparation).await;
        sqlx::query("DELETE FROM stage_windows WHERE event_id = ?1 AND stage = 'voting'")
            .bind(event_id)
            .execute(&state.pool)
            .await
            .unwrap();

        let err = publish(&state, event_id, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn scheduler_advances_due_stage_once() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Published).await;

        // The registration window opened in the past (seed_event opens all
        // windows), so the scheduler advances published -> registration.
        assert_eq!(activate_due_stages(&state).await.unwrap(), 1);
        let event = event::load(&state.pool, event_id).await.unwrap();
        assert_eq!(event.stage, "registration");
    }
}
