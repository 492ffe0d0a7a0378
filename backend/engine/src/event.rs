//! Event records and their stage windows.
//!
//! Descriptive fields are mutable only while the event is still in
//! `preparation`; the `stage` column itself is owned exclusively by the
//! stage engine (`stage.rs`) — nothing here writes it. Deletion is a
//! tombstone: a deleted event rejects all further mutation.

use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{EngineError, Result};
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror;
use crate::stage::Stage;
use crate::state::AppState;
use crate::types::{Event, StageWindow};

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub location: String,
    pub start_time: i64,
    pub end_time: i64,
    pub organizer_id: i64,
    #[serde(default = "default_team_size")]
    pub max_team_size: i64,
    #[serde(default)]
    pub max_participants: i64,
    #[serde(default)]
    pub stage_windows: Vec<WindowSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowSpec {
    pub stage: Stage,
    pub start_time: i64,
    pub end_time: i64,
}

fn default_team_size() -> i64 {
    3
}

/// All live events, newest first.
pub async fn list(pool: &SqlitePool) -> Result<Vec<Event>> {
    sqlx::query_as::<_, Event>(
        "SELECT * FROM events WHERE is_deleted = 0 ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Load an event, treating tombstoned rows as absent.
pub async fn load(pool: &SqlitePool, event_id: i64) -> Result<Event> {
    sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = ?1 AND is_deleted = 0")
        .bind(event_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("event"))
}

/// Create an event in `preparation`, with either the supplied stage
/// windows or an auto-assigned set derived from the event bounds, and
/// mirror its descriptive record to the external ledger.
pub async fn create<G: LedgerGateway>(state: &AppState<G>, new: NewEvent) -> Result<Event> {
    if new.name.trim().is_empty() {
        return Err(EngineError::Validation("event name is required".into()));
    }
    if new.start_time >= new.end_time {
        return Err(EngineError::Validation(
            "start_time must be before end_time".into(),
        ));
    }

    let windows = if new.stage_windows.is_empty() {
        auto_assign_windows(new.start_time, new.end_time)
    } else {
        new.stage_windows.clone()
    };
    validate_windows(&windows, new.start_time, new.end_time)?;

    let now = db::now();
    let mut tx = state.pool.begin().await?;

    let event_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events
            (name, description, location, start_time, end_time, stage, organizer_id,
             max_team_size, max_participants, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, 'preparation', ?6, ?7, ?8, ?9, ?9)
        RETURNING id
        "#,
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.location)
    .bind(new.start_time)
    .bind(new.end_time)
    .bind(new.organizer_id)
    .bind(new.max_team_size)
    .bind(new.max_participants)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;

    for w in &windows {
        sqlx::query(
            "INSERT INTO stage_windows (event_id, stage, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id)
        .bind(w.stage.as_str())
        .bind(w.start_time)
        .bind(w.end_time)
        .execute(&mut *tx)
        .await?;
    }

    // The internal row is authoritative; it doubles as the chain-side
    // event id so mirrored fields can be read back for reconciliation.
    sqlx::query("UPDATE events SET chain_event_id = ?1 WHERE id = ?2")
        .bind(event_id)
        .bind(event_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    let op = LedgerOp::CreateEvent {
        event_id,
        name: new.name.clone(),
        location: new.location.clone(),
        start_time: new.start_time,
        end_time: new.end_time,
    };
    mirror::mirror_write(&state.pool, &state.gateway, &state.config, event_id, &op, None).await?;

    load(&state.pool, event_id).await
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

/// Update descriptive fields; only the organizer, only in `preparation`.
pub async fn update<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
    patch: EventUpdate,
) -> Result<Event> {
    let event = load(&state.pool, event_id).await?;
    require_organizer(&event, organizer_id)?;
    if event.stage != Stage::Preparation.as_str() {
        return Err(EngineError::StateConflict(
            "event details can only be edited before publication".into(),
        ));
    }

    let name = patch.name.unwrap_or(event.name);
    let description = patch.description.unwrap_or(event.description);
    let location = patch.location.unwrap_or(event.location);
    let start_time = patch.start_time.unwrap_or(event.start_time);
    let end_time = patch.end_time.unwrap_or(event.end_time);
    if start_time >= end_time {
        return Err(EngineError::Validation(
            "start_time must be before end_time".into(),
        ));
    }

    sqlx::query(
        r#"
        UPDATE events
        SET    name = ?1, description = ?2, location = ?3,
               start_time = ?4, end_time = ?5, updated_at = ?6
        WHERE  id = ?7 AND is_deleted = 0
        "#,
    )
    .bind(&name)
    .bind(&description)
    .bind(&location)
    .bind(start_time)
    .bind(end_time)
    .bind(db::now())
    .bind(event_id)
    .execute(&state.pool)
    .await?;

    load(&state.pool, event_id).await
}

/// Tombstone an event (organizer only, `preparation` only). Credentials
/// already minted for it are marked inactive, never burned.
pub async fn tombstone<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
) -> Result<()> {
    let event = load(&state.pool, event_id).await?;
    require_organizer(&event, organizer_id)?;
    if event.stage != Stage::Preparation.as_str() {
        return Err(EngineError::StateConflict(
            "only events in preparation can be deleted".into(),
        ));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query("UPDATE events SET is_deleted = 1, updated_at = ?1 WHERE id = ?2")
        .bind(db::now())
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE credentials SET is_active = 0 WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub fn require_organizer(event: &Event, organizer_id: i64) -> Result<()> {
    if event.organizer_id != organizer_id {
        return Err(EngineError::StateConflict(
            "only the event organizer may perform this operation".into(),
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Stage windows
// ─────────────────────────────────────────────────────────

pub async fn windows(pool: &SqlitePool, event_id: i64) -> Result<Vec<StageWindow>> {
    let rows = sqlx::query_as::<_, StageWindow>(
        "SELECT * FROM stage_windows WHERE event_id = ?1 ORDER BY start_time ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Replace the stage windows wholesale. Rejected once any replaced
/// window's stage has already started.
pub async fn set_windows<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
    specs: Vec<WindowSpec>,
) -> Result<Vec<StageWindow>> {
    let event = load(&state.pool, event_id).await?;
    require_organizer(&event, organizer_id)?;

    let current = Stage::parse(&event.stage)?;
    for spec in &specs {
        if current.position() >= spec.stage.position() {
            return Err(EngineError::StateConflict(format!(
                "window for {} is read-only once that stage has started",
                spec.stage
            )));
        }
    }
    validate_windows(&specs, event.start_time, event.end_time)?;

    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM stage_windows WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
    for w in &specs {
        sqlx::query(
            "INSERT INTO stage_windows (event_id, stage, start_time, end_time) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id)
        .bind(w.stage.as_str())
        .bind(w.start_time)
        .bind(w.end_time)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    windows(&state.pool, event_id).await
}

/// True when `now` falls inside the event's window for `stage`.
pub async fn in_window(pool: &SqlitePool, event_id: i64, stage: Stage, now: i64) -> Result<bool> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT start_time, end_time FROM stage_windows WHERE event_id = ?1 AND stage = ?2",
    )
    .bind(event_id)
    .bind(stage.as_str())
    .fetch_optional(pool)
    .await?;
    match row {
        Some((start, end)) => Ok(now >= start && now < end),
        None => Err(EngineError::Validation(format!(
            "no {stage} window configured for event {event_id}"
        ))),
    }
}

/// Derive the five stage windows from the event bounds when the
/// organizer supplies none: registration 7 days from the start, check-in
/// the following day, team formation three more, submissions until two
/// days before the end, voting until the final day.
pub fn auto_assign_windows(start_time: i64, end_time: i64) -> Vec<WindowSpec> {
    const DAY: i64 = 86_400;
    let registration_end = start_time + 7 * DAY;
    let checkin_end = registration_end + DAY;
    let team_formation_end = checkin_end + 3 * DAY;
    let submission_end = end_time - 2 * DAY;
    let voting_end = end_time - DAY;

    vec![
        WindowSpec {
            stage: Stage::Registration,
            start_time,
            end_time: registration_end,
        },
        WindowSpec {
            stage: Stage::Checkin,
            start_time: registration_end,
            end_time: checkin_end,
        },
        WindowSpec {
            stage: Stage::TeamFormation,
            start_time: checkin_end,
            end_time: team_formation_end,
        },
        WindowSpec {
            stage: Stage::Submission,
            start_time: team_formation_end,
            end_time: submission_end,
        },
        WindowSpec {
            stage: Stage::Voting,
            start_time: submission_end,
            end_time: voting_end,
        },
    ]
}

/// Windows must each be internally valid, sit inside the event bounds,
/// not overlap, and respect the stage order.
pub fn validate_windows(specs: &[WindowSpec], event_start: i64, event_end: i64) -> Result<()> {
    for w in specs {
        if !w.stage.requires_window() {
            return Err(EngineError::Validation(format!(
                "stage {} does not take a window",
                w.stage
            )));
        }
        if w.start_time >= w.end_time {
            return Err(EngineError::Validation(format!(
                "window for {} must start before it ends",
                w.stage
            )));
        }
        if w.start_time < event_start || w.end_time > event_end {
            return Err(EngineError::Validation(format!(
                "window for {} falls outside the event bounds",
                w.stage
            )));
        }
    }

    for (i, a) in specs.iter().enumerate() {
        for b in specs.iter().skip(i + 1) {
            if a.stage == b.stage {
                return Err(EngineError::Validation(format!(
                    "duplicate window for {}",
                    a.stage
                )));
            }
            if a.start_time < b.end_time && b.start_time < a.end_time {
                return Err(EngineError::Validation(format!(
                    "windows for {} and {} overlap",
                    a.stage, b.stage
                )));
            }
            let (earlier, later) = if a.stage.position() < b.stage.position() {
                (a, b)
            } else {
                (b, a)
            };
            if later.start_time < earlier.end_time {
                return Err(EngineError::Validation(format!(
                    "window for {} must not start before {} ends",
                    later.stage, earlier.stage
                )));
            }
        }
    }

    Ok(())
}

/// Per-event participation counters, used by the admin dashboard.
#[derive(Debug, serde::Serialize)]
pub struct EventStats {
    pub registration_count: i64,
    pub checkin_count: i64,
    pub team_count: i64,
    pub submission_count: i64,
    pub vote_count: i64,
}

pub async fn stats(pool: &SqlitePool, event_id: i64) -> Result<EventStats> {
    let registration_count =
        sqlx::query_scalar("SELECT COUNT(*) FROM registrations WHERE event_id = ?1")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    let checkin_count = sqlx::query_scalar("SELECT COUNT(*) FROM checkins WHERE event_id = ?1")
        .bind(event_id)
        .fetch_one(pool)
        .await?;
    let team_count = sqlx::query_scalar("SELECT COUNT(*) FROM teams WHERE event_id = ?1")
        .bind(event_id)
        .fetch_one(pool)
        .await?;
    let submission_count =
        sqlx::query_scalar("SELECT COUNT(*) FROM submissions WHERE event_id = ?1 AND draft = 0")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    let vote_count =
        sqlx::query_scalar("SELECT COUNT(*) FROM votes WHERE event_id = ?1 AND is_revoked = 0")
            .bind(event_id)
            .fetch_one(pool)
            .await?;
    Ok(EventStats {
        registration_count,
        checkin_count,
        team_count,
        submission_count,
        vote_count,
    })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testutil::mock_state;

    fn spec(stage: Stage, start: i64, end: i64) -> WindowSpec {
        WindowSpec {
            stage,
            start_time: start,
            end_time: end,
        }
    }

    #[test]
    fn auto_assigned_windows_are_valid() {
        const DAY: i64 = 86_400;
        let start = 1_700_000_000;
        let end = start + 30 * DAY;
        let windows = auto_assign_windows(start, end);
        assert_eq!(windows.len(), 5);
        validate_windows(&windows, start, end).unwrap();
    }

    #[test]
    fn overlapping_windows_rejected() {
        let err = validate_windows(
            &[
                spec(Stage::Registration, 0, 100),
                spec(Stage::Checkin, 50, 150),
            ],
            0,
            1_000,
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn out_of_order_windows_rejected() {
        let err = validate_windows(
            &[
                spec(Stage::Checkin, 0, 100),
                spec(Stage::Registration, 100, 200),
            ],
            0,
            1_000,
        )
        .unwrap_err();
        assert!(err.to_string().contains("must not start before"));
    }

    #[test]
    fn window_outside_event_bounds_rejected() {
        let err =
            validate_windows(&[spec(Stage::Registration, 0, 2_000)], 0, 1_000).unwrap_err();
        assert!(err.to_string().contains("outside the event bounds"));
    }

    #[tokio::test]
    async fn create_validates_and_mirrors() {
        let state = mock_state().await;
        let now = db::now();
        let event = create(
            &state,
            NewEvent {
                name: "Spring Hack".into(),
                description: "d".into(),
                location: "Berlin".into(),
                start_time: now,
                end_time: now + 30 * 86_400,
                organizer_id: 1,
                max_team_size: 3,
                max_participants: 0,
                stage_windows: vec![],
            },
        )
        .await
        .unwrap();

        assert_eq!(event.stage, "preparation");
        assert_eq!(event.chain_event_id, event.id);
        assert_eq!(windows(&state.pool, event.id).await.unwrap().len(), 5);
        assert_eq!(state.gateway.submitted_ops().len(), 1);
    }

    #[tokio::test]
    async fn bad_time_range_rejected_before_any_write() {
        let state = mock_state().await;
        let err = create(
            &state,
            NewEvent {
                name: "X".into(),
                description: "d".into(),
                location: String::new(),
                start_time: 100,
                end_time: 100,
                organizer_id: 1,
                max_team_size: 3,
                max_participants: 0,
                stage_windows: vec![],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(state.gateway.submitted_ops().is_empty());
    }

    #[tokio::test]
    async fn tombstoned_event_rejects_further_mutation() {
        let state = mock_state().await;
        let event_id = testutil::seed_event(&state, Stage::Preparation).await;
        tombstone(&state, event_id, 1).await.unwrap();

        let err = update(
            &state,
            event_id,
            1,
            EventUpdate {
                name: Some("new".into()),
                description: None,
                location: None,
                start_time: None,
                end_time: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound("event")));
    }
}
