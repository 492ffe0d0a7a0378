//! Teams and project submissions.
//!
//! A participant belongs to at most one team per event, and a team owns
//! at most one submission. Team membership is only editable during the
//! `team_formation` window; submissions only during the `submission`
//! window. Only the team leader creates the submission, any member may
//! update it while it remains editable.

use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gateway::LedgerGateway;
use crate::registration;
use crate::stage::{self, Stage};
use crate::state::AppState;
use crate::types::{Submission, Team};

#[derive(Debug, Clone, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub leader_id: i64,
    #[serde(default)]
    pub max_size: Option<i64>,
}

pub async fn load(pool: &SqlitePool, team_id: i64) -> Result<Team> {
    sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE id = ?1")
        .bind(team_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("team"))
}

/// Create a team with its leader as the first member.
pub async fn create<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    new: NewTeam,
) -> Result<Team> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = stage::require_stage(&state.pool, event_id, Stage::TeamFormation).await?;
    if !event::in_window(&state.pool, event_id, Stage::TeamFormation, db::now()).await? {
        return Err(EngineError::StateConflict(
            "team formation window is not open".into(),
        ));
    }
    if new.name.trim().is_empty() {
        return Err(EngineError::Validation("team name is required".into()));
    }
    let max_size = new.max_size.unwrap_or(event.max_team_size);
    if max_size < 1 || max_size > event.max_team_size {
        return Err(EngineError::Validation(format!(
            "team size must be between 1 and {}",
            event.max_team_size
        )));
    }
    require_checked_in(&state.pool, event_id, new.leader_id).await?;
    require_unaffiliated(&state.pool, event_id, new.leader_id).await?;

    if sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM teams WHERE event_id = ?1 AND name = ?2",
    )
    .bind(event_id)
    .bind(&new.name)
    .fetch_one(&state.pool)
    .await?
        > 0
    {
        return Err(EngineError::StateConflict(format!(
            "team name '{}' is already taken",
            new.name
        )));
    }

    let now = db::now();
    let mut tx = state.pool.begin().await?;
    let team_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO teams (event_id, name, max_size, leader_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING id
        "#,
    )
    .bind(event_id)
    .bind(&new.name)
    .bind(max_size)
    .bind(new.leader_id)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO team_members (team_id, participant_id, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(team_id)
    .bind(new.leader_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    load(&state.pool, team_id).await
}

pub async fn join<G: LedgerGateway>(
    state: &AppState<G>,
    team_id: i64,
    participant_id: i64,
) -> Result<()> {
    let team = load(&state.pool, team_id).await?;
    let _guard = state.event_locks.lock(team.event_id).await;

    stage::require_stage(&state.pool, team.event_id, Stage::TeamFormation).await?;
    if !event::in_window(&state.pool, team.event_id, Stage::TeamFormation, db::now()).await? {
        return Err(EngineError::StateConflict(
            "team formation window is not open".into(),
        ));
    }
    require_checked_in(&state.pool, team.event_id, participant_id).await?;
    require_unaffiliated(&state.pool, team.event_id, participant_id).await?;

    let size: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM team_members WHERE team_id = ?1")
        .bind(team_id)
        .fetch_one(&state.pool)
        .await?;
    if size >= team.max_size {
        return Err(EngineError::StateConflict(format!(
            "team {team_id} is full ({} members)",
            team.max_size
        )));
    }

    sqlx::query(
        "INSERT INTO team_members (team_id, participant_id, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(team_id)
    .bind(participant_id)
    .bind(db::now())
    .execute(&state.pool)
    .await?;
    Ok(())
}

/// A member leaves their team. The leader cannot leave; they disband or
/// hand over out of band.
pub async fn leave<G: LedgerGateway>(
    state: &AppState<G>,
    team_id: i64,
    participant_id: i64,
) -> Result<()> {
    let team = load(&state.pool, team_id).await?;
    let _guard = state.event_locks.lock(team.event_id).await;

    stage::require_stage(&state.pool, team.event_id, Stage::TeamFormation).await?;
    if team.leader_id == participant_id {
        return Err(EngineError::StateConflict(
            "the team leader cannot leave the team".into(),
        ));
    }

    let deleted = sqlx::query(
        "DELETE FROM team_members WHERE team_id = ?1 AND participant_id = ?2",
    )
    .bind(team_id)
    .bind(participant_id)
    .execute(&state.pool)
    .await?;
    if deleted.rows_affected() == 0 {
        return Err(EngineError::NotFound("team membership"));
    }
    Ok(())
}

pub async fn members(pool: &SqlitePool, team_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT participant_id FROM team_members WHERE team_id = ?1 ORDER BY created_at ASC, id ASC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn team_of(
    pool: &SqlitePool,
    event_id: i64,
    participant_id: i64,
) -> Result<Option<Team>> {
    sqlx::query_as::<_, Team>(
        r#"
        SELECT t.*
        FROM   teams t
        JOIN   team_members m ON m.team_id = t.id
        WHERE  t.event_id = ?1 AND m.participant_id = ?2
        "#,
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

pub async fn teams_for_event(pool: &SqlitePool, event_id: i64) -> Result<Vec<Team>> {
    sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE event_id = ?1 ORDER BY created_at ASC")
        .bind(event_id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
}

async fn require_checked_in(pool: &SqlitePool, event_id: i64, participant_id: i64) -> Result<()> {
    if !registration::is_checked_in(pool, event_id, participant_id).await? {
        return Err(EngineError::StateConflict(format!(
            "participant {participant_id} has not checked in to event {event_id}"
        )));
    }
    Ok(())
}

async fn require_unaffiliated(pool: &SqlitePool, event_id: i64, participant_id: i64) -> Result<()> {
    if team_of(pool, event_id, participant_id).await?.is_some() {
        return Err(EngineError::StateConflict(format!(
            "participant {participant_id} already belongs to a team in event {event_id}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Submissions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewSubmission {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub draft: bool,
}

pub async fn load_submission(pool: &SqlitePool, submission_id: i64) -> Result<Submission> {
    sqlx::query_as::<_, Submission>("SELECT * FROM submissions WHERE id = ?1")
        .bind(submission_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("submission"))
}

/// Create the team's submission; leader only, one per team.
pub async fn submit<G: LedgerGateway>(
    state: &AppState<G>,
    team_id: i64,
    participant_id: i64,
    new: NewSubmission,
) -> Result<Submission> {
    let team = load(&state.pool, team_id).await?;
    let _guard = state.event_locks.lock(team.event_id).await;

    require_submission_open(state, team.event_id).await?;
    if team.leader_id != participant_id {
        return Err(EngineError::StateConflict(
            "only the team leader may create the submission".into(),
        ));
    }
    if new.name.trim().is_empty() {
        return Err(EngineError::Validation("submission name is required".into()));
    }
    if sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM submissions WHERE team_id = ?1")
        .bind(team_id)
        .fetch_one(&state.pool)
        .await?
        > 0
    {
        return Err(EngineError::StateConflict(format!(
            "team {team_id} already has a submission"
        )));
    }

    let now = db::now();
    let submission_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO submissions (event_id, team_id, name, description, link, draft, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        RETURNING id
        "#,
    )
    .bind(team.event_id)
    .bind(team_id)
    .bind(&new.name)
    .bind(&new.description)
    .bind(&new.link)
    .bind(new.draft as i64)
    .bind(now)
    .fetch_one(&state.pool)
    .await?;

    load_submission(&state.pool, submission_id).await
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub link: Option<String>,
    pub draft: Option<bool>,
}

/// Update the submission; any team member, while the window is open.
pub async fn update_submission<G: LedgerGateway>(
    state: &AppState<G>,
    submission_id: i64,
    participant_id: i64,
    patch: SubmissionUpdate,
) -> Result<Submission> {
    let submission = load_submission(&state.pool, submission_id).await?;
    let _guard = state.event_locks.lock(submission.event_id).await;

    require_submission_open(state, submission.event_id).await?;
    if !members(&state.pool, submission.team_id)
        .await?
        .contains(&participant_id)
    {
        return Err(EngineError::StateConflict(
            "only a team member may edit the submission".into(),
        ));
    }

    let name = patch.name.unwrap_or(submission.name);
    if name.trim().is_empty() {
        return Err(EngineError::Validation("submission name is required".into()));
    }
    let description = patch.description.unwrap_or(submission.description);
    let link = patch.link.unwrap_or(submission.link);
    let draft = patch.draft.map(i64::from).unwrap_or(submission.draft);

    sqlx::query(
        r#"
        UPDATE submissions
        SET    name = ?1, description = ?2, link = ?3, draft = ?4, updated_at = ?5
        WHERE  id = ?6
        "#,
    )
    .bind(&name)
    .bind(&description)
    .bind(&link)
    .bind(draft)
    .bind(db::now())
    .bind(submission_id)
    .execute(&state.pool)
    .await?;

    load_submission(&state.pool, submission_id).await
}

/// Finalized (non-draft) submissions for an event, oldest first.
pub async fn submissions_for_event(pool: &SqlitePool, event_id: i64) -> Result<Vec<Submission>> {
    sqlx::query_as::<_, Submission>(
        "SELECT * FROM submissions WHERE event_id = ?1 AND draft = 0 ORDER BY created_at ASC, id ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

async fn require_submission_open<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
) -> Result<()> {
    stage::require_stage(&state.pool, event_id, Stage::Submission).await?;
    if !event::in_window(&state.pool, event_id, Stage::Submission, db::now()).await? {
        return Err(EngineError::StateConflict(
            "submission window is not open".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use crate::event::testutil::seed_participant;
    use crate::gateway::mock::MockGateway;

    /// Check a fresh participant in and put them on a new single-member
    /// team, bypassing stage checks.
    pub async fn seed_team(
        state: &AppState<MockGateway>,
        event_id: i64,
        name: &str,
        wallet: &str,
    ) -> (i64, i64) {
        let p = seed_participant(&state.pool, wallet).await;
        sqlx::query(
            "INSERT INTO registrations (event_id, participant_id, created_at) VALUES (?1, ?2, 0)",
        )
        .bind(event_id)
        .bind(p)
        .execute(&state.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO checkins (event_id, participant_id, created_at) VALUES (?1, ?2, 0)",
        )
        .bind(event_id)
        .bind(p)
        .execute(&state.pool)
        .await
        .unwrap();
        let team_id: i64 = sqlx::query_scalar(
            "INSERT INTO teams (event_id, name, max_size, leader_id, created_at) VALUES (?1, ?2, 3, ?3, 0) RETURNING id",
        )
        .bind(event_id)
        .bind(name)
        .bind(p)
        .fetch_one(&state.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO team_members (team_id, participant_id, created_at) VALUES (?1, ?2, 0)",
        )
        .bind(team_id)
        .bind(p)
        .execute(&state.pool)
        .await
        .unwrap();
        (team_id, p)
    }

    /// Insert a finalized submission at `created_at`, bypassing stage
    /// checks.
    pub async fn seed_submission(
        state: &AppState<MockGateway>,
        event_id: i64,
        team_id: i64,
        name: &str,
        created_at: i64,
    ) -> i64 {
        sqlx::query_scalar(
            r#"
            INSERT INTO submissions (event_id, team_id, name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(team_id)
        .bind(name)
        .bind(created_at)
        .fetch_one(&state.pool)
        .await
        .unwrap()
    }
}
