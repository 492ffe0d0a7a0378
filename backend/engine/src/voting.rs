//! Voting and the final ranking.
//!
//! Votes are append-only history: revocation flips a flag and a revoked
//! vote frees the `(participant, submission)` slot for a fresh cast.
//! Tallies and the ranking count active votes only. The ranking itself
//! is computed inside the `results` stage transition so the stage flip
//! and the standings it implies commit together.

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gas;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror::{self, MirrorOutcome};
use crate::registration;
use crate::stage::{self, Stage};
use crate::state::AppState;
use crate::team;
use crate::types::{RankingEntry, Vote};

/// Cast a vote on a finalized submission.
///
/// The voter must be checked in, may not score their own team's work,
/// and holds at most one active vote per submission. When the event
/// caps votes per participant, active votes count against it; revoked
/// ones do not.
pub async fn cast_vote<G: LedgerGateway>(
    state: &AppState<G>,
    submission_id: i64,
    participant_id: i64,
    score: i64,
) -> Result<Vote> {
    let submission = team::load_submission(&state.pool, submission_id).await?;
    let event_id = submission.event_id;
    let _guard = state.event_locks.lock(event_id).await;

    let event = stage::require_stage(&state.pool, event_id, Stage::Voting).await?;
    if !event::in_window(&state.pool, event_id, Stage::Voting, db::now()).await? {
        return Err(EngineError::StateConflict("voting window is not open".into()));
    }
    if submission.draft != 0 {
        return Err(EngineError::StateConflict(
            "draft submissions cannot be voted on".into(),
        ));
    }
    if score < event.vote_score_min || score > event.vote_score_max {
        return Err(EngineError::Validation(format!(
            "score must be between {} and {}",
            event.vote_score_min, event.vote_score_max
        )));
    }
    let voter = registration::load_participant(&state.pool, participant_id).await?;
    if !registration::is_checked_in(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::StateConflict(format!(
            "participant {participant_id} has not checked in to event {event_id}"
        )));
    }
    if let Some(own_team) = team::team_of(&state.pool, event_id, participant_id).await? {
        if own_team.id == submission.team_id {
            return Err(EngineError::StateConflict(
                "participants cannot vote for their own team".into(),
            ));
        }
    }

    let active_on_submission: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM votes WHERE participant_id = ?1 AND submission_id = ?2 AND is_revoked = 0",
    )
    .bind(participant_id)
    .bind(submission_id)
    .fetch_one(&state.pool)
    .await?;
    if active_on_submission > 0 {
        return Err(EngineError::DuplicateVote {
            participant_id,
            submission_id,
        });
    }

    if event.max_votes_per_participant > 0 {
        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM votes WHERE event_id = ?1 AND participant_id = ?2 AND is_revoked = 0",
        )
        .bind(event_id)
        .bind(participant_id)
        .fetch_one(&state.pool)
        .await?;
        if active >= event.max_votes_per_participant {
            return Err(EngineError::StateConflict(format!(
                "participant {participant_id} has used all {} votes",
                event.max_votes_per_participant
            )));
        }
    }

    let op = LedgerOp::CastVote {
        chain_event_id: event.chain_event_id,
        submission_id,
        score,
    };
    // Guard before the internal write: a voter who cannot pay for the
    // mirror is refused outright rather than left with an unmirrored vote.
    if state.config.enforce_balance_guard {
        match gas::require_sufficient(&state.gateway, &op, &voter.wallet_address).await {
            Ok(_) => {}
            Err(e @ EngineError::InsufficientBalance { .. }) => return Err(e),
            Err(EngineError::ExternalUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let vote_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO votes (event_id, participant_id, submission_id, score, cast_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        RETURNING id
        "#,
    )
    .bind(event_id)
    .bind(participant_id)
    .bind(submission_id)
    .bind(score)
    .bind(db::now())
    .fetch_one(&state.pool)
    .await?;

    let outcome = mirror::mirror_write(
        &state.pool,
        &state.gateway,
        &state.config,
        event_id,
        &op,
        Some(&voter.wallet_address),
    )
    .await?;
    if let MirrorOutcome::Submitted { tx_id } = &outcome {
        sqlx::query("UPDATE votes SET tx_id = ?1 WHERE id = ?2")
            .bind(tx_id)
            .bind(vote_id)
            .execute(&state.pool)
            .await?;
    }

    load(&state.pool, vote_id).await
}

/// Revoke an active vote. The row stays in the history; the slot it
/// held becomes free for a new cast.
pub async fn revoke_vote<G: LedgerGateway>(
    state: &AppState<G>,
    vote_id: i64,
    participant_id: i64,
) -> Result<Vote> {
    let vote = load(&state.pool, vote_id).await?;
    let _guard = state.event_locks.lock(vote.event_id).await;

    let event = stage::require_stage(&state.pool, vote.event_id, Stage::Voting).await?;
    if vote.participant_id != participant_id {
        return Err(EngineError::StateConflict(
            "only the voter may revoke their vote".into(),
        ));
    }

    let voter = registration::load_participant(&state.pool, participant_id).await?;
    let op = LedgerOp::RevokeVote {
        chain_event_id: event.chain_event_id,
        vote_id,
    };
    if state.config.enforce_balance_guard {
        match gas::require_sufficient(&state.gateway, &op, &voter.wallet_address).await {
            Ok(_) => {}
            Err(e @ EngineError::InsufficientBalance { .. }) => return Err(e),
            Err(EngineError::ExternalUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let updated = sqlx::query(
        "UPDATE votes SET is_revoked = 1, revoked_at = ?1 WHERE id = ?2 AND is_revoked = 0",
    )
    .bind(db::now())
    .bind(vote_id)
    .execute(&state.pool)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(EngineError::StateConflict(format!(
            "vote {vote_id} is already revoked"
        )));
    }

    mirror::mirror_write(
        &state.pool,
        &state.gateway,
        &state.config,
        vote.event_id,
        &op,
        Some(&voter.wallet_address),
    )
    .await?;

    load(&state.pool, vote_id).await
}

pub async fn load(pool: &SqlitePool, vote_id: i64) -> Result<Vote> {
    sqlx::query_as::<_, Vote>("SELECT * FROM votes WHERE id = ?1")
        .bind(vote_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("vote"))
}

/// Full vote history of a participant in an event, revoked included,
/// oldest first.
pub async fn history(
    pool: &SqlitePool,
    event_id: i64,
    participant_id: i64,
) -> Result<Vec<Vote>> {
    sqlx::query_as::<_, Vote>(
        "SELECT * FROM votes WHERE event_id = ?1 AND participant_id = ?2 ORDER BY cast_at ASC, id ASC",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Active-score totals per submission. Submissions without votes tally
/// zero; the verifier compares these against the ledger.
pub async fn tallies(pool: &SqlitePool, event_id: i64) -> Result<Vec<(i64, i64)>> {
    sqlx::query_as(
        r#"
        SELECT s.id,
               COALESCE(SUM(CASE WHEN v.is_revoked = 0 THEN v.score END), 0)
        FROM   submissions s
        LEFT JOIN votes v ON v.submission_id = s.id
        WHERE  s.event_id = ?1 AND s.draft = 0
        GROUP  BY s.id
        ORDER  BY s.id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// Recompute the final standings for an event.
///
/// Runs on the caller's transaction so the `results` transition and the
/// ranking it freezes are one atomic write. Ordering is total score
/// descending, ties broken by earliest submission.
pub async fn compute_ranking(tx: &mut Transaction<'_, Sqlite>, event_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM rankings WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut **tx)
        .await?;

    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT s.id,
               COALESCE(SUM(CASE WHEN v.is_revoked = 0 THEN v.score END), 0) AS total
        FROM   submissions s
        LEFT JOIN votes v ON v.submission_id = s.id
        WHERE  s.event_id = ?1 AND s.draft = 0
        GROUP  BY s.id
        ORDER  BY total DESC, s.created_at ASC, s.id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(&mut **tx)
    .await?;

    for (rank0, (submission_id, total_score)) in rows.into_iter().enumerate() {
        sqlx::query(
            "INSERT INTO rankings (event_id, submission_id, rank, total_score) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id)
        .bind(submission_id)
        .bind(rank0 as i64 + 1)
        .bind(total_score)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct RankedSubmission {
    pub rank: i64,
    pub submission_id: i64,
    pub team_id: i64,
    pub name: String,
    pub total_score: i64,
}

/// The frozen standings, best first. Empty until the event reaches
/// `results`.
pub async fn ranking(pool: &SqlitePool, event_id: i64) -> Result<Vec<RankedSubmission>> {
    let rows: Vec<(i64, i64, i64, String, i64)> = sqlx::query_as(
        r#"
        SELECT r.rank, r.submission_id, s.team_id, s.name, r.total_score
        FROM   rankings r
        JOIN   submissions s ON s.id = r.submission_id
        WHERE  r.event_id = ?1
        ORDER  BY r.rank ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(rank, submission_id, team_id, name, total_score)| RankedSubmission {
            rank,
            submission_id,
            team_id,
            name,
            total_score,
        })
        .collect())
}

/// Ranking rows for an event straight from storage.
pub async fn ranking_entries(pool: &SqlitePool, event_id: i64) -> Result<Vec<RankingEntry>> {
    sqlx::query_as::<_, RankingEntry>(
        "SELECT * FROM rankings WHERE event_id = ?1 ORDER BY rank ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testutil::seed_event;
    use crate::state::testutil::mock_state;
    use crate::team::testutil::{seed_submission, seed_team};

    #[tokio::test]
    async fn score_outside_bounds_rejected() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (_, voter) = seed_team(&state, event_id, "B", "0xbbb").await;
        let submission = seed_submission(&state, event_id, team_a, "Proj", 100).await;

        let err = cast_vote(&state, submission, voter, 11).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = cast_vote(&state, submission, voter, 0).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn own_team_vote_rejected() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, leader_a) = seed_team(&state, event_id, "A", "0xaaa").await;
        let submission = seed_submission(&state, event_id, team_a, "Proj", 100).await;

        let err = cast_vote(&state, submission, leader_a, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn duplicate_active_vote_rejected_but_revoke_frees_the_slot() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (_, voter) = seed_team(&state, event_id, "B", "0xbbb").await;
        let submission = seed_submission(&state, event_id, team_a, "Proj", 100).await;

        let first = cast_vote(&state, submission, voter, 5).await.unwrap();
        let err = cast_vote(&state, submission, voter, 7).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateVote { .. }));

        revoke_vote(&state, first.id, voter).await.unwrap();
        let second = cast_vote(&state, submission, voter, 7).await.unwrap();
        assert_ne!(first.id, second.id);

        // Both casts survive in the history.
        let trail = history(&state.pool, event_id, voter).await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].is_revoked, 1);
        assert_eq!(trail[1].is_revoked, 0);
    }

    #[tokio::test]
    async fn double_revocation_conflicts() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (_, voter) = seed_team(&state, event_id, "B", "0xbbb").await;
        let submission = seed_submission(&state, event_id, team_a, "Proj", 100).await;
        let vote = cast_vote(&state, submission, voter, 5).await.unwrap();

        revoke_vote(&state, vote.id, voter).await.unwrap();
        let err = revoke_vote(&state, vote.id, voter).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn vote_cap_counts_active_votes_only() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        sqlx::query("UPDATE events SET max_votes_per_participant = 1 WHERE id = ?1")
            .bind(event_id)
            .execute(&state.pool)
            .await
            .unwrap();
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (team_b, _) = seed_team(&state, event_id, "B", "0xbbb").await;
        let (_, voter) = seed_team(&state, event_id, "C", "0xccc").await;
        let sub_a = seed_submission(&state, event_id, team_a, "PA", 100).await;
        let sub_b = seed_submission(&state, event_id, team_b, "PB", 101).await;

        let vote = cast_vote(&state, sub_a, voter, 5).await.unwrap();
        let err = cast_vote(&state, sub_b, voter, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));

        revoke_vote(&state, vote.id, voter).await.unwrap();
        cast_vote(&state, sub_b, voter, 5).await.unwrap();
    }

    #[tokio::test]
    async fn balance_guard_refuses_cast_and_revoke() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (_, voter) = seed_team(&state, event_id, "B", "0xbbb").await;
        let submission = seed_submission(&state, event_id, team_a, "Proj", 100).await;

        state
            .gateway
            .balance_minor
            .store(0, std::sync::atomic::Ordering::SeqCst);
        let err = cast_vote(&state, submission, voter, 5).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(history(&state.pool, event_id, voter).await.unwrap().is_empty());

        state
            .gateway
            .balance_minor
            .store(1_000_000, std::sync::atomic::Ordering::SeqCst);
        let vote = cast_vote(&state, submission, voter, 5).await.unwrap();

        state
            .gateway
            .balance_minor
            .store(0, std::sync::atomic::Ordering::SeqCst);
        let err = revoke_vote(&state, vote.id, voter).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert_eq!(load(&state.pool, vote.id).await.unwrap().is_revoked, 0);
    }

    #[tokio::test]
    async fn ranking_orders_by_score_then_earliest_submission() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (team_b, _) = seed_team(&state, event_id, "B", "0xbbb").await;
        let (team_c, _) = seed_team(&state, event_id, "C", "0xccc").await;
        let (_, v1) = seed_team(&state, event_id, "V1", "0xd01").await;
        let (_, v2) = seed_team(&state, event_id, "V2", "0xd02").await;

        // B submitted before A; C scores highest.
        let sub_a = seed_submission(&state, event_id, team_a, "PA", 200).await;
        let sub_b = seed_submission(&state, event_id, team_b, "PB", 100).await;
        let sub_c = seed_submission(&state, event_id, team_c, "PC", 300).await;

        cast_vote(&state, sub_a, v1, 5).await.unwrap();
        cast_vote(&state, sub_b, v2, 5).await.unwrap();
        cast_vote(&state, sub_c, v1, 8).await.unwrap();
        cast_vote(&state, sub_c, v2, 9).await.unwrap();
        // A revoked vote must not count.
        let extra = cast_vote(&state, sub_a, v2, 10).await.unwrap();
        revoke_vote(&state, extra.id, v1).await.unwrap_err();
        revoke_vote(&state, extra.id, v2).await.unwrap();

        let mut tx = state.pool.begin().await.unwrap();
        compute_ranking(&mut tx, event_id).await.unwrap();
        tx.commit().await.unwrap();

        let standings = ranking(&state.pool, event_id).await.unwrap();
        assert_eq!(standings.len(), 3);
        assert_eq!(standings[0].submission_id, sub_c);
        assert_eq!(standings[0].total_score, 17);
        // A and B tie at 5; B submitted earlier so it ranks higher.
        assert_eq!(standings[1].submission_id, sub_b);
        assert_eq!(standings[2].submission_id, sub_a);
        assert_eq!(standings[1].rank, 2);
        assert_eq!(standings[2].rank, 3);
    }

    #[tokio::test]
    async fn recomputation_is_stable() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Voting).await;
        let (team_a, _) = seed_team(&state, event_id, "A", "0xaaa").await;
        let (_, voter) = seed_team(&state, event_id, "B", "0xbbb").await;
        let sub = seed_submission(&state, event_id, team_a, "PA", 100).await;
        cast_vote(&state, sub, voter, 7).await.unwrap();

        for _ in 0..2 {
            let mut tx = state.pool.begin().await.unwrap();
            compute_ranking(&mut tx, event_id).await.unwrap();
            tx.commit().await.unwrap();
        }
        let entries = ranking_entries(&state.pool, event_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].total_score, 7);
    }
}
