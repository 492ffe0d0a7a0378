//! Attendance credentials (non-transferable tokens), one per
//! `(event, participant)`.
//!
//! Minting is idempotent: a repeat request returns the existing
//! credential with its original token id. Token ids are a single global
//! sequence across every event so a credential is identifiable without
//! its event context. This module takes no event lock of its own; the
//! schema's unique constraints carry the idempotency, which lets
//! check-in call into it while already holding the lock.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror::{self, MirrorOutcome};
use crate::registration;
use crate::state::AppState;
use crate::types::Credential;

/// Hard cap on a single batch mint request.
pub const MAX_BATCH_SIZE: usize = 50;

/// Mint the credential for a checked-in participant, or return the one
/// they already hold.
pub async fn mint<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    participant_id: i64,
) -> Result<Credential> {
    let event = event::load(&state.pool, event_id).await?;
    let participant = registration::load_participant(&state.pool, participant_id).await?;

    if let Some(existing) = find(&state.pool, event_id, participant_id).await? {
        return Ok(existing);
    }

    if !registration::is_checked_in(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::StateConflict(format!(
            "participant {participant_id} has not checked in to event {event_id}"
        )));
    }

    // Token id allocation and the insert are one statement, so two
    // racing mints cannot draw the same id.
    let inserted = sqlx::query(
        r#"
        INSERT INTO credentials (event_id, participant_id, token_id, minted_at)
        VALUES (?1, ?2, (SELECT COALESCE(MAX(token_id), 0) + 1 FROM credentials), ?3)
        ON CONFLICT (event_id, participant_id) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(participant_id)
    .bind(db::now())
    .execute(&state.pool)
    .await?;

    let credential = find(&state.pool, event_id, participant_id)
        .await?
        .ok_or(EngineError::NotFound("credential"))?;

    // Only the insert that won the race mirrors the mint.
    if inserted.rows_affected() > 0 {
        let op = LedgerOp::MintCredential {
            chain_event_id: event.chain_event_id,
            wallet_address: participant.wallet_address.clone(),
            token_id: credential.token_id,
        };
        let outcome = mirror::mirror_write(
            &state.pool,
            &state.gateway,
            &state.config,
            event_id,
            &op,
            Some(&participant.wallet_address),
        )
        .await?;
        if let MirrorOutcome::Submitted { tx_id } = &outcome {
            sqlx::query("UPDATE credentials SET tx_id = ?1 WHERE id = ?2")
                .bind(tx_id)
                .bind(credential.id)
                .execute(&state.pool)
                .await?;
        }
    }

    find(&state.pool, event_id, participant_id)
        .await?
        .ok_or(EngineError::NotFound("credential"))
}

/// One entry of a batch mint result. Failures are reported per entry;
/// they never abort the rest of the batch.
#[derive(Debug, Serialize)]
pub struct BatchMintEntry {
    pub participant_id: i64,
    pub token_id: Option<i64>,
    pub error: Option<String>,
}

/// Mint credentials for up to [`MAX_BATCH_SIZE`] participants in one
/// request.
pub async fn batch_mint<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    participant_ids: &[i64],
) -> Result<Vec<BatchMintEntry>> {
    if participant_ids.is_empty() {
        return Err(EngineError::Validation(
            "participant_ids must not be empty".into(),
        ));
    }
    if participant_ids.len() > MAX_BATCH_SIZE {
        return Err(EngineError::Validation(format!(
            "batch size {} exceeds the maximum of {MAX_BATCH_SIZE}",
            participant_ids.len()
        )));
    }

    let mut entries = Vec::with_capacity(participant_ids.len());
    for &participant_id in participant_ids {
        match mint(state, event_id, participant_id).await {
            Ok(credential) => entries.push(BatchMintEntry {
                participant_id,
                token_id: Some(credential.token_id),
                error: None,
            }),
            Err(e) => entries.push(BatchMintEntry {
                participant_id,
                token_id: None,
                error: Some(e.to_string()),
            }),
        }
    }
    Ok(entries)
}

pub async fn find(
    pool: &SqlitePool,
    event_id: i64,
    participant_id: i64,
) -> Result<Option<Credential>> {
    sqlx::query_as::<_, Credential>(
        "SELECT * FROM credentials WHERE event_id = ?1 AND participant_id = ?2",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_optional(pool)
    .await
    .map_err(Into::into)
}

/// Every credential a wallet holds, active and inactive.
pub async fn for_participant(pool: &SqlitePool, participant_id: i64) -> Result<Vec<Credential>> {
    sqlx::query_as::<_, Credential>(
        "SELECT * FROM credentials WHERE participant_id = ?1 ORDER BY minted_at ASC",
    )
    .bind(participant_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

pub async fn for_event(pool: &SqlitePool, event_id: i64) -> Result<Vec<Credential>> {
    sqlx::query_as::<_, Credential>(
        "SELECT * FROM credentials WHERE event_id = ?1 ORDER BY token_id ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testutil::{seed_event, seed_participant};
    use crate::stage::Stage;
    use crate::gateway::mock::MockGateway;
    use crate::state::testutil::mock_state;

    async fn seed_checked_in(
        state: &AppState<MockGateway>,
        event_id: i64,
        wallet: &str,
    ) -> i64 {
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
        p
    }

    #[tokio::test]
    async fn mint_is_idempotent() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let p = seed_checked_in(&state, event_id, "0xaaa").await;

        let first = mint(&state, event_id, p).await.unwrap();
        let second = mint(&state, event_id, p).await.unwrap();
        assert_eq!(first.token_id, second.token_id);
        assert_eq!(first.id, second.id);

        // One mirror for one mint.
        let mints = state
            .gateway
            .submitted_ops()
            .into_iter()
            .filter(|op| matches!(op, LedgerOp::MintCredential { .. }))
            .count();
        assert_eq!(mints, 1);
    }

    #[tokio::test]
    async fn token_ids_form_a_global_sequence() {
        let state = mock_state().await;
        let event_a = seed_event(&state, Stage::Checkin).await;
        let event_b = seed_event(&state, Stage::Checkin).await;
        let pa = seed_checked_in(&state, event_a, "0xaaa").await;
        let pb = seed_checked_in(&state, event_b, "0xbbb").await;

        let ca = mint(&state, event_a, pa).await.unwrap();
        let cb = mint(&state, event_b, pb).await.unwrap();
        assert_eq!(ca.token_id, 1);
        assert_eq!(cb.token_id, 2);
    }

    #[tokio::test]
    async fn mint_requires_check_in() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let p = seed_participant(&state.pool, "0xaaa").await;

        let err = mint(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn balance_guard_refuses_the_mint_mirror() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let p = seed_checked_in(&state, event_id, "0xaaa").await;

        state
            .gateway
            .balance_minor
            .store(0, std::sync::atomic::Ordering::SeqCst);
        let err = mint(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(state
            .gateway
            .submitted_ops()
            .iter()
            .all(|op| !matches!(op, LedgerOp::MintCredential { .. })));
    }

    #[tokio::test]
    async fn batch_reports_per_entry_results() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let good = seed_checked_in(&state, event_id, "0xaaa").await;
        let not_checked_in = seed_participant(&state.pool, "0xbbb").await;

        let entries = batch_mint(&state, event_id, &[good, not_checked_in, 9999])
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].token_id.is_some());
        assert!(entries[1].error.is_some());
        assert!(entries[2].error.is_some());
    }

    #[tokio::test]
    async fn batch_size_is_capped() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let ids: Vec<i64> = (1..=(MAX_BATCH_SIZE as i64 + 1)).collect();

        let err = batch_mint(&state, event_id, &ids).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
