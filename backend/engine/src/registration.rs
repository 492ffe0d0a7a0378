//! Registration and check-in.
//!
//! Both are window-gated writes keyed on `(event_id, participant_id)`;
//! the unique constraints in the schema make a retried request a clean
//! conflict instead of a double-apply. Check-in is the first operation
//! mirrored on behalf of a participant wallet, so it is also where the
//! balance guard first applies.

use sqlx::SqlitePool;
use tracing::warn;

use crate::credential;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gas;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror::{self, MirrorOutcome};
use crate::stage::{self, Stage};
use crate::state::AppState;
use crate::types::{Checkin, Participant, Registration};

pub async fn load_participant(pool: &SqlitePool, participant_id: i64) -> Result<Participant> {
    sqlx::query_as::<_, Participant>("SELECT * FROM participants WHERE id = ?1")
        .bind(participant_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("participant"))
}

/// Find-or-create a participant by wallet address.
pub async fn upsert_participant(
    pool: &SqlitePool,
    wallet_address: &str,
    nickname: &str,
) -> Result<Participant> {
    if wallet_address.trim().is_empty() {
        return Err(EngineError::Validation("wallet_address is required".into()));
    }
    sqlx::query(
        r#"
        INSERT INTO participants (wallet_address, nickname, created_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (wallet_address) DO UPDATE SET nickname = excluded.nickname
        "#,
    )
    .bind(wallet_address)
    .bind(nickname)
    .bind(db::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, Participant>("SELECT * FROM participants WHERE wallet_address = ?1")
        .bind(wallet_address)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
}

/// Register a participant for an event.
///
/// Requires the event to be in `registration` with the window open, and
/// respects the participant cap when one is set.
pub async fn register<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    participant_id: i64,
) -> Result<Registration> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    if event.stage != Stage::Registration.as_str()
        || !event::in_window(&state.pool, event_id, Stage::Registration, db::now()).await?
    {
        return Err(EngineError::EventNotOpenForRegistration(event_id));
    }
    load_participant(&state.pool, participant_id).await?;

    if is_registered(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::AlreadyRegistered {
            event_id,
            participant_id,
        });
    }

    if event.max_participants > 0 {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM registrations WHERE event_id = ?1")
                .bind(event_id)
                .fetch_one(&state.pool)
                .await?;
        if count >= event.max_participants {
            return Err(EngineError::StateConflict(format!(
                "event {event_id} is full ({} participants)",
                event.max_participants
            )));
        }
    }

    sqlx::query(
        "INSERT INTO registrations (event_id, participant_id, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(event_id)
    .bind(participant_id)
    .bind(db::now())
    .execute(&state.pool)
    .await?;

    sqlx::query_as::<_, Registration>(
        "SELECT * FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_one(&state.pool)
    .await
    .map_err(Into::into)
}

/// Withdraw a registration. Only legal while the event is still in
/// `registration`; blocked once the participant has checked in, since
/// attendance is a ledger-mirrored fact and is not unwound here.
pub async fn cancel_registration<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    participant_id: i64,
) -> Result<()> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    if event.stage != Stage::Registration.as_str() {
        return Err(EngineError::StateConflict(format!(
            "registration for event {event_id} is closed"
        )));
    }
    if !is_registered(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::NotRegistered {
            event_id,
            participant_id,
        });
    }
    if is_checked_in(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::StateConflict(
            "registration cannot be withdrawn after check-in".into(),
        ));
    }

    sqlx::query("DELETE FROM registrations WHERE event_id = ?1 AND participant_id = ?2")
        .bind(event_id)
        .bind(participant_id)
        .execute(&state.pool)
        .await?;
    Ok(())
}

/// Check a registered participant in, mirror the attendance to the
/// ledger, and mint their credential.
///
/// The check-in row commits first; the credential mint is idempotent and
/// a gateway outage leaves `tx_id` empty for the verifier to pick up.
pub async fn check_in<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    participant_id: i64,
) -> Result<Checkin> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = stage::require_stage(&state.pool, event_id, Stage::Checkin).await?;
    if !event::in_window(&state.pool, event_id, Stage::Checkin, db::now()).await? {
        return Err(EngineError::StateConflict(format!(
            "check-in window for event {event_id} is not open"
        )));
    }
    let participant = load_participant(&state.pool, participant_id).await?;

    if !is_registered(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::NotRegistered {
            event_id,
            participant_id,
        });
    }
    if is_checked_in(&state.pool, event_id, participant_id).await? {
        return Err(EngineError::AlreadyCheckedIn {
            event_id,
            participant_id,
        });
    }

    let op = LedgerOp::CheckIn {
        chain_event_id: event.chain_event_id,
        wallet_address: participant.wallet_address.clone(),
    };
    // Guard before the internal write: a participant who cannot pay for
    // the mirror is refused outright rather than left half checked in.
    if state.config.enforce_balance_guard {
        match gas::require_sufficient(&state.gateway, &op, &participant.wallet_address).await {
            Ok(_) => {}
            Err(e @ EngineError::InsufficientBalance { .. }) => return Err(e),
            Err(EngineError::ExternalUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
    }

    sqlx::query(
        "INSERT INTO checkins (event_id, participant_id, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(event_id)
    .bind(participant_id)
    .bind(db::now())
    .execute(&state.pool)
    .await?;

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
        sqlx::query(
            "UPDATE checkins SET tx_id = ?1 WHERE event_id = ?2 AND participant_id = ?3",
        )
        .bind(tx_id)
        .bind(event_id)
        .bind(participant_id)
        .execute(&state.pool)
        .await?;
    }

    if let Err(e) = credential::mint(state, event_id, participant_id).await {
        // Attendance stands either way; the credential can be re-minted.
        warn!("Credential mint deferred for participant {participant_id}: {e}");
    }

    sqlx::query_as::<_, Checkin>(
        "SELECT * FROM checkins WHERE event_id = ?1 AND participant_id = ?2",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_one(&state.pool)
    .await
    .map_err(Into::into)
}

pub async fn is_registered(pool: &SqlitePool, event_id: i64, participant_id: i64) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}

pub async fn is_checked_in(pool: &SqlitePool, event_id: i64, participant_id: i64) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM checkins WHERE event_id = ?1 AND participant_id = ?2",
    )
    .bind(event_id)
    .bind(participant_id)
    .fetch_one(pool)
    .await?;
    Ok(n > 0)
}

/// Wallet addresses of everyone checked in, ordered by check-in time.
/// This is the roster the verifier compares against the ledger.
pub async fn checked_in_wallets(pool: &SqlitePool, event_id: i64) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT p.wallet_address
        FROM   checkins c
        JOIN   participants p ON p.id = c.participant_id
        WHERE  c.event_id = ?1
        ORDER  BY c.created_at ASC, c.id ASC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(w,)| w).collect())
}

pub async fn registrations_for_event(
    pool: &SqlitePool,
    event_id: i64,
) -> Result<Vec<Registration>> {
    sqlx::query_as::<_, Registration>(
        "SELECT * FROM registrations WHERE event_id = ?1 ORDER BY created_at ASC",
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
    use crate::state::testutil::mock_state;

    #[tokio::test]
    async fn register_requires_registration_stage() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Preparation).await;
        let p = seed_participant(&state.pool, "0xaaa").await;

        let err = register(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::EventNotOpenForRegistration(_)));
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;

        register(&state, event_id, p).await.unwrap();
        let err = register(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn participant_cap_is_enforced() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        sqlx::query("UPDATE events SET max_participants = 1 WHERE id = ?1")
            .bind(event_id)
            .execute(&state.pool)
            .await
            .unwrap();

        let a = seed_participant(&state.pool, "0xaaa").await;
        let b = seed_participant(&state.pool, "0xbbb").await;
        register(&state, event_id, a).await.unwrap();

        let err = register(&state, event_id, b).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }

    #[tokio::test]
    async fn check_in_mirrors_and_mints() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        let checkin = check_in(&state, event_id, p).await.unwrap();
        assert!(checkin.tx_id.is_some());

        let ops = state.gateway.submitted_ops();
        assert!(ops
            .iter()
            .any(|op| matches!(op, LedgerOp::CheckIn { wallet_address, .. } if wallet_address == "0xaaa")));
        assert!(ops
            .iter()
            .any(|op| matches!(op, LedgerOp::MintCredential { .. })));
    }

    #[tokio::test]
    async fn check_in_requires_prior_registration() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Checkin).await;
        let p = seed_participant(&state.pool, "0xaaa").await;

        let err = check_in(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn second_check_in_conflicts() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        check_in(&state, event_id, p).await.unwrap();
        let err = check_in(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyCheckedIn { .. }));
    }

    #[tokio::test]
    async fn gateway_outage_keeps_the_checkin() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        state
            .gateway
            .unavailable
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let checkin = check_in(&state, event_id, p).await.unwrap();
        assert!(checkin.tx_id.is_none());
        assert!(is_checked_in(&state.pool, event_id, p).await.unwrap());
    }

    #[tokio::test]
    async fn balance_guard_refuses_check_in() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        state
            .gateway
            .balance_minor
            .store(0, std::sync::atomic::Ordering::SeqCst);
        let err = check_in(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        assert!(!is_checked_in(&state.pool, event_id, p).await.unwrap());
    }

    #[tokio::test]
    async fn withdrawal_blocked_once_registration_closes() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();

        let err = cancel_registration(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
        assert!(is_registered(&state.pool, event_id, p).await.unwrap());
    }

    #[tokio::test]
    async fn withdrawal_allowed_while_registration_is_open() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();

        cancel_registration(&state, event_id, p).await.unwrap();
        assert!(!is_registered(&state.pool, event_id, p).await.unwrap());
    }

    #[tokio::test]
    async fn withdrawal_blocked_after_check_in() {
        let state = mock_state().await;
        let event_id = seed_event(&state, Stage::Registration).await;
        let p = seed_participant(&state.pool, "0xaaa").await;
        register(&state, event_id, p).await.unwrap();
        stage::switch_stage(&state, event_id, Stage::Checkin, false)
            .await
            .unwrap();
        check_in(&state, event_id, p).await.unwrap();

        let err = cancel_registration(&state, event_id, p).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict(_)));
    }
}
