//! Mirror journal — submits state-changing writes to the external ledger
//! and tracks their confirmation from a background task.
//!
//! The internal store is the operational source of truth: a mirrored
//! write is submitted *after* the internal fact has committed, and a
//! failed or timed-out mirror never rolls that fact back. It is journaled
//! and left for the reconciliation verifier and/or an operator retry.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::gas;
use crate::gateway::{LedgerGateway, LedgerOp, TxStatus};
use crate::types::LedgerTransaction;

/// Outcome of a mirror attempt. `Unavailable` is a declared failure the
/// caller may surface, never a silent skip.
#[derive(Debug, Clone)]
pub enum MirrorOutcome {
    Submitted { tx_id: String },
    Unavailable { reason: String },
}

impl MirrorOutcome {
    pub fn tx_id(&self) -> Option<&str> {
        match self {
            Self::Submitted { tx_id } => Some(tx_id),
            Self::Unavailable { .. } => None,
        }
    }
}

/// Submit `op` to the ledger and journal the pending transaction.
///
/// When `caller_address` is given and the balance guard is enforced, an
/// insufficient balance is a hard [`EngineError::InsufficientBalance`] —
/// the caller asked us to respect the guard, so we refuse the write.
/// A gateway outage, by contrast, is reported as
/// [`MirrorOutcome::Unavailable`] so the internal operation can proceed.
pub async fn mirror_write<G: LedgerGateway>(
    pool: &SqlitePool,
    gateway: &G,
    config: &Config,
    event_id: i64,
    op: &LedgerOp,
    caller_address: Option<&str>,
) -> Result<MirrorOutcome> {
    if config.enforce_balance_guard {
        if let Some(address) = caller_address {
            match gas::require_sufficient(gateway, op, address).await {
                Ok(_) => {}
                Err(e @ EngineError::InsufficientBalance { .. }) => return Err(e),
                Err(EngineError::ExternalUnavailable(reason)) => {
                    // Estimation being unreachable is inconclusive; the
                    // submit below will fail the same way if the gateway
                    // is really down.
                    warn!("Balance guard skipped, gateway unreachable: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    match gateway.submit(op).await {
        Ok(tx_id) => {
            journal_pending(pool, event_id, &tx_id, op).await?;
            info!(
                "Mirrored {} for event {event_id} as tx {tx_id}",
                op.name()
            );
            Ok(MirrorOutcome::Submitted { tx_id })
        }
        Err(EngineError::ExternalUnavailable(reason)) => {
            warn!(
                "Mirror of {} for event {event_id} unavailable: {reason}",
                op.name()
            );
            Ok(MirrorOutcome::Unavailable { reason })
        }
        Err(e) => Err(e),
    }
}

async fn journal_pending(
    pool: &SqlitePool,
    event_id: i64,
    tx_id: &str,
    op: &LedgerOp,
) -> Result<()> {
    let detail = serde_json::to_string(op)?;
    sqlx::query(
        r#"
        INSERT INTO ledger_transactions (event_id, tx_id, operation, detail, status, submitted_at)
        VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
        "#,
    )
    .bind(event_id)
    .bind(tx_id)
    .bind(op.name())
    .bind(detail)
    .bind(db::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// All journal rows for an event, newest first.
pub async fn transactions_for_event(
    pool: &SqlitePool,
    event_id: i64,
) -> Result<Vec<LedgerTransaction>> {
    let rows = sqlx::query_as::<_, LedgerTransaction>(
        r#"
        SELECT id, event_id, tx_id, operation, detail, status, submitted_at, confirmed_at
        FROM   ledger_transactions
        WHERE  event_id = ?1
        ORDER  BY submitted_at DESC, id DESC
        "#,
    )
    .bind(event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Confirmation worker
// ─────────────────────────────────────────────────────────

pub struct MirrorState<G> {
    pub pool: SqlitePool,
    pub gateway: G,
    pub config: Config,
}

/// Long-running confirmation loop, spawned from `main`.
pub async fn run<G: LedgerGateway>(state: Arc<MirrorState<G>>) {
    info!("Mirror confirmation worker starting");
    loop {
        if let Err(e) = poll_once(&state.pool, &state.gateway, &state.config).await {
            error!("Confirmation poll error: {e}");
        }
        tokio::time::sleep(Duration::from_secs(state.config.confirm_poll_interval_secs)).await;
    }
}

/// One confirmation sweep. Public so tests can drive the worker
/// deterministically without the loop.
pub async fn poll_once<G: LedgerGateway>(
    pool: &SqlitePool,
    gateway: &G,
    config: &Config,
) -> Result<usize> {
    // Pending rows, plus timed-out rows that might have confirmed late.
    // Ledger writes cannot be un-submitted, so "failed by timeout" is
    // always re-checked opportunistically.
    let candidates = sqlx::query_as::<_, LedgerTransaction>(
        r#"
        SELECT id, event_id, tx_id, operation, detail, status, submitted_at, confirmed_at
        FROM   ledger_transactions
        WHERE  status = 'pending'
           OR  (status = 'failed' AND confirmed_at IS NULL)
        ORDER  BY submitted_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let now = db::now();
    let mut updated = 0usize;

    for tx in &candidates {
        match gateway.status(&tx.tx_id).await {
            Ok(TxStatus::Confirmed) => {
                sqlx::query(
                    "UPDATE ledger_transactions SET status = 'confirmed', confirmed_at = ?1 WHERE id = ?2",
                )
                .bind(now)
                .bind(tx.id)
                .execute(pool)
                .await?;
                updated += 1;
            }
            Ok(TxStatus::Failed) => {
                // A ledger-reported failure is terminal; stamp confirmed_at
                // so it is no longer re-checked.
                sqlx::query(
                    "UPDATE ledger_transactions SET status = 'failed', confirmed_at = ?1 WHERE id = ?2",
                )
                .bind(now)
                .bind(tx.id)
                .execute(pool)
                .await?;
                updated += 1;
                if config.auto_retry_failed_mirrors {
                    retry_submit(pool, gateway, tx).await;
                }
            }
            Ok(TxStatus::Pending) => {
                if tx.status == "pending" && now - tx.submitted_at > config.confirm_timeout_secs {
                    // Not confirmed within the window: treated as failed
                    // for reconciliation, confirmed_at left NULL so it
                    // keeps being re-checked.
                    sqlx::query(
                        "UPDATE ledger_transactions SET status = 'failed' WHERE id = ?1",
                    )
                    .bind(tx.id)
                    .execute(pool)
                    .await?;
                    updated += 1;
                    warn!(
                        "Mirror tx {} ({}) timed out after {}s",
                        tx.tx_id, tx.operation, config.confirm_timeout_secs
                    );
                }
            }
            Err(e) => {
                // Inconclusive; leave the row untouched for the next sweep.
                warn!("Status check for {} inconclusive: {e}", tx.tx_id);
            }
        }
    }

    Ok(updated)
}

/// Resubmission policy for ledger-reported failures. Off by default;
/// when on, the new attempt gets its own journal row.
async fn retry_submit<G: LedgerGateway>(pool: &SqlitePool, gateway: &G, failed: &LedgerTransaction) {
    let op: LedgerOp = match serde_json::from_str(&failed.detail) {
        Ok(op) => op,
        Err(e) => {
            error!("Cannot replay journal row {}: {e}", failed.id);
            return;
        }
    };
    match gateway.submit(&op).await {
        Ok(tx_id) => {
            if let Err(e) = journal_pending(pool, failed.event_id, &tx_id, &op).await {
                error!("Journal of retried mirror failed: {e}");
            } else {
                info!("Resubmitted {} as tx {tx_id}", failed.tx_id);
            }
        }
        Err(e) => warn!("Retry of {} failed: {e}", failed.tx_id),
    }
}
