//! Prize pool — sponsorships in, one-shot distribution out.
//!
//! Sponsorship money enters the pool only on explicit approval, and the
//! decision on a sponsorship happens at most once (a conditional update
//! on its `pending` status). Distribution itself is guarded the same
//! way by the pool's `distributed` flag; every validation runs inside
//! the distribution transaction, so a failed attempt rolls the flag
//! back and the pool stays distributable.

use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db;
use crate::errors::{EngineError, Result};
use crate::event;
use crate::gas;
use crate::gateway::{LedgerGateway, LedgerOp};
use crate::mirror::{self, MirrorOutcome};
use crate::stage::{self, Stage};
use crate::state::AppState;
use crate::team;
use crate::types::{Payout, PrizePool, Sponsorship};

/// Offer a sponsorship for an event. The amount is escrowed on the
/// ledger immediately; it joins the pool only when the organizer
/// approves.
pub async fn request_sponsorship<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    sponsor_address: &str,
    amount_minor: i64,
) -> Result<Sponsorship> {
    let event = event::load(&state.pool, event_id).await?;
    let current = stage::Stage::parse(&event.stage)?;
    if current.is_terminal() {
        return Err(EngineError::StateConflict(format!(
            "event {event_id} no longer accepts sponsorships"
        )));
    }
    if sponsor_address.trim().is_empty() {
        return Err(EngineError::Validation("sponsor_address is required".into()));
    }
    if amount_minor <= 0 {
        return Err(EngineError::Validation(
            "sponsorship amount must be positive".into(),
        ));
    }

    let op = LedgerOp::EscrowSponsorship {
        chain_event_id: event.chain_event_id,
        sponsor_address: sponsor_address.to_string(),
        amount_minor,
    };
    // A sponsor who cannot fund the escrow gets refused before any row
    // is written.
    if state.config.enforce_balance_guard {
        match gas::require_sufficient(&state.gateway, &op, sponsor_address).await {
            Ok(_) => {}
            Err(e @ EngineError::InsufficientBalance { .. }) => return Err(e),
            Err(EngineError::ExternalUnavailable(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let sponsorship_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sponsorships (event_id, sponsor_address, amount_minor, created_at)
        VALUES (?1, ?2, ?3, ?4)
        RETURNING id
        "#,
    )
    .bind(event_id)
    .bind(sponsor_address)
    .bind(amount_minor)
    .bind(db::now())
    .fetch_one(&state.pool)
    .await?;

    let outcome = mirror::mirror_write(
        &state.pool,
        &state.gateway,
        &state.config,
        event_id,
        &op,
        Some(sponsor_address),
    )
    .await?;
    if let MirrorOutcome::Submitted { tx_id } = &outcome {
        sqlx::query("UPDATE sponsorships SET tx_id = ?1 WHERE id = ?2")
            .bind(tx_id)
            .bind(sponsorship_id)
            .execute(&state.pool)
            .await?;
    }

    load_sponsorship(&state.pool, sponsorship_id).await
}

/// Approve a pending sponsorship and credit the pool.
pub async fn approve_sponsorship<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    sponsorship_id: i64,
    organizer_id: i64,
) -> Result<Sponsorship> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    event::require_organizer(&event, organizer_id)?;
    let sponsorship = load_sponsorship(&state.pool, sponsorship_id).await?;
    if sponsorship.event_id != event_id {
        return Err(EngineError::NotFound("sponsorship"));
    }

    let mut tx = state.pool.begin().await?;
    // The status flip is the decision; losing the race means someone
    // already decided.
    let decided = sqlx::query(
        "UPDATE sponsorships SET status = 'approved', decided_at = ?1 WHERE id = ?2 AND status = 'pending'",
    )
    .bind(db::now())
    .bind(sponsorship_id)
    .execute(&mut *tx)
    .await?;
    if decided.rows_affected() == 0 {
        return Err(EngineError::StateConflict(format!(
            "sponsorship {sponsorship_id} is already {}",
            sponsorship.status
        )));
    }
    sqlx::query(
        r#"
        INSERT INTO prize_pools (event_id, total_minor) VALUES (?1, ?2)
        ON CONFLICT (event_id) DO UPDATE SET total_minor = total_minor + excluded.total_minor
        "#,
    )
    .bind(event_id)
    .bind(sponsorship.amount_minor)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    load_sponsorship(&state.pool, sponsorship_id).await
}

/// Reject a pending sponsorship and refund the escrow.
pub async fn reject_sponsorship<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    sponsorship_id: i64,
    organizer_id: i64,
) -> Result<Sponsorship> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    event::require_organizer(&event, organizer_id)?;
    let sponsorship = load_sponsorship(&state.pool, sponsorship_id).await?;
    if sponsorship.event_id != event_id {
        return Err(EngineError::NotFound("sponsorship"));
    }

    let decided = sqlx::query(
        "UPDATE sponsorships SET status = 'rejected', decided_at = ?1 WHERE id = ?2 AND status = 'pending'",
    )
    .bind(db::now())
    .bind(sponsorship_id)
    .execute(&state.pool)
    .await?;
    if decided.rows_affected() == 0 {
        return Err(EngineError::StateConflict(format!(
            "sponsorship {sponsorship_id} is already {}",
            sponsorship.status
        )));
    }

    let op = LedgerOp::RefundSponsorship {
        chain_event_id: event.chain_event_id,
        sponsor_address: sponsorship.sponsor_address.clone(),
        amount_minor: sponsorship.amount_minor,
    };
    mirror::mirror_write(&state.pool, &state.gateway, &state.config, event_id, &op, None).await?;

    load_sponsorship(&state.pool, sponsorship_id).await
}

pub async fn load_sponsorship(pool: &SqlitePool, sponsorship_id: i64) -> Result<Sponsorship> {
    sqlx::query_as::<_, Sponsorship>("SELECT * FROM sponsorships WHERE id = ?1")
        .bind(sponsorship_id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("sponsorship"))
}

pub async fn sponsorships_for_event(
    pool: &SqlitePool,
    event_id: i64,
) -> Result<Vec<Sponsorship>> {
    sqlx::query_as::<_, Sponsorship>(
        "SELECT * FROM sponsorships WHERE event_id = ?1 ORDER BY created_at ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}

/// The pool as it stands; absent rows read as an empty pool.
pub async fn pool_for_event(pool: &SqlitePool, event_id: i64) -> Result<PrizePool> {
    let row = sqlx::query_as::<_, PrizePool>("SELECT * FROM prize_pools WHERE event_id = ?1")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.unwrap_or(PrizePool {
        event_id,
        total_minor: 0,
        distributed: 0,
        distributed_at: None,
    }))
}

// ─────────────────────────────────────────────────────────
// Distribution rules and team shares
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RankRule {
    pub rank: i64,
    pub percentage: i64,
}

/// Replace the rank distribution rules. Ranks run contiguously from 1
/// and the percentages sum to at most 100; any unclaimed remainder
/// stays in the pool.
pub async fn set_distribution_rules<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
    rules: Vec<RankRule>,
) -> Result<()> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = event::load(&state.pool, event_id).await?;
    event::require_organizer(&event, organizer_id)?;
    require_not_distributed(&state.pool, event_id).await?;

    if rules.is_empty() {
        return Err(EngineError::Validation(
            "at least one distribution rule is required".into(),
        ));
    }
    let mut ranks: Vec<i64> = rules.iter().map(|r| r.rank).collect();
    ranks.sort_unstable();
    for (i, rank) in ranks.iter().enumerate() {
        if *rank != i as i64 + 1 {
            return Err(EngineError::Validation(
                "ranks must run contiguously from 1".into(),
            ));
        }
    }
    let total: i64 = rules.iter().map(|r| r.percentage).sum();
    if rules.iter().any(|r| r.percentage <= 0) || total > 100 {
        return Err(EngineError::Validation(
            "rule percentages must be positive and sum to at most 100".into(),
        ));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM distribution_rules WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
    for rule in &rules {
        sqlx::query(
            "INSERT INTO distribution_rules (event_id, rank, percentage) VALUES (?1, ?2, ?3)",
        )
        .bind(event_id)
        .bind(rule.rank)
        .bind(rule.percentage)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberShare {
    pub participant_id: i64,
    pub percentage: i64,
}

/// Replace a team's internal split of any prize it wins. Every listed
/// participant must be on the team and the percentages sum to 100.
pub async fn set_team_shares<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    team_id: i64,
    shares: Vec<MemberShare>,
) -> Result<()> {
    let _guard = state.event_locks.lock(event_id).await;

    event::load(&state.pool, event_id).await?;
    let team = team::load(&state.pool, team_id).await?;
    if team.event_id != event_id {
        return Err(EngineError::NotFound("team"));
    }
    require_not_distributed(&state.pool, event_id).await?;

    if shares.is_empty() {
        return Err(EngineError::Validation("shares must not be empty".into()));
    }
    let total: i64 = shares.iter().map(|s| s.percentage).sum();
    if shares.iter().any(|s| s.percentage <= 0) || total != 100 {
        return Err(EngineError::Validation(
            "share percentages must be positive and sum to 100".into(),
        ));
    }
    let roster = team::members(&state.pool, team_id).await?;
    for share in &shares {
        if !roster.contains(&share.participant_id) {
            return Err(EngineError::Validation(format!(
                "participant {} is not a member of team {team_id}",
                share.participant_id
            )));
        }
    }
    let mut seen: Vec<i64> = shares.iter().map(|s| s.participant_id).collect();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != shares.len() {
        return Err(EngineError::Validation(
            "duplicate participant in shares".into(),
        ));
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query("DELETE FROM team_shares WHERE event_id = ?1 AND team_id = ?2")
        .bind(event_id)
        .bind(team_id)
        .execute(&mut *tx)
        .await?;
    for share in &shares {
        sqlx::query(
            "INSERT INTO team_shares (event_id, team_id, participant_id, percentage) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id)
        .bind(team_id)
        .bind(share.participant_id)
        .bind(share.percentage)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn require_not_distributed(pool: &SqlitePool, event_id: i64) -> Result<()> {
    if pool_for_event(pool, event_id).await?.distributed != 0 {
        return Err(EngineError::AlreadyDistributed(event_id));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Distribution
// ─────────────────────────────────────────────────────────

/// Pay the pool out along the rank rules and team shares. Exactly once
/// per event; amounts are floor division, so rounding dust stays in the
/// pool rather than being over-paid.
pub async fn distribute_prizes<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
    organizer_id: i64,
) -> Result<Vec<Payout>> {
    let _guard = state.event_locks.lock(event_id).await;

    let event = stage::require_stage(&state.pool, event_id, Stage::Results).await?;
    event::require_organizer(&event, organizer_id)?;

    let now = db::now();
    let mut tx = state.pool.begin().await?;

    // The flag flip is the one-shot guard; any validation failure below
    // rolls it back, leaving the pool distributable after a fix.
    let claimed = sqlx::query(
        "UPDATE prize_pools SET distributed = 1, distributed_at = ?1 WHERE event_id = ?2 AND distributed = 0",
    )
    .bind(now)
    .bind(event_id)
    .execute(&mut *tx)
    .await?;
    if claimed.rows_affected() == 0 {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT distributed FROM prize_pools WHERE event_id = ?1")
                .bind(event_id)
                .fetch_optional(&mut *tx)
                .await?;
        return Err(match existing {
            Some((d,)) if d != 0 => EngineError::AlreadyDistributed(event_id),
            _ => EngineError::StateConflict(format!("event {event_id} has no prize pool")),
        });
    }

    let (total_minor,): (i64,) =
        sqlx::query_as("SELECT total_minor FROM prize_pools WHERE event_id = ?1")
            .bind(event_id)
            .fetch_one(&mut *tx)
            .await?;
    if total_minor <= 0 {
        return Err(EngineError::StateConflict(format!(
            "prize pool for event {event_id} is empty"
        )));
    }

    let rules: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT rank, percentage FROM distribution_rules WHERE event_id = ?1 ORDER BY rank ASC",
    )
    .bind(event_id)
    .fetch_all(&mut *tx)
    .await?;
    if rules.is_empty() {
        return Err(EngineError::Validation(format!(
            "no distribution rules configured for event {event_id}"
        )));
    }

    let mut payouts = Vec::new();
    for (rank, percentage) in rules {
        let winner: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT s.team_id
            FROM   rankings r
            JOIN   submissions s ON s.id = r.submission_id
            WHERE  r.event_id = ?1 AND r.rank = ?2
            "#,
        )
        .bind(event_id)
        .bind(rank)
        .fetch_optional(&mut *tx)
        .await?;
        // Fewer submissions than prize ranks: the unclaimed tranche
        // stays in the pool.
        let Some((team_id,)) = winner else { continue };

        let team_prize = total_minor * percentage / 100;

        let shares: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT participant_id, percentage FROM team_shares WHERE event_id = ?1 AND team_id = ?2",
        )
        .bind(event_id)
        .bind(team_id)
        .fetch_all(&mut *tx)
        .await?;
        if shares.is_empty() {
            return Err(EngineError::MissingTeamShares { event_id, team_id });
        }
        let share_total: i64 = shares.iter().map(|(_, p)| p).sum();
        if share_total != 100 {
            return Err(EngineError::DataIntegrity(format!(
                "team {team_id} shares sum to {share_total}, expected 100"
            )));
        }

        for (participant_id, share_pct) in shares {
            let amount_minor = team_prize * share_pct / 100;
            let payout_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO payouts (event_id, team_id, participant_id, amount_minor, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                RETURNING id
                "#,
            )
            .bind(event_id)
            .bind(team_id)
            .bind(participant_id)
            .bind(amount_minor)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            payouts.push(Payout {
                id: payout_id,
                event_id,
                team_id,
                participant_id,
                amount_minor,
                created_at: now,
            });
        }
    }

    tx.commit().await?;
    Ok(payouts)
}

pub async fn payouts_for_event(pool: &SqlitePool, event_id: i64) -> Result<Vec<Payout>> {
    sqlx::query_as::<_, Payout>(
        "SELECT * FROM payouts WHERE event_id = ?1 ORDER BY id ASC",
    )
    .bind(event_id)
    .fetch_all(pool)
    .await
    .map_err(Into::into)
}
