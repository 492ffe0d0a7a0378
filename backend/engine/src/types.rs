//! Row types shared across the engines.
//!
//! Times are unix seconds; money is integer minor units of the ledger's
//! native asset. Column naming matches `migrations/0001_init.sql`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub location: String,
    pub start_time: i64,
    pub end_time: i64,
    pub stage: String,
    pub organizer_id: i64,
    pub max_team_size: i64,
    pub max_participants: i64,
    pub vote_score_min: i64,
    pub vote_score_max: i64,
    pub max_votes_per_participant: i64,
    pub chain_event_id: i64,
    pub is_deleted: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StageWindow {
    pub id: i64,
    pub event_id: i64,
    pub stage: String,
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub id: i64,
    pub wallet_address: String,
    pub nickname: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Registration {
    pub id: i64,
    pub event_id: i64,
    pub participant_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkin {
    pub id: i64,
    pub event_id: i64,
    pub participant_id: i64,
    pub tx_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    pub event_id: i64,
    pub participant_id: i64,
    pub token_id: i64,
    pub tx_id: Option<String>,
    pub is_active: i64,
    pub minted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: i64,
    pub event_id: i64,
    pub name: String,
    pub max_size: i64,
    pub leader_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Submission {
    pub id: i64,
    pub event_id: i64,
    pub team_id: i64,
    pub name: String,
    pub description: String,
    pub link: String,
    pub draft: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: i64,
    pub event_id: i64,
    pub participant_id: i64,
    pub submission_id: i64,
    pub score: i64,
    pub is_revoked: i64,
    pub tx_id: Option<String>,
    pub cast_at: i64,
    pub revoked_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sponsorship {
    pub id: i64,
    pub event_id: i64,
    pub sponsor_address: String,
    pub amount_minor: i64,
    pub status: String,
    pub tx_id: Option<String>,
    pub created_at: i64,
    pub decided_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PrizePool {
    pub event_id: i64,
    pub total_minor: i64,
    pub distributed: i64,
    pub distributed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DistributionRule {
    pub id: i64,
    pub event_id: i64,
    pub rank: i64,
    pub percentage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TeamShare {
    pub id: i64,
    pub event_id: i64,
    pub team_id: i64,
    pub participant_id: i64,
    pub percentage: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payout {
    pub id: i64,
    pub event_id: i64,
    pub team_id: i64,
    pub participant_id: i64,
    pub amount_minor: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RankingEntry {
    pub id: i64,
    pub event_id: i64,
    pub submission_id: i64,
    pub rank: i64,
    pub total_score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerTransaction {
    pub id: i64,
    pub event_id: i64,
    pub tx_id: String,
    pub operation: String,
    pub detail: String,
    pub status: String,
    pub submitted_at: i64,
    pub confirmed_at: Option<i64>,
}
