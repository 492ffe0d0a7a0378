//! Application-wide error types.
//!
//! Domain failures are grouped into a small taxonomy so callers can
//! decide what to do without matching on every variant:
//!
//! * validation      — malformed input, rejected before any side effect
//! * state conflict  — stage mismatch or a duplicate of an already-applied
//!                     operation; safe to retry after inspecting state
//! * insufficient resource — the caller's ledger balance cannot cover the
//!                     mirrored write
//! * external unavailable  — the ledger gateway timed out or errored;
//!                     inconclusive, retryable, never a real mismatch
//! * data integrity  — internal records are inconsistent (e.g. team
//!                     shares not summing to 100); blocks, never auto-fixed

use thiserror::Error;

use crate::stage::Stage;

#[derive(Debug, Error)]
pub enum EngineError {
    // ── Infrastructure ───────────────────────────────────
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Validation ───────────────────────────────────────
    #[error("Validation error: {0}")]
    Validation(String),

    // ── State conflicts ──────────────────────────────────
    #[error("Invalid stage transition from {from} to {to}")]
    InvalidStageTransition { from: Stage, to: Stage },

    #[error("Event {0} is not open for registration")]
    EventNotOpenForRegistration(i64),

    #[error("Participant {participant_id} is already registered for event {event_id}")]
    AlreadyRegistered { event_id: i64, participant_id: i64 },

    #[error("Participant {participant_id} is not registered for event {event_id}")]
    NotRegistered { event_id: i64, participant_id: i64 },

    #[error("Participant {participant_id} has already checked in to event {event_id}")]
    AlreadyCheckedIn { event_id: i64, participant_id: i64 },

    #[error("Participant {participant_id} already holds an active vote on submission {submission_id}")]
    DuplicateVote {
        participant_id: i64,
        submission_id: i64,
    },

    #[error("Prizes for event {0} have already been distributed")]
    AlreadyDistributed(i64),

    #[error("Operation requires stage {required}, event {event_id} is in {current}")]
    WrongStage {
        event_id: i64,
        current: Stage,
        required: Stage,
    },

    #[error("State conflict: {0}")]
    StateConflict(String),

    // ── Resources ────────────────────────────────────────
    #[error("Insufficient balance: need {needed_minor} minor units, have {available_minor} (short {shortfall_minor})")]
    InsufficientBalance {
        needed_minor: i64,
        available_minor: i64,
        shortfall_minor: i64,
    },

    // ── External ledger ──────────────────────────────────
    #[error("Ledger gateway unavailable: {0}")]
    ExternalUnavailable(String),

    // ── Integrity ────────────────────────────────────────
    #[error("Team {team_id} has no prize shares registered for event {event_id}")]
    MissingTeamShares { event_id: i64, team_id: i64 },

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Coarse classification used for HTTP mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    InsufficientResource,
    ExternalUnavailable,
    DataIntegrity,
    NotFound,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Config(_) => ErrorKind::Validation,
            Self::InvalidStageTransition { .. }
            | Self::EventNotOpenForRegistration(_)
            | Self::AlreadyRegistered { .. }
            | Self::NotRegistered { .. }
            | Self::AlreadyCheckedIn { .. }
            | Self::DuplicateVote { .. }
            | Self::AlreadyDistributed(_)
            | Self::WrongStage { .. }
            | Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::InsufficientBalance { .. } => ErrorKind::InsufficientResource,
            Self::ExternalUnavailable(_) => ErrorKind::ExternalUnavailable,
            Self::MissingTeamShares { .. } | Self::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Database(_) | Self::Migrate(_) | Self::Http(_) | Self::Json(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_taxonomy() {
        assert_eq!(
            EngineError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::AlreadyDistributed(1).kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            EngineError::InsufficientBalance {
                needed_minor: 10,
                available_minor: 4,
                shortfall_minor: 6
            }
            .kind(),
            ErrorKind::InsufficientResource
        );
        assert_eq!(
            EngineError::ExternalUnavailable("timeout".into()).kind(),
            ErrorKind::ExternalUnavailable
        );
        assert_eq!(
            EngineError::MissingTeamShares {
                event_id: 1,
                team_id: 2
            }
            .kind(),
            ErrorKind::DataIntegrity
        );
    }
}
