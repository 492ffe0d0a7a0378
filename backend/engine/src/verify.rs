//! Reconciliation verifier — compares internal records against their
//! mirrored counterparts on the ledger, field by field.
//!
//! The verifier never repairs anything. Each field gets one of four
//! verdicts: `match`, `mismatch`, `missing_external` (the ledger has no
//! value, typically an unconfirmed or lost mirror), or
//! `external_unavailable` when the gateway could not be reached. The
//! last one is inconclusive by definition; it is never reported as a
//! mismatch.

use serde::Serialize;
use serde_json::{json, Value};

use crate::db;
use crate::errors::Result;
use crate::event;
use crate::gateway::LedgerGateway;
use crate::registration;
use crate::state::AppState;
use crate::voting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldVerdict {
    Match,
    Mismatch,
    MissingExternal,
    ExternalUnavailable,
}

#[derive(Debug, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub verdict: FieldVerdict,
    pub internal: Value,
    /// Absent when the ledger had no value or was unreachable.
    pub external: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct VerificationReport {
    pub event_id: i64,
    pub checked_at: i64,
    pub fields: Vec<FieldDiff>,
    pub mismatches: usize,
    pub inconclusive: usize,
}

impl VerificationReport {
    /// True only when every field matched; an unreachable gateway makes
    /// the run inconclusive, not consistent.
    pub fn is_consistent(&self) -> bool {
        self.mismatches == 0 && self.inconclusive == 0
    }
}

async fn diff_field<G: LedgerGateway>(
    gateway: &G,
    chain_event_id: i64,
    field: &str,
    internal: Value,
) -> FieldDiff {
    match gateway.read_field(chain_event_id, field).await {
        Ok(Some(external)) => {
            let verdict = if values_equal(&internal, &external) {
                FieldVerdict::Match
            } else {
                FieldVerdict::Mismatch
            };
            FieldDiff {
                field: field.to_string(),
                verdict,
                internal,
                external: Some(external),
            }
        }
        Ok(None) => FieldDiff {
            field: field.to_string(),
            verdict: FieldVerdict::MissingExternal,
            internal,
            external: None,
        },
        // Any gateway failure is inconclusive for this field.
        Err(_) => FieldDiff {
            field: field.to_string(),
            verdict: FieldVerdict::ExternalUnavailable,
            internal,
            external: None,
        },
    }
}

/// Arrays compare as multisets: mirror confirmation order is not part
/// of the contract, membership is.
fn values_equal(internal: &Value, external: &Value) -> bool {
    match (internal, external) {
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return false;
            }
            let mut a: Vec<String> = a.iter().map(|v| v.to_string()).collect();
            let mut b: Vec<String> = b.iter().map(|v| v.to_string()).collect();
            a.sort();
            b.sort();
            a == b
        }
        _ => internal == external,
    }
}

/// Run a full reconciliation pass over one event.
pub async fn verify_event<G: LedgerGateway>(
    state: &AppState<G>,
    event_id: i64,
) -> Result<VerificationReport> {
    let event = event::load(&state.pool, event_id).await?;
    let chain_id = event.chain_event_id;
    let gateway = &state.gateway;

    let mut fields = Vec::new();
    fields.push(diff_field(gateway, chain_id, "name", json!(event.name)).await);
    fields.push(diff_field(gateway, chain_id, "location", json!(event.location)).await);
    fields.push(diff_field(gateway, chain_id, "startTime", json!(event.start_time)).await);
    fields.push(diff_field(gateway, chain_id, "endTime", json!(event.end_time)).await);

    let roster = registration::checked_in_wallets(&state.pool, event_id).await?;
    fields.push(diff_field(gateway, chain_id, "checkins", json!(roster)).await);

    // Tallies compare as a submission-id -> total map.
    let tallies = voting::tallies(&state.pool, event_id).await?;
    let tally_map: serde_json::Map<String, Value> = tallies
        .into_iter()
        .map(|(submission_id, total)| (submission_id.to_string(), json!(total)))
        .collect();
    fields.push(diff_field(gateway, chain_id, "voteTallies", Value::Object(tally_map)).await);

    let mismatches = fields
        .iter()
        .filter(|f| matches!(f.verdict, FieldVerdict::Mismatch | FieldVerdict::MissingExternal))
        .count();
    let inconclusive = fields
        .iter()
        .filter(|f| f.verdict == FieldVerdict::ExternalUnavailable)
        .count();

    Ok(VerificationReport {
        event_id,
        checked_at: db::now(),
        fields,
        mismatches,
        inconclusive,
    })
}
