//! Ledger gateway — the boundary to the external append-only ledger.
//!
//! The ledger is treated as a black box with eventual, possibly-failing
//! writes and synchronous reads once finalized: `submit` returns quickly
//! with a pending transaction id, confirmation arrives later, and reads
//! may time out. A timeout is always reported as
//! [`EngineError::ExternalUnavailable`] — inconclusive, never `failed`.
//!
//! ## Resilience
//!
//! Transient network errors and rate-limit responses are retried with
//! exponential back-off up to [`MAX_ATTEMPTS`] times; after that the call
//! is surfaced as unavailable so the caller (or the reconciliation
//! verifier) can decide what to do.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 2;

/// A state-changing operation mirrored to the external ledger.
///
/// The serialized form is journaled alongside the transaction id so a
/// failed mirror can be resubmitted without reconstructing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerOp {
    CreateEvent {
        event_id: i64,
        name: String,
        location: String,
        start_time: i64,
        end_time: i64,
    },
    ActivateEvent {
        chain_event_id: i64,
    },
    EndEvent {
        chain_event_id: i64,
    },
    CheckIn {
        chain_event_id: i64,
        wallet_address: String,
    },
    MintCredential {
        chain_event_id: i64,
        wallet_address: String,
        token_id: i64,
    },
    CastVote {
        chain_event_id: i64,
        submission_id: i64,
        score: i64,
    },
    RevokeVote {
        chain_event_id: i64,
        vote_id: i64,
    },
    EscrowSponsorship {
        chain_event_id: i64,
        sponsor_address: String,
        amount_minor: i64,
    },
    RefundSponsorship {
        chain_event_id: i64,
        sponsor_address: String,
        amount_minor: i64,
    },
}

impl LedgerOp {
    /// Short identifier stored in the mirror journal.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateEvent { .. } => "create_event",
            Self::ActivateEvent { .. } => "activate_event",
            Self::EndEvent { .. } => "end_event",
            Self::CheckIn { .. } => "check_in",
            Self::MintCredential { .. } => "mint_credential",
            Self::CastVote { .. } => "cast_vote",
            Self::RevokeVote { .. } => "revoke_vote",
            Self::EscrowSponsorship { .. } => "escrow_sponsorship",
            Self::RefundSponsorship { .. } => "refund_sponsorship",
        }
    }

    /// JSON parameter blob for the gateway's `submitOperation` call.
    pub fn params(&self) -> Value {
        match self {
            Self::CreateEvent {
                event_id,
                name,
                location,
                start_time,
                end_time,
            } => json!({
                "eventId": event_id,
                "name": name,
                "location": location,
                "startTime": start_time,
                "endTime": end_time,
            }),
            Self::ActivateEvent { chain_event_id } | Self::EndEvent { chain_event_id } => {
                json!({ "chainEventId": chain_event_id })
            }
            Self::CheckIn {
                chain_event_id,
                wallet_address,
            } => json!({
                "chainEventId": chain_event_id,
                "participant": wallet_address,
            }),
            Self::MintCredential {
                chain_event_id,
                wallet_address,
                token_id,
            } => json!({
                "chainEventId": chain_event_id,
                "participant": wallet_address,
                "tokenId": token_id,
            }),
            Self::CastVote {
                chain_event_id,
                submission_id,
                score,
            } => json!({
                "chainEventId": chain_event_id,
                "submissionId": submission_id,
                "score": score,
            }),
            Self::RevokeVote {
                chain_event_id,
                vote_id,
            } => json!({
                "chainEventId": chain_event_id,
                "voteId": vote_id,
            }),
            Self::EscrowSponsorship {
                chain_event_id,
                sponsor_address,
                amount_minor,
            }
            | Self::RefundSponsorship {
                chain_event_id,
                sponsor_address,
                amount_minor,
            } => json!({
                "chainEventId": chain_event_id,
                "sponsor": sponsor_address,
                "amountMinor": amount_minor,
            }),
        }
    }
}

/// Confirmation state of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }
}

/// Seam to the external ledger. The production implementation speaks
/// JSON-RPC over HTTP; tests substitute an in-memory mock.
pub trait LedgerGateway: Send + Sync {
    /// Submit a state-changing operation. Returns the pending tx id.
    fn submit(&self, op: &LedgerOp) -> impl Future<Output = Result<String>> + Send;

    /// Confirmation status of a previously submitted transaction.
    fn status(&self, tx_id: &str) -> impl Future<Output = Result<TxStatus>> + Send;

    /// Read a mirrored field of an event; `None` when the ledger has no
    /// value for it.
    fn read_field(
        &self,
        chain_event_id: i64,
        field: &str,
    ) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Resource limit the ledger would charge for `op`.
    fn estimate_gas(&self, op: &LedgerOp) -> impl Future<Output = Result<i64>> + Send;

    /// Current unit price in minor units.
    fn gas_price(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Spendable balance of `address` in minor units.
    fn balance(&self, address: &str) -> impl Future<Output = Result<i64>> + Send;
}

// ─────────────────────────────────────────────────────────
// HTTP implementation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    rpc_url: String,
    contract_id: String,
}

impl HttpGateway {
    pub fn new(client: Client, rpc_url: String, contract_id: String) -> Self {
        Self {
            client,
            rpc_url,
            contract_id,
        }
    }

    /// Single JSON-RPC call with bounded retry on transient failures.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = INITIAL_BACKOFF_SECS;

        for attempt in 1..=MAX_ATTEMPTS {
            let response = self
                .client
                .post(&self.rpc_url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            match response {
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!("Gateway request failed (will retry in {backoff}s): {e}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff *= 2;
                    continue;
                }
                Err(e) => {
                    return Err(EngineError::ExternalUnavailable(format!(
                        "{method}: {e}"
                    )))
                }
                Ok(resp) => {
                    if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS
                        && attempt < MAX_ATTEMPTS
                    {
                        warn!("Rate-limited by gateway (will retry in {backoff}s)");
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                        continue;
                    }

                    // A body that fails to decode is a gateway fault like
                    // any other, not an internal error.
                    let body: RpcResponse = resp.json().await.map_err(|e| {
                        EngineError::ExternalUnavailable(format!("{method}: bad response: {e}"))
                    })?;
                    if let Some(err) = body.error {
                        return Err(EngineError::ExternalUnavailable(format!(
                            "{method}: RPC error {}: {}",
                            err.code, err.message
                        )));
                    }
                    let result = body.result.ok_or_else(|| {
                        EngineError::ExternalUnavailable(format!("{method}: empty result"))
                    })?;
                    debug!("Gateway {method} ok");
                    return Ok(result);
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

impl LedgerGateway for HttpGateway {
    async fn submit(&self, op: &LedgerOp) -> Result<String> {
        let result = self
            .call(
                "submitOperation",
                json!({
                    "contractId": self.contract_id,
                    "operation": op.name(),
                    "params": op.params(),
                }),
            )
            .await?;
        result
            .get("txId")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| {
                EngineError::ExternalUnavailable("submitOperation: missing txId".to_string())
            })
    }

    async fn status(&self, tx_id: &str) -> Result<TxStatus> {
        let result = self
            .call("getTransactionStatus", json!({ "txId": tx_id }))
            .await?;
        match result.get("status").and_then(|v| v.as_str()) {
            Some("pending") => Ok(TxStatus::Pending),
            Some("confirmed") => Ok(TxStatus::Confirmed),
            Some("failed") => Ok(TxStatus::Failed),
            other => Err(EngineError::ExternalUnavailable(format!(
                "getTransactionStatus: unexpected status {other:?}"
            ))),
        }
    }

    async fn read_field(&self, chain_event_id: i64, field: &str) -> Result<Option<Value>> {
        let result = self
            .call(
                "readEventField",
                json!({
                    "contractId": self.contract_id,
                    "chainEventId": chain_event_id,
                    "field": field,
                }),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(result.get("value").cloned().filter(|v| !v.is_null()))
    }

    async fn estimate_gas(&self, op: &LedgerOp) -> Result<i64> {
        let result = self
            .call(
                "estimateGas",
                json!({
                    "contractId": self.contract_id,
                    "operation": op.name(),
                    "params": op.params(),
                }),
            )
            .await?;
        result.get("gasLimit").and_then(|v| v.as_i64()).ok_or_else(|| {
            EngineError::ExternalUnavailable("estimateGas: missing gasLimit".to_string())
        })
    }

    async fn gas_price(&self) -> Result<i64> {
        let result = self.call("getGasPrice", json!({})).await?;
        result.get("priceMinor").and_then(|v| v.as_i64()).ok_or_else(|| {
            EngineError::ExternalUnavailable("getGasPrice: missing priceMinor".to_string())
        })
    }

    async fn balance(&self, address: &str) -> Result<i64> {
        let result = self.call("getBalance", json!({ "address": address })).await?;
        result.get("balanceMinor").and_then(|v| v.as_i64()).ok_or_else(|| {
            EngineError::ExternalUnavailable("getBalance: missing balanceMinor".to_string())
        })
    }
}

// ─────────────────────────────────────────────────────────
// In-memory mock for tests
// ─────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_stable() {
        assert_eq!(
            LedgerOp::ActivateEvent { chain_event_id: 1 }.name(),
            "activate_event"
        );
        assert_eq!(
            LedgerOp::CheckIn {
                chain_event_id: 1,
                wallet_address: "0xabc".into()
            }
            .name(),
            "check_in"
        );
        assert_eq!(
            LedgerOp::RevokeVote {
                chain_event_id: 1,
                vote_id: 7
            }
            .name(),
            "revoke_vote"
        );
    }

    #[test]
    fn op_params_carry_identifiers() {
        let op = LedgerOp::CastVote {
            chain_event_id: 9,
            submission_id: 4,
            score: 10,
        };
        let p = op.params();
        assert_eq!(p["chainEventId"], 9);
        assert_eq!(p["submissionId"], 4);
        assert_eq!(p["score"], 10);
    }

    #[tokio::test]
    async fn malformed_response_is_reported_unavailable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                          Content-Length: 9\r\nConnection: close\r\n\r\nnot json!",
                    )
                    .await;
            }
        });

        let gw = HttpGateway::new(Client::new(), format!("http://{addr}"), "c1".into());
        let err = gw.gas_price().await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalUnavailable(_)));
    }

    #[tokio::test]
    async fn mock_gateway_round_trip() {
        let gw = mock::MockGateway::default();
        let tx = gw
            .submit(&LedgerOp::ActivateEvent { chain_event_id: 3 })
            .await
            .unwrap();
        assert_eq!(gw.status(&tx).await.unwrap(), TxStatus::Pending);
        gw.set_status(&tx, TxStatus::Confirmed);
        assert_eq!(gw.status(&tx).await.unwrap(), TxStatus::Confirmed);
        assert_eq!(gw.submitted_ops().len(), 1);
    }
}
