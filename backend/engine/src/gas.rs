//! Cost estimator / balance guard.
//!
//! Every mirrored write costs gas on the external ledger. Before
//! submitting one, the engine can compute the expected cost and compare
//! it to the caller's spendable balance; the result is surfaced to the
//! UI as a pre-flight confirmation and, when enforcement is on, used to
//! refuse the write outright. Absence of a mirror is always a caller
//! decision or a declared failure, never a silent skip.

use serde::Serialize;

use crate::errors::{EngineError, Result};
use crate::gateway::{LedgerGateway, LedgerOp};

/// Pre-flight cost report for a single ledger operation.
#[derive(Debug, Clone, Serialize)]
pub struct GasEstimate {
    pub gas_limit: i64,
    pub unit_price_minor: i64,
    pub total_cost_minor: i64,
    pub caller_balance_minor: i64,
    pub is_sufficient: bool,
    pub shortfall_minor: i64,
}

/// Compute the cost of `op` and the caller's headroom for it.
pub async fn estimate<G: LedgerGateway>(
    gateway: &G,
    op: &LedgerOp,
    caller_address: &str,
) -> Result<GasEstimate> {
    let gas_limit = gateway.estimate_gas(op).await?;
    let unit_price_minor = gateway.gas_price().await?;
    let caller_balance_minor = gateway.balance(caller_address).await?;

    let total_cost_minor = gas_limit.saturating_mul(unit_price_minor);
    let is_sufficient = caller_balance_minor >= total_cost_minor;
    let shortfall_minor = if is_sufficient {
        0
    } else {
        total_cost_minor - caller_balance_minor
    };

    Ok(GasEstimate {
        gas_limit,
        unit_price_minor,
        total_cost_minor,
        caller_balance_minor,
        is_sufficient,
        shortfall_minor,
    })
}

/// Estimate and fail with [`EngineError::InsufficientBalance`] when the
/// caller cannot cover the operation.
pub async fn require_sufficient<G: LedgerGateway>(
    gateway: &G,
    op: &LedgerOp,
    caller_address: &str,
) -> Result<GasEstimate> {
    let est = estimate(gateway, op, caller_address).await?;
    if !est.is_sufficient {
        return Err(EngineError::InsufficientBalance {
            needed_minor: est.total_cost_minor,
            available_minor: est.caller_balance_minor,
            shortfall_minor: est.shortfall_minor,
        });
    }
    Ok(est)
}
