//! Error taxonomy.
//!
//! Executors communicate outcomes as values, not exceptions: partial fills
//! and post-only rejects are normal control flow and never surface as errors
//! from a completed operation. What remains here is what can actually fail.

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::models::Side;

/// Errors produced by a venue adapter.
#[derive(Debug, Error)]
pub enum VenueError {
    /// A post-only limit would have crossed the book. Expected; callers
    /// refresh the BBO and re-price rather than counting this as a failure.
    #[error("post-only order would cross the book")]
    PostOnlyReject,

    /// The cached quote is stale and a REST refresh also failed.
    #[error("stale quote for {venue} {symbol}")]
    StaleQuote { venue: String, symbol: String },

    /// The venue does not support this operation (e.g. cross-margin venues
    /// reject `set_account_leverage`).
    #[error("unsupported by venue: {0}")]
    Unsupported(&'static str),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("venue authentication failed: {0}")]
    Auth(String),

    /// Timeout, 5xx, rate limit. Retried with jittered backoff before
    /// escalating to `Permanent`.
    #[error("transient venue error: {0}")]
    Transient(String),

    #[error("venue error after {attempts} attempts: {message}")]
    Permanent { attempts: u32, message: String },
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::StaleQuote { .. })
    }
}

/// Which pre-flight gate rejected an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightCheck {
    Depth,
    Slippage,
    Spread,
    Warmup,
}

/// A rollback that could not restore net-zero exposure. Fatal for the
/// position; surfaced loudly and recorded for operator action.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackIncident {
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub residual_qty: Decimal,
    pub attempts: u32,
    pub last_error: String,
}

impl std::fmt::Display for RollbackIncident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rollback failed on {} {}: residual {} {} after {} attempts ({})",
            self.venue,
            self.symbol,
            self.residual_qty,
            self.side.as_str(),
            self.attempts,
            self.last_error
        )
    }
}

/// Errors from the execution layer.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A liquidity/warm-up gate failed before any order was placed.
    /// No position, no cost.
    #[error("pre-flight rejected on {venue} {symbol}: {check:?}")]
    PreflightRejected {
        venue: String,
        symbol: String,
        check: PreflightCheck,
    },

    /// The two legs do not form a delta-neutral pair.
    #[error("invalid pair: {0}")]
    InvalidPair(String),

    #[error(transparent)]
    Venue(#[from] VenueError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_transient_classification() {
        assert!(VenueError::Transient("timeout".into()).is_transient());
        assert!(VenueError::StaleQuote {
            venue: "lighter".into(),
            symbol: "BTC".into()
        }
        .is_transient());
        assert!(!VenueError::PostOnlyReject.is_transient());
        assert!(!VenueError::Permanent {
            attempts: 5,
            message: "down".into()
        }
        .is_transient());
    }

    #[test]
    fn test_incident_display_names_residual() {
        let incident = RollbackIncident {
            venue: "aster".into(),
            symbol: "BTC".into(),
            side: Side::Sell,
            residual_qty: dec!(0.02),
            attempts: 3,
            last_error: "rejected".into(),
        };
        let s = incident.to_string();
        assert!(s.contains("aster"));
        assert!(s.contains("0.02"));
        assert!(s.contains("3 attempts"));
    }
}
