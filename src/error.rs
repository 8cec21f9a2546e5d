// =============================================================================
// Error taxonomy — exchange failures and placement outcomes
// =============================================================================

use thiserror::Error;

/// Failure of a single exchange operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    /// The exchange validated and refused the request (e.g. trigger too
    /// close to market, insufficient margin).
    #[error("order rejected (code {code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// Network error, timeout or 5xx: the outcome is unknown and must be
    /// re-derived from a fresh snapshot next cycle.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Request weight or order-count limit hit (locally or by the exchange).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Order or symbol no longer exists (cancel of an already filled order).
    #[error("not found: {0}")]
    NotFound(String),

    /// Response could not be understood.
    #[error("failed to decode exchange response: {0}")]
    Decode(String),

    /// The backend does not support the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ExchangeError {
    /// Whether the call may have succeeded on the exchange even though we saw
    /// an error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// Why opening and protecting a position did not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlacementError {
    /// Nothing was sent: quantity rounded to zero, invalid plan, etc.
    #[error("placement skipped: {0}")]
    Skipped(String),

    /// The market entry itself failed; no position should exist.
    #[error("entry order failed: {0}")]
    EntryFailed(ExchangeError),

    /// Stop-loss could not be placed even after the widened retry; the
    /// position was flattened.
    #[error("stop-loss could not be placed ({stop_error}); position flattened")]
    Flattened { stop_error: ExchangeError },

    /// Stop-loss failed AND the flatten failed. Needs an operator.
    #[error("stop-loss failed ({stop_error}) and flatten failed ({flatten_error})")]
    Unprotected {
        stop_error: ExchangeError,
        flatten_error: ExchangeError,
    },
}
