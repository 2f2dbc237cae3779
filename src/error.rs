// error.rs — crate-wide error taxonomy (spec §7).
//
// Grounded on the teacher's `exchange.rs::OrderError` enum/Display pair,
// replaced with `thiserror` (the idiomatic choice the rest of this example
// pack reaches for, e.g. `ferrofluid` and `dex-sdk`) and extended to cover
// every error kind spec §7 names.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Bad address, bad percentage, unknown asset — rejected at the API
    /// boundary, never enters the pipeline.
    #[error("input: {0}")]
    Input(String),

    /// Asset-blocked, time-window, risk, liquidity, margin, dust. Recorded
    /// on the candidate and surfaced as a metric; never retried.
    #[error("policy rejection: {0:?}")]
    PolicyRejection(PolicyRejectionReason),

    /// Network, timeout, 5xx, WS disconnect. Retried with bounded attempts.
    #[error("transient: {0}")]
    Transient(String),

    /// Exchange returned a non-2xx JSON error body.
    #[error("protocol error {code}: {msg}")]
    Protocol { code: i32, msg: String },

    /// Signature or nonce rejected by the exchange. Batch fails fatally.
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("nonce stale: {0}")]
    NonceStale(String),

    /// Repository unavailable, signing key missing. Process degrades.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRejectionReason {
    Inactive,
    AssetBlocked,
    TimeWindow,
    Dust,
    NotionalOutOfRange,
    RiskTooHigh,
    InsufficientLiquidity,
    InsufficientMargin,
    UnknownOrDelistedAsset,
}

impl std::fmt::Display for PolicyRejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            RelayError::Transient(e.to_string())
        } else {
            RelayError::Protocol { code: e.status().map(|s| s.as_u16() as i32).unwrap_or(-1), msg: e.to_string() }
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Protocol { code: 0, msg: format!("json: {}", e) }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Fatal(format!("repository: {}", e))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Transient(format!("ws: {}", e))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
