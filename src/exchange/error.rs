//! Venue error differentiation
//!
//! Parses venue API error responses into structured kinds so callers branch
//! on the kind instead of a generic catch: construction failures abort the
//! step, rejected orders leave state untouched, transient network faults
//! are the only thing worth retrying.

use serde::Deserialize;
use thiserror::Error;

/// Structured exchange adapter errors
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Adapter could not be constructed or the venue is unreachable
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    /// Ticker fetch failed (network or parse)
    #[error("price unavailable: {0}")]
    PriceUnavailable(String),
    /// Venue refused the order (below minimum notional, insufficient funds, ...)
    #[error("order rejected by venue (code {code}): {message}")]
    OrderRejected { code: i64, message: String },
    /// Rate limited by the venue
    #[error("rate limited by venue")]
    RateLimited,
    /// API key/signature authentication failed
    #[error("venue authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Network/connection error (timeout, DNS, ...)
    #[error("network error: {0}")]
    Network(String),
    /// The venue answered with something we could not interpret
    #[error("invalid venue response: {0}")]
    InvalidResponse(String),
}

/// Venue error body format: {"code": -2010, "msg": "..."}
#[derive(Debug, Deserialize)]
struct VenueErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

impl ExchangeError {
    /// Classify a non-success venue response
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed: Option<VenueErrorBody> = serde_json::from_str(body).ok();
        let code = parsed.as_ref().and_then(|b| b.code);
        let message = parsed
            .and_then(|b| b.msg)
            .unwrap_or_else(|| body.chars().take(200).collect());

        if status == 429 || status == 418 {
            return ExchangeError::RateLimited;
        }

        match code {
            // -2010 order rejected, -1013 filter failure (e.g. MIN_NOTIONAL),
            // -2011 cancel rejected
            Some(c @ (-2011..=-2010)) | Some(c @ -1013) => ExchangeError::OrderRejected {
                code: c,
                message,
            },
            // -2014 bad API key format, -2015 invalid key/permissions,
            // -1022 bad signature
            Some(-2015..=-2014) | Some(-1022) => ExchangeError::AuthenticationFailed(message),
            // -1021 timestamp outside recvWindow: the clock offset is stale
            Some(-1021) => ExchangeError::Unavailable(format!("clock drift: {message}")),
            _ if status == 401 || status == 403 => ExchangeError::AuthenticationFailed(message),
            _ if status >= 500 => ExchangeError::Network(format!("venue {status}: {message}")),
            _ => ExchangeError::Unavailable(format!("venue {status}: {message}")),
        }
    }

    /// Classify a transport-level error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Network("request timed out".to_string())
        } else if err.is_connect() {
            ExchangeError::Network("connection failed".to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }

    /// Whether retrying the same call can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::RateLimited | ExchangeError::Network(_))
    }
}
