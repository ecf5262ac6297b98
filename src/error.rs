//! Error taxonomy for orchestrated backend requests
//!
//! Every client operation settles into a [`RequestError`] on failure. The
//! variants keep connectivity, client-side rejection, exhausted retries and
//! timeouts apart so the editor can offer the right follow-up action.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The backend could not be reached at all (probe failed)
    #[error("Cannot connect to the backend at {url}. Check that the server is running and the backendUrl setting is correct.")]
    Connectivity { url: String },

    /// 4xx other than 429; retrying will not help
    #[error("Request rejected ({status}): {detail}")]
    Client { status: u16, detail: String },

    /// A single retryable attempt failure (429, 5xx, network-level)
    #[error("{}", transient_message(.status, .message))]
    Transient { status: Option<u16>, message: String },

    /// All attempts failed with retryable errors
    #[error("Network request failed after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The client-side timeout race fired before the backend answered
    #[error("Request timed out after {}s. The backend may still be working; try again or increase requestTimeout.", .after.as_secs())]
    Timeout { after: Duration },

    /// Rejected locally before any network call
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The backend answered with an explicit `success: false` envelope
    #[error("Backend error: {0}")]
    Backend(String),

    /// The payload did not have the expected shape
    #[error("Unexpected response from backend: {0}")]
    InvalidResponse(String),
}

fn transient_message(status: &Option<u16>, message: &str) -> String {
    match *status {
        Some(429) => format!("Rate limited by backend: {}", message),
        Some(code) => format!("Backend error {}: {}", code, message),
        None => format!("Network error: {}", message),
    }
}

impl RequestError {
    /// HTTP-like status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Client { status, .. } => Some(*status),
            RequestError::Transient { status, .. } => *status,
            _ => None,
        }
    }

    /// Classify a non-success HTTP status into a client or transient error.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if (400..500).contains(&status) && status != 429 {
            RequestError::Client { status, detail }
        } else {
            RequestError::Transient {
                status: Some(status),
                message: detail,
            }
        }
    }

    /// Whether the user should be pointed at connection settings.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            RequestError::Connectivity { .. } | RequestError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return RequestError::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() {
            return RequestError::InvalidResponse(err.to_string());
        }
        RequestError::Transient {
            status: None,
            message: err.to_string(),
        }
    }
}
