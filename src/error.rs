//! Cycle-level error taxonomy.
//!
//! Every variant is `Clone`: a single failed cycle is handed to every
//! caller that was coalesced onto it.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// 4xx from the inventory API. Credentials, region or query are wrong;
    /// retrying will not help.
    #[error("inventory request rejected ({status}{}): {message}", code.as_deref().map(|c| format!(" {c}")).unwrap_or_default())]
    FetchRejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Transient failures outlasted the retry budget.
    #[error("inventory fetch gave up after {attempts} attempt(s): {last_error}")]
    FetchExhausted { attempts: u32, last_error: String },

    /// The response envelope could not be interpreted at all.
    #[error("malformed inventory response: {0}")]
    MalformedResponse(String),

    #[error("refresh cycle exceeded its {0:?} deadline")]
    RefreshTimeout(Duration),

    #[error("unsupported inventory action '{0}'")]
    UnsupportedAction(String),

    /// The coordinator was shut down while the cycle was in flight.
    #[error("refresh cycle cancelled")]
    Cancelled,
}

impl DiscoveryError {
    /// Errors raised before any page was interpreted (network side).
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            Self::FetchRejected { .. } | Self::FetchExhausted { .. } | Self::UnsupportedAction(_)
        )
    }
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
