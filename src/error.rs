use std::time::Duration;

use thiserror::Error;

use crate::sse::LineTooLong;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("agent platform unavailable (status {status}): {body}")]
    UpstreamUnavailable { status: u16, body: String },

    #[error("missing configuration: set the {0} environment variable")]
    MissingConfig(&'static str),

    #[error("upstream stream idle for more than {0:?}")]
    StreamIdle(Duration),

    #[error("invalid response from agent platform: {0}")]
    InvalidResponse(&'static str),

    #[error("agent stream framing error: {0}")]
    LineTooLong(#[from] LineTooLong),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl RelayError {
    /// True when the agent platform is at fault (unreachable, rejected the call
    /// or answered with an unreadable body).
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::UpstreamUnavailable { .. } | Self::InvalidResponse(_)
        )
    }
}
