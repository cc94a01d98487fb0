use std::time::Duration;

use async_trait::async_trait;

use crate::relay::ByteStream;
use crate::types::{ConverseRequest, ConverseResponse};
use crate::RelayError;

pub mod agent_builder;
pub mod scripted;

pub const DEFAULT_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// The external conversational agent platform.
#[async_trait]
pub trait AgentPlatform: Send + Sync {
    /// Opens one streaming converse call. Fails without yielding anything when
    /// the platform is unreachable or answers with a non-success status.
    async fn open_stream(&self, request: ConverseRequest) -> Result<ByteStream, RelayError>;

    async fn converse(&self, _request: ConverseRequest) -> Result<ConverseResponse, RelayError> {
        Err(RelayError::Unsupported("synchronous converse"))
    }

    /// Maps a persona id chosen in the browser to the platform's agent id.
    fn resolve_agent(&self, agent_id: &str) -> String {
        agent_id.to_string()
    }

    fn stream_idle_timeout(&self) -> Duration {
        DEFAULT_STREAM_IDLE_TIMEOUT
    }

    fn name(&self) -> &'static str;
}
