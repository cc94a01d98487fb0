use std::{collections::HashMap, env, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use tracing::error;

use crate::{
    error::RelayError,
    providers::{AgentPlatform, DEFAULT_STREAM_IDLE_TIMEOUT},
    relay::ByteStream,
    types::{ConverseRequest, ConverseResponse},
};

const STREAM_PATH: &str = "api/agent_builder/converse/async";
const CONVERSE_PATH: &str = "api/agent_builder/converse";

#[derive(Debug, Clone)]
pub struct AgentBuilderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub agent_aliases: HashMap<String, String>,
}

impl AgentBuilderConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let agent_aliases = HashMap::from([("vegas_local".to_string(), "local_expert".to_string())]);

        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(30),
            stream_idle_timeout: DEFAULT_STREAM_IDLE_TIMEOUT,
            agent_aliases,
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_stream_idle_timeout(mut self, stream_idle_timeout: Duration) -> Self {
        self.stream_idle_timeout = stream_idle_timeout;
        self
    }

    pub fn with_alias(mut self, persona: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.agent_aliases.insert(persona.into(), agent_id.into());
        self
    }
}

/// Client for the agent platform's converse API.
#[derive(Debug, Clone)]
pub struct AgentBuilder {
    client: Client,
    config: AgentBuilderConfig,
}

impl AgentBuilder {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, RelayError> {
        Self::from_config(AgentBuilderConfig::new(base_url, api_key))
    }

    pub fn from_env() -> Result<Self, RelayError> {
        let base_url = env::var("KIBANA_URL").map_err(|_| RelayError::MissingConfig("KIBANA_URL"))?;
        let api_key =
            env::var("KIBANA_API_KEY").map_err(|_| RelayError::MissingConfig("KIBANA_API_KEY"))?;
        let mut config = AgentBuilderConfig::new(base_url, api_key);

        if let Ok(timeout_ms) = env::var("AGENT_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(timeout_ms) = env::var("AGENT_STREAM_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.stream_idle_timeout = Duration::from_millis(ms);
            }
        }

        Self::from_config(config)
    }

    pub fn from_config(config: AgentBuilderConfig) -> Result<Self, RelayError> {
        // No overall timeout: streams stay open for the whole turn. Idle gaps
        // are bounded by the relay instead.
        let client = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &AgentBuilderConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("ApiKey {}", self.config.api_key))
            .header("kbn-xsrf", "true")
    }
}

async fn ensure_success(response: Response) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = status.as_u16(), body = %body, "agent platform rejected request");
    Err(RelayError::UpstreamUnavailable {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl AgentPlatform for AgentBuilder {
    async fn open_stream(&self, request: ConverseRequest) -> Result<ByteStream, RelayError> {
        let builder = self
            .with_default_headers(self.client.post(self.endpoint(STREAM_PATH)))
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .json(&request);

        let response = ensure_success(builder.send().await?).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(RelayError::from));

        Ok(Box::pin(body))
    }

    async fn converse(&self, request: ConverseRequest) -> Result<ConverseResponse, RelayError> {
        let builder = self
            .with_default_headers(self.client.post(self.endpoint(CONVERSE_PATH)))
            .timeout(self.config.request_timeout)
            .json(&request);

        let response = ensure_success(builder.send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|err| {
            error!(error = %err, "agent platform returned an unreadable converse reply");
            RelayError::InvalidResponse("converse reply is not valid JSON")
        })
    }

    fn resolve_agent(&self, agent_id: &str) -> String {
        self.config
            .agent_aliases
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| agent_id.to_string())
    }

    fn stream_idle_timeout(&self) -> Duration {
        self.config.stream_idle_timeout
    }

    fn name(&self) -> &'static str {
        "agent_builder"
    }
}
