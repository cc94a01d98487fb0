use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::{json, Value};

use crate::{
    providers::AgentPlatform,
    relay::ByteStream,
    types::{ConverseRequest, ConverseResponse},
    RelayError,
};

/// Replays a canned SSE body instead of calling a real platform.
pub struct ScriptedPlatform {
    body: String,
    chunk_size: usize,
    converse: Option<Value>,
    failure: Option<u16>,
    requests: Mutex<Vec<ConverseRequest>>,
}

impl ScriptedPlatform {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            chunk_size: 64,
            converse: None,
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Builds an SSE body from `(event type, data)` pairs, wrapping each data
    /// object the way the platform does.
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let body = events
            .into_iter()
            .map(|(event, data)| format!("event: {event}\ndata: {}\n\n", json!({ "data": data })))
            .collect::<String>();
        Self::new(body)
    }

    /// Splits the body into chunks of this many bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_converse_response(mut self, response: Value) -> Self {
        self.converse = Some(response);
        self
    }

    /// Every call fails as if the platform answered with `status`.
    pub fn failing(mut self, status: u16) -> Self {
        self.failure = Some(status);
        self
    }

    pub fn requests(&self) -> Vec<ConverseRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: ConverseRequest) -> Result<(), RelayError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        match self.failure {
            Some(status) => Err(RelayError::UpstreamUnavailable {
                status,
                body: "scripted failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentPlatform for ScriptedPlatform {
    async fn open_stream(&self, request: ConverseRequest) -> Result<ByteStream, RelayError> {
        self.record(request)?;

        let chunks: Vec<Result<Vec<u8>, RelayError>> = self
            .body
            .as_bytes()
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn converse(&self, request: ConverseRequest) -> Result<ConverseResponse, RelayError> {
        self.record(request)?;

        match &self.converse {
            Some(response) => Ok(serde_json::from_value(response.clone())?),
            None => Err(RelayError::Unsupported("scripted converse response")),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
