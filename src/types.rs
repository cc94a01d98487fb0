use chrono::{SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A chat turn as submitted by the browser.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

fn default_streaming() -> bool {
    true
}

impl ChatTurn {
    pub fn new(message: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_id: agent_id.into(),
            session_id: None,
            conversation_id: None,
            streaming: true,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// Body sent to the agent platform's converse endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConverseRequest {
    pub input: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEvent {
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub tool_call_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub tool_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEvent {
    pub tool_call_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub results: Vec<ToolResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    pub text_chunk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageComplete {
    pub message_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMarker {
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundComplete {
    pub round: Round,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    #[serde(default, deserialize_with = "lenient_steps")]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RoundResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundResponse {
    #[serde(default, deserialize_with = "nullable")]
    pub message: String,
}

/// One decoded event from the agent platform's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Reasoning(ReasoningEvent),
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    MessageChunk(MessageChunk),
    MessageComplete(MessageComplete),
    ConversationMarker(ConversationMarker),
    RoundComplete(RoundComplete),
    /// Anything the relay does not model; forwarded untouched.
    Other { kind: String, data: Value },
}

impl ChatEvent {
    /// Normalizes an upstream frame. `event_type` is the SSE `event:` field when
    /// the platform sent one; otherwise the variant is inferred from the payload.
    /// A payload that does not fit the variant its type names becomes `Other`.
    pub fn from_upstream(event_type: Option<&str>, data: Value) -> Self {
        let kind = event_type
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .unwrap_or_else(|| infer_kind(&data))
            .to_string();

        let parsed = match kind.as_str() {
            "reasoning" => decode(&data).map(Self::Reasoning),
            "tool_call" => decode(&data).map(Self::ToolCall),
            "tool_result" => decode(&data).map(Self::ToolResult),
            "message_chunk" => decode(&data).map(Self::MessageChunk),
            "message_complete" => decode(&data).map(Self::MessageComplete),
            "conversation_marker"
            | "conversation_id_set"
            | "conversation_created"
            | "conversation_updated" => decode(&data).map(Self::ConversationMarker),
            "round_complete" => decode(&data).map(Self::RoundComplete),
            _ => None,
        };

        parsed.unwrap_or(Self::Other { kind, data })
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Reasoning(_) => "reasoning",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::MessageChunk(_) => "message_chunk",
            Self::MessageComplete(_) => "message_complete",
            Self::ConversationMarker(_) => "conversation_marker",
            Self::RoundComplete(_) => "round_complete",
            Self::Other { kind, .. } => kind,
        }
    }

    pub fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Reasoning(event) => serde_json::to_value(event),
            Self::ToolCall(event) => serde_json::to_value(event),
            Self::ToolResult(event) => serde_json::to_value(event),
            Self::MessageChunk(event) => serde_json::to_value(event),
            Self::MessageComplete(event) => serde_json::to_value(event),
            Self::ConversationMarker(event) => serde_json::to_value(event),
            Self::RoundComplete(event) => serde_json::to_value(event),
            Self::Other { data, .. } => Ok(data.clone()),
        }
    }

    pub fn envelope(&self) -> Result<RelayEnvelope, serde_json::Error> {
        Ok(RelayEnvelope::new(self.kind(), self.to_data()?))
    }
}

fn infer_kind(data: &Value) -> &'static str {
    let has = |field: &str| data.get(field).map_or(false, |value| !value.is_null());

    if has("conversation_id") {
        "conversation_id_set"
    } else if has("reasoning") {
        "reasoning"
    } else if has("tool_call_id") {
        if has("results") {
            "tool_result"
        } else {
            "tool_call"
        }
    } else if has("message_content") {
        "message_complete"
    } else if has("text_chunk") {
        "message_chunk"
    } else if has("round") {
        "round_complete"
    } else {
        "unknown"
    }
}

fn decode<T: DeserializeOwned>(data: &Value) -> Option<T> {
    T::deserialize(data).ok()
}

/// Accumulated conversation step: reasoning text or a tool call with its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Reasoning { reasoning: String },
    ToolCall(ToolCallStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallStep {
    pub tool_call_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub tool_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub params: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub results: Vec<ToolResult>,
}

impl From<ToolCallEvent> for ToolCallStep {
    fn from(event: ToolCallEvent) -> Self {
        Self {
            tool_call_id: event.tool_call_id,
            tool_id: event.tool_id,
            params: event.params,
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ToolResult {
    /// The query the tool ran. Informational only.
    Query { query: String },
    TabularData(TabularData),
    Other(Value),
}

impl From<Value> for ToolResult {
    fn from(value: Value) -> Self {
        let data = value.get("data");
        match value.get("type").and_then(Value::as_str) {
            Some("query") => {
                let query = data
                    .and_then(|data| data.get("esql").or_else(|| data.get("query")))
                    .and_then(Value::as_str);
                if let Some(query) = query {
                    return Self::Query {
                        query: query.to_string(),
                    };
                }
            }
            Some("tabular_data") => {
                if let Some(table) = data.and_then(|data| TabularData::deserialize(data).ok()) {
                    return Self::TabularData(table);
                }
            }
            _ => {}
        }

        Self::Other(value)
    }
}

impl From<ToolResult> for Value {
    fn from(result: ToolResult) -> Self {
        match result {
            ToolResult::Query { query } => serde_json::json!({
                "type": "query",
                "data": { "esql": query },
            }),
            ToolResult::TabularData(table) => serde_json::json!({
                "type": "tabular_data",
                "data": serde_json::to_value(table).unwrap_or_default(),
            }),
            ToolResult::Other(value) => value,
        }
    }
}

/// Column descriptors plus positional row tuples. Rows are kept as raw JSON so
/// short, long or non-array rows survive decoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub columns: Vec<Column>,
    #[serde(default, deserialize_with = "nullable")]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedItem {
    pub id: String,
    pub name: String,
    pub brand: String,
    pub category: String,
    pub price: f64,
    pub quantity: u32,
    pub unit: String,
}

/// Outbound frame written to the browser as `data: <json>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: String,
}

impl RelayEnvelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionPayload {
    pub steps: Vec<Step>,
    pub conversation_id: String,
    pub agent_id: String,
    pub session_id: String,
    pub items: Vec<SuggestedItem>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
}

/// Reply of the platform's synchronous converse endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConverseResponse {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_steps")]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub response: Option<RoundResponse>,
    #[serde(default)]
    pub output: Option<String>,
}

impl ConverseResponse {
    pub fn reply(&self) -> &str {
        self.output
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .or_else(|| self.response.as_ref().map(|response| response.message.as_str()))
            .unwrap_or_default()
    }
}

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Step lists from the platform may contain step kinds we do not model.
fn lenient_steps<'de, D>(deserializer: D) -> Result<Vec<Step>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| Step::deserialize(value).ok())
        .collect())
}
