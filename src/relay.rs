use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use chrono::{SecondsFormat, Utc};
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    error::RelayError,
    extract::{extract_items, extract_items_with_reply},
    providers::AgentPlatform,
    sse::{SseDecoder, SseFrame},
    types::{
        ChatEvent, ChatTurn, CompletionPayload, ConverseRequest, ConverseResponse, RelayEnvelope,
        Step, SuggestedItem, ToolCallStep,
    },
};

/// Raw body chunks from the agent platform.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RelayError>> + Send>>;

/// Normalized events for the browser, ending with one `completion` envelope.
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<RelayEnvelope, RelayError>> + Send>>;

pub const COMPLETION_EVENT: &str = "completion";

#[derive(Debug, Clone, Default)]
pub struct RelayContext {
    pub agent_id: String,
    pub session_id: Option<String>,
}

impl RelayContext {
    pub fn new(agent_id: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id,
        }
    }
}

/// Conversation state accumulated over one relayed turn.
#[derive(Debug)]
pub struct RelaySession {
    context: RelayContext,
    steps: Vec<Step>,
    conversation_id: Option<String>,
    reply: String,
    items: Vec<SuggestedItem>,
}

impl RelaySession {
    pub fn new(context: RelayContext) -> Self {
        Self {
            context,
            steps: Vec::new(),
            conversation_id: None,
            reply: String::new(),
            items: Vec::new(),
        }
    }

    /// Decodes one `data:` line and folds it into the session. Returns the event
    /// to forward, or `None` when the frame is malformed or must be dropped.
    pub fn ingest(&mut self, frame: &SseFrame) -> Option<ChatEvent> {
        let payload: Value = match serde_json::from_str(&frame.data) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(error = %err, "skipping malformed stream frame");
                return None;
            }
        };

        let event_type = frame.event.clone().or_else(|| {
            payload
                .get("event")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let data = match payload {
            Value::Object(mut object) => match object.remove("data") {
                Some(data) => data,
                None => Value::Object(object),
            },
            other => other,
        };

        let event = ChatEvent::from_upstream(event_type.as_deref(), data);
        self.apply(&event).then_some(event)
    }

    /// Returns false when the event has nothing to attach to and is dropped.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        match event {
            ChatEvent::ConversationMarker(marker) => {
                self.conversation_id = Some(marker.conversation_id.clone());
            }
            ChatEvent::Reasoning(reasoning) => {
                if !reasoning.reasoning.is_empty() {
                    self.steps.push(Step::Reasoning {
                        reasoning: reasoning.reasoning.clone(),
                    });
                }
            }
            ChatEvent::ToolCall(call) => {
                if self.tool_call_mut(&call.tool_call_id).is_none() {
                    self.steps.push(Step::ToolCall(call.clone().into()));
                }
            }
            ChatEvent::ToolResult(result) => {
                let Some(step) = self.tool_call_mut(&result.tool_call_id) else {
                    debug!(tool_call_id = %result.tool_call_id, "dropping result for unknown tool call");
                    return false;
                };
                step.results = result.results.clone();
                self.items = extract_items(&self.steps);
            }
            ChatEvent::MessageChunk(chunk) => self.reply.push_str(&chunk.text_chunk),
            ChatEvent::MessageComplete(message) => {
                self.reply = message.message_content.clone();
            }
            ChatEvent::RoundComplete(round) => {
                if self.steps.is_empty() && !round.round.steps.is_empty() {
                    self.steps = round.round.steps.clone();
                    self.items = extract_items(&self.steps);
                }
                if let Some(response) = &round.round.response {
                    if !response.message.is_empty() {
                        self.reply = response.message.clone();
                    }
                }
            }
            ChatEvent::Other { .. } => {}
        }
        true
    }

    fn tool_call_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolCallStep> {
        self.steps.iter_mut().find_map(|step| match step {
            Step::ToolCall(call) if call.tool_call_id == tool_call_id => Some(call),
            _ => None,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Items from the most recent tool result.
    pub fn items(&self) -> &[SuggestedItem] {
        &self.items
    }

    pub fn into_completion(self) -> CompletionPayload {
        let items = if self.reply.is_empty() {
            self.items
        } else {
            extract_items_with_reply(&self.steps, Some(&self.reply))
        };

        let conversation_id = self
            .conversation_id
            .or(self.context.session_id)
            .unwrap_or_default();

        CompletionPayload {
            steps: self.steps,
            session_id: conversation_id.clone(),
            conversation_id,
            agent_id: self.context.agent_id,
            items,
            response: self.reply,
        }
    }
}

/// Re-frames an upstream SSE body as normalized envelopes. Each event is
/// yielded as soon as its line is complete; the `completion` envelope follows
/// once the body ends. A gap longer than `idle_timeout` between chunks ends the
/// stream with [`RelayError::StreamIdle`].
pub fn relay_stream(body: ByteStream, context: RelayContext, idle_timeout: Duration) -> RelayStream {
    let stream = try_stream! {
        let mut body = body;
        let mut decoder = SseDecoder::new();
        let mut session = RelaySession::new(context);

        loop {
            let next = tokio::time::timeout(idle_timeout, body.next())
                .await
                .map_err(|_| RelayError::StreamIdle(idle_timeout))?;
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            for frame in decoder.push(&chunk)? {
                if let Some(event) = session.ingest(&frame) {
                    yield event.envelope()?;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            if let Some(event) = session.ingest(&frame) {
                yield event.envelope()?;
            }
        }

        let completion = session.into_completion();
        debug!(
            steps = completion.steps.len(),
            items = completion.items.len(),
            conversation_id = %completion.conversation_id,
            "relay finished"
        );
        yield RelayEnvelope::new(COMPLETION_EVENT, serde_json::to_value(&completion)?);
    };

    Box::pin(stream)
}

pub fn converse_request(platform: &dyn AgentPlatform, turn: &ChatTurn) -> ConverseRequest {
    ConverseRequest {
        input: turn.message.clone(),
        agent_id: platform.resolve_agent(&turn.agent_id),
        conversation_id: turn
            .conversation_id
            .clone()
            .filter(|conversation_id| !conversation_id.is_empty()),
    }
}

/// Opens the upstream stream and starts relaying. Connection failures surface
/// here, before any event is produced.
pub async fn start_relay(
    platform: &dyn AgentPlatform,
    turn: &ChatTurn,
) -> Result<RelayStream, RelayError> {
    let request = converse_request(platform, turn);
    info!(
        platform = platform.name(),
        agent_id = %request.agent_id,
        continuing = request.conversation_id.is_some(),
        "opening agent stream"
    );

    let body = platform.open_stream(request).await?;
    let context = RelayContext::new(turn.agent_id.clone(), turn.session_id.clone());
    Ok(relay_stream(body, context, platform.stream_idle_timeout()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub success: bool,
    pub response: String,
    pub items: Vec<SuggestedItem>,
    pub agent_id: String,
    pub session_id: Option<String>,
    pub metadata: ReplyMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMetadata {
    pub timestamp: String,
    pub agent_used: String,
    pub steps: Vec<Step>,
    pub streaming: bool,
}

/// Builds the single JSON reply used when the browser asks for no streaming.
pub fn summarize_converse(turn: &ChatTurn, response: ConverseResponse) -> ChatReply {
    let reply = response.reply().to_string();
    let items = extract_items_with_reply(&response.steps, Some(&reply));
    let text = if reply.trim().is_empty() {
        fallback_reply(&response.steps, &items)
    } else {
        reply
    };

    let session_id = response
        .conversation_id
        .or(response.session_id)
        .or_else(|| turn.session_id.clone());

    ChatReply {
        success: true,
        response: text,
        items,
        agent_id: turn.agent_id.clone(),
        session_id,
        metadata: ReplyMetadata {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            agent_used: turn.agent_id.clone(),
            steps: response.steps,
            streaming: false,
        },
    }
}

/// Reply text for rounds where the agent produced tool output but no words.
pub fn fallback_reply(steps: &[Step], items: &[SuggestedItem]) -> String {
    let called_tools = steps.iter().any(|step| matches!(step, Step::ToolCall(_)));

    if !called_tools {
        "I'm working on your request! Let me search for the best options for you.".to_string()
    } else if items.is_empty() {
        "I searched for items but didn't find any matches. Let me try a different approach for you!"
            .to_string()
    } else {
        format!(
            "I found {} great options for you! Check out the suggested items below and use the \"Add\" buttons to build your cart.",
            items.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{LineTooLong, MAX_LINE_BYTES};
    use crate::types::ToolResult;
    use futures_util::stream;
    use serde_json::json;

    fn frame(event: Option<&str>, data: Value) -> SseFrame {
        SseFrame {
            event: event.map(str::to_string),
            data: json!({ "data": data }).to_string(),
        }
    }

    fn grocery_result(id: &str) -> Value {
        json!({
            "tool_call_id": id,
            "results": [
                { "type": "query", "data": { "esql": "FROM grocery_items" } },
                {
                    "type": "tabular_data",
                    "data": {
                        "columns": [{ "name": "name" }, { "name": "best_price" }],
                        "values": [["Eggs", 3.5], ["Milk", 2.25]]
                    }
                }
            ]
        })
    }

    fn session() -> RelaySession {
        RelaySession::new(RelayContext::new("budget_master", Some("session-1".into())))
    }

    fn body(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, RelayError>(chunk.as_bytes().to_vec())),
        ))
    }

    #[test]
    fn tool_results_update_matching_call_in_place() {
        let mut session = session();
        assert!(session
            .ingest(&frame(Some("reasoning"), json!({ "reasoning": "Checking prices" })))
            .is_some());
        assert!(session
            .ingest(&frame(
                Some("tool_call"),
                json!({ "tool_call_id": "t1", "tool_id": "grocery.search", "params": { "q": "eggs" } })
            ))
            .is_some());
        assert!(session.items().is_empty());

        assert!(session
            .ingest(&frame(Some("tool_result"), grocery_result("t1")))
            .is_some());

        assert_eq!(session.steps().len(), 2);
        let Step::ToolCall(ToolCallStep { results, .. }) = &session.steps()[1] else {
            panic!("expected tool call step");
        };
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], ToolResult::Query { .. }));
        assert_eq!(session.items().len(), 2);
    }

    #[test]
    fn unmatched_tool_result_is_dropped() {
        let mut session = session();
        assert!(session
            .ingest(&frame(Some("tool_result"), grocery_result("ghost")))
            .is_none());
        assert!(session.steps().is_empty());
        assert!(session.items().is_empty());
    }

    #[test]
    fn items_are_recomputed_not_accumulated() {
        let mut session = session();
        session.ingest(&frame(
            Some("tool_call"),
            json!({ "tool_call_id": "t1", "tool_id": "grocery.search" }),
        ));
        session.ingest(&frame(Some("tool_result"), grocery_result("t1")));
        assert_eq!(session.items().len(), 2);

        session.ingest(&frame(
            Some("tool_result"),
            json!({ "tool_call_id": "t1", "results": [] }),
        ));
        assert!(session.items().is_empty());
    }

    #[test]
    fn malformed_json_is_skipped() {
        let mut session = session();
        let broken = SseFrame {
            event: Some("reasoning".into()),
            data: "{\"data\": {\"reasoning\": ".into(),
        };
        assert!(session.ingest(&broken).is_none());
    }

    #[test]
    fn completion_falls_back_to_caller_session() {
        let completion = session().into_completion();
        assert_eq!(completion.conversation_id, "session-1");
        assert_eq!(completion.session_id, "session-1");
        assert_eq!(completion.agent_id, "budget_master");
        assert!(completion.items.is_empty());

        let mut observed = session();
        observed.ingest(&frame(
            Some("conversation_id_set"),
            json!({ "conversation_id": "conv-7" }),
        ));
        assert_eq!(observed.into_completion().conversation_id, "conv-7");
    }

    #[test]
    fn message_chunks_accumulate_until_complete() {
        let mut session = session();
        session.ingest(&frame(Some("message_chunk"), json!({ "text_chunk": "Hel" })));
        session.ingest(&frame(Some("message_chunk"), json!({ "text_chunk": "lo" })));
        assert_eq!(session.reply(), "Hello");
        session.ingest(&frame(
            Some("message_complete"),
            json!({ "message_content": "Hello there" }),
        ));
        assert_eq!(session.reply(), "Hello there");
    }

    #[test]
    fn round_complete_supplies_steps_when_none_streamed() {
        let mut session = session();
        session.ingest(&frame(
            Some("round_complete"),
            json!({
                "round": {
                    "steps": [{
                        "type": "tool_call",
                        "tool_call_id": "t9",
                        "tool_id": "grocery.search",
                        "params": {},
                        "results": grocery_result("t9")["results"].clone()
                    }],
                    "response": { "message": "Two picks for you" }
                }
            }),
        ));
        assert_eq!(session.steps().len(), 1);
        assert_eq!(session.items().len(), 2);
        assert_eq!(session.reply(), "Two picks for you");
    }

    #[tokio::test]
    async fn relay_survives_invalid_frame_between_valid_ones() {
        let stream = relay_stream(
            body(vec![
                "event: reasoning\ndata: {\"data\":{\"reasoning\":\"one\"}}\n\n",
                "event: reasoning\ndata: {\"data\":{\"reaso\n\n",
                "event: reasoning\ndata: {\"data\":{\"reasoning\":\"two\"}}\n\n",
            ]),
            RelayContext::new("budget_master", None),
            Duration::from_secs(5),
        );

        let envelopes: Vec<RelayEnvelope> = stream
            .map(|item| item.expect("relay item"))
            .collect()
            .await;

        let kinds: Vec<&str> = envelopes.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["reasoning", "reasoning", COMPLETION_EVENT]);
        assert_eq!(envelopes[0].data["reasoning"], "one");
        assert_eq!(envelopes[1].data["reasoning"], "two");
        assert_eq!(envelopes[2].data["steps"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn relay_handles_lines_split_across_chunks() {
        let stream = relay_stream(
            body(vec![
                "event: tool_",
                "call\ndata: {\"data\":{\"tool_call_id\":\"t1\",",
                "\"tool_id\":\"grocery.search\"}}\n\nevent: tool_result\ndata: ",
                "{\"data\":{\"tool_call_id\":\"t1\",\"results\":[]}}",
            ]),
            RelayContext::new("health_guru", Some("s-1".into())),
            Duration::from_secs(5),
        );

        let envelopes: Vec<RelayEnvelope> = stream
            .map(|item| item.expect("relay item"))
            .collect()
            .await;

        let kinds: Vec<&str> = envelopes.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["tool_call", "tool_result", COMPLETION_EVENT]);
        let completion = &envelopes[2].data;
        assert_eq!(completion["items"], json!([]));
        assert_eq!(completion["sessionId"], "s-1");
    }

    #[tokio::test]
    async fn body_error_ends_the_relay() {
        let failing: ByteStream = Box::pin(stream::iter(vec![
            Ok(b"data: {\"data\":{\"reasoning\":\"a\"}}\n".to_vec()),
            Err(RelayError::InvalidResponse("connection reset")),
        ]));
        let items: Vec<Result<RelayEnvelope, RelayError>> =
            relay_stream(failing, RelayContext::default(), Duration::from_secs(5))
                .collect()
                .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(RelayError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn runaway_line_ends_the_relay() {
        let flood: ByteStream = Box::pin(stream::iter(vec![
            Ok(b"data: {\"data\":{\"reasoning\":\"a\"}}\n".to_vec()),
            Ok(vec![b'x'; MAX_LINE_BYTES + 1]),
            Ok(b"\n".to_vec()),
        ]));
        let items: Vec<Result<RelayEnvelope, RelayError>> =
            relay_stream(flood, RelayContext::default(), Duration::from_secs(5))
                .collect()
                .await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(RelayError::LineTooLong(LineTooLong { limit: MAX_LINE_BYTES }))
        ));
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let stalled: ByteStream = Box::pin(stream::pending());
        let mut relay = relay_stream(stalled, RelayContext::default(), Duration::from_millis(20));
        let first = relay.next().await.expect("an item");
        assert!(matches!(first, Err(RelayError::StreamIdle(_))));
        assert!(relay.next().await.is_none());
    }

    #[test]
    fn fallback_reply_describes_results() {
        assert!(fallback_reply(&[], &[]).starts_with("I'm working on your request"));

        let steps = vec![Step::ToolCall(ToolCallStep {
            tool_call_id: "t".into(),
            tool_id: "grocery.search".into(),
            params: Default::default(),
            results: Vec::new(),
        })];
        assert!(fallback_reply(&steps, &[]).contains("didn't find any matches"));
    }

    #[test]
    fn summarize_uses_steps_and_falls_back_on_empty_reply() {
        let response: ConverseResponse = serde_json::from_value(json!({
            "conversation_id": "conv-3",
            "steps": [{
                "type": "tool_call",
                "tool_call_id": "t1",
                "tool_id": "grocery.search",
                "params": {},
                "results": grocery_result("t1")["results"].clone()
            }],
            "response": { "message": "" }
        }))
        .expect("converse response");

        let turn = ChatTurn::new("cheap eggs", "budget_master").with_streaming(false);
        let reply = summarize_converse(&turn, response);
        assert!(reply.success);
        assert_eq!(reply.items.len(), 2);
        assert_eq!(reply.session_id.as_deref(), Some("conv-3"));
        assert!(reply.response.starts_with("I found 2 great options"));
        assert!(!reply.metadata.streaming);
    }
}
