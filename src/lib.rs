pub mod api;
pub mod error;
pub mod extract;
pub mod leaderboard;
pub mod providers;
pub mod relay;
pub mod scoring;
pub mod sse;
pub mod types;

pub use api::{router, AppState};
pub use error::RelayError;
pub use extract::{extract_items, extract_items_with_reply};
pub use leaderboard::{
    GameSubmission, HttpLeaderboard, LeaderboardConfig, LeaderboardError, LeaderboardStore,
    ScoredGame, SubmitReceipt,
};
pub use providers::{
    agent_builder::{AgentBuilder, AgentBuilderConfig},
    scripted::ScriptedPlatform,
    AgentPlatform,
};
pub use relay::{
    relay_stream, start_relay, summarize_converse, ByteStream, ChatReply, RelayContext,
    RelaySession, RelayStream, COMPLETION_EVENT,
};
pub use scoring::{
    score, CartLine, GameRules, ScoreBreakdown, ScoreError, ScoreResult, Violation,
};
pub use sse::{LineTooLong, SseDecoder, SseFrame, MAX_LINE_BYTES};
pub use types::{
    ChatEvent, ChatTurn, CompletionPayload, ConverseRequest, ConverseResponse, RelayEnvelope,
    Step, SuggestedItem, TabularData, ToolCallStep, ToolResult,
};
