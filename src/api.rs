use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::{
    leaderboard::{GameSubmission, LeaderboardStore, ScoredGame},
    providers::AgentPlatform,
    relay::{converse_request, start_relay, summarize_converse},
    scoring::{GameRules, ScoreBreakdown, Violation},
    types::ChatTurn,
    RelayError,
};

const MAX_LEADERBOARD_LIMIT: usize = 100;

pub struct AppState {
    pub platform: Option<Arc<dyn AgentPlatform>>,
    pub leaderboard: Option<Arc<dyn LeaderboardStore>>,
    pub rules: GameRules,
}

impl AppState {
    pub fn new(
        platform: Option<Arc<dyn AgentPlatform>>,
        leaderboard: Option<Arc<dyn LeaderboardStore>>,
    ) -> Self {
        Self {
            platform,
            leaderboard,
            rules: GameRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: GameRules) -> Self {
        self.rules = rules;
        self
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/agent-chat", post(agent_chat))
        .route("/api/leaderboard", get(get_leaderboard).post(submit_game))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

fn relay_failure(err: &RelayError) -> Response {
    if err.is_upstream() {
        failure(
            StatusCode::BAD_GATEWAY,
            format!("Agent platform request failed: {err}"),
        )
    } else {
        failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Agent chat failed: {err}"),
        )
    }
}

fn preview(text: &str) -> String {
    text.chars().take(50).collect()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "pricebot" }))
}

async fn agent_chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatTurn>, JsonRejection>,
) -> Response {
    let Json(turn) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("Invalid chat request: {}", rejection.body_text()),
            )
        }
    };

    if turn.message.trim().is_empty() || turn.agent_id.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Message and agent ID are required");
    }

    let Some(platform) = state.platform.clone() else {
        error!("agent platform is not configured");
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Agent platform not configured",
        );
    };

    info!(
        agent_id = %turn.agent_id,
        streaming = turn.streaming,
        message = %preview(&turn.message),
        "agent chat request"
    );

    if turn.streaming {
        stream_chat(platform.as_ref(), &turn).await
    } else {
        converse_chat(platform.as_ref(), &turn).await
    }
}

async fn stream_chat(platform: &dyn AgentPlatform, turn: &ChatTurn) -> Response {
    let stream = match start_relay(platform, turn).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "failed to open agent stream");
            return relay_failure(&err);
        }
    };

    let events = stream.map(|item| -> Result<Event, RelayError> {
        let envelope = item.map_err(|err| {
            error!(error = %err, "agent stream aborted");
            err
        })?;
        Ok(Event::default().data(serde_json::to_string(&envelope)?))
    });

    Sse::new(events).into_response()
}

async fn converse_chat(platform: &dyn AgentPlatform, turn: &ChatTurn) -> Response {
    match platform.converse(converse_request(platform, turn)).await {
        Ok(response) => Json(summarize_converse(turn, response)).into_response(),
        Err(err) => {
            error!(error = %err, "agent converse failed");
            relay_failure(&err)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    message: String,
    score: f64,
    display_score: String,
    valid: bool,
    reason: String,
    total_price: f64,
    violations: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    breakdown: Option<ScoreBreakdown>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rank: Option<u32>,
}

async fn submit_game(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GameSubmission>, JsonRejection>,
) -> Response {
    let Json(submission) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("Invalid game submission: {}", rejection.body_text()),
            )
        }
    };

    if submission.session_id.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Missing required fields");
    }

    let result = match submission.score(&state.rules) {
        Ok(result) => result,
        Err(err) => return failure(StatusCode::BAD_REQUEST, format!("Invalid cart: {err}")),
    };

    if let Some(claimed) = submission.total_price {
        if (claimed - result.total_price).abs() > 0.005 {
            warn!(
                session_id = %submission.session_id,
                claimed,
                computed = result.total_price,
                "submitted total does not match cart"
            );
        }
    }

    if result.is_valid() {
        info!(
            session_id = %submission.session_id,
            score = %result.display_score(),
            "valid game"
        );
    } else {
        info!(
            session_id = %submission.session_id,
            reason = %result.reason(),
            "game scored zero"
        );
    }

    let Some(store) = state.leaderboard.clone() else {
        error!("leaderboard service is not configured");
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Leaderboard service not configured",
        );
    };

    let receipt = match store.submit(&ScoredGame::new(&submission, &result)).await {
        Ok(receipt) => receipt,
        Err(err) => {
            error!(error = %err, "failed to submit game result");
            return failure(StatusCode::BAD_GATEWAY, "Failed to submit game result");
        }
    };

    Json(SubmitResponse {
        success: true,
        message: "Game result submitted successfully".to_string(),
        score: result.score,
        display_score: result.display_score(),
        valid: result.is_valid(),
        reason: result.reason(),
        total_price: result.total_price,
        violations: result.violations,
        breakdown: result.breakdown,
        rank: receipt.rank,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardPage {
    success: bool,
    data: Vec<Value>,
    limit: usize,
    offset: usize,
    last_updated: String,
}

async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(10).clamp(1, MAX_LEADERBOARD_LIMIT);
    let offset = query.offset.unwrap_or(0);

    let Some(store) = state.leaderboard.clone() else {
        return failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Leaderboard service not configured",
        );
    };

    match store.top(limit, offset).await {
        Ok(data) => Json(LeaderboardPage {
            success: true,
            data,
            limit,
            offset,
            last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })
        .into_response(),
        Err(err) => {
            error!(error = %err, "failed to fetch leaderboard");
            failure(StatusCode::BAD_GATEWAY, "Failed to fetch leaderboard")
        }
    }
}
