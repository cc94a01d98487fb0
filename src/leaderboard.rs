use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::scoring::{CartLine, GameRules, ScoreError, ScoreResult};

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("leaderboard service returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("missing configuration: set the {0} environment variable")]
    MissingConfig(&'static str),
}

/// Game result posted by the browser when the round ends.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSubmission {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub player_name: Option<String>,
    #[serde(default)]
    pub agent_used: Option<String>,
    #[serde(default)]
    pub items: Option<Vec<CartLine>>,
    /// Total the browser computed. Informational; the server recomputes it.
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default)]
    pub time_used: Option<f64>,
}

impl GameSubmission {
    pub fn cart(&self) -> Result<&[CartLine], ScoreError> {
        self.items.as_deref().ok_or(ScoreError::MissingCart)
    }

    pub fn score(&self, rules: &GameRules) -> Result<ScoreResult, ScoreError> {
        let time_used = self.time_used.ok_or(ScoreError::InvalidTime)?;
        rules.score(self.cart()?, time_used)
    }
}

/// What the leaderboard service stores for a finished game.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredGame {
    pub session_id: String,
    pub selected_agent: String,
    pub items_selected: Vec<CartLine>,
    pub total_price: f64,
    pub game_duration: u64,
    pub score: f64,
}

impl ScoredGame {
    pub fn new(submission: &GameSubmission, result: &ScoreResult) -> Self {
        Self {
            session_id: submission.session_id.clone(),
            selected_agent: submission
                .agent_used
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            items_selected: submission.items.clone().unwrap_or_default(),
            total_price: result.total_price,
            game_duration: submission.time_used.unwrap_or_default().max(0.0).round() as u64,
            score: result.score,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitReceipt {
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// External leaderboard persistence.
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    async fn submit(&self, game: &ScoredGame) -> Result<SubmitReceipt, LeaderboardError>;

    /// Ranked entries, best first, passed through as the service returns them.
    async fn top(&self, limit: usize, offset: usize) -> Result<Vec<Value>, LeaderboardError>;
}

#[derive(Debug, Clone)]
pub struct LeaderboardConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl LeaderboardConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpLeaderboard {
    client: Client,
    config: LeaderboardConfig,
}

impl HttpLeaderboard {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LeaderboardError> {
        Self::from_config(LeaderboardConfig::new(base_url))
    }

    pub fn from_env() -> Result<Self, LeaderboardError> {
        let base_url = env::var("LEADERBOARD_API_URL")
            .map_err(|_| LeaderboardError::MissingConfig("LEADERBOARD_API_URL"))?;
        Self::new(base_url)
    }

    pub fn from_config(config: LeaderboardConfig) -> Result<Self, LeaderboardError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn read<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, LeaderboardError> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            error!(status = status.as_u16(), body = %text, "leaderboard service error");
            return Err(LeaderboardError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl LeaderboardStore for HttpLeaderboard {
    async fn submit(&self, game: &ScoredGame) -> Result<SubmitReceipt, LeaderboardError> {
        let response = self
            .client
            .post(self.endpoint("api/submit-game"))
            .json(game)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn top(&self, limit: usize, offset: usize) -> Result<Vec<Value>, LeaderboardError> {
        // the service has no offset parameter; fetch enough rows and skip
        let response = self
            .client
            .get(self.endpoint("api/leaderboard"))
            .query(&[("limit", limit + offset)])
            .send()
            .await?;
        let entries: Vec<Value> = Self::read(response).await?;
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }
}
