//! Model stream adapter.
//!
//! The engine never talks to a provider directly. It asks a [`ModelClient`]
//! for a stream of [`ApiChunk`]s and tolerates that stream ending or failing
//! at any point.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

use crate::config::{Config, PricingConfig};
use crate::core::messages::ApiMessage;

/// Token usage reported by the adapter for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    /// Cost reported by the adapter, if it knows better than the pricing table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

/// One item of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiChunk {
    Text(String),
    Usage(Usage),
}

/// Categories of provider errors for consistent error handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// HTTP status error (4xx, 5xx)
    HttpStatus,
    /// Connection timeout or request timeout
    Timeout,
    /// Failed to parse response
    Parse,
    /// API-level error returned by the provider (e.g., overloaded, `rate_limit`)
    ApiError,
    /// The stream broke after it had started
    Stream,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderErrorKind::HttpStatus => write!(f, "http_status"),
            ProviderErrorKind::Timeout => write!(f, "timeout"),
            ProviderErrorKind::Parse => write!(f, "parse"),
            ProviderErrorKind::ApiError => write!(f, "api_error"),
            ProviderErrorKind::Stream => write!(f, "stream"),
        }
    }
}

/// Structured error from the model adapter with kind and details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    /// Error category
    pub kind: ProviderErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl ProviderError {
    /// Creates a new provider error.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an API error (from mid-stream error event).
    pub fn api_error(error_type: &str, message: &str) -> Self {
        Self::new(ProviderErrorKind::ApiError, format!("{error_type}: {message}"))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Stream of response chunks.
pub type ApiStream = BoxStream<'static, ProviderResult<ApiChunk>>;

/// Static facts about the model behind a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: u64,
    pub pricing: PricingConfig,
}

impl ModelInfo {
    pub fn from_config(config: &Config) -> Self {
        Self {
            id: config.model.clone(),
            context_window: config.context_window,
            pricing: config.pricing.clone(),
        }
    }
}

/// Creates model response streams.
pub trait ModelClient: Send + Sync {
    fn info(&self) -> &ModelInfo;

    /// Starts a request. Errors surface as stream items, never as a panic or
    /// a missing stream.
    fn create_message(&self, system_prompt: &str, history: &[ApiMessage]) -> ApiStream;
}

/// Computes request cost in USD from the pricing table.
pub fn calculate_api_cost(
    pricing: &PricingConfig,
    input_tokens: u64,
    output_tokens: u64,
    cache_write_tokens: u64,
    cache_read_tokens: u64,
) -> f64 {
    let per_token = |tokens: u64, per_million: f64| (tokens as f64) * per_million / 1_000_000.0;
    per_token(input_tokens, pricing.input_per_million)
        + per_token(output_tokens, pricing.output_per_million)
        + per_token(cache_write_tokens, pricing.cache_writes_per_million)
        + per_token(cache_read_tokens, pricing.cache_reads_per_million)
}

/// One canned model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedTurn {
    /// Text chunks, streamed in order.
    pub chunks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Fail before the first chunk with this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_before: Option<String>,
    /// Fail after the last chunk with this message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_after: Option<String>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![text.into()],
            ..Self::default()
        }
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_before: Some(message.into()),
            ..Self::default()
        }
    }

    fn into_stream(self) -> ApiStream {
        let mut items: Vec<ProviderResult<ApiChunk>> = Vec::new();
        if let Some(message) = self.fail_before {
            items.push(Err(ProviderError::api_error("request_failed", &message)));
            return stream::iter(items).boxed();
        }
        if let Some(usage) = self.usage {
            items.push(Ok(ApiChunk::Usage(usage)));
        }
        items.extend(self.chunks.into_iter().map(|c| Ok(ApiChunk::Text(c))));
        if let Some(message) = self.fail_after {
            items.push(Err(ProviderError::new(ProviderErrorKind::Stream, message)));
        }
        stream::iter(items).boxed()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    turns: Vec<ScriptedTurn>,
}

/// Replays canned responses, one per request.
///
/// Used by the CLI `--script` flag and by tests. Requests past the end of the
/// script fail with an API error.
pub struct ScriptedModel {
    info: ModelInfo,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<ApiMessage>>>,
}

impl ScriptedModel {
    pub fn new(info: ModelInfo, turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            info,
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Loads a `{"turns": [...]}` script from disk.
    pub fn from_file(info: ModelInfo, path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script from {}", path.display()))?;
        let script: ScriptFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse script from {}", path.display()))?;
        Ok(Self::new(info, script.turns))
    }

    /// Histories sent so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ApiMessage>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ModelClient for ScriptedModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn create_message(&self, _system_prompt: &str, history: &[ApiMessage]) -> ApiStream {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(history.to_vec());
        let next = self
            .turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(turn) => turn.into_stream(),
            None => stream::iter(vec![Err(ProviderError::api_error(
                "script_exhausted",
                "no scripted response left",
            ))])
            .boxed(),
        }
    }
}
