//! Conversation records.
//!
//! Two logs describe a task: the model-facing API history (`ApiMessage`) and
//! the UI-facing log (`UiMessage`). Both serialize to the on-disk JSON layout.

use std::ops::AddAssign;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Inline image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

/// A block of model-facing content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    /// Native tool call, only found in histories written by older clients.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Vec<ApiBlock>,
        #[serde(default, skip_serializing_if = "is_false")]
        is_error: bool,
    },
}

impl ApiBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ApiBlock::Text { text: text.into() }
    }

    /// Builds an image block from a `data:image/...;base64,` URL.
    pub fn image_from_data_url(url: &str) -> Result<Self, ImageError> {
        let (media_type, data) = split_data_url(url)?;
        Ok(ApiBlock::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type: media_type.to_string(),
                data: data.to_string(),
            },
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ApiBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Checks that an image is a supported base64 data URL.
pub fn validate_image(url: &str) -> Result<(), ImageError> {
    split_data_url(url).map(|_| ())
}

fn split_data_url(url: &str) -> Result<(&str, &str), ImageError> {
    let rest = url.strip_prefix("data:").ok_or(ImageError::NotDataUrl)?;
    let (header, data) = rest.split_once(',').ok_or(ImageError::NotDataUrl)?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or(ImageError::NotDataUrl)?;
    if !matches!(
        media_type,
        "image/png" | "image/jpeg" | "image/gif" | "image/webp"
    ) {
        return Err(ImageError::UnsupportedType(media_type.to_string()));
    }
    BASE64
        .decode(data)
        .map_err(|_err| ImageError::InvalidBase64)?;
    Ok((media_type, data))
}

/// Converts already-validated images into blocks, dropping any that fail.
pub fn image_blocks(images: &[String]) -> Vec<ApiBlock> {
    images
        .iter()
        .filter_map(|url| match ApiBlock::image_from_data_url(url) {
            Ok(block) => Some(block),
            Err(err) => {
                tracing::warn!(%err, "dropping invalid image");
                None
            }
        })
        .collect()
}

/// One entry of the model-facing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ApiBlock>,
}

impl ApiMessage {
    pub fn user(content: Vec<ApiBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ApiBlock::text(text)],
        }
    }
}

/// Renders blocks for the `api_req_started` request preview.
pub fn blocks_to_markdown(blocks: &[ApiBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            ApiBlock::Text { text } => text.clone(),
            ApiBlock::Image { .. } => "[Image]".to_string(),
            ApiBlock::ToolUse { name, input, .. } => format!("[Tool Use: {name}]\n{input}"),
            ApiBlock::ToolResult { content, .. } => {
                format!("[Tool Result]\n{}", blocks_to_markdown(content))
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Kinds of blocking questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CommandOutput,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    BrowserActionLaunch,
    UseMcpServer,
}

/// Kinds of informational messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Error,
    ApiReqStarted,
    ApiReqRetried,
    Text,
    CompletionResult,
    UserFeedback,
    Command,
    CommandOutput,
    Tool,
    BrowserAction,
    BrowserActionLaunch,
    BrowserActionResult,
    UseMcpServer,
    McpServerRequestStarted,
    McpServerResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

/// One entry of the UI-facing log. `ts` is its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: u64,
    #[serde(flatten)]
    pub kind: UiKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

impl UiMessage {
    pub fn ask(&self) -> Option<AskKind> {
        match self.kind {
            UiKind::Ask { ask } => Some(ask),
            UiKind::Say { .. } => None,
        }
    }

    pub fn say(&self) -> Option<SayKind> {
        match self.kind {
            UiKind::Say { say } => Some(say),
            UiKind::Ask { .. } => None,
        }
    }

    pub fn is_resume_ask(&self) -> bool {
        matches!(
            self.ask(),
            Some(AskKind::ResumeTask | AskKind::ResumeCompletedTask)
        )
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// How the host answered an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponse {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

/// A host answer, delivered exactly once to the pending ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskDecision {
    pub response: AskResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskDecision {
    pub fn yes() -> Self {
        Self {
            response: AskResponse::YesButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            response: AskResponse::NoButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskResponse::MessageResponse,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    /// Reads the decision as an answer to an approval request.
    pub fn approval(&self) -> ApprovalDecision {
        match self.response {
            AskResponse::YesButtonClicked => ApprovalDecision::Approve,
            AskResponse::NoButtonClicked => ApprovalDecision::Deny,
            AskResponse::MessageResponse => ApprovalDecision::DenyWithFeedback {
                text: self.text.clone().unwrap_or_default(),
                images: self.images.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
    DenyWithFeedback { text: String, images: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    StreamingFailed,
}

/// Payload of an `api_req_started` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiReqInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

impl ApiReqInfo {
    /// Parses the payload of a message; malformed payloads read as empty.
    pub fn from_message(message: &UiMessage) -> Self {
        message
            .text
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or_default()
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in.unwrap_or(0)
            + self.tokens_out.unwrap_or(0)
            + self.cache_writes.unwrap_or(0)
            + self.cache_reads.unwrap_or(0)
    }
}

/// Usage summed over every request of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
}

impl AddAssign<&ApiReqInfo> for ApiMetrics {
    fn add_assign(&mut self, info: &ApiReqInfo) {
        self.tokens_in += info.tokens_in.unwrap_or(0);
        self.tokens_out += info.tokens_out.unwrap_or(0);
        self.cache_writes += info.cache_writes.unwrap_or(0);
        self.cache_reads += info.cache_reads.unwrap_or(0);
        self.total_cost += info.cost.unwrap_or(0.0);
    }
}

impl ApiMetrics {
    /// Sums the `api_req_started` records of a UI log.
    pub fn from_ui_messages(messages: &[UiMessage]) -> Self {
        let mut metrics = ApiMetrics::default();
        for message in messages
            .iter()
            .filter(|m| m.say() == Some(SayKind::ApiReqStarted))
        {
            metrics += &ApiReqInfo::from_message(message);
        }
        metrics
    }
}
