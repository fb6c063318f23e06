//! Tool-server capability collaborator.
//!
//! Calls are fallible remote operations. Timeouts belong to the adapter.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item of a tool call response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource, shown to the model without its binary blob.
    Resource { resource: Value },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub content: Vec<ToolContent>,
}

impl ToolCallResponse {
    /// Text rendering for the UI and the model.
    pub fn to_text(&self) -> String {
        let parts: Vec<String> = self
            .content
            .iter()
            .filter_map(|item| match item {
                ToolContent::Text { text } => Some(text.clone()),
                ToolContent::Resource { resource } => {
                    let mut resource = resource.clone();
                    if let Some(map) = resource.as_object_mut() {
                        map.remove("blob");
                    }
                    serde_json::to_string_pretty(&resource).ok()
                }
                ToolContent::Image { .. } => None,
            })
            .filter(|part| !part.is_empty())
            .collect();
        let body = if parts.is_empty() {
            "(No response)".to_string()
        } else {
            parts.join("\n\n")
        };
        if self.is_error {
            format!("Error:\n{body}")
        } else {
            body
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceResponse {
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

impl ResourceResponse {
    pub fn to_text(&self) -> String {
        let parts: Vec<&str> = self
            .contents
            .iter()
            .filter_map(|item| item.text.as_deref())
            .filter(|text| !text.is_empty())
            .collect();
        if parts.is_empty() {
            "(Empty response)".to_string()
        } else {
            parts.join("\n\n")
        }
    }
}

#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<ToolCallResponse>;

    async fn read_resource(&self, server: &str, uri: &str) -> Result<ResourceResponse>;
}

/// Registry with no servers connected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToolServers;

#[async_trait]
impl ToolServer for NoToolServers {
    async fn call_tool(
        &self,
        server: &str,
        _tool: &str,
        _arguments: Option<Value>,
    ) -> Result<ToolCallResponse> {
        bail!("No connection found for server: {server}")
    }

    async fn read_resource(&self, server: &str, _uri: &str) -> Result<ResourceResponse> {
        bail!("No connection found for server: {server}")
    }
}
