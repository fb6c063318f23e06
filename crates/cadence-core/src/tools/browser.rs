//! Browser-like session collaborator.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a browser action left behind for the model to look at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserActionResult {
    /// Screenshot as a data URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_mouse_position: Option<String>,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Launches the browser and navigates to `url`.
    async fn launch(&self, url: &str) -> Result<BrowserActionResult>;
    /// Clicks at an `x,y` coordinate.
    async fn click(&self, coordinate: &str) -> Result<BrowserActionResult>;
    async fn type_text(&self, text: &str) -> Result<BrowserActionResult>;
    async fn scroll_down(&self) -> Result<BrowserActionResult>;
    async fn scroll_up(&self) -> Result<BrowserActionResult>;
    /// Closes the session. Closing a closed session is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Session for hosts without a browser. Every action fails; closing succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBrowser;

#[async_trait]
impl BrowserSession for NoBrowser {
    async fn launch(&self, _url: &str) -> Result<BrowserActionResult> {
        bail!("No browser is available in this environment")
    }

    async fn click(&self, _coordinate: &str) -> Result<BrowserActionResult> {
        bail!("No browser is available in this environment")
    }

    async fn type_text(&self, _text: &str) -> Result<BrowserActionResult> {
        bail!("No browser is available in this environment")
    }

    async fn scroll_down(&self) -> Result<BrowserActionResult> {
        bail!("No browser is available in this environment")
    }

    async fn scroll_up(&self) -> Result<BrowserActionResult> {
        bail!("No browser is available in this environment")
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
