//! Toolkit configuration.
//!
//! [`ToolkitConfig`] holds the process-wide defaults used by the
//! [`Registry`](crate::engine::registry::Registry) and its instances. It provides
//! sensible defaults via [`Default`] and a fluent [`ToolkitConfig::builder()`] for
//! customization with validation.
//!
//! # Examples
//!
//! ```rust
//! use webview_toolkit::ToolkitConfig;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = ToolkitConfig::builder()
//!     .default_url("about:blank")
//!     .frame_pool_buffers(3)
//!     .build()?;
//! assert_eq!(cfg.frame_pool_buffers, 3);
//! # Ok(()) }
//! ```
//!
//! [`InstanceParams`] describe a single instance at creation time, and
//! [`BrowserSettings`] is the settings policy applied once the browser controller exists.

use crate::engine::DEFAULT_CHANNEL_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the folder created under the temp directory when no user data folder is given.
const DEFAULT_USER_DATA_DIR: &str = "WebViewToolkit";

/// Page loaded when an instance has no initial URL.
pub const DEFAULT_URL: &str = "about:blank";

/// Distance of one wheel notch in browser units.
pub const WHEEL_DELTA: i32 = 120;

/// Main toolkit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolkitConfig {
    /// User data folder used when an instance does not specify one
    pub default_user_data_folder: PathBuf,
    /// Page loaded when an instance has no initial URL
    pub default_url: String,
    /// Number of buffers in each capture frame pool
    pub frame_pool_buffers: usize,
    /// Browser units per host wheel unit
    pub wheel_delta: i32,
    /// Capacity of the toolkit event bus
    pub event_channel_capacity: usize,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            default_user_data_folder: std::env::temp_dir().join(DEFAULT_USER_DATA_DIR),
            default_url: DEFAULT_URL.to_string(),
            frame_pool_buffers: 2,
            wheel_delta: WHEEL_DELTA,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ToolkitConfig {
    pub fn builder() -> ToolkitConfigBuilder {
        ToolkitConfigBuilder::default()
    }
}

/// Builder for [`ToolkitConfig`].
#[derive(Debug, Clone, Default)]
pub struct ToolkitConfigBuilder {
    inner: ToolkitConfig,
}

impl ToolkitConfigBuilder {
    #[inline]
    fn map(mut self, f: impl FnOnce(&mut ToolkitConfig)) -> Self {
        f(&mut self.inner);
        self
    }

    pub fn default_user_data_folder<P: Into<PathBuf>>(self, p: P) -> Self {
        self.map(|c| c.default_user_data_folder = p.into())
    }
    pub fn default_url<S: Into<String>>(self, url: S) -> Self {
        self.map(|c| c.default_url = url.into())
    }
    pub fn frame_pool_buffers(self, n: usize) -> Self { self.map(|c| c.frame_pool_buffers = n) }
    pub fn wheel_delta(self, delta: i32) -> Self { self.map(|c| c.wheel_delta = delta) }
    pub fn event_channel_capacity(self, cap: usize) -> Self {
        self.map(|c| c.event_channel_capacity = cap)
    }

    /// Apply multiple changes in one go.
    pub fn with(self, f: impl FnOnce(&mut ToolkitConfig)) -> Self { self.map(f) }

    /// Validate and build the final config.
    pub fn build(self) -> Result<ToolkitConfig, ToolkitConfigError> {
        validate(&self.inner)?;
        Ok(self.inner)
    }
}

// ---------- Validation ----------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolkitConfigError {
    #[error("frame_pool_buffers must be at least 1")]
    NoFrameBuffers,

    #[error("wheel_delta must not be zero")]
    ZeroWheelDelta,

    #[error("event_channel_capacity must be at least 1")]
    ZeroChannelCapacity,

    #[error("default_url '{0}' is not a valid URL")]
    InvalidDefaultUrl(String),
}

fn validate(c: &ToolkitConfig) -> Result<(), ToolkitConfigError> {
    if c.frame_pool_buffers == 0 {
        return Err(ToolkitConfigError::NoFrameBuffers);
    }
    if c.wheel_delta == 0 {
        return Err(ToolkitConfigError::ZeroWheelDelta);
    }
    if c.event_channel_capacity == 0 {
        return Err(ToolkitConfigError::ZeroChannelCapacity);
    }
    if url::Url::parse(&c.default_url).is_err() {
        return Err(ToolkitConfigError::InvalidDefaultUrl(c.default_url.clone()));
    }
    Ok(())
}

/// Parameters for creating a single instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceParams {
    pub width: u32,
    pub height: u32,
    /// Browser profile folder. Falls back to [`ToolkitConfig::default_user_data_folder`].
    pub user_data_folder: Option<PathBuf>,
    /// First page to load once the browser is ready
    pub initial_url: Option<String>,
    pub enable_dev_tools: bool,
}

impl InstanceParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_initial_url<S: Into<String>>(mut self, url: S) -> Self {
        self.initial_url = Some(url.into());
        self
    }

    pub fn with_user_data_folder<P: Into<PathBuf>>(mut self, folder: P) -> Self {
        self.user_data_folder = Some(folder.into());
        self
    }

    pub fn with_dev_tools(mut self, enabled: bool) -> Self {
        self.enable_dev_tools = enabled;
        self
    }
}

/// Settings applied to the browser controller once it has been created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSettings {
    pub dev_tools_enabled: bool,
    pub default_context_menus_enabled: bool,
    pub zoom_control_enabled: bool,
    pub status_bar_enabled: bool,
}

impl BrowserSettings {
    /// Policy used for off-screen instances: context menus stay, zoom and status bar go.
    pub fn for_offscreen(dev_tools_enabled: bool) -> Self {
        Self {
            dev_tools_enabled,
            default_context_menus_enabled: true,
            zoom_control_enabled: false,
            status_bar_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ToolkitConfig::default();
        assert_eq!(cfg.default_url, "about:blank");
        assert_eq!(cfg.frame_pool_buffers, 2);
        assert_eq!(cfg.wheel_delta, 120);
        assert!(cfg.default_user_data_folder.ends_with("WebViewToolkit"));
    }

    #[test]
    fn builder_validates() {
        assert_eq!(
            ToolkitConfig::builder().frame_pool_buffers(0).build(),
            Err(ToolkitConfigError::NoFrameBuffers)
        );
        assert_eq!(
            ToolkitConfig::builder().wheel_delta(0).build(),
            Err(ToolkitConfigError::ZeroWheelDelta)
        );
        assert!(matches!(
            ToolkitConfig::builder().default_url("not a url").build(),
            Err(ToolkitConfigError::InvalidDefaultUrl(_))
        ));

        let cfg = ToolkitConfig::builder()
            .with(|c| c.event_channel_capacity = 8)
            .build()
            .unwrap();
        assert_eq!(cfg.event_channel_capacity, 8);
    }

    #[test]
    fn config_serializes() {
        let cfg = ToolkitConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ToolkitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }

    #[test]
    fn offscreen_policy() {
        let s = BrowserSettings::for_offscreen(false);
        assert!(!s.dev_tools_enabled);
        assert!(s.default_context_menus_enabled);
        assert!(!s.zoom_control_enabled);
        assert!(!s.status_bar_enabled);
    }
}
