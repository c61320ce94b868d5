//! Platform seam.
//!
//! Everything the toolkit needs from the operating system sits behind a trait:
//!
//! - [`browser`]: browser environment and composition controller creation.
//! - [`window`]: the hidden window that serves as capture target and input surface.
//! - [`composition`]: visuals that host the browser output inside the window.
//! - [`capture`]: window capture items, frame pools and sessions.
//!
//! A [`Platform`] bundles one implementation of each, together with the
//! [`DeviceProvider`] graphics backends draw their devices from. The `windows` module
//! implements them on WebView2, Windows Graphics Capture and Direct3D; the [`software`]
//! module implements all of them in-process.

use crate::render::device::DeviceProvider;
use std::sync::Arc;

pub mod browser;
pub mod capture;
pub mod composition;
pub mod software;
pub mod window;
#[cfg(target_os = "windows")]
pub mod windows;

use browser::BrowserFactory;
use capture::CaptureService;
use composition::Compositor;
use window::Windowing;

/// Set of platform services used by the registry and its instances.
#[derive(Clone)]
pub struct Platform {
    pub browser: Arc<dyn BrowserFactory>,
    pub windowing: Arc<dyn Windowing>,
    pub compositor: Arc<dyn Compositor>,
    pub capture: Arc<dyn CaptureService>,
    pub devices: Arc<dyn DeviceProvider>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
