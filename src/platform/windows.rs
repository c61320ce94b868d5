//! Native Windows implementation of the platform seam.
//!
//! Browsers are WebView2 composition controllers, the visual tree is a
//! `Windows.UI.Composition` tree attached to a hidden popup window, and frames come from
//! Windows Graphics Capture. GPU work runs on Direct3D 11, or on Direct3D 12 through
//! D3D11On12 when the host renders with it.
//!
//! WebView2 and composition objects are bound to the thread that created them, so they
//! all live on one [`UiThread`] and are addressed by id from everywhere else.

use crate::platform::Platform;
use anyhow::Result;
use std::sync::Arc;

mod apartment;
pub mod browser;
pub mod capture;
pub mod composition;
pub mod device;
pub mod window;

pub use apartment::UiThread;
pub use browser::WebView2Browser;
pub use capture::GraphicsCapture;
pub use composition::WinCompositor;
pub use device::{D3D11Device, D3D12Device, WindowsDeviceProvider};
pub use window::Win32Windowing;

/// Owns the UI thread and the device provider shared by every service.
pub struct WindowsPlatform {
    ui: Arc<UiThread>,
    compositor: Arc<WinCompositor>,
    devices: Arc<WindowsDeviceProvider>,
}

impl std::fmt::Debug for WindowsPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsPlatform").field("ui", &self.ui).finish_non_exhaustive()
    }
}

impl WindowsPlatform {
    /// Starts the UI thread and creates the compositor on it.
    pub fn new() -> Result<Self> {
        let ui = UiThread::spawn("wvt-ui")?;
        let compositor = Arc::new(WinCompositor::new(ui.clone())?);
        log::info!("WindowsPlatform: UI thread {} ready", ui.thread_id());
        Ok(Self {
            ui,
            compositor,
            devices: Arc::new(WindowsDeviceProvider::new()),
        })
    }

    pub fn ui(&self) -> &Arc<UiThread> {
        &self.ui
    }

    pub fn devices(&self) -> &Arc<WindowsDeviceProvider> {
        &self.devices
    }

    pub fn platform(&self) -> Platform {
        Platform {
            browser: Arc::new(WebView2Browser::new(self.ui.clone())),
            windowing: Arc::new(Win32Windowing::new(self.ui.clone())),
            compositor: self.compositor.clone(),
            capture: Arc::new(GraphicsCapture),
            devices: self.devices.clone(),
        }
    }
}
