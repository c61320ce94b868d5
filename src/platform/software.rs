//! In-process implementation of the platform seam.
//!
//! The software platform keeps every window, visual and browser session in a shared
//! [`World`] so tests (and hosts without native services) can drive and inspect them:
//!
//! - windows record their size and every message posted to them;
//! - browser controllers keep a history list, paint a solid color per page into their
//!   window and report navigation completion asynchronously;
//! - capture frame pools hand out the newest frame presented to their window.
//!
//! Failure switches ([`FailureSwitches`]) let callers make individual creation steps fail.

use crate::platform::composition::VisualId;
use crate::platform::window::{WindowId, WindowMessage};
use crate::platform::Platform;
use crate::render::backend::SurfaceSize;
use crate::render::software::SoftwareDeviceProvider;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod browser;
pub mod capture;
pub mod composition;
pub mod window;

pub use browser::{ControllerRecord, SoftwareBrowser};
pub use capture::SoftwareCapture;
pub use composition::{SoftwareCompositor, VisualRecord};
pub use window::SoftwareWindowing;

/// Switches that make the matching creation step fail.
#[derive(Debug, Default)]
pub struct FailureSwitches {
    pub window: AtomicBool,
    pub environment: AtomicBool,
    pub controller: AtomicBool,
    pub capture: AtomicBool,
}

impl FailureSwitches {
    pub(crate) fn check(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(anyhow!("{what} creation failed"));
        }
        Ok(())
    }
}

/// Last frame presented to a window.
#[derive(Debug, Clone)]
pub(crate) struct PresentedFrame {
    pub seq: u64,
    pub size: SurfaceSize,
    pub pixels: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct WindowState {
    pub size: SurfaceSize,
    pub messages: Vec<WindowMessage>,
    pub destroyed: bool,
    pub frame: Option<PresentedFrame>,
}

/// Shared state of the software platform.
#[derive(Debug, Default)]
pub struct World {
    next_id: AtomicU64,
    next_frame: AtomicU64,
    pub switches: FailureSwitches,
    windows: Mutex<HashMap<WindowId, WindowState>>,
    visuals: Mutex<HashMap<VisualId, VisualRecord>>,
    targets: Mutex<HashMap<WindowId, VisualId>>,
    controllers: Mutex<HashMap<WindowId, Arc<Mutex<ControllerRecord>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl World {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add_window(&self, size: SurfaceSize) -> WindowId {
        let id = WindowId(self.next_id());
        lock(&self.windows).insert(
            id,
            WindowState {
                size,
                messages: Vec::new(),
                destroyed: false,
                frame: None,
            },
        );
        id
    }

    pub(crate) fn with_window<R>(
        &self,
        id: WindowId,
        f: impl FnOnce(&mut WindowState) -> R,
    ) -> Result<R> {
        let mut windows = lock(&self.windows);
        match windows.get_mut(&id) {
            Some(w) if !w.destroyed => Ok(f(w)),
            _ => Err(anyhow!("window {:?} does not exist", id)),
        }
    }

    pub(crate) fn window_alive(&self, id: WindowId) -> bool {
        self.with_window(id, |_| ()).is_ok()
    }

    /// Present a full frame of pixels to a window.
    pub fn present(&self, window: WindowId, size: SurfaceSize, pixels: Vec<u8>) -> Result<()> {
        if pixels.len() != size.width as usize * size.height as usize * 4 {
            return Err(anyhow!("pixel buffer does not match {}x{}", size.width, size.height));
        }
        let seq = self.next_frame.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_window(window, |w| {
            w.frame = Some(PresentedFrame { seq, size, pixels });
        })
    }

    /// Present a single-color frame at the window's current size.
    pub fn present_solid(&self, window: WindowId, bgra: [u8; 4]) -> Result<()> {
        let size = self.with_window(window, |w| w.size)?;
        let pixels = bgra
            .iter()
            .copied()
            .cycle()
            .take(size.width as usize * size.height as usize * 4)
            .collect();
        self.present(window, size, pixels)
    }

    pub(crate) fn latest_frame(&self, window: WindowId, after: u64) -> Option<PresentedFrame> {
        let windows = lock(&self.windows);
        let w = windows.get(&window)?;
        match &w.frame {
            Some(frame) if frame.seq > after && !w.destroyed => Some(frame.clone()),
            _ => None,
        }
    }

    pub(crate) fn destroy_window(&self, id: WindowId) {
        if let Some(w) = lock(&self.windows).get_mut(&id) {
            w.destroyed = true;
            w.frame = None;
        }
    }

    pub(crate) fn add_visual(&self) -> VisualId {
        let id = VisualId(self.next_id());
        lock(&self.visuals).insert(id, VisualRecord::default());
        id
    }

    pub(crate) fn with_visual<R>(
        &self,
        id: VisualId,
        f: impl FnOnce(&mut VisualRecord) -> R,
    ) -> Option<R> {
        lock(&self.visuals).get_mut(&id).map(f)
    }

    pub(crate) fn remove_visual(&self, id: VisualId) {
        lock(&self.visuals).remove(&id);
    }

    pub(crate) fn set_target_root(&self, window: WindowId, root: Option<VisualId>) {
        let mut targets = lock(&self.targets);
        match root {
            Some(root) => targets.insert(window, root),
            None => targets.remove(&window),
        };
    }

    pub(crate) fn register_controller(
        &self,
        window: WindowId,
        record: Arc<Mutex<ControllerRecord>>,
    ) {
        lock(&self.controllers).insert(window, record);
    }

    pub fn window_size(&self, window: WindowId) -> Option<SurfaceSize> {
        lock(&self.windows).get(&window).map(|w| w.size)
    }

    pub fn window_messages(&self, window: WindowId) -> Vec<WindowMessage> {
        lock(&self.windows).get(&window).map(|w| w.messages.clone()).unwrap_or_default()
    }

    pub fn is_window_destroyed(&self, window: WindowId) -> bool {
        lock(&self.windows).get(&window).map(|w| w.destroyed).unwrap_or(true)
    }

    pub fn visual(&self, id: VisualId) -> Option<VisualRecord> {
        lock(&self.visuals).get(&id).cloned()
    }

    /// Root visual shown in `window`.
    pub fn target_root(&self, window: WindowId) -> Option<VisualId> {
        lock(&self.targets).get(&window).copied()
    }

    /// Snapshot of the controller created for `window`.
    pub fn controller(&self, window: WindowId) -> Option<ControllerRecord> {
        lock(&self.controllers).get(&window).map(|r| lock(r).clone())
    }
}

/// Software implementation of every platform service, sharing one [`World`].
#[derive(Debug, Clone)]
pub struct SoftwarePlatform {
    world: Arc<World>,
    browser: Arc<SoftwareBrowser>,
    windowing: Arc<SoftwareWindowing>,
    compositor: Arc<SoftwareCompositor>,
    capture: Arc<SoftwareCapture>,
    devices: Arc<SoftwareDeviceProvider>,
}

impl Default for SoftwarePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwarePlatform {
    pub fn new() -> Self {
        let world = Arc::new(World::default());
        Self {
            browser: Arc::new(SoftwareBrowser::new(world.clone())),
            windowing: Arc::new(SoftwareWindowing::new(world.clone())),
            compositor: Arc::new(SoftwareCompositor::new(world.clone())),
            capture: Arc::new(SoftwareCapture::new(world.clone())),
            devices: Arc::new(SoftwareDeviceProvider::default()),
            world,
        }
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn devices(&self) -> &Arc<SoftwareDeviceProvider> {
        &self.devices
    }

    pub fn platform(&self) -> Platform {
        Platform {
            browser: self.browser.clone(),
            windowing: self.windowing.clone(),
            compositor: self.compositor.clone(),
            capture: self.capture.clone(),
            devices: self.devices.clone(),
        }
    }
}
