//! Browser engine seam.
//!
//! Creating a browser is a two stage asynchronous process: first an environment
//! (bound to a user data folder), then a composition controller bound to a window.
//! The controller renders into a visual instead of a window surface and accepts
//! mouse input directly. Keyboard input is not part of the controller API and goes
//! through the hidden window instead.

use crate::engine::config::BrowserSettings;
use crate::platform::composition::VisualId;
use crate::platform::window::WindowId;
use crate::render::Viewport;
use anyhow::Result;
use bitflags::bitflags;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOptions {
    pub user_data_folder: PathBuf,
}

/// Payload of the navigation-completed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationCompleted {
    pub url: String,
    pub success: bool,
}

pub type NavigationCompletedHandler = Box<dyn Fn(NavigationCompleted) + Send + Sync>;
pub type WebMessageHandler = Box<dyn Fn(String) + Send + Sync>;

/// Mouse event kinds understood by the composition controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MouseEventKind {
    Move,
    LeftButtonDown,
    LeftButtonUp,
    RightButtonDown,
    RightButtonUp,
    MiddleButtonDown,
    MiddleButtonUp,
    Wheel,
    Leave,
}

bitflags! {
    /// Buttons and keys held during a mouse event.
    pub struct VirtualKeys: u32 {
        const LEFT_BUTTON   = 0x0001;
        const RIGHT_BUTTON  = 0x0002;
        const SHIFT         = 0x0004;
        const CONTROL       = 0x0008;
        const MIDDLE_BUTTON = 0x0010;
    }
}

/// Mouse input in pixel coordinates of the controller bounds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MouseInput {
    pub kind: MouseEventKind,
    pub virtual_keys: VirtualKeys,
    /// Wheel distance for [`MouseEventKind::Wheel`], zero otherwise.
    pub mouse_data: i32,
    pub x: i32,
    pub y: i32,
}

pub trait BrowserFactory: Send + Sync {
    fn create_environment(
        &self,
        options: EnvironmentOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn BrowserEnvironment>>>;
}

pub trait BrowserEnvironment: Send + Sync {
    fn create_composition_controller(
        &self,
        window: WindowId,
    ) -> BoxFuture<'static, Result<Box<dyn CompositionController>>>;
}

/// A live browser session rendering into a visual.
///
/// Navigation calls return once the request is accepted; completion is reported through
/// the navigation-completed handler.
pub trait CompositionController: Send {
    fn apply_settings(&mut self, settings: &BrowserSettings) -> Result<()>;

    fn set_bounds(&mut self, bounds: Viewport) -> Result<()>;

    fn set_visible(&mut self, visible: bool) -> Result<()>;

    fn set_root_visual_target(&mut self, visual: Option<VisualId>) -> Result<()>;

    fn navigate(&mut self, url: &str) -> Result<()>;

    fn navigate_to_string(&mut self, html: &str) -> Result<()>;

    fn execute_script(&mut self, script: &str) -> Result<()>;

    fn go_back(&mut self) -> Result<()>;

    fn go_forward(&mut self) -> Result<()>;

    fn can_go_back(&self) -> bool;

    fn can_go_forward(&self) -> bool;

    fn send_mouse_input(&mut self, input: MouseInput) -> Result<()>;

    fn on_navigation_completed(&mut self, handler: NavigationCompletedHandler);

    fn on_web_message_received(&mut self, handler: WebMessageHandler);

    /// Graceful close. May call back into the browser's completion machinery.
    fn close(&mut self);
}
