use crate::engine::capture::{CapturePipeline, FrameUpdate};
use crate::engine::config::{BrowserSettings, InstanceParams, ToolkitConfig};
use crate::engine::errors::ToolkitError;
use crate::engine::events::{KeyEvent, LogLevel, MouseEvent};
use crate::engine::handle::InstanceHandle;
use crate::engine::input;
use crate::engine::sink::EventSink;
use crate::platform::browser::{BrowserEnvironment, CompositionController, EnvironmentOptions};
use crate::platform::window::{HiddenWindow, WindowId};
use crate::platform::Platform;
use crate::render::backend::{GraphicsBackend, SharedTexture, SurfaceSize};
use crate::render::Viewport;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

pub type EnvironmentFuture = BoxFuture<'static, anyhow::Result<Arc<dyn BrowserEnvironment>>>;
pub type ControllerFuture = BoxFuture<'static, anyhow::Result<Box<dyn CompositionController>>>;

/// Lifecycle of an instance. Moves forward only, except for a device loss which takes a
/// ready instance to [`InstanceState::Error`] and a restore which brings it back.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum InstanceState {
    /// Instance is allocated but nothing has been created yet.
    #[default]
    Uninitialized = 0,

    /// Hidden window and shared texture exist; the browser environment is being created.
    CreatingEnvironment = 1,

    /// Environment exists; the composition controller is being created.
    CreatingController = 2,

    /// Browser is up, rendering into the capture pipeline and accepting commands.
    Ready = 3,

    /// Browser creation failed, or the graphics device was lost.
    Error = 4,

    /// Instance has been torn down.
    Destroyed = 5,
}

impl InstanceState {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Uninitialized => "Uninitialized",
            InstanceState::CreatingEnvironment => "CreatingEnvironment",
            InstanceState::CreatingController => "CreatingController",
            InstanceState::Ready => "Ready",
            InstanceState::Error => "Error",
            InstanceState::Destroyed => "Destroyed",
        };
        write!(f, "{s}")
    }
}

/// One off-screen browser: hidden window, browser session, capture pipeline and the
/// shared texture the host samples from.
pub struct Instance {
    handle: InstanceHandle,
    width: u32,
    height: u32,
    state: InstanceState,
    /// Lost its GPU state while ready; a restore brings it back.
    suspended: bool,
    pending_url: Option<String>,
    user_data_folder: PathBuf,
    dev_tools: bool,

    window: Option<Box<dyn HiddenWindow>>,
    environment: Option<Arc<dyn BrowserEnvironment>>,
    controller: Option<Box<dyn CompositionController>>,
    capture: Option<CapturePipeline>,
    texture: Option<SharedTexture>,

    platform: Platform,
    sink: Arc<EventSink>,
    config: Arc<ToolkitConfig>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle)
            .field("size", &(self.width, self.height))
            .field("state", &self.state)
            .field("suspended", &self.suspended)
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(
        handle: InstanceHandle,
        params: &InstanceParams,
        platform: Platform,
        sink: Arc<EventSink>,
        config: Arc<ToolkitConfig>,
    ) -> Self {
        Self {
            handle,
            width: params.width,
            height: params.height,
            state: InstanceState::Uninitialized,
            suspended: false,
            pending_url: params.initial_url.clone().filter(|u| !u.is_empty()),
            user_data_folder: params
                .user_data_folder
                .clone()
                .unwrap_or_else(|| config.default_user_data_folder.clone()),
            dev_tools: params.enable_dev_tools,
            window: None,
            environment: None,
            controller: None,
            capture: None,
            texture: None,
            platform,
            sink,
            config,
        }
    }

    pub fn handle(&self) -> InstanceHandle {
        self.handle
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn size(&self) -> SurfaceSize {
        SurfaceSize::new(self.width, self.height)
    }

    pub fn user_data_folder(&self) -> &PathBuf {
        &self.user_data_folder
    }

    pub fn shared_texture(&self) -> Option<&SharedTexture> {
        self.texture.as_ref()
    }

    pub fn window_id(&self) -> Option<WindowId> {
        self.window.as_ref().map(|w| w.id())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().map(|c| c.is_capturing()).unwrap_or(false)
    }

    fn set_state(&mut self, state: InstanceState) {
        if self.state == state {
            return;
        }
        log::debug!("Instance[{}]: {} -> {}", self.handle, self.state, state);
        self.state = state;
        self.sink.state_changed(self.handle, state);
    }

    fn fail(&mut self, message: String) {
        self.report(LogLevel::Error, format!("Instance[{}]: {message}", self.handle));
        self.set_state(InstanceState::Error);
    }

    /// Instances live under the registry lock, so host-visible lines are deferred.
    fn report(&self, level: LogLevel, message: String) {
        self.sink.defer_log(level, message);
    }

    fn require_ready(&self) -> Result<(), ToolkitError> {
        if self.state != InstanceState::Ready {
            return Err(ToolkitError::NotInitialized);
        }
        Ok(())
    }

    fn controller_mut(&mut self) -> Result<&mut Box<dyn CompositionController>, ToolkitError> {
        self.require_ready()?;
        self.controller.as_mut().ok_or(ToolkitError::NotInitialized)
    }

    /// Synchronous part of the setup: hidden window and shared texture.
    ///
    /// On failure everything created so far is released again.
    pub fn initialize(&mut self, backend: &mut dyn GraphicsBackend) -> Result<(), ToolkitError> {
        if self.state != InstanceState::Uninitialized {
            return Err(ToolkitError::AlreadyInitialized);
        }
        if self.width == 0 || self.height == 0 {
            let size = format!("invalid size {}x{}", self.width, self.height);
            return Err(ToolkitError::Unknown(size));
        }

        let mut window = self
            .platform
            .windowing
            .create_hidden_window(self.width, self.height)
            .map_err(|e| ToolkitError::Unknown(format!("hidden window: {e:#}")))?;

        let texture = match backend.create_shared_texture(self.width, self.height) {
            Ok(texture) => texture,
            Err(e) => {
                window.destroy();
                return Err(match e {
                    ToolkitError::TextureCreationFailed(_) => e,
                    other => ToolkitError::TextureCreationFailed(other.to_string()),
                });
            }
        };

        self.window = Some(window);
        self.texture = Some(texture);
        self.set_state(InstanceState::CreatingEnvironment);
        log::info!("Instance[{}]: created {}x{}", self.handle, self.width, self.height);
        Ok(())
    }

    /// Future producing the browser environment for this instance.
    pub fn environment_request(&self) -> EnvironmentFuture {
        self.platform.browser.create_environment(EnvironmentOptions {
            user_data_folder: self.user_data_folder.clone(),
        })
    }

    /// Continuation of [`Instance::environment_request`]. Returns the controller request
    /// to await next, or `None` when the chain ends here.
    pub fn on_environment_created(
        &mut self,
        result: anyhow::Result<Arc<dyn BrowserEnvironment>>,
    ) -> Option<ControllerFuture> {
        if self.state != InstanceState::CreatingEnvironment {
            log::debug!(
                "Instance[{}]: ignoring environment in state {}",
                self.handle,
                self.state
            );
            return None;
        }

        let env = match result {
            Ok(env) => env,
            Err(e) => {
                let err = ToolkitError::BrowserCreationFailed(format!("environment: {e:#}"));
                self.fail(err.to_string());
                return None;
            }
        };
        let Some(window) = self.window_id() else {
            self.fail("environment created without a window".into());
            return None;
        };

        let request = env.create_composition_controller(window);
        self.environment = Some(env);
        self.set_state(InstanceState::CreatingController);
        Some(request)
    }

    /// Final continuation: configure the controller, start capturing and load the first page.
    pub fn on_controller_created(
        &mut self,
        result: anyhow::Result<Box<dyn CompositionController>>,
        backend: &mut dyn GraphicsBackend,
    ) {
        if self.state != InstanceState::CreatingController {
            log::debug!("Instance[{}]: dropping controller in state {}", self.handle, self.state);
            return;
        }

        let mut controller = match result {
            Ok(controller) => controller,
            Err(e) => {
                let err = ToolkitError::BrowserCreationFailed(format!("controller: {e:#}"));
                self.fail(err.to_string());
                return;
            }
        };

        let configured = controller
            .apply_settings(&BrowserSettings::for_offscreen(self.dev_tools))
            .and_then(|_| controller.set_bounds(Viewport::sized(self.width, self.height)))
            .and_then(|_| controller.set_visible(true));
        if let Err(e) = configured {
            controller.close();
            let err = ToolkitError::BrowserCreationFailed(format!("controller setup: {e:#}"));
            self.fail(err.to_string());
            return;
        }

        if self.texture.is_some() {
            self.set_state(InstanceState::Ready);
            self.start_capture(controller.as_mut(), backend);
        } else {
            // Device went away during setup and is not back yet; the restore finishes the job
            self.suspended = true;
            self.set_state(InstanceState::Error);
        }

        let (handle, sink) = (self.handle, self.sink.clone());
        controller.on_navigation_completed(Box::new(move |nav| {
            sink.navigation_completed(handle, &nav.url, nav.success);
        }));
        let (handle, sink) = (self.handle, self.sink.clone());
        controller.on_web_message_received(Box::new(move |message| {
            sink.message(handle, &message);
        }));

        let url = self
            .pending_url
            .take()
            .unwrap_or_else(|| self.config.default_url.clone());
        if let Err(e) = controller.navigate(&url) {
            self.report(
                LogLevel::Warning,
                format!("Instance[{}]: initial navigation to {url} failed: {e:#}", self.handle),
            );
        }

        self.controller = Some(controller);
        if self.suspended {
            self.report(
                LogLevel::Warning,
                format!("Instance[{}]: browser up, waiting for the graphics device", self.handle),
            );
        } else {
            self.report(LogLevel::Info, format!("Instance[{}]: ready", self.handle));
        }
    }

    /// Builds the capture pipeline. A failure leaves the instance ready but blind.
    fn start_capture(
        &mut self,
        controller: &mut dyn CompositionController,
        backend: &mut dyn GraphicsBackend,
    ) {
        let Some(window) = self.window_id() else {
            return;
        };
        let Some(device) = backend.capture_device() else {
            self.report(
                LogLevel::Warning,
                format!("Instance[{}]: no capture device, capture disabled", self.handle),
            );
            return;
        };

        match CapturePipeline::initialize(
            &self.platform,
            window,
            controller,
            device,
            self.size(),
            self.config.frame_pool_buffers,
        ) {
            Ok(pipeline) => self.capture = Some(pipeline),
            Err(e) => self.report(
                LogLevel::Warning,
                format!("Instance[{}]: capture disabled: {e}", self.handle),
            ),
        }
    }

    /// Tears everything down. `abandoned` skips the steps that need a live browser
    /// process or window thread (graceful controller close, window destruction).
    pub fn shutdown(&mut self, backend: Option<&mut dyn GraphicsBackend>, abandoned: bool) {
        if self.state == InstanceState::Destroyed {
            return;
        }

        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        if let Some(texture) = self.texture.take() {
            if let Some(backend) = backend {
                backend.destroy_shared_texture(texture);
            }
        }
        if let Some(mut controller) = self.controller.take() {
            if !abandoned {
                controller.close();
            }
        }
        if let Some(mut window) = self.window.take() {
            if !abandoned {
                window.destroy();
            }
        }
        self.environment = None;
        self.suspended = false;

        self.set_state(InstanceState::Destroyed);
        let suffix = if abandoned { " (abandoned)" } else { "" };
        log::info!("Instance[{}]: destroyed{suffix}", self.handle);
    }

    pub fn navigate(&mut self, url: &str) -> Result<(), ToolkitError> {
        self.controller_mut()?
            .navigate(url)
            .map_err(|e| ToolkitError::NavigationFailed(format!("{url}: {e:#}")))
    }

    pub fn navigate_to_html(&mut self, html: &str) -> Result<(), ToolkitError> {
        self.controller_mut()?
            .navigate_to_string(html)
            .map_err(|e| ToolkitError::NavigationFailed(format!("{e:#}")))
    }

    pub fn execute_script(&mut self, script: &str) -> Result<(), ToolkitError> {
        self.controller_mut()?
            .execute_script(script)
            .map_err(|e| ToolkitError::NavigationFailed(format!("script: {e:#}")))
    }

    pub fn go_back(&mut self) -> Result<(), ToolkitError> {
        self.controller_mut()?
            .go_back()
            .map_err(|e| ToolkitError::NavigationFailed(format!("back: {e:#}")))
    }

    pub fn go_forward(&mut self) -> Result<(), ToolkitError> {
        self.controller_mut()?
            .go_forward()
            .map_err(|e| ToolkitError::NavigationFailed(format!("forward: {e:#}")))
    }

    pub fn can_go_back(&self) -> bool {
        match (&self.state, &self.controller) {
            (InstanceState::Ready, Some(c)) => c.can_go_back(),
            _ => false,
        }
    }

    pub fn can_go_forward(&self) -> bool {
        match (&self.state, &self.controller) {
            (InstanceState::Ready, Some(c)) => c.can_go_forward(),
            _ => false,
        }
    }

    /// Changes the instance size: texture first, then browser bounds, window and capture.
    pub fn resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        width: u32,
        height: u32,
    ) -> Result<(), ToolkitError> {
        if self.state == InstanceState::Destroyed {
            return Err(ToolkitError::NotInitialized);
        }
        if width == 0 || height == 0 {
            return Err(ToolkitError::Unknown(format!("invalid size {width}x{height}")));
        }
        if width == self.width && height == self.height {
            return Ok(());
        }

        if let Some(old) = self.texture.as_ref() {
            let resized = backend.resize_shared_texture(old, width, height)?;
            self.texture = Some(resized);
        }
        self.width = width;
        self.height = height;

        if let Some(controller) = self.controller.as_mut() {
            controller
                .set_bounds(Viewport::sized(width, height))
                .map_err(|e| ToolkitError::CompositionFailed(format!("bounds: {e:#}")))?;
        }
        if let Some(window) = self.window.as_mut() {
            window
                .set_size(width, height)
                .map_err(|e| ToolkitError::Unknown(format!("window resize: {e:#}")))?;
        }
        if let Some(capture) = self.capture.as_mut() {
            if let Err(e) = capture.resize(width, height) {
                self.report(
                    LogLevel::Warning,
                    format!("Instance[{}]: capture lost on resize: {e}", self.handle),
                );
                self.capture = None;
            }
        }

        log::debug!("Instance[{}]: resized to {width}x{height}", self.handle);
        Ok(())
    }

    pub fn send_mouse_event(&mut self, event: &MouseEvent) -> Result<(), ToolkitError> {
        let input =
            input::map_mouse_event(event, self.width, self.height, self.config.wheel_delta);
        self.controller_mut()?
            .send_mouse_input(input)
            .map_err(|e| ToolkitError::Unknown(format!("mouse input: {e:#}")))
    }

    pub fn send_key_event(&mut self, event: &KeyEvent) -> Result<(), ToolkitError> {
        self.require_ready()?;
        let window = self.window.as_ref().ok_or(ToolkitError::NotInitialized)?;
        window
            .post_message(input::map_key_event(event))
            .map_err(|e| ToolkitError::Unknown(format!("key input: {e:#}")))
    }

    /// Copies the newest captured frame into the shared texture.
    pub fn update_texture(&mut self, backend: &mut dyn GraphicsBackend) -> FrameUpdate {
        if self.state != InstanceState::Ready {
            return FrameUpdate::NoFrame;
        }
        match (self.capture.as_mut(), self.texture.as_ref()) {
            (Some(capture), Some(texture)) => capture.update_texture(backend, texture),
            _ => FrameUpdate::NoFrame,
        }
    }

    /// Drops all GPU-backed state. The texture is not destroyed, its device is gone.
    pub fn on_device_lost(&mut self) {
        if matches!(self.state, InstanceState::Destroyed | InstanceState::Uninitialized) {
            return;
        }
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        self.texture = None;

        if self.state == InstanceState::Ready {
            self.suspended = true;
            self.set_state(InstanceState::Error);
        }
        log::info!("Instance[{}]: device lost", self.handle);
    }

    /// Rebuilds GPU-backed state on the restored device.
    pub fn on_device_restored(
        &mut self,
        backend: &mut dyn GraphicsBackend,
    ) -> Result<(), ToolkitError> {
        match self.state {
            InstanceState::Error if self.suspended => {
                let texture = backend.create_shared_texture(self.width, self.height)?;
                self.texture = Some(texture);
                self.suspended = false;
                self.set_state(InstanceState::Ready);

                if let Some(mut controller) = self.controller.take() {
                    self.start_capture(controller.as_mut(), backend);
                    self.controller = Some(controller);
                }
                log::info!("Instance[{}]: restored", self.handle);
            }
            InstanceState::CreatingEnvironment | InstanceState::CreatingController
                if self.texture.is_none() =>
            {
                self.texture = Some(backend.create_shared_texture(self.width, self.height)?);
            }
            _ => {}
        }
        Ok(())
    }
}
