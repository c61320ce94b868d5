//! Instance registry.
//!
//! The registry owns the graphics backend and every live [`Instance`], keyed by handle.
//! A single coarse mutex guards both; per-frame texture updates only ever `try_lock` it
//! so a busy registry never stalls the host's render thread.
//!
//! Browser creation is asynchronous. [`Registry::create_instance`] performs the
//! synchronous part and spawns the rest on the registry's tokio runtime. The spawned
//! task only holds a [`Weak`] reference to the registry and a child of its shutdown
//! token, so a completion arriving after shutdown finds nothing to act on.
//!
//! Host callbacks never run with the registry locked. Lines logged while locked are
//! deferred on the [`EventSink`] and flushed once the guard is gone.

use crate::engine::capture::FrameUpdate;
use crate::engine::config::{InstanceParams, ToolkitConfig};
use crate::engine::errors::ToolkitError;
use crate::engine::events::{DeviceEventType, KeyEvent, LogLevel, MouseEvent, ToolkitEvent};
use crate::engine::handle::{HandleAllocator, InstanceHandle};
use crate::engine::instance::{EnvironmentFuture, Instance, InstanceState};
use crate::engine::sink::EventSink;
use crate::platform::Platform;
use crate::render::backend::{GraphicsBackend, SharedTexture};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Result of a texture update request from the render thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Registry was busy, shutting down or has no backend; nothing was done.
    Skipped,
    /// Every requested instance was polled; `copied` frames made it into textures.
    Completed { copied: usize },
}

#[derive(Default)]
struct RegistryState {
    backend: Option<Box<dyn GraphicsBackend>>,
    instances: BTreeMap<InstanceHandle, Instance>,
}

impl RegistryState {
    fn backend_mut(&mut self) -> Option<&mut dyn GraphicsBackend> {
        match self.backend.as_mut() {
            Some(backend) => Some(backend.as_mut()),
            None => None,
        }
    }
}

struct RegistryShared {
    state: Mutex<RegistryState>,
    shutting_down: AtomicBool,
    shutdown_token: Mutex<CancellationToken>,
    handles: HandleAllocator,
    runtime: Handle,
    platform: Platform,
    sink: Arc<EventSink>,
    config: Arc<ToolkitConfig>,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> CancellationToken {
        self.shutdown_token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Delivers lines deferred while the lock was held. Call after the guard is dropped.
    fn flush_logs(&self) {
        self.sink.flush_deferred();
    }
}

/// Owner of all instances and of the graphics backend.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("shutting_down", &self.shared.is_shutting_down())
            .field("instances", &self.handles())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry. Async browser setup runs on `runtime`.
    pub fn new(platform: Platform, runtime: Handle, config: ToolkitConfig) -> Self {
        let sink = Arc::new(EventSink::new(config.event_channel_capacity));
        Self {
            shared: Arc::new(RegistryShared {
                state: Mutex::new(RegistryState::default()),
                shutting_down: AtomicBool::new(false),
                shutdown_token: Mutex::new(CancellationToken::new()),
                handles: HandleAllocator::new(),
                runtime,
                platform,
                sink,
                config: Arc::new(config),
            }),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.shared.platform
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.shared.sink
    }

    pub fn config(&self) -> &ToolkitConfig {
        &self.shared.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ToolkitEvent> {
        self.shared.sink.subscribe()
    }

    /// Installs and initializes the graphics backend.
    pub fn initialize(&self, backend: Box<dyn GraphicsBackend>) -> Result<(), ToolkitError> {
        let result = self.install_backend(backend);
        self.shared.flush_logs();
        result
    }

    fn install_backend(&self, mut backend: Box<dyn GraphicsBackend>) -> Result<(), ToolkitError> {
        let mut state = self.shared.lock();
        if state.backend.is_some() {
            return Err(ToolkitError::AlreadyInitialized);
        }

        let sink = &self.shared.sink;
        if let Err(e) = backend.initialize() {
            let name = backend.name();
            sink.defer_log(
                LogLevel::Error,
                format!("Registry: {name} backend failed to initialize: {e}"),
            );
            return Err(ToolkitError::NotInitialized);
        }

        *self
            .shared
            .shutdown_token
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
        self.shared.shutting_down.store(false, Ordering::SeqCst);
        sink.defer_log(
            LogLevel::Info,
            format!("Registry: initialized with {} backend", backend.name()),
        );
        state.backend = Some(backend);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        if self.shared.is_shutting_down() {
            return false;
        }
        self.shared.lock().backend.is_some()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// First phase of shutdown: every entry point starts refusing work and pending
    /// browser setups are cancelled.
    pub fn signal_shutting_down(&self) {
        if !self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            log::info!("Registry: shutting down");
        }
        self.shared.token().cancel();
    }

    /// Tears down every instance (abandoned) and the backend. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.signal_shutting_down();

        let destroyed: Vec<InstanceHandle> = {
            let mut state = self.shared.lock();
            let instances = std::mem::take(&mut state.instances);
            let mut handles = Vec::with_capacity(instances.len());
            for (handle, mut instance) in instances {
                instance.shutdown(state.backend_mut(), true);
                handles.push(handle);
            }
            if let Some(mut backend) = state.backend.take() {
                backend.shutdown();
                log::info!("Registry: {} backend shut down", backend.name());
            }
            handles
        };

        for handle in destroyed {
            self.shared.sink.emit(ToolkitEvent::InstanceDestroyed { handle });
        }
    }

    /// Creates an instance and starts its browser setup.
    ///
    /// The returned handle is valid immediately; the instance reaches
    /// [`InstanceState::Ready`] once the asynchronous setup completes.
    pub fn create_instance(&self, params: InstanceParams) -> Result<InstanceHandle, ToolkitError> {
        if self.shared.is_shutting_down() {
            return Err(ToolkitError::NotInitialized);
        }

        let created = self.insert_instance(&params);
        self.shared.flush_logs();
        let (handle, request) = created?;

        self.shared.sink.emit(ToolkitEvent::InstanceCreated { handle });
        self.spawn_setup(handle, request);
        log::info!("Registry: created instance {handle} ({}x{})", params.width, params.height);
        Ok(handle)
    }

    fn insert_instance(
        &self,
        params: &InstanceParams,
    ) -> Result<(InstanceHandle, EnvironmentFuture), ToolkitError> {
        let mut state = self.shared.lock();
        let backend = state.backend.as_mut().ok_or(ToolkitError::NotInitialized)?;

        let handle = self.shared.handles.allocate();
        let mut instance = Instance::new(
            handle,
            params,
            self.shared.platform.clone(),
            self.shared.sink.clone(),
            self.shared.config.clone(),
        );
        if let Err(e) = instance.initialize(backend.as_mut()) {
            self.shared
                .sink
                .defer_log(LogLevel::Error, format!("Registry: failed to create instance: {e}"));
            return Err(e);
        }

        let request = instance.environment_request();
        state.instances.insert(handle, instance);
        Ok((handle, request))
    }

    fn spawn_setup(&self, handle: InstanceHandle, request: EnvironmentFuture) {
        let weak: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        let token = self.shared.token().child_token();

        self.shared.runtime.spawn(async move {
            let env = tokio::select! {
                _ = token.cancelled() => return,
                env = request => env,
            };

            let controller_request = {
                let Some(shared) = weak.upgrade() else { return };
                if token.is_cancelled() {
                    return;
                }
                let mut state = shared.lock();
                let request = state
                    .instances
                    .get_mut(&handle)
                    .and_then(|instance| instance.on_environment_created(env));
                drop(state);
                shared.flush_logs();
                request
            };
            let Some(controller_request) = controller_request else { return };

            let controller = tokio::select! {
                _ = token.cancelled() => return,
                controller = controller_request => controller,
            };

            let Some(shared) = weak.upgrade() else { return };
            if token.is_cancelled() {
                return;
            }
            {
                let mut state = shared.lock();
                let RegistryState { backend, instances } = &mut *state;
                match (instances.get_mut(&handle), backend.as_mut()) {
                    (Some(instance), Some(backend)) => {
                        instance.on_controller_created(controller, backend.as_mut())
                    }
                    _ => {
                        log::debug!("Registry: instance {handle} is gone, dropping its controller")
                    }
                }
            }
            shared.flush_logs();
        });
    }

    /// Destroys an instance gracefully.
    pub fn destroy_instance(&self, handle: InstanceHandle) -> Result<(), ToolkitError> {
        if self.shared.is_shutting_down() {
            return Err(ToolkitError::NotInitialized);
        }

        {
            let mut state = self.shared.lock();
            let mut instance = state
                .instances
                .remove(&handle)
                .ok_or(ToolkitError::InvalidHandle(handle))?;
            instance.shutdown(state.backend_mut(), false);
        }

        self.shared.sink.emit(ToolkitEvent::InstanceDestroyed { handle });
        log::info!("Registry: destroyed instance {handle}");
        Ok(())
    }

    /// Runs `f` against the instance, if it exists.
    pub fn with_instance<R>(
        &self,
        handle: InstanceHandle,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> Option<R> {
        if self.shared.is_shutting_down() {
            return None;
        }
        let result = self.shared.lock().instances.get_mut(&handle).map(f);
        self.shared.flush_logs();
        result
    }

    /// Runs `f` against the instance and the backend.
    fn with_backend<R>(
        &self,
        handle: InstanceHandle,
        f: impl FnOnce(&mut Instance, &mut dyn GraphicsBackend) -> Result<R, ToolkitError>,
    ) -> Result<R, ToolkitError> {
        if self.shared.is_shutting_down() {
            return Err(ToolkitError::NotInitialized);
        }
        let result = {
            let mut state = self.shared.lock();
            let RegistryState { backend, instances } = &mut *state;
            let backend = backend.as_mut().ok_or(ToolkitError::NotInitialized)?;
            let instance = instances
                .get_mut(&handle)
                .ok_or(ToolkitError::InvalidHandle(handle))?;
            f(instance, backend.as_mut())
        };
        self.shared.flush_logs();
        result
    }

    fn with_existing<R>(
        &self,
        handle: InstanceHandle,
        f: impl FnOnce(&mut Instance) -> Result<R, ToolkitError>,
    ) -> Result<R, ToolkitError> {
        self.with_instance(handle, f)
            .unwrap_or_else(|| Err(self.missing(handle)))
    }

    fn missing(&self, handle: InstanceHandle) -> ToolkitError {
        if self.shared.is_shutting_down() {
            ToolkitError::NotInitialized
        } else {
            ToolkitError::InvalidHandle(handle)
        }
    }

    pub fn instance_state(&self, handle: InstanceHandle) -> Option<InstanceState> {
        self.with_instance(handle, |i| i.state())
    }

    pub fn instance_count(&self) -> usize {
        if self.shared.is_shutting_down() {
            return 0;
        }
        self.shared.lock().instances.len()
    }

    pub fn handles(&self) -> Vec<InstanceHandle> {
        self.shared.lock().instances.keys().copied().collect()
    }

    pub fn shared_texture(&self, handle: InstanceHandle) -> Option<SharedTexture> {
        self.with_instance(handle, |i| i.shared_texture().cloned()).flatten()
    }

    /// Native pointer of the instance's shared texture; null when there is none.
    pub fn shared_texture_ptr(&self, handle: InstanceHandle) -> *mut c_void {
        self.shared_texture(handle)
            .map(|t| t.native_ptr())
            .unwrap_or(std::ptr::null_mut())
    }

    pub fn resize(
        &self,
        handle: InstanceHandle,
        width: u32,
        height: u32,
    ) -> Result<(), ToolkitError> {
        self.with_backend(handle, |instance, backend| instance.resize(backend, width, height))
    }

    pub fn navigate(&self, handle: InstanceHandle, url: &str) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.navigate(url))
    }

    pub fn navigate_to_html(&self, handle: InstanceHandle, html: &str) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.navigate_to_html(html))
    }

    pub fn execute_script(&self, handle: InstanceHandle, script: &str) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.execute_script(script))
    }

    pub fn go_back(&self, handle: InstanceHandle) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.go_back())
    }

    pub fn go_forward(&self, handle: InstanceHandle) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.go_forward())
    }

    pub fn can_go_back(&self, handle: InstanceHandle) -> bool {
        self.with_instance(handle, |i| i.can_go_back()).unwrap_or(false)
    }

    pub fn can_go_forward(&self, handle: InstanceHandle) -> bool {
        self.with_instance(handle, |i| i.can_go_forward()).unwrap_or(false)
    }

    pub fn send_mouse_event(
        &self,
        handle: InstanceHandle,
        event: &MouseEvent,
    ) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.send_mouse_event(event))
    }

    pub fn send_key_event(
        &self,
        handle: InstanceHandle,
        event: &KeyEvent,
    ) -> Result<(), ToolkitError> {
        self.with_existing(handle, |i| i.send_key_event(event))
    }

    /// Tries to take the registry lock for a render-thread update.
    fn try_lock_for_update(&self) -> Option<MutexGuard<'_, RegistryState>> {
        if self.shared.is_shutting_down() {
            return None;
        }
        match self.shared.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Copies the newest frame of every instance into its texture.
    pub fn update_all_textures(&self) -> UpdateOutcome {
        let Some(mut state) = self.try_lock_for_update() else {
            return UpdateOutcome::Skipped;
        };
        let RegistryState { backend, instances } = &mut *state;
        let Some(backend) = backend.as_mut() else {
            return UpdateOutcome::Skipped;
        };

        let mut copied = 0;
        for instance in instances.values_mut() {
            if instance.update_texture(backend.as_mut()) == FrameUpdate::Copied {
                copied += 1;
            }
        }
        UpdateOutcome::Completed { copied }
    }

    pub fn update_texture(&self, handle: InstanceHandle) -> UpdateOutcome {
        let Some(mut state) = self.try_lock_for_update() else {
            return UpdateOutcome::Skipped;
        };
        let RegistryState { backend, instances } = &mut *state;
        let (Some(backend), Some(instance)) = (backend.as_mut(), instances.get_mut(&handle)) else {
            return UpdateOutcome::Skipped;
        };

        let copied =
            usize::from(instance.update_texture(backend.as_mut()) == FrameUpdate::Copied);
        UpdateOutcome::Completed { copied }
    }

    /// Runs `f` on the backend when one is installed and the registry is not shutting down.
    fn with_backend_only(&self, f: impl FnOnce(&mut dyn GraphicsBackend)) {
        if self.shared.is_shutting_down() {
            return;
        }
        if let Some(backend) = self.shared.lock().backend_mut() {
            f(backend);
        }
    }

    pub fn begin_render(&self) {
        self.with_backend_only(|b| b.begin_render());
    }

    pub fn end_render(&self) {
        self.with_backend_only(|b| b.end_render());
    }

    /// Host is tearing its graphics device down: release backend GPU resources only.
    pub fn release_device_resources(&self) {
        self.with_backend_only(|b| b.on_device_event(DeviceEventType::Lost));
        self.shared.sink.log(LogLevel::Info, "Registry: graphics device shutdown");
    }

    /// Graphics device went away: drop every GPU-backed resource.
    pub fn broadcast_device_lost(&self) {
        if self.shared.is_shutting_down() {
            return;
        }
        {
            let mut state = self.shared.lock();
            if let Some(backend) = state.backend_mut() {
                backend.on_device_event(DeviceEventType::Lost);
            }
            for instance in state.instances.values_mut() {
                instance.on_device_lost();
            }
        }
        self.shared.sink.log(LogLevel::Warning, "Registry: graphics device lost");
        self.shared.sink.device_event(DeviceEventType::Lost);
    }

    /// Graphics device is back: rebuild backend devices, then every instance.
    pub fn broadcast_device_restored(&self) {
        if self.shared.is_shutting_down() {
            return;
        }
        {
            let mut state = self.shared.lock();
            let RegistryState { backend, instances } = &mut *state;
            let Some(backend) = backend.as_mut() else { return };

            backend.on_device_event(DeviceEventType::Restored);
            for instance in instances.values_mut() {
                if let Err(e) = instance.on_device_restored(backend.as_mut()) {
                    self.shared.sink.defer_log(
                        LogLevel::Error,
                        format!("Registry: instance {} not restored: {e}", instance.handle()),
                    );
                }
            }
        }
        self.shared.flush_logs();
        self.shared.sink.log(LogLevel::Info, "Registry: graphics device restored");
        self.shared.sink.device_event(DeviceEventType::Restored);
    }
}
