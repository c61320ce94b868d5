//! Routes host graphics-device events and render-thread events onto the registry.

use crate::engine::events::{HostDeviceEvent, LogLevel, RenderEventType};
use crate::engine::handle::InstanceHandle;
use crate::engine::registry::{Registry, UpdateOutcome};

#[derive(Debug, Clone)]
pub struct EventBridge {
    registry: Registry,
}

impl EventBridge {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn on_device_event(&self, event: HostDeviceEvent) {
        match event {
            HostDeviceEvent::Initialize | HostDeviceEvent::AfterReset => {
                self.registry.broadcast_device_restored();
            }
            HostDeviceEvent::BeforeReset => {
                self.registry
                    .sink()
                    .log(LogLevel::Warning, "EventBridge: graphics device reset starting");
                self.registry.broadcast_device_lost();
            }
            HostDeviceEvent::Shutdown => {
                self.registry.release_device_resources();
            }
        }
    }

    /// Render-thread event, optionally aimed at a single instance.
    pub fn on_render_event(
        &self,
        event: RenderEventType,
        handle: Option<InstanceHandle>,
    ) -> UpdateOutcome {
        match event {
            RenderEventType::UpdateTexture => {
                if self.registry.is_shutting_down() || !self.registry.is_initialized() {
                    return UpdateOutcome::Skipped;
                }
                match handle {
                    Some(handle) => self.registry.update_texture(handle),
                    None => self.registry.update_all_textures(),
                }
            }
            RenderEventType::Initialize => {
                self.registry.begin_render();
                UpdateOutcome::Skipped
            }
            RenderEventType::Shutdown => {
                self.registry.end_render();
                UpdateOutcome::Skipped
            }
        }
    }

    /// Raw variant of [`EventBridge::on_device_event`]; unknown ids are ignored.
    pub fn on_device_event_id(&self, event: i32) {
        match HostDeviceEvent::from_i32(event) {
            Some(event) => self.on_device_event(event),
            None => log::debug!("EventBridge: ignoring device event {event}"),
        }
    }

    /// Raw variant of [`EventBridge::on_render_event`]; unknown ids are ignored.
    pub fn on_render_event_id(&self, event: i32, handle: Option<InstanceHandle>) -> UpdateOutcome {
        match RenderEventType::from_i32(event) {
            Some(event) => self.on_render_event(event, handle),
            None => UpdateOutcome::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{InstanceParams, ToolkitConfig};
    use crate::engine::events::{DeviceEventType, ToolkitEvent};
    use crate::engine::instance::InstanceState;
    use crate::platform::software::SoftwarePlatform;
    use crate::render::backends::create_backend;
    use crate::render::device::GraphicsApi;
    use std::time::Duration;
    use tokio::runtime::Handle;

    fn bridge(sw: &SoftwarePlatform, dir: &tempfile::TempDir) -> EventBridge {
        let config = ToolkitConfig::builder()
            .default_user_data_folder(dir.path())
            .build()
            .unwrap();
        let registry = Registry::new(sw.platform(), Handle::current(), config);
        registry
            .initialize(create_backend(GraphicsApi::Direct3D11, sw.devices().clone()).unwrap())
            .unwrap();
        EventBridge::new(registry)
    }

    async fn ready(bridge: &EventBridge) -> InstanceHandle {
        let mut rx = bridge.registry().subscribe_events();
        let handle = bridge.registry().create_instance(InstanceParams::new(8, 8)).unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, ToolkitEvent::NavigationCompleted { .. }) {
                return handle;
            }
        }
    }

    #[tokio::test]
    async fn reset_cycle_maps_to_lost_and_restored() {
        let sw = SoftwarePlatform::new();
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&sw, &dir);
        let handle = ready(&bridge).await;
        let mut rx = bridge.registry().subscribe_events();

        bridge.on_device_event(HostDeviceEvent::BeforeReset);
        assert_eq!(bridge.registry().instance_state(handle), Some(InstanceState::Error));

        bridge.on_device_event_id(HostDeviceEvent::AfterReset as i32);
        assert_eq!(bridge.registry().instance_state(handle), Some(InstanceState::Ready));

        let mut device_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ToolkitEvent::DeviceEvent(e) = event {
                device_events.push(e);
            }
        }
        assert_eq!(device_events, vec![DeviceEventType::Lost, DeviceEventType::Restored]);
    }

    #[tokio::test]
    async fn update_texture_events() {
        let sw = SoftwarePlatform::new();
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&sw, &dir);
        let handle = ready(&bridge).await;

        assert_eq!(
            bridge.on_render_event(RenderEventType::UpdateTexture, Some(handle)),
            UpdateOutcome::Completed { copied: 1 }
        );
        assert_eq!(
            bridge.on_render_event_id(RenderEventType::UpdateTexture as i32, None),
            UpdateOutcome::Completed { copied: 0 }
        );
        assert_eq!(bridge.on_render_event_id(99, None), UpdateOutcome::Skipped);
        assert_eq!(
            bridge.on_render_event(RenderEventType::Initialize, None),
            UpdateOutcome::Skipped
        );

        bridge.registry().signal_shutting_down();
        assert_eq!(
            bridge.on_render_event(RenderEventType::UpdateTexture, None),
            UpdateOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn device_shutdown_only_touches_backend() {
        let sw = SoftwarePlatform::new();
        let dir = tempfile::tempdir().unwrap();
        let bridge = bridge(&sw, &dir);
        let handle = ready(&bridge).await;

        bridge.on_device_event(HostDeviceEvent::Shutdown);
        assert_eq!(bridge.registry().instance_state(handle), Some(InstanceState::Ready));
        bridge.on_device_event_id(42);
    }
}
