use crate::engine::errors::ToolkitError;
use crate::engine::events::DeviceEventType;
use crate::render::backend::{
    check_frame_size, CapturedFrame, CopyOutcome, GraphicsBackend, SharedTexture,
};
use crate::render::bridge::{BridgingDevice, WrapCache};
use crate::render::device::{
    DeviceError, DeviceProvider, GpuDevice, GraphicsApi, TextureDesc, TextureUsage,
};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

/// Devices owned by the bridged backend for one device generation.
struct BridgedDevices {
    /// Host device textures are created on
    host: Arc<dyn GpuDevice>,
    /// Wraps host textures for writes from the composition side
    bridge: BridgingDevice,
    /// Independent composition-API device used only by capture sessions
    capture: Arc<dyn GpuDevice>,
}

/// Backend for hosts that render with an API the composition stack cannot use directly.
///
/// Frames arrive on a separate capture device. They are copied to a CPU staging texture,
/// mapped, and pushed row by row into the host texture through the bridging device,
/// inside an Acquire/Release bracket.
pub struct BridgedBackend {
    provider: Arc<dyn DeviceProvider>,
    devices: Option<BridgedDevices>,
    wrap_cache: WrapCache,
}

impl BridgedBackend {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Result<Self> {
        Ok(Self {
            provider,
            devices: None,
            wrap_cache: WrapCache::new(),
        })
    }

    pub fn host_device(&self) -> Option<&Arc<dyn GpuDevice>> {
        self.devices.as_ref().map(|d| &d.host)
    }

    pub fn wrap_cache(&self) -> &WrapCache {
        &self.wrap_cache
    }

    fn require_devices(&self) -> Result<&BridgedDevices, ToolkitError> {
        self.devices.as_ref().ok_or(ToolkitError::NotInitialized)
    }

    fn copy_through_staging(
        &mut self,
        frame: &CapturedFrame,
        dest: &SharedTexture,
        flip_y: bool,
    ) -> Result<(), DeviceError> {
        let devices = self.devices.as_ref().ok_or(DeviceError::DeviceLost)?;
        let src = frame.surface();
        let height = src.height();

        let wrapped =
            self.wrap_cache.get_or_wrap(&devices.bridge, dest.native_id(), dest.texture())?;

        let staging = devices
            .capture
            .create_texture(TextureDesc::new(src.width(), height, TextureUsage::Staging))?;
        devices.capture.copy_resource(&staging, src)?;
        let mapped = devices.capture.map(&staging)?;

        let written = devices.bridge.acquire(wrapped).and_then(|guard| {
            for y in 0..height {
                let src_row = if flip_y { height - 1 - y } else { y };
                let data = mapped.row(src_row).ok_or(DeviceError::OutOfBounds)?;
                guard.update_row(y, data)?;
            }
            guard.release()
        });

        devices.capture.unmap(&staging);
        devices.bridge.flush();
        written
    }
}

impl GraphicsBackend for BridgedBackend {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &str {
        "bridged"
    }

    fn api(&self) -> GraphicsApi {
        GraphicsApi::Direct3D12
    }

    fn initialize(&mut self) -> Result<(), ToolkitError> {
        let host = self
            .provider
            .host_device(GraphicsApi::Direct3D12)
            .map_err(|e| ToolkitError::DeviceCreationFailed(format!("host device: {e:#}")))?;

        // Capture sessions get their own device on the same adapter.
        let capture = self
            .provider
            .create_device(GraphicsApi::Direct3D11, host.adapter())
            .map_err(|e| ToolkitError::DeviceCreationFailed(format!("capture device: {e:#}")))?;

        log::info!(
            "BridgedBackend: host device {:?}, capture device {:?} on adapter {:#x}",
            host.id(),
            capture.id(),
            host.adapter().0
        );

        self.wrap_cache.clear();
        self.devices = Some(BridgedDevices {
            bridge: BridgingDevice::new(host.clone()),
            host,
            capture,
        });
        Ok(())
    }

    fn shutdown(&mut self) {
        self.wait_for_gpu();
        self.wrap_cache.clear();
        self.devices = None;
    }

    fn is_initialized(&self) -> bool {
        self.devices.is_some()
    }

    fn capture_device(&self) -> Option<Arc<dyn GpuDevice>> {
        self.devices.as_ref().map(|d| d.capture.clone())
    }

    fn create_shared_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError> {
        let devices = self.require_devices()?;
        let texture = devices
            .host
            .create_texture(TextureDesc::new(width, height, TextureUsage::Shared))
            .map_err(|e| ToolkitError::TextureCreationFailed(e.to_string()))?;
        Ok(SharedTexture::new(texture))
    }

    fn destroy_shared_texture(&mut self, texture: SharedTexture) {
        self.wrap_cache.remove(texture.native_id());
    }

    fn resize_shared_texture(
        &mut self,
        texture: &SharedTexture,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError> {
        self.wait_for_gpu();
        let resized = self.create_shared_texture(width, height)?;
        self.destroy_shared_texture(texture.clone());
        Ok(resized)
    }

    fn copy_captured_frame(
        &mut self,
        frame: &CapturedFrame,
        dest: &SharedTexture,
        flip_y: bool,
    ) -> Result<CopyOutcome, ToolkitError> {
        if let Some(skipped) = check_frame_size(frame, dest) {
            return Ok(skipped);
        }
        self.require_devices()?;

        self.copy_through_staging(frame, dest, flip_y).map_err(|e| match e {
            DeviceError::InvalidState { .. } => {
                ToolkitError::ResourceTransitionFailed(e.to_string())
            }
            _ => ToolkitError::Unknown(format!("bridged frame copy failed: {e}")),
        })?;

        Ok(CopyOutcome::Copied)
    }

    fn wait_for_gpu(&self) {
        if let Some(devices) = &self.devices {
            devices.capture.flush();
            devices.host.flush();
        }
    }

    fn on_device_event(&mut self, event: DeviceEventType) {
        match event {
            DeviceEventType::Lost => {
                log::warn!(
                    "BridgedBackend: device lost, dropping {} wrapped resources",
                    self.wrap_cache.len()
                );
                self.wrap_cache.clear();
                self.devices = None;
            }
            DeviceEventType::Restored => {
                if let Err(e) = self.initialize() {
                    log::error!("BridgedBackend: cannot restore devices: {e}");
                }
            }
        }
    }

    fn end_render(&mut self) {
        if let Some(devices) = &self.devices {
            devices.bridge.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::tests::{fill_rows, red_blue_frame, BLUE, RED};
    use crate::render::device::ResourceState;
    use crate::render::software::SoftwareDeviceProvider;

    fn backend() -> (BridgedBackend, Arc<SoftwareDeviceProvider>) {
        let provider = Arc::new(SoftwareDeviceProvider::default());
        let mut backend = BridgedBackend::new(provider.clone()).unwrap();
        backend.initialize().unwrap();
        (backend, provider)
    }

    #[test]
    fn capture_device_is_separate_from_host() {
        let (backend, _) = backend();
        let host = backend.host_device().unwrap();
        let capture = backend.capture_device().unwrap();
        assert_ne!(host.id(), capture.id());
        assert_eq!(host.adapter(), capture.adapter());
        assert_eq!(host.api(), GraphicsApi::Direct3D12);
        assert_eq!(capture.api(), GraphicsApi::Direct3D11);
    }

    #[test]
    fn flip_reverses_rows_across_devices() {
        let (mut backend, _) = backend();
        let capture = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(2, 4).unwrap();
        let frame = red_blue_frame(&capture, 2, 4);

        assert_eq!(backend.copy_captured_frame(&frame, &dest, true).unwrap(), CopyOutcome::Copied);
        assert_eq!(dest.texture().read_row(0).unwrap(), fill_rows(2, BLUE));
        assert_eq!(dest.texture().read_row(3).unwrap(), fill_rows(2, RED));
        assert_eq!(dest.texture().state(), ResourceState::ShaderResource);
        assert_eq!(backend.wrap_cache().len(), 1);
    }

    #[test]
    fn no_flip_keeps_rows() {
        let (mut backend, _) = backend();
        let capture = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(2, 4).unwrap();
        let frame = red_blue_frame(&capture, 2, 4);

        backend.copy_captured_frame(&frame, &dest, false).unwrap();
        assert_eq!(dest.texture().read_row(0).unwrap(), fill_rows(2, RED));
        assert_eq!(dest.texture().read_row(3).unwrap(), fill_rows(2, BLUE));
    }

    #[test]
    fn mismatched_frame_is_not_written() {
        let (mut backend, _) = backend();
        let capture = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(4, 4).unwrap();
        let frame = red_blue_frame(&capture, 2, 4);

        let outcome = backend.copy_captured_frame(&frame, &dest, true).unwrap();
        assert!(matches!(outcome, CopyOutcome::SkippedSizeMismatch { .. }));
        assert!(dest.texture().read_pixels().iter().all(|b| *b == 0));
        assert!(backend.wrap_cache().is_empty());
    }

    #[test]
    fn destroy_and_resize_drop_cache_entries() {
        let (mut backend, _) = backend();
        let capture = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(2, 4).unwrap();
        backend.copy_captured_frame(&red_blue_frame(&capture, 2, 4), &dest, true).unwrap();
        assert_eq!(backend.wrap_cache().len(), 1);

        let resized = backend.resize_shared_texture(&dest, 6, 6).unwrap();
        assert!(backend.wrap_cache().is_empty());
        assert_ne!(resized.native_ptr(), dest.native_ptr());

        backend.copy_captured_frame(&red_blue_frame(&capture, 6, 6), &resized, true).unwrap();
        backend.destroy_shared_texture(resized);
        assert!(backend.wrap_cache().is_empty());
    }

    #[test]
    fn device_loss_drops_everything() {
        let (mut backend, provider) = backend();
        let capture = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(2, 2).unwrap();
        backend.copy_captured_frame(&red_blue_frame(&capture, 2, 2), &dest, true).unwrap();

        provider.lose_devices();
        backend.on_device_event(DeviceEventType::Lost);
        assert!(!backend.is_initialized());
        assert!(backend.wrap_cache().is_empty());
        assert!(backend.capture_device().is_none());

        backend.on_device_event(DeviceEventType::Restored);
        assert!(backend.is_initialized());
        assert!(!backend.capture_device().unwrap().is_lost());
    }
}
