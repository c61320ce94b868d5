use crate::engine::errors::ToolkitError;
use crate::engine::events::DeviceEventType;
use crate::render::backend::{
    check_frame_size, CapturedFrame, CopyOutcome, GraphicsBackend, SharedTexture,
};
use crate::render::device::{DeviceProvider, GpuDevice, GraphicsApi, TextureDesc, TextureUsage};
use anyhow::Result;
use std::any::Any;
use std::sync::Arc;

/// Backend for hosts that render with the same API the composition stack uses.
///
/// Captured frames live on the host device, so copies are plain device copies.
pub struct DirectBackend {
    provider: Arc<dyn DeviceProvider>,
    device: Option<Arc<dyn GpuDevice>>,
}

impl DirectBackend {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Result<Self> {
        Ok(Self { provider, device: None })
    }

    pub fn device(&self) -> Option<&Arc<dyn GpuDevice>> {
        self.device.as_ref()
    }

    fn require_device(&self) -> Result<&Arc<dyn GpuDevice>, ToolkitError> {
        self.device.as_ref().ok_or(ToolkitError::NotInitialized)
    }
}

impl GraphicsBackend for DirectBackend {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &str {
        "direct"
    }

    fn api(&self) -> GraphicsApi {
        GraphicsApi::Direct3D11
    }

    fn initialize(&mut self) -> Result<(), ToolkitError> {
        let device = self
            .provider
            .host_device(GraphicsApi::Direct3D11)
            .map_err(|e| ToolkitError::DeviceCreationFailed(format!("{e:#}")))?;
        log::info!("DirectBackend: using host device {:?}", device.id());
        self.device = Some(device);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.wait_for_gpu();
        self.device = None;
    }

    fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    fn capture_device(&self) -> Option<Arc<dyn GpuDevice>> {
        self.device.clone()
    }

    fn create_shared_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError> {
        let device = self.require_device()?;
        let texture = device
            .create_texture(TextureDesc::new(width, height, TextureUsage::Shared))
            .map_err(|e| ToolkitError::TextureCreationFailed(e.to_string()))?;
        Ok(SharedTexture::new(texture))
    }

    fn destroy_shared_texture(&mut self, texture: SharedTexture) {
        drop(texture);
    }

    fn resize_shared_texture(
        &mut self,
        texture: &SharedTexture,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError> {
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

        let device = self.require_device()?;
        let src = frame.surface();
        let dst = dest.texture();

        let res = if flip_y {
            let height = dst.height();
            (0..height).try_for_each(|y| device.copy_rows(dst, y, src, height - 1 - y, 1))
        } else {
            device.copy_resource(dst, src)
        };
        res.map_err(|e| ToolkitError::Unknown(format!("frame copy failed: {e}")))?;

        Ok(CopyOutcome::Copied)
    }

    fn wait_for_gpu(&self) {
        if let Some(device) = &self.device {
            device.flush();
        }
    }

    fn on_device_event(&mut self, event: DeviceEventType) {
        match event {
            DeviceEventType::Lost => {
                log::warn!("DirectBackend: device lost");
                self.device = None;
            }
            DeviceEventType::Restored => {
                if let Err(e) = self.initialize() {
                    log::error!("DirectBackend: cannot restore device: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::tests::{fill_rows, red_blue_frame, BLUE, RED};
    use crate::render::software::SoftwareDeviceProvider;

    fn backend() -> (DirectBackend, Arc<SoftwareDeviceProvider>) {
        let provider = Arc::new(SoftwareDeviceProvider::default());
        let mut backend = DirectBackend::new(provider.clone()).unwrap();
        backend.initialize().unwrap();
        (backend, provider)
    }

    #[test]
    fn flip_reverses_rows() {
        let (mut backend, _) = backend();
        let device = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(3, 4).unwrap();
        let frame = red_blue_frame(&device, 3, 4);

        assert_eq!(backend.copy_captured_frame(&frame, &dest, true).unwrap(), CopyOutcome::Copied);
        assert_eq!(dest.texture().read_row(0).unwrap(), fill_rows(3, BLUE));
        assert_eq!(dest.texture().read_row(3).unwrap(), fill_rows(3, RED));
    }

    #[test]
    fn no_flip_keeps_rows() {
        let (mut backend, _) = backend();
        let device = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(3, 4).unwrap();
        let frame = red_blue_frame(&device, 3, 4);

        backend.copy_captured_frame(&frame, &dest, false).unwrap();
        assert_eq!(dest.texture().read_row(0).unwrap(), fill_rows(3, RED));
        assert_eq!(dest.texture().read_row(3).unwrap(), fill_rows(3, BLUE));
    }

    #[test]
    fn mismatched_frame_is_not_written() {
        let (mut backend, _) = backend();
        let device = backend.capture_device().unwrap();
        let dest = backend.create_shared_texture(5, 4).unwrap();
        let frame = red_blue_frame(&device, 3, 4);

        let outcome = backend.copy_captured_frame(&frame, &dest, true).unwrap();
        assert!(matches!(outcome, CopyOutcome::SkippedSizeMismatch { .. }));
        assert!(dest.texture().read_pixels().iter().all(|b| *b == 0));
    }

    #[test]
    fn resize_creates_new_texture() {
        let (mut backend, _) = backend();
        let old = backend.create_shared_texture(200, 200).unwrap();
        let new = backend.resize_shared_texture(&old, 500, 400).unwrap();
        assert_ne!(old.native_ptr(), new.native_ptr());
        assert_eq!((new.width(), new.height()), (500, 400));
    }

    #[test]
    fn device_loss_and_restore() {
        let (mut backend, provider) = backend();
        let before = backend.capture_device().unwrap().id();

        provider.lose_devices();
        backend.on_device_event(DeviceEventType::Lost);
        assert!(!backend.is_initialized());
        assert_eq!(backend.create_shared_texture(1, 1).err(), Some(ToolkitError::NotInitialized));

        backend.on_device_event(DeviceEventType::Restored);
        assert!(backend.is_initialized());
        assert_ne!(backend.capture_device().unwrap().id(), before);
        assert!(backend.create_shared_texture(1, 1).is_ok());
    }
}
