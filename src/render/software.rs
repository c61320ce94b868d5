//! CPU-backed implementation of [`GpuDevice`] and [`DeviceProvider`].
//!
//! Used by the test-suite and by hosts without a native device. Device loss can be
//! simulated with [`SoftwareDevice::lose`] / [`SoftwareDeviceProvider::lose_devices`];
//! a lost device fails every call with [`DeviceError::DeviceLost`] and the provider
//! hands out a fresh device on the next request.

use crate::render::device::{
    AdapterLuid, DeviceError, DeviceId, DeviceProvider, GpuDevice, GraphicsApi, MappedTexture,
    ResourceState, Texture, TextureDesc, TextureRef, TextureUsage,
};
use anyhow::anyhow;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct SoftwareDevice {
    id: DeviceId,
    api: GraphicsApi,
    adapter: AdapterLuid,
    lost: AtomicBool,
    flushes: AtomicU64,
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("id", &self.id)
            .field("api", &self.api)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl SoftwareDevice {
    pub fn new(api: GraphicsApi, adapter: AdapterLuid) -> Self {
        Self {
            id: DeviceId::next(),
            api,
            adapter,
            lost: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
        }
    }

    /// Simulate device removal.
    pub fn lose(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    /// Number of completed flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    fn check(&self, textures: &[&Texture]) -> Result<(), DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::DeviceLost);
        }
        if textures.iter().any(|t| t.device_id() != self.id) {
            return Err(DeviceError::CrossDevice);
        }
        Ok(())
    }
}

impl GpuDevice for SoftwareDevice {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn id(&self) -> DeviceId {
        self.id
    }

    fn api(&self) -> GraphicsApi {
        self.api
    }

    fn adapter(&self) -> AdapterLuid {
        self.adapter
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureRef, DeviceError> {
        self.check(&[])?;
        Ok(Arc::new(Texture::new(self.id, desc)?))
    }

    fn copy_resource(&self, dst: &Texture, src: &Texture) -> Result<(), DeviceError> {
        self.check(&[dst, src])?;
        if dst.size() != src.size() {
            return Err(DeviceError::SizeMismatch { src: src.size(), dst: dst.size() });
        }
        dst.write_pixels(&src.read_pixels())
    }

    fn copy_rows(
        &self,
        dst: &Texture,
        dst_row: u32,
        src: &Texture,
        src_row: u32,
        rows: u32,
    ) -> Result<(), DeviceError> {
        self.check(&[dst, src])?;
        if dst.width() != src.width() {
            return Err(DeviceError::SizeMismatch { src: src.size(), dst: dst.size() });
        }
        if src_row + rows > src.height() || dst_row + rows > dst.height() {
            return Err(DeviceError::OutOfBounds);
        }

        for i in 0..rows {
            let row = src.read_row(src_row + i).ok_or(DeviceError::OutOfBounds)?;
            dst.write_row(dst_row + i, &row)?;
        }
        Ok(())
    }

    fn map(&self, texture: &Texture) -> Result<MappedTexture, DeviceError> {
        self.check(&[texture])?;
        if texture.desc().usage != TextureUsage::Staging {
            return Err(DeviceError::NotMappable);
        }
        texture.set_mapped(true)?;
        Ok(MappedTexture {
            data: texture.read_pixels(),
            row_pitch: texture.row_pitch(),
            height: texture.height(),
        })
    }

    fn unmap(&self, texture: &Texture) {
        let _ = texture.set_mapped(false);
    }

    fn update_subresource(&self, dst: &Texture, row: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.check(&[dst])?;
        dst.write_row(row, data)
    }

    fn transition(
        &self,
        texture: &Texture,
        from: ResourceState,
        to: ResourceState,
    ) -> Result<(), DeviceError> {
        self.check(&[texture])?;
        let actual = texture.state();
        if actual != from {
            return Err(DeviceError::InvalidState { expected: from, actual });
        }
        texture.set_state(to);
        Ok(())
    }

    fn flush(&self) {
        if !self.is_lost() {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Hands out [`SoftwareDevice`]s. The host device for an API is shared until it is lost.
#[derive(Debug)]
pub struct SoftwareDeviceProvider {
    adapter: AdapterLuid,
    host_devices: Mutex<HashMap<GraphicsApi, Arc<SoftwareDevice>>>,
    created: Mutex<Vec<Arc<SoftwareDevice>>>,
    fail_creation: AtomicBool,
}

impl Default for SoftwareDeviceProvider {
    fn default() -> Self {
        Self::new(AdapterLuid(0x5157))
    }
}

impl SoftwareDeviceProvider {
    pub fn new(adapter: AdapterLuid) -> Self {
        Self {
            adapter,
            host_devices: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            fail_creation: AtomicBool::new(false),
        }
    }

    /// Current host device for `api`, if one has been handed out.
    pub fn current_host_device(&self, api: GraphicsApi) -> Option<Arc<SoftwareDevice>> {
        self.host_devices.lock().unwrap_or_else(|e| e.into_inner()).get(&api).cloned()
    }

    /// Mark every device handed out so far as lost.
    pub fn lose_devices(&self) {
        for dev in self.host_devices.lock().unwrap_or_else(|e| e.into_inner()).values() {
            dev.lose();
        }
        for dev in self.created.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            dev.lose();
        }
    }

    /// Make further device requests fail.
    pub fn set_fail_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    fn check_creation(&self, api: GraphicsApi) -> anyhow::Result<()> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(anyhow!("device creation disabled for {api}"));
        }
        if api == GraphicsApi::Unknown {
            return Err(anyhow!("cannot create a device for an unknown API"));
        }
        Ok(())
    }
}

impl DeviceProvider for SoftwareDeviceProvider {
    fn host_device(&self, api: GraphicsApi) -> anyhow::Result<Arc<dyn GpuDevice>> {
        self.check_creation(api)?;

        let mut devices = self.host_devices.lock().unwrap_or_else(|e| e.into_inner());
        let device = match devices.get(&api) {
            Some(dev) if !dev.is_lost() => dev.clone(),
            _ => {
                let dev = Arc::new(SoftwareDevice::new(api, self.adapter));
                log::debug!("SoftwareDeviceProvider: created {api} host device {:?}", dev.id());
                devices.insert(api, dev.clone());
                dev
            }
        };
        Ok(device)
    }

    fn create_device(
        &self,
        api: GraphicsApi,
        adapter: AdapterLuid,
    ) -> anyhow::Result<Arc<dyn GpuDevice>> {
        self.check_creation(api)?;
        if adapter != self.adapter {
            return Err(anyhow!("no adapter with LUID {:#x}", adapter.0));
        }

        let dev = Arc::new(SoftwareDevice::new(api, adapter));
        self.created.lock().unwrap_or_else(|e| e.into_inner()).push(dev.clone());
        Ok(dev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> SoftwareDevice {
        SoftwareDevice::new(GraphicsApi::Direct3D11, AdapterLuid(1))
    }

    #[test]
    fn cross_device_copy_is_rejected() {
        let a = device();
        let b = device();
        let ta = a.create_texture(TextureDesc::new(4, 4, TextureUsage::Shared)).unwrap();
        let tb = b.create_texture(TextureDesc::new(4, 4, TextureUsage::Shared)).unwrap();
        assert_eq!(a.copy_resource(&ta, &tb), Err(DeviceError::CrossDevice));
    }

    #[test]
    fn copy_rows_moves_pixels() {
        let dev = device();
        let src = dev.create_texture(TextureDesc::new(1, 2, TextureUsage::Capture)).unwrap();
        let dst = dev.create_texture(TextureDesc::new(1, 2, TextureUsage::Shared)).unwrap();
        src.write_row(0, &[9, 9, 9, 9]).unwrap();

        dev.copy_rows(&dst, 1, &src, 0, 1).unwrap();
        assert_eq!(dst.read_row(1).unwrap(), vec![9, 9, 9, 9]);
        assert_eq!(dst.read_row(0).unwrap(), vec![0, 0, 0, 0]);
        assert_eq!(dev.copy_rows(&dst, 1, &src, 1, 2), Err(DeviceError::OutOfBounds));
    }

    #[test]
    fn only_staging_textures_map() {
        let dev = device();
        let shared = dev.create_texture(TextureDesc::new(2, 2, TextureUsage::Shared)).unwrap();
        assert_eq!(dev.map(&shared).err(), Some(DeviceError::NotMappable));

        let staging = dev.create_texture(TextureDesc::new(2, 2, TextureUsage::Staging)).unwrap();
        let mapped = dev.map(&staging).unwrap();
        assert_eq!(mapped.row_pitch, 8);
        assert!(staging.is_mapped());
        dev.unmap(&staging);
        assert!(!staging.is_mapped());
    }

    #[test]
    fn lost_device_fails_everything() {
        let dev = device();
        let tex = dev.create_texture(TextureDesc::new(2, 2, TextureUsage::Shared)).unwrap();
        dev.lose();
        assert!(dev.is_lost());
        let desc = TextureDesc::new(2, 2, TextureUsage::Shared);
        assert_eq!(dev.create_texture(desc).err(), Some(DeviceError::DeviceLost));
        assert_eq!(dev.update_subresource(&tex, 0, &[0; 8]), Err(DeviceError::DeviceLost));
    }

    #[test]
    fn transition_checks_current_state() {
        let dev = device();
        let tex = dev.create_texture(TextureDesc::new(1, 1, TextureUsage::Shared)).unwrap();
        dev.transition(&tex, ResourceState::ShaderResource, ResourceState::BridgeAcquired).unwrap();
        assert_eq!(
            dev.transition(&tex, ResourceState::ShaderResource, ResourceState::BridgeAcquired),
            Err(DeviceError::InvalidState {
                expected: ResourceState::ShaderResource,
                actual: ResourceState::BridgeAcquired
            })
        );
    }

    #[test]
    fn provider_replaces_lost_host_device() {
        let provider = SoftwareDeviceProvider::default();
        let first = provider.host_device(GraphicsApi::Direct3D11).unwrap();
        let again = provider.host_device(GraphicsApi::Direct3D11).unwrap();
        assert_eq!(first.id(), again.id());

        provider.lose_devices();
        assert!(first.is_lost());
        let fresh = provider.host_device(GraphicsApi::Direct3D11).unwrap();
        assert_ne!(first.id(), fresh.id());
        assert!(!fresh.is_lost());
    }

    #[test]
    fn provider_matches_adapter() {
        let provider = SoftwareDeviceProvider::new(AdapterLuid(7));
        assert!(provider.create_device(GraphicsApi::Direct3D11, AdapterLuid(7)).is_ok());
        assert!(provider.create_device(GraphicsApi::Direct3D11, AdapterLuid(8)).is_err());
        assert!(provider.host_device(GraphicsApi::Unknown).is_err());

        provider.set_fail_creation(true);
        assert!(provider.host_device(GraphicsApi::Direct3D12).is_err());
    }
}
