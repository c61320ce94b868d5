//! Cross-API resource bridging.
//!
//! A [`BridgingDevice`] lets the composition side write into a texture owned by the
//! host device. The texture is first wrapped ([`BridgingDevice::wrap`]) and every write
//! happens inside an Acquire/Release bracket represented by a [`BridgeGuard`]:
//!
//! ```
//! use webview_toolkit::render::bridge::BridgingDevice;
//! use webview_toolkit::render::device::{
//!     AdapterLuid, GpuDevice, GraphicsApi, TextureDesc, TextureUsage,
//! };
//! use webview_toolkit::render::software::SoftwareDevice;
//! use std::sync::Arc;
//!
//! let host = Arc::new(SoftwareDevice::new(GraphicsApi::Direct3D12, AdapterLuid(1)));
//! let texture = host.create_texture(TextureDesc::new(1, 1, TextureUsage::Shared)).unwrap();
//!
//! let bridge = BridgingDevice::new(host);
//! let wrapped = bridge.wrap(&texture).unwrap();
//! {
//!     let guard = bridge.acquire(&wrapped).unwrap();
//!     guard.update_row(0, &[1, 2, 3, 4]).unwrap();
//! } // released here
//! assert_eq!(texture.read_row(0).unwrap(), vec![1, 2, 3, 4]);
//! ```
//!
//! [`WrapCache`] keeps wrappers per host texture and drops them when the texture's
//! dimensions no longer match the ones the wrapper was made for.

use crate::render::backend::SurfaceSize;
use crate::render::device::{DeviceError, GpuDevice, ResourceState, TextureRef};
use std::collections::HashMap;
use std::sync::Arc;

pub struct BridgingDevice {
    host: Arc<dyn GpuDevice>,
}

impl std::fmt::Debug for BridgingDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgingDevice").field("host", &self.host.id()).finish()
    }
}

impl BridgingDevice {
    pub fn new(host: Arc<dyn GpuDevice>) -> Self {
        Self { host }
    }

    pub fn host_device(&self) -> &Arc<dyn GpuDevice> {
        &self.host
    }

    /// Wrap a host-owned texture for use on the composition side.
    pub fn wrap(&self, texture: &TextureRef) -> Result<WrappedResource, DeviceError> {
        if self.host.is_lost() {
            return Err(DeviceError::DeviceLost);
        }
        if texture.device_id() != self.host.id() {
            return Err(DeviceError::CrossDevice);
        }
        Ok(WrappedResource {
            texture: texture.clone(),
            size: texture.size(),
        })
    }

    /// Acquire a wrapped resource. It is released when the guard drops.
    pub fn acquire<'a>(
        &'a self,
        wrapped: &'a WrappedResource,
    ) -> Result<BridgeGuard<'a>, DeviceError> {
        self.host.transition(
            &wrapped.texture,
            ResourceState::ShaderResource,
            ResourceState::BridgeAcquired,
        )?;
        Ok(BridgeGuard {
            device: self,
            wrapped,
            released: false,
        })
    }

    pub fn flush(&self) {
        self.host.flush();
    }
}

/// Host texture usable through a [`BridgingDevice`].
#[derive(Debug, Clone)]
pub struct WrappedResource {
    texture: TextureRef,
    size: SurfaceSize,
}

impl WrappedResource {
    pub fn texture(&self) -> &TextureRef {
        &self.texture
    }

    /// Dimensions the wrapper was created for.
    pub fn size(&self) -> SurfaceSize {
        self.size
    }
}

/// Scope in which a wrapped resource is writable.
pub struct BridgeGuard<'a> {
    device: &'a BridgingDevice,
    wrapped: &'a WrappedResource,
    released: bool,
}

impl BridgeGuard<'_> {
    pub fn update_row(&self, row: u32, data: &[u8]) -> Result<(), DeviceError> {
        let actual = self.wrapped.texture.state();
        if actual != ResourceState::BridgeAcquired {
            return Err(DeviceError::InvalidState {
                expected: ResourceState::BridgeAcquired,
                actual,
            });
        }
        self.device.host.update_subresource(&self.wrapped.texture, row, data)
    }

    /// Release explicitly and report a failed transition.
    pub fn release(mut self) -> Result<(), DeviceError> {
        self.released = true;
        self.device.host.transition(
            &self.wrapped.texture,
            ResourceState::BridgeAcquired,
            ResourceState::ShaderResource,
        )
    }
}

impl Drop for BridgeGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.device.host.transition(
            &self.wrapped.texture,
            ResourceState::BridgeAcquired,
            ResourceState::ShaderResource,
        ) {
            log::warn!("BridgeGuard: release failed: {e}");
        }
    }
}

/// Wrappers keyed by the host texture's native identity.
#[derive(Debug, Default)]
pub struct WrapCache {
    entries: HashMap<usize, WrappedResource>,
}

impl WrapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the wrapper for `key`, creating it when missing or when the cached one was
    /// made for different dimensions.
    pub fn get_or_wrap(
        &mut self,
        bridge: &BridgingDevice,
        key: usize,
        texture: &TextureRef,
    ) -> Result<&WrappedResource, DeviceError> {
        let stale = self
            .entries
            .get(&key)
            .map(|w| w.size != texture.size() || w.texture.id() != texture.id())
            .unwrap_or(false);
        if stale {
            log::debug!("WrapCache: dropping stale wrapper for {key:#x}");
            self.entries.remove(&key);
        }

        if !self.entries.contains_key(&key) {
            let wrapped = bridge.wrap(texture)?;
            self.entries.insert(key, wrapped);
        }

        self.entries.get(&key).ok_or(DeviceError::OutOfBounds)
    }

    pub fn remove(&mut self, key: usize) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::device::{AdapterLuid, GraphicsApi, TextureDesc, TextureUsage};
    use crate::render::software::SoftwareDevice;

    fn host() -> Arc<SoftwareDevice> {
        Arc::new(SoftwareDevice::new(GraphicsApi::Direct3D12, AdapterLuid(1)))
    }

    #[test]
    fn guard_acquires_and_releases() {
        let host = host();
        let tex = host.create_texture(TextureDesc::new(2, 2, TextureUsage::Shared)).unwrap();
        let bridge = BridgingDevice::new(host.clone());
        let wrapped = bridge.wrap(&tex).unwrap();

        {
            let guard = bridge.acquire(&wrapped).unwrap();
            assert_eq!(tex.state(), ResourceState::BridgeAcquired);
            guard.update_row(1, &[7; 8]).unwrap();
        }
        assert_eq!(tex.state(), ResourceState::ShaderResource);
        assert_eq!(tex.read_row(1).unwrap(), vec![7; 8]);
    }

    #[test]
    fn double_acquire_fails() {
        let host = host();
        let tex = host.create_texture(TextureDesc::new(1, 1, TextureUsage::Shared)).unwrap();
        let bridge = BridgingDevice::new(host);
        let wrapped = bridge.wrap(&tex).unwrap();

        let guard = bridge.acquire(&wrapped).unwrap();
        assert!(matches!(bridge.acquire(&wrapped), Err(DeviceError::InvalidState { .. })));
        guard.release().unwrap();
        assert_eq!(tex.state(), ResourceState::ShaderResource);
    }

    #[test]
    fn wrap_rejects_foreign_texture() {
        let other = host();
        let tex = other.create_texture(TextureDesc::new(1, 1, TextureUsage::Shared)).unwrap();
        let bridge = BridgingDevice::new(host());
        assert_eq!(bridge.wrap(&tex).err(), Some(DeviceError::CrossDevice));
    }

    #[test]
    fn cache_reuses_and_invalidates_on_size_change() {
        let host = host();
        let bridge = BridgingDevice::new(host.clone());
        let mut cache = WrapCache::new();

        let small = host.create_texture(TextureDesc::new(4, 4, TextureUsage::Shared)).unwrap();
        let first = cache.get_or_wrap(&bridge, 0x1000, &small).unwrap().texture().id();
        let again = cache.get_or_wrap(&bridge, 0x1000, &small).unwrap().texture().id();
        assert_eq!(first, again);
        assert_eq!(cache.len(), 1);

        // Same native identity, new dimensions
        let large = host.create_texture(TextureDesc::new(8, 6, TextureUsage::Shared)).unwrap();
        let wrapped = cache.get_or_wrap(&bridge, 0x1000, &large).unwrap();
        assert_eq!(wrapped.size(), SurfaceSize::new(8, 6));
        assert_eq!(wrapped.texture().id(), large.id());
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(0x1000));
        assert!(cache.is_empty());
    }
}
