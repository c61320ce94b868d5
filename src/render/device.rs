//! GPU device seam.
//!
//! A [`GpuDevice`] owns [`Texture`]s and performs the handful of operations the
//! backends need: resource copies, row copies, staging maps and sub-resource updates.
//! A texture may only be touched by the device that created it; any attempt to use it
//! on another device fails with [`DeviceError::CrossDevice`]. That rule is what forces
//! the bridged backend through a CPU staging round trip.
//!
//! Texture storage is CPU memory laid out as tightly packed rows (`row_pitch =
//! width * bytes_per_pixel`). The host reads the pixels through
//! [`Texture::read_pixels`] or through the native pointer of a shared texture.

use crate::render::backend::SurfaceSize;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::ffi::c_void;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Graphics API used by the host (and ids as reported by the host).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum GraphicsApi {
    Unknown = 0,
    Direct3D11 = 2,
    Direct3D12 = 18,
}

impl GraphicsApi {
    pub fn from_i32(value: i32) -> Self {
        match value {
            2 => GraphicsApi::Direct3D11,
            18 => GraphicsApi::Direct3D12,
            _ => GraphicsApi::Unknown,
        }
    }
}

impl Display for GraphicsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphicsApi::Unknown => write!(f, "Unknown"),
            GraphicsApi::Direct3D11 => write!(f, "Direct3D11"),
            GraphicsApi::Direct3D12 => write!(f, "Direct3D12"),
        }
    }
}

/// Identity of a device instance. A restored device gets a new id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn next() -> Self {
        Self(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Locally unique id of the physical adapter a device runs on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterLuid(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8 bits per channel, blue first.
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Bgra8 => 4,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextureUsage {
    /// Shader-readable texture handed to the host
    Shared,
    /// CPU readable copy target
    Staging,
    /// Surface delivered by the capture service
    Capture,
}

/// Usage state of a texture. Cross-API access requires explicit transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceState {
    ShaderResource,
    /// Acquired by a bridging device and writable through it
    BridgeAcquired,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Bgra8,
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device has been lost")]
    DeviceLost,

    #[error("texture belongs to another device")]
    CrossDevice,

    #[error("invalid texture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("texture sizes differ: {src:?} vs {dst:?}")]
    SizeMismatch { src: SurfaceSize, dst: SurfaceSize },

    #[error("row range out of bounds")]
    OutOfBounds,

    #[error("texture is not mappable")]
    NotMappable,

    #[error("texture is already mapped")]
    AlreadyMapped,

    #[error("texture in state {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("device creation failed: {0}")]
    CreationFailed(String),

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    #[error("driver call failed: {0}")]
    Driver(String),
}

/// Driver object behind a texture created by a native device.
pub trait NativeResource: Send + Sync {
    /// Raw interface pointer handed to the host.
    fn as_raw(&self) -> *mut c_void;

    fn as_any(&self) -> &dyn Any;
}

/// GPU resource owned by exactly one device.
pub struct Texture {
    id: TextureId,
    device: DeviceId,
    desc: TextureDesc,
    pixels: RwLock<Vec<u8>>,
    state: Mutex<ResourceState>,
    mapped: Mutex<bool>,
    native: Option<Box<dyn NativeResource>>,
}

pub type TextureRef = Arc<Texture>;

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("width", &self.desc.width)
            .field("height", &self.desc.height)
            .field("usage", &self.desc.usage)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl Texture {
    pub(crate) fn new(device: DeviceId, desc: TextureDesc) -> Result<Self, DeviceError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::InvalidSize { width: desc.width, height: desc.height });
        }

        let len =
            desc.width as usize * desc.height as usize * desc.format.bytes_per_pixel() as usize;
        Ok(Self {
            id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
            device,
            desc,
            pixels: RwLock::new(vec![0; len]),
            state: Mutex::new(ResourceState::ShaderResource),
            mapped: Mutex::new(false),
            native: None,
        })
    }

    /// Texture whose storage lives in a driver object. It has no CPU pixels.
    pub fn with_native(
        device: DeviceId,
        desc: TextureDesc,
        native: Box<dyn NativeResource>,
    ) -> Result<Self, DeviceError> {
        let mut texture = Self::new(device, desc)?;
        texture.pixels = RwLock::new(Vec::new());
        texture.native = Some(native);
        Ok(texture)
    }

    pub fn native(&self) -> Option<&dyn NativeResource> {
        self.native.as_deref()
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn size(&self) -> SurfaceSize {
        SurfaceSize { width: self.desc.width, height: self.desc.height }
    }

    pub fn row_pitch(&self) -> usize {
        self.desc.width as usize * self.desc.format.bytes_per_pixel() as usize
    }

    pub fn state(&self) -> ResourceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the full pixel contents.
    pub fn read_pixels(&self) -> Vec<u8> {
        self.pixels.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Copy of a single row.
    pub fn read_row(&self, y: u32) -> Option<Vec<u8>> {
        if y >= self.desc.height {
            return None;
        }
        let pitch = self.row_pitch();
        let start = y as usize * pitch;
        let pixels = self.pixels.read().unwrap_or_else(|e| e.into_inner());
        Some(pixels[start..start + pitch].to_vec())
    }

    pub(crate) fn write_pixels(&self, data: &[u8]) -> Result<(), DeviceError> {
        let mut pixels = self.pixels.write().unwrap_or_else(|e| e.into_inner());
        if data.len() != pixels.len() {
            return Err(DeviceError::OutOfBounds);
        }
        pixels.copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn write_row(&self, y: u32, data: &[u8]) -> Result<(), DeviceError> {
        let pitch = self.row_pitch();
        if y >= self.desc.height || data.len() != pitch {
            return Err(DeviceError::OutOfBounds);
        }
        let start = y as usize * pitch;
        let mut pixels = self.pixels.write().unwrap_or_else(|e| e.into_inner());
        pixels[start..start + pitch].copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub(crate) fn set_mapped(&self, mapped: bool) -> Result<(), DeviceError> {
        let mut flag = self.mapped.lock().unwrap_or_else(|e| e.into_inner());
        if mapped && *flag {
            return Err(DeviceError::AlreadyMapped);
        }
        *flag = mapped;
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        *self.mapped.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// CPU view of a mapped staging texture.
#[derive(Debug, Clone)]
pub struct MappedTexture {
    pub data: Vec<u8>,
    pub row_pitch: usize,
    pub height: u32,
}

impl MappedTexture {
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.row_pitch;
        self.data.get(start..start + self.row_pitch)
    }
}

/// A graphics device. Calls occur under the registry lock.
pub trait GpuDevice: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn id(&self) -> DeviceId;

    fn api(&self) -> GraphicsApi;

    fn adapter(&self) -> AdapterLuid;

    fn is_lost(&self) -> bool;

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureRef, DeviceError>;

    /// Copy all of `src` into `dst`. Both must have the same size.
    fn copy_resource(&self, dst: &Texture, src: &Texture) -> Result<(), DeviceError>;

    /// Copy `rows` rows starting at `src_row` in `src` to `dst_row` in `dst`.
    fn copy_rows(
        &self,
        dst: &Texture,
        dst_row: u32,
        src: &Texture,
        src_row: u32,
        rows: u32,
    ) -> Result<(), DeviceError>;

    /// Map a staging texture for CPU reads.
    fn map(&self, texture: &Texture) -> Result<MappedTexture, DeviceError>;

    fn unmap(&self, texture: &Texture);

    /// Write one row of `dst` from CPU memory.
    fn update_subresource(&self, dst: &Texture, row: u32, data: &[u8]) -> Result<(), DeviceError>;

    /// Move `texture` from `from` to `to`.
    fn transition(
        &self,
        texture: &Texture,
        from: ResourceState,
        to: ResourceState,
    ) -> Result<(), DeviceError>;

    /// Submit pending work and wait for it to complete.
    fn flush(&self);
}

/// Source of graphics devices. The host device comes from the host engine; extra
/// devices are created on a given adapter.
pub trait DeviceProvider: Send + Sync {
    fn host_device(&self, api: GraphicsApi) -> anyhow::Result<Arc<dyn GpuDevice>>;

    fn create_device(
        &self,
        api: GraphicsApi,
        adapter: AdapterLuid,
    ) -> anyhow::Result<Arc<dyn GpuDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_api_ids() {
        assert_eq!(GraphicsApi::from_i32(2), GraphicsApi::Direct3D11);
        assert_eq!(GraphicsApi::from_i32(18), GraphicsApi::Direct3D12);
        assert_eq!(GraphicsApi::from_i32(4), GraphicsApi::Unknown);
        assert_eq!(GraphicsApi::Direct3D12 as i32, 18);
    }

    #[test]
    fn texture_rejects_empty_size() {
        let res = Texture::new(DeviceId::next(), TextureDesc::new(0, 10, TextureUsage::Shared));
        assert_eq!(res.err(), Some(DeviceError::InvalidSize { width: 0, height: 10 }));
    }

    #[test]
    fn texture_rows() {
        let desc = TextureDesc::new(2, 3, TextureUsage::Shared);
        let tex = Texture::new(DeviceId::next(), desc).unwrap();
        assert_eq!(tex.row_pitch(), 8);
        tex.write_row(1, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(tex.read_row(1).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(tex.read_row(0).unwrap(), vec![0; 8]);
        assert!(tex.read_row(3).is_none());
        assert_eq!(tex.write_row(1, &[0; 4]), Err(DeviceError::OutOfBounds));
    }

    #[test]
    fn mapping_twice_fails() {
        let desc = TextureDesc::new(1, 1, TextureUsage::Staging);
        let tex = Texture::new(DeviceId::next(), desc).unwrap();
        tex.set_mapped(true).unwrap();
        assert_eq!(tex.set_mapped(true), Err(DeviceError::AlreadyMapped));
        tex.set_mapped(false).unwrap();
        assert!(!tex.is_mapped());
    }

    struct Handle(usize);

    impl NativeResource for Handle {
        fn as_raw(&self) -> *mut c_void {
            self.0 as *mut c_void
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn native_texture_has_no_cpu_pixels() {
        let desc = TextureDesc::new(2, 2, TextureUsage::Shared);
        let tex = Texture::with_native(DeviceId::next(), desc, Box::new(Handle(0x40))).unwrap();
        assert!(tex.read_pixels().is_empty());
        assert_eq!(tex.native().map(|n| n.as_raw() as usize), Some(0x40));
        assert!(tex.native().unwrap().as_any().downcast_ref::<Handle>().is_some());

        let empty = TextureDesc::new(0, 1, TextureUsage::Shared);
        assert!(Texture::with_native(DeviceId::next(), empty, Box::new(Handle(1))).is_err());
    }
}
