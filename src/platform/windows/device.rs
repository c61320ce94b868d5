//! Direct3D devices behind the [`GpuDevice`] seam.
//!
//! [`D3D11Device`] supports every operation. [`D3D12Device`] only creates shared
//! textures and writes into them through D3D11On12, which is all the bridged backend
//! asks of a host device.

use crate::render::device::{
    AdapterLuid, DeviceError, DeviceId, DeviceProvider, GpuDevice, GraphicsApi, MappedTexture,
    NativeResource, ResourceState, Texture, TextureDesc, TextureRef, TextureUsage,
};
use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use windows::core::{IUnknown, Interface, BOOL};
use windows::Win32::Foundation::{HANDLE, LUID};
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL_11_0,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, ID3D11Resource, ID3D11Texture2D,
    D3D11_BIND_SHADER_RESOURCE, D3D11_BOX, D3D11_CPU_ACCESS_READ, D3D11_CPU_ACCESS_WRITE,
    D3D11_CREATE_DEVICE_BGRA_SUPPORT, D3D11_MAPPED_SUBRESOURCE, D3D11_MAP_READ, D3D11_QUERY_DESC,
    D3D11_QUERY_EVENT, D3D11_SDK_VERSION, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
    D3D11_USAGE_STAGING,
};
use windows::Win32::Graphics::Direct3D11on12::{
    D3D11On12CreateDevice, ID3D11On12Device, D3D11_RESOURCE_FLAGS,
};
use windows::Win32::Graphics::Direct3D12::{
    D3D12CreateDevice, ID3D12CommandQueue, ID3D12Device, ID3D12Fence, ID3D12Resource,
    D3D12_COMMAND_LIST_TYPE_DIRECT, D3D12_COMMAND_QUEUE_DESC, D3D12_FENCE_FLAG_NONE,
    D3D12_HEAP_FLAG_NONE, D3D12_HEAP_PROPERTIES, D3D12_HEAP_TYPE_DEFAULT, D3D12_RESOURCE_DESC,
    D3D12_RESOURCE_DIMENSION_TEXTURE2D, D3D12_RESOURCE_FLAG_NONE, D3D12_RESOURCE_STATE_COMMON,
    D3D12_TEXTURE_LAYOUT_UNKNOWN,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory1, IDXGIAdapter, IDXGIDevice, IDXGIFactory4, DXGI_ERROR_DEVICE_REMOVED,
    DXGI_ERROR_DEVICE_RESET,
};

/// Driver interface shared across threads.
///
/// Direct3D devices, resources and queues are free-threaded. Immediate contexts are not,
/// and always sit behind a mutex.
#[derive(Clone)]
pub struct FreeThreaded<T>(pub(crate) T);

unsafe impl<T> Send for FreeThreaded<T> {}
unsafe impl<T> Sync for FreeThreaded<T> {}

impl<T> Deref for FreeThreaded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

fn driver(e: windows::core::Error) -> DeviceError {
    if e.code() == DXGI_ERROR_DEVICE_REMOVED || e.code() == DXGI_ERROR_DEVICE_RESET {
        DeviceError::DeviceLost
    } else {
        DeviceError::Driver(e.to_string())
    }
}

fn adapter_luid(luid: LUID) -> AdapterLuid {
    AdapterLuid(((luid.HighPart as u32 as u64) << 32) | luid.LowPart as u64)
}

fn to_luid(adapter: AdapterLuid) -> LUID {
    LUID {
        LowPart: adapter.0 as u32,
        HighPart: (adapter.0 >> 32) as i32,
    }
}

fn check_size(desc: &TextureDesc) -> Result<(), DeviceError> {
    if desc.width == 0 || desc.height == 0 {
        return Err(DeviceError::InvalidSize { width: desc.width, height: desc.height });
    }
    Ok(())
}

fn row_box(width: u32, row: u32, rows: u32) -> D3D11_BOX {
    D3D11_BOX {
        left: 0,
        top: row,
        front: 0,
        right: width,
        bottom: row + rows,
        back: 1,
    }
}

/// `ID3D11Texture2D` backing a [`Texture`].
pub struct D3D11Resource(FreeThreaded<ID3D11Texture2D>);

impl D3D11Resource {
    pub fn new(texture: ID3D11Texture2D) -> Self {
        Self(FreeThreaded(texture))
    }

    pub fn texture(&self) -> &ID3D11Texture2D {
        &self.0
    }
}

impl NativeResource for D3D11Resource {
    fn as_raw(&self) -> *mut c_void {
        self.0.as_raw()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn d3d11_texture(texture: &Texture) -> Result<ID3D11Texture2D, DeviceError> {
    texture
        .native()
        .and_then(|n| n.as_any().downcast_ref::<D3D11Resource>())
        .map(|r| r.texture().clone())
        .ok_or(DeviceError::CrossDevice)
}

pub struct D3D11Device {
    id: DeviceId,
    adapter: AdapterLuid,
    device: FreeThreaded<ID3D11Device>,
    context: Mutex<FreeThreaded<ID3D11DeviceContext>>,
}

impl std::fmt::Debug for D3D11Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D11Device")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .finish()
    }
}

impl D3D11Device {
    /// Creates a hardware device, on `adapter` when given.
    pub fn create(adapter: Option<&IDXGIAdapter>) -> Result<Self> {
        let mut device = None;
        let mut context = None;
        unsafe {
            match adapter {
                Some(adapter) => D3D11CreateDevice(
                    adapter,
                    D3D_DRIVER_TYPE_UNKNOWN,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                ),
                None => D3D11CreateDevice(
                    None,
                    D3D_DRIVER_TYPE_HARDWARE,
                    None,
                    D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    None,
                    D3D11_SDK_VERSION,
                    Some(&mut device),
                    None,
                    Some(&mut context),
                ),
            }
        }
        .context("D3D11CreateDevice")?;

        let device = device.ok_or_else(|| anyhow!("D3D11CreateDevice returned no device"))?;
        let context = context.ok_or_else(|| anyhow!("D3D11CreateDevice returned no context"))?;
        Self::from_parts(device, context)
    }

    /// Wraps a device the host already uses.
    pub fn adopt(device: ID3D11Device) -> Result<Self> {
        let context = unsafe { device.GetImmediateContext() }.context("GetImmediateContext")?;
        Self::from_parts(device, context)
    }

    fn from_parts(device: ID3D11Device, context: ID3D11DeviceContext) -> Result<Self> {
        let dxgi: IDXGIDevice = device.cast()?;
        let desc = unsafe { dxgi.GetAdapter()?.GetDesc()? };
        Ok(Self {
            id: DeviceId::next(),
            adapter: adapter_luid(desc.AdapterLuid),
            device: FreeThreaded(device),
            context: Mutex::new(FreeThreaded(context)),
        })
    }

    pub fn raw(&self) -> &ID3D11Device {
        &self.device
    }

    /// Wraps a texture created by this device, e.g. a capture surface.
    pub fn wrap_texture(
        &self,
        texture: ID3D11Texture2D,
        usage: TextureUsage,
    ) -> Result<TextureRef, DeviceError> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        let desc = TextureDesc::new(desc.Width, desc.Height, usage);
        Ok(Arc::new(Texture::with_native(self.id, desc, Box::new(D3D11Resource::new(texture)))?))
    }

    fn context(&self) -> std::sync::MutexGuard<'_, FreeThreaded<ID3D11DeviceContext>> {
        self.context.lock().unwrap_or_else(|e| e.into_inner())
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

impl GpuDevice for D3D11Device {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn id(&self) -> DeviceId {
        self.id
    }

    fn api(&self) -> GraphicsApi {
        GraphicsApi::Direct3D11
    }

    fn adapter(&self) -> AdapterLuid {
        self.adapter
    }

    fn is_lost(&self) -> bool {
        unsafe { self.device.GetDeviceRemovedReason() }.is_err()
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureRef, DeviceError> {
        self.check(&[])?;
        check_size(&desc)?;

        let (usage, bind, cpu) = match desc.usage {
            TextureUsage::Shared => (D3D11_USAGE_DEFAULT, D3D11_BIND_SHADER_RESOURCE.0 as u32, 0),
            TextureUsage::Staging => (
                D3D11_USAGE_STAGING,
                0,
                (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32,
            ),
            TextureUsage::Capture => (D3D11_USAGE_DEFAULT, 0, 0),
        };
        let native_desc = D3D11_TEXTURE2D_DESC {
            Width: desc.width,
            Height: desc.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: usage,
            BindFlags: bind,
            CPUAccessFlags: cpu,
            MiscFlags: 0,
        };

        let mut texture = None;
        unsafe { self.device.CreateTexture2D(&native_desc, None, Some(&mut texture)) }
            .map_err(driver)?;
        let texture =
            texture.ok_or_else(|| DeviceError::Driver("CreateTexture2D returned nothing".into()))?;
        Ok(Arc::new(Texture::with_native(self.id, desc, Box::new(D3D11Resource::new(texture)))?))
    }

    fn copy_resource(&self, dst: &Texture, src: &Texture) -> Result<(), DeviceError> {
        self.check(&[dst, src])?;
        if dst.size() != src.size() {
            return Err(DeviceError::SizeMismatch { src: src.size(), dst: dst.size() });
        }
        let (dst, src) = (d3d11_texture(dst)?, d3d11_texture(src)?);
        unsafe { self.context().CopyResource(&dst, &src) };
        Ok(())
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

        let region = row_box(src.width(), src_row, rows);
        let (dst, src) = (d3d11_texture(dst)?, d3d11_texture(src)?);
        unsafe {
            self.context()
                .CopySubresourceRegion(&dst, 0, 0, dst_row, 0, &src, 0, Some(&region));
        }
        Ok(())
    }

    fn map(&self, texture: &Texture) -> Result<MappedTexture, DeviceError> {
        self.check(&[texture])?;
        if texture.desc().usage != TextureUsage::Staging {
            return Err(DeviceError::NotMappable);
        }
        texture.set_mapped(true)?;

        let native = d3d11_texture(texture)?;
        let context = self.context();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        if let Err(e) = unsafe { context.Map(&native, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) } {
            let _ = texture.set_mapped(false);
            return Err(driver(e));
        }

        // Driver rows are padded; hand out tightly packed ones
        let pitch = texture.row_pitch();
        let mut data = Vec::with_capacity(pitch * texture.height() as usize);
        for y in 0..texture.height() as usize {
            let row = unsafe {
                let start = (mapped.pData as *const u8).add(y * mapped.RowPitch as usize);
                std::slice::from_raw_parts(start, pitch)
            };
            data.extend_from_slice(row);
        }

        Ok(MappedTexture {
            data,
            row_pitch: pitch,
            height: texture.height(),
        })
    }

    fn unmap(&self, texture: &Texture) {
        if texture.is_mapped() {
            if let Ok(native) = d3d11_texture(texture) {
                unsafe { self.context().Unmap(&native, 0) };
            }
        }
        let _ = texture.set_mapped(false);
    }

    fn update_subresource(&self, dst: &Texture, row: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.check(&[dst])?;
        if row >= dst.height() || data.len() != dst.row_pitch() {
            return Err(DeviceError::OutOfBounds);
        }
        let region = row_box(dst.width(), row, 1);
        let native = d3d11_texture(dst)?;
        unsafe {
            self.context().UpdateSubresource(
                &native,
                0,
                Some(&region),
                data.as_ptr() as *const c_void,
                data.len() as u32,
                0,
            );
        }
        Ok(())
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
        if self.is_lost() {
            return;
        }
        let context = self.context();
        let desc = D3D11_QUERY_DESC { Query: D3D11_QUERY_EVENT, MiscFlags: 0 };
        let mut query = None;
        unsafe {
            context.Flush();
            if self.device.CreateQuery(&desc, Some(&mut query)).is_err() {
                return;
            }
        }
        let Some(query) = query else {
            return;
        };

        unsafe { context.End(&query) };
        let mut done = BOOL(0);
        while !done.as_bool() {
            let status = unsafe {
                context.GetData(
                    &query,
                    Some(&mut done as *mut BOOL as *mut c_void),
                    std::mem::size_of::<BOOL>() as u32,
                    0,
                )
            };
            if status.is_err() || self.is_lost() {
                break;
            }
            std::thread::yield_now();
        }
    }
}

/// `ID3D12Resource` backing a [`Texture`], plus its D3D11On12 wrapper once made.
pub struct D3D12Resource {
    resource: FreeThreaded<ID3D12Resource>,
    wrapped: OnceLock<FreeThreaded<ID3D11Resource>>,
}

impl NativeResource for D3D12Resource {
    fn as_raw(&self) -> *mut c_void {
        self.resource.as_raw()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn d3d12_resource(texture: &Texture) -> Result<&D3D12Resource, DeviceError> {
    texture
        .native()
        .and_then(|n| n.as_any().downcast_ref::<D3D12Resource>())
        .ok_or(DeviceError::CrossDevice)
}

pub struct D3D12Device {
    id: DeviceId,
    adapter: AdapterLuid,
    device: FreeThreaded<ID3D12Device>,
    queue: FreeThreaded<ID3D12CommandQueue>,
    on12: FreeThreaded<ID3D11On12Device>,
    context: Mutex<FreeThreaded<ID3D11DeviceContext>>,
    fence: FreeThreaded<ID3D12Fence>,
    fence_value: AtomicU64,
}

impl std::fmt::Debug for D3D12Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("D3D12Device")
            .field("id", &self.id)
            .field("adapter", &self.adapter)
            .finish()
    }
}

impl D3D12Device {
    /// Creates a device and a direct command queue, on `adapter` when given.
    pub fn create(adapter: Option<&IDXGIAdapter>) -> Result<Self> {
        let mut device: Option<ID3D12Device> = None;
        unsafe {
            match adapter {
                Some(adapter) => D3D12CreateDevice(adapter, D3D_FEATURE_LEVEL_11_0, &mut device),
                None => D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device),
            }
        }
        .context("D3D12CreateDevice")?;
        let device = device.ok_or_else(|| anyhow!("D3D12CreateDevice returned no device"))?;

        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: D3D12_COMMAND_LIST_TYPE_DIRECT,
            ..Default::default()
        };
        let queue: ID3D12CommandQueue =
            unsafe { device.CreateCommandQueue(&desc) }.context("CreateCommandQueue")?;
        Self::adopt(device, queue)
    }

    /// Wraps the host's device and the queue it submits on.
    pub fn adopt(device: ID3D12Device, queue: ID3D12CommandQueue) -> Result<Self> {
        let queues = [Some(queue.cast::<IUnknown>()?)];
        let mut device11: Option<ID3D11Device> = None;
        let mut context = None;
        unsafe {
            D3D11On12CreateDevice(
                &device,
                D3D11_CREATE_DEVICE_BGRA_SUPPORT.0 as u32,
                None,
                Some(&queues),
                0,
                Some(&mut device11),
                Some(&mut context),
                None,
            )
        }
        .context("D3D11On12CreateDevice")?;

        let on12: ID3D11On12Device = device11
            .ok_or_else(|| anyhow!("D3D11On12CreateDevice returned no device"))?
            .cast()?;
        let context = context.ok_or_else(|| anyhow!("D3D11On12CreateDevice returned no context"))?;
        let fence: ID3D12Fence =
            unsafe { device.CreateFence(0, D3D12_FENCE_FLAG_NONE) }.context("CreateFence")?;
        let adapter = adapter_luid(unsafe { device.GetAdapterLuid() });

        Ok(Self {
            id: DeviceId::next(),
            adapter,
            device: FreeThreaded(device),
            queue: FreeThreaded(queue),
            on12: FreeThreaded(on12),
            context: Mutex::new(FreeThreaded(context)),
            fence: FreeThreaded(fence),
            fence_value: AtomicU64::new(0),
        })
    }

    fn check(&self, texture: &Texture) -> Result<(), DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::DeviceLost);
        }
        if texture.device_id() != self.id {
            return Err(DeviceError::CrossDevice);
        }
        Ok(())
    }

    fn wrapped(&self, resource: &D3D12Resource) -> Result<ID3D11Resource, DeviceError> {
        if let Some(wrapped) = resource.wrapped.get() {
            return Ok(wrapped.0.clone());
        }
        let flags = D3D11_RESOURCE_FLAGS {
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            ..Default::default()
        };
        let mut wrapped: Option<ID3D11Resource> = None;
        unsafe {
            self.on12.CreateWrappedResource(
                &*resource.resource,
                &flags,
                D3D12_RESOURCE_STATE_COMMON,
                D3D12_RESOURCE_STATE_COMMON,
                &mut wrapped,
            )
        }
        .map_err(driver)?;
        let wrapped = wrapped
            .ok_or_else(|| DeviceError::Driver("CreateWrappedResource returned nothing".into()))?;
        Ok(resource.wrapped.get_or_init(|| FreeThreaded(wrapped)).0.clone())
    }
}

impl GpuDevice for D3D12Device {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn id(&self) -> DeviceId {
        self.id
    }

    fn api(&self) -> GraphicsApi {
        GraphicsApi::Direct3D12
    }

    fn adapter(&self) -> AdapterLuid {
        self.adapter
    }

    fn is_lost(&self) -> bool {
        unsafe { self.device.GetDeviceRemovedReason() }.is_err()
    }

    fn create_texture(&self, desc: TextureDesc) -> Result<TextureRef, DeviceError> {
        if self.is_lost() {
            return Err(DeviceError::DeviceLost);
        }
        if desc.usage != TextureUsage::Shared {
            return Err(DeviceError::Unsupported("non-shared textures"));
        }
        check_size(&desc)?;

        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let native_desc = D3D12_RESOURCE_DESC {
            Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
            Alignment: 0,
            Width: desc.width as u64,
            Height: desc.height,
            DepthOrArraySize: 1,
            MipLevels: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
            Flags: D3D12_RESOURCE_FLAG_NONE,
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device.CreateCommittedResource(
                &heap,
                D3D12_HEAP_FLAG_NONE,
                &native_desc,
                D3D12_RESOURCE_STATE_COMMON,
                None,
                &mut resource,
            )
        }
        .map_err(driver)?;
        let resource = resource
            .ok_or_else(|| DeviceError::Driver("CreateCommittedResource returned nothing".into()))?;

        let native = D3D12Resource {
            resource: FreeThreaded(resource),
            wrapped: OnceLock::new(),
        };
        Ok(Arc::new(Texture::with_native(self.id, desc, Box::new(native))?))
    }

    fn copy_resource(&self, _dst: &Texture, _src: &Texture) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("resource copies"))
    }

    fn copy_rows(
        &self,
        _: &Texture,
        _: u32,
        _: &Texture,
        _: u32,
        _: u32,
    ) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("row copies"))
    }

    fn map(&self, _texture: &Texture) -> Result<MappedTexture, DeviceError> {
        Err(DeviceError::NotMappable)
    }

    fn unmap(&self, _texture: &Texture) {}

    fn update_subresource(&self, dst: &Texture, row: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.check(dst)?;
        if row >= dst.height() || data.len() != dst.row_pitch() {
            return Err(DeviceError::OutOfBounds);
        }
        let wrapped = self.wrapped(d3d12_resource(dst)?)?;
        let region = row_box(dst.width(), row, 1);
        let context = self.context.lock().unwrap_or_else(|e| e.into_inner());
        unsafe {
            context.UpdateSubresource(
                &wrapped,
                0,
                Some(&region),
                data.as_ptr() as *const c_void,
                data.len() as u32,
                0,
            );
        }
        Ok(())
    }

    fn transition(
        &self,
        texture: &Texture,
        from: ResourceState,
        to: ResourceState,
    ) -> Result<(), DeviceError> {
        self.check(texture)?;
        let actual = texture.state();
        if actual != from {
            return Err(DeviceError::InvalidState { expected: from, actual });
        }

        let wrapped = [Some(self.wrapped(d3d12_resource(texture)?)?)];
        match to {
            ResourceState::BridgeAcquired => unsafe { self.on12.AcquireWrappedResources(&wrapped) },
            ResourceState::ShaderResource => unsafe { self.on12.ReleaseWrappedResources(&wrapped) },
        }
        texture.set_state(to);
        Ok(())
    }

    fn flush(&self) {
        if self.is_lost() {
            return;
        }
        unsafe { self.context.lock().unwrap_or_else(|e| e.into_inner()).Flush() };

        let value = self.fence_value.fetch_add(1, Ordering::SeqCst) + 1;
        unsafe {
            if self.queue.Signal(&*self.fence, value).is_err() {
                return;
            }
            if self.fence.GetCompletedValue() < value {
                // A null event blocks until the fence is reached
                let _ = self.fence.SetEventOnCompletion(value, HANDLE::default());
            }
        }
    }
}

/// Hands out Direct3D devices.
///
/// The host device is the one passed to [`WindowsDeviceProvider::adopt`]; without one,
/// the provider creates its own on the default adapter.
#[derive(Default)]
pub struct WindowsDeviceProvider {
    host_devices: Mutex<HashMap<GraphicsApi, Arc<dyn GpuDevice>>>,
    adopted: Mutex<HashMap<GraphicsApi, bool>>,
}

impl std::fmt::Debug for WindowsDeviceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowsDeviceProvider").finish_non_exhaustive()
    }
}

impl WindowsDeviceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes over the device the host renders with. `queue` is the host's direct command
    /// queue and is only read for Direct3D 12.
    ///
    /// # Safety
    ///
    /// `device` must point to a live `ID3D11Device` or `ID3D12Device` matching `api`, and
    /// `queue` to an `ID3D12CommandQueue` when `api` is Direct3D 12.
    pub unsafe fn adopt(
        &self,
        api: GraphicsApi,
        device: *mut c_void,
        queue: *mut c_void,
    ) -> Result<()> {
        let adopted: Arc<dyn GpuDevice> = match api {
            GraphicsApi::Direct3D11 => {
                let device = ID3D11Device::from_raw_borrowed(&device)
                    .cloned()
                    .ok_or_else(|| anyhow!("null Direct3D11 device"))?;
                Arc::new(D3D11Device::adopt(device)?)
            }
            GraphicsApi::Direct3D12 => {
                let device = ID3D12Device::from_raw_borrowed(&device)
                    .cloned()
                    .ok_or_else(|| anyhow!("null Direct3D12 device"))?;
                let queue = ID3D12CommandQueue::from_raw_borrowed(&queue)
                    .cloned()
                    .ok_or_else(|| anyhow!("null Direct3D12 command queue"))?;
                Arc::new(D3D12Device::adopt(device, queue)?)
            }
            GraphicsApi::Unknown => return Err(anyhow!("cannot adopt a device for an unknown API")),
        };

        log::info!("WindowsDeviceProvider: adopted {api} host device {:?}", adopted.id());
        self.host_devices.lock().unwrap_or_else(|e| e.into_inner()).insert(api, adopted);
        self.adopted.lock().unwrap_or_else(|e| e.into_inner()).insert(api, true);
        Ok(())
    }

    fn create(api: GraphicsApi, adapter: Option<&IDXGIAdapter>) -> Result<Arc<dyn GpuDevice>> {
        Ok(match api {
            GraphicsApi::Direct3D11 => Arc::new(D3D11Device::create(adapter)?),
            GraphicsApi::Direct3D12 => Arc::new(D3D12Device::create(adapter)?),
            GraphicsApi::Unknown => {
                return Err(anyhow!("cannot create a device for an unknown API"))
            }
        })
    }
}

impl DeviceProvider for WindowsDeviceProvider {
    fn host_device(&self, api: GraphicsApi) -> Result<Arc<dyn GpuDevice>> {
        let mut devices = self.host_devices.lock().unwrap_or_else(|e| e.into_inner());
        let adopted = {
            let adopted = self.adopted.lock().unwrap_or_else(|e| e.into_inner());
            adopted.get(&api) == Some(&true)
        };
        match devices.get(&api) {
            Some(device) if !device.is_lost() => return Ok(device.clone()),
            Some(_) if adopted => {
                return Err(anyhow!("host {api} device was lost and has not been replaced"));
            }
            _ => {}
        }

        let device = Self::create(api, None)?;
        log::debug!("WindowsDeviceProvider: created own {api} device {:?}", device.id());
        devices.insert(api, device.clone());
        Ok(device)
    }

    fn create_device(&self, api: GraphicsApi, adapter: AdapterLuid) -> Result<Arc<dyn GpuDevice>> {
        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory1() }.context("CreateDXGIFactory1")?;
        let found: IDXGIAdapter = unsafe { factory.EnumAdapterByLuid(to_luid(adapter)) }
            .with_context(|| format!("no adapter with LUID {:#x}", adapter.0))?;
        Self::create(api, Some(&found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luid_round_trips() {
        let luid = LUID { LowPart: 0xdead_beef, HighPart: -2 };
        let adapter = adapter_luid(luid);
        let back = to_luid(adapter);
        assert_eq!((back.LowPart, back.HighPart), (luid.LowPart, luid.HighPart));
    }

    #[test]
    fn rejects_empty_textures() {
        let desc = TextureDesc::new(0, 4, TextureUsage::Shared);
        assert_eq!(check_size(&desc), Err(DeviceError::InvalidSize { width: 0, height: 4 }));
    }

    #[test]
    fn row_box_covers_whole_rows() {
        let region = row_box(64, 3, 2);
        assert_eq!((region.left, region.right), (0, 64));
        assert_eq!((region.top, region.bottom), (3, 5));
        assert_eq!((region.front, region.back), (0, 1));
    }

    #[test]
    fn unknown_api_cannot_be_adopted() {
        let provider = WindowsDeviceProvider::new();
        let null = std::ptr::null_mut();
        let adopted = unsafe { provider.adopt(GraphicsApi::Unknown, null, null) };
        assert!(adopted.is_err());
        let missing = unsafe { provider.adopt(GraphicsApi::Direct3D11, null, null) };
        assert!(missing.is_err());
    }
}
