use super::device::{D3D11Device, FreeThreaded};
use super::window::hwnd;
use crate::platform::capture::{CaptureItem, CaptureService, CaptureSession, FramePool};
use crate::platform::window::WindowId;
use crate::render::backend::{CapturedFrame, SurfaceSize};
use crate::render::device::{GpuDevice, PixelFormat, TextureUsage};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use windows::core::{factory, Interface};
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Graphics::SizeInt32;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Dxgi::IDXGIDevice;
use windows::Win32::System::WinRT::Direct3D11::{
    CreateDirect3D11DeviceFromDXGIDevice, IDirect3DDxgiInterfaceAccess,
};
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;

/// Windows Graphics Capture on free-threaded frame pools.
#[derive(Debug, Default)]
pub struct GraphicsCapture;

fn item_for_window(window: WindowId) -> Result<GraphicsCaptureItem> {
    let interop = factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()?;
    unsafe { interop.CreateForWindow(hwnd(window)) }.context("CreateForWindow")
}

impl CaptureService for GraphicsCapture {
    fn create_item_for_window(&self, window: WindowId) -> Result<Box<dyn CaptureItem>> {
        let item = item_for_window(window)?;
        Ok(Box::new(WgcItem {
            window,
            item: FreeThreaded(item),
        }))
    }

    fn create_frame_pool(
        &self,
        device: Arc<dyn GpuDevice>,
        format: PixelFormat,
        buffers: usize,
        size: SurfaceSize,
    ) -> Result<Box<dyn FramePool>> {
        let d3d = device
            .as_any()
            .downcast_ref::<D3D11Device>()
            .ok_or_else(|| anyhow!("capture needs a Direct3D11 device"))?;
        let dxgi: IDXGIDevice = d3d.raw().cast()?;
        let rt_device: IDirect3DDevice = unsafe { CreateDirect3D11DeviceFromDXGIDevice(&dxgi) }
            .context("CreateDirect3D11DeviceFromDXGIDevice")?
            .cast()?;

        let pixel_format = match format {
            PixelFormat::Bgra8 => DirectXPixelFormat::B8G8R8A8UIntNormalized,
        };
        let pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
            &rt_device,
            pixel_format,
            buffers as i32,
            SizeInt32 {
                Width: size.width as i32,
                Height: size.height as i32,
            },
        )
        .context("CreateFreeThreaded")?;

        Ok(Box::new(WgcFramePool {
            pool: FreeThreaded(pool),
            device,
            size,
            closed: false,
        }))
    }
}

pub struct WgcItem {
    window: WindowId,
    item: FreeThreaded<GraphicsCaptureItem>,
}

impl CaptureItem for WgcItem {
    fn window(&self) -> WindowId {
        self.window
    }

    fn size(&self) -> (i32, i32) {
        self.item.Size().map(|s| (s.Width, s.Height)).unwrap_or((0, 0))
    }
}

pub struct WgcFramePool {
    pool: FreeThreaded<Direct3D11CaptureFramePool>,
    device: Arc<dyn GpuDevice>,
    size: SurfaceSize,
    closed: bool,
}

impl WgcFramePool {
    /// Newest queued frame; older ones go straight back to the pool.
    fn newest(&self) -> Option<Direct3D11CaptureFrame> {
        let mut newest: Option<Direct3D11CaptureFrame> = None;
        while let Ok(frame) = self.pool.TryGetNextFrame() {
            if let Some(older) = newest.replace(frame) {
                let _ = older.Close();
            }
        }
        newest
    }

    fn to_captured(&self, frame: Direct3D11CaptureFrame) -> Result<CapturedFrame> {
        let access: IDirect3DDxgiInterfaceAccess = frame.Surface()?.cast()?;
        let texture: ID3D11Texture2D = unsafe { access.GetInterface() }?;
        let d3d = self
            .device
            .as_any()
            .downcast_ref::<D3D11Device>()
            .ok_or_else(|| anyhow!("capture device is not Direct3D11"))?;
        let surface = d3d.wrap_texture(texture, TextureUsage::Capture)?;

        let frame = FreeThreaded(frame);
        Ok(CapturedFrame::with_release(surface, move || {
            let _ = frame.Close();
        }))
    }
}

impl FramePool for WgcFramePool {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn try_get_next_frame(&mut self) -> Option<CapturedFrame> {
        if self.closed {
            return None;
        }
        let frame = self.newest()?;
        match self.to_captured(frame.clone()) {
            Ok(captured) => Some(captured),
            Err(e) => {
                let _ = frame.Close();
                log::warn!("WgcFramePool: unusable frame: {e:#}");
                None
            }
        }
    }

    fn create_capture_session(
        &mut self,
        item: &dyn CaptureItem,
    ) -> Result<Box<dyn CaptureSession>> {
        // The session gets its own item for the same window
        let item = item_for_window(item.window())?;
        let session = self.pool.CreateCaptureSession(&item).context("CreateCaptureSession")?;
        // Not available on older builds
        let _ = session.SetIsCursorCaptureEnabled(false);
        Ok(Box::new(WgcSession {
            session: FreeThreaded(session),
            started: false,
        }))
    }

    fn close(&mut self) {
        if !std::mem::replace(&mut self.closed, true) {
            let _ = self.pool.Close();
        }
    }
}

impl Drop for WgcFramePool {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct WgcSession {
    session: FreeThreaded<GraphicsCaptureSession>,
    started: bool,
}

impl CaptureSession for WgcSession {
    fn start(&mut self) -> Result<()> {
        self.session.StartCapture().context("StartCapture")?;
        self.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn close(&mut self) {
        if std::mem::replace(&mut self.started, false) {
            let _ = self.session.Close();
        }
    }
}

impl Drop for WgcSession {
    fn drop(&mut self) {
        self.close();
    }
}
