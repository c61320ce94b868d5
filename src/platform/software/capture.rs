use super::{FailureSwitches, World};
use crate::platform::capture::{CaptureItem, CaptureService, CaptureSession, FramePool};
use crate::platform::window::WindowId;
use crate::render::backend::{CapturedFrame, SurfaceSize};
use crate::render::device::{GpuDevice, PixelFormat, TextureDesc, TextureUsage};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct SoftwareCapture {
    world: Arc<World>,
}

impl SoftwareCapture {
    pub fn new(world: Arc<World>) -> Self {
        Self { world }
    }
}

impl CaptureService for SoftwareCapture {
    fn create_item_for_window(&self, window: WindowId) -> Result<Box<dyn CaptureItem>> {
        FailureSwitches::check(&self.world.switches.capture, "capture item")?;
        if !self.world.window_alive(window) {
            return Err(anyhow!("cannot capture missing window {:?}", window));
        }
        Ok(Box::new(SoftwareCaptureItem {
            window,
            world: self.world.clone(),
        }))
    }

    fn create_frame_pool(
        &self,
        device: Arc<dyn GpuDevice>,
        format: PixelFormat,
        buffers: usize,
        size: SurfaceSize,
    ) -> Result<Box<dyn FramePool>> {
        if buffers == 0 {
            return Err(anyhow!("frame pool needs at least one buffer"));
        }
        if device.is_lost() {
            return Err(anyhow!("frame pool device has been lost"));
        }
        Ok(Box::new(SoftwareFramePool {
            world: self.world.clone(),
            device,
            format,
            buffers,
            size,
            outstanding: Arc::new(AtomicUsize::new(0)),
            binding: None,
            last_seq: 0,
            closed: false,
        }))
    }
}

#[derive(Debug)]
pub struct SoftwareCaptureItem {
    window: WindowId,
    world: Arc<World>,
}

impl CaptureItem for SoftwareCaptureItem {
    fn window(&self) -> WindowId {
        self.window
    }

    fn size(&self) -> (i32, i32) {
        self.world
            .window_size(self.window)
            .map(|s| (s.width as i32, s.height as i32))
            .unwrap_or((0, 0))
    }
}

/// Window and started flag of the session created from a pool.
#[derive(Debug)]
struct SessionBinding {
    window: WindowId,
    started: Arc<AtomicBool>,
}

pub struct SoftwareFramePool {
    world: Arc<World>,
    device: Arc<dyn GpuDevice>,
    format: PixelFormat,
    buffers: usize,
    size: SurfaceSize,
    outstanding: Arc<AtomicUsize>,
    binding: Option<SessionBinding>,
    last_seq: u64,
    closed: bool,
}

impl std::fmt::Debug for SoftwareFramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareFramePool")
            .field("size", &self.size)
            .field("buffers", &self.buffers)
            .field("closed", &self.closed)
            .finish()
    }
}

impl FramePool for SoftwareFramePool {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn try_get_next_frame(&mut self) -> Option<CapturedFrame> {
        if self.closed {
            return None;
        }
        let binding = self.binding.as_ref()?;
        if !binding.started.load(Ordering::SeqCst) {
            return None;
        }
        if self.outstanding.load(Ordering::SeqCst) >= self.buffers {
            return None;
        }

        let presented = self.world.latest_frame(binding.window, self.last_seq)?;
        let desc = TextureDesc {
            format: self.format,
            ..TextureDesc::new(presented.size.width, presented.size.height, TextureUsage::Capture)
        };
        let surface = self.device.create_texture(desc).ok()?;
        surface.write_pixels(&presented.pixels).ok()?;
        self.last_seq = presented.seq;

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = self.outstanding.clone();
        Some(CapturedFrame::with_release(surface, move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn create_capture_session(
        &mut self,
        item: &dyn CaptureItem,
    ) -> Result<Box<dyn CaptureSession>> {
        if self.closed {
            return Err(anyhow!("frame pool is closed"));
        }
        let started = Arc::new(AtomicBool::new(false));
        self.binding = Some(SessionBinding {
            window: item.window(),
            started: started.clone(),
        });
        Ok(Box::new(SoftwareCaptureSession { started, closed: false }))
    }

    fn close(&mut self) {
        self.closed = true;
        self.binding = None;
    }
}

#[derive(Debug)]
pub struct SoftwareCaptureSession {
    started: Arc<AtomicBool>,
    closed: bool,
}

impl CaptureSession for SoftwareCaptureSession {
    fn start(&mut self) -> Result<()> {
        if self.closed {
            return Err(anyhow!("capture session is closed"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.closed = true;
        self.started.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::device::{AdapterLuid, GraphicsApi};
    use crate::render::software::SoftwareDevice;

    fn setup() -> (Arc<World>, SoftwareCapture, WindowId, Arc<dyn GpuDevice>) {
        let world = Arc::new(World::default());
        let capture = SoftwareCapture::new(world.clone());
        let window = world.add_window(SurfaceSize::new(2, 2));
        let device: Arc<dyn GpuDevice> =
            Arc::new(SoftwareDevice::new(GraphicsApi::Direct3D11, AdapterLuid(1)));
        (world, capture, window, device)
    }

    #[test]
    fn no_frames_until_session_started() {
        let (world, capture, window, device) = setup();
        let item = capture.create_item_for_window(window).unwrap();
        let mut pool = capture
            .create_frame_pool(device, PixelFormat::Bgra8, 2, SurfaceSize::new(2, 2))
            .unwrap();
        let mut session = pool.create_capture_session(item.as_ref()).unwrap();

        world.present_solid(window, [1, 2, 3, 4]).unwrap();
        assert!(pool.try_get_next_frame().is_none());

        session.start().unwrap();
        let frame = pool.try_get_next_frame().unwrap();
        assert_eq!(frame.size(), SurfaceSize::new(2, 2));
        assert_eq!(frame.surface().read_row(0).unwrap(), vec![1, 2, 3, 4, 1, 2, 3, 4]);

        // Already consumed
        assert!(pool.try_get_next_frame().is_none());
    }

    #[test]
    fn pool_runs_out_of_buffers() {
        let (world, capture, window, device) = setup();
        let item = capture.create_item_for_window(window).unwrap();
        let mut pool = capture
            .create_frame_pool(device, PixelFormat::Bgra8, 2, SurfaceSize::new(2, 2))
            .unwrap();
        pool.create_capture_session(item.as_ref()).unwrap().start().unwrap();

        world.present_solid(window, [1; 4]).unwrap();
        let a = pool.try_get_next_frame().unwrap();
        world.present_solid(window, [2; 4]).unwrap();
        let b = pool.try_get_next_frame().unwrap();
        world.present_solid(window, [3; 4]).unwrap();
        assert!(pool.try_get_next_frame().is_none());

        a.close();
        drop(b);
        assert!(pool.try_get_next_frame().is_some());
    }

    #[test]
    fn closed_pool_yields_nothing() {
        let (world, capture, window, device) = setup();
        let item = capture.create_item_for_window(window).unwrap();
        let mut pool = capture
            .create_frame_pool(device, PixelFormat::Bgra8, 2, SurfaceSize::new(2, 2))
            .unwrap();
        let mut session = pool.create_capture_session(item.as_ref()).unwrap();
        session.start().unwrap();

        session.close();
        pool.close();
        world.present_solid(window, [1; 4]).unwrap();
        assert!(pool.try_get_next_frame().is_none());
        assert!(pool.create_capture_session(item.as_ref()).is_err());
    }

    #[test]
    fn item_reports_window_size() {
        let (world, capture, window, _) = setup();
        let item = capture.create_item_for_window(window).unwrap();
        assert_eq!(item.size(), (2, 2));
        world.destroy_window(window);
        assert!(capture.create_item_for_window(window).is_err());
    }
}
