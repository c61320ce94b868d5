use crate::platform::window::WindowId;
use crate::render::backend::{CapturedFrame, SurfaceSize};
use crate::render::device::{GpuDevice, PixelFormat};
use anyhow::Result;
use std::sync::Arc;

pub trait CaptureService: Send + Sync {
    fn create_item_for_window(&self, window: WindowId) -> Result<Box<dyn CaptureItem>>;

    fn create_frame_pool(
        &self,
        device: Arc<dyn GpuDevice>,
        format: PixelFormat,
        buffers: usize,
        size: SurfaceSize,
    ) -> Result<Box<dyn FramePool>>;
}

/// Capture source bound to one window.
pub trait CaptureItem: Send {
    fn window(&self) -> WindowId;

    /// Current size of the source. May be non-positive before the window has been shown.
    fn size(&self) -> (i32, i32);
}

pub trait FramePool: Send {
    fn size(&self) -> SurfaceSize;

    /// Newest completed frame, if any. Never blocks.
    fn try_get_next_frame(&mut self) -> Option<CapturedFrame>;

    fn create_capture_session(&mut self, item: &dyn CaptureItem) -> Result<Box<dyn CaptureSession>>;

    fn close(&mut self);
}

pub trait CaptureSession: Send {
    fn start(&mut self) -> Result<()>;

    fn is_started(&self) -> bool;

    fn close(&mut self);
}
