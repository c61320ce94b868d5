use crate::engine::errors::ToolkitError;
use crate::engine::events::DeviceEventType;
use crate::render::device::{GpuDevice, GraphicsApi, TextureRef};
use crate::render::Viewport;
use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

/// Size of a surface in pixels. It's a simple struct to hold width and height.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<Viewport> for SurfaceSize {
    fn from(vp: Viewport) -> Self {
        Self { width: vp.width, height: vp.height }
    }
}

/// Texture exposed to the host. BGRA8, 4 bytes per pixel.
///
/// A resize replaces the texture; hosts must fetch the pointer again afterwards.
#[derive(Clone, Debug)]
pub struct SharedTexture {
    texture: TextureRef,
}

impl SharedTexture {
    pub fn new(texture: TextureRef) -> Self {
        Self { texture }
    }

    pub fn texture(&self) -> &TextureRef {
        &self.texture
    }

    pub fn width(&self) -> u32 {
        self.texture.width()
    }

    pub fn height(&self) -> u32 {
        self.texture.height()
    }

    pub fn size(&self) -> SurfaceSize {
        self.texture.size()
    }

    /// Native identity of the texture, stable for its lifetime.
    pub fn native_id(&self) -> usize {
        Arc::as_ptr(&self.texture) as usize
    }

    /// Opaque pointer handed to the host: the driver resource when there is one.
    pub fn native_ptr(&self) -> *mut c_void {
        match self.texture.native() {
            Some(native) => native.as_raw(),
            None => Arc::as_ptr(&self.texture) as *mut c_void,
        }
    }
}

/// A frame delivered by the capture service.
///
/// The frame holds one of the pool's buffers until it is closed. Dropping the frame
/// closes it as well.
pub struct CapturedFrame {
    surface: TextureRef,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl std::fmt::Debug for CapturedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedFrame")
            .field("surface", &self.surface)
            .field("closed", &self.on_close.is_none())
            .finish()
    }
}

impl CapturedFrame {
    /// Frame that does not belong to a pool.
    pub fn new(surface: TextureRef) -> Self {
        Self { surface, on_close: None }
    }

    /// Frame that gives its buffer back to the pool through `on_close`.
    pub fn with_release(surface: TextureRef, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            surface,
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn surface(&self) -> &TextureRef {
        &self.surface
    }

    pub fn size(&self) -> SurfaceSize {
        self.surface.size()
    }

    /// Release the frame's buffer back to its pool.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for CapturedFrame {
    fn drop(&mut self) {
        self.release();
    }
}

/// Result of a frame copy that did not fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// Frame and destination sizes differ; nothing was written.
    SkippedSizeMismatch { frame: SurfaceSize, dest: SurfaceSize },
}

/// Core backend interface. Calls occur with the registry lock held.
pub trait GraphicsBackend: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn name(&self) -> &str;

    /// Graphics API the host renders with.
    fn api(&self) -> GraphicsApi;

    /// Acquire the devices. Called once before use and again after a device restore.
    fn initialize(&mut self) -> Result<(), ToolkitError>;

    /// Wait for outstanding work and drop every device resource.
    fn shutdown(&mut self);

    fn is_initialized(&self) -> bool;

    /// Device the capture frame pools are created on.
    fn capture_device(&self) -> Option<Arc<dyn GpuDevice>>;

    fn create_shared_texture(
        &mut self,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError>;

    fn destroy_shared_texture(&mut self, texture: SharedTexture);

    /// Replace `texture` with one of the new size. The new texture is created before the
    /// old one is destroyed; on failure the old texture stays valid.
    fn resize_shared_texture(
        &mut self,
        texture: &SharedTexture,
        width: u32,
        height: u32,
    ) -> Result<SharedTexture, ToolkitError>;

    /// Copy a captured frame into `dest`, optionally flipping it vertically.
    fn copy_captured_frame(
        &mut self,
        frame: &CapturedFrame,
        dest: &SharedTexture,
        flip_y: bool,
    ) -> Result<CopyOutcome, ToolkitError>;

    fn wait_for_gpu(&self);

    fn on_device_event(&mut self, event: DeviceEventType);

    /// Host render thread is about to issue toolkit work.
    fn begin_render(&mut self) {}

    /// Host render thread finished issuing toolkit work.
    fn end_render(&mut self) {}
}

/// Fail the copy early when frame and destination sizes differ.
pub(crate) fn check_frame_size(frame: &CapturedFrame, dest: &SharedTexture) -> Option<CopyOutcome> {
    let frame_size = frame.size();
    let dest_size = dest.size();
    if frame_size != dest_size {
        return Some(CopyOutcome::SkippedSizeMismatch { frame: frame_size, dest: dest_size });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::device::{AdapterLuid, TextureDesc, TextureUsage};
    use crate::render::software::SoftwareDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn texture(w: u32, h: u32) -> TextureRef {
        SoftwareDevice::new(GraphicsApi::Direct3D11, AdapterLuid(1))
            .create_texture(TextureDesc::new(w, h, TextureUsage::Shared))
            .unwrap()
    }

    #[test]
    fn frame_close_runs_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        let frame = CapturedFrame::with_release(texture(1, 1), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        frame.close();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_frame_is_closed() {
        let closed = Arc::new(AtomicUsize::new(0));
        let c = closed.clone();
        {
            let _frame = CapturedFrame::with_release(texture(1, 1), move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_texture_pointer_tracks_identity() {
        let a = SharedTexture::new(texture(2, 2));
        let b = SharedTexture::new(texture(2, 2));
        assert_ne!(a.native_ptr(), b.native_ptr());
        assert_eq!(a.native_ptr(), a.clone().native_ptr());
        assert_eq!(a.size(), SurfaceSize::new(2, 2));
    }

    #[test]
    fn size_check() {
        let frame = CapturedFrame::new(texture(4, 4));
        let dest = SharedTexture::new(texture(4, 5));
        assert_eq!(
            check_frame_size(&frame, &dest),
            Some(CopyOutcome::SkippedSizeMismatch {
                frame: SurfaceSize::new(4, 4),
                dest: SurfaceSize::new(4, 5)
            })
        );
        let same = SharedTexture::new(texture(4, 4));
        assert_eq!(check_frame_size(&frame, &same), None);
    }
}
