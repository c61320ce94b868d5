//! Per-instance capture pipeline.
//!
//! The browser controller renders into a visual tree hosted by the hidden window; a
//! capture session on that window produces frames which are copied into the instance's
//! shared texture on every update.

use crate::engine::errors::ToolkitError;
use crate::platform::browser::CompositionController;
use crate::platform::capture::{CaptureItem, CaptureService, CaptureSession, FramePool};
use crate::platform::composition::{DesktopTarget, Visual};
use crate::platform::window::WindowId;
use crate::platform::Platform;
use crate::render::backend::{CopyOutcome, GraphicsBackend, SharedTexture, SurfaceSize};
use crate::render::device::{GpuDevice, PixelFormat};
use std::sync::Arc;

/// What happened during a single [`CapturePipeline::update_texture`] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameUpdate {
    /// No new frame was available
    NoFrame,
    /// A frame was written into the shared texture
    Copied,
    /// A frame was taken from the pool but not written (size mismatch or copy error)
    Discarded,
}

pub struct CapturePipeline {
    capture: Arc<dyn CaptureService>,
    device: Arc<dyn GpuDevice>,
    buffers: usize,
    // Kept alive for as long as the pipeline runs
    _target: Box<dyn DesktopTarget>,
    root: Box<dyn Visual>,
    _child: Box<dyn Visual>,
    item: Option<Box<dyn CaptureItem>>,
    pool: Option<Box<dyn FramePool>>,
    session: Option<Box<dyn CaptureSession>>,
}

impl std::fmt::Debug for CapturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturePipeline")
            .field("root", &self.root.id())
            .field("pool_size", &self.pool.as_ref().map(|p| p.size()))
            .field("started", &self.is_capturing())
            .finish()
    }
}

fn composition_err(what: &str) -> impl FnOnce(anyhow::Error) -> ToolkitError + '_ {
    move |e| ToolkitError::CompositionFailed(format!("{what}: {e:#}"))
}

impl CapturePipeline {
    /// Builds the visual tree for `window`, points `controller` at it and starts capturing.
    pub fn initialize(
        platform: &Platform,
        window: WindowId,
        controller: &mut dyn CompositionController,
        device: Arc<dyn GpuDevice>,
        size: SurfaceSize,
        buffers: usize,
    ) -> Result<Self, ToolkitError> {
        let compositor = &platform.compositor;

        let mut root = compositor
            .create_container_visual()
            .map_err(composition_err("root visual"))?;
        root.set_size(size.width as f32, size.height as f32);

        let mut target = compositor
            .create_desktop_target(window)
            .map_err(composition_err("desktop target"))?;
        target.set_root(root.as_ref()).map_err(composition_err("desktop target root"))?;

        let mut child = compositor
            .create_container_visual()
            .map_err(composition_err("browser visual"))?;
        child.set_relative_size(1.0, 1.0);
        root.insert_at_top(child.as_ref()).map_err(composition_err("browser visual"))?;

        controller
            .set_root_visual_target(Some(child.id()))
            .map_err(composition_err("controller visual target"))?;

        let mut pipeline = Self {
            capture: platform.capture.clone(),
            device,
            buffers,
            _target: target,
            root,
            _child: child,
            item: None,
            pool: None,
            session: None,
        };
        pipeline.start_capture(window, size)?;
        Ok(pipeline)
    }

    fn start_capture(&mut self, window: WindowId, size: SurfaceSize) -> Result<(), ToolkitError> {
        let item = self
            .capture
            .create_item_for_window(window)
            .map_err(composition_err("capture item"))?;

        let pool_size = match item.size() {
            (w, h) if w > 0 && h > 0 => SurfaceSize::new(w as u32, h as u32),
            _ => size,
        };
        self.item = Some(item);
        self.open_session(pool_size)
    }

    /// Creates pool and session for the current item and starts the session.
    fn open_session(&mut self, size: SurfaceSize) -> Result<(), ToolkitError> {
        let item = self
            .item
            .as_ref()
            .ok_or_else(|| ToolkitError::CompositionFailed("no capture item".into()))?;

        let mut pool = self
            .capture
            .create_frame_pool(self.device.clone(), PixelFormat::Bgra8, self.buffers, size)
            .map_err(composition_err("frame pool"))?;
        let mut session = pool
            .create_capture_session(item.as_ref())
            .map_err(composition_err("capture session"))?;
        session.start().map_err(composition_err("capture start"))?;

        log::debug!("Capture: session started at {}x{}", size.width, size.height);
        self.pool = Some(pool);
        self.session = Some(session);
        Ok(())
    }

    fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
        if let Some(mut pool) = self.pool.take() {
            pool.close();
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.session.as_ref().map(|s| s.is_started()).unwrap_or(false)
    }

    /// Pulls the newest frame (if any) and copies it into `dest`, flipped.
    ///
    /// The frame goes back to the pool before returning, whatever the outcome.
    pub fn update_texture(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        dest: &SharedTexture,
    ) -> FrameUpdate {
        let Some(pool) = self.pool.as_mut() else {
            return FrameUpdate::NoFrame;
        };
        let Some(frame) = pool.try_get_next_frame() else {
            return FrameUpdate::NoFrame;
        };

        let result = backend.copy_captured_frame(&frame, dest, true);
        frame.close();

        match result {
            Ok(CopyOutcome::Copied) => FrameUpdate::Copied,
            Ok(CopyOutcome::SkippedSizeMismatch { frame, dest }) => {
                log::debug!(
                    "Capture: dropping {}x{} frame for {}x{} texture",
                    frame.width,
                    frame.height,
                    dest.width,
                    dest.height
                );
                FrameUpdate::Discarded
            }
            Err(e) => {
                log::warn!("Capture: frame copy failed: {e}");
                FrameUpdate::Discarded
            }
        }
    }

    /// Rebuilds pool and session at the new size against the same item and device.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), ToolkitError> {
        self.root.set_size(width as f32, height as f32);
        self.close_session();
        self.open_session(SurfaceSize::new(width, height))
    }

    pub fn shutdown(&mut self) {
        self.close_session();
        self.item = None;
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::browser::EnvironmentOptions;
    use crate::platform::software::SoftwarePlatform;
    use crate::platform::window::HiddenWindow;
    use crate::render::backends::direct::DirectBackend;
    use crate::render::device::{DeviceProvider, GraphicsApi};

    struct Fixture {
        sw: SoftwarePlatform,
        _hidden: Box<dyn HiddenWindow>,
        window: WindowId,
        controller: Box<dyn CompositionController>,
        backend: DirectBackend,
        _dir: tempfile::TempDir,
    }

    async fn fixture(width: u32, height: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sw = SoftwarePlatform::new();
        let platform = sw.platform();
        let hidden = platform.windowing.create_hidden_window(width, height).unwrap();
        let window_id = hidden.id();

        let env = platform
            .browser
            .create_environment(EnvironmentOptions {
                user_data_folder: dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        let controller = env.create_composition_controller(window_id).await.unwrap();

        let mut backend = DirectBackend::new(sw.devices().clone()).unwrap();
        backend.initialize().unwrap();
        Fixture {
            sw,
            _hidden: hidden,
            window: window_id,
            controller,
            backend,
            _dir: dir,
        }
    }

    fn pipeline(fx: &mut Fixture, size: SurfaceSize) -> CapturePipeline {
        let device = fx.backend.capture_device().unwrap();
        let platform = fx.sw.platform();
        let controller = fx.controller.as_mut();
        CapturePipeline::initialize(&platform, fx.window, controller, device, size, 2).unwrap()
    }

    #[tokio::test]
    async fn builds_visual_tree() {
        let mut fx = fixture(8, 4).await;
        let pipeline = pipeline(&mut fx, SurfaceSize::new(8, 4));
        let world = fx.sw.world();

        let root = world.target_root(fx.window).unwrap();
        let record = world.visual(root).unwrap();
        assert_eq!(record.size, (8.0, 4.0));
        assert_eq!(record.children.len(), 1);

        let child = world.visual(record.children[0]).unwrap();
        assert_eq!(child.relative_size, (1.0, 1.0));
        assert_eq!(world.controller(fx.window).unwrap().root_visual, Some(record.children[0]));
        assert!(pipeline.is_capturing());
    }

    #[tokio::test]
    async fn update_copies_newest_frame() {
        let mut fx = fixture(4, 2).await;
        let mut pipeline = pipeline(&mut fx, SurfaceSize::new(4, 2));
        let dest = fx.backend.create_shared_texture(4, 2).unwrap();

        assert_eq!(pipeline.update_texture(&mut fx.backend, &dest), FrameUpdate::NoFrame);

        fx.sw.world().present_solid(fx.window, [9, 8, 7, 255]).unwrap();
        assert_eq!(pipeline.update_texture(&mut fx.backend, &dest), FrameUpdate::Copied);
        assert_eq!(&dest.texture().read_row(1).unwrap()[..4], &[9, 8, 7, 255]);

        // Frames are returned to the pool, so the stream keeps going
        for i in 0..4 {
            fx.sw.world().present_solid(fx.window, [i, 0, 0, 255]).unwrap();
            assert_eq!(pipeline.update_texture(&mut fx.backend, &dest), FrameUpdate::Copied);
        }
    }

    #[tokio::test]
    async fn stale_frame_after_resize_is_discarded() {
        let mut fx = fixture(4, 2).await;
        let mut pipeline = pipeline(&mut fx, SurfaceSize::new(4, 2));
        let dest = fx.backend.create_shared_texture(4, 2).unwrap();
        fx.sw.world().present_solid(fx.window, [1, 1, 1, 255]).unwrap();

        let bigger = fx.backend.resize_shared_texture(&dest, 6, 3).unwrap();
        pipeline.resize(6, 3).unwrap();

        assert_eq!(pipeline.update_texture(&mut fx.backend, &bigger), FrameUpdate::Discarded);
        assert!(bigger.texture().read_pixels().iter().all(|b| *b == 0));
        let root = fx.sw.world().target_root(fx.window).unwrap();
        assert_eq!(fx.sw.world().visual(root).unwrap().size, (6.0, 3.0));
    }

    #[tokio::test]
    async fn dead_window_cannot_be_captured() {
        let mut fx = fixture(4, 2).await;
        let window = fx.window;
        fx.sw.world().destroy_window(window);
        let device = fx.backend.capture_device().unwrap();
        assert!(CapturePipeline::initialize(
            &fx.sw.platform(),
            window,
            fx.controller.as_mut(),
            device,
            SurfaceSize::new(4, 2),
            2
        )
        .is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_capture() {
        let mut fx = fixture(4, 2).await;
        let mut pipeline = pipeline(&mut fx, SurfaceSize::new(4, 2));
        let dest = fx.backend.create_shared_texture(4, 2).unwrap();
        pipeline.shutdown();
        assert!(!pipeline.is_capturing());

        fx.sw.world().present_solid(fx.window, [1, 1, 1, 255]).unwrap();
        assert_eq!(pipeline.update_texture(&mut fx.backend, &dest), FrameUpdate::NoFrame);
    }

    #[tokio::test]
    async fn pool_lives_on_capture_device() {
        let fx = fixture(4, 2).await;
        let host = fx.sw.devices().host_device(GraphicsApi::Direct3D11).unwrap();
        assert_eq!(fx.backend.capture_device().unwrap().id(), host.id());
    }
}
