use crate::platform::window::WindowId;
use anyhow::Result;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VisualId(pub u64);

pub trait Compositor: Send + Sync {
    fn create_container_visual(&self) -> Result<Box<dyn Visual>>;

    /// Target that shows a visual tree inside `window`.
    fn create_desktop_target(&self, window: WindowId) -> Result<Box<dyn DesktopTarget>>;
}

pub trait Visual: Send {
    fn id(&self) -> VisualId;

    /// Absolute size in pixels.
    fn set_size(&mut self, width: f32, height: f32);

    /// Size relative to the parent, `(1.0, 1.0)` fills it.
    fn set_relative_size(&mut self, width: f32, height: f32);

    fn insert_at_top(&mut self, child: &dyn Visual) -> Result<()>;
}

pub trait DesktopTarget: Send {
    fn set_root(&mut self, root: &dyn Visual) -> Result<()>;
}
