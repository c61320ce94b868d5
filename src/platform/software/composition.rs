use super::World;
use crate::platform::composition::{Compositor, DesktopTarget, Visual, VisualId};
use crate::platform::window::WindowId;
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Observable state of a software visual.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisualRecord {
    pub size: (f32, f32),
    pub relative_size: (f32, f32),
    /// Children, topmost first
    pub children: Vec<VisualId>,
}

#[derive(Debug)]
pub struct SoftwareCompositor {
    world: Arc<World>,
}

impl SoftwareCompositor {
    pub fn new(world: Arc<World>) -> Self {
        Self { world }
    }
}

impl Compositor for SoftwareCompositor {
    fn create_container_visual(&self) -> Result<Box<dyn Visual>> {
        Ok(Box::new(SoftwareVisual {
            id: self.world.add_visual(),
            world: self.world.clone(),
        }))
    }

    fn create_desktop_target(&self, window: WindowId) -> Result<Box<dyn DesktopTarget>> {
        if !self.world.window_alive(window) {
            return Err(anyhow!("cannot target missing window {:?}", window));
        }
        Ok(Box::new(SoftwareDesktopTarget {
            window,
            world: self.world.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct SoftwareVisual {
    id: VisualId,
    world: Arc<World>,
}

impl Visual for SoftwareVisual {
    fn id(&self) -> VisualId {
        self.id
    }

    fn set_size(&mut self, width: f32, height: f32) {
        self.world.with_visual(self.id, |v| v.size = (width, height));
    }

    fn set_relative_size(&mut self, width: f32, height: f32) {
        self.world.with_visual(self.id, |v| v.relative_size = (width, height));
    }

    fn insert_at_top(&mut self, child: &dyn Visual) -> Result<()> {
        let child = child.id();
        self.world
            .with_visual(self.id, |v| v.children.insert(0, child))
            .ok_or_else(|| anyhow!("visual {:?} is gone", self.id))
    }
}

impl Drop for SoftwareVisual {
    fn drop(&mut self) {
        self.world.remove_visual(self.id);
    }
}

#[derive(Debug)]
pub struct SoftwareDesktopTarget {
    window: WindowId,
    world: Arc<World>,
}

impl DesktopTarget for SoftwareDesktopTarget {
    fn set_root(&mut self, root: &dyn Visual) -> Result<()> {
        self.world.set_target_root(self.window, Some(root.id()));
        Ok(())
    }
}

impl Drop for SoftwareDesktopTarget {
    fn drop(&mut self) {
        self.world.set_target_root(self.window, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backend::SurfaceSize;

    #[test]
    fn tree_is_recorded() {
        let world = Arc::new(World::default());
        let compositor = SoftwareCompositor::new(world.clone());
        let window = world.add_window(SurfaceSize::new(4, 4));

        let mut root = compositor.create_container_visual().unwrap();
        let mut child = compositor.create_container_visual().unwrap();
        root.set_size(4.0, 4.0);
        child.set_relative_size(1.0, 1.0);
        root.insert_at_top(child.as_ref()).unwrap();

        let mut target = compositor.create_desktop_target(window).unwrap();
        target.set_root(root.as_ref()).unwrap();

        assert_eq!(world.target_root(window), Some(root.id()));
        let rec = world.visual(root.id()).unwrap();
        assert_eq!(rec.size, (4.0, 4.0));
        assert_eq!(rec.children, vec![child.id()]);
        assert_eq!(world.visual(child.id()).unwrap().relative_size, (1.0, 1.0));

        drop(target);
        assert_eq!(world.target_root(window), None);
    }
}
