use super::{FailureSwitches, World};
use crate::platform::window::{HiddenWindow, WindowId, WindowMessage, Windowing};
use crate::render::backend::SurfaceSize;
use anyhow::{anyhow, Result};
use std::sync::Arc;

#[derive(Debug)]
pub struct SoftwareWindowing {
    world: Arc<World>,
}

impl SoftwareWindowing {
    pub fn new(world: Arc<World>) -> Self {
        Self { world }
    }
}

impl Windowing for SoftwareWindowing {
    fn create_hidden_window(&self, width: u32, height: u32) -> Result<Box<dyn HiddenWindow>> {
        FailureSwitches::check(&self.world.switches.window, "window")?;
        if width == 0 || height == 0 {
            return Err(anyhow!("window size {width}x{height} is empty"));
        }

        let id = self.world.add_window(SurfaceSize::new(width, height));
        log::debug!("SoftwareWindowing: created hidden window {:?} ({width}x{height})", id);
        Ok(Box::new(SoftwareWindow {
            id,
            world: self.world.clone(),
        }))
    }
}

#[derive(Debug)]
pub struct SoftwareWindow {
    id: WindowId,
    world: Arc<World>,
}

impl HiddenWindow for SoftwareWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        self.world.with_window(self.id, |w| w.size = SurfaceSize::new(width, height))
    }

    fn post_message(&self, message: WindowMessage) -> Result<()> {
        self.world.with_window(self.id, |w| w.messages.push(message))
    }

    fn destroy(&mut self) {
        self.world.destroy_window(self.id);
    }
}
