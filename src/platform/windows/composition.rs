use super::apartment::{self, UiThread};
use super::window::hwnd;
use crate::platform::composition::{Compositor, DesktopTarget, Visual, VisualId};
use crate::platform::window::WindowId;
use anyhow::{Context, Result};
use std::sync::Arc;
use windows::core::Interface;
use windows::Foundation::Numerics::Vector2;
use windows::UI::Composition::Desktop::DesktopWindowTarget;
use windows::UI::Composition::{self as wuc, ContainerVisual};
use windows::Win32::System::WinRT::Composition::ICompositorDesktopInterop;

/// `Windows.UI.Composition` compositor living on the UI thread.
pub struct WinCompositor {
    ui: Arc<UiThread>,
    compositor: u64,
}

impl WinCompositor {
    pub fn new(ui: Arc<UiThread>) -> Result<Self> {
        let compositor = ui.call(|| {
            let compositor = wuc::Compositor::new().context("creating the compositor")?;
            Ok(apartment::store(compositor))
        })?;
        Ok(Self { ui, compositor })
    }
}

impl Compositor for WinCompositor {
    fn create_container_visual(&self) -> Result<Box<dyn Visual>> {
        let compositor = self.compositor;
        let id = self.ui.call(move || {
            let visual = apartment::get::<wuc::Compositor>(compositor)?.CreateContainerVisual()?;
            Ok(apartment::store(visual))
        })?;
        Ok(Box::new(WinVisual { id, ui: self.ui.clone() }))
    }

    fn create_desktop_target(&self, window: WindowId) -> Result<Box<dyn DesktopTarget>> {
        let compositor = self.compositor;
        let id = self.ui.call(move || {
            let interop: ICompositorDesktopInterop =
                apartment::get::<wuc::Compositor>(compositor)?.cast()?;
            let target = unsafe { interop.CreateDesktopWindowTarget(hwnd(window), false) }
                .context("CreateDesktopWindowTarget")?;
            Ok(apartment::store(target))
        })?;
        Ok(Box::new(WinDesktopTarget { id, ui: self.ui.clone() }))
    }
}

pub struct WinVisual {
    id: u64,
    ui: Arc<UiThread>,
}

impl WinVisual {
    fn update(
        &self,
        what: &str,
        f: impl FnOnce(&ContainerVisual) -> windows::core::Result<()> + Send + 'static,
    ) {
        let id = self.id;
        let result = self.ui.call(move || Ok(f(&apartment::get::<ContainerVisual>(id)?)?));
        if let Err(e) = result {
            log::warn!("WinVisual: {what} failed: {e:#}");
        }
    }
}

impl Visual for WinVisual {
    fn id(&self) -> VisualId {
        VisualId(self.id)
    }

    fn set_size(&mut self, width: f32, height: f32) {
        self.update("SetSize", move |v| v.SetSize(Vector2 { X: width, Y: height }));
    }

    fn set_relative_size(&mut self, width: f32, height: f32) {
        self.update("SetRelativeSizeAdjustment", move |v| {
            v.SetRelativeSizeAdjustment(Vector2 { X: width, Y: height })
        });
    }

    fn insert_at_top(&mut self, child: &dyn Visual) -> Result<()> {
        let (parent, child) = (self.id, child.id().0);
        self.ui.call(move || {
            let parent = apartment::get::<ContainerVisual>(parent)?;
            let child: wuc::Visual = apartment::get::<ContainerVisual>(child)?.cast()?;
            parent.Children()?.InsertAtTop(&child)?;
            Ok(())
        })
    }
}

impl Drop for WinVisual {
    fn drop(&mut self) {
        let id = self.id;
        let _ = self.ui.post(move || {
            if let Some(visual) = apartment::remove::<ContainerVisual>(id) {
                let _ = visual.Close();
            }
        });
    }
}

pub struct WinDesktopTarget {
    id: u64,
    ui: Arc<UiThread>,
}

impl DesktopTarget for WinDesktopTarget {
    fn set_root(&mut self, root: &dyn Visual) -> Result<()> {
        let (target, root) = (self.id, root.id().0);
        self.ui.call(move || {
            let root: wuc::Visual = apartment::get::<ContainerVisual>(root)?.cast()?;
            apartment::get::<DesktopWindowTarget>(target)?.SetRoot(&root)?;
            Ok(())
        })
    }
}

impl Drop for WinDesktopTarget {
    fn drop(&mut self) {
        let id = self.id;
        let _ = self.ui.post(move || {
            if let Some(target) = apartment::remove::<DesktopWindowTarget>(id) {
                let _ = target.Close();
            }
        });
    }
}

/// Visual stored under `id`, as the base `Visual` type a controller can target.
pub(crate) fn visual(id: VisualId) -> Result<wuc::Visual> {
    Ok(apartment::get::<ContainerVisual>(id.0)?.cast()?)
}
