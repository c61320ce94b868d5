use super::apartment::UiThread;
use crate::platform::window::{HiddenWindow, WindowId, WindowMessage, Windowing};
use anyhow::{Context, Result};
use std::ffi::c_void;
use std::sync::Arc;
use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{COLORREF, HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, GetSystemMetrics, PostMessageW, RegisterClassW,
    SetLayeredWindowAttributes, SetWindowPos, ShowWindow, LWA_ALPHA, SM_CXSCREEN, SWP_NOACTIVATE,
    SWP_NOMOVE, SWP_NOZORDER, SW_SHOWNOACTIVATE, WNDCLASSW, WS_EX_LAYERED, WS_EX_NOACTIVATE,
    WS_EX_TOOLWINDOW, WS_EX_TRANSPARENT, WS_POPUP,
};

const CLASS_NAME: PCWSTR = w!("WebViewToolkitHiddenWindow");

pub(crate) fn hwnd(window: WindowId) -> HWND {
    HWND(window.0 as usize as *mut c_void)
}

/// Creates popup windows just off the right edge of the primary screen.
///
/// The windows are shown (capture ignores hidden windows) but almost fully transparent,
/// never activate and let input fall through.
pub struct Win32Windowing {
    ui: Arc<UiThread>,
}

impl Win32Windowing {
    pub fn new(ui: Arc<UiThread>) -> Self {
        Self { ui }
    }
}

impl Windowing for Win32Windowing {
    fn create_hidden_window(&self, width: u32, height: u32) -> Result<Box<dyn HiddenWindow>> {
        let id = self.ui.call(move || create_window(width, height))?;
        log::debug!("Win32Windowing: created window {id:#x} ({width}x{height})");
        Ok(Box::new(Win32Window {
            id: WindowId(id),
            ui: self.ui.clone(),
            destroyed: false,
        }))
    }
}

fn create_window(width: u32, height: u32) -> Result<u64> {
    unsafe {
        let instance = GetModuleHandleW(PCWSTR::null()).context("GetModuleHandleW")?;
        let class = WNDCLASSW {
            lpfnWndProc: Some(window_proc),
            hInstance: instance.into(),
            lpszClassName: CLASS_NAME,
            ..Default::default()
        };
        // Fails once the class exists, which is fine
        let _ = RegisterClassW(&class);

        let hwnd = CreateWindowExW(
            WS_EX_TOOLWINDOW | WS_EX_NOACTIVATE | WS_EX_LAYERED | WS_EX_TRANSPARENT,
            CLASS_NAME,
            w!("WebViewToolkit"),
            WS_POPUP,
            GetSystemMetrics(SM_CXSCREEN) + 100,
            0,
            width as i32,
            height as i32,
            None,
            None,
            Some(instance.into()),
            None,
        )
        .context("CreateWindowExW")?;

        SetLayeredWindowAttributes(hwnd, COLORREF(0), 1, LWA_ALPHA)
            .context("SetLayeredWindowAttributes")?;
        let _ = ShowWindow(hwnd, SW_SHOWNOACTIVATE);
        Ok(hwnd.0 as usize as u64)
    }
}

extern "system" fn window_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) }
}

pub struct Win32Window {
    id: WindowId,
    ui: Arc<UiThread>,
    destroyed: bool,
}

impl HiddenWindow for Win32Window {
    fn id(&self) -> WindowId {
        self.id
    }

    fn set_size(&mut self, width: u32, height: u32) -> Result<()> {
        let id = self.id;
        self.ui.call(move || {
            let flags = SWP_NOMOVE | SWP_NOZORDER | SWP_NOACTIVATE;
            unsafe { SetWindowPos(hwnd(id), None, 0, 0, width as i32, height as i32, flags) }
                .context("SetWindowPos")
        })
    }

    fn post_message(&self, message: WindowMessage) -> Result<()> {
        unsafe {
            PostMessageW(
                Some(hwnd(self.id)),
                message.msg,
                WPARAM(message.wparam),
                LPARAM(message.lparam),
            )
        }
        .context("PostMessageW")
    }

    fn destroy(&mut self) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }
        let id = self.id;
        let result = self
            .ui
            .call(move || unsafe { DestroyWindow(hwnd(id)) }.context("DestroyWindow"));
        if let Err(e) = result {
            log::warn!("Win32Window: {e:#}");
        }
    }
}

impl Drop for Win32Window {
    fn drop(&mut self) {
        self.destroy();
    }
}
