//! WebView2 composition controllers.
//!
//! All WebView2 calls happen on the UI thread. Events are forwarded to a tokio task
//! before they reach the registered handlers, so a handler that calls back into the
//! toolkit never runs on the UI thread while another thread waits for it.

use super::apartment::{self, Completion, UiThread};
use super::composition;
use super::window::hwnd;
use crate::engine::config::BrowserSettings;
use crate::platform::browser::{
    BrowserEnvironment, BrowserFactory, CompositionController, EnvironmentOptions, MouseEventKind,
    MouseInput, NavigationCompleted, NavigationCompletedHandler, WebMessageHandler,
};
use crate::platform::composition::VisualId;
use crate::platform::window::WindowId;
use crate::render::Viewport;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use webview2_com::Microsoft::Web::WebView2::Win32::{
    CreateCoreWebView2EnvironmentWithOptions, ICoreWebView2, ICoreWebView2CompositionController,
    ICoreWebView2Controller, ICoreWebView2Environment3, ICoreWebView2EnvironmentOptions,
    COREWEBVIEW2_MOUSE_EVENT_KIND, COREWEBVIEW2_MOUSE_EVENT_KIND_LEAVE,
    COREWEBVIEW2_MOUSE_EVENT_KIND_LEFT_BUTTON_DOWN, COREWEBVIEW2_MOUSE_EVENT_KIND_LEFT_BUTTON_UP,
    COREWEBVIEW2_MOUSE_EVENT_KIND_MIDDLE_BUTTON_DOWN,
    COREWEBVIEW2_MOUSE_EVENT_KIND_MIDDLE_BUTTON_UP, COREWEBVIEW2_MOUSE_EVENT_KIND_MOVE,
    COREWEBVIEW2_MOUSE_EVENT_KIND_RIGHT_BUTTON_DOWN, COREWEBVIEW2_MOUSE_EVENT_KIND_RIGHT_BUTTON_UP,
    COREWEBVIEW2_MOUSE_EVENT_KIND_WHEEL, COREWEBVIEW2_MOUSE_EVENT_VIRTUAL_KEYS,
};
use webview2_com::{
    take_pwstr, CoreWebView2EnvironmentOptions,
    CreateCoreWebView2CompositionControllerCompletedHandler,
    CreateCoreWebView2EnvironmentCompletedHandler, NavigationCompletedEventHandler,
    WebMessageReceivedEventHandler,
};
use windows::core::{Error, IUnknown, Interface, BOOL, HSTRING, PCWSTR, PWSTR};
use windows::Win32::Foundation::{E_FAIL, POINT, RECT};

/// Creates WebView2 environments on the UI thread.
pub struct WebView2Browser {
    ui: Arc<UiThread>,
}

impl WebView2Browser {
    pub fn new(ui: Arc<UiThread>) -> Self {
        Self { ui }
    }
}

impl BrowserFactory for WebView2Browser {
    fn create_environment(
        &self,
        options: EnvironmentOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn BrowserEnvironment>>> {
        let ui = self.ui.clone();
        let folder = HSTRING::from(options.user_data_folder.as_os_str());

        let created = self.ui.call_async(move |completion: Completion<u64>| {
            let handler = CreateCoreWebView2EnvironmentCompletedHandler::create(Box::new(
                move |result, environment| {
                    let outcome = result
                        .and_then(|_| environment.ok_or_else(|| Error::from(E_FAIL)))
                        .and_then(|env| env.cast::<ICoreWebView2Environment3>())
                        .map(apartment::store)
                        .map_err(|e| anyhow!("WebView2 environment creation failed: {e}"));
                    completion.complete(outcome);
                    Ok(())
                },
            ));
            let options = CoreWebView2EnvironmentOptions::default();
            unsafe {
                CreateCoreWebView2EnvironmentWithOptions(
                    PCWSTR::null(),
                    &folder,
                    &ICoreWebView2EnvironmentOptions::from(options),
                    &handler,
                )
            }
            .context("CreateCoreWebView2EnvironmentWithOptions")
        });

        async move {
            let id = created.await?;
            Ok(Arc::new(WebView2Environment { id, ui }) as Arc<dyn BrowserEnvironment>)
        }
        .boxed()
    }
}

pub struct WebView2Environment {
    id: u64,
    ui: Arc<UiThread>,
}

/// Interfaces of one browser session, kept on the UI thread.
#[derive(Clone)]
struct Session {
    composition: ICoreWebView2CompositionController,
    controller: ICoreWebView2Controller,
    webview: ICoreWebView2,
}

impl BrowserEnvironment for WebView2Environment {
    fn create_composition_controller(
        &self,
        window: WindowId,
    ) -> BoxFuture<'static, Result<Box<dyn CompositionController>>> {
        let ui = self.ui.clone();
        let environment = self.id;

        let created = self.ui.call_async(move |completion: Completion<u64>| {
            let handler = CreateCoreWebView2CompositionControllerCompletedHandler::create(Box::new(
                move |result, composition| {
                    let outcome = result
                        .and_then(|_| composition.ok_or_else(|| Error::from(E_FAIL)))
                        .and_then(|composition| {
                            let controller: ICoreWebView2Controller = composition.cast()?;
                            let webview = unsafe { controller.CoreWebView2() }?;
                            Ok(apartment::store(Session { composition, controller, webview }))
                        })
                        .map_err(|e| anyhow!("WebView2 controller creation failed: {e}"));
                    completion.complete(outcome);
                    Ok(())
                },
            ));
            let environment = apartment::get::<ICoreWebView2Environment3>(environment)?;
            unsafe { environment.CreateCoreWebView2CompositionController(hwnd(window), &handler) }
                .context("CreateCoreWebView2CompositionController")
        });

        async move {
            let id = created.await?;
            let runtime = Handle::try_current()
                .context("controllers need a tokio runtime for their events")?;
            let controller = WebView2Controller {
                id,
                ui,
                runtime,
                tokens: Vec::new(),
            };
            Ok(Box::new(controller) as Box<dyn CompositionController>)
        }
        .boxed()
    }
}

impl Drop for WebView2Environment {
    fn drop(&mut self) {
        let id = self.id;
        let _ = self.ui.post(move || {
            apartment::remove::<ICoreWebView2Environment3>(id);
        });
    }
}

#[derive(Debug, Copy, Clone)]
enum EventKind {
    NavigationCompleted,
    WebMessageReceived,
}

pub struct WebView2Controller {
    id: u64,
    ui: Arc<UiThread>,
    runtime: Handle,
    tokens: Vec<(EventKind, i64)>,
}

impl WebView2Controller {
    fn with_session<R: Send + 'static>(
        &self,
        f: impl FnOnce(&Session) -> Result<R> + Send + 'static,
    ) -> Result<R> {
        let id = self.id;
        self.ui.call(move || f(&apartment::get::<Session>(id)?))
    }

    /// Forwards UI-thread events to `deliver` on the runtime.
    fn forward<T: Send + 'static>(
        &self,
        deliver: impl Fn(T) + Send + Sync + 'static,
    ) -> mpsc::UnboundedSender<T> {
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(event);
            }
        });
        tx
    }
}

fn mouse_kind(kind: MouseEventKind) -> COREWEBVIEW2_MOUSE_EVENT_KIND {
    match kind {
        MouseEventKind::Move => COREWEBVIEW2_MOUSE_EVENT_KIND_MOVE,
        MouseEventKind::LeftButtonDown => COREWEBVIEW2_MOUSE_EVENT_KIND_LEFT_BUTTON_DOWN,
        MouseEventKind::LeftButtonUp => COREWEBVIEW2_MOUSE_EVENT_KIND_LEFT_BUTTON_UP,
        MouseEventKind::RightButtonDown => COREWEBVIEW2_MOUSE_EVENT_KIND_RIGHT_BUTTON_DOWN,
        MouseEventKind::RightButtonUp => COREWEBVIEW2_MOUSE_EVENT_KIND_RIGHT_BUTTON_UP,
        MouseEventKind::MiddleButtonDown => COREWEBVIEW2_MOUSE_EVENT_KIND_MIDDLE_BUTTON_DOWN,
        MouseEventKind::MiddleButtonUp => COREWEBVIEW2_MOUSE_EVENT_KIND_MIDDLE_BUTTON_UP,
        MouseEventKind::Wheel => COREWEBVIEW2_MOUSE_EVENT_KIND_WHEEL,
        MouseEventKind::Leave => COREWEBVIEW2_MOUSE_EVENT_KIND_LEAVE,
    }
}

impl CompositionController for WebView2Controller {
    fn apply_settings(&mut self, settings: &BrowserSettings) -> Result<()> {
        let settings = *settings;
        self.with_session(move |s| unsafe {
            let native = s.webview.Settings()?;
            native.SetAreDevToolsEnabled(settings.dev_tools_enabled)?;
            native.SetAreDefaultContextMenusEnabled(settings.default_context_menus_enabled)?;
            native.SetIsZoomControlEnabled(settings.zoom_control_enabled)?;
            native.SetIsStatusBarEnabled(settings.status_bar_enabled)?;
            Ok(())
        })
    }

    fn set_bounds(&mut self, bounds: Viewport) -> Result<()> {
        let rect = RECT {
            left: bounds.x,
            top: bounds.y,
            right: bounds.x + bounds.width as i32,
            bottom: bounds.y + bounds.height as i32,
        };
        self.with_session(move |s| Ok(unsafe { s.controller.SetBounds(rect) }?))
    }

    fn set_visible(&mut self, visible: bool) -> Result<()> {
        self.with_session(move |s| Ok(unsafe { s.controller.SetIsVisible(visible) }?))
    }

    fn set_root_visual_target(&mut self, visual: Option<VisualId>) -> Result<()> {
        self.with_session(move |s| {
            match visual {
                Some(id) => {
                    let target: IUnknown = composition::visual(id)?.cast()?;
                    unsafe { s.composition.SetRootVisualTarget(&target) }?
                }
                None => unsafe { s.composition.SetRootVisualTarget(None::<&IUnknown>) }?,
            }
            Ok(())
        })
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let url = HSTRING::from(url);
        self.with_session(move |s| Ok(unsafe { s.webview.Navigate(&url) }?))
    }

    fn navigate_to_string(&mut self, html: &str) -> Result<()> {
        let html = HSTRING::from(html);
        self.with_session(move |s| Ok(unsafe { s.webview.NavigateToString(&html) }?))
    }

    fn execute_script(&mut self, script: &str) -> Result<()> {
        let script = HSTRING::from(script);
        self.with_session(move |s| Ok(unsafe { s.webview.ExecuteScript(&script, None) }?))
    }

    fn go_back(&mut self) -> Result<()> {
        self.with_session(|s| Ok(unsafe { s.webview.GoBack() }?))
    }

    fn go_forward(&mut self) -> Result<()> {
        self.with_session(|s| Ok(unsafe { s.webview.GoForward() }?))
    }

    fn can_go_back(&self) -> bool {
        self.with_session(|s| {
            let mut can = BOOL::default();
            unsafe { s.webview.CanGoBack(&mut can) }?;
            Ok(can.as_bool())
        })
        .unwrap_or(false)
    }

    fn can_go_forward(&self) -> bool {
        self.with_session(|s| {
            let mut can = BOOL::default();
            unsafe { s.webview.CanGoForward(&mut can) }?;
            Ok(can.as_bool())
        })
        .unwrap_or(false)
    }

    fn send_mouse_input(&mut self, input: MouseInput) -> Result<()> {
        let kind = mouse_kind(input.kind);
        let keys = COREWEBVIEW2_MOUSE_EVENT_VIRTUAL_KEYS(input.virtual_keys.bits() as i32);
        let point = POINT { x: input.x, y: input.y };
        let data = input.mouse_data as u32;
        self.with_session(move |s| {
            Ok(unsafe { s.composition.SendMouseInput(kind, keys, data, point) }?)
        })
    }

    fn on_navigation_completed(&mut self, handler: NavigationCompletedHandler) {
        let tx = self.forward(handler);
        let registered = self.with_session(move |s| {
            let webview = s.webview.clone();
            let handler = NavigationCompletedEventHandler::create(Box::new(move |_, args| {
                let Some(args) = args else {
                    return Ok(());
                };
                let mut success = BOOL::default();
                let mut source = PWSTR::null();
                unsafe {
                    args.IsSuccess(&mut success)?;
                    webview.Source(&mut source)?;
                }
                let _ = tx.send(NavigationCompleted {
                    url: take_pwstr(source),
                    success: success.as_bool(),
                });
                Ok(())
            }));
            let mut token = 0i64;
            unsafe { s.webview.add_NavigationCompleted(&handler, &mut token) }?;
            Ok(token)
        });

        match registered {
            Ok(token) => self.tokens.push((EventKind::NavigationCompleted, token)),
            Err(e) => log::warn!("WebView2Controller: navigation handler not registered: {e:#}"),
        }
    }

    fn on_web_message_received(&mut self, handler: WebMessageHandler) {
        let tx = self.forward(handler);
        let registered = self.with_session(move |s| {
            let handler = WebMessageReceivedEventHandler::create(Box::new(move |_, args| {
                let Some(args) = args else {
                    return Ok(());
                };
                let mut message = PWSTR::null();
                // Non-string messages are not forwarded
                if unsafe { args.TryGetWebMessageAsString(&mut message) }.is_ok() {
                    let _ = tx.send(take_pwstr(message));
                }
                Ok(())
            }));
            let mut token = 0i64;
            unsafe { s.webview.add_WebMessageReceived(&handler, &mut token) }?;
            Ok(token)
        });

        match registered {
            Ok(token) => self.tokens.push((EventKind::WebMessageReceived, token)),
            Err(e) => log::warn!("WebView2Controller: message handler not registered: {e:#}"),
        }
    }

    fn close(&mut self) {
        let (id, tokens) = (self.id, std::mem::take(&mut self.tokens));
        let closed = self.ui.call(move || {
            let Some(session) = apartment::remove::<Session>(id) else {
                return Ok(());
            };
            unsafe {
                for (kind, token) in tokens {
                    let _ = match kind {
                        EventKind::NavigationCompleted => {
                            session.webview.remove_NavigationCompleted(token)
                        }
                        EventKind::WebMessageReceived => {
                            session.webview.remove_WebMessageReceived(token)
                        }
                    };
                }
                session.controller.Close()?;
            }
            Ok(())
        });
        if let Err(e) = closed {
            log::warn!("WebView2Controller: close failed: {e:#}");
        }
    }
}

impl Drop for WebView2Controller {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_kinds_map_to_controller_kinds() {
        assert_eq!(mouse_kind(MouseEventKind::Move), COREWEBVIEW2_MOUSE_EVENT_KIND_MOVE);
        assert_eq!(mouse_kind(MouseEventKind::Wheel), COREWEBVIEW2_MOUSE_EVENT_KIND_WHEEL);
        assert_eq!(mouse_kind(MouseEventKind::Leave), COREWEBVIEW2_MOUSE_EVENT_KIND_LEAVE);
        assert_eq!(
            mouse_kind(MouseEventKind::MiddleButtonUp),
            COREWEBVIEW2_MOUSE_EVENT_KIND_MIDDLE_BUTTON_UP
        );
    }
}
