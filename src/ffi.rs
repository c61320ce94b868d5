//! C ABI.
//!
//! A single process-wide [`Registry`] backs every `wvt_*` entry point. It lives in a
//! `lazy_static` together with the runtime its browser callbacks run on, and is never
//! dropped: `wvt_shutdown` tears the instances and the backend down, after which
//! `wvt_initialize` may be called again.
//!
//! On Windows the registry runs on the native platform (WebView2, Windows Graphics
//! Capture, Direct3D). Elsewhere it runs on the in-process software platform.
//!
//! Strings are NUL-terminated UTF-8. Results are [`ResultCode`] values.

use crate::engine::config::{InstanceParams, ToolkitConfig};
use crate::engine::errors::{ResultCode, ToolkitError};
use crate::engine::event_bridge::EventBridge;
use crate::engine::events::{
    DeviceEventType, KeyEvent, LogLevel, MouseButton, MouseEvent, MouseEventType,
};
use crate::engine::handle::InstanceHandle;
use crate::engine::registry::Registry;
use crate::engine::sink::{DeviceEventCallback, LogCallback, MessageCallback, NavigationCallback};
#[cfg(not(target_os = "windows"))]
use crate::platform::software::SoftwarePlatform as HostPlatform;
#[cfg(target_os = "windows")]
use crate::platform::windows::WindowsPlatform as HostPlatform;
use crate::render::backends::create_backend;
use crate::render::device::GraphicsApi;
use lazy_static::lazy_static;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub type LogCallbackFn = extern "C" fn(level: i32, message: *const c_char);
pub type NavigationCallbackFn = extern "C" fn(handle: u32, url: *const c_char, success: bool);
pub type MessageCallbackFn = extern "C" fn(handle: u32, message: *const c_char);
pub type DeviceEventCallbackFn = extern "C" fn(event: i32);

pub type RenderEventFn = extern "C" fn(event: i32);
pub type RenderEventAndDataFn = extern "C" fn(event: i32, data: *mut c_void);

lazy_static! {
    /// Runtime all browser callbacks share. One worker, so completions are serialized.
    static ref RUNTIME: Option<Runtime> = Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("wvt-browser")
        .enable_all()
        .build()
        .map_err(|e| log::error!("wvt: cannot start runtime: {e}"))
        .ok();

    static ref PLATFORM: Option<HostPlatform> = host_platform()
        .map_err(|e| log::error!("wvt: platform unavailable: {e:#}"))
        .ok();

    static ref BRIDGE: Option<EventBridge> = match (RUNTIME.as_ref(), PLATFORM.as_ref()) {
        (Some(rt), Some(platform)) => {
            let config = ToolkitConfig::default();
            let registry = Registry::new(platform.platform(), rt.handle().clone(), config);
            Some(EventBridge::new(registry))
        }
        _ => None,
    };
}

#[cfg(target_os = "windows")]
fn host_platform() -> anyhow::Result<HostPlatform> {
    HostPlatform::new()
}

#[cfg(not(target_os = "windows"))]
fn host_platform() -> anyhow::Result<HostPlatform> {
    Ok(HostPlatform::new())
}

fn registry() -> Option<&'static Registry> {
    BRIDGE.as_ref().map(|b| b.registry())
}

fn code<T>(res: &Result<T, ToolkitError>) -> i32 {
    ResultCode::from(res).as_i32()
}

fn with_registry(f: impl FnOnce(&Registry) -> Result<(), ToolkitError>) -> i32 {
    let res = match registry() {
        Some(registry) => f(registry),
        None => Err(ToolkitError::NotInitialized),
    };
    if let Err(e) = &res {
        log::debug!("wvt: call failed: {e}");
    }
    code(&res)
}

/// Borrow a C string. Null and invalid UTF-8 yield `None`.
fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn required_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, ToolkitError> {
    str_arg(ptr).ok_or_else(|| ToolkitError::Unknown(format!("{what} is null or not UTF-8")))
}

fn to_cstring(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

// ****************************************
// ** Callbacks

#[no_mangle]
pub extern "C" fn wvt_set_log_callback(callback: Option<LogCallbackFn>) {
    if let Some(registry) = registry() {
        registry.sink().set_log_callback(callback.map(|cb| {
            Arc::new(move |level: LogLevel, msg: &str| {
                cb(level as i32, to_cstring(msg).as_ptr())
            }) as LogCallback
        }));
    }
}

#[no_mangle]
pub extern "C" fn wvt_set_navigation_callback(callback: Option<NavigationCallbackFn>) {
    if let Some(registry) = registry() {
        registry.sink().set_navigation_callback(callback.map(|cb| {
            Arc::new(move |handle: InstanceHandle, url: &str, success: bool| {
                cb(handle.as_u32(), to_cstring(url).as_ptr(), success)
            }) as NavigationCallback
        }));
    }
}

#[no_mangle]
pub extern "C" fn wvt_set_message_callback(callback: Option<MessageCallbackFn>) {
    if let Some(registry) = registry() {
        registry.sink().set_message_callback(callback.map(|cb| {
            Arc::new(move |handle: InstanceHandle, msg: &str| {
                cb(handle.as_u32(), to_cstring(msg).as_ptr())
            }) as MessageCallback
        }));
    }
}

#[no_mangle]
pub extern "C" fn wvt_set_device_event_callback(callback: Option<DeviceEventCallbackFn>) {
    if let Some(registry) = registry() {
        registry
            .sink()
            .set_device_event_callback(callback.map(|cb| {
                Arc::new(move |event: DeviceEventType| cb(event as i32)) as DeviceEventCallback
            }));
    }
}

// ****************************************
// ** Lifecycle

#[no_mangle]
pub extern "C" fn wvt_initialize(graphics_api: i32) -> i32 {
    let _ = env_logger::try_init();

    with_registry(|registry| {
        let api = GraphicsApi::from_i32(graphics_api);
        if api == GraphicsApi::Unknown {
            return Err(ToolkitError::UnsupportedGraphicsApi(graphics_api));
        }
        let backend = create_backend(api, registry.platform().devices.clone())?;
        registry.initialize(backend)
    })
}

/// Hands over the device the host renders with. Call it before `wvt_initialize`;
/// without it the toolkit creates its own device on the default adapter.
///
/// Caller contract: `device` is the host's `ID3D11Device` or `ID3D12Device`, matching
/// `graphics_api`. For Direct3D 12, `command_queue` is the host's direct
/// `ID3D12CommandQueue`; otherwise it may be null.
#[cfg(target_os = "windows")]
#[no_mangle]
pub extern "C" fn wvt_set_graphics_device(
    graphics_api: i32,
    device: *mut c_void,
    command_queue: *mut c_void,
) -> i32 {
    let api = GraphicsApi::from_i32(graphics_api);
    let res = match PLATFORM.as_ref() {
        Some(platform) => unsafe { platform.devices().adopt(api, device, command_queue) }
            .map_err(|e| ToolkitError::DeviceCreationFailed(format!("{e:#}"))),
        None => Err(ToolkitError::NotInitialized),
    };
    if let Err(e) = &res {
        log::warn!("wvt: host device rejected: {e}");
    }
    code(&res)
}

#[no_mangle]
pub extern "C" fn wvt_shutdown() {
    if let Some(registry) = registry() {
        registry.shutdown();
    }
}

#[no_mangle]
pub extern "C" fn wvt_is_initialized() -> i32 {
    registry().map(|r| r.is_initialized() as i32).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn wvt_signal_shutting_down() {
    if let Some(registry) = registry() {
        registry.signal_shutting_down();
    }
}

// ****************************************
// ** Instances

/// Creates an instance and writes its handle to `out_handle`.
///
/// Caller contract: `user_data_folder` and `initial_url` are null or NUL-terminated
/// strings. A non-null `out_handle` points to a writable `u32`; null is rejected.
#[no_mangle]
pub extern "C" fn wvt_create_instance(
    width: u32,
    height: u32,
    user_data_folder: *const c_char,
    initial_url: *const c_char,
    enable_dev_tools: bool,
    out_handle: *mut u32,
) -> i32 {
    if out_handle.is_null() {
        return ResultCode::ErrorUnknown.as_i32();
    }

    let mut params = InstanceParams::new(width, height).with_dev_tools(enable_dev_tools);
    if let Some(folder) = str_arg(user_data_folder).filter(|s| !s.is_empty()) {
        params = params.with_user_data_folder(folder);
    }
    if let Some(url) = str_arg(initial_url).filter(|s| !s.is_empty()) {
        params = params.with_initial_url(url);
    }

    with_registry(|registry| {
        let handle = registry.create_instance(params)?;
        unsafe { *out_handle = handle.as_u32() };
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn wvt_destroy_instance(handle: u32) -> i32 {
    with_registry(|r| r.destroy_instance(handle.into()))
}

#[no_mangle]
pub extern "C" fn wvt_get_shared_texture_pointer(handle: u32) -> *mut c_void {
    registry()
        .map(|r| r.shared_texture_ptr(handle.into()))
        .unwrap_or(std::ptr::null_mut())
}

#[no_mangle]
pub extern "C" fn wvt_resize(handle: u32, width: u32, height: u32) -> i32 {
    with_registry(|r| r.resize(handle.into(), width, height))
}

#[no_mangle]
pub extern "C" fn wvt_get_instance_state(handle: u32) -> i32 {
    registry()
        .and_then(|r| r.instance_state(handle.into()))
        .map(|s| s.as_i32())
        .unwrap_or(-1)
}

// ****************************************
// ** Navigation

#[no_mangle]
pub extern "C" fn wvt_navigate(handle: u32, url: *const c_char) -> i32 {
    with_registry(|r| r.navigate(handle.into(), required_str(url, "url")?))
}

#[no_mangle]
pub extern "C" fn wvt_navigate_to_html(handle: u32, html: *const c_char) -> i32 {
    with_registry(|r| r.navigate_to_html(handle.into(), required_str(html, "html")?))
}

#[no_mangle]
pub extern "C" fn wvt_execute_script(handle: u32, script: *const c_char) -> i32 {
    with_registry(|r| r.execute_script(handle.into(), required_str(script, "script")?))
}

#[no_mangle]
pub extern "C" fn wvt_go_back(handle: u32) -> i32 {
    with_registry(|r| r.go_back(handle.into()))
}

#[no_mangle]
pub extern "C" fn wvt_go_forward(handle: u32) -> i32 {
    with_registry(|r| r.go_forward(handle.into()))
}

#[no_mangle]
pub extern "C" fn wvt_can_go_back(handle: u32) -> i32 {
    registry().map(|r| r.can_go_back(handle.into()) as i32).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn wvt_can_go_forward(handle: u32) -> i32 {
    registry().map(|r| r.can_go_forward(handle.into()) as i32).unwrap_or(0)
}

// ****************************************
// ** Input

#[no_mangle]
pub extern "C" fn wvt_send_mouse_event(
    handle: u32,
    event_type: i32,
    button: i32,
    x: f32,
    y: f32,
    wheel_delta: f32,
) -> i32 {
    with_registry(|r| {
        let kind = MouseEventType::from_i32(event_type)
            .ok_or_else(|| {
                ToolkitError::Unknown(format!("unknown mouse event type {event_type}"))
            })?;
        let event = MouseEvent {
            kind,
            button: MouseButton::from_i32(button),
            x,
            y,
            wheel_delta,
        };
        r.send_mouse_event(handle.into(), &event)
    })
}

#[no_mangle]
pub extern "C" fn wvt_send_key_event(
    handle: u32,
    virtual_key: u32,
    scan_code: u32,
    is_down: bool,
    is_system_key: bool,
) -> i32 {
    let event = KeyEvent {
        virtual_key,
        scan_code,
        is_down,
        is_system_key,
    };
    with_registry(|r| r.send_key_event(handle.into(), &event))
}

// ****************************************
// ** Rendering

#[no_mangle]
pub extern "C" fn wvt_update_textures() {
    if let Some(registry) = registry() {
        registry.update_all_textures();
    }
}

#[no_mangle]
pub extern "C" fn wvt_update_texture(handle: u32) {
    if let Some(registry) = registry() {
        registry.update_texture(handle.into());
    }
}

extern "C" fn on_render_event(event: i32) {
    if let Some(bridge) = BRIDGE.as_ref() {
        bridge.on_render_event_id(event, None);
    }
}

extern "C" fn on_render_event_and_data(event: i32, data: *mut c_void) {
    let Some(bridge) = BRIDGE.as_ref() else { return };
    if data.is_null() {
        return;
    }
    let handle = unsafe { *(data as *const u32) };
    bridge.on_render_event_id(event, Some(handle.into()));
}

#[no_mangle]
pub extern "C" fn wvt_get_render_event_func() -> RenderEventFn {
    on_render_event
}

/// Render callback whose `data` points to the `u32` handle of the instance to update.
#[no_mangle]
pub extern "C" fn wvt_get_render_event_and_data_func() -> RenderEventAndDataFn {
    on_render_event_and_data
}

#[no_mangle]
pub extern "C" fn wvt_on_graphics_device_event(event: i32) {
    if let Some(bridge) = BRIDGE.as_ref() {
        bridge.on_device_event_id(event);
    }
}

// These run against the software platform
#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;
    use crate::engine::instance::InstanceState;
    use crate::platform::software::World;
    use crate::render::device::GraphicsApi;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    // The C ABI drives one global registry
    lazy_static! {
        static ref SERIAL: Mutex<()> = Mutex::new(());
    }

    static NAVIGATIONS: AtomicU32 = AtomicU32::new(0);

    fn world() -> &'static Arc<World> {
        PLATFORM.as_ref().expect("software platform").world()
    }

    extern "C" fn count_navigation(_handle: u32, url: *const c_char, success: bool) {
        if success && !url.is_null() {
            NAVIGATIONS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn full_lifecycle_through_c_abi() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let folder = CString::new(dir.path().to_str().unwrap()).unwrap();

        wvt_set_navigation_callback(Some(count_navigation));
        assert_eq!(wvt_initialize(GraphicsApi::Direct3D12 as i32), 0);
        assert_eq!(
            wvt_initialize(GraphicsApi::Direct3D12 as i32),
            ResultCode::ErrorAlreadyInitialized as i32
        );
        assert_eq!(wvt_is_initialized(), 1);

        let mut handle = 0u32;
        let no_url = std::ptr::null();
        let rc = wvt_create_instance(200, 200, folder.as_ptr(), no_url, false, &mut handle);
        assert_eq!(rc, 0);
        assert!(handle >= 1);
        assert!(!wvt_get_shared_texture_pointer(handle).is_null());

        assert!(wait_for(|| wvt_get_instance_state(handle) == InstanceState::Ready as i32));
        assert!(wait_for(|| NAVIGATIONS.load(Ordering::SeqCst) >= 1));

        let url = CString::new("about:test").unwrap();
        assert_eq!(wvt_navigate(handle, url.as_ptr()), 0);
        assert!(wait_for(|| NAVIGATIONS.load(Ordering::SeqCst) >= 2));
        assert_eq!(wvt_can_go_back(handle), 0);
        assert_eq!(wvt_navigate(handle, std::ptr::null()), ResultCode::ErrorUnknown as i32);

        let html = CString::new("<h1>inline</h1>").unwrap();
        assert_eq!(wvt_navigate_to_html(handle, html.as_ptr()), 0);
        assert!(wait_for(|| NAVIGATIONS.load(Ordering::SeqCst) >= 3));
        assert_eq!(wvt_can_go_back(handle), 1);
        assert_eq!(wvt_go_back(handle), 0);
        assert!(wait_for(|| wvt_can_go_forward(handle) == 1));
        assert_eq!(wvt_go_forward(handle), 0);
        assert!(wait_for(|| wvt_can_go_forward(handle) == 0));
        assert_eq!(wvt_navigate_to_html(handle, std::ptr::null()), ResultCode::ErrorUnknown as i32);

        let before = wvt_get_shared_texture_pointer(handle);
        assert_eq!(wvt_resize(handle, 500, 400), 0);
        assert_ne!(wvt_get_shared_texture_pointer(handle), before);

        assert_eq!(wvt_send_mouse_event(handle, 1, 1, 0.5, 0.5, 0.0), 0);
        assert_eq!(
            wvt_send_mouse_event(handle, 9, 1, 0.5, 0.5, 0.0),
            ResultCode::ErrorUnknown as i32
        );
        assert_eq!(wvt_send_key_event(handle, 0x41, 0x1e, true, false), 0);

        let render = wvt_get_render_event_and_data_func();
        let mut target = handle;
        render(2, &mut target as *mut u32 as *mut c_void);
        wvt_get_render_event_func()(2);

        wvt_on_graphics_device_event(2);
        assert_eq!(wvt_get_instance_state(handle), InstanceState::Error as i32);
        wvt_on_graphics_device_event(3);
        assert_eq!(wvt_get_instance_state(handle), InstanceState::Ready as i32);

        assert_eq!(wvt_destroy_instance(handle), 0);
        assert_eq!(wvt_destroy_instance(handle), ResultCode::ErrorInvalidHandle as i32);
        assert_eq!(wvt_get_instance_state(handle), -1);

        wvt_shutdown();
        assert_eq!(wvt_is_initialized(), 0);
        wvt_set_navigation_callback(None);
    }

    #[test]
    fn rejects_bad_arguments() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(wvt_initialize(7), ResultCode::ErrorUnsupportedGraphicsApi as i32);
        let null = std::ptr::null();
        assert_eq!(
            wvt_create_instance(10, 10, null, null, false, std::ptr::null_mut()),
            ResultCode::ErrorUnknown as i32
        );
        assert!(wvt_get_shared_texture_pointer(12345).is_null());
        assert_eq!(wvt_can_go_forward(12345), 0);
    }

    #[test]
    fn commands_wait_for_ready_instance() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(wvt_initialize(GraphicsApi::Direct3D11 as i32), 0);
        // Browser never comes up, so the instance never leaves the creation path
        world().switches.environment.store(true, Ordering::SeqCst);

        let mut handle = 0u32;
        assert_eq!(
            wvt_create_instance(10, 10, std::ptr::null(), std::ptr::null(), false, &mut handle),
            0
        );
        let html = CString::new("<p>early</p>").unwrap();
        assert!(wait_for(|| wvt_get_instance_state(handle) == InstanceState::Error as i32));
        let not_ready = ResultCode::ErrorNotInitialized as i32;
        assert_eq!(wvt_navigate_to_html(handle, html.as_ptr()), not_ready);
        assert_eq!(wvt_go_forward(handle), not_ready);
        world().switches.environment.store(false, Ordering::SeqCst);

        assert_eq!(wvt_go_forward(4242), ResultCode::ErrorInvalidHandle as i32);
        assert_eq!(
            wvt_navigate_to_html(4242, html.as_ptr()),
            ResultCode::ErrorInvalidHandle as i32
        );
        wvt_shutdown();
        assert_eq!(wvt_go_forward(handle), ResultCode::ErrorNotInitialized as i32);
    }

    #[test]
    fn shutdown_signal_blocks_entry_points() {
        let _guard = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(wvt_initialize(GraphicsApi::Direct3D11 as i32), 0);
        wvt_signal_shutting_down();

        let mut handle = 0u32;
        assert_eq!(
            wvt_create_instance(10, 10, std::ptr::null(), std::ptr::null(), false, &mut handle),
            ResultCode::ErrorNotInitialized as i32
        );
        assert_eq!(wvt_is_initialized(), 0);
        wvt_update_textures();
        wvt_shutdown();
    }
}
