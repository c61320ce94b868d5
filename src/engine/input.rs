//! Translation of host input into what the browser session and the hidden window accept.
//!
//! Mouse events arrive with normalized `[0, 1]` coordinates (origin top-left) and become
//! pixel-space [`MouseInput`]s for the composition controller. Keyboard events become
//! low-level key messages posted to the hidden window.

use crate::engine::events::{KeyEvent, MouseButton, MouseEvent, MouseEventType};
use crate::platform::browser::{MouseEventKind, MouseInput, VirtualKeys};
use crate::platform::window::{WindowMessage, WM_KEYDOWN, WM_KEYUP, WM_SYSKEYDOWN, WM_SYSKEYUP};

const KEY_UP_FLAGS: isize = (1 << 30) | (1 << 31);

/// Converts a host mouse event into controller input for a `width` x `height` instance.
pub fn map_mouse_event(
    event: &MouseEvent,
    width: u32,
    height: u32,
    wheel_delta: i32,
) -> MouseInput {
    let x = (event.x.clamp(0.0, 1.0) * width as f32) as i32;
    let y = (event.y.clamp(0.0, 1.0) * height as f32) as i32;

    let (kind, virtual_keys, mouse_data) = match event.kind {
        MouseEventType::Move => (MouseEventKind::Move, VirtualKeys::empty(), 0),
        MouseEventType::Down => {
            let (kind, keys) = match event.button {
                MouseButton::Left => (MouseEventKind::LeftButtonDown, VirtualKeys::LEFT_BUTTON),
                MouseButton::Right => (MouseEventKind::RightButtonDown, VirtualKeys::RIGHT_BUTTON),
                MouseButton::Middle | MouseButton::None => {
                    (MouseEventKind::MiddleButtonDown, VirtualKeys::MIDDLE_BUTTON)
                }
            };
            (kind, keys, 0)
        }
        MouseEventType::Up => {
            let kind = match event.button {
                MouseButton::Left => MouseEventKind::LeftButtonUp,
                MouseButton::Right => MouseEventKind::RightButtonUp,
                MouseButton::Middle | MouseButton::None => MouseEventKind::MiddleButtonUp,
            };
            (kind, VirtualKeys::empty(), 0)
        }
        // Host wheel is positive towards the user
        MouseEventType::Wheel => (
            MouseEventKind::Wheel,
            VirtualKeys::empty(),
            -(event.wheel_delta * wheel_delta as f32) as i32,
        ),
        MouseEventType::Leave => (MouseEventKind::Leave, VirtualKeys::empty(), 0),
    };

    MouseInput {
        kind,
        virtual_keys,
        mouse_data,
        x,
        y,
    }
}

/// Converts a host key event into the key message posted to the hidden window.
pub fn map_key_event(event: &KeyEvent) -> WindowMessage {
    let msg = match (event.is_system_key, event.is_down) {
        (false, true) => WM_KEYDOWN,
        (false, false) => WM_KEYUP,
        (true, true) => WM_SYSKEYDOWN,
        (true, false) => WM_SYSKEYUP,
    };

    // Repeat count of one, scan code in bits 16-23
    let mut lparam = 1isize | ((event.scan_code as isize) << 16);
    if !event.is_down {
        lparam |= KEY_UP_FLAGS;
    }

    WindowMessage {
        msg,
        wparam: event.virtual_key as usize,
        lparam,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mouse(kind: MouseEventType, button: MouseButton, x: f32, y: f32, wheel: f32) -> MouseEvent {
        MouseEvent {
            kind,
            button,
            x,
            y,
            wheel_delta: wheel,
        }
    }

    #[test]
    fn coordinates_scale_with_size() {
        let event = mouse(MouseEventType::Move, MouseButton::None, 0.5, 0.25, 0.0);
        let input = map_mouse_event(&event, 200, 100, 120);
        assert_eq!(input.kind, MouseEventKind::Move);
        assert_eq!((input.x, input.y), (100, 25));
    }

    #[test]
    fn coordinates_are_clamped() {
        let event = mouse(MouseEventType::Move, MouseButton::None, -0.5, 1.5, 0.0);
        let input = map_mouse_event(&event, 200, 100, 120);
        assert_eq!((input.x, input.y), (0, 100));
    }

    fn map_small(kind: MouseEventType, button: MouseButton, wheel: f32) -> MouseInput {
        map_mouse_event(&mouse(kind, button, 0.0, 0.0, wheel), 10, 10, 120)
    }

    #[test]
    fn buttons() {
        let down = map_small(MouseEventType::Down, MouseButton::Left, 0.0);
        assert_eq!(down.kind, MouseEventKind::LeftButtonDown);
        assert_eq!(down.virtual_keys, VirtualKeys::LEFT_BUTTON);

        let down = map_small(MouseEventType::Down, MouseButton::Right, 0.0);
        assert_eq!(down.virtual_keys, VirtualKeys::RIGHT_BUTTON);

        let up = map_small(MouseEventType::Up, MouseButton::Right, 0.0);
        assert_eq!(up.kind, MouseEventKind::RightButtonUp);
        assert!(up.virtual_keys.is_empty());

        // No button falls back to middle
        let down = map_small(MouseEventType::Down, MouseButton::None, 0.0);
        assert_eq!(down.kind, MouseEventKind::MiddleButtonDown);
        assert_eq!(down.virtual_keys, VirtualKeys::MIDDLE_BUTTON);
    }

    #[test]
    fn wheel_is_inverted_and_scaled() {
        let input = map_small(MouseEventType::Wheel, MouseButton::None, 1.0);
        assert_eq!(input.kind, MouseEventKind::Wheel);
        assert_eq!(input.mouse_data, -120);

        let input = map_small(MouseEventType::Wheel, MouseButton::None, -0.5);
        assert_eq!(input.mouse_data, 60);
    }

    #[test]
    fn key_messages() {
        let down = map_key_event(&KeyEvent {
            virtual_key: 0x41,
            scan_code: 0x1e,
            is_down: true,
            is_system_key: false,
        });
        assert_eq!(down.msg, WM_KEYDOWN);
        assert_eq!(down.wparam, 0x41);
        assert_eq!(down.lparam, 1 | (0x1e << 16));

        let up = map_key_event(&KeyEvent {
            virtual_key: 0x41,
            scan_code: 0x1e,
            is_down: false,
            is_system_key: false,
        });
        assert_eq!(up.msg, WM_KEYUP);
        assert_eq!(up.lparam, 1 | (0x1e << 16) | (1 << 30) | (1 << 31));

        let sys = map_key_event(&KeyEvent {
            virtual_key: 0x12,
            scan_code: 0x38,
            is_down: true,
            is_system_key: true,
        });
        assert_eq!(sys.msg, WM_SYSKEYDOWN);

        let sys_up = map_key_event(&KeyEvent {
            virtual_key: 0x12,
            scan_code: 0x38,
            is_down: false,
            is_system_key: true,
        });
        assert_eq!(sys_up.msg, WM_SYSKEYUP);
    }
}
