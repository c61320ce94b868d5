//! Toolkit event types.
//!
//! This module defines the input and lifecycle enums shared between the host, the
//! registry and the instances, together with the [`ToolkitEvent`]s published on the
//! registry's broadcast bus.
//!
//! # Main Types
//!
//! - [`MouseEventType`] / [`MouseButton`]: mouse input as sent by the host.
//! - [`KeyEvent`]: raw keyboard input as sent by the host.
//! - [`DeviceEventType`]: graphics device lost / restored notifications.
//! - [`RenderEventType`]: events the host issues from its render thread.
//! - [`HostDeviceEvent`]: graphics device lifecycle events as reported by the host.
//! - [`LogLevel`]: severity passed to the host log callback.
//! - [`ToolkitEvent`]: events emitted by the toolkit.
//!
//! All enums carry the numeric ids used across the C boundary.

use crate::engine::handle::InstanceHandle;
use crate::engine::instance::InstanceState;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Kind of mouse event sent by the host
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum MouseEventType {
    Move = 0,
    Down = 1,
    Up = 2,
    Wheel = 3,
    Leave = 4,
}

impl MouseEventType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Move),
            1 => Some(Self::Down),
            2 => Some(Self::Up),
            3 => Some(Self::Wheel),
            4 => Some(Self::Leave),
            _ => None,
        }
    }
}

/// Represents a mouse button that can be pressed or released
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum MouseButton {
    /// No button (moves, wheel, leave)
    None = 0,
    /// Left mouse button pressed (or depressed)
    Left = 1,
    /// Right mouse button pressed (or depressed)
    Right = 2,
    /// Middle mouse button pressed (or depressed)
    Middle = 3,
}

impl MouseButton {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Left,
            2 => Self::Right,
            3 => Self::Middle,
            _ => Self::None,
        }
    }
}

impl Display for MouseButton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MouseButton::None => write!(f, "None"),
            MouseButton::Left => write!(f, "Left"),
            MouseButton::Right => write!(f, "Right"),
            MouseButton::Middle => write!(f, "Middle"),
        }
    }
}

/// Mouse event as sent by the host. Coordinates are normalized to `[0, 1]` with the
/// origin in the top-left corner.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct MouseEvent {
    pub kind: MouseEventType,
    pub button: MouseButton,
    pub x: f32,
    pub y: f32,
    /// Host-scale wheel delta. Positive scrolls down in host convention.
    pub wheel_delta: f32,
}

/// Keyboard event as sent by the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub virtual_key: u32,
    pub scan_code: u32,
    pub is_down: bool,
    pub is_system_key: bool,
}

/// Graphics device notifications forwarded to instances and to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceEventType {
    Lost = 0,
    Restored = 1,
}

impl Display for DeviceEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEventType::Lost => write!(f, "Lost"),
            DeviceEventType::Restored => write!(f, "Restored"),
        }
    }
}

/// Events the host issues from its render thread.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum RenderEventType {
    Initialize = 0,
    Shutdown = 1,
    UpdateTexture = 2,
}

impl RenderEventType {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            1 => Some(Self::Shutdown),
            2 => Some(Self::UpdateTexture),
            _ => None,
        }
    }
}

/// Graphics device lifecycle as reported by the host engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum HostDeviceEvent {
    Initialize = 0,
    Shutdown = 1,
    BeforeReset = 2,
    AfterReset = 3,
}

impl HostDeviceEvent {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            1 => Some(Self::Shutdown),
            2 => Some(Self::BeforeReset),
            3 => Some(Self::AfterReset),
            _ => None,
        }
    }
}

/// Severity passed to the host log callback
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum LogLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
}

/// Events emitted by the toolkit on its broadcast bus
#[derive(Clone, Debug, PartialEq)]
pub enum ToolkitEvent {
    // ****************************************
    // ** Instance lifecycle
    /// A new instance has been registered
    InstanceCreated { handle: InstanceHandle },
    /// Instance moved to a new lifecycle state
    StateChanged { handle: InstanceHandle, state: InstanceState },
    /// Instance has been torn down and removed from the registry
    InstanceDestroyed { handle: InstanceHandle },

    // ****************************************
    // ** Browser
    /// A navigation has finished (successfully or not)
    NavigationCompleted { handle: InstanceHandle, url: String, success: bool },
    /// The page posted a message to the host
    MessageReceived { handle: InstanceHandle, message: String },

    // ****************************************
    // ** Device / diagnostics
    /// Graphics device was lost or restored
    DeviceEvent(DeviceEventType),
    /// Log line that was also sent to the host log callback
    Log { level: LogLevel, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mousebutton_display() {
        assert_eq!(MouseButton::None.to_string(), "None");
        assert_eq!(MouseButton::Left.to_string(), "Left");
        assert_eq!(MouseButton::Middle.to_string(), "Middle");
        assert_eq!(MouseButton::Right.to_string(), "Right");
    }

    #[test]
    fn mouse_event_type_ids() {
        for (id, kind) in [
            (0, MouseEventType::Move),
            (1, MouseEventType::Down),
            (2, MouseEventType::Up),
            (3, MouseEventType::Wheel),
            (4, MouseEventType::Leave),
        ] {
            assert_eq!(MouseEventType::from_i32(id), Some(kind));
            assert_eq!(kind as i32, id);
        }
        assert_eq!(MouseEventType::from_i32(5), None);
    }

    #[test]
    fn unknown_button_is_none() {
        assert_eq!(MouseButton::from_i32(2), MouseButton::Right);
        assert_eq!(MouseButton::from_i32(42), MouseButton::None);
    }

    #[test]
    fn host_and_render_event_ids() {
        assert_eq!(HostDeviceEvent::from_i32(2), Some(HostDeviceEvent::BeforeReset));
        assert_eq!(HostDeviceEvent::from_i32(3), Some(HostDeviceEvent::AfterReset));
        assert_eq!(HostDeviceEvent::from_i32(9), None);
        assert_eq!(RenderEventType::from_i32(2), Some(RenderEventType::UpdateTexture));
        assert_eq!(RenderEventType::from_i32(-1), None);
    }

    #[test]
    fn log_levels_are_ordered() {
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert_eq!(LogLevel::Error as i32, 2);
    }
}
