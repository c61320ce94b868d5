pub mod capture;
pub mod config;
pub mod errors;
pub mod event_bridge;
pub mod events;
pub mod handle;
pub mod input;
pub mod instance;
pub mod registry;
pub mod sink;

pub use config::{BrowserSettings, InstanceParams, ToolkitConfig, ToolkitConfigError};
pub use errors::{ResultCode, ToolkitError};
pub use event_bridge::EventBridge;
pub use events::{
    DeviceEventType, HostDeviceEvent, KeyEvent, LogLevel, MouseButton, MouseEvent, MouseEventType,
    RenderEventType, ToolkitEvent,
};
pub use handle::InstanceHandle;
pub use instance::InstanceState;
pub use registry::{Registry, UpdateOutcome};

/// Capacity of the toolkit's broadcast event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 128;
