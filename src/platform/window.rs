use anyhow::Result;

pub const WM_KEYDOWN: u32 = 0x0100;
pub const WM_KEYUP: u32 = 0x0101;
pub const WM_SYSKEYDOWN: u32 = 0x0104;
pub const WM_SYSKEYUP: u32 = 0x0105;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

/// Low-level message posted to a window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WindowMessage {
    pub msg: u32,
    pub wparam: usize,
    pub lparam: isize,
}

/// Creates hidden windows.
pub trait Windowing: Send + Sync {
    /// Create an invisible, input-transparent window with a client area of the given size.
    fn create_hidden_window(&self, width: u32, height: u32) -> Result<Box<dyn HiddenWindow>>;
}

/// Window that exists only as a capture target and a surface for synthetic input.
pub trait HiddenWindow: Send {
    fn id(&self) -> WindowId;

    /// Resize the client area. Capture follows the client area, so this must track the
    /// instance size.
    fn set_size(&mut self, width: u32, height: u32) -> Result<()>;

    /// Post a message without waiting for it to be handled.
    fn post_message(&self, message: WindowMessage) -> Result<()>;

    fn destroy(&mut self);
}
