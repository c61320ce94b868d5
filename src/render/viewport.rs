//! Viewport definition for browser bounds.
//!
//! A [`Viewport`] is the rectangle, in pixels of the hidden window's client area, that
//! the browser controller renders into. Instances always use a viewport anchored at the
//! origin and sized to the instance.
//!
//! # Examples
//!
//! ```
//! use webview_toolkit::render::Viewport;
//!
//! let vp = Viewport::sized(800, 600);
//! assert_eq!((vp.x, vp.y), (0, 0));
//! assert_eq!(vp.as_size().width, 800);
//! ```

use crate::render::backend::SurfaceSize;

/// Represents the viewport for rendering.
#[derive(Clone, Eq, PartialEq, Copy, Default)]
pub struct Viewport {
    /// Horizontal offset in pixels from the origin.
    pub x: i32,

    /// Vertical offset in pixels from the origin.
    pub y: i32,

    /// Width in pixels.
    pub width: u32,

    /// Height in pixels.
    pub height: u32,
}

impl std::fmt::Debug for Viewport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Viewport {{ x: {}, y: {}, width: {}, height: {} }}",
            self.x, self.y, self.width, self.height
        )
    }
}

impl Viewport {
    /// Creates a new [`Viewport`] with the given position and size.
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Viewport at the origin with the given size.
    pub fn sized(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Converts this viewport to a [`SurfaceSize`].
    pub fn as_size(&self) -> SurfaceSize {
        SurfaceSize {
            width: self.width,
            height: self.height,
        }
    }
}
