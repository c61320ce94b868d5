pub mod engine;
pub mod ffi;
pub mod platform;
pub mod render;

pub use engine::*;
