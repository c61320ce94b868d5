pub mod backend;
pub mod backends;
pub mod bridge;
pub mod device;
pub mod software;

mod viewport;

pub use viewport::Viewport;
