use crate::engine::handle::InstanceHandle;
use serde::{Deserialize, Serialize};

/// Numeric result codes as seen across the C boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,

    // Generic
    ErrorUnknown = -1,
    ErrorInvalidHandle = -2,
    ErrorNotInitialized = -3,
    ErrorAlreadyInitialized = -4,

    // Graphics
    ErrorUnsupportedGraphicsApi = -100,
    ErrorDeviceCreationFailed = -101,
    ErrorTextureCreationFailed = -102,
    ErrorResourceTransitionFailed = -103,

    // Browser
    ErrorBrowserCreationFailed = -200,
    ErrorCompositionFailed = -201,
    ErrorNavigationFailed = -202,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl<T> From<&Result<T, ToolkitError>> for ResultCode {
    fn from(res: &Result<T, ToolkitError>) -> Self {
        match res {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolkitError {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Invalid instance handle: {0}")]
    InvalidHandle(InstanceHandle),

    #[error("Toolkit is not initialized")]
    NotInitialized,

    #[error("Toolkit is already initialized")]
    AlreadyInitialized,

    #[error("Unsupported graphics API: {0}")]
    UnsupportedGraphicsApi(i32),

    #[error("Device creation failed: {0}")]
    DeviceCreationFailed(String),

    #[error("Texture creation failed: {0}")]
    TextureCreationFailed(String),

    #[error("Resource transition failed: {0}")]
    ResourceTransitionFailed(String),

    #[error("Browser creation failed: {0}")]
    BrowserCreationFailed(String),

    #[error("Composition failed: {0}")]
    CompositionFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),
}

impl ToolkitError {
    /// Result code reported to C callers for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            ToolkitError::Unknown(_) => ResultCode::ErrorUnknown,
            ToolkitError::InvalidHandle(_) => ResultCode::ErrorInvalidHandle,
            ToolkitError::NotInitialized => ResultCode::ErrorNotInitialized,
            ToolkitError::AlreadyInitialized => ResultCode::ErrorAlreadyInitialized,
            ToolkitError::UnsupportedGraphicsApi(_) => ResultCode::ErrorUnsupportedGraphicsApi,
            ToolkitError::DeviceCreationFailed(_) => ResultCode::ErrorDeviceCreationFailed,
            ToolkitError::TextureCreationFailed(_) => ResultCode::ErrorTextureCreationFailed,
            ToolkitError::ResourceTransitionFailed(_) => ResultCode::ErrorResourceTransitionFailed,
            ToolkitError::BrowserCreationFailed(_) => ResultCode::ErrorBrowserCreationFailed,
            ToolkitError::CompositionFailed(_) => ResultCode::ErrorCompositionFailed,
            ToolkitError::NavigationFailed(_) => ResultCode::ErrorNavigationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_values() {
        assert_eq!(ToolkitError::Unknown("x".into()).code().as_i32(), -1);
        assert_eq!(ToolkitError::InvalidHandle(InstanceHandle::from(7)).code().as_i32(), -2);
        assert_eq!(ToolkitError::NotInitialized.code().as_i32(), -3);
        assert_eq!(ToolkitError::AlreadyInitialized.code().as_i32(), -4);
        assert_eq!(ToolkitError::UnsupportedGraphicsApi(4).code().as_i32(), -100);
        assert_eq!(ToolkitError::DeviceCreationFailed("x".into()).code().as_i32(), -101);
        assert_eq!(ToolkitError::TextureCreationFailed("x".into()).code().as_i32(), -102);
        assert_eq!(ToolkitError::ResourceTransitionFailed("x".into()).code().as_i32(), -103);
        assert_eq!(ToolkitError::BrowserCreationFailed("x".into()).code().as_i32(), -200);
        assert_eq!(ToolkitError::CompositionFailed("x".into()).code().as_i32(), -201);
        assert_eq!(ToolkitError::NavigationFailed("x".into()).code().as_i32(), -202);
    }

    #[test]
    fn result_code_from_result() {
        let ok: Result<(), ToolkitError> = Ok(());
        assert_eq!(ResultCode::from(&ok), ResultCode::Success);

        let err: Result<(), ToolkitError> = Err(ToolkitError::NotInitialized);
        assert_eq!(ResultCode::from(&err), ResultCode::ErrorNotInitialized);
        assert!(!ResultCode::from(&err).is_success());
    }
}
