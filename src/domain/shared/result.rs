//! Domain result type

use super::error::ImsError;

/// Standard result type for service operations
pub type Result<T> = std::result::Result<T, ImsError>;
