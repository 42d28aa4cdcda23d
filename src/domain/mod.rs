//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - Value objects and documents exchanged with peers
//! - Ports for storage (contact store, registry, message history)
//! - Domain events and errors

pub mod capability;
pub mod instant_messaging;
pub mod presence;
pub mod shared;

// Re-export commonly used types
pub use shared::{ImsError, Result};
