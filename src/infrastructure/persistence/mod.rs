//! Persistence implementations

pub mod file_registry;
pub mod memory;

pub use file_registry::FileRegistry;
pub use memory::{MemoryContactStore, MemoryMessageHistory, MemoryRegistry};
