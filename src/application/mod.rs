//! Application layer - Use cases and application services
//!
//! This layer orchestrates the SIP dialogs behind each service:
//! - Capability discovery (OPTIONS)
//! - Presence publication, subscriptions and anonymous fetch
//! - One-to-one chat sessions and composing activity
//! - Inbound request dispatch (IMS module)

pub mod capability;
pub mod im;
pub mod ims_module;
pub mod presence;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

pub use ims_module::{ImsModule, MediaFactory};
pub use services::{ImsServices, UserProfile};
