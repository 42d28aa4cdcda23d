//! rcs-ims - IMS/SIP client stack for RCS services
//!
//! Drives the SIP dialogs of a mobile RCS client: capability discovery
//! through OPTIONS, presence PUBLISH/SUBSCRIBE with periodic refresh, and
//! one-to-one chat sessions with delivery and composing tracking.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{ImsModule, ImsServices, UserProfile};
pub use domain::shared::error::ImsError;
pub use domain::shared::result::Result;
