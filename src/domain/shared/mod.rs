//! Shared kernel - Common types used across all bounded contexts

pub mod error;
pub mod events;
pub mod result;
pub mod value_objects;

pub use error::{
    CapabilityError, CapabilityErrorCode, ImsError, InstantMessageError,
    InstantMessageErrorCode, PresenceError, PresenceErrorCode,
};
pub use events::{EventBus, ImsEvent, ImsListener, ListenerError, ListenerId, LoggingListener};
pub use result::Result;
pub use value_objects::*;
