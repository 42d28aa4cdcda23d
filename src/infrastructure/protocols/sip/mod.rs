//! SIP protocol implementation, client side
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Service managers      │
//! │ (presence, OPTIONS, IM) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │    Dialog Path          │
//! │  + message factory      │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Layer     │
//! │ (request correlation)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │        (UDP)            │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod message;
pub mod transaction;
pub mod transport;

pub use auth::{DigestChallenge, SessionAuthenticationAgent, UserCredentials};
pub use builder::{RequestBuilder, ResponseBuilder, SipMessageFactory};
pub use dialog::{generate_branch, generate_call_id, generate_tag, DialogPath};
pub use message::{SipError, SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse};
pub use transaction::{
    TransactionContext, TransactionHandle, TransactionId, TransactionLayer, TransactionOutcome,
};
pub use transport::{
    ChannelTransport, IncomingMessage, OutgoingMessage, Transport, TransportProtocol, UdpTransport,
};
