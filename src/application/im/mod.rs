//! One-to-one chat
//!
//! The SIP side (INVITE/ACK/BYE) lives in the session structs; message
//! transfer is delegated to a `MediaSession` (MSRP) supplied by the caller.

pub mod chat_session;
pub mod composing;

use crate::domain::shared::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use chat_session::{
    ChatSessionCore, OriginatingChatSession, Session, SessionState, TerminatingChatSession,
};
pub use composing::{ComposingSender, ComposingState, IsComposingManager};

/// MSRP media seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// SDP offer or answer describing our MSRP endpoint
    fn local_sdp(&self) -> String;

    /// Connect to the endpoint announced by the peer
    async fn open(&self, remote_sdp: &str) -> Result<()>;

    /// Send one message, chunked as the media layer sees fit
    async fn send_chunks(&self, message_id: &str, content_type: &str, data: Bytes) -> Result<()>;

    async fn close(&self);
}
