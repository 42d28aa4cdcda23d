//! Domain errors

use crate::infrastructure::protocols::sip::SipError;
use std::time::Duration;
use thiserror::Error;

/// Service layer error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImsError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected response {status} {reason}")]
    Protocol { status: u16, reason: String },

    #[error("Authentication challenge failed: {0}")]
    AuthChallenge(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<SipError> for ImsError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::TransportError(e) => ImsError::Transport(e),
            SipError::Authentication(e) => ImsError::AuthChallenge(e),
            SipError::ParseError(e) | SipError::InvalidMessage(e) => ImsError::Parse(e),
            SipError::TransactionError(e) | SipError::Internal(e) => ImsError::Internal(e),
        }
    }
}

impl From<quick_xml::Error> for ImsError {
    fn from(err: quick_xml::Error) -> Self {
        ImsError::Parse(err.to_string())
    }
}

/// Presence service error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceErrorCode {
    UnexpectedException,
    PublishFailed,
    SubscribeFailed,
}

/// Capability service error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityErrorCode {
    UnexpectedException,
    OptionsFailed,
}

/// Instant messaging error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantMessageErrorCode {
    UnexpectedException,
    SessionInitiationFailed,
    SessionInitiationDeclined,
    SessionTerminatedByRemote,
    MsgTransferFailed,
}

macro_rules! coded_error {
    ($name:ident, $code:ident) => {
        #[derive(Error, Debug, Clone, PartialEq, Eq)]
        #[error("{code:?}: {message}")]
        pub struct $name {
            pub code: $code,
            pub message: String,
        }

        impl $name {
            pub fn new(code: $code, message: impl Into<String>) -> Self {
                Self {
                    code,
                    message: message.into(),
                }
            }
        }
    };
}

coded_error!(PresenceError, PresenceErrorCode);
coded_error!(CapabilityError, CapabilityErrorCode);
coded_error!(InstantMessageError, InstantMessageErrorCode);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sip_error_mapping() {
        assert_eq!(
            ImsError::from(SipError::TransportError("down".into())),
            ImsError::Transport("down".into())
        );
        assert_eq!(
            ImsError::from(SipError::Authentication("no nonce".into())),
            ImsError::AuthChallenge("no nonce".into())
        );
        assert!(matches!(
            ImsError::from(SipError::ParseError("x".into())),
            ImsError::Parse(_)
        ));
    }

    #[test]
    fn test_coded_error_display() {
        let err = PresenceError::new(PresenceErrorCode::PublishFailed, "403 Forbidden");
        assert_eq!(err.to_string(), "PublishFailed: 403 Forbidden");
    }
}
