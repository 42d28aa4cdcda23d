//! Domain events and the observer registry they are delivered through

use super::error::{InstantMessageError, PresenceError};
use super::value_objects::ContactId;
use crate::domain::capability::Capabilities;
use crate::domain::instant_messaging::DeliveryStatus;
use crate::domain::presence::PidfDocument;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Notifications emitted by the stack
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImsEvent {
    CapabilitiesChanged {
        contact: ContactId,
        capabilities: Capabilities,
    },
    PublishSucceeded,
    PublishFailed {
        #[serde(skip)]
        error: PresenceError,
        reason: String,
    },
    PublishTerminated,
    SubscribeFailed {
        event: String,
        #[serde(skip)]
        error: PresenceError,
        reason: String,
    },
    /// A watcher asked to see our presence
    PresenceSharingInvitation {
        contact: String,
    },
    PresenceSharingNotification {
        contact: String,
        status: String,
        reason: String,
    },
    PresenceNotification {
        contact: String,
        document: PidfDocument,
    },
    AnonymousFetchNotification {
        contact: String,
        document: PidfDocument,
    },
    ChatInvitation {
        session_id: String,
        contact: ContactId,
    },
    ChatStarted {
        session_id: String,
    },
    ChatAborted {
        session_id: String,
        #[serde(skip)]
        error: Option<InstantMessageError>,
    },
    ChatTerminatedByRemote {
        session_id: String,
    },
    ChatMessageReceived {
        session_id: String,
        contact: ContactId,
        message_id: Option<String>,
        text: String,
    },
    MessageDeliveryStatus {
        contact: ContactId,
        message_id: String,
        status: DeliveryStatus,
    },
    ContactComposing {
        session_id: String,
        contact: ContactId,
        composing: bool,
    },
}

impl ImsEvent {
    /// Returns the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ImsEvent::CapabilitiesChanged { .. } => "capabilities_changed",
            ImsEvent::PublishSucceeded => "publish_succeeded",
            ImsEvent::PublishFailed { .. } => "publish_failed",
            ImsEvent::PublishTerminated => "publish_terminated",
            ImsEvent::SubscribeFailed { .. } => "subscribe_failed",
            ImsEvent::PresenceSharingInvitation { .. } => "presence_sharing_invitation",
            ImsEvent::PresenceSharingNotification { .. } => "presence_sharing_notification",
            ImsEvent::PresenceNotification { .. } => "presence_notification",
            ImsEvent::AnonymousFetchNotification { .. } => "anonymous_fetch_notification",
            ImsEvent::ChatInvitation { .. } => "chat_invitation",
            ImsEvent::ChatStarted { .. } => "chat_started",
            ImsEvent::ChatAborted { .. } => "chat_aborted",
            ImsEvent::ChatTerminatedByRemote { .. } => "chat_terminated_by_remote",
            ImsEvent::ChatMessageReceived { .. } => "chat_message_received",
            ImsEvent::MessageDeliveryStatus { .. } => "message_delivery_status",
            ImsEvent::ContactComposing { .. } => "contact_composing",
        }
    }
}

/// Why a listener refused an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// The listener is gone and must be removed
    #[error("listener disconnected")]
    Disconnected,

    #[error("listener failed: {0}")]
    Failed(String),
}

/// Event observer
pub trait ImsListener: Send + Sync {
    fn on_event(&self, event: &ImsEvent) -> Result<(), ListenerError>;
}

/// Handle returned on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Observer registry
///
/// Delivery iterates a snapshot of the registered listeners so that a
/// listener may (un)register from inside its callback.
pub struct EventBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ImsListener>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn ImsListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.push((id, listener));
        id
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Deliver an event to every listener
    pub async fn publish(&self, event: ImsEvent) {
        let snapshot: Vec<(ListenerId, Arc<dyn ImsListener>)> =
            self.listeners.read().await.clone();
        debug!(
            "Publishing {} to {} listener(s)",
            event.event_type(),
            snapshot.len()
        );

        let mut disconnected = Vec::new();
        for (id, listener) in snapshot {
            match listener.on_event(&event) {
                Ok(()) => {}
                Err(ListenerError::Disconnected) => {
                    debug!("Listener {:?} disconnected, removing it", id);
                    disconnected.push(id);
                }
                Err(e) => warn!("Listener {:?} failed on {}: {}", id, event.event_type(), e),
            }
        }

        if !disconnected.is_empty() {
            self.listeners
                .write()
                .await
                .retain(|(id, _)| !disconnected.contains(id));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener that writes every event to the log
pub struct LoggingListener;

impl ImsListener for LoggingListener {
    fn on_event(&self, event: &ImsEvent) -> Result<(), ListenerError> {
        let payload =
            serde_json::to_string(event).map_err(|e| ListenerError::Failed(e.to_string()))?;
        tracing::info!(event = event.event_type(), %payload, "IMS event");
        Ok(())
    }
}
