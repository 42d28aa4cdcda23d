//! Watcher-info and presence subscriptions
//!
//! One manager type serves both event packages; the variant only changes the
//! Event/Accept headers and how NOTIFY bodies are interpreted.

use crate::application::services::ImsServices;
use crate::domain::presence::{PidfDocument, SubscriptionState, WatcherInfoDocument};
use crate::domain::shared::{ImsEvent, PresenceError, PresenceErrorCode};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    DialogPath, SessionAuthenticationAgent, SipHeaders, SipRequest, SipResponse,
};
use crate::infrastructure::refresher::{PeriodicProcessing, PeriodicRefresher};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const REFRESH_FACTOR: f64 = 0.5;

/// Event package of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    WatcherInfo,
    Presence,
}

impl SubscriptionKind {
    pub fn event(&self) -> &'static str {
        match self {
            SubscriptionKind::WatcherInfo => "presence.winfo",
            SubscriptionKind::Presence => "presence",
        }
    }

    pub fn accept(&self) -> &'static str {
        match self {
            SubscriptionKind::WatcherInfo => "application/watcherinfo+xml",
            SubscriptionKind::Presence => "application/pidf+xml",
        }
    }
}

/// Held for a whole SUBSCRIBE cycle
struct SubscribeInner {
    dialog: Option<DialogPath>,
    expire_period: u32,
    auth: SessionAuthenticationAgent,
}

/// Short-lived view read by NOTIFY handling while a cycle is in flight
struct SubscribeStatus {
    state: SubscriptionState,
    dialog: Option<DialogPath>,
}

pub struct SubscribeManager {
    kind: SubscriptionKind,
    target: String,
    services: Arc<ImsServices>,
    inner: Mutex<SubscribeInner>,
    status: StdMutex<SubscribeStatus>,
    refresher: PeriodicRefresher,
}

impl SubscribeManager {
    pub fn new(services: Arc<ImsServices>, kind: SubscriptionKind, target: impl Into<String>) -> Arc<Self> {
        let expire_period = services.config.presence.subscribe_expire_period;
        let jitter = services.config.presence.refresh_jitter;
        let auth = SessionAuthenticationAgent::new(services.profile.credentials.clone());
        let name = match kind {
            SubscriptionKind::WatcherInfo => "winfo-subscribe",
            SubscriptionKind::Presence => "presence-subscribe",
        };

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let target_cb: Weak<dyn PeriodicProcessing> = weak.clone();
            Self {
                kind,
                target: target.into(),
                services,
                inner: Mutex::new(SubscribeInner {
                    dialog: None,
                    expire_period,
                    auth,
                }),
                status: StdMutex::new(SubscribeStatus {
                    state: SubscriptionState::Idle,
                    dialog: None,
                }),
                refresher: PeriodicRefresher::new(name, target_cb).with_jitter(jitter),
            }
        })
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    fn status(&self) -> MutexGuard<'_, SubscribeStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, state: SubscriptionState, dialog: Option<DialogPath>) {
        let mut status = self.status();
        status.state = state;
        status.dialog = dialog;
    }

    pub async fn state(&self) -> SubscriptionState {
        self.status().state
    }

    pub async fn is_subscribed(&self) -> bool {
        self.state().await == SubscriptionState::Subscribed
    }

    pub async fn expire_period(&self) -> u32 {
        self.inner.lock().await.expire_period
    }

    pub fn refresher(&self) -> &PeriodicRefresher {
        &self.refresher
    }

    /// Subscribe on a new dialog
    pub async fn subscribe(&self) -> Result<(), PresenceError> {
        let mut inner = self.inner.lock().await;
        info!("Subscribing to {} of {}", self.kind.event(), self.target);
        let dialog = self.services.new_dialog(&self.target, &self.target);
        self.set_status(SubscriptionState::Subscribing, Some(dialog.clone()));
        inner.dialog = Some(dialog);

        let expires = inner.expire_period;
        let result = self.send_subscribe(&mut inner, expires).await;
        self.complete(&mut inner, result).await
    }

    /// Unsubscribe best effort and stop refreshing
    pub async fn terminate(&self) {
        info!("Terminating {} subscription", self.kind.event());
        self.refresher.stop_timer().await;

        let mut inner = self.inner.lock().await;
        let subscribed = self.status().state == SubscriptionState::Subscribed;
        if subscribed {
            if let Some(dialog) = inner.dialog.as_mut() {
                dialog.increment_cseq();
            }
            if let Err(e) = self.send_subscribe(&mut inner, 0).await {
                debug!("Unsubscribe failed: {}", e);
            }
        }
        self.set_status(SubscriptionState::Terminated, None);
        inner.dialog = None;
    }

    async fn complete(
        &self,
        inner: &mut SubscribeInner,
        result: Result<u32, PresenceError>,
    ) -> Result<(), PresenceError> {
        match result {
            Ok(expires) => {
                {
                    let mut status = self.status();
                    if status.state == SubscriptionState::TerminatedByServer {
                        debug!("{} ended by the server during the cycle", self.kind.event());
                        return Ok(());
                    }
                    status.state = SubscriptionState::Subscribed;
                    status.dialog = inner.dialog.clone();
                }
                self.refresher.start_timer(expires, REFRESH_FACTOR);
                metrics::record_subscribe(self.kind.event(), "subscribed");
                info!("Subscribed to {} for {}s", self.kind.event(), expires);
                Ok(())
            }
            Err(error) => {
                warn!("Subscription to {} failed: {}", self.kind.event(), error);
                self.set_status(SubscriptionState::Idle, None);
                inner.dialog = None;
                self.refresher.cancel();
                metrics::record_subscribe(self.kind.event(), "failed");
                self.services
                    .events
                    .publish(ImsEvent::SubscribeFailed {
                        event: self.kind.event().to_string(),
                        reason: error.message.clone(),
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    /// Run one SUBSCRIBE exchange; returns the granted period
    async fn send_subscribe(
        &self,
        inner: &mut SubscribeInner,
        mut expires: u32,
    ) -> Result<u32, PresenceError> {
        let (mut auth_retried, mut interval_retried) = (false, false);
        loop {
            let response = self.send_once(inner, expires).await?;

            match response.status_code() {
                200 | 202 => {
                    inner.auth.update_next_nonce(&response);
                    if let Some(dialog) = inner.dialog.as_mut() {
                        if let Some(tag) = response.to_tag() {
                            dialog.set_remote_tag(tag);
                        }
                        dialog.set_established();
                    }
                    let granted = response.expires().filter(|e| *e > 0).unwrap_or(expires);
                    return Ok(granted);
                }
                407 if !auth_retried => {
                    info!("407 on SUBSCRIBE, authenticating");
                    metrics::record_auth_challenge("SUBSCRIBE");
                    auth_retried = true;
                    inner
                        .auth
                        .read_proxy_authenticate(&response)
                        .map_err(|e| failed(e.to_string()))?;
                }
                423 if !interval_retried => {
                    interval_retried = true;
                    let min_expires = response
                        .min_expires()
                        .ok_or_else(|| failed("No Min-Expires value found".to_string()))?;
                    info!("423 on SUBSCRIBE, adopting period {}s", min_expires);
                    inner.expire_period = min_expires;
                    if expires != 0 {
                        expires = min_expires;
                    }
                }
                status => {
                    return Err(failed(format!("{} {}", status, response.reason_phrase())));
                }
            }

            if let Some(dialog) = inner.dialog.as_mut() {
                dialog.increment_cseq();
            }
        }
    }

    async fn send_once(
        &self,
        inner: &mut SubscribeInner,
        expires: u32,
    ) -> Result<SipResponse, PresenceError> {
        let dialog = inner
            .dialog
            .as_ref()
            .ok_or_else(|| failed("No subscription dialog".to_string()))?;
        let mut request = self
            .services
            .factory
            .create_subscribe(dialog, self.kind.event(), self.kind.accept(), expires)
            .map_err(|e| failed(e.to_string()))?;
        if inner.auth.has_challenge() {
            inner
                .auth
                .set_proxy_authorization(&mut request)
                .map_err(|e| failed(e.to_string()))?;
        }

        debug!("Sending SUBSCRIBE {}, expires={}", self.kind.event(), expires);
        let context = self
            .services
            .transactions
            .send_and_wait(request)
            .await
            .map_err(|e| failed(e.to_string()))?;
        context
            .response()
            .cloned()
            .ok_or_else(|| failed("No response received".to_string()))
    }

    /// Handle a NOTIFY; false when it belongs to another dialog
    pub async fn receive_notification(&self, notify: &SipRequest) -> bool {
        let matched = match (&self.status().dialog, notify.call_id()) {
            (Some(dialog), Some(call_id)) => dialog.matches(
                &call_id,
                notify.to_tag().as_deref(),
                notify.from_tag().as_deref(),
            ),
            _ => false,
        };
        if !matched {
            return false;
        }
        debug!("NOTIFY received for {}", self.kind.event());

        if let Some(body) = notify.content() {
            match self.kind {
                SubscriptionKind::WatcherInfo => self.handle_watcher_info(&body).await,
                SubscriptionKind::Presence => self.handle_presence(&body).await,
            }
        }

        let state = notify.header("Subscription-State").unwrap_or_default();
        if state.to_ascii_lowercase().contains("terminated") {
            info!("{} subscription terminated by server", self.kind.event());
            self.set_status(SubscriptionState::TerminatedByServer, None);
            self.refresher.cancel();
        }
        true
    }

    async fn handle_watcher_info(&self, body: &str) {
        let document = match WatcherInfoDocument::parse(body) {
            Ok(document) => document,
            Err(e) => {
                warn!("Can't parse watcher-info document: {}", e);
                return;
            }
        };

        for watcher in document.watchers {
            let (Some(contact), Some(status), Some(event)) =
                (watcher.uri, watcher.status, watcher.event)
            else {
                continue;
            };
            if status.eq_ignore_ascii_case("pending") {
                self.services
                    .events
                    .publish(ImsEvent::PresenceSharingInvitation {
                        contact: contact.clone(),
                    })
                    .await;
            }
            self.services
                .events
                .publish(ImsEvent::PresenceSharingNotification {
                    contact,
                    status,
                    reason: event,
                })
                .await;
        }
    }

    async fn handle_presence(&self, body: &str) {
        match PidfDocument::parse(body) {
            Ok(document) => {
                self.services
                    .events
                    .publish(ImsEvent::PresenceNotification {
                        contact: document.entity.clone(),
                        document,
                    })
                    .await;
            }
            Err(e) => warn!("Can't parse presence document: {}", e),
        }
    }
}

fn failed(message: String) -> PresenceError {
    PresenceError::new(PresenceErrorCode::SubscribeFailed, message)
}

#[async_trait]
impl PeriodicProcessing for SubscribeManager {
    /// Re-SUBSCRIBE within the established dialog
    async fn periodic_processing(&self) {
        let mut inner = self.inner.lock().await;
        let subscribed = self.status().state == SubscriptionState::Subscribed;
        if !subscribed {
            return;
        }

        info!("Refreshing {} subscription", self.kind.event());
        if let Some(dialog) = inner.dialog.as_mut() {
            dialog.increment_cseq();
        }
        let expires = inner.expire_period;
        let result = self.send_subscribe(&mut inner, expires).await;
        if let Err(e) = self.complete(&mut inner, result).await {
            debug!("{} refresh ended: {}", self.kind.event(), e);
        }
    }
}
