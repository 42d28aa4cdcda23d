//! Presence publication
//!
//! Keeps our presence document published on the presence server, refreshing
//! it with conditional PUBLISH requests before the server-granted expiry.

use crate::application::services::ImsServices;
use crate::domain::presence::PublishState;
use crate::domain::shared::{ImsEvent, PresenceError, PresenceErrorCode};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    DialogPath, SessionAuthenticationAgent, SipHeaders, SipResponse,
};
use crate::infrastructure::refresher::{PeriodicProcessing, PeriodicRefresher};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Registry key of the last entity tag
pub const ENTITY_TAG_KEY: &str = "sip_entity_tag";
/// Registry key of the entity tag expiry, in epoch milliseconds
pub const ENTITY_TAG_EXPIRATION_KEY: &str = "sip_etag_expiration";

const REFRESH_FACTOR: f64 = 0.8;

struct PublishInner {
    state: PublishState,
    expire_period: u32,
    entity_tag: Option<String>,
    auth: SessionAuthenticationAgent,
}

pub struct PublishManager {
    services: Arc<ImsServices>,
    inner: Mutex<PublishInner>,
    refresher: PeriodicRefresher,
}

impl PublishManager {
    pub fn new(services: Arc<ImsServices>) -> Arc<Self> {
        let expire_period = services.config.presence.publish_expire_period;
        let jitter = services.config.presence.refresh_jitter;
        let entity_tag = Self::read_entity_tag(&services);
        let auth = SessionAuthenticationAgent::new(services.profile.credentials.clone());

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let target: Weak<dyn PeriodicProcessing> = weak.clone();
            Self {
                services,
                inner: Mutex::new(PublishInner {
                    state: PublishState::Unpublished,
                    expire_period,
                    entity_tag,
                    auth,
                }),
                refresher: PeriodicRefresher::new("publish", target).with_jitter(jitter),
            }
        })
    }

    /// Entity tag left by a previous run, unless it has expired
    fn read_entity_tag(services: &ImsServices) -> Option<String> {
        let tag = services.registry.read_string(ENTITY_TAG_KEY)?;
        let expiration = services
            .registry
            .read_long(ENTITY_TAG_EXPIRATION_KEY)
            .unwrap_or(0);
        if expiration <= Utc::now().timestamp_millis() {
            debug!("Persisted entity tag {} expired, discarding it", tag);
            services.registry.remove_parameter(ENTITY_TAG_KEY);
            services.registry.remove_parameter(ENTITY_TAG_EXPIRATION_KEY);
            return None;
        }
        debug!("Resuming with entity tag {} (expires at {})", tag, expiration);
        Some(tag)
    }

    pub async fn state(&self) -> PublishState {
        self.inner.lock().await.state
    }

    pub async fn is_published(&self) -> bool {
        self.state().await == PublishState::Published
    }

    pub async fn expire_period(&self) -> u32 {
        self.inner.lock().await.expire_period
    }

    pub async fn entity_tag(&self) -> Option<String> {
        self.inner.lock().await.entity_tag.clone()
    }

    pub fn refresher(&self) -> &PeriodicRefresher {
        &self.refresher
    }

    /// Publish a presence document
    pub async fn publish(&self, info: &str) -> Result<(), PresenceError> {
        let mut inner = self.inner.lock().await;
        inner.state = PublishState::Publishing;
        info!("Publishing presence info");

        let expires = inner.expire_period;
        let result = self.send_publish(&mut inner, Some(info), expires).await;
        self.complete(&mut inner, result).await
    }

    /// Remove the publication from the server
    pub async fn unpublish(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != PublishState::Published {
                debug!("Not published, nothing to remove");
                return;
            }
            inner.state = PublishState::Unpublishing;
        }

        // A refresh in flight sees Unpublishing and backs off
        self.refresher.stop_timer().await;
        let mut inner = self.inner.lock().await;
        info!("Unpublishing presence info");

        if let Err(e) = self.send_publish(&mut inner, None, 0).await {
            warn!("Unpublish failed: {}", e);
        }

        inner.state = PublishState::Unpublished;
        metrics::record_publish("unpublished");
        self.services.events.publish(ImsEvent::PublishTerminated).await;
    }

    /// Stop refreshing without telling the server
    pub async fn terminate(&self) {
        info!("Terminating the publish manager");
        self.inner.lock().await.state = PublishState::Unpublished;
        self.refresher.stop_timer().await;
    }

    /// Handle the outcome of a publish or refresh cycle
    async fn complete(
        &self,
        inner: &mut PublishInner,
        result: Result<SipResponse, PresenceError>,
    ) -> Result<(), PresenceError> {
        match result {
            Ok(_) => {
                inner.state = PublishState::Published;
                self.refresher.start_timer(inner.expire_period, REFRESH_FACTOR);
                metrics::record_publish("published");
                info!("Presence published for {}s", inner.expire_period);
                self.services.events.publish(ImsEvent::PublishSucceeded).await;
                Ok(())
            }
            Err(error) => {
                warn!("Publish failed: {}", error);
                inner.state = PublishState::Unpublished;
                self.refresher.cancel();
                metrics::record_publish("failed");
                self.services
                    .events
                    .publish(ImsEvent::PublishFailed {
                        reason: error.message.clone(),
                        error: error.clone(),
                    })
                    .await;
                Err(error)
            }
        }
    }

    /// Run one PUBLISH exchange, recovering 407, 412 and 423 once each
    async fn send_publish(
        &self,
        inner: &mut PublishInner,
        body: Option<&str>,
        mut expires: u32,
    ) -> Result<SipResponse, PresenceError> {
        let uri = self.services.profile.public_uri.clone();
        let mut dialog = self.services.new_dialog(&uri, &uri);
        dialog.set_local_content(body.map(str::to_string));

        let (mut auth_retried, mut tag_retried, mut interval_retried) = (false, false, false);
        loop {
            let response = self.send_once(inner, &dialog, expires).await?;

            match response.status_code() {
                200 => {
                    inner.auth.update_next_nonce(&response);
                    self.handle_ok(inner, &response, expires);
                    return Ok(response);
                }
                407 if !auth_retried => {
                    info!("407 on PUBLISH, authenticating");
                    metrics::record_auth_challenge("PUBLISH");
                    auth_retried = true;
                    inner
                        .auth
                        .read_proxy_authenticate(&response)
                        .map_err(|e| unexpected(e.to_string()))?;
                }
                412 if !tag_retried => {
                    info!("412 on PUBLISH, retrying without entity tag");
                    tag_retried = true;
                    self.save_entity_tag(inner, None);
                }
                423 if !interval_retried => {
                    interval_retried = true;
                    let min_expires = response.min_expires().ok_or_else(|| {
                        PresenceError::new(
                            PresenceErrorCode::PublishFailed,
                            "No Min-Expires value found",
                        )
                    })?;
                    info!("423 on PUBLISH, adopting period {}s", min_expires);
                    inner.expire_period = min_expires;
                    if expires != 0 {
                        expires = min_expires;
                    }
                }
                status => {
                    return Err(PresenceError::new(
                        PresenceErrorCode::PublishFailed,
                        format!("{} {}", status, response.reason_phrase()),
                    ))
                }
            }
            dialog.increment_cseq();
        }
    }

    async fn send_once(
        &self,
        inner: &mut PublishInner,
        dialog: &DialogPath,
        expires: u32,
    ) -> Result<SipResponse, PresenceError> {
        let mut request = self
            .services
            .factory
            .create_publish(
                dialog,
                expires,
                inner.entity_tag.as_deref(),
                self.services.profile.access_network_info.as_deref(),
                dialog.local_content(),
            )
            .map_err(|e| unexpected(e.to_string()))?;
        if inner.auth.has_challenge() {
            inner
                .auth
                .set_proxy_authorization(&mut request)
                .map_err(|e| unexpected(e.to_string()))?;
        }

        debug!("Sending PUBLISH, expires={}", expires);
        let context = self
            .services
            .transactions
            .send_and_wait(request)
            .await
            .map_err(|e| unexpected(e.to_string()))?;
        context.response().cloned().ok_or_else(|| {
            PresenceError::new(PresenceErrorCode::PublishFailed, "No response received")
        })
    }

    fn handle_ok(&self, inner: &mut PublishInner, response: &SipResponse, expires: u32) {
        if expires != 0 {
            if let Some(granted) = response.expires().filter(|e| *e > 0) {
                inner.expire_period = granted;
            }
        }
        self.save_entity_tag(inner, response.header("SIP-ETag"));
    }

    fn save_entity_tag(&self, inner: &mut PublishInner, tag: Option<String>) {
        let registry = &self.services.registry;
        match &tag {
            Some(tag) => {
                let expiration =
                    Utc::now().timestamp_millis() + inner.expire_period as i64 * 1000;
                registry.write_string(ENTITY_TAG_KEY, tag);
                registry.write_long(ENTITY_TAG_EXPIRATION_KEY, expiration);
                debug!("New entity tag {}, expires at {}", tag, expiration);
            }
            None => {
                registry.remove_parameter(ENTITY_TAG_KEY);
                registry.remove_parameter(ENTITY_TAG_EXPIRATION_KEY);
                debug!("Entity tag reset");
            }
        }
        inner.entity_tag = tag;
    }
}

fn unexpected(message: String) -> PresenceError {
    PresenceError::new(PresenceErrorCode::UnexpectedException, message)
}

#[async_trait]
impl PeriodicProcessing for PublishManager {
    /// Body-less conditional PUBLISH extending the current publication
    async fn periodic_processing(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != PublishState::Published {
            return;
        }

        info!("Refreshing presence publication");
        inner.state = PublishState::Publishing;
        let expires = inner.expire_period;
        let result = self.send_publish(&mut inner, None, expires).await;
        if let Err(e) = self.complete(&mut inner, result).await {
            debug!("Publication refresh ended: {}", e);
        }
    }
}
