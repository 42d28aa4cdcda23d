//! Anonymous presence fetch
//!
//! A one-shot `Expires: 0` SUBSCRIBE asks the presence server for the current
//! document of a contact without creating a lasting subscription.

use crate::application::services::ImsServices;
use crate::domain::presence::PidfDocument;
use crate::domain::shared::{ContactId, ImsError, ImsEvent, Result};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    DialogPath, SessionAuthenticationAgent, SipHeaders, SipRequest,
};
use rsip::Header;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EVENT: &str = "presence";

pub struct AnonymousFetchManager {
    services: Arc<ImsServices>,
    /// Call-IDs of fetches whose NOTIFY has not arrived yet
    pending: Mutex<HashSet<String>>,
}

impl AnonymousFetchManager {
    pub fn new(services: Arc<ImsServices>) -> Self {
        Self {
            services,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Ask for the presence document of a contact
    pub async fn request_capabilities(&self, contact: &ContactId) -> Result<()> {
        info!("Anonymous fetch of {}", contact);
        let target = self.services.contact_uri(contact);
        let mut dialog = self.services.new_dialog(&target, &target);
        self.pending
            .lock()
            .await
            .insert(dialog.call_id().to_string());

        let result = self.send_fetch(&mut dialog).await;
        match &result {
            Ok(()) => metrics::record_subscribe("anonymous-fetch", "subscribed"),
            Err(e) => {
                warn!("Anonymous fetch of {} failed: {}", contact, e);
                metrics::record_subscribe("anonymous-fetch", "failed");
                self.pending.lock().await.remove(dialog.call_id());
            }
        }
        result
    }

    /// One-shot SUBSCRIBE, answering at most one proxy challenge
    async fn send_fetch(&self, dialog: &mut DialogPath) -> Result<()> {
        let mut auth = SessionAuthenticationAgent::new(self.services.profile.credentials.clone());
        let mut challenged = false;
        loop {
            let mut request =
                self.services
                    .factory
                    .create_subscribe(dialog, EVENT, "application/pidf+xml", 0)?;
            request.add_header(Header::Other("Privacy".to_string(), "id".to_string()));
            if auth.has_challenge() {
                auth.set_proxy_authorization(&mut request)?;
            }

            let context = self.services.transactions.send_and_wait(request).await?;
            let response = context
                .response()
                .ok_or(ImsError::Timeout(self.services.config.transaction_timeout()))?;

            match response.status_code() {
                200 | 202 => return Ok(()),
                407 if !challenged => {
                    debug!("407 on anonymous fetch, authenticating");
                    metrics::record_auth_challenge("SUBSCRIBE");
                    challenged = true;
                    auth.read_proxy_authenticate(response)?;
                    dialog.increment_cseq();
                }
                status => {
                    return Err(ImsError::Protocol {
                        status,
                        reason: response.reason_phrase(),
                    })
                }
            }
        }
    }

    /// Handle a NOTIFY answering one of our fetches
    pub async fn receive_notification(&self, notify: &SipRequest) -> bool {
        let Some(call_id) = notify.call_id() else {
            return false;
        };
        let mut pending = self.pending.lock().await;
        if !pending.contains(&call_id) {
            return false;
        }

        let terminated = notify
            .header("Subscription-State")
            .map(|s| s.to_ascii_lowercase().contains("terminated"))
            .unwrap_or(true);
        if terminated {
            pending.remove(&call_id);
        }
        drop(pending);

        let Some(content) = notify.content() else {
            debug!("Anonymous fetch NOTIFY without document");
            return true;
        };
        match PidfDocument::parse(&content) {
            Ok(document) => {
                self.services
                    .events
                    .publish(ImsEvent::AnonymousFetchNotification {
                        contact: document.entity.clone(),
                        document,
                    })
                    .await;
            }
            Err(e) => warn!("Can't parse anonymous fetch document: {}", e),
        }
        true
    }
}
