//! IMS module
//!
//! Owns the service managers and routes everything the transport receives:
//! responses go to the transaction layer, requests to the manager in charge
//! of their method.

use super::capability::CapabilityService;
use super::im::{MediaSession, Session, TerminatingChatSession};
use super::presence::{AnonymousFetchManager, PublishManager, SubscribeManager, SubscriptionKind};
use super::services::ImsServices;
use crate::domain::capability::FEATURE_OMA_IM;
use crate::domain::presence::{BasicStatus, PidfDocument, PidfTuple};
use crate::domain::shared::{ImsEvent, Result};
use crate::infrastructure::protocols::sip::{
    IncomingMessage, ResponseBuilder, SipHeaders, SipMessage, SipMethod, SipRequest,
};
use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Creates the media session of an inbound chat
pub type MediaFactory = Arc<dyn Fn() -> Arc<dyn MediaSession> + Send + Sync>;

const IM_SERVICE_ID: &str = "org.openmobilealliance:IM-session";

pub struct ImsModule {
    services: Arc<ImsServices>,
    capability: CapabilityService,
    publish: Arc<PublishManager>,
    watcher_info: Arc<SubscribeManager>,
    presence: Arc<SubscribeManager>,
    anonymous_fetch: AnonymousFetchManager,
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    media_factory: Option<MediaFactory>,
    weak: Weak<Self>,
}

impl ImsModule {
    pub fn new(services: Arc<ImsServices>, media_factory: Option<MediaFactory>) -> Arc<Self> {
        let public_uri = services.profile.public_uri.clone();
        Arc::new_cyclic(|weak| Self {
            capability: CapabilityService::new(services.clone()),
            publish: PublishManager::new(services.clone()),
            watcher_info: SubscribeManager::new(
                services.clone(),
                SubscriptionKind::WatcherInfo,
                public_uri.clone(),
            ),
            presence: SubscribeManager::new(services.clone(), SubscriptionKind::Presence, public_uri),
            anonymous_fetch: AnonymousFetchManager::new(services.clone()),
            sessions: RwLock::new(HashMap::new()),
            media_factory,
            services,
            weak: weak.clone(),
        })
    }

    pub fn services(&self) -> &Arc<ImsServices> {
        &self.services
    }

    pub fn capability(&self) -> &CapabilityService {
        &self.capability
    }

    pub fn publish_manager(&self) -> &Arc<PublishManager> {
        &self.publish
    }

    pub fn watcher_info_manager(&self) -> &Arc<SubscribeManager> {
        &self.watcher_info
    }

    pub fn presence_manager(&self) -> &Arc<SubscribeManager> {
        &self.presence
    }

    pub fn anonymous_fetch(&self) -> &AnonymousFetchManager {
        &self.anonymous_fetch
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Track a session until it terminates, so inbound BYEs reach it
    pub async fn add_session(&self, session: Arc<dyn Session>) {
        let core = session.core().clone();
        let id = core.session_id().to_string();
        self.sessions.write().await.insert(id.clone(), session);

        let module = self.weak.clone();
        tokio::spawn(async move {
            core.wait_terminated().await;
            if let Some(module) = module.upgrade() {
                if module.sessions.write().await.remove(&id).is_some() {
                    debug!("Session {} released", id);
                }
            }
        });
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Presence document we publish at start-up
    fn initial_presence(&self) -> Result<String> {
        let mut document = PidfDocument::new(self.services.profile.public_uri.clone());
        if self.services.local_capabilities().im_session {
            document.tuples.push(PidfTuple {
                id: "im".to_string(),
                basic: Some(BasicStatus::Open),
                service_id: Some(IM_SERVICE_ID.to_string()),
                version: Some("1.0".to_string()),
                contact: Some(self.services.profile.public_uri.clone()),
                timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            });
        }
        document.to_xml()
    }

    /// Bring the services up on an active registration
    pub async fn start(&self) {
        info!("Starting IMS services for {}", self.services.profile.public_uri);
        self.services.set_registered(true);

        if !self.services.config.presence.enabled {
            info!("Presence service disabled");
            return;
        }

        match self.initial_presence() {
            Ok(document) => {
                if let Err(e) = self.publish.publish(&document).await {
                    warn!("Initial publish failed: {}", e);
                }
            }
            Err(e) => error!("Can't build presence document: {}", e),
        }
        let (winfo, presence) =
            futures::join!(self.watcher_info.subscribe(), self.presence.subscribe());
        if let Err(e) = winfo {
            warn!("Watcher-info subscription failed: {}", e);
        }
        if let Err(e) = presence {
            warn!("Presence subscription failed: {}", e);
        }
    }

    /// Tear everything down; sessions are aborted, presence withdrawn
    pub async fn stop(&self) {
        info!("Stopping IMS services");
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        futures::future::join_all(sessions.iter().map(|s| s.abort())).await;

        futures::join!(
            self.publish.unpublish(),
            self.watcher_info.terminate(),
            self.presence.terminate()
        );
        self.services.set_registered(false);
        info!("IMS services stopped");
    }

    /// Dispatch messages until the transport channel closes
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<IncomingMessage>) {
        while let Some(message) = incoming.recv().await {
            self.clone().handle_incoming(message);
        }
        debug!("Incoming channel closed");
    }

    /// Route one received message.
    ///
    /// Requests are handled on their own task: managers hold their lock
    /// while waiting for a response, and a NOTIFY may overtake the 200 it
    /// belongs to.
    pub fn handle_incoming(self: Arc<Self>, incoming: IncomingMessage) {
        match incoming.message {
            SipMessage::Response(response) => {
                if !self.services.transactions.on_response(response) {
                    debug!("Stray response from {}", incoming.source);
                }
            }
            SipMessage::Request(request) => {
                let source = incoming.source;
                tokio::spawn(async move {
                    if let Err(e) = self.handle_request(request, source).await {
                        error!("Error processing request from {}: {}", source, e);
                    }
                });
            }
        }
    }

    pub async fn handle_request(&self, request: SipRequest, source: SocketAddr) -> Result<()> {
        let method = request.method();
        debug!("Processing {} from {}", method, source);
        match method {
            SipMethod::Options => self.capability.receive_options(&request, source).await,
            SipMethod::Notify => self.receive_notify(&request, source).await,
            SipMethod::Invite => self.receive_invite(request, source).await,
            SipMethod::Bye => self.receive_bye(&request, source).await,
            SipMethod::Ack => Ok(()),
            other => {
                warn!("No handler for {}", other);
                self.reply(&request, source, 501).await
            }
        }
    }

    async fn reply(&self, request: &SipRequest, source: SocketAddr, status: u16) -> Result<()> {
        let response = ResponseBuilder::new(status).build_for_request(request)?;
        self.services
            .transactions
            .send_response(response, source)
            .await?;
        Ok(())
    }

    async fn receive_notify(&self, request: &SipRequest, source: SocketAddr) -> Result<()> {
        let matched = self.watcher_info.receive_notification(request).await
            || self.presence.receive_notification(request).await
            || self.anonymous_fetch.receive_notification(request).await;
        if !matched {
            debug!("NOTIFY for unknown subscription {:?}", request.call_id());
        }
        self.reply(request, source, if matched { 200 } else { 481 })
            .await
    }

    async fn receive_invite(&self, request: SipRequest, source: SocketAddr) -> Result<()> {
        let Some(factory) = &self.media_factory else {
            info!("Chat not available, declining INVITE");
            return self.reply(&request, source, 488).await;
        };
        if !self.services.local_capabilities().im_session {
            return self.reply(&request, source, 488).await;
        }

        let session = match TerminatingChatSession::new(
            self.services.clone(),
            request.clone(),
            source,
            factory(),
        ) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("Rejecting malformed INVITE: {}", e);
                return self.reply(&request, source, 400).await;
            }
        };

        let core = session.core().clone();
        info!("Chat invitation from {} ({})", core.remote(), core.session_id());
        self.add_session(session).await;
        self.services
            .events
            .publish(ImsEvent::ChatInvitation {
                session_id: core.session_id().to_string(),
                contact: core.remote().clone(),
            })
            .await;
        Ok(())
    }

    async fn receive_bye(&self, request: &SipRequest, source: SocketAddr) -> Result<()> {
        let call_id = request.call_id().unwrap_or_default();
        let session = {
            let mut sessions = self.sessions.write().await;
            let id = sessions
                .iter()
                .find(|(_, s)| s.core().call_id() == call_id)
                .map(|(id, _)| id.clone());
            id.and_then(|id| sessions.remove(&id))
        };

        match session {
            Some(session) => {
                self.reply(request, source, 200).await?;
                session.core().terminated_by_remote().await;
                Ok(())
            }
            None => self.reply(request, source, 481).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::im::MockMediaSession;
    use crate::application::test_support::TestPeer;
    use crate::config::Config;
    use std::time::Duration;

    const SDP: &str = "v=0\r\nm=message 9 TCP/MSRP *\r\n";

    fn request(method: &str, call_id: &str, extra: &str) -> SipRequest {
        let data = format!(
            "{method} sip:+33600000001@127.0.0.1:5062 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK{call_id}{method}\r\n\
             From: <sip:+33600000002@ims.example.org>;tag=bob-tag\r\n\
             To: <sip:+33600000001@ims.example.org>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 {method}\r\n\
             {extra}Content-Length: 0\r\n\r\n"
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    fn media_factory() -> MediaFactory {
        Arc::new(|| {
            let mut media = MockMediaSession::new();
            media.expect_local_sdp().returning(|| SDP.to_string());
            media.expect_open().returning(|_| Ok(()));
            media.expect_close().returning(|| ());
            Arc::new(media) as Arc<dyn MediaSession>
        })
    }

    fn source() -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_method_gets_501() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), None);

        module
            .handle_request(request("MESSAGE", "m1", ""), source())
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 501);
    }

    #[tokio::test]
    async fn test_unmatched_notify_gets_481() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), None);

        module
            .handle_request(
                request("NOTIFY", "n1", "Event: presence\r\nSubscription-State: active\r\n"),
                source(),
            )
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 481);
    }

    #[tokio::test]
    async fn test_inbound_options_answered() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), None);

        module
            .handle_request(
                request("OPTIONS", "o1", "Contact: <sip:+33600000002@127.0.0.1:5070>;+g.oma.sip-im\r\n"),
                source(),
            )
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 200);
        assert_eq!(peer.recorder.types(), vec!["capabilities_changed"]);
    }

    #[tokio::test]
    async fn test_invite_without_media_declined() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), None);

        module
            .handle_request(request("INVITE", "i1", ""), source())
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 488);
        assert_eq!(module.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_invite_then_bye() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), Some(media_factory()));

        module
            .handle_request(request("INVITE", "chat-7", ""), source())
            .await
            .unwrap();
        assert_eq!(module.session_count().await, 1);
        let session_id = match &peer.recorder.events()[0] {
            ImsEvent::ChatInvitation { session_id, contact } => {
                assert_eq!(contact.as_str(), "+33600000002");
                session_id.clone()
            }
            other => panic!("unexpected event {:?}", other),
        };

        let session = module.session(&session_id).await.unwrap();
        session.accept().await.unwrap();
        assert_eq!(peer.next_response().await.status_code(), 200);

        module
            .handle_request(request("BYE", "chat-7", ""), source())
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 200);
        assert_eq!(module.session_count().await, 0);
        assert_eq!(
            peer.recorder.types(),
            vec!["chat_invitation", "chat_started", "chat_terminated_by_remote"]
        );

        module
            .handle_request(request("BYE", "chat-7", ""), source())
            .await
            .unwrap();
        assert_eq!(peer.next_response().await.status_code(), 481);
    }

    #[tokio::test]
    async fn test_responses_reach_transactions() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), None);
        let handle = module
            .capability()
            .request_contact_capabilities("+33600000002")
            .unwrap();

        let options = peer.next_request().await;
        let response = ResponseBuilder::new(404)
            .build_for_request(&options)
            .unwrap();
        module.clone().handle_incoming(IncomingMessage {
            message: SipMessage::Response(response),
            source: source(),
        });
        assert!(matches!(
            handle.await.unwrap(),
            crate::application::capability::OptionsOutcome::Updated(_)
        ));
    }

    async fn wait_for_session_count(module: &ImsModule, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while module.session_count().await != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session map not updated");
    }

    #[tokio::test]
    async fn test_rejected_session_released() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), Some(media_factory()));

        module
            .handle_request(request("INVITE", "chat-8", ""), source())
            .await
            .unwrap();
        let session_id = match &peer.recorder.events()[0] {
            ImsEvent::ChatInvitation { session_id, .. } => session_id.clone(),
            other => panic!("unexpected event {:?}", other),
        };

        module.session(&session_id).await.unwrap().reject().await.unwrap();
        assert_eq!(peer.next_response().await.status_code(), 486);
        wait_for_session_count(&module, 0).await;
        assert!(module.session(&session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_aborted_session_released() {
        let mut peer = TestPeer::new().await;
        let module = ImsModule::new(peer.services.clone(), Some(media_factory()));

        module
            .handle_request(request("INVITE", "chat-10", ""), source())
            .await
            .unwrap();
        assert_eq!(module.session_count().await, 1);
        let session_id = match &peer.recorder.events()[0] {
            ImsEvent::ChatInvitation { session_id, .. } => session_id.clone(),
            other => panic!("unexpected event {:?}", other),
        };

        // Not established yet, so no BYE goes out
        module.session(&session_id).await.unwrap().abort().await;
        wait_for_session_count(&module, 0).await;
        assert!(peer.idle());
    }

    #[tokio::test]
    async fn test_start_and_stop_with_presence_disabled() {
        let mut config = Config::default();
        config.presence.enabled = false;
        let mut peer = TestPeer::with_config(config).await;
        peer.services.set_registered(false);
        let module = ImsModule::new(peer.services.clone(), None);

        module.start().await;
        assert!(peer.services.is_registered());
        assert!(peer.idle());

        module.stop().await;
        assert!(!peer.services.is_registered());
        assert!(peer.idle());
    }
}
