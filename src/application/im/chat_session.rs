//! One-to-one chat sessions
//!
//! Both directions share a `ChatSessionCore` holding the dialog, the media
//! session and the composing manager. `OriginatingChatSession` runs the
//! INVITE cycle itself; `TerminatingChatSession` answers an inbound INVITE.

use super::composing::{ComposingSender, IsComposingManager};
use super::MediaSession;
use crate::application::capability::{OptionsRequestTask, OptionsOutcome};
use crate::application::services::ImsServices;
use crate::domain::capability::FEATURE_OMA_IM;
use crate::domain::instant_messaging::{
    generate_message_id, CpimMessage, DeliveryStatus, GeolocPush, ImdnDocument, InstantMessage,
    IsComposingInfo, MessagePayload, ComposingIndication, MIME_CPIM, MIME_GEOLOC, MIME_IMDN,
    MIME_IS_COMPOSING, MIME_TEXT_PLAIN,
};
use crate::domain::shared::{
    ContactId, ImsError, ImsEvent, InstantMessageError, InstantMessageErrorCode, Result,
};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    DialogPath, ResponseBuilder, SessionAuthenticationAgent, SipHeaders, SipRequest, SipResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use rsip::Header;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ImResult<T> = std::result::Result<T, InstantMessageError>;

fn im_error(code: InstantMessageErrorCode, message: impl ToString) -> InstantMessageError {
    InstantMessageError::new(code, message.to_string())
}

/// URI inside a name-addr, without brackets or header parameters
fn name_addr_uri(value: &str) -> String {
    let value = value.trim();
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].to_string(),
        _ => value.split(';').next().unwrap_or(value).trim().to_string(),
    }
}

fn chat_feature_tags() -> Vec<String> {
    vec![FEATURE_OMA_IM.to_string()]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Invitation in progress
    Pending,
    Established,
    Terminated,
}

/// Common chat session operations
#[async_trait]
pub trait Session: Send + Sync {
    fn core(&self) -> &Arc<ChatSessionCore>;

    /// Send the invitation (originating side)
    async fn start(&self) -> ImResult<()>;

    /// Answer the invitation (terminating side)
    async fn accept(&self) -> ImResult<()>;

    /// Decline the invitation (terminating side)
    async fn reject(&self) -> ImResult<()>;

    async fn abort(&self) {
        self.core().terminate(None).await;
    }

    async fn send_text_message(&self, text: &str) -> ImResult<String> {
        self.core().send_text_message(text).await
    }
}

/// Wraps is-composing documents in CPIM over the media session
struct MediaComposingSender {
    media: Arc<dyn MediaSession>,
}

#[async_trait]
impl ComposingSender for MediaComposingSender {
    async fn send_is_composing(&self, info: IsComposingInfo) -> Result<()> {
        let cpim = CpimMessage::build(MIME_IS_COMPOSING, &info.to_xml()?, None);
        self.media
            .send_chunks(&generate_message_id(), MIME_CPIM, Bytes::from(cpim.render()))
            .await
    }
}

struct CoreInner {
    state: SessionState,
    dialog: DialogPath,
}

pub struct ChatSessionCore {
    session_id: String,
    call_id: String,
    remote: ContactId,
    services: Arc<ImsServices>,
    media: Arc<dyn MediaSession>,
    composing: Arc<IsComposingManager>,
    inner: Mutex<CoreInner>,
    state_tx: watch::Sender<SessionState>,
}

impl ChatSessionCore {
    pub fn new(
        services: Arc<ImsServices>,
        remote: ContactId,
        media: Arc<dyn MediaSession>,
        dialog: DialogPath,
    ) -> Arc<Self> {
        let composing = IsComposingManager::new(
            Arc::new(MediaComposingSender {
                media: media.clone(),
            }),
            services.config.im.composing_idle_timeout(),
            services.config.im.composing_refresh_secs,
        );
        Arc::new(Self {
            session_id: Uuid::new_v4().to_string(),
            call_id: dialog.call_id().to_string(),
            remote,
            services,
            media,
            composing,
            inner: Mutex::new(CoreInner {
                state: SessionState::Pending,
                dialog,
            }),
            state_tx: watch::Sender::new(SessionState::Pending),
        })
    }

    fn set_state(&self, inner: &mut CoreInner, state: SessionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Resolves once the session has terminated, for whatever reason
    pub async fn wait_terminated(&self) {
        let mut state = self.state_tx.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Terminated).await;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn remote(&self) -> &ContactId {
        &self.remote
    }

    pub fn composing(&self) -> &Arc<IsComposingManager> {
        &self.composing
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn remote_sdp(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .dialog
            .remote_content()
            .map(str::to_string)
    }

    /// Local typing activity
    pub async fn handle_keystroke(&self) {
        if self.state().await == SessionState::Established {
            self.composing.handle_keystroke().await;
        }
    }

    pub async fn send_text_message(&self, text: &str) -> ImResult<String> {
        self.send_message(
            MessagePayload::Text(text.to_string()),
            MIME_TEXT_PLAIN,
            text.to_string(),
        )
        .await
    }

    pub async fn send_geoloc(&self, geoloc: GeolocPush) -> ImResult<String> {
        let body = geoloc
            .to_xml(&self.services.profile.public_uri)
            .map_err(|e| im_error(InstantMessageErrorCode::UnexpectedException, e))?;
        self.send_message(MessagePayload::Geoloc(geoloc), MIME_GEOLOC, body)
            .await
    }

    async fn send_message(
        &self,
        payload: MessagePayload,
        content_type: &str,
        body: String,
    ) -> ImResult<String> {
        if self.state().await != SessionState::Established {
            return Err(im_error(
                InstantMessageErrorCode::UnexpectedException,
                "Session not established",
            ));
        }

        let message = InstantMessage::outgoing(
            self.remote.clone(),
            payload,
            self.services.config.im.imdn_enabled,
        );
        let message_id = message.message_id.clone();
        let cpim = CpimMessage::build(content_type, &body, message.imdn_message_id.as_deref());
        self.services.history.add_message(message).await;
        self.composing.message_sent().await;

        match self
            .media
            .send_chunks(&message_id, MIME_CPIM, Bytes::from(cpim.render()))
            .await
        {
            Ok(()) => {
                debug!(session_id = %self.session_id, "Message {} sent", message_id);
                metrics::record_chat_message("sent");
                Ok(message_id)
            }
            Err(e) => {
                warn!(session_id = %self.session_id, "Message {} not sent: {}", message_id, e);
                metrics::record_chat_message("failed");
                self.mark_failed(&message_id).await;
                Err(im_error(InstantMessageErrorCode::MsgTransferFailed, e))
            }
        }
    }

    async fn mark_failed(&self, message_id: &str) {
        self.services
            .history
            .set_delivery_status(message_id, DeliveryStatus::Failed)
            .await;
        self.services
            .events
            .publish(ImsEvent::MessageDeliveryStatus {
                contact: self.remote.clone(),
                message_id: message_id.to_string(),
                status: DeliveryStatus::Failed,
            })
            .await;
    }

    /// The media layer reported a transfer error for a message.
    ///
    /// The contact may have lost chat support, so its capabilities are
    /// refreshed in the background.
    pub async fn handle_msrp_transfer_error(&self, message_id: &str) -> JoinHandle<OptionsOutcome> {
        warn!(session_id = %self.session_id, "Transfer error for message {}", message_id);
        self.mark_failed(message_id).await;
        let task = OptionsRequestTask::new(self.services.clone(), self.remote.clone());
        tokio::spawn(task.run())
    }

    /// Data received on the media session
    pub async fn receive_data(&self, content_type: &str, data: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(data);
        let (cpim, content_type, body) = if content_type
            .to_ascii_lowercase()
            .starts_with(MIME_CPIM)
        {
            let cpim = CpimMessage::parse(&text)?;
            let content_type = cpim.content_type.clone();
            let body = cpim.body.clone();
            (Some(cpim), content_type, body)
        } else {
            (None, content_type.to_string(), text.into_owned())
        };

        let base = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match base.as_str() {
            MIME_IS_COMPOSING => {
                let info = IsComposingInfo::parse(&body)?;
                self.services
                    .events
                    .publish(ImsEvent::ContactComposing {
                        session_id: self.session_id.clone(),
                        contact: self.remote.clone(),
                        composing: info.state == ComposingIndication::Active,
                    })
                    .await;
            }
            MIME_IMDN => {
                let report = ImdnDocument::parse(&body)?;
                // Listeners know the message by the id returned at send time
                let message_id = match self
                    .services
                    .history
                    .set_delivery_status(&report.message_id, report.status)
                    .await
                {
                    Some(message) => message.message_id,
                    None => {
                        debug!("Delivery report for unknown message {}", report.message_id);
                        report.message_id
                    }
                };
                self.services
                    .events
                    .publish(ImsEvent::MessageDeliveryStatus {
                        contact: self.remote.clone(),
                        message_id,
                        status: report.status,
                    })
                    .await;
            }
            MIME_TEXT_PLAIN => {
                let message_id = cpim.as_ref().and_then(|c| c.message_id()).map(str::to_string);
                info!(session_id = %self.session_id, "Message received from {}", self.remote);
                self.services
                    .events
                    .publish(ImsEvent::ChatMessageReceived {
                        session_id: self.session_id.clone(),
                        contact: self.remote.clone(),
                        message_id: message_id.clone(),
                        text: body,
                    })
                    .await;

                let wants_delivery = cpim
                    .as_ref()
                    .map(|c| c.dispositions().iter().any(|d| d == "positive-delivery"))
                    .unwrap_or(false);
                if let (true, true, Some(id)) = (
                    self.services.config.im.imdn_enabled,
                    wants_delivery,
                    message_id,
                ) {
                    self.send_delivery_report(&id, DeliveryStatus::Delivered)
                        .await?;
                }
            }
            other => debug!("Ignoring {} content on chat session", other),
        }
        Ok(())
    }

    async fn send_delivery_report(&self, message_id: &str, status: DeliveryStatus) -> Result<()> {
        let report = ImdnDocument {
            message_id: message_id.to_string(),
            datetime: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            status,
        };
        let cpim = CpimMessage::build(MIME_IMDN, &report.to_xml()?, None);
        self.media
            .send_chunks(&generate_message_id(), MIME_CPIM, Bytes::from(cpim.render()))
            .await
    }

    /// The peer sent BYE
    pub async fn terminated_by_remote(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Terminated {
                return;
            }
            self.set_state(&mut inner, SessionState::Terminated);
        }
        info!(session_id = %self.session_id, "Session terminated by remote");
        self.release().await;
        self.services
            .events
            .publish(ImsEvent::ChatTerminatedByRemote {
                session_id: self.session_id.clone(),
            })
            .await;
    }

    /// Tear the session down, with BYE when established
    pub async fn terminate(&self, error: Option<InstantMessageError>) {
        let bye = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Terminated {
                return;
            }
            let established = inner.state == SessionState::Established;
            self.set_state(&mut inner, SessionState::Terminated);
            if established {
                inner.dialog.increment_cseq();
                Some(self.services.factory.create_bye(&inner.dialog))
            } else {
                None
            }
        };

        match bye {
            Some(Ok(bye)) => {
                if let Err(e) = self.services.transactions.send_and_wait(bye).await {
                    warn!(session_id = %self.session_id, "BYE failed: {}", e);
                }
            }
            Some(Err(e)) => warn!(session_id = %self.session_id, "Can't build BYE: {}", e),
            None => {}
        }

        info!(session_id = %self.session_id, "Session aborted");
        self.release().await;
        self.services
            .events
            .publish(ImsEvent::ChatAborted {
                session_id: self.session_id.clone(),
                error,
            })
            .await;
    }

    async fn release(&self) {
        self.composing.stop().await;
        self.media.close().await;
    }

    /// Abort with an error and hand the error back
    async fn fail(&self, error: InstantMessageError) -> InstantMessageError {
        warn!(session_id = %self.session_id, "Session failed: {}", error);
        self.terminate(Some(error.clone())).await;
        error
    }

    /// Media is up; announce the session
    async fn started(&self) -> ImResult<()> {
        let remote_sdp = self.remote_sdp().await.unwrap_or_default();
        if let Err(e) = self.media.open(&remote_sdp).await {
            return Err(self
                .fail(im_error(InstantMessageErrorCode::SessionInitiationFailed, e))
                .await);
        }
        info!(session_id = %self.session_id, "Chat session with {} started", self.remote);
        self.services
            .events
            .publish(ImsEvent::ChatStarted {
                session_id: self.session_id.clone(),
            })
            .await;
        Ok(())
    }
}

/// Session we invite the peer to
pub struct OriginatingChatSession {
    core: Arc<ChatSessionCore>,
}

impl OriginatingChatSession {
    pub fn new(services: Arc<ImsServices>, contact: ContactId, media: Arc<dyn MediaSession>) -> Self {
        let target = services.contact_uri(&contact);
        let dialog = services.new_dialog(&target, &target);
        Self {
            core: ChatSessionCore::new(services, contact, media, dialog),
        }
    }

    /// INVITE until a final answer, answering one proxy challenge
    async fn send_invite(&self, dialog: &mut DialogPath, sdp: &str) -> Result<SipResponse> {
        let services = &self.core.services;
        let contribution_id = generate_message_id();
        let mut auth = SessionAuthenticationAgent::new(services.profile.credentials.clone());
        let mut challenged = false;
        loop {
            let mut invite =
                services
                    .factory
                    .create_invite(dialog, &chat_feature_tags(), &contribution_id, sdp)?;
            if auth.has_challenge() {
                auth.set_proxy_authorization(&mut invite)?;
            }

            let context = services.transactions.send_and_wait(invite).await?;
            let response = context
                .response()
                .ok_or(ImsError::Timeout(services.config.invite_timeout()))?;

            if response.status_code() == 407 && !challenged {
                debug!(session_id = %self.core.session_id, "407 on INVITE, authenticating");
                metrics::record_auth_challenge("INVITE");
                challenged = true;
                auth.read_proxy_authenticate(response)?;
                dialog.increment_cseq();
                continue;
            }
            return Ok(response.clone());
        }
    }

    async fn establish(&self, mut dialog: DialogPath, response: &SipResponse) -> ImResult<()> {
        let core = &self.core;
        if let Some(tag) = response.to_tag() {
            dialog.set_remote_tag(tag);
        }
        if let Some(contact) = response.header("Contact") {
            dialog.set_target(name_addr_uri(&contact));
        }
        dialog.set_remote_content(response.content());
        dialog.set_established();

        match core.services.factory.create_ack(&dialog) {
            Ok(ack) => {
                if let Err(e) = core.services.transactions.send_stateless(ack).await {
                    warn!(session_id = %core.session_id, "ACK failed: {}", e);
                }
            }
            Err(e) => warn!(session_id = %core.session_id, "Can't build ACK: {}", e),
        }

        {
            let mut inner = core.inner.lock().await;
            if inner.state == SessionState::Terminated {
                // Aborted while the INVITE was pending
                drop(inner);
                dialog.increment_cseq();
                if let Ok(bye) = core.services.factory.create_bye(&dialog) {
                    let _ = core.services.transactions.send_and_wait(bye).await;
                }
                return Err(im_error(
                    InstantMessageErrorCode::UnexpectedException,
                    "Session aborted during setup",
                ));
            }
            inner.dialog = dialog;
            core.set_state(&mut inner, SessionState::Established);
        }
        core.started().await
    }
}

#[async_trait]
impl Session for OriginatingChatSession {
    fn core(&self) -> &Arc<ChatSessionCore> {
        &self.core
    }

    async fn start(&self) -> ImResult<()> {
        let core = &self.core;
        let mut dialog = {
            let inner = core.inner.lock().await;
            if inner.state != SessionState::Pending {
                return Err(im_error(
                    InstantMessageErrorCode::UnexpectedException,
                    "Session already started",
                ));
            }
            inner.dialog.clone()
        };

        info!(session_id = %core.session_id, "Inviting {} to chat", core.remote);
        let sdp = core.media.local_sdp();
        dialog.set_local_content(Some(sdp.clone()));

        let response = match self.send_invite(&mut dialog, &sdp).await {
            Ok(response) => response,
            Err(e) => {
                return Err(core
                    .fail(im_error(InstantMessageErrorCode::SessionInitiationFailed, e))
                    .await)
            }
        };

        let status = response.status_code();
        match status {
            200 => self.establish(dialog, &response).await,
            486 | 603 => Err(core
                .fail(im_error(
                    InstantMessageErrorCode::SessionInitiationDeclined,
                    format!("{} {}", status, response.reason_phrase()),
                ))
                .await),
            _ => Err(core
                .fail(im_error(
                    InstantMessageErrorCode::SessionInitiationFailed,
                    format!("{} {}", status, response.reason_phrase()),
                ))
                .await),
        }
    }

    async fn accept(&self) -> ImResult<()> {
        Err(im_error(
            InstantMessageErrorCode::UnexpectedException,
            "Outgoing session can't be accepted",
        ))
    }

    async fn reject(&self) -> ImResult<()> {
        Err(im_error(
            InstantMessageErrorCode::UnexpectedException,
            "Outgoing session can't be rejected",
        ))
    }
}

/// Session the peer invited us to
pub struct TerminatingChatSession {
    core: Arc<ChatSessionCore>,
    invite: SipRequest,
    source: SocketAddr,
}

impl TerminatingChatSession {
    pub fn new(
        services: Arc<ImsServices>,
        invite: SipRequest,
        source: SocketAddr,
        media: Arc<dyn MediaSession>,
    ) -> Result<Self> {
        let call_id = invite
            .call_id()
            .ok_or_else(|| ImsError::Parse("INVITE without Call-ID".to_string()))?;
        let from = invite
            .header("From")
            .ok_or_else(|| ImsError::Parse("INVITE without From".to_string()))?;
        let remote = services
            .parse_contact(&from)
            .ok_or_else(|| ImsError::Parse(format!("Invalid caller {}", from)))?;

        let remote_uri = name_addr_uri(&from);
        let target = invite
            .header("Contact")
            .map(|c| name_addr_uri(&c))
            .unwrap_or_else(|| remote_uri.clone());
        let mut dialog = DialogPath::from_incoming(
            call_id,
            invite.cseq().unwrap_or(1),
            target,
            services.profile.public_uri.clone(),
            remote_uri,
            invite.from_tag(),
        );
        dialog.set_route(vec![format!(
            "<sip:{};lr>",
            services.transactions.outbound_proxy()
        )]);
        dialog.set_remote_content(invite.content());

        Ok(Self {
            core: ChatSessionCore::new(services, remote, media, dialog),
            invite,
            source,
        })
    }

    async fn respond(&self, status: u16, sdp: Option<&str>, local_tag: &str) -> Result<()> {
        let services = &self.core.services;
        let mut builder = ResponseBuilder::new(status).to_tag(local_tag);
        if let Some(sdp) = sdp {
            builder = builder
                .header(Header::Contact(
                    services.factory.contact(&chat_feature_tags()).into(),
                ))
                .content("application/sdp", sdp.as_bytes());
        }
        let response = builder.build_for_request(&self.invite)?;
        services
            .transactions
            .send_response(response, self.source)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Session for TerminatingChatSession {
    fn core(&self) -> &Arc<ChatSessionCore> {
        &self.core
    }

    async fn start(&self) -> ImResult<()> {
        Err(im_error(
            InstantMessageErrorCode::UnexpectedException,
            "Incoming session is started by accepting it",
        ))
    }

    async fn accept(&self) -> ImResult<()> {
        let core = &self.core;
        let sdp = core.media.local_sdp();
        {
            let mut inner = core.inner.lock().await;
            if inner.state != SessionState::Pending {
                return Err(im_error(
                    InstantMessageErrorCode::UnexpectedException,
                    "Session already answered",
                ));
            }
            let local_tag = inner.dialog.local_tag().to_string();
            if let Err(e) = self.respond(200, Some(&sdp), &local_tag).await {
                drop(inner);
                return Err(core
                    .fail(im_error(InstantMessageErrorCode::SessionInitiationFailed, e))
                    .await);
            }
            inner.dialog.set_local_content(Some(sdp));
            inner.dialog.set_established();
            core.set_state(&mut inner, SessionState::Established);
        }
        info!(session_id = %core.session_id, "Accepted chat from {}", core.remote);
        core.started().await
    }

    async fn reject(&self) -> ImResult<()> {
        let core = &self.core;
        let local_tag = {
            let inner = core.inner.lock().await;
            if inner.state != SessionState::Pending {
                return Err(im_error(
                    InstantMessageErrorCode::UnexpectedException,
                    "Session already answered",
                ));
            }
            inner.dialog.local_tag().to_string()
        };
        info!(session_id = %core.session_id, "Rejecting chat from {}", core.remote);
        if let Err(e) = self.respond(486, None, &local_tag).await {
            warn!(session_id = %core.session_id, "Can't send 486: {}", e);
        }
        core.terminate(Some(im_error(
            InstantMessageErrorCode::SessionInitiationDeclined,
            "Rejected locally",
        )))
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::im::MockMediaSession;
    use crate::application::test_support::{proxy_challenge, TestPeer};
    use crate::domain::instant_messaging::MessageHistory;
    use crate::infrastructure::protocols::sip::SipMethod;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    const LOCAL_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\nm=message 9 TCP/MSRP *\r\n";
    const REMOTE_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.2\r\nm=message 7394 TCP/MSRP *\r\n";

    /// Media session recording what goes through it
    #[derive(Default)]
    struct FakeMedia {
        sent: StdMutex<Vec<(String, String)>>,
        opened: StdMutex<Option<String>>,
        closed: AtomicBool,
        fail_sends: AtomicBool,
    }

    impl FakeMedia {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MediaSession for FakeMedia {
        fn local_sdp(&self) -> String {
            LOCAL_SDP.to_string()
        }

        async fn open(&self, remote_sdp: &str) -> Result<()> {
            *self.opened.lock().unwrap() = Some(remote_sdp.to_string());
            Ok(())
        }

        async fn send_chunks(&self, _message_id: &str, content_type: &str, data: Bytes) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ImsError::Transport("MSRP connection lost".to_string()));
            }
            self.sent.lock().unwrap().push((
                content_type.to_string(),
                String::from_utf8_lossy(&data).into_owned(),
            ));
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn bob() -> ContactId {
        ContactId::parse("+33600000002", "33").unwrap()
    }

    fn inbound_invite() -> SipRequest {
        let data = format!(
            "INVITE sip:+33600000001@127.0.0.1:5062 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKinvite1\r\n\
             From: <sip:+33600000002@ims.example.org>;tag=bob-tag\r\n\
             To: <sip:+33600000001@ims.example.org>\r\n\
             Call-ID: chat-1@127.0.0.1\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:+33600000002@127.0.0.1:5070>;+g.oma.sip-im\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            REMOTE_SDP.len(),
            REMOTE_SDP
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    async fn established(peer: &mut TestPeer, media: Arc<FakeMedia>) -> TerminatingChatSession {
        let session = TerminatingChatSession::new(
            peer.services.clone(),
            inbound_invite(),
            "127.0.0.1:5060".parse().unwrap(),
            media,
        )
        .unwrap();
        session.accept().await.unwrap();
        assert_eq!(peer.next_response().await.status_code(), 200);
        session
    }

    #[tokio::test]
    async fn test_originating_session_established() {
        let mut peer = TestPeer::new().await;
        let mut media = MockMediaSession::new();
        media.expect_local_sdp().returning(|| LOCAL_SDP.to_string());
        media
            .expect_open()
            .withf(|sdp| sdp == REMOTE_SDP)
            .times(1)
            .returning(|_| Ok(()));
        let session = Arc::new(OriginatingChatSession::new(
            peer.services.clone(),
            bob(),
            Arc::new(media),
        ));

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        let invite = peer.next_request().await;
        assert_eq!(invite.method(), SipMethod::Invite);
        assert!(invite.header("Contribution-ID").is_some());
        assert!(invite.header("Accept-Contact").unwrap().contains("+g.oma.sip-im"));
        assert_eq!(invite.content().as_deref(), Some(LOCAL_SDP));

        peer.respond_with_body(&invite, 200, &[], Some(("application/sdp", REMOTE_SDP)));
        let ack = peer.next_request().await;
        assert_eq!(ack.method(), SipMethod::Ack);
        assert_eq!(ack.cseq(), invite.cseq());
        assert_eq!(ack.to_tag().as_deref(), Some("peer-tag"));

        task.await.unwrap().unwrap();
        assert_eq!(session.core().state().await, SessionState::Established);
        assert_eq!(peer.recorder.types(), vec!["chat_started"]);
    }

    #[tokio::test]
    async fn test_originating_session_answers_proxy_challenge() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = Arc::new(OriginatingChatSession::new(
            peer.services.clone(),
            bob(),
            media.clone(),
        ));

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        let first = peer.next_request().await;
        peer.respond(&first, 407, &[proxy_challenge()]);

        let second = peer.next_request().await;
        assert_eq!(second.cseq(), Some(2));
        assert!(second.header("Proxy-Authorization").is_some());
        assert_eq!(second.call_id(), first.call_id());
        peer.respond_with_body(&second, 200, &[], Some(("application/sdp", REMOTE_SDP)));

        assert_eq!(peer.next_request().await.cseq(), Some(2));
        task.await.unwrap().unwrap();
        assert_eq!(media.opened.lock().unwrap().as_deref(), Some(REMOTE_SDP));
    }

    #[tokio::test]
    async fn test_originating_session_declined() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = Arc::new(OriginatingChatSession::new(
            peer.services.clone(),
            bob(),
            media.clone(),
        ));

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        let invite = peer.next_request().await;
        peer.respond(&invite, 486, &[]);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code, InstantMessageErrorCode::SessionInitiationDeclined);
        assert_eq!(session.core().state().await, SessionState::Terminated);
        assert!(media.closed.load(Ordering::SeqCst));
        assert!(peer.idle());
        match &peer.recorder.events()[0] {
            ImsEvent::ChatAborted { error: Some(e), .. } => {
                assert_eq!(e.code, InstantMessageErrorCode::SessionInitiationDeclined)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_originating_session_failed() {
        let mut peer = TestPeer::new().await;
        let session = Arc::new(OriginatingChatSession::new(
            peer.services.clone(),
            bob(),
            Arc::new(FakeMedia::default()),
        ));

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        let invite = peer.next_request().await;
        peer.respond(&invite, 500, &[]);

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code, InstantMessageErrorCode::SessionInitiationFailed);
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn test_terminating_accept() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = TerminatingChatSession::new(
            peer.services.clone(),
            inbound_invite(),
            "127.0.0.1:5060".parse().unwrap(),
            media.clone(),
        )
        .unwrap();
        assert_eq!(session.core().remote(), &bob());

        session.accept().await.unwrap();
        let response = peer.next_response().await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.content().as_deref(), Some(LOCAL_SDP));
        assert!(response.to_tag().is_some());
        assert_eq!(media.opened.lock().unwrap().as_deref(), Some(REMOTE_SDP));
        assert_eq!(session.core().state().await, SessionState::Established);
        assert_eq!(peer.recorder.types(), vec!["chat_started"]);
        assert!(session.accept().await.is_err());
    }

    #[tokio::test]
    async fn test_terminating_reject() {
        let mut peer = TestPeer::new().await;
        let session = TerminatingChatSession::new(
            peer.services.clone(),
            inbound_invite(),
            "127.0.0.1:5060".parse().unwrap(),
            Arc::new(FakeMedia::default()),
        )
        .unwrap();

        session.reject().await.unwrap();
        assert_eq!(peer.next_response().await.status_code(), 486);
        assert_eq!(session.core().state().await, SessionState::Terminated);
        assert_eq!(peer.recorder.types(), vec!["chat_aborted"]);
    }

    #[tokio::test]
    async fn test_send_text_message() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;

        let id = session.send_text_message("hello").await.unwrap();
        let sent = media.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MIME_CPIM);
        let cpim = CpimMessage::parse(&sent[0].1).unwrap();
        assert_eq!(cpim.body, "hello");
        assert_eq!(cpim.content_type, MIME_TEXT_PLAIN);

        let stored = peer.history.get_message(&id).await.unwrap();
        assert_eq!(cpim.message_id(), stored.imdn_message_id.as_deref());
        assert_eq!(stored.status, None);
    }

    #[tokio::test]
    async fn test_send_failure_marks_message_failed() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;
        media.fail_sends.store(true, Ordering::SeqCst);

        let err = session.send_text_message("hello").await.unwrap_err();
        assert_eq!(err.code, InstantMessageErrorCode::MsgTransferFailed);

        let all = peer.history.all().await;
        assert_eq!(all[0].status, Some(DeliveryStatus::Failed));
        assert!(peer.recorder.events().iter().any(|e| matches!(
            e,
            ImsEvent::MessageDeliveryStatus {
                status: DeliveryStatus::Failed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_send_requires_established_session() {
        let peer = TestPeer::new().await;
        let session = OriginatingChatSession::new(
            peer.services.clone(),
            bob(),
            Arc::new(FakeMedia::default()),
        );
        let err = session.send_text_message("too early").await.unwrap_err();
        assert_eq!(err.code, InstantMessageErrorCode::UnexpectedException);
    }

    #[tokio::test]
    async fn test_geoloc_push() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;

        let geoloc = GeolocPush {
            label: "office".to_string(),
            latitude: 48.85,
            longitude: 2.35,
            accuracy: 10.0,
            expiration: Utc::now(),
        };
        session.core().send_geoloc(geoloc).await.unwrap();
        let cpim = CpimMessage::parse(&media.sent()[0].1).unwrap();
        assert_eq!(cpim.content_type, MIME_GEOLOC);
    }

    #[tokio::test]
    async fn test_receive_text_sends_delivery_report() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;

        let incoming = CpimMessage::build(MIME_TEXT_PLAIN, "hi there", Some("msg-42")).render();
        session
            .core()
            .receive_data(MIME_CPIM, incoming.as_bytes())
            .await
            .unwrap();

        match peer.recorder.events().last().unwrap() {
            ImsEvent::ChatMessageReceived {
                message_id, text, ..
            } => {
                assert_eq!(message_id.as_deref(), Some("msg-42"));
                assert_eq!(text, "hi there");
            }
            other => panic!("unexpected event {:?}", other),
        }

        let report = CpimMessage::parse(&media.sent()[0].1).unwrap();
        assert_eq!(report.content_type, MIME_IMDN);
        let report = ImdnDocument::parse(&report.body).unwrap();
        assert_eq!(report.message_id, "msg-42");
        assert_eq!(report.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_receive_delivery_report_updates_history() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;

        let id = session.send_text_message("hello").await.unwrap();
        let imdn_id = peer
            .history
            .get_message(&id)
            .await
            .unwrap()
            .imdn_message_id
            .unwrap();

        let report = ImdnDocument {
            message_id: imdn_id,
            datetime: None,
            status: DeliveryStatus::Displayed,
        };
        let body = CpimMessage::build(MIME_IMDN, &report.to_xml().unwrap(), None).render();
        session
            .core()
            .receive_data(MIME_CPIM, body.as_bytes())
            .await
            .unwrap();

        assert_eq!(
            peer.history.get_message(&id).await.unwrap().status,
            Some(DeliveryStatus::Displayed)
        );
        match peer.recorder.events().last() {
            Some(ImsEvent::MessageDeliveryStatus {
                message_id, status, ..
            }) => {
                assert_eq!(message_id, &id);
                assert_eq!(*status, DeliveryStatus::Displayed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_is_composing() {
        let mut peer = TestPeer::new().await;
        let session = established(&mut peer, Arc::new(FakeMedia::default())).await;

        let xml = IsComposingInfo::active(60).to_xml().unwrap();
        session
            .core()
            .receive_data(MIME_IS_COMPOSING, xml.as_bytes())
            .await
            .unwrap();
        assert!(matches!(
            peer.recorder.events().last().unwrap(),
            ImsEvent::ContactComposing {
                composing: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transfer_error_refreshes_capabilities() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;
        let id = session.send_text_message("hello").await.unwrap();

        let task = session.core().handle_msrp_transfer_error(&id).await;
        assert_eq!(
            peer.history.get_message(&id).await.unwrap().status,
            Some(DeliveryStatus::Failed)
        );
        let options = peer.next_request().await;
        assert_eq!(options.method(), SipMethod::Options);
        peer.respond(&options, 404, &[]);
        assert!(matches!(task.await.unwrap(), OptionsOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn test_abort_sends_bye() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = Arc::new(established(&mut peer, media.clone()).await);

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.abort().await }
        });
        let bye = peer.next_request().await;
        assert_eq!(bye.method(), SipMethod::Bye);
        assert_eq!(bye.call_id().as_deref(), Some("chat-1@127.0.0.1"));
        assert_eq!(bye.to_tag().as_deref(), Some("bob-tag"));
        peer.respond(&bye, 200, &[]);
        task.await.unwrap();

        assert!(media.closed.load(Ordering::SeqCst));
        assert_eq!(session.core().state().await, SessionState::Terminated);
        assert_eq!(peer.recorder.types(), vec!["chat_started", "chat_aborted"]);

        // Second abort does nothing
        session.abort().await;
        assert!(peer.idle());
    }

    #[tokio::test]
    async fn test_terminated_by_remote() {
        let mut peer = TestPeer::new().await;
        let media = Arc::new(FakeMedia::default());
        let session = established(&mut peer, media.clone()).await;

        session.core().terminated_by_remote().await;
        session.core().terminated_by_remote().await;
        assert!(media.closed.load(Ordering::SeqCst));
        assert!(peer.idle());
        assert_eq!(
            peer.recorder.types(),
            vec!["chat_started", "chat_terminated_by_remote"]
        );
    }
}
