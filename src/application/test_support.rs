//! Scripted network peer for manager tests

use super::services::{ImsServices, UserProfile};
use crate::config::Config;
use crate::domain::shared::{EventBus, ImsEvent, ImsListener, ListenerError};
use crate::infrastructure::persistence::{MemoryContactStore, MemoryMessageHistory, MemoryRegistry};
use crate::infrastructure::protocols::sip::{
    ChannelTransport, OutgoingMessage, ResponseBuilder, SipMessage, SipRequest, SipResponse,
    TransactionLayer,
};
use rsip::Header;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub(crate) struct EventRecorder(Mutex<Vec<ImsEvent>>);

impl EventRecorder {
    pub fn events(&self) -> Vec<ImsEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.event_type()).collect()
    }
}

impl ImsListener for EventRecorder {
    fn on_event(&self, event: &ImsEvent) -> Result<(), ListenerError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub(crate) struct TestPeer {
    pub services: Arc<ImsServices>,
    pub contacts: Arc<MemoryContactStore>,
    pub registry: Arc<MemoryRegistry>,
    pub history: Arc<MemoryMessageHistory>,
    pub recorder: Arc<EventRecorder>,
    sent: mpsc::UnboundedReceiver<OutgoingMessage>,
}

impl TestPeer {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let (transport, sent) = ChannelTransport::new("127.0.0.1:5062".parse().unwrap());
        let transactions = TransactionLayer::new(
            transport,
            "127.0.0.1:5060".parse().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        let contacts = Arc::new(MemoryContactStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        let history = Arc::new(MemoryMessageHistory::new());
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(EventRecorder::default());
        events.add_listener(recorder.clone()).await;

        let services = ImsServices::new(
            transactions,
            UserProfile::from_config(&config),
            contacts.clone(),
            registry.clone(),
            history.clone(),
            events,
            Arc::new(config),
        );
        services.set_registered(true);

        Self {
            services,
            contacts,
            registry,
            history,
            recorder,
            sent,
        }
    }

    pub async fn next_message(&mut self) -> SipMessage {
        let outgoing = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("nothing sent")
            .expect("transport closed");
        SipMessage::parse(&outgoing.data).unwrap()
    }

    /// Drop the far end of the transport so every later send fails
    pub fn close_transport(&mut self) {
        self.sent.close();
    }

    pub async fn next_request(&mut self) -> SipRequest {
        match self.next_message().await {
            SipMessage::Request(request) => request,
            SipMessage::Response(response) => panic!("expected a request, got {:?}", response),
        }
    }

    pub async fn next_response(&mut self) -> SipResponse {
        match self.next_message().await {
            SipMessage::Response(response) => response,
            SipMessage::Request(request) => panic!("expected a response, got {:?}", request),
        }
    }

    /// True when nothing is queued on the wire
    pub fn idle(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    pub fn respond(&self, request: &SipRequest, status: u16, headers: &[(&str, &str)]) -> bool {
        self.respond_with_body(request, status, headers, None)
    }

    pub fn respond_with_body(
        &self,
        request: &SipRequest,
        status: u16,
        headers: &[(&str, &str)],
        body: Option<(&str, &str)>,
    ) -> bool {
        let mut builder = ResponseBuilder::new(status).to_tag("peer-tag");
        for (name, value) in headers {
            builder = builder.header(Header::Other(name.to_string(), value.to_string()));
        }
        if let Some((content_type, body)) = body {
            builder = builder.content(content_type, body.as_bytes());
        }
        let response = builder.build_for_request(request).unwrap();
        self.services.transactions.on_response(response)
    }
}

pub(crate) fn proxy_challenge() -> (&'static str, &'static str) {
    (
        "Proxy-Authenticate",
        "Digest realm=\"ims.example.org\", nonce=\"abc123\", qop=\"auth\", algorithm=MD5",
    )
}
