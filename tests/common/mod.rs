//! Scripted network peer driving an `ImsModule` over a channel transport

#![allow(dead_code)]

use rcs_ims::application::{ImsModule, ImsServices, MediaFactory, UserProfile};
use rcs_ims::config::Config;
use rcs_ims::domain::shared::{EventBus, ImsEvent, ImsListener, ListenerError};
use rcs_ims::infrastructure::persistence::{
    MemoryContactStore, MemoryMessageHistory, MemoryRegistry,
};
use rcs_ims::infrastructure::protocols::sip::{
    ChannelTransport, IncomingMessage, OutgoingMessage, ResponseBuilder, SipMessage, SipRequest,
    SipResponse, TransactionLayer,
};
use rsip::Header;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const PROXY: &str = "127.0.0.1:5060";

pub const PROXY_CHALLENGE: (&str, &str) = (
    "Proxy-Authenticate",
    "Digest realm=\"ims.example.org\", nonce=\"n0nce\", qop=\"auth\", algorithm=MD5",
);

#[derive(Default)]
pub struct EventRecorder(Mutex<Vec<ImsEvent>>);

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

pub struct Peer {
    pub module: Arc<ImsModule>,
    pub contacts: Arc<MemoryContactStore>,
    pub registry: Arc<MemoryRegistry>,
    pub history: Arc<MemoryMessageHistory>,
    pub events: Arc<EventRecorder>,
    sent: mpsc::UnboundedReceiver<OutgoingMessage>,
}

impl Peer {
    pub async fn new() -> Self {
        Self::build(Config::default(), Arc::new(MemoryRegistry::new()), None).await
    }

    pub async fn build(
        config: Config,
        registry: Arc<MemoryRegistry>,
        media: Option<MediaFactory>,
    ) -> Self {
        let (transport, sent) = ChannelTransport::new("127.0.0.1:5062".parse().unwrap());
        let transactions = TransactionLayer::new(
            transport,
            PROXY.parse().unwrap(),
            Duration::from_secs(30),
            Duration::from_secs(120),
        );
        let contacts = Arc::new(MemoryContactStore::new());
        let history = Arc::new(MemoryMessageHistory::new());
        let bus = Arc::new(EventBus::new());
        let events = Arc::new(EventRecorder::default());
        bus.add_listener(events.clone()).await;

        let services = ImsServices::new(
            transactions,
            UserProfile::from_config(&config),
            contacts.clone(),
            registry.clone(),
            history.clone(),
            bus,
            Arc::new(config),
        );
        services.set_registered(true);

        Self {
            module: ImsModule::new(services, media),
            contacts,
            registry,
            history,
            events,
            sent,
        }
    }

    pub fn services(&self) -> &Arc<ImsServices> {
        self.module.services()
    }

    pub async fn next_message(&mut self) -> SipMessage {
        let outgoing = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("nothing sent")
            .expect("transport closed");
        SipMessage::parse(&outgoing.data).unwrap()
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
            SipMessage::Request(request) => panic!("expected a request, got {:?}", request),
        }
    }

    pub fn idle(&mut self) -> bool {
        self.sent.try_recv().is_err()
    }

    /// Answer one of our requests through the module dispatcher
    pub fn respond(&self, request: &SipRequest, status: u16, headers: &[(&str, &str)]) {
        self.respond_with_body(request, status, headers, None);
    }

    pub fn respond_with_body(
        &self,
        request: &SipRequest,
        status: u16,
        headers: &[(&str, &str)],
        body: Option<(&str, &str)>,
    ) {
        let mut builder = ResponseBuilder::new(status).to_tag("peer-tag");
        for (name, value) in headers {
            builder = builder.header(Header::Other(name.to_string(), value.to_string()));
        }
        if let Some((content_type, body)) = body {
            builder = builder.content(content_type, body.as_bytes());
        }
        let response = builder.build_for_request(request).unwrap();
        self.deliver(SipMessage::Response(response));
    }

    /// Inject a message as if it arrived from the proxy
    pub fn deliver(&self, message: SipMessage) {
        self.module.clone().handle_incoming(IncomingMessage {
            message,
            source: PROXY.parse::<SocketAddr>().unwrap(),
        });
    }
}
