//! Handles shared by every service of the IMS module

use crate::config::Config;
use crate::domain::capability::{Capabilities, ContactStore};
use crate::domain::instant_messaging::MessageHistory;
use crate::domain::presence::Registry;
use crate::domain::shared::{ContactId, EventBus};
use crate::infrastructure::protocols::sip::{
    generate_call_id, DialogPath, SipMessageFactory, TransactionLayer, UserCredentials,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identity of the local user
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub username: String,
    pub home_domain: String,
    pub public_uri: String,
    pub credentials: UserCredentials,
    pub country_code: String,
    pub access_network_info: Option<String>,
}

impl UserProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            username: config.ims.username.clone(),
            home_domain: config.ims.home_domain.clone(),
            public_uri: config.ims.public_uri(),
            credentials: UserCredentials::new(
                config.ims.auth_username.clone(),
                config.ims.password.clone(),
            ),
            country_code: config.ims.country_code.clone(),
            access_network_info: config.ims.access_network_info.clone(),
        }
    }
}

/// Injected collaborators, shared by all managers
pub struct ImsServices {
    pub transactions: Arc<TransactionLayer>,
    pub factory: SipMessageFactory,
    pub profile: UserProfile,
    pub contacts: Arc<dyn ContactStore>,
    pub registry: Arc<dyn Registry>,
    pub history: Arc<dyn MessageHistory>,
    pub events: Arc<EventBus>,
    pub config: Arc<Config>,
    registered: AtomicBool,
}

impl ImsServices {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Arc<TransactionLayer>,
        profile: UserProfile,
        contacts: Arc<dyn ContactStore>,
        registry: Arc<dyn Registry>,
        history: Arc<dyn MessageHistory>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let factory = SipMessageFactory::new(
            transactions.local_addr(),
            transactions.protocol(),
            config.sip.user_agent.clone(),
            profile.username.clone(),
        );
        Arc::new(Self {
            transactions,
            factory,
            profile,
            contacts,
            registry,
            history,
            events,
            config,
            registered: AtomicBool::new(false),
        })
    }

    /// Whether the IMS registration is currently active
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    /// What we advertise to peers
    pub fn local_capabilities(&self) -> Capabilities {
        self.config.capability.to_capabilities()
    }

    pub fn contact_uri(&self, contact: &ContactId) -> String {
        contact.to_sip_uri(&self.profile.home_domain)
    }

    /// Normalize a number or URI with our country code
    pub fn parse_contact(&self, input: &str) -> Option<ContactId> {
        ContactId::parse(input, &self.profile.country_code)
    }

    /// Fresh dialog from us to `remote`, routed through the outbound proxy
    pub fn new_dialog(&self, target: &str, remote: &str) -> DialogPath {
        DialogPath::new(
            generate_call_id(&self.factory.local_addr().ip().to_string()),
            target,
            self.profile.public_uri.clone(),
            remote,
            vec![format!("<sip:{};lr>", self.transactions.outbound_proxy())],
        )
    }
}
