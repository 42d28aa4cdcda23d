//! Capability discovery
//!
//! A capability request sends one OPTIONS to a contact and folds the answer into the
//! contact store. The service spawns requests and answers inbound OPTIONS.

use super::services::ImsServices;
use crate::domain::capability::{Capabilities, ContactInfo, RcsStatus, RegistrationStatus};
use crate::domain::shared::{
    CapabilityError, CapabilityErrorCode, ContactId, ImsError, ImsEvent, Result,
};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::sip::{
    generate_tag, ResponseBuilder, SessionAuthenticationAgent, SipError, SipHeaders, SipRequest,
    SipResponse,
};
use chrono::Utc;
use rsip::Header;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a capability request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsOutcome {
    /// Not registered, nothing sent
    Skipped,
    /// The contact store was updated with this snapshot
    Updated(ContactInfo),
    /// Only the refresh timestamp was touched
    Failed(ImsError),
}

/// One OPTIONS request/response cycle towards a contact
pub struct OptionsRequestTask {
    services: Arc<ImsServices>,
    contact: ContactId,
    auth: SessionAuthenticationAgent,
}

impl OptionsRequestTask {
    pub fn new(services: Arc<ImsServices>, contact: ContactId) -> Self {
        let auth = SessionAuthenticationAgent::new(services.profile.credentials.clone());
        Self {
            services,
            contact,
            auth,
        }
    }

    pub async fn run(mut self) -> OptionsOutcome {
        if !self.services.is_registered() {
            debug!("Not registered, skipping OPTIONS to {}", self.contact);
            return OptionsOutcome::Skipped;
        }

        info!("Requesting capabilities of {}", self.contact);
        match self.send_options().await {
            Ok(response) => self.handle_response(&response).await,
            Err(e) => self.handle_error(e).await,
        }
    }

    /// Send the OPTIONS, answering at most one proxy challenge
    async fn send_options(&mut self) -> Result<SipResponse> {
        let target = self.services.contact_uri(&self.contact);
        let mut dialog = self.services.new_dialog(&target, &target);
        let tags = self.services.local_capabilities().feature_tags();
        let mut request = self.services.factory.create_options(&dialog, &tags)?;
        let mut challenged = false;

        loop {
            let context = self.services.transactions.send_and_wait(request).await?;
            let response = context
                .response()
                .cloned()
                .ok_or(ImsError::Timeout(self.services.config.transaction_timeout()))?;

            if response.status_code() != 407 || challenged {
                return Ok(response);
            }

            debug!("407 on OPTIONS to {}, authenticating", self.contact);
            metrics::record_auth_challenge("OPTIONS");
            challenged = true;
            self.auth.read_proxy_authenticate(&response)?;
            dialog.increment_cseq();
            request = self.services.factory.create_options(&dialog, &tags)?;
            self.auth.set_proxy_authorization(&mut request)?;
        }
    }

    async fn handle_response(&self, response: &SipResponse) -> OptionsOutcome {
        match response.status_code() {
            200 => self.handle_ok(response).await,
            480 | 408 => self.handle_not_reachable().await,
            404 => self.handle_not_found().await,
            status => {
                self.handle_error(ImsError::Protocol {
                    status,
                    reason: response.reason_phrase(),
                })
                .await
            }
        }
    }

    async fn handle_ok(&self, response: &SipResponse) -> OptionsOutcome {
        let capabilities = response
            .header("Contact")
            .map(|contact| Capabilities::from_feature_tags(&contact))
            .unwrap_or_else(Capabilities::empty);

        let (rcs_status, registration_status) = if capabilities.im_session {
            (RcsStatus::RcsCapable, RegistrationStatus::Online)
        } else {
            (RcsStatus::NotRcs, RegistrationStatus::Unknown)
        };
        metrics::record_options(if capabilities.im_session {
            "rcs_capable"
        } else {
            "not_rcs"
        });

        self.store_and_notify(capabilities, rcs_status, registration_status)
            .await
    }

    /// 480/408: the contact is known to the network but not reachable now
    async fn handle_not_reachable(&self) -> OptionsOutcome {
        metrics::record_options("offline");
        let info = self
            .services
            .contacts
            .update_contact(
                &self.contact,
                Box::new(|current| {
                    if current.rcs_status == RcsStatus::NoInfo {
                        ContactInfo {
                            capabilities: Capabilities::empty(),
                            registration_status: RegistrationStatus::Offline,
                            ..current.clone()
                        }
                    } else {
                        ContactInfo {
                            registration_status: RegistrationStatus::Offline,
                            ..current.clone()
                        }
                    }
                }),
            )
            .await;

        info!(
            "{} is offline (rcs status {:?})",
            self.contact, info.rcs_status
        );
        // Nothing worth telling for a contact we never heard about
        if info.rcs_status != RcsStatus::NoInfo {
            self.services
                .events
                .publish(ImsEvent::CapabilitiesChanged {
                    contact: self.contact.clone(),
                    capabilities: info.capabilities.clone(),
                })
                .await;
        }
        OptionsOutcome::Updated(info)
    }

    async fn handle_not_found(&self) -> OptionsOutcome {
        metrics::record_options("not_found");
        self.store_and_notify(
            Capabilities::empty(),
            RcsStatus::NotRcs,
            RegistrationStatus::Unknown,
        )
        .await
    }

    async fn handle_error(&self, error: ImsError) -> OptionsOutcome {
        let error_code = CapabilityError::new(CapabilityErrorCode::OptionsFailed, error.to_string());
        warn!("OPTIONS to {} failed: {}", self.contact, error_code);
        metrics::record_options("failed");
        self.services
            .contacts
            .set_contact_capabilities_timestamp(&self.contact, Utc::now())
            .await;
        OptionsOutcome::Failed(error)
    }

    async fn store_and_notify(
        &self,
        capabilities: Capabilities,
        rcs_status: RcsStatus,
        registration_status: RegistrationStatus,
    ) -> OptionsOutcome {
        self.services
            .contacts
            .set_contact_capabilities(
                &self.contact,
                capabilities.clone(),
                rcs_status,
                registration_status,
            )
            .await;
        self.services
            .events
            .publish(ImsEvent::CapabilitiesChanged {
                contact: self.contact.clone(),
                capabilities,
            })
            .await;
        OptionsOutcome::Updated(self.services.contacts.get_contact_info(&self.contact).await)
    }
}

/// Spawns capability requests and answers capability queries from peers
pub struct CapabilityService {
    services: Arc<ImsServices>,
}

impl CapabilityService {
    pub fn new(services: Arc<ImsServices>) -> Self {
        Self { services }
    }

    /// Start a background capability request for the given number or URI
    pub fn request_contact_capabilities(
        &self,
        contact: &str,
    ) -> std::result::Result<JoinHandle<OptionsOutcome>, CapabilityError> {
        let contact = self.services.parse_contact(contact).ok_or_else(|| {
            CapabilityError::new(
                CapabilityErrorCode::UnexpectedException,
                format!("Invalid contact {}", contact),
            )
        })?;
        let task = OptionsRequestTask::new(self.services.clone(), contact);
        Ok(tokio::spawn(task.run()))
    }

    /// Answer an inbound OPTIONS and learn the requester's capabilities
    pub async fn receive_options(&self, request: &SipRequest, source: SocketAddr) -> Result<()> {
        let tags = self.services.local_capabilities().feature_tags();
        let response = ResponseBuilder::ok()
            .to_tag(generate_tag())
            .header(Header::Contact(self.services.factory.contact(&tags).into()))
            .build_for_request(request)?;
        self.services
            .transactions
            .send_response(response, source)
            .await?;

        let from = request
            .header("From")
            .ok_or_else(|| SipError::InvalidMessage("OPTIONS without From".to_string()))?;
        let Some(contact) = self.services.parse_contact(&from) else {
            debug!("OPTIONS from non-numbered user {}, not stored", from);
            return Ok(());
        };

        let capabilities = request
            .header("Contact")
            .map(|c| Capabilities::from_feature_tags(&c))
            .unwrap_or_else(Capabilities::empty);
        let (rcs_status, registration_status) = if capabilities.im_session {
            (RcsStatus::RcsCapable, RegistrationStatus::Online)
        } else {
            (RcsStatus::NotRcs, RegistrationStatus::Unknown)
        };

        info!("Capabilities received from {}", contact);
        self.services
            .contacts
            .set_contact_capabilities(
                &contact,
                capabilities.clone(),
                rcs_status,
                registration_status,
            )
            .await;
        self.services
            .events
            .publish(ImsEvent::CapabilitiesChanged {
                contact,
                capabilities,
            })
            .await;
        Ok(())
    }
}
