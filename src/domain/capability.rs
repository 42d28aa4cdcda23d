//! Contact capabilities and the contact store port
//!
//! Capabilities are learned from the feature tags a peer advertises in the
//! Contact header of an OPTIONS request or response.

use super::shared::ContactId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OMA SIMPLE IM feature tag
pub const FEATURE_OMA_IM: &str = "+g.oma.sip-im";
/// Video share feature tag
pub const FEATURE_3GPP_VIDEO_SHARE: &str = "+g.3gpp.cs-voice";
/// IMS application reference tag carrying the IARI list
pub const FEATURE_RCSE: &str = "+g.3gpp.iari-ref";

pub const IARI_FILE_TRANSFER: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcse.ft";
pub const IARI_FILE_TRANSFER_HTTP: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.fthttp";
pub const IARI_IMAGE_SHARE: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.gsma-is";
pub const IARI_GEOLOC_PUSH: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcs.geopush";
pub const IARI_PRESENCE_DISCOVERY: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcse.dp";
pub const IARI_SOCIAL_PRESENCE: &str = "urn%3Aurn-7%3A3gpp-application.ims.iari.rcse.sp";

/// Snapshot of what a contact supports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub im_session: bool,
    pub file_transfer: bool,
    pub file_transfer_http: bool,
    pub image_sharing: bool,
    pub video_sharing: bool,
    pub geoloc_push: bool,
    pub presence_discovery: bool,
    pub social_presence: bool,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl Capabilities {
    /// Empty capabilities stamped now
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Extract capabilities from a Contact header value
    pub fn from_feature_tags(contact: &str) -> Self {
        let mut caps = Self::empty();
        let lower = contact.to_ascii_lowercase();

        caps.im_session = lower.contains(FEATURE_OMA_IM);
        caps.video_sharing = lower.contains(FEATURE_3GPP_VIDEO_SHARE);

        if lower.contains(FEATURE_RCSE) {
            let has = |iari: &str| lower.contains(&iari.to_ascii_lowercase());
            caps.file_transfer = has(IARI_FILE_TRANSFER);
            caps.file_transfer_http = has(IARI_FILE_TRANSFER_HTTP);
            caps.image_sharing = has(IARI_IMAGE_SHARE);
            caps.geoloc_push = has(IARI_GEOLOC_PUSH);
            caps.presence_discovery = has(IARI_PRESENCE_DISCOVERY);
            caps.social_presence = has(IARI_SOCIAL_PRESENCE);
        }

        caps
    }

    /// Feature tags advertising these capabilities
    pub fn feature_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        if self.im_session {
            tags.push(FEATURE_OMA_IM.to_string());
        }
        if self.video_sharing {
            tags.push(FEATURE_3GPP_VIDEO_SHARE.to_string());
        }

        let iaris: Vec<&str> = [
            (self.file_transfer, IARI_FILE_TRANSFER),
            (self.file_transfer_http, IARI_FILE_TRANSFER_HTTP),
            (self.image_sharing, IARI_IMAGE_SHARE),
            (self.geoloc_push, IARI_GEOLOC_PUSH),
            (self.presence_discovery, IARI_PRESENCE_DISCOVERY),
            (self.social_presence, IARI_SOCIAL_PRESENCE),
        ]
        .into_iter()
        .filter_map(|(enabled, iari)| enabled.then_some(iari))
        .collect();

        if !iaris.is_empty() {
            tags.push(format!("{}=\"{}\"", FEATURE_RCSE, iaris.join(",")));
        }
        tags
    }
}

/// RCS status of a contact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcsStatus {
    #[default]
    NoInfo,
    RcsCapable,
    NotRcs,
}

/// Registration status of a contact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

/// Everything known about a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub contact: ContactId,
    pub capabilities: Capabilities,
    pub rcs_status: RcsStatus,
    pub registration_status: RegistrationStatus,
    pub last_refresh: Option<DateTime<Utc>>,
}

impl ContactInfo {
    /// Contact nothing is known about yet
    pub fn unknown(contact: ContactId) -> Self {
        Self {
            contact,
            capabilities: Capabilities::default(),
            rcs_status: RcsStatus::NoInfo,
            registration_status: RegistrationStatus::Unknown,
            last_refresh: None,
        }
    }
}

/// Read-then-write update applied under the store lock
pub type ContactUpdate = Box<dyn FnOnce(&ContactInfo) -> ContactInfo + Send>;

/// Contact and capability store port
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Current info; an unknown contact yields `ContactInfo::unknown`
    async fn get_contact_info(&self, contact: &ContactId) -> ContactInfo;

    /// Overwrite capabilities and statuses, refreshing the timestamp
    async fn set_contact_capabilities(
        &self,
        contact: &ContactId,
        capabilities: Capabilities,
        rcs_status: RcsStatus,
        registration_status: RegistrationStatus,
    );

    /// Touch only the last refresh timestamp
    async fn set_contact_capabilities_timestamp(&self, contact: &ContactId, at: DateTime<Utc>);

    /// Atomic read-then-write; returns the stored result
    async fn update_contact(&self, contact: &ContactId, update: ContactUpdate) -> ContactInfo;
}
