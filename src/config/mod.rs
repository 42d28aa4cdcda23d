//! Configuration management
//!
//! Built-in defaults are layered under an optional TOML file and
//! `RCS__SECTION__KEY` environment variables.

use crate::domain::capability::Capabilities;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ims: ImsConfig,
    pub sip: SipConfig,
    pub presence: PresenceConfig,
    pub capability: CapabilityConfig,
    pub im: ImConfig,
    pub registry: RegistryConfig,
    pub metrics: MetricsConfig,
}

/// User profile and IMS network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImsConfig {
    pub username: String,
    pub home_domain: String,
    pub auth_username: String,
    pub password: String,
    pub outbound_proxy: String,
    pub country_code: String,
    /// Value of `P-Access-Network-Info`, if the network expects one
    pub access_network_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub user_agent: String,
    pub transaction_timeout_secs: u64,
    pub invite_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enabled: bool,
    pub publish_expire_period: u32,
    pub subscribe_expire_period: u32,
    /// Random share removed from each refresh delay
    pub refresh_jitter: f64,
}

/// Capabilities this client advertises
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub im_session: bool,
    pub file_transfer: bool,
    pub file_transfer_http: bool,
    pub image_sharing: bool,
    pub video_sharing: bool,
    pub geoloc_push: bool,
    pub presence_discovery: bool,
    pub social_presence: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImConfig {
    pub imdn_enabled: bool,
    pub composing_idle_timeout_secs: u64,
    pub composing_refresh_secs: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file; the registry stays in memory when unset
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape endpoint, disabled when unset
    pub listen: Option<String>,
}

impl Default for ImsConfig {
    fn default() -> Self {
        Self {
            username: "+33600000001".to_string(),
            home_domain: "ims.example.org".to_string(),
            auth_username: "+33600000001@ims.example.org".to_string(),
            password: "secret".to_string(),
            outbound_proxy: "127.0.0.1:5060".to_string(),
            country_code: "33".to_string(),
            access_network_info: None,
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5062,
            user_agent: format!("rcs-ims/{}", env!("CARGO_PKG_VERSION")),
            transaction_timeout_secs: 30,
            invite_timeout_secs: 120,
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            publish_expire_period: 3600,
            subscribe_expire_period: 3600,
            refresh_jitter: 0.0,
        }
    }
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            im_session: true,
            file_transfer: true,
            file_transfer_http: false,
            image_sharing: true,
            video_sharing: false,
            geoloc_push: true,
            presence_discovery: true,
            social_presence: true,
        }
    }
}

impl Default for ImConfig {
    fn default() -> Self {
        Self {
            imdn_enabled: true,
            composing_idle_timeout_secs: 5,
            composing_refresh_secs: 60,
        }
    }
}

impl Config {
    /// Defaults, then the optional file, then `RCS__` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder
            .add_source(config::Environment::with_prefix("RCS").separator("__"))
            .build()?
            .try_deserialize()
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.sip.bind_address, self.sip.bind_port).parse()
    }

    pub fn outbound_proxy(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.ims.outbound_proxy.parse()
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.sip.transaction_timeout_secs)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.sip.invite_timeout_secs)
    }
}

impl ImsConfig {
    /// Our public identity
    pub fn public_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.home_domain)
    }
}

impl CapabilityConfig {
    pub fn to_capabilities(&self) -> Capabilities {
        Capabilities {
            im_session: self.im_session,
            file_transfer: self.file_transfer,
            file_transfer_http: self.file_transfer_http,
            image_sharing: self.image_sharing,
            video_sharing: self.video_sharing,
            geoloc_push: self.geoloc_push,
            presence_discovery: self.presence_discovery,
            social_presence: self.social_presence,
            ..Capabilities::empty()
        }
    }
}

impl ImConfig {
    pub fn composing_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.composing_idle_timeout_secs)
    }
}
