//! SIP Digest Authentication (RFC 2617), client side
//!
//! One agent per logical session. The agent remembers the last challenge so
//! that retries and refreshes reuse the nonce with an increasing nonce count.

use super::message::{SipError, SipHeaders, SipRequest, SipResponse};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info};

/// Credentials of the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Parsed digest challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub stale: bool,
    /// Came from a 407 rather than a 401
    pub proxy: bool,
}

impl DigestChallenge {
    /// Parse a `Proxy-Authenticate` / `WWW-Authenticate` value
    pub fn parse(value: &str, proxy: bool) -> Result<Self, SipError> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(SipError::Authentication(format!(
                "Unsupported authentication scheme: {}",
                scheme
            )));
        }

        let params = parse_digest_params(rest);
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Challenge without nonce".to_string()))?;

        let algorithm = params.get("algorithm").cloned();
        if let Some(alg) = &algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(SipError::Authentication(format!(
                    "Unsupported digest algorithm: {}",
                    alg
                )));
            }
        }

        Ok(Self {
            realm: params.get("realm").cloned().unwrap_or_default(),
            nonce,
            opaque: params.get("opaque").cloned(),
            qop: params.get("qop").cloned(),
            algorithm,
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            proxy,
        })
    }

    /// True when the server offers qop=auth
    fn supports_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `key=value` pairs on commas outside quotes
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    params
}

/// Calculate the digest response value
#[allow(clippy::too_many_arguments)]
fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    // HA1 = MD5(username:realm:password)
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));

    // HA2 = MD5(method:uri)
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

    // Response = MD5(HA1:nonce:nc:cnonce:qop:HA2) or MD5(HA1:nonce:HA2)
    match qop {
        Some(qop_value) => format!(
            "{:x}",
            md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop_value, ha2
            ))
        ),
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2))),
    }
}

fn generate_cnonce() -> String {
    let value: u64 = rand::thread_rng().gen();
    hex::encode(value.to_be_bytes())
}

/// Client authentication state for one session
#[derive(Debug, Clone)]
pub struct SessionAuthenticationAgent {
    credentials: UserCredentials,
    challenge: Option<DigestChallenge>,
    nonce_count: u32,
}

impl SessionAuthenticationAgent {
    pub fn new(credentials: UserCredentials) -> Self {
        Self {
            credentials,
            challenge: None,
            nonce_count: 0,
        }
    }

    /// True once a challenge has been read
    pub fn has_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    pub fn challenge(&self) -> Option<&DigestChallenge> {
        self.challenge.as_ref()
    }

    /// Store the challenge of a 401/407 response
    pub fn read_proxy_authenticate(&mut self, response: &SipResponse) -> Result<(), SipError> {
        let (header, proxy) = match response.status_code() {
            407 => ("Proxy-Authenticate", true),
            401 => ("WWW-Authenticate", false),
            other => {
                return Err(SipError::Authentication(format!(
                    "Response {} carries no challenge",
                    other
                )))
            }
        };

        let value = response.header(header).ok_or_else(|| {
            SipError::Authentication(format!("{} response without {} header", response.status_code(), header))
        })?;
        let challenge = DigestChallenge::parse(&value, proxy)?;

        let fresh = self
            .challenge
            .as_ref()
            .map(|c| c.nonce != challenge.nonce)
            .unwrap_or(true);
        if fresh || challenge.stale {
            self.nonce_count = 0;
        }

        info!(
            "Digest challenge for realm {} (stale={})",
            challenge.realm, challenge.stale
        );
        self.challenge = Some(challenge);
        Ok(())
    }

    /// Adopt `nextnonce` from an `Authentication-Info` header
    pub fn update_next_nonce(&mut self, response: &SipResponse) {
        let Some(info) = response.header("Authentication-Info") else {
            return;
        };
        let params = parse_digest_params(&info);
        if let (Some(next), Some(challenge)) = (params.get("nextnonce"), self.challenge.as_mut()) {
            if challenge.nonce != *next {
                debug!("Switching to next nonce {}", next);
                challenge.nonce = next.clone();
                self.nonce_count = 0;
            }
        }
    }

    /// Attach credentials computed from the stored challenge
    pub fn set_proxy_authorization(&mut self, request: &mut SipRequest) -> Result<(), SipError> {
        let challenge = self
            .challenge
            .as_ref()
            .ok_or_else(|| SipError::Authentication("No challenge received".to_string()))?;

        let method = request.method().as_str();
        let uri = request.uri().to_string();
        let realm = challenge.realm.clone();
        let qop = challenge.supports_qop_auth().then_some("auth");

        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = generate_cnonce();

        let response = calculate_response(
            &self.credentials.username,
            &self.credentials.password,
            &realm,
            &challenge.nonce,
            method,
            &uri,
            qop,
            &nc,
            &cnonce,
        );

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
            self.credentials.username, realm, challenge.nonce, uri, response
        );
        if let Some(qop) = qop {
            value.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        let header = if challenge.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };
        request.remove_header(header);
        request.add_header(rsip::Header::Other(header.to_string(), value));

        debug!("Attached {} for {} (nc={})", header, method, nc);
        Ok(())
    }
}
