//! SIP dialog path
//!
//! Everything a manager needs to build successive requests on one dialog:
//! identifiers, sequence number, parties, route set and the last bodies.

use rand::Rng;
use uuid::Uuid;

/// Generate a random tag for From/To headers
pub fn generate_tag() -> String {
    let value: u64 = rand::thread_rng().gen();
    hex::encode(value.to_be_bytes())
}

/// Generate a fresh Call-ID
pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), host)
}

/// Generate an RFC 3261 compliant Via branch
pub fn generate_branch() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("z9hG4bK{}", hex::encode(value.to_be_bytes()))
}

#[derive(Debug, Clone)]
pub struct DialogPath {
    call_id: String,
    cseq: u32,
    target: String,
    local_party: String,
    remote_party: String,
    local_tag: String,
    remote_tag: Option<String>,
    route: Vec<String>,
    local_content: Option<String>,
    remote_content: Option<String>,
    established: bool,
}

impl DialogPath {
    /// New dialog with CSeq 1 and a fresh local tag
    pub fn new(
        call_id: impl Into<String>,
        target: impl Into<String>,
        local_party: impl Into<String>,
        remote_party: impl Into<String>,
        route: Vec<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            cseq: 1,
            target: target.into(),
            local_party: local_party.into(),
            remote_party: remote_party.into(),
            local_tag: generate_tag(),
            remote_tag: None,
            route,
            local_content: None,
            remote_content: None,
            established: false,
        }
    }

    /// Dialog seen from the receiving side of an inbound request
    pub fn from_incoming(
        call_id: impl Into<String>,
        cseq: u32,
        target: impl Into<String>,
        local_party: impl Into<String>,
        remote_party: impl Into<String>,
        remote_tag: Option<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            cseq,
            target: target.into(),
            local_party: local_party.into(),
            remote_party: remote_party.into(),
            local_tag: generate_tag(),
            remote_tag,
            route: Vec::new(),
            local_content: None,
            remote_content: None,
            established: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Bump the sequence number before re-sending on this dialog
    pub fn increment_cseq(&mut self) -> u32 {
        self.cseq = self.cseq.saturating_add(1);
        self.cseq
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = target.into();
    }

    pub fn local_party(&self) -> &str {
        &self.local_party
    }

    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn set_remote_tag(&mut self, tag: impl Into<String>) {
        self.remote_tag = Some(tag.into());
    }

    pub fn route(&self) -> &[String] {
        &self.route
    }

    pub fn set_route(&mut self, route: Vec<String>) {
        self.route = route;
    }

    pub fn local_content(&self) -> Option<&str> {
        self.local_content.as_deref()
    }

    pub fn set_local_content(&mut self, content: Option<String>) {
        self.local_content = content;
    }

    pub fn remote_content(&self) -> Option<&str> {
        self.remote_content.as_deref()
    }

    pub fn set_remote_content(&mut self, content: Option<String>) {
        self.remote_content = content;
    }

    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Mark the dialog confirmed by a 2xx
    pub fn set_established(&mut self) {
        self.established = true;
    }

    /// True when call id and both tags identify this dialog.
    ///
    /// `local` is the tag the peer echoes back to us, `remote` is theirs. A
    /// dialog whose remote tag is still unknown accepts any remote tag.
    pub fn matches(&self, call_id: &str, local: Option<&str>, remote: Option<&str>) -> bool {
        if self.call_id != call_id {
            return false;
        }
        if local != Some(self.local_tag.as_str()) {
            return false;
        }
        match (&self.remote_tag, remote) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog() -> DialogPath {
        DialogPath::new(
            "call-1@host",
            "sip:bob@example.com",
            "sip:alice@example.com",
            "sip:bob@example.com",
            vec!["<sip:pcscf.example.com;lr>".to_string()],
        )
    }

    #[test]
    fn test_cseq_increments() {
        let mut path = dialog();
        assert_eq!(path.cseq(), 1);
        assert_eq!(path.increment_cseq(), 2);
        assert_eq!(path.increment_cseq(), 3);
        assert_eq!(path.cseq(), 3);
    }

    #[test]
    fn test_matches() {
        let mut path = dialog();
        let local = path.local_tag().to_string();

        assert!(path.matches("call-1@host", Some(&local), Some("x")));
        assert!(!path.matches("call-2@host", Some(&local), Some("x")));
        assert!(!path.matches("call-1@host", Some("other"), Some("x")));

        path.set_remote_tag("server");
        assert!(path.matches("call-1@host", Some(&local), Some("server")));
        assert!(!path.matches("call-1@host", Some(&local), Some("x")));
        assert!(!path.matches("call-1@host", Some(&local), None));
    }

    #[test]
    fn test_generated_identifiers() {
        assert!(generate_branch().starts_with("z9hG4bK"));
        assert_ne!(generate_tag(), generate_tag());
        assert!(generate_call_id("10.0.0.1").ends_with("@10.0.0.1"));
    }
}
