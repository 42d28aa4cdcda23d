//! SIP message builder utilities

use super::dialog::{generate_branch, DialogPath};
use super::message::{header_param, header_value, SipError, SipHeaders, SipMethod, SipRequest, SipResponse};
use super::transport::TransportProtocol;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};
use std::net::SocketAddr;

/// Generic request builder; the factory fills in the dialog headers
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Extension header rendered as `name: value`
    pub fn other(self, name: &str, value: impl Into<String>) -> Self {
        self.header(Header::Other(name.to_string(), value.into()))
    }

    pub fn content(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::ContentType(content_type.into()));
        self.body = body.into();
        self
    }

    pub fn build(mut self) -> Result<SipRequest, SipError> {
        let uri = rsip::Uri::try_from(self.uri.as_str())
            .map_err(|e| SipError::InvalidMessage(format!("Invalid request URI {}: {}", self.uri, e)))?;

        self.headers
            .push(Header::ContentLength(self.body.len().to_string().into()));

        let request = Request {
            method: self.method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(self.headers),
            body: self.body,
        };

        Ok(SipRequest::new(request))
    }
}

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    to_tag: Option<String>,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            to_tag: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn content(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.headers.push(Header::ContentType(content_type.into()));
        self.body = body.into();
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// Local tag added to To when the request carries none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::new();

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }

        let to = header_value(request.headers(), "To")
            .ok_or_else(|| SipError::InvalidMessage("Request without To header".to_string()))?;
        let to = match (&self.to_tag, header_param(&to, "tag")) {
            (Some(tag), None) => format!("{};tag={}", to, tag),
            _ => to,
        };
        headers.push(Header::To(to.into()));

        headers.extend(self.headers);
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Builds the requests the client sends, from a dialog path
#[derive(Debug, Clone)]
pub struct SipMessageFactory {
    local_addr: SocketAddr,
    protocol: TransportProtocol,
    user_agent: String,
    contact_user: String,
}

impl SipMessageFactory {
    pub fn new(
        local_addr: SocketAddr,
        protocol: TransportProtocol,
        user_agent: impl Into<String>,
        contact_user: impl Into<String>,
    ) -> Self {
        Self {
            local_addr,
            protocol,
            user_agent: user_agent.into(),
            contact_user: contact_user.into(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Contact value with optional feature tags
    pub fn contact(&self, feature_tags: &[String]) -> String {
        let mut contact = format!(
            "<sip:{}@{};transport={}>",
            self.contact_user,
            self.local_addr,
            self.protocol.as_str().to_ascii_lowercase()
        );
        for tag in feature_tags {
            contact.push(';');
            contact.push_str(tag);
        }
        contact
    }

    /// Request skeleton carrying the dialog headers
    fn base(&self, method: SipMethod, dialog: &DialogPath) -> RequestBuilder {
        let mut to = format!("<{}>", dialog.remote_party());
        if let Some(tag) = dialog.remote_tag() {
            to.push_str(&format!(";tag={}", tag));
        }

        let mut builder = RequestBuilder::new(method, dialog.target())
            .header(Header::Via(
                format!(
                    "SIP/2.0/{} {};branch={};rport",
                    self.protocol.as_str(),
                    self.local_addr,
                    generate_branch()
                )
                .into(),
            ))
            .header(Header::MaxForwards(70.into()))
            .header(Header::From(
                format!("<{}>;tag={}", dialog.local_party(), dialog.local_tag()).into(),
            ))
            .header(Header::To(to.into()))
            .header(Header::CallId(dialog.call_id().into()))
            .header(Header::CSeq(format!("{} {}", dialog.cseq(), method).into()));

        for route in dialog.route() {
            builder = builder.other("Route", route.clone());
        }

        builder.header(Header::UserAgent(self.user_agent.clone().into()))
    }

    /// PUBLISH for the presence event package
    pub fn create_publish(
        &self,
        dialog: &DialogPath,
        expires: u32,
        entity_tag: Option<&str>,
        access_info: Option<&str>,
        body: Option<&str>,
    ) -> Result<SipRequest, SipError> {
        let mut builder = self
            .base(SipMethod::Publish, dialog)
            .other("Event", "presence")
            .header(Header::Expires(expires.into()));
        if let Some(tag) = entity_tag {
            builder = builder.other("SIP-If-Match", tag);
        }
        if let Some(info) = access_info {
            builder = builder.other("P-Access-Network-Info", info);
        }
        if let Some(body) = body {
            builder = builder.content("application/pidf+xml", body.as_bytes());
        }
        builder.build()
    }

    /// SUBSCRIBE for the given event package
    pub fn create_subscribe(
        &self,
        dialog: &DialogPath,
        event: &str,
        accept: &str,
        expires: u32,
    ) -> Result<SipRequest, SipError> {
        self.base(SipMethod::Subscribe, dialog)
            .header(Header::Contact(self.contact(&[]).into()))
            .other("Event", event)
            .header(Header::Accept(accept.into()))
            .header(Header::Expires(expires.into()))
            .build()
    }

    /// OPTIONS capability query advertising our feature tags
    pub fn create_options(
        &self,
        dialog: &DialogPath,
        feature_tags: &[String],
    ) -> Result<SipRequest, SipError> {
        let mut builder = self
            .base(SipMethod::Options, dialog)
            .header(Header::Contact(self.contact(feature_tags).into()))
            .header(Header::Accept("application/sdp".into()));
        if !feature_tags.is_empty() {
            builder = builder.other("Accept-Contact", format!("*;{}", feature_tags.join(";")));
        }
        builder.build()
    }

    /// INVITE carrying the SDP offer of a chat session
    pub fn create_invite(
        &self,
        dialog: &DialogPath,
        feature_tags: &[String],
        contribution_id: &str,
        sdp: &str,
    ) -> Result<SipRequest, SipError> {
        let mut builder = self
            .base(SipMethod::Invite, dialog)
            .header(Header::Contact(self.contact(feature_tags).into()))
            .other("Contribution-ID", contribution_id)
            .other("Supported", "timer");
        if !feature_tags.is_empty() {
            builder = builder.other("Accept-Contact", format!("*;{}", feature_tags.join(";")));
        }
        builder.content("application/sdp", sdp.as_bytes()).build()
    }

    pub fn create_ack(&self, dialog: &DialogPath) -> Result<SipRequest, SipError> {
        self.base(SipMethod::Ack, dialog).build()
    }

    pub fn create_bye(&self, dialog: &DialogPath) -> Result<SipRequest, SipError> {
        self.base(SipMethod::Bye, dialog).build()
    }
}
