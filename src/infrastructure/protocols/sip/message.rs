//! SIP message types and header access

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// SIP method types used by the client stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Info,
    Update,
    Prack,
    Subscribe,
    Notify,
    Refer,
    Message,
    Publish,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Info => "INFO",
            SipMethod::Update => "UPDATE",
            SipMethod::Prack => "PRACK",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Publish => "PUBLISH",
        }
    }

    pub fn from_rsip(method: &Method) -> Self {
        match method {
            Method::Register => SipMethod::Register,
            Method::Invite => SipMethod::Invite,
            Method::Ack => SipMethod::Ack,
            Method::Cancel => SipMethod::Cancel,
            Method::Bye => SipMethod::Bye,
            Method::Options => SipMethod::Options,
            Method::Info => SipMethod::Info,
            Method::Update => SipMethod::Update,
            Method::PRack => SipMethod::Prack,
            Method::Subscribe => SipMethod::Subscribe,
            Method::Notify => SipMethod::Notify,
            Method::Refer => SipMethod::Refer,
            Method::Message => SipMethod::Message,
            Method::Publish => SipMethod::Publish,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Info => Method::Info,
            SipMethod::Update => Method::Update,
            SipMethod::Prack => Method::PRack,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Message => Method::Message,
            SipMethod::Publish => Method::Publish,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map compact header forms (RFC 3261 7.3.3) to their full names
fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "m" | "M" => "Contact",
        "c" | "C" => "Content-Type",
        "l" | "L" => "Content-Length",
        "o" | "O" => "Event",
        "k" | "K" => "Supported",
        "a" | "A" => "Accept-Contact",
        _ => name,
    }
}

/// Split a header into its name and value.
///
/// rsip renders every header variant as `Name: value`, typed or not, so the
/// rendered form is the common ground for lookups by name.
fn split_header(header: &Header) -> Option<(String, String)> {
    let raw = header.to_string();
    let (name, value) = raw.split_once(':')?;
    Some((
        canonical_name(name.trim()).to_string(),
        value.trim().to_string(),
    ))
}

/// First value of the named header (case-insensitive)
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().find_map(|h| {
        split_header(h).and_then(|(n, v)| n.eq_ignore_ascii_case(name).then_some(v))
    })
}

/// Extract a `;name=value` parameter from a header value
pub fn header_param(value: &str, param: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(param)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Common accessors shared by requests and responses
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn body(&self) -> &[u8];

    fn header(&self, name: &str) -> Option<String> {
        header_value(self.headers(), name)
    }

    fn call_id(&self) -> Option<String> {
        self.header("Call-ID")
    }

    fn from_tag(&self) -> Option<String> {
        self.header("From").and_then(|v| header_param(&v, "tag"))
    }

    fn to_tag(&self) -> Option<String> {
        self.header("To").and_then(|v| header_param(&v, "tag"))
    }

    fn cseq(&self) -> Option<u32> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().next().and_then(|n| n.parse().ok()))
    }

    fn cseq_method(&self) -> Option<String> {
        self.header("CSeq")
            .and_then(|v| v.split_whitespace().nth(1).map(|m| m.to_string()))
    }

    /// Branch parameter of the top Via header
    fn via_branch(&self) -> Option<String> {
        self.header("Via").and_then(|v| header_param(&v, "branch"))
    }

    /// Expires header value; -1 style "absent" is `None`
    fn expires(&self) -> Option<u32> {
        self.header("Expires").and_then(|v| v.trim().parse().ok())
    }

    fn content_type(&self) -> Option<String> {
        self.header("Content-Type")
    }

    /// Body as UTF-8 text, `None` when empty
    fn content(&self) -> Option<String> {
        let body = self.body();
        if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(body).into_owned())
        }
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> SipMethod {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    /// Append a header; used for Authorization and extension headers
    pub fn add_header(&mut self, header: Header) {
        self.inner.headers.push(header);
    }

    /// Remove every header with the given name
    pub fn remove_header(&mut self, name: &str) {
        self.inner.headers.retain(|h| {
            split_header(h)
                .map(|(n, _)| !n.eq_ignore_ascii_case(name))
                .unwrap_or(true)
        });
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipRequest {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    /// Reason phrase as found on the status line
    pub fn reason_phrase(&self) -> String {
        let rendered = self.inner.to_string();
        rendered
            .lines()
            .next()
            .and_then(|line| line.splitn(3, ' ').nth(2))
            .map(|r| r.trim().to_string())
            .unwrap_or_default()
    }

    /// Min-Expires value of a 423 response
    pub fn min_expires(&self) -> Option<u32> {
        self.header("Min-Expires").and_then(|v| v.trim().parse().ok())
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl SipHeaders for SipResponse {
    fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    fn body(&self) -> &[u8] {
        &self.inner.body
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish_request() {
        let data = b"PUBLISH sip:alice@example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: <sip:alice@example.com>;tag=1928301774\r\n\
                     To: <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 PUBLISH\r\n\
                     Event: presence\r\n\
                     SIP-If-Match: dx200xyz\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_request());

        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), SipMethod::Publish);
        assert_eq!(req.call_id(), Some("a84b4c76e66710@pc33.example.com".to_string()));
        assert_eq!(req.cseq(), Some(314159));
        assert_eq!(req.cseq_method(), Some("PUBLISH".to_string()));
        assert_eq!(req.from_tag(), Some("1928301774".to_string()));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.via_branch(), Some("z9hG4bK776asdhds".to_string()));
        assert_eq!(req.header("sip-if-match"), Some("dx200xyz".to_string()));
        assert_eq!(req.expires(), Some(3600));
        assert!(req.content().is_none());
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 423 Interval Too Brief\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: <sip:alice@example.com>;tag=1928301774\r\n\
                     To: <sip:alice@example.com>;tag=a6c85cf\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 PUBLISH\r\n\
                     Min-Expires: 120\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        assert!(msg.is_response());

        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 423);
        assert_eq!(resp.reason_phrase(), "Interval Too Brief");
        assert_eq!(resp.min_expires(), Some(120));
        assert_eq!(resp.to_tag(), Some("a6c85cf".to_string()));
    }

    #[test]
    fn test_header_param() {
        assert_eq!(
            header_param("<sip:bob@example.com>;tag=abc;foo=\"bar\"", "foo"),
            Some("bar".to_string())
        );
        assert_eq!(header_param("active;expires=3600", "expires"), Some("3600".to_string()));
        assert_eq!(header_param("terminated", "reason"), None);
    }
}
