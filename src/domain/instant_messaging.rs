//! Instant messaging domain
//!
//! Chat messages, delivery tracking and the XML/CPIM bodies exchanged inside
//! a chat session: CPIM envelopes (RFC 3862), IMDN (RFC 5438), is-composing
//! (RFC 3994) and geolocation push.

use super::shared::{ContactId, ImsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use uuid::Uuid;

pub const MIME_TEXT_PLAIN: &str = "text/plain";
pub const MIME_CPIM: &str = "message/cpim";
pub const MIME_IMDN: &str = "message/imdn+xml";
pub const MIME_IS_COMPOSING: &str = "application/im-iscomposing+xml";
pub const MIME_GEOLOC: &str = "application/vnd.gsma.rcspushlocation+xml";

/// Anonymous CPIM address used by RCS
const CPIM_ANONYMOUS: &str = "<sip:anonymous@anonymous.invalid>";

fn xml_error(e: impl std::fmt::Display) -> ImsError {
    ImsError::Parse(e.to_string())
}

/// Generate a message identifier
pub fn generate_message_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Message delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Handed to the media session
    Sent,
    /// Delivery notification received
    Delivered,
    /// Display notification received
    Displayed,
    /// Transfer failed
    Failed,
}

/// Geolocation push payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeolocPush {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters
    pub accuracy: f32,
    pub expiration: DateTime<Utc>,
}

impl GeolocPush {
    /// Render the push-location document
    pub fn to_xml(&self, entity: &str) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;

        let mut envelope = BytesStart::new("rcsenvelope");
        envelope.push_attribute(("xmlns", "urn:gsma:params:xml:ns:rcs:rcs:geolocation"));
        envelope.push_attribute(("xmlns:gml", "http://www.opengis.net/gml"));
        envelope.push_attribute(("xmlns:gs", "http://www.opengis.net/pidflo/1.0"));
        envelope.push_attribute(("entity", entity));
        writer.write_event(Event::Start(envelope)).map_err(xml_error)?;

        let mut push = BytesStart::new("rcspushlocation");
        push.push_attribute(("label", self.label.as_str()));
        writer.write_event(Event::Start(push)).map_err(xml_error)?;

        let pos = format!("{} {}", self.latitude, self.longitude);
        let radius = self.accuracy.to_string();
        let until = self.expiration.to_rfc3339_opts(SecondsFormat::Secs, true);
        for (name, text) in [
            ("gml:pos", pos.as_str()),
            ("gs:radius", radius.as_str()),
            ("retention-expiry", until.as_str()),
        ] {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesStart::new(name).to_end()))
                .map_err(xml_error)?;
        }

        writer
            .write_event(Event::End(BytesStart::new("rcspushlocation").to_end()))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesStart::new("rcsenvelope").to_end()))
            .map_err(xml_error)?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
    }
}

/// What a message carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePayload {
    Text(String),
    Geoloc(GeolocPush),
}

/// Chat message tracked by the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstantMessage {
    pub message_id: String,
    pub remote: ContactId,
    pub payload: MessagePayload,
    pub imdn_requested: bool,
    /// Identifier carried in `imdn.Message-ID`
    pub imdn_message_id: Option<String>,
    pub status: Option<DeliveryStatus>,
    pub sent_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstantMessage {
    /// New outgoing message; a second id is allocated when IMDN is requested
    pub fn outgoing(remote: ContactId, payload: MessagePayload, imdn_requested: bool) -> Self {
        let now = Utc::now();
        Self {
            message_id: generate_message_id(),
            remote,
            payload,
            imdn_requested,
            imdn_message_id: imdn_requested.then(generate_message_id),
            status: None,
            sent_at: now,
            updated_at: now,
        }
    }

    /// Id the peer will reference in delivery notifications
    pub fn correlation_id(&self) -> &str {
        self.imdn_message_id.as_deref().unwrap_or(&self.message_id)
    }
}

/// CPIM envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpimMessage {
    pub headers: Vec<(String, String)>,
    pub content_type: String,
    pub body: String,
}

impl CpimMessage {
    /// Wrap a body, with IMDN headers when a message id is given
    pub fn build(content_type: &str, body: &str, imdn_message_id: Option<&str>) -> Self {
        let mut headers = vec![
            ("From".to_string(), CPIM_ANONYMOUS.to_string()),
            ("To".to_string(), CPIM_ANONYMOUS.to_string()),
        ];
        if let Some(id) = imdn_message_id {
            headers.push(("NS".to_string(), "imdn <urn:ietf:params:imdn>".to_string()));
            headers.push(("imdn.Message-ID".to_string(), id.to_string()));
            headers.push((
                "DateTime".to_string(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
            headers.push((
                "imdn.Disposition-Notification".to_string(),
                "positive-delivery, display".to_string(),
            ));
        }
        Self {
            headers,
            content_type: content_type.to_string(),
            body: body.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("imdn.Message-ID")
    }

    /// Dispositions requested by the sender
    pub fn dispositions(&self) -> Vec<String> {
        self.header("imdn.Disposition-Notification")
            .map(|v| v.split(',').map(|d| d.trim().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        out.push_str(&format!("Content-type: {}\r\n", self.content_type));
        out.push_str(&format!("Content-length: {}\r\n", self.body.len()));
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    pub fn parse(data: &str) -> Result<Self> {
        let data = data.replace("\r\n", "\n");
        let (head, rest) = data
            .split_once("\n\n")
            .ok_or_else(|| ImsError::Parse("CPIM without message headers".to_string()))?;
        let (content_head, body) = rest.split_once("\n\n").unwrap_or((rest, ""));

        let headers = head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();
        let content_type = content_head
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(n, _)| n.trim().eq_ignore_ascii_case("Content-type"))
            .map(|(_, v)| v.trim().to_string())
            .ok_or_else(|| ImsError::Parse("CPIM without Content-type".to_string()))?;

        Ok(Self {
            headers,
            content_type,
            body: body.to_string(),
        })
    }
}

/// IMDN disposition notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImdnDocument {
    pub message_id: String,
    pub datetime: Option<String>,
    pub status: DeliveryStatus,
}

impl ImdnDocument {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut message_id = None;
        let mut datetime = None;
        let mut status = None;
        let mut current = Vec::new();

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(ref e) => current.push(e.local_name().as_ref().to_vec()),
                Event::Empty(ref e) => {
                    status = match e.local_name().as_ref() {
                        b"delivered" => Some(DeliveryStatus::Delivered),
                        b"displayed" => Some(DeliveryStatus::Displayed),
                        b"failed" | b"error" | b"forbidden" => Some(DeliveryStatus::Failed),
                        _ => status,
                    };
                }
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(xml_error)?.into_owned();
                    match current.last().map(Vec::as_slice) {
                        Some(b"message-id") => message_id = Some(text),
                        Some(b"datetime") => datetime = Some(text),
                        _ => {}
                    }
                }
                Event::End(_) => {
                    current.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            message_id: message_id
                .ok_or_else(|| ImsError::Parse("IMDN without message-id".to_string()))?,
            datetime,
            status: status.ok_or_else(|| ImsError::Parse("IMDN without status".to_string()))?,
        })
    }

    pub fn to_xml(&self) -> Result<String> {
        let (notification, status) = match self.status {
            DeliveryStatus::Displayed => ("display-notification", "displayed"),
            DeliveryStatus::Failed => ("delivery-notification", "failed"),
            _ => ("delivery-notification", "delivered"),
        };

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        let mut root = BytesStart::new("imdn");
        root.push_attribute(("xmlns", "urn:ietf:params:xml:ns:imdn"));
        writer.write_event(Event::Start(root)).map_err(xml_error)?;

        let datetime = self
            .datetime
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        for (name, text) in [("message-id", self.message_id.as_str()), ("datetime", datetime.as_str())] {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesStart::new(name).to_end()))
                .map_err(xml_error)?;
        }

        for name in [notification, "status"] {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::Empty(BytesStart::new(status)))
            .map_err(xml_error)?;
        for name in ["status", notification, "imdn"] {
            writer
                .write_event(Event::End(BytesStart::new(name).to_end()))
                .map_err(xml_error)?;
        }

        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
    }
}

/// Typing state carried by an is-composing document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposingIndication {
    Active,
    Idle,
}

/// is-composing document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsComposingInfo {
    pub state: ComposingIndication,
    pub content_type: Option<String>,
    /// Seconds before the active state lapses
    pub refresh: Option<u32>,
    pub last_active: Option<String>,
}

impl IsComposingInfo {
    pub fn active(refresh: u32) -> Self {
        Self {
            state: ComposingIndication::Active,
            content_type: Some(MIME_TEXT_PLAIN.to_string()),
            refresh: Some(refresh),
            last_active: None,
        }
    }

    pub fn idle() -> Self {
        Self {
            state: ComposingIndication::Idle,
            content_type: Some(MIME_TEXT_PLAIN.to_string()),
            refresh: None,
            last_active: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        let mut root = BytesStart::new("isComposing");
        root.push_attribute(("xmlns", "urn:ietf:params:xml:ns:im-iscomposing"));
        writer.write_event(Event::Start(root)).map_err(xml_error)?;

        let state = match self.state {
            ComposingIndication::Active => "active",
            ComposingIndication::Idle => "idle",
        };
        let refresh = self.refresh.map(|r| r.to_string());
        let fields = [
            ("state", Some(state)),
            ("lastactive", self.last_active.as_deref()),
            ("contenttype", self.content_type.as_deref()),
            ("refresh", refresh.as_deref()),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                writer
                    .write_event(Event::Start(BytesStart::new(name)))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::Text(BytesText::new(value)))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::End(BytesStart::new(name).to_end()))
                    .map_err(xml_error)?;
            }
        }

        writer
            .write_event(Event::End(BytesStart::new("isComposing").to_end()))
            .map_err(xml_error)?;
        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut info = Self {
            state: ComposingIndication::Idle,
            content_type: None,
            refresh: None,
            last_active: None,
        };
        let mut seen_state = false;
        let mut current: Option<Vec<u8>> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(ref e) => current = Some(e.local_name().as_ref().to_vec()),
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(xml_error)?.into_owned();
                    match current.as_deref() {
                        Some(b"state") => {
                            seen_state = true;
                            info.state = if text.eq_ignore_ascii_case("active") {
                                ComposingIndication::Active
                            } else {
                                ComposingIndication::Idle
                            };
                        }
                        Some(b"contenttype") => info.content_type = Some(text),
                        Some(b"refresh") => info.refresh = text.parse().ok(),
                        Some(b"lastactive") => info.last_active = Some(text),
                        _ => {}
                    }
                }
                Event::End(_) => current = None,
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_state {
            return Err(ImsError::Parse("is-composing without state".to_string()));
        }
        Ok(info)
    }
}

/// Message history port
#[async_trait]
pub trait MessageHistory: Send + Sync {
    async fn add_message(&self, message: InstantMessage);

    /// Update by message id or IMDN message id; returns the updated message
    async fn set_delivery_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Option<InstantMessage>;

    async fn get_message(&self, message_id: &str) -> Option<InstantMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> ContactId {
        ContactId::parse("+33600000002", "33").unwrap()
    }

    #[test]
    fn test_outgoing_message_ids() {
        let plain = InstantMessage::outgoing(contact(), MessagePayload::Text("hi".into()), false);
        assert!(plain.imdn_message_id.is_none());
        assert_eq!(plain.correlation_id(), plain.message_id);

        let tracked = InstantMessage::outgoing(contact(), MessagePayload::Text("hi".into()), true);
        let imdn_id = tracked.imdn_message_id.clone().unwrap();
        assert_ne!(imdn_id, tracked.message_id);
        assert_eq!(tracked.correlation_id(), imdn_id);
        assert!(tracked.status.is_none());
    }

    #[test]
    fn test_cpim_with_imdn() {
        let cpim = CpimMessage::build(MIME_TEXT_PLAIN, "hello", Some("msg-1"));
        let rendered = cpim.render();
        assert!(rendered.contains("imdn.Message-ID: msg-1\r\n"));
        assert!(rendered.contains("imdn.Disposition-Notification: positive-delivery, display"));
        assert!(rendered.ends_with("\r\n\r\nhello"));

        let parsed = CpimMessage::parse(&rendered).unwrap();
        assert_eq!(parsed.message_id(), Some("msg-1"));
        assert_eq!(parsed.content_type, MIME_TEXT_PLAIN);
        assert_eq!(parsed.body, "hello");
        assert_eq!(parsed.dispositions(), vec!["positive-delivery", "display"]);
    }

    #[test]
    fn test_cpim_without_imdn() {
        let cpim = CpimMessage::build(MIME_TEXT_PLAIN, "hello", None);
        assert!(cpim.message_id().is_none());
        assert!(!cpim.render().contains("imdn."));
    }

    #[test]
    fn test_parse_imdn() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<imdn xmlns="urn:ietf:params:xml:ns:imdn">
  <message-id>34jk324j</message-id>
  <datetime>2008-04-04T12:16:49-05:00</datetime>
  <display-notification><status><displayed/></status></display-notification>
</imdn>"#;
        let doc = ImdnDocument::parse(xml).unwrap();
        assert_eq!(doc.message_id, "34jk324j");
        assert_eq!(doc.status, DeliveryStatus::Displayed);

        let delivered = ImdnDocument {
            message_id: "m2".into(),
            datetime: None,
            status: DeliveryStatus::Delivered,
        };
        let parsed = ImdnDocument::parse(&delivered.to_xml().unwrap()).unwrap();
        assert_eq!(parsed.message_id, "m2");
        assert_eq!(parsed.status, DeliveryStatus::Delivered);

        assert!(ImdnDocument::parse("<imdn><message-id>x</message-id></imdn>").is_err());
    }

    #[test]
    fn test_is_composing_documents() {
        let active = IsComposingInfo::active(60).to_xml().unwrap();
        assert!(active.contains("<state>active</state>"));
        assert!(active.contains("<refresh>60</refresh>"));
        let parsed = IsComposingInfo::parse(&active).unwrap();
        assert_eq!(parsed.state, ComposingIndication::Active);
        assert_eq!(parsed.refresh, Some(60));

        let idle = IsComposingInfo::parse(&IsComposingInfo::idle().to_xml().unwrap()).unwrap();
        assert_eq!(idle.state, ComposingIndication::Idle);
        assert!(idle.last_active.is_some());

        assert!(IsComposingInfo::parse("<isComposing/>").is_err());
    }

    #[test]
    fn test_geoloc_document() {
        let geoloc = GeolocPush {
            label: "Home".into(),
            latitude: 48.85,
            longitude: 2.35,
            accuracy: 10.0,
            expiration: Utc::now(),
        };
        let xml = geoloc.to_xml("tel:+33600000001").unwrap();
        assert!(xml.contains("label=\"Home\""));
        assert!(xml.contains("<gml:pos>48.85 2.35</gml:pos>"));
    }
}
