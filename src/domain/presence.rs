//! Presence documents and state
//!
//! PIDF (RFC 3863) and watcher-info (RFC 3857/3858) bodies, plus the states of
//! the publish and subscribe managers and the durable registry port.

use super::shared::{ImsError, Result};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

fn xml_error(e: impl std::fmt::Display) -> ImsError {
    ImsError::Parse(e.to_string())
}

/// Value of an attribute, unescaped
fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// PIDF basic status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BasicStatus {
    Open,
    Closed,
}

impl BasicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BasicStatus::Open => "open",
            BasicStatus::Closed => "closed",
        }
    }
}

/// One PIDF tuple
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidfTuple {
    pub id: String,
    pub basic: Option<BasicStatus>,
    /// OMA service-description service-id
    pub service_id: Option<String>,
    pub version: Option<String>,
    pub contact: Option<String>,
    pub timestamp: Option<String>,
}

/// PIDF presence document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidfDocument {
    pub entity: String,
    pub tuples: Vec<PidfTuple>,
    /// Free text of the person element
    pub note: Option<String>,
    /// Favorite link of the person element
    pub homepage: Option<String>,
}

impl PidfDocument {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ..Default::default()
        }
    }

    /// Parse a PIDF body
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut doc = PidfDocument::default();
        let mut seen_presence = false;
        let mut stack: Vec<String> = Vec::new();
        let mut current: Option<PidfTuple> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(ref e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    match name.as_str() {
                        "presence" => {
                            seen_presence = true;
                            doc.entity = attribute(e, b"entity").unwrap_or_default();
                        }
                        "tuple" => {
                            current = Some(PidfTuple {
                                id: attribute(e, b"id").unwrap_or_default(),
                                ..Default::default()
                            });
                        }
                        "link" if stack.iter().any(|s| s == "person") => {
                            doc.homepage = attribute(e, b"url");
                        }
                        _ => {}
                    }
                    stack.push(name);
                }
                Event::Empty(ref e) => {
                    if e.local_name().as_ref() == b"link" && stack.iter().any(|s| s == "person") {
                        doc.homepage = attribute(e, b"url");
                    }
                }
                Event::Text(ref t) => {
                    let text = t.unescape().map_err(xml_error)?.into_owned();
                    let element = stack.last().map(String::as_str).unwrap_or_default();
                    let in_person = stack.iter().any(|s| s == "person");
                    match (element, current.as_mut()) {
                        ("basic", Some(tuple)) => {
                            tuple.basic = Some(if text.eq_ignore_ascii_case("open") {
                                BasicStatus::Open
                            } else {
                                BasicStatus::Closed
                            });
                        }
                        ("service-id", Some(tuple)) => tuple.service_id = Some(text),
                        ("version", Some(tuple)) => tuple.version = Some(text),
                        ("contact", Some(tuple)) => tuple.contact = Some(text),
                        ("timestamp", Some(tuple)) => tuple.timestamp = Some(text),
                        ("note", _) if in_person => doc.note = Some(text),
                        _ => {}
                    }
                }
                Event::End(ref e) => {
                    if e.local_name().as_ref() == b"tuple" {
                        if let Some(tuple) = current.take() {
                            doc.tuples.push(tuple);
                        }
                    }
                    stack.pop();
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_presence {
            return Err(ImsError::Parse("missing presence element".to_string()));
        }
        Ok(doc)
    }

    /// Render the document as a PIDF body
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;

        let mut presence = BytesStart::new("presence");
        presence.push_attribute(("xmlns", "urn:ietf:params:xml:ns:pidf"));
        presence.push_attribute(("xmlns:op", "urn:oma:xml:prs:pidf:oma-pres"));
        presence.push_attribute(("xmlns:pdm", "urn:ietf:params:xml:ns:pidf:data-model"));
        presence.push_attribute(("xmlns:rpid", "urn:ietf:params:xml:ns:pidf:rpid"));
        presence.push_attribute(("entity", self.entity.as_str()));
        writer.write_event(Event::Start(presence)).map_err(xml_error)?;

        for tuple in &self.tuples {
            let mut start = BytesStart::new("tuple");
            start.push_attribute(("id", tuple.id.as_str()));
            writer.write_event(Event::Start(start)).map_err(xml_error)?;

            if let Some(basic) = tuple.basic {
                write_element(&mut writer, "status", None)?;
                write_text_element(&mut writer, "basic", basic.as_str())?;
                write_end(&mut writer, "status")?;
            }
            if tuple.service_id.is_some() || tuple.version.is_some() {
                write_element(&mut writer, "op:service-description", None)?;
                if let Some(id) = &tuple.service_id {
                    write_text_element(&mut writer, "op:service-id", id)?;
                }
                if let Some(version) = &tuple.version {
                    write_text_element(&mut writer, "op:version", version)?;
                }
                write_end(&mut writer, "op:service-description")?;
            }
            if let Some(contact) = &tuple.contact {
                write_text_element(&mut writer, "contact", contact)?;
            }
            if let Some(timestamp) = &tuple.timestamp {
                write_text_element(&mut writer, "timestamp", timestamp)?;
            }
            write_end(&mut writer, "tuple")?;
        }

        if self.note.is_some() || self.homepage.is_some() {
            write_element(&mut writer, "pdm:person", Some(("id", "p1")))?;
            if let Some(url) = &self.homepage {
                let mut link = BytesStart::new("rpid:link");
                link.push_attribute(("url", url.as_str()));
                writer.write_event(Event::Empty(link)).map_err(xml_error)?;
            }
            if let Some(note) = &self.note {
                write_text_element(&mut writer, "pdm:note", note)?;
            }
            write_end(&mut writer, "pdm:person")?;
        }

        write_end(&mut writer, "presence")?;

        String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
    }
}

fn write_element(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    name: &str,
    attr: Option<(&str, &str)>,
) -> Result<()> {
    let mut start = BytesStart::new(name);
    if let Some(attr) = attr {
        start.push_attribute(attr);
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    Ok(())
}

fn write_end(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str) -> Result<()> {
    writer
        .write_event(Event::End(BytesStart::new(name).to_end()))
        .map_err(xml_error)?;
    Ok(())
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    write_element(writer, name, None)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    write_end(writer, name)
}

/// One watcher entry of a watcher-info document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watcher {
    pub id: Option<String>,
    /// Watcher URI (element text)
    pub uri: Option<String>,
    /// pending, active, waiting, terminated
    pub status: Option<String>,
    /// subscribe, approved, deactivated, rejected, timeout, ...
    pub event: Option<String>,
    pub display_name: Option<String>,
}

/// Watcher-info document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherInfoDocument {
    pub resource: Option<String>,
    pub package: Option<String>,
    pub version: Option<u32>,
    /// full or partial
    pub state: Option<String>,
    pub watchers: Vec<Watcher>,
}

impl WatcherInfoDocument {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut doc = WatcherInfoDocument::default();
        let mut seen_root = false;
        let mut current: Option<Watcher> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"watcherinfo" => {
                        seen_root = true;
                        doc.version = attribute(e, b"version").and_then(|v| v.parse().ok());
                        doc.state = attribute(e, b"state");
                    }
                    b"watcher-list" => {
                        doc.resource = attribute(e, b"resource");
                        doc.package = attribute(e, b"package");
                    }
                    b"watcher" => {
                        current = Some(Watcher {
                            id: attribute(e, b"id"),
                            status: attribute(e, b"status"),
                            event: attribute(e, b"event"),
                            display_name: attribute(e, b"display-name"),
                            uri: None,
                        });
                    }
                    _ => {}
                },
                Event::Text(ref t) => {
                    if let Some(watcher) = current.as_mut() {
                        watcher.uri = Some(t.unescape().map_err(xml_error)?.trim().to_string());
                    }
                }
                Event::End(ref e) => {
                    if e.local_name().as_ref() == b"watcher" {
                        if let Some(watcher) = current.take() {
                            doc.watchers.push(watcher);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !seen_root {
            return Err(ImsError::Parse("missing watcherinfo element".to_string()));
        }
        Ok(doc)
    }
}

/// Presence publication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishState {
    Unpublished,
    Publishing,
    Published,
    Unpublishing,
}

/// Subscription state of a subscribe manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Subscribed,
    /// Ended by a NOTIFY with `Subscription-State: terminated`
    TerminatedByServer,
    Terminated,
}

/// Durable key/value store surviving restarts
pub trait Registry: Send + Sync {
    fn read_string(&self, key: &str) -> Option<String>;

    fn write_string(&self, key: &str, value: &str);

    fn remove_parameter(&self, key: &str);

    fn read_long(&self, key: &str) -> Option<i64> {
        self.read_string(key).and_then(|v| v.parse().ok())
    }

    fn write_long(&self, key: &str, value: i64) {
        self.write_string(key, &value.to_string());
    }
}
