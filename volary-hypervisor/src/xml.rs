//! Domain XML inspection and rewriting.
//!
//! The agent never builds a domain document from scratch; it receives one,
//! checks its identity, rewrites the credential-bearing `description` and the
//! `name` elements, and strips `description` again before handing the
//! document out. Everything here is a streaming pass over the XML events.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{DriverError, Result};

/// A host-side view of one interface device in a domain document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceRef {
    /// The device alias name, used to key statistics.
    pub alias: Option<String>,
    /// The host-side target device (e.g. `vnet0`).
    pub target_dev: Option<String>,
}

/// Wrapper around a raw domain XML document.
#[derive(Debug, Clone)]
pub struct DomainXml {
    raw: String,
}

fn xml_err(e: quick_xml::Error) -> DriverError {
    DriverError::Xml(e.to_string())
}

impl DomainXml {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Text of the document's `<uuid>` child, if present.
    pub fn uuid(&self) -> Result<Option<String>> {
        self.child_text("uuid")
    }

    /// Text of the document's `<name>` child, if present.
    pub fn name(&self) -> Result<Option<String>> {
        self.child_text("name")
    }

    fn child_text(&self, tag: &str) -> Result<Option<String>> {
        let mut reader = Reader::from_str(&self.raw);
        let mut depth = 0usize;
        let mut capturing = false;
        let mut text = String::new();
        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Eof => return Ok(None),
                Event::Start(e) => {
                    depth += 1;
                    if depth == 2 && e.name().as_ref() == tag.as_bytes() {
                        capturing = true;
                    }
                }
                Event::Text(e) if capturing => {
                    text.push_str(&e.unescape().map_err(xml_err)?);
                }
                Event::End(_) => {
                    if capturing {
                        return Ok(Some(text.trim().to_string()));
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// Rewrite the document so that its `name` equals `name` and its
    /// `description` equals `description`, replacing any existing elements.
    pub fn with_identity(&self, name: &str, description: &str) -> Result<String> {
        self.transform(Some((name, description)))
    }

    /// Return the document with every top-level `description` element removed.
    pub fn without_description(&self) -> Result<String> {
        self.transform(None)
    }

    /// One streaming pass: drop top-level `description` (and, when injecting,
    /// `name`) elements, and when `identity` is given insert fresh `name` and
    /// `description` children right after the root start tag.
    fn transform(&self, identity: Option<(&str, &str)>) -> Result<String> {
        let mut reader = Reader::from_str(&self.raw);
        let mut writer = Writer::new(Vec::new());
        let mut depth = 0usize;
        let mut skip_depth: Option<usize> = None;
        let mut injected = false;

        loop {
            let event = reader.read_event().map_err(xml_err)?;
            match event {
                Event::Eof => break,
                Event::Start(e) => {
                    depth += 1;
                    if skip_depth.is_some() {
                        continue;
                    }
                    let tag = e.name().as_ref().to_vec();
                    let drop_element = depth == 2
                        && (tag == b"description" || (identity.is_some() && tag == b"name"));
                    if drop_element {
                        skip_depth = Some(depth);
                        continue;
                    }
                    let at_root = depth == 1 && !injected;
                    writer.write_event(Event::Start(e)).map_err(xml_err)?;
                    if at_root {
                        injected = true;
                        if let Some((name, description)) = identity {
                            write_text_element(&mut writer, "name", name)?;
                            write_text_element(&mut writer, "description", description)?;
                        }
                    }
                }
                Event::Empty(e) => {
                    if skip_depth.is_some() {
                        continue;
                    }
                    let tag = e.name().as_ref().to_vec();
                    if depth == 1
                        && (tag == b"description" || (identity.is_some() && tag == b"name"))
                    {
                        continue;
                    }
                    writer.write_event(Event::Empty(e)).map_err(xml_err)?;
                }
                Event::End(e) => {
                    let closing_skip = skip_depth == Some(depth);
                    depth -= 1;
                    if closing_skip {
                        skip_depth = None;
                        continue;
                    }
                    if skip_depth.is_some() {
                        continue;
                    }
                    writer.write_event(Event::End(e)).map_err(xml_err)?;
                }
                other => {
                    if skip_depth.is_none() {
                        writer.write_event(other).map_err(xml_err)?;
                    }
                }
            }
        }

        String::from_utf8(writer.into_inner())
            .map_err(|e| DriverError::Xml(format!("rewritten document is not utf-8: {}", e)))
    }

    /// Enumerate the interface devices declared under `<devices>`.
    pub fn interfaces(&self) -> Result<Vec<InterfaceRef>> {
        let mut reader = Reader::from_str(&self.raw);
        let mut path: Vec<Vec<u8>> = Vec::new();
        let mut result = Vec::new();
        let mut current: Option<InterfaceRef> = None;

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Eof => break,
                Event::Start(e) => {
                    let tag = e.name().as_ref().to_vec();
                    let in_devices = path.last().map(|t| t.as_slice()) == Some(&b"devices"[..]);
                    if tag == b"interface" && in_devices {
                        current = Some(InterfaceRef::default());
                    } else if let Some(iface) = current.as_mut() {
                        capture_interface_attr(iface, &e)?;
                    }
                    path.push(tag);
                }
                Event::Empty(e) => {
                    if let Some(iface) = current.as_mut() {
                        capture_interface_attr(iface, &e)?;
                    }
                }
                Event::End(_) => {
                    if let Some(tag) = path.pop() {
                        if tag == b"interface" {
                            if let Some(iface) = current.take() {
                                result.push(iface);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(result)
    }
}

fn write_text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(xml_err)?;
    Ok(())
}

fn capture_interface_attr(iface: &mut InterfaceRef, e: &BytesStart<'_>) -> Result<()> {
    match e.name().as_ref() {
        b"alias" => {
            if let Some(attr) = e.try_get_attribute("name").map_err(xml_err)? {
                iface.alias = Some(attr.unescape_value().map_err(xml_err)?.into_owned());
            }
        }
        b"target" => {
            if let Some(attr) = e.try_get_attribute("dev").map_err(xml_err)? {
                iface.target_dev = Some(attr.unescape_value().map_err(xml_err)?.into_owned());
            }
        }
        _ => {}
    }
    Ok(())
}
