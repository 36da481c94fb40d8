//! A small owned DOM for SDK responses.
//!
//! vim25 payloads are polymorphic (`xsi:type`) and deeply nested, so they
//! are read into a tree first and picked apart by the callers.

use std::str;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::SdkError;

use super::MoRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Local name, namespace prefix removed
    pub name: String,
    /// Value of `xsi:type`, prefix removed
    pub xsi_type: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follows a chain of child names
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |el, n| el.child(n))
    }

    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Reads this element as a managed object reference, `<x type="Kind">id</x>`
    pub fn moref(&self) -> Option<MoRef> {
        self.attr("type").map(|kind| MoRef::new(kind, &self.text))
    }

    pub fn as_bool(&self) -> bool {
        self.text == "true" || self.text == "1"
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.text.trim().parse().ok()
    }

    /// Whether this element's xsi:type is `ty`
    pub fn is_type(&self, ty: &str) -> bool {
        self.xsi_type.as_deref() == Some(ty)
    }
}

fn local(raw: &[u8]) -> Result<&str, SdkError> {
    let s = str::from_utf8(raw).map_err(|_| SdkError::Xml("invalid UTF-8 in tag name".into()))?;

    Ok(match s.rsplit_once(':') {
        Some((_, l)) => l,
        None => s,
    })
}

fn start(e: &BytesStart) -> Result<Element, SdkError> {
    let mut el = Element {
        name: local(e.name().as_ref())?.to_owned(),
        ..Default::default()
    };

    for attr in e.attributes() {
        let attr = attr.map_err(|e| SdkError::Xml(e.to_string()))?;
        let key = str::from_utf8(attr.key.as_ref()).unwrap_or("");
        let val = attr.unescape_value()?;

        if key == "xsi:type" {
            el.xsi_type = Some(local(val.as_bytes())?.to_owned());
        } else if key != "xmlns" && !key.starts_with("xmlns:") {
            el.attrs.push((local(key.as_bytes())?.to_owned(), val.into_owned()));
        }
    }

    Ok(el)
}

/// Parses a complete document, returning its root element
pub fn parse(xml: &str) -> Result<Element, SdkError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // the bottom of the stack collects the document's top level elements
    let mut stack: Vec<Element> = vec![Element::default()];

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => stack.push(start(e)?),
            Ok(Event::Empty(ref e)) => {
                let el = start(e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(el);
                }
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| SdkError::Xml("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => return Err(SdkError::Xml("unbalanced end tag".into())),
                }
            }
            Ok(Event::Text(t)) => {
                let s = t.unescape()?;
                if let Some(el) = stack.last_mut() {
                    el.text.push_str(&s);
                }
            }
            Ok(Event::CData(c)) => {
                let s = str::from_utf8(c.as_ref())
                    .map_err(|_| SdkError::Xml("invalid UTF-8 in CDATA".into()))?;
                if let Some(el) = stack.last_mut() {
                    el.text.push_str(s);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SdkError::Xml(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(SdkError::Xml("document ended inside an element".into()));
    }

    stack
        .pop()
        .and_then(|doc| doc.children.into_iter().next())
        .ok_or_else(|| SdkError::Xml("empty document".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn reads_types_morefs_and_text() {
        let doc = parse(
            r#"<?xml version="1.0"?>
            <soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
              <soapenv:Body>
                <val xsi:type="ArrayOfManagedObjectReference">
                  <ManagedObjectReference type="VirtualMachine" xsi:type="ManagedObjectReference">vm-1</ManagedObjectReference>
                  <ManagedObjectReference type="VirtualMachine">vm-2</ManagedObjectReference>
                </val>
                <name xsi:type="xsd:string">db &amp; web</name>
                <empty/>
              </soapenv:Body>
            </soapenv:Envelope>"#,
        )
        .unwrap();

        assert_eq!(doc.name, "Envelope");
        let body = doc.child("Body").unwrap();
        let val = body.child("val").unwrap();
        assert!(val.is_type("ArrayOfManagedObjectReference"));

        let refs: Vec<MoRef> = val.children.iter().filter_map(Element::moref).collect();
        assert_eq!(
            refs,
            vec![
                MoRef::new("VirtualMachine", "vm-1"),
                MoRef::new("VirtualMachine", "vm-2")
            ]
        );

        let name = body.child("name").unwrap();
        assert_eq!(name.xsi_type.as_deref(), Some("string"));
        assert_eq!(name.text, "db & web");
        assert!(body.child("empty").is_some());
    }

    #[test]
    fn rejects_truncated_documents() {
        assert!(parse("<a><b>x</b>").is_err());
        assert!(parse("").is_err());
    }
}
