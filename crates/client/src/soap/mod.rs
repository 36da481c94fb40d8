// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! vim25 SOAP envelopes and response parsing.

pub mod xml;

pub use xml::Element;

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

use crate::error::SdkError;

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    "<soapenv:Body>"
);

const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// A managed object reference, `type` plus `value`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MoRef {
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: &str, value: &str) -> Self {
        Self {
            kind: kind.to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn to_xml(&self, tag: &str) -> String {
        format!(
            r#"<{tag} type="{}">{}</{tag}>"#,
            escape(self.kind.as_str()),
            escape(self.value.as_str())
        )
    }
}

impl std::fmt::Display for MoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// `<tag>value</tag>` with the value escaped
pub fn text(tag: &str, value: &str) -> String {
    format!("<{tag}>{}</{tag}>", escape(value))
}

/// A method invocation on `this`; `args` is already serialized
pub fn request(method: &str, this: &MoRef, args: &str) -> String {
    format!(
        r#"{ENVELOPE_OPEN}<{method} xmlns="urn:vim25">{}{args}</{method}>{ENVELOPE_CLOSE}"#,
        this.to_xml("_this")
    )
}

/// Returns the response element inside the body, or the fault it carries
pub fn response(doc: &Element) -> Result<Element, SdkError> {
    let body = doc
        .child("Body")
        .ok_or_else(|| SdkError::Xml(format!("no SOAP body in <{}>", doc.name)))?;

    let first = body
        .children
        .first()
        .ok_or_else(|| SdkError::Xml("empty SOAP body".into()))?;

    if first.name == "Fault" {
        return Err(fault(first));
    }

    Ok(first.clone())
}

fn fault(f: &Element) -> SdkError {
    let message = f.text_of("faultstring").unwrap_or_default().to_owned();

    let detail = f.child("detail").and_then(|d| d.children.first());
    let Some(detail) = detail else {
        return SdkError::Fault {
            fault: f.text_of("faultcode").unwrap_or("unknown").to_owned(),
            message,
        };
    };

    let name = detail
        .xsi_type
        .clone()
        .unwrap_or_else(|| detail.name.clone());

    match detail.child("obj").and_then(Element::moref) {
        Some(obj) if name.starts_with("ManagedObjectNotFound") => {
            SdkError::not_found(&obj.kind, &obj.value)
        }
        _ => SdkError::from_fault(&name, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn requests_escape_arguments() {
        let r = request(
            "Login",
            &MoRef::new("SessionManager", "SessionManager"),
            &text("password", "a<b&c"),
        );
        assert!(r.contains(r#"<_this type="SessionManager">SessionManager</_this>"#));
        assert!(r.contains("<password>a&lt;b&amp;c</password>"));
        assert!(xml::parse(&r).is_ok());
    }

    #[test]
    fn login_fault_is_authentication() {
        let doc = xml::parse(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
              <soapenv:Body><soapenv:Fault>
                <faultcode>ServerFaultCode</faultcode>
                <faultstring>Cannot complete login due to an incorrect user name or password.</faultstring>
                <detail><InvalidLoginFault xmlns="urn:vim25" xsi:type="InvalidLogin"></InvalidLoginFault></detail>
              </soapenv:Fault></soapenv:Body></soapenv:Envelope>"#,
        )
        .unwrap();

        let err = response(&doc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn missing_object_fault_names_the_object() {
        let doc = xml::parse(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
              <soapenv:Body><soapenv:Fault>
                <faultcode>ServerFaultCode</faultcode>
                <faultstring>The object has already been deleted or has not been completely created</faultstring>
                <detail><ManagedObjectNotFoundFault xsi:type="ManagedObjectNotFound">
                  <obj type="VirtualMachineSnapshot">snapshot-9</obj>
                </ManagedObjectNotFoundFault></detail>
              </soapenv:Fault></soapenv:Body></soapenv:Envelope>"#,
        )
        .unwrap();

        match response(&doc).unwrap_err() {
            SdkError::NotFound { kind, id } => {
                assert_eq!(kind, "VirtualMachineSnapshot");
                assert_eq!(id, "snapshot-9");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
