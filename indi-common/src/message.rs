//! Builders and classification for the messages that are not vectors
//! themselves, plus parsing of client new-value requests.

use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString as _};

use crate::{Kind, ModelError, SwitchState, element::parse_number, format_timestamp, xml::XmlElement};

pub const PROTOCOL_VERSION: &str = "1.7";

/// `<getProperties>`, optionally scoped to a device and to one of its vectors
pub fn get_properties(device: Option<&str>, name: Option<&str>) -> XmlElement {
    let mut el = XmlElement::new("getProperties").with_attribute("version", PROTOCOL_VERSION);
    if let Some(device) = device.filter(|d| !d.is_empty()) {
        el.set_attribute("device", device);
    }
    if let Some(name) = name {
        el.set_attribute("name", name);
    }
    el
}

/// A free-text log line from a device
pub fn message(device: Option<&str>, text: &str, timestamp: DateTime<Utc>) -> XmlElement {
    let mut el = XmlElement::new("message");
    if let Some(device) = device {
        el.set_attribute("device", device);
    }
    el.set_attribute("timestamp", format_timestamp(&timestamp));
    el.set_attribute("message", text);
    el
}

/// A client request to change the values of a writable vector
pub fn new_vector<'a>(
    kind: Kind,
    device: &str,
    name: &str,
    values: impl IntoIterator<Item = (&'a str, String)>,
) -> Result<XmlElement, ModelError> {
    if kind == Kind::Light {
        return Err(ModelError::Schema(kind.new_vector_tag()));
    }

    let mut el = XmlElement::new(kind.new_vector_tag())
        .with_attribute("device", device)
        .with_attribute("name", name)
        .with_attribute("timestamp", format_timestamp(&Utc::now()));

    for (element, value) in values {
        el.children.push(
            XmlElement::new(kind.one_element_tag())
                .with_attribute("name", element)
                .with_text(value),
        );
    }

    Ok(el)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    GetProperties,
    Define(Kind),
    Set(Kind),
    New(Kind),
    Message,
    Delete,
    Other,
}

impl MessageKind {
    pub fn classify(tag: &str) -> Self {
        match tag {
            "getProperties" => return Self::GetProperties,
            "message" => return Self::Message,
            "delProperty" => return Self::Delete,
            _ => {}
        }

        let Some(kind) = tag.strip_suffix("Vector") else {
            return Self::Other;
        };

        let (wrap, kind): (fn(Kind) -> Self, _) = if let Some(kind) = kind.strip_prefix("def") {
            (Self::Define, kind)
        } else if let Some(kind) = kind.strip_prefix("set") {
            (Self::Set, kind)
        } else if let Some(kind) = kind.strip_prefix("new") {
            (Self::New, kind)
        } else {
            return Self::Other;
        };

        kind.parse().map(wrap).unwrap_or(Self::Other)
    }

    /// Definition or update, the two kinds that carry a vector
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Define(_) | Self::Set(_))
    }
}

/// A parsed `new*Vector` request: element names and raw values in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewValues {
    pub kind: Kind,
    pub device: CompactString,
    pub name: CompactString,
    pub timestamp: Option<CompactString>,
    pub values: Vec<(CompactString, String)>,
}

impl NewValues {
    pub fn from_element(el: &XmlElement) -> Result<Self, ModelError> {
        let MessageKind::New(kind) = MessageKind::classify(&el.tag) else {
            return Err(ModelError::UnexpectedTag {
                expected: "new*Vector".into(),
                found: el.tag.to_string(),
            });
        };

        let one = kind.one_element_tag();
        let values = el
            .children
            .iter()
            .filter(|c| c.tag == one)
            .map(|c| Ok((c.require("name")?.to_compact_string(), c.text.clone())))
            .collect::<Result<Vec<_>, ModelError>>()?;

        Ok(Self {
            kind,
            device: el.require("device")?.into(),
            name: el.require("name")?.into(),
            timestamp: el.attribute("timestamp").map(Into::into),
            values,
        })
    }

    /// `(element, value)` pairs borrowed for [`PropertyVector::apply`]
    ///
    /// [`PropertyVector::apply`]: crate::PropertyVector::apply
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn numbers(&self) -> Result<Vec<(CompactString, f64)>, ModelError> {
        self.values
            .iter()
            .map(|(n, v)| Ok((n.clone(), parse_number(v)?)))
            .collect()
    }

    pub fn switches(&self) -> Result<Vec<(CompactString, SwitchState)>, ModelError> {
        self.values
            .iter()
            .map(|(n, v)| Ok((n.clone(), v.parse()?)))
            .collect()
    }

    pub fn texts(&self) -> Vec<(CompactString, String)> {
        self.values.clone()
    }
}
