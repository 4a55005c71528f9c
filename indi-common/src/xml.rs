//! A minimal element tree plus the SAX-style events it is built from.

use core::fmt::{self, Display};

use compact_str::CompactString;
use quick_xml::{escape::escape, events::Event, reader::Reader};
use serde::{Serialize, Serializer, ser::SerializeMap as _};

use crate::{FramingError, ModelError};

pub type Attribute = (CompactString, String);

#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    Start { tag: CompactString, attributes: Vec<Attribute> },
    Text(String),
    End { tag: CompactString },
}

/// Consumer of framed events; receives only events of complete, well-formed elements
pub trait EventSink {
    fn event(&mut self, event: &XmlEvent);
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn event(&mut self, event: &XmlEvent) {
        (**self).event(event)
    }
}

impl<A: EventSink, B: EventSink> EventSink for (A, B) {
    fn event(&mut self, event: &XmlEvent) {
        self.0.event(event);
        self.1.event(event);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct XmlElement {
    pub tag: CompactString,
    #[serde(serialize_with = "attributes_as_map")]
    pub attributes: Vec<Attribute>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<XmlElement>,
}

fn attributes_as_map<S: Serializer>(attributes: &[Attribute], ser: S) -> Result<S::Ok, S::Error> {
    let mut map = ser.serialize_map(Some(attributes.len()))?;
    for (key, value) in attributes {
        map.serialize_entry(key, value)?;
    }
    map.end()
}

impl XmlElement {
    pub fn new(tag: impl Into<CompactString>) -> Self {
        Self { tag: tag.into(), ..Default::default() }
    }

    pub fn with_attribute(mut self, key: impl Into<CompactString>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Sets or replaces an attribute, keeping the position of an existing one
    pub fn set_attribute(&mut self, key: impl Into<CompactString>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, key: &'static str) -> Result<&str, ModelError> {
        self.attribute(key).ok_or_else(|| ModelError::MissingAttribute {
            tag: self.tag.to_string(),
            attribute: key,
        })
    }

    /// Serialized form followed by a newline, ready to write to a stream
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = self.to_string();
        out.push('\n');
        out.into_bytes()
    }

    /// Parses a fragment holding exactly one element
    pub fn parse(bytes: &[u8]) -> Result<Self, ModelError> {
        let mut elements = Self::parse_all(bytes)?;
        match elements.len() {
            1 => Ok(elements.remove(0)),
            n => Err(ModelError::Xml(format!("expected one element, found {n}"))),
        }
    }

    /// Parses a fragment of any number of sibling elements
    pub fn parse_all(bytes: &[u8]) -> Result<Vec<Self>, ModelError> {
        let events = parse_events(bytes).map_err(|e| ModelError::Xml(e.to_string()))?;

        let mut collector = ElementCollector::default();
        for event in &events {
            collector.event(event);
        }

        Ok(collector.take())
    }
}

impl Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attributes {
            write!(f, " {key}=\"{}\"", escape(value.as_str()))?;
        }

        if self.text.is_empty() && self.children.is_empty() {
            return f.write_str("/>");
        }

        f.write_str(">")?;
        if !self.children.is_empty() {
            f.write_str("\n")?;
            for child in &self.children {
                writeln!(f, "  {child}")?;
            }
        }
        f.write_str(&escape(self.text.as_str()))?;
        write!(f, "</{}>", self.tag)
    }
}

/// Rebuilds complete top-level elements from an event sequence
#[derive(Debug, Default)]
pub struct ElementCollector {
    stack: Vec<XmlElement>,
    done: Vec<XmlElement>,
}

impl ElementCollector {
    pub fn take(&mut self) -> Vec<XmlElement> {
        core::mem::take(&mut self.done)
    }

    pub fn reset(&mut self) {
        self.stack.clear();
    }
}

impl EventSink for ElementCollector {
    fn event(&mut self, event: &XmlEvent) {
        match event {
            XmlEvent::Start { tag, attributes } => self.stack.push(XmlElement {
                tag: tag.clone(),
                attributes: attributes.clone(),
                ..Default::default()
            }),
            XmlEvent::Text(text) => {
                if let Some(current) = self.stack.last_mut() {
                    current.text.push_str(text);
                }
            }
            XmlEvent::End { .. } => {
                let Some(finished) = self.stack.pop() else {
                    return;
                };

                match self.stack.last_mut() {
                    Some(parent) => parent.children.push(finished),
                    None => self.done.push(finished),
                }
            }
        }
    }
}

/// Parses a complete fragment into events. Nothing is returned unless the
/// whole fragment is well-formed.
pub fn parse_events(bytes: &[u8]) -> Result<Vec<XmlEvent>, FramingError> {
    let malformed = |e: &dyn Display| FramingError::Malformed(e.to_string());

    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut events = Vec::new();
    let mut depth = 0usize;

    loop {
        match reader.read_event().map_err(|e| malformed(&e))? {
            Event::Start(start) => {
                depth += 1;
                let (tag, attributes) = start_parts(&start)?;
                events.push(XmlEvent::Start { tag, attributes });
            }
            Event::Empty(start) => {
                let (tag, attributes) = start_parts(&start)?;
                events.push(XmlEvent::Start { tag: tag.clone(), attributes });
                events.push(XmlEvent::End { tag });
            }
            Event::End(end) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| FramingError::StrayEnd(tag_name(end.name().as_ref())))?;
                events.push(XmlEvent::End { tag: tag_name(end.name().as_ref()).into() });
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| malformed(&e))?;
                if depth > 0 {
                    events.push(XmlEvent::Text(text.into_owned()));
                }
            }
            Event::CData(data) => {
                if depth > 0 {
                    events.push(XmlEvent::Text(String::from_utf8_lossy(&data).into_owned()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(FramingError::Malformed(format!("{depth} unclosed element(s)")));
    }

    Ok(events)
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn start_parts(
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<(CompactString, Vec<Attribute>), FramingError> {
    let tag = core::str::from_utf8(start.name().as_ref())
        .map_err(|e| FramingError::Malformed(e.to_string()))?
        .into();

    let attributes = start
        .attributes()
        .map(|attr| {
            let attr = attr.map_err(|e| FramingError::Malformed(e.to_string()))?;
            let key = core::str::from_utf8(attr.key.as_ref())
                .map_err(|e| FramingError::Malformed(e.to_string()))?
                .into();
            let value = attr
                .unescape_value()
                .map_err(|e| FramingError::Malformed(e.to_string()))?
                .into_owned();
            Ok((key, value))
        })
        .collect::<Result<Vec<_>, FramingError>>()?;

    Ok((tag, attributes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_escapes() {
        let el = XmlElement::new("defText")
            .with_attribute("name", "NOTE")
            .with_attribute("label", "Say \"hi\" & <go>")
            .with_text("a < b");

        assert_eq!(
            el.to_string(),
            r#"<defText name="NOTE" label="Say &quot;hi&quot; &amp; &lt;go&gt;">a &lt; b</defText>"#
        );
    }

    #[test]
    fn display_nested_and_empty() {
        let el = XmlElement::new("setSwitchVector")
            .with_attribute("device", "dome")
            .with_child(XmlElement::new("oneSwitch").with_attribute("name", "OPEN").with_text("On"));

        assert_eq!(
            el.to_string(),
            "<setSwitchVector device=\"dome\">\n  <oneSwitch name=\"OPEN\">On</oneSwitch>\n</setSwitchVector>"
        );
        assert_eq!(XmlElement::new("getProperties").to_string(), "<getProperties/>");
    }

    #[test]
    fn parse_round_trip() {
        let el = XmlElement::new("defTextVector")
            .with_attribute("device", "a&b")
            .with_child(XmlElement::new("defText").with_attribute("name", "T").with_text("x > y"));

        assert_eq!(XmlElement::parse(el.to_string().as_bytes()).unwrap(), el);
    }

    #[test]
    fn parse_multiple_and_errors() {
        let all = XmlElement::parse_all(b"<a/> <b x='1'>t</b><!-- note -->").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].attribute("x"), Some("1"));
        assert_eq!(all[1].text, "t");

        assert!(XmlElement::parse(b"<a><b></a>").is_err());
        assert!(XmlElement::parse(b"<a/><b/>").is_err());
        assert!(parse_events(b"<a>").is_err());
    }

    #[test]
    fn set_attribute_replaces() {
        let mut el = XmlElement::new("x").with_attribute("a", "1").with_attribute("b", "2");
        el.set_attribute("a", "3");
        assert_eq!(el.attributes, vec![("a".into(), "3".to_owned()), ("b".into(), "2".to_owned())]);
        assert_eq!(
            el.require("c"),
            Err(ModelError::MissingAttribute { tag: "x".into(), attribute: "c" })
        );
    }

    #[test]
    fn json_shape() {
        let el = XmlElement::new("oneNumber").with_attribute("name", "RA").with_text("1.5");
        assert_eq!(
            serde_json::to_value(&el).unwrap(),
            serde_json::json!({ "tag": "oneNumber", "attributes": { "name": "RA" }, "text": "1.5" })
        );
    }
}
