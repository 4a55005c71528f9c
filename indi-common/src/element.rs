use core::fmt::Debug;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use compact_str::{CompactString, ToCompactString as _};
use serde::{Deserialize, Serialize};

use crate::{
    Kind, ModelError, PropertyState, PropertyVector, SwitchState, schema::Attributes,
    xml::XmlElement,
};

/// One member of a vector property.
pub trait Element: Attributes + Debug + Clone + Sized {
    const KIND: Kind;

    fn name(&self) -> &str;

    fn label(&self) -> &str;

    /// Current value as it is written between the element tags
    fn value_text(&self) -> String;

    /// Assigns a value from its wire text
    fn set_text(&mut self, raw: &str) -> Result<(), ModelError>;

    /// Builds the element from its `def*` form
    fn from_definition(el: &XmlElement) -> Result<Self, ModelError>;

    /// Merges the matching `one*` child of an update
    fn apply_one(&mut self, one: &XmlElement) -> Result<(), ModelError> {
        self.set_text(&one.text)
    }

    /// Assigns a value to the named member of `vector`.
    ///
    /// Kinds with cross-element rules override this.
    fn assign(vector: &mut PropertyVector<Self>, name: &str, raw: &str) -> Result<(), ModelError> {
        vector.element_mut(name)?.set_text(raw)
    }
}

fn label_of(el: &XmlElement, name: &str) -> CompactString {
    el.attribute("label").unwrap_or(name).to_compact_string()
}

fn expect_tag(el: &XmlElement, kind: Kind) -> Result<(), ModelError> {
    let expected = kind.def_element_tag();
    if el.tag != expected {
        return Err(ModelError::UnexpectedTag { expected, found: el.tag.to_string() });
    }
    Ok(())
}

/// Parses a number the way clients send them: plain decimal, or sexagesimal
/// with `:`, `;` or whitespace between up to three fields (`-12:30:36`).
pub fn parse_number(raw: &str) -> Result<f64, ModelError> {
    let s = raw.trim();
    if let Ok(value) = s.parse::<f64>() {
        return Ok(value);
    }

    let (negative, body) = match s.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let fields = body
        .split(|c: char| c == ':' || c == ';' || c.is_whitespace())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>();

    if fields.len() < 2 || fields.len() > 3 {
        return Err(ModelError::value("number", raw));
    }

    let mut total = 0.0;
    let mut scale = 1.0;
    for field in fields {
        let value = field
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_sign_positive())
            .ok_or_else(|| ModelError::value("number", raw))?;
        total += value / scale;
        scale *= 60.0;
    }

    Ok(if negative { -total } else { total })
}

fn parse_attr_number(el: &XmlElement, key: &'static str) -> Result<f64, ModelError> {
    el.attribute(key).map(parse_number).transpose().map(|v| v.unwrap_or(0.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Number {
    name: CompactString,
    pub label: CompactString,
    /// printf-style display format, informational only
    pub format: CompactString,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub value: f64,
}

impl Number {
    pub fn new(name: impl AsRef<str>, value: f64) -> Self {
        let name = name.as_ref().to_compact_string();
        Self {
            label: name.clone(),
            name,
            format: CompactString::const_new("%g"),
            min: 0.0,
            max: 0.0,
            step: 0.0,
            value,
        }
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }

    pub fn with_format(mut self, format: impl AsRef<str>) -> Self {
        self.format = format.as_ref().to_compact_string();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.min = min;
        self.max = max;
        self.step = step;
        self
    }
}

impl Attributes for Number {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            "format" => Some(self.format.to_string()),
            "min" => Some(self.min.to_string()),
            "max" => Some(self.max.to_string()),
            "step" => Some(self.step.to_string()),
            _ => None,
        }
    }
}

impl Element for Number {
    const KIND: Kind = Kind::Number;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn value_text(&self) -> String {
        self.value.to_string()
    }

    fn set_text(&mut self, raw: &str) -> Result<(), ModelError> {
        self.value = parse_number(raw)?;
        Ok(())
    }

    fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        expect_tag(el, Self::KIND)?;
        let name = el.require("name")?;

        Ok(Self {
            label: label_of(el, name),
            name: name.to_compact_string(),
            format: el.attribute("format").unwrap_or("%g").to_compact_string(),
            min: parse_attr_number(el, "min")?,
            max: parse_attr_number(el, "max")?,
            step: parse_attr_number(el, "step")?,
            value: parse_number(&el.text)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    name: CompactString,
    pub label: CompactString,
    pub value: String,
}

impl Text {
    pub fn new(name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let name = name.as_ref().to_compact_string();
        Self { label: name.clone(), name, value: value.into() }
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }
}

impl Attributes for Text {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            _ => None,
        }
    }
}

impl Element for Text {
    const KIND: Kind = Kind::Text;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn value_text(&self) -> String {
        self.value.clone()
    }

    fn set_text(&mut self, raw: &str) -> Result<(), ModelError> {
        self.value = raw.to_owned();
        Ok(())
    }

    fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        expect_tag(el, Self::KIND)?;
        let name = el.require("name")?;
        Ok(Self::new(name, el.text.clone()).with_label(label_of(el, name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Light {
    name: CompactString,
    pub label: CompactString,
    pub state: PropertyState,
}

impl Light {
    pub fn new(name: impl AsRef<str>, state: PropertyState) -> Self {
        let name = name.as_ref().to_compact_string();
        Self { label: name.clone(), name, state }
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }
}

impl Attributes for Light {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            _ => None,
        }
    }
}

impl Element for Light {
    const KIND: Kind = Kind::Light;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn value_text(&self) -> String {
        self.state.to_string()
    }

    fn set_text(&mut self, raw: &str) -> Result<(), ModelError> {
        self.state = raw.parse()?;
        Ok(())
    }

    fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        expect_tag(el, Self::KIND)?;
        let name = el.require("name")?;
        Ok(Self::new(name, el.text.parse()?).with_label(label_of(el, name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    name: CompactString,
    pub label: CompactString,
    pub state: SwitchState,
}

impl Switch {
    pub fn new(name: impl AsRef<str>, state: SwitchState) -> Self {
        let name = name.as_ref().to_compact_string();
        Self { label: name.clone(), name, state }
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }

    pub fn is_on(&self) -> bool {
        self.state == SwitchState::On
    }
}

impl Attributes for Switch {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            _ => None,
        }
    }
}

impl Element for Switch {
    const KIND: Kind = Kind::Switch;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn value_text(&self) -> String {
        self.state.to_string()
    }

    fn set_text(&mut self, raw: &str) -> Result<(), ModelError> {
        self.state = raw.parse()?;
        Ok(())
    }

    fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        expect_tag(el, Self::KIND)?;
        let name = el.require("name")?;
        Ok(Self::new(name, el.text.parse()?).with_label(label_of(el, name)))
    }

    fn assign(vector: &mut PropertyVector<Self>, name: &str, raw: &str) -> Result<(), ModelError> {
        vector.set_switch(name, raw.parse()?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    name: CompactString,
    pub label: CompactString,
    /// File-type tag such as `.fits`; a `.z` suffix marks compressed data
    pub format: CompactString,
    #[serde(skip)]
    data: Vec<u8>,
}

impl Blob {
    pub fn new(name: impl AsRef<str>, format: impl AsRef<str>) -> Self {
        let name = name.as_ref().to_compact_string();
        Self {
            label: name.clone(),
            name,
            format: format.as_ref().to_compact_string(),
            data: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: Vec<u8>, format: impl AsRef<str>) {
        self.data = data;
        self.format = format.as_ref().to_compact_string();
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl Attributes for Blob {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            "format" => Some(self.format.to_string()),
            "size" => Some(self.data.len().to_string()),
            "enclen" => Some(base64::encoded_len(self.data.len(), true)?.to_string()),
            _ => None,
        }
    }
}

impl Element for Blob {
    const KIND: Kind = Kind::Blob;

    fn name(&self) -> &str {
        &self.name
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn value_text(&self) -> String {
        BASE64.encode(&self.data)
    }

    fn set_text(&mut self, raw: &str) -> Result<(), ModelError> {
        self.data = crate::blob::decode(raw)?;
        Ok(())
    }

    fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        expect_tag(el, Self::KIND)?;
        let name = el.require("name")?;
        Ok(Self::new(name, el.attribute("format").unwrap_or_default()).with_label(label_of(el, name)))
    }

    fn apply_one(&mut self, one: &XmlElement) -> Result<(), ModelError> {
        let format = one.attribute("format").unwrap_or(&self.format).to_compact_string();
        let size = one
            .attribute("size")
            .map(|s| s.trim().parse::<usize>().map_err(|_| ModelError::value("size", s)))
            .transpose()?;

        let data = crate::blob::decode(&one.text)?;
        crate::blob::check_size(&self.name, &format, size, data.len())?;

        self.data = data;
        self.format = format;
        Ok(())
    }
}
