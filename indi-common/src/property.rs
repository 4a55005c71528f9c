use chrono::{DateTime, Utc};
use compact_str::{CompactString, ToCompactString as _};

use crate::{
    Blob, Element, Kind, Light, ModelError, Number, Permission, PropertyKey, PropertyState,
    Switch, SwitchRule, SwitchState, Text, format_timestamp, parse_timestamp,
    schema::{self, Attributes},
    xml::XmlElement,
};

/// A named, typed group of elements owned by a device.
///
/// The `(device, name)` key is fixed at construction and the element list is
/// never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyVector<E> {
    device: CompactString,
    name: CompactString,
    pub label: CompactString,
    pub group: Option<CompactString>,
    pub state: PropertyState,
    /// Always [`Permission::ReadOnly`] for lights, and never serialized for them
    pub perm: Permission,
    /// Only set on switch vectors
    pub rule: Option<SwitchRule>,
    /// Seconds the device expects a change to take; informational
    pub timeout: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    elements: Vec<E>,
}

pub type NumberVector = PropertyVector<Number>;
pub type TextVector = PropertyVector<Text>;
pub type LightVector = PropertyVector<Light>;
pub type SwitchVector = PropertyVector<Switch>;
pub type BlobVector = PropertyVector<Blob>;

impl<E: Element> PropertyVector<E> {
    pub fn new(
        device: impl AsRef<str>,
        name: impl AsRef<str>,
        elements: Vec<E>,
    ) -> Result<Self, ModelError> {
        let device = device.as_ref().to_compact_string();
        let name = name.as_ref().to_compact_string();

        if elements.is_empty() {
            return Err(ModelError::Empty(format!("{device}.{name}")));
        }

        for (i, element) in elements.iter().enumerate() {
            if elements[..i].iter().any(|e| e.name() == element.name()) {
                return Err(ModelError::Duplicate {
                    vector: format!("{device}.{name}"),
                    element: element.name().to_owned(),
                });
            }
        }

        Ok(Self {
            label: name.clone(),
            device,
            name,
            group: None,
            state: PropertyState::Idle,
            perm: match E::KIND {
                Kind::Light => Permission::ReadOnly,
                _ => Permission::ReadWrite,
            },
            rule: (E::KIND == Kind::Switch).then_some(SwitchRule::OneOfMany),
            timeout: None,
            timestamp: None,
            elements,
        })
    }

    pub fn with_label(mut self, label: impl AsRef<str>) -> Self {
        self.label = label.as_ref().to_compact_string();
        self
    }

    pub fn with_group(mut self, group: impl AsRef<str>) -> Self {
        self.group = Some(group.as_ref().to_compact_string());
        self
    }

    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    /// Ignored for lights, which are always read-only
    pub fn with_perm(mut self, perm: Permission) -> Self {
        if E::KIND != Kind::Light {
            self.perm = perm;
        }
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(&self.device, &self.name)
    }

    pub const fn kind(&self) -> Kind {
        E::KIND
    }

    pub fn elements(&self) -> &[E] {
        &self.elements
    }

    pub fn elements_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.elements.iter_mut()
    }

    pub fn get(&self, name: &str) -> Option<&E> {
        self.elements.iter().find(|e| e.name() == name)
    }

    pub fn element(&self, name: &str) -> Result<&E, ModelError> {
        self.get(name).ok_or_else(|| self.missing(name))
    }

    pub fn element_mut(&mut self, name: &str) -> Result<&mut E, ModelError> {
        match self.elements.iter().position(|e| e.name() == name) {
            Some(i) => Ok(&mut self.elements[i]),
            None => Err(self.missing(name)),
        }
    }

    fn missing(&self, element: &str) -> ModelError {
        ModelError::NotFound(format!("element {element} of {}", self.key()))
    }

    /// Stamps the vector with the current time
    pub fn touch(&mut self) {
        self.timestamp = Some(Utc::now());
    }

    pub fn set_state_str(&mut self, raw: &str) -> Result<(), ModelError> {
        self.state = raw.parse()?;
        Ok(())
    }

    /// Assigns `(element, value)` pairs in order. Nothing changes unless every
    /// pair is accepted.
    pub fn apply<'a>(
        &mut self,
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), ModelError> {
        let mut staged = self.clone();
        for (name, raw) in values {
            E::assign(&mut staged, name, raw)?;
        }
        *self = staged;
        Ok(())
    }

    /// Builds the `def*Vector` message carrying every set attribute and, except
    /// for BLOBs, every current value.
    pub fn define(&self, message: Option<&str>) -> Result<XmlElement, ModelError> {
        let mut out = emit(E::KIND.def_vector_tag(), |attr| self.vector_attribute(attr, message))?;

        for element in &self.elements {
            let mut child = emit(E::KIND.def_element_tag(), |attr| element.attribute(attr))?;
            if E::KIND != Kind::Blob {
                child.text = element.value_text();
            }
            out.children.push(child);
        }

        Ok(out)
    }

    /// Builds the `set*Vector` message; children carry only names and values.
    pub fn update(&self, message: Option<&str>) -> Result<XmlElement, ModelError> {
        let mut out = emit(E::KIND.set_vector_tag(), |attr| self.vector_attribute(attr, message))?;

        for element in &self.elements {
            let mut child = emit(E::KIND.one_element_tag(), |attr| element.attribute(attr))?;
            child.text = element.value_text();
            out.children.push(child);
        }

        Ok(out)
    }

    fn vector_attribute(&self, attribute: &str, message: Option<&str>) -> Option<String> {
        match attribute {
            "message" => message.map(str::to_owned),
            _ => self.attribute(attribute),
        }
    }

    /// Rebuilds a vector from its `def*Vector` message
    pub fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        let expected = E::KIND.def_vector_tag();
        if el.tag != expected {
            return Err(ModelError::UnexpectedTag { expected, found: el.tag.to_string() });
        }

        let elements = el
            .children
            .iter()
            .map(E::from_definition)
            .collect::<Result<Vec<_>, _>>()?;

        let name = el.require("name")?;
        let mut vector = Self::new(el.require("device")?, name, elements)?
            .with_label(el.attribute("label").unwrap_or(name));

        vector.group = el.attribute("group").map(CompactString::from);
        if let Some(perm) = el.attribute("perm") {
            vector = vector.with_perm(perm.parse()?);
        }
        if E::KIND == Kind::Switch
            && let Some(rule) = el.attribute("rule")
        {
            vector.rule = Some(rule.parse()?);
        }
        vector.merge_header(el)?;

        Ok(vector)
    }

    /// Merges a `set*Vector` message for this vector into it
    pub fn apply_update(&mut self, el: &XmlElement) -> Result<(), ModelError> {
        let expected = E::KIND.set_vector_tag();
        if el.tag != expected {
            return Err(ModelError::UnexpectedTag { expected, found: el.tag.to_string() });
        }

        let found = PropertyKey::new(el.require("device")?, el.require("name")?);
        if found != self.key() {
            return Err(ModelError::Mismatch {
                key: self.key().to_string(),
                tag: el.tag.to_string(),
                found: found.to_string(),
            });
        }

        let mut staged = self.clone();
        staged.merge_header(el)?;

        let one = E::KIND.one_element_tag();
        for child in el.children.iter().filter(|c| c.tag == one) {
            staged.element_mut(child.require("name")?)?.apply_one(child)?;
        }

        *self = staged;
        Ok(())
    }

    fn merge_header(&mut self, el: &XmlElement) -> Result<(), ModelError> {
        if let Some(state) = el.attribute("state") {
            self.set_state_str(state)?;
        }
        if let Some(timeout) = el.attribute("timeout") {
            self.timeout = Some(
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| ModelError::value("timeout", timeout))?,
            );
        }
        if let Some(timestamp) = el.attribute("timestamp") {
            self.timestamp = Some(parse_timestamp(timestamp)?);
        }
        Ok(())
    }
}

impl<E: Element> Attributes for PropertyVector<E> {
    fn attribute(&self, attribute: &str) -> Option<String> {
        match attribute {
            "device" => Some(self.device.to_string()),
            "name" => Some(self.name.to_string()),
            "label" => Some(self.label.to_string()),
            "group" => self.group.as_ref().map(|g| g.to_string()),
            "state" => Some(self.state.to_string()),
            "perm" => Some(self.perm.to_string()),
            "rule" => self.rule.map(|r| r.to_string()),
            "timeout" => self.timeout.map(|t| t.to_string()),
            "timestamp" => self.timestamp.as_ref().map(format_timestamp),
            _ => None,
        }
    }
}

fn emit(tag: String, lookup: impl Fn(&str) -> Option<String>) -> Result<XmlElement, ModelError> {
    let mut el = XmlElement::new(tag.as_str());
    for attribute in schema::attributes(&tag)? {
        if let Some(value) = lookup(attribute) {
            el.set_attribute(*attribute, value);
        }
    }
    Ok(el)
}

impl NumberVector {
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<(), ModelError> {
        self.element_mut(name)?.value = value;
        Ok(())
    }

    pub fn value(&self, name: &str) -> Result<f64, ModelError> {
        Ok(self.element(name)?.value)
    }
}

impl TextVector {
    pub fn set_text(&mut self, name: &str, value: impl Into<String>) -> Result<(), ModelError> {
        self.element_mut(name)?.value = value.into();
        Ok(())
    }
}

impl LightVector {
    pub fn set_light(&mut self, name: &str, state: PropertyState) -> Result<(), ModelError> {
        self.element_mut(name)?.state = state;
        Ok(())
    }
}

impl SwitchVector {
    /// Sets one switch. Under [`SwitchRule::OneOfMany`] turning a switch on
    /// turns every sibling off.
    pub fn set_switch(&mut self, name: &str, state: SwitchState) -> Result<(), ModelError> {
        self.element_mut(name)?.state = state;

        if state == SwitchState::On && self.rule == Some(SwitchRule::OneOfMany) {
            for sibling in self.elements.iter_mut().filter(|e| e.name() != name) {
                sibling.state = SwitchState::Off;
            }
        }

        Ok(())
    }

    /// Name of the first switch that is on
    pub fn on_switch(&self) -> Option<&str> {
        self.elements.iter().find(|e| e.is_on()).map(|e| e.name())
    }
}

impl BlobVector {
    pub fn set_blob(
        &mut self,
        name: &str,
        data: Vec<u8>,
        format: impl AsRef<str>,
    ) -> Result<(), ModelError> {
        self.element_mut(name)?.set_data(data, format);
        Ok(())
    }
}

/// A vector of any kind, as held in a device's property table.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyVector {
    Number(NumberVector),
    Text(TextVector),
    Light(LightVector),
    Switch(SwitchVector),
    Blob(BlobVector),
}

macro_rules! each {
    ($self:expr, $v:ident => $body:expr) => {
        match $self {
            AnyVector::Number($v) => $body,
            AnyVector::Text($v) => $body,
            AnyVector::Light($v) => $body,
            AnyVector::Switch($v) => $body,
            AnyVector::Blob($v) => $body,
        }
    };
}

macro_rules! accessors {
    ($( $variant:ident, $ty:ty, $as_ref:ident, $as_mut:ident; )+) => {
        $(
            impl From<$ty> for AnyVector {
                fn from(vector: $ty) -> Self {
                    Self::$variant(vector)
                }
            }

            impl AnyVector {
                pub fn $as_ref(&self) -> Option<&$ty> {
                    match self {
                        Self::$variant(v) => Some(v),
                        _ => None,
                    }
                }

                pub fn $as_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Self::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )+
    };
}

accessors! {
    Number, NumberVector, as_number, as_number_mut;
    Text, TextVector, as_text, as_text_mut;
    Light, LightVector, as_light, as_light_mut;
    Switch, SwitchVector, as_switch, as_switch_mut;
    Blob, BlobVector, as_blob, as_blob_mut;
}

impl AnyVector {
    pub fn device(&self) -> &str {
        each!(self, v => v.device())
    }

    pub fn name(&self) -> &str {
        each!(self, v => v.name())
    }

    pub fn key(&self) -> PropertyKey {
        each!(self, v => v.key())
    }

    pub fn kind(&self) -> Kind {
        each!(self, v => v.kind())
    }

    pub fn group(&self) -> Option<&str> {
        each!(self, v => v.group.as_deref())
    }

    pub fn state(&self) -> PropertyState {
        each!(self, v => v.state)
    }

    pub fn set_state(&mut self, state: PropertyState) {
        each!(self, v => v.state = state)
    }

    pub fn perm(&self) -> Permission {
        each!(self, v => v.perm)
    }

    pub fn touch(&mut self) {
        each!(self, v => v.touch())
    }

    pub fn define(&self, message: Option<&str>) -> Result<XmlElement, ModelError> {
        each!(self, v => v.define(message))
    }

    pub fn update(&self, message: Option<&str>) -> Result<XmlElement, ModelError> {
        each!(self, v => v.update(message))
    }

    pub fn apply<'a>(
        &mut self,
        values: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), ModelError> {
        each!(self, v => v.apply(values))
    }

    pub fn apply_update(&mut self, el: &XmlElement) -> Result<(), ModelError> {
        each!(self, v => v.apply_update(el))
    }

    /// Rebuilds a vector of whichever kind the `def*Vector` tag names
    pub fn from_definition(el: &XmlElement) -> Result<Self, ModelError> {
        let kind = Kind::ALL
            .iter()
            .find(|k| el.tag == k.def_vector_tag())
            .ok_or_else(|| ModelError::Schema(el.tag.to_string()))?;

        Ok(match kind {
            Kind::Number => Self::Number(PropertyVector::from_definition(el)?),
            Kind::Text => Self::Text(PropertyVector::from_definition(el)?),
            Kind::Light => Self::Light(PropertyVector::from_definition(el)?),
            Kind::Switch => Self::Switch(PropertyVector::from_definition(el)?),
            Kind::Blob => Self::Blob(PropertyVector::from_definition(el)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn coords() -> NumberVector {
        NumberVector::new("mount", "EQUATORIAL_EOD_COORD", vec![
            Number::new("RA", 5.5).with_label("RA (hh:mm:ss)").with_range(0.0, 24.0, 0.0),
            Number::new("DEC", -10.25).with_format("%010.6m").with_range(-90.0, 90.0, 0.0),
        ])
        .unwrap()
        .with_group("Main Control")
        .with_label("Eq. Coordinates")
        .with_state(PropertyState::Ok)
    }

    fn park() -> SwitchVector {
        SwitchVector::new("mount", "TELESCOPE_PARK", vec![
            Switch::new("PARK", SwitchState::On),
            Switch::new("UNPARK", SwitchState::Off),
            Switch::new("HOLD", SwitchState::Off),
        ])
        .unwrap()
    }

    fn attribute_names(el: &XmlElement) -> Vec<&str> {
        el.attributes.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn construction_rules() {
        assert_eq!(
            TextVector::new("d", "EMPTY", vec![]),
            Err(ModelError::Empty("d.EMPTY".into()))
        );
        assert_eq!(
            TextVector::new("d", "T", vec![Text::new("A", ""), Text::new("A", "x")]),
            Err(ModelError::Duplicate { vector: "d.T".into(), element: "A".into() })
        );

        let lights = LightVector::new("d", "STATUS", vec![Light::new("OK", PropertyState::Ok)])
            .unwrap()
            .with_perm(Permission::ReadWrite);
        assert_eq!(lights.perm, Permission::ReadOnly);
        assert_eq!(lights.rule, None);

        assert_eq!(park().rule, Some(SwitchRule::OneOfMany));
        assert_eq!(park().label, "TELESCOPE_PARK");
    }

    #[test]
    fn define_message() {
        let el = coords().define(None).unwrap();

        assert_eq!(el.tag, "defNumberVector");
        assert_eq!(attribute_names(&el), ["device", "name", "label", "group", "state", "perm"]);
        assert_eq!(el.attribute("perm"), Some("rw"));
        assert_eq!(el.children.len(), 2);
        assert_eq!(attribute_names(&el.children[0]), [
            "name", "label", "format", "min", "max", "step"
        ]);
        assert_eq!(el.children[0].text, "5.5");
        assert_eq!(el.children[1].attribute("format"), Some("%010.6m"));

        let el = park().define(Some("parked")).unwrap();
        assert_eq!(el.attribute("rule"), Some("OneOfMany"));
        assert_eq!(el.attribute("message"), Some("parked"));
    }

    #[test]
    fn blob_definition_has_no_value() {
        let mut blobs = BlobVector::new("ccd", "CCD1", vec![Blob::new("CCD1", ".fits")]).unwrap();
        blobs.set_blob("CCD1", vec![0xde, 0xad, 0xbe, 0xef], ".fits").unwrap();

        let def = blobs.define(None).unwrap();
        assert_eq!(def.children[0].text, "");
        assert_eq!(def.children[0].to_string(), r#"<defBLOB name="CCD1" label="CCD1"/>"#);

        let set = blobs.update(None).unwrap();
        let one = &set.children[0];
        assert_eq!(attribute_names(one), ["name", "size", "enclen", "format"]);
        assert_eq!(one.attribute("size"), Some("4"));
        assert_eq!(one.text, "3q2+7w==");
    }

    #[test]
    fn definitions_round_trip_through_the_wire() {
        let original = coords();
        let def = original.define(None).unwrap();
        let parsed = XmlElement::parse(def.to_string().as_bytes()).unwrap();

        for el in [&def, &parsed] {
            let allowed = schema::attributes(&el.tag).unwrap();
            assert!(attribute_names(el).iter().all(|a| allowed.contains(a)));
        }

        let rebuilt = NumberVector::from_definition(&parsed).unwrap();
        assert_eq!(rebuilt, original);

        let a = original.update(None).unwrap();
        let b = rebuilt.update(None).unwrap();
        assert_eq!(a, b);
        let allowed = schema::attributes("setNumberVector").unwrap();
        assert!(attribute_names(&a).iter().all(|n| allowed.contains(n)));
        assert_eq!(attribute_names(&a.children[0]), ["name"]);
    }

    #[test]
    fn any_vector_from_definition() {
        let def = park().define(None).unwrap();
        let any = AnyVector::from_definition(&def).unwrap();

        assert_eq!(any.kind(), Kind::Switch);
        assert_eq!(any.key(), PropertyKey::new("mount", "TELESCOPE_PARK"));
        assert_eq!(any.as_switch().unwrap().on_switch(), Some("PARK"));
        assert!(any.as_number().is_none());

        assert_eq!(
            AnyVector::from_definition(&XmlElement::new("defWidgetVector")),
            Err(ModelError::Schema("defWidgetVector".into()))
        );
    }

    #[test]
    fn one_of_many_is_exclusive() {
        for prior in ["PARK", "UNPARK", "HOLD"] {
            let mut v = park();
            v.elements_mut().for_each(|e| e.state = SwitchState::Off);
            v.set_switch(prior, SwitchState::On).unwrap();

            v.set_switch("UNPARK", SwitchState::On).unwrap();
            let on = v.elements().iter().filter(|e| e.is_on()).map(|e| e.name()).collect::<Vec<_>>();
            assert_eq!(on, ["UNPARK"]);
        }

        let mut any = park();
        any.rule = Some(SwitchRule::AnyOfMany);
        any.set_switch("HOLD", SwitchState::On).unwrap();
        assert!(any.element("PARK").unwrap().is_on());
        assert!(any.element("HOLD").unwrap().is_on());
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let mut v = coords();
        v.apply([("RA", "12:30"), ("DEC", "45")]).unwrap();
        assert_eq!(v.value("RA").unwrap(), 12.5);
        assert_eq!(v.value("DEC").unwrap(), 45.0);

        assert_eq!(
            v.apply([("RA", "1"), ("DEC", "north")]),
            Err(ModelError::value("number", "north"))
        );
        assert_eq!(v.value("RA").unwrap(), 12.5);

        assert!(matches!(v.apply([("ALT", "1")]), Err(ModelError::NotFound(_))));

        let mut s = park();
        s.apply([("HOLD", "On")]).unwrap();
        assert_eq!(s.on_switch(), Some("HOLD"));
        assert!(s.apply([("PARK", "Busy")]).is_err());
    }

    #[test]
    fn states_are_validated() {
        let mut v = coords();
        v.set_state_str("Busy").unwrap();
        assert_eq!(v.state, PropertyState::Busy);
        assert!(v.set_state_str("Moving").is_err());
        assert_eq!(v.state, PropertyState::Busy);
    }

    #[test]
    fn apply_update_merges() {
        let mut v = coords();
        let update = XmlElement::parse(
            br#"<setNumberVector device="mount" name="EQUATORIAL_EOD_COORD" state="Busy" timeout="60" timestamp="2024-01-02T03:04:05">
                <oneNumber name="RA">1.25</oneNumber>
            </setNumberVector>"#,
        )
        .unwrap();

        v.apply_update(&update).unwrap();
        assert_eq!(v.state, PropertyState::Busy);
        assert_eq!(v.timeout, Some(60.0));
        assert_eq!(v.timestamp, Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()));
        assert_eq!(v.value("RA").unwrap(), 1.25);
        assert_eq!(v.value("DEC").unwrap(), -10.25);

        let other = XmlElement::new("setNumberVector")
            .with_attribute("device", "mount")
            .with_attribute("name", "HORIZONTAL_COORD");
        assert!(matches!(v.apply_update(&other), Err(ModelError::Mismatch { .. })));
    }

    #[test]
    fn blob_update_checks_size() {
        let mut v = BlobVector::new("ccd", "CCD1", vec![Blob::new("CCD1", "")]).unwrap();
        let update = |size: &str, format: &str| {
            XmlElement::new("setBLOBVector")
                .with_attribute("device", "ccd")
                .with_attribute("name", "CCD1")
                .with_child(
                    XmlElement::new("oneBLOB")
                        .with_attribute("name", "CCD1")
                        .with_attribute("size", size)
                        .with_attribute("format", format)
                        .with_text("aGVs\nbG8="),
                )
        };

        v.apply_update(&update("5", ".txt")).unwrap();
        assert_eq!(v.element("CCD1").unwrap().data(), b"hello");
        assert_eq!(v.element("CCD1").unwrap().format, ".txt");

        assert_eq!(
            v.apply_update(&update("9", ".txt")),
            Err(ModelError::BlobSize { name: "CCD1".into(), declared: 9, actual: 5 })
        );

        // compressed payloads declare the uncompressed size
        v.apply_update(&update("9", ".txt.z")).unwrap();
    }

    #[test]
    fn update_is_idempotent() {
        let mut v = coords();
        v.touch();

        let first = v.update(Some("slewing")).unwrap().to_wire();
        let second = v.update(Some("slewing")).unwrap().to_wire();
        assert_eq!(first, second);
    }
}
