//! Attribute table for every tag the property model emits.
//!
//! Serialization walks the list for a tag in order and emits each attribute
//! the object actually has set; anything not listed is never written.

use crate::ModelError;

const VECTOR_DEF: &[&str] =
    &["device", "name", "label", "group", "state", "perm", "timeout", "timestamp", "message"];
const VECTOR_SET: &[&str] = &["device", "name", "state", "timeout", "timestamp", "message"];
const VECTOR_NEW: &[&str] = &["device", "name", "timestamp"];
const ELEMENT_DEF: &[&str] = &["name", "label"];
const ELEMENT_ONE: &[&str] = &["name"];

pub const SCHEMA: &[(&str, &[&str])] = &[
    ("defNumberVector", VECTOR_DEF),
    ("defNumber", &["name", "label", "format", "min", "max", "step"]),
    ("defTextVector", VECTOR_DEF),
    ("defText", ELEMENT_DEF),
    ("defLightVector", &["device", "name", "label", "group", "state", "timestamp", "message"]),
    ("defLight", ELEMENT_DEF),
    (
        "defSwitchVector",
        &[
            "device", "name", "label", "group", "state", "perm", "rule", "timeout", "timestamp",
            "message",
        ],
    ),
    ("defSwitch", ELEMENT_DEF),
    ("defBLOBVector", VECTOR_DEF),
    ("defBLOB", ELEMENT_DEF),
    ("setNumberVector", VECTOR_SET),
    ("setTextVector", VECTOR_SET),
    ("setLightVector", &["device", "name", "state", "timestamp", "message"]),
    ("setSwitchVector", VECTOR_SET),
    ("setBLOBVector", VECTOR_SET),
    ("oneNumber", ELEMENT_ONE),
    ("oneText", ELEMENT_ONE),
    ("oneLight", ELEMENT_ONE),
    ("oneSwitch", ELEMENT_ONE),
    ("oneBLOB", &["name", "size", "enclen", "format"]),
    ("newNumberVector", VECTOR_NEW),
    ("newTextVector", VECTOR_NEW),
    ("newSwitchVector", VECTOR_NEW),
    ("newBLOBVector", VECTOR_NEW),
    ("getProperties", &["version", "device", "name"]),
    ("message", &["device", "timestamp", "message"]),
];

/// Legal attribute names for `tag`, in emission order
pub fn attributes(tag: &str) -> Result<&'static [&'static str], ModelError> {
    SCHEMA
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, attrs)| *attrs)
        .ok_or_else(|| ModelError::Schema(tag.to_owned()))
}

/// Something that can answer attribute lookups for schema-driven serialization
pub trait Attributes {
    /// Wire value of `attribute`, or `None` when it is not set on this object
    fn attribute(&self, attribute: &str) -> Option<String>;
}
