use thiserror::Error;

/// Errors raised by the property model and its (de)serialization.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("no schema entry for <{0}>")]
    Schema(String),
    #[error("invalid {what}: {value:?}")]
    Value { what: &'static str, value: String },
    #[error("vector {0} has no elements")]
    Empty(String),
    #[error("duplicate element {element} in {vector}")]
    Duplicate { vector: String, element: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} is read-only")]
    ReadOnly(String),
    #[error("BLOB {name} declares {declared} bytes but decoded to {actual}")]
    BlobSize { name: String, declared: usize, actual: usize },
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("missing attribute {attribute} on <{tag}>")]
    MissingAttribute { tag: String, attribute: &'static str },
    #[error("unexpected <{found}>, expected <{expected}>")]
    UnexpectedTag { expected: String, found: String },
    #[error("{key} does not match <{tag}> for {found}")]
    Mismatch { key: String, tag: String, found: String },
    #[error("xml error: {0}")]
    Xml(String),
}

impl ModelError {
    pub fn value(what: &'static str, value: impl Into<String>) -> Self {
        Self::Value { what, value: value.into() }
    }
}

/// Errors raised while splitting a byte stream into protocol elements.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramingError {
    #[error("malformed element: {0}")]
    Malformed(String),
    #[error("stray end tag </{0}>")]
    StrayEnd(String),
    #[error("element exceeds {0} bytes")]
    Oversized(usize),
}
