//! Extraction of binary payloads carried in `oneBLOB` elements.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use compact_str::CompactString;
use tracing::{debug, warn};

use crate::{
    ModelError, PropertyKey,
    xml::{Attribute, EventSink, XmlEvent},
};

/// A decoded BLOB together with the attributes it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobPayload {
    /// Enclosing vector, when the element arrived inside a `setBLOBVector`
    pub vector: Option<PropertyKey>,
    pub name: CompactString,
    pub format: CompactString,
    pub size: Option<usize>,
    pub attributes: Vec<Attribute>,
    pub data: Vec<u8>,
}

pub trait BlobSink {
    fn blob(&mut self, payload: BlobPayload);
}

impl<F: FnMut(BlobPayload)> BlobSink for F {
    fn blob(&mut self, payload: BlobPayload) {
        self(payload)
    }
}

/// Decodes base64 text, ignoring the line breaks and indentation it is usually
/// wrapped with.
pub fn decode(text: &str) -> Result<Vec<u8>, ModelError> {
    let compact = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect::<Vec<u8>>();
    Ok(BASE64.decode(compact)?)
}

/// Checks a declared size against the decoded length. Compressed payloads
/// (format ending in `.z`) declare their uncompressed size and are not checked.
pub fn check_size(
    name: &str,
    format: &str,
    declared: Option<usize>,
    actual: usize,
) -> Result<(), ModelError> {
    match declared {
        Some(declared) if declared != actual && !format.ends_with(".z") => {
            Err(ModelError::BlobSize { name: name.to_owned(), declared, actual })
        }
        _ => Ok(()),
    }
}

struct Pending {
    attributes: Vec<Attribute>,
    text: Vec<u8>,
}

/// Watches framed events for `oneBLOB` elements and hands each decoded payload
/// to a [`BlobSink`]. The base64 text may arrive in any number of pieces; it
/// is accumulated in one buffer and decoded at the end tag.
pub struct BlobExtractor<S> {
    sink: S,
    vector: Option<PropertyKey>,
    pending: Option<Pending>,
}

impl<S: BlobSink> BlobExtractor<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, vector: None, pending: None }
    }

    pub fn sink(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn reset(&mut self) {
        self.vector = None;
        self.pending = None;
    }

    fn finish(&self, pending: Pending) -> Result<BlobPayload, ModelError> {
        let attr = |key: &str| {
            pending
                .attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        let name = CompactString::from(attr("name").unwrap_or_default());
        let format = CompactString::from(attr("format").unwrap_or_default());
        let size = attr("size")
            .map(|s| s.trim().parse::<usize>().map_err(|_| ModelError::value("size", s)))
            .transpose()?;

        let data = BASE64.decode(&pending.text)?;
        check_size(&name, &format, size, data.len())?;

        Ok(BlobPayload {
            vector: self.vector.clone(),
            name,
            format,
            size,
            attributes: pending.attributes,
            data,
        })
    }
}

impl<S: BlobSink> EventSink for BlobExtractor<S> {
    fn event(&mut self, event: &XmlEvent) {
        match event {
            XmlEvent::Start { tag, attributes } if tag == "setBLOBVector" => {
                let attr = |key: &str| {
                    attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
                };
                self.vector = attr("device").zip(attr("name")).map(|(d, n)| PropertyKey::new(d, n));
            }
            XmlEvent::Start { tag, attributes } if tag == "oneBLOB" => {
                self.pending = Some(Pending { attributes: attributes.clone(), text: Vec::new() });
            }
            XmlEvent::Text(text) => {
                if let Some(pending) = &mut self.pending {
                    pending.text.extend(text.bytes().filter(|b| !b.is_ascii_whitespace()));
                }
            }
            XmlEvent::End { tag } if tag == "oneBLOB" => {
                let Some(pending) = self.pending.take() else {
                    return;
                };

                match self.finish(pending) {
                    Ok(payload) => {
                        debug!(name = %payload.name, len = payload.data.len(), "received BLOB");
                        self.sink.blob(payload);
                    }
                    Err(err) => warn!(%err, "dropping BLOB"),
                }
            }
            XmlEvent::End { tag } if tag == "setBLOBVector" => self.vector = None,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::Framer;

    fn start(tag: &str, attributes: &[(&str, &str)]) -> XmlEvent {
        XmlEvent::Start {
            tag: tag.into(),
            attributes: attributes.iter().map(|(k, v)| ((*k).into(), (*v).to_owned())).collect(),
        }
    }

    fn end(tag: &str) -> XmlEvent {
        XmlEvent::End { tag: tag.into() }
    }

    #[test]
    fn decode_ignores_whitespace() {
        assert_eq!(decode("aGVs\n  bG8=\n").unwrap(), b"hello");
        assert!(matches!(decode("a$=="), Err(ModelError::Base64(_))));
    }

    #[test]
    fn size_check() {
        assert!(check_size("B", ".fits", Some(3), 3).is_ok());
        assert!(check_size("B", ".fits", None, 3).is_ok());
        assert!(check_size("B", ".fits.z", Some(100), 3).is_ok());
        assert_eq!(
            check_size("B", ".fits", Some(4), 3),
            Err(ModelError::BlobSize { name: "B".into(), declared: 4, actual: 3 })
        );
    }

    #[test]
    fn text_in_many_pieces() {
        let original = (0..=255u8).cycle().take(1000).collect::<Vec<_>>();
        let encoded = BASE64.encode(&original);
        let size = original.len().to_string();

        let mut received = Vec::new();
        let mut extractor = BlobExtractor::new(|payload: BlobPayload| received.push(payload));

        extractor.event(&start("setBLOBVector", &[("device", "ccd"), ("name", "CCD1")]));
        extractor.event(&start("oneBLOB", &[("name", "CCD1"), ("size", size.as_str()), ("format", ".fits")]));
        for piece in encoded.as_bytes().chunks(97) {
            let piece = core::str::from_utf8(piece).unwrap();
            extractor.event(&XmlEvent::Text(format!("{piece}\n")));
        }
        extractor.event(&end("oneBLOB"));
        extractor.event(&end("setBLOBVector"));
        drop(extractor);

        assert_eq!(received.len(), 1);
        let payload = &received[0];
        assert_eq!(payload.data, original);
        assert_eq!(payload.vector, Some(PropertyKey::new("ccd", "CCD1")));
        assert_eq!(payload.format, ".fits");
        assert_eq!(payload.size, Some(1000));
    }

    #[test]
    fn bad_payloads_are_dropped() {
        let mut received = 0;
        let mut extractor = BlobExtractor::new(|_: BlobPayload| received += 1);

        extractor.event(&start("oneBLOB", &[("name", "B"), ("size", "10")]));
        extractor.event(&XmlEvent::Text("aGVsbG8=".into()));
        extractor.event(&end("oneBLOB"));

        extractor.event(&start("oneBLOB", &[("name", "B")]));
        extractor.event(&XmlEvent::Text("!!!".into()));
        extractor.event(&end("oneBLOB"));

        drop(extractor);
        assert_eq!(received, 0);
    }

    #[test]
    fn through_the_framer() {
        let stream = b"<setBLOBVector device='ccd' name='CCD1' state='Ok'>\n\
            <oneBLOB name='CCD1' size='5' enclen='8' format='.txt'>\naGVs\nbG8=\n</oneBLOB>\n\
            </setBLOBVector>";

        let mut received = Vec::new();
        let mut extractor = BlobExtractor::new(|payload: BlobPayload| received.push(payload));
        let mut framer = Framer::new(1 << 20);
        for chunk in stream.chunks(7) {
            framer.feed(chunk, &mut extractor);
        }
        drop(extractor);

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].data, b"hello");
        assert_eq!(received[0].vector, Some(PropertyKey::new("ccd", "CCD1")));
    }
}
