//! Incremental splitting of a byte stream into complete top-level elements.
//!
//! The stream is treated as the content of an implicit root element, so any
//! number of sibling elements may follow one another. Bytes are scanned once
//! as they arrive; only when a top-level element closes is it handed to the
//! XML parser, and its events reach the sink only if the whole element is
//! well-formed.

use tracing::{trace, warn};

use crate::{
    FramingError,
    xml::{EventSink, parse_events},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Content,
    /// Just after `<`
    Open,
    /// After `<!`, until it is known to be a comment, CDATA or a declaration
    Bang,
    Tag { closing: bool, quote: Option<u8>, prev: u8 },
    Comment,
    CData,
    /// Declarations and processing instructions, skipped up to `>`
    Special,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedReport {
    pub emitted: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct Framer {
    buf: Vec<u8>,
    scan: usize,
    mode: Mode,
    /// Start of the markup construct currently being scanned
    lt: usize,
    /// Start of the top-level element currently open
    start: Option<usize>,
    open: Vec<Box<[u8]>>,
    max_bytes: usize,
}

impl Framer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scan: 0,
            mode: Mode::Content,
            lt: 0,
            start: None,
            open: Vec::new(),
            max_bytes,
        }
    }

    /// Forgets any partial element, for a fresh stream
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan = 0;
        self.mode = Mode::Content;
        self.lt = 0;
        self.start = None;
        self.open.clear();
    }

    /// Bytes held back waiting for the rest of an element
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn feed(&mut self, chunk: &[u8], sink: &mut impl EventSink) -> FeedReport {
        let mut report = FeedReport::default();
        self.buf.extend_from_slice(chunk);

        while self.scan < self.buf.len() {
            let i = self.scan;
            let byte = self.buf[i];
            self.scan += 1;

            match self.mode {
                Mode::Content => {
                    if byte == b'<' {
                        self.lt = i;
                        self.mode = Mode::Open;
                    }
                }
                Mode::Open => {
                    self.mode = match byte {
                        b'/' => Mode::Tag { closing: true, quote: None, prev: byte },
                        b'!' => Mode::Bang,
                        b'?' => Mode::Special,
                        _ => Mode::Tag { closing: false, quote: None, prev: byte },
                    };
                }
                Mode::Bang => {
                    let seen = &self.buf[self.lt..=i];
                    self.mode = if seen == b"<!--" {
                        Mode::Comment
                    } else if seen == b"<![CDATA[" {
                        Mode::CData
                    } else if b"<!--".starts_with(seen) || b"<![CDATA[".starts_with(seen) {
                        Mode::Bang
                    } else if byte == b'>' {
                        Mode::Content
                    } else {
                        Mode::Special
                    };
                }
                Mode::Comment => {
                    if i >= self.lt + 6 && &self.buf[i - 2..=i] == b"-->" {
                        self.mode = Mode::Content;
                    }
                }
                Mode::CData => {
                    if i >= self.lt + 11 && &self.buf[i - 2..=i] == b"]]>" {
                        self.mode = Mode::Content;
                    }
                }
                Mode::Special => {
                    if byte == b'>' {
                        self.mode = Mode::Content;
                    }
                }
                Mode::Tag { closing, quote: Some(q), .. } => {
                    if byte == q {
                        self.mode = Mode::Tag { closing, quote: None, prev: byte };
                    }
                }
                Mode::Tag { closing, quote: None, prev } => match byte {
                    b'"' | b'\'' => self.mode = Mode::Tag { closing, quote: Some(byte), prev },
                    b'>' => {
                        self.mode = Mode::Content;
                        self.tag_closed(i, closing, prev == b'/', sink, &mut report);
                    }
                    _ => self.mode = Mode::Tag { closing, quote: None, prev: byte },
                },
            }
        }

        self.compact(&mut report);
        report
    }

    fn tag_closed(
        &mut self,
        end: usize,
        closing: bool,
        self_closing: bool,
        sink: &mut impl EventSink,
        report: &mut FeedReport,
    ) {
        let name = tag_name(&self.buf[self.lt..=end]);

        if closing {
            match self.open.pop() {
                Some(top) if *top == *name => {}
                Some(top) => {
                    let err = FramingError::Malformed(format!(
                        "</{}> closes <{}>",
                        String::from_utf8_lossy(name),
                        String::from_utf8_lossy(&top),
                    ));
                    warn!(%err, "dropping element");
                    report.dropped += 1;
                    self.open.clear();
                    self.start = None;
                    return;
                }
                None => {
                    let err = FramingError::StrayEnd(String::from_utf8_lossy(name).into_owned());
                    warn!(%err, "dropping end tag");
                    report.dropped += 1;
                    return;
                }
            }
        } else {
            if self.open.is_empty() {
                self.start = Some(self.lt);
            }
            if !self_closing {
                self.open.push(name.into());
            }
        }

        if self.open.is_empty()
            && let Some(start) = self.start.take()
        {
            let element = &self.buf[start..=end];
            match parse_events(element) {
                Ok(events) => {
                    for event in &events {
                        sink.event(event);
                    }
                    report.emitted += 1;
                }
                Err(err) => {
                    warn!(%err, len = element.len(), "dropping element");
                    report.dropped += 1;
                }
            }
        }
    }

    /// Discards bytes no longer needed and enforces the size guard
    fn compact(&mut self, report: &mut FeedReport) {
        let keep = match (self.start, self.mode) {
            (Some(start), _) => start,
            (None, Mode::Content) => self.scan,
            (None, _) => self.lt,
        };

        if keep > 0 {
            self.buf.drain(..keep);
            self.scan -= keep;
            self.lt = self.lt.saturating_sub(keep);
            self.start = self.start.map(|s| s - keep);
        }

        if self.buf.len() > self.max_bytes {
            let err = FramingError::Oversized(self.max_bytes);
            warn!(%err, pending = self.buf.len(), "discarding buffered input");
            report.dropped += 1;
            self.reset();
        } else if !self.buf.is_empty() {
            trace!(pending = self.buf.len(), "waiting for more input");
        }
    }
}

fn tag_name(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_prefix(b"<").unwrap_or(raw);
    let raw = raw.strip_prefix(b"/").unwrap_or(raw);
    let end = raw
        .iter()
        .position(|b| b.is_ascii_whitespace() || matches!(b, b'/' | b'>'))
        .unwrap_or(raw.len());
    &raw[..end]
}
