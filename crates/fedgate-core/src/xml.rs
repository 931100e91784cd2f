//! Streaming XML frame extraction and element parsing.
//!
//! An XMPP federation stream is one long XML document: a `<stream:stream>`
//! open tag, a sequence of complete top-level elements, and a closing
//! `</stream:stream>`. [`StanzaBuffer`] accumulates raw socket bytes and
//! yields complete frames; partial input simply waits for more bytes.

use crate::error::{FedError, FedResult};
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Attributes of a `<stream:stream>` open tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
}

/// One complete frame extracted from the byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The `<stream:stream ...>` open tag.
    StreamOpen(StreamHeader),
    /// A complete top-level element, as raw text.
    Element(String),
    /// The `</stream:stream>` close tag.
    StreamClose,
}

/// Streaming frame extractor: accumulates bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct StanzaBuffer {
    buffer: Vec<u8>,
}

/// Parser position while scanning for a frame boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between top-level elements.
    Idle,
    /// Inside a top-level element, waiting for its end tag.
    InElement,
}

impl StanzaBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append raw bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> FedResult<Option<Frame>> {
        match extract_frame(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Drop any buffered bytes. Used when the byte source is replaced
    /// during a TLS upgrade and the stream restarts from scratch.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn is_stream_name(start_name: &[u8], local: &[u8]) -> bool {
    local == b"stream" || start_name == b"stream:stream"
}

fn header_from_start(e: &BytesStart<'_>) -> StreamHeader {
    let mut header = StreamHeader::default();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = String::from_utf8_lossy(&attr.value).to_string();
        match key.as_str() {
            "from" => header.from = Some(value),
            "to" => header.to = Some(value),
            "id" => header.id = Some(value),
            "version" => header.version = Some(value),
            _ => {}
        }
    }
    header
}

/// Scan the buffer for one complete frame.
///
/// Returns `Some((frame, bytes_consumed))`, or `None` when the buffer holds
/// only a partial frame. Unclosed-tag syntax errors are the normal TCP
/// fragmentation case and map to `None`.
fn extract_frame(buffer: &[u8]) -> FedResult<Option<(Frame, usize)>> {
    // A bare stream close has no matching open tag in the buffer; the XML
    // reader would reject it, so catch it before parsing.
    let first = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'));
    if let Some(start) = first {
        if buffer[start..].starts_with(b"</stream:stream>") {
            let end = start + b"</stream:stream>".len();
            return Ok(Some((Frame::StreamClose, end)));
        }
    } else {
        return Ok(None);
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ScanState::Idle;
    let mut element_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,

            Ok(Event::Start(e)) => {
                if state == ScanState::Idle
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(header_from_start(&e)), end)));
                }

                depth += 1;
                if state == ScanState::Idle && depth == 1 {
                    state = ScanState::InElement;
                    element_start = pos;
                }
            }

            Ok(Event::Empty(e)) => {
                if state == ScanState::Idle
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(header_from_start(&e)), end)));
                }
                // A self-closing top-level element is a complete frame.
                if state == ScanState::Idle && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let text = String::from_utf8_lossy(&buffer[pos..end]).into_owned();
                    return Ok(Some((Frame::Element(text), end)));
                }
            }

            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}

            Ok(Event::End(e)) => {
                if depth == 0
                    && is_stream_name(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, end)));
                }

                depth = depth.saturating_sub(1);
                if state == ScanState::InElement && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let text =
                        String::from_utf8_lossy(&buffer[element_start..end]).into_owned();
                    return Ok(Some((Frame::Element(text), end)));
                }
            }

            Ok(Event::Eof) => return Ok(None),

            // Partial element still in flight on the wire.
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return Ok(None),

            Err(e) => return Err(FedError::Xml(e.to_string())),
        }
    }
}

/// A parsed XML element: name as written (prefix kept), attributes in
/// document order, concatenated text content, child elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// The name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Look up an attribute by exact key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child whose local name matches.
    pub fn child(&self, local: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name() == local)
    }

    /// Whether a child with the given local name and `xmlns` exists.
    pub fn has_child_ns(&self, local: &str, xmlns: &str) -> bool {
        self.children
            .iter()
            .any(|c| c.local_name() == local && c.attr("xmlns") == Some(xmlns))
    }
}

/// Parse one complete element (as produced by [`StanzaBuffer`]) into a tree.
pub fn parse_element(raw: &str) -> FedResult<Element> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,

            Ok(Event::Start(e)) => {
                stack.push(element_from_start(&e));
            }

            Ok(Event::Empty(e)) => {
                let elem = element_from_start(&e);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(elem),
                    None => return Ok(elem),
                }
            }

            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| FedError::Xml(e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t));
                }
            }

            Ok(Event::End(_)) => {
                let done = stack
                    .pop()
                    .ok_or_else(|| FedError::Xml("unbalanced end tag".into()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(done),
                    None => return Ok(done),
                }
            }

            Ok(Event::Eof) => {
                return Err(FedError::Xml("unexpected end of element".into()))
            }

            Err(e) => return Err(FedError::Xml(e.to_string())),
        }
    }
}

fn element_from_start(e: &BytesStart<'_>) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attrs = Vec::new();
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = match attr.unescape_value() {
            Ok(v) => v.to_string(),
            Err(_) => String::from_utf8_lossy(&attr.value).to_string(),
        };
        attrs.push((key, value));
    }
    Element {
        name,
        attrs,
        text: String::new(),
        children: Vec::new(),
    }
}
