//! Typed view over decoded top-level elements once a stream is
//! authenticated.

use crate::error::{FedError, FedResult};
use crate::xml::Element;

/// The three stanza kinds a federation stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// A decoded stanza: kind plus the parsed element.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub element: Element,
}

impl Stanza {
    /// Classify a parsed element. Anything other than message/presence/iq
    /// is a protocol violation at the top level of an authenticated stream.
    pub fn decode(element: Element) -> FedResult<Stanza> {
        let kind = match element.local_name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            other => {
                return Err(FedError::Protocol(format!(
                    "unexpected top-level element: {other}"
                )))
            }
        };
        Ok(Stanza { kind, element })
    }

    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// The id of an `<iq type='result'>`, if this is one. The receiving
    /// loop matches it against outstanding ping ids.
    pub fn iq_result_id(&self) -> Option<&str> {
        if self.kind == StanzaKind::Iq && self.stanza_type() == Some("result") {
            self.id()
        } else {
            None
        }
    }
}

/// Extract the domain part of a JID: strip the `node@` prefix and the
/// `/resource` suffix.
pub fn domain_of(jid: &str) -> &str {
    let after_node = match jid.split_once('@') {
        Some((_, rest)) => rest,
        None => jid,
    };
    match after_node.split_once('/') {
        Some((domain, _)) => domain,
        None => after_node,
    }
}
