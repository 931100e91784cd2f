//! Wire envelope builders for the dialback federation stream.
//!
//! Pure functions returning the exact serialized form; the connection
//! drivers only ever write what these produce.

/// Escape a string for use inside a single-quoted XML attribute.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// `<stream:stream ...>` open tag. The `id` is set only by the side that
/// accepted the connection.
pub fn stream_open(from: &str, to: &str, id: Option<&str>) -> String {
    let id_attr = match id {
        Some(id) => format!(" id='{}'", escape(id)),
        None => String::new(),
    };
    format!(
        "<stream:stream xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns='jabber:server' xmlns:db='jabber:server:dialback' \
         from='{}' to='{}'{} xml:lang='en' version='1.0'>",
        escape(from),
        escape(to),
        id_attr
    )
}

/// `<stream:features>` advertised by the receiving side. Dialback is always
/// offered; starttls only when the local TLS policy wants it.
pub fn stream_features(offer_starttls: bool, tls_required: bool) -> String {
    let mut out = String::from("<stream:features>");
    if offer_starttls {
        out.push_str("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>");
        if tls_required {
            out.push_str("<required/>");
        }
        out.push_str("</starttls>");
    }
    out.push_str("<dialback xmlns='urn:xmpp:features:dialback'><errors/></dialback>");
    out.push_str("</stream:features>");
    out
}

/// Dialback key offer: `<db:result from to>KEY</db:result>`.
pub fn dialback_result_key(from: &str, to: &str, key: &str) -> String {
    format!(
        "<db:result from='{}' to='{}'>{}</db:result>",
        escape(from),
        escape(to),
        key
    )
}

/// Answer to a key offer: `<db:result from to type='valid|invalid'/>`.
pub fn dialback_result_answer(from: &str, to: &str, valid: bool) -> String {
    format!(
        "<db:result from='{}' to='{}' type='{}'/>",
        escape(from),
        escape(to),
        if valid { "valid" } else { "invalid" }
    )
}

/// Verification request sent to the authoritative server:
/// `<db:verify from to id>KEY</db:verify>`.
pub fn dialback_verify_request(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify from='{}' to='{}' id='{}'>{}</db:verify>",
        escape(from),
        escape(to),
        escape(id),
        key
    )
}

/// Verification answer from the authoritative server.
pub fn dialback_verify_answer(from: &str, to: &str, id: &str, valid: bool, key: &str) -> String {
    format!(
        "<db:verify from='{}' to='{}' id='{}' type='{}'>{}</db:verify>",
        escape(from),
        escape(to),
        escape(id),
        if valid { "valid" } else { "invalid" },
        key
    )
}

pub fn starttls() -> String {
    "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_string()
}

pub fn proceed() -> String {
    "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_string()
}

pub fn tls_failure() -> String {
    "<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_string()
}

/// Liveness probe: `<iq type='get'><ping xmlns='urn:xmpp:ping'/></iq>`.
pub fn ping_iq(from: &str, to: &str, id: &str) -> String {
    format!(
        "<iq type='get' from='{}' to='{}' id='{}'><ping xmlns='urn:xmpp:ping'/></iq>",
        escape(from),
        escape(to),
        escape(id)
    )
}

pub fn stream_close() -> String {
    "</stream:stream>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::{Frame, StanzaBuffer};

    #[test]
    fn stream_open_carries_required_namespaces() {
        let open = stream_open("proxy", "openfire", None);
        assert!(open.contains("xmlns='jabber:server'"));
        assert!(open.contains("xmlns:db='jabber:server:dialback'"));
        assert!(open.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        assert!(open.contains("from='proxy'"));
        assert!(open.contains("to='openfire'"));
        assert!(open.contains("version='1.0'"));
        assert!(!open.contains(" id="));
    }

    #[test]
    fn stream_open_with_id() {
        let open = stream_open("openfire", "proxy", Some("s1"));
        assert!(open.contains("id='s1'"));
    }

    #[test]
    fn features_variants() {
        let plain = stream_features(false, false);
        assert!(plain.contains("urn:xmpp:features:dialback"));
        assert!(!plain.contains("starttls"));

        let tls = stream_features(true, true);
        assert!(tls.contains("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>"));
        assert!(tls.contains("<required/>"));
    }

    #[test]
    fn result_and_verify_shapes() {
        assert_eq!(
            dialback_result_key("a", "b", "KEY"),
            "<db:result from='a' to='b'>KEY</db:result>"
        );
        assert_eq!(
            dialback_result_answer("b", "a", true),
            "<db:result from='b' to='a' type='valid'/>"
        );
        assert_eq!(
            dialback_verify_request("b", "a", "s1", "KEY"),
            "<db:verify from='b' to='a' id='s1'>KEY</db:verify>"
        );
        assert!(dialback_verify_answer("a", "b", "s1", false, "KEY")
            .contains("type='invalid'"));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let open = stream_open("a&b", "c'd", None);
        assert!(open.contains("from='a&amp;b'"));
        assert!(open.contains("to='c&apos;d'"));
    }

    #[test]
    fn builders_round_trip_through_the_frame_extractor() {
        let mut buf = StanzaBuffer::new();
        buf.feed(stream_open("proxy", "openfire", None).as_bytes());
        buf.feed(dialback_result_key("proxy", "openfire", "K").as_bytes());
        buf.feed(stream_close().as_bytes());

        assert!(matches!(
            buf.next_frame().unwrap(),
            Some(Frame::StreamOpen(_))
        ));
        assert!(matches!(
            buf.next_frame().unwrap(),
            Some(Frame::Element(_))
        ));
        assert_eq!(buf.next_frame().unwrap(), Some(Frame::StreamClose));
    }
}
