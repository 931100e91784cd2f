//! fedgate-core: Shared protocol library for the dialback federation gateway.
//!
//! Provides dialback key derivation, streaming XML frame extraction,
//! element parsing, wire envelope builders, and stanza decoding.

pub mod error;
pub mod keys;
pub mod stanza;
pub mod wire;
pub mod xml;

// Re-export commonly used items at crate root.
pub use error::{FedError, FedResult};
pub use keys::{dialback_key, domain_pair, generate_ping_id, generate_stream_id};
pub use stanza::{domain_of, Stanza};
pub use xml::{parse_element, Element, Frame, StanzaBuffer, StreamHeader};
