//! Delivery seams between the gateway and whatever sits behind it.
//!
//! The receiving loop hands authenticated stanzas to a [`PacketProcessor`]
//! and MUC occupant presence to a [`MucPresenceNotifier`]. The default
//! implementations log; embedders swap in their own.

use fedgate_core::Stanza;
use tracing::info;

/// Consumes authenticated inbound stanzas, identified by sender JID.
pub trait PacketProcessor: Send + Sync {
    fn process(&self, from: &str, stanza: &Stanza);
}

/// Receives MUC occupant membership changes gatewayed from the remote
/// server.
pub trait MucPresenceNotifier: Send + Sync {
    fn advertise_occupant(&self, room: &str, occupant: &str);
    fn remove_occupant(&self, room: &str, occupant: &str);
}

/// Default processor: logs each delivered stanza.
#[derive(Debug, Default)]
pub struct LoggingProcessor;

impl PacketProcessor for LoggingProcessor {
    fn process(&self, from: &str, stanza: &Stanza) {
        info!(
            %from,
            kind = ?stanza.kind,
            to = stanza.to().unwrap_or(""),
            "delivering stanza"
        );
    }
}

/// Default notifier: logs occupant changes.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl MucPresenceNotifier for LoggingNotifier {
    fn advertise_occupant(&self, room: &str, occupant: &str) {
        info!(%room, %occupant, "occupant joined");
    }

    fn remove_occupant(&self, room: &str, occupant: &str) {
        info!(%room, %occupant, "occupant left");
    }
}
