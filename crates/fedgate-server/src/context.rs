//! Shared session state: verified domains, issued keys, pending
//! authoritative-callback expectations, the outbound packet queue, and
//! handles to live connections.
//!
//! Everything here sits behind one [`SessionContext`] that every
//! connection task holds an `Arc` to. Locks are plain `std::sync::Mutex`
//! held only for map operations, never across awaits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::ping::PingTracker;

/// Control messages delivered to the initiating connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum InitiatingControl {
    /// Send a fresh dialback key offer for this domain pair.
    InitiateDialback { from: String, to: String },
    /// Forward a key offer received on an inbound stream to the remote's
    /// authoritative server.
    RelayVerify {
        local: String,
        remote: String,
        stream_id: String,
        key: String,
    },
    /// Tear the connection down.
    Stop,
}

/// Control messages delivered to a receiving connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivingControl {
    Stop,
}

/// Writer and control handles for one registered receiving connection.
#[derive(Debug, Clone)]
pub struct ReceivingHandle {
    pub writer: mpsc::Sender<String>,
    pub control: mpsc::Sender<ReceivingControl>,
}

/// A packet held back until its destination domain verifies. Kept in its
/// serialized form so flushing is a plain write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPacket {
    pub to_domain: String,
    pub raw: String,
}

/// The expectation that the next inbound connection for a pair is the
/// peer calling back in the authoritative-server role.
#[derive(Debug, Clone, Copy, Default)]
struct PendingVerification {
    expect_authoritative_callback: bool,
}

/// Session-wide shared state. One instance per gateway process.
#[derive(Default)]
pub struct SessionContext {
    /// Remote domains that passed dialback.
    verified: Mutex<HashSet<String>>,
    /// Keys we generated, by domain pair, for answering db:verify.
    keys: Mutex<HashMap<String, String>>,
    /// Pairs with a dialback in flight and their callback expectations.
    pending: Mutex<HashMap<String, PendingVerification>>,
    /// Outbound packets awaiting verification, in arrival order.
    queue: Mutex<VecDeque<QueuedPacket>>,
    /// Live receiving connections by domain pair.
    receiving: Mutex<HashMap<String, ReceivingHandle>>,
    /// Stream ids agreed per pair, reused across stream restarts.
    session_ids: Mutex<HashMap<String, String>>,
    /// Writer into the initiating connection, when one is up.
    initiating_writer: Mutex<Option<mpsc::Sender<String>>>,
    /// Control channel into the initiating connection, when one is up.
    initiating_control: Mutex<Option<mpsc::Sender<InitiatingControl>>>,
    initiating_connected: AtomicBool,
    /// Liveness bookkeeping for the outbound stream.
    pub ping: Mutex<PingTracker>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    // --- verified domains ---

    pub fn mark_verified(&self, domain: &str) {
        lock(&self.verified).insert(domain.to_string());
    }

    pub fn is_verified(&self, domain: &str) -> bool {
        lock(&self.verified).contains(domain)
    }

    /// Forget everything trust-related: the verified set, generated keys,
    /// and pending expectations. Called when the outbound stream dies;
    /// every domain re-verifies on the replacement stream.
    pub fn reset_trust(&self) {
        lock(&self.verified).clear();
        lock(&self.keys).clear();
        lock(&self.pending).clear();
    }

    // --- dialback keys and expectations ---

    /// Record a generated key and arm the authoritative-callback
    /// expectation for the pair.
    pub fn register_dialback(&self, pair: &str, key: &str) {
        lock(&self.keys).insert(pair.to_string(), key.to_string());
        lock(&self.pending).insert(
            pair.to_string(),
            PendingVerification {
                expect_authoritative_callback: true,
            },
        );
    }

    pub fn key_for(&self, pair: &str) -> Option<String> {
        lock(&self.keys).get(pair).cloned()
    }

    /// Consume the callback expectation for a pair, if armed. The first
    /// inbound stream for the pair after a key offer takes it; later
    /// streams see `false`.
    pub fn take_expectation(&self, pair: &str) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get_mut(pair) {
            Some(p) if p.expect_authoritative_callback => {
                p.expect_authoritative_callback = false;
                true
            }
            _ => false,
        }
    }

    pub fn dialback_in_flight(&self, pair: &str) -> bool {
        lock(&self.pending).contains_key(pair)
    }

    // --- outbound queue ---

    pub fn enqueue(&self, packet: QueuedPacket) {
        lock(&self.queue).push_back(packet);
    }

    /// Take the whole queue in arrival order. The caller owns delivery;
    /// the queue is empty afterwards.
    pub fn drain_queue(&self) -> Vec<QueuedPacket> {
        lock(&self.queue).drain(..).collect()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    // --- receiving connection registry ---

    pub fn register_receiving(&self, pair: &str, handle: ReceivingHandle) {
        lock(&self.receiving).insert(pair.to_string(), handle);
    }

    pub fn receiving_for(&self, pair: &str) -> Option<ReceivingHandle> {
        lock(&self.receiving).get(pair).cloned()
    }

    pub fn remove_receiving(&self, pair: &str) {
        lock(&self.receiving).remove(pair);
    }

    pub fn stop_all_receiving(&self) -> Vec<ReceivingHandle> {
        lock(&self.receiving).drain().map(|(_, h)| h).collect()
    }

    // --- stream ids ---

    pub fn remember_session_id(&self, pair: &str, id: &str) {
        lock(&self.session_ids).insert(pair.to_string(), id.to_string());
    }

    pub fn session_id_for(&self, pair: &str) -> Option<String> {
        lock(&self.session_ids).get(pair).cloned()
    }

    // --- initiating connection handles ---

    pub fn set_initiating(
        &self,
        writer: mpsc::Sender<String>,
        control: mpsc::Sender<InitiatingControl>,
    ) {
        *lock(&self.initiating_writer) = Some(writer);
        *lock(&self.initiating_control) = Some(control);
        self.initiating_connected.store(true, Ordering::SeqCst);
    }

    pub fn clear_initiating(&self) {
        *lock(&self.initiating_writer) = None;
        *lock(&self.initiating_control) = None;
        self.initiating_connected.store(false, Ordering::SeqCst);
    }

    pub fn initiating_connected(&self) -> bool {
        self.initiating_connected.load(Ordering::SeqCst)
    }

    pub fn initiating_writer(&self) -> Option<mpsc::Sender<String>> {
        lock(&self.initiating_writer).clone()
    }

    pub fn initiating_control(&self) -> Option<mpsc::Sender<InitiatingControl>> {
        lock(&self.initiating_control).clone()
    }

    // --- ping bookkeeping ---

    /// Install fresh ping bookkeeping for a new outbound connection. The
    /// previous tracker's miss streak and fired latch die with the
    /// connection they belonged to.
    pub fn arm_ping(&self, threshold: u32) {
        *lock(&self.ping) = PingTracker::new(threshold);
    }

    pub fn ping_outstanding(&self, id: &str) -> bool {
        lock(&self.ping).is_outstanding(id)
    }
}
