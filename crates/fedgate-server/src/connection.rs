//! Shared connection plumbing for the three connection roles.
//!
//! A connection owns one TCP socket which may be upgraded to TLS in place
//! exactly once, a kill flag with write-then-close semantics, and a frame
//! reader bounded by the configured socket timeout. Protocol state machines
//! consume [`StreamEvent`]s and emit [`Effect`]s; the drivers execute the
//! effects against the socket and the shared session context.

use fedgate_core::xml::{Frame, StreamHeader};
use fedgate_core::{parse_element, FedError, FedResult, Stanza};
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Atomic stop flag shared between a connection and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The connection's byte stream: plain TCP or TLS-wrapped.
///
/// The TLS upgrade replaces the byte source in place; it is permitted
/// exactly once per connection and refuses to run on an already-upgraded
/// stream.
pub enum ByteSource {
    Plain(TcpStream),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// Transient placeholder while an upgrade is in flight.
    Detached,
}

impl ByteSource {
    pub fn is_tls(&self) -> bool {
        matches!(self, ByteSource::ClientTls(_) | ByteSource::ServerTls(_))
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ByteSource::Plain(s) => s.read(buf).await,
            ByteSource::ClientTls(s) => s.read(buf).await,
            ByteSource::ServerTls(s) => s.read(buf).await,
            ByteSource::Detached => Ok(0),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ByteSource::Plain(s) => s.write_all(data).await,
            ByteSource::ClientTls(s) => s.write_all(data).await,
            ByteSource::ServerTls(s) => s.write_all(data).await,
            ByteSource::Detached => Err(std::io::Error::other("byte source detached")),
        }
    }

    pub async fn shutdown(&mut self) {
        match self {
            ByteSource::Plain(s) => {
                let _ = s.shutdown().await;
            }
            ByteSource::ClientTls(s) => {
                let _ = s.shutdown().await;
            }
            ByteSource::ServerTls(s) => {
                let _ = s.shutdown().await;
            }
            ByteSource::Detached => {}
        }
    }

    /// Client-side in-place TLS upgrade (initiating/authorizing legs).
    pub async fn upgrade_client(
        &mut self,
        connector: &TlsConnector,
        name: ServerName<'static>,
    ) -> FedResult<()> {
        match std::mem::replace(self, ByteSource::Detached) {
            ByteSource::Plain(tcp) => {
                let tls = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| FedError::Tls(format!("handshake failed: {e}")))?;
                *self = ByteSource::ClientTls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(FedError::Tls("stream already upgraded".into()))
            }
        }
    }

    /// Server-side in-place TLS upgrade (receiving leg, after `proceed`).
    pub async fn upgrade_server(&mut self, acceptor: &TlsAcceptor) -> FedResult<()> {
        match std::mem::replace(self, ByteSource::Detached) {
            ByteSource::Plain(tcp) => {
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| FedError::Tls(format!("handshake failed: {e}")))?;
                *self = ByteSource::ServerTls(Box::new(tls));
                Ok(())
            }
            other => {
                *self = other;
                Err(FedError::Tls("stream already upgraded".into()))
            }
        }
    }
}

/// Write bytes; if the kill flag is set, close the socket after the write
/// so a final closing stream tag is flushed before teardown.
pub async fn write_raw(
    source: &mut ByteSource,
    kill: &KillSwitch,
    data: &[u8],
) -> FedResult<()> {
    source.write_all(data).await?;
    if kill.is_set() {
        source.shutdown().await;
    }
    Ok(())
}

/// Read a chunk within the socket timeout. Returns 0 on EOF.
pub async fn read_chunk(
    source: &mut ByteSource,
    timeout: Duration,
    buf: &mut [u8],
) -> FedResult<usize> {
    match tokio::time::timeout(timeout, source.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FedError::Timeout),
    }
}

/// One event fed to a protocol state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Open(StreamHeader),
    Element(fedgate_core::Element),
    Close,
}

/// Turn an extracted frame into a machine event, parsing element frames.
pub fn event_from_frame(frame: Frame) -> FedResult<StreamEvent> {
    Ok(match frame {
        Frame::StreamOpen(header) => StreamEvent::Open(header),
        Frame::Element(raw) => StreamEvent::Element(parse_element(&raw)?),
        Frame::StreamClose => StreamEvent::Close,
    })
}

/// Side effects requested by a state machine transition. Machines never
/// write to sockets or spawn tasks themselves; the driver executes these.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Write on this connection.
    Send(String),
    /// Write over the receiving connection registered for the pair.
    SendToReceiving { pair: String, data: String },
    /// Replace this connection's byte source with a TLS-wrapped one.
    UpgradeTls,
    /// Record a generated dialback key and the expectation that the peer
    /// will call back as authoritative server for this pair.
    RegisterDialback { pair: String, key: String },
    /// Register this receiving connection under its domain pair.
    RegisterConnection { pair: String },
    /// Insert a domain into the verified set.
    MarkVerified(String),
    /// Drain the pending packet queue onto this connection.
    FlushQueue,
    /// Start the liveness ping task.
    StartPing,
    /// Relay a received key offer to the remote's authoritative server via
    /// the initiating connection.
    RelayVerify {
        local: String,
        remote: String,
        stream_id: String,
        key: String,
    },
    /// Open a one-shot authorizing connection for a secondary domain. The
    /// verdict is answered over the originating connection's pair, which
    /// may differ from the offered domain pair when the offer was
    /// multiplexed on an existing stream.
    SpawnAuthorizing {
        origin_pair: String,
        local: String,
        remote: String,
        stream_id: String,
        key: String,
    },
    /// Hand an authenticated stanza to the packet processor.
    Deliver(Stanza),
    /// A gatewayed MUC occupant presence: advertise or withdraw.
    MucPresence { stanza: Stanza, joining: bool },
    /// Route a pong id to the ping tracker.
    Pong(String),
    /// Close the stream cleanly.
    Close,
    /// Protocol failure; tear the connection down.
    Fail(String),
}

/// What the driver's loop does after executing a batch of effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Continue,
    CloseStream,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_latches() {
        let kill = KillSwitch::new();
        assert!(!kill.is_set());
        let other = kill.clone();
        other.set();
        assert!(kill.is_set());
    }

    #[test]
    fn event_from_element_frame_parses() {
        let event =
            event_from_frame(Frame::Element("<db:result from='a' to='b'>K</db:result>".into()))
                .unwrap();
        match event {
            StreamEvent::Element(e) => {
                assert_eq!(e.local_name(), "result");
                assert_eq!(e.text, "K");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn event_from_close_frame() {
        assert_eq!(event_from_frame(Frame::StreamClose).unwrap(), StreamEvent::Close);
    }
}
