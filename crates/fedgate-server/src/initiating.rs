//! The outbound (initiating) connection to the remote server.
//!
//! This leg opens the stream, negotiates STARTTLS per policy, offers the
//! dialback key, and once verified carries all outbound traffic plus the
//! liveness pings. It also receives `db:verify` answers for key offers
//! relayed on behalf of inbound streams, and pushes the verdicts back to
//! the matching receiving connection.

use crate::config::GatewayConfig;
use crate::connection::{
    event_from_frame, read_chunk, write_raw, ByteSource, Effect, HandlerAction, KillSwitch,
    StreamEvent,
};
use crate::context::{InitiatingControl, SessionContext};
use crate::ping;
use crate::tls;
use fedgate_core::xml::StanzaBuffer;
use fedgate_core::{dialback_key, domain_of, domain_pair, wire, FedError, FedResult};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// States of the outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatingState {
    AwaitStreamOpen,
    AwaitFeatures,
    AwaitTlsProceed,
    AwaitResultAnswer,
    /// Our key offer verified; the peer's own dialback toward us may still
    /// be in flight.
    VerifiedAwaitingDialback,
    Verified,
    Failed,
}

/// Pure transition logic for the initiating leg. Consumes events, emits
/// effects; the driver owns the socket and the shared context.
#[derive(Debug)]
pub struct InitiatingMachine {
    state: InitiatingState,
    local: String,
    remote: String,
    session_id: Option<String>,
    /// Local policy: require TLS before dialback.
    tls_policy: bool,
    tls_enabled: bool,
    ping_started: bool,
}

impl InitiatingMachine {
    pub fn new(local: &str, remote: &str, tls_policy: bool) -> Self {
        Self {
            state: InitiatingState::AwaitStreamOpen,
            local: local.to_string(),
            remote: remote.to_string(),
            session_id: None,
            tls_policy,
            tls_enabled: false,
            ping_started: false,
        }
    }

    pub fn state(&self) -> InitiatingState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The driver reports a completed TLS handshake; the stream restarts.
    pub fn tls_established(&mut self) {
        self.tls_enabled = true;
        self.session_id = None;
        self.state = InitiatingState::AwaitStreamOpen;
    }

    pub fn handle(&mut self, event: &StreamEvent) -> Vec<Effect> {
        match (self.state, event) {
            (InitiatingState::AwaitStreamOpen, StreamEvent::Open(header)) => {
                match &header.id {
                    Some(id) => {
                        self.session_id = Some(id.clone());
                        if let Some(from) = &header.from {
                            self.remote = domain_of(from).to_string();
                        }
                        self.state = InitiatingState::AwaitFeatures;
                        vec![]
                    }
                    None => {
                        self.state = InitiatingState::Failed;
                        vec![Effect::Fail("stream open without id".into())]
                    }
                }
            }

            (InitiatingState::AwaitFeatures, StreamEvent::Element(e))
                if e.local_name() == "features" =>
            {
                let starttls = e.child("starttls");
                let available = starttls.is_some();
                let peer_required =
                    starttls.is_some_and(|s| s.child("required").is_some());

                if !self.tls_enabled && available && (self.tls_policy || peer_required) {
                    self.state = InitiatingState::AwaitTlsProceed;
                    vec![Effect::Send(wire::starttls())]
                } else if !self.tls_enabled && self.tls_policy && !available {
                    self.state = InitiatingState::Failed;
                    vec![
                        Effect::Send(wire::stream_close()),
                        Effect::Fail("peer does not offer required starttls".into()),
                    ]
                } else {
                    self.offer_key()
                }
            }

            (InitiatingState::AwaitTlsProceed, StreamEvent::Element(e))
                if e.local_name() == "proceed" =>
            {
                vec![Effect::UpgradeTls]
            }
            (InitiatingState::AwaitTlsProceed, StreamEvent::Element(e))
                if e.local_name() == "failure" =>
            {
                self.state = InitiatingState::Failed;
                vec![Effect::Fail("peer refused starttls".into())]
            }

            (InitiatingState::AwaitResultAnswer, StreamEvent::Element(e))
                if e.local_name() == "result" && e.attr("type").is_some() =>
            {
                if e.attr("type") == Some("valid") {
                    self.state = InitiatingState::VerifiedAwaitingDialback;
                    let mut effects = vec![Effect::MarkVerified(self.remote.clone())];
                    if !self.ping_started {
                        self.ping_started = true;
                        effects.push(Effect::StartPing);
                    }
                    effects.push(Effect::FlushQueue);
                    effects
                } else {
                    self.state = InitiatingState::Failed;
                    vec![
                        Effect::Send(wire::stream_close()),
                        Effect::Fail("dialback key rejected".into()),
                    ]
                }
            }

            (
                InitiatingState::VerifiedAwaitingDialback | InitiatingState::Verified,
                StreamEvent::Element(e),
            ) if e.local_name() == "verify" && e.attr("type").is_some() => {
                // Verdict from the authoritative server for a key offer we
                // relayed on behalf of an inbound stream.
                let verify_from = e.attr("from").unwrap_or(&self.remote).to_string();
                let verify_to = e.attr("to").unwrap_or(&self.local).to_string();
                let pair = domain_pair(&verify_to, &verify_from);
                let valid = e.attr("type") == Some("valid");
                let answer = wire::dialback_result_answer(&verify_to, &verify_from, valid);
                let mut effects = vec![Effect::SendToReceiving { pair, data: answer }];
                if valid {
                    self.state = InitiatingState::Verified;
                    effects.push(Effect::MarkVerified(verify_from));
                    effects.push(Effect::FlushQueue);
                }
                effects
            }

            (
                InitiatingState::VerifiedAwaitingDialback | InitiatingState::Verified,
                StreamEvent::Element(e),
            ) if e.local_name() == "result" && e.attr("type").is_some() => {
                // Late answer for a secondary-domain key offer.
                if e.attr("type") == Some("valid") {
                    let from = e.attr("from").unwrap_or(&self.remote).to_string();
                    vec![Effect::MarkVerified(from), Effect::FlushQueue]
                } else {
                    vec![]
                }
            }

            (_, StreamEvent::Close) => {
                vec![Effect::Close]
            }

            (state, event) => {
                debug!(?state, ?event, "ignoring event on outbound stream");
                vec![]
            }
        }
    }

    /// Offer a dialback key for an additional domain pair over the already
    /// open stream.
    pub fn initiate_dialback(&mut self, from: &str, to: &str) -> Vec<Effect> {
        let Some(session_id) = self.session_id.clone() else {
            return vec![];
        };
        let key = dialback_key(from, to, &session_id);
        let pair = domain_pair(from, to);
        vec![
            Effect::RegisterDialback {
                pair,
                key: key.clone(),
            },
            Effect::Send(wire::dialback_result_key(from, to, &key)),
        ]
    }

    fn offer_key(&mut self) -> Vec<Effect> {
        let Some(session_id) = self.session_id.clone() else {
            self.state = InitiatingState::Failed;
            return vec![Effect::Fail("no stream id for key derivation".into())];
        };
        let key = dialback_key(&self.local, &self.remote, &session_id);
        let pair = domain_pair(&self.local, &self.remote);
        self.state = InitiatingState::AwaitResultAnswer;
        vec![
            Effect::RegisterDialback {
                pair,
                key: key.clone(),
            },
            Effect::Send(wire::dialback_result_key(&self.local, &self.remote, &key)),
        ]
    }
}

enum Step {
    Wrote(String),
    Ctrl(InitiatingControl),
    Read(usize),
    Shutdown,
}

/// Run one outbound connection until it fails or shuts down cleanly.
///
/// Returns `Ok(())` on an orderly shutdown; any error hands control back
/// to the reconnect supervisor.
pub async fn run_initiating(
    cfg: &GatewayConfig,
    ctx: Arc<SessionContext>,
    connector: TlsConnector,
    mut shutdown: broadcast::Receiver<()>,
) -> FedResult<()> {
    let addr = (cfg.connect_host.as_str(), cfg.connect_port);
    info!(host = %cfg.connect_host, port = cfg.connect_port, "dialing remote server");
    let tcp = TcpStream::connect(addr).await?;
    let mut source = ByteSource::Plain(tcp);
    let kill = KillSwitch::new();

    let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
    let (control_tx, mut control_rx) = mpsc::channel::<InitiatingControl>(16);
    ctx.set_initiating(write_tx, control_tx);

    let mut machine = InitiatingMachine::new(&cfg.local_domain, &cfg.remote_domain, cfg.tls_required);
    let mut buffer = StanzaBuffer::new();
    let mut read_buf = vec![0u8; 8192];

    let result = async {
        write_raw(
            &mut source,
            &kill,
            wire::stream_open(&cfg.local_domain, &cfg.remote_domain, None).as_bytes(),
        )
        .await?;

        loop {
            let step = tokio::select! {
                _ = shutdown.recv() => Step::Shutdown,
                msg = write_rx.recv() => match msg {
                    Some(data) => Step::Wrote(data),
                    None => Step::Shutdown,
                },
                msg = control_rx.recv() => match msg {
                    Some(ctrl) => Step::Ctrl(ctrl),
                    None => Step::Shutdown,
                },
                n = read_chunk(&mut source, cfg.socket_timeout, &mut read_buf) => Step::Read(n?),
            };

            match step {
                Step::Shutdown => {
                    let _ = source.write_all(wire::stream_close().as_bytes()).await;
                    source.shutdown().await;
                    return Ok(());
                }
                Step::Wrote(data) => {
                    write_raw(&mut source, &kill, data.as_bytes()).await?;
                }
                Step::Ctrl(InitiatingControl::InitiateDialback { from, to }) => {
                    let effects = machine.initiate_dialback(&from, &to);
                    if apply_effects(
                        effects, &mut source, &mut buffer, &mut machine, cfg, &ctx, &connector,
                        &kill,
                    )
                    .await?
                        == HandlerAction::CloseStream
                    {
                        return Ok(());
                    }
                }
                Step::Ctrl(InitiatingControl::RelayVerify {
                    local,
                    remote,
                    stream_id,
                    key,
                }) => {
                    let req = wire::dialback_verify_request(&local, &remote, &stream_id, &key);
                    write_raw(&mut source, &kill, req.as_bytes()).await?;
                }
                Step::Ctrl(InitiatingControl::Stop) => {
                    return Err(FedError::Protocol("outbound connection stopped".into()));
                }
                Step::Read(0) => {
                    debug!(state = ?machine.state(), "remote closed the connection");
                    return Err(FedError::Protocol("remote closed the connection".into()));
                }
                Step::Read(n) => {
                    buffer.feed(&read_buf[..n]);
                    while let Some(frame) = buffer.next_frame()? {
                        let event = event_from_frame(frame)?;
                        let effects = machine.handle(&event);
                        if apply_effects(
                            effects, &mut source, &mut buffer, &mut machine, cfg, &ctx,
                            &connector, &kill,
                        )
                        .await?
                            == HandlerAction::CloseStream
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    .await;

    kill.set();
    ctx.clear_initiating();
    result
}

#[allow(clippy::too_many_arguments)]
async fn apply_effects(
    effects: Vec<Effect>,
    source: &mut ByteSource,
    buffer: &mut StanzaBuffer,
    machine: &mut InitiatingMachine,
    cfg: &GatewayConfig,
    ctx: &Arc<SessionContext>,
    connector: &TlsConnector,
    kill: &KillSwitch,
) -> FedResult<HandlerAction> {
    for effect in effects {
        match effect {
            Effect::Send(data) => {
                write_raw(source, kill, data.as_bytes()).await?;
            }
            Effect::SendToReceiving { pair, data } => match ctx.receiving_for(&pair) {
                Some(handle) => {
                    if handle.writer.send(data).await.is_err() {
                        warn!(%pair, "receiving connection gone, dropping verdict");
                        ctx.remove_receiving(&pair);
                    }
                }
                None => warn!(%pair, "no receiving connection for verdict"),
            },
            Effect::UpgradeTls => {
                let name = tls::server_name(&cfg.connect_host)?;
                source.upgrade_client(connector, name).await?;
                buffer.reset();
                machine.tls_established();
                info!("outbound stream upgraded to TLS, reopening");
                write_raw(
                    source,
                    kill,
                    wire::stream_open(&cfg.local_domain, &cfg.remote_domain, None).as_bytes(),
                )
                .await?;
            }
            Effect::RegisterDialback { pair, key } => {
                ctx.register_dialback(&pair, &key);
                if let Some(id) = machine.session_id() {
                    ctx.remember_session_id(&pair, id);
                }
            }
            Effect::MarkVerified(domain) => {
                info!(%domain, "domain verified");
                ctx.mark_verified(&domain);
            }
            Effect::StartPing => {
                ctx.arm_ping(cfg.ping_miss_threshold);
                let ping_kill = kill.clone();
                let ping_ctx = Arc::clone(ctx);
                let local = cfg.local_domain.clone();
                let remote = cfg.remote_domain.clone();
                let interval = cfg.ping_interval;
                tokio::spawn(async move {
                    ping::run_ping(ping_ctx, ping_kill, local, remote, interval).await;
                });
            }
            Effect::FlushQueue => {
                for packet in ctx.drain_queue() {
                    debug!(to = %packet.to_domain, "flushing queued packet");
                    write_raw(source, kill, packet.raw.as_bytes()).await?;
                }
            }
            Effect::Close => {
                let _ = source.write_all(wire::stream_close().as_bytes()).await;
                source.shutdown().await;
                return Ok(HandlerAction::CloseStream);
            }
            Effect::Fail(reason) => {
                return Err(FedError::DialbackFailed(reason));
            }
            other => {
                debug!(?other, "effect not applicable on outbound stream");
            }
        }
    }
    Ok(HandlerAction::Continue)
}
