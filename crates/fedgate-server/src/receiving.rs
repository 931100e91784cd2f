//! Inbound (receiving) connections accepted on the federation port.
//!
//! A receiving stream plays one of two roles, decided by whether a key
//! offer for the pair is outstanding: the peer calling back as the
//! authoritative server to verify our key, or the peer opening its own
//! stream toward us, which we verify by relaying its key offer out over
//! the initiating connection. Once authenticated the stream carries
//! stanzas into the local side.

use crate::config::GatewayConfig;
use crate::connection::{
    event_from_frame, read_chunk, write_raw, ByteSource, Effect, HandlerAction, KillSwitch,
    StreamEvent,
};
use crate::context::{InitiatingControl, ReceivingControl, ReceivingHandle, SessionContext};
use crate::processor::{MucPresenceNotifier, PacketProcessor};
use fedgate_core::xml::StanzaBuffer;
use fedgate_core::{
    domain_of, domain_pair, generate_stream_id, wire, FedError, FedResult, Stanza,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// States of an inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivingState {
    AwaitStreamOpen,
    /// Peer is calling back as authoritative server for our key offer.
    AwaitVerify,
    AwaitTlsStart,
    AwaitResultKey,
    /// Verify answered; the peer owes us a closing tag.
    AwaitCloseStream,
    Authenticated,
    Failed,
}

/// Transition logic for one inbound stream. Reads shared state (issued
/// keys, callback expectations) but only ever emits effects.
pub struct ReceivingMachine {
    state: ReceivingState,
    tls_policy: bool,
    tls_enabled: bool,
    local: String,
    remote: String,
    stream_id: String,
}

impl ReceivingMachine {
    pub fn new(cfg_local: &str, tls_policy: bool) -> Self {
        Self {
            state: ReceivingState::AwaitStreamOpen,
            tls_policy,
            tls_enabled: false,
            local: cfg_local.to_string(),
            remote: String::new(),
            stream_id: String::new(),
        }
    }

    pub fn state(&self) -> ReceivingState {
        self.state
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn pair(&self) -> String {
        domain_pair(&self.local, &self.remote)
    }

    pub fn tls_established(&mut self) {
        self.tls_enabled = true;
        self.state = ReceivingState::AwaitStreamOpen;
    }

    pub fn handle(&mut self, event: &StreamEvent, ctx: &SessionContext) -> Vec<Effect> {
        match (self.state, event) {
            (ReceivingState::AwaitStreamOpen, StreamEvent::Open(header)) => {
                let Some(from) = &header.from else {
                    self.state = ReceivingState::Failed;
                    return vec![Effect::Fail("inbound stream open without from".into())];
                };
                self.remote = domain_of(from).to_string();
                if let Some(to) = &header.to {
                    self.local = domain_of(to).to_string();
                }
                let pair = self.pair();

                // Reuse the id agreed for this pair so key checks line up
                // across stream restarts.
                self.stream_id = ctx
                    .session_id_for(&pair)
                    .unwrap_or_else(generate_stream_id);

                let open = wire::stream_open(&self.local, &self.remote, Some(&self.stream_id));
                let mut effects = vec![Effect::RegisterConnection { pair: pair.clone() }];

                if ctx.take_expectation(&pair) {
                    // The callback leg for our own key offer carries only
                    // db:verify traffic.
                    self.state = ReceivingState::AwaitVerify;
                    effects.push(Effect::Send(open));
                } else if self.tls_policy && !self.tls_enabled {
                    self.state = ReceivingState::AwaitTlsStart;
                    effects.push(Effect::Send(format!(
                        "{open}{}",
                        wire::stream_features(true, true)
                    )));
                } else {
                    self.state = ReceivingState::AwaitResultKey;
                    effects.push(Effect::Send(format!(
                        "{open}{}",
                        wire::stream_features(false, false)
                    )));
                }
                effects
            }

            (ReceivingState::AwaitVerify, StreamEvent::Element(e))
                if e.local_name() == "verify" =>
            {
                let remote = e.attr("from").unwrap_or(&self.remote).to_string();
                let local = e.attr("to").unwrap_or(&self.local).to_string();
                let id = e.attr("id").unwrap_or(&self.stream_id).to_string();
                let pair = domain_pair(&local, &remote);
                let valid = ctx
                    .key_for(&pair)
                    .is_some_and(|expected| expected == e.text);

                self.state = ReceivingState::AwaitCloseStream;
                let answer = wire::dialback_verify_answer(&local, &remote, &id, valid, &e.text);
                let mut effects = vec![Effect::Send(answer)];
                if valid {
                    effects.push(Effect::MarkVerified(remote));
                } else {
                    warn!(%pair, "verify key mismatch");
                }
                effects
            }

            (ReceivingState::AwaitTlsStart, StreamEvent::Element(e))
                if e.local_name() == "starttls" =>
            {
                vec![Effect::Send(wire::proceed()), Effect::UpgradeTls]
            }
            // Peer skipped the TLS offer and went straight to dialback.
            (
                ReceivingState::AwaitTlsStart | ReceivingState::AwaitResultKey,
                StreamEvent::Element(e),
            ) if e.local_name() == "result" && e.attr("type").is_none() => {
                self.handle_result_key(e, false, ctx)
            }

            (ReceivingState::Authenticated, StreamEvent::Element(e))
                if e.local_name() == "result" && e.attr("type").is_none() =>
            {
                // A key offer for another domain, multiplexed on an already
                // authenticated stream.
                self.handle_result_key(e, true, ctx)
            }

            (ReceivingState::Authenticated, StreamEvent::Element(e)) => {
                let stanza = match Stanza::decode(e.clone()) {
                    Ok(s) => s,
                    Err(err) => {
                        self.state = ReceivingState::Failed;
                        return vec![Effect::Fail(err.to_string())];
                    }
                };

                let from_domain = stanza
                    .from()
                    .map(domain_of)
                    .unwrap_or(&self.remote)
                    .to_string();
                if !ctx.is_verified(&from_domain) {
                    self.state = ReceivingState::Failed;
                    return vec![Effect::Fail(format!(
                        "stanza from unverified domain {from_domain}"
                    ))];
                }

                // Only replies to pings this gateway actually sent are
                // consumed; every other iq result belongs to a local user.
                if let Some(id) = stanza.iq_result_id() {
                    let to_local = stanza.to().map(domain_of) == Some(self.local.as_str());
                    if to_local && ctx.ping_outstanding(id) {
                        return vec![Effect::Pong(id.to_string())];
                    }
                }

                let is_muc_presence = stanza.kind == fedgate_core::stanza::StanzaKind::Presence
                    && (stanza.from().unwrap_or("").contains("conference")
                        || stanza.to().unwrap_or("").contains("conference"));
                if is_muc_presence {
                    let joining = stanza.stanza_type() != Some("unavailable");
                    return vec![Effect::MucPresence { stanza, joining }];
                }

                vec![Effect::Deliver(stanza)]
            }

            (ReceivingState::AwaitCloseStream, StreamEvent::Close) => {
                vec![Effect::Send(wire::stream_close()), Effect::Close]
            }

            (_, StreamEvent::Close) => {
                vec![Effect::Close]
            }

            // A stanza before authentication is an injection attempt, not
            // negotiation noise.
            (state, StreamEvent::Element(e))
                if matches!(e.local_name(), "message" | "presence" | "iq") =>
            {
                self.state = ReceivingState::Failed;
                vec![Effect::Fail(format!(
                    "stanza received before authentication in {state:?}"
                ))]
            }

            (state, event) => {
                debug!(?state, ?event, "ignoring event on inbound stream");
                vec![]
            }
        }
    }

    fn handle_result_key(
        &mut self,
        e: &fedgate_core::Element,
        multiplexed: bool,
        ctx: &SessionContext,
    ) -> Vec<Effect> {
        let remote = e.attr("from").unwrap_or(&self.remote).to_string();
        let local = e.attr("to").unwrap_or(&self.local).to_string();
        let key = e.text.clone();
        self.state = ReceivingState::Authenticated;

        if multiplexed || !ctx.initiating_connected() {
            // No outbound stream to relay over; dial the authoritative
            // server directly. The verdict comes back over this stream.
            vec![Effect::SpawnAuthorizing {
                origin_pair: self.pair(),
                local,
                remote,
                stream_id: self.stream_id.clone(),
                key,
            }]
        } else {
            vec![Effect::RelayVerify {
                local,
                remote,
                stream_id: self.stream_id.clone(),
                key,
            }]
        }
    }
}

/// Hand an authenticated stanza to the processor, identified by its own
/// `from` JID (falling back to the stream's domain when absent).
fn deliver_stanza(processor: &dyn PacketProcessor, stream_remote: &str, stanza: &Stanza) {
    let from = stanza.from().unwrap_or(stream_remote);
    processor.process(from, stanza);
}

/// Rewrite the domain of a JID, keeping node and resource.
pub fn rewrite_jid_domain(jid: &str, new_domain: &str) -> String {
    let (node, rest) = match jid.split_once('@') {
        Some((node, rest)) => (Some(node), rest),
        None => (None, jid),
    };
    let resource = rest.split_once('/').map(|(_, r)| r);
    let mut out = String::new();
    if let Some(node) = node {
        out.push_str(node);
        out.push('@');
    }
    out.push_str(new_domain);
    if let Some(resource) = resource {
        out.push('/');
        out.push_str(resource);
    }
    out
}

enum Step {
    Wrote(String),
    Ctrl(ReceivingControl),
    Read(usize),
    Shutdown,
}

/// Run one accepted inbound connection to completion.
#[allow(clippy::too_many_arguments)]
pub async fn run_receiving(
    cfg: Arc<GatewayConfig>,
    ctx: Arc<SessionContext>,
    acceptor: Option<TlsAcceptor>,
    processor: Arc<dyn PacketProcessor>,
    notifier: Arc<dyn MucPresenceNotifier>,
    tcp: TcpStream,
    mut shutdown: broadcast::Receiver<()>,
) -> FedResult<()> {
    let mut source = ByteSource::Plain(tcp);
    let kill = KillSwitch::new();
    let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
    let (control_tx, mut control_rx) = mpsc::channel::<ReceivingControl>(4);

    let mut machine = ReceivingMachine::new(&cfg.local_domain, cfg.tls_required);
    let mut buffer = StanzaBuffer::new();
    let mut read_buf = vec![0u8; 8192];
    let mut registered_pair: Option<String> = None;

    let result = async {
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
                Step::Shutdown | Step::Ctrl(ReceivingControl::Stop) => {
                    let _ = source.write_all(wire::stream_close().as_bytes()).await;
                    source.shutdown().await;
                    return Ok(());
                }
                Step::Wrote(data) => {
                    write_raw(&mut source, &kill, data.as_bytes()).await?;
                }
                Step::Read(0) => {
                    debug!(state = ?machine.state(), "inbound connection closed by peer");
                    return Ok(());
                }
                Step::Read(n) => {
                    buffer.feed(&read_buf[..n]);
                    while let Some(frame) = buffer.next_frame()? {
                        let event = event_from_frame(frame)?;
                        let effects = machine.handle(&event, &ctx);
                        let action = apply_effects(
                            effects,
                            &mut source,
                            &mut buffer,
                            &mut machine,
                            &cfg,
                            &ctx,
                            acceptor.as_ref(),
                            &processor,
                            &notifier,
                            &kill,
                            &write_tx,
                            &control_tx,
                            &mut registered_pair,
                        )
                        .await?;
                        if action == HandlerAction::CloseStream {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    .await;

    kill.set();
    if let Some(pair) = registered_pair {
        ctx.remove_receiving(&pair);
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn apply_effects(
    effects: Vec<Effect>,
    source: &mut ByteSource,
    buffer: &mut StanzaBuffer,
    machine: &mut ReceivingMachine,
    cfg: &GatewayConfig,
    ctx: &Arc<SessionContext>,
    acceptor: Option<&TlsAcceptor>,
    processor: &Arc<dyn PacketProcessor>,
    notifier: &Arc<dyn MucPresenceNotifier>,
    kill: &KillSwitch,
    write_tx: &mpsc::Sender<String>,
    control_tx: &mpsc::Sender<ReceivingControl>,
    registered_pair: &mut Option<String>,
) -> FedResult<HandlerAction> {
    for effect in effects {
        match effect {
            Effect::Send(data) => {
                write_raw(source, kill, data.as_bytes()).await?;
            }
            Effect::RegisterConnection { pair } => {
                info!(%pair, tls = source.is_tls(), "inbound stream registered");
                ctx.register_receiving(
                    &pair,
                    ReceivingHandle {
                        writer: write_tx.clone(),
                        control: control_tx.clone(),
                    },
                );
                ctx.remember_session_id(&pair, &machine.stream_id);
                *registered_pair = Some(pair);
            }
            Effect::UpgradeTls => {
                let Some(acceptor) = acceptor else {
                    let _ = source.write_all(wire::tls_failure().as_bytes()).await;
                    return Err(FedError::Tls(
                        "no server certificate configured for starttls".into(),
                    ));
                };
                source.upgrade_server(acceptor).await?;
                buffer.reset();
                machine.tls_established();
                info!("inbound stream upgraded to TLS");
            }
            Effect::MarkVerified(domain) => {
                info!(%domain, "domain verified via callback");
                ctx.mark_verified(&domain);
            }
            Effect::RelayVerify {
                local,
                remote,
                stream_id,
                key,
            } => match ctx.initiating_control() {
                Some(control) => {
                    control
                        .send(InitiatingControl::RelayVerify {
                            local,
                            remote,
                            stream_id,
                            key,
                        })
                        .await
                        .map_err(|_| FedError::Channel("initiating connection gone".into()))?;
                }
                None => {
                    return Err(FedError::Channel(
                        "no outbound connection to relay verify over".into(),
                    ))
                }
            },
            Effect::SpawnAuthorizing {
                origin_pair,
                local,
                remote,
                stream_id,
                key,
            } => {
                let cfg = cfg.clone();
                let ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    if let Err(e) = crate::authorizing::run_authorizing(
                        cfg,
                        ctx,
                        origin_pair,
                        local,
                        remote,
                        stream_id,
                        key,
                    )
                    .await
                    {
                        warn!(error = %e, "authorizing connection failed");
                    }
                });
            }
            Effect::Pong(id) => {
                let mut tracker = ctx.ping.lock().unwrap_or_else(|e| e.into_inner());
                if !tracker.record_pong(&id) {
                    debug!(%id, "pong with unknown id");
                }
            }
            Effect::Deliver(stanza) => {
                deliver_stanza(processor.as_ref(), machine.remote(), &stanza);
            }
            Effect::MucPresence { stanza, joining } => {
                let from = stanza.from().unwrap_or("").to_string();
                let occupant = if cfg.rewrite_domain {
                    rewrite_jid_domain(&from, &format!("conference.{}", cfg.local_domain))
                } else {
                    from.clone()
                };
                let room = match occupant.split_once('/') {
                    Some((bare, _)) => bare.to_string(),
                    None => occupant.clone(),
                };
                if joining {
                    notifier.advertise_occupant(&room, &occupant);
                } else {
                    notifier.remove_occupant(&room, &occupant);
                }
            }
            Effect::Close => {
                source.shutdown().await;
                return Ok(HandlerAction::CloseStream);
            }
            Effect::Fail(reason) => {
                let _ = source.write_all(wire::stream_close().as_bytes()).await;
                source.shutdown().await;
                return Err(FedError::Protocol(reason));
            }
            other => {
                debug!(?other, "effect not applicable on inbound stream");
            }
        }
    }
    Ok(HandlerAction::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedgate_core::xml::StreamHeader;
    use fedgate_core::{dialback_key, parse_element};

    fn open_event(from: &str, to: &str) -> StreamEvent {
        StreamEvent::Open(StreamHeader {
            from: Some(from.into()),
            to: Some(to.into()),
            id: None,
            version: Some("1.0".into()),
        })
    }

    fn element(raw: &str) -> StreamEvent {
        StreamEvent::Element(parse_element(raw).unwrap())
    }

    #[test]
    fn authoritative_callback_verifies_matching_key() {
        let ctx = SessionContext::new();
        let key = dialback_key("proxy", "openfire", "s1");
        ctx.register_dialback("proxy==openfire", &key);
        ctx.remember_session_id("proxy==openfire", "s1");

        let mut m = ReceivingMachine::new("proxy", false);
        let effects = m.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitVerify);
        assert_eq!(
            effects[0],
            Effect::RegisterConnection {
                pair: "proxy==openfire".into()
            }
        );
        // The callback reply is a bare stream open, no features.
        assert!(matches!(
            effects[1],
            Effect::Send(ref s) if s.starts_with("<stream:stream") && !s.contains("features")
        ));

        let verify = format!("<db:verify from='openfire' to='proxy' id='s1'>{key}</db:verify>");
        let effects = m.handle(&element(&verify), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitCloseStream);
        assert!(matches!(
            effects[0],
            Effect::Send(ref s) if s.contains("type='valid'") && s.contains("id='s1'")
        ));
        assert_eq!(effects[1], Effect::MarkVerified("openfire".into()));

        let effects = m.handle(&StreamEvent::Close, &ctx);
        assert_eq!(effects[0], Effect::Send(wire::stream_close()));
        assert_eq!(effects[1], Effect::Close);
    }

    #[test]
    fn wrong_key_answers_invalid_and_does_not_verify() {
        let ctx = SessionContext::new();
        ctx.register_dialback("proxy==openfire", "rightkey");
        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), &ctx);

        let effects = m.handle(
            &element("<db:verify from='openfire' to='proxy' id='s1'>wrongkey</db:verify>"),
            &ctx,
        );
        assert_eq!(effects.len(), 1);
        assert!(matches!(
            effects[0],
            Effect::Send(ref s) if s.contains("type='invalid'")
        ));
    }

    #[test]
    fn inbound_offer_relays_over_outbound_connection() {
        let ctx = SessionContext::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let (ctl, _ctl_rx) = tokio::sync::mpsc::channel(1);
        ctx.set_initiating(tx, ctl);

        let mut m = ReceivingMachine::new("proxy", false);
        let effects = m.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitResultKey);
        // No pending offer, so the reply advertises dialback features.
        assert!(matches!(
            effects[1],
            Effect::Send(ref s) if s.contains("urn:xmpp:features:dialback")
        ));

        let effects = m.handle(
            &element("<db:result from='openfire' to='proxy'>THEIRKEY</db:result>"),
            &ctx,
        );
        assert_eq!(m.state(), ReceivingState::Authenticated);
        assert!(matches!(
            effects[0],
            Effect::RelayVerify { ref key, .. } if key == "THEIRKEY"
        ));
    }

    #[test]
    fn offer_without_outbound_connection_spawns_authorizing() {
        let ctx = SessionContext::new();
        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), &ctx);
        let effects = m.handle(
            &element("<db:result from='openfire' to='proxy'>K</db:result>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::SpawnAuthorizing { .. }));
    }

    #[test]
    fn multiplexed_offer_spawns_authorizing() {
        let ctx = SessionContext::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let (ctl, _ctl_rx) = tokio::sync::mpsc::channel(1);
        ctx.set_initiating(tx, ctl);
        ctx.mark_verified("openfire");

        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), &ctx);
        m.handle(
            &element("<db:result from='openfire' to='proxy'>K1</db:result>"),
            &ctx,
        );
        let effects = m.handle(
            &element("<db:result from='conference.openfire' to='proxy'>K2</db:result>"),
            &ctx,
        );
        // The verdict must come back over the stream the offer arrived
        // on, which is registered under the primary pair.
        assert!(matches!(
            effects[0],
            Effect::SpawnAuthorizing { ref origin_pair, ref remote, .. }
                if origin_pair == "proxy==openfire" && remote == "conference.openfire"
        ));
    }

    #[test]
    fn stanza_from_unverified_domain_fails_the_stream() {
        let ctx = SessionContext::new();
        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), &ctx);
        m.handle(
            &element("<db:result from='openfire' to='proxy'>K</db:result>"),
            &ctx,
        );
        assert_eq!(m.state(), ReceivingState::Authenticated);

        let effects = m.handle(
            &element("<message from='u@openfire' to='v@proxy'><body>hi</body></message>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::Fail(_)));
        assert_eq!(m.state(), ReceivingState::Failed);
    }

    fn authenticated_machine(ctx: &SessionContext) -> ReceivingMachine {
        ctx.mark_verified("openfire");
        ctx.mark_verified("conference.openfire");
        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), ctx);
        m.handle(
            &element("<db:result from='openfire' to='proxy'>K</db:result>"),
            ctx,
        );
        m
    }

    #[test]
    fn verified_stanzas_are_delivered() {
        let ctx = SessionContext::new();
        let mut m = authenticated_machine(&ctx);

        let effects = m.handle(
            &element("<message from='u@openfire' to='v@proxy'><body>hi</body></message>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::Deliver(_)));
    }

    #[test]
    fn pong_is_routed_by_id() {
        let ctx = SessionContext::new();
        let mut m = authenticated_machine(&ctx);
        ctx.ping.lock().unwrap().begin_round("p42");

        let effects = m.handle(
            &element("<iq type='result' from='openfire' to='proxy' id='p42'/>"),
            &ctx,
        );
        assert_eq!(effects, vec![Effect::Pong("p42".into())]);
    }

    #[test]
    fn iq_result_for_other_destination_is_delivered_not_ponged() {
        let ctx = SessionContext::new();
        let mut m = authenticated_machine(&ctx);
        ctx.ping.lock().unwrap().begin_round("q1");

        let effects = m.handle(
            &element("<iq type='result' from='u@openfire' to='v@proxy' id='q1'/>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::Deliver(_)));
    }

    #[test]
    fn iq_result_with_unmatched_id_is_delivered() {
        let ctx = SessionContext::new();
        let mut m = authenticated_machine(&ctx);

        // Addressed to the gateway domain but no ping with this id is
        // outstanding, so it is an ordinary result for a local user.
        let effects = m.handle(
            &element("<iq type='result' from='openfire' to='proxy' id='reg77'/>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::Deliver(_)));
    }

    #[test]
    fn stanza_before_authentication_fails_the_stream() {
        let ctx = SessionContext::new();
        let mut m = ReceivingMachine::new("proxy", false);
        m.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitResultKey);

        let effects = m.handle(
            &element("<message from='u@openfire' to='v@proxy'><body>early</body></message>"),
            &ctx,
        );
        assert!(matches!(effects[0], Effect::Fail(_)));
        assert_eq!(m.state(), ReceivingState::Failed);
    }

    #[test]
    fn stanzas_are_identified_by_their_own_sender_jid() {
        use std::sync::Mutex;

        struct RecordingProcessor(Mutex<Vec<String>>);
        impl PacketProcessor for RecordingProcessor {
            fn process(&self, from: &str, _stanza: &Stanza) {
                self.0.lock().unwrap().push(from.to_string());
            }
        }

        let recorder = RecordingProcessor(Mutex::new(Vec::new()));
        let full = Stanza::decode(
            parse_element("<message from='u@openfire/res' to='v@proxy'><body>hi</body></message>")
                .unwrap(),
        )
        .unwrap();
        deliver_stanza(&recorder, "openfire", &full);

        // No from attribute falls back to the stream's remote domain.
        let bare =
            Stanza::decode(parse_element("<message to='v@proxy'><body>hi</body></message>").unwrap())
                .unwrap();
        deliver_stanza(&recorder, "openfire", &bare);

        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["u@openfire/res".to_string(), "openfire".to_string()]
        );
    }

    #[test]
    fn muc_presence_join_and_leave() {
        let ctx = SessionContext::new();
        let mut m = authenticated_machine(&ctx);

        let effects = m.handle(
            &element("<presence from='room@conference.openfire/alice' to='u@proxy'/>"),
            &ctx,
        );
        assert!(matches!(
            effects[0],
            Effect::MucPresence { joining: true, .. }
        ));

        let effects = m.handle(
            &element(
                "<presence from='room@conference.openfire/alice' to='u@proxy' \
                 type='unavailable'/>",
            ),
            &ctx,
        );
        assert!(matches!(
            effects[0],
            Effect::MucPresence { joining: false, .. }
        ));
    }

    #[test]
    fn expectation_is_consumed_by_first_stream_only() {
        let ctx = SessionContext::new();
        ctx.register_dialback("proxy==openfire", "K");

        let mut first = ReceivingMachine::new("proxy", false);
        first.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(first.state(), ReceivingState::AwaitVerify);

        let mut second = ReceivingMachine::new("proxy", false);
        second.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(second.state(), ReceivingState::AwaitResultKey);
    }

    #[test]
    fn starttls_negotiation_then_dialback() {
        let ctx = SessionContext::new();
        let mut m = ReceivingMachine::new("proxy", true);
        let effects = m.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitTlsStart);
        assert!(matches!(
            effects[1],
            Effect::Send(ref s) if s.contains("starttls") && s.contains("<required/>")
        ));

        let effects = m.handle(
            &element("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"),
            &ctx,
        );
        assert_eq!(effects[0], Effect::Send(wire::proceed()));
        assert_eq!(effects[1], Effect::UpgradeTls);

        m.tls_established();
        let effects = m.handle(&open_event("openfire", "proxy"), &ctx);
        assert_eq!(m.state(), ReceivingState::AwaitResultKey);
        // After the upgrade the features no longer offer starttls.
        assert!(matches!(
            effects[1],
            Effect::Send(ref s) if !s.contains("starttls")
        ));
    }

    #[test]
    fn session_id_is_reused_across_restarts() {
        let ctx = SessionContext::new();
        ctx.remember_session_id("proxy==openfire", "fixed77");
        let mut m = ReceivingMachine::new("proxy", false);
        let effects = m.handle(&open_event("openfire", "proxy"), &ctx);
        assert!(matches!(
            effects[1],
            Effect::Send(ref s) if s.contains("id='fixed77'")
        ));
    }

    #[test]
    fn jid_domain_rewrite() {
        assert_eq!(
            rewrite_jid_domain("room@conference.openfire/alice", "conference.proxy"),
            "room@conference.proxy/alice"
        );
        assert_eq!(
            rewrite_jid_domain("openfire", "proxy"),
            "proxy"
        );
        assert_eq!(
            rewrite_jid_domain("user@openfire", "proxy"),
            "user@proxy"
        );
    }
}
