//! The federation session: listener, outbound supervisor, and the
//! outbound packet entry point.
//!
//! One session owns the shared context, accepts inbound connections on
//! the federation port, and keeps the outbound connection alive within a
//! fixed reconnect budget. The budget never replenishes; when it runs out
//! the session shuts down and reports whatever is still queued.

use crate::config::GatewayConfig;
use crate::context::{InitiatingControl, QueuedPacket, ReceivingControl, SessionContext};
use crate::initiating;
use crate::processor::{MucPresenceNotifier, PacketProcessor};
use crate::receiving;
use fedgate_core::{domain_of, domain_pair, parse_element, FedError, FedResult, Stanza};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// One gateway session between the local and remote domains.
pub struct DialbackSession {
    cfg: Arc<GatewayConfig>,
    ctx: Arc<SessionContext>,
    processor: Arc<dyn PacketProcessor>,
    notifier: Arc<dyn MucPresenceNotifier>,
    shutdown_tx: broadcast::Sender<()>,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
}

impl DialbackSession {
    pub fn new(
        cfg: GatewayConfig,
        acceptor: Option<TlsAcceptor>,
        connector: TlsConnector,
        processor: Arc<dyn PacketProcessor>,
        notifier: Arc<dyn MucPresenceNotifier>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let mut ctx = SessionContext::new();
        *ctx.ping.get_mut().unwrap_or_else(|e| e.into_inner()) =
            crate::ping::PingTracker::new(cfg.ping_miss_threshold);
        Self {
            cfg: Arc::new(cfg),
            ctx: Arc::new(ctx),
            processor,
            notifier,
            shutdown_tx,
            acceptor,
            connector,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Run the session until the reconnect budget is exhausted or a clean
    /// shutdown is requested through the broadcast channel.
    pub async fn run(self: Arc<Self>) -> FedResult<()> {
        let listener =
            TcpListener::bind((self.cfg.bind_addr.as_str(), self.cfg.port)).await?;
        info!(
            addr = %self.cfg.bind_addr,
            port = self.cfg.port,
            local = %self.cfg.local_domain,
            remote = %self.cfg.remote_domain,
            "federation listener up"
        );

        let accept_session = Arc::clone(&self);
        let mut accept_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((tcp, peer)) => {
                            debug!(%peer, "inbound connection accepted");
                            let session = Arc::clone(&accept_session);
                            let shutdown = session.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                let result = receiving::run_receiving(
                                    Arc::clone(&session.cfg),
                                    Arc::clone(&session.ctx),
                                    session.acceptor.clone(),
                                    Arc::clone(&session.processor),
                                    Arc::clone(&session.notifier),
                                    tcp,
                                    shutdown,
                                )
                                .await;
                                if let Err(e) = result {
                                    warn!(error = %e, "inbound connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            // Transient accept errors (fd pressure, resets)
                            // must not take the listener down.
                            warn!(error = %e, "accept failed");
                        }
                    },
                }
            }
        });

        supervise(
            self.cfg.reconnect_attempts,
            self.cfg.reconnect_delay,
            |attempt| {
                let session = Arc::clone(&self);
                async move {
                    if attempt > 1 {
                        info!(attempt, "reconnecting outbound stream");
                    }
                    let shutdown = session.shutdown_tx.subscribe();
                    let result = initiating::run_initiating(
                        &session.cfg,
                        Arc::clone(&session.ctx),
                        session.connector.clone(),
                        shutdown,
                    )
                    .await;
                    if result.is_err() {
                        session.on_outbound_lost().await;
                    }
                    result
                }
            },
            tokio::time::sleep,
        )
        .await;

        let _ = self.shutdown_tx.send(());
        let leftover = self.ctx.queue_len();
        if leftover > 0 {
            warn!(leftover, "undelivered packets remain after shutdown");
        }
        Ok(())
    }

    /// Submit an outbound stanza. Sends immediately when the destination
    /// domain is verified; otherwise queues it and starts dialback for the
    /// pair unless one is already in flight.
    pub async fn send_packet(&self, raw: &str) -> FedResult<()> {
        let stanza = Stanza::decode(parse_element(raw)?)?;
        let to = stanza
            .to()
            .ok_or_else(|| FedError::Protocol("outbound stanza without to".into()))?;
        let to_domain = domain_of(to).to_string();

        if self.ctx.is_verified(&to_domain) && self.ctx.initiating_connected() {
            if let Some(writer) = self.ctx.initiating_writer() {
                // Anything still queued from before verification goes out
                // ahead of this packet, keeping submission order.
                self.flush_through(&writer).await?;
                writer
                    .send(raw.to_string())
                    .await
                    .map_err(|_| FedError::Channel("outbound connection gone".into()))?;
                return Ok(());
            }
        }

        debug!(%to_domain, "queueing packet until domain verifies");
        self.ctx.enqueue(QueuedPacket {
            to_domain: to_domain.clone(),
            raw: raw.to_string(),
        });

        // The domain may have verified between the check above and the
        // enqueue. The verification flush could then already have drained
        // the queue, so re-check and drain rather than leave the packet
        // stranded.
        if self.ctx.is_verified(&to_domain) && self.ctx.initiating_connected() {
            if let Some(writer) = self.ctx.initiating_writer() {
                self.flush_through(&writer).await?;
                return Ok(());
            }
        }

        let from = local_counterpart(&to_domain, &self.cfg.local_domain, &self.cfg.remote_domain);
        let pair = domain_pair(&from, &to_domain);
        if !self.ctx.dialback_in_flight(&pair) {
            if let Some(control) = self.ctx.initiating_control() {
                let _ = control
                    .send(InitiatingControl::InitiateDialback {
                        from,
                        to: to_domain,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Send every queued packet through the given outbound writer, in
    /// arrival order.
    async fn flush_through(&self, writer: &tokio::sync::mpsc::Sender<String>) -> FedResult<()> {
        for queued in self.ctx.drain_queue() {
            writer
                .send(queued.raw)
                .await
                .map_err(|_| FedError::Channel("outbound connection gone".into()))?;
        }
        Ok(())
    }

    /// Request a clean shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The outbound stream died: every domain verified through it loses
    /// its trust, pending dialbacks are forgotten, and inbound streams are
    /// torn down before the next attempt.
    async fn on_outbound_lost(&self) {
        self.ctx.reset_trust();
        for handle in self.ctx.stop_all_receiving() {
            let _ = handle.control.send(ReceivingControl::Stop).await;
        }
    }
}

/// The local-side domain to dial from when reaching `to_domain`: the
/// configured local domain, with subdomain prefixes of the remote mapped
/// onto the local side (`conference.remote` dials from `conference.local`).
pub fn local_counterpart(to_domain: &str, local: &str, remote: &str) -> String {
    if to_domain == remote {
        return local.to_string();
    }
    if let Some(prefix) = to_domain.strip_suffix(remote) {
        if let Some(prefix) = prefix.strip_suffix('.') {
            return format!("{prefix}.{local}");
        }
    }
    local.to_string()
}

/// Linear backoff: attempt n waits n times the base delay.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base * attempt
}

/// Drive the outbound connection within a fixed attempt budget.
///
/// `connect` returning `Ok` means a clean shutdown and ends supervision;
/// an error consumes one attempt. The budget bounds total attempts for
/// the life of the session.
async fn supervise<C, FC, S, FS>(budget: u32, base: Duration, mut connect: C, mut sleep_fn: S)
where
    C: FnMut(u32) -> FC,
    FC: Future<Output = FedResult<()>>,
    S: FnMut(Duration) -> FS,
    FS: Future<Output = ()>,
{
    for attempt in 1..=budget {
        match connect(attempt).await {
            Ok(()) => return,
            Err(e) => {
                warn!(attempt, budget, error = %e, "outbound connection failed");
            }
        }
        if attempt == budget {
            warn!(budget, "reconnect budget exhausted");
            return;
        }
        sleep_fn(backoff_delay(attempt, base)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[test]
    fn counterpart_for_remote_and_subdomains() {
        assert_eq!(local_counterpart("openfire", "proxy", "openfire"), "proxy");
        assert_eq!(
            local_counterpart("conference.openfire", "proxy", "openfire"),
            "conference.proxy"
        );
        // Unrelated domains dial from the plain local domain.
        assert_eq!(local_counterpart("elsewhere", "proxy", "openfire"), "proxy");
        // No accidental suffix match without the dot.
        assert_eq!(local_counterpart("notopenfire", "proxy", "openfire"), "proxy");
    }

    #[test]
    fn backoff_grows_linearly() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(1, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, base), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_makes_exactly_budget_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let sleeps: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));

        let a = Arc::clone(&attempts);
        let s = Arc::clone(&sleeps);
        supervise(
            3,
            Duration::from_secs(1),
            move |_| {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(FedError::Protocol("refused".into()))
                }
            },
            move |d| {
                s.lock().unwrap().push(d);
                async {}
            },
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // One fewer sleep than attempts, strictly increasing.
        let sleeps = sleeps.lock().unwrap();
        assert_eq!(
            *sleeps,
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_after_clean_shutdown() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        supervise(
            5,
            Duration::from_secs(1),
            move |attempt| {
                let a = Arc::clone(&a);
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(FedError::Protocol("refused".into()))
                    } else {
                        Ok(())
                    }
                }
            },
            |d| tokio::time::sleep(d),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_packet_queues_for_unverified_domain() {
        crate::tls::init_crypto();
        let cfg = GatewayConfig::load(None, crate::config::CliOverrides::default()).unwrap();
        let connector = crate::tls::build_connector(true).unwrap();
        let session = DialbackSession::new(
            cfg,
            None,
            connector,
            Arc::new(crate::processor::LoggingProcessor),
            Arc::new(crate::processor::LoggingNotifier),
        );

        session
            .send_packet("<message from='u@proxy' to='v@openfire'><body>hi</body></message>")
            .await
            .unwrap();
        assert_eq!(session.context().queue_len(), 1);

        let drained = session.context().drain_queue();
        assert_eq!(drained[0].to_domain, "openfire");
    }

    #[tokio::test]
    async fn send_packet_flushes_backlog_before_direct_write() {
        crate::tls::init_crypto();
        let cfg = GatewayConfig::load(None, crate::config::CliOverrides::default()).unwrap();
        let connector = crate::tls::build_connector(true).unwrap();
        let session = DialbackSession::new(
            cfg,
            None,
            connector,
            Arc::new(crate::processor::LoggingProcessor),
            Arc::new(crate::processor::LoggingNotifier),
        );

        // A packet left over from before the domain verified.
        let stranded = "<message from='a@proxy' to='b@openfire'><body>first</body></message>";
        session.context().enqueue(QueuedPacket {
            to_domain: "openfire".to_string(),
            raw: stranded.to_string(),
        });
        session.context().mark_verified("openfire");

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let (ctl_tx, _ctl_rx) = tokio::sync::mpsc::channel(8);
        session.context().set_initiating(tx, ctl_tx);

        let fresh = "<message from='a@proxy' to='b@openfire'><body>second</body></message>";
        session.send_packet(fresh).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), stranded);
        assert_eq!(rx.recv().await.unwrap(), fresh);
        assert_eq!(session.context().queue_len(), 0);
    }

    #[tokio::test]
    async fn outbound_loss_clears_all_trust() {
        crate::tls::init_crypto();
        let cfg = GatewayConfig::load(None, crate::config::CliOverrides::default()).unwrap();
        let connector = crate::tls::build_connector(true).unwrap();
        let session = DialbackSession::new(
            cfg,
            None,
            connector,
            Arc::new(crate::processor::LoggingProcessor),
            Arc::new(crate::processor::LoggingNotifier),
        );

        session.context().mark_verified("openfire");
        session.context().mark_verified("conference.openfire");
        session
            .context()
            .register_dialback("proxy==conference.openfire", "feedc0de");

        session.on_outbound_lost().await;

        // Secondary domains lose trust along with the primary one.
        assert!(!session.context().is_verified("openfire"));
        assert!(!session.context().is_verified("conference.openfire"));
        // Stale pending entries would block re-verification on reconnect.
        assert!(!session
            .context()
            .dialback_in_flight("proxy==conference.openfire"));
    }

    #[tokio::test]
    async fn send_packet_rejects_stanza_without_destination() {
        crate::tls::init_crypto();
        let cfg = GatewayConfig::load(None, crate::config::CliOverrides::default()).unwrap();
        let connector = crate::tls::build_connector(true).unwrap();
        let session = DialbackSession::new(
            cfg,
            None,
            connector,
            Arc::new(crate::processor::LoggingProcessor),
            Arc::new(crate::processor::LoggingNotifier),
        );

        let result = session.send_packet("<message from='u@proxy'/>").await;
        assert!(result.is_err());
    }
}
