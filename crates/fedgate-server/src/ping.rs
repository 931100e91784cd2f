//! Liveness pings over the outbound stream.
//!
//! Once the remote domain verifies, a background task sends an IQ ping
//! each interval and counts consecutive unanswered rounds. Crossing the
//! miss threshold stops the connection exactly once; the reconnect
//! supervisor takes it from there.

use crate::connection::KillSwitch;
use crate::context::{InitiatingControl, SessionContext};
use fedgate_core::{generate_ping_id, wire};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of closing one ping round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Answered,
    Missed,
    /// Consecutive misses just reached the threshold. Reported once per
    /// tracker lifetime.
    ThresholdCrossed,
}

/// Pure ping bookkeeping. A round opens with an id, a pong for any
/// outstanding id resets the consecutive-miss counter, and closing a
/// round that never saw its pong counts one miss.
#[derive(Debug)]
pub struct PingTracker {
    outstanding: HashSet<String>,
    misses: u32,
    threshold: u32,
    fired: bool,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new(4)
    }
}

impl PingTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            outstanding: HashSet::new(),
            misses: 0,
            threshold,
            fired: false,
        }
    }

    pub fn begin_round(&mut self, id: &str) {
        self.outstanding.insert(id.to_string());
    }

    /// Whether a ping with this id is still awaiting its pong.
    pub fn is_outstanding(&self, id: &str) -> bool {
        self.outstanding.contains(id)
    }

    /// Record a pong. Returns true if the id matched an outstanding ping.
    pub fn record_pong(&mut self, id: &str) -> bool {
        if self.outstanding.remove(id) {
            self.misses = 0;
            true
        } else {
            false
        }
    }

    pub fn close_round(&mut self, id: &str) -> RoundOutcome {
        if !self.outstanding.remove(id) {
            // Already answered during the interval.
            return RoundOutcome::Answered;
        }
        self.misses += 1;
        if self.misses >= self.threshold && !self.fired {
            self.fired = true;
            return RoundOutcome::ThresholdCrossed;
        }
        RoundOutcome::Missed
    }

    pub fn consecutive_misses(&self) -> u32 {
        self.misses
    }
}

/// Ping loop for one outbound connection. Runs until the kill flag is
/// set or the miss threshold fires.
pub async fn run_ping(
    ctx: Arc<SessionContext>,
    kill: KillSwitch,
    local: String,
    remote: String,
    interval: Duration,
) {
    debug!(%remote, "ping task started");
    loop {
        if kill.is_set() {
            break;
        }
        let id = generate_ping_id();
        {
            let mut tracker = ctx.ping.lock().unwrap_or_else(|e| e.into_inner());
            tracker.begin_round(&id);
        }
        let ping = wire::ping_iq(&local, &remote, &id);
        let Some(writer) = ctx.initiating_writer() else {
            break;
        };
        if writer.send(ping).await.is_err() {
            break;
        }

        tokio::time::sleep(interval).await;

        let outcome = {
            let mut tracker = ctx.ping.lock().unwrap_or_else(|e| e.into_inner());
            tracker.close_round(&id)
        };
        match outcome {
            RoundOutcome::Answered => {}
            RoundOutcome::Missed => {
                let misses = {
                    let tracker = ctx.ping.lock().unwrap_or_else(|e| e.into_inner());
                    tracker.consecutive_misses()
                };
                debug!(%remote, misses, "ping unanswered");
            }
            RoundOutcome::ThresholdCrossed => {
                warn!(%remote, "ping threshold crossed, stopping connection");
                kill.set();
                if let Some(control) = ctx.initiating_control() {
                    let _ = control.send(InitiatingControl::Stop).await;
                }
                break;
            }
        }
    }
    debug!(%remote, "ping task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_resets_consecutive_misses() {
        let mut t = PingTracker::new(4);
        t.begin_round("a");
        assert_eq!(t.close_round("a"), RoundOutcome::Missed);
        t.begin_round("b");
        assert_eq!(t.close_round("b"), RoundOutcome::Missed);
        assert_eq!(t.consecutive_misses(), 2);

        t.begin_round("c");
        assert!(t.is_outstanding("c"));
        assert!(t.record_pong("c"));
        assert!(!t.is_outstanding("c"));
        assert_eq!(t.consecutive_misses(), 0);
        assert_eq!(t.close_round("c"), RoundOutcome::Answered);
    }

    #[test]
    fn threshold_fires_exactly_once() {
        let mut t = PingTracker::new(3);
        for (i, id) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            t.begin_round(id);
            let outcome = t.close_round(id);
            if i == 2 {
                assert_eq!(outcome, RoundOutcome::ThresholdCrossed);
            } else {
                assert_eq!(outcome, RoundOutcome::Missed);
            }
        }
    }

    #[test]
    fn unknown_pong_is_ignored() {
        let mut t = PingTracker::new(4);
        t.begin_round("a");
        assert!(!t.record_pong("zzz"));
        assert_eq!(t.close_round("a"), RoundOutcome::Missed);
    }
}
