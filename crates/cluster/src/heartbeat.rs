//! Ring heartbeats and predecessor failure detection.
//!
//! Every node sends a `Heartbeat` datagram to its successor once per
//! interval and watches for heartbeats from its predecessor. A watch counts
//! as a miss each time `2 × interval` passes without a heartbeat from the
//! expected sender. After `miss_threshold` consecutive misses the
//! predecessor is reported to the orchestrator, once per outage.
//!
//! The detector only arms after the first heartbeat from the current
//! predecessor. A node that has never been heard from is not reported, so a
//! freshly joined pair cannot accuse each other during startup.

use crate::config::HeartbeatSettings;
use async_trait::async_trait;
use corelib::{HashKey, Metadata, NodeInfo};
use std::sync::Arc;
use streaming::codec::{decode_message, encode_message};
use streaming::Message;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// The two ring neighbors a node exchanges heartbeats with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Neighbors {
    pub own: HashKey,
    pub successor: Option<NodeInfo>,
    pub predecessor: Option<NodeInfo>,
}

impl Neighbors {
    pub fn alone(own: HashKey) -> Self {
        Self {
            own,
            successor: None,
            predecessor: None,
        }
    }

    /// Neighbors of `own` in `metadata`; `own` need not be a member.
    pub fn from_metadata(metadata: &Metadata, own: HashKey) -> Self {
        Self {
            own,
            successor: metadata.successor_of(own).cloned(),
            predecessor: metadata.predecessor_of(own).cloned(),
        }
    }
}

/// Consecutive-miss counter for one predecessor.
#[derive(Clone, Debug)]
pub struct FailureDetector {
    threshold: u32,
    armed: bool,
    misses: u32,
    reported: bool,
}

impl FailureDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            armed: false,
            misses: 0,
            reported: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn record_heartbeat(&mut self) {
        self.armed = true;
        self.misses = 0;
        self.reported = false;
    }

    /// Count one missed interval. Returns true exactly when the predecessor
    /// should be reported.
    pub fn record_miss(&mut self) -> bool {
        if !self.armed || self.reported {
            return false;
        }
        self.misses += 1;
        if self.misses >= self.threshold {
            self.reported = true;
            return true;
        }
        false
    }

    /// Forget everything; used when the predecessor changes.
    pub fn reset(&mut self) {
        self.armed = false;
        self.misses = 0;
        self.reported = false;
    }
}

/// Where a node sends word of a failed predecessor.
#[async_trait]
pub trait FailureReporter: Send + Sync {
    async fn report(&self, failed: NodeInfo);
}

/// Send a heartbeat to the current successor every interval.
pub async fn run_sender(
    socket: Arc<UdpSocket>,
    neighbors: watch::Receiver<Neighbors>,
    settings: HeartbeatSettings,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    loop {
        ticker.tick().await;
        let (own, successor) = {
            let n = neighbors.borrow();
            (n.own, n.successor.clone())
        };
        let Some(successor) = successor else {
            continue;
        };
        let datagram = encode_message(&Message::Heartbeat { sender: own });
        match socket.send_to(&datagram, successor.addr()).await {
            Ok(_) => trace!(to = %successor.addr(), "heartbeat sent"),
            Err(e) => debug!(to = %successor.addr(), error = %e, "heartbeat send failed"),
        }
    }
}

/// Watch the current predecessor and report it after too many misses.
pub async fn run_monitor(
    socket: Arc<UdpSocket>,
    neighbors: watch::Receiver<Neighbors>,
    settings: HeartbeatSettings,
    reporter: Arc<dyn FailureReporter>,
) {
    let mut detector = FailureDetector::new(settings.miss_threshold);
    let mut watched: Option<HashKey> = None;
    let mut deadline = Instant::now() + settings.miss_timeout();
    let mut buf = vec![0u8; 512];

    loop {
        let predecessor = neighbors.borrow().predecessor.clone();
        let current = predecessor.as_ref().map(|p| p.id);
        if current != watched {
            debug!(predecessor = ?current, "watching new predecessor");
            watched = current;
            detector.reset();
            deadline = Instant::now() + settings.miss_timeout();
        }

        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match decode_message(&buf[..len]) {
                Ok(Message::Heartbeat { sender }) if Some(sender) == watched => {
                    detector.record_heartbeat();
                    deadline = Instant::now() + settings.miss_timeout();
                }
                Ok(Message::Heartbeat { sender }) => {
                    trace!(%sender, %from, "heartbeat from non-predecessor ignored");
                }
                Ok(other) => trace!(%from, kind = ?other.message_type(), "unexpected datagram"),
                Err(e) => trace!(%from, error = %e, "undecodable datagram"),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "heartbeat socket error");
            }
            Err(_) => {
                deadline = Instant::now() + settings.miss_timeout();
                if detector.record_miss() {
                    if let Some(failed) = predecessor {
                        info!(node = %failed, misses = detector.misses(), "predecessor missed heartbeats; reporting");
                        metrics::counter!("ringkv_failure_reports_total").increment(1);
                        let reporter = Arc::clone(&reporter);
                        tokio::spawn(async move { reporter.report(failed).await });
                    }
                } else if detector.is_armed() {
                    debug!(misses = detector.misses(), "heartbeat missed");
                }
            }
        }
    }
}
