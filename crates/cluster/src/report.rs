//! Failure report side channel between nodes and the orchestrator.
//!
//! A node that detects a dead predecessor opens a connection to the
//! orchestrator's report address, sends `ServerFailed` with the dead node's
//! write range and waits for `ReportReceived`.

use crate::error::{ClusterError, Result};
use crate::heartbeat::FailureReporter;
use async_trait::async_trait;
use corelib::{KeyHashRange, NodeInfo};
use std::future::Future;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use streaming::{read_message, write_message, Message};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reports failed predecessors to the orchestrator over TCP.
///
/// The report address arrives with `INIT`, after the heartbeat tasks are
/// already running, so it is read from a watch channel at report time.
pub struct TcpFailureReporter {
    report_addr: watch::Receiver<Option<SocketAddrV4>>,
    connect_timeout: Duration,
    wait: Duration,
}

impl TcpFailureReporter {
    pub fn new(
        report_addr: watch::Receiver<Option<SocketAddrV4>>,
        connect_timeout: Duration,
        wait: Duration,
    ) -> Self {
        Self {
            report_addr,
            connect_timeout,
            wait,
        }
    }
}

#[async_trait]
impl FailureReporter for TcpFailureReporter {
    async fn report(&self, failed: NodeInfo) {
        let report_addr = *self.report_addr.borrow();
        let Some(report_addr) = report_addr else {
            warn!(node = %failed, "predecessor failed but no report address is known");
            return;
        };
        match send_failure_report(report_addr.into(), failed.write_range, self.connect_timeout, self.wait).await {
            Ok(()) => info!(node = %failed, "failure report acknowledged"),
            Err(e) => warn!(node = %failed, error = %e, "failure report not delivered"),
        }
    }
}

/// Send one failure report and wait for the acknowledgement.
///
/// The reply only arrives once the orchestrator has finished handling the
/// failure, so `wait` should cover a full rebalance.
pub async fn send_failure_report(
    report_addr: SocketAddr,
    range: KeyHashRange,
    connect_timeout: Duration,
    wait: Duration,
) -> Result<()> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(report_addr))
        .await
        .map_err(|_| ClusterError::Protocol(format!("timed out connecting to {}", report_addr)))??;
    write_message(&mut stream, &Message::ServerFailed { range }).await?;
    let reply = timeout(wait, read_message(&mut stream))
        .await
        .map_err(|_| ClusterError::Protocol("no acknowledgement for failure report".to_string()))??;
    match reply {
        Message::ReportReceived => Ok(()),
        other => Err(ClusterError::Protocol(format!(
            "failure report answered with {:?}",
            other.message_type()
        ))),
    }
}

/// Accept failure reports until the listener fails, handing each reported
/// range to `handle`. Reports are acknowledged after `handle` returns, even
/// when it fails.
pub async fn serve_failure_reports<F, Fut>(listener: TcpListener, handle: F)
where
    F: Fn(KeyHashRange) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send,
{
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "report listener failed");
                return;
            }
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_report(stream, handle).await {
                debug!(%peer, error = %e, "failure report connection ended");
            }
        });
    }
}

async fn handle_report<F, Fut>(mut stream: TcpStream, handle: F) -> Result<()>
where
    F: Fn(KeyHashRange) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let range = match read_message(&mut stream).await? {
        Message::ServerFailed { range } => range,
        other => {
            return Err(ClusterError::Protocol(format!(
                "expected ServerFailed, got {:?}",
                other.message_type()
            )))
        }
    };
    if let Err(e) = handle(range).await {
        warn!(%range, error = %e, "failure handling did not complete");
    }
    write_message(&mut stream, &Message::ReportReceived).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::HashKey;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_report_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tokio::spawn(serve_failure_reports(listener, move |range| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(range);
                Ok(true)
            }
        }));

        let range = KeyHashRange::new(HashKey(10), HashKey(20));
        send_failure_report(addr, range, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![range]);
    }

    #[tokio::test]
    async fn test_report_acknowledged_even_when_handling_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_failure_reports(listener, |_| async {
            Err(ClusterError::EmptyRing)
        }));
        send_failure_report(addr, KeyHashRange::full(), Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
    }
}
