//! Streaming indexed records to another node.
//!
//! Transfer is strictly sequential: one connection, one `TransferPut` at a
//! time, each acknowledged before the next record is read. Source files are
//! only deleted after every record has been acknowledged; any failure leaves
//! the source tree untouched so the migration can be re-run from scratch.

use crate::codec::{read_message, write_message};
use crate::error::{Result, StreamingError};
use crate::index::{RangeIndex, RangeIndexer};
use crate::protocol::{Message, MessageType};
use corelib::KeyHashRange;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use storage::layout::hash_from_path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Outcome of a completed transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub records: usize,
    pub bytes: u64,
}

/// Sends the records of a `RangeIndex` to a target node.
#[derive(Clone, Debug)]
pub struct RangeSender {
    /// Bound on connecting and on each record's acknowledgement.
    record_timeout: Duration,
}

impl RangeSender {
    pub fn new(record_timeout: Duration) -> Self {
        Self { record_timeout }
    }

    pub async fn send(&self, index: &RangeIndex, target: SocketAddr) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        if index.is_empty() {
            return Ok(report);
        }
        let mut stream = timeout(self.record_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| StreamingError::Timeout)??;
        stream.set_nodelay(true)?;

        for index_file in index.index_files() {
            let file = tokio::fs::File::open(index_file).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                let path = index.root().join(line);
                let value = tokio::fs::read(&path).await?;
                let hash = hash_from_path(&path)?;
                report.bytes += value.len() as u64;

                write_message(&mut stream, &Message::TransferPut { hash, value }).await?;
                let reply = timeout(self.record_timeout, read_message(&mut stream))
                    .await
                    .map_err(|_| StreamingError::Timeout)??;
                if reply != Message::TransferPutSuccess {
                    return Err(StreamingError::UnexpectedMessage {
                        expected: MessageType::TransferPutSuccess,
                        got: reply.message_type(),
                    });
                }
                report.records += 1;
            }
        }
        metrics::counter!("ringkv_records_transferred_total").increment(report.records as u64);
        Ok(report)
    }
}

/// Move every record of `range` from the tree at `root` to `target`.
///
/// Indexes the range, sends the records, and deletes them locally only after
/// all were acknowledged.
pub async fn transfer_range(
    root: &Path,
    scratch: &Path,
    range: KeyHashRange,
    target: SocketAddr,
    record_timeout: Duration,
) -> Result<TransferReport> {
    let indexer = RangeIndexer::new(root, scratch);
    let index = tokio::task::spawn_blocking(move || indexer.index(&range))
        .await
        .map_err(|e| StreamingError::Transfer(format!("indexing task failed: {}", e)))??;
    info!(range = %range, records = index.len(), target = %target, "transferring range");

    let report = match RangeSender::new(record_timeout).send(&index, target).await {
        Ok(report) => report,
        Err(e) => {
            warn!(range = %range, target = %target, error = %e, "transfer aborted; source records kept");
            return Err(e);
        }
    };

    let deleted = tokio::task::spawn_blocking(move || index.delete_sources())
        .await
        .map_err(|e| StreamingError::Transfer(format!("cleanup task failed: {}", e)))??;
    metrics::counter!("ringkv_records_deleted_total").increment(deleted as u64);
    debug!(range = %range, deleted, "source records removed");
    Ok(report)
}
