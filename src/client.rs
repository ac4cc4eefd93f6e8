//! Worker-side cache client: per-worker object that attaches to its
//! shared-memory channel and exchanges read/write requests with the DCP.
//!
//! Named `CacheClient` rather than the original's `Model`, since that name
//! is reserved here for the embedding computation boundary
//! ([`crate::embedding_model::EmbeddingModel`]) — the original conflated
//! the two roles in one class.

use crate::error::ShmError;
use crate::index::sqlite::SqliteIndexStore;
use crate::index::IndexStore;
use crate::shm::channel::{wait_for_handshake_acks, HandshakeRegion, WorkerRegion};
use crate::shm::slot::CellPayload;
use std::time::{Duration, Instant};
use tracing::warn;

const HANDSHAKE_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(1);
const REPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    Dropped,
}

/// Per-worker handle to the shared-memory channel, plus (for the
/// transactional row-store backend only) a direct read-only index handle
/// that bypasses the DCP entirely for reads.
pub struct CacheClient {
    worker_pid: u32,
    region: WorkerRegion,
    direct_read: Option<SqliteIndexStore>,
}

impl CacheClient {
    /// Attach to this worker's shared-memory region: wait for the DCP to
    /// publish the handshake descriptor, open the data region it names,
    /// then blank every cell to acknowledge the handshake.
    pub fn attach(worker_pid: u32, direct_read: Option<SqliteIndexStore>) -> Result<Self, ShmError> {
        let deadline = Instant::now() + HANDSHAKE_ATTACH_TIMEOUT;
        let descriptor = loop {
            match HandshakeRegion::read(worker_pid) {
                Ok(d) => break d,
                Err(ShmError::NotFound(_)) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => {
                    return Err(ShmError::HandshakeTimeout {
                        pid: worker_pid,
                        secs: HANDSHAKE_ATTACH_TIMEOUT.as_secs(),
                    })
                }
            }
        };

        let region = WorkerRegion::open(worker_pid, descriptor.num_cells)?;
        for cell in region.cells() {
            cell.clear();
        }

        Ok(Self {
            worker_pid,
            region,
            direct_read,
        })
    }

    /// Block (for test harnesses and the supervisor, not workers
    /// themselves) until this worker's handshake has been acknowledged.
    pub fn wait_acknowledged(worker_pid: u32, num_cells: usize, timeout: Duration) -> Result<(), ShmError> {
        wait_for_handshake_acks(&[worker_pid], num_cells, timeout)
    }

    pub fn worker_pid(&self) -> u32 {
        self.worker_pid
    }

    /// Construct a client around an already-open region, bypassing the
    /// handshake. Only for tests that need a `CacheClient` without a live
    /// DCP on the other end.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        worker_pid: u32,
        region: WorkerRegion,
        direct_read: Option<SqliteIndexStore>,
    ) -> Self {
        Self {
            worker_pid,
            region,
            direct_read,
        }
    }

    /// Resolve `hash` to an offset. For the transactional row store this
    /// queries the worker's own read-only handle directly; for the
    /// kv-store backend it round-trips through the DCP via shared memory.
    pub fn read_offset(&self, hash: &str) -> Result<Option<u64>, ShmError> {
        if let Some(db) = &self.direct_read {
            return db
                .read_offset(hash)
                .map_err(|e| ShmError::MalformedPayload(e.to_string()));
        }

        let req = CellPayload::ReadRequest {
            hash: hash.to_string(),
        };
        let Some(cell) = self.region.cells().find(|c| c.try_claim(&req)) else {
            warn!(%hash, "no free shared-memory cell for read request");
            return Err(ShmError::MalformedPayload(
                "no free cell for read request".to_string(),
            ));
        };

        let deadline = Instant::now() + REPLY_WAIT_TIMEOUT;
        loop {
            if let Some(CellPayload::Reply { offset }) = cell.peek() {
                cell.clear();
                return Ok(offset);
            }
            if Instant::now() > deadline {
                // Release the cell before giving up, otherwise a reply that
                // arrives after this point leaves it permanently occupied.
                cell.clear();
                return Err(ShmError::ReplyTimeout {
                    hash: hash.to_string(),
                    secs: REPLY_WAIT_TIMEOUT.as_secs(),
                });
            }
            std::thread::sleep(REPLY_POLL_INTERVAL);
        }
    }

    /// Enqueue `(hash, offset)` for the DCP to commit. No reply is awaited;
    /// returns `Dropped` if every cell is currently occupied.
    pub fn write_offset(&self, hash: &str, offset: u64) -> WriteOutcome {
        let req = CellPayload::WriteRequest {
            hash: hash.to_string(),
            offset,
        };
        if self.region.cells().any(|c| c.try_claim(&req)) {
            WriteOutcome::Sent
        } else {
            warn!(%hash, offset, "shared-memory slot exhausted, dropping write");
            WriteOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::channel::{DEFAULT_NUM_CELLS};

    fn unique_pid(tag: u32) -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        (nanos % 100_000) as u32 * 10 + tag
    }

    #[test]
    fn write_dropped_when_all_cells_occupied() {
        let pid = unique_pid(1);
        let region = WorkerRegion::create(pid, 2).unwrap();
        // Clear the pre-fill dummy so cells start genuinely empty, then fill both.
        for cell in region.cells() {
            cell.clear();
        }
        let client = CacheClient::new_for_test(pid, region, None);

        assert_eq!(client.write_offset(&"a".repeat(64), 0), WriteOutcome::Sent);
        assert_eq!(client.write_offset(&"b".repeat(64), 4), WriteOutcome::Sent);
        assert_eq!(client.write_offset(&"c".repeat(64), 8), WriteOutcome::Dropped);

        WorkerRegion::unlink(pid).ok();
    }

    #[test]
    fn read_offset_bypasses_dcp_for_sqlite() {
        let pid = unique_pid(2);
        let mut ro = crate::index::SqliteIndexStore::open_in_memory().unwrap();
        ro.insert_offset(&"d".repeat(64), 2048).unwrap();

        let region = WorkerRegion::create(pid, DEFAULT_NUM_CELLS).unwrap();
        let client = CacheClient::new_for_test(pid, region, Some(ro));

        assert_eq!(client.read_offset(&"d".repeat(64)).unwrap(), Some(2048));
        WorkerRegion::unlink(pid).ok();
    }
}
