//! Database Commit Process: sole owner of the writable index handle. Runs
//! one servicing thread per worker, each polling that worker's
//! shared-memory region and applying writes or answering reads.

use crate::index::IndexStore;
use crate::shm::channel::{region_name, HandshakeDescriptor, HandshakeRegion, WorkerRegion};
use crate::shm::slot::CellPayload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Cadence at which a servicing thread rescans an all-empty region.
const SCAN_IDLE_INTERVAL: Duration = Duration::from_millis(5);

/// Timeout waiting for the supervisor to publish the full worker set.
pub const WORKER_SET_TIMEOUT: Duration = Duration::from_secs(20);

/// Timeout waiting for every worker to acknowledge its handshake.
pub const HANDSHAKE_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One servicing thread's view of its worker: the attached region and a
/// per-thread write buffer that is flushed independently of other threads
/// to minimize contention on the shared index handle.
struct ServicingThread<S: IndexStore> {
    worker_pid: u32,
    region: WorkerRegion,
    index: Arc<std::sync::Mutex<S>>,
    flush_after: usize,
    pending: usize,
    inserted: u64,
    dropped: u64,
    shutdown: Arc<AtomicBool>,
}

impl<S: IndexStore> ServicingThread<S> {
    fn run(mut self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            let mut any_occupied = false;
            for cell in self.region.cells() {
                let Some(decoded) = cell.peek_raw() else {
                    continue;
                };
                any_occupied = true;

                match decoded {
                    Err(()) => {
                        warn!(worker = self.worker_pid, "malformed shared-memory payload, blanking cell");
                        cell.clear();
                    }
                    Ok(CellPayload::ReadRequest { hash }) => {
                        // Reached only for backends where supports_direct_read()
                        // is false; the row-store backend's workers bypass the
                        // DCP for reads entirely via CacheClient::read_offset.
                        let offset = self.index.lock().unwrap().read_offset(&hash).unwrap_or(None);
                        cell.overwrite(&CellPayload::Reply { offset });
                    }
                    Ok(CellPayload::WriteRequest { hash, offset }) => {
                        let mut index = self.index.lock().unwrap();
                        match index.insert_offset(&hash, offset) {
                            Ok(()) => self.inserted += 1,
                            Err(e) => {
                                error!(worker = self.worker_pid, %hash, error = %e, "index write failed, embedding remains on disk without a cache entry");
                                self.dropped += 1;
                            }
                        }
                        drop(index);
                        cell.clear();
                        self.pending += 1;
                        if self.pending >= self.flush_after {
                            self.flush();
                        }
                    }
                    Ok(CellPayload::Reply { .. }) => {
                        // A reply sitting in a cell belongs to the worker
                        // consuming it, not to us; leave it untouched.
                    }
                }
            }

            if !any_occupied {
                std::thread::sleep(SCAN_IDLE_INTERVAL);
            }
        }

        self.flush();
        info!(worker = self.worker_pid, inserted = self.inserted, dropped = self.dropped, "servicing thread shut down");
    }

    fn flush(&mut self) {
        if self.pending == 0 {
            return;
        }
        if let Err(e) = self.index.lock().unwrap().flush() {
            error!(worker = self.worker_pid, error = %e, "index flush failed");
        }
        self.pending = 0;
    }
}

/// Handle returned by [`DatabaseCommitProcess::start`]: used to request an
/// orderly shutdown and wait for every servicing thread to exit.
pub struct DcpHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
    worker_pids: Vec<u32>,
}

impl DcpHandle {
    /// Flush pending batches, stop all servicing threads, and release the
    /// shared-memory regions. Idempotent on the shutdown flag, not on
    /// repeated calls to `shutdown` itself (join consumes the threads).
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        for pid in &self.worker_pids {
            let _ = WorkerRegion::unlink(*pid);
        }
    }
}

/// Starts the DCP's startup protocol (§4.2): open the index, wait for the
/// worker set, allocate and hand off each worker's region via a handshake,
/// then spawn one servicing thread per worker.
pub struct DatabaseCommitProcess;

impl DatabaseCommitProcess {
    pub fn start<S>(index: S, worker_pids: Vec<u32>, num_cells: usize, flush_after: usize) -> anyhow::Result<DcpHandle>
    where
        S: IndexStore + 'static,
    {
        let index = Arc::new(std::sync::Mutex::new(index));
        index.lock().unwrap().create_schema().map_err(|e| anyhow::anyhow!(e.to_string()))?;

        for &pid in &worker_pids {
            let region = WorkerRegion::create(pid, num_cells)?;
            drop(region);
            let descriptor = HandshakeDescriptor {
                region_name: region_name(pid),
                num_cells,
            };
            HandshakeRegion::publish(pid, &descriptor)?;
        }

        crate::shm::channel::wait_for_handshake_acks(&worker_pids, num_cells, HANDSHAKE_ACK_TIMEOUT)?;

        for &pid in &worker_pids {
            HandshakeRegion::teardown(pid)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(worker_pids.len());
        for &pid in &worker_pids {
            let region = WorkerRegion::open(pid, num_cells)?;
            let thread = ServicingThread {
                worker_pid: pid,
                region,
                index: Arc::clone(&index),
                flush_after,
                pending: 0,
                inserted: 0,
                dropped: 0,
                shutdown: Arc::clone(&shutdown),
            };
            threads.push(std::thread::spawn(move || thread.run()));
        }

        info!(workers = worker_pids.len(), "database commit process servicing threads started");

        Ok(DcpHandle {
            shutdown,
            threads,
            worker_pids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::store::test_support::MemoryIndexStore;
    use crate::shm::slot::OFFSET_SENTINEL;

    fn unique_pid(tag: u32) -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        (nanos % 100_000) as u32 * 10 + tag
    }

    #[test]
    fn write_request_lands_in_index_and_clears_cell() {
        let pid = unique_pid(1);
        let handle = DatabaseCommitProcess::start(MemoryIndexStore::default(), vec![pid], 4, 10).unwrap();

        // Wait for handshake regions and then act as a worker: attach and
        // write directly to the first cell.
        std::thread::sleep(Duration::from_millis(50));
        let region = WorkerRegion::open(pid, 4).unwrap();
        let hash = "a".repeat(64);
        let req = CellPayload::WriteRequest { hash: hash.clone(), offset: 2048 };
        assert!(region.cells().next().unwrap().try_claim(&req));

        // Give the servicing thread a moment to notice and apply it.
        std::thread::sleep(Duration::from_millis(100));
        assert!(region.cell(0).peek().is_none());

        handle.shutdown();
    }

    #[test]
    fn read_request_gets_a_reply() {
        let pid = unique_pid(2);
        let mut store = MemoryIndexStore::default();
        let hash = "b".repeat(64);
        store.insert_offset(&hash, 4096).unwrap();

        let handle = DatabaseCommitProcess::start(store, vec![pid], 4, 10).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let region = WorkerRegion::open(pid, 4).unwrap();
        let req = CellPayload::ReadRequest { hash: hash.clone() };
        let cell = region.cells().next().unwrap();
        assert!(cell.try_claim(&req));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut reply = None;
        while std::time::Instant::now() < deadline {
            if let Some(CellPayload::Reply { offset }) = cell.peek() {
                reply = Some(offset);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reply, Some(Some(4096)));
        let _ = OFFSET_SENTINEL;

        handle.shutdown();
    }
}
