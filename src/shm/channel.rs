//! Naming, layout and handshake for a worker's shared-memory channel to the
//! DCP. A worker's data region is an array of [`ShmCell`]s; a transient
//! handshake region hands the worker that region's name before the worker
//! attaches to it.

use super::segment::ShmSegment;
use super::slot::{CellPayload, ShmCell, CELL_SIZE};
use crate::error::ShmError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

/// Default number of cells per worker region (`S` in the data model).
pub const DEFAULT_NUM_CELLS: usize = 15;

const HANDSHAKE_REGION_SIZE: usize = 512;

pub fn region_name(worker_pid: u32) -> String {
    format!("/DatabaseCommitProcessSHM{worker_pid}")
}

pub fn handshake_name(worker_pid: u32) -> String {
    format!("/DatabaseCommitProcessSHM{worker_pid}_handshake")
}

/// A worker's array of fixed-width cells, backed by one `ShmSegment`.
pub struct WorkerRegion {
    segment: ShmSegment,
    num_cells: usize,
}

impl WorkerRegion {
    /// Create the region and fill every cell with a dummy occupied payload,
    /// matching the source's "pre-fill to worst-case size" step; here it
    /// also doubles as the not-yet-acknowledged handshake state a worker
    /// clears during attach.
    pub fn create(worker_pid: u32, num_cells: usize) -> Result<Self, ShmError> {
        let segment = ShmSegment::create(&region_name(worker_pid), num_cells * CELL_SIZE)?;
        let region = Self { segment, num_cells };
        let dummy = CellPayload::Reply { offset: None };
        for cell in region.cells() {
            // SAFETY: region was just created; no worker has attached yet.
            unsafe { force_fill(cell, &dummy) };
        }
        Ok(region)
    }

    pub fn open(worker_pid: u32, num_cells: usize) -> Result<Self, ShmError> {
        let segment = ShmSegment::open(&region_name(worker_pid), num_cells * CELL_SIZE)?;
        Ok(Self { segment, num_cells })
    }

    pub fn num_cells(&self) -> usize {
        self.num_cells
    }

    pub fn cell(&self, index: usize) -> &ShmCell {
        assert!(index < self.num_cells, "cell index out of range");
        // SAFETY: the segment was sized to num_cells * CELL_SIZE and ShmCell
        // is repr(C, align(64)); this indexes within the mapped region.
        unsafe { &*(self.segment.as_ptr().add(index * CELL_SIZE) as *const ShmCell) }
    }

    pub fn cells(&self) -> impl Iterator<Item = &ShmCell> {
        (0..self.num_cells).map(move |i| self.cell(i))
    }

    pub fn all_empty(&self) -> bool {
        self.cells().all(|c| !c.is_occupied())
    }

    pub fn unlink(worker_pid: u32) -> Result<(), ShmError> {
        ShmSegment::unlink(&region_name(worker_pid))
    }
}

/// Forcibly write into a cell regardless of current occupancy state. Used
/// only by the DCP while pre-filling a freshly created region, before any
/// worker can observe it.
unsafe fn force_fill(cell: &ShmCell, payload: &CellPayload) {
    cell.clear();
    let claimed = cell.try_claim(payload);
    debug_assert!(claimed);
}

/// Descriptor handed to a worker at startup, telling it which region to
/// attach to and how many cells it has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeDescriptor {
    pub region_name: String,
    pub num_cells: usize,
}

/// The DCP's side of the handshake: publish the descriptor, then wait for
/// the worker to attach and blank its region.
pub struct HandshakeRegion {
    segment: ShmSegment,
}

impl HandshakeRegion {
    pub fn publish(worker_pid: u32, descriptor: &HandshakeDescriptor) -> Result<Self, ShmError> {
        let segment = ShmSegment::create(&handshake_name(worker_pid), HANDSHAKE_REGION_SIZE)?;
        let bytes = serde_json::to_vec(descriptor)
            .map_err(|e| ShmError::MalformedPayload(e.to_string()))?;
        if bytes.len() > HANDSHAKE_REGION_SIZE {
            return Err(ShmError::MalformedPayload(format!(
                "handshake descriptor ({} bytes) exceeds region size",
                bytes.len()
            )));
        }
        // SAFETY: segment was just created with HANDSHAKE_REGION_SIZE bytes,
        // and bytes.len() was checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), segment.as_ptr(), bytes.len());
        }
        Ok(Self { segment })
    }

    pub fn teardown(worker_pid: u32) -> Result<(), ShmError> {
        ShmSegment::unlink(&handshake_name(worker_pid))
    }

    pub fn read(worker_pid: u32) -> Result<HandshakeDescriptor, ShmError> {
        let segment = ShmSegment::open(&handshake_name(worker_pid), HANDSHAKE_REGION_SIZE)?;
        // SAFETY: segment maps HANDSHAKE_REGION_SIZE bytes written by
        // publish() above.
        let bytes = unsafe {
            std::slice::from_raw_parts(segment.as_ptr(), HANDSHAKE_REGION_SIZE)
        };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        serde_json::from_slice(&bytes[..end])
            .map_err(|e| ShmError::MalformedPayload(e.to_string()))
    }
}

/// Block until every listed worker has blanked all cells in its region,
/// acknowledging the handshake, or time out.
pub fn wait_for_handshake_acks(
    worker_pids: &[u32],
    num_cells: usize,
    timeout: Duration,
) -> Result<(), ShmError> {
    let deadline = Instant::now() + timeout;
    let mut pending: Vec<u32> = worker_pids.to_vec();

    while !pending.is_empty() {
        if Instant::now() > deadline {
            warn!(remaining = ?pending, "handshake acknowledgement timed out");
            return Err(ShmError::HandshakeTimeout {
                pid: pending[0],
                secs: timeout.as_secs(),
            });
        }
        pending.retain(|&pid| {
            let Ok(region) = WorkerRegion::open(pid, num_cells) else {
                return true;
            };
            !region.all_empty()
        });
        if !pending.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_pid() -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        (SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() % u32::MAX as u128)
            as u32
    }

    #[test]
    fn region_is_prefilled_then_clearable() {
        let pid = unique_pid();
        let region = WorkerRegion::create(pid, DEFAULT_NUM_CELLS).unwrap();
        assert!(!region.all_empty());

        for cell in region.cells() {
            cell.clear();
        }
        assert!(region.all_empty());

        WorkerRegion::unlink(pid).ok();
    }

    #[test]
    fn handshake_roundtrip() {
        let pid = unique_pid() + 1;
        let descriptor = HandshakeDescriptor {
            region_name: region_name(pid),
            num_cells: DEFAULT_NUM_CELLS,
        };
        let _region = HandshakeRegion::publish(pid, &descriptor).unwrap();
        let read_back = HandshakeRegion::read(pid).unwrap();
        assert_eq!(read_back.region_name, descriptor.region_name);
        assert_eq!(read_back.num_cells, descriptor.num_cells);
        HandshakeRegion::teardown(pid).ok();
    }
}
