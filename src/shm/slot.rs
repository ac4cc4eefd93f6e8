//! Fixed-length string-cell slots for the worker ↔ DCP channel.
//!
//! Each worker's shared-memory region is an array of `S` cells. A cell is
//! either empty (free for a worker to claim) or holds exactly one packed
//! payload: `H ∥ "0x" ∥ hex(O)`, zero-padded so every payload is the same
//! byte length regardless of which sentinel or offset it carries. That
//! fixed-length invariant is validated in exactly one place: [`CellPayload::encode`]
//! and [`CellPayload::decode`].
//!
//! Ownership is encoded by occupancy, not by a separate lock: a worker may
//! only write into a cell it observes empty; the DCP may only overwrite or
//! clear a cell it observes occupied. The `state` field is the only atomic
//! involved — `Acquire`/`Release` on it establishes the happens-before edge
//! for the payload bytes next to it, the same idiom used for sequence
//! numbers elsewhere in this crate's shared-memory code.

use crate::hash::HASH_LEN;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

/// `2^63 - 1`. Doubles as "this is a read request" (worker→DCP) and
/// "not found" (DCP→worker).
pub const OFFSET_SENTINEL: u64 = (1u64 << 63) - 1;

/// `len(H)` copies of byte `0x15`, marking a cell's hash field as a
/// DCP-originated reply rather than a worker-originated request.
pub const DIGEST_SENTINEL: [u8; HASH_LEN] = [0x15; HASH_LEN];

const OFFSET_HEX_WIDTH: usize = 16; // hex digits needed for a 63-bit offset
const PAYLOAD_LEN: usize = HASH_LEN + 2 + OFFSET_HEX_WIDTH;

/// Decoded contents of one non-empty cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellPayload {
    /// Worker asking the DCP to record `(hash, offset)`.
    WriteRequest { hash: String, offset: u64 },
    /// Worker asking the DCP to resolve `hash` (kv-store backend only).
    ReadRequest { hash: String },
    /// DCP's answer to a read request: `Some(offset)` on hit, `None` on miss.
    Reply { offset: Option<u64> },
}

impl CellPayload {
    /// Encode into the fixed-width on-wire form. Panics if `hash` is not
    /// exactly [`HASH_LEN`] bytes — the one place this invariant is checked.
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let (hash_field, offset) = match self {
            CellPayload::WriteRequest { hash, offset } => {
                assert_eq!(hash.len(), HASH_LEN, "document hash must be {HASH_LEN} hex chars");
                assert_ne!(*offset, OFFSET_SENTINEL, "a real offset never equals the sentinel");
                (hash.as_bytes().to_vec(), *offset)
            }
            CellPayload::ReadRequest { hash } => {
                assert_eq!(hash.len(), HASH_LEN, "document hash must be {HASH_LEN} hex chars");
                (hash.as_bytes().to_vec(), OFFSET_SENTINEL)
            }
            CellPayload::Reply { offset } => (
                DIGEST_SENTINEL.to_vec(),
                offset.unwrap_or(OFFSET_SENTINEL),
            ),
        };

        let mut buf = [0u8; PAYLOAD_LEN];
        buf[..HASH_LEN].copy_from_slice(&hash_field);
        buf[HASH_LEN] = b'0';
        buf[HASH_LEN + 1] = b'x';
        let hex = format!("{offset:0width$x}", width = OFFSET_HEX_WIDTH);
        buf[HASH_LEN + 2..].copy_from_slice(hex.as_bytes());
        buf
    }

    /// Decode a non-empty cell's raw bytes. Returns `None` if the bytes
    /// satisfy neither the worker-request nor the DCP-reply shape — the
    /// caller should log and blank the cell (§ malformed payload handling).
    pub fn decode(buf: &[u8; PAYLOAD_LEN]) -> Option<Self> {
        let hash_field = &buf[..HASH_LEN];
        let marker = buf.get(HASH_LEN..HASH_LEN + 2)?;
        if marker != b"0x" {
            return None;
        }
        let hex = std::str::from_utf8(&buf[HASH_LEN + 2..]).ok()?;
        let offset = u64::from_str_radix(hex, 16).ok()?;

        if hash_field == DIGEST_SENTINEL {
            let offset = if offset == OFFSET_SENTINEL { None } else { Some(offset) };
            return Some(CellPayload::Reply { offset });
        }

        let hash = std::str::from_utf8(hash_field).ok()?;
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let hash = hash.to_string();
        if offset == OFFSET_SENTINEL {
            Some(CellPayload::ReadRequest { hash })
        } else {
            Some(CellPayload::WriteRequest { hash, offset })
        }
    }
}

const EMPTY: u8 = 0;
const OCCUPIED: u8 = 1;

/// One fixed-width cell in a worker's shared-memory region.
#[repr(C, align(64))]
pub struct ShmCell {
    state: AtomicU8,
    payload: UnsafeCell<[u8; PAYLOAD_LEN]>,
}

// SAFETY: `state` is the sole synchronization point; `payload` is only read
// after an Acquire load observes OCCUPIED, and only written before a Release
// store publishes it, mirroring the ordering discipline used elsewhere in
// this crate's shared-memory code.
unsafe impl Send for ShmCell {}
unsafe impl Sync for ShmCell {}

impl ShmCell {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            payload: UnsafeCell::new([0u8; PAYLOAD_LEN]),
        }
    }

    /// Claim this cell if empty and write `payload` into it. Used by a
    /// worker placing a request, never by the DCP.
    pub fn try_claim(&self, payload: &CellPayload) -> bool {
        if self
            .state
            .compare_exchange(EMPTY, OCCUPIED, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // SAFETY: the CAS above gave this call exclusive access to the
        // payload bytes until the Release store below republishes them.
        unsafe {
            *self.payload.get() = payload.encode();
        }
        self.state.store(OCCUPIED, Ordering::Release);
        true
    }

    /// Non-destructively inspect an occupied cell.
    pub fn peek(&self) -> Option<CellPayload> {
        if self.state.load(Ordering::Acquire) != OCCUPIED {
            return None;
        }
        // SAFETY: Acquire above synchronizes with the Release that published
        // these bytes (from try_claim or overwrite_reply).
        let buf = unsafe { *self.payload.get() };
        Some(CellPayload::decode(&buf).unwrap_or_else(|| {
            // Malformed payload: represent as a reply-miss so the caller's
            // generic handling blanks the cell; true malformed-payload
            // handling lives in the DCP servicing loop, which calls
            // `peek_raw` instead when it needs to distinguish this case.
            CellPayload::Reply { offset: None }
        }))
    }

    /// Like [`Self::peek`] but surfaces malformed bytes instead of masking
    /// them, for the DCP's "log and blank" failure path.
    pub fn peek_raw(&self) -> Option<Result<CellPayload, ()>> {
        if self.state.load(Ordering::Acquire) != OCCUPIED {
            return None;
        }
        let buf = unsafe { *self.payload.get() };
        Some(CellPayload::decode(&buf).ok_or(()))
    }

    /// Overwrite an occupied cell's content (DCP answering a read request)
    /// without releasing ownership back to the worker.
    pub fn overwrite(&self, payload: &CellPayload) {
        debug_assert_eq!(self.state.load(Ordering::Acquire), OCCUPIED);
        // SAFETY: only the DCP calls this, and only on a cell it has just
        // observed occupied; no worker writes until the cell is cleared.
        unsafe {
            *self.payload.get() = payload.encode();
        }
        self.state.store(OCCUPIED, Ordering::Release);
    }

    /// Release this cell back to "empty", allowing a worker to claim it
    /// again. Used by the DCP after consuming a write request, and by the
    /// worker after consuming a reply.
    pub fn clear(&self) {
        self.state.store(EMPTY, Ordering::Release);
    }

    pub fn is_occupied(&self) -> bool {
        self.state.load(Ordering::Acquire) == OCCUPIED
    }
}

impl Default for ShmCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte size of one cell, including alignment padding. Used to size a
/// worker's region.
pub const CELL_SIZE: usize = std::mem::size_of::<ShmCell>();
