//! Shared-memory transport between request workers and the database commit
//! process: named POSIX segments ([`segment`]) holding arrays of fixed-width
//! ownership cells ([`slot`]), addressed through a per-worker naming and
//! handshake convention ([`channel`]).

pub mod channel;
pub mod segment;
pub mod slot;

pub use channel::{
    region_name, wait_for_handshake_acks, HandshakeDescriptor, HandshakeRegion, WorkerRegion,
    DEFAULT_NUM_CELLS,
};
pub use segment::{cleanup_stale_segments, ShmSegment};
pub use slot::{CellPayload, ShmCell, DIGEST_SENTINEL, OFFSET_SENTINEL};
