//! Typed error enums for each subsystem, converted to [`anyhow::Error`] at
//! service boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm_open failed for {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ftruncate failed for {name}: {source}")]
    Truncate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("mmap failed for {name}: {source}")]
    Map {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("segment {0} does not exist")]
    NotFound(String),

    #[error("invalid segment name: {0}")]
    InvalidName(String),

    #[error("malformed cell payload: {0}")]
    MalformedPayload(String),

    #[error("handshake with worker {pid} timed out after {secs}s")]
    HandshakeTimeout { pid: u32, secs: u64 },

    #[error("worker identity publication timed out after {secs}s")]
    WorkerPublishTimeout { secs: u64 },

    #[error("no reply for read request on hash {hash} within {secs}s")]
    ReplyTimeout { hash: String, secs: u64 },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to open index backend at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("index read failed: {0}")]
    Read(anyhow::Error),

    #[error("index write failed: {0}")]
    Write(anyhow::Error),

    #[error("index flush failed: {0}")]
    Flush(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("failed to acquire lock for model {model} within {secs}s")]
    LockTimeout { model: String, secs: u64 },

    #[error("blob I/O error for model {model}: {source}")]
    Io {
        model: String,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {offset} is not a multiple of record size {record_size} for model {model}")]
    Misaligned {
        model: String,
        offset: u64,
        record_size: u64,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("failed to read catalog file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
