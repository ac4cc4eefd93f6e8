//! Append-only per-model blob file: packed little-endian float32 vectors,
//! indexed by byte offset.

use crate::error::BlobError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::warn;

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(59);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pack a vector of floats as little-endian bytes, 4 bytes per element.
pub fn serialize_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian float32 bytes back into a vector.
pub fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunks_exact(4) yields 4 bytes")))
        .collect()
}

/// Handle to one model's append-only blob file plus its lock directory.
pub struct BlobStore {
    model: String,
    blob_path: PathBuf,
    lock_path: PathBuf,
    dimension: usize,
}

impl BlobStore {
    pub fn new(model_dir: impl AsRef<Path>, lock_dir: impl AsRef<Path>, model: &str, dimension: usize) -> std::io::Result<Self> {
        let model_dir = model_dir.as_ref();
        fs::create_dir_all(model_dir)?;
        let lock_dir = lock_dir.as_ref();
        fs::create_dir_all(lock_dir)?;

        let blob_path = model_dir.join("embeddings.bin");
        if !blob_path.exists() {
            File::create(&blob_path)?;
        }

        let lock_path = lock_dir.join(format!("{model}.lock"));

        Ok(Self {
            model: model.to_string(),
            blob_path,
            lock_path,
            dimension,
        })
    }

    /// Record byte size of one packed vector for this model.
    pub fn record_size(&self) -> u64 {
        4 * self.dimension as u64
    }

    /// Append a vector under the model's exclusive lock and return the
    /// pre-append offset. Blob-write happens strictly before the caller is
    /// expected to enqueue the offset to the index.
    pub fn append(&self, vector: &[f32]) -> Result<u64, BlobError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| BlobError::Io {
                model: self.model.clone(),
                source,
            })?;

        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_POLL_INTERVAL),
                Err(_) => {
                    return Err(BlobError::LockTimeout {
                        model: self.model.clone(),
                        secs: LOCK_ACQUIRE_TIMEOUT.as_secs(),
                    })
                }
            }
        }

        let result = self.append_locked(vector);
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn append_locked(&self, vector: &[f32]) -> Result<u64, BlobError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.blob_path)
            .map_err(|source| BlobError::Io {
                model: self.model.clone(),
                source,
            })?;

        // `O_APPEND` only repositions to EOF during a write() syscall, not at
        // open() time, so a freshly opened handle's stream position is 0
        // regardless of the file's real length. Seek explicitly.
        let offset = file.seek(SeekFrom::End(0)).map_err(|source| BlobError::Io {
            model: self.model.clone(),
            source,
        })?;

        if offset % self.record_size() != 0 {
            warn!(model = %self.model, offset, "blob length misaligned with record size before append");
            return Err(BlobError::Misaligned {
                model: self.model.clone(),
                offset,
                record_size: self.record_size(),
            });
        }

        let packed = serialize_embedding(vector);
        file.write_all(&packed).map_err(|source| BlobError::Io {
            model: self.model.clone(),
            source,
        })?;

        Ok(offset)
    }

    /// Read exactly `dimension` floats starting at `offset`.
    pub fn read_at(&self, offset: u64) -> Result<Vec<f32>, BlobError> {
        let mut file = File::open(&self.blob_path).map_err(|source| BlobError::Io {
            model: self.model.clone(),
            source,
        })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|source| BlobError::Io {
                model: self.model.clone(),
                source,
            })?;

        let mut buf = vec![0u8; self.record_size() as usize];
        file.read_exact(&mut buf).map_err(|source| BlobError::Io {
            model: self.model.clone(),
            source,
        })?;

        Ok(deserialize_embedding(&buf))
    }

    pub fn len_bytes(&self) -> std::io::Result<u64> {
        Ok(fs::metadata(&self.blob_path)?.len())
    }
}
