//! Embedding orchestrator: per-worker façade that hashes the document,
//! consults the cache client for an existing offset, reads the blob on a
//! hit, or returns a freshly computed vector plus a deferred write on a
//! miss.

use crate::blob::BlobStore;
use crate::catalog::Catalog;
use crate::client::{CacheClient, WriteOutcome};
use crate::config::Config;
use crate::embedding_model::{DeterministicModel, EmbeddingModel};
use crate::error::{BlobError, CatalogError};
use crate::hash::hash_document;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Work deferred until after the HTTP response has been sent, so a cache
/// miss's latency is not inflated by blob-file I/O.
pub struct DeferredWrite {
    pub vector: Vec<f32>,
    pub hash: String,
    pub model_name: String,
}

pub struct Orchestrator {
    config: Config,
    catalog: Catalog,
    client: CacheClient,
    blobs: Mutex<HashMap<String, BlobStore>>,
}

impl Orchestrator {
    pub fn new(config: Config, catalog: Catalog, client: CacheClient) -> Self {
        Self {
            config,
            catalog,
            client,
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn blob_store(&self, model_name: &str, dimension: usize) -> std::io::Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        if !blobs.contains_key(model_name) {
            let model_dir = self.config.model_dir(model_name);
            let lock_dir = std::env::temp_dir().join("embeddingService");
            let store = BlobStore::new(&model_dir, &lock_dir, model_name, dimension)?;
            blobs.insert(model_name.to_string(), store);
        }
        Ok(())
    }

    /// Returns the vector and, on a cache miss, the write that the caller
    /// should schedule after the response has been flushed.
    pub fn get_embeddings(
        &self,
        document: &str,
        model_name: &str,
        read_cache: bool,
    ) -> Result<(Vec<f32>, Option<DeferredWrite>), CatalogError> {
        let entry = self
            .catalog
            .get(model_name)
            .ok_or_else(|| CatalogError::UnknownModel(model_name.to_string()))?
            .clone();

        let hash = hash_document(document);

        if read_cache {
            if let Ok(Some(offset)) = self.client.read_offset(&hash) {
                if self.blob_store(model_name, entry.dimension).is_ok() {
                    let blobs = self.blobs.lock().unwrap();
                    if let Some(store) = blobs.get(model_name) {
                        match store.read_at(offset) {
                            Ok(vector) => return Ok((vector, None)),
                            Err(e) => warn!(%hash, model = model_name, error = %e, "cache hit but blob read failed, recomputing"),
                        }
                    }
                }
            }
        }

        let model = DeterministicModel::new(entry.dimension);
        let vector = model.encode(document);

        Ok((
            vector.clone(),
            Some(DeferredWrite {
                vector,
                hash,
                model_name: model_name.to_string(),
            }),
        ))
    }

    /// Append the vector to the model's blob, then enqueue the resulting
    /// offset to the DCP. Blob write strictly precedes the index send.
    pub fn write_embeddings(&self, deferred: DeferredWrite) -> Result<WriteOutcome, BlobError> {
        let dimension = deferred.vector.len();
        self.blob_store(&deferred.model_name, dimension)
            .map_err(|source| BlobError::Io {
                model: deferred.model_name.clone(),
                source,
            })?;

        let offset = {
            let blobs = self.blobs.lock().unwrap();
            let store = blobs.get(&deferred.model_name).expect("just inserted above");
            store.append(&deferred.vector)?
        };

        Ok(self.client.write_offset(&deferred.hash, offset))
    }

    pub fn read_blob(&self, model_name: &str, offset: u64, dimension: usize) -> Result<Vec<f32>, BlobError> {
        self.blob_store(model_name, dimension)
            .map_err(|source| BlobError::Io {
                model: model_name.to_string(),
                source,
            })?;
        let blobs = self.blobs.lock().unwrap();
        blobs.get(model_name).expect("just inserted above").read_at(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcp::DatabaseCommitProcess;
    use crate::index::store::test_support::MemoryIndexStore;
    use crate::shm::channel::{WorkerRegion, DEFAULT_NUM_CELLS};
    use std::time::Duration;
    use tempfile::tempdir;

    fn unique_pid(tag: u32) -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        (nanos % 100_000) as u32 * 10 + tag
    }

    /// Built without a live DCP, for tests that never exercise a read/write
    /// round trip (the cold-miss-only and unknown-model cases below).
    fn test_client(tag: u32) -> CacheClient {
        let pid = unique_pid(tag);
        let region = WorkerRegion::create(pid, DEFAULT_NUM_CELLS).unwrap();
        for cell in region.cells() {
            cell.clear();
        }
        CacheClient::new_for_test(pid, region, None)
    }

    #[test]
    fn cold_miss_then_warm_hit() {
        let dir = tempdir().unwrap();
        let config = Config::builder().data_dir(dir.path()).build();
        let catalog = Catalog::parse("m 8 1\n");
        let pid = unique_pid(1);

        // A real DCP answers the read/write round trip over shared memory,
        // so the "warm hit" path genuinely resolves through the index
        // instead of a client with nothing on the other end.
        let dcp = DatabaseCommitProcess::start(MemoryIndexStore::default(), vec![pid], DEFAULT_NUM_CELLS, 10).unwrap();
        let client = CacheClient::attach(pid, None).unwrap();
        let orch = Orchestrator::new(config, catalog, client);

        let (v1, deferred) = orch.get_embeddings("hello", "m", true).unwrap();
        assert_eq!(v1.len(), 8);
        let deferred = deferred.expect("cold miss must defer a write");
        orch.write_embeddings(deferred).unwrap();

        // Give the servicing thread time to apply the write before the
        // second lookup is issued.
        std::thread::sleep(Duration::from_millis(100));

        let (v2, deferred2) = orch.get_embeddings("hello", "m", true).unwrap();
        assert!(deferred2.is_none(), "warm hit must not defer a write");
        assert_eq!(v1, v2);

        dcp.shutdown();
    }

    #[test]
    fn unknown_model_is_rejected() {
        let dir = tempdir().unwrap();
        let config = Config::builder().data_dir(dir.path()).build();
        let catalog = Catalog::new();
        let client = test_client(2);
        let pid = client.worker_pid();
        let orch = Orchestrator::new(config, catalog, client);

        let err = orch.get_embeddings("x", "nope", true).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownModel(ref m) if m == "nope"));

        WorkerRegion::unlink(pid).ok();
    }
}
