//! Index store abstraction.
//!
//! Inverts the cyclic dependency the original implementation has between
//! its orchestrator and commit-process modules: the orchestrator (and the
//! worker-side read-only client) depend only on this trait, and the DCP
//! owns the concrete backend that implements it.

use crate::error::IndexError;

/// A persistent `documentHash -> offset` mapping, backed by either a
/// transactional row store or a key-value log-structured store.
pub trait IndexStore: Send {
    /// Create the backing schema/table if it does not already exist.
    fn create_schema(&mut self) -> Result<(), IndexError>;

    /// Record `hash -> offset`. Implementations buffer writes and flush
    /// periodically rather than committing every call.
    fn insert_offset(&mut self, hash: &str, offset: u64) -> Result<(), IndexError>;

    /// Look up `hash`. `Ok(None)` means the key is absent, not an error.
    fn read_offset(&self, hash: &str) -> Result<Option<u64>, IndexError>;

    /// Force any buffered writes to become durable.
    fn flush(&mut self) -> Result<(), IndexError>;

    /// Number of rows currently stored. Used by tests and diagnostics.
    fn count(&self) -> Result<u64, IndexError>;

    /// Whether a second, independent read-only handle to this backend can
    /// be opened so workers may bypass the DCP for reads (§9 open question:
    /// this design preserves that bypass for the transactional row store).
    fn supports_direct_read(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory `IndexStore` used to exercise the DCP and cache-client
    /// logic without touching a real backend.
    #[derive(Default)]
    pub struct MemoryIndexStore {
        rows: Mutex<HashMap<String, u64>>,
    }

    impl IndexStore for MemoryIndexStore {
        fn create_schema(&mut self) -> Result<(), IndexError> {
            Ok(())
        }

        fn insert_offset(&mut self, hash: &str, offset: u64) -> Result<(), IndexError> {
            self.rows.lock().unwrap().insert(hash.to_string(), offset);
            Ok(())
        }

        fn read_offset(&self, hash: &str) -> Result<Option<u64>, IndexError> {
            Ok(self.rows.lock().unwrap().get(hash).copied())
        }

        fn flush(&mut self) -> Result<(), IndexError> {
            Ok(())
        }

        fn count(&self) -> Result<u64, IndexError> {
            Ok(self.rows.lock().unwrap().len() as u64)
        }

        fn supports_direct_read(&self) -> bool {
            true
        }
    }
}
