//! The neural embedding computation is an external collaborator (§1
//! Out-of-scope): this module only defines the boundary trait and a
//! deterministic stand-in implementation so the rest of the crate is
//! buildable and testable without a model runtime.

/// `document -> vector<f32, D>`. Implementations must be deterministic: the
/// same document always encodes to the same vector (Testable Properties,
/// round-trip/idempotence).
pub trait EmbeddingModel: Send + Sync {
    fn dimension(&self) -> usize;
    fn encode(&self, document: &str) -> Vec<f32>;
}

/// Hashes the document into `dimension` floats. Not a real embedding model;
/// exists so the cache coordination logic this crate is about can be built
/// and tested independently of any specific embedding library.
pub struct DeterministicModel {
    dimension: usize,
}

impl DeterministicModel {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingModel for DeterministicModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, document: &str) -> Vec<f32> {
        use sha2::{Digest, Sha256};

        let mut out = Vec::with_capacity(self.dimension);
        let mut counter: u64 = 0;
        while out.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(document.as_bytes());
            hasher.update(counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if out.len() == self.dimension {
                    break;
                }
                let bits = u32::from_le_bytes(chunk.try_into().unwrap());
                // Map into [-1.0, 1.0) so the deterministic vectors aren't
                // just raw integer noise when someone eyeballs them.
                out.push((bits as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_to_requested_dimension() {
        let model = DeterministicModel::new(512);
        assert_eq!(model.encode("hello").len(), 512);
    }

    #[test]
    fn is_deterministic() {
        let model = DeterministicModel::new(8);
        assert_eq!(model.encode("hello"), model.encode("hello"));
    }

    #[test]
    fn distinct_documents_differ() {
        let model = DeterministicModel::new(8);
        assert_ne!(model.encode("hello"), model.encode("world"));
    }
}
