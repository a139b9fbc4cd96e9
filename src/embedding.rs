//! Embedding provider boundary.
//!
//! The core treats embeddings as an external service: a backend turns a batch
//! of strings into unit-norm vectors of a fixed dimension. The production
//! backend wraps fastembed (ONNX Runtime); tests use the deterministic mock.

use crate::error::{PmlError, Result};

/// Backend interface for embedding generation (allows mocking in tests).
///
/// Implementations must be deterministic: identical input text yields the
/// same vector within numerical tolerance. Returned vectors are
/// L2-normalized.
pub trait EmbeddingBackend: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        self.embed_batch(std::slice::from_ref(&input.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| PmlError::internal("embedding backend returned no vector"))
    }
}

/// Deterministic embedding backend for tests.
pub struct MockEmbeddingBackend {
    dimension: usize,
    generator: std::sync::Arc<dyn Fn(&str) -> Vec<f32> + Send + Sync>,
}

impl MockEmbeddingBackend {
    pub fn new<F>(dimension: usize, generator: F) -> Self
    where
        F: Fn(&str) -> Vec<f32> + Send + Sync + 'static,
    {
        Self {
            dimension,
            generator: std::sync::Arc::new(generator),
        }
    }

    /// Mock that derives a pseudo-random but stable vector from the text
    /// bytes. Distinct texts land far apart, repeated texts are identical.
    pub fn hashed(dimension: usize) -> Self {
        Self::new(dimension, move |text| {
            let mut state: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in text.bytes() {
                state ^= u64::from(byte);
                state = state.wrapping_mul(0x0000_0100_0000_01b3);
            }
            (0..dimension)
                .map(|i| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state = state.wrapping_add(i as u64);
                    ((state >> 11) as f32 / (1u64 << 53) as f32) - 0.5
                })
                .collect()
        })
    }
}

impl EmbeddingBackend for MockEmbeddingBackend {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(inputs.len());
        for text in inputs {
            let vector = (self.generator)(text);
            if vector.len() != self.dimension {
                return Err(PmlError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            results.push(memvdb::normalize(&vector));
        }
        Ok(results)
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_backend::FastembedBackend;

#[cfg(feature = "embeddings")]
mod fastembed_backend {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use parking_lot::Mutex;
    use std::path::Path;

    /// fastembed-backed production encoder (BGE large, 1024-dim).
    pub struct FastembedBackend {
        embedder: Mutex<TextEmbedding>,
        dimension: usize,
    }

    impl FastembedBackend {
        pub fn new(model_cache: Option<&Path>) -> Result<Self> {
            let mut options = InitOptions::new(EmbeddingModel::BGELargeENV15)
                .with_show_download_progress(true);
            if let Some(dir) = model_cache {
                options = options.with_cache_dir(dir.to_path_buf());
            }
            let embedder = TextEmbedding::try_new(options).map_err(|e| {
                PmlError::internal(format!("failed to initialize fastembed: {e}"))
            })?;
            Ok(Self {
                embedder: Mutex::new(embedder),
                dimension: 1024,
            })
        }
    }

    impl EmbeddingBackend for FastembedBackend {
        fn dimension(&self) -> usize {
            self.dimension
        }

        fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            let vectors = self
                .embedder
                .lock()
                .embed(inputs.to_vec(), None)
                .map_err(|e| PmlError::internal(format!("embedding generation failed: {e}")))?;
            Ok(vectors.iter().map(|v| memvdb::normalize(v)).collect())
        }
    }
}
