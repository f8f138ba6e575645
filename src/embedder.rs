use std::sync::Mutex;

use model2vec_rs::model::StaticModel;
use tracing::info;

use crate::error::{Error, Result};

/// Boundary around the neural embedding component: a fixed output dimension
/// plus single and batched encode. Encode is synchronous CPU work; callers
/// must not hold retriever locks across it unless they own the critical
/// section anyway.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    fn encode(&self, text: &str) -> Vec<f32>;
    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<f32>>;
}

/// Model2Vec-RS static embeddings, downloaded from the HuggingFace Hub via
/// hf-hub on first use (no ONNX runtime). The backend is not guaranteed
/// reentrant, so encode calls are serialized behind a mutex — initialized at
/// process start and shared by reference for the process lifetime.
pub struct StaticModelEmbedder {
    model: Mutex<StaticModel>,
    dimension: usize,
    max_seq_len: Option<usize>,
    batch_size: usize,
}

impl StaticModelEmbedder {
    pub fn load(model_id: &str, max_seq_len: Option<usize>, batch_size: usize) -> Result<Self> {
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| Error::Model(format!("{model_id}: {e}")))?;

        // Probe the output dimension once; every later encode must match it.
        let dimension = model.encode_single("dimension probe").len();
        if dimension == 0 {
            return Err(Error::Model(format!("{model_id}: empty embedding output")));
        }
        info!(model = model_id, dimension, "embedding model ready");

        Ok(Self {
            model: Mutex::new(model),
            dimension,
            max_seq_len,
            batch_size: batch_size.max(1),
        })
    }
}

impl Embedder for StaticModelEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        model.encode_single(text)
    }

    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        let model = self.model.lock().unwrap_or_else(|e| e.into_inner());
        model.encode_with_args(texts, self.max_seq_len, self.batch_size)
    }
}
