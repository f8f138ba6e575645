use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde_json::json;
use tracing::debug;

use crate::config::SearchConfig;
use crate::types::{RetrievalResult, SearchOrigin, SearchResult};

/// Reciprocal Rank Fusion over per-retriever ranked lists:
///
///   S(d) = Σ_i w_i / (k + rank_i(d)),   rank starting at 1
///
/// Weights are optionally normalized to sum to 1, each list contributes at
/// most `max_input` entries, fused scores below `min_score` are discarded,
/// and equal scores order by ascending doc-id so the output is deterministic.
#[derive(Debug, Clone)]
pub struct RrfReranker {
    k: f32,
    normalize_weights: bool,
    min_score: f32,
    max_input: usize,
}

impl RrfReranker {
    pub fn new(k: f32, normalize_weights: bool, min_score: f32, max_input: usize) -> Self {
        Self {
            k,
            normalize_weights,
            min_score,
            max_input,
        }
    }

    pub fn from_config(cfg: &SearchConfig) -> Self {
        Self::new(cfg.rrf_k, cfg.normalize_weights, cfg.rrf_min_score, cfg.max_input)
    }

    pub fn rerank(&self, inputs: &[RetrievalResult], k: usize) -> Vec<SearchResult> {
        if inputs.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut weights: Vec<f32> = inputs.iter().map(|r| r.weight).collect();
        if self.normalize_weights {
            let total: f32 = weights.iter().sum();
            if total > 0.0 {
                for w in &mut weights {
                    *w /= total;
                }
            }
        }

        // Fused score per doc, plus the best-ranked source hit to carry the
        // snippet and pre-fusion score from.
        let mut scores: HashMap<&str, f32> = HashMap::new();
        let mut best_source: HashMap<&str, (usize, &SearchResult)> = HashMap::new();

        for (input, weight) in inputs.iter().zip(&weights) {
            debug!(
                retriever = input.retriever_name,
                results = input.results.len(),
                weight = %weight,
                "fusing ranked list"
            );
            for (i, result) in input.results.iter().take(self.max_input).enumerate() {
                let rank = (i + 1) as f32;
                *scores.entry(result.doc_id.as_str()).or_insert(0.0) += weight / (self.k + rank);

                match best_source.entry(result.doc_id.as_str()) {
                    Entry::Occupied(mut slot) => {
                        if i < slot.get().0 {
                            slot.insert((i, result));
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert((i, result));
                    }
                }
            }
        }

        let mut fused: Vec<SearchResult> = scores
            .into_iter()
            .filter(|(_, score)| *score >= self.min_score)
            .filter_map(|(doc_id, score)| {
                let (_, source) = best_source.get(doc_id)?;
                let mut out = SearchResult::new(
                    source.doc_id.clone(),
                    source.path.clone(),
                    source.snippet.clone(),
                    score,
                    SearchOrigin::Fused,
                );
                out.metadata = source.metadata.clone();
                out.metadata
                    .insert("original_score".to_string(), json!(source.score));
                out.metadata
                    .insert("original_origin".to_string(), json!(source.origin));
                Some(out)
            })
            .collect();

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        fused.truncate(k);
        fused
    }

    /// Break down one document's fused score into per-retriever contributions:
    /// the debugging counterpart of `rerank`.
    pub fn explain(&self, doc_id: &str, inputs: &[RetrievalResult]) -> serde_json::Value {
        let mut weights: Vec<f32> = inputs.iter().map(|r| r.weight).collect();
        if self.normalize_weights {
            let total: f32 = weights.iter().sum();
            if total > 0.0 {
                for w in &mut weights {
                    *w /= total;
                }
            }
        }

        let mut total_score = 0.0f32;
        let mut contributions = Vec::new();
        let mut not_found_in = Vec::new();

        for (input, weight) in inputs.iter().zip(&weights) {
            let position = input
                .results
                .iter()
                .take(self.max_input)
                .position(|r| r.doc_id == doc_id);
            match position {
                Some(i) => {
                    let rank = i + 1;
                    let contribution = weight / (self.k + rank as f32);
                    total_score += contribution;
                    contributions.push(json!({
                        "retriever": input.retriever_name,
                        "rank": rank,
                        "weight": weight,
                        "k": self.k,
                        "contribution": contribution,
                        "original_score": input.results[i].score,
                    }));
                }
                None => not_found_in.push(input.retriever_name),
            }
        }

        json!({
            "doc_id": doc_id,
            "total_rrf_score": total_score,
            "contributions": contributions,
            "not_found_in": not_found_in,
        })
    }
}
