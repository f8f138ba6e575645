use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use tracing::{debug, info, warn};

use crate::chunker::{chunk_text, Chunk};
use crate::config::{ChunkConfig, VectorConfig};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::types::{preview, Document, SearchOrigin, SearchResult};

pub const RETRIEVER_NAME: &str = "vector";

const TABLE_NAME: &str = "doc_chunks";

/// Chunked-embedding retriever over an embedded LanceDB table with columns
/// {doc_id, chunk_id, text, vector[D]}. The store persists autonomously;
/// `save` is a no-op and `load` re-opens the table.
pub struct VectorRetriever {
    db_dir: PathBuf,
    embedder: Arc<dyn Embedder>,
    chunk_cfg: ChunkConfig,
    cfg: VectorConfig,
    table: Option<lancedb::Table>,
    /// doc-id → chunk row count, maintained alongside the table so doc counts
    /// and membership checks don't need a table scan per call.
    doc_chunks: HashMap<String, usize>,
}

impl VectorRetriever {
    pub fn new(
        db_dir: PathBuf,
        embedder: Arc<dyn Embedder>,
        chunk_cfg: ChunkConfig,
        cfg: VectorConfig,
    ) -> Self {
        Self {
            db_dir,
            embedder,
            chunk_cfg,
            cfg,
            table: None,
            doc_chunks: HashMap::new(),
        }
    }

    /// Open the table, creating it with the declared schema when missing, and
    /// rebuild the per-doc row counts. Previous state is only replaced once
    /// everything succeeded.
    pub async fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.db_dir)?;
        let db = lancedb::connect(self.db_dir.to_string_lossy().as_ref())
            .execute()
            .await?;

        let table = match db.open_table(TABLE_NAME).execute().await {
            Ok(t) => t,
            Err(_) => {
                let schema = Arc::new(self.table_schema());
                db.create_empty_table(TABLE_NAME, schema).execute().await?
            }
        };
        let doc_chunks = self.scan_doc_chunks(&table).await?;

        info!(
            docs = doc_chunks.len(),
            db = %self.db_dir.display(),
            "vector table ready"
        );
        self.doc_chunks = doc_chunks;
        self.table = Some(table);
        Ok(())
    }

    fn table_schema(&self) -> Schema {
        let dim = self.embedder.dimension() as i32;
        Schema::new(vec![
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("chunk_id", DataType::Int64, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, false)), dim),
                false,
            ),
        ])
    }

    fn table(&self) -> Result<lancedb::Table> {
        self.table.clone().ok_or_else(|| Error::Load {
            path: self.db_dir.clone(),
            reason: "vector table not initialized".to_string(),
        })
    }

    async fn scan_doc_chunks(&self, table: &lancedb::Table) -> Result<HashMap<String, usize>> {
        let mut out: HashMap<String, usize> = HashMap::new();
        let mut stream = table.query().execute().await?;
        while let Some(batch) = stream.try_next().await.map_err(|e| self.stream_error(e))? {
            let Some(ids) = col_str(&batch, "doc_id") else {
                continue;
            };
            for i in 0..ids.len() {
                if ids.is_valid(i) {
                    *out.entry(ids.value(i).to_string()).or_insert(0) += 1;
                }
            }
        }
        Ok(out)
    }

    fn stream_error(&self, e: impl std::fmt::Display) -> Error {
        Error::Load {
            path: self.db_dir.clone(),
            reason: e.to_string(),
        }
    }

    pub fn document_count(&self) -> usize {
        self.doc_chunks.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.doc_chunks.values().sum()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.doc_chunks.contains_key(doc_id)
    }

    /// Delete-then-insert for the whole document: any existing rows for the
    /// doc-id go first, then every chunk is batch-encoded and inserted.
    /// Partial inserts on failure are possible; the next ingest of the same
    /// path converges the state.
    pub async fn add(&mut self, doc: &Document) -> Result<()> {
        let table = self.table()?;
        self.delete_rows(&doc.doc_id).await?;

        let chunks = chunk_text(&doc.text, &self.chunk_cfg);
        if chunks.is_empty() {
            return Err(Error::NoChunks(doc.doc_id.clone()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.encode_batch(&texts);
        let reader = self.chunk_batch_reader(&doc.doc_id, &chunks, &vectors)?;
        table.add(reader).execute().await?;

        self.doc_chunks.insert(doc.doc_id.clone(), chunks.len());
        debug!(doc = %doc.doc_id, chunks = chunks.len(), "vector document indexed");
        Ok(())
    }

    /// Delete all rows for the doc-id; returns whether any row was removed,
    /// determined by comparing row counts.
    pub async fn remove(&mut self, doc_id: &str) -> Result<bool> {
        let removed = self.delete_rows(doc_id).await?;
        if removed {
            debug!(doc = doc_id, "vector document removed");
        }
        Ok(removed)
    }

    async fn delete_rows(&mut self, doc_id: &str) -> Result<bool> {
        let table = self.table()?;
        let before = table.count_rows(None).await?;
        let predicate = format!("doc_id = '{}'", doc_id.replace('\'', "''"));
        table.delete(&predicate).await?;
        let after = table.count_rows(None).await?;

        let removed = before.saturating_sub(after) > 0;
        if removed {
            self.doc_chunks.remove(doc_id);
        }
        Ok(removed)
    }

    /// Approximate-nearest-neighbor search: fetch up to 2k chunk rows, convert
    /// raw distances to similarities per the configured metric, keep the best
    /// chunk per doc-id, and return the top k by similarity.
    pub async fn search(&mut self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let table = self.table()?;
        let query_vector = self.embedder.encode(query);

        let fetch = k * 2;
        let mut stream = table
            .vector_search(query_vector)?
            .column("vector")
            .distance_type(self.cfg.distance_metric.to_lance())
            .limit(fetch)
            .execute()
            .await?;

        let mut best: HashMap<String, (f32, String)> = HashMap::new();
        while let Some(batch) = stream.try_next().await.map_err(|e| self.stream_error(e))? {
            let (Some(ids), Some(texts), Some(distances)) = (
                col_str(&batch, "doc_id"),
                col_str(&batch, "text"),
                col_f32(&batch, "_distance"),
            ) else {
                warn!("vector search batch missing expected columns");
                continue;
            };

            for i in 0..ids.len() {
                if !ids.is_valid(i) || !distances.is_valid(i) {
                    continue;
                }
                let similarity = self.cfg.distance_metric.similarity(distances.value(i));
                if similarity < self.cfg.min_similarity {
                    continue;
                }
                let text = if texts.is_valid(i) {
                    texts.value(i).to_string()
                } else {
                    String::new()
                };
                match best.entry(ids.value(i).to_string()) {
                    Entry::Occupied(mut slot) => {
                        if similarity > slot.get().0 {
                            slot.insert((similarity, text));
                        }
                    }
                    Entry::Vacant(slot) => {
                        slot.insert((similarity, text));
                    }
                }
            }
        }

        let mut results: Vec<SearchResult> = best
            .into_iter()
            .map(|(doc_id, (score, text))| {
                let path = PathBuf::from(&doc_id);
                SearchResult::new(doc_id, path, preview(&text), score, SearchOrigin::Vector)
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        results.truncate(k);
        Ok(results)
    }

    /// LanceDB persists autonomously; there is nothing to flush.
    pub async fn save(&self) -> Result<()> {
        debug!("vector store persists autonomously");
        Ok(())
    }

    /// Re-open the table (used for cross-process reload).
    pub async fn load(&mut self) -> Result<()> {
        self.initialize().await
    }

    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "retriever": RETRIEVER_NAME,
            "document_count": self.document_count(),
            "chunk_count": self.chunk_count(),
            "has_table": self.table.is_some(),
            "embedding_dimension": self.embedder.dimension(),
            "distance_metric": self.cfg.distance_metric.as_str(),
            "similarity_threshold": self.cfg.min_similarity,
            "db_path": self.db_dir,
        })
    }

    fn chunk_batch_reader(
        &self,
        doc_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
    ) -> Result<Box<dyn arrow_array::RecordBatchReader + Send>> {
        if chunks.len() != vectors.len() {
            return Err(Error::Model(format!(
                "{doc_id}: {} chunks but {} embeddings",
                chunks.len(),
                vectors.len()
            )));
        }

        let dim = self.embedder.dimension();
        let mut flat: Vec<f32> = Vec::with_capacity(chunks.len() * dim);
        for v in vectors {
            if v.len() != dim {
                // Dimension drift is a programming error in the embedder
                // contract, not a recoverable per-doc condition.
                return Err(Error::Model(format!(
                    "{doc_id}: embedding dimension {} does not match model dimension {dim}",
                    v.len()
                )));
            }
            flat.extend_from_slice(v);
        }

        let ids: ArrayRef = Arc::new(StringArray::from(vec![doc_id; chunks.len()]));
        let ordinals: ArrayRef = Arc::new(Int64Array::from(
            chunks.iter().map(|c| c.ordinal as i64).collect::<Vec<_>>(),
        ));
        let texts: ArrayRef = Arc::new(StringArray::from(
            chunks.iter().map(|c| c.text.clone()).collect::<Vec<_>>(),
        ));

        let values: ArrayRef = Arc::new(Float32Array::from(flat));
        let item_field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_arr: ArrayRef = Arc::new(FixedSizeListArray::try_new(
            item_field,
            dim as i32,
            values,
            None,
        )?);

        let schema = Arc::new(self.table_schema());
        let batch = RecordBatch::try_new(schema.clone(), vec![ids, ordinals, texts, vector_arr])?;
        Ok(Box::new(RecordBatchIterator::new(
            vec![Ok(batch)].into_iter(),
            schema,
        )))
    }
}

fn col_str<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch.column_by_name(name)?.as_any().downcast_ref::<StringArray>()
}

fn col_f32<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a Float32Array> {
    batch.column_by_name(name)?.as_any().downcast_ref::<Float32Array>()
}
