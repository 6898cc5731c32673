//! In-memory semantic document index over the encoder, with JSON sidecar
//! persistence.
//!
//! Not safe for concurrent mutation; concurrent reads are fine once the
//! vector cache has been built.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::SemanticEncoder;
use crate::tensor::Tensor;
use crate::tokenizer;

const PREVIEW_CHARS: usize = 200;
const COSINE_EPS: f32 = 1e-8;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub doc_id: String,
    pub title: String,
    pub content_preview: String,
    pub score: f32,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug)]
pub struct IndexStats {
    pub num_documents: usize,
    pub embedding_dim: usize,
    pub index_built: bool,
}

/// Normalized embedding matrix cache for brute-force scans. Invalidated by
/// every mutation and by load.
struct BuiltIndex {
    ids: Vec<String>,
    rows: Vec<Vec<f32>>,
}

pub struct SemanticIndex {
    encoder: SemanticEncoder,
    documents: BTreeMap<String, Document>,
    embeddings: BTreeMap<String, Vec<f32>>,
    built: Option<BuiltIndex>,
}

impl SemanticIndex {
    pub fn new(encoder: SemanticEncoder) -> Self {
        Self {
            encoder,
            documents: BTreeMap::new(),
            embeddings: BTreeMap::new(),
            built: None,
        }
    }

    pub fn encoder(&self) -> &SemanticEncoder {
        &self.encoder
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn encode_text(&self, text: &str) -> Result<Vec<f32>> {
        let cfg = self.encoder.config();
        let tokens = tokenizer::tokenize(text, cfg.vocab_size, cfg.max_seq_length);
        let emb = self.encoder.encode(&[tokens])?;
        Ok(emb.as_f32()?.to_vec())
    }

    /// Add or replace a document; its embedding is computed immediately.
    pub fn add(
        &mut self,
        doc_id: &str,
        content: &str,
        title: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<()> {
        let embedding = self.encode_text(content)?;
        self.documents.insert(
            doc_id.to_string(),
            Document {
                title: if title.is_empty() {
                    doc_id.to_string()
                } else {
                    title.to_string()
                },
                content: content.to_string(),
                metadata,
            },
        );
        self.embeddings.insert(doc_id.to_string(), embedding);
        self.built = None;
        tracing::debug!("indexed document: {}", doc_id);
        Ok(())
    }

    /// Remove a document; returns whether it existed.
    pub fn remove(&mut self, doc_id: &str) -> bool {
        let existed = self.documents.remove(doc_id).is_some();
        self.embeddings.remove(doc_id);
        if existed {
            self.built = None;
        }
        existed
    }

    /// Precompute the scan cache. Optional; search works without it.
    pub fn build_index(&mut self) {
        let ids: Vec<String> = self.embeddings.keys().cloned().collect();
        let rows = ids.iter().map(|id| self.embeddings[id].clone()).collect();
        self.built = Some(BuiltIndex { ids, rows });
    }

    fn scan(&self, query: &[f32]) -> Vec<(String, f32)> {
        let score = |emb: &[f32]| cosine(query, emb);
        match &self.built {
            Some(built) => built
                .ids
                .iter()
                .zip(built.rows.iter())
                .map(|(id, row)| (id.clone(), score(row)))
                .collect(),
            None => self
                .embeddings
                .iter()
                .map(|(id, emb)| (id.clone(), score(emb)))
                .collect(),
        }
    }

    fn to_result(&self, doc_id: &str, score: f32) -> Option<SearchResult> {
        let doc = self.documents.get(doc_id)?;
        Some(SearchResult {
            doc_id: doc_id.to_string(),
            title: doc.title.clone(),
            content_preview: preview(&doc.content),
            score,
            metadata: doc.metadata.clone(),
        })
    }

    /// Cosine search over the whole index: filter by `min_score`, sort
    /// descending, truncate to `top_k`. Empty index gives empty results.
    pub fn search(&self, query: &str, top_k: usize, min_score: f32) -> Result<Vec<SearchResult>> {
        if self.embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let query_emb = self.encode_text(query)?;

        let mut scored: Vec<(String, f32)> = self
            .scan(&query_emb)
            .into_iter()
            .filter(|(_, score)| *score >= min_score)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| self.to_result(&id, score))
            .collect())
    }

    /// Documents most similar to a reference document, excluding itself.
    pub fn find_similar(&self, doc_id: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let Some(query_emb) = self.embeddings.get(doc_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(String, f32)> = self
            .scan(query_emb)
            .into_iter()
            .filter(|(id, _)| id != doc_id)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| self.to_result(&id, score))
            .collect())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            num_documents: self.documents.len(),
            embedding_dim: self.encoder.config().embedding_dim,
            index_built: self.built.is_some(),
        }
    }

    // ============================================================
    // Persistence
    // ============================================================

    /// Write `documents.json` and `embeddings.json` under `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join("documents.json"),
            serde_json::to_string_pretty(&self.documents)?,
        )?;
        std::fs::write(
            dir.join("embeddings.json"),
            serde_json::to_string(&self.embeddings)?,
        )?;
        tracing::info!("saved index ({} documents) to {:?}", self.documents.len(), dir);
        Ok(())
    }

    /// Load both sidecars; the scan cache is invalidated.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        let docs = std::fs::read_to_string(dir.join("documents.json"))?;
        let embs = std::fs::read_to_string(dir.join("embeddings.json"))?;
        self.documents = serde_json::from_str(&docs)?;
        self.embeddings = serde_json::from_str(&embs)?;

        let dim = self.encoder.config().embedding_dim;
        for (id, emb) in &self.embeddings {
            if emb.len() != dim {
                return Err(EngineError::shape(format!(
                    "embedding for `{id}` has length {}, expected {dim}",
                    emb.len()
                )));
            }
        }

        self.built = None;
        tracing::info!("loaded index with {} documents", self.documents.len());
        Ok(())
    }

    /// Batched embedding access for callers that want raw vectors.
    pub fn embedding(&self, doc_id: &str) -> Option<Tensor> {
        self.embeddings
            .get(doc_id)
            .and_then(|e| Tensor::from_vec(e.clone(), &[e.len()]).ok())
    }
}

// ============================================================
// Knowledge-map similarity
// ============================================================

/// Content fingerprint of a key-value knowledge map. Embedding caches key
/// on this hash, so two stores with identical contents share one entry and
/// a mutated store can never reuse a stale embedding.
pub fn knowledge_fingerprint(knowledge: &BTreeMap<String, String>) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for (key, value) in knowledge {
        key.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    hasher.finish()
}

/// Whole-knowledge-map embeddings, cached by content fingerprint.
pub struct KnowledgeEmbeddingCache<'m> {
    encoder: &'m SemanticEncoder,
    cache: std::collections::HashMap<u64, Vec<f32>>,
}

impl<'m> KnowledgeEmbeddingCache<'m> {
    pub fn new(encoder: &'m SemanticEncoder) -> Self {
        Self {
            encoder,
            cache: std::collections::HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Embedding of the concatenated "key value" text of the map.
    pub fn embedding(&mut self, knowledge: &BTreeMap<String, String>) -> Result<Vec<f32>> {
        let fingerprint = knowledge_fingerprint(knowledge);
        if let Some(cached) = self.cache.get(&fingerprint) {
            return Ok(cached.clone());
        }

        let mut text = knowledge
            .iter()
            .map(|(k, v)| format!("{k} {v}"))
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            text = "empty".to_string();
        }

        let cfg = self.encoder.config();
        let tokens = tokenizer::tokenize(&text, cfg.vocab_size, cfg.max_seq_length);
        let emb = self.encoder.encode(&[tokens])?;
        let emb = emb.as_f32()?.to_vec();
        self.cache.insert(fingerprint, emb.clone());
        Ok(emb)
    }

    /// Cosine similarity between two knowledge maps, clamped at zero.
    pub fn similarity(
        &mut self,
        a: &BTreeMap<String, String>,
        b: &BTreeMap<String, String>,
    ) -> Result<f32> {
        let emb_a = self.embedding(a)?;
        let emb_b = self.embedding(b)?;
        Ok(cosine(&emb_a, &emb_b).max(0.0))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();
    let na: f32 = a.iter().map(|&x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|&x| x * x).sum::<f32>().sqrt();
    dot / (na * nb + COSINE_EPS)
}

fn preview(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() > PREVIEW_CHARS {
        let mut p: String = chars[..PREVIEW_CHARS].iter().collect();
        p.push_str("...");
        p
    } else {
        content.to_string()
    }
}
