//! Vector index: embeddings, storage and similarity search
//!
//! `LocalVectorIndex` keeps every document and its embedding in memory and
//! persists them as one JSON file guarded by an exclusive `fs2` lock. Search
//! is a linear cosine-similarity scan, which is plenty for a single project.

use crate::config::ServerConfig;
use crate::util::hash_str;
use async_trait::async_trait;
use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Embedding failed: {0}")]
    Embedding(String),
    #[error("Embedder returned {got} vectors for {expected} documents")]
    EmbeddingCount { expected: usize, got: usize },
    #[error("Index I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Timed out waiting for index lock at {0}")]
    LockTimeout(PathBuf),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
}

/// A document to index. `id` is stable across runs (the relative path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    pub fn for_path(path: &str, text: impl Into<String>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("path".to_string(), path.to_string());
        Self {
            id: path.to_string(),
            text: text.into(),
            metadata,
        }
    }

    pub fn path(&self) -> &str {
        self.metadata.get("path").map(String::as_str).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub document: Document,
    /// Cosine similarity, higher is closer
    pub score: f32,
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace documents by id. Returns how many were (re)embedded.
    async fn upsert(&self, documents: Vec<Document>) -> Result<usize, IndexError>;
    /// Top `k` documents by similarity to `text`.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredDocument>, IndexError>;
    async fn count(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    document: Document,
    content_hash: String,
    vector: Vec<f32>,
}

pub struct LocalVectorIndex {
    path: Option<PathBuf>,
    embedder: Arc<dyn Embedder>,
    documents: RwLock<IndexMap<String, StoredDocument>>,
}

impl LocalVectorIndex {
    /// Non-persistent index
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            path: None,
            embedder,
            documents: RwLock::new(IndexMap::new()),
        }
    }

    /// Open the index stored at `path`, creating its directory if needed.
    /// An unreadable or corrupt file is logged and replaced by an empty index.
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let documents = if path.exists() {
            match load(path) {
                Ok(docs) => {
                    info!("Loaded {} indexed documents from {}", docs.len(), path.display());
                    docs
                }
                Err(err) => {
                    warn!("Could not load index at {}: {}; starting fresh", path.display(), err);
                    IndexMap::new()
                }
            }
        } else {
            IndexMap::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            embedder,
            documents: RwLock::new(documents),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self) -> Result<(), IndexError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let snapshot: Vec<StoredDocument> = self.documents.read().await.values().cloned().collect();
        tokio::task::spawn_blocking(move || save(&path, &snapshot))
            .await
            .map_err(|e| IndexError::Io(std::io::Error::other(e.to_string())))?
    }
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn upsert(&self, documents: Vec<Document>) -> Result<usize, IndexError> {
        if documents.is_empty() {
            return Ok(0);
        }

        // Unchanged content keeps its stored vector
        let stale: Vec<(Document, String)> = {
            let existing = self.documents.read().await;
            documents
                .into_iter()
                .filter_map(|doc| {
                    let hash = hash_str(&doc.text);
                    match existing.get(&doc.id) {
                        Some(stored) if stored.content_hash == hash => None,
                        _ => Some((doc, hash)),
                    }
                })
                .collect()
        };
        if stale.is_empty() {
            debug!("All documents unchanged; nothing to embed");
            return Ok(0);
        }

        let texts: Vec<String> = stale.iter().map(|(doc, _)| doc.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        if vectors.len() != stale.len() {
            return Err(IndexError::EmbeddingCount {
                expected: stale.len(),
                got: vectors.len(),
            });
        }

        let embedded = stale.len();
        {
            let mut docs = self.documents.write().await;
            for ((document, content_hash), vector) in stale.into_iter().zip(vectors) {
                docs.insert(
                    document.id.clone(),
                    StoredDocument {
                        document,
                        content_hash,
                        vector,
                    },
                );
            }
        }
        self.persist().await?;
        Ok(embedded)
    }

    async fn query(&self, text: &str, k: usize) -> Result<Vec<ScoredDocument>, IndexError> {
        if k == 0 || self.documents.read().await.is_empty() {
            return Ok(Vec::new());
        }
        let query = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(IndexError::EmbeddingCount {
                expected: 1,
                got: 0,
            })?;

        let docs = self.documents.read().await;
        let mut scored: Vec<ScoredDocument> = docs
            .values()
            .map(|stored| ScoredDocument {
                document: stored.document.clone(),
                score: cosine_similarity(&query, &stored.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Exclusive lock on `<index>.lock`, released on drop.
struct IndexLock {
    file: File,
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_index(path: &Path) -> Result<IndexLock, IndexError> {
    let lock_path = path.with_extension("lock");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;

    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => return Ok(IndexLock { file }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() >= LOCK_TIMEOUT {
                    return Err(IndexError::LockTimeout(lock_path));
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn load(path: &Path) -> Result<IndexMap<String, StoredDocument>, IndexError> {
    let content = fs::read(path)?;
    let stored: Vec<StoredDocument> = serde_json::from_slice(&content)?;
    Ok(stored
        .into_iter()
        .map(|doc| (doc.document.id.clone(), doc))
        .collect())
}

fn save(path: &Path, documents: &[StoredDocument]) -> Result<(), IndexError> {
    let _lock = lock_index(path)?;
    let content = serde_json::to_vec(documents)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI-compatible `/v1/embeddings` client
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &ServerConfig) -> Option<Self> {
        let key = config.openai_api_key.as_deref()?;
        Some(Self::new(&config.openai_base_url, key, &config.model_embedding))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Embedding(format!(
                "provider returned HTTP {}",
                status.as_u16()
            )));
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Embedding(e.to_string()))?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
