//! Local vector store
//!
//! Course content with hashed bag-of-words embeddings, persisted as
//! `documents.json`. Good enough to run the engine without an external
//! embedding service.

use crate::error::{MentorError, Result};
use crate::stores::{ContentMetadata, SearchParams, SimilarityHit, SimilarityStore};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

const EMBEDDING_DIMS: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ContentMetadata,
    /// Recomputed when missing from the file.
    #[serde(default)]
    pub embedding: Vec<f32>,
}

pub struct LocalVectorStore {
    storage_path: PathBuf,
    documents: RwLock<Vec<Document>>,
}

impl LocalVectorStore {
    pub fn open(storage_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_path)?;

        let mut documents = load_documents(&storage_path)?;
        for doc in documents.iter_mut().filter(|d| d.embedding.len() != EMBEDDING_DIMS) {
            doc.embedding = embed(&doc.text);
        }
        info!(path = %storage_path.display(), documents = documents.len(), "Loaded local vector store");

        Ok(Self {
            storage_path,
            documents: RwLock::new(documents),
        })
    }

    /// Index (or replace) a document.
    pub async fn index_document(&self, id: &str, text: &str, metadata: ContentMetadata) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.retain(|d| d.id != id);
        documents.push(Document {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
            embedding: embed(text),
        });

        let json = serde_json::to_string_pretty(&*documents)?;
        tokio::fs::write(self.storage_path.join("documents.json"), json).await?;
        Ok(())
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[async_trait]
impl SimilarityStore for LocalVectorStore {
    async fn search(&self, text: &str, params: &SearchParams) -> Result<Vec<SimilarityHit>> {
        let query = embed(text);
        let documents = self.documents.read().await;

        let mut hits: Vec<SimilarityHit> = documents
            .iter()
            .filter(|doc| match &params.module_filter {
                Some(module) => doc.metadata.module.as_deref() == Some(module.as_str()),
                None => true,
            })
            .map(|doc| SimilarityHit {
                content: doc.text.clone(),
                metadata: doc.metadata.clone(),
                // Hashed counts are non-negative, so cosine is already in [0, 1].
                similarity: f64::from(cosine_similarity(&query, &doc.embedding)).clamp(0.0, 1.0),
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(params.result_count);
        Ok(hits)
    }
}

fn embed(text: &str) -> Vec<f32> {
    let mut embedding = vec![0.0f32; EMBEDDING_DIMS];
    for word in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        embedding[(hasher.finish() % EMBEDDING_DIMS as u64) as usize] += 1.0;
    }

    let magnitude = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for val in embedding.iter_mut() {
            *val /= magnitude;
        }
    }
    embedding
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let magnitude_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }
    dot / (magnitude_a * magnitude_b)
}

fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let file = path.join("documents.json");
    if !file.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&file)?;
    serde_json::from_str(&content).map_err(|e| {
        MentorError::SimilarityStore(format!("unreadable {}: {}", file.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn module(name: &str) -> ContentMetadata {
        ContentMetadata {
            module: Some(name.to_string()),
            ..ContentMetadata::default()
        }
    }

    async fn store() -> (TempDir, LocalVectorStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalVectorStore::open(dir.path().to_path_buf()).unwrap();
        store
            .index_document("d1", "Rubrics describe levels of performance for grading", module("m1"))
            .await
            .unwrap();
        store
            .index_document("d2", "Formative feedback guides learning during a course", module("m1"))
            .await
            .unwrap();
        store
            .index_document("d3", "Rubrics for peer review of essays", module("m2"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_search_ranks_closest_document_first() {
        let (_dir, store) = store().await;
        let hits = store
            .search(
                "rubrics grading performance",
                &SearchParams {
                    result_count: 5,
                    module_filter: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 3);
        assert!(hits[0].content.starts_with("Rubrics describe"));
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.similarity)));
    }

    #[tokio::test]
    async fn test_module_filter_and_result_count() {
        let (_dir, store) = store().await;
        let hits = store
            .search(
                "rubrics",
                &SearchParams {
                    result_count: 1,
                    module_filter: Some("m2".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.module.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_documents_survive_reopen_and_replace_by_id() {
        let (dir, store) = store().await;
        store
            .index_document("d1", "Rewritten rubric notes", module("m1"))
            .await
            .unwrap();
        assert_eq!(store.document_count().await, 3);

        let reopened = LocalVectorStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.document_count().await, 3);
    }

    #[test]
    fn test_corrupt_document_file_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("documents.json"), "{not json").unwrap();

        let result = LocalVectorStore::open(dir.path().to_path_buf());
        assert!(matches!(result, Err(MentorError::SimilarityStore(_))));
    }

    #[test]
    fn test_identical_text_has_unit_similarity() {
        let a = embed("assessment for learning");
        let score = cosine_similarity(&a, &embed("Assessment for learning"));
        assert!((score - 1.0).abs() < 1e-5);
    }
}
