//! Bulk content loading
//!
//! A seed file is one JSON object with optional `entities`, `relations` and
//! `documents` arrays. Entities and relations go into the local graph,
//! documents are embedded into the local vector store.

use crate::error::{MentorError, Result};
use crate::stores::ContentMetadata;
use crate::stores::graph::{Entity, LocalGraph, Relation};
use crate::stores::semantic::LocalVectorStore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub documents: Vec<SeedDocument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ContentMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeedReport {
    pub entities_added: usize,
    pub relations_added: usize,
    pub documents_indexed: usize,
    pub total_entities: usize,
    pub total_documents: usize,
}

impl SeedFile {
    pub async fn read(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&content).map_err(|e| {
            MentorError::Configuration(format!("invalid seed file {}: {}", path.display(), e))
        })
    }
}

/// Write every entity, relation and document of `seed` into the stores.
/// Entities and documents replace existing ones with the same id.
pub async fn apply(
    seed: SeedFile,
    graph: &LocalGraph,
    vectors: &LocalVectorStore,
) -> Result<SeedReport> {
    let mut report = SeedReport::default();

    for entity in seed.entities {
        graph.add_entity(entity).await?;
        report.entities_added += 1;
    }
    for relation in seed.relations {
        graph.add_relation(relation).await?;
        report.relations_added += 1;
    }
    for doc in seed.documents {
        vectors.index_document(&doc.id, &doc.text, doc.metadata).await?;
        report.documents_indexed += 1;
    }

    report.total_entities = graph.entity_count().await;
    report.total_documents = vectors.document_count().await;
    info!(
        entities = report.entities_added,
        relations = report.relations_added,
        documents = report.documents_indexed,
        "Seed content loaded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::graph::{PROGRESS, STRUGGLED_WITH};
    use crate::stores::{GraphConnection, GraphQuery, GraphStore, SearchParams, SimilarityStore};
    use tempfile::TempDir;

    const SEED: &str = r#"{
        "entities": [
            {"id": "ana", "entity_type": "learner", "properties": {"current_module_id": "m1"}},
            {"id": "m1", "entity_type": "module", "properties": {"name": "Entrepreneurship"}},
            {"id": "k-mvp", "entity_type": "concept", "properties": {"name": "minimum viable product"}}
        ],
        "relations": [
            {"from": "ana", "to": "m1", "relation_type": "PROGRESS", "properties": {"completion": "30"}},
            {"from": "ana", "to": "k-mvp", "relation_type": "STRUGGLED_WITH"}
        ],
        "documents": [
            {"id": "d1", "text": "Test assumptions with a minimum viable product.",
             "metadata": {"module": "m1", "title": "Validating ideas"}}
        ]
    }"#;

    #[tokio::test]
    async fn test_seed_populates_graph_and_vectors() {
        let dir = TempDir::new().unwrap();
        let seed_path = dir.path().join("seed.json");
        std::fs::write(&seed_path, SEED).unwrap();

        let graph = LocalGraph::open(dir.path().join("graph")).unwrap();
        let vectors = LocalVectorStore::open(dir.path().join("vectors")).unwrap();
        let seed = SeedFile::read(&seed_path).await.unwrap();
        assert_eq!(seed.relations[0].relation_type, PROGRESS);
        assert_eq!(seed.relations[1].relation_type, STRUGGLED_WITH);

        let report = apply(seed, &graph, &vectors).await.unwrap();
        assert_eq!(
            report,
            SeedReport {
                entities_added: 3,
                relations_added: 2,
                documents_indexed: 1,
                total_entities: 3,
                total_documents: 1,
            }
        );

        let mut conn = graph.connect().await.unwrap();
        let rows = conn
            .run_query(&GraphQuery::LearnerContext {
                learner_id: "ana".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rows[0]["current_module_name"], "Entrepreneurship");
        assert_eq!(rows[0]["struggles"][0], "minimum viable product");

        let hits = vectors
            .search(
                "minimum viable product",
                &SearchParams {
                    result_count: 3,
                    module_filter: Some("m1".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(hits[0].metadata.title.as_deref(), Some("Validating ideas"));
    }

    #[tokio::test]
    async fn test_malformed_seed_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let seed_path = dir.path().join("seed.json");
        std::fs::write(&seed_path, "[1, 2, 3]").unwrap();

        let result = SeedFile::read(&seed_path).await;
        assert!(matches!(result, Err(MentorError::Configuration(_))));
    }
}
