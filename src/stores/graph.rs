//! Local property graph
//!
//! Learners, modules, concepts, content and interactions as entities joined by
//! typed relations, persisted as `entities.json` and `relations.json`.

use crate::batch::BatchItem;
use crate::error::Result;
use crate::stores::{GraphConnection, GraphQuery, GraphStore, Row};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const PROGRESS: &str = "PROGRESS";
pub const STRUGGLED_WITH: &str = "STRUGGLED_WITH";
pub const MASTERED: &str = "MASTERED";
pub const VIEWED: &str = "VIEWED";
pub const TEACHES: &str = "TEACHES";
pub const CONTAINS: &str = "CONTAINS";
pub const PREREQUISITE_FOR: &str = "PREREQUISITE_FOR";
pub const HAD_INTERACTION: &str = "HAD_INTERACTION";

/// A node in the graph ("learner", "module", "concept", "content", "interaction").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: &str) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.to_string(),
            properties: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    fn prop(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// `name`, then `title`, then the id.
    fn display(&self) -> &str {
        self.prop("name").or(self.prop("title")).unwrap_or(&self.id)
    }
}

/// A directed, typed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub relation_type: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Relation {
    pub fn new(from: impl Into<String>, relation_type: &str, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.to_string(),
            properties: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

struct GraphData {
    storage_path: PathBuf,
    entities: HashMap<String, Entity>,
    relations: Vec<Relation>,
}

/// JSON-file-backed graph store. Connections share one in-memory graph.
#[derive(Clone)]
pub struct LocalGraph {
    data: Arc<RwLock<GraphData>>,
}

impl LocalGraph {
    pub fn open(storage_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_path)?;

        let entities = load_entities(&storage_path)?;
        let relations = load_relations(&storage_path)?;
        info!(
            path = %storage_path.display(),
            entities = entities.len(),
            relations = relations.len(),
            "Loaded local graph"
        );

        Ok(Self {
            data: Arc::new(RwLock::new(GraphData {
                storage_path,
                entities,
                relations,
            })),
        })
    }

    pub async fn add_entity(&self, entity: Entity) -> Result<()> {
        let mut data = self.data.write().await;
        data.entities.insert(entity.id.clone(), entity);
        data.save_entities().await
    }

    pub async fn add_relation(&self, relation: Relation) -> Result<()> {
        let mut data = self.data.write().await;
        data.relations.push(relation);
        data.save_relations().await
    }

    pub async fn entity_count(&self) -> usize {
        self.data.read().await.entities.len()
    }
}

#[async_trait]
impl GraphStore for LocalGraph {
    async fn connect(&self) -> Result<Box<dyn GraphConnection>> {
        Ok(Box::new(LocalGraphConnection {
            data: Arc::clone(&self.data),
        }))
    }
}

struct LocalGraphConnection {
    data: Arc<RwLock<GraphData>>,
}

#[async_trait]
impl GraphConnection for LocalGraphConnection {
    async fn run_query(&mut self, query: &GraphQuery) -> Result<Vec<Row>> {
        debug!(kind = query.kind(), "Running local graph query");
        match query {
            GraphQuery::LearnerContext { learner_id } => {
                let data = self.data.read().await;
                Ok(data.learner_context(learner_id).into_iter().collect())
            }
            GraphQuery::PeerRecommendations { learner_id, limit } => {
                let data = self.data.read().await;
                Ok(data.peer_recommendations(learner_id, *limit))
            }
            GraphQuery::Prerequisites { learner_id, limit } => {
                let data = self.data.read().await;
                Ok(data.prerequisites(learner_id, *limit))
            }
            GraphQuery::RecordInteractions { batch } => {
                let mut data = self.data.write().await;
                data.record_interactions(batch).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl GraphData {
    fn learner(&self, learner_id: &str) -> Option<&Entity> {
        self.entities
            .get(learner_id)
            .filter(|e| e.entity_type == "learner")
    }

    fn outgoing<'a>(&'a self, from: &'a str, relation_type: &'a str) -> impl Iterator<Item = &'a Relation> {
        self.relations
            .iter()
            .filter(move |r| r.from == from && r.relation_type == relation_type)
    }

    fn incoming<'a>(&'a self, to: &'a str, relation_type: &'a str) -> impl Iterator<Item = &'a Relation> {
        self.relations
            .iter()
            .filter(move |r| r.to == to && r.relation_type == relation_type)
    }

    fn name_of(&self, id: &str) -> String {
        self.entities
            .get(id)
            .map(|e| e.display().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn concept_names(&self, learner_id: &str, relation_type: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.outgoing(learner_id, relation_type)
            .map(|r| self.name_of(&r.to))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    fn learner_context(&self, learner_id: &str) -> Option<Row> {
        let learner = self.learner(learner_id)?;

        let modules: Vec<Row> = self
            .outgoing(learner_id, PROGRESS)
            .map(|r| {
                json!({
                    "module_id": r.to,
                    "module_name": self.entities.get(&r.to).and_then(|m| m.prop("name")),
                    "completion": r.properties.get("completion")
                        .and_then(|v| v.parse::<f64>().ok())
                        .unwrap_or(0.0),
                    "quiz_score": r.properties.get("quiz_score")
                        .and_then(|v| v.parse::<f64>().ok()),
                })
            })
            .collect();

        let current_module = learner.prop("current_module_id");
        let current_module_name = current_module
            .and_then(|id| self.entities.get(id))
            .and_then(|m| m.prop("name"));

        Some(json!({
            "current_module": current_module,
            "current_module_name": current_module_name,
            "modules": modules,
            "struggles": self.concept_names(learner_id, STRUGGLED_WITH),
            "mastered": self.concept_names(learner_id, MASTERED),
        }))
    }

    /// Content viewed by other learners who struggled with the same concepts,
    /// ranked by how many distinct such peers viewed it.
    fn peer_recommendations(&self, learner_id: &str, limit: usize) -> Vec<Row> {
        let concepts: HashSet<&str> = self
            .outgoing(learner_id, STRUGGLED_WITH)
            .map(|r| r.to.as_str())
            .collect();

        let mut peers_per_content: HashMap<&str, HashSet<&str>> = HashMap::new();
        for concept in &concepts {
            for peer in self
                .incoming(*concept, STRUGGLED_WITH)
                .map(|r| r.from.as_str())
                .filter(|peer| *peer != learner_id)
            {
                for viewed in self.outgoing(peer, VIEWED) {
                    let teaches = self
                        .outgoing(&viewed.to, TEACHES)
                        .any(|t| t.to == *concept);
                    if teaches {
                        peers_per_content
                            .entry(viewed.to.as_str())
                            .or_default()
                            .insert(peer);
                    }
                }
            }
        }

        let mut ranked: Vec<(&str, usize)> = peers_per_content
            .into_iter()
            .map(|(content, peers)| (content, peers.len()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        ranked
            .into_iter()
            .take(limit)
            .map(|(content_id, peer_count)| {
                let content = self.entities.get(content_id);
                json!({
                    "content_id": content_id,
                    "title": content.and_then(|c| c.prop("title")),
                    "module": content.and_then(|c| c.prop("module")),
                    "peer_count": peer_count,
                })
            })
            .collect()
    }

    /// Content teaching concepts of modules that the learner's modules are prerequisites for.
    fn prerequisites(&self, learner_id: &str, limit: usize) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut seen = HashSet::new();

        for progress in self.outgoing(learner_id, PROGRESS) {
            for next in self.outgoing(&progress.to, PREREQUISITE_FOR) {
                for contains in self.outgoing(&next.to, CONTAINS) {
                    for teaches in self.incoming(&contains.to, TEACHES) {
                        if rows.len() >= limit {
                            return rows;
                        }
                        if !seen.insert((teaches.from.as_str(), contains.to.as_str())) {
                            continue;
                        }
                        let content = self.entities.get(&teaches.from);
                        rows.push(json!({
                            "content_id": teaches.from,
                            "title": content.and_then(|c| c.prop("title")),
                            "concept": self.name_of(&contains.to),
                            "module": self.name_of(&next.to),
                        }));
                    }
                }
            }
        }
        rows
    }

    /// Unknown learners are skipped.
    async fn record_interactions(&mut self, batch: &[BatchItem]) -> Result<()> {
        let mut recorded = 0usize;
        for (index, item) in batch.iter().enumerate() {
            if self.learner(&item.learner_id).is_none() {
                debug!(learner = %item.learner_id, "Skipping interaction for unknown learner");
                continue;
            }

            let id = format!(
                "{}_{}_{}",
                item.learner_id,
                item.enqueued_at.timestamp_millis(),
                index
            );
            let interaction = Entity::new(id.clone(), "interaction")
                .with("query", item.query.clone())
                .with("context_summary", item.context_summary.clone())
                .with("timestamp", item.enqueued_at.to_rfc3339());
            self.entities.insert(id.clone(), interaction);
            self.relations.push(
                Relation::new(item.learner_id.clone(), HAD_INTERACTION, id)
                    .with("timestamp", item.enqueued_at.to_rfc3339()),
            );
            recorded += 1;
        }

        if recorded > 0 {
            self.save_entities().await?;
            self.save_relations().await?;
        }
        Ok(())
    }

    async fn save_entities(&self) -> Result<()> {
        let file = self.storage_path.join("entities.json");
        let entities: Vec<&Entity> = self.entities.values().collect();
        let json = serde_json::to_string_pretty(&entities)?;
        tokio::fs::write(&file, json).await?;
        Ok(())
    }

    async fn save_relations(&self) -> Result<()> {
        let file = self.storage_path.join("relations.json");
        let json = serde_json::to_string_pretty(&self.relations)?;
        tokio::fs::write(&file, json).await?;
        Ok(())
    }
}

fn load_entities(path: &Path) -> Result<HashMap<String, Entity>> {
    let file = path.join("entities.json");
    if !file.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(&file)?;
    let entities: Vec<Entity> = serde_json::from_str(&content)?;
    Ok(entities.into_iter().map(|e| (e.id.clone(), e)).collect())
}

fn load_relations(path: &Path) -> Result<Vec<Relation>> {
    let file = path.join("relations.json");
    if !file.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(&file)?;
    Ok(serde_json::from_str(&content)?)
}
