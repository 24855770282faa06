//! Engine data types: learner snapshots and retrieved context items

use crate::stores::{ContentMetadata, Row};
use serde::{Deserialize, Serialize};

/// Struggled and mastered concept lists are capped at this length.
pub const MAX_CONCEPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleProgress {
    pub module_id: String,
    #[serde(default)]
    pub module_name: Option<String>,
    /// Completion percentage, 0 to 100.
    #[serde(default)]
    pub completion: f64,
    #[serde(default)]
    pub quiz_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizResult {
    pub module_id: String,
    pub score: f64,
}

/// Cached snapshot of one learner's state.
///
/// Never mutated after construction; a refresh builds a new value and replaces
/// the cached `Arc` wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnerContext {
    learner_id: String,
    current_module: Option<String>,
    current_module_name: Option<String>,
    module_progress: Vec<ModuleProgress>,
    struggled_concepts: Vec<String>,
    mastered_concepts: Vec<String>,
    quiz_history: Vec<QuizResult>,
}

/// Shape of the learner-context row returned by the graph store.
#[derive(Debug, Default, Deserialize)]
struct LearnerRow {
    #[serde(default)]
    current_module: Option<String>,
    #[serde(default)]
    current_module_name: Option<String>,
    #[serde(default)]
    modules: Vec<ModuleProgress>,
    #[serde(default)]
    struggles: Vec<String>,
    #[serde(default)]
    mastered: Vec<String>,
}

impl LearnerContext {
    pub fn new(
        learner_id: impl Into<String>,
        current_module: Option<String>,
        module_progress: Vec<ModuleProgress>,
        mut struggled_concepts: Vec<String>,
        mut mastered_concepts: Vec<String>,
    ) -> Self {
        struggled_concepts.truncate(MAX_CONCEPTS);
        mastered_concepts.truncate(MAX_CONCEPTS);

        let quiz_history = module_progress
            .iter()
            .filter_map(|m| {
                m.quiz_score.map(|score| QuizResult {
                    module_id: m.module_id.clone(),
                    score,
                })
            })
            .collect();

        let current_module_name = current_module.as_ref().and_then(|id| {
            module_progress
                .iter()
                .find(|m| &m.module_id == id)
                .and_then(|m| m.module_name.clone())
        });

        Self {
            learner_id: learner_id.into(),
            current_module,
            current_module_name,
            module_progress,
            struggled_concepts,
            mastered_concepts,
            quiz_history,
        }
    }

    /// A learner the graph knows nothing about.
    pub fn empty(learner_id: impl Into<String>) -> Self {
        Self::new(learner_id, None, Vec::new(), Vec::new(), Vec::new())
    }

    pub fn from_row(learner_id: &str, row: Row) -> serde_json::Result<Self> {
        let row: LearnerRow = serde_json::from_value(row)?;
        let mut context = Self::new(
            learner_id,
            row.current_module,
            row.modules,
            row.struggles,
            row.mastered,
        );
        if row.current_module_name.is_some() {
            context.current_module_name = row.current_module_name;
        }
        Ok(context)
    }

    pub fn learner_id(&self) -> &str {
        &self.learner_id
    }

    pub fn current_module(&self) -> Option<&str> {
        self.current_module.as_deref()
    }

    /// Display name of the current module, falling back to its id.
    pub fn current_module_label(&self) -> Option<&str> {
        self.current_module_name
            .as_deref()
            .or(self.current_module.as_deref())
    }

    pub fn module_progress(&self) -> &[ModuleProgress] {
        &self.module_progress
    }

    pub fn struggled_concepts(&self) -> &[String] {
        &self.struggled_concepts
    }

    pub fn mastered_concepts(&self) -> &[String] {
        &self.mastered_concepts
    }

    pub fn quiz_history(&self) -> &[QuizResult] {
        &self.quiz_history
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Similarity,
    GraphPeer,
    GraphPrerequisite,
}

/// One retrieved snippet with its provenance.
///
/// `raw_score` is the similarity for `Similarity` items and the corroborating
/// peer count for `GraphPeer` items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    pub source: SourceKind,
    pub raw_score: f64,
    pub metadata: ContentMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    #[serde(flatten)]
    pub item: ContextItem,
    pub final_score: f64,
}
