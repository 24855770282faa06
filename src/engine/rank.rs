//! Merge & rank
//!
//! Scores similarity and graph items on one scale and keeps the best few.
//! Ranking is a pure function of its inputs; equal scores keep retrieval order
//! (similarity items first, then peer items, then prerequisite items).

use crate::engine::types::{ContextItem, LearnerContext, RankedItem, SourceKind};

pub const MAX_RANKED_ITEMS: usize = 3;
/// Peer recommendations admitted into the merge.
pub const MAX_PEER_ITEMS: usize = 2;

const PEER_BASE_SCORE: f64 = 0.7;
const PEER_SCORE_PER_PEER: f64 = 0.05;
const PREREQUISITE_BASE_SCORE: f64 = 0.6;
const STRUGGLE_BOOST: f64 = 1.2;
const CURRENT_MODULE_BOOST: f64 = 1.1;

/// Final score of one item for this learner, in [0, 1].
pub fn score(item: &ContextItem, learner: &LearnerContext) -> f64 {
    let mut score = match item.source {
        SourceKind::Similarity => item.raw_score,
        SourceKind::GraphPeer => PEER_BASE_SCORE + item.raw_score.max(0.0) * PEER_SCORE_PER_PEER,
        SourceKind::GraphPrerequisite => PREREQUISITE_BASE_SCORE,
    };

    if addresses_struggle(&item.content, learner.struggled_concepts()) {
        score *= STRUGGLE_BOOST;
    }

    if let (Some(module), Some(current)) = (item.metadata.module.as_deref(), learner.current_module())
    {
        if module == current {
            score *= CURRENT_MODULE_BOOST;
        }
    }

    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

pub fn rank(
    similarity: &[ContextItem],
    graph: &[ContextItem],
    learner: &LearnerContext,
) -> Vec<RankedItem> {
    let peers = graph
        .iter()
        .filter(|item| item.source == SourceKind::GraphPeer)
        .take(MAX_PEER_ITEMS);
    let prerequisites = graph
        .iter()
        .filter(|item| item.source == SourceKind::GraphPrerequisite);

    let mut ranked: Vec<RankedItem> = similarity
        .iter()
        .chain(peers)
        .chain(prerequisites)
        .map(|item| RankedItem {
            final_score: score(item, learner),
            item: item.clone(),
        })
        .collect();

    // Stable sort: ties keep retrieval order.
    ranked.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    ranked.truncate(MAX_RANKED_ITEMS);
    ranked
}

fn addresses_struggle(content: &str, struggles: &[String]) -> bool {
    if struggles.is_empty() {
        return false;
    }
    let content = content.to_lowercase();
    struggles
        .iter()
        .filter(|s| !s.trim().is_empty())
        .any(|s| content.contains(&s.to_lowercase()))
}
