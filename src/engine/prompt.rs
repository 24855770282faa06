//! Prompt assembly

use crate::engine::truncate_chars;
use crate::engine::types::{LearnerContext, RankedItem};
use crate::providers::{Message, Role};

/// Characters kept from each context snippet.
pub const SNIPPET_CHARS: usize = 200;

const DEFAULT_MODULE_LABEL: &str = "introductory content";

/// System preamble naming the learner's module, then the ranked snippets and the raw question.
pub fn build_messages(query: &str, ranked: &[RankedItem], learner: &LearnerContext) -> Vec<Message> {
    let module = learner.current_module_label().unwrap_or(DEFAULT_MODULE_LABEL);
    let system = format!(
        "You are a teaching assistant. The learner is currently studying {}.",
        module
    );

    let context = ranked
        .iter()
        .map(|r| truncate_chars(&r.item.content, SNIPPET_CHARS))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "Context:\n{}\n\nQuestion: {}\n\nProvide a clear, concise answer.",
        context, query
    );

    vec![
        Message {
            role: Role::System,
            content: system,
            name: None,
        },
        Message {
            role: Role::User,
            content: user,
            name: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ContextItem, ModuleProgress, SourceKind};
    use crate::stores::ContentMetadata;

    fn ranked(content: &str) -> RankedItem {
        RankedItem {
            item: ContextItem {
                content: content.to_string(),
                source: SourceKind::Similarity,
                raw_score: 0.5,
                metadata: ContentMetadata::default(),
            },
            final_score: 0.5,
        }
    }

    #[test]
    fn test_preamble_names_current_module() {
        let learner = LearnerContext::new(
            "l1",
            Some("m1".to_string()),
            vec![ModuleProgress {
                module_id: "m1".to_string(),
                module_name: Some("Classroom Assessment".to_string()),
                completion: 20.0,
                quiz_score: None,
            }],
            Vec::new(),
            Vec::new(),
        );

        let messages = build_messages("How do I grade fairly?", &[], &learner);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("Classroom Assessment"));
        assert!(messages[1].content.ends_with("Provide a clear, concise answer."));
    }

    #[test]
    fn test_unknown_module_uses_default_label() {
        let messages = build_messages("q", &[], &LearnerContext::empty("l1"));
        assert!(messages[0].content.contains(DEFAULT_MODULE_LABEL));
    }

    #[test]
    fn test_snippets_are_truncated_and_query_kept_raw() {
        let long = "x".repeat(SNIPPET_CHARS + 50);
        let messages = build_messages(
            "What is formative assessment?",
            &[ranked(&long), ranked("short snippet")],
            &LearnerContext::empty("l1"),
        );

        let user = &messages[1].content;
        assert!(user.contains(&"x".repeat(SNIPPET_CHARS)));
        assert!(!user.contains(&"x".repeat(SNIPPET_CHARS + 1)));
        assert!(user.contains("short snippet"));
        assert!(user.contains("Question: What is formative assessment?"));
    }
}
