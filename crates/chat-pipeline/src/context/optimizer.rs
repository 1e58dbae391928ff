//! Context optimizer - selection, ordering and budgeting over a section
//! catalog.
//!
//! Selection is deterministic: identical inputs yield a byte-identical
//! system prompt. Token counts use the coarse `ceil(chars / 4)` heuristic;
//! `max_token_estimate` reports the everything-included baseline so callers
//! can see what the selection saved.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One named chunk of prompt text with topic tags and a priority.
///
/// Identity is the `id`: duplicate ids inside one selection are dropped,
/// first occurrence wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSection {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default)]
    pub always_include: bool,
    #[serde(default)]
    pub priority: i32,
}

impl ContextSection {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            content: content.into(),
            topics: Vec::new(),
            always_include: false,
            priority: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Marks the section for inclusion in every selective selection.
    pub fn always_include(mut self) -> Self {
        self.always_include = true;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Whether a branch of the policy uses the whole catalog or a topic-filtered
/// subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Full,
    Selective,
}

/// Per-position selection policy: first message vs follow-ups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPolicy {
    pub first_message: SelectionMode,
    pub follow_up: SelectionMode,
}

impl Default for ContextPolicy {
    /// Full catalog on the first message, topic-selective afterwards.
    fn default() -> Self {
        Self {
            first_message: SelectionMode::Full,
            follow_up: SelectionMode::Selective,
        }
    }
}

impl ContextPolicy {
    /// Selective on both branches.
    pub fn selective() -> Self {
        Self {
            first_message: SelectionMode::Selective,
            follow_up: SelectionMode::Selective,
        }
    }

    /// Full catalog on both branches.
    pub fn full() -> Self {
        Self {
            first_message: SelectionMode::Full,
            follow_up: SelectionMode::Full,
        }
    }

    pub fn with_first_message(mut self, mode: SelectionMode) -> Self {
        self.first_message = mode;
        self
    }

    pub fn with_follow_up(mut self, mode: SelectionMode) -> Self {
        self.follow_up = mode;
        self
    }
}

/// What a caller wants context for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<String>,
    #[serde(default)]
    pub is_first_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

impl SelectionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn first_message(mut self) -> Self {
        self.is_first_message = true;
        self
    }

    pub fn with_tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }
}

/// The assembled prompt context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSelection {
    pub system_prompt: String,
    /// Ids of the included sections, in prompt order.
    pub sections_included: Vec<String>,
    /// Size of the catalog the selection was drawn from.
    pub total_sections: usize,
    pub token_estimate: usize,
    /// Estimate had every catalog section been included (pre-tone).
    pub max_token_estimate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Coarse token estimate: one token per four characters, rounded up.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// The shared selection pass used by the optimizer and the dynamic engine.
pub(crate) fn select_sections(
    catalog: &[ContextSection],
    policy: &ContextPolicy,
    tone_map: &HashMap<String, String>,
    request: &SelectionRequest,
) -> ContextSelection {
    let use_full = (request.is_first_message && policy.first_message != SelectionMode::Selective)
        || (!request.is_first_message && policy.follow_up == SelectionMode::Full);

    let mut selected: Vec<&ContextSection> = if use_full {
        catalog.iter().collect()
    } else {
        let mut matching: Vec<&ContextSection> = catalog
            .iter()
            .filter(|section| {
                section.always_include
                    || section
                        .topics
                        .iter()
                        .any(|topic| request.topics.contains(topic))
            })
            .collect();
        // Stable: equal priorities keep their configured relative order.
        matching.sort_by_key(|section| std::cmp::Reverse(section.priority));
        matching
    };

    let mut seen = HashSet::new();
    selected.retain(|section| seen.insert(section.id.as_str()));

    let mut system_prompt = selected
        .iter()
        .map(|section| section.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    if let Some(instruction) = request.tone.as_deref().and_then(|tone| tone_map.get(tone)) {
        system_prompt.push_str("\n\n");
        system_prompt.push_str(instruction);
    }

    let full_prompt = catalog
        .iter()
        .map(|section| section.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let selection = ContextSelection {
        sections_included: selected.iter().map(|section| section.id.clone()).collect(),
        total_sections: catalog.len(),
        token_estimate: estimate_tokens(&system_prompt),
        max_token_estimate: estimate_tokens(&full_prompt),
        system_prompt,
        variant: None,
    };
    debug!(
        included = selection.sections_included.len(),
        total = selection.total_sections,
        tokens = selection.token_estimate,
        max_tokens = selection.max_token_estimate,
        "context selection assembled"
    );
    selection
}

/// Selects context sections from a static catalog.
#[derive(Debug, Clone, Default)]
pub struct ContextOptimizer {
    sections: Vec<ContextSection>,
    policy: ContextPolicy,
    tone_map: HashMap<String, String>,
}

impl ContextOptimizer {
    pub fn new(sections: Vec<ContextSection>) -> Self {
        Self {
            sections,
            policy: ContextPolicy::default(),
            tone_map: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tone_map(mut self, tone_map: HashMap<String, String>) -> Self {
        self.tone_map = tone_map;
        self
    }

    /// Adds one tone instruction.
    pub fn with_tone(mut self, tone: impl Into<String>, instruction: impl Into<String>) -> Self {
        self.tone_map.insert(tone.into(), instruction.into());
        self
    }

    pub fn sections(&self) -> &[ContextSection] {
        &self.sections
    }

    pub fn policy(&self) -> &ContextPolicy {
        &self.policy
    }

    pub fn tone_map(&self) -> &HashMap<String, String> {
        &self.tone_map
    }

    /// Runs the selection pass.
    pub fn optimize(&self, request: &SelectionRequest) -> ContextSelection {
        select_sections(&self.sections, &self.policy, &self.tone_map, request)
    }
}
