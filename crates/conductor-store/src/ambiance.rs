use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const LEVEL_RUNTIME_ID_SEPARATOR: &str = "|";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub runtime_id: String,
    pub setup_id: String,
    pub step_type: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub retry_index: u32,
}

impl Level {
    pub fn new(
        runtime_id: impl Into<String>,
        setup_id: impl Into<String>,
        step_type: impl Into<String>,
    ) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: setup_id.into(),
            step_type: step_type.into(),
            group: None,
            retry_index: 0,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Same setup, new runtime identity: the level of the next retry attempt.
    pub fn next_attempt(&self, runtime_id: impl Into<String>) -> Self {
        Self {
            runtime_id: runtime_id.into(),
            setup_id: self.setup_id.clone(),
            step_type: self.step_type.clone(),
            group: self.group.clone(),
            retry_index: self.retry_index + 1,
        }
    }
}

/// Immutable path from the root node down to the current one. Children share
/// the parent's level list and copy it on append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    #[serde(default)]
    pub setup_abstractions: Arc<BTreeMap<String, String>>,
    levels: Arc<[Level]>,
}

impl Ambiance {
    pub fn new(
        plan_execution_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            setup_abstractions: Arc::new(setup_abstractions),
            levels: Arc::from(Vec::new()),
        }
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn derive_child(&self, level: Level) -> Self {
        let mut levels = Vec::with_capacity(self.levels.len() + 1);
        levels.extend(self.levels.iter().cloned());
        levels.push(level);
        Self {
            plan_execution_id: self.plan_execution_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            levels: Arc::from(levels),
        }
    }

    /// The ambiance of the enclosing node, i.e. this path without its last level.
    pub fn without_current_level(&self) -> Self {
        let keep = self.levels.len().saturating_sub(1);
        Self {
            plan_execution_id: self.plan_execution_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            levels: Arc::from(&self.levels[..keep]),
        }
    }

    /// A sibling path: same ancestors, different current level.
    pub fn with_current_level(&self, level: Level) -> Self {
        self.without_current_level().derive_child(level)
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn obtain_current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|level| level.runtime_id.as_str())
    }

    pub fn obtain_current_setup_id(&self) -> Option<&str> {
        self.current_level().map(|level| level.setup_id.as_str())
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn level_runtime_id_idx(&self) -> String {
        level_runtime_id_idx(&self.levels)
    }

    /// Runtime-id indexes of this path and every ancestor prefix, nearest first.
    /// The last entry is the empty plan-wide scope.
    pub fn ancestor_runtime_id_idxs(&self) -> Vec<String> {
        (0..=self.levels.len())
            .rev()
            .map(|len| level_runtime_id_idx(&self.levels[..len]))
            .collect()
    }

    /// Truncates the path to the nearest level belonging to `group`.
    pub fn prefix_for_group(&self, group: &str) -> Option<Self> {
        let position = self
            .levels
            .iter()
            .rposition(|level| level.group.as_deref() == Some(group))?;
        Some(Self {
            plan_execution_id: self.plan_execution_id.clone(),
            setup_abstractions: Arc::clone(&self.setup_abstractions),
            levels: Arc::from(&self.levels[..=position]),
        })
    }
}

pub fn level_runtime_id_idx(levels: &[Level]) -> String {
    levels
        .iter()
        .map(|level| level.runtime_id.as_str())
        .collect::<Vec<_>>()
        .join(LEVEL_RUNTIME_ID_SEPARATOR)
}
