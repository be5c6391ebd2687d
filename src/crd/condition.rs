//! Status conditions shared by every declared resource.
//!
//! [`Conditions`] is an ordered set keyed by condition type: setting a
//! condition replaces the existing entry of the same type in place, or
//! appends it when the type is new. The transition time only moves when the
//! status of that type actually changes, so rebuilding an identical
//! condition is a no-op and never causes a status write.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Tri-state status of a condition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Map a boolean onto `True`/`False`.
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition describes one observed aspect of a declared resource.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: ConditionStatus,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    #[serde(default)]
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition stamped with the current time.
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: None,
        }
    }

    /// Attach the generation this condition was computed for.
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

/// Ordered list of conditions holding at most one entry per type.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add or replace a condition by type.
    ///
    /// Returns `true` when the stored list changed. When the status of an
    /// existing entry is unchanged its transition time is kept.
    pub fn set(&mut self, mut condition: Condition) -> bool {
        match self
            .0
            .iter_mut()
            .find(|existing| existing.r#type == condition.r#type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition
                        .last_transition_time
                        .clone_from(&existing.last_transition_time);
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                self.0.push(condition);
                true
            }
        }
    }

    /// Remove the condition of the given type, returning it if present.
    pub fn remove(&mut self, condition_type: &str) -> Option<Condition> {
        let position = self.0.iter().position(|c| c.r#type == condition_type)?;
        Some(self.0.remove(position))
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == condition_type)
    }

    /// Whether a condition of this type exists at all.
    pub fn is_set(&self, condition_type: &str) -> bool {
        self.get(condition_type).is_some()
    }

    /// Check if a condition type is `True`.
    pub fn is_true(&self, condition_type: &str) -> bool {
        self.get(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Reason recorded for a condition type.
    pub fn reason(&self, condition_type: &str) -> Option<&str> {
        self.get(condition_type).map(|c| c.reason.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    /// Build a ledger from a raw list, keeping the last entry of each type.
    fn from(list: Vec<Condition>) -> Self {
        let mut conditions = Conditions::new();
        for condition in list {
            match conditions
                .0
                .iter_mut()
                .find(|existing| existing.r#type == condition.r#type)
            {
                Some(existing) => *existing = condition,
                None => conditions.0.push(condition),
            }
        }
        conditions
    }
}

impl<'a> IntoIterator for &'a Conditions {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
