//! Output extraction.
//!
//! Outputs are evaluated against the final state after a run, or against
//! stored state alone. An output that cannot be computed resolves to an
//! explicit [`OutputValue::Unavailable`] carrying the reason. Sensitive
//! outputs are kept in a separate map so callers can decide how to show them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::model::{Resolution, ResourceId, Value};
use crate::state::{EntryStatus, StateDocument};

/// A declared output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDefinition {
    /// Output name.
    pub name: String,
    /// Expression to evaluate.
    pub value: Value,
    /// Hide the value from default summaries.
    pub sensitive: bool,
    /// Human-readable description.
    pub description: Option<String>,
}

/// The evaluated value of one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputValue {
    /// The value could be computed.
    Available {
        /// Computed value.
        value: JsonValue,
    },
    /// The value could not be computed.
    Unavailable {
        /// Why not.
        reason: String,
    },
}

impl OutputValue {
    /// Returns the value if available.
    #[must_use]
    pub const fn value(&self) -> Option<&JsonValue> {
        match self {
            Self::Available { value } => Some(value),
            Self::Unavailable { .. } => None,
        }
    }

    /// Returns true if the value could be computed.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }
}

/// Evaluated outputs, split by sensitivity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSet {
    /// Non-sensitive outputs.
    pub values: BTreeMap<String, OutputValue>,
    /// Sensitive outputs.
    pub sensitive: BTreeMap<String, OutputValue>,
}

impl OutputSet {
    /// Gets an output from either map.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.values.get(name).or_else(|| self.sensitive.get(name))
    }

    /// Returns true if `name` is a sensitive output.
    #[must_use]
    pub fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive.contains_key(name)
    }

    /// Total number of outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len() + self.sensitive.len()
    }

    /// Returns true if there are no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates all outputs by name with their sensitivity.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue, bool)> {
        let mut all: Vec<_> = self
            .values
            .iter()
            .map(|(k, v)| (k, v, false))
            .chain(self.sensitive.iter().map(|(k, v)| (k, v, true)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all.into_iter()
    }
}

/// Evaluates outputs against a state document.
#[derive(Debug)]
pub struct OutputExtractor<'a> {
    state: &'a StateDocument,
    unavailable: BTreeMap<ResourceId, String>,
}

impl<'a> OutputExtractor<'a> {
    /// Creates an extractor reading `state`.
    #[must_use]
    pub const fn new(state: &'a StateDocument) -> Self {
        Self {
            state,
            unavailable: BTreeMap::new(),
        }
    }

    /// Marks resources whose last action did not succeed.
    #[must_use]
    pub fn with_unavailable(
        mut self,
        resources: impl IntoIterator<Item = (ResourceId, String)>,
    ) -> Self {
        self.unavailable.extend(resources);
        self
    }

    /// Evaluates every output.
    #[must_use]
    pub fn extract(&self, outputs: &[OutputDefinition]) -> OutputSet {
        let mut set = OutputSet::default();
        for output in outputs {
            let value = self.evaluate(output);
            debug!(
                "Output {} is {}",
                output.name,
                if value.is_available() { "available" } else { "unavailable" }
            );
            if output.sensitive {
                set.sensitive.insert(output.name.clone(), value);
            } else {
                set.values.insert(output.name.clone(), value);
            }
        }
        set
    }

    /// Evaluates one output.
    #[must_use]
    pub fn evaluate(&self, output: &OutputDefinition) -> OutputValue {
        let mut references = Vec::new();
        output.value.collect_references(&mut references);

        if let Some((target, reason)) = references
            .iter()
            .find_map(|r| self.unavailable.get_key_value(&r.target))
        {
            return OutputValue::Unavailable {
                reason: format!("{target} {reason}"),
            };
        }

        if let Some(entry) = references
            .iter()
            .filter(|r| !r.target.is_data())
            .filter_map(|r| self.state.entry(&r.target))
            .find(|e| e.status != EntryStatus::Created)
        {
            let reason = match &entry.last_error {
                Some(error) => format!("{} {}: {error}", entry.id, entry.status),
                None => format!("{} {}", entry.id, entry.status),
            };
            return OutputValue::Unavailable { reason };
        }

        match output.value.resolve(self.state) {
            Resolution::Known(value) => OutputValue::Available { value },
            Resolution::Missing(reference) => {
                let reason = if self.state.live_entry(&reference.target).is_some()
                    || self.state.data.contains_key(&reference.target.to_string())
                {
                    format!("{} has no attribute '{}'", reference.target, reference.attribute)
                } else {
                    format!("{} is not in state", reference.target)
                };
                OutputValue::Unavailable { reason }
            }
            Resolution::Unknown => OutputValue::Unavailable {
                reason: String::from("value is not known yet"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reference, TemplatePart};
    use crate::state::StateEntry;
    use serde_json::json;

    fn instance() -> ResourceId {
        ResourceId::managed("aws_instance", "web")
    }

    fn public_ip() -> OutputDefinition {
        OutputDefinition {
            name: String::from("public_ip"),
            value: Value::reference(instance(), "public_ip"),
            sensitive: false,
            description: None,
        }
    }

    fn state_with_instance() -> StateDocument {
        let mut state = StateDocument::new("demo", "dev");
        state.upsert(StateEntry::created(
            instance(),
            String::from("i-1"),
            BTreeMap::new(),
            BTreeMap::from([(String::from("public_ip"), json!("54.1.2.3"))]),
            Vec::new(),
            0,
        ));
        state
    }

    #[test]
    fn test_available_and_sensitive_outputs() {
        let state = state_with_instance();
        let ssh = OutputDefinition {
            name: String::from("ssh"),
            value: Value::Template(vec![
                TemplatePart::Literal(String::from("ubuntu@")),
                TemplatePart::Reference(Reference {
                    target: instance(),
                    attribute: String::from("public_ip"),
                }),
            ]),
            sensitive: true,
            description: None,
        };

        let set = OutputExtractor::new(&state).extract(&[public_ip(), ssh]);
        assert_eq!(set.values["public_ip"].value(), Some(&json!("54.1.2.3")));
        assert_eq!(set.sensitive["ssh"].value(), Some(&json!("ubuntu@54.1.2.3")));
        assert!(set.is_sensitive("ssh"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_public_ip_unavailable_after_instance_failure() {
        let state = StateDocument::new("demo", "dev");
        let set = OutputExtractor::new(&state)
            .with_unavailable([(instance(), String::from("failed: quota exceeded"))])
            .extract(&[public_ip()]);

        match &set.values["public_ip"] {
            OutputValue::Unavailable { reason } => {
                assert!(reason.contains("aws_instance.web failed"));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_entry_is_unavailable_from_stored_state() {
        let mut state = state_with_instance();
        state.entries.get_mut("aws_instance.web").unwrap().mark(
            EntryStatus::Failed,
            Some(String::from("quota exceeded")),
        );

        let set = OutputExtractor::new(&state).extract(&[public_ip()]);
        assert_eq!(
            set.values["public_ip"],
            OutputValue::Unavailable {
                reason: String::from("aws_instance.web failed: quota exceeded")
            }
        );
    }

    #[test]
    fn test_absent_resource_is_unavailable_not_null() {
        let state = StateDocument::new("demo", "dev");
        let set = OutputExtractor::new(&state).extract(&[public_ip()]);
        assert_eq!(
            set.values["public_ip"],
            OutputValue::Unavailable {
                reason: String::from("aws_instance.web is not in state")
            }
        );
    }
}
