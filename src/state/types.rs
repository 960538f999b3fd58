//! State types for tracking provisioned resources.
//!
//! These types represent the recorded state of a project: what was created,
//! with which provider identifiers and attributes, and what each resource
//! depended on when it was last applied.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::ConfigHasher;
use crate::error::{Result, StateError, TerraceError};
use crate::model::{Lookup, Reference, ReferenceResolver, ResourceId};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of run records kept in the history.
pub const MAX_HISTORY: usize = 100;

/// The complete persisted state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDocument {
    /// State format version.
    pub version: String,
    /// Identifier of this state history, fixed at first write.
    pub lineage: String,
    /// Incremented on every flush.
    pub serial: u64,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Resource entries keyed by `type.name`.
    #[serde(default)]
    pub entries: BTreeMap<String, StateEntry>,
    /// Resolved data sources keyed by `data.type.name`.
    #[serde(default)]
    pub data: BTreeMap<String, DataEntry>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
}

/// Recorded state of one managed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateEntry {
    /// Resource identity.
    pub id: ResourceId,
    /// Identifier assigned by the provider; absent if never created.
    #[serde(default)]
    pub provider_id: Option<String>,
    /// Current status.
    pub status: EntryStatus,
    /// Last-applied attribute snapshot, fully resolved.
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
    /// Attributes assigned by the provider.
    #[serde(default)]
    pub computed: BTreeMap<String, JsonValue>,
    /// Resources this one depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Declaration index when last applied.
    #[serde(default)]
    pub index: usize,
    /// Hash of the attribute snapshot.
    #[serde(default)]
    pub attributes_hash: String,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry was last updated.
    pub updated_at: DateTime<Utc>,
    /// Error of the last failed action.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Status of a state entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// The remote object exists and matches the snapshot.
    Created,
    /// The remote object was destroyed as the first phase of a replacement.
    Destroyed,
    /// The last action on this resource failed.
    Failed,
    /// The last action on this resource was abandoned by cancellation.
    Cancelled,
}

/// A resolved data source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataEntry {
    /// Attributes returned by the lookup.
    pub attributes: BTreeMap<String, JsonValue>,
    /// When the lookup ran.
    pub read_at: DateTime<Utc>,
}

/// A single run in the history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    /// Unique run identifier.
    pub run_id: String,
    /// Type of run.
    pub operation: RunOperation,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Configuration hash at time of the run.
    pub config_hash: String,
    /// Number of succeeded actions.
    pub succeeded: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// Number of cancelled actions.
    pub cancelled: usize,
    /// Whether every action succeeded.
    pub success: bool,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge to the configuration.
    Apply,
    /// Destroy everything.
    Destroy,
}

impl StateDocument {
    /// Creates an empty document with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: String::from(STATE_VERSION),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            project: project.to_string(),
            environment: environment.to_string(),
            entries: BTreeMap::new(),
            data: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Decodes and checks a persisted document.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the text is not a valid document or an entry is
    /// filed under the wrong key, and `VersionMismatch` for another format
    /// version.
    pub fn from_json(content: &str) -> Result<Self> {
        let document: Self = serde_json::from_str(content).map_err(|e| {
            TerraceError::State(StateError::corrupted(format!(
                "Failed to parse state: {e}"
            )))
        })?;

        if document.version != STATE_VERSION {
            return Err(TerraceError::State(StateError::VersionMismatch {
                expected: String::from(STATE_VERSION),
                found: document.version,
            }));
        }

        if let Some((key, entry)) = document
            .entries
            .iter()
            .find(|(key, entry)| **key != entry.id.to_string())
        {
            return Err(TerraceError::State(StateError::corrupted(format!(
                "entry for {} filed under key {key}",
                entry.id
            ))));
        }

        Ok(document)
    }

    /// Encodes the document.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            TerraceError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })
    }

    /// Gets an entry regardless of status.
    #[must_use]
    pub fn entry(&self, id: &ResourceId) -> Option<&StateEntry> {
        self.entries.get(&id.to_string())
    }

    /// Gets an entry only if its remote object exists.
    #[must_use]
    pub fn live_entry(&self, id: &ResourceId) -> Option<&StateEntry> {
        self.entry(id).filter(|e| e.is_live())
    }

    /// Iterates entries whose remote object exists.
    pub fn live_entries(&self) -> impl Iterator<Item = &StateEntry> {
        self.entries.values().filter(|e| e.is_live())
    }

    /// Inserts or replaces an entry.
    pub fn upsert(&mut self, entry: StateEntry) {
        self.entries.insert(entry.id.to_string(), entry);
        self.last_updated = Utc::now();
    }

    /// Removes an entry.
    pub fn remove(&mut self, id: &ResourceId) -> Option<StateEntry> {
        self.last_updated = Utc::now();
        self.entries.remove(&id.to_string())
    }

    /// Appends a run record, keeping the most recent [`MAX_HISTORY`].
    pub fn add_history(&mut self, record: RunRecord) {
        self.history.push(record);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.last_updated = Utc::now();
    }

    /// Counts entries per status.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<EntryStatus, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }
}

impl ReferenceResolver for StateDocument {
    fn lookup(&self, reference: &Reference) -> Lookup {
        let value = if reference.target.is_data() {
            self.data
                .get(&reference.target.to_string())
                .and_then(|d| d.attributes.get(&reference.attribute).cloned())
        } else {
            self.live_entry(&reference.target)
                .and_then(|e| e.lookup(&reference.attribute))
        };
        value.map_or(Lookup::Missing, Lookup::Known)
    }
}

impl StateEntry {
    /// Creates a live entry after a successful create or update.
    #[must_use]
    pub fn created(
        id: ResourceId,
        provider_id: String,
        attributes: BTreeMap<String, JsonValue>,
        computed: BTreeMap<String, JsonValue>,
        dependencies: Vec<ResourceId>,
        index: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider_id: Some(provider_id),
            status: EntryStatus::Created,
            attributes_hash: ConfigHasher::new().hash_attributes(&attributes),
            attributes,
            computed,
            dependencies,
            index,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Creates an entry for a resource that has no remote object.
    #[must_use]
    pub fn placeholder(id: ResourceId, status: EntryStatus, index: usize, error: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider_id: None,
            status,
            attributes: BTreeMap::new(),
            computed: BTreeMap::new(),
            dependencies: Vec::new(),
            index,
            attributes_hash: String::new(),
            created_at: now,
            updated_at: now,
            last_error: error,
        }
    }

    /// Records a successful in-place update, keeping the creation time.
    pub fn applied(
        &mut self,
        attributes: BTreeMap<String, JsonValue>,
        computed: BTreeMap<String, JsonValue>,
        dependencies: Vec<ResourceId>,
        index: usize,
    ) {
        self.attributes_hash = ConfigHasher::new().hash_attributes(&attributes);
        self.attributes = attributes;
        self.computed = computed;
        self.dependencies = dependencies;
        self.index = index;
        self.mark(EntryStatus::Created, None);
    }

    /// Returns true if the remote object exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.provider_id.is_some() && self.status != EntryStatus::Destroyed
    }

    /// Looks up an attribute: `id` is the provider identifier, then computed
    /// attributes, then the declared snapshot.
    #[must_use]
    pub fn lookup(&self, attribute: &str) -> Option<JsonValue> {
        if attribute == "id" {
            return self.provider_id.clone().map(JsonValue::String);
        }
        self.computed
            .get(attribute)
            .or_else(|| self.attributes.get(attribute))
            .cloned()
    }

    /// Sets the status and error, touching the update time.
    pub fn mark(&mut self, status: EntryStatus, error: Option<String>) {
        self.status = status;
        self.last_error = error;
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for RunOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vpc_entry() -> StateEntry {
        StateEntry::created(
            ResourceId::managed("aws_vpc", "main"),
            String::from("vpc-123"),
            BTreeMap::from([(String::from("cidr_block"), json!("10.0.0.0/16"))]),
            BTreeMap::from([(String::from("arn"), json!("arn:aws:ec2:vpc/vpc-123"))]),
            Vec::new(),
            0,
        )
    }

    #[test]
    fn test_lookup_order() {
        let entry = vpc_entry();
        assert_eq!(entry.lookup("id"), Some(json!("vpc-123")));
        assert_eq!(entry.lookup("arn"), Some(json!("arn:aws:ec2:vpc/vpc-123")));
        assert_eq!(entry.lookup("cidr_block"), Some(json!("10.0.0.0/16")));
        assert_eq!(entry.lookup("missing"), None);
    }

    #[test]
    fn test_destroyed_entry_is_not_live() {
        let mut doc = StateDocument::new("demo", "dev");
        let mut entry = vpc_entry();
        entry.mark(EntryStatus::Destroyed, None);
        doc.upsert(entry);

        let id = ResourceId::managed("aws_vpc", "main");
        assert!(doc.entry(&id).is_some());
        assert!(doc.live_entry(&id).is_none());
        assert_eq!(
            doc.lookup(&Reference { target: id, attribute: String::from("id") }),
            Lookup::Missing
        );
    }

    #[test]
    fn test_json_round_trip_and_checks() {
        let mut doc = StateDocument::new("demo", "dev");
        doc.upsert(vpc_entry());
        let decoded = StateDocument::from_json(&doc.to_json().unwrap()).unwrap();
        assert_eq!(decoded, doc);

        let mut wrong_version = doc.clone();
        wrong_version.version = String::from("99");
        let err = StateDocument::from_json(&wrong_version.to_json().unwrap()).unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::VersionMismatch { .. })));

        let err = StateDocument::from_json("{ not json").unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::Corrupted { .. })));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut doc = StateDocument::new("demo", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            doc.add_history(RunRecord {
                run_id: i.to_string(),
                operation: RunOperation::Apply,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                config_hash: String::new(),
                succeeded: 0,
                failed: 0,
                skipped: 0,
                cancelled: 0,
                success: true,
            });
        }
        assert_eq!(doc.history.len(), MAX_HISTORY);
        assert_eq!(doc.history[0].run_id, "5");
    }
}
