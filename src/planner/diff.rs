//! Diff engine comparing desired resources with the state snapshot.
//!
//! Resources are compared in dependency order so that a resource referencing
//! something about to be created or replaced sees that value as unknown, and
//! an unknown value always counts as a change.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::graph::DependencyGraph;
use crate::model::{
    Lookup, Reference, ReferenceResolver, Resolution, ResourceId, ResourceSet, SchemaRegistry,
};
use crate::state::StateDocument;

/// Whether a plan converges to the configuration or tears everything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Converge the remote objects to the configuration.
    Apply,
    /// Destroy every live resource.
    Destroy,
}

/// Engine for computing diffs between desired resources and recorded state.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    graph: &'a DependencyGraph,
    resources: &'a ResourceSet,
    state: &'a StateDocument,
    schemas: &'a SchemaRegistry,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Human-readable reason.
    pub reason: String,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource can be changed in place.
    Update,
    /// Resource must be destroyed and created again.
    Replace,
    /// Resource must be destroyed.
    Destroy,
    /// Resource is unchanged.
    NoChange,
}

/// One changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Recorded value, if any.
    pub old: Option<JsonValue>,
    /// Planned value.
    pub new: PlannedValue,
    /// True if this change alone forces replacement.
    pub forces_replacement: bool,
}

/// A value as known at plan time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Known now.
    Known(JsonValue),
    /// Known only after apply.
    Unknown,
    /// The attribute is no longer declared.
    Removed,
}

/// Complete diff result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    /// Desired resources in dependency order, then resources to remove.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// Planned attribute values of a resource that changes in this plan.
#[derive(Debug)]
struct Pending {
    /// The remote object is new, so computed attributes are unknown.
    recreated: bool,
    /// Declared attributes; `None` is unknown.
    planned: BTreeMap<String, Option<JsonValue>>,
}

/// Resolves references against state, overlaid with pending changes.
struct PlanResolver<'a> {
    state: &'a StateDocument,
    pending: &'a HashMap<ResourceId, Pending>,
}

impl ReferenceResolver for PlanResolver<'_> {
    fn lookup(&self, reference: &Reference) -> Lookup {
        if let Some(pending) = self.pending.get(&reference.target) {
            match pending.planned.get(&reference.attribute) {
                Some(Some(value)) => return Lookup::Known(value.clone()),
                Some(None) => return Lookup::Unknown,
                None if pending.recreated => return Lookup::Unknown,
                None => {}
            }
        }
        match self.state.lookup(reference) {
            Lookup::Missing => Lookup::Unknown,
            found => found,
        }
    }
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine.
    #[must_use]
    pub const fn new(
        graph: &'a DependencyGraph,
        resources: &'a ResourceSet,
        state: &'a StateDocument,
        schemas: &'a SchemaRegistry,
    ) -> Self {
        Self {
            graph,
            resources,
            state,
            schemas,
        }
    }

    /// Computes the diff for `mode`.
    #[must_use]
    pub fn compute_diff(&self, mode: PlanMode) -> DiffResult {
        let mut result = DiffResult::default();

        if mode == PlanMode::Destroy {
            for entry in self.state.live_entries() {
                result.push(ResourceDiff {
                    id: entry.id.clone(),
                    diff_type: DiffType::Destroy,
                    changes: Vec::new(),
                    reason: String::from("destroy requested"),
                });
            }
            return result;
        }

        let mut pending: HashMap<ResourceId, Pending> = HashMap::new();

        for id in self.graph.topological_order() {
            let Some(resource) = self.resources.get(id).filter(|r| !r.is_data()) else {
                continue;
            };

            let planned: BTreeMap<String, Option<JsonValue>> = {
                let resolver = PlanResolver {
                    state: self.state,
                    pending: &pending,
                };
                resource
                    .attributes
                    .iter()
                    .map(|(name, value)| {
                        let resolved = match value.resolve(&resolver) {
                            Resolution::Known(v) => Some(v),
                            Resolution::Unknown | Resolution::Missing(_) => None,
                        };
                        (name.clone(), resolved)
                    })
                    .collect()
            };

            let diff = self.diff_resource(id, &planned);
            match diff.diff_type {
                DiffType::Create | DiffType::Replace => {
                    pending.insert(
                        id.clone(),
                        Pending {
                            recreated: true,
                            planned,
                        },
                    );
                }
                DiffType::Update => {
                    pending.insert(
                        id.clone(),
                        Pending {
                            recreated: false,
                            planned,
                        },
                    );
                }
                DiffType::NoChange | DiffType::Destroy => {}
            }
            result.push(diff);
        }

        for entry in self.state.live_entries() {
            if !self.resources.contains(&entry.id) {
                debug!("{} is no longer declared", entry.id);
                result.push(ResourceDiff {
                    id: entry.id.clone(),
                    diff_type: DiffType::Destroy,
                    changes: Vec::new(),
                    reason: String::from("no longer in configuration"),
                });
            }
        }

        result
    }

    fn diff_resource(
        &self,
        id: &ResourceId,
        planned: &BTreeMap<String, Option<JsonValue>>,
    ) -> ResourceDiff {
        let Some(entry) = self.state.live_entry(id) else {
            let reason = match self.state.entry(id) {
                Some(previous) => format!("previous object is {}", previous.status),
                None => String::from("not yet created"),
            };
            return ResourceDiff {
                id: id.clone(),
                diff_type: DiffType::Create,
                changes: planned
                    .iter()
                    .map(|(name, value)| AttributeChange {
                        name: name.clone(),
                        old: None,
                        new: value.clone().map_or(PlannedValue::Unknown, PlannedValue::Known),
                        forces_replacement: false,
                    })
                    .collect(),
                reason,
            };
        };

        let names: BTreeSet<&String> = planned.keys().chain(entry.attributes.keys()).collect();
        let changes: Vec<AttributeChange> = names
            .into_iter()
            .filter_map(|name| {
                let old = entry.attributes.get(name);
                let new = match planned.get(name) {
                    Some(Some(value)) if Some(value) == old => return None,
                    Some(Some(value)) => PlannedValue::Known(value.clone()),
                    Some(None) => PlannedValue::Unknown,
                    None => PlannedValue::Removed,
                };
                Some(AttributeChange {
                    name: name.clone(),
                    old: old.cloned(),
                    new,
                    forces_replacement: self
                        .schemas
                        .requires_replacement(&id.resource_type, [name.as_str()]),
                })
            })
            .collect();

        if changes.is_empty() {
            return ResourceDiff {
                id: id.clone(),
                diff_type: DiffType::NoChange,
                changes,
                reason: String::from("up to date"),
            };
        }

        let names = changes.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ");
        let (diff_type, reason) = if changes.iter().any(|c| c.forces_replacement) {
            let forcing = changes
                .iter()
                .filter(|c| c.forces_replacement)
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            (DiffType::Replace, format!("{forcing} forces replacement"))
        } else {
            (DiffType::Update, format!("{names} changed"))
        };

        ResourceDiff {
            id: id.clone(),
            diff_type,
            changes,
            reason,
        }
    }
}

impl DiffResult {
    fn push(&mut self, diff: ResourceDiff) {
        match diff.diff_type {
            DiffType::Create => self.creates += 1,
            DiffType::Update => self.updates += 1,
            DiffType::Replace => self.replaces += 1,
            DiffType::Destroy => self.destroys += 1,
            DiffType::NoChange => self.unchanged += 1,
        }
        self.diffs.push(diff);
    }

    /// Returns true if any resource changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.replaces + self.destroys > 0
    }

    /// Gets the diff of one resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.id == *id)
    }
}

impl ResourceDiff {
    /// Names of the changed attributes.
    #[must_use]
    pub fn changed_names(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.name.clone()).collect()
    }
}

impl fmt::Display for DiffType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown => write!(f, "(known after apply)"),
            Self::Removed => write!(f, "(removed)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, Value};
    use crate::state::{EntryStatus, StateEntry};
    use serde_json::json;

    fn vpc_id() -> ResourceId {
        ResourceId::managed("aws_vpc", "main")
    }

    fn subnet_id() -> ResourceId {
        ResourceId::managed("aws_subnet", "public")
    }

    fn resources(cidr: &str, tags: &str) -> ResourceSet {
        let mut set = ResourceSet::new();
        set.insert(
            Resource::new(vpc_id())
                .with_attribute("cidr_block", Value::string(cidr))
                .with_attribute("tags", Value::string(tags)),
        )
        .unwrap();
        set.insert(
            Resource::new(subnet_id())
                .with_attribute("vpc_id", Value::reference(vpc_id(), "id"))
                .with_attribute("cidr_block", Value::string("10.0.1.0/24")),
        )
        .unwrap();
        set
    }

    fn applied_state() -> StateDocument {
        let mut state = StateDocument::new("demo", "dev");
        state.upsert(StateEntry::created(
            vpc_id(),
            String::from("vpc-1"),
            BTreeMap::from([
                (String::from("cidr_block"), json!("10.0.0.0/16")),
                (String::from("tags"), json!("a")),
            ]),
            BTreeMap::new(),
            Vec::new(),
            0,
        ));
        state.upsert(StateEntry::created(
            subnet_id(),
            String::from("subnet-1"),
            BTreeMap::from([
                (String::from("vpc_id"), json!("vpc-1")),
                (String::from("cidr_block"), json!("10.0.1.0/24")),
            ]),
            BTreeMap::new(),
            vec![vpc_id()],
            1,
        ));
        state
    }

    fn diff(resources: &ResourceSet, state: &StateDocument, mode: PlanMode) -> DiffResult {
        let graph = DependencyGraph::build(resources).unwrap();
        let schemas = SchemaRegistry::builtin();
        DiffEngine::new(&graph, resources, state, &schemas).compute_diff(mode)
    }

    #[test]
    fn test_empty_state_creates_everything() {
        let result = diff(&resources("10.0.0.0/16", "a"), &StateDocument::new("d", "e"), PlanMode::Apply);
        assert_eq!(result.creates, 2);
        let subnet = result.get(&subnet_id()).unwrap();
        let vpc_ref = subnet.changes.iter().find(|c| c.name == "vpc_id").unwrap();
        assert_eq!(vpc_ref.new, PlannedValue::Unknown);
    }

    #[test]
    fn test_unchanged_input_is_noop() {
        let result = diff(&resources("10.0.0.0/16", "a"), &applied_state(), PlanMode::Apply);
        assert_eq!(result.unchanged, 2);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_updatable_change_is_update() {
        let result = diff(&resources("10.0.0.0/16", "b"), &applied_state(), PlanMode::Apply);
        let vpc = result.get(&vpc_id()).unwrap();
        assert_eq!(vpc.diff_type, DiffType::Update);
        assert_eq!(vpc.changed_names(), vec![String::from("tags")]);
        // The subnet only reads the vpc id, which an update keeps.
        assert_eq!(result.get(&subnet_id()).unwrap().diff_type, DiffType::NoChange);
    }

    #[test]
    fn test_force_new_change_cascades_to_dependents() {
        let result = diff(&resources("10.1.0.0/16", "a"), &applied_state(), PlanMode::Apply);
        assert_eq!(result.get(&vpc_id()).unwrap().diff_type, DiffType::Replace);
        // The new vpc id is unknown, and vpc_id forces a new subnet.
        assert_eq!(result.get(&subnet_id()).unwrap().diff_type, DiffType::Replace);
    }

    #[test]
    fn test_orphans_and_destroy_mode() {
        let mut only_vpc = ResourceSet::new();
        only_vpc
            .insert(
                Resource::new(vpc_id())
                    .with_attribute("cidr_block", Value::string("10.0.0.0/16"))
                    .with_attribute("tags", Value::string("a")),
            )
            .unwrap();
        let result = diff(&only_vpc, &applied_state(), PlanMode::Apply);
        assert_eq!(result.get(&subnet_id()).unwrap().diff_type, DiffType::Destroy);

        let result = diff(&only_vpc, &applied_state(), PlanMode::Destroy);
        assert_eq!(result.destroys, 2);
        assert_eq!(result.diffs.len(), 2);
    }

    #[test]
    fn test_failed_create_is_retried() {
        let mut state = StateDocument::new("demo", "dev");
        state.upsert(StateEntry::placeholder(vpc_id(), EntryStatus::Failed, 0, Some(String::from("quota"))));
        let result = diff(&resources("10.0.0.0/16", "a"), &state, PlanMode::Apply);
        let vpc = result.get(&vpc_id()).unwrap();
        assert_eq!(vpc.diff_type, DiffType::Create);
        assert_eq!(vpc.reason, "previous object is failed");
    }
}
