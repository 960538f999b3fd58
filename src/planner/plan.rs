//! Execution plans.
//!
//! A plan is an ordered list of actions with explicit dependencies between
//! them. Ordering rules:
//!
//! - creates and updates follow the dependency graph;
//! - destroys run dependents first, using the dependencies recorded in state;
//! - a replacement destroys the old object before creating the new one;
//! - a resource that used to depend on a removed resource is applied before
//!   that resource is destroyed.
//!
//! A plan is a pure value; building one never touches the state store.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, TerraceError};
use crate::graph::{stable_order, DependencyGraph};
use crate::model::{ResourceId, ResourceSet};
use crate::state::StateDocument;

use super::diff::{DiffResult, DiffType, PlanMode};

/// A complete execution plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Configuration hash this plan is based on.
    pub config_hash: String,
    /// Apply or destroy.
    pub mode: PlanMode,
    /// State serial the plan was computed against.
    pub state_serial: u64,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedAction {
    /// Resource the action applies to.
    pub resource: ResourceId,
    /// What to do.
    pub kind: ActionKind,
    /// Changed attribute names (updates and replacements).
    pub changed: Vec<String>,
    /// Why.
    pub reason: String,
    /// Provider identifier of the existing object, if any.
    pub provider_id: Option<String>,
    /// Declaration index of the resource.
    pub index: usize,
    /// Indices of actions that must finish first.
    pub dependencies: Vec<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Nothing to do.
    Noop,
    /// Create a new object.
    Create,
    /// Update the object in place.
    Update,
    /// One phase of a replacement.
    Replace(ReplacePhase),
    /// Destroy the object.
    Destroy,
}

/// The two ordered phases of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePhase {
    /// Destroy the old object.
    DestroyOld,
    /// Create the new object.
    CreateNew,
}

/// Resource-level change counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to destroy.
    pub destroy: usize,
    /// Unchanged resources.
    pub noop: usize,
}

impl ActionKind {
    /// Returns true if the action removes a remote object.
    #[must_use]
    pub const fn is_destroy(self) -> bool {
        matches!(self, Self::Destroy | Self::Replace(ReplacePhase::DestroyOld))
    }

    /// Returns true if the action creates a remote object.
    #[must_use]
    pub const fn is_create(self) -> bool {
        matches!(self, Self::Create | Self::Replace(ReplacePhase::CreateNew))
    }

    /// Returns true if the action changes anything.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Noop)
    }
}

/// A node of the action graph before ordering.
#[derive(Debug)]
struct Node<'a> {
    diff_index: usize,
    kind: ActionKind,
    destroy_phase: bool,
    rank: usize,
    resource: &'a ResourceId,
}

impl Plan {
    /// Creates a plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns an internal error if no consistent order exists, which only
    /// happens if the dependency graph itself is cyclic.
    pub fn from_diff(
        diff: &DiffResult,
        graph: &DependencyGraph,
        resources: &ResourceSet,
        state: &StateDocument,
        mode: PlanMode,
        config_hash: &str,
    ) -> Result<Self> {
        let mut nodes: Vec<Node<'_>> = Vec::new();
        let mut apply_node: HashMap<&ResourceId, usize> = HashMap::new();
        let mut destroy_node: HashMap<&ResourceId, usize> = HashMap::new();

        for (diff_index, resource_diff) in diff.diffs.iter().enumerate() {
            let id = &resource_diff.id;
            let rank = graph.rank(id).unwrap_or(usize::MAX);
            let mut push = |kind: ActionKind, destroy_phase: bool| {
                nodes.push(Node {
                    diff_index,
                    kind,
                    destroy_phase,
                    rank,
                    resource: id,
                });
                nodes.len() - 1
            };

            match resource_diff.diff_type {
                DiffType::Create => {
                    apply_node.insert(id, push(ActionKind::Create, false));
                }
                DiffType::Update => {
                    apply_node.insert(id, push(ActionKind::Update, false));
                }
                DiffType::NoChange => {
                    apply_node.insert(id, push(ActionKind::Noop, false));
                }
                DiffType::Replace => {
                    destroy_node.insert(id, push(ActionKind::Replace(ReplacePhase::DestroyOld), true));
                    apply_node.insert(id, push(ActionKind::Replace(ReplacePhase::CreateNew), false));
                }
                DiffType::Destroy => {
                    destroy_node.insert(id, push(ActionKind::Destroy, true));
                }
            }
        }

        let recorded = |id: &ResourceId| -> Vec<ResourceId> {
            state.entry(id).map(|e| e.dependencies.clone()).unwrap_or_default()
        };

        // Apply in dependency order.
        let mut apply_edges = Vec::new();
        for (&id, &node) in &apply_node {
            for dep in graph.dependencies(id) {
                if let Some(&before) = apply_node.get(dep) {
                    apply_edges.push((before, node));
                }
            }
        }

        // Destroy dependents before their dependencies.
        let mut destroy_edges = Vec::new();
        for (&id, &node) in &destroy_node {
            for dep in recorded(id) {
                if let Some(&after) = destroy_node.get(&dep) {
                    destroy_edges.push((node, after));
                }
            }
        }
        let destroy_rank = destroy_positions(&nodes, &destroy_node, &destroy_edges, state);
        if destroy_rank.is_none() {
            warn!("Recorded dependencies are cyclic; destroys are ordered by declaration only");
            destroy_edges.clear();
        }
        let destroy_rank = destroy_rank
            .or_else(|| destroy_positions(&nodes, &destroy_node, &[], state))
            .unwrap_or_default();

        // Old objects go before their replacements.
        let mut replace_edges = Vec::new();
        for (&id, &destroy) in &destroy_node {
            if let Some(&create) = apply_node.get(id) {
                replace_edges.push((destroy, create));
            }
        }

        // Detach former dependents before destroying what they used to need.
        let mut detach_edges = Vec::new();
        for (&id, &node) in &apply_node {
            for dep in recorded(id) {
                let orphan = destroy_node
                    .get(&dep)
                    .filter(|&&d| nodes[d].kind == ActionKind::Destroy);
                if let Some(&destroy) = orphan {
                    detach_edges.push((node, destroy));
                }
            }
        }

        let key = |n: usize| {
            let node = &nodes[n];
            if node.destroy_phase {
                (0_u8, destroy_rank.get(&n).copied().unwrap_or(usize::MAX), n)
            } else {
                (1_u8, node.rank, n)
            }
        };

        let base: Vec<(usize, usize)> = apply_edges
            .iter()
            .chain(&replace_edges)
            .chain(&destroy_edges)
            .copied()
            .collect();
        let with_detach: Vec<(usize, usize)> = base.iter().chain(&detach_edges).copied().collect();

        let (order, edges) = if let Some(order) = stable_order(nodes.len(), &with_detach, key) {
            (order, with_detach)
        } else if let Some(order) = stable_order(nodes.len(), &base, key) {
            warn!("Dropping detach ordering to keep the plan acyclic");
            (order, base)
        } else {
            let minimal: Vec<(usize, usize)> =
                apply_edges.iter().chain(&replace_edges).copied().collect();
            let order = stable_order(nodes.len(), &minimal, key).ok_or_else(|| {
                TerraceError::internal("dependency graph produced a cyclic plan")
            })?;
            warn!("Dropping destroy ordering to keep the plan acyclic");
            (order, minimal)
        };

        let mut position = vec![0; nodes.len()];
        for (pos, &node) in order.iter().enumerate() {
            position[node] = pos;
        }

        let mut dependencies: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); nodes.len()];
        for (before, after) in edges {
            dependencies[position[after]].insert(position[before]);
        }

        let actions: Vec<PlannedAction> = order
            .iter()
            .enumerate()
            .map(|(pos, &n)| {
                let node = &nodes[n];
                let resource_diff = &diff.diffs[node.diff_index];
                let entry = state.live_entry(node.resource);
                PlannedAction {
                    resource: node.resource.clone(),
                    kind: node.kind,
                    changed: resource_diff.changed_names(),
                    reason: resource_diff.reason.clone(),
                    provider_id: entry.and_then(|e| e.provider_id.clone()),
                    index: resources
                        .get(node.resource)
                        .map(|r| r.index)
                        .or_else(|| state.entry(node.resource).map(|e| e.index))
                        .unwrap_or(usize::MAX),
                    dependencies: dependencies[pos].iter().copied().collect(),
                }
            })
            .collect();

        debug!("Planned {} actions", actions.len());

        Ok(Self {
            created_at: Utc::now(),
            config_hash: config_hash.to_string(),
            mode,
            state_serial: state.serial,
            actions,
        })
    }

    /// Returns true if the plan has no actions at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if any action changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.kind.is_change())
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Counts changes per resource; a replacement counts once.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Noop => summary.noop += 1,
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Replace(ReplacePhase::CreateNew) => summary.replace += 1,
                ActionKind::Replace(ReplacePhase::DestroyOld) => {}
                ActionKind::Destroy => summary.destroy += 1,
            }
        }
        summary
    }

    /// Position of the first action of `kind` on `resource`.
    #[must_use]
    pub fn position(&self, resource: &ResourceId, kind: ActionKind) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| a.resource == *resource && a.kind == kind)
    }
}

/// Positions of destroy nodes in the destroy order: the reverse of a stable
/// topological order over recorded dependencies, keyed by declaration index.
fn destroy_positions(
    nodes: &[Node<'_>],
    destroy_node: &HashMap<&ResourceId, usize>,
    destroy_edges: &[(usize, usize)],
    state: &StateDocument,
) -> Option<HashMap<usize, usize>> {
    let mut members: Vec<usize> = destroy_node.values().copied().collect();
    members.sort_unstable();
    let local: HashMap<usize, usize> = members.iter().enumerate().map(|(i, &n)| (n, i)).collect();

    // Creation order: dependency before dependent, so flip each destroy edge.
    let creation_edges: Vec<(usize, usize)> = destroy_edges
        .iter()
        .map(|&(dependent, dependency)| (local[&dependency], local[&dependent]))
        .collect();
    let key = |i: usize| {
        let resource = nodes[members[i]].resource;
        (
            state.entry(resource).map_or(usize::MAX, |e| e.index),
            resource.to_string(),
        )
    };

    let creation = stable_order(members.len(), &creation_edges, key)?;
    Some(
        creation
            .into_iter()
            .rev()
            .enumerate()
            .map(|(pos, i)| (members[i], pos))
            .collect(),
    )
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Noop => "noop",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace(ReplacePhase::DestroyOld) => "replace (destroy old)",
            Self::Replace(ReplacePhase::CreateNew) => "replace (create new)",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        let summary = self.summary();
        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to destroy",
            summary.create, summary.update, summary.replace, summary.destroy
        )?;
        for (i, action) in self.actions.iter().enumerate().filter(|(_, a)| a.kind.is_change()) {
            writeln!(f, "  {i}. {action}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{Resource, ResourceSet, SchemaRegistry, Value};
    use crate::planner::DiffEngine;
    use crate::state::StateEntry;

    fn id(t: &str, n: &str) -> ResourceId {
        ResourceId::managed(t, n)
    }

    /// vpc <- sg, vpc <- subnet, (subnet, sg) <- instance.
    fn network() -> ResourceSet {
        let vpc = id("aws_vpc", "main");
        let sg = id("aws_security_group", "web");
        let subnet = id("aws_subnet", "public");
        let mut set = ResourceSet::new();
        set.insert(Resource::new(vpc.clone()).with_attribute("cidr_block", Value::string("10.0.0.0/16")))
            .unwrap();
        set.insert(Resource::new(sg.clone()).with_attribute("vpc_id", Value::reference(vpc.clone(), "id")))
            .unwrap();
        set.insert(
            Resource::new(subnet.clone())
                .with_attribute("vpc_id", Value::reference(vpc, "id"))
                .with_attribute("cidr_block", Value::string("10.0.1.0/24")),
        )
        .unwrap();
        set.insert(
            Resource::new(id("aws_instance", "web"))
                .with_attribute("ami", Value::string("ami-1"))
                .with_attribute("subnet_id", Value::reference(subnet, "id"))
                .with_attribute(
                    "vpc_security_group_ids",
                    Value::List(vec![Value::reference(sg, "id")]),
                ),
        )
        .unwrap();
        set
    }

    /// State as if `resources` had been applied with deterministic ids.
    fn applied(resources: &ResourceSet) -> StateDocument {
        let mut state = StateDocument::new("demo", "dev");
        let graph = DependencyGraph::build(resources).unwrap();
        for rid in graph.topological_order() {
            let resource = resources.get(rid).unwrap();
            let attributes = resource.resolve_attributes(&state).unwrap();
            state.upsert(StateEntry::created(
                rid.clone(),
                format!("{}-id", rid.name),
                attributes,
                BTreeMap::new(),
                resource.managed_dependencies(),
                resource.index,
            ));
        }
        state
    }

    fn plan(resources: &ResourceSet, state: &StateDocument, mode: PlanMode) -> Plan {
        let graph = DependencyGraph::build(resources).unwrap();
        let schemas = SchemaRegistry::builtin();
        let diff = DiffEngine::new(&graph, resources, state, &schemas).compute_diff(mode);
        Plan::from_diff(&diff, &graph, resources, state, mode, "hash").unwrap()
    }

    fn order(plan: &Plan) -> Vec<String> {
        plan.actions
            .iter()
            .filter(|a| a.kind.is_change())
            .map(|a| a.resource.to_string())
            .collect()
    }

    #[test]
    fn test_create_order_follows_graph() {
        let plan = plan(&network(), &StateDocument::new("d", "e"), PlanMode::Apply);
        assert_eq!(
            order(&plan),
            vec![
                "aws_vpc.main",
                "aws_security_group.web",
                "aws_subnet.public",
                "aws_instance.web"
            ]
        );
        let instance = &plan.actions[3];
        assert_eq!(instance.dependencies, vec![1, 2]);
    }

    #[test]
    fn test_destroy_order_is_exact_reverse() {
        let resources = network();
        let state = applied(&resources);
        let create = plan(&resources, &StateDocument::new("d", "e"), PlanMode::Apply);
        let destroy = plan(&resources, &state, PlanMode::Destroy);

        let mut expected = order(&create);
        expected.reverse();
        assert_eq!(order(&destroy), expected);
        assert!(destroy.actions.iter().all(|a| a.kind == ActionKind::Destroy));
    }

    #[test]
    fn test_reapply_is_all_noop() {
        let resources = network();
        let plan = plan(&resources, &applied(&resources), PlanMode::Apply);
        assert!(!plan.has_changes());
        assert_eq!(plan.summary().noop, 4);
    }

    #[test]
    fn test_replacement_phases_are_ordered() {
        let resources = network();
        let state = applied(&resources);

        let mut changed = ResourceSet::new();
        for resource in resources.iter() {
            let mut resource = resource.clone();
            if resource.id == id("aws_subnet", "public") {
                resource
                    .attributes
                    .insert(String::from("cidr_block"), Value::string("10.0.2.0/24"));
            }
            changed.insert(resource).unwrap();
        }

        let plan = plan(&changed, &state, PlanMode::Apply);
        let subnet = id("aws_subnet", "public");
        let instance = id("aws_instance", "web");
        let destroy_old = plan.position(&subnet, ActionKind::Replace(ReplacePhase::DestroyOld)).unwrap();
        let create_new = plan.position(&subnet, ActionKind::Replace(ReplacePhase::CreateNew)).unwrap();
        let instance_old = plan.position(&instance, ActionKind::Replace(ReplacePhase::DestroyOld)).unwrap();
        let instance_new = plan.position(&instance, ActionKind::Replace(ReplacePhase::CreateNew)).unwrap();

        assert!(instance_old < destroy_old, "dependent's old object goes first");
        assert!(destroy_old < create_new);
        assert!(create_new < instance_new);
        assert!(plan.actions[create_new].dependencies.contains(&destroy_old));
        assert!(plan.actions[instance_new].dependencies.contains(&create_new));
        assert_eq!(plan.summary().replace, 2);
    }

    #[test]
    fn test_former_dependent_updates_before_orphan_destroy() {
        let vpc = id("aws_vpc", "main");
        let old_sg = id("aws_security_group", "old");
        let instance = id("aws_instance", "web");

        let mut before = ResourceSet::new();
        before.insert(Resource::new(vpc.clone()).with_attribute("cidr_block", Value::string("10.0.0.0/16"))).unwrap();
        before.insert(Resource::new(old_sg.clone()).with_attribute("vpc_id", Value::reference(vpc.clone(), "id"))).unwrap();
        before
            .insert(
                Resource::new(instance.clone())
                    .with_attribute("instance_type", Value::string("t3.micro"))
                    .with_depends_on(old_sg.clone()),
            )
            .unwrap();
        let state = applied(&before);

        let mut after = ResourceSet::new();
        after.insert(Resource::new(vpc).with_attribute("cidr_block", Value::string("10.0.0.0/16"))).unwrap();
        after
            .insert(Resource::new(instance.clone()).with_attribute("instance_type", Value::string("t3.large")))
            .unwrap();

        let plan = plan(&after, &state, PlanMode::Apply);
        let update = plan.position(&instance, ActionKind::Update).unwrap();
        let destroy = plan.position(&old_sg, ActionKind::Destroy).unwrap();
        assert!(update < destroy);
        assert!(plan.actions[destroy].dependencies.contains(&update));
        assert_eq!(plan.actions[destroy].provider_id.as_deref(), Some("old-id"));
    }
}
