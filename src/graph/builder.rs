//! Dependency graph construction and queries.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::error::{ConfigError, Result, TerraceError};
use crate::model::{ResourceId, ResourceMode, ResourceSet};

use super::order::stable_order;

/// Directed acyclic graph of resources; an edge X -> Y means X depends on Y.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ResourceId>,
    index: HashMap<ResourceId, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
    rank: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

impl DependencyGraph {
    /// Builds the graph from references and `depends_on` entries.
    ///
    /// # Errors
    ///
    /// - `UnknownReference` if a resource depends on an undeclared identity.
    /// - `InvalidDataSource` if a data source depends on a managed resource.
    /// - `CyclicDependency` naming the resources of the first cycle found.
    pub fn build(resources: &ResourceSet) -> Result<Self> {
        let nodes: Vec<ResourceId> = resources.iter().map(|r| r.id.clone()).collect();
        let index: HashMap<ResourceId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut dependencies = vec![BTreeSet::new(); nodes.len()];
        let mut dependents = vec![BTreeSet::new(); nodes.len()];

        for (i, resource) in resources.iter().enumerate() {
            for target in resource.dependencies() {
                let Some(&j) = index.get(&target) else {
                    return Err(TerraceError::Config(ConfigError::UnknownReference {
                        source_resource: resource.id.to_string(),
                        target: target.to_string(),
                    }));
                };
                if resource.is_data() && target.mode == ResourceMode::Managed {
                    return Err(TerraceError::Config(ConfigError::InvalidDataSource {
                        resource: resource.id.to_string(),
                        target: target.to_string(),
                    }));
                }
                dependencies[i].insert(j);
                dependents[j].insert(i);
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(TerraceError::Config(ConfigError::CyclicDependency {
                resources: cycle.iter().map(|&i| nodes[i].to_string()).collect(),
            }));
        }

        let edges: Vec<(usize, usize)> = dependencies
            .iter()
            .enumerate()
            .flat_map(|(node, deps)| deps.iter().map(move |&dep| (dep, node)))
            .collect();
        let order = stable_order(nodes.len(), &edges, |n| n)
            .ok_or_else(|| TerraceError::internal("acyclic graph failed to order"))?;

        let mut rank = vec![0; nodes.len()];
        for (position, &node) in order.iter().enumerate() {
            rank[node] = position;
        }

        debug!(
            "Built dependency graph: {} nodes, {} edges",
            nodes.len(),
            edges.len()
        );

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
            order,
            rank,
        })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if the identity is a node.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Resources in creation order: dependencies first, ties broken by
    /// declaration order.
    pub fn topological_order(&self) -> impl Iterator<Item = &ResourceId> {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    /// Resources in destruction order, the exact reverse of creation order.
    pub fn reverse_topological_order(&self) -> impl Iterator<Item = &ResourceId> {
        self.order.iter().rev().map(|&i| &self.nodes[i])
    }

    /// Position of a resource in creation order.
    #[must_use]
    pub fn rank(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).map(|&i| self.rank[i])
    }

    /// Direct dependencies of a resource, in declaration order.
    #[must_use]
    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbours(id, &self.dependencies)
    }

    /// Direct dependents of a resource, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbours(id, &self.dependents)
    }

    /// Every resource that depends on `id`, directly or transitively.
    #[must_use]
    pub fn transitive_dependents(&self, id: &ResourceId) -> BTreeSet<&ResourceId> {
        let mut found = BTreeSet::new();
        let Some(&start) = self.index.get(id) else {
            return found;
        };
        let mut pending = vec![start];
        let mut seen = BTreeSet::new();
        while let Some(node) = pending.pop() {
            for &next in &self.dependents[node] {
                if seen.insert(next) {
                    found.insert(&self.nodes[next]);
                    pending.push(next);
                }
            }
        }
        found
    }

    /// All edges as (dependent, dependency) pairs, in declaration order.
    #[must_use]
    pub fn edges(&self) -> Vec<(&ResourceId, &ResourceId)> {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(node, deps)| deps.iter().map(move |&dep| (&self.nodes[node], &self.nodes[dep])))
            .collect()
    }

    fn neighbours<'a>(&'a self, id: &ResourceId, table: &[BTreeSet<usize>]) -> Vec<&'a ResourceId> {
        self.index
            .get(id)
            .map(|&i| table[i].iter().map(|&j| &self.nodes[j]).collect())
            .unwrap_or_default()
    }
}

/// Depth-first search with three-colour marking; returns the members of the
/// first cycle found, in cycle order.
fn find_cycle(dependencies: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut stack = Vec::new();

    for start in 0..dependencies.len() {
        if marks[start] == Mark::Unvisited {
            if let Some(cycle) = visit(start, dependencies, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit(
    node: usize,
    dependencies: &[BTreeSet<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::Visiting;
    stack.push(node);

    for &next in &dependencies[node] {
        match marks[next] {
            Mark::Visiting => {
                let start = stack.iter().position(|&n| n == next)?;
                return Some(stack[start..].to_vec());
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, dependencies, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Visited => {}
        }
    }

    stack.pop();
    marks[node] = Mark::Visited;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, Value};

    fn managed(t: &str, n: &str) -> ResourceId {
        ResourceId::managed(t, n)
    }

    fn network() -> ResourceSet {
        let vpc = managed("aws_vpc", "main");
        let subnet = managed("aws_subnet", "public");
        let sg = managed("aws_security_group", "web");
        let instance = managed("aws_instance", "web");

        let mut set = ResourceSet::new();
        // Declared out of dependency order on purpose.
        set.insert(
            Resource::new(instance.clone())
                .with_attribute("subnet_id", Value::reference(subnet.clone(), "id"))
                .with_attribute(
                    "vpc_security_group_ids",
                    Value::List(vec![Value::reference(sg.clone(), "id")]),
                ),
        )
        .unwrap();
        set.insert(
            Resource::new(sg).with_attribute("vpc_id", Value::reference(vpc.clone(), "id")),
        )
        .unwrap();
        set.insert(
            Resource::new(subnet).with_attribute("vpc_id", Value::reference(vpc.clone(), "id")),
        )
        .unwrap();
        set.insert(Resource::new(vpc).with_attribute("cidr_block", Value::string("10.0.0.0/16")))
            .unwrap();
        set
    }

    fn names<'a>(ids: impl Iterator<Item = &'a ResourceId>) -> Vec<String> {
        ids.map(ToString::to_string).collect()
    }

    #[test]
    fn test_creation_order_respects_dependencies() {
        let graph = DependencyGraph::build(&network()).unwrap();
        assert_eq!(
            names(graph.topological_order()),
            vec![
                "aws_vpc.main",
                "aws_security_group.web",
                "aws_subnet.public",
                "aws_instance.web",
            ]
        );
    }

    #[test]
    fn test_destroy_order_is_exact_reverse() {
        let graph = DependencyGraph::build(&network()).unwrap();
        let mut forward = names(graph.topological_order());
        forward.reverse();
        assert_eq!(names(graph.reverse_topological_order()), forward);
    }

    #[test]
    fn test_every_edge_is_respected() {
        let graph = DependencyGraph::build(&network()).unwrap();
        for (dependent, dependency) in graph.edges() {
            assert!(graph.rank(dependency) < graph.rank(dependent));
        }
    }

    #[test]
    fn test_cycle_names_members() {
        let x = managed("test_thing", "x");
        let y = managed("test_thing", "y");
        let mut set = ResourceSet::new();
        set.insert(Resource::new(x.clone()).with_attribute("peer", Value::reference(y.clone(), "id")))
            .unwrap();
        set.insert(Resource::new(y).with_attribute("peer", Value::reference(x, "id")))
            .unwrap();

        let err = DependencyGraph::build(&set).unwrap_err();
        match err {
            TerraceError::Config(ConfigError::CyclicDependency { resources }) => {
                assert_eq!(resources, vec!["test_thing.x", "test_thing.y"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let x = managed("test_thing", "x");
        let mut set = ResourceSet::new();
        set.insert(Resource::new(x.clone()).with_attribute("me", Value::reference(x, "id")))
            .unwrap();
        assert!(DependencyGraph::build(&set).is_err());
    }

    #[test]
    fn test_unknown_reference() {
        let mut set = ResourceSet::new();
        set.insert(
            Resource::new(managed("aws_subnet", "a"))
                .with_attribute("vpc_id", Value::reference(managed("aws_vpc", "ghost"), "id")),
        )
        .unwrap();
        let err = DependencyGraph::build(&set).unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_data_source_cannot_reference_managed() {
        let mut set = ResourceSet::new();
        set.insert(Resource::new(managed("aws_vpc", "main"))).unwrap();
        set.insert(
            Resource::new(ResourceId::data("aws_ami", "x"))
                .with_attribute("owner", Value::reference(managed("aws_vpc", "main"), "owner_id")),
        )
        .unwrap();
        let err = DependencyGraph::build(&set).unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::InvalidDataSource { .. })
        ));
    }

    #[test]
    fn test_queries() {
        let graph = DependencyGraph::build(&network()).unwrap();
        let vpc = managed("aws_vpc", "main");
        assert_eq!(graph.dependents(&vpc).len(), 2);
        assert_eq!(graph.transitive_dependents(&vpc).len(), 3);
        assert_eq!(
            names(graph.dependencies(&managed("aws_instance", "web")).into_iter()),
            vec!["aws_security_group.web", "aws_subnet.public"]
        );
    }
}
