//! Resource identities and declared resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use serde_json::Value as JsonValue;

use crate::error::{ConfigError, ExecutionError, Result, TerraceError};

use super::value::{is_identifier, Reference, ReferenceResolver, Resolution, Value};

/// Whether a resource is provisioned or only looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    /// Created, updated and destroyed by the engine.
    Managed,
    /// Read-only lookup resolved before planning.
    Data,
}

/// Identity of a resource: (type, logical name), plus its mode.
///
/// Rendered as `type.name` for managed resources and `data.type.name` for
/// data sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Managed resource or data source.
    pub mode: ResourceMode,
    /// Resource type (e.g. `aws_vpc`).
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
}

impl ResourceId {
    /// Creates a managed resource identity.
    #[must_use]
    pub fn managed(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Managed,
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Creates a data source identity.
    #[must_use]
    pub fn data(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            mode: ResourceMode::Data,
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Returns true for data sources.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.mode == ResourceMode::Data
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ResourceMode::Managed => write!(f, "{}.{}", self.resource_type, self.name),
            ResourceMode::Data => write!(f, "data.{}.{}", self.resource_type, self.name),
        }
    }
}

impl FromStr for ResourceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| !is_identifier(p)) {
            return Err(ConfigError::expression(s, "not a resource address"));
        }
        match parts.as_slice() {
            ["data", resource_type, name] => Ok(Self::data(*resource_type, *name)),
            [resource_type, name] if *resource_type != "data" && *resource_type != "var" => {
                Ok(Self::managed(*resource_type, *name))
            }
            _ => Err(ConfigError::expression(
                s,
                "expected TYPE.NAME or data.TYPE.NAME",
            )),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = ConfigError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A declared infrastructure object.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Identity.
    pub id: ResourceId,
    /// Attribute values, variables already substituted.
    pub attributes: BTreeMap<String, Value>,
    /// Explicit ordering dependencies.
    pub depends_on: Vec<ResourceId>,
    /// Position in the declaration order.
    pub index: usize,
}

impl Resource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub const fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            index: 0,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_depends_on(mut self, target: ResourceId) -> Self {
        self.depends_on.push(target);
        self
    }

    /// Returns true for data sources.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.id.is_data()
    }

    /// Returns every cross-resource reference in the attribute values.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns the identities this resource depends on, first-seen order, no duplicates.
    #[must_use]
    pub fn dependencies(&self) -> Vec<ResourceId> {
        let mut seen = HashSet::new();
        self.references()
            .into_iter()
            .map(|r| &r.target)
            .chain(self.depends_on.iter())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Returns the managed resources this one depends on.
    #[must_use]
    pub fn managed_dependencies(&self) -> Vec<ResourceId> {
        self.dependencies().into_iter().filter(|id| !id.is_data()).collect()
    }

    /// Resolves every attribute to a concrete value.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedReference` naming the first reference that is
    /// missing or not yet known.
    pub fn resolve_attributes(
        &self,
        resolver: &dyn ReferenceResolver,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let unresolved = |reference: String| {
            TerraceError::Execution(ExecutionError::UnresolvedReference {
                resource: self.id.to_string(),
                reference,
            })
        };

        self.attributes
            .iter()
            .map(|(name, value)| match value.resolve(resolver) {
                Resolution::Known(v) => Ok((name.clone(), v)),
                Resolution::Missing(reference) => Err(unresolved(reference.to_string())),
                Resolution::Unknown => Err(unresolved(format!("{}.{name}", self.id))),
            })
            .collect()
    }
}

/// Declared resources keyed by identity, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceSet {
    /// Resources in declaration order.
    resources: Vec<Resource>,
    /// Identity to position.
    index: HashMap<ResourceId, usize>,
}

impl ResourceSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource, assigning its declaration index.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the identity is already present.
    pub fn insert(&mut self, mut resource: Resource) -> Result<()> {
        if self.index.contains_key(&resource.id) {
            return Err(TerraceError::Config(ConfigError::DuplicateResource {
                resource: resource.id.to_string(),
            }));
        }
        resource.index = self.resources.len();
        self.index.insert(resource.id.clone(), resource.index);
        self.resources.push(resource);
        Ok(())
    }

    /// Gets a resource by identity.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.resources[i])
    }

    /// Returns true if the identity is declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Iterates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Iterates managed resources in declaration order.
    pub fn managed(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| !r.is_data())
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_round_trip_through_string() {
        let managed: ResourceId = "aws_vpc.main".parse().expect("valid address");
        assert_eq!(managed, ResourceId::managed("aws_vpc", "main"));
        assert_eq!(managed.to_string(), "aws_vpc.main");

        let data: ResourceId = "data.aws_ami.ubuntu".parse().expect("valid address");
        assert!(data.is_data());
        assert_eq!(data.to_string(), "data.aws_ami.ubuntu");

        assert!("aws_vpc".parse::<ResourceId>().is_err());
        assert!("var.region".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut set = ResourceSet::new();
        set.insert(Resource::new(ResourceId::managed("aws_vpc", "main")))
            .expect("first insert");
        let err = set
            .insert(Resource::new(ResourceId::managed("aws_vpc", "main")))
            .expect_err("duplicate");
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_dependencies_are_deduplicated() {
        let vpc = ResourceId::managed("aws_vpc", "main");
        let resource = Resource::new(ResourceId::managed("aws_subnet", "public"))
            .with_attribute("vpc_id", Value::reference(vpc.clone(), "id"))
            .with_attribute("tags", Value::reference(vpc.clone(), "tags"))
            .with_depends_on(vpc.clone());

        assert_eq!(resource.dependencies(), vec![vpc]);
    }
}
