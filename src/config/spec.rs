//! Configuration specification types.
//!
//! This module defines the structs that map to the `terrace.yaml` file.
//! Resource and data declarations are read as ordered entry lists instead of
//! maps so that declaration order survives and duplicate keys can be reported
//! instead of silently collapsing.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};

use crate::model::VariableType;

/// The root configuration structure for a Terrace project.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TerraceConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider adapter configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution settings.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Declared input variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDeclaration>,
    /// Data source declarations (`type -> name -> attributes`).
    #[serde(default)]
    pub data: ResourceBlocks,
    /// Managed resource declarations (`type -> name -> attributes`).
    #[serde(default)]
    pub resources: ResourceBlocks,
    /// Named outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDeclaration>,
    /// Attribute classification overrides per resource type.
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaDeclaration>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Default region passed to the provider.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    /// Which adapter to use.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the remote provider API (http adapter only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Request timeout in seconds (http adapter only).
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// File where the simulated adapter persists its remote objects.
    #[serde(default)]
    pub path: Option<String>,
}

/// Provider adapter kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process deterministic provider.
    #[default]
    Simulated,
    /// Remote provider reached over HTTP.
    Http,
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Retries for retryable provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cancel the run after this many seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            timeout_secs: None,
        }
    }
}

/// A declared input variable.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct VariableDeclaration {
    /// Expected value type.
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    /// Default value.
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// A named output.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OutputDeclaration {
    /// Expression to evaluate after apply.
    pub value: serde_yaml::Value,
    /// Hide the value unless explicitly requested.
    #[serde(default)]
    pub sensitive: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Attribute classification override for one resource type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SchemaDeclaration {
    /// Attributes changed in place.
    #[serde(default)]
    pub updatable: Vec<String>,
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub force_new: Vec<String>,
    /// Attributes filled in by the provider.
    #[serde(default)]
    pub computed: Vec<String>,
}

/// One resource or data declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource type.
    pub resource_type: String,
    /// Logical name.
    pub name: String,
    /// Attribute entries in file order.
    pub attributes: AttributeBlock,
}

/// Attribute entries of one declaration, in file order, duplicates preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeBlock(pub Vec<(String, serde_yaml::Value)>);

/// All declarations of a `resources:` or `data:` section, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceBlocks(pub Vec<ResourceDeclaration>);

/// A mapping read as an ordered list of entries.
struct Entries<T>(Vec<(String, T)>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<T>(std::marker::PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Entries(Vec::new()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_any(EntriesVisitor(std::marker::PhantomData))
    }
}

impl<'de> Deserialize<'de> for AttributeBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Entries::<serde_yaml::Value>::deserialize(deserializer).map(|e| Self(e.0))
    }
}

impl<'de> Deserialize<'de> for ResourceBlocks {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let by_type = Entries::<Entries<AttributeBlock>>::deserialize(deserializer)?;
        let declarations = by_type
            .0
            .into_iter()
            .flat_map(|(resource_type, named)| {
                named.0.into_iter().map(move |(name, attributes)| ResourceDeclaration {
                    resource_type: resource_type.clone(),
                    name,
                    attributes,
                })
            })
            .collect();
        Ok(Self(declarations))
    }
}

// Default value functions

const fn default_parallelism() -> usize {
    10
}

const fn default_max_retries() -> u32 {
    2
}

fn default_environment() -> String {
    String::from("dev")
}

impl TerraceConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the number of managed resource declarations.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.0.len()
    }

    /// Iterates data declarations followed by managed declarations.
    pub fn declarations(&self) -> impl Iterator<Item = (bool, &ResourceDeclaration)> {
        self.data
            .0
            .iter()
            .map(|d| (true, d))
            .chain(self.resources.0.iter().map(|d| (false, d)))
    }
}

impl AttributeBlock {
    /// Looks up the first entry with the given key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterates attribute names in file order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }
}
