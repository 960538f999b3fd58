//! Provider adapter trait and the values exchanged with providers.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{ProviderError, Result, TerraceError};
use crate::model::ResourceId;

/// A resource whose attributes are fully resolved, ready for a provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedResource {
    /// Resource identity.
    pub id: ResourceId,
    /// Resolved attribute values.
    pub attributes: BTreeMap<String, JsonValue>,
}

impl ResolvedResource {
    /// Creates a resolved resource.
    #[must_use]
    pub const fn new(id: ResourceId, attributes: BTreeMap<String, JsonValue>) -> Self {
        Self { id, attributes }
    }

    /// Gets a string attribute.
    #[must_use]
    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(JsonValue::as_str)
    }
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Attributes assigned by the provider.
    #[serde(default)]
    pub computed: BTreeMap<String, JsonValue>,
}

/// Kinds of provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderOperation {
    /// Create a remote object.
    Create,
    /// Update a remote object in place.
    Update,
    /// Destroy a remote object.
    Destroy,
    /// Read a data source.
    Read,
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Read => "read",
        };
        write!(f, "{s}")
    }
}

/// A machine image known to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image identifier.
    pub image_id: String,
    /// Image name.
    pub name: String,
    /// Owning account.
    pub owner_id: String,
    /// Virtualization type (`hvm`, `paravirtual`).
    pub virtualization_type: String,
    /// Architecture.
    #[serde(default)]
    pub architecture: Option<String>,
    /// When the image was published.
    pub creation_date: DateTime<Utc>,
}

impl Image {
    /// Attributes exposed to `data.aws_ami.*` references.
    #[must_use]
    pub fn to_attributes(&self) -> BTreeMap<String, JsonValue> {
        let mut attributes = BTreeMap::from([
            (String::from("id"), json!(self.image_id)),
            (String::from("image_id"), json!(self.image_id)),
            (String::from("name"), json!(self.name)),
            (String::from("owner_id"), json!(self.owner_id)),
            (String::from("virtualization_type"), json!(self.virtualization_type)),
            (String::from("creation_date"), json!(self.creation_date.to_rfc3339())),
        ]);
        if let Some(arch) = &self.architecture {
            attributes.insert(String::from("architecture"), json!(arch));
        }
        attributes
    }
}

/// Image lookup criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageQuery {
    /// Glob patterns over image names (`*` and `?` wildcards); an image
    /// matching any of them qualifies.
    pub name_patterns: Vec<String>,
    /// Accepted owners; empty accepts any owner.
    #[serde(default)]
    pub owners: Vec<String>,
    /// Accepted virtualization types; empty accepts any.
    #[serde(default)]
    pub virtualization_types: Vec<String>,
    /// Pick the newest match instead of requiring a single one.
    #[serde(default)]
    pub most_recent: bool,
}

impl ImageQuery {
    /// Creates a query for the newest image matching `name_pattern`.
    #[must_use]
    pub fn newest(name_pattern: impl Into<String>) -> Self {
        Self {
            name_patterns: vec![name_pattern.into()],
            owners: Vec::new(),
            virtualization_types: Vec::new(),
            most_recent: true,
        }
    }

    /// Builds a query from `aws_ami` data-source attributes.
    ///
    /// Recognized attributes: `owners`, `most_recent`, and `filter`, a list
    /// of `{name, values}` where `name` is `name` or `virtualization-type`.
    /// Within one filter any value may match; separate filters must all match.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for unknown, repeated or malformed filters.
    pub fn from_attributes(attributes: &BTreeMap<String, JsonValue>) -> Result<Self> {
        let malformed = |detail: &str| {
            TerraceError::Provider(ProviderError::Unsupported {
                resource_type: String::from("aws_ami"),
                operation: format!("filter: {detail}"),
            })
        };

        let mut query = Self::newest("*");
        query.most_recent = attributes
            .get("most_recent")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        query.owners = string_list(attributes.get("owners"));

        let filters = attributes
            .get("filter")
            .map(|f| f.as_array().ok_or_else(|| malformed("expected a list")))
            .transpose()?
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut seen = HashSet::new();
        for filter in filters {
            let name = filter
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| malformed("missing name"))?;
            if !seen.insert(name) {
                return Err(malformed(&format!("'{name}' given more than once")));
            }
            let values = string_list(filter.get("values"));
            if values.is_empty() {
                return Err(malformed("missing values"));
            }
            match name {
                "name" => query.name_patterns = values,
                "virtualization-type" => query.virtualization_types = values,
                other => return Err(malformed(&format!("unknown filter '{other}'"))),
            }
        }

        Ok(query)
    }

    /// Returns true if `image` satisfies every criterion.
    ///
    /// # Errors
    ///
    /// Returns an error if the name pattern cannot be compiled.
    pub fn matches(&self, image: &Image) -> Result<bool> {
        Ok(self.accepts(&self.compile()?, image))
    }

    /// The name patterns joined for messages.
    #[must_use]
    pub fn describe(&self) -> String {
        self.name_patterns.join(", ")
    }

    fn compile(&self) -> Result<Vec<Regex>> {
        self.name_patterns.iter().map(|p| glob_to_regex(p)).collect()
    }

    fn accepts(&self, patterns: &[Regex], image: &Image) -> bool {
        patterns.iter().any(|p| p.is_match(&image.name))
            && (self.owners.is_empty() || self.owners.contains(&image.owner_id))
            && (self.virtualization_types.is_empty()
                || self.virtualization_types.contains(&image.virtualization_type))
    }

    /// Picks the image this query selects from a catalog.
    ///
    /// With `most_recent`, the newest match wins (ties go to the greater image
    /// id). Without it, exactly one image must match.
    ///
    /// # Errors
    ///
    /// Returns `NoMatchingImage` when nothing matches, and `Rejected` when
    /// several images match and `most_recent` is off.
    pub fn select<'a>(&self, images: impl IntoIterator<Item = &'a Image>) -> Result<Image> {
        let patterns = self.compile()?;
        let mut candidates: Vec<&Image> = images
            .into_iter()
            .filter(|image| self.accepts(&patterns, image))
            .collect();

        if candidates.len() > 1 && !self.most_recent {
            return Err(TerraceError::Provider(ProviderError::Rejected {
                operation: String::from("lookup_image"),
                resource: self.describe(),
                message: format!(
                    "{} images match; narrow the filters or set most_recent",
                    candidates.len()
                ),
            }));
        }

        candidates.sort_by(|a, b| {
            a.creation_date
                .cmp(&b.creation_date)
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        candidates.pop().cloned().ok_or_else(|| {
            TerraceError::Provider(ProviderError::NoMatchingImage {
                pattern: self.describe(),
            })
        })
    }
}

/// Converts a glob (`*`, `?`) into an anchored regular expression.
///
/// # Errors
///
/// Returns `Unsupported` if the resulting expression does not compile.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut pattern = String::from("^");
    let mut literal = String::new();
    for c in glob.chars() {
        match c {
            '*' | '?' => {
                pattern.push_str(&regex::escape(&literal));
                literal.clear();
                pattern.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| {
        TerraceError::Provider(ProviderError::Unsupported {
            resource_type: String::from("aws_ami"),
            operation: format!("name pattern '{glob}': {e}"),
        })
    })
}

fn string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(JsonValue::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

/// Operations the executor needs from a provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Creates the remote object.
    async fn create(&self, resource: &ResolvedResource) -> Result<ProviderResponse>;

    /// Updates the remote object in place, returning the new computed attributes.
    async fn update(
        &self,
        provider_id: &str,
        resource: &ResolvedResource,
        changed: &[String],
    ) -> Result<BTreeMap<String, JsonValue>>;

    /// Destroys the remote object. A missing object reports `NotFound`.
    async fn destroy(&self, id: &ResourceId, provider_id: &str) -> Result<()>;

    /// Finds the image selected by `query`.
    async fn lookup_image(&self, query: &ImageQuery) -> Result<Image>;

    /// Reads a data source.
    ///
    /// The default supports `aws_ami` through [`ProviderAdapter::lookup_image`].
    async fn read_data(&self, resource: &ResolvedResource) -> Result<BTreeMap<String, JsonValue>> {
        match resource.id.resource_type.as_str() {
            "aws_ami" => {
                let query = ImageQuery::from_attributes(&resource.attributes)?;
                Ok(self.lookup_image(&query).await?.to_attributes())
            }
            other => Err(TerraceError::Provider(ProviderError::Unsupported {
                resource_type: other.to_string(),
                operation: ProviderOperation::Read.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn image(id: &str, name: &str, owner: &str, day: u32) -> Image {
        Image {
            image_id: id.to_string(),
            name: name.to_string(),
            owner_id: owner.to_string(),
            virtualization_type: String::from("hvm"),
            architecture: Some(String::from("x86_64")),
            creation_date: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_glob_translation() {
        let re = glob_to_regex("ubuntu/images/*-22.04-?md64-*").unwrap();
        assert!(re.is_match("ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-20240101"));
        assert!(!re.is_match("ubuntu/images/hvm-ssd/ubuntu-focal-20.04-amd64-server-20240101"));
        assert!(glob_to_regex("a.b").unwrap().is_match("a.b"));
        assert!(!glob_to_regex("a.b").unwrap().is_match("axb"));
    }

    #[test]
    fn test_select_most_recent_match() {
        let catalog = vec![
            image("ami-old", "ubuntu-jammy-1", "099720109477", 1),
            image("ami-new", "ubuntu-jammy-2", "099720109477", 20),
            image("ami-foreign", "ubuntu-jammy-3", "111111111111", 28),
        ];
        let mut query = ImageQuery::newest("ubuntu-jammy-*");
        query.owners = vec![String::from("099720109477")];

        assert_eq!(query.select(&catalog).unwrap().image_id, "ami-new");

        query.most_recent = false;
        assert!(matches!(
            query.select(&catalog).unwrap_err(),
            TerraceError::Provider(ProviderError::Rejected { .. })
        ));

        let none = ImageQuery::newest("debian-*");
        assert!(matches!(
            none.select(&catalog).unwrap_err(),
            TerraceError::Provider(ProviderError::NoMatchingImage { .. })
        ));
    }

    mockall::mock! {
        pub Provider {}

        #[async_trait]
        impl ProviderAdapter for Provider {
            fn name(&self) -> &'static str;
            async fn create(&self, resource: &ResolvedResource) -> Result<ProviderResponse>;
            async fn update(
                &self,
                provider_id: &str,
                resource: &ResolvedResource,
                changed: &[String],
            ) -> Result<BTreeMap<String, JsonValue>>;
            async fn destroy(&self, id: &ResourceId, provider_id: &str) -> Result<()>;
            async fn lookup_image(&self, query: &ImageQuery) -> Result<Image>;
        }
    }

    #[tokio::test]
    async fn test_read_data_dispatches_ami_to_image_lookup() {
        let mut provider = MockProvider::new();
        provider
            .expect_lookup_image()
            .withf(|q| q.name_patterns == ["ubuntu-*"] && q.most_recent)
            .times(1)
            .returning(|_| Ok(image("ami-9", "ubuntu-1", "1", 3)));

        let ami = ResolvedResource::new(
            ResourceId::data("aws_ami", "ubuntu"),
            BTreeMap::from([
                (String::from("most_recent"), json!(true)),
                (String::from("filter"), json!([{"name": "name", "values": ["ubuntu-*"]}])),
            ]),
        );
        let attributes = provider.read_data(&ami).await.unwrap();
        assert_eq!(attributes["id"], json!("ami-9"));

        let other = ResolvedResource::new(ResourceId::data("aws_vpc", "default"), BTreeMap::new());
        assert!(matches!(
            provider.read_data(&other).await.unwrap_err(),
            TerraceError::Provider(ProviderError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_query_from_filter_list() {
        let attributes = BTreeMap::from([
            (String::from("most_recent"), json!(true)),
            (String::from("owners"), json!(["099720109477"])),
            (
                String::from("filter"),
                json!([
                    {"name": "name", "values": ["ubuntu-*"]},
                    {"name": "virtualization-type", "values": ["hvm"]}
                ]),
            ),
        ]);
        let query = ImageQuery::from_attributes(&attributes).unwrap();
        assert_eq!(query.name_patterns, vec!["ubuntu-*"]);
        assert_eq!(query.virtualization_types, vec!["hvm"]);
        assert!(query.most_recent);

        let bad = BTreeMap::from([(
            String::from("filter"),
            json!([{"name": "architecture", "values": ["arm64"]}]),
        )]);
        assert!(ImageQuery::from_attributes(&bad).is_err());
    }

    #[test]
    fn test_any_filter_value_may_match() {
        let attributes = BTreeMap::from([
            (String::from("most_recent"), json!(true)),
            (
                String::from("filter"),
                json!([
                    {"name": "name", "values": ["ubuntu-jammy-*", "debian-12-*"]},
                    {"name": "virtualization-type", "values": ["paravirtual", "hvm"]}
                ]),
            ),
        ]);
        let query = ImageQuery::from_attributes(&attributes).unwrap();
        let catalog = vec![
            image("ami-jammy", "ubuntu-jammy-1", "1", 1),
            image("ami-debian", "debian-12-1", "1", 5),
            image("ami-centos", "centos-9-1", "1", 9),
        ];

        assert!(query.matches(&catalog[0]).unwrap());
        assert!(!query.matches(&catalog[2]).unwrap());
        assert_eq!(query.select(&catalog).unwrap().image_id, "ami-debian");

        let mut pv_only = query.clone();
        pv_only.virtualization_types = vec![String::from("paravirtual")];
        match pv_only.select(&catalog).unwrap_err() {
            TerraceError::Provider(ProviderError::NoMatchingImage { pattern }) => {
                assert_eq!(pattern, "ubuntu-jammy-*, debian-12-*");
            }
            other => panic!("expected no match, got {other}"),
        }

        let repeated = BTreeMap::from([(
            String::from("filter"),
            json!([
                {"name": "name", "values": ["ubuntu-*"]},
                {"name": "name", "values": ["debian-*"]}
            ]),
        )]);
        assert!(ImageQuery::from_attributes(&repeated).is_err());
    }
}
