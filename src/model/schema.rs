//! Per-type attribute classification.
//!
//! Each attribute of a resource type is either updatable in place or forces
//! replacement when it changes. Types and attributes not listed anywhere are
//! treated as force-new.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::SchemaDeclaration;

/// How a changed attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    /// Changed in place with an update call.
    Updatable,
    /// Changing it destroys and recreates the resource.
    ForceNew,
}

/// Built-in schema table row.
struct SchemaRow {
    resource_type: &'static str,
    updatable: &'static [&'static str],
    force_new: &'static [&'static str],
    computed: &'static [&'static str],
}

const BUILTIN_SCHEMAS: &[SchemaRow] = &[
    SchemaRow {
        resource_type: "aws_vpc",
        updatable: &["enable_dns_support", "enable_dns_hostnames", "tags"],
        force_new: &["cidr_block", "instance_tenancy"],
        computed: &["arn", "default_route_table_id", "owner_id"],
    },
    SchemaRow {
        resource_type: "aws_subnet",
        updatable: &["map_public_ip_on_launch", "tags"],
        force_new: &["vpc_id", "cidr_block", "availability_zone"],
        computed: &["arn", "owner_id"],
    },
    SchemaRow {
        resource_type: "aws_internet_gateway",
        updatable: &["vpc_id", "tags"],
        force_new: &[],
        computed: &["arn", "owner_id"],
    },
    SchemaRow {
        resource_type: "aws_route_table",
        updatable: &["route", "tags"],
        force_new: &["vpc_id"],
        computed: &["arn", "owner_id"],
    },
    SchemaRow {
        resource_type: "aws_route_table_association",
        updatable: &["route_table_id"],
        force_new: &["subnet_id"],
        computed: &[],
    },
    SchemaRow {
        resource_type: "aws_security_group",
        updatable: &["ingress", "egress", "tags"],
        force_new: &["name", "description", "vpc_id"],
        computed: &["arn", "owner_id"],
    },
    SchemaRow {
        resource_type: "aws_key_pair",
        updatable: &["tags"],
        force_new: &["key_name", "public_key"],
        computed: &["arn", "fingerprint", "key_pair_id"],
    },
    SchemaRow {
        resource_type: "aws_instance",
        updatable: &["instance_type", "vpc_security_group_ids", "tags"],
        force_new: &[
            "ami",
            "subnet_id",
            "key_name",
            "availability_zone",
            "associate_public_ip_address",
            "user_data",
        ],
        computed: &[
            "arn",
            "public_ip",
            "private_ip",
            "public_dns",
            "private_dns",
            "instance_state",
        ],
    },
    SchemaRow {
        resource_type: "aws_eip",
        updatable: &["instance", "tags"],
        force_new: &["domain"],
        computed: &["public_ip", "allocation_id"],
    },
    SchemaRow {
        resource_type: "tls_private_key",
        updatable: &[],
        force_new: &["algorithm", "rsa_bits", "ecdsa_curve"],
        computed: &[
            "private_key_pem",
            "public_key_pem",
            "public_key_openssh",
            "public_key_fingerprint_md5",
        ],
    },
];

/// Attribute classification for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSchema {
    attributes: HashMap<String, AttributeKind>,
    computed: BTreeSet<String>,
}

impl ResourceSchema {
    /// Classifies an attribute; unlisted attributes force replacement.
    #[must_use]
    pub fn classify(&self, attribute: &str) -> AttributeKind {
        self.attributes
            .get(attribute)
            .copied()
            .unwrap_or(AttributeKind::ForceNew)
    }

    /// Returns true if the provider fills this attribute in.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        attribute == "id" || self.computed.contains(attribute)
    }

    /// Computed attribute names.
    pub fn computed(&self) -> impl Iterator<Item = &str> {
        self.computed.iter().map(String::as_str)
    }

    fn apply(&mut self, updatable: &[String], force_new: &[String], computed: &[String]) {
        for name in updatable {
            self.attributes.insert(name.clone(), AttributeKind::Updatable);
        }
        for name in force_new {
            self.attributes.insert(name.clone(), AttributeKind::ForceNew);
        }
        self.computed.extend(computed.iter().cloned());
    }
}

/// Schemas for every known resource type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, ResourceSchema>,
}

impl SchemaRegistry {
    /// Creates a registry with the built-in table.
    #[must_use]
    pub fn builtin() -> Self {
        let mut schemas = HashMap::new();
        for row in BUILTIN_SCHEMAS {
            let to_owned = |names: &[&str]| names.iter().map(|n| (*n).to_string()).collect::<Vec<_>>();
            let mut schema = ResourceSchema::default();
            schema.apply(
                &to_owned(row.updatable),
                &to_owned(row.force_new),
                &to_owned(row.computed),
            );
            schemas.insert(row.resource_type.to_string(), schema);
        }
        Self { schemas }
    }

    /// Merges configured overrides on top of the current table.
    pub fn extend(&mut self, declarations: &BTreeMap<String, SchemaDeclaration>) {
        for (resource_type, decl) in declarations {
            self.schemas
                .entry(resource_type.clone())
                .or_default()
                .apply(&decl.updatable, &decl.force_new, &decl.computed);
        }
    }

    /// Gets the schema of a resource type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.schemas.get(resource_type)
    }

    /// Returns true if the resource type has a schema.
    #[must_use]
    pub fn knows(&self, resource_type: &str) -> bool {
        self.schemas.contains_key(resource_type)
    }

    /// Classifies an attribute of a resource type.
    #[must_use]
    pub fn classify(&self, resource_type: &str, attribute: &str) -> AttributeKind {
        self.get(resource_type)
            .map_or(AttributeKind::ForceNew, |s| s.classify(attribute))
    }

    /// Returns true if the attribute is filled in by the provider.
    #[must_use]
    pub fn is_computed(&self, resource_type: &str, attribute: &str) -> bool {
        self.get(resource_type)
            .map_or(attribute == "id", |s| s.is_computed(attribute))
    }

    /// Returns true if any of the changed attributes forces replacement.
    #[must_use]
    pub fn requires_replacement<'a>(
        &self,
        resource_type: &str,
        changed: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        changed
            .into_iter()
            .any(|a| self.classify(resource_type, a) == AttributeKind::ForceNew)
    }
}
