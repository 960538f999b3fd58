//! Configuration and attribute hashing for change detection.
//!
//! The configuration hash is recorded with each run in the state history; the
//! attribute hash is recorded with each state entry so that a reader can tell
//! whether two snapshots differ without comparing them field by field.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::spec::{ResourceDeclaration, TerraceConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the project, variables, declarations and outputs.
    #[must_use]
    pub fn hash_config(&self, config: &TerraceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        if let Some(region) = &config.project.region {
            hasher.update(region.as_bytes());
        }

        // Variables and outputs are BTreeMaps, already sorted.
        for (name, decl) in &config.variables {
            hasher.update(name.as_bytes());
            hasher.update(decl.var_type.to_string().as_bytes());
            if let Some(default) = &decl.default {
                hasher.update(yaml_bytes(default));
            }
        }

        for (is_data, decl) in config.declarations() {
            hasher.update(if is_data { [1u8] } else { [0u8] });
            hasher.update(self.hash_declaration(decl).as_bytes());
        }

        for (name, output) in &config.outputs {
            hasher.update(name.as_bytes());
            hasher.update(yaml_bytes(&output.value));
            hasher.update(if output.sensitive { [1u8] } else { [0u8] });
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single declaration, in file order.
    #[must_use]
    pub fn hash_declaration(&self, decl: &ResourceDeclaration) -> String {
        let mut hasher = Sha256::new();
        hasher.update(decl.resource_type.as_bytes());
        hasher.update(decl.name.as_bytes());
        for (key, value) in &decl.attributes.0 {
            hasher.update(key.as_bytes());
            hasher.update(yaml_bytes(value));
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of resolved attribute values.
    ///
    /// Keys are sorted, so equal maps always hash equally.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, serde_json::Value>) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn yaml_bytes(value: &serde_yaml::Value) -> Vec<u8> {
    serde_yaml::to_string(value)
        .unwrap_or_default()
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeBlock;
    use serde_json::json;

    fn declaration(cidr: &str) -> ResourceDeclaration {
        ResourceDeclaration {
            resource_type: String::from("aws_vpc"),
            name: String::from("main"),
            attributes: AttributeBlock(vec![(
                String::from("cidr_block"),
                serde_yaml::Value::from(cidr),
            )]),
        }
    }

    #[test]
    fn test_declaration_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_declaration(&declaration("10.0.0.0/16")),
            hasher.hash_declaration(&declaration("10.0.0.0/16"))
        );
        assert_ne!(
            hasher.hash_declaration(&declaration("10.0.0.0/16")),
            hasher.hash_declaration(&declaration("10.1.0.0/16"))
        );
    }

    #[test]
    fn test_attribute_hash_ignores_insertion_order() {
        let hasher = ConfigHasher::new();
        let mut a = BTreeMap::new();
        a.insert(String::from("x"), json!(1));
        a.insert(String::from("y"), json!("two"));
        let mut b = BTreeMap::new();
        b.insert(String::from("y"), json!("two"));
        b.insert(String::from("x"), json!(1));
        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
