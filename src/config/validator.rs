//! Configuration validation.
//!
//! Structural checks run on the parsed file before the resource model is
//! built. Errors abort the run; warnings are reported and ignored.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{ConfigError, Result, TerraceError};
use crate::model::{is_identifier, SchemaRegistry, DEPENDS_ON};

use super::spec::{
    ExecutionConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceDeclaration,
    StateBackend, StateConfig, TerraceConfig,
};

/// Validator for Terrace configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Schema table used to flag declared computed attributes.
    schemas: SchemaRegistry,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator with the built-in schema table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schemas: SchemaRegistry::builtin(),
        }
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, config: &TerraceConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(TerraceError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Runs every check and collects errors and warnings without failing.
    #[must_use]
    pub fn check(&self, config: &TerraceConfig) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut schemas = self.schemas.clone();
        schemas.extend(&config.schemas);

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(&config.execution, &mut result);
        Self::validate_variables(config, &mut result);
        Self::validate_declarations(config, &schemas, &mut result);
        Self::validate_outputs(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3
            && state.bucket.as_deref().is_none_or(str::is_empty)
        {
            result.errors.push(ValidationError {
                field: String::from("state.bucket"),
                message: String::from("S3 bucket name is required when using S3 backend"),
            });
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => result.errors.push(ValidationError {
                    field: String::from("provider.endpoint"),
                    message: String::from("An endpoint is required for the http provider"),
                }),
                Some(endpoint)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    result.errors.push(ValidationError {
                        field: String::from("provider.endpoint"),
                        message: format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    });
                }
                Some(_) => {}
            },
            ProviderKind::Simulated => {
                if provider.endpoint.is_some() {
                    result
                        .warnings
                        .push(String::from("provider.endpoint is ignored by the simulated provider"));
                }
            }
        }
    }

    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.errors.push(ValidationError {
                field: String::from("execution.parallelism"),
                message: String::from("Parallelism must be at least 1"),
            });
        } else if execution.parallelism > 64 {
            result.warnings.push(format!(
                "execution.parallelism: {} concurrent provider calls may trigger rate limiting",
                execution.parallelism
            ));
        }

        if execution.timeout_secs == Some(0) {
            result.errors.push(ValidationError {
                field: String::from("execution.timeout_secs"),
                message: String::from("Timeout must be at least 1 second"),
            });
        }
    }

    fn validate_variables(config: &TerraceConfig, result: &mut ValidationResult) {
        let mut texts = Vec::new();
        for (_, decl) in config.declarations() {
            for (_, value) in &decl.attributes.0 {
                collect_strings(value, &mut texts);
            }
        }
        for output in config.outputs.values() {
            collect_strings(&output.value, &mut texts);
        }

        for name in config.variables.keys() {
            if !is_identifier(name) {
                result.errors.push(ValidationError {
                    field: format!("variables.{name}"),
                    message: format!("Variable name '{name}' is invalid"),
                });
                continue;
            }
            let needle = format!("var.{name}");
            if !texts.iter().any(|t| t.contains(&needle)) {
                result
                    .warnings
                    .push(format!("variables.{name}: declared but never used"));
            }
        }
    }

    fn validate_declarations(
        config: &TerraceConfig,
        schemas: &SchemaRegistry,
        result: &mut ValidationResult,
    ) {
        if config.resources.0.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
        }

        let mut seen = HashSet::new();
        for (is_data, decl) in config.declarations() {
            let section = if is_data { "data" } else { "resources" };
            let prefix = format!("{section}.{}.{}", decl.resource_type, decl.name);

            if !is_identifier(&decl.resource_type) || !is_identifier(&decl.name) {
                result.errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!(
                        "Invalid resource address '{}.{}'",
                        decl.resource_type, decl.name
                    ),
                });
            }

            if !seen.insert((is_data, &decl.resource_type, &decl.name)) {
                result.errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!("Duplicate declaration of {prefix}"),
                });
            }

            Self::validate_attributes(decl, is_data, &prefix, schemas, result);
        }
    }

    fn validate_attributes(
        decl: &ResourceDeclaration,
        is_data: bool,
        prefix: &str,
        schemas: &SchemaRegistry,
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (key, value) in &decl.attributes.0 {
            if !seen.insert(key.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.{key}"),
                    message: format!("Attribute '{key}' declared more than once"),
                });
            }

            if key == DEPENDS_ON {
                if !value.is_sequence() {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.{key}"),
                        message: String::from("depends_on must be a list of resource addresses"),
                    });
                }
                continue;
            }

            if !is_data && schemas.is_computed(&decl.resource_type, key) {
                result.warnings.push(format!(
                    "{prefix}.{key}: attribute is computed by the provider and will be overwritten"
                ));
            }
        }

        if !is_data && !schemas.knows(&decl.resource_type) {
            result.warnings.push(format!(
                "{prefix}: no schema for type '{}', every attribute change forces replacement",
                decl.resource_type
            ));
        }
    }

    fn validate_outputs(config: &TerraceConfig, result: &mut ValidationResult) {
        for name in config.outputs.keys() {
            if !is_identifier(name) {
                result.errors.push(ValidationError {
                    field: format!("outputs.{name}"),
                    message: format!("Output name '{name}' is invalid"),
                });
            }
        }
    }
}

fn collect_strings(value: &serde_yaml::Value, out: &mut Vec<String>) {
    match value {
        serde_yaml::Value::String(s) => out.push(s.clone()),
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        serde_yaml::Value::Tagged(tagged) => collect_strings(&tagged.value, out),
        serde_yaml::Value::Null | serde_yaml::Value::Bool(_) | serde_yaml::Value::Number(_) => {}
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
