//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files, `.env` files
//! and environment variables, with proper precedence and error handling.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result, TerraceError};

use super::spec::TerraceConfig;

/// Prefix of environment variables that set input variables.
pub const VARIABLE_ENV_PREFIX: &str = "TERRACE_VAR_";

/// Environment variable holding the remote provider token.
pub const PROVIDER_TOKEN_ENV: &str = "TERRACE_PROVIDER_TOKEN";

/// Configuration parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<TerraceConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TerraceError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<TerraceConfig> {
        debug!("Parsing YAML configuration");

        let config: TerraceConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            TerraceError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources, {} data sources)",
            config.project.name,
            config.resources.0.len(),
            config.data.0.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `TERRACE_<SECTION>_<KEY>` (e.g., `TERRACE_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<TerraceConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut TerraceConfig) {
        if let Ok(name) = std::env::var("TERRACE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("TERRACE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(region) = std::env::var("TERRACE_PROJECT_REGION") {
            debug!("Overriding project.region from environment");
            config.project.region = Some(region);
        }

        if let Ok(path) = std::env::var("TERRACE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(bucket) = std::env::var("TERRACE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("TERRACE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("TERRACE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Ok(raw) = std::env::var("TERRACE_PARALLELISM") {
            match raw.parse::<usize>() {
                Ok(parallelism) => {
                    debug!("Overriding execution.parallelism from environment");
                    config.execution.parallelism = parallelism;
                }
                Err(_) => warn!("Ignoring TERRACE_PARALLELISM={}: not a number", raw),
            }
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TerraceError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Collects `TERRACE_VAR_<name>` values from the environment.
    #[must_use]
    pub fn env_variable_overrides() -> BTreeMap<String, String> {
        Self::variable_overrides_from(std::env::vars())
    }

    /// Collects variable overrides from an arbitrary set of environment pairs.
    #[must_use]
    pub fn variable_overrides_from(
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> BTreeMap<String, String> {
        vars.into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(VARIABLE_ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), value))
            })
            .collect()
    }

    /// Gets the remote provider token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn provider_token() -> Result<String> {
        std::env::var(PROVIDER_TOKEN_ENV).map_err(|_| {
            TerraceError::Config(ConfigError::MissingEnvVar {
                name: String::from(PROVIDER_TOKEN_ENV),
            })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["terrace.yaml", "terrace.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TerraceError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.provider.kind, ProviderKind::Simulated);
        assert!(config.resources.0.is_empty());
    }

    #[test]
    fn test_parse_bundled_template() {
        let parser = ConfigParser::new();
        let config = parser
            .parse_yaml(include_str!("../../templates/terrace.yaml"), None)
            .unwrap();
        assert!(config.resource_count() >= 8);
        assert_eq!(config.data.0.len(), 1);
        assert!(config.outputs.contains_key("instance_public_ip"));
    }

    #[test]
    fn test_parse_error_is_configuration_error() {
        let parser = ConfigParser::new();
        let err = parser.parse_yaml("project: [unclosed", None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_variable_overrides_from_env_pairs() {
        let overrides = ConfigParser::variable_overrides_from(vec![
            (String::from("TERRACE_VAR_instance_type"), String::from("t3.large")),
            (String::from("TERRACE_VAR_"), String::from("ignored")),
            (String::from("HOME"), String::from("/root")),
        ]);
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["instance_type"], "t3.large");
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("terrace.yaml"), "project:\n  name: x\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("terrace.yaml"));
    }
}
