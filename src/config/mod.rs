//! Configuration module for Terrace.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `terrace.yaml`
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AttributeBlock, ExecutionConfig, OutputDeclaration, ProjectConfig, ProviderConfig,
    ProviderKind, ResourceBlocks, ResourceDeclaration, SchemaDeclaration, StateBackend,
    StateConfig, TerraceConfig, VariableDeclaration,
};
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, PROVIDER_TOKEN_ENV, VARIABLE_ENV_PREFIX, find_config_file,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
