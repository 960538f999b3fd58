//! Input variables and their precedence rules.
//!
//! A variable's value comes from, in increasing priority: its declared
//! default, a `TERRACE_VAR_<name>` environment variable, a `--var name=value`
//! command-line override.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::VariableDeclaration;
use crate::error::{ConfigError, Result, TerraceError};

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Text.
    String,
    /// Integer or float.
    Number,
    /// `true` or `false`.
    Bool,
    /// JSON array.
    List,
    /// JSON object.
    Map,
    /// Anything; overrides are read as JSON when they parse, text otherwise.
    #[default]
    Any,
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

/// Raw override values gathered from the command line and the environment.
#[derive(Debug, Clone, Default)]
pub struct VariableOverrides {
    /// `--var name=value` assignments.
    pub cli: BTreeMap<String, String>,
    /// `TERRACE_VAR_<name>` environment values.
    pub env: BTreeMap<String, String>,
}

impl VariableOverrides {
    /// Parses `name=value` assignments.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an item without `=` or with an empty name.
    pub fn parse_assignments(items: &[String]) -> Result<BTreeMap<String, String>> {
        let mut assignments = BTreeMap::new();
        for item in items {
            match item.split_once('=') {
                Some((name, value)) if !name.trim().is_empty() => {
                    assignments.insert(name.trim().to_string(), value.to_string());
                }
                _ => {
                    return Err(TerraceError::Config(ConfigError::validation(
                        format!("expected NAME=VALUE, got '{item}'"),
                        "--var",
                    )));
                }
            }
        }
        Ok(assignments)
    }
}

/// Resolved variable values.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    values: BTreeMap<String, JsonValue>,
    declared: BTreeSet<String>,
}

impl VariableSet {
    /// Resolves every declared variable.
    ///
    /// A variable with neither a default nor an override stays unset; using
    /// it in an expression is an error.
    ///
    /// # Errors
    ///
    /// Returns `UndefinedVariable` for a command-line override of an
    /// undeclared variable and `InvalidVariableValue` on a type mismatch.
    pub fn resolve(
        declarations: &BTreeMap<String, VariableDeclaration>,
        overrides: &VariableOverrides,
    ) -> Result<Self> {
        if let Some(name) = overrides.cli.keys().find(|n| !declarations.contains_key(*n)) {
            return Err(TerraceError::Config(ConfigError::UndefinedVariable {
                name: name.clone(),
            }));
        }

        let mut values = BTreeMap::new();
        for (name, decl) in declarations {
            let value = if let Some(raw) = overrides.cli.get(name) {
                Some(parse_override(name, decl.var_type, raw)?)
            } else if let Some(raw) = overrides.env.get(name) {
                Some(parse_override(name, decl.var_type, raw)?)
            } else if let Some(default) = &decl.default {
                let value = serde_json::to_value(default).map_err(|e| {
                    TerraceError::Config(ConfigError::InvalidVariableValue {
                        name: name.clone(),
                        message: e.to_string(),
                    })
                })?;
                check_type(name, decl.var_type, &value)?;
                Some(value)
            } else {
                None
            };

            match value {
                Some(value) => {
                    values.insert(name.clone(), value);
                }
                None => debug!("Variable {} has no value", name),
            }
        }

        Ok(Self {
            values,
            declared: declarations.keys().cloned().collect(),
        })
    }

    /// Builds a set from already-typed values.
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (String, JsonValue)>) -> Self {
        let values: BTreeMap<_, _> = values.into_iter().collect();
        let declared = values.keys().cloned().collect();
        Self { values, declared }
    }

    /// Gets a variable's value.
    ///
    /// # Errors
    ///
    /// Returns `UndefinedVariable` if the variable is undeclared or unset.
    pub fn get(&self, name: &str) -> Result<&JsonValue> {
        self.values.get(name).ok_or_else(|| {
            TerraceError::Config(ConfigError::UndefinedVariable {
                name: name.to_string(),
            })
        })
    }

    /// Returns true if the variable was declared, set or not.
    #[must_use]
    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    /// Iterates resolved values.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.values.iter()
    }
}

fn parse_override(name: &str, var_type: VariableType, raw: &str) -> Result<JsonValue> {
    let invalid = |message: String| {
        TerraceError::Config(ConfigError::InvalidVariableValue {
            name: name.to_string(),
            message,
        })
    };

    let value = match var_type {
        VariableType::String => JsonValue::String(raw.to_string()),
        VariableType::Number => {
            if let Ok(i) = raw.trim().parse::<i64>() {
                JsonValue::from(i)
            } else {
                raw.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(JsonValue::Number)
                    .ok_or_else(|| invalid(format!("'{raw}' is not a number")))?
            }
        }
        VariableType::Bool => match raw.trim() {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            other => return Err(invalid(format!("'{other}' is not a bool"))),
        },
        VariableType::List | VariableType::Map => {
            serde_json::from_str(raw).map_err(|e| invalid(format!("expected JSON {var_type}: {e}")))?
        }
        VariableType::Any => {
            serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
        }
    };

    check_type(name, var_type, &value)?;
    Ok(value)
}

fn check_type(name: &str, var_type: VariableType, value: &JsonValue) -> Result<()> {
    let matches = matches!(
        (var_type, value),
        (VariableType::Any, _)
            | (VariableType::String, JsonValue::String(_))
            | (VariableType::Number, JsonValue::Number(_))
            | (VariableType::Bool, JsonValue::Bool(_))
            | (VariableType::List, JsonValue::Array(_))
            | (VariableType::Map, JsonValue::Object(_))
    );

    if matches {
        Ok(())
    } else {
        Err(TerraceError::Config(ConfigError::InvalidVariableValue {
            name: name.to_string(),
            message: format!("expected {var_type}, got {value}"),
        }))
    }
}
