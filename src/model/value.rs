//! Attribute values, references and `${...}` expressions.
//!
//! A string attribute may embed expressions:
//!
//! - `${var.NAME}` is substituted once, when the model is built.
//! - `${TYPE.NAME.ATTRIBUTE}` and `${data.TYPE.NAME.ATTRIBUTE}` become
//!   [`Reference`] values that stay unresolved until planning/execution.
//!
//! A string made of a single expression becomes the referenced value itself;
//! a string mixing text and references becomes a [`Value::Template`].
//! `$${` escapes a literal `${`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as JsonValue;

use crate::error::{ConfigError, Result, TerraceError};

use super::resource::ResourceId;
use super::variable::VariableSet;

/// A reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced resource.
    pub target: ResourceId,
    /// Referenced attribute (`id` is the provider-assigned identifier).
    pub attribute: String,
}

impl Reference {
    /// Parses `TYPE.NAME.ATTRIBUTE` or `data.TYPE.NAME.ATTRIBUTE`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidExpression` for anything else.
    pub fn parse(expression: &str) -> Result<Self> {
        match parse_expression(expression)? {
            Segment::Reference(reference) => Ok(reference),
            _ => Err(TerraceError::Config(ConfigError::expression(
                expression,
                "not a resource reference",
            ))),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// Part of a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    /// Literal text.
    Literal(String),
    /// Interpolated reference.
    Reference(Reference),
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null literal.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(serde_json::Number),
    /// String literal.
    String(String),
    /// List of values.
    List(Vec<Value>),
    /// Map of values.
    Map(BTreeMap<String, Value>),
    /// Whole-value reference to another resource's attribute.
    Reference(Reference),
    /// String with embedded references.
    Template(Vec<TemplatePart>),
}

/// Outcome of looking up one reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The value is known.
    Known(JsonValue),
    /// The value will only be known after the target is (re)created.
    Unknown,
    /// The target or attribute does not exist.
    Missing,
}

/// Source of values for references.
pub trait ReferenceResolver {
    /// Looks up a single reference.
    fn lookup(&self, reference: &Reference) -> Lookup;
}

/// Outcome of resolving a whole value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Fully resolved.
    Known(JsonValue),
    /// Depends on a value not yet known.
    Unknown,
    /// A reference could not be satisfied.
    Missing(Reference),
}

impl Value {
    /// Creates a string literal.
    #[must_use]
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Creates a whole-value reference.
    #[must_use]
    pub fn reference(target: ResourceId, attribute: impl Into<String>) -> Self {
        Self::Reference(Reference {
            target,
            attribute: attribute.into(),
        })
    }

    /// Converts a JSON value to a literal value.
    #[must_use]
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => Self::Number(n.clone()),
            JsonValue::String(s) => Self::String(s.clone()),
            JsonValue::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts a declared YAML value, substituting variables and parsing references.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed expressions, undefined
    /// variables, non-string map keys or tagged values.
    pub fn from_yaml(raw: &serde_yaml::Value, variables: &VariableSet) -> Result<Self> {
        match raw {
            serde_yaml::Value::Null => Ok(Self::Null),
            serde_yaml::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_yaml::Value::Number(n) => yaml_number(n).map(Self::Number),
            serde_yaml::Value::String(s) => interpolate(s, variables),
            serde_yaml::Value::Sequence(items) => items
                .iter()
                .map(|item| Self::from_yaml(item, variables))
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = BTreeMap::new();
                for (key, value) in mapping {
                    let Some(key) = key.as_str() else {
                        return Err(TerraceError::Config(ConfigError::ParseError {
                            message: format!("map keys must be strings, found {key:?}"),
                            location: None,
                        }));
                    };
                    map.insert(key.to_string(), Self::from_yaml(value, variables)?);
                }
                Ok(Self::Map(map))
            }
            serde_yaml::Value::Tagged(tagged) => Err(TerraceError::Config(ConfigError::ParseError {
                message: format!("unsupported YAML tag {}", tagged.tag),
                location: None,
            })),
        }
    }

    /// Appends every reference contained in this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => out.push(reference),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(reference) = part {
                        out.push(reference);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for value in map.values() {
                    value.collect_references(out);
                }
            }
            Self::Null | Self::Bool(_) | Self::Number(_) | Self::String(_) => {}
        }
    }

    /// Resolves the value against a resolver.
    pub fn resolve(&self, resolver: &dyn ReferenceResolver) -> Resolution {
        match self {
            Self::Null => Resolution::Known(JsonValue::Null),
            Self::Bool(b) => Resolution::Known(JsonValue::Bool(*b)),
            Self::Number(n) => Resolution::Known(JsonValue::Number(n.clone())),
            Self::String(s) => Resolution::Known(JsonValue::String(s.clone())),
            Self::Reference(reference) => match resolver.lookup(reference) {
                Lookup::Known(value) => Resolution::Known(value),
                Lookup::Unknown => Resolution::Unknown,
                Lookup::Missing => Resolution::Missing(reference.clone()),
            },
            Self::Template(parts) => {
                let mut text = String::new();
                let mut unknown = false;
                for part in parts {
                    match part {
                        TemplatePart::Literal(literal) => text.push_str(literal),
                        TemplatePart::Reference(reference) => match resolver.lookup(reference) {
                            Lookup::Known(value) => text.push_str(&json_to_text(&value)),
                            Lookup::Unknown => unknown = true,
                            Lookup::Missing => return Resolution::Missing(reference.clone()),
                        },
                    }
                }
                if unknown {
                    Resolution::Unknown
                } else {
                    Resolution::Known(JsonValue::String(text))
                }
            }
            Self::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                let mut unknown = false;
                for item in items {
                    match item.resolve(resolver) {
                        Resolution::Known(value) => resolved.push(value),
                        Resolution::Unknown => unknown = true,
                        missing @ Resolution::Missing(_) => return missing,
                    }
                }
                if unknown {
                    Resolution::Unknown
                } else {
                    Resolution::Known(JsonValue::Array(resolved))
                }
            }
            Self::Map(map) => {
                let mut resolved = serde_json::Map::new();
                let mut unknown = false;
                for (key, value) in map {
                    match value.resolve(resolver) {
                        Resolution::Known(v) => {
                            resolved.insert(key.clone(), v);
                        }
                        Resolution::Unknown => unknown = true,
                        missing @ Resolution::Missing(_) => return missing,
                    }
                }
                if unknown {
                    Resolution::Unknown
                } else {
                    Resolution::Known(JsonValue::Object(resolved))
                }
            }
        }
    }
}

/// Renders a resolved value for string interpolation.
#[must_use]
pub fn json_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Returns true for a valid identifier segment.
#[must_use]
pub fn is_identifier(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One piece of a parsed string.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Variable(String),
    Reference(Reference),
}

fn yaml_number(n: &serde_yaml::Number) -> Result<serde_json::Number> {
    if let Some(i) = n.as_i64() {
        return Ok(serde_json::Number::from(i));
    }
    if let Some(u) = n.as_u64() {
        return Ok(serde_json::Number::from(u));
    }
    n.as_f64()
        .and_then(serde_json::Number::from_f64)
        .ok_or_else(|| {
            TerraceError::Config(ConfigError::ParseError {
                message: format!("unrepresentable number {n}"),
                location: None,
            })
        })
}

fn parse_expression(expression: &str) -> Result<Segment> {
    let parts: Vec<&str> = expression.split('.').collect();
    if parts.iter().any(|p| !is_identifier(p)) {
        return Err(TerraceError::Config(ConfigError::expression(
            expression,
            "expected dotted identifiers",
        )));
    }

    match parts.as_slice() {
        ["var", name] => Ok(Segment::Variable((*name).to_string())),
        ["data", resource_type, name, attribute] => Ok(Segment::Reference(Reference {
            target: ResourceId::data(*resource_type, *name),
            attribute: (*attribute).to_string(),
        })),
        [resource_type, name, attribute] if *resource_type != "var" && *resource_type != "data" => {
            Ok(Segment::Reference(Reference {
                target: ResourceId::managed(*resource_type, *name),
                attribute: (*attribute).to_string(),
            }))
        }
        _ => Err(TerraceError::Config(ConfigError::expression(
            expression,
            "expected var.NAME, TYPE.NAME.ATTRIBUTE or data.TYPE.NAME.ATTRIBUTE",
        ))),
    }
}

fn parse_segments(input: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        let (before, after) = rest.split_at(pos);
        text.push_str(before);

        if let Some(stripped) = after.strip_prefix("$${") {
            text.push_str("${");
            rest = stripped;
        } else if let Some(stripped) = after.strip_prefix("${") {
            let Some(end) = stripped.find('}') else {
                return Err(TerraceError::Config(ConfigError::expression(
                    input,
                    "unterminated '${'",
                )));
            };
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(parse_expression(stripped[..end].trim())?);
            rest = &stripped[end + 1..];
        } else {
            text.push('$');
            rest = &after[1..];
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn interpolate(input: &str, variables: &VariableSet) -> Result<Value> {
    let mut segments = parse_segments(input)?;

    if segments.len() == 1 {
        return match segments.remove(0) {
            Segment::Text(text) => Ok(Value::String(text)),
            Segment::Variable(name) => variables.get(&name).map(Value::from_json),
            Segment::Reference(reference) => Ok(Value::Reference(reference)),
        };
    }

    let mut parts: Vec<TemplatePart> = Vec::new();
    let push_text = |parts: &mut Vec<TemplatePart>, text: String| {
        if let Some(TemplatePart::Literal(last)) = parts.last_mut() {
            last.push_str(&text);
        } else {
            parts.push(TemplatePart::Literal(text));
        }
    };

    for segment in segments {
        match segment {
            Segment::Text(text) => push_text(&mut parts, text),
            Segment::Variable(name) => push_text(&mut parts, json_to_text(variables.get(&name)?)),
            Segment::Reference(reference) => parts.push(TemplatePart::Reference(reference)),
        }
    }

    match parts.as_slice() {
        [] => Ok(Value::String(String::new())),
        [TemplatePart::Literal(text)] => Ok(Value::String(text.clone())),
        _ => Ok(Value::Template(parts)),
    }
}
