//! Desired-state resource model.
//!
//! This module turns configuration declarations into typed resources:
//! identities, attribute values with cross-resource references, resolved
//! variables and the attribute schema used to classify changes.

mod builder;
mod resource;
mod schema;
mod value;
mod variable;

pub use builder::{ResourceModel, DEPENDS_ON};
pub use resource::{Resource, ResourceId, ResourceMode, ResourceSet};
pub use schema::{AttributeKind, ResourceSchema, SchemaRegistry};
pub use value::{
    is_identifier, json_to_text, Lookup, Reference, ReferenceResolver, Resolution, TemplatePart,
    Value,
};
pub use variable::{VariableOverrides, VariableSet, VariableType};
