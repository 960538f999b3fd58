//! Builds the desired resource model from a parsed configuration.

use tracing::debug;

use crate::config::{ConfigHasher, ResourceDeclaration, TerraceConfig};
use crate::error::{ConfigError, Result, TerraceError};
use crate::outputs::OutputDefinition;

use super::resource::{Resource, ResourceId, ResourceSet};
use super::schema::SchemaRegistry;
use super::value::Value;
use super::variable::{VariableOverrides, VariableSet};

/// Attribute key holding explicit ordering dependencies.
pub const DEPENDS_ON: &str = "depends_on";

/// The desired state: resources with variables substituted, plus outputs.
#[derive(Debug, Clone)]
pub struct ResourceModel {
    /// Declared resources and data sources.
    pub resources: ResourceSet,
    /// Declared outputs.
    pub outputs: Vec<OutputDefinition>,
    /// Attribute classification.
    pub schemas: SchemaRegistry,
    /// Resolved variables.
    pub variables: VariableSet,
    /// Hash of the declarations the model was built from.
    pub config_hash: String,
}

impl ResourceModel {
    /// Builds the model.
    ///
    /// Data sources receive the lowest declaration indexes, followed by
    /// managed resources in file order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate identities or attributes,
    /// bad expressions, undefined variables or outputs referencing undeclared
    /// resources.
    pub fn build(config: &TerraceConfig, overrides: &VariableOverrides) -> Result<Self> {
        let variables = VariableSet::resolve(&config.variables, overrides)?;

        let mut schemas = SchemaRegistry::builtin();
        schemas.extend(&config.schemas);

        let mut resources = ResourceSet::new();
        for (is_data, decl) in config.declarations() {
            resources.insert(build_resource(decl, is_data, &variables)?)?;
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for (name, decl) in &config.outputs {
            let value = Value::from_yaml(&decl.value, &variables)?;
            let mut refs = Vec::new();
            value.collect_references(&mut refs);
            if let Some(missing) = refs.iter().find(|r| !resources.contains(&r.target)) {
                return Err(TerraceError::Config(ConfigError::UnknownReference {
                    source_resource: format!("output.{name}"),
                    target: missing.target.to_string(),
                }));
            }
            outputs.push(OutputDefinition {
                name: name.clone(),
                value,
                sensitive: decl.sensitive,
                description: decl.description.clone(),
            });
        }

        let config_hash = ConfigHasher::new().hash_config(config);
        debug!(
            "Built model with {} resources and {} outputs",
            resources.len(),
            outputs.len()
        );

        Ok(Self {
            resources,
            outputs,
            schemas,
            variables,
            config_hash,
        })
    }
}

fn build_resource(
    decl: &ResourceDeclaration,
    is_data: bool,
    variables: &VariableSet,
) -> Result<Resource> {
    let id = if is_data {
        ResourceId::data(&decl.resource_type, &decl.name)
    } else {
        ResourceId::managed(&decl.resource_type, &decl.name)
    };

    let mut resource = Resource::new(id);
    let mut saw_depends_on = false;

    for (key, raw) in &decl.attributes.0 {
        let duplicate = if key == DEPENDS_ON {
            std::mem::replace(&mut saw_depends_on, true)
        } else {
            resource.attributes.contains_key(key)
        };
        if duplicate {
            return Err(TerraceError::Config(ConfigError::DuplicateAttribute {
                resource: resource.id.to_string(),
                attribute: key.clone(),
            }));
        }

        if key == DEPENDS_ON {
            resource.depends_on = parse_depends_on(&resource.id, raw)?;
        } else {
            resource
                .attributes
                .insert(key.clone(), Value::from_yaml(raw, variables)?);
        }
    }

    Ok(resource)
}

fn parse_depends_on(owner: &ResourceId, raw: &serde_yaml::Value) -> Result<Vec<ResourceId>> {
    let invalid = || {
        TerraceError::Config(ConfigError::validation(
            format!("{owner}: depends_on must be a list of resource addresses"),
            DEPENDS_ON,
        ))
    };

    let items = raw.as_sequence().ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| {
            let text = item.as_str().ok_or_else(invalid)?;
            let address = text
                .strip_prefix("${")
                .and_then(|t| t.strip_suffix('}'))
                .unwrap_or(text)
                .trim();
            address
                .parse::<ResourceId>()
                .map_err(TerraceError::Config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttributeBlock, ConfigParser, ResourceBlocks};
    use crate::model::Reference;

    const CONFIG: &str = r#"
project:
  name: demo
variables:
  cidr:
    type: string
    default: 10.0.0.0/16
data:
  aws_ami:
    ubuntu:
      owners: ["099720109477"]
      name: "ubuntu/images/*"
resources:
  aws_vpc:
    main:
      cidr_block: ${var.cidr}
  aws_subnet:
    public:
      vpc_id: ${aws_vpc.main.id}
      cidr_block: 10.0.1.0/24
  aws_instance:
    web:
      ami: ${data.aws_ami.ubuntu.id}
      subnet_id: ${aws_subnet.public.id}
      depends_on: [aws_vpc.main]
outputs:
  ip:
    value: ${aws_instance.web.public_ip}
"#;

    #[test]
    fn test_build_substitutes_variables_and_keeps_references() {
        let config = ConfigParser::new().parse_yaml(CONFIG, None).unwrap();
        let model = ResourceModel::build(&config, &VariableOverrides::default()).unwrap();

        let vpc = model
            .resources
            .get(&ResourceId::managed("aws_vpc", "main"))
            .unwrap();
        assert_eq!(vpc.attributes["cidr_block"], Value::string("10.0.0.0/16"));

        let web = model
            .resources
            .get(&ResourceId::managed("aws_instance", "web"))
            .unwrap();
        assert_eq!(
            web.attributes["ami"],
            Value::Reference(Reference::parse("data.aws_ami.ubuntu.id").unwrap())
        );
        assert_eq!(web.depends_on, vec![ResourceId::managed("aws_vpc", "main")]);

        let ami = model
            .resources
            .get(&ResourceId::data("aws_ami", "ubuntu"))
            .unwrap();
        assert_eq!(ami.index, 0);
        assert_eq!(model.outputs.len(), 1);
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let mut config = ConfigParser::new().parse_yaml("project:\n  name: demo\n", None).unwrap();
        config.resources = ResourceBlocks(vec![ResourceDeclaration {
            resource_type: String::from("aws_vpc"),
            name: String::from("main"),
            attributes: AttributeBlock(vec![
                (String::from("cidr_block"), serde_yaml::Value::from("10.0.0.0/16")),
                (String::from("cidr_block"), serde_yaml::Value::from("10.1.0.0/16")),
            ]),
        }]);

        let err = ResourceModel::build(&config, &VariableOverrides::default()).unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::DuplicateAttribute { ref attribute, .. }) if attribute == "cidr_block"
        ));
    }

    #[test]
    fn test_duplicate_resource_rejected() {
        let mut config = ConfigParser::new().parse_yaml("project:\n  name: demo\n", None).unwrap();
        let decl = ResourceDeclaration {
            resource_type: String::from("aws_vpc"),
            name: String::from("main"),
            attributes: AttributeBlock::default(),
        };
        config.resources = ResourceBlocks(vec![decl.clone(), decl]);

        let err = ResourceModel::build(&config, &VariableOverrides::default()).unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_output_with_unknown_target_rejected() {
        let yaml = "project:\n  name: demo\noutputs:\n  ip:\n    value: ${aws_instance.ghost.public_ip}\n";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        let err = ResourceModel::build(&config, &VariableOverrides::default()).unwrap_err();
        assert!(matches!(
            err,
            TerraceError::Config(ConfigError::UnknownReference { .. })
        ));
    }
}
