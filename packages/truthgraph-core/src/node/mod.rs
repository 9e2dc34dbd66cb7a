//! Nodes: typed views over `Node` vertices and their attribute and
//! relationship edges on one branch

pub mod manager;
pub mod relationship;

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{GraphError, Result};
use crate::schema::NodeSchema;

pub use manager::{missing_ids, NodeFilter, NodeManager};
pub use relationship::RelationshipManager;

/// One attribute value on a node
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: JsonValue,
}

impl Attribute {
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    id: String,
    branch: String,
    schema: Arc<NodeSchema>,
    attributes: BTreeMap<String, Attribute>,
    relationships: BTreeMap<String, RelationshipManager>,
    persisted: bool,
}

impl Node {
    /// New, unsaved node with schema defaults applied
    pub fn new(schema: Arc<NodeSchema>, branch: impl Into<String>) -> Self {
        let attributes = schema
            .attributes
            .iter()
            .map(|a| {
                let value = a.default_value.clone().unwrap_or(JsonValue::Null);
                (
                    a.name.clone(),
                    Attribute {
                        name: a.name.clone(),
                        value,
                    },
                )
            })
            .collect();
        let relationships = schema
            .relationships
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    RelationshipManager::new(r.clone(), schema.kind.clone()),
                )
            })
            .collect();
        Self {
            id: Uuid::new_v4().to_string(),
            branch: branch.into(),
            schema,
            attributes,
            relationships,
            persisted: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn schema(&self) -> &NodeSchema {
        &self.schema
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.values()
    }

    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name).map(|a| &a.value)
    }

    /// Set an attribute value, checked against the schema
    pub fn set(&mut self, name: &str, value: impl Into<JsonValue>) -> Result<()> {
        let value = value.into();
        let attr_schema = self.schema.get_attribute(name)?;
        if value.is_null() {
            if !attr_schema.optional {
                return Err(GraphError::validation(
                    name,
                    format!("{}.{} is mandatory and cannot be null", self.schema.kind, name),
                ));
            }
        } else if !attr_schema.kind.accepts(&value) {
            return Err(GraphError::validation(
                name,
                format!(
                    "{} is not a valid {} for {}.{}",
                    value, attr_schema.kind, self.schema.kind, name
                ),
            ));
        }
        self.attributes.insert(
            name.to_string(),
            Attribute {
                name: name.to_string(),
                value,
            },
        );
        Ok(())
    }

    pub fn relationship(&self, name: &str) -> Result<&RelationshipManager> {
        self.relationships
            .get(name)
            .ok_or_else(|| self.unknown_relationship(name))
    }

    pub fn relationship_mut(&mut self, name: &str) -> Result<&mut RelationshipManager> {
        let err = self.unknown_relationship(name);
        self.relationships.get_mut(name).ok_or(err)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipManager> {
        self.relationships.values()
    }

    fn unknown_relationship(&self, name: &str) -> GraphError {
        GraphError::validation(
            name,
            format!("'{}' is not a valid relationship of {}", name, self.schema.kind),
        )
    }

    /// Field-level checks that need no store access
    pub fn validate(&self) -> Result<()> {
        for attr_schema in &self.schema.attributes {
            let value = self.get(&attr_schema.name).unwrap_or(&JsonValue::Null);
            if value.is_null() {
                if !attr_schema.optional {
                    return Err(GraphError::validation(
                        attr_schema.name.as_str(),
                        format!(
                            "{}.{} is mandatory and has no value",
                            self.schema.kind, attr_schema.name
                        ),
                    ));
                }
            } else if !attr_schema.kind.accepts(value) {
                return Err(GraphError::validation(
                    attr_schema.name.as_str(),
                    format!(
                        "{} is not a valid {} for {}.{}",
                        value, attr_schema.kind, self.schema.kind, attr_schema.name
                    ),
                ));
            }
        }
        for rel in self.relationships.values() {
            rel.validate()?;
        }
        Ok(())
    }
}
