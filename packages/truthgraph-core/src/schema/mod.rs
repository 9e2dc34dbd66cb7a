//! Schema model
//!
//! A [`SchemaBranch`] is an immutable snapshot of every node kind visible on
//! one branch. Changes are made by building a new snapshot and diffing it
//! against the previous one (see [`diff`]).

pub mod diff;
pub mod manager;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::error::{GraphError, Result};

pub use diff::{SchemaChange, SchemaDiff};
pub use manager::{SchemaManager, SchemaUpdate};

/// Peer kind that accepts any node kind
pub const GENERIC_PEER: &str = "Node";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Text,
    Number,
    Boolean,
    List,
    #[serde(rename = "JSON")]
    Json,
}

impl AttributeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeKind::Text => "Text",
            AttributeKind::Number => "Number",
            AttributeKind::Boolean => "Boolean",
            AttributeKind::List => "List",
            AttributeKind::Json => "JSON",
        }
    }

    /// Whether a non-null value has the shape this kind stores
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            AttributeKind::Text => value.is_string(),
            AttributeKind::Number => value.is_number(),
            AttributeKind::Boolean => value.is_boolean(),
            AttributeKind::List => value.is_array(),
            AttributeKind::Json => true,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    #[default]
    Many,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::One => "one",
            Cardinality::Many => "many",
        }
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Stable identity across renames; assigned on first persist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<JsonValue>,
    #[serde(default)]
    pub unique: bool,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            optional: false,
            default_value: None,
            unique: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_default(mut self, value: JsonValue) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Mandatory attributes without a default must be supplied on create
    pub fn is_required(&self) -> bool {
        !self.optional && self.default_value.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSchema {
    pub name: String,
    pub peer: String,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default = "default_true")]
    pub optional: bool,
    /// Shared by both sides of a relationship; defaults to the sorted,
    /// lowercased pair of kinds joined by `__`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RelationshipSchema {
    pub fn new(name: impl Into<String>, peer: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            peer: peer.into(),
            cardinality,
            optional: true,
            identifier: None,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn identifier_for(&self, kind: &str) -> String {
        if let Some(identifier) = &self.identifier {
            return identifier.clone();
        }
        let mut pair = [kind.to_lowercase(), self.peer.to_lowercase()];
        pair.sort();
        pair.join("__")
    }

    /// Whether `peer_kind` may sit on the other side
    pub fn accepts_peer(&self, peer_kind: &str) -> bool {
        self.peer == GENERIC_PEER || self.peer == peer_kind
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Filter applied when a query passes a bare scalar, e.g. `name__value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherit_from: Vec<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeSchema>,
    #[serde(default)]
    pub relationships: Vec<RelationshipSchema>,
}

impl NodeSchema {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: None,
            default_filter: None,
            inherit_from: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn attribute(mut self, attribute: AttributeSchema) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = Some(filter.into());
        self
    }

    pub fn get_attribute(&self, name: &str) -> Result<&AttributeSchema> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| {
                GraphError::validation(
                    name,
                    format!("'{}' is not a valid attribute of {}", name, self.kind),
                )
            })
    }

    pub fn get_attribute_mut(&mut self, name: &str) -> Option<&mut AttributeSchema> {
        self.attributes.iter_mut().find(|a| a.name == name)
    }

    pub fn get_relationship(&self, name: &str) -> Result<&RelationshipSchema> {
        self.relationships
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                GraphError::validation(
                    name,
                    format!("'{}' is not a valid relationship of {}", name, self.kind),
                )
            })
    }

    pub fn get_relationship_mut(&mut self, name: &str) -> Option<&mut RelationshipSchema> {
        self.relationships.iter_mut().find(|r| r.name == name)
    }

    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn relationship_names(&self) -> Vec<&str> {
        self.relationships.iter().map(|r| r.name.as_str()).collect()
    }

    fn validate(&self, kinds: &HashSet<&str>) -> Result<()> {
        if self.kind.is_empty() || !self.kind.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GraphError::validation(
                "kind",
                format!("'{}' is not a valid kind name", self.kind),
            ));
        }

        let mut names = HashSet::new();
        let fields = self
            .attributes
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.relationships.iter().map(|r| r.name.as_str()));
        for name in fields {
            if name.is_empty() || name.contains("__") {
                return Err(GraphError::validation(
                    name,
                    format!("'{}' is not a valid field name on {}", name, self.kind),
                ));
            }
            if !names.insert(name) {
                return Err(GraphError::validation(
                    name,
                    format!("{} defines '{}' more than once", self.kind, name),
                ));
            }
        }

        let mut ids = HashSet::new();
        for attr in &self.attributes {
            if let Some(id) = &attr.id {
                if !ids.insert(id.as_str()) {
                    return Err(GraphError::validation(
                        attr.name.as_str(),
                        format!("attribute id '{}' is used twice on {}", id, self.kind),
                    ));
                }
            }
            if let Some(default) = &attr.default_value {
                if !attr.kind.accepts(default) {
                    return Err(GraphError::validation(
                        attr.name.as_str(),
                        format!("default value {} is not a valid {}", default, attr.kind),
                    ));
                }
            }
        }

        let mut identifiers: HashMap<String, &str> = HashMap::new();
        for rel in &self.relationships {
            let identifier = rel.identifier_for(&self.kind);
            if let Some(other) = identifiers.insert(identifier.clone(), rel.name.as_str()) {
                return Err(GraphError::validation(
                    rel.name.as_str(),
                    format!(
                        "{}.{} and {}.{} share the identifier '{}', one of them needs an explicit identifier",
                        self.kind, other, self.kind, rel.name, identifier
                    ),
                ));
            }
            if rel.peer != GENERIC_PEER && !kinds.contains(rel.peer.as_str()) {
                return Err(GraphError::validation(
                    rel.name.as_str(),
                    format!("peer '{}' of {}.{} is not a known kind", rel.peer, self.kind, rel.name),
                ));
            }
        }

        if let Some(filter) = &self.default_filter {
            let attr = filter.strip_suffix("__value").unwrap_or(filter);
            self.get_attribute(attr)?;
        }
        Ok(())
    }
}

/// Immutable set of node schemas for one branch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaBranch {
    nodes: BTreeMap<String, NodeSchema>,
}

impl SchemaBranch {
    /// Build and validate a snapshot
    pub fn new(nodes: Vec<NodeSchema>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for node in nodes {
            if map.contains_key(&node.kind) {
                return Err(GraphError::validation(
                    "kind",
                    format!("kind '{}' is defined more than once", node.kind),
                ));
            }
            map.insert(node.kind.clone(), node);
        }
        let schema = Self { nodes: map };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        let kinds: HashSet<&str> = self.nodes.keys().map(String::as_str).collect();
        for node in self.nodes.values() {
            node.validate(&kinds)?;
        }
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<&NodeSchema> {
        self.nodes
            .get(kind)
            .ok_or_else(|| GraphError::SchemaNotFound(kind.to_string()))
    }

    pub fn has(&self, kind: &str) -> bool {
        self.nodes.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSchema> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// A new snapshot with `node` added or replaced
    pub fn with_node(&self, node: NodeSchema) -> Result<Self> {
        let mut nodes = self.nodes.clone();
        nodes.insert(node.kind.clone(), node);
        let schema = Self { nodes };
        schema.validate()?;
        Ok(schema)
    }

    /// A new snapshot without `kind`
    pub fn without_node(&self, kind: &str) -> Result<Self> {
        self.get(kind)?;
        let mut nodes = self.nodes.clone();
        nodes.remove(kind);
        let schema = Self { nodes };
        schema.validate()?;
        Ok(schema)
    }

    /// Clone of one kind, for editing into a new snapshot
    pub fn duplicate(&self, kind: &str) -> Result<NodeSchema> {
        self.get(kind).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaPathType {
    Node,
    Attribute,
    Relationship,
}

/// Address of one schema element
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaPath {
    pub path_type: SchemaPathType,
    pub schema_kind: String,
    pub field_name: Option<String>,
}

impl SchemaPath {
    pub fn node(kind: impl Into<String>) -> Self {
        Self {
            path_type: SchemaPathType::Node,
            schema_kind: kind.into(),
            field_name: None,
        }
    }

    pub fn attribute(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            path_type: SchemaPathType::Attribute,
            schema_kind: kind.into(),
            field_name: Some(field.into()),
        }
    }

    pub fn relationship(kind: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            path_type: SchemaPathType::Relationship,
            schema_kind: kind.into(),
            field_name: Some(field.into()),
        }
    }
}

impl fmt::Display for SchemaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field_name {
            Some(field) => write!(f, "{}/{}", self.schema_kind, field),
            None => write!(f, "{}", self.schema_kind),
        }
    }
}
