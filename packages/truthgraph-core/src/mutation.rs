//! Typed node and relationship mutations
//!
//! The request layer decodes its payloads into these types and calls
//! `apply`. Each mutation loads what it needs through the node manager and
//! persists with a single `save` or `delete`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::info;

use crate::context::GraphContext;
use crate::error::{GraphError, Result};
use crate::node::Node;
use crate::schema::Cardinality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

/// Create, update or delete one node
///
/// `data` maps attribute names to values and relationship names to peer
/// ids: a string (or null) for cardinality one, an array for many.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMutation {
    pub action: MutationAction,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: BTreeMap<String, JsonValue>,
    /// Defaults to the default branch
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub action: MutationAction,
    pub id: String,
    /// Node as saved; `None` after a delete
    pub node: Option<Node>,
}

impl NodeMutation {
    pub fn create(kind: impl Into<String>) -> Self {
        Self {
            action: MutationAction::Create,
            kind: Some(kind.into()),
            id: None,
            data: BTreeMap::new(),
            branch: None,
        }
    }

    pub fn update(id: impl Into<String>) -> Self {
        Self {
            action: MutationAction::Update,
            kind: None,
            id: Some(id.into()),
            data: BTreeMap::new(),
            branch: None,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            action: MutationAction::Delete,
            kind: None,
            id: Some(id.into()),
            data: BTreeMap::new(),
            branch: None,
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.data.insert(field.into(), value.into());
        self
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub async fn apply(&self, ctx: &GraphContext) -> Result<MutationOutcome> {
        let outcome = match self.action {
            MutationAction::Create => self.apply_create(ctx).await?,
            MutationAction::Update => self.apply_update(ctx).await?,
            MutationAction::Delete => self.apply_delete(ctx).await?,
        };
        info!(
            action = self.action.as_str(),
            id = %outcome.id,
            branch = self.branch.as_deref().unwrap_or(ctx.default_branch()),
            "node mutation applied"
        );
        Ok(outcome)
    }

    fn required_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| GraphError::validation("id", format!("{} requires an id", self.action.as_str())))
    }

    async fn load(&self, ctx: &GraphContext) -> Result<Node> {
        let id = self.required_id()?;
        let node = ctx
            .nodes()
            .get_one(id, self.branch.as_deref(), None)
            .await?
            .ok_or_else(|| {
                GraphError::node_not_found(
                    self.branch.as_deref().unwrap_or(ctx.default_branch()),
                    self.kind.as_deref().unwrap_or("Node"),
                    id,
                )
            })?;
        if let Some(kind) = &self.kind {
            if kind != node.kind() {
                return Err(GraphError::validation(
                    "kind",
                    format!("'{}' is a {}, not a {}", id, node.kind(), kind),
                ));
            }
        }
        Ok(node)
    }

    async fn apply_create(&self, ctx: &GraphContext) -> Result<MutationOutcome> {
        let kind = self
            .kind
            .as_deref()
            .ok_or_else(|| GraphError::validation("kind", "create requires a kind"))?;
        let mut node = ctx.nodes().new_node(kind, self.branch.as_deref()).await?;
        if let Some(id) = &self.id {
            node = node.with_id(id.clone());
        }
        apply_data(&mut node, &self.data)?;
        ctx.nodes().save(&mut node).await?;
        Ok(MutationOutcome {
            action: self.action,
            id: node.id().to_string(),
            node: Some(node),
        })
    }

    async fn apply_update(&self, ctx: &GraphContext) -> Result<MutationOutcome> {
        let mut node = self.load(ctx).await?;
        apply_data(&mut node, &self.data)?;
        ctx.nodes().save(&mut node).await?;
        Ok(MutationOutcome {
            action: self.action,
            id: node.id().to_string(),
            node: Some(node),
        })
    }

    async fn apply_delete(&self, ctx: &GraphContext) -> Result<MutationOutcome> {
        let node = self.load(ctx).await?;
        ctx.nodes().delete(&node).await?;
        Ok(MutationOutcome {
            action: self.action,
            id: node.id().to_string(),
            node: None,
        })
    }
}

fn peer_ids(field: &str, value: &JsonValue) -> Result<Vec<String>> {
    let invalid = || GraphError::validation(field, format!("'{}' expects peer ids", field));
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::String(id) => Ok(vec![id.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

fn apply_data(node: &mut Node, data: &BTreeMap<String, JsonValue>) -> Result<()> {
    for (field, value) in data {
        if node.schema().relationship_names().contains(&field.as_str()) {
            let ids = peer_ids(field, value)?;
            let rel = node.relationship_mut(field)?;
            match rel.schema().cardinality {
                Cardinality::One if value.is_array() => {
                    return Err(GraphError::validation(
                        field.as_str(),
                        format!("'{}' has cardinality one and expects a single peer id", field),
                    ));
                }
                _ => rel.set_peers(ids)?,
            }
        } else {
            node.set(field, value.clone())?;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Relationship peers
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipAction {
    Add,
    Remove,
}

/// Add or remove peers of a cardinality-many relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipMutation {
    pub action: RelationshipAction,
    /// Source node
    pub id: String,
    /// Relationship name on the source node's kind
    pub name: String,
    pub peers: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl RelationshipMutation {
    pub fn add(id: impl Into<String>, name: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            action: RelationshipAction::Add,
            id: id.into(),
            name: name.into(),
            peers,
            branch: None,
        }
    }

    pub fn remove(id: impl Into<String>, name: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            action: RelationshipAction::Remove,
            ..Self::add(id, name, peers)
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Returns the number of peers actually added or removed
    pub async fn apply(&self, ctx: &GraphContext) -> Result<usize> {
        let branch = self.branch.as_deref();
        let mut source = ctx
            .nodes()
            .get_one(&self.id, branch, None)
            .await?
            .ok_or_else(|| {
                GraphError::node_not_found(branch.unwrap_or(ctx.default_branch()), "Node", self.id.as_str())
            })?;

        let rel_schema = source.schema().get_relationship(&self.name).map_err(|_| {
            GraphError::validation(
                "name",
                format!("'{}' is not a valid relationship for '{}'", self.name, source.kind()),
            )
        })?;
        if rel_schema.cardinality != Cardinality::Many {
            return Err(GraphError::validation(
                "name",
                format!("'{}' must be a relationship of cardinality many", self.name),
            ));
        }

        let rel = source.relationship_mut(&self.name)?;
        let mut changed = 0;
        for peer in &self.peers {
            let applied = match self.action {
                RelationshipAction::Add if rel.contains(peer) => false,
                RelationshipAction::Add => {
                    rel.add_peer(peer.as_str())?;
                    true
                }
                RelationshipAction::Remove => rel.remove_peer(peer),
            };
            if applied {
                changed += 1;
            }
        }
        if changed == 0 {
            return Ok(0);
        }
        // peers are checked for existence and kind on save
        ctx.nodes().save(&mut source).await?;
        info!(id = %self.id, relationship = %self.name, changed, "relationship peers updated");
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeKind, AttributeSchema, NodeSchema, RelationshipSchema};
    use serde_json::json;
    use std::sync::Arc;

    fn car() -> Node {
        Node::new(
            Arc::new(
                NodeSchema::new("TestCar")
                    .attribute(AttributeSchema::new("name", AttributeKind::Text))
                    .relationship(RelationshipSchema::new("owner", "TestPerson", Cardinality::One))
                    .relationship(
                        RelationshipSchema::new("drivers", "TestPerson", Cardinality::Many)
                            .with_identifier("testcar__drivers"),
                    ),
            ),
            "main",
        )
    }

    #[test]
    fn test_apply_data_routes_fields() {
        let mut node = car();
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), json!("volt"));
        data.insert("owner".to_string(), json!("p1"));
        data.insert("drivers".to_string(), json!(["p1", "p2"]));
        apply_data(&mut node, &data).unwrap();

        assert_eq!(node.get("name"), Some(&json!("volt")));
        assert_eq!(node.relationship("owner").unwrap().peer(), Some("p1"));
        assert_eq!(node.relationship("drivers").unwrap().peers().len(), 2);
    }

    #[test]
    fn test_apply_data_rejects_list_on_one() {
        let mut node = car();
        let mut data = BTreeMap::new();
        data.insert("owner".to_string(), json!(["p1"]));
        let err = apply_data(&mut node, &data).unwrap_err();
        assert!(matches!(err, GraphError::Validation { ref field, .. } if field == "owner"));
    }

    #[test]
    fn test_null_clears_peer() {
        let mut node = car();
        node.relationship_mut("owner").unwrap().set(Some("p1".into()));
        let mut data = BTreeMap::new();
        data.insert("owner".to_string(), JsonValue::Null);
        apply_data(&mut node, &data).unwrap();
        assert_eq!(node.relationship("owner").unwrap().peer(), None);
    }

    #[test]
    fn test_decode_mutation() {
        let mutation: NodeMutation = serde_json::from_value(json!({
            "action": "update",
            "id": "c1",
            "data": {"name": "volt"}
        }))
        .unwrap();
        assert_eq!(mutation, NodeMutation::update("c1").with("name", "volt"));

        let remove = RelationshipMutation::remove("p1", "cars", vec!["c1".into()]);
        assert_eq!(remove.action, RelationshipAction::Remove);
    }
}
