//! Data migrations derived from schema changes
//!
//! Each migration rewrites the nodes of one kind on the branch it runs
//! against, inside a single write batch. Nodes already in the target shape
//! are skipped, so a repeated run reports zero changes.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use tracing::debug;

use super::{Migration, MigrationContext, MigrationResult};
use crate::error::Result;
use crate::node::manager::{
    add_attribute, fetch_stored, retire_attribute, retire_node, NodeSelector, StoredNode,
};
use crate::query::{NewVertex, WriteBatch};
use crate::schema::{
    AttributeSchema, Cardinality, RelationshipSchema, SchemaBranch, SchemaChange, SchemaDiff,
    SchemaPath,
};
use crate::store::{EdgeLabel, VertexLabel};
use crate::timestamp::Timestamp;

async fn live_nodes(ctx: &MigrationContext<'_>, kind: &str) -> Result<Vec<StoredNode>> {
    let nodes = fetch_stored(ctx.db, &ctx.scope, None, NodeSelector::Kind(kind)).await?;
    Ok(nodes.into_values().filter(StoredNode::is_live).collect())
}

/// Writes `batch` and reports `changes`
async fn commit(ctx: &MigrationContext<'_>, batch: WriteBatch, changes: usize) -> Result<MigrationResult> {
    batch.commit(ctx.db).await?;
    Ok(MigrationResult::with_changes(changes))
}

// ═══════════════════════════════════════════════════════════════════════════
// Attributes
// ═══════════════════════════════════════════════════════════════════════════

/// Give every existing node of `kind` the new attribute
pub struct AttributeAddMigration {
    name: String,
    kind: String,
    attribute: AttributeSchema,
}

impl AttributeAddMigration {
    pub fn new(kind: impl Into<String>, attribute: AttributeSchema) -> Self {
        let kind = kind.into();
        Self {
            name: format!("node.attribute.add:{}", SchemaPath::attribute(kind.as_str(), attribute.name.as_str())),
            kind,
            attribute,
        }
    }

    fn missing<'a>(&self, nodes: &'a [StoredNode]) -> Vec<&'a StoredNode> {
        nodes
            .iter()
            .filter(|n| n.live_attribute(&self.attribute.name).is_none())
            .collect()
    }
}

#[async_trait]
impl Migration for AttributeAddMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let checked = self.validate(ctx).await?;
        if !checked.success() {
            return Ok(checked);
        }
        let nodes = live_nodes(ctx, &self.kind).await?;
        let value = self.attribute.default_value.clone().unwrap_or(JsonValue::Null);
        let mut batch = WriteBatch::new(&ctx.scope, Timestamp::now());
        let mut changes = 0;
        for node in self.missing(&nodes) {
            add_attribute(&mut batch, &node.uuid, &self.attribute.name, &value)?;
            changes += 1;
        }
        commit(ctx, batch, changes).await
    }

    async fn validate(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        if !self.attribute.is_required() {
            return Ok(MigrationResult::default());
        }
        let nodes = live_nodes(ctx, &self.kind).await?;
        let missing = self.missing(&nodes).len();
        if missing == 0 {
            return Ok(MigrationResult::default());
        }
        Ok(MigrationResult::failed(format!(
            "{}.{} is mandatory without a default and {} existing node(s) have no value",
            self.kind, self.attribute.name, missing
        )))
    }
}

/// Move values from the previous attribute name to the new one
///
/// The value vertex is shared by the new `Attribute` vertex; the old one is
/// detached.
pub struct AttributeRenameMigration {
    name: String,
    kind: String,
    previous: String,
    new: String,
}

impl AttributeRenameMigration {
    pub fn new(kind: impl Into<String>, previous: impl Into<String>, new: impl Into<String>) -> Self {
        let kind = kind.into();
        let new = new.into();
        Self {
            name: format!("node.attribute.rename:{}", SchemaPath::attribute(kind.as_str(), new.as_str())),
            kind,
            previous: previous.into(),
            new,
        }
    }
}

#[async_trait]
impl Migration for AttributeRenameMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let nodes = live_nodes(ctx, &self.kind).await?;
        let mut batch = WriteBatch::new(&ctx.scope, Timestamp::now());
        let mut changes = 0;
        for node in &nodes {
            let Some(old) = node.live_attribute(&self.previous) else {
                continue;
            };
            if node.live_attribute(&self.new).is_some() {
                continue;
            }
            let attr_id = batch.create_vertex(NewVertex::new(VertexLabel::Attribute).name(self.new.as_str()))?;
            batch.create_edge(EdgeLabel::HasAttribute, &node.uuid, &attr_id)?;
            if let Some(value) = old.current() {
                batch.create_edge(EdgeLabel::HasValue, &attr_id, &value.uuid)?;
            }
            retire_attribute(&mut batch, &node.uuid, old)?;
            changes += 1;
        }
        debug!(kind = %self.kind, from = %self.previous, to = %self.new, changes, "attributes renamed");
        commit(ctx, batch, changes).await
    }
}

/// Detach a removed attribute from every node of `kind`
pub struct AttributeRemoveMigration {
    name: String,
    kind: String,
    attribute: String,
}

impl AttributeRemoveMigration {
    pub fn new(kind: impl Into<String>, attribute: impl Into<String>) -> Self {
        let kind = kind.into();
        let attribute = attribute.into();
        Self {
            name: format!("node.attribute.remove:{}", SchemaPath::attribute(kind.as_str(), attribute.as_str())),
            kind,
            attribute,
        }
    }
}

#[async_trait]
impl Migration for AttributeRemoveMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let nodes = live_nodes(ctx, &self.kind).await?;
        let mut batch = WriteBatch::new(&ctx.scope, Timestamp::now());
        let mut changes = 0;
        for node in &nodes {
            if let Some(attr) = node.live_attribute(&self.attribute) {
                if retire_attribute(&mut batch, &node.uuid, attr)? {
                    changes += 1;
                }
            }
        }
        commit(ctx, batch, changes).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Kinds and relationships
// ═══════════════════════════════════════════════════════════════════════════

/// Delete every node of a kind dropped from the schema
pub struct NodeKindRemoveMigration {
    name: String,
    kind: String,
}

impl NodeKindRemoveMigration {
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            name: format!("node.remove:{}", SchemaPath::node(kind.as_str())),
            kind,
        }
    }
}

#[async_trait]
impl Migration for NodeKindRemoveMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let nodes = live_nodes(ctx, &self.kind).await?;
        let mut batch = WriteBatch::new(&ctx.scope, Timestamp::now());
        for node in &nodes {
            retire_node(&mut batch, node)?;
        }
        commit(ctx, batch, nodes.len()).await
    }
}

/// Reject a switch to cardinality one while a node still has several peers
///
/// Writes nothing: the data must be fixed before the schema change applies.
pub struct CardinalityValidator {
    name: String,
    kind: String,
    relationship: RelationshipSchema,
}

impl CardinalityValidator {
    pub fn new(kind: impl Into<String>, relationship: RelationshipSchema) -> Self {
        let kind = kind.into();
        Self {
            name: format!(
                "relationship.cardinality.update:{}",
                SchemaPath::relationship(kind.as_str(), relationship.name.as_str())
            ),
            kind,
            relationship,
        }
    }
}

#[async_trait]
impl Migration for CardinalityValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        self.validate(ctx).await
    }

    async fn validate(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        if self.relationship.cardinality != Cardinality::One {
            return Ok(MigrationResult::default());
        }
        let identifier = self.relationship.identifier_for(&self.kind);
        let nodes = live_nodes(ctx, &self.kind).await?;
        let mut result = MigrationResult::default();
        for node in &nodes {
            let peers: BTreeSet<&str> = node
                .live_relationships(&identifier)
                .filter(|r| self.relationship.accepts_peer(&r.peer_kind))
                .map(|r| r.peer.as_str())
                .collect();
            if peers.len() > 1 {
                result.errors.push(format!(
                    "{} '{}' has {} peers on '{}' which allows only one",
                    self.kind,
                    node.uuid,
                    peers.len(),
                    self.relationship.name
                ));
            }
        }
        Ok(result)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Composite
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered migrations for one schema update; stops at the first failure
pub struct CompositeMigration {
    name: String,
    migrations: Vec<Box<dyn Migration>>,
}

impl CompositeMigration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            migrations: Vec::new(),
        }
    }

    pub fn push(&mut self, migration: Box<dyn Migration>) {
        self.migrations.push(migration);
    }

    /// Migrations needed to bring existing data in line with `next`
    pub fn from_diff(diff: &SchemaDiff, next: &SchemaBranch) -> Self {
        let mut composite = Self::new("schema.update");
        for change in &diff.changes {
            match change {
                SchemaChange::AttributeAdded { kind, attribute } => {
                    composite.push(Box::new(AttributeAddMigration::new(kind.as_str(), attribute.clone())));
                }
                SchemaChange::AttributeRemoved { kind, attribute } => {
                    composite.push(Box::new(AttributeRemoveMigration::new(
                        kind.as_str(),
                        attribute.name.as_str(),
                    )));
                }
                SchemaChange::AttributeRenamed { kind, previous, new } => {
                    composite.push(Box::new(AttributeRenameMigration::new(
                        kind.as_str(),
                        previous.name.as_str(),
                        new.name.as_str(),
                    )));
                }
                SchemaChange::NodeRemoved { kind } => {
                    composite.push(Box::new(NodeKindRemoveMigration::new(kind.as_str())));
                }
                SchemaChange::CardinalityChanged {
                    kind,
                    relationship,
                    previous: Cardinality::Many,
                    new: Cardinality::One,
                } => {
                    let schema = next
                        .get(kind)
                        .and_then(|node| node.get_relationship(relationship))
                        .cloned();
                    if let Ok(schema) = schema {
                        composite.push(Box::new(CardinalityValidator::new(kind.as_str(), schema)));
                    }
                }
                _ => {}
            }
        }
        composite
    }

    pub fn names(&self) -> Vec<&str> {
        self.migrations.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[async_trait]
impl Migration for CompositeMigration {
    fn name(&self) -> &str {
        &self.name
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let mut total = MigrationResult::default();
        for migration in &self.migrations {
            let result = migration.execute(ctx).await?;
            let failed = !result.success();
            total.merge(result);
            if failed {
                break;
            }
        }
        Ok(total)
    }

    async fn validate(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let mut total = MigrationResult::default();
        for migration in &self.migrations {
            total.merge(migration.validate(ctx).await?);
        }
        Ok(total)
    }
}
