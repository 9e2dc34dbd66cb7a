//! Node manager
//!
//! Loading goes through three queries per id chunk (node vertices with
//! their `IS_PART_OF` edges, attribute/value pairs, relationship peers).
//! Every admitted edge version is kept and slot winners are resolved in
//! memory, so the same raw view serves reads, save diffs and migrations.

use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::{Attribute, Node, RelationshipManager};
use crate::branch::filter::{active_winner, latest_by, EdgeVersion, FilterStyle};
use crate::branch::{BranchRegistry, BranchScope};
use crate::error::{GraphError, Result};
use crate::query::{Database, NewVertex, Query, WriteBatch};
use crate::schema::{Cardinality, NodeSchema, RelationshipSchema, SchemaBranch, SchemaManager};
use crate::store::{EdgeLabel, Statement, VertexLabel, ROOT_UUID};
use crate::timestamp::Timestamp;

const ID_CHUNK: usize = 500;

// ═══════════════════════════════════════════════════════════════════════════
// Raw stored view
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub(crate) struct StoredValue {
    pub edge: EdgeVersion,
    pub uuid: String,
    pub raw: Option<String>,
}

impl StoredValue {
    pub fn value(&self) -> Result<JsonValue> {
        match &self.raw {
            Some(raw) => Ok(serde_json::from_str(raw)?),
            None => Ok(JsonValue::Null),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredAttribute {
    pub uuid: String,
    pub name: String,
    /// `HAS_ATTRIBUTE` versions
    pub edges: Vec<EdgeVersion>,
    /// `HAS_VALUE` versions
    pub values: Vec<StoredValue>,
}

impl StoredAttribute {
    fn link(&self) -> Option<&EdgeVersion> {
        active_winner(self.edges.iter(), |e| *e)
    }

    pub fn current(&self) -> Option<&StoredValue> {
        active_winner(self.values.iter(), |v| &v.edge)
    }

    pub fn current_value(&self) -> Result<JsonValue> {
        self.current()
            .map_or(Ok(JsonValue::Null), StoredValue::value)
    }

    pub fn edge_refs(&self) -> Vec<&EdgeVersion> {
        self.edges.iter().collect()
    }

    pub fn value_refs(&self) -> Vec<&EdgeVersion> {
        self.values.iter().map(|v| &v.edge).collect()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredRelationship {
    /// `Relationship` vertex
    pub uuid: String,
    pub identifier: String,
    pub peer: String,
    pub peer_kind: String,
    /// This node's `IS_RELATED` versions
    pub local: Vec<EdgeVersion>,
    /// The peer's `IS_RELATED` versions
    pub remote: Vec<EdgeVersion>,
}

impl StoredRelationship {
    pub fn is_live(&self) -> bool {
        active_winner(self.local.iter(), |e| *e).is_some()
            && active_winner(self.remote.iter(), |e| *e).is_some()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StoredNode {
    pub uuid: String,
    pub kind: String,
    pub part_of: Vec<EdgeVersion>,
    pub attributes: BTreeMap<String, StoredAttribute>,
    pub relationships: BTreeMap<String, StoredRelationship>,
}

impl StoredNode {
    fn new(uuid: String, kind: String) -> Self {
        Self {
            uuid,
            kind,
            part_of: Vec::new(),
            attributes: BTreeMap::new(),
            relationships: BTreeMap::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        active_winner(self.part_of.iter(), |e| *e).is_some()
    }

    /// More than one active `IS_PART_OF` version on the winning branch
    pub fn has_ambiguous_membership(&self) -> bool {
        let Some(winner) = latest_by(self.part_of.iter(), |e| *e) else {
            return false;
        };
        self.part_of
            .iter()
            .filter(|e| e.is_active() && e.branch == winner.branch)
            .count()
            > 1
    }

    /// Attribute currently attached under `name`
    pub fn live_attribute(&self, name: &str) -> Option<&StoredAttribute> {
        let linked = self
            .attributes
            .values()
            .filter(|a| a.name == name)
            .filter_map(|a| a.link().map(|link| (link, a)));
        latest_by(linked, |(link, _)| *link).map(|(_, a)| a)
    }

    pub fn live_attributes(&self) -> impl Iterator<Item = &StoredAttribute> {
        self.attributes.values().filter(|a| a.link().is_some())
    }

    pub fn live_relationships<'a>(
        &'a self,
        identifier: &'a str,
    ) -> impl Iterator<Item = &'a StoredRelationship> + 'a {
        self.relationships
            .values()
            .filter(move |r| r.identifier == identifier && r.is_live())
    }

    pub fn all_live_relationships(&self) -> impl Iterator<Item = &StoredRelationship> {
        self.relationships.values().filter(|r| r.is_live())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum NodeSelector<'a> {
    Ids(&'a [String]),
    Kind(&'a str),
}

/// Raw view of the selected nodes as seen from `scope` at `at`
///
/// Nodes without an admitted `IS_PART_OF` edge are absent; nodes whose
/// winning edge is a deletion are present but not live.
pub(crate) async fn fetch_stored(
    db: &Database,
    scope: &BranchScope,
    at: Option<Timestamp>,
    selector: NodeSelector<'_>,
) -> Result<BTreeMap<String, StoredNode>> {
    let at = Timestamp::resolve(at);
    let mut nodes = BTreeMap::new();
    match selector {
        NodeSelector::Ids(ids) => {
            for chunk in ids.chunks(ID_CHUNK) {
                fetch_vertices(db, scope, at, Some(chunk), None, &mut nodes).await?;
            }
        }
        NodeSelector::Kind(kind) => {
            fetch_vertices(db, scope, at, None, Some(kind), &mut nodes).await?;
        }
    }

    let live: Vec<String> = nodes
        .values()
        .filter(|n| n.is_live())
        .map(|n| n.uuid.clone())
        .collect();
    for chunk in live.chunks(ID_CHUNK) {
        fetch_attributes(db, scope, at, chunk, &mut nodes).await?;
        fetch_relationships(db, scope, at, chunk, &mut nodes).await?;
    }
    Ok(nodes)
}

async fn fetch_vertices(
    db: &Database,
    scope: &BranchScope,
    at: Timestamp,
    ids: Option<&[String]>,
    kind: Option<&str>,
    nodes: &mut BTreeMap<String, StoredNode>,
) -> Result<()> {
    let mut query = Query::init("node_vertices", scope, Some(at));
    let filters = query.temporal_filter(&["p"], FilterStyle::Grouped, "f")?;
    query.add_param("root", ROOT_UUID)?;
    query.add_param("node_label", VertexLabel::Node.as_str())?;

    let mut conditions = vec![
        "n.label = $node_label".to_string(),
        format!("p.label = '{}'", EdgeLabel::IsPartOf),
        "p.dst = $root".to_string(),
    ];
    if let Some(ids) = ids {
        let list = query.add_list_param("id", ids.iter().map(String::as_str))?;
        conditions.push(format!("n.uuid IN {}", list));
    }
    if let Some(kind) = kind {
        query.add_param("kind", kind)?;
        conditions.push("n.kind = $kind".to_string());
    }
    conditions.extend(filters);

    query.add_to_query("FROM vertices n JOIN edges p ON p.src = n.uuid");
    query.add_to_query(format!("WHERE {}", conditions.join(" AND ")));
    query.add_return("n.uuid", "node_id");
    query.add_return("n.kind", "node_kind");
    query.add_edge_returns("p");
    query.order_by("p.eid");
    query.execute(db).await?;

    for result in query.results() {
        let uuid = result.text("node_id")?;
        let kind = result.text("node_kind")?;
        let edge = result.edge("p")?;
        nodes
            .entry(uuid.clone())
            .or_insert_with(|| StoredNode::new(uuid, kind))
            .part_of
            .push(edge);
    }
    Ok(())
}

async fn fetch_attributes(
    db: &Database,
    scope: &BranchScope,
    at: Timestamp,
    ids: &[String],
    nodes: &mut BTreeMap<String, StoredNode>,
) -> Result<()> {
    let mut query = Query::init("node_attributes", scope, Some(at));
    let filters = query.temporal_filter(&["r1", "r2"], FilterStyle::Grouped, "f")?;
    let list = query.add_list_param("id", ids.iter().map(String::as_str))?;
    query.add_to_query(
        "FROM edges r1 \
         JOIN vertices a ON a.uuid = r1.dst \
         JOIN edges r2 ON r2.src = a.uuid \
         JOIN vertices av ON av.uuid = r2.dst",
    );
    query.add_to_query(format!(
        "WHERE r1.label = '{}' AND r2.label = '{}' AND r1.src IN {} AND {}",
        EdgeLabel::HasAttribute,
        EdgeLabel::HasValue,
        list,
        filters.join(" AND ")
    ));
    query.add_return("r1.src", "node_id");
    query.add_return("a.uuid", "attr_id");
    query.add_return("a.name", "attr_name");
    query.add_return("av.uuid", "value_id");
    query.add_return("av.value", "value_raw");
    query.add_edge_returns("r1");
    query.add_edge_returns("r2");
    query.order_by("r1.eid");
    query.order_by("r2.eid");
    query.execute(db).await?;

    for result in query.results() {
        let Some(node) = nodes.get_mut(&result.text("node_id")?) else {
            continue;
        };
        let attr_id = result.text("attr_id")?;
        let name = result.text("attr_name")?;
        let attr = node
            .attributes
            .entry(attr_id.clone())
            .or_insert_with(|| StoredAttribute {
                uuid: attr_id,
                name,
                edges: Vec::new(),
                values: Vec::new(),
            });
        let link = result.edge("r1")?;
        if !attr.edges.iter().any(|e| e.eid == link.eid) {
            attr.edges.push(link);
        }
        let edge = result.edge("r2")?;
        if !attr.values.iter().any(|v| v.edge.eid == edge.eid) {
            attr.values.push(StoredValue {
                edge,
                uuid: result.text("value_id")?,
                raw: result.get_str("value_raw").map(str::to_string),
            });
        }
    }
    Ok(())
}

async fn fetch_relationships(
    db: &Database,
    scope: &BranchScope,
    at: Timestamp,
    ids: &[String],
    nodes: &mut BTreeMap<String, StoredNode>,
) -> Result<()> {
    let mut query = Query::init("node_relationships", scope, Some(at));
    let filters = query.temporal_filter(&["r1", "r2"], FilterStyle::Grouped, "f")?;
    let list = query.add_list_param("id", ids.iter().map(String::as_str))?;
    query.add_to_query(
        "FROM edges r1 \
         JOIN vertices rel ON rel.uuid = r1.dst \
         JOIN edges r2 ON r2.dst = rel.uuid \
         JOIN vertices peer ON peer.uuid = r2.src",
    );
    query.add_to_query(format!(
        "WHERE r1.label = '{label}' AND r2.label = '{label}' AND r2.src <> r1.src \
         AND r1.src IN {} AND {}",
        list,
        filters.join(" AND "),
        label = EdgeLabel::IsRelated,
    ));
    query.add_return("r1.src", "node_id");
    query.add_return("rel.uuid", "rel_id");
    query.add_return("rel.name", "identifier");
    query.add_return("peer.uuid", "peer_id");
    query.add_return("peer.kind", "peer_kind");
    query.add_edge_returns("r1");
    query.add_edge_returns("r2");
    query.order_by("r1.eid");
    query.order_by("r2.eid");
    query.execute(db).await?;

    for result in query.results() {
        let Some(node) = nodes.get_mut(&result.text("node_id")?) else {
            continue;
        };
        let rel_id = result.text("rel_id")?;
        let identifier = result.text("identifier")?;
        let peer = result.text("peer_id")?;
        let peer_kind = result.get_str("peer_kind").unwrap_or_default().to_string();
        let rel = node
            .relationships
            .entry(rel_id.clone())
            .or_insert_with(|| StoredRelationship {
                uuid: rel_id,
                identifier,
                peer,
                peer_kind,
                local: Vec::new(),
                remote: Vec::new(),
            });
        let local = result.edge("r1")?;
        if !rel.local.iter().any(|e| e.eid == local.eid) {
            rel.local.push(local);
        }
        let remote = result.edge("r2")?;
        if !rel.remote.iter().any(|e| e.eid == remote.eid) {
            rel.remote.push(remote);
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared write helpers
// ═══════════════════════════════════════════════════════════════════════════

/// New `Attribute` vertex holding `value`; returns the attribute uuid
pub(crate) fn add_attribute(
    batch: &mut WriteBatch,
    node_id: &str,
    name: &str,
    value: &JsonValue,
) -> Result<String> {
    let attr_id = batch.create_vertex(NewVertex::new(VertexLabel::Attribute).name(name))?;
    batch.create_edge(EdgeLabel::HasAttribute, node_id, &attr_id)?;
    add_value(batch, &attr_id, value)?;
    Ok(attr_id)
}

fn add_value(batch: &mut WriteBatch, attr_id: &str, value: &JsonValue) -> Result<()> {
    let value_id = batch.create_vertex(
        NewVertex::new(VertexLabel::AttributeValue).value(serde_json::to_string(value)?),
    )?;
    batch.create_edge(EdgeLabel::HasValue, attr_id, &value_id)
}

fn add_relationship(
    batch: &mut WriteBatch,
    identifier: &str,
    node_id: &str,
    peer_id: &str,
) -> Result<()> {
    let rel_id = batch.create_vertex(NewVertex::new(VertexLabel::Relationship).name(identifier))?;
    batch.create_edge(EdgeLabel::IsRelated, node_id, &rel_id)?;
    batch.create_edge(EdgeLabel::IsRelated, peer_id, &rel_id)
}

fn retire_relationship(
    batch: &mut WriteBatch,
    node_id: &str,
    rel: &StoredRelationship,
) -> Result<()> {
    let local: Vec<&EdgeVersion> = rel.local.iter().collect();
    batch.retire(EdgeLabel::IsRelated, node_id, &rel.uuid, &local)?;
    let remote: Vec<&EdgeVersion> = rel.remote.iter().collect();
    batch.retire(EdgeLabel::IsRelated, &rel.peer, &rel.uuid, &remote)?;
    Ok(())
}

/// Detach the attribute from its node
pub(crate) fn retire_attribute(
    batch: &mut WriteBatch,
    node_id: &str,
    attr: &StoredAttribute,
) -> Result<bool> {
    batch.retire(EdgeLabel::HasAttribute, node_id, &attr.uuid, &attr.edge_refs())
}

/// Close or mask the node's `IS_PART_OF`, `HAS_ATTRIBUTE` and own
/// `IS_RELATED` edges
pub(crate) fn retire_node(batch: &mut WriteBatch, node: &StoredNode) -> Result<()> {
    let part_of: Vec<&EdgeVersion> = node.part_of.iter().collect();
    batch.retire(EdgeLabel::IsPartOf, &node.uuid, ROOT_UUID, &part_of)?;
    for attr in node.live_attributes() {
        retire_attribute(batch, &node.uuid, attr)?;
    }
    for rel in node.all_live_relationships() {
        let local: Vec<&EdgeVersion> = rel.local.iter().collect();
        batch.retire(EdgeLabel::IsRelated, &node.uuid, &rel.uuid, &local)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════

/// Filter accepted by [`NodeManager::query`]
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFilter {
    /// `ids`
    Ids(Vec<String>),
    /// `<attr>__value`
    AttributeValue { attribute: String, value: JsonValue },
    /// `<rel>__ids`
    RelationshipIds { relationship: String, ids: Vec<String> },
    /// Bare scalar applied to the kind's `default_filter`
    Default(JsonValue),
}

impl NodeFilter {
    /// Parse the keyed form (`ids`, `<attr>__value`, `<rel>__ids`)
    pub fn parse(key: &str, value: JsonValue) -> Result<Self> {
        if key == "ids" {
            return Ok(NodeFilter::Ids(id_list(key, &value)?));
        }
        if let Some(attribute) = key.strip_suffix("__value") {
            return Ok(NodeFilter::AttributeValue {
                attribute: attribute.to_string(),
                value,
            });
        }
        if let Some(relationship) = key.strip_suffix("__ids") {
            return Ok(NodeFilter::RelationshipIds {
                relationship: relationship.to_string(),
                ids: id_list(key, &value)?,
            });
        }
        Err(GraphError::validation(
            key,
            format!("'{}' is not a supported filter", key),
        ))
    }

    fn resolve(self, schema: &NodeSchema) -> Result<Self> {
        match self {
            NodeFilter::Default(value) => {
                let key = schema.default_filter.as_deref().ok_or_else(|| {
                    GraphError::validation(
                        "default_filter",
                        format!("{} has no default filter", schema.kind),
                    )
                })?;
                let key = if key.ends_with("__value") {
                    key.to_string()
                } else {
                    format!("{}__value", key)
                };
                NodeFilter::parse(&key, value)?.resolve(schema)
            }
            NodeFilter::AttributeValue { ref attribute, .. } => {
                schema.get_attribute(attribute)?;
                Ok(self)
            }
            NodeFilter::RelationshipIds {
                ref relationship, ..
            } => {
                schema.get_relationship(relationship)?;
                Ok(self)
            }
            NodeFilter::Ids(_) => Ok(self),
        }
    }

    fn matches(&self, node: &Node) -> bool {
        match self {
            NodeFilter::Ids(ids) => ids.iter().any(|id| id == node.id()),
            NodeFilter::AttributeValue { attribute, value } => node.get(attribute) == Some(value),
            NodeFilter::RelationshipIds { relationship, ids } => node
                .relationship(relationship)
                .map(|rel| ids.iter().any(|id| rel.contains(id)))
                .unwrap_or(false),
            NodeFilter::Default(_) => false,
        }
    }
}

fn id_list(key: &str, value: &JsonValue) -> Result<Vec<String>> {
    let invalid = || GraphError::validation(key, format!("'{}' expects an id or a list of ids", key));
    match value {
        JsonValue::String(id) => Ok(vec![id.clone()]),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

/// Requested ids absent from `found`, in request order
pub fn missing_ids(requested: &[String], found: &BTreeMap<String, Node>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    requested
        .iter()
        .filter(|id| !found.contains_key(*id) && seen.insert(id.as_str()))
        .cloned()
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Manager
// ═══════════════════════════════════════════════════════════════════════════

/// Per-call cache of `Arc<NodeSchema>` built from one schema snapshot
struct SchemaLookup<'a> {
    schema: &'a SchemaBranch,
    nodes: HashMap<String, Arc<NodeSchema>>,
}

impl<'a> SchemaLookup<'a> {
    fn new(schema: &'a SchemaBranch) -> Self {
        Self {
            schema,
            nodes: HashMap::new(),
        }
    }

    fn get(&mut self, kind: &str) -> Result<Arc<NodeSchema>> {
        if let Some(node) = self.nodes.get(kind) {
            return Ok(node.clone());
        }
        let node = Arc::new(self.schema.get(kind)?.clone());
        self.nodes.insert(kind.to_string(), node.clone());
        Ok(node)
    }
}

/// Whether a node of `peer_kind` may sit on the other side of `rel`
fn peer_accepted(schema: &SchemaBranch, rel: &RelationshipSchema, peer_kind: &str) -> bool {
    rel.accepts_peer(peer_kind)
        || schema
            .get(peer_kind)
            .map(|peer| peer.inherit_from.iter().any(|k| k == &rel.peer))
            .unwrap_or(false)
}

/// Node other than `node` holding `peer` through the reverse side of `rel`
/// when that side has cardinality one
fn reverse_holder(
    schema: &SchemaBranch,
    node: &Node,
    rel: &RelationshipManager,
    peer: &StoredNode,
) -> Option<String> {
    let identifier = rel.identifier();
    let peer_schema = schema.get(&peer.kind).ok()?;
    let reverse = peer_schema.relationships.iter().find(|r| {
        r.identifier_for(&peer.kind) == identifier && peer_accepted(schema, r, node.kind())
    })?;
    if reverse.cardinality != Cardinality::One {
        return None;
    }
    let current: Vec<&StoredRelationship> = peer.live_relationships(&identifier).collect();
    if current.iter().any(|r| r.peer == node.id()) {
        return None;
    }
    current.first().map(|r| r.peer.clone())
}

fn build_node(lookup: &mut SchemaLookup<'_>, branch: &str, stored: &StoredNode) -> Result<Node> {
    let schema = lookup.get(&stored.kind)?;
    let mut node = Node::new(schema.clone(), branch).with_id(stored.uuid.clone());

    for attr_schema in &schema.attributes {
        let value = match stored.live_attribute(&attr_schema.name) {
            Some(attr) => attr.current_value()?,
            None => attr_schema.default_value.clone().unwrap_or(JsonValue::Null),
        };
        node.attributes.insert(
            attr_schema.name.clone(),
            Attribute {
                name: attr_schema.name.clone(),
                value,
            },
        );
    }
    for rel_schema in &schema.relationships {
        let identifier = rel_schema.identifier_for(&schema.kind);
        let peers: BTreeSet<String> = stored
            .live_relationships(&identifier)
            .filter(|r| peer_accepted(lookup.schema, rel_schema, &r.peer_kind))
            .map(|r| r.peer.clone())
            .collect();
        node.relationships.insert(
            rel_schema.name.clone(),
            RelationshipManager::new(rel_schema.clone(), schema.kind.clone())
                .with_peers(peers.into_iter().collect()),
        );
    }
    node.mark_persisted();
    Ok(node)
}

#[derive(Clone)]
pub struct NodeManager {
    db: Database,
    branches: Arc<BranchRegistry>,
    schema: Arc<SchemaManager>,
}

impl NodeManager {
    pub fn new(db: Database, branches: Arc<BranchRegistry>, schema: Arc<SchemaManager>) -> Self {
        Self {
            db,
            branches,
            schema,
        }
    }

    /// Unsaved node of `kind`; `branch = None` means the default branch
    pub async fn new_node(&self, kind: &str, branch: Option<&str>) -> Result<Node> {
        let branch = self.branches.get_or_default(branch).await?;
        let schema = self.schema.get(&branch.name, kind).await?;
        Ok(Node::new(Arc::new(schema), branch.name.clone()))
    }

    /// `Ok(None)` when no live node has this id; `Conflict` when the id is
    /// attached to the graph more than once on the branch
    pub async fn get_one(
        &self,
        id: &str,
        branch: Option<&str>,
        at: Option<Timestamp>,
    ) -> Result<Option<Node>> {
        let mut nodes = self.get_many(&[id.to_string()], branch, at).await?;
        Ok(nodes.remove(id))
    }

    /// Live nodes keyed by id; unknown ids are left out (see [`missing_ids`])
    pub async fn get_many(
        &self,
        ids: &[String],
        branch: Option<&str>,
        at: Option<Timestamp>,
    ) -> Result<BTreeMap<String, Node>> {
        let branch = self.branches.get_or_default(branch).await?;
        let scope = self.branches.scope(&branch.name).await?;
        let schema = self.schema.load(&branch.name).await?;
        let mut lookup = SchemaLookup::new(&schema);

        let stored = fetch_stored(&self.db, &scope, at, NodeSelector::Ids(ids)).await?;
        let mut nodes = BTreeMap::new();
        for stored in stored.values().filter(|n| n.is_live()) {
            if stored.has_ambiguous_membership() {
                return Err(GraphError::Conflict(format!(
                    "node '{}' has {} active memberships on branch {}",
                    stored.uuid,
                    stored.part_of.iter().filter(|e| e.is_active()).count(),
                    branch.name
                )));
            }
            nodes.insert(
                stored.uuid.clone(),
                build_node(&mut lookup, &branch.name, stored)?,
            );
        }
        debug!(branch = %branch.name, requested = ids.len(), found = nodes.len(), "nodes loaded");
        Ok(nodes)
    }

    /// Live nodes of `kind` matching every filter, ordered by id
    pub async fn query(
        &self,
        kind: &str,
        filters: &[NodeFilter],
        branch: Option<&str>,
        at: Option<Timestamp>,
    ) -> Result<Vec<Node>> {
        let branch = self.branches.get_or_default(branch).await?;
        let scope = self.branches.scope(&branch.name).await?;
        let schema = self.schema.load(&branch.name).await?;
        let node_schema = schema.get(kind)?;
        let filters = filters
            .iter()
            .cloned()
            .map(|f| f.resolve(node_schema))
            .collect::<Result<Vec<_>>>()?;

        let ids = filters.iter().find_map(|f| match f {
            NodeFilter::Ids(ids) => Some(ids.clone()),
            _ => None,
        });
        let stored = match &ids {
            Some(ids) => fetch_stored(&self.db, &scope, at, NodeSelector::Ids(ids)).await?,
            None => fetch_stored(&self.db, &scope, at, NodeSelector::Kind(kind)).await?,
        };

        let mut lookup = SchemaLookup::new(&schema);
        let mut nodes = Vec::new();
        for stored in stored.values() {
            if stored.kind != kind || !stored.is_live() {
                continue;
            }
            let node = build_node(&mut lookup, &branch.name, stored)?;
            if filters.iter().all(|f| f.matches(&node)) {
                nodes.push(node);
            }
        }
        debug!(kind, branch = %branch.name, count = nodes.len(), "node query");
        Ok(nodes)
    }

    /// Like [`query`](Self::query) but expecting at most one match
    pub async fn query_one(
        &self,
        kind: &str,
        filters: &[NodeFilter],
        branch: Option<&str>,
        at: Option<Timestamp>,
    ) -> Result<Option<Node>> {
        let mut nodes = self.query(kind, filters, branch, at).await?;
        if nodes.len() > 1 {
            return Err(GraphError::Conflict(format!(
                "{} nodes of kind {} match the filters, expected at most one",
                nodes.len(),
                kind
            )));
        }
        Ok(nodes.pop())
    }

    async fn vertex_exists(&self, uuid: &str) -> Result<bool> {
        let stmt = Statement::new("SELECT uuid FROM vertices WHERE uuid = $uuid")
            .bind("uuid", uuid)?
            .with_columns(["uuid"]);
        Ok(!self.db.fetch(&stmt).await?.is_empty())
    }

    async fn check_peers(&self, node: &Node, scope: &BranchScope) -> Result<()> {
        let wanted: BTreeSet<String> = node
            .relationships()
            .flat_map(|r| r.peers().iter().cloned())
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }
        let wanted: Vec<String> = wanted.into_iter().collect();
        let found = fetch_stored(&self.db, scope, None, NodeSelector::Ids(&wanted)).await?;
        let schema = self.schema.load(node.branch()).await?;

        for rel in node.relationships() {
            for peer in rel.peers() {
                match found.get(peer).filter(|p| p.is_live()) {
                    None => {
                        return Err(GraphError::validation(
                            rel.name(),
                            format!(
                                "peer '{}' of {}.{} does not exist on branch {}",
                                peer,
                                node.kind(),
                                rel.name(),
                                node.branch()
                            ),
                        ))
                    }
                    Some(p) if !peer_accepted(&schema, rel.schema(), &p.kind) => {
                        return Err(GraphError::validation(
                            rel.name(),
                            format!(
                                "'{}' of kind {} is not a valid peer for {}.{}, expected {}",
                                peer,
                                p.kind,
                                node.kind(),
                                rel.name(),
                                rel.schema().peer
                            ),
                        ))
                    }
                    Some(p) => {
                        if let Some(holder) = reverse_holder(&schema, node, rel, p) {
                            return Err(GraphError::validation(
                                rel.name(),
                                format!(
                                    "'{}' already belongs to '{}' through a relationship of cardinality one",
                                    peer, holder
                                ),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Reject a unique attribute value already held by another live node of
    /// the same kind on the node's branch
    async fn check_unique(&self, node: &Node, stored: Option<&StoredNode>) -> Result<()> {
        for attr_schema in node.schema().attributes.iter().filter(|a| a.unique) {
            let Some(value) = node.get(&attr_schema.name).filter(|v| !v.is_null()) else {
                continue;
            };
            let unchanged = match stored.and_then(|s| s.live_attribute(&attr_schema.name)) {
                Some(existing) => &existing.current_value()? == value,
                None => false,
            };
            if unchanged {
                continue;
            }
            let filter = NodeFilter::AttributeValue {
                attribute: attr_schema.name.clone(),
                value: value.clone(),
            };
            let holders = self
                .query(node.kind(), &[filter], Some(node.branch()), None)
                .await?;
            if let Some(other) = holders.iter().find(|n| n.id() != node.id()) {
                return Err(GraphError::validation(
                    attr_schema.name.as_str(),
                    format!(
                        "{}.{} must be unique, {} is already used by '{}'",
                        node.kind(),
                        attr_schema.name,
                        value,
                        other.id()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Persist the node on its branch, stamped now, in one transaction
    ///
    /// Only values and peers that differ from the stored state are written.
    pub async fn save(&self, node: &mut Node) -> Result<()> {
        node.validate()?;
        let scope = self.branches.scope(node.branch()).await?;
        self.schema.get(node.branch(), node.kind()).await?;
        self.check_peers(node, &scope).await?;

        let id = node.id().to_string();
        let stored = fetch_stored(&self.db, &scope, None, NodeSelector::Ids(&[id.clone()]))
            .await?
            .remove(&id);
        self.check_unique(node, stored.as_ref().filter(|s| s.is_live()))
            .await?;
        let mut batch = WriteBatch::new(&scope, Timestamp::now());

        let stored = match stored {
            Some(stored) if stored.is_live() => stored,
            Some(stored) => {
                let part_of: Vec<&EdgeVersion> = stored.part_of.iter().collect();
                batch.supersede(&part_of)?;
                batch.create_edge(EdgeLabel::IsPartOf, &id, ROOT_UUID)?;
                stored
            }
            None => {
                if !self.vertex_exists(&id).await? {
                    batch.create_vertex(
                        NewVertex::with_uuid(VertexLabel::Node, id.as_str()).kind(node.kind()),
                    )?;
                }
                batch.create_edge(EdgeLabel::IsPartOf, &id, ROOT_UUID)?;
                StoredNode::new(id.clone(), node.kind().to_string())
            }
        };

        for attr in node.attributes() {
            match stored.live_attribute(&attr.name) {
                Some(existing) => {
                    if existing.current_value()? == attr.value {
                        continue;
                    }
                    batch.supersede(&existing.value_refs())?;
                    add_value(&mut batch, &existing.uuid, &attr.value)?;
                }
                None => {
                    add_attribute(&mut batch, &id, &attr.name, &attr.value)?;
                }
            }
        }

        for rel in node.relationships() {
            let identifier = rel.identifier();
            let existing: Vec<&StoredRelationship> = stored
                .live_relationships(&identifier)
                .filter(|r| rel.schema().accepts_peer(&r.peer_kind) || rel.contains(&r.peer))
                .collect();
            for current in &existing {
                if !rel.contains(&current.peer) {
                    retire_relationship(&mut batch, &id, current)?;
                }
            }
            for peer in rel.peers() {
                if !existing.iter().any(|r| &r.peer == peer) {
                    add_relationship(&mut batch, &identifier, &id, peer)?;
                }
            }
        }

        let statements = batch.len();
        batch.commit(&self.db).await?;
        node.mark_persisted();
        debug!(id = %id, kind = %node.kind(), branch = %node.branch(), statements, "node saved");
        Ok(())
    }

    /// Close or mask the node's edges on its branch
    pub async fn delete(&self, node: &Node) -> Result<()> {
        let scope = self.branches.scope(node.branch()).await?;
        let id = node.id().to_string();
        let stored = fetch_stored(&self.db, &scope, None, NodeSelector::Ids(&[id.clone()]))
            .await?
            .remove(&id)
            .filter(StoredNode::is_live)
            .ok_or_else(|| GraphError::node_not_found(node.branch(), node.kind(), node.id()))?;

        let mut batch = WriteBatch::new(&scope, Timestamp::now());
        retire_node(&mut batch, &stored)?;
        let statements = batch.len();
        batch.commit(&self.db).await?;
        debug!(id = %id, kind = %node.kind(), branch = %node.branch(), statements, "node deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_parse() {
        assert_eq!(
            NodeFilter::parse("name__value", json!("accord")).unwrap(),
            NodeFilter::AttributeValue {
                attribute: "name".into(),
                value: json!("accord"),
            }
        );
        assert_eq!(
            NodeFilter::parse("owner__ids", json!("p1")).unwrap(),
            NodeFilter::RelationshipIds {
                relationship: "owner".into(),
                ids: vec!["p1".into()],
            }
        );
        assert_eq!(
            NodeFilter::parse("ids", json!(["a", "b"])).unwrap(),
            NodeFilter::Ids(vec!["a".into(), "b".into()])
        );
        assert!(NodeFilter::parse("ids", json!(3)).is_err());
        assert!(NodeFilter::parse("color", json!("red")).is_err());
    }

    #[test]
    fn test_default_filter_resolution() {
        use crate::schema::{AttributeKind, AttributeSchema};

        let schema = NodeSchema::new("TestPerson")
            .attribute(AttributeSchema::new("name", AttributeKind::Text))
            .default_filter("name__value");
        let resolved = NodeFilter::Default(json!("john")).resolve(&schema).unwrap();
        assert_eq!(
            resolved,
            NodeFilter::AttributeValue {
                attribute: "name".into(),
                value: json!("john"),
            }
        );

        let bare = NodeSchema::new("TestBoat");
        assert!(NodeFilter::Default(json!("x")).resolve(&bare).is_err());
        assert!(NodeFilter::parse("height__value", json!(2))
            .unwrap()
            .resolve(&schema)
            .is_err());
    }

    #[test]
    fn test_missing_ids_keeps_request_order() {
        let found = BTreeMap::new();
        let requested = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(missing_ids(&requested, &found), vec!["b", "a"]);
    }
}
