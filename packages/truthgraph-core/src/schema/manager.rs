//! Per-branch schema persistence and cache
//!
//! Each node kind is stored as a `SchemaNode` vertex (JSON definition in
//! `props`) linked from the root by a `HAS_SCHEMA` edge. Updating a kind adds
//! a new vertex and supersedes the edge, so schemas time-travel and branch
//! like any other data.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{NodeSchema, SchemaBranch, SchemaDiff};
use crate::branch::filter::{active_winner, latest_by, EdgeVersion, FilterStyle};
use crate::branch::{BranchRegistry, BranchScope};
use crate::error::{GraphError, Result};
use crate::migrations::schema::CompositeMigration;
use crate::query::{Database, NewVertex, Query, WriteBatch};
use crate::store::{EdgeLabel, VertexLabel, ROOT_UUID};
use crate::timestamp::Timestamp;

/// Result of [`SchemaManager::update`]
#[derive(Debug, Clone)]
pub struct SchemaUpdate {
    pub branch: String,
    pub previous: Arc<SchemaBranch>,
    pub next: Arc<SchemaBranch>,
    pub diff: SchemaDiff,
    pub updated_at: Timestamp,
}

impl SchemaUpdate {
    /// Data migrations derived from the diff
    pub fn migration(&self) -> CompositeMigration {
        CompositeMigration::from_diff(&self.diff, &self.next)
    }
}

type SchemaSlots = BTreeMap<String, Vec<(EdgeVersion, Option<String>)>>;

/// Candidate schema resolved against the stored one, not yet written
struct PreparedUpdate {
    scope: BranchScope,
    slots: SchemaSlots,
    previous: SchemaBranch,
    next: SchemaBranch,
    diff: SchemaDiff,
}

pub struct SchemaManager {
    db: Database,
    branches: Arc<BranchRegistry>,
    cache: RwLock<HashMap<String, Arc<SchemaBranch>>>,
    /// Bumped on every invalidation; a load only fills the cache when no
    /// invalidation happened while it was reading the store
    generation: AtomicU64,
}

impl SchemaManager {
    pub fn new(db: Database, branches: Arc<BranchRegistry>) -> Self {
        Self {
            db,
            branches,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cache `schema` for `branch` unless the cache was invalidated since
    /// `seen`; returns whether it was cached
    fn fill_cache(&self, branch: &str, schema: Arc<SchemaBranch>, seen: u64) -> bool {
        let mut cache = self.cache.write();
        if self.generation() != seen {
            return false;
        }
        cache.insert(branch.to_string(), schema);
        true
    }

    /// Branch whose schema `branch` uses (data-only branches defer to the default)
    async fn owner_scope(&self, branch: &str) -> Result<BranchScope> {
        let resolved = self.branches.get(branch).await?;
        if resolved.is_data_only {
            return self.branches.scope(self.branches.default_branch_name()).await;
        }
        self.branches.scope(branch).await
    }

    async fn load_slots(&self, scope: &BranchScope, at: Option<Timestamp>) -> Result<SchemaSlots> {
        let mut query = Query::init("schema_load", scope, at);
        let filters = query.temporal_filter(&["e"], FilterStyle::Grouped, "f")?;
        query.add_param("root", ROOT_UUID)?;
        query.add_to_query("FROM edges e JOIN vertices s ON s.uuid = e.dst");
        query.add_to_query(format!(
            "WHERE e.label = '{}' AND e.src = $root AND {}",
            EdgeLabel::HasSchema,
            filters.join(" AND ")
        ));
        query.add_edge_returns("e");
        query.add_return("s.name", "kind");
        query.add_return("s.props", "props");
        query.order_by("e.eid");
        query.execute(&self.db).await?;

        let mut slots = SchemaSlots::new();
        for result in query.results() {
            let edge = result.edge("e")?;
            let kind = result.text("kind")?;
            let props = result.get_str("props").map(str::to_string);
            slots.entry(kind).or_default().push((edge, props));
        }
        Ok(slots)
    }

    fn resolve(slots: &SchemaSlots) -> Result<SchemaBranch> {
        let mut nodes = Vec::with_capacity(slots.len());
        for candidates in slots.values() {
            if let Some((_, props)) = active_winner(candidates.iter(), |(e, _)| e) {
                let props = props
                    .as_deref()
                    .ok_or_else(|| GraphError::internal("schema vertex without definition"))?;
                nodes.push(serde_json::from_str::<NodeSchema>(props)?);
            }
        }
        SchemaBranch::new(nodes)
    }

    /// Current schema of `branch` (cached)
    pub async fn load(&self, branch: &str) -> Result<Arc<SchemaBranch>> {
        if let Some(schema) = self.cache.read().get(branch) {
            return Ok(schema.clone());
        }
        let seen = self.generation();
        let scope = self.owner_scope(branch).await?;
        let schema = Arc::new(Self::resolve(&self.load_slots(&scope, None).await?)?);
        let cached = self.fill_cache(branch, schema.clone(), seen);
        debug!(branch = %branch, kinds = schema.len(), cached, "schema loaded");
        Ok(schema)
    }

    /// Schema of `branch` as it was at `at` (never cached)
    pub async fn load_at(&self, branch: &str, at: Timestamp) -> Result<SchemaBranch> {
        let scope = self.owner_scope(branch).await?;
        Self::resolve(&self.load_slots(&scope, Some(at)).await?)
    }

    pub async fn get(&self, branch: &str, kind: &str) -> Result<NodeSchema> {
        self.load(branch).await?.get(kind).cloned()
    }

    /// Drop cached snapshots (`None` drops all)
    pub fn invalidate(&self, branch: Option<&str>) {
        let mut cache = self.cache.write();
        self.generation.fetch_add(1, Ordering::SeqCst);
        match branch {
            Some(name) => {
                cache.remove(name);
            }
            None => cache.clear(),
        }
    }

    async fn prepare(&self, branch: &str, next: SchemaBranch) -> Result<PreparedUpdate> {
        let resolved = self.branches.get(branch).await?;
        if resolved.is_data_only {
            return Err(GraphError::validation(
                "branch",
                format!("'{}' is a data-only branch and cannot hold schema changes", branch),
            ));
        }
        let scope = self.branches.scope(branch).await?;
        let slots = self.load_slots(&scope, None).await?;
        let previous = Self::resolve(&slots)?;
        let next = assign_attribute_ids(&previous, next)?;
        let diff = SchemaDiff::between(&previous, &next);
        Ok(PreparedUpdate {
            scope,
            slots,
            previous,
            next,
            diff,
        })
    }

    /// What [`update`](Self::update) would do, without writing anything
    ///
    /// The returned migration can be validated against the stored data
    /// before the schema change is committed.
    pub async fn plan(&self, branch: &str, next: SchemaBranch) -> Result<SchemaUpdate> {
        let prepared = self.prepare(branch, next).await?;
        Ok(SchemaUpdate {
            branch: branch.to_string(),
            previous: Arc::new(prepared.previous),
            next: Arc::new(prepared.next),
            diff: prepared.diff,
            updated_at: Timestamp::now(),
        })
    }

    /// Replace the schema of `branch` with `next`
    ///
    /// Attributes without an id inherit the id of the same-named attribute
    /// in the current schema, or get a new one.
    pub async fn update(&self, branch: &str, next: SchemaBranch) -> Result<SchemaUpdate> {
        let PreparedUpdate {
            scope,
            slots,
            previous,
            next,
            diff,
        } = self.prepare(branch, next).await?;

        let now = Timestamp::now();
        let mut batch = WriteBatch::new(&scope, now);
        for node in next.nodes() {
            if previous.get(&node.kind).ok() == Some(node) {
                continue;
            }
            let candidates: Vec<&EdgeVersion> = slots
                .get(&node.kind)
                .map(|c| c.iter().map(|(e, _)| e).collect())
                .unwrap_or_default();
            batch.supersede(&candidates)?;
            let vertex = batch.create_vertex(
                NewVertex::new(VertexLabel::SchemaNode)
                    .name(node.kind.clone())
                    .props(serde_json::to_string(node)?),
            )?;
            batch.create_edge(EdgeLabel::HasSchema, ROOT_UUID, &vertex)?;
        }
        for node in previous.nodes() {
            if next.has(&node.kind) {
                continue;
            }
            if let Some(candidates) = slots.get(&node.kind) {
                let candidates: Vec<&EdgeVersion> = candidates.iter().map(|(e, _)| e).collect();
                if let Some(winner) = latest_by(candidates.iter().copied(), |e| *e) {
                    let dst = winner.dst.clone();
                    batch.retire(EdgeLabel::HasSchema, ROOT_UUID, &dst, &candidates)?;
                }
            }
        }
        let written = batch.len();
        batch.commit(&self.db).await?;

        let next = Arc::new(next);
        {
            // descendants reload through their own scope
            let mut cache = self.cache.write();
            self.generation.fetch_add(1, Ordering::SeqCst);
            cache.clear();
            cache.insert(branch.to_string(), next.clone());
        }

        info!(
            branch = %branch,
            changes = diff.len(),
            statements = written,
            "schema updated"
        );
        Ok(SchemaUpdate {
            branch: branch.to_string(),
            previous: Arc::new(previous),
            next,
            diff,
            updated_at: now,
        })
    }
}

fn assign_attribute_ids(previous: &SchemaBranch, next: SchemaBranch) -> Result<SchemaBranch> {
    let mut nodes: Vec<NodeSchema> = next.nodes().cloned().collect();
    for node in &mut nodes {
        let prev = previous.get(&node.kind).ok();
        for attr in &mut node.attributes {
            if attr.id.is_some() {
                continue;
            }
            let inherited = prev
                .and_then(|p| p.attributes.iter().find(|a| a.name == attr.name))
                .and_then(|a| a.id.clone());
            attr.id = Some(inherited.unwrap_or_else(|| Uuid::new_v4().to_string()));
        }
    }
    SchemaBranch::new(nodes)
}
