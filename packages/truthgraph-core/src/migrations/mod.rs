//! Migration framework
//!
//! Graph migrations are ordered by the graph version they produce
//! (`minimum_version + 1`) and run once each, under the migration lock of
//! the default branch. The graph version and the history of applied
//! migrations are stored in the graph itself (`HAS_GRAPH_VERSION`,
//! `APPLIED_MIGRATION` edges from the root). Schema migrations are derived
//! from a [`SchemaDiff`](crate::schema::SchemaDiff) and run right after the
//! schema update they belong to.
//!
//! Every migration must be safe to run again: a second run reports zero
//! changes.

pub mod graph;
pub mod schema;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::branch::filter::{active_winner, EdgeVersion, FilterStyle};
use crate::branch::{BranchRegistry, BranchScope};
use crate::error::{GraphError, Result};
use crate::lock::{namespace, LockRegistry};
use crate::query::{Database, NewVertex, Query, WriteBatch};
use crate::schema::SchemaManager;
use crate::store::{EdgeLabel, VertexLabel, ROOT_UUID};
use crate::timestamp::Timestamp;

pub use schema::CompositeMigration;

/// Everything a migration may touch while running against one branch
pub struct MigrationContext<'a> {
    pub db: &'a Database,
    pub branches: &'a BranchRegistry,
    pub schema: &'a SchemaManager,
    pub scope: BranchScope,
}

impl MigrationContext<'_> {
    pub fn branch(&self) -> &str {
        self.scope.name()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationResult {
    pub errors: Vec<String>,
    /// Nodes, attributes or edges rewritten
    pub changes: usize,
}

impl MigrationResult {
    pub fn with_changes(changes: usize) -> Self {
        Self {
            errors: Vec::new(),
            changes,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            changes: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: MigrationResult) {
        self.errors.extend(other.errors);
        self.changes += other.changes;
    }
}

#[async_trait]
pub trait Migration: Send + Sync {
    fn name(&self) -> &str;

    /// Lowest graph version this migration applies to
    fn minimum_version(&self) -> u32;

    /// Graph version after a successful run
    fn version(&self) -> u32 {
        self.minimum_version() + 1
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult>;

    /// Read-only check of the data the migration would rewrite
    async fn validate(&self, _ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        Ok(MigrationResult::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// State machine
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Pending => "pending",
            MigrationState::Running => "running",
            MigrationState::Succeeded => "succeeded",
            MigrationState::Failed => "failed",
        }
    }

    pub fn can_transition(self, next: MigrationState) -> bool {
        matches!(
            (self, next),
            (MigrationState::Pending, MigrationState::Running)
                | (MigrationState::Running, MigrationState::Succeeded)
                | (MigrationState::Running, MigrationState::Failed)
        )
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One execution of one migration
#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub name: String,
    pub state: MigrationState,
    pub result: MigrationResult,
}

impl MigrationRun {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: MigrationState::Pending,
            result: MigrationResult::default(),
        }
    }

    pub fn transition(&mut self, next: MigrationState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(GraphError::Internal(format!(
                "migration {} cannot go from {} to {}",
                self.name, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn into_error(self, applied: Vec<String>) -> GraphError {
        GraphError::Migration {
            name: self.name,
            errors: self.result.errors,
            applied,
        }
    }
}

/// Run `migration` through `PENDING -> RUNNING -> SUCCEEDED | FAILED`
pub async fn execute_migration(
    migration: &dyn Migration,
    ctx: &MigrationContext<'_>,
) -> Result<MigrationRun> {
    let mut run = MigrationRun::new(migration.name());
    run.transition(MigrationState::Running)?;
    let outcome = match migration.execute(ctx).await {
        Ok(result) => result,
        Err(err) if err.is_retryable() => return Err(err),
        Err(err) => MigrationResult::failed(err.to_string()),
    };
    let next = if outcome.success() {
        MigrationState::Succeeded
    } else {
        MigrationState::Failed
    };
    run.result = outcome;
    run.transition(next)?;
    Ok(run)
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Graph migrations known to this build, ordered by version
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Arc<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the built-in graph migrations
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for migration in graph::builtin() {
            registry.register(migration)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, migration: Arc<dyn Migration>) -> Result<()> {
        if self
            .migrations
            .iter()
            .any(|m| m.version() == migration.version() || m.name() == migration.name())
        {
            return Err(GraphError::validation(
                "migration",
                format!(
                    "{} (version {}) collides with a registered migration",
                    migration.name(),
                    migration.version()
                ),
            ));
        }
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version());
        Ok(())
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Migration>> {
        self.migrations.iter().find(|m| m.name() == name).cloned()
    }

    /// Migrations producing a version above `current`, ascending
    pub fn pending(&self, current: u32) -> Vec<Arc<dyn Migration>> {
        self.migrations
            .iter()
            .filter(|m| m.version() > current)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════

/// History entry stored on a `Migration` vertex
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub name: String,
    pub version: u32,
    pub changes: usize,
    pub applied_at: Timestamp,
}

pub struct MigrationRunner {
    db: Database,
    branches: Arc<BranchRegistry>,
    schema: Arc<SchemaManager>,
    locks: Arc<LockRegistry>,
    registry: MigrationRegistry,
}

impl MigrationRunner {
    pub fn new(
        db: Database,
        branches: Arc<BranchRegistry>,
        schema: Arc<SchemaManager>,
        locks: Arc<LockRegistry>,
        registry: MigrationRegistry,
    ) -> Self {
        Self {
            db,
            branches,
            schema,
            locks,
            registry,
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub async fn context(&self, branch: &str) -> Result<MigrationContext<'_>> {
        Ok(MigrationContext {
            db: &self.db,
            branches: &self.branches,
            schema: &self.schema,
            scope: self.branches.scope(branch).await?,
        })
    }

    async fn default_scope(&self) -> Result<BranchScope> {
        self.branches.scope(self.branches.default_branch_name()).await
    }

    async fn version_slot(&self, scope: &BranchScope) -> Result<Vec<(EdgeVersion, Option<String>)>> {
        let mut query = Query::init("graph_version", scope, None);
        let filters = query.temporal_filter(&["e"], FilterStyle::Grouped, "f")?;
        query.add_param("root", ROOT_UUID)?;
        query.add_to_query("FROM edges e JOIN vertices v ON v.uuid = e.dst");
        query.add_to_query(format!(
            "WHERE e.label = '{}' AND e.src = $root AND {}",
            EdgeLabel::HasGraphVersion,
            filters.join(" AND ")
        ));
        query.add_edge_returns("e");
        query.add_return("v.value", "version");
        query.order_by("e.eid");
        query.execute(&self.db).await?;
        query
            .results()
            .iter()
            .map(|r| -> Result<(EdgeVersion, Option<String>)> {
                Ok((r.edge("e")?, r.get_str("version").map(str::to_string)))
            })
            .collect()
    }

    /// Recorded graph version, `None` on a graph that never recorded one
    pub async fn graph_version(&self) -> Result<Option<u32>> {
        let scope = self.default_scope().await?;
        let slot = self.version_slot(&scope).await?;
        match active_winner(slot.iter(), |(e, _)| e) {
            Some((_, Some(raw))) => raw
                .parse()
                .map(Some)
                .map_err(|_| GraphError::Internal(format!("invalid graph version '{}'", raw))),
            Some((_, None)) => Err(GraphError::internal("graph version vertex without value")),
            None => Ok(None),
        }
    }

    fn record_version(
        batch: &mut WriteBatch,
        slot: &[(EdgeVersion, Option<String>)],
        version: u32,
    ) -> Result<()> {
        let candidates: Vec<&EdgeVersion> = slot.iter().map(|(e, _)| e).collect();
        batch.supersede(&candidates)?;
        let vertex = batch.create_vertex(
            NewVertex::new(VertexLabel::GraphVersion).value(version.to_string()),
        )?;
        batch.create_edge(EdgeLabel::HasGraphVersion, ROOT_UUID, &vertex)
    }

    pub async fn set_graph_version(&self, version: u32) -> Result<()> {
        let scope = self.default_scope().await?;
        let slot = self.version_slot(&scope).await?;
        let mut batch = WriteBatch::new(&scope, Timestamp::now());
        Self::record_version(&mut batch, &slot, version)?;
        batch.commit(&self.db).await?;
        info!(version, "graph version recorded");
        Ok(())
    }

    async fn record_applied(&self, migration: &dyn Migration, run: &MigrationRun) -> Result<()> {
        let scope = self.default_scope().await?;
        let slot = self.version_slot(&scope).await?;
        let now = Timestamp::now();
        let entry = AppliedMigration {
            name: migration.name().to_string(),
            version: migration.version(),
            changes: run.result.changes,
            applied_at: now,
        };

        let mut batch = WriteBatch::new(&scope, now);
        let vertex = batch.create_vertex(
            NewVertex::new(VertexLabel::Migration)
                .name(migration.name())
                .props(serde_json::to_string(&entry)?),
        )?;
        batch.create_edge(EdgeLabel::AppliedMigration, ROOT_UUID, &vertex)?;
        Self::record_version(&mut batch, &slot, migration.version())?;
        batch.commit(&self.db).await?;
        Ok(())
    }

    /// Applied migrations in the order they ran
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>> {
        let scope = self.default_scope().await?;
        let mut query = Query::init("applied_migrations", &scope, None);
        let filters = query.temporal_filter(&["e"], FilterStyle::Grouped, "f")?;
        query.add_param("root", ROOT_UUID)?;
        query.add_to_query("FROM edges e JOIN vertices v ON v.uuid = e.dst");
        query.add_to_query(format!(
            "WHERE e.label = '{}' AND e.src = $root AND e.status = 'active' AND {}",
            EdgeLabel::AppliedMigration,
            filters.join(" AND ")
        ));
        query.add_return("v.props", "entry");
        query.order_by("e.eid");
        query.execute(&self.db).await?;
        query
            .results()
            .iter()
            .map(|r| -> Result<AppliedMigration> { Ok(serde_json::from_str(&r.text("entry")?)?) })
            .collect()
    }

    /// Migrations newer than the recorded graph version
    pub async fn list_pending(&self) -> Result<Vec<Arc<dyn Migration>>> {
        let current = self.graph_version().await?.unwrap_or(0);
        Ok(self.registry.pending(current))
    }

    /// Run one migration against `branch` (no version bookkeeping)
    pub async fn execute(&self, migration: &dyn Migration, branch: &str) -> Result<MigrationRun> {
        let ctx = self.context(branch).await?;
        execute_migration(migration, &ctx).await
    }

    pub async fn validate(&self, migration: &dyn Migration, branch: &str) -> Result<MigrationResult> {
        let ctx = self.context(branch).await?;
        migration.validate(&ctx).await
    }

    /// Run every pending migration in version order
    ///
    /// Returns the names of the migrations applied. The first failure stops
    /// the run with [`GraphError::Migration`] listing what was applied
    /// before it.
    pub async fn run_pending(&self) -> Result<Vec<String>> {
        let default_branch = self.branches.default_branch_name().to_string();
        let _guard = self
            .locks
            .acquire(&default_branch, Some(namespace::MIGRATION))
            .await;

        let mut current = self.graph_version().await?.unwrap_or(0);
        let already: BTreeSet<String> = self.applied().await?.into_iter().map(|a| a.name).collect();
        let mut applied = Vec::new();
        for migration in self.registry.pending(current) {
            if migration.minimum_version() > current {
                warn!(
                    migration = %migration.name(),
                    minimum_version = migration.minimum_version(),
                    graph_version = current,
                    "migration skipped, graph version too low"
                );
                continue;
            }
            if already.contains(migration.name()) {
                warn!(migration = %migration.name(), "migration already recorded, advancing version");
                self.set_graph_version(migration.version()).await?;
                current = migration.version();
                continue;
            }

            let run = self.execute(migration.as_ref(), &default_branch).await?;
            if run.state != MigrationState::Succeeded {
                return Err(run.into_error(applied));
            }
            self.record_applied(migration.as_ref(), &run).await?;
            info!(
                migration = %migration.name(),
                version = migration.version(),
                changes = run.result.changes,
                "migration applied"
            );
            current = migration.version();
            applied.push(migration.name().to_string());
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        minimum: u32,
    }

    #[async_trait]
    impl Migration for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn minimum_version(&self) -> u32 {
            self.minimum
        }

        async fn execute(&self, _ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
            Ok(MigrationResult::default())
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut run = MigrationRun::new("001_test");
        assert!(run.transition(MigrationState::Succeeded).is_err());
        run.transition(MigrationState::Running).unwrap();
        run.transition(MigrationState::Failed).unwrap();
        assert!(run.transition(MigrationState::Running).is_err());
        assert_eq!(run.state, MigrationState::Failed);
    }

    #[test]
    fn test_registry_orders_and_rejects_collisions() {
        let mut registry = MigrationRegistry::new();
        registry
            .register(Arc::new(Fixed { name: "002_b", minimum: 1 }))
            .unwrap();
        registry
            .register(Arc::new(Fixed { name: "001_a", minimum: 0 }))
            .unwrap();
        assert!(registry
            .register(Arc::new(Fixed { name: "002_dup", minimum: 1 }))
            .is_err());

        let pending: Vec<_> = registry.pending(0).iter().map(|m| m.name().to_string()).collect();
        assert_eq!(pending, vec!["001_a", "002_b"]);
        assert_eq!(registry.pending(1).len(), 1);
        assert_eq!(registry.latest_version(), 2);
    }

    #[test]
    fn test_builtin_versions() {
        let registry = MigrationRegistry::builtin().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.latest_version(), 2);
        assert!(registry.get(graph::EDGE_BRANCH_LEVEL_BACKFILL).is_some());
    }

    #[test]
    fn test_result_merge() {
        let mut result = MigrationResult::with_changes(2);
        result.merge(MigrationResult::failed("boom"));
        assert_eq!(result.changes, 2);
        assert!(!result.success());
    }
}
