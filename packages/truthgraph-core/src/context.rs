//! Graph context: settings, store handle, caches and locks for one process
//!
//! Everything that used to be process-global (settings, the branch
//! registry, schema cache, lock registry) hangs off a [`GraphContext`]
//! built once with [`GraphContext::init`] and passed by reference.

use std::sync::Arc;
use tracing::info;

use crate::branch::merge::MergeReport;
use crate::branch::{Branch, BranchCreate, BranchRegistry};
use crate::config::{DatabaseBackend, DatabaseSettings, Settings};
use crate::error::{GraphError, Result};
use crate::lock::{namespace, LockRegistry};
use crate::migrations::{
    execute_migration, Migration, MigrationRegistry, MigrationRunner, MigrationState,
};
use crate::node::NodeManager;
use crate::query::{count_vertices, Database, NewVertex, WriteBatch};
use crate::schema::{SchemaBranch, SchemaManager, SchemaUpdate};
use crate::store::{GraphStore, Statement, VertexLabel, ROOT_UUID};
use crate::timestamp::Timestamp;

/// Open the store configured in `settings`
pub async fn connect(settings: &DatabaseSettings) -> Result<Arc<dyn GraphStore>> {
    match settings.backend {
        #[cfg(feature = "sqlite")]
        DatabaseBackend::Sqlite => {
            let store = match &settings.path {
                Some(path) => crate::store::SqliteGraphStore::new(path)?,
                None => crate::store::SqliteGraphStore::in_memory()?,
            };
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        DatabaseBackend::Postgres => {
            let url = settings
                .url
                .as_deref()
                .ok_or_else(|| GraphError::validation("database.url", "postgres backend needs a url"))?;
            Ok(Arc::new(crate::store::PostgresGraphStore::new(url).await?))
        }
        #[allow(unreachable_patterns)]
        other => Err(GraphError::NotSupported(format!(
            "the {} backend is not compiled in",
            other.as_str()
        ))),
    }
}

pub struct GraphContext {
    settings: Settings,
    db: Database,
    branches: Arc<BranchRegistry>,
    schema: Arc<SchemaManager>,
    nodes: NodeManager,
    locks: Arc<LockRegistry>,
    migrations: MigrationRunner,
}

impl GraphContext {
    /// Connect to the configured store and initialize it
    pub async fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let store = connect(&settings.database).await?;
        Self::init(settings, store).await
    }

    /// Initialize `store` and build the context around it
    ///
    /// Creates tables, the root vertex and the default branch when missing.
    /// A graph that never recorded a version and holds no nodes starts at
    /// the latest graph version.
    pub async fn init(settings: Settings, store: Arc<dyn GraphStore>) -> Result<Self> {
        settings.validate()?;
        store.initialize().await?;

        let db = Database::new(store, &settings.database);
        let branches = Arc::new(BranchRegistry::new(
            db.clone(),
            settings.main.default_branch.clone(),
        ));
        let default_branch = branches.ensure_default().await?;
        ensure_root(&db, &default_branch).await?;

        let schema = Arc::new(SchemaManager::new(db.clone(), branches.clone()));
        let nodes = NodeManager::new(db.clone(), branches.clone(), schema.clone());
        let locks = Arc::new(LockRegistry::new(&settings.lock));
        let migrations = MigrationRunner::new(
            db.clone(),
            branches.clone(),
            schema.clone(),
            locks.clone(),
            MigrationRegistry::builtin()?,
        );

        if migrations.graph_version().await?.is_none() {
            let fresh = count_vertices(&db, Some(VertexLabel::Node)).await? == 0;
            let version = if fresh {
                migrations.registry().latest_version()
            } else {
                0
            };
            migrations.set_graph_version(version).await?;
        }

        info!(
            backend = db.store().backend(),
            default_branch = %default_branch.name,
            "graph context ready"
        );
        Ok(Self {
            settings,
            db,
            branches,
            schema,
            nodes,
            locks,
            migrations,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn branches(&self) -> &Arc<BranchRegistry> {
        &self.branches
    }

    pub fn schema(&self) -> &Arc<SchemaManager> {
        &self.schema
    }

    pub fn nodes(&self) -> &NodeManager {
        &self.nodes
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn migrations(&self) -> &MigrationRunner {
        &self.migrations
    }

    pub fn default_branch(&self) -> &str {
        self.branches.default_branch_name()
    }

    /// Replace the schema of `branch` and migrate its data
    ///
    /// The derived migration is validated against the stored data first;
    /// when validation fails nothing is written and [`GraphError::Migration`]
    /// lists the problems. A failure while rewriting data leaves the schema
    /// change recorded.
    pub async fn apply_schema(&self, branch: &str, next: SchemaBranch) -> Result<SchemaUpdate> {
        let _guard = self.locks.acquire(branch, Some(namespace::MIGRATION)).await;
        let plan = self.schema.plan(branch, next).await?;
        let planned = plan.migration();
        if !planned.is_empty() {
            let ctx = self.migrations.context(branch).await?;
            let checked = planned.validate(&ctx).await?;
            if !checked.success() {
                return Err(GraphError::Migration {
                    name: planned.name().to_string(),
                    errors: checked.errors,
                    applied: Vec::new(),
                });
            }
        }

        let update = self.schema.update(branch, plan.next.as_ref().clone()).await?;
        let migration = update.migration();
        if migration.is_empty() {
            return Ok(update);
        }
        let ctx = self.migrations.context(branch).await?;
        let run = execute_migration(&migration, &ctx).await?;
        if run.state != MigrationState::Succeeded {
            return Err(run.into_error(Vec::new()));
        }
        info!(
            branch = %branch,
            migrations = migration.len(),
            changes = run.result.changes,
            "schema data migrated"
        );
        Ok(update)
    }

    /// Run every pending graph migration
    pub async fn run_migrations(&self) -> Result<Vec<String>> {
        self.migrations.run_pending().await
    }

    pub async fn create_branch(&self, name: &str, options: BranchCreate) -> Result<Arc<Branch>> {
        self.branches.create(name, options).await
    }

    /// Merge `source` into its origin
    pub async fn merge_branch(&self, source: &str) -> Result<MergeReport> {
        let _guard = self.locks.acquire(source, Some(namespace::BRANCH)).await;
        let report = self.branches.merge(source).await?;
        self.schema.invalidate(None);
        Ok(report)
    }

    pub async fn rebase_branch(&self, name: &str) -> Result<Arc<Branch>> {
        let _guard = self.locks.acquire(name, Some(namespace::BRANCH)).await;
        let branch = self.branches.rebase(name).await?;
        self.schema.invalidate(Some(name));
        Ok(branch)
    }

    /// Release store connections
    pub async fn shutdown(self) -> Result<()> {
        self.db.store().close().await?;
        info!("graph context closed");
        Ok(())
    }
}

async fn ensure_root(db: &Database, default_branch: &Branch) -> Result<()> {
    let existing = db
        .fetch(
            &Statement::new("SELECT uuid FROM vertices WHERE uuid = $uuid")
                .bind("uuid", ROOT_UUID)?
                .with_columns(["uuid"]),
        )
        .await?;
    if !existing.is_empty() {
        return Ok(());
    }
    let mut batch = WriteBatch::for_branch(default_branch, Timestamp::now());
    batch.create_vertex(NewVertex::with_uuid(VertexLabel::Root, ROOT_UUID))?;
    batch.commit(db).await?;
    Ok(())
}
