/*
 * Truthgraph Core - branch-aware, time-travel graph data model
 *
 * Every read and write is scoped to a branch and an as-of timestamp.
 * Edges carry validity intervals and are never deleted; schema changes
 * are versioned in the graph and rewrite existing data through
 * replayable migrations.
 *
 * Architecture:
 * - Graph store port (SQLite default, PostgreSQL optional)
 * - Branch registry + temporal filter builder
 * - Query builder / executor (paging, retry)
 * - Schema model, diff and per-branch persistence
 * - Node manager + typed mutations
 * - Migration framework (graph and schema migrations)
 * - Named async lock registry
 */

// Public modules
pub mod account;
pub mod branch;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod logging;
pub mod migrations;
pub mod mutation;
pub mod node;
pub mod query;
pub mod schema;
pub mod store;
pub mod timestamp;

// Re-exports
pub use account::{get_account, get_account_by_id, validate_token, TokenValidation};
pub use branch::filter::{EdgeStatus, EdgeVersion, FilterStyle, TemporalFilter, TimeBound};
pub use branch::merge::MergeReport;
pub use branch::{Branch, BranchCreate, BranchRegistry, BranchScope};
pub use config::{ConfigError, DatabaseBackend, DatabaseSettings, LockSettings, LoggingSettings, RetryPolicy, Settings};
pub use context::{connect, GraphContext};
pub use error::{ErrorCategory, ErrorKind, GraphError, Result};
pub use lock::{namespace, LockGuard, LockRegistry};
pub use logging::init_tracing;
pub use migrations::{
    CompositeMigration, Migration, MigrationContext, MigrationRegistry, MigrationResult,
    MigrationRun, MigrationRunner, MigrationState,
};
pub use mutation::{MutationAction, MutationOutcome, NodeMutation, RelationshipAction, RelationshipMutation};
pub use node::{missing_ids, Attribute, Node, NodeFilter, NodeManager, RelationshipManager};
pub use query::{count_edges, count_vertices, Database, NewVertex, Query, QueryResult, WriteBatch};
pub use schema::{
    AttributeKind, AttributeSchema, Cardinality, NodeSchema, RelationshipSchema, SchemaBranch,
    SchemaChange, SchemaDiff, SchemaManager, SchemaPath, SchemaPathType, SchemaUpdate,
};
pub use store::{EdgeLabel, GraphStore, Params, Row, Statement, Value, VertexLabel, ROOT_UUID};
#[cfg(feature = "postgres")]
pub use store::PostgresGraphStore;
#[cfg(feature = "sqlite")]
pub use store::SqliteGraphStore;
pub use timestamp::Timestamp;
