//! Query builder and executor
//!
//! A [`Query`] is composed from clause fragments, return labels, temporal
//! filter groups and a collision-checked parameter map, then executed once
//! against a [`Database`]. The database pages large result sets and retries
//! transient store failures.
//!
//! Writes are collected in a [`WriteBatch`] and committed in a single
//! transaction.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::branch::filter::{latest_by, EdgeStatus, EdgeVersion, FilterStyle, TemporalFilter};
use crate::branch::{Branch, BranchScope};
use crate::config::{DatabaseSettings, RetryPolicy};
use crate::error::{GraphError, Result};
use crate::store::{EdgeLabel, GraphStore, Params, Row, Statement, Value, VertexLabel};
use crate::timestamp::Timestamp;

// ═══════════════════════════════════════════════════════════════════════════
// Database (executor)
// ═══════════════════════════════════════════════════════════════════════════

/// Store handle with paging and retry policy
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn GraphStore>,
    imposed_query_limit: usize,
    retry: RetryPolicy,
}

impl Database {
    pub fn new(store: Arc<dyn GraphStore>, settings: &DatabaseSettings) -> Self {
        Self::with_limits(store, settings.imposed_query_limit, settings.retry.clone())
    }

    pub fn with_limits(
        store: Arc<dyn GraphStore>,
        imposed_query_limit: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            imposed_query_limit: imposed_query_limit.max(1),
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn imposed_query_limit(&self) -> usize {
        self.imposed_query_limit
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "graph store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Single round trip, no paging
    pub async fn fetch(&self, stmt: &Statement) -> Result<Vec<Row>> {
        stmt.check()?;
        self.with_retry("fetch", || self.store.fetch(stmt)).await
    }

    /// Fetch every row, `imposed_query_limit` rows per round trip
    ///
    /// The statement must carry an `ORDER BY` so pages are stable.
    pub async fn fetch_paged(&self, stmt: &Statement) -> Result<Vec<Row>> {
        stmt.check()?;
        if !stmt.text.to_ascii_uppercase().contains("ORDER BY") {
            return Err(GraphError::query("paged statements require an ORDER BY clause"));
        }

        let limit = self.imposed_query_limit;
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut params = stmt.params.clone();
            params.insert("__limit", limit as i64)?;
            params.insert("__offset", offset as i64)?;
            let page_stmt = Statement {
                text: format!("{}\nLIMIT $__limit OFFSET $__offset", stmt.text),
                params,
                columns: stmt.columns.clone(),
            };
            let page = self
                .with_retry("fetch_page", || self.store.fetch(&page_stmt))
                .await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < limit {
                break;
            }
            offset += limit;
            debug!(offset, "fetching next page");
        }
        Ok(rows)
    }

    pub async fn execute(&self, stmt: &Statement) -> Result<u64> {
        stmt.check()?;
        self.with_retry("execute", || self.store.execute(stmt)).await
    }

    /// All statements in one transaction
    pub async fn execute_atomic(&self, stmts: &[Statement]) -> Result<u64> {
        for stmt in stmts {
            stmt.check()?;
        }
        self.with_retry("execute_atomic", || self.store.execute_atomic(stmts))
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Query builder
// ═══════════════════════════════════════════════════════════════════════════

/// One result row addressable by return label
#[derive(Debug, Clone)]
pub struct QueryResult {
    labels: Arc<Vec<String>>,
    row: Row,
}

impl QueryResult {
    pub fn new(labels: Arc<Vec<String>>, row: Row) -> Self {
        Self { labels, row }
    }

    fn index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.index(label).and_then(|idx| self.row.get(idx))
    }

    pub fn get_str(&self, label: &str) -> Option<&str> {
        self.get(label).and_then(Value::as_str)
    }

    pub fn get_i64(&self, label: &str) -> Option<i64> {
        self.get(label).and_then(Value::as_i64)
    }

    /// Required text column; absence means the query and the caller disagree
    pub fn text(&self, label: &str) -> Result<String> {
        self.get_str(label).map(str::to_string).ok_or_else(|| {
            GraphError::Internal(format!("result column '{}' is missing or not text", label))
        })
    }

    /// Edge registered with [`Query::add_edge_returns`] under `alias`
    pub fn edge(&self, alias: &str) -> Result<EdgeVersion> {
        let first = format!("{}_{}", alias, EdgeVersion::COLUMNS[0]);
        let idx = self.index(&first).ok_or_else(|| {
            GraphError::Internal(format!("edge '{}' was not returned by the query", alias))
        })?;
        EdgeVersion::from_row(&self.row, idx)
    }
}

/// Parameterized query over the branch-aware graph
///
/// # Example
/// ```rust,ignore
/// let mut query = Query::init("node_ids", &scope, None);
/// query.add_to_query("FROM vertices n JOIN edges r ON r.src = n.uuid");
/// let filters = query.temporal_filter(&["r"], FilterStyle::Grouped, "f")?;
/// query.add_to_query(format!("WHERE r.label = 'IS_PART_OF' AND {}", filters.join(" AND ")));
/// query.add_return("n.uuid", "uuid");
/// query.order_by("n.uuid");
/// query.execute(&db).await?;
/// ```
#[derive(Debug)]
pub struct Query {
    name: String,
    scope: BranchScope,
    at: Timestamp,
    clauses: Vec<String>,
    returns: Vec<(String, String)>,
    order: Vec<String>,
    params: Params,
    filter_prefixes: BTreeSet<String>,
    distinct: bool,
    results: Option<Vec<QueryResult>>,
}

impl Query {
    /// `at = None` pins the query to the current time
    pub fn init(name: impl Into<String>, scope: &BranchScope, at: Option<Timestamp>) -> Self {
        Self {
            name: name.into(),
            scope: scope.clone(),
            at: Timestamp::resolve(at),
            clauses: Vec::new(),
            returns: Vec::new(),
            order: Vec::new(),
            params: Params::new(),
            filter_prefixes: BTreeSet::new(),
            distinct: false,
            results: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn at(&self) -> Timestamp {
        self.at
    }

    pub fn scope(&self) -> &BranchScope {
        &self.scope
    }

    pub fn add_to_query(&mut self, fragment: impl Into<String>) {
        self.clauses.push(fragment.into());
    }

    pub fn add_return(&mut self, expr: impl Into<String>, label: impl Into<String>) {
        self.returns.push((expr.into(), label.into()));
    }

    /// Return every column of edge alias `alias` as `<alias>_<column>`
    pub fn add_edge_returns(&mut self, alias: &str) {
        for column in EdgeVersion::COLUMNS {
            self.add_return(format!("{}.{}", alias, column), format!("{}_{}", alias, column));
        }
    }

    pub fn distinct(&mut self) {
        self.distinct = true;
    }

    pub fn order_by(&mut self, expr: impl Into<String>) {
        self.order.push(expr.into());
    }

    pub fn add_param(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.params.insert(name, value)
    }

    pub fn add_list_param<I, V>(&mut self, prefix: &str, values: I) -> Result<String>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.params.insert_list(prefix, values)
    }

    /// Register a filter group for `aliases` and return one fragment per alias
    ///
    /// Each group needs its own `prefix`; reusing one within a query fails.
    pub fn temporal_filter(
        &mut self,
        aliases: &[&str],
        style: FilterStyle,
        prefix: &str,
    ) -> Result<Vec<String>> {
        if !self.filter_prefixes.insert(prefix.to_string()) {
            return Err(GraphError::query(format!(
                "query '{}' already has a filter group with prefix '{}'",
                self.name, prefix
            )));
        }
        let filter = TemporalFilter::new(prefix, self.scope.branch_times(self.at))?;
        self.params.extend(filter.params()?)?;
        Ok(filter.render(aliases, style))
    }

    pub fn return_labels(&self) -> Vec<String> {
        self.returns.iter().map(|(_, label)| label.clone()).collect()
    }

    /// Final statement text and parameters (without paging)
    pub fn get_query(&self) -> Result<Statement> {
        if self.returns.is_empty() {
            return Err(GraphError::query(format!(
                "query '{}' has no return labels",
                self.name
            )));
        }
        let select = self
            .returns
            .iter()
            .map(|(expr, label)| format!("{} AS {}", expr, label))
            .collect::<Vec<_>>()
            .join(", ");
        let mut text = format!(
            "SELECT {}{}\n{}",
            if self.distinct { "DISTINCT " } else { "" },
            select,
            self.clauses.join("\n")
        );
        if !self.order.is_empty() {
            text.push_str("\nORDER BY ");
            text.push_str(&self.order.join(", "));
        }
        let stmt = Statement {
            text,
            params: self.params.clone(),
            columns: self.return_labels(),
        };
        stmt.check()?;
        Ok(stmt)
    }

    /// Run the query; a query instance executes at most once
    pub async fn execute(&mut self, db: &Database) -> Result<()> {
        if self.results.is_some() {
            return Err(GraphError::AlreadyExecuted(self.name.clone()));
        }
        let stmt = self.get_query()?;
        let rows = if self.order.is_empty() {
            db.fetch(&stmt).await?
        } else {
            db.fetch_paged(&stmt).await?
        };
        debug!(query = %self.name, branch = %self.scope.name(), rows = rows.len(), "query executed");

        let labels = Arc::new(stmt.columns);
        self.results = Some(
            rows.into_iter()
                .map(|row| QueryResult::new(labels.clone(), row))
                .collect(),
        );
        Ok(())
    }

    pub fn has_executed(&self) -> bool {
        self.results.is_some()
    }

    pub fn num_of_results(&self) -> usize {
        self.results.as_ref().map_or(0, Vec::len)
    }

    pub fn results(&self) -> &[QueryResult] {
        self.results.as_deref().unwrap_or(&[])
    }

    pub fn get_result(&self) -> Option<&QueryResult> {
        self.results().first()
    }

    pub fn into_results(self) -> Vec<QueryResult> {
        self.results.unwrap_or_default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Writes
// ═══════════════════════════════════════════════════════════════════════════

/// Vertex to insert
#[derive(Debug, Clone)]
pub struct NewVertex {
    pub uuid: String,
    pub label: VertexLabel,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub value: Option<String>,
    pub props: Option<String>,
}

impl NewVertex {
    /// Fresh vertex with a random uuid
    pub fn new(label: VertexLabel) -> Self {
        Self::with_uuid(label, Uuid::new_v4().to_string())
    }

    pub fn with_uuid(label: VertexLabel, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            label,
            kind: None,
            name: None,
            value: None,
            props: None,
        }
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn props(mut self, props: impl Into<String>) -> Self {
        self.props = Some(props.into());
        self
    }
}

/// Edge and vertex writes stamped with one branch and one time
#[derive(Debug)]
pub struct WriteBatch {
    branch: String,
    level: i64,
    at: Timestamp,
    statements: Vec<Statement>,
}

impl WriteBatch {
    pub fn new(scope: &BranchScope, at: Timestamp) -> Self {
        Self::for_branch(scope.branch(), at)
    }

    pub fn for_branch(branch: &Branch, at: Timestamp) -> Self {
        Self {
            branch: branch.name.clone(),
            level: branch.hierarchy_level as i64,
            at,
            statements: Vec::new(),
        }
    }

    pub fn at(&self) -> Timestamp {
        self.at
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn push(&mut self, stmt: Statement) {
        self.statements.push(stmt);
    }

    pub fn create_vertex(&mut self, vertex: NewVertex) -> Result<String> {
        let mut params = Params::new();
        params.insert("uuid", vertex.uuid.as_str())?;
        params.insert("label", vertex.label.as_str())?;
        params.insert("kind", vertex.kind)?;
        params.insert("name", vertex.name)?;
        params.insert("value", vertex.value)?;
        params.insert("props", vertex.props)?;
        params.insert("created_at", self.at.as_micros())?;
        self.push(
            Statement::new(
                "INSERT INTO vertices (uuid, label, kind, name, value, props, created_at) \
                 VALUES ($uuid, $label, $kind, $name, $value, $props, $created_at)",
            )
            .with_params(params),
        );
        Ok(vertex.uuid)
    }

    pub fn create_edge(&mut self, label: EdgeLabel, src: &str, dst: &str) -> Result<()> {
        self.create_edge_with_status(label, src, dst, EdgeStatus::Active)
    }

    pub fn create_edge_with_status(
        &mut self,
        label: EdgeLabel,
        src: &str,
        dst: &str,
        status: EdgeStatus,
    ) -> Result<()> {
        let mut params = Params::new();
        params.insert("label", label.as_str())?;
        params.insert("src", src)?;
        params.insert("dst", dst)?;
        params.insert("branch", self.branch.as_str())?;
        params.insert("level", self.level)?;
        params.insert("status", status.as_str())?;
        params.insert("from_ts", self.at.as_micros())?;
        self.push(
            Statement::new(
                "INSERT INTO edges (label, src, dst, branch, branch_level, status, from_ts) \
                 VALUES ($label, $src, $dst, $branch, $level, $status, $from_ts)",
            )
            .with_params(params),
        );
        Ok(())
    }

    /// Set `to` on an open edge
    pub fn close_edge(&mut self, eid: i64) -> Result<()> {
        let mut params = Params::new();
        params.insert("to_ts", self.at.as_micros())?;
        params.insert("eid", eid)?;
        self.push(
            Statement::new("UPDATE edges SET to_ts = $to_ts WHERE eid = $eid AND to_ts IS NULL")
                .with_params(params),
        );
        Ok(())
    }

    /// Empty one slot given every admitted version of it
    ///
    /// Open edges on this branch are closed; an active version inherited from
    /// another branch is masked with a `deleted` edge. Returns `false` when
    /// the slot was already empty.
    pub fn retire(
        &mut self,
        label: EdgeLabel,
        src: &str,
        dst: &str,
        candidates: &[&EdgeVersion],
    ) -> Result<bool> {
        match latest_by(candidates.iter().copied(), |e| *e) {
            Some(winner) if winner.is_active() => {}
            _ => return Ok(false),
        }
        let mut inherited_active = false;
        for edge in candidates {
            if edge.branch == self.branch {
                if edge.to.is_none() {
                    self.close_edge(edge.eid)?;
                }
            } else if edge.is_active() {
                inherited_active = true;
            }
        }
        if inherited_active {
            self.create_edge_with_status(label, src, dst, EdgeStatus::Deleted)?;
        }
        Ok(true)
    }

    /// Close this branch's open versions of a slot before a new version is added
    pub fn supersede(&mut self, candidates: &[&EdgeVersion]) -> Result<()> {
        for edge in candidates {
            if edge.branch == self.branch && edge.to.is_none() {
                self.close_edge(edge.eid)?;
            }
        }
        Ok(())
    }

    pub async fn commit(self, db: &Database) -> Result<u64> {
        if self.statements.is_empty() {
            return Ok(0);
        }
        let affected = db.execute_atomic(&self.statements).await?;
        debug!(branch = %self.branch, statements = self.statements.len(), affected, "write batch committed");
        Ok(affected)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Utilities
// ═══════════════════════════════════════════════════════════════════════════

/// Number of vertices, optionally restricted to one label
pub async fn count_vertices(db: &Database, label: Option<VertexLabel>) -> Result<i64> {
    let stmt = match label {
        Some(label) => Statement::new("SELECT COUNT(*) AS n FROM vertices WHERE label = $label")
            .bind("label", label.as_str())?,
        None => Statement::new("SELECT COUNT(*) AS n FROM vertices"),
    }
    .with_columns(["n"]);
    let rows = db.fetch(&stmt).await?;
    Ok(rows
        .first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

/// Number of edge rows (every version counts)
pub async fn count_edges(db: &Database) -> Result<i64> {
    let rows = db
        .fetch(&Statement::new("SELECT COUNT(*) AS n FROM edges").with_columns(["n"]))
        .await?;
    Ok(rows
        .first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .unwrap_or(0))
}
