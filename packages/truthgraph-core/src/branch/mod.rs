//! Branch registry
//!
//! Branches form a tree rooted at the default branch. Each branch records
//! the instant it diverged from its origin; before that instant its history
//! is the origin's history.
//!
//! Branch records are stored as `Branch` vertices. The registry keeps a
//! read-mostly snapshot of all of them and swaps it atomically on change.

pub mod filter;
pub mod merge;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{GraphError, Result};
use crate::query::{Database, NewVertex, WriteBatch};
use crate::store::{Params, Statement, VertexLabel};
use crate::timestamp::Timestamp;

use self::filter::{BranchTime, TimeBound};

static BRANCH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,249}$").expect("branch name regex is valid")
});

/// A named timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub origin_branch: Option<String>,
    pub branched_from: Timestamp,
    pub created_at: Timestamp,
    pub is_default: bool,
    /// Data-only branches share the default branch's schema
    pub is_data_only: bool,
    pub hierarchy_level: u32,
    pub description: Option<String>,
}

impl Branch {
    pub fn default_branch(name: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            name: name.into(),
            origin_branch: None,
            branched_from: created_at,
            created_at,
            is_default: true,
            is_data_only: false,
            hierarchy_level: 1,
            description: Some("Default branch".to_string()),
        }
    }

    pub fn validate_name(name: &str) -> Result<()> {
        let well_formed = BRANCH_NAME.is_match(name)
            && !name.contains("..")
            && !name.contains("//")
            && !name.ends_with('/')
            && !name.ends_with(".lock");
        if !well_formed {
            return Err(GraphError::validation(
                "name",
                format!("'{}' is not a valid branch name", name),
            ));
        }
        Ok(())
    }
}

/// Options for [`BranchRegistry::create`]
#[derive(Debug, Clone, Default)]
pub struct BranchCreate {
    /// Defaults to the default branch
    pub origin: Option<String>,
    /// Defaults to now
    pub branched_from: Option<Timestamp>,
    pub description: Option<String>,
    pub is_data_only: bool,
}

/// A branch with its resolved ancestry (self first, root last)
#[derive(Debug, Clone)]
pub struct BranchScope {
    chain: Arc<Vec<Arc<Branch>>>,
}

impl BranchScope {
    /// Build from an explicit chain; the first element is the scoped branch
    pub fn from_chain(chain: Vec<Arc<Branch>>) -> Result<Self> {
        if chain.is_empty() {
            return Err(GraphError::internal("branch scope requires at least one branch"));
        }
        Ok(Self {
            chain: Arc::new(chain),
        })
    }

    pub fn branch(&self) -> &Branch {
        &self.chain[0]
    }

    pub fn name(&self) -> &str {
        &self.chain[0].name
    }

    pub fn level(&self) -> u32 {
        self.chain[0].hierarchy_level
    }

    pub fn ancestry(&self) -> &[Arc<Branch>] {
        &self.chain
    }

    pub fn contains(&self, name: &str) -> bool {
        self.chain.iter().any(|b| b.name == name)
    }

    /// Visibility bound of every branch in the scope at time `at`
    pub fn branch_times(&self, at: Timestamp) -> Vec<BranchTime> {
        let mut times = Vec::with_capacity(self.chain.len());
        let mut bound = TimeBound::At(at);
        times.push(BranchTime {
            branch: self.chain[0].name.clone(),
            bound,
        });
        for pair in self.chain.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            bound = bound.clamp(child.branched_from);
            times.push(BranchTime {
                branch: parent.name.clone(),
                bound,
            });
        }
        times
    }
}

type BranchMap = HashMap<String, Arc<Branch>>;

/// Cache of all branches, backed by `Branch` vertices
pub struct BranchRegistry {
    db: Database,
    default_branch: String,
    cache: RwLock<Arc<BranchMap>>,
}

impl BranchRegistry {
    pub fn new(db: Database, default_branch: impl Into<String>) -> Self {
        Self {
            db,
            default_branch: default_branch.into(),
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub fn default_branch_name(&self) -> &str {
        &self.default_branch
    }

    fn snapshot(&self) -> Arc<BranchMap> {
        self.cache.read().clone()
    }

    fn cache_insert(&self, branch: Arc<Branch>) {
        let mut guard = self.cache.write();
        let mut next = (**guard).clone();
        next.insert(branch.name.clone(), branch);
        *guard = Arc::new(next);
    }

    /// Reload every branch record from the store
    pub async fn refresh(&self) -> Result<()> {
        let stmt = Statement::new(
            "SELECT name, props FROM vertices WHERE label = $label ORDER BY name",
        )
        .bind("label", VertexLabel::Branch.as_str())?
        .with_columns(["name", "props"]);
        let rows = self.db.fetch_paged(&stmt).await?;

        let mut branches = HashMap::with_capacity(rows.len());
        for row in rows {
            let props = row
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| GraphError::internal("branch vertex without props"))?;
            let branch: Branch = serde_json::from_str(props)?;
            branches.insert(branch.name.clone(), Arc::new(branch));
        }
        *self.cache.write() = Arc::new(branches);
        Ok(())
    }

    /// Lookup by name, reloading once on a cache miss
    pub async fn get(&self, name: &str) -> Result<Arc<Branch>> {
        if let Some(branch) = self.snapshot().get(name) {
            return Ok(branch.clone());
        }
        self.refresh().await?;
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::BranchNotFound(name.to_string()))
    }

    /// `None` resolves to the default branch
    pub async fn get_or_default(&self, name: Option<&str>) -> Result<Arc<Branch>> {
        self.get(name.unwrap_or(self.default_branch.as_str())).await
    }

    /// Branch plus its ancestry chain
    pub async fn scope(&self, name: &str) -> Result<BranchScope> {
        let mut chain = vec![self.get(name).await?];
        while let Some(origin) = chain.last().and_then(|b| b.origin_branch.clone()) {
            if chain.iter().any(|b| b.name == origin) {
                return Err(GraphError::Internal(format!(
                    "branch ancestry of '{}' contains a cycle at '{}'",
                    name, origin
                )));
            }
            chain.push(self.get(&origin).await?);
        }
        BranchScope::from_chain(chain)
    }

    /// All known branches, sorted by name
    pub fn list(&self) -> Vec<Arc<Branch>> {
        let mut branches: Vec<_> = self.snapshot().values().cloned().collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        branches
    }

    /// Direct children of `name`
    pub fn children(&self, name: &str) -> Vec<Arc<Branch>> {
        self.list()
            .into_iter()
            .filter(|b| b.origin_branch.as_deref() == Some(name))
            .collect()
    }

    async fn insert(&self, branch: Branch) -> Result<Arc<Branch>> {
        let mut batch = WriteBatch::for_branch(&branch, branch.created_at);
        batch.create_vertex(
            NewVertex::new(VertexLabel::Branch)
                .name(branch.name.clone())
                .props(serde_json::to_string(&branch)?),
        )?;
        batch.commit(&self.db).await?;

        let branch = Arc::new(branch);
        self.cache_insert(branch.clone());
        Ok(branch)
    }

    /// Create the default branch if the graph has none yet
    pub async fn ensure_default(&self) -> Result<Arc<Branch>> {
        match self.get(&self.default_branch).await {
            Ok(branch) => Ok(branch),
            Err(GraphError::BranchNotFound(_)) => {
                Branch::validate_name(&self.default_branch)?;
                let branch = Branch::default_branch(self.default_branch.clone(), Timestamp::now());
                info!(branch = %branch.name, "creating default branch");
                self.insert(branch).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create(&self, name: &str, options: BranchCreate) -> Result<Arc<Branch>> {
        Branch::validate_name(name)?;
        if self.get(name).await.is_ok() {
            return Err(GraphError::validation(
                "name",
                format!("branch '{}' already exists", name),
            ));
        }

        let origin_name = options.origin.unwrap_or_else(|| self.default_branch.clone());
        let origin = self.get(&origin_name).await?;

        let now = Timestamp::now();
        let branched_from = options.branched_from.unwrap_or(now);
        if branched_from < origin.branched_from {
            return Err(GraphError::validation(
                "branched_from",
                format!(
                    "{} precedes the divergence point of '{}' ({})",
                    branched_from, origin.name, origin.branched_from
                ),
            ));
        }
        if branched_from > now {
            return Err(GraphError::validation(
                "branched_from",
                format!("{} is in the future", branched_from),
            ));
        }

        let branch = Branch {
            name: name.to_string(),
            origin_branch: Some(origin.name.clone()),
            branched_from,
            created_at: now,
            is_default: false,
            is_data_only: options.is_data_only,
            hierarchy_level: origin.hierarchy_level + 1,
            description: options.description,
        };
        info!(
            branch = %branch.name,
            origin = %origin.name,
            branched_from = %branch.branched_from,
            "creating branch"
        );
        self.insert(branch).await
    }

    /// Move the divergence point of `name` to now
    ///
    /// Refused when other branches were created from `name`: their inherited
    /// history depends on the current divergence point.
    pub async fn rebase(&self, name: &str) -> Result<Arc<Branch>> {
        self.set_branched_from(name, Timestamp::now()).await
    }

    pub(crate) async fn set_branched_from(
        &self,
        name: &str,
        branched_from: Timestamp,
    ) -> Result<Arc<Branch>> {
        let branch = self.get(name).await?;
        if branch.is_default {
            return Err(GraphError::validation(
                "branch",
                format!("the default branch '{}' cannot be rebased", name),
            ));
        }
        let children = self.children(name);
        if !children.is_empty() {
            return Err(GraphError::Conflict(format!(
                "branch '{}' cannot be rebased, branches {} depend on its divergence point",
                name,
                children
                    .iter()
                    .map(|b| format!("'{}'", b.name))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut updated = (*branch).clone();
        updated.branched_from = branched_from;

        let mut params = Params::new();
        params.insert("props", serde_json::to_string(&updated)?)?;
        params.insert("label", VertexLabel::Branch.as_str())?;
        params.insert("name", name)?;
        self.db
            .execute(
                &Statement::new("UPDATE vertices SET props = $props WHERE label = $label AND name = $name")
                    .with_params(params),
            )
            .await?;
        info!(branch = %name, branched_from = %branched_from, "branch rebased");

        let updated = Arc::new(updated);
        self.cache_insert(updated.clone());
        Ok(updated)
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::store::SqliteGraphStore;

    async fn registry() -> BranchRegistry {
        let store = Arc::new(SqliteGraphStore::in_memory().unwrap());
        let db = Database::with_limits(store, 100, RetryPolicy::none());
        let registry = BranchRegistry::new(db, "main");
        registry.ensure_default().await.unwrap();
        registry
    }

    #[test]
    fn test_branch_name_validation() {
        assert!(Branch::validate_name("feature/login-1").is_ok());
        assert!(Branch::validate_name("v1.2").is_ok());
        assert!(Branch::validate_name("").is_err());
        assert!(Branch::validate_name("-bad").is_err());
        assert!(Branch::validate_name("a..b").is_err());
        assert!(Branch::validate_name("with space").is_err());
        assert!(Branch::validate_name("trailing/").is_err());
    }

    #[test]
    fn test_branch_times_clamp_each_ancestor() {
        let main = Arc::new(Branch::default_branch("main", Timestamp::from_micros(0)));
        let mut feature = Branch::default_branch("feature", Timestamp::from_micros(100));
        feature.is_default = false;
        feature.origin_branch = Some("main".into());
        feature.hierarchy_level = 2;
        let mut sub = feature.clone();
        sub.name = "sub".into();
        sub.origin_branch = Some("feature".into());
        sub.branched_from = Timestamp::from_micros(200);
        sub.hierarchy_level = 3;

        let scope = BranchScope::from_chain(vec![Arc::new(sub), Arc::new(feature), main]).unwrap();
        let times = scope.branch_times(Timestamp::from_micros(300));
        assert_eq!(times.len(), 3);
        assert_eq!(times[0].bound, TimeBound::At(Timestamp::from_micros(300)));
        assert_eq!(times[1].bound, TimeBound::Before(Timestamp::from_micros(200)));
        assert_eq!(times[2].bound, TimeBound::Before(Timestamp::from_micros(100)));

        let early = scope.branch_times(Timestamp::from_micros(50));
        assert!(early.iter().all(|t| t.bound == TimeBound::At(Timestamp::from_micros(50))));
    }

    #[test]
    fn test_empty_chain_has_no_scope() {
        assert!(BranchScope::from_chain(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_create_and_scope() {
        let registry = registry().await;
        let feature = registry.create("feature", BranchCreate::default()).await.unwrap();
        assert_eq!(feature.origin_branch.as_deref(), Some("main"));
        assert_eq!(feature.hierarchy_level, 2);

        let scope = registry.scope("feature").await.unwrap();
        let names: Vec<_> = scope.ancestry().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["feature", "main"]);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_branch() {
        let registry = registry().await;
        let err = registry.scope("nope").await.unwrap_err();
        assert!(matches!(err, GraphError::BranchNotFound(ref n) if n == "nope"));
        let err = registry
            .create(
                "child",
                BranchCreate {
                    origin: Some("nope".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::BranchNotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_branch_rejected() {
        let registry = registry().await;
        registry.create("feature", BranchCreate::default()).await.unwrap();
        let err = registry
            .create("feature", BranchCreate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_branched_from_cannot_precede_origin() {
        let registry = registry().await;
        let feature = registry.create("feature", BranchCreate::default()).await.unwrap();
        let err = registry
            .create(
                "sub",
                BranchCreate {
                    origin: Some("feature".into()),
                    branched_from: Some(feature.branched_from.add_micros(-1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Validation { ref field, .. } if field == "branched_from"));
    }

    #[tokio::test]
    async fn test_rebase_refused_with_children() {
        let registry = registry().await;
        let feature = registry.create("feature", BranchCreate::default()).await.unwrap();
        registry
            .create(
                "sub",
                BranchCreate {
                    origin: Some("feature".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = registry.rebase("feature").await.unwrap_err();
        assert!(matches!(err, GraphError::Conflict(_)));
        let unchanged = registry.get("feature").await.unwrap();
        assert_eq!(unchanged.branched_from, feature.branched_from);

        let rebased = registry.rebase("sub").await.unwrap();
        assert!(rebased.branched_from > feature.branched_from);
    }

    #[tokio::test]
    async fn test_refresh_reloads_from_store() {
        let registry = registry().await;
        registry.create("feature", BranchCreate::default()).await.unwrap();

        let other = BranchRegistry::new(registry.database().clone(), "main");
        assert!(other.list().is_empty());
        other.refresh().await.unwrap();
        assert_eq!(other.list().len(), 2);
        assert!(other.get("feature").await.is_ok());
    }
}
