//! Graph Store Port (Trait Interface)
//!
//! Port/Adapter pattern for backend flexibility:
//! - Development/tests: SQLite (zero-config, in-memory)
//! - Production: PostgreSQL (feature `postgres`)
//!
//! Both adapters store the property graph in two tables, `vertices` and
//! `edges`, and accept the same statement dialect: SQL with `$name`
//! placeholders bound from a [`Params`] map.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{GraphError, Result};

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGraphStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteGraphStore;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder regex is valid"));

/// Uuid of the vertex every node hangs off (`IS_PART_OF`)
pub const ROOT_UUID: &str = "root";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Layout labels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `vertices.label` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLabel {
    Root,
    Node,
    Attribute,
    AttributeValue,
    Relationship,
    SchemaNode,
    Branch,
    GraphVersion,
    Migration,
}

impl VertexLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            VertexLabel::Root => "Root",
            VertexLabel::Node => "Node",
            VertexLabel::Attribute => "Attribute",
            VertexLabel::AttributeValue => "AttributeValue",
            VertexLabel::Relationship => "Relationship",
            VertexLabel::SchemaNode => "SchemaNode",
            VertexLabel::Branch => "Branch",
            VertexLabel::GraphVersion => "GraphVersion",
            VertexLabel::Migration => "Migration",
        }
    }
}

impl fmt::Display for VertexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `edges.label` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    IsPartOf,
    HasAttribute,
    HasValue,
    IsRelated,
    HasSchema,
    HasGraphVersion,
    AppliedMigration,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeLabel::IsPartOf => "IS_PART_OF",
            EdgeLabel::HasAttribute => "HAS_ATTRIBUTE",
            EdgeLabel::HasValue => "HAS_VALUE",
            EdgeLabel::IsRelated => "IS_RELATED",
            EdgeLabel::HasSchema => "HAS_SCHEMA",
            EdgeLabel::HasGraphVersion => "HAS_GRAPH_VERSION",
            EdgeLabel::AppliedMigration => "APPLIED_MIGRATION",
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Values & Rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scalar exchanged with the store (bound parameter or returned column)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One returned row, columns in the order the statement declared them
pub type Row = Vec<Value>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters & Statements
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Named parameter map; names are stored without the leading `$`
///
/// Inserting a name twice is a programmer error and fails instead of
/// silently overwriting the first binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        if self.values.contains_key(&name) {
            return Err(GraphError::query(format!(
                "parameter '${}' is already bound",
                name
            )));
        }
        self.values.insert(name, value.into());
        Ok(())
    }

    /// Bind every entry of `other`; fails on the first shared name
    pub fn extend(&mut self, other: Params) -> Result<()> {
        for (name, value) in other.values {
            self.insert(name, value)?;
        }
        Ok(())
    }

    /// Bind `values` as `$<prefix>_0, $<prefix>_1, ...` and return the
    /// parenthesized placeholder list for an `IN` predicate. An empty list
    /// renders as `(NULL)`, which matches nothing.
    pub fn insert_list<I, V>(&mut self, prefix: &str, values: I) -> Result<String>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let mut placeholders = Vec::new();
        for (idx, value) in values.into_iter().enumerate() {
            let name = format!("{}_{}", prefix, idx);
            placeholders.push(format!("${}", name));
            self.insert(name, value)?;
        }
        if placeholders.is_empty() {
            return Ok("(NULL)".to_string());
        }
        Ok(format!("({})", placeholders.join(", ")))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Parameterized statement handed to a [`GraphStore`]
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Params,
    /// Output column names, in select order (empty for writes)
    pub columns: Vec<String>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Params::new(),
            columns: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.params.insert(name, value)?;
        Ok(self)
    }

    /// Distinct placeholder names referenced by the text
    pub fn placeholders(&self) -> BTreeSet<String> {
        PLACEHOLDER
            .captures_iter(&self.text)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Verify every placeholder is bound and every binding is used
    pub fn check(&self) -> Result<()> {
        let used = self.placeholders();
        let missing: Vec<_> = used.iter().filter(|n| !self.params.contains(n)).collect();
        if !missing.is_empty() {
            return Err(GraphError::query(format!(
                "unbound placeholders: {}",
                missing
                    .iter()
                    .map(|n| format!("${}", n))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let unused: Vec<_> = self
            .params
            .iter()
            .map(|(n, _)| n)
            .filter(|n| !used.contains(*n))
            .collect();
        if !unused.is_empty() {
            return Err(GraphError::query(format!(
                "parameters not referenced by the statement: {}",
                unused
                    .iter()
                    .map(|n| format!("${}", n))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }

    /// Rewrite `$name` placeholders to positional `$1..$N` (first-use order).
    /// Returns the new text and the values in bind order.
    pub fn to_positional(&self) -> Result<(String, Vec<Value>)> {
        let mut order: Vec<String> = Vec::new();
        let mut failed: Option<String> = None;
        let text = PLACEHOLDER.replace_all(&self.text, |caps: &regex::Captures| {
            let name = &caps[1];
            if !self.params.contains(name) && failed.is_none() {
                failed = Some(name.to_string());
            }
            let idx = match order.iter().position(|n| n == name) {
                Some(i) => i,
                None => {
                    order.push(name.to_string());
                    order.len() - 1
                }
            };
            format!("${}", idx + 1)
        });
        if let Some(name) = failed {
            return Err(GraphError::query(format!("unbound placeholder ${}", name)));
        }
        let values = order
            .iter()
            .filter_map(|n| self.params.get(n).cloned())
            .collect();
        Ok((text.into_owned(), values))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Graph Store Port
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Graph Store Port (Primary Interface)
///
/// All storage backends must implement this trait. Statements arrive
/// already validated by [`Statement::check`].
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Backend name for logging ("sqlite", "postgres", ...)
    fn backend(&self) -> &'static str;

    /// Create tables and indexes if they do not exist
    async fn initialize(&self) -> Result<()>;

    /// Run a read statement, returning rows in `stmt.columns` order
    async fn fetch(&self, stmt: &Statement) -> Result<Vec<Row>>;

    /// Run a single write statement, returning the affected row count
    async fn execute(&self, stmt: &Statement) -> Result<u64>;

    /// Run several write statements in one transaction (all or nothing)
    async fn execute_atomic(&self, stmts: &[Statement]) -> Result<u64>;

    /// Release pooled connections
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_reject_duplicates() {
        let mut params = Params::new();
        params.insert("branch0", "main").unwrap();
        let err = params.insert("branch0", "other").unwrap_err();
        assert!(err.to_string().contains("$branch0"));
        assert_eq!(params.get("branch0"), Some(&Value::from("main")));
    }

    #[test]
    fn test_insert_list() {
        let mut params = Params::new();
        let list = params.insert_list("ids", ["a", "b"]).unwrap();
        assert_eq!(list, "($ids_0, $ids_1)");
        assert_eq!(params.len(), 2);

        let empty = params.insert_list("none", Vec::<String>::new()).unwrap();
        assert_eq!(empty, "(NULL)");
    }

    #[test]
    fn test_check_detects_unbound_placeholder() {
        let stmt = Statement::new("SELECT 1 FROM edges WHERE branch = $branch AND from_ts <= $at")
            .bind("branch", "main")
            .unwrap();
        let err = stmt.check().unwrap_err();
        assert!(err.to_string().contains("$at"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_check_detects_unused_param() {
        let stmt = Statement::new("SELECT 1")
            .bind("ghost", 1i64)
            .unwrap();
        assert!(stmt.check().is_err());
    }

    #[test]
    fn test_to_positional_reuses_indexes() {
        let stmt = Statement::new("a = $x AND b = $y AND c = $x")
            .bind("x", 1i64)
            .unwrap()
            .bind("y", "two")
            .unwrap();
        let (text, values) = stmt.to_positional().unwrap();
        assert_eq!(text, "a = $1 AND b = $2 AND c = $1");
        assert_eq!(values, vec![Value::Int(1), Value::from("two")]);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Int(1).as_bool(), Some(true));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert!(Value::from(None::<String>).is_null());
        assert_eq!(Value::Float(2.0).as_i64(), Some(2));
    }
}
