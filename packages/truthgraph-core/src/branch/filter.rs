//! Temporal filter construction and edge-version resolution
//!
//! Every traversal restricts edges to the ones visible from a branch at an
//! as-of time. The branch contributes its own edges valid at `at`; each
//! ancestor contributes only the edges that were valid strictly before the
//! point where its child diverged.
//!
//! Filtering admits every candidate version of a slot. Which version wins is
//! decided afterwards by [`latest_by`]: highest branch level, then latest
//! `from`, then highest edge id. A winning `deleted` edge hides the slot.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{GraphError, Result};
use crate::store::{Params, Row, Value};
use crate::timestamp::Timestamp;

/// Validity test applied to one branch's edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    /// `from <= t AND (to IS NULL OR to > t)`
    At(Timestamp),
    /// Valid at the last instant before `t`: `from < t AND (to IS NULL OR to >= t)`
    Before(Timestamp),
}

impl TimeBound {
    pub fn time(&self) -> Timestamp {
        match self {
            TimeBound::At(t) | TimeBound::Before(t) => *t,
        }
    }

    /// The bound an ancestor inherits when its child diverged at `divergence`
    pub fn clamp(self, divergence: Timestamp) -> Self {
        match self {
            TimeBound::At(t) if t < divergence => TimeBound::At(t),
            TimeBound::At(_) => TimeBound::Before(divergence),
            TimeBound::Before(t) => TimeBound::Before(t.min(divergence)),
        }
    }

    /// In-memory evaluation of the same predicate the SQL clause encodes
    pub fn admits(&self, from: Timestamp, to: Option<Timestamp>) -> bool {
        match *self {
            TimeBound::At(t) => from <= t && to.map_or(true, |to| to > t),
            TimeBound::Before(t) => from < t && to.map_or(true, |to| to >= t),
        }
    }
}

/// One member of a branch scope with the bound its edges are held to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchTime {
    pub branch: String,
    pub bound: TimeBound,
}

/// How a filter fragment is meant to be combined with its surroundings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterStyle {
    /// Each alias fragment wrapped in parentheses, safe to AND with anything
    #[default]
    Grouped,
    /// Bare disjunction; the caller supplies the grouping
    Standalone,
}

/// Filter group for one set of edge aliases
///
/// Parameters are named `$<prefix>_branchN` / `$<prefix>_timeN`, so several
/// groups with distinct prefixes can live in one statement.
#[derive(Debug, Clone)]
pub struct TemporalFilter {
    prefix: String,
    times: Vec<BranchTime>,
}

impl TemporalFilter {
    pub fn new(prefix: impl Into<String>, times: Vec<BranchTime>) -> Result<Self> {
        let prefix = prefix.into();
        let valid = !prefix.is_empty()
            && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !prefix.starts_with(|c: char| c.is_ascii_digit());
        if !valid {
            return Err(GraphError::query(format!(
                "invalid filter prefix '{}'",
                prefix
            )));
        }
        if times.is_empty() {
            return Err(GraphError::query("temporal filter needs at least one branch"));
        }
        Ok(Self { prefix, times })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn times(&self) -> &[BranchTime] {
        &self.times
    }

    pub fn params(&self) -> Result<Params> {
        let mut params = Params::new();
        for (idx, bt) in self.times.iter().enumerate() {
            params.insert(format!("{}_branch{}", self.prefix, idx), bt.branch.as_str())?;
            params.insert(
                format!("{}_time{}", self.prefix, idx),
                bt.bound.time().as_micros(),
            )?;
        }
        Ok(params)
    }

    /// Disjunction over the scope's branches for a single edge alias
    pub fn clause(&self, alias: &str) -> String {
        self.times
            .iter()
            .enumerate()
            .map(|(idx, bt)| {
                let branch = format!("${}_branch{}", self.prefix, idx);
                let time = format!("${}_time{}", self.prefix, idx);
                match bt.bound {
                    TimeBound::At(_) => format!(
                        "({a}.branch = {b} AND {a}.from_ts <= {t} AND ({a}.to_ts IS NULL OR {a}.to_ts > {t}))",
                        a = alias,
                        b = branch,
                        t = time
                    ),
                    TimeBound::Before(_) => format!(
                        "({a}.branch = {b} AND {a}.from_ts < {t} AND ({a}.to_ts IS NULL OR {a}.to_ts >= {t}))",
                        a = alias,
                        b = branch,
                        t = time
                    ),
                }
            })
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    /// One fragment per alias, to be AND'ed by the caller
    pub fn render(&self, aliases: &[&str], style: FilterStyle) -> Vec<String> {
        aliases
            .iter()
            .map(|alias| {
                let clause = self.clause(alias);
                match style {
                    FilterStyle::Grouped => format!("({})", clause),
                    FilterStyle::Standalone => clause,
                }
            })
            .collect()
    }

    /// Whether an edge with these attributes passes the filter
    pub fn admits(&self, branch: &str, from: Timestamp, to: Option<Timestamp>) -> bool {
        self.times
            .iter()
            .any(|bt| bt.branch == branch && bt.bound.admits(from, to))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Edge versions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Active,
    Deleted,
}

impl EdgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeStatus::Active => "active",
            EdgeStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "active" => Ok(EdgeStatus::Active),
            "deleted" => Ok(EdgeStatus::Deleted),
            other => Err(GraphError::Internal(format!("unknown edge status '{}'", other))),
        }
    }
}

impl fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored edge row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeVersion {
    pub eid: i64,
    pub label: String,
    pub src: String,
    pub dst: String,
    pub branch: String,
    pub branch_level: i64,
    pub status: EdgeStatus,
    pub from: Timestamp,
    pub to: Option<Timestamp>,
}

impl EdgeVersion {
    /// Column suffixes emitted for an edge alias, in order
    pub const COLUMNS: [&'static str; 9] = [
        "eid",
        "label",
        "src",
        "dst",
        "branch",
        "branch_level",
        "status",
        "from_ts",
        "to_ts",
    ];

    pub fn is_active(&self) -> bool {
        self.status == EdgeStatus::Active
    }

    fn rank(&self) -> (i64, Timestamp, i64) {
        (self.branch_level, self.from, self.eid)
    }

    /// Decode from consecutive values laid out as [`Self::COLUMNS`]
    pub fn from_values(values: &[Value]) -> Result<Self> {
        if values.len() < Self::COLUMNS.len() {
            return Err(GraphError::internal("edge row is missing columns"));
        }
        let int = |idx: usize| {
            values[idx].as_i64().ok_or_else(|| {
                GraphError::Internal(format!("edge column {} is not an integer", Self::COLUMNS[idx]))
            })
        };
        let text = |idx: usize| {
            values[idx].as_str().map(str::to_string).ok_or_else(|| {
                GraphError::Internal(format!("edge column {} is not text", Self::COLUMNS[idx]))
            })
        };
        Ok(Self {
            eid: int(0)?,
            label: text(1)?,
            src: text(2)?,
            dst: text(3)?,
            branch: text(4)?,
            branch_level: int(5)?,
            status: EdgeStatus::parse(&text(6)?)?,
            from: Timestamp::from_micros(int(7)?),
            to: match &values[8] {
                Value::Null => None,
                _ => Some(Timestamp::from_micros(int(8)?)),
            },
        })
    }

    /// Decode the edge columns that start at `offset` in a row
    pub fn from_row(row: &Row, offset: usize) -> Result<Self> {
        Self::from_values(row.get(offset..).unwrap_or_default())
    }
}

/// Winner among competing versions of one slot
pub fn latest_by<T, I, F>(items: I, edge: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> &EdgeVersion,
{
    items
        .into_iter()
        .max_by(|a, b| edge(a).rank().cmp(&edge(b).rank()))
}

/// Winner of a slot, or `None` when the winning version is a deletion
pub fn active_winner<T, I, F>(items: I, edge: F) -> Option<T>
where
    I: IntoIterator<Item = T>,
    F: Fn(&T) -> &EdgeVersion,
{
    latest_by(items, &edge).filter(|w| edge(w).is_active())
}
