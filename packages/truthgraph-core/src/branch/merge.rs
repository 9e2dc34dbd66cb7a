//! Branch merge
//!
//! Merging replays the source branch's open edges onto its origin, stamped
//! with the merge time. Vertices are shared between branches, so only edges
//! move. Each replayed edge supersedes the origin's current version of the
//! same slot; a replayed deletion retires it.

use std::collections::{BTreeSet, HashMap};
use tracing::info;

use super::filter::{EdgeVersion, FilterStyle};
use super::BranchRegistry;
use crate::error::{GraphError, Result};
use crate::query::{Query, WriteBatch};
use crate::store::{EdgeLabel, Params, Statement};
use crate::timestamp::Timestamp;

const SRC_CHUNK: usize = 500;

/// Outcome of [`BranchRegistry::merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub source: String,
    pub target: String,
    pub merged_at: Timestamp,
    /// Source edges replayed onto the target
    pub edges_replayed: usize,
    /// Whether the source's divergence point moved to the merge time
    pub rebased: bool,
}

/// Identity of the thing an edge versions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SlotKey {
    label: String,
    src: String,
    discriminator: String,
}

impl SlotKey {
    fn of(edge: &EdgeVersion, dst_name: Option<&str>) -> Self {
        let discriminator = if edge.label == EdgeLabel::HasValue.as_str()
            || edge.label == EdgeLabel::HasGraphVersion.as_str()
        {
            String::new()
        } else if edge.label == EdgeLabel::HasSchema.as_str() {
            dst_name.unwrap_or_default().to_string()
        } else {
            edge.dst.clone()
        };
        Self {
            label: edge.label.clone(),
            src: edge.src.clone(),
            discriminator,
        }
    }
}

fn edge_label(label: &str) -> Result<EdgeLabel> {
    [
        EdgeLabel::IsPartOf,
        EdgeLabel::HasAttribute,
        EdgeLabel::HasValue,
        EdgeLabel::IsRelated,
        EdgeLabel::HasSchema,
        EdgeLabel::HasGraphVersion,
        EdgeLabel::AppliedMigration,
    ]
    .into_iter()
    .find(|l| l.as_str() == label)
    .ok_or_else(|| GraphError::Internal(format!("unknown edge label '{}'", label)))
}

impl BranchRegistry {
    /// Replay `source`'s changes onto its origin
    ///
    /// When nothing was branched off `source`, its divergence point is moved
    /// to the merge time so it continues from the merged state.
    pub async fn merge(&self, source: &str) -> Result<MergeReport> {
        let source_scope = self.scope(source).await?;
        let target_name = source_scope
            .branch()
            .origin_branch
            .clone()
            .ok_or_else(|| {
                GraphError::validation("branch", format!("'{}' has no origin to merge into", source))
            })?;
        let target_scope = self.scope(&target_name).await?;
        let db = self.database();
        let now = Timestamp::now();

        // Open edges written on the source branch itself
        let mut params = Params::new();
        params.insert("branch", source)?;
        params.insert("at", now.as_micros())?;
        let stmt = Statement::new(
            "SELECT e.eid, e.label, e.src, e.dst, e.branch, e.branch_level, e.status, e.from_ts, e.to_ts, v.name \
             FROM edges e LEFT JOIN vertices v ON v.uuid = e.dst \
             WHERE e.branch = $branch AND e.to_ts IS NULL AND e.from_ts <= $at \
             ORDER BY e.eid",
        )
        .with_params(params)
        .with_columns(
            EdgeVersion::COLUMNS
                .iter()
                .map(|c| c.to_string())
                .chain(["dst_name".to_string()]),
        );
        let rows = db.fetch_paged(&stmt).await?;

        let mut replay: Vec<(SlotKey, EdgeVersion)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let edge = EdgeVersion::from_row(row, 0)?;
            let dst_name = row.get(EdgeVersion::COLUMNS.len()).and_then(|v| v.as_str());
            replay.push((SlotKey::of(&edge, dst_name), edge));
        }

        // Current versions of the same slots as seen from the target
        let sources: BTreeSet<String> = replay.iter().map(|(_, e)| e.src.clone()).collect();
        let sources: Vec<String> = sources.into_iter().collect();
        let mut target_slots: HashMap<SlotKey, Vec<EdgeVersion>> = HashMap::new();
        for (idx, chunk) in sources.chunks(SRC_CHUNK).enumerate() {
            let mut query = Query::init(format!("merge_target_{}", idx), &target_scope, Some(now));
            let src_list = query.add_list_param("src", chunk.iter().map(String::as_str))?;
            let filters = query.temporal_filter(&["e"], FilterStyle::Grouped, "f")?;
            query.add_to_query("FROM edges e LEFT JOIN vertices v ON v.uuid = e.dst");
            query.add_to_query(format!(
                "WHERE e.src IN {} AND {}",
                src_list,
                filters.join(" AND ")
            ));
            query.add_edge_returns("e");
            query.add_return("v.name", "dst_name");
            query.order_by("e.eid");
            query.execute(db).await?;

            for result in query.results() {
                let edge = result.edge("e")?;
                let key = SlotKey::of(&edge, result.get_str("dst_name"));
                target_slots.entry(key).or_default().push(edge);
            }
        }

        let mut batch = WriteBatch::new(&target_scope, now);
        let mut replayed = 0;
        for (key, edge) in &replay {
            let candidates: Vec<&EdgeVersion> = target_slots
                .get(key)
                .map(|edges| edges.iter().collect())
                .unwrap_or_default();
            let label = edge_label(&edge.label)?;
            if edge.is_active() {
                let already_current = candidates.len() == 1
                    && candidates[0].is_active()
                    && candidates[0].dst == edge.dst;
                if already_current {
                    continue;
                }
                batch.supersede(&candidates)?;
                batch.create_edge(label, &edge.src, &edge.dst)?;
            } else if !batch.retire(label, &edge.src, &edge.dst, &candidates)? {
                continue;
            }
            replayed += 1;
        }
        batch.commit(db).await?;

        let rebased = if self.children(source).is_empty() {
            self.set_branched_from(source, now).await?;
            true
        } else {
            false
        };

        info!(
            source = %source,
            target = %target_name,
            edges = replayed,
            rebased,
            "branch merged"
        );
        Ok(MergeReport {
            source: source.to_string(),
            target: target_name,
            merged_at: now,
            edges_replayed: replayed,
            rebased,
        })
    }
}
