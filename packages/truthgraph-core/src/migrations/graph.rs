//! Built-in graph migrations, in version order

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{Migration, MigrationContext, MigrationResult};
use crate::error::Result;
use crate::store::{Params, Statement};

pub const EDGE_BRANCH_LEVEL_BACKFILL: &str = "001_edge_branch_level_backfill";
pub const SCHEMA_ATTRIBUTE_IDS: &str = "002_schema_attribute_ids";

pub fn builtin() -> Vec<Arc<dyn Migration>> {
    vec![
        Arc::new(EdgeBranchLevelBackfill),
        Arc::new(SchemaAttributeIds),
    ]
}

/// Stamp edges written before `branch_level` existed with their branch's
/// hierarchy level
pub struct EdgeBranchLevelBackfill;

impl EdgeBranchLevelBackfill {
    fn statements(ctx: &MigrationContext<'_>) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();
        for branch in ctx.branches.list() {
            let mut params = Params::new();
            params.insert("level", i64::from(branch.hierarchy_level))?;
            params.insert("branch", branch.name.as_str())?;
            statements.push(
                Statement::new(
                    "UPDATE edges SET branch_level = $level WHERE branch = $branch AND branch_level = 0",
                )
                .with_params(params),
            );
        }
        Ok(statements)
    }
}

#[async_trait]
impl Migration for EdgeBranchLevelBackfill {
    fn name(&self) -> &str {
        EDGE_BRANCH_LEVEL_BACKFILL
    }

    fn minimum_version(&self) -> u32 {
        0
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        let statements = Self::statements(ctx)?;
        if statements.is_empty() {
            return Ok(MigrationResult::default());
        }
        let updated = ctx.db.execute_atomic(&statements).await?;
        info!(edges = updated, "edge branch levels backfilled");
        Ok(MigrationResult::with_changes(updated as usize))
    }
}

/// Give every attribute of the default branch schema a stable id
///
/// Attribute ids are what tell a rename apart from a remove and add.
pub struct SchemaAttributeIds;

#[async_trait]
impl Migration for SchemaAttributeIds {
    fn name(&self) -> &str {
        SCHEMA_ATTRIBUTE_IDS
    }

    fn minimum_version(&self) -> u32 {
        1
    }

    async fn execute(&self, ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        ctx.schema.invalidate(Some(ctx.branch()));
        let current = ctx.schema.load(ctx.branch()).await?;
        let missing = current
            .nodes()
            .flat_map(|n| n.attributes.iter())
            .filter(|a| a.id.is_none())
            .count();
        if missing == 0 {
            return Ok(MigrationResult::default());
        }
        // ids are assigned on update
        ctx.schema
            .update(ctx.branch(), current.as_ref().clone())
            .await?;
        Ok(MigrationResult::with_changes(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_chain() {
        let migrations = builtin();
        assert_eq!(migrations[0].name(), EDGE_BRANCH_LEVEL_BACKFILL);
        assert_eq!(migrations[0].version(), 1);
        assert_eq!(migrations[1].minimum_version(), migrations[0].version());
    }
}
