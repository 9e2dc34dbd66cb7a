//! Account lookups used by the authentication layer
//!
//! The core never checks credentials itself; it only resolves a token or
//! an account name to the stored account on a branch.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use tracing::debug;

use crate::branch::filter::FilterStyle;
use crate::context::GraphContext;
use crate::error::{GraphError, Result};
use crate::node::{Node, NodeFilter};
use crate::query::Query;
use crate::store::{EdgeLabel, VertexLabel};
use crate::timestamp::Timestamp;

pub const ACCOUNT_KIND: &str = "Account";
pub const TOKEN_KIND: &str = "AccountToken";
pub const DEFAULT_ROLE: &str = "read-only";

/// Outcome of [`validate_token`]; no account means the token is unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub role: String,
}

impl TokenValidation {
    fn unknown() -> Self {
        Self {
            account_id: None,
            account_name: None,
            role: DEFAULT_ROLE.to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.account_id.is_some()
    }
}

fn text_value(node: &Node, attribute: &str) -> Option<String> {
    node.get(attribute).and_then(JsonValue::as_str).map(str::to_string)
}

/// Candidate `(token node, account node)` pairs for `token`
async fn token_candidates(
    ctx: &GraphContext,
    token: &str,
    branch: &str,
    at: Option<Timestamp>,
) -> Result<Vec<(String, String)>> {
    let scope = ctx.branches().scope(branch).await?;
    let mut query = Query::init("account_token_validate", &scope, at);
    let token_filters = query.temporal_filter(&["r1", "r2"], FilterStyle::Grouped, "tok")?;
    let account_filters = query.temporal_filter(
        &["r3", "r4", "r5", "r6", "r7", "r8"],
        FilterStyle::Grouped,
        "acc",
    )?;
    query.add_param("token_value", serde_json::to_string(token)?)?;
    query.add_param("node_label", VertexLabel::Node.as_str())?;
    query.add_param("token_kind", TOKEN_KIND)?;
    query.add_param("account_kind", ACCOUNT_KIND)?;
    query.add_to_query(format!(
        "FROM vertices t \
         JOIN edges r1 ON r1.src = t.uuid AND r1.label = '{has_attr}' \
         JOIN vertices a ON a.uuid = r1.dst AND a.name = 'token' \
         JOIN edges r2 ON r2.src = a.uuid AND r2.label = '{has_value}' \
         JOIN vertices tv ON tv.uuid = r2.dst AND tv.value = $token_value \
         JOIN edges r3 ON r3.src = t.uuid AND r3.label = '{related}' \
         JOIN edges r4 ON r4.dst = r3.dst AND r4.label = '{related}' AND r4.src <> t.uuid \
         JOIN vertices acc ON acc.uuid = r4.src AND acc.kind = $account_kind \
         JOIN edges r5 ON r5.src = acc.uuid AND r5.label = '{has_attr}' \
         JOIN vertices an ON an.uuid = r5.dst AND an.name = 'name' \
         JOIN edges r6 ON r6.src = an.uuid AND r6.label = '{has_value}' \
         JOIN edges r7 ON r7.src = acc.uuid AND r7.label = '{has_attr}' \
         JOIN vertices ar ON ar.uuid = r7.dst AND ar.name = 'role' \
         JOIN edges r8 ON r8.src = ar.uuid AND r8.label = '{has_value}'",
        has_attr = EdgeLabel::HasAttribute,
        has_value = EdgeLabel::HasValue,
        related = EdgeLabel::IsRelated,
    ));
    query.add_to_query(format!(
        "WHERE t.label = $node_label AND t.kind = $token_kind AND {} AND {}",
        token_filters.join(" AND "),
        account_filters.join(" AND ")
    ));
    query.distinct();
    query.add_return("t.uuid", "token_id");
    query.add_return("acc.uuid", "account_id");
    query.order_by("t.uuid, acc.uuid");
    query.execute(ctx.db()).await?;

    let mut pairs = Vec::with_capacity(query.num_of_results());
    for result in query.results() {
        pairs.push((result.text("token_id")?, result.text("account_id")?));
    }
    Ok(pairs)
}

/// Resolve `token` to its account and role on `branch` (default branch when
/// `None`) as of `at`
///
/// Candidates from the store are confirmed against the current value of the
/// token attribute and the current peer of the token.
pub async fn validate_token(
    ctx: &GraphContext,
    token: &str,
    branch: Option<&str>,
    at: Option<Timestamp>,
) -> Result<TokenValidation> {
    let branch = ctx.branches().get_or_default(branch).await?;
    let candidates = token_candidates(ctx, token, &branch.name, at).await?;
    if candidates.is_empty() {
        debug!(branch = %branch.name, "token not found");
        return Ok(TokenValidation::unknown());
    }

    let ids: Vec<String> = candidates
        .iter()
        .flat_map(|(t, a)| [t.clone(), a.clone()])
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let nodes = ctx.nodes().get_many(&ids, Some(&branch.name), at).await?;

    for (token_id, account_id) in &candidates {
        let (Some(token_node), Some(account)) = (nodes.get(token_id), nodes.get(account_id)) else {
            continue;
        };
        if token_node.get("token").and_then(JsonValue::as_str) != Some(token) {
            continue;
        }
        if !token_node.relationships().any(|r| r.contains(account_id)) {
            continue;
        }
        return Ok(TokenValidation {
            account_id: Some(account_id.clone()),
            account_name: text_value(account, "name"),
            role: text_value(account, "role").unwrap_or_else(|| DEFAULT_ROLE.to_string()),
        });
    }
    Ok(TokenValidation::unknown())
}

/// Account named `name` via the kind's default filter; empty names resolve
/// to nothing
pub async fn get_account(
    ctx: &GraphContext,
    name: &str,
    branch: Option<&str>,
    at: Option<Timestamp>,
) -> Result<Option<Node>> {
    if name.is_empty() {
        return Ok(None);
    }
    ctx.nodes()
        .query_one(
            ACCOUNT_KIND,
            &[NodeFilter::Default(JsonValue::String(name.to_string()))],
            branch,
            at,
        )
        .await
}

pub fn get_account_by_id(_id: &str) -> Result<Node> {
    Err(GraphError::NotSupported(
        "looking up accounts by id".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_token_is_read_only() {
        let unknown = TokenValidation::unknown();
        assert!(!unknown.is_valid());
        assert_eq!(unknown.role, DEFAULT_ROLE);
    }

    #[test]
    fn test_lookup_by_id_not_supported() {
        let err = get_account_by_id("acc-1").unwrap_err();
        assert!(matches!(err, GraphError::NotSupported(_)));
    }
}
