//! Domain assertions

use truthgraph_core::{count_edges, count_vertices, GraphContext, GraphError};

/// Assert that `err` is a validation error on `field`
pub fn assert_validation(err: &GraphError, field: &str) {
    match err {
        GraphError::Validation { field: actual, .. } => assert_eq!(
            actual, field,
            "validation error on the wrong field: {err}"
        ),
        other => panic!("expected a validation error on '{field}', got {other:?}"),
    }
}

/// Vertex and edge row counts, every version included
pub async fn graph_size(ctx: &GraphContext) -> (i64, i64) {
    (
        count_vertices(ctx.db(), None).await.expect("count vertices"),
        count_edges(ctx.db()).await.expect("count edges"),
    )
}
