//! Paging, locking and file-backed persistence

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use truthgraph_core::{
    namespace, DatabaseSettings, GraphContext, GraphError, LockRegistry, NodeFilter, Settings,
};

#[tokio::test]
async fn test_queries_page_through_small_limit() {
    let mut settings = Settings::default();
    settings.database.imposed_query_limit = 2;
    let ctx = context_with(settings).await;
    ctx.apply_schema("main", car_person_schema()).await.unwrap();
    for name in ["Ann", "Bob", "Cid", "Dee", "Eve"] {
        create_person(&ctx, name, None).await;
    }

    let people = ctx.nodes().query("TestPerson", &[], None, None).await.unwrap();
    assert_eq!(people.len(), 5);
    let eve = ctx
        .nodes()
        .query_one("TestPerson", &[NodeFilter::Default(json!("Eve"))], None, None)
        .await
        .unwrap();
    assert!(eve.is_some());
}

#[tokio::test]
async fn test_concurrent_migration_runs_apply_once() {
    let ctx = context().await;
    ctx.migrations().set_graph_version(0).await.unwrap();

    let (first, second) = tokio::join!(ctx.run_migrations(), ctx.run_migrations());
    let mut counts = vec![first.unwrap().len(), second.unwrap().len()];
    counts.sort();
    assert_eq!(counts, vec![0, 2]);
    assert_eq!(ctx.migrations().applied().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_lock_timeout() {
    let locks = LockRegistry::with_timeout(Duration::from_millis(20));
    let _held = locks.acquire("main", Some(namespace::MIGRATION)).await;
    assert!(locks.is_locked("main", Some(namespace::MIGRATION)));

    let err = locks
        .acquire_timeout("main", Some(namespace::MIGRATION))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Conflict(_)));

    // other namespaces are independent
    let other = locks.acquire_timeout("main", Some(namespace::BRANCH)).await;
    assert!(other.is_ok());
}

#[tokio::test]
async fn test_graph_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        database: DatabaseSettings {
            path: Some(dir.path().join("graph.db").to_string_lossy().into_owned()),
            ..DatabaseSettings::default()
        },
        ..Settings::default()
    };

    let ctx = GraphContext::open(settings.clone()).await.unwrap();
    ctx.apply_schema("main", car_person_schema()).await.unwrap();
    let car = create_car(&ctx, "volt", "blue", None, None).await;
    set_color(&ctx, &car, "red", None).await;
    let size = graph_size(&ctx).await;
    ctx.shutdown().await.unwrap();

    let reopened = GraphContext::open(settings).await.unwrap();
    assert_eq!(graph_size(&reopened).await, size);
    assert_eq!(read_attr(&reopened, &car, "color", None, None).await, Some(json!("red")));
    assert_eq!(reopened.migrations().graph_version().await.unwrap(), Some(2));
    assert!(reopened.branches().get("main").await.unwrap().is_default);
}
