//! Branch isolation, inheritance and merge

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use truthgraph_core::{BranchCreate, GraphError, NodeFilter, Timestamp};

#[tokio::test]
async fn test_branch_change_is_isolated() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();
    let branched = Timestamp::now();

    set_color(&ctx, &car, "red", Some("branch1")).await;

    assert_eq!(read_attr(&ctx, &car, "color", None, None).await, Some(json!("blue")));
    assert_eq!(
        read_attr(&ctx, &car, "color", Some("branch1"), None).await,
        Some(json!("red"))
    );
    // inherited value until the branch's own edit
    assert_eq!(
        read_attr(&ctx, &car, "color", Some("branch1"), Some(branched)).await,
        Some(json!("blue"))
    );
}

#[tokio::test]
async fn test_origin_changes_after_divergence_are_invisible() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    let before = Timestamp::now();
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();

    set_color(&ctx, &car, "red", None).await;

    assert_eq!(
        read_attr(&ctx, &car, "color", Some("branch1"), None).await,
        Some(json!("blue"))
    );
    // identical history before the divergence point
    assert_eq!(
        read_attr(&ctx, &car, "color", Some("branch1"), Some(before)).await,
        read_attr(&ctx, &car, "color", None, Some(before)).await
    );
}

#[tokio::test]
async fn test_node_created_on_branch_stays_there() {
    let ctx = car_person_context().await;
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();
    let car = create_car(&ctx, "car2", "green", None, Some("branch1")).await;

    assert!(ctx.nodes().get_one(&car, None, None).await.unwrap().is_none());
    let on_branch = ctx
        .nodes()
        .query("TestCar", &[NodeFilter::Default(json!("car2"))], Some("branch1"), None)
        .await
        .unwrap();
    assert_eq!(on_branch.len(), 1);
    assert_eq!(on_branch[0].id(), car);
}

#[tokio::test]
async fn test_delete_on_branch_masks_inherited_node() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();

    let node = ctx
        .nodes()
        .get_one(&car, Some("branch1"), None)
        .await
        .unwrap()
        .unwrap();
    ctx.nodes().delete(&node).await.unwrap();

    assert!(ctx.nodes().get_one(&car, Some("branch1"), None).await.unwrap().is_none());
    assert!(ctx.nodes().get_one(&car, None, None).await.unwrap().is_some());
}

#[tokio::test]
async fn test_merge_makes_branch_changes_visible() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();
    set_color(&ctx, &car, "red", Some("branch1")).await;
    let new_car = create_car(&ctx, "car2", "black", None, Some("branch1")).await;
    let before_merge = Timestamp::now();

    let report = ctx.merge_branch("branch1").await.unwrap();
    assert_eq!(report.target, "main");
    assert!(report.edges_replayed > 0);

    assert_eq!(read_attr(&ctx, &car, "color", None, None).await, Some(json!("red")));
    assert_eq!(read_attr(&ctx, &new_car, "color", None, None).await, Some(json!("black")));
    assert_eq!(
        read_attr(&ctx, &car, "color", None, Some(before_merge)).await,
        Some(json!("blue"))
    );
}

#[tokio::test]
async fn test_rebase_refused_when_children_exist() {
    let ctx = car_person_context().await;
    ctx.create_branch("branch1", BranchCreate::default()).await.unwrap();
    ctx.create_branch(
        "branch2",
        BranchCreate {
            origin: Some("branch1".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let err = ctx.rebase_branch("branch1").await.unwrap_err();
    assert!(matches!(err, GraphError::Conflict(_)));
    assert!(ctx.rebase_branch("branch2").await.is_ok());
}

#[tokio::test]
async fn test_unknown_branch() {
    let ctx = car_person_context().await;
    let err = ctx
        .nodes()
        .query("TestCar", &[], Some("nope"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::BranchNotFound(ref name) if name == "nope"));
}
