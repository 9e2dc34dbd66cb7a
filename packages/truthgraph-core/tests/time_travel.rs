//! Reads as of a past timestamp

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use truthgraph_core::{NodeMutation, Timestamp};

#[tokio::test]
async fn test_car_color_blue_then_red() {
    let ctx = car_person_context().await;
    let before_create = Timestamp::now();
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    let while_blue = Timestamp::now();
    set_color(&ctx, &car, "red", None).await;

    assert_eq!(read_attr(&ctx, &car, "color", None, None).await, Some(json!("red")));
    assert_eq!(
        read_attr(&ctx, &car, "color", None, Some(while_blue)).await,
        Some(json!("blue"))
    );
    assert_eq!(read_attr(&ctx, &car, "color", None, Some(before_create)).await, None);
}

#[tokio::test]
async fn test_unchanged_attributes_keep_their_history() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    let t1 = Timestamp::now();
    set_color(&ctx, &car, "red", None).await;
    set_color(&ctx, &car, "green", None).await;

    assert_eq!(read_attr(&ctx, &car, "name", None, Some(t1)).await, Some(json!("car1")));
    assert_eq!(read_attr(&ctx, &car, "name", None, None).await, Some(json!("car1")));
    assert_eq!(read_attr(&ctx, &car, "nbr_seats", None, None).await, Some(json!(4)));
    assert_eq!(read_attr(&ctx, &car, "color", None, None).await, Some(json!("green")));
}

#[tokio::test]
async fn test_deleted_node_visible_in_the_past() {
    let ctx = car_person_context().await;
    let car = create_car(&ctx, "car1", "blue", None, None).await;
    let alive = Timestamp::now();
    NodeMutation::delete(car.as_str())
        .apply(&ctx)
        .await
        .expect("delete");

    assert!(ctx.nodes().get_one(&car, None, None).await.unwrap().is_none());
    let past = ctx.nodes().get_one(&car, None, Some(alive)).await.unwrap();
    assert_eq!(past.map(|n| n.kind().to_string()), Some("TestCar".to_string()));
}

#[tokio::test]
async fn test_removed_peer_visible_in_the_past() {
    let ctx = car_person_context().await;
    let john = create_person(&ctx, "John", None).await;
    let car = create_car(&ctx, "car1", "blue", Some(&john), None).await;
    let owned = Timestamp::now();

    NodeMutation::update(car.as_str())
        .with("owner", serde_json::Value::Null)
        .apply(&ctx)
        .await
        .expect("clear owner");

    let now = ctx.nodes().get_one(&car, None, None).await.unwrap().unwrap();
    assert_eq!(now.relationship("owner").unwrap().peer(), None);
    let then = ctx.nodes().get_one(&car, None, Some(owned)).await.unwrap().unwrap();
    assert_eq!(then.relationship("owner").unwrap().peer(), Some(john.as_str()));
}
