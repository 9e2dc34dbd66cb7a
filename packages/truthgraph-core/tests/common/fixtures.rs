//! Graph contexts, schemas and nodes used across the integration tests

use serde_json::json;
use std::sync::Arc;

use truthgraph_core::{
    AttributeKind, AttributeSchema, Cardinality, GraphContext, NodeMutation, NodeSchema,
    RelationshipSchema, SchemaBranch, Settings, SqliteGraphStore,
};

/// Fresh context over an in-memory SQLite graph
pub async fn context() -> GraphContext {
    context_with(Settings::default()).await
}

pub async fn context_with(settings: Settings) -> GraphContext {
    let store = SqliteGraphStore::in_memory().expect("in-memory store");
    GraphContext::init(settings, Arc::new(store))
        .await
        .expect("context init")
}

pub fn person_schema() -> NodeSchema {
    NodeSchema::new("TestPerson")
        .attribute(AttributeSchema::new("name", AttributeKind::Text).unique())
        .attribute(AttributeSchema::new("height", AttributeKind::Number).optional())
        .relationship(RelationshipSchema::new("cars", "TestCar", Cardinality::Many))
        .default_filter("name__value")
}

pub fn car_schema() -> NodeSchema {
    NodeSchema::new("TestCar")
        .attribute(AttributeSchema::new("name", AttributeKind::Text).unique())
        .attribute(AttributeSchema::new("color", AttributeKind::Text).optional())
        .attribute(AttributeSchema::new("nbr_seats", AttributeKind::Number).with_default(json!(4)))
        .relationship(RelationshipSchema::new("owner", "TestPerson", Cardinality::One))
        .default_filter("name__value")
}

pub fn car_person_schema() -> SchemaBranch {
    SchemaBranch::new(vec![person_schema(), car_schema()]).expect("valid schema")
}

pub fn account_schema() -> SchemaBranch {
    SchemaBranch::new(vec![
        NodeSchema::new("Account")
            .attribute(AttributeSchema::new("name", AttributeKind::Text).unique())
            .attribute(
                AttributeSchema::new("role", AttributeKind::Text).with_default(json!("read-only")),
            )
            .relationship(RelationshipSchema::new("tokens", "AccountToken", Cardinality::Many))
            .default_filter("name__value"),
        NodeSchema::new("AccountToken")
            .attribute(AttributeSchema::new("token", AttributeKind::Text).unique())
            .relationship(RelationshipSchema::new("account", "Account", Cardinality::One).mandatory()),
    ])
    .expect("valid schema")
}

/// Context with the car/person schema loaded on the default branch
pub async fn car_person_context() -> GraphContext {
    let ctx = context().await;
    ctx.apply_schema("main", car_person_schema())
        .await
        .expect("load schema");
    ctx
}

pub async fn create_person(ctx: &GraphContext, name: &str, branch: Option<&str>) -> String {
    let mut mutation = NodeMutation::create("TestPerson").with("name", name);
    mutation.branch = branch.map(str::to_string);
    mutation.apply(ctx).await.expect("create person").id
}

pub async fn create_car(
    ctx: &GraphContext,
    name: &str,
    color: &str,
    owner: Option<&str>,
    branch: Option<&str>,
) -> String {
    let mut mutation = NodeMutation::create("TestCar")
        .with("name", name)
        .with("color", color);
    if let Some(owner) = owner {
        mutation = mutation.with("owner", owner);
    }
    mutation.branch = branch.map(str::to_string);
    mutation.apply(ctx).await.expect("create car").id
}

pub async fn set_color(ctx: &GraphContext, car: &str, color: &str, branch: Option<&str>) {
    let mut mutation = NodeMutation::update(car).with("color", color);
    mutation.branch = branch.map(str::to_string);
    mutation.apply(ctx).await.expect("update car");
}

/// Current value of `attribute` on node `id`
pub async fn read_attr(
    ctx: &GraphContext,
    id: &str,
    attribute: &str,
    branch: Option<&str>,
    at: Option<truthgraph_core::Timestamp>,
) -> Option<serde_json::Value> {
    ctx.nodes()
        .get_one(id, branch, at)
        .await
        .expect("get node")
        .and_then(|node| node.get(attribute).cloned())
}
