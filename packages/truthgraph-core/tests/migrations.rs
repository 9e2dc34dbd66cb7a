//! Schema data migrations and the graph migration runner

mod common;

use async_trait::async_trait;
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use truthgraph_core::{
    AttributeKind, AttributeSchema, Cardinality, GraphContext, GraphError, Migration,
    MigrationContext, MigrationRegistry, MigrationResult, MigrationRunner, MigrationState,
    NodeMutation, NodeSchema, Result, SchemaBranch, Statement, Timestamp, Value,
};

async fn count(ctx: &GraphContext, sql: &str) -> i64 {
    let rows = ctx
        .db()
        .fetch(&Statement::new(sql).with_columns(["n"]))
        .await
        .unwrap();
    rows.first().and_then(|r| r.first()).and_then(Value::as_i64).unwrap_or(0)
}

async fn edit_car(ctx: &GraphContext, edit: impl FnOnce(NodeSchema) -> NodeSchema) -> SchemaBranch {
    let current = ctx.schema().load("main").await.unwrap();
    let car = current.duplicate("TestCar").unwrap();
    current.with_node(edit(car)).unwrap()
}

#[tokio::test]
async fn test_attribute_rename_moves_values_once() {
    let ctx = car_person_context().await;
    let volt = create_car(&ctx, "volt", "blue", None, None).await;
    create_car(&ctx, "bolt", "red", None, None).await;

    let next = edit_car(&ctx, |mut car| {
        car.get_attribute_mut("color").unwrap().name = "colour".into();
        car
    })
    .await;
    let update = ctx.schema().update("main", next).await.unwrap();
    let migration = update.migration();
    assert_eq!(migration.names(), vec!["node.attribute.rename:TestCar/colour"]);

    let before = graph_size(&ctx).await;
    let run = ctx.migrations().execute(&migration, "main").await.unwrap();
    assert_eq!(run.state, MigrationState::Succeeded);
    assert_eq!(run.result.changes, 2);

    // one attribute vertex plus HAS_ATTRIBUTE and HAS_VALUE per car
    let after = graph_size(&ctx).await;
    assert_eq!((after.0 - before.0, after.1 - before.1), (2, 4));

    let rerun = ctx.migrations().execute(&migration, "main").await.unwrap();
    assert_eq!(rerun.result.changes, 0);
    assert_eq!(graph_size(&ctx).await, after);

    assert_eq!(read_attr(&ctx, &volt, "colour", None, None).await, Some(json!("blue")));
    assert_eq!(read_attr(&ctx, &volt, "color", None, None).await, None);
}

#[tokio::test]
async fn test_attribute_add_backfills_default() {
    let ctx = car_person_context().await;
    create_car(&ctx, "volt", "blue", None, None).await;
    create_car(&ctx, "bolt", "red", None, None).await;

    let next = edit_car(&ctx, |car| {
        car.attribute(AttributeSchema::new("year", AttributeKind::Number).with_default(json!(2020)))
    })
    .await;
    let update = ctx.apply_schema("main", next).await.unwrap();
    assert_eq!(
        count(&ctx, "SELECT COUNT(*) AS n FROM vertices WHERE label = 'Attribute' AND name = 'year'").await,
        2
    );

    let rerun = ctx.migrations().execute(&update.migration(), "main").await.unwrap();
    assert_eq!(rerun.result.changes, 0);

    let cars = ctx.nodes().query("TestCar", &[], None, None).await.unwrap();
    assert!(cars.iter().all(|c| c.get("year") == Some(&json!(2020))));
}

#[tokio::test]
async fn test_mandatory_attribute_without_default_fails() {
    let ctx = car_person_context().await;
    create_car(&ctx, "volt", "blue", None, None).await;

    let next = edit_car(&ctx, |car| car.attribute(AttributeSchema::new("vin", AttributeKind::Text))).await;
    match ctx.apply_schema("main", next).await.unwrap_err() {
        GraphError::Migration { errors, applied, .. } => {
            assert!(errors.iter().any(|e| e.contains("vin")), "{errors:?}");
            assert!(applied.is_empty());
        }
        other => panic!("expected a migration error, got {other:?}"),
    }
    let stored = ctx.schema().load("main").await.unwrap();
    assert!(stored.get("TestCar").unwrap().get_attribute("vin").is_err());
}

#[tokio::test]
async fn test_mandatory_attribute_on_empty_kind_is_fine() {
    let ctx = car_person_context().await;
    let next = edit_car(&ctx, |car| car.attribute(AttributeSchema::new("vin", AttributeKind::Text))).await;
    let update = ctx.apply_schema("main", next).await.unwrap();
    assert_eq!(update.diff.len(), 1);
}

#[tokio::test]
async fn test_kind_removal_retires_nodes() {
    let ctx = context().await;
    let boat = NodeSchema::new("TestBoat")
        .attribute(AttributeSchema::new("name", AttributeKind::Text))
        .default_filter("name__value");
    let with_boat = SchemaBranch::new(vec![person_schema(), car_schema(), boat]).unwrap();
    ctx.apply_schema("main", with_boat.clone()).await.unwrap();

    let id = NodeMutation::create("TestBoat")
        .with("name", "bluebird")
        .apply(&ctx)
        .await
        .unwrap()
        .id;
    let car = create_car(&ctx, "volt", "blue", None, None).await;

    ctx.apply_schema("main", with_boat.without_node("TestBoat").unwrap())
        .await
        .unwrap();

    assert!(ctx.nodes().get_one(&id, None, None).await.unwrap().is_none());
    assert!(ctx.nodes().get_one(&car, None, None).await.unwrap().is_some());
    let err = ctx.nodes().query("TestBoat", &[], None, None).await.unwrap_err();
    assert!(matches!(err, GraphError::SchemaNotFound(_)));
}

#[tokio::test]
async fn test_cardinality_many_to_one_checks_data() {
    let ctx = car_person_context().await;
    let john = create_person(&ctx, "John", None).await;
    create_car(&ctx, "volt", "blue", Some(&john), None).await;
    create_car(&ctx, "bolt", "red", Some(&john), None).await;

    let current = ctx.schema().load("main").await.unwrap();
    let mut person = current.duplicate("TestPerson").unwrap();
    person.get_relationship_mut("cars").unwrap().cardinality = Cardinality::One;
    let next = current.with_node(person).unwrap();

    let err = ctx.apply_schema("main", next).await.unwrap_err();
    match err {
        GraphError::Migration { errors, applied, .. } => {
            assert_eq!(errors.len(), 1);
            assert!(applied.is_empty());
        }
        other => panic!("expected a migration error, got {other:?}"),
    }

    // the rejected schema was never stored
    let cached = ctx.schema().load("main").await.unwrap();
    let stored = ctx.schema().load_at("main", Timestamp::now()).await.unwrap();
    for schema in [cached.as_ref(), &stored] {
        let cars = schema.get("TestPerson").unwrap().get_relationship("cars").unwrap();
        assert_eq!(cars.cardinality, Cardinality::Many);
    }
}

#[tokio::test]
async fn test_fresh_graph_is_current() {
    let ctx = context().await;
    let latest = ctx.migrations().registry().latest_version();
    assert_eq!(latest, 2);
    assert_eq!(ctx.migrations().graph_version().await.unwrap(), Some(latest));
    assert!(ctx.migrations().list_pending().await.unwrap().is_empty());
    assert!(ctx.run_migrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_builtin_migrations_backfill_branch_level() {
    let ctx = car_person_context().await;
    let john = create_person(&ctx, "John", None).await;
    ctx.migrations().set_graph_version(0).await.unwrap();
    ctx.db()
        .execute(&Statement::new("UPDATE edges SET branch_level = 0"))
        .await
        .unwrap();

    let applied = ctx.run_migrations().await.unwrap();
    assert_eq!(
        applied,
        vec!["001_edge_branch_level_backfill", "002_schema_attribute_ids"]
    );
    assert_eq!(count(&ctx, "SELECT COUNT(*) AS n FROM edges WHERE branch_level = 0").await, 0);
    assert_eq!(ctx.migrations().graph_version().await.unwrap(), Some(2));
    assert_eq!(read_attr(&ctx, &john, "name", None, None).await, Some(json!("John")));

    let history = ctx.migrations().applied().await.unwrap();
    let names: Vec<_> = history.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, applied);
    assert_eq!(history[1].version, 2);
}

struct Counted {
    name: &'static str,
    minimum: u32,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Migration for Counted {
    fn name(&self) -> &str {
        self.name
    }

    fn minimum_version(&self) -> u32 {
        self.minimum
    }

    async fn execute(&self, _ctx: &MigrationContext<'_>) -> Result<MigrationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Ok(MigrationResult::failed(format!("{} refused", self.name)));
        }
        Ok(MigrationResult::with_changes(1))
    }
}

fn runner(ctx: &GraphContext, migrations: Vec<Counted>) -> MigrationRunner {
    let mut registry = MigrationRegistry::new();
    for migration in migrations {
        registry.register(Arc::new(migration)).unwrap();
    }
    MigrationRunner::new(
        ctx.db().clone(),
        ctx.branches().clone(),
        ctx.schema().clone(),
        ctx.locks().clone(),
        registry,
    )
}

fn counted(name: &'static str, minimum: u32, fail: bool, calls: &Arc<AtomicUsize>) -> Counted {
    Counted {
        name,
        minimum,
        fail,
        calls: calls.clone(),
    }
}

#[tokio::test]
async fn test_runner_orders_and_skips_gated() {
    let ctx = context().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = runner(
        &ctx,
        vec![
            counted("004_gated", 3, false, &calls),
            counted("002_second", 1, false, &calls),
            counted("001_first", 0, false, &calls),
        ],
    );
    runner.set_graph_version(0).await.unwrap();

    let applied = runner.run_pending().await.unwrap();
    assert_eq!(applied, vec!["001_first", "002_second"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(runner.graph_version().await.unwrap(), Some(2));
    assert_eq!(runner.list_pending().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_runner_aborts_on_failure() {
    let ctx = context().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = runner(
        &ctx,
        vec![
            counted("001_ok", 0, false, &calls),
            counted("002_broken", 1, true, &calls),
            counted("003_after", 2, false, &calls),
        ],
    );
    runner.set_graph_version(0).await.unwrap();

    match runner.run_pending().await.unwrap_err() {
        GraphError::Migration { name, applied, .. } => {
            assert_eq!(name, "002_broken");
            assert_eq!(applied, vec!["001_ok"]);
        }
        other => panic!("expected a migration error, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(runner.graph_version().await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_recorded_migration_is_not_replayed() {
    let ctx = context().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let runner = runner(&ctx, vec![counted("001_once", 0, false, &calls)]);
    runner.set_graph_version(0).await.unwrap();
    runner.run_pending().await.unwrap();

    // history says applied even though the version went backwards
    runner.set_graph_version(0).await.unwrap();
    assert!(runner.run_pending().await.unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(runner.graph_version().await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_validate_reports_without_writing() {
    let ctx = car_person_context().await;
    create_car(&ctx, "volt", "blue", None, None).await;
    let next = edit_car(&ctx, |car| car.attribute(AttributeSchema::new("vin", AttributeKind::Text))).await;
    let update = ctx.schema().update("main", next).await.unwrap();

    let before = graph_size(&ctx).await;
    let result = ctx.migrations().validate(&update.migration(), "main").await.unwrap();
    assert!(!result.success());
    assert_eq!(graph_size(&ctx).await, before);
}
