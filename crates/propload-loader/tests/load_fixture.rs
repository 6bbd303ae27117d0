//! Fixture batch through the full pipeline against PostgreSQL. Each test
//! loads into its own schema; all of them are skipped without `DATABASE_URL`.

use std::path::{Path, PathBuf};

use propload_loader::{read_input, run_load, LoadConfig, LoadPipeline};
use propload_storage::{FailingStore, PgStore, SqlValue, Statement, Store};
use rust_decimal::Decimal;
use uuid::Uuid;

fn workspace_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

/// Config pointing at a fresh schema, or `None` without a database.
fn scratch_config(reports_dir: &Path) -> Option<LoadConfig> {
    let Some(url) = std::env::var("DATABASE_URL").ok().filter(|u| !u.trim().is_empty()) else {
        eprintln!("DATABASE_URL not set; skipping PostgreSQL test");
        return None;
    };
    Some(LoadConfig {
        database_url: Some(url),
        db_host: "127.0.0.1".to_string(),
        db_port: 5432,
        db_name: "home_db".to_string(),
        db_user: "db_user".to_string(),
        db_password: String::new(),
        db_schema: Some(format!("propload_test_{}", Uuid::new_v4().simple())),
        json_path: workspace_path("fixtures/sample_properties.json"),
        schema_path: workspace_path("schema/ddl.sql"),
        reports_dir: reports_dir.to_path_buf(),
    })
}

async fn open(config: &LoadConfig) -> PgStore {
    let mut store = PgStore::connect(&config.connect_options().expect("options"))
        .await
        .expect("connect");
    store
        .use_schema(config.db_schema.as_deref().expect("schema"))
        .await
        .expect("schema");
    store
}

async fn count(store: &mut PgStore, sql: &'static str, params: Vec<SqlValue>) -> i64 {
    let mut tx = store.begin().await.expect("begin");
    let n = tx
        .fetch_id(&Statement::new(sql, params).expect("statement"))
        .await
        .expect("count")
        .unwrap_or(0);
    tx.rollback().await.expect("rollback");
    n
}

async fn table_counts(store: &mut PgStore) -> [i64; 5] {
    [
        count(store, "SELECT count(*) FROM property", vec![]).await,
        count(store, "SELECT count(*) FROM leads", vec![]).await,
        count(store, "SELECT count(*) FROM valuation", vec![]).await,
        count(store, "SELECT count(*) FROM hoa", vec![]).await,
        count(store, "SELECT count(*) FROM rehab", vec![]).await,
    ]
}

async fn drop_schema(mut store: PgStore, config: &LoadConfig) {
    let schema = config.db_schema.as_deref().expect("schema");
    let mut tx = store.begin().await.expect("begin");
    tx.execute(&Statement::new(format!("DROP SCHEMA {schema} CASCADE"), vec![]).expect("statement"))
        .await
        .expect("drop schema");
    tx.commit().await.expect("commit");
    store.close().await.expect("close");
}

#[tokio::test]
async fn fixture_batch_loads_end_to_end() {
    let reports_dir = tempfile::tempdir().expect("tempdir");
    let Some(config) = scratch_config(reports_dir.path()) else {
        return;
    };

    let summary = run_load(&config).await.expect("load run");
    assert_eq!(summary.records_total, 5);
    assert_eq!(summary.inserted, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.rejected, 1);

    let mut store = open(&config).await;
    assert_eq!(table_counts(&mut store).await, [3, 3, 2, 3, 1]);

    let bungalow = count(
        &mut store,
        "SELECT count(*) FROM property WHERE address = $1 AND sqft_total = $2 AND flood = $3 \
         AND taxes = $4 AND htw = $5 AND created_at IS NOT NULL",
        vec![
            Some("418 Cedar Ridge Dr, Tulsa, OK 74105").into(),
            Some(1344_i64).into(),
            Some("Zone X").into(),
            Some(Decimal::new(148732, 2)).into(),
            Some("No").into(),
        ],
    )
    .await;
    assert_eq!(bungalow, 1);

    let townhome = count(
        &mut store,
        "SELECT count(*) FROM property WHERE property_title = $1 AND bed = $2 AND bath = $3 \
         AND pool = $4 AND latitude = $5",
        vec![
            Some("Lakeview Townhome").into(),
            Some(3_i64).into(),
            Some(2_i64).into(),
            Some("Yes").into(),
            Some(30.3712_f64).into(),
        ],
    )
    .await;
    assert_eq!(townhome, 1);

    let rehab = count(
        &mut store,
        "SELECT count(*) FROM rehab WHERE roof_flag = $1 AND hvac_flag = $2 \
         AND windows_flag = $3 AND appliances_flag = $4",
        vec![Some("Yes").into(), Some("Unknown").into(), Some("Unknown").into(), Some("No").into()],
    )
    .await;
    assert_eq!(rehab, 1);

    let report: serde_json::Value = serde_json::from_slice(
        &std::fs::read(&summary.report_path).expect("report written"),
    )
    .expect("report json");
    assert_eq!(report["summary"]["inserted"], 3);
    assert_eq!(report["records"][2]["outcome"]["status"], "rejected");
    assert_eq!(report["records"][2]["outcome"]["stage"], "validation");
    assert_eq!(report["records"][3]["outcome"]["status"], "skipped");

    drop_schema(store, &config).await;
}

#[tokio::test]
async fn rerunning_the_fixture_skips_every_loaded_record() {
    let reports_dir = tempfile::tempdir().expect("tempdir");
    let Some(config) = scratch_config(reports_dir.path()) else {
        return;
    };

    run_load(&config).await.expect("first run");
    let second = run_load(&config).await.expect("second run");

    // The record without a title never matches the dedup lookup.
    assert_eq!(second.inserted, 1);
    assert_eq!(second.skipped, 3);
    assert_eq!(second.rejected, 1);

    let mut store = open(&config).await;
    assert_eq!(table_counts(&mut store).await, [4, 4, 2, 3, 1]);
    drop_schema(store, &config).await;
}

#[tokio::test]
async fn store_failures_are_reported_per_record() {
    let reports_dir = tempfile::tempdir().expect("tempdir");
    let Some(config) = scratch_config(reports_dir.path()) else {
        return;
    };
    let input = read_input(&config.json_path).await.expect("fixture input");

    let store = FailingStore::new(open(&config).await).fail_inserts_into("hoa");
    let mut pipeline = LoadPipeline::new(store);
    let summary = pipeline.run(&config, &input).await.expect("load run");

    // Both listings with HOA rows roll back; the later duplicate of the
    // first one no longer collides and loads on its own.
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.rejected, 3);
    assert_eq!(summary.skipped, 0);

    let mut store = pipeline.into_store().into_inner();
    assert_eq!(table_counts(&mut store).await, [2, 2, 1, 0, 0]);
    let valuation = count(
        &mut store,
        "SELECT count(*) FROM valuation WHERE list_price = $1",
        vec![Some(Decimal::ONE).into()],
    )
    .await;
    assert_eq!(valuation, 1);
    drop_schema(store, &config).await;
}
