//! Transactional load of validated listings plus the batch orchestration
//! around it: input reading, per-record isolation and run reports.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use propload_core::{Hoa, Leads, Property, PropertyRecord, Rehab, Valuation};
use propload_records::{raw_title, validate_record, FieldError};
use propload_storage::{ensure_schema, PgStore, Statement, Store, StoreError, StoreTransaction};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgConnectOptions;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "propload-loader";

#[derive(Clone)]
pub struct LoadConfig {
    pub database_url: Option<String>,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    /// Schema to create and load into instead of the connection default.
    pub db_schema: Option<String>,
    pub json_path: PathBuf,
    pub schema_path: PathBuf,
    pub reports_dir: PathBuf,
}

impl LoadConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            db_host: std::env::var("DB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            db_port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            db_name: std::env::var("DB_NAME").unwrap_or_else(|_| "home_db".to_string()),
            db_user: std::env::var("DB_USER").unwrap_or_else(|_| "db_user".to_string()),
            db_password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            db_schema: std::env::var("DB_SCHEMA").ok().filter(|v| !v.trim().is_empty()),
            json_path: std::env::var("JSON_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/fake_property_data_new.json")),
            schema_path: std::env::var("SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("schema/ddl.sql")),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
        }
    }

    /// `DATABASE_URL` wins over the individual `DB_*` settings.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return PgConnectOptions::from_str(url).context("parsing DATABASE_URL");
        }
        let options = PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .database(&self.db_name);
        Ok(if self.db_password.is_empty() {
            options
        } else {
            options.password(&self.db_password)
        })
    }
}

impl std::fmt::Debug for LoadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_schema", &self.db_schema)
            .field("json_path", &self.json_path)
            .field("schema_path", &self.schema_path)
            .field("reports_dir", &self.reports_dir)
            .finish()
    }
}

pub const FIND_PROPERTY: &str =
    "SELECT id FROM property WHERE property_title = $1 AND address = $2 LIMIT 1";

pub const PROPERTY_INSERT: &str = "INSERT INTO property (
    property_title, address, market, flood, street_address, city, state, zip,
    property_type, highway, train, tax_rate, sqft_basement, htw, pool, commercial,
    water, sewage, year_built, sqft_mu, sqft_total, parking, bed, bath,
    basement_yesno, layout, rent_restricted, neighborhood_rating, latitude, longitude,
    subdivision, taxes, net_yield, irr, school_average
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8,
    $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24,
    $25, $26, $27, $28, $29, $30,
    $31, $32, $33, $34, $35
) RETURNING id";

pub const LEADS_INSERT: &str = "INSERT INTO leads (
    property_id, reviewed_status, most_recent_status, source, occupancy,
    final_reviewer, selling_reason, seller_retained_broker
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

pub const VALUATION_INSERT: &str = "INSERT INTO valuation (
    property_id, list_price, previous_rent, zestimate, arv, expected_rent,
    rent_zestimate, low_fmr, high_fmr, redfin_value
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

pub const HOA_INSERT: &str =
    "INSERT INTO hoa (property_id, hoa_amount, hoa_flag) VALUES ($1, $2, $3)";

pub const REHAB_INSERT: &str = "INSERT INTO rehab (
    property_id, underwriting_rehab, rehab_calculation, paint, flooring_flag,
    foundation_flag, roof_flag, hvac_flag, kitchen_flag, bathroom_flag,
    appliances_flag, windows_flag, landscaping_flag, trashout_flag
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)";

pub fn property_statement(p: &Property) -> Result<Statement, StoreError> {
    Statement::new(
        PROPERTY_INSERT,
        vec![
            p.property_title.as_deref().into(),
            p.address.as_deref().into(),
            p.market.as_deref().into(),
            p.flood.as_deref().into(),
            p.street_address.as_deref().into(),
            p.city.as_deref().into(),
            p.state.as_deref().into(),
            p.zip.as_deref().into(),
            p.property_type.as_deref().into(),
            p.highway.as_deref().into(),
            p.train.as_deref().into(),
            p.tax_rate.into(),
            p.sqft_basement.into(),
            p.htw.into(),
            p.pool.into(),
            p.commercial.into(),
            p.water.as_deref().into(),
            p.sewage.as_deref().into(),
            p.year_built.into(),
            p.sqft_mu.into(),
            p.sqft_total.into(),
            p.parking.as_deref().into(),
            p.bed.into(),
            p.bath.into(),
            p.basement_yes_no.into(),
            p.layout.as_deref().into(),
            p.rent_restricted.into(),
            p.neighborhood_rating.into(),
            p.latitude.into(),
            p.longitude.into(),
            p.subdivision.as_deref().into(),
            p.taxes.into(),
            p.net_yield.into(),
            p.irr.into(),
            p.school_average.into(),
        ],
    )
}

pub fn leads_statement(property_id: i64, l: &Leads) -> Result<Statement, StoreError> {
    Statement::new(
        LEADS_INSERT,
        vec![
            property_id.into(),
            l.reviewed_status.as_deref().into(),
            l.most_recent_status.as_deref().into(),
            l.source.as_deref().into(),
            l.occupancy.as_deref().into(),
            l.final_reviewer.as_deref().into(),
            l.selling_reason.as_deref().into(),
            l.seller_retained_broker.as_deref().into(),
        ],
    )
}

pub fn valuation_statement(property_id: i64, v: &Valuation) -> Result<Statement, StoreError> {
    Statement::new(
        VALUATION_INSERT,
        vec![
            property_id.into(),
            v.list_price.into(),
            v.previous_rent.into(),
            v.zestimate.into(),
            v.arv.into(),
            v.expected_rent.into(),
            v.rent_zestimate.into(),
            v.low_fmr.into(),
            v.high_fmr.into(),
            v.redfin_value.into(),
        ],
    )
}

pub fn hoa_statement(property_id: i64, h: &Hoa) -> Result<Statement, StoreError> {
    Statement::new(HOA_INSERT, vec![property_id.into(), h.hoa_amount.into(), h.hoa_flag.into()])
}

pub fn rehab_statement(property_id: i64, r: &Rehab) -> Result<Statement, StoreError> {
    Statement::new(
        REHAB_INSERT,
        vec![
            property_id.into(),
            r.underwriting_rehab.into(),
            r.rehab_calculation.into(),
            r.paint.as_deref().into(),
            r.flooring_flag.into(),
            r.foundation_flag.into(),
            r.roof_flag.into(),
            r.hvac_flag.into(),
            r.kitchen_flag.into(),
            r.bathroom_flag.into(),
            r.appliances_flag.into(),
            r.windows_flag.into(),
            r.landscaping_flag.into(),
            r.trashout_flag.into(),
        ],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Inserted { property_id: i64 },
    Skipped { property_id: i64 },
}

async fn rollback_quietly(tx: Box<dyn StoreTransaction + '_>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "rollback failed");
    }
}

async fn insert_record<T>(tx: &mut T, property: &Statement, record: &PropertyRecord) -> Result<i64, StoreError>
where
    T: StoreTransaction + ?Sized,
{
    let property_id = tx
        .fetch_id(property)
        .await?
        .ok_or_else(|| StoreError::Write("property insert returned no id".to_string()))?;

    tx.execute(&leads_statement(property_id, &record.leads)?).await?;
    for valuation in &record.valuations {
        tx.execute(&valuation_statement(property_id, valuation)?).await?;
    }
    for hoa in &record.hoas {
        tx.execute(&hoa_statement(property_id, hoa)?).await?;
    }
    for rehab in &record.rehabs {
        tx.execute(&rehab_statement(property_id, rehab)?).await?;
    }
    Ok(property_id)
}

/// Insert one record and its children in a single transaction, or skip it
/// when a property with the same title and address already exists.
pub async fn load_record<S: Store + ?Sized>(store: &mut S, record: &PropertyRecord) -> Result<LoadOutcome, StoreError> {
    let key = record.natural_key();
    let lookup = Statement::new(FIND_PROPERTY, vec![key.property_title.into(), key.address.into()])?;
    let insert = property_statement(&record.property)?;

    let mut tx = store.begin().await?;
    let existing = tx.fetch_id(&lookup).await;
    match existing {
        Ok(Some(property_id)) => {
            tx.rollback().await?;
            return Ok(LoadOutcome::Skipped { property_id });
        }
        Ok(None) => {}
        Err(err) => {
            rollback_quietly(tx).await;
            return Err(err);
        }
    }

    let inserted = insert_record(tx.as_mut(), &insert, record).await;
    match inserted {
        Ok(property_id) => {
            tx.commit().await?;
            Ok(LoadOutcome::Inserted { property_id })
        }
        Err(err) => {
            rollback_quietly(tx).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectStage {
    Validation,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted {
        property_id: i64,
    },
    Skipped {
        property_id: i64,
    },
    Rejected {
        stage: RejectStage,
        reason: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        errors: Vec<FieldError>,
    },
}

impl From<LoadOutcome> for RecordOutcome {
    fn from(outcome: LoadOutcome) -> Self {
        match outcome {
            LoadOutcome::Inserted { property_id } => RecordOutcome::Inserted { property_id },
            LoadOutcome::Skipped { property_id } => RecordOutcome::Skipped { property_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordReport {
    pub index: usize,
    pub property_title: Option<String>,
    pub address: Option<String>,
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadTally {
    pub inserted: usize,
    pub skipped: usize,
    pub rejected: usize,
}

impl LoadTally {
    pub fn from_reports(reports: &[RecordReport]) -> Self {
        reports.iter().fold(Self::default(), |mut tally, report| {
            match report.outcome {
                RecordOutcome::Inserted { .. } => tally.inserted += 1,
                RecordOutcome::Skipped { .. } => tally.skipped += 1,
                RecordOutcome::Rejected { .. } => tally.rejected += 1,
            }
            tally
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_path: String,
    pub input_sha256: String,
    pub records_total: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub report_path: String,
}

/// Parsed input file plus the digest recorded in the run report.
#[derive(Debug, Clone)]
pub struct InputBatch {
    pub path: PathBuf,
    pub sha256: String,
    pub records: Vec<JsonValue>,
}

pub async fn read_input(path: &Path) -> Result<InputBatch> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let value: JsonValue =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    let JsonValue::Array(records) = value else {
        bail!("{} does not contain a top-level JSON array", path.display());
    };
    debug!(path = %path.display(), records = records.len(), "input read");
    Ok(InputBatch {
        path: path.to_path_buf(),
        sha256,
        records,
    })
}

fn raw_address(raw: &JsonValue) -> Option<&str> {
    raw.get("Address").and_then(JsonValue::as_str)
}

/// Sequential batch driver over one store.
pub struct LoadPipeline<S> {
    store: S,
}

impl<S: Store> LoadPipeline<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    async fn process_one(&mut self, raw: &JsonValue) -> Result<RecordOutcome, StoreError> {
        let record = match validate_record(raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "record rejected by validation");
                return Ok(RecordOutcome::Rejected {
                    stage: RejectStage::Validation,
                    reason: err.to_string(),
                    errors: err.errors,
                });
            }
        };

        let key = record.natural_key();
        if !key.is_complete() {
            warn!(key = %key, "natural key incomplete; duplicates of this record cannot be detected");
        }

        match load_record(&mut self.store, &record).await {
            Ok(LoadOutcome::Inserted { property_id }) => {
                info!(property_id, key = %key, "property inserted");
                Ok(RecordOutcome::Inserted { property_id })
            }
            Ok(LoadOutcome::Skipped { property_id }) => {
                info!(property_id, key = %key, "duplicate property skipped");
                Ok(RecordOutcome::Skipped { property_id })
            }
            Err(err) if err.is_fatal() => {
                error!(error = %err, key = %key, "fatal store error; aborting batch");
                Err(err)
            }
            Err(err) => {
                warn!(error = %err, key = %key, "record rolled back");
                Ok(RecordOutcome::Rejected {
                    stage: RejectStage::Store,
                    reason: err.to_string(),
                    errors: Vec::new(),
                })
            }
        }
    }

    /// Validate and load every record in order. Per-record failures become
    /// `Rejected` outcomes; a fatal store error stops the batch.
    pub async fn process_records(&mut self, records: &[JsonValue]) -> Result<Vec<RecordReport>, StoreError> {
        let mut reports = Vec::with_capacity(records.len());
        for (index, raw) in records.iter().enumerate() {
            let span = info_span!("load_record", index, title = raw_title(raw).unwrap_or("<untitled>"));
            let outcome = self.process_one(raw).instrument(span).await?;
            reports.push(RecordReport {
                index,
                property_title: raw_title(raw).map(ToString::to_string),
                address: raw_address(raw).map(ToString::to_string),
                outcome,
            });
        }
        Ok(reports)
    }

    /// Provision the schema, load the batch and write the run report.
    pub async fn run(&mut self, config: &LoadConfig, input: &InputBatch) -> Result<LoadRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        ensure_schema(&mut self.store, &config.schema_path)
            .await
            .with_context(|| format!("ensuring schema from {}", config.schema_path.display()))?;

        let reports = self
            .process_records(&input.records)
            .await
            .context("load batch aborted")?;
        let tally = LoadTally::from_reports(&reports);
        let finished_at = Utc::now();

        let report_path = config
            .reports_dir
            .join(run_id.to_string())
            .join("load_report.json");
        let summary = LoadRunSummary {
            run_id,
            started_at,
            finished_at,
            input_path: input.path.display().to_string(),
            input_sha256: input.sha256.clone(),
            records_total: input.records.len(),
            inserted: tally.inserted,
            skipped: tally.skipped,
            rejected: tally.rejected,
            report_path: report_path.display().to_string(),
        };
        write_report(&report_path, &summary, &reports).await?;

        info!(
            run_id = %summary.run_id,
            inserted = summary.inserted,
            skipped = summary.skipped,
            rejected = summary.rejected,
            "load complete"
        );
        Ok(summary)
    }
}

async fn write_report(path: &Path, summary: &LoadRunSummary, reports: &[RecordReport]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let body = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "records": reports,
    }))
    .context("serializing load report")?;
    fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn connect(config: &LoadConfig) -> Result<PgStore> {
    let options = config.connect_options()?;
    let mut store = PgStore::connect(&options)
        .await
        .with_context(|| format!("connecting to database {}", config.db_name))?;
    if let Some(schema) = &config.db_schema {
        store
            .use_schema(schema)
            .await
            .with_context(|| format!("switching to schema {schema}"))?;
    }
    Ok(store)
}

pub async fn run_load(config: &LoadConfig) -> Result<LoadRunSummary> {
    let input = read_input(&config.json_path).await?;
    let store = connect(config).await?;
    let mut pipeline = LoadPipeline::new(store);
    let result = pipeline.run(config, &input).await;
    if let Err(err) = pipeline.into_store().close().await {
        warn!(error = %err, "closing database connection failed");
    }
    result
}

pub async fn run_migrate(config: &LoadConfig) -> Result<usize> {
    let mut store = connect(config).await?;
    let result = ensure_schema(&mut store, &config.schema_path)
        .await
        .with_context(|| format!("ensuring schema from {}", config.schema_path.display()));
    if let Err(err) = store.close().await {
        warn!(error = %err, "closing database connection failed");
    }
    result
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub input_path: String,
    pub records_total: usize,
    pub valid: usize,
    pub rejected: Vec<RecordReport>,
}

/// Run the record model over an input file without touching a database.
pub async fn validate_file(path: &Path) -> Result<ValidationSummary> {
    let input = read_input(path).await?;
    let mut rejected = Vec::new();
    for (index, raw) in input.records.iter().enumerate() {
        if let Err(err) = validate_record(raw) {
            warn!(index, title = raw_title(raw).unwrap_or("<untitled>"), error = %err, "record invalid");
            rejected.push(RecordReport {
                index,
                property_title: raw_title(raw).map(ToString::to_string),
                address: raw_address(raw).map(ToString::to_string),
                outcome: RecordOutcome::Rejected {
                    stage: RejectStage::Validation,
                    reason: err.to_string(),
                    errors: err.errors,
                },
            });
        }
    }
    Ok(ValidationSummary {
        input_path: input.path.display().to_string(),
        records_total: input.records.len(),
        valid: input.records.len() - rejected.len(),
        rejected,
    })
}
