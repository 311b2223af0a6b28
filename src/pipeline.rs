//! Pipeline runs: one training run or one feature-store materialization,
//! end to end.
//!
//! A run is a pure function of its inputs plus the caller-supplied clock
//! value; cross-run state lives only in the registry and the stores. The
//! registry write is the final step of a training run, so any earlier
//! failure leaves no partial entry behind.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::artifacts::{ArtifactError, ArtifactStore, RunArtifact};
use crate::evaluation::{beats_baseline, calculate_metrics, EvalMetrics};
use crate::events::{validate_impressions, validate_items, validate_views, EventError};
use crate::feature_store::{FeatureStoreError, OnlineFeatureStore, UserFeatureRow};
use crate::features::{assemble_impression_features, assemble_training_frame, FeatureError};
use crate::frame::{FeatureFrame, Value};
use crate::predictor::{load_predictor, new_predictor, PredictorError};
use crate::registry::{ModelRegistry, RegistryError};
use crate::schema::{apply_schema, schema_fingerprint, select_columns, ModelSpec, SchemaError};
use crate::split::{temporal_split, SplitError};
use crate::store::{EventStore, StoreError};

pub const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

const FEATURE_EXPIRY_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    FeatureStore(#[from] FeatureStoreError),
    #[error("column {0} missing from the assembled frame")]
    MissingColumn(String),
    #[error("null label in column {column} at row {row}")]
    NullLabel { column: String, row: usize },
    #[error("registry has {model} version {version} but no resolvable storage key")]
    MissingStorageKey { model: String, version: String },
}

/// Immutable per-run identity: derived once from the caller's clock and
/// threaded through artifacts, versions, and metadata.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub job_type: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(job_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_type: job_type.to_string(),
            version: now.format(VERSION_FORMAT).to_string(),
            started_at: now,
        }
    }

    pub fn artifact(&self) -> RunArtifact {
        RunArtifact::new(&self.job_type, &self.version)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub version: String,
    pub promoted: bool,
    pub baseline_version: Option<String>,
    pub train_metrics: EvalMetrics,
    pub test_metrics: EvalMetrics,
    pub model_key: String,
    pub artifact_prefix: String,
}

/// One full training run: extract, validate, assemble, coerce, split,
/// train, evaluate, gate, persist, and (on approval) register.
pub fn run_training(
    events: &EventStore,
    registry: &ModelRegistry,
    artifacts: &ArtifactStore,
    spec: &ModelSpec,
    to_datetime: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<TrainingOutcome, PipelineError> {
    let ctx = RunContext::new(&format!("train/{}", spec.name), now);
    let artifact = ctx.artifact();
    info!(
        component = "pipeline",
        event = "pipeline.train.start",
        model = %spec.name,
        version = %ctx.version,
        to_datetime = %to_datetime,
        train_interval_days = spec.train_interval_days,
        lookback_days = spec.lookback_days
    );

    let (impressions, views, items) = extract_window(events, spec, to_datetime)?;

    let mut frame = assemble_training_frame(&impressions, &views, &items, spec.lookback_days)?;
    apply_schema(&mut frame, &spec.fields)?;
    let preprocessed = frame.clone();

    let (train, valid, test) = temporal_split(&frame, "logged_at", spec.test_size, spec.valid_size)?;
    let x_train = select_columns(&train, &spec.fields)?;
    let x_valid = select_columns(&valid, &spec.fields)?;
    let x_test = select_columns(&test, &spec.fields)?;
    let y_train = labels(&train, &spec.target)?;
    let y_valid = labels(&valid, &spec.target)?;
    let y_test = labels(&test, &spec.target)?;

    let mut predictor = new_predictor(spec.flavor);
    predictor.train(&x_train, &y_train, &x_valid, &y_valid)?;

    let train_metrics = calculate_metrics(&y_train, &predictor.predict_proba(&x_train)?);
    let y_pred = predictor.predict_proba(&x_test)?;
    let test_metrics = calculate_metrics(&y_test, &y_pred);

    let (promoted, baseline_version) =
        promotion_gate(registry, artifacts, spec, &x_test, &y_test, &y_pred)?;

    // The model payload must land before anything can reference its key;
    // everything else about the run is auxiliary.
    let model_key = artifact.key("model.json");
    artifacts.put_bytes(&model_key, &predictor.to_bytes()?)?;

    let metadata = json!({
        "model": spec.name,
        "version": ctx.version,
        "start_time": ctx.started_at.format(crate::events::TIMESTAMP_FORMAT).to_string(),
        "dataset_parameter": {
            "lookback_days": spec.lookback_days,
            "train_interval_days": spec.train_interval_days,
            "test_size": spec.test_size,
            "valid_size": spec.valid_size,
            "to_datetime": crate::events::format_timestamp(to_datetime),
        },
        "features": spec.fields,
        "feature_schema_fingerprint": schema_fingerprint(&spec.fields),
        "metrics": { "train": train_metrics, "test": test_metrics },
        "baseline_version": baseline_version,
        "crate_version": env!("CARGO_PKG_VERSION"),
        "git_branch": std::env::var("CTRP_GIT_BRANCH").ok(),
        "git_commit_hash": std::env::var("CTRP_GIT_COMMIT").ok(),
        "artifact_prefix": artifact.key_prefix(),
        "model_storage_key": model_key,
        "tag": { "target": "ctr prediction" },
    });

    artifacts.put_best_effort(
        &artifact.key("metadata.json"),
        &serde_json::to_vec_pretty(&metadata).unwrap_or_default(),
    );
    artifacts.put_frame_csv_best_effort(&artifact.key("df_preprocessed.csv"), &preprocessed);
    for (name, split_frame) in [("train", &train), ("valid", &valid), ("test", &test)] {
        artifacts.put_frame_csv_best_effort(&artifact.key(&format!("df_{name}.csv")), split_frame);
    }

    if promoted {
        registry.register(&spec.name, &ctx.version, &model_key, &metadata)?;
    }

    info!(
        component = "pipeline",
        event = "pipeline.train.finish",
        model = %spec.name,
        version = %ctx.version,
        promoted,
        test_logloss = test_metrics.logloss
    );

    Ok(TrainingOutcome {
        version: ctx.version,
        promoted,
        baseline_version,
        train_metrics,
        test_metrics,
        model_key,
        artifact_prefix: artifact.key_prefix().to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct FeatureExtractionOutcome {
    pub version: String,
    pub user_count: usize,
    pub row_count: usize,
    pub artifact_prefix: String,
}

/// One feature-store materialization: assemble impression features over
/// the training window, archive the offline CSV, and upsert the latest
/// row per user into the online store.
pub fn run_feature_extraction(
    events: &EventStore,
    artifacts: &ArtifactStore,
    feature_store: &OnlineFeatureStore,
    spec: &ModelSpec,
    to_datetime: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<FeatureExtractionOutcome, PipelineError> {
    let ctx = RunContext::new("feature_extraction", now);
    let artifact = ctx.artifact();
    info!(
        component = "pipeline",
        event = "pipeline.feature_extraction.start",
        version = %ctx.version,
        to_datetime = %to_datetime
    );

    let (impressions, views, items) = extract_window(events, spec, to_datetime)?;
    let frame = assemble_impression_features(&impressions, &views, &items, spec.lookback_days)?;

    artifacts.put_frame_csv_best_effort(&artifact.key("df_feature.csv"), &frame);

    let expired_at = (now + Duration::days(FEATURE_EXPIRY_DAYS)).timestamp();
    let rows = latest_user_rows(&frame, &ctx.version, expired_at)?;
    feature_store.put_rows(&rows)?;

    info!(
        component = "pipeline",
        event = "pipeline.feature_extraction.finish",
        version = %ctx.version,
        user_count = rows.len(),
        row_count = frame.len()
    );

    Ok(FeatureExtractionOutcome {
        version: ctx.version,
        user_count: rows.len(),
        row_count: frame.len(),
        artifact_prefix: artifact.key_prefix().to_string(),
    })
}

fn extract_window(
    events: &EventStore,
    spec: &ModelSpec,
    to_datetime: DateTime<Utc>,
) -> Result<
    (
        Vec<crate::events::ImpressionRecord>,
        Vec<crate::events::ViewRecord>,
        Vec<crate::events::ItemRecord>,
    ),
    PipelineError,
> {
    let impressions = events.extract_impressions(
        Some(to_datetime - Duration::days(spec.train_interval_days)),
        Some(to_datetime),
    )?;
    // Views reach further back so the earliest impressions still see a
    // full lookback window.
    let views = events.extract_views(
        Some(to_datetime - Duration::days(spec.train_interval_days + spec.lookback_days)),
        Some(to_datetime),
    )?;
    let items = events.extract_items()?;

    validate_impressions(&impressions)?;
    validate_views(&views)?;
    validate_items(&items)?;
    Ok((impressions, views, items))
}

fn promotion_gate(
    registry: &ModelRegistry,
    artifacts: &ArtifactStore,
    spec: &ModelSpec,
    x_test: &FeatureFrame,
    y_test: &[f64],
    y_pred: &[f64],
) -> Result<(bool, Option<String>), PipelineError> {
    let Some(baseline_version) = registry.latest_version(&spec.name)? else {
        info!(
            component = "pipeline",
            event = "pipeline.gate.no_baseline",
            model = %spec.name
        );
        return Ok((true, None));
    };

    let storage_key = registry
        .storage_key(&spec.name, &baseline_version)?
        .ok_or_else(|| PipelineError::MissingStorageKey {
            model: spec.name.clone(),
            version: baseline_version.clone(),
        })?;
    let baseline = load_predictor(spec.flavor, &artifacts.get_bytes(&storage_key)?)?;
    let y_baseline = baseline.predict_proba(x_test)?;

    let promoted = beats_baseline(y_pred, &y_baseline, y_test);
    info!(
        component = "pipeline",
        event = "pipeline.gate.decision",
        model = %spec.name,
        baseline_version = %baseline_version,
        promoted
    );
    Ok((promoted, Some(baseline_version)))
}

fn labels(frame: &FeatureFrame, target: &str) -> Result<Vec<f64>, PipelineError> {
    let values = frame
        .column_values(target)
        .map_err(|_| PipelineError::MissingColumn(target.to_string()))?;
    values
        .iter()
        .enumerate()
        .map(|(row, value)| {
            value
                .as_float()
                .ok_or_else(|| PipelineError::NullLabel {
                    column: target.to_string(),
                    row,
                })
        })
        .collect()
}

/// Latest assembled row per user, keyed for the online store. Strictly
/// newer timestamps win, so among equal timestamps the earliest-logged
/// row is kept.
fn latest_user_rows(
    frame: &FeatureFrame,
    version: &str,
    expired_at: i64,
) -> Result<Vec<UserFeatureRow>, PipelineError> {
    let column = |name: &str| {
        frame
            .column_index(name)
            .ok_or_else(|| PipelineError::MissingColumn(name.to_string()))
    };
    let user_idx = column("user_id")?;
    let logged_at_idx = column("logged_at")?;
    let columns = [
        column("previous_impression_count")?,
        column("previous_view_count")?,
        column("item_id")?,
        column("device_type")?,
        column("item_price")?,
        column("category_1")?,
        column("category_2")?,
        column("category_3")?,
        column("product_type")?,
    ];

    let mut latest: std::collections::HashMap<i64, (String, &Vec<Value>)> =
        std::collections::HashMap::new();
    for row in frame.rows() {
        let Some(user_id) = row[user_idx].as_int() else {
            continue;
        };
        let logged_at = row[logged_at_idx].render();
        let newer = match latest.get(&user_id) {
            Some((existing, _)) => logged_at > *existing,
            None => true,
        };
        if newer {
            latest.insert(user_id, (logged_at, row));
        }
    }

    let mut user_ids: Vec<i64> = latest.keys().copied().collect();
    user_ids.sort_unstable();
    Ok(user_ids
        .into_iter()
        .map(|user_id| {
            let (_, row) = &latest[&user_id];
            UserFeatureRow {
                user_id,
                version: version.to_string(),
                previous_impression_count: row[columns[0]].as_int(),
                previous_view_count: row[columns[1]].as_int(),
                item_id: row[columns[2]].as_int(),
                device_type: row[columns[3]].as_str().map(str::to_string),
                item_price: row[columns[4]].as_int(),
                category_1: row[columns[5]].as_int(),
                category_2: row[columns[6]].as_int(),
                category_3: row[columns[7]].as_int(),
                product_type: row[columns[8]].as_int(),
                expired_at,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_timestamp;

    fn ts(raw: &str) -> DateTime<Utc> {
        parse_timestamp("test", raw).unwrap()
    }

    #[test]
    fn run_context_version_is_the_compact_timestamp() {
        let ctx = RunContext::new("train/gbdt_ctr", ts("2023-01-05 14:30:09"));
        assert_eq!(ctx.version, "20230105143009");
        assert_eq!(ctx.artifact().key_prefix(), "train/gbdt_ctr/20230105143009");
    }

    #[test]
    fn labels_reject_null_cells() {
        let mut frame = crate::frame::FeatureFrame::new(vec!["is_click".to_string()]).unwrap();
        frame.push_row(vec![Value::Int(1)]).unwrap();
        frame.push_row(vec![Value::Null]).unwrap();
        let err = labels(&frame, "is_click").unwrap_err();
        assert!(matches!(err, PipelineError::NullLabel { row: 1, .. }));
    }

    #[test]
    fn latest_user_rows_keep_the_newest_timestamp_per_user() {
        let mut frame = crate::frame::FeatureFrame::new(
            [
                "user_id",
                "logged_at",
                "previous_impression_count",
                "previous_view_count",
                "item_id",
                "device_type",
                "item_price",
                "category_1",
                "category_2",
                "category_3",
                "product_type",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
        )
        .unwrap();
        let push = |frame: &mut crate::frame::FeatureFrame, user: i64, ts: &str, views: i64| {
            frame
                .push_row(vec![
                    Value::Int(user),
                    Value::Str(ts.to_string()),
                    Value::Null,
                    Value::Int(views),
                    Value::Int(201),
                    Value::Str("android".to_string()),
                    Value::Int(100),
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                    Value::Int(4),
                ])
                .unwrap();
        };
        push(&mut frame, 101, "2023-01-01 10:00:00", 1);
        push(&mut frame, 101, "2023-01-03 10:00:00", 5);
        push(&mut frame, 102, "2023-01-02 10:00:00", 2);

        let rows = latest_user_rows(&frame, "v1", 123).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, 101);
        assert_eq!(rows[0].previous_view_count, Some(5));
        assert_eq!(rows[0].previous_impression_count, None);
        assert_eq!(rows[1].user_id, 102);
        assert_eq!(rows[1].expired_at, 123);
    }
}
