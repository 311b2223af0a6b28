//! CTR prediction pipeline core crate.
//!
//! Implemented scope:
//! - event-log extraction and per-table validation
//! - temporal feature windowing, time decomposition, and assembly
//! - schema coercion and the chronological train/valid/test split
//! - trainable predictors (gradient-boosted, hashed-linear)
//! - held-out evaluation and the model-registry promotion gate
//! - feature-store materialization and the online predict endpoint

mod artifacts;
mod evaluation;
mod events;
mod feature_store;
mod features;
mod frame;
mod observability;
mod pipeline;
mod predictor;
mod registry;
mod schema;
mod serving;
mod split;
mod store;

pub use artifacts::{ArtifactError, ArtifactStore, RunArtifact};
pub use evaluation::{
    beats_baseline, calculate_metrics, calibration_score, log_loss, roc_auc, EvalMetrics,
};
pub use events::{
    format_timestamp, parse_timestamp, validate_impressions, validate_items, validate_views,
    EventError, ImpressionRecord, ItemRecord, ViewRecord, IMPRESSION_TABLE, ITEM_TABLE,
    TIMESTAMP_FORMAT, VIEW_TABLE,
};
pub use feature_store::{FeatureStoreError, OnlineFeatureStore, UserFeatureRow};
pub use features::{
    add_time_features, assemble_impression_features, assemble_training_frame,
    impression_history_counts, time_features, view_history_features, FeatureError, ViewHistory,
};
pub use frame::{FeatureFrame, FrameError, Value};
pub use observability::{
    init_logging, log_app_bind, log_app_start, LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    run_feature_extraction, run_training, FeatureExtractionOutcome, PipelineError, RunContext,
    TrainingOutcome, VERSION_FORMAT,
};
pub use predictor::{
    load_predictor, new_predictor, GbdtParams, GradientBoostedPredictor, HashedLinearParams,
    HashedLinearPredictor, Predictor, PredictorError, MODEL_PAYLOAD_VERSION,
};
pub use registry::{ModelRegistry, RegistryError};
pub use schema::{
    apply_schema, model_spec, schema_fingerprint, select_columns, DType, FieldSchema, ModelSpec,
    PredictorFlavor, SchemaError, SCHEMA_FORMAT_VERSION,
};
pub use serving::{
    load_serving_state, predict_router, AdRequest, PredictResponse, ServingConfig, ServingError,
    ServingState,
};
pub use split::{temporal_split, SplitError};
pub use store::{compose_query, EventStore, StoreError};
