use std::path::PathBuf;

use chrono::Utc;
use ctrp::{
    init_logging, log_app_start, model_spec, parse_timestamp, run_training, ArtifactStore,
    EventStore, LoggingConfig, ModelRegistry,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = LoggingConfig::from_env();
    init_logging(&logging_cfg)?;
    log_app_start("train", &logging_cfg);

    let model_name =
        std::env::var("CTRP_MODEL_NAME").unwrap_or_else(|_| "hashed_linear_ctr".to_string());
    let spec = model_spec(&model_name)
        .ok_or_else(|| format!("unknown model name: {model_name}"))?;

    let now = Utc::now();
    let to_datetime = match std::env::var("CTRP_TO_DATETIME") {
        Ok(raw) => parse_timestamp("CTRP_TO_DATETIME", &raw)?,
        Err(_) => now,
    };

    let events = EventStore::open(&env_path("CTRP_EVENT_STORE", "data/events.sqlite"))?;
    let registry = ModelRegistry::open(&env_path("CTRP_REGISTRY", "data/registry.sqlite"))?;
    let artifacts = ArtifactStore::open(&env_path("CTRP_ARTIFACT_ROOT", "artifact"));

    let outcome = run_training(&events, &registry, &artifacts, &spec, to_datetime, now)?;

    println!(
        "Training run {} finished | model={} promoted={} baseline={} test_logloss={:.6} \
         test_auc={:.6} artifacts={}",
        outcome.version,
        spec.name,
        outcome.promoted,
        outcome.baseline_version.as_deref().unwrap_or("<none>"),
        outcome.test_metrics.logloss,
        outcome.test_metrics.auc,
        outcome.artifact_prefix
    );
    Ok(())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
