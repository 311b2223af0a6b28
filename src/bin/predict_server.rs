use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use ctrp::{
    init_logging, load_serving_state, log_app_bind, log_app_start, predict_router, ArtifactStore,
    LoggingConfig, ModelRegistry, ServingConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = LoggingConfig::from_env();
    init_logging(&logging_cfg)?;
    log_app_start("predict_server", &logging_cfg);

    let config = ServingConfig {
        model_name: std::env::var("CTRP_MODEL_NAME")
            .unwrap_or_else(|_| "hashed_linear_ctr".to_string()),
        model_version: env_version("CTRP_MODEL_VERSION"),
        feature_version: env_version("CTRP_FEATURE_VERSION"),
    };

    let registry = ModelRegistry::open(&env_path("CTRP_REGISTRY", "data/registry.sqlite"))?;
    let artifacts = ArtifactStore::open(&env_path("CTRP_ARTIFACT_ROOT", "artifact"));
    let feature_store_path = env_path("CTRP_FEATURE_STORE", "data/features.sqlite");

    // A server without a loadable model must not come up at all.
    let state = load_serving_state(&registry, &artifacts, &feature_store_path, &config)?;
    println!(
        "Serving model {} version {}",
        config.model_name,
        state.model_version()
    );

    let addr: SocketAddr = std::env::var("CTRP_PREDICT_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let app = predict_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind("predict_server", bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// "latest" and unset both mean "resolve at startup".
fn env_version(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|raw| !raw.is_empty() && !raw.eq_ignore_ascii_case("latest"))
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
