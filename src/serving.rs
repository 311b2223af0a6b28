//! Online predict endpoint and its startup state loader.
//!
//! The serving path is the trimmed tail of the training path: fetch the
//! precomputed windowed aggregates, decompose the request timestamp, and
//! coerce through the exact schema the model was trained with. One
//! request shares nothing with another beyond the immutable predictor
//! and the mutex-guarded feature-store connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::feature_store::{OnlineFeatureStore, UserFeatureRow};
use crate::features::add_time_features;
use crate::frame::{FeatureFrame, Value};
use crate::predictor::{load_predictor, Predictor, PredictorError};
use crate::registry::{ModelRegistry, RegistryError};
use crate::schema::{apply_schema, model_spec, select_columns, ModelSpec};

/// One inbound ad request, label-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequest {
    pub impression_id: String,
    pub logged_at: String,
    pub user_id: i64,
    pub app_code: i64,
    pub os_version: String,
    pub is_4g: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub model: String,
    pub prediction: f64,
}

#[derive(Debug, Error)]
pub enum ServingError {
    #[error("unknown model name {0}")]
    UnknownModel(String),
    #[error("no registered version for model {0}")]
    NoRegisteredModel(String),
    #[error("registry has {model} version {version} but no resolvable storage key")]
    MissingStorageKey { model: String, version: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error(transparent)]
    FeatureStore(#[from] crate::feature_store::FeatureStoreError),
}

#[derive(Debug, Clone)]
pub struct ServingConfig {
    pub model_name: String,
    /// `None` pins nothing: the registry's latest version is loaded.
    pub model_version: Option<String>,
    /// `None` reads the newest materialized feature rows per user.
    pub feature_version: Option<String>,
}

#[derive(Debug)]
pub struct ServingState {
    spec: ModelSpec,
    model_version: String,
    feature_version: Option<String>,
    predictor: Box<dyn Predictor>,
    feature_store: Mutex<OnlineFeatureStore>,
}

impl ServingState {
    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Resolves and loads everything the endpoint needs. Any failure here is
/// a startup error: the server must not come up without a servable model.
pub fn load_serving_state(
    registry: &ModelRegistry,
    artifacts: &ArtifactStore,
    feature_store_path: &Path,
    config: &ServingConfig,
) -> Result<ServingState, ServingError> {
    let spec = model_spec(&config.model_name)
        .ok_or_else(|| ServingError::UnknownModel(config.model_name.clone()))?;

    let model_version = match &config.model_version {
        Some(version) => version.clone(),
        None => registry
            .latest_version(&spec.name)?
            .ok_or_else(|| ServingError::NoRegisteredModel(spec.name.clone()))?,
    };
    let storage_key = registry
        .storage_key(&spec.name, &model_version)?
        .ok_or_else(|| ServingError::MissingStorageKey {
            model: spec.name.clone(),
            version: model_version.clone(),
        })?;
    let predictor = load_predictor(spec.flavor, &artifacts.get_bytes(&storage_key)?)?;
    let feature_store = OnlineFeatureStore::open(feature_store_path)?;

    info!(
        component = "serving",
        event = "serving.state.loaded",
        model = %spec.name,
        model_version = %model_version,
        feature_version = config.feature_version.as_deref().unwrap_or("latest"),
        storage_key = %storage_key
    );

    Ok(ServingState {
        spec,
        model_version,
        feature_version: config.feature_version.clone(),
        predictor,
        feature_store: Mutex::new(feature_store),
    })
}

pub fn predict_router(state: Arc<ServingState>) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/healthcheck", get(healthcheck))
        .with_state(state)
}

async fn healthcheck() -> impl IntoResponse {
    Json(serde_json::json!({ "health": "ok" }))
}

async fn predict(
    State(state): State<Arc<ServingState>>,
    Json(request): Json<AdRequest>,
) -> Result<Json<PredictResponse>, (StatusCode, Json<serde_json::Value>)> {
    let user_feature = fetch_user_feature(&state, request.user_id);
    let mut frame = request_frame(&request, user_feature.as_ref())
        .map_err(|message| error_response(StatusCode::INTERNAL_SERVER_ERROR, message))?;

    // An unparseable timestamp is the client's fault, nothing else is.
    add_time_features(&mut frame, "logged_at").map_err(|err| {
        error_response(StatusCode::BAD_REQUEST, err.to_string())
    })?;

    apply_schema(&mut frame, &state.spec.fields)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let matrix = select_columns(&frame, &state.spec.fields)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let predictions = state
        .predictor
        .predict_proba(&matrix)
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    let prediction = predictions.first().copied().ok_or_else(|| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "predictor returned no rows".to_string(),
        )
    })?;

    info!(
        component = "serving",
        event = "serving.prediction",
        impression_id = %request.impression_id,
        user_id = request.user_id,
        model = %state.spec.name,
        model_version = %state.model_version,
        feature_version = state.feature_version.as_deref().unwrap_or("latest"),
        prediction
    );

    Ok(Json(PredictResponse {
        model: state.spec.name.clone(),
        prediction,
    }))
}

/// Best-effort aggregate lookup: a store error degrades to "no features",
/// the coercion step fills the gaps with the schema's sentinels.
fn fetch_user_feature(state: &ServingState, user_id: i64) -> Option<UserFeatureRow> {
    let store = state
        .feature_store
        .lock()
        .expect("feature store lock should not be poisoned");
    match store.get_latest_or_versioned(user_id, state.feature_version.as_deref()) {
        Ok(row) => row,
        Err(err) => {
            warn!(
                component = "serving",
                event = "serving.feature_lookup.failed",
                user_id,
                error = %err
            );
            None
        }
    }
}

fn request_frame(
    request: &AdRequest,
    user_feature: Option<&UserFeatureRow>,
) -> Result<FeatureFrame, String> {
    let opt_int = |value: Option<i64>| value.map(Value::Int).unwrap_or(Value::Null);
    let opt_str = |value: Option<&String>| {
        value
            .map(|v| Value::Str(v.clone()))
            .unwrap_or(Value::Null)
    };

    let mut frame = FeatureFrame::new(
        [
            "impression_id",
            "logged_at",
            "user_id",
            "app_code",
            "os_version",
            "is_4g",
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
    .map_err(|err| err.to_string())?;

    frame
        .push_row(vec![
            Value::Str(request.impression_id.clone()),
            Value::Str(request.logged_at.clone()),
            Value::Int(request.user_id),
            Value::Int(request.app_code),
            Value::Str(request.os_version.clone()),
            Value::Int(request.is_4g),
            opt_int(user_feature.and_then(|f| f.previous_impression_count)),
            opt_int(user_feature.and_then(|f| f.previous_view_count)),
            opt_int(user_feature.and_then(|f| f.item_id)),
            opt_str(user_feature.and_then(|f| f.device_type.as_ref())),
            opt_int(user_feature.and_then(|f| f.item_price)),
            opt_int(user_feature.and_then(|f| f.category_1)),
            opt_int(user_feature.and_then(|f| f.category_2)),
            opt_int(user_feature.and_then(|f| f.category_3)),
            opt_int(user_feature.and_then(|f| f.product_type)),
        ])
        .map_err(|err| err.to_string())?;
    Ok(frame)
}

fn error_response(
    status: StatusCode,
    message: String,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_without_features_leaves_aggregates_null() {
        let request = AdRequest {
            impression_id: "imp-1".to_string(),
            logged_at: "2023-01-01 10:00:00".to_string(),
            user_id: 101,
            app_code: 7,
            os_version: "latest".to_string(),
            is_4g: 1,
        };
        let frame = request_frame(&request, None).unwrap();
        assert_eq!(frame.len(), 1);
        assert!(frame.value(0, "previous_view_count").unwrap().is_null());
        assert!(frame.value(0, "device_type").unwrap().is_null());
        assert_eq!(frame.value(0, "user_id").unwrap(), &Value::Int(101));
    }

    #[test]
    fn request_frame_carries_fetched_aggregates() {
        let request = AdRequest {
            impression_id: "imp-1".to_string(),
            logged_at: "2023-01-01 10:00:00".to_string(),
            user_id: 101,
            app_code: 7,
            os_version: "latest".to_string(),
            is_4g: 1,
        };
        let feature = UserFeatureRow {
            user_id: 101,
            version: "v1".to_string(),
            previous_impression_count: Some(2),
            previous_view_count: Some(3),
            item_id: Some(201),
            device_type: Some("android".to_string()),
            item_price: Some(100),
            category_1: Some(1),
            category_2: Some(2),
            category_3: Some(3),
            product_type: Some(4),
            expired_at: 0,
        };
        let frame = request_frame(&request, Some(&feature)).unwrap();
        assert_eq!(
            frame.value(0, "previous_view_count").unwrap(),
            &Value::Int(3)
        );
        assert_eq!(
            frame.value(0, "device_type").unwrap(),
            &Value::Str("android".to_string())
        );
    }
}
