//! Declarative feature schema descriptors, coercion, and model specs.
//!
//! A descriptor is plain data (name, dtype, fill value) so the exact
//! schema a model was trained with can be serialized into its run
//! metadata and diffed across versions. Coercion fills nulls first and
//! casts second: sentinel fills only become valid once the column has a
//! concrete type.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::frame::{FeatureFrame, FrameError, Value};

pub const SCHEMA_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    Int,
    Float,
    Str,
}

/// How one column is coerced: null fill first, then cast to `dtype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub dtype: DType,
    pub fill: Value,
}

impl FieldSchema {
    pub fn int(name: &str, fill: i64) -> Self {
        Self {
            name: name.to_string(),
            dtype: DType::Int,
            fill: Value::Int(fill),
        }
    }

    pub fn str(name: &str, fill: &str) -> Self {
        Self {
            name: name.to_string(),
            dtype: DType::Str,
            fill: Value::Str(fill.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("cannot cast '{value}' in column {column} to {dtype:?}")]
    Cast {
        column: String,
        value: String,
        dtype: DType,
    },
}

/// Which learner a model spec trains and loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictorFlavor {
    GradientBoosted,
    HashedLinear,
}

/// Per-model configuration: the full surface the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub flavor: PredictorFlavor,
    pub fields: Vec<FieldSchema>,
    pub target: String,
    pub train_interval_days: i64,
    pub lookback_days: i64,
    pub test_size: f64,
    pub valid_size: f64,
}

/// Built-in model specs, resolved by name.
pub fn model_spec(name: &str) -> Option<ModelSpec> {
    let flavor = match name {
        "gbdt_ctr" => PredictorFlavor::GradientBoosted,
        "hashed_linear_ctr" => PredictorFlavor::HashedLinear,
        _ => return None,
    };
    Some(ModelSpec {
        name: name.to_string(),
        flavor,
        fields: ctr_fields(),
        target: "is_click".to_string(),
        train_interval_days: 28,
        lookback_days: 7,
        test_size: 0.2,
        valid_size: 0.1,
    })
}

fn ctr_fields() -> Vec<FieldSchema> {
    vec![
        FieldSchema::int("impression_hour", -1),
        FieldSchema::int("impression_day", -1),
        FieldSchema::int("impression_weekday", -1),
        FieldSchema::int("user_id", -1),
        FieldSchema::int("app_code", -1),
        FieldSchema::str("os_version", "null"),
        FieldSchema::int("is_4g", -1),
        FieldSchema::int("previous_impression_count", -1),
        FieldSchema::int("previous_view_count", -1),
        FieldSchema::int("item_id", -1),
        FieldSchema::str("device_type", "null"),
        FieldSchema::int("item_price", -1),
        FieldSchema::int("category_1", -1),
        FieldSchema::int("category_2", -1),
        FieldSchema::int("category_3", -1),
        FieldSchema::int("product_type", -1),
    ]
}

/// Coerces the frame in place, descriptor by descriptor. A descriptor
/// naming a column the frame lacks synthesizes it as all-null first.
/// Columns not named by any descriptor are left untouched.
pub fn apply_schema(frame: &mut FeatureFrame, fields: &[FieldSchema]) -> Result<(), SchemaError> {
    for field in fields {
        if !frame.has_column(&field.name) {
            frame.push_null_column(&field.name)?;
        }
        let values = frame.column_values(&field.name)?;
        for (row, value) in values.into_iter().enumerate() {
            let filled = if value.is_null() {
                field.fill.clone()
            } else {
                value
            };
            let cast = cast_value(&field.name, filled, field.dtype)?;
            frame.set_value(row, &field.name, cast)?;
        }
    }
    Ok(())
}

/// The final feature matrix: descriptor columns only, in descriptor order.
pub fn select_columns(
    frame: &FeatureFrame,
    fields: &[FieldSchema],
) -> Result<FeatureFrame, SchemaError> {
    let mut out = FeatureFrame::new(
        fields.iter().map(|field| field.name.clone()).collect(),
    )?;
    let columns: Result<Vec<Vec<Value>>, FrameError> = fields
        .iter()
        .map(|field| frame.column_values(&field.name))
        .collect();
    let columns = columns?;
    for row in 0..frame.len() {
        out.push_row(columns.iter().map(|column| column[row].clone()).collect())?;
    }
    Ok(out)
}

/// Deterministic digest of a descriptor list, recorded in run metadata so
/// training and serving schemas can be compared exactly.
pub fn schema_fingerprint(fields: &[FieldSchema]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEMA_FORMAT_VERSION.to_be_bytes());
    for field in fields {
        hasher.update(field.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}", field.dtype).as_bytes());
        hasher.update([0u8]);
        hasher.update(field.fill.render().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn cast_value(column: &str, value: Value, dtype: DType) -> Result<Value, SchemaError> {
    let fail = |value: &Value| SchemaError::Cast {
        column: column.to_string(),
        value: value.render(),
        dtype,
    };
    match dtype {
        DType::Int => match &value {
            Value::Int(_) => Ok(value),
            Value::Float(v) => Ok(Value::Int(*v as i64)),
            Value::Str(raw) => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| fail(&value)),
            Value::Null => Err(fail(&value)),
        },
        DType::Float => match &value {
            Value::Float(_) => Ok(value),
            Value::Int(v) => Ok(Value::Float(*v as f64)),
            Value::Str(raw) => raw
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| fail(&value)),
            Value::Null => Err(fail(&value)),
        },
        DType::Str => match value {
            Value::Str(_) => Ok(value),
            Value::Int(v) => Ok(Value::Str(v.to_string())),
            Value::Float(v) => Ok(Value::Str(v.to_string())),
            Value::Null => Err(fail(&Value::Null)),
        },
    }
}
