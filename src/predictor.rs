//! Trainable CTR predictors.
//!
//! The pipeline only ever sees the [`Predictor`] capability set; the two
//! variants differ in how they learn and how they encode cells, and those
//! differences stay inside each variant. Payloads are versioned JSON so a
//! registered model can be reloaded byte-for-byte by the serving path.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::evaluation::log_loss;
use crate::frame::{FeatureFrame, Value};
use crate::schema::PredictorFlavor;

pub const MODEL_PAYLOAD_VERSION: u32 = 1;

const LOGIT_CLIP: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("predictor has not been trained")]
    NotTrained,
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("feature rows ({rows}) and labels ({labels}) differ in length")]
    LengthMismatch { rows: usize, labels: usize },
    #[error("model payload error: {0}")]
    Payload(String),
    #[error("unsupported model payload version {found}, expected {expected}")]
    PayloadVersion { expected: u32, found: u32 },
}

/// Capability set shared by all predictor variants.
pub trait Predictor: Send + Sync + std::fmt::Debug {
    fn train(
        &mut self,
        x_train: &FeatureFrame,
        y_train: &[f64],
        x_valid: &FeatureFrame,
        y_valid: &[f64],
    ) -> Result<(), PredictorError>;

    /// Click probabilities in [0, 1], one per input row.
    fn predict_proba(&self, x: &FeatureFrame) -> Result<Vec<f64>, PredictorError>;

    /// Persistable payload. Fails with [`PredictorError::NotTrained`]
    /// before a successful `train` or load.
    fn to_bytes(&self) -> Result<Vec<u8>, PredictorError>;
}

pub fn new_predictor(flavor: PredictorFlavor) -> Box<dyn Predictor> {
    match flavor {
        PredictorFlavor::GradientBoosted => Box::new(GradientBoostedPredictor::default()),
        PredictorFlavor::HashedLinear => Box::new(HashedLinearPredictor::default()),
    }
}

pub fn load_predictor(
    flavor: PredictorFlavor,
    bytes: &[u8],
) -> Result<Box<dyn Predictor>, PredictorError> {
    match flavor {
        PredictorFlavor::GradientBoosted => {
            let model: GbdtModel = decode_payload(bytes)?;
            Ok(Box::new(GradientBoostedPredictor {
                params: GbdtParams::default(),
                model: Some(model),
            }))
        }
        PredictorFlavor::HashedLinear => {
            let model: LinearModel = decode_payload(bytes)?;
            Ok(Box::new(HashedLinearPredictor {
                params: HashedLinearParams::default(),
                model: Some(model),
            }))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload<T> {
    format_version: u32,
    model: T,
}

fn encode_payload<T: Serialize>(model: &T) -> Result<Vec<u8>, PredictorError> {
    serde_json::to_vec(&Payload {
        format_version: MODEL_PAYLOAD_VERSION,
        model,
    })
    .map_err(|err| PredictorError::Payload(err.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PredictorError> {
    // The version gate runs before the model body is interpreted, so a
    // future-format payload fails on its version, not on its shape.
    let payload: Payload<serde_json::Value> =
        serde_json::from_slice(bytes).map_err(|err| PredictorError::Payload(err.to_string()))?;
    if payload.format_version != MODEL_PAYLOAD_VERSION {
        return Err(PredictorError::PayloadVersion {
            expected: MODEL_PAYLOAD_VERSION,
            found: payload.format_version,
        });
    }
    serde_json::from_value(payload.model).map_err(|err| PredictorError::Payload(err.to_string()))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// FNV-1a, used by both variants for deterministic cell encoding. The
/// payload must hash identically across processes, which rules out the
/// randomized std hasher.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn check_training_inputs(
    x_train: &FeatureFrame,
    y_train: &[f64],
    x_valid: &FeatureFrame,
    y_valid: &[f64],
) -> Result<(), PredictorError> {
    if x_train.is_empty() {
        return Err(PredictorError::EmptyTrainingSet);
    }
    if x_train.len() != y_train.len() {
        return Err(PredictorError::LengthMismatch {
            rows: x_train.len(),
            labels: y_train.len(),
        });
    }
    if x_valid.len() != y_valid.len() {
        return Err(PredictorError::LengthMismatch {
            rows: x_valid.len(),
            labels: y_valid.len(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Gradient-boosted variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GbdtParams {
    pub num_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub l2_leaf: f64,
}

impl Default for GbdtParams {
    fn default() -> Self {
        Self {
            num_rounds: 10,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 5,
            l2_leaf: 1.0,
        }
    }
}

/// Tree stored as a flat node vector; `value` marks leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeNode {
    feature: usize,
    threshold: f64,
    left: usize,
    right: usize,
    value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<TreeNode>,
}

impl Tree {
    fn eval(&self, row: &[f64]) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            if let Some(value) = node.value {
                return value;
            }
            let Some(feature_value) = row.get(node.feature) else {
                return 0.0;
            };
            idx = if *feature_value <= node.threshold {
                node.left
            } else {
                node.right
            };
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GbdtModel {
    bias: f64,
    trees: Vec<Tree>,
    feature_count: usize,
}

/// Additive model of depth-limited regression trees fit to the logistic
/// loss gradient.
#[derive(Debug)]
pub struct GradientBoostedPredictor {
    params: GbdtParams,
    model: Option<GbdtModel>,
}

impl Default for GradientBoostedPredictor {
    fn default() -> Self {
        Self {
            params: GbdtParams::default(),
            model: None,
        }
    }
}

impl GradientBoostedPredictor {
    pub fn with_params(params: GbdtParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    /// Numeric row encoding: numbers pass through, strings become a
    /// deterministic hash code, nulls the integer fill sentinel.
    fn encode_rows(frame: &FeatureFrame) -> Vec<Vec<f64>> {
        frame
            .rows()
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Value::Int(v) => *v as f64,
                        Value::Float(v) => *v,
                        Value::Str(v) => (fnv1a64(v.as_bytes()) % 1_000_003) as f64,
                        Value::Null => -1.0,
                    })
                    .collect()
            })
            .collect()
    }
}

impl Predictor for GradientBoostedPredictor {
    fn train(
        &mut self,
        x_train: &FeatureFrame,
        y_train: &[f64],
        x_valid: &FeatureFrame,
        y_valid: &[f64],
    ) -> Result<(), PredictorError> {
        check_training_inputs(x_train, y_train, x_valid, y_valid)?;

        let rows = Self::encode_rows(x_train);
        let valid_rows = Self::encode_rows(x_valid);
        let feature_count = x_train.columns().len();

        let prior = (y_train.iter().sum::<f64>() / y_train.len() as f64)
            .clamp(LOGIT_CLIP, 1.0 - LOGIT_CLIP);
        let bias = (prior / (1.0 - prior)).ln();

        let mut scores = vec![bias; rows.len()];
        let mut valid_scores = vec![bias; valid_rows.len()];
        let mut trees = Vec::with_capacity(self.params.num_rounds);

        for round in 0..self.params.num_rounds {
            let mut residuals = Vec::with_capacity(rows.len());
            let mut hessians = Vec::with_capacity(rows.len());
            for (score, y) in scores.iter().zip(y_train) {
                let p = sigmoid(*score);
                residuals.push(y - p);
                hessians.push((p * (1.0 - p)).max(LOGIT_CLIP));
            }

            let tree = fit_tree(&rows, &residuals, &hessians, &self.params);
            for (score, row) in scores.iter_mut().zip(&rows) {
                *score += tree.eval(row);
            }
            for (score, row) in valid_scores.iter_mut().zip(&valid_rows) {
                *score += tree.eval(row);
            }
            trees.push(tree);

            let valid_pred: Vec<f64> = valid_scores.iter().map(|s| sigmoid(*s)).collect();
            debug!(
                component = "predictor",
                event = "predictor.gbdt.round",
                round,
                valid_logloss = log_loss(y_valid, &valid_pred)
            );
        }

        info!(
            component = "predictor",
            event = "predictor.train.finish",
            flavor = "gradient_boosted",
            rounds = trees.len(),
            training_rows = rows.len()
        );
        self.model = Some(GbdtModel {
            bias,
            trees,
            feature_count,
        });
        Ok(())
    }

    fn predict_proba(&self, x: &FeatureFrame) -> Result<Vec<f64>, PredictorError> {
        let model = self.model.as_ref().ok_or(PredictorError::NotTrained)?;
        let rows = Self::encode_rows(x);
        Ok(rows
            .iter()
            .map(|row| {
                let mut score = model.bias;
                for tree in &model.trees {
                    // Columns beyond the trained width never split, so a
                    // wider frame cannot be silently consumed.
                    score += tree.eval(&row[..model.feature_count.min(row.len())]);
                }
                sigmoid(score)
            })
            .collect())
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictorError> {
        let model = self.model.as_ref().ok_or(PredictorError::NotTrained)?;
        encode_payload(model)
    }
}

/// Greedy variance-reduction tree fit on gradient residuals, with
/// Newton-step leaf values.
fn fit_tree(rows: &[Vec<f64>], residuals: &[f64], hessians: &[f64], params: &GbdtParams) -> Tree {
    let mut nodes = Vec::new();
    let indices: Vec<usize> = (0..rows.len()).collect();
    build_node(
        rows, residuals, hessians, params, indices, 0, &mut nodes,
    );
    Tree { nodes }
}

fn build_node(
    rows: &[Vec<f64>],
    residuals: &[f64],
    hessians: &[f64],
    params: &GbdtParams,
    indices: Vec<usize>,
    depth: usize,
    nodes: &mut Vec<TreeNode>,
) -> usize {
    let node_idx = nodes.len();
    nodes.push(TreeNode {
        feature: 0,
        threshold: 0.0,
        left: 0,
        right: 0,
        value: None,
    });

    let split = if depth < params.max_depth && indices.len() >= 2 * params.min_samples_leaf {
        best_split(rows, residuals, &indices, params.min_samples_leaf)
    } else {
        None
    };

    match split {
        Some((feature, threshold)) => {
            let (left, right): (Vec<usize>, Vec<usize>) = indices
                .into_iter()
                .partition(|&idx| rows[idx][feature] <= threshold);
            let left_idx = build_node(rows, residuals, hessians, params, left, depth + 1, nodes);
            let right_idx = build_node(rows, residuals, hessians, params, right, depth + 1, nodes);
            nodes[node_idx].feature = feature;
            nodes[node_idx].threshold = threshold;
            nodes[node_idx].left = left_idx;
            nodes[node_idx].right = right_idx;
        }
        None => {
            let grad_sum: f64 = indices.iter().map(|&idx| residuals[idx]).sum();
            let hess_sum: f64 = indices.iter().map(|&idx| hessians[idx]).sum();
            nodes[node_idx].value =
                Some(params.learning_rate * grad_sum / (hess_sum + params.l2_leaf));
        }
    }
    node_idx
}

fn best_split(
    rows: &[Vec<f64>],
    residuals: &[f64],
    indices: &[usize],
    min_samples_leaf: usize,
) -> Option<(usize, f64)> {
    let feature_count = rows.first().map(|row| row.len()).unwrap_or(0);
    let total_sum: f64 = indices.iter().map(|&idx| residuals[idx]).sum();
    let total_count = indices.len() as f64;
    let parent_score = total_sum * total_sum / total_count;

    let mut best: Option<(usize, f64, f64)> = None;
    for feature in 0..feature_count {
        let mut ordered: Vec<(f64, f64)> = indices
            .iter()
            .map(|&idx| (rows[idx][feature], residuals[idx]))
            .collect();
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut left_sum = 0.0;
        for (pos, (value, residual)) in ordered.iter().enumerate() {
            left_sum += residual;
            let left_count = pos + 1;
            let right_count = ordered.len() - left_count;
            if left_count < min_samples_leaf.max(1) || right_count < min_samples_leaf.max(1) {
                continue;
            }
            // Only cut between distinct values.
            if ordered[pos + 1].0 <= *value {
                continue;
            }

            let right_sum = total_sum - left_sum;
            let gain = left_sum * left_sum / left_count as f64
                + right_sum * right_sum / right_count as f64
                - parent_score;
            if gain > 1e-12 && best.map(|(_, _, g)| gain > g).unwrap_or(true) {
                let threshold = (value + ordered[pos + 1].0) / 2.0;
                best = Some((feature, threshold, gain));
            }
        }
    }
    best.map(|(feature, threshold, _)| (feature, threshold))
}

// ---------------------------------------------------------------------------
// Hashed-linear variant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HashedLinearParams {
    pub hash_bits: u32,
    pub epochs: usize,
    pub learning_rate: f64,
    /// L2 strengths tried against the validation split; the best by
    /// validation log-loss wins.
    pub alpha_grid: Vec<f64>,
}

impl Default for HashedLinearParams {
    fn default() -> Self {
        Self {
            hash_bits: 18,
            epochs: 10,
            learning_rate: 0.05,
            alpha_grid: vec![1e-6, 1e-5, 1e-4],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearModel {
    hash_bits: u32,
    bias: f64,
    weights: std::collections::HashMap<u32, f64>,
    alpha: f64,
}

/// Logistic regression over hashed feature tokens. Every (column, rendered
/// value) pair is one token hashed into a 2^hash_bits bucket space, so the
/// same value in two different columns lands in different buckets; the
/// hashing step is internal to this variant and invisible to the pipeline.
#[derive(Debug)]
pub struct HashedLinearPredictor {
    params: HashedLinearParams,
    model: Option<LinearModel>,
}

impl Default for HashedLinearPredictor {
    fn default() -> Self {
        Self {
            params: HashedLinearParams::default(),
            model: None,
        }
    }
}

impl HashedLinearPredictor {
    pub fn with_params(params: HashedLinearParams) -> Self {
        Self {
            params,
            model: None,
        }
    }

    fn hash_rows(frame: &FeatureFrame, hash_bits: u32) -> Vec<Vec<u32>> {
        let mask = (1u64 << hash_bits) - 1;
        let columns = frame.columns();
        frame
            .rows()
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row)
                    .map(|(column, cell)| {
                        let token = format!("{column}={}", cell.render());
                        (fnv1a64(token.as_bytes()) & mask) as u32
                    })
                    .collect()
            })
            .collect()
    }

    fn fit_weights(
        hashed: &[Vec<u32>],
        labels: &[f64],
        params: &HashedLinearParams,
        alpha: f64,
    ) -> LinearModel {
        let mut weights: std::collections::HashMap<u32, f64> = std::collections::HashMap::new();
        let mut bias = 0.0;
        for _ in 0..params.epochs {
            for (row, y) in hashed.iter().zip(labels) {
                let score: f64 = bias + row.iter().map(|idx| weights.get(idx).unwrap_or(&0.0)).sum::<f64>();
                let error = sigmoid(score) - y;
                for idx in row {
                    let weight = weights.entry(*idx).or_insert(0.0);
                    *weight -= params.learning_rate * (error + alpha * *weight);
                }
                bias -= params.learning_rate * error;
            }
        }
        LinearModel {
            hash_bits: params.hash_bits,
            bias,
            weights,
            alpha,
        }
    }

    fn predict_with(model: &LinearModel, hashed: &[Vec<u32>]) -> Vec<f64> {
        hashed
            .iter()
            .map(|row| {
                let score: f64 = model.bias
                    + row
                        .iter()
                        .map(|idx| model.weights.get(idx).unwrap_or(&0.0))
                        .sum::<f64>();
                sigmoid(score)
            })
            .collect()
    }
}

impl Predictor for HashedLinearPredictor {
    fn train(
        &mut self,
        x_train: &FeatureFrame,
        y_train: &[f64],
        x_valid: &FeatureFrame,
        y_valid: &[f64],
    ) -> Result<(), PredictorError> {
        check_training_inputs(x_train, y_train, x_valid, y_valid)?;

        let hashed_train = Self::hash_rows(x_train, self.params.hash_bits);
        let hashed_valid = Self::hash_rows(x_valid, self.params.hash_bits);

        let mut best: Option<(f64, LinearModel)> = None;
        for &alpha in &self.params.alpha_grid {
            let candidate = Self::fit_weights(&hashed_train, y_train, &self.params, alpha);
            let score = log_loss(y_valid, &Self::predict_with(&candidate, &hashed_valid));
            debug!(
                component = "predictor",
                event = "predictor.linear.alpha_trial",
                alpha,
                valid_logloss = score
            );
            if best.as_ref().map(|(s, _)| score < *s).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }

        let (best_score, model) = best.ok_or(PredictorError::EmptyTrainingSet)?;
        info!(
            component = "predictor",
            event = "predictor.train.finish",
            flavor = "hashed_linear",
            alpha = model.alpha,
            valid_logloss = best_score,
            training_rows = hashed_train.len()
        );
        self.model = Some(model);
        Ok(())
    }

    fn predict_proba(&self, x: &FeatureFrame) -> Result<Vec<f64>, PredictorError> {
        let model = self.model.as_ref().ok_or(PredictorError::NotTrained)?;
        let hashed = Self::hash_rows(x, model.hash_bits);
        Ok(Self::predict_with(model, &hashed))
    }

    fn to_bytes(&self) -> Result<Vec<u8>, PredictorError> {
        let model = self.model.as_ref().ok_or(PredictorError::NotTrained)?;
        encode_payload(model)
    }
}
