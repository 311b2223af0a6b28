//! Temporal feature windowing, time decomposition, and feature assembly.
//!
//! Every windowed aggregate is computed over events strictly before the
//! impression it describes; timestamp ties never contribute. The lookback
//! bound compares whole elapsed days, truncated toward zero, and is
//! inclusive of `lookback_days` itself.

use std::collections::HashMap;

use chrono::{Datelike, Timelike};
use thiserror::Error;
use tracing::info;

use crate::events::{format_timestamp, ImpressionRecord, ItemRecord, ViewRecord};
use crate::frame::{FeatureFrame, FrameError, Value};

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unparseable timestamp '{value}' in column {column}")]
    InvalidTimestamp { column: String, value: String },
    #[error("lookback_days must be >= 0, got {0}")]
    InvalidLookback(i64),
}

/// Windowed view aggregates for one impression.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewHistory {
    pub count: i64,
    pub item_id: i64,
    pub device_type: String,
}

/// Counts, per impression, the same user's other impressions strictly
/// before it and within the lookback window. Impressions with no
/// qualifying prior event are absent from the map (the null case).
pub fn impression_history_counts(
    impressions: &[ImpressionRecord],
    lookback_days: i64,
) -> Result<HashMap<String, i64>, FeatureError> {
    check_lookback(lookback_days)?;

    let mut by_user: HashMap<i64, Vec<usize>> = HashMap::new();
    for (idx, impression) in impressions.iter().enumerate() {
        by_user.entry(impression.user_id).or_default().push(idx);
    }

    let mut counts = HashMap::new();
    for indices in by_user.values() {
        for &current_idx in indices {
            let current = &impressions[current_idx];
            let mut count = 0i64;
            for &other_idx in indices {
                if other_idx == current_idx {
                    continue;
                }
                let other = &impressions[other_idx];
                if in_lookback_window(current, other.logged_at, lookback_days) {
                    count += 1;
                }
            }
            if count > 0 {
                counts.insert(current.impression_id.clone(), count);
            }
        }
    }
    Ok(counts)
}

/// Per-impression prior-view aggregates: count of qualifying views plus
/// the item and device of the last qualifying view in log order. Views
/// are first collapsed one-per-(user, timestamp), keeping the
/// later-logged occurrence.
pub fn view_history_features(
    impressions: &[ImpressionRecord],
    views: &[ViewRecord],
    lookback_days: i64,
) -> Result<HashMap<String, ViewHistory>, FeatureError> {
    check_lookback(lookback_days)?;

    let deduped = dedup_views(views);
    let mut by_user: HashMap<i64, Vec<&ViewRecord>> = HashMap::new();
    for view in deduped {
        by_user.entry(view.user_id).or_default().push(view);
    }

    let mut features = HashMap::new();
    for impression in impressions {
        let Some(user_views) = by_user.get(&impression.user_id) else {
            continue;
        };

        let mut count = 0i64;
        let mut last: Option<&ViewRecord> = None;
        for view in user_views.iter().copied() {
            if in_lookback_window(impression, view.logged_at, lookback_days) {
                count += 1;
                last = Some(view);
            }
        }

        if let Some(view) = last {
            features.insert(
                impression.impression_id.clone(),
                ViewHistory {
                    count,
                    item_id: view.item_id,
                    device_type: view.device_type.clone(),
                },
            );
        }
    }
    Ok(features)
}

/// Calendar-relative fields of an impression timestamp:
/// hour [0,23], day-of-month [1,31], weekday [0=Monday..6=Sunday].
pub fn time_features(impression: &ImpressionRecord) -> (i64, i64, i64) {
    decompose(impression.logged_at)
}

/// Full training-time assembly: impressions left-joined with time
/// decomposition, windowed aggregates, and the item dimension, one output
/// row per input impression.
pub fn assemble_training_frame(
    impressions: &[ImpressionRecord],
    views: &[ViewRecord],
    items: &[ItemRecord],
    lookback_days: i64,
) -> Result<FeatureFrame, FeatureError> {
    info!(
        component = "features",
        event = "features.assemble.start",
        impression_count = impressions.len(),
        view_count = views.len(),
        item_count = items.len(),
        lookback_days
    );

    let base = impression_frame(impressions)?;
    let joined = base.left_join_unique(&time_frame(impressions)?, "impression_id", "_time")?;
    let joined = join_history_features(joined, impressions, views, lookback_days)?;
    let joined = joined.left_join_unique(&item_frame(items)?, "item_id", "_item")?;

    info!(
        component = "features",
        event = "features.assemble.finish",
        row_count = joined.len(),
        column_count = joined.columns().len()
    );
    Ok(joined)
}

/// Assembly without time decomposition, used when materializing the
/// feature stores; time fields are recomputed from `logged_at` at the
/// point of use.
pub fn assemble_impression_features(
    impressions: &[ImpressionRecord],
    views: &[ViewRecord],
    items: &[ItemRecord],
    lookback_days: i64,
) -> Result<FeatureFrame, FeatureError> {
    let base = impression_frame(impressions)?;
    let joined = join_history_features(base, impressions, views, lookback_days)?;
    let joined = joined.left_join_unique(&item_frame(items)?, "item_id", "_item")?;
    Ok(joined)
}

/// Serving-path time decomposition: derives the three time columns from a
/// timestamp column already present in the frame.
pub fn add_time_features(frame: &mut FeatureFrame, time_column: &str) -> Result<(), FeatureError> {
    let raw_values = frame.column_values(time_column)?;
    let mut decomposed = Vec::with_capacity(raw_values.len());
    for value in &raw_values {
        let raw = value.as_str().unwrap_or_default();
        let ts = crate::events::parse_timestamp("request", raw).map_err(|_| {
            FeatureError::InvalidTimestamp {
                column: time_column.to_string(),
                value: value.render(),
            }
        })?;
        decomposed.push(decompose(ts));
    }

    frame.push_null_column("impression_hour")?;
    frame.push_null_column("impression_day")?;
    frame.push_null_column("impression_weekday")?;
    for (row, (hour, day, weekday)) in decomposed.into_iter().enumerate() {
        frame.set_value(row, "impression_hour", Value::Int(hour))?;
        frame.set_value(row, "impression_day", Value::Int(day))?;
        frame.set_value(row, "impression_weekday", Value::Int(weekday))?;
    }
    Ok(())
}

fn decompose(ts: chrono::DateTime<chrono::Utc>) -> (i64, i64, i64) {
    (
        ts.hour() as i64,
        ts.day() as i64,
        ts.weekday().num_days_from_monday() as i64,
    )
}

fn check_lookback(lookback_days: i64) -> Result<(), FeatureError> {
    if lookback_days < 0 {
        return Err(FeatureError::InvalidLookback(lookback_days));
    }
    Ok(())
}

/// Strictly-before plus whole-day lookback bound. Equal timestamps are
/// excluded so no impression can see an event that is not yet in its past.
fn in_lookback_window(
    impression: &ImpressionRecord,
    event_ts: chrono::DateTime<chrono::Utc>,
    lookback_days: i64,
) -> bool {
    if event_ts >= impression.logged_at {
        return false;
    }
    (impression.logged_at - event_ts).num_days() <= lookback_days
}

/// One view per (user, timestamp): the later-logged occurrence wins, at
/// its original position.
fn dedup_views(views: &[ViewRecord]) -> Vec<&ViewRecord> {
    let mut last_index: HashMap<(i64, chrono::DateTime<chrono::Utc>), usize> = HashMap::new();
    for (idx, view) in views.iter().enumerate() {
        last_index.insert((view.user_id, view.logged_at), idx);
    }
    let mut indices: Vec<usize> = last_index.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|idx| &views[idx]).collect()
}

fn join_history_features(
    base: FeatureFrame,
    impressions: &[ImpressionRecord],
    views: &[ViewRecord],
    lookback_days: i64,
) -> Result<FeatureFrame, FeatureError> {
    let impression_counts = impression_history_counts(impressions, lookback_days)?;
    let view_features = view_history_features(impressions, views, lookback_days)?;

    let mut history = FeatureFrame::new(vec![
        "impression_id".to_string(),
        "previous_impression_count".to_string(),
    ])?;
    let mut view_frame = FeatureFrame::new(vec![
        "impression_id".to_string(),
        "previous_view_count".to_string(),
        "item_id".to_string(),
        "device_type".to_string(),
    ])?;
    for impression in impressions {
        if let Some(count) = impression_counts.get(&impression.impression_id) {
            history.push_row(vec![
                Value::Str(impression.impression_id.clone()),
                Value::Int(*count),
            ])?;
        }
        if let Some(view) = view_features.get(&impression.impression_id) {
            view_frame.push_row(vec![
                Value::Str(impression.impression_id.clone()),
                Value::Int(view.count),
                Value::Int(view.item_id),
                Value::Str(view.device_type.clone()),
            ])?;
        }
    }

    let joined = base.left_join_unique(&history, "impression_id", "_history")?;
    Ok(joined.left_join_unique(&view_frame, "impression_id", "_view")?)
}

fn impression_frame(impressions: &[ImpressionRecord]) -> Result<FeatureFrame, FeatureError> {
    let mut frame = FeatureFrame::new(vec![
        "impression_id".to_string(),
        "logged_at".to_string(),
        "user_id".to_string(),
        "app_code".to_string(),
        "os_version".to_string(),
        "is_4g".to_string(),
        "is_click".to_string(),
    ])?;
    for impression in impressions {
        frame.push_row(vec![
            Value::Str(impression.impression_id.clone()),
            Value::Str(format_timestamp(impression.logged_at)),
            Value::Int(impression.user_id),
            Value::Int(impression.app_code),
            Value::Str(impression.os_version.clone()),
            Value::Int(impression.is_4g),
            impression.is_click.map(Value::Int).unwrap_or(Value::Null),
        ])?;
    }
    Ok(frame)
}

fn time_frame(impressions: &[ImpressionRecord]) -> Result<FeatureFrame, FeatureError> {
    let mut frame = FeatureFrame::new(vec![
        "impression_id".to_string(),
        "impression_hour".to_string(),
        "impression_day".to_string(),
        "impression_weekday".to_string(),
    ])?;
    for impression in impressions {
        let (hour, day, weekday) = time_features(impression);
        frame.push_row(vec![
            Value::Str(impression.impression_id.clone()),
            Value::Int(hour),
            Value::Int(day),
            Value::Int(weekday),
        ])?;
    }
    Ok(frame)
}

/// Item dimension with the latest row per id winning, ready for a
/// unique-key join.
fn item_frame(items: &[ItemRecord]) -> Result<FeatureFrame, FeatureError> {
    let mut last_index: HashMap<i64, usize> = HashMap::new();
    for (idx, item) in items.iter().enumerate() {
        last_index.insert(item.item_id, idx);
    }
    let mut indices: Vec<usize> = last_index.into_values().collect();
    indices.sort_unstable();

    let mut frame = FeatureFrame::new(vec![
        "item_id".to_string(),
        "item_price".to_string(),
        "category_1".to_string(),
        "category_2".to_string(),
        "category_3".to_string(),
        "product_type".to_string(),
    ])?;
    for idx in indices {
        let item = &items[idx];
        frame.push_row(vec![
            Value::Int(item.item_id),
            Value::Int(item.item_price),
            Value::Int(item.category_1),
            Value::Int(item.category_2),
            Value::Int(item.category_3),
            Value::Int(item.product_type),
        ])?;
    }
    Ok(frame)
}
