//! Chronological train/valid/test split.
//!
//! No shuffling: rows are sorted by event time and the split points are
//! cut from the end, so validation and test always postdate training.

use thiserror::Error;
use tracing::info;

use crate::events::parse_timestamp;
use crate::frame::{FeatureFrame, FrameError, Value};

#[derive(Debug, Error)]
pub enum SplitError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{name} must be in (0, 1), got {value}")]
    InvalidFraction { name: &'static str, value: f64 },
    #[error("test_size + valid_size must be < 1, got {0}")]
    FractionsTooLarge(f64),
    #[error("unparseable timestamp '{0}' in split column")]
    InvalidTimestamp(String),
}

/// Sorts ascending by `time_column`, carves the last `test_size` fraction
/// off as test, then the last `valid_size` fraction of the remainder as
/// validation. Both cuts floor the row count.
pub fn temporal_split(
    frame: &FeatureFrame,
    time_column: &str,
    test_size: f64,
    valid_size: f64,
) -> Result<(FeatureFrame, FeatureFrame, FeatureFrame), SplitError> {
    check_fraction("test_size", test_size)?;
    check_fraction("valid_size", valid_size)?;
    if test_size + valid_size >= 1.0 {
        return Err(SplitError::FractionsTooLarge(test_size + valid_size));
    }

    let time_idx = frame
        .column_index(time_column)
        .ok_or_else(|| FrameError::MissingColumn(time_column.to_string()))?;

    // Parse once up front so a bad timestamp aborts before any slicing.
    let mut keyed: Vec<(chrono::DateTime<chrono::Utc>, &Vec<Value>)> =
        Vec::with_capacity(frame.len());
    for row in frame.rows() {
        let raw = row[time_idx].render();
        let ts = parse_timestamp("split", &raw)
            .map_err(|_| SplitError::InvalidTimestamp(raw.clone()))?;
        keyed.push((ts, row));
    }
    keyed.sort_by_key(|(ts, _)| *ts);

    let total = keyed.len();
    let test_count = (total as f64 * test_size).floor() as usize;
    let remainder = total - test_count;
    let valid_count = (remainder as f64 * valid_size).floor() as usize;
    let train_count = remainder - valid_count;

    let mut train = FeatureFrame::new(frame.columns().to_vec())?;
    let mut valid = FeatureFrame::new(frame.columns().to_vec())?;
    let mut test = FeatureFrame::new(frame.columns().to_vec())?;
    for (idx, (_, row)) in keyed.into_iter().enumerate() {
        let target = if idx < train_count {
            &mut train
        } else if idx < remainder {
            &mut valid
        } else {
            &mut test
        };
        target.push_row(row.clone())?;
    }

    info!(
        component = "split",
        event = "split.finish",
        total,
        train = train.len(),
        valid = valid.len(),
        test = test.len()
    );
    Ok((train, valid, test))
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), SplitError> {
    if !(value > 0.0 && value < 1.0) {
        return Err(SplitError::InvalidFraction { name, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hourly_frame(rows: usize) -> FeatureFrame {
        let mut frame = FeatureFrame::new(vec![
            "feature".to_string(),
            "logged_at".to_string(),
        ])
        .unwrap();
        let start = parse_timestamp("test", "2023-01-01 00:00:00").unwrap();
        for idx in 0..rows {
            let ts = start + Duration::hours(idx as i64);
            frame
                .push_row(vec![
                    Value::Int(idx as i64),
                    Value::Str(crate::events::format_timestamp(ts)),
                ])
                .unwrap();
        }
        frame
    }

    fn max_ts(frame: &FeatureFrame) -> String {
        frame
            .rows()
            .iter()
            .map(|row| row[1].render())
            .max()
            .unwrap()
    }

    fn min_ts(frame: &FeatureFrame) -> String {
        frame
            .rows()
            .iter()
            .map(|row| row[1].render())
            .min()
            .unwrap()
    }

    #[test]
    fn hundred_hourly_rows_split_exactly_72_8_20() {
        let frame = hourly_frame(100);
        let (train, valid, test) = temporal_split(&frame, "logged_at", 0.2, 0.1).unwrap();
        assert_eq!(train.len(), 72);
        assert_eq!(valid.len(), 8);
        assert_eq!(test.len(), 20);
    }

    #[test]
    fn partitions_are_strictly_ordered_in_time() {
        let frame = hourly_frame(50);
        let (train, valid, test) = temporal_split(&frame, "logged_at", 0.2, 0.1).unwrap();
        assert!(max_ts(&train) < min_ts(&valid));
        assert!(max_ts(&valid) < min_ts(&test));
    }

    #[test]
    fn unsorted_input_is_sorted_before_cutting() {
        let mut frame = FeatureFrame::new(vec![
            "feature".to_string(),
            "logged_at".to_string(),
        ])
        .unwrap();
        for raw in [
            "2023-01-03 00:00:00",
            "2023-01-01 00:00:00",
            "2023-01-05 00:00:00",
            "2023-01-02 00:00:00",
            "2023-01-04 00:00:00",
        ] {
            frame
                .push_row(vec![Value::Int(0), Value::Str(raw.to_string())])
                .unwrap();
        }
        let (train, valid, test) = temporal_split(&frame, "logged_at", 0.2, 0.25).unwrap();
        assert_eq!(train.len(), 3);
        assert_eq!(valid.len(), 1);
        assert_eq!(test.len(), 1);
        assert_eq!(min_ts(&test), "2023-01-05 00:00:00");
        assert_eq!(min_ts(&valid), "2023-01-04 00:00:00");
    }

    #[test]
    fn fractions_outside_unit_interval_are_rejected() {
        let frame = hourly_frame(10);
        assert!(matches!(
            temporal_split(&frame, "logged_at", 0.0, 0.1).unwrap_err(),
            SplitError::InvalidFraction { name: "test_size", .. }
        ));
        assert!(matches!(
            temporal_split(&frame, "logged_at", 0.2, 1.0).unwrap_err(),
            SplitError::InvalidFraction { name: "valid_size", .. }
        ));
        assert!(matches!(
            temporal_split(&frame, "logged_at", 0.6, 0.5).unwrap_err(),
            SplitError::FractionsTooLarge(_)
        ));
    }

    #[test]
    fn bad_timestamp_aborts_the_split() {
        let mut frame = FeatureFrame::new(vec!["logged_at".to_string()]).unwrap();
        frame
            .push_row(vec![Value::Str("not a time".to_string())])
            .unwrap();
        let err = temporal_split(&frame, "logged_at", 0.2, 0.1).unwrap_err();
        assert!(matches!(err, SplitError::InvalidTimestamp(raw) if raw == "not a time"));
    }
}
