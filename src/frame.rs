//! Named-column row frame used between assembly and the predictors.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One cell of a feature frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Cell rendered for CSV artifacts and hashing. Null renders empty.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => v.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column {0} not found")]
    MissingColumn(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("row has {found} cells, frame has {expected} columns")]
    RowWidthMismatch { found: usize, expected: usize },
    #[error("join on {key} fans out: right side has {count} rows for key {value}")]
    JoinFanOut {
        key: String,
        value: String,
        count: usize,
    },
    #[error("join key {0} missing from right frame")]
    MissingJoinKey(String),
}

/// Ordered named columns over rows of [`Value`] cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl FeatureFrame {
    pub fn new(columns: Vec<String>) -> Result<Self, FrameError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.clone()) {
                return Err(FrameError::DuplicateColumn(column.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), FrameError> {
        if row.len() != self.columns.len() {
            return Err(FrameError::RowWidthMismatch {
                found: row.len(),
                expected: self.columns.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn value(&self, row: usize, column: &str) -> Result<&Value, FrameError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| FrameError::MissingColumn(column.to_string()))?;
        Ok(&self.rows[row][idx])
    }

    pub fn set_value(&mut self, row: usize, column: &str, value: Value) -> Result<(), FrameError> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| FrameError::MissingColumn(column.to_string()))?;
        self.rows[row][idx] = value;
        Ok(())
    }

    /// Appends an all-null column. Used when a schema descriptor names a
    /// column the frame does not carry yet.
    pub fn push_null_column(&mut self, name: &str) -> Result<(), FrameError> {
        if self.has_column(name) {
            return Err(FrameError::DuplicateColumn(name.to_string()));
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        Ok(())
    }

    pub fn column_values(&self, name: &str) -> Result<Vec<Value>, FrameError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| FrameError::MissingColumn(name.to_string()))?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Left join with a right frame whose join key must be unique.
    ///
    /// Every left row appears exactly once in the output. Right columns
    /// other than the key are appended; a right column whose name collides
    /// with a left column is renamed with `suffix`. A right side holding
    /// more than one row for a key value is a fan-out and is rejected.
    pub fn left_join_unique(
        &self,
        right: &FeatureFrame,
        key: &str,
        suffix: &str,
    ) -> Result<FeatureFrame, FrameError> {
        let left_key = self
            .column_index(key)
            .ok_or_else(|| FrameError::MissingColumn(key.to_string()))?;
        let right_key = right
            .column_index(key)
            .ok_or_else(|| FrameError::MissingJoinKey(key.to_string()))?;

        let mut right_rows: HashMap<String, &Vec<Value>> = HashMap::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for row in right.rows() {
            let key_text = row[right_key].render();
            let count = counts.entry(key_text.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                return Err(FrameError::JoinFanOut {
                    key: key.to_string(),
                    value: key_text,
                    count: *count,
                });
            }
            right_rows.insert(key_text, row);
        }

        let appended: Vec<(usize, String)> = right
            .columns()
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != right_key)
            .map(|(idx, name)| {
                let out_name = if self.has_column(name) {
                    format!("{name}{suffix}")
                } else {
                    name.clone()
                };
                (idx, out_name)
            })
            .collect();

        let mut columns = self.columns.clone();
        columns.extend(appended.iter().map(|(_, name)| name.clone()));
        let mut out = FeatureFrame::new(columns)?;

        for row in &self.rows {
            let mut joined = row.clone();
            match right_rows.get(&row[left_key].render()) {
                Some(right_row) => {
                    for (idx, _) in &appended {
                        joined.push(right_row[*idx].clone());
                    }
                }
                None => {
                    for _ in &appended {
                        joined.push(Value::Null);
                    }
                }
            }
            out.push_row(joined)?;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(columns: &[&str], rows: Vec<Vec<Value>>) -> FeatureFrame {
        let mut out =
            FeatureFrame::new(columns.iter().map(|name| name.to_string()).collect()).unwrap();
        for row in rows {
            out.push_row(row).unwrap();
        }
        out
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = FeatureFrame::new(vec!["a".to_string(), "a".to_string()]).unwrap_err();
        assert!(matches!(err, FrameError::DuplicateColumn(name) if name == "a"));
    }

    #[test]
    fn left_join_preserves_row_count_and_fills_nulls() {
        let left = frame(
            &["id", "x"],
            vec![
                vec![Value::Int(1), Value::Int(10)],
                vec![Value::Int(2), Value::Int(20)],
            ],
        );
        let right = frame(&["id", "y"], vec![vec![Value::Int(1), Value::Str("a".into())]]);

        let joined = left.left_join_unique(&right, "id", "_right").unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.columns(), &["id", "x", "y"]);
        assert_eq!(joined.value(0, "y").unwrap(), &Value::Str("a".into()));
        assert!(joined.value(1, "y").unwrap().is_null());
    }

    #[test]
    fn left_join_renames_colliding_right_columns() {
        let left = frame(&["id", "ts"], vec![vec![Value::Int(1), Value::Int(5)]]);
        let right = frame(&["id", "ts"], vec![vec![Value::Int(1), Value::Int(9)]]);

        let joined = left.left_join_unique(&right, "id", "_view").unwrap();
        assert_eq!(joined.columns(), &["id", "ts", "ts_view"]);
        assert_eq!(joined.value(0, "ts").unwrap(), &Value::Int(5));
        assert_eq!(joined.value(0, "ts_view").unwrap(), &Value::Int(9));
    }

    #[test]
    fn fan_out_on_duplicate_right_keys_is_rejected() {
        let left = frame(&["id"], vec![vec![Value::Int(1)]]);
        let right = frame(
            &["id", "y"],
            vec![
                vec![Value::Int(1), Value::Int(1)],
                vec![Value::Int(1), Value::Int(2)],
            ],
        );

        let err = left.left_join_unique(&right, "id", "_right").unwrap_err();
        assert!(matches!(err, FrameError::JoinFanOut { .. }));
    }

    #[test]
    fn null_column_synthesis_extends_every_row() {
        let mut f = frame(&["a"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        f.push_null_column("b").unwrap();
        assert!(f.value(0, "b").unwrap().is_null());
        assert!(f.value(1, "b").unwrap().is_null());
        assert!(matches!(
            f.push_null_column("b").unwrap_err(),
            FrameError::DuplicateColumn(_)
        ));
    }
}
