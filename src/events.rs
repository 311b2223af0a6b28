//! Typed event-log records and per-table validation.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const IMPRESSION_TABLE: &str = "impression_log";
pub const VIEW_TABLE: &str = "view_log";
pub const ITEM_TABLE: &str = "mst_item";

const OS_VERSIONS: [&str; 3] = ["old", "intermediate", "latest"];
const DEVICE_TYPES: [&str; 3] = ["android", "iphone", "web"];

/// One ad-serving decision. `is_click` is present only in historical data;
/// serving-time requests carry no label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpressionRecord {
    pub impression_id: String,
    pub logged_at: DateTime<Utc>,
    pub user_id: i64,
    pub app_code: i64,
    pub os_version: String,
    pub is_4g: i64,
    pub is_click: Option<i64>,
}

/// A content-view action. Feature source only, never a prediction target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub logged_at: DateTime<Utc>,
    pub device_type: String,
    pub session_id: i64,
    pub user_id: i64,
    pub item_id: i64,
}

/// Static catalog attributes, keyed by item id. Duplicate ids are legal
/// input; the latest row wins before the assembly join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: i64,
    pub item_price: i64,
    pub category_1: i64,
    pub category_2: i64,
    pub category_3: i64,
    pub product_type: i64,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unparseable timestamp '{value}' in {table}")]
    InvalidTimestamp { table: &'static str, value: String },
    #[error("{table}.{column} value '{value}' violates domain {domain}")]
    DomainViolation {
        table: &'static str,
        column: &'static str,
        value: String,
        domain: &'static str,
    },
    #[error("duplicate impression_id '{0}'")]
    DuplicateImpressionId(String),
}

/// Parses a `%Y-%m-%d %H:%M:%S` wall-clock string as UTC.
pub fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>, EventError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| EventError::InvalidTimestamp {
            table,
            value: raw.to_string(),
        })
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Raises on the first violated constraint; never coerces.
pub fn validate_impressions(rows: &[ImpressionRecord]) -> Result<(), EventError> {
    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(row.impression_id.as_str()) {
            return Err(EventError::DuplicateImpressionId(row.impression_id.clone()));
        }
        require_non_negative(IMPRESSION_TABLE, "user_id", row.user_id)?;
        require_non_negative(IMPRESSION_TABLE, "app_code", row.app_code)?;
        if !OS_VERSIONS.contains(&row.os_version.as_str()) {
            return Err(EventError::DomainViolation {
                table: IMPRESSION_TABLE,
                column: "os_version",
                value: row.os_version.clone(),
                domain: "{old, intermediate, latest}",
            });
        }
        require_flag(IMPRESSION_TABLE, "is_4g", row.is_4g)?;
        if let Some(is_click) = row.is_click {
            require_flag(IMPRESSION_TABLE, "is_click", is_click)?;
        }
    }
    Ok(())
}

pub fn validate_views(rows: &[ViewRecord]) -> Result<(), EventError> {
    for row in rows {
        if !DEVICE_TYPES.contains(&row.device_type.as_str()) {
            return Err(EventError::DomainViolation {
                table: VIEW_TABLE,
                column: "device_type",
                value: row.device_type.clone(),
                domain: "{android, iphone, web}",
            });
        }
        require_non_negative(VIEW_TABLE, "session_id", row.session_id)?;
        require_non_negative(VIEW_TABLE, "user_id", row.user_id)?;
        require_non_negative(VIEW_TABLE, "item_id", row.item_id)?;
    }
    Ok(())
}

pub fn validate_items(rows: &[ItemRecord]) -> Result<(), EventError> {
    for row in rows {
        require_non_negative(ITEM_TABLE, "item_id", row.item_id)?;
        if row.item_price <= 0 {
            return Err(EventError::DomainViolation {
                table: ITEM_TABLE,
                column: "item_price",
                value: row.item_price.to_string(),
                domain: "> 0",
            });
        }
        require_non_negative(ITEM_TABLE, "category_1", row.category_1)?;
        require_non_negative(ITEM_TABLE, "category_2", row.category_2)?;
        require_non_negative(ITEM_TABLE, "category_3", row.category_3)?;
        require_non_negative(ITEM_TABLE, "product_type", row.product_type)?;
    }
    Ok(())
}

fn require_non_negative(
    table: &'static str,
    column: &'static str,
    value: i64,
) -> Result<(), EventError> {
    if value < 0 {
        return Err(EventError::DomainViolation {
            table,
            column,
            value: value.to_string(),
            domain: ">= 0",
        });
    }
    Ok(())
}

fn require_flag(table: &'static str, column: &'static str, value: i64) -> Result<(), EventError> {
    if value != 0 && value != 1 {
        return Err(EventError::DomainViolation {
            table,
            column,
            value: value.to_string(),
            domain: "{0, 1}",
        });
    }
    Ok(())
}
