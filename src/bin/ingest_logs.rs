//! Loads warehouse CSV exports into the local event store.

use std::path::{Path, PathBuf};

use ctrp::{
    init_logging, log_app_start, parse_timestamp, validate_impressions, validate_items,
    validate_views, EventStore, ImpressionRecord, ItemRecord, LoggingConfig, ViewRecord,
    IMPRESSION_TABLE, VIEW_TABLE,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = LoggingConfig::from_env();
    init_logging(&logging_cfg)?;
    log_app_start("ingest_logs", &logging_cfg);

    let data_dir = std::env::var("CTRP_INGEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/raw"));
    let store = EventStore::open(&env_path("CTRP_EVENT_STORE", "data/events.sqlite"))?;
    store.ensure_schema()?;

    let impressions = read_impressions(&data_dir.join("impression_log.csv"))?;
    validate_impressions(&impressions)?;
    for row in &impressions {
        store.insert_impression(row)?;
    }

    let views = read_views(&data_dir.join("view_log.csv"))?;
    validate_views(&views)?;
    for row in &views {
        store.insert_view(row)?;
    }

    let items = read_items(&data_dir.join("mst_item.csv"))?;
    validate_items(&items)?;
    for row in &items {
        store.insert_item(row)?;
    }

    println!(
        "Ingested {} impressions, {} views, {} items from {}",
        impressions.len(),
        views.len(),
        items.len(),
        data_dir.display()
    );
    Ok(())
}

fn read_impressions(path: &Path) -> Result<Vec<ImpressionRecord>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<RawImpression>() {
        let raw = record?;
        rows.push(ImpressionRecord {
            impression_id: raw.impression_id,
            logged_at: parse_timestamp(IMPRESSION_TABLE, &raw.logged_at)?,
            user_id: raw.user_id,
            app_code: raw.app_code,
            os_version: raw.os_version,
            is_4g: raw.is_4g,
            is_click: raw.is_click,
        });
    }
    Ok(rows)
}

fn read_views(path: &Path) -> Result<Vec<ViewRecord>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<RawView>() {
        let raw = record?;
        rows.push(ViewRecord {
            logged_at: parse_timestamp(VIEW_TABLE, &raw.logged_at)?,
            device_type: raw.device_type,
            session_id: raw.session_id,
            user_id: raw.user_id,
            item_id: raw.item_id,
        });
    }
    Ok(rows)
}

fn read_items(path: &Path) -> Result<Vec<ItemRecord>, Box<dyn std::error::Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<ItemRecord>() {
        rows.push(record?);
    }
    Ok(rows)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

#[derive(serde::Deserialize)]
struct RawImpression {
    impression_id: String,
    logged_at: String,
    user_id: i64,
    app_code: i64,
    os_version: String,
    is_4g: i64,
    is_click: Option<i64>,
}

#[derive(serde::Deserialize)]
struct RawView {
    logged_at: String,
    device_type: String,
    session_id: i64,
    user_id: i64,
    item_id: i64,
}
