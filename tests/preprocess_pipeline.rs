use chrono::{DateTime, Duration, Utc};
use ctrp::{
    apply_schema, assemble_impression_features, assemble_training_frame, format_timestamp,
    impression_history_counts, parse_timestamp, select_columns, temporal_split,
    view_history_features, FeatureFrame, FieldSchema, ImpressionRecord, ItemRecord, Value,
    ViewRecord,
};

fn ts(raw: &str) -> DateTime<Utc> {
    parse_timestamp("fixture", raw).unwrap()
}

fn impression(id: &str, user_id: i64, raw_ts: &str) -> ImpressionRecord {
    ImpressionRecord {
        impression_id: id.to_string(),
        logged_at: ts(raw_ts),
        user_id,
        app_code: 7,
        os_version: "latest".to_string(),
        is_4g: 1,
        is_click: Some(0),
    }
}

fn view(user_id: i64, item_id: i64, device_type: &str, raw_ts: &str) -> ViewRecord {
    ViewRecord {
        logged_at: ts(raw_ts),
        device_type: device_type.to_string(),
        session_id: 1000 + item_id,
        user_id,
        item_id,
    }
}

fn item(item_id: i64, item_price: i64, category_1: i64) -> ItemRecord {
    ItemRecord {
        item_id,
        item_price,
        category_1,
        category_2: category_1 + 1,
        category_3: category_1 + 2,
        product_type: 9,
    }
}

/// Five impressions from users {101, 102, 101, 103, 102} at hourly-spaced
/// timestamps across Jan 1-5 2023, two views before the window start and
/// two inside it.
fn fixture() -> (Vec<ImpressionRecord>, Vec<ViewRecord>, Vec<ItemRecord>) {
    let impressions = vec![
        impression("1", 101, "2023-01-01 10:00:00"),
        impression("2", 102, "2023-01-02 11:00:00"),
        impression("3", 101, "2023-01-03 12:00:00"),
        impression("4", 103, "2023-01-04 13:00:00"),
        impression("5", 102, "2023-01-05 14:00:00"),
    ];
    let views = vec![
        view(101, 201, "android", "2022-12-30 09:00:00"),
        view(102, 202, "web", "2022-12-31 10:00:00"),
        view(101, 206, "android", "2023-01-02 11:00:00"),
        view(103, 207, "iphone", "2023-01-03 12:00:00"),
    ];
    let items = vec![
        item(201, 100, 1),
        item(202, 200, 2),
        item(203, 150, 1),
        item(204, 300, 3),
        item(205, 250, 2),
        item(206, 120, 1),
        item(207, 280, 3),
    ];
    (impressions, views, items)
}

#[test]
fn fixture_impression_counts_match_expected() {
    let (impressions, _, _) = fixture();
    let counts = impression_history_counts(&impressions, 7).unwrap();
    assert_eq!(counts.get("1"), None);
    assert_eq!(counts.get("2"), None);
    assert_eq!(counts.get("3"), Some(&1));
    assert_eq!(counts.get("4"), None);
    assert_eq!(counts.get("5"), Some(&1));
}

#[test]
fn fixture_view_counts_and_last_view_attribution_match_expected() {
    let (impressions, views, _) = fixture();
    let features = view_history_features(&impressions, &views, 7).unwrap();

    let expected = [
        ("1", 1, 201, "android"),
        ("2", 1, 202, "web"),
        ("3", 2, 206, "android"),
        ("4", 1, 207, "iphone"),
        ("5", 1, 202, "web"),
    ];
    for (id, count, item_id, device_type) in expected {
        let history = features.get(id).unwrap_or_else(|| panic!("missing {id}"));
        assert_eq!(history.count, count, "count for impression {id}");
        assert_eq!(history.item_id, item_id, "item for impression {id}");
        assert_eq!(history.device_type, device_type, "device for impression {id}");
    }
}

#[test]
fn assembled_frame_matches_the_full_fixture_expectation() {
    let (impressions, views, items) = fixture();
    let frame = assemble_training_frame(&impressions, &views, &items, 7).unwrap();

    assert_eq!(frame.len(), 5);

    let expect_int = |row: usize, column: &str, value: i64| {
        assert_eq!(
            frame.value(row, column).unwrap(),
            &Value::Int(value),
            "{column} at row {row}"
        );
    };
    let expect_null = |row: usize, column: &str| {
        assert!(frame.value(row, column).unwrap().is_null(), "{column} at row {row}");
    };

    // Time decomposition: hours 10..14, days 1..5, weekdays Sun..Thu.
    for (row, (hour, day, weekday)) in
        [(10, 1, 6), (11, 2, 0), (12, 3, 1), (13, 4, 2), (14, 5, 3)].iter().enumerate()
    {
        expect_int(row, "impression_hour", *hour);
        expect_int(row, "impression_day", *day);
        expect_int(row, "impression_weekday", *weekday);
    }

    expect_null(0, "previous_impression_count");
    expect_null(1, "previous_impression_count");
    expect_int(2, "previous_impression_count", 1);
    expect_null(3, "previous_impression_count");
    expect_int(4, "previous_impression_count", 1);

    for (row, count) in [1, 1, 2, 1, 1].iter().enumerate() {
        expect_int(row, "previous_view_count", *count);
    }
    for (row, item_id) in [201, 202, 206, 207, 202].iter().enumerate() {
        expect_int(row, "item_id", *item_id);
    }
    for (row, price) in [100, 200, 120, 280, 200].iter().enumerate() {
        expect_int(row, "item_price", *price);
    }
}

#[test]
fn no_event_at_or_after_an_impression_ever_contributes() {
    // A view at the exact impression timestamp and one after it.
    let impressions = vec![impression("1", 101, "2023-01-03 12:00:00")];
    let views = vec![
        view(101, 201, "android", "2023-01-03 12:00:00"),
        view(101, 202, "web", "2023-01-04 12:00:00"),
    ];
    for lookback in [0, 1, 7, 30] {
        let features = view_history_features(&impressions, &views, lookback).unwrap();
        assert!(
            features.get("1").is_none(),
            "leakage at lookback_days={lookback}"
        );
    }
}

#[test]
fn assembly_row_count_is_invariant_for_arbitrary_side_inputs() {
    let (impressions, views, items) = fixture();
    for (view_set, item_set) in [
        (views.clone(), items.clone()),
        (Vec::new(), items.clone()),
        (views.clone(), Vec::new()),
        (Vec::new(), Vec::new()),
    ] {
        let frame = assemble_training_frame(&impressions, &view_set, &item_set, 7).unwrap();
        assert_eq!(frame.len(), impressions.len());
        let features = assemble_impression_features(&impressions, &view_set, &item_set, 7).unwrap();
        assert_eq!(features.len(), impressions.len());
    }
}

#[test]
fn schema_coercion_fills_assembled_nulls_and_is_idempotent() {
    let (impressions, views, items) = fixture();
    let mut frame = assemble_training_frame(&impressions, &views, &items, 7).unwrap();

    let fields = vec![
        FieldSchema::int("impression_hour", -1),
        FieldSchema::int("previous_impression_count", -1),
        FieldSchema::int("previous_view_count", -1),
        FieldSchema::int("item_id", -1),
        FieldSchema::str("device_type", "null"),
        FieldSchema::int("item_price", -1),
    ];
    apply_schema(&mut frame, &fields).unwrap();

    // Row 0 had no prior impressions: the null became the fill sentinel.
    assert_eq!(
        frame.value(0, "previous_impression_count").unwrap(),
        &Value::Int(-1)
    );
    assert_eq!(frame.value(2, "previous_impression_count").unwrap(), &Value::Int(1));

    let once = frame.clone();
    apply_schema(&mut frame, &fields).unwrap();
    assert_eq!(frame, once);

    let matrix = select_columns(&frame, &fields).unwrap();
    assert_eq!(
        matrix.columns(),
        &[
            "impression_hour",
            "previous_impression_count",
            "previous_view_count",
            "item_id",
            "device_type",
            "item_price",
        ]
    );
    assert_eq!(matrix.len(), 5);
}

#[test]
fn hundred_row_temporal_split_is_72_8_20_and_ordered() {
    let mut frame = FeatureFrame::new(vec![
        "feature".to_string(),
        "logged_at".to_string(),
    ])
    .unwrap();
    let start = ts("2023-01-01 00:00:00");
    for idx in 0..100 {
        frame
            .push_row(vec![
                Value::Int(idx),
                Value::Str(format_timestamp(start + Duration::hours(idx))),
            ])
            .unwrap();
    }

    let (train, valid, test) = temporal_split(&frame, "logged_at", 0.2, 0.1).unwrap();
    assert_eq!(train.len(), 72);
    assert_eq!(valid.len(), 8);
    assert_eq!(test.len(), 20);

    let last = |frame: &FeatureFrame| frame.rows().last().unwrap()[1].render();
    let first = |frame: &FeatureFrame| frame.rows().first().unwrap()[1].render();
    assert!(last(&train) < first(&valid));
    assert!(last(&valid) < first(&test));
}
