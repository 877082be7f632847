//! Phone-number fixtures shared by the integration suites

use at_core::{ExampleRecord, InputRecord, RecordResult, RepoRef, ReviewSettings};
use serde_json::{json, Value};

/// Like [`phone_schema`] but `phone_number` must be a string
pub fn strict_phone_schema() -> Value {
    json!({
        "type": "object",
        "required": ["phone_number"],
        "properties": {"phone_number": {"type": "string"}}
    })
}

/// `{type: object, required: [phone_number]}`
pub fn phone_schema() -> Value {
    json!({
        "type": "object",
        "required": ["phone_number"],
        "properties": {"phone_number": {"type": ["string", "null"]}}
    })
}

pub fn record(value: Value) -> InputRecord {
    InputRecord::from_value(value).expect("fixture record must be an object")
}

pub fn phone_example() -> ExampleRecord {
    ExampleRecord::new(
        record(json!({"phone_entry": "207-307-7621"})),
        json!({"phone_number": "+12073077621"}),
    )
}

/// One parseable and one unparseable entry
pub fn phone_batch() -> Vec<Value> {
    vec![
        json!({"phone_entry": "415-854-9030"}),
        json!({"phone_entry": "not a phone"}),
    ]
}

pub fn review_settings(auto_merge: bool) -> ReviewSettings {
    ReviewSettings {
        repository: RepoRef {
            owner: "acme".into(),
            repo: "transforms".into(),
        },
        primary_branch: "main".into(),
        auto_merge,
    }
}

fn digits(record: &Value) -> String {
    record
        .get("phone_entry")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

/// Formats ten-digit entries, raises on anything else
pub fn strict_phone(record: &Value) -> RecordResult {
    let digits = digits(record);
    if digits.len() == 10 {
        Ok(json!({"phone_number": format!("+1{digits}")}))
    } else {
        Err(format!("ValueError: cannot parse phone entry {record}"))
    }
}

/// Like [`strict_phone`] but maps unparseable entries to null
pub fn lenient_phone(record: &Value) -> RecordResult {
    let digits = digits(record);
    if digits.len() == 10 {
        Ok(json!({"phone_number": format!("+1{digits}")}))
    } else {
        Ok(json!({"phone_number": null}))
    }
}

/// Drops the required key
pub fn wrong_shape(record: &Value) -> RecordResult {
    Ok(json!({"number": digits(record)}))
}

/// Digits without the country prefix
pub fn bare_digits(record: &Value) -> RecordResult {
    Ok(json!({"phone_number": digits(record)}))
}

/// Right for the 207 area code of [`phone_example`], bare digits elsewhere
pub fn example_only_phone(record: &Value) -> RecordResult {
    let digits = digits(record);
    if digits.starts_with("207") {
        strict_phone(record)
    } else {
        Ok(json!({"phone_number": digits}))
    }
}
