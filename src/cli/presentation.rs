//! CLI presentation: text and json formatters for records.

use crate::error::CliError;
use crate::store::Record;
use crate::types::RecordId;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use serde_json::json;
use std::collections::BTreeSet;

pub fn record_json(record: &Record) -> serde_json::Value {
    let attributes: serde_json::Map<String, serde_json::Value> = record
        .attributes
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect();
    json!({
        "id": record.id.to_string(),
        "entity": record.entity,
        "attributes": attributes,
    })
}

pub fn format_record(record: &Record, format: &str) -> Result<String, CliError> {
    if format == "json" {
        return to_pretty(&record_json(record));
    }
    let mut out = format!("{} {}", record.entity, record.id);
    for (key, value) in &record.attributes {
        out.push_str(&format!("\n  {}: {}", key, value));
    }
    Ok(out)
}

/// Records as a table with one column per attribute key seen in any record
pub fn format_records(records: &[Record], format: &str) -> Result<String, CliError> {
    if format == "json" {
        let rows: Vec<serde_json::Value> = records.iter().map(record_json).collect();
        return to_pretty(&json!({ "records": rows, "total": records.len() }));
    }
    if records.is_empty() {
        return Ok("No records found.".to_string());
    }

    let keys: BTreeSet<&String> = records.iter().flat_map(|r| r.attributes.keys()).collect();
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    let mut header = vec!["id".to_string()];
    header.extend(keys.iter().map(|k| k.to_string()));
    table.set_header(header);
    for record in records {
        let mut row = vec![record.id.to_string()];
        row.extend(keys.iter().map(|key| {
            record
                .attributes
                .get(key.as_str())
                .map(|value| value.to_string())
                .unwrap_or_else(|| "-".to_string())
        }));
        table.add_row(row);
    }
    Ok(format!("{}\n{} record(s)", table, records.len()))
}

pub fn format_ids(ids: &[RecordId], format: &str) -> Result<String, CliError> {
    if format == "json" {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        return to_pretty(&json!({ "ids": ids }));
    }
    Ok(ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n"))
}

fn to_pretty(value: &serde_json::Value) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::Runtime(e.to_string()))
}
