//! Purpose: JSON serializers for messages, store info, and command outcomes.
//! Exports: `message_json`, `info_json`, `write_json`, `recovery_json`.
//! Role: Keep the CLI output envelope shape consistent across commands.
//! Invariants: Stable key names for v0 payloads; text fields are lossy UTF-8.
//! Invariants: Empty optional text fields are omitted.

use bstr::{BStr, ByteSlice};
use msglog::api::{Message, RecoveryReport, StoreInfo, WriteOutcome};
use serde_json::{Map, Value, json};

fn text(value: &BStr) -> Value {
    json!(value.to_str_lossy())
}

pub(crate) fn message_json(message: &Message) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), json!(message.id));
    if let Some(time) = message.timestamp.to_rfc3339() {
        map.insert("time".to_string(), json!(time));
    }
    map.insert(
        "timestamp".to_string(),
        json!({ "secs": message.timestamp.secs, "nanos": message.timestamp.nanos }),
    );
    map.insert("channel".to_string(), json!(message.channel));
    map.insert("thread_id".to_string(), json!(message.thread_id));
    if !message.app_name.is_empty() {
        map.insert("app".to_string(), text(message.app_name.as_bstr()));
    }
    if !message.machine_name.is_empty() {
        map.insert("machine".to_string(), text(message.machine_name.as_bstr()));
    }
    if !message.file.is_empty() {
        map.insert(
            "source".to_string(),
            json!({ "file": message.file.to_str_lossy(), "line": message.line }),
        );
    }
    map.insert("msg".to_string(), text(message.msg.as_bstr()));
    Value::Object(map)
}

pub(crate) fn info_json(info: &StoreInfo) -> Value {
    json!({
        "path": info.path.display().to_string(),
        "file_size": info.file_size,
        "state": info.state,
        "reuse": info.reuse,
        "index": {
            "record_count": info.record_count,
            "index_count": info.index_count,
            "oldest_entry": info.oldest_entry,
            "newest_entry": info.newest_entry,
            "oldest_id": info.oldest_id,
            "newest_id": info.newest_id,
        },
        "strings": {
            "table_size": info.string_table_size,
            "entries": info.string_entries,
            "capacity": info.string_capacity,
            "bytes_used": info.string_bytes_used,
            "bytes_capacity": info.string_bytes_capacity,
            "degraded": info.string_table_degraded,
        },
        "messages": {
            "offset": info.message_offset,
            "area_len": info.message_area_len,
        },
    })
}

pub(crate) fn write_json(id: u32, outcome: &WriteOutcome) -> Value {
    let mut map = Map::new();
    map.insert("id".to_string(), json!(id));
    map.insert("position".to_string(), json!(outcome.position));
    map.insert("offset".to_string(), json!(outcome.offset));
    map.insert("length".to_string(), json!(outcome.length));
    if outcome.evicted > 0 {
        map.insert("evicted".to_string(), json!(outcome.evicted));
    }
    if let Some(archived) = &outcome.archived {
        map.insert(
            "archived".to_string(),
            json!(archived.display().to_string()),
        );
    }
    Value::Object(map)
}

pub(crate) fn recovery_json(report: &RecoveryReport) -> Value {
    serde_json::to_value(report).unwrap_or(Value::Null)
}
