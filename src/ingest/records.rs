//! Device message payloads and record normalization

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Message published by a device on `things/{thingId}`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceMessage {
    pub token: String,
    #[serde(rename = "Records", default)]
    pub records: Vec<RawRecord>,
}

/// A record as sent by the device; value forms are not yet checked
#[derive(Debug, Clone, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Unit", default)]
    pub unit: Option<String>,
    #[serde(rename = "Time", default)]
    pub time: Option<f64>,
    #[serde(rename = "Value", default)]
    pub value: Option<f64>,
    #[serde(rename = "StringValue", default)]
    pub string_value: Option<String>,
    #[serde(rename = "BoolValue", default)]
    pub bool_value: Option<bool>,
}

/// Exactly one value form per record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RecordValue {
    #[serde(rename = "Value")]
    Number(f64),
    #[serde(rename = "StringValue")]
    Text(String),
    #[serde(rename = "BoolValue")]
    Bool(bool),
}

/// A record ready to be relayed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Unit", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "Time", skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(flatten)]
    pub value: RecordValue,
}

impl RawRecord {
    /// Resolve the single value form, or `None` when zero or several are set
    pub fn normalize(self) -> Option<Record> {
        let value = match (self.value, self.string_value, self.bool_value) {
            (Some(v), None, None) => RecordValue::Number(v),
            (None, Some(s), None) => RecordValue::Text(s),
            (None, None, Some(b)) => RecordValue::Bool(b),
            _ => return None,
        };

        Some(Record {
            name: self.name,
            unit: self.unit,
            time: self.time,
            value,
        })
    }
}

/// Normalize a record array, dropping records without exactly one value form
pub fn normalize_records(thing_id: &str, records: Vec<RawRecord>) -> Vec<Record> {
    records
        .into_iter()
        .filter_map(|raw| {
            let name = raw.name.clone();
            let normalized = raw.normalize();
            if normalized.is_none() {
                warn!(thing_id = thing_id, record = %name, "Dropping record without exactly one value");
            }
            normalized
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawRecord {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_decode_device_message() {
        let msg: DeviceMessage = serde_json::from_str(
            r#"{"token":"abc","Records":[{"Name":"temp","Unit":"Cel","Time":1.5,"Value":21.5}]}"#,
        )
        .unwrap();
        assert_eq!(msg.token, "abc");
        assert_eq!(msg.records.len(), 1);
        assert_eq!(msg.records[0].value, Some(21.5));
    }

    #[test]
    fn test_message_without_token_fails() {
        let result = serde_json::from_str::<DeviceMessage>(r#"{"Records":[]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_each_form() {
        let n = raw(r#"{"Name":"a","Value":1}"#).normalize().unwrap();
        assert_eq!(n.value, RecordValue::Number(1.0));

        let s = raw(r#"{"Name":"b","StringValue":"on"}"#).normalize().unwrap();
        assert_eq!(s.value, RecordValue::Text("on".to_string()));

        let b = raw(r#"{"Name":"c","BoolValue":true}"#).normalize().unwrap();
        assert_eq!(b.value, RecordValue::Bool(true));
    }

    #[test]
    fn test_normalize_rejects_none_or_many() {
        assert!(raw(r#"{"Name":"a"}"#).normalize().is_none());
        assert!(raw(r#"{"Name":"a","Value":1,"BoolValue":false}"#).normalize().is_none());
    }

    #[test]
    fn test_normalize_records_drops_invalid() {
        let records = vec![
            raw(r#"{"Name":"a","Value":1}"#),
            raw(r#"{"Name":"b"}"#),
            raw(r#"{"Name":"c","StringValue":"x"}"#),
        ];
        let normalized = normalize_records("t1", records);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].name, "a");
        assert_eq!(normalized[1].name, "c");
    }

    #[test]
    fn test_encode_uses_wire_names() {
        let record = raw(r#"{"Name":"t1:temp","Unit":"Cel","Time":10,"Value":20.5}"#)
            .normalize()
            .unwrap();
        let json = serde_json::to_value(vec![record]).unwrap();

        assert_eq!(json[0]["Name"], "t1:temp");
        assert_eq!(json[0]["Unit"], "Cel");
        assert_eq!(json[0]["Time"], 10.0);
        assert_eq!(json[0]["Value"], 20.5);
        assert!(json[0].get("StringValue").is_none());
    }

    #[test]
    fn test_encode_skips_missing_optional_fields() {
        let record = raw(r#"{"Name":"door","BoolValue":true}"#).normalize().unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "door", "BoolValue": true}));
    }
}
