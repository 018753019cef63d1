//! Flat notification documents built from canal change entries.
//!
//! Each message payload is expected to hold one canal entry encoded as JSON.
//! Enum fields accept either the canal name (`"ROWDATA"`, `"INSERT"`) or its
//! numeric code. Payloads that cannot be read still produce a notice, carrying
//! an `error` field.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::source::SourceMessage;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(default)]
    pub header: Header,
    pub entry_type: EntryType,
    #[serde(default)]
    pub row_change: Option<RowChange>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Header {
    pub logfile_name: String,
    pub logfile_offset: i64,
    pub execute_time: i64,
    pub schema_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RowChange {
    pub is_ddl: bool,
    pub sql: String,
    pub event_type: EventType,
    pub row_datas: Vec<RowData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RowData {
    pub before_columns: Vec<Column>,
    pub after_columns: Vec<Column>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Column {
    pub name: String,
    pub value: String,
    pub is_key: bool,
}

/// Name or numeric code, as canal may emit either.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeOrName {
    Code(i32),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "CodeOrName")]
pub enum EntryType {
    TransactionBegin,
    RowData,
    TransactionEnd,
    Heartbeat,
    GtidLog,
    Unknown(i32),
}

impl EntryType {
    pub fn code(self) -> i32 {
        match self {
            EntryType::TransactionBegin => 1,
            EntryType::RowData => 2,
            EntryType::TransactionEnd => 3,
            EntryType::Heartbeat => 4,
            EntryType::GtidLog => 5,
            EntryType::Unknown(code) => code,
        }
    }

    /// Name used in notices. Only the transaction markers and row data are
    /// named; everything else is `UNKNOWN`.
    pub fn notice_name(self) -> &'static str {
        match self {
            EntryType::TransactionBegin => "TRANSACTIONBEGIN",
            EntryType::TransactionEnd => "TRANSACTIONEND",
            EntryType::RowData => "ROWDATA",
            _ => "UNKNOWN",
        }
    }
}

impl From<CodeOrName> for EntryType {
    fn from(raw: CodeOrName) -> Self {
        let code = match raw {
            CodeOrName::Code(code) => code,
            CodeOrName::Name(name) => match name.as_str() {
                "TRANSACTIONBEGIN" => 1,
                "ROWDATA" => 2,
                "TRANSACTIONEND" => 3,
                "HEARTBEAT" => 4,
                "GTIDLOG" => 5,
                _ => 0,
            },
        };
        match code {
            1 => EntryType::TransactionBegin,
            2 => EntryType::RowData,
            3 => EntryType::TransactionEnd,
            4 => EntryType::Heartbeat,
            5 => EntryType::GtidLog,
            other => EntryType::Unknown(other),
        }
    }
}

const EVENT_NAMES: [&str; 15] = [
    "INSERT",
    "UPDATE",
    "DELETE",
    "CREATE",
    "ALTER",
    "ERASE",
    "QUERY",
    "TRUNCATE",
    "RENAME",
    "CINDEX",
    "DINDEX",
    "GTID",
    "XACOMMIT",
    "XAROLLBACK",
    "MHEARTBEAT",
];

/// Canal event type, kept as its numeric code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "CodeOrName")]
pub struct EventType(pub i32);

impl EventType {
    pub const INSERT: EventType = EventType(1);
    pub const UPDATE: EventType = EventType(2);
    pub const DELETE: EventType = EventType(3);
}

impl From<CodeOrName> for EventType {
    fn from(raw: CodeOrName) -> Self {
        match raw {
            CodeOrName::Code(code) => EventType(code),
            CodeOrName::Name(name) => EVENT_NAMES
                .iter()
                .position(|known| *known == name)
                .map(|index| EventType(index as i32 + 1))
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub logfile_name: String,
    pub logfile_offset: String,
    pub execute_time: i64,
    pub entry_type: i32,
    pub entry_type_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ddl: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Set on every row data notice. A change without rows serializes as an
    /// empty array, never `null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_datas: Option<Vec<RowNotice>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowNotice {
    pub event_type_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_keys: Option<BTreeMap<String, String>>,
}

impl Notice {
    pub fn from_entry(entry: &Entry) -> Self {
        let header = &entry.header;
        let mut notice = Notice {
            logfile_name: header.logfile_name.clone(),
            logfile_offset: header.logfile_offset.to_string(),
            execute_time: header.execute_time,
            entry_type: entry.entry_type.code(),
            entry_type_name: entry.entry_type.notice_name(),
            ..Default::default()
        };

        if entry.entry_type != EntryType::RowData {
            return notice;
        }

        let Some(row_change) = &entry.row_change else {
            notice.error = Some("row data entry without row change".to_string());
            return notice;
        };

        notice.is_ddl = Some(row_change.is_ddl);
        notice.sql = Some(row_change.sql.clone());
        notice.event_type = Some(row_change.event_type.0);
        notice.schema_name = Some(header.schema_name.clone());
        notice.table_name = Some(header.table_name.clone());
        notice.row_datas = Some(
            row_change
                .row_datas
                .iter()
                .map(|row| RowNotice::new(row_change.event_type, row))
                .collect(),
        );
        notice
    }

    pub fn from_payload(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Entry>(payload) {
            Ok(entry) => Self::from_entry(&entry),
            Err(err) => Notice {
                logfile_offset: "0".to_string(),
                entry_type_name: EntryType::Unknown(0).notice_name(),
                error: Some(err.to_string()),
                ..Default::default()
            },
        }
    }
}

impl RowNotice {
    fn new(event_type: EventType, row: &RowData) -> Self {
        let (name, columns) = match event_type {
            EventType::DELETE => ("DELETE", Some(&row.before_columns)),
            EventType::INSERT => ("INSERT", Some(&row.after_columns)),
            EventType::UPDATE => ("UPDATE", Some(&row.after_columns)),
            _ => ("UNKNOWN", None),
        };
        RowNotice {
            event_type_name: name,
            primary_keys: columns.map(|columns| primary_keys(columns)),
        }
    }
}

fn primary_keys(columns: &[Column]) -> BTreeMap<String, String> {
    columns
        .iter()
        .filter(|column| column.is_key)
        .map(|column| (column.name.clone(), column.value.clone()))
        .collect()
}

/// One notice per message, in message order.
pub fn build_notices(messages: &[SourceMessage]) -> Vec<Notice> {
    messages
        .iter()
        .map(|message| Notice::from_payload(&message.payload))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_row_data_insert() {
        let notice = Notice::from_payload(&payload(json!({
            "header": {
                "logfileName": "mysql-bin.000003",
                "logfileOffset": 1024,
                "executeTime": 1700000000000i64,
                "schemaName": "shop",
                "tableName": "orders"
            },
            "entryType": "ROWDATA",
            "rowChange": {
                "isDdl": false,
                "sql": "",
                "eventType": "INSERT",
                "rowDatas": [{
                    "afterColumns": [
                        {"name": "id", "value": "42", "isKey": true},
                        {"name": "tenant", "value": "7", "isKey": true},
                        {"name": "total", "value": "9.90"}
                    ]
                }]
            }
        })));

        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(
            value,
            json!({
                "logfileName": "mysql-bin.000003",
                "logfileOffset": "1024",
                "executeTime": 1700000000000i64,
                "entryType": 2,
                "entryTypeName": "ROWDATA",
                "isDdl": false,
                "sql": "",
                "eventType": 1,
                "schemaName": "shop",
                "tableName": "orders",
                "rowDatas": [{
                    "eventTypeName": "INSERT",
                    "primaryKeys": {"id": "42", "tenant": "7"}
                }]
            })
        );
    }

    #[test]
    fn test_delete_uses_before_columns() {
        let notice = Notice::from_payload(&payload(json!({
            "entryType": 2,
            "rowChange": {
                "eventType": 3,
                "rowDatas": [{
                    "beforeColumns": [{"name": "id", "value": "1", "isKey": true}],
                    "afterColumns": [{"name": "id", "value": "2", "isKey": true}]
                }]
            }
        })));

        let rows = notice.row_datas.unwrap();
        assert_eq!(rows[0].event_type_name, "DELETE");
        assert_eq!(rows[0].primary_keys.as_ref().unwrap()["id"], "1");
    }

    #[test]
    fn test_unknown_event_has_no_keys() {
        let notice = Notice::from_payload(&payload(json!({
            "entryType": "ROWDATA",
            "rowChange": {"isDdl": true, "sql": "ALTER TABLE t ADD c INT", "eventType": "ALTER", "rowDatas": [{}]}
        })));

        assert_eq!(notice.event_type, Some(5));
        let rows = notice.row_datas.unwrap();
        assert_eq!(
            rows,
            vec![RowNotice {
                event_type_name: "UNKNOWN",
                primary_keys: None
            }]
        );
    }

    #[test]
    fn test_row_change_without_rows_is_empty_array() {
        let notice = Notice::from_payload(&payload(json!({
            "entryType": "ROWDATA",
            "rowChange": {"eventType": "UPDATE"}
        })));

        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["rowDatas"], json!([]));
        assert_eq!(value["eventType"], 2);
    }

    #[test]
    fn test_transaction_markers() {
        let begin = Notice::from_payload(&payload(json!({"entryType": "TRANSACTIONBEGIN"})));
        assert_eq!(begin.entry_type, 1);
        assert_eq!(begin.entry_type_name, "TRANSACTIONBEGIN");
        assert!(begin.row_datas.is_none());

        let heartbeat = Notice::from_payload(&payload(json!({"entryType": "HEARTBEAT"})));
        assert_eq!(heartbeat.entry_type, 4);
        assert_eq!(heartbeat.entry_type_name, "UNKNOWN");
    }

    #[test]
    fn test_missing_row_change_is_reported() {
        let notice = Notice::from_payload(&payload(json!({"entryType": "ROWDATA"})));
        assert_eq!(notice.entry_type_name, "ROWDATA");
        assert!(notice.error.is_some());
        assert!(notice.row_datas.is_none());
    }

    #[test]
    fn test_invalid_payload_is_reported() {
        let notice = Notice::from_payload(b"not json");
        assert_eq!(notice.entry_type_name, "UNKNOWN");
        assert!(notice.error.is_some());

        let value = serde_json::to_value(&notice).unwrap();
        assert!(value.get("rowDatas").is_none());
    }
}
