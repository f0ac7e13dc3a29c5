// ABOUTME: Request and response bodies for the remote store's HTTP API
// ABOUTME: These are serialized to JSON for bulk-sync, metadata, query, and stats calls

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::erp::Record;

/// How a bulk-sync call should be interpreted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
    Test,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
            SyncType::Test => "test",
        };
        f.write_str(s)
    }
}

/// Batch bookkeeping sent alongside each bulk-sync payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    /// 1-based position of this batch within the table's push
    pub batch_index: usize,
    pub total_batches: usize,
    pub record_count: usize,
    pub run_id: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSyncRequest<'a> {
    pub table: &'a str,
    pub data: &'a [Record],
    pub sync_type: SyncType,
    pub metadata: BatchMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkSyncResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Rows the store reports as inserted or updated
    #[serde(default)]
    pub upserted: Option<u64>,
}

/// Metadata as reported by `GET /metadata/{tenant}/{sub_tenant}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataResponse {
    #[serde(default)]
    pub last_alter_id_master: u64,
    #[serde(default)]
    pub last_alter_id_transaction: u64,
    /// Per-table record counts
    #[serde(default)]
    pub tables: BTreeMap<String, u64>,
    /// Sentinel set while another writer's bulk load is in progress
    #[serde(default)]
    pub busy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl MetadataResponse {
    pub fn total_records(&self) -> u64 {
        self.tables.values().sum()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<serde_json::Value>>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub next_offset: Option<u64>,
    #[serde(default)]
    pub busy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bulk_sync_request_serialization() {
        let mut map = serde_json::Map::new();
        map.insert("guid".to_string(), json!("g-1"));
        let records = vec![Record::from(map)];

        let request = BulkSyncRequest {
            table: "ledgers",
            data: &records,
            sync_type: SyncType::Incremental,
            metadata: BatchMetadata {
                batch_index: 1,
                total_batches: 3,
                record_count: 1,
                run_id: "run-1".to_string(),
                source: "erp".to_string(),
            },
        };

        let parsed = serde_json::to_value(&request).unwrap();
        assert_eq!(parsed["table"], "ledgers");
        assert_eq!(parsed["sync_type"], "incremental");
        assert_eq!(parsed["data"], json!([{"guid": "g-1"}]));
        assert_eq!(parsed["metadata"]["batch_index"], 1);
        assert_eq!(parsed["metadata"]["total_batches"], 3);
    }

    #[test]
    fn test_metadata_response_defaults() {
        let meta: MetadataResponse = serde_json::from_value(json!({
            "last_alter_id_master": 120,
            "tables": {"ledgers": 40, "vouchers": 75}
        }))
        .unwrap();
        assert_eq!(meta.last_alter_id_master, 120);
        assert_eq!(meta.last_alter_id_transaction, 0);
        assert_eq!(meta.total_records(), 115);
        assert!(!meta.busy);

        let busy: MetadataResponse =
            serde_json::from_value(json!({"busy": true, "message": "bulk load in progress"}))
                .unwrap();
        assert!(busy.busy);
    }

    #[test]
    fn test_query_request_skips_unset_fields() {
        let request = QueryRequest {
            table: Some("ledgers".to_string()),
            limit: 10,
            ..Default::default()
        };
        let parsed = serde_json::to_value(&request).unwrap();
        assert_eq!(parsed["table"], "ledgers");
        assert!(parsed.get("sql").is_none());
        assert_eq!(parsed["offset"], 0);
    }
}
