// ABOUTME: Batched, idempotent replication of extracted records into the remote store
// ABOUTME: Splits records into tagged batches, retries each batch, and continues past failures

use std::time::Duration;

use super::client::RemoteStore;
use super::models::{BatchMetadata, BulkSyncRequest, SyncType};
use crate::erp::Record;
use crate::error::{SyncError, SyncResult};
use crate::table_spec::Partition;
use crate::utils::retry_with_fixed_backoff;

/// Reserved table the orchestrator writes partition high-water marks into.
pub const SYNC_STATE_TABLE: &str = "sync_state";

/// Tuning knobs for the replication client.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub batch_size: usize,
    /// Immediate retries per batch after the first attempt
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Tag written into each batch's metadata
    pub source: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_retries: 2,
            retry_backoff: Duration::from_secs(2),
            source: "erp".to_string(),
        }
    }
}

/// Result of pushing one table's records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub accepted: u64,
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub last_error: Option<String>,
}

impl PushOutcome {
    pub fn is_complete(&self) -> bool {
        self.batches_failed == 0
    }

    /// Convert a partial push into an error so the caller keeps the partition unadvanced.
    pub fn into_result(self, table: &str) -> SyncResult<PushOutcome> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(SyncError::replication(
                table,
                format!(
                    "{} of {} batches failed (last error: {})",
                    self.batches_failed,
                    self.batches_sent + self.batches_failed,
                    self.last_error.as_deref().unwrap_or("unknown")
                ),
            ))
        }
    }
}

/// Pushes records for one table at a time, one bulk-sync call per batch.
///
/// The store upserts on GUID plus tenant identifiers, so resending a batch
/// is harmless; delivery is at-least-once.
pub struct ReplicationClient<'a, S: RemoteStore> {
    store: &'a S,
    config: ReplicationConfig,
}

impl<'a, S: RemoteStore> ReplicationClient<'a, S> {
    pub fn new(store: &'a S, config: ReplicationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Push `records` for `table` in order. A batch that still fails after its
    /// retries is logged and skipped; the remaining batches are still sent.
    pub async fn push(
        &self,
        table: &str,
        records: &[Record],
        sync_type: SyncType,
        run_id: &str,
    ) -> PushOutcome {
        let batch_size = self.config.batch_size.max(1);
        let total_batches = records.len().div_ceil(batch_size);
        let mut outcome = PushOutcome::default();

        for (i, chunk) in records.chunks(batch_size).enumerate() {
            let request = BulkSyncRequest {
                table,
                data: chunk,
                sync_type,
                metadata: BatchMetadata {
                    batch_index: i + 1,
                    total_batches,
                    record_count: chunk.len(),
                    run_id: run_id.to_string(),
                    source: self.config.source.clone(),
                },
            };

            match self.send_batch(&request).await {
                Ok(accepted) => {
                    outcome.accepted += accepted;
                    outcome.batches_sent += 1;
                    tracing::debug!(
                        "Pushed {} batch {}/{} ({} records)",
                        table,
                        i + 1,
                        total_batches,
                        chunk.len()
                    );
                }
                Err(e) => {
                    tracing::error!(
                        "Batch {}/{} for {} failed after {} retries: {}",
                        i + 1,
                        total_batches,
                        table,
                        self.config.max_retries,
                        e
                    );
                    outcome.batches_failed += 1;
                    outcome.last_error = Some(e.to_string());
                }
            }
        }

        if total_batches > 0 {
            tracing::info!(
                "Replicated {}: {} records accepted in {}/{} batches",
                table,
                outcome.accepted,
                outcome.batches_sent,
                total_batches
            );
        }
        outcome
    }

    async fn send_batch(&self, request: &BulkSyncRequest<'_>) -> SyncResult<u64> {
        let label = format!(
            "bulk-sync {} batch {}/{}",
            request.table, request.metadata.batch_index, request.metadata.total_batches
        );
        let store = self.store;
        retry_with_fixed_backoff(
            move || async move {
                let response = store.bulk_sync(request).await?;
                if !response.success {
                    let reason = response
                        .error
                        .or(response.message)
                        .unwrap_or_else(|| "store reported success=false".to_string());
                    return Err(SyncError::replication(request.table, reason));
                }
                Ok(response.upserted.unwrap_or(request.data.len() as u64))
            },
            self.config.max_retries,
            self.config.retry_backoff,
            &label,
        )
        .await
    }

    /// Persist a partition's high-water mark into the reserved state table.
    pub async fn record_counter(
        &self,
        partition: Partition,
        alter_id: u64,
        tenant_id: &str,
        sub_tenant_id: &str,
        run_id: &str,
    ) -> SyncResult<()> {
        let mut map = serde_json::Map::new();
        map.insert(
            "guid".to_string(),
            serde_json::Value::String(format!("alter_id_{}", partition)),
        );
        map.insert("tenant_id".to_string(), tenant_id.into());
        map.insert("sub_tenant_id".to_string(), sub_tenant_id.into());
        map.insert("partition".to_string(), partition.as_str().into());
        map.insert("last_alter_id".to_string(), alter_id.into());
        map.insert(
            "updated_at".to_string(),
            chrono::Utc::now().to_rfc3339().into(),
        );
        let records = [Record::from(map)];

        let request = BulkSyncRequest {
            table: SYNC_STATE_TABLE,
            data: &records,
            sync_type: SyncType::Incremental,
            metadata: BatchMetadata {
                batch_index: 1,
                total_batches: 1,
                record_count: 1,
                run_id: run_id.to_string(),
                source: self.config.source.clone(),
            },
        };
        self.send_batch(&request).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::models::{BulkSyncResponse, MetadataResponse};
    use std::sync::Mutex;

    /// Store that records every call and fails the batch indexes listed in `fail_batches`.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(String, usize, usize, usize)>>,
        fail_batches: Vec<usize>,
    }

    impl RemoteStore for RecordingStore {
        async fn health(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn metadata(&self) -> SyncResult<MetadataResponse> {
            Ok(MetadataResponse::default())
        }

        async fn bulk_sync(&self, request: &BulkSyncRequest<'_>) -> SyncResult<BulkSyncResponse> {
            self.calls.lock().unwrap().push((
                request.table.to_string(),
                request.metadata.batch_index,
                request.metadata.total_batches,
                request.data.len(),
            ));
            if self.fail_batches.contains(&request.metadata.batch_index) {
                return Err(SyncError::Remote("connection reset".to_string()));
            }
            Ok(BulkSyncResponse {
                success: true,
                message: None,
                error: None,
                upserted: None,
            })
        }
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let mut map = serde_json::Map::new();
                map.insert("guid".to_string(), format!("g-{}", i).into());
                Record::from(map)
            })
            .collect()
    }

    fn fast_config(batch_size: usize) -> ReplicationConfig {
        ReplicationConfig {
            batch_size,
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
            source: "erp".to_string(),
        }
    }

    #[tokio::test]
    async fn test_push_splits_into_tagged_batches() {
        let store = RecordingStore::default();
        let client = ReplicationClient::new(&store, fast_config(50));

        let outcome = client
            .push("ledgers", &records(130), SyncType::Full, "run-1")
            .await;

        assert_eq!(outcome.accepted, 130);
        assert_eq!(outcome.batches_sent, 3);
        assert!(outcome.is_complete());

        let calls = store.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                ("ledgers".to_string(), 1, 3, 50),
                ("ledgers".to_string(), 2, 3, 50),
                ("ledgers".to_string(), 3, 3, 30),
            ]
        );
    }

    #[tokio::test]
    async fn test_push_continues_after_failed_batch() {
        let store = RecordingStore {
            fail_batches: vec![2],
            ..Default::default()
        };
        let client = ReplicationClient::new(&store, fast_config(50));

        let outcome = client
            .push("ledgers", &records(130), SyncType::Incremental, "run-1")
            .await;

        assert_eq!(outcome.accepted, 80);
        assert_eq!(outcome.batches_sent, 2);
        assert_eq!(outcome.batches_failed, 1);
        assert!(outcome.clone().into_result("ledgers").is_err());

        // Batch 2 is attempted twice (1 retry), batch 3 still goes out
        let indexes: Vec<usize> = store.calls.lock().unwrap().iter().map(|c| c.1).collect();
        assert_eq!(indexes, vec![1, 2, 2, 3]);
    }

    #[tokio::test]
    async fn test_push_empty_sends_nothing() {
        let store = RecordingStore::default();
        let client = ReplicationClient::new(&store, fast_config(50));
        let outcome = client.push("ledgers", &[], SyncType::Full, "run-1").await;
        assert_eq!(outcome, PushOutcome::default());
        assert!(store.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_counter_targets_state_table() {
        let store = RecordingStore::default();
        let client = ReplicationClient::new(&store, fast_config(50));
        client
            .record_counter(Partition::Master, 100, "acme", "hq", "run-1")
            .await
            .unwrap();
        let calls = store.calls.lock().unwrap();
        assert_eq!(calls[0], (SYNC_STATE_TABLE.to_string(), 1, 1, 1));
    }
}
