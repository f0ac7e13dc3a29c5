// ABOUTME: Change detection by comparing ERP and remote AlterID high-water marks
// ABOUTME: Decides which partitions to re-extract and when to fall back to a cold full load

use std::fmt;

use super::state::AlterCounters;
use crate::erp::{extract_table, ErpTransport, RequestOptions};
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::table_spec::{Partition, SemanticType, TableSpec};

/// Destinations with fewer records than this are treated as empty.
pub const DEFAULT_COLD_START_THRESHOLD: u64 = 100;

/// Which partitions moved since the remote's last recorded marks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub master_changed: bool,
    pub transaction_changed: bool,
}

impl ChangeSet {
    pub fn is_changed(&self, partition: Partition) -> bool {
        match partition {
            Partition::Master => self.master_changed,
            Partition::Transaction => self.transaction_changed,
        }
    }

    pub fn any(&self) -> bool {
        self.master_changed || self.transaction_changed
    }

    /// Changed partitions, master first.
    pub fn partitions(&self) -> Vec<Partition> {
        [Partition::Master, Partition::Transaction]
            .into_iter()
            .filter(|p| self.is_changed(*p))
            .collect()
    }
}

/// A partition changed iff the ERP's counter is strictly ahead of the remote's.
pub fn decide(remote: &AlterCounters, source: &AlterCounters) -> ChangeSet {
    ChangeSet {
        master_changed: source.master > remote.master,
        transaction_changed: source.transaction > remote.transaction,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdReason {
    /// The destination holds fewer records than the threshold
    EmptyDestination { total_records: u64 },
    /// Remote counters could not be read; fail toward doing more work
    CounterReadFailed(String),
    /// An operator asked for a full reload
    Forced,
}

impl fmt::Display for ColdReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColdReason::EmptyDestination { total_records } => {
                write!(f, "destination holds only {} records", total_records)
            }
            ColdReason::CounterReadFailed(e) => write!(f, "remote counters unavailable ({})", e),
            ColdReason::Forced => write!(f, "full sync requested"),
        }
    }
}

/// What the orchestrator should do this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Cold(ColdReason),
    Incremental {
        remote: AlterCounters,
        source: AlterCounters,
        changes: ChangeSet,
    },
}

/// Remote marks plus the total record count used for the cold-start check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteSnapshot {
    pub counters: AlterCounters,
    pub total_records: u64,
}

/// Descriptor for the company-level counter query.
///
/// Always scoped to the current company, the same one the data tables export,
/// whether it was named in `SVCURRENTCOMPANY` or is the ERP's active one.
pub fn counters_spec() -> TableSpec {
    TableSpec::new("company_counters", Partition::Master, "Company")
        .field("guid", "Guid", SemanticType::Text)
        .field("name", "Name", SemanticType::Text)
        .field("alt_mst_id", "AltMstId", SemanticType::Number)
        .field("alt_vch_id", "AltVchId", SemanticType::Number)
        .filter("$$IsEqual:$Name:##SVCurrentCompany")
}

pub struct ChangeTracker<'a, T: ErpTransport, S: RemoteStore> {
    erp: &'a T,
    store: &'a S,
    options: &'a RequestOptions,
    cold_threshold: u64,
}

impl<'a, T: ErpTransport, S: RemoteStore> ChangeTracker<'a, T, S> {
    pub fn new(erp: &'a T, store: &'a S, options: &'a RequestOptions, cold_threshold: u64) -> Self {
        Self {
            erp,
            store,
            options,
            cold_threshold,
        }
    }

    /// Read the remote's recorded marks. Busy sentinels and timeouts become `CounterRead`.
    pub async fn remote_counters(&self) -> SyncResult<RemoteSnapshot> {
        let meta = self
            .store
            .metadata()
            .await
            .map_err(|e| SyncError::CounterRead(e.to_string()))?;
        Ok(RemoteSnapshot {
            counters: AlterCounters::new(meta.last_alter_id_master, meta.last_alter_id_transaction),
            total_records: meta.total_records(),
        })
    }

    /// Ask the ERP for the company's current AlterIDs.
    pub async fn source_counters(&self) -> SyncResult<AlterCounters> {
        let spec = counters_spec();
        let records = extract_table(self.erp, &spec, self.options).await?;
        let company = match records.as_slice() {
            [company] => company,
            [] => return Err(SyncError::parse(&spec.name, "no company is loaded in the ERP")),
            _ => {
                return Err(SyncError::parse(
                    &spec.name,
                    format!("{} companies matched the current company", records.len()),
                ))
            }
        };

        let read = |field: &str| {
            company
                .get(field)
                .and_then(|v| v.as_f64())
                .map(|v| v.max(0.0) as u64)
                .unwrap_or(0)
        };
        Ok(AlterCounters::new(read("alt_mst_id"), read("alt_vch_id")))
    }

    /// Decide between a cold full load and an incremental pass.
    ///
    /// The cold-start check wins over counter comparison. Only a failure to
    /// read the ERP's own counters is returned as an error.
    pub async fn assess(&self) -> SyncResult<Decision> {
        let remote = match self.remote_counters().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Assuming cold destination: {}", e);
                return Ok(Decision::Cold(ColdReason::CounterReadFailed(e.to_string())));
            }
        };

        if remote.total_records < self.cold_threshold {
            return Ok(Decision::Cold(ColdReason::EmptyDestination {
                total_records: remote.total_records,
            }));
        }

        let source = self.source_counters().await?;
        let changes = decide(&remote.counters, &source);
        tracing::debug!(
            "Counters: source {:?}, remote {:?} -> {:?}",
            source,
            remote.counters,
            changes
        );

        Ok(Decision::Incremental {
            remote: remote.counters,
            source,
            changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::models::{BulkSyncRequest, BulkSyncResponse, MetadataResponse};
    use std::collections::BTreeMap;

    /// ERP that answers every request with the given company rows.
    struct CompanyErp(Vec<(u64, u64)>);

    impl ErpTransport for CompanyErp {
        async fn send(&self, _xml: &str, _bulk: bool) -> SyncResult<String> {
            let mut out = String::from("<ENVELOPE>");
            for (i, (master, transaction)) in self.0.iter().enumerate() {
                out.push_str(&format!(
                    "<F01>c-{i}</F01><F02>Company {i}</F02><F03>{master}</F03><F04>{transaction}</F04>"
                ));
            }
            out.push_str("</ENVELOPE>");
            Ok(out)
        }

        async fn check(&self) -> SyncResult<()> {
            Ok(())
        }
    }

    /// Store whose metadata is fixed, or busy when `None`.
    struct MetadataStore(Option<(u64, u64, u64)>);

    impl RemoteStore for MetadataStore {
        async fn health(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn metadata(&self) -> SyncResult<MetadataResponse> {
            let (master, transaction, records) = self
                .0
                .ok_or_else(|| SyncError::Busy("bulk load in progress".to_string()))?;
            Ok(MetadataResponse {
                last_alter_id_master: master,
                last_alter_id_transaction: transaction,
                tables: BTreeMap::from([("ledgers".to_string(), records)]),
                ..Default::default()
            })
        }

        async fn bulk_sync(&self, _request: &BulkSyncRequest<'_>) -> SyncResult<BulkSyncResponse> {
            unreachable!("the tracker never writes")
        }
    }

    async fn assess(erp: &CompanyErp, store: &MetadataStore) -> SyncResult<Decision> {
        let options = RequestOptions::default();
        ChangeTracker::new(erp, store, &options, DEFAULT_COLD_START_THRESHOLD)
            .assess()
            .await
    }

    #[tokio::test]
    async fn test_assess_cold_start_wins_over_matching_counters() {
        let erp = CompanyErp(vec![(100, 450)]);
        let store = MetadataStore(Some((100, 450, 5)));

        let decision = assess(&erp, &store).await.unwrap();
        assert_eq!(
            decision,
            Decision::Cold(ColdReason::EmptyDestination { total_records: 5 })
        );
    }

    #[tokio::test]
    async fn test_assess_busy_store_is_cold() {
        let erp = CompanyErp(vec![(100, 450)]);
        let decision = assess(&erp, &MetadataStore(None)).await.unwrap();
        assert!(matches!(
            decision,
            Decision::Cold(ColdReason::CounterReadFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_assess_incremental_when_populated() {
        let erp = CompanyErp(vec![(120, 450)]);
        let store = MetadataStore(Some((100, 450, 5_000)));

        let decision = assess(&erp, &store).await.unwrap();
        assert_eq!(
            decision,
            Decision::Incremental {
                remote: AlterCounters::new(100, 450),
                source: AlterCounters::new(120, 450),
                changes: ChangeSet {
                    master_changed: true,
                    transaction_changed: false,
                },
            }
        );
    }

    #[tokio::test]
    async fn test_source_counters_reject_ambiguous_company() {
        let erp = CompanyErp(vec![(120, 450), (900, 900)]);
        let store = MetadataStore(Some((100, 450, 5_000)));
        let options = RequestOptions::default();
        let tracker = ChangeTracker::new(&erp, &store, &options, DEFAULT_COLD_START_THRESHOLD);

        let err = tracker.source_counters().await.unwrap_err();
        assert!(err.to_string().contains("2 companies"));
        assert!(tracker.assess().await.is_err());
    }

    #[test]
    fn test_decide_only_strictly_greater() {
        let remote = AlterCounters::new(80, 50);
        let source = AlterCounters::new(100, 50);
        let changes = decide(&remote, &source);
        assert!(changes.master_changed);
        assert!(!changes.transaction_changed);
        assert_eq!(changes.partitions(), vec![Partition::Master]);
    }

    #[test]
    fn test_decide_source_behind_is_unchanged() {
        let changes = decide(&AlterCounters::new(100, 60), &AlterCounters::new(90, 60));
        assert!(!changes.any());
        assert!(changes.partitions().is_empty());
    }

    #[test]
    fn test_counters_spec_is_scoped_to_current_company() {
        let spec = counters_spec();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.filters, vec!["$$IsEqual:$Name:##SVCurrentCompany"]);

        let xml = crate::erp::compile(&spec, &RequestOptions::default()).unwrap();
        assert!(xml.contains("##SVCurrentCompany"));
    }

    #[test]
    fn test_cold_reason_display() {
        let reason = ColdReason::EmptyDestination { total_records: 5 };
        assert_eq!(reason.to_string(), "destination holds only 5 records");
    }
}
