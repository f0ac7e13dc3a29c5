// ABOUTME: SyncDaemon orchestrates scheduled extraction and replication cycles
// ABOUTME: Single-flight per process, per-table failure isolation, per-partition counter advance

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};

use super::state::{AlterCounters, LastCycle, SyncState};
use super::tracker::{ChangeTracker, ColdReason, Decision};
use crate::config::TableCatalog;
use crate::erp::{extract_table, ErpTransport, Provenance, RequestOptions};
use crate::error::SyncResult;
use crate::remote::{RemoteStore, ReplicationClient, ReplicationConfig, SyncType};
use crate::table_spec::{Partition, TableSpec};

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Interval between sync cycles
    pub sync_interval: Duration,
    /// Remote record count below which the destination counts as empty
    pub cold_start_threshold: u64,
    /// Local mirror of the counters; None keeps state in memory only
    pub state_path: Option<PathBuf>,
    pub replication: ReplicationConfig,
    pub request: RequestOptions,
    pub tenant_id: String,
    pub sub_tenant_id: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300), // 5 minutes
            cold_start_threshold: super::tracker::DEFAULT_COLD_START_THRESHOLD,
            state_path: None,
            replication: ReplicationConfig::default(),
            request: RequestOptions::default(),
            tenant_id: String::new(),
            sub_tenant_id: String::new(),
        }
    }
}

/// How a cycle picks its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Let the change tracker decide between cold and incremental
    Auto,
    /// Re-extract every table regardless of counters
    Full,
}

/// What a cycle ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CycleKind {
    #[default]
    Idle,
    Cold(String),
    Incremental(Vec<Partition>),
}

impl CycleKind {
    fn label(&self) -> &'static str {
        match self {
            CycleKind::Idle => "idle",
            CycleKind::Cold(_) => "full",
            CycleKind::Incremental(_) => "incremental",
        }
    }
}

/// Statistics from a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub run_id: String,
    pub kind: CycleKind,
    pub tables_synced: usize,
    pub tables_failed: usize,
    pub records_synced: u64,
    pub partitions_advanced: Vec<Partition>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if the sync cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Resets the single-flight flag even if the cycle future is dropped mid-way.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// SyncDaemon coordinates the pipeline for every configured table.
///
/// Each cycle:
/// 1. Checks that both the ERP and the remote store are reachable
/// 2. Asks the change tracker for a cold or incremental decision
/// 3. Extracts and replicates the affected partitions, tables in order
/// 4. Advances each partition's counter only if all its tables succeeded
pub struct SyncDaemon<T: ErpTransport, S: RemoteStore> {
    erp: T,
    store: S,
    tables: TableCatalog,
    config: DaemonConfig,
    running: AtomicBool,
    cycles: AtomicU64,
    state: Mutex<SyncState>,
}

impl<T: ErpTransport, S: RemoteStore> SyncDaemon<T, S> {
    /// Create a daemon. Every table descriptor is validated here, before any I/O.
    pub fn new(
        erp: T,
        store: S,
        tables: TableCatalog,
        config: DaemonConfig,
        state: SyncState,
    ) -> SyncResult<Self> {
        tables.validate()?;
        Ok(Self {
            erp,
            store,
            tables,
            config,
            running: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            state: Mutex::new(state),
        })
    }

    pub fn erp(&self) -> &T {
        &self.erp
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tables(&self) -> &TableCatalog {
        &self.tables
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The locally mirrored high-water marks.
    pub async fn counters(&self) -> AlterCounters {
        self.state.lock().await.counters
    }

    pub fn tracker(&self) -> ChangeTracker<'_, T, S> {
        ChangeTracker::new(
            &self.erp,
            &self.store,
            &self.config.request,
            self.config.cold_start_threshold,
        )
    }

    fn replication(&self) -> ReplicationClient<'_, S> {
        ReplicationClient::new(&self.store, self.config.replication.clone())
    }

    /// Run a cycle unless one is already in flight.
    ///
    /// Returns `None` when the trigger was dropped because another cycle is
    /// running; overlapping triggers are never queued.
    pub async fn try_run_cycle(&self, mode: SyncMode) -> Option<SyncResult<SyncStats>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Sync cycle already running, dropping trigger");
            return None;
        }
        let _guard = RunningGuard(&self.running);
        Some(self.run_cycle(mode).await)
    }

    async fn run_cycle(&self, mode: SyncMode) -> SyncResult<SyncStats> {
        let start = std::time::Instant::now();
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let mut stats = SyncStats {
            run_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        };
        tracing::info!("Starting sync cycle {} (run {})", cycle, stats.run_id);

        // Connectivity failures abort the whole cycle; the next tick retries.
        self.erp.check().await?;
        self.store.health().await?;

        let tracker = self.tracker();
        let decision = match mode {
            SyncMode::Full => Decision::Cold(ColdReason::Forced),
            SyncMode::Auto => tracker.assess().await?,
        };

        match decision {
            Decision::Cold(reason) => {
                tracing::info!("Cold start: {}; extracting all tables", reason);
                stats.kind = CycleKind::Cold(reason.to_string());

                // Read the baseline before extracting so changes made mid-cycle
                // are picked up by the next incremental pass.
                let baseline = match tracker.source_counters().await {
                    Ok(counters) => Some(counters),
                    Err(e) => {
                        tracing::warn!("Could not read ERP counters, baseline will not move: {}", e);
                        stats.errors.push(format!("Failed to read ERP counters: {}", e));
                        None
                    }
                };

                for partition in [Partition::Master, Partition::Transaction] {
                    let complete = self
                        .sync_partition(partition, None, SyncType::Full, &mut stats)
                        .await;
                    if let (true, Some(source)) = (complete, baseline) {
                        self.persist_counter(partition, source.get(partition), &mut stats)
                            .await;
                    }
                }
            }
            Decision::Incremental {
                remote,
                source,
                changes,
            } => {
                let partitions = changes.partitions();
                if partitions.is_empty() {
                    tracing::info!("No changes since AlterIDs {:?}", remote);
                }
                stats.kind = CycleKind::Incremental(partitions.clone());

                for partition in partitions {
                    let floor = remote.get(partition);
                    tracing::info!(
                        "{} partition changed (AlterID {} -> {})",
                        partition,
                        floor,
                        source.get(partition)
                    );
                    let complete = self
                        .sync_partition(partition, Some(floor), SyncType::Incremental, &mut stats)
                        .await;
                    if complete {
                        self.persist_counter(partition, source.get(partition), &mut stats)
                            .await;
                    } else {
                        tracing::warn!(
                            "{} partition had failures; AlterID stays at {}",
                            partition,
                            floor
                        );
                    }
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        self.record_cycle(&stats).await;
        Ok(stats)
    }

    /// Sync every table of one partition in order. Returns true if all succeeded.
    async fn sync_partition(
        &self,
        partition: Partition,
        alter_id_floor: Option<u64>,
        sync_type: SyncType,
        stats: &mut SyncStats,
    ) -> bool {
        let mut complete = true;

        for spec in self.tables.partition(partition) {
            let scoped = match alter_id_floor {
                Some(floor) => spec.with_filter(format!("$AlterID > {}", floor)),
                None => spec.clone(),
            };

            match self.sync_table(&scoped, sync_type, &stats.run_id).await {
                Ok(records) => {
                    stats.tables_synced += 1;
                    stats.records_synced += records;
                }
                Err(e) => {
                    tracing::error!("Failed to sync {}: {}", spec.name, e);
                    stats.tables_failed += 1;
                    stats.errors.push(format!("Failed to sync {}: {}", spec.name, e));
                    complete = false;
                }
            }
        }

        complete
    }

    /// Extract one table and push it. Returns the number of accepted records.
    pub async fn sync_table(
        &self,
        spec: &TableSpec,
        sync_type: SyncType,
        run_id: &str,
    ) -> SyncResult<u64> {
        let mut records = extract_table(&self.erp, spec, &self.config.request).await?;
        if records.is_empty() {
            tracing::debug!("No rows extracted for {}", spec.name);
            return Ok(0);
        }

        let provenance = Provenance::new(
            &self.config.tenant_id,
            &self.config.sub_tenant_id,
            &self.config.replication.source,
        );
        for record in &mut records {
            record.stamp(&provenance);
        }

        let outcome = self
            .replication()
            .push(&spec.name, &records, sync_type, run_id)
            .await
            .into_result(&spec.name)?;
        Ok(outcome.accepted)
    }

    /// Record a partition's new baseline remotely, then mirror it locally.
    async fn persist_counter(&self, partition: Partition, value: u64, stats: &mut SyncStats) {
        let current = self.state.lock().await.counters.get(partition);
        if value < current {
            tracing::warn!(
                "ERP reports {} AlterID {} below recorded {}; keeping {}",
                partition,
                value,
                current,
                current
            );
            return;
        }

        let result = self
            .replication()
            .record_counter(
                partition,
                value,
                &self.config.tenant_id,
                &self.config.sub_tenant_id,
                &stats.run_id,
            )
            .await;

        match result {
            Ok(()) => {
                self.state.lock().await.advance(partition, value);
                stats.partitions_advanced.push(partition);
                tracing::info!("Advanced {} AlterID to {}", partition, value);
            }
            Err(e) => {
                tracing::error!("Failed to persist {} AlterID {}: {}", partition, value, e);
                stats
                    .errors
                    .push(format!("Failed to persist {} counter: {}", partition, e));
            }
        }
    }

    async fn record_cycle(&self, stats: &SyncStats) {
        let mut state = self.state.lock().await;
        state.record_cycle(LastCycle {
            run_id: stats.run_id.clone(),
            mode: stats.kind.label().to_string(),
            finished_at: chrono::Utc::now(),
            tables_synced: stats.tables_synced,
            records_synced: stats.records_synced,
            errors: stats.errors.len(),
        });

        if let Some(path) = &self.config.state_path {
            if let Err(e) = state.save(path).await {
                tracing::warn!("Failed to save sync state: {:?}", e);
            }
        }
    }

    /// Run the daemon continuously until stopped.
    ///
    /// Ticks that arrive while a cycle is running are skipped, not queued.
    /// A shutdown signal stops the loop without draining an in-flight cycle;
    /// batches already pushed stay applied since each is idempotent.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> anyhow::Result<()> {
        let mut ticker = interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Starting SyncDaemon with sync_interval={:?}, {} tables",
            self.config.sync_interval,
            self.tables.len()
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping SyncDaemon");
                    break;
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during sync cycle, aborting");
                            break;
                        }
                        result = self.try_run_cycle(SyncMode::Auto) => {
                            match result {
                                Some(Ok(stats)) => {
                                    tracing::info!(
                                        "Sync cycle {} ({}) completed: {} tables, {} records in {}ms",
                                        stats.run_id,
                                        stats.kind.label(),
                                        stats.tables_synced,
                                        stats.records_synced,
                                        stats.duration_ms
                                    );
                                    if !stats.errors.is_empty() {
                                        tracing::warn!("Sync cycle had {} errors", stats.errors.len());
                                    }
                                }
                                Some(Err(e)) => {
                                    tracing::error!("Sync cycle aborted: {}", e);
                                }
                                None => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.cold_start_threshold, 100);
        assert_eq!(config.replication.batch_size, 50);
        assert!(config.state_path.is_none());
    }

    #[test]
    fn test_sync_stats_success() {
        let stats = SyncStats {
            tables_synced: 5,
            records_synced: 100,
            ..Default::default()
        };
        assert!(stats.is_success());
    }

    #[test]
    fn test_sync_stats_with_errors() {
        let stats = SyncStats {
            tables_synced: 4,
            tables_failed: 1,
            errors: vec!["Failed to sync ledgers".to_string()],
            ..Default::default()
        };
        assert!(!stats.is_success());
    }

    #[test]
    fn test_running_guard_resets_flag() {
        let flag = AtomicBool::new(true);
        {
            let _guard = RunningGuard(&flag);
        }
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_cycle_kind_labels() {
        assert_eq!(CycleKind::Idle.label(), "idle");
        assert_eq!(CycleKind::Cold("empty".to_string()).label(), "full");
        assert_eq!(CycleKind::Incremental(vec![]).label(), "incremental");
    }
}
