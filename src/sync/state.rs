// ABOUTME: High-water-mark counters for the master and transaction partitions
// ABOUTME: Persists the last replicated AlterIDs locally so restarts resume where they left off

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::table_spec::Partition;
use crate::utils::sanitize_url;

/// Per-partition AlterID high-water marks. Values only ever move up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterCounters {
    pub master: u64,
    pub transaction: u64,
}

impl AlterCounters {
    pub fn new(master: u64, transaction: u64) -> Self {
        Self {
            master,
            transaction,
        }
    }

    pub fn get(&self, partition: Partition) -> u64 {
        match partition {
            Partition::Master => self.master,
            Partition::Transaction => self.transaction,
        }
    }

    /// Raise one partition's mark. Returns false (and changes nothing) if `value` is lower.
    pub fn advance(&mut self, partition: Partition, value: u64) -> bool {
        let slot = match partition {
            Partition::Master => &mut self.master,
            Partition::Transaction => &mut self.transaction,
        };
        if value >= *slot {
            *slot = value;
            true
        } else {
            false
        }
    }
}

/// Summary of the most recent cycle, kept for `counters`/status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastCycle {
    pub run_id: String,
    pub mode: String,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub tables_synced: usize,
    pub records_synced: u64,
    pub errors: usize,
}

/// Local mirror of the replication baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    /// ERP endpoint this state was recorded against
    pub source_url: String,
    /// Remote store (sanitized - no password)
    pub target_url: String,
    pub counters: AlterCounters,
    #[serde(default)]
    pub cycles_run: u64,
    #[serde(default)]
    pub last_cycle: Option<LastCycle>,
    /// Version of the state format for future migrations
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SyncState {
    pub fn new(source_url: &str, target_url: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            source_url: sanitize_url(source_url),
            target_url: sanitize_url(target_url),
            counters: AlterCounters::default(),
            cycles_run: 0,
            last_cycle: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a partition's new mark; lower values are ignored.
    pub fn advance(&mut self, partition: Partition, value: u64) -> bool {
        let advanced = self.counters.advance(partition, value);
        if advanced {
            self.updated_at = chrono::Utc::now();
        }
        advanced
    }

    pub fn record_cycle(&mut self, cycle: LastCycle) {
        self.cycles_run += 1;
        self.last_cycle = Some(cycle);
        self.updated_at = chrono::Utc::now();
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read sync state from {:?}", path))?;
        let state: SyncState = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse sync state from {:?}", path))?;
        Ok(state)
    }

    /// Save state to a JSON file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize sync state")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write sync state to {:?}", path))?;
        Ok(())
    }

    /// Load the state at `path`, or start fresh if it is missing or unreadable.
    pub async fn load_or_new(path: &Path, source_url: &str, target_url: &str) -> Self {
        if path.exists() {
            match SyncState::load(path).await {
                Ok(state) => {
                    tracing::info!("Loaded existing sync state from {:?}", path);
                    return state;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load sync state from {:?}: {}. Creating new state.",
                        path,
                        e
                    );
                }
            }
        }
        SyncState::new(source_url, target_url)
    }

    /// Default state file path for the current directory
    pub fn default_path() -> PathBuf {
        PathBuf::from(".erp-replicator/sync-state.json")
    }
}
