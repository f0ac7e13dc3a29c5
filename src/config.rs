// ABOUTME: TOML configuration for the ERP listener, remote store, scheduler, and table catalog
// ABOUTME: Loads, applies defaults, and validates everything before any network I/O

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::erp::transport::{DEFAULT_BULK_TIMEOUT, DEFAULT_TIMEOUT};
use crate::erp::RequestOptions;
use crate::error::{SyncError, SyncResult};
use crate::remote::client::DEFAULT_REMOTE_TIMEOUT;
use crate::remote::ReplicationConfig;
use crate::sync::state::SyncState;
use crate::sync::tracker::DEFAULT_COLD_START_THRESHOLD;
use crate::sync::DaemonConfig;
use crate::table_spec::{Partition, TableSpec};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub erp: ErpSettings,
    pub remote: RemoteSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub tables: TableCatalog,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErpSettings {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
    pub bulk_timeout_secs: u64,
    pub company: Option<String>,
    pub from_date: Option<NaiveDate>,
    pub to_date: Option<NaiveDate>,
}

impl Default for ErpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 9000,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            bulk_timeout_secs: DEFAULT_BULK_TIMEOUT.as_secs(),
            company: None,
            from_date: None,
            to_date: None,
        }
    }
}

impl ErpSettings {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            company: self.company.clone(),
            from_date: self.from_date,
            to_date: self.to_date,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub tenant: String,
    pub sub_tenant: String,
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    DEFAULT_REMOTE_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub cold_start_threshold: u64,
    pub state_path: Option<PathBuf>,
    pub source_tag: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 50,
            max_retries: 2,
            retry_backoff_secs: 2,
            cold_start_threshold: DEFAULT_COLD_START_THRESHOLD,
            state_path: None,
            source_tag: "erp".to_string(),
        }
    }
}

/// Ordered table descriptors per partition. Declaration order is extraction order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableCatalog {
    #[serde(default)]
    pub master: Vec<TableSpec>,
    #[serde(default)]
    pub transaction: Vec<TableSpec>,
}

impl TableCatalog {
    pub fn new(master: Vec<TableSpec>, transaction: Vec<TableSpec>) -> SyncResult<Self> {
        let mut catalog = Self {
            master,
            transaction,
        };
        catalog.normalize();
        catalog.validate()?;
        Ok(catalog)
    }

    /// Tag each spec with its partition and move parent collections ahead of
    /// their line-entity children. The sort is stable, so declared priority
    /// order is otherwise kept.
    fn normalize(&mut self) {
        for spec in &mut self.master {
            spec.partition = Partition::Master;
        }
        for spec in &mut self.transaction {
            spec.partition = Partition::Transaction;
        }
        self.master.sort_by_key(|t| t.collection_path().len());
        self.transaction.sort_by_key(|t| t.collection_path().len());
    }

    pub fn validate(&self) -> SyncResult<()> {
        let mut names = std::collections::HashSet::new();
        for spec in self.master.iter().chain(self.transaction.iter()) {
            spec.validate()?;
            if !names.insert(spec.name.as_str()) {
                return Err(SyncError::configuration(format!(
                    "table '{}' is declared more than once",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    pub fn partition(&self, partition: Partition) -> &[TableSpec] {
        match partition {
            Partition::Master => &self.master,
            Partition::Transaction => &self.transaction,
        }
    }

    pub fn find(&self, name: &str) -> Option<&TableSpec> {
        self.master
            .iter()
            .chain(self.transaction.iter())
            .find(|spec| spec.name == name)
    }

    pub fn len(&self) -> usize {
        self.master.len() + self.transaction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.tables.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.erp.host.trim().is_empty() {
            return Err(SyncError::configuration("erp.host cannot be empty"));
        }
        if self.erp.timeout_secs == 0 || self.erp.bulk_timeout_secs == 0 {
            return Err(SyncError::configuration("erp timeouts must be positive"));
        }
        if let (Some(from), Some(to)) = (self.erp.from_date, self.erp.to_date) {
            if from > to {
                return Err(SyncError::configuration(format!(
                    "erp.from_date {} is after erp.to_date {}",
                    from, to
                )));
            }
        }

        url::Url::parse(&self.remote.base_url).map_err(|e| {
            SyncError::configuration(format!("remote.base_url is not a valid URL: {}", e))
        })?;
        if self.remote.tenant.trim().is_empty() || self.remote.sub_tenant.trim().is_empty() {
            return Err(SyncError::configuration(
                "remote.tenant and remote.sub_tenant are required",
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(SyncError::configuration("sync.batch_size must be at least 1"));
        }
        if self.sync.interval_secs == 0 {
            return Err(SyncError::configuration("sync.interval_secs must be positive"));
        }

        if self.tables.is_empty() {
            return Err(SyncError::configuration("no tables are declared"));
        }
        self.tables.validate()
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            batch_size: self.sync.batch_size,
            max_retries: self.sync.max_retries,
            retry_backoff: Duration::from_secs(self.sync.retry_backoff_secs),
            source: self.sync.source_tag.clone(),
        }
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        DaemonConfig {
            sync_interval: Duration::from_secs(self.sync.interval_secs),
            cold_start_threshold: self.sync.cold_start_threshold,
            state_path: Some(
                self.sync
                    .state_path
                    .clone()
                    .unwrap_or_else(SyncState::default_path),
            ),
            replication: self.replication_config(),
            request: self.erp.request_options(),
            tenant_id: self.remote.tenant.clone(),
            sub_tenant_id: self.remote.sub_tenant.clone(),
        }
    }
}
