// ABOUTME: Library root for erp-replicator
// ABOUTME: Exports the ERP extraction, remote replication, and sync orchestration modules

pub mod config;
pub mod erp;
pub mod error;
pub mod remote;
pub mod sync;
pub mod table_spec;
pub mod utils;

pub use config::{Config, TableCatalog};
pub use error::{SyncError, SyncResult};
pub use table_spec::{FieldDescriptor, Partition, SemanticType, TableSpec};
