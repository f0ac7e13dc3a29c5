// ABOUTME: Remote store side of the pipeline
// ABOUTME: HTTP client, wire models, and the batched replication client

pub mod client;
pub mod models;
pub mod replication;

pub use client::{RemoteClient, RemoteStore};
pub use models::{MetadataResponse, SyncType};
pub use replication::{PushOutcome, ReplicationClient, ReplicationConfig};
