// ABOUTME: ERP side of the pipeline: request compiler, transport, and response extractor
// ABOUTME: extract_table chains the three for one TableSpec

pub mod compiler;
pub mod extractor;
pub mod transport;

pub use compiler::{compile, RequestOptions};
pub use extractor::{parse, Provenance, Record};
pub use transport::{ErpClient, ErpTransport};

use crate::error::SyncResult;
use crate::table_spec::TableSpec;

/// Compile, send, and parse one table. Configuration errors surface before any I/O.
pub async fn extract_table<T: ErpTransport>(
    transport: &T,
    spec: &TableSpec,
    options: &RequestOptions,
) -> SyncResult<Vec<Record>> {
    let index = spec.field_index()?;
    let request = compile(spec, options)?;
    let raw = transport.send(&request, spec.bulk).await?;
    extractor::parse_with_index(&raw, &spec.name, &index)
}
