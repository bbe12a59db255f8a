//! Metadata-table access seam.
//!
//! The metadata table is served by range servers like any other table;
//! the client machinery that scans and mutates it (scanners, mutators,
//! batching) is outside this crate. The master only needs interval scans
//! over named columns and buffered cell writes.

use ht_core::Result;

use crate::types::{Cell, ScanSpec};

pub trait MetadataTable: Send + Sync {
    /// Run `spec` to completion and return the matching cells in row
    /// order.
    fn scan(&self, spec: &ScanSpec) -> Result<Vec<Cell>>;

    /// Buffered writer; nothing is visible until `flush`.
    fn writer(&self) -> Box<dyn MetadataWriter>;
}

pub trait MetadataWriter: Send {
    fn set(&mut self, row: &[u8], column_family: &str, value: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}
