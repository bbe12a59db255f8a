//! Table, range, and metadata-table types shared across the store.
//!
//! Row keys are raw bytes ordered lexicographically. The metadata table
//! (table id 0) keys its rows as `<table_id>:<end_row>`; the root range
//! covers the metadata table's own rows up to [`END_ROOT_ROW`] and the
//! second-level ranges cover everything up to [`END_ROW_MARKER`].

use serde::{Deserialize, Serialize};

pub const METADATA_TABLE_NAME: &str = "METADATA";
pub const METADATA_TABLE_ID: u32 = 0;

/// Largest possible row key; every table's last range ends here.
pub const END_ROW_MARKER: &[u8] = b"\xff\xff";
/// Inclusive upper bound of the root metadata range: the metadata row
/// `0:<END_ROW_MARKER>` itself.
pub const END_ROOT_ROW: &[u8] = b"0:\xff\xff";

/// Metadata column families the locator reads.
pub const COLUMN_START_ROW: &str = "StartRow";
pub const COLUMN_LOCATION: &str = "Location";

/// Namespace layout owned by the master.
pub const TOPLEVEL_DIR: &str = "/hypertable";
pub const SERVERS_DIR: &str = "/hypertable/servers";
pub const TABLES_DIR: &str = "/hypertable/tables";
pub const MASTER_FILE: &str = "/hypertable/master";
pub const ROOT_FILE: &str = "/hypertable/root";

/// Bound on the range locator's postmortem error ring.
pub const MAX_ERROR_QUEUE_LENGTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIdentifier {
    pub name: String,
    pub id: u32,
    pub generation: u32,
}

/// Contiguous row-key slice of a table, `(start_row, end_row]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
}

impl RangeSpec {
    /// The single range covering a whole table.
    pub fn full() -> Self {
        Self {
            start_row: Vec::new(),
            end_row: END_ROW_MARKER.to_vec(),
        }
    }

    /// The root metadata range `(..END_ROOT_ROW]`.
    pub fn root_metadata() -> Self {
        Self {
            start_row: Vec::new(),
            end_row: END_ROOT_ROW.to_vec(),
        }
    }

    /// The second-level metadata range `(END_ROOT_ROW..END_ROW_MARKER]`.
    pub fn second_level_metadata() -> Self {
        Self {
            start_row: END_ROOT_ROW.to_vec(),
            end_row: END_ROW_MARKER.to_vec(),
        }
    }
}

/// Initial state handed to a range server with `load_range`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeState {
    pub soft_limit: u64,
}

/// Row-interval scan over named columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanSpec {
    /// Inclusive start and end rows.
    pub row_interval: (Vec<u8>, Vec<u8>),
    pub columns: Vec<String>,
    pub max_versions: u32,
    pub row_limit: u32,
}

/// One scanned cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub row: Vec<u8>,
    pub column_id: u8,
    pub value: Vec<u8>,
}

/// Metadata row key `<table_id>:<end_row>`.
pub fn metadata_row_key(table_id: u32, end_row: &[u8]) -> Vec<u8> {
    let mut key = table_id.to_string().into_bytes();
    key.push(b':');
    key.extend_from_slice(end_row);
    key
}

/// Split a metadata row key into `(table_id, end_row)`.
pub fn parse_metadata_row_key(row: &[u8]) -> Option<(u32, &[u8])> {
    let sep = row.iter().position(|b| *b == b':')?;
    let table_id = std::str::from_utf8(&row[..sep]).ok()?.parse().ok()?;
    Some((table_id, &row[sep + 1..]))
}
