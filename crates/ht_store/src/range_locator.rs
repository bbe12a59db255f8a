//! Two-level metadata resolver.
//!
//! Given a table and a row key, the locator finds the range server hosting
//! the covering range: the root metadata range (anchored on the namespace
//! file `/hypertable/root`) points at the second-level metadata range for
//! the table, and that range's rows name the target server. Scan results
//! populate the location cache so repeat lookups stay local.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ht_core::{ErrorCode, Exception, Result, Timer};
use ht_namespace::session::Session;
use ht_namespace::{HandleCallback, EVENT_MASK_ATTR_SET, OPEN_FLAG_READ};
use parking_lot::Mutex;

use crate::location_cache::{location_to_addr, LocationCache, RangeLocationInfo};
use crate::range_server::RangeServerRpc;
use crate::schema::Schema;
use crate::types::{
    metadata_row_key, parse_metadata_row_key, Cell, ScanSpec, TableIdentifier, COLUMN_LOCATION,
    COLUMN_START_ROW, END_ROOT_ROW, END_ROW_MARKER, MAX_ERROR_QUEUE_LENGTH, METADATA_TABLE_ID,
    METADATA_TABLE_NAME, ROOT_FILE,
};

/// Pause between retries inside `find_loop`.
const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Flips the stale flag when the root location attribute changes; the
/// next `find` re-reads it.
struct RootFileHandler {
    stale: Arc<AtomicBool>,
}

impl HandleCallback for RootFileHandler {
    fn event_mask(&self) -> u32 {
        EVENT_MASK_ATTR_SET
    }

    fn attr_set(&self, _name: &str) {
        self.stale.store(true, Ordering::Release);
    }
}

struct LocatorState {
    root_addr: Option<SocketAddr>,
    last_errors: VecDeque<Exception>,
}

pub struct RangeLocator {
    session: Arc<Session>,
    rpc: Arc<dyn RangeServerRpc>,
    cache: Arc<LocationCache>,
    root_handle: u64,
    root_stale: Arc<AtomicBool>,
    state: Mutex<LocatorState>,
    startrow_cid: u8,
    location_cid: u8,
    metadata_table: TableIdentifier,
}

impl RangeLocator {
    /// Opens the root file with a change watcher and caches the metadata
    /// schema's column ids.
    pub fn new(session: Arc<Session>, rpc: Arc<dyn RangeServerRpc>) -> Result<RangeLocator> {
        let schema = Schema::metadata();
        let startrow_cid = schema.column_family_id(COLUMN_START_ROW).ok_or_else(|| {
            Exception::new(
                ErrorCode::FailedExpectation,
                "metadata schema is missing the StartRow column family",
            )
        })?;
        let location_cid = schema.column_family_id(COLUMN_LOCATION).ok_or_else(|| {
            Exception::new(
                ErrorCode::FailedExpectation,
                "metadata schema is missing the Location column family",
            )
        })?;

        let root_stale = Arc::new(AtomicBool::new(true));
        let handler = Arc::new(RootFileHandler {
            stale: root_stale.clone(),
        });
        let root = session.open(ROOT_FILE, OPEN_FLAG_READ, Some(handler))?;

        Ok(RangeLocator {
            session,
            rpc,
            cache: Arc::new(LocationCache::default()),
            root_handle: root.handle,
            root_stale,
            state: Mutex::new(LocatorState {
                root_addr: None,
                last_errors: VecDeque::new(),
            }),
            startrow_cid,
            location_cid,
            metadata_table: TableIdentifier {
                name: METADATA_TABLE_NAME.to_string(),
                id: METADATA_TABLE_ID,
                generation: schema.generation,
            },
        })
    }

    pub fn location_cache(&self) -> Arc<LocationCache> {
        self.cache.clone()
    }

    /// Force a root re-read before the next metadata scan.
    ///
    /// The flag is consumed lazily, so one scan may still hit the old
    /// root server after a root move; it fails, and the retry re-reads.
    pub fn set_root_stale(&self) {
        self.root_stale.store(true, Ordering::Release);
    }

    /// Remove the cached entry covering `row_key`.
    pub fn invalidate(&self, table: &TableIdentifier, row_key: &[u8]) -> bool {
        self.cache.invalidate(table.id, row_key)
    }

    /// Resolve the range containing `row_key`, consulting the cache
    /// unless `hard` is set.
    pub fn find(
        &self,
        table: &TableIdentifier,
        row_key: &[u8],
        hard: bool,
    ) -> Result<RangeLocationInfo> {
        if !hard {
            if let Some(info) = self.cache.lookup(table.id, row_key) {
                return Ok(info);
            }
        }

        if self.root_stale.load(Ordering::Acquire) || self.state.lock().root_addr.is_none() {
            self.read_root_location().map_err(|e| self.fail(e))?;
        }
        let root_addr = self
            .state
            .lock()
            .root_addr
            .expect("root address read above");

        // The metadata row to locate: for a user table that is the row
        // describing its range; for the metadata table it is the row
        // itself.
        let meta_key = if table.id == METADATA_TABLE_ID {
            row_key.to_vec()
        } else {
            metadata_row_key(table.id, row_key)
        };

        // Metadata rows inside the root range are resolved by the root
        // anchor itself.
        if meta_key.as_slice() <= END_ROOT_ROW {
            return Ok(RangeLocationInfo {
                start_row: Vec::new(),
                end_row: END_ROOT_ROW.to_vec(),
                addr: root_addr,
            });
        }

        // First level: scan the root range for the second-level metadata
        // range covering `meta_key`.
        let spec = self.metadata_scan_spec(
            metadata_row_key(METADATA_TABLE_ID, &meta_key),
            metadata_row_key(METADATA_TABLE_ID, END_ROW_MARKER),
        );
        let cells = self
            .rpc
            .scan_range(root_addr, &self.metadata_table, &spec)
            .map_err(|e| {
                self.fail(Exception::chain(
                    e.code(),
                    format!("root metadata scan at {root_addr} failed"),
                    e,
                ))
            })?;
        self.process_metadata_cells(&cells)
            .map_err(|e| self.fail(e))?;

        let second_level = self
            .cache
            .lookup(METADATA_TABLE_ID, &meta_key)
            .ok_or_else(|| {
                self.fail(Exception::new(
                    ErrorCode::MetadataNotFound,
                    format!(
                        "no second-level metadata range for table '{}' id={}",
                        table.name, table.id
                    ),
                ))
            })?;
        if table.id == METADATA_TABLE_ID {
            return Ok(second_level);
        }

        // Second level: scan that range for the user-table range itself.
        let spec = self.metadata_scan_spec(
            meta_key.clone(),
            metadata_row_key(table.id, END_ROW_MARKER),
        );
        let cells = self
            .rpc
            .scan_range(second_level.addr, &self.metadata_table, &spec)
            .map_err(|e| {
                self.fail(Exception::chain(
                    e.code(),
                    format!("metadata scan at {} failed", second_level.addr),
                    e,
                ))
            })?;
        self.process_metadata_cells(&cells)
            .map_err(|e| self.fail(e))?;

        self.cache.lookup(table.id, row_key).ok_or_else(|| {
            self.fail(Exception::new(
                ErrorCode::MetadataNotFound,
                format!(
                    "no range for row in table '{}' id={}",
                    table.name, table.id
                ),
            ))
        })
    }

    /// Retry `find` until it succeeds or `timer` runs out, re-reading the
    /// root location after transient failures. The last error is
    /// re-raised on expiry.
    pub fn find_loop(
        &self,
        table: &TableIdentifier,
        row_key: &[u8],
        timer: &Timer,
        mut hard: bool,
    ) -> Result<RangeLocationInfo> {
        loop {
            match self.find(table, row_key, hard) {
                Ok(info) => return Ok(info),
                Err(error) => {
                    if timer.expired() {
                        return Err(error);
                    }
                    if is_transient(error.code()) {
                        self.set_root_stale();
                    }
                    hard = true;
                    thread::sleep(timer.remaining().min(RETRY_INTERVAL));
                }
            }
        }
    }

    pub fn clear_error_history(&self) {
        self.state.lock().last_errors.clear();
    }

    /// Log and drain the recorded error ring.
    pub fn dump_error_history(&self) {
        let mut state = self.state.lock();
        for error in state.last_errors.drain(..) {
            tracing::error!("{error}");
        }
    }

    /// Number of errors currently held for postmortem.
    pub fn error_history_len(&self) -> usize {
        self.state.lock().last_errors.len()
    }

    fn read_root_location(&self) -> Result<()> {
        let value = self
            .session
            .attr_get(self.root_handle, COLUMN_LOCATION)
            .map_err(|e| {
                Exception::chain(
                    ErrorCode::BadRootLocation,
                    "problem reading 'Location' attribute of the root file",
                    e,
                )
            })?;
        let location = String::from_utf8(value).map_err(|_| {
            Exception::new(
                ErrorCode::BadRootLocation,
                "root 'Location' attribute is not valid utf-8",
            )
        })?;
        let addr = location_to_addr(location.trim()).map_err(|e| {
            Exception::chain(
                ErrorCode::BadRootLocation,
                format!("bad root location '{}'", location.trim()),
                e,
            )
        })?;
        self.state.lock().root_addr = Some(addr);
        self.root_stale.store(false, Ordering::Release);
        Ok(())
    }

    fn metadata_scan_spec(&self, start: Vec<u8>, end: Vec<u8>) -> ScanSpec {
        ScanSpec {
            row_interval: (start, end),
            columns: vec![COLUMN_START_ROW.to_string(), COLUMN_LOCATION.to_string()],
            max_versions: 1,
            row_limit: 0,
        }
    }

    /// Fold a metadata scan block into the location cache. Cells arrive in
    /// row order; a row contributes an entry once both its `StartRow` and
    /// `Location` cells have been seen.
    fn process_metadata_cells(&self, cells: &[Cell]) -> Result<()> {
        let mut current: Option<&[u8]> = None;
        let mut start_row: Option<Vec<u8>> = None;
        let mut location: Option<String> = None;
        for cell in cells {
            if current != Some(cell.row.as_slice()) {
                self.insert_row(current, start_row.take(), location.take())?;
                current = Some(cell.row.as_slice());
            }
            if cell.column_id == self.startrow_cid {
                start_row = Some(cell.value.clone());
            } else if cell.column_id == self.location_cid {
                let value = String::from_utf8_lossy(&cell.value).trim().to_string();
                // "!" marks a range whose assignment is in flight.
                if !value.is_empty() && value != "!" {
                    location = Some(value);
                }
            } else {
                tracing::warn!(column_id = cell.column_id, "unexpected column id in metadata scan");
            }
        }
        self.insert_row(current, start_row, location)
    }

    fn insert_row(
        &self,
        row: Option<&[u8]>,
        start_row: Option<Vec<u8>>,
        location: Option<String>,
    ) -> Result<()> {
        let Some(row) = row else {
            return Ok(());
        };
        let (Some(start_row), Some(location)) = (start_row, location) else {
            tracing::debug!(row = %String::from_utf8_lossy(row), "incomplete metadata row skipped");
            return Ok(());
        };
        let (table_id, end_row) = parse_metadata_row_key(row).ok_or_else(|| {
            Exception::new(
                ErrorCode::BadKey,
                format!("invalid metadata row key '{}'", String::from_utf8_lossy(row)),
            )
        })?;
        let addr = location_to_addr(&location)?;
        self.cache.insert(
            table_id,
            RangeLocationInfo {
                start_row,
                end_row: end_row.to_vec(),
                addr,
            },
        );
        Ok(())
    }

    /// Record `error` into the bounded postmortem ring and hand it back.
    fn fail(&self, error: Exception) -> Exception {
        let mut state = self.state.lock();
        state.last_errors.push_back(error.clone());
        while state.last_errors.len() > MAX_ERROR_QUEUE_LENGTH {
            state.last_errors.pop_front();
        }
        error
    }
}

fn is_transient(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::BadRootLocation
            | ErrorCode::RequestTimeout
            | ErrorCode::CommNotConnected
            | ErrorCode::CommBrokenConnection
            | ErrorCode::CommConnectError
            | ErrorCode::CommRequestTimeout
            | ErrorCode::RangeserverRangeNotFound
            | ErrorCode::RangeserverUnavailable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_trigger_root_rereads() {
        assert!(is_transient(ErrorCode::BadRootLocation));
        assert!(is_transient(ErrorCode::CommBrokenConnection));
        assert!(!is_transient(ErrorCode::MetadataNotFound));
        assert!(!is_transient(ErrorCode::BadKey));
    }
}
