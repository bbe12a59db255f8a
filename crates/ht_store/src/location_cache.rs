//! In-memory cache of range locations.
//!
//! Entries map `(table_id, end_row)` to the immutable location record of
//! the range ending at that row; a lookup finds the covering interval
//! `(start_row, end_row]` with an ordered upper-bound probe. Capacity is
//! fixed and the least recently used entry is evicted.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use ht_core::{ErrorCode, Exception, Result};
use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Where a range lives. Replaced atomically on invalidation-and-refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeLocationInfo {
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
    pub addr: SocketAddr,
}

type CacheKey = (u32, Vec<u8>);

struct CacheEntry {
    info: RangeLocationInfo,
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    map: BTreeMap<CacheKey, CacheEntry>,
    /// Recency index: stamp -> key. Stamps are unique.
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

pub struct LocationCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl Default for LocationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Insert or replace the entry for the range ending at
    /// `info.end_row`.
    pub fn insert(&self, table_id: u32, info: RangeLocationInfo) {
        let mut inner = self.inner.lock();
        let key = (table_id, info.end_row.clone());
        inner.tick += 1;
        let stamp = inner.tick;
        if let Some(old) = inner.map.insert(key.clone(), CacheEntry { info, stamp }) {
            inner.recency.remove(&old.stamp);
        }
        inner.recency.insert(stamp, key);
        while inner.map.len() > self.capacity {
            let Some((&oldest, _)) = inner.recency.iter().next() else {
                break;
            };
            if let Some(key) = inner.recency.remove(&oldest) {
                inner.map.remove(&key);
            }
        }
    }

    /// Covering entry for `row`, refreshing its recency.
    pub fn lookup(&self, table_id: u32, row: &[u8]) -> Option<RangeLocationInfo> {
        let mut inner = self.inner.lock();
        let key = inner
            .map
            .range((table_id, row.to_vec())..)
            .next()
            .map(|(key, _)| key.clone())?;
        if key.0 != table_id {
            return None;
        }
        let entry = inner.map.get(&key)?;
        // Interval is (start_row, end_row]: a row equal to the start
        // belongs to the previous range.
        if !entry.info.start_row.is_empty() && row <= entry.info.start_row.as_slice() {
            return None;
        }
        let info = entry.info.clone();
        let old_stamp = entry.stamp;
        inner.tick += 1;
        let stamp = inner.tick;
        inner.recency.remove(&old_stamp);
        inner.recency.insert(stamp, key.clone());
        if let Some(entry) = inner.map.get_mut(&key) {
            entry.stamp = stamp;
        }
        Some(info)
    }

    /// Remove the covering entry for `row`; returns whether one existed.
    pub fn invalidate(&self, table_id: u32, row: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let Some((key, entry)) = inner
            .map
            .range((table_id, row.to_vec())..)
            .next()
            .map(|(key, entry)| (key.clone(), entry.stamp))
        else {
            return false;
        };
        if key.0 != table_id {
            return false;
        }
        {
            let info = &inner.map[&key].info;
            if !info.start_row.is_empty() && row <= info.start_row.as_slice() {
                return false;
            }
        }
        inner.map.remove(&key);
        inner.recency.remove(&entry);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse a range-server location id of the form `<ip>_<port>`.
///
/// This grammar is owned here; the master imports it verbatim when
/// aliasing registered servers.
pub fn location_to_addr(location: &str) -> Result<SocketAddr> {
    let (host, port) = location.rsplit_once('_').ok_or_else(|| bad_location(location))?;
    let ip: IpAddr = host.parse().map_err(|_| bad_location(location))?;
    let port: u16 = port.parse().map_err(|_| bad_location(location))?;
    Ok(SocketAddr::new(ip, port))
}

fn bad_location(location: &str) -> Exception {
    Exception::new(
        ErrorCode::InvalidMetadata,
        format!("unable to convert location '{location}' to address"),
    )
}
