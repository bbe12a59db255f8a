//! Range locator resolution through the two-level metadata table.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, wait_until, InMemMetadata, MockRangeServerRpc};
use ht_core::{ErrorCode, Timer};
use ht_namespace::testing::LocalNamespace;
use ht_namespace::{OPEN_FLAG_CREATE, OPEN_FLAG_READ, OPEN_FLAG_WRITE};
use ht_store::range_locator::RangeLocator;
use ht_store::types::{
    metadata_row_key, COLUMN_LOCATION, COLUMN_START_ROW, END_ROOT_ROW, END_ROW_MARKER,
    MAX_ERROR_QUEUE_LENGTH, ROOT_FILE,
};
use ht_store::TableIdentifier;

const ROOT_LOCATION: &str = "10.0.0.1_38060";
const SECOND_LEVEL_LOCATION: &str = "10.0.0.2_38060";
const RANGE_A_LOCATION: &str = "10.0.0.3_38060";
const RANGE_B_LOCATION: &str = "10.0.0.4_38060";

struct LocatorHarness {
    ns: LocalNamespace,
    metadata: Arc<InMemMetadata>,
    rpc: Arc<MockRangeServerRpc>,
    locator: RangeLocator,
}

/// Seed the namespace root anchor and a two-level metadata layout for one
/// user table (id 1) split at row "m".
fn locator_harness() -> LocatorHarness {
    let ns = LocalNamespace::new();
    let (_admin_client, admin) = connect(&ns);
    admin.mkdir("/hypertable").unwrap();
    let root = admin
        .open(ROOT_FILE, OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE, None)
        .unwrap();
    admin
        .attr_set(root.handle, COLUMN_LOCATION, ROOT_LOCATION.as_bytes())
        .unwrap();

    let metadata = InMemMetadata::new();
    // Root range content: the row describing the second-level metadata
    // range.
    let row = metadata_row_key(0, END_ROW_MARKER);
    metadata.put(&row, COLUMN_START_ROW, END_ROOT_ROW);
    metadata.put(&row, COLUMN_LOCATION, SECOND_LEVEL_LOCATION.as_bytes());
    // Second-level content: table 1 in two ranges split at "m".
    let row = metadata_row_key(1, b"m");
    metadata.put(&row, COLUMN_START_ROW, b"");
    metadata.put(&row, COLUMN_LOCATION, RANGE_A_LOCATION.as_bytes());
    let row = metadata_row_key(1, END_ROW_MARKER);
    metadata.put(&row, COLUMN_START_ROW, b"m");
    metadata.put(&row, COLUMN_LOCATION, RANGE_B_LOCATION.as_bytes());

    let rpc = MockRangeServerRpc::new(metadata.clone());
    let (_client, session) = connect(&ns);
    let locator = RangeLocator::new(session, rpc.clone()).unwrap();

    LocatorHarness {
        ns,
        metadata,
        rpc,
        locator,
    }
}

fn user_table() -> TableIdentifier {
    TableIdentifier {
        name: "users".to_string(),
        id: 1,
        generation: 1,
    }
}

fn addr_of(location: &str) -> std::net::SocketAddr {
    ht_store::location_to_addr(location).unwrap()
}

#[test]
fn find_walks_root_then_second_level() {
    let harness = locator_harness();
    let table = user_table();

    let info = harness.locator.find(&table, b"apple", false).unwrap();
    assert_eq!(info.addr, addr_of(RANGE_A_LOCATION));
    assert_eq!(info.start_row, b"".to_vec());
    assert_eq!(info.end_row, b"m".to_vec());

    // Scans hit the root server first, then the second-level range
    // server.
    let scans = harness.rpc.scans.lock().clone();
    assert_eq!(scans, vec![addr_of(ROOT_LOCATION), addr_of(SECOND_LEVEL_LOCATION)]);

    let info = harness.locator.find(&table, b"zebra", false).unwrap();
    assert_eq!(info.addr, addr_of(RANGE_B_LOCATION));
}

#[test]
fn cache_serves_repeat_lookups_without_scanning() {
    let harness = locator_harness();
    let table = user_table();

    harness.locator.find(&table, b"apple", false).unwrap();
    let scans_after_first = harness.rpc.scan_count();
    harness.locator.find(&table, b"banana", false).unwrap();
    assert_eq!(harness.rpc.scan_count(), scans_after_first);

    // A hard find bypasses the cache.
    harness.locator.find(&table, b"banana", true).unwrap();
    assert!(harness.rpc.scan_count() > scans_after_first);
}

#[test]
fn metadata_rows_resolve_against_the_root_anchor() {
    let harness = locator_harness();
    let metadata_table = TableIdentifier {
        name: "METADATA".to_string(),
        id: 0,
        generation: 1,
    };

    // A row inside the root range needs no scan at all.
    let info = harness.locator.find(&metadata_table, b"0:5", false).unwrap();
    assert_eq!(info.addr, addr_of(ROOT_LOCATION));
    assert_eq!(info.end_row, END_ROOT_ROW.to_vec());
    assert_eq!(harness.rpc.scan_count(), 0);

    // A second-level metadata row resolves through the root scan.
    let info = harness.locator.find(&metadata_table, b"1:x", false).unwrap();
    assert_eq!(info.addr, addr_of(SECOND_LEVEL_LOCATION));
}

#[test]
fn invalidate_drops_only_the_covering_entry() {
    let harness = locator_harness();
    let table = user_table();

    harness.locator.find(&table, b"apple", false).unwrap();
    harness.locator.find(&table, b"zebra", false).unwrap();
    assert!(harness.locator.invalidate(&table, b"apple"));
    assert!(!harness.locator.invalidate(&table, b"apple"));

    // The other range is still cached.
    let scans = harness.rpc.scan_count();
    harness.locator.find(&table, b"zebra", false).unwrap();
    assert_eq!(harness.rpc.scan_count(), scans);
}

#[test]
fn root_move_is_observed_on_the_next_find() {
    let harness = locator_harness();
    let table = user_table();
    harness.locator.find(&table, b"apple", false).unwrap();

    // The root range moves: another process updates the anchor.
    let (_client, admin) = connect(&harness.ns);
    let root = admin.open(ROOT_FILE, OPEN_FLAG_READ | OPEN_FLAG_WRITE, None).unwrap();
    let moved = "10.0.0.9_38060";
    admin
        .attr_set(root.handle, COLUMN_LOCATION, moved.as_bytes())
        .unwrap();

    // The watcher flips the stale flag; the next hard find re-reads the
    // anchor and scans the new root server.
    assert!(wait_until(Duration::from_secs(2), || {
        harness.locator.find(&table, b"apple", true).is_ok()
            && harness.rpc.scans.lock().iter().any(|a| *a == addr_of(moved))
    }));
}

#[test]
fn missing_metadata_is_reported_and_recorded() {
    let harness = locator_harness();
    let unknown = TableIdentifier {
        name: "phantom".to_string(),
        id: 9,
        generation: 1,
    };

    let err = harness.locator.find(&unknown, b"k", false).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MetadataNotFound);
    assert_eq!(harness.locator.error_history_len(), 1);
    harness.locator.clear_error_history();
    assert_eq!(harness.locator.error_history_len(), 0);
}

#[test]
fn error_history_is_bounded() {
    let harness = locator_harness();
    let unknown = TableIdentifier {
        name: "phantom".to_string(),
        id: 9,
        generation: 1,
    };

    for _ in 0..(2 * MAX_ERROR_QUEUE_LENGTH) {
        let _ = harness.locator.find(&unknown, b"k", false);
    }
    assert_eq!(harness.locator.error_history_len(), MAX_ERROR_QUEUE_LENGTH);
    harness.locator.dump_error_history();
    assert_eq!(harness.locator.error_history_len(), 0);
}

#[test]
fn find_loop_retries_past_a_broken_scan() {
    let harness = locator_harness();
    let table = user_table();
    harness.rpc.fail_next_scans.store(1, std::sync::atomic::Ordering::Release);

    let timer = Timer::new(Duration::from_secs(2));
    let info = harness.locator.find_loop(&table, b"apple", &timer, true).unwrap();
    assert_eq!(info.addr, addr_of(RANGE_A_LOCATION));
    assert!(harness.locator.error_history_len() >= 1);
}

#[test]
fn find_loop_reraises_the_last_error_on_expiry() {
    let harness = locator_harness();
    let unknown = TableIdentifier {
        name: "phantom".to_string(),
        id: 9,
        generation: 1,
    };

    let timer = Timer::new(Duration::ZERO);
    let err = harness
        .locator
        .find_loop(&unknown, b"k", &timer, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MetadataNotFound);
}

#[test]
fn metadata_store_row_count_tracks_seeding() {
    // Guards the harness itself: three descriptor rows were seeded.
    let harness = locator_harness();
    assert_eq!(harness.metadata.row_count(), 3);
}
