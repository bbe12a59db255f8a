//! Master startup, single-writer election, admission, and metadata
//! bootstrap.

mod common;

use std::time::Duration;

use common::{
    connect, master_config, start_master, user_schema, wait_until, InMemMetadata, MockFsBroker,
    MockRangeServerRpc, RangeServerSim,
};
use ht_core::ErrorCode;
use ht_namespace::testing::LocalNamespace;
use ht_store::master::Master;
use ht_store::types::{
    metadata_row_key, COLUMN_START_ROW, END_ROOT_ROW, END_ROW_MARKER, MASTER_FILE,
    METADATA_TABLE_ID, SERVERS_DIR, TABLES_DIR,
};
use std::sync::Arc;

#[test]
fn startup_lays_out_the_namespace_and_publishes_the_address() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);

    for path in ["/hypertable", SERVERS_DIR, TABLES_DIR, MASTER_FILE, "/hypertable/root"] {
        assert!(ns.node_exists(path), "missing {path}");
    }
    assert_eq!(
        ns.attr(MASTER_FILE, "address").unwrap(),
        b"10.0.0.100:38050".to_vec()
    );
    assert_eq!(
        ns.attr(MASTER_FILE, "last_table_id").unwrap(),
        0u32.to_le_bytes().to_vec()
    );
    assert_eq!(harness.master.last_table_id(), 0);
    assert!(!harness.master.is_initialized());
    assert!(harness.master.lock_sequencer().generation > 0);
}

#[test]
fn second_master_loses_the_election() {
    let ns = LocalNamespace::new();
    let _first = start_master(&ns);

    let metadata = InMemMetadata::new();
    let rpc = MockRangeServerRpc::new(metadata.clone());
    let fs = Arc::new(MockFsBroker::default());
    let (_client, session) = connect(&ns);
    let err = Master::start(session, fs, rpc, metadata, master_config()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NamespaceLockConflict);
    assert!(err.message().contains(MASTER_FILE));
}

#[test]
fn first_admission_bootstraps_the_metadata_table() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);

    let server = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    harness
        .master
        .register_server(&server.location, server.addr)
        .unwrap();

    assert!(harness.master.is_initialized());
    assert_eq!(harness.master.server_locations(), vec![server.location.clone()]);

    // The metadata table exists in the namespace with id 0.
    let metadata_file = format!("{TABLES_DIR}/METADATA");
    assert!(ns.node_exists(&metadata_file));
    assert_eq!(
        ns.attr(&metadata_file, "table_id").unwrap(),
        METADATA_TABLE_ID.to_le_bytes().to_vec()
    );

    // One metadata row describes the second-level range.
    let row = metadata_row_key(METADATA_TABLE_ID, END_ROW_MARKER);
    assert_eq!(
        harness.metadata.get(&row, COLUMN_START_ROW).unwrap(),
        END_ROOT_ROW.to_vec()
    );

    // Root and second-level ranges were loaded on the admitted server.
    let loads = harness.rpc.loads();
    assert_eq!(loads.len(), 2);
    assert!(loads.iter().all(|l| l.addr == server.addr && l.table_id == 0));
    assert_eq!(loads[0].range.end_row, END_ROOT_ROW.to_vec());
    assert_eq!(loads[1].range.start_row, END_ROOT_ROW.to_vec());
    assert_eq!(loads[1].range.end_row, END_ROW_MARKER.to_vec());

    // The registered address is aliased to the location-derived one.
    assert_eq!(harness.rpc.aliases.lock().as_slice(), &[(server.addr, server.addr)]);
}

#[test]
fn double_registration_is_a_failed_expectation() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let server = RangeServerSim::launch(&ns, "10.0.0.1_38060");

    harness
        .master
        .register_server(&server.location, server.addr)
        .unwrap();
    let err = harness
        .master
        .register_server(&server.location, server.addr)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::FailedExpectation);
}

#[test]
fn stale_server_files_are_pruned_at_startup() {
    let ns = LocalNamespace::new();

    // A server creates and locks its file, then dies before any master
    // sees it.
    let ghost = RangeServerSim::launch(&ns, "10.0.0.9_38060");
    ns.expire_client(&ghost.client);

    let harness = start_master(&ns);
    assert_eq!(harness.master.server_count(), 0);
    assert!(!ns.node_exists(&format!("{SERVERS_DIR}/10.0.0.9_38060")));
}

#[test]
fn dead_server_is_retired_when_its_lock_drops() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);

    let s1 = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    let s2 = RangeServerSim::launch(&ns, "10.0.0.2_38060");
    harness.master.register_server(&s1.location, s1.addr).unwrap();
    harness.master.register_server(&s2.location, s2.addr).unwrap();
    assert_eq!(harness.master.server_count(), 2);

    s1.die(&ns);
    assert!(wait_until(Duration::from_secs(5), || harness
        .master
        .server_count()
        == 1));
    assert_eq!(harness.master.server_locations(), vec![s2.location.clone()]);
    assert!(!ns.node_exists(&format!("{SERVERS_DIR}/{}", s1.location)));
}

#[test]
fn create_table_allocates_strictly_increasing_ids() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let server = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    harness.master.register_server(&server.location, server.addr).unwrap();

    harness.master.create_table("users", &user_schema()).unwrap();
    harness.master.create_table("events", &user_schema()).unwrap();
    assert_eq!(harness.master.last_table_id(), 2);

    let users_file = format!("{TABLES_DIR}/users");
    assert_eq!(ns.attr(&users_file, "table_id").unwrap(), 1u32.to_le_bytes().to_vec());
    assert_eq!(
        ns.attr(MASTER_FILE, "last_table_id").unwrap(),
        2u32.to_le_bytes().to_vec()
    );

    // The initial range covers the whole table and was assigned out.
    let loads = harness.rpc.loads();
    let users_load = loads.iter().find(|l| l.table == "users").unwrap();
    assert_eq!(users_load.range.start_row, b"".to_vec());
    assert_eq!(users_load.range.end_row, END_ROW_MARKER.to_vec());
    assert_eq!(users_load.addr, server.addr);
    // One live server: soft limit is max_range_bytes / min(64, 2).
    assert_eq!(users_load.soft_limit, master_config().max_range_bytes / 2);

    // Each table got a metadata row with an empty start row.
    let row = metadata_row_key(1, END_ROW_MARKER);
    assert_eq!(harness.metadata.get(&row, COLUMN_START_ROW).unwrap(), b"".to_vec());

    // Access-group directories were created in the filesystem broker.
    let dirs = harness.fs.dirs.lock().clone();
    assert!(dirs.contains(&format!("{TABLES_DIR}/users/default")));
}

#[test]
fn create_table_round_trips_through_get_schema() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let server = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    harness.master.register_server(&server.location, server.addr).unwrap();

    harness.master.create_table("users", &user_schema()).unwrap();
    let rendered = harness.master.get_schema("users").unwrap();

    // The stored schema is the canonical form with assigned ids.
    let mut expected = ht_store::Schema::parse(&user_schema()).unwrap();
    expected.assign_ids();
    assert_eq!(rendered, expected.render());

    let err = harness.master.get_schema("absent").unwrap_err();
    assert_eq!(err.code(), ErrorCode::TableDoesNotExist);
}

#[test]
fn duplicate_and_malformed_tables_are_rejected() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let server = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    harness.master.register_server(&server.location, server.addr).unwrap();

    harness.master.create_table("users", &user_schema()).unwrap();
    let err = harness.master.create_table("users", &user_schema()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MasterTableExists);

    let err = harness.master.create_table("broken", "{ nope").unwrap_err();
    assert_eq!(err.code(), ErrorCode::MasterBadSchema);

    // Neither failure consumed a table id.
    assert_eq!(harness.master.last_table_id(), 1);
}

#[test]
fn create_table_without_servers_times_out_waiting_for_metadata() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);

    let err = harness.master.create_table("early", &user_schema()).unwrap_err();
    assert_eq!(err.code(), ErrorCode::MasterNoRangeservers);
}

#[test]
fn report_split_assigns_round_robin_with_the_transfer_log() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let s1 = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    let s2 = RangeServerSim::launch(&ns, "10.0.0.2_38060");
    harness.master.register_server(&s1.location, s1.addr).unwrap();
    harness.master.register_server(&s2.location, s2.addr).unwrap();

    let table = ht_store::TableIdentifier {
        name: "users".to_string(),
        id: 1,
        generation: 1,
    };
    let range = ht_store::RangeSpec {
        start_row: b"m".to_vec(),
        end_row: END_ROW_MARKER.to_vec(),
    };
    harness
        .master
        .report_split(&table, &range, "/logs/transfer/0001", 1_000_000)
        .unwrap();

    // The load is issued asynchronously after the call returns.
    assert!(wait_until(Duration::from_secs(5), || harness
        .rpc
        .loads()
        .iter()
        .any(|l| l.transfer_log.is_some())));
    let loads = harness.rpc.loads();
    let load = loads.iter().find(|l| l.transfer_log.is_some()).unwrap();
    assert_eq!(load.table, "users");
    assert_eq!(load.transfer_log.as_deref(), Some("/logs/transfer/0001"));
    assert_eq!(load.soft_limit, 1_000_000);
    assert_eq!(load.range, range);
}

#[test]
fn shutdown_drains_the_server_map() {
    let ns = LocalNamespace::new();
    let harness = start_master(&ns);
    let s1 = RangeServerSim::launch(&ns, "10.0.0.1_38060");
    harness.master.register_server(&s1.location, s1.addr).unwrap();

    // The mock rpc does not kill servers; simulate the server reacting to
    // the shutdown broadcast from another thread.
    let master = harness.master.clone();
    let drain = {
        let ns = ns.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            s1.die(&ns);
        })
    };

    master.shutdown().unwrap();
    drain.join().unwrap();
    assert_eq!(master.server_count(), 0);
    assert_eq!(harness.rpc.shutdowns.lock().len(), 1);
}
