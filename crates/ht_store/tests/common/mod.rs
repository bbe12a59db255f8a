//! Shared collaborators for store integration tests: an in-memory
//! metadata table, a recording range-server RPC, and a scripted range
//! server that holds its lock file the way a live one does.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ht_core::{ErrorCode, Exception, Result};
use ht_namespace::session::{Session, SessionConfig};
use ht_namespace::testing::{LocalClient, LocalNamespace};
use ht_namespace::{
    LockStatus, LOCK_MODE_EXCLUSIVE, OPEN_FLAG_CREATE, OPEN_FLAG_LOCK, OPEN_FLAG_READ,
    OPEN_FLAG_WRITE,
};
use ht_store::fs_broker::FsBroker;
use ht_store::master::{Master, MasterConfig};
use ht_store::metadata::{MetadataTable, MetadataWriter};
use ht_store::range_server::RangeServerRpc;
use ht_store::schema::Schema;
use ht_store::types::{Cell, RangeSpec, RangeState, ScanSpec, TableIdentifier, SERVERS_DIR};
use parking_lot::Mutex;

/// Route library logs through the test harness; `RUST_LOG` filters as
/// usual.
pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Connect a fresh session to the in-process namespace master.
pub fn connect(ns: &LocalNamespace) -> (Arc<LocalClient>, Arc<Session>) {
    init_logging();
    let client = ns.client();
    let session = Arc::new(Session::new(
        client.clone(),
        SessionConfig::new(ns.addr()),
        None,
    ));
    ns.bind(&client, &session);
    assert!(
        session.wait_for_connection(Duration::from_secs(5)),
        "session never became safe"
    );
    (client, session)
}

pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

// --- metadata table -----------------------------------------------------

type RowStore = BTreeMap<Vec<u8>, BTreeMap<String, Vec<u8>>>;

/// Metadata table backed by a row/column map; scans honor the inclusive
/// row interval and the requested column names.
pub struct InMemMetadata {
    rows: Arc<Mutex<RowStore>>,
    schema: Schema,
}

impl InMemMetadata {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Arc::new(Mutex::new(BTreeMap::new())),
            schema: Schema::metadata(),
        })
    }

    pub fn put(&self, row: &[u8], family: &str, value: &[u8]) {
        self.rows
            .lock()
            .entry(row.to_vec())
            .or_default()
            .insert(family.to_string(), value.to_vec());
    }

    pub fn get(&self, row: &[u8], family: &str) -> Option<Vec<u8>> {
        self.rows.lock().get(row)?.get(family).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

impl MetadataTable for InMemMetadata {
    fn scan(&self, spec: &ScanSpec) -> Result<Vec<Cell>> {
        let rows = self.rows.lock();
        let (start, end) = &spec.row_interval;
        let mut cells = Vec::new();
        for (row, families) in rows.range(start.clone()..=end.clone()) {
            for column in &spec.columns {
                if let Some(value) = families.get(column) {
                    let column_id = self.schema.column_family_id(column).unwrap_or(0);
                    cells.push(Cell {
                        row: row.clone(),
                        column_id,
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(cells)
    }

    fn writer(&self) -> Box<dyn MetadataWriter> {
        Box::new(InMemWriter {
            rows: Vec::new(),
            store: self.rows.clone(),
        })
    }
}

struct InMemWriter {
    rows: Vec<(Vec<u8>, String, Vec<u8>)>,
    store: Arc<Mutex<RowStore>>,
}

impl MetadataWriter for InMemWriter {
    fn set(&mut self, row: &[u8], column_family: &str, value: &[u8]) -> Result<()> {
        self.rows
            .push((row.to_vec(), column_family.to_string(), value.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut store = self.store.lock();
        for (row, family, value) in self.rows.drain(..) {
            store.entry(row).or_default().insert(family, value);
        }
        Ok(())
    }
}

// --- range server rpc ---------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedRange {
    pub addr: SocketAddr,
    pub table: String,
    pub table_id: u32,
    pub range: RangeSpec,
    pub transfer_log: Option<String>,
    pub soft_limit: u64,
}

/// Recording RPC stub; scans are served from the shared metadata store.
pub struct MockRangeServerRpc {
    pub metadata: Arc<InMemMetadata>,
    pub loads: Mutex<Vec<LoadedRange>>,
    pub drops: Mutex<Vec<(SocketAddr, u32)>>,
    pub shutdowns: Mutex<Vec<SocketAddr>>,
    pub aliases: Mutex<Vec<(SocketAddr, SocketAddr)>>,
    pub scans: Mutex<Vec<SocketAddr>>,
    pub fail_next_scans: AtomicU32,
    pub fail_drops_at: Mutex<Vec<SocketAddr>>,
}

impl MockRangeServerRpc {
    pub fn new(metadata: Arc<InMemMetadata>) -> Arc<Self> {
        Arc::new(Self {
            metadata,
            loads: Mutex::new(Vec::new()),
            drops: Mutex::new(Vec::new()),
            shutdowns: Mutex::new(Vec::new()),
            aliases: Mutex::new(Vec::new()),
            scans: Mutex::new(Vec::new()),
            fail_next_scans: AtomicU32::new(0),
            fail_drops_at: Mutex::new(Vec::new()),
        })
    }

    pub fn loads(&self) -> Vec<LoadedRange> {
        self.loads.lock().clone()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.lock().len()
    }
}

impl RangeServerRpc for MockRangeServerRpc {
    fn load_range(
        &self,
        addr: SocketAddr,
        table: &TableIdentifier,
        range: &RangeSpec,
        transfer_log: Option<&str>,
        range_state: &RangeState,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.loads.lock().push(LoadedRange {
            addr,
            table: table.name.clone(),
            table_id: table.id,
            range: range.clone(),
            transfer_log: transfer_log.map(str::to_string),
            soft_limit: range_state.soft_limit,
        });
        Ok(())
    }

    fn drop_table(&self, addr: SocketAddr, table: &TableIdentifier) -> Result<()> {
        self.drops.lock().push((addr, table.id));
        if self.fail_drops_at.lock().contains(&addr) {
            return Err(Exception::new(
                ErrorCode::RangeserverTableNotFound,
                format!("table {} not found at {addr}", table.id),
            ));
        }
        Ok(())
    }

    fn shutdown(&self, addr: SocketAddr) -> Result<()> {
        self.shutdowns.lock().push(addr);
        Ok(())
    }

    fn scan_range(
        &self,
        addr: SocketAddr,
        _table: &TableIdentifier,
        scan: &ScanSpec,
    ) -> Result<Vec<Cell>> {
        if self.fail_next_scans.load(Ordering::Acquire) > 0 {
            self.fail_next_scans.fetch_sub(1, Ordering::AcqRel);
            return Err(Exception::new(
                ErrorCode::CommBrokenConnection,
                format!("scan connection to {addr} broke"),
            ));
        }
        self.scans.lock().push(addr);
        self.metadata.scan(scan)
    }

    fn set_alias(&self, addr: SocketAddr, alias: SocketAddr) {
        self.aliases.lock().push((addr, alias));
    }
}

// --- filesystem broker --------------------------------------------------

#[derive(Default)]
pub struct MockFsBroker {
    pub dirs: Mutex<Vec<String>>,
}

impl FsBroker for MockFsBroker {
    fn wait_for_connection(&self, _timeout: Duration) -> bool {
        true
    }

    fn mkdirs(&self, path: &str) -> Result<()> {
        self.dirs.lock().push(path.to_string());
        Ok(())
    }
}

// --- scripted range server ----------------------------------------------

/// A range server's namespace footprint: the lock file under
/// `/hypertable/servers`, created and held locked for as long as the
/// server lives.
pub struct RangeServerSim {
    pub client: Arc<LocalClient>,
    pub session: Arc<Session>,
    pub location: String,
    pub addr: SocketAddr,
    pub file_handle: u64,
}

impl RangeServerSim {
    pub fn launch(ns: &LocalNamespace, location: &str) -> RangeServerSim {
        let (client, session) = connect(ns);
        let addr = ht_store::location_to_addr(location).unwrap();
        let file = format!("{SERVERS_DIR}/{location}");
        let open = session
            .open(
                &file,
                OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE | OPEN_FLAG_LOCK,
                None,
            )
            .unwrap();
        let (status, _) = session.try_lock(open.handle, LOCK_MODE_EXCLUSIVE).unwrap();
        assert_eq!(status, LockStatus::Granted, "server file lock contended");
        RangeServerSim {
            client,
            session,
            location: location.to_string(),
            addr,
            file_handle: open.handle,
        }
    }

    /// Simulate the server dying: its session's handles are dropped and
    /// the lock file watcher fires on the master.
    pub fn die(&self, ns: &LocalNamespace) {
        ns.expire_client(&self.client);
    }
}

// --- master harness -----------------------------------------------------

pub struct MasterHarness {
    pub ns: LocalNamespace,
    pub metadata: Arc<InMemMetadata>,
    pub rpc: Arc<MockRangeServerRpc>,
    pub fs: Arc<MockFsBroker>,
    pub master: Arc<Master>,
}

pub fn master_config() -> MasterConfig {
    let mut config = MasterConfig::new("10.0.0.100:38050".parse().unwrap());
    config.gc_interval = Duration::from_secs(3600);
    config
}

pub fn start_master(ns: &LocalNamespace) -> MasterHarness {
    let metadata = InMemMetadata::new();
    let rpc = MockRangeServerRpc::new(metadata.clone());
    let fs = Arc::new(MockFsBroker::default());
    let (_client, session) = connect(ns);
    let master = Master::start(
        session,
        fs.clone(),
        rpc.clone(),
        metadata.clone(),
        master_config(),
    )
    .expect("master startup failed");
    MasterHarness {
        ns: ns.clone(),
        metadata,
        rpc,
        fs,
        master,
    }
}

/// A plain two-family user schema.
pub fn user_schema() -> String {
    r#"{
        "access_groups": [
            {"name": "default", "column_families": [{"name": "info"}, {"name": "tags"}]}
        ]
    }"#
    .to_string()
}
