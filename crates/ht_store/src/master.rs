//! Master process logic.
//!
//! The master owns the cluster's naming in the namespace service. At
//! startup it ensures the directory layout, takes the exclusive lock on
//! `/hypertable/master` (single-writer election), publishes its address,
//! and rebuilds the live-server map from `/hypertable/servers`. Range
//! servers are admitted through their advisory lock files: the lock *is*
//! the liveness token, so winning `try_lock` on a server file proves the
//! server is dead. Every startup failure is fatal to the process.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ht_core::{ErrorCode, Exception, Result};
use ht_namespace::session::Session;
use ht_namespace::{
    HandleCallback, LockSequencer, LockStatus, EVENT_MASK_CHILD_NODE_ADDED,
    EVENT_MASK_CHILD_NODE_REMOVED, EVENT_MASK_LOCK_RELEASED, LOCK_MODE_EXCLUSIVE, OPEN_FLAG_CREATE,
    OPEN_FLAG_LOCK, OPEN_FLAG_READ, OPEN_FLAG_WRITE,
};
use parking_lot::{Condvar, Mutex};

use crate::fs_broker::FsBroker;
use crate::gc::{self, GcWorkers, UnassignedRangeSweep};
use crate::location_cache::location_to_addr;
use crate::metadata::MetadataTable;
use crate::range_server::{dispatch_drop_table, RangeServerRpc};
use crate::schema::Schema;
use crate::types::{
    metadata_row_key, RangeSpec, RangeState, ScanSpec, TableIdentifier, COLUMN_LOCATION,
    COLUMN_START_ROW, END_ROOT_ROW, END_ROW_MARKER, MASTER_FILE, METADATA_TABLE_ID,
    METADATA_TABLE_NAME, ROOT_FILE, SERVERS_DIR, TABLES_DIR, TOPLEVEL_DIR,
};

const LAST_TABLE_ID_ATTR: &str = "last_table_id";
const ADDRESS_ATTR: &str = "address";
const TABLE_ID_ATTR: &str = "table_id";
const SCHEMA_ATTR: &str = "schema";

/// How long table operations wait for the metadata table to come up.
const METADATA_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct MasterConfig {
    /// Address published on `/hypertable/master` for clients.
    pub address: SocketAddr,
    /// Range soft-limit ceiling; first ranges of new tables get a
    /// fraction of this.
    pub max_range_bytes: u64,
    /// Budget for namespace and broker connections at startup.
    pub startup_timeout: Duration,
    pub gc_interval: Duration,
}

impl MasterConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            max_range_bytes: 200_000_000,
            startup_timeout: Duration::from_secs(30),
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// Live range server tracked by the master.
#[derive(Clone, Debug)]
pub struct RangeServerState {
    pub location: String,
    pub addr: SocketAddr,
    /// Open handle on the server's lock file; the watcher on it reports
    /// the server's death.
    pub namespace_handle: u64,
}

#[derive(Default)]
struct ServerMap {
    map: std::collections::BTreeMap<String, Arc<RangeServerState>>,
    /// Round-robin cursor: the last assigned location. Assignment takes
    /// the next key strictly after it, so erasing the cursor's entry
    /// cannot invalidate it.
    cursor: Option<String>,
    servers_dir_handle: u64,
}

pub struct Master {
    session: Arc<Session>,
    fs: Arc<dyn FsBroker>,
    rpc: Arc<dyn RangeServerRpc>,
    metadata: Arc<dyn MetadataTable>,
    config: MasterConfig,
    master_file_handle: u64,
    master_file_sequencer: LockSequencer,
    last_table_id: AtomicU32,
    servers: Mutex<ServerMap>,
    no_servers_cond: Condvar,
    initialized: Mutex<bool>,
    initialized_cond: Condvar,
    gc: Mutex<Option<GcWorkers>>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master").finish_non_exhaustive()
    }
}

struct ServerLockFileHandler {
    master: Weak<Master>,
    location: String,
}

impl HandleCallback for ServerLockFileHandler {
    fn event_mask(&self) -> u32 {
        EVENT_MASK_LOCK_RELEASED
    }

    fn lock_released(&self) {
        if let Some(master) = self.master.upgrade() {
            master.server_left(&self.location);
        }
    }
}

struct ServersDirectoryHandler {
    master: Weak<Master>,
}

impl HandleCallback for ServersDirectoryHandler {
    fn event_mask(&self) -> u32 {
        EVENT_MASK_CHILD_NODE_ADDED | EVENT_MASK_CHILD_NODE_REMOVED
    }

    fn child_node_added(&self, name: &str) {
        if self.master.upgrade().is_some() {
            tracing::info!(location = name, "server file appeared");
        }
    }

    fn child_node_removed(&self, name: &str) {
        if self.master.upgrade().is_some() {
            tracing::info!(location = name, "server file removed");
        }
    }
}

impl Master {
    /// Run the one-shot startup sequence. Any failure here is fatal; the
    /// caller is expected to exit.
    pub fn start(
        session: Arc<Session>,
        fs: Arc<dyn FsBroker>,
        rpc: Arc<dyn RangeServerRpc>,
        metadata: Arc<dyn MetadataTable>,
        config: MasterConfig,
    ) -> Result<Arc<Master>> {
        if !session.wait_for_connection(config.startup_timeout) {
            return Err(Exception::new(
                ErrorCode::ConnectErrorNamespace,
                "unable to connect to the namespace service",
            ));
        }

        Self::initialize_layout(&session)?;

        // Single-writer election: the exclusive lock on the master file.
        let open = session.open(
            MASTER_FILE,
            OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_LOCK,
            None,
        )?;
        let master_file_handle = open.handle;
        let (status, sequencer) = session.try_lock(master_file_handle, LOCK_MODE_EXCLUSIVE)?;
        if status != LockStatus::Granted {
            return Err(Exception::new(
                ErrorCode::NamespaceLockConflict,
                format!("unable to obtain lock on '{MASTER_FILE}' - another master is active"),
            ));
        }
        let master_file_sequencer = sequencer.expect("granted try_lock carries a sequencer");

        session.attr_set(
            master_file_handle,
            ADDRESS_ATTR,
            config.address.to_string().as_bytes(),
        )?;

        let last_table_id = match session.attr_get(master_file_handle, LAST_TABLE_ID_ATTR) {
            Ok(value) => decode_table_id(&value)?,
            Err(error) if error.code() == ErrorCode::NamespaceAttrNotFound => {
                session.attr_set(master_file_handle, LAST_TABLE_ID_ATTR, &0u32.to_le_bytes())?;
                0
            }
            Err(error) => return Err(error),
        };
        tracing::info!(last_table_id, "master holds the cluster lock");

        if !fs.wait_for_connection(config.startup_timeout) {
            return Err(Exception::new(
                ErrorCode::CommConnectError,
                "unable to connect to the filesystem broker",
            ));
        }

        let master = Arc::new(Master {
            session,
            fs,
            rpc,
            metadata,
            config,
            master_file_handle,
            master_file_sequencer,
            last_table_id: AtomicU32::new(last_table_id),
            servers: Mutex::new(ServerMap::default()),
            no_servers_cond: Condvar::new(),
            initialized: Mutex::new(false),
            initialized_cond: Condvar::new(),
            gc: Mutex::new(None),
        });

        master.scan_servers_directory()?;

        let tasks: Vec<Arc<dyn gc::GcTask>> =
            vec![Arc::new(UnassignedRangeSweep::new(master.metadata.clone()))];
        *master.gc.lock() = Some(gc::spawn(master.config.gc_interval, tasks));

        Ok(master)
    }

    /// Ensure the namespace layout exists; seed `last_table_id` only when
    /// the master file is first created.
    fn initialize_layout(session: &Session) -> Result<()> {
        for dir in [TOPLEVEL_DIR, SERVERS_DIR, TABLES_DIR] {
            if !session.exists(dir)? {
                session.mkdir(dir).map_err(|e| {
                    Exception::chain(
                        e.code(),
                        format!("problem creating namespace directory '{dir}'"),
                        e,
                    )
                })?;
            }
        }

        let open = session.open(
            MASTER_FILE,
            OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE,
            None,
        )?;
        if open.created {
            session.attr_set(open.handle, LAST_TABLE_ID_ATTR, &0u32.to_le_bytes())?;
        }
        session.close(open.handle)?;

        let open = session.open(
            ROOT_FILE,
            OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE,
            None,
        )?;
        session.close(open.handle)?;
        Ok(())
    }

    /// The sequencer proving this master's lock authority.
    pub fn lock_sequencer(&self) -> &LockSequencer {
        &self.master_file_sequencer
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn last_table_id(&self) -> u32 {
        self.last_table_id.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock()
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().map.len()
    }

    pub fn server_locations(&self) -> Vec<String> {
        self.servers.lock().map.keys().cloned().collect()
    }

    /// Rebuild the server map from the servers directory, pruning files
    /// whose owners are gone.
    fn scan_servers_directory(self: &Arc<Self>) -> Result<()> {
        let handler = Arc::new(ServersDirectoryHandler {
            master: Arc::downgrade(self),
        });
        let dir = self.session.open(SERVERS_DIR, OPEN_FLAG_READ, Some(handler))?;
        let listing = self.session.readdir(dir.handle)?;

        let mut servers = self.servers.lock();
        servers.servers_dir_handle = dir.handle;
        for entry in listing {
            if let Some(state) = self.probe_server_file(&entry.name, None)? {
                servers.map.insert(entry.name.clone(), state);
            }
        }
        tracing::info!(servers = servers.map.len(), "scanned servers directory");
        Ok(())
    }

    /// Open a server's lock file with a death watcher and probe its lock.
    ///
    /// `None` means the file was stale: the only writer of that file is
    /// the range server itself, holding the lock while alive, so winning
    /// `try_lock` proves its session has expired. The file is removed.
    fn probe_server_file(
        self: &Arc<Self>,
        location: &str,
        addr: Option<SocketAddr>,
    ) -> Result<Option<Arc<RangeServerState>>> {
        let file = format!("{SERVERS_DIR}/{location}");
        let handler = Arc::new(ServerLockFileHandler {
            master: Arc::downgrade(self),
            location: location.to_string(),
        });
        let open = self.session.open(
            &file,
            OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_LOCK,
            Some(handler),
        )?;
        let (status, _) = self.session.try_lock(open.handle, LOCK_MODE_EXCLUSIVE)?;
        if status == LockStatus::Granted {
            tracing::info!(location, "obtained lock on server file, removing");
            self.session.unlink(&file)?;
            self.session.close(open.handle)?;
            return Ok(None);
        }
        let addr = match addr {
            Some(addr) => addr,
            None => location_to_addr(location)?,
        };
        Ok(Some(Arc::new(RangeServerState {
            location: location.to_string(),
            addr,
            namespace_handle: open.handle,
        })))
    }

    /// Admit a range server. On the first successful admission the
    /// metadata table is bootstrapped onto it.
    pub fn register_server(self: &Arc<Self>, location: &str, addr: SocketAddr) -> Result<()> {
        let admitted = {
            let mut servers = self.servers.lock();
            if servers.map.contains_key(location) {
                return Err(Exception::new(
                    ErrorCode::FailedExpectation,
                    format!("server '{location}' is already registered"),
                ));
            }
            let alias = location_to_addr(location)?;
            self.rpc.set_alias(addr, alias);

            match self.probe_server_file(location, Some(addr))? {
                Some(state) => {
                    servers.map.insert(location.to_string(), state);
                    true
                }
                None => false,
            }
        };
        if !admitted {
            return Ok(());
        }
        self.server_joined(location);
        tracing::info!(location, %addr, "server registered");

        self.bootstrap_metadata(addr)
    }

    fn server_joined(&self, location: &str) {
        tracing::info!(location, "server joined");
    }

    /// Lock-loss handler for an admitted server: re-probe its file and,
    /// on success, retire it from the map.
    pub fn server_left(&self, location: &str) {
        let mut servers = self.servers.lock();
        let Some(state) = servers.map.get(location).cloned() else {
            tracing::warn!(location, "server not found in map");
            return;
        };
        let file = format!("{SERVERS_DIR}/{location}");

        let status = match self
            .session
            .try_lock(state.namespace_handle, LOCK_MODE_EXCLUSIVE)
        {
            Ok((status, _)) => status,
            Err(error) => {
                tracing::warn!(location, error = %error, "probe of server file failed");
                return;
            }
        };
        if status != LockStatus::Granted {
            tracing::info!(location, "unable to obtain lock on server file, ignoring");
            return;
        }

        if let Err(error) = self.session.unlink(&file) {
            tracing::warn!(location, error = %error, "problem removing server file");
        }
        if let Err(error) = self.session.close(state.namespace_handle) {
            tracing::warn!(location, error = %error, "problem closing server file handle");
        }
        servers.map.remove(location);
        if servers.map.is_empty() {
            self.no_servers_cond.notify_all();
        }
        tracing::info!(location, "range server lost its lock, removed from server map");

        // Reassignment of the dead server's ranges is scheduled from here.
    }

    /// First-admission bootstrap: create the metadata table, load its root
    /// range, describe and load the second-level range.
    fn bootstrap_metadata(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let mut existed = false;
        match self.create_table_inner(METADATA_TABLE_NAME, &Schema::metadata_text()) {
            Ok(()) => {}
            Err(error) if error.code() == ErrorCode::MasterTableExists => existed = true,
            Err(error) => return Err(error),
        }

        // If the table already existed, its ranges were assigned in an
        // earlier life.
        if existed {
            self.mark_initialized();
            return Ok(());
        }

        let table = TableIdentifier {
            name: METADATA_TABLE_NAME.to_string(),
            id: METADATA_TABLE_ID,
            generation: Schema::metadata().generation,
        };
        let range_state = RangeState {
            soft_limit: self.config.max_range_bytes,
        };

        let root_range = RangeSpec::root_metadata();
        if let Err(error) =
            self.rpc
                .load_range(addr, &table, &root_range, None, &range_state, None)
        {
            tracing::error!(
                %addr,
                error = %error,
                "problem issuing 'load range' command for the root metadata range"
            );
        }

        let mut writer = self.metadata.writer();
        let row = metadata_row_key(METADATA_TABLE_ID, END_ROW_MARKER);
        writer.set(&row, COLUMN_START_ROW, END_ROOT_ROW)?;
        writer.flush().map_err(|e| {
            Exception::chain(
                e.code(),
                format!(
                    "metadata update error (row_key = {})",
                    String::from_utf8_lossy(&row)
                ),
                e,
            )
        })?;

        let second_level = RangeSpec::second_level_metadata();
        if let Err(error) =
            self.rpc
                .load_range(addr, &table, &second_level, None, &range_state, None)
        {
            tracing::error!(
                %addr,
                error = %error,
                "problem issuing 'load range' command for the second-level metadata range"
            );
        }

        self.mark_initialized();
        Ok(())
    }

    fn mark_initialized(&self) {
        *self.initialized.lock() = true;
        self.initialized_cond.notify_all();
        tracing::info!("metadata table is online");
    }

    fn wait_for_initialized(&self) -> Result<()> {
        let deadline = Instant::now() + METADATA_WAIT;
        let mut initialized = self.initialized.lock();
        while !*initialized {
            if self
                .initialized_cond
                .wait_until(&mut initialized, deadline)
                .timed_out()
            {
                break;
            }
        }
        if !*initialized {
            return Err(Exception::new(
                ErrorCode::MasterNoRangeservers,
                "no range servers have registered",
            ));
        }
        Ok(())
    }

    pub fn create_table(&self, name: &str, schema_text: &str) -> Result<()> {
        tracing::info!(table = name, "create table");
        self.create_table_inner(name, schema_text)
    }

    fn create_table_inner(&self, name: &str, schema_text: &str) -> Result<()> {
        let table_file = format!("{TABLES_DIR}/{name}");

        if self.session.exists(&table_file)? {
            return Err(Exception::new(ErrorCode::MasterTableExists, name));
        }

        let mut schema = Schema::parse(schema_text)?;
        schema.assign_ids();
        let rendered = schema.render();

        let open = self.session.open(
            &table_file,
            OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE,
            None,
        )?;

        // Allocate the table id, persisting the counter before any other
        // state changes.
        let table_id = if name == METADATA_TABLE_NAME {
            METADATA_TABLE_ID
        } else {
            let id = self.last_table_id.fetch_add(1, Ordering::AcqRel) + 1;
            self.session
                .attr_set(self.master_file_handle, LAST_TABLE_ID_ATTR, &id.to_le_bytes())?;
            id
        };

        self.session
            .attr_set(open.handle, TABLE_ID_ATTR, &table_id.to_le_bytes())?;
        self.session
            .attr_set(open.handle, SCHEMA_ATTR, rendered.as_bytes())?;
        self.session.close(open.handle)?;

        for ag_name in schema.access_group_names() {
            self.fs.mkdirs(&format!("{TABLES_DIR}/{name}/{ag_name}"))?;
        }

        if table_id != METADATA_TABLE_ID {
            self.wait_for_initialized()?;

            let mut writer = self.metadata.writer();
            writer.set(
                &metadata_row_key(table_id, END_ROW_MARKER),
                COLUMN_START_ROW,
                b"",
            )?;
            writer.flush()?;

            let (location, addr, soft_limit) = {
                let mut servers = self.servers.lock();
                let server_count = servers.map.len() as u64;
                let Some((location, addr)) = next_server(&mut servers) else {
                    return Err(Exception::new(
                        ErrorCode::MasterNoRangeservers,
                        "no range servers available for the initial range",
                    ));
                };
                (
                    location,
                    addr,
                    self.config.max_range_bytes / u64::min(64, server_count * 2),
                )
            };
            tracing::info!(table = name, table_id, location = %location, "assigning first range");

            let table = TableIdentifier {
                name: name.to_string(),
                id: table_id,
                generation: schema.generation,
            };
            let range = RangeSpec::full();
            self.rpc
                .load_range(addr, &table, &range, None, &RangeState { soft_limit }, None)
                .map_err(|e| {
                    Exception::chain(
                        e.code(),
                        format!(
                            "problem issuing 'load range' command for {name}[..] at server {addr}"
                        ),
                        e,
                    )
                })?;
        }

        tracing::info!(table = name, table_id, "table created");
        Ok(())
    }

    /// Canonical schema text of an existing table.
    pub fn get_schema(&self, name: &str) -> Result<String> {
        let table_file = format!("{TABLES_DIR}/{name}");
        if !self.session.exists(&table_file)? {
            return Err(Exception::new(ErrorCode::TableDoesNotExist, name));
        }
        let open = self.session.open(&table_file, OPEN_FLAG_READ, None)?;
        let value = self.session.attr_get(open.handle, SCHEMA_ATTR)?;
        self.session.close(open.handle)?;
        String::from_utf8(value).map_err(|_| {
            Exception::new(
                ErrorCode::BadSchema,
                format!("stored schema of '{name}' is not valid utf-8"),
            )
        })
    }

    /// Drop a table: fan the drop out to every server holding one of its
    /// ranges, then unlink the table file. A server missing from the map
    /// fails the drop and leaves the table file in place.
    pub fn drop_table(&self, name: &str, if_exists: bool) -> Result<()> {
        tracing::info!(table = name, if_exists, "drop table");
        let table_file = format!("{TABLES_DIR}/{name}");

        let open = match self.session.open(&table_file, OPEN_FLAG_READ, None) {
            Ok(open) => open,
            Err(error) if if_exists && error.code() == ErrorCode::NamespaceBadPathname => {
                return Ok(());
            }
            Err(error) => {
                return Err(Exception::chain(
                    error.code(),
                    format!("problem opening file '{table_file}'"),
                    error,
                ))
            }
        };
        let value = self.session.attr_get(open.handle, TABLE_ID_ATTR)?;
        self.session.close(open.handle)?;
        let table_id = decode_table_id(&value)?;

        self.wait_for_initialized().map_err(|e| {
            Exception::chain(
                e.code(),
                "aborting drop table because no range servers have registered",
                e,
            )
        })?;

        let spec = ScanSpec {
            row_interval: (
                metadata_row_key(table_id, b""),
                metadata_row_key(table_id, END_ROW_MARKER),
            ),
            columns: vec![COLUMN_LOCATION.to_string()],
            max_versions: 1,
            row_limit: 0,
        };
        let cells = self.metadata.scan(&spec)?;
        let mut locations = BTreeSet::new();
        for cell in &cells {
            let location = String::from_utf8_lossy(&cell.value).trim().to_string();
            if !location.is_empty() && location != "!" {
                locations.insert(location);
            }
        }

        let mut saved_error = None;
        let mut addrs = Vec::new();
        {
            let servers = self.servers.lock();
            for location in &locations {
                match servers.map.get(location) {
                    Some(state) => addrs.push(state.addr),
                    None => {
                        saved_error = Some(Exception::new(
                            ErrorCode::RangeserverUnavailable,
                            location.clone(),
                        ));
                    }
                }
            }
        }

        let table = TableIdentifier {
            name: name.to_string(),
            id: table_id,
            generation: 0,
        };
        if !addrs.is_empty() {
            let errors = dispatch_drop_table(&self.rpc, &table, &addrs);
            if !errors.is_empty() {
                for failure in &errors {
                    tracing::warn!(addr = %failure.addr, error = %failure.error, "drop table error");
                }
                return Err(errors.into_iter().next().unwrap().error);
            }
        }

        if let Some(error) = saved_error {
            tracing::error!(table = name, error = %error, "drop table failed");
            return Err(error);
        }

        self.session.unlink(&table_file)?;
        tracing::info!(table = name, table_id, "table dropped");
        Ok(())
    }

    /// Accept a reported split: pick the next server round-robin, reply
    /// immediately, and issue the load asynchronously with the carried
    /// transfer log.
    pub fn report_split(
        &self,
        table: &TableIdentifier,
        range: &RangeSpec,
        transfer_log: &str,
        soft_limit: u64,
    ) -> Result<()> {
        tracing::info!(
            table = %table.name,
            start_row = %String::from_utf8_lossy(&range.start_row),
            end_row = %String::from_utf8_lossy(&range.end_row),
            "report split"
        );

        let (location, addr) = {
            let mut servers = self.servers.lock();
            next_server(&mut servers).ok_or_else(|| {
                Exception::new(
                    ErrorCode::MasterNoRangeservers,
                    "no range servers available for the split range",
                )
            })?
        };
        tracing::info!(table = %table.name, location = %location, "assigning newly reported range");

        let rpc = self.rpc.clone();
        let table = table.clone();
        let range = range.clone();
        let transfer_log = transfer_log.to_string();
        thread::spawn(move || {
            let range_state = RangeState { soft_limit };
            match rpc.load_range(addr, &table, &range, Some(&transfer_log), &range_state, None) {
                Ok(()) => tracing::info!(table = %table.name, %addr, "split range loaded"),
                Err(error) => tracing::error!(
                    table = %table.name,
                    %addr,
                    error = %error,
                    "problem issuing 'load range' command for the split range"
                ),
            }
        });
        Ok(())
    }

    /// Broadcast shutdown to every server and wait for the map to drain.
    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("shutdown");
        let addrs: Vec<SocketAddr> = {
            let servers = self.servers.lock();
            servers.map.values().map(|state| state.addr).collect()
        };
        for addr in addrs {
            if let Err(error) = self.rpc.shutdown(addr) {
                tracing::warn!(%addr, error = %error, "shutdown command failed");
            }
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        let mut servers = self.servers.lock();
        while !servers.map.is_empty() {
            if self
                .no_servers_cond
                .wait_until(&mut servers, deadline)
                .timed_out()
            {
                break;
            }
        }
        if !servers.map.is_empty() {
            return Err(Exception::new(
                ErrorCode::RequestTimeout,
                format!("{} range servers failed to shutdown", servers.map.len()),
            ));
        }
        let dir_handle = servers.servers_dir_handle;
        drop(servers);

        if dir_handle != 0 {
            if let Err(error) = self.session.close(dir_handle) {
                tracing::warn!(error = %error, "problem closing servers directory handle");
            }
        }
        if let Some(workers) = self.gc.lock().take() {
            workers.join();
        }
        Ok(())
    }
}

/// Round-robin over the ordered server map: the entry strictly after the
/// cursor, wrapping to the front.
fn next_server(servers: &mut ServerMap) -> Option<(String, SocketAddr)> {
    let next = match &servers.cursor {
        Some(cursor) => servers
            .map
            .range::<String, _>((Bound::Excluded(cursor.clone()), Bound::Unbounded))
            .next(),
        None => None,
    }
    .or_else(|| servers.map.iter().next())
    .map(|(location, state)| (location.clone(), state.addr))?;
    servers.cursor = Some(next.0.clone());
    Some(next)
}

fn decode_table_id(value: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = value.try_into().map_err(|_| {
        Exception::new(
            ErrorCode::FailedExpectation,
            format!("table id attribute has width {} (expected 4)", value.len()),
        )
    })?;
    Ok(u32::from_le_bytes(bytes))
}
