//! Range-server RPC seam and fan-out dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ht_core::{Exception, Result};
use parking_lot::Mutex;

use crate::types::{Cell, RangeSpec, RangeState, ScanSpec, TableIdentifier};

/// Client interface to a range server, implemented over the comm
/// subsystem outside this crate.
pub trait RangeServerRpc: Send + Sync {
    /// Direct the server at `addr` to load and serve `range`.
    fn load_range(
        &self,
        addr: SocketAddr,
        table: &TableIdentifier,
        range: &RangeSpec,
        transfer_log: Option<&str>,
        range_state: &RangeState,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Drop all of `table`'s ranges held by the server at `addr`.
    fn drop_table(&self, addr: SocketAddr, table: &TableIdentifier) -> Result<()>;

    fn shutdown(&self, addr: SocketAddr) -> Result<()>;

    /// Synchronous interval scan against one server.
    fn scan_range(
        &self,
        addr: SocketAddr,
        table: &TableIdentifier,
        scan: &ScanSpec,
    ) -> Result<Vec<Cell>>;

    /// Route future messages for `addr` to the peer already connected as
    /// `alias`.
    fn set_alias(&self, addr: SocketAddr, alias: SocketAddr);
}

/// One failed peer from a fan-out.
#[derive(Debug)]
pub struct DispatchError {
    pub addr: SocketAddr,
    pub error: Exception,
}

/// Fan `drop_table` out to every address, collecting per-peer failures.
pub fn dispatch_drop_table(
    rpc: &Arc<dyn RangeServerRpc>,
    table: &TableIdentifier,
    addrs: &[SocketAddr],
) -> Vec<DispatchError> {
    let errors = Mutex::new(Vec::new());
    thread::scope(|scope| {
        for addr in addrs {
            let rpc = rpc.clone();
            let errors = &errors;
            scope.spawn(move || {
                if let Err(error) = rpc.drop_table(*addr, table) {
                    errors.lock().push(DispatchError { addr: *addr, error });
                }
            });
        }
    });
    errors.into_inner()
}
