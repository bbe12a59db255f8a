//! Coordination core of the table store.
//!
//! Three pieces live here: the master process logic (cluster naming in the
//! namespace service, range-server admission through advisory locks, and
//! metadata-table bootstrap), the client-side range locator that resolves
//! a `(table, row)` pair to the range server hosting it through the
//! two-level metadata table, and the location cache backing that locator.
//! Range servers, the storage engine, and the RPC transport are
//! collaborators behind the traits in [`range_server`], [`fs_broker`],
//! and [`metadata`].

pub mod fs_broker;
pub mod gc;
pub mod location_cache;
pub mod master;
pub mod metadata;
pub mod range_locator;
pub mod range_server;
pub mod root_files;
pub mod schema;
pub mod types;

pub use location_cache::{location_to_addr, LocationCache, RangeLocationInfo};
pub use master::{Master, MasterConfig, RangeServerState};
pub use range_locator::RangeLocator;
pub use schema::Schema;
pub use types::{Cell, RangeSpec, RangeState, ScanSpec, TableIdentifier};
