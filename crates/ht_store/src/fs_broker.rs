//! Filesystem-broker seam.
//!
//! The broker fronts the distributed filesystem holding cell stores and
//! commit logs. The master only creates per-access-group directories at
//! table creation; the byte-stream operations belong to subsystems
//! outside this crate.

use std::time::Duration;

use ht_core::Result;

pub trait FsBroker: Send + Sync {
    /// Block until the broker connection is usable, up to `timeout`.
    fn wait_for_connection(&self, timeout: Duration) -> bool;

    /// Create `path` and any missing parents.
    fn mkdirs(&self, path: &str) -> Result<()>;
}
