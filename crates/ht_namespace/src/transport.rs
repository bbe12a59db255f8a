//! Transport seam between the session and the comm subsystem.
//!
//! The real transport (framing, connection pooling, retries at the socket
//! level) lives outside this crate. The session only needs to hand a
//! request buffer to an address and receive exactly one event back on the
//! supplied handler: a reply payload, a timeout, or a transport error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ht_core::{ErrorCode, Result};
use parking_lot::{Condvar, Mutex};

/// Terminal event for one in-flight request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommEvent {
    /// Complete reply payload, response code included.
    Reply(Vec<u8>),
    /// No reply arrived within the submission timeout.
    Timeout,
    /// The connection failed after the request was accepted.
    Error(ErrorCode),
}

/// Receives the single terminal event for a request.
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: CommEvent);
}

/// Request submission interface implemented by the comm subsystem.
pub trait Transport: Send + Sync {
    /// Submit `buf` to `addr`. The handler fires exactly once with the
    /// reply, a timeout, or an error event. An `Err` return means the
    /// request never left this process.
    fn send_request(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        buf: Vec<u8>,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<()>;
}

/// Blocks one calling thread until the terminal event arrives.
///
/// Every synchronous session operation attaches one of these to its
/// request submission.
#[derive(Default)]
pub struct ReplySynchronizer {
    slot: Mutex<Option<CommEvent>>,
    cond: Condvar,
}

impl ReplySynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait_for_reply(&self) -> CommEvent {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.cond.wait(&mut slot);
        }
        slot.take().unwrap()
    }
}

impl DispatchHandler for ReplySynchronizer {
    fn handle(&self, event: CommEvent) {
        let mut slot = self.slot.lock();
        *slot = Some(event);
        self.cond.notify_all();
    }
}
