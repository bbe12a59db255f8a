//! Client library for the namespace service.
//!
//! The namespace service is the replicated coordination master that holds
//! the cluster's file tree, attributes, and advisory locks behind leased
//! sessions. This crate provides the client half: the wire protocol, the
//! session state machine with its request/reply multiplexer, per-handle
//! lock state, and the delivery surface the keepalive channel drives.
//! The transport itself (framing, connection pooling, timeouts) lives
//! behind the [`transport::Transport`] seam.

pub mod handle;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use handle::{
    ClientHandleState, HandleCallback, LockSequencer, NamespaceEvent, EVENT_MASK_ATTR_DEL,
    EVENT_MASK_ATTR_SET, EVENT_MASK_CHILD_NODE_ADDED, EVENT_MASK_CHILD_NODE_REMOVED,
    EVENT_MASK_LOCK_ACQUIRED, EVENT_MASK_LOCK_RELEASED,
};
pub use protocol::{
    Attribute, DirEntry, LockStatus, OpenResult, LOCK_MODE_EXCLUSIVE, LOCK_MODE_SHARED,
    OPEN_FLAG_CREATE, OPEN_FLAG_EXCL, OPEN_FLAG_LOCK, OPEN_FLAG_LOCK_EXCLUSIVE,
    OPEN_FLAG_LOCK_SHARED, OPEN_FLAG_READ, OPEN_FLAG_TEMP, OPEN_FLAG_WRITE,
};
pub use session::{normalize_name, Session, SessionCallback, SessionConfig, SessionState};
pub use transport::{CommEvent, DispatchHandler, ReplySynchronizer, Transport};
