//! Client-side mirror of open namespace handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::protocol::LockStatus;

pub const EVENT_MASK_ATTR_SET: u32 = 0x0001;
pub const EVENT_MASK_ATTR_DEL: u32 = 0x0002;
pub const EVENT_MASK_CHILD_NODE_ADDED: u32 = 0x0004;
pub const EVENT_MASK_CHILD_NODE_REMOVED: u32 = 0x0008;
pub const EVENT_MASK_LOCK_ACQUIRED: u32 = 0x0010;
pub const EVENT_MASK_LOCK_RELEASED: u32 = 0x0020;

/// Change notification delivered through the keepalive channel for a
/// watched handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NamespaceEvent {
    AttrSet { name: String },
    AttrDel { name: String },
    ChildNodeAdded { name: String },
    ChildNodeRemoved { name: String },
    LockAcquired { mode: u32 },
    LockReleased,
}

impl NamespaceEvent {
    pub fn mask_bit(&self) -> u32 {
        match self {
            NamespaceEvent::AttrSet { .. } => EVENT_MASK_ATTR_SET,
            NamespaceEvent::AttrDel { .. } => EVENT_MASK_ATTR_DEL,
            NamespaceEvent::ChildNodeAdded { .. } => EVENT_MASK_CHILD_NODE_ADDED,
            NamespaceEvent::ChildNodeRemoved { .. } => EVENT_MASK_CHILD_NODE_REMOVED,
            NamespaceEvent::LockAcquired { .. } => EVENT_MASK_LOCK_ACQUIRED,
            NamespaceEvent::LockReleased => EVENT_MASK_LOCK_RELEASED,
        }
    }
}

/// Watcher attached to a handle at open time. Only events selected by
/// `event_mask` are delivered.
pub trait HandleCallback: Send + Sync {
    fn event_mask(&self) -> u32;
    fn attr_set(&self, _name: &str) {}
    fn attr_del(&self, _name: &str) {}
    fn child_node_added(&self, _name: &str) {}
    fn child_node_removed(&self, _name: &str) {}
    fn lock_acquired(&self, _mode: u32) {}
    fn lock_released(&self) {}
}

/// Proof of lock authority at a given epoch: the generation increases on
/// every grant for a file, so a holder can detect stale authority after a
/// fail-over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockSequencer {
    pub name: String,
    pub mode: u32,
    pub generation: u64,
}

/// Lock fields guarded by the per-handle mutex.
#[derive(Debug, Default)]
pub struct HandleLockState {
    pub lock_mode: u32,
    pub lock_status: Option<LockStatus>,
    pub lock_generation: u64,
    /// Sequencer being filled by an in-flight `lock` call.
    pub sequencer: Option<LockSequencer>,
}

/// Client-side state for one open handle.
///
/// The session never holds its own mutex and a handle mutex at the same
/// time; grant delivery only touches the handle primitives.
pub struct ClientHandleState {
    handle: AtomicU64,
    normal_name: String,
    open_flags: u32,
    event_mask: u32,
    callback: Option<Arc<dyn HandleCallback>>,
    lock: Mutex<HandleLockState>,
    cond: Condvar,
}

impl ClientHandleState {
    pub fn new(
        normal_name: String,
        open_flags: u32,
        callback: Option<Arc<dyn HandleCallback>>,
    ) -> Self {
        let event_mask = callback.as_ref().map_or(0, |cb| cb.event_mask());
        Self {
            handle: AtomicU64::new(0),
            normal_name,
            open_flags,
            event_mask,
            callback,
            lock: Mutex::new(HandleLockState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn handle(&self) -> u64 {
        self.handle.load(Ordering::Acquire)
    }

    pub(crate) fn set_handle(&self, handle: u64) {
        self.handle.store(handle, Ordering::Release);
    }

    pub fn normal_name(&self) -> &str {
        &self.normal_name
    }

    pub fn open_flags(&self) -> u32 {
        self.open_flags
    }

    pub fn event_mask(&self) -> u32 {
        self.event_mask
    }

    pub fn lock_state(&self) -> parking_lot::MutexGuard<'_, HandleLockState> {
        self.lock.lock()
    }

    pub fn wait_lock_state(&self, guard: &mut parking_lot::MutexGuard<'_, HandleLockState>) {
        self.cond.wait(guard);
    }

    pub fn notify_lock_waiters(&self) {
        self.cond.notify_all();
    }

    /// Dispatch an event to the attached watcher if its mask selects it.
    pub fn deliver(&self, event: &NamespaceEvent) {
        let Some(callback) = &self.callback else {
            return;
        };
        if self.event_mask & event.mask_bit() == 0 {
            return;
        }
        match event {
            NamespaceEvent::AttrSet { name } => callback.attr_set(name),
            NamespaceEvent::AttrDel { name } => callback.attr_del(name),
            NamespaceEvent::ChildNodeAdded { name } => callback.child_node_added(name),
            NamespaceEvent::ChildNodeRemoved { name } => callback.child_node_removed(name),
            NamespaceEvent::LockAcquired { mode } => callback.lock_acquired(*mode),
            NamespaceEvent::LockReleased => callback.lock_released(),
        }
    }
}

/// Handle table shared between the session and the keepalive channel.
#[derive(Default)]
pub struct HandleRegistry {
    map: Mutex<HashMap<u64, Arc<ClientHandleState>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, state: Arc<ClientHandleState>) {
        self.map.lock().insert(state.handle(), state);
    }

    pub fn unregister(&self, handle: u64) -> Option<Arc<ClientHandleState>> {
        self.map.lock().remove(&handle)
    }

    pub fn get(&self, handle: u64) -> Option<Arc<ClientHandleState>> {
        self.map.lock().get(&handle).cloned()
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}
