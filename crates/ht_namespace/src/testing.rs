//! In-process namespace master.
//!
//! A complete single-process implementation of the namespace protocol over
//! an in-memory node tree: files, directories, attributes, and advisory
//! locks with per-file grant generations and pending queues. It implements
//! [`Transport`], answers requests inline on the calling thread, and plays
//! the keepalive role for every bound session (safe/expired transitions,
//! grant and cancellation delivery, watcher fan-out).
//!
//! Fault injection covers the two transport failure modes the session
//! distinguishes: submission failures and request timeouts.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use ht_core::{ErrorCode, Exception, Result};
use parking_lot::Mutex;

use crate::handle::NamespaceEvent;
use crate::protocol::{
    Attribute, DirEntry, LockStatus, OpenResult, Reply, Request, LOCK_MODE_SHARED,
    OPEN_FLAG_CREATE, OPEN_FLAG_EXCL, OPEN_FLAG_LOCK,
};
use crate::session::{Session, SessionState};
use crate::transport::{CommEvent, DispatchHandler, Transport};

const KEEPALIVE_TICK: Duration = Duration::from_millis(5);

struct Node {
    is_dir: bool,
    attrs: HashMap<String, Vec<u8>>,
    lock_generation: u64,
    lock_mode: u32,
    lock_holders: HashSet<u64>,
    pending: VecDeque<(u64, u32)>,
}

impl Node {
    fn new(is_dir: bool) -> Self {
        Self {
            is_dir,
            attrs: HashMap::new(),
            lock_generation: 0,
            lock_mode: 0,
            lock_holders: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    fn can_grant(&self, mode: u32) -> bool {
        self.lock_holders.is_empty() || (self.lock_mode == LOCK_MODE_SHARED && mode == LOCK_MODE_SHARED)
    }
}

struct OpenHandle {
    path: String,
    client: u64,
    flags: u32,
    event_mask: u32,
}

struct ClientState {
    session: Weak<Session>,
    expired: bool,
}

enum DeliveryKind {
    Event(NamespaceEvent),
    Grant { generation: u64 },
    Cancelled,
}

struct Delivery {
    session: Weak<Session>,
    handle: u64,
    kind: DeliveryKind,
}

#[derive(Default)]
struct MasterState {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<u64, OpenHandle>,
    clients: HashMap<u64, ClientState>,
    next_handle: u64,
    next_client: u64,
    fail_sends: u32,
    timeout_requests: u32,
}

struct MasterInner {
    state: Mutex<MasterState>,
}

/// Handle to the in-process namespace master.
#[derive(Clone)]
pub struct LocalNamespace {
    inner: Arc<MasterInner>,
}

impl Default for LocalNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNamespace {
    pub fn new() -> Self {
        let mut state = MasterState::default();
        state.nodes.insert("/".to_string(), Node::new(true));
        state.next_handle = 1;
        state.next_client = 1;
        Self {
            inner: Arc::new(MasterInner {
                state: Mutex::new(state),
            }),
        }
    }

    /// Address sessions are configured with; the transport ignores it.
    pub fn addr(&self) -> SocketAddr {
        "127.0.0.1:38040".parse().unwrap()
    }

    /// Create a transport endpoint for one client session.
    pub fn client(&self) -> Arc<LocalClient> {
        let mut state = self.inner.state.lock();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(
            id,
            ClientState {
                session: Weak::new(),
                expired: false,
            },
        );
        Arc::new(LocalClient {
            id,
            inner: self.inner.clone(),
        })
    }

    /// Bind `session` to `client` and start playing keepalive for it: the
    /// session is driven to safe while the master is reachable and to
    /// expired once the client is declared dead.
    pub fn bind(&self, client: &LocalClient, session: &Arc<Session>) {
        {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.clients.get_mut(&client.id) {
                entry.session = Arc::downgrade(session);
            }
        }
        let inner = self.inner.clone();
        let weak = Arc::downgrade(session);
        let client_id = client.id;
        thread::spawn(move || loop {
            thread::sleep(KEEPALIVE_TICK);
            let Some(session) = weak.upgrade() else {
                return;
            };
            let expired = {
                let state = inner.state.lock();
                state.clients.get(&client_id).map_or(true, |c| c.expired)
            };
            if expired {
                // A session never goes safe-to-expired directly; jeopardy
                // is always observed in between.
                session.state_transition(SessionState::Jeopardy);
                session.state_transition(SessionState::Expired);
                return;
            }
            session.renew_expiration();
            session.state_transition(SessionState::Safe);
        });
    }

    /// Fail the next `count` request submissions with `CommSendError`.
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.state.lock().fail_sends = count;
    }

    /// Answer the next `count` requests with a timeout event.
    pub fn timeout_next_requests(&self, count: u32) {
        self.inner.state.lock().timeout_requests = count;
    }

    /// Declare the client's session dead: its locks are released (pending
    /// waiters are granted), its handles are dropped, and its keepalive is
    /// driven to expired.
    pub fn expire_client(&self, client: &LocalClient) {
        let deliveries = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.clients.get_mut(&client.id) {
                entry.expired = true;
            }
            close_all_handles(&mut state, client.id)
        };
        dispatch(deliveries);
    }

    /// Drop every handle the client holds without expiring its session.
    pub fn disconnect(&self, client: &LocalClient) {
        let deliveries = {
            let mut state = self.inner.state.lock();
            close_all_handles(&mut state, client.id)
        };
        dispatch(deliveries);
    }

    /// Direct look at an attribute, for assertions.
    pub fn attr(&self, path: &str, name: &str) -> Option<Vec<u8>> {
        let state = self.inner.state.lock();
        state.nodes.get(path)?.attrs.get(name).cloned()
    }

    pub fn node_exists(&self, path: &str) -> bool {
        self.inner.state.lock().nodes.contains_key(path)
    }
}

/// One client's transport endpoint into the in-process master.
pub struct LocalClient {
    id: u64,
    inner: Arc<MasterInner>,
}

impl LocalClient {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Transport for LocalClient {
    fn send_request(
        &self,
        _addr: SocketAddr,
        _timeout: Duration,
        buf: Vec<u8>,
        handler: Arc<dyn DispatchHandler>,
    ) -> Result<()> {
        let (event, deliveries) = {
            let mut state = self.inner.state.lock();
            if state.fail_sends > 0 {
                state.fail_sends -= 1;
                return Err(Exception::new(
                    ErrorCode::CommSendError,
                    "injected send failure",
                ));
            }
            if state.timeout_requests > 0 {
                state.timeout_requests -= 1;
                (CommEvent::Timeout, Vec::new())
            } else {
                match Request::decode(&buf) {
                    Ok(request) => {
                        let (reply, deliveries) = process(&mut state, self.id, request);
                        (CommEvent::Reply(reply.encode()), deliveries)
                    }
                    Err(_) => (
                        CommEvent::Reply(Reply::Error(ErrorCode::MalformedRequest).encode()),
                        Vec::new(),
                    ),
                }
            }
        };
        dispatch(deliveries);
        handler.handle(event);
        Ok(())
    }
}

fn dispatch(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        let Some(session) = delivery.session.upgrade() else {
            continue;
        };
        match delivery.kind {
            DeliveryKind::Event(event) => session.deliver_event(delivery.handle, event),
            DeliveryKind::Grant { generation } => {
                session.deliver_lock_granted(delivery.handle, generation)
            }
            DeliveryKind::Cancelled => session.deliver_lock_cancelled(delivery.handle),
        }
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Watchers of `path` with the event's mask bit set, minus the handle that
/// caused the event.
fn watcher_deliveries(
    state: &MasterState,
    path: &str,
    event: NamespaceEvent,
    skip_handle: Option<u64>,
) -> Vec<Delivery> {
    let mut out = Vec::new();
    for (id, open) in &state.handles {
        if open.path != path || Some(*id) == skip_handle {
            continue;
        }
        if open.event_mask & event.mask_bit() == 0 {
            continue;
        }
        let Some(client) = state.clients.get(&open.client) else {
            continue;
        };
        out.push(Delivery {
            session: client.session.clone(),
            handle: *id,
            kind: DeliveryKind::Event(event.clone()),
        });
    }
    out
}

fn grant_deliveries(state: &mut MasterState, path: &str) -> Vec<Delivery> {
    let mut granted: Vec<(u64, u32, u64)> = Vec::new();
    if let Some(node) = state.nodes.get_mut(path) {
        while let Some((handle, mode)) = node.pending.front().copied() {
            if !node.can_grant(mode) {
                break;
            }
            node.pending.pop_front();
            node.lock_mode = mode;
            node.lock_holders.insert(handle);
            node.lock_generation += 1;
            granted.push((handle, mode, node.lock_generation));
            if mode != LOCK_MODE_SHARED {
                break;
            }
        }
    }
    let mut out = Vec::new();
    for (handle, mode, generation) in granted {
        if let Some(open) = state.handles.get(&handle) {
            if let Some(client) = state.clients.get(&open.client) {
                out.push(Delivery {
                    session: client.session.clone(),
                    handle,
                    kind: DeliveryKind::Grant { generation },
                });
            }
        }
        out.extend(watcher_deliveries(
            state,
            path,
            NamespaceEvent::LockAcquired { mode },
            Some(handle),
        ));
    }
    out
}

fn release_holder(state: &mut MasterState, path: &str, handle: u64) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    let released = match state.nodes.get_mut(path) {
        Some(node) => {
            let removed = node.lock_holders.remove(&handle);
            removed && node.lock_holders.is_empty()
        }
        None => false,
    };
    if released {
        if let Some(node) = state.nodes.get_mut(path) {
            node.lock_mode = 0;
        }
        deliveries.extend(watcher_deliveries(
            state,
            path,
            NamespaceEvent::LockReleased,
            Some(handle),
        ));
        deliveries.extend(grant_deliveries(state, path));
    }
    deliveries
}

fn close_handle(state: &mut MasterState, handle: u64) -> Vec<Delivery> {
    let Some(open) = state.handles.remove(&handle) else {
        return Vec::new();
    };
    let path = open.path;
    if let Some(node) = state.nodes.get_mut(&path) {
        node.pending.retain(|(h, _)| *h != handle);
    }
    release_holder(state, &path, handle)
}

fn close_all_handles(state: &mut MasterState, client: u64) -> Vec<Delivery> {
    let ids: Vec<u64> = state
        .handles
        .iter()
        .filter(|(_, open)| open.client == client)
        .map(|(id, _)| *id)
        .collect();
    let mut deliveries = Vec::new();
    for id in ids {
        deliveries.extend(close_handle(state, id));
    }
    deliveries
}

fn has_children(state: &MasterState, path: &str) -> bool {
    let prefix = format!("{path}/");
    state
        .nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

fn process(state: &mut MasterState, client: u64, request: Request) -> (Reply, Vec<Delivery>) {
    match request {
        Request::Open {
            name,
            flags,
            event_mask,
            init_attrs,
        } => process_open(state, client, name, flags, event_mask, init_attrs),
        Request::Close { handle } => {
            let deliveries = close_handle(state, handle);
            (Reply::Empty, deliveries)
        }
        Request::Mkdir { name } => {
            if state.nodes.contains_key(&name) {
                return (Reply::Error(ErrorCode::NamespaceFileExists), Vec::new());
            }
            let Some(parent) = parent_of(&name) else {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            };
            if !state.nodes.get(parent).is_some_and(|n| n.is_dir) {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            }
            let parent = parent.to_string();
            state.nodes.insert(name.clone(), Node::new(true));
            let deliveries = watcher_deliveries(
                state,
                &parent,
                NamespaceEvent::ChildNodeAdded {
                    name: basename(&name).to_string(),
                },
                None,
            );
            (Reply::Empty, deliveries)
        }
        Request::Unlink { name } => {
            let Some(node) = state.nodes.get(&name) else {
                return (Reply::Error(ErrorCode::NamespaceFileNotFound), Vec::new());
            };
            if node.is_dir && has_children(state, &name) {
                return (Reply::Error(ErrorCode::NamespaceDirNotEmpty), Vec::new());
            }
            let mut deliveries = Vec::new();
            // Pending lock requests on the removed node are cancelled.
            if let Some(node) = state.nodes.get(&name) {
                for (handle, _) in &node.pending {
                    if let Some(open) = state.handles.get(handle) {
                        if let Some(owner) = state.clients.get(&open.client) {
                            deliveries.push(Delivery {
                                session: owner.session.clone(),
                                handle: *handle,
                                kind: DeliveryKind::Cancelled,
                            });
                        }
                    }
                }
            }
            state.nodes.remove(&name);
            if let Some(parent) = parent_of(&name).map(str::to_string) {
                deliveries.extend(watcher_deliveries(
                    state,
                    &parent,
                    NamespaceEvent::ChildNodeRemoved {
                        name: basename(&name).to_string(),
                    },
                    None,
                ));
            }
            (Reply::Empty, deliveries)
        }
        Request::Exists { name } => (
            Reply::Exists {
                exists: state.nodes.contains_key(&name),
            },
            Vec::new(),
        ),
        Request::AttrSet {
            handle,
            name,
            value,
        } => {
            let Some(path) = handle_path(state, handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            let Some(node) = state.nodes.get_mut(&path) else {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            };
            node.attrs.insert(name.clone(), value);
            let deliveries =
                watcher_deliveries(state, &path, NamespaceEvent::AttrSet { name }, Some(handle));
            (Reply::Empty, deliveries)
        }
        Request::AttrGet { handle, name } => {
            let Some(path) = handle_path(state, handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            match state.nodes.get(&path).and_then(|n| n.attrs.get(&name)) {
                Some(value) => (
                    Reply::AttrGet {
                        value: value.clone(),
                    },
                    Vec::new(),
                ),
                None => (Reply::Error(ErrorCode::NamespaceAttrNotFound), Vec::new()),
            }
        }
        Request::AttrDel { handle, name } => {
            let Some(path) = handle_path(state, handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            let Some(node) = state.nodes.get_mut(&path) else {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            };
            if node.attrs.remove(&name).is_none() {
                return (Reply::Error(ErrorCode::NamespaceAttrNotFound), Vec::new());
            }
            let deliveries =
                watcher_deliveries(state, &path, NamespaceEvent::AttrDel { name }, Some(handle));
            (Reply::Empty, deliveries)
        }
        Request::Readdir { handle } => {
            let Some(path) = handle_path(state, handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            if !state.nodes.get(&path).is_some_and(|n| n.is_dir) {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            }
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            let mut listing = Vec::new();
            for (key, node) in state.nodes.range(prefix.clone()..) {
                if !key.starts_with(&prefix) {
                    break;
                }
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    continue;
                }
                listing.push(DirEntry {
                    name: rest.to_string(),
                    is_dir: node.is_dir,
                });
            }
            (Reply::Readdir { listing }, Vec::new())
        }
        Request::Lock {
            handle,
            mode,
            try_acquire,
        } => {
            let Some(open) = state.handles.get(&handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            if open.flags & OPEN_FLAG_LOCK == 0 {
                return (Reply::Error(ErrorCode::NamespaceModeRestriction), Vec::new());
            }
            let path = open.path.clone();
            let Some(node) = state.nodes.get_mut(&path) else {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            };
            if node.can_grant(mode) {
                node.lock_mode = mode;
                node.lock_holders.insert(handle);
                node.lock_generation += 1;
                let generation = node.lock_generation;
                let deliveries = watcher_deliveries(
                    state,
                    &path,
                    NamespaceEvent::LockAcquired { mode },
                    Some(handle),
                );
                (
                    Reply::Lock {
                        status: LockStatus::Granted,
                        generation: Some(generation),
                    },
                    deliveries,
                )
            } else if try_acquire {
                (
                    Reply::Lock {
                        status: LockStatus::Busy,
                        generation: None,
                    },
                    Vec::new(),
                )
            } else {
                node.pending.push_back((handle, mode));
                (
                    Reply::Lock {
                        status: LockStatus::Pending,
                        generation: None,
                    },
                    Vec::new(),
                )
            }
        }
        Request::Release { handle } => {
            let Some(path) = handle_path(state, handle) else {
                return (Reply::Error(ErrorCode::NamespaceInvalidHandle), Vec::new());
            };
            let deliveries = release_holder(state, &path, handle);
            (Reply::Empty, deliveries)
        }
        Request::Status => (Reply::Empty, Vec::new()),
    }
}

fn handle_path(state: &MasterState, handle: u64) -> Option<String> {
    state.handles.get(&handle).map(|open| open.path.clone())
}

fn process_open(
    state: &mut MasterState,
    client: u64,
    name: String,
    flags: u32,
    event_mask: u32,
    init_attrs: Vec<Attribute>,
) -> (Reply, Vec<Delivery>) {
    let mut deliveries = Vec::new();
    let created;
    match state.nodes.get(&name) {
        Some(_) => {
            if flags & OPEN_FLAG_CREATE != 0 && flags & OPEN_FLAG_EXCL != 0 {
                return (Reply::Error(ErrorCode::NamespaceFileExists), Vec::new());
            }
            created = false;
        }
        None => {
            if flags & OPEN_FLAG_CREATE == 0 {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            }
            let Some(parent) = parent_of(&name) else {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            };
            if !state.nodes.get(parent).is_some_and(|n| n.is_dir) {
                return (Reply::Error(ErrorCode::NamespaceBadPathname), Vec::new());
            }
            let parent = parent.to_string();
            let mut node = Node::new(false);
            for attr in init_attrs {
                node.attrs.insert(attr.name, attr.value);
            }
            state.nodes.insert(name.clone(), node);
            deliveries.extend(watcher_deliveries(
                state,
                &parent,
                NamespaceEvent::ChildNodeAdded {
                    name: basename(&name).to_string(),
                },
                None,
            ));
            created = true;
        }
    }
    let handle = state.next_handle;
    state.next_handle += 1;
    let lock_generation = state
        .nodes
        .get(&name)
        .map(|n| n.lock_generation)
        .unwrap_or(0);
    state.handles.insert(
        handle,
        OpenHandle {
            path: name,
            client,
            flags,
            event_mask,
        },
    );
    (
        Reply::Open(OpenResult {
            handle,
            created,
            lock_generation,
        }),
        deliveries,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LOCK_MODE_EXCLUSIVE, OPEN_FLAG_READ, OPEN_FLAG_WRITE};
    use crate::session::SessionConfig;

    fn bound_session(ns: &LocalNamespace) -> (Arc<LocalClient>, Arc<Session>) {
        let client = ns.client();
        let session = Arc::new(Session::new(
            client.clone(),
            SessionConfig::new(ns.addr()),
            None,
        ));
        ns.bind(&client, &session);
        assert!(session.wait_for_connection(Duration::from_secs(5)));
        (client, session)
    }

    #[test]
    fn files_and_attributes_round_trip() {
        let ns = LocalNamespace::new();
        let (_client, session) = bound_session(&ns);

        session.mkdir("/dir").unwrap();
        assert!(session.exists("/dir").unwrap());
        let result = session
            .open("/dir/file", OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE, None)
            .unwrap();
        assert!(result.created);
        session.attr_set(result.handle, "k", b"v").unwrap();
        assert_eq!(session.attr_get(result.handle, "k").unwrap(), b"v");
        session.attr_del(result.handle, "k").unwrap();
        let err = session.attr_get(result.handle, "k").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NamespaceAttrNotFound);
    }

    #[test]
    fn exclusive_lock_is_single_holder() {
        let ns = LocalNamespace::new();
        let (_ca, a) = bound_session(&ns);
        let (_cb, b) = bound_session(&ns);

        let fa = a
            .open(
                "/lockfile",
                OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_CREATE | OPEN_FLAG_LOCK,
                None,
            )
            .unwrap();
        let fb = b
            .open("/lockfile", OPEN_FLAG_READ | OPEN_FLAG_WRITE | OPEN_FLAG_LOCK, None)
            .unwrap();

        let (status, seq) = a.try_lock(fa.handle, LOCK_MODE_EXCLUSIVE).unwrap();
        assert_eq!(status, LockStatus::Granted);
        assert!(seq.unwrap().generation > 0);

        let (status, seq) = b.try_lock(fb.handle, LOCK_MODE_EXCLUSIVE).unwrap();
        assert_eq!(status, LockStatus::Busy);
        assert!(seq.is_none());
    }

    #[test]
    fn unlink_of_missing_file_reports_not_found() {
        let ns = LocalNamespace::new();
        let (_client, session) = bound_session(&ns);
        let err = session.unlink("/nothing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NamespaceFileNotFound);
    }
}
