//! Leased client session against the namespace master.
//!
//! The session multiplexes every file, attribute, and lock operation over
//! one request/reply channel and survives transient disconnections. Each
//! operation runs the same bounded state machine: wait until the session
//! is safe, submit, await the reply, classify the outcome. A submission
//! failure or a request timeout drops the session into jeopardy and the
//! operation retries without bound; only session expiry cancels it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ht_core::{ErrorCode, Exception, Result};
use parking_lot::{Condvar, Mutex};

use crate::handle::{
    ClientHandleState, HandleCallback, HandleRegistry, LockSequencer, NamespaceEvent,
};
use crate::protocol::{
    Attribute, DirEntry, LockStatus, OpenResult, Reply, Request, LOCK_MODE_EXCLUSIVE,
    LOCK_MODE_SHARED, OPEN_FLAG_CREATE, OPEN_FLAG_EXCL, OPEN_FLAG_LOCK_EXCLUSIVE,
    OPEN_FLAG_LOCK_SHARED, OP_ATTR_DEL, OP_ATTR_GET, OP_ATTR_SET, OP_CLOSE, OP_EXISTS, OP_LOCK,
    OP_MKDIR, OP_OPEN, OP_READDIR, OP_RELEASE, OP_STATUS, OP_UNLINK,
};
use crate::transport::{CommEvent, ReplySynchronizer, Transport};

/// Connection state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Keepalive is receiving valid responses.
    Safe,
    /// No reliable contact with the namespace master; the grace period is
    /// running.
    Jeopardy,
    /// The grace period elapsed or the master declared the session dead.
    /// Terminal.
    Expired,
}

/// User notifications for session state changes.
pub trait SessionCallback: Send + Sync {
    fn safe(&self) {}
    fn jeopardy(&self) {}
    fn expired(&self) {}
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub master_addr: SocketAddr,
    /// Nominal keepalive period.
    pub lease_interval: Duration,
    /// Time from loss of contact to session expiry.
    pub grace_period: Duration,
    /// Per-request submission timeout; defaults to `2 * lease_interval`.
    pub client_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(master_addr: SocketAddr) -> Self {
        Self {
            master_addr,
            lease_interval: Duration::from_secs(20),
            grace_period: Duration::from_secs(60),
            client_timeout: None,
        }
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout.unwrap_or(self.lease_interval * 2)
    }
}

struct StateData {
    state: SessionState,
    expire_time: Instant,
}

pub struct Session {
    comm: Arc<dyn Transport>,
    master_addr: SocketAddr,
    timeout: Duration,
    grace_period: Duration,
    state: Mutex<StateData>,
    state_cond: Condvar,
    callback: Option<Box<dyn SessionCallback>>,
    handles: HandleRegistry,
}

impl Session {
    /// A new session starts in jeopardy; the keepalive channel transitions
    /// it to safe once the master answers.
    pub fn new(
        comm: Arc<dyn Transport>,
        config: SessionConfig,
        callback: Option<Box<dyn SessionCallback>>,
    ) -> Self {
        Self {
            comm,
            master_addr: config.master_addr,
            timeout: config.client_timeout(),
            grace_period: config.grace_period,
            state: Mutex::new(StateData {
                state: SessionState::Jeopardy,
                expire_time: Instant::now() + config.grace_period,
            }),
            state_cond: Condvar::new(),
            callback,
            handles: HandleRegistry::new(),
        }
    }

    pub fn master_addr(&self) -> SocketAddr {
        self.master_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().state
    }

    /// Move the session to `new_state`, waking waiters and firing the user
    /// callback on the edges that matter. Returns the previous state.
    ///
    /// Driven by the keepalive channel and by operation threads that fail
    /// to submit.
    pub fn state_transition(&self, new_state: SessionState) -> SessionState {
        let old_state;
        {
            let mut state = self.state.lock();
            old_state = state.state;
            state.state = new_state;
            match new_state {
                SessionState::Safe | SessionState::Expired => {
                    self.state_cond.notify_all();
                }
                SessionState::Jeopardy => {
                    if old_state == SessionState::Safe {
                        state.expire_time = Instant::now() + self.grace_period;
                    }
                }
            }
        }
        if let Some(callback) = &self.callback {
            match new_state {
                SessionState::Safe if old_state == SessionState::Jeopardy => callback.safe(),
                SessionState::Jeopardy if old_state == SessionState::Safe => callback.jeopardy(),
                SessionState::Expired if old_state != SessionState::Expired => callback.expired(),
                _ => {}
            }
        }
        old_state
    }

    /// True once the grace period has elapsed without recovery.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.state.lock().expire_time
    }

    /// Push the expiry deadline out by one grace period. Called by the
    /// keepalive channel on every valid master response.
    pub fn renew_expiration(&self) {
        self.state.lock().expire_time = Instant::now() + self.grace_period;
    }

    /// Block until the session is safe; `false` means it expired instead.
    pub fn wait_for_safe(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match state.state {
                SessionState::Safe => return true,
                SessionState::Expired => return false,
                SessionState::Jeopardy => self.state_cond.wait(&mut state),
            }
        }
    }

    /// Block until the session is safe, giving up after `max_wait`.
    pub fn wait_for_connection(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        let mut state = self.state.lock();
        while state.state != SessionState::Safe {
            if self
                .state_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.state == SessionState::Safe;
            }
        }
        true
    }

    pub fn open(
        &self,
        name: &str,
        flags: u32,
        callback: Option<Arc<dyn HandleCallback>>,
    ) -> Result<OpenResult> {
        let handle_state = Arc::new(ClientHandleState::new(normalize_name(name), flags, callback));
        let request = Request::Open {
            name: handle_state.normal_name().to_string(),
            flags,
            event_mask: handle_state.event_mask(),
            init_attrs: Vec::new(),
        };
        self.open_handle(handle_state, request)
    }

    /// `open` with `CREATE|EXCL` and initial attributes written atomically
    /// with the file.
    pub fn create(
        &self,
        name: &str,
        flags: u32,
        callback: Option<Arc<dyn HandleCallback>>,
        init_attrs: Vec<Attribute>,
    ) -> Result<OpenResult> {
        let flags = flags | OPEN_FLAG_CREATE | OPEN_FLAG_EXCL;
        let handle_state = Arc::new(ClientHandleState::new(normalize_name(name), flags, callback));
        let request = Request::Open {
            name: handle_state.normal_name().to_string(),
            flags,
            event_mask: handle_state.event_mask(),
            init_attrs,
        };
        self.open_handle(handle_state, request)
    }

    fn open_handle(
        &self,
        handle_state: Arc<ClientHandleState>,
        request: Request,
    ) -> Result<OpenResult> {
        {
            let mut lock_state = handle_state.lock_state();
            lock_state.lock_mode = if handle_state.open_flags() & OPEN_FLAG_LOCK_SHARED != 0 {
                LOCK_MODE_SHARED
            } else if handle_state.open_flags() & OPEN_FLAG_LOCK_EXCLUSIVE != 0 {
                LOCK_MODE_EXCLUSIVE
            } else {
                0
            };
            lock_state.lock_status = None;
            lock_state.lock_generation = 0;
            lock_state.sequencer = None;
        }
        let buf = request.encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_OPEN)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "namespace 'open' error, name={} flags=0x{:x} events=0x{:x}",
                        handle_state.normal_name(),
                        handle_state.open_flags(),
                        handle_state.event_mask()
                    ),
                )),
                Reply::Open(result) => {
                    handle_state.set_handle(result.handle);
                    handle_state.lock_state().lock_generation = result.lock_generation;
                    self.handles.register(handle_state.clone());
                    Ok(result)
                }
                _ => Err(unexpected_reply("open")),
            };
        }
    }

    pub fn close(&self, handle: u64) -> Result<()> {
        let buf = Request::Close { handle }.encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_CLOSE)? {
                Reply::Error(code) => {
                    Err(Exception::new(code, "namespace 'close' error".to_string()))
                }
                _ => {
                    self.handles.unregister(handle);
                    Ok(())
                }
            };
        }
    }

    pub fn mkdir(&self, name: &str) -> Result<()> {
        let normal_name = normalize_name(name);
        let buf = Request::Mkdir {
            name: normal_name.clone(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_MKDIR)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!("namespace 'mkdir' error, name={normal_name}"),
                )),
                _ => Ok(()),
            };
        }
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        let normal_name = normalize_name(name);
        let buf = Request::Unlink {
            name: normal_name.clone(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_UNLINK)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!("namespace 'unlink' error, name={normal_name}"),
                )),
                _ => Ok(()),
            };
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let normal_name = normalize_name(name);
        let buf = Request::Exists {
            name: normal_name.clone(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_EXISTS)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!("namespace 'exists' error, name={normal_name}"),
                )),
                Reply::Exists { exists } => Ok(exists),
                _ => Err(unexpected_reply("exists")),
            };
        }
    }

    pub fn attr_set(&self, handle: u64, name: &str, value: &[u8]) -> Result<()> {
        let buf = Request::AttrSet {
            handle,
            name: name.to_string(),
            value: value.to_vec(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_ATTR_SET)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "problem setting attribute '{name}' of namespace file '{}'",
                        self.handle_name(handle)
                    ),
                )),
                _ => Ok(()),
            };
        }
    }

    pub fn attr_get(&self, handle: u64, name: &str) -> Result<Vec<u8>> {
        let buf = Request::AttrGet {
            handle,
            name: name.to_string(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_ATTR_GET)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "problem getting attribute '{name}' of namespace file '{}'",
                        self.handle_name(handle)
                    ),
                )),
                Reply::AttrGet { value } => Ok(value),
                _ => Err(unexpected_reply("attr_get")),
            };
        }
    }

    pub fn attr_del(&self, handle: u64, name: &str) -> Result<()> {
        let buf = Request::AttrDel {
            handle,
            name: name.to_string(),
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_ATTR_DEL)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "problem deleting attribute '{name}' of namespace file '{}'",
                        self.handle_name(handle)
                    ),
                )),
                _ => Ok(()),
            };
        }
    }

    pub fn readdir(&self, handle: u64) -> Result<Vec<DirEntry>> {
        let buf = Request::Readdir { handle }.encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_READDIR)? {
                Reply::Error(code) => {
                    Err(Exception::new(code, "namespace 'readdir' error".to_string()))
                }
                Reply::Readdir { listing } => Ok(listing),
                _ => Err(unexpected_reply("readdir")),
            };
        }
    }

    /// Acquire an advisory lock, blocking while the grant is pending.
    ///
    /// A pending grant arrives through the keepalive channel and wakes the
    /// per-handle condvar; a server-side cancellation fails the call with
    /// `NamespaceRequestCancelled`.
    pub fn lock(&self, handle: u64, mode: u32) -> Result<LockSequencer> {
        let handle_state = self.handle_state(handle)?;
        if handle_state.lock_state().lock_status.is_some() {
            return Err(Exception::new(
                ErrorCode::NamespaceAlreadyLocked,
                format!("lock already held on '{}'", handle_state.normal_name()),
            ));
        }
        let buf = Request::Lock {
            handle,
            mode,
            try_acquire: false,
        }
        .encode();
        loop {
            {
                let mut lock_state = handle_state.lock_state();
                lock_state.sequencer = Some(LockSequencer {
                    name: handle_state.normal_name().to_string(),
                    mode,
                    generation: 0,
                });
            }
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_LOCK)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "namespace 'lock' error, name='{}'",
                        handle_state.normal_name()
                    ),
                )),
                Reply::Lock { status, generation } => {
                    let mut lock_state = handle_state.lock_state();
                    lock_state.lock_mode = mode;
                    match status {
                        LockStatus::Granted => {
                            let generation = generation.unwrap_or(0);
                            lock_state.lock_generation = generation;
                            lock_state.lock_status = Some(LockStatus::Granted);
                            let mut sequencer = lock_state.sequencer.take().unwrap_or_else(|| {
                                LockSequencer {
                                    name: handle_state.normal_name().to_string(),
                                    mode,
                                    generation,
                                }
                            });
                            sequencer.generation = generation;
                            Ok(sequencer)
                        }
                        LockStatus::Pending => {
                            // A keepalive-delivered grant or cancellation may
                            // have landed before this reply was processed.
                            if lock_state.lock_status.is_none() {
                                lock_state.lock_status = Some(LockStatus::Pending);
                            }
                            while lock_state.lock_status == Some(LockStatus::Pending) {
                                handle_state.wait_lock_state(&mut lock_state);
                            }
                            if lock_state.lock_status == Some(LockStatus::Cancelled) {
                                return Err(Exception::new(
                                    ErrorCode::NamespaceRequestCancelled,
                                    format!(
                                        "lock request cancelled for '{}'",
                                        handle_state.normal_name()
                                    ),
                                ));
                            }
                            let generation = lock_state.lock_generation;
                            let mut sequencer = lock_state.sequencer.take().unwrap_or_else(|| {
                                LockSequencer {
                                    name: handle_state.normal_name().to_string(),
                                    mode,
                                    generation,
                                }
                            });
                            sequencer.generation = generation;
                            Ok(sequencer)
                        }
                        other => Err(Exception::new(
                            ErrorCode::ProtocolError,
                            format!("unexpected lock status {other:?} in lock reply"),
                        )),
                    }
                }
                _ => Err(unexpected_reply("lock")),
            };
        }
    }

    /// Non-blocking lock attempt; never returns `Pending`.
    pub fn try_lock(&self, handle: u64, mode: u32) -> Result<(LockStatus, Option<LockSequencer>)> {
        let handle_state = self.handle_state(handle)?;
        if handle_state.lock_state().lock_status.is_some() {
            return Err(Exception::new(
                ErrorCode::NamespaceAlreadyLocked,
                format!("lock already held on '{}'", handle_state.normal_name()),
            ));
        }
        let buf = Request::Lock {
            handle,
            mode,
            try_acquire: true,
        }
        .encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_LOCK)? {
                Reply::Error(code) => Err(Exception::new(
                    code,
                    format!(
                        "namespace 'try_lock' error, name='{}'",
                        handle_state.normal_name()
                    ),
                )),
                Reply::Lock { status, generation } => {
                    if status == LockStatus::Granted {
                        let generation = generation.unwrap_or(0);
                        let sequencer = LockSequencer {
                            name: handle_state.normal_name().to_string(),
                            mode,
                            generation,
                        };
                        let mut lock_state = handle_state.lock_state();
                        lock_state.lock_mode = mode;
                        lock_state.lock_status = Some(LockStatus::Granted);
                        lock_state.lock_generation = generation;
                        lock_state.sequencer = None;
                        Ok((status, Some(sequencer)))
                    } else {
                        Ok((status, None))
                    }
                }
                _ => Err(unexpected_reply("try_lock")),
            };
        }
    }

    pub fn release(&self, handle: u64) -> Result<()> {
        let handle_state = self.handle_state(handle)?;
        let buf = Request::Release { handle }.encode();
        loop {
            let Some(payload) = self.roundtrip(&buf)? else {
                continue;
            };
            return match Reply::decode(&payload, OP_RELEASE)? {
                Reply::Error(code) => {
                    Err(Exception::new(code, "namespace 'release' error".to_string()))
                }
                _ => {
                    handle_state.lock_state().lock_status = None;
                    handle_state.notify_lock_waiters();
                    Ok(())
                }
            };
        }
    }

    /// Local-only: mirror the current lock authority for `handle`.
    pub fn get_sequencer(&self, handle: u64) -> Result<LockSequencer> {
        let handle_state = self.handle_state(handle)?;
        let lock_state = handle_state.lock_state();
        if lock_state.lock_generation == 0 {
            return Err(Exception::new(
                ErrorCode::NamespaceNotLocked,
                format!("no lock generation for '{}'", handle_state.normal_name()),
            ));
        }
        Ok(LockSequencer {
            name: handle_state.normal_name().to_string(),
            mode: lock_state.lock_mode,
            generation: lock_state.lock_generation,
        })
    }

    /// Verifying a sequencer against the master is not implemented; the
    /// semantics are still undefined, so fail loudly rather than guess.
    pub fn check_sequencer(&self, _sequencer: &LockSequencer) -> Result<()> {
        tracing::warn!("check_sequencer is not implemented");
        Err(Exception::new(
            ErrorCode::FailedExpectation,
            "check_sequencer is not implemented",
        ))
    }

    /// Single-shot status probe; does not run the retry loop.
    pub fn status(&self) -> Result<()> {
        let buf = Request::Status.encode();
        let sync = Arc::new(ReplySynchronizer::new());
        self.send_message(buf, sync.clone())?;
        match sync.wait_for_reply() {
            CommEvent::Reply(payload) => match Reply::decode(&payload, OP_STATUS)? {
                Reply::Error(code) => {
                    Err(Exception::new(code, "namespace 'status' error".to_string()))
                }
                _ => Ok(()),
            },
            CommEvent::Timeout => Err(Exception::new(
                ErrorCode::RequestTimeout,
                "namespace 'status' request timed out",
            )),
            CommEvent::Error(code) => {
                Err(Exception::new(code, "namespace 'status' error".to_string()))
            }
        }
    }

    // --- keepalive delivery surface -------------------------------------

    /// Deliver an asynchronous lock grant for a pending request.
    pub fn deliver_lock_granted(&self, handle: u64, generation: u64) {
        let Some(handle_state) = self.handles.get(handle) else {
            return;
        };
        {
            let mut lock_state = handle_state.lock_state();
            lock_state.lock_generation = generation;
            lock_state.lock_status = Some(LockStatus::Granted);
            if let Some(sequencer) = &mut lock_state.sequencer {
                sequencer.generation = generation;
            }
        }
        handle_state.notify_lock_waiters();
    }

    /// Deliver a server-side cancellation of a pending lock request.
    pub fn deliver_lock_cancelled(&self, handle: u64) {
        let Some(handle_state) = self.handles.get(handle) else {
            return;
        };
        {
            let mut lock_state = handle_state.lock_state();
            if lock_state.lock_status == Some(LockStatus::Pending) {
                lock_state.lock_status = Some(LockStatus::Cancelled);
            }
        }
        handle_state.notify_lock_waiters();
    }

    /// Deliver a change notification for a watched handle.
    pub fn deliver_event(&self, handle: u64, event: NamespaceEvent) {
        if let Some(handle_state) = self.handles.get(handle) {
            handle_state.deliver(&event);
        }
    }

    // --- internals ------------------------------------------------------

    fn handle_state(&self, handle: u64) -> Result<Arc<ClientHandleState>> {
        self.handles.get(handle).ok_or_else(|| {
            Exception::new(
                ErrorCode::NamespaceInvalidHandle,
                format!("unknown namespace handle {handle}"),
            )
        })
    }

    fn handle_name(&self, handle: u64) -> String {
        self.handles
            .get(handle)
            .map(|state| state.normal_name().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    /// One acquire-safe/submit/await round. `Ok(None)` means the session
    /// dropped to jeopardy and the caller must retry.
    fn roundtrip(&self, buf: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.wait_for_safe() {
            return Err(Exception::new(
                ErrorCode::NamespaceExpiredSession,
                "session has expired",
            ));
        }
        let sync = Arc::new(ReplySynchronizer::new());
        if self.send_message(buf.to_vec(), sync.clone()).is_err() {
            self.state_transition(SessionState::Jeopardy);
            return Ok(None);
        }
        match sync.wait_for_reply() {
            CommEvent::Reply(payload) => Ok(Some(payload)),
            CommEvent::Timeout => {
                self.state_transition(SessionState::Jeopardy);
                Ok(None)
            }
            CommEvent::Error(code)
                if code == ErrorCode::CommRequestTimeout || code == ErrorCode::RequestTimeout =>
            {
                self.state_transition(SessionState::Jeopardy);
                Ok(None)
            }
            CommEvent::Error(code) => Err(Exception::new(
                code,
                "namespace request failed in transport",
            )),
        }
    }

    fn send_message(
        &self,
        buf: Vec<u8>,
        handler: Arc<dyn crate::transport::DispatchHandler>,
    ) -> Result<()> {
        self.comm
            .send_request(self.master_addr, self.timeout, buf, handler)
            .map_err(|error| {
                tracing::warn!(
                    master_addr = %self.master_addr,
                    error = %error,
                    "request submission to namespace master failed"
                );
                error
            })
    }
}

fn unexpected_reply(operation: &str) -> Exception {
    Exception::new(
        ErrorCode::ProtocolError,
        format!("unexpected reply payload for '{operation}'"),
    )
}

/// Canonicalize a user path: `/` is preserved, a leading `/` is ensured,
/// and a single trailing `/` is stripped. Nothing else is rewritten.
pub fn normalize_name(name: &str) -> String {
    if name == "/" {
        return name.to_string();
    }
    let mut normal = String::with_capacity(name.len() + 1);
    if !name.starts_with('/') {
        normal.push('/');
    }
    match name.strip_suffix('/') {
        Some(stripped) => normal.push_str(stripped),
        None => normal.push_str(name),
    }
    normal
}
