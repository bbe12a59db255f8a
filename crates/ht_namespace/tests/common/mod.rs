//! Shared helpers for namespace client integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use ht_namespace::session::{Session, SessionCallback, SessionConfig, SessionState};
use ht_namespace::testing::{LocalClient, LocalNamespace};
use parking_lot::Mutex;

/// Records session state-change notifications in arrival order.
#[derive(Default)]
pub struct StateLog {
    events: Mutex<Vec<&'static str>>,
}

impl StateLog {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

struct StateLogCallback(Arc<StateLog>);

impl SessionCallback for StateLogCallback {
    fn safe(&self) {
        self.0.events.lock().push("safe");
    }
    fn jeopardy(&self) {
        self.0.events.lock().push("jeopardy");
    }
    fn expired(&self) {
        self.0.events.lock().push("expired");
    }
}

/// Build a session bound to `ns` and wait for it to become safe.
pub fn connected_session(ns: &LocalNamespace) -> (Arc<LocalClient>, Arc<Session>, Arc<StateLog>) {
    let log = Arc::new(StateLog::default());
    let client = ns.client();
    let session = Arc::new(Session::new(
        client.clone(),
        SessionConfig::new(ns.addr()),
        Some(Box::new(StateLogCallback(log.clone()))),
    ));
    ns.bind(&client, &session);
    assert!(
        session.wait_for_connection(Duration::from_secs(5)),
        "session never became safe"
    );
    (client, session, log)
}

/// Poll until `predicate` holds or the deadline passes.
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

pub fn assert_expired(session: &Session) {
    assert!(
        wait_until(Duration::from_secs(5), || session.state()
            == SessionState::Expired),
        "session never expired"
    );
}
