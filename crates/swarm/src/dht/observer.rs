use crate::dht::traversal::Traversal;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use swarm_krpc::Response;
use tokio::time::Instant;

/// Which request a traversal observer stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverRole {
    FindNode,
    GetPeers,
    Announce,
}

/// How an outstanding request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The node is slow; the request is still outstanding.
    ShortTimeout,
    Timeout,
    /// Shutdown: the algorithm must not issue further requests.
    PreventRequest,
}

/// The algorithm half of an observer: a tagged variant dispatched by
/// `match`, not a class hierarchy. `Null` observers belong to fire-and-
/// forget requests (e.g. lone pings).
pub enum ObserverKind {
    Traversal { algorithm: Arc<Mutex<Traversal>>, role: ObserverRole },
    Null,
}

/// Record of one outstanding DHT request. Owned by the RPC manager's
/// outstanding list; every callback is fired at most once (`done` /
/// `short_timeout` flags).
pub struct Observer {
    kind: ObserverKind,
    transaction_id: u16,
    target: SocketAddr,
    sent: Instant,
    done: bool,
    short_timeout_fired: bool,
    was_sent: bool,
}

impl Observer {
    pub fn new(kind: ObserverKind) -> Self {
        Self {
            kind,
            transaction_id: 0,
            target: "0.0.0.0:0".parse().expect("literal addr"),
            sent: Instant::now(),
            done: false,
            short_timeout_fired: false,
            was_sent: false,
        }
    }

    pub fn set_target(&mut self, ep: SocketAddr) {
        self.sent = Instant::now();
        self.target = ep;
    }

    pub fn set_transaction_id(&mut self, tid: u16) {
        self.transaction_id = tid;
    }

    pub fn mark_sent(&mut self) {
        self.was_sent = true;
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn target_ep(&self) -> SocketAddr {
        self.target
    }

    pub fn sent(&self) -> Instant {
        self.sent
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn was_sent(&self) -> bool {
        self.was_sent
    }

    pub fn has_short_timeout(&self) -> bool {
        self.short_timeout_fired
    }

    /// A matching reply arrived from the target.
    pub fn reply(&mut self, response: &Response, from: SocketAddr) {
        if self.done {
            return;
        }
        self.done = true;
        match &self.kind {
            ObserverKind::Traversal { algorithm, role } => {
                algorithm.lock().on_reply(*role, from, response);
            }
            ObserverKind::Null => {}
        }
    }

    /// No reply within the long timeout; the request is dead.
    pub fn timeout(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match &self.kind {
            ObserverKind::Traversal { algorithm, role } => {
                algorithm.lock().failed(*role, self.target, Failure::Timeout);
            }
            ObserverKind::Null => {}
        }
    }

    /// The node is slower than the short timeout; fired once, the request
    /// stays outstanding.
    pub fn short_timeout(&mut self) {
        if self.short_timeout_fired {
            return;
        }
        self.short_timeout_fired = true;
        match &self.kind {
            ObserverKind::Traversal { algorithm, role } => {
                algorithm.lock().failed(*role, self.target, Failure::ShortTimeout);
            }
            ObserverKind::Null => {}
        }
    }

    /// Shutdown; the issuing algorithm must stop requesting.
    pub fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match &self.kind {
            ObserverKind::Traversal { algorithm, role } => {
                algorithm.lock().failed(*role, self.target, Failure::PreventRequest);
            }
            ObserverKind::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::traversal::TraversalKind;

    fn traversal_observer() -> (Observer, Arc<Mutex<Traversal>>) {
        let t = Arc::new(Mutex::new(Traversal::new([0u8; 20], TraversalKind::FindNode, None)));
        let obs = Observer::new(ObserverKind::Traversal {
            algorithm: t.clone(),
            role: ObserverRole::FindNode,
        });
        (obs, t)
    }

    #[test]
    fn done_is_fired_at_most_once() {
        let (mut obs, t) = traversal_observer();
        obs.set_target("10.0.0.1:1".parse().unwrap());
        obs.timeout();
        obs.timeout();
        obs.reply(&Response::default(), "10.0.0.1:1".parse().unwrap());
        assert!(obs.is_done());
        assert_eq!(t.lock().num_timeouts(), 1);
        assert_eq!(t.lock().num_responses(), 0);
    }

    #[test]
    fn short_timeout_fires_once_and_keeps_request_alive() {
        let (mut obs, t) = traversal_observer();
        obs.set_target("10.0.0.1:1".parse().unwrap());
        obs.short_timeout();
        obs.short_timeout();
        assert!(!obs.is_done());
        assert_eq!(t.lock().num_short_timeouts(), 1);
    }
}
