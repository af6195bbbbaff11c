use crate::dht::observer::{Failure, ObserverRole};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use swarm_krpc::{Query, Response};
use tracing::debug;

/// How many requests a traversal keeps in flight.
const BRANCH_FACTOR: usize = 8;
/// Hard cap on requests a single traversal may issue.
const INVOKE_BUDGET: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalKind {
    /// Iterative find-node walk (bootstrap, refresh).
    FindNode,
    /// get_peers walk; announces afterwards when a port is set.
    GetPeers,
}

/// An iterative DHT walk. The RPC manager drives it through the observer
/// callbacks; new requests accumulate in `pending` and are drained by the
/// node between RPC events (invoking from inside a callback would re-enter
/// the outstanding-transactions list).
pub struct Traversal {
    target: [u8; 20],
    kind: TraversalKind,
    announce_port: Option<u16>,
    queue: VecDeque<SocketAddr>,
    seen: HashSet<SocketAddr>,
    tokens: HashMap<SocketAddr, Vec<u8>>,
    peers: Vec<SocketAddr>,
    pending: Vec<(Query, SocketAddr, ObserverRole)>,
    in_flight: usize,
    invoked: usize,
    announced: bool,
    done: bool,

    num_responses: usize,
    num_short_timeouts: usize,
    num_timeouts: usize,
    num_aborted: usize,

    on_peers: Option<Box<dyn FnMut(&[SocketAddr]) + Send>>,
}

impl Traversal {
    pub fn new(target: [u8; 20], kind: TraversalKind, announce_port: Option<u16>) -> Self {
        Self {
            target,
            kind,
            announce_port,
            queue: VecDeque::new(),
            seen: HashSet::new(),
            tokens: HashMap::new(),
            peers: Vec::new(),
            pending: Vec::new(),
            in_flight: 0,
            invoked: 0,
            announced: false,
            done: false,
            num_responses: 0,
            num_short_timeouts: 0,
            num_timeouts: 0,
            num_aborted: 0,
            on_peers: None,
        }
    }

    pub fn set_on_peers(&mut self, f: impl FnMut(&[SocketAddr]) + Send + 'static) {
        self.on_peers = Some(Box::new(f));
    }

    pub fn target(&self) -> &[u8; 20] {
        &self.target
    }

    /// Seed the walk and queue the first batch of requests.
    pub fn start(&mut self, nodes: impl IntoIterator<Item = SocketAddr>) {
        for n in nodes {
            self.add_node(n);
        }
        self.fill();
    }

    fn add_node(&mut self, addr: SocketAddr) {
        if self.seen.insert(addr) {
            self.queue.push_back(addr);
        }
    }

    fn query(&self) -> (Query, ObserverRole) {
        match self.kind {
            TraversalKind::FindNode => {
                (Query::FindNode { target: self.target }, ObserverRole::FindNode)
            }
            TraversalKind::GetPeers => {
                (Query::GetPeers { info_hash: self.target }, ObserverRole::GetPeers)
            }
        }
    }

    fn fill(&mut self) {
        while self.in_flight < BRANCH_FACTOR && self.invoked < INVOKE_BUDGET {
            let next = match self.queue.pop_front() {
                Some(n) => n,
                None => break,
            };
            let (q, role) = self.query();
            self.pending.push((q, next, role));
            self.in_flight += 1;
            self.invoked += 1;
        }
        if self.in_flight == 0 && self.queue.is_empty() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        if self.kind == TraversalKind::GetPeers && !self.announced {
            self.announced = true;
            if let Some(port) = self.announce_port {
                if !self.tokens.is_empty() {
                    // announce to every node that handed us a write token
                    let tokens: Vec<_> = self.tokens.drain().collect();
                    for (addr, token) in tokens {
                        self.pending.push((
                            Query::AnnouncePeer { info_hash: self.target, port, token },
                            addr,
                            ObserverRole::Announce,
                        ));
                        self.in_flight += 1;
                    }
                    return;
                }
            }
        }
        debug!(
            target = %hex::encode(self.target),
            responses = self.num_responses,
            timeouts = self.num_timeouts,
            peers = self.peers.len(),
            "traversal finished"
        );
        self.done = true;
    }

    /// Requests queued since the last drain, ready for `RpcManager::invoke`.
    pub fn take_pending(&mut self) -> Vec<(Query, SocketAddr, ObserverRole)> {
        std::mem::take(&mut self.pending)
    }

    /// A request we issued was answered.
    pub fn on_reply(&mut self, role: ObserverRole, from: SocketAddr, response: &Response) {
        self.num_responses += 1;
        self.in_flight = self.in_flight.saturating_sub(1);

        if role != ObserverRole::Announce {
            for node in response.nodes.iter() {
                self.add_node(node.addr);
            }
            if !response.values.is_empty() {
                if let Some(cb) = self.on_peers.as_mut() {
                    cb(&response.values);
                }
                self.peers.extend_from_slice(&response.values);
            }
            if let Some(token) = response.token.as_ref() {
                self.tokens.insert(from, token.clone());
            }
        }
        self.fill();
    }

    /// A request we issued failed.
    pub fn failed(&mut self, _role: ObserverRole, ep: SocketAddr, failure: Failure) {
        match failure {
            Failure::ShortTimeout => {
                // the node is slow but the request stays outstanding
                self.num_short_timeouts += 1;
            }
            Failure::Timeout => {
                debug!(node = %ep, "traversal node timed out");
                self.num_timeouts += 1;
                self.in_flight = self.in_flight.saturating_sub(1);
                self.fill();
            }
            Failure::PreventRequest => {
                // shutdown: stop issuing requests
                self.num_aborted += 1;
                self.in_flight = self.in_flight.saturating_sub(1);
                self.done = true;
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }

    pub fn num_responses(&self) -> usize {
        self.num_responses
    }

    pub fn num_short_timeouts(&self) -> usize {
        self.num_short_timeouts
    }

    pub fn num_timeouts(&self) -> usize {
        self.num_timeouts
    }

    pub fn num_aborted(&self) -> usize {
        self.num_aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{i}:6881").parse().unwrap()
    }

    #[test]
    fn start_queues_initial_batch() {
        let mut t = Traversal::new([1u8; 20], TraversalKind::FindNode, None);
        t.start((1..=12).map(addr));
        let pending = t.take_pending();
        assert_eq!(pending.len(), 8);
        assert!(matches!(pending[0].0, Query::FindNode { .. }));
    }

    #[test]
    fn reply_with_nodes_extends_walk() {
        let mut t = Traversal::new([1u8; 20], TraversalKind::GetPeers, None);
        t.start([addr(1)]);
        t.take_pending();
        let mut resp = Response::default();
        resp.nodes = vec![swarm_krpc::NodeEntry { id: [2u8; 20], addr: addr(2) }];
        t.on_reply(ObserverRole::GetPeers, addr(1), &resp);
        let pending = t.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, addr(2));
        assert!(!t.is_done());
    }

    #[test]
    fn duplicate_nodes_not_requeried() {
        let mut t = Traversal::new([1u8; 20], TraversalKind::FindNode, None);
        t.start([addr(1)]);
        t.take_pending();
        let mut resp = Response::default();
        resp.nodes = vec![swarm_krpc::NodeEntry { id: [9u8; 20], addr: addr(1) }];
        t.on_reply(ObserverRole::FindNode, addr(1), &resp);
        assert!(t.take_pending().is_empty());
        assert!(t.is_done());
    }

    #[test]
    fn get_peers_announces_with_tokens() {
        let mut t = Traversal::new([1u8; 20], TraversalKind::GetPeers, Some(6881));
        t.start([addr(1)]);
        t.take_pending();
        let mut resp = Response::default();
        resp.token = Some(b"tok".to_vec());
        resp.values = vec![addr(7)];
        t.on_reply(ObserverRole::GetPeers, addr(1), &resp);
        let pending = t.take_pending();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].0, Query::AnnouncePeer { port: 6881, .. }));
        assert!(!t.is_done());
        // the announce completing ends the traversal
        t.on_reply(ObserverRole::Announce, addr(1), &Response::default());
        assert!(t.is_done());
        assert_eq!(t.peers(), &[addr(7)]);
    }

    #[test]
    fn abort_stops_refilling() {
        let mut t = Traversal::new([1u8; 20], TraversalKind::FindNode, None);
        t.start((1..=12).map(addr));
        t.take_pending();
        t.failed(ObserverRole::FindNode, addr(1), Failure::PreventRequest);
        assert!(t.is_done());
        assert!(t.take_pending().is_empty());
        assert_eq!(t.num_aborted(), 1);
    }
}
