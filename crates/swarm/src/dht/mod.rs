pub mod observer;
pub mod routing;
pub mod rpc;
pub mod traversal;

use crate::alert::{Alert, AlertQueue};
use crate::clock::SessionRng;
use crate::InfoHash;
use observer::{Observer, ObserverKind};
use parking_lot::Mutex;
use routing::RoutingTable;
use rpc::{RpcManager, SendFn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use swarm_krpc::{encode_error, encode_reply, parse_message, MessageKind, NODE_ID_LEN};
use traversal::{Traversal, TraversalKind};
use tracing::{debug, info};

const METHOD_UNKNOWN: i64 = 204;

/// The DHT node: routing table, RPC transaction manager, and the set of
/// running traversals. The UDP socket is owned by the session's listen set
/// and demultiplexed here.
pub struct Dht {
    node_id: [u8; NODE_ID_LEN],
    table: RoutingTable,
    rpc: RpcManager,
    send: SendFn,
    traversals: Vec<Arc<Mutex<Traversal>>>,
    bootstrap: Option<Arc<Mutex<Traversal>>>,
    bytes_sent: Arc<AtomicI64>,
    bytes_received: i64,
    aborted: bool,
}

impl Dht {
    /// `send` transmits one datagram on the session's UDP socket.
    pub fn new(node_id: [u8; NODE_ID_LEN], send: SendFn, rng: &mut SessionRng) -> Self {
        let bytes_sent = Arc::new(AtomicI64::new(0));
        let counter = bytes_sent.clone();
        let raw_send = send.clone();
        let counting_send: SendFn = Arc::new(move |data: &[u8], to: SocketAddr| {
            counter.fetch_add(data.len() as i64, Relaxed);
            raw_send(data, to)
        });
        let initial_tid = (rng.next_u32() & 0xffff) as u16;
        Self {
            node_id,
            table: RoutingTable::new(node_id),
            rpc: RpcManager::new(node_id, counting_send.clone(), initial_tid),
            send: counting_send,
            traversals: Vec::new(),
            bootstrap: None,
            bytes_sent,
            bytes_received: 0,
            aborted: false,
        }
    }

    pub fn node_id(&self) -> &[u8; NODE_ID_LEN] {
        &self.node_id
    }

    pub fn num_nodes(&self) -> usize {
        self.table.num_nodes()
    }

    pub fn num_outstanding(&self) -> usize {
        self.rpc.num_outstanding()
    }

    /// Drained by the per-second stats pass: (sent, received) bytes since
    /// the last call.
    pub fn network_stats(&mut self) -> (i64, i64) {
        let sent = self.bytes_sent.swap(0, Relaxed);
        let received = self.bytes_received;
        self.bytes_received = 0;
        (sent, received)
    }

    /// Begin an iterative find-node walk towards our own id to populate
    /// the routing table.
    pub fn bootstrap(&mut self, seed_nodes: Vec<SocketAddr>) {
        if self.aborted {
            return;
        }
        info!(seeds = seed_nodes.len(), "dht bootstrap");
        let t = Arc::new(Mutex::new(Traversal::new(self.node_id, TraversalKind::FindNode, None)));
        t.lock().start(seed_nodes);
        self.bootstrap = Some(t.clone());
        self.traversals.push(t);
        self.pump();
    }

    /// Announce a torrent: get_peers walk followed by announce_peer to
    /// every node that handed back a token. Discovered peers flow through
    /// `on_peers`.
    pub fn announce(
        &mut self,
        info_hash: InfoHash,
        port: u16,
        on_peers: impl FnMut(&[SocketAddr]) + Send + 'static,
    ) {
        if self.aborted {
            return;
        }
        let mut walk = Traversal::new(info_hash, TraversalKind::GetPeers, Some(port));
        walk.set_on_peers(on_peers);
        let seeds: Vec<SocketAddr> =
            self.table.closest_nodes(&info_hash, 16).into_iter().map(|n| n.addr).collect();
        walk.start(seeds);
        let t = Arc::new(Mutex::new(walk));
        self.traversals.push(t);
        self.pump();
    }

    pub fn add_node(&mut self, id: [u8; NODE_ID_LEN], addr: SocketAddr) {
        self.table.node_seen(id, addr);
    }

    /// An incoming datagram from the session's UDP socket.
    pub fn incoming(&mut self, data: &[u8], from: SocketAddr, alerts: &mut AlertQueue) {
        if self.aborted {
            return;
        }
        self.bytes_received += data.len() as i64;
        let msg = match parse_message(data) {
            Ok(m) => m,
            Err(e) => {
                // no transaction id to echo; drop
                debug!(%from, error = %e, "malformed dht packet");
                return;
            }
        };
        match msg.kind {
            MessageKind::Reply => {
                self.rpc.incoming(&msg, from, &mut self.table);
                self.pump();
            }
            MessageKind::Query => {
                match msg.method.as_deref() {
                    Some("ping") => {
                        let raw = encode_reply(&msg.tid, &self.node_id);
                        let _ = (self.send)(&raw, from);
                    }
                    _ => {
                        let raw = encode_error(&msg.tid, METHOD_UNKNOWN, "method unknown");
                        let _ = (self.send)(&raw, from);
                    }
                }
                // a querying node is as good as a responding one
                if let Some(id) = msg.query_id.as_deref() {
                    if id.len() == NODE_ID_LEN {
                        let mut nid = [0u8; NODE_ID_LEN];
                        nid.copy_from_slice(id);
                        self.table.node_seen(nid, from);
                    }
                }
            }
            MessageKind::Error => {
                if let Some((code, text)) = msg.error.as_ref() {
                    alerts.post(Alert::DhtError { error: format!("{code}: {text}") });
                }
            }
        }
    }

    /// The OS reported the endpoint unreachable.
    pub fn unreachable(&mut self, ep: SocketAddr) {
        self.rpc.unreachable(ep);
        self.pump();
    }

    /// Periodic upkeep. Returns the duration until the next tick is
    /// useful.
    pub fn tick(&mut self, alerts: &mut AlertQueue) -> Duration {
        let next = self.rpc.tick();
        self.pump();

        if let Some(b) = self.bootstrap.as_ref() {
            if b.lock().is_done() {
                alerts.post(Alert::DhtBootstrap { num_nodes: self.table.num_nodes() });
                self.bootstrap = None;
            }
        }
        self.traversals.retain(|t| !t.lock().is_done());
        next
    }

    /// Issue every request the traversals queued since the last pump.
    fn pump(&mut self) {
        loop {
            let mut any = false;
            let traversals = self.traversals.clone();
            for t in traversals.iter() {
                let pending = t.lock().take_pending();
                for (query, target, role) in pending {
                    any = true;
                    let obs = Observer::new(ObserverKind::Traversal {
                        algorithm: t.clone(),
                        role,
                    });
                    if !self.rpc.invoke(&query, target, obs) {
                        t.lock().failed(role, target, observer::Failure::Timeout);
                    }
                }
            }
            if !any {
                break;
            }
        }
    }

    /// Shutdown: abort all outstanding requests and traversals.
    pub fn close(&mut self) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        self.rpc.close();
        self.traversals.clear();
        self.bootstrap = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_krpc::{compact_nodes, NodeEntry};

    fn capture() -> (Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>, SendFn) {
        let sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = sent.clone();
        let f: SendFn = Arc::new(move |data: &[u8], to: SocketAddr| {
            captured.lock().push((data.to_vec(), to));
            true
        });
        (sent, f)
    }

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{i}:6881").parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn ping_query_gets_a_reply() {
        let (sent, send) = capture();
        let mut rng = SessionRng::from_seed(1);
        let mut dht = Dht::new([1u8; 20], send, &mut rng);
        let mut alerts = AlertQueue::default();

        let q = swarm_krpc::message::encode_query(9, &[2u8; 20], &swarm_krpc::Query::Ping);
        dht.incoming(&q, addr(1), &mut alerts);

        let out = sent.lock();
        assert_eq!(out.len(), 1);
        let reply = parse_message(&out[0].0).unwrap();
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.transaction_id(), Some(9));
        // the querying node was recorded
        assert_eq!(dht.num_nodes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_method_gets_error_204() {
        let (sent, send) = capture();
        let mut rng = SessionRng::from_seed(1);
        let mut dht = Dht::new([1u8; 20], send, &mut rng);
        let mut alerts = AlertQueue::default();

        let q = swarm_krpc::message::encode_query(
            3,
            &[2u8; 20],
            &swarm_krpc::Query::FindNode { target: [0u8; 20] },
        );
        dht.incoming(&q, addr(1), &mut alerts);

        let out = sent.lock();
        let reply = parse_message(&out[0].0).unwrap();
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.error.as_ref().map(|e| e.0), Some(204));
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_walks_and_reports() {
        let (sent, send) = capture();
        let mut rng = SessionRng::from_seed(1);
        let mut dht = Dht::new([1u8; 20], send, &mut rng);
        let mut alerts = AlertQueue::default();

        dht.bootstrap(vec![addr(1)]);
        assert_eq!(dht.num_outstanding(), 1);

        // answer the find_node with one new node
        let q = parse_message(&sent.lock()[0].0).unwrap();
        let nodes = compact_nodes(&[NodeEntry { id: [3u8; 20], addr: addr(2) }]);
        let mut raw = Vec::new();
        raw.push(b'd');
        swarm_krpc::bencode::write_str(&mut raw, "r");
        raw.push(b'd');
        swarm_krpc::bencode::write_str(&mut raw, "id");
        swarm_krpc::bencode::write_bstr(&mut raw, &[2u8; 20]);
        swarm_krpc::bencode::write_str(&mut raw, "nodes");
        swarm_krpc::bencode::write_bstr(&mut raw, &nodes);
        raw.push(b'e');
        swarm_krpc::bencode::write_str(&mut raw, "t");
        swarm_krpc::bencode::write_bstr(&mut raw, &q.tid);
        swarm_krpc::bencode::write_str(&mut raw, "y");
        swarm_krpc::bencode::write_str(&mut raw, "r");
        raw.push(b'e');
        dht.incoming(&raw, addr(1), &mut alerts);

        // the walk continued to the returned node
        assert_eq!(dht.num_outstanding(), 1);
        assert_eq!(dht.num_nodes(), 1);

        // time the rest out; the bootstrap completes
        tokio::time::advance(Duration::from_secs(21)).await;
        dht.tick(&mut alerts);
        let drained = alerts.pop_all();
        assert!(drained
            .iter()
            .any(|a| matches!(a, Alert::DhtBootstrap { .. })));
    }
}
