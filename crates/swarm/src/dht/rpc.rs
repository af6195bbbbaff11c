use crate::dht::observer::Observer;
use crate::dht::routing::RoutingTable;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use swarm_krpc::{encode_error, encode_query, Message, Query, NODE_ID_LEN};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Slow-node notification threshold.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(3);
/// A request unanswered this long is dead.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(20);

/// Error code used on protocol-level error replies (BEP 5).
const PROTOCOL_ERROR: i64 = 203;

/// Sends one datagram; returns whether the send call succeeded. Shared
/// with the node so error replies to queries use the same socket.
pub type SendFn = Arc<dyn Fn(&[u8], SocketAddr) -> bool + Send + Sync>;

/// At-most-once transaction dispatcher for outgoing DHT requests.
/// Correlates replies to observers by (transaction id, source address),
/// enforces the short/long timeouts, and reports responding nodes to the
/// routing table.
pub struct RpcManager {
    /// Outstanding observers, ordered by send time (oldest first).
    transactions: Vec<Observer>,
    next_transaction_id: u16,
    our_id: [u8; NODE_ID_LEN],
    send: SendFn,
    destructing: bool,
}

impl RpcManager {
    pub fn new(our_id: [u8; NODE_ID_LEN], send: SendFn, initial_transaction_id: u16) -> Self {
        Self {
            transactions: Vec::new(),
            next_transaction_id: initial_transaction_id,
            our_id,
            send,
            destructing: false,
        }
    }

    pub fn num_outstanding(&self) -> usize {
        self.transactions.len()
    }

    /// Invariant: ids of outstanding transactions are pairwise distinct.
    /// Holds because ids advance modulo 2^16 between sends and far fewer
    /// than 2^16 requests are ever outstanding.
    #[cfg(test)]
    pub fn check_invariant(&self) {
        for (i, a) in self.transactions.iter().enumerate() {
            for b in self.transactions.iter().skip(i + 1) {
                assert_ne!(a.transaction_id(), b.transaction_id());
            }
        }
    }

    /// Stamp the request with the next transaction id, send it, and
    /// register the observer on success. Returns whether the send call
    /// succeeded.
    pub fn invoke(&mut self, query: &Query, target: SocketAddr, mut observer: Observer) -> bool {
        if self.destructing {
            return false;
        }

        let tid = self.next_transaction_id;
        let raw = encode_query(tid, &self.our_id, query);

        observer.set_target(target);
        observer.set_transaction_id(tid);

        trace!(method = query.method(), %target, tid, "invoking");

        if (self.send)(&raw, target) {
            observer.mark_sent();
            self.transactions.push(observer);
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            true
        } else {
            false
        }
    }

    fn send_error(&self, to: SocketAddr, tid: &[u8], msg: &str) {
        let raw = encode_error(tid, PROTOCOL_ERROR, msg);
        let _ = (self.send)(&raw, to);
    }

    /// Handle a reply packet. Returns whether the routing table accepted
    /// the responding node.
    pub fn incoming(&mut self, msg: &Message, from: SocketAddr, table: &mut RoutingTable) -> bool {
        if self.destructing {
            return false;
        }

        // if we don't have the transaction id in our request list, ignore
        // the packet
        let tid = match msg.transaction_id() {
            Some(t) => t,
            None => {
                debug!(len = msg.tid.len(), %from, "reply with invalid transaction id size");
                self.send_error(from, &msg.tid, "invalid transaction id");
                return false;
            }
        };

        let pos = self.transactions.iter().position(|o| {
            o.transaction_id() == tid && o.target_ep().ip() == from.ip()
        });
        let mut observer = match pos {
            Some(i) => self.transactions.remove(i),
            None => {
                debug!(tid, %from, "reply with unknown transaction id");
                self.send_error(from, &msg.tid, "invalid transaction id");
                return false;
            }
        };

        let response = match msg.response.as_ref() {
            Some(r) => r,
            None => {
                self.send_error(from, &msg.tid, "missing 'r' key");
                return false;
            }
        };
        let node_id = match response.id.as_deref() {
            Some(id) if id.len() == NODE_ID_LEN => {
                let mut out = [0u8; NODE_ID_LEN];
                out.copy_from_slice(id);
                out
            }
            _ => {
                self.send_error(from, &msg.tid, "missing 'id' key");
                return false;
            }
        };

        observer.reply(response, from);
        table.node_seen(node_id, from)
    }

    /// The OS told us the endpoint is unreachable; time out the matching
    /// observer immediately.
    pub fn unreachable(&mut self, ep: SocketAddr) {
        if let Some(i) = self.transactions.iter().position(|o| o.target_ep() == ep) {
            debug!(%ep, tid = self.transactions[i].transaction_id(), "port unreachable");
            let mut observer = self.transactions.remove(i);
            observer.timeout();
        }
    }

    /// Reap timed-out observers. Two passes over the send-time-ordered
    /// list: remove and fire `timeout` past the long timeout, then fire
    /// `short_timeout` (once per observer) past the short timeout.
    /// Returns the duration until the next tick is needed.
    pub fn tick(&mut self) -> Duration {
        if self.transactions.is_empty() {
            return SHORT_TIMEOUT;
        }

        let now = Instant::now();
        let mut ret = SHORT_TIMEOUT;

        let mut timeouts: Vec<Observer> = Vec::new();
        while !self.transactions.is_empty() {
            // the list is ordered by send time; the first observer inside
            // the timeout ends the scan
            let age = now.saturating_duration_since(self.transactions[0].sent());
            if age < RPC_TIMEOUT {
                ret = RPC_TIMEOUT - age;
                break;
            }
            timeouts.push(self.transactions.remove(0));
        }
        for o in timeouts.iter_mut() {
            o.timeout();
        }

        for o in self.transactions.iter_mut() {
            let age = now.saturating_duration_since(o.sent());
            if age < SHORT_TIMEOUT {
                ret = SHORT_TIMEOUT - age;
                break;
            }
            if o.has_short_timeout() {
                continue;
            }
            o.short_timeout();
        }

        ret
    }

    /// Shutdown: abort every outstanding observer.
    pub fn close(&mut self) {
        if self.destructing {
            return;
        }
        self.destructing = true;
        let mut transactions = std::mem::take(&mut self.transactions);
        for o in transactions.iter_mut() {
            o.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::observer::ObserverKind;
    use crate::dht::traversal::{Traversal, TraversalKind};
    use parking_lot::Mutex;
    use swarm_krpc::{encode_reply, parse_message};
    use tokio::time::advance;

    struct Wire {
        sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    }

    fn wire() -> (Wire, SendFn) {
        let sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = sent.clone();
        let f: SendFn = Arc::new(move |data: &[u8], to: SocketAddr| {
            captured.lock().push((data.to_vec(), to));
            true
        });
        (Wire { sent }, f)
    }

    fn traversal() -> Arc<Mutex<Traversal>> {
        Arc::new(Mutex::new(Traversal::new([0u8; 20], TraversalKind::FindNode, None)))
    }

    fn observer_for(t: &Arc<Mutex<Traversal>>) -> Observer {
        Observer::new(ObserverKind::Traversal {
            algorithm: t.clone(),
            role: crate::dht::observer::ObserverRole::FindNode,
        })
    }

    fn target() -> SocketAddr {
        "203.0.113.5:6881".parse().unwrap()
    }

    fn reply_for(raw_query: &[u8], node_id: [u8; 20]) -> Vec<u8> {
        let q = parse_message(raw_query).unwrap();
        encode_reply(&q.tid, &node_id)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_reply_consumes_observer() {
        let (w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 7);
        let mut table = RoutingTable::new([1u8; 20]);
        let t = traversal();

        assert!(rpc.invoke(
            &Query::FindNode { target: [9u8; 20] },
            target(),
            observer_for(&t)
        ));
        assert_eq!(rpc.num_outstanding(), 1);
        rpc.check_invariant();

        let raw_reply = reply_for(&w.sent.lock()[0].0, [5u8; 20]);
        let msg = parse_message(&raw_reply).unwrap();
        let accepted = rpc.incoming(&msg, target(), &mut table);

        assert!(accepted);
        assert_eq!(rpc.num_outstanding(), 0);
        assert_eq!(t.lock().num_responses(), 1);
        assert_eq!(table.num_nodes(), 1);

        // a second copy of the reply finds no observer and is refused with
        // an error reply
        let before = w.sent.lock().len();
        assert!(!rpc.incoming(&msg, target(), &mut table));
        assert_eq!(t.lock().num_responses(), 1);
        let sent = w.sent.lock();
        let err = parse_message(&sent[before].0).unwrap();
        assert_eq!(err.error.as_ref().map(|e| e.1.as_str()), Some("invalid transaction id"));
    }

    #[tokio::test(start_paused = true)]
    async fn short_then_long_timeout() {
        let (_w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let a = traversal();
        let b = traversal();
        rpc.invoke(&Query::Ping, "203.0.113.1:1".parse().unwrap(), observer_for(&a));
        rpc.invoke(&Query::Ping, "203.0.113.2:2".parse().unwrap(), observer_for(&b));

        advance(Duration::from_millis(3500)).await;
        rpc.tick();
        assert_eq!(a.lock().num_short_timeouts(), 1);
        assert_eq!(b.lock().num_short_timeouts(), 1);
        assert_eq!(rpc.num_outstanding(), 2);

        // short timeout does not fire twice
        rpc.tick();
        assert_eq!(a.lock().num_short_timeouts(), 1);

        advance(Duration::from_millis(17_000)).await;
        rpc.tick();
        assert_eq!(a.lock().num_timeouts(), 1);
        assert_eq!(b.lock().num_timeouts(), 1);
        assert_eq!(rpc.num_outstanding(), 0);

        advance(Duration::from_millis(4_500)).await;
        rpc.tick();
        assert_eq!(a.lock().num_timeouts(), 1);
        assert_eq!(a.lock().num_short_timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_from_wrong_address_is_refused() {
        let (w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let mut table = RoutingTable::new([1u8; 20]);
        let t = traversal();
        rpc.invoke(&Query::Ping, target(), observer_for(&t));

        let raw_reply = reply_for(&w.sent.lock()[0].0, [5u8; 20]);
        let msg = parse_message(&raw_reply).unwrap();
        let spoofed: SocketAddr = "198.51.100.9:6881".parse().unwrap();
        assert!(!rpc.incoming(&msg, spoofed, &mut table));
        // the observer is still outstanding
        assert_eq!(rpc.num_outstanding(), 1);
        assert_eq!(t.lock().num_responses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_tid_elicits_error_and_keeps_observer() {
        let (w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let mut table = RoutingTable::new([1u8; 20]);
        let t = traversal();
        rpc.invoke(&Query::Ping, target(), observer_for(&t));

        // a reply with a 3-byte transaction id
        let raw = encode_reply(b"abc", &[5u8; 20]);
        let msg = parse_message(&raw).unwrap();
        let before = w.sent.lock().len();
        assert!(!rpc.incoming(&msg, target(), &mut table));
        assert_eq!(rpc.num_outstanding(), 1);
        let sent = w.sent.lock();
        let err = parse_message(&sent[before].0).unwrap();
        assert_eq!(err.error.as_ref().map(|e| e.1.as_str()), Some("invalid transaction id"));
    }

    #[tokio::test(start_paused = true)]
    async fn reply_missing_r_dict_is_an_error() {
        let (w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let mut table = RoutingTable::new([1u8; 20]);
        let t = traversal();
        rpc.invoke(&Query::Ping, target(), observer_for(&t));

        // craft a bare "y":"r" message reusing the real tid
        let q = parse_message(&w.sent.lock()[0].0).unwrap();
        let mut raw = Vec::new();
        raw.push(b'd');
        swarm_krpc::bencode::write_str(&mut raw, "t");
        swarm_krpc::bencode::write_bstr(&mut raw, &q.tid);
        swarm_krpc::bencode::write_str(&mut raw, "y");
        swarm_krpc::bencode::write_str(&mut raw, "r");
        raw.push(b'e');
        let msg = parse_message(&raw).unwrap();

        let before = w.sent.lock().len();
        assert!(!rpc.incoming(&msg, target(), &mut table));
        let sent = w.sent.lock();
        let err = parse_message(&sent[before].0).unwrap();
        assert_eq!(err.error.as_ref().map(|e| e.1.as_str()), Some("missing 'r' key"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_times_out_matching_observer() {
        let (_w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let t = traversal();
        rpc.invoke(&Query::Ping, target(), observer_for(&t));
        rpc.unreachable("198.51.100.1:9".parse().unwrap());
        assert_eq!(rpc.num_outstanding(), 1);
        rpc.unreachable(target());
        assert_eq!(rpc.num_outstanding(), 0);
        assert_eq!(t.lock().num_timeouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_aborts_everything() {
        let (_w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, 0);
        let t = traversal();
        rpc.invoke(&Query::Ping, target(), observer_for(&t));
        rpc.invoke(&Query::Ping, "203.0.113.9:1".parse().unwrap(), observer_for(&t));
        rpc.close();
        assert_eq!(rpc.num_outstanding(), 0);
        assert_eq!(t.lock().num_aborted(), 2);
        // further invokes are refused
        assert!(!rpc.invoke(&Query::Ping, target(), observer_for(&t)));
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_ids_advance_modulo_2_16() {
        let (w, send) = wire();
        let mut rpc = RpcManager::new([1u8; 20], send, u16::MAX);
        let t = traversal();
        rpc.invoke(&Query::Ping, "203.0.113.1:1".parse().unwrap(), observer_for(&t));
        rpc.invoke(&Query::Ping, "203.0.113.2:2".parse().unwrap(), observer_for(&t));
        rpc.check_invariant();
        let sent = w.sent.lock();
        let first = parse_message(&sent[0].0).unwrap();
        let second = parse_message(&sent[1].0).unwrap();
        assert_eq!(first.transaction_id(), Some(u16::MAX));
        assert_eq!(second.transaction_id(), Some(0));
    }
}
