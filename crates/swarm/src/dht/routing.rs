use std::net::SocketAddr;
use swarm_krpc::{NodeEntry, NODE_ID_LEN};

/// Nodes kept per bucket.
const BUCKET_SIZE: usize = 8;
const NUM_BUCKETS: usize = NODE_ID_LEN * 8;

fn xor_distance(a: &[u8; NODE_ID_LEN], b: &[u8; NODE_ID_LEN]) -> [u8; NODE_ID_LEN] {
    let mut out = [0u8; NODE_ID_LEN];
    for i in 0..NODE_ID_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the bucket holding ids at this distance: the position of the
/// highest set bit of the xor distance.
fn bucket_index(distance: &[u8; NODE_ID_LEN]) -> Option<usize> {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let bit = 7 - byte.leading_zeros() as usize;
            return Some((NODE_ID_LEN - 1 - byte_idx) * 8 + bit);
        }
    }
    None
}

/// XOR-metric bucket table. Only what the RPC manager's contract needs:
/// record responding nodes (`node_seen`) and hand traversals their
/// starting set (`closest_nodes`).
pub struct RoutingTable {
    our_id: [u8; NODE_ID_LEN],
    buckets: Vec<Vec<NodeEntry>>,
}

impl RoutingTable {
    pub fn new(our_id: [u8; NODE_ID_LEN]) -> Self {
        Self { our_id, buckets: vec![Vec::new(); NUM_BUCKETS] }
    }

    pub fn our_id(&self) -> &[u8; NODE_ID_LEN] {
        &self.our_id
    }

    pub fn num_nodes(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// A node with this id responded from this endpoint. Returns whether
    /// the table kept (or refreshed) the node.
    pub fn node_seen(&mut self, id: [u8; NODE_ID_LEN], addr: SocketAddr) -> bool {
        if id == self.our_id {
            return false;
        }
        let dist = xor_distance(&self.our_id, &id);
        let idx = match bucket_index(&dist) {
            Some(i) => i,
            None => return false,
        };
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.iter().position(|n| n.id == id) {
            // refresh: move to the back (most recently seen)
            let mut node = bucket.remove(pos);
            node.addr = addr;
            bucket.push(node);
            return true;
        }
        if bucket.len() < BUCKET_SIZE {
            bucket.push(NodeEntry { id, addr });
            return true;
        }
        false
    }

    /// The `count` nodes closest to `target`, for seeding traversals.
    pub fn closest_nodes(&self, target: &[u8; NODE_ID_LEN], count: usize) -> Vec<NodeEntry> {
        let mut all: Vec<NodeEntry> =
            self.buckets.iter().flat_map(|b| b.iter().copied()).collect();
        all.sort_by_key(|n| xor_distance(target, &n.id));
        all.truncate(count);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: u8) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        out[0] = tag;
        out
    }

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{i}:6881").parse().unwrap()
    }

    #[test]
    fn own_id_rejected() {
        let mut table = RoutingTable::new(id(1));
        assert!(!table.node_seen(id(1), addr(1)));
        assert_eq!(table.num_nodes(), 0);
    }

    #[test]
    fn nodes_inserted_and_refreshed() {
        let mut table = RoutingTable::new(id(1));
        assert!(table.node_seen(id(2), addr(1)));
        assert_eq!(table.num_nodes(), 1);
        // same id from a new endpoint refreshes in place
        assert!(table.node_seen(id(2), addr(2)));
        assert_eq!(table.num_nodes(), 1);
        let closest = table.closest_nodes(&id(2), 1);
        assert_eq!(closest[0].addr, addr(2));
    }

    #[test]
    fn full_bucket_rejects_new_nodes() {
        let mut table = RoutingTable::new([0u8; NODE_ID_LEN]);
        // ids sharing the same top bit land in one bucket
        let mut accepted = 0;
        for i in 0..20u8 {
            let mut nid = [0u8; NODE_ID_LEN];
            nid[0] = 0x80;
            nid[NODE_ID_LEN - 1] = i + 1;
            if table.node_seen(nid, addr(i + 1)) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, BUCKET_SIZE);
    }

    #[test]
    fn closest_nodes_sorted_by_distance() {
        let mut table = RoutingTable::new([0u8; NODE_ID_LEN]);
        for tag in [0x10u8, 0x20, 0x40] {
            table.node_seen(id(tag), addr(tag));
        }
        let closest = table.closest_nodes(&id(0x11), 2);
        assert_eq!(closest[0].id, id(0x10));
        assert_eq!(closest[1].id, id(0x20));
    }
}
