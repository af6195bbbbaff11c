use crate::error::SwarmError;
use crate::torrent::Torrent;
use crate::InfoHash;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Callback producing raw metadata bytes for a lazily-loaded torrent.
pub type UserLoadFn = Box<dyn Fn(&InfoHash) -> Result<Vec<u8>, SwarmError> + Send>;

/// The obfuscated hash peers advertise in the encrypted handshake:
/// `sha1("req2" ‖ info_hash)`.
pub fn obfuscated_hash(info_hash: &InfoHash) -> InfoHash {
    let mut hasher = Sha1::new();
    hasher.update(b"req2");
    hasher.update(info_hash);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Info-hash keyed torrent map with its secondary indices and the
/// loaded-torrent LRU. The LRU front is the next torrent to evict; pinned
/// torrents never enter it.
pub struct TorrentRegistry {
    torrents: HashMap<InfoHash, Arc<Torrent>>,
    obfuscated: HashMap<InfoHash, InfoHash>,
    uuids: HashMap<String, InfoHash>,
    /// Stable iteration order for the DHT/LSD announce round-robin; kept
    /// in insertion order and rebuilt entries removed on unregister.
    order: Vec<InfoHash>,
    lru: VecDeque<InfoHash>,
    user_load: Option<UserLoadFn>,
    next_sequence: u64,
    evicted: u64,
}

impl TorrentRegistry {
    pub fn new() -> Self {
        Self {
            torrents: HashMap::new(),
            obfuscated: HashMap::new(),
            uuids: HashMap::new(),
            order: Vec::new(),
            lru: VecDeque::new(),
            user_load: None,
            next_sequence: 0,
            evicted: 0,
        }
    }

    pub fn set_user_load_function(&mut self, f: Option<UserLoadFn>) {
        self.user_load = f;
    }

    pub fn next_sequence(&mut self) -> u64 {
        let s = self.next_sequence;
        self.next_sequence += 1;
        s
    }

    pub fn insert(&mut self, t: Arc<Torrent>) -> Result<(), SwarmError> {
        let ih = t.info_hash();
        if self.torrents.contains_key(&ih) {
            return Err(SwarmError::DuplicateTorrent);
        }
        self.obfuscated.insert(obfuscated_hash(&ih), ih);
        if let Some(uuid) = t.uuid() {
            self.uuids.insert(uuid.to_string(), ih);
        }
        self.order.push(ih);
        self.torrents.insert(ih, t);
        Ok(())
    }

    pub fn remove(&mut self, ih: &InfoHash) -> Option<Arc<Torrent>> {
        let t = self.torrents.remove(ih)?;
        self.obfuscated.remove(&obfuscated_hash(ih));
        if let Some(uuid) = t.uuid() {
            self.uuids.remove(uuid);
        }
        self.order.retain(|h| h != ih);
        self.lru.retain(|h| h != ih);
        Some(t)
    }

    pub fn find(&self, ih: &InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.get(ih).cloned()
    }

    /// Resolve an obfuscated (encrypted-handshake) hash to its torrent.
    pub fn find_obfuscated(&self, obfuscated: &InfoHash) -> Option<Arc<Torrent>> {
        let ih = self.obfuscated.get(obfuscated)?;
        self.torrents.get(ih).cloned()
    }

    pub fn find_uuid(&self, uuid: &str) -> Option<Arc<Torrent>> {
        let ih = self.uuids.get(uuid)?;
        self.torrents.get(ih).cloned()
    }

    pub fn len(&self) -> usize {
        self.torrents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.torrents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Torrent>> {
        self.torrents.values()
    }

    /// Insertion-ordered info-hashes, for the announce round-robins.
    pub fn order(&self) -> &[InfoHash] {
        &self.order
    }

    pub fn clear(&mut self) {
        self.torrents.clear();
        self.obfuscated.clear();
        self.uuids.clear();
        self.order.clear();
        self.lru.clear();
    }

    pub fn torrents_evicted(&self) -> u64 {
        self.evicted
    }

    // LRU -------------------------------------------------------------

    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    pub fn lru_contents(&self) -> Vec<InfoHash> {
        self.lru.iter().copied().collect()
    }

    /// Move `t` to the back (most recently used, `back = true`) or front
    /// (first to evict) of the LRU. New entries trigger an eviction pass
    /// to keep the loaded count within `loaded_limit`.
    pub fn bump_torrent(&mut self, t: &Arc<Torrent>, back: bool, loaded_limit: usize) {
        if t.is_aborted() {
            return;
        }
        let ih = t.info_hash();
        let was_in_list = self.lru.iter().any(|h| *h == ih);
        if was_in_list {
            self.lru.retain(|h| *h != ih);
        }

        // pinned torrents are never eviction candidates
        if t.is_pinned() {
            return;
        }

        if back {
            self.lru.push_back(ih);
        } else {
            self.lru.push_front(ih);
        }

        if !was_in_list {
            self.evict_torrents_except(&ih, loaded_limit);
        }
    }

    /// Give up this torrent's loaded slot: unload immediately when over
    /// the limit, otherwise park it at the eviction front.
    pub fn evict_torrent(&mut self, t: &Arc<Torrent>, loaded_limit: usize) {
        if self.user_load.is_none() {
            return;
        }
        if !t.is_loaded() || !t.should_be_loaded() {
            return;
        }
        // 0 means unlimited, never evict anything
        if loaded_limit == 0 {
            return;
        }
        if self.lru.len() > loaded_limit {
            self.evicted += 1;
            t.unload();
            let ih = t.info_hash();
            self.lru.retain(|h| *h != ih);
            return;
        }
        self.bump_torrent(t, false, loaded_limit);
    }

    /// Pop from the eviction front until the LRU fits `loaded_limit`,
    /// skipping `ignore` (the torrent room is being made for).
    pub fn evict_torrents_except(&mut self, ignore: &InfoHash, loaded_limit: usize) {
        if self.user_load.is_none() {
            return;
        }
        // 0 means unlimited, never evict anything
        if loaded_limit == 0 {
            return;
        }
        // if the ignored torrent occupies a slot itself, allow one more
        let mut limit = loaded_limit;
        if self.lru.iter().any(|h| h == ignore) {
            limit += 1;
        }

        while self.lru.len() >= limit {
            let victim = match self.lru.front().copied() {
                Some(h) if h == *ignore => match self.lru.get(1).copied() {
                    Some(next) => next,
                    None => break,
                },
                Some(h) => h,
                None => break,
            };
            self.lru.retain(|h| *h != victim);
            if let Some(t) = self.torrents.get(&victim) {
                debug_assert!(!t.is_pinned());
                self.evicted += 1;
                debug!(infohash = %hex::encode(victim), "evicting torrent");
                t.unload();
            }
        }
    }

    /// Load a torrent's metadata through the user callback. On failure the
    /// torrent is put in the error state and paused without touching the
    /// LRU.
    pub fn load_torrent(&mut self, t: &Arc<Torrent>, loaded_limit: usize) -> bool {
        let ih = t.info_hash();
        self.evict_torrents_except(&ih, loaded_limit);

        let load = match self.user_load.as_ref() {
            Some(f) => f,
            None => return false,
        };
        let buffer = match load(&ih) {
            Ok(b) => b,
            Err(e) => {
                t.set_error(e.to_string());
                t.pause(false);
                return false;
            }
        };
        let ok = t.load(buffer);
        if ok {
            self.bump_torrent(t, true, loaded_limit);
        }
        ok
    }

    /// Invariant: every LRU member is a loaded, unpinned, live torrent.
    #[cfg(test)]
    fn check_lru_invariant(&self) {
        for ih in self.lru.iter() {
            let t = self.torrents.get(ih).expect("lru entry without torrent");
            assert!(!t.is_pinned());
            assert!(t.is_loaded());
            assert!(!t.is_aborted());
        }
    }
}

impl Default for TorrentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::AddTorrentParams;

    fn registry_with_loader() -> TorrentRegistry {
        let mut reg = TorrentRegistry::new();
        reg.set_user_load_function(Some(Box::new(|_ih| Ok(vec![1, 2, 3]))));
        reg
    }

    fn add_torrent(reg: &mut TorrentRegistry, tag: u8, pinned: bool) -> Arc<Torrent> {
        let mut ih = [0u8; 20];
        ih[0] = tag;
        let mut params = AddTorrentParams::with_info_hash(ih);
        params.pinned = pinned;
        let seq = reg.next_sequence();
        let t = Torrent::new(params, seq, 0);
        reg.insert(t.clone()).unwrap();
        t
    }

    #[test]
    fn obfuscated_lookup_matches_every_torrent() {
        let mut reg = registry_with_loader();
        let t1 = add_torrent(&mut reg, 1, false);
        let t2 = add_torrent(&mut reg, 2, false);
        for t in [&t1, &t2] {
            let ob = obfuscated_hash(&t.info_hash());
            let found = reg.find_obfuscated(&ob).unwrap();
            assert_eq!(found.info_hash(), t.info_hash());
        }
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut reg = registry_with_loader();
        let _t = add_torrent(&mut reg, 1, false);
        let mut ih = [0u8; 20];
        ih[0] = 1;
        let t2 = Torrent::new(AddTorrentParams::with_info_hash(ih), 99, 0);
        assert!(matches!(reg.insert(t2), Err(SwarmError::DuplicateTorrent)));
    }

    #[test]
    fn lru_eviction_scenario() {
        // active_loaded_limit = 3; load T1..T4, expect T1 evicted and the
        // LRU left as {T2, T3, T4} in that order
        let limit = 3;
        let mut reg = registry_with_loader();
        let torrents: Vec<_> = (1..=4).map(|i| add_torrent(&mut reg, i, false)).collect();
        for t in &torrents {
            assert!(reg.load_torrent(t, limit));
        }
        assert!(!torrents[0].is_loaded());
        for t in &torrents[1..] {
            assert!(t.is_loaded());
        }
        let lru: Vec<u8> = reg.lru_contents().iter().map(|h| h[0]).collect();
        assert_eq!(lru, vec![2, 3, 4]);
        reg.check_lru_invariant();
    }

    #[test]
    fn zero_limit_disables_eviction() {
        let mut reg = registry_with_loader();
        let torrents: Vec<_> = (1..=10).map(|i| add_torrent(&mut reg, i, false)).collect();
        for t in &torrents {
            assert!(reg.load_torrent(t, 0));
        }
        assert!(torrents.iter().all(|t| t.is_loaded()));
        assert_eq!(reg.lru_len(), 10);
    }

    #[test]
    fn pinned_torrents_stay_out_of_lru() {
        let mut reg = registry_with_loader();
        let pinned = add_torrent(&mut reg, 1, true);
        assert!(reg.load_torrent(&pinned, 2));
        assert!(pinned.is_loaded());
        assert_eq!(reg.lru_len(), 0);
        // loading more torrents never evicts the pinned one
        for i in 2..=5 {
            let t = add_torrent(&mut reg, i, false);
            reg.load_torrent(&t, 2);
        }
        assert!(pinned.is_loaded());
        reg.check_lru_invariant();
    }

    #[test]
    fn load_failure_sets_error_and_pauses() {
        let mut reg = TorrentRegistry::new();
        reg.set_user_load_function(Some(Box::new(|_ih| {
            Err(SwarmError::Metadata("gone".into()))
        })));
        let t = add_torrent(&mut reg, 1, false);
        assert!(!reg.load_torrent(&t, 3));
        assert!(t.has_error());
        assert!(t.is_paused());
        assert_eq!(reg.lru_len(), 0);
    }

    #[test]
    fn bump_front_marks_first_to_evict() {
        let limit = 10;
        let mut reg = registry_with_loader();
        let a = add_torrent(&mut reg, 1, false);
        let b = add_torrent(&mut reg, 2, false);
        reg.load_torrent(&a, limit);
        reg.load_torrent(&b, limit);
        reg.bump_torrent(&a, false, limit);
        assert_eq!(reg.lru_contents()[0][0], 1);
    }

    #[test]
    fn remove_clears_all_indices() {
        let mut reg = registry_with_loader();
        let mut ih = [0u8; 20];
        ih[0] = 7;
        let mut params = AddTorrentParams::with_info_hash(ih);
        params.uuid = Some("feed-1".to_string());
        let t = Torrent::new(params, 0, 0);
        reg.insert(t).unwrap();
        assert!(reg.find_uuid("feed-1").is_some());
        reg.remove(&ih);
        assert!(reg.find(&ih).is_none());
        assert!(reg.find_uuid("feed-1").is_none());
        assert!(reg.find_obfuscated(&obfuscated_hash(&ih)).is_none());
    }
}
