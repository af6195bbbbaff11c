use crate::config::SessionSettings;
use crate::error::DisconnectReason;
use crate::peer::PeerConnection;
use crate::InfoHash;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

/// Opaque TLS context handle for SSL torrents. The record layer itself is
/// the encryption collaborator's business; the session only needs to know
/// whether a torrent has a context and to hand it to accepted sockets.
#[derive(Clone)]
pub struct SslContext(pub Arc<Vec<u8>>);

impl std::fmt::Debug for SslContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SslContext({} bytes)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentState {
    Checking,
    Downloading,
    Seeding,
}

/// Parameters for adding a torrent to the session.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub info_hash: InfoHash,
    pub name: String,
    pub uuid: Option<String>,
    pub auto_managed: bool,
    pub pinned: bool,
    pub paused: bool,
    pub ssl_context: Option<SslContext>,
    /// Admit peers blocked by the session ip filter.
    pub ignore_ip_filter: bool,
    pub max_connections: usize,
    /// Torrent-level unchoke budget. 0 = unlimited.
    pub max_uploads: usize,
    /// Already-available metadata. Absent for lazily-loaded torrents.
    pub metadata: Option<Vec<u8>>,
    pub trackers: Vec<String>,
}

impl AddTorrentParams {
    pub fn with_info_hash(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            name: hex::encode(info_hash),
            uuid: None,
            auto_managed: true,
            pinned: false,
            paused: false,
            ssl_context: None,
            ignore_ip_filter: false,
            max_connections: 50,
            max_uploads: 0,
            metadata: None,
            trackers: Vec::new(),
        }
    }
}

/// Snapshot for the state-update alert.
#[derive(Debug, Clone)]
pub struct TorrentStatus {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub paused: bool,
    pub finished: bool,
    pub num_peers: usize,
    pub queue_position: i32,
    pub upload_payload_rate: i64,
    pub download_payload_rate: i64,
    pub all_time_upload: i64,
    pub all_time_download: i64,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct TorrentRates {
    upload_payload_rate: i64,
    download_payload_rate: i64,
    all_time_upload: i64,
    all_time_download: i64,
    last_tick_upload: i64,
    last_tick_download: i64,
    seeding_time: u64,
    active_time: u64,
}

struct Inner {
    name: String,
    state: TorrentState,
    error: Option<String>,
    paused: bool,
    graceful_pause: bool,
    session_paused: bool,
    auto_managed: bool,
    allow_peers: bool,
    announce_to_dht: bool,
    announce_to_trackers: bool,
    announce_to_lsd: bool,
    queue_position: i32,
    sequence: u64,
    started: u64,
    finished: bool,
    loaded: bool,
    pinned: bool,
    aborted: bool,
    checking_requested: bool,
    ignore_ip_filter: bool,
    max_connections: usize,
    max_uploads: usize,
    num_uploads: usize,
    peers: Vec<Weak<PeerConnection>>,
    candidates: VecDeque<SocketAddr>,
    metadata: Option<Vec<u8>>,
    ssl: Option<SslContext>,
    rates: TorrentRates,
    trackers: Vec<String>,
}

/// A torrent as seen by the session scheduler. Piece state, storage and
/// the wire protocol live in their own subsystems; this is the control
/// surface the admission, choking and auto-manage passes operate on.
pub struct Torrent {
    info_hash: InfoHash,
    uuid: Option<String>,
    inner: Mutex<Inner>,
}

impl Torrent {
    pub fn new(params: AddTorrentParams, sequence: u64, session_time: u64) -> Arc<Self> {
        let loaded = params.metadata.is_some();
        Arc::new(Self {
            info_hash: params.info_hash,
            uuid: params.uuid,
            inner: Mutex::new(Inner {
                name: params.name,
                state: TorrentState::Downloading,
                error: None,
                paused: params.paused,
                graceful_pause: false,
                session_paused: false,
                auto_managed: params.auto_managed,
                allow_peers: !params.paused,
                announce_to_dht: true,
                announce_to_trackers: true,
                announce_to_lsd: true,
                queue_position: sequence as i32,
                sequence,
                started: session_time,
                finished: false,
                loaded,
                pinned: params.pinned,
                aborted: false,
                checking_requested: false,
                ignore_ip_filter: params.ignore_ip_filter,
                max_connections: params.max_connections,
                max_uploads: params.max_uploads,
                num_uploads: 0,
                peers: Vec::new(),
                candidates: VecDeque::new(),
                metadata: params.metadata,
                ssl: params.ssl_context,
                rates: TorrentRates::default(),
                trackers: params.trackers,
            }),
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn trackers(&self) -> Vec<String> {
        self.inner.lock().trackers.clone()
    }

    // state -----------------------------------------------------------

    pub fn state(&self) -> TorrentState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TorrentState) {
        let mut g = self.inner.lock();
        g.state = state;
        if state == TorrentState::Seeding {
            g.finished = true;
        }
    }

    pub fn is_paused(&self) -> bool {
        let g = self.inner.lock();
        g.paused || g.session_paused
    }

    pub fn pause(&self, graceful: bool) {
        let mut g = self.inner.lock();
        if g.paused {
            return;
        }
        g.paused = true;
        g.graceful_pause = graceful;
        g.allow_peers = false;
        if !graceful {
            Self::disconnect_all_locked(&mut g, DisconnectReason::StoppingTorrent);
        }
    }

    pub fn resume(&self) {
        let mut g = self.inner.lock();
        if !g.paused {
            return;
        }
        g.paused = false;
        g.graceful_pause = false;
        g.allow_peers = true;
    }

    /// Session-wide pause; does not touch the torrent's own paused flag.
    pub fn do_pause(&self) {
        let mut g = self.inner.lock();
        g.session_paused = true;
        g.allow_peers = false;
    }

    pub fn do_resume(&self) {
        let mut g = self.inner.lock();
        g.session_paused = false;
        if !g.paused {
            g.allow_peers = true;
        }
    }

    /// Re-stamp the start time; the auto-manager's startup grace reads it.
    pub fn restart_started(&self, session_time: u64) {
        self.inner.lock().started = session_time;
    }

    pub fn started(&self) -> u64 {
        self.inner.lock().started
    }

    pub fn is_auto_managed(&self) -> bool {
        self.inner.lock().auto_managed
    }

    pub fn set_auto_managed(&self, v: bool) {
        self.inner.lock().auto_managed = v;
    }

    pub fn has_error(&self) -> bool {
        self.inner.lock().error.is_some()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn set_error(&self, msg: impl Into<String>) {
        self.inner.lock().error = Some(msg.into());
    }

    pub fn clear_error(&self) {
        self.inner.lock().error = None;
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn set_finished(&self, v: bool) {
        let mut g = self.inner.lock();
        g.finished = v;
        if v {
            g.state = TorrentState::Seeding;
        }
    }

    pub fn start_checking(&self) {
        let mut g = self.inner.lock();
        g.state = TorrentState::Checking;
        g.checking_requested = true;
    }

    pub fn checking_requested(&self) -> bool {
        self.inner.lock().checking_requested
    }

    // peer admission --------------------------------------------------

    pub fn allows_peers(&self) -> bool {
        self.inner.lock().allow_peers
    }

    pub fn set_allow_peers(&self, allow: bool, graceful: bool) {
        let mut g = self.inner.lock();
        if g.allow_peers == allow {
            return;
        }
        g.allow_peers = allow;
        if !allow && !graceful {
            Self::disconnect_all_locked(&mut g, DisconnectReason::StoppingTorrent);
        }
    }

    pub fn set_announce_to_dht(&self, v: bool) {
        self.inner.lock().announce_to_dht = v;
    }

    pub fn set_announce_to_trackers(&self, v: bool) {
        self.inner.lock().announce_to_trackers = v;
    }

    pub fn set_announce_to_lsd(&self, v: bool) {
        self.inner.lock().announce_to_lsd = v;
    }

    pub fn announce_to_dht(&self) -> bool {
        self.inner.lock().announce_to_dht
    }

    pub fn announce_to_trackers(&self) -> bool {
        self.inner.lock().announce_to_trackers
    }

    pub fn announce_to_lsd(&self) -> bool {
        self.inner.lock().announce_to_lsd
    }

    pub fn queue_position(&self) -> i32 {
        self.inner.lock().queue_position
    }

    pub fn set_queue_position(&self, p: i32) {
        self.inner.lock().queue_position = p;
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.lock().sequence
    }

    // load / pin ------------------------------------------------------

    pub fn is_pinned(&self) -> bool {
        self.inner.lock().pinned
    }

    pub fn set_pinned(&self, v: bool) {
        self.inner.lock().pinned = v;
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    /// Whether the torrent wants its metadata resident at all.
    pub fn should_be_loaded(&self) -> bool {
        let g = self.inner.lock();
        !g.aborted && !g.paused
    }

    /// Bring metadata into memory. Returns false on garbage input.
    pub fn load(&self, metadata: Vec<u8>) -> bool {
        if metadata.is_empty() {
            return false;
        }
        let mut g = self.inner.lock();
        g.metadata = Some(metadata);
        g.loaded = true;
        true
    }

    pub fn unload(&self) {
        let mut g = self.inner.lock();
        g.metadata = None;
        g.loaded = false;
    }

    pub fn valid_metadata(&self) -> bool {
        self.inner.lock().metadata.is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    pub fn abort(&self) {
        let mut g = self.inner.lock();
        if g.aborted {
            return;
        }
        g.aborted = true;
        g.allow_peers = false;
        Self::disconnect_all_locked(&mut g, DisconnectReason::StoppingTorrent);
    }

    pub fn ignores_ip_filter(&self) -> bool {
        self.inner.lock().ignore_ip_filter
    }

    pub fn ssl_context(&self) -> Option<SslContext> {
        self.inner.lock().ssl.clone()
    }

    pub fn is_ssl_torrent(&self) -> bool {
        self.inner.lock().ssl.is_some()
    }

    // peers -----------------------------------------------------------

    pub fn max_connections(&self) -> usize {
        self.inner.lock().max_connections
    }

    pub fn set_max_connections(&self, n: usize) {
        self.inner.lock().max_connections = n;
    }

    pub fn add_peer(&self, p: &Arc<PeerConnection>) {
        let mut g = self.inner.lock();
        g.peers.retain(|w| w.strong_count() > 0);
        g.peers.push(Arc::downgrade(p));
    }

    pub fn remove_peer(&self, p: &Arc<PeerConnection>) {
        let mut g = self.inner.lock();
        if !p.is_choked() && g.num_uploads > 0 {
            g.num_uploads -= 1;
        }
        g.peers.retain(|w| match w.upgrade() {
            Some(other) => !Arc::ptr_eq(&other, p),
            None => false,
        });
    }

    pub fn num_peers(&self) -> usize {
        let mut g = self.inner.lock();
        g.peers.retain(|w| w.strong_count() > 0);
        g.peers.len()
    }

    pub fn peers(&self) -> Vec<Arc<PeerConnection>> {
        let g = self.inner.lock();
        g.peers.iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn add_connect_candidates(&self, peers: impl IntoIterator<Item = SocketAddr>) {
        let mut g = self.inner.lock();
        for addr in peers {
            if !g.candidates.contains(&addr) {
                g.candidates.push_back(addr);
            }
        }
    }

    pub fn num_connect_candidates(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    pub fn next_connect_candidate(&self) -> Option<SocketAddr> {
        self.inner.lock().candidates.pop_front()
    }

    pub fn want_peers(&self) -> bool {
        let g = self.inner.lock();
        g.allow_peers
            && !g.paused
            && !g.aborted
            && !g.candidates.is_empty()
            && g.peers.len() < g.max_connections
    }

    pub fn want_peers_download(&self) -> bool {
        !self.is_finished() && self.want_peers()
    }

    pub fn want_peers_finished(&self) -> bool {
        self.is_finished() && self.want_peers()
    }

    pub fn want_tick(&self) -> bool {
        let g = self.inner.lock();
        !g.aborted && (!g.peers.is_empty() || !g.paused)
    }

    // choking ---------------------------------------------------------

    /// Torrent-level unchoke budget left. A `max_uploads` of zero is
    /// unlimited.
    pub fn free_upload_slots(&self) -> bool {
        let g = self.inner.lock();
        g.max_uploads == 0 || g.num_uploads < g.max_uploads
    }

    /// Unchoke `p`. Returns false when the peer cannot be unchoked right
    /// now (disconnecting, graceful pause, torrent shutting down).
    pub fn unchoke_peer(&self, p: &PeerConnection, _optimistic: bool) -> bool {
        let mut g = self.inner.lock();
        if g.aborted || g.graceful_pause || p.is_disconnecting() {
            return false;
        }
        if p.set_choked(false) {
            g.num_uploads += 1;
            p.send_unchoke();
        }
        true
    }

    pub fn choke_peer(&self, p: &PeerConnection) {
        let mut g = self.inner.lock();
        if p.set_choked(true) {
            g.num_uploads = g.num_uploads.saturating_sub(1);
            p.send_choke();
        }
    }

    /// Disconnect the `count` worst peers (peer turnover, over-limit
    /// recovery). Returns how many were told to go away.
    pub fn disconnect_peers(&self, count: usize, reason: DisconnectReason) -> usize {
        let peers = self.peers();
        let mut dropped = 0;
        for p in peers {
            if dropped == count {
                break;
            }
            if p.is_disconnecting() {
                continue;
            }
            p.disconnect(reason);
            dropped += 1;
        }
        dropped
    }

    fn disconnect_all_locked(g: &mut Inner, reason: DisconnectReason) {
        for w in g.peers.iter() {
            if let Some(p) = w.upgrade() {
                p.disconnect(reason);
            }
        }
    }

    // accounting ------------------------------------------------------

    pub fn add_uploaded(&self, bytes: i64) {
        self.inner.lock().rates.all_time_upload += bytes;
    }

    pub fn add_downloaded(&self, bytes: i64) {
        self.inner.lock().rates.all_time_download += bytes;
    }

    pub fn upload_payload_rate(&self) -> i64 {
        self.inner.lock().rates.upload_payload_rate
    }

    pub fn download_payload_rate(&self) -> i64 {
        self.inner.lock().rates.download_payload_rate
    }

    /// Per-second torrent tick: refresh the payload rates and age the
    /// seeding clock. `residual_s` carries fractional-second drift from
    /// the session's tick loop.
    pub fn second_tick(&self, elapsed_ms: u64, residual_s: u64) {
        let mut g = self.inner.lock();
        let elapsed_ms = elapsed_ms.max(1) as i64;
        let up = g.rates.all_time_upload - g.rates.last_tick_upload;
        let down = g.rates.all_time_download - g.rates.last_tick_download;
        g.rates.upload_payload_rate = up * 1000 / elapsed_ms;
        g.rates.download_payload_rate = down * 1000 / elapsed_ms;
        g.rates.last_tick_upload = g.rates.all_time_upload;
        g.rates.last_tick_download = g.rates.all_time_download;

        let secs = (elapsed_ms as u64 / 1000) + residual_s;
        if !g.paused {
            g.rates.active_time += secs;
            if g.finished {
                g.rates.seeding_time += secs;
            }
        }
    }

    /// Shift session-time stamps back when the epoch steps (wrap defense).
    pub fn step_session_time(&self, secs: u64) {
        let mut g = self.inner.lock();
        g.started = g.started.saturating_sub(secs);
        for w in g.peers.iter() {
            if let Some(p) = w.upgrade() {
                p.step_session_time(secs);
            }
        }
    }

    /// Rank among seeds for the auto-manager: higher ranks keep their
    /// active slots. Fresh seeds, seeds that still owe ratio, and seeds
    /// with demand outrank the rest.
    pub fn seed_rank(&self, _settings: &SessionSettings) -> u32 {
        const FRESH_SEED_SECS: u64 = 24 * 3600;
        let g = self.inner.lock();
        if !g.finished {
            return 0;
        }
        let mut ret = 0u32;
        if g.rates.seeding_time < FRESH_SEED_SECS {
            ret |= 1 << 2;
        }
        if g.rates.all_time_download > 0 && g.rates.all_time_upload < g.rates.all_time_download {
            ret |= 1 << 1;
        }
        if !g.candidates.is_empty() || !g.peers.is_empty() {
            ret |= 1;
        }
        ret
    }

    pub fn status(&self) -> TorrentStatus {
        let g = self.inner.lock();
        TorrentStatus {
            info_hash: self.info_hash,
            name: g.name.clone(),
            state: g.state,
            paused: g.paused || g.session_paused,
            finished: g.finished,
            num_peers: g.peers.iter().filter(|w| w.strong_count() > 0).count(),
            queue_position: g.queue_position,
            upload_payload_rate: g.rates.upload_payload_rate,
            download_payload_rate: g.rates.download_payload_rate,
            all_time_upload: g.rates.all_time_upload,
            all_time_download: g.rates.all_time_download,
            error: g.error.clone(),
        }
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("info_hash", &hex::encode(self.info_hash))
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketKind;

    fn torrent(seq: u64) -> Arc<Torrent> {
        let mut ih = [0u8; 20];
        ih[0] = seq as u8;
        Torrent::new(AddTorrentParams::with_info_hash(ih), seq, 0)
    }

    fn peer(addr: &str) -> (Arc<PeerConnection>, tokio::sync::mpsc::UnboundedReceiver<crate::peer::PeerCommand>) {
        PeerConnection::new(
            addr.parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            SocketKind::Tcp,
            false,
            0,
        )
    }

    #[test]
    fn pause_resume_idempotent() {
        let t = torrent(0);
        t.pause(false);
        t.pause(false);
        assert!(t.is_paused());
        assert!(!t.allows_peers());
        t.resume();
        t.resume();
        assert!(!t.is_paused());
        assert!(t.allows_peers());
    }

    #[test]
    fn unchoke_twice_counts_once() {
        let t = torrent(0);
        let (p, _rx) = peer("10.0.0.1:1");
        t.add_peer(&p);
        assert!(t.unchoke_peer(&p, false));
        assert!(t.unchoke_peer(&p, false));
        assert!(!p.is_choked());
        // a single upload slot is consumed
        t.choke_peer(&p);
        assert!(t.free_upload_slots());
    }

    #[test]
    fn want_peers_needs_candidates_and_room() {
        let t = torrent(0);
        assert!(!t.want_peers());
        t.add_connect_candidates(["10.0.0.9:6881".parse().unwrap()]);
        assert!(t.want_peers());
        t.pause(false);
        assert!(!t.want_peers());
    }

    #[test]
    fn dead_peers_are_pruned() {
        let t = torrent(0);
        {
            let (p, _rx) = peer("10.0.0.1:1");
            t.add_peer(&p);
            assert_eq!(t.num_peers(), 1);
        }
        assert_eq!(t.num_peers(), 0);
    }

    #[test]
    fn second_tick_computes_rates() {
        let t = torrent(0);
        t.add_downloaded(10_000);
        t.add_uploaded(5_000);
        t.second_tick(1000, 0);
        assert_eq!(t.download_payload_rate(), 10_000);
        assert_eq!(t.upload_payload_rate(), 5_000);
        // rates decay to zero with no traffic
        t.second_tick(1000, 0);
        assert_eq!(t.download_payload_rate(), 0);
    }

    #[test]
    fn seed_rank_orders_fresh_and_owing_seeds_first() {
        let settings = SessionSettings::default();
        let fresh = torrent(1);
        fresh.set_finished(true);
        let downloader = torrent(2);
        assert!(fresh.seed_rank(&settings) > downloader.seed_rank(&settings));
    }

    #[test]
    fn graceful_allow_peers_keeps_connections() {
        let t = torrent(0);
        let (p, mut rx) = peer("10.0.0.1:1");
        t.add_peer(&p);
        t.set_allow_peers(false, true);
        assert!(!t.allows_peers());
        assert!(!p.is_disconnecting());
        t.set_allow_peers(true, false);
        t.set_allow_peers(false, false);
        assert!(p.is_disconnecting());
        let _ = rx.try_recv();
    }
}
