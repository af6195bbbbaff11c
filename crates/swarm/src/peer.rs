use crate::error::DisconnectReason;
use crate::net::SocketKind;
use crate::peer_class::PeerClassSet;
use crate::torrent::Torrent;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Starting guess for a peer's reciprocation rate (BitTyrant), bytes/s.
const DEFAULT_EST_RECIPROCATION_RATE: i64 = 16_000;
/// Percent nudges applied when a peer does / does not reciprocate.
const INCREASE_EST_RECIPROCATION_RATE: i64 = 20;
const DECREASE_EST_RECIPROCATION_RATE: i64 = 3;

/// Commands posted from the scheduler to the peer's I/O task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// Begin the handshake (the connection is registered with the session).
    Start,
    Choke,
    Unchoke,
    /// Once the handshake completes, disconnect or displace another peer.
    ExceedsLimit,
    Disconnect(DisconnectReason),
}

/// Payload counters shared between the I/O task and the scheduler.
#[derive(Debug, Default)]
pub struct PeerStats {
    download_payload_rate: AtomicI64,
    upload_payload_rate: AtomicI64,
    total_payload_download: AtomicI64,
    total_payload_upload: AtomicI64,
    downloaded_last_round: AtomicI64,
    uploaded_last_round: AtomicI64,
}

impl PeerStats {
    pub fn download_payload_rate(&self) -> i64 {
        self.download_payload_rate.load(Relaxed)
    }

    pub fn upload_payload_rate(&self) -> i64 {
        self.upload_payload_rate.load(Relaxed)
    }

    pub fn total_payload_download(&self) -> i64 {
        self.total_payload_download.load(Relaxed)
    }

    pub fn total_payload_upload(&self) -> i64 {
        self.total_payload_upload.load(Relaxed)
    }

    pub fn downloaded_in_last_round(&self) -> i64 {
        self.downloaded_last_round.load(Relaxed)
    }

    pub fn uploaded_in_last_round(&self) -> i64 {
        self.uploaded_last_round.load(Relaxed)
    }

    pub fn add_downloaded(&self, bytes: i64) {
        self.total_payload_download.fetch_add(bytes, Relaxed);
        self.downloaded_last_round.fetch_add(bytes, Relaxed);
    }

    pub fn add_uploaded(&self, bytes: i64) {
        self.total_payload_upload.fetch_add(bytes, Relaxed);
        self.uploaded_last_round.fetch_add(bytes, Relaxed);
    }

    pub fn set_rates(&self, down: i64, up: i64) {
        self.download_payload_rate.store(down, Relaxed);
        self.upload_payload_rate.store(up, Relaxed);
    }
}

/// Scheduler-visible state of one peer connection. The wire protocol runs
/// in a separate I/O task fed through the command channel; everything the
/// choking, admission and turnover passes read lives here as atomics so
/// the scheduler never blocks on a peer.
pub struct PeerConnection {
    addr: SocketAddr,
    local_addr: SocketAddr,
    kind: SocketKind,
    outgoing: bool,
    web_seed: bool,
    connected_at: u64,

    classes: Mutex<PeerClassSet>,
    torrent: Mutex<Weak<Torrent>>,

    choked: AtomicBool,
    peer_interested: AtomicBool,
    peer_choked_us: AtomicBool,
    interesting: AtomicBool,
    connecting: AtomicBool,
    disconnecting: AtomicBool,
    in_handshake: AtomicBool,
    ignore_unchoke: AtomicBool,
    exceeds_limit: AtomicBool,

    optimistic: AtomicBool,
    last_optimistic: AtomicU64,
    est_reciprocation_rate: AtomicI64,

    upload_queue: AtomicUsize,
    download_queue: AtomicUsize,
    request_queue: AtomicUsize,

    stats: PeerStats,
    cmd: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerConnection {
    /// Create the shared half of a connection; the caller owns the command
    /// receiver and runs the I/O task.
    pub fn new(
        addr: SocketAddr,
        local_addr: SocketAddr,
        kind: SocketKind,
        outgoing: bool,
        session_time: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            addr,
            local_addr,
            kind,
            outgoing,
            web_seed: false,
            connected_at: session_time,
            classes: Mutex::new(PeerClassSet::default()),
            torrent: Mutex::new(Weak::new()),
            choked: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            peer_choked_us: AtomicBool::new(true),
            interesting: AtomicBool::new(false),
            connecting: AtomicBool::new(outgoing),
            disconnecting: AtomicBool::new(false),
            in_handshake: AtomicBool::new(true),
            ignore_unchoke: AtomicBool::new(false),
            exceeds_limit: AtomicBool::new(false),
            optimistic: AtomicBool::new(false),
            last_optimistic: AtomicU64::new(0),
            est_reciprocation_rate: AtomicI64::new(DEFAULT_EST_RECIPROCATION_RATE),
            upload_queue: AtomicUsize::new(0),
            download_queue: AtomicUsize::new(0),
            request_queue: AtomicUsize::new(0),
            stats: PeerStats::default(),
            cmd: tx,
        });
        (conn, rx)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_kind(&self) -> SocketKind {
        self.kind
    }

    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn is_web_seed(&self) -> bool {
        self.web_seed
    }

    pub fn connected_time(&self) -> u64 {
        self.connected_at
    }

    pub fn statistics(&self) -> &PeerStats {
        &self.stats
    }

    pub fn associated_torrent(&self) -> Option<Arc<Torrent>> {
        self.torrent.lock().upgrade()
    }

    pub fn attach_torrent(&self, t: &Arc<Torrent>) {
        *self.torrent.lock() = Arc::downgrade(t);
    }

    pub fn set_classes(&self, set: PeerClassSet, ignore_unchoke: bool) {
        *self.classes.lock() = set;
        self.ignore_unchoke.store(ignore_unchoke, Relaxed);
    }

    pub fn classes(&self) -> PeerClassSet {
        self.classes.lock().clone()
    }

    // choke state -----------------------------------------------------

    pub fn is_choked(&self) -> bool {
        self.choked.load(Relaxed)
    }

    /// Returns true when the flag actually changed.
    pub fn set_choked(&self, choked: bool) -> bool {
        let prev = self.choked.swap(choked, Relaxed);
        prev != choked
    }

    pub fn is_peer_interested(&self) -> bool {
        self.peer_interested.load(Relaxed)
    }

    pub fn set_peer_interested(&self, v: bool) {
        self.peer_interested.store(v, Relaxed);
    }

    /// Whether the remote currently chokes us.
    pub fn has_peer_choked(&self) -> bool {
        self.peer_choked_us.load(Relaxed)
    }

    pub fn set_peer_choked(&self, v: bool) {
        self.peer_choked_us.store(v, Relaxed);
    }

    /// Whether we want data from this peer.
    pub fn is_interesting(&self) -> bool {
        self.interesting.load(Relaxed)
    }

    pub fn set_interesting(&self, v: bool) {
        self.interesting.store(v, Relaxed);
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Relaxed)
    }

    pub fn set_connected(&self) {
        self.connecting.store(false, Relaxed);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Relaxed)
    }

    pub fn in_handshake(&self) -> bool {
        self.in_handshake.load(Relaxed)
    }

    pub fn set_handshake_done(&self) {
        self.in_handshake.store(false, Relaxed);
    }

    pub fn ignore_unchoke_slots(&self) -> bool {
        self.ignore_unchoke.load(Relaxed)
    }

    pub fn is_optimistically_unchoked(&self) -> bool {
        self.optimistic.load(Relaxed)
    }

    pub fn set_optimistically_unchoked(&self, v: bool) {
        self.optimistic.store(v, Relaxed);
    }

    pub fn last_optimistically_unchoked(&self) -> u64 {
        self.last_optimistic.load(Relaxed)
    }

    pub fn set_last_optimistically_unchoked(&self, session_time: u64) {
        self.last_optimistic.store(session_time, Relaxed);
    }

    // queues (mixed-mode accounting) ----------------------------------

    pub fn upload_queue_len(&self) -> usize {
        self.upload_queue.load(Relaxed)
    }

    pub fn download_queue_len(&self) -> usize {
        self.download_queue.load(Relaxed) + self.request_queue.load(Relaxed)
    }

    pub fn set_queue_lens(&self, upload: usize, download: usize, requests: usize) {
        self.upload_queue.store(upload, Relaxed);
        self.download_queue.store(download, Relaxed);
        self.request_queue.store(requests, Relaxed);
    }

    // bittyrant -------------------------------------------------------

    pub fn est_reciprocation_rate(&self) -> i64 {
        self.est_reciprocation_rate.load(Relaxed)
    }

    pub fn increase_est_reciprocation_rate(&self) {
        let r = self.est_reciprocation_rate.load(Relaxed);
        self.est_reciprocation_rate
            .store(r + r * INCREASE_EST_RECIPROCATION_RATE / 100, Relaxed);
    }

    pub fn decrease_est_reciprocation_rate(&self) {
        let r = self.est_reciprocation_rate.load(Relaxed);
        self.est_reciprocation_rate
            .store(r - r * DECREASE_EST_RECIPROCATION_RATE / 100, Relaxed);
    }

    // lifecycle -------------------------------------------------------

    pub fn start(&self) {
        let _ = self.cmd.send(PeerCommand::Start);
    }

    /// Mark this peer over-limit: after the handshake it must release
    /// itself or displace another peer.
    pub fn peer_exceeds_limit(&self) {
        self.exceeds_limit.store(true, Relaxed);
        let _ = self.cmd.send(PeerCommand::ExceedsLimit);
    }

    pub fn exceeds_limit(&self) -> bool {
        self.exceeds_limit.load(Relaxed)
    }

    pub fn send_choke(&self) {
        let _ = self.cmd.send(PeerCommand::Choke);
    }

    pub fn send_unchoke(&self) {
        let _ = self.cmd.send(PeerCommand::Unchoke);
    }

    /// Idempotent; the first call wins.
    pub fn disconnect(&self, reason: DisconnectReason) {
        if self.disconnecting.swap(true, Relaxed) {
            return;
        }
        let _ = self.cmd.send(PeerCommand::Disconnect(reason));
    }

    /// Reset the last-round counters after an unchoke pass.
    pub fn reset_choke_counters(&self) {
        self.stats.downloaded_last_round.store(0, Relaxed);
        self.stats.uploaded_last_round.store(0, Relaxed);
    }

    /// Step timestamps back when the session epoch moves (wrap defense).
    pub fn step_session_time(&self, secs: u64) {
        let last = self.last_optimistic.load(Relaxed);
        self.last_optimistic.store(last.saturating_sub(secs), Relaxed);
    }

    // comparators -----------------------------------------------------

    /// Main unchoke order: descending download rate, then descending
    /// cumulative upload.
    pub fn unchoke_compare(a: &Arc<PeerConnection>, b: &Arc<PeerConnection>) -> Ordering {
        let da = a.stats.downloaded_in_last_round();
        let db = b.stats.downloaded_in_last_round();
        db.cmp(&da)
            .then_with(|| b.stats.total_payload_upload().cmp(&a.stats.total_payload_upload()))
    }

    /// Rate-based order: descending upload to the peer in the last round.
    pub fn upload_rate_compare(a: &Arc<PeerConnection>, b: &Arc<PeerConnection>) -> Ordering {
        b.stats.uploaded_in_last_round().cmp(&a.stats.uploaded_in_last_round())
    }

    /// BitTyrant order: descending download-per-reciprocation ratio.
    pub fn bittyrant_unchoke_compare(
        a: &Arc<PeerConnection>,
        b: &Arc<PeerConnection>,
    ) -> Ordering {
        let da = a.stats.downloaded_in_last_round().max(0) as u128;
        let db = b.stats.downloaded_in_last_round().max(0) as u128;
        let ra = a.est_reciprocation_rate().max(1) as u128;
        let rb = b.est_reciprocation_rate().max(1) as u128;
        (db * ra).cmp(&(da * rb))
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.addr)
            .field("kind", &self.kind)
            .field("choked", &self.is_choked())
            .field("interested", &self.is_peer_interested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> (Arc<PeerConnection>, mpsc::UnboundedReceiver<PeerCommand>) {
        PeerConnection::new(
            addr.parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            SocketKind::Tcp,
            false,
            0,
        )
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (p, mut rx) = peer("10.0.0.1:6881");
        p.disconnect(DisconnectReason::TimedOut);
        p.disconnect(DisconnectReason::TimedOut);
        assert!(p.is_disconnecting());
        assert_eq!(rx.try_recv().ok(), Some(PeerCommand::Disconnect(DisconnectReason::TimedOut)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_choked_reports_change_once() {
        let (p, _rx) = peer("10.0.0.1:6881");
        assert!(p.is_choked());
        assert!(p.set_choked(false));
        assert!(!p.set_choked(false));
        assert!(p.set_choked(true));
    }

    #[test]
    fn unchoke_order_prefers_fast_downloaders() {
        let (a, _ra) = peer("10.0.0.1:1");
        let (b, _rb) = peer("10.0.0.2:2");
        a.statistics().add_downloaded(5000);
        b.statistics().add_downloaded(100);
        let mut v = vec![b.clone(), a.clone()];
        v.sort_by(PeerConnection::unchoke_compare);
        assert_eq!(v[0].remote_addr(), a.remote_addr());
    }

    #[test]
    fn bittyrant_order_uses_roi() {
        let (a, _ra) = peer("10.0.0.1:1");
        let (b, _rb) = peer("10.0.0.2:2");
        // a: 4000 down at est 16000; b: 3000 down at est 4000 (better ROI)
        a.statistics().add_downloaded(4000);
        b.statistics().add_downloaded(3000);
        b.est_reciprocation_rate.store(4000, Relaxed);
        let mut v = vec![a.clone(), b.clone()];
        v.sort_by(PeerConnection::bittyrant_unchoke_compare);
        assert_eq!(v[0].remote_addr(), b.remote_addr());
    }

    #[test]
    fn est_reciprocation_nudges() {
        let (p, _rx) = peer("10.0.0.1:1");
        let start = p.est_reciprocation_rate();
        p.increase_est_reciprocation_rate();
        assert_eq!(p.est_reciprocation_rate(), start + start * 20 / 100);
        let cur = p.est_reciprocation_rate();
        p.decrease_est_reciprocation_rate();
        assert_eq!(p.est_reciprocation_rate(), cur - cur * 3 / 100);
    }
}
