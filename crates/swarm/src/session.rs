use crate::alert::{Alert, AlertQueue, BlockReason, PerformanceIssue, SessionStatsSnapshot};
use crate::auto_manage::{recalculate_auto_managed_torrents, AutoManageCtx};
use crate::bandwidth::{BandwidthManager, DOWNLOAD_CHANNEL, UPLOAD_CHANNEL};
use crate::clock::{generate_peer_id, SessionClock, SessionRng, SESSION_TIME_WRAP_THRESHOLD};
use crate::config::{MixedModeAlgorithm, SessionSettings};
use crate::dht::Dht;
use crate::disk::DiskThreads;
use crate::error::{DisconnectReason, SwarmError};
use crate::filter::{privileged_port_filter, IpRangeFilter, PeerClassTypeFilter, PortFilter, BLOCKED};
use crate::half_open::{ConnectTicket, HalfOpen};
use crate::net::listen::ListenSocketSet;
use crate::net::lsd::Lsd;
use crate::net::transport::{from_tcp, Transport};
use crate::net::SocketKind;
use crate::peer::{PeerCommand, PeerConnection};
use crate::peer_class::{
    connection_limit_factor, ignore_unchoke_slots_set, PeerClassId, PeerClassPool, PeerClassSet,
};
use crate::portmap::{NatpmpResponse, PortMapper};
use crate::registry::{TorrentRegistry, UserLoadFn};
use crate::state::{load_state, save_state};
use crate::torrent::{AddTorrentParams, Torrent, TorrentStatus};
use crate::tracker::{TrackerManager, TrackerRequest};
use crate::unchoke::{
    recalculate_optimistic_unchoke_slots, recalculate_unchoke_slots, UnchokeCtx,
};
use crate::InfoHash;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outbound connect attempts a prioritized torrent gets.
const PRIO_CONNECT_ATTEMPTS: i32 = 10;
/// Epoch step applied by the timestamp-wrap defense.
const WRAP_STEP_SECS: u64 = 4 * 3600;

/// Commands posted from any thread to the scheduler.
pub enum SessionCommand {
    AddTorrent(Box<AddTorrentParams>, oneshot::Sender<Result<InfoHash, SwarmError>>),
    RemoveTorrent(InfoHash),
    PauseTorrent(InfoHash),
    ResumeTorrent(InfoHash),
    Pause,
    Resume,
    Abort(oneshot::Sender<()>),
    ApplySettings(Box<SessionSettings>),
    SetIpFilter(IpRangeFilter),
    SetPeerClassFilter(IpRangeFilter),
    SetPeerClassTypeFilter(PeerClassTypeFilter),
    CreatePeerClass(String, oneshot::Sender<PeerClassId>),
    DeletePeerClass(PeerClassId),
    SetKey(u32),
    PopAlerts(oneshot::Sender<Vec<Alert>>),
    SaveState(u32, oneshot::Sender<Vec<u8>>),
    LoadState(Vec<u8>),
    PostTorrentUpdates,
    PostSessionStats,
    PrioritizeConnections(InfoHash),
    QueueTrackerRequest(TrackerRequest),
    SetUserLoadFunction(UserLoadFn),
}

/// Events posted back to the scheduler by its own I/O tasks.
pub enum SessionEvent {
    Incoming {
        transport: Transport,
        local: SocketAddr,
        remote: SocketAddr,
        kind: SocketKind,
        /// SNI server name delivered by the TLS handshake layer.
        ssl_sni: Option<String>,
    },
    AcceptError {
        kind: SocketKind,
        error: std::io::Error,
    },
    ConnectFinished {
        ticket: ConnectTicket,
        info_hash: InfoHash,
        addr: SocketAddr,
        result: std::io::Result<TcpStream>,
    },
    PeerClosed {
        peer: Arc<PeerConnection>,
        reason: DisconnectReason,
    },
    UdpPacket {
        data: Vec<u8>,
        from: SocketAddr,
    },
    UdpUnreachable(SocketAddr),
    LsdPeer {
        info_hash: InfoHash,
        addr: SocketAddr,
    },
    DhtPeers {
        info_hash: InfoHash,
        peers: Vec<SocketAddr>,
    },
    Natpmp(NatpmpResponse),
}

/// Outcome of the accept-path connection-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admit,
    /// Admitted, but the peer must release itself after the handshake.
    AdmitExceedsLimit,
    Reject,
}

/// The admitted connection limit weighed by the peer class'
/// connection-limit factor, with the configured slack on top.
pub(crate) fn admission_check(
    num_connections: usize,
    connections_limit: usize,
    connections_slack: usize,
    limit_factor: u32,
) -> Admission {
    let limit = connections_limit as u64 * 100 / limit_factor as u64;
    if num_connections as u64 >= limit + connections_slack as u64 {
        Admission::Reject
    } else if num_connections as u64 >= limit {
        Admission::AdmitExceedsLimit
    } else {
        Admission::Admit
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    incoming_connections: u64,
    connection_attempts: u64,
}

pub(crate) struct SessionInner {
    settings: SessionSettings,
    peer_id: [u8; 20],
    key: u32,
    clock: SessionClock,
    rng: SessionRng,

    classes: PeerClassPool,
    class_filter: IpRangeFilter,
    class_type_filter: PeerClassTypeFilter,
    ip_filter: IpRangeFilter,
    port_filter: PortFilter,

    registry: TorrentRegistry,
    connections: Vec<Arc<PeerConnection>>,
    undead_peers: Vec<Arc<PeerConnection>>,
    half_open: HalfOpen,
    upload_rate: BandwidthManager,
    download_rate: BandwidthManager,
    alerts: AlertQueue,
    listen: ListenSocketSet,
    portmap: PortMapper,
    dht: Option<Dht>,
    lsd: Option<Lsd>,
    tracker: TrackerManager,
    disk: DiskThreads,

    paused: bool,
    aborted: bool,

    num_unchoked: usize,
    allowed_upload_slots: i32,
    unchoke_scaler: i32,
    optimistic_unchoke_scaler: i32,
    auto_manage_scaler: i32,
    disconnect_scaler: i32,
    dht_announce_scaler: i64,
    lsd_announce_scaler: i64,
    warned_bittyrant: bool,

    next_downloading_connect_torrent: usize,
    next_finished_connect_torrent: usize,
    download_connect_attempts: u32,
    boost_connections: i32,
    prio_torrents: VecDeque<(Weak<Torrent>, i32)>,
    next_dht_torrent: usize,
    next_lsd_torrent: usize,
    next_outgoing_port: u16,
    pending_connects: HashMap<ConnectTicket, InfoHash>,

    last_tick: Instant,
    last_second_tick: Instant,
    tick_residual: i64,
    peak_up_rate: i64,
    peak_down_rate: i64,
    upload_rate_estimate: i64,
    download_rate_estimate: i64,
    counters: StatsCounters,

    accept_tasks: Vec<tokio::task::JoinHandle<()>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionInner {
    fn new(mut settings: SessionSettings, event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let mut rng = SessionRng::new();
        if settings.anonymous_mode {
            // anonymous sessions advertise nothing recognisable
            settings.peer_fingerprint = "-SW0000-".to_string();
        }
        let peer_id = generate_peer_id(&settings.peer_fingerprint, &mut rng);
        let key = rng.next_u32();

        let classes = PeerClassPool::with_builtins();
        let class_filter = crate::filter::default_peer_class_filter(classes.local_class());
        let mut class_type_filter = PeerClassTypeFilter::default();
        // plain TCP peers always belong to the tcp class (mixed-mode
        // throttling applies to them)
        class_type_filter.add(SocketKind::Tcp, classes.tcp_class());
        class_type_filter.add(SocketKind::TcpSsl, classes.tcp_class());

        let port_filter = if settings.no_connect_privileged_ports {
            privileged_port_filter()
        } else {
            PortFilter::default()
        };

        let half_open = HalfOpen::new(settings.half_open_limit);
        let unchoke_slots = if settings.unchoke_slots_limit < 0 {
            i32::MAX
        } else {
            settings.unchoke_slots_limit
        };

        let now = Instant::now();
        Self {
            peer_id,
            key,
            clock: SessionClock::new(),
            rng,
            classes,
            class_filter,
            class_type_filter,
            ip_filter: IpRangeFilter::default(),
            port_filter,
            registry: TorrentRegistry::new(),
            connections: Vec::new(),
            undead_peers: Vec::new(),
            half_open,
            upload_rate: BandwidthManager::new(UPLOAD_CHANNEL),
            download_rate: BandwidthManager::new(DOWNLOAD_CHANNEL),
            alerts: AlertQueue::default(),
            listen: ListenSocketSet::new(),
            portmap: PortMapper::new(),
            dht: None,
            lsd: None,
            tracker: TrackerManager::new(),
            disk: DiskThreads::new(2),
            paused: false,
            aborted: false,
            num_unchoked: 0,
            allowed_upload_slots: unchoke_slots,
            unchoke_scaler: settings.unchoke_interval,
            optimistic_unchoke_scaler: settings.optimistic_unchoke_interval,
            auto_manage_scaler: settings.auto_manage_interval,
            disconnect_scaler: settings.peer_turnover_interval,
            dht_announce_scaler: 0,
            lsd_announce_scaler: 0,
            warned_bittyrant: false,
            next_downloading_connect_torrent: 0,
            next_finished_connect_torrent: 0,
            download_connect_attempts: 0,
            boost_connections: 0,
            prio_torrents: VecDeque::new(),
            next_dht_torrent: 0,
            next_lsd_torrent: 0,
            next_outgoing_port: 0,
            pending_connects: HashMap::new(),
            last_tick: now,
            last_second_tick: now,
            tick_residual: 0,
            peak_up_rate: 0,
            peak_down_rate: 0,
            upload_rate_estimate: 0,
            download_rate_estimate: 0,
            counters: StatsCounters::default(),
            accept_tasks: Vec::new(),
            settings,
            event_tx,
        }
    }

    fn num_connections(&self) -> usize {
        self.connections.len()
    }

    // -----------------------------------------------------------------
    // startup
    // -----------------------------------------------------------------

    async fn start(&mut self) {
        self.open_listen_sockets().await;

        let event_tx = self.event_tx.clone();
        match Lsd::start(move |info_hash, addr| {
            let _ = event_tx.send(SessionEvent::LsdPeer { info_hash, addr });
        }) {
            Ok(lsd) => self.lsd = Some(lsd),
            Err(e) => debug!(error = %e, "lsd unavailable"),
        }

        if self.settings.dht_enabled {
            self.start_dht();
        }

        self.start_portmap().await;
    }

    async fn open_listen_sockets(&mut self) {
        // stop accept loops still serving the previous socket set
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        self.listen.open(&self.settings, &mut self.alerts).await;

        for sock in self.listen.sockets() {
            let listener = sock.listener.clone();
            let kind = sock.kind();
            let event_tx = self.event_tx.clone();
            self.accept_tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            stream.set_nodelay(true).ok();
                            let local = stream
                                .local_addr()
                                .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("literal addr"));
                            let ev = SessionEvent::Incoming {
                                transport: from_tcp(stream),
                                local,
                                remote,
                                kind,
                                ssl_sni: None,
                            };
                            if event_tx.send(ev).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            if event_tx.send(SessionEvent::AcceptError { kind, error: e }).is_err()
                            {
                                return;
                            }
                            // re-arm without spinning on a persistent error
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }));
        }

        if let Some(udp) = self.listen.udp_socket() {
            let event_tx = self.event_tx.clone();
            self.accept_tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; 2048];
                loop {
                    match udp.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            let ev =
                                SessionEvent::UdpPacket { data: buf[..n].to_vec(), from };
                            if event_tx.send(ev).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "udp recv failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }));
        }
    }

    fn start_dht(&mut self) {
        let udp = match self.listen.udp_socket() {
            Some(s) => s,
            None => return,
        };
        let send: crate::dht::rpc::SendFn = Arc::new(move |data: &[u8], to: SocketAddr| {
            udp.try_send_to(data, to).is_ok()
        });
        let mut node_id = [0u8; 20];
        self.rng.fill_bytes(&mut node_id);
        let mut dht = Dht::new(node_id, send, &mut self.rng);

        let mut seeds = Vec::new();
        for host in self.settings.dht_bootstrap.iter() {
            if let Ok(addr) = host.parse::<SocketAddr>() {
                seeds.push(addr);
            }
        }
        if !seeds.is_empty() {
            dht.bootstrap(seeds);
        }
        self.dht = Some(dht);
    }

    async fn start_portmap(&mut self) {
        if let Some(gateway) = crate::portmap::default_gateway() {
            match crate::portmap::NatpmpClient::bind(gateway).await {
                Ok((client, mut rx)) => {
                    self.portmap
                        .set_backend(crate::portmap::PortMapTransport::Natpmp, Box::new(client));
                    let event_tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        while let Some(resp) = rx.recv().await {
                            if event_tx.send(SessionEvent::Natpmp(resp)).is_err() {
                                return;
                            }
                        }
                    });
                }
                Err(e) => debug!(error = %e, "natpmp unavailable"),
            }
        }
        self.remap_ports();
    }

    fn remap_ports(&mut self) {
        let tcp = self.listen.listen_port();
        let ssl = self.listen.ssl_listen_port();
        self.portmap.remap(0b11, tcp, ssl, tcp);
    }

    // -----------------------------------------------------------------
    // lifecycle
    // -----------------------------------------------------------------

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        info!("session paused");
        self.paused = true;
        for t in self.registry.iter() {
            t.do_pause();
        }
    }

    fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        for t in self.registry.iter() {
            t.do_resume();
        }
    }

    async fn abort(&mut self) {
        if self.aborted {
            return;
        }
        info!("aborting session");
        self.aborted = true;

        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        self.listen.close();
        if let Some(lsd) = self.lsd.take() {
            lsd.close();
        }
        if let Some(mut dht) = self.dht.take() {
            dht.close();
        }
        self.portmap.clear();

        for t in self.registry.iter() {
            t.abort();
        }
        self.registry.clear();

        self.tracker.abort_all_requests();
        self.half_open.close();

        for p in self.connections.drain(..) {
            p.disconnect(DisconnectReason::StoppingTorrent);
        }

        self.upload_rate.close();
        self.download_rate.close();
        self.undead_peers.clear();

        // the disk pool keeps the scheduler alive until every worker has
        // exited
        self.disk.shutdown().await;
    }

    // -----------------------------------------------------------------
    // torrents
    // -----------------------------------------------------------------

    fn add_torrent(&mut self, params: AddTorrentParams) -> Result<InfoHash, SwarmError> {
        if self.aborted {
            return Err(SwarmError::Aborted);
        }
        let info_hash = params.info_hash;
        let lazy = params.metadata.is_none();
        let sequence = self.registry.next_sequence();
        let torrent = Torrent::new(params, sequence, self.clock.session_time());
        if self.paused {
            torrent.do_pause();
        }
        self.registry.insert(torrent.clone())?;
        if lazy {
            // metadata comes from the user load callback, subject to the
            // loaded-torrents LRU
            self.registry.load_torrent(&torrent, self.settings.active_loaded_limit);
        } else {
            self.registry.bump_torrent(&torrent, true, self.settings.active_loaded_limit);
        }
        self.alerts.post(Alert::TorrentAdded(info_hash));
        Ok(info_hash)
    }

    fn remove_torrent(&mut self, info_hash: &InfoHash) {
        if let Some(t) = self.registry.remove(info_hash) {
            t.abort();
            self.alerts.post(Alert::TorrentRemoved(*info_hash));
        }
    }

    /// Torrent with the most peers; the victim pool for over-limit
    /// recovery.
    fn find_disconnect_candidate_torrent(&self) -> Option<Arc<Torrent>> {
        self.registry.iter().max_by_key(|t| t.num_peers()).cloned()
    }

    // -----------------------------------------------------------------
    // peer classes
    // -----------------------------------------------------------------

    fn set_peer_classes(&mut self, set: &mut PeerClassSet, ip: std::net::IpAddr, kind: SocketKind) {
        let mut mask = self.class_filter.access(ip);
        // the global class applies to everyone
        mask |= 1 << self.classes.global_class();
        mask = self.class_type_filter.apply(kind, mask);

        let mut class = 0u8;
        while mask != 0 {
            if mask & 1 != 0 {
                // bits referencing deleted classes are ignored
                set.add_class(&mut self.classes, class);
            }
            mask >>= 1;
            class += 1;
        }
    }

    // -----------------------------------------------------------------
    // accept path
    // -----------------------------------------------------------------

    fn incoming_connection(
        &mut self,
        transport: Transport,
        local: SocketAddr,
        remote: SocketAddr,
        kind: SocketKind,
        ssl_sni: Option<String>,
    ) {
        if self.paused {
            debug!(%remote, "incoming connection ignored, paused");
            return;
        }

        if kind.is_utp() && !self.settings.enable_incoming_utp {
            self.alerts
                .post(Alert::PeerBlocked { addr: remote.ip(), reason: BlockReason::UtpDisabled });
            return;
        }
        if !kind.is_utp() && !self.settings.enable_incoming_tcp {
            self.alerts
                .post(Alert::PeerBlocked { addr: remote.ip(), reason: BlockReason::TcpDisabled });
            return;
        }

        // if outgoing interfaces are configured, the accepting socket
        // must be bound to one of them
        if !self.settings.outgoing_interfaces.is_empty()
            && !self.verify_bound_address(local.ip(), kind.is_utp())
        {
            self.alerts.post(Alert::PeerBlocked {
                addr: remote.ip(),
                reason: BlockReason::InvalidLocalInterface,
            });
            return;
        }

        let filter_exempt = self.registry.iter().any(|t| t.ignores_ip_filter());
        if !filter_exempt && self.ip_filter.access(remote.ip()) & BLOCKED != 0 {
            self.alerts
                .post(Alert::PeerBlocked { addr: remote.ip(), reason: BlockReason::IpFilter });
            return;
        }

        if self.registry.is_empty() {
            debug!(%remote, "no torrents, dropping connection");
            return;
        }

        // SSL acceptors route by the SNI-advertised obfuscated hash; a
        // missing name or a non-SSL torrent fails the handshake
        if kind.is_ssl() {
            let torrent = ssl_sni.as_deref().and_then(|sni| self.find_ssl_torrent(sni));
            if torrent.is_none() {
                debug!(%remote, "ssl connection with no matching ssl torrent");
                return;
            }
        }

        let mut pcs = PeerClassSet::default();
        self.set_peer_classes(&mut pcs, remote.ip(), kind);
        let factor = connection_limit_factor(&self.classes, &pcs);

        match admission_check(
            self.num_connections(),
            self.settings.connections_limit,
            self.settings.connections_slack,
            factor,
        ) {
            Admission::Reject => {
                self.alerts.post(Alert::PeerDisconnected {
                    addr: remote,
                    reason: DisconnectReason::TooManyConnections,
                });
                debug!(
                    conns = self.num_connections(),
                    limit = self.settings.connections_limit,
                    slack = self.settings.connections_slack,
                    "connection limit exceeded, rejected"
                );
                return;
            }
            admitted => {
                if !self.settings.incoming_starts_queued_torrents
                    && !self.registry.iter().any(|t| t.allows_peers())
                {
                    debug!(%remote, "no active torrents, dropping connection");
                    return;
                }

                self.counters.incoming_connections += 1;
                self.alerts.post(Alert::IncomingConnection { kind, addr: remote });

                let ignore_unchoke = ignore_unchoke_slots_set(&self.classes, &pcs);
                let (peer, cmd_rx) =
                    PeerConnection::new(remote, local, kind, false, self.clock.session_time());
                peer.set_classes(pcs, ignore_unchoke);
                peer.set_connected();

                if admitted == Admission::AdmitExceedsLimit {
                    peer.peer_exceeds_limit();
                }

                self.insert_peer(peer.clone());
                spawn_peer_task(transport, peer.clone(), cmd_rx, self.event_tx.clone());
                peer.start();
            }
        }
    }

    fn verify_bound_address(&self, local: std::net::IpAddr, utp: bool) -> bool {
        let interfaces: Vec<std::net::IpAddr> = self
            .settings
            .outgoing_interfaces
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        if interfaces.is_empty() {
            return true;
        }
        if utp {
            // uTP shares the session UDP socket; having any configured
            // interface is sufficient
            return true;
        }
        interfaces.contains(&local)
    }

    /// Resolve an SSL SNI server name (hex info-hash, first 40 chars) to
    /// an SSL torrent. Plain torrents matching the hash are rejected.
    fn find_ssl_torrent(&self, sni: &str) -> Option<Arc<Torrent>> {
        if sni.len() < 40 {
            return None;
        }
        let bytes = hex::decode(&sni[..40]).ok()?;
        let mut ih = [0u8; 20];
        ih.copy_from_slice(&bytes);
        let t = self.registry.find(&ih)?;
        if !t.is_ssl_torrent() {
            return None;
        }
        Some(t)
    }

    fn insert_peer(&mut self, peer: Arc<PeerConnection>) {
        debug_assert!(!self.connections.iter().any(|p| Arc::ptr_eq(p, &peer)));
        self.connections.push(peer);
    }

    fn on_peer_closed(&mut self, peer: Arc<PeerConnection>, reason: DisconnectReason) {
        if let Some(pos) = self.connections.iter().position(|p| Arc::ptr_eq(p, &peer)) {
            let p = self.connections.remove(pos);
            if !p.is_choked() && !p.ignore_unchoke_slots() {
                self.num_unchoked = self.num_unchoked.saturating_sub(1);
            }
            if let Some(t) = p.associated_torrent() {
                t.remove_peer(&p);
            }
            self.alerts
                .post(Alert::PeerDisconnected { addr: p.remote_addr(), reason });
            // other holders (in-flight jobs) may still reference the
            // peer; park it until this list holds the last reference
            drop(peer);
            if Arc::strong_count(&p) > 1 {
                self.undead_peers.push(p);
            }
        }
    }

    fn on_accept_error(&mut self, kind: SocketKind, error: std::io::Error) {
        warn!(?kind, %error, "accept failed");
        // running out of file descriptors: shrink the limit to what we
        // have and free one slot from the busiest torrent
        if error.raw_os_error() == Some(24) {
            self.settings.connections_limit = self.num_connections().max(2);
            if let Some(t) = self.find_disconnect_candidate_torrent() {
                t.disconnect_peers(1, DisconnectReason::TooManyOpenFiles);
            }
        }
    }

    // -----------------------------------------------------------------
    // outbound path
    // -----------------------------------------------------------------

    fn prioritize_connections(&mut self, info_hash: InfoHash) {
        let t = match self.registry.find(&info_hash) {
            Some(t) => t,
            None => return,
        };
        // boost: dial a few candidates right away; the spent attempts are
        // deducted from the next tick's connect budget
        let mut boosted = 0;
        while boosted < PRIO_CONNECT_ATTEMPTS {
            if self.num_connections() >= self.settings.connections_limit || !t.want_peers() {
                break;
            }
            if !self.try_connect_peer(&t) {
                break;
            }
            boosted += 1;
            self.boost_connections += 1;
            self.counters.connection_attempts += 1;
        }
        if t.want_peers() {
            self.prio_torrents.push_back((Arc::downgrade(&t), PRIO_CONNECT_ATTEMPTS));
        }
    }

    fn try_connect_more_peers(&mut self) {
        if self.aborted {
            return;
        }
        if self.num_connections() >= self.settings.connections_limit {
            return;
        }

        // the maximum number of connections we will attempt this tick
        let mut max_connections = self.settings.connection_speed;
        if max_connections <= 0 {
            return;
        }

        let mut free_slots = self.half_open.free_slots();
        if free_slots <= 0 {
            return;
        }

        // boost connections were already spent on tracker responses
        if self.boost_connections > 0 {
            if self.boost_connections > max_connections {
                self.boost_connections -= max_connections;
                max_connections = 0;
            } else {
                max_connections -= self.boost_connections;
                self.boost_connections = 0;
            }
        }

        let limit = (self.settings.connections_limit.saturating_sub(self.num_connections()))
            .min(free_slots.max(0) as usize) as i32;

        // smooth new connection attempts over time instead of bursting
        if self.settings.smooth_connects && max_connections > (limit + 1) / 2 {
            max_connections = (limit + 1) / 2;
        }
        if max_connections <= 0 {
            return;
        }

        let want_peers_download: Vec<Arc<Torrent>> =
            self.registry.iter().filter(|t| t.want_peers_download()).cloned().collect();
        let want_peers_finished: Vec<Arc<Torrent>> =
            self.registry.iter().filter(|t| t.want_peers_finished()).cloned().collect();
        if want_peers_download.is_empty() && want_peers_finished.is_empty() {
            return;
        }

        let num_torrents = want_peers_download.len() + want_peers_finished.len();
        let mut steps_since_last_connect = 0;

        loop {
            if self.next_downloading_connect_torrent >= want_peers_download.len() {
                self.next_downloading_connect_torrent = 0;
            }
            if self.next_finished_connect_torrent >= want_peers_finished.len() {
                self.next_finished_connect_torrent = 0;
            }

            // prioritized torrents first
            let mut torrent: Option<Arc<Torrent>> = None;
            while let Some(front) = self.prio_torrents.front_mut() {
                let t = front.0.upgrade();
                front.1 -= 1;
                if front.1 > 0 {
                    if let Some(t) = t {
                        if t.want_peers() {
                            torrent = Some(t);
                            break;
                        }
                    }
                }
                self.prio_torrents.pop_front();
            }

            let t = match torrent {
                Some(t) => t,
                None => {
                    if (self.download_connect_attempts
                        >= self.settings.connect_seed_every_n_download
                        && !want_peers_finished.is_empty())
                        || want_peers_download.is_empty()
                    {
                        let t = want_peers_finished[self.next_finished_connect_torrent].clone();
                        self.download_connect_attempts = 0;
                        self.next_finished_connect_torrent += 1;
                        t
                    } else {
                        let t = want_peers_download[self.next_downloading_connect_torrent].clone();
                        self.download_connect_attempts += 1;
                        self.next_downloading_connect_torrent += 1;
                        t
                    }
                }
            };

            if self.try_connect_peer(&t) {
                max_connections -= 1;
                free_slots -= 1;
                steps_since_last_connect = 0;
                self.counters.connection_attempts += 1;
            }

            steps_since_last_connect += 1;

            if free_slots <= 0 {
                break;
            }
            if max_connections == 0 {
                return;
            }
            // a whole loop without a single connection means nobody has
            // candidates left
            if steps_since_last_connect > num_torrents + 1 {
                break;
            }
            if self.num_connections() >= self.settings.connections_limit {
                break;
            }
        }
    }

    /// Source port for the next outbound connection. 0 lets the OS pick;
    /// a configured `outgoing_port` rotates through `num_outgoing_ports`
    /// consecutive ports.
    fn next_port(&mut self) -> u16 {
        if self.settings.outgoing_port == 0 {
            return 0;
        }
        let num = self.settings.num_outgoing_ports.max(1);
        let port = self.settings.outgoing_port.wrapping_add(self.next_outgoing_port % num);
        self.next_outgoing_port = (self.next_outgoing_port + 1) % num;
        port
    }

    /// Dial one candidate of `t`. Returns whether an attempt was made.
    fn try_connect_peer(&mut self, t: &Arc<Torrent>) -> bool {
        let addr = loop {
            match t.next_connect_candidate() {
                Some(a) => {
                    if self.port_filter.access(a.port()) & BLOCKED != 0 {
                        self.alerts.post(Alert::PeerBlocked {
                            addr: a.ip(),
                            reason: BlockReason::PrivilegedPort,
                        });
                        continue;
                    }
                    if self.ip_filter.access(a.ip()) & BLOCKED != 0 && !t.ignores_ip_filter() {
                        self.alerts.post(Alert::PeerBlocked {
                            addr: a.ip(),
                            reason: BlockReason::IpFilter,
                        });
                        continue;
                    }
                    break a;
                }
                None => return false,
            }
        };

        let ticket = match self.half_open.enqueue() {
            Some(t) => t,
            None => return false,
        };
        self.pending_connects.insert(ticket, t.info_hash());

        let info_hash = t.info_hash();
        let bind_port = self.next_port();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = connect_outbound(addr, bind_port).await;
            let _ = event_tx.send(SessionEvent::ConnectFinished {
                ticket,
                info_hash,
                addr,
                result,
            });
        });
        true
    }

    fn on_connect_finished(
        &mut self,
        ticket: ConnectTicket,
        info_hash: InfoHash,
        addr: SocketAddr,
        result: std::io::Result<TcpStream>,
    ) {
        self.half_open.done(ticket);
        self.pending_connects.remove(&ticket);
        if self.aborted {
            return;
        }

        let stream = match result {
            Ok(s) => s,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::OutOfMemory {
                    // lower the global limit to what we already have
                    self.settings.connections_limit = self.num_connections().max(2);
                }
                debug!(%addr, error = %e, "outbound connect failed");
                return;
            }
        };

        let t = match self.registry.find(&info_hash) {
            Some(t) => t,
            None => return,
        };
        if !t.allows_peers() {
            return;
        }

        stream.set_nodelay(true).ok();
        let local = stream
            .local_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("literal addr"));

        let mut pcs = PeerClassSet::default();
        self.set_peer_classes(&mut pcs, addr.ip(), SocketKind::Tcp);
        let ignore_unchoke = ignore_unchoke_slots_set(&self.classes, &pcs);

        let (peer, cmd_rx) =
            PeerConnection::new(addr, local, SocketKind::Tcp, true, self.clock.session_time());
        peer.set_classes(pcs, ignore_unchoke);
        peer.attach_torrent(&t);
        peer.set_connected();
        t.add_peer(&peer);
        self.insert_peer(peer.clone());
        spawn_peer_task(from_tcp(stream), peer.clone(), cmd_rx, self.event_tx.clone());
        peer.start();
    }

    // -----------------------------------------------------------------
    // choking
    // -----------------------------------------------------------------

    fn recalculate_unchoke_slots(&mut self) {
        let global = self.classes.global_class();
        let upload_throttle = self
            .classes
            .at(global)
            .map(|pc| pc.channel[UPLOAD_CHANNEL].throttle())
            .unwrap_or(0);
        let ctx = UnchokeCtx {
            settings: &self.settings,
            session_time: self.clock.session_time(),
            interval_ms: self.settings.unchoke_interval.max(1) as u64 * 1000,
            upload_throttle,
            upload_rate: self.upload_rate_estimate,
            upload_queue_size: self.upload_rate.queue_size(),
            peak_upload_rate: self.peak_up_rate,
        };
        let out = recalculate_unchoke_slots(&ctx, &self.connections, self.allowed_upload_slots);
        self.num_unchoked = out.num_unchoked;
        self.allowed_upload_slots = out.allowed_upload_slots;
        if out.reset_optimistic_scaler {
            self.optimistic_unchoke_scaler = 0;
        }
        if out.bittyrant_without_limit && !self.warned_bittyrant {
            self.warned_bittyrant = true;
            self.alerts
                .post(Alert::PerformanceWarning(PerformanceIssue::BittyrantWithNoUplimit));
        }
    }

    fn recalculate_optimistic_unchoke_slots(&mut self) {
        let ctx = UnchokeCtx {
            settings: &self.settings,
            session_time: self.clock.session_time(),
            interval_ms: self.settings.unchoke_interval.max(1) as u64 * 1000,
            upload_throttle: 0,
            upload_rate: self.upload_rate_estimate,
            upload_queue_size: self.upload_rate.queue_size(),
            peak_upload_rate: self.peak_up_rate,
        };
        let out = recalculate_optimistic_unchoke_slots(
            &ctx,
            &self.connections,
            self.allowed_upload_slots,
            &mut self.rng,
        );
        if out.num_unchoked_delta >= 0 {
            self.num_unchoked += out.num_unchoked_delta as usize;
        } else {
            self.num_unchoked =
                self.num_unchoked.saturating_sub((-out.num_unchoked_delta) as usize);
        }
    }

    // -----------------------------------------------------------------
    // tracker requests
    // -----------------------------------------------------------------

    fn queue_tracker_request(&mut self, mut req: TrackerRequest) {
        req.peer_id = self.peer_id;
        req.key = self.key;
        req.listen_port = if self.settings.force_proxy || !self.listen.is_open() {
            0
        } else if req.ssl {
            self.listen.ssl_listen_port()
        } else {
            self.listen.listen_port()
        };
        req.bind_ip = self.listen.sockets().first().map(|s| s.local_addr.ip());
        self.tracker.queue_request(req);
    }

    // -----------------------------------------------------------------
    // tick
    // -----------------------------------------------------------------

    fn on_tick(&mut self) {
        // flush disk jobs deferred since the previous tick
        self.disk.submit_jobs();

        let now = self.clock.update();

        let elapsed = now.saturating_duration_since(self.last_tick);
        self.upload_rate.update_quotas(&mut self.classes, elapsed);
        self.download_rate.update_quotas(&mut self.classes, elapsed);
        self.last_tick = now;

        if now.saturating_duration_since(self.last_second_tick) < Duration::from_secs(1) {
            return;
        }
        self.second_tick(now);
    }

    fn second_tick(&mut self, now: Instant) {
        // drop undead peers that nothing else references anymore
        self.undead_peers.retain(|p| Arc::strong_count(p) > 1);

        let tick_interval_ms =
            now.saturating_duration_since(self.last_second_tick).as_millis() as i64;
        self.last_second_tick = now;
        self.tick_residual += tick_interval_ms - 1000;

        // timestamp-wrap defense: step every session-time counter back
        // four hours before the 16-bit second counters wrap
        if self.clock.session_time() > SESSION_TIME_WRAP_THRESHOLD {
            self.clock.step_epoch(WRAP_STEP_SECS);
            for t in self.registry.iter() {
                t.step_session_time(WRAP_STEP_SECS);
            }
        }

        if self.aborted {
            return;
        }

        self.apply_mixed_mode_throttles();

        // auto managed torrents
        if !self.paused {
            self.auto_manage_scaler -= 1;
        }
        if self.auto_manage_scaler < 0 {
            self.auto_manage_scaler = self.settings.auto_manage_interval;
            let torrents: Vec<Arc<Torrent>> = self.registry.iter().cloned().collect();
            let ctx = AutoManageCtx {
                settings: &self.settings,
                session_time: self.clock.session_time(),
            };
            recalculate_auto_managed_torrents(&ctx, &torrents, self.paused);
        }

        // incoming connections that never completed a handshake
        let handshake_timeout = self.settings.handshake_timeout;
        let session_time = self.clock.session_time();
        for p in self.connections.iter() {
            if p.associated_torrent().is_some() {
                continue;
            }
            if session_time.saturating_sub(p.connected_time()) > handshake_timeout {
                p.disconnect(DisconnectReason::TimedOut);
            }
        }

        // per-second tick for every torrent that wants it
        let residual_s = (self.tick_residual / 1000).max(0) as u64;
        let mut up = 0i64;
        let mut down = 0i64;
        for t in self.registry.iter() {
            if !t.want_tick() {
                continue;
            }
            t.second_tick(tick_interval_ms.max(0) as u64, residual_s);
            up += t.upload_payload_rate();
            down += t.download_payload_rate();
        }
        self.upload_rate_estimate = up;
        self.download_rate_estimate = down;

        // charge DHT traffic against the global channels
        if self.settings.rate_limit_ip_overhead {
            let (dht_up, dht_down) = match self.dht.as_mut() {
                Some(d) => d.network_stats(),
                None => (0, 0),
            };
            let global = self.classes.global_class();
            if let Some(pc) = self.classes.at_mut(global) {
                pc.channel[UPLOAD_CHANNEL].use_quota(dht_up);
                pc.channel[DOWNLOAD_CHANNEL].use_quota(dht_down);
                let up_limit = pc.channel[UPLOAD_CHANNEL].throttle();
                let down_limit = pc.channel[DOWNLOAD_CHANNEL].throttle();
                if up_limit > 0 && dht_up >= up_limit {
                    self.alerts
                        .post(Alert::PerformanceWarning(PerformanceIssue::UploadLimitTooLow));
                }
                if down_limit > 0 && dht_down >= down_limit {
                    self.alerts
                        .post(Alert::PerformanceWarning(PerformanceIssue::DownloadLimitTooLow));
                }
            }
        }

        self.peak_up_rate = self.peak_up_rate.max(self.upload_rate_estimate);
        self.peak_down_rate = self.peak_down_rate.max(self.download_rate_estimate);

        if let Some(dht) = self.dht.as_mut() {
            dht.tick(&mut self.alerts);
        }
        self.dht_announce();
        self.lsd_announce();

        self.try_connect_more_peers();

        // unchoke set calculations
        self.unchoke_scaler -= 1;
        if self.unchoke_scaler <= 0 && !self.connections.is_empty() {
            self.unchoke_scaler = self.settings.unchoke_interval;
            self.recalculate_unchoke_slots();
        }

        // optimistic unchoke rotation
        self.optimistic_unchoke_scaler -= 1;
        if self.optimistic_unchoke_scaler <= 0 {
            self.optimistic_unchoke_scaler = self.settings.optimistic_unchoke_interval;
            self.recalculate_optimistic_unchoke_slots();
        }

        self.peer_turnover();

        self.tick_residual %= 1000;
    }

    fn apply_mixed_mode_throttles(&mut self) {
        let tcp_class = self.classes.tcp_class();
        match self.settings.mixed_mode_algorithm {
            MixedModeAlgorithm::PreferTcp => {
                if let Some(pc) = self.classes.at_mut(tcp_class) {
                    pc.channel[UPLOAD_CHANNEL].set_throttle(0);
                    pc.channel[DOWNLOAD_CHANNEL].set_throttle(0);
                }
            }
            MixedModeAlgorithm::PeerProportional => {
                // peers per [protocol][channel]: 0 = tcp, 1 = utp
                let mut num_peers = [[0u64; 2]; 2];
                for p in self.connections.iter() {
                    if p.in_handshake() {
                        continue;
                    }
                    let protocol = if p.socket_kind().is_utp() { 1 } else { 0 };
                    if p.download_queue_len() > 0 {
                        num_peers[protocol][DOWNLOAD_CHANNEL] += 1;
                    }
                    if p.upload_queue_len() > 0 {
                        num_peers[protocol][UPLOAD_CHANNEL] += 1;
                    }
                }
                let stat_rate =
                    [self.upload_rate_estimate as u64, self.download_rate_estimate as u64];
                // never throttle below this
                let lower_limit = [5_000u64, 30_000u64];

                if let Some(pc) = self.classes.at_mut(tcp_class) {
                    for channel in [UPLOAD_CHANNEL, DOWNLOAD_CHANNEL] {
                        if num_peers[1][channel] == 0 {
                            // no uTP peers in this direction, don't
                            // throttle TCP
                            pc.channel[channel].set_throttle(0);
                        } else {
                            let tcp_peers = num_peers[0][channel].max(1);
                            let total_peers = tcp_peers + num_peers[1][channel];
                            // 64-bit math: rate times peer count can
                            // overflow 32 bits
                            let rate = (stat_rate[channel] * tcp_peers / total_peers)
                                .max(lower_limit[channel]);
                            pc.channel[channel].set_throttle(rate as i64);
                        }
                    }
                }
            }
        }
    }

    fn dht_announce(&mut self) {
        let (dht, listen_port) = match (self.dht.as_mut(), self.listen.listen_port()) {
            (Some(d), p) => (d, p),
            (None, _) => return,
        };
        if self.registry.is_empty() {
            return;
        }
        self.dht_announce_scaler -= 1;
        if self.dht_announce_scaler > 0 {
            return;
        }
        // spread the announce interval across all torrents
        let n = self.registry.len() as i64;
        self.dht_announce_scaler =
            (self.settings.dht_announce_interval as i64 / n.max(1)).max(1);

        let order = self.registry.order();
        if self.next_dht_torrent >= order.len() {
            self.next_dht_torrent = 0;
        }
        let ih = order[self.next_dht_torrent];
        self.next_dht_torrent += 1;
        if let Some(t) = self.registry.find(&ih) {
            if t.announce_to_dht() && !t.is_paused() {
                let event_tx = self.event_tx.clone();
                dht.announce(ih, listen_port, move |peers| {
                    let _ = event_tx.send(SessionEvent::DhtPeers {
                        info_hash: ih,
                        peers: peers.to_vec(),
                    });
                });
            }
        }
    }

    fn lsd_announce(&mut self) {
        let lsd = match self.lsd.as_ref() {
            Some(l) => l,
            None => return,
        };
        if self.registry.is_empty() {
            return;
        }
        self.lsd_announce_scaler -= 1;
        if self.lsd_announce_scaler > 0 {
            return;
        }
        let n = self.registry.len() as i64;
        self.lsd_announce_scaler =
            (self.settings.local_service_announce_interval as i64 / n.max(1)).max(1);

        let order = self.registry.order();
        if self.next_lsd_torrent >= order.len() {
            self.next_lsd_torrent = 0;
        }
        let ih = order[self.next_lsd_torrent];
        self.next_lsd_torrent += 1;
        if let Some(t) = self.registry.find(&ih) {
            if t.announce_to_lsd() && !t.is_paused() {
                lsd.announce(&ih, self.listen.listen_port());
            }
        }
    }

    /// Periodically disconnect the worst peers so fresh candidates get a
    /// chance, either globally (at the connection limit) or per torrent
    /// (at its own limit).
    fn peer_turnover(&mut self) {
        self.disconnect_scaler -= 1;
        if self.disconnect_scaler > 0 {
            return;
        }
        self.disconnect_scaler = self.settings.peer_turnover_interval;

        let turnover = self.settings.peer_turnover as usize;
        let cutoff = self.settings.peer_turnover_cutoff as usize;

        if self.num_connections() >= self.settings.connections_limit * cutoff / 100
            && !self.registry.is_empty()
        {
            if let Some(t) = self.find_disconnect_candidate_torrent() {
                let peers_to_disconnect =
                    (t.num_peers() * turnover / 100).max(1).min(t.num_connect_candidates());
                t.disconnect_peers(peers_to_disconnect, DisconnectReason::OptimisticDisconnect);
            }
        } else {
            for t in self.registry.iter() {
                if t.num_peers() < t.max_connections() * cutoff / 100 {
                    continue;
                }
                let peers_to_disconnect =
                    (t.num_peers() * turnover / 100).max(1).min(t.num_connect_candidates());
                t.disconnect_peers(peers_to_disconnect, DisconnectReason::OptimisticDisconnect);
            }
        }
    }

    // -----------------------------------------------------------------
    // events & commands
    // -----------------------------------------------------------------

    fn handle_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Incoming { transport, local, remote, kind, ssl_sni } => {
                self.incoming_connection(transport, local, remote, kind, ssl_sni);
            }
            SessionEvent::AcceptError { kind, error } => self.on_accept_error(kind, error),
            SessionEvent::ConnectFinished { ticket, info_hash, addr, result } => {
                self.on_connect_finished(ticket, info_hash, addr, result);
            }
            SessionEvent::PeerClosed { peer, reason } => self.on_peer_closed(peer, reason),
            SessionEvent::UdpPacket { data, from } => {
                // bencoded payloads on the shared UDP socket are DHT
                // traffic; everything else belongs to uTP or the UDP
                // tracker transports
                if data.first() == Some(&b'd') {
                    if let Some(dht) = self.dht.as_mut() {
                        dht.incoming(&data, from, &mut self.alerts);
                    }
                }
            }
            SessionEvent::UdpUnreachable(ep) => {
                if let Some(dht) = self.dht.as_mut() {
                    dht.unreachable(ep);
                }
            }
            SessionEvent::LsdPeer { info_hash, addr } => {
                if let Some(t) = self.registry.find(&info_hash) {
                    if t.allows_peers() {
                        t.add_connect_candidates([addr]);
                    }
                    self.alerts.post(Alert::LsdPeer { addr, info_hash });
                }
            }
            SessionEvent::DhtPeers { info_hash, peers } => {
                if let Some(t) = self.registry.find(&info_hash) {
                    if t.allows_peers() {
                        t.add_connect_candidates(peers);
                    }
                }
            }
            SessionEvent::Natpmp(resp) => {
                let transport = crate::portmap::PortMapTransport::Natpmp;
                if resp.result_code != 0 {
                    self.portmap.on_mapping_error(
                        transport,
                        format!("natpmp error {}", resp.result_code),
                        &mut self.alerts,
                    );
                } else if let Some(id) =
                    self.portmap.resolve(transport, resp.protocol, resp.internal_port)
                {
                    self.portmap.on_mapping(
                        transport,
                        id,
                        resp.external_port,
                        None,
                        &mut self.alerts,
                    );
                    self.listen.set_external_port(resp.internal_port, resp.external_port);
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::AddTorrent(params, reply) => {
                let _ = reply.send(self.add_torrent(*params));
            }
            SessionCommand::RemoveTorrent(ih) => self.remove_torrent(&ih),
            SessionCommand::PauseTorrent(ih) => {
                if let Some(t) = self.registry.find(&ih) {
                    t.pause(false);
                }
            }
            SessionCommand::ResumeTorrent(ih) => {
                if let Some(t) = self.registry.find(&ih) {
                    t.resume();
                    t.restart_started(self.clock.session_time());
                    if !t.is_loaded() {
                        self.registry.load_torrent(&t, self.settings.active_loaded_limit);
                    } else {
                        self.registry.bump_torrent(&t, true, self.settings.active_loaded_limit);
                    }
                }
            }
            SessionCommand::Pause => self.pause(),
            SessionCommand::Resume => self.resume(),
            SessionCommand::Abort(ack) => {
                self.abort().await;
                let _ = ack.send(());
                return false;
            }
            SessionCommand::ApplySettings(new_settings) => {
                self.apply_settings(*new_settings).await;
            }
            SessionCommand::SetIpFilter(f) => self.ip_filter = f,
            SessionCommand::SetPeerClassFilter(f) => self.class_filter = f,
            SessionCommand::SetPeerClassTypeFilter(f) => self.class_type_filter = f,
            SessionCommand::CreatePeerClass(name, reply) => {
                let _ = reply.send(self.classes.new_class(&name));
            }
            SessionCommand::DeletePeerClass(id) => self.classes.delete_class(id),
            SessionCommand::SetKey(k) => self.key = k,
            SessionCommand::PopAlerts(reply) => {
                let _ = reply.send(self.alerts.pop_all());
            }
            SessionCommand::SaveState(categories, reply) => {
                let node_id = self.dht.as_ref().map(|d| *d.node_id());
                let _ = reply.send(save_state(&self.settings, node_id.as_ref(), categories));
            }
            SessionCommand::LoadState(blob) => {
                if let Err(e) = load_state(&blob, &mut self.settings) {
                    debug!(error = %e, "state load failed");
                }
            }
            SessionCommand::PostTorrentUpdates => {
                let statuses: Vec<TorrentStatus> =
                    self.registry.iter().map(|t| t.status()).collect();
                self.alerts.post(Alert::StateUpdate(statuses));
            }
            SessionCommand::PostSessionStats => {
                let snapshot = SessionStatsSnapshot {
                    num_connections: self.num_connections(),
                    num_unchoked: self.num_unchoked,
                    incoming_connections: self.counters.incoming_connections,
                    connection_attempts: self.counters.connection_attempts,
                    torrents_evicted: self.registry.torrents_evicted(),
                    upload_rate: self.upload_rate_estimate,
                    download_rate: self.download_rate_estimate,
                    peak_upload_rate: self.peak_up_rate,
                    peak_download_rate: self.peak_down_rate,
                };
                self.alerts.post(Alert::SessionStats(snapshot));
            }
            SessionCommand::PrioritizeConnections(ih) => self.prioritize_connections(ih),
            SessionCommand::QueueTrackerRequest(req) => self.queue_tracker_request(req),
            SessionCommand::SetUserLoadFunction(f) => {
                self.registry.set_user_load_function(Some(f));
            }
        }
        true
    }

    async fn apply_settings(&mut self, new_settings: SessionSettings) {
        let regenerate_identity =
            new_settings.anonymous_mode && !self.settings.anonymous_mode;
        let listen_changed = self.settings.listen_interfaces != new_settings.listen_interfaces
            || self.settings.ssl_listen != new_settings.ssl_listen;

        self.half_open.set_limit(new_settings.half_open_limit);
        self.port_filter = if new_settings.no_connect_privileged_ports {
            privileged_port_filter()
        } else {
            PortFilter::default()
        };
        self.settings = new_settings;

        if regenerate_identity {
            self.peer_id = generate_peer_id("-SW0000-", &mut self.rng);
            self.key = self.rng.next_u32();
        }

        if listen_changed && self.listen.needs_reopen(&self.settings) {
            self.open_listen_sockets().await;
            self.remap_ports();
        }
    }
}

/// Dial `addr`, optionally from a fixed source port (`outgoing_port`
/// rotation).
async fn connect_outbound(addr: SocketAddr, bind_port: u16) -> std::io::Result<TcpStream> {
    if bind_port == 0 {
        return TcpStream::connect(addr).await;
    }
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        SocketAddr::new("0.0.0.0".parse().expect("literal addr"), bind_port)
    } else {
        SocketAddr::new("::".parse().expect("literal addr"), bind_port)
    };
    socket.bind(bind_addr)?;
    socket.connect(addr).await
}

/// Thin I/O shell for one peer. The wire protocol lives in the peer
/// connection collaborator; this task keeps the socket alive, applies
/// scheduler commands, and reports the close.
fn spawn_peer_task(
    mut transport: Transport,
    peer: Arc<PeerConnection>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCommand>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = bytes::BytesMut::with_capacity(65536);
        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(PeerCommand::Start) => {}
                    Some(PeerCommand::Choke) | Some(PeerCommand::Unchoke) => {
                        // choke state already lives on the shared half;
                        // the wire message is the protocol layer's job
                    }
                    Some(PeerCommand::ExceedsLimit) => {}
                    Some(PeerCommand::Disconnect(reason)) => break reason,
                    None => break DisconnectReason::StoppingTorrent,
                },
                read = transport.read_buf(&mut buf) => match read {
                    Ok(0) => break DisconnectReason::PeerError,
                    Ok(_) => buf.clear(),
                    Err(_) => break DisconnectReason::PeerError,
                },
            }
        };
        let _ = event_tx.send(SessionEvent::PeerClosed { peer, reason });
    });
}

/// The public session handle. All state lives on a single scheduler task;
/// this handle posts commands to it.
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl Session {
    pub fn new(settings: SessionSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = SessionInner::new(settings, event_tx);
        tokio::spawn(run(inner, cmd_rx, event_rx));
        Self { cmd_tx }
    }

    /// Register the callback producing metadata for lazily-loaded
    /// torrents; enables the loaded-torrent LRU.
    pub fn set_user_load_function(&self, f: UserLoadFn) {
        let _ = self.cmd_tx.send(SessionCommand::SetUserLoadFunction(f));
    }

    pub async fn add_torrent(&self, params: AddTorrentParams) -> Result<InfoHash, SwarmError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::AddTorrent(Box::new(params), tx))
            .map_err(|_| SwarmError::Aborted)?;
        rx.await.map_err(|_| SwarmError::Aborted)?
    }

    pub fn remove_torrent(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(SessionCommand::RemoveTorrent(info_hash));
    }

    pub fn pause_torrent(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(SessionCommand::PauseTorrent(info_hash));
    }

    pub fn resume_torrent(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(SessionCommand::ResumeTorrent(info_hash));
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Resume);
    }

    /// Terminal shutdown; resolves once the disk workers have drained.
    pub async fn abort(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Abort(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn apply_settings(&self, settings: SessionSettings) {
        let _ = self.cmd_tx.send(SessionCommand::ApplySettings(Box::new(settings)));
    }

    pub fn set_ip_filter(&self, filter: IpRangeFilter) {
        let _ = self.cmd_tx.send(SessionCommand::SetIpFilter(filter));
    }

    pub fn set_peer_class_filter(&self, filter: IpRangeFilter) {
        let _ = self.cmd_tx.send(SessionCommand::SetPeerClassFilter(filter));
    }

    pub fn set_peer_class_type_filter(&self, filter: PeerClassTypeFilter) {
        let _ = self.cmd_tx.send(SessionCommand::SetPeerClassTypeFilter(filter));
    }

    pub async fn create_peer_class(&self, name: &str) -> Option<PeerClassId> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(SessionCommand::CreatePeerClass(name.to_string(), tx)).ok()?;
        rx.await.ok()
    }

    pub fn delete_peer_class(&self, id: PeerClassId) {
        let _ = self.cmd_tx.send(SessionCommand::DeletePeerClass(id));
    }

    pub fn set_key(&self, key: u32) {
        let _ = self.cmd_tx.send(SessionCommand::SetKey(key));
    }

    pub async fn pop_alerts(&self) -> Vec<Alert> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::PopAlerts(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn save_state(&self, categories: u32) -> Vec<u8> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::SaveState(categories, tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn load_state(&self, blob: Vec<u8>) {
        let _ = self.cmd_tx.send(SessionCommand::LoadState(blob));
    }

    pub fn post_torrent_updates(&self) {
        let _ = self.cmd_tx.send(SessionCommand::PostTorrentUpdates);
    }

    pub fn post_session_stats(&self) {
        let _ = self.cmd_tx.send(SessionCommand::PostSessionStats);
    }

    pub fn prioritize_connections(&self, info_hash: InfoHash) {
        let _ = self.cmd_tx.send(SessionCommand::PrioritizeConnections(info_hash));
    }

    pub fn queue_tracker_request(&self, req: TrackerRequest) {
        let _ = self.cmd_tx.send(SessionCommand::QueueTrackerRequest(req));
    }
}

async fn run(
    mut inner: SessionInner,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    mut event_rx: mpsc::UnboundedReceiver<SessionEvent>,
) {
    inner.start().await;

    let mut tick =
        tokio::time::interval(Duration::from_millis(inner.settings.tick_interval_ms.max(50)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => inner.on_tick(),
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    if !inner.handle_command(cmd).await {
                        break;
                    }
                }
                None => {
                    inner.abort().await;
                    break;
                }
            },
            Some(ev) = event_rx.recv() => inner.handle_event(ev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_rejects_beyond_limit_plus_slack() {
        // connections_limit = 10, slack = 2, factor = 100: the 13th
        // connection (12 already open) is rejected
        assert_eq!(admission_check(12, 10, 2, 100), Admission::Reject);
        assert_eq!(admission_check(11, 10, 2, 100), Admission::AdmitExceedsLimit);
        assert_eq!(admission_check(9, 10, 2, 100), Admission::Admit);
    }

    #[test]
    fn admission_weighs_class_factor() {
        // factor 200 halves the effective limit
        assert_eq!(admission_check(5, 10, 0, 200), Admission::Reject);
        assert_eq!(admission_check(4, 10, 0, 200), Admission::AdmitExceedsLimit);
        assert_eq!(admission_check(3, 10, 0, 200), Admission::Admit);
    }

    fn test_inner() -> (SessionInner, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (SessionInner::new(SessionSettings::default(), event_tx), event_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_idempotent_and_propagates() {
        let (mut inner, _rx) = test_inner();
        let ih = inner
            .add_torrent(AddTorrentParams::with_info_hash([1u8; 20]))
            .unwrap();
        inner.pause();
        inner.pause();
        assert!(inner.registry.find(&ih).unwrap().is_paused());
        inner.resume();
        inner.resume();
        assert!(!inner.registry.find(&ih).unwrap().is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn add_torrent_rejects_duplicates_and_posts_alert() {
        let (mut inner, _rx) = test_inner();
        inner.add_torrent(AddTorrentParams::with_info_hash([1u8; 20])).unwrap();
        let dup = inner.add_torrent(AddTorrentParams::with_info_hash([1u8; 20]));
        assert!(matches!(dup, Err(SwarmError::DuplicateTorrent)));
        assert!(inner
            .alerts
            .pop_all()
            .iter()
            .any(|a| matches!(a, Alert::TorrentAdded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_terminal() {
        let (mut inner, _rx) = test_inner();
        inner.add_torrent(AddTorrentParams::with_info_hash([1u8; 20])).unwrap();
        inner.abort().await;
        inner.abort().await;
        assert!(inner.registry.is_empty());
        assert!(matches!(
            inner.add_torrent(AddTorrentParams::with_info_hash([2u8; 20])),
            Err(SwarmError::Aborted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ssl_lookup_requires_ssl_torrent() {
        let (mut inner, _rx) = test_inner();
        let plain_ih = [3u8; 20];
        inner.add_torrent(AddTorrentParams::with_info_hash(plain_ih)).unwrap();

        let ssl_ih = [4u8; 20];
        let mut params = AddTorrentParams::with_info_hash(ssl_ih);
        params.ssl_context = Some(crate::torrent::SslContext(Arc::new(vec![1, 2, 3])));
        inner.add_torrent(params).unwrap();

        // a plain torrent resolved through the SSL acceptor is rejected
        assert!(inner.find_ssl_torrent(&hex::encode(plain_ih)).is_none());
        let found = inner.find_ssl_torrent(&hex::encode(ssl_ih)).unwrap();
        assert_eq!(found.info_hash(), ssl_ih);
        // trailing garbage beyond the first 40 chars is ignored
        let long = format!("{}.extra.example", hex::encode(ssl_ih));
        assert!(inner.find_ssl_torrent(&long).is_some());
        assert!(inner.find_ssl_torrent("tooshort").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_classes_assigned_from_filters() {
        let (mut inner, _rx) = test_inner();
        let mut set = PeerClassSet::default();
        inner.set_peer_classes(&mut set, "127.0.0.1".parse().unwrap(), SocketKind::Tcp);
        assert!(set.contains(inner.classes.global_class()));
        assert!(set.contains(inner.classes.tcp_class()));
        assert!(set.contains(inner.classes.local_class()));

        let mut remote_set = PeerClassSet::default();
        inner.set_peer_classes(&mut remote_set, "8.8.8.8".parse().unwrap(), SocketKind::Utp);
        assert!(remote_set.contains(inner.classes.global_class()));
        assert!(!remote_set.contains(inner.classes.tcp_class()));
        assert!(!remote_set.contains(inner.classes.local_class()));
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_class_bits_are_ignored() {
        let (mut inner, _rx) = test_inner();
        let id = inner.classes.new_class("short-lived");
        let mut filter = IpRangeFilter::default();
        filter.add_rule(
            "10.0.0.0".parse().unwrap(),
            "10.255.255.255".parse().unwrap(),
            1 << id,
        );
        inner.class_filter = filter;
        inner.classes.delete_class(id);

        let mut set = PeerClassSet::default();
        inner.set_peer_classes(&mut set, "10.1.2.3".parse().unwrap(), SocketKind::Tcp);
        assert!(!set.contains(id));
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_request_port_rules() {
        let (mut inner, _rx) = test_inner();
        let req = TrackerRequest {
            url: "udp://tracker.example.com".into(),
            info_hash: [1u8; 20],
            peer_id: [0u8; 20],
            event: None,
            listen_port: 9999,
            key: 0,
            bind_ip: None,
            ssl: false,
        };
        // nothing is listening yet: the port reports 0
        inner.queue_tracker_request(req.clone());
        assert_eq!(inner.tracker.pop_request().unwrap().listen_port, 0);

        inner.settings.listen_interfaces = "127.0.0.1:0".to_string();
        inner.open_listen_sockets().await;
        inner.queue_tracker_request(req.clone());
        let queued = inner.tracker.pop_request().unwrap();
        assert_eq!(queued.listen_port, inner.listen.listen_port());
        assert_eq!(queued.key, inner.key);
        assert_eq!(queued.peer_id, inner.peer_id);

        inner.settings.force_proxy = true;
        inner.queue_tracker_request(req);
        assert_eq!(inner.tracker.pop_request().unwrap().listen_port, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_turnover_disconnects_worst_peers() {
        let (mut inner, _rx) = test_inner();
        let ih = [1u8; 20];
        inner.add_torrent(AddTorrentParams::with_info_hash(ih)).unwrap();
        let t = inner.registry.find(&ih).unwrap();
        t.set_max_connections(4);

        let mut rxs = Vec::new();
        for i in 0..4 {
            let (p, rx) = PeerConnection::new(
                format!("10.0.0.{}:1", i + 1).parse().unwrap(),
                "0.0.0.0:0".parse().unwrap(),
                SocketKind::Tcp,
                false,
                0,
            );
            p.attach_torrent(&t);
            t.add_peer(&p);
            inner.insert_peer(p);
            rxs.push(rx);
        }
        t.add_connect_candidates(["10.9.9.9:1".parse().unwrap()]);

        // at 100% of the torrent limit with the default 90% cutoff
        inner.disconnect_scaler = 0;
        inner.peer_turnover();
        let disconnecting =
            inner.connections.iter().filter(|p| p.is_disconnecting()).count();
        assert_eq!(disconnecting, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wrap_defense_steps_epoch() {
        let (mut inner, _rx) = test_inner();
        let ih = [1u8; 20];
        inner.add_torrent(AddTorrentParams::with_info_hash(ih)).unwrap();
        let t = inner.registry.find(&ih).unwrap();

        tokio::time::advance(Duration::from_secs(66_000)).await;
        let now = inner.clock.update();
        t.restart_started(inner.clock.session_time());
        inner.second_tick(now);

        assert!(inner.clock.session_time() < SESSION_TIME_WRAP_THRESHOLD);
        assert_eq!(t.started(), 66_000 - WRAP_STEP_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn undead_peers_dropped_when_unreferenced() {
        let (mut inner, _rx) = test_inner();
        let (p, _cmd_rx) = PeerConnection::new(
            "10.0.0.1:1".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            SocketKind::Tcp,
            false,
            0,
        );
        inner.insert_peer(p.clone());
        let external_holder = p.clone();
        inner.on_peer_closed(p, DisconnectReason::PeerError);
        assert_eq!(inner.undead_peers.len(), 1);

        // still referenced: survives the sweep
        let now = inner.clock.update();
        inner.second_tick(now);
        assert_eq!(inner.undead_peers.len(), 1);

        drop(external_holder);
        tokio::time::advance(Duration::from_secs(1)).await;
        let now = inner.clock.update();
        inner.second_tick(now);
        assert!(inner.undead_peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_budget_respects_connection_speed() {
        let (mut inner, mut rx) = test_inner();
        inner.settings.smooth_connects = false;
        inner.settings.connection_speed = 2;
        let ih = [1u8; 20];
        inner.add_torrent(AddTorrentParams::with_info_hash(ih)).unwrap();
        let t = inner.registry.find(&ih).unwrap();
        t.add_connect_candidates(
            (1..=5).map(|i| format!("127.0.0.{i}:6881").parse().unwrap()),
        );

        inner.try_connect_more_peers();
        assert_eq!(inner.counters.connection_attempts, 2);
        assert_eq!(inner.pending_connects.len(), 2);
        // candidates remain for the next tick
        assert_eq!(t.num_connect_candidates(), 3);
        // connect tasks were spawned and will report back
        drop(inner);
        let _ = rx.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn privileged_ports_filtered_from_candidates() {
        let (mut inner, _rx) = test_inner();
        let ih = [1u8; 20];
        inner.add_torrent(AddTorrentParams::with_info_hash(ih)).unwrap();
        let t = inner.registry.find(&ih).unwrap();
        t.add_connect_candidates(["127.0.0.1:80".parse().unwrap()]);
        assert!(!inner.try_connect_peer(&t));
        assert!(inner
            .alerts
            .pop_all()
            .iter()
            .any(|a| matches!(
                a,
                Alert::PeerBlocked { reason: BlockReason::PrivilegedPort, .. }
            )));
    }
}
