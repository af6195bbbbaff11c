use std::path::PathBuf;

/// Which algorithm picks the unchoked peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokingAlgorithm {
    /// Unchoke the best `unchoke_slots_limit` peers.
    FixedSlots,
    /// Like `FixedSlots`, but grow/shrink the budget based on upload
    /// saturation.
    AutoExpand,
    /// Derive the budget from observed upload rates crossing 1 KiB/s steps.
    RateBased,
    /// BitTyrant: unchoke by reciprocation-rate return on investment.
    BitTyrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedModeAlgorithm {
    /// TCP is never throttled relative to uTP.
    PreferTcp,
    /// Throttle TCP proportionally to the TCP/uTP peer split.
    PeerProportional,
}

/// Flat session settings. A value of `-1` on the `active_*` limits means
/// unlimited; a throttle or limit of `0` means unlimited where noted.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Client fingerprint, becomes the peer-id prefix.
    pub peer_fingerprint: String,

    // connections
    pub connections_limit: usize,
    pub connections_slack: usize,
    /// Max simultaneous outbound TCP SYNs. 0 = unlimited.
    pub half_open_limit: i32,
    pub connection_speed: i32,
    pub connect_seed_every_n_download: u32,
    pub smooth_connects: bool,
    pub incoming_starts_queued_torrents: bool,
    pub handshake_timeout: u64,

    // choking
    pub choking_algorithm: ChokingAlgorithm,
    pub unchoke_slots_limit: i32,
    pub num_optimistic_unchoke_slots: usize,
    pub unchoke_interval: i32,
    pub optimistic_unchoke_interval: i32,

    // auto management
    pub auto_manage_interval: i32,
    pub auto_manage_startup: u32,
    pub auto_manage_prefer_seeds: bool,
    pub dont_count_slow_torrents: bool,
    pub active_downloads: i32,
    pub active_seeds: i32,
    pub active_limit: i32,
    pub active_dht_limit: i32,
    pub active_lsd_limit: i32,
    pub active_tracker_limit: i32,
    /// LRU cap on loaded torrents. 0 = unlimited, never evict.
    pub active_loaded_limit: usize,

    // listen
    pub listen_interfaces: String,
    pub listen_system_port_fallback: bool,
    pub max_retry_port_bind: u32,
    pub listen_queue_size: u32,
    pub ssl_listen: u16,
    pub enable_incoming_tcp: bool,
    pub enable_incoming_utp: bool,

    // outbound
    pub outgoing_interfaces: String,
    pub outgoing_port: u16,
    pub num_outgoing_ports: u16,
    pub peer_tos: u8,
    pub no_connect_privileged_ports: bool,

    // identity / privacy
    pub anonymous_mode: bool,
    pub force_proxy: bool,

    // tick
    pub tick_interval_ms: u64,

    // turnover
    pub peer_turnover: u32,
    pub peer_turnover_cutoff: u32,
    pub peer_turnover_interval: i32,

    // rate management
    pub mixed_mode_algorithm: MixedModeAlgorithm,
    pub rate_limit_ip_overhead: bool,
    pub upload_rate_limit: i64,
    pub download_rate_limit: i64,

    // dht / lsd
    pub dht_enabled: bool,
    pub dht_bootstrap: Vec<String>,
    pub dht_upload_rate_limit: i64,
    pub dht_announce_interval: u64,
    pub local_service_announce_interval: u64,

    pub download_dir: PathBuf,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            peer_fingerprint: "-SW0001-".to_string(),

            connections_limit: 200,
            connections_slack: 10,
            half_open_limit: 0,
            connection_speed: 6,
            connect_seed_every_n_download: 10,
            smooth_connects: true,
            incoming_starts_queued_torrents: false,
            handshake_timeout: 10,

            choking_algorithm: ChokingAlgorithm::FixedSlots,
            unchoke_slots_limit: 8,
            num_optimistic_unchoke_slots: 0,
            unchoke_interval: 15,
            optimistic_unchoke_interval: 30,

            auto_manage_interval: 30,
            auto_manage_startup: 120,
            auto_manage_prefer_seeds: false,
            dont_count_slow_torrents: true,
            active_downloads: 3,
            active_seeds: 5,
            active_limit: 15,
            active_dht_limit: 88,
            active_lsd_limit: 60,
            active_tracker_limit: 1600,
            active_loaded_limit: 0,

            listen_interfaces: String::new(),
            listen_system_port_fallback: true,
            max_retry_port_bind: 10,
            listen_queue_size: 5,
            ssl_listen: 4433,
            enable_incoming_tcp: true,
            enable_incoming_utp: true,

            outgoing_interfaces: String::new(),
            outgoing_port: 0,
            num_outgoing_ports: 0,
            peer_tos: 0,
            no_connect_privileged_ports: true,

            anonymous_mode: false,
            force_proxy: false,

            tick_interval_ms: 500,

            peer_turnover: 4,
            peer_turnover_cutoff: 90,
            peer_turnover_interval: 300,

            mixed_mode_algorithm: MixedModeAlgorithm::PeerProportional,
            rate_limit_ip_overhead: true,
            upload_rate_limit: 0,
            download_rate_limit: 0,

            dht_enabled: false,
            dht_bootstrap: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            dht_upload_rate_limit: 4000,
            dht_announce_interval: 15 * 60,
            local_service_announce_interval: 5 * 60,

            download_dir: PathBuf::from("downloads"),
        }
    }
}
