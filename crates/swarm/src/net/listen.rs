use crate::alert::{Alert, AlertQueue};
use crate::config::SessionSettings;
use crate::error::ListenOp;
use crate::net::SocketKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{info, warn};

pub const DEFAULT_LISTEN_PORT: u16 = 6881;

/// One entry of the `listen_interfaces` setting. A trailing `s` on the
/// port marks an SSL acceptor ("0.0.0.0:6881,0.0.0.0:4433s").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenInterface {
    pub device: String,
    pub port: u16,
    pub ssl: bool,
}

/// Parse the comma-separated `host:port` list. Unparseable entries are
/// dropped; the caller reports them against the device string.
pub fn parse_listen_interfaces(s: &str) -> Vec<ListenInterface> {
    let mut out = Vec::new();
    for entry in s.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (host, port_str) = match entry.rfind(':') {
            Some(i) => (&entry[..i], &entry[i + 1..]),
            None => continue,
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let (port_str, ssl) = match port_str.strip_suffix('s') {
            Some(p) => (p, true),
            None => (port_str, false),
        };
        let port: u16 = match port_str.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };
        out.push(ListenInterface { device: host.to_string(), port, ssl });
    }
    out
}

fn default_interfaces() -> Vec<ListenInterface> {
    vec![
        ListenInterface { device: "0.0.0.0".to_string(), port: DEFAULT_LISTEN_PORT, ssl: false },
        ListenInterface { device: "::1".to_string(), port: DEFAULT_LISTEN_PORT, ssl: false },
    ]
}

pub struct ListenSocket {
    pub device: String,
    pub local_addr: SocketAddr,
    /// The port peers reach us on (equal to the bound port until a port
    /// mapping says otherwise).
    pub external_port: u16,
    pub ssl: bool,
    pub listener: Arc<TcpListener>,
}

impl ListenSocket {
    pub fn kind(&self) -> SocketKind {
        if self.ssl {
            SocketKind::TcpSsl
        } else {
            SocketKind::Tcp
        }
    }
}

/// The set of open acceptors plus the UDP socket (uTP, DHT, UDP
/// trackers), bound to the first successful TCP port.
pub struct ListenSocketSet {
    sockets: Vec<ListenSocket>,
    udp: Option<Arc<UdpSocket>>,
    interfaces: Vec<ListenInterface>,
}

impl ListenSocketSet {
    pub fn new() -> Self {
        Self { sockets: Vec::new(), udp: None, interfaces: Vec::new() }
    }

    pub fn sockets(&self) -> &[ListenSocket] {
        &self.sockets
    }

    pub fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.sockets.is_empty()
    }

    /// The externally-reported listen port: the first plain acceptor's
    /// port, or 0 when nothing is listening.
    pub fn listen_port(&self) -> u16 {
        self.sockets.iter().find(|s| !s.ssl).map(|s| s.external_port).unwrap_or(0)
    }

    pub fn ssl_listen_port(&self) -> u16 {
        self.sockets.iter().find(|s| s.ssl).map(|s| s.external_port).unwrap_or(0)
    }

    pub fn set_external_port(&mut self, local_port: u16, external_port: u16) {
        for s in self.sockets.iter_mut() {
            if s.local_addr.port() == local_port {
                s.external_port = external_port;
            }
        }
    }

    /// Whether a settings change requires reopening: the parsed interface
    /// list differs, or nothing is open yet.
    pub fn needs_reopen(&self, settings: &SessionSettings) -> bool {
        let mut wanted = parse_listen_interfaces(&settings.listen_interfaces);
        if wanted.is_empty() {
            wanted = default_interfaces();
        }
        wanted != self.interfaces || !self.is_open()
    }

    /// Open (or reopen) every configured acceptor, with bounded port
    /// retries and the optional OS-chosen-port fallback, then bind the
    /// UDP socket to the first successful TCP port.
    pub async fn open(&mut self, settings: &SessionSettings, alerts: &mut AlertQueue) {
        self.close();

        if settings.force_proxy {
            // no listening at all under forced proxying
            return;
        }

        let mut interfaces = parse_listen_interfaces(&settings.listen_interfaces);
        if interfaces.is_empty() {
            interfaces = default_interfaces();
        }
        self.interfaces = interfaces.clone();

        for iface in interfaces {
            let ip: IpAddr = match iface.device.parse() {
                Ok(ip) => ip,
                Err(_) => {
                    alerts.post(Alert::ListenFailed {
                        device: iface.device.clone(),
                        op: ListenOp::Open,
                        error: "no such device".to_string(),
                        kind: SocketKind::Tcp,
                    });
                    continue;
                }
            };
            if let Some(sock) = setup_listener(&iface, ip, settings, alerts).await {
                self.sockets.push(sock);
            }
        }

        // the UDP socket shares the first TCP port
        if let Some(first) = self.sockets.first() {
            let bind = SocketAddr::new(first.local_addr.ip(), first.local_addr.port());
            match UdpSocket::bind(bind).await {
                Ok(sock) => {
                    self.udp = Some(Arc::new(sock));
                }
                Err(e) => {
                    warn!(addr = %bind, error = %e, "udp bind failed");
                    alerts.post(Alert::UdpError { addr: bind, error: e.to_string() });
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.sockets.clear();
        self.udp = None;
    }
}

impl Default for ListenSocketSet {
    fn default() -> Self {
        Self::new()
    }
}

async fn setup_listener(
    iface: &ListenInterface,
    ip: IpAddr,
    settings: &SessionSettings,
    alerts: &mut AlertQueue,
) -> Option<ListenSocket> {
    let kind = if iface.ssl { SocketKind::TcpSsl } else { SocketKind::Tcp };
    let mut retries = settings.max_retry_port_bind;
    let mut port = iface.port;

    loop {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                let local_addr = match listener.local_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        alerts.post(Alert::ListenFailed {
                            device: iface.device.clone(),
                            op: ListenOp::GetSocketName,
                            error: e.to_string(),
                            kind,
                        });
                        return None;
                    }
                };
                info!(addr = %local_addr, ssl = iface.ssl, "listening");
                alerts.post(Alert::ListenSucceeded { endpoint: local_addr, kind });
                return Some(ListenSocket {
                    device: iface.device.clone(),
                    local_addr,
                    external_port: local_addr.port(),
                    ssl: iface.ssl,
                    listener: Arc::new(listener),
                });
            }
            Err(e) => {
                warn!(device = %iface.device, port, error = %e, "listen bind failed");
                alerts.post(Alert::ListenFailed {
                    device: iface.device.clone(),
                    op: ListenOp::Bind,
                    error: e.to_string(),
                    kind,
                });
                if retries > 0 {
                    retries -= 1;
                    port = port.saturating_add(1);
                    continue;
                }
                if settings.listen_system_port_fallback && port != 0 {
                    // last resort: let the OS pick
                    port = 0;
                    continue;
                }
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_and_ssl_entries() {
        let v = parse_listen_interfaces("0.0.0.0:6881,[::1]:6882,127.0.0.1:4433s");
        assert_eq!(v.len(), 3);
        assert_eq!(v[0], ListenInterface { device: "0.0.0.0".into(), port: 6881, ssl: false });
        assert_eq!(v[1], ListenInterface { device: "::1".into(), port: 6882, ssl: false });
        assert_eq!(v[2], ListenInterface { device: "127.0.0.1".into(), port: 4433, ssl: true });
    }

    #[test]
    fn parse_skips_garbage() {
        let v = parse_listen_interfaces("nonsense,0.0.0.0:x,  ,127.0.0.1:7000");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].port, 7000);
    }

    #[tokio::test]
    async fn open_binds_tcp_and_udp() {
        let mut settings = SessionSettings::default();
        settings.listen_interfaces = "127.0.0.1:0".to_string();
        let mut alerts = AlertQueue::default();
        let mut set = ListenSocketSet::new();
        set.open(&settings, &mut alerts).await;

        assert!(set.is_open());
        assert_ne!(set.listen_port(), 0);
        assert!(set.udp_socket().is_some());
        assert!(alerts
            .pop_all()
            .iter()
            .any(|a| matches!(a, Alert::ListenSucceeded { .. })));
    }

    #[tokio::test]
    async fn port_retry_walks_upward() {
        // occupy a port, then ask the set to bind the same one
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let mut settings = SessionSettings::default();
        settings.listen_interfaces = format!("127.0.0.1:{taken}");
        settings.max_retry_port_bind = 10;
        let mut alerts = AlertQueue::default();
        let mut set = ListenSocketSet::new();
        set.open(&settings, &mut alerts).await;

        assert!(set.is_open());
        assert_ne!(set.listen_port(), taken);
        let drained = alerts.pop_all();
        assert!(drained.iter().any(|a| matches!(a, Alert::ListenFailed { .. })));
        assert!(drained.iter().any(|a| matches!(a, Alert::ListenSucceeded { .. })));
    }

    #[tokio::test]
    async fn bad_device_does_not_block_others() {
        let mut settings = SessionSettings::default();
        settings.listen_interfaces = "eth-nope:6881,127.0.0.1:0".to_string();
        let mut alerts = AlertQueue::default();
        let mut set = ListenSocketSet::new();
        set.open(&settings, &mut alerts).await;

        assert!(set.is_open());
        let drained = alerts.pop_all();
        assert!(drained
            .iter()
            .any(|a| matches!(a, Alert::ListenFailed { device, .. } if device == "eth-nope")));
    }

    #[tokio::test]
    async fn reconcile_detects_changes() {
        let mut settings = SessionSettings::default();
        settings.listen_interfaces = "127.0.0.1:0".to_string();
        let mut alerts = AlertQueue::default();
        let mut set = ListenSocketSet::new();
        assert!(set.needs_reopen(&settings));
        set.open(&settings, &mut alerts).await;
        assert!(!set.needs_reopen(&settings));
        settings.listen_interfaces = "127.0.0.1:0,[::1]:0".to_string();
        assert!(set.needs_reopen(&settings));
    }
}
