use crate::alert::{Alert, AlertQueue};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMapTransport {
    Natpmp,
    Upnp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMapProtocol {
    Tcp,
    Udp,
}

pub type MappingId = u32;

/// One port-mapping service (NAT-PMP or UPnP). `add_mapping` fires the
/// request and returns a handle; the result arrives asynchronously through
/// the backend's event stream and lands in [`PortMapper::on_mapping`].
pub trait PortMapBackend: Send {
    fn add_mapping(
        &mut self,
        protocol: PortMapProtocol,
        local_port: u16,
        external_port: u16,
    ) -> Option<MappingId>;
    fn delete_mapping(&mut self, id: MappingId);
    /// Map a service response back to the id `add_mapping` handed out.
    /// NAT-PMP responses only carry (protocol, internal port).
    fn mapping_for(&self, _protocol: PortMapProtocol, _local_port: u16) -> Option<MappingId> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct MappingSlot {
    id: MappingId,
    local: u16,
    external: u16,
}

const NUM_TRANSPORTS: usize = 2;

fn transport_index(t: PortMapTransport) -> usize {
    match t {
        PortMapTransport::Natpmp => 0,
        PortMapTransport::Upnp => 1,
    }
}

/// Reconciles the listen ports against the NAT-PMP and UPnP services.
/// Per transport it keeps a TCP, an SSL-TCP and a UDP mapping; a remap
/// request matching the current (local, external, protocol) triple is a
/// no-op, anything else deletes and re-creates the mapping.
pub struct PortMapper {
    backends: [Option<Box<dyn PortMapBackend>>; NUM_TRANSPORTS],
    tcp: [Option<MappingSlot>; NUM_TRANSPORTS],
    ssl: [Option<MappingSlot>; NUM_TRANSPORTS],
    udp: [Option<MappingSlot>; NUM_TRANSPORTS],
    external_udp_port: u16,
    external_ip: Option<IpAddr>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self {
            backends: [None, None],
            tcp: [None, None],
            ssl: [None, None],
            udp: [None, None],
            external_udp_port: 0,
            external_ip: None,
        }
    }

    pub fn set_backend(&mut self, transport: PortMapTransport, backend: Box<dyn PortMapBackend>) {
        self.backends[transport_index(transport)] = Some(backend);
    }

    pub fn has_backend(&self, transport: PortMapTransport) -> bool {
        self.backends[transport_index(transport)].is_some()
    }

    pub fn external_udp_port(&self) -> u16 {
        self.external_udp_port
    }

    /// Delegate response-to-mapping resolution to the transport's
    /// backend.
    pub fn resolve(
        &self,
        transport: PortMapTransport,
        protocol: PortMapProtocol,
        local_port: u16,
    ) -> Option<MappingId> {
        self.backends[transport_index(transport)]
            .as_ref()
            .and_then(|b| b.mapping_for(protocol, local_port))
    }

    pub fn external_ip(&self) -> Option<IpAddr> {
        self.external_ip
    }

    fn remap_slot(
        backend: &mut dyn PortMapBackend,
        slot: &mut Option<MappingSlot>,
        protocol: PortMapProtocol,
        local: u16,
        external: u16,
    ) {
        if let Some(cur) = slot.as_ref() {
            if cur.local == local && cur.external == external {
                // mapping already in the requested state
                return;
            }
            backend.delete_mapping(cur.id);
            *slot = None;
        }
        if local == 0 {
            return;
        }
        if let Some(id) = backend.add_mapping(protocol, local, external) {
            *slot = Some(MappingSlot { id, local, external });
        }
    }

    /// Forward the listen ports on the transports selected by `mask`
    /// (bit 0 = NAT-PMP, bit 1 = UPnP). A port of zero removes the
    /// mapping.
    pub fn remap(&mut self, mask: u32, tcp_port: u16, ssl_port: u16, udp_port: u16) {
        for t in 0..NUM_TRANSPORTS {
            if mask & (1 << t) == 0 {
                continue;
            }
            let backend = match self.backends[t].as_mut() {
                Some(b) => b.as_mut(),
                None => continue,
            };
            Self::remap_slot(backend, &mut self.tcp[t], PortMapProtocol::Tcp, tcp_port, tcp_port);
            Self::remap_slot(backend, &mut self.ssl[t], PortMapProtocol::Tcp, ssl_port, ssl_port);
            Self::remap_slot(backend, &mut self.udp[t], PortMapProtocol::Udp, udp_port, udp_port);
        }
    }

    /// A mapping result came back from one of the services.
    pub fn on_mapping(
        &mut self,
        transport: PortMapTransport,
        id: MappingId,
        external_port: u16,
        external_ip: Option<IpAddr>,
        alerts: &mut AlertQueue,
    ) {
        let t = transport_index(transport);
        for (slots, protocol) in [
            (&mut self.tcp[t], PortMapProtocol::Tcp),
            (&mut self.ssl[t], PortMapProtocol::Tcp),
            (&mut self.udp[t], PortMapProtocol::Udp),
        ] {
            let slot = match slots.as_mut() {
                Some(s) if s.id == id => s,
                _ => continue,
            };
            slot.external = external_port;
            match protocol {
                PortMapProtocol::Tcp => {
                    if let Some(ip) = external_ip {
                        if self.external_ip != Some(ip) {
                            self.external_ip = Some(ip);
                            alerts.post(Alert::ExternalIp(ip));
                        }
                    }
                }
                PortMapProtocol::Udp => {
                    self.external_udp_port = external_port;
                }
            }
            alerts.post(Alert::Portmap { transport, protocol, external_port });
            return;
        }
        debug!(?transport, id, "mapping result for unknown handle");
    }

    pub fn on_mapping_error(
        &mut self,
        transport: PortMapTransport,
        error: String,
        alerts: &mut AlertQueue,
    ) {
        alerts.post(Alert::PortmapError { transport, error });
    }

    /// Tear down every mapping (shutdown).
    pub fn clear(&mut self) {
        for t in 0..NUM_TRANSPORTS {
            if let Some(backend) = self.backends[t].as_mut() {
                for slot in [&mut self.tcp[t], &mut self.ssl[t], &mut self.udp[t]] {
                    if let Some(s) = slot.take() {
                        backend.delete_mapping(s.id);
                    }
                }
            }
        }
        self.external_udp_port = 0;
    }
}

impl Default for PortMapper {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// NAT-PMP backend
// ---------------------------------------------------------------------

const NATPMP_PORT: u16 = 5351;
const NATPMP_MAPPING_LIFETIME: u32 = 3600;

#[derive(Debug, Clone, Copy)]
pub struct NatpmpResponse {
    pub protocol: PortMapProtocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub result_code: u16,
    pub lifetime: u32,
}

/// Minimal NAT-PMP client: version-0 request datagrams to the default
/// gateway, responses surfaced through an event channel the session folds
/// into [`PortMapper::on_mapping`].
pub struct NatpmpClient {
    socket: Arc<UdpSocket>,
    gateway: SocketAddrV4,
    next_id: MappingId,
    /// (id, protocol, local port) of requests in flight or established.
    mappings: Vec<(MappingId, PortMapProtocol, u16)>,
}

impl NatpmpClient {
    /// Bind a socket towards the gateway and start the response reader.
    pub async fn bind(
        gateway: Ipv4Addr,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<NatpmpResponse>)> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                let (n, _from) = match reader.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "natpmp socket closed");
                        return;
                    }
                };
                if let Some(resp) = parse_natpmp_response(&buf[..n]) {
                    if tx.send(resp).is_err() {
                        return;
                    }
                }
            }
        });
        Ok((
            Self {
                socket,
                gateway: SocketAddrV4::new(gateway, NATPMP_PORT),
                next_id: 0,
                mappings: Vec::new(),
            },
            rx,
        ))
    }

    fn send_request(&self, protocol: PortMapProtocol, local: u16, external: u16, lifetime: u32) {
        let mut req = [0u8; 12];
        req[0] = 0; // version
        req[1] = match protocol {
            PortMapProtocol::Udp => 1,
            PortMapProtocol::Tcp => 2,
        };
        req[4..6].copy_from_slice(&local.to_be_bytes());
        req[6..8].copy_from_slice(&external.to_be_bytes());
        req[8..12].copy_from_slice(&lifetime.to_be_bytes());
        if let Err(e) = self.socket.try_send_to(&req, SocketAddr::V4(self.gateway)) {
            warn!(error = %e, gateway = %self.gateway, "natpmp send failed");
        }
    }
}

impl PortMapBackend for NatpmpClient {
    fn add_mapping(
        &mut self,
        protocol: PortMapProtocol,
        local_port: u16,
        external_port: u16,
    ) -> Option<MappingId> {
        self.send_request(protocol, local_port, external_port, NATPMP_MAPPING_LIFETIME);
        let id = self.next_id;
        self.next_id += 1;
        self.mappings.push((id, protocol, local_port));
        Some(id)
    }

    fn delete_mapping(&mut self, id: MappingId) {
        if let Some(pos) = self.mappings.iter().position(|(i, _, _)| *i == id) {
            let (_, protocol, local) = self.mappings.remove(pos);
            // lifetime 0 deletes the mapping
            self.send_request(protocol, local, 0, 0);
        }
    }

    fn mapping_for(&self, protocol: PortMapProtocol, local_port: u16) -> Option<MappingId> {
        self.mappings
            .iter()
            .find(|(_, proto, local)| *proto == protocol && *local == local_port)
            .map(|(id, _, _)| *id)
    }
}

fn parse_natpmp_response(buf: &[u8]) -> Option<NatpmpResponse> {
    if buf.len() < 16 || buf[0] != 0 {
        return None;
    }
    let protocol = match buf[1] {
        129 => PortMapProtocol::Udp,
        130 => PortMapProtocol::Tcp,
        _ => return None,
    };
    Some(NatpmpResponse {
        protocol,
        result_code: u16::from_be_bytes([buf[2], buf[3]]),
        internal_port: u16::from_be_bytes([buf[8], buf[9]]),
        external_port: u16::from_be_bytes([buf[10], buf[11]]),
        lifetime: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
    })
}

/// Default-gateway discovery for the NAT-PMP client.
#[cfg(target_os = "linux")]
pub fn default_gateway() -> Option<Ipv4Addr> {
    let data = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in data.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() > 2 && parts[1] == "00000000" {
            let gw = u32::from_str_radix(parts[2], 16).ok()?;
            let bytes = gw.to_le_bytes();
            return Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn default_gateway() -> Option<Ipv4Addr> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Op {
        Add(PortMapProtocol, u16, u16),
        Delete(MappingId),
    }

    struct FakeBackend {
        ops: Arc<Mutex<Vec<Op>>>,
        next: MappingId,
    }

    fn fake() -> (Arc<Mutex<Vec<Op>>>, Box<dyn PortMapBackend>) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        (ops.clone(), Box::new(FakeBackend { ops, next: 100 }))
    }

    impl PortMapBackend for FakeBackend {
        fn add_mapping(
            &mut self,
            protocol: PortMapProtocol,
            local_port: u16,
            external_port: u16,
        ) -> Option<MappingId> {
            self.ops.lock().push(Op::Add(protocol, local_port, external_port));
            let id = self.next;
            self.next += 1;
            Some(id)
        }

        fn delete_mapping(&mut self, id: MappingId) {
            self.ops.lock().push(Op::Delete(id));
        }
    }

    #[test]
    fn identical_remap_is_a_noop() {
        let (ops, backend) = fake();
        let mut pm = PortMapper::new();
        pm.set_backend(PortMapTransport::Natpmp, backend);
        pm.remap(1, 6881, 0, 6881);
        let count = ops.lock().len();
        pm.remap(1, 6881, 0, 6881);
        assert_eq!(ops.lock().len(), count);
    }

    #[test]
    fn changed_port_deletes_then_recreates() {
        let (ops, backend) = fake();
        let mut pm = PortMapper::new();
        pm.set_backend(PortMapTransport::Natpmp, backend);
        pm.remap(1, 6881, 0, 0);
        ops.lock().clear();
        pm.remap(1, 6882, 0, 0);
        let recorded = ops.lock().clone();
        assert_eq!(recorded[0], Op::Delete(100));
        assert_eq!(recorded[1], Op::Add(PortMapProtocol::Tcp, 6882, 6882));
    }

    #[test]
    fn udp_mapping_updates_external_port() {
        let (_ops, backend) = fake();
        let mut pm = PortMapper::new();
        let mut alerts = AlertQueue::default();
        pm.set_backend(PortMapTransport::Natpmp, backend);
        pm.remap(1, 0, 0, 6881);
        // the fake backend's first id is 100
        pm.on_mapping(PortMapTransport::Natpmp, 100, 40_000, None, &mut alerts);
        assert_eq!(pm.external_udp_port(), 40_000);
        assert!(alerts
            .pop_all()
            .iter()
            .any(|a| matches!(a, Alert::Portmap { protocol: PortMapProtocol::Udp, .. })));
    }

    #[test]
    fn tcp_mapping_reports_external_ip_once() {
        let (_ops, backend) = fake();
        let mut pm = PortMapper::new();
        let mut alerts = AlertQueue::default();
        pm.set_backend(PortMapTransport::Upnp, backend);
        pm.remap(2, 6881, 0, 0);
        let ip: IpAddr = "198.51.100.7".parse().unwrap();
        pm.on_mapping(PortMapTransport::Upnp, 100, 6881, Some(ip), &mut alerts);
        pm.on_mapping(PortMapTransport::Upnp, 100, 6881, Some(ip), &mut alerts);
        let external_ips = alerts
            .pop_all()
            .iter()
            .filter(|a| matches!(a, Alert::ExternalIp(_)))
            .count();
        assert_eq!(external_ips, 1);
    }

    #[test]
    fn natpmp_wire_parse() {
        let mut resp = [0u8; 16];
        resp[1] = 130; // TCP add response
        resp[8..10].copy_from_slice(&6881u16.to_be_bytes());
        resp[10..12].copy_from_slice(&40000u16.to_be_bytes());
        resp[12..16].copy_from_slice(&3600u32.to_be_bytes());
        let parsed = parse_natpmp_response(&resp).unwrap();
        assert_eq!(parsed.protocol, PortMapProtocol::Tcp);
        assert_eq!(parsed.internal_port, 6881);
        assert_eq!(parsed.external_port, 40000);
        assert_eq!(parsed.result_code, 0);
    }
}
