use crate::net::SocketKind;
use crate::peer_class::PeerClassId;
use std::net::{IpAddr, Ipv4Addr};

/// Flag bit used by the blocking ip filter.
pub const BLOCKED: u32 = 1;

/// Maps ip ranges to 32-bit flag masks. Used both as the access-control
/// filter (flags = [`BLOCKED`]) and as the peer-class filter (flags = class
/// mask). Overlapping rules union their flags.
#[derive(Debug, Clone, Default)]
pub struct IpRangeFilter {
    v4: Vec<(u32, u32, u32)>,
    v6: Vec<(u128, u128, u32)>,
}

impl IpRangeFilter {
    pub fn add_rule(&mut self, start: IpAddr, end: IpAddr, flags: u32) {
        match (start, end) {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                let (mut s, mut e) = (u32::from(s), u32::from(e));
                if s > e {
                    std::mem::swap(&mut s, &mut e);
                }
                self.v4.push((s, e, flags));
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                let (mut s, mut e) = (u128::from(s), u128::from(e));
                if s > e {
                    std::mem::swap(&mut s, &mut e);
                }
                self.v6.push((s, e, flags));
            }
            // mixed-family rules are meaningless, drop them
            _ => {}
        }
    }

    pub fn access(&self, addr: IpAddr) -> u32 {
        match addr {
            IpAddr::V4(ip) => {
                let v = u32::from(ip);
                self.v4
                    .iter()
                    .filter(|(s, e, _)| v >= *s && v <= *e)
                    .fold(0, |acc, (_, _, f)| acc | f)
            }
            IpAddr::V6(ip) => {
                let v = u128::from(ip);
                self.v6
                    .iter()
                    .filter(|(s, e, _)| v >= *s && v <= *e)
                    .fold(0, |acc, (_, _, f)| acc | f)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

/// The default peer-class filter: v4 private and loopback ranges map to the
/// `local` class.
pub fn default_peer_class_filter(local_class: PeerClassId) -> IpRangeFilter {
    let mask = 1u32 << local_class;
    let mut f = IpRangeFilter::default();
    let ranges: [(Ipv4Addr, Ipv4Addr); 5] = [
        (Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 255, 255, 255)),
        (Ipv4Addr::new(172, 16, 0, 0), Ipv4Addr::new(172, 31, 255, 255)),
        (Ipv4Addr::new(192, 168, 0, 0), Ipv4Addr::new(192, 168, 255, 255)),
        (Ipv4Addr::new(169, 254, 0, 0), Ipv4Addr::new(169, 254, 255, 255)),
        (Ipv4Addr::new(127, 0, 0, 0), Ipv4Addr::new(127, 255, 255, 255)),
    ];
    for (start, end) in ranges {
        f.add_rule(IpAddr::V4(start), IpAddr::V4(end), mask);
    }
    f
}

/// Maps port ranges to flag masks ([`BLOCKED`]).
#[derive(Debug, Clone, Default)]
pub struct PortFilter {
    ranges: Vec<(u16, u16, u32)>,
}

impl PortFilter {
    pub fn add_rule(&mut self, start: u16, end: u16, flags: u32) {
        let (mut s, mut e) = (start, end);
        if s > e {
            std::mem::swap(&mut s, &mut e);
        }
        self.ranges.push((s, e, flags));
    }

    pub fn access(&self, port: u16) -> u32 {
        self.ranges
            .iter()
            .filter(|(s, e, _)| port >= *s && port <= *e)
            .fold(0, |acc, (_, _, f)| acc | f)
    }
}

/// The `no_connect_privileged_ports` filter.
pub fn privileged_port_filter() -> PortFilter {
    let mut f = PortFilter::default();
    f.add_rule(0, 1023, BLOCKED);
    f
}

const NUM_SOCKET_TYPES: usize = 5;

fn type_index(kind: SocketKind) -> usize {
    match kind {
        SocketKind::Tcp => 0,
        SocketKind::TcpSsl => 1,
        SocketKind::Utp => 2,
        SocketKind::UtpSsl => 3,
        SocketKind::I2p => 4,
    }
}

/// Refines an ip-derived class mask by socket type: per type, classes can
/// be force-inserted or disallowed.
#[derive(Debug, Clone)]
pub struct PeerClassTypeFilter {
    allow: [u32; NUM_SOCKET_TYPES],
    insert: [u32; NUM_SOCKET_TYPES],
}

impl Default for PeerClassTypeFilter {
    fn default() -> Self {
        Self { allow: [u32::MAX; NUM_SOCKET_TYPES], insert: [0; NUM_SOCKET_TYPES] }
    }
}

impl PeerClassTypeFilter {
    /// Always add `class` to peers of this socket type.
    pub fn add(&mut self, kind: SocketKind, class: PeerClassId) {
        self.insert[type_index(kind)] |= 1 << class;
    }

    pub fn remove(&mut self, kind: SocketKind, class: PeerClassId) {
        self.insert[type_index(kind)] &= !(1 << class);
    }

    /// Never let peers of this socket type keep `class`.
    pub fn disallow(&mut self, kind: SocketKind, class: PeerClassId) {
        self.allow[type_index(kind)] &= !(1 << class);
    }

    pub fn allow(&mut self, kind: SocketKind, class: PeerClassId) {
        self.allow[type_index(kind)] |= 1 << class;
    }

    pub fn apply(&self, kind: SocketKind, class_mask: u32) -> u32 {
        let i = type_index(kind);
        (class_mask & self.allow[i]) | self.insert[i]
    }
}
