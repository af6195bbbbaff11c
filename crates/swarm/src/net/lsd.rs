use crate::InfoHash;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

/// Multicast address/port for Local Service Discovery (BEP 14)
const LSD_MCAST_V4: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
const LSD_PORT: u16 = 6771;

fn build_bt_search(port: u16, infohash_hex: &str) -> Vec<u8> {
    let mut s = String::new();
    s.push_str("BT-SEARCH * HTTP/1.1\r\n");
    s.push_str("Host: 239.192.152.143:6771\r\n");
    s.push_str(&format!("Port: {}\r\n", port));
    s.push_str(&format!("Infohash: {}\r\n", infohash_hex));
    s.push_str("\r\n");
    s.into_bytes()
}

fn parse_bt_search(buf: &[u8]) -> Option<(InfoHash, u16)> {
    let s = std::str::from_utf8(buf).ok()?;
    if !s.starts_with("BT-SEARCH ") {
        return None;
    }
    let mut infohash: Option<InfoHash> = None;
    let mut port: Option<u16> = None;
    for line in s.lines() {
        if let Some(rest) = line.strip_prefix("Infohash:") {
            let v = rest.trim();
            if v.len() == 40 {
                if let Ok(bytes) = hex::decode(v) {
                    let mut ih = [0u8; 20];
                    ih.copy_from_slice(&bytes);
                    infohash = Some(ih);
                }
            }
        } else if let Some(rest) = line.strip_prefix("Port:") {
            if let Ok(p) = rest.trim().parse::<u16>() {
                port = Some(p);
            }
        }
    }
    match (infohash, port) {
        (Some(h), Some(p)) => Some((h, p)),
        _ => None,
    }
}

/// Session-wide local service discovery: one multicast socket, announces
/// issued per torrent by the session's LSD round-robin, discovered peers
/// reported through the callback.
pub struct Lsd {
    sock: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Lsd {
    pub fn start(
        mut on_peer: impl FnMut(InfoHash, SocketAddr) + Send + 'static,
    ) -> io::Result<Self> {
        let std_sock = StdUdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, LSD_PORT)))?;
        std_sock.set_nonblocking(true)?;
        let _ = std_sock.join_multicast_v4(&LSD_MCAST_V4, &Ipv4Addr::UNSPECIFIED);
        let sock = Arc::new(UdpSocket::from_std(std_sock)?);

        let rx_sock = sock.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let (n, src) = match rx_sock.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "lsd socket closed");
                        return;
                    }
                };
                if n == 0 {
                    continue;
                }
                if let Some((ih, port)) = parse_bt_search(&buf[..n]) {
                    // discovered peer: source address, advertised port
                    on_peer(ih, SocketAddr::new(src.ip(), port));
                }
            }
        });
        Ok(Self { sock, task })
    }

    /// Multicast one announce for a torrent.
    pub fn announce(&self, info_hash: &InfoHash, listen_port: u16) {
        let payload = build_bt_search(listen_port, &hex::encode(info_hash));
        let mcast = SocketAddr::from((IpAddr::V4(LSD_MCAST_V4), LSD_PORT));
        let _ = self.sock.try_send_to(&payload, mcast);
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bt_search_round_trip() {
        let ih = [0xabu8; 20];
        let raw = build_bt_search(6881, &hex::encode(ih));
        let (parsed_ih, port) = parse_bt_search(&raw).unwrap();
        assert_eq!(parsed_ih, ih);
        assert_eq!(port, 6881);
    }

    #[test]
    fn non_bt_search_rejected() {
        assert!(parse_bt_search(b"GET / HTTP/1.1\r\n\r\n").is_none());
        assert!(parse_bt_search(b"BT-SEARCH * HTTP/1.1\r\nPort: 1\r\n\r\n").is_none());
    }

    #[test]
    fn bad_infohash_length_rejected() {
        let raw = b"BT-SEARCH * HTTP/1.1\r\nPort: 6881\r\nInfohash: abcd\r\n\r\n";
        assert!(parse_bt_search(raw).is_none());
    }
}
