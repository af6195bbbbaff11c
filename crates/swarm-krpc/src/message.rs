//! KRPC message encoding and decoding (BEP 5).
//!
//! Queries are built with the fixed key order `a`, `q`, `t`, `v`, `y`;
//! incoming packets are decoded into a [`Message`] that keeps every field
//! optional so the caller can report the precise validation failure
//! (`t` length, missing `r`, missing `id`) back to the sender.

use crate::bencode::{write_bstr, write_int, write_str};
use bendy::decoding::Decoder;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const NODE_ID_LEN: usize = 20;
pub const TID_LEN: usize = 2;

// Client identification (2 chars) + version (2 bytes)
// "SW" = swarm
pub const CLIENT_VERSION: &[u8; 4] = b"SW\x00\x01";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not a bencoded dictionary")]
    NotADictionary,
    #[error("missing 'y' key")]
    MissingMessageType,
    #[error("missing 't' key")]
    MissingTransactionId,
    #[error("bencode error: {0}")]
    Bencode(String),
}

impl From<bendy::decoding::Error> for ParseError {
    fn from(e: bendy::decoding::Error) -> Self {
        Self::Bencode(e.to_string())
    }
}

/// An outgoing query body. The transaction id and our node id are stamped
/// on by the sender.
#[derive(Debug, Clone)]
pub enum Query {
    Ping,
    FindNode { target: [u8; NODE_ID_LEN] },
    GetPeers { info_hash: [u8; NODE_ID_LEN] },
    AnnouncePeer { info_hash: [u8; NODE_ID_LEN], port: u16, token: Vec<u8> },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Reply,
    Error,
}

/// Reply payload (`r` dictionary). All fields optional; validation is the
/// caller's business.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub id: Option<Vec<u8>>,
    pub nodes: Vec<NodeEntry>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub id: [u8; NODE_ID_LEN],
    pub addr: SocketAddr,
}

/// A decoded incoming packet.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// Raw `t` field, any length. Exactly [`TID_LEN`] bytes for messages
    /// this runtime produced.
    pub tid: Vec<u8>,
    /// `q` method name for queries.
    pub method: Option<String>,
    /// `a` arguments id for queries.
    pub query_id: Option<Vec<u8>>,
    /// `r` dictionary, present only if the packet carried one.
    pub response: Option<Response>,
    /// `e` list, `(code, message)`.
    pub error: Option<(i64, String)>,
}

impl Message {
    /// The transaction id as a compact integer, or `None` when the `t`
    /// field is not exactly two bytes.
    pub fn transaction_id(&self) -> Option<u16> {
        if self.tid.len() != TID_LEN {
            return None;
        }
        Some(u16::from_be_bytes([self.tid[0], self.tid[1]]))
    }
}

pub fn encode_query(tid: u16, node_id: &[u8; NODE_ID_LEN], query: &Query) -> Vec<u8> {
    let mut out = Vec::with_capacity(160);
    out.push(b'd');
    // a
    write_str(&mut out, "a");
    out.push(b'd');
    write_str(&mut out, "id");
    write_bstr(&mut out, node_id);
    match query {
        Query::Ping => {}
        Query::FindNode { target } => {
            write_str(&mut out, "target");
            write_bstr(&mut out, target);
        }
        Query::GetPeers { info_hash } => {
            write_str(&mut out, "info_hash");
            write_bstr(&mut out, info_hash);
        }
        Query::AnnouncePeer { info_hash, port, token } => {
            write_str(&mut out, "info_hash");
            write_bstr(&mut out, info_hash);
            write_str(&mut out, "port");
            write_int(&mut out, *port as i64);
            write_str(&mut out, "token");
            write_bstr(&mut out, token);
        }
    }
    out.push(b'e');
    // q
    write_str(&mut out, "q");
    write_str(&mut out, query.method());
    // t
    write_str(&mut out, "t");
    write_bstr(&mut out, &tid.to_be_bytes());
    // v
    write_str(&mut out, "v");
    write_bstr(&mut out, CLIENT_VERSION);
    // y
    write_str(&mut out, "y");
    write_str(&mut out, "q");
    out.push(b'e');
    out
}

/// A plain reply carrying only our node id, echoing the sender's raw `t`.
pub fn encode_reply(tid: &[u8], node_id: &[u8; NODE_ID_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.push(b'd');
    write_str(&mut out, "r");
    out.push(b'd');
    write_str(&mut out, "id");
    write_bstr(&mut out, node_id);
    out.push(b'e');
    write_str(&mut out, "t");
    write_bstr(&mut out, tid);
    write_str(&mut out, "v");
    write_bstr(&mut out, CLIENT_VERSION);
    write_str(&mut out, "y");
    write_str(&mut out, "r");
    out.push(b'e');
    out
}

pub fn encode_error(tid: &[u8], code: i64, msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.push(b'd');
    write_str(&mut out, "e");
    out.push(b'l');
    write_int(&mut out, code);
    write_str(&mut out, msg);
    out.push(b'e');
    write_str(&mut out, "t");
    write_bstr(&mut out, tid);
    write_str(&mut out, "y");
    write_str(&mut out, "e");
    out.push(b'e');
    out
}

pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    if bytes.len() % 6 != 0 {
        return out;
    }
    for chunk in bytes.chunks_exact(6) {
        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
        out.push(SocketAddr::new(IpAddr::V4(ip), port));
    }
    out
}

pub fn parse_compact_nodes(bytes: &[u8]) -> Vec<NodeEntry> {
    // 26 bytes per node: 20 node id + 6 compact addr
    let mut out = Vec::new();
    for chunk in bytes.chunks_exact(26) {
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&chunk[0..20]);
        let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
        let port = u16::from_be_bytes([chunk[24], chunk[25]]);
        out.push(NodeEntry { id, addr: SocketAddr::new(IpAddr::V4(ip), port) });
    }
    out
}

pub fn compact_nodes(nodes: &[NodeEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for n in nodes {
        if let SocketAddr::V4(v4) = n.addr {
            out.extend_from_slice(&n.id);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
}

fn parse_compact_peers_v6(bytes: &[u8]) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    if bytes.len() % 18 != 0 {
        return out;
    }
    for chunk in bytes.chunks_exact(18) {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&chunk[..16]);
        let ip = Ipv6Addr::from(octets);
        let port = u16::from_be_bytes([chunk[16], chunk[17]]);
        out.push(SocketAddr::new(IpAddr::V6(ip), port));
    }
    out
}

pub fn parse_message(data: &[u8]) -> Result<Message, ParseError> {
    let mut decoder = Decoder::new(data);
    let obj = decoder
        .next_object()?
        .ok_or(ParseError::NotADictionary)?;
    let mut dict = obj
        .try_into_dictionary()
        .map_err(|_| ParseError::NotADictionary)?;

    let mut kind: Option<MessageKind> = None;
    let mut tid: Option<Vec<u8>> = None;
    let mut method: Option<String> = None;
    let mut query_id: Option<Vec<u8>> = None;
    let mut response: Option<Response> = None;
    let mut error: Option<(i64, String)> = None;

    while let Ok(Some((k, v))) = dict.next_pair() {
        match k {
            b"y" => {
                if let Ok(b) = v.try_into_bytes() {
                    kind = match b {
                        b"q" => Some(MessageKind::Query),
                        b"r" => Some(MessageKind::Reply),
                        b"e" => Some(MessageKind::Error),
                        _ => None,
                    };
                }
            }
            b"t" => {
                if let Ok(b) = v.try_into_bytes() {
                    tid = Some(b.to_vec());
                }
            }
            b"q" => {
                if let Ok(b) = v.try_into_bytes() {
                    method = Some(String::from_utf8_lossy(b).into_owned());
                }
            }
            b"a" => {
                if let Ok(mut adict) = v.try_into_dictionary() {
                    while let Ok(Some((ak, av))) = adict.next_pair() {
                        if ak == b"id" {
                            if let Ok(b) = av.try_into_bytes() {
                                query_id = Some(b.to_vec());
                            }
                        }
                    }
                }
            }
            b"r" => {
                if let Ok(mut rdict) = v.try_into_dictionary() {
                    let mut r = Response::default();
                    while let Ok(Some((rk, rv))) = rdict.next_pair() {
                        match rk {
                            b"id" => {
                                if let Ok(b) = rv.try_into_bytes() {
                                    r.id = Some(b.to_vec());
                                }
                            }
                            b"nodes" => {
                                if let Ok(b) = rv.try_into_bytes() {
                                    r.nodes = parse_compact_nodes(b);
                                }
                            }
                            b"values" => {
                                if let Ok(mut list) = rv.try_into_list() {
                                    while let Ok(Some(item)) = list.next_object() {
                                        if let Ok(b) = item.try_into_bytes() {
                                            // each value is a single compact endpoint:
                                            // 6 bytes v4, 18 bytes v6
                                            match b.len() {
                                                6 => r.values.extend(parse_compact_peers(b)),
                                                18 => r.values.extend(parse_compact_peers_v6(b)),
                                                _ => {}
                                            }
                                        }
                                    }
                                }
                            }
                            b"token" => {
                                if let Ok(b) = rv.try_into_bytes() {
                                    r.token = Some(b.to_vec());
                                }
                            }
                            _ => {}
                        }
                    }
                    response = Some(r);
                }
            }
            b"e" => {
                if let Ok(mut list) = v.try_into_list() {
                    let code = match list.next_object() {
                        Ok(Some(obj)) => obj
                            .try_into_integer()
                            .ok()
                            .and_then(|i| i.parse::<i64>().ok())
                            .unwrap_or(0),
                        _ => 0,
                    };
                    let msg = match list.next_object() {
                        Ok(Some(obj)) => obj
                            .try_into_bytes()
                            .map(|b| String::from_utf8_lossy(b).into_owned())
                            .unwrap_or_default(),
                        _ => String::new(),
                    };
                    error = Some((code, msg));
                }
            }
            _ => {}
        }
    }

    let kind = kind.ok_or(ParseError::MissingMessageType)?;
    let tid = tid.ok_or(ParseError::MissingTransactionId)?;
    Ok(Message { kind, tid, method, query_id, response, error })
}
