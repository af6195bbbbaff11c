use crate::error::{DisconnectReason, ListenOp};
use crate::net::SocketKind;
use crate::portmap::{PortMapProtocol, PortMapTransport};
use crate::torrent::TorrentStatus;
use crate::InfoHash;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

pub const DEFAULT_ALERT_QUEUE_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    IpFilter,
    PortFilter,
    TcpDisabled,
    UtpDisabled,
    InvalidLocalInterface,
    PrivilegedPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceIssue {
    BittyrantWithNoUplimit,
    UploadLimitTooLow,
    DownloadLimitTooLow,
    TooManyOptimisticUnchokeSlots,
}

/// Aggregate counters snapshot posted on request.
#[derive(Debug, Clone, Default)]
pub struct SessionStatsSnapshot {
    pub num_connections: usize,
    pub num_unchoked: usize,
    pub incoming_connections: u64,
    pub connection_attempts: u64,
    pub torrents_evicted: u64,
    pub upload_rate: i64,
    pub download_rate: i64,
    pub peak_upload_rate: i64,
    pub peak_download_rate: i64,
}

/// Observable session events. Produced into a bounded queue; when the queue
/// is full the oldest events are dropped.
#[derive(Debug, Clone)]
pub enum Alert {
    ListenFailed {
        device: String,
        op: ListenOp,
        error: String,
        kind: SocketKind,
    },
    ListenSucceeded {
        endpoint: SocketAddr,
        kind: SocketKind,
    },
    ExternalIp(IpAddr),
    Portmap {
        transport: PortMapTransport,
        protocol: PortMapProtocol,
        external_port: u16,
    },
    PortmapError {
        transport: PortMapTransport,
        error: String,
    },
    PortmapLog {
        transport: PortMapTransport,
        line: String,
    },
    PeerBlocked {
        addr: IpAddr,
        reason: BlockReason,
    },
    PeerDisconnected {
        addr: SocketAddr,
        reason: DisconnectReason,
    },
    IncomingConnection {
        kind: SocketKind,
        addr: SocketAddr,
    },
    UdpError {
        addr: SocketAddr,
        error: String,
    },
    TorrentAdded(InfoHash),
    TorrentRemoved(InfoHash),
    TorrentDeleteFailed {
        info_hash: InfoHash,
        error: String,
    },
    PerformanceWarning(PerformanceIssue),
    LsdPeer {
        addr: SocketAddr,
        info_hash: InfoHash,
    },
    DhtError {
        error: String,
    },
    DhtBootstrap {
        num_nodes: usize,
    },
    DhtImmutableItem {
        target: InfoHash,
        item: Vec<u8>,
    },
    DhtMutableItem {
        key: [u8; 32],
        item: Vec<u8>,
    },
    DhtPut {
        target: InfoHash,
    },
    StateUpdate(Vec<TorrentStatus>),
    SessionStats(SessionStatsSnapshot),
}

/// Bounded alert sink. Oldest-first drop when full.
pub struct AlertQueue {
    queue: VecDeque<Alert>,
    limit: usize,
    dropped: u64,
}

impl AlertQueue {
    pub fn new(limit: usize) -> Self {
        Self { queue: VecDeque::with_capacity(limit.min(64)), limit, dropped: 0 }
    }

    pub fn post(&mut self, alert: Alert) {
        while self.queue.len() >= self.limit {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(alert);
    }

    /// Drain all queued alerts, oldest first.
    pub fn pop_all(&mut self) -> Vec<Alert> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for AlertQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_QUEUE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_dropped_when_full() {
        let mut q = AlertQueue::new(2);
        q.post(Alert::TorrentAdded([1u8; 20]));
        q.post(Alert::TorrentAdded([2u8; 20]));
        q.post(Alert::TorrentAdded([3u8; 20]));
        let drained = q.pop_all();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Alert::TorrentAdded(ih) if ih == [2u8; 20]));
        assert!(matches!(drained[1], Alert::TorrentAdded(ih) if ih == [3u8; 20]));
        assert_eq!(q.dropped(), 1);
    }
}
