use crate::InfoHash;
use std::collections::VecDeque;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

/// A request handed to the tracker manager. The HTTP/UDP request bodies
/// are the tracker collaborator's concern; the session fills in the
/// identity fields (listen port, key, bind address) before queueing.
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub url: String,
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub event: Option<AnnounceEvent>,
    pub listen_port: u16,
    pub key: u32,
    pub bind_ip: Option<IpAddr>,
    /// SSL torrents announce with their own context and the SSL port.
    pub ssl: bool,
}

/// Outbound tracker request queue.
pub struct TrackerManager {
    queue: VecDeque<TrackerRequest>,
    aborted: bool,
}

impl TrackerManager {
    pub fn new() -> Self {
        Self { queue: VecDeque::new(), aborted: false }
    }

    pub fn queue_request(&mut self, req: TrackerRequest) {
        if self.aborted {
            return;
        }
        self.queue.push_back(req);
    }

    /// Next request for the tracker transport to execute.
    pub fn pop_request(&mut self) -> Option<TrackerRequest> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn abort_all_requests(&mut self) {
        self.aborted = true;
        self.queue.clear();
    }
}

impl Default for TrackerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_abort() {
        let mut tm = TrackerManager::new();
        for i in 0..3u8 {
            tm.queue_request(TrackerRequest {
                url: format!("udp://tracker.example.com:{i}"),
                info_hash: [i; 20],
                peer_id: [0u8; 20],
                event: Some(AnnounceEvent::Started),
                listen_port: 6881,
                key: 1,
                bind_ip: None,
                ssl: false,
            });
        }
        assert_eq!(tm.pop_request().unwrap().info_hash, [0u8; 20]);
        tm.abort_all_requests();
        assert!(tm.pop_request().is_none());
        tm.queue_request(TrackerRequest {
            url: "udp://tracker.example.com:1".into(),
            info_hash: [9u8; 20],
            peer_id: [0u8; 20],
            event: None,
            listen_port: 6881,
            key: 1,
            bind_ip: None,
            ssl: false,
        });
        assert!(tm.is_empty());
    }
}
