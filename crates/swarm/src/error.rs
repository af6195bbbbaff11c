use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("bencode decode error: {0}")]
    Bencode(String),
    #[error("no such device: {0}")]
    NoSuchDevice(String),
    #[error("duplicate torrent")]
    DuplicateTorrent,
    #[error("unknown torrent")]
    UnknownTorrent,
    #[error("torrent metadata unavailable: {0}")]
    Metadata(String),
    #[error("session is shutting down")]
    Aborted,
}

impl From<bendy::decoding::Error> for SwarmError {
    fn from(e: bendy::decoding::Error) -> Self {
        Self::Bencode(e.to_string())
    }
}

/// Why a peer was disconnected. Carried on the peer-disconnected alert and
/// handed to the peer's I/O task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TooManyConnections,
    StoppingTorrent,
    TimedOut,
    OptimisticDisconnect,
    TooManyOpenFiles,
    PeerError,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::TooManyConnections => "too many connections",
            DisconnectReason::StoppingTorrent => "stopping torrent",
            DisconnectReason::TimedOut => "timed out",
            DisconnectReason::OptimisticDisconnect => "optimistic disconnect",
            DisconnectReason::TooManyOpenFiles => "too many open files",
            DisconnectReason::PeerError => "peer error",
        };
        f.write_str(s)
    }
}

/// Which listen-socket operation failed, for the listen-failed alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenOp {
    Open,
    Bind,
    Listen,
    GetSocketName,
}
