pub mod listen;
pub mod lsd;
pub mod transport;
pub mod utp;

/// What kind of socket a peer arrived on (or was dialed with). Drives the
/// peer-class type filter and the incoming-connection gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Tcp,
    TcpSsl,
    Utp,
    UtpSsl,
    I2p,
}

impl SocketKind {
    pub fn is_utp(self) -> bool {
        matches!(self, SocketKind::Utp | SocketKind::UtpSsl)
    }

    pub fn is_ssl(self) -> bool {
        matches!(self, SocketKind::TcpSsl | SocketKind::UtpSsl)
    }
}
