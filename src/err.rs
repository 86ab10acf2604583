use crate::tcp::Fate;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tun device error: {0}")]
    Tun(#[from] tidy_tuntap::error::Error),

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("port {0} has been closed")]
    PortClosed(u16),

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("peer unreachable: retransmission limit exceeded")]
    PeerUnreachable,

    #[error("socket is not connected")]
    NotConnected,
}

impl From<Fate> for Error {
    fn from(fate: Fate) -> Self {
        match fate {
            Fate::Reset => Error::ConnectionReset,
            Fate::Refused => Error::ConnectionRefused,
            Fate::Unreachable => Error::PeerUnreachable,
        }
    }
}
