use crate::icmp::IcmpError;

/// Errors raised by the ping engine.
///
/// Only [`PingError::SetupFailed`] and [`PingError::SessionTerminated`] end a
/// session; everything else is reported per attempt and pinging continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PingError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("session is already running")]
    AlreadyRunning,

    #[error("unable to resolve host '{0}'")]
    UnresolvedHost(String),

    #[error("permission denied creating ICMP socket: {0}. Administrator privileges may be required.")]
    PermissionDenied(String),

    #[error("failed to set up ICMP socket: {0}")]
    SocketSetup(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("icmp_seq={sequence}: {error}")]
    Remote { sequence: u16, error: IcmpError },

    #[error("all 65536 sequence numbers are outstanding")]
    SequenceSpaceExhausted,

    #[error("setup failed: {0}")]
    SetupFailed(Box<PingError>),

    #[error("session terminated: {0}")]
    SessionTerminated(String),
}

impl PingError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PingError::SetupFailed(_) | PingError::SessionTerminated(_))
    }
}
