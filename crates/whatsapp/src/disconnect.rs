//! Disconnect classification.
//!
//! The network reports why a connection closed with an HTTP-like status code.
//! Every code maps to exactly one [`DisconnectReason`]; anything unrecognized
//! lands in [`DisconnectReason::Unknown`], which is handled as terminal.

use std::fmt;

/// Status codes reported by the network on close.
pub mod status {
    pub const LOGGED_OUT: u16 = 401;
    /// Shared by "connection lost" and "timed out" on the wire.
    pub const TIMED_OUT: u16 = 408;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const RESTART_REQUIRED: u16 = 515;
}

/// Causes that are retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverableCause {
    ConnectionClosed,
    /// The event stream ended without a close event (client died).
    ConnectionLost,
    TimedOut,
    RestartRequired,
}

/// Why the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    BadSession,
    LoggedOut,
    Replaced,
    Recoverable(RecoverableCause),
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_status(code: Option<u16>) -> Self {
        match code {
            Some(status::BAD_SESSION) => Self::BadSession,
            Some(status::LOGGED_OUT) => Self::LoggedOut,
            Some(status::CONNECTION_REPLACED) => Self::Replaced,
            Some(status::CONNECTION_CLOSED) => {
                Self::Recoverable(RecoverableCause::ConnectionClosed)
            },
            Some(status::TIMED_OUT) => Self::Recoverable(RecoverableCause::TimedOut),
            Some(status::RESTART_REQUIRED) => Self::Recoverable(RecoverableCause::RestartRequired),
            other => Self::Unknown(other),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    /// Operator-facing hint logged when the session ends.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::BadSession => "bad session file, delete the session and scan again",
            Self::LoggedOut | Self::Replaced => "device logged out, delete the session and scan again",
            Self::Recoverable(RecoverableCause::RestartRequired) => "restart required, restarting",
            Self::Recoverable(_) => "connection closed, reconnecting",
            Self::Unknown(_) => "unknown disconnect reason, pair again to reconnect",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSession => f.write_str("bad_session"),
            Self::LoggedOut => f.write_str("logged_out"),
            Self::Replaced => f.write_str("replaced"),
            Self::Recoverable(RecoverableCause::ConnectionClosed) => f.write_str("connection_closed"),
            Self::Recoverable(RecoverableCause::ConnectionLost) => f.write_str("connection_lost"),
            Self::Recoverable(RecoverableCause::TimedOut) => f.write_str("timed_out"),
            Self::Recoverable(RecoverableCause::RestartRequired) => f.write_str("restart_required"),
            Self::Unknown(Some(code)) => write!(f, "unknown({code})"),
            Self::Unknown(None) => f.write_str("unknown"),
        }
    }
}
