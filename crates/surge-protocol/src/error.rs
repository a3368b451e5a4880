//! Error taxonomy shared by the server and the delivery engine.

use thiserror::Error;

/// Protocol-level failures with their wire codes.
///
/// Fatal variants close the connection after a best-effort error response;
/// non-fatal variants are answered with a coded response and the connection
/// stays open.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PushError {
    /// A send command arrived before a successful `login`.
    #[error("client has not logged in")]
    NotAuthenticated,

    /// Login rejected, including a second `login` on an authenticated
    /// connection.
    #[error("login failed")]
    LoginFailed,

    /// Unrecognized command name.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// The command's data payload did not decode, or the command cannot be
    /// sent in this direction.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("dest connection not found")]
    TargetConnectionNotFound,

    #[error("dest user not found")]
    TargetUserNotFound,

    #[error("dest channel not found")]
    TargetChannelNotFound,

    /// Broken framing or an internally inconsistent session; always closes
    /// the connection.
    #[error("protocol failure: {0}")]
    ProtocolFatal(String),

    /// An external-store call failed. Never closes a connection; only
    /// degrades cross-node routing.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

impl PushError {
    /// The negative wire code carried in the response envelope.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            PushError::NotAuthenticated => -11,
            PushError::LoginFailed => -12,
            PushError::UnsupportedCommand(_) => -21,
            PushError::MalformedCommand(_) => -22,
            PushError::TargetConnectionNotFound => -41,
            PushError::TargetUserNotFound => -42,
            PushError::TargetChannelNotFound => -43,
            PushError::ProtocolFatal(_) => -1,
            PushError::DependencyUnavailable(_) => -51,
        }
    }

    /// Whether this error terminates the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PushError::NotAuthenticated
                | PushError::LoginFailed
                | PushError::UnsupportedCommand(_)
                | PushError::MalformedCommand(_)
                | PushError::ProtocolFatal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(PushError::NotAuthenticated.code(), -11);
        assert_eq!(PushError::LoginFailed.code(), -12);
        assert_eq!(PushError::UnsupportedCommand("x".into()).code(), -21);
        assert_eq!(PushError::MalformedCommand("x".into()).code(), -22);
        assert_eq!(PushError::TargetConnectionNotFound.code(), -41);
        assert_eq!(PushError::TargetUserNotFound.code(), -42);
        assert_eq!(PushError::TargetChannelNotFound.code(), -43);
        assert_eq!(PushError::DependencyUnavailable("x".into()).code(), -51);
    }

    #[test]
    fn test_fatality() {
        assert!(PushError::NotAuthenticated.is_fatal());
        assert!(PushError::LoginFailed.is_fatal());
        assert!(PushError::UnsupportedCommand("x".into()).is_fatal());
        assert!(!PushError::TargetConnectionNotFound.is_fatal());
        assert!(!PushError::TargetUserNotFound.is_fatal());
        assert!(!PushError::TargetChannelNotFound.is_fatal());
        assert!(!PushError::DependencyUnavailable("x".into()).is_fatal());
    }
}
