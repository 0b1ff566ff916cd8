//! NBD client error types
//!
//! Errors returned synchronously by handle operations, errors delivered to
//! completion callbacks, and the errno values carried on the wire.

use std::fmt;
use std::io;

use thiserror::Error;

/// Client result type
pub type ClientResult<T> = Result<T, ClientError>;

/// Client error types
#[derive(Debug, Error)]
pub enum ClientError {
    /// Operation is not legal in the current phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Capability or export info queried before the negotiation step that provides it
    #[error("Not negotiated: {0}")]
    NotNegotiated(String),

    /// Server rejected an option or command
    #[error("Server rejected request ({reason}): {message}")]
    Protocol {
        /// Server-supplied reason code
        reason: ServerReason,
        /// Human-readable description
        message: String,
    },

    /// Transfer buffer accessed after `free()`
    #[error("Transfer buffer used after free")]
    UseAfterFree,

    /// Transport-level failure
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Index past the end of a list
    #[error("Index {index} out of range (count: {count})")]
    OutOfRange {
        /// Requested index
        index: usize,
        /// Number of elements
        count: usize,
    },

    /// Server did not advertise a capability the request needs
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Build a protocol violation error
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        ClientError::Protocol {
            reason: ServerReason::Violation,
            message: message.into(),
        }
    }

    /// Errno-style code for callers that bridge into C-like APIs
    pub fn errno(&self) -> i32 {
        match self {
            ClientError::InvalidState(_) => libc::EINVAL,
            ClientError::NotNegotiated(_) => libc::ENOTCONN,
            ClientError::Protocol { reason, .. } => match reason {
                ServerReason::Errno(e) => e.code() as i32,
                ServerReason::OptionReply(reply) if reply.is_unknown_export() => libc::ENOENT,
                ServerReason::OptionReply(reply) if reply.is_unsupported() => libc::ENOTSUP,
                ServerReason::OptionReply(_) => libc::EINVAL,
                ServerReason::Violation => libc::EPROTO,
            },
            ClientError::UseAfterFree => libc::EFAULT,
            ClientError::Connection(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ClientError::OutOfRange { .. } => libc::ERANGE,
            ClientError::Unsupported(_) => libc::ENOTSUP,
            ClientError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Reason attached to a [`ClientError::Protocol`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReason {
    /// Option reply error type (`NBD_REP_ERR_*`)
    OptionReply(OptionReplyError),
    /// Command errno from a simple or structured reply
    Errno(NbdError),
    /// The server broke the protocol
    Violation,
}

impl fmt::Display for ServerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerReason::OptionReply(reply) => write!(f, "{}", reply),
            ServerReason::Errno(errno) => write!(f, "{}", errno),
            ServerReason::Violation => write!(f, "protocol violation"),
        }
    }
}

/// Error reply to an option request, raw `NBD_REP_ERR_*` value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionReplyError(pub u32);

impl OptionReplyError {
    /// `NBD_REP_ERR_UNSUP`
    pub const UNSUP: u32 = (1 << 31) | 1;
    /// `NBD_REP_ERR_POLICY`
    pub const POLICY: u32 = (1 << 31) | 2;
    /// `NBD_REP_ERR_INVALID`
    pub const INVALID: u32 = (1 << 31) | 3;
    /// `NBD_REP_ERR_PLATFORM`
    pub const PLATFORM: u32 = (1 << 31) | 4;
    /// `NBD_REP_ERR_TLS_REQD`
    pub const TLS_REQD: u32 = (1 << 31) | 5;
    /// `NBD_REP_ERR_UNKNOWN`
    pub const UNKNOWN: u32 = (1 << 31) | 6;
    /// `NBD_REP_ERR_SHUTDOWN`
    pub const SHUTDOWN: u32 = (1 << 31) | 7;
    /// `NBD_REP_ERR_BLOCK_SIZE_REQD`
    pub const BLOCK_SIZE_REQD: u32 = (1 << 31) | 8;
    /// `NBD_REP_ERR_TOO_BIG`
    pub const TOO_BIG: u32 = (1 << 31) | 9;

    /// Export does not exist
    pub fn is_unknown_export(&self) -> bool {
        self.0 == Self::UNKNOWN
    }

    /// Option not understood by the server
    pub fn is_unsupported(&self) -> bool {
        self.0 == Self::UNSUP
    }
}

impl fmt::Display for OptionReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            Self::UNSUP => "NBD_REP_ERR_UNSUP",
            Self::POLICY => "NBD_REP_ERR_POLICY",
            Self::INVALID => "NBD_REP_ERR_INVALID",
            Self::PLATFORM => "NBD_REP_ERR_PLATFORM",
            Self::TLS_REQD => "NBD_REP_ERR_TLS_REQD",
            Self::UNKNOWN => "NBD_REP_ERR_UNKNOWN",
            Self::SHUTDOWN => "NBD_REP_ERR_SHUTDOWN",
            Self::BLOCK_SIZE_REQD => "NBD_REP_ERR_BLOCK_SIZE_REQD",
            Self::TOO_BIG => "NBD_REP_ERR_TOO_BIG",
            other => return write!(f, "unknown option error {:#x}", other),
        };
        f.write_str(name)
    }
}

/// Error delivered to a completion callback
///
/// Commands always complete; a failure in the exchange is reported here
/// rather than dropping the command from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Server reported an error for this command
    #[error("Server returned {errno}{}", fmt_message(.message))]
    Server {
        /// Wire error code
        errno: NbdError,
        /// Optional message from a structured error chunk
        message: String,
    },

    /// Connection closed or aborted before the reply arrived
    #[error("Connection terminated before the command completed")]
    Terminated,

    /// The transfer buffer was freed while the command referenced it
    #[error("Transfer buffer freed while command was in flight")]
    BufferFreed,

    /// The transfer buffer was locked by a live view when the engine needed it
    #[error("Transfer buffer busy (a view is still held)")]
    BufferBusy,

    /// Reply for this command was malformed
    #[error("Malformed reply: {0}")]
    Malformed(String),
}

fn fmt_message(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {}", message)
    }
}

impl CommandError {
    /// Errno-style code for this failure
    pub fn errno(&self) -> i32 {
        match self {
            CommandError::Server { errno, .. } => errno.code() as i32,
            CommandError::Terminated => libc::ENOTCONN,
            CommandError::BufferFreed => libc::EFAULT,
            CommandError::BufferBusy => libc::EBUSY,
            CommandError::Malformed(_) => libc::EPROTO,
        }
    }
}

impl From<CommandError> for ClientError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Server { errno, message } => ClientError::Protocol {
                reason: ServerReason::Errno(errno),
                message: if message.is_empty() {
                    errno.to_string()
                } else {
                    message
                },
            },
            CommandError::Terminated => ClientError::Connection(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection terminated before the command completed",
            )),
            CommandError::BufferFreed => ClientError::UseAfterFree,
            CommandError::BufferBusy => {
                ClientError::InvalidState("transfer buffer busy".to_string())
            }
            CommandError::Malformed(message) => ClientError::violation(message),
        }
    }
}

/// NBD error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdError {
    /// Success
    Ok = 0,
    /// Permission denied
    Perm = 1,
    /// I/O error
    Io = 5,
    /// Out of memory
    NoMem = 12,
    /// Invalid argument
    Inval = 22,
    /// No space left on device
    NoSpc = 28,
    /// Value too large
    Overflow = 75,
    /// Function not implemented
    NotSup = 95,
    /// Shutdown in progress
    Shutdown = 108,
}

impl NbdError {
    /// Get the error code
    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Check if this is a success
    pub fn is_ok(&self) -> bool {
        matches!(self, NbdError::Ok)
    }

    /// Create from errno; unknown values are treated as EIO
    pub fn from_errno(errno: u32) -> Self {
        match errno {
            0 => Self::Ok,
            1 => Self::Perm,
            5 => Self::Io,
            12 => Self::NoMem,
            22 => Self::Inval,
            28 => Self::NoSpc,
            75 => Self::Overflow,
            95 => Self::NotSup,
            108 => Self::Shutdown,
            _ => Self::Io,
        }
    }
}

impl fmt::Display for NbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NbdError::Ok => write!(f, "Success"),
            NbdError::Perm => write!(f, "Permission denied"),
            NbdError::Io => write!(f, "I/O error"),
            NbdError::NoMem => write!(f, "Out of memory"),
            NbdError::Inval => write!(f, "Invalid argument"),
            NbdError::NoSpc => write!(f, "No space left"),
            NbdError::Overflow => write!(f, "Value too large"),
            NbdError::NotSup => write!(f, "Not supported"),
            NbdError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nbd_error_codes() {
        assert_eq!(NbdError::Ok.code(), 0);
        assert_eq!(NbdError::Perm.code(), 1);
        assert_eq!(NbdError::Io.code(), 5);
        assert_eq!(NbdError::from_errno(75), NbdError::Overflow);
        assert_eq!(NbdError::from_errno(9999), NbdError::Io);
        assert!(NbdError::Ok.is_ok());
        assert!(!NbdError::Io.is_ok());
    }

    #[test]
    fn test_command_error_into_client_error() {
        let err: ClientError = CommandError::Server {
            errno: NbdError::Inval,
            message: String::new(),
        }
        .into();
        match err {
            ClientError::Protocol { reason, .. } => {
                assert_eq!(reason, ServerReason::Errno(NbdError::Inval))
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err: ClientError = CommandError::BufferFreed.into();
        assert!(matches!(err, ClientError::UseAfterFree));

        let err: ClientError = CommandError::Terminated.into();
        assert!(matches!(err, ClientError::Connection(_)));
    }

    #[test]
    fn test_option_reply_error_display() {
        let err = OptionReplyError(OptionReplyError::UNKNOWN);
        assert!(err.is_unknown_export());
        assert_eq!(err.to_string(), "NBD_REP_ERR_UNKNOWN");
        assert_eq!(
            ClientError::Protocol {
                reason: ServerReason::OptionReply(err),
                message: "no such export".into(),
            }
            .errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_command_error_message() {
        let err = CommandError::Server {
            errno: NbdError::Io,
            message: "disk on fire".into(),
        };
        assert_eq!(err.to_string(), "Server returned I/O error: disk on fire");
        assert_eq!(err.errno(), 5);
    }
}
