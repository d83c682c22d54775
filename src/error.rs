use crate::endpoint::HostParseError;

use failure::{Backtrace, Context, Fail};
use hickory_proto::error::ProtoError;

use std::{
    fmt::{self, Debug, Display},
    io,
    net::SocketAddr,
};

/// The fixed reply texts of RFC 1928, indexed by reply code.
pub(crate) const REPLY_MESSAGE: [&str; 9] = [
    "succeeded",
    "general SOCKS server failure",
    "connection not allowed by ruleset",
    "network unreachable",
    "host unreachable",
    "connection refused",
    "TTL expired",
    "command not supported",
    "address type not supported",
];

/// An error with a kind and an optional underlying cause.
///
/// An `Error` contains a [`ErrorKind`] which gives context on the error
/// cause. The original failure, if any, is preserved and can be reached via
/// [`Fail::cause`].
///
/// [`ErrorKind`]: enum.ErrorKind.html
/// [`Fail::cause`]: https://docs.rs/failure/0.1/failure/trait.Fail.html#method.cause
#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

impl Error {
    /// Create a new error from the given `ErrorKind`.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        *self.inner.get_context()
    }

    /// Returns `true` if this is a per-nameserver timeout.
    pub fn is_timeout(&self) -> bool {
        match self.kind() {
            ErrorKind::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            io::ErrorKind::Interrupted => ErrorKind::Interrupted,
            _ => ErrorKind::Io,
        };

        error.context(kind).into()
    }
}

impl From<ProtoError> for Error {
    fn from(error: ProtoError) -> Self {
        error.context(ErrorKind::WireFormat).into()
    }
}

impl From<HostParseError> for Error {
    fn from(_error: HostParseError) -> Self {
        Error::new(ErrorKind::InvalidInput {
            msg: "unable to parse host",
        })
    }
}

/// Used to give context to an `Error`.
///
/// # Note
/// This error type is non-exhaustive and could have additional variants
/// added in future. Therefore, when matching against variants of
/// non-exhaustive enums, an extra wildcard arm must be added to account
/// for any future variants.
///
/// [`Error`]: struct.Error.html
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Non-blocking mode was requested and the datagram cannot be sent
    /// without blocking. The task is re-attempted by the next writable pass.
    WouldBlock,
    /// The operation was interrupted by a OS signal delivery.
    Interrupted,
    /// An I/O error that maps to no more precise kind.
    Io,
    /// A packet failed to encode to, or decode from, DNS wire format.
    WireFormat,
    /// `sendto` failed with a non-transient error; the target never
    /// received the request.
    SendFailure {
        /// The endpoint the request was addressed to.
        nameserver: SocketAddr,
    },
    /// No response arrived from the nameserver within the deadline.
    Timeout {
        /// The endpoint that did not answer.
        nameserver: SocketAddr,
        /// The deadline that expired, in seconds.
        seconds: u64,
    },
    /// The peer spoke a SOCKS version other than 5 (or a username/password
    /// sub-negotiation version other than 1).
    InvalidVersion {
        /// The version byte observed from the peer.
        version: u8,
    },
    /// The proxy accepted none of the offered authentication methods.
    NoAcceptableAuthMethod,
    /// The proxy rejected the supplied username/password pair.
    Authentication {
        /// The non-zero status byte of the RFC 1929 reply.
        status: u8,
    },
    /// The proxy replied to a request with a non-zero reply code.
    Reply {
        /// The REP field of the reply.
        code: u8,
    },
    /// An address type byte other than IPv4, domain or IPv6.
    UnsupportedAddressType {
        /// The ATYP byte observed from the peer.
        atyp: u8,
    },
    /// A SOCKS5 UDP datagram with a non-zero FRAG field.
    Fragmented {
        /// The FRAG byte of the datagram.
        frag: u8,
    },
    /// A fn call did not follow its usage contract and provided invalid
    /// inputs.
    ///
    /// The inner `msg` contains information on the specific contract breach.
    InvalidInput {
        /// Additionnal information on the error.
        msg: &'static str,
    },
}

impl Fail for ErrorKind {}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::WouldBlock => write!(f, "operation would block"),
            ErrorKind::Interrupted => write!(f, "interrupted by signal"),
            ErrorKind::Io => write!(f, "i/o error"),
            ErrorKind::WireFormat => write!(f, "malformed DNS packet"),
            ErrorKind::SendFailure { nameserver } => {
                write!(f, "fail to send query to {}", nameserver)
            }
            ErrorKind::Timeout {
                nameserver,
                seconds,
            } => write!(
                f,
                "no response from {} within {} seconds",
                nameserver, seconds
            ),
            ErrorKind::InvalidVersion { version } => {
                write!(f, "invalid socks version: {}", version)
            }
            ErrorKind::NoAcceptableAuthMethod => {
                write!(f, "no acceptable authentication method")
            }
            ErrorKind::Authentication { status } => {
                write!(f, "invalid username or password: {}", status)
            }
            ErrorKind::Reply { code } => {
                match REPLY_MESSAGE.get(*code as usize) {
                    Some(msg) => write!(f, "{}", msg),
                    None => write!(f, "unknown reply code: {}", code),
                }
            }
            ErrorKind::UnsupportedAddressType { atyp } => {
                write!(f, "unsupported address type: {}", atyp)
            }
            ErrorKind::Fragmented { frag } => {
                write!(f, "fragmented datagram: {}", frag)
            }
            ErrorKind::InvalidInput { msg } => {
                write!(f, "invalid input: {}", msg)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reply_texts() {
        assert_eq!(
            "general SOCKS server failure",
            ErrorKind::Reply { code: 1 }.to_string()
        );
        assert_eq!(
            "address type not supported",
            ErrorKind::Reply { code: 8 }.to_string()
        );
        assert_eq!(
            "unknown reply code: 9",
            ErrorKind::Reply { code: 9 }.to_string()
        );
    }

    #[test]
    fn test_io_error_kind() {
        let err: Error =
            io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(ErrorKind::WouldBlock, err.kind());

        let err: Error =
            io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(ErrorKind::Io, err.kind());
    }
}
