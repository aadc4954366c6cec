use std::borrow::Cow;
use std::fmt;

/// All error kinds of the device link engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A received line does not parse as `id:name[:arg]*`.
    MalformedCommand,
    /// A send was attempted while the connection is not established.
    NotConnected,
    /// The socket could not be established within the configured timeout.
    ConnectionFailed,
    /// A correlated reply did not arrive within the configured timeout.
    Timeout,
    /// The gateway answered with an `ERROR` reply.
    Device,
    /// A reply arrived but its arguments could not be interpreted.
    InvalidReply,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedCommand => "malformed command",
            Self::NotConnected => "not connected",
            Self::ConnectionFailed => "connection failed",
            Self::Timeout => "timeout",
            Self::Device => "device error",
            Self::InvalidReply => "invalid reply",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device link error.
///
/// Contains an [`ErrorKind`] and a description of the encountered error.
#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    description: Cow<'static, str>,
}

impl Error {
    /// Creates an [`Error`] from an [`ErrorKind`] and a description.
    #[must_use]
    #[inline]
    pub fn new(kind: ErrorKind, description: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            description: description.into(),
        }
    }

    /// Returns the [`ErrorKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error description.
    #[must_use]
    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

/// A specialized `Result` for device link operations.
pub type Result<T> = std::result::Result<T, Error>;
