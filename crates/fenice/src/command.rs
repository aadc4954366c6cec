use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// The correlation identifier reserved for gateway-originated traffic.
///
/// Heartbeat replies and unsolicited event lines carry this identifier.
/// The dispatcher allocates request identifiers starting from `1`, so
/// gateway-originated lines never match a pending request.
pub const GATEWAY_ID: u64 = 0;

/// Name of a successful reply.
pub const OK_REPLY: &str = "OK";

/// Name of a failed reply.
///
/// The arguments of an `ERROR` reply describe the failure reported by the
/// gateway.
pub const ERROR_REPLY: &str = "ERROR";

/// One protocol message.
///
/// A command carries a non-negative correlation identifier, a name, and an
/// ordered sequence of string arguments. Its wire form is a single line of
/// colon-separated tokens:
///
/// ```text
/// <id>:<name>[:<arg>]*
/// ```
///
/// Replies echo the identifier of the command they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: u64,
    name: String,
    arguments: Vec<String>,
}

impl Command {
    /// Creates a [`Command`] without arguments.
    #[must_use]
    #[inline]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            arguments: Vec::new(),
        }
    }

    /// Adds a single argument.
    #[must_use]
    #[inline]
    pub fn argument(mut self, argument: impl Into<String>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    /// Sets the whole argument sequence.
    #[must_use]
    #[inline]
    pub fn arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Returns the correlation identifier.
    #[must_use]
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the command name.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns an immutable slice of the argument sequence.
    #[must_use]
    #[inline]
    pub fn arguments_as_slice(&self) -> &[String] {
        self.arguments.as_slice()
    }

    /// Consumes the command, returning its argument sequence.
    #[must_use]
    #[inline]
    pub fn into_arguments(self) -> Vec<String> {
        self.arguments
    }

    /// Encodes the command into its wire-text form, without the trailing
    /// newline appended by the transport.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut line = format!("{}:{}", self.id, self.name);
        for argument in &self.arguments {
            line.push(':');
            line.push_str(argument);
        }
        line
    }

    /// Decodes one received line into a [`Command`].
    ///
    /// A trailing `\n`, or `\r\n` pair, is stripped before tokenization.
    ///
    /// The grammar does not escape colons: an argument containing a `:` is
    /// split into multiple tokens on decode, so `decode(encode(c)) == c`
    /// holds only for commands with colon-free arguments.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::MalformedCommand`] error when the line holds
    /// fewer than two tokens or the identifier token is not a non-negative
    /// integer.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut tokens = line.split(':');

        // `split` always yields at least one token, possibly empty.
        let id_token = tokens.next().unwrap_or_default();
        let id = id_token.parse::<u64>().map_err(|_| {
            Error::new(
                ErrorKind::MalformedCommand,
                format!("identifier `{id_token}` is not a non-negative integer"),
            )
        })?;

        let name = match tokens.next() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => {
                return Err(Error::new(
                    ErrorKind::MalformedCommand,
                    format!("line `{line}` does not carry a command name"),
                ));
            }
        };

        let arguments = tokens.map(str::to_owned).collect();

        Ok(Self {
            id,
            name,
            arguments,
        })
    }

    /// Interprets the command as a correlated reply.
    ///
    /// An [`ERROR_REPLY`] is converted into an error carrying the failure
    /// description reported by the gateway; every other reply is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Device`] error for an [`ERROR_REPLY`].
    pub fn into_reply(self) -> Result<Self> {
        if self.name == ERROR_REPLY {
            return Err(Error::new(
                ErrorKind::Device,
                self.arguments.join(" "),
            ));
        }
        Ok(self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
