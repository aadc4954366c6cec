use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use tracing::trace;

use fenice::command::Command;
use fenice::error::{Error, ErrorKind, Result};

use crate::connection::Connection;

// Pending requests keyed by correlation identifier. A given identifier maps
// to at most one entry; completion removes the entry exactly once.
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Command>>>>>;

fn remove_pending(pending: &Pending, id: u64) -> Option<oneshot::Sender<Result<Command>>> {
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
}

struct DispatcherShared {
    connection: Connection,
    // Identifiers are assigned by an incrementing counter with no reuse
    // within the connection lifetime. A `u64` starting at `1` cannot wrap
    // in practice; `0` is reserved for gateway-originated traffic.
    next_id: AtomicU64,
    pending: Pending,
    reply_timeout: Mutex<Option<Duration>>,
}

/// A dispatcher correlating sent commands with their asynchronous replies
/// over a shared [`Connection`].
///
/// Replies are matched purely by identifier equality, never by name or by
/// arrival order: the gateway is free to answer requests out of order.
///
/// Cloning the handle is cheap and every clone shares the same identifier
/// counter and pending map.
#[derive(Clone)]
pub struct CommandDispatcher {
    shared: Arc<DispatcherShared>,
}

impl CommandDispatcher {
    /// Creates a [`CommandDispatcher`] on top of a [`Connection`],
    /// registering the line listener that completes pending requests.
    ///
    /// Received lines that do not decode as commands are dropped; decoded
    /// lines whose identifier matches no pending request are left to other
    /// listeners, such as port event routing.
    #[must_use]
    pub fn new(connection: &Connection) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let map = Arc::clone(&pending);
        connection.add_line_listener(move |line| {
            let reply = match Command::decode(line) {
                Ok(reply) => reply,
                Err(e) => {
                    trace!("discarding line: {e}");
                    return;
                }
            };

            match remove_pending(&map, reply.id()) {
                Some(sender) => {
                    let id = reply.id();
                    if sender.send(Ok(reply)).is_err() {
                        trace!("the reply for id `{id}` is no longer awaited");
                    }
                }
                None => trace!("no pending request for id `{}`", reply.id()),
            }
        });

        Self {
            shared: Arc::new(DispatcherShared {
                connection: connection.clone(),
                next_id: AtomicU64::new(1),
                pending,
                reply_timeout: Mutex::new(None),
            }),
        }
    }

    /// Sets the time a [`ReplyHandle`] waits for its correlated reply.
    ///
    /// By default a reply is awaited forever, matching the gateway
    /// protocol, which offers no delivery guarantee for replies. Setting a
    /// timeout bounds the pending map under sustained packet loss: an
    /// expired entry is removed when its handle gives up.
    pub fn set_reply_timeout(&self, reply_timeout: Duration) {
        *self
            .shared
            .reply_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reply_timeout);
    }

    /// Sends a command to the gateway and returns the [`ReplyHandle`]
    /// tracking its correlated reply.
    ///
    /// The write happens eagerly: dropping the handle makes the command
    /// fire-and-forget. When the send fails because the link is down, the
    /// handle resolves immediately with [`ErrorKind::NotConnected`] instead
    /// of pending forever.
    pub async fn send(&self, name: &str, arguments: Vec<String>) -> ReplyHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let command = Command::new(id, name).arguments(arguments);

        let (sender, receiver) = oneshot::channel();
        drop(
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id, sender),
        );

        if let Err(e) = self.shared.connection.send_line(&command.encode()).await {
            if let Some(sender) = remove_pending(&self.shared.pending, id) {
                let _ = sender.send(Err(e));
            }
        }

        ReplyHandle {
            id,
            receiver,
            pending: Arc::clone(&self.shared.pending),
            reply_timeout: *self
                .shared
                .reply_timeout
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Queries the gateway firmware version.
    ///
    /// # Errors
    ///
    /// Network failures, an `ERROR` reply, or a reply without a version
    /// argument fail the query.
    pub async fn version(&self) -> Result<String> {
        let reply = self.send("version", Vec::new()).await.reply().await?;
        let reply = reply.into_reply()?;

        reply
            .arguments_as_slice()
            .first()
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidReply,
                    "the version reply carries no argument",
                )
            })
    }

    /// Queries the free memory of the gateway, in bytes.
    ///
    /// # Errors
    ///
    /// Network failures, an `ERROR` reply, or a reply whose argument is not
    /// an integer fail the query.
    pub async fn free_memory(&self) -> Result<u64> {
        let reply = self.send("memory", Vec::new()).await.reply().await?;
        let reply = reply.into_reply()?;

        let argument = reply.arguments_as_slice().first().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidReply,
                "the memory reply carries no argument",
            )
        })?;

        argument.parse::<u64>().map_err(|_| {
            Error::new(
                ErrorKind::InvalidReply,
                format!("the memory reply argument `{argument}` is not an integer"),
            )
        })
    }

    /// Returns the number of requests still awaiting their reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns the underlying [`Connection`].
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.shared.connection
    }
}

impl fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("connection", &self.shared.connection)
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

/// A handle tracking the reply correlated to one sent command.
///
/// The command is already on the wire when the handle is returned; dropping
/// the handle turns the command into fire-and-forget.
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    receiver: oneshot::Receiver<Result<Command>>,
    pending: Pending,
    reply_timeout: Option<Duration>,
}

impl ReplyHandle {
    /// Returns the correlation identifier of the sent command.
    #[must_use]
    #[inline]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Awaits the correlated reply.
    ///
    /// Without a configured dispatcher reply timeout this awaits forever if
    /// the gateway never answers.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotConnected`] when the command could not be sent
    /// - [`ErrorKind::Timeout`] when the reply did not arrive within the
    ///   configured reply timeout
    pub async fn reply(self) -> Result<Command> {
        let Self {
            id,
            receiver,
            pending,
            reply_timeout,
        } = self;

        let received = match reply_timeout {
            Some(duration) => match tokio::time::timeout(duration, receiver).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    // Give up the correlation slot so the map cannot grow
                    // without bound.
                    drop(remove_pending(&pending, id));
                    return Err(Error::new(
                        ErrorKind::Timeout,
                        format!("no reply for id `{id}` within {duration:?}"),
                    ));
                }
            },
            None => receiver.await,
        };

        match received {
            Ok(outcome) => outcome,
            Err(_closed) => Err(Error::new(
                ErrorKind::NotConnected,
                format!("the pending request with id `{id}` was dropped"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    use fenice::error::ErrorKind;

    use crate::config::LinkConfig;
    use crate::connection::{Connection, LinkEvent};

    use super::CommandDispatcher;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    // Builds a connected dispatcher and hands the accepted gateway-side
    // socket to the caller.
    async fn connected_dispatcher() -> (CommandDispatcher, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connection = Connection::new(LinkConfig::new("127.0.0.1", port));
        let dispatcher = CommandDispatcher::new(&connection);

        let mut events = connection.events();
        connection.connect(CONNECT_TIMEOUT).await;
        let (stream, _) = listener.accept().await.unwrap();

        loop {
            let event = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
            if matches!(event, LinkEvent::Opened { .. }) {
                break;
            }
        }

        (dispatcher, stream)
    }

    #[tokio::test]
    async fn request_and_reply() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let handle = dispatcher
            .send(
                "port",
                vec!["6".into(), "mode".into(), "ANALOG_IN".into()],
            )
            .await;
        assert_eq!(handle.id(), 1);
        assert_eq!(dispatcher.pending_requests(), 1);

        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, "1:port:6:mode:ANALOG_IN");
        write_half.write_all(b"1:OK\n").await.unwrap();

        let reply = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();
        assert_eq!(reply.id(), 1);
        assert_eq!(reply.name(), "OK");
        assert!(reply.arguments_as_slice().is_empty());
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn out_of_order_replies_resolve_by_identifier() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = dispatcher.send("version", Vec::new()).await;
        let second = dispatcher.send("memory", Vec::new()).await;

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "1:version");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "2:memory");

        // Answer in reverse order.
        write_half.write_all(b"2:OK:2048\n1:OK:1.4.2\n").await.unwrap();

        let (first_reply, second_reply) = tokio::join!(
            timeout(TEST_TIMEOUT, first.reply()),
            timeout(TEST_TIMEOUT, second.reply()),
        );

        let first_reply = first_reply.unwrap().unwrap();
        let second_reply = second_reply.unwrap().unwrap();
        assert_eq!(first_reply.arguments_as_slice(), ["1.4.2"]);
        assert_eq!(second_reply.arguments_as_slice(), ["2048"]);
    }

    #[tokio::test]
    async fn unmatched_replies_leave_the_pending_map_intact() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let handle = dispatcher.send("version", Vec::new()).await;
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "1:version");
        assert_eq!(dispatcher.pending_requests(), 1);

        // An identifier nobody waits on, and a line that does not decode.
        write_half
            .write_all(b"99:OK\nnot a command\n1:OK:1.4.2\n")
            .await
            .unwrap();

        let reply = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();
        assert_eq!(reply.arguments_as_slice(), ["1.4.2"]);
        assert_eq!(dispatcher.pending_requests(), 0);
    }

    #[tokio::test]
    async fn send_while_disconnected_resolves_immediately() {
        let connection = Connection::new(LinkConfig::new("127.0.0.1", 1));
        let dispatcher = CommandDispatcher::new(&connection);

        let handle = dispatcher.send("version", Vec::new()).await;
        assert_eq!(dispatcher.pending_requests(), 0);

        let error = timeout(TEST_TIMEOUT, handle.reply())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn reply_timeout_removes_the_pending_entry() {
        let (dispatcher, stream) = connected_dispatcher().await;
        dispatcher.set_reply_timeout(Duration::from_millis(50));

        let handle = dispatcher.send("version", Vec::new()).await;
        assert_eq!(dispatcher.pending_requests(), 1);

        // The gateway never answers.
        let error = timeout(TEST_TIMEOUT, handle.reply())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(dispatcher.pending_requests(), 0);

        drop(stream);
    }

    #[tokio::test]
    async fn typed_gateway_queries() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();

        let gateway = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "1:version");
            write_half.write_all(b"1:OK:1.4.2\n").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "2:memory");
            write_half.write_all(b"2:OK:2048\n").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "3:memory");
            write_half.write_all(b"3:ERROR:out:of:service\n").await.unwrap();
        });

        let version = timeout(TEST_TIMEOUT, dispatcher.version())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, "1.4.2");

        let memory = timeout(TEST_TIMEOUT, dispatcher.free_memory())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(memory, 2048);

        let error = timeout(TEST_TIMEOUT, dispatcher.free_memory())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Device);
        assert_eq!(error.description(), "out of service");

        gateway.await.unwrap();
    }
}
