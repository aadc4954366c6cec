use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, broadcast};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, trace, warn};

use fenice::error::{Error, ErrorKind, Result};

use crate::config::LinkConfig;

// The capacity of the bounded lifecycle events channel.
const EVENTS_CHANNEL_CAPACITY: usize = 16;

type LineListener = Box<dyn Fn(&str) + Send + Sync>;

/// Lifecycle states of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No socket is open and no reconnection is scheduled.
    Disconnected,
    /// A first connection attempt is in progress.
    Connecting,
    /// The socket is established and the reader loop is running.
    Connected,
    /// A connection was lost and a retry attempt is in progress.
    Reconnecting,
    /// A connection attempt could not establish a socket.
    ConnectionFailed,
}

/// Lifecycle events fired by a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connection attempt started.
    Connecting {
        /// Whether the attempt retries a previously established connection.
        is_reconnecting: bool,
    },
    /// A connection attempt succeeded.
    Opened {
        /// Whether the attempt retried a previously established connection.
        is_reconnecting: bool,
    },
    /// The connection was closed.
    Closed {
        /// Whether the close was requested through [`Connection::close`].
        ///
        /// When `false`, the socket died unexpectedly and a reconnection
        /// is scheduled.
        user_initiated: bool,
    },
    /// A connection attempt failed.
    ConnectionFailed {
        /// The failure cause.
        cause: String,
    },
}

// State shared between the public handle and the background tasks.
struct Shared {
    config: LinkConfig,
    state: StdMutex<LinkState>,
    // The write half of the live socket; `None` outside `Connected`.
    writer: Mutex<Option<OwnedWriteHalf>>,
    line_listeners: RwLock<Vec<LineListener>>,
    events: broadcast::Sender<LinkEvent>,
    // Set when a ping is outstanding; cleared by the matching pong.
    awaiting_pong: AtomicBool,
    // Whether a supervisor task is currently alive.
    running: AtomicBool,
    cancellation: StdMutex<CancellationToken>,
    connect_timeout: StdMutex<Duration>,
}

impl Shared {
    fn state(&self) -> LinkState {
        *self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LinkState) {
        *self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn fire(&self, event: LinkEvent) {
        // Fails only when nobody subscribed, which is fine.
        let _ = self.events.send(event);
    }

    // Delivers one received line, in arrival order, to every registered
    // listener. A conventional pong is swallowed beforehand.
    fn dispatch_line(&self, line: &str) {
        trace!("<- {line}");

        if let Some(heartbeat) = self.config.heartbeat_strategy() {
            if heartbeat.is_pong(line) {
                self.awaiting_pong.store(false, Ordering::SeqCst);
                return;
            }
        }

        let listeners = self
            .line_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(line);
        }
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let state = self.state();
        if state != LinkState::Connected {
            let kind = if state == LinkState::ConnectionFailed {
                ErrorKind::ConnectionFailed
            } else {
                ErrorKind::NotConnected
            };
            return Err(Error::new(
                kind,
                format!("cannot send `{line}`: the link is down"),
            ));
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::new(
                ErrorKind::NotConnected,
                format!("cannot send `{line}`: the link is down"),
            ));
        };

        let mut framed = String::with_capacity(line.len() + 1);
        framed.push_str(line);
        framed.push('\n');

        writer
            .write_all(framed.as_bytes())
            .await
            .map_err(|e| Error::new(ErrorKind::NotConnected, format!("link write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::NotConnected, format!("link flush failed: {e}")))?;

        Ok(())
    }
}

/// A persistent connection to one remote microcontroller gateway.
///
/// The connection owns one TCP socket to a fixed host and port and supplies
/// line-framed, bidirectional message transport on top of it. It is created
/// once per gateway and lives for the process lifetime: a lost socket is
/// reconnected in place, never replaced.
///
/// All operations are safe to call from any task. Cloning the handle is
/// cheap and every clone drives the same underlying link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a [`Connection`] from a [`LinkConfig`].
    ///
    /// No socket is opened until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                state: StdMutex::new(LinkState::Disconnected),
                writer: Mutex::new(None),
                line_listeners: RwLock::new(Vec::new()),
                events,
                awaiting_pong: AtomicBool::new(false),
                running: AtomicBool::new(false),
                cancellation: StdMutex::new(CancellationToken::new()),
                connect_timeout: StdMutex::new(Duration::from_secs(10)),
            }),
        }
    }

    /// Opens the connection, allowing the socket `connect_timeout` to be
    /// established.
    ///
    /// This method fires and observes rather than returning an outcome: the
    /// attempt outcome is reported through [`LinkEvent`]s on the receiver
    /// returned by [`events`](Self::events).
    ///
    /// On success a dedicated reader loop starts and the state moves to
    /// [`LinkState::Connected`]; on failure the state moves to
    /// [`LinkState::ConnectionFailed`]. After a connection was established
    /// and then lost, reconnection attempts repeat at the configured retry
    /// delay until one succeeds or [`close`](Self::close) is called.
    ///
    /// Calling `connect` while the connection is already active is a no-op.
    pub async fn connect(&self, connect_timeout: Duration) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!(
                "connection to {}:{} is already active",
                self.shared.config.host(),
                self.shared.config.port()
            );
            return;
        }

        *self
            .shared
            .connect_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connect_timeout;

        let token = {
            let mut guard = self
                .shared
                .cancellation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        drop(tokio::spawn(run_link(Arc::clone(&self.shared), token)));
    }

    /// Writes one newline-terminated line to the gateway.
    ///
    /// Concurrent callers are serialized so interleaved writers never
    /// corrupt a line.
    ///
    /// # Errors
    ///
    /// Fails fast when the state is not [`LinkState::Connected`]; the line
    /// is neither blocked on nor queued. The kind is
    /// [`ErrorKind::ConnectionFailed`] after a failed connection attempt
    /// and [`ErrorKind::NotConnected`] otherwise.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        trace!("-> {line}");
        self.shared.write_line(line).await
    }

    /// Closes the connection: the reader loop stops, the socket is dropped,
    /// the state moves to [`LinkState::Disconnected`], and auto-reconnect
    /// is disabled until the next [`connect`](Self::connect) call.
    pub fn close(&self) {
        debug!(
            "closing the connection to {}:{}",
            self.shared.config.host(),
            self.shared.config.port()
        );

        self.shared
            .cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();

        // Without a live supervisor nobody else updates the state.
        if !self.shared.running.load(Ordering::SeqCst) {
            self.shared.set_state(LinkState::Disconnected);
        }
    }

    /// Returns the current [`LinkState`].
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.shared.state()
    }

    /// Subscribes to the connection lifecycle events.
    ///
    /// Every subscriber receives every [`LinkEvent`] fired after the call.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }

    /// Registers a listener invoked for every received line.
    ///
    /// Lines are delivered synchronously, in arrival order, to every
    /// registered listener from the reader loop; a listener must not block
    /// for unbounded time.
    pub fn add_line_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.shared
            .line_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.shared.config.host())
            .field("port", &self.shared.config.port())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// The connection supervisor: attempts the socket, runs the session, and
// schedules reconnections until cancelled.
//
// At most one supervisor runs per connection, which guarantees at most one
// live socket and one reader loop at any time.
async fn run_link(shared: Arc<Shared>, token: CancellationToken) {
    let address = format!("{}:{}", shared.config.host(), shared.config.port());
    let mut is_reconnecting = false;

    loop {
        if token.is_cancelled() {
            shared.set_state(LinkState::Disconnected);
            break;
        }

        shared.set_state(if is_reconnecting {
            LinkState::Reconnecting
        } else {
            LinkState::Connecting
        });
        shared.fire(LinkEvent::Connecting { is_reconnecting });

        let connect_timeout = *shared
            .connect_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let attempt =
            tokio::time::timeout(connect_timeout, TcpStream::connect(address.as_str())).await;

        match attempt {
            Ok(Ok(stream)) => {
                let (read_half, write_half) = stream.into_split();

                // The writer must be in place before `Opened` is observable,
                // so a send issued right after the event cannot miss it.
                *shared.writer.lock().await = Some(write_half);
                shared.set_state(LinkState::Connected);
                shared.fire(LinkEvent::Opened { is_reconnecting });
                debug!("link to {address} established");

                let user_closed = run_session(&shared, read_half, &token).await;
                drop(shared.writer.lock().await.take());

                if user_closed {
                    shared.set_state(LinkState::Disconnected);
                    shared.fire(LinkEvent::Closed {
                        user_initiated: true,
                    });
                    break;
                }

                warn!("link to {address} lost");
                shared.set_state(LinkState::Reconnecting);
                shared.fire(LinkEvent::Closed {
                    user_initiated: false,
                });
            }
            Ok(Err(e)) => {
                warn!("link to {address} refused: {e}");
                shared.set_state(LinkState::ConnectionFailed);
                shared.fire(LinkEvent::ConnectionFailed {
                    cause: e.to_string(),
                });

                // Only a connection that was established and then lost
                // retries on its own.
                if !is_reconnecting {
                    break;
                }
            }
            Err(_elapsed) => {
                warn!("link to {address} not established within {connect_timeout:?}");
                shared.set_state(LinkState::ConnectionFailed);
                shared.fire(LinkEvent::ConnectionFailed {
                    cause: format!("no connection within {connect_timeout:?}"),
                });

                if !is_reconnecting {
                    break;
                }
            }
        }

        is_reconnecting = true;

        tokio::select! {
            () = token.cancelled() => {
                shared.set_state(LinkState::Disconnected);
                break;
            }
            () = tokio::time::sleep(shared.config.retry_delay_value()) => {}
        }
    }

    shared.running.store(false, Ordering::SeqCst);
}

// Runs one established socket until it dies or the connection is closed.
//
// Returns whether the session ended because of a user-initiated close.
async fn run_session(
    shared: &Arc<Shared>,
    read_half: OwnedReadHalf,
    token: &CancellationToken,
) -> bool {
    shared.awaiting_pong.store(false, Ordering::SeqCst);

    // Child token: a heartbeat loss cancels the session without touching
    // the supervisor, while a user close cancels both.
    let session = token.child_token();

    let heartbeat_handle = shared
        .config
        .heartbeat_strategy()
        .map(|_| tokio::spawn(run_heartbeat(Arc::clone(shared), session.clone())));

    let mut lines = BufReader::new(read_half).lines();

    let user_closed = loop {
        tokio::select! {
            () = session.cancelled() => {
                break token.is_cancelled();
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => shared.dispatch_line(&line),
                Ok(None) => {
                    debug!("the gateway closed the link");
                    break false;
                }
                Err(e) => {
                    warn!("link read error: {e}");
                    break false;
                }
            }
        }
    };

    session.cancel();
    if let Some(handle) = heartbeat_handle {
        if let Err(e) = handle.await {
            error!("failed to await the heartbeat task: {e}");
        }
    }

    user_closed
}

// Sends the ping line on every interval tick and declares the connection
// dead when the previous ping is still unanswered at the next tick.
async fn run_heartbeat(shared: Arc<Shared>, session: CancellationToken) {
    let Some(heartbeat) = shared.config.heartbeat_strategy().cloned() else {
        return;
    };

    let mut ticker = tokio::time::interval(heartbeat.interval());

    loop {
        tokio::select! {
            () = session.cancelled() => break,
            _ = ticker.tick() => {
                if shared.awaiting_pong.swap(true, Ordering::SeqCst) {
                    warn!("heartbeat reply missed, forcing a reconnect");
                    session.cancel();
                    break;
                }

                if let Err(e) = shared.write_line(heartbeat.ping()).await {
                    warn!("heartbeat ping failed: {e}");
                    session.cancel();
                    break;
                }
            }
        }
    }
}
