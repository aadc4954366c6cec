use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::trace;

use fenice::command::{Command, GATEWAY_ID};
use fenice::error::{Error, ErrorKind, Result};

use fenice_link::dispatcher::{CommandDispatcher, ReplyHandle};

use crate::mode::{PortMode, PullMode};

/// The command name carrying every port operation.
pub const PORT_COMMAND: &str = "port";

/// Event name of a digital input value change.
pub const DIGITAL_CHANGE_EVENT: &str = "dchange";

/// Event name of an analog input value change.
pub const ANALOG_CHANGE_EVENT: &str = "achange";

/// Event name of a rising edge interrupt.
pub const RISING_EDGE_EVENT: &str = "rising";

/// Event name of a falling edge interrupt.
pub const FALLING_EDGE_EVENT: &str = "falling";

struct CapabilityListener {
    capability: String,
    callback: Box<dyn Fn(&[String]) + Send + Sync>,
}

struct PortShared {
    dispatcher: CommandDispatcher,
    id: u64,
    // Local mirrors of the last requested configuration.
    mode: Mutex<PortMode>,
    pull_mode: Mutex<PullMode>,
    digital_listeners: RwLock<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
    analog_listeners: RwLock<Vec<Box<dyn Fn(f64) + Send + Sync>>>,
    rising_listeners: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
    falling_listeners: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
    capability_listeners: RwLock<Vec<CapabilityListener>>,
}

impl PortShared {
    // Routes one gateway-originated event addressed to this port.
    //
    // The first argument of every event is the port identifier; events for
    // other ports, and events with a missing or non-numeric port argument,
    // are ignored.
    fn handle_event(&self, event: &Command) {
        let arguments = event.arguments_as_slice();
        let Some(port) = arguments.first().and_then(|a| a.parse::<u64>().ok()) else {
            return;
        };
        if port != self.id {
            return;
        }

        match event.name() {
            DIGITAL_CHANGE_EVENT => match arguments.get(1).map(String::as_str) {
                Some("0") => self.fan_out_digital(false),
                Some("1") => self.fan_out_digital(true),
                _ => trace!("discarding a digital change event without a boolean value"),
            },
            ANALOG_CHANGE_EVENT => {
                match arguments.get(1).and_then(|a| a.parse::<f64>().ok()) {
                    Some(value) => self.fan_out_analog(value),
                    None => {
                        trace!("discarding an analog change event without a numeric value");
                    }
                }
            }
            RISING_EDGE_EVENT => {
                let listeners = self
                    .rising_listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                for listener in listeners.iter() {
                    listener();
                }
            }
            FALLING_EDGE_EVENT => {
                let listeners = self
                    .falling_listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                for listener in listeners.iter() {
                    listener();
                }
            }
            capability => {
                let listeners = self
                    .capability_listeners
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                for listener in listeners.iter() {
                    if listener.capability == capability {
                        (listener.callback)(&arguments[1..]);
                    }
                }
            }
        }
    }

    fn fan_out_digital(&self, value: bool) {
        let listeners = self
            .digital_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(value);
        }
    }

    fn fan_out_analog(&self, value: f64) {
        let listeners = self
            .analog_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(value);
        }
    }
}

/// A controller for one input/output port of the gateway.
///
/// Port operations travel as `port` commands whose first two arguments are
/// the port identifier and a verb; unsolicited gateway events addressed to
/// the port are routed to registered listeners.
///
/// Cloning the controller is cheap and every clone drives the same port.
#[derive(Clone)]
pub struct PortController {
    shared: Arc<PortShared>,
}

impl PortController {
    /// Creates a [`PortController`] for the port with the given identifier,
    /// registering the event routing on the underlying connection.
    #[must_use]
    pub fn new(dispatcher: &CommandDispatcher, id: u64) -> Self {
        let shared = Arc::new(PortShared {
            dispatcher: dispatcher.clone(),
            id,
            mode: Mutex::new(PortMode::Unused),
            pull_mode: Mutex::new(PullMode::None),
            digital_listeners: RwLock::new(Vec::new()),
            analog_listeners: RwLock::new(Vec::new()),
            rising_listeners: RwLock::new(Vec::new()),
            falling_listeners: RwLock::new(Vec::new()),
            capability_listeners: RwLock::new(Vec::new()),
        });

        // The connection keeps its listeners forever, so the routing holds
        // the port state weakly and turns inert once every controller clone
        // is dropped.
        let weak: Weak<PortShared> = Arc::downgrade(&shared);
        dispatcher.connection().add_line_listener(move |line| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let Ok(event) = Command::decode(line) else {
                return;
            };
            if event.id() == GATEWAY_ID {
                shared.handle_event(&event);
            }
        });

        Self { shared }
    }

    /// Returns the port identifier.
    #[must_use]
    #[inline]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Returns the last requested [`PortMode`].
    ///
    /// The mirror is updated when a mode request is sent, before the
    /// gateway acknowledges it.
    #[must_use]
    pub fn mode(&self) -> PortMode {
        *self
            .shared
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the last requested [`PullMode`].
    #[must_use]
    pub fn pull_mode(&self) -> PullMode {
        *self
            .shared
            .pull_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the operating mode of the port.
    ///
    /// The command is on the wire when this returns and the local mode
    /// mirror is already updated; await the returned [`ReplyHandle`] for
    /// the gateway acknowledgement, or drop it for fire-and-forget. A mode
    /// the physical port does not support is reported as an `ERROR` reply.
    pub async fn set_mode(&self, mode: PortMode) -> ReplyHandle {
        *self
            .shared
            .mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mode;

        self.port_command("mode", vec![mode.wire_name().to_owned()])
            .await
    }

    /// Configures the pull resistor of the port.
    ///
    /// Same acknowledgement contract as [`set_mode`](Self::set_mode).
    pub async fn set_pull_mode(&self, pull_mode: PullMode) -> ReplyHandle {
        *self
            .shared
            .pull_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = pull_mode;

        self.port_command("pull", vec![pull_mode.wire_name().to_owned()])
            .await
    }

    /// Drives the digital output value of the port.
    ///
    /// Same acknowledgement contract as [`set_mode`](Self::set_mode).
    pub async fn set_digital_value(&self, value: bool) -> ReplyHandle {
        let wire_value = if value { "1" } else { "0" };
        self.port_command("dwrite", vec![wire_value.to_owned()])
            .await
    }

    /// Reads the digital input value of the port.
    ///
    /// # Errors
    ///
    /// Network failures, an `ERROR` reply, or a reply whose value is
    /// neither `0` nor `1` fail the read.
    pub async fn digital_value(&self) -> Result<bool> {
        let reply = self
            .port_command("dread", Vec::new())
            .await
            .reply()
            .await?
            .into_reply()?;

        match reply.arguments_as_slice().first().map(String::as_str) {
            Some("0") => Ok(false),
            Some("1") => Ok(true),
            _ => Err(Error::new(
                ErrorKind::InvalidReply,
                format!("the digital read reply `{reply}` carries no boolean value"),
            )),
        }
    }

    /// Drives the analog output value of the port.
    ///
    /// Same acknowledgement contract as [`set_mode`](Self::set_mode).
    pub async fn set_analog_value(&self, value: f64) -> ReplyHandle {
        self.port_command("awrite", vec![value.to_string()]).await
    }

    /// Reads the analog input value of the port.
    ///
    /// # Errors
    ///
    /// Network failures, an `ERROR` reply, or a reply whose value is not
    /// numeric fail the read.
    pub async fn analog_value(&self) -> Result<f64> {
        let reply = self
            .port_command("aread", Vec::new())
            .await
            .reply()
            .await?
            .into_reply()?;

        reply
            .arguments_as_slice()
            .first()
            .and_then(|a| a.parse::<f64>().ok())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidReply,
                    format!("the analog read reply `{reply}` carries no numeric value"),
                )
            })
    }

    /// Asks the gateway to push analog change events for the port: a change
    /// greater than `threshold`, sampled at most once per `min_interval`,
    /// produces one event.
    ///
    /// This is a one-shot remote configuration, not a local poll. Same
    /// acknowledgement contract as [`set_mode`](Self::set_mode).
    pub async fn listen_analog_value_change(
        &self,
        threshold: f64,
        min_interval: Duration,
    ) -> ReplyHandle {
        self.port_command(
            "alisten",
            vec![threshold.to_string(), min_interval.as_millis().to_string()],
        )
        .await
    }

    /// Sends a capability command for the device attached to the port.
    ///
    /// The command name on the wire is the capability itself; the port
    /// identifier and the action precede the given arguments. Same
    /// acknowledgement contract as [`set_mode`](Self::set_mode).
    pub async fn send_capability_command(
        &self,
        capability: &str,
        action: &str,
        arguments: Vec<String>,
    ) -> ReplyHandle {
        let mut wire_arguments = Vec::with_capacity(arguments.len() + 2);
        wire_arguments.push(self.shared.id.to_string());
        wire_arguments.push(action.to_owned());
        wire_arguments.extend(arguments);

        self.shared.dispatcher.send(capability, wire_arguments).await
    }

    /// Registers a listener invoked on every digital input value change of
    /// the port.
    pub fn on_digital_value_change(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.shared
            .digital_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Registers a listener invoked on every analog input value change of
    /// the port.
    pub fn on_analog_value_change(&self, listener: impl Fn(f64) + Send + Sync + 'static) {
        self.shared
            .analog_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Registers a listener invoked on every rising edge interrupt of the
    /// port.
    pub fn on_rising_edge(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared
            .rising_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Registers a listener invoked on every falling edge interrupt of the
    /// port.
    pub fn on_falling_edge(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.shared
            .falling_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Registers a listener invoked on every update event of the given
    /// capability addressed to the port.
    ///
    /// The listener receives the event arguments following the port
    /// identifier.
    pub fn on_capability_update(
        &self,
        capability: impl Into<String>,
        listener: impl Fn(&[String]) + Send + Sync + 'static,
    ) {
        self.shared
            .capability_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(CapabilityListener {
                capability: capability.into(),
                callback: Box::new(listener),
            });
    }

    // Sends one `port` command with the port identifier and verb prefix.
    async fn port_command(&self, verb: &str, extra: Vec<String>) -> ReplyHandle {
        let mut arguments = Vec::with_capacity(extra.len() + 2);
        arguments.push(self.shared.id.to_string());
        arguments.push(verb.to_owned());
        arguments.extend(extra);

        self.shared.dispatcher.send(PORT_COMMAND, arguments).await
    }
}

impl fmt::Debug for PortController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortController")
            .field("id", &self.shared.id)
            .field("mode", &self.mode())
            .field("pull_mode", &self.pull_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use fenice::error::ErrorKind;

    use fenice_link::config::LinkConfig;
    use fenice_link::connection::{Connection, LinkEvent};
    use fenice_link::dispatcher::CommandDispatcher;

    use crate::mode::{PortMode, PullMode};

    use super::PortController;

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

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
    async fn configuration_commands_on_the_wire() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let port = PortController::new(&dispatcher, 6);
        assert_eq!(port.id(), 6);
        assert_eq!(port.mode(), PortMode::Unused);

        let gateway = tokio::spawn(async move {
            assert_eq!(
                lines.next_line().await.unwrap().unwrap(),
                "1:port:6:mode:ANALOG_IN"
            );
            write_half.write_all(b"1:OK\n").await.unwrap();

            assert_eq!(
                lines.next_line().await.unwrap().unwrap(),
                "2:port:6:pull:UP"
            );
            write_half.write_all(b"2:OK\n").await.unwrap();

            assert_eq!(
                lines.next_line().await.unwrap().unwrap(),
                "3:port:6:alisten:0.05:200"
            );
            write_half.write_all(b"3:OK\n").await.unwrap();
        });

        let handle = port.set_mode(PortMode::AnalogIn).await;
        // The local mirror is optimistic: updated before the reply.
        assert_eq!(port.mode(), PortMode::AnalogIn);
        let reply = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();
        assert_eq!(reply.name(), "OK");

        let handle = port.set_pull_mode(PullMode::Up).await;
        assert_eq!(port.pull_mode(), PullMode::Up);
        let _ = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();

        let handle = port
            .listen_analog_value_change(0.05, Duration::from_millis(200))
            .await;
        let _ = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();

        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn digital_and_analog_values() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let port = PortController::new(&dispatcher, 3);

        let gateway = tokio::spawn(async move {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "1:port:3:dwrite:1");
            write_half.write_all(b"1:OK\n").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "2:port:3:dread");
            write_half.write_all(b"2:OK:0\n").await.unwrap();

            assert_eq!(
                lines.next_line().await.unwrap().unwrap(),
                "3:port:3:awrite:0.75"
            );
            write_half.write_all(b"3:OK\n").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "4:port:3:aread");
            write_half.write_all(b"4:OK:0.42\n").await.unwrap();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "5:port:3:aread");
            write_half.write_all(b"5:OK:garbage\n").await.unwrap();
        });

        let handle = port.set_digital_value(true).await;
        let _ = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();

        let value = timeout(TEST_TIMEOUT, port.digital_value())
            .await
            .unwrap()
            .unwrap();
        assert!(!value);

        let handle = port.set_analog_value(0.75).await;
        let _ = timeout(TEST_TIMEOUT, handle.reply()).await.unwrap().unwrap();

        let value = timeout(TEST_TIMEOUT, port.analog_value())
            .await
            .unwrap()
            .unwrap();
        assert!((value - 0.42).abs() < f64::EPSILON);

        let error = timeout(TEST_TIMEOUT, port.analog_value())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidReply);

        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn events_are_routed_to_the_addressed_port() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (_read_half, mut write_half) = stream.into_split();

        let port = PortController::new(&dispatcher, 6);
        let other = PortController::new(&dispatcher, 7);

        let (tx, mut rx) = mpsc::unbounded_channel();

        let analog_tx = tx.clone();
        port.on_analog_value_change(move |value| {
            let _ = analog_tx.send(format!("analog {value}"));
        });

        let digital_tx = tx.clone();
        port.on_digital_value_change(move |value| {
            let _ = digital_tx.send(format!("digital {value}"));
        });

        let rising_tx = tx.clone();
        port.on_rising_edge(move || {
            let _ = rising_tx.send("rising".to_owned());
        });

        let falling_tx = tx;
        port.on_falling_edge(move || {
            let _ = falling_tx.send("falling".to_owned());
        });

        let (other_tx, mut other_rx) = mpsc::unbounded_channel();
        other.on_analog_value_change(move |value| {
            let _ = other_tx.send(value);
        });

        write_half
            .write_all(b"0:achange:6:0.5\n0:dchange:6:1\n0:rising:6\n0:falling:6\n")
            .await
            .unwrap();

        assert_eq!(
            timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
            "analog 0.5"
        );
        assert_eq!(
            timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
            "digital true"
        );
        assert_eq!(
            timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
            "rising"
        );
        assert_eq!(
            timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
            "falling"
        );

        // Port 7 saw none of the port 6 events.
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn capability_commands_and_updates() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let port = PortController::new(&dispatcher, 6);

        let (tx, mut rx) = mpsc::unbounded_channel();
        port.on_capability_update("TSL2561", move |arguments| {
            let _ = tx.send(arguments.to_vec());
        });

        let gateway = tokio::spawn(async move {
            assert_eq!(
                lines.next_line().await.unwrap().unwrap(),
                "1:TSL2561:6:enable:high"
            );
            write_half.write_all(b"1:OK:ready\n").await.unwrap();

            // An unsolicited capability update for the port.
            write_half.write_all(b"0:TSL2561:6:123:456\n").await.unwrap();
        });

        let handle = port
            .send_capability_command("TSL2561", "enable", vec!["high".into()])
            .await;
        let reply = timeout(TEST_TIMEOUT, handle.reply())
            .await
            .unwrap()
            .unwrap()
            .into_reply()
            .unwrap();
        assert_eq!(reply.arguments_as_slice(), ["ready"]);

        let update = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(update, ["123", "456"]);

        gateway.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_controllers_stop_routing() {
        let (dispatcher, stream) = connected_dispatcher().await;
        let (_read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::unbounded_channel();

        let port = PortController::new(&dispatcher, 6);
        port.on_analog_value_change(move |value| {
            let _ = tx.send(value);
        });

        write_half.write_all(b"0:achange:6:0.1\n").await.unwrap();
        let first = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert!((first - 0.1).abs() < f64::EPSILON);

        drop(port);

        write_half.write_all(b"0:achange:6:0.2\n").await.unwrap();

        // The second event finds no live controller. Give the reader loop
        // time to deliver it before checking.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }
}
