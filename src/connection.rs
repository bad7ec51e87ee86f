//! Connection management for the external module link.
//!
//! One background link task owns the socket: it reads inbound lines,
//! serializes every outbound line (single-writer discipline), and drives
//! reconnection. [`YateClient`] is a cheap-to-clone handle; operations
//! funnel their wire form through a bounded queue that doubles as the
//! offline park while the link is down.

use std::borrow::Cow;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::channel::CallChannel;
use crate::codec;
use crate::command::{Command, Role};
use crate::constants::{
    DEFAULT_ACKNOWLEDGE_TIMEOUT_MS, DEFAULT_BUFSIZE, DEFAULT_CALL_TIMEOUT_MS,
    DEFAULT_DISPATCH_TIMEOUT_MS, DEFAULT_OFFLINE_QUEUE_LIMIT, DEFAULT_PORT, DEFAULT_PRIORITY,
    DEFAULT_RECONNECT_TIMEOUT_MS, DEFAULT_TRACKNAME, ENVIRONMENT_KEYS, MAX_PRIORITY,
    SHUTDOWN_GRACE_MS,
};
use crate::error::{YateError, YateResult};
use crate::handler::{HandlerOutcome, MessageHandler, NotificationWatcher};
use crate::message::{Message, MessageKind};
use crate::registry::{InstallAction, MessageFilter, Registry};
use crate::router::{fold_outcomes, Router, WaitKey};

/// Where the engine lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Endpoint {
    /// Lines on stdin/stdout; used when the engine launches this process.
    /// Reconnection is meaningless and disabled.
    #[default]
    Stdio,
    /// TCP connection to the engine's external module listener.
    Tcp {
        /// Engine host.
        host: String,
        /// Listener port, normally [`DEFAULT_PORT`].
        port: u16,
    },
    /// UNIX stream socket.
    #[cfg(unix)]
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

/// Direction of a wire line handed to a [`WireObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Engine to application.
    Inbound,
    /// Application to engine.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("<-"),
            Direction::Outbound => f.write_str("->"),
        }
    }
}

/// Observer invoked for every line in each direction and for decode errors.
///
/// All methods default to no-ops; the crate additionally `trace!`s every
/// line regardless of the observer.
pub trait WireObserver: Send + Sync {
    /// One line crossed the wire.
    fn wire_line(&self, _direction: Direction, _line: &str) {}
    /// An inbound line failed to decode or the engine reported an error.
    fn protocol_error(&self, _line: &str) {}
}

/// Connection status for the external module link.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// The link is up.
    Connected,
    /// The link is down; reconnection may be in progress.
    Disconnected(DisconnectReason),
}

/// Reason for a disconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean EOF from the engine.
    ConnectionClosed,
    /// Transport I/O error (io::Error is not Clone, so we store the message).
    IoError(String),
    /// The application called [`YateClient::shutdown`] or SIGINT fired.
    ClientRequested,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Options for the external module connection.
///
/// Use [`Default::default()`] for a stdio link with standard knobs.
#[derive(Clone)]
pub struct YateConnectOptions {
    /// Transport endpoint.
    pub endpoint: Endpoint,
    /// Role announced in the `%%>connect` line (network mode only).
    pub role: Role,
    /// Track name tagging this client in engine logs.
    pub trackname: String,
    /// Reconnect after a drop (network mode only). Default: true.
    pub reconnect: bool,
    /// Delay between reconnection attempts. Default: 10 s.
    pub reconnect_timeout: Duration,
    /// Deadline for dispatched messages and request replies. Default: 10 s.
    pub dispatch_timeout: Duration,
    /// Deadline for handlers before an incoming message is acknowledged
    /// as received. Default: 10 s.
    pub acknowledge_timeout: Duration,
    /// Maximum outbound line length in bytes. Default: 8192.
    pub bufsize: usize,
    /// Bound of the offline line queue. Default: 100.
    pub offline_queue_limit: usize,
    /// Fallback deadline for channel media operations. Default: one hour.
    pub call_timeout: Duration,
    /// Operate as a single synthetic call leg; the process exits shortly
    /// after that leg hangs up. Default: false.
    pub channel_mode: bool,
    /// Close the link gracefully on SIGINT. Default: true.
    pub install_sigint: bool,
    /// Serialize parameters with empty values instead of skipping them.
    /// Default: false.
    pub emit_empty_params: bool,
    /// Log wire lines at debug level instead of trace. Default: false.
    pub debug: bool,
    /// Optional per-line observer.
    pub observer: Option<Arc<dyn WireObserver>>,
}

impl Default for YateConnectOptions {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Stdio,
            role: Role::Global,
            trackname: DEFAULT_TRACKNAME.to_string(),
            reconnect: true,
            reconnect_timeout: Duration::from_millis(DEFAULT_RECONNECT_TIMEOUT_MS),
            dispatch_timeout: Duration::from_millis(DEFAULT_DISPATCH_TIMEOUT_MS),
            acknowledge_timeout: Duration::from_millis(DEFAULT_ACKNOWLEDGE_TIMEOUT_MS),
            bufsize: DEFAULT_BUFSIZE,
            offline_queue_limit: DEFAULT_OFFLINE_QUEUE_LIMIT,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            channel_mode: false,
            install_sigint: true,
            emit_empty_params: false,
            debug: false,
            observer: None,
        }
    }
}

impl fmt::Debug for YateConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YateConnectOptions")
            .field("endpoint", &self.endpoint)
            .field("trackname", &self.trackname)
            .field("reconnect", &self.reconnect)
            .field("channel_mode", &self.channel_mode)
            .finish_non_exhaustive()
    }
}

/// Engine environment read through parallel `engine.*` setlocal queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct EngineEnvironment {
    /// Engine version string.
    pub version: Option<String>,
    /// Release tag.
    pub release: Option<String>,
    /// Node name.
    pub nodename: Option<String>,
    /// Run identifier of this engine instance.
    pub runid: Option<String>,
    /// Main configuration name.
    pub configname: Option<String>,
    /// Shared data path.
    pub sharedpath: Option<String>,
    /// Configuration file path.
    pub configpath: Option<String>,
    /// Configuration file suffix.
    pub cfgsuffix: Option<String>,
    /// Loadable module path.
    pub modulepath: Option<String>,
    /// Module file suffix.
    pub modsuffix: Option<String>,
    /// Engine log file.
    pub logfile: Option<String>,
    /// Whether the engine runs in client mode.
    pub clientmode: Option<String>,
    /// Whether the engine runs supervised.
    pub supervised: Option<String>,
    /// Maximum worker thread count.
    pub maxworkers: Option<String>,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Transport {
    reader: BoxedReader,
    writer: BoxedWriter,
    /// Network links announce themselves with `%%>connect`.
    network: bool,
}

async fn open_transport(endpoint: &Endpoint) -> YateResult<Transport> {
    match endpoint {
        Endpoint::Stdio => Ok(Transport {
            reader: Box::new(tokio::io::stdin()),
            writer: Box::new(tokio::io::stdout()),
            network: false,
        }),
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            let (read_half, write_half) = stream.into_split();
            Ok(Transport {
                reader: Box::new(read_half),
                writer: Box::new(write_half),
                network: true,
            })
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let stream = UnixStream::connect(path).await?;
            let (read_half, write_half) = stream.into_split();
            Ok(Transport {
                reader: Box::new(read_half),
                writer: Box::new(write_half),
                network: true,
            })
        }
    }
}

/// State shared between client handles and the link task.
pub(crate) struct Shared {
    registry: StdMutex<Registry>,
    router: Router,
    line_tx: mpsc::Sender<String>,
    trackname: String,
    dispatch_timeout: Duration,
    acknowledge_timeout: Duration,
    call_timeout: Duration,
    emit_empty_params: bool,
    channel_mode: bool,
    debug: bool,
    observer: Option<Arc<dyn WireObserver>>,
    reconnect_enabled: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn trace_wire(&self, direction: Direction, line: &str) {
        if self.debug {
            debug!("{} {}", direction, line);
        } else {
            trace!("{} {}", direction, line);
        }
        if let Some(observer) = &self.observer {
            observer.wire_line(direction, line);
        }
    }

    /// Queue one wire line, or fail fast when the park is full or the
    /// link task is gone.
    fn send_line(&self, line: String) -> YateResult<()> {
        match self.line_tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("offline queue full, dropping outbound line");
                Err(YateError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(YateError::NotConnected),
        }
    }

    fn send_command(&self, command: Command) -> YateResult<()> {
        self.send_line(command.to_wire_format())
    }
}

/// Client handle for the external module link (Clone + Send).
///
/// All operations are safe to call from any task; outbound lines are
/// serialized in call order by the link task.
#[derive(Clone)]
pub struct YateClient {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl fmt::Debug for YateClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YateClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct LinkConfig {
    endpoint: Endpoint,
    role: Role,
    bufsize: usize,
    reconnect_timeout: Duration,
}

impl YateClient {
    /// Connect over TCP with default options.
    pub async fn connect(host: &str, port: u16) -> YateResult<Self> {
        let options = YateConnectOptions {
            endpoint: Endpoint::Tcp {
                host: host.to_string(),
                port,
            },
            ..Default::default()
        };
        Self::connect_with_options(options).await
    }

    /// Connect over TCP to the default engine port.
    pub async fn connect_default(host: &str) -> YateResult<Self> {
        Self::connect(host, DEFAULT_PORT).await
    }

    /// Attach to the engine through stdin/stdout.
    pub async fn connect_stdio() -> YateResult<Self> {
        Self::connect_with_options(YateConnectOptions::default()).await
    }

    /// Connect over a UNIX stream socket with default options.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl Into<PathBuf>) -> YateResult<Self> {
        let options = YateConnectOptions {
            endpoint: Endpoint::Unix { path: path.into() },
            ..Default::default()
        };
        Self::connect_with_options(options).await
    }

    /// Connect with explicit options.
    ///
    /// The first connection attempt happens inline so unreachable engines
    /// fail fast; later reconnections run in the background link task.
    pub async fn connect_with_options(options: YateConnectOptions) -> YateResult<Self> {
        let transport = open_transport(&options.endpoint).await?;

        info!(endpoint = ?options.endpoint, "connected to engine");

        let (line_tx, line_rx) = mpsc::channel(options.offline_queue_limit.max(1));
        let reconnect = options.reconnect && transport.network;

        let shared = Arc::new(Shared {
            registry: StdMutex::new(Registry::default()),
            router: Router::default(),
            line_tx,
            trackname: options.trackname.clone(),
            dispatch_timeout: options.dispatch_timeout,
            acknowledge_timeout: options.acknowledge_timeout,
            call_timeout: options.call_timeout,
            emit_empty_params: options.emit_empty_params,
            channel_mode: options.channel_mode,
            debug: options.debug,
            observer: options.observer.clone(),
            reconnect_enabled: AtomicBool::new(reconnect),
            shutdown: Notify::new(),
        });

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        let config = LinkConfig {
            endpoint: options.endpoint.clone(),
            role: options.role,
            bufsize: options.bufsize,
            reconnect_timeout: options.reconnect_timeout,
        };
        tokio::spawn(link_task(
            shared.clone(),
            status_tx,
            line_rx,
            transport,
            config,
        ));

        let client = YateClient { shared, status_rx };
        if options.install_sigint {
            spawn_sigint_task(client.clone());
        }
        Ok(client)
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Wait until the link is up.
    pub async fn wait_connected(&self) -> YateResult<()> {
        let mut rx = self.status_rx.clone();
        loop {
            if matches!(*rx.borrow_and_update(), ConnectionStatus::Connected) {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(YateError::ConnectionClosed);
            }
        }
    }

    /// Close the link, disable reconnection, and stop the link task.
    pub fn shutdown(&self) {
        info!("client requested shutdown");
        self.shared
            .reconnect_enabled
            .store(false, Ordering::Relaxed);
        self.shared.shutdown.notify_one();
    }

    /// Install a message handler at the default priority, no filter.
    pub async fn install(
        &self,
        name: &str,
        handler: impl MessageHandler + 'static,
    ) -> YateResult<bool> {
        self.install_with(name, DEFAULT_PRIORITY, None, handler).await
    }

    /// Install a message handler with explicit priority and optional
    /// parameter filter.
    ///
    /// Replaces any handler with the same (name, filter) key. A priority
    /// differing from the name's current one replaces the engine-side
    /// subscription (uninstall, then install). Resolves `true` without
    /// wire traffic when the name is already advertised at this priority.
    /// A timeout resolves `false` and keeps the entry for replay; a
    /// negative engine reply rolls the entry back.
    pub async fn install_with(
        &self,
        name: &str,
        priority: u32,
        filter: Option<MessageFilter>,
        handler: impl MessageHandler + 'static,
    ) -> YateResult<bool> {
        if name.is_empty() {
            return Err(YateError::invalid_argument("message name must not be empty"));
        }
        if priority > MAX_PRIORITY {
            return Err(YateError::invalid_argument(format!(
                "priority {} out of range 0..={}",
                priority, MAX_PRIORITY
            )));
        }

        let rollback_key = filter
            .as_ref()
            .map(|f| (f.param().to_string(), f.pattern().to_string()));
        let action = self
            .registry()
            .upsert_handler(name, priority, filter, Arc::new(handler));

        if action == InstallAction::AlreadyInstalled {
            debug!("handler for {} already advertised", name);
            return Ok(true);
        }

        if action == InstallAction::Reinstall {
            debug!("priority change for {}, replacing engine subscription", name);
            let _ = self
                .request(
                    WaitKey::Uninstall(name.to_string()),
                    Command::Uninstall {
                        name: name.to_string(),
                    },
                    self.shared.dispatch_timeout,
                )
                .await?;
        }

        let reply = self
            .request(
                WaitKey::Install(name.to_string()),
                Command::Install {
                    priority,
                    name: name.to_string(),
                    filter: rollback_key.clone(),
                },
                self.shared.dispatch_timeout,
            )
            .await?;

        match reply {
            Some(m) if m.success() == Some(true) => Ok(true),
            Some(_) => {
                // Engine refused; the optimistic entry must not replay.
                let key = rollback_key
                    .as_ref()
                    .map(|(p, v)| (p.as_str(), v.as_str()));
                self.registry().rollback_handler(name, key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove every handler for `name`.
    ///
    /// Issues an engine-side uninstall once no handlers remain; resolves
    /// `false` when the subscription is retained for other handlers or
    /// nothing was removed.
    pub async fn uninstall(&self, name: &str) -> YateResult<bool> {
        self.uninstall_inner(name, None).await
    }

    /// Remove the handler keyed by (name, filter).
    pub async fn uninstall_filtered(
        &self,
        name: &str,
        filter_param: &str,
        filter_pattern: &str,
    ) -> YateResult<bool> {
        self.uninstall_inner(name, Some((filter_param, filter_pattern)))
            .await
    }

    async fn uninstall_inner(
        &self,
        name: &str,
        filter: Option<(&str, &str)>,
    ) -> YateResult<bool> {
        let outcome = self.registry().remove_handlers(name, filter);
        if outcome.removed == 0 || !outcome.name_empty {
            return Ok(false);
        }

        let reply = self
            .request(
                WaitKey::Uninstall(name.to_string()),
                Command::Uninstall {
                    name: name.to_string(),
                },
                self.shared.dispatch_timeout,
            )
            .await?;
        Ok(reply.and_then(|m| m.success()).unwrap_or(false))
    }

    /// Watch messages handled elsewhere, no filter.
    pub async fn watch(
        &self,
        name: &str,
        watcher: impl NotificationWatcher + 'static,
    ) -> YateResult<bool> {
        self.watch_with(name, None, watcher).await
    }

    /// Watch with an optional parameter filter.
    pub async fn watch_with(
        &self,
        name: &str,
        filter: Option<MessageFilter>,
        watcher: impl NotificationWatcher + 'static,
    ) -> YateResult<bool> {
        if name.is_empty() {
            return Err(YateError::invalid_argument("message name must not be empty"));
        }

        let rollback_key = filter
            .as_ref()
            .map(|f| (f.param().to_string(), f.pattern().to_string()));
        let needs_wire = self
            .registry()
            .upsert_watcher(name, filter, Arc::new(watcher));
        if !needs_wire {
            return Ok(true);
        }

        let reply = self
            .request(
                WaitKey::Watch(name.to_string()),
                Command::Watch {
                    name: name.to_string(),
                },
                self.shared.dispatch_timeout,
            )
            .await?;

        match reply {
            Some(m) if m.success() == Some(true) => Ok(true),
            Some(_) => {
                let key = rollback_key
                    .as_ref()
                    .map(|(p, v)| (p.as_str(), v.as_str()));
                self.registry().rollback_watcher(name, key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove every watcher for `name`.
    pub async fn unwatch(&self, name: &str) -> YateResult<bool> {
        self.unwatch_inner(name, None).await
    }

    /// Remove the watcher keyed by (name, filter).
    pub async fn unwatch_filtered(
        &self,
        name: &str,
        filter_param: &str,
        filter_pattern: &str,
    ) -> YateResult<bool> {
        self.unwatch_inner(name, Some((filter_param, filter_pattern)))
            .await
    }

    async fn unwatch_inner(&self, name: &str, filter: Option<(&str, &str)>) -> YateResult<bool> {
        let outcome = self.registry().remove_watchers(name, filter);
        if outcome.removed == 0 || !outcome.name_empty {
            return Ok(false);
        }

        let reply = self
            .request(
                WaitKey::Unwatch(name.to_string()),
                Command::Unwatch {
                    name: name.to_string(),
                },
                self.shared.dispatch_timeout,
            )
            .await?;
        Ok(reply.and_then(|m| m.success()).unwrap_or(false))
    }

    /// Set a local engine parameter, or query it by passing `None`.
    ///
    /// Resolves with the engine-reported value on success, `None` on
    /// timeout or refusal. Successful sets are recorded for replay after
    /// reconnect.
    pub async fn setlocal(&self, name: &str, value: Option<&str>) -> YateResult<Option<String>> {
        if name.is_empty() {
            return Err(YateError::invalid_argument(
                "parameter name must not be empty",
            ));
        }

        let reply = self
            .request(
                WaitKey::Setlocal(name.to_string()),
                Command::SetLocal {
                    name: name.to_string(),
                    value: value.unwrap_or("").to_string(),
                },
                self.shared.dispatch_timeout,
            )
            .await?;

        match reply {
            Some(m) if m.success() == Some(true) => {
                if let Some(set) = value {
                    if !set.is_empty() {
                        self.registry().set_setlocal(name, set);
                    }
                }
                Ok(Some(m.return_value().to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Fire-and-forget an outgoing message.
    pub fn enqueue(&self, message: Message) -> YateResult<()> {
        if message.kind() != MessageKind::Outgoing {
            return Err(YateError::invalid_argument(
                "only outgoing messages can be enqueued",
            ));
        }
        self.shared.send_command(Command::Message {
            message,
            emit_empty: self.shared.emit_empty_params,
        })
    }

    /// Dispatch an outgoing message and wait for its answer.
    ///
    /// On timeout the original message comes back with `success() ==
    /// Some(false)`; a late answer is discarded.
    pub async fn dispatch(&self, message: Message) -> YateResult<Message> {
        if message.kind() != MessageKind::Outgoing {
            return Err(YateError::invalid_argument(
                "only outgoing messages can be dispatched",
            ));
        }

        let mut original = message.clone();
        let reply = self
            .request(
                WaitKey::Answer(message.id().to_string()),
                Command::Message {
                    message,
                    emit_empty: self.shared.emit_empty_params,
                },
                self.shared.dispatch_timeout,
            )
            .await?;

        match reply {
            Some(answer) => Ok(answer),
            None => {
                original.set_success(false);
                Ok(original)
            }
        }
    }

    /// Acknowledge an incoming message early, before its handlers finish.
    ///
    /// Returns `true` if this call emitted the acknowledgement, `false`
    /// when it was already sent (first wins).
    pub fn acknowledge(&self, message: &Message, handled: bool) -> YateResult<bool> {
        if message.kind() != MessageKind::Incoming {
            return Err(YateError::invalid_argument(
                "only incoming messages can be acknowledged",
            ));
        }
        if !self.shared.router.take_ack(message.id()) {
            return Ok(false);
        }
        self.shared.send_command(Command::Acknowledge {
            id: message.id().to_string(),
            handled,
            return_value: message.return_value().to_string(),
            params: message.params().clone(),
            emit_empty: self.shared.emit_empty_params,
        })?;
        Ok(true)
    }

    /// Write text to the engine log, one `%%>output` line per input line.
    pub fn output(&self, text: &str) -> YateResult<()> {
        for line in text.split('\n') {
            if line.is_empty() {
                continue;
            }
            self.shared.send_command(Command::Output {
                text: line.to_string(),
            })?;
        }
        Ok(())
    }

    /// Read the engine environment through parallel setlocal queries.
    pub async fn get_environment(&self) -> YateResult<EngineEnvironment> {
        let reads = ENVIRONMENT_KEYS.iter().map(|key| async move {
            let value = self
                .setlocal(&format!("engine.{}", key), None)
                .await
                .unwrap_or(None);
            (*key, value)
        });

        let mut env = EngineEnvironment::default();
        for (key, value) in join_all(reads).await {
            match key {
                "version" => env.version = value,
                "release" => env.release = value,
                "nodename" => env.nodename = value,
                "runid" => env.runid = value,
                "configname" => env.configname = value,
                "sharedpath" => env.sharedpath = value,
                "configpath" => env.configpath = value,
                "cfgsuffix" => env.cfgsuffix = value,
                "modulepath" => env.modulepath = value,
                "modsuffix" => env.modsuffix = value,
                "logfile" => env.logfile = value,
                "clientmode" => env.clientmode = value,
                "supervised" => env.supervised = value,
                "maxworkers" => env.maxworkers = value,
                _ => {}
            }
        }
        Ok(env)
    }

    /// Operate this connection as a single synthetic call leg.
    ///
    /// Captures the engine-originated `call.execute` through a one-shot
    /// priority-0 handler and returns the ready channel. With
    /// `channel_mode` set in the options, the process exits shortly after
    /// the leg hangs up.
    pub async fn to_channel(&self) -> YateResult<CallChannel> {
        CallChannel::capture(self.clone()).await
    }

    async fn request(
        &self,
        key: WaitKey,
        command: Command,
        deadline: Duration,
    ) -> YateResult<Option<Message>> {
        let rx = self.shared.router.register(key.clone());
        if let Err(e) = self.shared.send_command(command) {
            self.shared.router.unregister(&key);
            return Err(e);
        }
        match timeout(deadline, rx).await {
            Ok(Ok(message)) => Ok(Some(message)),
            // Waiter replaced or dropped; resolve with the sentinel.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                debug!(?key, "request deadline elapsed");
                self.shared.router.unregister(&key);
                Ok(None)
            }
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .expect("registry lock poisoned")
    }

    pub(crate) fn trackname(&self) -> &str {
        &self.shared.trackname
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.shared.call_timeout
    }

    pub(crate) fn channel_mode(&self) -> bool {
        self.shared.channel_mode
    }

    pub(crate) fn purge_filtered(&self, param: &str, pattern: &str) {
        let purged = self.registry().purge_filtered(param, pattern);
        if purged > 0 {
            debug!("purged {} registry entries for {}={}", purged, param, pattern);
        }
    }
}

fn spawn_sigint_task(client: YateClient) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, closing link");
            client.shutdown();
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
            std::process::exit(0);
        }
    });
}

enum ServeEnd {
    Closed(DisconnectReason),
    Shutdown,
}

async fn link_task(
    shared: Arc<Shared>,
    status_tx: watch::Sender<ConnectionStatus>,
    mut line_rx: mpsc::Receiver<String>,
    first: Transport,
    config: LinkConfig,
) {
    let mut transport = Some(first);
    loop {
        let current = match transport.take() {
            Some(t) => t,
            None => match open_transport(&config.endpoint).await {
                Ok(t) => {
                    info!("reconnected to engine");
                    t
                }
                Err(e) => {
                    warn!("reconnect attempt failed: {}", e);
                    if !wait_retry(&shared, config.reconnect_timeout).await {
                        break;
                    }
                    continue;
                }
            },
        };

        let _ = status_tx.send(ConnectionStatus::Connected);

        match serve(&shared, current, &mut line_rx, &config).await {
            ServeEnd::Closed(reason) => {
                warn!("link down: {}", reason);
                let _ = status_tx.send(ConnectionStatus::Disconnected(reason));
                if !shared.reconnect_enabled.load(Ordering::Relaxed) {
                    break;
                }
                if !wait_retry(&shared, config.reconnect_timeout).await {
                    break;
                }
            }
            ServeEnd::Shutdown => {
                let _ = status_tx.send(ConnectionStatus::Disconnected(
                    DisconnectReason::ClientRequested,
                ));
                break;
            }
        }
    }

    shared.router.abort_all();
    debug!("link task finished");
}

/// Sleep out the reconnect delay; `false` means shutdown fired meanwhile.
async fn wait_retry(shared: &Shared, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => shared.reconnect_enabled.load(Ordering::Relaxed),
        _ = shared.shutdown.notified() => false,
    }
}

async fn serve(
    shared: &Arc<Shared>,
    transport: Transport,
    line_rx: &mut mpsc::Receiver<String>,
    config: &LinkConfig,
) -> ServeEnd {
    let Transport {
        reader,
        mut writer,
        network,
    } = transport;
    let mut lines = BufReader::new(reader).lines();

    // Announce and replay the registry before any parked line drains.
    let mut preamble = Vec::new();
    if network {
        preamble.push(
            Command::Connect {
                role: config.role,
                id: Some(shared.trackname.clone()),
                conn_type: Some("data".to_string()),
            }
            .to_wire_format(),
        );
    }
    {
        let registry = shared.registry.lock().expect("registry lock poisoned");
        for command in registry.replay_commands() {
            preamble.push(command.to_wire_format());
        }
    }
    for line in preamble {
        if let Err(e) = write_line(&mut writer, &line, config.bufsize, shared).await {
            return ServeEnd::Closed(DisconnectReason::IoError(e.to_string()));
        }
    }

    loop {
        tokio::select! {
            inbound = lines.next_line() => match inbound {
                Ok(Some(line)) => handle_inbound(shared, line),
                Ok(None) => return ServeEnd::Closed(DisconnectReason::ConnectionClosed),
                Err(e) => return ServeEnd::Closed(DisconnectReason::IoError(e.to_string())),
            },
            outbound = line_rx.recv() => match outbound {
                Some(line) => {
                    if let Err(e) = write_line(&mut writer, &line, config.bufsize, shared).await {
                        return ServeEnd::Closed(DisconnectReason::IoError(e.to_string()));
                    }
                }
                // All senders gone; treat as a shutdown.
                None => return ServeEnd::Shutdown,
            },
            _ = shared.shutdown.notified() => {
                let _ = writer.shutdown().await;
                return ServeEnd::Shutdown;
            }
        }
    }
}

async fn write_line(
    writer: &mut BoxedWriter,
    line: &str,
    bufsize: usize,
    shared: &Shared,
) -> std::io::Result<()> {
    let line = truncate_line(line, bufsize);
    shared.trace_wire(Direction::Outbound, &line);
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

fn truncate_line(line: &str, bufsize: usize) -> Cow<'_, str> {
    if line.len() <= bufsize {
        return Cow::Borrowed(line);
    }
    let mut end = bufsize;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    warn!("outbound line truncated from {} to {} bytes", line.len(), end);
    Cow::Borrowed(&line[..end])
}

fn handle_inbound(shared: &Arc<Shared>, line: String) {
    shared.trace_wire(Direction::Inbound, &line);

    let message = codec::parse_line(&line);
    match message.kind() {
        MessageKind::Incoming => dispatch_incoming(shared, message),
        MessageKind::Notification => dispatch_notification(shared, message),
        MessageKind::Answer => {
            let key = WaitKey::Answer(message.id().to_string());
            if !shared.router.complete(&key, message) {
                debug!("answer without a dispatcher, discarded");
            }
        }
        MessageKind::Install => {
            let key = WaitKey::Install(message.name().to_string());
            shared.router.complete(&key, message);
        }
        MessageKind::Uninstall => {
            let key = WaitKey::Uninstall(message.name().to_string());
            shared.router.complete(&key, message);
        }
        MessageKind::Watch => {
            let key = WaitKey::Watch(message.name().to_string());
            shared.router.complete(&key, message);
        }
        MessageKind::Unwatch => {
            let key = WaitKey::Unwatch(message.name().to_string());
            shared.router.complete(&key, message);
        }
        MessageKind::Setlocal => {
            let key = WaitKey::Setlocal(message.name().to_string());
            shared.router.complete(&key, message);
        }
        MessageKind::Error => {
            warn!("engine error line: {}", message.return_value());
            if let Some(observer) = &shared.observer {
                observer.protocol_error(message.return_value());
            }
        }
        MessageKind::Outgoing => {
            debug!("ignoring unexpected outgoing record from parser");
        }
    }
}

fn dispatch_incoming(shared: &Arc<Shared>, message: Message) {
    let handlers = {
        let registry = shared.registry.lock().expect("registry lock poisoned");
        registry.matching_handlers(&message)
    };
    shared.router.begin_ack(message.id());

    let shared = shared.clone();
    tokio::spawn(async move {
        let id = message.id().to_string();
        let joined = timeout(
            shared.acknowledge_timeout,
            run_handlers(&shared, &handlers, &message),
        )
        .await;

        let (handled, result) = match joined {
            Ok(outcomes) => fold_outcomes(&message, outcomes),
            Err(_) => {
                debug!("acknowledge deadline elapsed for {}", id);
                (false, message.clone())
            }
        };
        send_ack(&shared, &id, handled, &result);
    });
}

async fn run_handlers(
    shared: &Arc<Shared>,
    handlers: &[Arc<dyn MessageHandler>],
    message: &Message,
) -> Vec<HandlerOutcome> {
    let tasks: Vec<_> = handlers
        .iter()
        .map(|handler| tokio::spawn(handler.handle(message.clone())))
        .collect();

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!("handler failed: {}", e);
                let _ = shared.send_command(Command::Output {
                    text: format!("handler failed for {}: {}", message.name(), e),
                });
                outcomes.push(HandlerOutcome::Ignored);
            }
        }
    }
    outcomes
}

fn send_ack(shared: &Shared, id: &str, handled: bool, message: &Message) {
    // First wins: an explicit acknowledge or the deadline may have beaten us.
    if !shared.router.take_ack(id) {
        return;
    }
    let result = shared.send_command(Command::Acknowledge {
        id: id.to_string(),
        handled,
        return_value: message.return_value().to_string(),
        params: message.params().clone(),
        emit_empty: shared.emit_empty_params,
    });
    if let Err(e) = result {
        warn!("failed to queue acknowledgement for {}: {}", id, e);
    }
}

fn dispatch_notification(shared: &Arc<Shared>, message: Message) {
    let watchers = {
        let registry = shared.registry.lock().expect("registry lock poisoned");
        registry.matching_watchers(&message)
    };
    if watchers.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let tasks: Vec<_> = watchers
            .iter()
            .map(|watcher| tokio::spawn(watcher.notify(message.clone())))
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("watcher failed: {}", e);
            }
        }
    });
}
