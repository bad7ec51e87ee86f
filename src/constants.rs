//! Protocol constants and configuration defaults

/// Default TCP port of the engine's external module listener
pub const DEFAULT_PORT: u16 = 5040;

/// Default track name tagging this client in engine logs
pub const DEFAULT_TRACKNAME: &str = "next-yate";

/// Delay before retrying a dropped network connection
pub const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 10_000;

/// How long a dispatched message waits for its answer
pub const DEFAULT_DISPATCH_TIMEOUT_MS: u64 = 10_000;

/// How long handlers may run before an incoming message is acknowledged as received
pub const DEFAULT_ACKNOWLEDGE_TIMEOUT_MS: u64 = 10_000;

/// Maximum outbound line length in bytes; longer lines are truncated
pub const DEFAULT_BUFSIZE: usize = 8192;

/// Maximum number of outbound lines parked while disconnected
pub const DEFAULT_OFFLINE_QUEUE_LIMIT: usize = 100;

/// Fallback deadline for media operations on a call leg (one hour)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 3_600_000;

/// Default handler priority communicated to the engine
pub const DEFAULT_PRIORITY: u32 = 100;

/// Highest accepted handler priority
pub const MAX_PRIORITY: u32 = 100;

/// Milliseconds of tone playback budgeted per DTMF digit
pub const DTMF_MS_PER_DIGIT: u64 = 250;

/// Default `maxlen` for `wave/record` attachments, in milliseconds
pub const DEFAULT_RECORD_MAXLEN_MS: u64 = 180_000;

/// Grace period between a requested shutdown and process exit
pub const SHUTDOWN_GRACE_MS: u64 = 100;

/// Outbound verb: connection announcement in network mode.
pub const VERB_CONNECT: &str = "%%>connect";
/// Outbound verb: engine log line.
pub const VERB_OUTPUT: &str = "%%>output";
/// Outbound verb: set or query a local parameter.
pub const VERB_SETLOCAL: &str = "%%>setlocal";
/// Outbound verb: install a message handler.
pub const VERB_INSTALL: &str = "%%>install";
/// Outbound verb: remove a message handler.
pub const VERB_UNINSTALL: &str = "%%>uninstall";
/// Outbound verb: watch messages handled elsewhere.
pub const VERB_WATCH: &str = "%%>watch";
/// Outbound verb: stop watching.
pub const VERB_UNWATCH: &str = "%%>unwatch";
/// Outbound verb: enqueue or dispatch a message.
pub const VERB_MESSAGE: &str = "%%>message";
/// Outbound verb: acknowledge an incoming message.
pub const VERB_MESSAGE_ACK: &str = "%%<message";

/// Inbound verb: incoming message to be handled and acknowledged.
pub const REPLY_MESSAGE_IN: &str = "%%>message";
/// Inbound verb: answer (id set) or notification (id empty).
pub const REPLY_MESSAGE: &str = "%%<message";
/// Inbound verb: install confirmation.
pub const REPLY_INSTALL: &str = "%%<install";
/// Inbound verb: uninstall confirmation.
pub const REPLY_UNINSTALL: &str = "%%<uninstall";
/// Inbound verb: watch confirmation.
pub const REPLY_WATCH: &str = "%%<watch";
/// Inbound verb: unwatch confirmation.
pub const REPLY_UNWATCH: &str = "%%<unwatch";
/// Inbound verb: setlocal result.
pub const REPLY_SETLOCAL: &str = "%%<setlocal";

/// Engine parameters read by [`get_environment`](crate::YateClient::get_environment),
/// each prefixed with `engine.` on the wire.
pub const ENVIRONMENT_KEYS: &[&str] = &[
    "version",
    "release",
    "nodename",
    "runid",
    "configname",
    "sharedpath",
    "configpath",
    "cfgsuffix",
    "modulepath",
    "modsuffix",
    "logfile",
    "clientmode",
    "supervised",
    "maxworkers",
];
