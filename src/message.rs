//! Engine message records.

use crate::params::{ParamValue, Params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// The role a message record plays in the protocol exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum MessageKind {
    /// Engine-originated message awaiting acknowledgement.
    Incoming,
    /// Application-originated message not yet on the wire.
    Outgoing,
    /// Engine answer correlated to a dispatched message by id.
    Answer,
    /// Engine record for a message handled elsewhere; no acknowledgement.
    Notification,
    /// Reply to an install request.
    Install,
    /// Reply to an uninstall request.
    Uninstall,
    /// Reply to a watch request.
    Watch,
    /// Reply to an unwatch request.
    Unwatch,
    /// Reply to a setlocal request.
    Setlocal,
    /// Unparseable or engine-reported error line.
    Error,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Incoming => "incoming",
            MessageKind::Outgoing => "outgoing",
            MessageKind::Answer => "answer",
            MessageKind::Notification => "notification",
            MessageKind::Install => "install",
            MessageKind::Uninstall => "uninstall",
            MessageKind::Watch => "watch",
            MessageKind::Unwatch => "unwatch",
            MessageKind::Setlocal => "setlocal",
            MessageKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// One engine message: a tagged record plus its parameter map.
///
/// Outgoing messages are created with [`Message::new`], which assigns a
/// fresh process-unique id of the form `<epoch-secs>.<monotonic-nanos>`.
/// Every other kind is produced by the line codec.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    time: u64,
    name: String,
    kind: MessageKind,
    return_value: String,
    success: Option<bool>,
    priority: Option<u32>,
    params: Params,
}

impl Message {
    /// Create an outgoing message with a fresh unique id.
    pub fn new(name: impl Into<String>) -> Self {
        let now = epoch_secs();
        Self {
            id: format!("{}.{}", now, monotonic_nanos()),
            time: now,
            name: name.into(),
            kind: MessageKind::Outgoing,
            return_value: String::new(),
            success: None,
            priority: None,
            params: Params::new(),
        }
    }

    /// Construct a record with explicit fields; used by the codec and tests.
    pub(crate) fn from_parts(
        kind: MessageKind,
        id: impl Into<String>,
        time: u64,
        name: impl Into<String>,
        return_value: impl Into<String>,
        params: Params,
    ) -> Self {
        Self {
            id: id.into(),
            time,
            name: name.into(),
            kind,
            return_value: return_value.into(),
            success: None,
            priority: None,
            params,
        }
    }

    /// Message id; empty for some reply kinds.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in seconds since the epoch.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Message name (e.g. `call.route`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record kind.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Return value carried by the record; the full raw line for
    /// [`MessageKind::Error`].
    pub fn return_value(&self) -> &str {
        &self.return_value
    }

    /// Replace the return value.
    pub fn set_return_value(&mut self, value: impl Into<String>) {
        self.return_value = value.into();
    }

    /// Success flag of replies, or the processed flag of answers.
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    pub(crate) fn set_success(&mut self, success: bool) {
        self.success = Some(success);
    }

    /// Handler priority carried by install replies.
    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: u32) {
        self.priority = Some(priority);
    }

    /// Parameter map.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Mutable parameter map.
    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    /// Look up a (possibly dotted) parameter.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Text value of a parameter.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get_str(name)
    }

    /// Set a parameter, consuming and returning `self` for chained
    /// construction of outgoing messages.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.set(name, value);
        self
    }

    /// Set the return value, consuming and returning `self`.
    pub fn with_return_value(mut self, value: impl Into<String>) -> Self {
        self.return_value = value.into();
        self
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Strictly increasing nanosecond counter, unique within this process run.
///
/// Based on elapsed time since first use; bumped by one whenever two calls
/// land in the same nanosecond.
pub(crate) fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    static LAST: AtomicU64 = AtomicU64::new(0);

    let elapsed = START.get_or_init(Instant::now).elapsed().as_nanos() as u64;
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = elapsed.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}
