//! Call-leg state machine over the message router.
//!
//! A [`CallChannel`] tracks one call leg: it is created from an incoming
//! `call.route` or `call.execute`, keeps watchers alive on `chan.notify`
//! and `chan.hangup` for its id, and sequences the `chan.attach` /
//! `call.*` masquerade flows. Every suspendable operation honors a single
//! per-channel `reset` signal that cancels in-flight work.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::connection::YateClient;
use crate::constants::{DEFAULT_RECORD_MAXLEN_MS, DTMF_MS_PER_DIGIT, SHUTDOWN_GRACE_MS};
use crate::error::{YateError, YateResult};
use crate::handler::HandlerOutcome;
use crate::message::{monotonic_nanos, Message, MessageKind};
use crate::params::Params;
use crate::registry::MessageFilter;

/// Lifecycle of a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ChannelStatus {
    /// Leg created, not yet progressing.
    Incoming,
    /// Ringing or early progress signalled.
    Ringing,
    /// Call answered.
    Answered,
    /// Dropped by this side via `call.drop`.
    Dropped,
    /// Engine reported `chan.hangup`.
    Hangup,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelStatus::Incoming => "incoming",
            ChannelStatus::Ringing => "ringing",
            ChannelStatus::Answered => "answered",
            ChannelStatus::Dropped => "dropped",
            ChannelStatus::Hangup => "hangup",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an invalid channel status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelStatusError(pub String);

impl fmt::Display for ParseChannelStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel status: {}", self.0)
    }
}

impl std::error::Error for ParseChannelStatusError {}

impl FromStr for ChannelStatus {
    type Err = ParseChannelStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incoming" => Ok(Self::Incoming),
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "dropped" => Ok(Self::Dropped),
            "hangup" => Ok(Self::Hangup),
            _ => Err(ParseChannelStatusError(s.to_string())),
        }
    }
}

struct ChannelInner {
    id: String,
    peer_id: StdMutex<String>,
    status: StdMutex<ChannelStatus>,
    ready: AtomicBool,
    /// Channel-mode legs end the process shortly after hangup.
    exit_on_hangup: bool,
    reset_tx: watch::Sender<u64>,
}

/// One call leg (Clone + Send).
#[derive(Clone)]
pub struct CallChannel {
    client: YateClient,
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for CallChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallChannel")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl CallChannel {
    /// Create a channel from an incoming `call.route` or `call.execute`.
    ///
    /// The seed message must carry an `id` parameter. Call
    /// [`init`](Self::init) afterwards to install lifecycle watchers and
    /// wait for the leg to become ready.
    pub fn from_message(client: YateClient, seed: &Message) -> YateResult<Self> {
        if seed.name() != "call.route" && seed.name() != "call.execute" {
            return Err(YateError::invalid_argument(format!(
                "cannot build a channel from {}",
                seed.name()
            )));
        }
        let id = seed
            .param_str("id")
            .ok_or_else(|| YateError::invalid_argument("seed message has no id parameter"))?
            .to_string();

        let peer_id = seed
            .param_str("targetid")
            .or_else(|| seed.param_str("peerid"))
            .unwrap_or_default()
            .to_string();
        let status = seed
            .param_str("status")
            .and_then(|s| s.parse().ok())
            .unwrap_or(ChannelStatus::Incoming);
        // A notification-form call.execute means the leg already runs.
        let ready = seed.kind() == MessageKind::Notification && seed.name() == "call.execute";

        Ok(Self {
            client,
            inner: Arc::new(ChannelInner {
                id,
                peer_id: StdMutex::new(peer_id),
                status: StdMutex::new(status),
                ready: AtomicBool::new(ready),
                exit_on_hangup: false,
                reset_tx: watch::channel(0).0,
            }),
        })
    }

    /// Leg id of this channel.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current peer leg id.
    pub fn peer_id(&self) -> String {
        self.inner.peer_id.lock().expect("peer lock poisoned").clone()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.lock().expect("status lock poisoned")
    }

    /// Whether the leg is ready for media operations.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    /// Cancel every in-flight operation on this channel.
    pub fn reset(&self) {
        debug!("channel {} reset", self.inner.id);
        self.inner.reset_tx.send_modify(|generation| *generation += 1);
    }

    /// Install lifecycle watchers and wait for the leg to become ready.
    ///
    /// Unless the seed already carried a running `call.execute`, this
    /// waits for the `call.execute` notification for our id, then records
    /// the peer id and status it carries.
    pub async fn init(&self) -> YateResult<()> {
        self.install_lifecycle_watchers().await?;
        if self.inner.ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let deadline = self.client.call_timeout();
        let reply = self
            .await_oneshot(
                "call.execute",
                MessageFilter::exact("id", &self.inner.id),
                deadline,
            )
            .await?;

        match reply {
            Some(msg) => {
                self.absorb_leg_update(&msg);
                self.inner.ready.store(true, Ordering::Relaxed);
                Ok(())
            }
            None => Err(YateError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }

    /// Attach media to the leg and wait for the attachment to finish.
    ///
    /// Target families:
    /// - `wave/record/...` records from the peer (`consumer` side, default
    ///   `maxlen` of three minutes),
    /// - `tone/dtmf/...` and `tone/dtmfstr/<digits>` override the primary
    ///   leg's source and resolve after the tone duration,
    /// - anything else (`wave/play/...`, `tone/...`) plays towards the
    ///   peer (`source` side).
    ///
    /// Resolves with the matching `chan.notify` notification, or with a
    /// synthetic `reason=eof` record when the deadline (`timeout`
    /// parameter, else the connection's call timeout) elapses. A
    /// [`reset`](Self::reset) cancels with [`YateError::Cancelled`].
    pub async fn call_to(&self, target: &str, params: Params) -> YateResult<Message> {
        let notify_id = format!("{}-notify/{}", self.client.trackname(), monotonic_nanos());
        let plan = attach_plan(target, &self.inner.id, &self.peer_id(), &notify_id, params);

        let mut message = Message::new("chan.masquerade");
        *message.params_mut() = plan.params;

        let mut reset_rx = self.inner.reset_tx.subscribe();

        match plan.wait {
            AttachWait::Notify => {
                let deadline = plan.timeout.unwrap_or_else(|| self.client.call_timeout());
                let filter = MessageFilter::exact("targetid", &notify_id);
                let rx = self.watch_oneshot("chan.notify", filter.clone()).await?;

                let dispatched = tokio::select! {
                    result = self.client.dispatch(message) => result,
                    _ = reset_rx.changed() => Err(YateError::Cancelled),
                };
                if let Err(e) = dispatched {
                    let _ = self
                        .client
                        .unwatch_filtered("chan.notify", filter.param(), filter.pattern())
                        .await;
                    return Err(e);
                }

                let result = tokio::select! {
                    notified = timeout(deadline, rx) => match notified {
                        Ok(Ok(msg)) => Ok(msg),
                        // Watcher vanished (hangup purge) or deadline passed.
                        Ok(Err(_)) | Err(_) => Ok(eof_notification(Some(&notify_id))),
                    },
                    _ = reset_rx.changed() => Err(YateError::Cancelled),
                };
                let _ = self
                    .client
                    .unwatch_filtered("chan.notify", filter.param(), filter.pattern())
                    .await;
                result
            }
            AttachWait::Timer(wait) => {
                tokio::select! {
                    result = self.client.dispatch(message) => { result?; }
                    _ = reset_rx.changed() => return Err(YateError::Cancelled),
                }
                tokio::select! {
                    _ = tokio::time::sleep(wait) => Ok(eof_notification(None)),
                    _ = reset_rx.changed() => Err(YateError::Cancelled),
                }
            }
        }
    }

    /// Redirect the leg to a new target via a masqueraded `call.execute`.
    ///
    /// Updates the peer id and status from the answer. In channel mode
    /// this is terminal: the process exits shortly after.
    pub async fn call_just(&self, target: &str, params: Params) -> YateResult<Message> {
        let mut message = Message::new("chan.masquerade");
        message.params_mut().set("message", "call.execute");
        message.params_mut().set("id", self.inner.id.clone());
        message.params_mut().set("callto", target);
        message.params_mut().merge(&params);

        let answer = self.dispatch_cancellable(message).await?;
        self.absorb_leg_update(&answer);
        if self.inner.exit_on_hangup {
            schedule_exit();
        }
        Ok(answer)
    }

    /// Signal ringing towards the caller.
    pub async fn ringing(&self, params: Params) -> YateResult<Message> {
        self.masquerade_progress("call.ringing", params).await
    }

    /// Signal early media progress towards the caller.
    pub async fn progress(&self, params: Params) -> YateResult<Message> {
        self.masquerade_progress("call.progress", params).await
    }

    /// Answer the call.
    pub async fn answered(&self, params: Params) -> YateResult<Message> {
        self.masquerade_progress("call.answered", params).await
    }

    /// Drop the leg with an optional reason.
    pub async fn hangup(&self, reason: &str) -> YateResult<Message> {
        let mut message = Message::new("call.drop");
        message.params_mut().set("id", self.inner.id.clone());
        if !reason.is_empty() {
            message.params_mut().set("reason", reason);
        }

        let answer = self.client.dispatch(message).await?;
        *self.inner.status.lock().expect("status lock poisoned") = ChannelStatus::Dropped;
        if self.inner.exit_on_hangup {
            schedule_exit();
        }
        Ok(answer)
    }

    /// Build the synthetic leg for a connection operating in channel mode.
    pub(crate) async fn capture(client: YateClient) -> YateResult<Self> {
        let peer_id = format!("{}/{}", client.trackname(), monotonic_nanos());

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(StdMutex::new(Some(tx)));
        let advertised = peer_id.clone();
        let handler = move |msg: Message| {
            let slot = slot.clone();
            let advertised = advertised.clone();
            async move {
                match slot.lock().expect("capture lock poisoned").take() {
                    Some(tx) => {
                        // Claim the leg: answer with our synthetic peer id.
                        let mut answer = msg.clone();
                        answer.params_mut().set("targetid", advertised);
                        let _ = tx.send(msg);
                        HandlerOutcome::Mutated {
                            message: answer,
                            handled: true,
                        }
                    }
                    None => HandlerOutcome::Ignored,
                }
            }
        };
        client.install_with("call.execute", 0, None, handler).await?;

        let deadline = client.call_timeout();
        let seed = match timeout(deadline, rx).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => return Err(YateError::ConnectionClosed),
            Err(_) => {
                let _ = client.uninstall("call.execute").await;
                return Err(YateError::Timeout {
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
        };
        // One-shot: stop claiming further calls.
        let _ = client.uninstall("call.execute").await;

        let id = seed
            .param_str("id")
            .ok_or_else(|| YateError::protocol_error("call.execute without id parameter"))?
            .to_string();
        let status = seed
            .param_str("status")
            .and_then(|s| s.parse().ok())
            .unwrap_or(ChannelStatus::Incoming);

        info!("captured call leg {} as {}", id, peer_id);
        let exit_on_hangup = client.channel_mode();
        let channel = Self {
            client,
            inner: Arc::new(ChannelInner {
                id,
                peer_id: StdMutex::new(peer_id),
                status: StdMutex::new(status),
                ready: AtomicBool::new(true),
                exit_on_hangup,
                reset_tx: watch::channel(0).0,
            }),
        };
        channel.install_lifecycle_watchers().await?;
        Ok(channel)
    }

    async fn masquerade_progress(&self, name: &str, params: Params) -> YateResult<Message> {
        let mut message = Message::new("chan.masquerade");
        message.params_mut().set("message", name);
        message.params_mut().set("id", self.inner.id.clone());
        message.params_mut().merge(&params);

        let answer = self.dispatch_cancellable(message).await?;

        let mut status = self.inner.status.lock().expect("status lock poisoned");
        if name == "call.answered" {
            *status = ChannelStatus::Answered;
        } else if *status != ChannelStatus::Answered {
            *status = ChannelStatus::Ringing;
        }
        drop(status);

        Ok(answer)
    }

    async fn dispatch_cancellable(&self, message: Message) -> YateResult<Message> {
        let mut reset_rx = self.inner.reset_tx.subscribe();
        tokio::select! {
            result = self.client.dispatch(message) => result,
            _ = reset_rx.changed() => Err(YateError::Cancelled),
        }
    }

    /// Record peer id and status carried by an answer or `call.execute`.
    fn absorb_leg_update(&self, msg: &Message) {
        if let Some(peer) = msg.param_str("targetid").or_else(|| msg.param_str("peerid")) {
            *self.inner.peer_id.lock().expect("peer lock poisoned") = peer.to_string();
        }
        if let Some(status) = msg.param_str("status").and_then(|s| s.parse().ok()) {
            *self.inner.status.lock().expect("status lock poisoned") = status;
        }
    }

    async fn install_lifecycle_watchers(&self) -> YateResult<()> {
        // Keeps per-leg subscriptions alive until hangup.
        let keep_alive = |_msg: Message| async {};
        self.client
            .watch_with(
                "chan.notify",
                Some(MessageFilter::exact("id", &self.inner.id)),
                keep_alive,
            )
            .await?;

        let client = self.client.clone();
        let inner = self.inner.clone();
        let on_hangup = move |_msg: Message| {
            let client = client.clone();
            let inner = inner.clone();
            async move {
                info!("channel {} hung up", inner.id);
                inner.ready.store(false, Ordering::Relaxed);
                *inner.status.lock().expect("status lock poisoned") = ChannelStatus::Hangup;
                let filter = MessageFilter::exact("id", &inner.id);
                client.purge_filtered(filter.param(), filter.pattern());
                inner.reset_tx.send_modify(|generation| *generation += 1);
                if inner.exit_on_hangup {
                    schedule_exit();
                }
            }
        };
        self.client
            .watch_with(
                "chan.hangup",
                Some(MessageFilter::exact("id", &self.inner.id)),
                on_hangup,
            )
            .await?;
        Ok(())
    }

    /// Install a one-shot filtered watcher delivering into a oneshot slot.
    async fn watch_oneshot(
        &self,
        name: &str,
        filter: MessageFilter,
    ) -> YateResult<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(StdMutex::new(Some(tx)));
        let watcher = move |msg: Message| {
            let slot = slot.clone();
            async move {
                if let Some(tx) = slot.lock().expect("watch slot poisoned").take() {
                    let _ = tx.send(msg);
                }
            }
        };
        self.client.watch_with(name, Some(filter), watcher).await?;
        Ok(rx)
    }

    /// One-shot wait with deadline and reset cancellation; the watcher is
    /// removed on every exit path.
    async fn await_oneshot(
        &self,
        name: &str,
        filter: MessageFilter,
        deadline: Duration,
    ) -> YateResult<Option<Message>> {
        let mut reset_rx = self.inner.reset_tx.subscribe();
        let rx = self.watch_oneshot(name, filter.clone()).await?;

        let result = tokio::select! {
            received = timeout(deadline, rx) => match received {
                Ok(Ok(msg)) => Ok(Some(msg)),
                Ok(Err(_)) | Err(_) => Ok(None),
            },
            _ = reset_rx.changed() => Err(YateError::Cancelled),
        };
        let _ = self
            .client
            .unwatch_filtered(name, filter.param(), filter.pattern())
            .await;
        result
    }
}

enum AttachWait {
    /// Resolve on the first matching `chan.notify`.
    Notify,
    /// No notification comes back; resolve after the tone duration.
    Timer(Duration),
}

struct AttachPlan {
    params: Params,
    wait: AttachWait,
    timeout: Option<Duration>,
}

fn attach_plan(
    target: &str,
    channel_id: &str,
    peer_id: &str,
    notify_id: &str,
    user: Params,
) -> AttachPlan {
    let user_timeout = user
        .get_wire("timeout")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis);

    let mut params = Params::new();
    params.set("message", "chan.attach");

    if target.starts_with("wave/record") {
        params.set("id", peer_id);
        params.set("consumer", target);
        params.set("source", "wave/play/-");
        params.set("notify", notify_id);
        params.merge(&user);
        params.set_default("maxlen", DEFAULT_RECORD_MAXLEN_MS.to_string());
        AttachPlan {
            params,
            wait: AttachWait::Notify,
            timeout: user_timeout,
        }
    } else if target.starts_with("tone/dtmf") {
        // Tone override happens on the primary leg, not the peer, and no
        // chan.notify ever comes back.
        params.set("id", channel_id);
        params.set("override", target);
        params.merge(&user);
        let tone_ms = match target.strip_prefix("tone/dtmfstr/") {
            Some(digits) => DTMF_MS_PER_DIGIT * digits.chars().count().max(1) as u64,
            None => DTMF_MS_PER_DIGIT,
        };
        let wait = user_timeout.unwrap_or(Duration::from_millis(tone_ms));
        AttachPlan {
            params,
            wait: AttachWait::Timer(wait),
            timeout: user_timeout,
        }
    } else {
        params.set("id", peer_id);
        params.set("source", target);
        params.set("consumer", "wave/record/-");
        params.set("notify", notify_id);
        params.merge(&user);
        AttachPlan {
            params,
            wait: AttachWait::Notify,
            timeout: user_timeout,
        }
    }
}

/// Synthetic end-of-media notification used when no real one arrives.
fn eof_notification(target_id: Option<&str>) -> Message {
    let mut params = Params::new();
    params.set("reason", "eof");
    if let Some(target_id) = target_id {
        params.set("targetid", target_id);
    }
    Message::from_parts(
        MessageKind::Notification,
        "",
        0,
        "chan.notify",
        "",
        params,
    )
}

fn schedule_exit() {
    info!("channel mode leg finished, exiting");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
        std::process::exit(0);
    });
}
