//! Inbound record correlation and acknowledgement bookkeeping.
//!
//! The link task parses each inbound line and consults the router: answers
//! and request replies complete single-shot waiters keyed by id or name;
//! incoming messages claim an acknowledgement slot that is released exactly
//! once, by whichever of the handler join, the acknowledgement deadline, or
//! an explicit [`acknowledge`](crate::YateClient::acknowledge) gets there
//! first.

use crate::handler::HandlerOutcome;
use crate::message::Message;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Correlation key of a pending request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WaitKey {
    /// Answer to a dispatched message, keyed by message id.
    Answer(String),
    /// Install reply, keyed by message name.
    Install(String),
    /// Uninstall reply, keyed by message name.
    Uninstall(String),
    /// Watch reply, keyed by message name.
    Watch(String),
    /// Unwatch reply, keyed by message name.
    Unwatch(String),
    /// Setlocal reply, keyed by parameter name.
    Setlocal(String),
}

#[derive(Default)]
pub(crate) struct Router {
    waiters: Mutex<HashMap<WaitKey, oneshot::Sender<Message>>>,
    pending_acks: Mutex<HashSet<String>>,
}

impl Router {
    /// Register a single-shot waiter. A later registration for the same
    /// key replaces the earlier one, whose receiver then resolves with a
    /// closed-channel error and falls back to its sentinel.
    pub fn register(&self, key: WaitKey) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("router lock poisoned")
            .insert(key, tx);
        rx
    }

    /// Drop a waiter whose deadline elapsed.
    pub fn unregister(&self, key: &WaitKey) {
        self.waiters
            .lock()
            .expect("router lock poisoned")
            .remove(key);
    }

    /// Deliver a record to its waiter. Returns `false` when nobody waits
    /// for this key (the record is discarded).
    pub fn complete(&self, key: &WaitKey, message: Message) -> bool {
        let waiter = self
            .waiters
            .lock()
            .expect("router lock poisoned")
            .remove(key);
        match waiter {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Claim the acknowledgement slot for an incoming message id.
    pub fn begin_ack(&self, id: &str) {
        self.pending_acks
            .lock()
            .expect("router lock poisoned")
            .insert(id.to_string());
    }

    /// Take the acknowledgement slot; only the first taker may emit the
    /// `%%<message` line.
    pub fn take_ack(&self, id: &str) -> bool {
        self.pending_acks
            .lock()
            .expect("router lock poisoned")
            .remove(id)
    }

    /// Drop every waiter; their operations resolve with their sentinels.
    pub fn abort_all(&self) {
        self.waiters
            .lock()
            .expect("router lock poisoned")
            .clear();
    }
}

/// Fold the outcomes of all handlers for one incoming message into the
/// effective handled flag and the message to acknowledge.
///
/// `handled` is the logical OR across outcomes; the last mutation wins for
/// parameters and return value.
pub(crate) fn fold_outcomes(original: &Message, outcomes: Vec<HandlerOutcome>) -> (bool, Message) {
    let mut handled = false;
    let mut result = original.clone();
    for outcome in outcomes {
        match outcome {
            HandlerOutcome::Handled(flag) => handled |= flag,
            HandlerOutcome::Mutated { message, handled: flag } => {
                handled |= flag;
                *result.params_mut() = message.params().clone();
                result.set_return_value(message.return_value());
            }
            HandlerOutcome::Ignored => {}
        }
    }
    (handled, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_message;

    #[test]
    fn test_complete_delivers_to_waiter() {
        let router = Router::default();
        let mut rx = router.register(WaitKey::Answer("1.2".to_string()));

        let delivered = router.complete(
            &WaitKey::Answer("1.2".to_string()),
            test_message("call.route", &[]),
        );
        assert!(delivered);
        assert_eq!(rx.try_recv().unwrap().name(), "call.route");
    }

    #[test]
    fn test_complete_without_waiter_discards() {
        let router = Router::default();
        assert!(!router.complete(
            &WaitKey::Answer("nobody".to_string()),
            test_message("call.route", &[]),
        ));
    }

    #[test]
    fn test_latest_registration_wins() {
        let router = Router::default();
        let mut first = router.register(WaitKey::Install("call.route".to_string()));
        let mut second = router.register(WaitKey::Install("call.route".to_string()));

        router.complete(
            &WaitKey::Install("call.route".to_string()),
            test_message("call.route", &[]),
        );
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_ok());
    }

    #[test]
    fn test_unregister_removes_waiter() {
        let router = Router::default();
        let key = WaitKey::Setlocal("bufsize".to_string());
        let _rx = router.register(key.clone());
        router.unregister(&key);
        assert!(!router.complete(&key, test_message("", &[])));
    }

    #[test]
    fn test_ack_slot_is_first_wins() {
        let router = Router::default();
        router.begin_ack("42");
        assert!(router.take_ack("42"));
        assert!(!router.take_ack("42"));
        assert!(!router.take_ack("unknown"));
    }

    #[test]
    fn test_fold_or_of_handled() {
        let original = test_message("call.route", &[("called", "9999")]);
        let (handled, msg) = fold_outcomes(
            &original,
            vec![
                HandlerOutcome::Ignored,
                HandlerOutcome::Handled(false),
                HandlerOutcome::Handled(true),
            ],
        );
        assert!(handled);
        assert_eq!(msg.param_str("called"), Some("9999"));
    }

    #[test]
    fn test_fold_mutation_replaces_params() {
        let original = test_message("call.route", &[("called", "9999")]);
        let rewritten = test_message("call.route", &[("called", "9999"), ("route", "sip/42")])
            .with_return_value("sip/42");

        let (handled, msg) = fold_outcomes(
            &original,
            vec![HandlerOutcome::Mutated {
                message: rewritten,
                handled: true,
            }],
        );
        assert!(handled);
        assert_eq!(msg.return_value(), "sip/42");
        assert_eq!(msg.param_str("route"), Some("sip/42"));
    }

    #[test]
    fn test_fold_empty_is_unhandled_original() {
        let original = test_message("call.route", &[]);
        let (handled, msg) = fold_outcomes(&original, Vec::new());
        assert!(!handled);
        assert_eq!(&msg, &original);
    }
}
