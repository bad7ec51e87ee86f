//! Handler, watcher, and setlocal tables.
//!
//! The registry is the authoritative record of what the engine should know
//! about this client. After every reconnect it is replayed — setlocals,
//! then installs, then watches — before any parked operation resumes.

use crate::command::Command;
use crate::handler::{MessageHandler, NotificationWatcher};
use crate::message::Message;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A parameter filter restricting a handler or watcher.
///
/// The filter selects messages that carry a parameter named `param` whose
/// wire value matches the regular expression `pattern`.
#[derive(Clone)]
pub struct MessageFilter {
    param: String,
    pattern: String,
    regex: Regex,
}

impl MessageFilter {
    /// Compile a filter from a regular expression pattern.
    pub fn new(param: impl Into<String>, pattern: impl Into<String>) -> Result<Self, regex::Error> {
        let pattern = pattern.into();
        let regex = Regex::new(&pattern)?;
        Ok(Self {
            param: param.into(),
            pattern,
            regex,
        })
    }

    /// Filter that matches exactly one literal value.
    pub fn exact(param: impl Into<String>, value: &str) -> Self {
        let pattern = format!("^{}$", regex::escape(value));
        let regex = Regex::new(&pattern).expect("escaped literal is a valid regex");
        Self {
            param: param.into(),
            pattern,
            regex,
        }
    }

    /// The parameter name this filter inspects.
    pub fn param(&self) -> &str {
        &self.param
    }

    /// The source pattern, part of the registry key.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// `true` if the message has the named parameter and its wire value
    /// matches the pattern.
    pub fn matches(&self, message: &Message) -> bool {
        match message.params().get_wire(&self.param) {
            Some(value) => self.regex.is_match(&value),
            None => false,
        }
    }

    fn key(&self) -> (&str, &str) {
        (&self.param, &self.pattern)
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFilter")
            .field("param", &self.param)
            .field("pattern", &self.pattern)
            .finish()
    }
}

fn filter_key(filter: Option<&MessageFilter>) -> Option<(&str, &str)> {
    filter.map(MessageFilter::key)
}

pub(crate) struct HandlerEntry {
    pub name: String,
    pub priority: u32,
    pub filter: Option<MessageFilter>,
    pub handler: Arc<dyn MessageHandler>,
}

pub(crate) struct WatchEntry {
    pub name: String,
    pub filter: Option<MessageFilter>,
    pub watcher: Arc<dyn NotificationWatcher>,
}

pub(crate) struct SetlocalEntry {
    pub name: String,
    pub value: String,
}

/// Engine-side traffic required after a handler upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallAction {
    /// The name is already advertised at this priority.
    AlreadyInstalled,
    /// The name is new; a single install round-trip is needed.
    Install,
    /// The priority changed; uninstall then install.
    Reinstall,
}

/// Engine-side traffic required after a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemoveOutcome {
    pub removed: usize,
    /// No entries remain for the name; the engine subscription can go.
    pub name_empty: bool,
}

#[derive(Default)]
pub(crate) struct Registry {
    handlers: Vec<HandlerEntry>,
    watchers: Vec<WatchEntry>,
    setlocals: Vec<SetlocalEntry>,
}

impl Registry {
    /// Insert or replace the handler keyed by (name, filter).
    ///
    /// A priority differing from the name's current one updates every
    /// entry of that name (priority is per-name on the engine side).
    pub fn upsert_handler(
        &mut self,
        name: &str,
        priority: u32,
        filter: Option<MessageFilter>,
        handler: Arc<dyn MessageHandler>,
    ) -> InstallAction {
        let old_priority = self.handler_priority(name);

        match self.handlers.iter_mut().find(|e| {
            e.name == name && filter_key(e.filter.as_ref()) == filter_key(filter.as_ref())
        }) {
            Some(entry) => {
                entry.handler = handler;
                entry.priority = priority;
            }
            None => self.handlers.push(HandlerEntry {
                name: name.to_string(),
                priority,
                filter,
                handler,
            }),
        }

        match old_priority {
            None => InstallAction::Install,
            Some(p) if p == priority => InstallAction::AlreadyInstalled,
            Some(_) => {
                for entry in self.handlers.iter_mut().filter(|e| e.name == name) {
                    entry.priority = priority;
                }
                InstallAction::Reinstall
            }
        }
    }

    /// Remove handlers for `name`; with a filter key, only the matching
    /// entry, otherwise every entry of that name.
    pub fn remove_handlers(
        &mut self,
        name: &str,
        filter: Option<(&str, &str)>,
    ) -> RemoveOutcome {
        let before = self.handlers.len();
        self.handlers.retain(|e| {
            e.name != name || (filter.is_some() && filter_key(e.filter.as_ref()) != filter)
        });
        RemoveOutcome {
            removed: before - self.handlers.len(),
            name_empty: !self.handlers.iter().any(|e| e.name == name),
        }
    }

    /// Drop the single handler entry matching this exact key; used when
    /// the engine refuses an optimistically added install.
    pub fn rollback_handler(&mut self, name: &str, filter: Option<(&str, &str)>) {
        self.handlers
            .retain(|e| e.name != name || filter_key(e.filter.as_ref()) != filter);
    }

    /// Drop the single watcher entry matching this exact key.
    pub fn rollback_watcher(&mut self, name: &str, filter: Option<(&str, &str)>) {
        self.watchers
            .retain(|e| e.name != name || filter_key(e.filter.as_ref()) != filter);
    }

    /// Current per-name priority, if any handler is installed for `name`.
    pub fn handler_priority(&self, name: &str) -> Option<u32> {
        self.handlers
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.priority)
    }

    /// Insert or replace the watcher keyed by (name, filter). Returns
    /// `true` when the name was not watched before (engine watch needed).
    pub fn upsert_watcher(
        &mut self,
        name: &str,
        filter: Option<MessageFilter>,
        watcher: Arc<dyn NotificationWatcher>,
    ) -> bool {
        let first_for_name = !self.watchers.iter().any(|e| e.name == name);

        match self.watchers.iter_mut().find(|e| {
            e.name == name && filter_key(e.filter.as_ref()) == filter_key(filter.as_ref())
        }) {
            Some(entry) => entry.watcher = watcher,
            None => self.watchers.push(WatchEntry {
                name: name.to_string(),
                filter,
                watcher,
            }),
        }

        first_for_name
    }

    /// Remove watchers for `name`, optionally restricted to a filter key.
    pub fn remove_watchers(
        &mut self,
        name: &str,
        filter: Option<(&str, &str)>,
    ) -> RemoveOutcome {
        let before = self.watchers.len();
        self.watchers.retain(|e| {
            e.name != name || (filter.is_some() && filter_key(e.filter.as_ref()) != filter)
        });
        RemoveOutcome {
            removed: before - self.watchers.len(),
            name_empty: !self.watchers.iter().any(|e| e.name == name),
        }
    }

    /// Record a setlocal for replay, replacing any previous row.
    pub fn set_setlocal(&mut self, name: &str, value: &str) {
        match self.setlocals.iter_mut().find(|e| e.name == name) {
            Some(entry) => entry.value = value.to_string(),
            None => self.setlocals.push(SetlocalEntry {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Handlers selected for an incoming message, in installation order.
    pub fn matching_handlers(&self, message: &Message) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .iter()
            .filter(|e| e.name == message.name())
            .filter(|e| e.filter.as_ref().map_or(true, |f| f.matches(message)))
            .map(|e| e.handler.clone())
            .collect()
    }

    /// Watchers selected for a notification, in installation order.
    pub fn matching_watchers(&self, message: &Message) -> Vec<Arc<dyn NotificationWatcher>> {
        self.watchers
            .iter()
            .filter(|e| e.name == message.name())
            .filter(|e| e.filter.as_ref().map_or(true, |f| f.matches(message)))
            .map(|e| e.watcher.clone())
            .collect()
    }

    /// Remove every handler and watcher whose filter is exactly
    /// (`param`, `pattern`); used when a call leg hangs up.
    pub fn purge_filtered(&mut self, param: &str, pattern: &str) -> usize {
        let key = Some((param, pattern));
        let before = self.handlers.len() + self.watchers.len();
        self.handlers
            .retain(|e| filter_key(e.filter.as_ref()) != key);
        self.watchers
            .retain(|e| filter_key(e.filter.as_ref()) != key);
        before - self.handlers.len() - self.watchers.len()
    }

    /// Commands re-advertising this registry to a freshly connected
    /// engine: setlocals, then one install per name, then one watch per
    /// name.
    pub fn replay_commands(&self) -> Vec<Command> {
        let mut commands = Vec::new();

        for entry in &self.setlocals {
            commands.push(Command::SetLocal {
                name: entry.name.clone(),
                value: entry.value.clone(),
            });
        }

        let mut installed = BTreeSet::new();
        for entry in &self.handlers {
            if !installed.insert(entry.name.clone()) {
                continue;
            }
            let same_name = self.handlers.iter().filter(|e| e.name == entry.name).count();
            let filter = if same_name == 1 {
                entry
                    .filter
                    .as_ref()
                    .map(|f| (f.param().to_string(), f.pattern().to_string()))
            } else {
                None
            };
            commands.push(Command::Install {
                priority: entry.priority,
                name: entry.name.clone(),
                filter,
            });
        }

        let mut watched = BTreeSet::new();
        for entry in &self.watchers {
            if watched.insert(entry.name.clone()) {
                commands.push(Command::Watch {
                    name: entry.name.clone(),
                });
            }
        }

        commands
    }

}

/// Build a message carrying the given flat parameters; test helper shape
/// shared by the router.
#[cfg(test)]
pub(crate) fn test_message(name: &str, params: &[(&str, &str)]) -> Message {
    let mut msg = Message::new(name);
    *msg.params_mut() = crate::params::Params::from_pairs(params.iter().copied());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerOutcome;

    fn noop_handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_msg: Message| async { HandlerOutcome::Ignored })
    }

    fn noop_watcher() -> Arc<dyn NotificationWatcher> {
        Arc::new(|_msg: Message| async {})
    }

    #[test]
    fn test_upsert_actions() {
        let mut reg = Registry::default();

        let first = reg.upsert_handler("call.route", 100, None, noop_handler());
        assert_eq!(first, InstallAction::Install);

        let filter = MessageFilter::exact("called", "9999");
        let second = reg.upsert_handler("call.route", 100, Some(filter), noop_handler());
        assert_eq!(second, InstallAction::AlreadyInstalled);

        let third = reg.upsert_handler("call.route", 50, None, noop_handler());
        assert_eq!(third, InstallAction::Reinstall);
        assert_eq!(reg.handler_priority("call.route"), Some(50));
    }

    #[test]
    fn test_same_key_replaces_handler() {
        let mut reg = Registry::default();
        reg.upsert_handler("call.route", 100, None, noop_handler());
        reg.upsert_handler("call.route", 100, None, noop_handler());

        let msg = test_message("call.route", &[]);
        assert_eq!(reg.matching_handlers(&msg).len(), 1);
    }

    #[test]
    fn test_filter_selects_by_regex() {
        let mut reg = Registry::default();
        let filter = MessageFilter::new("called", "^99[0-9]{2}$").unwrap();
        reg.upsert_handler("call.route", 100, Some(filter), noop_handler());

        let hit = test_message("call.route", &[("called", "9911")]);
        let miss = test_message("call.route", &[("called", "1234")]);
        let absent = test_message("call.route", &[("caller", "9911")]);

        assert_eq!(reg.matching_handlers(&hit).len(), 1);
        assert!(reg.matching_handlers(&miss).is_empty());
        assert!(reg.matching_handlers(&absent).is_empty());
    }

    #[test]
    fn test_filter_matches_boolean_wire_value() {
        let mut reg = Registry::default();
        let filter = MessageFilter::exact("ringing", "true");
        reg.upsert_watcher("call.update", Some(filter), noop_watcher());

        let mut msg = test_message("call.update", &[]);
        msg.params_mut().set("ringing", true);
        assert_eq!(reg.matching_watchers(&msg).len(), 1);
    }

    #[test]
    fn test_remove_handlers_by_name_and_key() {
        let mut reg = Registry::default();
        let filter = MessageFilter::exact("id", "sip/1");
        reg.upsert_handler("chan.dtmf", 100, None, noop_handler());
        reg.upsert_handler("chan.dtmf", 100, Some(filter.clone()), noop_handler());

        let keyed = reg.remove_handlers("chan.dtmf", Some((filter.param(), filter.pattern())));
        assert_eq!(keyed.removed, 1);
        assert!(!keyed.name_empty);

        let all = reg.remove_handlers("chan.dtmf", None);
        assert_eq!(all.removed, 1);
        assert!(all.name_empty);
    }

    #[test]
    fn test_replay_order_and_dedup() {
        let mut reg = Registry::default();
        reg.set_setlocal("bufsize", "4096");
        reg.set_setlocal("trackparam", "ivr");
        reg.upsert_handler("engine.timer", 100, None, noop_handler());
        reg.upsert_handler(
            "call.route",
            50,
            Some(MessageFilter::exact("called", "1000")),
            noop_handler(),
        );
        reg.upsert_watcher("chan.notify", None, noop_watcher());
        reg.upsert_watcher(
            "chan.notify",
            Some(MessageFilter::exact("id", "x")),
            noop_watcher(),
        );

        let lines: Vec<String> = reg
            .replay_commands()
            .iter()
            .map(|c| c.to_wire_format())
            .collect();
        assert_eq!(
            lines,
            vec![
                "%%>setlocal:bufsize:4096".to_string(),
                "%%>setlocal:trackparam:ivr".to_string(),
                "%%>install:100:engine.timer".to_string(),
                "%%>install:50:call.route:called:^1000$".to_string(),
                "%%>watch:chan.notify".to_string(),
            ]
        );
    }

    #[test]
    fn test_setlocal_replaced_not_duplicated() {
        let mut reg = Registry::default();
        reg.set_setlocal("bufsize", "4096");
        reg.set_setlocal("bufsize", "8192");

        let lines: Vec<String> = reg
            .replay_commands()
            .iter()
            .map(|c| c.to_wire_format())
            .collect();
        assert_eq!(lines, vec!["%%>setlocal:bufsize:8192".to_string()]);
    }

    #[test]
    fn test_purge_filtered() {
        let mut reg = Registry::default();
        let leg = MessageFilter::exact("id", "sip/3");
        reg.upsert_handler("chan.dtmf", 100, Some(leg.clone()), noop_handler());
        reg.upsert_watcher("chan.notify", Some(leg.clone()), noop_watcher());
        reg.upsert_watcher("chan.notify", None, noop_watcher());

        let purged = reg.purge_filtered(leg.param(), leg.pattern());
        assert_eq!(purged, 2);

        let msg = test_message("chan.notify", &[("id", "sip/3")]);
        assert_eq!(reg.matching_watchers(&msg).len(), 1);
    }

    #[test]
    fn test_exact_filter_escapes_regex_metacharacters() {
        let filter = MessageFilter::exact("id", "sip/1+2");
        let hit = test_message("chan.dtmf", &[("id", "sip/1+2")]);
        let miss = test_message("chan.dtmf", &[("id", "sip/112")]);
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }
}
