//! Outbound command construction and wire serialization.

use crate::codec::{escape, param_token};
use crate::constants::{
    VERB_CONNECT, VERB_INSTALL, VERB_MESSAGE, VERB_MESSAGE_ACK, VERB_OUTPUT, VERB_SETLOCAL,
    VERB_UNINSTALL, VERB_UNWATCH, VERB_WATCH,
};
use crate::message::Message;
use crate::params::Params;
use std::fmt;

/// Connection role announced to the engine in network mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Role {
    /// General-purpose module connection.
    #[default]
    Global,
    /// Connection owning a single call leg.
    Channel,
    /// Media playback attachment.
    Play,
    /// Media recording attachment.
    Record,
    /// Combined playback and recording attachment.
    Playrec,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Global => "global",
            Role::Channel => "channel",
            Role::Play => "play",
            Role::Record => "record",
            Role::Playrec => "playrec",
        };
        f.write_str(name)
    }
}

/// One outbound protocol command.
///
/// `to_wire_format()` produces the escaped line without its trailing
/// newline; the transport writer appends it.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    /// `%%>connect:<role>[:<id>[:<type>]]`
    Connect {
        role: Role,
        id: Option<String>,
        conn_type: Option<String>,
    },
    /// `%%>output:<unescaped text>` — the only unescaped payload.
    Output { text: String },
    /// `%%>setlocal:<name>:<value>`
    SetLocal { name: String, value: String },
    /// `%%>install:<priority>:<name>[:<filter>:<fvalue>]`
    Install {
        priority: u32,
        name: String,
        filter: Option<(String, String)>,
    },
    /// `%%>uninstall:<name>`
    Uninstall { name: String },
    /// `%%>watch:<name>`
    Watch { name: String },
    /// `%%>unwatch:<name>`
    Unwatch { name: String },
    /// `%%>message:<id>:<time>:<name>:<retvalue>[:<k>=<v>...]`
    Message {
        message: Message,
        emit_empty: bool,
    },
    /// `%%<message:<id>:<handled>::<retvalue>[:<k>=<v>...]`
    Acknowledge {
        id: String,
        handled: bool,
        return_value: String,
        params: Params,
        emit_empty: bool,
    },
}

impl Command {
    pub(crate) fn to_wire_format(&self) -> String {
        match self {
            Command::Connect {
                role,
                id,
                conn_type,
            } => {
                let mut line = format!("{}:{}", VERB_CONNECT, role);
                if let Some(id) = id {
                    line.push(':');
                    line.push_str(&escape(id, None));
                    if let Some(t) = conn_type {
                        line.push(':');
                        line.push_str(&escape(t, None));
                    }
                }
                line
            }
            Command::Output { text } => format!("{}:{}", VERB_OUTPUT, text),
            Command::SetLocal { name, value } => format!(
                "{}:{}:{}",
                VERB_SETLOCAL,
                escape(name, None),
                escape(value, None)
            ),
            Command::Install {
                priority,
                name,
                filter,
            } => {
                let mut line = format!("{}:{}:{}", VERB_INSTALL, priority, escape(name, None));
                if let Some((param, value)) = filter {
                    line.push(':');
                    line.push_str(&escape(param, None));
                    line.push(':');
                    line.push_str(&escape(value, None));
                }
                line
            }
            Command::Uninstall { name } => format!("{}:{}", VERB_UNINSTALL, escape(name, None)),
            Command::Watch { name } => format!("{}:{}", VERB_WATCH, escape(name, None)),
            Command::Unwatch { name } => format!("{}:{}", VERB_UNWATCH, escape(name, None)),
            Command::Message {
                message,
                emit_empty,
            } => {
                let mut line = format!(
                    "{}:{}:{}:{}:{}",
                    VERB_MESSAGE,
                    escape(message.id(), None),
                    message.time(),
                    escape(message.name(), None),
                    escape(message.return_value(), None),
                );
                push_params(&mut line, message.params(), *emit_empty);
                line
            }
            Command::Acknowledge {
                id,
                handled,
                return_value,
                params,
                emit_empty,
            } => {
                let mut line = format!(
                    "{}:{}:{}::{}",
                    VERB_MESSAGE_ACK,
                    escape(id, None),
                    handled,
                    escape(return_value, None),
                );
                push_params(&mut line, params, *emit_empty);
                line
            }
        }
    }
}

fn push_params(line: &mut String, params: &Params, emit_empty: bool) {
    for (key, value) in params.flatten(emit_empty) {
        line.push(':');
        line.push_str(&param_token(&key, &value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_line;
    use crate::message::MessageKind;

    #[test]
    fn test_connect_line() {
        let cmd = Command::Connect {
            role: Role::Global,
            id: Some("next-yate".to_string()),
            conn_type: Some("data".to_string()),
        };
        assert_eq!(cmd.to_wire_format(), "%%>connect:global:next-yate:data");

        let bare = Command::Connect {
            role: Role::Playrec,
            id: None,
            conn_type: None,
        };
        assert_eq!(bare.to_wire_format(), "%%>connect:playrec");
    }

    #[test]
    fn test_output_is_not_escaped() {
        let cmd = Command::Output {
            text: "route failed: no target".to_string(),
        };
        assert_eq!(cmd.to_wire_format(), "%%>output:route failed: no target");
    }

    #[test]
    fn test_setlocal_escapes_value() {
        let cmd = Command::SetLocal {
            name: "trackparam".to_string(),
            value: "a:b".to_string(),
        };
        assert_eq!(cmd.to_wire_format(), "%%>setlocal:trackparam:a%zb");
    }

    #[test]
    fn test_install_with_filter() {
        let cmd = Command::Install {
            priority: 50,
            name: "chan.notify".to_string(),
            filter: Some(("targetid".to_string(), "^wave/.*$".to_string())),
        };
        assert_eq!(
            cmd.to_wire_format(),
            "%%>install:50:chan.notify:targetid:^wave/.*$"
        );
    }

    #[test]
    fn test_message_serialization_round_trips() {
        let msg = Message::new("call.route")
            .with_param("called", "9999")
            .with_param("ringback", true)
            .with_return_value("tone/ring");
        let id = msg.id().to_string();
        let time = msg.time();

        let line = Command::Message {
            message: msg,
            emit_empty: false,
        }
        .to_wire_format();

        // The engine would see this as an incoming message.
        let parsed = parse_line(&line);
        assert_eq!(parsed.kind(), MessageKind::Incoming);
        assert_eq!(parsed.id(), id);
        assert_eq!(parsed.time(), time);
        assert_eq!(parsed.name(), "call.route");
        assert_eq!(parsed.return_value(), "tone/ring");
        assert_eq!(parsed.param_str("called"), Some("9999"));
        assert_eq!(parsed.params().get_bool("ringback"), Some(true));
    }

    #[test]
    fn test_message_skips_internal_and_empty_params() {
        let msg = Message::new("call.route")
            .with_param("_connection", "internal")
            .with_param("caller", "")
            .with_param("called", "9999");

        let line = Command::Message {
            message: msg,
            emit_empty: false,
        }
        .to_wire_format();
        assert!(line.ends_with(":called=9999"));
        assert!(!line.contains("_connection"));
        assert!(!line.contains("caller"));
    }

    #[test]
    fn test_acknowledge_line() {
        let mut params = Params::new();
        params.set("called", "9999");
        params.set("_hidden", "x");

        let cmd = Command::Acknowledge {
            id: "42".to_string(),
            handled: true,
            return_value: "x".to_string(),
            params,
            emit_empty: false,
        };
        assert_eq!(cmd.to_wire_format(), "%%<message:42:true::x:called=9999");
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Global.to_string(), "global");
        assert_eq!(Role::Channel.to_string(), "channel");
        assert_eq!(Role::Playrec.to_string(), "playrec");
    }
}
