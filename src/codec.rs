//! Line codec for the external module wire protocol.
//!
//! Frames are newline-delimited; within a frame, colons separate fields and
//! the first field is the verb. Every field except the verb uses the escape
//! scheme below, so a raw colon split is always safe before unescaping.
//!
//! Escape scheme: a byte below 32, a colon, or an optional extra byte is
//! written as `%` followed by the byte plus 64; a literal `%` doubles to
//! `%%`. Decoding subtracts 64 again. Malformed sequences decode leniently
//! to their raw characters so that the codec never panics on engine input.

use crate::constants::{
    REPLY_INSTALL, REPLY_MESSAGE, REPLY_MESSAGE_IN, REPLY_SETLOCAL, REPLY_UNINSTALL, REPLY_UNWATCH,
    REPLY_WATCH,
};
use crate::message::{Message, MessageKind};
use crate::params::Params;

/// Escape one field for the wire.
///
/// `extra` marks one additional byte as unsafe (`=` inside parameter keys).
pub fn escape(input: &str, extra: Option<u8>) -> String {
    let mut out = Vec::with_capacity(input.len());
    for &b in input.as_bytes() {
        if b == b'%' {
            out.push(b'%');
            out.push(b'%');
        } else if b < 32 || b == b':' || Some(b) == extra {
            out.push(b'%');
            out.push(b + 64);
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode one wire field.
///
/// `%%` yields `%`; `%X` yields `X-64`. A trailing `%` or an `X` below 64
/// is left in place unchanged.
pub fn unescape(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' && i + 1 < bytes.len() {
            let next = bytes[i + 1];
            if next == b'%' {
                out.push(b'%');
            } else if next >= 64 {
                out.push(next - 64);
            } else {
                out.push(b);
                out.push(next);
            }
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Serialize one `key=value` parameter token.
///
/// The key escapes `=` as well so the first `=` on the wire is always the
/// separator.
pub(crate) fn param_token(key: &str, value: &str) -> String {
    format!("{}={}", escape(key, Some(b'=')), escape(value, None))
}

/// Parse one inbound line into a tagged record.
///
/// Never fails: an unknown verb, a missing mandatory field, or an invalid
/// numeric field produces a [`MessageKind::Error`] record carrying the full
/// raw line as its return value.
pub fn parse_line(line: &str) -> Message {
    parse_known_line(line).unwrap_or_else(|| error_record(line))
}

fn error_record(line: &str) -> Message {
    Message::from_parts(MessageKind::Error, "", 0, "", line, Params::new())
}

fn parse_known_line(line: &str) -> Option<Message> {
    let mut fields = line.split(':');
    let verb = fields.next()?;
    let fields: Vec<&str> = fields.collect();

    match verb {
        REPLY_MESSAGE_IN => {
            // %%>message:<id>:<time>:<name>:<retvalue>[:<k>=<v>...]
            if fields.len() < 4 {
                return None;
            }
            let time: u64 = unescape(fields[1]).parse().ok()?;
            let params = parse_params(&fields[4..]);
            Some(Message::from_parts(
                MessageKind::Incoming,
                unescape(fields[0]),
                time,
                unescape(fields[2]),
                unescape(fields[3]),
                params,
            ))
        }
        REPLY_MESSAGE => {
            // %%<message:<id>:<processed>:[<name>]:<retvalue>[:<k>=<v>...]
            if fields.len() < 4 {
                return None;
            }
            let id = unescape(fields[0]);
            let processed = unescape(fields[1]) == "true";
            let kind = if id.is_empty() {
                MessageKind::Notification
            } else {
                MessageKind::Answer
            };
            let params = parse_params(&fields[4..]);
            let mut msg = Message::from_parts(
                kind,
                id,
                0,
                unescape(fields[2]),
                unescape(fields[3]),
                params,
            );
            msg.set_success(processed);
            Some(msg)
        }
        REPLY_INSTALL | REPLY_UNINSTALL => {
            // %%<install:<priority>:<name>:<success>
            if fields.len() < 3 {
                return None;
            }
            let priority: u32 = unescape(fields[0]).parse().ok()?;
            let kind = if verb == REPLY_INSTALL {
                MessageKind::Install
            } else {
                MessageKind::Uninstall
            };
            let mut msg = Message::from_parts(
                kind,
                "",
                0,
                unescape(fields[1]),
                "",
                Params::new(),
            );
            msg.set_priority(priority);
            msg.set_success(unescape(fields[2]) == "true");
            Some(msg)
        }
        REPLY_WATCH | REPLY_UNWATCH => {
            // %%<watch:<name>:<success>
            if fields.len() < 2 {
                return None;
            }
            let kind = if verb == REPLY_WATCH {
                MessageKind::Watch
            } else {
                MessageKind::Unwatch
            };
            let mut msg = Message::from_parts(
                kind,
                "",
                0,
                unescape(fields[0]),
                "",
                Params::new(),
            );
            msg.set_success(unescape(fields[1]) == "true");
            Some(msg)
        }
        REPLY_SETLOCAL => {
            // %%<setlocal:<name>:<value>:<success>
            if fields.len() < 3 {
                return None;
            }
            let mut msg = Message::from_parts(
                MessageKind::Setlocal,
                "",
                0,
                unescape(fields[0]),
                unescape(fields[1]),
                Params::new(),
            );
            msg.set_success(unescape(fields[2]) == "true");
            Some(msg)
        }
        _ => None,
    }
}

fn parse_params(tokens: &[&str]) -> Params {
    let mut params = Params::new();
    for token in tokens {
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((key, value)) => params.ingest(&unescape(key), &unescape(value)),
            None => params.ingest(&unescape(token), ""),
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_specials() {
        // ':' is 58 -> 'z', '\n' is 10 -> 'J'
        assert_eq!(escape("a:b%c\nd", None), "a%zb%%c%Jd");
    }

    #[test]
    fn test_escape_extra_byte() {
        assert_eq!(escape("k=v", Some(b'=')), "k%}v");
    }

    #[test]
    fn test_unescape_inverts_escape() {
        for s in [
            "a:b%c\nd",
            "plain",
            "",
            "%",
            "::::",
            "tabs\tand\rreturns",
            "unicode caf\u{e9} \u{2764}",
            "%%%",
        ] {
            assert_eq!(unescape(&escape(s, None)), s);
        }
    }

    #[test]
    fn test_escape_output_is_wire_safe() {
        let escaped = escape("a:b\x01\x1f%", None);
        assert!(!escaped.contains(':'));
        assert!(escaped.bytes().all(|b| b >= 32));
    }

    #[test]
    fn test_unescape_lenient_on_malformed() {
        // Trailing '%' and '%X' with X < 64 stay as-is.
        assert_eq!(unescape("abc%"), "abc%");
        assert_eq!(unescape("a%1b"), "a%1b");
    }

    #[test]
    fn test_parse_incoming() {
        let msg =
            parse_line("%%>message:0x1.abc:1700000000:call.route:tone/ring:called=9999:caller=123");
        assert_eq!(msg.kind(), MessageKind::Incoming);
        assert_eq!(msg.id(), "0x1.abc");
        assert_eq!(msg.time(), 1700000000);
        assert_eq!(msg.name(), "call.route");
        assert_eq!(msg.return_value(), "tone/ring");
        assert_eq!(msg.param_str("called"), Some("9999"));
        assert_eq!(msg.param_str("caller"), Some("123"));
    }

    #[test]
    fn test_parse_incoming_escaped_fields() {
        let msg = parse_line("%%>message:1.2:123:test.echo::text=a%zb%%c");
        assert_eq!(msg.param_str("text"), Some("a:b%c"));
    }

    #[test]
    fn test_parse_answer() {
        let msg = parse_line("%%<message:1.99:true:call.route:sip/1234:called=9999");
        assert_eq!(msg.kind(), MessageKind::Answer);
        assert_eq!(msg.id(), "1.99");
        assert_eq!(msg.success(), Some(true));
        assert_eq!(msg.return_value(), "sip/1234");
    }

    #[test]
    fn test_parse_notification() {
        let msg = parse_line("%%<message::false:chan.notify::targetid=next-yate-notify/7");
        assert_eq!(msg.kind(), MessageKind::Notification);
        assert!(msg.id().is_empty());
        assert_eq!(msg.name(), "chan.notify");
        assert_eq!(msg.param_str("targetid"), Some("next-yate-notify/7"));
    }

    #[test]
    fn test_parse_install_reply() {
        let msg = parse_line("%%<install:100:call.route:true");
        assert_eq!(msg.kind(), MessageKind::Install);
        assert_eq!(msg.name(), "call.route");
        assert_eq!(msg.priority(), Some(100));
        assert_eq!(msg.success(), Some(true));

        let msg = parse_line("%%<uninstall:100:call.route:false");
        assert_eq!(msg.kind(), MessageKind::Uninstall);
        assert_eq!(msg.success(), Some(false));
    }

    #[test]
    fn test_parse_watch_reply() {
        let msg = parse_line("%%<watch:engine.timer:true");
        assert_eq!(msg.kind(), MessageKind::Watch);
        assert_eq!(msg.name(), "engine.timer");
        assert_eq!(msg.success(), Some(true));

        let msg = parse_line("%%<unwatch:engine.timer:true");
        assert_eq!(msg.kind(), MessageKind::Unwatch);
    }

    #[test]
    fn test_parse_setlocal_reply() {
        let msg = parse_line("%%<setlocal:bufsize:8192:true");
        assert_eq!(msg.kind(), MessageKind::Setlocal);
        assert_eq!(msg.name(), "bufsize");
        assert_eq!(msg.return_value(), "8192");
        assert_eq!(msg.success(), Some(true));
    }

    #[test]
    fn test_unknown_verb_is_error_record() {
        let line = "Error in message: something broke";
        let msg = parse_line(line);
        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.return_value(), line);
    }

    #[test]
    fn test_bad_numeric_field_is_error_record() {
        let line = "%%>message:1.2:not-a-time:call.route::";
        let msg = parse_line(line);
        assert_eq!(msg.kind(), MessageKind::Error);
        assert_eq!(msg.return_value(), line);

        let line = "%%<install:first:call.route:true";
        assert_eq!(parse_line(line).kind(), MessageKind::Error);
    }

    #[test]
    fn test_short_line_is_error_record() {
        assert_eq!(parse_line("%%>message:1.2:123").kind(), MessageKind::Error);
        assert_eq!(parse_line("%%<watch:name").kind(), MessageKind::Error);
        assert_eq!(parse_line("").kind(), MessageKind::Error);
    }

    #[test]
    fn test_param_without_equals_ingests_empty() {
        let msg = parse_line("%%>message:1.2:123:test::flag");
        assert_eq!(msg.param_str("flag"), Some(""));
    }

    #[test]
    fn test_param_token_round_trip() {
        let token = param_token("od=d.key", "va:lue");
        let (k, v) = token.split_once('=').unwrap();
        assert_eq!(unescape(k), "od=d.key");
        assert_eq!(unescape(v), "va:lue");
    }

    #[test]
    fn test_parse_dotted_params_nest() {
        let msg = parse_line("%%>message:1.2:123:call.execute::rtp.addr=10.0.0.1:rtp.port=8000");
        assert_eq!(msg.param_str("rtp.addr"), Some("10.0.0.1"));
        assert_eq!(msg.param_str("rtp.port"), Some("8000"));
    }
}
