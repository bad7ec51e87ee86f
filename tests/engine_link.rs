//! Integration tests against a fake engine on a loopback socket.
//!
//! The fake engine speaks just enough of the external module protocol to
//! exercise the install/acknowledge flow, dispatch timeouts, reconnect
//! replay, and the channel state machine.

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use yate_extmodule_tokio::codec::parse_line;
use yate_extmodule_tokio::{
    CallChannel, Endpoint, HandlerOutcome, Message, MessageKind, Params, YateClient,
    YateConnectOptions, YateError,
};

struct FakeEngine {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeEngine {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().await.expect("accept failed");
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .expect("read failed")
            .expect("engine saw EOF")
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("write failed");
        self.writer.write_all(b"\n").await.expect("write failed");
        self.writer.flush().await.expect("flush failed");
    }
}

fn test_options(port: u16) -> YateConnectOptions {
    YateConnectOptions {
        endpoint: Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        reconnect_timeout: Duration::from_millis(100),
        install_sigint: false,
        ..Default::default()
    }
}

/// Connect a client to a fresh fake engine and consume the connect line.
async fn connect_pair(options_for: impl Fn(u16) -> YateConnectOptions) -> (YateClient, FakeEngine, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("local addr").port();

    let (client, mut engine) = tokio::join!(
        YateClient::connect_with_options(options_for(port)),
        FakeEngine::accept(&listener),
    );
    let client = client.expect("connect failed");

    assert_eq!(engine.recv().await, "%%>connect:global:next-yate:data");
    (client, engine, listener)
}

async fn wait_disconnected(client: &YateClient) {
    for _ in 0..200 {
        if !client.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never noticed the disconnect");
}

/// Install a handler while the engine confirms the subscription.
async fn install_confirmed(
    client: &YateClient,
    engine: &mut FakeEngine,
    name: &str,
    handler: impl yate_extmodule_tokio::MessageHandler + 'static,
) {
    let (installed, ()) = tokio::join!(client.install(name, handler), async {
        let line = engine.recv().await;
        assert_eq!(line, format!("%%>install:100:{}", name));
        engine.send(&format!("%%<install:100:{}:true", name)).await;
    });
    assert!(installed.expect("install failed"));
}

#[tokio::test]
async fn install_handle_acknowledge_flow() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    install_confirmed(&client, &mut engine, "call.route", |_msg: Message| async {
        HandlerOutcome::Handled(true)
    })
    .await;

    engine
        .send("%%>message:42:123:call.route:x:called=9999")
        .await;
    assert_eq!(engine.recv().await, "%%<message:42:true::x:called=9999");
}

#[tokio::test]
async fn unmatched_incoming_acknowledged_unhandled() {
    let (_client, mut engine, _listener) = connect_pair(test_options).await;

    engine.send("%%>message:7:123:engine.status:").await;
    assert_eq!(engine.recv().await, "%%<message:7:false::");
}

#[tokio::test]
async fn handler_mutation_rewrites_acknowledgement() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    install_confirmed(&client, &mut engine, "call.route", |msg: Message| async move {
        let mut routed = msg;
        routed.set_return_value("sip/1000");
        routed.params_mut().set("osip_X-Routed", "yes");
        HandlerOutcome::Mutated {
            message: routed,
            handled: true,
        }
    })
    .await;

    engine
        .send("%%>message:43:123:call.route:tone/busy:called=1000")
        .await;
    assert_eq!(
        engine.recv().await,
        "%%<message:43:true::sip/1000:called=1000:osip_X-Routed=yes"
    );
}

#[tokio::test]
async fn dispatch_resolves_with_answer() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    let msg = Message::new("call.route").with_param("called", "9999");
    let (answer, ()) = tokio::join!(client.dispatch(msg), async {
        let line = engine.recv().await;
        let sent = parse_line(&line);
        assert_eq!(sent.kind(), MessageKind::Incoming);
        assert_eq!(sent.name(), "call.route");
        engine
            .send(&format!("%%<message:{}:true:call.route:sip/42:", sent.id()))
            .await;
    });

    let answer = answer.expect("dispatch failed");
    assert_eq!(answer.kind(), MessageKind::Answer);
    assert_eq!(answer.success(), Some(true));
    assert_eq!(answer.return_value(), "sip/42");
}

#[tokio::test]
async fn dispatch_times_out_with_original_message() {
    let (client, mut engine, _listener) = connect_pair(|port| YateConnectOptions {
        dispatch_timeout: Duration::from_millis(200),
        ..test_options(port)
    })
    .await;

    let msg = Message::new("call.route").with_param("called", "9999");
    let id = msg.id().to_string();

    let result = client.dispatch(msg).await.expect("dispatch failed");
    assert_eq!(result.id(), id);
    assert_eq!(result.kind(), MessageKind::Outgoing);
    assert_eq!(result.success(), Some(false));
    assert_eq!(result.param_str("called"), Some("9999"));

    // A late answer must be discarded quietly.
    let wire = engine.recv().await;
    assert!(wire.starts_with("%%>message:"));
    engine
        .send(&format!("%%<message:{}:true:call.route:sip/late:", id))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn setlocal_query_returns_engine_value() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    let (value, ()) = tokio::join!(client.setlocal("engine.version", None), async {
        assert_eq!(engine.recv().await, "%%>setlocal:engine.version:");
        engine.send("%%<setlocal:engine.version:6.4.0:true").await;
    });
    assert_eq!(value.expect("setlocal failed"), Some("6.4.0".to_string()));
}

#[tokio::test]
async fn reconnect_replays_registry_in_order() {
    let (client, mut engine, listener) = connect_pair(test_options).await;

    let (set, ()) = tokio::join!(client.setlocal("bufsize", Some("4096")), async {
        assert_eq!(engine.recv().await, "%%>setlocal:bufsize:4096");
        engine.send("%%<setlocal:bufsize:4096:true").await;
    });
    assert_eq!(set.expect("setlocal failed"), Some("4096".to_string()));

    install_confirmed(&client, &mut engine, "engine.timer", |_msg: Message| async {
        HandlerOutcome::Ignored
    })
    .await;

    drop(engine);
    wait_disconnected(&client).await;

    let mut engine = FakeEngine::accept(&listener).await;
    assert_eq!(engine.recv().await, "%%>connect:global:next-yate:data");
    assert_eq!(engine.recv().await, "%%>setlocal:bufsize:4096");
    assert_eq!(engine.recv().await, "%%>install:100:engine.timer");
}

#[tokio::test]
async fn lines_parked_while_disconnected_flush_in_order() {
    let (client, engine, listener) = connect_pair(test_options).await;

    drop(engine);
    wait_disconnected(&client).await;

    client
        .enqueue(Message::new("test.first").with_param("n", "1"))
        .expect("enqueue failed");
    client
        .enqueue(Message::new("test.second").with_param("n", "2"))
        .expect("enqueue failed");

    let mut engine = FakeEngine::accept(&listener).await;
    assert_eq!(engine.recv().await, "%%>connect:global:next-yate:data");
    assert_eq!(parse_line(&engine.recv().await).name(), "test.first");
    assert_eq!(parse_line(&engine.recv().await).name(), "test.second");
}

#[tokio::test]
async fn offline_queue_overflow_is_an_error() {
    let (client, engine, listener) = connect_pair(|port| YateConnectOptions {
        offline_queue_limit: 2,
        ..test_options(port)
    })
    .await;

    drop(engine);
    drop(listener);
    wait_disconnected(&client).await;

    client
        .enqueue(Message::new("test.one"))
        .expect("first enqueue fits");
    client
        .enqueue(Message::new("test.two"))
        .expect("second enqueue fits");
    match client.enqueue(Message::new("test.three")) {
        Err(YateError::QueueFull) => {}
        other => panic!("expected QueueFull, got {:?}", other),
    }
}

#[tokio::test]
async fn watcher_receives_notifications() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let watcher = move |msg: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg).await;
        }
    };
    let (watched, ()) = tokio::join!(client.watch("engine.timer", watcher), async {
        assert_eq!(engine.recv().await, "%%>watch:engine.timer");
        engine.send("%%<watch:engine.timer:true").await;
    });
    assert!(watched.expect("watch failed"));

    engine
        .send("%%<message::false:engine.timer::time=1700000000")
        .await;
    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watcher never fired")
        .expect("watcher channel closed");
    assert_eq!(seen.kind(), MessageKind::Notification);
    assert_eq!(seen.param_str("time"), Some("1700000000"));
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_link() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    engine.send("Error in message: simulated breakage").await;
    engine.send("%%<message:unknown-id:true::").await;
    engine.send("%%>message:bad:not-a-time:x::").await;

    // Link still serves traffic afterwards.
    engine.send("%%>message:8:123:engine.status:").await;
    assert_eq!(engine.recv().await, "%%<message:8:false::");
    assert!(client.is_connected());
}

/// Drive a handler-captured call.route into a ready channel.
async fn ready_channel(client: &YateClient, engine: &mut FakeEngine) -> CallChannel {
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let capture = move |msg: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg).await;
            HandlerOutcome::Handled(true)
        }
    };
    install_confirmed(client, engine, "call.route", capture).await;

    engine
        .send("%%>message:77:123:call.route:ok:id=sip/leg1:called=9999")
        .await;
    assert!(engine.recv().await.starts_with("%%<message:77:true"));

    let seed = rx.recv().await.expect("no captured call.route");
    let channel = CallChannel::from_message(client.clone(), &seed).expect("bad seed");
    assert_eq!(channel.id(), "sip/leg1");

    let (init, ()) = tokio::join!(channel.init(), async {
        assert_eq!(engine.recv().await, "%%>watch:chan.notify");
        engine.send("%%<watch:chan.notify:true").await;
        assert_eq!(engine.recv().await, "%%>watch:chan.hangup");
        engine.send("%%<watch:chan.hangup:true").await;
        assert_eq!(engine.recv().await, "%%>watch:call.execute");
        engine.send("%%<watch:call.execute:true").await;
        engine
            .send("%%<message::false:call.execute::id=sip/leg1:targetid=peer/1")
            .await;
        assert_eq!(engine.recv().await, "%%>unwatch:call.execute");
        engine.send("%%<unwatch:call.execute:true").await;
    });
    init.expect("init failed");
    assert!(channel.is_ready());
    assert_eq!(channel.peer_id(), "peer/1");
    channel
}

#[tokio::test]
async fn channel_call_to_resolves_on_notification() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;
    let channel = ready_channel(&client, &mut engine).await;

    let (result, ()) = tokio::join!(channel.call_to("wave/play/x.au", Params::new()), async {
        let line = engine.recv().await;
        let masq = parse_line(&line);
        assert_eq!(masq.name(), "chan.masquerade");
        assert_eq!(masq.param_str("message"), Some("chan.attach"));
        assert_eq!(masq.param_str("id"), Some("peer/1"));
        assert_eq!(masq.param_str("source"), Some("wave/play/x.au"));
        assert_eq!(masq.param_str("consumer"), Some("wave/record/-"));
        let notify = masq.param_str("notify").expect("no notify target").to_string();
        assert!(notify.starts_with("next-yate-notify/"));

        engine
            .send(&format!("%%<message:{}:true:chan.masquerade::", masq.id()))
            .await;
        engine
            .send(&format!(
                "%%<message::false:chan.notify::targetid={}:reason=done",
                notify
            ))
            .await;
    });

    let notification = result.expect("call_to failed");
    assert_eq!(notification.kind(), MessageKind::Notification);
    assert_eq!(notification.param_str("reason"), Some("done"));
}

#[tokio::test]
async fn channel_reset_cancels_pending_call_to() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;
    let channel = ready_channel(&client, &mut engine).await;

    let pending = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.call_to("wave/play/x.au", Params::new()).await })
    };

    let line = engine.recv().await;
    let masq = parse_line(&line);
    engine
        .send(&format!("%%<message:{}:true:chan.masquerade::", masq.id()))
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.reset();

    match pending.await.expect("task panicked") {
        Err(YateError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn channel_hangup_dispatches_call_drop() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;
    let channel = ready_channel(&client, &mut engine).await;

    let (result, ()) = tokio::join!(channel.hangup("busy"), async {
        let line = engine.recv().await;
        let drop_msg = parse_line(&line);
        assert_eq!(drop_msg.name(), "call.drop");
        assert_eq!(drop_msg.param_str("id"), Some("sip/leg1"));
        assert_eq!(drop_msg.param_str("reason"), Some("busy"));
        engine
            .send(&format!("%%<message:{}:true:call.drop::", drop_msg.id()))
            .await;
    });
    result.expect("hangup failed");
    assert_eq!(
        channel.status(),
        yate_extmodule_tokio::ChannelStatus::Dropped
    );
}

#[tokio::test]
async fn channel_answered_updates_status() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;
    let channel = ready_channel(&client, &mut engine).await;

    let (result, ()) = tokio::join!(channel.answered(Params::new()), async {
        let line = engine.recv().await;
        let masq = parse_line(&line);
        assert_eq!(masq.name(), "chan.masquerade");
        assert_eq!(masq.param_str("message"), Some("call.answered"));
        assert_eq!(masq.param_str("id"), Some("sip/leg1"));
        engine
            .send(&format!("%%<message:{}:true:chan.masquerade::", masq.id()))
            .await;
    });
    result.expect("answered failed");
    assert_eq!(
        channel.status(),
        yate_extmodule_tokio::ChannelStatus::Answered
    );
}

#[tokio::test]
async fn get_environment_reads_engine_parameters() {
    let (client, mut engine, _listener) = connect_pair(test_options).await;

    let (env, ()) = tokio::join!(client.get_environment(), async {
        for _ in 0..14 {
            let line = engine.recv().await;
            let name = line
                .strip_prefix("%%>setlocal:")
                .and_then(|rest| rest.strip_suffix(':'))
                .expect("unexpected setlocal line")
                .to_string();
            engine
                .send(&format!("%%<setlocal:{}:val-{}:true", name, name))
                .await;
        }
    });

    let env = env.expect("get_environment failed");
    assert_eq!(env.version.as_deref(), Some("val-engine.version"));
    assert_eq!(env.nodename.as_deref(), Some("val-engine.nodename"));
    assert_eq!(env.maxworkers.as_deref(), Some("val-engine.maxworkers"));
}
