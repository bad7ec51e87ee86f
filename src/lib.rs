//! YATE external module client for Rust
//!
//! This crate provides an async Rust client for the [YATE] telephony
//! engine's external module interface, allowing applications to install
//! message handlers, watch messages handled elsewhere, dispatch or enqueue
//! their own messages, and drive call legs through a channel abstraction —
//! surviving transient disconnects along the way.
//!
//! [YATE]: https://yate.ro/
//!
//! # Architecture
//!
//! A background link task owns the stdin/stdout pipe or the TCP/UNIX
//! socket: it parses inbound lines, routes them to handlers, watchers, and
//! request waiters, and serializes every outbound line in call order.
//! [`YateClient`] (Clone + Send) is the handle applications use from any
//! task. While the link is down, outbound lines park in a bounded queue
//! and the registry of installs, watches, and setlocals is replayed after
//! every reconnect.
//!
//! # Examples
//!
//! ## Routing calls over TCP
//!
//! ```rust,no_run
//! use yate_extmodule_tokio::{HandlerOutcome, Message, YateClient, YateResult};
//!
//! #[tokio::main]
//! async fn main() -> YateResult<()> {
//!     let client = YateClient::connect("127.0.0.1", 5040).await?;
//!
//!     client
//!         .install("call.route", |msg: Message| async move {
//!             if msg.param_str("called") == Some("32843") {
//!                 let mut routed = msg;
//!                 routed.set_return_value("tone/ring");
//!                 HandlerOutcome::Mutated {
//!                     message: routed,
//!                     handled: true,
//!                 }
//!             } else {
//!                 HandlerOutcome::Ignored
//!             }
//!         })
//!         .await?;
//!
//!     client.wait_connected().await?;
//!     // ... handle calls until shutdown
//!     Ok(())
//! }
//! ```
//!
//! ## Dispatching a message
//!
//! ```rust,no_run
//! # async fn example(client: &yate_extmodule_tokio::YateClient) -> yate_extmodule_tokio::YateResult<()> {
//! use yate_extmodule_tokio::Message;
//!
//! let msg = Message::new("call.route")
//!     .with_param("called", "9999")
//!     .with_param("caller", "12345");
//! let answer = client.dispatch(msg).await?;
//! if answer.success() == Some(true) {
//!     println!("routed to {}", answer.return_value());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Driving a call leg
//!
//! A channel is created from an incoming `call.route` or `call.execute`
//! captured by a handler:
//!
//! ```rust,no_run
//! # async fn example(
//! #     client: &yate_extmodule_tokio::YateClient,
//! #     seed: &yate_extmodule_tokio::Message,
//! # ) -> yate_extmodule_tokio::YateResult<()> {
//! use yate_extmodule_tokio::{CallChannel, Params};
//!
//! let channel = CallChannel::from_message(client.clone(), seed)?;
//! channel.init().await?;
//! channel.answered(Params::new()).await?;
//! channel.call_to("wave/play/welcome.au", Params::new()).await?;
//! channel.hangup("normal").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Processes launched by the engine with their stdio connected can instead
//! operate as a single synthetic leg via [`YateClient::to_channel`].

pub mod channel;
pub mod codec;
pub mod connection;
pub mod constants;
pub mod error;
pub mod handler;
pub mod message;
pub mod output;
pub mod params;
pub mod registry;

pub(crate) mod command;
pub(crate) mod router;

pub use channel::{CallChannel, ChannelStatus, ParseChannelStatusError};
pub use command::Role;
pub use connection::{
    ConnectionStatus, Direction, DisconnectReason, Endpoint, EngineEnvironment, WireObserver,
    YateClient, YateConnectOptions,
};
pub use constants::DEFAULT_PORT;
pub use error::{YateError, YateResult};
pub use handler::{HandlerOutcome, MessageHandler, NotificationWatcher};
pub use message::{Message, MessageKind};
pub use output::OutputSink;
pub use params::{ParamValue, Params};
pub use registry::MessageFilter;
