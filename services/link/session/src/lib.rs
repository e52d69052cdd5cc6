//! Reconnectable, ordered, acknowledged sessions for link.
//!
//! A session is a message stream between two peers that outlives any single
//! TCP connection. Messages are sequenced, acknowledged cumulatively and
//! retransmitted go-back-N after a connection is replaced, so the
//! application sees each message once and in order.
//!
//! ## Layers
//!
//! - **Queue**: per-session sequence counter, receive cursor, pending window and cache
//! - **Transfer**: `write` / `emit` / `flush` / `resend` / `read_message` flow control
//! - **Connector**: dial, verify, re-verify and redial state machine of the initiating side
//! - **Acceptor**: connect/reconnect validation and transport rebinding on the listening side
//! - **Runtime**: one tokio task per session ([`Client`], [`Server`]) behind a [`SessionHandle`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use link_session::{Client, Server, SessionConfig, SessionEvent};
//!
//! # async fn example() -> Result<(), link_session::SessionError> {
//! let mut server = Server::bind(SessionConfig::default(), "127.0.0.1:0".parse().unwrap()).await?;
//! let addr = server.local_addr();
//!
//! tokio::spawn(async move {
//!     while let Some(mut session) = server.accept().await {
//!         tokio::spawn(async move {
//!             while let Some(event) = session.recv().await {
//!                 match event {
//!                     SessionEvent::Message(data) => {
//!                         let _ = session.send(data);
//!                     }
//!                     SessionEvent::Heartbeat => {}
//!                     SessionEvent::Closed(reason) => {
//!                         println!("session closed: {}", reason);
//!                     }
//!                 }
//!             }
//!         });
//!     }
//! });
//!
//! let mut client = Client::connect(SessionConfig::default(), addr, 1001).await?;
//! client.send(Bytes::from_static(b"ping"))?;
//! if let Some(SessionEvent::Message(reply)) = client.recv().await {
//!     println!("echo: {:?}", reply);
//! }
//! client.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod client;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod keepalive;
pub mod queue;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-export main types
pub use acceptor::AcceptedSession;
pub use client::Client;
pub use connector::{Connector, ConnectorState, Dial};
pub use error::SessionError;
pub use handshake::{accept_response, is_new_connect, origin_ack, validate_reconnect, Rejection};
pub use keepalive::Keepalive;
pub use queue::{MessageQueue, QueuedMessage};
pub use server::{Server, SessionRegistry};
pub use session::{
    CloseReason, Effect, SessionConfig, SessionEvent, SessionHandle, SessionSender, SessionStats,
};
pub use transfer::TransferError;
pub use transport::memory::MemoryTransport;
pub use transport::{connect_tcp, listen_tcp, recv_any_frame, TcpTransport, Transport, TransportId};
