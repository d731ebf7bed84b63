//! Control-socket protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Requests / Responses           │  JSON (messages)
//! ├─────────────────────────────────────────┤
//! │     Admission + Hello/HelloAck           │  handshake
//! ├─────────────────────────────────────────┤
//! │               Framing                    │  Length-prefixed
//! ├─────────────────────────────────────────┤
//! │     UDS Transport + peer credentials     │  server, credentials
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`error`]: Protocol error types ([`ProtocolError`], [`ProtocolResult`])
//! - [`framing`]: Length-prefixed frame codec ([`FrameCodec`])
//! - [`handshake`]: Version negotiation ([`Hello`], [`HelloAck`],
//!   [`ServerHandshake`])
//! - [`messages`]: Requests and responses ([`Request`], [`Response`])
//! - [`credentials`]: Peer credential sources ([`CredentialProvider`],
//!   [`UnixPeer`])
//! - [`server`]: UDS listener ([`ProtocolServer`], [`Connection`])
//! - [`dispatch`]: Commands behind the authorization gate
//! - [`connection_handler`]: Per-connection task
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload (JSON)   |
//! +----------------------------+------------------+
//! ```
//!
//! - Maximum handshake frame: 64 KiB
//! - Maximum request frame: 1 MiB
//!
//! # Usage Example
//!
//! ```ignore
//! use battd_daemon::protocol::{
//!     ClientHandshake, Command, Request, connect, default_socket_path, serialize_handshake_message,
//!     serialize_request,
//! };
//! use futures::{SinkExt, StreamExt};
//!
//! let mut conn = connect(default_socket_path()).await?;
//! let hello = ClientHandshake::new("battctl/0.1").create_hello();
//! conn.send(serialize_handshake_message(&hello.into())?).await?;
//! let ack = conn.next().await;
//! conn.send(serialize_request(&Request::new(1, Command::GetState))?).await?;
//! ```

pub mod connection_handler;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod messages;
pub mod server;

pub use connection_handler::{HANDSHAKE_TIMEOUT, HandshakeResult, handle_connection};
pub use credentials::{CredentialProvider, PeerSource, ProcfsCredentials, UnixPeer};
pub use dispatch::dispatch;
pub use error::{
    MAX_FRAME_SIZE, MAX_HANDSHAKE_FRAME_SIZE, PROTOCOL_VERSION, ProtocolError, ProtocolResult,
};
pub use framing::FrameCodec;
pub use handshake::{
    ClientHandshake, HandshakeErrorCode, HandshakeMessage, HandshakeState, Hello, HelloAck,
    HelloNack, ServerHandshake, parse_handshake_message, parse_hello,
    serialize_handshake_message,
};
pub use messages::{
    Command, Request, Response, Status, parse_request, parse_response, serialize_request,
    serialize_response,
};
pub use server::{
    Connection, ConnectionPermit, DEFAULT_MAX_CONNECTIONS, DEFAULT_SOCKET_PATH, ProtocolServer,
    ServerConfig, connect, default_socket_path,
};
