// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! _fastwebserver_ is a minimal, fast HTTP/1.1 server core for
//! non-blocking, callback-driven TCP stacks of the kind found on
//! microcontrollers, where receive buffers arrive in discrete chunks and
//! sent bytes are acknowledged asynchronously.
//!
//! The crate is sans-IO: it never opens a socket. The embedding implements
//! [`TcpSocket`] over its stack's per-connection handle, forwards the
//! stack's accept/recv/sent/error callbacks to a [`Server`], and calls
//! [`Server::process`] from its main loop. Everything else happens inside:
//! incremental request parsing, chunked responses built in a single fixed
//! buffer, a backpressure-absorbing send pipeline, optional TLS
//! termination, and RFC 6455 WebSocket upgrade with ping/pong liveness.
//!
//! Long-lived objects (connections, WebSocket framers) live in fixed-size
//! pools; per-request state is stack-allocated in the dispatch loop.
//!
//! # Example
//!
//! ```
//! use fastwebserver::{Pbuf, Request, Response, Server, ServerError, TcpSocket};
//!
//! // A toy socket standing in for the embedding's TCP stack handle.
//! struct Loopback(Vec<u8>);
//!
//! impl TcpSocket for Loopback {
//!   fn write(&mut self, data: &[u8], _flags: u8) -> Result<usize, ServerError> {
//!     self.0.extend_from_slice(data);
//!     Ok(data.len())
//!   }
//!   fn output(&mut self) -> Result<(), ServerError> {
//!     Ok(())
//!   }
//!   fn close(&mut self) {}
//!   fn send_buffer(&self) -> usize {
//!     usize::MAX
//!   }
//!   fn recved(&mut self, _len: usize) {}
//! }
//!
//! let mut server = Server::new();
//! server.add_handler("/hello", |_req: &mut Request, resp: &mut Response| {
//!   let _ = resp.write(b"Hello World");
//! });
//!
//! // wired to the stack's callbacks in a real embedding:
//! let slot = server.accepted(Box::new(Loopback(Vec::new()))).unwrap();
//! server.recv(slot, Some(Pbuf::from(&b"GET /hello HTTP/1.1\r\n\r\n"[..])));
//! server.process(0);
//! ```
//!
//! # TLS
//!
//! With the `tls` feature (on by default), a [`TlsAcceptor`] built from
//! PEM bytes terminates TLS on the same pipeline:
//!
//! ```ignore
//! let acceptor = TlsAcceptor::from_pem(CERT_PEM, KEY_PEM)?;
//! let slot = server.accepted_tls(Box::new(sock), &acceptor)?;
//! ```
//!
//! # WebSockets
//!
//! ```
//! use fastwebserver::Server;
//!
//! let mut server = Server::new();
//! server.add_websocket_handler("/ws");
//! server.websockets().borrow_mut().set_frame_handler(Box::new(
//!   |_socket, frame, _conn| {
//!     // echo handling, state machines, ...
//!     let _ = frame.payload;
//!   },
//! ));
//! ```

mod buffer;
mod connection;
mod error;
mod files;
mod frame;
mod mask;
mod request;
mod response;
mod router;
mod server;
pub mod tcp;
#[cfg(feature = "tls")]
mod tls;
mod transport;
mod upgrade;
mod websocket;

pub use crate::buffer::RingBuffer;
pub use crate::connection::ServerConnection;
pub use crate::error::{ServerError, Status};
pub use crate::files::{
  EmbeddedFile, EmbeddedFileType, EmbeddedFiles, FILE_FLAG_GZIP,
  FILE_TYPE_MASK,
};
pub use crate::frame::{Frame, OpCode, FLAG_FIN, FLAG_MASK};
pub use crate::mask::unmask;
pub use crate::request::{Method, Request, Version};
pub use crate::response::{ConnectionMode, Response, StatusCode};
pub use crate::router::{RequestHandler, Router};
pub use crate::server::Server;
pub use crate::tcp::{Pbuf, TcpSocket, WRITE_FLAG_NO_FLUSH, WRITE_FLAG_ZERO_COPY};
#[cfg(feature = "tls")]
pub use crate::tls::TlsAcceptor;
pub use crate::upgrade::{accept_key, FrameHandler, WebsocketManager};
pub use crate::websocket::Websocket;

/// Connection pool size.
pub const MAX_CLIENT_CONNECTIONS: usize = 10;
/// WebSocket framer pool size.
pub const MAX_WEBSOCKETS: usize = 5;
/// Cap on the request parser's buffer growth.
pub const REQUEST_BUFFER_SIZE: usize = 512;
/// Response buffer size; headers and body share it.
pub const RESPONSE_BUFFER_SIZE: usize = 512;
/// Forward header region reserved at the front of the response buffer.
pub const RESPONSE_HEADERS_RESERVED: usize = 256;
/// Largest unit the send pipeline submits in one write.
pub const MAX_SEND_SIZE: usize = 4096;
/// WebSocket receive ring size per framer.
pub const WS_RECV_BUFFER_SIZE: usize = 2048;
/// Idle keep-alive connections are closed after this many seconds.
pub const KEEPALIVE_TIMEOUT_SECS: u32 = 60;
/// Interval between liveness pings on an idle WebSocket.
pub const PING_INTERVAL_SECS: u32 = 15;
/// A WebSocket that has not ponged for this long is closed hard.
pub const PONG_TIMEOUT_SECS: u32 = 60;
/// Grace period for the peer to echo a server-initiated close.
pub const CLOSE_WAIT_SECS: u32 = 30;
