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

//! Entry points for the stack's callbacks.
//!
//! The embedding owns a [`Server`] and forwards the four TCP events to it,
//! keeping a pcb → slot mapping on its side (the slot returned by the
//! accept methods goes into the pcb's callback argument). `process` runs
//! from the main loop and drives dispatch and WebSocket liveness.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use log::{debug, error};

use crate::connection::RecvSink;
use crate::error::ServerError;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::tcp::{Pbuf, TcpSocket};
#[cfg(feature = "tls")]
use crate::tls::TlsAcceptor;
use crate::transport::Transport;
use crate::upgrade::WebsocketManager;

pub struct Server {
  pub router: Router,
  websockets: Rc<RefCell<WebsocketManager>>,
}

impl Default for Server {
  fn default() -> Self {
    Self::new()
  }
}

impl Server {
  pub fn new() -> Self {
    Self {
      router: Router::new(),
      websockets: Rc::new(RefCell::new(WebsocketManager::new())),
    }
  }

  /// The WebSocket pool, shared with any upgrade handlers.
  pub fn websockets(&self) -> Rc<RefCell<WebsocketManager>> {
    Rc::clone(&self.websockets)
  }

  /// Map a URL path to a handler.
  pub fn add_handler<H>(&mut self, path: impl Into<String>, handler: H)
  where
    H: FnMut(&mut Request, &mut Response) + 'static,
  {
    self.router.add_handler(path, handler);
  }

  /// Serve WebSocket upgrades on `path`.
  pub fn add_websocket_handler(&mut self, path: impl Into<String>) {
    let manager = Rc::clone(&self.websockets);
    self
      .router
      .add_handler(path, move |req: &mut Request, resp: &mut Response| {
        manager.borrow_mut().upgrade(req, resp);
      });
  }

  /// Accept callback: bind the new stream to a free pool slot. The
  /// returned slot is the argument the stack must hand back on every
  /// later callback. On `Err` the caller should abort the pcb.
  pub fn accepted(
    &mut self,
    sock: Box<dyn TcpSocket>,
  ) -> Result<usize, ServerError> {
    let slot = self
      .router
      .free_connection()
      .ok_or(ServerError::NoFreeConnection)?;
    self.router.connections[slot].bind(Transport::Tcp(sock));
    debug!("accepted connection on slot {slot}");
    Ok(slot)
  }

  /// Accept callback for the TLS port: same as [`accepted`](Server::accepted)
  /// but all bytes pass through a fresh TLS session off the acceptor's
  /// shared config.
  #[cfg(feature = "tls")]
  pub fn accepted_tls(
    &mut self,
    sock: Box<dyn TcpSocket>,
    acceptor: &TlsAcceptor,
  ) -> Result<usize, ServerError> {
    let slot = self
      .router
      .free_connection()
      .ok_or(ServerError::NoFreeConnection)?;
    let session = acceptor.accept(sock)?;
    self.router.connections[slot].bind(Transport::Tls(Box::new(session)));
    debug!("accepted tls connection on slot {slot}");
    Ok(slot)
  }

  /// Receive callback. `None` means the remote closed the stream.
  pub fn recv(&mut self, slot: usize, pbuf: Option<Pbuf>) {
    let Some(pbuf) = pbuf else {
      self.release(slot);
      return;
    };

    match self.router.connections[slot].transport_recv(pbuf) {
      Ok(chunks) => {
        for chunk in chunks {
          if !self.deliver(slot, chunk) {
            break;
          }
        }
      }
      Err(e) => {
        error!("receive failed on slot {slot}: {e}");
        self.release(slot);
      }
    }
  }

  fn deliver(&mut self, slot: usize, data: Bytes) -> bool {
    match self.router.connections[slot].sink {
      RecvSink::Http => {
        if self.router.connections[slot].request.parse(&data).is_err() {
          error!("request parse failed on slot {slot}, closing");
          self.release(slot);
          return false;
        }
      }
      RecvSink::Websocket(index) => {
        self.websockets.borrow_mut().data_received(index, &data);
      }
    }
    true
  }

  /// Sent callback: the stack acked `len` bytes on this stream.
  pub fn sent(&mut self, slot: usize, len: usize) {
    let mut close_now = false;
    {
      let conn = &mut self.router.connections[slot];
      if conn.close_once_sent > 0 {
        conn.close_once_sent = conn.close_once_sent.saturating_sub(len);
        close_now = conn.close_once_sent == 0;
      }
    }
    if close_now {
      self.release(slot);
      return;
    }

    match self.router.connections[slot].transport_acked(len) {
      Ok(0) => {}
      Ok(plain) => {
        if self.router.connections[slot].send_complete(plain).is_err() {
          error!("resuming queued send failed on slot {slot}, closing");
          self.release(slot);
        }
      }
      Err(e) => {
        error!("ack handling failed on slot {slot}: {e}");
        self.release(slot);
      }
    }
  }

  /// Error callback: the stack already destroyed the pcb; release state
  /// without touching the socket.
  pub fn error(&mut self, slot: usize) {
    let sink = self.router.connections[slot].sink;
    self.router.connections[slot].abort();
    if let RecvSink::Websocket(index) = sink {
      self.websockets.borrow_mut().unassign(index);
    }
  }

  /// Periodic maintenance from the application's main loop; `now` is the
  /// monotonic time in seconds.
  pub fn process(&mut self, now: u32) {
    self.router.process(now);
    self
      .websockets
      .borrow_mut()
      .process(&mut self.router.connections, now);
  }

  fn release(&mut self, slot: usize) {
    let sink = self.router.connections[slot].sink;
    self.router.connections[slot].close();
    if let RecvSink::Websocket(index) = sink {
      self.websockets.borrow_mut().unassign(index);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::testing::client_frame;
  use crate::response::StatusCode;
  use crate::tcp::mock::{MockSocket, MockState};
  use std::cell::RefCell;
  use std::rc::Rc;

  fn sent(state: &Rc<RefCell<MockState>>) -> String {
    String::from_utf8(state.borrow().sent.clone()).unwrap()
  }

  #[test]
  fn get_round_trip_through_the_stack_callbacks() {
    let mut server = Server::new();
    server.add_handler("/abc", |req: &mut Request, resp: &mut Response| {
      assert_eq!(req.headers["HOST"], "hello");
      let _ = resp.write(b"abc response");
    });

    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    let raw = &b"GET /abc HTTP/1.1\r\nHost: hello\r\n\r\n"[..];
    server.recv(slot, Some(Pbuf::from(raw)));
    server.process(1);

    let out = sent(&state);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("abc response"));
    assert_eq!(state.borrow().recved, raw.len());
  }

  #[test]
  fn fragmented_request_round_trip() {
    let mut server = Server::new();
    server.add_handler("/abc", |_req: &mut Request, resp: &mut Response| {
      let _ = resp.write(b"ok");
    });

    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    for b in b"GET /abc HTTP/1.1\r\nHost: hello\r\n\r\n" {
      server.recv(slot, Some(Pbuf::from(std::slice::from_ref(b))));
    }
    server.process(1);
    assert!(sent(&state).ends_with("ok"));
  }

  #[test]
  fn pool_exhaustion_refuses_the_accept() {
    let mut server = Server::new();
    server.router = Router::with_pool_size(1);
    let (sock, _state) = MockSocket::unbounded();
    server.accepted(Box::new(sock)).unwrap();
    let (sock, _state) = MockSocket::unbounded();
    assert!(matches!(
      server.accepted(Box::new(sock)),
      Err(ServerError::NoFreeConnection)
    ));
  }

  #[test]
  fn malformed_request_closes_the_connection() {
    let mut server = Server::new();
    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.recv(slot, Some(Pbuf::from(&b"BREW /pot HTTP/1.1\r\n\r\n"[..])));
    assert!(state.borrow().closed);
    assert!(!server.router.connections[slot].is_connected());
  }

  #[test]
  fn remote_close_releases_the_slot() {
    let mut server = Server::new();
    let (sock, _state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.recv(slot, None);
    assert!(!server.router.connections[slot].is_connected());
    assert_eq!(server.router.free_connection(), Some(slot));
  }

  #[test]
  fn close_once_sent_counts_down_then_closes() {
    let mut server = Server::new();
    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    // response with Connection: close (no keep-alive header on request)
    server.recv(slot, Some(Pbuf::from(&b"GET /x HTTP/1.1\r\n\r\n"[..])));
    server.process(1);
    let total = state.borrow().sent.len();
    assert!(total > 0);

    // acks trickle in; the close fires exactly when the count hits zero
    server.sent(slot, total - 1);
    assert!(server.router.connections[slot].is_connected());
    server.sent(slot, 1);
    assert!(!server.router.connections[slot].is_connected());
    assert!(state.borrow().closed);
  }

  #[test]
  fn websocket_upgrade_end_to_end() {
    let mut server = Server::new();
    server.add_websocket_handler("/ws");

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let received2 = Rc::clone(&received);
    server.websockets().borrow_mut().set_frame_handler(Box::new(
      move |_ws, frame, _conn| {
        received2.borrow_mut().extend_from_slice(frame.payload);
      },
    ));

    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.recv(
      slot,
      Some(Pbuf::from(
        &b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"[..],
      )),
    );
    server.process(1);

    let out = sent(&state);
    assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(out.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(server.router.connections[slot].hijacked);

    // frames now flow to the framer instead of the parser
    state.borrow_mut().sent.clear();
    server.recv(slot, Some(Pbuf::from(&client_frame(0x1, true, b"hi ws")[..])));
    server.process(2);
    assert_eq!(received.borrow().as_slice(), b"hi ws");

    // the liveness pump pings, the peer pongs, and the hijacked
    // connection rides out the http idle reaper
    server.process(20);
    server.recv(slot, Some(Pbuf::from(&client_frame(0xA, true, b"")[..])));
    server.process(crate::KEEPALIVE_TIMEOUT_SECS + 10);
    assert!(server.router.connections[slot].is_connected());
  }

  #[test]
  fn websocket_slot_freed_on_remote_close() {
    let mut server = Server::new();
    server.add_websocket_handler("/ws");
    let (sock, _state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.recv(
      slot,
      Some(Pbuf::from(
        &b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nSec-WebSocket-Key: abc\r\n\r\n"[..],
      )),
    );
    server.process(1);

    server.recv(slot, None);
    assert!(!server.router.connections[slot].is_connected());
    let ws = server.websockets();
    let mut ws = ws.borrow_mut();
    assert!(!ws.socket_mut(0).unwrap().is_in_use());
  }

  #[test]
  fn stack_error_releases_without_touching_the_socket() {
    let mut server = Server::new();
    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.error(slot);
    assert!(!server.router.connections[slot].is_connected());
    // the pcb was already gone; close must not have been called
    assert!(!state.borrow().closed);
  }

  #[test]
  fn custom_default_handler() {
    let mut server = Server::new();
    server
      .router
      .set_default_handler(Some(Box::new(|_req: &mut Request, resp: &mut Response| {
        resp.write_header(StatusCode::BadRequest);
      })));
    let (sock, state) = MockSocket::unbounded();
    let slot = server.accepted(Box::new(sock)).unwrap();
    server.recv(slot, Some(Pbuf::from(&b"GET /zzz HTTP/1.1\r\n\r\n"[..])));
    server.process(1);
    assert!(sent(&state).starts_with("HTTP/1.1 400 Bad Request\r\n"));
  }
}
