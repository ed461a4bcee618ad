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

use log::{debug, error};

use crate::buffer::RingBuffer;
use crate::connection::ServerConnection;
use crate::error::ServerError;
use crate::frame::{self, Frame, OpCode};
use crate::WS_RECV_BUFFER_SIZE;

/// A pooled WebSocket framer bound to at most one connection at a time.
///
/// Incoming bytes land in a ring buffer; frames are decoded out of it one
/// at a time by the manager's periodic pump or by the application.
pub struct Websocket {
  recv: RingBuffer,
  conn_slot: Option<usize>,
  pub(crate) last_ping_sent: u32,
  pub(crate) last_pong_received: u32,
  pub(crate) close_sent_at: u32,
  close_requested_by_server: bool,
}

impl Websocket {
  pub(crate) fn new() -> Self {
    Self {
      recv: RingBuffer::new(WS_RECV_BUFFER_SIZE),
      conn_slot: None,
      last_ping_sent: 0,
      last_pong_received: 0,
      close_sent_at: 0,
      close_requested_by_server: false,
    }
  }

  /// True while a connection is assigned to this pooled object.
  pub fn is_in_use(&self) -> bool {
    self.conn_slot.is_some()
  }

  /// Pool slot of the connection this framer is bound to.
  pub fn connection_slot(&self) -> Option<usize> {
    self.conn_slot
  }

  pub fn is_close_requested_by_server(&self) -> bool {
    self.close_requested_by_server
  }

  pub(crate) fn assign(&mut self, conn_slot: usize, now: u32) {
    self.conn_slot = Some(conn_slot);
    self.last_ping_sent = now;
  }

  pub(crate) fn unassign(&mut self) {
    self.conn_slot = None;
    self.last_ping_sent = 0;
    self.last_pong_received = 0;
    self.close_sent_at = 0;
    self.close_requested_by_server = false;
    self.recv.reset();
  }

  /// Append bytes delivered by the connection's receive path.
  pub(crate) fn data_received(&mut self, data: &[u8]) {
    if self.recv.put(data).is_err() {
      // a peer that outruns the decoder this far is not worth keeping in
      // sync; start over with the fresh bytes
      error!("websocket receive buffer overflow, dropping backlog");
      self.recv.reset();
      if self.recv.put(data).is_err() {
        debug!("oversized fragment dropped");
      }
    }
  }

  /// Decode the next complete frame into `payload_buf`, unmasking in
  /// place. `Ok(None)` until a whole frame is buffered.
  pub fn next_frame<'a>(
    &mut self,
    payload_buf: &'a mut [u8],
  ) -> Result<Option<Frame<'a>>, ServerError> {
    let frame = frame::decode(&mut self.recv, payload_buf)?;
    if let Some(ref f) = frame {
      if f.opcode == OpCode::Text && f.fin && !f.is_utf8() {
        return Err(ServerError::InvalidUTF8);
      }
    }
    Ok(frame)
  }

  /// Write one unfragmented frame to the peer.
  pub fn write_frame(
    &self,
    conn: &mut ServerConnection,
    opcode: OpCode,
    payload: &[u8],
  ) -> Result<(), ServerError> {
    frame::write_frame(conn, opcode, &[], payload)
  }

  /// Send a close frame carrying `code` and start waiting for the peer's
  /// echo.
  pub fn send_close_frame(
    &mut self,
    conn: &mut ServerConnection,
    code: u16,
    now: u32,
  ) -> Result<(), ServerError> {
    self.close_requested_by_server = true;
    self.close_sent_at = now;
    frame::write_frame(conn, OpCode::Close, &code.to_be_bytes(), &[])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::testing::client_frame;
  use crate::tcp::mock::MockSocket;
  use crate::transport::Transport;

  #[test]
  fn frames_decode_across_fragmented_appends() {
    let mut ws = Websocket::new();
    ws.assign(0, 1);
    let bytes = client_frame(0x1, true, b"split me");
    let (a, b) = bytes.split_at(5);

    ws.data_received(a);
    let mut buf = [0u8; 64];
    assert!(ws.next_frame(&mut buf).unwrap().is_none());
    ws.data_received(b);
    let frame = ws.next_frame(&mut buf).unwrap().unwrap();
    assert_eq!(frame.payload, b"split me");
  }

  #[test]
  fn two_frames_in_one_append() {
    let mut ws = Websocket::new();
    ws.assign(0, 1);
    let mut bytes = client_frame(0x1, true, b"one");
    bytes.extend(client_frame(0x2, true, b"two"));
    ws.data_received(&bytes);

    let mut buf = [0u8; 64];
    let f1 = ws.next_frame(&mut buf).unwrap().unwrap();
    assert_eq!((f1.opcode, f1.payload), (OpCode::Text, &b"one"[..]));
    let f2 = ws.next_frame(&mut buf).unwrap().unwrap();
    assert_eq!((f2.opcode, f2.payload), (OpCode::Binary, &b"two"[..]));
    assert!(ws.next_frame(&mut buf).unwrap().is_none());
  }

  #[test]
  fn invalid_text_frame_is_an_error() {
    let mut ws = Websocket::new();
    ws.assign(0, 1);
    ws.data_received(&client_frame(0x1, true, &[0xff, 0xfe, 0xfd]));
    let mut buf = [0u8; 16];
    assert!(matches!(
      ws.next_frame(&mut buf),
      Err(ServerError::InvalidUTF8)
    ));
  }

  #[test]
  fn send_close_frame_sets_state() {
    let (sock, state) = MockSocket::unbounded();
    let mut conn = ServerConnection::new(0);
    conn.bind(Transport::Tcp(Box::new(sock)));

    let mut ws = Websocket::new();
    ws.assign(0, 10);
    ws.send_close_frame(&mut conn, 1000, 42).unwrap();
    assert!(ws.is_close_requested_by_server());
    assert_eq!(ws.close_sent_at, 42);
    assert_eq!(state.borrow().sent, &[0x88, 0x02, 0x03, 0xE8]);
  }

  #[test]
  fn unassign_clears_state() {
    let mut ws = Websocket::new();
    ws.assign(3, 7);
    ws.data_received(b"leftover");
    ws.last_pong_received = 9;
    ws.unassign();
    assert!(!ws.is_in_use());
    assert_eq!(ws.last_pong_received, 0);
    let mut buf = [0u8; 16];
    assert!(ws.next_frame(&mut buf).unwrap().is_none());
  }
}
