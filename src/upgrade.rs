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

//! HTTP upgrades and the WebSocket connection pool.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, error};
use sha1::{Digest, Sha1};

use crate::connection::{RecvSink, ServerConnection};
use crate::frame::{Frame, OpCode};
use crate::request::Request;
use crate::response::{ConnectionMode, Response, StatusCode};
use crate::websocket::Websocket;
use crate::{
  CLOSE_WAIT_SECS, MAX_WEBSOCKETS, PING_INTERVAL_SECS, PONG_TIMEOUT_SECS,
  WS_RECV_BUFFER_SIZE,
};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Called for every frame the pump decodes, before any protocol reply.
pub type FrameHandler =
  Box<dyn FnMut(&mut Websocket, &Frame<'_>, &mut ServerConnection)>;

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
  let mut sha = Sha1::new();
  sha.update(client_key.as_bytes());
  sha.update(WS_GUID);
  BASE64.encode(sha.finalize())
}

/// Fixed pool of WebSocket framers plus the upgrade handler and the
/// ping/pong liveness pump.
pub struct WebsocketManager {
  sockets: Vec<Websocket>,
  frame_handler: Option<FrameHandler>,
  now: u32,
}

impl Default for WebsocketManager {
  fn default() -> Self {
    Self::new()
  }
}

impl WebsocketManager {
  pub fn new() -> Self {
    Self::with_pool_size(MAX_WEBSOCKETS)
  }

  pub fn with_pool_size(size: usize) -> Self {
    Self {
      sockets: (0..size).map(|_| Websocket::new()).collect(),
      frame_handler: None,
      now: 0,
    }
  }

  pub fn set_frame_handler(&mut self, handler: FrameHandler) {
    self.frame_handler = Some(handler);
  }

  pub fn socket_mut(&mut self, index: usize) -> Option<&mut Websocket> {
    self.sockets.get_mut(index)
  }

  fn next_free_socket(&self) -> Option<usize> {
    self.sockets.iter().position(|s| !s.is_in_use())
  }

  /// Handler for the path the application exposes WebSockets on.
  ///
  /// Checks the upgrade headers, allocates a framer, answers `101
  /// Switching Protocols` with the accept key, and rewires the connection
  /// so its bytes feed the framer instead of the request parser.
  pub fn upgrade(&mut self, req: &mut Request, resp: &mut Response) {
    let upgrade_requested = req
      .headers
      .get("CONNECTION")
      .map(|v| v.to_ascii_lowercase().contains("upgrade"))
      .unwrap_or(false);
    if !upgrade_requested {
      resp.write_header(StatusCode::BadRequest);
      return;
    }

    let Some(key) = req
      .headers
      .get("SEC-WEBSOCKET-KEY")
      .filter(|k| !k.is_empty())
    else {
      resp.write_header(StatusCode::BadRequest);
      return;
    };

    let Some(index) = self.next_free_socket() else {
      error!("websocket pool exhausted");
      resp.write_header(StatusCode::InternalServerError);
      return;
    };

    resp.write_header(StatusCode::SwitchingProtocol);
    resp.write_header_line("Sec-WebSocket-Accept", &accept_key(key));
    resp.write_header_raw("Upgrade: websocket");
    resp.set_connection_mode(ConnectionMode::Upgrade);

    // map the connection to the framer and back
    let now = self.now;
    let conn = resp.hijack_connection();
    conn.sink = RecvSink::Websocket(index);
    self.sockets[index].assign(conn.slot(), now);
    debug!("websocket upgrade on slot {}", conn.slot());
  }

  /// Receive-path entry: bytes for the framer at `index`.
  pub(crate) fn data_received(&mut self, index: usize, data: &[u8]) {
    if let Some(ws) = self.sockets.get_mut(index) {
      ws.data_received(data);
    }
  }

  /// Drop the framer-to-connection binding (connection already released).
  pub(crate) fn unassign(&mut self, index: usize) {
    if let Some(ws) = self.sockets.get_mut(index) {
      ws.unassign();
    }
  }

  /// Periodic pump: decode at most one frame per framer, keep the
  /// ping/pong liveness going, and time out half-closed sessions.
  pub fn process(&mut self, conns: &mut [ServerConnection], now: u32) {
    self.now = now;
    let Self {
      sockets,
      frame_handler,
      ..
    } = self;

    for ws in sockets.iter_mut() {
      let Some(slot) = ws.connection_slot() else {
        continue;
      };
      let conn = &mut conns[slot];
      if !conn.is_connected() {
        ws.unassign();
        continue;
      }

      let mut payload = [0u8; WS_RECV_BUFFER_SIZE];
      match ws.next_frame(&mut payload) {
        Err(e) => {
          error!("websocket protocol error, closing: {e}");
          conn.close();
          ws.unassign();
        }
        Ok(Some(frame)) => {
          if let Some(handler) = frame_handler.as_mut() {
            handler(ws, &frame, conn);
          }
          match frame.opcode {
            OpCode::Close => {
              if ws.is_close_requested_by_server() {
                // the peer echoed our close; the handshake is done
                conn.close();
                ws.unassign();
              } else if ws
                .write_frame(conn, OpCode::Close, frame.payload)
                .is_err()
              {
                conn.close();
                ws.unassign();
              }
            }
            OpCode::Ping => {
              if ws.write_frame(conn, OpCode::Pong, frame.payload).is_err() {
                error!("pong reply failed, closing");
                conn.close();
                ws.unassign();
              }
            }
            OpCode::Pong => {
              ws.last_pong_received = now;
            }
            _ => {}
          }
        }
        Ok(None) => {
          if ws.is_close_requested_by_server() {
            // no pings while a close is pending, just the echo deadline
            if now.saturating_sub(ws.close_sent_at) > CLOSE_WAIT_SECS {
              debug!("close handshake timed out on slot {slot}");
              conn.close();
              ws.unassign();
            }
          } else if now.saturating_sub(ws.last_ping_sent) > PING_INTERVAL_SECS {
            let last_seen = if ws.last_pong_received != 0 {
              ws.last_pong_received
            } else {
              ws.last_ping_sent
            };
            if now.saturating_sub(last_seen) > PONG_TIMEOUT_SECS {
              error!("pong timeout, closing websocket on slot {slot}");
              conn.close();
              ws.unassign();
              continue;
            }
            if ws.write_frame(conn, OpCode::Ping, &[]).is_err() {
              error!("ping failed, closing websocket on slot {slot}");
              conn.close();
              ws.unassign();
              continue;
            }
            ws.last_ping_sent = now;
          }
        }
      }
    }
  }

  /// Broadcast one frame to every assigned framer.
  pub fn write_frame_to_all(
    &mut self,
    conns: &mut [ServerConnection],
    opcode: OpCode,
    payload: &[u8],
  ) {
    for ws in self.sockets.iter_mut() {
      if let Some(slot) = ws.connection_slot() {
        let conn = &mut conns[slot];
        if conn.is_connected() {
          let _ = ws.write_frame(conn, opcode, payload);
        }
      }
    }
  }
}
