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

use std::any::Any;
use std::collections::VecDeque;

use bytes::Bytes;
use log::debug;

use crate::error::{ServerError, Status};
use crate::request::Request;
use crate::tcp::WRITE_FLAG_ZERO_COPY;
use crate::transport::Transport;
use crate::MAX_SEND_SIZE;

/// Where bytes received on a connection are delivered.
///
/// Every connection starts out feeding the HTTP request parser; a
/// WebSocket upgrade swaps the sink to the assigned framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecvSink {
  Http,
  Websocket(usize),
}

/// One accepted TCP stream, drawn from the router's fixed pool.
///
/// The connection owns its transport and a send queue that absorbs
/// whatever the TCP layer cannot take right now; queued chunks are
/// re-submitted as the stack acknowledges earlier bytes.
pub struct ServerConnection {
  slot: usize,
  transport: Option<Transport>,
  pub(crate) request: Request,
  send_queue: VecDeque<Bytes>,
  waiting_for_ack: usize,
  pub(crate) last_request_time: u32,
  pub(crate) hijacked: bool,
  pub(crate) close_once_sent: usize,
  pub(crate) sink: RecvSink,
  session: Option<Box<dyn Any>>,
}

impl ServerConnection {
  pub(crate) fn new(slot: usize) -> Self {
    Self {
      slot,
      transport: None,
      request: Request::new(),
      send_queue: VecDeque::new(),
      waiting_for_ack: 0,
      last_request_time: 0,
      hijacked: false,
      close_once_sent: 0,
      sink: RecvSink::Http,
      session: None,
    }
  }

  /// Prepare the slot for a freshly accepted stream.
  pub(crate) fn bind(&mut self, transport: Transport) {
    self.reset_state();
    self.transport = Some(transport);
  }

  fn reset_state(&mut self) {
    self.request.reset();
    self.send_queue.clear();
    self.waiting_for_ack = 0;
    self.last_request_time = 0;
    self.hijacked = false;
    self.close_once_sent = 0;
    self.sink = RecvSink::Http;
    self.session = None;
  }

  /// Index of this connection in the pool.
  pub fn slot(&self) -> usize {
    self.slot
  }

  pub fn is_connected(&self) -> bool {
    self.transport.is_some()
  }

  /// Submit bytes for transmission in call order.
  ///
  /// Whatever exceeds the transport's current send window or the per-chunk
  /// cap is queued and drained as acks come back. Returns `false` if the
  /// connection is closed or the transport rejected the write outright.
  pub fn write_data(&mut self, data: &[u8], flags: u8) -> bool {
    let Some(transport) = self.transport.as_mut() else {
      return false;
    };
    if data.is_empty() {
      return true;
    }

    let mut data = data;
    let zero_copy = flags & WRITE_FLAG_ZERO_COPY != 0;
    // only the head of the line may go straight to the transport; anything
    // behind queued chunks must queue too or bytes would reorder
    if self.send_queue.is_empty() {
      let cap = if zero_copy {
        data.len()
      } else {
        data.len().min(MAX_SEND_SIZE)
      };
      match transport.write(&data[..cap], flags) {
        Ok(n) => {
          self.waiting_for_ack += n;
          data = &data[n..];
        }
        Err(_) => return false,
      }
    }

    while !data.is_empty() {
      let n = data.len().min(MAX_SEND_SIZE);
      self.send_queue.push_back(Bytes::copy_from_slice(&data[..n]));
      data = &data[n..];
    }
    true
  }

  /// Ack path: the stack confirmed `len` bytes. Re-submits the next queued
  /// chunk when there is headroom.
  ///
  /// Returns `Partial` while chunks remain queued, `Complete` once the
  /// queue is drained.
  pub fn send_complete(&mut self, len: usize) -> Result<Status, ServerError> {
    if self.waiting_for_ack == 0 {
      return Ok(Status::Complete);
    }
    self.waiting_for_ack = self.waiting_for_ack.saturating_sub(len);

    if self.waiting_for_ack <= MAX_SEND_SIZE {
      if let Some(chunk) = self.send_queue.pop_front() {
        let transport = self
          .transport
          .as_mut()
          .ok_or(ServerError::ConnectionClosed)?;
        match transport.write(&chunk, 0) {
          Ok(n) => {
            self.waiting_for_ack += n;
            if n < chunk.len() {
              self.send_queue.push_front(chunk.slice(n..));
            }
          }
          Err(_) => {
            self.send_queue.push_front(chunk);
            return Err(ServerError::WriteFailed);
          }
        }
      }
    }

    if self.send_queue.is_empty() {
      Ok(Status::Complete)
    } else {
      Ok(Status::Partial)
    }
  }

  /// True if the transport can take at least one byte right now. Upper
  /// layers use this to avoid starting a write they cannot finish in one
  /// pass.
  pub fn has_available_send_buffer(&self) -> bool {
    self
      .transport
      .as_ref()
      .map(|t| t.available_send_buffer() > 0)
      .unwrap_or(false)
  }

  pub(crate) fn available_send_buffer(&self) -> usize {
    self
      .transport
      .as_ref()
      .map(Transport::available_send_buffer)
      .unwrap_or(0)
  }

  pub(crate) fn transport_recv(
    &mut self,
    pbuf: crate::tcp::Pbuf,
  ) -> Result<Vec<Bytes>, ServerError> {
    match self.transport.as_mut() {
      Some(t) => t.receive(pbuf),
      None => Err(ServerError::ConnectionClosed),
    }
  }

  pub(crate) fn transport_acked(
    &mut self,
    len: usize,
  ) -> Result<usize, ServerError> {
    match self.transport.as_mut() {
      Some(t) => t.acked(len),
      None => Ok(0),
    }
  }

  /// Shut the transport down and return the slot to the pool. One-way:
  /// writes after close return `false`.
  pub fn close(&mut self) {
    if let Some(mut t) = self.transport.take() {
      debug!("closing connection slot {}", self.slot);
      t.shutdown();
    }
    self.release_state();
  }

  /// Release state without touching the socket; used when the stack has
  /// already destroyed it.
  pub(crate) fn abort(&mut self) {
    self.transport = None;
    self.release_state();
  }

  fn release_state(&mut self) {
    // the session arg's drop plays the free handler
    self.session = None;
    self.send_queue.clear();
    self.waiting_for_ack = 0;
    self.close_once_sent = 0;
    self.hijacked = false;
    self.request.reset();
  }

  /// Attach a value that persists across keep-alive reuses of this
  /// connection and is dropped on close.
  pub fn set_session_arg(&mut self, arg: Box<dyn Any>) {
    self.session = Some(arg);
  }

  pub fn session_arg(&mut self) -> Option<&mut (dyn Any + 'static)> {
    self.session.as_deref_mut()
  }

  pub fn take_session_arg(&mut self) -> Option<Box<dyn Any>> {
    self.session.take()
  }

  #[cfg(test)]
  pub(crate) fn queued_chunks(&self) -> usize {
    self.send_queue.len()
  }
}
