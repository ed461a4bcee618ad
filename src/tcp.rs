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

//! Contract with the embedded TCP stack.
//!
//! The stack accepts connections, delivers reference-counted receive
//! buffers, acknowledges sent bytes asynchronously, and exposes its
//! remaining send-buffer space. The server never owns a socket beyond this
//! trait; everything else in the crate is driven through it.

use bytes::Bytes;

use crate::error::ServerError;

/// The bytes stay valid until acked; the stack must not copy them into its
/// own buffers.
pub const WRITE_FLAG_ZERO_COPY: u8 = 2;
/// Queue the bytes but skip the output step; a later write flushes them.
pub const WRITE_FLAG_NO_FLUSH: u8 = 4;

/// Handle to one accepted TCP stream.
pub trait TcpSocket {
  /// Queue bytes for transmission. Returns how many bytes the stack
  /// accepted, bounded by [`send_buffer`](TcpSocket::send_buffer).
  fn write(&mut self, data: &[u8], flags: u8) -> Result<usize, ServerError>;

  /// Push queued segments onto the wire.
  fn output(&mut self) -> Result<(), ServerError>;

  /// Close the stream. Further writes fail.
  fn close(&mut self);

  /// Free space in the stack's send buffer, in bytes.
  fn send_buffer(&self) -> usize;

  /// Advertise `len` consumed bytes back to the peer's receive window.
  fn recved(&mut self, len: usize);
}

/// A receive buffer delivered by the stack.
///
/// The payload is reference counted; dropping the `Pbuf` releases it. The
/// read position can slide forward so a consumer that drains the buffer in
/// several passes does not have to copy.
pub struct Pbuf {
  data: Bytes,
  off: usize,
}

impl Pbuf {
  pub fn new(data: Bytes) -> Self {
    Self { data, off: 0 }
  }

  /// Bytes not yet consumed.
  pub fn len(&self) -> usize {
    self.data.len() - self.off
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn payload(&self) -> &[u8] {
    &self.data[self.off..]
  }

  /// Slide the read position forward after a partial read.
  pub fn advance(&mut self, n: usize) {
    debug_assert!(self.off + n <= self.data.len());
    self.off += n;
  }

  /// Size as delivered by the stack, for receive-window accounting.
  pub fn total_len(&self) -> usize {
    self.data.len()
  }

  pub fn into_bytes(self) -> Bytes {
    self.data.slice(self.off..)
  }
}

impl From<Bytes> for Pbuf {
  fn from(data: Bytes) -> Self {
    Self::new(data)
  }
}

impl From<&[u8]> for Pbuf {
  fn from(data: &[u8]) -> Self {
    Self::new(Bytes::copy_from_slice(data))
  }
}

#[cfg(test)]
pub(crate) mod mock {
  use super::*;
  use std::cell::RefCell;
  use std::rc::Rc;

  /// Observable side of a [`MockSocket`]: everything the fake stack has
  /// been asked to do.
  pub struct MockState {
    pub sent: Vec<u8>,
    pub sndbuf: usize,
    pub closed: bool,
    pub recved: usize,
    pub output_calls: usize,
  }

  pub struct MockSocket {
    state: Rc<RefCell<MockState>>,
  }

  impl MockSocket {
    pub fn new(sndbuf: usize) -> (Self, Rc<RefCell<MockState>>) {
      let state = Rc::new(RefCell::new(MockState {
        sent: Vec::new(),
        sndbuf,
        closed: false,
        recved: 0,
        output_calls: 0,
      }));
      (
        Self {
          state: Rc::clone(&state),
        },
        state,
      )
    }

    /// A socket whose send buffer never runs out.
    pub fn unbounded() -> (Self, Rc<RefCell<MockState>>) {
      Self::new(usize::MAX)
    }
  }

  impl TcpSocket for MockSocket {
    fn write(&mut self, data: &[u8], _flags: u8) -> Result<usize, ServerError> {
      let mut s = self.state.borrow_mut();
      if s.closed {
        return Err(ServerError::ConnectionClosed);
      }
      let n = data.len().min(s.sndbuf);
      s.sndbuf -= n;
      s.sent.extend_from_slice(&data[..n]);
      Ok(n)
    }

    fn output(&mut self) -> Result<(), ServerError> {
      self.state.borrow_mut().output_calls += 1;
      Ok(())
    }

    fn close(&mut self) {
      self.state.borrow_mut().closed = true;
    }

    fn send_buffer(&self) -> usize {
      self.state.borrow().sndbuf
    }

    fn recved(&mut self, len: usize) {
      self.state.borrow_mut().recved += len;
    }
  }
}
