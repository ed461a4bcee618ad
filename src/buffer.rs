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

use crate::error::ServerError;

/// Fixed-capacity byte ring with a restorable read cursor.
///
/// The WebSocket receive path decodes frames directly out of this buffer;
/// `mark`/`rewind` make a failed decode atomic: if a frame turns out to be
/// incomplete, the read cursor snaps back and the bytes are re-read once
/// more data has arrived.
pub struct RingBuffer {
  buf: Box<[u8]>,
  head: usize,
  tail: usize,
  len: usize,
  mark: Option<(usize, usize)>,
}

impl RingBuffer {
  pub fn new(capacity: usize) -> Self {
    Self {
      buf: vec![0u8; capacity].into_boxed_slice(),
      head: 0,
      tail: 0,
      len: 0,
      mark: None,
    }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn free_space(&self) -> usize {
    self.buf.len() - self.len
  }

  /// Append bytes at the head.
  pub fn put(&mut self, data: &[u8]) -> Result<(), ServerError> {
    if self.free_space() < data.len() {
      return Err(ServerError::BufferFull);
    }
    // a put invalidates any saved read cursor
    self.mark = None;
    let cap = self.buf.len();
    let first = data.len().min(cap - self.head);
    self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
    let rest = data.len() - first;
    self.buf[..rest].copy_from_slice(&data[first..]);
    self.head = (self.head + data.len()) % cap;
    self.len += data.len();
    Ok(())
  }

  /// Copy out exactly `dst.len()` bytes from the tail.
  pub fn get(&mut self, dst: &mut [u8]) -> Result<(), ServerError> {
    if self.len < dst.len() {
      return Err(ServerError::InsufficientData);
    }
    let cap = self.buf.len();
    let first = dst.len().min(cap - self.tail);
    dst[..first].copy_from_slice(&self.buf[self.tail..self.tail + first]);
    let rest = dst.len() - first;
    dst[first..].copy_from_slice(&self.buf[..rest]);
    self.tail = (self.tail + dst.len()) % cap;
    self.len -= dst.len();
    Ok(())
  }

  /// Next readable byte without moving the cursor.
  pub fn peek(&self) -> Option<u8> {
    if self.len == 0 {
      None
    } else {
      Some(self.buf[self.tail])
    }
  }

  /// Advance the read cursor without copying.
  pub fn discard(&mut self, n: usize) -> Result<(), ServerError> {
    if self.len < n {
      return Err(ServerError::InsufficientData);
    }
    self.tail = (self.tail + n) % self.buf.len();
    self.len -= n;
    Ok(())
  }

  /// Save the read cursor. A later [`rewind`](RingBuffer::rewind) restores
  /// it; a `put` invalidates the mark.
  pub fn mark(&mut self) {
    self.mark = Some((self.tail, self.len));
  }

  /// Restore the read cursor to the last mark, if one is still valid.
  pub fn rewind(&mut self) {
    if let Some((tail, len)) = self.mark.take() {
      self.tail = tail;
      self.len = len;
    }
  }

  pub fn reset(&mut self) {
    self.head = 0;
    self.tail = 0;
    self.len = 0;
    self.mark = None;
  }
}
