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

//! RFC 6455 frame decode and encode.
//!
//! Decoding works against a framer's ring buffer and is atomic: a frame
//! whose bytes have not fully arrived leaves the read cursor untouched so
//! the same bytes are retried after the next receive callback.

use crate::buffer::RingBuffer;
use crate::connection::ServerConnection;
use crate::error::ServerError;
use crate::mask::unmask;
use crate::tcp::WRITE_FLAG_NO_FLUSH;

pub const FLAG_FIN: u8 = 0x80;
pub const FLAG_MASK: u8 = 0x80;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
  Continuation = 0x0,
  Text = 0x1,
  Binary = 0x2,
  Close = 0x8,
  Ping = 0x9,
  Pong = 0xA,
}

impl OpCode {
  pub fn is_control(self) -> bool {
    matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
  }
}

impl TryFrom<u8> for OpCode {
  type Error = ServerError;

  fn try_from(value: u8) -> Result<Self, Self::Error> {
    Ok(match value {
      0x0 => OpCode::Continuation,
      0x1 => OpCode::Text,
      0x2 => OpCode::Binary,
      0x8 => OpCode::Close,
      0x9 => OpCode::Ping,
      0xA => OpCode::Pong,
      _ => return Err(ServerError::InvalidOpCode(value)),
    })
  }
}

/// Decoded view of one frame; the payload lives in the caller's buffer,
/// already unmasked.
pub struct Frame<'a> {
  pub fin: bool,
  pub opcode: OpCode,
  pub payload: &'a [u8],
}

impl Frame<'_> {
  pub fn is_utf8(&self) -> bool {
    #[cfg(feature = "simd")]
    {
      simdutf8::basic::from_utf8(self.payload).is_ok()
    }
    #[cfg(not(feature = "simd"))]
    {
      std::str::from_utf8(self.payload).is_ok()
    }
  }
}

/// Decode one client frame out of `ring` into `payload_buf`.
///
/// Returns `Ok(None)` when the ring holds less than a complete frame; the
/// read cursor is restored so the decode can be retried. Protocol
/// violations (reserved bits, unknown opcodes, unmasked payloads, lengths
/// this implementation does not speak) are errors.
pub(crate) fn decode<'a>(
  ring: &mut RingBuffer,
  payload_buf: &'a mut [u8],
) -> Result<Option<Frame<'a>>, ServerError> {
  ring.mark();

  let mut head = [0u8; 2];
  if ring.get(&mut head).is_err() {
    ring.rewind();
    return Ok(None);
  }

  let fin = head[0] & FLAG_FIN != 0;
  if head[0] & 0x70 != 0 {
    return Err(ServerError::ReservedBitsNotZero);
  }
  let opcode = OpCode::try_from(head[0] & 0x0F)?;

  let masked = head[1] & FLAG_MASK != 0;
  let mut payload_len = (head[1] & 0x7F) as usize;
  if payload_len == 126 {
    let mut ext = [0u8; 2];
    if ring.get(&mut ext).is_err() {
      ring.rewind();
      return Ok(None);
    }
    payload_len = u16::from_be_bytes(ext) as usize;
  } else if payload_len == 127 {
    // 64-bit lengths are out of scope
    return Err(ServerError::FrameTooLarge);
  }

  if opcode.is_control() && !fin {
    return Err(ServerError::ControlFrameFragmented);
  }
  if !masked {
    return Err(ServerError::UnmaskedClientFrame);
  }
  if payload_len > payload_buf.len() {
    return Err(ServerError::FrameTooLarge);
  }

  let mut mask = [0u8; 4];
  if ring.get(&mut mask).is_err() {
    ring.rewind();
    return Ok(None);
  }

  if ring.len() < payload_len {
    ring.rewind();
    return Ok(None);
  }
  ring.get(&mut payload_buf[..payload_len])?;
  unmask(&mut payload_buf[..payload_len], mask);

  Ok(Some(Frame {
    fin,
    opcode,
    payload: &payload_buf[..payload_len],
  }))
}

/// Encode and submit one server frame: FIN set, no mask, 7- or 16-bit
/// length. `header_extra` rides between the header and the payload (the
/// close code, for close frames).
///
/// Refuses payloads the length encoding cannot carry and writes the
/// transport cannot take in one pass.
pub(crate) fn write_frame(
  conn: &mut ServerConnection,
  opcode: OpCode,
  header_extra: &[u8],
  payload: &[u8],
) -> Result<(), ServerError> {
  let total = header_extra.len() + payload.len();
  if total > u16::MAX as usize {
    return Err(ServerError::FrameTooLarge);
  }

  let mut head = [0u8; 4];
  head[0] = FLAG_FIN | opcode as u8;
  let head_len = if total <= 125 {
    head[1] = total as u8;
    2
  } else {
    head[1] = 126;
    head[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    4
  };

  if conn.available_send_buffer() < head_len + total {
    return Err(ServerError::SendBufferFull);
  }

  let parts: [&[u8]; 3] = [&head[..head_len], header_extra, payload];
  let last = parts
    .iter()
    .rposition(|p| !p.is_empty())
    .unwrap_or(0);
  for (i, part) in parts.iter().enumerate() {
    if part.is_empty() && i != last {
      continue;
    }
    let flags = if i < last { WRITE_FLAG_NO_FLUSH } else { 0 };
    if !conn.write_data(part, flags) {
      return Err(ServerError::WriteFailed);
    }
  }
  Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
  /// Build a masked client frame the way a browser would send it.
  pub fn client_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut out = Vec::new();
    out.push(if fin { 0x80 } else { 0 } | opcode);
    if payload.len() <= 125 {
      out.push(0x80 | payload.len() as u8);
    } else {
      out.push(0x80 | 126);
      out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    out.extend_from_slice(&mask);
    out.extend(
      payload
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ mask[i % 4]),
    );
    out
  }
}
