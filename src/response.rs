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

//! HTTP/1.1 response generation in a single fixed buffer.
//!
//! The buffer is split into a forward header region and a body region that
//! starts at a reserved offset. The body start can additionally move *left*
//! to prepend bytes between the final header line and the first body byte:
//! chunked transfer needs each chunk prefixed with `<hex-size>\r\n`, and
//! writing the body first lets the size be computed without a second
//! buffer. After the first flush the header region is no longer needed and
//! body writes get almost the whole buffer.

use std::any::Any;
use std::ops::Range;

use crate::connection::ServerConnection;
use crate::error::ServerError;
use crate::request::Version;
use crate::tcp::WRITE_FLAG_ZERO_COPY;
use crate::{RESPONSE_BUFFER_SIZE, RESPONSE_HEADERS_RESERVED};

const EOL: &[u8] = b"\r\n";
// max hex chunk-size digits + line end
const CHUNK_PREFIX_RESERVE: usize = 20 + EOL.len();

const KEEP_ALIVE_HEADER: &str = "Keep-Alive: timeout=15, max=1000";
const CONNECTION_CLOSE_HEADER: &str = "Connection: close";
const CONNECTION_UPGRADE_HEADER: &str = "Connection: Upgrade";
const CHUNKED_TRANSFER_HEADER: &str = "Transfer-Encoding: chunked";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
  Ok,
  SwitchingProtocol,
  NotFound,
  BadRequest,
  InternalServerError,
}

impl StatusCode {
  fn as_str(self) -> &'static str {
    match self {
      StatusCode::Ok => "200 OK",
      StatusCode::SwitchingProtocol => "101 Switching Protocols",
      StatusCode::NotFound => "404 Not Found",
      StatusCode::BadRequest => "400 Bad Request",
      StatusCode::InternalServerError => "500 Internal Server Error",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
  KeepAlive,
  Upgrade,
  Close,
}

fn to_ascii(mut value: usize, out: &mut [u8], base: usize) -> usize {
  const LOOKUP: &[u8; 16] = b"0123456789ABCDEF";
  let mut tmp = [0u8; 20];
  let mut i = tmp.len();
  loop {
    i -= 1;
    tmp[i] = LOOKUP[value % base];
    value /= base;
    if value == 0 {
      break;
    }
  }
  let n = tmp.len() - i;
  out[..n].copy_from_slice(&tmp[i..]);
  n
}

/// One HTTP response, built on the stack of the dispatch loop.
pub struct Response<'a> {
  conn: &'a mut ServerConnection,
  buf: [u8; RESPONSE_BUFFER_SIZE],
  header_pos: usize,
  body_start: usize,
  body_pos: usize,
  total_sent: usize,
  headers_sent: bool,
  status_written: bool,
  chunked: bool,
  version: Version,
  mode: ConnectionMode,
}

impl<'a> Response<'a> {
  pub fn new(
    conn: &'a mut ServerConnection,
    keep_alive: bool,
    version: Version,
  ) -> Self {
    Self {
      conn,
      buf: [0u8; RESPONSE_BUFFER_SIZE],
      header_pos: 0,
      body_start: RESPONSE_HEADERS_RESERVED,
      body_pos: RESPONSE_HEADERS_RESERVED,
      total_sent: 0,
      headers_sent: false,
      status_written: false,
      chunked: true,
      version,
      mode: if keep_alive {
        ConnectionMode::KeepAlive
      } else {
        ConnectionMode::Close
      },
    }
  }

  fn append_headers(&mut self, data: &[u8]) -> bool {
    if self.header_pos + data.len() >= self.body_start {
      // out of header space; while no body bytes are buffered the body
      // start can simply move right
      if self.body_pos == self.body_start
        && self.header_pos + data.len() < RESPONSE_BUFFER_SIZE
      {
        self.body_start += data.len();
        self.body_pos = self.body_start;
      } else {
        return false;
      }
    }
    self.buf[self.header_pos..self.header_pos + data.len()]
      .copy_from_slice(data);
    self.header_pos += data.len();
    true
  }

  fn append_headers_eol(&mut self) -> bool {
    self.append_headers(EOL)
  }

  /// Prepend into the reserved space between headers and body; each call
  /// moves the body start further left.
  fn append_body_prefix(&mut self, data: &[u8]) -> bool {
    let Some(new_start) = self.body_start.checked_sub(data.len()) else {
      return false;
    };
    if new_start <= self.header_pos {
      return false;
    }
    self.body_start = new_start;
    self.buf[new_start..new_start + data.len()].copy_from_slice(data);
    true
  }

  fn append_body(&mut self, data: &[u8]) -> bool {
    if self.body_pos + data.len() > RESPONSE_BUFFER_SIZE {
      return false;
    }
    self.buf[self.body_pos..self.body_pos + data.len()].copy_from_slice(data);
    self.body_pos += data.len();
    true
  }

  fn network_write(&mut self, range: Range<usize>) -> Result<(), ServerError> {
    if range.is_empty() {
      return Ok(());
    }
    let len = range.len();
    if self.conn.write_data(&self.buf[range], 0) {
      self.total_sent += len;
      Ok(())
    } else {
      Err(ServerError::WriteFailed)
    }
  }

  fn ensure_status_written(&mut self) -> bool {
    if !self.status_written {
      return self.write_header(StatusCode::Ok);
    }
    true
  }

  /// Write the status line. Implicitly `200 OK` if `write` is called
  /// first; can only be done once.
  pub fn write_header(&mut self, status: StatusCode) -> bool {
    if self.headers_sent || self.status_written {
      return false;
    }
    self.status_written = true;
    self.append_headers(self.version.as_str().as_bytes())
      && self.append_headers(b" ")
      && self.append_headers(status.as_str().as_bytes())
      && self.append_headers_eol()
  }

  /// Append a pre-formatted header line (without the line end). Ignored
  /// once the headers are on the wire.
  pub fn write_header_raw(&mut self, line: &str) -> bool {
    if self.headers_sent {
      return false;
    }
    self.ensure_status_written()
      && self.append_headers(line.as_bytes())
      && self.append_headers_eol()
  }

  /// Append a `name: value` header line. Ignored once the headers are on
  /// the wire.
  pub fn write_header_line(&mut self, name: &str, value: &str) -> bool {
    if self.headers_sent {
      return false;
    }
    self.ensure_status_written()
      && self.append_headers(name.as_bytes())
      && self.append_headers(b": ")
      && self.append_headers(value.as_bytes())
      && self.append_headers_eol()
  }

  /// Declare the body length up front and disable chunked transfer. Don't
  /// call this more than once.
  pub fn add_content_length_header(&mut self, length: usize) {
    if self.headers_sent {
      return;
    }
    self.ensure_status_written();
    let mut digits = [0u8; 20];
    let n = to_ascii(length, &mut digits, 10);
    self.append_headers(b"Content-Length: ");
    self.append_headers(&digits[..n]);
    self.append_headers_eol();
    self.chunked = false;
  }

  /// Buffer body bytes, flushing a chunk whenever the body region fills.
  pub fn write(&mut self, data: &[u8]) -> Result<usize, ServerError> {
    self.ensure_status_written();

    let mut remaining = data;
    while !remaining.is_empty() {
      let mut avail = RESPONSE_BUFFER_SIZE - self.body_pos;
      if self.chunked {
        // account for the line end each chunk carries
        avail = if avail > EOL.len() { avail - EOL.len() } else { 0 };
      }
      let n = remaining.len().min(avail);
      if n > 0 {
        if !self.append_body(&remaining[..n]) {
          return Err(ServerError::ResponseBufferFull);
        }
        remaining = &remaining[n..];
      }
      if !remaining.is_empty() {
        self.flush_impl(false)?;
      }
    }
    Ok(data.len())
  }

  /// Flush buffered content, then push the caller's bytes through the
  /// transport without copying. Meant for large immutable assets.
  pub fn write_direct(&mut self, data: &[u8]) -> Result<(), ServerError> {
    self.flush_impl(false)?;
    if self.conn.write_data(data, WRITE_FLAG_ZERO_COPY) {
      self.total_sent += data.len();
      Ok(())
    } else {
      Err(ServerError::WriteFailed)
    }
  }

  /// Send headers (first time) and the buffered body as one chunk.
  pub fn flush(&mut self) -> Result<(), ServerError> {
    self.flush_impl(false)
  }

  /// Flush and, for chunked transfer, emit the zero-length terminating
  /// chunk.
  pub fn finalize(&mut self) -> Result<(), ServerError> {
    self.flush_impl(true)
  }

  fn flush_impl(&mut self, finalize: bool) -> Result<(), ServerError> {
    let chunk_size = self.body_pos - self.body_start;

    if !self.headers_sent {
      if finalize && self.chunked {
        // the whole body was buffered: a plain Content-Length beats
        // chunked framing
        self.add_content_length_header(chunk_size);
      } else if self.chunked {
        self.write_header_raw(CHUNKED_TRANSFER_HEADER);
      } else {
        self.ensure_status_written();
      }

      match self.mode {
        ConnectionMode::KeepAlive => self.write_header_raw(KEEP_ALIVE_HEADER),
        ConnectionMode::Close => self.write_header_raw(CONNECTION_CLOSE_HEADER),
        ConnectionMode::Upgrade => {
          self.write_header_raw(CONNECTION_UPGRADE_HEADER)
        }
      };

      if !self.append_headers_eol() {
        return Err(ServerError::ResponseBufferFull);
      }
      self.network_write(0..self.header_pos)?;
      self.headers_sent = true;
    }

    let before = self.body_start;
    if self.chunked {
      let mut prefix = [0u8; CHUNK_PREFIX_RESERVE];
      let n = to_ascii(chunk_size, &mut prefix, 16);
      prefix[n..n + EOL.len()].copy_from_slice(EOL);

      let prefix_len = n + EOL.len();
      if !(self.append_body_prefix(&prefix[..prefix_len])
        && self.append_body(EOL))
      {
        self.body_start = before;
        return Err(ServerError::ResponseBufferFull);
      }

      // the last chunk must always have a zero length
      if chunk_size > 0 && finalize {
        self.write(b"0\r\n\r\n")?;
      }
    }

    match self.network_write(self.body_start..self.body_pos) {
      Ok(()) => {
        // the header reservation is no longer needed once the headers are
        // out; keep just enough room for the next chunk prefix
        self.body_start = CHUNK_PREFIX_RESERVE;
        self.body_pos = CHUNK_PREFIX_RESERVE;
        self.header_pos = 0;
        Ok(())
      }
      Err(e) => {
        if self.chunked {
          self.body_start = before;
        }
        Err(e)
      }
    }
  }

  /// Stop interpreting bytes on this connection as HTTP and hand it to the
  /// caller.
  pub fn hijack_connection(&mut self) -> &mut ServerConnection {
    self.conn.hijacked = true;
    self.conn
  }

  /// Value persisted across keep-alive reuses of the connection; dropped
  /// when the connection closes.
  pub fn set_session_arg(&mut self, arg: Box<dyn Any>) {
    self.conn.set_session_arg(arg);
  }

  pub fn session_arg(&mut self) -> Option<&mut (dyn Any + 'static)> {
    self.conn.session_arg()
  }

  pub fn set_connection_mode(&mut self, mode: ConnectionMode) {
    self.mode = mode;
  }

  pub fn connection_mode(&self) -> ConnectionMode {
    self.mode
  }

  /// Count of bytes handed to the transport for this response.
  pub fn response_size_sent(&self) -> usize {
    self.total_sent
  }
}
