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

//! Incremental HTTP/1.1 request parsing.
//!
//! The parser is fed whatever byte fragments the network delivers and keeps
//! not-yet-consumed bytes across calls, so any fragmentation of the input
//! (down to one byte per call) produces the same result.

use std::collections::HashMap;

use crate::error::{ServerError, Status};
use crate::REQUEST_BUFFER_SIZE;

const CONTENT_LENGTH: &str = "CONTENT-LENGTH";
const TRANSFER_ENCODING: &str = "TRANSFER-ENCODING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Put,
  Head,
  Post,
  Send,
  Delete,
  Options,
  #[cfg(feature = "rtsp")]
  Describe,
  #[cfg(feature = "rtsp")]
  Announce,
  #[cfg(feature = "rtsp")]
  Setup,
  #[cfg(feature = "rtsp")]
  Play,
  #[cfg(feature = "rtsp")]
  Pause,
  #[cfg(feature = "rtsp")]
  Teardown,
  #[cfg(feature = "rtsp")]
  GetParameter,
  #[cfg(feature = "rtsp")]
  SetParameter,
  #[cfg(feature = "rtsp")]
  Record,
}

impl Method {
  fn from_token(token: &[u8]) -> Option<Method> {
    Some(match token {
      b"GET" => Method::Get,
      b"PUT" => Method::Put,
      b"HEAD" => Method::Head,
      b"POST" => Method::Post,
      b"SEND" => Method::Send,
      b"DELETE" => Method::Delete,
      b"OPTIONS" => Method::Options,
      #[cfg(feature = "rtsp")]
      b"DESCRIBE" => Method::Describe,
      #[cfg(feature = "rtsp")]
      b"ANNOUNCE" => Method::Announce,
      #[cfg(feature = "rtsp")]
      b"SETUP" => Method::Setup,
      #[cfg(feature = "rtsp")]
      b"PLAY" => Method::Play,
      #[cfg(feature = "rtsp")]
      b"PAUSE" => Method::Pause,
      #[cfg(feature = "rtsp")]
      b"TEARDOWN" => Method::Teardown,
      #[cfg(feature = "rtsp")]
      b"GET_PARAMETER" => Method::GetParameter,
      #[cfg(feature = "rtsp")]
      b"SET_PARAMETER" => Method::SetParameter,
      #[cfg(feature = "rtsp")]
      b"RECORD" => Method::Record,
      _ => return None,
    })
  }

  pub fn has_body(self) -> bool {
    matches!(self, Method::Put | Method::Post | Method::Send)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
  Http10,
  Http11,
  #[cfg(feature = "rtsp")]
  Rtsp10,
}

impl Version {
  fn from_token(token: &[u8]) -> Option<Version> {
    Some(match token {
      b"HTTP/1.0" => Version::Http10,
      b"HTTP/1.1" => Version::Http11,
      #[cfg(feature = "rtsp")]
      b"RTSP/1.0" => Version::Rtsp10,
      _ => return None,
    })
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Version::Http10 => "HTTP/1.0",
      Version::Http11 => "HTTP/1.1",
      #[cfg(feature = "rtsp")]
      Version::Rtsp10 => "RTSP/1.0",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParsingStage {
  RequestLine,
  Headers,
  Body,
  Complete,
}

/// One HTTP request, parsed incrementally from the connection's receive
/// callback.
pub struct Request {
  stage: ParsingStage,
  buf: Vec<u8>,
  read_pos: usize,
  last_body_read: usize,
  body_chunked: bool,
  body_length: usize,
  body_read_in_progress: bool,
  more_body_since_check: bool,
  pub method: Option<Method>,
  pub version: Option<Version>,
  pub path: String,
  /// Header names are uppercased on insertion so lookups are
  /// case-insensitive: `headers["HOST"]`.
  pub headers: HashMap<String, String>,
}

impl Default for Request {
  fn default() -> Self {
    Self::new()
  }
}

/// Returns the line up to the next LF (stripping an optional preceding CR)
/// and the number of bytes consumed including the LF.
fn next_line(data: &[u8]) -> Option<(&[u8], usize)> {
  let lf = data.iter().position(|&b| b == b'\n')?;
  let end = if lf > 0 && data[lf - 1] == b'\r' {
    lf - 1
  } else {
    lf
  };
  Some((&data[..end], lf + 1))
}

fn next_token(data: &[u8], tok: u8) -> Option<&[u8]> {
  let pos = data.iter().position(|&b| b == tok)?;
  Some(&data[..pos])
}

fn parse_header_parts(line: &[u8]) -> Result<(String, String), ServerError> {
  let colon = line
    .iter()
    .position(|&b| b == b':')
    .ok_or(ServerError::InvalidHeader)?;
  let mut name = String::from_utf8_lossy(&line[..colon]).into_owned();
  name.make_ascii_uppercase();
  let value = String::from_utf8_lossy(&line[colon + 1..])
    .trim()
    .to_owned();
  Ok((name, value))
}

impl Request {
  pub fn new() -> Self {
    Self {
      stage: ParsingStage::RequestLine,
      buf: Vec::new(),
      read_pos: 0,
      last_body_read: 0,
      body_chunked: false,
      body_length: 0,
      body_read_in_progress: false,
      more_body_since_check: false,
      method: None,
      version: None,
      path: String::new(),
      headers: HashMap::new(),
    }
  }

  /// Feed a fragment of the request byte stream.
  ///
  /// Returns `Complete` once the request line and headers are in and the
  /// method carries no body, `Partial` while more bytes are expected, and
  /// an error for malformed input. Body bytes are not consumed here; they
  /// stay buffered for [`read_body`](Request::read_body).
  pub fn parse(&mut self, data: &[u8]) -> Result<Status, ServerError> {
    self.append(data)?;

    loop {
      match self.stage {
        ParsingStage::RequestLine => {
          let s = &self.buf[self.read_pos..];
          let Some(method_tok) = next_token(s, b' ') else {
            return Ok(Status::Partial);
          };
          let method =
            Method::from_token(method_tok).ok_or(ServerError::UnknownMethod)?;

          let after_method = &s[method_tok.len() + 1..];
          let Some(path_tok) = next_token(after_method, b' ') else {
            return Ok(Status::Partial);
          };

          let after_path = &after_method[path_tok.len() + 1..];
          let Some((version_tok, consumed)) = next_line(after_path) else {
            // the version string may still be arriving
            return Ok(Status::Partial);
          };
          let version =
            Version::from_token(version_tok).ok_or(ServerError::UnknownVersion)?;

          self.method = Some(method);
          self.version = Some(version);
          self.path = String::from_utf8_lossy(path_tok).into_owned();
          self.read_pos += method_tok.len() + 1 + path_tok.len() + 1 + consumed;
          self.stage = ParsingStage::Headers;
        }
        ParsingStage::Headers => loop {
          let s = &self.buf[self.read_pos..];
          if s.starts_with(b"\r\n") {
            self.read_pos += 2;
            self.stage = ParsingStage::Body;
            break;
          }
          if s.starts_with(b"\n") {
            self.read_pos += 1;
            self.stage = ParsingStage::Body;
            break;
          }
          let Some((line, consumed)) = next_line(s) else {
            return Ok(Status::Partial);
          };
          let (name, value) = parse_header_parts(line)?;
          self.read_pos += consumed;
          self.record_header(name, value)?;
        },
        ParsingStage::Body => {
          let method = self.method.ok_or(ServerError::UnknownMethod)?;
          if !method.has_body() {
            self.stage = ParsingStage::Complete;
            return Ok(Status::Complete);
          }
          if self.body_chunked || self.body_length != 0 {
            self.more_body_since_check = true;
            return Ok(Status::Partial);
          }
          // body-bearing method with a zero-length body
          self.stage = ParsingStage::Complete;
          return Ok(Status::Complete);
        }
        ParsingStage::Complete => {
          // pipelining is not supported
          return Err(ServerError::UnexpectedData);
        }
      }
    }
  }

  fn append(&mut self, data: &[u8]) -> Result<(), ServerError> {
    if self.buf.len() + data.len() > REQUEST_BUFFER_SIZE {
      return Err(ServerError::RequestBufferFull);
    }
    self.buf.extend_from_slice(data);
    Ok(())
  }

  fn record_header(
    &mut self,
    name: String,
    value: String,
  ) -> Result<(), ServerError> {
    // if there is a body, gather how it is encoded
    if self.method.map(Method::has_body).unwrap_or(false) {
      if name == CONTENT_LENGTH {
        self.body_length =
          value.parse().map_err(|_| ServerError::InvalidHeader)?;
      } else if name == TRANSFER_ENCODING && value.eq_ignore_ascii_case("chunked")
      {
        self.body_chunked = true;
      }
    }

    self.headers.insert(name, value);
    Ok(())
  }

  pub fn received_all_headers(&self) -> bool {
    matches!(self.stage, ParsingStage::Body | ParsingStage::Complete)
  }

  /// True if the request is ready for processing, or more body data has
  /// arrived since the last time this was called. The more-body signal is
  /// cleared by the call.
  pub fn take_ready_for_processing(&mut self) -> bool {
    if self.stage == ParsingStage::Body && self.more_body_since_check {
      self.more_body_since_check = false;
      return true;
    }
    self.stage == ParsingStage::Complete
  }

  /// Remaining declared body bytes (current chunk for chunked bodies).
  pub fn body_length(&self) -> usize {
    self.body_length
  }

  pub fn is_body_read_in_progress(&self) -> bool {
    self.body_read_in_progress
  }

  /// Drain buffered body bytes into `dst`.
  ///
  /// Returns `Complete` with the byte count once the whole body has been
  /// delivered, `Partial` while more is expected. Calling this on a request
  /// that declared no body is an error.
  pub fn read_body(
    &mut self,
    dst: &mut [u8],
  ) -> Result<(Status, usize), ServerError> {
    if self.body_length == 0 && !self.body_chunked {
      return Err(ServerError::NoBody);
    }

    let mut written = 0;
    loop {
      // a chunked body starts each chunk with its size in hex and a line end
      if self.body_length == 0 && self.body_chunked {
        let Some((line, consumed)) = next_line(&self.buf[self.read_pos..])
        else {
          return self.body_partial(written);
        };
        let size = usize::from_str_radix(
          String::from_utf8_lossy(line).trim(),
          16,
        )
        .map_err(|_| ServerError::InvalidChunkSize)?;
        self.read_pos += consumed;
        self.body_length = size;
        if size == 0 {
          if self.buf[self.read_pos..].starts_with(b"\r\n") {
            self.read_pos += 2;
          }
          self.body_chunked = false;
          return self.body_complete(written);
        }
      }

      let avail = self.buf.len() - self.read_pos;
      if avail == 0 {
        return self.body_partial(written);
      }
      let space = dst.len() - written;
      if space == 0 {
        return self.body_partial(written);
      }

      let n = self.body_length.min(avail).min(space);
      dst[written..written + n]
        .copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
      self.read_pos += n;
      self.body_length -= n;
      written += n;

      if self.body_length == 0 {
        if self.body_chunked {
          // consume the chunk's trailing line end and try the next size
          // line in the same call
          if let Some((_, consumed)) = next_line(&self.buf[self.read_pos..]) {
            self.read_pos += consumed;
            continue;
          }
          return self.body_partial(written);
        }
        return self.body_complete(written);
      }
    }
  }

  fn body_partial(
    &mut self,
    written: usize,
  ) -> Result<(Status, usize), ServerError> {
    self.reclaim_drained();
    self.last_body_read = written;
    self.body_read_in_progress = true;
    Ok((Status::Partial, written))
  }

  fn body_complete(
    &mut self,
    written: usize,
  ) -> Result<(Status, usize), ServerError> {
    self.reclaim_drained();
    self.last_body_read = written;
    self.body_read_in_progress = false;
    self.stage = ParsingStage::Complete;
    Ok((Status::Complete, written))
  }

  fn reclaim_drained(&mut self) {
    if self.read_pos == self.buf.len() {
      self.buf.clear();
      self.read_pos = 0;
    }
  }

  /// Rewind the read cursor by the byte count delivered by the most recent
  /// [`read_body`](Request::read_body), so a handler that failed mid-body
  /// can retry.
  pub fn un_read_body(&mut self) -> Result<(), ServerError> {
    if self.read_pos <= self.last_body_read {
      return Err(ServerError::RewindOutOfRange);
    }
    self.read_pos -= self.last_body_read;
    self.body_length += self.last_body_read;
    self.last_body_read = 0;
    Ok(())
  }

  pub fn reset(&mut self) {
    self.stage = ParsingStage::RequestLine;
    self.buf.clear();
    self.read_pos = 0;
    self.last_body_read = 0;
    self.body_chunked = false;
    self.body_length = 0;
    self.body_read_in_progress = false;
    self.more_body_since_check = false;
    self.method = None;
    self.version = None;
    self.path.clear();
    self.headers.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn method_tokens() {
    assert_eq!(Method::from_token(b"GET"), Some(Method::Get));
    assert_eq!(Method::from_token(b"PUT"), Some(Method::Put));
    assert_eq!(Method::from_token(b"HEAD"), Some(Method::Head));
    assert_eq!(Method::from_token(b"POST"), Some(Method::Post));
    assert_eq!(Method::from_token(b"SEND"), Some(Method::Send));
    assert_eq!(Method::from_token(b"DELETE"), Some(Method::Delete));
    assert_eq!(Method::from_token(b"OPTIONS"), Some(Method::Options));
    assert_eq!(Method::from_token(b"BREW"), None);
  }

  #[test]
  fn full_request_get() {
    let mut r = Request::new();
    let result = r.parse(b"GET /abc HTTP/1.1\r\nHost: hello\r\n\r\n").unwrap();
    assert_eq!(result, Status::Complete);
    assert_eq!(r.method, Some(Method::Get));
    assert_eq!(r.version, Some(Version::Http11));
    assert_eq!(r.path, "/abc");
    assert_eq!(r.headers["HOST"], "hello");
  }

  #[test]
  fn request_get_one_byte_at_a_time() {
    let mut r = Request::new();
    let req = b"GET /abc HTTP/1.1\r\nHost: hello\r\n\r\n";
    for (i, b) in req.iter().enumerate() {
      let result = r.parse(std::slice::from_ref(b)).unwrap();
      if i + 1 < req.len() {
        assert_eq!(result, Status::Partial, "byte {}", i);
      } else {
        assert_eq!(result, Status::Complete);
      }
    }
    assert_eq!(r.method, Some(Method::Get));
    assert_eq!(r.headers["HOST"], "hello");
    assert_eq!(r.path, "/abc");
  }

  #[test]
  fn full_request_post_body_content_length() {
    let mut r = Request::new();
    let result = r
      .parse(b"POST /abc HTTP/1.1\r\nHost: hello\r\nContent-Length: 4\r\n\r\nTest")
      .unwrap();
    assert_eq!(result, Status::Partial);
    assert_eq!(r.method, Some(Method::Post));
    assert_eq!(r.path, "/abc");
    assert_eq!(r.body_length(), 4);

    let mut buffer = [0u8; 20];
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!(status, Status::Complete);
    assert_eq!(&buffer[..n], b"Test");
  }

  #[test]
  fn full_request_post_body_chunked() {
    let mut r = Request::new();
    let result = r
      .parse(
        b"POST /abc HTTP/1.1\r\nHost: hello\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nTest\r\n0\r\n\r\n",
      )
      .unwrap();
    assert_eq!(result, Status::Partial);
    assert_eq!(r.method, Some(Method::Post));
    assert_eq!(r.path, "/abc");

    let mut buffer = [0u8; 20];
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!(status, Status::Complete);
    assert_eq!(&buffer[..n], b"Test");
  }

  #[test]
  fn chunked_body_multiple_chunks_round_trip() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
      .unwrap();
    r.parse(b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n").unwrap();

    let mut buffer = [0u8; 64];
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!(status, Status::Complete);
    assert_eq!(&buffer[..n], b"Hello World");
  }

  #[test]
  fn chunked_body_arriving_in_fragments() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
      .unwrap();

    let mut collected = Vec::new();
    let mut buffer = [0u8; 64];
    for frag in [&b"5\r\nHel"[..], b"lo\r\n3", b"\r\nabc\r\n0\r\n\r\n"] {
      r.parse(frag).unwrap();
      let (status, n) = r.read_body(&mut buffer).unwrap();
      collected.extend_from_slice(&buffer[..n]);
      if status == Status::Complete {
        break;
      }
    }
    assert_eq!(collected, b"Helloabc");
  }

  #[test]
  fn body_read_into_small_buffer() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcdefgh")
      .unwrap();
    let mut buffer = [0u8; 3];
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!((status, n), (Status::Partial, 3));
    assert_eq!(&buffer, b"abc");
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!((status, n), (Status::Partial, 3));
    assert_eq!(&buffer, b"def");
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!((status, n), (Status::Complete, 2));
    assert_eq!(&buffer[..n], b"gh");
  }

  #[test]
  fn un_read_body_rewinds_last_read() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nContent-Length: 4\r\n\r\nTest")
      .unwrap();
    let mut buffer = [0u8; 2];
    let (_, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!(&buffer[..n], b"Te");
    r.un_read_body().unwrap();
    let mut buffer = [0u8; 8];
    let (status, n) = r.read_body(&mut buffer).unwrap();
    assert_eq!(status, Status::Complete);
    assert_eq!(&buffer[..n], b"Test");
  }

  #[test]
  fn un_read_body_rejected_after_drain() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nContent-Length: 4\r\n\r\nTest")
      .unwrap();
    let mut buffer = [0u8; 8];
    r.read_body(&mut buffer).unwrap();
    // the buffer was fully drained and reclaimed
    assert!(r.un_read_body().is_err());
  }

  #[test]
  fn read_body_without_declared_body_is_an_error() {
    let mut r = Request::new();
    r.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let mut buffer = [0u8; 8];
    assert!(r.read_body(&mut buffer).is_err());
  }

  #[test]
  fn unknown_method_is_an_error() {
    let mut r = Request::new();
    assert!(r.parse(b"BREW /pot HTTP/1.1\r\n").is_err());
  }

  #[test]
  fn unknown_version_is_an_error() {
    let mut r = Request::new();
    assert!(r.parse(b"GET / HTTP/2.5\r\n").is_err());
  }

  #[test]
  fn header_case_folding() {
    let mut r = Request::new();
    r.parse(b"GET / HTTP/1.1\r\nx-CuStOm-Header: VaLue 42\r\n\r\n")
      .unwrap();
    assert_eq!(r.headers["X-CUSTOM-HEADER"], "VaLue 42");
  }

  #[test]
  fn buffer_growth_cap() {
    let mut r = Request::new();
    let flood = vec![b'a'; REQUEST_BUFFER_SIZE + 1];
    assert!(r.parse(&flood).is_err());
  }

  #[test]
  fn fragmentation_independence() {
    let req = b"POST /abc HTTP/1.1\r\nHost: hello\r\nContent-Length: 4\r\n\r\nTest";
    for step in [1usize, 2, 3, 7, req.len()] {
      let mut r = Request::new();
      for chunk in req.chunks(step) {
        r.parse(chunk).unwrap();
      }
      assert_eq!(r.method, Some(Method::Post), "step {}", step);
      assert_eq!(r.path, "/abc");
      assert_eq!(r.headers["HOST"], "hello");
      let mut buffer = [0u8; 8];
      let (status, n) = r.read_body(&mut buffer).unwrap();
      assert_eq!(status, Status::Complete);
      assert_eq!(&buffer[..n], b"Test");
    }
  }

  #[test]
  fn ready_for_processing_clears_body_signal() {
    let mut r = Request::new();
    r.parse(b"POST /u HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcd")
      .unwrap();
    assert!(r.take_ready_for_processing());
    // signal consumed until more body data arrives
    assert!(!r.take_ready_for_processing());
    r.parse(b"efgh").unwrap();
    assert!(r.take_ready_for_processing());
  }

  #[cfg(feature = "rtsp")]
  #[test]
  fn rtsp_request_line() {
    let mut r = Request::new();
    let result = r
      .parse(b"DESCRIBE rtsp://172.21.0.120:80 RTSP/1.0\r\nCSeq: 1\r\n\r\n")
      .unwrap();
    assert_eq!(result, Status::Complete);
    assert_eq!(r.method, Some(Method::Describe));
    assert_eq!(r.version, Some(Version::Rtsp10));
    assert_eq!(r.body_length(), 0);
    assert!(r.take_ready_for_processing());
  }
}
