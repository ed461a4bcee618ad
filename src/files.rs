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

//! Serving assets compiled into the binary.

use std::collections::HashMap;

use crate::request::Request;
use crate::response::{Response, StatusCode};

/// Gzip-compressed content; requires the client to accept `gzip`.
pub const FILE_FLAG_GZIP: u8 = 0x80;
/// Low bits of the flags byte index the content-type table.
pub const FILE_TYPE_MASK: u8 = 0x3F;

/// One in-memory asset.
pub struct EmbeddedFile {
  pub content: &'static [u8],
  pub file_name: &'static str,
  /// Low 6 bits: content-type table index. Top bit: gzip.
  pub flags: u8,
}

/// Content-type table entry, indexed by the low bits of a file's flags.
pub struct EmbeddedFileType {
  pub name: &'static str,
}

/// Stateless path → asset map with content-type and gzip negotiation.
pub struct EmbeddedFiles {
  file_map: HashMap<&'static str, &'static EmbeddedFile>,
  file_types: &'static [EmbeddedFileType],
}

impl EmbeddedFiles {
  /// Intended to be fed from a build-time asset generator.
  pub fn new(
    files: &'static [EmbeddedFile],
    types: &'static [EmbeddedFileType],
  ) -> Self {
    let mut file_map = HashMap::new();
    for f in files {
      file_map.insert(f.file_name, f);
    }
    Self {
      file_map,
      file_types: types,
    }
  }

  pub fn handle(&self, req: &mut Request, resp: &mut Response) {
    let Some(f) = self.file_map.get(req.path.as_str()) else {
      resp.write_header(StatusCode::NotFound);
      let _ = resp.write(b"the path was not found");
      return;
    };

    if f.flags & FILE_FLAG_GZIP != 0 {
      let accepts_gzip = req
        .headers
        .get("ACCEPT-ENCODING")
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
      if accepts_gzip {
        resp.write_header_raw("Content-Encoding: gzip");
      } else {
        resp.write_header(StatusCode::InternalServerError);
        let _ = resp.write(b"compression support required for this file");
        return;
      }
    }

    let type_index = (f.flags & FILE_TYPE_MASK) as usize;
    if let Some(t) = self.file_types.get(type_index) {
      resp.write_header_line("Content-Type", t.name);
    }
    resp.add_content_length_header(f.content.len());
    let _ = resp.write_direct(f.content);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::ServerConnection;
  use crate::request::Version;
  use crate::tcp::mock::MockSocket;
  use crate::transport::Transport;

  static TYPES: &[EmbeddedFileType] = &[
    EmbeddedFileType { name: "text/html" },
    EmbeddedFileType {
      name: "application/javascript",
    },
  ];

  static FILES: &[EmbeddedFile] = &[
    EmbeddedFile {
      content: b"<html>index</html>",
      file_name: "/index.html",
      flags: 0,
    },
    EmbeddedFile {
      content: b"\x1f\x8b fake gzip bytes",
      file_name: "/app.js",
      flags: FILE_FLAG_GZIP | 1,
    },
  ];

  fn serve(raw_request: &[u8]) -> String {
    let (sock, state) = MockSocket::unbounded();
    let mut conn = ServerConnection::new(0);
    conn.bind(Transport::Tcp(Box::new(sock)));

    let mut req = Request::new();
    req.parse(raw_request).unwrap();

    let files = EmbeddedFiles::new(FILES, TYPES);
    let mut resp = Response::new(&mut conn, true, Version::Http11);
    files.handle(&mut req, &mut resp);
    resp.finalize().unwrap();

    let sent = state.borrow().sent.clone();
    String::from_utf8_lossy(&sent).into_owned()
  }

  #[test]
  fn serves_plain_asset_with_content_type() {
    let out = serve(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Type: text/html\r\n"));
    assert!(out.contains("Content-Length: 18\r\n"));
    assert!(out.ends_with("<html>index</html>"));
  }

  #[test]
  fn gzip_asset_negotiates_encoding() {
    let out =
      serve(b"GET /app.js HTTP/1.1\r\nAccept-Encoding: deflate, gzip\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.contains("Content-Encoding: gzip\r\n"));
    assert!(out.contains("Content-Type: application/javascript\r\n"));
  }

  #[test]
  fn gzip_asset_without_acceptance_fails() {
    let out = serve(b"GET /app.js HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(out.contains("compression support required"));
  }

  #[test]
  fn unknown_path_is_not_found() {
    let out = serve(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
  }
}
