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

//! Request routing and connection management.

use std::collections::HashMap;

use log::{debug, info};

use crate::connection::ServerConnection;
use crate::request::{Request, Version};
use crate::response::{ConnectionMode, Response, StatusCode};
use crate::{KEEPALIVE_TIMEOUT_SECS, MAX_CLIENT_CONNECTIONS};

/// A request handler. Handlers write their reply through the [`Response`];
/// whatever is left unflushed when they return is finalized by the router.
pub type RequestHandler = Box<dyn FnMut(&mut Request, &mut Response)>;

fn internal_default_handler(_req: &mut Request, resp: &mut Response) {
  let html = "<html><body> path was not found</body></html>";
  resp.write_header(StatusCode::NotFound);
  resp.write_header_raw("Content-Type: text/html");
  let _ = resp.write(html.as_bytes());
}

/// Owns the fixed pool of connections and dispatches complete requests to
/// handlers by exact path match.
pub struct Router {
  handlers: HashMap<String, RequestHandler>,
  default_handler: RequestHandler,
  pub(crate) connections: Vec<ServerConnection>,
  last_in_use: usize,
}

impl Default for Router {
  fn default() -> Self {
    Self::new()
  }
}

impl Router {
  pub fn new() -> Self {
    Self::with_pool_size(MAX_CLIENT_CONNECTIONS)
  }

  pub fn with_pool_size(size: usize) -> Self {
    Self {
      handlers: HashMap::new(),
      default_handler: Box::new(internal_default_handler),
      connections: (0..size).map(ServerConnection::new).collect(),
      last_in_use: 0,
    }
  }

  /// Map a URL path to a handler.
  pub fn add_handler<H>(&mut self, path: impl Into<String>, handler: H)
  where
    H: FnMut(&mut Request, &mut Response) + 'static,
  {
    self.handlers.insert(path.into(), Box::new(handler));
  }

  /// Handler used when no path matches; `None` restores the built-in 404.
  pub fn set_default_handler(&mut self, handler: Option<RequestHandler>) {
    self.default_handler =
      handler.unwrap_or_else(|| Box::new(internal_default_handler));
  }

  /// Index of a free pool slot, if any.
  pub fn free_connection(&mut self) -> Option<usize> {
    self.connections.iter().position(|c| !c.is_connected())
  }

  pub fn connections_in_use(&self) -> usize {
    self.connections.iter().filter(|c| c.is_connected()).count()
  }

  /// Dispatch ready requests and reap idle keep-alive connections. Called
  /// from the application's main loop with the monotonic time in seconds.
  pub fn process(&mut self, now: u32) {
    let in_use = self.connections_in_use();
    if in_use != self.last_in_use {
      info!("{in_use} connections in use");
      self.last_in_use = in_use;
    }

    for i in 0..self.connections.len() {
      if !self.connections[i].is_connected() {
        continue;
      }

      if self.connections[i].request.take_ready_for_processing() {
        // the request is parked outside the connection while the response
        // borrows it
        let mut request = std::mem::take(&mut self.connections[i].request);

        let keep_alive = Self::wants_keep_alive(&request);
        let version = request.version.unwrap_or(Version::Http11);
        let path = request.path.clone();

        let body_in_progress;
        let close_after;
        let response_size;
        {
          let conn = &mut self.connections[i];
          let mut resp = Response::new(conn, keep_alive, version);
          match self.handlers.get_mut(&path) {
            Some(handler) => handler(&mut request, &mut resp),
            None => (self.default_handler)(&mut request, &mut resp),
          }

          body_in_progress = request.is_body_read_in_progress();
          if !body_in_progress {
            if let Err(e) = resp.finalize() {
              debug!("finalize failed: {e}");
            }
          }
          close_after = resp.connection_mode() == ConnectionMode::Close;
          response_size = resp.response_size_sent();
        }

        let conn = &mut self.connections[i];
        if !body_in_progress {
          request.reset();
          conn.last_request_time = now;
          if close_after {
            // close when the final response byte is acked
            conn.close_once_sent = response_size;
          }
        }
        conn.request = request;
      } else {
        let conn = &mut self.connections[i];
        if !conn.hijacked
          && conn.last_request_time != 0
          && now.saturating_sub(conn.last_request_time) > KEEPALIVE_TIMEOUT_SECS
        {
          info!("closing idle http connection on slot {i}");
          conn.close();
        }
      }
    }
  }

  fn wants_keep_alive(request: &Request) -> bool {
    #[cfg(feature = "rtsp")]
    if request.version == Some(Version::Rtsp10) {
      // RTSP is keep-alive by default
      return true;
    }
    request
      .headers
      .get("CONNECTION")
      .map(|v| v.eq_ignore_ascii_case("keep-alive"))
      .unwrap_or(false)
  }
}
