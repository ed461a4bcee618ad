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

use bytes::Bytes;

use crate::error::ServerError;
use crate::tcp::{Pbuf, TcpSocket, WRITE_FLAG_NO_FLUSH};
#[cfg(feature = "tls")]
use crate::tls::TlsSession;

/// Uniform write/shutdown/available interface over plain TCP or TLS.
///
/// Layers above see one byte-stream abstraction; the TLS arm owns the
/// socket together with the record engine so ciphertext never surfaces.
pub(crate) enum Transport {
  Tcp(Box<dyn TcpSocket>),
  #[cfg(feature = "tls")]
  Tls(Box<TlsSession>),
}

impl Transport {
  /// Submit bytes to the stream. Returns how many were accepted.
  pub fn write(&mut self, data: &[u8], flags: u8) -> Result<usize, ServerError> {
    match self {
      Transport::Tcp(sock) => {
        let n = sock.write(data, flags)?;
        if flags & WRITE_FLAG_NO_FLUSH == 0 {
          sock.output()?;
        }
        Ok(n)
      }
      #[cfg(feature = "tls")]
      Transport::Tls(sess) => sess.write_plain(data),
    }
  }

  pub fn shutdown(&mut self) {
    match self {
      Transport::Tcp(sock) => sock.close(),
      #[cfg(feature = "tls")]
      Transport::Tls(sess) => sess.shutdown(),
    }
  }

  pub fn available_send_buffer(&self) -> usize {
    match self {
      Transport::Tcp(sock) => sock.send_buffer(),
      #[cfg(feature = "tls")]
      Transport::Tls(sess) => sess.available_send_buffer(),
    }
  }

  /// Hand an inbound buffer to the stream. Plain TCP passes the payload
  /// through and opens the receive window; TLS queues the ciphertext and
  /// returns whatever plaintext the record engine yields.
  pub fn receive(&mut self, pbuf: Pbuf) -> Result<Vec<Bytes>, ServerError> {
    match self {
      Transport::Tcp(sock) => {
        let len = pbuf.total_len();
        let out = pbuf.into_bytes();
        sock.recved(len);
        if out.is_empty() {
          Ok(Vec::new())
        } else {
          Ok(vec![out])
        }
      }
      #[cfg(feature = "tls")]
      Transport::Tls(sess) => sess.receive(pbuf),
    }
  }

  /// Map `len` acked wire bytes to the byte count the layer above should
  /// see. Plain TCP is the identity; TLS converts ciphertext acks into
  /// plaintext units.
  pub fn acked(&mut self, len: usize) -> Result<usize, ServerError> {
    match self {
      Transport::Tcp(_) => Ok(len),
      #[cfg(feature = "tls")]
      Transport::Tls(sess) => sess.acked(len),
    }
  }
}
