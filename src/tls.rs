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

//! TLS termination over the send/ack pipeline.
//!
//! Data sending flow: plaintext from the layer above goes into the record
//! engine, which turns it into ciphertext records the engine keeps queued
//! internally. Each ack from the stack drains as much queued ciphertext as
//! the send buffer permits. The layer above must see acks in *plaintext*
//! units, so every accepted plaintext length is recorded together with the
//! cumulative ciphertext offset at which its records had fully left the
//! engine; once the stack's acks pass that watermark, the plaintext length
//! is reported up.
//!
//! Data receive flow: each inbound buffer is queued as-is. The engine pulls
//! from the queue while servicing handshake and read calls; a buffer is
//! released (and its bytes credited back to the receive window) only once
//! the engine has consumed all of it.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error};

use crate::error::ServerError;
use crate::tcp::{Pbuf, TcpSocket};

/// Scratch size for draining decrypted plaintext out of the engine.
const PLAINTEXT_READ_SIZE: usize = 512;

/// Shared TLS configuration for the secure accept path.
///
/// Built once from PEM bytes at server init; every accepted connection gets
/// its own session off the shared config.
pub struct TlsAcceptor {
  config: Arc<rustls::ServerConfig>,
}

impl TlsAcceptor {
  /// Load a certificate chain and private key (PKCS#8 or RSA) from PEM
  /// bytes.
  pub fn from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
  ) -> Result<Self, ServerError> {
    let certs: Vec<rustls::Certificate> =
      rustls_pemfile::certs(&mut &cert_pem[..])
        .map_err(|_| ServerError::InvalidKeyMaterial)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if certs.is_empty() {
      return Err(ServerError::InvalidKeyMaterial);
    }

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut &key_pem[..])
      .map_err(|_| ServerError::InvalidKeyMaterial)?;
    if keys.is_empty() {
      keys = rustls_pemfile::rsa_private_keys(&mut &key_pem[..])
        .map_err(|_| ServerError::InvalidKeyMaterial)?;
    }
    let key = rustls::PrivateKey(
      keys.into_iter().next().ok_or(ServerError::InvalidKeyMaterial)?,
    );

    let config = rustls::ServerConfig::builder()
      .with_safe_defaults()
      .with_no_client_auth()
      .with_single_cert(certs, key)?;

    Ok(Self {
      config: Arc::new(config),
    })
  }

  /// Start a session for a freshly accepted stream.
  pub(crate) fn accept(
    &self,
    sock: Box<dyn TcpSocket>,
  ) -> Result<TlsSession, ServerError> {
    let tls = rustls::ServerConnection::new(Arc::clone(&self.config))?;
    Ok(TlsSession {
      tls,
      sock,
      read_queue: VecDeque::new(),
      ledger: AckLedger::default(),
    })
  }
}

/// Bookkeeping that converts ciphertext acks back into plaintext units.
#[derive(Default)]
struct AckLedger {
  cipher_sent: u64,
  cipher_acked: u64,
  /// Accepted plaintext lengths whose ciphertext has not fully left the
  /// engine yet.
  unmarked: VecDeque<usize>,
  /// Plaintext length -> cumulative ciphertext offset to wait for.
  marked: VecDeque<(usize, u64)>,
}

impl AckLedger {
  fn accept_plain(&mut self, len: usize) {
    if len > 0 {
      self.unmarked.push_back(len);
    }
  }

  fn ciphertext_sent(&mut self, len: usize) {
    self.cipher_sent += len as u64;
  }

  /// The engine's outbound buffer is empty: everything accepted so far is
  /// covered by ciphertext up to `cipher_sent`.
  fn mark_all(&mut self) {
    while let Some(len) = self.unmarked.pop_front() {
      self.marked.push_back((len, self.cipher_sent));
    }
  }

  /// Credit `len` acked ciphertext bytes; returns the plaintext byte count
  /// now fully on the wire.
  fn acked(&mut self, len: usize) -> usize {
    self.cipher_acked += len as u64;
    let mut plain = 0;
    while let Some(&(len, mark)) = self.marked.front() {
      if mark > self.cipher_acked {
        break;
      }
      plain += len;
      self.marked.pop_front();
    }
    plain
  }
}

/// One TLS connection: the record engine, the socket it encrypts onto, and
/// the inbound ciphertext queue.
pub struct TlsSession {
  tls: rustls::ServerConnection,
  sock: Box<dyn TcpSocket>,
  read_queue: VecDeque<Pbuf>,
  ledger: AckLedger,
}

impl TlsSession {
  pub fn is_handshaking(&self) -> bool {
    self.tls.is_handshaking()
  }

  pub(crate) fn available_send_buffer(&self) -> usize {
    self.sock.send_buffer()
  }

  /// Accept plaintext from the layer above. Returns how many bytes the
  /// engine took; they are reported back through `acked` once their
  /// records are on the wire and confirmed.
  pub(crate) fn write_plain(
    &mut self,
    data: &[u8],
  ) -> Result<usize, ServerError> {
    let n = self
      .tls
      .writer()
      .write(data)
      .map_err(|_| ServerError::WriteFailed)?;
    self.ledger.accept_plain(n);
    self.flush_ciphertext()?;
    Ok(n)
  }

  /// Push queued ciphertext records to the stack, bounded by its send
  /// buffer. Marks the ledger when the engine's buffer runs dry.
  fn flush_ciphertext(&mut self) -> Result<(), ServerError> {
    let mut flushed = false;
    while self.tls.wants_write() {
      let budget = self.sock.send_buffer();
      if budget == 0 {
        break;
      }
      let mut sink = SndbufWriter {
        sock: self.sock.as_mut(),
        budget,
      };
      match self.tls.write_tls(&mut sink) {
        Ok(0) => break,
        Ok(n) => {
          self.ledger.ciphertext_sent(n);
          flushed = true;
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
        Err(e) => {
          error!("ciphertext write failed: {e}");
          return Err(ServerError::WriteFailed);
        }
      }
    }
    if flushed {
      self.sock.output()?;
    }
    if !self.tls.wants_write() {
      self.ledger.mark_all();
    }
    Ok(())
  }

  /// Queue an inbound buffer and run the session state machine. Returns
  /// the plaintext the engine produced.
  pub(crate) fn receive(
    &mut self,
    pbuf: Pbuf,
  ) -> Result<Vec<Bytes>, ServerError> {
    self.read_queue.push_back(pbuf);
    self.session_process()
  }

  /// Drive handshake and record processing as far as the queued input
  /// allows.
  pub(crate) fn session_process(&mut self) -> Result<Vec<Bytes>, ServerError> {
    let mut out = Vec::new();
    loop {
      let mut progress = false;

      if self.tls.wants_read() && !self.read_queue.is_empty() {
        let mut reader = QueueReader {
          queue: &mut self.read_queue,
          sock: self.sock.as_mut(),
        };
        match self.tls.read_tls(&mut reader) {
          Ok(n) if n > 0 => progress = true,
          Ok(_) => {}
          Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
          Err(e) => {
            error!("reading ciphertext failed: {e}");
            return Err(ServerError::WriteFailed);
          }
        }
        if progress {
          if let Err(e) = self.tls.process_new_packets() {
            // flush the alert the engine queued before surfacing the error
            let _ = self.flush_ciphertext();
            return Err(ServerError::Tls(e));
          }
        }
      }

      let mut buf = [0u8; PLAINTEXT_READ_SIZE];
      loop {
        match self.tls.reader().read(&mut buf) {
          Ok(0) => {
            debug!("peer closed the TLS session");
            return Err(ServerError::ConnectionClosed);
          }
          Ok(n) => {
            out.push(Bytes::copy_from_slice(&buf[..n]));
            progress = true;
          }
          Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
          Err(_) => return Err(ServerError::ConnectionClosed),
        }
      }

      self.flush_ciphertext()?;

      if !progress {
        break;
      }
    }
    Ok(out)
  }

  /// Map acked ciphertext to plaintext units for the layer above, and use
  /// the freed window to push more queued records out.
  pub(crate) fn acked(&mut self, len: usize) -> Result<usize, ServerError> {
    self.flush_ciphertext()?;
    Ok(self.ledger.acked(len))
  }

  pub(crate) fn shutdown(&mut self) {
    self.tls.send_close_notify();
    let _ = self.flush_ciphertext();
    self.sock.close();
  }
}

/// `io::Read` over the inbound pbuf queue.
///
/// A buffer smaller than the head pbuf slides the pbuf's payload forward; a
/// fully consumed pbuf is freed and its length credited to the receive
/// window before moving to the next.
struct QueueReader<'a> {
  queue: &'a mut VecDeque<Pbuf>,
  sock: &'a mut dyn TcpSocket,
}

impl Read for QueueReader<'_> {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
      let Some(front) = self.queue.front_mut() else {
        break;
      };
      let n = front.len().min(buf.len() - filled);
      buf[filled..filled + n].copy_from_slice(&front.payload()[..n]);
      front.advance(n);
      filled += n;
      if front.is_empty() {
        let total = front.total_len();
        self.queue.pop_front();
        self.sock.recved(total);
      }
    }
    if filled == 0 {
      return Err(io::ErrorKind::WouldBlock.into());
    }
    Ok(filled)
  }
}

/// `io::Write` onto the socket, bounded by its send buffer at construction
/// time.
struct SndbufWriter<'a> {
  sock: &'a mut dyn TcpSocket,
  budget: usize,
}

impl Write for SndbufWriter<'_> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = buf.len().min(self.budget);
    if n == 0 {
      return Err(io::ErrorKind::WouldBlock.into());
    }
    let written = self
      .sock
      .write(&buf[..n], 0)
      .map_err(|_| io::Error::from(io::ErrorKind::Other))?;
    if written == 0 {
      return Err(io::ErrorKind::WouldBlock.into());
    }
    self.budget -= written;
    Ok(written)
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::tcp::mock::MockSocket;

  #[test]
  fn ledger_reports_plaintext_units() {
    let mut ledger = AckLedger::default();
    // 100 plaintext bytes became 129 ciphertext bytes, fully drained
    ledger.accept_plain(100);
    ledger.ciphertext_sent(129);
    ledger.mark_all();
    assert_eq!(ledger.acked(64), 0);
    assert_eq!(ledger.acked(65), 100);
  }

  #[test]
  fn ledger_conserves_plaintext_across_partial_drains() {
    let mut ledger = AckLedger::default();
    ledger.accept_plain(10);
    ledger.accept_plain(20);
    // records still queued inside the engine: nothing marked yet
    ledger.ciphertext_sent(16);
    assert_eq!(ledger.acked(16), 0);
    // remaining ciphertext drains, engine buffer empty
    ledger.ciphertext_sent(50);
    ledger.mark_all();
    assert_eq!(ledger.acked(49), 0);
    assert_eq!(ledger.acked(1), 30);
    // total reported equals total accepted
  }

  #[test]
  fn ledger_handshake_bytes_shift_watermarks() {
    let mut ledger = AckLedger::default();
    // handshake flight: ciphertext with no plaintext behind it
    ledger.ciphertext_sent(300);
    ledger.mark_all();
    ledger.accept_plain(40);
    ledger.ciphertext_sent(69);
    ledger.mark_all();
    assert_eq!(ledger.acked(300), 0);
    assert_eq!(ledger.acked(69), 40);
  }

  #[test]
  fn queue_reader_slides_and_frees() {
    let (mut sock, state) = MockSocket::unbounded();
    let mut queue: VecDeque<Pbuf> = VecDeque::new();
    queue.push_back(Pbuf::from(&b"abcdef"[..]));
    queue.push_back(Pbuf::from(&b"gh"[..]));

    let mut reader = QueueReader {
      queue: &mut queue,
      sock: &mut sock,
    };
    // smaller than the head pbuf: slide, do not free
    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert_eq!(state.borrow().recved, 0);

    // larger than what is left: drain across pbufs, freeing both
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"efgh");
    assert_eq!(state.borrow().recved, 8);

    assert!(reader.read(&mut buf).is_err());
  }

  #[test]
  fn sndbuf_writer_respects_budget() {
    let (mut sock, state) = MockSocket::unbounded();
    let mut writer = SndbufWriter {
      sock: &mut sock,
      budget: 5,
    };
    assert_eq!(writer.write(b"abcdefgh").unwrap(), 5);
    assert!(writer.write(b"ijk").is_err());
    assert_eq!(state.borrow().sent, b"abcde");
  }
}
