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

use thiserror::Error;

/// Outcome of an incremental operation that ran as far as the available
/// input (or send window) allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// The operation finished.
  Complete,
  /// More input or more send window is needed; state is preserved so the
  /// call can be repeated later.
  Partial,
}

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("Unknown request method")]
  UnknownMethod,
  #[error("Unknown protocol version")]
  UnknownVersion,
  #[error("Request buffer overflow")]
  RequestBufferFull,
  #[error("Malformed header line")]
  InvalidHeader,
  #[error("Invalid chunk size line")]
  InvalidChunkSize,
  #[error("No body declared for this request")]
  NoBody,
  #[error("Body rewind crosses the start of the buffer")]
  RewindOutOfRange,
  #[error("Data received after a complete request")]
  UnexpectedData,
  #[error("Buffer full")]
  BufferFull,
  #[error("Not enough buffered data")]
  InsufficientData,
  #[error("Response buffer overflow")]
  ResponseBufferFull,
  #[error("Write failed")]
  WriteFailed,
  #[error("Send buffer cannot take the frame in one pass")]
  SendBufferFull,
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection pool exhausted")]
  NoFreeConnection,
  #[error("Invalid opcode: {0}")]
  InvalidOpCode(u8),
  #[error("Reserved bits are not zero")]
  ReservedBitsNotZero,
  #[error("Control frame must not be fragmented")]
  ControlFrameFragmented,
  #[error("Frame too large")]
  FrameTooLarge,
  #[error("Client frames must be masked")]
  UnmaskedClientFrame,
  #[error("Invalid UTF-8 in text frame")]
  InvalidUTF8,
  #[cfg(feature = "tls")]
  #[error("TLS error: {0}")]
  Tls(#[from] rustls::Error),
  #[cfg(feature = "tls")]
  #[error("Invalid certificate or private key material")]
  InvalidKeyMaterial,
}
