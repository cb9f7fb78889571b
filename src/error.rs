// Copyright 2025 The execmux Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure of the underlying byte streams.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The stream ended before the requested number of bytes arrived.
    #[error("unexpected end of stream ({missing} bytes missing)")]
    Eof { missing: usize },
    /// The write half has already been shut down.
    #[error("write side of the transport is closed")]
    WriteClosed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// A value could not be encoded for the wire.
///
/// Encoding failures never emit partial frames; the connection stays
/// healthy and the error is surfaced to the caller of `send`.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// Length fields on the wire are signed-positive 32-bit integers.
    #[error("{what} of {len} bytes exceeds the 31-bit wire limit")]
    TooLong { what: &'static str, len: usize },
}

/// The inbound byte stream could not be decoded.
///
/// Anything but `Eof` means wire corruption, which is fatal to the
/// whole connection.
#[derive(Debug, Error)]
pub enum UnserializeError {
    #[error("end of stream")]
    Eof,
    #[error("read failed: {0}")]
    Io(io::Error),
    #[error("{0} - wire protocol corruption?")]
    Corrupt(String),
}

impl From<TransportError> for UnserializeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Eof { .. } | TransportError::WriteClosed => Self::Eof,
            TransportError::Io(err) => Self::Io(err),
        }
    }
}

/// A formatted error report produced by code running on the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("remote error: {formatted}")]
pub struct RemoteError {
    pub formatted: String,
}

impl RemoteError {
    pub fn new(formatted: impl Into<String>) -> Self {
        Self {
            formatted: formatted.into(),
        }
    }

    /// One-shot notice for errors nobody consumed before the channel
    /// handle went away.
    pub(crate) fn warn_unhandled(&self) {
        tracing::warn!("unhandled {self}");
    }
}

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(u32),
    #[error("channel {0} has a receive callback registered")]
    CallbackRegistered(u32),
    #[error("channel {0} is tied to remote execution and closes when that finishes")]
    RemoteOwnsClosure(u32),
    #[error("no item after {0:?}")]
    Timeout(Duration),
    /// The peer closed the channel without an error; no more data will
    /// ever arrive.
    #[error("channel endpoint reached end of stream")]
    Eof,
    #[error(transparent)]
    Remote(RemoteError),
    /// The gateway has shut down; no new channels can be created.
    #[error("connection already closed")]
    ConnectionClosed,
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
