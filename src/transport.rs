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

//! Exact-count blocking i/o over a pair of byte streams.
//!
//! The transport does no framing of its own; the wire layer frames
//! every message itself. A transport only promises that `read_exact`
//! fills the whole buffer or reports end-of-stream, and that each
//! `write` delivers (and flushes) the whole slice.

use std::io;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::process::Child;
use std::process::Stdio;

use crate::error::TransportError;

pub trait TransportRead: Send {
    /// Fills `buf` completely, looping over short reads. A zero-byte
    /// read before the buffer is full is a hard end-of-stream.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Shuts down the read half. Subsequent reads report end-of-stream.
    fn close_read(&mut self);
}

pub trait TransportWrite: Send {
    /// Writes and flushes the whole slice. Callers pass one complete
    /// message per call.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Shuts down the write half; the peer observes end-of-stream.
    fn close_write(&mut self);
}

impl TransportRead for Box<dyn TransportRead> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).read_exact(buf)
    }

    fn close_read(&mut self) {
        (**self).close_read()
    }
}

fn read_full<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(TransportError::Eof {
                    missing: buf.len() - filled,
                });
            },
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Read half over any plain byte source (pipes, child stdout, byte
/// slices in tests). `close_read` drops the source.
pub struct PipeReader<R> {
    inner: Option<R>,
}

impl<R: Read + Send> PipeReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<R: Read + Send> TransportRead for PipeReader<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match &mut self.inner {
            Some(stream) => read_full(stream, buf),
            None => Err(TransportError::Eof { missing: buf.len() }),
        }
    }

    fn close_read(&mut self) {
        self.inner = None;
    }
}

/// Write half over any plain byte sink. `close_write` drops the sink,
/// which closes the underlying descriptor for pipes.
pub struct PipeWriter<W> {
    inner: Option<W>,
}

impl<W: Write + Send> PipeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<W: Write + Send> TransportWrite for PipeWriter<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.inner.as_mut().ok_or(TransportError::WriteClosed)?;
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    fn close_write(&mut self) {
        if let Some(mut stream) = self.inner.take() {
            let _ = stream.flush();
        }
    }
}

/// Stream types whose halves can be shut down independently.
trait ShutdownStream: Read + Write + Send + 'static {
    fn try_clone_stream(&self) -> io::Result<Self>
    where
        Self: Sized;

    fn shutdown_half(&self, how: Shutdown) -> io::Result<()>;
}

impl ShutdownStream for UnixStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_half(&self, how: Shutdown) -> io::Result<()> {
        self.shutdown(how)
    }
}

impl ShutdownStream for TcpStream {
    fn try_clone_stream(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn shutdown_half(&self, how: Shutdown) -> io::Result<()> {
        self.shutdown(how)
    }
}

struct StreamRead<S: ShutdownStream> {
    stream: S,
}

impl<S: ShutdownStream> TransportRead for StreamRead<S> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        read_full(&mut self.stream, buf)
    }

    fn close_read(&mut self) {
        let _ = self.stream.shutdown_half(Shutdown::Read);
    }
}

struct StreamWrite<S: ShutdownStream> {
    stream: S,
}

impl<S: ShutdownStream> TransportWrite for StreamWrite<S> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    fn close_write(&mut self) {
        let _ = self.stream.shutdown_half(Shutdown::Write);
    }
}

/// A read/write pair ready to back a gateway.
pub struct Transport {
    pub reader: Box<dyn TransportRead>,
    pub writer: Box<dyn TransportWrite>,
}

impl Transport {
    /// Wraps arbitrary read/write halves. Half-close is only as good
    /// as dropping the respective half.
    pub fn from_pair<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(PipeReader::new(reader)),
            writer: Box::new(PipeWriter::new(writer)),
        }
    }

    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        Self::from_stream(stream)
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        Self::from_stream(stream)
    }

    fn from_stream<S: ShutdownStream>(stream: S) -> io::Result<Self> {
        let read_stream = stream.try_clone_stream()?;
        Ok(Self {
            reader: Box::new(StreamRead {
                stream: read_stream,
            }),
            writer: Box::new(StreamWrite { stream }),
        })
    }

    /// Claims this process's stdin/stdout for the wire and points the
    /// original descriptors at /dev/null, so that stray prints from
    /// user code cannot corrupt the message stream.
    pub fn stdio() -> io::Result<Self> {
        use std::fs::File;
        use std::os::fd::AsRawFd;
        use std::os::fd::FromRawFd;

        let devnull = File::options().read(true).write(true).open("/dev/null")?;

        // SAFETY: dup returns fresh descriptors that end up owned by
        // the returned Files; 0 and 1 stay open (redirected to
        // /dev/null) for the rest of the process.
        let (wire_in, wire_out) = unsafe {
            let wire_in = check_fd(libc::dup(0))?;
            let wire_out = check_fd(libc::dup(1))?;
            check_fd(libc::dup2(devnull.as_raw_fd(), 0))?;
            check_fd(libc::dup2(devnull.as_raw_fd(), 1))?;
            (File::from_raw_fd(wire_in), File::from_raw_fd(wire_out))
        };

        Ok(Self::from_pair(wire_in, wire_out))
    }

    /// Talks to a spawned worker process over its piped stdio. The
    /// child must have been spawned with `Stdio::piped()` for both.
    pub fn from_child(child: &mut Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout is not piped"))?;
        Ok(Self::from_pair(stdout, stdin))
    }
}

/// Prepares a command so its stdio can carry the wire.
pub fn pipe_worker_stdio(command: &mut std::process::Command) -> &mut std::process::Command {
    command.stdin(Stdio::piped()).stdout(Stdio::piped())
}

fn check_fd(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_exact_loops_over_short_reads() {
        struct OneByteAtATime(Vec<u8>);

        impl Read for OneByteAtATime {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0.remove(0);
                Ok(1)
            }
        }

        let mut reader = PipeReader::new(OneByteAtATime(vec![1, 2, 3, 4]));
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn short_stream_is_a_hard_eof() {
        let mut reader = PipeReader::new(&[1u8, 2][..]);
        let mut buf = [0u8; 4];
        let err = reader.read_exact(&mut buf).unwrap_err();
        assert!(matches!(err, TransportError::Eof { missing: 2 }));
    }

    #[test]
    fn closed_read_half_reports_eof() {
        let mut reader = PipeReader::new(&[1u8, 2, 3][..]);
        reader.close_read();
        let mut buf = [0u8; 1];
        assert!(matches!(
            reader.read_exact(&mut buf),
            Err(TransportError::Eof { .. })
        ));
    }

    #[test]
    fn closed_write_half_rejects_writes() {
        let mut writer = PipeWriter::new(Vec::new());
        writer.write(b"ok").unwrap();
        writer.close_write();
        assert!(matches!(
            writer.write(b"nope"),
            Err(TransportError::WriteClosed)
        ));
    }
}
