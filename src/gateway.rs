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

//! The process-local endpoint of a connection: one transport, one
//! receiver thread, one channel factory.
//!
//! Exactly one dedicated thread reads frames and dispatches them under
//! the receive lock; any number of user threads send, receive and
//! close channels concurrently. Outbound frames are built in full
//! before a single locked transport write, which makes every send
//! atomic without a lock around serialization.

use std::io;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::ReentrantMutex;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::error::RemoteError;
use crate::error::TransportError;
use crate::error::UnserializeError;
use crate::factory::ChannelFactory;
use crate::prelude::*;
use crate::transport::Transport;
use crate::transport::TransportRead;
use crate::transport::TransportWrite;
use crate::utils::Latch;
use crate::wire::Message;
use crate::wire::deserialize::ChannelResolver;
use crate::wire::deserialize::CoerceOptions;
use crate::wire::deserialize::Deserializer;
use crate::wire::value::Value;

/// Start count for ids allocated by the controlling side (odd ids).
pub(crate) const CONTROLLER_START_ID: u32 = 1;
/// Start count for ids allocated by the worker side (even ids).
pub(crate) const WORKER_START_ID: u32 = 2;

pub(crate) enum Flow {
    Continue,
    /// Stop receiving and unwind cleanly (gateway termination).
    Terminate,
}

/// Worker-side hooks the receiver drives: the execution queue and the
/// latch the serve loop raises when it is done.
pub(crate) struct ExecHooks {
    pub(crate) queue_tx: crossbeam_channel::Sender<Option<(Channel, String)>>,
    pub(crate) finished: Arc<Latch>,
    pub(crate) grace: Mutex<Duration>,
}

pub(crate) struct GatewayCore {
    writer: Mutex<Option<Box<dyn TransportWrite>>>,
    pub(crate) factory: ChannelFactory,
    /// Serializes receiver-thread dispatch against callback
    /// installation; reentrant because callbacks themselves run under
    /// it and may install further callbacks.
    pub(crate) receive_lock: ReentrantMutex<()>,
    error: Mutex<Option<String>>,
    pub(crate) options: CoerceOptions,
    pub(crate) exec: Option<ExecHooks>,
}

impl GatewayCore {
    pub(crate) fn new(
        writer: Box<dyn TransportWrite>,
        startcount: u32,
        options: CoerceOptions,
        exec: Option<ExecHooks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(Some(writer)),
            factory: ChannelFactory::new(startcount),
            receive_lock: ReentrantMutex::new(()),
            error: Mutex::new(None),
            options,
            exec,
        })
    }

    /// Serializes and writes one message as a single atomic frame. The
    /// message (and any channel handle in its payload) is dropped only
    /// after the write, so a teardown it triggers goes out afterwards.
    pub(crate) fn send(&self, msg: Message) -> Result<(), ChannelError> {
        trace!("sending {msg:?}");
        let frame = msg.to_frame()?;
        {
            let mut guard = self.writer.lock();
            match guard.as_mut() {
                Some(writer) => writer.write(&frame)?,
                None => return Err(ChannelError::Transport(TransportError::WriteClosed)),
            }
        }
        Ok(())
    }

    pub(crate) fn close_write(&self) {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.close_write();
        }
    }

    fn record_error(&self, text: String) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(text);
        }
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Handles one inbound message. Runs in the receiver thread under
    /// the receive lock.
    pub(crate) fn dispatch(core: &Arc<Self>, msg: Message) -> Result<Flow, ChannelError> {
        match msg {
            Message::Status { id } => {
                // Reply on the sender-chosen id without instantiating
                // a channel for it.
                let channels = core.factory.channels();
                let num_executing = channels.iter().filter(|c| c.is_executing()).count();
                let queued = core
                    .exec
                    .as_ref()
                    .map(|hooks| hooks.queue_tx.len())
                    .unwrap_or(0);
                let payload = Value::Dict(vec![
                    (Value::from("execqsize"), Value::Int(queued as i64)),
                    (Value::from("numchannels"), Value::Int(channels.len() as i64)),
                    (Value::from("numexecuting"), Value::Int(num_executing as i64)),
                ]);
                core.send(Message::ChannelData { id, payload })?;
                Ok(Flow::Continue)
            },
            Message::ChannelExec { id, payload } => {
                let channel = core.factory.create(core, Some(id))?;
                core.schedule_exec(channel, payload);
                Ok(Flow::Continue)
            },
            Message::ChannelData { id, payload } => {
                core.factory.local_receive(core, id, payload);
                Ok(Flow::Continue)
            },
            Message::ChannelClose { id } => {
                core.factory.local_close(id, None, false);
                Ok(Flow::Continue)
            },
            Message::ChannelCloseError { id, payload } => {
                let text = match payload {
                    Value::Str(text) => text,
                    other => format!("{other:?}"),
                };
                core.factory
                    .local_close(id, Some(RemoteError::new(text)), false);
                Ok(Flow::Continue)
            },
            Message::ChannelLastMessage { id } => {
                core.factory.local_close(id, None, true);
                Ok(Flow::Continue)
            },
            Message::GatewayTerminate => {
                core.terminate_execution();
                Ok(Flow::Terminate)
            },
        }
    }

    fn schedule_exec(&self, channel: Channel, payload: Value) {
        let Some(hooks) = &self.exec else {
            let _ = channel.close_with_error("execution disallowed");
            return;
        };
        match payload {
            Value::Str(entry) => {
                if hooks.queue_tx.send(Some((channel.clone(), entry))).is_err() {
                    let _ = channel.close_with_error("execution loop is not running");
                }
            },
            other => {
                let _ = channel.close_with_error(format!(
                    "invalid execution request of type {}",
                    other.type_name()
                ));
            },
        }
    }

    /// Breaks the worker's serve loop and gives running entries a
    /// grace period; a worker that cannot wind down in time is ended
    /// the hard way. A no-op on gateways without an execution loop.
    pub(crate) fn terminate_execution(&self) {
        let Some(hooks) = &self.exec else { return };
        let _ = hooks.queue_tx.send(None);
        let grace = *hooks.grace.lock();
        if !hooks.finished.wait_timeout(grace) {
            error!("execution did not finish within {grace:?}, exiting with status 1");
            std::process::exit(1);
        }
    }
}

impl ChannelResolver for Arc<GatewayCore> {
    fn resolve_channel(&self, id: u32) -> Result<Channel, UnserializeError> {
        self.factory
            .create(self, Some(id))
            .map_err(|err| UnserializeError::Corrupt(err.to_string()))
    }
}

pub(crate) fn spawn_receiver(
    core: Arc<GatewayCore>,
    reader: Box<dyn TransportRead>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("receiver".into())
        .spawn(move || receiver_loop(core, reader))
        .expect("failed to spawn the receiver thread")
}

/// The one reader of the transport: decodes frames and dispatches them
/// strictly in order. On end-of-file all channels become half-closed
/// and (on workers) the execution loop is told to stop; any other
/// decode failure winds the gateway down the same way but leaves the
/// execution loop to its queue.
fn receiver_loop(core: Arc<GatewayCore>, reader: Box<dyn TransportRead>) {
    trace!("starting to receive");
    let resolver = core.clone();
    let mut de = Deserializer::new(reader, &resolver, core.options);
    let mut eof = false;
    let mut terminated = false;
    loop {
        match Message::read_from(&mut de) {
            Ok(msg) => {
                debug!("received {msg:?}");
                let flow = {
                    let _guard = core.receive_lock.lock();
                    GatewayCore::dispatch(&core, msg)
                };
                match flow {
                    Ok(Flow::Continue) => {},
                    Ok(Flow::Terminate) => {
                        terminated = true;
                        break;
                    },
                    Err(err) => {
                        debug!("receiver dispatch failed: {err}");
                        core.record_error(err.to_string());
                        break;
                    },
                }
            },
            Err(UnserializeError::Eof) => {
                trace!("receiver got end-of-file");
                core.record_error("end of file on the transport".into());
                eof = true;
                break;
            },
            Err(err) => {
                error!("receiver stopping: {err}");
                core.record_error(err.to_string());
                break;
            },
        }
    }
    if terminated {
        de.into_reader().close_read();
    }
    core.factory.finished_receiving();
    if eof {
        core.terminate_execution();
    }
    trace!("leaving receiver thread");
}

/// A snapshot of the peer gateway's load, as answered to a status
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStatus {
    pub exec_queue_size: usize,
    pub num_channels: usize,
    pub num_executing: usize,
}

impl GatewayStatus {
    fn from_value(value: &Value) -> Self {
        let field = |key: &str| {
            value
                .dict_get(key)
                .and_then(Value::as_int)
                .and_then(|i| usize::try_from(i).ok())
                .unwrap_or(0)
        };
        Self {
            exec_queue_size: field("execqsize"),
            num_channels: field("numchannels"),
            num_executing: field("numexecuting"),
        }
    }
}

/// The controlling endpoint of a connection.
///
/// Owns the transport and the receiver thread; hands out channels and
/// schedules execution entries on the worker at the other end.
pub struct Gateway {
    core: Arc<GatewayCore>,
    receiver: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn new(transport: Transport) -> Self {
        Self::with_options(transport, CoerceOptions::default())
    }

    pub fn with_options(transport: Transport, options: CoerceOptions) -> Self {
        let Transport { reader, writer } = transport;
        let core = GatewayCore::new(writer, CONTROLLER_START_ID, options, None);
        let receiver = spawn_receiver(core.clone(), reader);
        Self {
            core,
            receiver: Some(receiver),
        }
    }

    /// Connects to a worker spawned with piped stdio.
    pub fn over_child(child: &mut Child) -> io::Result<Self> {
        Ok(Self::new(Transport::from_child(child)?))
    }

    pub fn connect_unix<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new(Transport::from_unix(UnixStream::connect(path)?)?))
    }

    pub fn connect_tcp<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(Transport::from_tcp(TcpStream::connect(addr)?)?))
    }

    /// Returns a new independent channel.
    pub fn new_channel(&self) -> Result<Channel, ChannelError> {
        self.core.factory.create(&self.core, None)
    }

    /// Schedules the named execution entry on the worker and returns
    /// the channel bound to it.
    pub fn remote_exec(&self, entry: &str) -> Result<Channel, ChannelError> {
        let channel = self.new_channel()?;
        self.core.send(Message::ChannelExec {
            id: channel.id(),
            payload: Value::Str(entry.to_string()),
        })?;
        Ok(channel)
    }

    /// Asks the peer for its current load.
    pub fn remote_status(&self) -> Result<GatewayStatus, ChannelError> {
        let channel = self.new_channel()?;
        self.core.send(Message::Status { id: channel.id() })?;
        let reply = channel.receive()?;
        Ok(GatewayStatus::from_value(&reply))
    }

    /// Tells the worker to shut down cleanly. The worker exits with
    /// status 0, or status 1 if a running entry outlives the grace
    /// period.
    pub fn terminate(&self) -> Result<(), ChannelError> {
        self.core.send(Message::GatewayTerminate)
    }

    /// Waits for the receiver thread to finish (after termination or
    /// peer end-of-file).
    pub fn join(&mut self) {
        if let Some(handle) = self.receiver.take() {
            crate::utils::join_unwrap(handle);
        }
    }

    /// The error that took the gateway down, if any.
    pub fn last_error(&self) -> Option<String> {
        self.core.last_error()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use super::GatewayCore;
    use crate::error::TransportError;
    use crate::error::UnserializeError;
    use crate::transport::PipeReader;
    use crate::transport::TransportWrite;
    use crate::wire::Message;
    use crate::wire::deserialize::CoerceOptions;
    use crate::wire::deserialize::Deserializer;
    use crate::wire::deserialize::NoChannels;

    pub(crate) struct CaptureWriter(pub Arc<StdMutex<Vec<u8>>>);

    impl TransportWrite for CaptureWriter {
        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn close_write(&mut self) {}
    }

    /// A gateway core with a capturing writer and no receiver thread.
    pub(crate) fn loopless_core() -> (Arc<GatewayCore>, Arc<StdMutex<Vec<u8>>>) {
        let written = Arc::new(StdMutex::new(Vec::new()));
        let core = GatewayCore::new(
            Box::new(CaptureWriter(written.clone())),
            super::CONTROLLER_START_ID,
            CoerceOptions::default(),
            None,
        );
        (core, written)
    }

    pub(crate) fn decode_frames(bytes: &[u8]) -> Vec<Message> {
        let mut frames = Vec::new();
        let mut de = Deserializer::new(
            PipeReader::new(bytes),
            &NoChannels,
            CoerceOptions::default(),
        );
        loop {
            match Message::read_from(&mut de) {
                Ok(msg) => frames.push(msg),
                Err(UnserializeError::Eof) => break,
                Err(err) => panic!("undecodable frame: {err}"),
            }
        }
        frames
    }
}
