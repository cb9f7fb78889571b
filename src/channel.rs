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

//! One logical stream multiplexed over a gateway's transport.
//!
//! A `Channel` is a cheap-to-clone handle. Inbound payloads land in a
//! FIFO drained by `receive`, or go straight to a registered callback
//! in the receiver thread. Closing is a one-way street: once a close
//! has been processed nothing more is sent for the id, and the end of
//! the stream is marked by a sentinel at the tail of the FIFO.
//!
//! Dropping the last handle to an open channel notifies the peer: a
//! plain close when the queue was still in place, or a "last message"
//! half-close when a callback had been installed (the peer may then
//! keep sending until it closes its own side).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::error::RemoteError;
use crate::factory::Callback;
use crate::gateway::GatewayCore;
use crate::prelude::*;
use crate::wire::Message;
use crate::wire::value::Value;

/// How often a blocking wait wakes up to re-check state.
const INTERNAL_WAKE: Duration = Duration::from_secs(1);

pub(crate) enum Received {
    Item(Value),
    /// End of stream; always re-queued when observed so every receiver
    /// sees it.
    End,
}

pub(crate) struct ChannelState {
    /// FIFO of inbound payloads; `None` once a callback owns delivery.
    pub(crate) items: Option<VecDeque<Received>>,
    pub(crate) closed: bool,
    /// Latched when the remote will send no more data (full close or
    /// half-close).
    pub(crate) receive_closed: bool,
    pub(crate) remote_errors: VecDeque<RemoteError>,
}

pub(crate) struct ChannelInner {
    pub(crate) id: u32,
    pub(crate) gateway: Arc<GatewayCore>,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) cond: Condvar,
    executing: AtomicBool,
}

impl ChannelInner {
    pub(crate) fn new(id: u32, gateway: Arc<GatewayCore>) -> Self {
        Self {
            id,
            gateway,
            state: Mutex::new(ChannelState {
                items: Some(VecDeque::new()),
                closed: false,
                receive_closed: false,
                remote_errors: VecDeque::new(),
            }),
            cond: Condvar::new(),
            executing: AtomicBool::new(false),
        }
    }

    /// Queues one inbound payload. Runs in the receiver thread; data
    /// for a channel whose callback owns delivery is not queued here.
    pub(crate) fn push_data(&self, data: Value) {
        let mut st = self.state.lock();
        if let Some(items) = &mut st.items {
            items.push_back(Received::Item(data));
        }
        drop(st);
        self.cond.notify_all();
    }

    /// Close initiated by the peer (or by gateway shutdown). With
    /// `sendonly` the local side may still transmit.
    pub(crate) fn local_close(&self, remote_error: Option<RemoteError>, sendonly: bool) {
        let mut st = self.state.lock();
        if let Some(err) = remote_error {
            st.remote_errors.push_back(err);
        }
        if !sendonly {
            st.closed = true;
        }
        st.receive_closed = true;
        push_end(&mut st);
        drop(st);
        self.cond.notify_all();
    }
}

fn push_end(st: &mut ChannelState) {
    if let Some(items) = &mut st.items {
        if !matches!(items.back(), Some(Received::End)) {
            items.push_back(Received::End);
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.closed {
            // "closed" -> "deleted": surface anything nobody consumed.
            for err in &st.remote_errors {
                err.warn_unhandled();
            }
        } else if st.receive_closed {
            // "sendonly" -> "deleted": the remote end is already gone.
        } else {
            // "open" -> "deleted": tell the peer. With a callback
            // installed the peer may still send; otherwise the stream
            // is simply over.
            let msg = if st.items.is_none() {
                Message::ChannelLastMessage { id: self.id }
            } else {
                Message::ChannelClose { id: self.id }
            };
            if let Err(err) = self.gateway.send(msg) {
                trace!(id = self.id, "ignoring send failure during finalization: {err}");
            }
        }
        self.gateway.factory.prune(self.id);
    }
}

/// Handle to one logical stream. Clones share the same stream; the
/// peer is notified when the last clone goes away.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// True once a local or remote close has been processed. A closed
    /// channel may still hold receivable items.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.inner.executing.store(executing, Ordering::Release);
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::Acquire)
    }

    /// Opens a new independent channel on the same gateway. Useful
    /// inside execution entries for fanning out side streams.
    pub fn open_channel(&self) -> Result<Self, ChannelError> {
        let gateway = &self.inner.gateway;
        gateway.factory.create(gateway, None)
    }

    /// Sends one value to the peer. Fails once the channel is closed;
    /// may block if the transport blocks. Each message is written
    /// atomically.
    pub fn send(&self, item: impl Into<Value>) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.id()));
        }
        self.inner.gateway.send(Message::ChannelData {
            id: self.id(),
            payload: item.into(),
        })
    }

    /// Blocks until the next item arrives. At the end of the stream
    /// this reports the first queued remote error, or plain
    /// end-of-stream when the peer closed without one.
    pub fn receive(&self) -> Result<Value, ChannelError> {
        self.receive_opt(None)
    }

    /// Like `receive`, but gives up after `timeout`. On expiry the
    /// queue is untouched and a later receive still gets the item.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Value, ChannelError> {
        self.receive_opt(Some(timeout))
    }

    fn receive_opt(&self, timeout: Option<Duration>) -> Result<Value, ChannelError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.inner.state.lock();
        loop {
            let st = &mut *guard;
            let Some(items) = &mut st.items else {
                return Err(ChannelError::CallbackRegistered(self.inner.id));
            };
            if let Some(first) = items.pop_front() {
                match first {
                    Received::Item(value) => return Ok(value),
                    Received::End => {
                        // Put it back for other receivers.
                        items.push_back(Received::End);
                        return Err(match st.remote_errors.pop_front() {
                            Some(err) => ChannelError::Remote(err),
                            None => ChannelError::Eof,
                        });
                    },
                }
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout(
                            timeout.expect("deadline implies timeout"),
                        ));
                    }
                    self.inner.cond.wait_for(&mut guard, deadline - now);
                },
                None => {
                    // Periodic wake so a stuck receive revisits state.
                    self.inner.cond.wait_for(&mut guard, INTERNAL_WAKE);
                },
            }
        }
    }

    /// Routes all inbound data to `callback`, invoked in the receiver
    /// thread. Anything already queued is drained into the callback
    /// first, in order; afterwards `receive` fails. Mutually exclusive
    /// with the item queue.
    pub fn set_callback<F>(&self, callback: F) -> Result<(), ChannelError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.set_callback_opt(Arc::new(callback), None)
    }

    /// Like `set_callback`, and additionally delivers `endmarker` to
    /// the callback exactly once when the channel closes.
    pub fn set_callback_with_endmarker<F>(
        &self,
        callback: F,
        endmarker: Value,
    ) -> Result<(), ChannelError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.set_callback_opt(Arc::new(callback), Some(endmarker))
    }

    fn set_callback_opt(
        &self,
        callback: Callback,
        endmarker: Option<Value>,
    ) -> Result<(), ChannelError> {
        let gateway = &self.inner.gateway;
        // The receive lock keeps the drain-then-swap atomic with
        // respect to deliveries from the receiver thread.
        let _guard = gateway.receive_lock.lock();
        let (drained, ended) = {
            let mut st = self.inner.state.lock();
            let Some(items) = st.items.take() else {
                return Err(ChannelError::CallbackRegistered(self.id()));
            };
            (items, st.closed || st.receive_closed)
        };
        for received in drained {
            match received {
                Received::Item(value) => callback(value),
                Received::End => {
                    if let Some(endmarker) = endmarker {
                        callback(endmarker);
                    }
                    return Ok(());
                },
            }
        }
        if !ended {
            gateway
                .factory
                .register_callback(self.id(), callback, endmarker);
        }
        Ok(())
    }

    /// Closes this channel towards the peer. Rejected while the
    /// channel is bound to a running remote execution; a no-op when
    /// already closed.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.close_opt(None)
    }

    /// Closes the channel carrying an error the peer will observe on
    /// its next receive or wait.
    pub fn close_with_error(&self, error: impl Into<String>) -> Result<(), ChannelError> {
        self.close_opt(Some(error.into()))
    }

    fn close_opt(&self, error: Option<String>) -> Result<(), ChannelError> {
        if self.is_executing() {
            return Err(ChannelError::RemoteOwnsClosure(self.id()));
        }
        let peer_already_closed = {
            let st = self.inner.state.lock();
            if st.closed {
                trace!(id = self.id(), "ignoring redundant close");
                return Ok(());
            }
            st.receive_closed
        };
        if !peer_already_closed {
            // If the peer closed in the meantime a stray close message
            // is harmless; sending one too many never does damage.
            let msg = match error {
                Some(text) => Message::ChannelCloseError {
                    id: self.id(),
                    payload: Value::Str(text),
                },
                None => Message::ChannelClose { id: self.id() },
            };
            self.inner.gateway.send(msg)?;
            trace!(id = self.id(), "sent channel close message");
        }
        {
            let mut st = self.inner.state.lock();
            st.closed = true;
            st.receive_closed = true;
            push_end(&mut st);
        }
        self.inner.cond.notify_all();
        self.inner.gateway.factory.remove(self.id());
        Ok(())
    }

    /// Blocks until the remote signalled that no more data is coming
    /// (full close or half-close). Receivable items may remain. An
    /// error the peer closed with is reraised here.
    pub fn wait_close(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut st = self.inner.state.lock();
        while !st.receive_closed {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::Timeout(
                            timeout.expect("deadline implies timeout"),
                        ));
                    }
                    self.inner.cond.wait_for(&mut st, deadline - now);
                },
                None => {
                    self.inner.cond.wait_for(&mut st, INTERNAL_WAKE);
                },
            }
        }
        match st.remote_errors.pop_front() {
            Some(err) => Err(ChannelError::Remote(err)),
            None => Ok(()),
        }
    }

    /// Iterates received items until the peer closes the stream. A
    /// remote error ends the iteration with an `Err` item.
    pub fn iter(&self) -> ChannelIter<'_> {
        ChannelIter { channel: self }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.is_closed() { "closed" } else { "open" };
        write!(f, "Channel(id={}, {flag})", self.id())
    }
}

pub struct ChannelIter<'a> {
    channel: &'a Channel,
}

impl Iterator for ChannelIter<'_> {
    type Item = Result<Value, ChannelError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.channel.receive() {
            Ok(value) => Some(Ok(value)),
            Err(ChannelError::Eof) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl<'a> IntoIterator for &'a Channel {
    type Item = Result<Value, ChannelError>;
    type IntoIter = ChannelIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
