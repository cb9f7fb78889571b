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

//! Allocation and routing of channels.
//!
//! The factory only holds weak references: user code, message payloads
//! and the receiver thread keep channels alive, and dropping the last
//! strong handle triggers the channel's own teardown protocol. Ids
//! allocated locally step by two from the configured start count, so
//! the two sides of a connection draw from disjoint parities and never
//! collide without coordinating.

use std::collections::HashMap;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::channel::ChannelInner;
use crate::error::ChannelError;
use crate::error::RemoteError;
use crate::gateway::GatewayCore;
use crate::prelude::*;
use crate::utils::panic_message;
use crate::wire::Message;
use crate::wire::value::Value;

/// Close reason a peer sends when user code was interrupted
/// interactively; suppressed from the unhandled-error warnings.
pub(crate) const INTERRUPT_TEXT: &str = "keyboard-interrupted";

pub(crate) type Callback = Arc<dyn Fn(Value) + Send + Sync>;

struct CallbackEntry {
    func: Callback,
    endmarker: Option<Value>,
}

struct FactoryState {
    channels: HashMap<u32, Weak<ChannelInner>>,
    count: u32,
    finished: bool,
}

pub(crate) struct ChannelFactory {
    state: Mutex<FactoryState>,
    callbacks: Mutex<HashMap<u32, CallbackEntry>>,
}

impl ChannelFactory {
    pub(crate) fn new(startcount: u32) -> Self {
        Self {
            state: Mutex::new(FactoryState {
                channels: HashMap::new(),
                count: startcount,
                finished: false,
            }),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel for `id`, creating it if unknown; allocates
    /// a fresh local id when `id` is `None`.
    pub(crate) fn create(
        &self,
        gateway: &Arc<GatewayCore>,
        id: Option<u32>,
    ) -> Result<Channel, ChannelError> {
        let mut st = self.state.lock();
        if st.finished {
            return Err(ChannelError::ConnectionClosed);
        }
        let id = id.unwrap_or_else(|| {
            let id = st.count;
            st.count += 2;
            id
        });
        if let Some(inner) = st.channels.get(&id).and_then(Weak::upgrade) {
            return Ok(Channel { inner });
        }
        let inner = Arc::new(ChannelInner::new(id, gateway.clone()));
        st.channels.insert(id, Arc::downgrade(&inner));
        Ok(Channel { inner })
    }

    /// Snapshot of the currently live channels.
    pub(crate) fn channels(&self) -> Vec<Channel> {
        let inners: Vec<Arc<ChannelInner>> = {
            let st = self.state.lock();
            st.channels.values().filter_map(Weak::upgrade).collect()
        };
        inners.into_iter().map(|inner| Channel { inner }).collect()
    }

    fn get(&self, id: u32) -> Option<Channel> {
        let inner = self.state.lock().channels.get(&id).and_then(Weak::upgrade);
        inner.map(|inner| Channel { inner })
    }

    /// Forgets `id` and fires a registered endmarker, if any. Called
    /// once a channel left the "opened" state.
    pub(crate) fn remove(&self, id: u32) {
        {
            self.state.lock().channels.remove(&id);
        }
        let entry = self.callbacks.lock().remove(&id);
        if let Some(CallbackEntry {
            func,
            endmarker: Some(endmarker),
        }) = entry
        {
            func(endmarker);
        }
    }

    /// Drops a stale weak entry after the last handle went away. The
    /// callback registration stays; the peer may still send.
    pub(crate) fn prune(&self, id: u32) {
        let mut st = self.state.lock();
        if let Some(weak) = st.channels.get(&id) {
            if weak.strong_count() == 0 {
                st.channels.remove(&id);
            }
        }
    }

    pub(crate) fn register_callback(&self, id: u32, func: Callback, endmarker: Option<Value>) {
        self.callbacks
            .lock()
            .insert(id, CallbackEntry { func, endmarker });
    }

    /// Routes one inbound payload: callback if registered (invoked in
    /// the receiver thread), else the channel's queue, else dropped.
    pub(crate) fn local_receive(&self, gateway: &Arc<GatewayCore>, id: u32, data: Value) {
        let callback = {
            self.callbacks.lock().get(&id).map(|entry| entry.func.clone())
        };
        match callback {
            Some(func) => {
                // The channel may already be closed; the callback still
                // gets the data. A panicking callback poisons only its
                // own channel, with the report sent back to the peer.
                let result = panic::catch_unwind(AssertUnwindSafe(|| func(data)));
                if let Err(payload) = result {
                    let text = panic_message(payload);
                    debug!(id, "exception during callback: {text}");
                    let _ = gateway.send(Message::ChannelCloseError {
                        id,
                        payload: Value::Str(text.clone()),
                    });
                    self.local_close(id, Some(RemoteError::new(text)), false);
                }
            },
            None => match self.get(id) {
                Some(channel) => channel.inner.push_data(data),
                None => trace!(id, "dropping data for a vanished channel"),
            },
        }
    }

    /// Applies a close observed by the receiver thread (or synthesized
    /// at shutdown) to the local channel state.
    pub(crate) fn local_close(&self, id: u32, remote_error: Option<RemoteError>, sendonly: bool) {
        match self.get(id) {
            Some(channel) => channel.inner.local_close(remote_error, sendonly),
            None => {
                // Already in the "deleted" state locally.
                if let Some(err) = remote_error {
                    if err.formatted != INTERRUPT_TEXT {
                        err.warn_unhandled();
                    }
                }
            },
        }
        self.remove(id);
    }

    /// Gateway shutdown: no new channels, every known channel becomes
    /// half-closed, every remaining endmarker fires.
    pub(crate) fn finished_receiving(&self) {
        {
            self.state.lock().finished = true;
        }
        let ids: Vec<u32> = {
            let st = self.state.lock();
            st.channels.keys().copied().collect()
        };
        for id in ids {
            self.local_close(id, None, true);
        }
        let remaining: Vec<u32> = {
            let callbacks = self.callbacks.lock();
            callbacks.keys().copied().collect()
        };
        for id in remaining {
            self.remove(id);
        }
    }
}
