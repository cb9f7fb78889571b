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

//! The worker endpoint: receives execution requests and runs them on
//! the main thread, one at a time, each with its channel bound.
//!
//! Execution entries are named functions registered up front; an
//! inbound request names the entry to run. The outcome folds into the
//! channel's closure: a clean return closes it, an error closes it
//! with the formatted report, and the dedicated stop-serving error
//! additionally ends the serve loop.

use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::channel::Channel;
use crate::gateway::ExecHooks;
use crate::gateway::GatewayCore;
use crate::gateway::WORKER_START_ID;
use crate::gateway::spawn_receiver;
use crate::prelude::*;
use crate::transport::Transport;
use crate::transport::TransportRead;
use crate::utils::Latch;
use crate::utils::join_unwrap;
use crate::utils::panic_message;
use crate::wire::deserialize::CoerceOptions;

/// Returned (via `anyhow::bail!`) by an execution entry to end the
/// worker's serve loop after its own channel closed cleanly.
#[derive(Debug, thiserror::Error)]
#[error("stop serving")]
pub struct StopServing;

type ExecFn = Arc<dyn Fn(Channel) -> Result<()> + Send + Sync>;

/// The named entry points a worker is willing to execute.
#[derive(Default)]
pub struct ExecRegistry {
    entries: std::collections::HashMap<String, ExecFn>,
}

impl ExecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `name`. The function runs on the worker
    /// main thread with the request's channel bound to it.
    pub fn register<F>(&mut self, name: impl Into<String>, entry: F)
    where
        F: Fn(Channel) -> Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(entry));
    }

    fn get(&self, name: &str) -> Option<ExecFn> {
        self.entries.get(name).cloned()
    }
}

/// Worker endpoint of a connection; pairs with a controlling
/// [`Gateway`](crate::gateway::Gateway) on the other side.
pub struct WorkerGateway {
    core: Arc<GatewayCore>,
    registry: ExecRegistry,
    exec_rx: Receiver<Option<(Channel, String)>>,
    reader: Box<dyn TransportRead>,
}

impl WorkerGateway {
    pub fn new(transport: Transport, registry: ExecRegistry) -> Self {
        Self::with_options(transport, registry, CoerceOptions::default())
    }

    pub fn with_options(
        transport: Transport,
        registry: ExecRegistry,
        options: CoerceOptions,
    ) -> Self {
        let Transport { reader, writer } = transport;
        let (queue_tx, exec_rx) = crossbeam_channel::unbounded();
        let hooks = ExecHooks {
            queue_tx,
            finished: Arc::new(Latch::new()),
            grace: Mutex::new(Duration::from_secs(10)),
        };
        let core = GatewayCore::new(writer, WORKER_START_ID, options, Some(hooks));
        Self {
            core,
            registry,
            exec_rx,
            reader,
        }
    }

    /// How long a termination request waits for the running entry
    /// before the process is ended with status 1. Default 10 seconds.
    pub fn set_termination_grace(&self, grace: Duration) {
        if let Some(hooks) = &self.core.exec {
            *hooks.grace.lock() = grace;
        }
    }

    /// Runs the execution loop until the peer terminates the gateway,
    /// the transport reaches end-of-file, or an entry stops serving.
    pub fn serve(self) -> Result<()> {
        let Self {
            core,
            registry,
            exec_rx,
            reader,
        } = self;
        let receiver = spawn_receiver(core.clone(), reader);
        info!("serving execution requests");
        while let Ok(Some((channel, entry))) = exec_rx.recv() {
            if !execute(&registry, channel, &entry) {
                break;
            }
        }
        if let Some(hooks) = &core.exec {
            hooks.finished.set();
        }
        trace!("closing the write half");
        core.close_write();
        join_unwrap(receiver);
        trace!("serve finished");
        Ok(())
    }
}

/// Runs one entry and folds the outcome into the channel closure.
/// Returns false when the loop should stop.
#[instrument(skip_all, fields(id = channel.id(), entry = entry))]
fn execute(registry: &ExecRegistry, channel: Channel, entry: &str) -> bool {
    let Some(func) = registry.get(entry) else {
        warn!("request for an unknown execution entry");
        let _ = channel.close_with_error(format!("unknown execution entry {entry:?}"));
        return true;
    };
    debug!("execution starts");
    channel.set_executing(true);
    let result = panic::catch_unwind(AssertUnwindSafe(|| func(channel.clone())));
    channel.set_executing(false);
    debug!("execution finished");
    match result {
        Ok(Ok(())) => {
            close_quietly(&channel);
            true
        },
        Ok(Err(err)) if err.is::<StopServing>() => {
            close_quietly(&channel);
            false
        },
        Ok(Err(err)) => {
            let _ = channel.close_with_error(format!("{err:?}"));
            true
        },
        Err(payload) => {
            let text = format!("execution panicked: {}", panic_message(payload));
            let _ = channel.close_with_error(text);
            true
        },
    }
}

fn close_quietly(channel: &Channel) {
    if let Err(err) = channel.close() {
        debug!("closing the execution channel failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::gateway::test_support::decode_frames;
    use crate::gateway::test_support::loopless_core;
    use crate::wire::Message;
    use crate::wire::value::Value;

    fn channel_for_exec(core: &Arc<GatewayCore>) -> Channel {
        core.factory.create(core, Some(1)).unwrap()
    }

    #[test]
    fn clean_return_closes_the_channel() {
        let (core, written) = loopless_core();
        let channel = channel_for_exec(&core);
        let mut registry = ExecRegistry::new();
        registry.register("send-one", |channel: Channel| {
            channel.send(Value::Int(1))?;
            Ok(())
        });
        assert!(execute(&registry, channel.clone(), "send-one"));
        assert!(channel.is_closed());

        let frames = decode_frames(&written.lock().unwrap());
        assert!(matches!(frames[0], Message::ChannelData { .. }));
        assert!(matches!(frames[1], Message::ChannelClose { .. }));
    }

    #[test]
    fn an_error_is_folded_into_a_close_error() {
        let (core, written) = loopless_core();
        let channel = channel_for_exec(&core);
        let mut registry = ExecRegistry::new();
        registry.register("explode", |_channel: Channel| bail!("it went sideways"));
        assert!(execute(&registry, channel, "explode"));

        let frames = decode_frames(&written.lock().unwrap());
        match &frames[0] {
            Message::ChannelCloseError { payload, .. } => {
                assert!(payload.as_str().unwrap().contains("it went sideways"));
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn a_panic_is_folded_into_a_close_error() {
        let (core, written) = loopless_core();
        let channel = channel_for_exec(&core);
        let mut registry = ExecRegistry::new();
        registry.register("blow-up", |_channel: Channel| panic!("entry panicked hard"));
        assert!(execute(&registry, channel, "blow-up"));

        let frames = decode_frames(&written.lock().unwrap());
        match &frames[0] {
            Message::ChannelCloseError { payload, .. } => {
                let text = payload.as_str().unwrap();
                assert!(text.contains("execution panicked"));
                assert!(text.contains("entry panicked hard"));
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn stop_serving_ends_the_loop_after_a_clean_close() {
        let (core, written) = loopless_core();
        let channel = channel_for_exec(&core);
        let mut registry = ExecRegistry::new();
        registry.register("wind-down", |_channel: Channel| bail!(StopServing));
        assert!(!execute(&registry, channel, "wind-down"));

        let frames = decode_frames(&written.lock().unwrap());
        assert!(matches!(frames[0], Message::ChannelClose { .. }));
    }

    #[test]
    fn unknown_entries_close_with_an_error() {
        let (core, written) = loopless_core();
        let channel = channel_for_exec(&core);
        let registry = ExecRegistry::new();
        assert!(execute(&registry, channel, "no-such-entry"));

        let frames = decode_frames(&written.lock().unwrap());
        match &frames[0] {
            Message::ChannelCloseError { payload, .. } => {
                assert!(payload.as_str().unwrap().contains("no-such-entry"));
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn explicit_close_inside_an_entry_is_rejected() {
        let (core, _written) = loopless_core();
        let channel = channel_for_exec(&core);
        let mut registry = ExecRegistry::new();
        registry.register("self-close", |channel: Channel| {
            match channel.close() {
                Err(ChannelError::RemoteOwnsClosure(_)) => Ok(()),
                other => bail!("close was not rejected: {other:?}"),
            }
        });
        assert!(execute(&registry, channel.clone(), "self-close"));
        // The loop still closed it afterwards.
        assert!(channel.is_closed());
    }
}
