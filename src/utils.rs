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

use std::any::Any;
use std::backtrace::Backtrace;
use std::env;
use std::fs::File;
use std::io;
use std::panic;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex as StdMutex;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use tracing::Level;
use tracing_subscriber::prelude::*;

use crate::prelude::*;

/// Environment variable for the opt-in wire trace: `"2"` traces to
/// stderr, any other non-empty value traces to a per-process file in
/// the temp dir. Observability only, no semantic effect.
pub const DEBUG_ENV_VAR: &str = "EXECMUX_DEBUG";

/// Sets up the tracing layers. The debug environment hook, when set,
/// overrides the passed levels with a full trace.
pub fn configure_tracing(
    stderr_log_level: Level,
    log_file: Option<PathBuf>,
    file_log_level: Level,
) -> Result<()> {
    let (stderr_log_level, log_file, file_log_level) =
        match env::var(DEBUG_ENV_VAR).ok().filter(|v| !v.is_empty()) {
            Some(v) if v == "2" => (Level::TRACE, None, file_log_level),
            Some(_) => {
                let path =
                    env::temp_dir().join(format!("execmux-debug-{}.log", process::id()));
                eprintln!("tracing to {path:?}");
                (stderr_log_level, Some(path), Level::TRACE)
            },
            None => (stderr_log_level, log_file, file_log_level),
        };

    let mut layers = Vec::new();
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr.with_max_level(stderr_log_level))
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(path) = log_file {
        let log_file = File::create(path)?;
        let log_file_writer = StdMutex::new(log_file).with_max_level(file_log_level);
        layers.push(layer.map_writer(|w| w.and(log_file_writer)).boxed());
    } else {
        layers.push(layer.boxed());
    }

    tracing_subscriber::registry().with(layers).init();
    Ok(())
}

/// A panic on any thread takes the whole process down; a worker with a
/// dead receiver or serve loop must not linger half-alive.
pub fn exit_on_thread_panic() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = Backtrace::capture();
        error!("panic!:\n{panic_info}\n{backtrace}");
        orig_hook(panic_info);
        process::exit(1);
    }));
}

pub fn join_unwrap<T>(handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(t) => t,
        Err(e) => panic::resume_unwind(e),
    }
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One-shot boolean gate with a timed wait.
pub(crate) struct Latch {
    state: parking_lot::Mutex<bool>,
    cond: parking_lot::Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: parking_lot::Mutex::new(false),
            cond: parking_lot::Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        *self.state.lock() = true;
        self.cond.notify_all();
    }

    /// True if the latch was set within `timeout`.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.state.lock();
        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_for(&mut set, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_wait_times_out_then_succeeds() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.set();
        assert!(latch.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn latch_set_from_another_thread_releases_the_wait() {
        let latch = std::sync::Arc::new(Latch::new());
        let setter = latch.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            setter.set();
        });
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new("formatted boom".to_string());
        assert_eq!(panic_message(payload), "formatted boom");
        let payload: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(payload), "non-string panic payload");
    }
}
