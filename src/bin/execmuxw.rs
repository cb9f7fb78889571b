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

//! The worker process: serves one gateway connection over stdio (the
//! default, for spawned children) or over a unix/tcp socket, then
//! exits. Exit status 0 after a clean termination; status 1 when a
//! running entry outlived the termination grace period.

use std::fs;
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use execmux::channel::Channel;
use execmux::dirsync;
use execmux::error::ChannelError;
use execmux::prelude::*;
use execmux::transport::Transport;
use execmux::utils;
use execmux::worker::ExecRegistry;
use execmux::worker::WorkerGateway;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use tracing::Level;
use tracing::metadata::ParseLevelError;

#[derive(Clone, Debug, Eq, PartialEq)]
struct SerializableLevel(Level);

impl FromStr for SerializableLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Level::from_str(s)?))
    }
}

impl serde::Serialize for SerializableLevel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for SerializableLevel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self(Level::from_str(&s).map_err(serde::de::Error::custom)?))
    }
}

#[derive(Parser, Debug)]
#[command(name = "execmuxw", about = "Serve one execmux gateway connection")]
struct Args {
    /// Path to a RON config file; command-line flags override it.
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Print a config file with default values to stdout and exit.
    #[arg(long)]
    print_default_config: bool,

    /// Accept one connection on this unix socket instead of stdio.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Accept one connection on this TCP address instead of stdio.
    #[arg(long)]
    tcp: Option<String>,

    /// Mirror logs into this file.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    stderr_log_level: Option<SerializableLevel>,

    #[arg(long)]
    file_log_level: Option<SerializableLevel>,

    /// Seconds a termination request waits for the running entry
    /// before exiting with status 1.
    #[arg(long)]
    termination_grace_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct WorkerConfig {
    socket: Option<PathBuf>,
    tcp: Option<String>,
    log_file: Option<PathBuf>,
    stderr_log_level: SerializableLevel,
    file_log_level: SerializableLevel,
    termination_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            tcp: None,
            log_file: None,
            stderr_log_level: SerializableLevel(Level::INFO),
            file_log_level: SerializableLevel(Level::TRACE),
            termination_grace_secs: 10,
        }
    }
}

impl WorkerConfig {
    fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config_file {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {path:?}"))?;
                ron::from_str(&text).with_context(|| format!("parsing config file {path:?}"))?
            },
            None => Self::default(),
        };
        if let Some(socket) = &args.socket {
            config.socket = Some(socket.clone());
        }
        if let Some(tcp) = &args.tcp {
            config.tcp = Some(tcp.clone());
        }
        if let Some(log_file) = &args.log_file {
            config.log_file = Some(log_file.clone());
        }
        if let Some(level) = &args.stderr_log_level {
            config.stderr_log_level = level.clone();
        }
        if let Some(level) = &args.file_log_level {
            config.file_log_level = level.clone();
        }
        if let Some(grace) = args.termination_grace_secs {
            config.termination_grace_secs = grace;
        }
        Ok(config)
    }
}

/// Built-in diagnostic entry: send every received item back until the
/// controller closes the channel.
fn echo(channel: Channel) -> Result<()> {
    loop {
        match channel.receive() {
            Ok(item) => channel.send(item)?,
            Err(ChannelError::Eof) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

fn registry() -> ExecRegistry {
    let mut registry = ExecRegistry::new();
    registry.register("echo", echo);
    dirsync::register(&mut registry);
    registry
}

fn accept_transport(config: &WorkerConfig) -> Result<Transport> {
    if let Some(path) = &config.socket {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if path.try_exists()? {
            fs::remove_file(path)?;
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding {path:?}"))?;
        info!("waiting for a controller on {path:?}");
        let (stream, _) = listener.accept()?;
        info!("controller connected");
        Ok(Transport::from_unix(stream)?)
    } else if let Some(addr) = &config.tcp {
        let listener = TcpListener::bind(addr).with_context(|| format!("binding {addr}"))?;
        info!("waiting for a controller on {addr}");
        let (stream, peer) = listener.accept()?;
        info!("controller connected from {peer}");
        Ok(Transport::from_tcp(stream)?)
    } else {
        // Claim stdio for the wire before anything can print to it.
        Ok(Transport::stdio()?)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_default_config {
        println!(
            "{}",
            ron::ser::to_string_pretty(&WorkerConfig::default(), Default::default())
                .expect("default config serializes")
        );
        return Ok(());
    }
    let config = WorkerConfig::load(&args)?;

    utils::configure_tracing(
        config.stderr_log_level.0,
        config.log_file.clone(),
        config.file_log_level.0,
    )?;
    utils::exit_on_thread_panic();

    let transport = accept_transport(&config)?;
    let worker = WorkerGateway::new(transport, registry());
    worker.set_termination_grace(Duration::from_secs(config.termination_grace_secs));
    worker.serve()
}
