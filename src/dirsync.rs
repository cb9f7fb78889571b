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

//! Recursive one-to-many directory transfer over channels.
//!
//! A reference client for the gateway fabric: the controlling side
//! walks a source tree once and broadcasts its structure to every
//! target; each worker mirrors the walk against its destination and
//! requests only the files it actually needs, sending back a checksum
//! of what it already has so unchanged content never travels.
//!
//! Per channel, the conversation is:
//!
//! 1. controller: `(destdir, options)`
//! 2. controller: one structure entry per tree node — a directory is
//!    `[mode, name...]` followed by its children, a file is
//!    `(mode, mtime, size)`
//! 3. worker: `("send", (path, checksum?))` per wanted file, then
//!    `("list_done", none)`
//! 4. controller: one data item per request, in order — file bytes,
//!    or none when the checksum matched
//! 5. worker: `("ack", path)` per written file, `("links", none)`;
//!    controller answers the completion marker `42`
//! 6. worker: `("done", none)` and closes the channel
//!
//! Symbolic links are skipped with a warning.

use std::collections::HashSet;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::Context;
use sha2::Digest;
use sha2::Sha256;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::gateway::Gateway;
use crate::prelude::*;
use crate::wire::value::Value;
use crate::worker::ExecRegistry;

/// Name under which workers register the receiving half.
pub const EXEC_ENTRY: &str = "dirsync";

/// Registers the receiving half in a worker's registry.
pub fn register(registry: &mut ExecRegistry) {
    registry.register(EXEC_ENTRY, serve_dirsync);
}

/// Completion marker the controller sends after the link phase.
const LINKS_DONE: i64 = 42;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Remove files and directories in the destination that do not
    /// exist in the source tree.
    pub delete: bool,
}

struct Target {
    channel: Channel,
    done: bool,
}

enum Reply {
    Item(Value),
    ChannelClosed,
}

/// Sends one source directory to any number of worker destinations.
pub struct DirSync {
    source: PathBuf,
    targets: Vec<Target>,
    reply_tx: crossbeam_channel::Sender<(usize, Reply)>,
    reply_rx: crossbeam_channel::Receiver<(usize, Reply)>,
}

impl DirSync {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        Self {
            source: source.into(),
            targets: Vec::new(),
            reply_tx,
            reply_rx,
        }
    }

    /// Adds a worker destination. The worker must have the
    /// [`EXEC_ENTRY`] entry registered.
    pub fn add_target(
        &mut self,
        gateway: &Gateway,
        destdir: impl AsRef<Path>,
        options: SyncOptions,
    ) -> Result<()> {
        let destdir = destdir
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow!("destination path is not valid utf-8"))?
            .to_string();
        let channel = gateway.remote_exec(EXEC_ENTRY)?;
        let index = self.targets.len();
        let tx = self.reply_tx.clone();
        channel.set_callback_with_endmarker(
            move |value| {
                let reply = match value {
                    Value::None => Reply::ChannelClosed,
                    other => Reply::Item(other),
                };
                let _ = tx.send((index, reply));
            },
            Value::None,
        )?;
        channel.send(Value::Tuple(vec![
            Value::Str(destdir),
            Value::Dict(vec![(Value::from("delete"), Value::Bool(options.delete))]),
        ]))?;
        self.targets.push(Target {
            channel,
            done: false,
        });
        Ok(())
    }

    /// Walks the source tree and serves every target until each one
    /// reported completion.
    pub fn send(mut self) -> Result<()> {
        if self.targets.is_empty() {
            bail!("no targets added before send");
        }
        if !self.source.is_dir() {
            bail!("source {:?} is not a directory", self.source);
        }
        let source = self.source.clone();
        self.send_directory(&source)
            .context("broadcasting the directory structure")?;

        let mut remaining = self.targets.len();
        while remaining > 0 {
            let (index, reply) = self
                .reply_rx
                .recv()
                .context("all target channels vanished")?;
            match reply {
                Reply::ChannelClosed => {
                    if !self.targets[index].done {
                        // Closed before "done": surface the error the
                        // worker closed with, or fail generically.
                        self.targets[index].channel.wait_close(None)?;
                        bail!("target {index} closed its channel before finishing");
                    }
                },
                Reply::Item(value) => {
                    if self.handle_reply(index, &value)? {
                        remaining -= 1;
                    }
                },
            }
        }
        Ok(())
    }

    /// Returns true when this reply completed the target.
    fn handle_reply(&mut self, index: usize, value: &Value) -> Result<bool> {
        let items = value
            .as_tuple()
            .ok_or_else(|| anyhow!("malformed reply {value:?}"))?;
        let [tag, payload] = items else {
            bail!("reply is not a (tag, payload) pair: {value:?}");
        };
        let channel = self.targets[index].channel.clone();
        match tag.as_str() {
            Some("send") => {
                let request = payload
                    .as_tuple()
                    .ok_or_else(|| anyhow!("malformed send request {payload:?}"))?;
                let [path, checksum] = request else {
                    bail!("send request is not (path, checksum): {payload:?}");
                };
                let relpath = relative_path(
                    path.as_list()
                        .ok_or_else(|| anyhow!("send path is not a component list"))?,
                )?;
                let answer = self.file_answer(&relpath, checksum)?;
                channel.send(answer)?;
            },
            Some("list_done") => debug!(target_index = index, "structure walk acknowledged"),
            Some("ack") => {
                trace!(path = ?payload, target_index = index, "file written");
            },
            Some("links") => channel.send(Value::Int(LINKS_DONE))?,
            Some("done") => {
                self.targets[index].done = true;
                channel.wait_close(None)?;
                debug!(target_index = index, "target finished");
                return Ok(true);
            },
            _ => bail!("unknown reply tag {tag:?}"),
        }
        Ok(false)
    }

    /// The data answer for one requested file: its content, or none
    /// when the worker's checksum shows it already has it.
    fn file_answer(&self, relpath: &Path, checksum: &Value) -> Result<Value> {
        let full = self.source.join(relpath);
        match fs::read(&full) {
            Ok(data) => {
                if let Some(expected) = checksum.as_bytes() {
                    if expected == Sha256::digest(&data).as_slice() {
                        return Ok(Value::None);
                    }
                }
                info!("sending {relpath:?} ({} bytes)", data.len());
                Ok(Value::Bytes(data))
            },
            Err(err) => {
                // Vanished between the walk and the request.
                warn!("cannot read {full:?}: {err}");
                Ok(Value::None)
            },
        }
    }

    /// Broadcasts one directory: its entry list, then every child.
    fn send_directory(&self, path: &Path) -> Result<()> {
        let mode = file_mode(path);
        let mut names = Vec::new();
        let mut children = Vec::new();
        let mut dir_entries: Vec<_> = fs::read_dir(path)
            .with_context(|| format!("listing {path:?}"))?
            .collect::<std::io::Result<_>>()?;
        dir_entries.sort_by_key(|entry| entry.file_name());
        for entry in dir_entries {
            let child = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_symlink() {
                warn!("skipping symbolic link {child:?}");
                continue;
            }
            if !file_type.is_dir() && !file_type.is_file() {
                warn!("skipping special file {child:?}");
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!("skipping non-utf8 name {name:?}");
                continue;
            };
            names.push(Value::Str(name.to_string()));
            children.push(child);
        }

        let mut listing = vec![Value::Int(mode)];
        listing.extend(names);
        self.broadcast(Value::List(listing))?;

        for child in children {
            if child.is_dir() {
                self.send_directory(&child)?;
            } else {
                self.broadcast(file_entry(&child))?;
            }
        }
        Ok(())
    }

    fn broadcast(&self, value: Value) -> Result<(), ChannelError> {
        for target in &self.targets {
            target.channel.send(value.clone())?;
        }
        Ok(())
    }
}

/// `(mode, mtime, size)` for one regular file; `(none, 0, 0)` when it
/// cannot be inspected anymore.
fn file_entry(path: &Path) -> Value {
    match fs::metadata(path) {
        Ok(meta) => Value::Tuple(vec![
            Value::Int(file_mode(path)),
            Value::Int(
                meta.modified()
                    .ok()
                    .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            ),
            Value::Int(meta.len() as i64),
        ]),
        Err(_) => Value::Tuple(vec![Value::None, Value::Int(0), Value::Int(0)]),
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> i64 {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| i64::from(meta.permissions().mode()))
        .unwrap_or(0)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> i64 {
    0
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: i64) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(mode) = u32::try_from(mode) {
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: i64) {}

/// Rebuilds a relative path from wire components, refusing anything
/// that would escape the destination tree.
fn relative_path(components: &[Value]) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for component in components {
        let name = component
            .as_str()
            .ok_or_else(|| anyhow!("path component {component:?} is not a string"))?;
        validate_name(name)?;
        path.push(name);
    }
    if path.as_os_str().is_empty() {
        bail!("empty path in request");
    }
    Ok(path)
}

fn validate_name(name: &str) -> Result<()> {
    let candidate = Path::new(name);
    let mut components = candidate.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!("refusing path component {name:?}"),
    }
}

fn path_to_components(path: &Path) -> Result<Vec<Value>> {
    path.components()
        .map(|component| match component {
            Component::Normal(name) => name
                .to_str()
                .map(|name| Value::Str(name.to_string()))
                .ok_or_else(|| anyhow!("non-utf8 path {path:?}")),
            other => Err(anyhow!("unexpected path component {other:?}")),
        })
        .collect()
}

struct PendingFile {
    rel: PathBuf,
    mode: i64,
}

/// The worker half: mirrors the controller's walk against the
/// destination directory and requests what it is missing.
#[instrument(skip_all, fields(id = channel.id()))]
pub fn serve_dirsync(channel: Channel) -> Result<()> {
    let opening = channel.receive()?;
    let items = opening
        .as_tuple()
        .ok_or_else(|| anyhow!("expected (destdir, options), got {opening:?}"))?;
    let [destdir, options] = items else {
        bail!("expected (destdir, options), got {opening:?}");
    };
    let destdir = PathBuf::from(
        destdir
            .as_str()
            .ok_or_else(|| anyhow!("destination is not a string"))?,
    );
    let delete = options
        .dict_get("delete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    info!(?destdir, delete, "receiving directory tree");
    fs::create_dir_all(&destdir)?;

    let mut pending = Vec::new();
    let mut seen = HashSet::new();
    receive_entry(&channel, &destdir, PathBuf::new(), &mut pending, &mut seen)?;
    channel.send(Value::Tuple(vec![Value::from("list_done"), Value::None]))?;

    for file in &pending {
        let data = channel.receive()?;
        let dest = destdir.join(&file.rel);
        match data {
            Value::None => trace!("unchanged {:?}", file.rel),
            Value::Bytes(bytes) => {
                fs::write(&dest, bytes).with_context(|| format!("writing {dest:?}"))?;
                apply_mode(&dest, file.mode);
                let rel_text = file.rel.to_string_lossy().into_owned();
                channel.send(Value::Tuple(vec![
                    Value::from("ack"),
                    Value::Str(rel_text),
                ]))?;
            },
            other => bail!("expected file data, got {other:?}"),
        }
    }

    channel.send(Value::Tuple(vec![Value::from("links"), Value::None]))?;
    loop {
        let item = channel.receive()?;
        if item == Value::Int(LINKS_DONE) {
            break;
        }
        // Link entries are not mirrored; consume and ignore them.
        debug!("ignoring link entry {item:?}");
    }

    if delete {
        delete_unseen(&destdir, &PathBuf::new(), &seen)?;
    }

    channel.send(Value::Tuple(vec![Value::from("done"), Value::None]))?;
    Ok(())
}

/// Applies one structure entry at `rel`; directories recurse in the
/// exact order the controller walked them.
fn receive_entry(
    channel: &Channel,
    destroot: &Path,
    rel: PathBuf,
    pending: &mut Vec<PendingFile>,
    seen: &mut HashSet<PathBuf>,
) -> Result<()> {
    let entry = channel.receive()?;
    match entry {
        Value::List(items) => {
            let [mode, names @ ..] = items.as_slice() else {
                bail!("empty directory entry");
            };
            let dest = destroot.join(&rel);
            fs::create_dir_all(&dest)?;
            if let Some(mode) = mode.as_int() {
                apply_mode(&dest, mode);
            }
            if !rel.as_os_str().is_empty() {
                seen.insert(rel.clone());
            }
            let names: Vec<String> = names
                .iter()
                .map(|name| {
                    let name = name
                        .as_str()
                        .ok_or_else(|| anyhow!("directory name {name:?} is not a string"))?;
                    validate_name(name)?;
                    Ok(name.to_string())
                })
                .collect::<Result<_>>()?;
            for name in names {
                receive_entry(channel, destroot, rel.join(name), pending, seen)?;
            }
        },
        Value::Tuple(items) => {
            let [mode, _mtime, size] = items.as_slice() else {
                bail!("malformed file entry");
            };
            let Some(mode) = mode.as_int() else {
                // The source could not inspect it; nothing to mirror.
                return Ok(());
            };
            seen.insert(rel.clone());
            let dest = destroot.join(&rel);
            let checksum = match fs::metadata(&dest) {
                Ok(meta) if meta.is_file() && Some(meta.len() as i64) == size.as_int() => {
                    Value::Bytes(Sha256::digest(fs::read(&dest)?).to_vec())
                },
                _ => Value::None,
            };
            channel.send(Value::Tuple(vec![
                Value::from("send"),
                Value::Tuple(vec![Value::List(path_to_components(&rel)?), checksum]),
            ]))?;
            pending.push(PendingFile { rel, mode });
        },
        other => bail!("unexpected structure entry {other:?}"),
    }
    Ok(())
}

/// Removes everything under the destination that the walk never
/// mentioned.
fn delete_unseen(destroot: &Path, rel: &Path, seen: &HashSet<PathBuf>) -> Result<()> {
    let dir = destroot.join(rel);
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let child_rel = rel.join(entry.file_name());
        if seen.contains(&child_rel) {
            if entry.file_type()?.is_dir() {
                delete_unseen(destroot, &child_rel, seen)?;
            }
            continue;
        }
        let child = entry.path();
        info!("deleting {child:?}");
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&child)?;
        } else {
            fs::remove_file(&child)?;
        }
    }
    Ok(())
}
