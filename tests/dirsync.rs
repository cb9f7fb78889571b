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

//! Directory transfer over a live gateway pair.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use execmux::dirsync;
use execmux::dirsync::DirSync;
use execmux::dirsync::SyncOptions;
use execmux::gateway::Gateway;
use execmux::transport::Transport;
use execmux::worker::ExecRegistry;
use execmux::worker::WorkerGateway;

struct Fixture {
    gateway: Gateway,
    worker: Option<thread::JoinHandle<anyhow::Result<()>>>,
}

fn pair() -> Fixture {
    let (controller_stream, worker_stream) = UnixStream::pair().unwrap();
    let mut registry = ExecRegistry::new();
    dirsync::register(&mut registry);
    let worker = WorkerGateway::new(Transport::from_unix(worker_stream).unwrap(), registry);
    let handle = thread::spawn(move || worker.serve());
    Fixture {
        gateway: Gateway::new(Transport::from_unix(controller_stream).unwrap()),
        worker: Some(handle),
    }
}

impl Fixture {
    fn shutdown(mut self) {
        self.gateway.terminate().unwrap();
        self.worker.take().unwrap().join().unwrap().unwrap();
        self.gateway.join();
    }
}

fn build_source(root: &Path) {
    fs::create_dir_all(root.join("sub/deeper")).unwrap();
    fs::write(root.join("top.txt"), b"top level").unwrap();
    fs::write(root.join("sub/data.bin"), [0u8, 1, 2, 255]).unwrap();
    fs::write(root.join("sub/deeper/leaf.txt"), b"leaf content").unwrap();
}

fn assert_mirrored(dest: &Path) {
    assert_eq!(fs::read(dest.join("top.txt")).unwrap(), b"top level");
    assert_eq!(fs::read(dest.join("sub/data.bin")).unwrap(), [0u8, 1, 2, 255]);
    assert_eq!(
        fs::read(dest.join("sub/deeper/leaf.txt")).unwrap(),
        b"leaf content"
    );
}

#[test]
fn a_tree_is_mirrored_to_the_destination() {
    let fx = pair();
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    build_source(source.path());

    let mut sync = DirSync::new(source.path());
    sync.add_target(&fx.gateway, dest.path().join("out"), SyncOptions::default())
        .unwrap();
    sync.send().unwrap();

    assert_mirrored(&dest.path().join("out"));
    fx.shutdown();
}

#[test]
fn a_second_sync_over_an_up_to_date_tree_succeeds() {
    let fx = pair();
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    build_source(source.path());
    let out = dest.path().join("out");

    for _ in 0..2 {
        let mut sync = DirSync::new(source.path());
        sync.add_target(&fx.gateway, &out, SyncOptions::default())
            .unwrap();
        sync.send().unwrap();
    }

    assert_mirrored(&out);
    fx.shutdown();
}

#[test]
fn changed_content_is_refreshed() {
    let fx = pair();
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    build_source(source.path());
    let out = dest.path().join("out");

    let mut sync = DirSync::new(source.path());
    sync.add_target(&fx.gateway, &out, SyncOptions::default())
        .unwrap();
    sync.send().unwrap();

    fs::write(source.path().join("top.txt"), b"rewritten").unwrap();
    let mut sync = DirSync::new(source.path());
    sync.add_target(&fx.gateway, &out, SyncOptions::default())
        .unwrap();
    sync.send().unwrap();

    assert_eq!(fs::read(out.join("top.txt")).unwrap(), b"rewritten");
    fx.shutdown();
}

#[test]
fn delete_option_removes_files_the_source_does_not_have() {
    let fx = pair();
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    build_source(source.path());
    let out = dest.path().join("out");
    fs::create_dir_all(out.join("stale-dir")).unwrap();
    fs::write(out.join("stale.txt"), b"old").unwrap();
    fs::write(out.join("stale-dir/extra.txt"), b"old").unwrap();

    let mut sync = DirSync::new(source.path());
    sync.add_target(&fx.gateway, &out, SyncOptions { delete: true })
        .unwrap();
    sync.send().unwrap();

    assert_mirrored(&out);
    assert!(!out.join("stale.txt").exists());
    assert!(!out.join("stale-dir").exists());
    fx.shutdown();
}

#[test]
fn one_walk_feeds_two_destinations() {
    let fx = pair();
    let source = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    build_source(source.path());

    let mut sync = DirSync::new(source.path());
    sync.add_target(&fx.gateway, dest.path().join("one"), SyncOptions::default())
        .unwrap();
    sync.add_target(&fx.gateway, dest.path().join("two"), SyncOptions::default())
        .unwrap();
    sync.send().unwrap();

    assert_mirrored(&dest.path().join("one"));
    assert_mirrored(&dest.path().join("two"));
    fx.shutdown();
}

#[test]
fn send_without_targets_is_an_error() {
    let source = tempfile::tempdir().unwrap();
    let sync = DirSync::new(source.path());
    assert!(sync.send().is_err());
}
