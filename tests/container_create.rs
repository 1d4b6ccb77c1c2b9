/*
 * Copyright (C) 2026 The Runway Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Create-path behavior that does not need elevated privileges: a
//! bundle without new namespaces forks an init that parks on the sync
//! FIFO, and failed creates roll their state back.

use runway::runway::error::Error;
use runway::runway::lifecycle::{self, CreateOptions};
use runway::runway::paths::Context;
use runway::runway::state::{self, Status};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct EnvGuard {
    key: &'static str,
    previous: Option<String>,
}

impl EnvGuard {
    fn set_path(key: &'static str, value: &Path) -> Self {
        let previous = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, previous }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
    }
}

fn test_context(root: &TempDir) -> Context {
    Context {
        root: root.path().to_path_buf(),
        debug: false,
        systemd_cgroup: false,
    }
}

fn write_bundle(dir: &Path, config: &serde_json::Value) -> PathBuf {
    fs::create_dir_all(dir.join("rootfs")).expect("rootfs dir");
    fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(config).expect("serialize config"),
    )
    .expect("write config");
    dir.to_path_buf()
}

fn plain_bundle(dir: &Path) -> PathBuf {
    write_bundle(
        dir,
        &serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "args": ["/bin/true"], "cwd": "/" }
        }),
    )
}

fn reap(pid: i32) {
    let pid = nix::unistd::Pid::from_raw(pid);
    let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[test]
#[serial]
fn create_parks_the_init_on_the_sync_fifo() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let cgroup_root = TempDir::new().expect("cgroup root");
    let _cgroup = EnvGuard::set_path("RUNWAY_CGROUP_ROOT", cgroup_root.path());

    let ctx = test_context(&state_root);
    let bundle = plain_bundle(bundle_dir.path());
    let opts = CreateOptions {
        bundle,
        ..Default::default()
    };

    let handle = lifecycle::create(&ctx, "parked", &opts).expect("create");
    assert!(handle.init_pid > 0);

    let loaded = state::load(state_root.path(), "parked").expect("state");
    assert_eq!(loaded.status, Status::Created);
    assert_eq!(loaded.pid, handle.init_pid);
    assert!(
        state_root.path().join("parked/sync_fifo").exists(),
        "sync fifo must exist after create"
    );

    // The init must still be parked, not running the payload.
    assert!(runway::runway::process::process_alive(handle.init_pid));

    reap(handle.init_pid);
    lifecycle::delete(&ctx, "parked", true).expect("delete");
    assert!(!state_root.path().join("parked").exists());
}

#[test]
#[serial]
fn create_runtime_hooks_run_once_across_two_creates() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let cgroup_root = TempDir::new().expect("cgroup root");
    let _cgroup = EnvGuard::set_path("RUNWAY_CGROUP_ROOT", cgroup_root.path());

    let counter = bundle_dir.path().join("counter");
    let hook = bundle_dir.path().join("hook.sh");
    fs::write(
        &hook,
        format!("#!/bin/sh\necho run >> {}\n", counter.display()),
    )
    .expect("write hook");
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).expect("chmod");

    let bundle = write_bundle(
        bundle_dir.path(),
        &serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "args": ["/bin/true"], "cwd": "/" },
            "hooks": {
                "createRuntime": [ { "path": hook.to_string_lossy(), "timeout": 5 } ]
            }
        }),
    );
    let ctx = test_context(&state_root);
    let opts = CreateOptions {
        bundle,
        ..Default::default()
    };

    let first = lifecycle::create(&ctx, "once", &opts).expect("first create");
    let second = lifecycle::create(&ctx, "once", &opts).expect("second create");

    let runs = fs::read_to_string(&counter).expect("counter file");
    assert_eq!(runs.lines().count(), 1, "hook must run exactly once");

    let loaded = state::load(state_root.path(), "once").expect("state");
    assert!(loaded.annotations.contains_key("runway.hooks.createRuntime"));

    reap(first.init_pid);
    reap(second.init_pid);
    lifecycle::delete(&ctx, "once", true).expect("delete");
}

#[test]
#[serial]
fn failed_create_rolls_back_its_state_directory() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let cgroup_root = TempDir::new().expect("cgroup root");
    let _cgroup = EnvGuard::set_path("RUNWAY_CGROUP_ROOT", cgroup_root.path());

    // A namespace join path that cannot exist forces a failure before
    // the fork.
    let bundle = write_bundle(
        bundle_dir.path(),
        &serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "args": ["/bin/true"], "cwd": "/" },
            "linux": {
                "namespaces": [ { "type": "net", "path": "/proc/0/ns/net" } ]
            }
        }),
    );
    let ctx = test_context(&state_root);
    let opts = CreateOptions {
        bundle,
        ..Default::default()
    };

    let err = lifecycle::create(&ctx, "doomed", &opts).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // The rollback removed state.json and the fifo; the error event is
    // the only survivor.
    assert!(!state_root.path().join("doomed/state.json").exists());
    assert!(!state_root.path().join("doomed/sync_fifo").exists());
    let events_raw =
        fs::read_to_string(state_root.path().join("doomed/events.log")).expect("error event");
    let last: serde_json::Value =
        serde_json::from_str(events_raw.lines().last().expect("one line")).expect("json");
    assert_eq!(last["type"], "error");
    assert_eq!(last["data"]["phase"], "namespace");
}

#[test]
#[serial]
fn terminal_without_console_socket_is_rejected() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let cgroup_root = TempDir::new().expect("cgroup root");
    let _cgroup = EnvGuard::set_path("RUNWAY_CGROUP_ROOT", cgroup_root.path());

    let bundle = write_bundle(
        bundle_dir.path(),
        &serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "terminal": true, "args": ["/bin/sh"], "cwd": "/" }
        }),
    );
    let ctx = test_context(&state_root);
    let opts = CreateOptions {
        bundle,
        ..Default::default()
    };

    let err = lifecycle::create(&ctx, "tty", &opts).unwrap_err();
    match err {
        Error::ConfigInvalid(message) => assert!(message.contains("console-socket")),
        other => panic!("expected ConfigInvalid, got {:?}", other),
    }
}

#[test]
fn create_rejects_a_bundle_without_config() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let ctx = test_context(&state_root);
    let opts = CreateOptions {
        bundle: bundle_dir.path().to_path_buf(),
        ..Default::default()
    };

    assert!(matches!(
        lifecycle::create(&ctx, "nobundle", &opts),
        Err(Error::ConfigInvalid(_))
    ));
    assert!(!state_root.path().join("nobundle/state.json").exists());
}

#[test]
#[serial]
fn start_requires_a_created_container() {
    let state_root = TempDir::new().expect("state root");
    let ctx = test_context(&state_root);

    assert!(matches!(
        lifecycle::start(&ctx, "missing", false),
        Err(Error::NotFound(_))
    ));

    let mut container = state::ContainerState::new("stopped", "/nowhere", "1.0.0");
    container.status = Status::Stopped;
    state::save(state_root.path(), &container).expect("save");
    assert!(matches!(
        lifecycle::start(&ctx, "stopped", false),
        Err(Error::WrongState { .. })
    ));
}
