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

use runway::runway::error::Error;
use runway::runway::events;
use runway::runway::lifecycle;
use runway::runway::paths::Context;
use runway::runway::state::{self, ContainerState, Status, ANNOTATION_CGROUP_PATH};
use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
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

fn stopped_state(root: &TempDir, id: &str, bundle: &str) -> ContainerState {
    let mut container = ContainerState::new(id, bundle, "1.0.0");
    container.pid = 0;
    container.status = Status::Stopped;
    state::save(root.path(), &container).expect("save");
    container
}

#[test]
fn delete_removes_every_on_disk_resource() {
    let state_root = TempDir::new().expect("state root");
    let ctx = test_context(&state_root);
    stopped_state(&state_root, "demo", "/nowhere");

    // Populate the full layout: fifo and events log beside state.json.
    nix::unistd::mkfifo(
        ctx.fifo_path("demo").as_path(),
        nix::sys::stat::Mode::from_bits_truncate(0o666),
    )
    .expect("mkfifo");
    events::record(state_root.path(), "demo", "state", None);

    lifecycle::delete(&ctx, "demo", false).expect("delete");

    assert!(!state_root.path().join("demo").exists());
}

#[test]
fn delete_requires_stopped_without_force() {
    let state_root = TempDir::new().expect("state root");
    let ctx = test_context(&state_root);

    let child = std::process::Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleeper");
    let mut container = ContainerState::new("busy", "/nowhere", "1.0.0");
    container.pid = child.id() as i32;
    container.status = Status::Running;
    state::save(state_root.path(), &container).expect("save");

    assert!(matches!(
        lifecycle::delete(&ctx, "busy", false),
        Err(Error::WrongState { .. })
    ));
    assert!(state_root.path().join("busy/state.json").exists());

    // Force delete kills the process and removes the directory.
    lifecycle::delete(&ctx, "busy", true).expect("force delete");
    assert!(!state_root.path().join("busy").exists());
    let pid = nix::unistd::Pid::from_raw(child.id() as i32);
    let _ = nix::sys::wait::waitpid(pid, None);
}

#[test]
fn delete_runs_poststop_hooks_from_the_bundle() {
    let state_root = TempDir::new().expect("state root");
    let bundle_dir = TempDir::new().expect("bundle dir");
    let ctx = test_context(&state_root);

    let witness = bundle_dir.path().join("poststop-ran");
    let hook = bundle_dir.path().join("hook.sh");
    fs::write(
        &hook,
        format!("#!/bin/sh\ntouch {}\n", witness.display()),
    )
    .expect("write hook");
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).expect("chmod");

    fs::create_dir_all(bundle_dir.path().join("rootfs")).expect("rootfs");
    fs::write(
        bundle_dir.path().join("config.json"),
        serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "args": ["/bin/true"], "cwd": "/" },
            "hooks": {
                "poststop": [ { "path": hook.to_string_lossy(), "timeout": 5 } ]
            }
        })
        .to_string(),
    )
    .expect("write config");

    stopped_state(&state_root, "demo", &bundle_dir.path().to_string_lossy());

    lifecycle::delete(&ctx, "demo", false).expect("delete");
    assert!(witness.exists(), "poststop hook must run during delete");
    assert!(!state_root.path().join("demo").exists());
}

#[test]
#[serial]
fn delete_removes_the_annotated_cgroup() {
    let state_root = TempDir::new().expect("state root");
    let cgroup_root = TempDir::new().expect("cgroup root");
    let _cgroup = EnvGuard::set_path("RUNWAY_CGROUP_ROOT", cgroup_root.path());
    let ctx = test_context(&state_root);

    // Simulate the cgroup created during create (v2 layout).
    fs::write(cgroup_root.path().join("cgroup.controllers"), "cpu memory\n")
        .expect("controllers");
    let cgroup_dir = cgroup_root.path().join("my_runtime/demo");
    fs::create_dir_all(&cgroup_dir).expect("cgroup dir");

    let mut container = ContainerState::new("demo", "/nowhere", "1.0.0");
    container.status = Status::Stopped;
    container.annotations.insert(
        ANNOTATION_CGROUP_PATH.to_string(),
        "my_runtime/demo".to_string(),
    );
    state::save(state_root.path(), &container).expect("save");

    lifecycle::delete(&ctx, "demo", false).expect("delete");
    assert!(!cgroup_dir.exists(), "cgroup subtree must be removed");
}

#[test]
fn delete_of_unknown_container_is_not_found() {
    let state_root = TempDir::new().expect("state root");
    let ctx = test_context(&state_root);
    assert!(matches!(
        lifecycle::delete(&ctx, "ghost", false),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn exec_requires_a_running_container() {
    let state_root = TempDir::new().expect("state root");
    let ctx = test_context(&state_root);
    stopped_state(&state_root, "demo", "/nowhere");

    let opts = lifecycle::ExecOptions {
        args: vec!["/bin/true".to_string()],
        ..Default::default()
    };
    assert!(matches!(
        lifecycle::exec(&ctx, "demo", &opts),
        Err(Error::WrongState { .. })
    ));
}
