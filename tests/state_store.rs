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
use runway::runway::paths::Context;
use runway::runway::state::{self, ContainerState, Status};
use runway::runway::{lifecycle, RUNTIME_VERSION};
use std::fs;
use tempfile::TempDir;

fn test_context(root: &TempDir) -> Context {
    Context {
        root: root.path().to_path_buf(),
        debug: false,
        systemd_cgroup: false,
    }
}

#[test]
fn state_directory_layout_is_deterministic() {
    let tmp = TempDir::new().expect("tempdir");
    let ctx = test_context(&tmp);

    assert_eq!(ctx.state_file("demo"), tmp.path().join("demo/state.json"));
    assert_eq!(ctx.fifo_path("demo"), tmp.path().join("demo/sync_fifo"));
    assert_eq!(ctx.events_path("demo"), tmp.path().join("demo/events.log"));
}

#[test]
fn persisted_document_round_trips_through_the_store() {
    let tmp = TempDir::new().expect("tempdir");
    let mut container = ContainerState::new("demo", "/bundles/demo", "1.0.0");
    container.pid = 77;
    container.status = Status::Created;
    state::save(tmp.path(), &container).expect("save");

    let raw = fs::read_to_string(tmp.path().join("demo/state.json")).expect("state file");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
    assert_eq!(value["id"], "demo");
    assert_eq!(value["status"], "created");
    assert_eq!(value["ociVersion"], "1.0.0");
    assert_eq!(value["version"], RUNTIME_VERSION);
    assert_eq!(value["bundle"], "/bundles/demo");

    let loaded = state::load(tmp.path(), "demo").expect("load");
    assert_eq!(loaded.pid, 77);
    assert_eq!(loaded.status, Status::Created);
}

#[test]
fn unknown_container_loads_as_not_found() {
    let tmp = TempDir::new().expect("tempdir");
    assert!(matches!(
        state::load(tmp.path(), "missing"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn truncated_state_file_loads_as_corrupt() {
    let tmp = TempDir::new().expect("tempdir");
    fs::create_dir_all(tmp.path().join("demo")).expect("mkdir");
    fs::write(tmp.path().join("demo/state.json"), "{\"id\": \"demo\"").expect("write");
    assert!(matches!(
        state::load(tmp.path(), "demo"),
        Err(Error::Corrupt { .. })
    ));
}

#[test]
fn state_json_downgrades_a_dead_running_container() {
    let tmp = TempDir::new().expect("tempdir");
    let ctx = test_context(&tmp);

    let mut container = ContainerState::new("demo", "/bundles/demo", "1.0.0");
    // A pid far above any live process on the test machine.
    container.pid = i32::MAX - 7;
    container.status = Status::Running;
    state::save(tmp.path(), &container).expect("save");

    let rendered = lifecycle::state_json(&ctx, "demo").expect("state");
    let value: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
    assert_eq!(value["status"], "stopped");

    // The downgrade is persisted.
    let reloaded = state::load(tmp.path(), "demo").expect("reload");
    assert_eq!(reloaded.status, Status::Stopped);
}

#[test]
fn state_json_leaves_a_stopped_container_untouched() {
    let tmp = TempDir::new().expect("tempdir");
    let ctx = test_context(&tmp);

    let mut container = ContainerState::new("demo", "/bundles/demo", "1.0.0");
    container.pid = 12;
    container.status = Status::Stopped;
    state::save(tmp.path(), &container).expect("save");

    let rendered = lifecycle::state_json(&ctx, "demo").expect("state");
    let value: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
    assert_eq!(value["status"], "stopped");
}

#[test]
fn state_output_is_indented() {
    let mut container = ContainerState::new("demo", "/bundles/demo", "1.0.0");
    container.status = Status::Created;
    let rendered = container.to_json();
    assert!(rendered.contains("\n    \""), "expected indentation: {}", rendered);
}
