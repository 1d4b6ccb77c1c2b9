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

//! Append-only JSONL journal of lifecycle events, one log per container.

use crate::runway::mount::ensure_parent_directory;
use crate::runway::state::ContainerState;
use chrono::{SecondsFormat, Utc};
use log::warn;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

pub fn events_path(root: &Path, id: &str) -> std::path::PathBuf {
    root.join(id).join("events.log")
}

/// Append one event record. Journal failures are reported but never fail
/// the lifecycle operation that produced the event.
pub fn record(root: &Path, id: &str, event_type: &str, data: Option<Value>) {
    let path = events_path(root, id);
    if let Err(err) = ensure_parent_directory(&path) {
        warn!("failed to prepare events log for container '{}': {}", id, err);
        return;
    }

    let mut entry = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "type": event_type,
        "id": id,
    });
    if let Some(data) = data {
        entry["data"] = data;
    }

    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| {
            writeln!(file, "{}", entry)?;
            file.flush()
        });
    if let Err(err) = result {
        warn!("failed to append events log for container '{}': {}", id, err);
    }
}

/// Record a `state` event carrying the full state document.
pub fn record_state(root: &Path, state: &ContainerState) {
    record(root, &state.id, "state", Some(state.to_json_value()));
}

/// Record an `error` event naming the failing phase.
pub fn record_error(root: &Path, id: &str, phase: &str, message: &str) {
    record(
        root,
        id,
        "error",
        Some(serde_json::json!({ "phase": phase, "message": message })),
    );
}
