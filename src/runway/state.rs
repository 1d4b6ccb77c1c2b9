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

use crate::runway::error::{Error, Result};
use crate::runway::mount::ensure_directory;
use crate::runway::RUNTIME_VERSION;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Annotation carrying the runtime version that created the container.
pub const ANNOTATION_VERSION: &str = "runway.version";
/// Annotation carrying the resolved cgroup path relative to the cgroup root.
pub const ANNOTATION_CGROUP_PATH: &str = "runway.cgroup.path";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "ociVersion", default)]
    pub oci_version: String,
    pub id: String,
    pub pid: i32,
    pub status: Status,
    #[serde(alias = "bundle_path", default)]
    pub bundle: String,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    pub fn new(id: &str, bundle: &str, oci_version: &str) -> Self {
        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_VERSION.to_string(), RUNTIME_VERSION.to_string());
        ContainerState {
            version: RUNTIME_VERSION.to_string(),
            oci_version: oci_version.to_string(),
            id: id.to_string(),
            pid: 0,
            status: Status::Creating,
            bundle: bundle.to_string(),
            annotations,
        }
    }

    /// OCI state document. `version` and `ociVersion` default to each
    /// other when one is missing from an older state file.
    pub fn to_json_value(&self) -> serde_json::Value {
        let reported_version = if self.version.is_empty() {
            if self.oci_version.is_empty() {
                RUNTIME_VERSION.to_string()
            } else {
                self.oci_version.clone()
            }
        } else {
            self.version.clone()
        };
        let reported_oci = if self.oci_version.is_empty() {
            reported_version.clone()
        } else {
            self.oci_version.clone()
        };

        let mut value = serde_json::json!({
            "version": reported_version,
            "ociVersion": reported_oci,
            "id": self.id,
            "status": self.status.to_string(),
            "pid": self.pid.max(0),
            "bundle": if self.bundle.is_empty() { "." } else { self.bundle.as_str() },
        });
        if !self.annotations.is_empty() {
            value["annotations"] = serde_json::to_value(&self.annotations)
                .unwrap_or(serde_json::Value::Null);
        }
        value
    }

    /// Indented JSON, as printed by `state` and fed to hooks on stdin.
    pub fn to_json(&self) -> String {
        let value = self.to_json_value();
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        if Serialize::serialize(&value, &mut serializer).is_err() {
            return value.to_string();
        }
        String::from_utf8(out).unwrap_or_else(|_| value.to_string())
    }
}

/// Persist the state document under `<root>/<id>/state.json`. Single
/// writer by contract; a plain truncate+write is sufficient.
pub fn save(root: &Path, state: &ContainerState) -> Result<()> {
    let container_dir = root.join(&state.id);
    ensure_directory(&container_dir, 0o755)
        .map_err(|e| Error::io(format!("create state directory for '{}'", state.id), e))?;
    let state_file = container_dir.join("state.json");
    let mut file = fs::File::create(&state_file)
        .map_err(|e| Error::io(format!("open {}", state_file.display()), e))?;
    file.write_all(state.to_json().as_bytes())
        .map_err(|e| Error::io(format!("write {}", state_file.display()), e))?;
    Ok(())
}

pub fn load(root: &Path, id: &str) -> Result<ContainerState> {
    let state_file = root.join(id).join("state.json");
    let raw = match fs::read_to_string(&state_file) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("no such container '{}'", id)))
        }
        Err(err) => return Err(Error::io(format!("read {}", state_file.display()), err)),
    };
    let mut state: ContainerState = serde_json::from_str(&raw).map_err(|e| Error::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    if state.version.is_empty() {
        state.version = state.oci_version.clone();
    }
    Ok(state)
}

/// Numeric payload only: shims parse the file content as an integer.
pub fn write_pid_file(path: &Path, pid: i32) -> Result<()> {
    fs::write(path, pid.to_string())
        .map_err(|e| Error::io(format!("write pid file {}", path.display()), e))
}
