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
use nix::sched::CloneFlags;
use nix::unistd::{getgid, getuid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Spec {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    #[serde(default)]
    pub hostname: String,
    pub root: Root,
    pub process: Process,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub linux: Linux,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub hooks: Hooks,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(rename = "additionalGids", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub fs_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Linux {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(rename = "uidMappings", default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(rename = "gidMappings", default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(rename = "maskedPaths", default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(rename = "readonlyPaths", default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
    #[serde(rename = "rootfsPropagation", default)]
    pub rootfs_propagation: String,
    #[serde(rename = "cgroupsPath", default)]
    pub cgroups_path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Cpu>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Memory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Cpu {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Pid,
    Uts,
    Ipc,
    #[serde(alias = "network")]
    Net,
    #[serde(alias = "mount")]
    Mnt,
    User,
    Cgroup,
}

impl NamespaceType {
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Mnt => CloneFlags::CLONE_NEWNS,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NamespaceType::Pid => "pid",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Net => "net",
            NamespaceType::Mnt => "mnt",
            NamespaceType::User => "user",
            NamespaceType::Cgroup => "cgroup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, Deserialize, Serialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Hook {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Hooks {
    #[serde(rename = "createRuntime", default)]
    pub create_runtime: Vec<Hook>,
    #[serde(rename = "createContainer", default)]
    pub create_container: Vec<Hook>,
    #[serde(default)]
    pub prestart: Vec<Hook>,
    #[serde(rename = "startContainer", default)]
    pub start_container: Vec<Hook>,
    #[serde(default)]
    pub poststart: Vec<Hook>,
    #[serde(default)]
    pub poststop: Vec<Hook>,
}

impl Spec {
    /// Load and validate `<bundle>/config.json`.
    pub fn load(bundle: &Path) -> Result<Spec> {
        let config_path = bundle.join("config.json");
        let file = File::open(&config_path).map_err(|e| {
            Error::ConfigInvalid(format!("failed to open {}: {}", config_path.display(), e))
        })?;
        let spec: Spec = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::ConfigInvalid(format!("failed to parse {}: {}", config_path.display(), e))
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.process.args.is_empty() {
            return Err(Error::ConfigInvalid(
                "process.args must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Absolute path of the rootfs for a bundle.
    pub fn rootfs_path(&self, bundle: &Path) -> PathBuf {
        let root = Path::new(&self.root.path);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            bundle.join(root)
        }
    }

    pub fn memory_limit(&self) -> i64 {
        self.linux
            .resources
            .as_ref()
            .and_then(|r| r.memory.as_ref())
            .and_then(|m| m.limit)
            .unwrap_or(0)
    }

    pub fn cpu_shares(&self) -> u64 {
        self.linux
            .resources
            .as_ref()
            .and_then(|r| r.cpu.as_ref())
            .and_then(|c| c.shares)
            .unwrap_or(0)
    }

    pub fn creates_namespace(&self, ns_type: NamespaceType) -> bool {
        self.linux
            .namespaces
            .iter()
            .any(|ns| ns.ns_type == ns_type && ns.path.is_none())
    }

    /// Mappings written to `/proc/<pid>/uid_map`. A new user namespace
    /// without explicit mappings gets a single identity entry for the
    /// invoking uid.
    pub fn effective_uid_mappings(&self) -> Vec<IdMapping> {
        if !self.linux.uid_mappings.is_empty() || !self.creates_namespace(NamespaceType::User) {
            return self.linux.uid_mappings.clone();
        }
        let uid = getuid().as_raw();
        vec![IdMapping {
            container_id: uid,
            host_id: uid,
            size: 1,
        }]
    }

    pub fn effective_gid_mappings(&self) -> Vec<IdMapping> {
        if !self.linux.gid_mappings.is_empty() || !self.creates_namespace(NamespaceType::User) {
            return self.linux.gid_mappings.clone();
        }
        let gid = getgid().as_raw();
        vec![IdMapping {
            container_id: gid,
            host_id: gid,
            size: 1,
        }]
    }
}

/// Canonicalize a path, falling back to the input when resolution fails
/// (for example because a component does not exist yet).
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn minimal_config() -> serde_json::Value {
        serde_json::json!({
            "ociVersion": "1.0.0",
            "root": { "path": "rootfs" },
            "process": { "args": ["/bin/true"], "cwd": "/" },
            "linux": { "namespaces": [ { "type": "pid" }, { "type": "mnt" } ] }
        })
    }

    fn write_bundle(config: &serde_json::Value) -> TempDir {
        let tmp = TempDir::new().expect("tempdir");
        fs::write(
            tmp.path().join("config.json"),
            serde_json::to_vec(config).expect("serialize"),
        )
        .expect("write config");
        tmp
    }

    #[test]
    fn minimal_bundle_loads_with_defaults() {
        let bundle = write_bundle(&minimal_config());
        let spec = Spec::load(bundle.path()).expect("load");

        assert_eq!(spec.oci_version, "1.0.0");
        assert_eq!(spec.process.cwd, "/");
        assert!(!spec.process.terminal);
        assert!(!spec.root.readonly);
        assert_eq!(spec.linux.namespaces.len(), 2);
        assert!(spec.creates_namespace(NamespaceType::Pid));
        assert!(!spec.creates_namespace(NamespaceType::Net));
        assert_eq!(spec.memory_limit(), 0);
        assert_eq!(spec.cpu_shares(), 0);
    }

    #[test]
    fn empty_args_are_rejected() {
        let mut config = minimal_config();
        config["process"]["args"] = serde_json::json!([]);
        let bundle = write_bundle(&config);
        assert!(matches!(
            Spec::load(bundle.path()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn missing_config_is_config_invalid() {
        let tmp = TempDir::new().expect("tempdir");
        assert!(matches!(
            Spec::load(tmp.path()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn unknown_namespace_type_is_rejected() {
        let mut config = minimal_config();
        config["linux"]["namespaces"] = serde_json::json!([{ "type": "time" }]);
        let bundle = write_bundle(&config);
        assert!(matches!(
            Spec::load(bundle.path()),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn oci_namespace_aliases_are_accepted() {
        let mut config = minimal_config();
        config["linux"]["namespaces"] =
            serde_json::json!([{ "type": "network" }, { "type": "mount" }]);
        let bundle = write_bundle(&config);
        let spec = Spec::load(bundle.path()).expect("load");
        assert_eq!(spec.linux.namespaces[0].ns_type, NamespaceType::Net);
        assert_eq!(spec.linux.namespaces[1].ns_type, NamespaceType::Mnt);
    }

    #[test]
    fn nested_resources_flatten_into_accessors() {
        let mut config = minimal_config();
        config["linux"]["resources"] = serde_json::json!({
            "memory": { "limit": 268435456 },
            "cpu": { "shares": 512 }
        });
        let bundle = write_bundle(&config);
        let spec = Spec::load(bundle.path()).expect("load");
        assert_eq!(spec.memory_limit(), 268_435_456);
        assert_eq!(spec.cpu_shares(), 512);
    }

    #[test]
    fn user_namespace_without_mappings_gets_identity_entry() {
        let mut config = minimal_config();
        config["linux"]["namespaces"] = serde_json::json!([{ "type": "user" }]);
        let bundle = write_bundle(&config);
        let spec = Spec::load(bundle.path()).expect("load");

        let uid_maps = spec.effective_uid_mappings();
        assert_eq!(uid_maps.len(), 1);
        assert_eq!(uid_maps[0].container_id, getuid().as_raw());
        assert_eq!(uid_maps[0].host_id, getuid().as_raw());
        assert_eq!(uid_maps[0].size, 1);
    }

    #[test]
    fn explicit_mappings_are_preserved() {
        let mut config = minimal_config();
        config["linux"]["namespaces"] = serde_json::json!([{ "type": "user" }]);
        config["linux"]["uidMappings"] =
            serde_json::json!([{ "containerID": 0, "hostID": 1000, "size": 65536 }]);
        let bundle = write_bundle(&config);
        let spec = Spec::load(bundle.path()).expect("load");

        let uid_maps = spec.effective_uid_mappings();
        assert_eq!(uid_maps.len(), 1);
        assert_eq!(uid_maps[0].container_id, 0);
        assert_eq!(uid_maps[0].host_id, 1000);
        assert_eq!(uid_maps[0].size, 65536);
    }

    #[test]
    fn hooks_parse_with_defaults() {
        let mut config = minimal_config();
        config["hooks"] = serde_json::json!({
            "createRuntime": [ { "path": "/usr/bin/hook", "timeout": 3 } ],
            "poststop": [ { "path": "/usr/bin/cleanup" } ]
        });
        let bundle = write_bundle(&config);
        let spec = Spec::load(bundle.path()).expect("load");
        assert_eq!(spec.hooks.create_runtime.len(), 1);
        assert_eq!(spec.hooks.create_runtime[0].timeout, 3);
        assert_eq!(spec.hooks.poststop[0].timeout, 0);
        assert!(spec.hooks.prestart.is_empty());
    }

    #[test]
    fn rootfs_path_handles_relative_and_absolute_roots() {
        let bundle = write_bundle(&minimal_config());
        let spec = Spec::load(bundle.path()).expect("load");
        assert_eq!(spec.rootfs_path(bundle.path()), bundle.path().join("rootfs"));

        let mut absolute = minimal_config();
        absolute["root"]["path"] = serde_json::json!("/var/lib/rootfs");
        let bundle = write_bundle(&absolute);
        let spec = Spec::load(bundle.path()).expect("load");
        assert_eq!(
            spec.rootfs_path(bundle.path()),
            PathBuf::from("/var/lib/rootfs")
        );
    }
}
