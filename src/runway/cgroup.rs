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
use log::{debug, warn};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const CGROUP_BASE_DIR: &str = "/sys/fs/cgroup";

/// Resource limits applied to a container cgroup.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_limit: i64,
    pub cpu_shares: u64,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_limit <= 0 && self.cpu_shares == 0
    }
}

pub fn cgroup_root() -> PathBuf {
    env::var("RUNWAY_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_BASE_DIR))
}

pub fn is_cgroup_v2() -> bool {
    cgroup_root().join("cgroup.controllers").exists()
}

/// Normalize the configured cgroups path to a relative path, defaulting
/// to `my_runtime/<id>`.
pub fn normalize_relative_path(cgroups_path: &str, id: &str) -> String {
    let trimmed = cgroups_path.trim_matches('/');
    if trimmed.is_empty() {
        format!("my_runtime/{}", id)
    } else {
        trimmed.to_string()
    }
}

/// Map OCI cpu shares onto the cgroup v2 `cpu.weight` scale.
pub fn shares_to_weight(shares: u64) -> u64 {
    if shares == 0 {
        return 100;
    }
    if shares < 2 {
        return 1;
    }
    let shares = shares.min(262_144);
    (1 + ((shares - 2) * 9999) / 262_142).clamp(1, 10_000)
}

fn write_cgroup_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| Error::CgroupFail(format!("write {}: {}", path.display(), e)))
}

fn available_v2_controllers(root: &Path) -> HashSet<String> {
    fs::read_to_string(root.join("cgroup.controllers"))
        .map(|raw| raw.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn setup_v2(pid: i32, relative_path: &str, limits: &ResourceLimits) -> Result<()> {
    let root = cgroup_root();
    let available = available_v2_controllers(&root);

    let mut required = Vec::new();
    if limits.memory_limit > 0 {
        if !available.contains("memory") {
            return Err(Error::CgroupFail(
                "memory controller not available in cgroup v2".to_string(),
            ));
        }
        required.push("memory");
    }
    if limits.cpu_shares > 0 {
        if !available.contains("cpu") {
            return Err(Error::CgroupFail(
                "cpu controller not available in cgroup v2".to_string(),
            ));
        }
        required.push("cpu");
    }

    // Delegation into the subtree is best-effort; the controller may
    // already be enabled.
    for controller in &required {
        let subtree = root.join("cgroup.subtree_control");
        if let Err(err) = fs::write(&subtree, format!("+{}\n", controller)) {
            debug!("could not enable controller '{}': {}", controller, err);
        }
    }

    let unified = root.join(relative_path);
    ensure_directory(&unified, 0o755)
        .map_err(|e| Error::CgroupFail(format!("create {}: {}", unified.display(), e)))?;

    if limits.memory_limit > 0 {
        write_cgroup_file(&unified.join("memory.max"), &limits.memory_limit.to_string())?;
    }
    if limits.cpu_shares > 0 {
        let weight = shares_to_weight(limits.cpu_shares);
        write_cgroup_file(&unified.join("cpu.weight"), &weight.to_string())?;
    }

    write_cgroup_file(&unified.join("cgroup.procs"), &pid.to_string())
}

fn setup_v1(pid: i32, relative_path: &str, limits: &ResourceLimits) -> Result<()> {
    let root = cgroup_root();

    if limits.memory_limit > 0 {
        let mem_dir = root.join("memory").join(relative_path);
        ensure_directory(&mem_dir, 0o755)
            .map_err(|e| Error::CgroupFail(format!("create {}: {}", mem_dir.display(), e)))?;
        write_cgroup_file(
            &mem_dir.join("memory.limit_in_bytes"),
            &limits.memory_limit.to_string(),
        )?;
        write_cgroup_file(&mem_dir.join("cgroup.procs"), &pid.to_string())?;
    }

    if limits.cpu_shares > 0 {
        let cpu_dir = root.join("cpu").join(relative_path);
        ensure_directory(&cpu_dir, 0o755)
            .map_err(|e| Error::CgroupFail(format!("create {}: {}", cpu_dir.display(), e)))?;
        write_cgroup_file(&cpu_dir.join("cpu.shares"), &limits.cpu_shares.to_string())?;
        write_cgroup_file(&cpu_dir.join("cgroup.procs"), &pid.to_string())?;
    }

    Ok(())
}

/// Create the container cgroup, apply limits, and attach `pid`. Returns
/// the relative path recorded in the state annotations for cleanup.
pub fn setup(pid: i32, id: &str, cgroups_path: &str, limits: &ResourceLimits) -> Result<String> {
    let relative_path = normalize_relative_path(cgroups_path, id);
    debug!(
        "setting up cgroups for container {} at {}",
        id, relative_path
    );

    if is_cgroup_v2() {
        setup_v2(pid, &relative_path, limits)?;
    } else {
        setup_v1(pid, &relative_path, limits)?;
    }
    Ok(relative_path)
}

fn remove_dir_quiet(path: &Path) {
    if let Err(err) = fs::remove_dir(path) {
        if err.kind() != ErrorKind::NotFound {
            warn!("failed to remove cgroup dir {}: {}", path.display(), err);
        }
    }
}

/// Remove the container cgroup directories. Missing directories are
/// benign.
pub fn cleanup(id: &str, relative_path_hint: &str) {
    debug!("cleaning up cgroups for container {}", id);
    let relative_path = normalize_relative_path(relative_path_hint, id);
    let root = cgroup_root();

    if is_cgroup_v2() {
        remove_dir_quiet(&root.join(&relative_path));
        return;
    }
    remove_dir_quiet(&root.join("memory").join(&relative_path));
    remove_dir_quiet(&root.join("cpu").join(&relative_path));
}
