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
use log::debug;
use nix::unistd::geteuid;
use std::env;
use std::path::{Path, PathBuf};

const RUNTIME_DIR_NAME: &str = "runway";

/// Global options resolved once in `main` and threaded through every
/// lifecycle operation.
#[derive(Debug, Clone)]
pub struct Context {
    pub root: PathBuf,
    pub debug: bool,
    pub systemd_cgroup: bool,
}

impl Context {
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn state_file(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("state.json")
    }

    pub fn fifo_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("sync_fifo")
    }

    pub fn events_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("events.log")
    }
}

fn strip_trailing_slashes(path: &str) -> String {
    let mut normalized = path.to_string();
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub fn fallback_state_root() -> PathBuf {
    PathBuf::from(format!(
        "/tmp/{}-{}",
        RUNTIME_DIR_NAME,
        geteuid().as_raw()
    ))
}

pub fn default_state_root() -> PathBuf {
    if geteuid().is_root() {
        return PathBuf::from(format!("/run/{}", RUNTIME_DIR_NAME));
    }
    match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => {
            Path::new(&strip_trailing_slashes(&dir)).join(RUNTIME_DIR_NAME)
        }
        _ => fallback_state_root(),
    }
}

/// Resolve and create the runtime state root. Non-root callers whose
/// preferred root is not writable fall through to the temp fallback;
/// root failures are surfaced.
pub fn resolve_state_root(explicit: Option<&Path>) -> Result<PathBuf> {
    let preferred = match explicit {
        Some(path) => PathBuf::from(strip_trailing_slashes(&path.to_string_lossy())),
        None => default_state_root(),
    };

    match ensure_directory(&preferred, 0o755) {
        Ok(()) => return Ok(preferred),
        Err(err) if !geteuid().is_root() => {
            let fallback = fallback_state_root();
            if fallback != preferred {
                debug!(
                    "unable to use preferred state root '{}': {}",
                    preferred.display(),
                    err
                );
                ensure_directory(&fallback, 0o755).map_err(|e| {
                    Error::io(
                        format!("create runtime root '{}'", fallback.display()),
                        e,
                    )
                })?;
                debug!("falling back to runtime state root '{}'", fallback.display());
                return Ok(fallback);
            }
            Err(Error::io(
                format!("create runtime root '{}'", preferred.display()),
                err,
            ))
        }
        Err(err) => Err(Error::io(
            format!("create runtime root '{}'", preferred.display()),
            err,
        )),
    }
}
