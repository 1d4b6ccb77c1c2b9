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
use crate::runway::spec::Mount;
use log::debug;
use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

/// Outcome of folding an OCI mount option list into kernel flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMountOptions {
    pub flags: MsFlags,
    pub propagation: MsFlags,
    pub has_propagation: bool,
    pub bind_readonly: bool,
    pub data: String,
}

impl Default for ParsedMountOptions {
    fn default() -> Self {
        ParsedMountOptions {
            flags: MsFlags::empty(),
            propagation: MsFlags::empty(),
            has_propagation: false,
            bind_readonly: false,
            data: String::new(),
        }
    }
}

pub fn ensure_directory(path: &Path, mode: u32) -> io::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty directory path",
        ));
    }
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", path.display()),
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

pub fn ensure_parent_directory(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_directory(parent, 0o755),
        _ => Ok(()),
    }
}

pub fn ensure_file(path: &Path) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => return Ok(()),
        Ok(_) => {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a regular file", path.display()),
            ))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    ensure_parent_directory(path)?;
    fs::File::create(path)?;
    Ok(())
}

/// Join a container path onto the rootfs without escaping it through
/// doubled separators.
pub fn container_abs_path(rootfs: &Path, path: &str) -> PathBuf {
    if path.is_empty() || path == "." {
        return rootfs.to_path_buf();
    }
    rootfs.join(path.trim_start_matches('/'))
}

pub fn propagation_flag_from_str(propagation: &str) -> Option<MsFlags> {
    match propagation {
        "private" => Some(MsFlags::MS_PRIVATE),
        "rprivate" => Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
        "shared" => Some(MsFlags::MS_SHARED),
        "rshared" => Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
        "slave" => Some(MsFlags::MS_SLAVE),
        "rslave" => Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
        "unbindable" => Some(MsFlags::MS_UNBINDABLE),
        "runbindable" => Some(MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
        _ => None,
    }
}

/// Apply a propagation mode to an existing mount point.
pub fn apply_propagation(target: &Path, propagation: &str) -> Result<()> {
    if propagation.is_empty() {
        return Ok(());
    }
    let flags = propagation_flag_from_str(propagation).ok_or_else(|| {
        Error::ConfigInvalid(format!("unknown rootfs propagation mode '{}'", propagation))
    })?;
    mount(
        Option::<&str>::None,
        target,
        Option::<&str>::None,
        flags,
        Option::<&str>::None,
    )
    .map_err(|e| Error::MountFail {
        target: target.display().to_string(),
        reason: format!("set propagation '{}': {}", propagation, e),
    })
}

pub fn parse_mount_options(options: &[String]) -> ParsedMountOptions {
    let mut parsed = ParsedMountOptions::default();
    let mut data_options: Vec<&str> = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => parsed.flags |= MsFlags::MS_RDONLY,
            "rw" => parsed.flags &= !MsFlags::MS_RDONLY,
            "nosuid" => parsed.flags |= MsFlags::MS_NOSUID,
            "nodev" => parsed.flags |= MsFlags::MS_NODEV,
            "noexec" => parsed.flags |= MsFlags::MS_NOEXEC,
            "relatime" => parsed.flags |= MsFlags::MS_RELATIME,
            "norelatime" => parsed.flags &= !MsFlags::MS_RELATIME,
            "strictatime" => parsed.flags |= MsFlags::MS_STRICTATIME,
            "nostrictatime" => parsed.flags &= !MsFlags::MS_STRICTATIME,
            "sync" => parsed.flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => parsed.flags |= MsFlags::MS_DIRSYNC,
            "remount" => parsed.flags |= MsFlags::MS_REMOUNT,
            "bind" => parsed.flags |= MsFlags::MS_BIND,
            "rbind" => parsed.flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "recursive" => parsed.flags |= MsFlags::MS_REC,
            "private" => {
                parsed.propagation = MsFlags::MS_PRIVATE;
                parsed.has_propagation = true;
            }
            "rprivate" => {
                parsed.propagation = MsFlags::MS_PRIVATE | MsFlags::MS_REC;
                parsed.has_propagation = true;
            }
            "shared" => {
                parsed.propagation = MsFlags::MS_SHARED;
                parsed.has_propagation = true;
            }
            "rshared" => {
                parsed.propagation = MsFlags::MS_SHARED | MsFlags::MS_REC;
                parsed.has_propagation = true;
            }
            "slave" => {
                parsed.propagation = MsFlags::MS_SLAVE;
                parsed.has_propagation = true;
            }
            "rslave" => {
                parsed.propagation = MsFlags::MS_SLAVE | MsFlags::MS_REC;
                parsed.has_propagation = true;
            }
            "unbindable" => {
                parsed.propagation = MsFlags::MS_UNBINDABLE;
                parsed.has_propagation = true;
            }
            "runbindable" => {
                parsed.propagation = MsFlags::MS_UNBINDABLE | MsFlags::MS_REC;
                parsed.has_propagation = true;
            }
            other => data_options.push(other),
        }
    }

    parsed.data = data_options.join(",");
    if parsed.flags.contains(MsFlags::MS_BIND) && parsed.flags.contains(MsFlags::MS_RDONLY) {
        parsed.bind_readonly = true;
    }
    parsed
}

fn is_cgroup_fs(fstype: &str) -> bool {
    fstype == "cgroup" || fstype == "cgroup2"
}

/// Create the mount target below the rootfs. Regular-file sources get an
/// empty file, everything else a directory.
fn prepare_target(source: &str, target: &Path) -> Result<()> {
    let source_is_file = !source.is_empty()
        && fs::metadata(source)
            .map(|meta| meta.is_file())
            .unwrap_or(false);

    let result = if source_is_file {
        debug!("creating mount target file {}", target.display());
        ensure_file(target)
    } else {
        debug!("creating mount target directory {}", target.display());
        ensure_directory(target, 0o755)
    };
    result.map_err(|e| Error::MountFail {
        target: target.display().to_string(),
        reason: format!("prepare target: {}", e),
    })
}

/// Execute one configured mount below the rootfs, honoring the read-only
/// bind remount dance and per-mount propagation.
pub fn apply_mount(rootfs: &Path, entry: &Mount) -> Result<()> {
    let target = container_abs_path(rootfs, &entry.destination);
    let parsed = parse_mount_options(&entry.options);

    prepare_target(&entry.source, &target)?;

    // The kernel ignores MS_RDONLY on the initial bind; a remount pass
    // below enforces it.
    let mut initial_flags = parsed.flags;
    if parsed.bind_readonly {
        initial_flags &= !MsFlags::MS_RDONLY;
    }

    let source = (!entry.source.is_empty()).then_some(entry.source.as_str());
    let fstype = (!entry.fs_type.is_empty()).then_some(entry.fs_type.as_str());
    let data = (!parsed.data.is_empty()).then_some(parsed.data.as_str());

    debug!(
        "mounting {} on {} type {} flags {:?} data {:?}",
        entry.source,
        target.display(),
        entry.fs_type,
        initial_flags,
        data
    );

    match mount(source, target.as_path(), fstype, initial_flags, data) {
        Ok(()) => {}
        Err(Errno::EBUSY) if is_cgroup_fs(&entry.fs_type) => {
            // The host usually pre-mounts cgroup filesystems.
            debug!(
                "cgroup filesystem already mounted on {}, skipping",
                target.display()
            );
            return Ok(());
        }
        Err(err) => {
            return Err(Error::MountFail {
                target: target.display().to_string(),
                reason: err.to_string(),
            })
        }
    }

    if parsed.bind_readonly {
        mount(
            source,
            target.as_path(),
            Option::<&str>::None,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            Option::<&str>::None,
        )
        .map_err(|e| Error::MountFail {
            target: target.display().to_string(),
            reason: format!("read-only remount: {}", e),
        })?;
    }

    if parsed.has_propagation {
        mount(
            Option::<&str>::None,
            target.as_path(),
            Option::<&str>::None,
            parsed.propagation,
            Option::<&str>::None,
        )
        .map_err(|e| Error::MountFail {
            target: target.display().to_string(),
            reason: format!("mount propagation: {}", e),
        })?;
    }

    Ok(())
}
