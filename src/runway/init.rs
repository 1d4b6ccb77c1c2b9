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

//! The child side of the create protocol: namespace entry, filesystem
//! assembly ending in a pivoted root, and the exec of the payload.

use crate::runway::error::{Error, Result};
use crate::runway::mount::{
    apply_mount, apply_propagation, container_abs_path, ensure_directory,
};
use crate::runway::spec::Mount;
use log::{debug, warn};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, chroot, dup2_stderr, dup2_stdin, dup2_stdout, execvp, fork, getpid, pivot_root,
    sethostname, setgid, setgroups, setsid, setuid, ForkResult, Gid, Uid,
};
use std::convert::Infallible;
use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

const ESSENTIAL_DEVICES: &[(&str, u64, u64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// Everything the container init needs, moved into the forked child.
pub struct InitTask {
    pub fifo_path: PathBuf,
    pub rootfs: PathBuf,
    pub hostname: String,
    pub set_hostname: bool,
    pub rootfs_propagation: String,
    pub mounts: Vec<Mount>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub readonly_rootfs: bool,
    pub cwd: String,
    pub env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    pub args: Vec<String>,
    pub terminal: bool,
    pub console_slave: Option<OwnedFd>,
    pub join_namespaces: Vec<(CloneFlags, File)>,
    pub unshare_flags: CloneFlags,
    pub no_pivot: bool,
    /// Write end of the pipe reporting the init pid to the orchestrator.
    pub pid_pipe: OwnedFd,
}

fn report_pid(pipe: &OwnedFd, pid: i32) -> Result<()> {
    nix::unistd::write(pipe, &pid.to_ne_bytes())
        .map_err(|e| Error::io_errno("report init pid", e))?;
    Ok(())
}

impl InitTask {
    /// Drive the init sequence. Returns only on failure; on success the
    /// payload replaces this process.
    pub fn run(mut self) -> Result<Infallible> {
        self.enter_namespaces()?;

        unshare(self.unshare_flags)
            .map_err(|e| Error::NamespaceFail(format!("unshare failed: {}", e)))?;

        if self.unshare_flags.contains(CloneFlags::CLONE_NEWPID) {
            self.become_pid_one()?;
        } else {
            report_pid(&self.pid_pipe, getpid().as_raw())?;
        }

        self.await_start_signal()?;

        if self.set_hostname && !self.hostname.is_empty() {
            debug!("setting hostname to {}", self.hostname);
            sethostname(&self.hostname)
                .map_err(|e| Error::NamespaceFail(format!("sethostname failed: {}", e)))?;
        }

        self.assemble_rootfs()?;

        chdir(Path::new(&self.cwd)).map_err(|e| {
            Error::io_errno(format!("chdir to working directory {}", self.cwd), e)
        })?;

        self.mount_proc()?;
        self.apply_masked_paths();

        if self.readonly_rootfs {
            mount(
                Option::<&str>::None,
                "/",
                Option::<&str>::None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                Option::<&str>::None,
            )
            .map_err(|e| Error::MountFail {
                target: "/".to_string(),
                reason: format!("read-only root remount: {}", e),
            })?;
        }

        self.attach_terminal()?;
        rebuild_env(&self.env);
        self.create_device_nodes()?;
        self.drop_credentials()?;

        let argv: Vec<CString> = self
            .args
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::ConfigInvalid("process argument contains NUL byte".into()))?;

        debug!("executing container payload {}", self.args[0]);
        match execvp(&argv[0], &argv) {
            Ok(infallible) => match infallible {},
            Err(err) => {
                // Distinguished failure code for an unlaunchable payload.
                log::error!("execvp of {} failed: {}", self.args[0], err);
                unsafe { libc::_exit(127) }
            }
        }
    }

    /// Join pre-existing namespaces in the order the bundle lists them.
    fn enter_namespaces(&mut self) -> Result<()> {
        for (flags, file) in self.join_namespaces.drain(..) {
            debug!("joining existing namespace {:?}", flags);
            setns(&file, flags)
                .map_err(|e| Error::NamespaceFail(format!("setns {:?} failed: {}", flags, e)))?;
        }
        Ok(())
    }

    /// The first process after unsharing a PID namespace is not pid 1;
    /// fork again so the grandchild is. The middle process reports the
    /// inner pid, then reaps it and propagates its exit status.
    fn become_pid_one(&self) -> Result<()> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                if let Err(err) = report_pid(&self.pid_pipe, child.as_raw()) {
                    log::error!("failed to report container init pid: {}", err);
                    unsafe { libc::_exit(1) };
                }
                loop {
                    match waitpid(child, None) {
                        Ok(WaitStatus::Exited(_, code)) => unsafe { libc::_exit(code) },
                        Ok(WaitStatus::Signaled(_, signal, _)) => unsafe {
                            libc::_exit(128 + signal as i32)
                        },
                        Ok(_) => continue,
                        Err(Errno::EINTR) => continue,
                        Err(_) => unsafe { libc::_exit(1) },
                    }
                }
            }
            Ok(ForkResult::Child) => Ok(()),
            Err(err) => Err(Error::NamespaceFail(format!(
                "fork for pid namespace init failed: {}",
                err
            ))),
        }
    }

    /// Block until the orchestrator releases the container with a
    /// one-byte write during `start`.
    fn await_start_signal(&self) -> Result<()> {
        debug!("waiting for start signal on {}", self.fifo_path.display());
        let mut fifo = File::open(&self.fifo_path)
            .map_err(|e| Error::io(format!("open fifo {}", self.fifo_path.display()), e))?;
        let mut buf = [0u8; 1];
        let n = fifo
            .read(&mut buf)
            .map_err(|e| Error::io("read start signal", e))?;
        if n == 0 {
            return Err(Error::io(
                "read start signal",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "fifo closed unreleased"),
            ));
        }
        debug!("start signal received");
        Ok(())
    }

    /// Steps 6-12 of the init sequence: self-bind, propagation, config
    /// mounts, readonly paths, pivot, propagation again.
    fn assemble_rootfs(&self) -> Result<()> {
        let propagation = if self.rootfs_propagation.is_empty() {
            "rprivate"
        } else {
            self.rootfs_propagation.as_str()
        };

        // pivot_root requires the new root to be a mount point.
        mount(
            Some(self.rootfs.as_path()),
            self.rootfs.as_path(),
            Option::<&str>::None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            Option::<&str>::None,
        )
        .map_err(|e| Error::MountFail {
            target: self.rootfs.display().to_string(),
            reason: format!("rootfs self-bind: {}", e),
        })?;

        apply_propagation(Path::new("/"), propagation)?;

        chdir(&self.rootfs)
            .map_err(|e| Error::io_errno(format!("chdir to {}", self.rootfs.display()), e))?;

        for entry in &self.mounts {
            apply_mount(&self.rootfs, entry)?;
        }

        self.apply_readonly_paths();

        if self.no_pivot {
            self.enter_root_via_chroot()?;
        } else {
            self.pivot_into_rootfs()?;
        }

        apply_propagation(Path::new("/"), propagation)?;
        Ok(())
    }

    fn pivot_into_rootfs(&self) -> Result<()> {
        let old_root = self.rootfs.join(".oldroot");
        let pivoted = ensure_directory(&old_root, 0o755)
            .map_err(|e| Error::io(format!("create {}", old_root.display()), e))
            .and_then(|()| {
                pivot_root(self.rootfs.as_path(), old_root.as_path()).map_err(|e| Error::MountFail {
                    target: self.rootfs.display().to_string(),
                    reason: format!("pivot_root: {}", e),
                })
            });

        match pivoted {
            Ok(()) => {
                chdir("/").map_err(|e| Error::io_errno("chdir to pivoted root", e))?;
                umount2("/.oldroot", MntFlags::MNT_DETACH).map_err(|e| Error::MountFail {
                    target: "/.oldroot".to_string(),
                    reason: format!("detach old root: {}", e),
                })?;
                if let Err(err) = fs::remove_dir("/.oldroot") {
                    debug!("could not remove /.oldroot: {}", err);
                }
                Ok(())
            }
            Err(err) => {
                warn!("pivot_root unavailable, falling back to chroot: {}", err);
                let _ = fs::remove_dir(&old_root);
                self.enter_root_via_chroot()
            }
        }
    }

    fn enter_root_via_chroot(&self) -> Result<()> {
        chroot(".").map_err(|e| Error::MountFail {
            target: self.rootfs.display().to_string(),
            reason: format!("chroot: {}", e),
        })?;
        chdir("/").map_err(|e| Error::io_errno("chdir to chroot root", e))
    }

    /// Bind each readonly path onto itself, then remount it read-only.
    /// Paths that cannot be remounted are tolerated.
    fn apply_readonly_paths(&self) {
        for path in &self.readonly_paths {
            let target = container_abs_path(&self.rootfs, path);
            let bound = mount(
                Some(target.as_path()),
                target.as_path(),
                Option::<&str>::None,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                Option::<&str>::None,
            )
            .and_then(|()| {
                mount(
                    Option::<&str>::None,
                    target.as_path(),
                    Option::<&str>::None,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    Option::<&str>::None,
                )
            });
            if let Err(err) = bound {
                debug!(
                    "skipping readonly path {}: {}",
                    target.display(),
                    err
                );
            }
        }
    }

    fn mount_proc(&self) -> Result<()> {
        if let Err(err) = ensure_directory(Path::new("/proc"), 0o555) {
            debug!("could not create /proc mount point: {}", err);
        }
        match mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::empty(),
            Option::<&str>::None,
        ) {
            Ok(()) => Ok(()),
            // An identical proc instance from the config mounts is fine.
            Err(Errno::EBUSY) => Ok(()),
            Err(err) => Err(Error::MountFail {
                target: "/proc".to_string(),
                reason: format!("mount proc: {}", err),
            }),
        }
    }

    /// Masked directories become read-only empty tmpfs instances; masked
    /// files are hidden behind /dev/null. Requires /proc to be mounted
    /// first so /proc entries can be masked.
    fn apply_masked_paths(&self) {
        for path in &self.masked_paths {
            let target = Path::new(path);
            let meta = match fs::symlink_metadata(target) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let result = if meta.is_dir() {
                mount(
                    Some("tmpfs"),
                    target,
                    Some("tmpfs"),
                    MsFlags::MS_RDONLY,
                    Some("size=0k"),
                )
            } else {
                mount(
                    Some("/dev/null"),
                    target,
                    Option::<&str>::None,
                    MsFlags::MS_BIND,
                    Option::<&str>::None,
                )
            };
            if let Err(err) = result {
                debug!("skipping masked path {}: {}", target.display(), err);
            }
        }
    }

    fn attach_terminal(&mut self) -> Result<()> {
        if !self.terminal {
            return Ok(());
        }
        let Some(slave) = self.console_slave.take() else {
            return Ok(());
        };

        setsid().map_err(|e| Error::ConsoleFail(format!("setsid failed: {}", e)))?;
        if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) } != 0 {
            return Err(Error::ConsoleFail(format!(
                "TIOCSCTTY failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        dup2_stdin(&slave).map_err(|e| Error::ConsoleFail(format!("dup2 stdin: {}", e)))?;
        dup2_stdout(&slave).map_err(|e| Error::ConsoleFail(format!("dup2 stdout: {}", e)))?;
        dup2_stderr(&slave).map_err(|e| Error::ConsoleFail(format!("dup2 stderr: {}", e)))?;
        Ok(())
    }

    fn create_device_nodes(&self) -> Result<()> {
        if let Err(err) = ensure_directory(Path::new("/dev"), 0o755) {
            debug!("could not create /dev: {}", err);
        }
        for (name, major, minor) in ESSENTIAL_DEVICES {
            let path = format!("/dev/{}", name);
            match mknod(
                path.as_str(),
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(*major, *minor),
            ) {
                Ok(()) => {}
                Err(Errno::EEXIST) => {}
                Err(err) => {
                    return Err(Error::io_errno(format!("mknod {}", path), err));
                }
            }
        }
        Ok(())
    }

    /// setgroups, then setgid, then setuid. The order matters: gid and
    /// groups changes require the privileges dropped by setuid.
    fn drop_credentials(&self) -> Result<()> {
        let groups: Vec<Gid> = self
            .additional_gids
            .iter()
            .map(|gid| Gid::from_raw(*gid))
            .collect();
        setgroups(&groups)
            .map_err(|e| Error::NamespaceFail(format!("setgroups failed: {}", e)))?;
        setgid(Gid::from_raw(self.gid))
            .map_err(|e| Error::NamespaceFail(format!("setgid {} failed: {}", self.gid, e)))?;
        setuid(Uid::from_raw(self.uid))
            .map_err(|e| Error::NamespaceFail(format!("setuid {} failed: {}", self.uid, e)))?;
        Ok(())
    }
}

/// Replace the current environment with the given `KEY=VALUE` entries.
/// Entries with an empty key are ignored; entries without `=` become
/// empty-valued variables.
pub fn rebuild_env(entries: &[String]) {
    let existing: Vec<String> = std::env::vars().map(|(key, _)| key).collect();
    for key in existing {
        std::env::remove_var(key);
    }
    for entry in entries {
        if entry.is_empty() {
            continue;
        }
        match entry.split_once('=') {
            Some(("", _)) => {}
            Some((key, value)) => std::env::set_var(key, value),
            None => std::env::set_var(entry, ""),
        }
    }
}

/// Map a reaped wait status onto the CLI exit code contract.
pub fn exit_code_from_status(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}
