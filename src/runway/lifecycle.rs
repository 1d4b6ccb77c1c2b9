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

//! The lifecycle orchestrator: every command reads the persisted state,
//! performs one transition, writes the state back, and exits.

use crate::runway::cgroup::{self, ResourceLimits};
use crate::runway::console::ConsolePair;
use crate::runway::error::{Error, Result};
use crate::runway::events;
use crate::runway::hooks;
use crate::runway::init::{exit_code_from_status, InitTask};
use crate::runway::paths::Context;
use crate::runway::process::{collect_process_tree, process_alive, read_comm};
use crate::runway::spec::{resolve_absolute_path, IdMapping, NamespaceType, Spec};
use crate::runway::state::{
    self, ContainerState, Status, ANNOTATION_CGROUP_PATH,
};
use crate::runway::{OCI_VERSION_MAX, OCI_VERSION_MIN};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, mkfifo, pipe2, ForkResult, Pid};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FORCE_DELETE_DEADLINE: Duration = Duration::from_secs(10);

/// Namespaces an exec joins, in the order they are entered.
const EXEC_NAMESPACE_ORDER: &[&str] = &["user", "mnt", "pid", "ipc", "uts", "net", "cgroup"];

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub bundle: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub console_socket: Option<PathBuf>,
    pub no_pivot: bool,
    pub preserve_fds: u32,
    pub notify_socket: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub process_path: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub detach: bool,
    pub tty: bool,
    pub pid_file: Option<PathBuf>,
}

/// Handle returned by `create`: the direct child (waited on by `run`)
/// and the pid of the container init inside any new PID namespace.
#[derive(Debug)]
pub struct CreateHandle {
    pub child: Pid,
    pub init_pid: i32,
}

/// Accept an integer or a SIGTERM-style name.
pub fn parse_signal(value: &str) -> Result<Signal> {
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| Error::ConfigInvalid(format!("unknown signal number {}", number)));
    }
    let name = value.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{}", name)
    };
    Signal::from_str(&name)
        .map_err(|_| Error::ConfigInvalid(format!("unknown signal '{}'", value)))
}

/// Pending cleanup while `create` is in flight. Disarmed on success.
struct CreateRollback<'a> {
    ctx: &'a Context,
    id: String,
    pid: Option<i32>,
    child: Option<Pid>,
    cgroup_path: Option<String>,
    armed: bool,
}

impl<'a> CreateRollback<'a> {
    fn new(ctx: &'a Context, id: &str) -> Self {
        CreateRollback {
            ctx,
            id: id.to_string(),
            pid: None,
            child: None,
            cgroup_path: None,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CreateRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        if let Some(child) = self.child {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
        }
        if let Some(cgroup_path) = &self.cgroup_path {
            cgroup::cleanup(&self.id, cgroup_path);
        }
        let _ = fs::remove_file(self.ctx.fifo_path(&self.id));
        let _ = fs::remove_file(self.ctx.state_file(&self.id));
        let _ = fs::remove_file(self.ctx.events_path(&self.id));
        let _ = fs::remove_dir(self.ctx.container_dir(&self.id));
    }
}

fn read_init_pid(fd: &OwnedFd) -> Result<i32> {
    let mut buf = [0u8; 4];
    let mut total = 0;
    while total < buf.len() {
        match nix::unistd::read(fd, &mut buf[total..]) {
            Ok(0) => {
                return Err(Error::NamespaceFail(
                    "container init exited before reporting its pid".to_string(),
                ))
            }
            Ok(n) => total += n,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(Error::io_errno("read init pid", err)),
        }
    }
    Ok(i32::from_ne_bytes(buf))
}

fn format_id_mappings(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// Write setgroups/uid_map/gid_map for a freshly created user namespace.
/// The child never consults these files before the FIFO unblocks, so the
/// ordering requirement is met by completing this during `create`.
fn configure_user_namespace(
    pid: Pid,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<()> {
    let proc_dir = format!("/proc/{}", pid);

    if !gid_mappings.is_empty() {
        let setgroups_path = format!("{}/setgroups", proc_dir);
        match fs::write(&setgroups_path, "deny\n") {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(Error::NamespaceFail(format!(
                    "write {}: {}",
                    setgroups_path, err
                )))
            }
        }
    }

    if !uid_mappings.is_empty() {
        let path = format!("{}/uid_map", proc_dir);
        fs::write(&path, format_id_mappings(uid_mappings))
            .map_err(|e| Error::NamespaceFail(format!("write {}: {}", path, e)))?;
    }
    if !gid_mappings.is_empty() {
        let path = format!("{}/gid_map", proc_dir);
        fs::write(&path, format_id_mappings(gid_mappings))
            .map_err(|e| Error::NamespaceFail(format!("write {}: {}", path, e)))?;
    }
    Ok(())
}

/// Create a container: allocate its state, fork the init, apply cgroup
/// limits and id mappings, and leave the init blocked on the sync FIFO.
pub fn create(ctx: &Context, id: &str, opts: &CreateOptions) -> Result<CreateHandle> {
    let mut rollback = CreateRollback::new(ctx, id);
    let result = create_locked(ctx, id, opts, &mut rollback);
    match result {
        Ok(handle) => {
            rollback.disarm();
            Ok(handle)
        }
        Err((phase, err)) => {
            error!("create failed during {}: {}", phase, err);
            drop(rollback);
            events::record_error(&ctx.root, id, &phase, &err.to_string());
            Err(err)
        }
    }
}

fn create_locked(
    ctx: &Context,
    id: &str,
    opts: &CreateOptions,
    rollback: &mut CreateRollback,
) -> std::result::Result<CreateHandle, (String, Error)> {
    let phase = |name: &str| name.to_string();

    let bundle = resolve_absolute_path(&opts.bundle);
    let spec = Spec::load(&bundle).map_err(|e| (phase("config"), e))?;

    // Reuse annotations from an existing state file so hook phases stay
    // at-most-once across repeated create attempts.
    let mut container_state = match state::load(&ctx.root, id) {
        Ok(mut existing) => {
            existing.status = Status::Creating;
            existing.bundle = bundle.to_string_lossy().to_string();
            existing.oci_version = spec.oci_version.clone();
            existing
        }
        Err(_) => ContainerState::new(id, &bundle.to_string_lossy(), &spec.oci_version),
    };

    state::save(&ctx.root, &container_state).map_err(|e| (phase("state"), e))?;
    events::record_state(&ctx.root, &container_state);

    hooks::run_sequence(
        &spec.hooks.create_runtime,
        &mut container_state,
        "createRuntime",
        true,
    )
    .map_err(|e| (phase("createRuntime"), e))?;

    let fifo_path = ctx.fifo_path(id);
    match mkfifo(fifo_path.as_path(), nix::sys::stat::Mode::from_bits_truncate(0o666)) {
        Ok(()) => {}
        Err(Errno::EEXIST) => {}
        Err(err) => {
            return Err((
                phase("fifo"),
                Error::io_errno(format!("mkfifo {}", fifo_path.display()), err),
            ))
        }
    }

    let console = if spec.process.terminal {
        if opts.console_socket.is_none() {
            return Err((
                phase("console"),
                Error::ConfigInvalid(
                    "process.terminal requires --console-socket".to_string(),
                ),
            ));
        }
        Some(ConsolePair::allocate().map_err(|e| (phase("console"), e))?)
    } else {
        None
    };
    let (console_master, console_slave) = match console {
        Some(pair) => {
            let ConsolePair {
                master,
                slave,
                slave_name,
            } = pair;
            (Some((master, slave_name)), Some(slave))
        }
        None => (None, None),
    };

    // Namespaces with a path are joined; the rest are unshared in one call.
    let mut unshare_flags = CloneFlags::empty();
    let mut join_namespaces = Vec::new();
    for ns in &spec.linux.namespaces {
        match &ns.path {
            Some(path) => {
                let file = File::open(path).map_err(|e| {
                    (
                        phase("namespace"),
                        Error::NotFound(format!("namespace path {}: {}", path, e)),
                    )
                })?;
                join_namespaces.push((ns.ns_type.clone_flag(), file));
            }
            None => unshare_flags |= ns.ns_type.clone_flag(),
        }
    }
    let creates_userns = unshare_flags.contains(CloneFlags::CLONE_NEWUSER);
    let uid_mappings = spec.effective_uid_mappings();
    let gid_mappings = spec.effective_gid_mappings();

    let mut container_env = spec.process.env.clone();
    if let Some(notify_socket) = &opts.notify_socket {
        container_env.push(format!("NOTIFY_SOCKET={}", notify_socket.display()));
    }

    // O_CLOEXEC keeps the report pipe out of the container payload.
    let (pid_read, pid_write) = pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .map_err(|e| (phase("fork"), Error::io_errno("create pid pipe", e)))?;

    let task = InitTask {
        fifo_path: fifo_path.clone(),
        rootfs: spec.rootfs_path(&bundle),
        hostname: spec.hostname.clone(),
        set_hostname: spec.creates_namespace(NamespaceType::Uts),
        rootfs_propagation: spec.linux.rootfs_propagation.clone(),
        mounts: spec.mounts.clone(),
        masked_paths: spec.linux.masked_paths.clone(),
        readonly_paths: spec.linux.readonly_paths.clone(),
        readonly_rootfs: spec.root.readonly,
        cwd: spec.process.cwd.clone(),
        env: container_env,
        uid: spec.process.user.uid,
        gid: spec.process.user.gid,
        additional_gids: spec.process.user.additional_gids.clone(),
        args: spec.process.args.clone(),
        terminal: spec.process.terminal,
        console_slave,
        join_namespaces,
        unshare_flags,
        no_pivot: opts.no_pivot,
        pid_pipe: pid_write,
    };

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(pid_read);
            drop(console_master);
            let err = match task.run() {
                Ok(never) => match never {},
                Err(err) => err,
            };
            error!("container init failed: {}", err);
            unsafe { libc::_exit(1) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(task);
            child
        }
        Err(err) => {
            return Err((
                phase("fork"),
                Error::io_errno("fork container init", err),
            ))
        }
    };
    rollback.child = Some(child);

    // The pid report doubles as the barrier: once it arrives the child
    // has finished its unshare, so the id-map files target the new user
    // namespace. The child reads nothing past the FIFO until `start`.
    let init_pid = read_init_pid(&pid_read).map_err(|e| (phase("fork"), e))?;
    drop(pid_read);
    rollback.pid = Some(init_pid);
    debug!("container init running with pid {}", init_pid);

    if creates_userns {
        configure_user_namespace(child, &uid_mappings, &gid_mappings)
            .map_err(|e| (phase("namespace"), e))?;
    }

    if let Some((master, slave_name)) = console_master {
        let socket_path = opts.console_socket.as_deref().expect("checked above");
        crate::runway::console::send_master(&master, &slave_name, socket_path)
            .map_err(|e| (phase("console"), e))?;
        drop(master);
    }

    let limits = ResourceLimits {
        memory_limit: spec.memory_limit(),
        cpu_shares: spec.cpu_shares(),
    };
    let cgroup_path = cgroup::setup(init_pid, id, &spec.linux.cgroups_path, &limits)
        .map_err(|e| (phase("cgroup"), e))?;
    rollback.cgroup_path = Some(cgroup_path.clone());

    container_state.pid = init_pid;
    container_state.status = Status::Created;
    container_state
        .annotations
        .insert(ANNOTATION_CGROUP_PATH.to_string(), cgroup_path);

    hooks::run_sequence(
        &spec.hooks.create_container,
        &mut container_state,
        "createContainer",
        true,
    )
    .map_err(|e| (phase("createContainer"), e))?;

    state::save(&ctx.root, &container_state).map_err(|e| (phase("state"), e))?;
    if let Some(pid_file) = &opts.pid_file {
        state::write_pid_file(pid_file, init_pid).map_err(|e| (phase("state"), e))?;
    }
    events::record_state(&ctx.root, &container_state);
    info!("container {} created with pid {}", id, init_pid);

    Ok(CreateHandle {
        child,
        init_pid,
    })
}

/// Release the init from its FIFO wait and mark the container running.
pub fn start(ctx: &Context, id: &str, attach: bool) -> Result<()> {
    let mut container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Created {
        return Err(Error::wrong_state(id, container_state.status, "'created'"));
    }

    let bundle = PathBuf::from(&container_state.bundle);
    let spec = Spec::load(&bundle)?;

    hooks::run_sequence(&spec.hooks.prestart, &mut container_state, "prestart", true)?;
    hooks::run_sequence(
        &spec.hooks.start_container,
        &mut container_state,
        "startContainer",
        true,
    )?;

    let fifo_path = ctx.fifo_path(id);
    let mut fifo = OpenOptions::new()
        .write(true)
        .open(&fifo_path)
        .map_err(|e| Error::io(format!("open fifo {}", fifo_path.display()), e))?;
    fifo.write_all(b"1")
        .map_err(|e| Error::io("write start signal", e))?;
    drop(fifo);

    container_state.status = Status::Running;
    state::save(&ctx.root, &container_state)?;
    events::record_state(&ctx.root, &container_state);
    info!("container {} started", id);

    if let Err(err) = hooks::run_sequence(
        &spec.hooks.poststart,
        &mut container_state,
        "poststart",
        true,
    ) {
        warn!("poststart hooks failed, terminating container: {}", err);
        let _ = kill(Pid::from_raw(container_state.pid), Signal::SIGKILL);
        let _ = waitpid(
            Pid::from_raw(container_state.pid),
            Some(WaitPidFlag::WNOHANG),
        );
        container_state.status = Status::Stopped;
        state::save(&ctx.root, &container_state)?;
        events::record_state(&ctx.root, &container_state);
        return Err(err);
    }
    state::save(&ctx.root, &container_state)?;

    if attach {
        info!("attached to container {} (pid {})", id, container_state.pid);
        while process_alive(container_state.pid) {
            std::thread::sleep(ATTACH_POLL_INTERVAL);
        }
        container_state.status = Status::Stopped;
        state::save(&ctx.root, &container_state)?;
        events::record_state(&ctx.root, &container_state);
    }
    Ok(())
}

fn open_exec_namespaces(pid: i32) -> Vec<(String, File)> {
    let mut namespaces = Vec::new();
    for name in EXEC_NAMESPACE_ORDER {
        let path = format!("/proc/{}/ns/{}", pid, name);
        match File::open(&path) {
            Ok(file) => namespaces.push((name.to_string(), file)),
            // Absent namespaces (not unshared, or compiled out) are skipped.
            Err(err) => debug!("skipping namespace {}: {}", path, err),
        }
    }
    namespaces
}

/// Run an additional process inside a running container. Returns the
/// mapped exit code of the exec'd process, or 0 when detached.
pub fn exec(ctx: &Context, id: &str, opts: &ExecOptions) -> Result<i32> {
    let container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Running {
        return Err(Error::wrong_state(id, container_state.status, "'running'"));
    }

    let container_spec = Spec::load(Path::new(&container_state.bundle)).ok();

    let process = match &opts.process_path {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                Error::ConfigInvalid(format!("failed to open {}: {}", path.display(), e))
            })?;
            let process: crate::runway::spec::Process = serde_json::from_reader(file)
                .map_err(|e| {
                    Error::ConfigInvalid(format!("failed to parse {}: {}", path.display(), e))
                })?;
            process
        }
        None => {
            if opts.args.is_empty() {
                return Err(Error::ConfigInvalid(
                    "exec requires --process or a command".to_string(),
                ));
            }
            let defaults = container_spec.as_ref().map(|s| s.process.clone());
            crate::runway::spec::Process {
                terminal: opts.tty,
                user: defaults
                    .as_ref()
                    .map(|p| p.user.clone())
                    .unwrap_or_default(),
                args: opts.args.clone(),
                env: if opts.env.is_empty() {
                    defaults.map(|p| p.env).unwrap_or_default()
                } else {
                    opts.env.clone()
                },
                cwd: opts
                    .cwd
                    .clone()
                    .unwrap_or_else(|| "/".to_string()),
            }
        }
    };
    if process.args.is_empty() {
        return Err(Error::ConfigInvalid("exec process.args is empty".to_string()));
    }

    let namespaces = open_exec_namespaces(container_state.pid);

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for (name, file) in &namespaces {
                if let Err(err) = nix::sched::setns(file, CloneFlags::empty()) {
                    error!("exec setns {} failed: {}", name, err);
                    unsafe { libc::_exit(1) };
                }
            }
            if opts.tty || process.terminal {
                let _ = nix::unistd::setsid();
                unsafe {
                    libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0);
                }
            }
            if let Err(err) = nix::unistd::chdir(Path::new(&process.cwd)) {
                error!("exec chdir to {} failed: {}", process.cwd, err);
                unsafe { libc::_exit(1) };
            }
            crate::runway::init::rebuild_env(&process.env);

            let argv: Vec<std::ffi::CString> = process
                .args
                .iter()
                .filter_map(|arg| std::ffi::CString::new(arg.as_str()).ok())
                .collect();
            if argv.len() != process.args.len() {
                unsafe { libc::_exit(1) };
            }
            let _ = nix::unistd::execvp(&argv[0], &argv);
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(err) => return Err(Error::io_errno("fork exec process", err)),
    };
    drop(namespaces);

    if let Some(pid_file) = &opts.pid_file {
        state::write_pid_file(pid_file, child.as_raw())?;
    }
    events::record(
        &ctx.root,
        id,
        "exec",
        Some(serde_json::json!({ "pid": child.as_raw(), "type": "exec" })),
    );

    if opts.detach {
        return Ok(0);
    }

    let status = waitpid(child, None)
        .map_err(|e| Error::io_errno("wait for exec process", e))?;
    let code = exit_code_from_status(status);
    events::record(
        &ctx.root,
        id,
        "execExit",
        Some(serde_json::json!({
            "pid": child.as_raw(),
            "type": "execExit",
            "status": code,
        })),
    );
    Ok(code)
}

fn signal_process_tree(root_pid: i32, signal: Signal) {
    for pid in collect_process_tree(root_pid) {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {}
            Err(err) => warn!("failed to signal pid {}: {}", pid, err),
        }
    }
}

/// SIGSTOP every process in the container tree.
pub fn pause(ctx: &Context, id: &str) -> Result<()> {
    let mut container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Running {
        return Err(Error::wrong_state(id, container_state.status, "'running'"));
    }
    signal_process_tree(container_state.pid, Signal::SIGSTOP);
    container_state.status = Status::Paused;
    state::save(&ctx.root, &container_state)?;
    events::record_state(&ctx.root, &container_state);
    info!("container {} paused", id);
    Ok(())
}

/// SIGCONT every process in the container tree.
pub fn resume(ctx: &Context, id: &str) -> Result<()> {
    let mut container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Paused {
        return Err(Error::wrong_state(id, container_state.status, "'paused'"));
    }
    signal_process_tree(container_state.pid, Signal::SIGCONT);
    container_state.status = Status::Running;
    state::save(&ctx.root, &container_state)?;
    events::record_state(&ctx.root, &container_state);
    info!("container {} resumed", id);
    Ok(())
}

/// Deliver a signal to the container init. Terminal signals move the
/// state machine to `stopped` immediately; the init lives in another
/// PID namespace, so a blocking wait is not possible here. A
/// non-blocking reap covers the case where this process is the parent.
pub fn kill_container(ctx: &Context, id: &str, signal: Signal) -> Result<()> {
    let mut container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Running && container_state.status != Status::Created {
        return Err(Error::wrong_state(
            id,
            container_state.status,
            "'running' or 'created'",
        ));
    }

    let pid = Pid::from_raw(container_state.pid);
    match kill(pid, signal) {
        Ok(()) => {
            events::record(
                &ctx.root,
                id,
                "kill",
                Some(serde_json::json!({ "signal": signal as i32 })),
            );
            if signal == Signal::SIGTERM || signal == Signal::SIGKILL {
                let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
                container_state.status = Status::Stopped;
                state::save(&ctx.root, &container_state)?;
                events::record_state(&ctx.root, &container_state);
            }
            info!("sent signal {} to container {}", signal, id);
            Ok(())
        }
        Err(Errno::ESRCH) => {
            // Already gone: record the terminal state.
            container_state.status = Status::Stopped;
            state::save(&ctx.root, &container_state)?;
            events::record_state(&ctx.root, &container_state);
            Ok(())
        }
        Err(err) => Err(Error::io_errno(format!("kill container {}", id), err)),
    }
}

/// Remove every on-disk and kernel resource owned by the container.
pub fn delete(ctx: &Context, id: &str, force: bool) -> Result<()> {
    let mut container_state = state::load(&ctx.root, id)?;

    if container_state.status != Status::Stopped {
        if process_alive(container_state.pid) {
            if !force {
                return Err(Error::wrong_state(id, container_state.status, "'stopped'"));
            }
            let pid = Pid::from_raw(container_state.pid);
            let _ = kill(pid, Signal::SIGKILL);
            let deadline = Instant::now() + FORCE_DELETE_DEADLINE;
            while process_alive(container_state.pid) && Instant::now() < deadline {
                let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
                std::thread::sleep(ATTACH_POLL_INTERVAL);
            }
        }
        container_state.status = Status::Stopped;
        state::save(&ctx.root, &container_state)?;
    }

    // Best effort: the bundle may already be gone.
    if let Ok(spec) = Spec::load(Path::new(&container_state.bundle)) {
        if let Err(err) = hooks::run_sequence(
            &spec.hooks.poststop,
            &mut container_state,
            "poststop",
            true,
        ) {
            warn!("poststop hooks failed for container {}: {}", id, err);
            events::record_error(&ctx.root, id, "poststop", &err.to_string());
        }
    }

    let _ = fs::remove_file(ctx.fifo_path(id));
    let _ = fs::remove_file(ctx.state_file(id));
    let _ = fs::remove_file(ctx.events_path(id));
    let container_dir = ctx.container_dir(id);
    match fs::remove_dir(&container_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(Error::io(
                format!("remove state directory {}", container_dir.display()),
                err,
            ))
        }
    }

    let cgroup_hint = container_state
        .annotations
        .get(ANNOTATION_CGROUP_PATH)
        .cloned()
        .unwrap_or_default();
    cgroup::cleanup(id, &cgroup_hint);
    info!("container {} deleted", id);
    Ok(())
}

/// Load the state, lazily downgrading `running` to `stopped` when the
/// init has disappeared, and return the OCI state JSON.
pub fn state_json(ctx: &Context, id: &str) -> Result<String> {
    let mut container_state = state::load(&ctx.root, id)?;
    let live_status = matches!(
        container_state.status,
        Status::Created | Status::Running | Status::Paused
    );
    if live_status && container_state.pid > 0 && !process_alive(container_state.pid) {
        container_state.status = Status::Stopped;
        state::save(&ctx.root, &container_state)?;
    }
    Ok(container_state.to_json())
}

/// create + start + wait + delete, returning the payload's exit code.
pub fn run(ctx: &Context, id: &str, opts: &CreateOptions) -> Result<i32> {
    let handle = create(ctx, id, opts)?;
    start(ctx, id, false)?;

    // The direct child propagates the init's exit status across the PID
    // namespace boundary.
    let status = waitpid(handle.child, None)
        .map_err(|e| Error::io_errno("wait for container", e))?;
    let code = exit_code_from_status(status);

    let mut container_state = state::load(&ctx.root, id)?;
    container_state.status = Status::Stopped;
    state::save(&ctx.root, &container_state)?;
    events::record_state(&ctx.root, &container_state);

    delete(ctx, id, false)?;
    Ok(code)
}

/// `PID\tCMD` lines for every process in the container tree.
pub fn ps(ctx: &Context, id: &str) -> Result<Vec<(i32, String)>> {
    let container_state = state::load(&ctx.root, id)?;
    if container_state.status != Status::Running && container_state.status != Status::Paused {
        return Err(Error::wrong_state(
            id,
            container_state.status,
            "'running' or 'paused'",
        ));
    }
    Ok(collect_process_tree(container_state.pid)
        .into_iter()
        .map(|pid| {
            let comm = read_comm(pid).unwrap_or_else(|| "?".to_string());
            (pid, comm)
        })
        .collect())
}

fn clock_ticks_per_second() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}

/// One stats sample from /proc/<pid>/{stat,status}.
fn sample_stats(pid: i32) -> Option<serde_json::Value> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Field 2 (comm) may contain spaces; skip past the closing paren.
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // utime and stime are fields 14 and 15 of the full line; after comm
    // and state that leaves offsets 11 and 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let total_ns = (utime + stime) * (1_000_000_000 / clock_ticks_per_second());

    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let rss_kb: u64 = status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    let current = collect_process_tree(pid).len() as u64;

    Some(serde_json::json!({
        "cpu": { "usage": { "total_ns": total_ns } },
        "memory": { "usage": { "rss_bytes": rss_kb * 1024 } },
        "pids": { "current": current },
    }))
}

/// Stream the event log, or sample live stats with `--stats`.
pub fn events_stream<W: Write>(
    ctx: &Context,
    id: &str,
    follow: bool,
    stats: bool,
    interval_ms: u64,
    out: &mut W,
) -> Result<()> {
    let container_state = state::load(&ctx.root, id)?;

    if stats {
        // Sample until the container stops.
        let interval = Duration::from_millis(interval_ms.max(1));
        while process_alive(container_state.pid) {
            if let Some(data) = sample_stats(container_state.pid) {
                let entry = serde_json::json!({
                    "timestamp": chrono::Utc::now()
                        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    "type": "stats",
                    "id": id,
                    "data": data,
                });
                writeln!(out, "{}", entry).map_err(|e| Error::io("write stats", e))?;
                out.flush().ok();
            }
            std::thread::sleep(interval);
        }
        return Ok(());
    }

    let events_path = ctx.events_path(id);
    let mut offset = 0u64;
    loop {
        match File::open(&events_path) {
            Ok(mut file) => {
                use std::io::Seek;
                file.seek(std::io::SeekFrom::Start(offset))
                    .map_err(|e| Error::io("seek events log", e))?;
                let mut chunk = String::new();
                file.read_to_string(&mut chunk)
                    .map_err(|e| Error::io("read events log", e))?;
                offset += chunk.len() as u64;
                out.write_all(chunk.as_bytes())
                    .map_err(|e| Error::io("write events", e))?;
                out.flush().ok();
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if offset == 0 {
                    if !follow {
                        return Err(Error::NotFound(format!(
                            "no event log for container '{}'",
                            id
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                    continue;
                }
                // Log removed by delete: nothing further to stream.
                break;
            }
            Err(err) => return Err(Error::io("open events log", err)),
        }
        if !follow {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// The fixed supported-features descriptor.
pub fn features_json() -> String {
    let descriptor = serde_json::json!({
        "ociVersionMin": OCI_VERSION_MIN,
        "ociVersionMax": OCI_VERSION_MAX,
        "hooks": [
            "createRuntime",
            "createContainer",
            "prestart",
            "startContainer",
            "poststart",
            "poststop",
        ],
        "mountOptions": [
            "ro", "rw", "nosuid", "nodev", "noexec",
            "relatime", "norelatime", "strictatime", "nostrictatime",
            "sync", "dirsync", "remount", "bind", "rbind", "recursive",
            "private", "rprivate", "shared", "rshared",
            "slave", "rslave", "unbindable", "runbindable",
        ],
        "linux": {
            "namespaces": ["pid", "uts", "ipc", "net", "mnt", "user", "cgroup"],
            "cgroup": {
                "v1": true,
                "v2": true,
            },
        },
    });
    serde_json::to_string_pretty(&descriptor).unwrap_or_else(|_| descriptor.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing_accepts_numbers_and_names() {
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("KILL").unwrap(), Signal::SIGKILL);
        assert!(parse_signal("NOPE").is_err());
        assert!(parse_signal("4096").is_err());
    }

    #[test]
    fn id_mappings_format_one_line_each() {
        let mappings = vec![
            IdMapping {
                container_id: 0,
                host_id: 1000,
                size: 65536,
            },
            IdMapping {
                container_id: 65536,
                host_id: 200000,
                size: 1000,
            },
        ];
        assert_eq!(
            format_id_mappings(&mappings),
            "0 1000 65536\n65536 200000 1000\n"
        );
    }

    #[test]
    fn features_descriptor_is_valid_json() {
        let descriptor: serde_json::Value =
            serde_json::from_str(&features_json()).expect("valid json");
        assert_eq!(descriptor["ociVersionMin"], OCI_VERSION_MIN);
        assert!(descriptor["linux"]["cgroup"]["v2"].as_bool().unwrap());
        let hooks = descriptor["hooks"].as_array().unwrap();
        assert_eq!(hooks.len(), 6);
        let namespaces = descriptor["linux"]["namespaces"].as_array().unwrap();
        assert_eq!(namespaces.len(), 7);
    }

    #[test]
    fn exec_namespace_order_starts_with_user() {
        assert_eq!(EXEC_NAMESPACE_ORDER[0], "user");
        assert_eq!(EXEC_NAMESPACE_ORDER.len(), 7);
    }

    #[test]
    fn stats_sampler_reads_the_current_process() {
        let sample = sample_stats(std::process::id() as i32).expect("sample");
        assert!(sample["pids"]["current"].as_u64().unwrap() >= 1);
        assert!(sample["memory"]["usage"]["rss_bytes"].as_u64().unwrap() > 0);
        assert!(sample["cpu"]["usage"].get("total_ns").is_some());
    }
}
