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

//! Lifecycle hook execution: each hook receives the container state JSON
//! on stdin and runs with a bounded lifetime.

use crate::runway::error::{Error, Result};
use crate::runway::process::wait_with_timeout;
use crate::runway::spec::Hook;
use crate::runway::state::ContainerState;
use chrono::{SecondsFormat, Utc};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2_stdin, execve, fork, pipe, ForkResult};
use std::ffi::CString;

const ANNOTATION_PREFIX: &str = "runway.hooks.";

fn annotation_key(phase: &str) -> String {
    format!("{}{}", ANNOTATION_PREFIX, phase)
}

fn write_all(fd: &std::os::fd::OwnedFd, data: &[u8]) -> std::result::Result<(), Errno> {
    let mut written = 0;
    while written < data.len() {
        match nix::unistd::write(fd, &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn hook_failure(phase: &str, path: &str, reason: impl Into<String>) -> Error {
    Error::HookFail {
        phase: phase.to_string(),
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Environment handed to a hook: the parent environment, the OCI
/// bookkeeping variables, then the hook's own entries.
fn build_hook_env(hook: &Hook, state: &ContainerState, phase: &str) -> Vec<String> {
    let mut env: Vec<String> = std::env::vars()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();
    env.push(format!("OCI_HOOK_TYPE={}", phase));
    env.push(format!("OCI_CONTAINER_ID={}", state.id));
    env.push(format!(
        "OCI_CONTAINER_BUNDLE={}",
        if state.bundle.is_empty() {
            "."
        } else {
            state.bundle.as_str()
        }
    ));
    env.push(format!("OCI_CONTAINER_PID={}", state.pid));
    env.push(format!("OCI_CONTAINER_STATUS={}", state.status));
    env.extend(hook.env.iter().cloned());
    env
}

fn execute_single_hook(hook: &Hook, state: &ContainerState, phase: &str) -> Result<()> {
    if hook.path.is_empty() {
        return Err(hook_failure(phase, "", "hook path is empty"));
    }

    let path_c = CString::new(hook.path.as_str())
        .map_err(|_| hook_failure(phase, &hook.path, "hook path contains NUL byte"))?;
    let arg_strings: Vec<String> = if hook.args.is_empty() {
        vec![hook.path.clone()]
    } else {
        hook.args.clone()
    };
    let argv: Vec<CString> = arg_strings
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| hook_failure(phase, &hook.path, "hook argument contains NUL byte"))?;
    let envp: Vec<CString> = build_hook_env(hook, state, phase)
        .iter()
        .map(|entry| CString::new(entry.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| hook_failure(phase, &hook.path, "hook environment contains NUL byte"))?;
    let payload = state.to_json();

    let (stdin_read, stdin_write) =
        pipe().map_err(|e| hook_failure(phase, &hook.path, format!("pipe failed: {}", e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(stdin_write);
            if dup2_stdin(&stdin_read).is_err() {
                unsafe { libc::_exit(127) };
            }
            drop(stdin_read);
            let _ = execve(&path_c, &argv, &envp);
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => {
            drop(stdin_read);
            if let Err(err) = write_all(&stdin_write, payload.as_bytes()) {
                // EPIPE means the hook exited without reading stdin; its
                // exit status decides the outcome below.
                if err != Errno::EPIPE {
                    error!(
                        "failed to write container state to hook stdin {}: {}",
                        hook.path, err
                    );
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, None);
                    return Err(hook_failure(
                        phase,
                        &hook.path,
                        format!("state write failed: {}", err),
                    ));
                }
            }
            drop(stdin_write);

            match wait_with_timeout(child, hook.timeout)? {
                None => Err(hook_failure(
                    phase,
                    &hook.path,
                    format!("timed out after {}s", hook.timeout),
                )),
                Some(WaitStatus::Exited(_, 0)) => Ok(()),
                Some(WaitStatus::Exited(_, code)) => Err(hook_failure(
                    phase,
                    &hook.path,
                    format!("exited with status {}", code),
                )),
                Some(WaitStatus::Signaled(_, signal, _)) => Err(hook_failure(
                    phase,
                    &hook.path,
                    format!("terminated by signal {}", signal),
                )),
                Some(other) => Err(hook_failure(
                    phase,
                    &hook.path,
                    format!("unexpected wait status {:?}", other),
                )),
            }
        }
        Err(err) => Err(hook_failure(
            phase,
            &hook.path,
            format!("fork failed: {}", err),
        )),
    }
}

/// Run every hook of one phase in order. A phase that already completed
/// on this state (annotation present) is skipped, making retries
/// idempotent. On success the completion annotation is stamped into the
/// state; the caller persists it.
pub fn run_sequence(
    hooks: &[Hook],
    state: &mut ContainerState,
    phase: &str,
    enforce_once: bool,
) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    let key = annotation_key(phase);
    if enforce_once && state.annotations.contains_key(&key) {
        debug!("{} hooks already ran for container {}", phase, state.id);
        return Ok(());
    }

    for hook in hooks {
        debug!("running {} hook {}", phase, hook.path);
        execute_single_hook(hook, state, phase)?;
    }

    state.annotations.insert(
        key,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runway::state::Status;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn test_state() -> ContainerState {
        let mut state = ContainerState::new("hooked", "/bundle", "1.0.0");
        state.pid = 41;
        state.status = Status::Created;
        state
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path.to_string_lossy().to_string()
    }

    #[test]
    fn successful_hook_stamps_completion_annotation() {
        let tmp = TempDir::new().expect("tempdir");
        let script = write_script(&tmp, "ok.sh", "exit 0");
        let hooks = vec![Hook {
            path: script,
            args: vec![],
            env: vec![],
            timeout: 5,
        }];
        let mut state = test_state();

        run_sequence(&hooks, &mut state, "createRuntime", true).expect("hooks run");
        assert!(state.annotations.contains_key("runway.hooks.createRuntime"));
    }

    #[test]
    fn completed_phase_does_not_rerun() {
        let tmp = TempDir::new().expect("tempdir");
        let counter = tmp.path().join("count");
        let script = write_script(
            &tmp,
            "count.sh",
            &format!("echo run >> {}", counter.display()),
        );
        let hooks = vec![Hook {
            path: script,
            args: vec![],
            env: vec![],
            timeout: 5,
        }];
        let mut state = test_state();

        run_sequence(&hooks, &mut state, "createRuntime", true).expect("first run");
        run_sequence(&hooks, &mut state, "createRuntime", true).expect("second run");

        let recorded = fs::read_to_string(&counter).expect("counter file");
        assert_eq!(recorded.lines().count(), 1, "hook must run exactly once");
    }

    #[test]
    fn hook_receives_state_on_stdin_and_oci_env() {
        let tmp = TempDir::new().expect("tempdir");
        let stdin_copy = tmp.path().join("stdin.json");
        let env_copy = tmp.path().join("env.txt");
        let script = write_script(
            &tmp,
            "capture.sh",
            &format!(
                "cat > {}\necho \"$OCI_HOOK_TYPE $OCI_CONTAINER_ID $OCI_CONTAINER_STATUS\" > {}",
                stdin_copy.display(),
                env_copy.display()
            ),
        );
        let hooks = vec![Hook {
            path: script,
            args: vec![],
            env: vec![],
            timeout: 5,
        }];
        let mut state = test_state();

        run_sequence(&hooks, &mut state, "prestart", true).expect("hooks run");

        let payload: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&stdin_copy).expect("stdin copy"))
                .expect("state json on stdin");
        assert_eq!(payload["id"], "hooked");
        assert_eq!(payload["status"], "created");

        let env_line = fs::read_to_string(&env_copy).expect("env copy");
        assert_eq!(env_line.trim(), "prestart hooked created");
    }

    #[test]
    fn failing_hook_fails_the_phase_without_annotation() {
        let tmp = TempDir::new().expect("tempdir");
        let script = write_script(&tmp, "fail.sh", "exit 3");
        let hooks = vec![Hook {
            path: script,
            args: vec![],
            env: vec![],
            timeout: 5,
        }];
        let mut state = test_state();

        let err = run_sequence(&hooks, &mut state, "poststart", true).unwrap_err();
        assert!(matches!(err, Error::HookFail { .. }));
        assert!(!state.annotations.contains_key("runway.hooks.poststart"));
    }

    #[test]
    fn slow_hook_is_killed_on_timeout() {
        let tmp = TempDir::new().expect("tempdir");
        let script = write_script(&tmp, "slow.sh", "sleep 30");
        let hooks = vec![Hook {
            path: script,
            args: vec![],
            env: vec![],
            timeout: 1,
        }];
        let mut state = test_state();

        let started = std::time::Instant::now();
        let err = run_sequence(&hooks, &mut state, "poststop", true).unwrap_err();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        match err {
            Error::HookFail { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("expected HookFail, got {:?}", other),
        }
    }

    #[test]
    fn missing_hook_binary_fails_the_phase() {
        let hooks = vec![Hook {
            path: "/does/not/exist".to_string(),
            args: vec![],
            env: vec![],
            timeout: 5,
        }];
        let mut state = test_state();
        let err = run_sequence(&hooks, &mut state, "createContainer", true).unwrap_err();
        match err {
            Error::HookFail { reason, .. } => assert!(reason.contains("127")),
            other => panic!("expected HookFail, got {:?}", other),
        }
    }
}
