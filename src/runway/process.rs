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
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::time::{Duration, Instant};

/// Wait for a child with an optional deadline. `timeout_sec == 0` blocks
/// indefinitely. Returns `None` when the deadline passed; the child is
/// then SIGKILLed and reaped before returning.
pub fn wait_with_timeout(pid: Pid, timeout_sec: u64) -> Result<Option<WaitStatus>> {
    if timeout_sec == 0 {
        let status = waitpid(pid, None)
            .map_err(|e| Error::io_errno(format!("wait for process {}", pid), e))?;
        return Ok(Some(status));
    }

    let deadline = Instant::now() + Duration::from_secs(timeout_sec);
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => return Ok(Some(status)),
            Err(e) => return Err(Error::io_errno(format!("wait for process {}", pid), e)),
        }
        if Instant::now() >= deadline {
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Collect `root_pid` plus every descendant reachable through
/// `/proc/<pid>/task/<pid>/children`. A visited set guards against
/// repeated pids.
pub fn collect_process_tree(root_pid: i32) -> Vec<i32> {
    let mut result = Vec::new();
    if root_pid <= 0 {
        return result;
    }

    let mut queue = VecDeque::new();
    let mut visited = HashSet::new();
    queue.push_back(root_pid);
    visited.insert(root_pid);

    while let Some(current) = queue.pop_front() {
        result.push(current);

        let children_path = format!("/proc/{}/task/{}/children", current, current);
        let Ok(contents) = fs::read_to_string(&children_path) else {
            continue;
        };
        for token in contents.split_whitespace() {
            if let Ok(child) = token.parse::<i32>() {
                if child > 0 && visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
    result
}

/// Probe liveness with the null signal. A process we may not signal
/// still exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

pub fn read_comm(pid: i32) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|s| s.trim_end().to_string())
}
