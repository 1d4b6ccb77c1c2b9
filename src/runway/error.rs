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

//! Error types for the container runtime.

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a container through its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The bundle configuration failed to load or violates an invariant.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No such container, namespace path, or hook binary.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted state exists but cannot be parsed.
    #[error("corrupt state for container '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    /// The command requires a different container status than observed.
    #[error("container '{id}' is in state '{actual}', expected {expected}")]
    WrongState {
        id: String,
        actual: String,
        expected: String,
    },

    /// unshare, setns, or id-map writing failed.
    #[error("namespace setup failed: {0}")]
    NamespaceFail(String),

    /// A required mount failed.
    #[error("mount failed for {target}: {reason}")]
    MountFail { target: String, reason: String },

    /// A cgroup controller is unavailable or a limit write failed.
    #[error("cgroup setup failed: {0}")]
    CgroupFail(String),

    /// A lifecycle hook exited non-zero, died on a signal, or timed out.
    #[error("hook '{path}' failed during {phase}: {reason}")]
    HookFail {
        phase: String,
        path: String,
        reason: String,
    },

    /// State file, FIFO, or event log I/O failed.
    #[error("i/o failure: {context}: {source}")]
    IoFail {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// PTY allocation or fd transfer failed.
    #[error("console setup failed: {0}")]
    ConsoleFail(String),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::IoFail {
            context: context.into(),
            source,
        }
    }

    pub fn io_errno(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Error::IoFail {
            context: context.into(),
            source: std::io::Error::from(errno),
        }
    }

    pub fn wrong_state(id: &str, actual: impl std::fmt::Display, expected: &str) -> Self {
        Error::WrongState {
            id: id.to_string(),
            actual: actual.to_string(),
            expected: expected.to_string(),
        }
    }
}
