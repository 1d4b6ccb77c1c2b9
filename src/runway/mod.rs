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

pub mod cgroup;
pub mod cli;
pub mod console;
pub mod error;
pub mod events;
pub mod hooks;
pub mod init;
pub mod lifecycle;
pub mod logger;
pub mod mount;
pub mod paths;
pub mod process;
pub mod spec;
pub mod state;

/// Version reported in persisted state and the `runway.version` annotation.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// OCI runtime-spec versions this runtime accepts.
pub const OCI_VERSION_MIN: &str = "1.0.0";
pub const OCI_VERSION_MAX: &str = "1.2.1";
