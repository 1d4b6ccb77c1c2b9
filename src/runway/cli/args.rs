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

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// An OCI-compatible container runtime.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Runway {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    pub log: Option<PathBuf>,

    /// Log line format
    #[arg(long, global = true, value_name = "text|json", default_value = "text")]
    pub log_format: String,

    /// Directory for container state
    #[arg(long, global = true, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Use the systemd cgroup driver (the cgroupfs driver is the only
    /// implemented backend)
    #[arg(long, global = true)]
    pub systemd_cgroup: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a container from a bundle without starting it
    Create(CreateArgs),

    /// Start a created container
    Start(StartArgs),

    /// Create and start a container, wait for it, then delete it
    Run(CreateArgs),

    /// Output the state of a container
    State(IdArgs),

    /// Print the supported-features descriptor
    Features,

    /// Execute a new process inside a running container
    Exec(ExecArgs),

    /// Pause all processes in a container
    Pause(IdArgs),

    /// Resume all paused processes in a container
    Resume(IdArgs),

    /// List the processes of a running container
    Ps(IdArgs),

    /// Stream the container event log or live resource statistics
    Events(EventsArgs),

    /// Send a signal to the container init process
    Kill(KillArgs),

    /// Delete a stopped container
    Delete(DeleteArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    /// Path to the bundle directory
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,

    /// Write the container init pid to this file
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Unix socket that receives the pty master fd
    #[arg(long, value_name = "PATH")]
    pub console_socket: Option<PathBuf>,

    /// Use chroot instead of pivot_root
    #[arg(long)]
    pub no_pivot: bool,

    /// Number of additional fds to pass to the container
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub preserve_fds: u32,

    /// sd_notify socket exported to the container as NOTIFY_SOCKET
    #[arg(long, value_name = "PATH")]
    pub notify_socket: Option<PathBuf>,

    /// Container id
    #[arg()]
    pub id: String,
}

#[derive(Args)]
pub struct StartArgs {
    /// Block until the container exits
    #[arg(short, long)]
    pub attach: bool,

    /// Container id
    #[arg()]
    pub id: String,
}

#[derive(Args)]
pub struct IdArgs {
    /// Container id
    #[arg()]
    pub id: String,
}

#[derive(Args)]
pub struct ExecArgs {
    /// Path to a process.json describing the process to run
    #[arg(long, value_name = "PATH")]
    pub process: Option<PathBuf>,

    /// Write the exec'd process pid to this file
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Do not wait for the process to exit
    #[arg(short, long)]
    pub detach: bool,

    /// Make the inherited stdin the controlling terminal
    #[arg(short, long)]
    pub tty: bool,

    /// Number of additional fds to pass to the process
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub preserve_fds: u32,

    /// Environment entries in KEY=VALUE form
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Working directory inside the container
    #[arg(long, value_name = "PATH")]
    pub cwd: Option<String>,

    /// Container id
    #[arg()]
    pub id: String,

    /// Command to run inside the container (after `--`)
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct EventsArgs {
    /// Keep streaming until the container is gone
    #[arg(short, long)]
    pub follow: bool,

    /// Emit resource statistics instead of the event log
    #[arg(long)]
    pub stats: bool,

    /// Sampling interval for --stats, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    pub interval: u64,

    /// Container id
    #[arg()]
    pub id: String,
}

#[derive(Args)]
pub struct KillArgs {
    /// Container id
    #[arg()]
    pub id: String,

    /// Signal name or number
    #[arg(default_value = "SIGTERM")]
    pub signal: String,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Kill the container if it is still running
    #[arg(short, long)]
    pub force: bool,

    /// Container id
    #[arg()]
    pub id: String,
}
