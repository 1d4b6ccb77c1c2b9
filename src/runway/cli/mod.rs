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

pub mod args;

use crate::runway::error::Result;
use crate::runway::lifecycle::{self, CreateOptions, ExecOptions};
use crate::runway::paths::{resolve_state_root, Context};
use crate::runway::{events, logger};
use args::{Commands, Runway};
use log::warn;

fn create_options(create: &args::CreateArgs) -> CreateOptions {
    CreateOptions {
        bundle: create.bundle.clone(),
        pid_file: create.pid_file.clone(),
        console_socket: create.console_socket.clone(),
        no_pivot: create.no_pivot,
        preserve_fds: create.preserve_fds,
        notify_socket: create.notify_socket.clone(),
    }
}

/// Record an `error` event for a failed command, but never invent a
/// state directory for an unknown container id.
fn record_failure(ctx: &Context, id: &str, phase: &str, message: &str) {
    if ctx.container_dir(id).is_dir() {
        events::record_error(&ctx.root, id, phase, message);
    }
}

fn report<T>(ctx: &Context, id: &str, phase: &str, result: Result<T>) -> std::result::Result<T, i32> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            eprintln!("runway: {}", err);
            record_failure(ctx, id, phase, &err.to_string());
            Err(1)
        }
    }
}

/// Execute one parsed command. Returns the process exit code.
pub fn dispatch(cli: Runway) -> i32 {
    let format = match cli.log_format.parse::<logger::LogFormat>() {
        Ok(format) => format,
        Err(err) => {
            eprintln!("runway: {}", err);
            return 1;
        }
    };
    if let Err(err) = logger::init(cli.debug, format, cli.log.as_deref()) {
        eprintln!("runway: failed to set up logging: {}", err);
        return 1;
    }

    // `features` needs no state root at all.
    if let Commands::Features = cli.command {
        println!("{}", lifecycle::features_json());
        return 0;
    }

    let root = match resolve_state_root(cli.root.as_deref()) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("runway: {}", err);
            return 1;
        }
    };
    let ctx = Context {
        root,
        debug: cli.debug,
        systemd_cgroup: cli.systemd_cgroup,
    };
    if ctx.systemd_cgroup {
        warn!("--systemd-cgroup requested; using the cgroupfs driver");
    }

    match cli.command {
        Commands::Features => unreachable!("handled above"),
        Commands::Create(create) => {
            let opts = create_options(&create);
            // create records its own failure events with per-phase detail.
            match lifecycle::create(&ctx, &create.id, &opts) {
                Ok(_) => 0,
                Err(err) => {
                    eprintln!("runway: {}", err);
                    1
                }
            }
        }
        Commands::Start(start) => {
            match report(
                &ctx,
                &start.id,
                "start",
                lifecycle::start(&ctx, &start.id, start.attach),
            ) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Commands::Run(run) => {
            let opts = create_options(&run);
            match lifecycle::run(&ctx, &run.id, &opts) {
                Ok(code) => code,
                Err(err) => {
                    eprintln!("runway: {}", err);
                    record_failure(&ctx, &run.id, "run", &err.to_string());
                    1
                }
            }
        }
        Commands::State(state) => {
            match report(
                &ctx,
                &state.id,
                "state",
                lifecycle::state_json(&ctx, &state.id),
            ) {
                Ok(json) => {
                    println!("{}", json);
                    0
                }
                Err(code) => code,
            }
        }
        Commands::Exec(exec) => {
            let opts = ExecOptions {
                process_path: exec.process.clone(),
                args: exec.command.clone(),
                env: exec.env.clone(),
                cwd: exec.cwd.clone(),
                detach: exec.detach,
                tty: exec.tty,
                pid_file: exec.pid_file.clone(),
            };
            match report(&ctx, &exec.id, "exec", lifecycle::exec(&ctx, &exec.id, &opts)) {
                Ok(code) => code,
                Err(code) => code,
            }
        }
        Commands::Pause(pause) => {
            match report(&ctx, &pause.id, "pause", lifecycle::pause(&ctx, &pause.id)) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Commands::Resume(resume) => {
            match report(
                &ctx,
                &resume.id,
                "resume",
                lifecycle::resume(&ctx, &resume.id),
            ) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Commands::Ps(ps) => {
            match report(&ctx, &ps.id, "ps", lifecycle::ps(&ctx, &ps.id)) {
                Ok(processes) => {
                    println!("PID\tCMD");
                    for (pid, comm) in processes {
                        println!("{}\t{}", pid, comm);
                    }
                    0
                }
                Err(code) => code,
            }
        }
        Commands::Events(events_args) => {
            let mut stdout = std::io::stdout();
            match report(
                &ctx,
                &events_args.id,
                "events",
                lifecycle::events_stream(
                    &ctx,
                    &events_args.id,
                    events_args.follow,
                    events_args.stats,
                    events_args.interval,
                    &mut stdout,
                ),
            ) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Commands::Kill(kill) => {
            let signal = match lifecycle::parse_signal(&kill.signal) {
                Ok(signal) => signal,
                Err(err) => {
                    eprintln!("runway: {}", err);
                    return 1;
                }
            };
            match report(
                &ctx,
                &kill.id,
                "kill",
                lifecycle::kill_container(&ctx, &kill.id, signal),
            ) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
        Commands::Delete(delete) => {
            match report(
                &ctx,
                &delete.id,
                "delete",
                lifecycle::delete(&ctx, &delete.id, delete.force),
            ) {
                Ok(()) => 0,
                Err(code) => code,
            }
        }
    }
}
