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

use chrono::{SecondsFormat, Utc};
use log::{LevelFilter, Metadata, Record};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const SERVICE_NAME: &str = "runway";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

static JSON_OUTPUT: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    JSON_OUTPUT.store(format == LogFormat::Json, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    if JSON_OUTPUT.load(Ordering::Relaxed) {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

/// A value that can appear after `key=` without quoting: path, id and
/// number shaped tokens. Everything else gets JSON string quoting.
fn is_bare_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '+'))
}

fn append_field(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');
    if is_bare_token(value) {
        line.push_str(value);
    } else {
        // JSON string encoding handles quotes, backslashes and control
        // characters in one place.
        match serde_json::to_string(value) {
            Ok(quoted) => line.push_str(&quoted),
            Err(_) => line.push_str(value),
        }
    }
}

fn format_line(record: &Record) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();
    let level = record.level().to_string().to_uppercase();
    let component = record.target().to_string();
    let message = record.args().to_string();

    match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            append_field(&mut line, "ts", &timestamp);
            append_field(&mut line, "level", &level);
            append_field(&mut line, "service", SERVICE_NAME);
            append_field(&mut line, "component", &component);
            append_field(&mut line, "pid", &pid);
            append_field(&mut line, "msg", &message);
            line
        }
        LogFormat::Json => {
            let mut payload = serde_json::Map::new();
            payload.insert("ts".into(), Value::String(timestamp));
            payload.insert("level".into(), Value::String(level));
            payload.insert("service".into(), Value::String(SERVICE_NAME.to_string()));
            payload.insert("component".into(), Value::String(component));
            payload.insert("pid".into(), Value::String(pid));
            payload.insert("msg".into(), Value::String(message));
            Value::Object(payload).to_string()
        }
    }
}

/// Log backend for the `log` macros. Writes to stderr, or to the file
/// configured with `--log`.
struct RunwayLogger {
    destination: Option<Mutex<File>>,
}

impl log::Log for RunwayLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        match &self.destination {
            Some(file) => {
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                    let _ = guard.flush();
                }
            }
            None => {
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{}", line);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.destination {
            if let Ok(mut guard) = file.lock() {
                let _ = guard.flush();
            }
        }
    }
}

/// Install the logger once at startup. `log_path` switches the destination
/// from stderr to an append-mode file.
pub fn init(debug: bool, format: LogFormat, log_path: Option<&Path>) -> io::Result<()> {
    set_log_format(format);

    let destination = match log_path {
        Some(path) => Some(Mutex::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    let logger = Box::new(RunwayLogger { destination });
    log::set_boxed_logger(logger)
        .map_err(|e| io::Error::other(format!("logger already installed: {}", e)))?;
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    Ok(())
}
