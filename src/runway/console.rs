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

//! PTY allocation and SCM_RIGHTS transfer of the master fd to the
//! console-socket listener.

use crate::runway::error::{Error, Result};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::socket::{
    connect, sendmsg, socket, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use std::fs::OpenOptions;
use std::io::IoSlice;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// An allocated pty pair. Both fds close on drop.
#[derive(Debug)]
pub struct ConsolePair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
    pub slave_name: String,
}

impl ConsolePair {
    /// Open the pty master, grant and unlock it, resolve the slave path
    /// and open the slave. Partial allocations are released on failure
    /// by dropping the owned fds.
    pub fn allocate() -> Result<ConsolePair> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(|e| Error::ConsoleFail(format!("posix_openpt failed: {}", e)))?;
        grantpt(&master).map_err(|e| Error::ConsoleFail(format!("grantpt failed: {}", e)))?;
        unlockpt(&master).map_err(|e| Error::ConsoleFail(format!("unlockpt failed: {}", e)))?;
        let slave_name =
            ptsname_r(&master).map_err(|e| Error::ConsoleFail(format!("ptsname failed: {}", e)))?;

        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(&slave_name)
            .map_err(|e| Error::ConsoleFail(format!("open slave pty {}: {}", slave_name, e)))?;

        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        Ok(ConsolePair {
            master,
            slave: OwnedFd::from(slave),
            slave_name,
        })
    }

    /// Connect to the console socket and pass the master fd via
    /// SCM_RIGHTS, with the slave path as the message payload.
    pub fn send(&self, socket_path: &Path) -> Result<()> {
        send_master(&self.master, &self.slave_name, socket_path)
    }
}

/// The fd-transfer half of [`ConsolePair::send`], usable after the pair
/// has been split between parent and child.
pub fn send_master(master: &OwnedFd, slave_name: &str, socket_path: &Path) -> Result<()> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::ConsoleFail(format!("console socket creation failed: {}", e)))?;

    let addr = UnixAddr::new(socket_path)
        .map_err(|e| Error::ConsoleFail(format!("console socket path invalid: {}", e)))?;
    connect(sock.as_raw_fd(), &addr).map_err(|e| {
        Error::ConsoleFail(format!(
            "connect to console socket {}: {}",
            socket_path.display(),
            e
        ))
    })?;

    let payload = if slave_name.is_empty() {
        "console"
    } else {
        slave_name
    };
    let iov = [IoSlice::new(payload.as_bytes())];
    let fds = [master.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| Error::ConsoleFail(format!("sendmsg on console socket: {}", e)))?;
    Ok(())
}
