// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! PTY (pseudo-terminal) management for interactive sessions.
//!
//! Creates the master/slave pair, applies window sizes, and provides
//! async I/O on the master file descriptor. The slave side is opened by
//! the shell child via its device path.
//!
//! POSIX PTY APIs only; this module is Unix-specific.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::unistd;
use tokio::io::unix::AsyncFd;

/// Master side of a PTY pair with async I/O support.
///
/// Shared between the session's byte pumps and the resize path, so all
/// operations take `&self`; the kernel serializes the underlying reads,
/// writes, and ioctls.
pub struct PtyMaster {
    async_fd: AsyncFd<OwnedFd>,
    slave_path: PathBuf,
}

impl PtyMaster {
    /// Open a new PTY pair.
    ///
    /// With both `cols` and `rows` zero the OS default window size is
    /// kept; otherwise the requested size is applied to the slave before
    /// the child ever sees it.
    pub fn open(cols: u16, rows: u16) -> Result<Self> {
        let winsize = (cols > 0 || rows > 0).then(|| Winsize {
            ws_col: cols,
            ws_row: rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });

        let OpenptyResult {
            master: master_fd,
            slave: slave_fd,
        } = openpty(winsize.as_ref(), None).context("openpty")?;

        let slave_path = unistd::ttyname(slave_fd.as_fd()).context("slave TTY path")?;

        // Slave is reopened by the child process through its path.
        drop(slave_fd);

        Self::set_nonblocking(master_fd.as_fd())?;
        let async_fd = AsyncFd::new(master_fd).context("register PTY master with reactor")?;

        Ok(Self {
            async_fd,
            slave_path,
        })
    }

    /// Device path of the slave side.
    pub fn slave_path(&self) -> &PathBuf {
        &self.slave_path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }

    /// Apply a new window size to the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let winsize = Winsize {
            ws_col: cols,
            ws_row: rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: the fd is open for the lifetime of self and winsize is
        // a valid struct for TIOCSWINSZ.
        let result = unsafe { libc::ioctl(self.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if result < 0 {
            Err(io::Error::last_os_error()).context("TIOCSWINSZ")
        } else {
            Ok(())
        }
    }

    fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
        let raw_fd = fd.as_raw_fd();
        let flags = nix::fcntl::fcntl(raw_fd, nix::fcntl::FcntlArg::F_GETFL).context("F_GETFL")?;
        let new_flags =
            nix::fcntl::OFlag::from_bits_truncate(flags) | nix::fcntl::OFlag::O_NONBLOCK;
        nix::fcntl::fcntl(raw_fd, nix::fcntl::FcntlArg::F_SETFL(new_flags)).context("F_SETFL")?;
        Ok(())
    }

    /// Read from the master, waiting until data is available.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.async_fd.readable().await?;

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: fd is valid and buf is a valid slice.
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write to the master, waiting until the fd is writable.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.async_fd.writable().await?;

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: fd is valid and buf is a valid slice.
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer to the master.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl std::fmt::Debug for PtyMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyMaster")
            .field("slave_path", &self.slave_path)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}
