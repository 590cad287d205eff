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

//! Domain error types.
//!
//! Fatal startup failures (host key, configuration, listener) and
//! per-session start failures get their own kinds so callers can log and
//! reply precisely; everything else travels as `anyhow::Error` with
//! context attached at the failure site.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors from the host-key store.
///
/// All of these are fatal at startup: the server refuses to accept
/// connections without exactly one usable host key.
#[derive(Debug)]
pub enum HostKeyError {
    /// Reading or writing the key file (or its directory) failed.
    Io { path: PathBuf, source: io::Error },

    /// Generating a fresh RSA key failed.
    Generate(String),

    /// The key file exists but does not contain a usable private key.
    Parse(String),
}

impl fmt::Display for HostKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyError::Io { path, source } => {
                write!(f, "host key I/O at {}: {source}", path.display())
            }
            HostKeyError::Generate(reason) => write!(f, "host key generation failed: {reason}"),
            HostKeyError::Parse(reason) => write!(f, "host key parse failed: {reason}"),
        }
    }
}

impl std::error::Error for HostKeyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostKeyError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors from committing a session to a shell or exec command.
///
/// These terminate only the affected request: the client sees a `false`
/// reply and the session stays in its pre-start state unless noted.
#[derive(Debug)]
pub enum SessionError {
    /// A shell or exec already committed this session channel.
    AlreadyRunning,

    /// PTY pair allocation failed.
    PtyAllocFailed(String),

    /// Setting up the stdio pipes for a pipe-mode child failed.
    PipeFailed(String),

    /// The child process could not be spawned.
    SpawnFailed(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyRunning => write!(f, "session already running"),
            SessionError::PtyAllocFailed(reason) => write!(f, "PTY allocation failed: {reason}"),
            SessionError::PipeFailed(reason) => write!(f, "stdio pipe setup failed: {reason}"),
            SessionError::SpawnFailed(source) => write!(f, "spawn failed: {source}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::SpawnFailed(source) => Some(source),
            _ => None,
        }
    }
}
