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

//! Per-channel session handling.
//!
//! A session channel moves through three phases:
//!
//! - `Collecting`: requests before the shell starts (`pty-req`, `env`,
//!   `window-change`) accumulate configuration.
//! - `Running`: a single `shell` or `exec` commits the session, spawns
//!   the child (optionally on a PTY) and wires the byte pumps. Only
//!   `window-change` and `signal` still do anything.
//! - `Exited`: the child is gone and `exit-status` has been reported;
//!   every further request is refused.
//!
//! Exactly one `shell`/`exec` may succeed per channel. All phase state
//! lives behind one async mutex; the pumps and the reaper hold their own
//! handles (PTY master, pipe ends, child) and never touch the mutex
//! across I/O.

use std::os::fd::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec, Sig};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::PtyMaster;
use super::signal::wire_signal_to_os;
use crate::error::SessionError;

/// Buffer size for the byte pumps.
const IO_BUFFER_SIZE: usize = 8192;

/// Depth of the channel→child input queue.
const INPUT_QUEUE_DEPTH: usize = 256;

/// How long the reaper waits for the output pumps to drain after the
/// child exits. Output pumps normally finish on EOF well within this;
/// the bound keeps a grandchild holding the PTY slave open from
/// blocking the exit-status report forever.
const OUTPUT_DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// One session channel: pre-start request collection, the committed
/// child, and the exit report.
///
/// The owning connection handler knows which channel this session is
/// bound to; the id is only needed here once the session commits, so
/// `start_shell`/`start_exec` receive it together with the connection
/// handle.
pub struct Session {
    user: String,
    shell: PathBuf,
    shutdown: CancellationToken,
    state: Arc<Mutex<State>>,
    exit_sent: Arc<AtomicBool>,
}

enum State {
    Collecting {
        pty_requested: bool,
        cols: u16,
        rows: u16,
        env: Vec<(String, String)>,
    },
    Running {
        /// Narrow capability to signal the child; the reaper owns the
        /// child handle itself.
        pid: Option<Pid>,
        pty: Option<Arc<PtyMaster>>,
        input: Option<mpsc::Sender<Vec<u8>>>,
    },
    Exited,
}

impl Session {
    pub fn new(user: String, shell: PathBuf, shutdown: CancellationToken) -> Self {
        let env = seed_env(&user, &shell);
        Self {
            user,
            shell,
            shutdown,
            state: Arc::new(Mutex::new(State::Collecting {
                pty_requested: false,
                cols: 0,
                rows: 0,
                env,
            })),
            exit_sent: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `pty-req`: record the terminal request. Only honored before the
    /// session commits.
    pub async fn pty_request(&self, term: &str, cols: u32, rows: u32) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Collecting {
                pty_requested,
                cols: stored_cols,
                rows: stored_rows,
                env,
            } => {
                *pty_requested = true;
                *stored_cols = clamp_dim(cols);
                *stored_rows = clamp_dim(rows);
                if !term.is_empty() {
                    env.push(("TERM".to_string(), term.to_string()));
                }
                true
            }
            _ => false,
        }
    }

    /// `env`: append a variable. Empty keys and post-start requests are
    /// refused.
    pub async fn env_request(&self, name: &str, value: &str) -> bool {
        if name.is_empty() {
            return false;
        }

        let mut state = self.state.lock().await;
        match &mut *state {
            State::Collecting { env, .. } => {
                env.push((name.to_string(), value.to_string()));
                true
            }
            _ => false,
        }
    }

    /// `window-change`: update the recorded size and, once a PTY master
    /// exists, push the new size to it.
    pub async fn window_change(&self, cols: u32, rows: u32) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            State::Collecting {
                cols: stored_cols,
                rows: stored_rows,
                ..
            } => {
                *stored_cols = clamp_dim(cols);
                *stored_rows = clamp_dim(rows);
                true
            }
            State::Running { pty, .. } => {
                if let Some(pty) = pty {
                    if let Err(err) = pty.resize(clamp_dim(cols), clamp_dim(rows)) {
                        tracing::debug!(user = %self.user, error = %err, "PTY resize failed");
                    }
                }
                true
            }
            State::Exited => false,
        }
    }

    /// `shell`: commit the session to an interactive shell.
    pub async fn start_shell(
        &self,
        channel_id: ChannelId,
        handle: Handle,
    ) -> Result<(), SessionError> {
        self.start("", channel_id, handle).await
    }

    /// `exec`: commit the session to a one-shot command.
    pub async fn start_exec(
        &self,
        command: &str,
        channel_id: ChannelId,
        handle: Handle,
    ) -> Result<(), SessionError> {
        self.start(command, channel_id, handle).await
    }

    /// `signal`: deliver a recognized signal to the running child.
    ///
    /// Unknown names and signals before start are acknowledged without
    /// effect; a session that already exited refuses the request.
    pub async fn signal(&self, signal: &Sig) -> bool {
        let state = self.state.lock().await;
        match &*state {
            State::Running { pid, .. } => {
                if let (Some(sig), Some(pid)) = (wire_signal_to_os(signal), *pid) {
                    if let Err(err) = kill(pid, sig) {
                        tracing::debug!(
                            user = %self.user,
                            signal = %sig,
                            error = %err,
                            "signal delivery failed"
                        );
                    }
                }
                true
            }
            State::Collecting { .. } => true,
            State::Exited => false,
        }
    }

    /// Channel data: forward to the child's input.
    pub async fn data(&self, bytes: &[u8]) {
        let sender = {
            let state = self.state.lock().await;
            match &*state {
                State::Running {
                    input: Some(tx), ..
                } => Some(tx.clone()),
                _ => None,
            }
        };

        if let Some(tx) = sender {
            let _ = tx.send(bytes.to_vec()).await;
        }
    }

    /// Channel EOF: close the child's input (stdin pipe or PTY feed).
    pub async fn eof(&self) {
        let mut state = self.state.lock().await;
        if let State::Running { input, .. } = &mut *state {
            input.take();
        }
    }

    async fn start(
        &self,
        command: &str,
        channel_id: ChannelId,
        handle: Handle,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        let (pty_requested, cols, rows, env) = match &*state {
            State::Collecting {
                pty_requested,
                cols,
                rows,
                env,
            } => (*pty_requested, *cols, *rows, env.clone()),
            _ => return Err(SessionError::AlreadyRunning),
        };

        let mut cmd = Command::new(&self.shell);
        for arg in shell_args(command) {
            cmd.arg(arg);
        }
        cmd.current_dir("/");
        cmd.env_clear();
        for (key, value) in &env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);
        let mut output_pumps: Vec<JoinHandle<()>> = Vec::new();

        let (child, pty) = if pty_requested {
            let pty = Arc::new(
                PtyMaster::open(cols, rows)
                    .map_err(|e| SessionError::PtyAllocFailed(e.to_string()))?,
            );
            let child = spawn_on_pty(&mut cmd, &pty)?;

            output_pumps.push(tokio::spawn(pump_pty_to_channel(
                Arc::clone(&pty),
                handle.clone(),
                channel_id,
            )));
            tokio::spawn(pump_input_to_pty(Arc::clone(&pty), input_rx));

            (child, Some(pty))
        } else {
            cmd.stdin(Stdio::piped());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());

            let mut child = cmd.spawn().map_err(SessionError::SpawnFailed)?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| SessionError::PipeFailed("stdin pipe missing".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| SessionError::PipeFailed("stdout pipe missing".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| SessionError::PipeFailed("stderr pipe missing".into()))?;

            output_pumps.push(tokio::spawn(pump_reader_to_channel(
                stdout,
                handle.clone(),
                channel_id,
                None,
            )));
            output_pumps.push(tokio::spawn(pump_reader_to_channel(
                stderr,
                handle.clone(),
                channel_id,
                Some(1),
            )));
            tokio::spawn(pump_input_to_stdin(stdin, input_rx));

            (child, None)
        };

        let pid = child.id().map(|id| Pid::from_raw(id as i32));

        tracing::info!(
            user = %self.user,
            channel = ?channel_id,
            shell = %self.shell.display(),
            command = %command,
            pty = pty_requested,
            pid = ?pid,
            "session started"
        );

        *state = State::Running {
            pid,
            pty,
            input: Some(input_tx),
        };
        drop(state);

        tokio::spawn(reap(ReaperArgs {
            child,
            pid,
            output_pumps,
            state: Arc::clone(&self.state),
            exit_sent: Arc::clone(&self.exit_sent),
            shutdown: self.shutdown.clone(),
            handle,
            channel_id,
        }));

        Ok(())
    }
}

/// Everything the reaper task owns after start.
struct ReaperArgs {
    child: Child,
    pid: Option<Pid>,
    output_pumps: Vec<JoinHandle<()>>,
    state: Arc<Mutex<State>>,
    exit_sent: Arc<AtomicBool>,
    shutdown: CancellationToken,
    handle: Handle,
    channel_id: ChannelId,
}

/// Wait for the child, drain output, and report `exit-status` exactly
/// once. Server shutdown delivers SIGTERM to the child and then waits
/// for the normal exit path.
async fn reap(args: ReaperArgs) {
    let ReaperArgs {
        mut child,
        pid,
        output_pumps,
        state,
        exit_sent,
        shutdown,
        handle,
        channel_id,
    } = args;

    // Relay server shutdown into a SIGTERM without touching the child
    // handle; the wait below still observes the resulting exit.
    let terminator = tokio::spawn(async move {
        shutdown.cancelled().await;
        if let Some(pid) = pid {
            let _ = kill(pid, Signal::SIGTERM);
        }
    });

    let wait_result = child.wait().await;
    terminator.abort();

    // Let pending output reach the channel before the exit report, but
    // never indefinitely.
    for mut pump in output_pumps {
        if tokio::time::timeout(OUTPUT_DRAIN_LIMIT, &mut pump)
            .await
            .is_err()
        {
            pump.abort();
        }
    }

    let status = match &wait_result {
        Ok(status) => exit_status_code(status),
        Err(err) => {
            tracing::warn!(channel = ?channel_id, error = %err, "wait for child failed");
            255
        }
    };

    if exit_sent
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        tracing::debug!(channel = ?channel_id, status = status, "child exited");
        let _ = handle.exit_status_request(channel_id, status).await;
        let _ = handle.eof(channel_id).await;
        let _ = handle.close(channel_id).await;
    }

    // Dropping the Running state releases the PTY master and input
    // queue; the pump tasks drop their own handles as they finish.
    let mut state = state.lock().await;
    *state = State::Exited;
}

/// Child environment: the server's own environment with the session
/// identity layered on top (later entries win on duplicate keys).
fn seed_env(user: &str, shell: &Path) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    env.push(("USER".to_string(), user.to_string()));
    env.push(("LOGNAME".to_string(), user.to_string()));
    env.push(("HOME".to_string(), "/".to_string()));
    env.push(("SHELL".to_string(), shell.to_string_lossy().into_owned()));
    env
}

/// `shell` runs the login shell bare; `exec` goes through `-c`.
fn shell_args(command: &str) -> Vec<&str> {
    if command.is_empty() {
        Vec::new()
    } else {
        vec!["-c", command]
    }
}

fn clamp_dim(dim: u32) -> u16 {
    dim.min(u16::MAX as u32) as u16
}

/// Map a child's termination to the wire exit status: the exit code
/// when the runtime reports one, 255 for signal death or anything else
/// abnormal.
fn exit_status_code(status: &std::process::ExitStatus) -> u32 {
    match status.code() {
        Some(code) if code >= 0 => code as u32,
        _ => 255,
    }
}

/// Spawn the child with all three stdio streams on the PTY slave, in a
/// fresh session with the slave as controlling terminal.
fn spawn_on_pty(cmd: &mut Command, pty: &PtyMaster) -> Result<Child, SessionError> {
    let slave = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(pty.slave_path())
        .map_err(|e| SessionError::PtyAllocFailed(format!("open slave PTY: {e}")))?;

    let slave_fd = slave.as_raw_fd();

    // Each Stdio takes ownership of its fd, so the slave is duplicated
    // once per stream.
    // SAFETY: slave_fd stays valid while `slave` is in scope.
    let stdin_fd = unsafe { nix::libc::dup(slave_fd) };
    let stdout_fd = unsafe { nix::libc::dup(slave_fd) };
    let stderr_fd = unsafe { nix::libc::dup(slave_fd) };

    if stdin_fd < 0 || stdout_fd < 0 || stderr_fd < 0 {
        // SAFETY: closing only the dups that succeeded.
        unsafe {
            if stdin_fd >= 0 {
                nix::libc::close(stdin_fd);
            }
            if stdout_fd >= 0 {
                nix::libc::close(stdout_fd);
            }
            if stderr_fd >= 0 {
                nix::libc::close(stderr_fd);
            }
        }
        return Err(SessionError::PtyAllocFailed(
            "dup slave PTY file descriptor".into(),
        ));
    }

    drop(slave);

    // SAFETY: each fd came from dup() above and is uniquely owned.
    unsafe {
        cmd.stdin(Stdio::from_raw_fd(stdin_fd));
        cmd.stdout(Stdio::from_raw_fd(stdout_fd));
        cmd.stderr(Stdio::from_raw_fd(stderr_fd));
    }

    // SAFETY: standard POSIX setup for giving the child a fresh session
    // with the slave as its controlling terminal.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::other(e.to_string()))?;

            // TIOCSCTTY with arg 0: do not steal the terminal from
            // another session.
            if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as nix::libc::c_ulong, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }

            Ok(())
        });
    }

    cmd.spawn().map_err(SessionError::SpawnFailed)
}

async fn pump_pty_to_channel(pty: Arc<PtyMaster>, handle: Handle, channel_id: ChannelId) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match pty.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if handle
                    .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            // EIO from the master means the slave side is gone, which
            // is the normal end of a PTY session.
            Err(_) => break,
        }
    }
}

async fn pump_input_to_pty(pty: Arc<PtyMaster>, mut input: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        if pty.write_all(&data).await.is_err() {
            break;
        }
    }
}

async fn pump_reader_to_channel(
    mut reader: impl AsyncRead + Unpin,
    handle: Handle,
    channel_id: ChannelId,
    extended: Option<u32>,
) {
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = CryptoVec::from_slice(&buf[..n]);
                let sent = match extended {
                    Some(stream) => handle.extended_data(channel_id, stream, data).await,
                    None => handle.data(channel_id, data).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn pump_input_to_stdin(
    mut stdin: tokio::process::ChildStdin,
    mut input: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(data) = input.recv().await {
        if stdin.write_all(&data).await.is_err() {
            break;
        }
    }
    // Dropping stdin closes the pipe write end once the channel EOFs.
}

/// Test helpers for driving the phase machine without a live russh
/// connection.
#[cfg(test)]
impl Session {
    async fn force_running(&self) {
        let mut state = self.state.lock().await;
        *state = State::Running {
            pid: None,
            pty: None,
            input: None,
        };
    }

    async fn force_exited(&self) {
        let mut state = self.state.lock().await;
        *state = State::Exited;
    }

    async fn collected_env(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        match &*state {
            State::Collecting { env, .. } => env.clone(),
            _ => Vec::new(),
        }
    }

    async fn collected_size(&self) -> (bool, u16, u16) {
        let state = self.state.lock().await;
        match &*state {
            State::Collecting {
                pty_requested,
                cols,
                rows,
                ..
            } => (*pty_requested, *cols, *rows),
            _ => (false, 0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn session() -> Session {
        Session::new(
            "demo".to_string(),
            PathBuf::from("/bin/sh"),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_env_appended_before_start() {
        let session = session();
        assert!(session.env_request("LANG", "C.UTF-8").await);

        let env = session.collected_env().await;
        assert_eq!(
            env.last(),
            Some(&("LANG".to_string(), "C.UTF-8".to_string()))
        );
    }

    #[tokio::test]
    async fn test_env_with_empty_key_rejected() {
        let session = session();
        assert!(!session.env_request("", "value").await);
    }

    #[tokio::test]
    async fn test_env_after_start_rejected() {
        let session = session();
        session.force_running().await;
        assert!(!session.env_request("LANG", "C").await);
    }

    #[tokio::test]
    async fn test_pty_request_records_term_and_size() {
        let session = session();
        assert!(session.pty_request("xterm", 80, 24).await);

        let (pty_requested, cols, rows) = session.collected_size().await;
        assert!(pty_requested);
        assert_eq!((cols, rows), (80, 24));

        let env = session.collected_env().await;
        assert_eq!(env.last(), Some(&("TERM".to_string(), "xterm".to_string())));
    }

    #[tokio::test]
    async fn test_pty_request_empty_term_adds_no_env() {
        let session = session();
        let before = session.collected_env().await.len();
        assert!(session.pty_request("", 0, 0).await);
        assert_eq!(session.collected_env().await.len(), before);
    }

    #[tokio::test]
    async fn test_pty_request_after_start_rejected() {
        let session = session();
        session.force_running().await;
        assert!(!session.pty_request("xterm", 80, 24).await);
    }

    #[tokio::test]
    async fn test_window_change_before_start_updates_size() {
        let session = session();
        assert!(session.window_change(132, 43).await);
        let (_, cols, rows) = session.collected_size().await;
        assert_eq!((cols, rows), (132, 43));
    }

    #[tokio::test]
    async fn test_window_change_without_pty_still_acknowledged() {
        let session = session();
        session.force_running().await;
        assert!(session.window_change(132, 43).await);
    }

    #[tokio::test]
    async fn test_requests_after_exit_rejected() {
        let session = session();
        session.force_exited().await;
        assert!(!session.window_change(80, 24).await);
        assert!(!session.env_request("K", "V").await);
        assert!(!session.pty_request("xterm", 80, 24).await);
        assert!(!session.signal(&Sig::INT).await);
    }

    #[tokio::test]
    async fn test_signal_before_start_acknowledged() {
        let session = session();
        assert!(session.signal(&Sig::INT).await);
        assert!(session.signal(&Sig::Custom("NOSUCH".into())).await);
    }

    #[tokio::test]
    async fn test_seed_env_overrides() {
        let env = seed_env("demo", Path::new("/bin/dash"));

        // Later entries win; collapse the way Command::env does.
        let resolved: std::collections::HashMap<_, _> = env.into_iter().collect();
        assert_eq!(resolved.get("USER").map(String::as_str), Some("demo"));
        assert_eq!(resolved.get("LOGNAME").map(String::as_str), Some("demo"));
        assert_eq!(resolved.get("HOME").map(String::as_str), Some("/"));
        assert_eq!(resolved.get("SHELL").map(String::as_str), Some("/bin/dash"));
    }

    #[test]
    fn test_shell_args() {
        assert!(shell_args("").is_empty());
        assert_eq!(shell_args("echo hi"), vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_clamp_dim() {
        assert_eq!(clamp_dim(0), 0);
        assert_eq!(clamp_dim(80), 80);
        assert_eq!(clamp_dim(70_000), u16::MAX);
    }

    #[test]
    fn test_exit_status_code_normal_exit() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(exit_status_code(&status), 0);

        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_status_code(&status), 3);
    }

    #[test]
    fn test_exit_status_code_signal_death() {
        // Raw wait status 9 = killed by SIGKILL, no exit code.
        let status = ExitStatus::from_raw(9);
        assert_eq!(status.code(), None);
        assert_eq!(exit_status_code(&status), 255);
    }
}
