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

//! SSH server core.
//!
//! [`TinysshServer`] owns the host key, the credential set, and the
//! accept loop. Each accepted socket runs the SSH handshake and
//! connection protocol via `russh::server::run_stream` with a
//! [`handler::ConnectionHandler`]; session channels are bridged to a
//! local shell child by [`session::Session`].
//!
//! Shutdown is a cancellation cascade: cancelling the token passed to
//! [`TinysshServer::run`] stops the accept loop, delivers SIGTERM to
//! every session child, and the server returns once all in-flight
//! connections have finished.

pub mod auth;
pub mod handler;
pub mod hostkey;
pub mod pty;
pub mod session;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

pub use self::auth::CredentialSet;
pub use self::handler::ConnectionHandler;
pub use self::session::Session;

/// Identification banner sent to every client.
const SERVER_ID: &str = "SSH-2.0-tinyssh";

/// Pause before retrying after a transient accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A configured SSH server, ready to accept connections.
pub struct TinysshServer {
    config: Config,
    credentials: Arc<CredentialSet>,
    ssh_config: Arc<russh::server::Config>,
}

impl std::fmt::Debug for TinysshServer {
    // Credentials are deliberately omitted to avoid leaking secrets.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TinysshServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TinysshServer {
    /// Build the server: load (or create) the host key and index the
    /// credentials. Fails fast on any host-key problem.
    pub fn new(config: Config) -> Result<Self> {
        let host_key = hostkey::load_or_create(&config.host_key_path)
            .with_context(|| format!("host key at {}", config.host_key_path.display()))?;
        tracing::info!(path = %config.host_key_path.display(), "host key ready");

        let credentials = Arc::new(CredentialSet::new(&config.users));
        tracing::debug!(users = credentials.user_count(), "credentials loaded");

        let ssh_config = russh::server::Config {
            server_id: russh::SshId::Standard(SERVER_ID.to_string()),
            keys: vec![host_key],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        };

        Ok(Self {
            config,
            credentials,
            ssh_config: Arc::new(ssh_config),
        })
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = normalize_listen_address(&self.config.listen_address);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("listen {}", self.config.listen_address))?;

        self.run_on_listener(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    ///
    /// Transient accept errors back off 100 ms and retry; a fatal
    /// accept error tears the server down. On shutdown the listener is
    /// dropped first, then in-flight connections are joined.
    pub async fn run_on_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "listening");
        }

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_connection(&mut connections, stream, peer, &shutdown);
                    }
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!(error = %err, "temporary accept error");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(err) => {
                        return Err(err).context("accept connection");
                    }
                },
            }

            // Opportunistically reap finished connections so the set
            // does not grow with connection churn.
            while connections.try_join_next().is_some() {}
        }

        drop(listener);
        tracing::info!("listener closed, waiting for connections to finish");
        while connections.join_next().await.is_some() {}

        Ok(())
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        peer: std::net::SocketAddr,
        shutdown: &CancellationToken,
    ) {
        // Server shutdown cascades into every connection; a connection
        // that ends cancels only its own children.
        let conn_shutdown = shutdown.child_token();
        let handler = ConnectionHandler::new(
            Arc::clone(&self.credentials),
            self.config.shell.clone(),
            Some(peer),
            conn_shutdown.clone(),
        );
        let ssh_config = Arc::clone(&self.ssh_config);

        connections.spawn(async move {
            match russh::server::run_stream(ssh_config, stream, handler).await {
                Ok(connection) => {
                    if let Err(err) = connection.await {
                        tracing::warn!(remote = %peer, error = %err, "connection ended");
                    }
                }
                Err(err) => {
                    tracing::warn!(remote = %peer, error = %err, "handshake failed");
                }
            }
            conn_shutdown.cancel();
        });
    }
}

/// A bare `:port` bind string means "all interfaces".
fn normalize_listen_address(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

/// Errors worth retrying the accept loop on, as opposed to a dead
/// listener.
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::User;
    use std::io;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            listen_address: "127.0.0.1:0".to_string(),
            listen_port: 0,
            host_key_path: dir.join("host_key"),
            shell: PathBuf::from("/bin/sh"),
            users: vec![User {
                username: "demo".into(),
                password: "pw".into(),
            }],
        }
    }

    #[test]
    fn test_normalize_listen_address() {
        assert_eq!(normalize_listen_address(":2222"), "0.0.0.0:2222");
        assert_eq!(normalize_listen_address("127.0.0.1:22"), "127.0.0.1:22");
        assert_eq!(normalize_listen_address("[::1]:22"), "[::1]:22");
    }

    #[test]
    fn test_transient_accept_error_classification() {
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "aborted in backlog"
        )));
        assert!(is_transient_accept_error(&io::Error::new(
            io::ErrorKind::Interrupted,
            "eintr"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::InvalidInput,
            "bad listener"
        )));
        assert!(!is_transient_accept_error(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let server = TinysshServer::new(test_config(dir.path())).unwrap();

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        server.run(shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_on_listener_reports_no_error_on_clean_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = TinysshServer::new(test_config(dir.path())).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        server.run_on_listener(listener, shutdown).await.unwrap();
    }
}

