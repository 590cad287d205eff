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

//! tinyssh binary: load the configuration, install signal handlers, and
//! run the server until shutdown.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tinyssh::{Config, TinysshServer};

/// A tiny SSH server for embedded administration and lab use
#[derive(Parser, Debug)]
#[command(name = "tinyssh")]
#[command(version)]
#[command(about = "A tiny SSH server for embedded administration and lab use", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "tinyssh.yaml")]
    config: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;

    let server = TinysshServer::new(config)?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    server.run(shutdown).await?;

    tracing::info!("server stopped");
    Ok(())
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::new("tinyssh=warn"),
        1 => EnvFilter::new("tinyssh=info"),
        2 => EnvFilter::new("tinyssh=debug"),
        _ => EnvFilter::new("tinyssh=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// SIGINT and SIGTERM cancel the shutdown token; the server then closes
/// the listener, terminates session children, and joins connections.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    tracing::info!("received SIGINT");
                }
            }
            _ = terminate.recv() => {
                tracing::info!("received SIGTERM");
            }
        }
        shutdown.cancel();
    });

    Ok(())
}
