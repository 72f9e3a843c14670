// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{event, Level};

use lfs_gateway::config::Config;
use lfs_gateway::logger::LogFormat;
use lfs_gateway::ServerBuilder;

mod init_tracing;
use init_tracing::setup_tracing;

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    /// YAML configuration file. Environment variables take precedence over
    /// anything it sets.
    #[clap(long = "config", env = "LFS_CONFIG")]
    config: Option<PathBuf>,

    /// The host or address to listen on. Overrides `SERVER_HOST`.
    #[clap(long = "host")]
    host: Option<String>,

    /// The port to bind to. Overrides `SERVER_PORT`.
    #[clap(long = "port")]
    port: Option<u16>,

    /// Logging level to use. `RUST_LOG` directives win when set.
    #[clap(long = "log-level", default_value = "info", env = "LOG_LEVEL")]
    log_level: LevelFilter,

    /// Log line format.
    #[clap(
        long = "log-format",
        value_enum,
        default_value = "text",
        env = "LOG_FORMAT"
    )]
    log_format: LogFormat,

    /// Apply the database schema before serving.
    #[clap(long)]
    migrate: bool,
}

impl Args {
    async fn main(self) -> anyhow::Result<()> {
        let _guard = setup_tracing(self.log_level, self.log_format)?;

        event!(Level::INFO, "Starting server...");

        let mut config = Config::load(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }

        let addr = config.listen_addr()?;

        let builder = ServerBuilder::from_config(&config, self.migrate)
            .await
            .context("failed to initialize server")?;
        builder.check_dependencies().await;

        builder
            .run(addr, shutdown_signal())
            .await
            .context("server failed")?;

        event!(Level::INFO, "server stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            event!(Level::ERROR, error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() {
    let exit_code = if let Err(err) = Args::parse().main().await {
        event!(Level::ERROR, "{:#}", err);
        eprintln!("error: {:#}", err);
        1
    } else {
        0
    };

    std::process::exit(exit_code);
}
