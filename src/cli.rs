/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

mod controller;
mod sdk_server;

use crate::{apis::SdkServerLogLevel, signal::ShutdownRx};

pub use self::{controller::Controller, sdk_server::SdkServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Command-Line Interface for Agones.
#[derive(clap::Parser)]
#[non_exhaustive]
pub struct Cli {
    /// The address to bind for the admin server.
    #[clap(long, env = "AGONES_ADMIN_ADDRESS")]
    pub admin_address: Option<std::net::SocketAddr>,
    /// Whether Agones will report any results to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various Agones commands.
#[derive(Clone, clap::Subcommand)]
pub enum Commands {
    Controller(Controller),
    SdkServer(SdkServer),
}

impl Commands {
    fn log_level(&self) -> SdkServerLogLevel {
        match self {
            Self::Controller(controller) => controller.log_level,
            Self::SdkServer(sdk_server) => sdk_server.log_level,
        }
    }

    async fn run(
        self,
        admin_address: Option<std::net::SocketAddr>,
        shutdown_rx: ShutdownRx,
    ) -> crate::Result<()> {
        match self {
            Self::Controller(controller) => controller.run(admin_address, shutdown_rx).await,
            Self::SdkServer(sdk_server) => sdk_server.run(shutdown_rx).await,
        }
    }
}

impl Cli {
    /// Drives the main agones application lifecycle using the command line
    /// arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(self.command.log_level().level_filter().into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(
            version = &*version,
            commit = option_env!("GIT_COMMIT_HASH").unwrap_or("unknown"),
            "Starting Agones"
        );

        let (_shutdown_tx, mut shutdown_rx) = crate::signal::spawn_handler()?;

        let fut = tryhard::retry_fn({
            let shutdown_rx = shutdown_rx.clone();
            let admin_address = self.admin_address;
            move || {
                let command = self.command.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { command.run(admin_address, shutdown_rx).await })
            }
        })
        .retries(3)
        .on_retry(|_, _, error| {
            let error = error.to_string();
            async move {
                tracing::warn!(%error, "error would have caused fatal crash");
            }
        });

        tokio::select! {
            result = fut => result?,
            _ = shutdown_rx.changed() => Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_controller() {
        let cli = Cli::try_parse_from([
            "agones",
            "--quiet",
            "controller",
            "--min-port",
            "7100",
            "--max-port",
            "7200",
            "--log-level",
            "Debug",
            "--feature-gates",
            "PassthroughPortPolicy=true",
        ])
        .unwrap();

        assert!(cli.quiet);
        let Commands::Controller(controller) = cli.command else {
            panic!("expected the controller command");
        };
        assert_eq!(7100, controller.min_port);
        assert_eq!(7200, controller.max_port);
        assert_eq!(SdkServerLogLevel::Debug, controller.log_level);
        assert_eq!(64, controller.num_workers);
    }

    #[test]
    fn parse_sdk_server() {
        let cli = Cli::try_parse_from([
            "agones",
            "sdk-server",
            "--local",
            "--grpc-port",
            "9000",
            "--timeout",
            "30",
        ])
        .unwrap();

        let Commands::SdkServer(sdk_server) = cli.command else {
            panic!("expected the sdk-server command");
        };
        assert!(sdk_server.local);
        assert_eq!(9000, sdk_server.grpc_port);
        assert_eq!(9358, sdk_server.http_port);
        assert_eq!(30, sdk_server.timeout);
        assert_eq!(SdkServerLogLevel::Info, sdk_server.log_level);
    }

    #[test]
    fn sdk_server_default_ports() {
        let cli = Cli::try_parse_from(["agones", "sdk-server", "--local"]).unwrap();

        let Commands::SdkServer(sdk_server) = cli.command else {
            panic!("expected the sdk-server command");
        };
        assert_eq!(59357, sdk_server.grpc_port);
        assert_eq!(9358, sdk_server.http_port);
        assert_eq!(8080, sdk_server.health_port);
    }
}
