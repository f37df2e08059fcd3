// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use compute_server::backends::build_collaborators;
use compute_server::manager::ComputeManager;
use compute_server::server::{self, ServerContext};
use dropshot::{ConfigDropshot, HandlerTaskMode, HttpServerStarter};
use slog::{info, o};

/// Threads to spawn for tokio runtime handling the API (dropshot, etc)
const API_RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow::anyhow!("Invalid log level"))
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// An HTTP server managing the instances on one compute host
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the compute server.
    Run {
        /// Path to the server's TOML configuration file
        #[clap(action)]
        config: PathBuf,

        #[clap(name = "COMPUTE_IP:PORT", action)]
        compute_addr: SocketAddr,

        /// Logging level for the server
        #[clap(long, default_value_t = slog::Level::Info, value_parser = parse_log_level)]
        log_level: slog::Level,
    },
}

pub fn run_openapi() -> Result<(), String> {
    server::api()
        .openapi("Compute Server API", semver::Version::new(0, 0, 1))
        .description(
            "API for managing the lifecycle of instances on a compute host.",
        )
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

fn run_server(
    config: compute_server_config::Config,
    config_dropshot: ConfigDropshot,
    log: slog::Logger,
) -> anyhow::Result<()> {
    let collaborators = build_collaborators(&config, &log)
        .context("failed to set up compute collaborators")?;
    let manager = Arc::new(ComputeManager::new(
        &config,
        collaborators,
        log.new(o!("component" => "manager")),
    ));
    let context = ServerContext::new(manager, log.new(o!()));

    let api_runtime = {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.worker_threads(API_RT_THREADS).thread_name("tokio-rt-api");
        oxide_tokio_rt::build(&mut builder)?
    };
    let _guard = api_runtime.enter();

    info!(log, "Starting server...";
          "host" => &config.host,
          "address" => %config_dropshot.bind_address);

    let server = HttpServerStarter::new(
        &config_dropshot,
        server::api(),
        Arc::new(context),
        &log,
    )
    .map_err(|error| anyhow!("Failed to start server: {}", error))?
    .start();

    api_runtime
        .block_on(server)
        .map_err(|e| anyhow!("Server exited with an error: {}", e))
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("compute-server", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let (dtrace_drain, probe_reg) = slog_dtrace::Dtrace::new();

    let filtered_main = slog::LevelFilter::new(main_drain, level);

    let log = slog::Logger::root(
        slog::Duplicate::new(filtered_main.fuse(), dtrace_drain.fuse()).fuse(),
        slog::o!(),
    );

    if let slog_dtrace::ProbeRegistration::Failed(err) = probe_reg {
        slog::error!(&log, "Error registering slog-dtrace probes: {:?}", err);
    }

    log
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { config, compute_addr, log_level } => {
            let config = compute_server_config::parse(&config).with_context(
                || format!("failed to read config {}", config.display()),
            )?;

            let config_dropshot = ConfigDropshot {
                bind_address: compute_addr,
                default_request_body_max_bytes: 1024 * 1024,
                default_handler_task_mode: HandlerTaskMode::Detached,
                log_headers: vec![],
            };

            let log = build_logger(log_level);
            run_server(config, config_dropshot, log)
        }
    }
}
