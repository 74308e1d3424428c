// SPDX-License-Identifier: MIT
// publishd: sequential publish daemon
//
// - Queues publish requests and runs the external export tool for one at a time.
// - Follows the export tool's log file and keeps its most recent lines.
// - Exposes both through a local control socket.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;

use clap::Parser;
use log::info;

pub mod collaborators;
pub mod config;
pub mod control;
pub mod job_engine;
pub mod service;
pub mod tailer;

use crate::config::{Config, ShutdownPolicy};
use crate::service::Service;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the JSON configuration file
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    debug: bool,

    /// What happens to a running export on shutdown (overrides the config file)
    #[arg(long, value_enum)]
    shutdown_policy: Option<ShutdownPolicy>,

    /// Send one request (JSON encoded) to the running daemon and print its response.
    #[arg(long, value_name = "JSON")]
    request: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut config = Config::load(&args.config)?;

    if let Some(request) = &args.request {
        let response = control::server::send_request(&config.control.socket_path, request)?;
        println!("{response}");
        return Ok(());
    }

    if let Some(policy) = args.shutdown_policy {
        config.publisher.shutdown_policy = policy;
    }
    info!(
        "Using shutdown policy {:?}",
        config.publisher.shutdown_policy
    );

    Service::new(config).run()
}
