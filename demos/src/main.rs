// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tracing::{debug, error, info};

mod args;
mod cancellation;
mod config;
mod deadline;
mod echo;
mod error;
mod interceptors;

use args::Demo;
use config::DemoConfig;
use error::DemoError;

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    // Parse CLI
    let args = args::Args::parse();

    let mut config = match args.config() {
        Some(file) => DemoConfig::load(file)?,
        None => DemoConfig::default(),
    };
    if let Some(level) = args.log_level() {
        config.tracing = config.tracing.with_log_level(level);
    }

    config.tracing.setup_tracing_subscriber()?;
    debug!(?config, "configuration");

    let demo = args.demo();
    info!(?demo, "running demo");
    let result = match demo {
        Demo::Cancellation => cancellation::run(&config).await,
        Demo::Deadline => deadline::run(&config).await,
        Demo::Interceptors => interceptors::run(&config).await,
    };

    match &result {
        Ok(()) => info!(?demo, "demo completed"),
        Err(e) => error!(?demo, error = %e, "demo failed"),
    }
    result
}
