// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    demo: Demo,

    #[arg(short, long, value_name = "FILE", env = "CALLWAY_CONFIG", global = true)]
    config: Option<String>,

    /// Overrides the log level from the configuration file
    #[arg(long, value_name = "LEVEL", env = "CALLWAY_LOG_LEVEL", global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    /// Cancel a bidirectional stream after two echoed messages
    Cancellation,
    /// Unary and streaming calls against a one second deadline
    Deadline,
    /// An echo server behind an auth and a logging interceptor
    Interceptors,
}

impl Args {
    pub fn demo(&self) -> Demo {
        self.demo
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}
