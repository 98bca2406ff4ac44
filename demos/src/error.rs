// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use callway::{CallError, Code, ServerError, Status};

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum DemoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("tracing error: {0}")]
    Tracing(#[from] callway_tracing::TracingError),

    #[error("call error: {0}")]
    Call(#[from] CallError),

    #[error("call failed: {0}")]
    Status(#[from] Status),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{name}: wanted {wanted}, got {got}")]
    Unexpected {
        name: String,
        wanted: Code,
        got: Code,
    },
}
