// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The echo service shared by the demos, served over the memory transport.

use callway::transport::memory;
use callway::{CallError, Channel, ChannelConfig, MethodDescriptor, Server, ServerError};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::DemoError;

pub const UNARY_ECHO: &str = "/grpc.examples.echo.Echo/UnaryEcho";
pub const BIDI_ECHO: &str = "/grpc.examples.echo.Echo/BidirectionalStreamingEcho";

const BACKLOG: usize = 16;

pub fn unary_echo() -> Result<MethodDescriptor, CallError> {
    MethodDescriptor::unary(UNARY_ECHO)
}

pub fn bidi_echo() -> Result<MethodDescriptor, CallError> {
    MethodDescriptor::bidi_streaming(BIDI_ECHO)
}

/// A server accepting calls on a memory endpoint, and a channel to it.
pub struct Running {
    pub channel: Channel,
    server: Server,
    serving: JoinHandle<Result<(), ServerError>>,
}

/// Start the server returned by `build`. `build` receives a channel to the
/// server itself, for handlers that call back into the service.
pub fn start(config: ChannelConfig, build: impl FnOnce(Channel) -> Server) -> Running {
    let (connector, mut incoming) = memory::endpoint(BACKLOG);
    let channel = Channel::with_config(connector, config);
    let server = build(channel.clone());

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(&mut incoming).await })
    };
    info!("echo server listening on the memory transport");

    Running {
        channel,
        server,
        serving,
    }
}

impl Running {
    pub async fn stop(self) -> Result<(), DemoError> {
        self.server.shutdown().await;
        self.serving.await??;
        Ok(())
    }
}
