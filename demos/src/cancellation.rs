// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The client cancels a bidirectional stream once two messages came back.

use callway::{CallOptions, ClientEvent, Code, Server, ServerCall, ServerEvent, Status};
use tracing::info;

use crate::config::DemoConfig;
use crate::echo::{self, Running};
use crate::error::DemoError;

const EXPECTED_MESSAGES: usize = 2;

async fn bidirectional_streaming_echo(mut call: ServerCall) -> Result<(), Status> {
    // a cancelled call reports either end or cancelled, never both
    while let Some(event) = call.next_event().await {
        match event {
            ServerEvent::Data(message) => {
                info!(message = %String::from_utf8_lossy(&message), "echoing message");
                call.write(message).await?;
            }
            ServerEvent::End => {
                info!("server received end event");
                call.end().await?;
            }
            ServerEvent::Cancelled(origin) => {
                info!(%origin, "server received cancelled event");
            }
            ServerEvent::Error(e) => info!(error = %e, "server received error"),
        }
    }
    Ok(())
}

pub async fn run(config: &DemoConfig) -> Result<(), DemoError> {
    let server_config = config.server.clone();
    let running = echo::start(config.channel.clone(), |_| {
        Server::builder()
            .config(server_config)
            .build(bidirectional_streaming_echo)
    });

    let status = cancel_after_echoes(&running).await;
    running.stop().await?;

    let status = status?;
    if status.code() != Code::Cancelled {
        return Err(DemoError::Unexpected {
            name: "cancellation".to_string(),
            wanted: Code::Cancelled,
            got: status.code(),
        });
    }
    Ok(())
}

async fn cancel_after_echoes(running: &Running) -> Result<Status, DemoError> {
    let mut call = running
        .channel
        .call(&echo::bidi_echo()?, CallOptions::new())?;

    for message in ["hello", "world"] {
        info!("sending message \"{message}\"");
        call.write(message)?;
    }

    let mut received = 0;
    let mut status = None;
    while let Some(event) = call.next_event().await {
        match event {
            ClientEvent::Data(message) => {
                info!("received message \"{}\"", String::from_utf8_lossy(&message));
                received += 1;
                if received >= EXPECTED_MESSAGES {
                    info!("cancelling call");
                    call.cancel();
                }
            }
            ClientEvent::Status(s) => {
                info!("received call status with code {}", s.code());
                status = Some(s);
            }
            ClientEvent::Error(e) => info!("received error {e}"),
            ClientEvent::Metadata(_) => {}
        }
    }

    Ok(status.unwrap_or_else(|| Status::internal("call ended without a status")))
}
