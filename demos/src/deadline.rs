// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Calls against a one second deadline, some of them propagated through
//! child calls the server makes to itself.
//!
//! The server echoes its requests. A request containing "delay" is answered
//! late. A request starting with the propagation prefix is forwarded, prefix
//! stripped, to the same method on behalf of the incoming call after a short
//! pause, so every hop spends part of the same budget.

use std::time::Duration;

use callway::{
    CallOptions, Channel, ClientEvent, Code, Message, MethodDescriptor, Server, ServerCall,
    ServerEvent, Status,
};
use tracing::{debug, info, warn};

use crate::config::DemoConfig;
use crate::echo;
use crate::error::DemoError;

const PROPAGATE_PREFIX: &str = "[propagate me]";

const CALL_TIMEOUT: Duration = Duration::from_secs(1);
const DELAY: Duration = Duration::from_millis(1500);
const HOP_DELAY: Duration = Duration::from_millis(800);

async fn echo_with_delay(mut call: ServerCall, channel: Channel) -> Result<(), Status> {
    while let Some(event) = call.next_event().await {
        match event {
            ServerEvent::Data(request) => {
                let response = reply(&call, &channel, request).await?;
                call.write(response).await?;
            }
            ServerEvent::End => call.end().await?,
            ServerEvent::Cancelled(origin) => debug!(%origin, "request cancelled"),
            ServerEvent::Error(e) => warn!(error = %e, "transport error"),
        }
    }
    Ok(())
}

async fn reply(call: &ServerCall, channel: &Channel, request: Message) -> Result<Message, Status> {
    let text = String::from_utf8_lossy(&request).into_owned();

    if let Some(rest) = text.strip_prefix(PROPAGATE_PREFIX) {
        pause(call, HOP_DELAY).await?;
        info!(request = rest, "forwarding request");
        let options = CallOptions::new().with_parent(call.context());
        return forward(channel, call.method(), rest.to_string(), options).await;
    }

    if text.contains("delay") {
        pause(call, DELAY).await?;
    }
    Ok(request)
}

async fn pause(call: &ServerCall, duration: Duration) -> Result<(), Status> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = call.cancelled() => Err(Status::cancelled("request cancelled")),
    }
}

/// One request, one response, on any kind of method.
async fn forward(
    channel: &Channel,
    method: &MethodDescriptor,
    request: String,
    options: CallOptions,
) -> Result<Message, Status> {
    let mut call = channel.call(method, options)?;
    call.write(request)?;
    call.end()?;

    let mut response = None;
    while let Some(event) = call.next_event().await {
        match event {
            ClientEvent::Data(message) => response = response.or(Some(message)),
            ClientEvent::Status(status) if status.is_ok() => {}
            ClientEvent::Status(status) => return Err(status),
            ClientEvent::Metadata(_) | ClientEvent::Error(_) => {}
        }
    }
    response.ok_or_else(|| Status::internal("no response"))
}

async fn unary_call(
    channel: &Channel,
    request_id: usize,
    message: &str,
    wanted: Code,
) -> Result<(), DemoError> {
    let options = CallOptions::new().with_timeout(CALL_TIMEOUT);
    let got = match channel
        .unary(&echo::unary_echo()?, message.to_string(), options)
        .await
    {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };
    report(request_id, wanted, got)
}

async fn streaming_call(
    channel: &Channel,
    request_id: usize,
    message: &str,
    wanted: Code,
) -> Result<(), DemoError> {
    let options = CallOptions::new().with_timeout(CALL_TIMEOUT);
    let mut call = channel.call(&echo::bidi_echo()?, options)?;
    // write failures show up in the final status
    let _ = call.write(message.to_string());
    let _ = call.end();

    let mut got = Code::Unknown;
    while let Some(event) = call.next_event().await {
        // responses are consumed and dropped
        if let ClientEvent::Status(status) = event {
            got = status.code();
        }
    }
    report(request_id, wanted, got)
}

fn report(request_id: usize, wanted: Code, got: Code) -> Result<(), DemoError> {
    info!("[{request_id}] wanted = {wanted} got = {got}");
    if wanted != got {
        return Err(DemoError::Unexpected {
            name: format!("deadline request {request_id}"),
            wanted,
            got,
        });
    }
    Ok(())
}

pub async fn run(config: &DemoConfig) -> Result<(), DemoError> {
    let server_config = config.server.clone();
    let running = echo::start(config.channel.clone(), |channel| {
        Server::builder()
            .config(server_config)
            .build(move |call| echo_with_delay(call, channel.clone()))
    });
    let channel = &running.channel;

    let once = format!("{PROPAGATE_PREFIX}world");
    let twice = format!("{PROPAGATE_PREFIX}{PROPAGATE_PREFIX}world");
    let results = [
        // a successful request
        unary_call(channel, 1, "world", Code::Ok).await,
        // exceeds the deadline
        unary_call(channel, 2, "delay", Code::DeadlineExceeded).await,
        // a successful request with a propagated deadline
        unary_call(channel, 3, &once, Code::Ok).await,
        // exceeds the propagated deadline
        unary_call(channel, 4, &twice, Code::DeadlineExceeded).await,
        // receives a response from the stream
        streaming_call(channel, 5, &once, Code::Ok).await,
        // exceeds the propagated deadline before any response
        streaming_call(channel, 6, &twice, Code::DeadlineExceeded).await,
    ];

    running.stop().await?;
    results.into_iter().collect()
}
