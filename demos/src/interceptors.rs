// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! An echo server behind two interceptors: the first rejects calls without
//! the right authorization token, the second logs every message in and out.

use callway::{
    CallInfo, CallOptions, ClientEvent, Code, Interception, Listener, Metadata, Next, Responder,
    Server, ServerCall, ServerEvent, Status,
};
use tracing::info;

use crate::config::DemoConfig;
use crate::echo;
use crate::error::DemoError;

const AUTHORIZATION: &str = "authorization";
const SECRET_TOKEN: &str = "some-secret-token";

fn valid_authorization(metadata: &Metadata) -> bool {
    metadata.get(AUTHORIZATION) == Some(SECRET_TOKEN)
}

fn auth_interceptor(_: &CallInfo) -> Interception {
    Interception::with_listener(
        Listener::builder()
            .on_receive_metadata(|metadata: Metadata, next: Next<Metadata>| async move {
                if valid_authorization(&metadata) {
                    next.forward(metadata).await
                } else {
                    next.terminate(Status::unauthenticated("Auth metadata not correct"))
                        .await
                }
            })
            .build(),
    )
}

fn logging_interceptor(call: &CallInfo) -> Interception {
    let call_id = call.call_id;
    Interception::new(
        Listener::builder()
            .on_receive_message(move |message, next| {
                info!(
                    call_id,
                    message = %String::from_utf8_lossy(&message),
                    "receive a message"
                );
                next.forward(message)
            })
            .build(),
        Responder::builder()
            .on_send_message(move |message, next| {
                info!(
                    call_id,
                    message = %String::from_utf8_lossy(&message),
                    "send a message"
                );
                next.forward(message)
            })
            .build(),
    )
}

/// Serves both echo methods: every message is sent back.
async fn echo_handler(mut call: ServerCall) -> Result<(), Status> {
    let kind = call.method().kind();
    while let Some(event) = call.next_event().await {
        match event {
            ServerEvent::Data(message) => {
                let text = String::from_utf8_lossy(&message).into_owned();
                info!(kind = kind.as_str(), "echoing message {text}");
                call.write(message).await?;
            }
            ServerEvent::End => call.end().await?,
            ServerEvent::Cancelled(_) | ServerEvent::Error(_) => break,
        }
    }
    Ok(())
}

fn authorized() -> CallOptions {
    let mut metadata = Metadata::new();
    metadata.insert(AUTHORIZATION, SECRET_TOKEN);
    CallOptions::new().with_metadata(metadata)
}

fn expect(name: &str, wanted: Code, got: Code) -> Result<(), DemoError> {
    info!("[{name}] wanted = {wanted} got = {got}");
    if wanted != got {
        return Err(DemoError::Unexpected {
            name: name.to_string(),
            wanted,
            got,
        });
    }
    Ok(())
}

pub async fn run(config: &DemoConfig) -> Result<(), DemoError> {
    let server_config = config.server.clone();
    let running = echo::start(config.channel.clone(), |_| {
        Server::builder()
            .config(server_config)
            .interceptor(auth_interceptor)
            .interceptor(logging_interceptor)
            .build(echo_handler)
    });
    let result = exercise(&running.channel).await;
    running.stop().await?;
    result
}

async fn exercise(channel: &callway::Channel) -> Result<(), DemoError> {
    let unary = echo::unary_echo()?;
    let bidi = echo::bidi_echo()?;

    let response = channel.unary(&unary, "hello", authorized()).await?;
    info!("unary response \"{}\"", String::from_utf8_lossy(&response));

    let rejected = channel.unary(&unary, "hello", CallOptions::new()).await;
    let got = rejected.err().map_or(Code::Ok, |status| status.code());
    expect("unauthenticated unary", Code::Unauthenticated, got)?;

    let mut call = channel.call(&bidi, authorized())?;
    for i in 1..=3 {
        call.write(format!("request {i}"))?;
    }
    call.end()?;

    let mut got = Code::Unknown;
    while let Some(event) = call.next_event().await {
        match event {
            ClientEvent::Data(message) => {
                info!("streaming response \"{}\"", String::from_utf8_lossy(&message))
            }
            ClientEvent::Status(status) => got = status.code(),
            ClientEvent::Metadata(_) | ClientEvent::Error(_) => {}
        }
    }
    expect("authorized stream", Code::Ok, got)
}
