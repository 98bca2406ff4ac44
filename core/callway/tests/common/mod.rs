// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::time::Duration;

use callway::transport::memory;
use callway::transport::RawCall;
use callway::{Channel, ClientCall, ClientEvent, Message, MethodDescriptor, Server, Status};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const UNARY_ECHO: &str = "/grpc.examples.echo.Echo/UnaryEcho";
pub const BIDI_ECHO: &str = "/grpc.examples.echo.Echo/BidirectionalStreamingEcho";

pub fn unary_echo() -> MethodDescriptor {
    MethodDescriptor::unary(UNARY_ECHO).unwrap()
}

pub fn bidi_echo() -> MethodDescriptor {
    MethodDescriptor::bidi_streaming(BIDI_ECHO).unwrap()
}

/// A memory endpoint: the channel side and the server's incoming calls.
pub fn endpoint() -> (Channel, mpsc::Receiver<RawCall>) {
    let (connector, incoming) = memory::endpoint(64);
    (Channel::new(connector), incoming)
}

pub fn spawn_server(
    server: &Server,
    mut incoming: mpsc::Receiver<RawCall>,
) -> JoinHandle<mpsc::Receiver<RawCall>> {
    let server = server.clone();
    tokio::spawn(async move {
        server.serve(&mut incoming).await.unwrap();
        incoming
    })
}

/// Start a server on a fresh memory endpoint and return a channel to it.
pub fn serve(server: &Server) -> Channel {
    let (channel, incoming) = endpoint();
    spawn_server(server, incoming);
    channel
}

/// Drain a call: every data message and the terminal status.
pub async fn collect(call: &mut ClientCall) -> (Vec<Message>, Status) {
    let mut data = Vec::new();
    let mut status = None;
    while let Some(event) = call.next_event().await {
        match event {
            ClientEvent::Data(message) => data.push(message),
            ClientEvent::Status(s) => status = Some(s),
            ClientEvent::Metadata(_) | ClientEvent::Error(_) => {}
        }
    }
    (data, status.expect("call must end with a status"))
}

/// Bound for waits that must not hang a failing test.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation timed out")
}
