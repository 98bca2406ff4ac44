// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for call cancellation
//!
//! Covers:
//! - client cancellation in the middle of a stream
//! - server-side cancellation
//! - cancellation arriving while the OK status is in the status hooks
//! - cancellation reaching child calls made on behalf of a server call
//! - transport loss

mod common;

use std::sync::Arc;
use std::time::Duration;

use callway::transport::Connector;
use callway::transport::memory;
use callway::{
    CallError, CallInfo, CallOptions, CancelOrigin, Channel, ClientCall, ClientEvent, Code,
    Interception, Message, Metadata, Next, Responder, Server, ServerCall, ServerEvent, Status,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use common::{bidi_echo, collect, serve, within};

// ============================================================================
// Test Handlers
// ============================================================================

/// Echoes every message and reports every event it saw once the call is over.
async fn streaming_echo(
    mut call: ServerCall,
    report: mpsc::UnboundedSender<Vec<ServerEvent>>,
) -> Result<(), Status> {
    let mut seen = Vec::new();
    while let Some(event) = call.next_event().await {
        seen.push(event.clone());
        match event {
            ServerEvent::Data(message) => {
                // fails once the call is cancelled; the event still gets reported
                let _ = call.write(message).await;
            }
            ServerEvent::End => call.end().await?,
            ServerEvent::Error(_) | ServerEvent::Cancelled(_) => {}
        }
    }
    let _ = report.send(seen);
    Ok(())
}

fn echo_server() -> (Server, mpsc::UnboundedReceiver<Vec<ServerEvent>>) {
    let (report, reports) = mpsc::unbounded_channel();
    let server = Server::builder().build(move |call| streaming_echo(call, report.clone()));
    (server, reports)
}

async fn next_data(call: &mut ClientCall) -> Message {
    loop {
        match within(call.next_event()).await {
            Some(ClientEvent::Data(message)) => return message,
            Some(ClientEvent::Metadata(_)) => continue,
            other => panic!("expected data, got {other:?}"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
#[traced_test]
async fn test_client_cancel_mid_stream() {
    let (server, mut reports) = echo_server();
    let channel = serve(&server);

    let mut call = channel.call(&bidi_echo(), CallOptions::new()).unwrap();
    for i in 1..=2 {
        let request = format!("hello {i}");
        call.write(request.clone()).unwrap();
        assert_eq!(next_data(&mut call).await, request);
    }

    call.cancel();
    assert_eq!(
        call.write("hello 3"),
        Err(CallError::FailedPrecondition("write on closed call"))
    );

    let (data, status) = within(collect(&mut call)).await;
    assert!(data.is_empty());
    assert_eq!(status.code(), Code::Cancelled);

    // the handler sees the cancellation and nothing after it
    let seen = within(reports.recv()).await.unwrap();
    assert_eq!(
        seen,
        vec![
            ServerEvent::Data("hello 1".into()),
            ServerEvent::Data("hello 2".into()),
            ServerEvent::Cancelled(CancelOrigin::Remote),
        ]
    );
    assert!(logs_contain("call cancelled"));
}

#[tokio::test]
#[traced_test]
async fn test_cancel_after_completion_is_noop() {
    let (server, mut reports) = echo_server();
    let channel = serve(&server);

    let mut call = channel.call(&bidi_echo(), CallOptions::new()).unwrap();
    call.write("hello").unwrap();
    call.end().unwrap();

    let (data, status) = within(collect(&mut call)).await;
    assert_eq!(data, vec![Message::from("hello")]);
    assert!(status.is_ok());

    call.cancel();
    assert_eq!(call.status(), Some(Status::ok()));
    assert!(logs_contain("cancel ignored, call already completed"));

    let seen = within(reports.recv()).await.unwrap();
    assert_eq!(
        seen,
        vec![ServerEvent::Data("hello".into()), ServerEvent::End]
    );
}

#[tokio::test]
async fn test_server_cancels_call() {
    let server = Server::builder().build(|mut call: ServerCall| async move {
        if let Some(ServerEvent::Data(_)) = call.next_event().await {
            call.cancel().await;
        }
        assert_eq!(
            call.next_event().await,
            Some(ServerEvent::Cancelled(CancelOrigin::Local))
        );
        assert_eq!(call.next_event().await, None);
        assert!(call.is_cancelled());
        Ok(())
    });
    let channel = serve(&server);

    let mut call = channel.call(&bidi_echo(), CallOptions::new()).unwrap();
    call.write("hello").unwrap();

    let (data, status) = within(collect(&mut call)).await;
    assert!(data.is_empty());
    assert_eq!(status.code(), Code::Cancelled);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_cancel_during_status_hooks_is_ignored() {
    let (report, mut reports) = mpsc::unbounded_channel();
    let hooked = Arc::new(Mutex::new(Vec::new()));
    let hook_codes = hooked.clone();
    let server = Server::builder()
        .interceptor(move |_: &CallInfo| {
            let hook_codes = hook_codes.clone();
            Interception::with_responder(
                Responder::builder()
                    .on_send_status(move |status: Status, next: Next<Status>| {
                        hook_codes.lock().push(status.code());
                        async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            next.forward(status).await
                        }
                    })
                    .build(),
            )
        })
        .build(move |mut call: ServerCall| {
            let report = report.clone();
            async move {
                while let Some(event) = call.next_event().await {
                    match event {
                        ServerEvent::Data(message) => call.write(message).await?,
                        ServerEvent::End => {
                            // the OK status is held back by the interceptor
                            call.end().await?;
                            break;
                        }
                        _ => {}
                    }
                }
                let _ = report.send(call.status());
                Ok::<_, Status>(())
            }
        });
    let channel = serve(&server);

    let mut call = channel.call(&bidi_echo(), CallOptions::new()).unwrap();
    call.write("hello").unwrap();
    call.end().unwrap();
    assert_eq!(next_data(&mut call).await, "hello");
    call.cancel();

    let (_, status) = within(collect(&mut call)).await;
    assert_eq!(status.code(), Code::Cancelled);

    // the OK status already entered the hooks, the peer's cancel changes nothing
    let server_status = within(reports.recv()).await.unwrap().unwrap();
    assert_eq!(server_status.code(), Code::Ok);
    assert_eq!(*hooked.lock(), vec![Code::Ok]);
    assert!(logs_contain("cancel ignored, call already completed"));
}

#[tokio::test]
async fn test_cancellation_reaches_child_call() {
    let (backend, mut backend_reports) = echo_server();
    let backend_channel = serve(&backend);

    let (child_status_tx, mut child_status) = mpsc::unbounded_channel();
    let frontend = Server::builder().build(move |call: ServerCall| {
        relay(call, backend_channel.clone(), child_status_tx.clone())
    });
    let channel = serve(&frontend);

    let mut call = channel.call(&bidi_echo(), CallOptions::new()).unwrap();
    call.write("hello").unwrap();
    assert_eq!(next_data(&mut call).await, "hello");
    call.cancel();

    // cancelling the frontend call cancels the backend call made for it
    let child = within(child_status.recv()).await.unwrap();
    assert_eq!(child.code(), Code::Cancelled);

    let seen = within(backend_reports.recv()).await.unwrap();
    assert_eq!(
        seen,
        vec![
            ServerEvent::Data("hello".into()),
            ServerEvent::Cancelled(CancelOrigin::Remote),
        ]
    );
}

/// Forwards the first request to `backend` on behalf of `call` and relays
/// the replies. Reports the final status of the backend call.
async fn relay(
    mut call: ServerCall,
    backend: Channel,
    report: mpsc::UnboundedSender<Status>,
) -> Result<(), Status> {
    let Some(ServerEvent::Data(message)) = call.next_event().await else {
        return Err(Status::invalid_argument("expected a request"));
    };

    let mut child = backend.call(&bidi_echo(), CallOptions::new().with_parent(call.context()))?;
    child.write(message)?;

    while let Some(event) = child.next_event().await {
        match event {
            ClientEvent::Data(reply) => {
                let _ = call.write(reply).await;
            }
            ClientEvent::Status(status) => {
                let _ = report.send(status);
            }
            ClientEvent::Metadata(_) | ClientEvent::Error(_) => {}
        }
    }
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn test_transport_loss_cancels_call() {
    let (connector, incoming) = memory::endpoint(4);
    let (server, mut reports) = echo_server();
    common::spawn_server(&server, incoming);

    let raw = connector.connect(&bidi_echo()).unwrap();
    raw.transport.send_metadata(Metadata::new()).unwrap();
    raw.transport.send_message("hello".into()).unwrap();

    let mut inbound = raw.inbound;
    loop {
        match within(inbound.recv()).await {
            Some(callway::transport::Frame::Message(message)) => {
                assert_eq!(message, "hello");
                break;
            }
            Some(_) => continue,
            None => panic!("server closed the call"),
        }
    }
    drop(raw.transport);

    let seen = within(reports.recv()).await.unwrap();
    assert_eq!(
        seen,
        vec![
            ServerEvent::Data("hello".into()),
            ServerEvent::Error(TransportError::Closed),
            ServerEvent::Cancelled(CancelOrigin::Remote),
        ]
    );
    assert!(logs_contain("transport closed before the call completed"));
}
