// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests for deadlines
//!
//! All tests run on paused time. Covers:
//! - calls completing before and after their deadline
//! - deadline propagation through a child call made by the handler
//! - the timeout header and the server's limits on it
//! - calls whose deadline passed before they started
//! - a deadline firing while the OK status is in the status hooks

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use callway::transport::{Connector, Frame};
use callway::transport::memory;
use callway::{
    CallContext, CallInfo, CallOptions, Channel, Code, Deadline, Interception, Listener, Metadata,
    Next, PropagateFlags, Responder, Server, ServerCall, ServerConfig, ServerEvent, Status,
    TIMEOUT_KEY,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use common::{collect, endpoint, spawn_server, unary_echo, within};

const PROPAGATE_PREFIX: &str = "[propagate me]";

// ============================================================================
// Test Handlers
// ============================================================================

/// Echoes the request. Requests containing "delay" take two seconds, requests
/// starting with the propagation prefix are forwarded, prefix stripped, to
/// the same service on behalf of this call.
async fn delayed_echo(mut call: ServerCall, channel: Channel) -> Result<(), Status> {
    let mut request = None;
    while let Some(event) = call.next_event().await {
        match event {
            ServerEvent::Data(message) => request = Some(message),
            ServerEvent::End => break,
            ServerEvent::Cancelled(_) => return Ok(()),
            ServerEvent::Error(_) => {}
        }
    }
    let Some(request) = request else {
        return Ok(());
    };

    let text = String::from_utf8_lossy(&request).into_owned();
    let response = match text.strip_prefix(PROPAGATE_PREFIX) {
        Some(rest) => {
            let options = CallOptions::new().with_parent(call.context());
            channel
                .unary(call.method(), rest.to_string(), options)
                .await?
        }
        None => {
            if text.contains("delay") {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = call.cancelled() => return Ok(()),
                }
            }
            request
        }
    };

    call.write(response).await?;
    call.end().await?;
    Ok(())
}

/// A delayed echo server and a channel to it.
fn start(config: ServerConfig) -> Channel {
    let (channel, incoming) = endpoint();
    let server = Server::builder().config(config).build({
        let channel = channel.clone();
        move |call| delayed_echo(call, channel.clone())
    });
    spawn_server(&server, incoming);
    channel
}

fn one_second() -> CallOptions {
    CallOptions::new().with_timeout(Duration::from_secs(1))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_completes_within_deadline() {
    let channel = start(ServerConfig::default());

    let response = within(channel.unary(&unary_echo(), "hello", one_second()))
        .await
        .unwrap();
    assert_eq!(response, "hello");
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_deadline_exceeded() {
    let channel = start(ServerConfig::default());

    let started = Instant::now();
    let status = within(channel.unary(&unary_echo(), "delay", one_second()))
        .await
        .unwrap_err();

    assert_eq!(status.code(), Code::DeadlineExceeded);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert!(logs_contain("deadline expired"));
}

#[tokio::test(start_paused = true)]
async fn test_propagated_deadline() {
    let channel = start(ServerConfig::default());

    let response = within(channel.unary(
        &unary_echo(),
        format!("{PROPAGATE_PREFIX}hello"),
        one_second(),
    ))
    .await
    .unwrap();
    assert_eq!(response, "hello");

    let status = within(channel.unary(
        &unary_echo(),
        format!("{PROPAGATE_PREFIX}delay"),
        one_second(),
    ))
    .await
    .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
async fn test_child_deadline_not_inherited_when_disabled() {
    let (report, mut reports) = mpsc::unbounded_channel();
    let (backend, backend_incoming) = endpoint();
    spawn_server(
        &Server::builder().build(|_call: ServerCall| async { Ok(()) }),
        backend_incoming,
    );

    let (channel, incoming) = endpoint();
    let frontend = Server::builder().build(move |call: ServerCall| {
        let backend = backend.clone();
        let report = report.clone();
        async move {
            let inherited = backend.call(&unary_echo(), CallOptions::new().with_parent(call.context()))?;
            let detached = backend.call(
                &unary_echo(),
                CallOptions::new()
                    .with_parent(call.context())
                    .with_propagate(PropagateFlags::none()),
            )?;
            let _ = report.send((call.deadline(), inherited.deadline(), detached.deadline()));
            Ok::<_, Status>(())
        }
    });
    spawn_server(&frontend, incoming);

    let _ = within(channel.unary(&unary_echo(), "hello", one_second())).await;

    let (parent, inherited, detached) = within(reports.recv()).await.unwrap();
    let parent = parent.unwrap();
    assert_eq!(inherited.map(|deadline| deadline.at()), Some(parent.at()));
    assert!(detached.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_header_sets_server_deadline() {
    let (report, mut reports) = mpsc::unbounded_channel();
    let (connector, incoming) = memory::endpoint(4);
    let server = Server::builder().build(move |call: ServerCall| {
        let report = report.clone();
        async move {
            let _ = report.send((call.deadline(), call.metadata().contains_key(TIMEOUT_KEY)));
            Ok(())
        }
    });
    spawn_server(&server, incoming);

    let raw = connector.connect(&unary_echo()).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert(TIMEOUT_KEY, "500m");
    raw.transport.send_metadata(metadata).unwrap();

    let (deadline, header_visible) = within(reports.recv()).await.unwrap();
    assert_eq!(
        deadline.map(|deadline| deadline.budget()),
        Some(Duration::from_millis(500))
    );
    assert!(!header_visible);
}

#[tokio::test(start_paused = true)]
async fn test_server_caps_client_timeout() {
    let config = ServerConfig::default().with_max_timeout(Duration::from_millis(100));
    let channel = start(config);

    let started = Instant::now();
    let status = within(channel.unary(
        &unary_echo(),
        "delay",
        CallOptions::new().with_timeout(Duration::from_secs(5)),
    ))
    .await
    .unwrap_err();

    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_server_default_timeout() {
    let config = ServerConfig::default().with_default_timeout(Some(Duration::from_millis(100)));
    let channel = start(config);

    let status = within(channel.unary(&unary_echo(), "delay", CallOptions::new()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_expired_on_arrival() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let handler_ran = Arc::new(AtomicBool::new(false));

    let (connector, incoming) = memory::endpoint(4);
    let hooks = trace.clone();
    let ran = handler_ran.clone();
    let server = Server::builder()
        .interceptor(move |_: &CallInfo| {
            let (metadata_hook, status_hook) = (hooks.clone(), hooks.clone());
            Interception::new(
                Listener::builder()
                    .on_receive_metadata(move |metadata: Metadata, next: Next<Metadata>| {
                        metadata_hook.lock().push("metadata".to_string());
                        next.forward(metadata)
                    })
                    .build(),
                Responder::builder()
                    .on_send_status(move |status: Status, next: Next<Status>| {
                        status_hook.lock().push(format!("status:{}", status.code()));
                        next.forward(status)
                    })
                    .build(),
            )
        })
        .build(move |_call: ServerCall| {
            ran.store(true, Ordering::SeqCst);
            async { Ok(()) }
        });
    spawn_server(&server, incoming);

    let mut raw = connector.connect(&unary_echo()).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert(TIMEOUT_KEY, "0n");
    raw.transport.send_metadata(metadata).unwrap();

    let frame = within(raw.inbound.recv()).await;
    let Some(Frame::Status(status)) = frame else {
        panic!("expected a status, got {frame:?}");
    };
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(*trace.lock(), vec!["status:DEADLINE_EXCEEDED"]);
    assert!(!handler_ran.load(Ordering::SeqCst));
    assert!(logs_contain("deadline exceeded before the call started"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_deadline_during_status_hooks_keeps_ok() {
    let trace = Arc::new(Mutex::new(Vec::new()));

    let (connector, incoming) = memory::endpoint(4);
    let hooks = trace.clone();
    let server = Server::builder()
        .interceptor(move |_: &CallInfo| {
            let hooks = hooks.clone();
            Interception::with_responder(
                Responder::builder()
                    .on_send_status(move |status: Status, next: Next<Status>| {
                        hooks.lock().push(format!("status:{}", status.code()));
                        async move {
                            // the deadline passes while the status is held here
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            next.forward(status).await
                        }
                    })
                    .build(),
            )
        })
        .build(|mut call: ServerCall| async move {
            while let Some(event) = call.next_event().await {
                match event {
                    ServerEvent::Data(message) => {
                        tokio::time::sleep(Duration::from_millis(950)).await;
                        call.write(message).await?;
                    }
                    ServerEvent::End => call.end().await?,
                    _ => break,
                }
            }
            Ok::<_, Status>(())
        });
    spawn_server(&server, incoming);

    let mut raw = connector.connect(&unary_echo()).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert(TIMEOUT_KEY, "1S");
    raw.transport.send_metadata(metadata).unwrap();
    raw.transport.send_message("almost late".into()).unwrap();
    raw.transport.send_half_close().unwrap();

    let status = loop {
        match within(raw.inbound.recv()).await {
            Some(Frame::Status(status)) => break status,
            Some(_) => continue,
            None => panic!("transport closed without a status"),
        }
    };
    assert_eq!(status.code(), Code::Ok);
    assert_eq!(*trace.lock(), vec!["status:OK"]);
    assert!(logs_contain("cancel ignored, call already completed"));

    // nothing follows the status
    assert!(!matches!(raw.inbound.try_recv(), Ok(Frame::Status(_))));
}

#[tokio::test(start_paused = true)]
async fn test_expired_parent_never_reaches_handler() {
    let handler_ran = Arc::new(AtomicBool::new(false));
    let ran = handler_ran.clone();
    let (channel, incoming) = endpoint();
    let server = Server::builder().build(move |_call: ServerCall| {
        ran.store(true, Ordering::SeqCst);
        async { Ok(()) }
    });
    spawn_server(&server, incoming);

    let parent = CallContext::new(
        7,
        Some(Deadline::new(Instant::now(), Duration::from_secs(1))),
        CancellationToken::new(),
    );
    let mut call = channel
        .call(&unary_echo(), CallOptions::new().with_parent(parent))
        .unwrap();
    assert!(call.write("hello").is_err());

    let (data, status) = within(collect(&mut call)).await;
    assert!(data.is_empty());
    assert_eq!(status.code(), Code::DeadlineExceeded);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!handler_ran.load(Ordering::SeqCst));
}
