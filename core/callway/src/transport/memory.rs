// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! In-process loopback transport built on tokio channels.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::trace;

use super::{Connector, Frame, RawCall, Transport};
use crate::common::{Message, MethodDescriptor};
use crate::error::TransportError;
use crate::metadata::Metadata;
use crate::status::Status;

#[derive(Debug, Clone)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
}

impl MemoryTransport {
    fn push(&self, frame: Frame) -> Result<(), TransportError> {
        trace!(frame = frame.kind(), "memory transport send");
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Transport for MemoryTransport {
    fn send_metadata(&self, metadata: Metadata) -> Result<(), TransportError> {
        self.push(Frame::Metadata(metadata))
    }

    fn send_message(&self, message: Message) -> Result<(), TransportError> {
        self.push(Frame::Message(message))
    }

    fn send_half_close(&self) -> Result<(), TransportError> {
        self.push(Frame::HalfClose)
    }

    fn send_status(&self, status: Status) -> Result<(), TransportError> {
        self.push(Frame::Status(status))
    }

    fn send_cancel(&self) -> Result<(), TransportError> {
        self.push(Frame::Cancel)
    }
}

/// Two connected ends of one call: (client, server).
pub fn pair(method: MethodDescriptor) -> (RawCall, RawCall) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();

    let client = RawCall {
        method: method.clone(),
        transport: Arc::new(MemoryTransport { tx: client_tx }),
        inbound: client_rx,
    };
    let server = RawCall {
        method,
        transport: Arc::new(MemoryTransport { tx: server_tx }),
        inbound: server_rx,
    };

    (client, server)
}

/// Client side of a memory endpoint. Every call it opens is queued for the
/// server holding the matching receiver.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming: mpsc::Sender<RawCall>,
}

/// Create a memory endpoint with room for `backlog` calls not yet accepted.
pub fn endpoint(backlog: usize) -> (MemoryConnector, mpsc::Receiver<RawCall>) {
    let (incoming, rx) = mpsc::channel(backlog.max(1));
    (MemoryConnector { incoming }, rx)
}

impl Connector for MemoryConnector {
    fn connect(&self, method: &MethodDescriptor) -> Result<RawCall, TransportError> {
        let (client, server) = pair(method.clone());
        self.incoming.try_send(server).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Refused("server backlog is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let method = MethodDescriptor::unary("/test.Echo/Unary").unwrap();
        let (client, mut server) = pair(method);

        client.transport.send_metadata(Metadata::new()).unwrap();
        client.transport.send_message(Message::from_static(b"hello")).unwrap();
        client.transport.send_half_close().unwrap();

        assert_eq!(server.inbound.recv().await, Some(Frame::Metadata(Metadata::new())));
        assert_eq!(
            server.inbound.recv().await,
            Some(Frame::Message(Message::from_static(b"hello")))
        );
        assert_eq!(server.inbound.recv().await, Some(Frame::HalfClose));
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped() {
        let method = MethodDescriptor::unary("/test.Echo/Unary").unwrap();
        let (client, server) = pair(method);
        drop(server);

        assert_eq!(client.transport.send_cancel(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_connector_backlog() {
        let method = MethodDescriptor::unary("/test.Echo/Unary").unwrap();
        let (connector, mut incoming) = endpoint(1);

        let _first = connector.connect(&method).unwrap();
        assert!(matches!(
            connector.connect(&method),
            Err(TransportError::Refused(_))
        ));

        let accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.method, method);

        drop(incoming);
        assert!(matches!(
            connector.connect(&method),
            Err(TransportError::Closed)
        ));
    }
}
