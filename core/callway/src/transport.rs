// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The seam between the call runtime and whatever moves frames between peers.
//!
//! A transport delivers inbound [`Frame`]s on an unbounded channel and accepts
//! outbound frames through the [`Transport`] trait. The runtime never looks at
//! message contents.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::common::{Message, MethodDescriptor};
use crate::error::TransportError;
use crate::metadata::Metadata;
use crate::status::Status;

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Metadata(Metadata),
    Message(Message),
    HalfClose,
    Status(Status),
    Cancel,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Metadata(_) => "metadata",
            Frame::Message(_) => "message",
            Frame::HalfClose => "half_close",
            Frame::Status(_) => "status",
            Frame::Cancel => "cancel",
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    fn send_metadata(&self, metadata: Metadata) -> Result<(), TransportError>;

    fn send_message(&self, message: Message) -> Result<(), TransportError>;

    fn send_half_close(&self) -> Result<(), TransportError>;

    fn send_status(&self, status: Status) -> Result<(), TransportError>;

    /// Tell the peer the call is cancelled.
    fn send_cancel(&self) -> Result<(), TransportError>;
}

/// One end of a call as handed over by the transport.
pub struct RawCall {
    pub method: MethodDescriptor,
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl std::fmt::Debug for RawCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCall")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Opens the client end of new calls.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, method: &MethodDescriptor) -> Result<RawCall, TransportError>;
}
