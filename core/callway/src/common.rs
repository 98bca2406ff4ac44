// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use crate::error::{CallError, Result};

/// Metadata entry carrying the remaining call budget to the peer.
pub const TIMEOUT_KEY: &str = "grpc-timeout";

/// Upper bound applied to every relative timeout (10h).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(36000);

/// Opaque message payload. Encoding is up to the application.
pub type Message = bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl MethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::ClientStreaming => "client_streaming",
            MethodKind::ServerStreaming => "server_streaming",
            MethodKind::BidiStreaming => "bidi_streaming",
        }
    }
}

/// A method path of the form `/service/method` plus its streaming kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    path: String,
    split: usize,
    kind: MethodKind,
}

impl MethodDescriptor {
    pub fn new(path: impl Into<String>, kind: MethodKind) -> Result<Self> {
        let path = path.into();
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != 3 || !parts[0].is_empty() || parts[1].is_empty() || parts[2].is_empty()
        {
            return Err(CallError::InvalidMethod(format!(
                "method must be in format /service/method, got: {}",
                path
            )));
        }

        let split = parts[1].len() + 1;
        Ok(Self { path, split, kind })
    }

    pub fn unary(path: impl Into<String>) -> Result<Self> {
        Self::new(path, MethodKind::Unary)
    }

    pub fn bidi_streaming(path: impl Into<String>) -> Result<Self> {
        Self::new(path, MethodKind::BidiStreaming)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn service(&self) -> &str {
        &self.path[1..self.split]
    }

    pub fn method(&self) -> &str {
        &self.path[self.split + 1..]
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}
