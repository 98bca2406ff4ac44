// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Context a server call hands to the child calls it makes.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::deadline::Deadline;

/// What a child call inherits from its parent [`CallContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PropagateFlags {
    #[serde(default = "default_propagate")]
    pub deadline: bool,

    #[serde(default = "default_propagate")]
    pub cancellation: bool,
}

fn default_propagate() -> bool {
    true
}

impl Default for PropagateFlags {
    fn default() -> Self {
        PropagateFlags {
            deadline: default_propagate(),
            cancellation: default_propagate(),
        }
    }
}

impl PropagateFlags {
    pub fn none() -> Self {
        PropagateFlags {
            deadline: false,
            cancellation: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: u64,
    deadline: Option<Deadline>,
    cancellation_token: CancellationToken,
}

impl CallContext {
    pub fn new(
        call_id: u64,
        deadline: Option<Deadline>,
        cancellation_token: CancellationToken,
    ) -> Self {
        CallContext {
            call_id,
            deadline,
            cancellation_token,
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Get the remaining time until deadline
    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.remaining())
    }

    /// Check if the deadline has been exceeded
    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline.is_expired())
    }

    /// Token cancelled when the call is cancelled, whatever the origin.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
