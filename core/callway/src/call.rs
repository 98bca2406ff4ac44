// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Call lifecycle state machine.
//!
//! Every transition of a call, on either side, goes through
//! [`CallStateMachine`]. The owner keeps it behind a single mutex so that
//! completion, cancellation and deadline expiry are serialized.
//!
//! A terminal status is *decided* when the machine enters [`CallState::Closed`]
//! and *observed* once it is committed to the outside: on a server when it
//! enters the outbound status hooks, on a client when it is handed to the
//! application. A cancellation arriving between the two replaces a decided
//! OK status. Non-OK statuses are never replaced.

use std::fmt;

use crate::error::CallError;
use crate::status::{Code, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Open => "open",
            CallState::HalfClosedLocal => "half_closed_local",
            CallState::HalfClosedRemote => "half_closed_remote",
            CallState::Closed => "closed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What triggered a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// Explicit cancel by the local application, or by a cancelled parent call.
    Local,
    Deadline,
    /// Cancel signal received from the peer, or the peer went away.
    Remote,
    /// The server is draining.
    Shutdown,
}

impl CancelOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOrigin::Local => "local",
            CancelOrigin::Deadline => "deadline",
            CancelOrigin::Remote => "remote",
            CancelOrigin::Shutdown => "shutdown",
        }
    }

    /// Terminal status reported for a cancellation of this origin.
    pub fn status(&self) -> Status {
        match self {
            CancelOrigin::Local => Status::cancelled("call cancelled"),
            CancelOrigin::Remote => Status::cancelled("call cancelled by peer"),
            CancelOrigin::Deadline => Status::deadline_exceeded("deadline exceeded"),
            CancelOrigin::Shutdown => Status::unavailable("server is shutting down"),
        }
    }
}

impl fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a half-close transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    HalfClosed,
    Closed(Status),
}

/// Where a status handed to [`CallStateMachine::observe`] comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    /// Decided by the handler, an interceptor or a half-close.
    Decided,
    Cancellation,
}

#[derive(Debug)]
pub struct CallStateMachine {
    state: CallState,
    status: Option<Status>,
    cancelled: Option<CancelOrigin>,
    observed: bool,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        CallStateMachine {
            state: CallState::Open,
            status: None,
            cancelled: None,
            observed: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn cancelled(&self) -> Option<CancelOrigin> {
        self.cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.state == CallState::Closed
    }

    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn write(&self) -> Result<(), CallError> {
        match self.state {
            CallState::Open | CallState::HalfClosedRemote => Ok(()),
            CallState::HalfClosedLocal => {
                Err(CallError::FailedPrecondition("write after local half-close"))
            }
            CallState::Closed => Err(CallError::FailedPrecondition("write on closed call")),
        }
    }

    pub fn end_local(&mut self) -> Transition {
        match self.state {
            CallState::Open => {
                self.state = CallState::HalfClosedLocal;
                Transition::HalfClosed
            }
            CallState::HalfClosedRemote => Transition::Closed(self.close(Status::ok())),
            CallState::HalfClosedLocal | CallState::Closed => Transition::Unchanged,
        }
    }

    pub fn receive_message(&self) -> Result<(), CallError> {
        match self.state {
            CallState::Open | CallState::HalfClosedLocal => Ok(()),
            CallState::HalfClosedRemote => Err(CallError::UnexpectedEvent {
                state: self.state.as_str(),
                event: "message",
            }),
            CallState::Closed => Err(CallError::Closed(
                self.status.clone().unwrap_or_default(),
            )),
        }
    }

    pub fn receive_end_remote(&mut self) -> Transition {
        match self.state {
            CallState::Open => {
                self.state = CallState::HalfClosedRemote;
                Transition::HalfClosed
            }
            CallState::HalfClosedLocal => Transition::Closed(self.close(Status::ok())),
            CallState::HalfClosedRemote | CallState::Closed => Transition::Unchanged,
        }
    }

    /// Cancel the call. Returns the terminal status when this call changed the
    /// outcome, `None` when the cancellation is a no-op.
    pub fn cancel(&mut self, origin: CancelOrigin) -> Option<Status> {
        if self.state == CallState::Closed {
            let replaceable = !self.observed
                && self.cancelled.is_none()
                && self.status.as_ref().is_some_and(Status::is_ok);
            if !replaceable {
                return None;
            }
        }

        let status = origin.status();
        self.state = CallState::Closed;
        self.cancelled = Some(origin);
        self.status = Some(status.clone());
        Some(status)
    }

    /// Close the call with `status`. Fails if a terminal status already exists.
    pub fn set_status(&mut self, status: Status) -> Result<(), CallError> {
        if let Some(existing) = &self.status {
            return Err(CallError::StatusAlreadySet(existing.code()));
        }
        self.close(status);
        Ok(())
    }

    /// Mark the terminal status as observed, recording `status` as the final
    /// value. Returns the status to emit, or `None` if nothing must be emitted:
    /// the status was observed already, or a cancellation replaced the decided
    /// status in the meantime.
    pub fn observe(&mut self, status: Status, source: StatusSource) -> Option<Status> {
        if self.state != CallState::Closed || self.observed {
            return None;
        }
        if source == StatusSource::Decided && self.cancelled.is_some() {
            return None;
        }
        self.observed = true;
        self.status = Some(status.clone());
        Some(status)
    }

    /// Record the status the outbound hooks finally carried. Only an observed
    /// call can be settled.
    pub fn settle(&mut self, status: Status) -> bool {
        if !self.observed {
            return false;
        }
        self.status = Some(status);
        true
    }

    /// Mark whatever terminal status the call holds as observed.
    pub fn observe_current(&mut self) -> Option<Status> {
        if self.state != CallState::Closed || self.observed {
            return None;
        }
        self.observed = true;
        self.status.clone()
    }

    pub fn code(&self) -> Option<Code> {
        self.status.as_ref().map(Status::code)
    }

    fn close(&mut self, status: Status) -> Status {
        self.state = CallState::Closed;
        self.status = Some(status.clone());
        status
    }
}
