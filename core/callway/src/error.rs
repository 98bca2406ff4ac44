// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::status::{Code, Status};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("failed precondition: {0}")]
    FailedPrecondition(&'static str),

    #[error("status already set to {0}")]
    StatusAlreadySet(Code),

    #[error("unexpected event in state {state}: {event}")]
    UnexpectedEvent {
        state: &'static str,
        event: &'static str,
    },

    #[error("call closed with {0}")]
    Closed(Status),

    #[error("invalid method path: {0}")]
    InvalidMethod(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("call refused: {0}")]
    Refused(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("malformed timeout value '{0}'")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("server is already serving")]
    AlreadyServing,
}

pub type Result<T> = std::result::Result<T, CallError>;

impl From<CallError> for Status {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Closed(status) => status,
            CallError::FailedPrecondition(_) => Status::failed_precondition(error.to_string()),
            CallError::InvalidMethod(_) => Status::invalid_argument(error.to_string()),
            CallError::Transport(_) => Status::unavailable(error.to_string()),
            CallError::StatusAlreadySet(_) | CallError::UnexpectedEvent { .. } => {
                Status::internal(error.to_string())
            }
        }
    }
}

impl From<TransportError> for Status {
    fn from(error: TransportError) -> Self {
        Status::unavailable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_to_status() {
        let status: Status = CallError::FailedPrecondition("write after close").into();
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(
            status.message(),
            Some("failed precondition: write after close")
        );

        let closed = Status::deadline_exceeded("deadline exceeded");
        let status: Status = CallError::Closed(closed.clone()).into();
        assert_eq!(status, closed);

        let status: Status = CallError::Transport(TransportError::Closed).into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = CallError::StatusAlreadySet(Code::Ok).into();
        assert_eq!(status.code(), Code::Internal);
    }
}
