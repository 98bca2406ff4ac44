// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! RPC call runtime.
//!
//! `callway` drives single RPC calls over an abstract [`transport`]: the call
//! lifecycle and its terminal [`Status`], deadlines and their propagation to
//! child calls, cancellation from either side, and a server-side interceptor
//! chain wrapping the call handler.

pub mod call;
pub mod channel;
pub mod common;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod interceptor;
pub mod metadata;
pub mod server;
pub mod server_call;
pub mod status;
pub mod transport;

pub use call::{CallState, CancelOrigin};
pub use channel::{CallOptions, Channel, ClientCall, ClientEvent};
pub use common::{MAX_TIMEOUT, Message, MethodDescriptor, MethodKind, TIMEOUT_KEY};
pub use config::{ChannelConfig, Configuration, ServerConfig};
pub use context::{CallContext, PropagateFlags};
pub use deadline::Deadline;
pub use error::{CallError, ConfigError, DeadlineError, ServerError, TransportError};
pub use interceptor::{
    CallInfo, Interception, Interceptor, Listener, ListenerBuilder, Next, Responder,
    ResponderBuilder,
};
pub use metadata::Metadata;
pub use server::{Server, ServerBuilder};
pub use server_call::{ServerCall, ServerEvent};
pub use status::{Code, Status};
