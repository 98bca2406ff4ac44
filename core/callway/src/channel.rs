// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client side: opening calls and consuming their events.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::call::{CallState, CallStateMachine, CancelOrigin, Transition};
use crate::common::{Message, MethodDescriptor, TIMEOUT_KEY};
use crate::config::ChannelConfig;
use crate::context::{CallContext, PropagateFlags};
use crate::deadline::{self, Deadline, DeadlineTimer, encode_timeout};
use crate::error::{CallError, TransportError};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{Connector, Frame, Transport};

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// relative timeout; the channel default applies when unset
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
    /// the server call this call is made on behalf of
    pub parent: Option<CallContext>,
    /// what to inherit from `parent`; the channel default applies when unset
    pub propagate: Option<PropagateFlags>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        CallOptions {
            timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_metadata(self, metadata: Metadata) -> Self {
        CallOptions { metadata, ..self }
    }

    pub fn with_parent(self, parent: CallContext) -> Self {
        CallOptions {
            parent: Some(parent),
            ..self
        }
    }

    pub fn with_propagate(self, propagate: PropagateFlags) -> Self {
        CallOptions {
            propagate: Some(propagate),
            ..self
        }
    }
}

/// Events of a client call, in arrival order. The last event is always a
/// single [`ClientEvent::Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Metadata(Metadata),
    Data(Message),
    Error(TransportError),
    Status(Status),
}

struct ClientShared {
    call_id: u64,
    method: MethodDescriptor,
    deadline: Option<Deadline>,
    transport: Arc<dyn Transport>,
    machine: Mutex<CallStateMachine>,
    closed: CancellationToken,
    timer: Option<DeadlineTimer>,
}

impl ClientShared {
    fn cancel(&self, origin: CancelOrigin, notify_peer: bool) -> bool {
        let status = self.machine.lock().cancel(origin);
        let Some(status) = status else {
            debug!(call_id = self.call_id, %origin, "cancel ignored, call already completed");
            return false;
        };

        info!(
            call_id = self.call_id,
            method = %self.method,
            %origin,
            code = %status.code(),
            "call cancelled"
        );
        if notify_peer {
            if let Err(e) = self.transport.send_cancel() {
                debug!(call_id = self.call_id, error = %e, "failed to send cancel");
            }
        }
        self.finish();
        true
    }

    fn finish(&self) {
        if let Some(timer) = &self.timer {
            timer.disarm();
        }
        self.closed.cancel();
    }
}

/// Client end of a call.
pub struct ClientCall {
    shared: Arc<ClientShared>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    done: bool,
}

impl std::fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCall")
            .field("call_id", &self.shared.call_id)
            .field("method", &self.shared.method)
            .field("state", &self.state())
            .finish()
    }
}

impl ClientCall {
    pub fn call_id(&self) -> u64 {
        self.shared.call_id
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.shared.method
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.shared.deadline
    }

    pub fn state(&self) -> CallState {
        self.shared.machine.lock().state()
    }

    pub fn status(&self) -> Option<Status> {
        self.shared.machine.lock().status().cloned()
    }

    pub fn write(&self, message: impl Into<Message>) -> Result<(), CallError> {
        self.shared.machine.lock().write()?;
        self.shared.transport.send_message(message.into())?;
        Ok(())
    }

    /// Half-close: no more messages will be written.
    pub fn end(&self) -> Result<(), CallError> {
        let transition = self.shared.machine.lock().end_local();
        match transition {
            Transition::HalfClosed => self.shared.transport.send_half_close()?,
            Transition::Closed(_) => self.shared.finish(),
            Transition::Unchanged => {}
        }
        Ok(())
    }

    /// Cancel the call. The next event is the CANCELLED status, queued data is
    /// discarded. No-op on a completed call.
    pub fn cancel(&self) {
        self.shared.cancel(CancelOrigin::Local, true);
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        let call_id = self.shared.call_id;
        loop {
            if self.done {
                return None;
            }

            let terminal = self.shared.machine.lock().observe_current();
            if let Some(status) = terminal {
                self.done = true;
                debug!(%call_id, code = %status.code(), "call completed");
                return Some(ClientEvent::Status(status));
            }

            let frame = tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => continue,
                frame = self.inbound.recv() => frame,
            };

            match frame {
                Some(Frame::Metadata(metadata)) => return Some(ClientEvent::Metadata(metadata)),
                Some(Frame::Message(message)) => {
                    let accepted = self.shared.machine.lock().receive_message();
                    match accepted {
                        Ok(()) => return Some(ClientEvent::Data(message)),
                        Err(e) => debug!(%call_id, error = %e, "dropping message"),
                    }
                }
                Some(Frame::Status(status)) => {
                    let result = self.shared.machine.lock().set_status(status);
                    match result {
                        Ok(()) => self.shared.finish(),
                        Err(e) => debug!(%call_id, error = %e, "ignoring status from server"),
                    }
                }
                Some(Frame::Cancel) => {
                    // the server gives up on our behalf once our own deadline passed
                    let origin = if self.shared.deadline.is_some_and(|d| d.is_expired()) {
                        CancelOrigin::Deadline
                    } else {
                        CancelOrigin::Remote
                    };
                    self.shared.cancel(origin, false);
                }
                Some(Frame::HalfClose) => trace!(%call_id, "ignoring half-close from server"),
                None => {
                    let lost = self
                        .shared
                        .machine
                        .lock()
                        .set_status(Status::unavailable("transport closed"))
                        .is_ok();
                    if lost {
                        warn!(%call_id, "transport closed before the call completed");
                        self.shared.finish();
                        return Some(ClientEvent::Error(TransportError::Closed));
                    }
                }
            }
        }
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        if !self.shared.machine.lock().is_closed() {
            debug!(call_id = self.shared.call_id, "call dropped before completion");
            self.shared.cancel(CancelOrigin::Local, true);
        }
    }
}

/// Opens calls through a [`Connector`].
#[derive(Clone)]
pub struct Channel {
    connector: Arc<dyn Connector>,
    config: ChannelConfig,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(connector: impl Connector) -> Self {
        Self::with_config(connector, ChannelConfig::default())
    }

    pub fn with_config(connector: impl Connector, config: ChannelConfig) -> Self {
        Channel {
            connector: Arc::new(connector),
            config,
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Open a call. Request metadata, including the remaining budget, is sent
    /// right away. Must be called from within a tokio runtime.
    pub fn call(
        &self,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> Result<ClientCall, CallError> {
        let CallOptions {
            timeout,
            metadata,
            parent,
            propagate,
        } = options;
        let propagate = propagate.unwrap_or(self.config.propagate());
        let timeout = timeout.or(self.config.default_timeout());

        let inherited = parent
            .as_ref()
            .filter(|_| propagate.deadline)
            .and_then(CallContext::deadline);
        let deadline = deadline::resolve(inherited, timeout);

        let raw = self.connector.connect(method)?;
        let call_id = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ClientShared {
            call_id,
            method: method.clone(),
            deadline,
            transport: raw.transport,
            machine: Mutex::new(CallStateMachine::new()),
            closed: CancellationToken::new(),
            timer: deadline.map(|deadline| DeadlineTimer::new(call_id, deadline)),
        });
        let call = ClientCall {
            shared: shared.clone(),
            inbound: raw.inbound,
            done: false,
        };

        if deadline.is_some_and(|deadline| deadline.is_expired()) {
            debug!(%call_id, %method, "deadline exceeded before the call started");
            shared.cancel(CancelOrigin::Deadline, true);
            return Ok(call);
        }

        let mut headers = metadata;
        if let Some(deadline) = deadline {
            headers.insert(TIMEOUT_KEY, encode_timeout(deadline.remaining()));
        }
        shared.transport.send_metadata(headers)?;

        info!(
            %call_id,
            %method,
            timeout_ms = deadline.map(|deadline| {
                u64::try_from(deadline.remaining().as_millis()).unwrap_or(u64::MAX)
            }),
            parent = parent.as_ref().map(CallContext::call_id),
            "call started"
        );

        if let Some(timer) = &shared.timer {
            let expired = shared.clone();
            timer.arm(move || async move {
                expired.cancel(CancelOrigin::Deadline, true);
            });
        }

        if let Some(parent) = parent.filter(|_| propagate.cancellation) {
            let child = shared.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.cancellation_token().cancelled() => {
                        debug!(call_id = child.call_id, parent = parent.call_id(), "parent call cancelled");
                        child.cancel(CancelOrigin::Local, true);
                    }
                    _ = child.closed.cancelled() => {}
                }
            });
        }

        Ok(call)
    }

    /// Send one request and wait for the single response.
    pub async fn unary(
        &self,
        method: &MethodDescriptor,
        message: impl Into<Message>,
        options: CallOptions,
    ) -> Result<Message, Status> {
        let mut call = self.call(method, options).map_err(Status::from)?;

        // a failed write surfaces as the terminal status below
        if let Err(e) = call.write(message) {
            debug!(call_id = call.call_id(), error = %e, "request not sent");
        }
        if let Err(e) = call.end() {
            debug!(call_id = call.call_id(), error = %e, "half-close not sent");
        }

        let mut response = None;
        while let Some(event) = call.next_event().await {
            match event {
                ClientEvent::Data(message) if response.is_none() => response = Some(message),
                ClientEvent::Data(_) => {
                    warn!(call_id = call.call_id(), "dropping extra response of unary call")
                }
                ClientEvent::Status(status) if status.is_ok() => {
                    return response
                        .ok_or_else(|| Status::internal("unary call completed without a response"));
                }
                ClientEvent::Status(status) => return Err(status),
                ClientEvent::Metadata(_) | ClientEvent::Error(_) => {}
            }
        }

        Err(Status::internal("call ended without a status"))
    }
}
