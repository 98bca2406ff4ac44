// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server side of a single call: the interceptor chain around the handler.
//!
//! Each call runs one task that reads inbound frames and pushes them through
//! the listener hooks, one event at a time. The handler runs in its own task,
//! pulls [`ServerEvent`]s from [`ServerCall::next_event`] and produces outbound
//! events that go through the responder hooks before reaching the transport.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::call::{CallState, CallStateMachine, CancelOrigin, StatusSource, Transition};
use crate::common::{Message, MethodDescriptor};
use crate::context::CallContext;
use crate::deadline::{Deadline, DeadlineTimer};
use crate::error::{CallError, TransportError};
use crate::interceptor::{
    CallInfo, Hook, HookFuture, HookGuard, Interception, Next, abandoned_status,
};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::transport::{Frame, Transport};

pub type HandlerFuture = BoxFuture<'static, Result<(), Status>>;

pub type Handler = Arc<dyn Fn(ServerCall) -> HandlerFuture + Send + Sync>;

/// Inbound events as seen by the handler. A call delivers at most one of
/// [`ServerEvent::End`] and [`ServerEvent::Cancelled`], and nothing after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Data(Message),
    /// The client half-closed its side.
    End,
    /// The transport failed. A `Cancelled` event follows.
    Error(TransportError),
    Cancelled(CancelOrigin),
}

struct CallInner {
    machine: CallStateMachine,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,
    handler_started: bool,
    metadata_sent: bool,
    end_delivered: bool,
}

pub(crate) struct CallCore {
    info: CallInfo,
    layers: Vec<Interception>,
    transport: Arc<dyn Transport>,
    handler: Handler,
    inner: Mutex<CallInner>,
    /// cancelled when the call is cancelled, whatever the origin
    cancellation_token: CancellationToken,
    /// cancelled once the terminal status left the call
    closed: CancellationToken,
    timer: Option<DeadlineTimer>,
}

impl CallCore {
    pub(crate) fn new(
        info: CallInfo,
        layers: Vec<Interception>,
        transport: Arc<dyn Transport>,
        handler: Handler,
    ) -> Arc<Self> {
        let timer = info
            .deadline
            .map(|deadline| DeadlineTimer::new(info.call_id, deadline));

        Arc::new(CallCore {
            info,
            layers,
            transport,
            handler,
            inner: Mutex::new(CallInner {
                machine: CallStateMachine::new(),
                events: None,
                handler_started: false,
                metadata_sent: false,
                end_delivered: false,
            }),
            cancellation_token: CancellationToken::new(),
            closed: CancellationToken::new(),
            timer,
        })
    }

    fn call_id(&self) -> u64 {
        self.info.call_id
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().machine.is_closed()
    }

    /// Inbound events stop flowing once the call is cancelled or its status
    /// has been sent.
    fn accepts_inbound(&self) -> bool {
        let inner = self.inner.lock();
        inner.machine.cancelled().is_none() && !inner.machine.is_observed()
    }

    /// Drive the call until it is closed. `metadata` is the first frame
    /// received from the client.
    pub(crate) async fn run(
        self: Arc<Self>,
        metadata: Metadata,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        watch: drain::Watch,
    ) {
        let call_id = self.call_id();

        if self.info.deadline.is_some_and(|deadline| deadline.is_expired()) {
            debug!(%call_id, "deadline exceeded before the call started");
            self.cancel(CancelOrigin::Deadline).await;
            return;
        }
        self.arm_deadline();

        dispatch::<Start>(self.clone(), 0, ()).await;
        if self.is_closed() {
            debug!(%call_id, "call rejected on start");
            return;
        }

        dispatch::<ReceiveMetadata>(self.clone(), 0, metadata).await;

        let shutdown = watch.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = &mut shutdown => {
                    self.cancel(CancelOrigin::Shutdown).await;
                    break;
                }
                frame = inbound.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => {
                        self.transport_lost().await;
                        break;
                    }
                }
            }
        }

        trace!(%call_id, "call task done");
    }

    fn arm_deadline(self: &Arc<Self>) {
        if let Some(timer) = &self.timer {
            let core = self.clone();
            timer.arm(move || async move {
                core.cancel(CancelOrigin::Deadline).await;
            });
        }
    }

    async fn on_frame(self: &Arc<Self>, frame: Frame) {
        let call_id = self.call_id();
        match frame {
            Frame::Message(message) => {
                let accepted = self.inner.lock().machine.receive_message();
                match accepted {
                    Ok(()) => dispatch::<ReceiveMessage>(self.clone(), 0, message).await,
                    Err(e) => debug!(%call_id, error = %e, "dropping inbound message"),
                }
            }
            Frame::HalfClose => {
                let transition = self.inner.lock().machine.receive_end_remote();
                match transition {
                    Transition::Unchanged => debug!(%call_id, "ignoring repeated half-close"),
                    Transition::HalfClosed => {
                        dispatch::<ReceiveHalfClose>(self.clone(), 0, ()).await
                    }
                    Transition::Closed(status) => {
                        dispatch::<ReceiveHalfClose>(self.clone(), 0, ()).await;
                        dispatch::<SendStatus>(self.clone(), 0, status).await;
                    }
                }
            }
            Frame::Cancel => self.cancel(CancelOrigin::Remote).await,
            Frame::Metadata(_) => warn!(%call_id, "ignoring repeated metadata"),
            Frame::Status(_) => warn!(%call_id, "ignoring status sent by the client"),
        }
    }

    async fn transport_lost(self: &Arc<Self>) {
        {
            let inner = self.inner.lock();
            if inner.machine.is_closed() {
                return;
            }
            if let Some(events) = &inner.events {
                let _ = events.send(ServerEvent::Error(TransportError::Closed));
            }
        }
        warn!(call_id = self.call_id(), "transport closed before the call completed");
        self.cancel(CancelOrigin::Remote).await;
    }

    pub(crate) async fn cancel(self: &Arc<Self>, origin: CancelOrigin) {
        let call_id = self.call_id();
        let status = {
            let mut inner = self.inner.lock();
            let status = inner.machine.cancel(origin);
            if status.is_some() {
                let events = inner.events.take();
                match events {
                    Some(events) if !inner.end_delivered => {
                        let _ = events.send(ServerEvent::Cancelled(origin));
                    }
                    _ => {}
                }
            }
            status
        };

        let Some(status) = status else {
            debug!(%call_id, %origin, "cancel ignored, call already completed");
            return;
        };

        info!(%call_id, method = %self.info.method, %origin, "call cancelled");
        self.cancellation_token.cancel();

        match origin {
            CancelOrigin::Remote => {
                let _ = self
                    .inner
                    .lock()
                    .machine
                    .observe(status, StatusSource::Cancellation);
                self.finish();
            }
            CancelOrigin::Local => {
                if let Err(e) = self.transport.send_cancel() {
                    debug!(%call_id, error = %e, "failed to send cancel");
                }
                let _ = self
                    .inner
                    .lock()
                    .machine
                    .observe(status, StatusSource::Cancellation);
                self.finish();
            }
            CancelOrigin::Deadline | CancelOrigin::Shutdown => {
                dispatch::<SendCancelStatus>(self.clone(), 0, status).await
            }
        }
    }

    /// Close the call with a status decided by the handler or an interceptor.
    fn close_with(self: Arc<Self>, status: Status) -> HookFuture {
        Box::pin(async move {
            let result = self.inner.lock().machine.set_status(status.clone());
            match result {
                Ok(()) => dispatch::<SendStatus>(self, 0, status).await,
                Err(e) => debug!(call_id = self.call_id(), error = %e, "ignoring terminal status"),
            }
        })
    }

    /// The terminal status enters the status hooks. From here on the call
    /// is observed: a later cancellation no longer changes its outcome.
    fn observe_status(&self, status: Status, source: StatusSource) -> Option<Status> {
        let observed = self.inner.lock().machine.observe(status, source);
        if observed.is_none() {
            debug!(call_id = self.call_id(), "status superseded by cancellation");
        }
        observed
    }

    fn emit_status(&self, status: Status) {
        let call_id = self.call_id();
        self.inner.lock().machine.settle(status.clone());
        if let Err(e) = self.transport.send_status(status.clone()) {
            debug!(%call_id, error = %e, "failed to send status");
        }
        info!(%call_id, method = %self.info.method, code = %status.code(), "call completed");
        self.finish();
    }

    fn finish(&self) {
        if let Some(timer) = &self.timer {
            timer.disarm();
        }
        self.inner.lock().events = None;
        self.closed.cancel();
    }

    fn start_handler(self: &Arc<Self>, metadata: Metadata) {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.lock();
            if inner.machine.is_closed() || inner.handler_started {
                return;
            }
            inner.handler_started = true;
            inner.events = Some(tx);
        }

        let call = ServerCall {
            core: self.clone(),
            events: rx,
            metadata,
        };
        let core = self.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let result = handler(call).await;
            core.handler_returned(result).await;
        });
    }

    async fn handler_returned(self: Arc<Self>, result: Result<(), Status>) {
        match result {
            Ok(()) => {
                let state = self.inner.lock().machine.state();
                if matches!(state, CallState::Open | CallState::HalfClosedRemote) {
                    self.close_with(Status::ok()).await;
                }
            }
            Err(status) => {
                debug!(call_id = self.call_id(), %status, "handler returned an error");
                self.close_with(status).await;
            }
        }
    }

    fn deliver(&self, event: ServerEvent) {
        let inner = self.inner.lock();
        match &inner.events {
            Some(events) => {
                let _ = events.send(event);
            }
            None => trace!(call_id = self.call_id(), "no handler listening, dropping event"),
        }
    }

    fn deliver_end(&self) {
        let mut inner = self.inner.lock();
        if inner.machine.cancelled().is_some() {
            return;
        }
        if let Some(events) = &inner.events {
            let _ = events.send(ServerEvent::End);
            inner.end_delivered = true;
        }
    }

    async fn ensure_metadata_sent(self: &Arc<Self>) {
        let first = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.metadata_sent, true)
        };
        if first {
            dispatch::<SendMetadata>(self.clone(), 0, Metadata::new()).await;
        }
    }

    fn send_to_transport(
        &self,
        what: &'static str,
        send: impl FnOnce(&dyn Transport) -> Result<(), TransportError>,
    ) {
        if self.inner.lock().machine.is_observed() {
            trace!(call_id = self.call_id(), what, "call finished, dropping outbound event");
            return;
        }
        if let Err(e) = send(self.transport.as_ref()) {
            debug!(call_id = self.call_id(), what, error = %e, "transport send failed");
        }
    }
}

/// One kind of event travelling through the interceptor chain.
pub(crate) trait Route: 'static {
    type Value: Send + 'static;

    const HOOK: &'static str;

    /// Inbound events are dropped once the call stops accepting them.
    const INBOUND: bool;

    /// Visit interceptors from the last registered to the first.
    const REVERSE: bool;

    fn hook(interception: &Interception) -> Option<&Hook<Self::Value>>;

    /// Runs before the first interceptor. `None` drops the event.
    fn enter(_core: &CallCore, value: Self::Value) -> Option<Self::Value> {
        Some(value)
    }

    /// Where the event goes after the last interceptor.
    fn sink(core: Arc<CallCore>, value: Self::Value) -> HookFuture;

    fn terminate(core: Arc<CallCore>, _step: usize, status: Status) -> HookFuture {
        core.close_with(status)
    }
}

pub(crate) fn dispatch<R: Route>(core: Arc<CallCore>, step: usize, value: R::Value) -> HookFuture {
    Box::pin(async move {
        if R::INBOUND && !core.accepts_inbound() {
            trace!(call_id = core.call_id(), hook = R::HOOK, "dropping inbound event");
            return;
        }

        let value = if step == 0 {
            match R::enter(&core, value) {
                Some(value) => value,
                None => return,
            }
        } else {
            value
        };

        let layers = core.layers.len();
        if step >= layers {
            return R::sink(core, value).await;
        }

        let index = if R::REVERSE { layers - 1 - step } else { step };
        let Some(hook) = R::hook(&core.layers[index]).cloned() else {
            return dispatch::<R>(core, step + 1, value).await;
        };

        let forward_core = core.clone();
        let terminate_core = core.clone();
        let guard = HookGuard::watching();
        let next = Next::new(
            R::HOOK,
            move |value| dispatch::<R>(forward_core, step + 1, value),
            move |status| R::terminate(terminate_core, step, status),
        )
        .guarded_by(guard.clone());
        hook(value, next).await;

        // the call must be closed before the next event is read
        if guard.release() {
            R::terminate(core, step, abandoned_status(R::HOOK)).await;
        }
    })
}

struct Start;

impl Route for Start {
    type Value = ();
    const HOOK: &'static str = "on_start";
    const INBOUND: bool = false;
    const REVERSE: bool = false;

    fn hook(interception: &Interception) -> Option<&Hook<()>> {
        interception.responder.on_start.as_ref()
    }

    fn sink(core: Arc<CallCore>, _: ()) -> HookFuture {
        trace!(call_id = core.call_id(), "call started through the chain");
        Box::pin(async {})
    }
}

struct ReceiveMetadata;

impl Route for ReceiveMetadata {
    type Value = Metadata;
    const HOOK: &'static str = "on_receive_metadata";
    const INBOUND: bool = true;
    const REVERSE: bool = false;

    fn hook(interception: &Interception) -> Option<&Hook<Metadata>> {
        interception.listener.on_receive_metadata.as_ref()
    }

    fn sink(core: Arc<CallCore>, metadata: Metadata) -> HookFuture {
        core.start_handler(metadata);
        Box::pin(async {})
    }
}

struct ReceiveMessage;

impl Route for ReceiveMessage {
    type Value = Message;
    const HOOK: &'static str = "on_receive_message";
    const INBOUND: bool = true;
    const REVERSE: bool = false;

    fn hook(interception: &Interception) -> Option<&Hook<Message>> {
        interception.listener.on_receive_message.as_ref()
    }

    fn sink(core: Arc<CallCore>, message: Message) -> HookFuture {
        core.deliver(ServerEvent::Data(message));
        Box::pin(async {})
    }
}

struct ReceiveHalfClose;

impl Route for ReceiveHalfClose {
    type Value = ();
    const HOOK: &'static str = "on_receive_half_close";
    const INBOUND: bool = true;
    const REVERSE: bool = false;

    fn hook(interception: &Interception) -> Option<&Hook<()>> {
        interception.listener.on_receive_half_close.as_ref()
    }

    fn sink(core: Arc<CallCore>, _: ()) -> HookFuture {
        core.deliver_end();
        Box::pin(async {})
    }
}

struct SendMetadata;

impl Route for SendMetadata {
    type Value = Metadata;
    const HOOK: &'static str = "on_send_metadata";
    const INBOUND: bool = false;
    const REVERSE: bool = true;

    fn hook(interception: &Interception) -> Option<&Hook<Metadata>> {
        interception.responder.on_send_metadata.as_ref()
    }

    fn sink(core: Arc<CallCore>, metadata: Metadata) -> HookFuture {
        core.send_to_transport("metadata", |transport| transport.send_metadata(metadata));
        Box::pin(async {})
    }
}

struct SendMessage;

impl Route for SendMessage {
    type Value = Message;
    const HOOK: &'static str = "on_send_message";
    const INBOUND: bool = false;
    const REVERSE: bool = true;

    fn hook(interception: &Interception) -> Option<&Hook<Message>> {
        interception.responder.on_send_message.as_ref()
    }

    fn sink(core: Arc<CallCore>, message: Message) -> HookFuture {
        if core.is_closed() {
            trace!(call_id = core.call_id(), "call closed, dropping outbound message");
        } else {
            core.send_to_transport("message", |transport| transport.send_message(message));
        }
        Box::pin(async {})
    }
}

/// Status decided by the handler, an interceptor or a half-close.
struct SendStatus;

impl Route for SendStatus {
    type Value = Status;
    const HOOK: &'static str = "on_send_status";
    const INBOUND: bool = false;
    const REVERSE: bool = true;

    fn hook(interception: &Interception) -> Option<&Hook<Status>> {
        interception.responder.on_send_status.as_ref()
    }

    fn enter(core: &CallCore, status: Status) -> Option<Status> {
        core.observe_status(status, StatusSource::Decided)
    }

    fn sink(core: Arc<CallCore>, status: Status) -> HookFuture {
        core.emit_status(status);
        Box::pin(async {})
    }

    // a status hook terminating replaces the status and keeps it moving
    fn terminate(core: Arc<CallCore>, step: usize, status: Status) -> HookFuture {
        dispatch::<Self>(core, step + 1, status)
    }
}

/// Status produced by a deadline or a shutdown.
struct SendCancelStatus;

impl Route for SendCancelStatus {
    type Value = Status;
    const HOOK: &'static str = "on_send_status";
    const INBOUND: bool = false;
    const REVERSE: bool = true;

    fn hook(interception: &Interception) -> Option<&Hook<Status>> {
        interception.responder.on_send_status.as_ref()
    }

    fn enter(core: &CallCore, status: Status) -> Option<Status> {
        core.observe_status(status, StatusSource::Cancellation)
    }

    fn sink(core: Arc<CallCore>, status: Status) -> HookFuture {
        core.emit_status(status);
        Box::pin(async {})
    }

    fn terminate(core: Arc<CallCore>, step: usize, status: Status) -> HookFuture {
        dispatch::<Self>(core, step + 1, status)
    }
}

/// Handle given to the handler of one call.
pub struct ServerCall {
    core: Arc<CallCore>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    metadata: Metadata,
}

impl std::fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCall")
            .field("call_id", &self.core.call_id())
            .field("method", &self.core.info.method)
            .field("state", &self.state())
            .finish()
    }
}

impl ServerCall {
    pub fn call_id(&self) -> u64 {
        self.core.call_id()
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.core.info.method
    }

    /// Request metadata, as left by the interceptors.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.core.info.deadline
    }

    /// Context to hand to child calls made on behalf of this call.
    pub fn context(&self) -> CallContext {
        CallContext::new(
            self.core.call_id(),
            self.core.info.deadline,
            self.core.cancellation_token.clone(),
        )
    }

    pub fn state(&self) -> CallState {
        self.core.inner.lock().machine.state()
    }

    pub fn status(&self) -> Option<Status> {
        self.core.inner.lock().machine.status().cloned()
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancellation_token.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.core.cancellation_token.cancelled().await
    }

    /// Next inbound event. `None` once the call is finished and every
    /// queued event was consumed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub async fn send_metadata(&self, metadata: Metadata) -> Result<(), CallError> {
        {
            let mut inner = self.core.inner.lock();
            inner.machine.write()?;
            if std::mem::replace(&mut inner.metadata_sent, true) {
                return Err(CallError::FailedPrecondition("response metadata already sent"));
            }
        }
        dispatch::<SendMetadata>(self.core.clone(), 0, metadata).await;
        Ok(())
    }

    pub async fn write(&self, message: impl Into<Message>) -> Result<(), CallError> {
        self.core.inner.lock().machine.write()?;
        self.core.ensure_metadata_sent().await;
        dispatch::<SendMessage>(self.core.clone(), 0, message.into()).await;
        Ok(())
    }

    /// Half-close the server side. Once both sides are half-closed the call
    /// completes with OK.
    pub async fn end(&self) -> Result<(), CallError> {
        let transition = self.core.inner.lock().machine.end_local();
        if let Transition::Closed(status) = transition {
            dispatch::<SendStatus>(self.core.clone(), 0, status).await;
        }
        Ok(())
    }

    /// Complete the call with `status`.
    pub async fn send_status(&self, status: Status) -> Result<(), CallError> {
        let result = self.core.inner.lock().machine.set_status(status.clone());
        match result {
            Ok(()) => {
                dispatch::<SendStatus>(self.core.clone(), 0, status).await;
                Ok(())
            }
            Err(e) => {
                warn!(call_id = self.call_id(), error = %e, "status already set");
                Err(e)
            }
        }
    }

    pub async fn cancel(&self) {
        self.core.cancel(CancelOrigin::Local).await;
    }
}
