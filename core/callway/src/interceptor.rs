// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Server-side call interception.
//!
//! An [`Interceptor`] is asked once per call for an [`Interception`]: a
//! [`Listener`] with hooks on inbound events and a [`Responder`] with hooks on
//! outbound events. Inbound events visit interceptors in registration order
//! before reaching the handler. Outbound events visit them in reverse order
//! before reaching the transport, so the first registered interceptor is the
//! outermost one.
//!
//! Every hook receives the event value and a [`Next`] continuation. The hook
//! either forwards a (possibly modified) value downstream or terminates the
//! call with a status. A hook that does neither closes the call with INTERNAL.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::error;

use crate::common::{Message, MethodDescriptor};
use crate::deadline::Deadline;
use crate::metadata::Metadata;
use crate::status::Status;

pub type HookFuture = BoxFuture<'static, ()>;

pub type Hook<T> = Arc<dyn Fn(T, Next<T>) -> HookFuture + Send + Sync>;

type Continuation<T> = Box<dyn FnOnce(T) -> HookFuture + Send>;

#[derive(Debug)]
struct GuardState {
    watched: bool,
    abandoned: bool,
}

/// Links a [`Next`] to the dispatcher awaiting its hook. While the dispatcher
/// watches, a continuation dropped unresolved is reported back to it instead
/// of closing the call from a detached task.
#[derive(Debug, Clone)]
pub(crate) struct HookGuard(Arc<Mutex<GuardState>>);

impl HookGuard {
    pub(crate) fn watching() -> Self {
        HookGuard(Arc::new(Mutex::new(GuardState {
            watched: true,
            abandoned: false,
        })))
    }

    /// Stop watching. Returns true if the continuation was dropped unresolved
    /// while watched: the caller must close the call.
    pub(crate) fn release(&self) -> bool {
        let mut state = self.0.lock();
        state.watched = false;
        state.abandoned
    }

    fn abandon(&self) -> bool {
        let mut state = self.0.lock();
        if state.watched {
            state.abandoned = true;
        }
        state.watched
    }
}

/// Status closing a call whose hook neither forwarded nor terminated.
pub(crate) fn abandoned_status(hook: &str) -> Status {
    Status::internal(format!(
        "interceptor hook {hook} neither forwarded nor terminated"
    ))
}

/// Continuation handed to a hook. Consumed by [`Next::forward`] or
/// [`Next::terminate`].
pub struct Next<T> {
    hook: &'static str,
    forward: Option<Continuation<T>>,
    terminate: Option<Continuation<Status>>,
    guard: Option<HookGuard>,
}

impl<T: Send + 'static> Next<T> {
    pub(crate) fn new<F, G>(hook: &'static str, forward: F, terminate: G) -> Self
    where
        F: FnOnce(T) -> HookFuture + Send + 'static,
        G: FnOnce(Status) -> HookFuture + Send + 'static,
    {
        Next {
            hook,
            forward: Some(Box::new(forward)),
            terminate: Some(Box::new(terminate)),
            guard: None,
        }
    }

    pub(crate) fn guarded_by(mut self, guard: HookGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Pass `value` to the next interceptor, or to the handler / transport
    /// at the end of the chain.
    pub async fn forward(mut self, value: T) {
        self.terminate = None;
        if let Some(forward) = self.forward.take() {
            forward(value).await;
        }
    }

    /// Stop the event here and close the call with `status`. Downstream
    /// interceptors and the handler never see the event. Inside an
    /// `on_send_status` hook this replaces the status being sent.
    pub async fn terminate(mut self, status: Status) {
        self.forward = None;
        if let Some(terminate) = self.terminate.take() {
            terminate(status).await;
        }
    }

    pub fn hook(&self) -> &'static str {
        self.hook
    }
}

impl<T> Drop for Next<T> {
    fn drop(&mut self) {
        if self.forward.take().is_none() {
            return;
        }
        let Some(terminate) = self.terminate.take() else {
            return;
        };

        error!(hook = self.hook, "interceptor hook dropped its continuation");
        if self.guard.as_ref().is_some_and(HookGuard::abandon) {
            return;
        }

        // nobody awaits the hook any more
        let status = abandoned_status(self.hook);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(terminate(status));
            }
            Err(_) => error!(hook = self.hook, "no runtime available to close the call"),
        }
    }
}

impl<T> fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("hook", &self.hook)
            .field("resolved", &self.forward.is_none())
            .finish()
    }
}

fn value_hook<T, F, Fut>(hook: F) -> Hook<T>
where
    T: 'static,
    F: Fn(T, Next<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value: T, next: Next<T>| -> HookFuture {
        Box::pin(hook(value, next))
    })
}

fn unit_hook<F, Fut>(hook: F) -> Hook<()>
where
    F: Fn(Next<()>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |(): (), next: Next<()>| -> HookFuture { Box::pin(hook(next)) })
}

/// Inbound hooks. Missing hooks pass events through.
#[derive(Clone, Default)]
pub struct Listener {
    pub(crate) on_receive_metadata: Option<Hook<Metadata>>,
    pub(crate) on_receive_message: Option<Hook<Message>>,
    pub(crate) on_receive_half_close: Option<Hook<()>>,
}

impl Listener {
    pub fn builder() -> ListenerBuilder {
        ListenerBuilder::default()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("on_receive_metadata", &self.on_receive_metadata.is_some())
            .field("on_receive_message", &self.on_receive_message.is_some())
            .field("on_receive_half_close", &self.on_receive_half_close.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ListenerBuilder {
    listener: Listener,
}

impl ListenerBuilder {
    pub fn on_receive_metadata<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Metadata, Next<Metadata>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listener.on_receive_metadata = Some(value_hook(hook));
        self
    }

    pub fn on_receive_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Message, Next<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listener.on_receive_message = Some(value_hook(hook));
        self
    }

    pub fn on_receive_half_close<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Next<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.listener.on_receive_half_close = Some(unit_hook(hook));
        self
    }

    pub fn build(self) -> Listener {
        self.listener
    }
}

/// Outbound hooks. Missing hooks pass events through.
#[derive(Clone, Default)]
pub struct Responder {
    pub(crate) on_start: Option<Hook<()>>,
    pub(crate) on_send_metadata: Option<Hook<Metadata>>,
    pub(crate) on_send_message: Option<Hook<Message>>,
    pub(crate) on_send_status: Option<Hook<Status>>,
}

impl Responder {
    pub fn builder() -> ResponderBuilder {
        ResponderBuilder::default()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("on_start", &self.on_start.is_some())
            .field("on_send_metadata", &self.on_send_metadata.is_some())
            .field("on_send_message", &self.on_send_message.is_some())
            .field("on_send_status", &self.on_send_status.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct ResponderBuilder {
    responder: Responder,
}

impl ResponderBuilder {
    /// Runs once when the call enters the chain, before any inbound event.
    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Next<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.responder.on_start = Some(unit_hook(hook));
        self
    }

    pub fn on_send_metadata<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Metadata, Next<Metadata>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.responder.on_send_metadata = Some(value_hook(hook));
        self
    }

    pub fn on_send_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Message, Next<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.responder.on_send_message = Some(value_hook(hook));
        self
    }

    pub fn on_send_status<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Status, Next<Status>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.responder.on_send_status = Some(value_hook(hook));
        self
    }

    pub fn build(self) -> Responder {
        self.responder
    }
}

/// The hooks one interceptor contributes to one call.
#[derive(Debug, Clone, Default)]
pub struct Interception {
    pub(crate) listener: Listener,
    pub(crate) responder: Responder,
}

impl Interception {
    pub fn new(listener: Listener, responder: Responder) -> Self {
        Interception {
            listener,
            responder,
        }
    }

    /// An interception that observes nothing.
    pub fn pass_through() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: Listener) -> Self {
        Self::new(listener, Responder::default())
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self::new(Listener::default(), responder)
    }
}

/// What an interceptor knows about a call when it is asked to intercept it.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: u64,
    pub method: MethodDescriptor,
    pub deadline: Option<Deadline>,
}

pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, call: &CallInfo) -> Interception;
}

impl<F> Interceptor for F
where
    F: Fn(&CallInfo) -> Interception + Send + Sync + 'static,
{
    fn intercept(&self, call: &CallInfo) -> Interception {
        self(call)
    }
}
