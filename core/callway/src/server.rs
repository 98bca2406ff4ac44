// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::TIMEOUT_KEY;
use crate::config::ServerConfig;
use crate::deadline::{self, parse_timeout};
use crate::error::ServerError;
use crate::interceptor::{CallInfo, Interceptor};
use crate::server_call::{CallCore, Handler, HandlerFuture, ServerCall};
use crate::status::Status;
use crate::transport::{Frame, RawCall};

#[derive(Default)]
pub struct ServerBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    config: ServerConfig,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor. The first one added is the outermost.
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Server
    where
        F: Fn(ServerCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |call: ServerCall| -> HandlerFuture { Box::pin(handler(call)) });
        let (drain_signal, drain_watch) = drain::channel();

        Server {
            inner: Arc::new(ServerInner {
                interceptors: self.interceptors,
                handler,
                config: self.config,
                next_call_id: AtomicU64::new(1),
                serving: AtomicBool::new(false),
                cancellation_token: RwLock::new(CancellationToken::new()),
                drain_signal: RwLock::new(Some(drain_signal)),
                drain_watch: RwLock::new(Some(drain_watch)),
            }),
        }
    }
}

struct ServerInner {
    interceptors: Vec<Arc<dyn Interceptor>>,
    handler: Handler,
    config: ServerConfig,
    next_call_id: AtomicU64,
    serving: AtomicBool,
    cancellation_token: RwLock<CancellationToken>,
    drain_signal: RwLock<Option<drain::Signal>>,
    drain_watch: RwLock<Option<drain::Watch>>,
}

/// Runs a handler, wrapped by the configured interceptors, for every call
/// received from the transport.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("interceptors", &self.inner.interceptors.len())
            .field("config", &self.inner.config)
            .field("serving", &self.inner.serving.load(Ordering::Relaxed))
            .finish()
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Accept calls from `incoming` until [`Server::shutdown`] is called or
    /// the channel is closed. Every call runs in its own task.
    pub async fn serve(&self, incoming: &mut mpsc::Receiver<RawCall>) -> Result<(), ServerError> {
        if self.inner.serving.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyServing);
        }

        let token = self.inner.cancellation_token.read().clone();
        info!(
            interceptors = self.inner.interceptors.len(),
            "server running, waiting for calls"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("shutdown signal received");
                    break;
                }
                raw = incoming.recv() => {
                    let Some(raw) = raw else {
                        info!("incoming call channel closed");
                        break;
                    };

                    let watch = self.inner.drain_watch.read().clone();
                    match watch {
                        Some(watch) => {
                            let inner = self.inner.clone();
                            tokio::spawn(async move { inner.handle_call(raw, watch).await });
                        }
                        None => {
                            warn!(method = %raw.method, "refusing call while draining");
                            if let Err(e) = raw
                                .transport
                                .send_status(Status::unavailable("server is shutting down"))
                            {
                                debug!(method = %raw.method, error = %e, "failed to send status");
                            }
                        }
                    }
                }
            }
        }

        self.inner.serving.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop accepting calls and cancel the ones in flight with UNAVAILABLE,
    /// waiting at most the configured drain timeout for them to finish. The
    /// server can serve again afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down server");
        self.inner.cancellation_token.read().cancel();

        let signal = self.inner.drain_signal.write().take();
        drop(self.inner.drain_watch.write().take());

        if let Some(signal) = signal {
            debug!("draining in-flight calls");
            match time::timeout(self.inner.config.drain_timeout(), signal.drain()).await {
                Ok(()) => info!("all calls drained"),
                Err(_) => warn!(
                    timeout = ?self.inner.config.drain_timeout(),
                    "timeout waiting for calls to drain"
                ),
            }
        }

        // re-arm
        let (signal, watch) = drain::channel();
        *self.inner.drain_signal.write() = Some(signal);
        *self.inner.drain_watch.write() = Some(watch);
        *self.inner.cancellation_token.write() = CancellationToken::new();
    }
}

impl ServerInner {
    async fn handle_call(self: Arc<Self>, raw: RawCall, watch: drain::Watch) {
        let RawCall {
            method,
            transport,
            mut inbound,
        } = raw;
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);

        let first = tokio::select! {
            frame = inbound.recv() => frame,
            _ = watch.clone().signaled() => {
                if let Err(e) = transport.send_status(Status::unavailable("server is shutting down")) {
                    debug!(%call_id, %method, error = %e, "failed to send status");
                }
                return;
            }
        };

        let mut metadata = match first {
            Some(Frame::Metadata(metadata)) => metadata,
            Some(Frame::Cancel) | None => {
                debug!(%call_id, %method, "call abandoned before metadata");
                return;
            }
            Some(frame) => {
                warn!(%call_id, %method, frame = frame.kind(), "call did not start with metadata");
                if let Err(e) =
                    transport.send_status(Status::internal("expected metadata as first frame"))
                {
                    debug!(%call_id, %method, error = %e, "failed to send status");
                }
                return;
            }
        };

        let timeout = metadata
            .remove(TIMEOUT_KEY)
            .and_then(|values| values.into_iter().next())
            .and_then(|value| match parse_timeout(&value) {
                Ok(timeout) => Some(timeout),
                Err(e) => {
                    warn!(%call_id, error = %e, "ignoring timeout");
                    None
                }
            })
            .or(self.config.default_timeout())
            .map(|timeout| timeout.min(self.config.max_timeout()));

        let info = CallInfo {
            call_id,
            method,
            deadline: deadline::resolve(None, timeout),
        };
        let layers = self
            .interceptors
            .iter()
            .map(|interceptor| interceptor.intercept(&info))
            .collect();

        info!(
            %call_id,
            method = %info.method,
            kind = info.method.kind().as_str(),
            timeout_ms =
                timeout.map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
            "call started"
        );

        CallCore::new(info, layers, transport, self.handler.clone())
            .run(metadata, inbound, watch)
            .await;
    }
}
