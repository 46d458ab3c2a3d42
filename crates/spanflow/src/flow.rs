//! The flow decorator.
//!
//! [`FlowProcessor`] wraps any OpenTelemetry [`SpanProcessor`], counts every
//! span it sees start and end, and serves those counts on a metrics
//! endpoint. Every call is forwarded to the wrapped processor unchanged.

use crate::config::FlowConfig;
use crate::counter::{SpanCounter, SpanState};
use crate::endpoint::MetricsEndpoint;
use crate::error::{ErrorHandler, ProcessorError, ServerError, TracingErrorHandler};
use crate::server::MetricsServer;
use opentelemetry::trace::{Span as _, TraceError, TraceResult};
use opentelemetry::Context;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::trace::{Span, SpanProcessor};
use opentelemetry_sdk::Resource;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio::time::Instant;

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const SHUT_DOWN: u8 = 2;

/// Lifecycle of a [`FlowProcessor`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Shutdown,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            RUNNING => Self::Running,
            SHUTTING_DOWN => Self::ShuttingDown,
            _ => Self::Shutdown,
        }
    }
}

/// Outcome of the one shutdown a processor runs; `None` while it is running.
type Outcome = Option<Result<(), ProcessorError>>;

/// Span processor decorator that reports telemetry flow.
pub struct FlowProcessor<P> {
    wrapped: Arc<P>,
    counter: Arc<SpanCounter>,
    server: Arc<MetricsServer>,
    state: Arc<AtomicU8>,
    runtime: Handle,
    shutdown_timeout: Duration,
    outcome: Mutex<Option<watch::Receiver<Outcome>>>,
}

impl<P: SpanProcessor + 'static> FlowProcessor<P> {
    /// Wraps `downstream` and starts the metrics server on
    /// `config.listen_address`.
    ///
    /// Server failures after this returns (including a failed bind) are
    /// logged through [`TracingErrorHandler`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn wrap(downstream: P, config: FlowConfig) -> Self {
        Self::wrap_with_error_handler(downstream, config, Arc::new(TracingErrorHandler))
    }

    /// Like [`wrap`](Self::wrap), reporting background server failures to
    /// `errors`.
    pub fn wrap_with_error_handler(
        downstream: P,
        config: FlowConfig,
        errors: Arc<dyn ErrorHandler>,
    ) -> Self {
        let counter = Arc::new(SpanCounter::new());
        let endpoint = MetricsEndpoint::new(Arc::clone(&counter));
        let server = MetricsServer::start(&config.bind_address(), endpoint, errors);

        Self {
            wrapped: Arc::new(downstream),
            counter,
            server: Arc::new(server),
            state: Arc::new(AtomicU8::new(RUNNING)),
            runtime: Handle::current(),
            shutdown_timeout: config.shutdown_timeout,
            outcome: Mutex::new(None),
        }
    }

    /// The span counters this processor maintains.
    pub fn counter(&self) -> &Arc<SpanCounter> {
        &self.counter
    }

    /// Address the metrics server is bound to, or `None` if binding failed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The wrapped processor.
    pub fn downstream(&self) -> &P {
        &self.wrapped
    }

    /// Shuts the metrics server and the wrapped processor down concurrently.
    ///
    /// A downstream error is returned in preference to a server error. If the
    /// deadline elapses before the server has stopped, the server's error (or
    /// [`ProcessorError::DeadlineExceeded`]) is returned without waiting for
    /// downstream, which keeps honoring its own timeouts.
    ///
    /// Only one shutdown ever runs. Callers that arrive while it is running
    /// wait for it and receive its outcome; calls after it has completed
    /// return `Ok(())`. Dropping the returned future does not cancel the
    /// shutdown.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), ProcessorError> {
        let Some(mut outcome) = self.begin_shutdown(deadline) else {
            tracing::debug!("flow processor already shut down");
            return Ok(());
        };

        let resolved = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| Option::clone(&outcome));
        match resolved {
            Ok(Some(result)) => result,
            _ => Err(ProcessorError::Task(
                "shutdown task ended without an outcome".to_string(),
            )),
        }
    }

    /// [`shutdown`](Self::shutdown) with a deadline `timeout` from now.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), ProcessorError> {
        self.shutdown(Instant::now() + timeout).await
    }

    /// Starts the shutdown if none has started yet. Returns `None` once it
    /// has completed.
    fn begin_shutdown(&self, deadline: Instant) -> Option<watch::Receiver<Outcome>> {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = slot.as_ref() {
            return outcome.borrow().is_none().then(|| outcome.clone());
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        self.state.store(SHUTTING_DOWN, Ordering::Release);

        let wrapped = Arc::clone(&self.wrapped);
        let server = Arc::clone(&self.server);
        let state = Arc::clone(&self.state);
        self.runtime.spawn(async move {
            let result = shutdown_all(wrapped, &server, deadline).await;
            state.store(SHUT_DOWN, Ordering::Release);
            outcome_tx.send_replace(Some(result));
        });

        *slot = Some(outcome_rx.clone());
        Some(outcome_rx)
    }

    /// Blocking shutdown for the SDK's synchronous `SpanProcessor::shutdown`.
    fn shutdown_blocking(&self) -> Result<(), ProcessorError> {
        let deadline = Instant::now() + self.shutdown_timeout;
        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                // Blocking here would stall the runtime the server runs on.
                let _ = self.begin_shutdown(deadline);
                tracing::warn!("flow processor shutdown continues in the background");
                Err(ProcessorError::WouldBlock)
            }
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(self.shutdown(deadline))),
            Err(_) => self.runtime.block_on(self.shutdown(deadline)),
        }
    }
}

async fn shutdown_all<P: SpanProcessor + 'static>(
    wrapped: Arc<P>,
    server: &MetricsServer,
    deadline: Instant,
) -> Result<(), ProcessorError> {
    let downstream = tokio::task::spawn_blocking(move || wrapped.shutdown());

    let server_result = server.shutdown(deadline).await;
    let server_stopped = match &server_result {
        Err(ServerError::DeadlineExceeded) => false,
        _ => tokio::time::timeout_at(deadline, server.closed())
            .await
            .is_ok(),
    };

    if server_stopped {
        resolve_shutdown(downstream.await, server_result)
    } else {
        Err(server_result.err().map_or(ProcessorError::DeadlineExceeded, Into::into))
    }
}

/// Picks the error reported by a completed shutdown: downstream first, then
/// the server.
fn resolve_shutdown(
    downstream: Result<TraceResult<()>, JoinError>,
    server: Result<(), ServerError>,
) -> Result<(), ProcessorError> {
    let downstream = downstream.unwrap_or_else(|err| {
        Err(TraceError::from(format!(
            "downstream shutdown task failed: {err}"
        )))
    });

    match (downstream, server) {
        (Err(err), _) => Err(err.into()),
        (Ok(()), Err(err)) => Err(err.into()),
        (Ok(()), Ok(())) => Ok(()),
    }
}

impl<P: SpanProcessor + 'static> SpanProcessor for FlowProcessor<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        if self.state() != LifecycleState::Running {
            tracing::debug!(
                span_id = %span.span_context().span_id(),
                "span started after shutdown began"
            );
        }
        self.counter.increment(SpanState::Started);
        self.wrapped.on_start(span, cx);
    }

    fn on_end(&self, span: SpanData) {
        self.counter.increment(SpanState::Ended);
        self.wrapped.on_end(span);
    }

    fn force_flush(&self) -> TraceResult<()> {
        self.wrapped.force_flush()
    }

    /// Blocks until [`FlowProcessor::shutdown`] completes, using the
    /// configured shutdown timeout as the deadline.
    ///
    /// On a current-thread runtime this cannot block; it starts the shutdown
    /// in the background and returns [`ProcessorError::WouldBlock`].
    fn shutdown(&self) -> TraceResult<()> {
        self.shutdown_blocking().map_err(TraceError::from)
    }

    fn set_resource(&mut self, resource: &Resource) {
        match Arc::get_mut(&mut self.wrapped) {
            Some(wrapped) => wrapped.set_resource(resource),
            None => tracing::debug!("resource not forwarded: downstream is shared"),
        }
    }
}

impl<P: fmt::Debug> fmt::Debug for FlowProcessor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowProcessor")
            .field("wrapped", &self.wrapped)
            .field("local_addr", &self.server.local_addr())
            .field("state", &LifecycleState::from_u8(self.state.load(Ordering::Acquire)))
            .finish_non_exhaustive()
    }
}
