//! Error types and the background error sink.

use opentelemetry::trace::TraceError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`FlowProcessor::shutdown`](crate::FlowProcessor::shutdown).
///
/// Cheap to clone: every caller waiting on one shutdown receives the same
/// outcome.
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The caller's deadline elapsed before the metrics server stopped.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The wrapped span processor failed to shut down.
    #[error("downstream span processor: {0}")]
    Downstream(#[source] Arc<TraceError>),

    /// The metrics server failed to shut down cleanly.
    #[error("metrics server: {0}")]
    MetricsServer(#[source] Arc<ServerError>),

    /// The shutdown task panicked or was cancelled.
    #[error("shutdown task failed: {0}")]
    Task(String),

    /// A blocking shutdown was requested on a current-thread runtime, which
    /// cannot make progress while blocked. The shutdown keeps running in the
    /// background; await [`FlowProcessor::shutdown`](crate::FlowProcessor::shutdown)
    /// for its outcome.
    #[error("cannot block on a current-thread runtime")]
    WouldBlock,
}

impl ProcessorError {
    /// Returns `true` if this error means the deadline elapsed.
    #[inline]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }
}

impl From<ServerError> for ProcessorError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::DeadlineExceeded => Self::DeadlineExceeded,
            other => Self::MetricsServer(Arc::new(other)),
        }
    }
}

impl From<TraceError> for ProcessorError {
    fn from(err: TraceError) -> Self {
        Self::Downstream(Arc::new(err))
    }
}

impl From<ProcessorError> for TraceError {
    fn from(err: ProcessorError) -> Self {
        TraceError::Other(Box::new(err))
    }
}

/// Errors raised by the background metrics server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket could not be handed to the runtime.
    #[error("failed to register listener {addr}: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// The server task panicked or was cancelled.
    #[error("server task failed: {0}")]
    Task(String),

    /// In-flight connections were still open when the deadline elapsed.
    #[error("deadline exceeded while draining connections")]
    DeadlineExceeded,
}

/// Sink for errors that happen outside any caller's control, such as a
/// listener failing after `wrap` has already returned.
///
/// Reporting is fire-and-forget; implementations must not block.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: &ServerError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ServerError) + Send + Sync,
{
    fn handle(&self, err: &ServerError) {
        self(err);
    }
}

/// Default [`ErrorHandler`]: logs every error at `ERROR` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle(&self, err: &ServerError) {
        tracing::error!(error = %err, "spanflow metrics server error");
    }
}
