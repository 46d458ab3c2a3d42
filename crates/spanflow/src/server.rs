//! Background metrics server.
//!
//! The listener is bound synchronously when the server starts, then handed to
//! a spawned accept loop. The loop owns every connection task in a `JoinSet`,
//! so stopping the loop also stops every connection. Completion is published
//! on a watch channel that flips to `true` when the loop has exited, or closes
//! if the task is aborted.

use crate::endpoint::MetricsEndpoint;
use crate::error::{ErrorHandler, ServerError};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` so a persistent failure (e.g. fd exhaustion)
/// does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Source of incoming connections for the accept loop.
pub(crate) trait Accept: Send + 'static {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the spawned metrics server.
pub struct MetricsServer {
    local_addr: Option<SocketAddr>,
    /// Carries the drain deadline to the accept loop. Taken by the first shutdown.
    shutdown_tx: Mutex<Option<oneshot::Sender<Instant>>>,
    task: Mutex<Option<JoinHandle<Result<(), ServerError>>>>,
    closed_rx: watch::Receiver<bool>,
}

impl MetricsServer {
    /// Binds `addr` and starts serving `endpoint` in the background.
    ///
    /// Never fails: a bind failure is reported to `errors` and yields a server
    /// that is already closed. Must be called within a Tokio runtime.
    pub fn start(addr: &str, endpoint: MetricsEndpoint, errors: Arc<dyn ErrorHandler>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);

        let listener = match bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                errors.handle(&err);
                closed_tx.send_replace(true);
                return Self {
                    local_addr: None,
                    shutdown_tx: Mutex::new(None),
                    task: Mutex::new(None),
                    closed_rx,
                };
            }
        };

        let local_addr = listener.local_addr().ok();
        Self::serve_listener(listener, local_addr, endpoint, errors, closed_tx, closed_rx)
    }

    fn serve_listener<L: Accept>(
        listener: L,
        local_addr: Option<SocketAddr>,
        endpoint: MetricsEndpoint,
        errors: Arc<dyn ErrorHandler>,
        closed_tx: watch::Sender<bool>,
        closed_rx: watch::Receiver<bool>,
    ) -> Self {
        info!(addr = ?local_addr, "spanflow metrics server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(
            listener,
            Arc::new(endpoint),
            errors,
            shutdown_rx,
            closed_tx,
        ));

        Self {
            local_addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
            closed_rx,
        }
    }

    /// Address the server is bound to, or `None` if binding failed.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops accepting connections and lets in-flight requests finish until
    /// `deadline`, then abandons whatever is left.
    ///
    /// When this returns the accept loop and all connection tasks are gone.
    /// Calls after the first return `Ok(())` immediately.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), ServerError> {
        let trigger = lock(&self.shutdown_tx).take();
        let Some(trigger) = trigger else {
            return Ok(());
        };
        // A send error means the loop already exited; its join result still
        // says how.
        let _ = trigger.send(deadline);

        let task = lock(&self.task).take();
        let Some(mut task) = task else {
            return Ok(());
        };

        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(ServerError::Task(err.to_string())),
            Err(_) => {
                task.abort();
                let _ = task.await;
                Err(ServerError::DeadlineExceeded)
            }
        }
    }

    /// Resolves once the server has stopped, for whatever reason.
    pub async fn closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        // An error means the sender was dropped with the aborted task.
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    /// Returns `true` once the server has stopped.
    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow() || self.closed_rx.has_changed().is_err()
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };
    let listener = std::net::TcpListener::bind(addr).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;

    let local_addr = listener.local_addr().map_err(bind_err)?;
    TcpListener::from_std(listener).map_err(|source| ServerError::Listener {
        addr: local_addr,
        source,
    })
}

async fn serve<L: Accept>(
    mut listener: L,
    endpoint: Arc<MetricsEndpoint>,
    errors: Arc<dyn ErrorHandler>,
    mut shutdown_rx: oneshot::Receiver<Instant>,
    closed_tx: watch::Sender<bool>,
) -> Result<(), ServerError> {
    let (drain_tx, drain_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    let deadline = loop {
        tokio::select! {
            deadline = &mut shutdown_rx => {
                // Handle dropped without a deadline: abandon connections now.
                break deadline.unwrap_or_else(|_| Instant::now());
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&endpoint),
                        drain_rx.clone(),
                    ));
                }
                Err(err) => {
                    errors.handle(&ServerError::Accept(err));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    };

    drop(listener);
    drain_tx.send_replace(true);
    debug!(connections = connections.len(), "spanflow metrics server draining");

    let result = match tokio::time::timeout_at(deadline, drain(&mut connections)).await {
        Ok(()) => Ok(()),
        Err(_) => {
            warn!(
                connections = connections.len(),
                "abandoning metrics connections at shutdown deadline"
            );
            connections.shutdown().await;
            Err(ServerError::DeadlineExceeded)
        }
    };

    closed_tx.send_replace(true);
    info!("spanflow metrics server stopped");
    result
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<MetricsEndpoint>,
    mut drain_rx: watch::Receiver<bool>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let endpoint = Arc::clone(&endpoint);
        async move { Ok::<_, Infallible>(endpoint.handle(&req)) }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = async { let _ = drain_rx.wait_for(|draining| *draining).await; } => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(err) = result {
        debug!(%peer, error = %err, "metrics connection error");
    }
}
