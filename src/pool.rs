//! Bounded pool of HTTP/1.1 connections to the service origin.
//!
//! The pool lends a connection to exactly one attempt. Admission is a FIFO
//! semaphore with `max_connections` permits; a permit stays attached to the
//! lent connection, so the number of live checkouts never exceeds the limit.
//! Idle connections are parked without a permit and picked up by the next
//! borrower before a new socket is dialed.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::Request;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::body::ReqBody;
use crate::context::{CallContext, Interrupt};
use crate::error::TransportErrorKind;
use crate::metrics::ClientMetrics;
use crate::transport::Transport;
use crate::util::{classify_connect_error, classify_exchange_error, lock_unpoisoned};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Point-in-time view of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub in_use: usize,
    pub idle: usize,
}

impl PoolStatus {
    pub fn available(&self) -> usize {
        self.max_connections.saturating_sub(self.in_use)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PoolOptions {
    pub(crate) max_connections: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) acquire_timeout: Option<Duration>,
    pub(crate) idle_timeout: Duration,
}

#[derive(Debug)]
pub(crate) enum PoolError {
    Interrupted(Interrupt),
    AcquireTimeout(Duration),
    ConnectTimeout(Duration),
    Connect {
        kind: TransportErrorKind,
        source: BoxError,
    },
}

/// A failed exchange on a lent connection.
#[derive(Debug)]
pub(crate) struct SendFailure {
    pub(crate) kind: TransportErrorKind,
    pub(crate) request_sent: bool,
    pub(crate) source: BoxError,
}

struct IdleConnection {
    sender: SendRequest<ReqBody>,
    idle_since: Instant,
}

type IdleList = Arc<Mutex<Vec<IdleConnection>>>;

#[derive(Debug)]
pub(crate) struct ConnectionPool {
    transport: Transport,
    permits: Arc<Semaphore>,
    idle: IdleList,
    options: PoolOptions,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for IdleConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("IdleConnection")
            .field("idle_since", &self.idle_since)
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn new(transport: Transport, options: PoolOptions, metrics: ClientMetrics) -> Self {
        let max_connections = options.max_connections.max(1);
        Self {
            transport,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Arc::new(Mutex::new(Vec::with_capacity(max_connections))),
            options: PoolOptions {
                max_connections,
                ..options
            },
            metrics,
        }
    }

    pub(crate) fn status(&self) -> PoolStatus {
        let max_connections = self.options.max_connections;
        PoolStatus {
            max_connections,
            in_use: max_connections.saturating_sub(self.permits.available_permits()),
            idle: lock_unpoisoned(&self.idle).len(),
        }
    }

    /// Waits for a free slot, then reuses an idle connection or dials a new
    /// one. Both waits honor `context`.
    pub(crate) async fn acquire(&self, context: &CallContext) -> Result<PooledConnection, PoolError> {
        let permit = self.acquire_permit(context).await?;

        while let Some(candidate) = self.pop_idle() {
            let mut sender = candidate.sender;
            let ready = context
                .run(timeout(self.options.connect_timeout, sender.ready()))
                .await
                .map_err(PoolError::Interrupted)?;
            match ready {
                Ok(Ok(())) => {
                    self.metrics.record_connection_reused();
                    debug!("reusing pooled connection");
                    return Ok(self.lend(sender, permit));
                }
                _ => {
                    self.metrics.record_connection_discarded();
                    debug!("discarding stale pooled connection");
                }
            }
        }

        let connect_timeout = self.options.connect_timeout;
        let connected = context
            .run(timeout(connect_timeout, self.transport.connect()))
            .await
            .map_err(PoolError::Interrupted)?;
        match connected {
            Ok(Ok(sender)) => {
                self.metrics.record_connection_opened();
                debug!(origin = %self.transport.origin(), "opened new connection");
                Ok(self.lend(sender, permit))
            }
            Ok(Err(source)) => Err(PoolError::Connect {
                kind: classify_connect_error(source.as_ref()),
                source,
            }),
            Err(_) => Err(PoolError::ConnectTimeout(connect_timeout)),
        }
    }

    async fn acquire_permit(&self, context: &CallContext) -> Result<OwnedSemaphorePermit, PoolError> {
        let permits = Arc::clone(&self.permits);
        let acquired = match self.options.acquire_timeout {
            Some(acquire_timeout) => context
                .run(timeout(acquire_timeout, permits.acquire_owned()))
                .await
                .map_err(PoolError::Interrupted)?
                .map_err(|_| PoolError::AcquireTimeout(acquire_timeout))?,
            None => context
                .run(permits.acquire_owned())
                .await
                .map_err(PoolError::Interrupted)?,
        };
        // The semaphore is owned by the pool and never closed.
        acquired.map_err(|source| PoolError::Connect {
            kind: TransportErrorKind::Other,
            source: Box::new(source),
        })
    }

    fn pop_idle(&self) -> Option<IdleConnection> {
        let mut idle = lock_unpoisoned(&self.idle);
        while let Some(candidate) = idle.pop() {
            if candidate.sender.is_closed()
                || candidate.idle_since.elapsed() >= self.options.idle_timeout
            {
                self.metrics.record_connection_discarded();
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn lend(&self, sender: SendRequest<ReqBody>, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            sender: Some(sender),
            reusable: false,
            idle: Arc::clone(&self.idle),
            metrics: self.metrics.clone(),
            _permit: permit,
        }
    }
}

/// A connection checked out to one attempt.
///
/// Dropping it discards the connection unless it was released as healthy.
/// The idle slot is refilled before the permit is returned, so the next
/// waiter finds the connection parked.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    sender: Option<SendRequest<ReqBody>>,
    reusable: bool,
    idle: IdleList,
    metrics: ClientMetrics,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub(crate) async fn send(
        &mut self,
        request: Request<ReqBody>,
    ) -> Result<http::Response<Incoming>, SendFailure> {
        let Some(sender) = self.sender.as_mut() else {
            return Err(SendFailure {
                kind: TransportErrorKind::Closed,
                request_sent: false,
                source: "connection already released".into(),
            });
        };
        match sender.try_send_request(request).await {
            Ok(response) => Ok(response),
            Err(mut error) => {
                let request_sent = error.take_message().is_none();
                let error = error.into_error();
                Err(SendFailure {
                    kind: classify_exchange_error(&error),
                    request_sent,
                    source: Box::new(error),
                })
            }
        }
    }

    /// Returns the connection; unhealthy connections are closed.
    pub(crate) fn release(mut self, healthy: bool) {
        self.reusable = healthy;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        if self.reusable && !sender.is_closed() {
            lock_unpoisoned(&self.idle).push(IdleConnection {
                sender,
                idle_since: Instant::now(),
            });
        } else {
            self.metrics.record_connection_discarded();
        }
    }
}
