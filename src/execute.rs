use std::future::ready;
use std::time::{Duration, Instant, SystemTime};

use http::header::CONNECTION;
use http::{HeaderMap, Method, StatusCode};
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info_span, warn};

use crate::Result;
use crate::body::{ReadBodyError, build_http_request, origin_form_uri, read_all_body_limited};
use crate::config::{ClientConfig, Endpoint};
use crate::context::{CallContext, Interrupt};
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::pool::{ConnectionPool, PoolError, PoolOptions, PoolStatus, PooledConnection};
use crate::rate_limit::RateLimiter;
use crate::request::RequestDescriptor;
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::stream::{RecordStream, RecordStreamOptions, StreamParts};
use crate::transport::Transport;
use crate::util::{merge_headers, parse_retry_after, service_error_message};

const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Turns an accepted response head into what the caller gets back. Runs
/// under the attempt timeout and inside the retry loop.
trait Delivery {
    type Output: Send;

    fn status(output: &Self::Output) -> StatusCode;

    fn deliver<'a>(
        &'a self,
        executor: &'a Executor,
        parts: StreamParts,
        method: &'a Method,
        uri: &'a str,
    ) -> impl Future<Output = Result<Self::Output>> + Send + 'a;
}

/// Reads the whole body under the client's size limit.
struct Buffered;

impl Delivery for Buffered {
    type Output = Response;

    fn status(output: &Response) -> StatusCode {
        output.status()
    }

    fn deliver<'a>(
        &'a self,
        executor: &'a Executor,
        parts: StreamParts,
        method: &'a Method,
        uri: &'a str,
    ) -> impl Future<Output = Result<Response>> + Send + 'a {
        executor.read_buffered(parts, method, uri)
    }
}

/// Hands the open body to a record stream.
struct Streamed;

impl Delivery for Streamed {
    type Output = StreamParts;

    fn status(output: &StreamParts) -> StatusCode {
        output.status
    }

    fn deliver<'a>(
        &'a self,
        _executor: &'a Executor,
        parts: StreamParts,
        _method: &'a Method,
        _uri: &'a str,
    ) -> impl Future<Output = Result<StreamParts>> + Send + 'a {
        ready(Ok(parts))
    }
}

/// The single execution engine behind both facades.
///
/// Owns the rate limiter and the pool for one client; every clone of a
/// client shares one executor by `Arc`.
#[derive(Debug)]
pub(crate) struct Executor {
    endpoint: Endpoint,
    headers: HeaderMap,
    client_name: String,
    attempt_timeout: Duration,
    total_timeout: Option<Duration>,
    max_response_body_bytes: usize,
    max_record_bytes: usize,
    retry_policy: RetryPolicy,
    rate_limiter: RateLimiter,
    pool: ConnectionPool,
    metrics: ClientMetrics,
}

impl Executor {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let metrics = ClientMetrics::default();
        let transport = Transport::new(endpoint.origin.clone(), config.connect_timeout())?;
        let pool = ConnectionPool::new(
            transport,
            PoolOptions {
                max_connections: config.max_connections(),
                connect_timeout: config.connect_timeout(),
                acquire_timeout: config.pool_acquire_timeout(),
                idle_timeout: config.pool_idle_timeout(),
            },
            metrics.clone(),
        );

        Ok(Self {
            headers: config.request_headers()?,
            endpoint,
            client_name: config.client_name().to_owned(),
            attempt_timeout: config.timeout(),
            total_timeout: config.total_timeout(),
            max_response_body_bytes: config.max_response_body_bytes(),
            max_record_bytes: config.max_record_bytes(),
            retry_policy: config.retry_policy(),
            rate_limiter: RateLimiter::new(config.rate_limit_policy()),
            pool,
            metrics,
        })
    }

    pub(crate) fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub(crate) async fn execute(&self, descriptor: &RequestDescriptor) -> Result<Response> {
        let context = self.call_context(descriptor);
        let (response, attempts) = self.run(descriptor, &context, &Buffered).await?;
        Ok(response.with_attempts(attempts))
    }

    pub(crate) async fn stream(&self, descriptor: &RequestDescriptor) -> Result<RecordStream> {
        let context = self.call_context(descriptor);
        let (parts, attempts) = self.run(descriptor, &context, &Streamed).await?;
        let path = descriptor.path_with_query(&self.endpoint.base_path);
        Ok(RecordStream::new(
            parts,
            &context,
            RecordStreamOptions {
                method: descriptor.method().clone(),
                uri: self.endpoint.display_uri(&path),
                attempts,
                max_record_bytes: self.max_record_bytes,
                read_timeout: descriptor.timeout().unwrap_or(self.attempt_timeout),
            },
        ))
    }

    /// The context one execution runs under. A descriptor's own budget starts
    /// now; the client default applies only when no deadline is set at all.
    fn call_context(&self, descriptor: &RequestDescriptor) -> CallContext {
        let context = descriptor.context().clone();
        if let Some(total_timeout) = descriptor.total_timeout() {
            return context.timeout(total_timeout);
        }
        match (context.deadline_at(), self.total_timeout) {
            (None, Some(total_timeout)) => context.timeout(total_timeout),
            _ => context,
        }
    }

    async fn run<D: Delivery>(
        &self,
        descriptor: &RequestDescriptor,
        context: &CallContext,
        delivery: &D,
    ) -> Result<(D::Output, usize)> {
        let started = Instant::now();
        let _in_flight = self.metrics.record_call_started();
        let result = self.run_attempts(descriptor, context, delivery).await;
        match &result {
            Ok((output, _)) => self
                .metrics
                .record_call_succeeded(D::status(output).as_u16(), started.elapsed()),
            Err(error) => self.metrics.record_call_failed(error, started.elapsed()),
        }
        result
    }

    async fn run_attempts<D: Delivery>(
        &self,
        descriptor: &RequestDescriptor,
        context: &CallContext,
        delivery: &D,
    ) -> Result<(D::Output, usize)> {
        let method = descriptor.method().clone();
        let path = descriptor.path_with_query(&self.endpoint.base_path);
        let target = origin_form_uri(&path)?;
        let uri = self.endpoint.display_uri(&path);
        let headers = merge_headers(&self.headers, descriptor.headers());
        let attempt_timeout = descriptor.timeout().unwrap_or(self.attempt_timeout);
        let max_attempts = self.retry_policy.max_attempts();
        let mut state = RetryState::new(
            method.clone(),
            uri.clone(),
            descriptor.is_idempotent(),
            context.deadline_at(),
        );

        loop {
            if let Err(interrupt) = context.check() {
                return Err(self.interrupted(interrupt, &state, false));
            }

            let request = build_http_request(
                method.clone(),
                target.clone(),
                &self.endpoint.host,
                &headers,
                descriptor.body(),
            )?;

            match self.rate_limiter.acquire(context).await {
                Ok(true) => self.metrics.record_rate_limit_wait(),
                Ok(false) => {}
                Err(interrupt) => return Err(self.interrupted(interrupt, &state, false)),
            }

            let connection = match self.pool.acquire(context).await {
                Ok(connection) => Ok(connection),
                Err(PoolError::Interrupted(interrupt)) => {
                    return Err(self.interrupted(interrupt, &state, false));
                }
                Err(PoolError::AcquireTimeout(limit)) => {
                    return Err(timeout_error(TimeoutPhase::PoolAcquire, limit, &method, &uri));
                }
                Err(PoolError::ConnectTimeout(limit)) => {
                    Err(timeout_error(TimeoutPhase::Connect, limit, &method, &uri))
                }
                Err(PoolError::Connect { kind, source }) => Err(Error::ConnectionFailure {
                    kind,
                    method: method.clone(),
                    uri: uri.clone(),
                    request_sent: false,
                    source,
                }),
            };

            let attempt = state.begin_attempt();
            self.metrics.record_attempt();
            let span = info_span!(
                "sekha.attempt",
                client = %self.client_name,
                method = %method,
                uri = %uri,
                attempt = attempt,
                max_attempts = max_attempts
            );

            let error = match connection {
                Err(error) => error,
                Ok(connection) => {
                    let exchange = self.exchange(connection, request, delivery, &method, &uri);
                    let outcome = context
                        .run(timeout(attempt_timeout, exchange))
                        .instrument(span.clone())
                        .await;
                    match outcome {
                        Ok(Ok(Ok(output))) => return Ok((output, attempt)),
                        Ok(Ok(Err(error))) => error,
                        Ok(Err(_elapsed)) => {
                            timeout_error(TimeoutPhase::Attempt, attempt_timeout, &method, &uri)
                        }
                        Err(interrupt) => return Err(self.interrupted(interrupt, &state, true)),
                    }
                }
            };

            match self.retry_policy.decide(error, &mut state) {
                RetryDecision::Retry { after, error } => {
                    span.in_scope(|| {
                        warn!(
                            delay_ms = after.as_millis() as u64,
                            error = %error,
                            "retrying request"
                        );
                    });
                    self.metrics.record_retry();
                    if let Err(interrupt) = context.run(sleep(after)).await {
                        return Err(self.interrupted(interrupt, &state, false));
                    }
                }
                RetryDecision::GiveUp(error) => return Err(error),
            }
        }
    }

    async fn exchange<D: Delivery>(
        &self,
        mut connection: PooledConnection,
        request: http::Request<crate::body::ReqBody>,
        delivery: &D,
        method: &Method,
        uri: &str,
    ) -> Result<D::Output> {
        debug!("sending request");
        let response = connection
            .send(request)
            .await
            .map_err(|failure| Error::ConnectionFailure {
                kind: failure.kind,
                method: method.clone(),
                uri: uri.to_owned(),
                request_sent: failure.request_sent,
                source: failure.source,
            })?;
        let (parts, body) = response.into_parts();
        let keep_alive = !wants_connection_close(&parts.headers);
        let status = parts.status;

        if status.is_client_error() || status.is_server_error() {
            let message = match read_all_body_limited(body, MAX_ERROR_BODY_BYTES).await {
                Ok(bytes) => {
                    connection.release(keep_alive);
                    service_error_message(&bytes)
                }
                Err(_) => status.canonical_reason().unwrap_or_default().to_owned(),
            };
            return Err(self.status_error(status, &parts.headers, message, method, uri));
        }

        let accepted = StreamParts {
            status,
            headers: parts.headers,
            body,
            connection,
            keep_alive,
        };
        delivery.deliver(self, accepted, method, uri).await
    }

    async fn read_buffered(&self, parts: StreamParts, method: &Method, uri: &str) -> Result<Response> {
        let StreamParts {
            status,
            headers,
            body,
            connection,
            keep_alive,
        } = parts;
        let bytes = read_all_body_limited(body, self.max_response_body_bytes)
            .await
            .map_err(|error| match error {
                ReadBodyError::Read(source) => Error::ConnectionFailure {
                    kind: TransportErrorKind::Read,
                    method: method.clone(),
                    uri: uri.to_owned(),
                    request_sent: true,
                    source: Box::new(source),
                },
                ReadBodyError::TooLarge { actual_bytes } => Error::ResponseBodyTooLarge {
                    limit_bytes: self.max_response_body_bytes,
                    actual_bytes,
                    method: method.clone(),
                    uri: uri.to_owned(),
                },
            })?;
        connection.release(keep_alive);
        Ok(Response::new(status, headers, bytes, 0))
    }

    fn status_error(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        message: String,
        method: &Method,
        uri: &str,
    ) -> Error {
        let method = method.clone();
        let uri = uri.to_owned();
        match status.as_u16() {
            429 => {
                let retry_after = parse_retry_after(headers, SystemTime::now());
                if let Some(delay) = retry_after {
                    self.rate_limiter.observe_server_throttle(delay);
                }
                Error::RateLimited {
                    method,
                    uri,
                    retry_after,
                    message,
                }
            }
            status @ (401 | 403) => Error::AuthenticationFailure {
                status,
                method,
                uri,
                message,
            },
            status @ 400..=499 => Error::ClientRejected {
                status,
                method,
                uri,
                message,
            },
            status => Error::ServerFailure {
                status,
                method,
                uri,
                message,
            },
        }
    }

    /// Maps a fired context to the caller-facing error. `in_flight` is set
    /// when the signal cut an exchange short.
    fn interrupted(&self, interrupt: Interrupt, state: &RetryState, in_flight: bool) -> Error {
        let (method, uri) = state.target();
        match interrupt {
            Interrupt::Cancelled => Error::Cancelled {
                method: method.clone(),
                uri: uri.to_owned(),
                attempts: state.attempts(),
                outcome_unknown: in_flight,
            },
            Interrupt::DeadlineExceeded => {
                let deadline = Error::Timeout {
                    phase: TimeoutPhase::Deadline,
                    timeout_ms: state.elapsed().as_millis(),
                    method: method.clone(),
                    uri: uri.to_owned(),
                };
                if in_flight && !state.is_idempotent() {
                    Error::AmbiguousOutcome {
                        method: method.clone(),
                        uri: uri.to_owned(),
                        attempts: state.attempts(),
                        source: Box::new(deadline),
                    }
                } else {
                    deadline
                }
            }
        }
    }
}

fn timeout_error(phase: TimeoutPhase, limit: Duration, method: &Method, uri: &str) -> Error {
    Error::Timeout {
        phase,
        timeout_ms: limit.as_millis(),
        method: method.clone(),
        uri: uri.to_owned(),
    }
}

fn wants_connection_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
