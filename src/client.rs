use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::Method;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::blocking::BlockingClient;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::execute::Executor;
use crate::metrics::ClientMetricsSnapshot;
use crate::pool::PoolStatus;
use crate::rate_limit::RateLimitPolicy;
use crate::request::{RequestBuilder, RequestDescriptor};
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::stream::RecordStream;
use crate::util::{parse_header_name, parse_header_value};

/// Async client for the memory service.
///
/// Cloning is cheap; clones share one rate limiter, one connection pool and
/// one set of metrics.
#[derive(Clone, Debug)]
pub struct Client {
    executor: Arc<Executor>,
}

impl Client {
    pub fn builder(api_key: impl Into<String>, base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(ClientConfig::new(api_key, base_url))
    }

    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            executor: Arc::new(Executor::new(&config)?),
        })
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestDescriptor::builder(method, path)
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Runs one logical call to completion: rate limit, pool, attempts and
    /// retries. The descriptor's context can cancel it at any suspension
    /// point.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<Response> {
        self.executor.execute(descriptor).await
    }

    pub async fn execute_json<T>(&self, descriptor: &RequestDescriptor) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.execute(descriptor).await?.json()
    }

    /// Opens a streaming call. Retries cover only the exchange up to the
    /// response head; once records flow, a failure ends the stream.
    pub async fn stream(&self, descriptor: &RequestDescriptor) -> Result<RecordStream> {
        self.executor.stream(descriptor).await
    }

    /// Starts the call on the current tokio runtime and returns a handle that
    /// can cancel it. Dropping the handle detaches the call.
    pub fn spawn(&self, descriptor: RequestDescriptor) -> CallHandle<Response> {
        let context = descriptor.context().child();
        let token = context.cancellation_token().clone();
        let method = descriptor.method().clone();
        let path = descriptor.path().to_owned();
        let descriptor = descriptor.with_context(context);
        let executor = Arc::clone(&self.executor);
        let task = tokio::spawn(async move { executor.execute(&descriptor).await });
        CallHandle {
            task,
            token,
            method,
            path,
        }
    }

    /// A blocking facade over this client's engine.
    pub fn blocking(&self) -> Result<BlockingClient> {
        BlockingClient::from_client(self.clone())
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.executor.metrics_snapshot()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.executor.pool_status()
    }
}

/// A call running on its own task.
#[derive(Debug)]
pub struct CallHandle<T> {
    task: JoinHandle<Result<T>>,
    token: CancellationToken,
    method: Method,
    path: String,
}

impl<T> CallHandle<T> {
    /// Fires the call's cancel signal. The awaited result reports the
    /// outcome as seen by the call.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for CallHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join_error)) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Poll::Ready(Err(Error::Cancelled {
                    method: this.method.clone(),
                    uri: this.path.clone(),
                    attempts: 0,
                    outcome_unknown: true,
                }))
            }
        }
    }
}

#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config = self.config.with_max_retries(max_retries);
        self
    }

    pub fn rate_limit_requests(mut self, requests_per_minute: u32) -> Self {
        self.config = self.config.with_rate_limit_requests(requests_per_minute);
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config = self.config.with_max_connections(max_connections);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config = self.config.with_connect_timeout(connect_timeout);
        self
    }

    pub fn pool_acquire_timeout(mut self, pool_acquire_timeout: Option<Duration>) -> Self {
        self.config = self.config.with_pool_acquire_timeout(pool_acquire_timeout);
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.config = self.config.with_pool_idle_timeout(pool_idle_timeout);
        self
    }

    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.config = self.config.with_total_timeout(total_timeout);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config = self.config.with_retry_policy(retry_policy);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.config = self
            .config
            .with_max_response_body_bytes(max_response_body_bytes);
        self
    }

    pub fn max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.config = self.config.with_max_record_bytes(max_record_bytes);
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.config = self.config.with_client_name(client_name);
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config = self.config.with_default_header(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Rate-limit policy the built client will use.
    pub fn rate_limit_policy(&self) -> RateLimitPolicy {
        self.config.rate_limit_policy()
    }

    pub fn try_build(self) -> Result<Client> {
        Client::new(self.config)
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build sekha client: {error}; use try_build() to handle configuration errors")
        })
    }

    /// A standalone blocking client with its own engine.
    pub fn build_blocking(self) -> Result<BlockingClient> {
        BlockingClient::from_client(self.try_build()?)
    }
}
