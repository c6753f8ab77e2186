//! Blocking facade driving the async engine on a private runtime.
//!
//! Calls park the invoking thread in `block_on`; connection drivers run on
//! the runtime's single worker thread, so pooled connections stay serviced
//! between calls. Blocking methods must not be called from inside an async
//! task.

use std::sync::Arc;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;

use crate::Result;
use crate::client::Client;
use crate::error::Error;
use crate::metrics::ClientMetricsSnapshot;
use crate::pool::PoolStatus;
use crate::request::{RequestBuilder, RequestDescriptor};
use crate::response::Response;
use crate::stream::{JsonRecords, RecordStream};

#[derive(Debug)]
struct BlockingRuntime {
    runtime: Option<Runtime>,
}

impl BlockingRuntime {
    fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("sekha-blocking")
            .enable_all()
            .build()
            .map_err(|source| Error::RuntimeInit { source })?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn block_on<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.block_on(future)),
            None => Err(Error::RuntimeInit {
                source: std::io::Error::other("blocking runtime already shut down"),
            }),
        }
    }
}

impl Drop for BlockingRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockingClient {
    client: Client,
    runtime: Arc<BlockingRuntime>,
}

impl BlockingClient {
    pub(crate) fn from_client(client: Client) -> Result<Self> {
        Ok(Self {
            client,
            runtime: Arc::new(BlockingRuntime::new()?),
        })
    }

    /// The async client sharing this engine.
    pub fn as_async(&self) -> &Client {
        &self.client
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder {
        self.client.request(method, path)
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder {
        self.client.get(path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder {
        self.client.post(path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder {
        self.client.put(path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder {
        self.client.delete(path)
    }

    pub fn execute(&self, descriptor: &RequestDescriptor) -> Result<Response> {
        self.runtime.block_on(self.client.execute(descriptor))?
    }

    pub fn execute_json<T>(&self, descriptor: &RequestDescriptor) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.execute(descriptor)?.json()
    }

    pub fn stream(&self, descriptor: &RequestDescriptor) -> Result<BlockingRecordStream> {
        let inner = self.runtime.block_on(self.client.stream(descriptor))??;
        Ok(BlockingStream {
            inner,
            runtime: Arc::clone(&self.runtime),
        })
    }

    pub fn metrics_snapshot(&self) -> ClientMetricsSnapshot {
        self.client.metrics_snapshot()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.client.pool_status()
    }
}

/// Iterator over a streaming response; each `next` blocks for one record.
#[derive(Debug)]
pub struct BlockingStream<S> {
    inner: S,
    runtime: Arc<BlockingRuntime>,
}

pub type BlockingRecordStream = BlockingStream<RecordStream>;

impl BlockingStream<RecordStream> {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn json<T>(self) -> BlockingStream<JsonRecords<T>>
    where
        T: DeserializeOwned,
    {
        BlockingStream {
            inner: self.inner.json(),
            runtime: self.runtime,
        }
    }
}

impl<S, T> Iterator for BlockingStream<S>
where
    S: Stream<Item = Result<T>> + Unpin,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.runtime.block_on(self.inner.next()) {
            Ok(item) => item,
            Err(error) => Some(Err(error)),
        }
    }
}

impl BlockingStream<RecordStream> {
    /// Collects the remaining records as raw bytes.
    pub fn collect_records(self) -> Result<Vec<Bytes>> {
        self.collect()
    }
}
