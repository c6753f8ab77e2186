//! `sekha` is a resilient HTTP client for the Sekha conversational-memory service.
//!
//! One [`Client`] owns a shared token-bucket rate limiter, a bounded HTTP/1.1
//! connection pool and a retry policy. Every logical call flows through the
//! same executor whether it is issued from async code, from the
//! [`BlockingClient`], or through the typed [`memory`] operations.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use sekha::memory::{ContextQuery, MemoryClient};
//! use sekha::prelude::{CallContext, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("sk-sekha-0123456789abcdef0123456789abcdef", "https://memory.example.com")
//!         .timeout(Duration::from_secs(10))
//!         .max_retries(3)
//!         .rate_limit_requests(600)
//!         .try_build()?;
//!
//!     let memory = MemoryClient::new(client.clone())
//!         .with_context(CallContext::with_timeout(Duration::from_secs(30)));
//!     let context = memory
//!         .assemble_context(&ContextQuery::new("what did we decide about retries?"))
//!         .await?;
//!     println!("{} matches", context.total);
//!
//!     let health = client.execute(&client.get("/health").build()).await?;
//!     println!("health took {} attempt(s)", health.attempts());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep `max_retries` small and bound calls with a total timeout.
//! - For `POST` calls that must be retried, set `idempotency_key(...)`.
//! - Share one client per process so the rate limit and pool are shared too.

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

mod blocking;
mod body;
mod client;
mod config;
mod context;
mod error;
mod execute;
pub mod memory;
mod metrics;
mod pool;
mod rate_limit;
mod request;
mod response;
mod retry;
mod stream;
mod transport;
mod util;

pub use crate::blocking::{BlockingClient, BlockingRecordStream, BlockingStream};
pub use crate::client::{CallHandle, Client, ClientBuilder};
pub use crate::config::ClientConfig;
pub use crate::context::CallContext;
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::metrics::ClientMetricsSnapshot;
pub use crate::pool::PoolStatus;
pub use crate::rate_limit::RateLimitPolicy;
pub use crate::request::{RequestBuilder, RequestDescriptor};
pub use crate::response::Response;
pub use crate::retry::RetryPolicy;
pub use crate::stream::{JsonRecords, RecordStream};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::memory::{BlockingMemoryClient, MemoryClient};
    pub use crate::{
        BlockingClient, CallContext, CallHandle, CancellationToken, Client, ClientBuilder,
        ClientConfig, ClientMetricsSnapshot, Error, ErrorCode, RateLimitPolicy, RecordStream,
        RequestDescriptor, Response, Result, RetryPolicy, TimeoutPhase, TransportErrorKind,
    };
}
