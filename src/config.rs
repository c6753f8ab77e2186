use std::time::Duration;

use http::header::{AUTHORIZATION, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Uri};

use crate::Result;
use crate::error::Error;
use crate::rate_limit::RateLimitPolicy;
use crate::retry::RetryPolicy;

const MIN_API_KEY_LEN: usize = 32;
const MIN_TEST_API_KEY_LEN: usize = 20;
const MAX_API_KEY_LEN: usize = 128;
const API_KEY_PREFIX: &str = "sk-sekha-";
const TEST_API_KEY_PREFIX: &str = "sk-test-";

pub(crate) const DEFAULT_CLIENT_NAME: &str = concat!("sekha-rust/", env!("CARGO_PKG_VERSION"));

/// Every tunable of a client. Build one with [`ClientConfig::new`] and the
/// `with_*` setters; [`ClientConfig::validate`] runs on client construction.
#[derive(Clone)]
pub struct ClientConfig {
    api_key: String,
    base_url: String,
    timeout: Duration,
    max_retries: usize,
    rate_limit_requests: u32,
    max_connections: usize,
    connect_timeout: Duration,
    pool_acquire_timeout: Option<Duration>,
    pool_idle_timeout: Duration,
    total_timeout: Option<Duration>,
    retry_policy: RetryPolicy,
    max_response_body_bytes: usize,
    max_record_bytes: usize,
    client_name: String,
    default_headers: HeaderMap,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("rate_limit_requests", &self.rate_limit_requests)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool_acquire_timeout", &self.pool_acquire_timeout)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("total_timeout", &self.total_timeout)
            .field("retry_policy", &self.retry_policy)
            .field("max_response_body_bytes", &self.max_response_body_bytes)
            .field("max_record_bytes", &self.max_record_bytes)
            .field("client_name", &self.client_name)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            rate_limit_requests: 1000,
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            pool_acquire_timeout: Some(Duration::from_secs(30)),
            pool_idle_timeout: Duration::from_secs(90),
            total_timeout: None,
            retry_policy: RetryPolicy::standard(),
            max_response_body_bytes: 8 * 1024 * 1024,
            max_record_bytes: 1024 * 1024,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            default_headers: HeaderMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_rate_limit_requests(mut self, requests_per_minute: u32) -> Self {
        self.rate_limit_requests = requests_per_minute;
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    /// `None` waits for a pooled connection as long as the call context allows.
    pub fn with_pool_acquire_timeout(mut self, pool_acquire_timeout: Option<Duration>) -> Self {
        self.pool_acquire_timeout = pool_acquire_timeout;
        self
    }

    pub fn with_pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    /// Deadline applied to calls whose context carries none.
    pub fn with_total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout);
        self
    }

    /// Backoff shape. The attempt limit always comes from `max_retries`.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn with_max_record_bytes(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes.max(1);
        self
    }

    pub fn with_client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn rate_limit_requests(&self) -> u32 {
        self.rate_limit_requests
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn pool_acquire_timeout(&self) -> Option<Duration> {
        self.pool_acquire_timeout
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        self.pool_idle_timeout
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    pub fn max_response_body_bytes(&self) -> usize {
        self.max_response_body_bytes
    }

    pub fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.max_retries(self.max_retries)
    }

    pub(crate) fn rate_limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::per_minute(self.rate_limit_requests)
    }

    pub fn validate(&self) -> Result<()> {
        validate_api_key(&self.api_key)?;
        Endpoint::parse(&self.base_url)?;
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be greater than zero"));
        }
        if self.rate_limit_requests == 0 {
            return Err(invalid("rate_limit_requests", "must be at least 1 per minute"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self) -> Result<Endpoint> {
        Endpoint::parse(&self.base_url)
    }

    /// Authorization and User-Agent on top of the configured defaults.
    pub(crate) fn request_headers(&self) -> Result<HeaderMap> {
        let mut headers = self.default_headers.clone();
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| invalid("api_key", "contains characters not allowed in a header"))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        let user_agent = HeaderValue::from_str(&self.client_name)
            .map_err(|_| invalid("client_name", "contains characters not allowed in a header"))?;
        headers.insert(USER_AGENT, user_agent);
        Ok(headers)
    }
}

fn invalid(field: &'static str, message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        field,
        message: message.into(),
    }
}

fn validate_api_key(api_key: &str) -> Result<()> {
    if api_key.len() > MAX_API_KEY_LEN {
        return Err(invalid(
            "api_key",
            format!("must be at most {MAX_API_KEY_LEN} characters"),
        ));
    }
    if api_key.starts_with(TEST_API_KEY_PREFIX) {
        if api_key.len() < MIN_TEST_API_KEY_LEN {
            return Err(invalid(
                "api_key",
                format!("test keys must be at least {MIN_TEST_API_KEY_LEN} characters"),
            ));
        }
        return Ok(());
    }
    if !api_key.starts_with(API_KEY_PREFIX) {
        return Err(invalid(
            "api_key",
            format!("must start with '{API_KEY_PREFIX}'"),
        ));
    }
    if api_key.len() < MIN_API_KEY_LEN {
        return Err(invalid(
            "api_key",
            format!("must be at least {MIN_API_KEY_LEN} characters"),
        ));
    }
    Ok(())
}

/// The service origin split into what the transport and requests need.
#[derive(Clone, Debug)]
pub(crate) struct Endpoint {
    pub(crate) origin: Uri,
    pub(crate) host: HeaderValue,
    pub(crate) base_path: String,
    origin_text: String,
}

impl Endpoint {
    fn parse(base_url: &str) -> Result<Self> {
        let url = url::Url::parse(base_url)
            .map_err(|error| invalid("base_url", format!("{error}: {base_url}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("base_url", "scheme must be http or https"));
        }
        let Some(host) = url.host_str() else {
            return Err(invalid("base_url", "must include a host"));
        };
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("base_url", "must not include a query or fragment"));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(invalid("base_url", "must not include credentials"));
        }

        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("base_url", "missing port"))?;
        let origin_text = format!("{}://{}", url.scheme(), host_header);
        let origin = format!("{}://{}:{}/", url.scheme(), host, port)
            .parse::<Uri>()
            .map_err(|error| invalid("base_url", error.to_string()))?;
        let host = HeaderValue::from_str(&host_header)
            .map_err(|error| invalid("base_url", error.to_string()))?;

        Ok(Self {
            origin,
            host,
            base_path: url.path().trim_end_matches('/').to_owned(),
            origin_text,
        })
    }

    /// Absolute URI for errors and logs.
    pub(crate) fn display_uri(&self, path_and_query: &str) -> String {
        crate::util::redact_uri_for_logs(&format!("{}{}", self.origin_text, path_and_query))
    }
}
