use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::context::CallContext;
use crate::retry::method_is_idempotent;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};
use crate::{IDEMPOTENCY_KEY_HEADER, Result};

/// One logical call, immutable once built.
///
/// A descriptor can be executed any number of times; every execution is an
/// independent logical call sharing the descriptor's context.
#[derive(Clone, Debug)]
pub struct RequestDescriptor {
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    idempotent: bool,
    context: CallContext,
    timeout: Option<Duration>,
    total_timeout: Option<Duration>,
}

impl RequestDescriptor {
    pub fn builder(method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path.into())
    }

    pub fn get(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::DELETE, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Whether the call may be replayed after an ambiguous failure.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    /// Per-attempt timeout overriding the client default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Budget for each execution, measured from the moment it starts.
    pub fn total_timeout(&self) -> Option<Duration> {
        self.total_timeout
    }

    pub(crate) fn path_with_query(&self, base_path: &str) -> String {
        let path = crate::util::join_base_path(base_path, &self.path);
        append_query_pairs(&path, &self.query_pairs)
    }

    pub(crate) fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    path: String,
    query_pairs: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
    idempotent: Option<bool>,
    context: CallContext,
    timeout: Option<Duration>,
    total_timeout: Option<Duration>,
}

impl RequestBuilder {
    pub(crate) fn new(method: Method, path: String) -> Self {
        Self {
            method,
            path,
            query_pairs: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            idempotent: None,
            context: CallContext::new(),
            timeout: None,
            total_timeout: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    /// Sends `Idempotency-Key` so the server can deduplicate replays, which
    /// makes the call safe to retry.
    pub fn idempotency_key(self, key: &str) -> Result<Self> {
        self.try_header(IDEMPOTENCY_KEY_HEADER, key)
    }

    /// Overrides the idempotency inferred from the method.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_pairs.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params)
            .map_err(|source| crate::error::Error::SerializeQuery { source })?;
        self.query_pairs.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)
            .map_err(|source| crate::error::Error::Serialize { source })?;
        Ok(self
            .body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.max(Duration::from_millis(1)));
        self
    }

    /// Bounds every execution of the built descriptor, retries and waits
    /// included. The clock starts when an execution starts.
    pub fn total_timeout(mut self, total_timeout: Duration) -> Self {
        self.total_timeout = Some(total_timeout);
        self
    }

    pub fn build(self) -> RequestDescriptor {
        let idempotent = self.idempotent.unwrap_or_else(|| {
            method_is_idempotent(&self.method) || self.headers.contains_key(IDEMPOTENCY_KEY_HEADER)
        });
        RequestDescriptor {
            method: self.method,
            path: self.path,
            query_pairs: self.query_pairs,
            headers: self.headers,
            body: self.body,
            idempotent,
            context: self.context,
            timeout: self.timeout,
            total_timeout: self.total_timeout,
        }
    }
}

impl From<RequestBuilder> for RequestDescriptor {
    fn from(builder: RequestBuilder) -> Self {
        builder.build()
    }
}
