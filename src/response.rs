use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;
use crate::util::truncate_body;

/// A fully buffered successful response.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    attempts: usize,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes, attempts: usize) -> Self {
        Self {
            status,
            headers,
            body,
            attempts,
        }
    }

    pub(crate) fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Network exchanges the logical call needed, retries included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use serde::Deserialize;

    use super::Response;
    use crate::error::ErrorCode;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Health {
        status: String,
    }

    #[test]
    fn json_decodes_typed_payload() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(br#"{"status":"healthy"}"#),
            1,
        );
        let health: Health = response.json().expect("valid json");
        assert_eq!(health.status, "healthy");
    }

    #[test]
    fn json_error_keeps_the_body_for_diagnostics() {
        let response = Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"<html>oops</html>"),
            2,
        );
        let error = response.json::<Health>().expect_err("not json");
        assert_eq!(error.code(), ErrorCode::Deserialize);
        assert!(error.to_string().contains("<html>oops</html>"));
        assert_eq!(response.attempts(), 2);
    }
}
