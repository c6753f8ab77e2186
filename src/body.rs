use std::convert::Infallible;
use std::error::Error as StdError;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::error::Error;

type BoxBodyError = Box<dyn StdError + Send + Sync>;
pub(crate) type ReqBody = BoxBody<Bytes, BoxBodyError>;

fn map_infallible_to_box_error(never: Infallible) -> BoxBodyError {
    match never {}
}

pub(crate) fn empty_req_body() -> ReqBody {
    Full::new(Bytes::new())
        .map_err(map_infallible_to_box_error)
        .boxed()
}

pub(crate) fn buffered_req_body(body: Bytes) -> ReqBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

/// Parses the request target. The connection is already bound to the
/// origin, so the request line carries only the path and query.
pub(crate) fn origin_form_uri(path_and_query: &str) -> Result<Uri, Error> {
    match path_and_query.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_none() && uri.authority().is_none() => Ok(uri),
        _ => Err(Error::InvalidUri {
            uri: path_and_query.to_owned(),
        }),
    }
}

/// Builds one wire request for an already parsed target.
pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    host: &HeaderValue,
    headers: &HeaderMap,
    body: Option<&Bytes>,
) -> Result<Request<ReqBody>, Error> {
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        request_builder = request_builder.header(name, value);
    }
    request_builder = request_builder.header(HOST, host.clone());
    let body = match body {
        Some(body) => {
            request_builder = request_builder.header(CONTENT_LENGTH, body.len());
            buffered_req_body(body.clone())
        }
        None => empty_req_body(),
    };
    request_builder
        .body(body)
        .map_err(|source| Error::RequestBuild { source })
}

pub(crate) enum ReadBodyError {
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
}

pub(crate) async fn read_all_body_limited(
    mut body: Incoming,
    max_bytes: usize,
) -> Result<Bytes, ReadBodyError> {
    let mut collected = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            let total_len = collected.len().saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(collected.freeze())
}
