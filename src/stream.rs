//! Lazy decoding of newline-delimited export bodies.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode};
use hyper::body::{Body, Incoming};
use serde::de::DeserializeOwned;
use tokio::time::{Instant, Sleep, sleep, sleep_until};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::Result;
use crate::context::CallContext;
use crate::error::{Error, TimeoutPhase, TransportErrorKind};
use crate::pool::PooledConnection;
use crate::util::truncate_body;

/// Splits a byte stream into non-empty lines.
#[derive(Debug)]
struct LineSplitter {
    buffer: BytesMut,
    max_record_bytes: usize,
}

impl LineSplitter {
    fn new(max_record_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_record_bytes,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete record, or `Err(len)` when a record outgrows the limit.
    fn next_line(&mut self) -> Option<std::result::Result<Bytes, usize>> {
        loop {
            let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') else {
                if self.buffer.len() > self.max_record_bytes {
                    return Some(Err(self.buffer.len()));
                }
                return None;
            };
            let mut line = self.buffer.split_to(position + 1);
            line.truncate(position);
            if line.last() == Some(&b'\r') {
                line.truncate(position - 1);
            }
            if line.len() > self.max_record_bytes {
                return Some(Err(line.len()));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(Ok(line.freeze()));
        }
    }

    /// Whatever trails the last newline once the body has ended.
    fn finish(&mut self) -> Option<std::result::Result<Bytes, usize>> {
        let mut rest = std::mem::take(&mut self.buffer);
        if rest.last() == Some(&b'\r') {
            let trimmed = rest.len() - 1;
            rest.truncate(trimmed);
        }
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if rest.len() > self.max_record_bytes {
            return Some(Err(rest.len()));
        }
        Some(Ok(rest.freeze()))
    }
}

/// One body read line by line. A frame is pulled only when no complete
/// line is buffered, so at most one frame is held ahead of the consumer.
#[derive(Debug)]
struct LineReader<B> {
    body: B,
    splitter: LineSplitter,
    frames_read: usize,
    ended: bool,
}

enum LineEvent<E> {
    Line(Bytes),
    TooLarge(usize),
    Failed(E),
    End,
}

impl<B> LineReader<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    fn new(body: B, max_record_bytes: usize) -> Self {
        Self {
            body,
            splitter: LineSplitter::new(max_record_bytes),
            frames_read: 0,
            ended: false,
        }
    }

    fn max_record_bytes(&self) -> usize {
        self.splitter.max_record_bytes
    }

    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<LineEvent<B::Error>> {
        loop {
            match self.splitter.next_line() {
                Some(Ok(line)) => return Poll::Ready(LineEvent::Line(line)),
                Some(Err(actual_bytes)) => return Poll::Ready(LineEvent::TooLarge(actual_bytes)),
                None if self.ended => return Poll::Ready(LineEvent::End),
                None => {}
            }

            match Pin::new(&mut self.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    self.frames_read += 1;
                    if let Some(data) = frame.data_ref() {
                        self.splitter.push(data);
                    }
                }
                Poll::Ready(Some(Err(source))) => return Poll::Ready(LineEvent::Failed(source)),
                Poll::Ready(None) => {
                    self.ended = true;
                    return Poll::Ready(match self.splitter.finish() {
                        Some(Ok(line)) => LineEvent::Line(line),
                        Some(Err(actual_bytes)) => LineEvent::TooLarge(actual_bytes),
                        None => LineEvent::End,
                    });
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub(crate) struct StreamParts {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Incoming,
    pub(crate) connection: PooledConnection,
    pub(crate) keep_alive: bool,
}

/// Records of one streaming response, one per body line.
///
/// The pooled connection stays checked out while the stream is alive. It
/// returns to the pool when the body is exhausted and is closed on error,
/// cancellation or early drop. A new frame is read only when no complete
/// record is buffered.
pub struct RecordStream {
    status: StatusCode,
    headers: HeaderMap,
    reader: LineReader<Incoming>,
    connection: Option<PooledConnection>,
    keep_alive: bool,
    finished: bool,
    method: Method,
    uri: String,
    attempts: usize,
    read_timeout: Duration,
    read_timer: Pin<Box<Sleep>>,
    timer_armed_at: Option<usize>,
    opened_at: Instant,
    deadline: Option<Pin<Box<Sleep>>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RecordStream")
            .field("status", &self.status)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("attempts", &self.attempts)
            .field("finished", &self.finished)
            .finish()
    }
}

pub(crate) struct RecordStreamOptions {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) attempts: usize,
    pub(crate) max_record_bytes: usize,
    pub(crate) read_timeout: Duration,
}

impl RecordStream {
    pub(crate) fn new(parts: StreamParts, context: &CallContext, options: RecordStreamOptions) -> Self {
        let deadline = context
            .deadline_at()
            .map(|deadline| Box::pin(sleep_until(Instant::from_std(deadline))));
        Self {
            status: parts.status,
            headers: parts.headers,
            reader: LineReader::new(parts.body, options.max_record_bytes),
            connection: Some(parts.connection),
            keep_alive: parts.keep_alive,
            finished: false,
            method: options.method,
            uri: options.uri,
            attempts: options.attempts,
            read_timeout: options.read_timeout,
            read_timer: Box::pin(sleep(options.read_timeout)),
            timer_armed_at: None,
            opened_at: Instant::now(),
            deadline,
            cancelled: Box::pin(context.cancellation_token().clone().cancelled_owned()),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub async fn next_record(&mut self) -> Option<Result<Bytes>> {
        self.next().await
    }

    /// Decodes every record as JSON.
    pub fn json<T>(self) -> JsonRecords<T>
    where
        T: DeserializeOwned,
    {
        JsonRecords {
            inner: self,
            _record: PhantomData,
        }
    }

    /// Ends the stream, returning the connection only if the body completed.
    fn finish(&mut self, healthy: bool) {
        self.finished = true;
        if let Some(connection) = self.connection.take() {
            connection.release(healthy && self.keep_alive);
        }
    }

    fn fail(&mut self, error: Error) -> Poll<Option<Result<Bytes>>> {
        self.finish(false);
        Poll::Ready(Some(Err(error)))
    }

    fn too_large(&self, actual_bytes: usize) -> Error {
        Error::ResponseBodyTooLarge {
            limit_bytes: self.reader.max_record_bytes(),
            actual_bytes,
            method: self.method.clone(),
            uri: self.uri.clone(),
        }
    }
}

impl Stream for RecordStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            let error = Error::Cancelled {
                method: this.method.clone(),
                uri: this.uri.clone(),
                attempts: this.attempts,
                outcome_unknown: false,
            };
            return this.fail(error);
        }
        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            let error = Error::Timeout {
                phase: TimeoutPhase::Deadline,
                timeout_ms: this.opened_at.elapsed().as_millis(),
                method: this.method.clone(),
                uri: this.uri.clone(),
            };
            return this.fail(error);
        }

        match this.reader.poll_line(cx) {
            Poll::Ready(LineEvent::Line(record)) => {
                if this.reader.ended {
                    this.finish(true);
                }
                Poll::Ready(Some(Ok(record)))
            }
            Poll::Ready(LineEvent::TooLarge(actual_bytes)) => {
                let error = this.too_large(actual_bytes);
                this.fail(error)
            }
            Poll::Ready(LineEvent::Failed(source)) => {
                let error = Error::ConnectionFailure {
                    kind: TransportErrorKind::Read,
                    method: this.method.clone(),
                    uri: this.uri.clone(),
                    request_sent: true,
                    source: Box::new(source),
                };
                this.fail(error)
            }
            Poll::Ready(LineEvent::End) => {
                this.finish(true);
                Poll::Ready(None)
            }
            Poll::Pending => {
                let frames_read = this.reader.frames_read;
                if this.timer_armed_at != Some(frames_read) {
                    this.timer_armed_at = Some(frames_read);
                    let read_deadline = Instant::now() + this.read_timeout;
                    this.read_timer.as_mut().reset(read_deadline);
                }
                if this.read_timer.as_mut().poll(cx).is_ready() {
                    let error = Error::Timeout {
                        phase: TimeoutPhase::Attempt,
                        timeout_ms: this.read_timeout.as_millis(),
                        method: this.method.clone(),
                        uri: this.uri.clone(),
                    };
                    return this.fail(error);
                }
                Poll::Pending
            }
        }
    }
}

/// Typed view over a [`RecordStream`].
pub struct JsonRecords<T> {
    inner: RecordStream,
    _record: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for JsonRecords<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("JsonRecords")
            .field("inner", &self.inner)
            .finish()
    }
}

impl<T> JsonRecords<T>
where
    T: DeserializeOwned,
{
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub async fn next_record(&mut self) -> Option<Result<T>> {
        self.next().await
    }
}

impl<T> Stream for JsonRecords<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(record))) => Poll::Ready(Some(decode_record(&record))),
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn decode_record<T: DeserializeOwned>(record: &[u8]) -> Result<T> {
    serde_json::from_slice(record).map_err(|source| Error::Deserialize {
        source,
        body: truncate_body(record),
    })
}
