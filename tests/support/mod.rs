#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const TEST_KEY: &str = "sk-test-0123456789abcdef";

#[derive(Clone, Debug)]
pub struct ResponseSpec {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    close: bool,
}

impl ResponseSpec {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            delay: Duration::ZERO,
            close: false,
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::new(status, body.to_string()).header("Content-Type", "application/json")
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn close(mut self) -> Self {
        self.close = true;
        self
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    Respond(ResponseSpec),
    /// Reads the request, then closes the socket without answering.
    Hangup,
    /// Chunked body written piece by piece; `hold_open` keeps the body
    /// unterminated until the server shuts down.
    Stream {
        status: u16,
        chunks: Vec<(Vec<u8>, Duration)>,
        hold_open: bool,
    },
}

impl From<ResponseSpec> for Reply {
    fn from(spec: ResponseSpec) -> Self {
        Self::Respond(spec)
    }
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub received_at: Instant,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("request body is json")
    }
}

#[derive(Default)]
struct State {
    script: Mutex<VecDeque<Reply>>,
    last: Mutex<Option<Reply>>,
    requests: Mutex<Vec<CapturedRequest>>,
    served: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    connections: AtomicUsize,
}

impl State {
    /// Next scripted reply; the final entry repeats once the script runs out.
    fn next_reply(&self) -> Reply {
        let mut script = lock_unpoisoned(&self.script);
        let mut last = lock_unpoisoned(&self.last);
        match script.pop_front() {
            Some(reply) => {
                *last = Some(reply.clone());
                reply
            }
            None => last
                .clone()
                .unwrap_or_else(|| Reply::Respond(ResponseSpec::new(200, ""))),
        }
    }
}

/// Keep-alive HTTP/1.1 server on a loopback port, one thread per connection.
pub struct MockServer {
    authority: String,
    state: Arc<State>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    pub fn start(script: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let authority = listener
            .local_addr()
            .expect("read local address")
            .to_string();
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let state = Arc::new(State {
            script: Mutex::new(script.into()),
            ..State::default()
        });
        let stop = Arc::new(AtomicBool::new(false));

        let accept_state = Arc::clone(&state);
        let accept_stop = Arc::clone(&stop);
        let join = thread::spawn(move || {
            let mut workers = Vec::new();
            while !accept_stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        accept_state.connections.fetch_add(1, Ordering::SeqCst);
                        let state = Arc::clone(&accept_state);
                        let stop = Arc::clone(&accept_stop);
                        workers.push(thread::spawn(move || serve_connection(stream, &state, &stop)));
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
            for worker in workers {
                let _ = worker.join();
            }
        });

        Self {
            authority,
            state,
            stop,
            join: Some(join),
        }
    }

    pub fn respond(spec: ResponseSpec) -> Self {
        Self::start(vec![Reply::Respond(spec)])
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        lock_unpoisoned(&self.state.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock_unpoisoned(&self.state.requests).len()
    }

    pub fn served(&self) -> usize {
        self.state.served.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn wait_for_requests(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let observed = self.request_count();
            if observed >= expected || Instant::now() >= deadline {
                return observed;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A loopback address with nothing listening on it.
pub fn refused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let authority = listener
        .local_addr()
        .expect("read local address")
        .to_string();
    drop(listener);
    format!("http://{authority}")
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn serve_connection(mut stream: TcpStream, state: &State, stop: &AtomicBool) {
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    loop {
        let request = match read_request(&mut stream, stop) {
            Some(request) => request,
            None => return,
        };
        let now_active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        update_max(&state.max_active, now_active);
        lock_unpoisoned(&state.requests).push(request);

        let keep_open = match state.next_reply() {
            Reply::Respond(spec) => {
                sleep_unless_stopped(spec.delay, stop);
                write_response(&mut stream, &spec).is_ok() && !spec.close
            }
            Reply::Hangup => false,
            Reply::Stream {
                status,
                chunks,
                hold_open,
            } => {
                let written = write_stream(&mut stream, status, &chunks, hold_open, stop);
                written.is_ok() && !hold_open
            }
        };

        state.served.fetch_add(1, Ordering::SeqCst);
        state.active.fetch_sub(1, Ordering::SeqCst);
        if !keep_open {
            return;
        }
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(5).min(deadline - Instant::now()));
    }
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn read_request(stream: &mut TcpStream, stop: &AtomicBool) -> Option<CapturedRequest> {
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        if let Some(header_end) = find_header_end(&raw) {
            let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
            let mut lines = head.split("\r\n");
            let mut request_line = lines.next().unwrap_or_default().split_whitespace();
            let method = request_line.next().unwrap_or_default().to_owned();
            let path = request_line.next().unwrap_or_default().to_owned();
            let headers: Vec<(String, String)> = lines
                .filter_map(|line| line.split_once(':'))
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
                .collect();
            let content_length = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = header_end + 4;
            if raw.len() >= body_start + content_length {
                return Some(CapturedRequest {
                    method,
                    path,
                    headers,
                    body: raw[body_start..body_start + content_length].to_vec(),
                    received_at: Instant::now(),
                });
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => return None,
            Ok(read) => raw.extend_from_slice(&chunk[..read]),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if stop.load(Ordering::SeqCst) {
                    return None;
                }
            }
            Err(_) => return None,
        }
    }
}

fn status_line(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        401 => "Unauthorized",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    format!("HTTP/1.1 {status} {reason}\r\n")
}

fn write_response(stream: &mut TcpStream, response: &ResponseSpec) -> std::io::Result<()> {
    let mut raw = status_line(response.status).into_bytes();
    raw.extend_from_slice(format!("Content-Length: {}\r\n", response.body.len()).as_bytes());
    if response.close {
        raw.extend_from_slice(b"Connection: close\r\n");
    }
    for (name, value) in &response.headers {
        raw.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    raw.extend_from_slice(b"\r\n");
    raw.extend_from_slice(&response.body);
    stream.write_all(&raw)?;
    stream.flush()
}

fn write_stream(
    stream: &mut TcpStream,
    status: u16,
    chunks: &[(Vec<u8>, Duration)],
    hold_open: bool,
    stop: &AtomicBool,
) -> std::io::Result<()> {
    let mut head = status_line(status).into_bytes();
    head.extend_from_slice(b"Content-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n");
    stream.write_all(&head)?;
    stream.flush()?;

    for (bytes, delay) in chunks {
        sleep_unless_stopped(*delay, stop);
        stream.write_all(format!("{:X}\r\n", bytes.len()).as_bytes())?;
        stream.write_all(bytes)?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
    }

    if hold_open {
        sleep_unless_stopped(Duration::from_secs(10), stop);
        return Ok(());
    }
    stream.write_all(b"0\r\n\r\n")?;
    stream.flush()
}

fn update_max(max: &AtomicUsize, value: usize) {
    let mut current = max.load(Ordering::SeqCst);
    while value > current {
        match max.compare_exchange(current, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}
