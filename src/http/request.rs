//! request parsing: bounded, attempt-limited reads of one HTTP/1.1 request

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::HttpConfig;

const CHUNK_SIZE: usize = 1024;

/// How much the server is willing to read from one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadLimits {
    /// timed-out reads tolerated before giving up on a slow peer
    pub attempts: u32,
    /// socket read timeout per attempt; `timeout * attempts` also caps the
    /// whole request, however the bytes trickle in
    pub timeout: Duration,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl ReadLimits {
    /// Wall-clock budget for reading one complete request.
    pub fn budget(&self) -> Duration {
        self.timeout.saturating_mul(self.attempts)
    }
}

impl From<&HttpConfig> for ReadLimits {
    fn from(config: &HttpConfig) -> Self {
        Self {
            attempts: config.read_attempts.max(1),
            timeout: config.read_timeout(),
            max_header_bytes: config.max_header_bytes,
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("connection closed before a request arrived")]
    Empty,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request headers exceed {0} bytes")]
    HeadersTooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("request body ended after {received} of {expected} bytes")]
    IncompleteBody { expected: usize, received: usize },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl RequestError {
    /// Status to answer with; `None` means close without a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Empty | RequestError::Io(_) => None,
            RequestError::BadRequest(_) | RequestError::IncompleteBody { .. } => Some(400),
            RequestError::HeadersTooLarge(_) => Some(431),
            RequestError::BodyTooLarge(_) => Some(413),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// target without the query string, which no route uses
    pub path: String,
    /// keys are lower-cased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Media type without parameters, lower-cased.
    pub fn media_type(&self) -> Option<String> {
        self.header("content-type").map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

/// Read one request. The caller sets the socket timeout to `limits.timeout`.
pub fn read_request<R: Read>(stream: &mut R, limits: &ReadLimits) -> Result<Request, RequestError> {
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut timeouts = 0;
    let deadline = Instant::now() + limits.budget();

    let (head_len, separator_len) = loop {
        if let Some(found) = find_head_end(&buf) {
            break found;
        }
        if buf.len() > limits.max_header_bytes {
            return Err(RequestError::HeadersTooLarge(limits.max_header_bytes));
        }
        if timeouts >= limits.attempts || Instant::now() >= deadline {
            return Err(if buf.is_empty() {
                RequestError::Empty
            } else {
                RequestError::BadRequest("incomplete request headers".into())
            });
        }

        match stream.read(&mut chunk) {
            Ok(0) if buf.is_empty() => return Err(RequestError::Empty),
            Ok(0) => return Err(RequestError::BadRequest("connection closed mid-headers".into())),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if is_timeout(&e) => timeouts += 1,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(RequestError::Io(e)),
        }
    };

    if head_len > limits.max_header_bytes {
        return Err(RequestError::HeadersTooLarge(limits.max_header_bytes));
    }

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| RequestError::BadRequest("request head is not UTF-8".into()))?;
    let mut request = parse_head(head)?;

    if request
        .header("transfer-encoding")
        .is_some_and(|te| !te.eq_ignore_ascii_case("identity"))
    {
        return Err(RequestError::BadRequest("chunked bodies are not supported".into()));
    }

    let expected = match request.header("content-length") {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| RequestError::BadRequest(format!("invalid Content-Length `{}`", raw)))?,
        None => 0,
    };
    if expected > limits.max_body_bytes {
        return Err(RequestError::BodyTooLarge(limits.max_body_bytes));
    }

    let mut body = buf.split_off(head_len + separator_len);
    while body.len() < expected {
        if timeouts >= limits.attempts || Instant::now() >= deadline {
            return Err(RequestError::IncompleteBody { expected, received: body.len() });
        }
        match stream.read(&mut chunk) {
            Ok(0) => return Err(RequestError::IncompleteBody { expected, received: body.len() }),
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(e) if is_timeout(&e) => timeouts += 1,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(RequestError::Io(e)),
        }
    }
    body.truncate(expected);

    request.body = body;
    Ok(request)
}

fn parse_head(head: &str) -> Result<Request, RequestError> {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::BadRequest(format!("malformed request line `{}`", request_line)));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::BadRequest(format!("unsupported protocol `{}`", version)));
    }
    if !target.starts_with('/') {
        return Err(RequestError::BadRequest(format!("unsupported target `{}`", target)));
    }

    let path = target.split_once('?').map_or(target, |(path, _)| path).to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(RequestError::BadRequest(format!("malformed header `{}`", line)));
        };
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(Request {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body: Vec::new(),
    })
}

/// Position and length of the blank line ending the head.
fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    /// Hands out one scripted read result per call.
    struct Trickle(VecDeque<io::Result<Vec<u8>>>);

    impl Read for Trickle {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(bytes)) => {
                    out[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn timeout() -> io::Result<Vec<u8>> {
        Err(io::Error::from(ErrorKind::WouldBlock))
    }

    fn parse(raw: &str) -> Result<Request, RequestError> {
        read_request(&mut Cursor::new(raw.as_bytes().to_vec()), &ReadLimits::default())
    }

    #[test]
    fn test_get_request() {
        let request = parse("GET /api/status?verbose=1 HTTP/1.1\r\nHost: node\r\nAccept: */*\r\n\r\n").unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/status");
        assert_eq!(request.header("HOST"), Some("node"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_body_is_read_to_content_length() {
        let request = parse(
            "PUT /api/config HTTP/1.1\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: 7\r\n\r\n{\"a\":1}trailing",
        )
        .unwrap();
        assert_eq!(request.body, b"{\"a\":1}");
        assert_eq!(request.media_type().as_deref(), Some("application/json"));
    }

    #[test]
    fn test_slow_peer_body_across_reads() {
        let mut stream = Trickle(VecDeque::from([
            Ok(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n".to_vec()),
            timeout(),
            Ok(b"\r\nab".to_vec()),
            timeout(),
            Ok(b"cdef".to_vec()),
        ]));
        let request = read_request(&mut stream, &ReadLimits::default()).unwrap();
        assert_eq!(request.body, b"abcdef");
    }

    #[test]
    fn test_silent_peer_is_empty() {
        let mut stream = Trickle((0..8).map(|_| timeout()).collect());
        assert!(matches!(
            read_request(&mut stream, &ReadLimits::default()),
            Err(RequestError::Empty)
        ));
        assert!(matches!(parse(""), Err(RequestError::Empty)));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let mut script: VecDeque<_> = VecDeque::from([Ok(b"GET / HT".to_vec())]);
        script.extend((0..20).map(|_| timeout()));
        let mut stream = Trickle(script);
        let err = read_request(&mut stream, &ReadLimits::default()).unwrap_err();
        assert_eq!(err.status(), Some(400));
        // eight timeouts consumed, the rest untouched
        assert_eq!(stream.0.len(), 12);
    }

    /// Sends `prefix` at once, then one byte per read, each well inside the
    /// per-read timeout.
    struct Dribble {
        prefix: Option<Vec<u8>>,
        dribbled: usize,
        delay: Duration,
    }

    impl Dribble {
        fn new(prefix: &str, delay: Duration) -> Self {
            Self { prefix: Some(prefix.as_bytes().to_vec()), dribbled: 0, delay }
        }
    }

    impl Read for Dribble {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if let Some(prefix) = self.prefix.take() {
                out[..prefix.len()].copy_from_slice(&prefix);
                return Ok(prefix.len());
            }
            std::thread::sleep(self.delay);
            out[0] = b'x';
            self.dribbled += 1;
            Ok(1)
        }
    }

    fn tight_limits() -> ReadLimits {
        ReadLimits {
            attempts: 4,
            timeout: Duration::from_millis(50),
            ..ReadLimits::default()
        }
    }

    #[test]
    fn test_dribbling_headers_hit_the_deadline() {
        let limits = tight_limits();
        let mut stream = Dribble::new("GET / HTTP/1.1\r\nX-Slow: ", Duration::from_millis(10));

        let started = Instant::now();
        let err = read_request(&mut stream, &limits).unwrap_err();
        let took = started.elapsed();

        assert!(matches!(err, RequestError::BadRequest(_)), "{err:?}");
        assert!(took < limits.budget() * 3, "blocked for {took:?}");
        // far fewer bytes than the header limit
        assert!(stream.dribbled < limits.max_header_bytes / 4);
    }

    #[test]
    fn test_dribbling_body_hits_the_deadline() {
        let limits = tight_limits();
        let mut stream = Dribble::new(
            "PUT /api/config HTTP/1.1\r\nContent-Length: 8000\r\n\r\n",
            Duration::from_millis(5),
        );

        let started = Instant::now();
        let err = read_request(&mut stream, &limits).unwrap_err();

        assert!(matches!(err, RequestError::IncompleteBody { expected: 8000, .. }), "{err:?}");
        assert_eq!(err.status(), Some(400));
        assert!(started.elapsed() < limits.budget() * 3);
    }

    #[test]
    fn test_query_string_is_stripped() {
        let request = parse("GET /api/config?pretty HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path, "/api/config");
    }

    #[test]
    fn test_short_body_is_bad_request() {
        let err = parse("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").unwrap_err();
        assert!(matches!(err, RequestError::IncompleteBody { expected: 10, received: 3 }));
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn test_oversized_body() {
        let err = parse("POST / HTTP/1.1\r\nContent-Length: 9000\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), Some(413));
    }

    #[test]
    fn test_oversized_headers() {
        let raw = format!("GET / HTTP/1.1\r\nX-Fill: {}\r\n\r\n", "a".repeat(5000));
        let err = parse(&raw).unwrap_err();
        assert_eq!(err.status(), Some(431));
    }

    #[test]
    fn test_malformed_request_line() {
        assert_eq!(parse("HELLO\r\n\r\n").unwrap_err().status(), Some(400));
        assert_eq!(parse("GET / SPDY/3\r\n\r\n").unwrap_err().status(), Some(400));
        assert_eq!(parse("GET / HTTP/1.1\r\nno-colon\r\n\r\n").unwrap_err().status(), Some(400));
        assert_eq!(
            parse("POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n").unwrap_err().status(),
            Some(400)
        );
    }

    #[test]
    fn test_bare_newlines_are_accepted() {
        let request = parse("GET / HTTP/1.0\nHost: x\n\n").unwrap();
        assert_eq!(request.path, "/");
        assert_eq!(request.header("host"), Some("x"));
    }
}
