//! ==============================================================================
//! http/mod.rs - minimal configuration web server
//! ==============================================================================
//!
//! purpose:
//!     serves the settings form and the json control api from inside the poll
//!     loop. each `poll` handles at most one connection and never blocks on
//!     accept; reads are bounded by the limits in `ReadLimits`.
//!
//! per connection:
//!
//!     Accept -> ReadHeaders -> ReadBody -> Dispatch -> WriteResponse -> Close
//!
//! relationships:
//!     - uses: network.rs (listener from the TransportFactory)
//!     - uses: routes.rs (dispatch), request.rs, response.rs
//!     - used by: runtime.rs (one poll per tick)
//!
//! ==============================================================================

pub mod request;
pub mod response;
pub mod routes;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::lifecycle::RestartRequest;
use crate::network::TransportFactory;

pub use request::{read_request, ReadLimits, Request, RequestError};
pub use response::Response;
pub use routes::{dispatch, Dispatch, RequestContext, StatusSnapshot};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// leftover request bytes drained before close, so the peer sees the response
/// instead of a reset
const DRAIN_LIMIT: usize = 64 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

pub struct ConfigHttpServer {
    listener: TcpListener,
    limits: ReadLimits,
    last_error: Option<String>,
}

impl ConfigHttpServer {
    /// Bind through the connectivity session's transport.
    pub fn start(transport: &TransportFactory, bind: SocketAddr, limits: ReadLimits) -> io::Result<Self> {
        let listener = transport.bind_listener(bind)?;
        Self::from_listener(listener, limits)
    }

    pub fn from_listener(listener: TcpListener, limits: ReadLimits) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self { listener, limits, last_error: None })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve at most one pending connection.
    pub fn poll(&mut self, ctx: &mut RequestContext<'_>) -> Option<RestartRequest> {
        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if request::is_timeout(&e) || e.kind() == ErrorKind::Interrupted => return None,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                self.last_error = Some(e.to_string());
                return None;
            }
        };
        debug!(%peer, "Connection accepted");

        if let Err(e) = self.prepare(&stream) {
            warn!(%peer, error = %e, "Could not configure connection");
            self.last_error = Some(e.to_string());
            return None;
        }

        let restart = self.serve_stream(&mut stream, ctx);
        close_gracefully(&mut stream);
        restart
    }

    /// Read one request from `stream`, dispatch it and write the response.
    pub fn serve_stream<S: Read + Write>(
        &mut self,
        stream: &mut S,
        ctx: &mut RequestContext<'_>,
    ) -> Option<RestartRequest> {
        let dispatched = match read_request(stream, &self.limits) {
            Ok(request) => {
                debug!(method = %request.method, path = %request.path, body = request.body.len(), "Request");
                dispatch(&request, ctx)
            }
            Err(RequestError::Empty) => {
                debug!("Peer sent nothing, closing");
                return None;
            }
            Err(RequestError::Io(e)) => {
                warn!(error = %e, "Reading request failed");
                self.last_error = Some(e.to_string());
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Rejecting request");
                let status = e.status().unwrap_or(400);
                Dispatch::from(Response::text(status, e.to_string()))
            }
        };

        debug!(status = dispatched.response.status, "Response");
        let written = stream
            .write_all(&dispatched.response.to_bytes())
            .and_then(|()| stream.flush());
        if let Err(e) = written {
            warn!(error = %e, "Writing response failed");
            self.last_error = Some(e.to_string());
        }

        // a persisted update still needs its restart even if the peer went away
        dispatched.restart
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn prepare(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.limits.timeout))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))
    }
}

fn close_gracefully(stream: &mut TcpStream) {
    let _ = stream.shutdown(Shutdown::Write);
    let _ = stream.set_read_timeout(Some(DRAIN_TIMEOUT));
    let mut scratch = [0u8; 1024];
    let mut drained = 0;
    while drained < DRAIN_LIMIT {
        match stream.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{SettingValue, SettingsDocument};
    use crate::testing::MemoryStore;
    use std::io::Cursor;
    use std::net::Ipv4Addr;

    /// Scripted input, captured output.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Duplex {
        fn new(raw: &str) -> Self {
            Self { input: Cursor::new(raw.as_bytes().to_vec()), output: Vec::new() }
        }

        fn response(&self) -> String {
            String::from_utf8(self.output.clone()).unwrap()
        }
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn server() -> ConfigHttpServer {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        ConfigHttpServer::from_listener(listener, ReadLimits::default()).unwrap()
    }

    fn status() -> StatusSnapshot {
        StatusSnapshot { device_id: "pico-sensor".into(), status: "ok".into(), ip: Ipv4Addr::UNSPECIFIED }
    }

    #[test]
    fn test_poll_without_connection_is_quiet() {
        let mut server = server();
        let mut settings = SettingsDocument::defaults();
        let store = MemoryStore::new(None);
        let mut ctx = RequestContext { settings: &mut settings, store: &store, status: status() };
        assert!(server.poll(&mut ctx).is_none());
        assert_eq!(server.last_error(), None);
    }

    #[test]
    fn test_malformed_request_gets_400() {
        let mut server = server();
        let mut settings = SettingsDocument::defaults();
        let store = MemoryStore::new(None);
        let mut ctx = RequestContext { settings: &mut settings, store: &store, status: status() };

        let mut stream = Duplex::new("garbage\r\n\r\n");
        assert!(server.serve_stream(&mut stream, &mut ctx).is_none());
        assert!(stream.response().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_oversized_body_gets_413() {
        let mut server = server();
        let mut settings = SettingsDocument::defaults();
        let store = MemoryStore::new(None);
        let mut ctx = RequestContext { settings: &mut settings, store: &store, status: status() };

        let mut stream = Duplex::new("PUT /api/config HTTP/1.1\r\nContent-Length: 100000\r\n\r\n");
        server.serve_stream(&mut stream, &mut ctx);
        assert!(stream.response().starts_with("HTTP/1.1 413 "));
    }

    #[test]
    fn test_silent_peer_gets_no_response() {
        let mut server = server();
        let mut settings = SettingsDocument::defaults();
        let store = MemoryStore::new(None);
        let mut ctx = RequestContext { settings: &mut settings, store: &store, status: status() };

        let mut stream = Duplex::new("");
        assert!(server.serve_stream(&mut stream, &mut ctx).is_none());
        assert!(stream.output.is_empty());
        assert_eq!(server.last_error(), None);
    }

    #[test]
    fn test_update_returns_restart_request() {
        let mut server = server();
        let mut settings = SettingsDocument::defaults();
        let store = MemoryStore::new(None);
        let mut ctx = RequestContext { settings: &mut settings, store: &store, status: status() };

        let body = r#"{"reading_interval_seconds":5}"#;
        let raw = format!(
            "PUT /api/config HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut stream = Duplex::new(&raw);
        let restart = server.serve_stream(&mut stream, &mut ctx);

        assert!(restart.is_some());
        assert!(stream.response().starts_with("HTTP/1.1 202 Accepted\r\n"));
        assert_eq!(settings.get("reading_interval_seconds"), Some(&SettingValue::Int(5)));
    }
}
