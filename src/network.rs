//! ==============================================================================
//! network.rs - connectivity session
//! ==============================================================================
//!
//! purpose:
//!     associates with the configured Wi-Fi network through the `LinkLayer`
//!     capability with bounded retry, and hands out a `TransportFactory`
//!     (listening sockets, name resolution, outbound TCP) while associated.
//!
//! lifecycle:
//!
//!     Disconnected ──connect()──▶ Connecting ──address──▶ Connected
//!          ▲                          │                       │
//!          └──── 5 failed attempts ───┘         link lost ────┘
//!
//!     a transport factory is built lazily once per association. a fresh
//!     association or a lost link invalidates it; holders of an old `Rc` keep
//!     a usable value but the session never hands it out again.
//!
//! relationships:
//!     - uses: hal.rs (LinkLayer), clock.rs (retry backoff)
//!     - used by: telemetry.rs / mqtt.rs (broker connections),
//!       http/mod.rs (listener), runtime.rs (owner)
//!
//! ==============================================================================

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::hal::LinkLayer;

pub const MAX_CONNECT_ATTEMPTS: u32 = 5;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network is not connected")]
    NotConnected,
}

/// Socket capabilities bound to one network association.
#[derive(Debug)]
pub struct TransportFactory {
    local_address: Ipv4Addr,
    generation: u64,
}

impl TransportFactory {
    pub fn new(local_address: Ipv4Addr, generation: u64) -> Self {
        Self { local_address, generation }
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.local_address
    }

    /// Association this factory belongs to; bumps on every re-association.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Non-blocking TCP listener.
    pub fn bind_listener(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    pub fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
    }

    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
        let addr = self.resolve(host, port)?;
        TcpStream::connect_timeout(&addr, timeout)
    }
}

pub struct ConnectivitySession {
    link: Box<dyn LinkLayer>,
    ssid: String,
    password: String,
    clock: Rc<dyn Clock>,
    state: ConnectionState,
    factory: Option<Rc<TransportFactory>>,
    generation: u64,
    last_error: Option<String>,
}

impl ConnectivitySession {
    pub fn new(
        link: Box<dyn LinkLayer>,
        ssid: impl Into<String>,
        password: impl Into<String>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        Self {
            link,
            ssid: ssid.into(),
            password: password.into(),
            clock,
            state: ConnectionState::Disconnected,
            factory: None,
            generation: 0,
            last_error: None,
        }
    }

    /// Associate with bounded retry. Already associated is a no-op success.
    pub fn connect(&mut self) -> bool {
        if self.link.ipv4_address().is_some() {
            self.state = ConnectionState::Connected;
            return true;
        }

        self.factory = None;
        self.state = ConnectionState::Connecting;

        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            info!(ssid = %self.ssid, attempt, max = MAX_CONNECT_ATTEMPTS, "Connecting to Wi-Fi");

            let failure = match self.link.associate(&self.ssid, &self.password) {
                Ok(()) => match self.link.ipv4_address() {
                    Some(address) => {
                        self.generation += 1;
                        self.state = ConnectionState::Connected;
                        self.last_error = None;
                        info!(%address, "Wi-Fi connected");
                        return true;
                    }
                    None => "associated but no address was assigned".to_string(),
                },
                Err(e) => format!("{:#}", e),
            };

            warn!(attempt, error = %failure, "Wi-Fi connection attempt failed");
            self.last_error = Some(failure);
            self.clock.sleep(CONNECT_RETRY_DELAY);
        }

        self.state = ConnectionState::Disconnected;
        error!(ssid = %self.ssid, attempts = MAX_CONNECT_ATTEMPTS, "Giving up on Wi-Fi");
        false
    }

    /// Live check against the link layer.
    pub fn is_connected(&self) -> bool {
        self.link.ipv4_address().is_some()
    }

    /// Assigned IPv4 address, `0.0.0.0` when there is none.
    pub fn address(&self) -> Ipv4Addr {
        self.link.ipv4_address().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn transport_factory(&mut self) -> Result<Rc<TransportFactory>, NetworkError> {
        let Some(address) = self.link.ipv4_address() else {
            if self.factory.take().is_some() {
                warn!("Link lost, transport factory invalidated");
            }
            self.state = ConnectionState::Disconnected;
            return Err(NetworkError::NotConnected);
        };
        if self.state != ConnectionState::Connected {
            return Err(NetworkError::NotConnected);
        }

        let generation = self.generation;
        let factory = self
            .factory
            .get_or_insert_with(|| Rc::new(TransportFactory::new(address, generation)));
        Ok(Rc::clone(factory))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
