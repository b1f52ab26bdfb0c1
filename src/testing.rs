//! shared test doubles for the unit tests

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};

use crate::clock::Clock;
use crate::hal::{DhtDriver, LinkLayer, StatusLed};
use crate::network::TransportFactory;
use crate::settings::SettingsDocument;
use crate::store::{ConfigError, SettingsStore};
use crate::telemetry::{BusConnector, BusSession, PublishError, SessionOptions};

// ==============================================================================
// clock
// ==============================================================================

struct ClockState {
    base: Instant,
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Clock that only moves when told to (or slept on).
#[derive(Clone)]
pub struct FakeClock(Rc<RefCell<ClockState>>);

impl FakeClock {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(ClockState {
            base: Instant::now(),
            offset: Duration::ZERO,
            sleeps: Vec::new(),
        })))
    }

    pub fn advance(&self, by: Duration) {
        self.0.borrow_mut().offset += by;
    }

    pub fn elapsed(&self) -> Duration {
        self.0.borrow().offset
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.0.borrow().sleeps.clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        let state = self.0.borrow();
        state.base + state.offset
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.0.borrow_mut();
        state.sleeps.push(duration);
        state.offset += duration;
    }
}

// ==============================================================================
// link layer
// ==============================================================================

struct LinkState {
    failures_left: Option<u32>,
    assign: Ipv4Addr,
    address: Option<Ipv4Addr>,
    attempts: u32,
}

/// Link layer with a scripted number of failed associations.
#[derive(Clone)]
pub struct FakeLink(Rc<RefCell<LinkState>>);

impl FakeLink {
    fn with(failures_left: Option<u32>, assign: Ipv4Addr, address: Option<Ipv4Addr>) -> Self {
        Self(Rc::new(RefCell::new(LinkState { failures_left, assign, address, attempts: 0 })))
    }

    /// Every association fails.
    pub fn unreachable() -> Self {
        Self::with(None, Ipv4Addr::UNSPECIFIED, None)
    }

    /// The first `failures` associations fail, then `assign` is handed out.
    pub fn flaky(failures: u32, assign: Ipv4Addr) -> Self {
        Self::with(Some(failures), assign, None)
    }

    /// Already associated.
    pub fn online(address: Ipv4Addr) -> Self {
        Self::with(Some(0), address, Some(address))
    }

    pub fn attempts(&self) -> u32 {
        self.0.borrow().attempts
    }

    pub fn drop_link(&self) {
        self.0.borrow_mut().address = None;
    }
}

impl LinkLayer for FakeLink {
    fn associate(&mut self, _ssid: &str, _password: &str) -> anyhow::Result<()> {
        let mut state = self.0.borrow_mut();
        state.attempts += 1;
        match state.failures_left {
            None => bail!("no access point in range"),
            Some(0) => {
                state.address = Some(state.assign);
                Ok(())
            }
            Some(n) => {
                state.failures_left = Some(n - 1);
                bail!("authentication timeout")
            }
        }
    }

    fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.0.borrow().address
    }
}

// ==============================================================================
// dht driver
// ==============================================================================

#[derive(Debug, Clone, Copy)]
pub enum DhtStep {
    Value(f32, f32),
    Empty,
    Fail(&'static str),
}

/// Plays back `DhtStep`s, then keeps returning a steady reading.
#[derive(Clone, Default)]
pub struct ScriptedDht {
    steps: Rc<RefCell<VecDeque<DhtStep>>>,
    calls: Rc<Cell<u32>>,
}

impl ScriptedDht {
    pub fn new(steps: impl IntoIterator<Item = DhtStep>) -> Self {
        Self {
            steps: Rc::new(RefCell::new(steps.into_iter().collect())),
            calls: Rc::default(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl DhtDriver for ScriptedDht {
    fn sample(&mut self) -> anyhow::Result<Option<(f32, f32)>> {
        self.calls.set(self.calls.get() + 1);
        match self.steps.borrow_mut().pop_front() {
            Some(DhtStep::Value(t, h)) => Ok(Some((t, h))),
            Some(DhtStep::Empty) => Ok(None),
            Some(DhtStep::Fail(reason)) => Err(anyhow!(reason)),
            None => Ok(Some((21.0, 45.0))),
        }
    }
}

// ==============================================================================
// status led
// ==============================================================================

#[derive(Clone, Default)]
pub struct RecordingLed(Rc<RefCell<Vec<bool>>>);

impl RecordingLed {
    pub fn transitions(&self) -> Vec<bool> {
        self.0.borrow().clone()
    }
}

impl StatusLed for RecordingLed {
    fn set(&mut self, on: bool) -> anyhow::Result<()> {
        self.0.borrow_mut().push(on);
        Ok(())
    }
}

// ==============================================================================
// message bus
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Default)]
struct BusLog {
    opened: Vec<SessionOptions>,
    published: Vec<Published>,
    serviced: u32,
    fail_connect: Option<String>,
    fail_publish: Option<String>,
    fail_service: Option<String>,
}

/// Connector whose sessions record everything they are asked to send.
#[derive(Clone, Default)]
pub struct RecordingBus(Rc<RefCell<BusLog>>);

impl RecordingBus {
    pub fn opened(&self) -> Vec<SessionOptions> {
        self.0.borrow().opened.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.0.borrow().published.clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|p| p.retain)
            .filter_map(|p| {
                let value: serde_json::Value = serde_json::from_str(&p.payload).ok()?;
                value["status"].as_str().map(str::to_string)
            })
            .collect()
    }

    pub fn serviced(&self) -> u32 {
        self.0.borrow().serviced
    }

    pub fn fail_connect(&self, reason: &str) {
        self.0.borrow_mut().fail_connect = Some(reason.to_string());
    }

    pub fn fail_publish(&self, reason: &str) {
        self.0.borrow_mut().fail_publish = Some(reason.to_string());
    }

    pub fn fail_service(&self, reason: &str) {
        self.0.borrow_mut().fail_service = Some(reason.to_string());
    }
}

impl BusConnector for RecordingBus {
    fn open(
        &self,
        _transport: &TransportFactory,
        options: &SessionOptions,
    ) -> Result<Box<dyn BusSession>, PublishError> {
        self.0.borrow_mut().opened.push(options.clone());
        Ok(Box::new(RecordingSession { log: Rc::clone(&self.0), connected: false }))
    }
}

struct RecordingSession {
    log: Rc<RefCell<BusLog>>,
    connected: bool,
}

impl BusSession for RecordingSession {
    fn connect(&mut self) -> Result<(), PublishError> {
        if let Some(reason) = &self.log.borrow().fail_connect {
            return Err(PublishError::Transport(reason.clone()));
        }
        self.connected = true;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        let mut log = self.log.borrow_mut();
        if let Some(reason) = &log.fail_publish {
            return Err(PublishError::Transport(reason.clone()));
        }
        log.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    fn service(&mut self, _timeout: Duration) -> Result<(), PublishError> {
        let mut log = self.log.borrow_mut();
        log.serviced += 1;
        match &log.fail_service {
            Some(reason) => Err(PublishError::Transport(reason.clone())),
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ==============================================================================
// settings store
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Writable,
    ReadOnly,
    Broken,
}

struct StoreState {
    saved: Option<SettingsDocument>,
    mode: StoreMode,
    persists: u32,
}

/// In-memory settings store.
#[derive(Clone)]
pub struct MemoryStore(Rc<RefCell<StoreState>>);

impl MemoryStore {
    pub fn new(saved: Option<SettingsDocument>) -> Self {
        Self(Rc::new(RefCell::new(StoreState { saved, mode: StoreMode::Writable, persists: 0 })))
    }

    pub fn set_mode(&self, mode: StoreMode) {
        self.0.borrow_mut().mode = mode;
    }

    pub fn saved(&self) -> Option<SettingsDocument> {
        self.0.borrow().saved.clone()
    }

    pub fn persists(&self) -> u32 {
        self.0.borrow().persists
    }
}

impl SettingsStore for MemoryStore {
    fn load(&self) -> Result<SettingsDocument, ConfigError> {
        self.0
            .borrow()
            .saved
            .clone()
            .ok_or_else(|| ConfigError::NotFound(PathBuf::from("memory")))
    }

    fn persist(&self, document: &SettingsDocument) -> Result<(), ConfigError> {
        let mut state = self.0.borrow_mut();
        match state.mode {
            StoreMode::Writable => {
                state.saved = Some(document.clone());
                state.persists += 1;
                Ok(())
            }
            StoreMode::ReadOnly => Err(ConfigError::StorageReadOnly(PathBuf::from("memory"))),
            StoreMode::Broken => Err(ConfigError::Io {
                path: PathBuf::from("memory"),
                source: std::io::Error::other("flash worn out"),
            }),
        }
    }
}
