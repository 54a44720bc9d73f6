//! Scriptable transport doubles for session tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use switchboard_transport::{
    Connector, Frame, LinkId, ReadyState, SignalSender, Transport, TransportError,
    TransportSignal,
};

#[derive(Debug)]
pub(crate) struct MockState {
    pub state: ReadyState,
    pub sent: Vec<Frame>,
    pub fail_sends: bool,
    pub closed_with: Option<(u16, String)>,
    pub signals: SignalSender,
}

/// Test-side view of one mock transport.
#[derive(Debug, Clone)]
pub(crate) struct MockWire(Arc<Mutex<MockState>>);

impl MockWire {
    pub fn new(signals: SignalSender, state: ReadyState) -> Self {
        Self(Arc::new(Mutex::new(MockState {
            state,
            sent: Vec::new(),
            fail_sends: false,
            closed_with: None,
            signals,
        })))
    }

    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link(&self) -> LinkId {
        self.lock().signals.link()
    }

    /// Flip to open and report it.
    pub fn open(&self) {
        let mut s = self.lock();
        s.state = ReadyState::Open;
        s.signals.emit(TransportSignal::Open);
    }

    /// Drop the link from the remote side.
    pub fn drop_link(&self) {
        let mut s = self.lock();
        s.state = ReadyState::Closed;
        s.signals.emit(TransportSignal::Close);
    }

    /// Deliver a frame as if the peer sent it.
    pub fn inject(&self, frame: &str) {
        self.lock()
            .signals
            .emit(TransportSignal::Message(frame.to_string()));
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<Frame> {
        std::mem::take(&mut self.lock().sent)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport(self.clone()))
    }
}

pub(crate) struct MockTransport(MockWire);

impl Transport for MockTransport {
    fn ready_state(&self) -> ReadyState {
        self.0.lock().state
    }

    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        let mut s = self.0.lock();
        if s.state != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        if s.fail_sends {
            return Err(TransportError::Send(anyhow::anyhow!("mock send failure")));
        }
        s.sent.push(frame.to_string());
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut s = self.0.lock();
        if s.state == ReadyState::Closed {
            return;
        }
        s.state = ReadyState::Closed;
        s.closed_with = Some((code, reason.to_string()));
        s.signals.emit(TransportSignal::Close);
    }
}

/// Connector handing out mock transports and keeping their wires.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockConnector {
    wires: Arc<Mutex<Vec<MockWire>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dials(&self) -> usize {
        self.wires.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Wire of the most recent dial.
    pub fn last(&self) -> MockWire {
        self.wires
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
            .expect("nothing dialed yet")
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _url: &str,
        signals: SignalSender,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let wire = MockWire::new(signals, ReadyState::Connecting);
        let transport = wire.transport();
        self.wires
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(wire);
        Ok(transport)
    }
}
