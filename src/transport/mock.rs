//! In-memory channel for tests

use super::{Canceller, Channel, Connector};
use crate::codec::{self, Frame, HEADER_LEN};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Both ends of a mock channel: what the client wrote and what the peer will send
#[derive(Clone, Default)]
pub struct MockWire {
    inner: Arc<Mutex<WireInner>>,
}

#[derive(Default)]
struct WireInner {
    writes: Vec<Vec<u8>>,
    incoming: VecDeque<u8>,
    fail_next_write: Option<io::ErrorKind>,
    write_delay: Duration,
    hung_up: bool,
    shutdowns: usize,
    cancellations: usize,
}

impl MockWire {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `write_all` call, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.inner.lock().writes.clear();
    }

    /// Parse everything written so far back into frames
    pub fn frames(&self) -> Vec<Frame> {
        let bytes: Vec<u8> = self.inner.lock().writes.concat();

        let mut frames = Vec::new();
        let mut rest = bytes.as_slice();
        while rest.len() >= HEADER_LEN {
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&rest[..HEADER_LEN]);
            let Ok((opcode, len)) = codec::decode_header(&header) else {
                break;
            };
            let end = (HEADER_LEN + len).min(rest.len());
            frames.push(Frame {
                opcode,
                payload: rest[HEADER_LEN..end].to_vec(),
            });
            rest = &rest[end..];
        }
        frames
    }

    /// Queue a frame for the client to read
    pub fn inject_frame(&self, opcode: i32, payload: &[u8]) {
        if let Ok(frame) = codec::encode(opcode, payload) {
            self.inner.lock().incoming.extend(frame);
        }
    }

    /// Queue raw bytes for the client to read
    pub fn inject_bytes(&self, bytes: &[u8]) {
        self.inner.lock().incoming.extend(bytes.iter().copied());
    }

    pub fn pending_incoming(&self) -> usize {
        self.inner.lock().incoming.len()
    }

    /// Make the next write fail with `kind`
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.inner.lock().fail_next_write = Some(kind);
    }

    /// Sleep after each recorded write (widens race windows in concurrency tests)
    pub fn set_write_delay(&self, delay: Duration) {
        self.inner.lock().write_delay = delay;
    }

    /// Peer closes its end: reads report EOF
    pub fn hang_up(&self) {
        self.inner.lock().hung_up = true;
    }

    pub fn shutdowns(&self) -> usize {
        self.inner.lock().shutdowns
    }

    pub fn cancellations(&self) -> usize {
        self.inner.lock().cancellations
    }
}

pub struct MockChannel {
    wire: MockWire,
}

impl Channel for MockChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let delay = {
            let mut inner = self.wire.inner.lock();
            if let Some(kind) = inner.fail_next_write.take() {
                return Err(io::Error::from(kind));
            }
            if inner.hung_up {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            inner.writes.push(buf.to_vec());
            inner.write_delay
        };

        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut inner = self.wire.inner.lock();
        if inner.incoming.len() < buf.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        for byte in buf.iter_mut() {
            *byte = inner.incoming.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        let inner = self.wire.inner.lock();
        if inner.hung_up && inner.incoming.is_empty() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(inner.incoming.len())
    }

    fn canceller(&self) -> Option<Canceller> {
        let wire = self.wire.clone();
        Some(Box::new(move || wire.inner.lock().cancellations += 1))
    }

    fn shutdown(&mut self) {
        self.wire.inner.lock().shutdowns += 1;
    }
}

/// Connector that accepts exactly one endpoint name, always onto the same wire
#[derive(Clone, Default)]
pub struct MockConnector {
    wire: MockWire,
    listening: Arc<Mutex<Option<String>>>,
    attempts: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    /// Connector with no peer listening
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listening_on(endpoint: &str) -> Self {
        let connector = Self::new();
        connector.set_listening(Some(endpoint));
        connector
    }

    /// Change which endpoint accepts connections (`None` = peer gone)
    pub fn set_listening(&self, endpoint: Option<&str>) {
        *self.listening.lock() = endpoint.map(str::to_string);
    }

    pub fn wire(&self) -> MockWire {
        self.wire.clone()
    }

    /// Endpoints tried so far, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, endpoint: &str) -> io::Result<Box<dyn Channel>> {
        self.attempts.lock().push(endpoint.to_string());

        if self.listening.lock().as_deref() != Some(endpoint) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }

        // A fresh connection starts with a live peer
        self.wire.inner.lock().hung_up = false;
        Ok(Box::new(MockChannel {
            wire: self.wire.clone(),
        }))
    }
}
