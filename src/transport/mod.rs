//! IPC transport client
//!
//! Owns a single channel to the presence peer. All channel I/O and the
//! connection state live behind one lock, so a frame's header and body are
//! always written back to back and a disconnect seen by one caller is seen
//! by the next.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::{self, Frame, Opcode, HEADER_LEN};
use crate::error::{ConnectError, SendError};
use crate::presence::Activity;
use crate::types::ConnectionState;

mod local;
pub mod mock;

pub use local::{default_prefix, endpoint_candidates, LocalConnector, ENDPOINT_COUNT};

/// Handshake protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame body accepted from the peer
pub const MAX_INCOMING_LEN: usize = 64 * 1024;

/// Closure that aborts blocking I/O on a channel from another thread
pub type Canceller = Box<dyn Fn() + Send + Sync>;

/// Duplex byte stream to the peer
pub trait Channel: Send {
    /// Write the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Fill the whole buffer
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Bytes that can be read without blocking. Must not lose data.
    ///
    /// Returns `UnexpectedEof` when the peer has hung up.
    fn available(&mut self) -> io::Result<usize> {
        Ok(0)
    }

    /// Handle that can interrupt a blocked read/write, if the platform has one
    fn canceller(&self) -> Option<Canceller> {
        None
    }

    /// Stop both directions before the handle is dropped
    fn shutdown(&mut self) {}
}

/// Opens channels by endpoint name
pub trait Connector: Send + Sync {
    fn open(&self, endpoint: &str) -> io::Result<Box<dyn Channel>>;
}

#[derive(Serialize)]
struct Handshake<'a> {
    v: u32,
    client_id: &'a str,
}

#[derive(Serialize)]
struct SetActivity<'a> {
    cmd: &'static str,
    args: SetActivityArgs<'a>,
    nonce: String,
}

#[derive(Serialize)]
struct SetActivityArgs<'a> {
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity: Option<&'a Activity>,
}

struct Link {
    channel: Option<Box<dyn Channel>>,
    state: ConnectionState,
    endpoint: Option<String>,
}

pub struct TransportClient {
    client_id: String,
    endpoints: Vec<String>,
    connector: Box<dyn Connector>,
    link: Mutex<Link>,
    canceller: Mutex<Option<Canceller>>,
    nonce: AtomicU64,
}

impl TransportClient {
    pub fn new(
        client_id: impl Into<String>,
        endpoints: Vec<String>,
        connector: Box<dyn Connector>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            endpoints,
            connector,
            link: Mutex::new(Link {
                channel: None,
                state: ConnectionState::Disconnected,
                endpoint: None,
            }),
            canceller: Mutex::new(None),
            nonce: AtomicU64::new(1),
        }
    }

    /// Open the first endpoint that accepts us and write the handshake
    pub fn connect(&self) -> Result<(), ConnectError> {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Connected && link.channel.is_some() {
            return Ok(());
        }

        link.state = ConnectionState::Connecting;

        let mut opened = None;
        for endpoint in &self.endpoints {
            match self.connector.open(endpoint) {
                Ok(channel) => {
                    opened = Some((endpoint.clone(), channel));
                    break;
                }
                Err(e) => log::debug!("IPC endpoint {} unavailable: {}", endpoint, e),
            }
        }

        let Some((endpoint, mut channel)) = opened else {
            link.state = ConnectionState::Disconnected;
            return Err(ConnectError::NoPeerAvailable);
        };

        let handshake = Handshake {
            v: PROTOCOL_VERSION,
            client_id: &self.client_id,
        };
        let written = serde_json::to_vec(&handshake)
            .map_err(io::Error::from)
            .and_then(|body| write_frame(channel.as_mut(), Opcode::Handshake.code(), &body));

        if let Err(e) = written {
            log::warn!("Handshake on {} failed: {}", endpoint, e);
            channel.shutdown();
            link.state = ConnectionState::Disconnected;
            return Err(ConnectError::HandshakeFailed(e));
        }

        *self.canceller.lock() = channel.canceller();
        link.channel = Some(channel);
        link.endpoint = Some(endpoint.clone());
        link.state = ConnectionState::Connected;

        // The peer answers the handshake; a rejected client id comes back as Close
        if let Err(e) = drain_incoming(&mut link) {
            log::warn!("IPC peer refused the handshake on {}: {}", endpoint, e);
            self.drop_channel(&mut link);
            return Err(ConnectError::HandshakeFailed(e));
        }

        log::info!("Connected to {}", endpoint);
        Ok(())
    }

    /// Publish an activity
    pub fn send_message(&self, activity: &Activity) -> Result<(), SendError> {
        self.set_activity(Some(activity))
    }

    /// Remove any activity this client published
    pub fn clear_activity(&self) -> Result<(), SendError> {
        self.set_activity(None)
    }

    fn set_activity(&self, activity: Option<&Activity>) -> Result<(), SendError> {
        let command = SetActivity {
            cmd: "SET_ACTIVITY",
            args: SetActivityArgs {
                pid: std::process::id(),
                activity,
            },
            nonce: self.nonce.fetch_add(1, Ordering::Relaxed).to_string(),
        };
        let body = serde_json::to_vec(&command)?;

        let mut link = self.link.lock();
        let Some(channel) = link.channel.as_mut() else {
            return Err(SendError::NotConnected);
        };

        if let Err(e) = write_frame(channel.as_mut(), Opcode::Message.code(), &body) {
            if is_disconnect_error(&e) {
                log::warn!("IPC peer went away during send: {}", e);
                self.drop_channel(&mut link);
                return Err(SendError::Disconnected(e));
            }
            log::warn!("IPC send failed, keeping connection: {}", e);
            return Err(SendError::Transient(e));
        }

        // Keep the read side empty so the peer never stalls on a full pipe
        if let Err(e) = drain_incoming(&mut link) {
            log::warn!("IPC channel failed while reading replies: {}", e);
            self.drop_channel(&mut link);
        }

        Ok(())
    }

    /// Current state, without touching the channel
    pub fn is_connected(&self) -> bool {
        self.link.lock().state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// Endpoint of the open connection
    pub fn endpoint(&self) -> Option<String> {
        self.link.lock().endpoint.clone()
    }

    /// Non-blocking check of the channel: consumes pending replies and notices hang-ups
    pub fn probe_liveness(&self) -> bool {
        let mut link = self.link.lock();
        if link.channel.is_none() {
            return false;
        }

        if let Err(e) = drain_incoming(&mut link) {
            log::warn!("IPC connection lost: {}", e);
            self.drop_channel(&mut link);
        }

        link.state == ConnectionState::Connected
    }

    /// Cancel pending I/O, release the channel and go Disconnected. Safe to call repeatedly.
    pub fn close(&self) {
        // Interrupt a blocked writer before waiting for the lock it holds
        if let Some(cancel) = self.canceller.lock().take() {
            cancel();
        }

        let mut link = self.link.lock();
        if link.channel.is_some() {
            log::info!("Closing IPC connection");
        }
        self.drop_channel(&mut link);
    }

    /// Release the channel and its canceller. Called with the link lock held.
    fn drop_channel(&self, link: &mut Link) {
        if let Some(mut channel) = link.channel.take() {
            channel.shutdown();
        }
        self.canceller.lock().take();
        link.state = ConnectionState::Disconnected;
        link.endpoint = None;
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Write header then body
fn write_frame(channel: &mut dyn Channel, opcode: i32, payload: &[u8]) -> io::Result<()> {
    let header = codec::encode_header(opcode, payload.len())?;
    channel.write_all(&header)?;
    channel.write_all(payload)
}

/// Read one frame: the fixed header, then exactly the advertised body
fn read_frame(channel: &mut dyn Channel) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    channel.read_exact(&mut header)?;
    let (opcode, len) = codec::decode_header(&header)?;
    if len > MAX_INCOMING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer frame of {} bytes exceeds {}", len, MAX_INCOMING_LEN),
        ));
    }

    let mut payload = vec![0u8; len];
    channel.read_exact(&mut payload)?;
    Ok(Frame { opcode, payload })
}

/// Handle every complete frame the peer has sent so far
fn drain_incoming(link: &mut Link) -> io::Result<()> {
    let Some(channel) = link.channel.as_mut() else {
        return Ok(());
    };

    while channel.available()? >= HEADER_LEN {
        let frame = read_frame(channel.as_mut())?;
        match frame.kind() {
            Some(Opcode::Ping) => {
                write_frame(channel.as_mut(), Opcode::Pong.code(), &frame.payload)?;
            }
            Some(Opcode::Close) => {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    format!(
                        "peer closed the connection: {}",
                        String::from_utf8_lossy(&frame.payload)
                    ),
                ));
            }
            _ => log::debug!(
                "Discarding frame op={} ({} bytes)",
                frame.opcode,
                frame.payload.len()
            ),
        }
    }

    Ok(())
}

/// Write errors after which the channel is unusable: broken pipe, peer not listening, no data.
/// Everything else is transient.
pub fn is_disconnect_error(err: &io::Error) -> bool {
    // ERROR_BROKEN_PIPE, ERROR_NO_DATA, ERROR_PIPE_NOT_CONNECTED
    #[cfg(windows)]
    if matches!(err.raw_os_error(), Some(109 | 232 | 233)) {
        return true;
    }

    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}
