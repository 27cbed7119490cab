use std::io;
#[cfg(any(unix, windows))]
use std::io::{Read, Write};
use std::time::Duration;

use super::{Channel, Connector};
#[cfg(unix)]
use super::Canceller;

/// The peer listens on one of `<prefix>0` .. `<prefix>9`
pub const ENDPOINT_COUNT: usize = 10;

/// Platform endpoint prefix for the peer's IPC sockets/pipes
#[cfg(windows)]
pub fn default_prefix() -> String {
    r"\\.\pipe\discord-ipc-".to_string()
}

/// Platform endpoint prefix for the peer's IPC sockets/pipes
#[cfg(not(windows))]
pub fn default_prefix() -> String {
    let runtime_dir = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "/tmp".to_string());

    format!("{}/discord-ipc-", runtime_dir.trim_end_matches('/'))
}

/// Candidate endpoints in sweep order
pub fn endpoint_candidates(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{}{}", prefix, i)).collect()
}

/// Opens Unix domain sockets (or named pipes on Windows)
#[derive(Debug, Clone)]
pub struct LocalConnector {
    read_timeout: Duration,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self {
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for LocalConnector {
    #[cfg(unix)]
    fn open(&self, endpoint: &str) -> io::Result<Box<dyn Channel>> {
        let stream = std::os::unix::net::UnixStream::connect(endpoint)?;
        // Bounds the body read after a header has already arrived
        stream.set_read_timeout(Some(self.read_timeout))?;
        Ok(Box::new(SocketChannel {
            stream,
            pending: Vec::new(),
        }))
    }

    #[cfg(windows)]
    fn open(&self, endpoint: &str) -> io::Result<Box<dyn Channel>> {
        let _ = self.read_timeout;
        let pipe = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(endpoint)?;
        Ok(Box::new(PipeChannel { pipe }))
    }

    #[cfg(not(any(unix, windows)))]
    fn open(&self, endpoint: &str) -> io::Result<Box<dyn Channel>> {
        let _ = self.read_timeout;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no local IPC transport for {} on this platform", endpoint),
        ))
    }
}

#[cfg(unix)]
struct SocketChannel {
    stream: std::os::unix::net::UnixStream,
    /// Bytes pulled in by `available` and not yet handed out by `read_exact`
    pending: Vec<u8>,
}

#[cfg(unix)]
impl Channel for SocketChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let buffered = self.pending.len().min(buf.len());
        buf[..buffered].copy_from_slice(&self.pending[..buffered]);
        self.pending.drain(..buffered);

        if buffered < buf.len() {
            self.stream.read_exact(&mut buf[buffered..])?;
        }
        Ok(())
    }

    fn available(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; 1024];

        self.stream.set_nonblocking(true)?;
        let read = self.stream.read(&mut chunk);
        self.stream.set_nonblocking(false)?;

        match read {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the socket",
            )),
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(self.pending.len())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(self.pending.len()),
            Err(e) => Err(e),
        }
    }

    fn canceller(&self) -> Option<Canceller> {
        let stream = self.stream.try_clone().ok()?;
        Some(Box::new(move || {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }))
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(windows)]
struct PipeChannel {
    pipe: std::fs::File,
}

#[cfg(windows)]
impl Channel for PipeChannel {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.pipe.write_all(buf)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.pipe.read_exact(buf)
    }

    fn available(&mut self) -> io::Result<usize> {
        use std::os::windows::io::AsRawHandle;
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Pipes::PeekNamedPipe;

        let mut total: u32 = 0;
        // SAFETY: the handle is owned by `self.pipe` and stays open for the call;
        // only the byte count is written back.
        let peeked = unsafe {
            PeekNamedPipe(
                HANDLE(self.pipe.as_raw_handle()),
                None,
                0,
                None,
                Some(&mut total),
                None,
            )
        };

        match peeked {
            Ok(()) => Ok(total as usize),
            Err(_) => Err(pipe_peek_error(io::Error::last_os_error())),
        }
    }
}

/// A closed or broken pipe reads as a hang-up
#[cfg(any(windows, test))]
fn pipe_peek_error(err: io::Error) -> io::Error {
    // ERROR_BROKEN_PIPE, ERROR_NO_DATA, ERROR_PIPE_NOT_CONNECTED
    match err.raw_os_error() {
        Some(109 | 232 | 233) => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        _ => err,
    }
}
