//! Serial-line RFID reader bridge.
//!
//! A microcontroller drives the RFID module and speaks a line protocol over
//! a character device (USB CDC-ACM, UART, or a FIFO):
//!
//! ```text
//! bridge -> host   <decimal-id>:<text>\n   a tag was presented
//! host -> bridge   W:<text>\n              store text on the next tag
//! bridge -> host   OK:<id>\n | ERR:<message>\n
//! ```
//!
//! The device is opened for each operation and closed on release, so the
//! bridge is re-initialized between reads and no read inherits stale input.

use rollcall_core::{ReadError, Shutdown, TokenId, TokenRead, TokenReader, WriteError};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

/// Text capacity of the three data blocks the bridge writes per tag.
pub const MAX_TEXT_LEN: usize = 48;

/// Longest single wait before re-checking shutdown.
const POLL_SLICE: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 256;

/// Failure while waiting for one protocol line.
#[derive(Debug)]
enum LineError {
    Timeout(Duration),
    Cancelled,
    Closed,
    Io(io::Error),
}

impl From<LineError> for ReadError {
    fn from(e: LineError) -> Self {
        match e {
            LineError::Timeout(d) => ReadError::Timeout(d),
            LineError::Cancelled => ReadError::Cancelled,
            LineError::Closed => ReadError::Device("reader closed the line".into()),
            LineError::Io(e) => ReadError::Io(e),
        }
    }
}

impl From<LineError> for WriteError {
    fn from(e: LineError) -> Self {
        match e {
            LineError::Timeout(d) => WriteError::Timeout(d),
            LineError::Cancelled => WriteError::Cancelled,
            LineError::Closed => WriteError::Unavailable("reader closed the line".into()),
            LineError::Io(e) => WriteError::Io(e),
        }
    }
}

/// An open handle on the bridge. Restores the line settings when dropped.
struct Port {
    file: File,
    saved: Option<libc::termios>,
    pending: Vec<u8>,
}

impl Port {
    fn open(path: &str, baud: u32) -> io::Result<Self> {
        let speed = baud_constant(baud)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)?;
        let fd = file.as_raw_fd();

        // SAFETY: termios is a plain C struct; all-zero is a valid bit pattern
        // and it is fully overwritten by tcgetattr on success.
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid for the lifetime of `file`; `tio` is a valid out-pointer.
        if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOTTY) {
                // FIFOs and plain files carry the protocol without line settings.
                tracing::debug!(device = path, "reader is not a tty; skipping line setup");
                return Ok(Self {
                    file,
                    saved: None,
                    pending: Vec::new(),
                });
            }
            return Err(err);
        }
        let saved = tio;

        // SAFETY: `tio` was initialized by tcgetattr above; fd is valid.
        unsafe {
            libc::cfmakeraw(&mut tio);
            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            // Drop anything the bridge sent before this read began.
            libc::tcflush(fd, libc::TCIFLUSH);
        }

        Ok(Self {
            file,
            saved: Some(saved),
            pending: Vec::new(),
        })
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }

    /// Wait for the next non-empty line, honoring `timeout` and `shutdown`.
    fn read_line(
        &mut self,
        timeout: Option<Duration>,
        shutdown: &Shutdown,
    ) -> Result<String, LineError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..pos]);
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                return Ok(line.to_string());
            }

            if shutdown.is_triggered() {
                return Err(LineError::Cancelled);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(LineError::Timeout(timeout.unwrap_or_default()));
                    }
                    remaining.min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };

            if !self.poll_readable(slice)? {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.file.read(&mut chunk) {
                Ok(0) => return Err(LineError::Closed),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(LineError::Io(e)),
            }
        }
    }

    fn poll_readable(&self, wait: Duration) -> Result<bool, LineError> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = wait.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pfd` is a single valid pollfd and fd lives as long as `self.file`.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(LineError::Io(err));
        }
        if ret == 0 {
            return Ok(false);
        }
        if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(LineError::Io(io::Error::new(
                io::ErrorKind::Other,
                "reader device error",
            )));
        }
        Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.as_ref() {
            // SAFETY: fd is still open here; `saved` came from tcgetattr on it.
            unsafe {
                libc::tcsetattr(self.file.as_raw_fd(), libc::TCSANOW, saved);
            }
        }
    }
}

fn baud_constant(baud: u32) -> io::Result<libc::speed_t> {
    Ok(match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {other}"),
            ))
        }
    })
}

/// Parse a tag presentation line (`<id>:<text>`).
pub fn parse_read_line(line: &str) -> Result<TokenRead, ReadError> {
    if let Some(message) = line.strip_prefix("ERR:") {
        return Err(ReadError::Device(message.trim().to_string()));
    }
    let (id, text) = line
        .split_once(':')
        .ok_or_else(|| ReadError::Malformed(line.to_string()))?;
    let id = id
        .parse::<TokenId>()
        .map_err(|_| ReadError::Malformed(line.to_string()))?;
    Ok(TokenRead {
        id,
        text: text.to_string(),
    })
}

/// Parse a reply to a write command. `Ok(None)` means the line was not a
/// reply (e.g. a tag presentation) and should be skipped.
pub fn parse_write_reply(line: &str) -> Result<Option<TokenId>, WriteError> {
    if let Some(id) = line.strip_prefix("OK:") {
        return id
            .parse::<TokenId>()
            .map(Some)
            .map_err(|_| WriteError::Malformed(line.to_string()));
    }
    if let Some(message) = line.strip_prefix("ERR:") {
        return Err(WriteError::Rejected(message.trim().to_string()));
    }
    Ok(None)
}

/// RFID reader reached through a serial-line bridge.
pub struct SerialTokenReader {
    device_path: String,
    baud: u32,
    shutdown: Shutdown,
    port: Option<Port>,
}

impl SerialTokenReader {
    pub fn new(device_path: impl Into<String>, baud: u32, shutdown: Shutdown) -> Self {
        Self {
            device_path: device_path.into(),
            baud,
            shutdown,
            port: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

fn acquire<'a>(slot: &'a mut Option<Port>, path: &str, baud: u32) -> io::Result<&'a mut Port> {
    let port = match slot.take() {
        Some(port) => port,
        None => {
            let port = Port::open(path, baud)?;
            tracing::debug!(device = path, baud, "reader acquired");
            port
        }
    };
    Ok(slot.insert(port))
}

impl TokenReader for SerialTokenReader {
    fn read(&mut self, timeout: Option<Duration>) -> Result<TokenRead, ReadError> {
        let Self {
            device_path,
            baud,
            shutdown,
            port,
        } = self;
        let port = acquire(port, device_path, *baud)
            .map_err(|e| ReadError::Unavailable(format!("{device_path}: {e}")))?;

        let line = port.read_line(timeout, shutdown)?;
        tracing::debug!(device = %device_path, line = %line, "reader line");
        parse_read_line(&line)
    }

    fn write(&mut self, text: &str, timeout: Option<Duration>) -> Result<TokenId, WriteError> {
        if text.len() > MAX_TEXT_LEN {
            return Err(WriteError::TooLong {
                len: text.len(),
                max: MAX_TEXT_LEN,
            });
        }
        if text.contains(['\n', '\r']) {
            return Err(WriteError::Rejected("token text must be a single line".into()));
        }

        let Self {
            device_path,
            baud,
            shutdown,
            port,
        } = self;
        let port = acquire(port, device_path, *baud)
            .map_err(|e| WriteError::Unavailable(format!("{device_path}: {e}")))?;

        port.send_line(&format!("W:{text}"))?;
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let line = port.read_line(remaining, shutdown)?;
            if let Some(id) = parse_write_reply(&line)? {
                return Ok(id);
            }
            tracing::debug!(device = %device_path, line = %line, "ignoring non-reply line during write");
        }
    }

    fn release(&mut self) {
        if self.port.take().is_some() {
            tracing::trace!(device = %self.device_path, "reader released");
        }
    }
}
