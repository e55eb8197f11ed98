//! Streaming connector framework
//!
//! Adapter traits for chunked pull/push I/O, connectors pairing an OS handle
//! with an adapter, and a cooperative poll(2)-driven loop that services many
//! connectors at once. Single-threaded by design: "concurrency" here is
//! interleaving of I/O readiness, never parallel CPU work, which keeps the
//! loop portable across pipes, sockets and regular files.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SluiceError;
use crate::status::LogBatch;

pub mod demux;
pub mod process;

pub use demux::FrameDemux;

/// Upper bound on a single pull.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Bounded poll timeout so the exit predicate is re-evaluated even when no
/// I/O is ready. This is what makes external cancellation observable.
const POLL_TIMEOUT_MS: i32 = 100;

// ─────────────────────────────────────────────────────────────
// Adapter traits
// ─────────────────────────────────────────────────────────────

/// Pull side of a stream. An empty chunk means end of stream.
pub trait StreamFetcher: Send {
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, SluiceError>;
}

/// Push side of a stream.
pub trait StreamPusher: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError>;

    fn close(&mut self) -> Result<(), SluiceError> {
        Ok(())
    }
}

impl<P: StreamPusher + ?Sized> StreamPusher for Box<P> {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        (**self).write(data)
    }

    fn close(&mut self) -> Result<(), SluiceError> {
        (**self).close()
    }
}

/// Fetcher over an in-memory byte buffer.
pub struct MemoryFetcher {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryFetcher {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl StreamFetcher for MemoryFetcher {
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, SluiceError> {
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(chunk)
    }
}

/// Pusher writing through to any [`io::Write`]. Close flushes, never closes
/// the underlying writer.
pub struct WritePipe<W: io::Write + Send> {
    inner: W,
}

impl<W: io::Write + Send> WritePipe<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: io::Write + Send> StreamPusher for WritePipe<W> {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        self.inner.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SluiceError> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Shared byte buffer a pusher accumulates into; the owner reads it back
/// after the loop finishes.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

pub fn shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Pusher that appends every chunk into a [`SharedBuffer`].
pub struct AccumulateBinding {
    buffer: SharedBuffer,
}

impl AccumulateBinding {
    pub fn new(buffer: SharedBuffer) -> Self {
        Self { buffer }
    }
}

impl StreamPusher for AccumulateBinding {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        self.buffer.lock().extend_from_slice(data);
        Ok(())
    }
}

/// Pusher that parses newline-delimited JSON progress documents
/// (`{"total": .., "current": .., "message": ..}`) and hands each one to a
/// sink callback. Malformed lines are logged and dropped, never fatal.
pub struct ProgressPusher {
    sink: Box<dyn FnMut(&LogBatch) -> Result<(), SluiceError> + Send>,
    line: Vec<u8>,
}

impl ProgressPusher {
    pub fn new(sink: Box<dyn FnMut(&LogBatch) -> Result<(), SluiceError> + Send>) -> Self {
        Self {
            sink,
            line: Vec::new(),
        }
    }

    fn emit(&mut self) -> Result<(), SluiceError> {
        let line = std::mem::take(&mut self.line);
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<serde_json::Value>(trimmed) {
            Ok(doc) => {
                let batch = LogBatch {
                    log: None,
                    progress_total: doc.get("total").and_then(|v| v.as_f64()),
                    progress_current: doc.get("current").and_then(|v| v.as_f64()),
                    progress_message: doc
                        .get("message")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                };
                (self.sink)(&batch)
            }
            Err(err) => {
                warn!(%err, "dropping malformed progress line");
                Ok(())
            }
        }
    }
}

impl StreamPusher for ProgressPusher {
    fn write(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        for &byte in data {
            if byte == b'\n' {
                self.emit()?;
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SluiceError> {
        self.emit()
    }
}

// ─────────────────────────────────────────────────────────────
// OS handle helpers
// ─────────────────────────────────────────────────────────────

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Create an anonymous pipe, (read end, write end).
pub fn os_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: pipe(2) returned two fresh descriptors we now own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Create a named pipe at `path`, owner read/write.
pub fn make_fifo(path: &Path) -> Result<(), SluiceError> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SluiceError::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Open the read side of a FIFO without blocking, ahead of any writer.
///
/// Opened read-write: holding a write reference keeps the descriptor from
/// reading EOF in the window before the producing process connects. The
/// connector is torn down by the loop's exit path instead of by EOF.
pub fn open_fifo_read(path: &Path) -> Result<OwnedFd, SluiceError> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SluiceError::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let raw = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Safety: open(2) returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn stat_mode(path: &Path) -> io::Result<libc::mode_t> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(cpath.as_ptr(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_mode)
}

// ─────────────────────────────────────────────────────────────
// Connectors
// ─────────────────────────────────────────────────────────────

enum Progress {
    Data,
    Eof,
    NotReady,
}

/// Driven by readiness of its source handle: data is pulled from the OS
/// handle and pushed into the sink adapter.
pub struct ReadConnector {
    source: OwnedFd,
    sink: Box<dyn StreamPusher>,
    closed: bool,
}

impl ReadConnector {
    pub fn new(source: OwnedFd, sink: Box<dyn StreamPusher>) -> Self {
        Self {
            source,
            sink,
            closed: false,
        }
    }

    fn fd(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    fn transfer(&mut self) -> Result<Progress, SluiceError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match read_fd(self.fd(), &mut buf) {
            Ok(0) => Ok(Progress::Eof),
            Ok(n) => {
                self.sink.write(&buf[..n])?;
                Ok(Progress::Data)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Progress::NotReady),
            Err(err) => Err(err.into()),
        }
    }

    fn close(&mut self) -> Result<(), SluiceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close()
    }
}

/// The OS handle a write connector targets. FIFO sinks open lazily: a named
/// pipe can only be opened for writing after something has opened it for
/// reading, so the open is retried every loop iteration until it succeeds.
pub enum SinkHandle {
    Fd(OwnedFd),
    Fifo { path: PathBuf, fd: Option<OwnedFd> },
}

impl SinkHandle {
    /// A FIFO sink. The path must already name a FIFO.
    pub fn fifo(path: impl Into<PathBuf>) -> Result<Self, SluiceError> {
        let path = path.into();
        match stat_mode(&path) {
            Ok(mode) if mode & libc::S_IFMT == libc::S_IFIFO => {
                Ok(SinkHandle::Fifo { path, fd: None })
            }
            Ok(_) => Err(SluiceError::NotAFifo {
                path: path.display().to_string(),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(SluiceError::MissingFifo {
                path: path.display().to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            SinkHandle::Fd(_) => true,
            SinkHandle::Fifo { fd, .. } => fd.is_some(),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self {
            SinkHandle::Fd(fd) => Some(fd.as_raw_fd()),
            SinkHandle::Fifo { fd, .. } => fd.as_ref().map(AsRawFd::as_raw_fd),
        }
    }

    /// Attempt the lazy open. "No reader yet" (ENXIO) is tolerated silently
    /// and retried next iteration.
    fn try_open(&mut self) -> Result<(), SluiceError> {
        let SinkHandle::Fifo { path, fd } = self else {
            return Ok(());
        };
        if fd.is_some() {
            return Ok(());
        }
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| SluiceError::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;
        let raw = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(());
            }
            return Err(err.into());
        }
        debug!(path = %path.display(), "opened fifo for writing");
        // Safety: open(2) returned a fresh descriptor we now own.
        *fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
        Ok(())
    }
}

/// Driven by readiness of its sink handle: data is pulled from the source
/// adapter and written to the OS handle.
pub struct WriteConnector {
    source: Box<dyn StreamFetcher>,
    /// `None` once closed.
    sink: Option<SinkHandle>,
    pending: Vec<u8>,
}

impl WriteConnector {
    pub fn new(source: Box<dyn StreamFetcher>, sink: SinkHandle) -> Self {
        Self {
            source,
            sink: Some(sink),
            pending: Vec::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.sink.as_ref().is_some_and(SinkHandle::is_open)
    }

    fn fd(&self) -> Option<RawFd> {
        self.sink.as_ref().and_then(SinkHandle::raw_fd)
    }

    fn transfer(&mut self) -> Result<Progress, SluiceError> {
        if self.pending.is_empty() {
            let chunk = self.source.read_chunk(CHUNK_SIZE)?;
            if chunk.is_empty() {
                return Ok(Progress::Eof);
            }
            self.pending = chunk;
        }
        let Some(fd) = self.fd() else {
            return Ok(Progress::NotReady);
        };
        match write_fd(fd, &self.pending) {
            Ok(n) => {
                self.pending.drain(..n);
                Ok(Progress::Data)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Progress::NotReady),
            Err(err) => Err(err.into()),
        }
    }

    /// Writers close their sink first so a reader on the other side of a
    /// pipe observes EOF. Idempotent.
    fn close(&mut self) -> Result<(), SluiceError> {
        self.sink = None;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
// Multiplexing loop
// ─────────────────────────────────────────────────────────────

fn poll_ready(
    read_fds: &[RawFd],
    write_fds: &[RawFd],
) -> io::Result<(Vec<RawFd>, Vec<RawFd>)> {
    let mut entries: Vec<libc::pollfd> = read_fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .chain(write_fds.iter().map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        }))
        .collect();

    if entries.is_empty() {
        std::thread::sleep(std::time::Duration::from_millis(POLL_TIMEOUT_MS as u64));
        return Ok((Vec::new(), Vec::new()));
    }

    let rc = unsafe {
        libc::poll(
            entries.as_mut_ptr(),
            entries.len() as libc::nfds_t,
            POLL_TIMEOUT_MS,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok((Vec::new(), Vec::new()));
        }
        return Err(err);
    }

    let split = read_fds.len();
    let ready_read = entries[..split]
        .iter()
        .filter(|e| e.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|e| e.fd)
        .collect();
    let ready_write = entries[split..]
        .iter()
        .filter(|e| e.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|e| e.fd)
        .collect();
    Ok((ready_read, ready_write))
}

/// Service all connectors until they drain and the exit predicate holds.
///
/// The exit predicate is evaluated once per iteration before deciding to
/// stop, so the final drain still happens after it turns true. On every exit
/// path, including an error propagated from a pull or push, each remaining
/// connector is closed exactly once.
pub fn multiplex_loop<F: FnMut() -> bool>(
    mut exit: F,
    mut readers: Vec<ReadConnector>,
    mut writers: Vec<WriteConnector>,
) -> Result<(), SluiceError> {
    let result = drive(&mut exit, &mut readers, &mut writers);
    let mut close_result = Ok(());
    for mut reader in readers {
        if let Err(err) = reader.close() {
            close_result = Err(err);
        }
    }
    for mut writer in writers {
        if let Err(err) = writer.close() {
            close_result = Err(err);
        }
    }
    result.and(close_result)
}

fn drive<F: FnMut() -> bool>(
    exit: &mut F,
    readers: &mut Vec<ReadConnector>,
    writers: &mut Vec<WriteConnector>,
) -> Result<(), SluiceError> {
    loop {
        // Evaluate before deciding to stop: the final drain still happens.
        let should_exit = exit();

        let read_fds: Vec<RawFd> = readers.iter().map(ReadConnector::fd).collect();
        let write_fds: Vec<RawFd> = writers.iter().filter_map(|w| w.fd()).collect();
        let (ready_read, ready_write) = poll_ready(&read_fds, &write_fds)?;

        let mut activity = false;

        let mut i = 0;
        while i < readers.len() {
            if ready_read.contains(&readers[i].fd()) {
                match readers[i].transfer()? {
                    Progress::Eof => {
                        let mut done = readers.swap_remove(i);
                        done.close()?;
                        activity = true;
                        continue;
                    }
                    Progress::Data => activity = true,
                    Progress::NotReady => {}
                }
            }
            i += 1;
        }

        let mut i = 0;
        while i < writers.len() {
            let ready = writers[i]
                .fd()
                .map_or(false, |fd| ready_write.contains(&fd));
            if ready {
                match writers[i].transfer()? {
                    Progress::Eof => {
                        let mut done = writers.swap_remove(i);
                        done.close()?;
                        activity = true;
                        continue;
                    }
                    Progress::Data => activity = true,
                    Progress::NotReady => {}
                }
            }
            i += 1;
        }

        // Lazy FIFO opens, retried until a reader appears on the other side.
        for writer in writers.iter_mut() {
            if !writer.is_open() {
                if let Some(sink) = writer.sink.as_mut() {
                    sink.try_open()?;
                }
            }
        }

        let drained = readers.is_empty() && writers.is_empty();
        if should_exit && (drained || !activity) {
            return Ok(());
        }
    }
}
