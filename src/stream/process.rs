//! Subprocess driver
//!
//! Spawns a child process and services its stdio through the multiplexing
//! loop, so stdout/stderr/named-pipe traffic is drained concurrently with
//! the child running. Cancellation kills the child; the loop's exit
//! predicate observes both child exit and the cancel flag.

use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, instrument};

use crate::error::SluiceError;
use crate::stream::{
    multiplex_loop, ReadConnector, SinkHandle, StreamFetcher, StreamPusher, WriteConnector,
};

/// Stream wiring for one child process. Channels left `None` are inherited
/// from the parent instead of piped.
#[derive(Default)]
pub struct ProcessHarness {
    pub stdin: Option<Box<dyn StreamFetcher>>,
    pub stdout: Option<Box<dyn StreamPusher>>,
    pub stderr: Option<Box<dyn StreamPusher>>,
    /// Additional sources to drain, e.g. named pipes the child writes.
    pub readers: Vec<ReadConnector>,
    /// Additional sinks to feed, e.g. named pipes the child reads.
    pub writers: Vec<WriteConnector>,
}

impl ProcessHarness {
    pub fn new() -> Self {
        Self::default()
    }
}

fn take_fd<T: IntoRawFd>(handle: T) -> OwnedFd {
    // Safety: the child stdio handle yields a descriptor we now own.
    unsafe { OwnedFd::from_raw_fd(handle.into_raw_fd()) }
}

/// Run `command` to completion, servicing its streams through the
/// multiplexing loop.
///
/// Returns the child's exit status; interpreting a non-zero status (fatal
/// vs. expected-under-cancellation) is the caller's decision. An error from
/// the loop kills the child before propagating.
#[instrument(skip_all, fields(program = ?command.get_program()))]
pub fn run_process(
    command: &mut Command,
    harness: ProcessHarness,
    cancel: &AtomicBool,
) -> Result<ExitStatus, SluiceError> {
    if harness.stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    if harness.stdout.is_some() {
        command.stdout(Stdio::piped());
    }
    if harness.stderr.is_some() {
        command.stderr(Stdio::piped());
    }

    let mut child = command.spawn()?;
    debug!(pid = child.id(), "child spawned");

    let mut readers = harness.readers;
    let mut writers = harness.writers;

    if let Some(sink) = harness.stdout {
        let fd = child
            .stdout
            .take()
            .map(take_fd)
            .ok_or_else(|| missing_channel("stdout"))?;
        readers.push(ReadConnector::new(fd, sink));
    }
    if let Some(sink) = harness.stderr {
        let fd = child
            .stderr
            .take()
            .map(take_fd)
            .ok_or_else(|| missing_channel("stderr"))?;
        readers.push(ReadConnector::new(fd, sink));
    }
    if let Some(source) = harness.stdin {
        let fd = child
            .stdin
            .take()
            .map(take_fd)
            .ok_or_else(|| missing_channel("stdin"))?;
        writers.push(WriteConnector::new(source, SinkHandle::Fd(fd)));
    }

    let mut finished: Option<ExitStatus> = None;
    let result = multiplex_loop(
        || {
            if finished.is_none() {
                if let Ok(Some(status)) = child.try_wait() {
                    finished = Some(status);
                }
            }
            finished.is_some() || cancel.load(Ordering::Relaxed)
        },
        readers,
        writers,
    );

    if result.is_err() || (finished.is_none() && cancel.load(Ordering::Relaxed)) {
        let _ = child.kill();
    }

    let status = match finished {
        Some(status) => status,
        None => child.wait()?,
    };
    result?;
    debug!(code = status.code(), "child finished");
    Ok(status)
}

fn missing_channel(name: &str) -> SluiceError {
    SluiceError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("child {name} channel was not piped"),
    ))
}
