//! Job status tracking
//!
//! A job walks a small state machine. The interesting rule is cancellation:
//! once a job is `Canceling`, the only transition the record will accept is
//! `Canceled`, so a worker racing the cancel request cannot resurrect the job
//! by reporting success. Log and progress output is buffered and flushed on a
//! minimum interval to keep chatty tasks from hammering the record backend.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SluiceError;

/// Lifecycle states plus transient refinements of `Running`.
///
/// The numeric codes are the wire values job-record backends store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Inactive,
    Queued,
    Running,
    Success,
    Error,
    Canceled,
    // Sub-states: phases of Running, reported for progress visibility.
    FetchingInput,
    ConvertingInput,
    ConvertingOutput,
    PushingOutput,
    Canceling,
}

impl JobStatus {
    pub fn code(self) -> u16 {
        match self {
            JobStatus::Inactive => 0,
            JobStatus::Queued => 1,
            JobStatus::Running => 2,
            JobStatus::Success => 3,
            JobStatus::Error => 4,
            JobStatus::Canceled => 5,
            JobStatus::FetchingInput => 820,
            JobStatus::ConvertingInput => 821,
            JobStatus::ConvertingOutput => 822,
            JobStatus::PushingOutput => 823,
            JobStatus::Canceling => 824,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => JobStatus::Inactive,
            1 => JobStatus::Queued,
            2 => JobStatus::Running,
            3 => JobStatus::Success,
            4 => JobStatus::Error,
            5 => JobStatus::Canceled,
            820 => JobStatus::FetchingInput,
            821 => JobStatus::ConvertingInput,
            822 => JobStatus::ConvertingOutput,
            823 => JobStatus::PushingOutput,
            824 => JobStatus::Canceling,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Error | JobStatus::Canceled
        )
    }

    /// Whether this state is a transient phase of an active run.
    pub fn is_running_phase(self) -> bool {
        matches!(
            self,
            JobStatus::Running
                | JobStatus::FetchingInput
                | JobStatus::ConvertingInput
                | JobStatus::ConvertingOutput
                | JobStatus::PushingOutput
        )
    }

    /// The transition table. Terminal states accept nothing; `Canceling`
    /// accepts only `Canceled`; running phases move freely among themselves
    /// and out to any terminal or to `Canceling`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            JobStatus::Success | JobStatus::Error | JobStatus::Canceled => false,
            JobStatus::Canceling => next == JobStatus::Canceled,
            JobStatus::Inactive | JobStatus::Queued => true,
            s if s.is_running_phase() => {
                next.is_running_phase() || next.is_terminal() || next == JobStatus::Canceling
            }
            _ => false,
        }
    }
}

/// One buffered batch of log text and progress for a job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_current: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.log.is_none()
            && self.progress_total.is_none()
            && self.progress_current.is_none()
            && self.progress_message.is_none()
    }
}

/// Backend a job reports to. Implementations decide persistence; the
/// transition table is their contract to enforce.
pub trait JobRecord: Send + Sync {
    fn update_status(&self, status: JobStatus) -> Result<(), SluiceError>;
    fn append(&self, batch: &LogBatch) -> Result<(), SluiceError>;
    fn current_status(&self) -> JobStatus;
}

// ─────────────────────────────────────────────────────────────
// In-memory record
// ─────────────────────────────────────────────────────────────

/// An observable sequence entry, for asserting ordering of effects.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    Status(JobStatus),
    Batch(LogBatch),
}

#[derive(Default)]
struct MemoryRecordInner {
    status: Option<JobStatus>,
    events: Vec<RecordEvent>,
}

/// Table-enforcing in-memory record. Used by tests and by local runs that
/// want status semantics without a backend.
#[derive(Default)]
pub struct MemoryJobRecord {
    inner: Mutex<MemoryRecordInner>,
}

impl MemoryJobRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(status: JobStatus) -> Self {
        let record = Self::default();
        record.inner.lock().status = Some(status);
        record
    }

    pub fn events(&self) -> Vec<RecordEvent> {
        self.inner.lock().events.clone()
    }

    /// All log text appended so far, concatenated.
    pub fn log_text(&self) -> String {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                RecordEvent::Batch(b) => b.log.clone(),
                _ => None,
            })
            .collect()
    }
}

impl JobRecord for MemoryJobRecord {
    fn update_status(&self, status: JobStatus) -> Result<(), SluiceError> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.status {
            if !current.can_transition_to(status) {
                return Err(SluiceError::StateTransition {
                    from: current,
                    to: status,
                });
            }
            if current == status {
                return Ok(());
            }
        }
        inner.status = Some(status);
        inner.events.push(RecordEvent::Status(status));
        Ok(())
    }

    fn append(&self, batch: &LogBatch) -> Result<(), SluiceError> {
        self.inner.lock().events.push(RecordEvent::Batch(batch.clone()));
        Ok(())
    }

    fn current_status(&self) -> JobStatus {
        self.inner.lock().status.unwrap_or(JobStatus::Inactive)
    }
}

// ─────────────────────────────────────────────────────────────
// HTTP record
// ─────────────────────────────────────────────────────────────

/// Record that POSTs updates to a job endpoint. The backend enforces the
/// transition table and answers a conflict status when it rejects one.
pub struct HttpJobRecord {
    client: reqwest::blocking::Client,
    url: String,
    headers: std::collections::HashMap<String, String>,
}

impl HttpJobRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            url: url.into(),
            headers: std::collections::HashMap::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn post(&self, body: &serde_json::Value) -> Result<reqwest::blocking::Response, SluiceError> {
        let mut request = self.client.post(&self.url).json(body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        Ok(request.send()?)
    }
}

impl JobRecord for HttpJobRecord {
    fn update_status(&self, status: JobStatus) -> Result<(), SluiceError> {
        let response = self.post(&serde_json::json!({ "status": status.code() }))?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            let from = self.current_status();
            return Err(SluiceError::StateTransition { from, to: status });
        }
        response.error_for_status()?;
        Ok(())
    }

    fn append(&self, batch: &LogBatch) -> Result<(), SluiceError> {
        let response = self.post(&serde_json::to_value(batch)?)?;
        response.error_for_status()?;
        Ok(())
    }

    fn current_status(&self) -> JobStatus {
        // Best effort: a backend that cannot answer reads as Inactive.
        let status = self
            .client
            .get(&self.url)
            .send()
            .ok()
            .and_then(|r| r.json::<serde_json::Value>().ok())
            .and_then(|v| v.get("status").and_then(|s| s.as_u64()))
            .and_then(|code| JobStatus::from_code(code as u16));
        status.unwrap_or(JobStatus::Inactive)
    }
}

// ─────────────────────────────────────────────────────────────
// Buffered reporter
// ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct ReporterBuffer {
    batch: LogBatch,
    last_flush: Option<Instant>,
}

/// Buffered, rate-limited front end over a [`JobRecord`].
///
/// Writes accumulate locally and flush when the minimum interval has elapsed
/// (or on `force`). Status updates always flush first, so a backend never
/// sees a status change ordered ahead of the log lines that preceded it.
pub struct StatusReporter {
    record: Box<dyn JobRecord>,
    interval: Duration,
    buffer: Mutex<ReporterBuffer>,
}

impl StatusReporter {
    pub fn new(record: Box<dyn JobRecord>) -> Self {
        Self {
            record,
            interval: Duration::from_millis(500),
            buffer: Mutex::new(ReporterBuffer::default()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Append log text, flushing if the interval has elapsed or on `force`.
    pub fn write(&self, text: &str, force: bool) -> Result<(), SluiceError> {
        let mut buffer = self.buffer.lock();
        match &mut buffer.batch.log {
            Some(log) => log.push_str(text),
            None => buffer.batch.log = Some(text.to_string()),
        }
        self.maybe_flush(&mut buffer, force)
    }

    pub fn update_progress(
        &self,
        total: Option<f64>,
        current: Option<f64>,
        message: Option<&str>,
        force: bool,
    ) -> Result<(), SluiceError> {
        let mut buffer = self.buffer.lock();
        if total.is_some() {
            buffer.batch.progress_total = total;
        }
        if current.is_some() {
            buffer.batch.progress_current = current;
        }
        if let Some(message) = message {
            buffer.batch.progress_message = Some(message.to_string());
        }
        self.maybe_flush(&mut buffer, force)
    }

    /// Drain the buffer to the record regardless of the interval.
    pub fn flush(&self) -> Result<(), SluiceError> {
        let mut buffer = self.buffer.lock();
        self.maybe_flush(&mut buffer, true)
    }

    /// Flush pending output, then transition. Identical-status updates are
    /// absorbed here so phase loops do not spam the backend.
    pub fn update_status(&self, status: JobStatus) -> Result<(), SluiceError> {
        self.flush()?;
        if self.record.current_status() == status {
            return Ok(());
        }
        debug!(status = ?status, code = status.code(), "job status update");
        self.record.update_status(status)
    }

    pub fn current_status(&self) -> JobStatus {
        self.record.current_status()
    }

    fn maybe_flush(&self, buffer: &mut ReporterBuffer, force: bool) -> Result<(), SluiceError> {
        if buffer.batch.is_empty() {
            return Ok(());
        }
        let due = match buffer.last_flush {
            Some(at) => at.elapsed() >= self.interval,
            None => true,
        };
        if !(force || due) {
            return Ok(());
        }
        let batch = std::mem::take(&mut buffer.batch);
        buffer.last_flush = Some(Instant::now());
        self.record.append(&batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for status in [
            JobStatus::Inactive,
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::Canceled,
            JobStatus::FetchingInput,
            JobStatus::ConvertingInput,
            JobStatus::ConvertingOutput,
            JobStatus::PushingOutput,
            JobStatus::Canceling,
        ] {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(999), None);
    }

    #[test]
    fn canceling_accepts_only_canceled() {
        let from = JobStatus::Canceling;
        assert!(from.can_transition_to(JobStatus::Canceled));
        for next in [
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Error,
            JobStatus::FetchingInput,
        ] {
            assert!(!from.can_transition_to(next), "Canceling -> {next:?}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [JobStatus::Success, JobStatus::Error, JobStatus::Canceled] {
            for next in [JobStatus::Running, JobStatus::Queued, JobStatus::Canceling] {
                assert!(!from.can_transition_to(next));
            }
        }
    }

    #[test]
    fn running_phases_interchange() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::FetchingInput));
        assert!(JobStatus::FetchingInput.can_transition_to(JobStatus::ConvertingInput));
        assert!(JobStatus::PushingOutput.can_transition_to(JobStatus::Success));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Canceling));
    }

    #[test]
    fn memory_record_rejects_bad_transition() {
        let record = MemoryJobRecord::starting_at(JobStatus::Canceling);
        let err = record.update_status(JobStatus::Success).unwrap_err();
        assert!(matches!(
            err,
            SluiceError::StateTransition {
                from: JobStatus::Canceling,
                to: JobStatus::Success
            }
        ));
        record.update_status(JobStatus::Canceled).unwrap();
        assert_eq!(record.current_status(), JobStatus::Canceled);
    }

    struct Probe(std::sync::Arc<MemoryJobRecord>);
    impl JobRecord for Probe {
        fn update_status(&self, s: JobStatus) -> Result<(), SluiceError> {
            self.0.update_status(s)
        }
        fn append(&self, b: &LogBatch) -> Result<(), SluiceError> {
            self.0.append(b)
        }
        fn current_status(&self) -> JobStatus {
            self.0.current_status()
        }
    }

    #[test]
    fn reporter_orders_log_before_status() {
        let record = std::sync::Arc::new(MemoryJobRecord::new());
        let reporter = StatusReporter::new(Box::new(Probe(record.clone())))
            .with_interval(Duration::from_secs(3600));

        reporter.write("buffered\n", false).unwrap();
        reporter.update_status(JobStatus::Running).unwrap();

        let events = record.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RecordEvent::Batch(b) if b.log.as_deref() == Some("buffered\n")));
        assert!(matches!(events[1], RecordEvent::Status(JobStatus::Running)));
    }

    #[test]
    fn rate_limit_buffers_until_forced() {
        let record = std::sync::Arc::new(MemoryJobRecord::new());
        let reporter = StatusReporter::new(Box::new(Probe(record.clone())))
            .with_interval(Duration::from_secs(3600));

        // First write flushes (no prior flush), second buffers.
        reporter.write("a", false).unwrap();
        reporter.write("b", false).unwrap();
        assert_eq!(record.log_text(), "a");

        reporter.flush().unwrap();
        assert_eq!(record.log_text(), "ab");
    }

    #[test]
    fn identical_status_is_absorbed() {
        let record = std::sync::Arc::new(MemoryJobRecord::new());
        let reporter = StatusReporter::new(Box::new(Probe(record.clone())));
        reporter.update_status(JobStatus::Running).unwrap();
        reporter.update_status(JobStatus::Running).unwrap();
        let statuses: Vec<_> = record
            .events()
            .into_iter()
            .filter(|e| matches!(e, RecordEvent::Status(_)))
            .collect();
        assert_eq!(statuses.len(), 1);
    }
}
