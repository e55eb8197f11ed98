//! Executor-mode registry
//!
//! A task's `mode` names the executor that runs its body. Executors receive
//! an [`ExecContext`] with fetched, validated, converted inputs and must
//! assign `script_data` on every declared output binding. The built-in
//! `process` executor runs the task script as a shell child serviced by the
//! streaming loop; `workflow` lives in the workflow module.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::SluiceError;
use crate::pipeline::Runtime;
use crate::spec::{Binding, TaskSpec};
use crate::status::StatusReporter;
use crate::stream::process::{run_process, ProcessHarness};
use crate::stream::{
    make_fifo, open_fifo_read, shared_buffer, AccumulateBinding, MemoryFetcher, ReadConnector,
    SinkHandle, WriteConnector,
};
use crate::transport::value_bytes;

/// Everything an executor sees for one invocation.
pub struct ExecContext<'a> {
    pub runtime: &'a Runtime,
    pub task: &'a TaskSpec,
    /// Input bindings, `script_data` populated (stream ports excepted).
    pub inputs: &'a HashMap<String, Binding>,
    /// Output bindings; the executor assigns `script_data` on each.
    pub outputs: &'a mut HashMap<String, Binding>,
    /// Switches of the enclosing run, inherited by nested runs.
    pub opts: &'a crate::pipeline::RunOptions,
    pub reporter: Option<&'a StatusReporter>,
    /// Scratch directory scoped to the top-level run.
    pub dir: &'a Path,
}

impl ExecContext<'_> {
    /// The resident value of a non-stream input.
    pub fn input_value(&self, name: &str) -> Result<&Value, SluiceError> {
        self.inputs
            .get(name)
            .and_then(|b| b.script_data.as_ref())
            .ok_or_else(|| SluiceError::MissingInput {
                port: name.to_string(),
            })
    }

    /// Assign a produced value to a declared output.
    pub fn set_output(&mut self, name: &str, value: Value) -> Result<(), SluiceError> {
        let binding = self
            .outputs
            .get_mut(name)
            .ok_or_else(|| SluiceError::UnknownPort {
                port: name.to_string(),
            })?;
        binding.script_data = Some(value);
        Ok(())
    }
}

pub trait TaskExecutor: Send + Sync {
    fn mode(&self) -> &str;

    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), SluiceError>;
}

/// Executor built from a closure, for embedding task bodies in-process.
pub struct FnExecutor {
    mode: String,
    body: Box<dyn Fn(&mut ExecContext<'_>) -> Result<(), SluiceError> + Send + Sync>,
}

impl FnExecutor {
    pub fn new(
        mode: impl Into<String>,
        body: impl Fn(&mut ExecContext<'_>) -> Result<(), SluiceError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            mode: mode.into(),
            body: Box::new(body),
        }
    }
}

impl TaskExecutor for FnExecutor {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), SluiceError> {
        (self.body)(ctx)
    }
}

/// Mode-name keyed executor registry; populated before execution, read-only
/// thereafter.
pub struct ExecutorRegistry {
    modes: DashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            modes: DashMap::new(),
        }
    }

    pub fn register(&self, executor: Arc<dyn TaskExecutor>) {
        self.modes.insert(executor.mode().to_string(), executor);
    }

    pub fn get(&self, mode: &str) -> Result<Arc<dyn TaskExecutor>, SluiceError> {
        self.modes
            .get(mode)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SluiceError::UnknownMode {
                mode: mode.to_string(),
            })
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────
// Process executor
// ─────────────────────────────────────────────────────────────

/// Runs `task.script` as `sh -c` with piped stdio.
///
/// Contract with the child: non-stream inputs arrive as environment
/// variables; an input port named `stdin` feeds standard input; stream
/// ports become named pipes at `<dir>/<port>` with the path exported under
/// the port's name; declared outputs named `stdout`/`stderr` capture those
/// channels, otherwise they pass through to the parent.
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn env_value(value: &Value) -> String {
        match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl TaskExecutor for ProcessExecutor {
    fn mode(&self) -> &str {
        "process"
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), SluiceError> {
        let script = ctx
            .task
            .script
            .as_deref()
            .ok_or_else(|| SluiceError::Executor("process task has no script".into()))?;

        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        let mut harness = ProcessHarness::new();

        for port in &ctx.task.inputs {
            let binding = ctx
                .inputs
                .get(&port.name)
                .ok_or_else(|| SluiceError::MissingInput {
                    port: port.name.clone(),
                })?;
            if port.stream {
                let path = ctx.dir.join(&port.name);
                make_fifo(&path)?;
                command.env(&port.name, &path);
                let mut source = binding.clone();
                let fetcher = ctx.runtime.transports.stream_fetcher(&mut source)?;
                harness
                    .writers
                    .push(WriteConnector::new(fetcher, SinkHandle::fifo(&path)?));
            } else if port.name == "stdin" {
                let value = ctx.input_value(&port.name)?;
                harness.stdin = Some(Box::new(MemoryFetcher::new(value_bytes(value)?)));
            } else {
                command.env(&port.name, Self::env_value(ctx.input_value(&port.name)?));
            }
        }

        let mut captured = Vec::new();
        for port in &ctx.task.outputs {
            if port.stream {
                let path = ctx.dir.join(&port.name);
                make_fifo(&path)?;
                command.env(&port.name, &path);
                let binding = ctx
                    .outputs
                    .get(&port.name)
                    .ok_or_else(|| SluiceError::UnknownPort {
                        port: port.name.clone(),
                    })?;
                let mut sink_binding = binding.clone();
                let pusher = ctx.runtime.transports.stream_pusher(&mut sink_binding)?;
                harness
                    .readers
                    .push(ReadConnector::new(open_fifo_read(&path)?, pusher));
            } else if port.name == "stdout" || port.name == "stderr" {
                let buffer = shared_buffer();
                let pusher = Box::new(AccumulateBinding::new(buffer.clone()));
                if port.name == "stdout" {
                    harness.stdout = Some(pusher);
                } else {
                    harness.stderr = Some(pusher);
                }
                captured.push((port.name.clone(), buffer));
            }
            // Other non-stream outputs cannot be produced by a shell child;
            // the pipeline reports them as missing afterwards.
        }

        let cancel = &ctx.runtime.cancel;
        let status = run_process(&mut command, harness, cancel)?;
        if !status.success() && !cancel.load(Ordering::Relaxed) {
            return Err(SluiceError::ProcessFailed {
                code: status.code().unwrap_or(-1),
            });
        }
        debug!(cancelled = cancel.load(Ordering::Relaxed), "process task finished");

        for (name, buffer) in captured {
            let text = String::from_utf8_lossy(&buffer.lock()).into_owned();
            ctx.set_output(&name, Value::String(text))?;
        }
        Ok(())
    }
}
