//! Task run pipeline
//!
//! The fetch/validate/convert/execute/validate/convert/push lifecycle for a
//! single task invocation. All collaborators (conversion graph, transports,
//! executors, hooks, cancellation) live on a [`Runtime`] constructed at
//! process start and passed down explicitly, so tests get isolation for
//! free and nothing hides in global state.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::convert::{ConversionRegistry, ValidatorKey};
use crate::error::{value_type_name, SluiceError};
use crate::executor::{ExecContext, ExecutorRegistry, ProcessExecutor};
use crate::spec::{Binding, Port, TaskSpec};
use crate::status::{JobStatus, StatusReporter};
use crate::transport::TransportRegistry;
use crate::workflow::WorkflowExecutor;

/// Per-invocation switches. Defaults run the full lifecycle.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub auto_convert: bool,
    pub validate: bool,
    pub fetch: bool,
    /// Remove the scratch directory on exit. Off is a debugging aid.
    pub cleanup: bool,
    /// Status to report when the executor starts, if a reporter is attached.
    pub status: Option<JobStatus>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            auto_convert: true,
            validate: true,
            fetch: true,
            cleanup: true,
            status: Some(JobStatus::Running),
        }
    }
}

impl RunOptions {
    /// Options for nested converter/validator runs: no fetch, no validation,
    /// no recursive auto-conversion.
    fn nested() -> Self {
        Self {
            auto_convert: false,
            validate: false,
            fetch: false,
            cleanup: false,
            status: None,
        }
    }
}

/// Observer seams around a run. `finally_run` fires exactly once on every
/// exit path, success or failure, and is therefore infallible.
pub trait LifecycleHook: Send + Sync {
    fn before_run(&self, _task: &TaskSpec) -> Result<(), SluiceError> {
        Ok(())
    }

    fn after_run(&self, _task: &TaskSpec) -> Result<(), SluiceError> {
        Ok(())
    }

    fn finally_run(&self, _task: &TaskSpec) {}
}

/// The dependency-injected execution environment.
pub struct Runtime {
    pub conversions: ConversionRegistry,
    pub transports: TransportRegistry,
    pub executors: ExecutorRegistry,
    pub cancel: Arc<AtomicBool>,
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl Runtime {
    /// Runtime with the built-in transports and the `process` and
    /// `workflow` executors.
    pub fn new() -> Self {
        let executors = ExecutorRegistry::new();
        executors.register(Arc::new(ProcessExecutor));
        executors.register(Arc::new(WorkflowExecutor));
        Self {
            conversions: ConversionRegistry::new(),
            transports: TransportRegistry::new(),
            executors,
            cancel: Arc::new(AtomicBool::new(false)),
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
    }

    /// Run one task to completion and return its output bindings.
    ///
    /// Allocates a scratch directory scoped to this invocation, removed on
    /// every exit path unless `opts.cleanup` is off. A status-transition
    /// rejection against a job that is already being cancelled aborts the
    /// run quietly; any other error is reported to the job record (status
    /// `Error` plus a formatted message) before propagating.
    #[instrument(skip_all, fields(mode = %task.mode))]
    pub fn run(
        &self,
        task: &TaskSpec,
        inputs: HashMap<String, Binding>,
        outputs: HashMap<String, Binding>,
        opts: &RunOptions,
        reporter: Option<&StatusReporter>,
    ) -> Result<HashMap<String, Binding>, SluiceError> {
        let dir = tempfile::Builder::new().prefix("sluice-").tempdir()?;
        let result = self.run_in(task, inputs, outputs, opts, reporter, dir.path());
        if !opts.cleanup {
            let kept = dir.keep();
            debug!(dir = %kept.display(), "keeping scratch directory");
        }

        match result {
            Ok(outputs) => Ok(outputs),
            Err(SluiceError::StateTransition { from, to })
                if reporter.map_or(false, |r| {
                    matches!(
                        r.current_status(),
                        JobStatus::Canceling | JobStatus::Canceled
                    )
                }) =>
            {
                debug!(?from, ?to, "run aborted by cancellation");
                Ok(HashMap::new())
            }
            Err(err) => {
                if let Some(reporter) = reporter {
                    // Class plus message, so the record shows which taxonomy
                    // variant failed as well as the human-readable reason.
                    let _ = reporter.write(&format!("Error [{err:?}]: {err}\n"), true);
                    if let Err(report_err) = reporter.update_status(JobStatus::Error) {
                        warn!(%report_err, "could not report error status");
                    }
                }
                Err(err)
            }
        }
    }

    /// The pipeline proper, sharing the caller's scratch directory. Nested
    /// runs (converters, validators, workflow steps) enter here.
    pub(crate) fn run_in(
        &self,
        task: &TaskSpec,
        inputs: HashMap<String, Binding>,
        outputs: HashMap<String, Binding>,
        opts: &RunOptions,
        reporter: Option<&StatusReporter>,
        dir: &Path,
    ) -> Result<HashMap<String, Binding>, SluiceError> {
        for hook in &self.hooks {
            hook.before_run(task)?;
        }
        let mut result = self.run_body(task, inputs, outputs, opts, reporter, dir);
        if result.is_ok() {
            for hook in &self.hooks {
                if let Err(err) = hook.after_run(task) {
                    result = Err(err);
                    break;
                }
            }
        }
        // Exactly once, on every exit path.
        for hook in &self.hooks {
            hook.finally_run(task);
        }
        result
    }

    fn run_body(
        &self,
        task: &TaskSpec,
        mut inputs: HashMap<String, Binding>,
        mut outputs: HashMap<String, Binding>,
        opts: &RunOptions,
        reporter: Option<&StatusReporter>,
        dir: &Path,
    ) -> Result<HashMap<String, Binding>, SluiceError> {
        for port in &task.inputs {
            let binding = match inputs.remove(&port.name) {
                Some(binding) => binding,
                None => port.default.clone().ok_or_else(|| SluiceError::MissingInput {
                    port: port.name.clone(),
                })?,
            };
            let binding = self.prepare_input(port, binding, opts, reporter, dir)?;
            inputs.insert(port.name.clone(), binding);
        }

        // Synthesize envelopes for declared outputs the caller did not bind.
        for port in &task.outputs {
            let entry = outputs
                .entry(port.name.clone())
                .or_insert_with(|| Binding::with_format(&port.format));
            if entry.format.is_none() {
                entry.format = Some(port.format.clone());
            }
        }

        if let (Some(reporter), Some(status)) = (reporter, opts.status) {
            reporter.update_status(status)?;
        }
        let executor = self.executors.get(&task.mode)?;
        let mut ctx = ExecContext {
            runtime: self,
            task,
            inputs: &inputs,
            outputs: &mut outputs,
            opts,
            reporter,
            dir,
        };
        executor.execute(&mut ctx)?;

        for port in &task.outputs {
            if port.stream {
                continue;
            }
            let binding = outputs
                .remove(&port.name)
                .ok_or_else(|| SluiceError::MissingOutput {
                    port: port.name.clone(),
                })?;
            let binding = self.deliver_output(port, binding, opts, reporter, dir)?;
            outputs.insert(port.name.clone(), binding);
        }
        Ok(outputs)
    }

    /// Fetch, validate and convert one input binding against its port. Also
    /// used by the workflow executor for visualization terminal inputs.
    pub(crate) fn prepare_input(
        &self,
        port: &Port,
        mut binding: Binding,
        opts: &RunOptions,
        reporter: Option<&StatusReporter>,
        dir: &Path,
    ) -> Result<Binding, SluiceError> {
        if binding.format.is_none() {
            binding.format = Some(port.format.clone());
        }
        // Stream ports are bound by connectors later, never materialized.
        if port.stream {
            return Ok(binding);
        }

        if opts.fetch && binding.data.is_none() && binding.script_data.is_none() {
            if let Some(reporter) = reporter {
                reporter.update_status(JobStatus::FetchingInput)?;
            }
            let value = self.transports.fetch(&mut binding, port, dir)?;
            binding.data = Some(value);
        }
        if binding.script_data.is_none() {
            binding.script_data = binding.data.clone();
        }

        if opts.validate && !self.isvalid_in(&port.type_name, &binding, dir)? {
            let observed = binding
                .script_data
                .as_ref()
                .map_or("null", value_type_name);
            return Err(SluiceError::InvalidInput {
                port: port.name.clone(),
                observed: observed.to_string(),
                type_name: port.type_name.clone(),
                format: binding.format.clone().unwrap_or_default(),
            });
        }

        let format = binding.format.clone().unwrap_or_default();
        if format == port.format {
            return Ok(binding);
        }
        if !opts.auto_convert {
            return Err(SluiceError::FormatMismatch {
                expected: port.format.clone(),
                actual: format,
            });
        }
        if let Some(reporter) = reporter {
            reporter.update_status(JobStatus::ConvertingInput)?;
        }
        self.convert_binding(
            &port.type_name,
            binding,
            Binding::with_format(&port.format),
            reporter,
            dir,
        )
        .map_err(|err| SluiceError::Conversion {
            port: port.name.clone(),
            source: Box::new(err),
        })
    }

    /// Envelope, validate, convert-or-exact-match, and push one produced
    /// output binding.
    fn deliver_output(
        &self,
        port: &Port,
        mut binding: Binding,
        opts: &RunOptions,
        reporter: Option<&StatusReporter>,
        dir: &Path,
    ) -> Result<Binding, SluiceError> {
        let value = binding
            .script_data
            .take()
            .ok_or_else(|| SluiceError::MissingOutput {
                port: port.name.clone(),
            })?;
        let requested = binding.format.clone().unwrap_or_else(|| port.format.clone());

        // Script-output envelope in the task's declared format.
        let produced = Binding {
            format: Some(port.format.clone()),
            data: Some(value.clone()),
            script_data: Some(value.clone()),
            ..Default::default()
        };

        if opts.validate && !self.isvalid_in(&port.type_name, &produced, dir)? {
            return Err(SluiceError::InvalidOutput {
                port: port.name.clone(),
                observed: value_type_name(&value).to_string(),
                type_name: port.type_name.clone(),
                format: port.format.clone(),
            });
        }

        if requested != port.format {
            if !opts.auto_convert {
                return Err(SluiceError::FormatMismatch {
                    expected: port.format.clone(),
                    actual: requested,
                });
            }
            if let Some(reporter) = reporter {
                reporter.update_status(JobStatus::ConvertingOutput)?;
            }
            binding.format = Some(requested);
            binding.script_data = None;
            return self
                .convert_binding(&port.type_name, produced, binding, reporter, dir)
                .map_err(|err| SluiceError::Conversion {
                    port: port.name.clone(),
                    source: Box::new(err),
                });
        }

        // Exact format: push directly.
        if let Some(reporter) = reporter {
            if binding.url.is_some() || binding.mode.is_some() {
                reporter.update_status(JobStatus::PushingOutput)?;
            }
        }
        self.transports.push(&value, &mut binding, port)?;
        binding.script_data = Some(value);
        Ok(binding)
    }

    // ─────────────────────────────────────────────────────────────
    // Conversion and validation as degenerate pipeline runs
    // ─────────────────────────────────────────────────────────────

    /// Convert `input` into `output`'s format and push the result to
    /// `output`'s destination. Equal formats short-circuit without touching
    /// the conversion graph.
    pub fn convert_binding(
        &self,
        type_name: &str,
        mut input: Binding,
        mut output: Binding,
        reporter: Option<&StatusReporter>,
        dir: &Path,
    ) -> Result<Binding, SluiceError> {
        let from = input
            .format
            .clone()
            .ok_or_else(|| SluiceError::Transport("conversion input has no format".into()))?;
        let to = output
            .format
            .clone()
            .ok_or_else(|| SluiceError::Transport("conversion output has no format".into()))?;

        let port = Port::new("input", type_name, &from);
        if input.data.is_none() && input.script_data.is_none() {
            let value = self.transports.fetch(&mut input, &port, dir)?;
            input.data = Some(value);
        }
        if input.script_data.is_none() {
            input.script_data = input.data.clone();
        }

        let mut value = match input.script_data.clone() {
            Some(value) => value,
            None => Value::Null,
        };

        if from != to {
            let path = self.conversions.shortest_path(type_name, &from, &to)?;
            debug!(type_name, %from, %to, hops = path.len(), "converting");
            let mut current = input;
            for converter in &path {
                let target = converter.outputs[0].format.clone();
                let step_inputs =
                    HashMap::from([("input".to_string(), current)]);
                let step_outputs =
                    HashMap::from([("output".to_string(), Binding::with_format(&target))]);
                let mut results = self.run_in(
                    converter,
                    step_inputs,
                    step_outputs,
                    &RunOptions::nested(),
                    reporter,
                    dir,
                )?;
                current = results
                    .remove("output")
                    .ok_or_else(|| SluiceError::MissingOutput {
                        port: "output".to_string(),
                    })?;
            }
            value = current.script_data.or(current.data).unwrap_or(Value::Null);
        }

        if let Some(reporter) = reporter {
            if output.url.is_some() || output.mode.is_some() {
                reporter.update_status(JobStatus::PushingOutput)?;
            }
        }
        let out_port = Port::new("output", type_name, &to);
        self.transports.push(&value, &mut output, &out_port)?;
        output.script_data = Some(value);
        Ok(output)
    }

    /// Whether a binding's data is a valid instance of `(type, format)`.
    ///
    /// Implemented as a degenerate task run of the registered validator into
    /// a boolean output, with fetch, validation and conversion disabled, so
    /// validator failures surface through the same error taxonomy as task
    /// failures. An unknown `(type, format)` pair is an error, never `false`.
    pub fn isvalid(&self, type_name: &str, binding: &Binding) -> Result<bool, SluiceError> {
        let dir = tempfile::Builder::new().prefix("sluice-").tempdir()?;
        self.isvalid_in(type_name, binding, dir.path())
    }

    fn isvalid_in(
        &self,
        type_name: &str,
        binding: &Binding,
        dir: &Path,
    ) -> Result<bool, SluiceError> {
        let format = binding.format.clone().unwrap_or_default();
        let validator = self
            .conversions
            .validator(&ValidatorKey::new(type_name, format))?;

        let inputs = HashMap::from([("input".to_string(), binding.clone())]);
        let outputs = self.run_in(
            &validator,
            inputs,
            HashMap::new(),
            &RunOptions::nested(),
            None,
            dir,
        )?;
        Ok(outputs
            .get("output")
            .and_then(|b| b.script_data.as_ref())
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a task's `script_uri` (and those of nested steps) into inline
/// scripts through the transport registry. Relative URIs resolve against
/// `base`.
pub fn resolve_script(
    task: &mut TaskSpec,
    base: &Path,
    transports: &TransportRegistry,
) -> Result<(), SluiceError> {
    if task.script.is_none() {
        if let Some(uri) = task.script_uri.clone() {
            task.script = Some(transports.fetch_uri(&uri, base)?);
        }
    }
    for step in &mut task.steps {
        resolve_script(&mut step.task, base, transports)?;
    }
    Ok(())
}

/// Read a task document from a JSON file, resolving `script_uri` against
/// the file's directory.
pub fn load_task_file(
    path: &Path,
    transports: &TransportRegistry,
) -> Result<TaskSpec, SluiceError> {
    let text = std::fs::read_to_string(path)?;
    let mut task: TaskSpec = serde_json::from_str(&text)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    resolve_script(&mut task, base, transports)?;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FnExecutor;
    use serde_json::json;

    fn runtime_with_negate() -> Runtime {
        let runtime = Runtime::new();
        runtime.executors.register(Arc::new(FnExecutor::new(
            "negate",
            |ctx: &mut ExecContext<'_>| {
                let a = ctx.input_value("a")?.as_f64().unwrap_or(0.0);
                ctx.set_output("b", json!(-a))
            },
        )));
        runtime
    }

    fn negate_task() -> TaskSpec {
        TaskSpec::new("negate")
            .input(Port::new("a", "number", "json"))
            .output(Port::new("b", "number", "json"))
    }

    fn lax() -> RunOptions {
        RunOptions {
            validate: false,
            ..Default::default()
        }
    }

    #[test]
    fn missing_required_input_names_port() {
        let runtime = runtime_with_negate();
        let err = runtime
            .run(&negate_task(), HashMap::new(), HashMap::new(), &lax(), None)
            .unwrap_err();
        assert!(matches!(err, SluiceError::MissingInput { port } if port == "a"));
    }

    #[test]
    fn default_binding_substituted() {
        let runtime = runtime_with_negate();
        let task = TaskSpec::new("negate")
            .input(Port::new("a", "number", "json").with_default(Binding::inline(json!(7), "json")))
            .output(Port::new("b", "number", "json"));

        let outputs = runtime
            .run(&task, HashMap::new(), HashMap::new(), &lax(), None)
            .unwrap();
        assert_eq!(outputs["b"].script_data, Some(json!(-7.0)));
    }

    #[test]
    fn unknown_mode_is_config_error() {
        let runtime = Runtime::new();
        let task = TaskSpec::new("spark");
        let err = runtime
            .run(&task, HashMap::new(), HashMap::new(), &lax(), None)
            .unwrap_err();
        assert!(matches!(err, SluiceError::UnknownMode { mode } if mode == "spark"));
    }

    #[test]
    fn finally_hook_fires_once_on_failure() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingHook {
            finally_calls: AtomicU32,
        }
        impl LifecycleHook for CountingHook {
            fn finally_run(&self, _task: &TaskSpec) {
                self.finally_calls.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hook = Arc::new(CountingHook {
            finally_calls: AtomicU32::new(0),
        });
        let mut runtime = runtime_with_negate();
        runtime.add_hook(hook.clone());

        // Fails at input processing, before the executor runs.
        let result = runtime.run(&negate_task(), HashMap::new(), HashMap::new(), &lax(), None);
        assert!(result.is_err());
        assert_eq!(hook.finally_calls.load(Ordering::SeqCst), 1);

        // And exactly once on success too.
        let inputs = HashMap::from([("a".to_string(), Binding::inline(json!(1), "json"))]);
        runtime
            .run(&negate_task(), inputs, HashMap::new(), &lax(), None)
            .unwrap();
        assert_eq!(hook.finally_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn load_task_file_resolves_relative_script_uri() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("body.sh"), "printf hi").unwrap();
        std::fs::write(
            dir.path().join("task.json"),
            r#"{"mode": "process", "script_uri": "body.sh",
                "outputs": [{"name": "stdout", "type": "string", "format": "text"}]}"#,
        )
        .unwrap();

        let transports = TransportRegistry::new();
        let task = load_task_file(&dir.path().join("task.json"), &transports).unwrap();
        assert_eq!(task.script.as_deref(), Some("printf hi"));
        assert_eq!(task.outputs[0].name, "stdout");
    }

    #[test]
    fn missing_output_from_executor_is_error() {
        let runtime = Runtime::new();
        runtime.executors.register(Arc::new(FnExecutor::new("noop", |_ctx: &mut ExecContext<'_>| Ok(()))));
        let task = TaskSpec::new("noop").output(Port::new("c", "number", "json"));
        let err = runtime
            .run(&task, HashMap::new(), HashMap::new(), &lax(), None)
            .unwrap_err();
        assert!(matches!(err, SluiceError::MissingOutput { port } if port == "c"));
    }
}
