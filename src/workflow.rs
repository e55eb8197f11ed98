//! Workflow executor
//!
//! Expands a `workflow`-mode task into a step graph, derives execution
//! order with a layered topological sort, runs each step through the task
//! pipeline, and routes output bindings into dependent steps' inputs.
//! Visualization-flagged steps are descriptive terminals: they are never
//! executed, but their accumulated inputs are collected into a reserved
//! `_visualizations` output after the executable steps finish.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::dag::DependencyGraph;
use crate::error::SluiceError;
use crate::executor::{ExecContext, TaskExecutor};
use crate::pipeline::RunOptions;
use crate::spec::{Binding, Connection, StepSpec};

/// Reserved workflow output collecting visualization descriptors.
pub const VISUALIZATIONS_OUTPUT: &str = "_visualizations";

pub struct WorkflowExecutor;

impl WorkflowExecutor {
    fn step_options(opts: &RunOptions) -> RunOptions {
        RunOptions {
            // Steps share the workflow's scratch dir and its job status.
            status: None,
            ..opts.clone()
        }
    }
}

impl TaskExecutor for WorkflowExecutor {
    fn mode(&self) -> &str {
        "workflow"
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &mut ExecContext<'_>) -> Result<(), SluiceError> {
        let mut steps: HashMap<&str, &StepSpec> = HashMap::new();
        let mut graph = DependencyGraph::new();
        for step in &ctx.task.steps {
            if steps.insert(step.name.as_str(), step).is_some() {
                return Err(SluiceError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
            graph.add_node(step.name.clone());
        }

        // Accumulated input bindings per step, seeded by external inputs.
        let mut bindings: HashMap<String, HashMap<String, Binding>> = ctx
            .task
            .steps
            .iter()
            .map(|s| (s.name.clone(), HashMap::new()))
            .collect();
        // Producing step -> its outgoing connections.
        let mut downstream: HashMap<&str, Vec<&Connection>> = HashMap::new();

        for conn in &ctx.task.connections {
            match (&conn.output_step, &conn.input_step) {
                (Some(from), Some(to)) => {
                    require_step(&steps, from)?;
                    require_step(&steps, to)?;
                    graph.add_edge(from.clone(), to.clone());
                    downstream.entry(from.as_str()).or_default().push(conn);
                }
                (Some(from), None) => {
                    require_step(&steps, from)?;
                    downstream.entry(from.as_str()).or_default().push(conn);
                }
                (None, Some(to)) => {
                    // External input: seed from the caller-supplied binding.
                    require_step(&steps, to)?;
                    let name = conn.name.as_deref().ok_or_else(|| SluiceError::UnknownPort {
                        port: format!("unnamed input connection into '{to}'"),
                    })?;
                    let port = conn.input.as_deref().unwrap_or(name);
                    let binding = ctx
                        .inputs
                        .get(name)
                        .ok_or_else(|| SluiceError::MissingInput {
                            port: name.to_string(),
                        })?;
                    bindings
                        .get_mut(to.as_str())
                        .and_then(|m| m.insert(port.to_string(), binding.clone()));
                }
                (None, None) => {
                    return Err(SluiceError::UnknownPort {
                        port: conn.name.clone().unwrap_or_else(|| "<unnamed>".into()),
                    })
                }
            }
        }

        let layers = graph.layers()?;
        let step_opts = Self::step_options(ctx.opts);

        for layer in &layers {
            for name in layer {
                let step = steps[name.as_str()];
                if step.visualization {
                    continue;
                }
                debug!(step = %name, "running workflow step");
                let step_inputs = bindings.get(name).cloned().unwrap_or_default();
                let outputs = ctx.runtime.run_in(
                    &step.task,
                    step_inputs,
                    HashMap::new(),
                    &step_opts,
                    ctx.reporter,
                    ctx.dir,
                )?;

                for conn in downstream.get(name.as_str()).into_iter().flatten() {
                    let out_port = conn.output.as_deref().ok_or_else(|| {
                        SluiceError::UnknownPort {
                            port: format!("unnamed output connection from '{name}'"),
                        }
                    })?;
                    let produced =
                        outputs
                            .get(out_port)
                            .ok_or_else(|| SluiceError::MissingOutput {
                                port: out_port.to_string(),
                            })?;
                    match (&conn.input_step, &conn.name) {
                        (Some(to), _) => {
                            let port = conn.input.as_deref().unwrap_or(out_port);
                            bindings
                                .get_mut(to.as_str())
                                .and_then(|m| m.insert(port.to_string(), produced.clone()));
                        }
                        (None, Some(workflow_output)) => {
                            if let Some(binding) = ctx.outputs.get_mut(workflow_output) {
                                binding.script_data =
                                    produced.script_data.clone().or_else(|| produced.data.clone());
                            }
                        }
                        (None, None) => {}
                    }
                }
            }
        }

        // Visualization terminals.
        let mut descriptors = Vec::new();
        for step in &ctx.task.steps {
            if !step.visualization {
                continue;
            }
            let accumulated = bindings.remove(&step.name).unwrap_or_default();
            let ports = crate::spec::port_map(&step.task.inputs);
            let mut inputs = serde_json::Map::new();
            for (port_name, binding) in accumulated {
                let port =
                    ports
                        .get(&port_name)
                        .ok_or_else(|| SluiceError::MissingVisualizationInput {
                            step: step.name.clone(),
                            port: port_name.clone(),
                        })?;
                let prepared = ctx.runtime.prepare_input(
                    port,
                    binding,
                    ctx.opts,
                    ctx.reporter,
                    ctx.dir,
                )?;
                inputs.insert(port_name, serde_json::to_value(&prepared)?);
            }
            descriptors.push(json!({
                "mode": "preset",
                "type": step.name,
                "inputs": Value::Object(inputs),
            }));
        }
        if !descriptors.is_empty() || ctx.outputs.contains_key(VISUALIZATIONS_OUTPUT) {
            let list = Value::Array(descriptors);
            let entry = ctx
                .outputs
                .entry(VISUALIZATIONS_OUTPUT.to_string())
                .or_insert_with(|| Binding::with_format("json"));
            entry.data = Some(list.clone());
            entry.script_data = Some(list);
        }
        Ok(())
    }
}

fn require_step(steps: &HashMap<&str, &StepSpec>, name: &str) -> Result<(), SluiceError> {
    if steps.contains_key(name) {
        Ok(())
    } else {
        Err(SluiceError::UnknownPort {
            port: format!("connection references unknown step '{name}'"),
        })
    }
}
