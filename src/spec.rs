//! Task, workflow and binding data model
//!
//! Specs are plain JSON-compatible structures. A task declares typed,
//! formatted ports; a binding carries the data (or a reference to it) that
//! flows through a port at run time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where fetched data should land: resident in memory, or written to a file
/// in the run's scratch directory with the path bound instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Memory,
    Filepath,
}

/// The runtime data envelope attached to a port.
///
/// `data` (already-resident value) and `url`/`path` + `mode` (fetch-on-demand
/// reference) are mutually informative: when `data` is absent it is fetched
/// through the transport registry before use. `script_data` is the value bound
/// into the executing task body; it is never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, alias = "uri", skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Transport mode; when absent it is auto-detected from `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Value handed to (or produced by) the task body. Stripped before
    /// bindings leave the pipeline.
    #[serde(skip)]
    pub script_data: Option<Value>,
}

impl Binding {
    /// An empty binding carrying only a format.
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            ..Default::default()
        }
    }

    /// A binding with resident data.
    pub fn inline(data: Value, format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// A fetch-on-demand reference to a URL.
    pub fn from_url(url: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            format: Some(format.into()),
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// A named, typed input or output declaration on a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    #[serde(alias = "id")]
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub format: String,
    #[serde(default)]
    pub target: Target,
    /// Streamed ports are bound to connectors, never materialized in memory.
    #[serde(default)]
    pub stream: bool,
    /// Preferred file name for filepath-target fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Binding>,
}

impl Port {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            format: format.into(),
            target: Target::Memory,
            stream: false,
            filename: None,
            default: None,
        }
    }

    pub fn with_default(mut self, default: Binding) -> Self {
        self.default = Some(default);
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A named step inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub task: TaskSpec,
    /// Visualization steps are descriptive terminals, never executed.
    #[serde(default)]
    pub visualization: bool,
}

/// A data routing edge inside a workflow.
///
/// Both step fields present: an internal edge. Only `output_step`/`output`
/// plus a `name`: a workflow-level output. Only `input_step`/`input` plus a
/// `name`: a workflow-level input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// The atomic unit of execution: a mode naming an executor, a body, and
/// declared ports. Workflow tasks additionally carry steps and connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Resolved into `script` through the transport registry at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_uri: Option<String>,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
}

impl TaskSpec {
    pub fn new(mode: impl Into<String>) -> Self {
        Self {
            mode: mode.into(),
            script: None,
            script_uri: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn input(mut self, port: Port) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: Port) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn connection(mut self, conn: Connection) -> Self {
        self.connections.push(conn);
        self
    }
}

/// Index ports by name. Later declarations win, matching registry overwrite
/// semantics; port names are unique within a declaration set by contract.
pub fn port_map(ports: &[Port]) -> HashMap<String, Port> {
    ports.iter().map(|p| (p.name.clone(), p.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binding_roundtrip_skips_script_data() {
        let mut binding = Binding::inline(json!(42), "json");
        binding.script_data = Some(json!("secret"));

        let text = serde_json::to_string(&binding).unwrap();
        assert!(!text.contains("secret"));

        let back: Binding = serde_json::from_str(&text).unwrap();
        assert_eq!(back.data, Some(json!(42)));
        assert_eq!(back.script_data, None);
    }

    #[test]
    fn binding_accepts_uri_alias_for_url() {
        let binding: Binding = serde_json::from_value(json!({
            "uri": "https://example.org/data",
            "format": "text"
        }))
        .unwrap();
        assert_eq!(binding.url.as_deref(), Some("https://example.org/data"));
    }

    #[test]
    fn port_accepts_id_alias() {
        let port: Port = serde_json::from_value(json!({
            "id": "a",
            "type": "number",
            "format": "json"
        }))
        .unwrap();
        assert_eq!(port.name, "a");
        assert_eq!(port.type_name, "number");
        assert!(!port.stream);
    }

    #[test]
    fn task_spec_parses_workflow_fields() {
        let task: TaskSpec = serde_json::from_value(json!({
            "mode": "workflow",
            "inputs": [{"name": "x", "type": "number", "format": "json"}],
            "outputs": [{"name": "y", "type": "number", "format": "json"}],
            "steps": [{
                "name": "s1",
                "task": {"mode": "process", "script": "true", "inputs": [], "outputs": []}
            }],
            "connections": [
                {"name": "x", "input_step": "s1", "input": "a"}
            ]
        }))
        .unwrap();

        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.connections[0].input_step.as_deref(), Some("s1"));
        assert!(task.connections[0].output_step.is_none());
    }

    #[test]
    fn default_target_is_memory() {
        assert_eq!(Target::default(), Target::Memory);
    }
}
