//! Conversion registry
//!
//! A directed graph whose nodes are `(type, format)` validators and whose
//! edges are converter tasks. Conversions compose transitively, so format
//! routing is a shortest-path query instead of an enumerated pair table.
//! Tie-breaking between equally short paths is deterministic for a fixed
//! registered set, because converters may have side effects and must be
//! chosen the same way on every run.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::SluiceError;
use crate::spec::TaskSpec;
use crate::transport::TransportRegistry;

/// Immutable value-identity key for a conversion graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidatorKey {
    pub type_name: String,
    pub format: String,
}

impl ValidatorKey {
    pub fn new(type_name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            format: format.into(),
        }
    }
}

#[derive(Default)]
struct Graph {
    /// Validator task per node. Duplicate insertion overwrites.
    validators: HashMap<ValidatorKey, TaskSpec>,
    /// Converter task per directed edge. BTreeMap keeps neighbor iteration
    /// deterministic.
    edges: BTreeMap<ValidatorKey, BTreeMap<ValidatorKey, TaskSpec>>,
}

impl Graph {
    /// Every node mentioned by a validator or an edge endpoint.
    fn nodes(&self) -> HashSet<&ValidatorKey> {
        let mut nodes: HashSet<&ValidatorKey> = self.validators.keys().collect();
        for (from, targets) in &self.edges {
            nodes.insert(from);
            nodes.extend(targets.keys());
        }
        nodes
    }

    fn neighbors(&self, key: &ValidatorKey) -> impl Iterator<Item = &ValidatorKey> {
        self.edges.get(key).into_iter().flat_map(|m| m.keys())
    }
}

/// Process-wide, read-mostly registry of validators and converters.
///
/// Populated once at startup, then treated as immutable during execution;
/// registration and lookup are nonetheless safe from multiple threads.
#[derive(Default)]
pub struct ConversionRegistry {
    graph: RwLock<Graph>,
}

impl ConversionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validator node. Re-registering a `(type, format)` pair
    /// replaces the previous validator task.
    pub fn register_validator(
        &self,
        type_name: impl Into<String>,
        format: impl Into<String>,
        task: TaskSpec,
    ) {
        let key = ValidatorKey::new(type_name, format);
        debug!(type_name = %key.type_name, format = %key.format, "registering validator");
        self.graph.write().validators.insert(key, task);
    }

    /// Insert a converter edge, deriving the endpoints from the task's single
    /// input and output ports. The converter contract is enforced here: one
    /// input named `input`, one output named `output`, same type, differing
    /// format.
    pub fn register_converter(&self, task: TaskSpec) -> Result<(), SluiceError> {
        let (input, output) = match (task.inputs.as_slice(), task.outputs.as_slice()) {
            ([input], [output]) if input.name == "input" && output.name == "output" => {
                (input, output)
            }
            _ => return Err(SluiceError::MalformedConverter),
        };
        if input.type_name != output.type_name {
            return Err(SluiceError::ConverterTypeMismatch {
                input: input.type_name.clone(),
                output: output.type_name.clone(),
            });
        }
        if input.format == output.format {
            return Err(SluiceError::MalformedConverter);
        }

        let from = ValidatorKey::new(&input.type_name, &input.format);
        let to = ValidatorKey::new(&output.type_name, &output.format);
        debug!(
            type_name = %from.type_name,
            from = %from.format,
            to = %to.format,
            "registering converter"
        );
        self.graph
            .write()
            .edges
            .entry(from)
            .or_default()
            .insert(to, task);
        Ok(())
    }

    /// Look up the validator task for a node. Unknown pairs are an error,
    /// never a silent `false`.
    pub fn validator(&self, key: &ValidatorKey) -> Result<TaskSpec, SluiceError> {
        self.graph
            .read()
            .validators
            .get(key)
            .cloned()
            .ok_or_else(|| SluiceError::UnknownValidator {
                type_name: key.type_name.clone(),
                format: key.format.clone(),
            })
    }

    /// Whether a validator exists for the pair, or (with `format` `None`)
    /// for any format of the type.
    pub fn has_validator(&self, type_name: &str, format: Option<&str>) -> bool {
        let graph = self.graph.read();
        match format {
            Some(format) => graph
                .validators
                .contains_key(&ValidatorKey::new(type_name, format)),
            None => graph.validators.keys().any(|k| k.type_name == type_name),
        }
    }

    /// The cheapest converter sequence from `from` to `to` within a type.
    ///
    /// Equal formats short-circuit to the empty sequence. All shortest paths
    /// by edge count are computed, the candidates are sorted by their node
    /// sequence and the first is taken, so repeated calls over the same
    /// registered set pick the same path regardless of iteration order.
    pub fn shortest_path(
        &self,
        type_name: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<TaskSpec>, SluiceError> {
        if from == to {
            return Ok(Vec::new());
        }

        let source = ValidatorKey::new(type_name, from);
        let target = ValidatorKey::new(type_name, to);

        // Both endpoints must be registered validators; this keeps "format
        // unknown" distinct from "no path".
        self.validator(&source)?;
        self.validator(&target)?;

        let graph = self.graph.read();
        let paths = all_shortest_paths(&graph, &source, &target);
        let path = paths
            .into_iter()
            .min()
            .ok_or_else(|| SluiceError::NoConversionPath {
                type_name: type_name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })?;

        let tasks = path
            .windows(2)
            .map(|pair| graph.edges[&pair[0]][&pair[1]].clone())
            .collect();
        Ok(tasks)
    }

    /// Existential reachability query. `None` fields act as wildcards. The
    /// trivial self path does not count (the graph has no self loops).
    pub fn has_converter(
        &self,
        source_type: Option<&str>,
        source_format: Option<&str>,
        target_type: Option<&str>,
        target_format: Option<&str>,
    ) -> bool {
        let graph = self.graph.read();
        let matches = |key: &ValidatorKey, ty: Option<&str>, fmt: Option<&str>| {
            ty.map_or(true, |t| t == key.type_name) && fmt.map_or(true, |f| f == key.format)
        };

        let sources: Vec<ValidatorKey> = graph
            .nodes()
            .into_iter()
            .filter(|k| matches(k, source_type, source_format))
            .cloned()
            .collect();

        for source in sources {
            let mut visited = HashSet::new();
            let mut queue = VecDeque::from([source.clone()]);
            while let Some(node) = queue.pop_front() {
                for next in graph.neighbors(&node) {
                    if visited.insert(next.clone()) {
                        if matches(next, target_type, target_format) {
                            return true;
                        }
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        false
    }

    /// Every reachable `(from, to)` pair, sorted. The data behind the
    /// original conversion-table report.
    pub fn conversion_table(&self) -> Vec<(ValidatorKey, ValidatorKey)> {
        let graph = self.graph.read();
        let mut table = Vec::new();
        for node in graph.nodes() {
            let mut visited = HashSet::new();
            let mut queue = VecDeque::from([node.clone()]);
            while let Some(current) = queue.pop_front() {
                for next in graph.neighbors(&current) {
                    if visited.insert(next.clone()) {
                        table.push((node.clone(), next.clone()));
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        table.sort();
        table
    }

    /// Import validators and converters from definition-file search paths.
    ///
    /// Files matching `validate_*.json` register nodes; other `*_to_*.json`
    /// files register edges. A definition with a `script_uri` and no inline
    /// `script` has the script fetched through the transport registry,
    /// relative URIs resolving against the definition file's directory.
    pub fn import_directories<P: AsRef<Path>>(
        &self,
        paths: &[P],
        transports: &TransportRegistry,
    ) -> Result<(), SluiceError> {
        for path in paths {
            self.import_directory(path.as_ref(), transports)?;
        }
        Ok(())
    }

    pub fn import_directory(
        &self,
        path: &Path,
        transports: &TransportRegistry,
    ) -> Result<(), SluiceError> {
        let pattern = path.join("*.json");
        let pattern = pattern.to_string_lossy();
        let mut validator_files = Vec::new();
        let mut converter_files = Vec::new();

        for entry in glob::glob(&pattern)
            .map_err(|e| SluiceError::Transport(format!("bad search path: {e}")))?
        {
            let file =
                entry.map_err(|e| SluiceError::Transport(format!("unreadable entry: {e}")))?;
            let stem = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stem.starts_with("validate_") {
                validator_files.push(file);
            } else if stem.contains("_to_") {
                converter_files.push(file);
            }
        }
        validator_files.sort();
        converter_files.sort();

        for file in validator_files {
            let task = load_definition(&file, transports)?;
            let port = task
                .inputs
                .first()
                .ok_or(SluiceError::MalformedConverter)?
                .clone();
            self.register_validator(port.type_name, port.format, task);
        }
        for file in converter_files {
            let task = load_definition(&file, transports)?;
            self.register_converter(task)?;
        }
        Ok(())
    }
}

fn load_definition(file: &Path, transports: &TransportRegistry) -> Result<TaskSpec, SluiceError> {
    let text = std::fs::read_to_string(file)?;
    let mut task: TaskSpec = serde_json::from_str(&text)?;
    let base = file.parent().unwrap_or_else(|| Path::new("."));
    crate::pipeline::resolve_script(&mut task, base, transports)?;
    Ok(task)
}

/// Every shortest path (by edge count) between two nodes, as node sequences.
fn all_shortest_paths(
    graph: &Graph,
    source: &ValidatorKey,
    target: &ValidatorKey,
) -> Vec<Vec<ValidatorKey>> {
    // BFS recording distance and all minimal-parent links.
    let mut dist: HashMap<ValidatorKey, usize> = HashMap::from([(source.clone(), 0)]);
    let mut parents: HashMap<ValidatorKey, Vec<ValidatorKey>> = HashMap::new();
    let mut queue = VecDeque::from([source.clone()]);

    while let Some(node) = queue.pop_front() {
        let d = dist[&node];
        for next in graph.neighbors(&node) {
            match dist.get(next) {
                None => {
                    dist.insert(next.clone(), d + 1);
                    parents.entry(next.clone()).or_default().push(node.clone());
                    queue.push_back(next.clone());
                }
                Some(&existing) if existing == d + 1 => {
                    parents.entry(next.clone()).or_default().push(node.clone());
                }
                Some(_) => {}
            }
        }
    }

    if !dist.contains_key(target) {
        return Vec::new();
    }

    // Unwind parent links from the target back to the source.
    let mut paths = Vec::new();
    let mut stack = vec![vec![target.clone()]];
    while let Some(partial) = stack.pop() {
        let Some(head) = partial.last() else {
            continue;
        };
        if head == source {
            let mut path = partial.clone();
            path.reverse();
            paths.push(path);
            continue;
        }
        for parent in parents.get(head).into_iter().flatten() {
            let mut longer = partial.clone();
            longer.push(parent.clone());
            stack.push(longer);
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Port;

    fn converter(type_name: &str, from: &str, to: &str) -> TaskSpec {
        TaskSpec::new("noop")
            .input(Port::new("input", type_name, from))
            .output(Port::new("output", type_name, to))
    }

    fn validator(type_name: &str, format: &str) -> TaskSpec {
        TaskSpec::new("noop")
            .input(Port::new("input", type_name, format))
            .output(Port::new("output", "boolean", "boolean"))
    }

    fn registry_with_chain() -> ConversionRegistry {
        let reg = ConversionRegistry::new();
        for fmt in ["a", "b", "c", "d"] {
            reg.register_validator("table", fmt, validator("table", fmt));
        }
        reg.register_converter(converter("table", "a", "b")).unwrap();
        reg.register_converter(converter("table", "b", "c")).unwrap();
        reg.register_converter(converter("table", "c", "d")).unwrap();
        reg
    }

    #[test]
    fn equal_formats_short_circuit() {
        let reg = registry_with_chain();
        assert!(reg.shortest_path("table", "a", "a").unwrap().is_empty());
    }

    #[test]
    fn chain_path_in_traversal_order() {
        let reg = registry_with_chain();
        let path = reg.shortest_path("table", "a", "c").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].inputs[0].format, "a");
        assert_eq!(path[0].outputs[0].format, "b");
        assert_eq!(path[1].outputs[0].format, "c");
    }

    #[test]
    fn direct_edge_beats_concatenation() {
        let reg = registry_with_chain();
        reg.register_converter(converter("table", "a", "c")).unwrap();
        let path = reg.shortest_path("table", "a", "c").unwrap();
        assert_eq!(path.len(), 1);
    }

    #[test]
    fn tie_break_is_stable() {
        // Two parallel length-2 routes from a to z.
        let reg = ConversionRegistry::new();
        for fmt in ["a", "m", "n", "z"] {
            reg.register_validator("t", fmt, validator("t", fmt));
        }
        reg.register_converter(converter("t", "a", "m")).unwrap();
        reg.register_converter(converter("t", "a", "n")).unwrap();
        reg.register_converter(converter("t", "m", "z")).unwrap();
        reg.register_converter(converter("t", "n", "z")).unwrap();

        let first = reg.shortest_path("t", "a", "z").unwrap();
        for _ in 0..10 {
            let again = reg.shortest_path("t", "a", "z").unwrap();
            assert_eq!(
                again[0].outputs[0].format, first[0].outputs[0].format,
                "tie-break must be deterministic"
            );
        }
        // Sorted node sequences: a->m->z precedes a->n->z.
        assert_eq!(first[0].outputs[0].format, "m");
    }

    #[test]
    fn unknown_format_is_distinct_from_no_path() {
        let reg = registry_with_chain();

        let err = reg.shortest_path("table", "a", "nope").unwrap_err();
        assert!(matches!(err, SluiceError::UnknownValidator { .. }));

        // d has no outgoing edges, so d -> a is unreachable.
        let err = reg.shortest_path("table", "d", "a").unwrap_err();
        assert!(matches!(err, SluiceError::NoConversionPath { .. }));
    }

    #[test]
    fn has_converter_wildcards() {
        let reg = registry_with_chain();
        assert!(reg.has_converter(Some("table"), Some("a"), None, Some("d")));
        assert!(reg.has_converter(Some("table"), None, None, None));
        assert!(!reg.has_converter(Some("tree"), None, None, None));
        // No self loops: a node with no outgoing edges reaches nothing.
        assert!(!reg.has_converter(Some("table"), Some("d"), None, None));
    }

    #[test]
    fn duplicate_validator_overwrites() {
        let reg = ConversionRegistry::new();
        reg.register_validator("t", "x", validator("t", "x"));
        let replacement = validator("t", "x").script("second");
        reg.register_validator("t", "x", replacement);
        let task = reg.validator(&ValidatorKey::new("t", "x")).unwrap();
        assert_eq!(task.script.as_deref(), Some("second"));
    }

    #[test]
    fn converter_contract_enforced() {
        let reg = ConversionRegistry::new();

        let cross_type = TaskSpec::new("noop")
            .input(Port::new("input", "table", "a"))
            .output(Port::new("output", "tree", "b"));
        assert!(matches!(
            reg.register_converter(cross_type),
            Err(SluiceError::ConverterTypeMismatch { .. })
        ));

        let self_loop = converter("table", "a", "a");
        assert!(matches!(
            reg.register_converter(self_loop),
            Err(SluiceError::MalformedConverter)
        ));
    }

    #[test]
    fn import_directory_registers_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, body: &str| std::fs::write(dir.path().join(name), body).unwrap();

        write(
            "validate_number_json.json",
            r#"{"mode": "noop",
                "inputs": [{"name": "input", "type": "number", "format": "json"}],
                "outputs": [{"name": "output", "type": "boolean", "format": "boolean"}]}"#,
        );
        write(
            "validate_number_string.json",
            r#"{"mode": "noop",
                "inputs": [{"name": "input", "type": "number", "format": "string"}],
                "outputs": [{"name": "output", "type": "boolean", "format": "boolean"}]}"#,
        );
        // The converter body lives next to the definition; its relative
        // script_uri must resolve against the definition's directory.
        write("to_string.sh", "converter body");
        write(
            "json_to_string.json",
            r#"{"mode": "process", "script_uri": "to_string.sh",
                "inputs": [{"name": "input", "type": "number", "format": "json"}],
                "outputs": [{"name": "output", "type": "number", "format": "string"}]}"#,
        );

        let reg = ConversionRegistry::new();
        reg.import_directory(dir.path(), &TransportRegistry::new())
            .unwrap();

        assert!(reg.has_validator("number", Some("json")));
        assert!(reg.has_validator("number", Some("string")));
        let path = reg.shortest_path("number", "json", "string").unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].script.as_deref(), Some("converter body"));
    }

    #[test]
    fn conversion_table_lists_reachable_pairs() {
        let reg = registry_with_chain();
        let table = reg.conversion_table();
        let has = |f: &str, t: &str| {
            table
                .iter()
                .any(|(a, b)| a.format == f && b.format == t)
        };
        assert!(has("a", "b"));
        assert!(has("a", "d"));
        assert!(!has("d", "a"));
    }
}
