//! # Workflow Executor Tests
//!
//! Step graph expansion, topological ordering, binding propagation between
//! steps, cycle rejection, and visualization terminals.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use sluice::{
    Binding, Connection, ExecContext, FnExecutor, Port, RunOptions, Runtime, SluiceError,
    StepSpec, TaskSpec, VISUALIZATIONS_OUTPUT,
};

// ============================================================================
// HELPERS
// ============================================================================

fn no_validate() -> RunOptions {
    RunOptions {
        validate: false,
        ..Default::default()
    }
}

/// Runtime with `add_three`, `add_two` and `multiply` executors, each
/// recording its run into the shared trace.
fn arithmetic_runtime(trace: Arc<Mutex<Vec<String>>>) -> Runtime {
    let runtime = Runtime::new();

    for (mode, delta) in [("add_three", 3.0), ("add_two", 2.0)] {
        let trace = trace.clone();
        runtime.executors.register(Arc::new(FnExecutor::new(
            mode,
            move |ctx: &mut ExecContext<'_>| {
                trace.lock().push(ctx.task.mode.clone());
                let a = ctx.input_value("a")?.as_f64().unwrap_or(0.0);
                ctx.set_output("b", json!(a + delta))
            },
        )));
    }
    let multiply_trace = trace;
    runtime.executors.register(Arc::new(FnExecutor::new(
        "multiply",
        move |ctx: &mut ExecContext<'_>| {
            multiply_trace.lock().push("multiply".to_string());
            let x = ctx.input_value("in1")?.as_f64().unwrap_or(0.0);
            let y = ctx.input_value("in2")?.as_f64().unwrap_or(0.0);
            ctx.set_output("out", json!(x * y))
        },
    )));
    runtime
}

fn unary_step(name: &str, mode: &str) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        task: TaskSpec::new(mode)
            .input(Port::new("a", "number", "json"))
            .output(Port::new("b", "number", "json")),
        visualization: false,
    }
}

fn multiply_step(name: &str) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        task: TaskSpec::new("multiply")
            .input(Port::new("in1", "number", "json"))
            .input(Port::new("in2", "number", "json"))
            .output(Port::new("out", "number", "json")),
        visualization: false,
    }
}

fn external_in(name: &str, step: &str, port: &str) -> Connection {
    Connection {
        name: Some(name.to_string()),
        input_step: Some(step.to_string()),
        input: Some(port.to_string()),
        ..Default::default()
    }
}

fn internal(from: &str, output: &str, to: &str, input: &str) -> Connection {
    Connection {
        output_step: Some(from.to_string()),
        output: Some(output.to_string()),
        input_step: Some(to.to_string()),
        input: Some(input.to_string()),
        ..Default::default()
    }
}

fn external_out(name: &str, step: &str, port: &str) -> Connection {
    Connection {
        name: Some(name.to_string()),
        output_step: Some(step.to_string()),
        output: Some(port.to_string()),
        ..Default::default()
    }
}

/// `result = (x + 3) * (y + 2)`, with `x` defaulting to 10.
fn arithmetic_workflow() -> TaskSpec {
    TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json").with_default(Binding::inline(json!(10), "json")))
        .input(Port::new("y", "number", "json"))
        .output(Port::new("result", "number", "json"))
        .step(unary_step("plus_three", "add_three"))
        .step(unary_step("plus_two", "add_two"))
        .step(multiply_step("product"))
        .connection(external_in("x", "plus_three", "a"))
        .connection(external_in("y", "plus_two", "a"))
        .connection(internal("plus_three", "b", "product", "in1"))
        .connection(internal("plus_two", "b", "product", "in2"))
        .connection(external_out("result", "product", "out"))
}

// ============================================================================
// CHAINING AND PROPAGATION
// ============================================================================

#[test]
fn chained_arithmetic_produces_sixteen() {
    let runtime = arithmetic_runtime(Arc::new(Mutex::new(Vec::new())));
    let inputs = HashMap::from([
        ("x".to_string(), Binding::inline(json!(1), "json")),
        ("y".to_string(), Binding::inline(json!(2), "json")),
    ]);
    let outputs = runtime
        .run(&arithmetic_workflow(), inputs, HashMap::new(), &no_validate(), None)
        .unwrap();
    assert_eq!(outputs["result"].script_data, Some(json!(16.0)));
}

#[test]
fn defaulted_workflow_input_produces_fifty_two() {
    let runtime = arithmetic_runtime(Arc::new(Mutex::new(Vec::new())));
    let inputs = HashMap::from([("y".to_string(), Binding::inline(json!(2), "json"))]);
    let outputs = runtime
        .run(&arithmetic_workflow(), inputs, HashMap::new(), &no_validate(), None)
        .unwrap();
    assert_eq!(outputs["result"].script_data, Some(json!(52.0)));
}

#[test]
fn linear_chain_runs_in_dependency_order() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let runtime = arithmetic_runtime(trace.clone());

    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .output(Port::new("result", "number", "json"))
        .step(unary_step("s1", "add_three"))
        .step(unary_step("s2", "add_two"))
        .step(unary_step("s3", "add_three"))
        .connection(external_in("x", "s1", "a"))
        .connection(internal("s1", "b", "s2", "a"))
        .connection(internal("s2", "b", "s3", "a"))
        .connection(external_out("result", "s3", "b"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(0), "json"))]);
    let outputs = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap();

    assert_eq!(outputs["result"].script_data, Some(json!(8.0)));
    assert_eq!(
        *trace.lock(),
        vec!["add_three", "add_two", "add_three"]
    );
}

#[test]
fn fan_out_source_runs_before_both_dependents() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let runtime = arithmetic_runtime(trace.clone());

    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .output(Port::new("result", "number", "json"))
        .step(unary_step("root", "add_three"))
        .step(unary_step("left", "add_two"))
        .step(unary_step("right", "add_two"))
        .step(multiply_step("join"))
        .connection(external_in("x", "root", "a"))
        .connection(internal("root", "b", "left", "a"))
        .connection(internal("root", "b", "right", "a"))
        .connection(internal("left", "b", "join", "in1"))
        .connection(internal("right", "b", "join", "in2"))
        .connection(external_out("result", "join", "out"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(1), "json"))]);
    let outputs = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap();

    // (1+3+2) squared.
    assert_eq!(outputs["result"].script_data, Some(json!(36.0)));
    let order = trace.lock();
    assert_eq!(order[0], "add_three");
    assert_eq!(order.last().map(String::as_str), Some("multiply"));
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

#[test]
fn cyclic_workflow_rejected_without_running_anything() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let runtime = arithmetic_runtime(trace.clone());

    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .step(unary_step("s1", "add_three"))
        .step(unary_step("s2", "add_two"))
        .connection(external_in("x", "s1", "a"))
        .connection(internal("s1", "b", "s2", "a"))
        .connection(internal("s2", "b", "s1", "a"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(1), "json"))]);
    let err = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap_err();

    match err {
        SluiceError::CyclicWorkflow { remaining } => {
            assert_eq!(remaining, vec!["s1".to_string(), "s2".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(trace.lock().is_empty(), "no step may execute");
}

#[test]
fn duplicate_step_name_rejected() {
    let runtime = arithmetic_runtime(Arc::new(Mutex::new(Vec::new())));
    let workflow = TaskSpec::new("workflow")
        .step(unary_step("dup", "add_three"))
        .step(unary_step("dup", "add_two"));

    let err = runtime
        .run(&workflow, HashMap::new(), HashMap::new(), &no_validate(), None)
        .unwrap_err();
    assert!(matches!(err, SluiceError::DuplicateStep { name } if name == "dup"));
}

#[test]
fn failing_step_aborts_the_workflow() {
    let runtime = arithmetic_runtime(Arc::new(Mutex::new(Vec::new())));
    runtime.executors.register(Arc::new(FnExecutor::new(
        "explode",
        |_ctx: &mut ExecContext<'_>| Err(SluiceError::Executor("step body failed".into())),
    )));

    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .step(StepSpec {
            name: "boom".to_string(),
            task: TaskSpec::new("explode").input(Port::new("a", "number", "json")),
            visualization: false,
        })
        .connection(external_in("x", "boom", "a"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(1), "json"))]);
    let err = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap_err();
    assert!(matches!(err, SluiceError::Executor(_)));
}

// ============================================================================
// VISUALIZATION TERMINALS
// ============================================================================

#[test]
fn visualization_terminal_collects_descriptor() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let runtime = arithmetic_runtime(trace.clone());

    let viz = StepSpec {
        name: "number_plot".to_string(),
        task: TaskSpec::new("unused").input(Port::new("value", "number", "json")),
        visualization: true,
    };
    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .step(unary_step("s1", "add_three"))
        .step(viz)
        .connection(external_in("x", "s1", "a"))
        .connection(internal("s1", "b", "number_plot", "value"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(4), "json"))]);
    let outputs = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap();

    // The terminal itself never executed.
    assert_eq!(*trace.lock(), vec!["add_three"]);

    let list = outputs[VISUALIZATIONS_OUTPUT]
        .script_data
        .as_ref()
        .and_then(|v| v.as_array())
        .expect("visualization list present");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["mode"], json!("preset"));
    assert_eq!(list[0]["type"], json!("number_plot"));
    assert_eq!(list[0]["inputs"]["value"]["data"], json!(7.0));
}

#[test]
fn visualization_input_without_declared_port_is_an_error() {
    let runtime = arithmetic_runtime(Arc::new(Mutex::new(Vec::new())));

    let viz = StepSpec {
        name: "plot".to_string(),
        // Declares no input ports, but a connection feeds "value".
        task: TaskSpec::new("unused"),
        visualization: true,
    };
    let workflow = TaskSpec::new("workflow")
        .input(Port::new("x", "number", "json"))
        .step(unary_step("s1", "add_three"))
        .step(viz)
        .connection(external_in("x", "s1", "a"))
        .connection(internal("s1", "b", "plot", "value"));

    let inputs = HashMap::from([("x".to_string(), Binding::inline(json!(1), "json"))]);
    let err = runtime
        .run(&workflow, inputs, HashMap::new(), &no_validate(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        SluiceError::MissingVisualizationInput { step, port }
            if step == "plot" && port == "value"
    ));
}
