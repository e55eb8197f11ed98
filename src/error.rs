//! Error taxonomy with fix suggestions

use thiserror::Error;

use crate::status::JobStatus;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum SluiceError {
    // ─────────────────────────────────────────────────────────────
    // Configuration errors: fatal to the run, never retried
    // ─────────────────────────────────────────────────────────────
    #[error("unknown task mode '{mode}'")]
    UnknownMode { mode: String },

    #[error("no validator registered for {type_name}/{format}")]
    UnknownValidator { type_name: String, format: String },

    #[error("no conversion path from {type_name}/{from} to {type_name}/{to}")]
    NoConversionPath {
        type_name: String,
        from: String,
        to: String,
    },

    #[error("converter must keep the same type, got '{input}' -> '{output}'")]
    ConverterTypeMismatch { input: String, output: String },

    #[error("converter must have exactly one input named 'input' and one output named 'output'")]
    MalformedConverter,

    #[error("unknown transport mode '{mode}'")]
    UnknownTransport { mode: String },

    #[error("transport mode '{mode}' does not support streaming")]
    StreamingUnsupported { mode: String },

    #[error("duplicate step name '{name}' in workflow")]
    DuplicateStep { name: String },

    #[error("cyclic dependencies detected among steps: {}", remaining.join(", "))]
    CyclicWorkflow { remaining: Vec<String> },

    #[error("task input '{port}' is not declared")]
    UnknownPort { port: String },

    #[error("required input '{port}' not provided")]
    MissingInput { port: String },

    #[error("executor did not produce data for output '{port}'")]
    MissingOutput { port: String },

    #[error("visualization input '{port}' is not declared on step '{step}'")]
    MissingVisualizationInput { step: String, port: String },

    // ─────────────────────────────────────────────────────────────
    // Validation / conversion errors
    // ─────────────────────────────────────────────────────────────
    #[error(
        "input '{port}' ({observed}) is not in the expected type ({type_name}) \
         and format ({format})"
    )]
    InvalidInput {
        port: String,
        observed: String,
        type_name: String,
        format: String,
    },

    #[error(
        "output '{port}' ({observed}) is not in the expected type ({type_name}) \
         and format ({format})"
    )]
    InvalidOutput {
        port: String,
        observed: String,
        type_name: String,
        format: String,
    },

    #[error("expected exact format match but '{actual}' != '{expected}'")]
    FormatMismatch { expected: String, actual: String },

    #[error("conversion for '{port}' failed: {source}")]
    Conversion {
        port: String,
        #[source]
        source: Box<SluiceError>,
    },

    // ─────────────────────────────────────────────────────────────
    // Protocol errors
    // ─────────────────────────────────────────────────────────────
    #[error("malformed frame header: unknown channel tag {tag}")]
    MalformedFrame { tag: u8 },

    #[error("input pipe must be a fifo: {path}")]
    NotAFifo { path: String },

    #[error("input pipe does not exist: {path}")]
    MissingFifo { path: String },

    // ─────────────────────────────────────────────────────────────
    // Recoverable / runtime errors
    // ─────────────────────────────────────────────────────────────
    #[error("invalid job status transition from {from:?} to {to:?}")]
    StateTransition { from: JobStatus, to: JobStatus },

    #[error("process exited with status {code}")]
    ProcessFailed { code: i32 },

    #[error("executor error: {0}")]
    Executor(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("BSON encoding error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FixSuggestion for SluiceError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            SluiceError::UnknownMode { .. } => {
                Some("Register an executor for this mode before running the task")
            }
            SluiceError::UnknownValidator { .. } => {
                Some("Import or register a validator for this type/format pair")
            }
            SluiceError::NoConversionPath { .. } => {
                Some("Register intermediate converters to connect the two formats")
            }
            SluiceError::ConverterTypeMismatch { .. } | SluiceError::MalformedConverter => {
                Some("Converters take one 'input' and one 'output' port of the same type")
            }
            SluiceError::UnknownTransport { .. } => {
                Some("Register a transport for this mode, or set 'mode' explicitly")
            }
            SluiceError::DuplicateStep { .. } => Some("Use unique step names in the workflow"),
            SluiceError::CyclicWorkflow { .. } => {
                Some("Remove the circular connection between the listed steps")
            }
            SluiceError::MissingInput { .. } => {
                Some("Bind the input or declare a default on the port")
            }
            SluiceError::MissingOutput { .. } => {
                Some("The task body must assign a value to every declared output")
            }
            SluiceError::FormatMismatch { .. } => {
                Some("Enable auto conversion or bind data in the declared format")
            }
            SluiceError::NotAFifo { .. } | SluiceError::MissingFifo { .. } => {
                Some("Create the named pipe with mkfifo before wiring a stream to it")
            }
            SluiceError::StateTransition { .. } => {
                Some("Re-query the current job status before retrying the transition")
            }
            _ => None,
        }
    }
}

/// Short name for a JSON value's runtime type, used in validation errors.
pub fn value_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
