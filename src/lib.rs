//! Sluice - data-flow task execution worker

pub mod convert;
pub mod dag;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod spec;
pub mod status;
pub mod stream;
pub mod transport;
pub mod workflow;

pub use convert::{ConversionRegistry, ValidatorKey};
pub use dag::DependencyGraph;
pub use error::{FixSuggestion, SluiceError};
pub use executor::{ExecContext, ExecutorRegistry, FnExecutor, ProcessExecutor, TaskExecutor};
pub use pipeline::{load_task_file, resolve_script, LifecycleHook, RunOptions, Runtime};
pub use spec::{Binding, Connection, Port, StepSpec, Target, TaskSpec};
pub use status::{
    HttpJobRecord, JobRecord, JobStatus, LogBatch, MemoryJobRecord, RecordEvent, StatusReporter,
};
pub use stream::{
    multiplex_loop, FrameDemux, MemoryFetcher, ReadConnector, SinkHandle, StreamFetcher,
    StreamPusher, WriteConnector,
};
pub use transport::{MongoTransport, Transport, TransportRegistry};
pub use workflow::{WorkflowExecutor, VISUALIZATIONS_OUTPUT};
