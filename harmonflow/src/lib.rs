//! # Harmonflow
//!
//! A declarative pipeline engine for identifier-harmonization workflows.
//!
//! A pipeline is a named, ordered list of steps. Each step names a registered
//! operation and a parameter map that may contain `${...}` references to
//! pipeline parameters, environment values, metadata, built-ins and the
//! outputs of earlier steps. The engine provides:
//!
//! - **Expression resolution**: dependency-ordered parameter substitution
//!   with cycle detection and type coercion
//! - **Path resolution**: layered lookup of input files and rooting of outputs
//! - **Operation registry**: an explicit, injectable catalogue of operations
//! - **Sequential execution**: per-step failure policies, deadlines and
//!   an append-only provenance trail
//! - **Chunked batching**: memory-adaptive, order-preserving dataset chunking
//! - **External calls**: a rate-limited, caching, retrying client
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use harmonflow::prelude::*;
//!
//! let definition = loader::from_yaml_str(r#"
//! name: demo
//! parameters:
//!   base: /tmp/x
//! steps:
//!   - name: s1
//!     action:
//!       type: ECHO
//!       params:
//!         v: "${parameters.base}/f.csv"
//! "#)?;
//!
//! let context = run_pipeline(&definition, &serde_json::Map::new()).await?;
//! assert_eq!(context.provenance().len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod batch;
pub mod client;
pub mod config;
pub mod context;
pub mod errors;
pub mod events;
pub mod observability;
pub mod operations;
pub mod paths;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{ChunkConfig, ChunkedOperation, DatasetOperation};
    pub use crate::client::{
        CallError, ClientConfig, ClientStats, RateLimitedClient, RetryConfig, Upstream,
    };
    pub use crate::config::{EngineConfig, EnvSource, MapEnv, ProcessEnv};
    pub use crate::context::{
        ContextDelta, ContextSnapshot, Dataset, ExecutionContext, ProvenanceRecord, Row,
    };
    pub use crate::errors::{
        CircularReferenceError, ConfigurationError, EngineWarning, HarmonflowError,
        OperationError, OperationExecutionError, ParameterValidationError,
        UnknownOperationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::operations::{
        ContextSlot, Operation, OperationResult, OperationSchema, ParamKind, ParamSpec,
        ResolvedParams, StepContext,
    };
    pub use crate::paths::{PathMode, PathResolver};
    pub use crate::pipeline::{
        loader, run_pipeline, FailurePolicy, PipelineDefinition, PipelineExecutor,
        PipelineOutcome, RunStatus, Step, StepFailure,
    };
    pub use crate::registry::OperationRegistry;
    pub use crate::resolver::{Coercion, ExpressionResolver, Namespace};
}
