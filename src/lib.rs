#![forbid(unsafe_code)]

//! # crossprompt
//!
//! Chained text generation with memory.
//!
//! A task goes through three stages, each on its own model: a technical
//! summary, an action plan built on the summary, and a critical evaluation of
//! the plan. Every request is grounded in web context retrieved for the task,
//! and the artifacts of the last completed full run are kept in a JSON memory
//! file that later runs see in their prompts. A single stage can be rerun on
//! its own; it reads its upstream input from memory and never changes it.
//!
//! See `DESIGN.md` for the module map.

pub mod backend;
pub mod config;
pub mod export;
pub mod gateway;
pub mod memory;
pub mod pipeline;
pub mod prompts;
pub mod retriever;
pub mod telemetry;

pub use backend::{BackendConfig, GatewayBackend, GenerationBackend, GenerationError};
pub use config::{AppConfig, ConfigError};
pub use export::{Exporter, Headings, MarkdownExporter};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use memory::{ArtifactKey, JsonFileMemoryStore, Memory, MemoryStore, StorageError};
pub use pipeline::{
    Orchestrator, PipelineConfig, PipelineError, RetrievalPolicy, RunMode, RunReport, RunRequest,
    Stage, StageBackends, WorkingContext,
};
pub use retriever::{ContextRetriever, RetrievalError, WebContext, WebRetriever};
