//! Request processing pipeline: orchestration, source fetching, bundle
//! assembly, execution locking, and the worker harness.

pub mod backend;
pub mod bundle;
pub mod config;
pub mod fetch;
pub mod locks;
pub mod orchestrator;
pub mod pool;
pub mod queue;

pub use backend::{BackendError, JsonBackend, RequestBackend, TransitionPayload};
pub use bundle::{BundleBuilder, BundleInputs};
pub use config::Config;
pub use fetch::{SourceFetcher, SourceSnapshot};
pub use orchestrator::Orchestrator;
pub use pool::WorkerPool;
pub use queue::{InProcessQueue, WorkItem, WorkQueue};
