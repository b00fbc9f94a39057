//! Data model shared by the packmule pipeline: requests, dependency graphs,
//! the request state machine, and the classified error taxonomy.

pub mod dependency;
pub mod error;
pub mod request;
pub mod state;

pub use dependency::{Dependency, DependencyConflict, DependencySet};
pub use error::{ErrorKind, PipelineError};
pub use request::{BundleRef, RequestError, RequestRecord};
pub use state::{validate_transition, RequestState, StateEntry, StateError};
