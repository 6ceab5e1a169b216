#![forbid(unsafe_code)]

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod journal;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod restore;
pub mod retention;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most callers touch.
pub use crate::cancel::CancelToken;
pub use crate::core::{Snapshot, SubvolumeInfo, TimestampFormat};
pub use crate::endpoint::{Endpoint, EndpointOptions, EndpointUrl};
pub use crate::orchestrator::{Orchestrator, RetryPolicy, RunOptions, RunReport};
pub use crate::restore::{RestoreOptions, RestoreTarget};
pub use crate::retention::Policy;
