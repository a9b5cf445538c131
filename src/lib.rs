//! Client-side tracking of long-running remote operations (image builds,
//! image pulls and container actions) against a pull-only REST service.

pub mod classifier;
pub mod config;
pub mod endpoints;
pub mod engine;
pub mod error;
pub mod history;
pub mod journal;
pub mod launcher;
pub mod model;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod wire;

pub use classifier::{FailureClassifier, FailureReport};
pub use config::EngineConfig;
pub use endpoints::{Action, EndpointResolver, TargetRef};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, LaunchError, PollError, TransportError, WaitError};
pub use launcher::BuildSpec;
pub use model::{FailureCategory, OperationId, OperationKind, Phase, StatusRecord};
pub use store::{ReconciliationStore, StoreEvent, Subscription};
