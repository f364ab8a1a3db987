//! Ephemeral single-use container workers for build execution.
//!
//! kindling provisions throwaway containers ("workers") on a container
//! engine, connects a worker runtime inside each one, hands the worker to
//! a scheduler for exactly one real task, and tears it down afterwards.
//! Nothing is reused: a fresh container per task, a fresh key per
//! container, and a sweep that reconciles the engine against the registry
//! so crashes cannot leak containers.
//!
//! ```text
//!               +-----------+      termination       +-----------+
//!  queue depth  | admission |   requests (channel)   | retention |
//! ------------->|   loop    |                        | monitors  |
//!               +-----+-----+                        +-----+-----+
//!                     | provision                          |
//!                     v                                    v
//!               +-----------------------------------------------+
//!               |                    fleet                      |
//!               |  create/start/launch     stop/remove/sweep    |
//!               +-----+-----------------------------------+-----+
//!                     |  connector hooks                  |
//!                     v                                   v
//!               +-----------+     shared clients    +-----------+
//!               | connector |<--------------------->|  engine   |
//!               | (attach / |    (usage-tracking    |  (docker) |
//!               | ssh / cb) |        cache)         +-----------+
//!               +-----------+
//! ```
//!
//! The pieces compose but stand alone: [`demux`] is a plain codec,
//! [`cache`] a generic reference-counted TTL cache, and [`engine`] a thin
//! trait over the container engine that tests replace wholesale.

pub mod admission;
pub mod cache;
pub mod config;
pub mod connector;
pub mod demux;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod retention;

pub use admission::{Admission, workers_needed};
pub use config::{FleetConfig, PullPolicy, RuntimeSpec, WorkerTemplate};
pub use connector::{
    AttachConnector, CallbackConnector, Connector, ConnectorError, SshAuth, SshConnector,
    Transport,
};
pub use engine::{ContainerEngine, DockerEngine, EngineError, EnginePool};
pub use error::{ConfigError, ProvisionError, TerminateError};
pub use fleet::{Fleet, InMemoryRegistry, ProvisionedWorker, Worker, WorkerRegistry};
pub use retention::{OnceRetention, RetentionMonitor, TaskProfile, TerminationRequest};
