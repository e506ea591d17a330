//! workbridge: typed call/response bridge between a controller and a background worker.

mod error;
mod health;
mod version;

pub mod bridge;
pub mod endpoint;
pub mod inbound;
pub mod ops;
pub mod pending;
pub mod registry;
pub mod supervisor;
pub mod worker;

pub use bridge::channel::{Channel, ChannelHub};
pub use bridge::protocol::{CallId, Envelope, Failure, FailureKind};
pub use endpoint::{Bridge, BridgeConfig, Peer, PendingReply, Role};
pub use error::BridgeError;
pub use health::WorkerHealth;
pub use inbound::{CallSender, call_queue};
pub use registry::{HandlerRegistry, Operation, RegistryError};
pub use supervisor::{
    CommandSpawner, Launch, SpawnError, Supervisor, SupervisorConfig, SupervisorError,
    TaskSpawner, WorkerSpawner,
};
pub use version::{PROTOCOL_VERSION, VERSION_ENV, VersionInfo, WORKBRIDGE_VERSION};
pub use worker::{Lifecycle, WorkerError, WorkerHandle, register_lifecycle, run_worker};
