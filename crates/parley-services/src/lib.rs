//! parley-services: connection registry, message queues, worker pool and
//! the bulk transfer protocol.

pub mod pool;
pub mod queue;
pub mod registry;
pub mod repo;
pub mod transfer;
pub mod transport;

pub use pool::{PoolError, TaskHandle, WorkerPool};
pub use queue::{MessageQueue, MessageQueues};
pub use registry::{ConnectionInfo, LookupError, Registry};
pub use repo::{RepoError, Repository};
pub use transfer::{BulkReceiver, BulkSender, Progress, TransferConfig, TransferError};
pub use transport::{BulkHandle, BulkStream, ConnId, ControlHandle, ControlReader, Transport, TransportError};

/// Registry of logged-in control sessions.
pub type ControlRegistry = Registry<ControlHandle>;

/// Registry of bulk connections waiting for their transfer.
pub type BulkRegistry = Registry<BulkHandle>;
