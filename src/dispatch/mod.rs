//! Task dispatch fabric: durable ordered queue, status view, worker pool.

pub mod dispatcher;
pub mod queue;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use queue::{
    InMemoryQueue, InMemoryStatusStore, Lease, StatusStore, TaskQueue, queue_from_endpoint,
    status_store_from_endpoint,
};
pub use worker::{WorkerContext, WorkerPool};
