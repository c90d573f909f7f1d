//! The `broker` module holds the routing engine: the accept loop, the
//! per-connection tasks, the connection registry with its liveness sweeper
//! and the pending delivery queue.

pub mod engine;
pub mod queue;
pub mod registry;

pub use engine::{Broker, CycleReport, DeliveryReport, Hook, deliver_pending};
pub use queue::{Destination, PendingDelivery, PendingQueue};
pub use registry::{Connection, ConnectionId, Registry, run_sweeper};

#[cfg(test)]
mod tests;
