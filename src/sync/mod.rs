//! Reconciliation of queued mutations with the server.

mod coordinator;
mod registry;
mod sink;

pub use coordinator::{SyncCoordinator, SyncReport, SyncTrigger};
pub use registry::SyncRegistry;
pub use sink::{Delivery, DeliveryError, HttpSink, MutationSink};
