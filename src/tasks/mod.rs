//! Task records and the operations the UI calls.

mod service;
mod store;
mod types;

pub use service::{Dispatch, TaskService};
pub use store::TaskStore;
pub use types::{TaskId, TaskRecord};
