//! A Tokio-based coordinator for bounded concurrent execution of fallible
//! futures, with an unbuffered result handoff, cooperative cancellation,
//! an error-count shutdown threshold and panic containment.

mod config;
mod coordinator;
mod error;
mod results;
mod task;

pub use config::CoordinatorConfig;
pub use coordinator::TaskCoordinator;
pub use error::WorkError;
pub use results::ResultReceiver;
pub use task::{UnitOfWork, WorkResult};
