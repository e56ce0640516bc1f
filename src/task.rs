use crate::error::WorkError;

use std::future::Future;
use std::pin::Pin;

/// The (value, error) outcome of one unit of work.
pub type WorkResult<T> = Result<T, WorkError>;

/// The type of future a producer submits to the coordinator.
/// It must be `Send` and `'static`, and resolve to a `WorkResult<T>`.
pub type UnitOfWork<T> = Pin<Box<dyn Future<Output = WorkResult<T>> + Send + 'static>>;
