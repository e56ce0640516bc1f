use std::any::Any;
use std::backtrace::Backtrace;

use thiserror::Error;

/// Failure outcome of a single unit of work.
///
/// Both variants are ordinary data flowing through the result handoff; the
/// coordinator never special-cases them beyond failure-threshold counting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkError {
  /// A failure returned by the unit of work itself.
  #[error("{0}")]
  Failed(String),

  /// A panic intercepted inside the unit of work by the containment wrapper,
  /// carrying the panic payload and a backtrace captured at the recovery
  /// point.
  #[error("panic recovered: {message}\n{trace}")]
  Panicked { message: String, trace: String },
}

impl WorkError {
  /// Builds an ordinary work failure from any displayable message.
  pub fn failure(message: impl Into<String>) -> Self {
    WorkError::Failed(message.into())
  }

  pub(crate) fn panicked(message: String) -> Self {
    WorkError::Panicked {
      message,
      trace: Backtrace::force_capture().to_string(),
    }
  }

  /// True if this failure came out of the panic-containment wrapper.
  pub fn is_contained_panic(&self) -> bool {
    matches!(self, WorkError::Panicked { .. })
  }
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "opaque panic payload".to_string()
  }
}
