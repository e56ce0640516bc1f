use crate::task::WorkResult;

/// The drainable side of the result handoff.
///
/// The handoff has no buffering: every delivery rendezvouses with a `recv`
/// call, and a worker with a finished result blocks until a consumer drains
/// it. Receivers are cloneable; results are handed to whichever clone is
/// waiting. The stream ending (`None`) is the sole shutdown signal the
/// coordinator gives its consumers.
pub struct ResultReceiver<T: Send + 'static> {
  rx: kanal::AsyncReceiver<WorkResult<T>>,
}

impl<T: Send + 'static> ResultReceiver<T> {
  pub(crate) fn new(rx: kanal::AsyncReceiver<WorkResult<T>>) -> Self {
    Self { rx }
  }

  /// Waits for the next delivered result. Returns `None` once the handoff
  /// is closed, which happens when all submitted work has finished after
  /// `mark_fully_submitted`, or when the coordinator drains for any reason.
  pub async fn recv(&self) -> Option<WorkResult<T>> {
    self.rx.recv().await.ok()
  }
}

impl<T: Send + 'static> Clone for ResultReceiver<T> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}
