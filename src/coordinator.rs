use crate::config::CoordinatorConfig;
use crate::error::{panic_message, WorkError};
use crate::results::ResultReceiver;
use crate::task::{UnitOfWork, WorkResult};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use kanal;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_COORDINATED_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

/// Lifecycle phase of a coordinator.
///
/// There is no stored `Closed` phase: closed is observable as "the result
/// handoff channel is closed", and the channel close is the one-time guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  /// Accepting submissions.
  Open,
  /// Producer declared submission complete; work may still be running.
  Fed,
  /// Cancellation triggered; new submissions are dropped, in-flight work
  /// runs to completion. `was_fed` preserves the submission contract so a
  /// late `submit` still panics instead of being silently dropped.
  Draining { was_fed: bool },
}

/// Guarded by one critical section: the phase and the failure counter must
/// move together for the threshold protocol to be race-free.
struct Shared {
  phase: Phase,
  failures: usize,
}

fn enter_draining(shared: &Mutex<Shared>) {
  let mut shared = shared.lock();
  if let Phase::Draining { .. } = shared.phase {
    return;
  }
  shared.phase = Phase::Draining {
    was_fed: shared.phase == Phase::Fed,
  };
}

struct Inner<T: Send + 'static> {
  group_name: Arc<String>,
  config: CoordinatorConfig,
  shared: Arc<Mutex<Shared>>,
  gate: Option<Arc<Semaphore>>,
  tracker: TaskTracker,
  results_tx: kanal::AsyncSender<WorkResult<T>>,
  results_rx: kanal::AsyncReceiver<WorkResult<T>>,
  cancel_token: CancellationToken,
  tokio_handle: TokioHandle,
}

/// Coordinates a group of independently submitted, fallible units of work.
///
/// Work runs concurrently on the supplied Tokio handle, optionally throttled
/// by an admission gate, and every unit's outcome is delivered through a
/// single unbuffered result handoff obtained from [`results`]. Producers end
/// the group either by declaring submission complete
/// ([`mark_fully_submitted`]) and letting in-flight work drain, or by
/// cancelling; consumers treat the result stream ending as the sole shutdown
/// signal.
///
/// Clones share one coordinator. When the last clone drops with the
/// cancellation scope still untriggered, the scope is cancelled so the
/// shutdown watcher and any blocked consumer are released.
///
/// [`results`]: TaskCoordinator::results
/// [`mark_fully_submitted`]: TaskCoordinator::mark_fully_submitted
pub struct TaskCoordinator<T: Send + 'static> {
  inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> TaskCoordinator<T> {
  /// Creates a coordinator with a fresh cancellation scope.
  pub fn new(config: CoordinatorConfig, tokio_handle: TokioHandle, name: &str) -> Self {
    Self::build(CancellationToken::new(), config, tokio_handle, name)
  }

  /// Creates a coordinator whose cancellation scope is derived from
  /// `parent`, so an external trigger on the parent (a timeout, typically)
  /// drains the coordinator. The returned token is the coordinator's own
  /// scope, identical to what [`cancellation_scope`] hands out.
  ///
  /// [`cancellation_scope`]: TaskCoordinator::cancellation_scope
  pub fn with_parent_scope(
    parent: &CancellationToken,
    config: CoordinatorConfig,
    tokio_handle: TokioHandle,
    name: &str,
  ) -> (Self, CancellationToken) {
    let scope = parent.child_token();
    let coordinator = Self::build(scope.clone(), config, tokio_handle, name);
    (coordinator, scope)
  }

  fn build(
    cancel_token: CancellationToken,
    config: CoordinatorConfig,
    tokio_handle: TokioHandle,
    name: &str,
  ) -> Self {
    let (results_tx, results_rx) = kanal::bounded_async::<WorkResult<T>>(0);
    let group_name = Arc::new(name.to_string());
    let shared = Arc::new(Mutex::new(Shared {
      phase: Phase::Open,
      failures: 0,
    }));
    let gate = (config.concurrency_limit > 0).then(|| Arc::new(Semaphore::new(config.concurrency_limit)));

    // Shutdown watcher. It runs for the coordinator's whole life and is what
    // lets manual, threshold-triggered and external cancellation close the
    // handoff even if the producer never declares submission complete.
    let watcher_group_name = group_name.clone();
    let watcher_shared = shared.clone();
    let watcher_token = cancel_token.clone();
    let watcher_results_tx = results_tx.clone();
    tokio_handle.spawn(
      async move {
        watcher_token.cancelled().await;
        enter_draining(&watcher_shared);
        debug!(group = %watcher_group_name, "cancellation scope fired; closing result handoff");
        let _ = watcher_results_tx.close();
      }
      .instrument(info_span!("shutdown_watcher", group = %name)),
    );

    info!(group = %name, ?config, "task coordinator created");

    Self {
      inner: Arc::new(Inner {
        group_name,
        config,
        shared,
        gate,
        tracker: TaskTracker::new(),
        results_tx,
        results_rx,
        cancel_token,
        tokio_handle,
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.inner.group_name
  }

  /// Number of submitted units that have not yet finished their delivery
  /// attempt. Includes submissions currently blocked on the admission gate.
  pub fn in_flight_count(&self) -> usize {
    self.inner.tracker.len()
  }

  /// Hands out the drainable side of the result handoff.
  pub fn results(&self) -> ResultReceiver<T> {
    ResultReceiver::new(self.inner.results_rx.clone())
  }

  /// A clone of the coordinator's cancellation scope, for producers that
  /// want to observe the shutdown signal or propagate it into work they
  /// dispatch themselves.
  pub fn cancellation_scope(&self) -> CancellationToken {
    self.inner.cancel_token.clone()
  }

  /// Submits one unit of work.
  ///
  /// If an admission gate is configured this blocks the caller until a
  /// permit frees up; that is the backpressure contract. Once the
  /// coordinator is draining the submission is silently dropped: the unit
  /// never runs and nothing is delivered for it.
  ///
  /// # Panics
  ///
  /// Panics if called after [`mark_fully_submitted`], which is a broken
  /// producer contract, not a runtime condition.
  ///
  /// [`mark_fully_submitted`]: TaskCoordinator::mark_fully_submitted
  pub async fn submit(&self, work: UnitOfWork<T>) {
    {
      let shared = self.inner.shared.lock();
      match shared.phase {
        Phase::Open => {}
        Phase::Fed | Phase::Draining { was_fed: true } => {
          panic!("unit of work submitted after mark_fully_submitted; producer contract violated");
        }
        Phase::Draining { was_fed: false } => {
          debug!(group = %self.inner.group_name, "submission while draining; dropped");
          return;
        }
      }
    }
    if self.inner.cancel_token.is_cancelled() {
      // The scope fired but the shutdown watcher has not flipped the phase
      // yet. Treat it as draining.
      debug!(group = %self.inner.group_name, "submission after scope expiry; dropped");
      return;
    }

    let task_id = NEXT_COORDINATED_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed);

    // Counted before the gate so the completion watcher cannot see an empty
    // tracker while a submission is still blocked on a permit.
    let tracked = self.inner.tracker.token();

    let permit: Option<OwnedSemaphorePermit> = match &self.inner.gate {
      Some(gate) => match gate.clone().acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(_) => {
          warn!(group = %self.inner.group_name, %task_id, "admission gate closed unexpectedly; submission dropped");
          drop(tracked);
          return;
        }
      },
      None => None,
    };

    trace!(group = %self.inner.group_name, %task_id, "dispatching unit of work");

    let this = self.clone();
    let span = info_span!("coordinated_task", group = %self.inner.group_name, %task_id);
    self.inner.tokio_handle.spawn(
      async move {
        // Dropped in reverse order at the end of the block: the permit frees
        // an admission slot first, the tracker token lets the in-flight
        // count reach zero only after the delivery attempt. Both also run
        // when a non-contained panic unwinds this task.
        let _tracked = tracked;
        let _permit = permit;

        let outcome = this.run_contained(work, task_id).await;
        this.deliver(outcome, task_id).await;
      }
      .instrument(span),
    );
  }

  /// Declares that no further work will be submitted, and arms the
  /// completion watcher that closes the result handoff once the in-flight
  /// count reaches zero. Idempotent; only the first call in the open phase
  /// has any effect.
  pub fn mark_fully_submitted(&self) {
    {
      let mut shared = self.inner.shared.lock();
      match shared.phase {
        Phase::Open => shared.phase = Phase::Fed,
        Phase::Draining { was_fed: false } => {
          // Draining already closes the handoff, so no completion watcher is
          // needed, but the submission contract still ends here: a later
          // submit must fail loudly, not be silently dropped.
          shared.phase = Phase::Draining { was_fed: true };
          trace!(group = %self.inner.group_name, "mark_fully_submitted while draining; submission contract recorded");
          return;
        }
        _ => {
          trace!(group = %self.inner.group_name, "mark_fully_submitted repeated; ignored");
          return;
        }
      }
    }
    self.inner.tracker.close();
    info!(group = %self.inner.group_name, "fully submitted; completion watcher armed");

    let group_name = self.inner.group_name.clone();
    let tracker = self.inner.tracker.clone();
    let shared = self.inner.shared.clone();
    let cancel_token = self.inner.cancel_token.clone();
    let results_tx = self.inner.results_tx.clone();
    let span = info_span!("completion_watcher", group = %self.inner.group_name);
    self.inner.tokio_handle.spawn(
      async move {
        tracker.wait().await;
        debug!(group = %group_name, "all in-flight work finished; closing result handoff");
        enter_draining(&shared);
        cancel_token.cancel();
        let _ = results_tx.close();
      }
      .instrument(span),
    );
  }

  /// Triggers draining: no new work is dispatched, in-flight work runs to
  /// completion, and the shutdown watcher closes the result handoff.
  /// Idempotent.
  pub fn cancel(&self) {
    debug!(group = %self.inner.group_name, "cancellation requested");
    self.begin_draining();
  }

  fn begin_draining(&self) {
    enter_draining(&self.inner.shared);
    self.inner.cancel_token.cancel();
  }

  /// Runs one unit of work inside the fault boundary, unless containment is
  /// disabled, in which case a panic unwinds into the runtime task and the
  /// scoped cleanup in `submit` still releases the permit and the tracker
  /// token.
  async fn run_contained(&self, work: UnitOfWork<T>, task_id: u64) -> WorkResult<T> {
    if self.inner.config.disable_fault_containment {
      return work.await;
    }
    match AssertUnwindSafe(work).catch_unwind().await {
      Ok(outcome) => outcome,
      Err(payload) => {
        let message = panic_message(payload);
        error!(group = %self.inner.group_name, %task_id, %message, "unit of work panicked; converted to failure");
        Err(WorkError::panicked(message))
      }
    }
  }

  /// Attempts delivery of one outcome, applying the failure-threshold
  /// protocol.
  ///
  /// The handoff has no buffering, so once shutdown is decided the number of
  /// further deliveries must stay bounded or a blocked send could deadlock
  /// the close. The counter comparison below guarantees at most
  /// `max_failures` failing results ever reach the handoff; anything past
  /// the threshold is dropped.
  async fn deliver(&self, outcome: WorkResult<T>, task_id: u64) {
    let inner = &self.inner;

    if outcome.is_err() && inner.config.max_failures > 0 {
      let seen = {
        let mut shared = inner.shared.lock();
        shared.failures += 1;
        shared.failures
      };

      if seen > inner.config.max_failures {
        trace!(group = %inner.group_name, %task_id, failures = seen, "failure past threshold; result dropped");
        return;
      }

      // The send must not happen under the lock: a rendezvous delivery can
      // block until a consumer drains it.
      if inner.results_tx.send(outcome).await.is_err() {
        trace!(group = %inner.group_name, %task_id, "handoff closed; failure dropped");
      }
      if seen == inner.config.max_failures {
        info!(group = %inner.group_name, failures = seen, "failure threshold reached; draining");
        self.begin_draining();
      }
      return;
    }

    if inner.results_tx.send(outcome).await.is_err() {
      trace!(group = %inner.group_name, %task_id, "handoff closed; result dropped");
    }
  }
}

impl<T: Send + 'static> Clone for TaskCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T: Send + 'static> Drop for Inner<T> {
  fn drop(&mut self) {
    // Last handle gone. Workers hold their own clone of the coordinator, so
    // this only fires once no submitted work is left either; if the scope
    // never fired, trigger it so the shutdown watcher exits and a blocked
    // consumer sees the handoff close.
    if !self.cancel_token.is_cancelled() {
      debug!(group = %self.group_name, "coordinator dropped without shutdown; cancelling scope");
      self.cancel_token.cancel();
    }
  }
}
