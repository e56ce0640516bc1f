/// Immutable options captured when a coordinator is constructed.
///
/// The zero value of every field means "no constraint", so the default
/// configuration runs unbounded, tolerates any number of failures and
/// contains panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
  /// Ceiling on concurrently executing units of work. `0` means unlimited;
  /// any positive value installs the admission gate and makes `submit`
  /// block once the ceiling is reached.
  pub concurrency_limit: usize,

  /// Number of delivered failures after which the coordinator drains and
  /// closes the result handoff. `0` means failures never trigger shutdown.
  pub max_failures: usize,

  /// Disables the panic-containment wrapper. A panicking unit of work then
  /// unwinds into its runtime task instead of being delivered as a
  /// `WorkError::Panicked` failure.
  pub disable_fault_containment: bool,
}

impl CoordinatorConfig {
  pub fn concurrency_limit(mut self, limit: usize) -> Self {
    self.concurrency_limit = limit;
    self
  }

  pub fn max_failures(mut self, max: usize) -> Self {
    self.max_failures = max;
    self
  }

  pub fn disable_fault_containment(mut self) -> Self {
    self.disable_fault_containment = true;
    self
  }
}
