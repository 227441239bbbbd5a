use async_trait::async_trait;
use lodestar_domain::{ExecutionFailure, ExecutionOutcome, TaskMessage};
use tokio_util::sync::CancellationToken;

/// Opaque execution capability invoked by the worker pool.
///
/// Delivery is at-least-once, so implementations must tolerate repeated and
/// concurrent invocations for one task id.
///
/// A shutting-down pool first lets running executions finish. The
/// cancellation token fires only once the drain deadline has passed and
/// should then be honored promptly. Executions that ignore it are abandoned
/// to lease expiry.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executes one task.
    async fn execute(
        &self,
        task: &TaskMessage,
        cancellation: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionFailure>;
}
