//! Step processors: the strategies the registry dispatches steps to, plus
//! the shared dispatch loop with its soft-fail policy.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::engine::context::{Evaluation, Scope};
use crate::error::{DrWebError, DrWebResult};
use crate::query::Step;

pub mod conditional;
pub mod extract;
pub mod follow;
pub mod script;

/// A strategy that executes one step kind.
///
/// Processors may read the page through the evaluation but must not spawn
/// concurrent interactions with it, and must never close the session.
#[async_trait]
pub trait StepProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Kind tags this processor handles; must be non-empty.
    fn kinds(&self) -> &'static [&'static str];

    /// Dispatch priority; lower wins, ties break by registration order.
    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, step: &Step) -> bool;

    /// Execute the step and return its record contributions.
    async fn execute(
        &self,
        ev: &mut Evaluation<'_>,
        scope: &Scope,
        step: &Step,
    ) -> DrWebResult<Vec<Value>>;
}

/// Dispatch a single step through the registry.
pub(crate) async fn dispatch_step(
    ev: &mut Evaluation<'_>,
    scope: &Scope,
    step: &Step,
) -> DrWebResult<Vec<Value>> {
    ev.check_cancelled()?;
    let registry = ev.registry.clone();
    let processor = registry
        .find_processor(step)
        .ok_or_else(|| DrWebError::NoProcessor { kind: step.kind().to_string() })?;
    debug!(step_path = ?scope.path, "dispatching `{}` to `{}`", step.kind(), processor.name());
    processor.execute(ev, scope, step).await
}

/// Run a step list in order with the soft-fail policy: a recoverable step
/// error is recorded as a diagnostic and its siblings still run, unless
/// `strict` is set. Fatal errors and cancellation always propagate.
pub(crate) async fn run_steps(
    ev: &mut Evaluation<'_>,
    scope: &Scope,
    steps: &[Step],
) -> DrWebResult<Vec<Value>> {
    let mut results = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        let step_scope = scope.at_step(index);
        match dispatch_step(ev, &step_scope, step).await {
            Ok(values) => results.extend(values),
            Err(DrWebError::Cancelled) => return Err(DrWebError::Cancelled),
            Err(error) if error.is_fatal() => {
                ev.record_failure(&step_scope, &error);
                return Err(error);
            }
            Err(error) => {
                ev.record_failure(&step_scope, &error);
                if ev.config.strict {
                    return Err(error);
                }
            }
        }
    }
    Ok(results)
}
