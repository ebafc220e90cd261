use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::engine::conditions::ConditionEvaluator;
use crate::engine::context::{Evaluation, Scope};
use crate::engine::processors::{run_steps, StepProcessor};
use crate::error::{DrWebError, DrWebResult};
use crate::query::Step;

/// Processes conditional steps: evaluates the predicate once and dispatches
/// exactly one branch through the registry.
pub struct ConditionalStepProcessor;

#[async_trait]
impl StepProcessor for ConditionalStepProcessor {
    fn name(&self) -> &'static str {
        "conditional"
    }

    fn kinds(&self) -> &'static [&'static str] {
        &["conditional"]
    }

    fn can_handle(&self, step: &Step) -> bool {
        matches!(step, Step::Conditional(_))
    }

    async fn execute(
        &self,
        ev: &mut Evaluation<'_>,
        scope: &Scope,
        step: &Step,
    ) -> DrWebResult<Vec<Value>> {
        let Step::Conditional(step) = step else {
            return Err(DrWebError::fatal("conditional processor dispatched a non-conditional step"));
        };

        let outcome = ConditionEvaluator::evaluate(ev.page, &step.condition).await?;
        debug!(step_path = ?scope.path, "condition evaluated to {outcome}");

        if outcome {
            run_steps(ev, scope, &step.then_steps).await
        } else if step.else_steps.is_empty() {
            Ok(Vec::new())
        } else {
            run_steps(ev, scope, &step.else_steps).await
        }
    }
}
