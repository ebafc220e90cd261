use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::actions::ActionRunner;
use crate::engine::context::{Evaluation, Scope};
use crate::engine::processors::StepProcessor;
use crate::error::{DrWebError, DrWebResult};
use crate::query::{Step, DEFAULT_TIMEOUT_MS};

/// Processes script steps: optionally polls a readiness predicate, executes
/// the script body in page context, and shapes the returned value into
/// records.
pub struct ScriptStepProcessor;

#[async_trait]
impl StepProcessor for ScriptStepProcessor {
    fn name(&self) -> &'static str {
        "script"
    }

    fn kinds(&self) -> &'static [&'static str] {
        &["script"]
    }

    fn priority(&self) -> i32 {
        20
    }

    fn can_handle(&self, step: &Step) -> bool {
        matches!(step, Step::Script(_))
    }

    async fn execute(
        &self,
        ev: &mut Evaluation<'_>,
        scope: &Scope,
        step: &Step,
    ) -> DrWebResult<Vec<Value>> {
        let Step::Script(step) = step else {
            return Err(DrWebError::fatal("script processor dispatched a non-script step"));
        };

        let timeout_ms = step.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        if let Some(predicate) = &step.wait_for {
            ActionRunner::new(ev.cancel.clone(), ev.config.poll_interval_ms)
                .wait_for_script(ev.page, predicate, timeout_ms)
                .await?;
        }

        let mut value = ev.page.run_script(&step.code).await?;
        debug!(step_path = ?scope.path, "script step returned a {}", value_kind(&value));

        if step.return_json {
            if let Value::String(raw) = &value {
                match serde_json::from_str::<Value>(raw) {
                    Ok(parsed) => value = parsed,
                    Err(e) => warn!("script result is not valid JSON, keeping raw string: {e}"),
                }
            }
        }

        Ok(match value {
            Value::Null => {
                warn!("script step returned no result");
                Vec::new()
            }
            Value::Array(list) => list,
            Value::Object(map) => vec![Value::Object(map)],
            primitive => {
                let key = step.name.as_deref().unwrap_or("script_result");
                vec![serde_json::json!({ key: primitive })]
            }
        })
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
