use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::engine::actions::ActionRunner;
use crate::engine::context::{Evaluation, Scope};
use crate::engine::extractor::FieldExtractor;
use crate::engine::processors::follow::{follow_links, restore_page};
use crate::engine::processors::StepProcessor;
use crate::engine::selector;
use crate::error::{DrWebError, DrWebResult};
use crate::query::Step;

/// Processes extract steps: runs the step's actions, matches anchors in
/// document order, builds one record per anchor, and runs inline follows.
///
/// The session owns a single page, so all anchors' fields and link sets are
/// snapshotted before any follow excursion navigates away; the base page is
/// re-opened afterwards.
pub struct ExtractStepProcessor;

#[async_trait]
impl StepProcessor for ExtractStepProcessor {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn kinds(&self) -> &'static [&'static str] {
        &["extract"]
    }

    fn can_handle(&self, step: &Step) -> bool {
        matches!(step, Step::Extract(_))
    }

    async fn execute(
        &self,
        ev: &mut Evaluation<'_>,
        scope: &Scope,
        step: &Step,
    ) -> DrWebResult<Vec<Value>> {
        let Step::Extract(step) = step else {
            return Err(DrWebError::fatal("extract processor dispatched a non-extract step"));
        };

        if !step.actions.is_empty() {
            ActionRunner::new(ev.cancel.clone(), ev.config.poll_interval_ms)
                .run(ev.page, &step.actions)
                .await?;
        }

        let base = ev.page.current_url().await?;
        let base_url = Url::parse(&base)
            .map_err(|e| DrWebError::fatal(format!("session reported invalid URL `{base}`: {e}")))?;

        let anchor_expr = selector::parse_expr(step.xpath.as_str());
        let anchors = ev.page.query(&anchor_expr.base, None).await?;
        debug!("matched {} anchors for `{}`", anchors.len(), step.xpath);

        // snapshot fields and follow links while the base page is loaded
        let mut snapshots: Vec<(Map<String, Value>, Vec<String>)> =
            Vec::with_capacity(anchors.len());
        for anchor in &anchors {
            let (record, failures) =
                FieldExtractor::extract(ev.page, anchor, &step.fields, step.strict).await?;
            for failure in failures {
                ev.record_failure(scope, &failure);
            }

            let links = match &step.follow {
                Some(follow) => {
                    match selector::resolve_links(ev.page, &follow.link_expr, Some(anchor), &base_url)
                        .await
                    {
                        Ok(links) => links,
                        Err(error) => {
                            ev.record_failure(scope, &error);
                            Vec::new()
                        }
                    }
                }
                None => Vec::new(),
            };
            snapshots.push((record, links));
        }

        let mut records = Vec::with_capacity(snapshots.len());
        match &step.follow {
            None => {
                records.extend(snapshots.into_iter().map(|(record, _)| Value::Object(record)));
            }
            Some(follow) => {
                let label = follow.name.as_deref().unwrap_or("follow");
                for (mut record, links) in snapshots {
                    if !links.is_empty() {
                        let children = follow_links(ev, scope, follow, links).await?;
                        if !children.is_empty() {
                            record.insert(label.to_string(), Value::Array(children));
                        }
                    }
                    records.push(Value::Object(record));
                }
                restore_page(ev, &base).await?;
            }
        }

        Ok(records)
    }
}
