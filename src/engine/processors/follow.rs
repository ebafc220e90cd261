//! Follow engine: recursive link navigation bounded by depth and a
//! branch-scoped visited set.
//!
//! Termination: depth grows monotonically down any branch and is capped by
//! `max_depth`; with cycle detection on, each canonical URL is opened at most
//! once per branch. Together these bound the traversal of any link graph.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::context::{Evaluation, Scope};
use crate::engine::processors::{run_steps, StepProcessor};
use crate::engine::selector;
use crate::error::{DrWebError, DrWebResult};
use crate::query::{FollowSpec, Step};

/// Processes standalone follow steps: resolves links from the document root,
/// walks them, and restores the base page for the sibling steps.
pub struct FollowStepProcessor;

#[async_trait]
impl StepProcessor for FollowStepProcessor {
    fn name(&self) -> &'static str {
        "follow"
    }

    fn kinds(&self) -> &'static [&'static str] {
        &["follow"]
    }

    fn priority(&self) -> i32 {
        30
    }

    fn can_handle(&self, step: &Step) -> bool {
        matches!(step, Step::Follow(_))
    }

    async fn execute(
        &self,
        ev: &mut Evaluation<'_>,
        scope: &Scope,
        step: &Step,
    ) -> DrWebResult<Vec<Value>> {
        let Step::Follow(spec) = step else {
            return Err(DrWebError::fatal("follow processor dispatched a non-follow step"));
        };

        let base = ev.page.current_url().await?;
        let base_url = Url::parse(&base)
            .map_err(|e| DrWebError::fatal(format!("session reported invalid URL `{base}`: {e}")))?;

        let links = selector::resolve_links(ev.page, &spec.link_expr, None, &base_url).await?;
        let results = follow_links(ev, scope, spec, links).await?;

        restore_page(ev, &base).await?;
        Ok(results)
    }
}

/// Re-open the page a follow excursion started from, so sibling steps and
/// pagination observe the page they were authored against.
pub(crate) async fn restore_page(ev: &mut Evaluation<'_>, base: &str) -> DrWebResult<()> {
    if ev.page.current_url().await? != base {
        debug!("restoring base page {base}");
        ev.page.open(base, ev.config.navigation_timeout_ms).await?;
    }
    Ok(())
}

/// Walk a resolved link set: filter, open, evaluate the spec's steps, then
/// recurse on the links the followed page itself yields (Kleene star).
///
/// Skipped links (cycle, external, malformed) and failed navigations are
/// logged and dropped; they never fail the evaluation.
pub(crate) fn follow_links<'a>(
    ev: &'a mut Evaluation<'_>,
    scope: &'a Scope,
    spec: &'a FollowSpec,
    links: Vec<String>,
) -> BoxFuture<'a, DrWebResult<Vec<Value>>> {
    async move {
        if scope.depth + 1 > spec.max_depth {
            debug!(
                "follow depth {} would exceed max depth {}; dropping {} links",
                scope.depth + 1,
                spec.max_depth,
                links.len()
            );
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for link in links {
            ev.check_cancelled()?;

            let url = match Url::parse(&link) {
                Ok(url) => url,
                Err(e) => {
                    warn!("dropping malformed link `{link}`: {e}");
                    continue;
                }
            };
            let canonical = selector::canonicalize(&url);

            if spec.detect_cycles && scope.visited.contains(&canonical) {
                debug!("cycle detected for {canonical}; skipping");
                continue;
            }
            if !spec.follow_external && selector::is_external(&url, scope.start_host.as_deref()) {
                debug!("external link {link} skipped");
                continue;
            }

            let child = scope.follow(canonical);
            info!("following link {link} (depth {})", child.depth);
            if let Err(e) = ev.page.open(&link, ev.config.navigation_timeout_ms).await {
                warn!("dropping link {link}: {e}");
                continue;
            }

            let mut page_records = run_steps(ev, &child, &spec.steps).await?;
            if spec.tag_source {
                for record in &mut page_records {
                    if let Value::Object(map) = record {
                        map.insert("_source_url".to_string(), Value::String(link.clone()));
                    }
                }
            }
            results.extend(page_records);

            // the followed page's own links continue the star
            let next = match selector::resolve_links(ev.page, &spec.link_expr, None, &url).await {
                Ok(next) => next,
                Err(error) => {
                    ev.record_failure(&child, &error);
                    Vec::new()
                }
            };
            if !next.is_empty() {
                results.extend(follow_links(ev, &child, spec, next).await?);
            }
        }
        Ok(results)
    }
    .boxed()
}
