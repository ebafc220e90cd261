//! Evaluator core: owns the session for the duration of a query, drives the
//! dispatch loop and pagination, and assembles the record tree.

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

pub mod actions;
pub mod conditions;
pub mod context;
pub mod extractor;
pub mod processors;
pub mod registry;
pub mod selector;

pub use self::context::{Diagnostic, Evaluation, Scope, VisitedSet};
pub use self::registry::ProcessorRegistry;

use crate::browser::PageController;
use crate::config::EngineConfig;
use crate::engine::actions::ActionRunner;
use crate::engine::processors::dispatch_step;
use crate::error::DrWebError;
use crate::query::{Query, QueryValidator, Step};

/// Terminal state of one query evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvalStatus {
    Completed,
    Cancelled,
    Aborted,
}

/// Description of the failure that aborted a query.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub kind: String,
    /// Path of step indices from the query root, best effort.
    pub step_path: Vec<usize>,
    pub message: String,
}

/// Everything a query evaluation produces: the record tree, per-step
/// diagnostics, and the terminal status. No error escapes the evaluator
/// surface; aborts carry the records accumulated so far.
#[derive(Debug, Serialize)]
pub struct QueryOutcome {
    pub records: Value,
    pub diagnostics: Vec<Diagnostic>,
    pub status: EvalStatus,
    pub error: Option<ErrorRecord>,
}

impl QueryOutcome {
    pub fn is_success(&self) -> bool {
        self.status == EvalStatus::Completed
    }
}

/// Accumulates top-level step contributions and shapes the output document:
/// a flat list when nothing is named, a mapping when everything is, and a
/// mapping with a `records` entry for the unnamed remainder otherwise.
#[derive(Default)]
struct OutputBuilder {
    named: Vec<(String, Vec<Value>)>,
    unnamed: Vec<Value>,
}

impl OutputBuilder {
    fn add(&mut self, label: Option<&str>, values: Vec<Value>) {
        match label {
            Some(name) => match self.named.iter_mut().find(|(n, _)| n == name) {
                Some((_, bucket)) => bucket.extend(values),
                None => self.named.push((name.to_string(), values)),
            },
            None => self.unnamed.extend(values),
        }
    }

    fn finish(self) -> Value {
        if self.named.is_empty() {
            return Value::Array(self.unnamed);
        }
        let mut map = serde_json::Map::new();
        for (name, values) in self.named {
            map.insert(name, Value::Array(values));
        }
        if !self.unnamed.is_empty() {
            map.insert("records".to_string(), Value::Array(self.unnamed));
        }
        Value::Object(map)
    }
}

fn step_label(step: &Step) -> Option<&str> {
    match step {
        Step::Extract(extract) => extract.name.as_deref(),
        Step::Follow(follow) => follow.name.as_deref(),
        Step::Script(script) => script.name.as_deref(),
        Step::Conditional(_) | Step::Extension(_) => None,
    }
}

/// The evaluator. Holds a frozen processor registry and configuration; each
/// call to [`Engine::execute`] drives one query against one session.
pub struct Engine {
    registry: Arc<ProcessorRegistry>,
    config: EngineConfig,
}

impl Engine {
    /// Engine with the core processor set.
    pub fn new(config: EngineConfig) -> Self {
        Self { registry: Arc::new(ProcessorRegistry::with_core_processors()), config }
    }

    /// Engine with a caller-assembled registry (plugins registered before
    /// evaluation; the registry is frozen from here on).
    pub fn with_registry(config: EngineConfig, registry: ProcessorRegistry) -> Self {
        Self { registry: Arc::new(registry), config }
    }

    pub async fn execute(&self, query: &Query, page: &mut dyn PageController) -> QueryOutcome {
        self.execute_with_cancel(query, page, CancellationToken::new()).await
    }

    /// Evaluate a query. The session behind `page` is released on every exit
    /// path: completion, abort, cancellation, and panic.
    pub async fn execute_with_cancel(
        &self,
        query: &Query,
        page: &mut dyn PageController,
        cancel: CancellationToken,
    ) -> QueryOutcome {
        if let Err(e) = QueryValidator::new().validate(query) {
            let _ = page.close().await;
            return QueryOutcome {
                records: Value::Array(Vec::new()),
                diagnostics: Vec::new(),
                status: EvalStatus::Aborted,
                error: Some(ErrorRecord {
                    kind: e.kind().to_string(),
                    step_path: Vec::new(),
                    message: e.to_string(),
                }),
            };
        }

        let budget_guard = self.config.budget_ms.map(|ms| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                warn!("wall-clock budget of {ms}ms exhausted; cancelling evaluation");
                token.cancel();
            })
        });

        let run = AssertUnwindSafe(self.run_query(query, &mut *page, cancel)).catch_unwind().await;

        if let Some(guard) = budget_guard {
            guard.abort();
        }
        if let Err(e) = page.close().await {
            error!("failed to release browser session: {e}");
        }

        match run {
            Ok((output, diagnostics, result)) => {
                let records = output.finish();
                match result {
                    Ok(()) => QueryOutcome {
                        records,
                        diagnostics,
                        status: EvalStatus::Completed,
                        error: None,
                    },
                    Err(DrWebError::Cancelled) => {
                        info!("evaluation cancelled; returning partial records");
                        QueryOutcome {
                            records,
                            diagnostics,
                            status: EvalStatus::Cancelled,
                            error: None,
                        }
                    }
                    Err(e) => {
                        let step_path = diagnostics
                            .last()
                            .filter(|d| d.kind == e.kind())
                            .map(|d| d.step_path.clone())
                            .unwrap_or_default();
                        QueryOutcome {
                            records,
                            diagnostics,
                            status: EvalStatus::Aborted,
                            error: Some(ErrorRecord {
                                kind: e.kind().to_string(),
                                step_path,
                                message: e.to_string(),
                            }),
                        }
                    }
                }
            }
            Err(_panic) => QueryOutcome {
                records: Value::Array(Vec::new()),
                diagnostics: Vec::new(),
                status: EvalStatus::Aborted,
                error: Some(ErrorRecord {
                    kind: "FatalError".to_string(),
                    step_path: Vec::new(),
                    message: "internal panic during evaluation".to_string(),
                }),
            },
        }
    }

    async fn run_query(
        &self,
        query: &Query,
        page: &mut dyn PageController,
        cancel: CancellationToken,
    ) -> (OutputBuilder, Vec<Diagnostic>, Result<(), DrWebError>) {
        let mut output = OutputBuilder::default();
        let mut ev = Evaluation::new(page, self.registry.clone(), &self.config, cancel);
        let result = self.drive(&mut ev, &mut output, query).await;
        (output, ev.diagnostics, result)
    }

    /// Open the start page, run pre-actions, then the step list, then
    /// paginate. Each paginated page gets a fresh root scope; the records
    /// accumulator carries across pages.
    async fn drive(
        &self,
        ev: &mut Evaluation<'_>,
        output: &mut OutputBuilder,
        query: &Query,
    ) -> Result<(), DrWebError> {
        ev.check_cancelled()?;
        info!("opening start page {}", query.start_url);
        ev.page.open(&query.start_url, self.config.navigation_timeout_ms).await?;

        let start_url = Url::parse(&query.start_url)
            .map_err(|e| DrWebError::fatal(format!("validated start URL failed to parse: {e}")))?;
        let start_host = start_url.host_str().map(str::to_string);

        if !query.pre_actions.is_empty() {
            let runner = ActionRunner::new(ev.cancel.clone(), self.config.poll_interval_ms);
            if let Err(e) = runner.run(ev.page, &query.pre_actions).await {
                match e {
                    DrWebError::Cancelled => return Err(DrWebError::Cancelled),
                    e if e.is_fatal() => return Err(e),
                    e => {
                        let scope = Scope::root(selector::canonicalize(&start_url), None);
                        ev.record_failure(&scope, &e);
                        if self.config.strict {
                            return Err(e);
                        }
                    }
                }
            }
        }

        let mut pages_done: u32 = 0;
        loop {
            ev.check_cancelled()?;

            let current = ev.page.current_url().await?;
            let current_url = Url::parse(&current)
                .map_err(|e| DrWebError::fatal(format!("session reported invalid URL: {e}")))?;
            let scope = Scope::root(selector::canonicalize(&current_url), start_host.clone());

            for (index, step) in query.steps.iter().enumerate() {
                let step_scope = scope.at_step(index);
                match dispatch_step(ev, &step_scope, step).await {
                    Ok(values) => output.add(step_label(step), values),
                    Err(DrWebError::Cancelled) => return Err(DrWebError::Cancelled),
                    Err(e) if e.is_fatal() => {
                        ev.record_failure(&step_scope, &e);
                        return Err(e);
                    }
                    Err(e) => {
                        ev.record_failure(&step_scope, &e);
                        if self.config.strict {
                            return Err(e);
                        }
                    }
                }
            }

            pages_done += 1;
            let Some(pagination) = &query.pagination else { break };
            if pages_done >= pagination.limit {
                info!("pagination limit of {} pages reached", pagination.limit);
                break;
            }

            let next = match selector::resolve_links(ev.page, &pagination.link_expr, None, &current_url)
                .await
            {
                Ok(links) => links.into_iter().next(),
                Err(e) => {
                    ev.record_failure(&scope, &e);
                    None
                }
            };
            let Some(next) = next else {
                info!("no next-page link after page {pages_done}; pagination complete");
                break;
            };

            info!("paginating to {next}");
            if let Err(e) = ev.page.open(&next, self.config.navigation_timeout_ms).await {
                warn!("pagination navigation failed, finalizing: {e}");
                ev.record_failure(&scope, &e);
                break;
            }
        }

        Ok(())
    }
}
