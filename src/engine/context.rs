use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::browser::PageController;
use crate::config::EngineConfig;
use crate::engine::registry::ProcessorRegistry;
use crate::error::DrWebError;

/// Ordered set of canonicalized URLs visited along one branch.
#[derive(Debug, Clone, Default)]
pub struct VisitedSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.seen.contains(canonical)
    }

    /// Insert a canonical URL; returns false if it was already present.
    pub fn insert(&mut self, canonical: impl Into<String>) -> bool {
        let canonical = canonical.into();
        if self.seen.insert(canonical.clone()) {
            self.order.push(canonical);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Branch-scoped evaluation state. Extended immutably: each follow hop gets a
/// child scope with `depth + 1` and an extended visited set, so sibling
/// branches never observe each other's crawl.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Current follow recursion depth; the top-level page is 0.
    pub depth: u32,
    pub visited: VisitedSet,
    /// Path of step indices from the query root, for diagnostics.
    pub path: Vec<usize>,
    /// Host of the start page, used for external-link filtering.
    pub start_host: Option<String>,
}

impl Scope {
    /// Root scope for a top-level page.
    pub fn root(page_canonical: impl Into<String>, start_host: Option<String>) -> Self {
        let mut visited = VisitedSet::new();
        visited.insert(page_canonical);
        Self { depth: 0, visited, path: Vec::new(), start_host }
    }

    /// Child scope for a followed page.
    pub fn follow(&self, canonical: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.depth += 1;
        child.visited.insert(canonical);
        child
    }

    /// Same branch, one step deeper in the step tree.
    pub fn at_step(&self, index: usize) -> Self {
        let mut child = self.clone();
        child.path.push(index);
        child
    }
}

/// A per-step failure recorded alongside the results.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Path of step indices from the query root.
    pub step_path: Vec<usize>,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Mutable evaluation state shared down the step tree: the single page, the
/// frozen registry, configuration, cancellation, and the diagnostic log.
pub struct Evaluation<'a> {
    pub page: &'a mut dyn PageController,
    pub registry: Arc<ProcessorRegistry>,
    pub config: &'a EngineConfig,
    pub cancel: CancellationToken,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> Evaluation<'a> {
    pub fn new(
        page: &'a mut dyn PageController,
        registry: Arc<ProcessorRegistry>,
        config: &'a EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { page, registry, config, cancel, diagnostics: Vec::new() }
    }

    /// Record a soft failure for the step at `scope.path`.
    pub fn record_failure(&mut self, scope: &Scope, error: &DrWebError) {
        warn!(
            step_path = ?scope.path,
            kind = error.kind(),
            "step failed: {error}"
        );
        self.diagnostics.push(Diagnostic {
            step_path: scope.path.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn check_cancelled(&self) -> Result<(), DrWebError> {
        if self.cancel.is_cancelled() {
            Err(DrWebError::Cancelled)
        } else {
            Ok(())
        }
    }
}
