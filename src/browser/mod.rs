//! Page-automation capability consumed by the evaluator.
//!
//! The engine holds exactly one [`PageController`] per query and releases it
//! on every exit path. Any driver providing these operations suffices; the
//! crate ships a Playwright-backed controller (feature `browser`) and a
//! deterministic scripted controller for tests and offline runs.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DrWebResult;
use crate::query::Locator;

pub mod mock;

#[cfg(feature = "browser")]
pub mod playwright;

/// Opaque handle to a DOM node on the currently loaded page.
///
/// Handles are invalidated by navigation; using a stale handle is a driver
/// error, not a recoverable condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    /// Monotonic page generation, bumped on every navigation.
    pub epoch: u64,
    /// Driver-assigned node index within the generation.
    pub id: usize,
}

/// A scalar produced by expression evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PageValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl PageValue {
    pub fn into_json(self) -> Value {
        match self {
            Self::String(s) => Value::String(s),
            Self::Number(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Bool(b) => Value::Bool(b),
            Self::Null => Value::Null,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A single browser interaction dispatched by the action pipeline.
#[derive(Debug, Clone)]
pub enum Interaction {
    Click(Locator),
    Hover(Locator),
    Fill { locator: Locator, value: String },
    ScrollBy { dx: i64, dy: i64 },
    ScrollIntoView(Locator),
}

/// Predicates the driver can wait on natively. The action pipeline polls
/// element and text predicates itself; `NetworkIdle` is delegated here
/// because it cannot be probed through the query interface.
#[derive(Debug, Clone)]
pub enum WaitPredicate {
    ElementPresent(Locator),
    ElementAbsent(Locator),
    TextPresent { locator: Option<Locator>, text: String },
    NetworkIdle,
    Delay(u64),
}

/// The page-automation capability.
///
/// `query` accepts both XPath and CSS expressions; drivers sniff the form.
/// A clean evaluation that matches nothing returns an empty list; a
/// malformed expression fails with `ExpressionSyntaxError`.
#[async_trait]
pub trait PageController: Send + Sync {
    /// Navigate the page. Fails with `NavigationError` on network failure or
    /// a terminal HTTP status (4xx/5xx).
    async fn open(&mut self, url: &str, timeout_ms: u64) -> DrWebResult<()>;

    async fn current_url(&self) -> DrWebResult<String>;

    /// Evaluate a node-yielding expression. `scope` restricts evaluation to
    /// an anchor node; `None` means the document root.
    async fn query(
        &mut self,
        expression: &str,
        scope: Option<&NodeHandle>,
    ) -> DrWebResult<Vec<NodeHandle>>;

    /// Evaluate a scalar-yielding expression (string/number/boolean forms).
    async fn query_scalar(
        &self,
        expression: &str,
        scope: Option<&NodeHandle>,
    ) -> DrWebResult<PageValue>;

    /// Concatenated immediate text content of a node.
    async fn text_content(&self, node: &NodeHandle) -> DrWebResult<String>;

    /// Attribute value, or `None` when absent.
    async fn attribute(&self, node: &NodeHandle, name: &str) -> DrWebResult<Option<String>>;

    /// Dispatch an interaction. Fails with `TargetNotFound` when nothing
    /// matches and `TargetNotInteractable` when the match cannot receive the
    /// interaction.
    async fn interact(&mut self, interaction: &Interaction) -> DrWebResult<()>;

    /// Block until the predicate holds or the timeout elapses.
    async fn wait(&mut self, predicate: &WaitPredicate, timeout_ms: u64) -> DrWebResult<()>;

    /// Execute script in page context and return its value.
    async fn run_script(&mut self, code: &str) -> DrWebResult<Value>;

    /// Release the underlying session. Idempotent.
    async fn close(&mut self) -> DrWebResult<()>;
}
