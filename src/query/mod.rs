use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

pub mod parser;
pub mod validator;

pub use self::parser::QueryParser;
pub use self::validator::QueryValidator;

/// Default follow recursion bound along a single branch.
pub const DEFAULT_MAX_DEPTH: u32 = 3;

/// Default per-action timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// A location-language expression (XPath canonical, CSS accepted).
///
/// Expressions starting with `./` or `.//` are relative to an anchor node;
/// anything else is evaluated against the document root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Expr(pub String);

impl Expr {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_relative(&self) -> bool {
        self.0.starts_with("./") || self.0.starts_with(".//") || self.0 == "."
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An element locator. Actions and conditions accept either form; the engine
/// treats them as interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Locator {
    Css(String),
    Xpath(String),
}

impl Locator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Css(s) | Self::Xpath(s) => s,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed extraction query. Immutable after parse; evaluation never
/// mutates it.
#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub start_url: String,
    pub steps: Vec<Step>,
    pub pagination: Option<PaginationSpec>,
    pub pre_actions: Vec<Action>,
}

/// Pagination over the top-level step list.
#[derive(Debug, Clone, Serialize)]
pub struct PaginationSpec {
    pub link_expr: Expr,
    pub limit: u32,
}

/// One element of the evaluator's program.
#[derive(Debug, Clone, Serialize)]
pub enum Step {
    Extract(ExtractStep),
    Conditional(ConditionalStep),
    Follow(FollowSpec),
    Script(ScriptStep),
    /// A step kind contributed by a plugin processor. The core only routes it
    /// through the registry.
    Extension(ExtensionStep),
}

impl Step {
    /// Stable kind tag used by the registry for dispatch.
    pub fn kind(&self) -> &str {
        match self {
            Self::Extract(_) => "extract",
            Self::Conditional(_) => "conditional",
            Self::Follow(_) => "follow",
            Self::Script(_) => "script",
            Self::Extension(ext) => &ext.kind,
        }
    }
}

/// Anchor-based field extraction.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractStep {
    /// Anchor expression; each match produces one record.
    pub xpath: Expr,
    /// Label for this step's contribution in the output document.
    pub name: Option<String>,
    /// Field name to relative expression, evaluated against each anchor.
    pub fields: BTreeMap<String, Expr>,
    /// Actions run on the page before the anchor expression is evaluated.
    pub actions: Vec<Action>,
    /// Inline link-following applied per extracted anchor.
    pub follow: Option<FollowSpec>,
    /// When set, fields with no match extract as `null` instead of `""`.
    pub strict: bool,
}

/// Branching on a page predicate.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionalStep {
    pub condition: Condition,
    pub then_steps: Vec<Step>,
    pub else_steps: Vec<Step>,
}

/// Recursive link-following with depth and cycle bounds.
#[derive(Debug, Clone, Serialize)]
pub struct FollowSpec {
    /// Expression yielding link URLs (raw hrefs, possibly relative).
    pub link_expr: Expr,
    /// Steps evaluated on each followed page.
    pub steps: Vec<Step>,
    /// Label for inline-follow children attached to a parent record.
    pub name: Option<String>,
    /// Absolute recursion cap along any single branch.
    pub max_depth: u32,
    /// Skip URLs already visited on the current branch.
    pub detect_cycles: bool,
    /// Follow links whose host differs from the start page's host.
    pub follow_external: bool,
    /// Attach `_source_url` to each child record.
    pub tag_source: bool,
}

impl FollowSpec {
    pub fn new(link_expr: Expr, steps: Vec<Step>) -> Self {
        Self {
            link_expr,
            steps,
            name: None,
            max_depth: DEFAULT_MAX_DEPTH,
            detect_cycles: true,
            follow_external: false,
            tag_source: false,
        }
    }
}

/// Opaque script executed in page context.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptStep {
    pub code: String,
    pub name: Option<String>,
    /// Predicate polled until truthy before the script result is taken.
    pub wait_for: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Parse the returned value as structured data.
    pub return_json: bool,
}

/// A plugin-contributed step: a kind tag plus an opaque payload the owning
/// processor knows how to interpret.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStep {
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Boolean predicate over the current page.
#[derive(Debug, Clone, Serialize)]
pub enum Condition {
    Exists(Locator),
    NotExists(Locator),
    Contains { text: String, locator: Option<Locator> },
    CountEq { locator: Option<Locator>, count: u64 },
    CountMin { locator: Option<Locator>, count: u64 },
    CountMax { locator: Option<Locator>, count: u64 },
}

/// A browser mutation executed before extraction in the current scope.
#[derive(Debug, Clone, Serialize)]
pub enum Action {
    Click {
        locator: Locator,
        timeout_ms: Option<u64>,
    },
    Scroll {
        direction: ScrollDirection,
        pixels: Option<i64>,
        locator: Option<Locator>,
    },
    Fill {
        locator: Locator,
        value: String,
        timeout_ms: Option<u64>,
    },
    Hover {
        locator: Locator,
        timeout_ms: Option<u64>,
    },
    Wait {
        until: WaitUntil,
        locator: Option<Locator>,
        text: Option<String>,
        timeout_ms: Option<u64>,
    },
    Script {
        code: String,
        wait_for: Option<String>,
        timeout_ms: Option<u64>,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Scroll { .. } => "scroll",
            Self::Fill { .. } => "fill",
            Self::Hover { .. } => "hover",
            Self::Wait { .. } => "wait",
            Self::Script { .. } => "script",
        }
    }

    /// Effective timeout for this action.
    pub fn timeout_ms(&self) -> u64 {
        let explicit = match self {
            Self::Click { timeout_ms, .. }
            | Self::Fill { timeout_ms, .. }
            | Self::Hover { timeout_ms, .. }
            | Self::Wait { timeout_ms, .. }
            | Self::Script { timeout_ms, .. } => *timeout_ms,
            Self::Scroll { .. } => None,
        };
        explicit.unwrap_or(DEFAULT_TIMEOUT_MS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitUntil {
    Element,
    NoElement,
    Text,
    NetworkIdle,
    Timeout,
}
