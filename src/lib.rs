//! drweb - a declarative web-data-retrieval engine
//!
//! Users describe what to extract from a web page as a structured query
//! document; the engine drives a real browser to navigate, interact with,
//! and extract structured records from the page(s). This library provides:
//! - The typed query model and its two surface dialects (JSON5, YAML)
//! - A recursive evaluator with a pluggable step processor registry
//! - Recursive link-following with cycle detection and depth bounds
//! - An action pipeline mutating browser state before extraction
//! - A capability-level page controller interface with Playwright and
//!   deterministic mock backends

pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod query;

// Re-export main types for convenience
pub use crate::browser::PageController;
pub use crate::config::{BrowserConfig, EngineConfig};
pub use crate::engine::{Engine, EvalStatus, ProcessorRegistry, QueryOutcome};
pub use crate::error::{DrWebError, DrWebResult};
pub use crate::query::{Query, QueryParser, QueryValidator};
