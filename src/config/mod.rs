use serde::{Deserialize, Serialize};

use crate::engine::actions::DEFAULT_POLL_INTERVAL_MS;

/// Evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Abort the query on the first step error instead of soft-failing.
    pub strict: bool,
    /// Per-navigation timeout.
    pub navigation_timeout_ms: u64,
    /// Upper bound on the polling cadence of waits.
    pub poll_interval_ms: u64,
    /// Overall wall-clock budget; `None` means no limit.
    pub budget_ms: Option<u64>,
    pub browser: BrowserConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strict: false,
            navigation_timeout_ms: 30_000,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            budget_ms: None,
            browser: BrowserConfig::default(),
        }
    }
}

/// Driver parameters handed to the browser-backed controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, viewport_width: 1920, viewport_height: 1080, user_agent: None }
    }
}

impl BrowserConfig {
    /// Default configuration with the `HEADLESS` environment toggle applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("HEADLESS") {
            config.headless = !matches!(value.as_str(), "0" | "false" | "no");
        }
        config
    }
}
