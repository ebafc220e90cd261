//! Action pipeline: executes an ordered list of browser actions before any
//! extraction in the current scope.
//!
//! Waits are polling loops with a bounded cadence and an explicit
//! cancellation check at every tick; nothing here blocks without a timeout.

use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::browser::{Interaction, PageController, WaitPredicate};
use crate::error::{DrWebError, DrWebResult};
use crate::query::{Action, Locator, ScrollDirection, WaitUntil};

/// Probe cadence upper bound for polling waits.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

enum Probe<'a> {
    Present(&'a Locator),
    Absent(&'a Locator),
    Text { locator: Option<&'a Locator>, text: &'a str },
    ScriptTruthy(&'a str),
    Delay,
}

/// Executes actions strictly in order against the single live page.
pub struct ActionRunner {
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ActionRunner {
    pub fn new(cancel: CancellationToken, poll_interval_ms: u64) -> Self {
        Self { cancel, poll_interval: Duration::from_millis(poll_interval_ms.max(1)) }
    }

    /// Run the whole pipeline. The i-th action begins only after the
    /// (i-1)-th completed; the first failure stops the pipeline.
    pub async fn run(
        &self,
        page: &mut dyn PageController,
        actions: &[Action],
    ) -> DrWebResult<()> {
        for (index, action) in actions.iter().enumerate() {
            debug!("running action {}/{}: {}", index + 1, actions.len(), action.kind());
            self.run_one(page, action).await?;
        }
        Ok(())
    }

    async fn run_one(&self, page: &mut dyn PageController, action: &Action) -> DrWebResult<()> {
        let timeout_ms = action.timeout_ms();
        match action {
            Action::Click { locator, .. } => {
                self.await_target(page, locator, timeout_ms).await?;
                page.interact(&Interaction::Click(locator.clone())).await
            }
            Action::Hover { locator, .. } => {
                self.await_target(page, locator, timeout_ms).await?;
                page.interact(&Interaction::Hover(locator.clone())).await
            }
            Action::Fill { locator, value, .. } => {
                self.await_target(page, locator, timeout_ms).await?;
                page.interact(&Interaction::Fill { locator: locator.clone(), value: value.clone() })
                    .await
            }
            Action::Scroll { direction, pixels, locator } => {
                self.scroll(page, *direction, *pixels, locator.as_ref()).await
            }
            Action::Wait { until, locator, text, .. } => {
                self.wait(page, *until, locator.as_ref(), text.as_deref(), timeout_ms).await
            }
            Action::Script { code, wait_for, .. } => {
                if let Some(predicate) = wait_for {
                    self.wait_until(page, Probe::ScriptTruthy(predicate), timeout_ms).await?;
                }
                page.run_script(code).await?;
                Ok(())
            }
        }
    }

    /// Poll a script predicate until it evaluates truthy. Used by script
    /// steps and shared with their `wait_for` semantics.
    pub async fn wait_for_script(
        &self,
        page: &mut dyn PageController,
        predicate: &str,
        timeout_ms: u64,
    ) -> DrWebResult<()> {
        self.wait_until(page, Probe::ScriptTruthy(predicate), timeout_ms).await
    }

    /// Poll for the locator before an interaction; absence within the
    /// timeout is `TargetNotFound`.
    async fn await_target(
        &self,
        page: &mut dyn PageController,
        locator: &Locator,
        timeout_ms: u64,
    ) -> DrWebResult<()> {
        match self.wait_until(page, Probe::Present(locator), timeout_ms).await {
            Err(DrWebError::ActionTimeout { .. }) => {
                Err(DrWebError::TargetNotFound { locator: locator.as_str().to_string() })
            }
            other => other,
        }
    }

    /// Scroll degrades to a logged no-op when it has nothing to work with.
    async fn scroll(
        &self,
        page: &mut dyn PageController,
        direction: ScrollDirection,
        pixels: Option<i64>,
        locator: Option<&Locator>,
    ) -> DrWebResult<()> {
        if let Some(locator) = locator {
            return match page.interact(&Interaction::ScrollIntoView(locator.clone())).await {
                Err(DrWebError::TargetNotFound { locator }) => {
                    warn!("scroll target `{locator}` not found; skipping scroll");
                    Ok(())
                }
                other => other,
            };
        }
        if let Some(pixels) = pixels {
            let (dx, dy) = match direction {
                ScrollDirection::Down => (0, pixels),
                ScrollDirection::Up => (0, -pixels),
                ScrollDirection::Right => (pixels, 0),
                ScrollDirection::Left => (-pixels, 0),
            };
            return page.interact(&Interaction::ScrollBy { dx, dy }).await;
        }
        warn!("scroll action has neither target nor pixels; skipping");
        Ok(())
    }

    async fn wait(
        &self,
        page: &mut dyn PageController,
        until: WaitUntil,
        locator: Option<&Locator>,
        text: Option<&str>,
        timeout_ms: u64,
    ) -> DrWebResult<()> {
        match until {
            WaitUntil::Element => {
                let locator = locator.ok_or_else(|| DrWebError::MissingAttribute {
                    action: "wait".to_string(),
                    attribute: "@selector or @xpath".to_string(),
                })?;
                self.wait_until(page, Probe::Present(locator), timeout_ms).await
            }
            WaitUntil::NoElement => {
                let locator = locator.ok_or_else(|| DrWebError::MissingAttribute {
                    action: "wait".to_string(),
                    attribute: "@selector or @xpath".to_string(),
                })?;
                self.wait_until(page, Probe::Absent(locator), timeout_ms).await
            }
            WaitUntil::Text => {
                let text = text.ok_or_else(|| DrWebError::MissingAttribute {
                    action: "wait".to_string(),
                    attribute: "@text".to_string(),
                })?;
                self.wait_until(page, Probe::Text { locator, text }, timeout_ms).await
            }
            WaitUntil::NetworkIdle => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(DrWebError::Cancelled),
                    result = page.wait(&WaitPredicate::NetworkIdle, timeout_ms) => result,
                }
            }
            WaitUntil::Timeout => self.wait_until(page, Probe::Delay, timeout_ms).await,
        }
    }

    async fn wait_until(
        &self,
        page: &mut dyn PageController,
        probe: Probe<'_>,
        timeout_ms: u64,
    ) -> DrWebResult<()> {
        let timeout = Duration::from_millis(timeout_ms);
        let start = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(DrWebError::Cancelled);
            }
            if self.probe_once(page, &probe).await? {
                return Ok(());
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                // a plain delay simply completes; predicates time out
                return match probe {
                    Probe::Delay => Ok(()),
                    _ => Err(DrWebError::ActionTimeout { waited_ms: timeout_ms }),
                };
            }
            tokio::time::sleep((timeout - elapsed).min(self.poll_interval)).await;
        }
    }

    async fn probe_once(
        &self,
        page: &mut dyn PageController,
        probe: &Probe<'_>,
    ) -> DrWebResult<bool> {
        match probe {
            Probe::Present(locator) => {
                Ok(!page.query(locator.as_str(), None).await?.is_empty())
            }
            Probe::Absent(locator) => Ok(page.query(locator.as_str(), None).await?.is_empty()),
            Probe::Text { locator: Some(locator), text } => {
                let nodes = page.query(locator.as_str(), None).await?;
                match nodes.first() {
                    Some(node) => Ok(page.text_content(node).await?.contains(*text)),
                    None => Ok(false),
                }
            }
            Probe::Text { locator: None, text } => {
                let value = page.query_scalar("string(/)", None).await?;
                Ok(value.as_str().map(|s| s.contains(*text)).unwrap_or(false))
            }
            Probe::ScriptTruthy(code) => Ok(truthy(&page.run_script(code).await?)),
            Probe::Delay => Ok(false),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockController, MockNode, PageFixture};

    fn runner() -> ActionRunner {
        ActionRunner::new(CancellationToken::new(), 5)
    }

    async fn open(mock: &mut MockController, url: &str) {
        mock.open(url, 1000).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_identity() {
        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;
        runner().run(&mut mock, &[]).await.unwrap();
        assert!(mock.interactions.is_empty());
    }

    #[tokio::test]
    async fn test_click_missing_target_is_not_found() {
        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;

        let action = Action::Click {
            locator: Locator::Css("#missing".to_string()),
            timeout_ms: Some(20),
        };
        match runner().run(&mut mock, &[action]).await {
            Err(DrWebError::TargetNotFound { locator }) => assert_eq!(locator, "#missing"),
            other => panic!("expected TargetNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_click_inert_target() {
        let fixture = PageFixture::new()
            .nodes("#btn", vec![MockNode::default()])
            .inert("#btn");
        let mut mock = MockController::new().with_page("https://a.example/", fixture);
        open(&mut mock, "https://a.example/").await;

        let action =
            Action::Click { locator: Locator::Css("#btn".to_string()), timeout_ms: Some(20) };
        assert!(matches!(
            runner().run(&mut mock, &[action]).await,
            Err(DrWebError::TargetNotInteractable { .. })
        ));
    }

    #[tokio::test]
    async fn test_zero_timeout_wait_returns_immediately() {
        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;

        let action = Action::Wait {
            until: WaitUntil::Timeout,
            locator: None,
            text: None,
            timeout_ms: Some(0),
        };
        runner().run(&mut mock, &[action]).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_element_times_out() {
        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;

        let action = Action::Wait {
            until: WaitUntil::Element,
            locator: Some(Locator::Css(".never".to_string())),
            text: None,
            timeout_ms: Some(15),
        };
        assert!(matches!(
            runner().run(&mut mock, &[action]).await,
            Err(DrWebError::ActionTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_script_wait_for_polls_until_truthy() {
        let mut mock = MockController::new()
            .with_page("https://a.example/", PageFixture::new())
            .with_script(
                "window.ready",
                vec![Value::Bool(false), Value::Bool(false), Value::Bool(true)],
            )
            .with_script("collect()", vec![Value::String("done".to_string())]);
        open(&mut mock, "https://a.example/").await;

        let action = Action::Script {
            code: "collect()".to_string(),
            wait_for: Some("window.ready".to_string()),
            timeout_ms: Some(1000),
        };
        runner().run(&mut mock, &[action]).await.unwrap();
    }

    #[tokio::test]
    async fn test_scroll_without_target_degrades_to_noop() {
        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;

        let action = Action::Scroll {
            direction: ScrollDirection::Down,
            pixels: None,
            locator: Some(Locator::Css("#gone".to_string())),
        };
        runner().run(&mut mock, &[action]).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let runner = ActionRunner::new(cancel.clone(), 5);
        cancel.cancel();

        let mut mock = MockController::new().with_page("https://a.example/", PageFixture::new());
        open(&mut mock, "https://a.example/").await;

        let action = Action::Wait {
            until: WaitUntil::Element,
            locator: Some(Locator::Css(".never".to_string())),
            text: None,
            timeout_ms: Some(10_000),
        };
        assert!(matches!(
            runner.run(&mut mock, &[action]).await,
            Err(DrWebError::Cancelled)
        ));
    }
}
