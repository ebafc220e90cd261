//! Playwright-backed [`PageController`].
//!
//! DOM access goes through `page.evaluate`: matched elements are parked in a
//! window-side registry (`window.__drwebNodes`) and node handles are indices
//! into it. The registry is reset on every navigation, which is what makes
//! stale handles detectable.

use anyhow::Result;
use async_trait::async_trait;
use playwright::Playwright;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::browser::{Interaction, NodeHandle, PageController, PageValue, WaitPredicate};
use crate::config::BrowserConfig;
use crate::error::{DrWebError, DrWebResult};
use crate::query::Locator;

pub struct PlaywrightController {
    playwright: Playwright,
    browser: playwright::api::Browser,
    _context: playwright::api::BrowserContext,
    page: playwright::api::Page,
    epoch: u64,
    closed: bool,
}

impl PlaywrightController {
    /// Launch a Chromium session and open a blank page.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        debug!("launching chromium (headless: {})", config.headless);

        let playwright = Playwright::initialize().await?;
        let browser = playwright
            .chromium()
            .launcher()
            .headless(config.headless)
            .launch()
            .await?;

        let mut context_builder = browser.context_builder().viewport(Some(
            playwright::api::Viewport {
                width: config.viewport_width as i32,
                height: config.viewport_height as i32,
            },
        ));
        if let Some(user_agent) = &config.user_agent {
            context_builder = context_builder.user_agent(user_agent);
        }
        let context = context_builder.build().await?;
        let page = context.new_page().await?;

        Ok(Self { playwright, browser, _context: context, page, epoch: 0, closed: false })
    }

    async fn eval(&self, script: &str) -> DrWebResult<Value> {
        self.page
            .evaluate::<(), Value>(script, ())
            .await
            .map_err(|e| DrWebError::script(e.to_string()))
    }

    fn check_epoch(&self, node: &NodeHandle) -> DrWebResult<()> {
        if node.epoch != self.epoch {
            return Err(DrWebError::fatal("stale node handle used across navigation"));
        }
        Ok(())
    }

    /// JS fragment resolving `expression` to an element array. XPath is
    /// anything starting with `/`, `(` or `.`; everything else is CSS.
    fn resolver_js(expression: &str, scope: Option<&NodeHandle>) -> String {
        let expr = serde_json::to_string(expression).unwrap_or_default();
        let root = match scope {
            Some(node) => format!("window.__drwebNodes[{}]", node.id),
            None => "document".to_string(),
        };
        format!(
            r#"
            const expr = {expr};
            const root = {root};
            const found = [];
            if (/^[\/(.]/.test(expr)) {{
                const snapshot = document.evaluate(
                    expr, root, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                for (let i = 0; i < snapshot.snapshotLength; i++) {{
                    found.push(snapshot.snapshotItem(i));
                }}
            }} else {{
                (root === document ? document : root)
                    .querySelectorAll(expr).forEach(el => found.push(el));
            }}
            "#
        )
    }

    fn locator_js(locator: &Locator) -> String {
        let expression = match locator {
            Locator::Css(css) => css.clone(),
            Locator::Xpath(xpath) => xpath.clone(),
        };
        Self::resolver_js(&expression, None)
    }
}

#[async_trait]
impl PageController for PlaywrightController {
    async fn open(&mut self, url: &str, timeout_ms: u64) -> DrWebResult<()> {
        debug!("navigating to {url}");
        self.page.set_default_timeout(timeout_ms as u32);
        self.page
            .goto_builder(url)
            .goto()
            .await
            .map_err(|e| DrWebError::navigation(url, e.to_string()))?;
        self.epoch += 1;
        self.eval("window.__drwebNodes = []; true")
            .await
            .map_err(|e| DrWebError::navigation(url, format!("registry reset failed: {e}")))?;
        Ok(())
    }

    async fn current_url(&self) -> DrWebResult<String> {
        let value = self.eval("window.location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| DrWebError::fatal("browser did not report a page URL"))
    }

    async fn query(
        &mut self,
        expression: &str,
        scope: Option<&NodeHandle>,
    ) -> DrWebResult<Vec<NodeHandle>> {
        if let Some(node) = scope {
            self.check_epoch(node)?;
        }
        let script = format!(
            r#"(() => {{
                window.__drwebNodes = window.__drwebNodes || [];
                try {{
                    {resolver}
                    const ids = [];
                    for (const el of found) {{
                        window.__drwebNodes.push(el);
                        ids.push(window.__drwebNodes.length - 1);
                    }}
                    return {{ ok: true, ids }};
                }} catch (e) {{
                    return {{ ok: false, error: String(e) }};
                }}
            }})()"#,
            resolver = Self::resolver_js(expression, scope),
        );
        let result = self.eval(&script).await?;
        if result["ok"].as_bool() != Some(true) {
            return Err(DrWebError::expression(
                expression,
                result["error"].as_str().unwrap_or("evaluation failed"),
            ));
        }
        let epoch = self.epoch;
        Ok(result["ids"]
            .as_array()
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_u64())
                    .map(|id| NodeHandle { epoch, id: id as usize })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_scalar(
        &self,
        expression: &str,
        scope: Option<&NodeHandle>,
    ) -> DrWebResult<PageValue> {
        if let Some(node) = scope {
            self.check_epoch(node)?;
        }
        let expr = serde_json::to_string(expression).unwrap_or_default();
        let root = match scope {
            Some(node) => format!("window.__drwebNodes[{}]", node.id),
            None => "document".to_string(),
        };
        let script = format!(
            r#"(() => {{
                try {{
                    const result = document.evaluate(
                        {expr}, {root}, null, XPathResult.ANY_TYPE, null);
                    switch (result.resultType) {{
                        case XPathResult.NUMBER_TYPE:
                            return {{ ok: true, kind: "number", value: result.numberValue }};
                        case XPathResult.STRING_TYPE:
                            return {{ ok: true, kind: "string", value: result.stringValue }};
                        case XPathResult.BOOLEAN_TYPE:
                            return {{ ok: true, kind: "boolean", value: result.booleanValue }};
                        default: {{
                            const node = result.iterateNext();
                            return {{ ok: true, kind: "string",
                                      value: node ? node.textContent : "" }};
                        }}
                    }}
                }} catch (e) {{
                    return {{ ok: false, error: String(e) }};
                }}
            }})()"#
        );
        let result = self.eval(&script).await?;
        if result["ok"].as_bool() != Some(true) {
            return Err(DrWebError::expression(
                expression,
                result["error"].as_str().unwrap_or("evaluation failed"),
            ));
        }
        Ok(match result["kind"].as_str() {
            Some("number") => PageValue::Number(result["value"].as_f64().unwrap_or(0.0)),
            Some("boolean") => PageValue::Bool(result["value"].as_bool().unwrap_or(false)),
            Some("string") => {
                PageValue::String(result["value"].as_str().unwrap_or_default().to_string())
            }
            _ => PageValue::Null,
        })
    }

    async fn text_content(&self, node: &NodeHandle) -> DrWebResult<String> {
        self.check_epoch(node)?;
        let value = self
            .eval(&format!(
                "(window.__drwebNodes[{}] || {{}}).textContent || ''",
                node.id
            ))
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute(&self, node: &NodeHandle, name: &str) -> DrWebResult<Option<String>> {
        self.check_epoch(node)?;
        let attr = serde_json::to_string(name).unwrap_or_default();
        let value = self
            .eval(&format!(
                "(() => {{ const el = window.__drwebNodes[{}]; \
                 return el ? el.getAttribute({attr}) : null; }})()",
                node.id
            ))
            .await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn interact(&mut self, interaction: &Interaction) -> DrWebResult<()> {
        let script = match interaction {
            Interaction::Click(locator) => format!(
                r#"(() => {{
                    {resolver}
                    const el = found[0];
                    if (!el) return "missing";
                    if (el.disabled || el.offsetParent === null) return "inert";
                    el.click();
                    return "ok";
                }})()"#,
                resolver = Self::locator_js(locator),
            ),
            Interaction::Hover(locator) => format!(
                r#"(() => {{
                    {resolver}
                    const el = found[0];
                    if (!el) return "missing";
                    el.dispatchEvent(new MouseEvent('mouseover', {{ bubbles: true }}));
                    return "ok";
                }})()"#,
                resolver = Self::locator_js(locator),
            ),
            Interaction::Fill { locator, value } => format!(
                r#"(() => {{
                    {resolver}
                    const el = found[0];
                    if (!el) return "missing";
                    if (!('value' in el) || el.disabled || el.readOnly) return "inert";
                    el.focus();
                    el.value = {value};
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return "ok";
                }})()"#,
                resolver = Self::locator_js(locator),
                value = serde_json::to_string(value).unwrap_or_default(),
            ),
            Interaction::ScrollBy { dx, dy } => {
                format!("(() => {{ window.scrollBy({dx}, {dy}); return 'ok'; }})()")
            }
            Interaction::ScrollIntoView(locator) => format!(
                r#"(() => {{
                    {resolver}
                    const el = found[0];
                    if (!el) return "missing";
                    el.scrollIntoView();
                    return "ok";
                }})()"#,
                resolver = Self::locator_js(locator),
            ),
        };

        let locator_str = match interaction {
            Interaction::Click(l)
            | Interaction::Hover(l)
            | Interaction::Fill { locator: l, .. }
            | Interaction::ScrollIntoView(l) => l.as_str().to_string(),
            Interaction::ScrollBy { .. } => String::new(),
        };

        match self.eval(&script).await?.as_str() {
            Some("ok") => Ok(()),
            Some("missing") => Err(DrWebError::TargetNotFound { locator: locator_str }),
            Some("inert") => Err(DrWebError::TargetNotInteractable { locator: locator_str }),
            other => Err(DrWebError::script(format!(
                "interaction returned unexpected result: {other:?}"
            ))),
        }
    }

    async fn wait(&mut self, predicate: &WaitPredicate, timeout_ms: u64) -> DrWebResult<()> {
        match predicate {
            // approximated by readiness plus a settle delay; the engine
            // polls all other predicates itself
            WaitPredicate::NetworkIdle => {
                let deadline = Duration::from_millis(timeout_ms);
                let start = std::time::Instant::now();
                loop {
                    let ready = self.eval("document.readyState === 'complete'").await?;
                    if ready.as_bool() == Some(true) {
                        tokio::time::sleep(Duration::from_millis(500).min(deadline)).await;
                        return Ok(());
                    }
                    if start.elapsed() >= deadline {
                        return Err(DrWebError::ActionTimeout { waited_ms: timeout_ms });
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            WaitPredicate::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            other => {
                warn!("driver-level wait called for {other:?}; treating as no-op");
                Ok(())
            }
        }
    }

    async fn run_script(&mut self, code: &str) -> DrWebResult<Value> {
        self.page
            .evaluate::<(), Value>(code, ())
            .await
            .map_err(|e| DrWebError::script(e.to_string()))
    }

    async fn close(&mut self) -> DrWebResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Err(e) = self.browser.close().await {
            warn!("failed to close browser: {e}");
        }
        // keep the playwright driver alive until the browser is down
        let _ = &self.playwright;
        Ok(())
    }
}
