//! Deterministic in-memory [`PageController`] for tests and offline runs.
//!
//! Pages are scripted fixtures: expression strings map to canned node sets
//! and scalars, so evaluation order and navigation can be asserted without a
//! browser. Interactions are recorded; a click may swap the active fixture to
//! model pages that reveal content on interaction.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::browser::{Interaction, NodeHandle, PageController, PageValue, WaitPredicate};
use crate::error::{DrWebError, DrWebResult};

/// A scripted DOM node.
#[derive(Debug, Clone, Default)]
pub struct MockNode {
    pub text: String,
    pub attrs: HashMap<String, String>,
    pub children: HashMap<String, Vec<MockNode>>,
}

impl MockNode {
    pub fn with_text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Register child nodes under a relative expression.
    pub fn child(mut self, expression: impl Into<String>, nodes: Vec<MockNode>) -> Self {
        self.children.insert(expression.into(), nodes);
        self
    }
}

/// A scripted page.
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    queries: HashMap<String, Vec<MockNode>>,
    scalars: HashMap<String, PageValue>,
    text: String,
    invalid: HashSet<String>,
    not_interactable: HashSet<String>,
}

impl PageFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the node set an expression evaluates to at document root.
    pub fn nodes(mut self, expression: impl Into<String>, nodes: Vec<MockNode>) -> Self {
        self.queries.insert(expression.into(), nodes);
        self
    }

    pub fn scalar(mut self, expression: impl Into<String>, value: PageValue) -> Self {
        self.scalars.insert(expression.into(), value);
        self
    }

    /// Full-page text, used by locator-less `contains` conditions.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Mark an expression as syntactically malformed.
    pub fn invalid(mut self, expression: impl Into<String>) -> Self {
        self.invalid.insert(expression.into());
        self
    }

    /// Mark a locator as present but not interactable.
    pub fn inert(mut self, locator: impl Into<String>) -> Self {
        self.not_interactable.insert(locator.into());
        self
    }
}

#[derive(Debug, Clone)]
struct ArenaNode {
    text: String,
    attrs: HashMap<String, String>,
    children: HashMap<String, Vec<MockNode>>,
}

/// Scripted controller over a set of page fixtures.
pub struct MockController {
    pages: HashMap<String, PageFixture>,
    click_swaps: HashMap<(String, String), PageFixture>,
    nav_failures: HashSet<String>,
    scripts: HashMap<String, VecDeque<Value>>,
    script_errors: HashMap<String, String>,

    current: Option<String>,
    fixture: Option<PageFixture>,
    epoch: u64,
    arena: Vec<ArenaNode>,

    /// Every successfully opened URL, in navigation order.
    pub opened: Vec<String>,
    /// Every interaction dispatched, as debug strings, in order.
    pub interactions: Vec<String>,
    /// Number of `close()` calls received.
    pub close_calls: u32,
}

impl MockController {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            click_swaps: HashMap::new(),
            nav_failures: HashSet::new(),
            scripts: HashMap::new(),
            script_errors: HashMap::new(),
            current: None,
            fixture: None,
            epoch: 0,
            arena: Vec::new(),
            opened: Vec::new(),
            interactions: Vec::new(),
            close_calls: 0,
        }
    }

    pub fn with_page(mut self, url: impl Into<String>, fixture: PageFixture) -> Self {
        self.pages.insert(url.into(), fixture);
        self
    }

    /// Clicking `locator` on `url` replaces the live fixture, modeling
    /// content revealed by interaction.
    pub fn on_click_swap(
        mut self,
        url: impl Into<String>,
        locator: impl Into<String>,
        fixture: PageFixture,
    ) -> Self {
        self.click_swaps.insert((url.into(), locator.into()), fixture);
        self
    }

    pub fn with_nav_failure(mut self, url: impl Into<String>) -> Self {
        self.nav_failures.insert(url.into());
        self
    }

    /// Script results are consumed in order; the last one repeats, which lets
    /// a `wait_for` predicate flip from falsy to truthy.
    pub fn with_script(mut self, code: impl Into<String>, results: Vec<Value>) -> Self {
        self.scripts.insert(code.into(), results.into());
        self
    }

    pub fn with_script_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.script_errors.insert(code.into(), message.into());
        self
    }

    fn fixture(&self) -> DrWebResult<&PageFixture> {
        self.fixture.as_ref().ok_or_else(|| DrWebError::fatal("no page loaded"))
    }

    fn alloc(&mut self, node: &MockNode) -> NodeHandle {
        self.arena.push(ArenaNode {
            text: node.text.clone(),
            attrs: node.attrs.clone(),
            children: node.children.clone(),
        });
        NodeHandle { epoch: self.epoch, id: self.arena.len() - 1 }
    }

    fn arena_node(&self, handle: &NodeHandle) -> DrWebResult<&ArenaNode> {
        if handle.epoch != self.epoch {
            return Err(DrWebError::fatal("stale node handle used across navigation"));
        }
        self.arena
            .get(handle.id)
            .ok_or_else(|| DrWebError::fatal("unknown node handle"))
    }

    fn probe(&self, predicate: &WaitPredicate) -> DrWebResult<bool> {
        let fixture = self.fixture()?;
        Ok(match predicate {
            WaitPredicate::ElementPresent(locator) => fixture
                .queries
                .get(locator.as_str())
                .map(|nodes| !nodes.is_empty())
                .unwrap_or(false),
            WaitPredicate::ElementAbsent(locator) => fixture
                .queries
                .get(locator.as_str())
                .map(|nodes| nodes.is_empty())
                .unwrap_or(true),
            WaitPredicate::TextPresent { locator, text } => match locator {
                Some(locator) => fixture
                    .queries
                    .get(locator.as_str())
                    .and_then(|nodes| nodes.first())
                    .map(|node| node.text.contains(text.as_str()))
                    .unwrap_or(false),
                None => fixture.text.contains(text.as_str()),
            },
            WaitPredicate::NetworkIdle | WaitPredicate::Delay(_) => true,
        })
    }
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageController for MockController {
    async fn open(&mut self, url: &str, _timeout_ms: u64) -> DrWebResult<()> {
        if self.nav_failures.contains(url) {
            return Err(DrWebError::navigation(url, "scripted navigation failure"));
        }
        let fixture = self
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| DrWebError::navigation(url, "no fixture registered"))?;
        self.current = Some(url.to_string());
        self.fixture = Some(fixture);
        self.epoch += 1;
        self.arena.clear();
        self.opened.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> DrWebResult<String> {
        self.current.clone().ok_or_else(|| DrWebError::fatal("no page loaded"))
    }

    async fn query(
        &mut self,
        expression: &str,
        scope: Option<&NodeHandle>,
    ) -> DrWebResult<Vec<NodeHandle>> {
        if self.fixture()?.invalid.contains(expression) {
            return Err(DrWebError::expression(expression, "scripted syntax error"));
        }
        let nodes: Vec<MockNode> = match scope {
            None => self.fixture()?.queries.get(expression).cloned().unwrap_or_default(),
            Some(handle) => {
                let node = self.arena_node(handle)?;
                if let Some(children) = node.children.get(expression) {
                    children.clone()
                } else if expression == "." {
                    // identity: the anchor node itself
                    vec![MockNode {
                        text: node.text.clone(),
                        attrs: node.attrs.clone(),
                        children: node.children.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }
        };
        Ok(nodes.iter().map(|n| self.alloc(n)).collect())
    }

    async fn query_scalar(
        &self,
        expression: &str,
        _scope: Option<&NodeHandle>,
    ) -> DrWebResult<PageValue> {
        let fixture = self.fixture()?;
        if fixture.invalid.contains(expression) {
            return Err(DrWebError::expression(expression, "scripted syntax error"));
        }
        if expression == "string(/)" {
            return Ok(PageValue::String(fixture.text.clone()));
        }
        Ok(fixture.scalars.get(expression).cloned().unwrap_or(PageValue::Null))
    }

    async fn text_content(&self, node: &NodeHandle) -> DrWebResult<String> {
        Ok(self.arena_node(node)?.text.clone())
    }

    async fn attribute(&self, node: &NodeHandle, name: &str) -> DrWebResult<Option<String>> {
        Ok(self.arena_node(node)?.attrs.get(name).cloned())
    }

    async fn interact(&mut self, interaction: &Interaction) -> DrWebResult<()> {
        self.interactions.push(format!("{interaction:?}"));
        let locator = match interaction {
            Interaction::Click(locator)
            | Interaction::Hover(locator)
            | Interaction::Fill { locator, .. }
            | Interaction::ScrollIntoView(locator) => Some(locator.as_str().to_string()),
            Interaction::ScrollBy { .. } => None,
        };

        if let Some(locator) = locator {
            let fixture = self.fixture()?;
            if fixture.not_interactable.contains(&locator) {
                return Err(DrWebError::TargetNotInteractable { locator });
            }
            if !fixture.queries.contains_key(&locator) {
                return Err(DrWebError::TargetNotFound { locator });
            }
            if let Interaction::Click(_) = interaction {
                let current = self.current.clone().unwrap_or_default();
                if let Some(swap) = self.click_swaps.get(&(current, locator)).cloned() {
                    self.fixture = Some(swap);
                    self.epoch += 1;
                    self.arena.clear();
                }
            }
        }
        Ok(())
    }

    async fn wait(&mut self, predicate: &WaitPredicate, timeout_ms: u64) -> DrWebResult<()> {
        if self.probe(predicate)? {
            Ok(())
        } else {
            Err(DrWebError::ActionTimeout { waited_ms: timeout_ms })
        }
    }

    async fn run_script(&mut self, code: &str) -> DrWebResult<Value> {
        if let Some(message) = self.script_errors.get(code) {
            return Err(DrWebError::script(message.clone()));
        }
        Ok(match self.scripts.get_mut(code) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Value::Null),
            Some(queue) => queue.front().cloned().unwrap_or(Value::Null),
            None => Value::Null,
        })
    }

    async fn close(&mut self) -> DrWebResult<()> {
        self.close_calls += 1;
        self.current = None;
        self.fixture = None;
        self.arena.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Locator;

    #[tokio::test]
    async fn test_query_and_node_accessors() {
        let mut mock = MockController::new().with_page(
            "https://a.example/",
            PageFixture::new().nodes(
                "//div[@class='item']",
                vec![
                    MockNode::with_text("a").attr("id", "first"),
                    MockNode::with_text("b"),
                ],
            ),
        );
        mock.open("https://a.example/", 1000).await.unwrap();

        let nodes = mock.query("//div[@class='item']", None).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(mock.text_content(&nodes[0]).await.unwrap(), "a");
        assert_eq!(mock.attribute(&nodes[0], "id").await.unwrap().as_deref(), Some("first"));
        assert_eq!(mock.attribute(&nodes[1], "id").await.unwrap(), None);

        // unmatched expressions yield an empty list, not an error
        assert!(mock.query("//span", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_rejected_after_navigation() {
        let mut mock = MockController::new()
            .with_page("https://a.example/", PageFixture::new().nodes("//div", vec![MockNode::with_text("x")]))
            .with_page("https://b.example/", PageFixture::new());
        mock.open("https://a.example/", 1000).await.unwrap();
        let nodes = mock.query("//div", None).await.unwrap();
        mock.open("https://b.example/", 1000).await.unwrap();
        assert!(mock.text_content(&nodes[0]).await.is_err());
    }

    #[tokio::test]
    async fn test_click_swap_replaces_fixture() {
        let mut mock = MockController::new()
            .with_page(
                "https://a.example/",
                PageFixture::new().nodes("#load", vec![MockNode::default()]),
            )
            .on_click_swap(
                "https://a.example/",
                "#load",
                PageFixture::new().nodes(".item", vec![MockNode::with_text("revealed")]),
            );
        mock.open("https://a.example/", 1000).await.unwrap();
        assert!(mock.query(".item", None).await.unwrap().is_empty());

        mock.interact(&Interaction::Click(Locator::Css("#load".to_string()))).await.unwrap();
        assert_eq!(mock.query(".item", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_script_results_consumed_in_order() {
        let mut mock = MockController::new()
            .with_page("https://a.example/", PageFixture::new())
            .with_script("ready()", vec![Value::Bool(false), Value::Bool(true)]);
        mock.open("https://a.example/", 1000).await.unwrap();
        assert_eq!(mock.run_script("ready()").await.unwrap(), Value::Bool(false));
        assert_eq!(mock.run_script("ready()").await.unwrap(), Value::Bool(true));
        assert_eq!(mock.run_script("ready()").await.unwrap(), Value::Bool(true));
    }
}
