use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::browser::{NodeHandle, PageController};
use crate::engine::selector::{self, ValueForm};
use crate::error::{DrWebError, DrWebResult};
use crate::query::Expr;

/// Builds one record from an anchor node and a field map.
///
/// A field whose expression is malformed is omitted from the record and
/// reported back for the diagnostic log; the record is still produced with
/// the remaining fields.
pub struct FieldExtractor;

impl FieldExtractor {
    /// Extract every field relative to `anchor`. Returns the record and any
    /// per-field expression failures.
    pub async fn extract(
        page: &mut dyn PageController,
        anchor: &NodeHandle,
        fields: &BTreeMap<String, Expr>,
        strict: bool,
    ) -> DrWebResult<(Map<String, Value>, Vec<DrWebError>)> {
        let mut record = Map::new();
        let mut failures = Vec::new();

        for (name, expr) in fields {
            match Self::extract_one(page, anchor, expr, strict).await {
                Ok(value) => {
                    record.insert(name.clone(), value);
                }
                Err(err @ DrWebError::ExpressionSyntax { .. }) => {
                    debug!("field `{name}` skipped: {err}");
                    failures.push(err);
                }
                Err(other) => return Err(other),
            }
        }

        Ok((record, failures))
    }

    async fn extract_one(
        page: &mut dyn PageController,
        anchor: &NodeHandle,
        expr: &Expr,
        strict: bool,
    ) -> DrWebResult<Value> {
        let parsed = selector::parse_expr(expr.as_str());

        // scalar forms keep their numeric/boolean type in the record
        if parsed.form == ValueForm::Scalar {
            let value = page.query_scalar(&parsed.base, Some(anchor)).await?;
            return Ok(value.into_json());
        }

        let nodes = page.query(&parsed.base, Some(anchor)).await?;
        match nodes.len() {
            0 => Ok(if strict { Value::Null } else { Value::String(String::new()) }),
            1 => {
                let s = selector::node_string(page, &nodes[0], &parsed.form).await?;
                Ok(Value::String(s))
            }
            _ => {
                let mut values = Vec::with_capacity(nodes.len());
                for node in &nodes {
                    values
                        .push(Value::String(selector::node_string(page, node, &parsed.form).await?));
                }
                Ok(Value::Array(values))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockController, MockNode, PageFixture};
    use crate::browser::PageValue;

    async fn anchor_page(fixture: PageFixture) -> (MockController, NodeHandle) {
        let mut mock = MockController::new().with_page("https://a.example/", fixture);
        mock.open("https://a.example/", 1000).await.unwrap();
        let anchors = mock.query("//div", None).await.unwrap();
        (mock, anchors.into_iter().next().unwrap())
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, Expr> {
        pairs.iter().map(|(k, v)| (k.to_string(), Expr::new(*v))).collect()
    }

    #[tokio::test]
    async fn test_single_match_extracts_string() {
        let anchor_node = MockNode::default()
            .child(".//h3", vec![MockNode::with_text("Title").attr("title", "Full Title")]);
        let (mut mock, anchor) =
            anchor_page(PageFixture::new().nodes("//div", vec![anchor_node])).await;

        let (record, failures) = FieldExtractor::extract(
            &mut mock,
            &anchor,
            &fields(&[("title", ".//h3/text()"), ("full", ".//h3/@title")]),
            false,
        )
        .await
        .unwrap();

        assert!(failures.is_empty());
        assert_eq!(record["title"], "Title");
        assert_eq!(record["full"], "Full Title");
    }

    #[tokio::test]
    async fn test_no_match_yields_empty_string_or_null() {
        let (mut mock, anchor) =
            anchor_page(PageFixture::new().nodes("//div", vec![MockNode::default()])).await;

        let (record, _) =
            FieldExtractor::extract(&mut mock, &anchor, &fields(&[("gone", ".//em/text()")]), false)
                .await
                .unwrap();
        assert_eq!(record["gone"], "");

        let (record, _) =
            FieldExtractor::extract(&mut mock, &anchor, &fields(&[("gone", ".//em/text()")]), true)
                .await
                .unwrap();
        assert_eq!(record["gone"], Value::Null);
    }

    #[tokio::test]
    async fn test_multiple_matches_yield_list_in_order() {
        let anchor_node = MockNode::default().child(
            ".//li",
            vec![MockNode::with_text("a"), MockNode::with_text("b"), MockNode::with_text("c")],
        );
        let (mut mock, anchor) =
            anchor_page(PageFixture::new().nodes("//div", vec![anchor_node])).await;

        let (record, _) =
            FieldExtractor::extract(&mut mock, &anchor, &fields(&[("tags", ".//li/text()")]), false)
                .await
                .unwrap();
        assert_eq!(record["tags"], serde_json::json!(["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_bad_field_is_omitted_and_reported() {
        let anchor_node =
            MockNode::default().child(".//h3", vec![MockNode::with_text("kept")]);
        let fixture = PageFixture::new()
            .nodes("//div", vec![anchor_node])
            .invalid(".//[broken");
        let (mut mock, anchor) = anchor_page(fixture).await;

        let (record, failures) = FieldExtractor::extract(
            &mut mock,
            &anchor,
            &fields(&[("bad", ".//[broken"), ("good", ".//h3/text()")]),
            false,
        )
        .await
        .unwrap();

        assert_eq!(record.len(), 1);
        assert_eq!(record["good"], "kept");
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], DrWebError::ExpressionSyntax { .. }));
    }

    #[tokio::test]
    async fn test_scalar_field_preserves_type() {
        let anchor_node = MockNode::default();
        let fixture = PageFixture::new()
            .nodes("//div", vec![anchor_node])
            .scalar("count(.//li)", PageValue::Number(3.0));
        let (mut mock, anchor) = anchor_page(fixture).await;

        let (record, _) =
            FieldExtractor::extract(&mut mock, &anchor, &fields(&[("n", "count(.//li)")]), false)
                .await
                .unwrap();
        assert_eq!(record["n"], serde_json::json!(3.0));
    }
}
