//! Expression runtime: classifies location expressions by yield shape and
//! resolves their values through the page controller.
//!
//! XPath is the canonical form. A small set of trailing forms changes the
//! yield shape: `…/text()`, `…/normalize-space()`, `…/@attr`. Function-call
//! expressions (`count(…)`, `string(…)`, …) yield scalars directly.

use tracing::{debug, warn};
use url::Url;

use crate::browser::{NodeHandle, PageController};
use crate::error::DrWebResult;
use crate::query::Expr;

/// How an expression's value is materialized once its nodes are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueForm {
    /// Element nodes; string content is the node text.
    Node,
    /// Immediate text content, whitespace preserved.
    Text,
    /// Text content with whitespace collapsed.
    NormalizedText,
    /// An attribute value; the empty string when absent.
    Attr(String),
    /// The whole expression evaluates to a scalar (count/number/string/...).
    Scalar,
}

#[derive(Debug, Clone)]
pub struct ParsedExpr {
    pub base: String,
    pub form: ValueForm,
}

const SCALAR_PREFIXES: &[&str] = &["count(", "number(", "boolean(", "string(", "concat("];

/// Split an expression into its node-selecting base and value form.
pub fn parse_expr(raw: &str) -> ParsedExpr {
    if SCALAR_PREFIXES.iter().any(|p| raw.starts_with(p)) {
        return ParsedExpr { base: raw.to_string(), form: ValueForm::Scalar };
    }
    if raw == "text()" {
        return ParsedExpr { base: ".".to_string(), form: ValueForm::Text };
    }
    if let Some(base) = raw.strip_suffix("/text()") {
        return ParsedExpr { base: base.to_string(), form: ValueForm::Text };
    }
    if let Some(base) = raw.strip_suffix("/normalize-space()") {
        return ParsedExpr { base: base.to_string(), form: ValueForm::NormalizedText };
    }
    if raw == "normalize-space()" {
        return ParsedExpr { base: ".".to_string(), form: ValueForm::NormalizedText };
    }
    if let Some(rest) = raw.strip_prefix('@') {
        if is_attr_name(rest) {
            return ParsedExpr { base: ".".to_string(), form: ValueForm::Attr(rest.to_string()) };
        }
    }
    if let Some(idx) = raw.rfind("/@") {
        let name = &raw[idx + 2..];
        if is_attr_name(name) {
            return ParsedExpr {
                base: raw[..idx].to_string(),
                form: ValueForm::Attr(name.to_string()),
            };
        }
    }
    ParsedExpr { base: raw.to_string(), form: ValueForm::Node }
}

fn is_attr_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
}

/// String value of one matched node under the given form.
pub async fn node_string(
    page: &dyn PageController,
    node: &NodeHandle,
    form: &ValueForm,
) -> DrWebResult<String> {
    match form {
        ValueForm::Node | ValueForm::Text => page.text_content(node).await,
        ValueForm::NormalizedText => {
            let text = page.text_content(node).await?;
            Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
        }
        // absent attributes extract as the empty string
        ValueForm::Attr(name) => Ok(page.attribute(node, name).await?.unwrap_or_default()),
        ValueForm::Scalar => {
            let value = page.query_scalar(".", Some(node)).await?;
            Ok(value.as_str().unwrap_or_default().to_string())
        }
    }
}

/// Evaluate a link expression and resolve its raw values into absolute
/// HTTP(S) URLs against `base`. Malformed or non-HTTP values are logged and
/// dropped, never raised.
pub async fn resolve_links(
    page: &mut dyn PageController,
    expr: &Expr,
    scope: Option<&NodeHandle>,
    base: &Url,
) -> DrWebResult<Vec<String>> {
    let parsed = parse_expr(expr.as_str());

    let mut raw_values = Vec::new();
    if parsed.form == ValueForm::Scalar {
        let value = page.query_scalar(&parsed.base, scope).await?;
        if let Some(s) = value.as_str() {
            raw_values.push(s.to_string());
        }
    } else {
        let nodes = page.query(&parsed.base, scope).await?;
        for node in &nodes {
            let value = match &parsed.form {
                // bare element matches are treated as anchors: take the href
                ValueForm::Node => page.attribute(node, "href").await?.unwrap_or_default(),
                form => node_string(page, node, form).await?,
            };
            if !value.is_empty() {
                raw_values.push(value);
            }
        }
    }

    let mut urls = Vec::new();
    for raw in raw_values {
        match base.join(raw.trim()) {
            Ok(resolved) if resolved.scheme() == "http" || resolved.scheme() == "https" => {
                urls.push(resolved.to_string());
            }
            Ok(resolved) => {
                debug!("dropping non-HTTP link `{resolved}`");
            }
            Err(e) => {
                warn!("dropping malformed link `{raw}`: {e}");
            }
        }
    }
    Ok(urls)
}

/// Canonical form used only for cycle detection: fragment stripped; the url
/// crate already lowercases scheme/host and strips default ports.
pub fn canonicalize(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    canonical.to_string()
}

/// Whether a URL leaves the start page's host.
pub fn is_external(url: &Url, start_host: Option<&str>) -> bool {
    match (url.host_str(), start_host) {
        (Some(host), Some(start)) => !host.eq_ignore_ascii_case(start),
        (_, None) => false,
        (None, Some(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_suffix() {
        let parsed = parse_expr(".//p[@class='price']/text()");
        assert_eq!(parsed.base, ".//p[@class='price']");
        assert_eq!(parsed.form, ValueForm::Text);
    }

    #[test]
    fn test_parse_attr_suffix() {
        let parsed = parse_expr(".//h3/a/@title");
        assert_eq!(parsed.base, ".//h3/a");
        assert_eq!(parsed.form, ValueForm::Attr("title".to_string()));

        let parsed = parse_expr("@href");
        assert_eq!(parsed.base, ".");
        assert_eq!(parsed.form, ValueForm::Attr("href".to_string()));
    }

    #[test]
    fn test_parse_normalize_space() {
        let parsed = parse_expr(".//div/normalize-space()");
        assert_eq!(parsed.base, ".//div");
        assert_eq!(parsed.form, ValueForm::NormalizedText);
    }

    #[test]
    fn test_parse_plain_and_scalar() {
        assert_eq!(parse_expr("//div[@id='x']").form, ValueForm::Node);
        assert_eq!(parse_expr("count(//div)").form, ValueForm::Scalar);
        // a predicate containing @attr is not an attribute suffix
        assert_eq!(parse_expr("//a[@href]").form, ValueForm::Node);
    }

    #[test]
    fn test_canonicalize_strips_fragment_and_default_port() {
        let url = Url::parse("HTTPS://Example.COM:443/a/b#frag").unwrap();
        assert_eq!(canonicalize(&url), "https://example.com/a/b");
    }

    #[test]
    fn test_is_external() {
        let url = Url::parse("https://other.example/x").unwrap();
        assert!(is_external(&url, Some("a.example")));
        assert!(!is_external(&url, Some("other.example")));
        assert!(!is_external(&url, None));
    }
}
