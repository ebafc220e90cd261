//! Surface parsers for the two query dialects.
//!
//! Both dialects (JSON5 and YAML) share the `@`-prefixed key vocabulary and
//! produce the same [`Query`] tree. Every object level is checked against a
//! closed key set; a typo surfaces as `UnknownKey`, never as silence.

use serde_json::Value;
use tracing::debug;

use crate::error::{DrWebError, DrWebResult};
use crate::query::{
    Action, Condition, ConditionalStep, Expr, ExtractStep, FollowSpec, Locator, PaginationSpec,
    Query, ScriptStep, ScrollDirection, Step, WaitUntil, DEFAULT_MAX_DEPTH,
};

const QUERY_KEYS: &[&str] = &["@url", "@steps", "@pagination", "@pre-actions"];
const EXTRACT_KEYS: &[&str] = &["@xpath", "@name", "@fields", "@actions", "@follow", "@strict"];
const CONDITIONAL_KEYS: &[&str] = &["@if", "@then", "@else"];
const FOLLOW_KEYS: &[&str] = &[
    "@xpath",
    "@steps",
    "@name",
    "@max-depth",
    "@detect-cycles",
    "@follow-external",
    "@tag-source",
];
const SCRIPT_KEYS: &[&str] = &["@script", "@name", "@wait-for", "@timeout", "@return-json"];
const PAGINATION_KEYS: &[&str] = &["@xpath", "@limit"];
const CONDITION_KEYS: &[&str] = &[
    "@exists",
    "@not-exists",
    "@contains",
    "@count",
    "@min-count",
    "@max-count",
    "@selector",
    "@xpath",
];
const ACTION_KEYS: &[&str] = &[
    "@type",
    "@selector",
    "@xpath",
    "@value",
    "@direction",
    "@pixels",
    "@until",
    "@text",
    "@timeout",
    "@script",
    "@wait-for",
];

/// Parser facade over the two surface dialects.
pub struct QueryParser;

impl QueryParser {
    /// Parse the JSON-with-comments dialect.
    pub fn parse_json5(source: &str) -> DrWebResult<Query> {
        let value: Value = json5::from_str(source)
            .map_err(|e| DrWebError::schema(format!("invalid JSON5: {e}")))?;
        Self::from_value(&value)
    }

    /// Parse the indentation-based dialect.
    pub fn parse_yaml(source: &str) -> DrWebResult<Query> {
        let value: Value = serde_yaml::from_str(source)
            .map_err(|e| DrWebError::schema(format!("invalid YAML: {e}")))?;
        Self::from_value(&value)
    }

    /// Build a query from an already-parsed value tree.
    pub fn from_value(value: &Value) -> DrWebResult<Query> {
        let obj = as_object(value, "query")?;
        check_keys(obj, QUERY_KEYS, "query")?;

        let start_url = required_string(obj, "@url", "query")?;
        let steps = parse_steps(required(obj, "@steps", "query")?, "query.@steps")?;
        let pagination = match obj.get("@pagination") {
            Some(v) => Some(parse_pagination(v)?),
            None => None,
        };
        let pre_actions = match obj.get("@pre-actions") {
            Some(v) => parse_actions(v, "query.@pre-actions")?,
            None => Vec::new(),
        };

        debug!(steps = steps.len(), "parsed query for {}", start_url);
        Ok(Query { start_url, steps, pagination, pre_actions })
    }
}

fn parse_steps(value: &Value, context: &str) -> DrWebResult<Vec<Step>> {
    let list = as_array(value, context)?;
    list.iter()
        .enumerate()
        .map(|(i, v)| parse_step(v, &format!("{context}[{i}]")))
        .collect()
}

/// Steps are discriminated structurally: `@if` marks a conditional, `@script`
/// a script step, `@fields` an extract step, and `@steps` without `@fields` a
/// standalone follow step.
fn parse_step(value: &Value, context: &str) -> DrWebResult<Step> {
    let obj = as_object(value, context)?;

    if obj.contains_key("@if") {
        return parse_conditional(value, context).map(Step::Conditional);
    }
    if obj.contains_key("@script") {
        return parse_script(value, context).map(Step::Script);
    }
    if obj.contains_key("@fields") {
        return parse_extract(value, context).map(Step::Extract);
    }
    if obj.contains_key("@steps") {
        return parse_follow_spec(value, context).map(Step::Follow);
    }

    Err(DrWebError::schema(format!(
        "{context}: step must contain one of `@if`, `@script`, `@fields`, or `@steps`"
    )))
}

fn parse_extract(value: &Value, context: &str) -> DrWebResult<ExtractStep> {
    let obj = as_object(value, context)?;
    check_keys(obj, EXTRACT_KEYS, context)?;

    let xpath = Expr::new(required_string(obj, "@xpath", context)?);
    let name = optional_string(obj, "@name", context)?;
    let strict = optional_bool(obj, "@strict", context)?.unwrap_or(false);

    let fields_obj = as_object(required(obj, "@fields", context)?, &format!("{context}.@fields"))?;
    let mut fields = std::collections::BTreeMap::new();
    for (field, expr) in fields_obj {
        let expr = expr.as_str().ok_or_else(|| {
            DrWebError::schema(format!("{context}.@fields.{field}: expected an expression string"))
        })?;
        fields.insert(field.clone(), Expr::new(expr));
    }

    let actions = match obj.get("@actions") {
        Some(v) => parse_actions(v, &format!("{context}.@actions"))?,
        None => Vec::new(),
    };
    let follow = match obj.get("@follow") {
        Some(v) => Some(parse_follow_spec(v, &format!("{context}.@follow"))?),
        None => None,
    };

    Ok(ExtractStep { xpath, name, fields, actions, follow, strict })
}

fn parse_conditional(value: &Value, context: &str) -> DrWebResult<ConditionalStep> {
    let obj = as_object(value, context)?;
    check_keys(obj, CONDITIONAL_KEYS, context)?;

    let condition = parse_condition(required(obj, "@if", context)?, &format!("{context}.@if"))?;
    let then_steps = parse_steps(required(obj, "@then", context)?, &format!("{context}.@then"))?;
    if then_steps.is_empty() {
        return Err(DrWebError::schema(format!("{context}.@then: must not be empty")));
    }
    let else_steps = match obj.get("@else") {
        Some(v) => parse_steps(v, &format!("{context}.@else"))?,
        None => Vec::new(),
    };

    Ok(ConditionalStep { condition, then_steps, else_steps })
}

fn parse_follow_spec(value: &Value, context: &str) -> DrWebResult<FollowSpec> {
    let obj = as_object(value, context)?;
    check_keys(obj, FOLLOW_KEYS, context)?;

    let link_expr = Expr::new(required_string(obj, "@xpath", context)?);
    let steps = parse_steps(required(obj, "@steps", context)?, &format!("{context}.@steps"))?;

    Ok(FollowSpec {
        link_expr,
        steps,
        name: optional_string(obj, "@name", context)?,
        max_depth: optional_u32(obj, "@max-depth", context)?.unwrap_or(DEFAULT_MAX_DEPTH),
        detect_cycles: optional_bool(obj, "@detect-cycles", context)?.unwrap_or(true),
        follow_external: optional_bool(obj, "@follow-external", context)?.unwrap_or(false),
        tag_source: optional_bool(obj, "@tag-source", context)?.unwrap_or(false),
    })
}

fn parse_script(value: &Value, context: &str) -> DrWebResult<ScriptStep> {
    let obj = as_object(value, context)?;
    check_keys(obj, SCRIPT_KEYS, context)?;

    Ok(ScriptStep {
        code: required_string(obj, "@script", context)?,
        name: optional_string(obj, "@name", context)?,
        wait_for: optional_string(obj, "@wait-for", context)?,
        timeout_ms: optional_u64(obj, "@timeout", context)?,
        return_json: optional_bool(obj, "@return-json", context)?.unwrap_or(false),
    })
}

fn parse_pagination(value: &Value) -> DrWebResult<PaginationSpec> {
    let context = "query.@pagination";
    let obj = as_object(value, context)?;
    check_keys(obj, PAGINATION_KEYS, context)?;

    let limit = optional_u32(obj, "@limit", context)?
        .ok_or_else(|| DrWebError::schema(format!("{context}: missing `@limit`")))?;
    Ok(PaginationSpec { link_expr: Expr::new(required_string(obj, "@xpath", context)?), limit })
}

/// A condition object carries exactly one predicate key, plus an optional
/// locator for the predicates that take one.
fn parse_condition(value: &Value, context: &str) -> DrWebResult<Condition> {
    let obj = as_object(value, context)?;
    check_keys(obj, CONDITION_KEYS, context)?;

    let locator = parse_locator(obj, context)?;
    let predicates = ["@exists", "@not-exists", "@contains", "@count", "@min-count", "@max-count"];
    let present: Vec<&str> =
        predicates.iter().copied().filter(|k| obj.contains_key(*k)).collect();
    if present.len() != 1 {
        return Err(DrWebError::schema(format!(
            "{context}: expected exactly one of {}, found {}",
            predicates.join(", "),
            present.len()
        )));
    }

    match present[0] {
        "@exists" => {
            let selector = string_value(obj.get("@exists").unwrap(), context, "@exists")?;
            Ok(Condition::Exists(locator_from_string(selector)))
        }
        "@not-exists" => {
            let selector = string_value(obj.get("@not-exists").unwrap(), context, "@not-exists")?;
            Ok(Condition::NotExists(locator_from_string(selector)))
        }
        "@contains" => {
            let text = string_value(obj.get("@contains").unwrap(), context, "@contains")?;
            Ok(Condition::Contains { text, locator })
        }
        "@count" => Ok(Condition::CountEq {
            locator,
            count: u64_value(obj.get("@count").unwrap(), context, "@count")?,
        }),
        "@min-count" => Ok(Condition::CountMin {
            locator,
            count: u64_value(obj.get("@min-count").unwrap(), context, "@min-count")?,
        }),
        "@max-count" => Ok(Condition::CountMax {
            locator,
            count: u64_value(obj.get("@max-count").unwrap(), context, "@max-count")?,
        }),
        _ => unreachable!(),
    }
}

fn parse_actions(value: &Value, context: &str) -> DrWebResult<Vec<Action>> {
    let list = as_array(value, context)?;
    list.iter()
        .enumerate()
        .map(|(i, v)| parse_action(v, &format!("{context}[{i}]")))
        .collect()
}

fn parse_action(value: &Value, context: &str) -> DrWebResult<Action> {
    let obj = as_object(value, context)?;
    check_keys(obj, ACTION_KEYS, context)?;

    let kind = required_string(obj, "@type", context)?;
    let locator = parse_locator(obj, context)?;
    let timeout_ms = optional_u64(obj, "@timeout", context)?;

    let require_locator = |action: &str| {
        locator.clone().ok_or_else(|| DrWebError::MissingAttribute {
            action: action.to_string(),
            attribute: "@selector or @xpath".to_string(),
        })
    };

    match kind.as_str() {
        "click" => Ok(Action::Click { locator: require_locator("click")?, timeout_ms }),
        "hover" => Ok(Action::Hover { locator: require_locator("hover")?, timeout_ms }),
        "fill" => Ok(Action::Fill {
            locator: require_locator("fill")?,
            value: required_string(obj, "@value", context)?,
            timeout_ms,
        }),
        "scroll" => {
            let direction = match optional_string(obj, "@direction", context)?.as_deref() {
                None | Some("down") => ScrollDirection::Down,
                Some("up") => ScrollDirection::Up,
                Some("left") => ScrollDirection::Left,
                Some("right") => ScrollDirection::Right,
                Some(other) => {
                    return Err(DrWebError::schema(format!(
                        "{context}: unknown scroll direction `{other}`"
                    )))
                }
            };
            let pixels = match obj.get("@pixels") {
                Some(v) => Some(
                    v.as_i64().ok_or_else(|| {
                        DrWebError::schema(format!("{context}.@pixels: expected an integer"))
                    })?,
                ),
                None => None,
            };
            Ok(Action::Scroll { direction, pixels, locator })
        }
        "wait" => {
            let until = match required_string(obj, "@until", context)?.as_str() {
                "element" => WaitUntil::Element,
                "no-element" => WaitUntil::NoElement,
                "text" => WaitUntil::Text,
                "network-idle" => WaitUntil::NetworkIdle,
                "timeout" => WaitUntil::Timeout,
                other => {
                    return Err(DrWebError::schema(format!(
                        "{context}: unknown wait predicate `{other}`"
                    )))
                }
            };
            Ok(Action::Wait {
                until,
                locator,
                text: optional_string(obj, "@text", context)?,
                timeout_ms,
            })
        }
        "script" => Ok(Action::Script {
            code: required_string(obj, "@script", context)?,
            wait_for: optional_string(obj, "@wait-for", context)?,
            timeout_ms,
        }),
        other => Err(DrWebError::schema(format!("{context}: unknown action type `{other}`"))),
    }
}

/// At most one of `@selector` / `@xpath` names the target element.
fn parse_locator(
    obj: &serde_json::Map<String, Value>,
    context: &str,
) -> DrWebResult<Option<Locator>> {
    let selector = optional_string(obj, "@selector", context)?;
    let xpath = optional_string(obj, "@xpath", context)?;
    match (selector, xpath) {
        (Some(_), Some(_)) => Err(DrWebError::schema(format!(
            "{context}: `@selector` and `@xpath` are mutually exclusive"
        ))),
        (Some(css), None) => Ok(Some(Locator::Css(css))),
        (None, Some(xp)) => Ok(Some(Locator::Xpath(xp))),
        (None, None) => Ok(None),
    }
}

/// Bare locator strings (as in `@exists`) are sniffed: XPath starts with `/`
/// or `(`, everything else is CSS.
fn locator_from_string(raw: String) -> Locator {
    if raw.starts_with('/') || raw.starts_with('(') || raw.starts_with("./") {
        Locator::Xpath(raw)
    } else {
        Locator::Css(raw)
    }
}

fn check_keys(
    obj: &serde_json::Map<String, Value>,
    allowed: &[&str],
    context: &str,
) -> DrWebResult<()> {
    for key in obj.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(DrWebError::UnknownKey { key: key.clone(), context: context.to_string() });
        }
    }
    Ok(())
}

fn as_object<'a>(value: &'a Value, context: &str) -> DrWebResult<&'a serde_json::Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| DrWebError::schema(format!("{context}: expected an object")))
}

fn as_array<'a>(value: &'a Value, context: &str) -> DrWebResult<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| DrWebError::schema(format!("{context}: expected a list")))
}

fn required<'a>(
    obj: &'a serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<&'a Value> {
    obj.get(key)
        .ok_or_else(|| DrWebError::schema(format!("{context}: missing required key `{key}`")))
}

fn required_string(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<String> {
    string_value(required(obj, key, context)?, context, key)
}

fn optional_string(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<Option<String>> {
    obj.get(key).map(|v| string_value(v, context, key)).transpose()
}

fn optional_bool(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<Option<bool>> {
    obj.get(key)
        .map(|v| {
            v.as_bool()
                .ok_or_else(|| DrWebError::schema(format!("{context}.{key}: expected a boolean")))
        })
        .transpose()
}

fn optional_u64(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<Option<u64>> {
    obj.get(key).map(|v| u64_value(v, context, key)).transpose()
}

fn optional_u32(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    context: &str,
) -> DrWebResult<Option<u32>> {
    Ok(match optional_u64(obj, key, context)? {
        Some(n) => Some(u32::try_from(n).map_err(|_| {
            DrWebError::schema(format!("{context}.{key}: value {n} is out of range"))
        })?),
        None => None,
    })
}

fn string_value(value: &Value, context: &str, key: &str) -> DrWebResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DrWebError::schema(format!("{context}.{key}: expected a string")))
}

fn u64_value(value: &Value, context: &str, key: &str) -> DrWebResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| DrWebError::schema(format!("{context}.{key}: expected a non-negative integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOOKS: &str = r#"
    {
        // books demo query
        "@url": "https://books.example.com/catalogue",
        "@steps": [
            {
                "@xpath": "//article[@class='product_pod']",
                "@name": "books",
                "@fields": {
                    "title": ".//h3/a/@title",
                    "price": ".//p[@class='price_color']/text()"
                }
            }
        ],
        "@pagination": { "@xpath": "//li[@class='next']/a", "@limit": 3 }
    }
    "#;

    #[test]
    fn test_parse_json5_extract_query() {
        let query = QueryParser::parse_json5(BOOKS).unwrap();
        assert_eq!(query.start_url, "https://books.example.com/catalogue");
        assert_eq!(query.steps.len(), 1);
        match &query.steps[0] {
            Step::Extract(step) => {
                assert_eq!(step.name.as_deref(), Some("books"));
                assert_eq!(step.fields.len(), 2);
                assert!(!step.strict);
            }
            other => panic!("expected extract step, got {}", other.kind()),
        }
        assert_eq!(query.pagination.as_ref().unwrap().limit, 3);
    }

    #[test]
    fn test_dialects_agree() {
        let yaml = r#"
"@url": "https://books.example.com/catalogue"
"@steps":
  - "@xpath": "//article[@class='product_pod']"
    "@name": "books"
    "@fields":
      title: ".//h3/a/@title"
      price: ".//p[@class='price_color']/text()"
"@pagination":
  "@xpath": "//li[@class='next']/a"
  "@limit": 3
"#;
        let from_yaml = QueryParser::parse_yaml(yaml).unwrap();
        let from_json5 = QueryParser::parse_json5(BOOKS).unwrap();
        assert_eq!(
            serde_json::to_value(&from_yaml).unwrap(),
            serde_json::to_value(&from_json5).unwrap()
        );
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let src = r#"{"@url": "https://a.example", "@steps": [], "@paginate": {}}"#;
        match QueryParser::parse_json5(src) {
            Err(DrWebError::UnknownKey { key, .. }) => assert_eq!(key, "@paginate"),
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_key_nested_in_step() {
        let src = r#"
        {
            "@url": "https://a.example",
            "@steps": [{ "@xpath": "//div", "@fields": {"t": "./text()"}, "@folow": {} }]
        }
        "#;
        match QueryParser::parse_json5(src) {
            Err(DrWebError::UnknownKey { key, context }) => {
                assert_eq!(key, "@folow");
                assert!(context.contains("@steps[0]"));
            }
            other => panic!("expected UnknownKey, got {other:?}"),
        }
    }

    #[test]
    fn test_follow_defaults() {
        let src = r#"
        {
            "@url": "https://a.example",
            "@steps": [{
                "@xpath": "//a[@class='detail']",
                "@steps": [{ "@xpath": "//h1", "@fields": {"title": "./text()"} }]
            }]
        }
        "#;
        let query = QueryParser::parse_json5(src).unwrap();
        match &query.steps[0] {
            Step::Follow(spec) => {
                assert_eq!(spec.max_depth, DEFAULT_MAX_DEPTH);
                assert!(spec.detect_cycles);
                assert!(!spec.follow_external);
                assert!(!spec.tag_source);
            }
            other => panic!("expected follow step, got {}", other.kind()),
        }
    }

    #[test]
    fn test_condition_requires_exactly_one_predicate() {
        let src = r##"
        {
            "@url": "https://a.example",
            "@steps": [{
                "@if": { "@exists": "#premium", "@contains": "Premium" },
                "@then": [{ "@xpath": "//div", "@fields": {"t": "./text()"} }]
            }]
        }
        "##;
        assert!(matches!(QueryParser::parse_json5(src), Err(DrWebError::Schema { .. })));
    }

    #[test]
    fn test_action_missing_locator() {
        let src = r#"
        {
            "@url": "https://a.example",
            "@steps": [{
                "@xpath": "//div",
                "@fields": {"t": "./text()"},
                "@actions": [{ "@type": "click" }]
            }]
        }
        "#;
        match QueryParser::parse_json5(src) {
            Err(DrWebError::MissingAttribute { action, .. }) => assert_eq!(action, "click"),
            other => panic!("expected MissingAttribute, got {other:?}"),
        }
    }

    #[test]
    fn test_selector_and_xpath_exclusive() {
        let src = r##"
        {
            "@url": "https://a.example",
            "@steps": [{
                "@xpath": "//div",
                "@fields": {"t": "./text()"},
                "@actions": [{ "@type": "click", "@selector": "#a", "@xpath": "//a" }]
            }]
        }
        "##;
        assert!(matches!(QueryParser::parse_json5(src), Err(DrWebError::Schema { .. })));
    }
}
