use tracing::{debug, warn};
use url::Url;

use crate::error::{DrWebError, DrWebResult};
use crate::query::{Action, ExtractStep, FollowSpec, PaginationSpec, Query, Step, WaitUntil};

/// Semantic validation applied after parse, before evaluation begins.
pub struct QueryValidator;

impl QueryValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a complete query tree.
    pub fn validate(&self, query: &Query) -> DrWebResult<()> {
        debug!("validating query for {}", query.start_url);

        self.validate_start_url(&query.start_url)?;

        if query.steps.is_empty() {
            return Err(DrWebError::validation("query must contain at least one step"));
        }

        if let Some(pagination) = &query.pagination {
            self.validate_pagination(pagination)?;
        }

        for action in &query.pre_actions {
            self.validate_action(action)?;
        }
        for step in &query.steps {
            self.validate_step(step)?;
        }

        debug!("query validation completed");
        Ok(())
    }

    fn validate_start_url(&self, raw: &str) -> DrWebResult<()> {
        let url = Url::parse(raw)
            .map_err(|e| DrWebError::validation(format!("invalid start URL `{raw}`: {e}")))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DrWebError::validation(format!(
                "start URL must use HTTP or HTTPS, got `{}`",
                url.scheme()
            )));
        }
        Ok(())
    }

    fn validate_pagination(&self, pagination: &PaginationSpec) -> DrWebResult<()> {
        if pagination.limit == 0 {
            return Err(DrWebError::validation("pagination limit must be at least 1"));
        }
        if pagination.link_expr.as_str().is_empty() {
            return Err(DrWebError::validation("pagination expression must not be empty"));
        }
        Ok(())
    }

    fn validate_step(&self, step: &Step) -> DrWebResult<()> {
        match step {
            Step::Extract(extract) => self.validate_extract(extract),
            Step::Conditional(cond) => {
                if cond.then_steps.is_empty() {
                    return Err(DrWebError::validation(
                        "conditional step must have a non-empty then branch",
                    ));
                }
                for child in cond.then_steps.iter().chain(&cond.else_steps) {
                    self.validate_step(child)?;
                }
                Ok(())
            }
            Step::Follow(spec) => self.validate_follow(spec),
            Step::Script(script) => {
                if script.code.trim().is_empty() {
                    return Err(DrWebError::validation("script step must carry a script body"));
                }
                Ok(())
            }
            Step::Extension(ext) => {
                if ext.kind.is_empty() {
                    return Err(DrWebError::validation("extension step must carry a kind tag"));
                }
                Ok(())
            }
        }
    }

    fn validate_extract(&self, step: &ExtractStep) -> DrWebResult<()> {
        if step.xpath.as_str().is_empty() {
            return Err(DrWebError::validation("extract step anchor expression must not be empty"));
        }
        if step.fields.is_empty() && step.follow.is_none() {
            warn!(
                "extract step `{}` has no fields and no follow; it will emit empty records",
                step.name.as_deref().unwrap_or(step.xpath.as_str())
            );
        }
        for action in &step.actions {
            self.validate_action(action)?;
        }
        if let Some(follow) = &step.follow {
            self.validate_follow(follow)?;
        }
        Ok(())
    }

    fn validate_follow(&self, spec: &FollowSpec) -> DrWebResult<()> {
        if spec.max_depth == 0 {
            return Err(DrWebError::validation("follow max depth must be at least 1"));
        }
        if spec.steps.is_empty() {
            return Err(DrWebError::validation("follow step list must not be empty"));
        }
        for child in &spec.steps {
            self.validate_step(child)?;
        }
        Ok(())
    }

    fn validate_action(&self, action: &Action) -> DrWebResult<()> {
        match action {
            Action::Wait { until: WaitUntil::Element | WaitUntil::NoElement, locator: None, .. } => {
                Err(DrWebError::MissingAttribute {
                    action: "wait".to_string(),
                    attribute: "@selector or @xpath".to_string(),
                })
            }
            Action::Wait { until: WaitUntil::Text, text: None, .. } => {
                Err(DrWebError::MissingAttribute {
                    action: "wait".to_string(),
                    attribute: "@text".to_string(),
                })
            }
            Action::Script { code, .. } if code.trim().is_empty() => {
                Err(DrWebError::MissingAttribute {
                    action: "script".to_string(),
                    attribute: "@script".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Expr, Locator};
    use std::collections::BTreeMap;

    fn minimal_query() -> Query {
        Query {
            start_url: "https://example.com".to_string(),
            steps: vec![Step::Extract(ExtractStep {
                xpath: Expr::new("//div"),
                name: None,
                fields: BTreeMap::from([("t".to_string(), Expr::new("./text()"))]),
                actions: Vec::new(),
                follow: None,
                strict: false,
            })],
            pagination: None,
            pre_actions: Vec::new(),
        }
    }

    #[test]
    fn test_valid_query_passes() {
        assert!(QueryValidator::new().validate(&minimal_query()).is_ok());
    }

    #[test]
    fn test_rejects_non_http_url() {
        let mut query = minimal_query();
        query.start_url = "ftp://example.com".to_string();
        assert!(QueryValidator::new().validate(&query).is_err());
    }

    #[test]
    fn test_rejects_empty_steps() {
        let mut query = minimal_query();
        query.steps.clear();
        assert!(QueryValidator::new().validate(&query).is_err());
    }

    #[test]
    fn test_rejects_zero_pagination_limit() {
        let mut query = minimal_query();
        query.pagination = Some(PaginationSpec { link_expr: Expr::new("//a"), limit: 0 });
        assert!(QueryValidator::new().validate(&query).is_err());
    }

    #[test]
    fn test_rejects_wait_without_locator() {
        let mut query = minimal_query();
        query.pre_actions.push(Action::Wait {
            until: WaitUntil::Element,
            locator: None,
            text: None,
            timeout_ms: None,
        });
        let err = QueryValidator::new().validate(&query).unwrap_err();
        assert!(matches!(err, DrWebError::MissingAttribute { .. }));
    }

    #[test]
    fn test_wait_with_locator_passes() {
        let mut query = minimal_query();
        query.pre_actions.push(Action::Wait {
            until: WaitUntil::Element,
            locator: Some(Locator::Css(".item".to_string())),
            text: None,
            timeout_ms: Some(5000),
        });
        assert!(QueryValidator::new().validate(&query).is_ok());
    }
}
