use tracing::debug;

use crate::browser::PageController;
use crate::error::DrWebResult;
use crate::query::{Condition, Locator};

/// Evaluates branch predicates against the current page. Conditions read the
/// page, never mutate it, and never wait: a locator that matches nothing
/// evaluates to false (or a count of zero), not to an error.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub async fn evaluate(
        page: &mut dyn PageController,
        condition: &Condition,
    ) -> DrWebResult<bool> {
        let result = match condition {
            Condition::Exists(locator) => Self::count(page, Some(locator)).await? >= 1,
            Condition::NotExists(locator) => Self::count(page, Some(locator)).await? == 0,
            Condition::Contains { text, locator } => match locator {
                Some(locator) => {
                    let nodes = page.query(locator.as_str(), None).await?;
                    match nodes.first() {
                        Some(node) => page.text_content(node).await?.contains(text.as_str()),
                        None => false,
                    }
                }
                None => {
                    let value = page.query_scalar("string(/)", None).await?;
                    value.as_str().map(|s| s.contains(text.as_str())).unwrap_or(false)
                }
            },
            Condition::CountEq { locator, count } => {
                Self::count(page, locator.as_ref()).await? == *count
            }
            Condition::CountMin { locator, count } => {
                Self::count(page, locator.as_ref()).await? >= *count
            }
            Condition::CountMax { locator, count } => {
                Self::count(page, locator.as_ref()).await? <= *count
            }
        };
        debug!(?condition, result, "condition evaluated");
        Ok(result)
    }

    /// Match count for a locator; a missing locator counts zero.
    async fn count(page: &mut dyn PageController, locator: Option<&Locator>) -> DrWebResult<u64> {
        match locator {
            Some(locator) => Ok(page.query(locator.as_str(), None).await?.len() as u64),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{MockController, MockNode, PageFixture};

    async fn page_with(fixture: PageFixture) -> MockController {
        let mut mock = MockController::new().with_page("https://a.example/", fixture);
        mock.open("https://a.example/", 1000).await.unwrap();
        mock
    }

    #[tokio::test]
    async fn test_exists_and_not_exists() {
        let mut mock =
            page_with(PageFixture::new().nodes("#premium", vec![MockNode::default()])).await;

        let premium = Locator::Css("#premium".to_string());
        let missing = Locator::Css("#missing".to_string());

        assert!(ConditionEvaluator::evaluate(&mut mock, &Condition::Exists(premium.clone()))
            .await
            .unwrap());
        assert!(!ConditionEvaluator::evaluate(&mut mock, &Condition::Exists(missing.clone()))
            .await
            .unwrap());
        assert!(!ConditionEvaluator::evaluate(&mut mock, &Condition::NotExists(premium))
            .await
            .unwrap());
        assert!(ConditionEvaluator::evaluate(&mut mock, &Condition::NotExists(missing))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_contains_with_and_without_locator() {
        let fixture = PageFixture::new()
            .nodes(".banner", vec![MockNode::with_text("Sale ends soon")])
            .text("Welcome to the premium storefront");
        let mut mock = page_with(fixture).await;

        let scoped = Condition::Contains {
            text: "ends".to_string(),
            locator: Some(Locator::Css(".banner".to_string())),
        };
        assert!(ConditionEvaluator::evaluate(&mut mock, &scoped).await.unwrap());

        let page_wide = Condition::Contains { text: "premium".to_string(), locator: None };
        assert!(ConditionEvaluator::evaluate(&mut mock, &page_wide).await.unwrap());

        // case-sensitive
        let wrong_case = Condition::Contains { text: "PREMIUM".to_string(), locator: None };
        assert!(!ConditionEvaluator::evaluate(&mut mock, &wrong_case).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_predicates() {
        let items = vec![MockNode::default(), MockNode::default(), MockNode::default()];
        let mut mock = page_with(PageFixture::new().nodes(".item", items)).await;
        let items_locator = Some(Locator::Css(".item".to_string()));

        let eq = Condition::CountEq { locator: items_locator.clone(), count: 3 };
        assert!(ConditionEvaluator::evaluate(&mut mock, &eq).await.unwrap());

        let min = Condition::CountMin { locator: items_locator.clone(), count: 4 };
        assert!(!ConditionEvaluator::evaluate(&mut mock, &min).await.unwrap());

        let max = Condition::CountMax { locator: items_locator, count: 3 };
        assert!(ConditionEvaluator::evaluate(&mut mock, &max).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_locator_counts_zero() {
        let mut mock = page_with(PageFixture::new()).await;
        let zero = Condition::CountEq { locator: None, count: 0 };
        assert!(ConditionEvaluator::evaluate(&mut mock, &zero).await.unwrap());
        let min_one = Condition::CountMin { locator: None, count: 1 };
        assert!(!ConditionEvaluator::evaluate(&mut mock, &min_one).await.unwrap());
    }
}
