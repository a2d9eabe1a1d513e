//! Success criteria checks applied to a step's primary result

use serde_json::Value;

/// Decides whether a step result satisfies the step's declared criteria
pub trait SuccessCriterion: Send + Sync {
    fn satisfied(&self, criteria: &str, result: &Value) -> bool;
}

/// Case-insensitive keyword search over the stringified result.
///
/// The criteria text itself is not interpreted; only the keyword matters.
#[derive(Debug, Clone)]
pub struct KeywordCriterion {
    keyword: String,
}

impl KeywordCriterion {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into().to_lowercase(),
        }
    }
}

impl Default for KeywordCriterion {
    fn default() -> Self {
        Self::new("success")
    }
}

impl SuccessCriterion for KeywordCriterion {
    fn satisfied(&self, _criteria: &str, result: &Value) -> bool {
        let text = match result {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        };
        text.contains(&self.keyword)
    }
}

impl<F> SuccessCriterion for F
where
    F: Fn(&str, &Value) -> bool + Send + Sync,
{
    fn satisfied(&self, criteria: &str, result: &Value) -> bool {
        self(criteria, result)
    }
}
