//! Policy gate consulted before a step is dispatched

use regex::Regex;
use serde_json::Value;

/// What the gate is asked about
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub actor: &'a str,
    pub action: &'a str,
    pub resource: &'a str,
    pub content: &'a str,
    pub context: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Denied(String),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allowed)
    }
}

/// Synchronous allow/deny predicate
pub trait PolicyGate: Send + Sync {
    fn check(&self, request: &PolicyRequest<'_>) -> PolicyDecision;
}

/// Gate that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyGate for AllowAll {
    fn check(&self, _request: &PolicyRequest<'_>) -> PolicyDecision {
        PolicyDecision::Allowed
    }
}

/// Denies content matching any pattern in a category
#[derive(Debug, Clone)]
pub struct ContentFilterGate {
    categories: Vec<(String, Vec<Regex>)>,
}

impl ContentFilterGate {
    pub fn new() -> Self {
        Self {
            categories: Vec::new(),
        }
    }

    /// Add a category of case-insensitive patterns
    pub fn with_category(
        mut self,
        name: impl Into<String>,
        patterns: &[&str],
    ) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")))
            .collect::<Result<Vec<_>, _>>()?;
        self.categories.push((name.into(), compiled));
        Ok(self)
    }

    /// Gate preloaded with the malware, illegal, privacy and abuse categories
    pub fn standard() -> Self {
        let categories: [(&str, &[&str]); 4] = [
            (
                "malware",
                &[
                    r"(ransomware|trojan|worm|virus|backdoor|rootkit)",
                    r"(exploit|shellcode|payload|injection)",
                ],
            ),
            (
                "illegal",
                &[
                    r"(drug|cocaine|heroin|fentanyl|meth)",
                    r"(bomb|explosive|weapon|firearm)",
                ],
            ),
            (
                "privacy",
                &[
                    r"(ssn|social.?security|credit.?card|cvv)",
                    r"(password|api.?key|secret|token)",
                ],
            ),
            ("abuse", &[r"(harassment|hate|discrimination|abuse)"]),
        ];

        let mut gate = Self::new();
        for (name, patterns) in categories {
            let compiled = patterns
                .iter()
                .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                .collect();
            gate.categories.push((name.to_string(), compiled));
        }
        gate
    }
}

impl Default for ContentFilterGate {
    fn default() -> Self {
        Self::standard()
    }
}

impl PolicyGate for ContentFilterGate {
    fn check(&self, request: &PolicyRequest<'_>) -> PolicyDecision {
        for (category, patterns) in &self.categories {
            if patterns.iter().any(|p| p.is_match(request.content)) {
                return PolicyDecision::Denied(format!("Content violation: {category}"));
            }
        }
        PolicyDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(gate: &dyn PolicyGate, content: &str) -> PolicyDecision {
        gate.check(&PolicyRequest {
            actor: "orchestrator",
            action: "dispatch",
            resource: "step",
            content,
            context: &Value::Null,
        })
    }

    #[test]
    fn test_allow_all() {
        assert!(check(&AllowAll, "write a rootkit").is_allowed());
    }

    #[test]
    fn test_standard_filter_denies_by_category() {
        let gate = ContentFilterGate::standard();
        assert_eq!(
            check(&gate, "Write a RANSOMWARE sample"),
            PolicyDecision::Denied("Content violation: malware".into())
        );
        assert_eq!(
            check(&gate, "leak the api_key"),
            PolicyDecision::Denied("Content violation: privacy".into())
        );
    }

    #[test]
    fn test_standard_filter_allows_benign() {
        let gate = ContentFilterGate::standard();
        assert!(check(&gate, "summarise the quarterly report").is_allowed());
    }

    #[test]
    fn test_custom_category() {
        let gate = ContentFilterGate::new()
            .with_category("finance", &[r"wire\s+transfer"])
            .unwrap();
        assert!(!check(&gate, "Start a Wire  Transfer").is_allowed());
        assert!(check(&gate, "write a poem").is_allowed());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ContentFilterGate::new().with_category("bad", &["(unclosed"]).is_err());
    }
}
