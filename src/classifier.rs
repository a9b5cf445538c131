//! Heuristic mapping of failure output onto [`FailureCategory`].
//!
//! Rules are checked in table order and the first match wins. The table is
//! plain data: callers may append rules with [`FailureClassifier::with_rule`].

use crate::model::{FailureCategory, LogLine, Phase, StatusRecord};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};

pub const REPORT_TRAILING_LINES: usize = 10;

#[derive(Clone, Debug)]
pub struct ClassifierRule {
    pub category: FailureCategory,
    pub pattern: Regex,
}

impl ClassifierRule {
    /// Compiles a case-insensitive rule. Returns `None` for an invalid pattern.
    pub fn new(category: FailureCategory, pattern: &str) -> Option<Self> {
        Regex::new(&format!("(?i){pattern}"))
            .ok()
            .map(|pattern| Self { category, pattern })
    }
}

const DEFAULT_RULES: &[(FailureCategory, &str)] = &[
    (
        FailureCategory::ImageNotFound,
        r"manifest unknown|manifest for \S+ not found|pull access denied|repository does not exist|not found: manifest",
    ),
    (
        FailureCategory::SyntaxError,
        r"unknown instruction|dockerfile parse error|syntax error|unexpected token|unterminated",
    ),
    (
        FailureCategory::MissingBuildContextFile,
        r"copy failed|file does not exist|file not found|no such file or directory|failed to compute cache key",
    ),
];

#[derive(Clone, Debug)]
pub struct FailureClassifier {
    rules: Arc<Vec<ClassifierRule>>,
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureClassifier {
    pub fn new() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(category, pattern)| ClassifierRule::new(*category, pattern))
            .collect();
        Self {
            rules: Arc::new(rules),
        }
    }

    pub fn with_rule(mut self, rule: ClassifierRule) -> Self {
        Arc::make_mut(&mut self.rules).push(rule);
        self
    }

    pub fn rules(&self) -> &[ClassifierRule] {
        &self.rules
    }

    /// Pure and total: an empty or unmatched input is `Unclassified`.
    pub fn classify(&self, lines: &[LogLine]) -> FailureCategory {
        self.rules
            .iter()
            .find(|rule| lines.iter().any(|line| rule.pattern.is_match(&line.text)))
            .map(|rule| rule.category)
            .unwrap_or(FailureCategory::Unclassified)
    }

    /// Name of the absent file from a `stat <file>: file does not exist` line.
    pub fn missing_file(lines: &[LogLine]) -> Option<String> {
        static STAT_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = STAT_RE
            .get_or_init(|| Regex::new(r"stat\s+(.*?):\s+file does not exist").ok())
            .as_ref()?;
        lines.iter().find_map(|line| {
            re.captures(&line.text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().trim_start_matches('/').to_string())
                .filter(|name| !name.is_empty())
        })
    }
}

/// What a consumer shows for a failed record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub category: FailureCategory,
    pub label: &'static str,
    pub remediation: &'static str,
    pub missing_file: Option<String>,
    pub trailing_lines: Vec<String>,
}

impl FailureReport {
    pub fn from_record(record: &StatusRecord) -> Option<Self> {
        if record.phase != Phase::Failed {
            return None;
        }
        let category = record
            .failure_category
            .unwrap_or(FailureCategory::Unclassified);
        let missing_file = match category {
            FailureCategory::MissingBuildContextFile => {
                FailureClassifier::missing_file(&record.log_lines)
            }
            _ => None,
        };
        Some(Self {
            category,
            label: category.label(),
            remediation: category.remediation(),
            missing_file,
            trailing_lines: record.trailing_lines(REPORT_TRAILING_LINES),
        })
    }
}
