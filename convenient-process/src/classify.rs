//! Diagnostic classification of build output lines.
//!
//! Build tools do not always exit non-zero when they should: a devicetree
//! generator may print an error and still leave a zero exit code behind. Rules
//! marked `fatal` fail the producing unit no matter what its exit code says.

use crate::error::{ProcessError, ProcessResult};
use crate::log::Severity;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One pattern and what a match means.
#[derive(Debug, Clone)]
pub struct DiagnosticRule {
    pattern: Regex,
    severity: Severity,
    fatal: bool,
}

impl DiagnosticRule {
    /// Compile a rule.
    pub fn new(pattern: &str, severity: Severity, fatal: bool) -> ProcessResult<Self> {
        let regex = Regex::new(pattern).map_err(|source| ProcessError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            pattern: regex,
            severity,
            fatal,
        })
    }

    /// The source pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Severity assigned on match.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Whether a match fails the producer.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

/// Serializable form of a rule, as written in settings files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Regular expression matched against each line.
    pub pattern: String,
    /// Severity assigned on match.
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
    /// Whether a match fails the producer.
    #[serde(default)]
    pub fatal: bool,
}

fn default_rule_severity() -> Severity {
    Severity::Error
}

impl RuleSpec {
    /// Compile into a rule.
    pub fn compile(&self) -> ProcessResult<DiagnosticRule> {
        DiagnosticRule::new(&self.pattern, self.severity, self.fatal)
    }
}

/// Ordered rule list; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<DiagnosticRule>,
}

/// Built-in rules: (pattern, severity, fatal).
const DEFAULT_RULES: &[(&str, Severity, bool)] = &[
    (r"devicetree error", Severity::Error, true),
    (r"^CMake Error", Severity::Error, true),
    (r"error: Aborting due to Kconfig warnings", Severity::Error, true),
    (r"\berror:", Severity::Error, false),
    (r"^FAILED:", Severity::Error, false),
    (r"\bwarning:", Severity::Warning, false),
];

impl Default for Classifier {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(pattern, severity, fatal)| {
                DiagnosticRule::new(pattern, *severity, *fatal).ok()
            })
            .collect();
        Self { rules }
    }
}

impl Classifier {
    /// Default rules with `extra` checked first.
    pub fn with_extra_rules(extra: Vec<DiagnosticRule>) -> Self {
        let mut rules = extra;
        rules.extend(Self::default().rules);
        Self { rules }
    }

    /// Severity and fatality of one line.
    pub fn classify(&self, line: &str) -> (Severity, bool) {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(line))
            .map(|rule| (rule.severity, rule.fatal))
            .unwrap_or((Severity::Info, false))
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
