//! Regex utilities for locator analysis
//! Extracted to a separate crate for compilation optimization

use once_cell::sync::Lazy;
use regex::Regex;

/// Locator classification and structural checks
pub mod selector {
    use super::*;

    pub static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z]*#[A-Za-z_][\w-]*$").expect("Invalid regex pattern")
    });

    pub static TEST_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"\[data-(?:testid|test-id|test|qa|cy)\s*=\s*["']?[^\]]+\]"#)
            .expect("Invalid regex pattern")
    });

    pub static ARIA_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\[(?:aria-label|aria-labelledby|role)\s*=").expect("Invalid regex pattern")
    });

    pub static NAME_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\[name\s*=").expect("Invalid regex pattern"));

    pub static ATTRIBUTE_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\[[\w-]+(?:\s*[~|^$*]?=\s*[^\]]+)?\]").expect("Invalid regex pattern")
    });

    pub static CLASS_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\.[A-Za-z_][\w-]*").expect("Invalid regex pattern"));

    pub static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9-]*(?:\s*[>+~\s]\s*[a-zA-Z][a-zA-Z0-9-]*)*$")
            .expect("Invalid regex pattern")
    });

    pub static XPATH_ABSOLUTE_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^/[^/]").expect("Invalid regex pattern"));

    pub static XPATH_RELATIVE_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\.?//").expect("Invalid regex pattern"));

    pub static TEXT_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^text=|:has-text\(|:contains\(").expect("Invalid regex pattern")
    });

    pub static POSITIONAL_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r":nth-(?:child|of-type|last-child|last-of-type)\(|:eq\(\d+\)|:first-child|:last-child|\[\d+\]")
            .expect("Invalid regex pattern")
    });

    pub static GENERATED_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?:#|id=.?)(?:[\w-]*\d{4,}|(?:ember|react|mui|css|jsx)-?\d+)")
            .expect("Invalid regex pattern")
    });

    /// How a locator addresses its element
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum LocatorKind {
        Id,
        TestId,
        Aria,
        Name,
        Attribute,
        Text,
        Class,
        Tag,
        XPathRelative,
        XPathAbsolute,
        Unknown,
    }

    impl LocatorKind {
        /// Baseline stability of the addressing strategy, before penalties
        pub fn base_stability(self) -> f64 {
            match self {
                LocatorKind::Id | LocatorKind::TestId => 0.95,
                LocatorKind::Aria | LocatorKind::Name => 0.85,
                LocatorKind::Attribute => 0.75,
                LocatorKind::Text => 0.7,
                LocatorKind::XPathRelative => 0.6,
                LocatorKind::Class => 0.6,
                LocatorKind::Tag => 0.4,
                LocatorKind::XPathAbsolute => 0.3,
                LocatorKind::Unknown => 0.5,
            }
        }

        /// Whether the locator relies on a purpose-built stable identifier
        pub fn is_stable_identifier(self) -> bool {
            matches!(self, LocatorKind::Id | LocatorKind::TestId | LocatorKind::Aria | LocatorKind::Name)
        }
    }

    /// Classify a locator by the strongest addressing strategy it uses
    pub fn classify(locator: &str) -> LocatorKind {
        let locator = locator.trim();

        if locator.is_empty() {
            return LocatorKind::Unknown;
        }
        if XPATH_RELATIVE_PATTERN.is_match(locator) {
            return LocatorKind::XPathRelative;
        }
        if XPATH_ABSOLUTE_PATTERN.is_match(locator) {
            return LocatorKind::XPathAbsolute;
        }
        if ID_PATTERN.is_match(locator) {
            return LocatorKind::Id;
        }
        if TEST_ID_PATTERN.is_match(locator) {
            return LocatorKind::TestId;
        }
        if ARIA_PATTERN.is_match(locator) {
            return LocatorKind::Aria;
        }
        if NAME_PATTERN.is_match(locator) {
            return LocatorKind::Name;
        }
        if locator.contains('#') {
            return LocatorKind::Id;
        }
        if ATTRIBUTE_PATTERN.is_match(locator) {
            return LocatorKind::Attribute;
        }
        if TEXT_PATTERN.is_match(locator) {
            return LocatorKind::Text;
        }
        if CLASS_PATTERN.is_match(locator) {
            return LocatorKind::Class;
        }
        if TAG_PATTERN.is_match(locator) {
            return LocatorKind::Tag;
        }

        LocatorKind::Unknown
    }

    /// True when the locator depends on element position
    pub fn is_positional(locator: &str) -> bool {
        POSITIONAL_PATTERN.is_match(locator)
    }

    /// True when the locator references an identifier that looks framework-generated
    pub fn has_generated_id(locator: &str) -> bool {
        GENERATED_ID_PATTERN.is_match(locator)
    }

    /// Number of steps (combinators or xpath segments) in the locator
    pub fn depth(locator: &str) -> usize {
        let locator = locator.trim();
        if locator.is_empty() {
            return 0;
        }

        if locator.starts_with('/') || locator.starts_with("./") {
            return locator.split('/').filter(|s| !s.is_empty() && *s != ".").count();
        }

        locator
            .split(|c: char| c.is_whitespace() || c == '>' || c == '+' || c == '~')
            .filter(|s| !s.is_empty())
            .count()
    }

    /// Brackets, parentheses and quotes are balanced
    pub fn is_balanced(locator: &str) -> bool {
        let mut stack = Vec::new();
        let mut quote: Option<char> = None;

        for c in locator.chars() {
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                continue;
            }

            match c {
                '"' | '\'' => quote = Some(c),
                '[' | '(' => stack.push(c),
                ']' => {
                    if stack.pop() != Some('[') {
                        return false;
                    }
                }
                ')' => {
                    if stack.pop() != Some('(') {
                        return false;
                    }
                }
                _ => {}
            }
        }

        stack.is_empty() && quote.is_none()
    }

    /// Stability estimate in [0, 1] for a locator
    pub fn stability_score(locator: &str) -> f64 {
        let mut score = classify(locator).base_stability();

        if is_positional(locator) {
            score *= 0.6;
        }
        if has_generated_id(locator) {
            score *= 0.5;
        }

        let depth = depth(locator);
        if depth > 4 {
            score *= 0.8;
        }

        score.clamp(0.0, 1.0)
    }
}

/// Payload content screening
pub mod content {
    use super::*;

    pub static SCRIPT_INJECTION_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)javascript:|<\s*script|\bon[a-z]+\s*=|data:text/html")
            .expect("Invalid regex pattern")
    });

    pub static SENSITIVE_KEY_PATTERN: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)pass(?:word|wd)?|secret|token|api[_-]?key|credit[_-]?card|\bcvv\b|\bssn\b|\bpin\b")
            .expect("Invalid regex pattern")
    });

    /// Value contains something a browser would execute
    pub fn contains_script(value: &str) -> bool {
        SCRIPT_INJECTION_PATTERN.is_match(value)
    }

    /// Key name suggests the value is a credential or other secret
    pub fn is_sensitive_key(key: &str) -> bool {
        SENSITIVE_KEY_PATTERN.is_match(key)
    }
}
