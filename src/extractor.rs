//! Verification-code extraction from a message body
//!
//! Applies an ordered list of regex rules to the plaintext body of a message
//! and returns the first one whose capture resolves. Rules are compiled once
//! at config-load time and are immutable for the process lifetime.

use regex::Regex;

use crate::errors::ExtractError;

/// How a rule's match is turned into the extracted code.
#[derive(Debug, Clone)]
pub enum Capture {
    /// A named capture group, e.g. `(?P<code>...)`.
    Named(String),
    /// A positional submatch index (0 is the whole match).
    Indexed(usize),
}

/// A single regex rule plus the capture it resolves to.
#[derive(Debug, Clone)]
pub struct ExtractorRule {
    pub pattern: Regex,
    pub capture: Capture,
}

impl ExtractorRule {
    pub fn new(pattern: Regex, capture: Capture) -> Self {
        Self { pattern, capture }
    }

    /// Try this rule against `body`, returning the captured text if the rule
    /// matched and its capture resolved.
    fn try_match<'b>(&self, body: &'b str) -> Option<&'b str> {
        let captures = self.pattern.captures(body)?;
        match &self.capture {
            Capture::Named(name) => captures.name(name).map(|m| m.as_str()),
            Capture::Indexed(index) => captures.get(*index).map(|m| m.as_str()),
        }
    }
}

/// A code pulled out of a message body, paired with the sender who sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeEvent {
    pub sender: String,
    pub code: String,
}

/// Applies ordered `rules` to `body` and returns the first resolved match.
///
/// `sender` is the envelope's first `From` address, or an empty string if the
/// envelope had none. Rules are tried strictly in order; the first rule whose
/// capture resolves wins, even if a later rule would also match.
pub fn extract(body: &[u8], sender: &str, rules: &[ExtractorRule]) -> Result<CodeEvent, ExtractError> {
    let text = std::str::from_utf8(body)
        .map(std::borrow::Cow::Borrowed)
        .unwrap_or_else(|_| String::from_utf8_lossy(body));

    for rule in rules {
        if let Some(code) = rule.try_match(&text) {
            return Ok(CodeEvent {
                sender: sender.to_owned(),
                code: code.to_owned(),
            });
        }
    }

    Err(ExtractError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, capture: Capture) -> ExtractorRule {
        ExtractorRule::new(Regex::new(pattern).unwrap(), capture)
    }

    #[test]
    fn extracts_indexed_capture() {
        let rules = vec![rule(r"code:\s*(\d{6})", Capture::Indexed(1))];
        let event = extract(
            b"Your code: 482913 \xe2\x80\x94 expires soon",
            "alice@example.com",
            &rules,
        )
        .expect("should extract");
        assert_eq!(event.sender, "alice@example.com");
        assert_eq!(event.code, "482913");
    }

    #[test]
    fn extracts_named_capture() {
        let rules = vec![rule(
            r"(?P<c>[A-Z0-9]{8})",
            Capture::Named("c".to_owned()),
        )];
        let event = extract(b"Token ABCD1234 valid 10m", "", &rules).expect("should extract");
        assert_eq!(event.code, "ABCD1234");
    }

    #[test]
    fn no_match_returns_not_found() {
        let rules = vec![rule(r"code:\s*(\d{6})", Capture::Indexed(1))];
        let result = extract(b"Welcome!", "", &rules);
        assert_eq!(result, Err(ExtractError::NotFound));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule(r"no-such-token-(\d+)", Capture::Indexed(1)),
            rule(r"code:\s*(\d{6})", Capture::Indexed(1)),
            rule(r"(\d{6})", Capture::Indexed(1)),
        ];
        let event = extract(b"code: 111222 other 999888", "", &rules).expect("should extract");
        assert_eq!(event.code, "111222");
    }

    #[test]
    fn named_group_absent_from_pattern_falls_through_to_next_rule() {
        let rules = vec![
            rule(r"(?P<other>\d+)", Capture::Named("missing".to_owned())),
            rule(r"(\d{4})", Capture::Indexed(1)),
        ];
        let event = extract(b"9999", "", &rules).expect("should extract");
        assert_eq!(event.code, "9999");
    }

    #[test]
    fn deterministic_across_repeated_calls() {
        let rules = vec![rule(r"(?P<c>[A-Z0-9]{8})", Capture::Named("c".to_owned()))];
        let body = b"Token ABCD1234 valid 10m";
        let first = extract(body, "", &rules).unwrap();
        let second = extract(body, "", &rules).unwrap();
        assert_eq!(first, second);
    }
}
