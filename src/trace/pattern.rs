//! SQL-LIKE style name patterns
//!
//! `%` matches any run of characters (including none), `_` matches exactly
//! one character and everything else is literal. Matching is
//! case-sensitive and anchored at both ends, so `%AllGather%` is a substring
//! test while `ncclDevKernel_AllReduce%` is a prefix test.

use std::fmt;

use regex::Regex;

use crate::error::{MetricError, MetricResult};

/// Compiled name pattern
#[derive(Debug, Clone)]
pub struct NamePattern {
    source: String,
    // `None` matches every name
    regex: Option<Regex>,
}

impl NamePattern {
    /// Compile a LIKE pattern
    pub fn new(pattern: &str) -> MetricResult<Self> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push_str("(?s)^");
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '%' | '_' => {
                    re.push_str(&regex::escape(&literal));
                    literal.clear();
                    re.push_str(if ch == '%' { ".*" } else { "." });
                }
                _ => literal.push(ch),
            }
        }
        re.push_str(&regex::escape(&literal));
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| {
            MetricError::InvalidConfiguration(format!("bad name pattern {:?}: {}", pattern, e))
        })?;

        Ok(NamePattern {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    /// Pattern matching every name
    pub fn any() -> Self {
        NamePattern {
            source: "%".to_string(),
            regex: None,
        }
    }

    /// `<prefix>%`
    pub fn prefix(prefix: &str) -> MetricResult<Self> {
        Self::new(&format!("{}%", prefix))
    }

    /// `%<needle>%`
    pub fn contains(needle: &str) -> MetricResult<Self> {
        Self::new(&format!("%{}%", needle))
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.as_ref().map_or(true, |re| re.is_match(name))
    }

    /// Pattern text as given
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
