//! Pattern checkers used by the router.
//!
//! A checker is compiled from a pattern string and classifies into one of
//! six kinds. Two grammars are accepted and produce identical checkers:
//!
//! - star grammar: `literal`, `prefix*`, `*suffix`, `*contains*`, `*`
//! - operator grammar: `= literal`, `~ prefix`, `~$ suffix`, `~* contains`
//!
//! `re:REGEX` compiles a regular expression in both grammars. An empty
//! pattern is the wildcard. [`Checker::key`] returns a stable identifier
//! used to deduplicate sibling checkers at the same router tree level.

use regex::Regex;

/// Match kind of a compiled checker, ordered by descending specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckType {
    Equal,
    Prefix,
    Suffix,
    Contains,
    Regex,
    All,
}

#[derive(Debug, Clone)]
pub enum Checker {
    All,
    Equal(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(RegexChecker),
}

#[derive(Debug, Clone)]
pub struct RegexChecker {
    pattern: String,
    re: Regex,
}

#[derive(thiserror::Error, Debug)]
pub enum CheckerError {
    #[error("invalid regex pattern `{0}`: {1}")]
    InvalidRegex(String, regex::Error),
}

impl Checker {
    pub fn parse(pattern: &str) -> Result<Self, CheckerError> {
        let p = pattern.trim();
        if p.is_empty() || p == "*" {
            return Ok(Checker::All);
        }
        if let Some(re) = p.strip_prefix("re:") {
            let re = re.trim();
            let compiled = Regex::new(re)
                .map_err(|e| CheckerError::InvalidRegex(re.to_string(), e))?;
            return Ok(Checker::Regex(RegexChecker {
                pattern: re.to_string(),
                re: compiled,
            }));
        }
        if let Some(rest) = p.strip_prefix("~*") {
            return Ok(Checker::Contains(rest.trim().to_string()));
        }
        if let Some(rest) = p.strip_prefix("~$") {
            return Ok(Checker::Suffix(rest.trim().to_string()));
        }
        if let Some(rest) = p.strip_prefix('~') {
            return Ok(Checker::Prefix(rest.trim().to_string()));
        }
        if let Some(rest) = p.strip_prefix('=') {
            return Ok(Checker::Equal(rest.trim().to_string()));
        }

        let starts = p.starts_with('*');
        let ends = p.ends_with('*');
        Ok(match (starts, ends) {
            (true, true) => Checker::Contains(p[1..p.len() - 1].to_string()),
            (false, true) => Checker::Prefix(p[..p.len() - 1].to_string()),
            (true, false) => Checker::Suffix(p[1..].to_string()),
            (false, false) => Checker::Equal(p.to_string()),
        })
    }

    pub fn check_type(&self) -> CheckType {
        match self {
            Checker::All => CheckType::All,
            Checker::Equal(_) => CheckType::Equal,
            Checker::Prefix(_) => CheckType::Prefix,
            Checker::Suffix(_) => CheckType::Suffix,
            Checker::Contains(_) => CheckType::Contains,
            Checker::Regex(_) => CheckType::Regex,
        }
    }

    /// The literal (or regex source) the checker was built from.
    pub fn value(&self) -> &str {
        match self {
            Checker::All => "",
            Checker::Equal(v)
            | Checker::Prefix(v)
            | Checker::Suffix(v)
            | Checker::Contains(v) => v,
            Checker::Regex(r) => &r.pattern,
        }
    }

    /// Stable key deduplicating equivalent checkers.
    pub fn key(&self) -> String {
        match self {
            Checker::All => "*".to_string(),
            Checker::Equal(v) => format!("={v}"),
            Checker::Prefix(v) => format!("~{v}"),
            Checker::Suffix(v) => format!("~${v}"),
            Checker::Contains(v) => format!("~*{v}"),
            Checker::Regex(r) => format!("re:{}", r.pattern),
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Checker::All => true,
            Checker::Equal(v) => value == v,
            Checker::Prefix(v) => value.starts_with(v.as_str()),
            Checker::Suffix(v) => value.ends_with(v.as_str()),
            Checker::Contains(v) => value.contains(v.as_str()),
            Checker::Regex(r) => r.re.is_match(value),
        }
    }
}
