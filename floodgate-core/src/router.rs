//! Routing contracts shared between the router tree and its drivers.

use async_trait::async_trait;

use crate::{context::Context, worker::Worker};

/// Wildcard key at every router tree level. Exact keys always win over it.
pub const ALL: &str = "*";

/// Terminal route target; implemented by service workers.
#[async_trait(?Send)]
pub trait ServiceHandler {
    async fn handle(&self, ctx: &mut Context);
}

/// A worker exposing the service capability.
pub trait ServiceWorker: Worker + ServiceHandler {}
impl<T: Worker + ServiceHandler> ServiceWorker for T {}

/// Dimension an append rule predicates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendPart {
    Header(String),
    Query(String),
    Method,
}

/// A predicate narrowing a path match by header, query parameter or
/// method. Methods compare case-insensitively and `*` accepts any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRule {
    pub part: AppendPart,
    pub pattern: String,
}

impl AppendRule {
    pub fn header(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            part: AppendPart::Header(name.into()),
            pattern: pattern.into(),
        }
    }

    pub fn query(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            part: AppendPart::Query(name.into()),
            pattern: pattern.into(),
        }
    }

    pub fn method(pattern: impl Into<String>) -> Self {
        Self {
            part: AppendPart::Method,
            pattern: pattern.into(),
        }
    }
}

/// Canonical signature of an append rule set. Handlers registered at the
/// same (port, host, path) collide exactly when their signatures match,
/// regardless of rule order.
pub fn append_key(rules: &[AppendRule]) -> String {
    if rules.is_empty() {
        return "-".to_string();
    }
    let mut tokens: Vec<String> = rules
        .iter()
        .map(|r| match &r.part {
            AppendPart::Header(name) => {
                format!("header:{}={}", name.to_ascii_lowercase(), r.pattern)
            }
            AppendPart::Query(name) => format!("query:{}={}", name, r.pattern),
            AppendPart::Method => format!("method={}", r.pattern.to_ascii_uppercase()),
        })
        .collect();
    tokens.sort();
    tokens.join(";")
}

/// Dimensions of an inbound request the matcher inspects.
pub trait MatchInput {
    fn port(&self) -> u16;
    fn host(&self) -> &str;
    fn path(&self) -> &str;
    fn method(&self) -> &str;
    fn header(&self, name: &str) -> Option<&str>;
    fn query(&self, name: &str) -> Option<String>;
}

impl MatchInput for Context {
    fn port(&self) -> u16 {
        Context::port(self)
    }

    fn host(&self) -> &str {
        Context::host(self)
    }

    fn path(&self) -> &str {
        self.request().uri().path()
    }

    fn method(&self) -> &str {
        self.request().method().as_str()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.request()
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    fn query(&self, name: &str) -> Option<String> {
        self.request_query(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_key_is_order_insensitive() {
        let a = vec![
            AppendRule::header("X-Env", "prod"),
            AppendRule::query("v", "2"),
            AppendRule::method("get"),
        ];
        let b = vec![
            AppendRule::method("GET"),
            AppendRule::header("x-env", "prod"),
            AppendRule::query("v", "2"),
        ];
        assert_eq!(append_key(&a), append_key(&b));
    }

    #[test]
    fn empty_rule_set_has_stable_key() {
        assert_eq!(append_key(&[]), "-");
        assert_ne!(append_key(&[]), append_key(&[AppendRule::method("*")]));
    }
}
