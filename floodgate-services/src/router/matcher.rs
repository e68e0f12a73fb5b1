//! Immutable matcher chain served to requests.
//!
//! One matcher tree is built per configuration epoch and swapped in as a
//! whole; requests only ever observe a complete tree. Matching walks
//! port → host → path → append rules and yields at most one handler.

use std::{cmp::Reverse, collections::HashMap, rc::Rc};

use floodgate_core::{
    checker::{CheckType, Checker},
    router::{AppendPart, MatchInput, ServiceWorker},
};

pub(crate) struct CompiledRule {
    pub(crate) part: AppendPart,
    pub(crate) checker: Checker,
}

impl CompiledRule {
    fn accepts(&self, input: &dyn MatchInput) -> bool {
        match &self.part {
            AppendPart::Header(name) => {
                let value = input.header(name).unwrap_or("");
                self.checker.is_match(value)
            }
            AppendPart::Query(name) => {
                let value = input.query(name).unwrap_or_default();
                self.checker.is_match(&value)
            }
            AppendPart::Method => self.checker.is_match(input.method()),
        }
    }
}

pub(crate) struct AppendMatcher {
    pub(crate) handler_id: String,
    pub(crate) target: Rc<dyn ServiceWorker>,
    pub(crate) rules: Vec<CompiledRule>,
    pub(crate) seq: u64,
}

/// Candidates of one path node, most specific (most rules) first.
#[derive(Default)]
pub(crate) struct AppendSet {
    matchers: Vec<AppendMatcher>,
}

impl AppendSet {
    pub(crate) fn new(mut matchers: Vec<AppendMatcher>) -> Self {
        matchers.sort_by_key(|m| (Reverse(m.rules.len()), m.seq));
        Self { matchers }
    }

    fn find(&self, input: &dyn MatchInput) -> Option<&AppendMatcher> {
        self.matchers
            .iter()
            .find(|m| m.rules.iter().all(|r| r.accepts(input)))
    }
}

pub(crate) struct PathEntry {
    pub(crate) checker: Checker,
    pub(crate) tail: AppendSet,
    pub(crate) seq: u64,
}

pub(crate) struct PathMatcher {
    equals: HashMap<String, AppendSet>,
    checkers: Vec<PathEntry>,
    all: Option<AppendSet>,
}

fn specificity(kind: CheckType) -> u8 {
    match kind {
        CheckType::Equal => 0,
        CheckType::Prefix => 1,
        CheckType::Suffix => 2,
        CheckType::Contains => 3,
        CheckType::Regex => 4,
        CheckType::All => 5,
    }
}

impl PathMatcher {
    pub(crate) fn new(entries: Vec<PathEntry>) -> Self {
        let mut equals = HashMap::new();
        let mut checkers = Vec::new();
        let mut all = None;
        for entry in entries {
            match entry.checker.check_type() {
                CheckType::Equal => {
                    equals.insert(entry.checker.value().to_string(), entry.tail);
                }
                CheckType::All => all = Some(entry.tail),
                _ => checkers.push(entry),
            }
        }
        checkers.sort_by_key(|e| {
            (
                specificity(e.checker.check_type()),
                Reverse(e.checker.value().len()),
                e.seq,
            )
        });
        Self {
            equals,
            checkers,
            all,
        }
    }

    fn find(&self, input: &dyn MatchInput) -> Option<&AppendMatcher> {
        let path = input.path();
        let tail = if let Some(tail) = self.equals.get(path) {
            tail
        } else if let Some(entry) = self
            .checkers
            .iter()
            .find(|e| e.checker.is_match(path))
        {
            &entry.tail
        } else {
            self.all.as_ref()?
        };
        tail.find(input)
    }
}

pub(crate) struct HostMatcher {
    exact: HashMap<String, PathMatcher>,
    all: Option<PathMatcher>,
}

impl HostMatcher {
    pub(crate) fn new(exact: HashMap<String, PathMatcher>, all: Option<PathMatcher>) -> Self {
        Self { exact, all }
    }

    fn find(&self, input: &dyn MatchInput) -> Option<&AppendMatcher> {
        self.exact
            .get(input.host())
            .or(self.all.as_ref())?
            .find(input)
    }
}

#[derive(Default)]
pub struct PortMatcher {
    exact: HashMap<u16, HostMatcher>,
    all: Option<HostMatcher>,
}

impl PortMatcher {
    pub(crate) fn new(exact: HashMap<u16, HostMatcher>, all: Option<HostMatcher>) -> Self {
        Self { exact, all }
    }

    pub fn find(&self, input: &dyn MatchInput) -> Option<Rc<dyn ServiceWorker>> {
        self.find_entry(input).map(|m| m.target.clone())
    }

    /// Matched handler id, mostly for logs and tests.
    pub fn find_handler_id(&self, input: &dyn MatchInput) -> Option<&str> {
        self.find_entry(input).map(|m| m.handler_id.as_str())
    }

    fn find_entry(&self, input: &dyn MatchInput) -> Option<&AppendMatcher> {
        self.exact
            .get(&input.port())
            .or(self.all.as_ref())?
            .find(input)
    }
}
