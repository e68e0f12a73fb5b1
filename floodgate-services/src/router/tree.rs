//! Mutable builder for the router tree.
//!
//! The builder mirrors the matcher hierarchy with nested maps keyed by
//! the deduplicating checker keys, so the same rule set produces the same
//! tree in any insertion order. `build` freezes the tree into the
//! immutable matcher chain.

use std::{collections::HashMap, rc::Rc};

use floodgate_core::{
    checker::{Checker, CheckerError},
    router::{append_key, AppendPart, AppendRule, ServiceWorker, ALL},
};

use super::matcher::{
    AppendMatcher, AppendSet, CompiledRule, HostMatcher, PathEntry, PathMatcher, PortMatcher,
};

#[derive(thiserror::Error, Debug)]
pub enum RouterBuildError {
    #[error("duplicate route: `{adding}` collides with `{existing}` (append signature `{key}`)")]
    Duplicate {
        key: String,
        existing: String,
        adding: String,
    },
    #[error("route `{id}` has an invalid pattern: {source}")]
    Pattern {
        id: String,
        #[source]
        source: CheckerError,
    },
}

struct HandlerNode {
    id: String,
    target: Rc<dyn ServiceWorker>,
    rules: Vec<(AppendPart, Checker)>,
    seq: u64,
}

struct Paths {
    checker: Checker,
    handlers: HashMap<String, HandlerNode>,
    seq: u64,
}

#[derive(Default)]
struct Hosts {
    paths: HashMap<String, Paths>,
}

#[derive(Default)]
struct Ports {
    hosts: HashMap<String, Hosts>,
}

/// Router tree builder. Port `0` registers the wildcard port.
#[derive(Default)]
pub struct Root {
    ports: HashMap<u16, Ports>,
    next_seq: u64,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: &str,
        target: Rc<dyn ServiceWorker>,
        port: u16,
        hosts: &[String],
        location: &str,
        appends: &[AppendRule],
    ) -> Result<(), RouterBuildError> {
        let checker = Checker::parse(location).map_err(|source| RouterBuildError::Pattern {
            id: id.to_string(),
            source,
        })?;
        let mut rules = Vec::with_capacity(appends.len());
        for rule in appends {
            let pattern = match rule.part {
                AppendPart::Method => rule.pattern.to_ascii_uppercase(),
                _ => rule.pattern.clone(),
            };
            let compiled =
                Checker::parse(&pattern).map_err(|source| RouterBuildError::Pattern {
                    id: id.to_string(),
                    source,
                })?;
            rules.push((rule.part.clone(), compiled));
        }

        let key = append_key(appends);
        if hosts.is_empty() {
            return self.add_host(port, ALL, id, target, checker, key, rules);
        }
        for host in hosts {
            let host = if host == ALL || host.is_empty() {
                ALL
            } else {
                host.as_str()
            };
            self.add_host(
                port,
                host,
                id,
                target.clone(),
                checker.clone(),
                key.clone(),
                rules.clone(),
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_host(
        &mut self,
        port: u16,
        host: &str,
        id: &str,
        target: Rc<dyn ServiceWorker>,
        checker: Checker,
        append_sig: String,
        rules: Vec<(AppendPart, Checker)>,
    ) -> Result<(), RouterBuildError> {
        let seq = self.next_seq;
        let hosts = self
            .ports
            .entry(port)
            .or_default()
            .hosts
            .entry(host.to_string())
            .or_default();
        let paths = hosts
            .paths
            .entry(checker.key())
            .or_insert_with(|| Paths {
                checker,
                handlers: HashMap::new(),
                seq,
            });
        if let Some(existing) = paths.handlers.get(&append_sig) {
            if existing.id != id {
                return Err(RouterBuildError::Duplicate {
                    key: append_sig,
                    existing: existing.id.clone(),
                    adding: id.to_string(),
                });
            }
        }
        paths.handlers.insert(
            append_sig,
            HandlerNode {
                id: id.to_string(),
                target,
                rules,
                seq,
            },
        );
        self.next_seq += 1;
        Ok(())
    }

    pub fn build(&self) -> PortMatcher {
        let mut exact = HashMap::new();
        let mut all = None;
        for (port, ports) in &self.ports {
            let matcher = build_hosts(ports);
            if *port == 0 {
                all = Some(matcher);
            } else {
                exact.insert(*port, matcher);
            }
        }
        PortMatcher::new(exact, all)
    }
}

fn build_hosts(ports: &Ports) -> HostMatcher {
    let mut exact = HashMap::new();
    let mut all = None;
    for (host, hosts) in &ports.hosts {
        let matcher = build_paths(hosts);
        if host == ALL {
            all = Some(matcher);
        } else {
            exact.insert(host.clone(), matcher);
        }
    }
    HostMatcher::new(exact, all)
}

fn build_paths(hosts: &Hosts) -> PathMatcher {
    let entries = hosts
        .paths
        .values()
        .map(|paths| {
            let matchers = paths
                .handlers
                .values()
                .map(|h| AppendMatcher {
                    handler_id: h.id.clone(),
                    target: h.target.clone(),
                    rules: h
                        .rules
                        .iter()
                        .map(|(part, checker)| CompiledRule {
                            part: part.clone(),
                            checker: checker.clone(),
                        })
                        .collect(),
                    seq: h.seq,
                })
                .collect();
            PathEntry {
                checker: paths.checker.clone(),
                tail: AppendSet::new(matchers),
                seq: paths.seq,
            }
        })
        .collect();
    PathMatcher::new(entries)
}
