//! Balancing policies.
//!
//! Every policy picks from the live (healthy) subset of the current
//! snapshot except ip-hash, which hashes over the full snapshot for
//! stability and falls forward from `hash + 1` when the hashed node is
//! unhealthy. Policies run on one core; counters are plain cells.

use std::{
    cell::{Cell, RefCell},
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    net::IpAddr,
    rc::Rc,
};

use floodgate_core::discovery::Endpoint;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    WeightedRoundRobin,
    IpHash,
}

/// Inputs of one selection round.
pub(crate) struct SelectView<'a> {
    /// Full snapshot, in provider order.
    pub all: &'a [Rc<Endpoint>],
    /// Healthy subset, in snapshot order.
    pub live: &'a [Rc<Endpoint>],
    /// Snapshot version, for per-snapshot balancer state.
    pub version: u64,
    pub client_ip: Option<IpAddr>,
    pub healthy: &'a dyn Fn(&Endpoint) -> bool,
}

pub(crate) enum Balance {
    RoundRobin(RoundRobin),
    Random,
    WeightedRoundRobin(SmoothWeighted),
    IpHash,
}

impl Balance {
    pub(crate) fn new(strategy: BalanceStrategy) -> Self {
        match strategy {
            BalanceStrategy::RoundRobin => Balance::RoundRobin(RoundRobin::default()),
            BalanceStrategy::Random => Balance::Random,
            BalanceStrategy::WeightedRoundRobin => {
                Balance::WeightedRoundRobin(SmoothWeighted::default())
            }
            BalanceStrategy::IpHash => Balance::IpHash,
        }
    }

    pub(crate) fn strategy(&self) -> BalanceStrategy {
        match self {
            Balance::RoundRobin(_) => BalanceStrategy::RoundRobin,
            Balance::Random => BalanceStrategy::Random,
            Balance::WeightedRoundRobin(_) => BalanceStrategy::WeightedRoundRobin,
            Balance::IpHash => BalanceStrategy::IpHash,
        }
    }

    pub(crate) fn select(&self, view: &SelectView<'_>) -> Option<Rc<Endpoint>> {
        if view.live.is_empty() {
            return None;
        }
        match self {
            Balance::RoundRobin(rr) => rr.select(view.live),
            Balance::Random => {
                let idx = rand::thread_rng().gen_range(0..view.live.len());
                Some(view.live[idx].clone())
            }
            Balance::WeightedRoundRobin(wrr) => wrr.select(view.live, view.version),
            Balance::IpHash => ip_hash(view),
        }
    }
}

#[derive(Default)]
pub(crate) struct RoundRobin {
    next: Cell<usize>,
}

impl RoundRobin {
    fn select(&self, live: &[Rc<Endpoint>]) -> Option<Rc<Endpoint>> {
        let idx = self.next.get();
        self.next.set(idx.wrapping_add(1));
        Some(live[idx % live.len()].clone())
    }
}

#[derive(Default)]
struct WrrState {
    version: u64,
    current: Vec<i64>,
}

/// Nginx-style smooth weighted round-robin.
#[derive(Default)]
pub(crate) struct SmoothWeighted {
    state: RefCell<WrrState>,
}

impl SmoothWeighted {
    fn select(&self, live: &[Rc<Endpoint>], version: u64) -> Option<Rc<Endpoint>> {
        let mut state = self.state.borrow_mut();
        if state.version != version || state.current.len() != live.len() {
            state.version = version;
            state.current = vec![0; live.len()];
        }

        let mut total: i64 = 0;
        for (i, node) in live.iter().enumerate() {
            state.current[i] += i64::from(node.weight);
            total += i64::from(node.weight);
        }
        let best = state
            .current
            .iter()
            .enumerate()
            .max_by(|(ai, av), (bi, bv)| av.cmp(bv).then(bi.cmp(ai)))
            .map(|(i, _)| i)?;
        state.current[best] -= total;
        Some(live[best].clone())
    }
}

fn ip_hash(view: &SelectView<'_>) -> Option<Rc<Endpoint>> {
    let len = view.all.len();
    if len == 0 {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    match view.client_ip {
        Some(ip) => ip.hash(&mut hasher),
        None => 0u8.hash(&mut hasher),
    }
    let start = (hasher.finish() as usize) % len;
    // scan forward from the hashed slot until a healthy node turns up
    for offset in 0..len {
        let node = &view.all[(start + offset) % len];
        if (view.healthy)(node) {
            return Some(node.clone());
        }
    }
    None
}
