use arc_swap::ArcSwap;
use rand::Rng;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use crate::{types::ChainRef, upstream::endpoint::Endpoint};

/// Prefix sums of the weights of healthy members.
#[derive(Default)]
struct WeightTable {
    cumulative: Vec<u64>,
    members: Vec<Arc<Endpoint>>,
}

impl WeightTable {
    fn build(members: &[Arc<Endpoint>]) -> Self {
        let mut total = 0u64;
        let mut table = Self::default();
        for endpoint in members.iter().filter(|e| e.is_healthy()) {
            total = total.saturating_add(endpoint.weight());
            table.cumulative.push(total);
            table.members.push(endpoint.clone());
        }
        table
    }

    fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }
}

/// All endpoints serving one chain, plus the aggregate state used to choose among them.
///
/// Member list and weight table are immutable snapshots swapped atomically; the rotation
/// cursor and the max tip height are atomics. Selection never takes a lock and never sees a
/// half-updated aggregate. Only the sync updater writes the weight table and the max tip.
pub struct EndpointSet {
    chain: ChainRef,
    members: ArcSwap<Vec<Arc<Endpoint>>>,
    weights: ArcSwap<WeightTable>,
    cursor: AtomicUsize,
    max_tip_height: AtomicU64,
}

impl EndpointSet {
    #[must_use]
    pub fn new(chain: ChainRef) -> Self {
        Self {
            chain,
            members: ArcSwap::from_pointee(Vec::new()),
            weights: ArcSwap::from_pointee(WeightTable::default()),
            cursor: AtomicUsize::new(0),
            max_tip_height: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn chain(&self) -> &ChainRef {
        &self.chain
    }

    #[must_use]
    pub fn members(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.members.load_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.load().is_empty()
    }

    #[must_use]
    pub fn max_tip_height(&self) -> u64 {
        self.max_tip_height.load(Ordering::Acquire)
    }

    /// Appends a member, folding its tip and weight into the aggregates.
    pub(crate) fn push(&self, endpoint: Arc<Endpoint>) {
        self.members.rcu(|current| {
            let mut next = (**current).clone();
            next.push(endpoint.clone());
            next
        });
        self.raise_max_tip(endpoint.tip_height());
        self.rebuild_weights();
    }

    /// Round-robin over members that are healthy and support `method`.
    ///
    /// Examines at most one full rotation starting at the shared cursor.
    #[must_use]
    pub fn select(&self, method: &str) -> Option<Arc<Endpoint>> {
        self.rotate(|endpoint| endpoint.is_healthy() && endpoint.supports(method))
    }

    /// Like [`select`](Self::select), additionally requiring a minimum tip height.
    ///
    /// A non-negative `height_spec` is an absolute minimum. A negative one is relative to the
    /// freshest known tip: `-5` means "at most five blocks behind". Endpoints without a tip
    /// count as height zero.
    #[must_use]
    pub fn select_over_height(&self, method: &str, height_spec: i64) -> Option<Arc<Endpoint>> {
        let threshold = self.height_threshold(height_spec);
        self.rotate(|endpoint| {
            endpoint.is_healthy() && endpoint.supports(method) && endpoint.tip_height() >= threshold
        })
    }

    /// Resolves a height spec into an absolute minimum height.
    #[must_use]
    pub fn height_threshold(&self, height_spec: i64) -> u64 {
        if height_spec >= 0 {
            height_spec.unsigned_abs()
        } else {
            self.max_tip_height().saturating_sub(height_spec.unsigned_abs())
        }
    }

    fn rotate(&self, eligible: impl Fn(&Endpoint) -> bool) -> Option<Arc<Endpoint>> {
        let members = self.members.load();
        if members.is_empty() {
            return None;
        }

        let count = members.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        for offset in 0..count {
            let endpoint = &members[(start + offset) % count];
            if eligible(endpoint) {
                return Some(endpoint.clone());
            }
        }

        tracing::trace!(chain = %self.chain, candidates = count, "no eligible endpoint");
        None
    }

    /// Upper-bound search in the weight table: the first healthy member whose cumulative
    /// weight is strictly greater than `x`.
    #[must_use]
    pub fn weight_search(&self, x: i64) -> Option<Arc<Endpoint>> {
        let table = self.weights.load();
        let x = u64::try_from(x).ok()?;
        if table.total() == 0 {
            return None;
        }
        let index = table.cumulative.partition_point(|cumulative| *cumulative <= x);
        table.members.get(index).cloned()
    }

    /// Picks a healthy member with probability proportional to its weight.
    #[must_use]
    pub fn weighted_random(&self) -> Option<Arc<Endpoint>> {
        let total = self.weights.load().total();
        if total == 0 {
            return None;
        }
        let x = rand::rng().random_range(0..total);
        self.weight_search(i64::try_from(x).ok()?)
    }

    /// Total weight of healthy members.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.weights.load().total()
    }

    pub(crate) fn rebuild_weights(&self) {
        let members = self.members.load();
        self.weights.store(Arc::new(WeightTable::build(&members)));
    }

    pub(crate) fn raise_max_tip(&self, height: u64) {
        self.max_tip_height.fetch_max(height, Ordering::AcqRel);
    }

    /// Recomputes the max tip from every member. Returns the new value.
    pub(crate) fn rescan_max_tip(&self) -> u64 {
        let max = self.members.load().iter().map(|e| e.tip_height()).max().unwrap_or(0);
        self.max_tip_height.store(max, Ordering::Release);
        max
    }
}
