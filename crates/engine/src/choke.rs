//! ChokeQueue (C7): weighted unchoke allocator. No teacher module maps onto
//! this directly; the bucketed weighted-fairness scheme and the pluggable
//! weight functions are this crate's own design, built to the allocation
//! rules described for the component.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::block::PeerHandle;

/// Minimum gap between choke<->unchoke transitions for a single peer,
/// unless the transition is forced by a budget change.
const TRANSITION_THROTTLE: Duration = Duration::from_secs(10);

pub type WeightFn = Box<dyn Fn(PeerHandle) -> i64 + Send + Sync>;

struct Bucket {
    members: Vec<PeerHandle>,
}

/// Implements the `allocate_slots` rule: sort by score, bucket by
/// `score / order_base`, distribute `max` slots across nonempty buckets one
/// at a time (so buckets with more members receive proportionally more
/// over several rounds), then hand any remainder out starting from a
/// randomized bucket offset so the bias doesn't always favor one end.
fn allocate_slots(
    candidates: &[(PeerHandle, i64)],
    max: usize,
    order_base: i64,
    order_max_size: usize,
) -> Vec<PeerHandle> {
    if max == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let order_base = order_base.max(1);

    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|&(_, score)| std::cmp::Reverse(score));

    let mut buckets: Vec<Bucket> = (0..order_max_size)
        .map(|_| Bucket { members: Vec::new() })
        .collect();
    for &(peer, score) in &sorted {
        let idx = ((score / order_base).max(0) as usize).min(order_max_size - 1);
        buckets[idx].members.push(peer);
    }

    let mut allocated = vec![0usize; buckets.len()];
    let mut remaining = max.min(sorted.len());
    loop {
        let mut progressed = false;
        for (i, b) in buckets.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if allocated[i] < b.members.len() {
                allocated[i] += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if remaining == 0 || !progressed {
            break;
        }
    }

    if remaining > 0 && !buckets.is_empty() {
        let offset = rand::random::<usize>() % buckets.len();
        for k in 0..buckets.len() {
            if remaining == 0 {
                break;
            }
            let i = (offset + k) % buckets.len();
            if allocated[i] < buckets[i].members.len() {
                allocated[i] += 1;
                remaining -= 1;
            }
        }
    }

    let mut result = Vec::with_capacity(max.min(sorted.len()));
    for (i, b) in buckets.iter().enumerate() {
        result.extend(b.members.iter().take(allocated[i]).copied());
    }
    result
}

pub struct ChokeQueue {
    queued: HashSet<PeerHandle>,
    unchoked: HashSet<PeerHandle>,
    snubbed: HashSet<PeerHandle>,
    interested: HashSet<PeerHandle>,
    max_unchoked: usize,
    order_base: i64,
    order_max_size: usize,
    last_transition: HashMap<PeerHandle, Instant>,
    choke_weight: WeightFn,
    unchoke_weight: WeightFn,
}

impl ChokeQueue {
    pub fn new(
        max_unchoked: usize,
        order_base: i64,
        order_max_size: usize,
        choke_weight: WeightFn,
        unchoke_weight: WeightFn,
    ) -> Self {
        ChokeQueue {
            queued: HashSet::new(),
            unchoked: HashSet::new(),
            snubbed: HashSet::new(),
            interested: HashSet::new(),
            max_unchoked,
            order_base,
            order_max_size,
            last_transition: HashMap::new(),
            choke_weight,
            unchoke_weight,
        }
    }

    pub fn max_unchoked(&self) -> usize {
        self.max_unchoked
    }

    pub fn is_unchoked(&self, peer: PeerHandle) -> bool {
        self.unchoked.contains(&peer)
    }

    pub fn is_queued(&self, peer: PeerHandle) -> bool {
        self.queued.contains(&peer)
    }

    pub fn unchoked_peers(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.unchoked.iter().copied()
    }

    pub fn set_queued(&mut self, peer: PeerHandle) {
        self.interested.insert(peer);
        if !self.unchoked.contains(&peer) {
            self.queued.insert(peer);
        }
    }

    pub fn set_not_queued(&mut self, peer: PeerHandle) {
        self.interested.remove(&peer);
        self.queued.remove(&peer);
    }

    pub fn set_snubbed(&mut self, peer: PeerHandle) {
        self.snubbed.insert(peer);
    }

    pub fn set_not_snubbed(&mut self, peer: PeerHandle) {
        self.snubbed.remove(&peer);
    }

    pub fn disconnected(&mut self, peer: PeerHandle) {
        self.queued.remove(&peer);
        self.unchoked.remove(&peer);
        self.snubbed.remove(&peer);
        self.interested.remove(&peer);
        self.last_transition.remove(&peer);
    }

    fn throttled(&self, peer: PeerHandle, now: Instant, force: bool) -> bool {
        if force {
            return false;
        }
        self.last_transition
            .get(&peer)
            .is_some_and(|t| now.duration_since(*t) < TRANSITION_THROTTLE)
    }

    fn move_to_queued(&mut self, peer: PeerHandle, now: Instant, force: bool) -> bool {
        if self.throttled(peer, now, force) {
            return false;
        }
        self.unchoked.remove(&peer);
        self.queued.insert(peer);
        self.last_transition.insert(peer, now);
        true
    }

    fn move_to_unchoked(&mut self, peer: PeerHandle, now: Instant, force: bool) -> bool {
        if self.throttled(peer, now, force) {
            return false;
        }
        self.queued.remove(&peer);
        self.unchoked.insert(peer);
        self.last_transition.insert(peer, now);
        true
    }

    /// Re-settles `unchoked`/`queued` against `max_unchoked`, choking the
    /// lowest-scoring unchoked peers or unchoking the highest-scoring
    /// queued (interested, non-snubbed) peers as needed.
    pub fn balance(&mut self) {
        let now = Instant::now();
        if self.unchoked.len() > self.max_unchoked {
            let delta = self.unchoked.len() - self.max_unchoked;
            let scored: Vec<(PeerHandle, i64)> = self
                .unchoked
                .iter()
                .map(|&p| (p, (self.choke_weight)(p)))
                .collect();
            let victims = allocate_slots(&scored, delta, self.order_base, self.order_max_size);
            for p in victims {
                // balance() is a limit-change event: the throttle exists to
                // stop the weighted allocator from flapping a peer back and
                // forth, not to block a shrinking budget from taking effect.
                self.move_to_queued(p, now, true);
            }
        } else if self.unchoked.len() < self.max_unchoked {
            let delta = self.max_unchoked - self.unchoked.len();
            let scored: Vec<(PeerHandle, i64)> = self
                .queued
                .iter()
                .filter(|p| self.interested.contains(p) && !self.snubbed.contains(p))
                .map(|&p| (p, (self.unchoke_weight)(p)))
                .collect();
            let winners = allocate_slots(&scored, delta, self.order_base, self.order_max_size);
            for p in winners {
                self.move_to_unchoked(p, now, true);
            }
        }
    }

    /// Periodic rotation: moves `max_unchoked` toward `min(quota,
    /// max_unchoked)` and alternates a bounded number of peers in and out
    /// so a consistently-winning peer doesn't permanently starve everyone
    /// else of an optimistic-unchoke slot.
    pub fn cycle(&mut self, quota: usize) {
        let now = Instant::now();
        let target = quota.min(self.max_unchoked);
        let max_alternate = (self.unchoked.len() / 10).clamp(0, self.unchoked.len());

        if max_alternate > 0 {
            let choke_scored: Vec<(PeerHandle, i64)> = self
                .unchoked
                .iter()
                .map(|&p| (p, (self.choke_weight)(p)))
                .collect();
            let rotate_out = allocate_slots(
                &choke_scored,
                max_alternate,
                self.order_base,
                self.order_max_size,
            );
            for p in &rotate_out {
                self.move_to_queued(*p, now, true);
            }

            let unchoke_scored: Vec<(PeerHandle, i64)> = self
                .queued
                .iter()
                .filter(|p| self.interested.contains(p) && !self.snubbed.contains(p))
                .map(|&p| (p, (self.unchoke_weight)(p)))
                .collect();
            let rotate_in = allocate_slots(
                &unchoke_scored,
                rotate_out.len(),
                self.order_base,
                self.order_max_size,
            );
            for p in rotate_in {
                self.move_to_unchoked(p, now, true);
            }
        }

        self.max_unchoked = target;
        self.balance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn rates() -> Mutex<HashMap<PeerHandle, i64>> {
        Mutex::new(HashMap::new())
    }

    fn queue_with_rates(max_unchoked: usize, rates: &'static Mutex<HashMap<PeerHandle, i64>>) -> ChokeQueue {
        let order_base = 1000;
        let choke: WeightFn = Box::new(move |p| {
            let rate = *rates.lock().unwrap().get(&p).unwrap_or(&0);
            order_base - 1 - rate
        });
        let unchoke: WeightFn = Box::new(move |p| {
            let rate = *rates.lock().unwrap().get(&p).unwrap_or(&0);
            order_base + rate
        });
        ChokeQueue::new(max_unchoked, order_base, 8, choke, unchoke)
    }

    #[test]
    fn test_balance_down_chokes_slowest_peers() {
        let rates: &'static Mutex<HashMap<PeerHandle, i64>> = Box::leak(Box::new(rates()));
        let peers = [PeerHandle(1), PeerHandle(2), PeerHandle(3), PeerHandle(4)];
        let speeds = [10, 20, 30, 40];
        for (p, r) in peers.iter().zip(speeds) {
            rates.lock().unwrap().insert(*p, r);
        }

        let mut q = queue_with_rates(4, rates);
        for p in peers {
            q.set_queued(p);
        }
        q.balance(); // fills up to 4 unchoked
        assert_eq!(q.unchoked_peers().count(), 4);

        q.max_unchoked = 2;
        q.balance();

        assert_eq!(q.unchoked_peers().count(), 2);
        assert!(!q.is_unchoked(PeerHandle(1)));
        assert!(!q.is_unchoked(PeerHandle(2)));
        assert!(q.is_unchoked(PeerHandle(3)));
        assert!(q.is_unchoked(PeerHandle(4)));
    }

    #[test]
    fn test_disconnected_clears_all_sets() {
        let rates: &'static Mutex<HashMap<PeerHandle, i64>> = Box::leak(Box::new(rates()));
        let mut q = queue_with_rates(2, rates);
        let p = PeerHandle(1);
        q.set_queued(p);
        q.balance();
        assert!(q.is_unchoked(p));
        q.disconnected(p);
        assert!(!q.is_unchoked(p));
        assert!(!q.is_queued(p));
    }

    #[test]
    fn test_cycle_converges_to_quota() {
        let rates: &'static Mutex<HashMap<PeerHandle, i64>> = Box::leak(Box::new(rates()));
        let peers = [PeerHandle(1), PeerHandle(2), PeerHandle(3)];
        for (i, p) in peers.iter().enumerate() {
            rates.lock().unwrap().insert(*p, i as i64 * 10);
        }
        let mut q = queue_with_rates(3, rates);
        for p in peers {
            q.set_queued(p);
        }
        q.balance();
        assert_eq!(q.unchoked_peers().count(), 3);

        q.cycle(1);
        assert_eq!(q.unchoked_peers().count(), 1);
    }
}
