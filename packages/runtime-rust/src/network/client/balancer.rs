//! Address selection over a resolved, weighted address list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::discovery::Address;
use crate::network::config::BalancerPolicy;

/// Picks one address per call according to a [`BalancerPolicy`].
///
/// The address list is passed on every pick, so a resolver update takes
/// effect on the next call. Weighted state for addresses that disappear is
/// dropped.
#[derive(Debug)]
pub struct Balancer {
    policy: BalancerPolicy,
    next: AtomicUsize,
    current: Mutex<HashMap<String, i64>>,
}

impl Balancer {
    #[must_use]
    pub fn new(policy: BalancerPolicy) -> Self {
        Self {
            policy,
            next: AtomicUsize::new(0),
            current: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> BalancerPolicy {
        self.policy
    }

    pub fn pick(&self, addresses: &[Address]) -> Option<Address> {
        if addresses.is_empty() {
            return None;
        }
        match self.policy {
            BalancerPolicy::RoundRobin => {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % addresses.len();
                Some(addresses[i].clone())
            }
            BalancerPolicy::WeightedRoundRobin => self.pick_weighted(addresses),
        }
    }

    /// Smooth weighted round robin: every pick raises each address by its
    /// weight, takes the highest, and lowers the winner by the total.
    fn pick_weighted(&self, addresses: &[Address]) -> Option<Address> {
        let mut current = self.current.lock();
        current.retain(|addr, _| addresses.iter().any(|a| &a.addr == addr));

        let total: i64 = addresses.iter().map(|a| i64::from(a.weight)).sum();
        let mut best: Option<(&Address, i64)> = None;
        for address in addresses {
            let score = current.entry(address.addr.clone()).or_insert(0);
            *score += i64::from(address.weight);
            if best.is_none_or(|(_, top)| *score > top) {
                best = Some((address, *score));
            }
        }

        let (chosen, _) = best?;
        if let Some(score) = current.get_mut(&chosen.addr) {
            *score -= total;
        }
        Some(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: &str, weight: u32) -> Address {
        Address::new(a, weight, "rpc")
    }

    fn picks(balancer: &Balancer, addresses: &[Address], n: usize) -> Vec<String> {
        (0..n)
            .map(|_| balancer.pick(addresses).unwrap().addr)
            .collect()
    }

    #[test]
    fn empty_list_yields_nothing() {
        assert!(Balancer::new(BalancerPolicy::RoundRobin).pick(&[]).is_none());
        assert!(Balancer::new(BalancerPolicy::WeightedRoundRobin).pick(&[]).is_none());
    }

    #[test]
    fn round_robin_cycles() {
        let b = Balancer::new(BalancerPolicy::RoundRobin);
        let list = [addr("a", 1), addr("b", 100), addr("c", 1)];
        assert_eq!(picks(&b, &list, 6), vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn smooth_weighted_interleaves() {
        let b = Balancer::new(BalancerPolicy::WeightedRoundRobin);
        let list = [addr("a", 5), addr("b", 1), addr("c", 1)];
        assert_eq!(
            picks(&b, &list, 7),
            vec!["a", "a", "b", "a", "c", "a", "a"]
        );
    }

    #[test]
    fn weighted_share_follows_weights() {
        let b = Balancer::new(BalancerPolicy::WeightedRoundRobin);
        let list = [addr("heavy", 300), addr("light", 100)];
        let chosen = picks(&b, &list, 400);
        let heavy = chosen.iter().filter(|a| *a == "heavy").count();
        assert_eq!(heavy, 300);
    }

    #[test]
    fn removed_addresses_are_forgotten() {
        let b = Balancer::new(BalancerPolicy::WeightedRoundRobin);
        picks(&b, &[addr("a", 1), addr("b", 1)], 3);
        let only = [addr("b", 1)];
        assert_eq!(picks(&b, &only, 2), vec!["b", "b"]);
        assert_eq!(b.current.lock().len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn one_weighted_cycle_honours_every_weight(
            weights in proptest::collection::vec(1u32..20, 1..6)
        ) {
            let b = Balancer::new(BalancerPolicy::WeightedRoundRobin);
            let list: Vec<Address> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| addr(&format!("h{i}"), *w))
                .collect();
            let total: u32 = weights.iter().sum();
            let chosen = picks(&b, &list, total as usize);
            for (i, w) in weights.iter().enumerate() {
                let name = format!("h{i}");
                let count = chosen.iter().filter(|a| **a == name).count();
                proptest::prop_assert_eq!(count, *w as usize);
            }
        }
    }
}
