use std::sync::Arc;

use dashmap::DashMap;

use super::sre::{Breaker, BreakerConfig};

/// Independent breakers keyed by call target, created on first use.
///
/// Entries are never evicted; the key space is bounded by the methods and
/// peers a client actually calls.
#[derive(Debug, Default)]
pub struct BreakerGroup {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<Breaker>>,
}

impl BreakerGroup {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `key`, creating it if needed.
    pub fn get(&self, key: &str) -> Arc<Breaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Breaker::new(self.config.clone())))
                .value(),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breakers_are_created_lazily_and_shared() {
        let group = BreakerGroup::new(BreakerConfig::default());
        assert!(group.is_empty());

        let a1 = group.get("/greeter/Hello");
        let a2 = group.get("/greeter/Hello");
        let b = group.get("/greeter/Bye");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(group.len(), 2);
    }

    #[tokio::test]
    async fn keys_do_not_share_counts() {
        let group = BreakerGroup::new(BreakerConfig {
            min_requests: 1,
            ..BreakerConfig::default()
        });
        for _ in 0..100 {
            group.get("bad").mark_failed();
            group.get("good").mark_success();
        }
        assert!(group.get("bad").reject_probability() > 0.9);
        assert!(group.get("good").reject_probability().abs() < f64::EPSILON);
    }
}
