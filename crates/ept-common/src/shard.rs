//! Deterministic shard routing.
//!
//! All events for one endpoint must land on the same worker so that they are
//! merged in arrival order without cross-worker locking. The shard key is
//! hashed with xxh3 (stable across processes and runs) and reduced modulo
//! the number of live workers, which are kept sorted by id.

use xxhash_rust::xxh3::xxh3_64;

/// Stable 64-bit hash of a shard key.
pub fn shard_hash(shard: &str) -> u64 {
    xxh3_64(shard.as_bytes())
}

/// Maps shard keys onto an ordered set of members.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardRouter {
    members: Vec<String>,
}

impl ShardRouter {
    /// Creates a router over the given members (order is normalized).
    pub fn new(members: impl IntoIterator<Item = String>) -> Self {
        let mut router = Self::default();
        router.update(members);
        router
    }

    /// Replaces the member set.
    pub fn update(&mut self, members: impl IntoIterator<Item = String>) {
        let mut members: Vec<String> = members.into_iter().collect();
        members.sort();
        members.dedup();
        self.members = members;
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true if there are no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the members in routing order.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Returns the member owning `shard`, if any member exists.
    pub fn route(&self, shard: &str) -> Option<&str> {
        if self.members.is_empty() {
            return None;
        }
        let slot = (shard_hash(shard) % self.members.len() as u64) as usize;
        Some(self.members[slot].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_shard_same_member() {
        let router = ShardRouter::new(vec!["w3".into(), "w1".into(), "w2".into()]);
        let first = router.route("10.0.0.5").map(str::to_string);
        for _ in 0..100 {
            assert_eq!(router.route("10.0.0.5").map(str::to_string), first);
        }
    }

    #[test]
    fn test_member_order_is_normalized() {
        let a = ShardRouter::new(vec!["w2".into(), "w1".into()]);
        let b = ShardRouter::new(vec!["w1".into(), "w2".into(), "w1".into()]);
        assert_eq!(a, b);
        assert_eq!(a.route("00:11:22:33:44:55"), b.route("00:11:22:33:44:55"));
    }

    #[test]
    fn test_empty_router() {
        let router = ShardRouter::default();
        assert!(router.route("10.0.0.1").is_none());
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(shard_hash("10.0.0.5"), shard_hash("10.0.0.5"));
        assert_ne!(shard_hash("10.0.0.5"), shard_hash("10.0.0.6"));
    }

    #[test]
    fn test_spreads_across_members() {
        let router = ShardRouter::new((0..4).map(|i| format!("w{}", i)));
        let mut seen = std::collections::HashSet::new();
        for i in 0..256 {
            if let Some(m) = router.route(&format!("10.0.{}.{}", i / 16, i % 16)) {
                seen.insert(m.to_string());
            }
        }
        assert_eq!(seen.len(), 4);
    }
}
