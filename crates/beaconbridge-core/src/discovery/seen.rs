use crate::ble::PeerObservation;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::SystemTime;

/// 本次会话已投递过的对端，地址 -> 最近一次观测时间
///
/// 生命周期与一次 Active 期相同，每次停止时清空。
#[derive(Debug, Default)]
pub struct SeenPeerSet {
    peers: HashMap<String, SystemTime>,
}

impl SeenPeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次观测，首次见到该地址时返回 `true`
    pub fn record(&mut self, observation: &PeerObservation) -> bool {
        match self.peers.entry(observation.address.clone()) {
            Entry::Occupied(mut entry) => {
                if observation.observed_at > *entry.get() {
                    entry.insert(observation.observed_at);
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(observation.observed_at);
                true
            }
        }
    }

    pub fn last_seen(&self, address: &str) -> Option<SystemTime> {
        self.peers.get(address).copied()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.peers.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_sighting_only() {
        let mut seen = SeenPeerSet::new();
        let observation = PeerObservation::new("AA:BB:CC:DD:EE:FF");

        assert!(seen.record(&observation));
        assert!(!seen.record(&observation));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_repeat_refreshes_timestamp() {
        let mut seen = SeenPeerSet::new();
        let first = PeerObservation::new("AA:BB:CC:DD:EE:FF");
        let mut later = first.clone();
        later.observed_at = first.observed_at + Duration::from_secs(5);

        seen.record(&first);
        seen.record(&later);
        assert_eq!(seen.last_seen("AA:BB:CC:DD:EE:FF"), Some(later.observed_at));

        // 乱序到达的旧观测不会回退时间戳
        seen.record(&first);
        assert_eq!(seen.last_seen("AA:BB:CC:DD:EE:FF"), Some(later.observed_at));
    }

    #[test]
    fn test_clear_forgets_peers() {
        let mut seen = SeenPeerSet::new();
        seen.record(&PeerObservation::new("11:22:33:44:55:66"));
        seen.clear();

        assert!(seen.is_empty());
        assert!(!seen.contains("11:22:33:44:55:66"));
        assert!(seen.record(&PeerObservation::new("11:22:33:44:55:66")));
    }
}
