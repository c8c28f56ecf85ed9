//! Host identity and replica sets

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-unique host identifier. Lower ids win mastership ties.
pub type HostId = u32;

/// Partition identifier within a table
pub type PartitionId = u32;

/// Name of the coordination group shared by every replica of one partition
/// of one table.
pub fn export_group(partition: PartitionId, signature: &str) -> String {
    format!("export/{}/{}", signature, partition)
}

/// Other replicas of a partition, kept sorted and free of the local host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    local: HostId,
    peers: Vec<HostId>,
}

impl ReplicaSet {
    pub fn new(local: HostId) -> Self {
        Self {
            local,
            peers: Vec::new(),
        }
    }

    /// Replace the peer list; the local host and duplicates are dropped
    pub fn update(&mut self, hosts: impl IntoIterator<Item = HostId>) {
        let mut peers: Vec<HostId> = hosts.into_iter().filter(|h| *h != self.local).collect();
        peers.sort_unstable();
        peers.dedup();
        self.peers = peers;
    }

    pub fn local(&self) -> HostId {
        self.local
    }

    pub fn peers(&self) -> &[HostId] {
        &self.peers
    }

    pub fn contains(&self, host: HostId) -> bool {
        self.peers.binary_search(&host).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl fmt::Display for ReplicaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.local, self.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_set_excludes_local() {
        let mut set = ReplicaSet::new(2);
        set.update([3, 2, 1, 3]);
        assert_eq!(set.peers(), &[1, 3]);
        assert!(set.contains(3));
        assert!(!set.contains(2));

        set.update([2]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_export_group_name() {
        assert_eq!(export_group(4, "orders"), "export/orders/4");
    }
}
