//! Canonical host map, keyed by address

use lynx_common::{DiscoveryMethod, HostRecord};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// Address-keyed host map. Owned by a single writer, the merge loop.
#[derive(Debug, Default)]
pub struct HostTable {
    hosts: HashMap<IpAddr, HostRecord>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a partial record. Returns the new canonical record if anything
    /// changed, `None` for a duplicate.
    pub fn merge(&mut self, record: HostRecord) -> Option<HostRecord> {
        match self.hosts.get_mut(&record.address) {
            Some(existing) => existing.merge(&record).then(|| existing.clone()),
            None => {
                self.hosts.insert(record.address, record.clone());
                Some(record)
            }
        }
    }

    pub fn get(&self, address: &IpAddr) -> Option<&HostRecord> {
        self.hosts.get(address)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Addresses with no hostname yet.
    pub fn unnamed(&self) -> Vec<IpAddr> {
        self.hosts
            .values()
            .filter(|h| h.hostname.is_none())
            .map(|h| h.address)
            .collect()
    }

    /// Hosts each method contributed to.
    pub fn per_method(&self) -> BTreeMap<DiscoveryMethod, usize> {
        let mut counts = BTreeMap::new();
        for method in self.hosts.values().flat_map(|h| h.methods.iter()) {
            *counts.entry(*method).or_insert(0) += 1;
        }
        counts
    }

    /// Canonical records in address order.
    pub fn into_sorted(self) -> Vec<HostRecord> {
        let mut hosts: Vec<HostRecord> = self.hosts.into_values().collect();
        hosts.sort_by(|a, b| a.address.cmp(&b.address));
        hosts
    }
}
