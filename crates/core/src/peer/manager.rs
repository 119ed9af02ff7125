use crate::identity::{NodeId, PublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// A verified overlay peer that can be used as a hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: SocketAddr,
    pub public_key: PublicKey,
    pub node_id: NodeId,
}

impl Candidate {
    pub fn new(address: SocketAddr, public_key: PublicKey) -> Self {
        Self {
            address,
            public_key,
            node_id: NodeId::from_public_key(&public_key),
        }
    }
}

#[derive(Debug, Clone)]
struct CandidateEntry {
    candidate: Candidate,
    last_seen: Instant,
}

/// Table of overlay candidates, fed by the discovery layer
#[derive(Debug)]
pub struct CandidateManager {
    candidates: HashMap<SocketAddr, CandidateEntry>,

    /// Maximum number of candidates to keep
    max_candidates: usize,
}

impl CandidateManager {
    pub fn new(max_candidates: usize) -> Self {
        Self {
            candidates: HashMap::new(),
            max_candidates,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Check if we have room for more candidates
    pub fn has_capacity(&self) -> bool {
        self.len() < self.max_candidates
    }

    /// Add or refresh a candidate; returns false when the table is full
    pub fn add_candidate(&mut self, candidate: Candidate, now: Instant) -> bool {
        if let Some(entry) = self.candidates.get_mut(&candidate.address) {
            entry.candidate = candidate;
            entry.last_seen = now;
            return true;
        }

        if !self.has_capacity() {
            return false;
        }

        self.candidates.insert(
            candidate.address,
            CandidateEntry {
                candidate,
                last_seen: now,
            },
        );
        true
    }

    pub fn remove_candidate(&mut self, address: &SocketAddr) -> Option<Candidate> {
        self.candidates.remove(address).map(|entry| entry.candidate)
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&Candidate> {
        self.candidates.get(address).map(|entry| &entry.candidate)
    }

    pub fn find_by_key(&self, public_key: &PublicKey) -> Option<&Candidate> {
        self.candidates
            .values()
            .map(|entry| &entry.candidate)
            .find(|candidate| &candidate.public_key == public_key)
    }

    /// All candidates, most recently seen first
    pub fn candidates(&self) -> Vec<&Candidate> {
        let mut entries: Vec<_> = self.candidates.values().collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries.into_iter().map(|entry| &entry.candidate).collect()
    }

    /// Remove candidates not seen for `timeout`
    pub fn remove_stale(&mut self, now: Instant, timeout: std::time::Duration) -> Vec<SocketAddr> {
        let stale: Vec<_> = self
            .candidates
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &stale {
            self.candidates.remove(addr);
        }

        stale
    }
}

impl Default for CandidateManager {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use std::time::Duration;

    fn candidate(port: u16) -> Candidate {
        Candidate::new(
            SocketAddr::from(([127, 0, 0, 1], port)),
            KeyPair::generate().public_key(),
        )
    }

    #[test]
    fn test_add_refreshes_existing() {
        let mut manager = CandidateManager::new(10);
        let now = Instant::now();
        let first = candidate(8000);

        assert!(manager.add_candidate(first.clone(), now));
        let replacement = Candidate::new(first.address, KeyPair::generate().public_key());
        assert!(manager.add_candidate(replacement.clone(), now));

        assert_eq!(manager.len(), 1);
        assert_eq!(manager.get(&first.address), Some(&replacement));
    }

    #[test]
    fn test_capacity() {
        let mut manager = CandidateManager::new(2);
        let now = Instant::now();

        assert!(manager.add_candidate(candidate(1), now));
        assert!(manager.add_candidate(candidate(2), now));
        assert!(!manager.has_capacity());
        assert!(!manager.add_candidate(candidate(3), now));
    }

    #[test]
    fn test_find_by_key_and_remove() {
        let mut manager = CandidateManager::new(10);
        let target = candidate(5);
        manager.add_candidate(candidate(4), Instant::now());
        manager.add_candidate(target.clone(), Instant::now());

        assert_eq!(manager.find_by_key(&target.public_key), Some(&target));
        assert_eq!(manager.remove_candidate(&target.address), Some(target.clone()));
        assert!(manager.find_by_key(&target.public_key).is_none());
    }

    #[test]
    fn test_remove_stale() {
        let mut manager = CandidateManager::new(10);
        let start = Instant::now();
        let old = candidate(1);
        manager.add_candidate(old.clone(), start);
        manager.add_candidate(candidate(2), start + Duration::from_secs(100));

        let removed = manager.remove_stale(start + Duration::from_secs(120), Duration::from_secs(60));
        assert_eq!(removed, vec![old.address]);
        assert_eq!(manager.len(), 1);
    }
}
