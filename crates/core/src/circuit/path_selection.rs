use crate::identity::PublicKey;
use crate::peer::Candidate;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::net::SocketAddr;

/// Peers that must not be picked for a hop
#[derive(Debug, Clone, Default)]
pub struct PathSelectionCriteria {
    pub excluded_addresses: HashSet<SocketAddr>,
    pub excluded_keys: HashSet<PublicKey>,
}

impl PathSelectionCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclude_address(mut self, address: SocketAddr) -> Self {
        self.excluded_addresses.insert(address);
        self
    }

    pub fn exclude_addresses(mut self, addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.excluded_addresses.extend(addresses);
        self
    }

    pub fn exclude_key(mut self, key: PublicKey) -> Self {
        self.excluded_keys.insert(key);
        self
    }

    pub fn exclude_keys(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.excluded_keys.extend(keys);
        self
    }

    fn allows(&self, candidate: &Candidate) -> bool {
        !self.excluded_addresses.contains(&candidate.address)
            && !self.excluded_keys.contains(&candidate.public_key)
    }
}

/// Random selection with exclusions
pub struct PathSelector;

impl PathSelector {
    /// Pick the entry hop of a new circuit
    pub fn select_first_hop<'a>(
        candidates: &[&'a Candidate],
        criteria: &PathSelectionCriteria,
    ) -> Option<&'a Candidate> {
        let eligible: Vec<&'a Candidate> = candidates
            .iter()
            .copied()
            .filter(|candidate| criteria.allows(candidate))
            .collect();
        eligible.choose(&mut rand::thread_rng()).copied()
    }

    /// Pick the next hop out of the keys a hop offered us
    pub fn select_extension(
        offered: &[PublicKey],
        criteria: &PathSelectionCriteria,
    ) -> Option<PublicKey> {
        let eligible: Vec<&PublicKey> = offered
            .iter()
            .filter(|key| !criteria.excluded_keys.contains(key))
            .collect();
        eligible.choose(&mut rand::thread_rng()).map(|key| **key)
    }

    /// Candidates a hop offers in its created reply
    pub fn sample_candidates(
        candidates: &[&Candidate],
        criteria: &PathSelectionCriteria,
        max: usize,
    ) -> Vec<Candidate> {
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .copied()
            .filter(|candidate| criteria.allows(candidate))
            .collect();
        eligible
            .choose_multiple(&mut rand::thread_rng(), max)
            .map(|candidate| (*candidate).clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    fn candidates(n: u16) -> Vec<Candidate> {
        (0..n)
            .map(|i| {
                Candidate::new(
                    SocketAddr::from(([10, 0, 0, 1], 7000 + i)),
                    KeyPair::generate().public_key(),
                )
            })
            .collect()
    }

    #[test]
    fn test_first_hop_respects_exclusions() {
        let all = candidates(3);
        let refs: Vec<&Candidate> = all.iter().collect();
        let criteria = PathSelectionCriteria::new()
            .exclude_address(all[0].address)
            .exclude_key(all[1].public_key);

        for _ in 0..20 {
            let chosen = PathSelector::select_first_hop(&refs, &criteria).unwrap();
            assert_eq!(chosen, &all[2]);
        }
    }

    #[test]
    fn test_first_hop_none_when_all_excluded() {
        let all = candidates(2);
        let refs: Vec<&Candidate> = all.iter().collect();
        let criteria = PathSelectionCriteria::new().exclude_addresses(all.iter().map(|c| c.address));

        assert!(PathSelector::select_first_hop(&refs, &criteria).is_none());
    }

    #[test]
    fn test_extension_excludes_keys() {
        let own = KeyPair::generate().public_key();
        let other = KeyPair::generate().public_key();
        let criteria = PathSelectionCriteria::new().exclude_key(own);

        assert_eq!(PathSelector::select_extension(&[own], &criteria), None);
        assert_eq!(PathSelector::select_extension(&[own, other], &criteria), Some(other));
    }

    #[test]
    fn test_sample_is_capped() {
        let all = candidates(10);
        let refs: Vec<&Candidate> = all.iter().collect();

        let sample = PathSelector::sample_candidates(&refs, &PathSelectionCriteria::new(), 4);
        assert_eq!(sample.len(), 4);
        let unique: HashSet<_> = sample.iter().map(|c| c.address).collect();
        assert_eq!(unique.len(), 4);
    }
}
