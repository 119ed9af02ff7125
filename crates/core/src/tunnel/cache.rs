use crate::circuit::{CircuitId, DhSecret};
use crate::identity::PublicKey;
use anontunnel_common::{protocol, InfoHash, Result, TunnelError};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Namespace of a request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Circuit,
    Created,
    Ping,
    EstablishIntro,
    EstablishRendezvous,
    KeyRequest,
    KeyRelay,
    E2eRequest,
    E2eRelay,
    LinkRequest,
    DhtRequest,
}

/// State parked until a reply arrives or the entry times out
#[derive(Debug)]
pub enum CacheEntry {
    /// Originator waiting for created/extended
    Circuit { circuit_id: CircuitId },

    /// Hop waiting for the extend that follows its created
    Created {
        circuit_id: CircuitId,
        candidates: HashMap<PublicKey, SocketAddr>,
    },

    Ping { circuit_id: CircuitId },

    EstablishIntro {
        circuit_id: CircuitId,
        info_hash: InfoHash,
    },

    EstablishRendezvous { circuit_id: CircuitId },

    KeyRequest { info_hash: InfoHash },

    /// Introduction point forwarding a key request to its seeder
    KeyRelay {
        requester: SocketAddr,
        identifier: u16,
    },

    E2eRequest {
        info_hash: InfoHash,
        dh_secret: DhSecret,
        service_key: PublicKey,
        hops: usize,
    },

    /// Introduction point forwarding a create-e2e to its seeder
    E2eRelay {
        requester: SocketAddr,
        identifier: u16,
    },

    LinkRequest {
        circuit_id: CircuitId,
        info_hash: InfoHash,
    },

    DhtRequest {
        circuit_id: CircuitId,
        info_hash: InfoHash,
    },
}

impl CacheEntry {
    pub fn category(&self) -> CacheCategory {
        match self {
            Self::Circuit { .. } => CacheCategory::Circuit,
            Self::Created { .. } => CacheCategory::Created,
            Self::Ping { .. } => CacheCategory::Ping,
            Self::EstablishIntro { .. } => CacheCategory::EstablishIntro,
            Self::EstablishRendezvous { .. } => CacheCategory::EstablishRendezvous,
            Self::KeyRequest { .. } => CacheCategory::KeyRequest,
            Self::KeyRelay { .. } => CacheCategory::KeyRelay,
            Self::E2eRequest { .. } => CacheCategory::E2eRequest,
            Self::E2eRelay { .. } => CacheCategory::E2eRelay,
            Self::LinkRequest { .. } => CacheCategory::LinkRequest,
            Self::DhtRequest { .. } => CacheCategory::DhtRequest,
        }
    }
}

/// Random draws before giving up on finding a free identifier
const IDENTIFIER_ATTEMPTS: usize = 64;

/// Short-lived request state keyed by category and identifier
#[derive(Debug)]
pub struct RequestCache {
    entries: HashMap<(CacheCategory, u32), (Instant, CacheEntry)>,
    per_category: HashMap<CacheCategory, usize>,
    max_per_category: usize,
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::with_capacity(protocol::MAX_PENDING_REQUESTS)
    }
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache holding at most `max_per_category` random-identifier entries
    /// per category
    pub fn with_capacity(max_per_category: usize) -> Self {
        Self {
            entries: HashMap::new(),
            per_category: HashMap::new(),
            max_per_category,
        }
    }

    /// Store under an explicit key, replacing whatever was there
    pub fn add(&mut self, key: u32, entry: CacheEntry, now: Instant, timeout: Duration) {
        let category = entry.category();
        if self
            .entries
            .insert((category, key), (now + timeout, entry))
            .is_none()
        {
            *self.per_category.entry(category).or_insert(0) += 1;
        }
    }

    /// Store under a fresh random `u16` identifier and return it
    ///
    /// Fails once the category holds `max_per_category` entries, so a flood
    /// of requests is dropped instead of exhausting the identifier space.
    pub fn add_with_identifier(
        &mut self,
        entry: CacheEntry,
        now: Instant,
        timeout: Duration,
    ) -> Result<u16> {
        let category = entry.category();
        if self.category_len(category) >= self.max_per_category {
            return Err(TunnelError::AdmissionRejected(format!(
                "{:?} cache is full",
                category
            )));
        }

        let mut rng = rand::thread_rng();
        let identifier = (0..IDENTIFIER_ATTEMPTS)
            .map(|_| rng.gen::<u16>())
            .find(|candidate| !self.entries.contains_key(&(category, *candidate as u32)))
            .ok_or_else(|| {
                TunnelError::AdmissionRejected(format!("no free {:?} identifier", category))
            })?;
        self.add(identifier as u32, entry, now, timeout);
        Ok(identifier)
    }

    pub fn category_len(&self, category: CacheCategory) -> usize {
        self.per_category.get(&category).copied().unwrap_or(0)
    }

    fn forget(&mut self, category: CacheCategory) {
        if let Some(count) = self.per_category.get_mut(&category) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn has(&self, category: CacheCategory, key: u32) -> bool {
        self.entries.contains_key(&(category, key))
    }

    pub fn get(&self, category: CacheCategory, key: u32) -> Option<&CacheEntry> {
        self.entries.get(&(category, key)).map(|(_, entry)| entry)
    }

    pub fn deadline(&self, category: CacheCategory, key: u32) -> Option<Instant> {
        self.entries.get(&(category, key)).map(|(deadline, _)| *deadline)
    }

    pub fn pop(&mut self, category: CacheCategory, key: u32) -> Option<CacheEntry> {
        let (_, entry) = self.entries.remove(&(category, key))?;
        self.forget(category);
        Some(entry)
    }

    /// Remove and return every entry whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<CacheEntry> {
        let expired: Vec<(CacheCategory, u32)> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        expired
            .into_iter()
            .filter_map(|(category, key)| self.pop(category, key))
            .collect()
    }

    /// Drop every entry that refers to a removed circuit
    pub fn forget_circuit(&mut self, circuit_id: CircuitId) {
        self.entries.retain(|_, (_, entry)| match entry {
            CacheEntry::Circuit { circuit_id: id }
            | CacheEntry::Ping { circuit_id: id }
            | CacheEntry::EstablishIntro { circuit_id: id, .. }
            | CacheEntry::EstablishRendezvous { circuit_id: id }
            | CacheEntry::LinkRequest { circuit_id: id, .. }
            | CacheEntry::DhtRequest { circuit_id: id, .. } => *id != circuit_id,
            _ => true,
        });

        self.per_category.clear();
        for (category, _) in self.entries.keys() {
            *self.per_category.entry(*category).or_insert(0) += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_by_category() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        let id = cache
            .add_with_identifier(CacheEntry::Ping { circuit_id: 9 }, now, Duration::from_secs(20))
            .unwrap();

        assert!(cache.pop(CacheCategory::Circuit, id as u32).is_none());
        assert!(matches!(
            cache.pop(CacheCategory::Ping, id as u32),
            Some(CacheEntry::Ping { circuit_id: 9 })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expire_only_past_deadline() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        cache.add(1, CacheEntry::Circuit { circuit_id: 1 }, now, Duration::from_secs(10));
        cache.add(2, CacheEntry::Circuit { circuit_id: 2 }, now, Duration::from_secs(30));

        assert!(cache.expire(now + Duration::from_secs(5)).is_empty());
        let expired = cache.expire(now + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert!(matches!(expired[0], CacheEntry::Circuit { circuit_id: 1 }));
        assert!(cache.has(CacheCategory::Circuit, 2));
    }

    #[test]
    fn test_forget_circuit() {
        let mut cache = RequestCache::new();
        let now = Instant::now();
        let timeout = Duration::from_secs(10);
        cache.add(4, CacheEntry::Circuit { circuit_id: 4 }, now, timeout);
        cache.add_with_identifier(CacheEntry::Ping { circuit_id: 4 }, now, timeout).unwrap();
        cache.add_with_identifier(CacheEntry::Ping { circuit_id: 5 }, now, timeout).unwrap();

        cache.forget_circuit(4);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.category_len(CacheCategory::Ping), 1);
        assert_eq!(cache.category_len(CacheCategory::Circuit), 0);
    }

    fn relay_entry(port: u16) -> CacheEntry {
        CacheEntry::KeyRelay {
            requester: SocketAddr::from(([198, 51, 100, 7], port)),
            identifier: port,
        }
    }

    #[test]
    fn test_full_category_rejects_new_identifiers() {
        let mut cache = RequestCache::with_capacity(8);
        let now = Instant::now();
        let timeout = Duration::from_secs(15);

        for port in 0..8 {
            cache.add_with_identifier(relay_entry(port), now, timeout).unwrap();
        }
        assert!(matches!(
            cache.add_with_identifier(relay_entry(8), now, timeout),
            Err(TunnelError::AdmissionRejected(_))
        ));

        // other categories are unaffected
        cache
            .add_with_identifier(CacheEntry::Ping { circuit_id: 1 }, now, timeout)
            .unwrap();

        // expiry frees room again
        assert_eq!(cache.expire(now + timeout).len(), 9);
        assert_eq!(cache.category_len(CacheCategory::KeyRelay), 0);
        assert!(cache.add_with_identifier(relay_entry(9), now, timeout).is_ok());
    }

    #[test]
    fn test_exhausted_identifier_space_does_not_spin() {
        let mut cache = RequestCache::with_capacity(usize::MAX);
        let now = Instant::now();
        let timeout = Duration::from_secs(15);

        for id in 0..=u16::MAX {
            cache.add(id as u32, relay_entry(id), now, timeout);
        }
        assert_eq!(cache.category_len(CacheCategory::KeyRelay), 1 << 16);
        assert!(cache.add_with_identifier(relay_entry(0), now, timeout).is_err());
    }
}
