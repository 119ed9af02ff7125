use crate::circuit::CircuitId;
use crate::protocol::Address;
use std::collections::{HashMap, HashSet};

/// Maps SOCKS5 destinations onto data circuits, per hop count
///
/// A destination stays bound to the circuit it was first sent over for as
/// long as that circuit is usable, so a peer always sees the same exit.
#[derive(Debug, Default)]
pub struct Dispatcher {
    destinations: HashMap<usize, HashMap<Address, CircuitId>>,
    round_robin: HashMap<usize, usize>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Circuit for `destination` among the `active` ready circuits of `hops`
    pub fn select(
        &mut self,
        hops: usize,
        destination: &Address,
        active: &[CircuitId],
    ) -> Option<CircuitId> {
        if let Some(bound) = self.bound_circuit(hops, destination) {
            if active.contains(&bound) {
                return Some(bound);
            }
        }

        if active.is_empty() {
            return None;
        }

        let index = self.round_robin.entry(hops).or_insert(0);
        let circuit_id = active[*index % active.len()];
        *index = index.wrapping_add(1);

        self.destinations
            .entry(hops)
            .or_default()
            .insert(destination.clone(), circuit_id);
        Some(circuit_id)
    }

    pub fn bound_circuit(&self, hops: usize, destination: &Address) -> Option<CircuitId> {
        self.destinations
            .get(&hops)
            .and_then(|bindings| bindings.get(destination))
            .copied()
    }

    /// Forget every binding to a dead circuit and return the destinations
    /// that were using it
    pub fn circuit_dead(&mut self, circuit_id: CircuitId) -> HashSet<Address> {
        let mut affected = HashSet::new();
        for bindings in self.destinations.values_mut() {
            bindings.retain(|destination, bound| {
                if *bound == circuit_id {
                    affected.insert(destination.clone());
                    false
                } else {
                    true
                }
            });
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dest(port: u16) -> Address {
        Address::Ipv4(format!("203.0.113.5:{}", port).parse().unwrap())
    }

    #[test]
    fn test_sticky_binding() {
        let mut dispatcher = Dispatcher::new();
        let active = [10, 20, 30];

        let first = dispatcher.select(3, &dest(1), &active).unwrap();
        for _ in 0..5 {
            assert_eq!(dispatcher.select(3, &dest(1), &active), Some(first));
        }
    }

    #[test]
    fn test_round_robin_spreads_destinations() {
        let mut dispatcher = Dispatcher::new();
        let active = [10, 20];

        let a = dispatcher.select(1, &dest(1), &active).unwrap();
        let b = dispatcher.select(1, &dest(2), &active).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rebinds_when_circuit_inactive() {
        let mut dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.select(2, &dest(1), &[10]), Some(10));
        assert_eq!(dispatcher.select(2, &dest(1), &[20]), Some(20));
        assert_eq!(dispatcher.bound_circuit(2, &dest(1)), Some(20));
    }

    #[test]
    fn test_circuit_dead_reports_destinations() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.select(1, &dest(1), &[10]);
        dispatcher.select(1, &dest(2), &[10]);
        dispatcher.select(2, &dest(3), &[20]);

        let affected = dispatcher.circuit_dead(10);
        assert_eq!(affected.len(), 2);
        assert!(affected.contains(&dest(1)));
        assert_eq!(dispatcher.bound_circuit(1, &dest(1)), None);
        assert_eq!(dispatcher.bound_circuit(2, &dest(3)), Some(20));
        assert!(dispatcher.select(1, &dest(1), &[]).is_none());
    }
}
