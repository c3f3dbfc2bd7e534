// src/supervisor/port_allocator.rs
//! Worker port allocation
//!
//! A bounded pool of ports handed out to worker processes. Invariant:
//! a port is never assigned to two live owners simultaneously; release
//! must precede reuse. The allocator is owned by the process manager
//! and only ever mutated from there (single-writer model).

use crate::utils::errors::{FleetError, Result};
use std::collections::HashMap;

/// Allocates ports from an inclusive range
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,

    /// port -> owning process id
    allocated: HashMap<u16, String>,

    /// Next candidate, to spread allocations across the range
    cursor: u16,
}

impl PortAllocator {
    /// Create an allocator over `start..=end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: HashMap::new(),
            cursor: start,
        }
    }

    /// Allocate a free port for `owner`
    pub fn allocate(&mut self, owner: &str) -> Result<u16> {
        let span = (self.end - self.start) as usize + 1;

        for offset in 0..span {
            let candidate = self.wrap(self.cursor as usize + offset);
            if !self.allocated.contains_key(&candidate) {
                self.allocated.insert(candidate, owner.to_string());
                self.cursor = self.wrap(candidate as usize + 1);
                return Ok(candidate);
            }
        }

        Err(FleetError::NoPortsAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Release a single port; unknown ports are a no-op
    pub fn release(&mut self, port: u16) {
        self.allocated.remove(&port);
    }

    /// Release every port held by `owner`
    pub fn release_owner(&mut self, owner: &str) {
        self.allocated.retain(|_, holder| holder != owner);
    }

    /// Owner currently holding `port`, if any
    pub fn owner_of(&self, port: u16) -> Option<&str> {
        self.allocated.get(&port).map(String::as_str)
    }

    /// Number of ports currently allocated
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    fn wrap(&self, candidate: usize) -> u16 {
        let span = (self.end - self.start) as usize + 1;
        let offset = (candidate - self.start as usize) % span;
        (self.start as usize + offset) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocate_unique_ports() {
        let mut allocator = PortAllocator::new(30000, 30003);
        let a = allocator.allocate("p1").unwrap();
        let b = allocator.allocate("p2").unwrap();
        let c = allocator.allocate("p3").unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_exhaustion() {
        let mut allocator = PortAllocator::new(30000, 30001);
        allocator.allocate("p1").unwrap();
        allocator.allocate("p2").unwrap();
        let err = allocator.allocate("p3").unwrap_err();
        assert_eq!(err.kind(), "no_ports_available");
    }

    #[test]
    fn test_release_enables_reuse() {
        let mut allocator = PortAllocator::new(30000, 30000);
        let port = allocator.allocate("p1").unwrap();
        assert!(allocator.allocate("p2").is_err());

        allocator.release(port);
        let again = allocator.allocate("p2").unwrap();
        assert_eq!(port, again);
        assert_eq!(allocator.owner_of(port), Some("p2"));
    }

    #[test]
    fn test_release_owner_drops_all_ports() {
        let mut allocator = PortAllocator::new(30000, 30010);
        allocator.allocate("p1").unwrap();
        allocator.allocate("p1").unwrap();
        allocator.allocate("p2").unwrap();

        allocator.release_owner("p1");
        assert_eq!(allocator.allocated_count(), 1);
    }

    proptest! {
        // For any interleaving of allocate/release, no port is ever held
        // by two owners at once.
        #[test]
        fn prop_port_exclusivity(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let mut allocator = PortAllocator::new(40000, 40007);
            let mut held: Vec<(u16, String)> = Vec::new();
            let mut next_owner = 0usize;

            for op in ops {
                match op {
                    0 | 1 => {
                        let owner = format!("p{}", next_owner);
                        next_owner += 1;
                        if let Ok(port) = allocator.allocate(&owner) {
                            prop_assert!(!held.iter().any(|(p, _)| *p == port));
                            held.push((port, owner));
                        }
                    }
                    _ => {
                        if let Some((port, _)) = held.pop() {
                            allocator.release(port);
                        }
                    }
                }
            }
        }
    }
}
