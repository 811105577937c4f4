//! Handle allocation.
//!
//! Session and device handles are drawn from one generator, so their raw
//! integers never collide, but they are distinct types in the broker.

use std::time::{SystemTime, UNIX_EPOCH};

/// Handle of an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(i64);

/// Handle of a device opened by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(i64);

impl SessionHandle {
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl DeviceHandle {
    pub fn raw(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2))
        .unwrap_or(0)
}

/// Generator for the flat handle space.
///
/// A handle is the wall clock in milliseconds plus the current session
/// count, bumped past the previous handle when the clock has not moved.
/// Handles are strictly increasing for the lifetime of the allocator.
#[derive(Debug)]
pub struct HandleAllocator {
    last: i64,
    clock: fn() -> i64,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::with_clock(now_millis)
    }

    pub fn with_clock(clock: fn() -> i64) -> Self {
        Self { last: 0, clock }
    }

    fn next(&mut self, population: usize) -> i64 {
        let perturbed = (self.clock)().saturating_add(population as i64);
        let handle = perturbed.max(self.last + 1);
        self.last = handle;
        handle
    }

    pub fn session(&mut self, population: usize) -> SessionHandle {
        SessionHandle(self.next(population))
    }

    pub fn device(&mut self, population: usize) -> DeviceHandle {
        DeviceHandle(self.next(population))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn frozen() -> i64 {
        1_700_000_000_000
    }

    #[test]
    fn frozen_clock_still_yields_unique_handles() {
        let mut alloc = HandleAllocator::with_clock(frozen);
        let mut seen = HashSet::new();
        for i in 0..1000 {
            assert!(seen.insert(alloc.session(i % 3).raw()));
            assert!(seen.insert(alloc.device(0).raw()));
        }
    }

    #[test]
    fn handles_follow_clock_and_population() {
        let mut alloc = HandleAllocator::with_clock(frozen);
        assert_eq!(alloc.session(0).raw(), frozen());
        assert_eq!(alloc.session(5).raw(), frozen() + 5);
        // Population dropped; still moves forward.
        assert_eq!(alloc.device(1).raw(), frozen() + 6);
    }

    #[test]
    fn system_clock_handles_are_positive() {
        let mut alloc = HandleAllocator::new();
        let a = alloc.session(0);
        let b = alloc.session(0);
        assert!(a.raw() > 0);
        assert!(b > a);
    }
}
