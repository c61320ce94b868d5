use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque identifier of a browser instance across the C boundary.
///
/// Handle `0` is never handed out and stands for "no instance".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceHandle(u32);

impl InstanceHandle {
    pub const INVALID: InstanceHandle = InstanceHandle(0);

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for InstanceHandle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing handles. Handles are never reused.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU32,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self) -> InstanceHandle {
        InstanceHandle(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn first_handle_is_one() {
        let alloc = HandleAllocator::new();
        assert_eq!(alloc.allocate().as_u32(), 1);
        assert_eq!(alloc.allocate().as_u32(), 2);
        assert!(!InstanceHandle::INVALID.is_valid());
    }

    #[test]
    fn handles_are_unique_across_threads() {
        let alloc = Arc::new(HandleAllocator::new());
        let mut joins = Vec::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            joins.push(std::thread::spawn(move || {
                (0..250).map(|_| alloc.allocate()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for j in joins {
            let handles = j.join().unwrap();
            // Each thread observes its own handles in increasing order
            assert!(handles.windows(2).all(|w| w[0] < w[1]));
            for h in handles {
                assert!(seen.insert(h), "duplicate handle {h}");
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
