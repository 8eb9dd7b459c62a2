//! Global allocator hook (spec §9).
//!
//! The original C library lets an embedder install a process-wide allocator
//! before any Raft instance starts. Rust's equivalent is `#[global_allocator]`,
//! which is a build-time decision the embedding binary makes, not something
//! this crate can flip at runtime. What the crate *can* still offer is the
//! "set once before start" record the spec describes, for embedders that
//! want to track or report on allocation behavior without replacing the
//! global allocator wholesale (e.g. recording a memory budget, or swapping
//! in a bump allocator for test determinism via `std::alloc::System`
//! composition at the binary level).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

/// An allocator policy record: currently just a soft memory budget, checked
/// by components (the log, snapshot buffers) before large allocations so
/// they can fail with `NoMem` predictably instead of aborting the process.
pub struct AllocatorPolicy {
    /// 0 means unbounded.
    budget_bytes: AtomicU64,
    used_bytes: AtomicU64,
}

impl AllocatorPolicy {
    const fn unbounded() -> Self {
        AllocatorPolicy {
            budget_bytes: AtomicU64::new(0),
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn try_reserve(&self, bytes: u64) -> bool {
        let budget = self.budget_bytes.load(Ordering::Relaxed);
        if budget == 0 {
            self.used_bytes.fetch_add(bytes, Ordering::Relaxed);
            return true;
        }
        loop {
            let used = self.used_bytes.load(Ordering::Relaxed);
            if used.saturating_add(bytes) > budget {
                return false;
            }
            if self
                .used_bytes
                .compare_exchange_weak(used, used + bytes, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn release(&self, bytes: u64) {
        self.used_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }
}

static POLICY: OnceLock<AllocatorPolicy> = OnceLock::new();
static POLICY_SET: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide allocator policy. Last-writer-wins among calls
/// made before the first `Raft` instance starts; has no effect afterward,
/// since components read the policy once at construction.
pub fn set_budget_bytes(budget_bytes: u64) {
    let policy = POLICY.get_or_init(AllocatorPolicy::unbounded);
    policy.budget_bytes.store(budget_bytes, Ordering::Relaxed);
    POLICY_SET.store(true, Ordering::Relaxed);
}

pub fn policy() -> &'static AllocatorPolicy {
    POLICY.get_or_init(AllocatorPolicy::unbounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_by_default() {
        let p = AllocatorPolicy::unbounded();
        assert!(p.try_reserve(u64::MAX / 2));
    }

    #[test]
    fn budget_rejects_overage() {
        let p = AllocatorPolicy::unbounded();
        p.budget_bytes.store(100, Ordering::Relaxed);
        assert!(p.try_reserve(60));
        assert!(!p.try_reserve(60));
        p.release(60);
        assert!(p.try_reserve(60));
    }
}
