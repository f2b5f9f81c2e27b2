//! Transmit context pool
//!
//! Each in-flight bulk OUT transfer owns one slot. A slot is free while its
//! index cell holds [`FREE`]; acquiring a slot swaps its own index in. Slots
//! are claimed from the caller's thread and released from completion
//! callbacks, so every cell is atomic and no lock spans the pool.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Sentinel index of an unused slot
pub const FREE: u32 = u32::MAX;

#[derive(Debug)]
struct TxSlot {
    index: AtomicU32,
    len: AtomicUsize,
    count: AtomicU32,
}

/// Handle of a claimed transmit slot, passed back on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxToken(pub u32);

/// What a released slot was carrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRelease {
    /// Payload length in bytes
    pub len: usize,
    /// Number of frames the transfer held
    pub count: u32,
}

/// Fixed-size pool of transmit contexts
#[derive(Debug)]
pub struct TxContextPool {
    slots: Box<[TxSlot]>,
    in_flight: AtomicUsize,
}

impl TxContextPool {
    /// Create a pool with `size` slots
    pub fn new(size: usize) -> Self {
        let slots = (0..size)
            .map(|_| TxSlot {
                index: AtomicU32::new(FREE),
                len: AtomicUsize::new(0),
                count: AtomicU32::new(0),
            })
            .collect();
        Self {
            slots,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Transfers currently in flight
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Check if every slot is taken, per the coarse in-flight counter
    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.capacity()
    }

    /// Claim the first free slot for a transfer of `len` bytes
    pub fn acquire(&self, len: usize, count: u32) -> Option<TxToken> {
        for (i, slot) in self.slots.iter().enumerate() {
            let idx = i as u32;
            if slot
                .index
                .compare_exchange(FREE, idx, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.len.store(len, Ordering::Relaxed);
                slot.count.store(count, Ordering::Relaxed);
                let _ = self
                    .in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_add(1))
                    });
                return Some(TxToken(idx));
            }
        }
        None
    }

    /// Release a slot; returns `None` if it was not in use
    pub fn release(&self, token: TxToken) -> Option<TxRelease> {
        let slot = self.slots.get(token.0 as usize)?;
        let len = slot.len.load(Ordering::Relaxed);
        let count = slot.count.load(Ordering::Relaxed);
        slot.index
            .compare_exchange(token.0, FREE, Ordering::AcqRel, Ordering::Relaxed)
            .ok()?;
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
        Some(TxRelease { len, count })
    }

    /// Free every slot and zero the in-flight counter
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.index.store(FREE, Ordering::Release);
        }
        self.in_flight.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_exhaust_and_release() {
        let pool = TxContextPool::new(3);
        let a = pool.acquire(10, 1).unwrap();
        let b = pool.acquire(20, 1).unwrap();
        let c = pool.acquire(30, 1).unwrap();
        assert_eq!((a, b, c), (TxToken(0), TxToken(1), TxToken(2)));
        assert!(pool.is_full());
        assert!(pool.acquire(40, 1).is_none());

        assert_eq!(pool.release(b), Some(TxRelease { len: 20, count: 1 }));
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.acquire(50, 1), Some(TxToken(1)));
    }

    #[test]
    fn test_double_release() {
        let pool = TxContextPool::new(2);
        let a = pool.acquire(8, 1).unwrap();
        assert!(pool.release(a).is_some());
        assert!(pool.release(a).is_none());
        assert!(pool.release(TxToken(7)).is_none());
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_reset() {
        let pool = TxContextPool::new(2);
        pool.acquire(1, 1).unwrap();
        pool.acquire(1, 1).unwrap();
        pool.reset();
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.acquire(1, 1).is_some());
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(TxContextPool::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(token) = pool.acquire(8, 1) {
                            assert!(pool.release(token).is_some());
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.in_flight(), 0);
    }
}
