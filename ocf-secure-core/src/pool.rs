//! Fixed-capacity reference-counted message buffer pool (C2).
//!
//! `allocate()` never blocks; under pressure it returns `None`. A `Message`
//! handle is cheap to clone (refcount bump, not a data copy) and the
//! underlying slot is returned to the free-list the instant the last handle
//! drops.

use std::sync::Arc;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

/// A pool-backed message handle. Cloning bumps a refcount; it is never a
/// byte copy. Two handles pointing at the same slot compare equal by
/// `slot_id`, which stands in for the "dedup by pointer identity" the
/// TLS engine's `send_queue` needs.
#[derive(Clone)]
pub struct Message(Arc<SlotHandle>);

struct SlotHandle {
    id: SlotId,
    data: Vec<u8>,
    endpoint: Endpoint,
    read_offset: std::sync::atomic::AtomicUsize,
    encrypted: bool,
    pool: std::sync::Weak<Inner>,
}

impl Message {
    pub fn slot_id(&self) -> SlotId {
        self.0.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.0.endpoint
    }

    pub fn data(&self) -> &[u8] {
        &self.0.data[self.0.read_offset.load(std::sync::atomic::Ordering::Relaxed)..]
    }

    pub fn is_encrypted(&self) -> bool {
        self.0.encrypted
    }

    pub fn advance_read_offset(&self, n: usize) {
        self.0
            .read_offset
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    /// Identity-based equality, standing in for "dedup by pointer identity"
    /// since a pool-backed handle has no raw pointer to compare.
    pub fn same_slot(&self, other: &Message) -> bool {
        self.0.id == other.0.id
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.id);
        }
    }
}

struct Inner {
    free: std::sync::Mutex<Vec<SlotId>>,
    capacity: usize,
}

impl Inner {
    fn release(&self, id: SlotId) {
        self.free.lock().expect("message pool mutex poisoned").push(id);
    }
}

/// Fixed-capacity message pool. `max_messages` bounds the number of
/// concurrently live [`Message`] handles; beyond that, `allocate` returns
/// `None` rather than growing or blocking.
pub struct MessagePool {
    inner: Arc<Inner>,
    config: crate::config::PoolConfig,
}

impl MessagePool {
    pub fn new(config: crate::config::PoolConfig) -> Self {
        let free = (0..config.max_messages as u32).map(SlotId).collect();
        Self {
            inner: Arc::new(Inner {
                free: std::sync::Mutex::new(free),
                capacity: config.max_messages,
            }),
            config,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().expect("message pool mutex poisoned").len()
    }

    /// Allocates a message slot for `data`. Returns `None` under pressure —
    /// the pool never blocks and never grows past `max_messages`.
    pub fn allocate(&self, data: Vec<u8>, endpoint: Endpoint, encrypted: bool) -> Option<Message> {
        if data.len() > self.config.max_pdu {
            return None;
        }
        let id = self.inner.free.lock().expect("message pool mutex poisoned").pop()?;
        Some(Message(Arc::new(SlotHandle {
            id,
            data,
            endpoint,
            read_offset: std::sync::atomic::AtomicUsize::new(0),
            encrypted,
            pool: Arc::downgrade(&self.inner),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, Family};

    fn ep() -> Endpoint {
        Endpoint::new_tcp(Family::V4, "127.0.0.1:5683".parse().unwrap(), 0, 0)
    }

    #[test]
    fn allocate_respects_capacity() {
        let pool = MessagePool::new(crate::config::PoolConfig {
            max_messages: 2,
            ..Default::default()
        });
        let a = pool.allocate(vec![1], ep(), false).unwrap();
        let b = pool.allocate(vec![2], ep(), false).unwrap();
        assert!(pool.allocate(vec![3], ep(), false).is_none());
        drop(a);
        let c = pool.allocate(vec![3], ep(), false);
        assert!(c.is_some());
        drop(b);
        drop(c);
    }

    #[test]
    fn refcount_is_clone_not_copy() {
        let pool = MessagePool::new(crate::config::PoolConfig {
            max_messages: 1,
            ..Default::default()
        });
        let a = pool.allocate(vec![1, 2, 3], ep(), false).unwrap();
        let b = a.clone();
        assert!(a.same_slot(&b));
        assert!(pool.allocate(vec![9], ep(), false).is_none());
        drop(a);
        assert!(pool.allocate(vec![9], ep(), false).is_none()); // b still live
        drop(b);
        assert!(pool.allocate(vec![9], ep(), false).is_some());
    }
}
