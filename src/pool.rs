// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Fixed-size pool of reusable buffers. A buffer is loaned out for writing,
//! then frozen into a reference-counted `Shared` handle for any number of
//! readers. When the last reference is dropped the buffer returns to the
//! pool; no explicit release call exists that a caller could forget.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

struct PoolShared<T> {
    name: &'static str,
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

pub struct Pool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool{shared: self.shared.clone()}
    }
}

impl<T> Pool<T> {
    /// Pre-allocates `capacity` buffers using `init`.
    pub fn new(name: &'static str, capacity: usize, init: impl Fn() -> T) -> Self {
        let free = (0..capacity).map(|_| Box::new(init())).collect();
        Pool {
            shared: Arc::new(PoolShared {
                name,
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn available(&self) -> usize {
        self.shared.free.lock().unwrap().len()
    }

    /// Takes a free buffer, or None if every buffer is loaned out. The buffer
    /// holds whatever its previous user left in it.
    pub fn try_acquire(&self) -> Option<Loaned<T>> {
        let item = self.shared.free.lock().unwrap().pop()?;
        Some(Loaned {
            item: Some(item),
            pool: Arc::downgrade(&self.shared),
        })
    }
}

/// Exclusive loan of a pool buffer.
pub struct Loaned<T> {
    item: Option<Box<T>>,
    pool: Weak<PoolShared<T>>,
}

impl<T> Loaned<T> {
    /// Ends the writing phase; the buffer becomes shareable and immutable.
    pub fn share(self) -> Shared<T> {
        Arc::new(self)
    }
}

impl<T> Deref for Loaned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Only None during drop().
        self.item.as_deref().expect("pool item accessed after release")
    }
}

impl<T> DerefMut for Loaned<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_deref_mut().expect("pool item accessed after release")
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Loaned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaned").field("item", &self.item).finish()
    }
}

impl<T> Drop for Loaned<T> {
    fn drop(&mut self) {
        if let (Some(item), Some(pool)) = (self.item.take(), self.pool.upgrade()) {
            pool.free.lock().unwrap().push(item);
        }
    }
}

/// Reference-counted read-only view of a pool buffer. Clone to add a
/// reference, drop to release one.
pub type Shared<T> = Arc<Loaned<T>>;

/// Number of live references to a shared buffer.
pub fn ref_count<T>(shared: &Shared<T>) -> usize {
    Arc::strong_count(shared)
}
