//! MCS queue lock
//!
//! Waiters append a node to a queue tail with one atomic swap and then spin
//! only on their own node's flag, so contention stays local and the lock is
//! handed over in FIFO order. The guard cannot leave its thread.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use super::Backoff;

struct QNode {
    locked: AtomicBool,
    next: AtomicPtr<QNode>,
}

impl QNode {
    fn alloc() -> *mut QNode {
        Box::into_raw(Box::new(QNode {
            locked: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

pub struct FairMutex<T> {
    tail: AtomicPtr<QNode>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the queue; the guard is the only
// path to it.
unsafe impl<T: Send> Send for FairMutex<T> {}
unsafe impl<T: Send> Sync for FairMutex<T> {}

impl<T> FairMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            tail: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> FairMutexGuard<'_, T> {
        let node = QNode::alloc();
        let pred = self.tail.swap(node, Ordering::AcqRel);
        if !pred.is_null() {
            // SAFETY: `pred` stays allocated until its owner sees our link.
            unsafe { (*pred).next.store(node, Ordering::Release) };
            let mut backoff = Backoff::new();
            // SAFETY: we own `node` until our own unlock frees it.
            while unsafe { (*node).locked.load(Ordering::Acquire) } {
                backoff.snooze();
            }
        }
        FairMutexGuard {
            lock: self,
            node,
            _not_send: PhantomData,
        }
    }

    pub fn try_lock(&self) -> Option<FairMutexGuard<'_, T>> {
        let node = QNode::alloc();
        match self
            .tail
            .compare_exchange(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => Some(FairMutexGuard {
                lock: self,
                node,
                _not_send: PhantomData,
            }),
            Err(_) => {
                // SAFETY: never published
                drop(unsafe { Box::from_raw(node) });
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        !self.tail.load(Ordering::Acquire).is_null()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for FairMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[must_use = "dropping the guard immediately releases the lock"]
pub struct FairMutexGuard<'a, T> {
    lock: &'a FairMutex<T>,
    node: *mut QNode,
    _not_send: PhantomData<*mut ()>,
}

impl<T> Deref for FairMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for FairMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for FairMutexGuard<'_, T> {
    fn drop(&mut self) {
        let node = self.node;
        // SAFETY: `node` is ours; successors only touch it before we observe
        // their link, and nobody touches it after we hand over.
        unsafe {
            let mut next = (*node).next.load(Ordering::Acquire);
            if next.is_null() {
                if self
                    .lock
                    .tail
                    .compare_exchange(node, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    drop(Box::from_raw(node));
                    return;
                }
                // a successor swapped the tail but has not linked yet
                let mut backoff = Backoff::new();
                loop {
                    next = (*node).next.load(Ordering::Acquire);
                    if !next.is_null() {
                        break;
                    }
                    backoff.snooze();
                }
            }
            (*next).locked.store(false, Ordering::Release);
            drop(Box::from_raw(node));
        }
    }
}
