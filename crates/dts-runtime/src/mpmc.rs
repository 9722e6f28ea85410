//! Lock-free MPMC FIFO (Michael–Scott linked queue).
//!
//! Unbounded queue of heap nodes with a permanent dummy head. `push`
//! CAS-appends to `tail.next` then swings `tail`; `pop` CAS-advances `head`,
//! moves the value out of the new dummy, and retires the old head through the
//! hazard domain. Concurrent helpers advance a lagging tail on both sides.
//!
//! # Ordering
//!
//! Hot loads are acquire; new-node linkage stores are release. A node is
//! reachable only after the release CAS that links it, so a dequeuer's
//! acquire load of `next` sees fully initialized node contents.
//!
//! # Safety
//!
//! Every raw dereference happens under a hazard guard that was re-validated
//! against the queue after protecting (the standard protect-then-recheck
//! dance): a node can only be retired after it is unlinked, and the recheck
//! proves it was still linked after protection was visible. Popped nodes are
//! freed exclusively by the hazard domain, with a `Node<T>` deleter.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::hazard::{self, HazardGuard};

struct Node<T> {
    /// `None` only in the dummy position. The winning dequeuer takes the
    /// value out of the node that becomes the new dummy.
    value: UnsafeCell<Option<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn dummy() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// Unbounded lock-free multi-producer multi-consumer queue.
pub struct MpmcQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    /// Approximate element count, maintained relaxed for observers.
    len: AtomicUsize,
}

// SAFETY: values move through the queue by ownership; all shared node access
// is mediated by atomics plus the hazard protocol described above.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpmcQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::<T>::dummy();
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            len: AtomicUsize::new(0),
        }
    }

    /// Append `value`. Lock-free: loops only while contending.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: UnsafeCell::new(Some(value)),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let tail_guard = HazardGuard::acquire();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            tail_guard.protect(tail);
            // Re-validate: tail may have been popped (through the dummy
            // position) and retired before the protection was visible.
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }

            // SAFETY: `tail` is protected and re-validated, so it has not
            // been freed.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if next.is_null() {
                // Linearization point: link the node.
                // SAFETY: as above.
                if unsafe {
                    (*tail)
                        .next
                        .compare_exchange_weak(
                            ptr::null_mut(),
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                } {
                    // Swing tail; failure means a helper already did.
                    let _ = self.tail.compare_exchange_weak(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // Help a lagging tail forward.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }
            std::hint::spin_loop();
        }
    }

    /// Remove the oldest value, or `None` when empty.
    pub fn pop(&self) -> Option<T> {
        let head_guard = HazardGuard::acquire();
        let next_guard = HazardGuard::acquire();
        loop {
            let head = self.head.load(Ordering::Acquire);
            head_guard.protect(head);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: `head` is protected and re-validated.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            next_guard.protect(next);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }

            if next.is_null() {
                return None;
            }

            if head == tail {
                // Tail lags behind an appended node; help it forward.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
                continue;
            }

            // Linearization point: advance head past the old dummy.
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: we won the CAS, so `next` is the new dummy and only
                // this thread takes its value; `next` is protected, so it
                // cannot be freed under us even if it is popped concurrently.
                let value = unsafe { (*(*next).value.get()).take() };
                self.len.fetch_sub(1, Ordering::Relaxed);

                head_guard.clear();
                next_guard.clear();
                // SAFETY: the old dummy is unlinked and unreachable for new
                // readers; the domain frees it once no guard protects it.
                unsafe { hazard::retire(head) };

                debug_assert!(value.is_some());
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: free the dummy and any unpopped nodes directly.
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            // SAFETY: no other thread can touch the queue during drop.
            let node = unsafe { Box::from_raw(current) };
            current = node.next.load(Ordering::Relaxed);
        }
    }
}
