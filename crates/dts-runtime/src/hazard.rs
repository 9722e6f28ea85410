//! Hazard-pointer safe reclamation.
//!
//! Readers of a lock-free structure publish the pointer they are about to
//! dereference in a *slot*; mutators that unlink a node [`retire`] it instead
//! of freeing it, and the domain defers the free until no slot holds that
//! address.
//!
//! One process-wide domain, initialized at first use. Slots live in a global
//! singly-linked list and are claimed per thread, never freed — a released
//! slot is recycled by the next [`HazardGuard::acquire`]. Retired records
//! collect in a thread-local list first (threshold [`LOCAL_RETIRE_THRESHOLD`])
//! and are spliced into the global retired list under a mutex; once the
//! global list crosses [`GLOBAL_SCAN_THRESHOLD`], a [`scan`] runs.
//!
//! # Ordering
//!
//! `protect` stores with release and `scan` loads with acquire. Paired with
//! the acquire/release CASes on the owning structure's head/tail this
//! guarantees that any pointer a reader could still reach was visible to the
//! scan that decides whether to free it. Callers must re-validate the source
//! pointer after protecting it (see [`crate::mpmc`]) — protection only means
//! anything once the pointer is confirmed still reachable.
//!
//! # Safety
//!
//! `retire` takes ownership of a raw pointer; the deleter runs exactly once,
//! outside every domain lock. Double retire of the same pointer is undefined
//! behavior, exactly like double `Box::from_raw`.

use std::cell::RefCell;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// Retired records a thread buffers before publishing them to the domain.
pub const LOCAL_RETIRE_THRESHOLD: usize = 100;

/// Global retired-list size that triggers a reclamation pass.
pub const GLOBAL_SCAN_THRESHOLD: usize = 5_000;

// ── Slots ─────────────────────────────────────────────────────────────────────

struct Slot {
    /// The protected address. Null while the owning guard protects nothing.
    protected: AtomicPtr<u8>,
    /// Claiming thread, 0 = free. Release store on claim and release so a
    /// slot is never observed claimed with a stale protected value.
    owner: AtomicU64,
    /// Immutable after the slot is linked in.
    next: *const Slot,
}

// SAFETY: Slot is only ever accessed through atomics; `next` is written once
// before the slot is published to the list head.
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

// ── Retired records ───────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Retired {
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

// SAFETY: a retired pointer is owned by the domain until its deleter runs;
// no aliasing access remains once `retire` was called.
unsafe impl Send for Retired {}

unsafe fn drop_erased<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr.cast::<T>()));
}

// ── Domain ────────────────────────────────────────────────────────────────────

/// The process-wide hazard-pointer domain.
pub struct HazardDomain {
    slots: AtomicPtr<Slot>,
    global_retired: Mutex<Vec<Retired>>,
}

static DOMAIN: OnceLock<HazardDomain> = OnceLock::new();

/// The default domain, initialized at first use.
pub fn domain() -> &'static HazardDomain {
    DOMAIN.get_or_init(|| HazardDomain {
        slots: AtomicPtr::new(ptr::null_mut()),
        global_retired: Mutex::new(Vec::new()),
    })
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

fn thread_id() -> u64 {
    thread_local! {
        static ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

impl HazardDomain {
    /// Claim a free slot or append a new one.
    fn acquire_slot(&self) -> &'static Slot {
        let me = thread_id();

        // First pass: recycle a released slot.
        let mut current = self.slots.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: slots are never freed once linked.
            let slot = unsafe { &*current };
            if slot.owner.load(Ordering::Relaxed) == 0
                && slot
                    .owner
                    .compare_exchange(0, me, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return slot;
            }
            current = slot.next as *mut Slot;
        }

        // No free slot: link a fresh one at the head.
        let slot = Box::into_raw(Box::new(Slot {
            protected: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicU64::new(me),
            next: ptr::null(),
        }));
        loop {
            let head = self.slots.load(Ordering::Acquire);
            // SAFETY: slot is not yet shared; next is written before the
            // publishing CAS below.
            unsafe { (*slot).next = head };
            if self
                .slots
                .compare_exchange_weak(head, slot, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: published slots live for the process lifetime.
                return unsafe { &*slot };
            }
        }
    }

    /// Snapshot every currently protected pointer.
    fn protected_set(&self) -> HashSet<usize> {
        let mut set = HashSet::new();
        let mut current = self.slots.load(Ordering::Acquire);
        while !current.is_null() {
            // SAFETY: slots are never freed once linked.
            let slot = unsafe { &*current };
            let ptr = slot.protected.load(Ordering::Acquire);
            if !ptr.is_null() {
                set.insert(ptr as usize);
            }
            current = slot.next as *mut Slot;
        }
        set
    }

    /// Bulk reclamation pass: free every retired record no slot protects.
    /// Deleters run outside the lock.
    pub fn scan(&self) {
        let protected = self.protected_set();
        let mut reclaim = Vec::new();
        {
            let mut global = self.global_retired.lock().unwrap();
            global.retain(|record| {
                if protected.contains(&(record.ptr as usize)) {
                    true
                } else {
                    reclaim.push(*record);
                    false
                }
            });
        }
        for record in reclaim {
            // SAFETY: the record left the retired list exactly once, and no
            // slot protected its pointer at snapshot time. The release store
            // in `clear`/`Drop` of the last protecting guard happened-before
            // our acquire load of that slot.
            unsafe { (record.deleter)(record.ptr) };
        }
    }

    fn splice_and_maybe_scan(&self, records: &mut Vec<Retired>) {
        let over_threshold = {
            let mut global = self.global_retired.lock().unwrap();
            global.append(records);
            global.len() > GLOBAL_SCAN_THRESHOLD
        };
        // Scan re-takes the lock, so decide under it and run outside it.
        if over_threshold {
            self.scan();
        }
    }

    /// Retired records still buffered across all threads plus the global list.
    /// Test observability only; racy by nature.
    pub fn global_retired_len(&self) -> usize {
        self.global_retired.lock().unwrap().len()
    }
}

// ── Thread-local retired buffer ───────────────────────────────────────────────

struct LocalRetired {
    records: Vec<Retired>,
}

impl Drop for LocalRetired {
    fn drop(&mut self) {
        // Thread exit: strand nothing.
        if !self.records.is_empty() {
            domain().splice_and_maybe_scan(&mut self.records);
        }
    }
}

thread_local! {
    static LOCAL_RETIRED: RefCell<LocalRetired> = RefCell::new(LocalRetired {
        records: Vec::new(),
    });
}

/// Publish this thread's buffered retired records to the domain.
/// Called on worker exit; also runs implicitly as the TLS destructor.
pub fn flush_thread() {
    LOCAL_RETIRED.with(|local| {
        let records = &mut local.borrow_mut().records;
        if !records.is_empty() {
            domain().splice_and_maybe_scan(records);
        }
    });
}

/// Declare `ptr` logically unreachable. The pointed-to `T` is dropped (as a
/// `Box<T>`) at or after the first moment no slot protects the address.
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw`, must not be retired twice, and no
/// new references to it may be created after this call.
pub unsafe fn retire<T>(ptr: *mut T) {
    retire_with(ptr.cast(), drop_erased::<T>);
}

/// As [`retire`] with an explicit erased deleter.
///
/// # Safety
///
/// As [`retire`]; additionally `deleter` must be sound to call once on `ptr`.
pub unsafe fn retire_with(ptr: *mut u8, deleter: unsafe fn(*mut u8)) {
    let record = Retired { ptr, deleter };
    LOCAL_RETIRED.with(|local| {
        let records = &mut local.borrow_mut().records;
        records.push(record);
        if records.len() >= LOCAL_RETIRE_THRESHOLD {
            domain().splice_and_maybe_scan(records);
        }
    });
}

/// Force-publish and reclaim everything reclaimable. Test helper.
pub fn flush_and_scan() {
    flush_thread();
    domain().scan();
}

// ── Guard ─────────────────────────────────────────────────────────────────────

/// RAII claim on one hazard slot.
///
/// While [`protect`](Self::protect) holds a non-null pointer, no [`retire`]d
/// record with that address is freed. Dropping the guard clears the slot and
/// releases it for reuse.
pub struct HazardGuard {
    slot: &'static Slot,
}

impl HazardGuard {
    pub fn acquire() -> Self {
        Self {
            slot: domain().acquire_slot(),
        }
    }

    /// Publish `ptr` as in-use. Callers must re-validate that `ptr` is still
    /// reachable from the owning structure afterwards.
    #[inline]
    pub fn protect<T>(&self, ptr: *mut T) {
        self.slot.protected.store(ptr.cast(), Ordering::Release);
    }

    /// Stop protecting without releasing the slot.
    #[inline]
    pub fn clear(&self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::Release);
    }

    /// Currently protected pointer, for assertions.
    pub fn get(&self) -> *mut u8 {
        self.slot.protected.load(Ordering::Acquire)
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.slot.protected.store(ptr::null_mut(), Ordering::Release);
        debug_assert_eq!(self.slot.owner.load(Ordering::Relaxed), thread_id());
        self.slot.owner.store(0, Ordering::Release);
    }
}
