//! Fixed-size memory pools
//!
//! Every kernel object lives in a statically sized pool: TCBs, task
//! stacks (three size classes), queue control blocks and their buffers
//! (three size classes), semaphore and mutex blocks. A pool is a bitmap
//! over an array of same-typed slots; allocation is lowest-set-bit
//! lookup, freeing validates the pointer and rejects double-frees.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::config::{
    DEFAULT_STACK_SIZE, LARGE_BUFFER_SIZE, LARGE_STACK_SIZE, MAX_DEFAULT_STACKS,
    MAX_LARGE_BUFFERS, MAX_LARGE_STACKS, MAX_MEDIUM_BUFFERS, MAX_MUTEXES, MAX_QUEUES,
    MAX_SEMAPHORES, MAX_SMALL_BUFFERS, MAX_SMALL_STACKS, MAX_TASKS, MEDIUM_BUFFER_SIZE,
    SMALL_BUFFER_SIZE, SMALL_STACK_SIZE,
};
use crate::critical::critical_section;
use crate::cs_cell::CsCell;
use crate::sync::mutex::MutexCb;
use crate::sync::queue::QueueCb;
use crate::sync::sem::SemCb;
use crate::task::Tcb;

/// Identifies one of the kernel's object pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolId {
    Tcb = 0,
    StackSmall,
    StackDefault,
    StackLarge,
    Qcb,
    BufferSmall,
    BufferMedium,
    BufferLarge,
    Scb,
    Mcb,
}

/// Number of pools.
pub const POOL_COUNT: usize = 10;

/// Pool usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub peak: usize,
}

// ============ Pool bookkeeping ============

struct Pool {
    base: *mut u8,
    slot_size: usize,
    slot_count: usize,
    free_bitmap: u32,
    free_count: usize,
    peak_used: usize,
}

unsafe impl Send for Pool {}

impl Pool {
    const fn unbound() -> Self {
        Pool {
            base: core::ptr::null_mut(),
            slot_size: 0,
            slot_count: 0,
            free_bitmap: 0,
            free_count: 0,
            peak_used: 0,
        }
    }

    fn init(&mut self, base: *mut u8, slot_size: usize, slot_count: usize) {
        debug_assert!(slot_count > 0 && slot_count < 32);
        self.base = base;
        self.slot_size = slot_size;
        self.slot_count = slot_count;
        self.free_bitmap = (1u32 << slot_count) - 1;
        self.free_count = slot_count;
        self.peak_used = 0;
    }

    fn alloc(&mut self) -> Option<NonNull<u8>> {
        if self.free_count == 0 {
            return None;
        }

        let index = self.free_bitmap.trailing_zeros() as usize;
        if index >= self.slot_count {
            return None;
        }

        self.free_bitmap &= !(1 << index);
        self.free_count -= 1;

        let used = self.slot_count - self.free_count;
        if used > self.peak_used {
            self.peak_used = used;
        }

        let ptr = unsafe { self.base.add(index * self.slot_size) };
        unsafe { core::ptr::write_bytes(ptr, 0, self.slot_size) };

        NonNull::new(ptr)
    }

    /// Slot index of a pointer, rejecting out-of-range and misaligned
    /// addresses.
    fn slot_index(&self, ptr: *mut u8) -> Option<usize> {
        if ptr.is_null() || self.base.is_null() || (ptr as usize) < (self.base as usize) {
            return None;
        }

        let offset = ptr as usize - self.base as usize;
        if offset >= self.slot_size * self.slot_count || offset % self.slot_size != 0 {
            return None;
        }

        Some(offset / self.slot_size)
    }

    fn free(&mut self, ptr: *mut u8) -> bool {
        let Some(index) = self.slot_index(ptr) else {
            return false;
        };

        // Already free: double-free or stale pointer
        if self.free_bitmap & (1 << index) != 0 {
            return false;
        }

        self.free_bitmap |= 1 << index;
        self.free_count += 1;
        true
    }

    fn slot_in_use(&self, index: usize) -> bool {
        index < self.slot_count && self.free_bitmap & (1 << index) == 0
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.slot_count,
            used: self.slot_count - self.free_count,
            free: self.free_count,
            peak: self.peak_used,
        }
    }
}

// ============ Backing storage ============

static mut TCB_SLOTS: [Tcb; MAX_TASKS] = [const { Tcb::new() }; MAX_TASKS];

static mut SMALL_STACKS: [[u32; SMALL_STACK_SIZE / 4]; MAX_SMALL_STACKS] =
    [[0; SMALL_STACK_SIZE / 4]; MAX_SMALL_STACKS];
static mut DEFAULT_STACKS: [[u32; DEFAULT_STACK_SIZE / 4]; MAX_DEFAULT_STACKS] =
    [[0; DEFAULT_STACK_SIZE / 4]; MAX_DEFAULT_STACKS];
static mut LARGE_STACKS: [[u32; LARGE_STACK_SIZE / 4]; MAX_LARGE_STACKS] =
    [[0; LARGE_STACK_SIZE / 4]; MAX_LARGE_STACKS];

static mut QCB_SLOTS: [QueueCb; MAX_QUEUES] = [const { QueueCb::new() }; MAX_QUEUES];

static mut SMALL_BUFFERS: [[u8; SMALL_BUFFER_SIZE]; MAX_SMALL_BUFFERS] =
    [[0; SMALL_BUFFER_SIZE]; MAX_SMALL_BUFFERS];
static mut MEDIUM_BUFFERS: [[u8; MEDIUM_BUFFER_SIZE]; MAX_MEDIUM_BUFFERS] =
    [[0; MEDIUM_BUFFER_SIZE]; MAX_MEDIUM_BUFFERS];
static mut LARGE_BUFFERS: [[u8; LARGE_BUFFER_SIZE]; MAX_LARGE_BUFFERS] =
    [[0; LARGE_BUFFER_SIZE]; MAX_LARGE_BUFFERS];

static mut SCB_SLOTS: [SemCb; MAX_SEMAPHORES] = [const { SemCb::new() }; MAX_SEMAPHORES];
static mut MCB_SLOTS: [MutexCb; MAX_MUTEXES] = [const { MutexCb::new() }; MAX_MUTEXES];

static POOLS: CsCell<[Pool; POOL_COUNT]> = CsCell::new([const { Pool::unbound() }; POOL_COUNT]);

// ============ Public API ============

/// Bind every pool to its backing storage and mark all slots free.
pub fn pools_init() {
    critical_section(|cs| {
        let pools = POOLS.get(cs);

        pools[PoolId::Tcb as usize].init(
            (&raw mut TCB_SLOTS) as *mut u8,
            size_of::<Tcb>(),
            MAX_TASKS,
        );

        pools[PoolId::StackSmall as usize].init(
            (&raw mut SMALL_STACKS) as *mut u8,
            SMALL_STACK_SIZE,
            MAX_SMALL_STACKS,
        );
        pools[PoolId::StackDefault as usize].init(
            (&raw mut DEFAULT_STACKS) as *mut u8,
            DEFAULT_STACK_SIZE,
            MAX_DEFAULT_STACKS,
        );
        pools[PoolId::StackLarge as usize].init(
            (&raw mut LARGE_STACKS) as *mut u8,
            LARGE_STACK_SIZE,
            MAX_LARGE_STACKS,
        );

        pools[PoolId::Qcb as usize].init(
            (&raw mut QCB_SLOTS) as *mut u8,
            size_of::<QueueCb>(),
            MAX_QUEUES,
        );

        pools[PoolId::BufferSmall as usize].init(
            (&raw mut SMALL_BUFFERS) as *mut u8,
            SMALL_BUFFER_SIZE,
            MAX_SMALL_BUFFERS,
        );
        pools[PoolId::BufferMedium as usize].init(
            (&raw mut MEDIUM_BUFFERS) as *mut u8,
            MEDIUM_BUFFER_SIZE,
            MAX_MEDIUM_BUFFERS,
        );
        pools[PoolId::BufferLarge as usize].init(
            (&raw mut LARGE_BUFFERS) as *mut u8,
            LARGE_BUFFER_SIZE,
            MAX_LARGE_BUFFERS,
        );

        pools[PoolId::Scb as usize].init(
            (&raw mut SCB_SLOTS) as *mut u8,
            size_of::<SemCb>(),
            MAX_SEMAPHORES,
        );
        pools[PoolId::Mcb as usize].init(
            (&raw mut MCB_SLOTS) as *mut u8,
            size_of::<MutexCb>(),
            MAX_MUTEXES,
        );
    });
}

/// Allocate one zero-filled slot from `pool`, or `None` when exhausted.
pub fn alloc(pool: PoolId) -> Option<NonNull<u8>> {
    let ptr = critical_section(|cs| POOLS.get(cs)[pool as usize].alloc());
    if ptr.is_none() {
        crate::warn!("pool {} exhausted", pool as u8);
    }
    ptr
}

/// Return a slot to `pool`.
///
/// Rejects pointers outside the pool, misaligned pointers, and slots that
/// are already free.
pub fn free(pool: PoolId, ptr: *mut u8) -> bool {
    critical_section(|cs| POOLS.get(cs)[pool as usize].free(ptr))
}

/// Usage snapshot of `pool`.
pub fn stats(pool: PoolId) -> PoolStats {
    critical_section(|cs| POOLS.get(cs)[pool as usize].stats())
}

// ============ Task helpers ============

pub(crate) fn alloc_tcb() -> Option<NonNull<Tcb>> {
    alloc(PoolId::Tcb).map(NonNull::cast)
}

pub(crate) fn free_tcb(tcb: NonNull<Tcb>) -> bool {
    free(PoolId::Tcb, tcb.as_ptr() as *mut u8)
}

/// Allocate a stack from the smallest class that fits `requested` bytes.
/// Returns the stack base and the class's actual size.
pub(crate) fn alloc_stack(requested: usize) -> Option<(NonNull<u32>, usize)> {
    let (pool, size) = if requested <= SMALL_STACK_SIZE {
        (PoolId::StackSmall, SMALL_STACK_SIZE)
    } else if requested <= DEFAULT_STACK_SIZE {
        (PoolId::StackDefault, DEFAULT_STACK_SIZE)
    } else if requested <= LARGE_STACK_SIZE {
        (PoolId::StackLarge, LARGE_STACK_SIZE)
    } else {
        return None;
    };

    alloc(pool).map(|ptr| (ptr.cast(), size))
}

/// Return a stack to whichever size class it came from.
pub(crate) fn free_stack(stack: *mut u32) -> bool {
    let ptr = stack as *mut u8;
    free(PoolId::StackSmall, ptr)
        || free(PoolId::StackDefault, ptr)
        || free(PoolId::StackLarge, ptr)
}

/// Pointer to TCB pool slot `index`; used by the idle-task reaper.
pub(crate) fn tcb_slot_ptr(index: usize) -> *mut Tcb {
    debug_assert!(index < MAX_TASKS);
    unsafe { ((&raw mut TCB_SLOTS) as *mut Tcb).add(index) }
}

/// Whether TCB pool slot `index` is currently allocated.
///
/// # Safety
/// Caller holds the kernel critical section.
pub(crate) unsafe fn tcb_slot_in_use(index: usize) -> bool {
    (unsafe { POOLS.get_unchecked() })[PoolId::Tcb as usize].slot_in_use(index)
}

// ============ Queue helpers ============

pub(crate) fn alloc_qcb() -> Option<NonNull<QueueCb>> {
    alloc(PoolId::Qcb).map(NonNull::cast)
}

pub(crate) fn free_qcb(qcb: NonNull<QueueCb>) -> bool {
    free(PoolId::Qcb, qcb.as_ptr() as *mut u8)
}

/// Allocate a queue buffer from the smallest class that fits `requested`
/// bytes.
pub(crate) fn alloc_queue_buffer(requested: usize) -> Option<NonNull<u8>> {
    let pool = if requested <= SMALL_BUFFER_SIZE {
        PoolId::BufferSmall
    } else if requested <= MEDIUM_BUFFER_SIZE {
        PoolId::BufferMedium
    } else if requested <= LARGE_BUFFER_SIZE {
        PoolId::BufferLarge
    } else {
        return None;
    };

    alloc(pool)
}

/// Return a queue buffer to whichever size class it came from.
pub(crate) fn free_queue_buffer(buffer: *mut u8) -> bool {
    free(PoolId::BufferSmall, buffer)
        || free(PoolId::BufferMedium, buffer)
        || free(PoolId::BufferLarge, buffer)
}

// ============ Semaphore / mutex helpers ============

pub(crate) fn alloc_scb() -> Option<NonNull<SemCb>> {
    alloc(PoolId::Scb).map(NonNull::cast)
}

pub(crate) fn free_scb(scb: NonNull<SemCb>) -> bool {
    free(PoolId::Scb, scb.as_ptr() as *mut u8)
}

pub(crate) fn alloc_mcb() -> Option<NonNull<MutexCb>> {
    alloc(PoolId::Mcb).map(NonNull::cast)
}

pub(crate) fn free_mcb(mcb: NonNull<MutexCb>) -> bool {
    free(PoolId::Mcb, mcb.as_ptr() as *mut u8)
}
