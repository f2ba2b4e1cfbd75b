//! Host-side kernel tests
//!
//! These exercise the stateful half of the kernel: pools, task
//! lifecycle, scheduler decisions, tick processing, and the sync
//! objects. The host port performs no real context switches, so tests
//! drive the scheduler's observable state (ready queues, wake reasons,
//! the pending next-task choice) and complete hand-offs explicitly.
//!
//! Kernel state is global; every test serializes on one lock and resets
//! the kernel before running.

use std::sync::{Mutex, MutexGuard};

use crate::config::*;
use crate::critical::critical_section;
use crate::error::KernelError;
use crate::kernel::{self, KERNEL};
use crate::mem::{self, PoolId};
use crate::sched;
use crate::sync::wait::{self, WaitList};
use crate::task::{self, TaskHandle};
use crate::time;
use crate::types::*;
use crate::{
    mutex_create, mutex_delete, mutex_get_owner, mutex_has_waiting_tasks, mutex_is_locked,
    mutex_lock, mutex_try_lock, mutex_unlock, queue_create, queue_delete, queue_is_empty,
    queue_is_full, queue_messages_waiting, queue_receive_immediate, queue_send_immediate,
    sem_create, sem_create_binary, sem_create_counting, sem_delete, sem_get_count,
    sem_has_waiting_tasks, sem_post, sem_try_wait, sem_wait,
};

static LOCK: Mutex<()> = Mutex::new(());

/// Serialize on the global kernel and bring it up fresh.
fn setup() -> MutexGuard<'static, ()> {
    let guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    kernel::reset_for_tests();
    kernel::kernel_init();
    guard
}

fn never_runs(_: *mut ()) -> ! {
    unreachable!("host tests never execute task bodies");
}

fn spawn(name: &str, prio: Prio) -> TaskHandle {
    task::task_create(never_runs, name, 0, core::ptr::null_mut(), prio)
        .expect("task_create failed")
}

fn spawn_small(name: &str, prio: Prio) -> Option<TaskHandle> {
    task::task_create(never_runs, name, SMALL_STACK_SIZE, core::ptr::null_mut(), prio)
}

/// Pretend the scheduler switched `task` in: off the ready queue,
/// Running, current.
fn make_current(task: TaskHandle) {
    critical_section(|_cs| unsafe {
        sched::remove_task(task);
        (*task.as_ptr()).state = TaskState::Running;
        kernel::set_current_tcb(Some(task));
        kernel::set_next_tcb(Some(task));
    });
}

/// Complete the pending hand-off the way the context switch would.
fn complete_switch() {
    critical_section(|_cs| kernel::set_current_tcb(kernel::next_tcb()));
}

/// Block `task` on a wait-list exactly as the blocking loop would, then
/// clear the current pointer as if the CPU had moved on.
fn block_on(list: *mut WaitList, task: TaskHandle, wake_tick: Option<Tick>) {
    make_current(task);
    critical_section(|_cs| unsafe { wait::block_current(list, wake_tick) });
    critical_section(|_cs| kernel::set_current_tcb(None));
}

fn state_of(task: TaskHandle) -> TaskState {
    critical_section(|_cs| unsafe { task.as_ref() }.state())
}

fn wake_reason_of(task: TaskHandle) -> WakeReason {
    critical_section(|_cs| unsafe { task.as_ref() }.wake_reason())
}

fn effective_prio_of(task: TaskHandle) -> Prio {
    critical_section(|_cs| unsafe { task.as_ref() }.effective_priority())
}

// ============ Pools ============

mod pool_tests {
    use super::*;

    #[test]
    fn alloc_free_keeps_counts_consistent() {
        let _guard = setup();

        let before = mem::stats(PoolId::BufferSmall);
        assert_eq!(before.total, MAX_SMALL_BUFFERS);
        assert_eq!(before.used + before.free, before.total);

        let a = mem::alloc(PoolId::BufferSmall).unwrap();
        let b = mem::alloc(PoolId::BufferSmall).unwrap();

        let mid = mem::stats(PoolId::BufferSmall);
        assert_eq!(mid.used, before.used + 2);
        assert_eq!(mid.used + mid.free, mid.total);

        assert!(mem::free(PoolId::BufferSmall, a.as_ptr()));
        assert!(mem::free(PoolId::BufferSmall, b.as_ptr()));

        let after = mem::stats(PoolId::BufferSmall);
        assert_eq!(after.used, before.used);
        assert_eq!(after.peak, before.used + 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let _guard = setup();

        let mut held = std::vec::Vec::new();
        for _ in 0..MAX_MUTEXES {
            held.push(mem::alloc(PoolId::Mcb).unwrap());
        }
        assert!(mem::alloc(PoolId::Mcb).is_none());

        for ptr in held {
            assert!(mem::free(PoolId::Mcb, ptr.as_ptr()));
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let _guard = setup();

        let ptr = mem::alloc(PoolId::BufferMedium).unwrap();
        assert!(mem::free(PoolId::BufferMedium, ptr.as_ptr()));
        assert!(!mem::free(PoolId::BufferMedium, ptr.as_ptr()));

        let stats = mem::stats(PoolId::BufferMedium);
        assert_eq!(stats.used, 0);
    }

    #[test]
    fn foreign_and_misaligned_pointers_are_rejected() {
        let _guard = setup();

        let ptr = mem::alloc(PoolId::BufferSmall).unwrap();

        // Interior pointer: misaligned with the slot grid
        assert!(!mem::free(PoolId::BufferSmall, unsafe { ptr.as_ptr().add(1) }));
        // Pointer into a different pool's storage
        assert!(!mem::free(PoolId::BufferMedium, ptr.as_ptr()));
        // Null
        assert!(!mem::free(PoolId::BufferSmall, core::ptr::null_mut()));

        assert!(mem::free(PoolId::BufferSmall, ptr.as_ptr()));
    }

    #[test]
    fn allocations_are_zero_filled() {
        let _guard = setup();

        let ptr = mem::alloc(PoolId::BufferSmall).unwrap();
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xAB, SMALL_BUFFER_SIZE) };
        assert!(mem::free(PoolId::BufferSmall, ptr.as_ptr()));

        // Lowest-free-bit allocation hands the same slot back
        let again = mem::alloc(PoolId::BufferSmall).unwrap();
        assert_eq!(again, ptr);
        for offset in 0..SMALL_BUFFER_SIZE {
            assert_eq!(unsafe { *again.as_ptr().add(offset) }, 0);
        }
        mem::free(PoolId::BufferSmall, again.as_ptr());
    }

    #[test]
    fn allocations_stay_in_bounds_and_aligned() {
        let _guard = setup();

        let base = mem::alloc(PoolId::BufferLarge).unwrap();
        let second = mem::alloc(PoolId::BufferLarge).unwrap();

        let delta = second.as_ptr() as usize - base.as_ptr() as usize;
        assert_eq!(delta % LARGE_BUFFER_SIZE, 0);

        mem::free(PoolId::BufferLarge, base.as_ptr());
        mem::free(PoolId::BufferLarge, second.as_ptr());
    }

    #[test]
    fn stack_classes_round_up() {
        let _guard = setup();

        let (small, size) = mem::alloc_stack(100).unwrap();
        assert_eq!(size, SMALL_STACK_SIZE);

        let (default, size) = mem::alloc_stack(SMALL_STACK_SIZE + 1).unwrap();
        assert_eq!(size, DEFAULT_STACK_SIZE);

        let (large, size) = mem::alloc_stack(2000).unwrap();
        assert_eq!(size, LARGE_STACK_SIZE);

        assert!(mem::alloc_stack(LARGE_STACK_SIZE + 1).is_none());

        assert!(mem::free_stack(small.as_ptr()));
        assert!(mem::free_stack(default.as_ptr()));
        assert!(mem::free_stack(large.as_ptr()));
    }
}

// ============ Task lifecycle ============

mod task_tests {
    use super::*;

    #[test]
    fn create_validates_inputs() {
        let _guard = setup();

        assert!(task::task_create(never_runs, "", 0, core::ptr::null_mut(), 3).is_none());
        assert!(
            task::task_create(never_runs, "late", 0, core::ptr::null_mut(), MAX_PRIORITY + 1)
                .is_none()
        );
    }

    #[test]
    fn create_allocates_and_initializes() {
        let _guard = setup();

        let before = mem::stats(PoolId::Tcb);
        let handle = spawn("worker", 3);
        let after = mem::stats(PoolId::Tcb);
        assert_eq!(after.used, before.used + 1);

        let tcb = unsafe { handle.as_ref() };
        assert_eq!(tcb.name(), "worker");
        assert_eq!(tcb.base_priority(), 3);
        assert_eq!(tcb.effective_priority(), 3);
        assert_eq!(tcb.state(), TaskState::Ready);
        assert_eq!(tcb.wake_reason(), WakeReason::None);
        assert_eq!(tcb.run_count(), 0);
    }

    #[test]
    fn long_names_are_truncated() {
        let _guard = setup();

        let handle = spawn("a-very-long-task-name-indeed", 4);
        assert_eq!(unsafe { handle.as_ref() }.name(), "a-very-long-tas");
    }

    #[test]
    fn delete_returns_slots() {
        let _guard = setup();

        let tcb_before = mem::stats(PoolId::Tcb);
        let stack_before = mem::stats(PoolId::StackDefault);

        let handle = spawn("doomed", 2);
        assert!(task::task_delete(handle).is_ok());

        assert_eq!(mem::stats(PoolId::Tcb).used, tcb_before.used);
        assert_eq!(mem::stats(PoolId::StackDefault).used, stack_before.used);
    }

    #[test]
    fn delete_of_idle_is_a_noop() {
        let _guard = setup();

        let idle = kernel::idle_tcb().unwrap();
        assert!(task::task_delete(idle).is_ok());
        assert_eq!(mem::stats(PoolId::Tcb).used, 1);
    }

    #[test]
    fn delete_of_object_blocked_task_is_refused() {
        let _guard = setup();
        KERNEL.set_running(true);

        let sem = sem_create(0, 1, "gate").unwrap();
        let handle = spawn("waiter", 3);
        let list = critical_section(|_cs| unsafe {
            &mut (*sem.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, handle, None);

        assert_eq!(task::task_delete(handle), Err(KernelError::TaskBlocked));

        // Still reachable through the semaphore
        assert!(sem_has_waiting_tasks(sem));
    }

    #[test]
    fn self_delete_defers_reclamation_to_the_reaper() {
        let _guard = setup();
        KERNEL.set_running(true);

        let used_before = mem::stats(PoolId::Tcb).used;
        let handle = spawn("suicidal", 3);
        make_current(handle);

        assert!(task::task_delete(handle).is_ok());
        assert_eq!(state_of(handle), TaskState::Deleted);
        // Slots still held until the idle task reaps
        assert_eq!(mem::stats(PoolId::Tcb).used, used_before + 1);

        // Reaper skips the task while it is still current
        task::reap_deleted_tasks();
        assert_eq!(mem::stats(PoolId::Tcb).used, used_before + 1);

        // Once the switch completes, the slots come back
        complete_switch();
        task::reap_deleted_tasks();
        assert_eq!(mem::stats(PoolId::Tcb).used, used_before);
    }

    #[test]
    fn create_rolls_back_on_stack_exhaustion() {
        let _guard = setup();

        let a = task::task_create(never_runs, "big0", LARGE_STACK_SIZE, core::ptr::null_mut(), 3);
        let b = task::task_create(never_runs, "big1", LARGE_STACK_SIZE, core::ptr::null_mut(), 3);
        assert!(a.is_some() && b.is_some());

        let tcb_used = mem::stats(PoolId::Tcb).used;
        assert!(
            task::task_create(never_runs, "big2", LARGE_STACK_SIZE, core::ptr::null_mut(), 3)
                .is_none()
        );
        // The TCB taken for the failed create went back
        assert_eq!(mem::stats(PoolId::Tcb).used, tcb_used);
    }

    #[test]
    fn tcb_pool_exhausts_at_max_tasks() {
        let _guard = setup();

        // Idle occupies one TCB and one small stack
        let mut spawned = std::vec::Vec::new();
        for i in 0..3 {
            spawned.push(spawn_small(&std::format!("s{}", i), 3).unwrap());
        }
        for i in 0..4 {
            spawned.push(spawn(&std::format!("d{}", i), 3));
        }

        assert_eq!(mem::stats(PoolId::Tcb).used, MAX_TASKS);
        assert!(spawn_small("extra", 3).is_none());
    }

    #[test]
    fn stack_watermark_on_fresh_task() {
        let _guard = setup();

        let handle = spawn("fresh", 3);
        // Host stacks start empty
        assert_eq!(task::task_stack_used_bytes(handle), 0);
        assert!(task::task_stack_check(handle));
    }
}

// ============ Scheduler ============

mod sched_tests {
    use super::*;

    #[test]
    fn equal_priority_tasks_alternate_on_yield() {
        let _guard = setup();
        KERNEL.set_running(true);

        let a = spawn("a", 3);
        let b = spawn("b", 3);
        make_current(a);

        let mut order = std::vec::Vec::new();
        for _ in 0..6 {
            task::task_yield().unwrap();
            complete_switch();
            order.push(kernel::current_tcb().unwrap());
        }

        assert_eq!(order, std::vec![b, a, b, a, b, a]);
    }

    #[test]
    fn higher_priority_ready_task_preempts_at_tick() {
        let _guard = setup();
        KERNEL.set_running(true);

        let low = spawn("low", 5);
        let high = spawn("high", 1);

        // High delays for 3 ticks, low gets the CPU
        make_current(high);
        sched::delay_current(3);
        complete_switch();
        assert_eq!(kernel::current_tcb(), Some(low));
        assert_eq!(state_of(high), TaskState::Blocked);

        time::tick_handler();
        time::tick_handler();
        assert_eq!(state_of(high), TaskState::Blocked);

        // Third tick: high wakes and preempts low
        time::tick_handler();
        assert_eq!(state_of(high), TaskState::Running);
        assert_eq!(kernel::next_tcb(), Some(high));
        assert_eq!(state_of(low), TaskState::Ready);
    }

    #[test]
    fn delay_expires_after_exactly_the_requested_ticks() {
        let _guard = setup();
        KERNEL.set_running(true);
        KERNEL.tick_set(100);

        let t = spawn("sleeper", 3);
        make_current(t);
        sched::delay_current(5);
        complete_switch();

        for _ in 0..4 {
            time::tick_handler();
            assert_eq!(state_of(t), TaskState::Blocked);
        }

        time::tick_handler();
        assert_eq!(time::now(), 105);
        assert!(state_of(t) == TaskState::Ready || state_of(t) == TaskState::Running);
    }

    #[test]
    fn delays_survive_counter_wrap() {
        let _guard = setup();
        KERNEL.set_running(true);
        KERNEL.tick_set(0xFFFF_FFFE);

        let x = spawn("x", 3);
        let y = spawn("y", 4);

        // x wakes at tick 3, past the wrap; y at 0xFFFF_FFFF
        make_current(x);
        sched::delay_current(5);
        make_current(y);
        sched::delay_current(1);

        let current_epoch = critical_section(|_cs| unsafe { sched::state().delayed_current });
        let x_home = critical_section(|_cs| unsafe { (*x.as_ptr()).delay_home }) as usize;
        let y_home = critical_section(|_cs| unsafe { (*y.as_ptr()).delay_home }) as usize;
        assert_eq!(y_home, current_epoch);
        assert_eq!(x_home, current_epoch ^ 1);

        make_current(kernel::idle_tcb().unwrap());
        // Keep the CPU on idle so only the wakeups are observed
        kernel::sched_lock().unwrap();

        time::tick_handler();
        assert_eq!(time::now(), 0xFFFF_FFFF);
        assert_eq!(state_of(y), TaskState::Ready);
        assert_eq!(state_of(x), TaskState::Blocked);

        // Wrap: the epoch lists swap roles
        time::tick_handler();
        assert_eq!(time::now(), 0);
        assert_eq!(state_of(x), TaskState::Blocked);
        assert_eq!(
            critical_section(|_cs| unsafe { sched::state().delayed_current }),
            current_epoch ^ 1
        );

        time::tick_handler();
        time::tick_handler();
        assert_eq!(state_of(x), TaskState::Blocked);

        time::tick_handler();
        assert_eq!(time::now(), 3);
        assert_eq!(state_of(x), TaskState::Ready);
    }

    #[test]
    fn timeout_pulls_waiter_off_the_wait_list() {
        let _guard = setup();
        KERNEL.set_running(true);
        KERNEL.tick_set(100);

        let sem = sem_create(0, 1, "empty").unwrap();
        let t = spawn("recv", 3);
        let list = critical_section(|_cs| unsafe {
            &mut (*sem.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, t, Some(105));

        assert!(sem_has_waiting_tasks(sem));
        make_current(kernel::idle_tcb().unwrap());

        for _ in 0..4 {
            time::tick_handler();
            assert_eq!(state_of(t), TaskState::Blocked);
        }

        time::tick_handler();
        assert_eq!(time::now(), 105);
        assert_eq!(state_of(t), TaskState::Running);
        assert_eq!(wake_reason_of(t), WakeReason::Timeout);
        assert!(!sem_has_waiting_tasks(sem));
        assert!(critical_section(|_cs| unsafe { (*t.as_ptr()).waiting_on.is_null() }));
    }

    #[test]
    fn run_count_tracks_scheduling() {
        let _guard = setup();
        KERNEL.set_running(true);

        let a = spawn("a", 3);
        let b = spawn("b", 3);
        make_current(a);

        let a_before = critical_section(|_cs| unsafe { a.as_ref() }.run_count());
        let b_before = critical_section(|_cs| unsafe { b.as_ref() }.run_count());

        task::task_yield().unwrap();
        complete_switch();
        task::task_yield().unwrap();
        complete_switch();

        // One round: b was scheduled, then a again
        assert_eq!(critical_section(|_cs| unsafe { a.as_ref() }.run_count()), a_before + 1);
        assert_eq!(critical_section(|_cs| unsafe { b.as_ref() }.run_count()), b_before + 1);
    }

    #[test]
    fn yield_alone_in_band_keeps_running() {
        let _guard = setup();
        KERNEL.set_running(true);

        let a = spawn("solo", 3);
        make_current(a);

        task::task_yield().unwrap();
        complete_switch();
        assert_eq!(kernel::current_tcb(), Some(a));
        assert_eq!(state_of(a), TaskState::Running);
    }

    #[test]
    fn scheduler_lock_suppresses_preemption() {
        let _guard = setup();
        KERNEL.set_running(true);

        let low = spawn("low", 5);
        make_current(low);

        kernel::sched_lock().unwrap();

        assert_eq!(task::task_yield(), Err(KernelError::SchedulerLocked));
        assert_eq!(time::delay(5), Err(KernelError::SchedulerLocked));

        // A higher-priority wakeup does not steal the CPU while locked
        let high = spawn("high", 1);
        time::tick_handler();
        assert_eq!(state_of(high), TaskState::Ready);
        assert_eq!(kernel::next_tcb(), Some(low));

        kernel::sched_unlock().unwrap();
        assert_eq!(kernel::sched_unlock(), Err(KernelError::NotLocked));

        // Next tick preempts normally
        time::tick_handler();
        assert_eq!(kernel::next_tcb(), Some(high));
    }
}

// ============ Semaphore ============

mod sem_tests {
    use super::*;

    #[test]
    fn create_validates_counts() {
        let _guard = setup();

        assert!(sem_create(0, 0, "zero").is_none());
        assert!(sem_create(3, 2, "over").is_none());
        assert!(sem_create(2, 2, "full").is_some());

        let counting = sem_create_counting(3, "count").unwrap();
        assert_eq!(sem_get_count(counting), 0);
    }

    #[test]
    fn fast_path_decrements_until_empty() {
        let _guard = setup();

        let sem = sem_create(2, 5, "tokens").unwrap();
        assert_eq!(sem_get_count(sem), 2);

        assert!(sem_try_wait(sem).is_ok());
        assert!(sem_wait(sem, NO_WAIT).is_ok());
        assert_eq!(sem_get_count(sem), 0);
        assert_eq!(sem_try_wait(sem), Err(KernelError::Timeout));
    }

    #[test]
    fn post_increments_to_max_then_overflows() {
        let _guard = setup();

        let sem = sem_create(0, 2, "cap").unwrap();
        assert!(sem_post(sem).is_ok());
        assert!(sem_post(sem).is_ok());
        assert_eq!(sem_get_count(sem), 2);
        assert_eq!(sem_post(sem), Err(KernelError::Overflow));
        assert_eq!(sem_get_count(sem), 2);
    }

    #[test]
    fn post_hands_the_token_to_a_waiter() {
        let _guard = setup();
        KERNEL.set_running(true);

        let sem = sem_create(0, 1, "gate").unwrap();
        let waiter = spawn("waiter", 3);
        let list = critical_section(|_cs| unsafe {
            &mut (*sem.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, waiter, None);

        assert!(sem_has_waiting_tasks(sem));

        assert!(sem_post(sem).is_ok());
        // Direct handoff: waiter released, count untouched
        assert_eq!(state_of(waiter), TaskState::Ready);
        assert_eq!(wake_reason_of(waiter), WakeReason::DataAvailable);
        assert_eq!(sem_get_count(sem), 0);
        assert!(!sem_has_waiting_tasks(sem));
    }

    #[test]
    fn waiters_are_released_fifo() {
        let _guard = setup();
        KERNEL.set_running(true);

        let sem = sem_create(0, 2, "order").unwrap();
        let first = spawn("first", 3);
        let second = spawn("second", 3);
        let list = critical_section(|_cs| unsafe {
            &mut (*sem.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, first, None);
        block_on(list, second, None);

        assert!(sem_post(sem).is_ok());
        assert_eq!(state_of(first), TaskState::Ready);
        assert_eq!(state_of(second), TaskState::Blocked);

        assert!(sem_post(sem).is_ok());
        assert_eq!(state_of(second), TaskState::Ready);
    }

    #[test]
    fn delete_wakes_all_waiters_with_signal() {
        let _guard = setup();
        KERNEL.set_running(true);

        let used_before = mem::stats(PoolId::Scb).used;
        let sem = sem_create(0, 2, "dying").unwrap();
        let a = spawn("a", 3);
        let b = spawn("b", 4);
        let list = critical_section(|_cs| unsafe {
            &mut (*sem.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, a, None);
        block_on(list, b, Some(time::now().wrapping_add(50)));

        assert!(sem_delete(sem).is_ok());

        assert_eq!(state_of(a), TaskState::Ready);
        assert_eq!(state_of(b), TaskState::Ready);
        assert_eq!(wake_reason_of(a), WakeReason::Signal);
        assert_eq!(wake_reason_of(b), WakeReason::Signal);
        // b's timeout was cancelled with it
        assert_eq!(critical_section(|_cs| unsafe { (*b.as_ptr()).delay_home }), u8::MAX);
        assert_eq!(mem::stats(PoolId::Scb).used, used_before);
    }

    #[test]
    fn binary_semaphore_starts_available() {
        let _guard = setup();

        let sem = sem_create_binary("binary").unwrap();
        assert_eq!(sem_get_count(sem), 1);
        assert!(sem_try_wait(sem).is_ok());
        assert_eq!(sem_try_wait(sem), Err(KernelError::Timeout));
        assert!(sem_post(sem).is_ok());
        assert_eq!(sem_get_count(sem), 1);
    }

    #[test]
    fn name_is_stored_for_debugging() {
        let _guard = setup();

        let sem = sem_create(0, 1, "diagnostics").unwrap();
        assert_eq!(unsafe { sem.as_ref() }.name(), "diagnostics");
    }
}

// ============ Mutex ============

mod mutex_tests {
    use super::*;
    use crate::sync::mutex::apply_priority_inheritance;

    #[test]
    fn lock_takes_free_mutex() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let a = spawn("a", 3);
        make_current(a);

        assert!(!mutex_is_locked(m));
        assert!(mutex_try_lock(m).is_ok());
        assert!(mutex_is_locked(m));
        assert_eq!(mutex_get_owner(m), Some(a));
    }

    #[test]
    fn recursive_lock_is_rejected() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let a = spawn("a", 3);
        make_current(a);

        assert!(mutex_try_lock(m).is_ok());
        assert_eq!(mutex_try_lock(m), Err(KernelError::Recursive));
        // Ownership unchanged
        assert_eq!(mutex_get_owner(m), Some(a));
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let a = spawn("a", 3);
        let b = spawn("b", 3);

        make_current(a);
        assert!(mutex_try_lock(m).is_ok());

        critical_section(|_cs| unsafe { sched::add_task(a) });
        make_current(b);
        assert_eq!(mutex_unlock(m), Err(KernelError::NotOwner));
        assert_eq!(mutex_get_owner(m), Some(a));
    }

    #[test]
    fn try_lock_on_held_mutex_times_out() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let a = spawn("a", 3);
        let b = spawn("b", 3);

        make_current(a);
        assert!(mutex_try_lock(m).is_ok());

        critical_section(|_cs| unsafe { sched::add_task(a) });
        make_current(b);
        assert_eq!(mutex_lock(m, NO_WAIT), Err(KernelError::Timeout));
    }

    #[test]
    fn waiter_boosts_owner_and_unlock_restores() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let low = spawn("low", 5);
        let high = spawn("high", 1);

        make_current(low);
        assert!(mutex_try_lock(m).is_ok());

        // Owner gets preempted, then the high task arrives at the lock
        critical_section(|_cs| unsafe { sched::add_task(low) });
        let list = critical_section(|_cs| unsafe {
            &mut (*m.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, high, None);
        critical_section(|_cs| unsafe {
            apply_priority_inheritance(&mut *m.as_ptr());
        });

        // Owner inherits the waiter's priority and moves ready bands
        assert_eq!(effective_prio_of(low), 1);
        assert_eq!(critical_section(|_cs| unsafe { low.as_ref() }.base_priority()), 5);
        critical_section(|_cs| unsafe {
            assert!(sched::state().prio_tbl.is_set(1));
            assert!(!sched::state().prio_tbl.is_set(5));
        });

        // Owner releases: priority reverts exactly to base, waiter wakes
        make_current(low);
        assert!(mutex_unlock(m).is_ok());

        assert_eq!(effective_prio_of(low), 5);
        assert!(!mutex_is_locked(m));
        assert_eq!(state_of(high), TaskState::Ready);
        assert_eq!(wake_reason_of(high), WakeReason::DataAvailable);

        // The woken waiter acquires through the free fast path
        make_current(high);
        assert!(mutex_try_lock(m).is_ok());
        assert_eq!(mutex_get_owner(m), Some(high));
    }

    #[test]
    fn boost_applies_only_above_owner_priority() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let owner = spawn("owner", 2);
        let meek = spawn("meek", 6);

        make_current(owner);
        assert!(mutex_try_lock(m).is_ok());

        let list = critical_section(|_cs| unsafe {
            &mut (*m.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, meek, None);
        critical_section(|_cs| unsafe {
            apply_priority_inheritance(&mut *m.as_ptr());
        });

        // Lower-priority waiter leaves the owner untouched
        assert_eq!(effective_prio_of(owner), 2);
        assert_eq!(
            critical_section(|_cs| unsafe { (*m.as_ptr()).saved_priority }),
            PRIO_NONE
        );
    }

    #[test]
    fn delete_restores_owner_and_wakes_waiters() {
        let _guard = setup();
        KERNEL.set_running(true);

        let used_before = mem::stats(PoolId::Mcb).used;
        let m = mutex_create("dying").unwrap();
        let low = spawn("low", 5);
        let high = spawn("high", 1);

        make_current(low);
        assert!(mutex_try_lock(m).is_ok());

        critical_section(|_cs| unsafe { sched::add_task(low) });
        let list = critical_section(|_cs| unsafe {
            &mut (*m.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, high, None);
        critical_section(|_cs| unsafe {
            apply_priority_inheritance(&mut *m.as_ptr());
        });
        assert_eq!(effective_prio_of(low), 1);

        assert!(mutex_delete(m).is_ok());

        assert_eq!(effective_prio_of(low), 5);
        assert_eq!(state_of(high), TaskState::Ready);
        assert_eq!(wake_reason_of(high), WakeReason::Signal);
        assert_eq!(mem::stats(PoolId::Mcb).used, used_before);
    }

    #[test]
    fn has_waiting_tasks_reflects_the_wait_list() {
        let _guard = setup();
        KERNEL.set_running(true);

        let m = mutex_create("m").unwrap();
        let a = spawn("a", 3);
        let b = spawn("b", 3);

        make_current(a);
        assert!(mutex_try_lock(m).is_ok());
        assert!(!mutex_has_waiting_tasks(m));

        let list = critical_section(|_cs| unsafe {
            &mut (*m.as_ptr()).waiting_tasks as *mut WaitList
        });
        block_on(list, b, None);
        assert!(mutex_has_waiting_tasks(m));
    }
}

// ============ Message queue ============

mod queue_tests {
    use super::*;

    #[test]
    fn create_validates_and_rounds_capacity() {
        let _guard = setup();

        assert!(queue_create(0, 4).is_none());
        assert!(queue_create(4, 0).is_none());
        // 300 * 4 rounds past the largest buffer class
        assert!(queue_create(300, 4).is_none());

        let q = queue_create(5, 4).unwrap();
        assert_eq!(unsafe { q.as_ref() }.ring.capacity(), 8);
        queue_delete(q).unwrap();
    }

    #[test]
    fn items_come_out_in_fifo_order() {
        let _guard = setup();

        let q = queue_create(4, 4).unwrap();

        for value in [10u32, 20, 30, 40] {
            assert!(queue_send_immediate(q, &value.to_ne_bytes()).is_ok());
        }
        assert!(queue_is_full(q));
        assert_eq!(queue_messages_waiting(q), 4);
        assert_eq!(
            queue_send_immediate(q, &99u32.to_ne_bytes()),
            Err(KernelError::Full)
        );

        for expected in [10u32, 20, 30, 40] {
            let mut item = [0u8; 4];
            assert!(queue_receive_immediate(q, &mut item).is_ok());
            assert_eq!(u32::from_ne_bytes(item), expected);
        }

        assert!(queue_is_empty(q));
        assert_eq!(queue_messages_waiting(q), 0);
        let mut item = [0u8; 4];
        assert_eq!(queue_receive_immediate(q, &mut item), Err(KernelError::Empty));

        queue_delete(q).unwrap();
    }

    #[test]
    fn wrong_item_size_is_a_null_error() {
        let _guard = setup();

        let q = queue_create(4, 4).unwrap();
        assert_eq!(queue_send_immediate(q, &[1u8, 2]), Err(KernelError::Null));
        let mut small = [0u8; 2];
        assert_eq!(queue_receive_immediate(q, &mut small), Err(KernelError::Null));
        queue_delete(q).unwrap();
    }

    #[test]
    fn send_wakes_a_blocked_receiver() {
        let _guard = setup();
        KERNEL.set_running(true);

        let q = queue_create(4, 4).unwrap();
        let receiver = spawn("rx", 3);
        let rx_list = critical_section(|_cs| unsafe {
            &mut (*q.as_ptr()).waiting_receivers as *mut WaitList
        });
        block_on(rx_list, receiver, None);

        assert!(queue_send_immediate(q, &7u32.to_ne_bytes()).is_ok());

        assert_eq!(state_of(receiver), TaskState::Ready);
        assert_eq!(wake_reason_of(receiver), WakeReason::DataAvailable);
        // The item stays queued for the receiver's retry
        assert_eq!(queue_messages_waiting(q), 1);

        queue_delete(q).unwrap();
    }

    #[test]
    fn receive_wakes_blocked_senders_in_arrival_order() {
        let _guard = setup();
        KERNEL.set_running(true);

        let q = queue_create(2, 4).unwrap();
        for value in [1u32, 2] {
            queue_send_immediate(q, &value.to_ne_bytes()).unwrap();
        }
        assert!(queue_is_full(q));

        let s1 = spawn("s1", 3);
        let s2 = spawn("s2", 3);
        let tx_list = critical_section(|_cs| unsafe {
            &mut (*q.as_ptr()).waiting_senders as *mut WaitList
        });
        block_on(tx_list, s1, None);
        block_on(tx_list, s2, None);

        let mut item = [0u8; 4];
        assert!(queue_receive_immediate(q, &mut item).is_ok());

        // First blocked sender is released first
        assert_eq!(state_of(s1), TaskState::Ready);
        assert_eq!(state_of(s2), TaskState::Blocked);

        assert!(queue_receive_immediate(q, &mut item).is_ok());
        assert_eq!(state_of(s2), TaskState::Ready);

        queue_delete(q).unwrap();
    }

    #[test]
    fn delete_wakes_waiters_and_returns_slots() {
        let _guard = setup();
        KERNEL.set_running(true);

        let qcb_before = mem::stats(PoolId::Qcb).used;
        let buf_before = mem::stats(PoolId::BufferSmall).used;

        let q = queue_create(4, 4).unwrap();
        assert_eq!(mem::stats(PoolId::BufferSmall).used, buf_before + 1);

        let rx = spawn("rx", 3);
        let rx_list = critical_section(|_cs| unsafe {
            &mut (*q.as_ptr()).waiting_receivers as *mut WaitList
        });
        block_on(rx_list, rx, None);

        assert!(queue_delete(q).is_ok());

        assert_eq!(state_of(rx), TaskState::Ready);
        assert_eq!(wake_reason_of(rx), WakeReason::Signal);
        assert_eq!(mem::stats(PoolId::Qcb).used, qcb_before);
        assert_eq!(mem::stats(PoolId::BufferSmall).used, buf_before);
    }

    #[test]
    fn buffer_class_follows_rounded_capacity() {
        let _guard = setup();

        // 8 * 4 = 32 bytes -> small class
        let small = queue_create(8, 4).unwrap();
        assert_eq!(mem::stats(PoolId::BufferSmall).used, 1);

        // 32 * 8 = 256 bytes -> medium class
        let medium = queue_create(32, 8).unwrap();
        assert_eq!(mem::stats(PoolId::BufferMedium).used, 1);

        queue_delete(small).unwrap();
        queue_delete(medium).unwrap();
    }
}

// ============ Kernel entry points ============

mod kernel_tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let _guard = setup();

        assert_eq!(mem::stats(PoolId::Tcb).used, 1);
        kernel::kernel_init();
        kernel::kernel_init();
        assert_eq!(mem::stats(PoolId::Tcb).used, 1);
    }

    #[test]
    fn init_creates_the_idle_task() {
        let _guard = setup();

        let idle = kernel::idle_tcb().expect("idle task missing");
        let tcb = unsafe { idle.as_ref() };
        assert_eq!(tcb.name(), "idle");
        assert_eq!(tcb.base_priority(), IDLE_PRIO);
        assert_eq!(tcb.state(), TaskState::Ready);
        // Idle lives on a small stack
        assert_eq!(mem::stats(PoolId::StackSmall).used, 1);
    }

    #[test]
    fn sched_lock_requires_running_kernel() {
        let _guard = setup();

        assert_eq!(kernel::sched_lock(), Err(KernelError::NotRunning));
        KERNEL.set_running(true);
        assert!(kernel::sched_lock().is_ok());
        assert!(kernel::sched_lock().is_ok());
        assert!(kernel::sched_unlock().is_ok());
        assert!(kernel::sched_unlock().is_ok());
        assert_eq!(kernel::sched_unlock(), Err(KernelError::NotLocked));
    }

    #[test]
    fn delay_validates_context_and_ticks() {
        let _guard = setup();

        assert_eq!(time::delay(5), Err(KernelError::NotRunning));
        KERNEL.set_running(true);
        assert_eq!(time::delay(0), Err(KernelError::ZeroDelay));
    }

    #[test]
    fn tick_handler_is_inert_before_start() {
        let _guard = setup();

        let before = time::now();
        time::tick_handler();
        assert_eq!(time::now(), before);
    }
}
