//! End-to-end scenario tests driving the kernel through the port-facing
//! entry points of the mock HAL.
use core::sync::atomic::Ordering;

use super::fixtures::{self, *};
use crate::{
    error::ErrorCode,
    klock,
    utils::{DequeLike, PrioBitmap},
    Kernel, PortThreading, PortToKernel, ScheduleTableState, TaskSt,
};

fn guard(lock: &'static std::sync::Mutex<()>) -> std::sync::MutexGuard<'static, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// Ready-structure invariants: a ready bit is set exactly when its queue is
/// nonempty, and every Ready/Running task occupies the queue at its current
/// priority.
fn assert_ready_invariants_ceiling() {
    let lock = klock::lock_cpu::<ceiling::Sys>().unwrap();
    let sched = &ceiling::CORE_CBS[0].sched;

    for prio in 0..8 {
        let queue = sched.queues[prio].read(&*lock);
        assert_eq!(
            sched.bit_array.read(&*lock).get(prio),
            !queue.is_empty(),
            "ready bit out of sync at priority {prio}",
        );
    }

    for task_cb in &ceiling::TASK_CBS {
        if task_cb.attr.core != 0 {
            continue;
        }
        let st = task_cb.st.get(&*lock);
        if st == TaskSt::Ready || st == TaskSt::Running {
            let prio = task_cb.current_priority.get(&*lock);
            // The logical priority never sinks below home
            assert!(prio <= task_cb.attr.home_priority);

            let queue = sched.queues[prio].read(&*lock);
            let occurrences = (0..queue.len())
                .filter(|&i| queue.get(i) == Some(crate::TaskRef(task_cb)))
                .count();
            assert_eq!(occurrences, 1, "task must appear exactly once at its level");
        }
    }
}

// Scenario 1: basic priority ceiling
#[test]
fn basic_ceiling() {
    let _guard = guard(&ceiling::LOCK);
    ceiling::reset();
    ceiling::boot_core(0, 0);

    // T1 was auto-started and dispatched
    assert_eq!(ceiling::current_task_of(0), 2);
    assert_ready_invariants_ceiling();

    // T1 takes R and is raised to the ceiling
    ceiling::Sys::get_resource(0).unwrap();
    {
        let lock = klock::lock_cpu::<ceiling::Sys>().unwrap();
        assert_eq!(ceiling::CORE_CBS[0].sched.current_priority.get(&*lock), 1);
    }
    assert_ready_invariants_ceiling();

    // T2 becomes ready but must not preempt while the ceiling is held
    ceiling::Sys::activate_task(3).unwrap();
    assert_eq!(ceiling::current_task_of(0), 2);
    assert_eq!(ceiling::Sys::get_task_state(3).unwrap(), TaskSt::Ready);

    // Releasing R drops T1 back to its home priority; T2 preempts
    ceiling::Sys::release_resource(0).unwrap();
    assert_eq!(ceiling::current_task_of(0), 3);
    assert_eq!(ceiling::Sys::get_task_state(2).unwrap(), TaskSt::Ready);
    assert_ready_invariants_ceiling();

    // T2 runs to completion; T1 resumes
    ceiling::run_diverging(
        || {
            let _ = ceiling::Sys::terminate_task();
        },
        "exit_and_dispatch",
    );
    assert_eq!(ceiling::current_task_of(0), 2);
    assert_eq!(ceiling::Sys::get_task_state(3).unwrap(), TaskSt::Suspended);
    assert_ready_invariants_ceiling();
}

/// `Get`/`ReleaseResource` paired in strict LIFO restores the scheduler
/// exactly; order violations are rejected without corrupting state.
#[test]
fn resource_lifo_round_trip() {
    let _guard = guard(&ceiling::LOCK);
    ceiling::reset();
    ceiling::boot_core(0, 0);

    let before = {
        let lock = klock::lock_cpu::<ceiling::Sys>().unwrap();
        ceiling::CORE_CBS[0].sched.current_priority.get(&*lock)
    };

    ceiling::Sys::get_resource(0).unwrap();
    ceiling::Sys::get_resource(1).unwrap();

    // Out-of-order release is rejected
    assert_eq!(
        ceiling::Sys::release_resource(0),
        Err(crate::error::ReleaseResourceError::NoFunc)
    );

    ceiling::Sys::release_resource(1).unwrap();
    ceiling::Sys::release_resource(0).unwrap();

    let after = {
        let lock = klock::lock_cpu::<ceiling::Sys>().unwrap();
        ceiling::CORE_CBS[0].sched.current_priority.get(&*lock)
    };
    assert_eq!(before, after);
    assert_ready_invariants_ceiling();

    // Releasing with nothing held is `NoFunc` as well
    assert_eq!(
        ceiling::Sys::release_resource(0),
        Err(crate::error::ReleaseResourceError::NoFunc)
    );
}

// Scenario 2: cyclic alarm, first fire at 10, then every 5 ticks
#[test]
fn cyclic_alarm() {
    let _guard = guard(&timing::LOCK);
    timing::reset();
    timing::boot_core(0, 0);

    let count = |id: usize| {
        let lock = klock::lock_cpu::<timing::Sys>().unwrap();
        timing::TASK_CBS[id].activation_count.get(&*lock)
    };
    let base = count(2);

    timing::Sys::set_rel_alarm(0, 10, 5).unwrap();

    timing::run_pit_ticks(0, 9);
    assert_eq!(count(2) - base, 0);

    timing::run_pit_ticks(0, 1);
    assert_eq!(count(2) - base, 1, "first expiry at t = 10");

    timing::run_pit_ticks(0, 4);
    assert_eq!(count(2) - base, 1);
    timing::run_pit_ticks(0, 1);
    assert_eq!(count(2) - base, 2, "second expiry at t = 15");

    timing::run_pit_ticks(0, 10);
    assert_eq!(count(2) - base, 4, "t = 20 and t = 25");

    // Re-arming a running alarm is a state error; cancelling stops the cycle
    assert_eq!(
        timing::Sys::set_rel_alarm(0, 10, 5),
        Err(crate::error::SetAlarmError::State)
    );
    timing::Sys::cancel_alarm(0).unwrap();
    timing::run_pit_ticks(0, 20);
    assert_eq!(count(2) - base, 4);
    assert_eq!(
        timing::Sys::cancel_alarm(0),
        Err(crate::error::CancelAlarmError::NoFunc)
    );
}

/// A task with `max_activations = N` rejects the `(N + 1)`-th activation.
#[test]
fn activation_limit() {
    let _guard = guard(&timing::LOCK);
    timing::reset();
    timing::boot_core(0, 0);

    timing::Sys::activate_task(3).unwrap();
    timing::Sys::activate_task(3).unwrap();
    timing::Sys::activate_task(3).unwrap();
    assert_eq!(
        timing::Sys::activate_task(3),
        Err(crate::error::ActivateTaskError::Limit)
    );

    let lock = klock::lock_cpu::<timing::Sys>().unwrap();
    assert_eq!(timing::TASK_CBS[3].activation_count.get(&*lock), 3);
}

/// `SetRelAlarm` across the modulo boundary fires at the correct absolute
/// tick.
#[test]
fn alarm_across_counter_wrap() {
    let _guard = guard(&timing::LOCK);
    timing::reset();
    timing::boot_core(0, 0);

    let count = |id: usize| {
        let lock = klock::lock_cpu::<timing::Sys>().unwrap();
        timing::TASK_CBS[id].activation_count.get(&*lock)
    };
    let base = count(4);

    // Drive the software counter close to its wrap point
    let current = timing::Sys::get_counter_value(1).unwrap();
    let to_wrap_edge = 195u32.wrapping_sub(current) % 200;
    for _ in 0..to_wrap_edge {
        timing::Sys::increment_counter(1).unwrap();
    }
    assert_eq!(timing::Sys::get_counter_value(1).unwrap(), 195);

    timing::Sys::set_rel_alarm(1, 10, 0).unwrap();

    for _ in 0..9 {
        timing::Sys::increment_counter(1).unwrap();
    }
    assert_eq!(count(4) - base, 0);
    assert_eq!(timing::Sys::get_counter_value(1).unwrap(), 4);

    timing::Sys::increment_counter(1).unwrap();
    assert_eq!(count(4) - base, 1, "expiry at the wrapped value 5");

    // `GetElapsedValue` agrees across the wrap
    let (value, elapsed) = timing::Sys::get_elapsed_value(1, 195).unwrap();
    assert_eq!(value, 5);
    assert_eq!(elapsed, 10);
}

/// An alarm at `offset == max_allowed_value` fires exactly once, at the
/// correct tick.
#[test]
fn alarm_at_max_allowed_offset() {
    let _guard = guard(&timing::LOCK);
    timing::reset();
    timing::boot_core(0, 0);

    let count = |id: usize| {
        let lock = klock::lock_cpu::<timing::Sys>().unwrap();
        timing::TASK_CBS[id].activation_count.get(&*lock)
    };
    let base = count(4);

    timing::Sys::set_rel_alarm(2, 99, 0).unwrap();

    timing::run_pit_ticks(0, 98);
    assert_eq!(count(4) - base, 0);
    timing::run_pit_ticks(0, 1);
    assert_eq!(count(4) - base, 1, "expiry at t + 99");
    timing::run_pit_ticks(0, 50);
    assert_eq!(count(4) - base, 1, "single-shot fires exactly once");

    // An out-of-range offset is rejected up front
    assert_eq!(
        timing::Sys::set_rel_alarm(2, 100, 0),
        Err(crate::error::SetAlarmError::Value)
    );
    assert_eq!(
        timing::Sys::set_rel_alarm(2, 0, 0),
        Err(crate::error::SetAlarmError::Value)
    );
}

// Scenario 3: execution budget violation, then inter-arrival enforcement
#[test]
fn tp_execution_violation() {
    let _guard = guard(&tp_sys::LOCK);
    tp_sys::reset();
    tp_sys::boot_core(0, 0);

    assert_eq!(tp_sys::current_task_of(0), 2);

    // The monitored task burns 3 ms against its 2 ms budget
    tp_sys::advance_timer(0, 3_000);
    unsafe { <tp_sys::Sys as PortToKernel>::tp_timer_expired() };

    assert_eq!(
        fixtures::TP_VIOLATIONS.lock().unwrap().as_slice(),
        &[ErrorCode::ProtectionTime]
    );
    assert_eq!(tp_sys::Sys::get_task_state(2).unwrap(), TaskSt::Suspended);
    assert_eq!(tp_sys::current_task_of(0), 0, "the idle task took over");

    // Re-activation before the 5 ms time frame elapses is dropped
    tp_sys::Sys::activate_task(2).unwrap();
    assert_eq!(tp_sys::Sys::get_task_state(2).unwrap(), TaskSt::Suspended);
    assert_eq!(
        fixtures::TP_VIOLATIONS.lock().unwrap().as_slice(),
        &[ErrorCode::ProtectionTime, ErrorCode::ProtectionArrival]
    );

    // Past the frame the activation goes through
    tp_sys::advance_timer(0, 3_000);
    tp_sys::Sys::activate_task(2).unwrap();
    assert_eq!(tp_sys::current_task_of(0), 2);
}

// Scenario 4: cross-core activation over XSignal
#[test]
fn cross_core_activation() {
    let _guard = guard(&mc::LOCK);
    mc::reset();

    // `StartCore` precedes the master's `StartOS`
    mc::CURRENT_CORE.store(0, Ordering::Relaxed);
    mc::Sys::start_core(1).unwrap();
    assert_eq!(mc::Sys::get_number_of_activated_cores(), 1);

    // The slave arrives at the boot barrier; the master completes start-up
    mc::BARRIERS[1].store(1, Ordering::Relaxed); // WAITING_SIGN
    mc::boot_core(0, 0);
    assert_eq!(mc::Sys::get_number_of_activated_cores(), 2);
    assert_eq!(mc::current_task_of(0), 2);

    mc::boot_core(1, 0);
    mc::CURRENT_CORE.store(0, Ordering::Relaxed);

    // The caller returns OK as soon as the mailbox write is published
    mc::Sys::activate_task(3).unwrap();
    assert!(mc::XSIG_PENDING[1].load(Ordering::Relaxed));
    assert_eq!(mc::Sys::get_task_state(3).unwrap(), TaskSt::Suspended);

    // The target core drains its channel and dispatches the task
    mc::CURRENT_CORE.store(1, Ordering::Relaxed);
    mc::XSIG_PENDING[1].store(false, Ordering::Relaxed);
    unsafe { <mc::Sys as PortToKernel>::xsig_received() };

    assert_eq!(mc::current_task_of(1), 3);
    mc::CURRENT_CORE.store(0, Ordering::Relaxed);
}

// Scenario 5: spinlock deadlock avoidance by rank ordering
#[test]
fn spinlock_rank_ordering() {
    let _guard = guard(&locks::LOCK);
    locks::reset();
    locks::boot_core(0, 0);

    locks::Sys::get_spinlock(0).unwrap(); // L1, rank 2

    // A lower rank is refused outright; L1 stays held
    assert_eq!(
        locks::Sys::get_spinlock(1),
        Err(crate::error::GetSpinlockError::NestingError)
    );
    assert_eq!(locks::SPINLOCK_CBS[0].owner.load(Ordering::Relaxed), 1);
    assert_eq!(locks::SPINLOCK_CBS[1].owner.load(Ordering::Relaxed), 0);

    // Same-core re-acquisition would deadlock
    assert_eq!(
        locks::Sys::get_spinlock(0),
        Err(crate::error::GetSpinlockError::InterferenceDeadlock)
    );

    // Increasing rank nests fine
    locks::Sys::get_spinlock(2).unwrap(); // L3, rank 3

    // Release must follow LIFO order
    assert_eq!(
        locks::Sys::release_spinlock(0),
        Err(crate::error::ReleaseSpinlockError::NestingError)
    );
    locks::Sys::release_spinlock(2).unwrap();
    locks::Sys::release_spinlock(0).unwrap();

    // The paired releases restored the interrupt lock exactly
    assert_eq!(locks::INT_LEVELS[0].load(Ordering::Relaxed), 0);
    assert_eq!(
        locks::Sys::release_spinlock(0),
        Err(crate::error::ReleaseSpinlockError::State)
    );
}

/// `TryToGetSpinlock` reports an occupied lock without spinning.
#[test]
fn try_to_get_spinlock() {
    let _guard = guard(&locks::LOCK);
    locks::reset();
    locks::boot_core(0, 0);

    // Simulate contention from the other core
    locks::SPINLOCK_CBS[0].owner.store(2, Ordering::Relaxed);
    assert_eq!(locks::Sys::try_to_get_spinlock(0), Ok(false));
    assert_eq!(locks::INT_LEVELS[0].load(Ordering::Relaxed), 0);

    locks::SPINLOCK_CBS[0].owner.store(0, Ordering::Relaxed);
    assert_eq!(locks::Sys::try_to_get_spinlock(0), Ok(true));
    locks::Sys::release_spinlock(0).unwrap();
}

// Scenario 6: an ISR killed while holding a resource
#[test]
fn isr_killed_holding_resource() {
    let _guard = guard(&isr_kill::LOCK);
    isr_kill::reset();
    isr_kill::boot_core(0, 0);

    isr_kill::TASK_CONTEXT.store(false, Ordering::Relaxed);

    // Prologue
    unsafe {
        <isr_kill::Sys as PortThreading>::enter_cpu_lock();
        assert!(<isr_kill::Sys as PortToKernel>::isr_entry(0));
        <isr_kill::Sys as PortThreading>::leave_cpu_lock();
    }
    assert_eq!(isr_kill::Sys::get_isr_id(), 0);

    // The ISR body takes R, then its application is terminated
    isr_kill::Sys::get_resource(0).unwrap();
    isr_kill::Sys::terminate_application(0, false).unwrap();

    assert_eq!(
        fixtures::ISR_KILL_ERRORS.lock().unwrap().as_slice(),
        &[ErrorCode::Resource],
        "exactly one RESOURCE report for the forced release",
    );
    {
        let lock = klock::lock_cpu::<isr_kill::Sys>().unwrap();
        assert!(isr_kill::RESOURCE_CBS[0].holder.get(&*lock).is_none());
        assert!(isr_kill::ISR_CBS[0].killed.get(&*lock));
    }

    // Epilogue: the killed flag is consumed, nothing further is reported
    unsafe {
        <isr_kill::Sys as PortThreading>::enter_cpu_lock();
        assert!(!<isr_kill::Sys as PortToKernel>::isr_exit());
        <isr_kill::Sys as PortThreading>::leave_cpu_lock();
    }
    {
        let lock = klock::lock_cpu::<isr_kill::Sys>().unwrap();
        assert!(!isr_kill::ISR_CBS[0].killed.get(&*lock));
    }
    assert_eq!(fixtures::ISR_KILL_ERRORS.lock().unwrap().len(), 1);
    assert_eq!(isr_kill::Sys::get_isr_id(), crate::INVALID_ISR);

    isr_kill::TASK_CONTEXT.store(true, Ordering::Relaxed);
}

/// Extended-task event flow: wait, wake-up by `SetEvent`, mask bookkeeping.
#[test]
fn event_wait_and_wake() {
    let _guard = guard(&events::LOCK);
    events::reset();
    events::boot_core(0, 0);

    assert_eq!(events::current_task_of(0), 2);

    // A wait with a satisfied condition returns immediately
    events::Sys::set_event(2, 0x4).unwrap();
    events::Sys::wait_event(0x4).unwrap();
    assert_eq!(events::current_task_of(0), 2);
    events::Sys::clear_event(0x4).unwrap();

    // Blocking wait: the task leaves the ready structure entirely
    events::Sys::wait_event(0x1).unwrap();
    assert_eq!(events::Sys::get_task_state(2).unwrap(), TaskSt::Waiting);
    assert_eq!(events::current_task_of(0), 0);

    // Setting a non-intersecting event leaves it waiting
    events::Sys::set_event(2, 0x8).unwrap();
    assert_eq!(events::Sys::get_task_state(2).unwrap(), TaskSt::Waiting);

    // The waited event wakes it and it preempts the idle task
    events::Sys::set_event(2, 0x1).unwrap();
    assert_eq!(events::current_task_of(0), 2);
    assert_eq!(events::Sys::get_event(2).unwrap(), 0x9);
    events::Sys::clear_event(0x9).unwrap();
    assert_eq!(events::Sys::get_event(2).unwrap(), 0);

    // Event services reject basic tasks
    assert_eq!(
        events::Sys::set_event(3, 0x1),
        Err(crate::error::SetEventError::Access)
    );
}

/// Round robin: the queue head rotates when the current task exhausts its
/// time slices; the peers' relative order is preserved.
#[test]
fn round_robin_rotation() {
    let _guard = guard(&rr::LOCK);
    rr::reset();
    rr::boot_core(0, 0);

    assert_eq!(rr::current_task_of(0), 2);

    // Two slices per task; the round-robin alarm ticks every counter tick
    rr::run_pit_ticks(0, 1);
    assert_eq!(rr::current_task_of(0), 2);
    rr::run_pit_ticks(0, 1);
    assert_eq!(rr::current_task_of(0), 3, "RRA's slices exhausted");

    rr::run_pit_ticks(0, 2);
    assert_eq!(rr::current_task_of(0), 2, "and back to RRA");
}

/// Schedule table lifecycle: status round trip, deadline-accurate expiry,
/// explicit synchronisation.
#[test]
fn schedule_table_lifecycle() {
    let _guard = guard(&table_sys::LOCK);
    table_sys::reset();
    table_sys::boot_core(0, 0);

    let count = |id: usize| {
        let lock = klock::lock_cpu::<table_sys::Sys>().unwrap();
        table_sys::TASK_CBS[id].activation_count.get(&*lock)
    };
    let base = count(2);

    assert_eq!(
        table_sys::Sys::get_schedule_table_status(0).unwrap(),
        ScheduleTableState::Stopped
    );
    assert_eq!(
        table_sys::Sys::stop_schedule_table(0),
        Err(crate::error::StopScheduleTableError::NoFunc)
    );

    table_sys::Sys::start_schedule_table_rel(0, 5).unwrap();
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(0).unwrap(),
        ScheduleTableState::Running
    );

    // First expiry point at start offset 5 + point offset 2
    table_sys::run_pit_ticks(0, 6);
    assert_eq!(count(2) - base, 0);
    table_sys::run_pit_ticks(0, 1);
    assert_eq!(count(2) - base, 1);

    // Second point 5 ticks later sets an event on TP1
    table_sys::run_pit_ticks(0, 5);
    assert!(table_sys::Sys::get_event(3).unwrap() & 0x2 != 0);
    table_sys::Sys::clear_event(0x2).ok();

    // The next round repeats with the table period of 20
    table_sys::run_pit_ticks(0, 20);
    assert_eq!(count(2) - base, 2);

    // Explicit synchronisation bounds and state bookkeeping
    assert_eq!(
        table_sys::Sys::sync_schedule_table(0, 20),
        Err(crate::error::SyncScheduleTableError::Value)
    );
    table_sys::Sys::sync_schedule_table(0, 3).unwrap();
    table_sys::Sys::set_schedule_table_async(0).unwrap();
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(0).unwrap(),
        ScheduleTableState::Running
    );

    table_sys::Sys::stop_schedule_table(0).unwrap();
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(0).unwrap(),
        ScheduleTableState::Stopped
    );
}

/// `NextScheduleTable` hands off at the end of the running table's duration
/// with no gap and no lost tick.
#[test]
fn schedule_table_chaining() {
    let _guard = guard(&table_sys::LOCK);
    table_sys::reset();
    table_sys::boot_core(0, 0);

    let count = |id: usize| {
        let lock = klock::lock_cpu::<table_sys::Sys>().unwrap();
        table_sys::TASK_CBS[id].activation_count.get(&*lock)
    };
    let base = count(2);

    table_sys::Sys::start_schedule_table_rel(0, 5).unwrap();
    table_sys::Sys::next_schedule_table(0, 1).unwrap();
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(1).unwrap(),
        ScheduleTableState::Next
    );

    // ST0's two points fire at +7 and +12
    table_sys::run_pit_ticks(0, 12);
    assert_eq!(count(2) - base, 1);

    // At +25 (start 5 + duration 20) the hand-off occurs
    table_sys::run_pit_ticks(0, 13);
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(0).unwrap(),
        ScheduleTableState::Stopped
    );
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(1).unwrap(),
        ScheduleTableState::Running
    );

    // ST1's point lands at +28, counted from the hand-off instant
    table_sys::run_pit_ticks(0, 2);
    assert_eq!(count(2) - base, 1);
    table_sys::run_pit_ticks(0, 1);
    assert_eq!(count(2) - base, 2);

    // The single-shot successor stops at the end of its duration (+35)
    table_sys::run_pit_ticks(0, 7);
    assert_eq!(
        table_sys::Sys::get_schedule_table_status(1).unwrap(),
        ScheduleTableState::Stopped
    );
}

/// HRT compare programming: a compare value that is already in the past is
/// recovered within a bounded number of steps.
#[test]
fn hrt_compare_corrective_loop() {
    let _guard = guard(&hrt::LOCK);
    hrt::reset();
    hrt::boot_core(0, 0);

    // Arm an alarm, then let the hardware run past it before the kernel
    // reprograms the compare register
    hrt::TRIGGER_SUPPORTED.store(false, Ordering::Relaxed);
    hrt::Sys::set_rel_alarm(0, 5, 0).unwrap();
    hrt::advance_timer(3, 10);

    // Inserting a second job reprograms the compare for the (now overdue)
    // queue head; without software trigger support the spin-set loop must
    // converge to a future value
    hrt::Sys::set_rel_alarm(1, 20, 0).unwrap();
    let compare = hrt::COMPARES[3].load(Ordering::Relaxed) as u32;
    let now = hrt::TIMERS[3].load(Ordering::Relaxed) as u32;
    assert!(compare > now, "compare must end up in the future");
    assert!(compare - now <= 4, "the corrective loop converges quickly");

    // The tick dispatches the overdue job
    hrt::run_pit_ticks(0, 1);
    {
        let lock = klock::lock_cpu::<hrt::Sys>().unwrap();
        assert_eq!(hrt::TASK_CBS[2].activation_count.get(&*lock), 1);
    }

    // With software trigger support the kernel fires the interrupt instead
    hrt::TRIGGER_SUPPORTED.store(true, Ordering::Relaxed);
    hrt::advance_timer(3, 25); // now 35, past AH1's expiry at 30
    let triggers = hrt::TRIGGER_COUNT.load(Ordering::Relaxed);
    hrt::Sys::set_rel_alarm(0, 50, 0).unwrap();
    assert_eq!(hrt::TRIGGER_COUNT.load(Ordering::Relaxed), triggers + 1);

    hrt::run_pit_ticks(0, 1);
}

/// `Suspend`/`ResumeAllInterrupts` pairs nest and restore the exact prior
/// interrupt-lock state.
#[test]
fn interrupt_suspend_round_trip() {
    let _guard = guard(&misc::LOCK);
    misc::reset();

    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 0);

    misc::Sys::suspend_all_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 2);
    misc::Sys::suspend_all_interrupts();
    misc::Sys::suspend_os_interrupts();

    misc::Sys::resume_os_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 2);
    misc::Sys::resume_all_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 2);
    misc::Sys::resume_all_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 0);

    misc::Sys::disable_all_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 2);
    misc::Sys::enable_all_interrupts();
    assert_eq!(misc::INT_LEVELS[0].load(Ordering::Relaxed), 0);
}

#[test]
fn trusted_function_call() {
    let _guard = guard(&misc::LOCK);
    misc::reset();

    misc::Sys::call_trusted_function(0, 42).unwrap();
    assert!(fixtures::MISC_TRUSTED_CALLS.lock().unwrap().contains(&42));

    assert_eq!(
        misc::Sys::call_trusted_function(1, 0),
        Err(crate::error::CallTrustedFunctionError::Id)
    );
    assert_eq!(
        misc::Sys::call_non_trusted_function(0, 0),
        Err(crate::error::CallTrustedFunctionError::Id)
    );
}

#[test]
fn shutdown_runs_hooks() {
    let _guard = guard(&misc::LOCK);
    misc::reset();
    misc::boot_core(0, 0);

    let before = fixtures::MISC_SHUTDOWN.lock().unwrap().len();
    misc::run_diverging(
        || {
            misc::Sys::shutdown_os(ErrorCode::Ok);
        },
        "halt",
    );

    let recorded = fixtures::MISC_SHUTDOWN.lock().unwrap();
    assert_eq!(
        recorded.len() - before,
        2,
        "the application hook and the global hook both ran",
    );
    assert!(recorded[before..].iter().all(|&c| c == ErrorCode::Ok));
}

/// `ControlIdle` validates the core and records the selected mode.
#[test]
fn control_idle_modes() {
    let _guard = guard(&misc::LOCK);
    misc::reset();
    misc::boot_core(0, 0);

    misc::Sys::control_idle(0, crate::IdleMode::NoHalt).unwrap();
    assert_eq!(crate::idle_mode::<misc::Sys>(0), crate::IdleMode::NoHalt);
    misc::Sys::control_idle(0, crate::IdleMode::Halt).unwrap();
    assert_eq!(crate::idle_mode::<misc::Sys>(0), crate::IdleMode::Halt);

    assert_eq!(
        misc::Sys::control_idle(9, crate::IdleMode::Halt),
        Err(crate::error::ControlIdleError::Id)
    );
    assert_eq!(
        misc::Sys::control_idle(1, crate::IdleMode::Halt),
        Err(crate::error::ControlIdleError::Core),
        "core 1 was never activated",
    );
}
