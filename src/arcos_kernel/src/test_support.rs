//! Test support: a mock port and statically-declared system fixtures.
//!
//! `define_test_system!` plays the role of the offline configuration
//! generator: it emits a system type, the descriptor tables, and a mock HAL
//! whose context switches are synchronous (the "dispatcher" runs inline in
//! `yield_cpu`) and whose timers are plain atomics the tests advance by
//! hand. `dispatch_first_task`, `exit_and_dispatch` and `halt` unwind with
//! a panic so tests can drive code paths that never return.
//!
//! Each invocation owns all of its state, so test functions using different
//! fixtures can run concurrently; tests sharing one fixture serialize
//! through its `LOCK` mutex.
#![allow(dead_code)]

macro_rules! sys_count {
    () => (0usize);
    ($head:tt $(, $tail:tt)*) => (1usize + sys_count!($($tail),*));
}

macro_rules! define_test_system {
    (
        mod $name:ident {
            priority_levels: $prios:expr,
            idle_tasks: [$idle0:expr, $idle1:expr],
            tasks: [$($tname:ident => $tattr:expr),* $(,)?],
            isrs: [$($iname:ident => $iattr:expr),* $(,)?],
            counters: [$($cname:ident => $cattr:expr),* $(,)?],
            alarms: [$($aname:ident : $aid:expr => $aattr:expr),* $(,)?],
            tables: [$($stname:ident : $stid:expr => $stattr:expr),* $(,)?],
            resources: [$($rname:ident => $rattr:expr),* $(,)?],
            spinlocks: [$($lname:ident => $lattr:expr),* $(,)?],
            apps: [$($pname:ident => $pattr:expr),* $(,)?],
            trusted_fns: [$($fattr:expr),* $(,)?],
            hooks: $hooks:expr,
        }
    ) => {
        pub mod $name {
            #[allow(unused_imports)]
            use crate::{
                klock, startup, utils::Init, AlarmCb, AppCb, BootPattern, CoreCb, CounterCb,
                Hooks, InterruptLockLevel, IsrCb, JobNode, KernelCfg1, KernelCfg2, PortCores,
                PortInterrupts, PortThreading, PortTimer, ResourceCb, ScheduleTableCb,
                SpinlockCb, State, TaskCb, TaskRef, TrustedFnAttr, XSigChannel, XSigSlot,
            };
            use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

            pub struct Sys;

            // Descriptor tables
            // ---------------------------------------------------------------

            $(pub static $tname: crate::TaskAttr = $tattr;)*
            $(pub static $iname: crate::IsrAttr = $iattr;)*
            $(pub static $cname: crate::CounterAttr = $cattr;)*
            $(pub static $aname: crate::AlarmAttr = $aattr;)*
            $(pub static $stname: crate::ScheduleTableAttr = $stattr;)*
            $(pub static $rname: crate::ResourceAttr = $rattr;)*
            $(pub static $lname: crate::SpinlockAttr = $lattr;)*
            $(pub static $pname: crate::AppAttr = $pattr;)*

            pub static TASK_CBS: [TaskCb<Sys>; sys_count!($($tname),*)] =
                [$(TaskCb::new(&$tname)),*];
            pub static COUNTER_CBS: [CounterCb<Sys>; sys_count!($($cname),*)] =
                [$(CounterCb::new(&$cname)),*];
            pub static ALARM_CBS: [AlarmCb<Sys>; sys_count!($($aname),*)] =
                [$(AlarmCb::new(&$aname, $aid)),*];
            pub static TABLE_CBS: [ScheduleTableCb<Sys>; sys_count!($($stname),*)] =
                [$(ScheduleTableCb::new(&$stname, $stid)),*];
            pub static RESOURCE_CBS: [ResourceCb<Sys>; sys_count!($($rname),*)] =
                [$(ResourceCb::new(&$rname)),*];
            pub static SPINLOCK_CBS: [SpinlockCb<Sys>; sys_count!($($lname),*)] =
                [$(SpinlockCb::new(&$lname)),*];
            pub static APP_CBS: [AppCb<Sys>; sys_count!($($pname),*)] =
                [$(AppCb::new(&$pname)),*];
            pub static ISR_CBS: [IsrCb<Sys>; sys_count!($($iname),*)] =
                [$(IsrCb::new(&$iname)),*];
            pub static TRUSTED_FNS: [TrustedFnAttr; sys_count!($($fattr),*)] = [$($fattr),*];

            type RDeque = crate::utils::Deque<TaskRef<Sys>, 8>;
            type Queues = [klock::CpuLockCell<Sys, RDeque>; $prios];

            static QUEUES0: Queues = <Queues as Init>::INIT;
            static QUEUES1: Queues = <Queues as Init>::INIT;

            pub static CORE_CBS: [CoreCb<Sys>; 2] = [
                CoreCb::new(0, &QUEUES0, TaskRef(&TASK_CBS[$idle0]), 0),
                CoreCb::new(1, &QUEUES1, TaskRef(&TASK_CBS[$idle1]), 1),
            ];

            static XSIG_SLOTS_01: [XSigSlot; 8] = <[XSigSlot; 8] as Init>::INIT;
            static XSIG_SLOTS_10: [XSigSlot; 8] = <[XSigSlot; 8] as Init>::INIT;
            static XSIG_01: XSigChannel<Sys> = XSigChannel::new(&XSIG_SLOTS_01);
            static XSIG_10: XSigChannel<Sys> = XSigChannel::new(&XSIG_SLOTS_10);

            static STATE: State<Sys> = State::new();

            // Mock HAL state
            // ---------------------------------------------------------------

            /// Serializes the tests sharing this fixture.
            pub static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

            pub static CURRENT_CORE: AtomicUsize = AtomicUsize::new(0);
            pub static CPU_LOCK: [AtomicBool; 2] = [AtomicBool::new(false), AtomicBool::new(false)];
            pub static TASK_CONTEXT: AtomicBool = AtomicBool::new(true);
            pub static TIMERS: [AtomicUsize; 8] = [const { AtomicUsize::new(0) }; 8];
            pub static COMPARES: [AtomicUsize; 8] = [const { AtomicUsize::new(0) }; 8];
            pub static TRIGGER_SUPPORTED: AtomicBool = AtomicBool::new(true);
            pub static TRIGGER_COUNT: AtomicUsize = AtomicUsize::new(0);
            pub static SRC_ENABLED: [AtomicBool; 8] = [const { AtomicBool::new(false) }; 8];
            pub static SRC_PENDING: [AtomicBool; 8] = [const { AtomicBool::new(false) }; 8];
            pub static INT_LEVELS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];
            pub static XSIG_PENDING: [AtomicBool; 2] =
                [AtomicBool::new(false), AtomicBool::new(false)];
            pub static BARRIERS: [AtomicUsize; 2] = [AtomicUsize::new(0), AtomicUsize::new(0)];

            fn core() -> usize {
                CURRENT_CORE.load(Ordering::Relaxed)
            }

            // Port bindings
            // ---------------------------------------------------------------

            unsafe impl KernelCfg1 for Sys {
                const PRIORITY_LEVELS: usize = $prios;
                const CORE_COUNT: usize = 2;
                const ISR_NESTING_LIMIT: usize = 4;
                type ReadyBitmap = crate::utils::OneLevelBitmap<u16>;
            }

            unsafe impl PortThreading for Sys {
                type PortTaskState = ();

                unsafe fn dispatch_first_task() -> ! {
                    panic!("dispatch_first_task");
                }

                unsafe fn yield_cpu() {
                    // Synchronous dispatch: the mock "dispatcher" runs inline
                    unsafe {
                        Self::enter_cpu_lock();
                        <Sys as crate::PortToKernel>::choose_running_task();
                        Self::leave_cpu_lock();
                    }
                }

                unsafe fn exit_and_dispatch(_task: &'static TaskCb<Self>) -> ! {
                    unsafe { <Sys as crate::PortToKernel>::choose_running_task() };
                    panic!("exit_and_dispatch");
                }

                unsafe fn initialize_task_state(_task: &'static TaskCb<Self>) {}

                unsafe fn enter_cpu_lock() {
                    assert!(!CPU_LOCK[core()].swap(true, Ordering::Relaxed));
                }

                unsafe fn leave_cpu_lock() {
                    assert!(CPU_LOCK[core()].swap(false, Ordering::Relaxed));
                }

                fn is_cpu_lock_active() -> bool {
                    CPU_LOCK[core()].load(Ordering::Relaxed)
                }

                fn is_task_context() -> bool {
                    TASK_CONTEXT.load(Ordering::Relaxed)
                }
            }

            unsafe impl PortInterrupts for Sys {
                unsafe fn enable_interrupt_source(source: usize, clear_pending: bool) -> bool {
                    if clear_pending {
                        SRC_PENDING[source].store(false, Ordering::Relaxed);
                    }
                    SRC_ENABLED[source].store(true, Ordering::Relaxed);
                    true
                }

                unsafe fn disable_interrupt_source(source: usize) {
                    SRC_ENABLED[source].store(false, Ordering::Relaxed);
                }

                unsafe fn clear_pending_interrupt(source: usize) -> bool {
                    SRC_PENDING[source].store(false, Ordering::Relaxed);
                    true
                }

                fn is_interrupt_source_enabled(source: usize) -> bool {
                    SRC_ENABLED[source].load(Ordering::Relaxed)
                }

                fn is_interrupt_pending(source: usize) -> bool {
                    SRC_PENDING[source].load(Ordering::Relaxed)
                }

                unsafe fn set_interrupt_lock_level(level: InterruptLockLevel) {
                    INT_LEVELS[core()].store(
                        match level {
                            InterruptLockLevel::None => 0,
                            InterruptLockLevel::Cat2 => 1,
                            InterruptLockLevel::All => 2,
                        },
                        Ordering::Relaxed,
                    );
                }

                fn interrupt_lock_level() -> InterruptLockLevel {
                    match INT_LEVELS[core()].load(Ordering::Relaxed) {
                        0 => InterruptLockLevel::None,
                        1 => InterruptLockLevel::Cat2,
                        _ => InterruptLockLevel::All,
                    }
                }
            }

            unsafe impl PortTimer for Sys {
                unsafe fn frt_now(timer: usize) -> u32 {
                    TIMERS[timer].load(Ordering::Relaxed) as u32
                }

                unsafe fn frt_set_compare(timer: usize, value: u32) {
                    COMPARES[timer].store(value as usize, Ordering::Relaxed);
                }

                unsafe fn frt_trigger(timer: usize) -> bool {
                    let _ = timer;
                    if TRIGGER_SUPPORTED.load(Ordering::Relaxed) {
                        TRIGGER_COUNT.fetch_add(1, Ordering::Relaxed);
                        true
                    } else {
                        false
                    }
                }

                unsafe fn timer_ack(_timer: usize) {}
            }

            unsafe impl PortCores for Sys {
                fn core_id() -> usize {
                    core()
                }

                unsafe fn start_core(_core: usize) {}

                unsafe fn pend_xsig(core: usize) {
                    XSIG_PENDING[core].store(true, Ordering::Relaxed);
                }

                unsafe fn barrier_write(core: usize, pattern: BootPattern) {
                    BARRIERS[core].store(pattern_to_usize(pattern), Ordering::Relaxed);
                }

                fn barrier_read(core: usize) -> BootPattern {
                    pattern_from_usize(BARRIERS[core].load(Ordering::Relaxed))
                }

                unsafe fn init_hardware() {}

                unsafe fn halt() -> ! {
                    panic!("halt");
                }
            }

            fn pattern_to_usize(pattern: BootPattern) -> usize {
                match pattern {
                    BootPattern::Idle => 0,
                    BootPattern::WaitingSign => 1,
                    BootPattern::InitHardware => 2,
                    BootPattern::InitHardwareCompleted => 3,
                    BootPattern::StartCore => 4,
                }
            }

            fn pattern_from_usize(x: usize) -> BootPattern {
                match x {
                    0 => BootPattern::Idle,
                    1 => BootPattern::WaitingSign,
                    2 => BootPattern::InitHardware,
                    3 => BootPattern::InitHardwareCompleted,
                    _ => BootPattern::StartCore,
                }
            }

            unsafe impl KernelCfg2 for Sys {
                type ReadyDeque = RDeque;
                type JobHeap = arrayvec::ArrayVec<JobNode<Sys>, 8>;

                const HOOKS: Hooks = $hooks;

                fn task_cb_pool() -> &'static [TaskCb<Self>] {
                    &TASK_CBS
                }
                fn isr_cb_pool() -> &'static [IsrCb<Self>] {
                    &ISR_CBS
                }
                fn counter_cb_pool() -> &'static [CounterCb<Self>] {
                    &COUNTER_CBS
                }
                fn alarm_cb_pool() -> &'static [AlarmCb<Self>] {
                    &ALARM_CBS
                }
                fn schedule_table_cb_pool() -> &'static [ScheduleTableCb<Self>] {
                    &TABLE_CBS
                }
                fn resource_cb_pool() -> &'static [ResourceCb<Self>] {
                    &RESOURCE_CBS
                }
                fn spinlock_cb_pool() -> &'static [SpinlockCb<Self>] {
                    &SPINLOCK_CBS
                }
                fn app_cb_pool() -> &'static [AppCb<Self>] {
                    &APP_CBS
                }
                fn core_cb_pool() -> &'static [CoreCb<Self>] {
                    &CORE_CBS
                }
                fn trusted_fn_pool() -> &'static [TrustedFnAttr] {
                    &TRUSTED_FNS
                }

                fn xsig_channel(sender: usize, receiver: usize) -> &'static XSigChannel<Self> {
                    match (sender, receiver) {
                        (0, 1) => &XSIG_01,
                        (1, 0) => &XSIG_10,
                        _ => unreachable!(),
                    }
                }

                fn state() -> &'static State<Self> {
                    &STATE
                }
            }

            // Test drivers
            // ---------------------------------------------------------------

            /// Return every kernel object and the mock HAL to the power-on
            /// state. Called at the start of each test of this fixture.
            pub fn reset() {
                use crate::utils::{DequeLike, VecLike};
                use crate::TaskSt;

                for c in 0..2 {
                    CPU_LOCK[c].store(false, Ordering::Relaxed);
                    INT_LEVELS[c].store(0, Ordering::Relaxed);
                    BARRIERS[c].store(0, Ordering::Relaxed);
                    XSIG_PENDING[c].store(false, Ordering::Relaxed);
                }
                TASK_CONTEXT.store(true, Ordering::Relaxed);
                CURRENT_CORE.store(0, Ordering::Relaxed);
                for t in TIMERS.iter().chain(COMPARES.iter()) {
                    t.store(0, Ordering::Relaxed);
                }
                TRIGGER_SUPPORTED.store(true, Ordering::Relaxed);
                TRIGGER_COUNT.store(0, Ordering::Relaxed);
                for s in SRC_ENABLED.iter().chain(SRC_PENDING.iter()) {
                    s.store(false, Ordering::Relaxed);
                }
                for channel in [&XSIG_01, &XSIG_10] {
                    channel.write_idx.store(0, Ordering::Relaxed);
                    channel.read_idx.store(0, Ordering::Relaxed);
                }
                STATE.activated_cores.store(0, Ordering::Relaxed);
                STATE.shutdown_barrier.store(0, Ordering::Relaxed);
                STATE.shutdown_code.store(0, Ordering::Relaxed);
                STATE.app_mode.store(0, Ordering::Relaxed);

                let mut lock = klock::lock_cpu::<Sys>().unwrap();
                let mut token = lock.borrow_mut();

                for task_cb in &TASK_CBS {
                    task_cb.st.replace(&mut *token, TaskSt::Suspended);
                    task_cb
                        .current_priority
                        .replace(&mut *token, task_cb.attr.home_priority);
                    task_cb.activation_count.replace(&mut *token, 0);
                    task_cb.pending_events.replace(&mut *token, 0);
                    task_cb.waited_events.replace(&mut *token, 0);
                    task_cb.rr_slices_left.replace(&mut *token, 0);
                    task_cb.last_resource_held.replace(&mut *token, None);
                    reset_tp_state(token.borrow_mut(), &task_cb.tp);
                }
                for isr_cb in &ISR_CBS {
                    isr_cb.killed.replace(&mut *token, false);
                    isr_cb.last_resource_held.replace(&mut *token, None);
                    reset_tp_state(token.borrow_mut(), &isr_cb.tp);
                }
                for counter_cb in &COUNTER_CBS {
                    counter_cb.value.replace(&mut *token, 0);
                    counter_cb.hw_last.replace(&mut *token, 0);
                    let heap = counter_cb.heap.write(&mut *token);
                    while heap.pop().is_some() {}
                }
                for alarm_cb in &ALARM_CBS {
                    alarm_cb.job.linked.replace(&mut *token, false);
                    alarm_cb.job.expiration.replace(&mut *token, 0);
                    alarm_cb.cycle.replace(&mut *token, 0);
                }
                for table_cb in &TABLE_CBS {
                    table_cb
                        .state
                        .replace(&mut *token, crate::ScheduleTableState::Stopped);
                    table_cb.point_idx.replace(&mut *token, 0);
                    table_cb.deviation.replace(&mut *token, 0);
                    table_cb.sync_active.replace(&mut *token, false);
                    table_cb.next_table.replace(&mut *token, None);
                    table_cb.job.linked.replace(&mut *token, false);
                    table_cb.job.expiration.replace(&mut *token, 0);
                }
                for resource_cb in &RESOURCE_CBS {
                    resource_cb.holder.replace(&mut *token, None);
                    resource_cb.prev_held.replace(&mut *token, None);
                    resource_cb.prior_priority.replace(&mut *token, 0);
                }
                for spinlock_cb in &SPINLOCK_CBS {
                    spinlock_cb.owner.store(0, Ordering::Relaxed);
                    spinlock_cb.holder_task.replace(&mut *token, None);
                    spinlock_cb.prev_held.replace(&mut *token, None);
                }
                for app_cb in &APP_CBS {
                    app_cb.state.replace(&mut *token, crate::AppState::Accessible);
                }
                for core_cb in &CORE_CBS {
                    for queue_cell in core_cb.sched.queues {
                        let queue = queue_cell.write(&mut *token);
                        while queue.pop_front().is_some() {}
                    }
                    *core_cb.sched.bit_array.write(&mut *token) = crate::utils::Init::INIT;
                    core_cb
                        .sched
                        .current_task
                        .replace(&mut *token, core_cb.sched.idle_task);
                    core_cb
                        .sched
                        .next_task
                        .replace(&mut *token, core_cb.sched.idle_task);
                    core_cb.sched.current_priority.replace(&mut *token, 0);
                    core_cb.sched.next_priority.replace(&mut *token, 0);
                    core_cb.sched.rr_pending.replace(&mut *token, false);
                    core_cb
                        .current_thread
                        .replace(&mut *token, crate::ThreadRef::Task(core_cb.sched.idle_task));
                    core_cb.thread_stack.write(&mut *token).clear();
                    core_cb.core_state.store(0, Ordering::Relaxed);
                    core_cb.os_state.replace(&mut *token, crate::OsState::Init);
                    core_cb.critical_user_section.replace(&mut *token, 0);
                    core_cb.in_error_hook.replace(&mut *token, false);
                    core_cb.last_error.replace(&mut *token, None);
                    core_cb.idle_mode.store(0, Ordering::Relaxed);
                    core_cb.int_api_state.reset();
                    core_cb.last_spinlock.replace(&mut *token, None);
                    core_cb.tp.monitored.replace(&mut *token, None);
                    core_cb.tp.last_update.replace(&mut *token, 0);
                }
            }

            fn reset_tp_state(
                mut token: klock::CpuLockTokenRefMut<'_, Sys>,
                tp: &crate::tp::TpThreadState<Sys>,
            ) {
                tp.earliest_arrival.replace(&mut *token, 0);
                tp.arrival_armed.replace(&mut *token, false);
                tp.budget_stack.write(&mut *token).clear();
                tp.pending_violation.replace(&mut *token, None);
                tp.delay_level.replace(&mut *token, 0);
            }

            /// Boot the given core up to the first dispatch. The mock's
            /// `dispatch_first_task` unwinds; the CPU-Lock flag is cleared
            /// afterwards, leaving the core "running" its current task.
            pub fn boot_core(core_id: usize, mode: usize) {
                CURRENT_CORE.store(core_id, Ordering::Relaxed);
                unsafe { <Sys as PortThreading>::enter_cpu_lock() };
                let result = std::panic::catch_unwind(|| {
                    unsafe { <Sys as crate::Kernel>::start_os(mode) };
                });
                assert_eq!(
                    panic_message(&result.unwrap_err()),
                    "dispatch_first_task"
                );
                CPU_LOCK[core_id].store(false, Ordering::Relaxed);
            }

            /// Run a diverging service (`TerminateTask`, `ShutdownOS`, …),
            /// catching the mock port's unwinding stand-in for the final
            /// context switch.
            pub fn run_diverging<F: FnOnce() + std::panic::UnwindSafe>(
                f: F,
                expected: &str,
            ) {
                let result = std::panic::catch_unwind(f);
                assert_eq!(panic_message(&result.unwrap_err()), expected);
                CPU_LOCK[core()].store(false, Ordering::Relaxed);
            }

            fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
                if let Some(s) = payload.downcast_ref::<&str>() {
                    s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s
                } else {
                    "<non-string panic>"
                }
            }

            /// Advance a mock hardware timer.
            pub fn advance_timer(timer: usize, ticks: u32) {
                TIMERS[timer].fetch_add(ticks as usize, Ordering::Relaxed);
            }

            /// Deliver `ticks` periodic-timer interrupts to a counter.
            pub fn run_pit_ticks(counter: usize, ticks: u32) {
                for _ in 0..ticks {
                    unsafe { <Sys as crate::PortToKernel>::counter_tick(counter) };
                }
            }

            /// The current task id of a core, as seen by its scheduler.
            pub fn current_task_of(core_id: usize) -> usize {
                let saved = core();
                CURRENT_CORE.store(core_id, Ordering::Relaxed);
                let id = <Sys as crate::Kernel>::get_task_id();
                CURRENT_CORE.store(saved, Ordering::Relaxed);
                id
            }
        }
    };
}

mod fixtures;
#[cfg(test)]
mod scenarios;
