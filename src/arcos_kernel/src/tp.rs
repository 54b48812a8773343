//! Timing protection
//!
//! Three budget kinds are enforced per monitored thread: an *execution
//! budget* (CPU time), *lock budgets* (per held resource or per
//! interrupt-lock class), and a minimum *inter-arrival time* between
//! activations.
//!
//! Each thread carries a LIFO of active budgets. Entering a locked section
//! pushes a new budget and freezes the outer one; leaving pops it and
//! deducts the time the inner section consumed from the outer budget,
//! clamped at zero. One free-running hardware timer per core drives the
//! monitor; its compare register is always programmed to the deadline of the
//! monitored thread's top-of-stack budget.
//!
//! A thread executing a trusted function marked delayed-violation defers
//! violations: only the highest-severity pending violation (LOCK >
//! EXECUTION > ARRIVAL) is recorded and re-raised when the delay level
//! returns to zero.
use arrayvec::ArrayVec;
use core::fmt;

use crate::{
    error::ErrorCode, hook, isr::IsrCb, klock, task::TaskRef, thread::ThreadRef, HwTimerId,
    KernelTraits, PortThreading, ResourceId, TickType,
};

/// The maximum depth of a budget stack: the execution budget plus the
/// bounded nesting of monitored locked sections.
pub(crate) const BUDGET_STACK_CAP: usize = 8;

/// A per-resource lock budget.
#[derive(Debug, Clone, Copy)]
pub struct TpLockBudget {
    pub resource: ResourceId,
    pub budget: TickType,
}

/// The timing-protection descriptor of a task or ISR.
#[derive(Debug, Clone, Copy)]
pub struct TpBudgets {
    /// CPU time allowed per activation.
    pub execution_budget: Option<TickType>,

    /// Minimum distance between successive activations.
    pub time_frame: Option<TickType>,

    /// Budgets for individual resources.
    pub resource_budgets: &'static [TpLockBudget],

    /// Budget for sections with all interrupts locked.
    pub all_interrupt_budget: Option<TickType>,

    /// Budget for sections with OS interrupts locked.
    pub os_interrupt_budget: Option<TickType>,
}

pub type TpTaskAttr = TpBudgets;
pub type TpIsrAttr = TpBudgets;

/// The kind of a monitored budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BudgetKind {
    Execution,
    Resource(ResourceId),
    AllInterrupts,
    OsInterrupts,
}

/// Violation kinds, ordered by severity (ascending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ProtectionKind {
    Arrival,
    Execution,
    Locked,
}

impl ProtectionKind {
    pub(crate) fn error_code(self) -> ErrorCode {
        match self {
            Self::Arrival => ErrorCode::ProtectionArrival,
            Self::Execution => ErrorCode::ProtectionTime,
            Self::Locked => ErrorCode::ProtectionLocked,
        }
    }
}

/// One entry of a budget stack.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BudgetFrame {
    pub(crate) kind: BudgetKind,
    /// Ticks left before this budget is exhausted.
    pub(crate) remaining: TickType,
    /// Ticks charged to this frame while it was on top, including time
    /// propagated from inner frames.
    pub(crate) consumed: TickType,
}

/// Per-thread timing-protection state, embedded in task and ISR control
/// blocks.
pub struct TpThreadState<Traits: PortThreading> {
    /// The earliest timer value the next activation may arrive at.
    pub(crate) earliest_arrival: klock::CpuLockCell<Traits, TickType>,

    /// `false` until the first monitored arrival.
    pub(crate) arrival_armed: klock::CpuLockCell<Traits, bool>,

    /// The active budgets, outermost first.
    pub(crate) budget_stack:
        klock::CpuLockCell<Traits, ArrayVec<BudgetFrame, BUDGET_STACK_CAP>>,

    /// The highest-severity violation deferred by a delayed-violation
    /// trusted function.
    pub(crate) pending_violation: klock::CpuLockCell<Traits, Option<ProtectionKind>>,

    /// Nesting depth of delayed-violation trusted functions.
    pub(crate) delay_level: klock::CpuLockCell<Traits, u32>,
}

impl<Traits: PortThreading> TpThreadState<Traits> {
    pub const fn new() -> Self {
        Self {
            earliest_arrival: klock::CpuLockCell::new(0),
            arrival_armed: klock::CpuLockCell::new(false),
            budget_stack: klock::CpuLockCell::new(ArrayVec::new_const()),
            pending_violation: klock::CpuLockCell::new(None),
            delay_level: klock::CpuLockCell::new(0),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TpThreadState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TpThreadState")
            .field("earliest_arrival", &self.earliest_arrival)
            .field("pending_violation", &self.pending_violation)
            .field("delay_level", &self.delay_level)
            .finish_non_exhaustive()
    }
}

/// *Timing-protection engine* - the per-core monitor state.
pub struct TpCoreCb<Traits: PortThreading> {
    /// The free-running timer driving this core's monitor.
    pub timer: HwTimerId,

    /// The thread currently charged, if it has a nonempty budget stack.
    pub(crate) monitored: klock::CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// The timer value at the last charge.
    pub(crate) last_update: klock::CpuLockCell<Traits, TickType>,
}

impl<Traits: PortThreading> TpCoreCb<Traits> {
    pub const fn new(timer: HwTimerId) -> Self {
        Self {
            timer,
            monitored: klock::CpuLockCell::new(None),
            last_update: klock::CpuLockCell::new(0),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TpCoreCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TpCoreCb")
            .field("timer", &self.timer)
            .field("monitored", &self.monitored)
            .finish_non_exhaustive()
    }
}

/// A compare value far enough away to act as "no deadline". The monitor is
/// re-programmed long before half the timer range elapses.
const NO_DEADLINE_DELTA: TickType = TickType::MAX / 2;

/// The timing-protection descriptor of a thread, if it's monitored.
fn budgets_of<Traits: KernelTraits>(thread: &ThreadRef<Traits>) -> Option<&'static TpBudgets> {
    match thread {
        ThreadRef::Task(task) => task.0.attr.tp,
        ThreadRef::Isr(isr_cb) => isr_cb.attr.tp,
        ThreadRef::Hook(_) => None,
    }
}

/// The mutable timing-protection state of a thread.
fn state_of<Traits: KernelTraits>(
    thread: &ThreadRef<Traits>,
) -> Option<&'static TpThreadState<Traits>> {
    match thread {
        ThreadRef::Task(task) => Some(&task.0.tp),
        ThreadRef::Isr(isr_cb) => Some(&isr_cb.tp),
        ThreadRef::Hook(_) => None,
    }
}

// Charging
// ---------------------------------------------------------------------------

/// Charge the elapsed time since the last update to the monitored thread's
/// top-of-stack budget.
fn charge<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let tp = &Traits::local_core_cb().tp;
    // Safety: CPU Lock active
    let now = unsafe { Traits::frt_now(tp.timer) };
    let elapsed = now.wrapping_sub(tp.last_update.get(&*lock));
    tp.last_update.replace(&mut *lock, now);

    let Some(thread) = tp.monitored.get(&*lock) else {
        return;
    };
    let Some(state) = state_of::<Traits>(&thread) else {
        return;
    };

    let stack = state.budget_stack.write(&mut *lock);
    if let Some(top) = stack.last_mut() {
        top.remaining = top.remaining.saturating_sub(elapsed);
        top.consumed = top.consumed.saturating_add(elapsed);
    }
}

/// Program the compare register for the monitored thread's top-of-stack
/// deadline.
fn program_deadline<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let tp = &Traits::local_core_cb().tp;
    // Safety: CPU Lock active
    let now = unsafe { Traits::frt_now(tp.timer) };

    let delta = tp
        .monitored
        .get(&*lock)
        .as_ref()
        .and_then(state_of::<Traits>)
        .and_then(|state| state.budget_stack.read(&*lock).last().copied())
        .map(|top| top.remaining.max(1))
        .unwrap_or(NO_DEADLINE_DELTA);

    // Safety: CPU Lock active
    unsafe { Traits::frt_set_compare(tp.timer, now.wrapping_add(delta)) };
}

/// Observe a thread switch: freeze the outgoing thread's budget, start
/// charging the incoming thread, and re-program the deadline.
pub(crate) fn thread_switch<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    _outgoing: ThreadRef<Traits>,
    incoming: ThreadRef<Traits>,
) {
    charge(lock.borrow_mut());

    let tp = &Traits::local_core_cb().tp;
    tp.monitored.replace(&mut *lock, Some(incoming));

    // A task entering for the first time in this activation starts its
    // execution budget
    if let Some(state) = state_of::<Traits>(&incoming) {
        if let Some(budgets) = budgets_of::<Traits>(&incoming) {
            let stack = state.budget_stack.write(&mut *lock);
            if stack.is_empty() {
                if let Some(execution_budget) = budgets.execution_budget {
                    stack.push(BudgetFrame {
                        kind: BudgetKind::Execution,
                        remaining: execution_budget,
                        consumed: 0,
                    });
                }
            }
        }
    }

    program_deadline(lock);
}

/// Push a lock budget onto the current thread's stack.
fn push_budget<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    kind: BudgetKind,
    budget: TickType,
) {
    charge(lock.borrow_mut());

    let Some(state) = state_of::<Traits>(&thread) else {
        return;
    };
    state.budget_stack.write(&mut *lock).push(BudgetFrame {
        kind,
        remaining: budget,
        consumed: 0,
    });

    program_deadline(lock);
}

/// Pop the top lock budget, deducting the time it consumed from the now
/// exposed outer budget (clamped at zero).
fn pop_budget<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    kind: BudgetKind,
) {
    charge(lock.borrow_mut());

    let Some(state) = state_of::<Traits>(&thread) else {
        return;
    };
    let stack = state.budget_stack.write(&mut *lock);
    let Some(inner) = stack.pop() else {
        return;
    };
    debug_assert_eq!(inner.kind, kind);

    if let Some(outer) = stack.last_mut() {
        outer.remaining = outer.remaining.saturating_sub(inner.consumed);
        outer.consumed = outer.consumed.saturating_add(inner.consumed);
    }

    program_deadline(lock);
}

// Lock-budget entry points
// ---------------------------------------------------------------------------

pub(crate) fn enter_resource_lock<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    resource: ResourceId,
) {
    let Some(budgets) = budgets_of::<Traits>(&thread) else {
        return;
    };
    let Some(entry) = budgets
        .resource_budgets
        .iter()
        .find(|b| b.resource == resource)
    else {
        return;
    };
    push_budget(lock, thread, BudgetKind::Resource(resource), entry.budget);
}

pub(crate) fn leave_resource_lock<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadRef<Traits>,
    resource: ResourceId,
) {
    let Some(budgets) = budgets_of::<Traits>(&thread) else {
        return;
    };
    if budgets
        .resource_budgets
        .iter()
        .any(|b| b.resource == resource)
    {
        pop_budget(lock, thread, BudgetKind::Resource(resource));
    }
}

pub(crate) fn enter_all_interrupt_lock<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    if let Some(budget) = budgets_of::<Traits>(&thread).and_then(|b| b.all_interrupt_budget) {
        push_budget(lock, thread, BudgetKind::AllInterrupts, budget);
    }
}

pub(crate) fn leave_all_interrupt_lock<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    if budgets_of::<Traits>(&thread)
        .and_then(|b| b.all_interrupt_budget)
        .is_some()
    {
        pop_budget(lock, thread, BudgetKind::AllInterrupts);
    }
}

pub(crate) fn enter_os_interrupt_lock<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    if let Some(budget) = budgets_of::<Traits>(&thread).and_then(|b| b.os_interrupt_budget) {
        push_budget(lock, thread, BudgetKind::OsInterrupts, budget);
    }
}

pub(crate) fn leave_os_interrupt_lock<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    if budgets_of::<Traits>(&thread)
        .and_then(|b| b.os_interrupt_budget)
        .is_some()
    {
        pop_budget(lock, thread, BudgetKind::OsInterrupts);
    }
}

/// `enter_all_interrupt_lock` for call sites that may or may not already
/// hold the kernel lock (the interrupt-disable services). When the lock is
/// held the caller is kernel code, which is not lock-budget monitored.
pub(crate) fn enter_all_interrupt_lock_unlocked<Traits: KernelTraits>() {
    if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
        enter_all_interrupt_lock(lock.borrow_mut());
    }
}

pub(crate) fn leave_all_interrupt_lock_unlocked<Traits: KernelTraits>() {
    if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
        leave_all_interrupt_lock(lock.borrow_mut());
    }
}

pub(crate) fn enter_os_interrupt_lock_unlocked<Traits: KernelTraits>() {
    if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
        enter_os_interrupt_lock(lock.borrow_mut());
    }
}

pub(crate) fn leave_os_interrupt_lock_unlocked<Traits: KernelTraits>() {
    if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
        leave_os_interrupt_lock(lock.borrow_mut());
    }
}

// Inter-arrival enforcement
// ---------------------------------------------------------------------------

/// Check the inter-arrival frame of a task activation. Returns `false` when
/// the activation must be dropped.
pub(crate) fn task_arrival_check<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) -> bool {
    let Some(budgets) = task.0.attr.tp else {
        return true;
    };
    arrival_check::<Traits>(lock, &task.0.tp, budgets, Traits::get_app_cb(task.0.attr.app))
}

/// Check the inter-arrival frame of an ISR invocation. Returns `false` when
/// the invocation must be dropped.
pub(crate) fn isr_arrival_check<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    isr_cb: &'static IsrCb<Traits>,
) -> bool {
    let Some(budgets) = isr_cb.attr.tp else {
        return true;
    };
    arrival_check::<Traits>(lock, &isr_cb.tp, budgets, Traits::get_app_cb(isr_cb.attr.app))
}

fn arrival_check<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    state: &'static TpThreadState<Traits>,
    budgets: &'static TpBudgets,
    app_cb: Option<&'static crate::app::AppCb<Traits>>,
) -> bool {
    let Some(time_frame) = budgets.time_frame else {
        return true;
    };

    let tp = &Traits::local_core_cb().tp;
    // Safety: CPU Lock active
    let now = unsafe { Traits::frt_now(tp.timer) };

    if state.arrival_armed.get(&*lock) {
        let earliest = state.earliest_arrival.get(&*lock);
        // Signed wrap-around comparison: negative means `now` is still
        // before `earliest`
        if (now.wrapping_sub(earliest) as i32) < 0 {
            // The faulting activation is dropped regardless of the hook's
            // decision, so deferral doesn't apply here
            hook::arrival_violation::<Traits>(
                lock,
                ProtectionKind::Arrival.error_code(),
                app_cb,
            );
            return false;
        }
    }

    state.arrival_armed.replace(&mut *lock, true);
    state
        .earliest_arrival
        .replace(&mut *lock, now.wrapping_add(time_frame));
    true
}

// Violation handling
// ---------------------------------------------------------------------------

/// Raise a violation, deferring it while the owner executes a
/// delayed-violation trusted function.
fn raise_violation<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    kind: ProtectionKind,
    state: &'static TpThreadState<Traits>,
) {
    if state.delay_level.get(&*lock) > 0 {
        // Keep only the highest-severity pending violation
        let pending = state.pending_violation.get(&*lock);
        if pending.map_or(true, |p| kind > p) {
            state.pending_violation.replace(&mut *lock, Some(kind));
        }
        return;
    }

    hook::protection_violation::<Traits>(lock, kind.error_code());
}

/// The TP timer of the calling core expired: the monitored thread's active
/// budget is exhausted.
pub(crate) fn timer_expired<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    charge(lock.borrow_mut());

    let tp = &Traits::local_core_cb().tp;
    // Safety: CPU Lock active
    unsafe { Traits::timer_ack(tp.timer) };

    let Some(thread) = tp.monitored.get(&*lock.borrow_mut()) else {
        return;
    };
    let Some(state) = state_of::<Traits>(&thread) else {
        return;
    };

    let Some(top) = state.budget_stack.read(&*lock.borrow_mut()).last().copied() else {
        return;
    };
    if top.remaining > 0 {
        // Early wake-up; re-arm for the residual budget
        program_deadline(lock.borrow_mut());
        return;
    }

    let kind = match top.kind {
        BudgetKind::Execution => ProtectionKind::Execution,
        BudgetKind::Resource(_) | BudgetKind::AllInterrupts | BudgetKind::OsInterrupts => {
            ProtectionKind::Locked
        }
    };

    raise_violation(lock.borrow_mut(), kind, state);
    program_deadline(lock.borrow_mut());

    crate::task::task_unlock_cpu_and_check_preemption(lock);
}

/// Reset a killed task's budgets. The inter-arrival state is preserved.
pub(crate) fn reset_budgets<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    task.0.tp.budget_stack.write(&mut *lock).clear();
    task.0.tp.pending_violation.replace(&mut *lock, None);
    task.0.tp.delay_level.replace(&mut *lock, 0);
}

// Delayed violations
// ---------------------------------------------------------------------------

/// Enter a delayed-violation trusted function on the current thread.
pub(crate) fn enter_delay_level<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    if let Some(state) = state_of::<Traits>(&thread) {
        let level = state.delay_level.get(&*lock);
        state.delay_level.replace(&mut *lock, level + 1);
    }
}

/// Leave a delayed-violation trusted function, re-raising the pending
/// violation if one was deferred.
pub(crate) fn leave_delay_level<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let thread = crate::thread::current_thread::<Traits>(lock.borrow_mut());
    let Some(state) = state_of::<Traits>(&thread) else {
        return;
    };

    let level = state.delay_level.get(&*lock).saturating_sub(1);
    state.delay_level.replace(&mut *lock, level);

    if level == 0 {
        if let Some(kind) = state.pending_violation.replace(&mut *lock, None) {
            hook::protection_violation::<Traits>(lock, kind.error_code());
        }
    }
}
