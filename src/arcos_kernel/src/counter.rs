//! Counters
//!
//! A counter is the tick source everything time-triggered hangs off of. Four
//! physical flavours are abstracted behind one contract:
//!
//! - **SW**: a pure in-RAM counter, advanced by `IncrementCounter`.
//! - **PIT**: a hardware periodic interrupt advances an in-RAM counter.
//! - **HRT**: a free-running hardware counter with a compare register; the
//!   kernel reconciles the software value from the hardware on each read and
//!   programs the compare register to the earliest job.
//! - **PFRT**: a software overlay on a free-running timer without a per-tick
//!   interrupt.
//!
//! # Value arithmetic
//!
//! Counter values live modulo `max_counting_value + 1` where
//! `max_counting_value = 2 * max_allowed_value + 1`. Whether a value is "in
//! the future of" a reference is decided by [`is_future_value`] - the sole
//! ordering rule across wrap-around.
use crate::{
    app, error::*,
    job::{JobCb, JobHeapCtx, JobNode},
    klock, task,
    utils::{BinaryHeap, VecLike},
    AppAccessMask, AppId, CoreId, CounterId, HwTimerId, KernelTraits, TickType,
};
use core::fmt;

/// The value-range parameters of a counter.
#[derive(Debug, Clone, Copy)]
pub struct CounterCharacteristics {
    /// The maximum value an alarm or API tick parameter may take.
    pub max_allowed_value: TickType,

    /// The modulus minus one of the counter's value domain
    /// (`2 * max_allowed_value + 1`).
    pub max_counting_value: TickType,

    /// The window deciding future vs. past in modular comparisons. Normally
    /// equal to `max_allowed_value`.
    pub max_differential_value: TickType,

    /// The smallest allowed cycle of a cyclic alarm.
    pub min_cycle: TickType,

    /// Hardware ticks per counter tick, informational for `GetAlarmBase`.
    pub ticks_per_base: TickType,
}

/// The physical flavour of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterDriver {
    /// Software counter, advanced by `IncrementCounter`.
    Sw,
    /// Periodic-interrupt timer.
    Pit { timer: HwTimerId },
    /// Free-running timer with a compare interrupt.
    Hrt { timer: HwTimerId },
    /// Free-running timer without an interrupt.
    Pfrt { timer: HwTimerId },
}

/// The static properties of a counter.
pub struct CounterAttr {
    pub driver: CounterDriver,
    pub characteristics: CounterCharacteristics,
    pub core: CoreId,
    pub app: AppId,
    pub access: AppAccessMask,
}

/// *Counter control block* - the state data of a counter.
pub struct CounterCb<Traits: KernelTraits> {
    pub attr: &'static CounterAttr,

    /// The current software value, always in `0..=max_counting_value`.
    pub(crate) value: klock::CpuLockCell<Traits, TickType>,

    /// The last raw hardware value observed (HRT/PFRT reconciliation).
    pub(crate) hw_last: klock::CpuLockCell<Traits, TickType>,

    /// Outstanding jobs, ordered by expiration.
    pub(crate) heap: klock::CpuLockCell<Traits, Traits::JobHeap>,
}

impl<Traits: KernelTraits> CounterCb<Traits> {
    pub const fn new(attr: &'static CounterAttr) -> Self {
        Self {
            attr,
            value: klock::CpuLockCell::new(0),
            hw_last: klock::CpuLockCell::new(0),
            heap: klock::CpuLockCell::new(crate::utils::Init::INIT),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for CounterCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CounterCb")
            .field("self", &(self as *const _))
            .field("value", &self.value)
            .field("heap", &(&self.heap as *const _))
            .finish_non_exhaustive()
    }
}

#[inline]
pub(crate) fn counter_cb<Traits: KernelTraits>(
    id: CounterId,
) -> Result<&'static CounterCb<Traits>, BadIdError> {
    Traits::get_counter_cb(id).ok_or(BadIdError::Id)
}

// Value arithmetic
// ---------------------------------------------------------------------------

/// `(x + offset) mod (max_counting_value + 1)`.
#[inline]
pub(crate) fn add_mod(max_counting_value: TickType, x: TickType, offset: TickType) -> TickType {
    debug_assert!(x <= max_counting_value);
    let modulus = max_counting_value as u64 + 1;
    ((x as u64 + offset as u64) % modulus) as TickType
}

/// `(x - y) mod (max_counting_value + 1)`.
#[inline]
pub(crate) fn sub_mod(max_counting_value: TickType, x: TickType, y: TickType) -> TickType {
    debug_assert!(x <= max_counting_value && y <= max_counting_value);
    if x >= y {
        x - y
    } else {
        x + (max_counting_value - y) + 1
    }
}

/// Return whether `value` lies in the future of `reference`.
///
/// `value` is in the future iff it is at most `max_differential_value` ticks
/// ahead of `reference` in modular arithmetic. Equal values are *not* future.
#[inline]
pub(crate) fn is_future_value(
    max_counting_value: TickType,
    max_differential_value: TickType,
    value: TickType,
    reference: TickType,
) -> bool {
    debug_assert!(value <= max_counting_value);
    debug_assert!(reference <= max_counting_value);

    if value == reference {
        false
    } else if value > reference {
        value - reference <= max_differential_value
    } else {
        reference - value > max_differential_value
    }
}

impl CounterCharacteristics {
    #[inline]
    pub(crate) fn heap_ctx(&self) -> JobHeapCtx {
        JobHeapCtx {
            max_counting_value: self.max_counting_value,
            max_differential_value: self.max_differential_value,
        }
    }
}

// Current value
// ---------------------------------------------------------------------------

/// Get the counter's current value, reconciling free-running hardware state
/// into the software value where applicable.
pub(crate) fn now<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
) -> TickType {
    let ch = &counter.attr.characteristics;
    match counter.attr.driver {
        CounterDriver::Sw | CounterDriver::Pit { .. } => counter.value.get(&*lock),
        CounterDriver::Hrt { timer } | CounterDriver::Pfrt { timer } => {
            // Safety: CPU Lock active
            let hw = unsafe { Traits::frt_now(timer) };
            let elapsed = hw.wrapping_sub(counter.hw_last.get(&*lock));
            counter.hw_last.replace(&mut *lock, hw);

            let value = add_mod(
                ch.max_counting_value,
                counter.value.get(&*lock),
                (elapsed as u64 % (ch.max_counting_value as u64 + 1)) as TickType,
            );
            counter.value.replace(&mut *lock, value);
            value
        }
    }
}

// Job queue management
// ---------------------------------------------------------------------------

/// Insert `job` with an expiration `offset` ticks from now.
pub(crate) fn add_rel_job<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
    offset: TickType,
) {
    let at = add_mod(
        counter.attr.characteristics.max_counting_value,
        now(lock.borrow_mut(), counter),
        offset,
    );
    insert_job(lock, counter, job, at);
}

/// Insert `job` with an absolute expiration timestamp. The timestamp must be
/// in the future of the counter's current value.
pub(crate) fn add_abs_job<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
    start: TickType,
) -> Result<(), BadParamError> {
    let ch = &counter.attr.characteristics;
    let current = now(lock.borrow_mut(), counter);
    let at = start % (ch.max_counting_value + 1);

    if !is_future_value(ch.max_counting_value, ch.max_differential_value, at, current) {
        return Err(BadParamError::Value);
    }

    insert_job(lock, counter, job, at);
    Ok(())
}

/// Re-insert an expired job `offset` ticks after its previous expiration.
/// Used by cyclic alarms and schedule tables so that no drift accumulates.
pub(crate) fn reload_job<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
    offset: TickType,
) {
    let at = add_mod(
        counter.attr.characteristics.max_counting_value,
        job.expiration.get(&*lock.borrow_mut()),
        offset,
    );
    insert_job(lock, counter, job, at);
}

fn insert_job<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
    at: TickType,
) {
    let ch = counter.attr.characteristics;
    debug_assert!(!job.linked.get(&*lock), "job is already linked");
    debug_assert!(at <= ch.max_counting_value);

    job.expiration.replace(&mut *lock, at);
    job.linked.replace(&mut *lock, true);

    counter
        .heap
        .write(&mut *lock)
        .heap_push(JobNode { at, job }, ch.heap_ctx());

    if let CounterDriver::Hrt { timer } = counter.attr.driver {
        program_compare(lock, counter, timer);
    }
}

/// Remove `job` from its counter's queue. Does nothing if it's not linked.
pub(crate) fn delete_job<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
) {
    if !job.linked.get(&*lock) {
        return;
    }

    let ch = counter.attr.characteristics;
    let heap = counter.heap.write(&mut *lock);
    let pos = heap
        .iter()
        .position(|node| core::ptr::eq(node.job, job))
        .expect("linked job is not in its counter's queue");
    heap.heap_remove(pos, ch.heap_ctx());

    job.linked.replace(&mut *lock, false);

    if let CounterDriver::Hrt { timer } = counter.attr.driver {
        program_compare(lock, counter, timer);
    }
}

/// Remaining ticks until `job` expires. The job must be linked.
pub(crate) fn ticks_until<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    job: &'static JobCb<Traits>,
) -> TickType {
    let ch = &counter.attr.characteristics;
    let current = now(lock.borrow_mut(), counter);
    sub_mod(
        ch.max_counting_value,
        job.expiration.get(&*lock),
        current,
    )
}

// Expiry dispatch
// ---------------------------------------------------------------------------

/// Pop and run every job that is due at the counter's current value. The
/// callbacks may re-insert their jobs.
pub(crate) fn dispatch_due_internal<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    counter: &'static CounterCb<Traits>,
) -> klock::CpuLockGuard<Traits> {
    let ch = counter.attr.characteristics;

    loop {
        let current = now(lock.borrow_mut(), counter);
        let token = lock.borrow_mut();

        let Some(&JobNode { at, job }) = counter.heap.read(&*token).get(0) else {
            break;
        };
        if is_future_value(ch.max_counting_value, ch.max_differential_value, at, current) {
            break;
        }

        let mut token = lock.borrow_mut();
        counter
            .heap
            .write(&mut *token)
            .heap_pop(ch.heap_ctx())
            .unwrap();
        job.linked.replace(&mut *token, false);

        lock = (job.callback)(job, lock);
    }

    lock
}

/// Announce a tick (PIT) or a compare match (HRT) of the hardware timer
/// backing `counter_id`. This is the port-side entry point; it dispatches
/// due jobs and checks for preemption afterwards.
pub(crate) fn handle_tick<Traits: KernelTraits>(counter_id: CounterId) {
    // The precondition includes CPU Lock being inactive
    let mut lock = klock::lock_cpu::<Traits>().unwrap();

    let Some(counter) = Traits::get_counter_cb(counter_id) else {
        debug_assert!(false, "tick for an unknown counter");
        return;
    };
    let ch = counter.attr.characteristics;

    match counter.attr.driver {
        CounterDriver::Pit { timer } => {
            let value = add_mod(
                ch.max_counting_value,
                counter.value.get(&*lock.borrow_mut()),
                1,
            );
            counter.value.replace(&mut *lock.borrow_mut(), value);
            // Safety: CPU Lock active
            unsafe { Traits::timer_ack(timer) };

            lock = dispatch_due_internal(lock, counter);
        }
        CounterDriver::Hrt { timer } => {
            // Safety: CPU Lock active
            unsafe { Traits::timer_ack(timer) };

            lock = dispatch_due_internal(lock, counter);
            program_compare(lock.borrow_mut(), counter, timer);
        }
        CounterDriver::Sw | CounterDriver::Pfrt { .. } => {
            debug_assert!(false, "tick for a counter without a tick interrupt");
        }
    }

    // The job callbacks may have woken up tasks
    task::task_unlock_cpu_and_check_preemption(lock);
}

/// Program the HRT compare register for the earliest outstanding job.
///
/// Defensive against the race where the target has already been passed by
/// the time the register is written: first try to trigger the interrupt in
/// software; failing that, spin-set the compare to `now + delta`, re-reading
/// until the target is in the future and widening `delta` every iteration to
/// guarantee progress.
fn program_compare<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    counter: &'static CounterCb<Traits>,
    timer: HwTimerId,
) {
    let ch = counter.attr.characteristics;

    let Some(&JobNode { at, .. }) = counter.heap.read(&*lock).get(0) else {
        return;
    };

    // Safety: CPU Lock active
    unsafe { Traits::frt_set_compare(timer, at) };

    let current = now(lock.borrow_mut(), counter);
    if is_future_value(ch.max_counting_value, ch.max_differential_value, at, current) {
        return;
    }

    // The target is already in the past relative to the hardware
    // Safety: CPU Lock active
    if unsafe { Traits::frt_trigger(timer) } {
        return;
    }

    let mut delta: TickType = 1;
    loop {
        let current = now(lock.borrow_mut(), counter);
        let target = add_mod(ch.max_counting_value, current, delta);
        // Safety: CPU Lock active
        unsafe { Traits::frt_set_compare(timer, target) };

        let reread = now(lock.borrow_mut(), counter);
        if is_future_value(ch.max_counting_value, ch.max_differential_value, target, reread) {
            break;
        }
        delta = delta.saturating_add(1);
    }
}

// Services
// ---------------------------------------------------------------------------

/// Implements `IncrementCounter`.
pub(crate) fn increment_counter<Traits: KernelTraits>(
    id: CounterId,
) -> Result<(), IncrementCounterError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let counter = counter_cb::<Traits>(id)?;

    app::check_access::<Traits>(lock.borrow_mut(), counter.attr.access)?;

    if counter.attr.driver != CounterDriver::Sw {
        return Err(IncrementCounterError::Id);
    }
    if counter.attr.core != Traits::core_id() {
        return Err(IncrementCounterError::Core);
    }

    let ch = counter.attr.characteristics;
    let value = add_mod(
        ch.max_counting_value,
        counter.value.get(&*lock.borrow_mut()),
        1,
    );
    counter.value.replace(&mut *lock.borrow_mut(), value);

    let lock = dispatch_due_internal(lock, counter);
    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Implements `GetCounterValue`.
pub(crate) fn get_counter_value<Traits: KernelTraits>(
    id: CounterId,
) -> Result<TickType, GetCounterValueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let counter = counter_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), counter.attr.access)?;
    Ok(now(lock.borrow_mut(), counter))
}

/// Implements `GetElapsedValue`. Returns `(current_value, elapsed)`.
pub(crate) fn get_elapsed_value<Traits: KernelTraits>(
    id: CounterId,
    previous: TickType,
) -> Result<(TickType, TickType), GetElapsedValueError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let counter = counter_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), counter.attr.access)?;

    let ch = &counter.attr.characteristics;
    if previous > ch.max_allowed_value {
        return Err(GetElapsedValueError::Value);
    }

    let current = now(lock.borrow_mut(), counter);
    let elapsed = sub_mod(ch.max_counting_value, current, previous);
    Ok((current, elapsed))
}
