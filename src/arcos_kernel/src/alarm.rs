//! Alarms
//!
//! An alarm is a counter job plus an action. Cyclic alarms re-arm themselves
//! relative to their previous expiration, so no drift accumulates. One alarm
//! per core may carry the round-robin action, feeding time-slice events to
//! the scheduler.
use core::fmt;

use crate::{
    app, counter, error::*, event, hook,
    job::JobCb,
    klock, sched, task, xsig, AppAccessMask, AppId, AlarmId, CoreId, CounterId, EventMask,
    KernelTraits, PortThreading, ServiceId, TaskId, TickType,
};

/// The action performed when an alarm expires.
#[derive(Debug, Clone, Copy)]
pub enum AlarmAction {
    /// Activate the task.
    ActivateTask(TaskId),
    /// Set events for the task.
    SetEvent(TaskId, EventMask),
    /// Invoke an alarm callback routine. The routine runs with interrupts
    /// masked and must not call blocking services.
    Callback(fn()),
    /// Advance a software counter.
    IncrementCounter(CounterId),
    /// Deliver a round-robin time-slice event to this core's scheduler.
    RoundRobin,
}

/// Auto-start parameters of an alarm.
#[derive(Debug, Clone, Copy)]
pub struct AlarmAutostart {
    pub offset: TickType,
    pub cycle: TickType,
    /// Application modes in which the alarm is auto-started.
    pub modes: crate::AppModeMask,
    /// `true` to interpret `offset` as an absolute counter value.
    pub absolute: bool,
}

/// The static properties of an alarm.
pub struct AlarmAttr {
    /// The driving counter.
    pub counter: CounterId,
    pub action: AlarmAction,
    pub autostart: Option<AlarmAutostart>,
    pub core: CoreId,
    pub app: AppId,
    pub access: AppAccessMask,
}

/// The `GetAlarmBase` result: the characteristics of the driving counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmBase {
    pub max_allowed_value: TickType,
    pub ticks_per_base: TickType,
    pub min_cycle: TickType,
}

/// *Alarm control block* - the state data of an alarm.
pub struct AlarmCb<Traits: PortThreading> {
    pub attr: &'static AlarmAttr,

    /// The timed part.
    pub(crate) job: JobCb<Traits>,

    /// The cyclic reload value; `0` makes the alarm single-shot.
    pub(crate) cycle: klock::CpuLockCell<Traits, TickType>,
}

impl<Traits: KernelTraits> AlarmCb<Traits> {
    /// `id` must be the alarm's own dense id.
    pub const fn new(attr: &'static AlarmAttr, id: AlarmId) -> Self {
        Self {
            attr,
            job: JobCb::new(attr.counter, expired::<Traits>, id),
            cycle: klock::CpuLockCell::new(0),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for AlarmCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AlarmCb")
            .field("self", &(self as *const _))
            .field("job", &self.job)
            .field("cycle", &self.cycle)
            .finish()
    }
}

#[inline]
pub(crate) fn alarm_cb<Traits: KernelTraits>(
    id: AlarmId,
) -> Result<&'static AlarmCb<Traits>, BadIdError> {
    Traits::get_alarm_cb(id).ok_or(BadIdError::Id)
}

/// The job callback of every alarm.
fn expired<Traits: KernelTraits>(
    job: &'static JobCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> klock::CpuLockGuard<Traits> {
    let alarm = Traits::get_alarm_cb(job.param).unwrap();
    let counter_cb = Traits::get_counter_cb(job.counter).unwrap();

    // Re-arm before performing the action so the action observes a
    // consistent alarm state
    let cycle = alarm.cycle.get(&*lock.borrow_mut());
    if cycle != 0 {
        counter::reload_job(lock.borrow_mut(), counter_cb, job, cycle);
    }

    match alarm.attr.action {
        AlarmAction::ActivateTask(task_id) => {
            let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                return lock;
            };
            if task_cb.attr.core != Traits::core_id() {
                let _ = xsig::send::<Traits>(
                    lock.borrow_mut(),
                    task_cb.attr.core,
                    xsig::XSigRequest::ActivateTask(task_id),
                );
            } else if let Err(e) =
                task::activate_local(lock.borrow_mut(), task::TaskRef(task_cb))
            {
                hook::call_error_hook::<Traits>(
                    lock.borrow_mut(),
                    ServiceId::ActivateTask,
                    e.into(),
                );
            }
        }
        AlarmAction::SetEvent(task_id, mask) => {
            let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                return lock;
            };
            if task_cb.attr.core != Traits::core_id() {
                let _ = xsig::send::<Traits>(
                    lock.borrow_mut(),
                    task_cb.attr.core,
                    xsig::XSigRequest::SetEvent(task_id, mask),
                );
            } else if let Err(e) =
                event::set_event_local(lock.borrow_mut(), task::TaskRef(task_cb), mask)
            {
                hook::call_error_hook::<Traits>(
                    lock.borrow_mut(),
                    ServiceId::SetEvent,
                    e.into(),
                );
            }
        }
        AlarmAction::Callback(callback) => {
            // Alarm callback routines run with interrupts masked; they may
            // not call services that dispatch
            callback();
        }
        AlarmAction::IncrementCounter(counter_id) => {
            if let Some(target) = Traits::get_counter_cb(counter_id) {
                lock = increment_internal(lock, target);
            }
        }
        AlarmAction::RoundRobin => {
            sched::rr_event(lock.borrow_mut(), &Traits::local_core_cb().sched);
        }
    }

    lock
}

/// Advance a software counter from an alarm action, dispatching its due
/// jobs.
fn increment_internal<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
    target: &'static counter::CounterCb<Traits>,
) -> klock::CpuLockGuard<Traits> {
    debug_assert_eq!(target.attr.driver, counter::CounterDriver::Sw);
    let ch = target.attr.characteristics;
    let value = counter::add_mod(
        ch.max_counting_value,
        target.value.get(&*lock.borrow_mut()),
        1,
    );
    target.value.replace(&mut *lock.borrow_mut(), value);
    counter::dispatch_due_internal(lock, target)
}

// Services
// ---------------------------------------------------------------------------

/// Implements `GetAlarmBase`.
pub(crate) fn get_alarm_base<Traits: KernelTraits>(
    id: AlarmId,
) -> Result<AlarmBase, GetAlarmBaseError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let alarm = alarm_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), alarm.attr.access)?;

    let ch = &Traits::get_counter_cb(alarm.attr.counter)
        .unwrap()
        .attr
        .characteristics;
    Ok(AlarmBase {
        max_allowed_value: ch.max_allowed_value,
        ticks_per_base: ch.ticks_per_base,
        min_cycle: ch.min_cycle,
    })
}

/// Implements `GetAlarm`: the number of ticks before the alarm expires.
pub(crate) fn get_alarm<Traits: KernelTraits>(id: AlarmId) -> Result<TickType, GetAlarmError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let alarm = alarm_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), alarm.attr.access)?;

    if !alarm.job.linked.get(&*lock.borrow_mut()) {
        return Err(GetAlarmError::NoFunc);
    }

    let counter_cb = Traits::get_counter_cb(alarm.attr.counter).unwrap();
    Ok(counter::ticks_until(lock.borrow_mut(), counter_cb, &alarm.job))
}

fn validate_cycle(
    ch: &counter::CounterCharacteristics,
    cycle: TickType,
) -> Result<(), BadParamError> {
    if cycle != 0 && (cycle < ch.min_cycle || cycle > ch.max_allowed_value) {
        Err(BadParamError::Value)
    } else {
        Ok(())
    }
}

/// Implements `SetRelAlarm`.
pub(crate) fn set_rel_alarm<Traits: KernelTraits>(
    id: AlarmId,
    offset: TickType,
    cycle: TickType,
) -> Result<(), SetAlarmError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let alarm = alarm_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), alarm.attr.access)?;

    if alarm.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            alarm.attr.core,
            xsig::XSigRequest::SetRelAlarm(id, offset, cycle),
        )?;
        return Ok(());
    }

    set_rel_local(lock.borrow_mut(), alarm, offset, cycle)
}

/// The core portion of `SetRelAlarm`, also run by the XSignal executor.
pub(crate) fn set_rel_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    alarm: &'static AlarmCb<Traits>,
    offset: TickType,
    cycle: TickType,
) -> Result<(), SetAlarmError> {
    let counter_cb = Traits::get_counter_cb(alarm.attr.counter).unwrap();
    let ch = &counter_cb.attr.characteristics;

    if offset == 0 || offset > ch.max_allowed_value {
        return Err(SetAlarmError::Value);
    }
    validate_cycle(ch, cycle)?;

    if alarm.job.linked.get(&*lock) {
        return Err(SetAlarmError::State);
    }

    alarm.cycle.replace(&mut *lock, cycle);
    counter::add_rel_job(lock, counter_cb, &alarm.job, offset);
    Ok(())
}

/// Implements `SetAbsAlarm`.
pub(crate) fn set_abs_alarm<Traits: KernelTraits>(
    id: AlarmId,
    start: TickType,
    cycle: TickType,
) -> Result<(), SetAlarmError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let alarm = alarm_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), alarm.attr.access)?;

    if alarm.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            alarm.attr.core,
            xsig::XSigRequest::SetAbsAlarm(id, start, cycle),
        )?;
        return Ok(());
    }

    set_abs_local(lock.borrow_mut(), alarm, start, cycle)
}

/// The core portion of `SetAbsAlarm`, also run by the XSignal executor.
pub(crate) fn set_abs_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    alarm: &'static AlarmCb<Traits>,
    start: TickType,
    cycle: TickType,
) -> Result<(), SetAlarmError> {
    let counter_cb = Traits::get_counter_cb(alarm.attr.counter).unwrap();
    let ch = &counter_cb.attr.characteristics;

    if start > ch.max_allowed_value {
        return Err(SetAlarmError::Value);
    }
    validate_cycle(ch, cycle)?;

    if alarm.job.linked.get(&*lock) {
        return Err(SetAlarmError::State);
    }

    alarm.cycle.replace(&mut *lock, cycle);
    counter::add_abs_job(lock, counter_cb, &alarm.job, start)?;
    Ok(())
}

/// Implements `CancelAlarm`.
pub(crate) fn cancel_alarm<Traits: KernelTraits>(id: AlarmId) -> Result<(), CancelAlarmError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let alarm = alarm_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), alarm.attr.access)?;

    if alarm.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            alarm.attr.core,
            xsig::XSigRequest::CancelAlarm(id),
        )?;
        return Ok(());
    }

    cancel_local(lock.borrow_mut(), alarm)
}

/// The core portion of `CancelAlarm`, also run by the XSignal executor.
pub(crate) fn cancel_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    alarm: &'static AlarmCb<Traits>,
) -> Result<(), CancelAlarmError> {
    if !alarm.job.linked.get(&*lock) {
        return Err(CancelAlarmError::NoFunc);
    }

    let counter_cb = Traits::get_counter_cb(alarm.attr.counter).unwrap();
    counter::delete_job(lock, counter_cb, &alarm.job);
    Ok(())
}

/// Initialize an alarm at boot time, arming it if it's auto-started in the
/// given application mode.
pub(crate) fn init_alarm<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    alarm: &'static AlarmCb<Traits>,
    mode: crate::AppMode,
) {
    if alarm.attr.core != Traits::core_id() {
        return;
    }
    let Some(autostart) = alarm.attr.autostart else {
        return;
    };
    if autostart.modes & (1 << mode) == 0 {
        return;
    }

    let result = if autostart.absolute {
        set_abs_local(lock.borrow_mut(), alarm, autostart.offset, autostart.cycle)
    } else {
        set_rel_local(lock.borrow_mut(), alarm, autostart.offset, autostart.cycle)
    };
    debug_assert!(result.is_ok(), "malformed alarm autostart configuration");
}
