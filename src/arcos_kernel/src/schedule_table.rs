//! Schedule tables
//!
//! A schedule table is an ordered list of expiry points driven by a counter.
//! The table's job is always armed for the next expiry point; after the
//! final point it's armed for the end of the table's duration, where the
//! table repeats, hands off to a chained table, or stops. The hand-off and
//! the repetition are computed from the previous expiration, so no tick is
//! lost and no gap appears.
//!
//! Explicit synchronisation chases a global time reported through
//! `SyncScheduleTable`: each arming may shorten or lengthen the next delay
//! within the per-point bounds until the residual deviation fits the
//! configured precision.
use core::fmt;

use crate::{
    app, counter, error::*, event, hook,
    job::JobCb,
    klock, task, AppAccessMask, AppId, CoreId, CounterId, EventMask, KernelTraits, PortThreading,
    ScheduleTableId, ServiceId, TaskId, TickType,
};

/// An action of an expiry point.
#[derive(Debug, Clone, Copy)]
pub enum ExpiryAction {
    ActivateTask(TaskId),
    SetEvent(TaskId, EventMask),
}

/// One expiry point of a schedule table.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPoint {
    /// Offset from the start of the table. Strictly increasing within a
    /// table.
    pub offset: TickType,

    pub actions: &'static [ExpiryAction],

    /// The most the delay *to this point* may be shortened for explicit
    /// synchronisation.
    pub max_shorten: TickType,

    /// The most the delay *to this point* may be lengthened for explicit
    /// synchronisation.
    pub max_lengthen: TickType,
}

/// How a schedule table synchronises with a time source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// No synchronisation.
    None,
    /// The driving counter *is* the synchronisation source.
    Implicit,
    /// An external provider reports the global time via
    /// `SyncScheduleTable`.
    Explicit { precision: TickType },
}

/// Schedule table state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTableState {
    Stopped,
    Running,
    RunningAndSynchronous,
    /// Chained behind another table by `NextScheduleTable`.
    Next,
}

/// The static properties of a schedule table.
pub struct ScheduleTableAttr {
    /// The driving counter.
    pub counter: CounterId,

    /// The length of one table round, in counter ticks. Greater than the
    /// offset of the final expiry point.
    pub duration: TickType,

    /// The expiry points, ordered by offset.
    pub points: &'static [ExpiryPoint],

    pub sync: SyncStrategy,

    /// `true` for periodic tables.
    pub repeating: bool,

    pub core: CoreId,
    pub app: AppId,
    pub access: AppAccessMask,
}

/// *Schedule table control block* - the state data of a schedule table.
pub struct ScheduleTableCb<Traits: PortThreading> {
    pub attr: &'static ScheduleTableAttr,

    /// The timed part, armed for the next expiry point (or for the end of
    /// the round when `point_idx == points.len()`).
    pub(crate) job: JobCb<Traits>,

    pub(crate) state: klock::CpuLockCell<Traits, ScheduleTableState>,

    /// Index of the next expiry point to fire; `points.len()` denotes the
    /// end-of-round marker.
    pub(crate) point_idx: klock::CpuLockCell<Traits, usize>,

    /// Residual deviation from the sync source in ticks; positive when the
    /// table runs ahead of the global time.
    pub(crate) deviation: klock::CpuLockCell<Traits, i64>,

    /// A sync provider has reported a global time since the table was
    /// started.
    pub(crate) sync_active: klock::CpuLockCell<Traits, bool>,

    /// The table chained behind this one.
    pub(crate) next_table: klock::CpuLockCell<Traits, Option<ScheduleTableId>>,
}

impl<Traits: KernelTraits> ScheduleTableCb<Traits> {
    /// `id` must be the table's own dense id.
    pub const fn new(attr: &'static ScheduleTableAttr, id: ScheduleTableId) -> Self {
        Self {
            attr,
            job: JobCb::new(attr.counter, expired::<Traits>, id),
            state: klock::CpuLockCell::new(ScheduleTableState::Stopped),
            point_idx: klock::CpuLockCell::new(0),
            deviation: klock::CpuLockCell::new(0),
            sync_active: klock::CpuLockCell::new(false),
            next_table: klock::CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ScheduleTableCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ScheduleTableCb")
            .field("self", &(self as *const _))
            .field("state", &self.state)
            .field("point_idx", &self.point_idx)
            .field("deviation", &self.deviation)
            .field("next_table", &self.next_table)
            .finish_non_exhaustive()
    }
}

#[inline]
pub(crate) fn table_cb<Traits: KernelTraits>(
    id: ScheduleTableId,
) -> Result<&'static ScheduleTableCb<Traits>, BadIdError> {
    Traits::get_schedule_table_cb(id).ok_or(BadIdError::Id)
}

fn expect_local<Traits: KernelTraits>(
    table: &'static ScheduleTableCb<Traits>,
) -> Result<(), BadCoreError> {
    if table.attr.core != Traits::core_id() {
        Err(BadCoreError::Core)
    } else {
        Ok(())
    }
}

// Expiry processing
// ---------------------------------------------------------------------------

fn fire_point<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    point: &ExpiryPoint,
) {
    for action in point.actions {
        match *action {
            ExpiryAction::ActivateTask(task_id) => {
                let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                    continue;
                };
                if let Err(e) = task::activate_local(lock.borrow_mut(), task::TaskRef(task_cb)) {
                    hook::call_error_hook::<Traits>(
                        lock.borrow_mut(),
                        ServiceId::ActivateTask,
                        e.into(),
                    );
                }
            }
            ExpiryAction::SetEvent(task_id, mask) => {
                let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                    continue;
                };
                if let Err(e) =
                    event::set_event_local(lock.borrow_mut(), task::TaskRef(task_cb), mask)
                {
                    hook::call_error_hook::<Traits>(lock.borrow_mut(), ServiceId::SetEvent, e.into());
                }
            }
        }
    }
}

/// The delay from `point[idx]`'s table time to `point[idx + 1]`'s (or to the
/// end of the round), adjusted for explicit synchronisation.
fn next_delay<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    table: &'static ScheduleTableCb<Traits>,
    raw_delay: TickType,
    target: &ExpiryPoint,
) -> TickType {
    let SyncStrategy::Explicit { precision } = table.attr.sync else {
        return raw_delay;
    };
    if !table.sync_active.get(&*lock) {
        return raw_delay;
    }

    let deviation = table.deviation.get(&*lock);
    let mut delay = raw_delay as i64;

    if deviation > 0 {
        // Table runs ahead; stretch the next delay
        let adj = deviation.min(target.max_lengthen as i64);
        delay += adj;
        table.deviation.replace(&mut *lock, deviation - adj);
    } else if deviation < 0 {
        // Table runs behind; compress the next delay
        let adj = (-deviation).min(target.max_shorten as i64).min(delay - 1);
        delay -= adj;
        table.deviation.replace(&mut *lock, deviation + adj);
    }

    let residual = table.deviation.get(&*lock).unsigned_abs();
    let state = if residual <= precision as u64 {
        ScheduleTableState::RunningAndSynchronous
    } else {
        ScheduleTableState::Running
    };
    table.state.replace(&mut *lock, state);

    delay as TickType
}

/// The job callback of every schedule table.
fn expired<Traits: KernelTraits>(
    job: &'static JobCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> klock::CpuLockGuard<Traits> {
    let mut table = Traits::get_schedule_table_cb(job.param).unwrap();

    loop {
        let counter_cb = Traits::get_counter_cb(table.attr.counter).unwrap();
        let points = table.attr.points;
        let idx = table.point_idx.get(&*lock.borrow_mut());

        if idx < points.len() {
            fire_point::<Traits>(lock.borrow_mut(), &points[idx]);

            let (raw_delay, next_idx) = if idx + 1 < points.len() {
                (points[idx + 1].offset - points[idx].offset, idx + 1)
            } else {
                // Final delay to the end of the round
                (table.attr.duration - points[idx].offset, points.len())
            };

            table.point_idx.replace(&mut *lock.borrow_mut(), next_idx);

            if next_idx < points.len() {
                let delay = next_delay(
                    lock.borrow_mut(),
                    table,
                    raw_delay,
                    &points[next_idx],
                );
                counter::reload_job(lock.borrow_mut(), counter_cb, &table.job, delay);
            } else if raw_delay > 0 {
                counter::reload_job(lock.borrow_mut(), counter_cb, &table.job, raw_delay);
            } else {
                // `duration == offset[last]`; the end of the round coincides
                // with the final point
                continue;
            }
            break;
        }

        // End-of-round marker
        if let Some(next_id) = table.next_table.replace(&mut *lock.borrow_mut(), None) {
            // Chained hand-off: the successor starts exactly where this
            // round ended
            let successor = Traits::get_schedule_table_cb(next_id).unwrap();
            table.state
                .replace(&mut *lock.borrow_mut(), ScheduleTableState::Stopped);

            successor
                .state
                .replace(&mut *lock.borrow_mut(), ScheduleTableState::Running);
            successor.point_idx.replace(&mut *lock.borrow_mut(), 0);
            // Transplant the end-of-round timestamp so the successor's
            // offsets count from the hand-off instant
            let end = table.job.expiration.get(&*lock.borrow_mut());
            successor.job.expiration.replace(&mut *lock.borrow_mut(), end);

            let first = successor.attr.points[0].offset;
            if first > 0 {
                let successor_counter = Traits::get_counter_cb(successor.attr.counter).unwrap();
                counter::reload_job(
                    lock.borrow_mut(),
                    successor_counter,
                    &successor.job,
                    first,
                );
                break;
            }
            table = successor;
            continue;
        }

        if table.attr.repeating {
            let first = points[0].offset;
            table.point_idx.replace(&mut *lock.borrow_mut(), 0);
            if first > 0 {
                counter::reload_job(lock.borrow_mut(), counter_cb, &table.job, first);
                break;
            }
            continue;
        }

        table
            .state
            .replace(&mut *lock.borrow_mut(), ScheduleTableState::Stopped);
        break;
    }

    lock
}

// Services
// ---------------------------------------------------------------------------

fn precheck_start<Traits: KernelTraits>(
    lock: &mut klock::CpuLockGuard<Traits>,
    id: ScheduleTableId,
) -> Result<&'static ScheduleTableCb<Traits>, StartScheduleTableError> {
    let table = table_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), table.attr.access)?;
    expect_local::<Traits>(table)?;

    if table.state.get(&*lock.borrow_mut()) != ScheduleTableState::Stopped {
        return Err(StartScheduleTableError::State);
    }
    Ok(table)
}

/// Implements `StartScheduleTableRel`.
pub(crate) fn start_rel<Traits: KernelTraits>(
    id: ScheduleTableId,
    offset: TickType,
) -> Result<(), StartScheduleTableError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = precheck_start(&mut lock, id)?;

    let counter_cb = Traits::get_counter_cb(table.attr.counter).unwrap();
    let ch = &counter_cb.attr.characteristics;
    let initial = table.attr.points[0].offset;

    if offset == 0 || offset > ch.max_allowed_value - initial {
        return Err(StartScheduleTableError::Value);
    }

    table.point_idx.replace(&mut *lock.borrow_mut(), 0);
    table.deviation.replace(&mut *lock.borrow_mut(), 0);
    table.sync_active.replace(&mut *lock.borrow_mut(), false);
    table
        .state
        .replace(&mut *lock.borrow_mut(), ScheduleTableState::Running);
    counter::add_rel_job(lock.borrow_mut(), counter_cb, &table.job, offset + initial);
    Ok(())
}

/// Implements `StartScheduleTableAbs`.
pub(crate) fn start_abs<Traits: KernelTraits>(
    id: ScheduleTableId,
    start: TickType,
) -> Result<(), StartScheduleTableError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = precheck_start(&mut lock, id)?;

    let counter_cb = Traits::get_counter_cb(table.attr.counter).unwrap();
    let ch = &counter_cb.attr.characteristics;
    let initial = table.attr.points[0].offset;

    if start > ch.max_allowed_value {
        return Err(StartScheduleTableError::Value);
    }

    table.point_idx.replace(&mut *lock.borrow_mut(), 0);
    table.deviation.replace(&mut *lock.borrow_mut(), 0);
    table.sync_active.replace(&mut *lock.borrow_mut(), false);
    table
        .state
        .replace(&mut *lock.borrow_mut(), ScheduleTableState::Running);

    let first = counter::add_mod(ch.max_counting_value, start, initial);
    counter::add_abs_job(lock.borrow_mut(), counter_cb, &table.job, first)?;
    Ok(())
}

/// Implements `StopScheduleTable`.
pub(crate) fn stop<Traits: KernelTraits>(id: ScheduleTableId) -> Result<(), StopScheduleTableError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = table_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), table.attr.access)?;
    expect_local::<Traits>(table)?;

    if table.state.get(&*lock.borrow_mut()) == ScheduleTableState::Stopped {
        return Err(StopScheduleTableError::NoFunc);
    }

    stop_unconditionally(lock.borrow_mut(), table);
    Ok(())
}

/// Stop a table regardless of its current state (application termination,
/// `StopScheduleTable`).
pub(crate) fn stop_unconditionally<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    table: &'static ScheduleTableCb<Traits>,
) {
    let counter_cb = Traits::get_counter_cb(table.attr.counter).unwrap();
    counter::delete_job(lock.borrow_mut(), counter_cb, &table.job);
    table
        .state
        .replace(&mut *lock, ScheduleTableState::Stopped);

    // Stopping a table also cancels a chained successor
    if let Some(next_id) = table.next_table.replace(&mut *lock, None) {
        let successor = Traits::get_schedule_table_cb(next_id).unwrap();
        successor
            .state
            .replace(&mut *lock, ScheduleTableState::Stopped);
    }
}

/// Implements `NextScheduleTable`.
pub(crate) fn next<Traits: KernelTraits>(
    from_id: ScheduleTableId,
    to_id: ScheduleTableId,
) -> Result<(), NextScheduleTableError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let from = table_cb::<Traits>(from_id)?;
    let to = table_cb::<Traits>(to_id)?;

    app::check_access::<Traits>(lock.borrow_mut(), from.attr.access)?;
    app::check_access::<Traits>(lock.borrow_mut(), to.attr.access)?;
    expect_local::<Traits>(from)?;
    expect_local::<Traits>(to)?;

    if from.attr.counter != to.attr.counter {
        return Err(NextScheduleTableError::Id);
    }

    match from.state.get(&*lock.borrow_mut()) {
        ScheduleTableState::Running | ScheduleTableState::RunningAndSynchronous => {}
        _ => return Err(NextScheduleTableError::NoFunc),
    }
    if to.state.get(&*lock.borrow_mut()) != ScheduleTableState::Stopped {
        return Err(NextScheduleTableError::State);
    }

    // Replacing a previously chained table releases it
    if let Some(old_id) = from.next_table.replace(&mut *lock.borrow_mut(), Some(to_id)) {
        let old = Traits::get_schedule_table_cb(old_id).unwrap();
        old.state
            .replace(&mut *lock.borrow_mut(), ScheduleTableState::Stopped);
    }
    to.state
        .replace(&mut *lock.borrow_mut(), ScheduleTableState::Next);
    Ok(())
}

/// Implements `SyncScheduleTable`.
pub(crate) fn sync<Traits: KernelTraits>(
    id: ScheduleTableId,
    global_time: TickType,
) -> Result<(), SyncScheduleTableError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = table_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), table.attr.access)?;
    expect_local::<Traits>(table)?;

    if !matches!(table.attr.sync, SyncStrategy::Explicit { .. }) {
        return Err(SyncScheduleTableError::Id);
    }
    if global_time >= table.attr.duration {
        return Err(SyncScheduleTableError::Value);
    }
    match table.state.get(&*lock.borrow_mut()) {
        ScheduleTableState::Running | ScheduleTableState::RunningAndSynchronous => {}
        _ => return Err(SyncScheduleTableError::State),
    }

    // Current table time, derived from the distance to the next expiry
    let counter_cb = Traits::get_counter_cb(table.attr.counter).unwrap();
    let points = table.attr.points;
    let idx = table.point_idx.get(&*lock.borrow_mut());
    let next_table_time = if idx < points.len() {
        points[idx].offset
    } else {
        table.attr.duration
    };
    let remaining = counter::ticks_until(lock.borrow_mut(), counter_cb, &table.job);
    let table_time =
        (next_table_time as i64 - remaining as i64).rem_euclid(table.attr.duration as i64);

    // Deviation normalized into (-duration/2, duration/2]
    let duration = table.attr.duration as i64;
    let mut deviation = (table_time - global_time as i64) % duration;
    if deviation > duration / 2 {
        deviation -= duration;
    } else if deviation <= -duration / 2 {
        deviation += duration;
    }
    table.deviation.replace(&mut *lock.borrow_mut(), deviation);
    table.sync_active.replace(&mut *lock.borrow_mut(), true);
    Ok(())
}

/// Implements `SetScheduleTableAsync`.
pub(crate) fn set_async<Traits: KernelTraits>(
    id: ScheduleTableId,
) -> Result<(), SetScheduleTableAsyncError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = table_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), table.attr.access)?;
    expect_local::<Traits>(table)?;

    if !matches!(table.attr.sync, SyncStrategy::Explicit { .. }) {
        return Err(SetScheduleTableAsyncError::Id);
    }
    match table.state.get(&*lock.borrow_mut()) {
        ScheduleTableState::Running | ScheduleTableState::RunningAndSynchronous => {}
        _ => return Err(SetScheduleTableAsyncError::State),
    }

    table.deviation.replace(&mut *lock.borrow_mut(), 0);
    table.sync_active.replace(&mut *lock.borrow_mut(), false);
    table
        .state
        .replace(&mut *lock.borrow_mut(), ScheduleTableState::Running);
    Ok(())
}

/// Implements `GetScheduleTableStatus`.
pub(crate) fn get_status<Traits: KernelTraits>(
    id: ScheduleTableId,
) -> Result<ScheduleTableState, GetScheduleTableStatusError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let table = table_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), table.attr.access)?;
    Ok(table.state.get(&*lock.borrow_mut()))
}
