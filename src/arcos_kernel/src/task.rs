//! Tasks
//!
//! A task is described by an immutable [`TaskAttr`] and a [`TaskCb`] holding
//! its mutable state. OSEK multiple activation is supported: every
//! activation queues another instance of the task in the scheduler; the
//! activation count is bounded by `max_activations`.
use core::fmt;

use crate::{
    app, error::*, hook, isr, klock, resource, sched, spinlock, thread, tp,
    utils::{DequeLike, Init, PrioBitmap},
    xsig, AppAccessMask, AppId, AppModeMask, CoreId, EventMask, KernelTraits, PortThreading,
    Priority, ServiceId, TaskId, INVALID_TASK,
};

/// A reference to a task control block, compared by identity.
pub struct TaskRef<Traits: PortThreading>(pub &'static TaskCb<Traits>);

impl<Traits: PortThreading> Clone for TaskRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for TaskRef<Traits> {}

impl<Traits: PortThreading> PartialEq for TaskRef<Traits> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}
impl<Traits: PortThreading> Eq for TaskRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for TaskRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&(self.0 as *const _)).finish()
    }
}

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// Not activated. Tasks enter and leave the system in this state.
    Suspended,
    /// Queued in the scheduler, not in control of the core.
    Ready,
    /// In control of the core. Exactly one task per core is Running.
    Running,
    /// An extended task blocked in `WaitEvent`, removed from the scheduler.
    Waiting,
}

impl Init for TaskSt {
    const INIT: Self = Self::Suspended;
}

/// The stack binding of a task. Stack memory itself is managed by the port;
/// the kernel only needs the identity for configuration checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRef {
    pub id: usize,
    /// Shared stacks forbid preemption-sensitive features (round robin).
    pub shared: bool,
}

/// The static properties of a task.
pub struct TaskAttr {
    /// The entry point of the task.
    pub entry_point: fn(),

    /// The home (base) priority.
    pub home_priority: Priority,

    /// The priority the task runs at while it's in control (internal
    /// resource). Equal to `home_priority` for fully preemptable tasks.
    pub running_priority: Priority,

    /// The multiple-activation bound (≥ 1).
    pub max_activations: u32,

    /// `true` for extended tasks (may wait for events).
    pub extended: bool,

    /// Round-robin time slices, or `None` if the task's priority level uses
    /// plain FIFO scheduling.
    pub time_slices: Option<u32>,

    /// Application modes in which the task is auto-started.
    pub autostart_modes: AppModeMask,

    /// The core the task is pinned to.
    pub core: CoreId,

    /// The owning OS-Application.
    pub app: AppId,

    /// The applications allowed to address this task.
    pub access: AppAccessMask,

    pub stack: StackRef,

    /// The timing-protection descriptor, if the task is monitored.
    pub tp: Option<&'static tp::TpTaskAttr>,
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: PortThreading> {
    /// The port-specific context save area.
    ///
    /// This is guaranteed to be placed at the beginning of the struct so
    /// that assembler code can refer to it easily.
    pub port_task_state: Traits::PortTaskState,

    /// The static properties of the task.
    pub attr: &'static TaskAttr,

    pub(crate) st: klock::CpuLockCell<Traits, TaskSt>,

    /// The priority level the task is queued at. May be raised above
    /// `attr.home_priority` by the ceiling protocol or the running priority.
    pub(crate) current_priority: klock::CpuLockCell<Traits, Priority>,

    /// The number of pending activations (`0..=attr.max_activations`).
    pub(crate) activation_count: klock::CpuLockCell<Traits, u32>,

    /// Events set for this task.
    pub(crate) pending_events: klock::CpuLockCell<Traits, EventMask>,

    /// Events the task is blocked on (nonzero only in the Waiting state).
    pub(crate) waited_events: klock::CpuLockCell<Traits, EventMask>,

    /// Remaining round-robin time slices.
    pub(crate) rr_slices_left: klock::CpuLockCell<Traits, u32>,

    /// The most recently taken resource; heads the LIFO of held resources.
    pub(crate) last_resource_held:
        klock::CpuLockCell<Traits, Option<&'static resource::ResourceCb<Traits>>>,

    /// Timing-protection state of this task.
    pub(crate) tp: tp::TpThreadState<Traits>,
}

impl<Traits: PortThreading> TaskCb<Traits> {
    pub const fn new(attr: &'static TaskAttr) -> Self {
        Self {
            port_task_state: Init::INIT,
            attr,
            st: klock::CpuLockCell::new(TaskSt::Suspended),
            current_priority: klock::CpuLockCell::new(attr.home_priority),
            activation_count: klock::CpuLockCell::new(0),
            pending_events: klock::CpuLockCell::new(0),
            waited_events: klock::CpuLockCell::new(0),
            rr_slices_left: klock::CpuLockCell::new(0),
            last_resource_held: klock::CpuLockCell::new(None),
            tp: tp::TpThreadState::new(),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("current_priority", &self.current_priority)
            .field("activation_count", &self.activation_count)
            .field("pending_events", &self.pending_events)
            .field("waited_events", &self.waited_events)
            .field(
                "last_resource_held",
                &self
                    .last_resource_held
                    .debug_fmt_with(|x, f| x.map(|x| x as *const _).fmt(f)),
            )
            .finish_non_exhaustive()
    }
}

/// Compute a task's dense id from its control block address.
pub(crate) fn task_id<Traits: KernelTraits>(task: TaskRef<Traits>) -> TaskId {
    let pool = Traits::task_cb_pool();
    let offset_bytes = task.0 as *const TaskCb<_> as usize - pool.as_ptr() as usize;
    offset_bytes / core::mem::size_of::<TaskCb<Traits>>()
}

/// Get the [`TaskCb`] for the specified id.
#[inline]
pub(crate) fn task_cb<Traits: KernelTraits>(
    id: TaskId,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    Traits::get_task_cb(id).ok_or(BadIdError::Id)
}

// Service implementations
// ---------------------------------------------------------------------------

/// Implements `ActivateTask`.
pub(crate) fn activate_task<Traits: KernelTraits>(id: TaskId) -> Result<(), ActivateTaskError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task_cb = task_cb::<Traits>(id)?;

    app::check_access::<Traits>(lock.borrow_mut(), task_cb.attr.access)?;
    app::check_app_accessible::<Traits>(lock.borrow_mut(), task_cb.attr.app, id)
        .map_err(|_| NoAccessError::Access)?;

    if task_cb.attr.core != Traits::core_id() {
        // Queue the request to the owning core. The activation itself (and
        // any `Limit` condition) is observed there.
        xsig::send::<Traits>(
            lock.borrow_mut(),
            task_cb.attr.core,
            xsig::XSigRequest::ActivateTask(id),
        )?;
        return Ok(());
    }

    activate_local(lock.borrow_mut(), TaskRef(task_cb))?;
    task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// The core portion of task activation: bump the activation count and queue
/// a new instance. Does not dispatch.
pub(crate) fn activate_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) -> Result<(), ActivateTaskError> {
    let task_cb = task.0;

    let count = task_cb.activation_count.get(&*lock);
    if count >= task_cb.attr.max_activations {
        return Err(ActivateTaskError::Limit);
    }

    // Minimum inter-arrival time enforcement: a premature activation is
    // dropped after the protection hook has had its say
    if !tp::task_arrival_check(lock.borrow_mut(), task) {
        return Ok(());
    }

    task_cb.activation_count.replace(&mut *lock, count + 1);

    if count == 0 {
        // SUSPENDED → READY
        debug_assert_eq!(task_cb.st.get(&*lock), TaskSt::Suspended);
        make_ready(lock, task);
    }
    // Otherwise the task is already Ready or Running; the new instance is
    // queued behind the existing ones at the home priority
    else {
        let sched_cb = &Traits::core_cb_pool()[task_cb.attr.core].sched;
        enqueue_extra_instance(lock, sched_cb, task);
    }

    Ok(())
}

/// Transition a Suspended (or freshly re-activated) task into Ready and
/// insert it into its core's scheduler.
pub(crate) fn make_ready<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let task_cb = task.0;

    // Safety: CPU Lock active, the task is not running
    unsafe { Traits::initialize_task_state(task_cb) };

    task_cb.st.replace(&mut *lock, TaskSt::Ready);
    task_cb
        .current_priority
        .replace(&mut *lock, task_cb.attr.home_priority);
    task_cb.pending_events.replace(&mut *lock, 0);
    task_cb.waited_events.replace(&mut *lock, 0);
    task_cb
        .rr_slices_left
        .replace(&mut *lock, task_cb.attr.time_slices.unwrap_or(0));

    // A fresh activation starts with a fresh execution budget
    tp::reset_budgets(lock.borrow_mut(), task);

    let sched_cb = &Traits::core_cb_pool()[task_cb.attr.core].sched;
    sched::insert(lock, sched_cb, task);
}

/// Queue one more activation instance of a task that is already Ready or
/// Running. The instance lands at the home priority, behind its peers.
fn enqueue_extra_instance<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    sched_cb: &'static sched::SchedulerCb<Traits>,
    task: TaskRef<Traits>,
) {
    let prio = task.0.attr.home_priority;
    sched_cb.queues[prio].write(&mut *lock).push_back(task);
    sched_cb.bit_array.write(&mut *lock).set(prio);
    sched::update_next(lock, sched_cb);
}

/// Relinquish CPU Lock. After that, if the scheduler has elected a different
/// next task, call `yield_cpu`.
///
/// Services that transition a task into the Ready state call this before
/// returning to the caller.
pub(crate) fn task_unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let sched_cb = &Traits::local_core_cb().sched;
    let needed = sched::switch_required(lock.borrow_mut(), sched_cb)
        && Traits::is_task_context();

    // Relinquish CPU Lock
    drop(lock);

    if needed {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Implements `TerminateTask`.
pub(crate) fn terminate_task<Traits: KernelTraits>() -> Result<(), TerminateTaskError> {
    thread::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    precheck_termination::<Traits>(lock.borrow_mut())?;

    let sched_cb = &Traits::local_core_cb().sched;
    let task = sched_cb.current_task.get(&*lock.borrow_mut());
    remove_current_activation(lock.borrow_mut(), task);

    // Safety: CPU Lock active; the task will never resume, which the caller
    // of `TerminateTask` has accepted by calling it
    unsafe { Traits::exit_and_dispatch(task.0) }
}

/// Implements `ChainTask`.
pub(crate) fn chain_task<Traits: KernelTraits>(id: TaskId) -> Result<(), ChainTaskError> {
    thread::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;
    let next_cb = task_cb::<Traits>(id)?;

    app::check_access::<Traits>(lock.borrow_mut(), next_cb.attr.access)?;
    precheck_termination::<Traits>(lock.borrow_mut())?;

    let sched_cb = &Traits::local_core_cb().sched;
    let task = sched_cb.current_task.get(&*lock.borrow_mut());
    let next = TaskRef(next_cb);

    if next == task {
        // Self-chaining reuses the activation that is being retired, so it
        // can never exhaust the activation limit.
        remove_current_activation_keep_count(lock.borrow_mut(), task);
    } else if next_cb.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            next_cb.attr.core,
            xsig::XSigRequest::ActivateTask(id),
        )?;
        remove_current_activation(lock.borrow_mut(), task);
    } else {
        // The activation must be checked before the caller's own activation
        // is retired, so that `Limit` leaves the caller running
        activate_local(lock.borrow_mut(), next)?;
        remove_current_activation(lock.borrow_mut(), task);
    }

    // Safety: CPU Lock active; see `terminate_task`
    unsafe { Traits::exit_and_dispatch(task.0) }
}

/// The error conditions shared by `TerminateTask` and `ChainTask`: the
/// caller must hold no resources, hold no spinlocks, and must not have
/// interrupts disabled.
fn precheck_termination<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), TerminateTaskError> {
    let core = Traits::local_core_cb();
    let task = core.sched.current_task.get(&*lock.borrow_mut());

    if task.0.last_resource_held.get(&*lock.borrow_mut()).is_some() {
        return Err(TerminateTaskError::Resource);
    }
    if spinlock::task_holds_any::<Traits>(lock.borrow_mut(), task) {
        return Err(TerminateTaskError::Spinlock);
    }
    if isr::interrupts_suspended::<Traits>() {
        return Err(TerminateTaskError::DisabledInt);
    }
    Ok(())
}

/// Retire the current activation instance: pop it from the scheduler and
/// transition the task to Suspended, or back to Ready if more activations
/// are pending.
fn remove_current_activation<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let count = task.0.activation_count.get(&*lock) - 1;
    task.0.activation_count.replace(&mut *lock, count);
    retire_current_instance(lock.borrow_mut(), task);

    if count > 0 {
        // The next instance is already queued at the home priority
        task.0.st.replace(&mut *lock, TaskSt::Ready);
        // Safety: CPU Lock active, the task is no longer running
        unsafe { Traits::initialize_task_state(task.0) };
        task.0.pending_events.replace(&mut *lock, 0);
        task.0
            .rr_slices_left
            .replace(&mut *lock, task.0.attr.time_slices.unwrap_or(0));
        tp::reset_budgets(lock.borrow_mut(), task);
    } else {
        task.0.st.replace(&mut *lock, TaskSt::Suspended);
    }
}

/// `remove_current_activation` for self-chaining: the count is unchanged and
/// the task is re-queued immediately.
fn remove_current_activation_keep_count<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    retire_current_instance(lock.borrow_mut(), task);

    task.0.st.replace(&mut *lock, TaskSt::Ready);
    // Safety: CPU Lock active, the task is no longer running
    unsafe { Traits::initialize_task_state(task.0) };
    task.0.pending_events.replace(&mut *lock, 0);
    task.0
        .rr_slices_left
        .replace(&mut *lock, task.0.attr.time_slices.unwrap_or(0));
    tp::reset_budgets(lock.borrow_mut(), task);

    let sched_cb = &Traits::local_core_cb().sched;
    sched::insert(lock, sched_cb, task);
}

/// Pop the current activation instance from the scheduler and reset the
/// task's priority to home.
fn retire_current_instance<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let sched_cb = &Traits::local_core_cb().sched;
    debug_assert_eq!(sched_cb.current_task.get(&*lock), task);

    // Any remaining elevation is the internal resource (all user resources
    // were released, or the termination would have been refused). Give it
    // back so the instance is retired from the home queue, where it's still
    // the head. A pending round-robin rotation is moot for a terminating
    // task.
    let home = task.0.attr.home_priority;
    if sched_cb.current_priority.get(&*lock) != home {
        sched_cb.rr_pending.replace(&mut *lock, false);
        sched::ceiling_release(lock.borrow_mut(), sched_cb, home);
    }

    sched::remove_current_head(lock.borrow_mut(), sched_cb);
    task.0
        .current_priority
        .replace(&mut *lock, task.0.attr.home_priority);
}

/// Implements `Schedule`.
///
/// Yields the processor to tasks whose home priority is higher than the
/// caller's, by temporarily releasing the internal resource (running
/// priority). The running priority is re-taken when the caller is dispatched
/// again.
pub(crate) fn schedule_api<Traits: KernelTraits>() -> Result<(), ScheduleError> {
    thread::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let sched_cb = &Traits::local_core_cb().sched;
    let task = sched_cb.current_task.get(&*lock.borrow_mut());

    if task.0.last_resource_held.get(&*lock.borrow_mut()).is_some() {
        return Err(ScheduleError::Resource);
    }
    if spinlock::task_holds_any::<Traits>(lock.borrow_mut(), task) {
        return Err(ScheduleError::Spinlock);
    }

    let home = task.0.attr.home_priority;
    if task.0.current_priority.get(&*lock.borrow_mut()) != home {
        sched::ceiling_release(lock.borrow_mut(), sched_cb, home);
    }

    task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Implements `GetTaskID`.
pub(crate) fn get_task_id<Traits: KernelTraits>() -> TaskId {
    if !Traits::is_task_context() {
        return INVALID_TASK;
    }
    let Ok(lock) = klock::lock_cpu::<Traits>() else {
        return INVALID_TASK;
    };
    let task = Traits::local_core_cb().sched.current_task.get(&*lock);
    task_id::<Traits>(task)
}

/// Implements `GetTaskState`.
pub(crate) fn get_task_state<Traits: KernelTraits>(
    id: TaskId,
) -> Result<TaskSt, GetTaskStateError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task_cb = task_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), task_cb.attr.access)?;
    Ok(task_cb.st.get(&*lock.borrow_mut()))
}

// Forcible termination
// ---------------------------------------------------------------------------

/// Forcibly terminate a task (`TerminateApplication`, protection violation
/// handling). Every lock held by the task is force-released and reported;
/// all pending activations are dropped; event state is reset. The
/// inter-arrival state of timing protection is preserved.
///
/// This doesn't dispatch. If the killed task is the current task of the
/// calling core, the caller must not return into it.
pub(crate) fn kill_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: TaskRef<Traits>,
) {
    let task_cb = task.0;

    if task_cb.st.get(&*lock) == TaskSt::Suspended {
        return;
    }

    // Force-release locks; each leak is reported to the error hook once
    if task_cb.last_resource_held.get(&*lock).is_some() {
        hook::call_error_hook::<Traits>(
            lock.borrow_mut(),
            ServiceId::TerminateTask,
            ErrorCode::Resource,
        );
        resource::force_release_all(lock.borrow_mut(), task);
    }
    if spinlock::task_holds_any::<Traits>(lock.borrow_mut(), task) {
        hook::call_error_hook::<Traits>(
            lock.borrow_mut(),
            ServiceId::TerminateTask,
            ErrorCode::Spinlock,
        );
        spinlock::force_release_all(lock.borrow_mut(), task);
    }

    // The interrupt-disable nesting belongs to the running thread; only a
    // task killed in flight can have left it raised
    if Traits::local_core_cb().sched.current_task.get(&*lock) == task {
        isr::force_restore_interrupts::<Traits>(lock.borrow_mut());
    }

    let sched_cb = &Traits::core_cb_pool()[task_cb.attr.core].sched;
    sched::remove_task_everywhere(lock.borrow_mut(), sched_cb, task);

    task_cb.st.replace(&mut *lock, TaskSt::Suspended);
    task_cb.activation_count.replace(&mut *lock, 0);
    task_cb.pending_events.replace(&mut *lock, 0);
    task_cb.waited_events.replace(&mut *lock, 0);
    task_cb
        .current_priority
        .replace(&mut *lock, task_cb.attr.home_priority);

    tp::reset_budgets(lock, task);
}

/// Initialize a task at boot time, activating it if it's auto-started in
/// the given application mode.
pub(crate) fn init_task<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task_cb: &'static TaskCb<Traits>,
    mode: crate::AppMode,
) {
    if task_cb.attr.core != Traits::core_id() {
        return;
    }
    if task_cb.attr.autostart_modes & (1 << mode) != 0 {
        let _ = activate_local(lock.borrow_mut(), TaskRef(task_cb));
    }
}
