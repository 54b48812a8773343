//! The scheduler
//!
//! Fixed-priority preemptive scheduling: the ready set is a bit array with
//! one bit per internal priority, plus one bounded deque per priority holding
//! the task activation instances in FIFO order. The bit array yields the
//! highest ready priority in constant time; the head of the corresponding
//! deque is the *next task*. The *current task* is the one in control of the
//! core; it stays in its deque for the whole time it's Running, so the next
//! task is always observable by peeking.
//!
//! Two references are kept up to date at all times: `(current_task,
//! current_priority)` and `(next_task, next_priority)`. A context switch is
//! required exactly when they differ; the switch itself is committed by
//! [`commit_next_task`] at the next safe point.
//!
//! Round robin is layered on top: a dedicated alarm delivers time-slice
//! events; when the current task exhausts its slices, the head of its deque
//! is rotated to the tail. If the task is currently running above its home
//! priority, the rotation is deferred until the next priority-lowering
//! point.
use crate::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    prio_is_higher, prio_is_higher_or_equal,
    task::{TaskRef, TaskSt},
    thread::ThreadRef,
    tp,
    utils::{DequeLike, Init, PrioBitmap},
    KernelTraits, Priority,
};

/// *Scheduler control block* - the per-core scheduler state.
///
/// Constructed by the configuration generator. `queues` has one entry per
/// internal priority level; the idle task of the core is queued at the
/// logically lowest level before the first dispatch and never terminates.
pub struct SchedulerCb<Traits: KernelTraits> {
    /// The ready set. Invariant: bit `p` is set iff `queues[p]` is nonempty.
    pub bit_array: CpuLockCell<Traits, Traits::ReadyBitmap>,

    /// One task queue per priority.
    pub queues: &'static [CpuLockCell<Traits, Traits::ReadyDeque>],

    /// The task currently in control of this core.
    pub current_task: CpuLockCell<Traits, TaskRef<Traits>>,

    /// The priority level `current_task` is queued at.
    pub current_priority: CpuLockCell<Traits, Priority>,

    /// The task that will become current at the next switch point.
    pub next_task: CpuLockCell<Traits, TaskRef<Traits>>,

    /// The priority level `next_task` is queued at.
    pub next_priority: CpuLockCell<Traits, Priority>,

    /// The idle task of this core.
    pub idle_task: TaskRef<Traits>,

    /// A round-robin rotation is due but was deferred because the current
    /// task was running above its home priority.
    pub(crate) rr_pending: CpuLockCell<Traits, bool>,
}

impl<Traits: KernelTraits> SchedulerCb<Traits> {
    pub const fn new(
        queues: &'static [CpuLockCell<Traits, Traits::ReadyDeque>],
        idle_task: TaskRef<Traits>,
    ) -> Self {
        Self {
            bit_array: CpuLockCell::new(<Traits::ReadyBitmap as Init>::INIT),
            queues,
            current_task: CpuLockCell::new(idle_task),
            current_priority: CpuLockCell::new(0),
            next_task: CpuLockCell::new(idle_task),
            next_priority: CpuLockCell::new(0),
            idle_task,
            rr_pending: CpuLockCell::new(false),
        }
    }
}

/// Initialize the scheduler at core boot. After this call the scheduler
/// contains exactly the idle task; the other scheduler operations assume
/// there is always a valid task.
pub(crate) fn init<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    let idle = sched.idle_task;
    let prio = idle.0.attr.home_priority;

    idle.0.st.replace(&mut *lock, TaskSt::Running);
    idle.0.current_priority.replace(&mut *lock, prio);

    sched.queues[prio].write(&mut *lock).push_back(idle);
    sched.bit_array.write(&mut *lock).set(prio);

    sched.current_task.replace(&mut *lock, idle);
    sched.current_priority.replace(&mut *lock, prio);

    update_next(lock, sched);
}

/// Recompute `(next_task, next_priority)` from the ready set.
pub(crate) fn update_next<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    // The idle task is always ready, so the ready set is never empty
    let top = sched
        .bit_array
        .read(&*lock)
        .find_highest()
        .expect("ready set is empty");
    let head = sched.queues[top]
        .read(&*lock)
        .peek_front()
        .expect("ready bit set for an empty queue");
    sched.next_task.replace(&mut *lock, head);
    sched.next_priority.replace(&mut *lock, top);
}

/// Add the given task into scheduling at its current priority. Updates the
/// next-task reference if the task preempts it. The current task is not
/// modified.
pub(crate) fn insert<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
    task: TaskRef<Traits>,
) {
    let prio = task.0.current_priority.get(&*lock);

    sched.queues[prio].write(&mut *lock).push_back(task);
    sched.bit_array.write(&mut *lock).set(prio);

    // A strictly higher priority implies the queue was empty before, so the
    // inserted task is its head
    if prio_is_higher(prio, sched.next_priority.get(&*lock)) {
        sched.next_task.replace(&mut *lock, task);
        sched.next_priority.replace(&mut *lock, prio);
    }
}

/// Remove the current activation instance of the current task (task
/// termination). The caller transitions the task state afterwards.
pub(crate) fn remove_current_head<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    let prio = sched.current_priority.get(&*lock);
    let current = sched.current_task.get(&*lock);

    let queue = sched.queues[prio].write(&mut *lock);
    let popped = queue.pop_front();
    debug_assert_eq!(popped, Some(current));
    if queue.is_empty() {
        sched.bit_array.write(&mut *lock).clear(prio);
    }
    update_next(lock, sched);
}

/// Remove every queued instance of the given task from every priority level
/// (task kill).
pub(crate) fn remove_task_everywhere<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
    task: TaskRef<Traits>,
) {
    for prio in 0..sched.queues.len() {
        let queue = sched.queues[prio].write(&mut *lock);
        if queue.remove_all(task) != 0 && queue.is_empty() {
            sched.bit_array.write(&mut *lock).clear(prio);
        }
    }
    update_next(lock, sched);
}

/// Remove the current task from scheduling entirely (transition to Waiting).
/// The task must be running at its home priority.
pub(crate) fn remove_current_for_wait<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    let prio = sched.current_priority.get(&*lock);
    let task = sched.current_task.get(&*lock);
    debug_assert_eq!(prio, task.0.attr.home_priority);

    let queue = sched.queues[prio].write(&mut *lock);
    queue.remove_all(task);
    if queue.is_empty() {
        sched.bit_array.write(&mut *lock).clear(prio);
    }
    update_next(lock, sched);
}

/// Raise the current task to the given ceiling priority. The push-front
/// guarantees the current task remains head at its elevated level even if
/// other tasks are already queued there.
pub(crate) fn ceiling_raise<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
    ceiling: Priority,
) {
    let task = sched.current_task.get(&*lock);
    debug_assert!(prio_is_higher_or_equal(
        ceiling,
        sched.current_priority.get(&*lock)
    ));

    sched.queues[ceiling].write(&mut *lock).push_front(task);
    sched.bit_array.write(&mut *lock).set(ceiling);
    sched.current_priority.replace(&mut *lock, ceiling);
    task.0.current_priority.replace(&mut *lock, ceiling);

    update_next(lock, sched);
}

/// Lower the current task from a ceiling priority back to `new_prio` (the
/// next-held ceiling or the home priority).
pub(crate) fn ceiling_release<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
    new_prio: Priority,
) {
    let prio = sched.current_priority.get(&*lock);
    let task = sched.current_task.get(&*lock);

    let queue = sched.queues[prio].write(&mut *lock);
    if queue.peek_front() == Some(task) {
        queue.pop_front();
        if queue.is_empty() {
            sched.bit_array.write(&mut *lock).clear(prio);
        }
    }

    sched.current_priority.replace(&mut *lock, new_prio);
    task.0.current_priority.replace(&mut *lock, new_prio);

    // A round-robin rotation may have been deferred while the task was
    // running elevated
    rob_round(lock.borrow_mut(), sched);

    update_next(lock, sched);
}

/// Rotate the queue at the current priority: the head becomes the tail, the
/// relative order of the other entries is unchanged.
fn rotate_current_queue<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    let prio = sched.current_priority.get(&*lock);
    let queue = sched.queues[prio].write(&mut *lock);
    if queue.len() < 2 {
        return;
    }
    let head = queue.pop_front().unwrap();
    queue.push_back(head);
    update_next(lock, sched);
}

/// Count a round-robin time-slice event for the current task. Delivered by
/// the dedicated round-robin alarm of this core.
pub(crate) fn rr_event<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    let task = sched.current_task.get(&*lock);
    let Some(slices) = task.0.attr.time_slices else {
        return;
    };

    let left = task.0.rr_slices_left.get(&*lock).saturating_sub(1);
    if left > 0 {
        task.0.rr_slices_left.replace(&mut *lock, left);
        return;
    }
    task.0.rr_slices_left.replace(&mut *lock, slices);

    if sched.current_priority.get(&*lock) == task.0.attr.home_priority {
        rotate_current_queue(lock, sched);
    } else {
        // Not preemptable right now; replay at the next priority-lowering
        // point
        sched.rr_pending.replace(&mut *lock, true);
    }
}

/// Perform a deferred round-robin rotation, if one is pending.
pub(crate) fn rob_round<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) {
    if sched.rr_pending.replace(&mut *lock, false) {
        rotate_current_queue(lock, sched);
    }
}

/// Return whether a context switch is required.
pub(crate) fn switch_required<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    sched: &'static SchedulerCb<Traits>,
) -> bool {
    sched.next_task.get(&*lock) != sched.current_task.get(&*lock)
}

/// Commit the pending scheduling decision of the calling core: transition
/// the previous current task out of the Running state, make the next task
/// current, and notify the timing-protection engine and the task hooks.
///
/// Called by the port's dispatcher (with CPU Lock active) after the kernel
/// requested a switch with `yield_cpu`.
pub(crate) fn commit_next_task<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let core = Traits::local_core_cb();
    let sched = &core.sched;

    let prev = sched.current_task.get(&*lock);
    let next = sched.next_task.get(&*lock);

    if prev != next {
        if let Some(post_task) = Traits::HOOKS.post_task {
            post_task(crate::task::task_id::<Traits>(prev));
        }

        match prev.0.st.get(&*lock) {
            // Preempted; stays in its deque
            TaskSt::Running => {
                prev.0.st.replace(&mut *lock, TaskSt::Ready);
            }
            // Waiting or terminated; already removed from scheduling
            TaskSt::Waiting | TaskSt::Suspended | TaskSt::Ready => {}
        }

        debug_assert_eq!(next.0.st.get(&*lock), TaskSt::Ready);
        next.0.st.replace(&mut *lock, TaskSt::Running);

        sched.current_task.replace(&mut *lock, next);
        let next_priority = sched.next_priority.get(&*lock);
        sched.current_priority.replace(&mut *lock, next_priority);

        core.current_thread
            .replace(&mut *lock, ThreadRef::Task(next));

        tp::thread_switch(lock.borrow_mut(), ThreadRef::Task(prev), ThreadRef::Task(next));

        if let Some(pre_task) = Traits::HOOKS.pre_task {
            pre_task(crate::task::task_id::<Traits>(next));
        }
    }

    // Take the internal-resource (running) priority when entering the task
    let current = sched.current_task.get(&*lock);
    let running_prio = current.0.attr.running_priority;
    if current.0.last_resource_held.get(&*lock).is_none()
        && prio_is_higher(running_prio, current.0.current_priority.get(&*lock))
    {
        ceiling_raise(lock.borrow_mut(), sched, running_prio);
    }
}
