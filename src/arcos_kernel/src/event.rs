//! OSEK events
//!
//! Events exist per extended task: a pending mask and, while the task is
//! Waiting, the mask it's blocked on. Setting an event that intersects the
//! waited mask makes the task Ready again.
use crate::{
    app, error::*, klock, sched, spinlock, task, thread, xsig, EventMask, KernelTraits, TaskId,
    TaskSt,
};

/// Implements `SetEvent`.
pub(crate) fn set_event<Traits: KernelTraits>(
    id: TaskId,
    mask: EventMask,
) -> Result<(), SetEventError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task_cb = task::task_cb::<Traits>(id)?;

    app::check_access::<Traits>(lock.borrow_mut(), task_cb.attr.access)?;

    if !task_cb.attr.extended {
        return Err(SetEventError::Access);
    }

    if task_cb.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            task_cb.attr.core,
            xsig::XSigRequest::SetEvent(id, mask),
        )?;
        return Ok(());
    }

    set_event_local(lock.borrow_mut(), task::TaskRef(task_cb), mask)?;
    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// The core portion of `SetEvent`. Does not dispatch.
pub(crate) fn set_event_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: task::TaskRef<Traits>,
    mask: EventMask,
) -> Result<(), BadStateError> {
    let task_cb = task.0;

    if task_cb.st.get(&*lock) == TaskSt::Suspended {
        return Err(BadStateError::State);
    }

    let pending = task_cb.pending_events.get(&*lock) | mask;
    task_cb.pending_events.replace(&mut *lock, pending);

    if task_cb.st.get(&*lock) == TaskSt::Waiting
        && pending & task_cb.waited_events.get(&*lock) != 0
    {
        task_cb.waited_events.replace(&mut *lock, 0);
        task_cb.st.replace(&mut *lock, TaskSt::Ready);

        debug_assert_eq!(
            task_cb.current_priority.get(&*lock),
            task_cb.attr.home_priority
        );
        let sched_cb = &Traits::core_cb_pool()[task_cb.attr.core].sched;
        sched::insert(lock, sched_cb, task);
    }

    Ok(())
}

/// Implements `ClearEvent`.
pub(crate) fn clear_event<Traits: KernelTraits>(mask: EventMask) -> Result<(), ClearEventError> {
    thread::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let task = Traits::local_core_cb().sched.current_task.get(&*lock.borrow_mut());
    if !task.0.attr.extended {
        return Err(ClearEventError::Access);
    }

    let pending = task.0.pending_events.get(&*lock.borrow_mut()) & !mask;
    task.0.pending_events.replace(&mut *lock.borrow_mut(), pending);
    Ok(())
}

/// Implements `GetEvent`.
pub(crate) fn get_event<Traits: KernelTraits>(id: TaskId) -> Result<EventMask, GetEventError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let task_cb = task::task_cb::<Traits>(id)?;

    app::check_access::<Traits>(lock.borrow_mut(), task_cb.attr.access)?;

    if !task_cb.attr.extended {
        return Err(GetEventError::Access);
    }
    if task_cb.st.get(&*lock.borrow_mut()) == TaskSt::Suspended {
        return Err(GetEventError::State);
    }

    Ok(task_cb.pending_events.get(&*lock.borrow_mut()))
}

/// Implements `WaitEvent`.
pub(crate) fn wait_event<Traits: KernelTraits>(mask: EventMask) -> Result<(), WaitEventError> {
    thread::expect_task_context::<Traits>()?;
    let mut lock = klock::lock_cpu::<Traits>()?;

    let sched_cb = &Traits::local_core_cb().sched;
    let task = sched_cb.current_task.get(&*lock.borrow_mut());

    if !task.0.attr.extended {
        return Err(WaitEventError::Access);
    }
    if task.0.last_resource_held.get(&*lock.borrow_mut()).is_some() {
        return Err(WaitEventError::Resource);
    }
    if spinlock::task_holds_any::<Traits>(lock.borrow_mut(), task) {
        return Err(WaitEventError::Spinlock);
    }

    // Any remaining elevation is the internal resource; it's released for
    // the duration of the wait
    let home = task.0.attr.home_priority;
    if task.0.current_priority.get(&*lock.borrow_mut()) != home {
        sched::ceiling_release(lock.borrow_mut(), sched_cb, home);
    }

    if task.0.pending_events.get(&*lock.borrow_mut()) & mask != 0 {
        // The wait condition is already satisfied
        task::task_unlock_cpu_and_check_preemption(lock);
        return Ok(());
    }

    task.0.waited_events.replace(&mut *lock.borrow_mut(), mask);
    task.0.st.replace(&mut *lock.borrow_mut(), TaskSt::Waiting);
    sched::remove_current_for_wait(lock.borrow_mut(), sched_cb);

    // Give up the processor. The port returns here once the task is made
    // Ready by `SetEvent` and dispatched again.
    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}
