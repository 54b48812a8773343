//! OSEK resources
//!
//! The synchronous priority-ceiling protocol: taking a resource immediately
//! raises the caller to the resource's ceiling priority, so no task that
//! could ever contend for the resource can be dispatched while it's held.
//! There is no blocking and no wait queue. Held resources form a strict LIFO
//! per thread.
use core::fmt;

use crate::{
    app, error::*, klock, prio_is_higher, sched, task, thread, tp, AppAccessMask, AppId, CoreId,
    KernelTraits, PortThreading, Priority, ResourceId, ThreadRef,
};

/// The static properties of a resource.
pub struct ResourceAttr {
    /// The ceiling: the logically highest home priority among all users,
    /// computed by the generator.
    pub ceiling: Priority,

    pub core: CoreId,
    pub app: AppId,
    pub access: AppAccessMask,
}

/// *Resource control block* - the state data of a resource.
pub struct ResourceCb<Traits: PortThreading> {
    pub attr: &'static ResourceAttr,

    /// The thread currently holding the resource.
    pub(crate) holder: klock::CpuLockCell<Traits, Option<ThreadRef<Traits>>>,

    /// The priority the holder ran at before taking this resource.
    pub(crate) prior_priority: klock::CpuLockCell<Traits, Priority>,

    /// The next element in the holder's LIFO of held resources.
    pub(crate) prev_held: klock::CpuLockCell<Traits, Option<&'static ResourceCb<Traits>>>,
}

impl<Traits: PortThreading> ResourceCb<Traits> {
    pub const fn new(attr: &'static ResourceAttr) -> Self {
        Self {
            attr,
            holder: klock::CpuLockCell::new(None),
            prior_priority: klock::CpuLockCell::new(0),
            prev_held: klock::CpuLockCell::new(None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for ResourceCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResourceCb")
            .field("self", &(self as *const _))
            .field("ceiling", &self.attr.ceiling)
            .field("holder", &self.holder)
            .field("prior_priority", &self.prior_priority)
            .finish()
    }
}

#[inline]
pub(crate) fn resource_cb<Traits: KernelTraits>(
    id: ResourceId,
) -> Result<&'static ResourceCb<Traits>, BadIdError> {
    Traits::get_resource_cb(id).ok_or(BadIdError::Id)
}

/// Compute a resource's dense id from its control block address.
pub(crate) fn resource_id<Traits: KernelTraits>(cb: &'static ResourceCb<Traits>) -> ResourceId {
    let pool = Traits::resource_cb_pool();
    let offset_bytes = cb as *const ResourceCb<_> as usize - pool.as_ptr() as usize;
    offset_bytes / core::mem::size_of::<ResourceCb<Traits>>()
}

/// The held-resource list head of the given thread. Hooks can't take
/// resources.
fn held_list<Traits: KernelTraits>(
    thread: &ThreadRef<Traits>,
) -> Option<&'static klock::CpuLockCell<Traits, Option<&'static ResourceCb<Traits>>>> {
    match thread {
        ThreadRef::Task(task) => Some(&task.0.last_resource_held),
        ThreadRef::Isr(isr_cb) => Some(&isr_cb.last_resource_held),
        ThreadRef::Hook(_) => None,
    }
}

/// Implements `GetResource`.
pub(crate) fn get_resource<Traits: KernelTraits>(
    id: ResourceId,
) -> Result<(), GetResourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let resource = resource_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), resource.attr.access)?;

    let current = thread::current_thread(lock.borrow_mut());
    let Some(list_head) = held_list(&current) else {
        return Err(GetResourceError::CallLevel);
    };

    if resource.holder.get(&*lock.borrow_mut()).is_some() {
        // With correctly generated ceilings, a held resource can never be
        // requested again on this core; treat it as a configuration breach
        return Err(GetResourceError::Access);
    }

    let sched_cb = &Traits::local_core_cb().sched;
    let ceiling = resource.attr.ceiling;

    let prior = match current {
        ThreadRef::Task(_) => {
            let prior = sched_cb.current_priority.get(&*lock.borrow_mut());
            if prio_is_higher(prior, ceiling) {
                // The caller runs above the ceiling; it cannot be a
                // configured user of this resource
                return Err(GetResourceError::Access);
            }
            if prio_is_higher(ceiling, prior) {
                sched::ceiling_raise(lock.borrow_mut(), sched_cb, ceiling);
            }
            prior
        }
        // Interrupt-level ceilings are enforced by the interrupt
        // controller configuration; the kernel only tracks ownership
        ThreadRef::Isr(_) => 0,
        ThreadRef::Hook(_) => unreachable!(),
    };

    resource.holder.replace(&mut *lock.borrow_mut(), Some(current));
    resource.prior_priority.replace(&mut *lock.borrow_mut(), prior);
    let prev = list_head.replace(&mut *lock.borrow_mut(), Some(resource));
    resource.prev_held.replace(&mut *lock.borrow_mut(), prev);

    tp::enter_resource_lock(lock.borrow_mut(), current, id);
    Ok(())
}

/// Implements `ReleaseResource`.
pub(crate) fn release_resource<Traits: KernelTraits>(
    id: ResourceId,
) -> Result<(), ReleaseResourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let resource = resource_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), resource.attr.access)?;

    let current = thread::current_thread(lock.borrow_mut());
    let Some(list_head) = held_list(&current) else {
        return Err(ReleaseResourceError::CallLevel);
    };

    // Strict LIFO: only the most recently taken resource may be released
    match list_head.get(&*lock.borrow_mut()) {
        Some(top) if core::ptr::eq(top, resource) => {}
        _ => return Err(ReleaseResourceError::NoFunc),
    }

    tp::leave_resource_lock(lock.borrow_mut(), current, id);

    let prev = resource.prev_held.replace(&mut *lock.borrow_mut(), None);
    list_head.replace(&mut *lock.borrow_mut(), prev);
    resource.holder.replace(&mut *lock.borrow_mut(), None);

    if let ThreadRef::Task(_) = current {
        let sched_cb = &Traits::local_core_cb().sched;
        let prior = resource.prior_priority.get(&*lock.borrow_mut());
        if sched_cb.current_priority.get(&*lock.borrow_mut()) != prior {
            sched::ceiling_release(lock.borrow_mut(), sched_cb, prior);
        } else {
            // No priority change; a deferred round-robin rotation may still
            // be pending
            sched::rob_round(lock.borrow_mut(), sched_cb);
        }
    }

    // Lowering the priority may expose a higher-priority ready task
    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Force-release every resource held by the given task (kill path). The
/// scheduler priority is reset by the caller; no user-visible error is
/// raised here.
pub(crate) fn force_release_all<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: task::TaskRef<Traits>,
) {
    let mut maybe_held = task.0.last_resource_held.replace(&mut *lock, None);
    while let Some(resource) = maybe_held {
        tp::leave_resource_lock(
            lock.borrow_mut(),
            ThreadRef::Task(task),
            resource_id::<Traits>(resource),
        );
        resource.holder.replace(&mut *lock, None);
        maybe_held = resource.prev_held.replace(&mut *lock, None);
    }
}

/// Force-release every resource held by the given ISR (epilogue leak
/// handling, kill path).
pub(crate) fn force_release_all_isr<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    isr_cb: &'static crate::isr::IsrCb<Traits>,
) {
    let mut maybe_held = isr_cb.last_resource_held.replace(&mut *lock, None);
    while let Some(resource) = maybe_held {
        tp::leave_resource_lock(
            lock.borrow_mut(),
            ThreadRef::Isr(isr_cb),
            resource_id::<Traits>(resource),
        );
        resource.holder.replace(&mut *lock, None);
        maybe_held = resource.prev_held.replace(&mut *lock, None);
    }
}
