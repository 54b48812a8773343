//! OS-Applications
//!
//! An OS-Application is a static grouping of kernel objects sharing access
//! rights and error/shutdown hooks. Descriptors carry an access mask (one
//! bit per application); every service validates the caller's application
//! against the mask of the addressed object. Trusted applications bypass the
//! mask.
use core::fmt;

use crate::{
    alarm, error::*, hook, isr, klock, schedule_table, spinlock, task, thread, xsig, AlarmId,
    AppAccessMask, AppId, CoreId, CounterId, IsrId, KernelTraits, PortThreading, ResourceId,
    ScheduleTableId, ServiceId, SpinlockId, TaskId, ThreadRef, INVALID_APP,
};

/// OS-Application lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Accessible,
    Restarting,
    Terminated,
}

/// The static properties of an OS-Application.
pub struct AppAttr {
    pub core: CoreId,
    pub trusted: bool,
    pub privileged: bool,

    /// The task activated when the application is terminated with restart.
    pub restart_task: Option<TaskId>,

    /// The objects belonging to this application.
    pub tasks: &'static [TaskId],
    pub isrs: &'static [IsrId],
    pub counters: &'static [CounterId],
    pub alarms: &'static [AlarmId],
    pub schedule_tables: &'static [ScheduleTableId],
    pub resources: &'static [ResourceId],

    pub startup_hook: Option<fn()>,
    pub shutdown_hook: Option<fn(ErrorCode)>,
    pub error_hook: Option<fn(ErrorCode)>,
}

/// *Application control block* - the state data of an OS-Application.
pub struct AppCb<Traits: PortThreading> {
    pub attr: &'static AppAttr,
    pub(crate) state: klock::CpuLockCell<Traits, AppState>,
}

impl<Traits: PortThreading> AppCb<Traits> {
    pub const fn new(attr: &'static AppAttr) -> Self {
        Self {
            attr,
            state: klock::CpuLockCell::new(AppState::Accessible),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for AppCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AppCb")
            .field("self", &(self as *const _))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Compute an application's dense id from its control block address.
pub(crate) fn app_id<Traits: KernelTraits>(app: &'static AppCb<Traits>) -> AppId {
    let pool = Traits::app_cb_pool();
    let offset_bytes = app as *const AppCb<_> as usize - pool.as_ptr() as usize;
    offset_bytes / core::mem::size_of::<AppCb<Traits>>()
}

#[inline]
pub(crate) fn app_cb<Traits: KernelTraits>(id: AppId) -> Result<&'static AppCb<Traits>, BadIdError> {
    Traits::get_app_cb(id).ok_or(BadIdError::Id)
}

/// Validate the caller's right to address an object with the given access
/// mask. Trusted applications and kernel (hook) contexts always pass.
pub(crate) fn check_access<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    access: AppAccessMask,
) -> Result<(), NoAccessError> {
    let Some(caller) = thread::current_app::<Traits>(lock) else {
        return Ok(());
    };
    if caller.attr.trusted {
        return Ok(());
    }
    if access & (1 << app_id::<Traits>(caller)) != 0 {
        Ok(())
    } else {
        Err(NoAccessError::Access)
    }
}

/// Reject operations on objects of terminated applications. During a
/// restart only the restart task is addressable.
pub(crate) fn check_app_accessible<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    owner: AppId,
    target_task: TaskId,
) -> Result<(), NoAccessError> {
    let Some(app) = Traits::get_app_cb(owner) else {
        return Ok(());
    };
    match app.state.get(&*lock) {
        AppState::Accessible => Ok(()),
        AppState::Restarting if app.attr.restart_task == Some(target_task) => Ok(()),
        _ => Err(NoAccessError::Access),
    }
}

// Services
// ---------------------------------------------------------------------------

/// Implements `GetApplicationID`.
pub(crate) fn get_application_id<Traits: KernelTraits>() -> AppId {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return INVALID_APP;
    };
    match thread::current_app::<Traits>(lock.borrow_mut()) {
        Some(app) => app_id::<Traits>(app),
        None => INVALID_APP,
    }
}

/// The kind of object addressed by `CheckObjectAccess` and
/// `CheckObjectOwnership`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Task,
    Isr,
    Counter,
    Alarm,
    ScheduleTable,
    Resource,
    Spinlock,
}

fn object_access_and_owner<Traits: KernelTraits>(
    object: ObjectType,
    id: usize,
) -> Result<(AppAccessMask, AppId), BadIdError> {
    Ok(match object {
        ObjectType::Task => {
            let cb = task::task_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::Isr => {
            let cb = isr::isr_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::Counter => {
            let cb = crate::counter::counter_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::Alarm => {
            let cb = alarm::alarm_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::ScheduleTable => {
            let cb = schedule_table::table_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::Resource => {
            let cb = crate::resource::resource_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
        ObjectType::Spinlock => {
            let cb = spinlock::spinlock_cb::<Traits>(id)?;
            (cb.attr.access, cb.attr.app)
        }
    })
}

/// Implements `CheckObjectAccess`.
pub(crate) fn check_object_access<Traits: KernelTraits>(
    app: AppId,
    object: ObjectType,
    id: usize,
) -> Result<bool, CheckObjectError> {
    let _lock = klock::lock_cpu::<Traits>()?;
    app_cb::<Traits>(app)?;
    let (access, _) = object_access_and_owner::<Traits>(object, id)?;
    Ok(access & (1 << app) != 0)
}

/// Implements `CheckObjectOwnership`.
pub(crate) fn check_object_ownership<Traits: KernelTraits>(
    object: ObjectType,
    id: usize,
) -> Result<AppId, CheckObjectError> {
    let _lock = klock::lock_cpu::<Traits>()?;
    let (_, owner) = object_access_and_owner::<Traits>(object, id)?;
    Ok(owner)
}

/// Implements `TerminateApplication`.
pub(crate) fn terminate_application<Traits: KernelTraits>(
    id: AppId,
    restart: bool,
) -> Result<(), TerminateApplicationError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let app = app_cb::<Traits>(id)?;

    // A non-trusted caller may only terminate its own application
    if let Some(caller) = thread::current_app::<Traits>(lock.borrow_mut()) {
        if !caller.attr.trusted && !core::ptr::eq(caller, app) {
            return Err(TerminateApplicationError::Access);
        }
    }

    match app.state.get(&*lock.borrow_mut()) {
        AppState::Terminated => return Err(TerminateApplicationError::State),
        AppState::Restarting if restart => return Err(TerminateApplicationError::State),
        _ => {}
    }

    if app.attr.core != Traits::core_id() {
        xsig::send::<Traits>(
            lock.borrow_mut(),
            app.attr.core,
            xsig::XSigRequest::TerminateApplication(id, restart),
        )?;
        return Ok(());
    }

    let killed_self = terminate_application_local(lock.borrow_mut(), app, restart);

    if killed_self {
        // The caller's own task is gone; leave through the dispatcher
        let current = Traits::local_core_cb().sched.current_task.get(&*lock.borrow_mut());
        // Safety: CPU Lock active; the task was killed and will not resume
        unsafe { Traits::exit_and_dispatch(current.0) }
    }

    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// The core portion of application termination, also run by the XSignal
/// executor and the protection-violation handler. Returns `true` when the
/// calling core's current task was among the killed.
pub(crate) fn terminate_application_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    app: &'static AppCb<Traits>,
    restart: bool,
) -> bool {
    let current = Traits::local_core_cb().sched.current_task.get(&*lock);
    let mut killed_self = false;

    for &task_id in app.attr.tasks {
        let Some(task_cb) = Traits::get_task_cb(task_id) else {
            continue;
        };
        let task_ref = task::TaskRef(task_cb);
        if task_ref == current {
            killed_self = true;
        }
        task::kill_task(lock.borrow_mut(), task_ref);
    }

    for &isr_id in app.attr.isrs {
        let Some(isr_cb) = Traits::get_isr_cb(isr_id) else {
            continue;
        };
        kill_isr(lock.borrow_mut(), isr_cb);
    }

    for &alarm_id in app.attr.alarms {
        let Some(alarm_cb) = Traits::get_alarm_cb(alarm_id) else {
            continue;
        };
        let _ = alarm::cancel_local(lock.borrow_mut(), alarm_cb);
    }

    for &table_id in app.attr.schedule_tables {
        let Some(table_cb) = Traits::get_schedule_table_cb(table_id) else {
            continue;
        };
        schedule_table::stop_unconditionally(lock.borrow_mut(), table_cb);
    }

    if restart {
        app.state.replace(&mut *lock, AppState::Restarting);
        if let Some(restart_task) = app.attr.restart_task {
            if let Some(task_cb) = Traits::get_task_cb(restart_task) {
                if let Err(e) =
                    task::activate_local(lock.borrow_mut(), task::TaskRef(task_cb))
                {
                    hook::call_error_hook::<Traits>(
                        lock.borrow_mut(),
                        ServiceId::TerminateApplication,
                        e.into(),
                    );
                }
            }
        }
    } else {
        app.state.replace(&mut *lock, AppState::Terminated);
    }

    killed_self
}

/// Forcibly terminate an ISR: release its locks (reporting each leak once)
/// and flag it killed so its epilogue skips the normal wind-down.
fn kill_isr<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    isr_cb: &'static isr::IsrCb<Traits>,
) {
    let active = matches!(
        thread::current_thread::<Traits>(lock.borrow_mut()),
        ThreadRef::Isr(running) if core::ptr::eq(running, isr_cb)
    ) || Traits::local_core_cb()
        .thread_stack
        .read(&*lock)
        .iter()
        .any(|t| matches!(t, ThreadRef::Isr(x) if core::ptr::eq(*x, isr_cb)));

    if !active {
        return;
    }

    if isr_cb.last_resource_held.get(&*lock).is_some() {
        hook::call_error_hook::<Traits>(
            lock.borrow_mut(),
            ServiceId::TerminateApplication,
            ErrorCode::Resource,
        );
        crate::resource::force_release_all_isr(lock.borrow_mut(), isr_cb);
    }
    if spinlock::isr_holds_any::<Traits>(lock.borrow_mut()) {
        hook::call_error_hook::<Traits>(
            lock.borrow_mut(),
            ServiceId::TerminateApplication,
            ErrorCode::Spinlock,
        );
        spinlock::force_release_all_isr::<Traits>(lock.borrow_mut());
    }

    isr_cb.killed.replace(&mut *lock, true);
}

/// Implements `AllowAccess`.
pub(crate) fn allow_access<Traits: KernelTraits>() -> Result<(), AllowAccessError> {
    let mut lock = klock::lock_cpu::<Traits>()?;

    let Some(app) = thread::current_app::<Traits>(lock.borrow_mut()) else {
        return Err(AllowAccessError::CallLevel);
    };

    if app.state.get(&*lock.borrow_mut()) != AppState::Restarting {
        return Err(AllowAccessError::State);
    }

    app.state.replace(&mut *lock.borrow_mut(), AppState::Accessible);
    Ok(())
}
