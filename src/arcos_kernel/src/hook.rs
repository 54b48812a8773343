//! Hook invocation
//!
//! The kernel only *invokes* hooks; their bodies are external. The error
//! hook is guarded against reentry per core, and every reported error is
//! captured in the core's last-error record first. The protection hook's
//! decision is applied here.
use core::fmt;

use crate::{
    app, error::ErrorCode, klock, startup, task, thread, thread::HookKind, utils::Init,
    KernelTraits, TaskId, ThreadRef,
};

/// The identity of the service reporting an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServiceId {
    ActivateTask,
    TerminateTask,
    ChainTask,
    Schedule,
    GetTaskState,
    SetEvent,
    ClearEvent,
    GetEvent,
    WaitEvent,
    EnableInterruptSource,
    DisableInterruptSource,
    ClearPendingInterrupt,
    IsInterruptSourceEnabled,
    IsInterruptPending,
    GetResource,
    ReleaseResource,
    GetSpinlock,
    TryToGetSpinlock,
    ReleaseSpinlock,
    IncrementCounter,
    GetCounterValue,
    GetElapsedValue,
    GetAlarmBase,
    GetAlarm,
    SetRelAlarm,
    SetAbsAlarm,
    CancelAlarm,
    StartScheduleTableRel,
    StartScheduleTableAbs,
    StopScheduleTable,
    NextScheduleTable,
    SyncScheduleTable,
    SetScheduleTableAsync,
    GetScheduleTableStatus,
    CheckObjectAccess,
    CheckObjectOwnership,
    TerminateApplication,
    AllowAccess,
    StartCore,
    StartNonAutosarCore,
    ControlIdle,
    CallTrustedFunction,
    CallNonTrustedFunction,
    IsrEpilogue,
    ProtectionHook,
}

/// The per-core error record surfaced by `OsGetLastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastError {
    pub service: ServiceId,
    pub code: ErrorCode,
}

/// The resolution returned by the protection hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionDecision {
    /// Resume as if nothing happened.
    Ignore,
    /// Forcibly terminate the faulting task or ISR.
    TerminateTaskIsr,
    /// Terminate the faulting thread's OS-Application.
    TerminateApplication,
    /// Terminate and restart the faulting thread's OS-Application.
    TerminateApplicationRestart,
    /// Shut down the system.
    Shutdown,
}

/// The statically configured hook table.
#[derive(Clone, Copy)]
pub struct Hooks {
    pub startup: Option<fn()>,
    pub shutdown: Option<fn(ErrorCode)>,
    pub error: Option<fn(ErrorCode)>,
    pub pre_task: Option<fn(TaskId)>,
    pub post_task: Option<fn(TaskId)>,
    pub protection: Option<fn(ErrorCode) -> ProtectionDecision>,
}

impl Init for Hooks {
    const INIT: Self = Self {
        startup: None,
        shutdown: None,
        error: None,
        pre_task: None,
        post_task: None,
        protection: None,
    };
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("startup", &self.startup.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .field("error", &self.error.is_some())
            .field("pre_task", &self.pre_task.is_some())
            .field("post_task", &self.post_task.is_some())
            .field("protection", &self.protection.is_some())
            .finish()
    }
}

/// Capture and report a failed service call. Used by the service interface;
/// passes the result through.
pub(crate) fn report<Traits: KernelTraits, T, E: Into<ErrorCode> + Copy>(
    service: ServiceId,
    result: Result<T, E>,
) -> Result<T, E> {
    if let Err(e) = &result {
        if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
            call_error_hook::<Traits>(lock.borrow_mut(), service, (*e).into());
        }
    }
    result
}

/// Implements `OsGetLastError`.
pub(crate) fn get_last_error<Traits: KernelTraits>() -> Option<LastError> {
    let lock = klock::lock_cpu::<Traits>().ok()?;
    Traits::local_core_cb().last_error.get(&*lock)
}

/// Record an error and invoke the global and application error hooks.
/// Reentrant invocations (an error inside the error hook) are swallowed.
pub(crate) fn call_error_hook<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    service: ServiceId,
    code: ErrorCode,
) {
    let core = Traits::local_core_cb();

    core.last_error
        .replace(&mut *lock, Some(LastError { service, code }));

    if core.in_error_hook.replace(&mut *lock, true) {
        return;
    }

    let app_hook = thread::current_app::<Traits>(lock.borrow_mut())
        .and_then(|app| app.attr.error_hook);

    enter_critical_user_section(lock.borrow_mut());
    thread::push_interrupted(lock.borrow_mut(), ThreadRef::Hook(HookKind::Error));

    if let Some(hook) = Traits::HOOKS.error {
        hook(code);
    }
    if let Some(hook) = app_hook {
        hook(code);
    }

    thread::pop_interrupted(lock.borrow_mut());
    leave_critical_user_section(lock.borrow_mut());

    core.in_error_hook.replace(&mut *lock, false);
}

/// Handle a protection violation: invoke the protection hook and apply its
/// decision. Without a configured hook the system is shut down.
pub(crate) fn protection_violation<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
) {
    let core = Traits::local_core_cb();
    core.last_error.replace(
        &mut *lock,
        Some(LastError {
            service: ServiceId::ProtectionHook,
            code,
        }),
    );

    let decision = match Traits::HOOKS.protection {
        Some(hook) => {
            enter_critical_user_section(lock.borrow_mut());
            thread::push_interrupted(lock.borrow_mut(), ThreadRef::Hook(HookKind::Protection));
            let decision = hook(code);
            thread::pop_interrupted(lock.borrow_mut());
            leave_critical_user_section(lock.borrow_mut());
            decision
        }
        None => ProtectionDecision::Shutdown,
    };

    match decision {
        ProtectionDecision::Ignore => {}
        ProtectionDecision::TerminateTaskIsr => {
            match thread::current_thread::<Traits>(lock.borrow_mut()) {
                ThreadRef::Task(task) => {
                    task::kill_task(lock.borrow_mut(), task);
                }
                ThreadRef::Isr(isr_cb) => {
                    // Mark it killed; the epilogue skips the wind-down
                    crate::resource::force_release_all_isr(lock.borrow_mut(), isr_cb);
                    crate::spinlock::force_release_all_isr::<Traits>(lock.borrow_mut());
                    isr_cb.killed.replace(&mut *lock, true);
                }
                ThreadRef::Hook(_) => {}
            }
        }
        ProtectionDecision::TerminateApplication
        | ProtectionDecision::TerminateApplicationRestart => {
            let restart = decision == ProtectionDecision::TerminateApplicationRestart;
            if let Some(app) = thread::current_app::<Traits>(lock.borrow_mut()) {
                app::terminate_application_local(lock.borrow_mut(), app, restart);
            }
        }
        ProtectionDecision::Shutdown => {
            startup::shutdown_local::<Traits>(lock.borrow_mut(), code, true);
        }
    }
}

/// Handle an inter-arrival violation. The faulting activation is dropped by
/// the caller regardless of the decision; `TerminateTaskIsr` therefore has
/// nothing further to do. `app` is the application owning the faulting
/// object.
pub(crate) fn arrival_violation<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    app_cb: Option<&'static app::AppCb<Traits>>,
) {
    let core = Traits::local_core_cb();
    core.last_error.replace(
        &mut *lock,
        Some(LastError {
            service: ServiceId::ProtectionHook,
            code,
        }),
    );

    let decision = match Traits::HOOKS.protection {
        Some(hook) => {
            enter_critical_user_section(lock.borrow_mut());
            thread::push_interrupted(lock.borrow_mut(), ThreadRef::Hook(HookKind::Protection));
            let decision = hook(code);
            thread::pop_interrupted(lock.borrow_mut());
            leave_critical_user_section(lock.borrow_mut());
            decision
        }
        None => ProtectionDecision::Shutdown,
    };

    match decision {
        ProtectionDecision::Ignore | ProtectionDecision::TerminateTaskIsr => {}
        ProtectionDecision::TerminateApplication
        | ProtectionDecision::TerminateApplicationRestart => {
            let restart = decision == ProtectionDecision::TerminateApplicationRestart;
            if let Some(app_cb) = app_cb {
                app::terminate_application_local(lock.borrow_mut(), app_cb, restart);
            }
        }
        ProtectionDecision::Shutdown => {
            startup::shutdown_local::<Traits>(lock.borrow_mut(), code, true);
        }
    }
}

/// Enter the critical user section: hook callbacks into user code may not
/// be interrupted by nested hooks while it's held.
pub(crate) fn enter_critical_user_section<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let core = Traits::local_core_cb();
    let depth = core.critical_user_section.get(&*lock);
    core.critical_user_section.replace(&mut *lock, depth + 1);
}

/// Leave the critical user section.
pub(crate) fn leave_critical_user_section<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let core = Traits::local_core_cb();
    let depth = core.critical_user_section.get(&*lock);
    debug_assert_ne!(depth, 0);
    core.critical_user_section.replace(&mut *lock, depth.saturating_sub(1));
}
