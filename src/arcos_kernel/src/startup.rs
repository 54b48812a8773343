//! Core lifecycle, start-up and shutdown
//!
//! Every core boots through the same sequence: the designated hardware-init
//! core performs the one-time peripheral bring-up while the others
//! rendezvous at the boot barrier, then each core initializes its local
//! kernel structures, auto-starts its objects for the selected application
//! mode and dispatches its first task.
use core::sync::atomic::Ordering;

use crate::{
    alarm, error::*, hook, isr, klock, sched, task,
    thread::{HookKind, ThreadRef},
    utils::Init,
    AppMode, CoreId, KernelTraits,
};

/// The boot barrier handshake patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPattern {
    /// Reset state; nothing signalled yet.
    Idle,
    /// A slave core is waiting for the hardware-init core.
    WaitingSign,
    /// The hardware-init core is performing the peripheral bring-up.
    InitHardware,
    /// The peripheral bring-up is finished.
    InitHardwareCompleted,
    /// The addressed core may proceed into the kernel.
    StartCore,
}

impl Init for BootPattern {
    const INIT: Self = Self::Idle;
}

/// OS lifecycle state of a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsState {
    Init,
    Prestart,
    Started,
    Shutdown,
}

impl Init for OsState {
    const INIT: Self = Self::Init;
}

/// Core lifecycle state. Stored as an atomic in the core control block
/// because the master core writes it during `StartCore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Inactive,
    ActivatedAsr,
    ActivatedNonAsr,
}

/// The idle behavior selectable through `ControlIdle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleMode {
    /// The idle task halts the core until the next interrupt.
    Halt,
    /// The idle task busy-loops.
    NoHalt,
}

impl Init for IdleMode {
    const INIT: Self = Self::Halt;
}

pub(crate) fn core_state<Traits: KernelTraits>(core: CoreId) -> CoreState {
    match Traits::core_cb_pool()[core].core_state.load(Ordering::Acquire) {
        0 => CoreState::Inactive,
        1 => CoreState::ActivatedAsr,
        _ => CoreState::ActivatedNonAsr,
    }
}

fn set_core_state<Traits: KernelTraits>(core: CoreId, state: CoreState) {
    let value = match state {
        CoreState::Inactive => 0,
        CoreState::ActivatedAsr => 1,
        CoreState::ActivatedNonAsr => 2,
    };
    Traits::core_cb_pool()[core].core_state.store(value, Ordering::Release);
}

// Boot
// ---------------------------------------------------------------------------

/// The port-side boot entry of a core released by `StartCore`. Joins the
/// system in the application mode selected by the master's `StartOS`.
///
/// # Safety
///
/// CPU Lock active, boot phase on the calling core.
pub(crate) unsafe fn boot<Traits: KernelTraits>() -> ! {
    let mode = Traits::state().app_mode.load(Ordering::Acquire);
    // Safety: forwarded precondition
    unsafe { start_os::<Traits>(mode) }
}

/// Implements `StartOS`.
///
/// # Safety
///
/// Must be called exactly once per core, with CPU Lock active, before any
/// other service.
pub(crate) unsafe fn start_os<Traits: KernelTraits>(mode: AppMode) -> ! {
    // Safety: CPU Lock active per this function's precondition
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

    let core_id = Traits::core_id();
    let core = Traits::local_core_cb();

    core.os_state.replace(&mut *lock.borrow_mut(), OsState::Init);

    // The boot core was never addressed by `StartCore`
    if core_state::<Traits>(core_id) == CoreState::Inactive {
        set_core_state::<Traits>(core_id, CoreState::ActivatedAsr);
        Traits::state().activated_cores.fetch_add(1, Ordering::AcqRel);
    }

    if core_id == Traits::HW_INIT_CORE {
        Traits::state().app_mode.store(mode, Ordering::Release);

        // Wait for every activated core to arrive at the barrier
        for other in 0..Traits::CORE_COUNT {
            if other == core_id || core_state::<Traits>(other) == CoreState::Inactive {
                continue;
            }
            while Traits::barrier_read(other) != BootPattern::WaitingSign {
                core::hint::spin_loop();
            }
        }

        // One-time peripheral bring-up
        // Safety: designated hardware-init core, boot phase
        unsafe {
            Traits::barrier_write(core_id, BootPattern::InitHardware);
            Traits::init_hardware();
            Traits::barrier_write(core_id, BootPattern::InitHardwareCompleted);
        }

        // Release the slaves
        for other in 0..Traits::CORE_COUNT {
            if other == core_id || core_state::<Traits>(other) == CoreState::Inactive {
                continue;
            }
            // Safety: boot phase
            unsafe { Traits::barrier_write(other, BootPattern::StartCore) };
        }
    } else if Traits::barrier_read(core_id) != BootPattern::StartCore {
        // Announce arrival and wait to be released. A slave arriving after
        // the release pattern was already posted proceeds directly.
        // Safety: boot phase on this core
        unsafe { Traits::barrier_write(core_id, BootPattern::WaitingSign) };
        while Traits::barrier_read(core_id) != BootPattern::StartCore {
            core::hint::spin_loop();
        }
    }

    core.os_state
        .replace(&mut *lock.borrow_mut(), OsState::Prestart);

    // Core-local kernel structures
    sched::init(lock.borrow_mut(), &core.sched);
    core.current_thread
        .replace(&mut *lock.borrow_mut(), ThreadRef::Task(core.sched.idle_task));

    isr::initial_enable_interrupt_sources::<Traits>();

    // Auto-started objects of this core
    for task_cb in Traits::task_cb_pool() {
        task::init_task(lock.borrow_mut(), task_cb, mode);
    }
    for alarm_cb in Traits::alarm_cb_pool() {
        alarm::init_alarm(lock.borrow_mut(), alarm_cb, mode);
    }

    // Startup hooks run before the first task
    hook::enter_critical_user_section(lock.borrow_mut());
    crate::thread::push_interrupted(lock.borrow_mut(), ThreadRef::Hook(HookKind::Startup));
    if let Some(startup_hook) = Traits::HOOKS.startup {
        startup_hook();
    }
    for app_cb in Traits::app_cb_pool() {
        if app_cb.attr.core == core_id {
            if let Some(app_hook) = app_cb.attr.startup_hook {
                app_hook();
            }
        }
    }
    crate::thread::pop_interrupted(lock.borrow_mut());
    hook::leave_critical_user_section(lock.borrow_mut());

    core.os_state
        .replace(&mut *lock.borrow_mut(), OsState::Started);

    sched::commit_next_task(lock.borrow_mut());
    core::mem::forget(lock);

    // Safety: CPU Lock active, start-up phase; the scheduler holds a valid
    // current task (at least the idle task)
    unsafe { Traits::dispatch_first_task() }
}

// Shutdown
// ---------------------------------------------------------------------------

/// Run the calling core's local shutdown and halt. `invoke_global_hook` is
/// set on the core that initiated the shutdown; the cores merely following a
/// `ShutdownAllCores` request skip the global hook.
pub(crate) fn shutdown_local<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    code: ErrorCode,
    invoke_global_hook: bool,
) -> ! {
    let core = Traits::local_core_cb();
    core.os_state.replace(&mut *lock, OsState::Shutdown);

    crate::thread::push_interrupted(lock.borrow_mut(), ThreadRef::Hook(HookKind::Shutdown));
    for app_cb in Traits::app_cb_pool() {
        if app_cb.attr.core == Traits::core_id() {
            if let Some(app_hook) = app_cb.attr.shutdown_hook {
                app_hook(code);
            }
        }
    }

    Traits::state().shutdown_barrier.fetch_add(1, Ordering::AcqRel);

    if invoke_global_hook {
        if let Some(shutdown_hook) = Traits::HOOKS.shutdown {
            shutdown_hook(code);
        }
    }

    // Safety: shutdown; this core will not run kernel code again
    unsafe { Traits::halt() }
}

/// Implements `ShutdownOS`.
pub(crate) fn shutdown_os<Traits: KernelTraits>(code: ErrorCode) -> ! {
    let mut lock = klock::lock_cpu::<Traits>()
        // Safety: shutdown proceeds regardless of the lock state
        .unwrap_or_else(|_| unsafe { klock::assume_cpu_lock::<Traits>() });
    shutdown_local::<Traits>(lock.borrow_mut(), code, true)
}

/// Implements `ShutdownAllCores`: request a local shutdown on every started
/// core, rendezvous, then shut down the calling core.
pub(crate) fn shutdown_all_cores<Traits: KernelTraits>(code: ErrorCode) -> ! {
    let mut lock = klock::lock_cpu::<Traits>()
        // Safety: shutdown proceeds regardless of the lock state
        .unwrap_or_else(|_| unsafe { klock::assume_cpu_lock::<Traits>() });

    let state = Traits::state();
    state
        .shutdown_code
        .store(1 + code as usize, Ordering::Release);

    let mut expected = 1;
    for other in 0..Traits::CORE_COUNT {
        if other == Traits::core_id() || core_state::<Traits>(other) == CoreState::Inactive {
            continue;
        }
        expected += 1;
        let _ = crate::xsig::send::<Traits>(
            lock.borrow_mut(),
            other,
            crate::xsig::XSigRequest::Shutdown(code),
        );
    }

    // Rendezvous: wait for the other cores to run their local shutdown
    while state.shutdown_barrier.load(Ordering::Acquire) < expected - 1 {
        core::hint::spin_loop();
    }

    shutdown_local::<Traits>(lock.borrow_mut(), code, true)
}

// Core control services
// ---------------------------------------------------------------------------

/// Implements `StartCore` and `StartNonAutosarCore`.
pub(crate) fn start_core_api<Traits: KernelTraits>(
    core: CoreId,
    autosar: bool,
) -> Result<(), StartCoreError> {
    if core >= Traits::CORE_COUNT {
        return Err(StartCoreError::Id);
    }

    let mut lock = klock::lock_cpu::<Traits>()?;

    // Cores may only be started before the calling core completes `StartOS`
    if Traits::local_core_cb().os_state.get(&*lock.borrow_mut()) == OsState::Started {
        return Err(StartCoreError::Access);
    }

    if core_state::<Traits>(core) != CoreState::Inactive {
        return Err(StartCoreError::State);
    }

    if autosar {
        set_core_state::<Traits>(core, CoreState::ActivatedAsr);
        Traits::state().activated_cores.fetch_add(1, Ordering::AcqRel);
    } else {
        set_core_state::<Traits>(core, CoreState::ActivatedNonAsr);
    }

    // Safety: the kernel controls core release
    unsafe { Traits::start_core(core) };
    Ok(())
}

/// Implements `ControlIdle`.
pub(crate) fn control_idle<Traits: KernelTraits>(
    core: CoreId,
    mode: IdleMode,
) -> Result<(), ControlIdleError> {
    if core >= Traits::CORE_COUNT {
        return Err(ControlIdleError::Id);
    }
    if core_state::<Traits>(core) == CoreState::Inactive {
        return Err(ControlIdleError::Core);
    }

    Traits::core_cb_pool()[core].idle_mode.store(
        match mode {
            IdleMode::Halt => 0,
            IdleMode::NoHalt => 1,
        },
        Ordering::Release,
    );
    Ok(())
}

/// The idle behavior last selected for the given core.
pub fn idle_mode<Traits: KernelTraits>(core: CoreId) -> IdleMode {
    match Traits::core_cb_pool()[core].idle_mode.load(Ordering::Acquire) {
        0 => IdleMode::Halt,
        _ => IdleMode::NoHalt,
    }
}
