//! Spinlocks
//!
//! Cross-core busy-waiting locks. The owner word is the only cross-core
//! state: a compare-exchange loop with acquire ordering takes it, a release
//! store frees it. Everything else (the holder bookkeeping, the LIFO of
//! locks held by a core) is core-local.
//!
//! Deadlock avoidance is by static rank ordering: a core may only acquire
//! spinlocks of strictly increasing rank. Violations are rejected with
//! `NestingError` before touching the owner word.
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    app, error::*, klock, sched, task, thread, tp, AppAccessMask, AppId, InterruptLockLevel,
    KernelTraits, PortThreading, SpinlockId, ThreadRef,
};

/// The interrupt lock a spinlock raises while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMethod {
    /// No interrupt locking; the caller must not be preempted by design.
    None,
    /// Category-2 (OS) interrupts are locked.
    Cat2,
    /// All interrupts are locked.
    All,
}

/// The static properties of a spinlock.
pub struct SpinlockAttr {
    /// The deadlock-avoidance rank. Acquisition order per core must be
    /// strictly increasing.
    pub rank: u32,

    pub method: LockMethod,

    /// The set of cores allowed to take this lock, one bit per core id.
    pub cores: u32,

    pub app: AppId,
    pub access: AppAccessMask,
}

/// Owner word value for "free".
const OWNER_NONE: usize = 0;

/// *Spinlock control block* - the state data of a spinlock.
pub struct SpinlockCb<Traits: PortThreading> {
    pub attr: &'static SpinlockAttr,

    /// `core id + 1` of the owning core, [`OWNER_NONE`] when free. The only
    /// field accessed cross-core.
    pub(crate) owner: AtomicUsize,

    /// The task that acquired the lock, if it was taken from a task context.
    pub(crate) holder_task: klock::CpuLockCell<Traits, Option<task::TaskRef<Traits>>>,

    /// The next element in the owning core's LIFO of held spinlocks.
    pub(crate) prev_held: klock::CpuLockCell<Traits, Option<&'static SpinlockCb<Traits>>>,

    /// The interrupt lock level to restore on release.
    pub(crate) saved_level: klock::CpuLockCell<Traits, InterruptLockLevel>,
}

impl<Traits: PortThreading> SpinlockCb<Traits> {
    pub const fn new(attr: &'static SpinlockAttr) -> Self {
        Self {
            attr,
            owner: AtomicUsize::new(OWNER_NONE),
            holder_task: klock::CpuLockCell::new(None),
            prev_held: klock::CpuLockCell::new(None),
            saved_level: klock::CpuLockCell::new(InterruptLockLevel::None),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for SpinlockCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SpinlockCb")
            .field("self", &(self as *const _))
            .field("rank", &self.attr.rank)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[inline]
pub(crate) fn spinlock_cb<Traits: KernelTraits>(
    id: SpinlockId,
) -> Result<&'static SpinlockCb<Traits>, BadIdError> {
    Traits::get_spinlock_cb(id).ok_or(BadIdError::Id)
}

/// The common validation of `GetSpinlock` and `TryToGetSpinlock`.
fn precheck<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    spinlock: &'static SpinlockCb<Traits>,
) -> Result<(), GetSpinlockError> {
    app::check_access::<Traits>(lock.borrow_mut(), spinlock.attr.access)?;

    let core_id = Traits::core_id();
    if spinlock.attr.cores & (1 << core_id) == 0 {
        return Err(GetSpinlockError::Access);
    }

    match thread::current_thread::<Traits>(lock.borrow_mut()) {
        ThreadRef::Task(_) | ThreadRef::Isr(_) => {}
        ThreadRef::Hook(_) => return Err(GetSpinlockError::CallLevel),
    }

    // Re-acquiring a lock this core already holds can never succeed
    if spinlock.owner.load(Ordering::Relaxed) == core_id + 1 {
        return Err(GetSpinlockError::InterferenceDeadlock);
    }

    // Rank ordering: only locks ranked strictly above everything this core
    // already holds may be taken
    if let Some(top) = Traits::local_core_cb().last_spinlock.get(&*lock) {
        if spinlock.attr.rank <= top.attr.rank {
            return Err(GetSpinlockError::NestingError);
        }
    }

    Ok(())
}

/// Raise the interrupt lock for the spinlock's method, returning the level
/// to restore.
fn raise_interrupt_lock<Traits: KernelTraits>(method: LockMethod) -> InterruptLockLevel {
    let saved = Traits::interrupt_lock_level();
    let target = match method {
        LockMethod::None => return saved,
        LockMethod::Cat2 => InterruptLockLevel::Cat2,
        LockMethod::All => InterruptLockLevel::All,
    };
    // Safety: the kernel controls the interrupt lock level
    unsafe { Traits::set_interrupt_lock_level(target) };
    saved
}

/// Record a successful acquisition in the core-local bookkeeping.
fn commit_acquisition<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    spinlock: &'static SpinlockCb<Traits>,
    saved: InterruptLockLevel,
) {
    let core = Traits::local_core_cb();

    let holder_task = match thread::current_thread::<Traits>(lock.borrow_mut()) {
        ThreadRef::Task(t) => Some(t),
        _ => None,
    };
    spinlock.holder_task.replace(&mut *lock, holder_task);
    spinlock.saved_level.replace(&mut *lock, saved);

    let prev = core.last_spinlock.replace(&mut *lock, Some(spinlock));
    spinlock.prev_held.replace(&mut *lock, prev);

    match spinlock.attr.method {
        LockMethod::All => tp::enter_all_interrupt_lock(lock.borrow_mut()),
        LockMethod::Cat2 => tp::enter_os_interrupt_lock(lock.borrow_mut()),
        LockMethod::None => {}
    }
}

/// Implements `GetSpinlock`.
pub(crate) fn get_spinlock<Traits: KernelTraits>(id: SpinlockId) -> Result<(), GetSpinlockError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let spinlock = spinlock_cb::<Traits>(id)?;
    precheck(lock.borrow_mut(), spinlock)?;

    let saved = raise_interrupt_lock::<Traits>(spinlock.attr.method);
    let want = Traits::core_id() + 1;

    // Spin until the owner word is free
    while spinlock
        .owner
        .compare_exchange_weak(OWNER_NONE, want, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }

    commit_acquisition(lock.borrow_mut(), spinlock, saved);
    Ok(())
}

/// Implements `TryToGetSpinlock`. Returns `Ok(false)` when the lock is
/// occupied, without spinning.
pub(crate) fn try_to_get_spinlock<Traits: KernelTraits>(
    id: SpinlockId,
) -> Result<bool, GetSpinlockError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let spinlock = spinlock_cb::<Traits>(id)?;
    precheck(lock.borrow_mut(), spinlock)?;

    let saved = raise_interrupt_lock::<Traits>(spinlock.attr.method);
    let want = Traits::core_id() + 1;

    if spinlock
        .owner
        .compare_exchange(OWNER_NONE, want, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        // Occupied; undo the interrupt lock and report without spinning
        // Safety: restoring the level saved above
        unsafe { Traits::set_interrupt_lock_level(saved) };
        return Ok(false);
    }

    commit_acquisition(lock.borrow_mut(), spinlock, saved);
    Ok(true)
}

/// Implements `ReleaseSpinlock`.
pub(crate) fn release_spinlock<Traits: KernelTraits>(
    id: SpinlockId,
) -> Result<(), ReleaseSpinlockError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let spinlock = spinlock_cb::<Traits>(id)?;
    app::check_access::<Traits>(lock.borrow_mut(), spinlock.attr.access)?;

    let core = Traits::local_core_cb();

    if spinlock.owner.load(Ordering::Relaxed) != Traits::core_id() + 1 {
        return Err(ReleaseSpinlockError::State);
    }

    // LIFO order: only the most recently taken lock may be released
    match core.last_spinlock.get(&*lock.borrow_mut()) {
        Some(top) if core::ptr::eq(top, spinlock) => {}
        _ => return Err(ReleaseSpinlockError::NestingError),
    }

    release_internal(lock.borrow_mut(), spinlock);

    // A deferred round-robin rotation may be pending from the locked window
    sched::rob_round(lock.borrow_mut(), &core.sched);
    task::task_unlock_cpu_and_check_preemption(lock);
    Ok(())
}

fn release_internal<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    spinlock: &'static SpinlockCb<Traits>,
) {
    let core = Traits::local_core_cb();

    match spinlock.attr.method {
        LockMethod::All => tp::leave_all_interrupt_lock(lock.borrow_mut()),
        LockMethod::Cat2 => tp::leave_os_interrupt_lock(lock.borrow_mut()),
        LockMethod::None => {}
    }

    let prev = spinlock.prev_held.replace(&mut *lock, None);
    core.last_spinlock.replace(&mut *lock, prev);
    spinlock.holder_task.replace(&mut *lock, None);

    let saved = spinlock.saved_level.get(&*lock);

    spinlock.owner.store(OWNER_NONE, Ordering::Release);

    // Safety: restoring the level saved at acquisition
    unsafe { Traits::set_interrupt_lock_level(saved) };
}

/// Return whether the given task holds any spinlock on the calling core.
pub(crate) fn task_holds_any<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: task::TaskRef<Traits>,
) -> bool {
    let mut maybe_held = Traits::local_core_cb().last_spinlock.get(&*lock);
    while let Some(spinlock) = maybe_held {
        if spinlock.holder_task.get(&*lock) == Some(task) {
            return true;
        }
        maybe_held = spinlock.prev_held.get(&*lock);
    }
    false
}

/// Force-release every spinlock held by the given task (kill path). By the
/// LIFO discipline, the task's locks are the innermost ones on this core.
pub(crate) fn force_release_all<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    task: task::TaskRef<Traits>,
) {
    let core = Traits::local_core_cb();
    while let Some(top) = core.last_spinlock.get(&*lock) {
        if top.holder_task.get(&*lock) != Some(task) {
            break;
        }
        release_internal(lock.borrow_mut(), top);
    }
}

/// Return whether the calling core holds any spinlock from an ISR context
/// whose holder is not a task (epilogue leak detection).
pub(crate) fn isr_holds_any<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    match Traits::local_core_cb().last_spinlock.get(&*lock) {
        Some(top) => top.holder_task.get(&*lock).is_none(),
        None => false,
    }
}

/// Force-release the spinlocks taken by the innermost ISR (epilogue leak
/// handling).
pub(crate) fn force_release_all_isr<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let core = Traits::local_core_cb();
    while let Some(top) = core.last_spinlock.get(&*lock) {
        if top.holder_task.get(&*lock).is_some() {
            break;
        }
        release_internal(lock.borrow_mut(), top);
    }
}
