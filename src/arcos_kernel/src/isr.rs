//! Category-2 ISR dispatch
//!
//! A category-2 ISR is a kernel-managed thread: its prologue checks the
//! inter-arrival budget, displaces the interrupted thread onto the core's
//! thread stack and switches the timing-protection monitor; its epilogue
//! verifies the ISR released everything it took, force-releasing and
//! reporting each leak, and restores the displaced thread.
//!
//! The interrupt-disable services (`SuspendAllInterrupts` and friends) track
//! their nesting in plain core-local atomics: they are exactly the services
//! that must work while the kernel lock is already held (alarm callbacks,
//! hooks), so they stay outside the CPU-Lock cells.
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};

use crate::{
    app, error::*, hook, klock, resource, sched, spinlock, thread, tp,
    utils::Init, AppAccessMask, AppId, CoreId, InterruptLockLevel, InterruptSourceId, IsrId,
    KernelTraits, PortThreading, ServiceId, ThreadRef, INVALID_ISR,
};

bitflags::bitflags! {
    /// Static behavior flags of an ISR.
    pub struct IsrFlags: u32 {
        /// Enable the source during `InitialEnableInterruptSources`.
        const ENABLE_AT_START = 1 << 0;
        /// Clear the pending flag when enabling at start.
        const CLEAR_PENDING_ON_ENABLE = 1 << 1;
    }
}

/// The static properties of a category-2 ISR.
pub struct IsrAttr {
    /// The hardware source this ISR is bound to.
    pub source: InterruptSourceId,

    pub flags: IsrFlags,
    pub core: CoreId,
    pub app: AppId,
    pub access: AppAccessMask,

    /// The timing-protection descriptor, if the ISR is monitored.
    pub tp: Option<&'static tp::TpIsrAttr>,
}

/// *ISR control block* - the state data of a category-2 ISR.
pub struct IsrCb<Traits: PortThreading> {
    pub attr: &'static IsrAttr,

    /// Set when the ISR is killed while running (`TerminateApplication`,
    /// protection violation); cleared by the epilogue.
    pub(crate) killed: klock::CpuLockCell<Traits, bool>,

    /// The most recently taken resource; heads the LIFO of held resources.
    pub(crate) last_resource_held:
        klock::CpuLockCell<Traits, Option<&'static resource::ResourceCb<Traits>>>,

    /// Timing-protection state of this ISR.
    pub(crate) tp: tp::TpThreadState<Traits>,
}

impl<Traits: PortThreading> IsrCb<Traits> {
    pub const fn new(attr: &'static IsrAttr) -> Self {
        Self {
            attr,
            killed: klock::CpuLockCell::new(false),
            last_resource_held: klock::CpuLockCell::new(None),
            tp: tp::TpThreadState::new(),
        }
    }
}

impl<Traits: KernelTraits> fmt::Debug for IsrCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IsrCb")
            .field("self", &(self as *const _))
            .field("source", &self.attr.source)
            .field("killed", &self.killed)
            .finish_non_exhaustive()
    }
}

/// Compute an ISR's dense id from its control block address.
pub(crate) fn isr_id_of<Traits: KernelTraits>(isr_cb: &'static IsrCb<Traits>) -> IsrId {
    let pool = Traits::isr_cb_pool();
    let offset_bytes = isr_cb as *const IsrCb<_> as usize - pool.as_ptr() as usize;
    offset_bytes / core::mem::size_of::<IsrCb<Traits>>()
}

#[inline]
pub(crate) fn isr_cb<Traits: KernelTraits>(id: IsrId) -> Result<&'static IsrCb<Traits>, BadIdError> {
    Traits::get_isr_cb(id).ok_or(BadIdError::Id)
}

// Prologue and epilogue
// ---------------------------------------------------------------------------

/// The ISR prologue. Called by the first-level interrupt handler with
/// interrupts masked (CPU Lock active). Returns `false` when the invocation
/// was dropped by the inter-arrival check; the handler must then skip the
/// ISR body and the epilogue.
///
/// # Safety
///
/// CPU Lock active; the calling core must be about to run the ISR body.
pub(crate) unsafe fn isr_run<Traits: KernelTraits>(id: IsrId) -> bool {
    // Safety: CPU Lock active per this function's precondition
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

    let Some(isr_cb) = Traits::get_isr_cb(id) else {
        debug_assert!(false, "interrupt for an unknown ISR");
        core::mem::forget(lock);
        return false;
    };

    if !tp::isr_arrival_check(lock.borrow_mut(), isr_cb) {
        // Drop the invocation: acknowledge the hardware and pretend the
        // interrupt never happened
        // Safety: the kernel controls interrupt sources
        unsafe { Traits::clear_pending_interrupt(isr_cb.attr.source) };
        core::mem::forget(lock);
        return false;
    }

    let outgoing = thread::current_thread(lock.borrow_mut());
    thread::push_interrupted(lock.borrow_mut(), ThreadRef::Isr(isr_cb));
    tp::thread_switch(lock.borrow_mut(), outgoing, ThreadRef::Isr(isr_cb));

    core::mem::forget(lock);
    true
}

/// The ISR epilogue. Called by the first-level interrupt handler after the
/// ISR body, with interrupts masked (CPU Lock active). Returns `true` when
/// the handler returns to task level and must run the dispatcher.
///
/// # Safety
///
/// CPU Lock active; the innermost thread of the calling core must be the
/// ISR whose body just returned.
pub(crate) unsafe fn isr_epilogue<Traits: KernelTraits>() -> bool {
    // Safety: CPU Lock active per this function's precondition
    let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

    let ThreadRef::Isr(isr_cb) = thread::current_thread(lock.borrow_mut()) else {
        panic!("ISR epilogue outside of an ISR context");
    };

    if isr_cb.killed.replace(&mut *lock.borrow_mut(), false) {
        // Already cleaned up by the kill path
    } else {
        // Lock-leak detection. Every leak is force-released and reported;
        // none is fatal.
        if isr_cb.last_resource_held.get(&*lock.borrow_mut()).is_some() {
            resource::force_release_all_isr(lock.borrow_mut(), isr_cb);
            hook::call_error_hook::<Traits>(
                lock.borrow_mut(),
                ServiceId::IsrEpilogue,
                ErrorCode::Resource,
            );
        }
        if spinlock::isr_holds_any::<Traits>(lock.borrow_mut()) {
            spinlock::force_release_all_isr::<Traits>(lock.borrow_mut());
            hook::call_error_hook::<Traits>(
                lock.borrow_mut(),
                ServiceId::IsrEpilogue,
                ErrorCode::Spinlock,
            );
        }
        if interrupts_suspended::<Traits>() {
            force_restore_interrupts::<Traits>(lock.borrow_mut());
            hook::call_error_hook::<Traits>(
                lock.borrow_mut(),
                ServiceId::IsrEpilogue,
                ErrorCode::DisabledInt,
            );
        }
    }

    let restored = thread::pop_interrupted(lock.borrow_mut());
    tp::thread_switch(lock.borrow_mut(), ThreadRef::Isr(isr_cb), restored);

    let dispatch = match restored {
        ThreadRef::Task(_) => {
            sched::switch_required(lock.borrow_mut(), &Traits::local_core_cb().sched)
        }
        _ => false,
    };

    core::mem::forget(lock);
    dispatch
}

// Interrupt source services
// ---------------------------------------------------------------------------

/// Validate an interrupt-source service: the id must be valid and the
/// addressed ISR must be owned by the caller's application.
fn source_precheck<Traits: KernelTraits>(
    lock: &mut klock::CpuLockGuard<Traits>,
    id: IsrId,
) -> Result<&'static IsrCb<Traits>, InterruptSourceError> {
    let isr_cb = isr_cb::<Traits>(id)?;

    if let Some(caller) = thread::current_app::<Traits>(lock.borrow_mut()) {
        if !caller.attr.trusted && app::app_id::<Traits>(caller) != isr_cb.attr.app {
            return Err(InterruptSourceError::NotTheOwner);
        }
    }
    Ok(isr_cb)
}

/// Implements `EnableInterruptSource`.
pub(crate) fn enable_interrupt_source<Traits: KernelTraits>(
    id: IsrId,
    clear_pending: bool,
) -> Result<(), InterruptSourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let isr_cb = source_precheck::<Traits>(&mut lock, id)?;

    // Safety: the kernel controls interrupt sources
    if unsafe { Traits::enable_interrupt_source(isr_cb.attr.source, clear_pending) } {
        Ok(())
    } else {
        Err(InterruptSourceError::UnimplementedClearPending)
    }
}

/// Implements `DisableInterruptSource`.
pub(crate) fn disable_interrupt_source<Traits: KernelTraits>(
    id: IsrId,
) -> Result<(), InterruptSourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let isr_cb = source_precheck::<Traits>(&mut lock, id)?;

    // Safety: the kernel controls interrupt sources
    unsafe { Traits::disable_interrupt_source(isr_cb.attr.source) };
    Ok(())
}

/// Implements `ClearPendingInterrupt`.
pub(crate) fn clear_pending_interrupt<Traits: KernelTraits>(
    id: IsrId,
) -> Result<(), InterruptSourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let isr_cb = source_precheck::<Traits>(&mut lock, id)?;

    // Safety: the kernel controls interrupt sources
    if unsafe { Traits::clear_pending_interrupt(isr_cb.attr.source) } {
        Ok(())
    } else {
        Err(InterruptSourceError::UnimplementedClearPending)
    }
}

/// Implements `IsInterruptSourceEnabled`.
pub(crate) fn is_interrupt_source_enabled<Traits: KernelTraits>(
    id: IsrId,
) -> Result<bool, InterruptSourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let isr_cb = source_precheck::<Traits>(&mut lock, id)?;
    Ok(Traits::is_interrupt_source_enabled(isr_cb.attr.source))
}

/// Implements `IsInterruptPending`.
pub(crate) fn is_interrupt_pending<Traits: KernelTraits>(
    id: IsrId,
) -> Result<bool, InterruptSourceError> {
    let mut lock = klock::lock_cpu::<Traits>()?;
    let isr_cb = source_precheck::<Traits>(&mut lock, id)?;
    Ok(Traits::is_interrupt_pending(isr_cb.attr.source))
}

/// Implements `GetISRID`.
pub(crate) fn get_isr_id<Traits: KernelTraits>() -> IsrId {
    let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
        return INVALID_ISR;
    };
    match thread::innermost_isr::<Traits>(lock.borrow_mut()) {
        Some(isr_cb) => isr_id_of::<Traits>(isr_cb),
        None => INVALID_ISR,
    }
}

/// Enable the auto-enabled interrupt sources of the calling core. Called
/// once per core during start-up.
pub(crate) fn initial_enable_interrupt_sources<Traits: KernelTraits>() {
    for isr_cb in Traits::isr_cb_pool() {
        if isr_cb.attr.core != Traits::core_id() {
            continue;
        }
        if isr_cb.attr.flags.contains(IsrFlags::ENABLE_AT_START) {
            let clear = isr_cb.attr.flags.contains(IsrFlags::CLEAR_PENDING_ON_ENABLE);
            // Safety: the kernel controls interrupt sources; boot phase
            unsafe { Traits::enable_interrupt_source(isr_cb.attr.source, clear) };
        }
    }
}

// Interrupt-disable services
// ---------------------------------------------------------------------------

/// Per-core nesting state of the interrupt-disable services. Plain atomics:
/// these services must work regardless of whether the kernel lock is held.
pub struct IntApiState {
    all_nesting: AtomicU32,
    os_nesting: AtomicU32,
    /// `DisableAllInterrupts` active (the non-nesting pair).
    disabled_all: AtomicBool,
    saved_all: AtomicU8,
    saved_os: AtomicU8,
}

impl Init for IntApiState {
    const INIT: Self = Self {
        all_nesting: AtomicU32::new(0),
        os_nesting: AtomicU32::new(0),
        disabled_all: AtomicBool::new(false),
        saved_all: AtomicU8::new(0),
        saved_os: AtomicU8::new(0),
    };
}

impl IntApiState {
    pub const fn new() -> Self {
        Init::INIT
    }

    /// Reset to the power-on state (test fixtures, core re-initialization).
    pub fn reset(&self) {
        self.all_nesting.store(0, Ordering::Relaxed);
        self.os_nesting.store(0, Ordering::Relaxed);
        self.disabled_all.store(false, Ordering::Relaxed);
        self.saved_all.store(0, Ordering::Relaxed);
        self.saved_os.store(0, Ordering::Relaxed);
    }
}

impl Default for IntApiState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IntApiState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IntApiState")
            .field("all_nesting", &self.all_nesting.load(Ordering::Relaxed))
            .field("os_nesting", &self.os_nesting.load(Ordering::Relaxed))
            .field("disabled_all", &self.disabled_all.load(Ordering::Relaxed))
            .finish()
    }
}

fn level_to_u8(level: InterruptLockLevel) -> u8 {
    match level {
        InterruptLockLevel::None => 0,
        InterruptLockLevel::Cat2 => 1,
        InterruptLockLevel::All => 2,
    }
}

fn level_from_u8(x: u8) -> InterruptLockLevel {
    match x {
        0 => InterruptLockLevel::None,
        1 => InterruptLockLevel::Cat2,
        _ => InterruptLockLevel::All,
    }
}

/// Implements `DisableAllInterrupts`.
pub(crate) fn disable_all_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    if state.disabled_all.swap(true, Ordering::Relaxed) {
        // Nested call of the non-nesting pair; ignored
        return;
    }
    state
        .saved_all
        .store(level_to_u8(Traits::interrupt_lock_level()), Ordering::Relaxed);
    // Safety: the kernel controls the interrupt lock level
    unsafe { Traits::set_interrupt_lock_level(InterruptLockLevel::All) };
}

/// Implements `EnableAllInterrupts`.
pub(crate) fn enable_all_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    if !state.disabled_all.swap(false, Ordering::Relaxed) {
        return;
    }
    let saved = level_from_u8(state.saved_all.load(Ordering::Relaxed));
    // Safety: restoring the level saved by `disable_all_interrupts`
    unsafe { Traits::set_interrupt_lock_level(saved) };
}

/// Implements `SuspendAllInterrupts`.
pub(crate) fn suspend_all_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    let nesting = state.all_nesting.load(Ordering::Relaxed);
    if nesting == 0 {
        state
            .saved_all
            .store(level_to_u8(Traits::interrupt_lock_level()), Ordering::Relaxed);
        // Safety: the kernel controls the interrupt lock level
        unsafe { Traits::set_interrupt_lock_level(InterruptLockLevel::All) };
        tp::enter_all_interrupt_lock_unlocked::<Traits>();
    }
    state.all_nesting.store(nesting + 1, Ordering::Relaxed);
}

/// Implements `ResumeAllInterrupts`.
pub(crate) fn resume_all_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    let nesting = state.all_nesting.load(Ordering::Relaxed);
    debug_assert_ne!(nesting, 0, "unmatched ResumeAllInterrupts");
    if nesting == 0 {
        return;
    }
    state.all_nesting.store(nesting - 1, Ordering::Relaxed);
    if nesting == 1 {
        tp::leave_all_interrupt_lock_unlocked::<Traits>();
        let saved = level_from_u8(state.saved_all.load(Ordering::Relaxed));
        // Safety: restoring the level saved by `suspend_all_interrupts`
        unsafe { Traits::set_interrupt_lock_level(saved) };
    }
}

/// Implements `SuspendOSInterrupts`.
pub(crate) fn suspend_os_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    let nesting = state.os_nesting.load(Ordering::Relaxed);
    if nesting == 0 {
        state
            .saved_os
            .store(level_to_u8(Traits::interrupt_lock_level()), Ordering::Relaxed);
        // Category-2 interrupts only; a surrounding `SuspendAllInterrupts`
        // stays in effect
        if Traits::interrupt_lock_level() == InterruptLockLevel::None {
            // Safety: the kernel controls the interrupt lock level
            unsafe { Traits::set_interrupt_lock_level(InterruptLockLevel::Cat2) };
        }
        tp::enter_os_interrupt_lock_unlocked::<Traits>();
    }
    state.os_nesting.store(nesting + 1, Ordering::Relaxed);
}

/// Implements `ResumeOSInterrupts`.
pub(crate) fn resume_os_interrupts<Traits: KernelTraits>() {
    let state = &Traits::local_core_cb().int_api_state;
    let nesting = state.os_nesting.load(Ordering::Relaxed);
    debug_assert_ne!(nesting, 0, "unmatched ResumeOSInterrupts");
    if nesting == 0 {
        return;
    }
    state.os_nesting.store(nesting - 1, Ordering::Relaxed);
    if nesting == 1 {
        tp::leave_os_interrupt_lock_unlocked::<Traits>();
        let saved = level_from_u8(state.saved_os.load(Ordering::Relaxed));
        // Safety: restoring the level saved by `suspend_os_interrupts`
        unsafe { Traits::set_interrupt_lock_level(saved) };
    }
}

/// Return whether the current thread left interrupts disabled through any
/// of the disable services.
pub(crate) fn interrupts_suspended<Traits: KernelTraits>() -> bool {
    let state = &Traits::local_core_cb().int_api_state;
    state.all_nesting.load(Ordering::Relaxed) != 0
        || state.os_nesting.load(Ordering::Relaxed) != 0
        || state.disabled_all.load(Ordering::Relaxed)
}

/// Reset the interrupt-disable state (kill path, epilogue leak handling)
/// and restore the unlocked level.
pub(crate) fn force_restore_interrupts<Traits: KernelTraits>(
    _lock: klock::CpuLockTokenRefMut<'_, Traits>,
) {
    let state = &Traits::local_core_cb().int_api_state;
    state.all_nesting.store(0, Ordering::Relaxed);
    state.os_nesting.store(0, Ordering::Relaxed);
    state.disabled_all.store(false, Ordering::Relaxed);
    // Safety: the kernel controls the interrupt lock level
    unsafe { Traits::set_interrupt_lock_level(InterruptLockLevel::None) };
}
