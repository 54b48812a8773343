//! The ARCOS kernel - a statically-configured, fixed-priority preemptive
//! RTOS kernel core for embedded multi-core microcontrollers.
//!
//! # Structure
//!
//! Everything the kernel manages is declared at build time. An offline
//! generator (out of scope for this crate) emits a *system type* - an empty
//! type implementing the `KernelCfg*` traits to expose the static descriptor
//! tables, and the `Port*` traits to bind the hardware abstraction layer.
//! Implementing those traits causes the blanket implementations of [`Kernel`]
//! (the service interface) and [`PortToKernel`] (the interrupt-side entry
//! points) to materialize on the system type.
//!
//! Each kernel object is described by a *control block* (`TaskCb`,
//! `CounterCb`, …) pairing an immutable attribute record (`TaskAttr`, …)
//! with the object's mutable state. Mutable core-local state lives in
//! [`klock::CpuLockCell`]s and is only reachable while the owning core's
//! interrupts are masked; cross-core state is confined to atomics (spinlock
//! owner words, XSignal indices, lifecycle counters).
//!
//! # Contexts
//!
//! Code executes in a *task context*, an *interrupt context* (category-2
//! ISRs) or a *hook context*. Services validate the calling context and
//! return `CallLevel` when invoked from a forbidden one. The only suspension
//! points are the services that explicitly dispatch; user code never yields.
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]

pub mod error;
mod klock;
pub mod utils;

mod alarm;
mod app;
mod counter;
mod event;
mod hook;
mod isr;
mod job;
mod resource;
mod sched;
mod schedule_table;
mod service;
mod spinlock;
mod startup;
mod task;
#[cfg(test)]
mod test_support;
mod thread;
mod tp;
mod xsig;

pub use self::{
    alarm::{AlarmAction, AlarmAttr, AlarmAutostart, AlarmBase, AlarmCb},
    app::{AppAttr, AppCb, AppState, ObjectType},
    counter::{CounterAttr, CounterCb, CounterCharacteristics, CounterDriver},
    hook::{Hooks, LastError, ProtectionDecision, ServiceId},
    isr::{IntApiState, IsrAttr, IsrCb, IsrFlags},
    job::{JobCb, JobNode},
    resource::{ResourceAttr, ResourceCb},
    sched::SchedulerCb,
    schedule_table::{
        ExpiryAction, ExpiryPoint, ScheduleTableAttr, ScheduleTableCb, ScheduleTableState,
        SyncStrategy,
    },
    service::TrustedFnAttr,
    spinlock::{LockMethod, SpinlockAttr, SpinlockCb},
    startup::{idle_mode, BootPattern, CoreState, IdleMode, OsState},
    task::{StackRef, TaskAttr, TaskCb, TaskRef, TaskSt},
    thread::{HookKind, ThreadRef},
    tp::{TpBudgets, TpCoreCb, TpIsrAttr, TpLockBudget, TpTaskAttr},
    xsig::{XSigChannel, XSigSlot},
};
use self::{
    error::*,
    utils::{DequeLike, Init, PrioBitmap, VecLike},
};
use core::fmt;

// Object identifiers
// ---------------------------------------------------------------------------

/// Numeric value identifying a task. Ids are dense (`0..TASK_COUNT`).
pub type TaskId = usize;
/// Numeric value identifying a category-2 ISR.
pub type IsrId = usize;
/// Numeric value identifying a counter.
pub type CounterId = usize;
/// Numeric value identifying an alarm.
pub type AlarmId = usize;
/// Numeric value identifying a schedule table.
pub type ScheduleTableId = usize;
/// Numeric value identifying an OSEK resource.
pub type ResourceId = usize;
/// Numeric value identifying a spinlock.
pub type SpinlockId = usize;
/// Numeric value identifying an OS-Application.
pub type AppId = usize;
/// Numeric value identifying a processor core.
pub type CoreId = usize;
/// Numeric value identifying a trusted function.
pub type TrustedFnId = usize;
/// Numeric value identifying a hardware interrupt source.
pub type InterruptSourceId = usize;
/// Numeric value identifying a hardware timer channel.
pub type HwTimerId = usize;

/// The value [`Kernel::get_task_id`] returns outside of a task context.
pub const INVALID_TASK: TaskId = usize::MAX;
/// The value [`Kernel::get_isr_id`] returns outside of an ISR context.
pub const INVALID_ISR: IsrId = usize::MAX;
/// The value [`Kernel::get_application_id`] returns outside of any
/// OS-Application's context.
pub const INVALID_APP: AppId = usize::MAX;

/// Internal (logical) priority. Priorities are gap-less, and `0` is the
/// logically *highest* priority - the generator translates OSEK priority
/// values into this ordering.
pub type Priority = usize;

/// Counter tick value.
pub type TickType = u32;

/// OSEK event mask.
pub type EventMask = u32;

/// Application mode (`StartOS` parameter).
pub type AppMode = usize;

/// A set of application modes, one bit per mode.
pub type AppModeMask = u32;

/// A set of OS-Applications, one bit per application id. Descriptors carry
/// these as access masks.
pub type AppAccessMask = u32;

/// Return whether `x` is logically higher than `y`.
#[inline]
pub(crate) fn prio_is_higher(x: Priority, y: Priority) -> bool {
    x < y
}

/// Return whether `x` is logically higher than or equal to `y`.
#[inline]
pub(crate) fn prio_is_higher_or_equal(x: Priority, y: Priority) -> bool {
    x <= y
}

// Static configuration
// ---------------------------------------------------------------------------

/// Associates a system type with the dimensioning constants of the generated
/// configuration.
///
/// # Safety
///
/// This is only intended to be implemented by the configuration generator.
/// The constants must be consistent with the tables exposed through
/// [`KernelCfg2`].
pub unsafe trait KernelCfg1: Sized + Send + Sync + 'static {
    /// The number of internal priority levels. The logically lowest level
    /// (`PRIORITY_LEVELS - 1`) is reserved for the idle tasks.
    const PRIORITY_LEVELS: usize;

    /// The number of processor cores.
    const CORE_COUNT: usize;

    /// The maximum hardware interrupt nesting depth. The kernel adds
    /// [`HOOK_NESTING_HEADROOM`] on top of this for the interrupted-thread
    /// stacks.
    const ISR_NESTING_LIMIT: usize;

    /// The bit array used by the per-core schedulers. Must be able to store
    /// `PRIORITY_LEVELS` bits.
    type ReadyBitmap: PrioBitmap;
}

/// Nesting headroom for hook contexts on the interrupted-thread stacks.
pub const HOOK_NESTING_HEADROOM: usize = 8;

/// Hard capacity of the interrupted-thread stacks. `ISR_NESTING_LIMIT +
/// HOOK_NESTING_HEADROOM` must not exceed this.
pub const THREAD_STACK_CAP: usize = 16;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: KernelCfg1 {
    /// The port-specific context save area stored in each task control block.
    type PortTaskState: Send + Sync + Init + fmt::Debug + 'static;

    /// The default stack size for tasks.
    const STACK_DEFAULT_SIZE: usize = 1024;

    /// Transfer the control to the current task of the calling core,
    /// discarding the current (startup) context.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn dispatch_first_task() -> !;

    /// Yield the processor.
    ///
    /// In a task context, this method immediately transfers the control to
    /// the dispatcher. The dispatcher calls
    /// [`PortToKernel::choose_running_task`] and transfers the control to the
    /// scheduler's current task. In an interrupt context, the effect is
    /// deferred until the interrupt handler completes.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn yield_cpu();

    /// Destroy the state of the previously running task (which might already
    /// have been removed from the scheduler) and proceed to the dispatcher.
    ///
    /// Precondition: CPU Lock active
    unsafe fn exit_and_dispatch(task: &'static TaskCb<Self>) -> !;

    /// Prepare the task for activation: point the saved program counter at
    /// the task's entry point and reset the saved stack pointer, so that the
    /// task starts from its entry point next time it receives the control.
    ///
    /// Precondition: CPU Lock active, the task is not running
    unsafe fn initialize_task_state(task: &'static TaskCb<Self>);

    /// Disable all kernel-managed interrupts on the calling core (this state
    /// is called *CPU Lock*).
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts on the calling core.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Enter a CPU Lock state if it's currently inactive, returning `true`
    /// on success.
    unsafe fn try_enter_cpu_lock() -> bool {
        if Self::is_cpu_lock_active() {
            false
        } else {
            // Safety: CPU Lock inactive
            unsafe { Self::enter_cpu_lock() };
            true
        }
    }

    /// Return a flag indicating whether a CPU Lock state is active on the
    /// calling core.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is a task
    /// context.
    fn is_task_context() -> bool;
}

/// Implemented by a port. This trait contains items related to controlling
/// interrupt sources and the core-wide interrupt lock level.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortInterrupts: KernelCfg1 {
    /// Enable the specified interrupt source, optionally clearing its
    /// pending flag first. Returns `false` if the hardware cannot clear the
    /// pending flag of this source (level-triggered sources on some
    /// interrupt controllers).
    unsafe fn enable_interrupt_source(source: InterruptSourceId, clear_pending: bool) -> bool;

    /// Disable the specified interrupt source.
    unsafe fn disable_interrupt_source(source: InterruptSourceId);

    /// Clear the pending flag of the specified interrupt source. Returns
    /// `false` if the hardware doesn't support the operation for this source.
    unsafe fn clear_pending_interrupt(source: InterruptSourceId) -> bool;

    /// Read the enable state of the specified interrupt source.
    fn is_interrupt_source_enabled(source: InterruptSourceId) -> bool;

    /// Read the pending flag of the specified interrupt source.
    fn is_interrupt_pending(source: InterruptSourceId) -> bool;

    /// Raise or restore the core-wide interrupt lock level.
    unsafe fn set_interrupt_lock_level(level: InterruptLockLevel);

    /// Read the current core-wide interrupt lock level.
    fn interrupt_lock_level() -> InterruptLockLevel;
}

/// The interrupt lock disciplines a core can be placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLockLevel {
    /// No interrupts are locked.
    None,
    /// Category-2 (kernel-managed) interrupts are locked.
    Cat2,
    /// All maskable interrupts are locked.
    All,
}

impl Init for InterruptLockLevel {
    const INIT: Self = Self::None;
}

/// Implemented by a port. Hardware timer channels backing the counter engine
/// and the timing-protection engine.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel, with CPU Lock
/// active.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortTimer: KernelCfg1 {
    /// Read the current value of a free-running timer.
    unsafe fn frt_now(timer: HwTimerId) -> TickType;

    /// Program the compare register of a free-running timer.
    unsafe fn frt_set_compare(timer: HwTimerId, value: TickType);

    /// Trigger the timer's interrupt from software, if the hardware supports
    /// it. Returns `false` if it doesn't.
    unsafe fn frt_trigger(timer: HwTimerId) -> bool;

    /// Acknowledge a timer interrupt.
    unsafe fn timer_ack(timer: HwTimerId);
}

/// Implemented by a port. Multi-core control: core identification, core
/// start-up, inter-processor signalling and the boot barrier registers.
///
/// # Safety
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortCores: KernelCfg1 {
    /// Return the id of the calling core.
    fn core_id() -> CoreId;

    /// Release the specified core from reset. The core will enter
    /// [`PortToKernel::boot`].
    unsafe fn start_core(core: CoreId);

    /// Pend the cross-core signal interrupt on the specified core.
    unsafe fn pend_xsig(core: CoreId);

    /// Write the boot-barrier mailbox of the specified core. Slaves post
    /// their arrival into their own mailbox; the hardware-init core posts
    /// the release pattern into each slave's mailbox.
    unsafe fn barrier_write(core: CoreId, pattern: BootPattern);

    /// Read the boot-barrier mailbox of the specified core.
    fn barrier_read(core: CoreId) -> BootPattern;

    /// Perform the one-time peripheral bring-up. Called exactly once, on the
    /// designated hardware-init core.
    unsafe fn init_hardware();

    /// Halt the calling core. Called at the end of a shutdown.
    unsafe fn halt() -> !;
}

/// Associates a system type with the generated descriptor tables.
///
/// # Safety
///
/// This is only intended to be implemented by the configuration generator.
/// The tables must be mutually consistent (every id stored in a descriptor
/// must be in range, ceilings must cover the priorities of all users, deque
/// capacities must match the activation bounds, …) - the kernel relies on
/// this without checking.
pub unsafe trait KernelCfg2:
    PortThreading + PortInterrupts + PortTimer + PortCores + Sized
{
    /// The per-priority ready queue storage. The capacity is sized by the
    /// generator for the worst case of the whole system.
    type ReadyDeque: DequeLike<TaskRef<Self>>;

    /// The job queue storage shared by all counters.
    type JobHeap: VecLike<Element = JobNode<Self>> + fmt::Debug;

    const HOOKS: Hooks;

    /// The id of the core performing the one-time hardware initialization.
    const HW_INIT_CORE: CoreId = 0;

    fn task_cb_pool() -> &'static [TaskCb<Self>];
    fn isr_cb_pool() -> &'static [IsrCb<Self>];
    fn counter_cb_pool() -> &'static [CounterCb<Self>];
    fn alarm_cb_pool() -> &'static [AlarmCb<Self>];
    fn schedule_table_cb_pool() -> &'static [ScheduleTableCb<Self>];
    fn resource_cb_pool() -> &'static [ResourceCb<Self>];
    fn spinlock_cb_pool() -> &'static [SpinlockCb<Self>];
    fn app_cb_pool() -> &'static [AppCb<Self>];
    fn core_cb_pool() -> &'static [CoreCb<Self>];
    fn trusted_fn_pool() -> &'static [TrustedFnAttr];

    /// The cross-core request channel from `sender` to `receiver`.
    /// `sender != receiver`.
    fn xsig_channel(sender: CoreId, receiver: CoreId) -> &'static XSigChannel<Self>;

    /// Access the kernel's residual global state.
    fn state() -> &'static State<Self>;

    #[inline(always)]
    fn get_task_cb(i: TaskId) -> Option<&'static TaskCb<Self>> {
        Self::task_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_isr_cb(i: IsrId) -> Option<&'static IsrCb<Self>> {
        Self::isr_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_counter_cb(i: CounterId) -> Option<&'static CounterCb<Self>> {
        Self::counter_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_alarm_cb(i: AlarmId) -> Option<&'static AlarmCb<Self>> {
        Self::alarm_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_schedule_table_cb(i: ScheduleTableId) -> Option<&'static ScheduleTableCb<Self>> {
        Self::schedule_table_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_resource_cb(i: ResourceId) -> Option<&'static ResourceCb<Self>> {
        Self::resource_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_spinlock_cb(i: SpinlockId) -> Option<&'static SpinlockCb<Self>> {
        Self::spinlock_cb_pool().get(i)
    }

    #[inline(always)]
    fn get_app_cb(i: AppId) -> Option<&'static AppCb<Self>> {
        Self::app_cb_pool().get(i)
    }

    /// Get the calling core's control block.
    #[inline(always)]
    fn local_core_cb() -> &'static CoreCb<Self> {
        &Self::core_cb_pool()[Self::core_id()]
    }
}

/// The combination of traits the kernel code is generic over. Automatically
/// implemented on system types with sufficient trait `impl`s.
pub trait KernelTraits: KernelCfg2 {}
impl<T: KernelCfg2> KernelTraits for T {}

// Global and per-core kernel state
// ---------------------------------------------------------------------------

/// *Core control block* - the per-core portion of the kernel state.
///
/// One instance per core, constructed by the generator. Everything in here
/// except `core_state` is core-local and only touched by the owning core
/// (with CPU Lock active).
pub struct CoreCb<Traits: KernelTraits> {
    pub id: CoreId,

    /// The scheduler of this core.
    pub sched: SchedulerCb<Traits>,

    /// The timing-protection engine of this core.
    pub tp: tp::TpCoreCb<Traits>,

    /// The thread currently in control of this core.
    pub current_thread: klock::CpuLockCell<Traits, ThreadRef<Traits>>,

    /// The contexts displaced by nested ISRs and hooks, innermost last.
    pub thread_stack:
        klock::CpuLockCell<Traits, arrayvec::ArrayVec<ThreadRef<Traits>, THREAD_STACK_CAP>>,

    /// Core lifecycle state. Written by the master during `StartCore`, read
    /// cross-core, hence atomic.
    pub core_state: core::sync::atomic::AtomicUsize,

    /// OS lifecycle state of this core.
    pub os_state: klock::CpuLockCell<Traits, OsState>,

    /// Reentrant critical-user-section counter.
    pub critical_user_section: klock::CpuLockCell<Traits, u32>,

    /// `true` while the error hook is running on this core.
    pub in_error_hook: klock::CpuLockCell<Traits, bool>,

    /// The most recent error captured for `OsGetLastError`.
    pub last_error: klock::CpuLockCell<Traits, Option<LastError>>,

    /// The idle behavior selected by `ControlIdle`. Atomic because the
    /// service may address any core.
    pub idle_mode: core::sync::atomic::AtomicUsize,

    /// Interrupt-suspension nesting of this core
    /// (`SuspendAllInterrupts` / `SuspendOSInterrupts`).
    pub int_api_state: IntApiState,

    /// The rank of the highest-ranked spinlock held by this core, and the
    /// head of the LIFO of held spinlocks.
    pub last_spinlock: klock::CpuLockCell<Traits, Option<&'static SpinlockCb<Traits>>>,
}

impl<Traits: KernelTraits> CoreCb<Traits> {
    pub const fn new(
        id: CoreId,
        queues: &'static [klock::CpuLockCell<Traits, Traits::ReadyDeque>],
        idle_task: TaskRef<Traits>,
        tp_timer: HwTimerId,
    ) -> Self {
        Self {
            id,
            sched: SchedulerCb::new(queues, idle_task),
            tp: TpCoreCb::new(tp_timer),
            current_thread: klock::CpuLockCell::new(ThreadRef::Task(idle_task)),
            thread_stack: klock::CpuLockCell::new(arrayvec::ArrayVec::new_const()),
            core_state: core::sync::atomic::AtomicUsize::new(0),
            os_state: klock::CpuLockCell::new(OsState::Init),
            critical_user_section: klock::CpuLockCell::new(0),
            in_error_hook: klock::CpuLockCell::new(false),
            last_error: klock::CpuLockCell::new(None),
            idle_mode: core::sync::atomic::AtomicUsize::new(0),
            int_api_state: IntApiState::new(),
            last_spinlock: klock::CpuLockCell::new(None),
        }
    }
}

/// Global kernel state: the few pieces shared between cores. Everything here
/// is atomic.
pub struct State<Traits> {
    /// The number of cores activated as AUTOSAR cores.
    pub(crate) activated_cores: core::sync::atomic::AtomicUsize,

    /// Rendezvous counter for `ShutdownAllCores`.
    pub(crate) shutdown_barrier: core::sync::atomic::AtomicUsize,

    /// `1 + ErrorCode` of a system shutdown in progress, `0` otherwise.
    pub(crate) shutdown_code: core::sync::atomic::AtomicUsize,

    /// The application mode selected by the master core's `StartOS` call.
    pub(crate) app_mode: core::sync::atomic::AtomicUsize,

    _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits> Init for State<Traits> {
    const INIT: Self = Self {
        activated_cores: Init::INIT,
        shutdown_barrier: Init::INIT,
        shutdown_code: Init::INIT,
        app_mode: Init::INIT,
        _phantom: core::marker::PhantomData,
    };
}

impl<Traits> State<Traits> {
    pub const fn new() -> Self {
        Init::INIT
    }
}

impl<Traits> Default for State<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

// Public service interface
// ---------------------------------------------------------------------------

/// Provides access to the global service functions exposed by the kernel.
///
/// This trait is automatically implemented on system types that have
/// sufficient trait `impl`s to instantiate the kernel.
pub trait Kernel: KernelTraits {
    // Task services
    fn activate_task(task: TaskId) -> Result<(), ActivateTaskError>;
    fn terminate_task() -> Result<(), TerminateTaskError>;
    fn chain_task(task: TaskId) -> Result<(), ChainTaskError>;
    fn schedule() -> Result<(), ScheduleError>;
    fn get_task_id() -> TaskId;
    fn get_task_state(task: TaskId) -> Result<TaskSt, GetTaskStateError>;

    // Event services
    fn set_event(task: TaskId, mask: EventMask) -> Result<(), SetEventError>;
    fn clear_event(mask: EventMask) -> Result<(), ClearEventError>;
    fn get_event(task: TaskId) -> Result<EventMask, GetEventError>;
    fn wait_event(mask: EventMask) -> Result<(), WaitEventError>;

    // Interrupt services
    fn get_isr_id() -> IsrId;
    fn enable_interrupt_source(isr: IsrId, clear_pending: bool)
        -> Result<(), InterruptSourceError>;
    fn disable_interrupt_source(isr: IsrId) -> Result<(), InterruptSourceError>;
    fn clear_pending_interrupt(isr: IsrId) -> Result<(), InterruptSourceError>;
    fn is_interrupt_source_enabled(isr: IsrId) -> Result<bool, InterruptSourceError>;
    fn is_interrupt_pending(isr: IsrId) -> Result<bool, InterruptSourceError>;
    fn disable_all_interrupts();
    fn enable_all_interrupts();
    fn suspend_all_interrupts();
    fn resume_all_interrupts();
    fn suspend_os_interrupts();
    fn resume_os_interrupts();

    // Resource services
    fn get_resource(resource: ResourceId) -> Result<(), GetResourceError>;
    fn release_resource(resource: ResourceId) -> Result<(), ReleaseResourceError>;

    // Spinlock services
    fn get_spinlock(spinlock: SpinlockId) -> Result<(), GetSpinlockError>;
    fn try_to_get_spinlock(spinlock: SpinlockId) -> Result<bool, GetSpinlockError>;
    fn release_spinlock(spinlock: SpinlockId) -> Result<(), ReleaseSpinlockError>;

    // Counter services
    fn increment_counter(counter: CounterId) -> Result<(), IncrementCounterError>;
    fn get_counter_value(counter: CounterId) -> Result<TickType, GetCounterValueError>;
    fn get_elapsed_value(
        counter: CounterId,
        previous: TickType,
    ) -> Result<(TickType, TickType), GetElapsedValueError>;

    // Alarm services
    fn get_alarm_base(alarm: AlarmId) -> Result<AlarmBase, GetAlarmBaseError>;
    fn get_alarm(alarm: AlarmId) -> Result<TickType, GetAlarmError>;
    fn set_rel_alarm(alarm: AlarmId, offset: TickType, cycle: TickType)
        -> Result<(), SetAlarmError>;
    fn set_abs_alarm(alarm: AlarmId, start: TickType, cycle: TickType)
        -> Result<(), SetAlarmError>;
    fn cancel_alarm(alarm: AlarmId) -> Result<(), CancelAlarmError>;

    // Schedule table services
    fn start_schedule_table_rel(
        table: ScheduleTableId,
        offset: TickType,
    ) -> Result<(), StartScheduleTableError>;
    fn start_schedule_table_abs(
        table: ScheduleTableId,
        start: TickType,
    ) -> Result<(), StartScheduleTableError>;
    fn stop_schedule_table(table: ScheduleTableId) -> Result<(), StopScheduleTableError>;
    fn next_schedule_table(
        from: ScheduleTableId,
        to: ScheduleTableId,
    ) -> Result<(), NextScheduleTableError>;
    fn sync_schedule_table(
        table: ScheduleTableId,
        global_time: TickType,
    ) -> Result<(), SyncScheduleTableError>;
    fn set_schedule_table_async(table: ScheduleTableId)
        -> Result<(), SetScheduleTableAsyncError>;
    fn get_schedule_table_status(
        table: ScheduleTableId,
    ) -> Result<ScheduleTableState, GetScheduleTableStatusError>;

    // Application services
    fn get_application_id() -> AppId;
    fn check_object_access(
        app: AppId,
        object: ObjectType,
        id: usize,
    ) -> Result<bool, CheckObjectError>;
    fn check_object_ownership(object: ObjectType, id: usize) -> Result<AppId, CheckObjectError>;
    fn terminate_application(app: AppId, restart: bool)
        -> Result<(), TerminateApplicationError>;
    fn allow_access() -> Result<(), AllowAccessError>;

    // Core and system services
    fn start_core(core: CoreId) -> Result<(), StartCoreError>;
    fn start_non_autosar_core(core: CoreId) -> Result<(), StartCoreError>;
    fn get_core_id() -> CoreId;
    fn get_number_of_activated_cores() -> usize;
    unsafe fn start_os(mode: AppMode) -> !;
    fn shutdown_os(code: ErrorCode) -> !;
    fn shutdown_all_cores(code: ErrorCode) -> !;
    fn get_active_application_mode() -> AppMode;
    fn control_idle(core: CoreId, mode: IdleMode) -> Result<(), ControlIdleError>;

    // Trusted function services
    fn call_trusted_function(id: TrustedFnId, param: usize)
        -> Result<(), CallTrustedFunctionError>;
    fn call_non_trusted_function(
        id: TrustedFnId,
        param: usize,
    ) -> Result<(), CallTrustedFunctionError>;

    /// Retrieve the last error record captured on the calling core.
    fn get_last_error() -> Option<LastError>;
}

impl<T: KernelTraits> Kernel for T {
    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn activate_task(task: TaskId) -> Result<(), ActivateTaskError> {
        hook::report::<T, _, _>(ServiceId::ActivateTask, task::activate_task::<T>(task))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn terminate_task() -> Result<(), TerminateTaskError> {
        hook::report::<T, _, _>(ServiceId::TerminateTask, task::terminate_task::<T>())
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn chain_task(task: TaskId) -> Result<(), ChainTaskError> {
        hook::report::<T, _, _>(ServiceId::ChainTask, task::chain_task::<T>(task))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn schedule() -> Result<(), ScheduleError> {
        hook::report::<T, _, _>(ServiceId::Schedule, task::schedule_api::<T>())
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_task_id() -> TaskId {
        task::get_task_id::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_task_state(task: TaskId) -> Result<TaskSt, GetTaskStateError> {
        hook::report::<T, _, _>(ServiceId::GetTaskState, task::get_task_state::<T>(task))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn set_event(task: TaskId, mask: EventMask) -> Result<(), SetEventError> {
        hook::report::<T, _, _>(ServiceId::SetEvent, event::set_event::<T>(task, mask))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn clear_event(mask: EventMask) -> Result<(), ClearEventError> {
        hook::report::<T, _, _>(ServiceId::ClearEvent, event::clear_event::<T>(mask))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_event(task: TaskId) -> Result<EventMask, GetEventError> {
        hook::report::<T, _, _>(ServiceId::GetEvent, event::get_event::<T>(task))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn wait_event(mask: EventMask) -> Result<(), WaitEventError> {
        hook::report::<T, _, _>(ServiceId::WaitEvent, event::wait_event::<T>(mask))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_isr_id() -> IsrId {
        isr::get_isr_id::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn enable_interrupt_source(
        isr: IsrId,
        clear_pending: bool,
    ) -> Result<(), InterruptSourceError> {
        hook::report::<T, _, _>(
            ServiceId::EnableInterruptSource,
            isr::enable_interrupt_source::<T>(isr, clear_pending),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn disable_interrupt_source(isr: IsrId) -> Result<(), InterruptSourceError> {
        hook::report::<T, _, _>(
            ServiceId::DisableInterruptSource,
            isr::disable_interrupt_source::<T>(isr),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn clear_pending_interrupt(isr: IsrId) -> Result<(), InterruptSourceError> {
        hook::report::<T, _, _>(
            ServiceId::ClearPendingInterrupt,
            isr::clear_pending_interrupt::<T>(isr),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn is_interrupt_source_enabled(isr: IsrId) -> Result<bool, InterruptSourceError> {
        hook::report::<T, _, _>(
            ServiceId::IsInterruptSourceEnabled,
            isr::is_interrupt_source_enabled::<T>(isr),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn is_interrupt_pending(isr: IsrId) -> Result<bool, InterruptSourceError> {
        hook::report::<T, _, _>(
            ServiceId::IsInterruptPending,
            isr::is_interrupt_pending::<T>(isr),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn disable_all_interrupts() {
        isr::disable_all_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn enable_all_interrupts() {
        isr::enable_all_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn suspend_all_interrupts() {
        isr::suspend_all_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn resume_all_interrupts() {
        isr::resume_all_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn suspend_os_interrupts() {
        isr::suspend_os_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn resume_os_interrupts() {
        isr::resume_os_interrupts::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_resource(resource: ResourceId) -> Result<(), GetResourceError> {
        hook::report::<T, _, _>(ServiceId::GetResource, resource::get_resource::<T>(resource))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn release_resource(resource: ResourceId) -> Result<(), ReleaseResourceError> {
        hook::report::<T, _, _>(
            ServiceId::ReleaseResource,
            resource::release_resource::<T>(resource),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_spinlock(spinlock: SpinlockId) -> Result<(), GetSpinlockError> {
        hook::report::<T, _, _>(ServiceId::GetSpinlock, spinlock::get_spinlock::<T>(spinlock))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn try_to_get_spinlock(spinlock: SpinlockId) -> Result<bool, GetSpinlockError> {
        hook::report::<T, _, _>(
            ServiceId::TryToGetSpinlock,
            spinlock::try_to_get_spinlock::<T>(spinlock),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn release_spinlock(spinlock: SpinlockId) -> Result<(), ReleaseSpinlockError> {
        hook::report::<T, _, _>(
            ServiceId::ReleaseSpinlock,
            spinlock::release_spinlock::<T>(spinlock),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn increment_counter(counter: CounterId) -> Result<(), IncrementCounterError> {
        hook::report::<T, _, _>(
            ServiceId::IncrementCounter,
            counter::increment_counter::<T>(counter),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_counter_value(counter: CounterId) -> Result<TickType, GetCounterValueError> {
        hook::report::<T, _, _>(
            ServiceId::GetCounterValue,
            counter::get_counter_value::<T>(counter),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_elapsed_value(
        counter: CounterId,
        previous: TickType,
    ) -> Result<(TickType, TickType), GetElapsedValueError> {
        hook::report::<T, _, _>(
            ServiceId::GetElapsedValue,
            counter::get_elapsed_value::<T>(counter, previous),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_alarm_base(alarm: AlarmId) -> Result<AlarmBase, GetAlarmBaseError> {
        hook::report::<T, _, _>(ServiceId::GetAlarmBase, alarm::get_alarm_base::<T>(alarm))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_alarm(alarm: AlarmId) -> Result<TickType, GetAlarmError> {
        hook::report::<T, _, _>(ServiceId::GetAlarm, alarm::get_alarm::<T>(alarm))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn set_rel_alarm(
        alarm: AlarmId,
        offset: TickType,
        cycle: TickType,
    ) -> Result<(), SetAlarmError> {
        hook::report::<T, _, _>(
            ServiceId::SetRelAlarm,
            alarm::set_rel_alarm::<T>(alarm, offset, cycle),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn set_abs_alarm(
        alarm: AlarmId,
        start: TickType,
        cycle: TickType,
    ) -> Result<(), SetAlarmError> {
        hook::report::<T, _, _>(
            ServiceId::SetAbsAlarm,
            alarm::set_abs_alarm::<T>(alarm, start, cycle),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn cancel_alarm(alarm: AlarmId) -> Result<(), CancelAlarmError> {
        hook::report::<T, _, _>(ServiceId::CancelAlarm, alarm::cancel_alarm::<T>(alarm))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn start_schedule_table_rel(
        table: ScheduleTableId,
        offset: TickType,
    ) -> Result<(), StartScheduleTableError> {
        hook::report::<T, _, _>(
            ServiceId::StartScheduleTableRel,
            schedule_table::start_rel::<T>(table, offset),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn start_schedule_table_abs(
        table: ScheduleTableId,
        start: TickType,
    ) -> Result<(), StartScheduleTableError> {
        hook::report::<T, _, _>(
            ServiceId::StartScheduleTableAbs,
            schedule_table::start_abs::<T>(table, start),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn stop_schedule_table(table: ScheduleTableId) -> Result<(), StopScheduleTableError> {
        hook::report::<T, _, _>(
            ServiceId::StopScheduleTable,
            schedule_table::stop::<T>(table),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn next_schedule_table(
        from: ScheduleTableId,
        to: ScheduleTableId,
    ) -> Result<(), NextScheduleTableError> {
        hook::report::<T, _, _>(
            ServiceId::NextScheduleTable,
            schedule_table::next::<T>(from, to),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn sync_schedule_table(
        table: ScheduleTableId,
        global_time: TickType,
    ) -> Result<(), SyncScheduleTableError> {
        hook::report::<T, _, _>(
            ServiceId::SyncScheduleTable,
            schedule_table::sync::<T>(table, global_time),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn set_schedule_table_async(
        table: ScheduleTableId,
    ) -> Result<(), SetScheduleTableAsyncError> {
        hook::report::<T, _, _>(
            ServiceId::SetScheduleTableAsync,
            schedule_table::set_async::<T>(table),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_schedule_table_status(
        table: ScheduleTableId,
    ) -> Result<ScheduleTableState, GetScheduleTableStatusError> {
        hook::report::<T, _, _>(
            ServiceId::GetScheduleTableStatus,
            schedule_table::get_status::<T>(table),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_application_id() -> AppId {
        app::get_application_id::<T>()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn check_object_access(
        app: AppId,
        object: ObjectType,
        id: usize,
    ) -> Result<bool, CheckObjectError> {
        hook::report::<T, _, _>(
            ServiceId::CheckObjectAccess,
            app::check_object_access::<T>(app, object, id),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn check_object_ownership(object: ObjectType, id: usize) -> Result<AppId, CheckObjectError> {
        hook::report::<T, _, _>(
            ServiceId::CheckObjectOwnership,
            app::check_object_ownership::<T>(object, id),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn terminate_application(
        app: AppId,
        restart: bool,
    ) -> Result<(), TerminateApplicationError> {
        hook::report::<T, _, _>(
            ServiceId::TerminateApplication,
            app::terminate_application::<T>(app, restart),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn allow_access() -> Result<(), AllowAccessError> {
        hook::report::<T, _, _>(ServiceId::AllowAccess, app::allow_access::<T>())
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn start_core(core: CoreId) -> Result<(), StartCoreError> {
        hook::report::<T, _, _>(ServiceId::StartCore, startup::start_core_api::<T>(core, true))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn start_non_autosar_core(core: CoreId) -> Result<(), StartCoreError> {
        hook::report::<T, _, _>(
            ServiceId::StartNonAutosarCore,
            startup::start_core_api::<T>(core, false),
        )
    }

    #[inline]
    fn get_core_id() -> CoreId {
        T::core_id()
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_number_of_activated_cores() -> usize {
        T::state()
            .activated_cores
            .load(core::sync::atomic::Ordering::Acquire)
    }

    unsafe fn start_os(mode: AppMode) -> ! {
        // Safety: forwarded precondition
        unsafe { startup::start_os::<T>(mode) }
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn shutdown_os(code: ErrorCode) -> ! {
        startup::shutdown_os::<T>(code)
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn shutdown_all_cores(code: ErrorCode) -> ! {
        startup::shutdown_all_cores::<T>(code)
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_active_application_mode() -> AppMode {
        T::state()
            .app_mode
            .load(core::sync::atomic::Ordering::Acquire)
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn control_idle(core: CoreId, mode: IdleMode) -> Result<(), ControlIdleError> {
        hook::report::<T, _, _>(ServiceId::ControlIdle, startup::control_idle::<T>(core, mode))
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn call_trusted_function(
        id: TrustedFnId,
        param: usize,
    ) -> Result<(), CallTrustedFunctionError> {
        hook::report::<T, _, _>(
            ServiceId::CallTrustedFunction,
            service::call_trusted_function::<T>(id, param, true),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn call_non_trusted_function(
        id: TrustedFnId,
        param: usize,
    ) -> Result<(), CallTrustedFunctionError> {
        hook::report::<T, _, _>(
            ServiceId::CallNonTrustedFunction,
            service::call_trusted_function::<T>(id, param, false),
        )
    }

    #[cfg_attr(not(feature = "inline_syscall"), inline(never))]
    fn get_last_error() -> Option<LastError> {
        hook::get_last_error::<T>()
    }
}

// Port-side entry points
// ---------------------------------------------------------------------------

/// Methods intended to be called by a port.
///
/// # Safety
///
/// These are only meant to be called by the port, from the contexts stated
/// on each method.
#[allow(clippy::missing_safety_doc)]
pub trait PortToKernel {
    /// Initialize the calling core's runtime structures and dispatch the
    /// first task. Called by the port's reset handler on every core.
    ///
    /// Precondition: CPU Lock active, boot phase
    unsafe fn boot() -> !;

    /// Determine the next task to run and commit it as the current task.
    ///
    /// Precondition: CPU Lock active / Postcondition: CPU Lock active
    unsafe fn choose_running_task();

    /// Announce a tick or compare match of the hardware timer backing the
    /// specified counter.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn counter_tick(counter: CounterId);

    /// Enter the specified category-2 ISR. Called by the first-level
    /// interrupt handler with interrupts masked (CPU Lock active). Returns
    /// `false` when the invocation was dropped by the inter-arrival check;
    /// the handler must then skip the ISR body and [`Self::isr_exit`].
    unsafe fn isr_entry(isr: IsrId) -> bool;

    /// Leave the innermost category-2 ISR. Called with interrupts masked
    /// (CPU Lock active) after the ISR body. Returns `true` when the handler
    /// returns to task level and must run the dispatcher.
    unsafe fn isr_exit() -> bool;

    /// The timing-protection timer of the calling core expired.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn tp_timer_expired();

    /// The cross-core signal interrupt of the calling core fired.
    ///
    /// Precondition: CPU Lock inactive, interrupt context
    unsafe fn xsig_received();
}

impl<T: KernelTraits> PortToKernel for T {
    unsafe fn boot() -> ! {
        // Safety: forwarded precondition
        unsafe { startup::boot::<T>() }
    }

    unsafe fn choose_running_task() {
        // Safety: The precondition of this method includes CPU Lock being
        // active
        let mut lock = unsafe { klock::assume_cpu_lock::<T>() };

        sched::commit_next_task(lock.borrow_mut());

        // Post-condition: CPU Lock active
        core::mem::forget(lock);
    }

    unsafe fn counter_tick(counter: CounterId) {
        counter::handle_tick::<T>(counter);
    }

    unsafe fn isr_entry(isr: IsrId) -> bool {
        // Safety: forwarded precondition
        unsafe { isr::isr_run::<T>(isr) }
    }

    unsafe fn isr_exit() -> bool {
        // Safety: forwarded precondition
        unsafe { isr::isr_epilogue::<T>() }
    }

    unsafe fn tp_timer_expired() {
        tp::timer_expired::<T>();
    }

    unsafe fn xsig_received() {
        xsig::drain::<T>();
    }
}
