//! XSignal - cross-core request channels
//!
//! One single-producer single-consumer ring per (sender, receiver) pair.
//! The producer writes the payload slot first and then publishes the write
//! index with a release store; the consumer observes the index with an
//! acquire load before touching the payload. Per-sender FIFO order to each
//! receiver follows from the ring discipline.
//!
//! Capacity is a static invariant established by the generator from the
//! worst-case number of outstanding requests; overflow means the generated
//! tables are malformed, which is a kernel panic condition.
use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alarm, app, error::*, event, hook, klock, startup, task, AlarmId, AppId, CoreId, EventMask,
    KernelTraits, ServiceId, TaskId, TickType,
};

/// A request executed on the target core.
#[derive(Debug, Clone, Copy)]
pub(crate) enum XSigRequest {
    ActivateTask(TaskId),
    SetEvent(TaskId, EventMask),
    SetRelAlarm(AlarmId, TickType, TickType),
    SetAbsAlarm(AlarmId, TickType, TickType),
    CancelAlarm(AlarmId),
    TerminateApplication(AppId, bool),
    /// Local shutdown, part of `ShutdownAllCores`.
    Shutdown(ErrorCode),
}

/// A payload slot of a channel.
pub struct XSigSlot(UnsafeCell<XSigRequest>);

// Safety: slots are accessed under the SPSC index protocol - the producer
// writes a slot strictly before publishing its index, the consumer reads it
// strictly after observing the index
unsafe impl Sync for XSigSlot {}

impl XSigSlot {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self(UnsafeCell::new(XSigRequest::ActivateTask(0)))
    }
}

impl crate::utils::Init for XSigSlot {
    const INIT: Self = Self::new();
}

/// A single-producer single-consumer request channel.
pub struct XSigChannel<Traits> {
    pub slots: &'static [XSigSlot],

    /// Number of requests ever published. Written by the sender only.
    pub write_idx: AtomicUsize,

    /// Number of requests ever consumed. Written by the receiver only.
    pub read_idx: AtomicUsize,

    pub _phantom: core::marker::PhantomData<Traits>,
}

impl<Traits> XSigChannel<Traits> {
    pub const fn new(slots: &'static [XSigSlot]) -> Self {
        Self {
            slots,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            _phantom: core::marker::PhantomData,
        }
    }
}

impl<Traits> fmt::Debug for XSigChannel<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("XSigChannel")
            .field("write_idx", &self.write_idx)
            .field("read_idx", &self.read_idx)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

/// Post a request to the given core and pend its cross-core signal. The
/// caller returns as soon as the mailbox write is published.
pub(crate) fn send<Traits: KernelTraits>(
    _lock: klock::CpuLockTokenRefMut<'_, Traits>,
    receiver: CoreId,
    request: XSigRequest,
) -> Result<(), BadCoreError> {
    let sender = Traits::core_id();
    debug_assert_ne!(sender, receiver);

    if receiver >= Traits::CORE_COUNT
        || startup::core_state::<Traits>(receiver) == startup::CoreState::Inactive
    {
        return Err(BadCoreError::Core);
    }

    let channel = Traits::xsig_channel(sender, receiver);
    let write = channel.write_idx.load(Ordering::Relaxed);
    let read = channel.read_idx.load(Ordering::Acquire);
    assert!(
        write.wrapping_sub(read) < channel.slots.len(),
        "xsignal channel overflow"
    );

    // Safety: SPSC - this core is the only producer, and the slot at
    // `write` is not visible to the consumer until the index is published
    unsafe {
        *channel.slots[write % channel.slots.len()].0.get() = request;
    }
    channel.write_idx.store(write.wrapping_add(1), Ordering::Release);

    // Safety: the kernel controls the cross-core signal
    unsafe { Traits::pend_xsig(receiver) };
    Ok(())
}

/// Drain every incoming channel of the calling core. Entered from the
/// cross-core signal interrupt.
pub(crate) fn drain<Traits: KernelTraits>() {
    let mut lock = klock::lock_cpu::<Traits>().unwrap();
    let receiver = Traits::core_id();

    for sender in 0..Traits::CORE_COUNT {
        if sender == receiver {
            continue;
        }
        let channel = Traits::xsig_channel(sender, receiver);

        loop {
            let read = channel.read_idx.load(Ordering::Relaxed);
            let write = channel.write_idx.load(Ordering::Acquire);
            if read == write {
                break;
            }

            // Safety: SPSC - the producer published this slot before the
            // index we just observed
            let request = unsafe { *channel.slots[read % channel.slots.len()].0.get() };
            channel.read_idx.store(read.wrapping_add(1), Ordering::Release);

            execute::<Traits>(lock.borrow_mut(), request);
        }
    }

    task::task_unlock_cpu_and_check_preemption(lock);
}

/// Execute one request on the receiving core. Failures are reported to the
/// local error hook; the sender has already returned.
fn execute<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    request: XSigRequest,
) {
    match request {
        XSigRequest::ActivateTask(task_id) => {
            let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                return;
            };
            if let Err(e) = task::activate_local(lock.borrow_mut(), task::TaskRef(task_cb)) {
                hook::call_error_hook::<Traits>(
                    lock.borrow_mut(),
                    ServiceId::ActivateTask,
                    e.into(),
                );
            }
        }
        XSigRequest::SetEvent(task_id, mask) => {
            let Ok(task_cb) = task::task_cb::<Traits>(task_id) else {
                return;
            };
            if let Err(e) =
                event::set_event_local(lock.borrow_mut(), task::TaskRef(task_cb), mask)
            {
                hook::call_error_hook::<Traits>(lock.borrow_mut(), ServiceId::SetEvent, e.into());
            }
        }
        XSigRequest::SetRelAlarm(alarm_id, offset, cycle) => {
            let Ok(alarm_cb) = alarm::alarm_cb::<Traits>(alarm_id) else {
                return;
            };
            if let Err(e) = alarm::set_rel_local(lock.borrow_mut(), alarm_cb, offset, cycle) {
                hook::call_error_hook::<Traits>(lock.borrow_mut(), ServiceId::SetRelAlarm, e.into());
            }
        }
        XSigRequest::SetAbsAlarm(alarm_id, start, cycle) => {
            let Ok(alarm_cb) = alarm::alarm_cb::<Traits>(alarm_id) else {
                return;
            };
            if let Err(e) = alarm::set_abs_local(lock.borrow_mut(), alarm_cb, start, cycle) {
                hook::call_error_hook::<Traits>(lock.borrow_mut(), ServiceId::SetAbsAlarm, e.into());
            }
        }
        XSigRequest::CancelAlarm(alarm_id) => {
            let Ok(alarm_cb) = alarm::alarm_cb::<Traits>(alarm_id) else {
                return;
            };
            if let Err(e) = alarm::cancel_local(lock.borrow_mut(), alarm_cb) {
                hook::call_error_hook::<Traits>(lock.borrow_mut(), ServiceId::CancelAlarm, e.into());
            }
        }
        XSigRequest::TerminateApplication(app_id, restart) => {
            let Ok(app_cb) = app::app_cb::<Traits>(app_id) else {
                return;
            };
            // The killed tasks belong to this core; the interrupted context
            // is unwound through the dispatcher after the drain
            app::terminate_application_local(lock.borrow_mut(), app_cb, restart);
        }
        XSigRequest::Shutdown(code) => {
            startup::shutdown_local::<Traits>(lock.borrow_mut(), code, false);
        }
    }
}
