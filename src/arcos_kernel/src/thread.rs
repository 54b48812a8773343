//! Threads
//!
//! A *thread* is anything that can be in control of a core: a task, a
//! category-2 ISR, or a hook routine. The kernel keeps the current thread of
//! every core plus a bounded stack of the threads displaced by nested ISRs
//! and hooks.
use core::fmt;

use crate::{
    app::AppCb, error::BadContextError, isr::IsrCb, klock, task::TaskRef, AppId, KernelTraits,
    PortThreading, HOOK_NESTING_HEADROOM,
};

/// The kind of hook routine occupying a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Startup,
    Shutdown,
    Error,
    Protection,
    AppStartup(AppId),
    AppShutdown(AppId),
    AppError(AppId),
}

/// The kernel-visible context of a runnable entity.
pub enum ThreadRef<Traits: PortThreading> {
    Task(TaskRef<Traits>),
    Isr(&'static IsrCb<Traits>),
    Hook(HookKind),
}

impl<Traits: PortThreading> Clone for ThreadRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for ThreadRef<Traits> {}

impl<Traits: PortThreading> PartialEq for ThreadRef<Traits> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Task(x), Self::Task(y)) => x == y,
            (Self::Isr(x), Self::Isr(y)) => core::ptr::eq(*x, *y),
            (Self::Hook(x), Self::Hook(y)) => x == y,
            _ => false,
        }
    }
}
impl<Traits: PortThreading> Eq for ThreadRef<Traits> {}

impl<Traits: PortThreading> fmt::Debug for ThreadRef<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Task(x) => f.debug_tuple("Task").field(x).finish(),
            Self::Isr(x) => f.debug_tuple("Isr").field(&(*x as *const _)).finish(),
            Self::Hook(x) => f.debug_tuple("Hook").field(x).finish(),
        }
    }
}

/// If the current context is not a task context, return `Err(CallLevel)`.
pub(crate) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::CallLevel)
    } else {
        Ok(())
    }
}

/// Get the thread currently in control of the calling core.
pub(crate) fn current_thread<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> ThreadRef<Traits> {
    Traits::local_core_cb().current_thread.get(&*lock)
}

/// Push the current thread onto the interrupted-thread stack and make
/// `incoming` current. Panics when the configured nesting bound is exceeded.
pub(crate) fn push_interrupted<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    incoming: ThreadRef<Traits>,
) {
    let core = Traits::local_core_cb();
    let outgoing = core.current_thread.get(&*lock);

    let stack = core.thread_stack.write(&mut *lock);
    assert!(
        stack.len() < Traits::ISR_NESTING_LIMIT + HOOK_NESTING_HEADROOM,
        "thread nesting limit exceeded"
    );
    stack.push(outgoing);

    core.current_thread.replace(&mut *lock, incoming);
}

/// Pop the interrupted-thread stack, restoring the displaced thread as
/// current. Returns the restored thread.
pub(crate) fn pop_interrupted<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> ThreadRef<Traits> {
    let core = Traits::local_core_cb();
    let restored = core
        .thread_stack
        .write(&mut *lock)
        .pop()
        .expect("interrupted-thread stack is empty");
    core.current_thread.replace(&mut *lock, restored);
    restored
}

/// Scan the current thread and the interrupted-thread stack, innermost
/// first, for the innermost ISR context. Used by `GetISRID`.
pub(crate) fn innermost_isr<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<&'static IsrCb<Traits>> {
    let core = Traits::local_core_cb();
    if let ThreadRef::Isr(isr_cb) = core.current_thread.get(&*lock) {
        return Some(isr_cb);
    }
    let stack = core.thread_stack.read(&*lock);
    stack.iter().rev().find_map(|thread| match thread {
        ThreadRef::Isr(isr_cb) => Some(*isr_cb),
        _ => None,
    })
}

/// The OS-Application the current thread belongs to. `None` in a plain hook
/// context, which acts with kernel rights.
pub(crate) fn current_app<Traits: KernelTraits>(
    lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> Option<&'static AppCb<Traits>> {
    let app_id = match Traits::local_core_cb().current_thread.get(&*lock) {
        ThreadRef::Task(task) => task.0.attr.app,
        ThreadRef::Isr(isr_cb) => isr_cb.attr.app,
        ThreadRef::Hook(
            HookKind::AppStartup(app) | HookKind::AppShutdown(app) | HookKind::AppError(app),
        ) => app,
        ThreadRef::Hook(_) => return None,
    };
    Traits::get_app_cb(app_id)
}
