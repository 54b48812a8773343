//! Trusted function calls
//!
//! A trusted function is a statically registered entry into privileged
//! code. Functions marked delayed-violation raise the caller's
//! timing-protection delay level for their duration; a budget violation
//! occurring inside is recorded and re-raised on return.
use core::fmt;

use crate::{error::*, klock, tp, KernelTraits, TrustedFnId};

/// The static descriptor of a trusted function.
#[derive(Clone, Copy)]
pub struct TrustedFnAttr {
    pub function: fn(usize),

    /// Defer timing-protection violations while the function executes.
    pub delay_violation: bool,

    /// `false` restricts the function to `CallNonTrustedFunction`.
    pub trusted: bool,
}

impl fmt::Debug for TrustedFnAttr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrustedFnAttr")
            .field("delay_violation", &self.delay_violation)
            .field("trusted", &self.trusted)
            .finish()
    }
}

/// Implements `CallTrustedFunction` (`trusted == true`) and
/// `CallNonTrustedFunction` (`trusted == false`).
pub(crate) fn call_trusted_function<Traits: KernelTraits>(
    id: TrustedFnId,
    param: usize,
    trusted: bool,
) -> Result<(), CallTrustedFunctionError> {
    let attr = *Traits::trusted_fn_pool()
        .get(id)
        .ok_or(BadIdError::Id)?;

    if attr.trusted != trusted {
        return Err(CallTrustedFunctionError::Id);
    }

    let delay = attr.delay_violation && trusted;

    if delay {
        let mut lock = klock::lock_cpu::<Traits>()?;
        tp::enter_delay_level(lock.borrow_mut());
    }

    // The function body runs like its caller, interrupts enabled
    (attr.function)(param);

    if delay {
        let mut lock = klock::lock_cpu::<Traits>()?;
        tp::leave_delay_level(lock.borrow_mut());
    }

    Ok(())
}
