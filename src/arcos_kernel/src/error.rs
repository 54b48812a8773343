//! Status codes and per-service error types
//!
//! Every service returns a `Result` whose error type enumerates exactly the
//! status codes that service can produce. All of them convert into
//! [`ErrorCode`], the wire-level status code captured by the error record and
//! passed to the error hook.
use core::fmt;

/// The status code of a failed (or successful) service call.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ErrorCode {
    Ok = 0,
    /// The caller is not allowed to access the object, or the object is in an
    /// inaccessible application state.
    Access,
    /// The service was invoked from a forbidden call context.
    CallLevel,
    /// An object id is out of range or refers to the wrong kind of object.
    Id,
    /// Too many task activations.
    Limit,
    /// The addressed object is inactive (alarm/schedule table not running).
    NoFunc,
    /// A resource is still occupied, or a resource protocol was violated.
    Resource,
    /// The object is in a state incompatible with the service.
    State,
    /// A tick or mask parameter is out of range.
    Value,
    /// The caller's application does not own the addressed interrupt source.
    NotTheOwner,
    /// A spinlock is still occupied, or a spinlock protocol was violated.
    Spinlock,
    /// Interrupts are disabled while calling a service that forbids it.
    DisabledInt,
    /// Acquiring the spinlock could cause a cross-core deadlock.
    InterferenceDeadlock,
    /// Spinlock rank ordering or release ordering was violated.
    NestingError,
    /// The addressed core is out of range or in the wrong lifecycle state.
    Core,
    /// The hardware cannot clear the pending flag of this interrupt source.
    UnimplementedClearPending,
    /// A boolean parameter holds a value other than 0 or 1.
    ValueIsNotBoolean,
    /// Execution budget exhausted.
    ProtectionTime,
    /// Lock budget exhausted.
    ProtectionLocked,
    /// Inter-arrival time undercut.
    ProtectionArrival,
    /// Memory protection violation (reported by the HAL).
    ProtectionMemory,
    /// Unhandled trap or exception (reported by the HAL).
    ProtectionException,
}

macro_rules! define_error {
    (
        $( #[$meta:meta] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[$meta] )*
        #[repr(u8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ErrorCode::$Variant as u8 ),*
        }

        impl From<$Name> for ErrorCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ErrorCode::from(*self).fmt(f)
            }
        }
    };
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        define_error! {
            $( #[doc $( $doc )*] )*
            $vis enum $Name {
                $( $Variant, )*
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

// Per-service error types
// ---------------------------------------------------------------------------

define_error! {
    /// Error type for `ActivateTask`.
    pub enum ActivateTaskError {
        Id,
        Limit,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `TerminateTask`.
    pub enum TerminateTaskError {
        Resource,
        Spinlock,
        DisabledInt,
        CallLevel,
    }
}

define_error! {
    /// Error type for `ChainTask`.
    pub enum ChainTaskError {
        Id,
        Limit,
        Resource,
        Spinlock,
        DisabledInt,
        Access,
        Core,
        CallLevel,
    }
}

impl From<ActivateTaskError> for ChainTaskError {
    #[inline]
    fn from(x: ActivateTaskError) -> Self {
        match x {
            ActivateTaskError::Id => Self::Id,
            ActivateTaskError::Limit => Self::Limit,
            ActivateTaskError::Access => Self::Access,
            ActivateTaskError::Core => Self::Core,
            ActivateTaskError::CallLevel => Self::CallLevel,
        }
    }
}

impl From<TerminateTaskError> for ChainTaskError {
    #[inline]
    fn from(x: TerminateTaskError) -> Self {
        match x {
            TerminateTaskError::Resource => Self::Resource,
            TerminateTaskError::Spinlock => Self::Spinlock,
            TerminateTaskError::DisabledInt => Self::DisabledInt,
            TerminateTaskError::CallLevel => Self::CallLevel,
        }
    }
}

define_error! {
    /// Error type for `Schedule`.
    pub enum ScheduleError {
        Resource,
        Spinlock,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetTaskState`.
    pub enum GetTaskStateError {
        Id,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `SetEvent`.
    pub enum SetEventError {
        Id,
        Access,
        State,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `ClearEvent`.
    pub enum ClearEventError {
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetEvent`.
    pub enum GetEventError {
        Id,
        Access,
        State,
        CallLevel,
    }
}

define_error! {
    /// Error type for `WaitEvent`.
    pub enum WaitEventError {
        Access,
        Resource,
        Spinlock,
        CallLevel,
    }
}

define_error! {
    /// Error type for the interrupt source services
    /// (`EnableInterruptSource` and friends).
    pub enum InterruptSourceError {
        Id,
        Access,
        NotTheOwner,
        UnimplementedClearPending,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetResource`.
    pub enum GetResourceError {
        Id,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `ReleaseResource`.
    pub enum ReleaseResourceError {
        Id,
        Access,
        NoFunc,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetSpinlock` and `TryToGetSpinlock`.
    pub enum GetSpinlockError {
        Id,
        Access,
        InterferenceDeadlock,
        NestingError,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `ReleaseSpinlock`.
    pub enum ReleaseSpinlockError {
        Id,
        Access,
        State,
        NestingError,
        CallLevel,
    }
}

define_error! {
    /// Error type for `IncrementCounter`.
    pub enum IncrementCounterError {
        Id,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetCounterValue`.
    pub enum GetCounterValueError {
        Id,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetElapsedValue`.
    pub enum GetElapsedValueError {
        Id,
        Value,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetAlarmBase`.
    pub enum GetAlarmBaseError {
        Id,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetAlarm`.
    pub enum GetAlarmError {
        Id,
        NoFunc,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `SetRelAlarm` and `SetAbsAlarm`.
    pub enum SetAlarmError {
        Id,
        Value,
        State,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `CancelAlarm`.
    pub enum CancelAlarmError {
        Id,
        NoFunc,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `StartScheduleTableRel` and `StartScheduleTableAbs`.
    pub enum StartScheduleTableError {
        Id,
        Value,
        State,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `StopScheduleTable`.
    pub enum StopScheduleTableError {
        Id,
        NoFunc,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `NextScheduleTable`.
    pub enum NextScheduleTableError {
        Id,
        NoFunc,
        State,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `SyncScheduleTable`.
    pub enum SyncScheduleTableError {
        Id,
        Value,
        State,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `SetScheduleTableAsync`.
    pub enum SetScheduleTableAsyncError {
        Id,
        State,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `GetScheduleTableStatus`.
    pub enum GetScheduleTableStatusError {
        Id,
        Access,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `CheckObjectAccess` and `CheckObjectOwnership`.
    pub enum CheckObjectError {
        Id,
        CallLevel,
    }
}

define_error! {
    /// Error type for `TerminateApplication`.
    pub enum TerminateApplicationError {
        Id,
        Access,
        State,
        Core,
        CallLevel,
    }
}

define_error! {
    /// Error type for `AllowAccess`.
    pub enum AllowAccessError {
        Id,
        Access,
        State,
        CallLevel,
    }
}

define_error! {
    /// Error type for `StartCore` and `StartNonAutosarCore`.
    pub enum StartCoreError {
        Id,
        State,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `ControlIdle`.
    pub enum ControlIdleError {
        Id,
        Core,
        Access,
        CallLevel,
    }
}

define_error! {
    /// Error type for `CallTrustedFunction` and `CallNonTrustedFunction`.
    pub enum CallTrustedFunctionError {
        Id,
        Access,
        CallLevel,
    }
}

// Internal building blocks
// ---------------------------------------------------------------------------

define_suberror! {
    /// `CallLevel`
    #[into(ActivateTaskError)]
    #[into(TerminateTaskError)]
    #[into(ChainTaskError)]
    #[into(ScheduleError)]
    #[into(GetTaskStateError)]
    #[into(SetEventError)]
    #[into(ClearEventError)]
    #[into(GetEventError)]
    #[into(WaitEventError)]
    #[into(InterruptSourceError)]
    #[into(GetResourceError)]
    #[into(ReleaseResourceError)]
    #[into(GetSpinlockError)]
    #[into(ReleaseSpinlockError)]
    #[into(IncrementCounterError)]
    #[into(GetCounterValueError)]
    #[into(GetElapsedValueError)]
    #[into(GetAlarmBaseError)]
    #[into(GetAlarmError)]
    #[into(SetAlarmError)]
    #[into(CancelAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(StopScheduleTableError)]
    #[into(NextScheduleTableError)]
    #[into(SyncScheduleTableError)]
    #[into(SetScheduleTableAsyncError)]
    #[into(GetScheduleTableStatusError)]
    #[into(CheckObjectError)]
    #[into(TerminateApplicationError)]
    #[into(AllowAccessError)]
    #[into(StartCoreError)]
    #[into(ControlIdleError)]
    #[into(CallTrustedFunctionError)]
    pub(super) enum BadContextError {
        CallLevel,
    }
}

define_suberror! {
    /// `Id`
    #[into(ActivateTaskError)]
    #[into(ChainTaskError)]
    #[into(GetTaskStateError)]
    #[into(SetEventError)]
    #[into(GetEventError)]
    #[into(InterruptSourceError)]
    #[into(GetResourceError)]
    #[into(ReleaseResourceError)]
    #[into(GetSpinlockError)]
    #[into(ReleaseSpinlockError)]
    #[into(IncrementCounterError)]
    #[into(GetCounterValueError)]
    #[into(GetElapsedValueError)]
    #[into(GetAlarmBaseError)]
    #[into(GetAlarmError)]
    #[into(SetAlarmError)]
    #[into(CancelAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(StopScheduleTableError)]
    #[into(NextScheduleTableError)]
    #[into(SyncScheduleTableError)]
    #[into(SetScheduleTableAsyncError)]
    #[into(GetScheduleTableStatusError)]
    #[into(CheckObjectError)]
    #[into(TerminateApplicationError)]
    #[into(AllowAccessError)]
    #[into(StartCoreError)]
    #[into(ControlIdleError)]
    #[into(CallTrustedFunctionError)]
    pub(super) enum BadIdError {
        Id,
    }
}

define_suberror! {
    /// `Access`
    #[into(ActivateTaskError)]
    #[into(ChainTaskError)]
    #[into(GetTaskStateError)]
    #[into(SetEventError)]
    #[into(ClearEventError)]
    #[into(GetEventError)]
    #[into(WaitEventError)]
    #[into(InterruptSourceError)]
    #[into(GetResourceError)]
    #[into(ReleaseResourceError)]
    #[into(GetSpinlockError)]
    #[into(ReleaseSpinlockError)]
    #[into(IncrementCounterError)]
    #[into(GetCounterValueError)]
    #[into(GetElapsedValueError)]
    #[into(GetAlarmBaseError)]
    #[into(GetAlarmError)]
    #[into(SetAlarmError)]
    #[into(CancelAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(StopScheduleTableError)]
    #[into(NextScheduleTableError)]
    #[into(SyncScheduleTableError)]
    #[into(SetScheduleTableAsyncError)]
    #[into(GetScheduleTableStatusError)]
    #[into(TerminateApplicationError)]
    #[into(AllowAccessError)]
    #[into(StartCoreError)]
    #[into(ControlIdleError)]
    #[into(CallTrustedFunctionError)]
    pub(super) enum NoAccessError {
        Access,
    }
}

define_suberror! {
    /// `Value`
    #[into(GetElapsedValueError)]
    #[into(SetAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(SyncScheduleTableError)]
    pub(super) enum BadParamError {
        Value,
    }
}

define_suberror! {
    /// `State`
    #[into(SetEventError)]
    #[into(GetEventError)]
    #[into(SetAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(NextScheduleTableError)]
    #[into(SyncScheduleTableError)]
    #[into(SetScheduleTableAsyncError)]
    #[into(TerminateApplicationError)]
    #[into(AllowAccessError)]
    #[into(StartCoreError)]
    pub(super) enum BadStateError {
        State,
    }
}

define_suberror! {
    /// `Core`
    #[into(ActivateTaskError)]
    #[into(ChainTaskError)]
    #[into(SetEventError)]
    #[into(IncrementCounterError)]
    #[into(SetAlarmError)]
    #[into(CancelAlarmError)]
    #[into(StartScheduleTableError)]
    #[into(StopScheduleTableError)]
    #[into(NextScheduleTableError)]
    #[into(SyncScheduleTableError)]
    #[into(SetScheduleTableAsyncError)]
    #[into(GetScheduleTableStatusError)]
    #[into(TerminateApplicationError)]
    #[into(ControlIdleError)]
    pub(super) enum BadCoreError {
        Core,
    }
}
