//! Statically-declared system fixtures for the scenario tests, standing in
//! for the output of the offline configuration generator.
//!
//! Task ids follow declaration order; the comments note the ids the tests
//! rely on.
use crate::error::ErrorCode;
use crate::ProtectionDecision;
use std::sync::Mutex;

pub fn noop_entry() {}

/// The task attribute template; fixtures override the distinguishing fields
/// with functional update syntax.
pub const BASE_TASK: crate::TaskAttr = crate::TaskAttr {
    entry_point: noop_entry,
    home_priority: 7,
    running_priority: 7,
    max_activations: 1,
    extended: false,
    time_slices: None,
    autostart_modes: 0,
    core: 0,
    app: 0,
    access: 0b11,
    stack: crate::StackRef {
        id: 0,
        shared: false,
    },
    tp: None,
};

macro_rules! task_attr {
    ($($field:ident : $value:expr),* $(,)?) => {
        crate::TaskAttr {
            $($field: $value,)*
            ..super::BASE_TASK
        }
    };
}

/// Characteristics of a small test counter: `max_allowed = 99`.
pub const SMALL_COUNTER: crate::CounterCharacteristics = crate::CounterCharacteristics {
    max_allowed_value: 99,
    max_counting_value: 199,
    max_differential_value: 99,
    min_cycle: 1,
    ticks_per_base: 1,
};

/// Characteristics of a full-range HRT counter.
pub const WIDE_COUNTER: crate::CounterCharacteristics = crate::CounterCharacteristics {
    max_allowed_value: 0x7fff_ffff,
    max_counting_value: u32::MAX,
    max_differential_value: 0x7fff_ffff,
    min_cycle: 1,
    ticks_per_base: 1,
};

// ---------------------------------------------------------------------------
// `ceiling` - spec scenario 1 (basic priority ceiling) and resource ordering
// ---------------------------------------------------------------------------

pub static CEILING_ERRORS: Mutex<Vec<ErrorCode>> = Mutex::new(Vec::new());

pub fn ceiling_error_hook(code: ErrorCode) {
    CEILING_ERRORS.lock().unwrap().push(code);
}

define_test_system! {
    mod ceiling {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            // 0, 1: idle
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: T1, auto-started
            T1 => task_attr! { home_priority: 4, running_priority: 4, autostart_modes: 1 },
            // 3: T2
            T2 => task_attr! { home_priority: 2, running_priority: 2 },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [
            // 0: R, ceiling above both tasks
            R => crate::ResourceAttr { ceiling: 1, core: 0, app: 0, access: 0b11 },
            // 1: R2, nested-ordering probe
            R2 => crate::ResourceAttr { ceiling: 0, core: 0, app: 0, access: 0b11 },
        ],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2, 3], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[0, 1],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None,
            error: Some(super::ceiling_error_hook),
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `timing` - spec scenario 2 (cyclic alarm), activation limit, counter wrap,
// alarm at the maximum offset
// ---------------------------------------------------------------------------

define_test_system! {
    mod timing {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: activated by the cyclic alarm
            TCYC => task_attr! { home_priority: 3, running_priority: 3, max_activations: 8 },
            // 3: multiple-activation bound probe
            TLIM => task_attr! { home_priority: 2, running_priority: 2, max_activations: 3 },
            // 4: activated by the wrap-around alarm
            TWRAP => task_attr! { home_priority: 5, running_priority: 5, max_activations: 8 },
        ],
        isrs: [],
        counters: [
            // 0: periodic-interrupt counter (hardware timer 2)
            CPIT => crate::CounterAttr {
                driver: crate::CounterDriver::Pit { timer: 2 },
                characteristics: super::SMALL_COUNTER,
                core: 0, app: 0, access: 0b11,
            },
            // 1: software counter for wrap tests
            CSW => crate::CounterAttr {
                driver: crate::CounterDriver::Sw,
                characteristics: super::SMALL_COUNTER,
                core: 0, app: 0, access: 0b11,
            },
        ],
        alarms: [
            // 0: the cyclic alarm of scenario 2
            ACYC: 0 => crate::AlarmAttr {
                counter: 0, action: crate::AlarmAction::ActivateTask(2),
                autostart: None, core: 0, app: 0, access: 0b11,
            },
            // 1: armed across the modulo boundary
            AWRAP: 1 => crate::AlarmAttr {
                counter: 1, action: crate::AlarmAction::ActivateTask(4),
                autostart: None, core: 0, app: 0, access: 0b11,
            },
            // 2: armed at the maximum allowed offset
            AMAX: 2 => crate::AlarmAttr {
                counter: 0, action: crate::AlarmAction::ActivateTask(4),
                autostart: None, core: 0, app: 0, access: 0b11,
            },
        ],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2, 3, 4], isrs: &[], counters: &[0, 1], alarms: &[0, 1, 2],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `tp_sys` - spec scenario 3 (execution budget violation), inter-arrival
// ---------------------------------------------------------------------------

pub static TP_VIOLATIONS: Mutex<Vec<ErrorCode>> = Mutex::new(Vec::new());

pub fn tp_protection_hook(code: ErrorCode) -> ProtectionDecision {
    TP_VIOLATIONS.lock().unwrap().push(code);
    ProtectionDecision::TerminateTaskIsr
}

/// 2 ms execution budget, 5 ms inter-arrival frame (timer ticks are µs).
pub static TP_BUDGET: crate::TpTaskAttr = crate::TpBudgets {
    execution_budget: Some(2_000),
    time_frame: Some(5_000),
    resource_budgets: &[],
    all_interrupt_budget: None,
    os_interrupt_budget: None,
};

define_test_system! {
    mod tp_sys {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: the monitored task, auto-started
            TMON => task_attr! {
                home_priority: 3, running_priority: 3, autostart_modes: 1,
                max_activations: 2, tp: Some(&super::TP_BUDGET)
            },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None,
            protection: Some(super::tp_protection_hook),
        },
    }
}

// ---------------------------------------------------------------------------
// `mc` - spec scenario 4 (cross-core activation)
// ---------------------------------------------------------------------------

define_test_system! {
    mod mc {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: core-0 caller, auto-started
            TCALL => task_attr! { home_priority: 3, running_priority: 3, autostart_modes: 1 },
            // 3: the core-1 target
            TREMOTE => task_attr! { home_priority: 3, running_priority: 3, core: 1, app: 1 },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
            APP1 => crate::AppAttr {
                core: 1, trusted: false, privileged: false, restart_task: None,
                tasks: &[3], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `locks` - spec scenario 5 (spinlock rank ordering)
// ---------------------------------------------------------------------------

define_test_system! {
    mod locks {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            TA => task_attr! { home_priority: 3, running_priority: 3, autostart_modes: 1 },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [],
        spinlocks: [
            // 0: L1, rank 2
            L1 => crate::SpinlockAttr {
                rank: 2, method: crate::LockMethod::Cat2, cores: 0b11, app: 0, access: 0b11,
            },
            // 1: L2, rank 1
            L2 => crate::SpinlockAttr {
                rank: 1, method: crate::LockMethod::None, cores: 0b11, app: 0, access: 0b11,
            },
            // 2: L3, rank 3
            L3 => crate::SpinlockAttr {
                rank: 3, method: crate::LockMethod::All, cores: 0b11, app: 0, access: 0b11,
            },
        ],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `isr_kill` - spec scenario 6 (ISR killed while holding a resource)
// ---------------------------------------------------------------------------

pub static ISR_KILL_ERRORS: Mutex<Vec<ErrorCode>> = Mutex::new(Vec::new());

pub fn isr_kill_error_hook(code: ErrorCode) {
    ISR_KILL_ERRORS.lock().unwrap().push(code);
}

define_test_system! {
    mod isr_kill {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
        ],
        isrs: [
            // 0: the victim ISR, bound to source 0, owned by app 0
            I0 => crate::IsrAttr {
                source: 0,
                flags: crate::IsrFlags::empty(),
                core: 0, app: 0, access: 0b11,
                tp: None,
            },
        ],
        counters: [],
        alarms: [],
        tables: [],
        resources: [
            // 0: taken by the ISR
            RI => crate::ResourceAttr { ceiling: 0, core: 0, app: 0, access: 0b11 },
        ],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[], isrs: &[0], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[0],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None,
            error: Some(super::isr_kill_error_hook),
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `events` - extended task wait/set/clear flow
// ---------------------------------------------------------------------------

define_test_system! {
    mod events {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: the extended task, auto-started
            EXT => task_attr! {
                home_priority: 2, running_priority: 2, extended: true, autostart_modes: 1
            },
            // 3: a basic task, to verify extended-only checks
            BASIC => task_attr! { home_priority: 4, running_priority: 4 },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2, 3], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `rr` - round-robin time slicing
// ---------------------------------------------------------------------------

define_test_system! {
    mod rr {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2, 3: the round-robin pair, two slices each, auto-started
            RRA => task_attr! {
                home_priority: 3, running_priority: 3, time_slices: Some(2), autostart_modes: 1
            },
            RRB => task_attr! {
                home_priority: 3, running_priority: 3, time_slices: Some(2), autostart_modes: 1
            },
        ],
        isrs: [],
        counters: [
            CPIT => crate::CounterAttr {
                driver: crate::CounterDriver::Pit { timer: 2 },
                characteristics: super::SMALL_COUNTER,
                core: 0, app: 0, access: 0b11,
            },
        ],
        alarms: [
            // 0: the per-core round-robin alarm
            ARR: 0 => crate::AlarmAttr {
                counter: 0, action: crate::AlarmAction::RoundRobin,
                autostart: Some(crate::AlarmAutostart {
                    offset: 1, cycle: 1, modes: 1, absolute: false,
                }),
                core: 0, app: 0, access: 0b11,
            },
        ],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2, 3], isrs: &[], counters: &[0], alarms: &[0],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `table_sys` - schedule table expiry, chaining, synchronisation
// ---------------------------------------------------------------------------

define_test_system! {
    mod table_sys {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            // 2: activated by expiry points
            TP0 => task_attr! { home_priority: 3, running_priority: 3, max_activations: 8 },
            // 3: extended, receives expiry-point events
            TP1 => task_attr! {
                home_priority: 2, running_priority: 2, extended: true, autostart_modes: 1,
                max_activations: 1
            },
        ],
        isrs: [],
        counters: [
            CPIT => crate::CounterAttr {
                driver: crate::CounterDriver::Pit { timer: 2 },
                characteristics: super::SMALL_COUNTER,
                core: 0, app: 0, access: 0b11,
            },
        ],
        alarms: [],
        tables: [
            // 0: two points, repeating, explicit sync
            ST0: 0 => crate::ScheduleTableAttr {
                counter: 0,
                duration: 20,
                points: &[
                    crate::ExpiryPoint {
                        offset: 2,
                        actions: &[crate::ExpiryAction::ActivateTask(2)],
                        max_shorten: 1,
                        max_lengthen: 2,
                    },
                    crate::ExpiryPoint {
                        offset: 7,
                        actions: &[crate::ExpiryAction::SetEvent(3, 0x2)],
                        max_shorten: 1,
                        max_lengthen: 2,
                    },
                ],
                sync: crate::SyncStrategy::Explicit { precision: 1 },
                repeating: true,
                core: 0, app: 0, access: 0b11,
            },
            // 1: single-shot successor for `NextScheduleTable`
            ST1: 1 => crate::ScheduleTableAttr {
                counter: 0,
                duration: 10,
                points: &[crate::ExpiryPoint {
                    offset: 3,
                    actions: &[crate::ExpiryAction::ActivateTask(2)],
                    max_shorten: 0,
                    max_lengthen: 0,
                }],
                sync: crate::SyncStrategy::None,
                repeating: false,
                core: 0, app: 0, access: 0b11,
            },
        ],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2, 3], isrs: &[], counters: &[0], alarms: &[],
                schedule_tables: &[0, 1], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `hrt` - free-running counter, compare reprogramming corrective loop
// ---------------------------------------------------------------------------

define_test_system! {
    mod hrt {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            THR => task_attr! { home_priority: 3, running_priority: 3, max_activations: 8 },
        ],
        isrs: [],
        counters: [
            // 0: free-running counter on hardware timer 3
            CHRT => crate::CounterAttr {
                driver: crate::CounterDriver::Hrt { timer: 3 },
                characteristics: super::WIDE_COUNTER,
                core: 0, app: 0, access: 0b11,
            },
        ],
        alarms: [
            AH0: 0 => crate::AlarmAttr {
                counter: 0, action: crate::AlarmAction::ActivateTask(2),
                autostart: None, core: 0, app: 0, access: 0b11,
            },
            AH1: 1 => crate::AlarmAttr {
                counter: 0, action: crate::AlarmAction::ActivateTask(2),
                autostart: None, core: 0, app: 0, access: 0b11,
            },
        ],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2], isrs: &[], counters: &[0], alarms: &[0, 1],
                schedule_tables: &[], resources: &[],
                startup_hook: None, shutdown_hook: None, error_hook: None,
            },
        ],
        trusted_fns: [],
        hooks: crate::Hooks {
            startup: None, shutdown: None, error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}

// ---------------------------------------------------------------------------
// `misc` - interrupt-disable round trip, trusted functions, shutdown
// ---------------------------------------------------------------------------

pub static MISC_SHUTDOWN: Mutex<Vec<ErrorCode>> = Mutex::new(Vec::new());
pub static MISC_TRUSTED_CALLS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

pub fn misc_shutdown_hook(code: ErrorCode) {
    MISC_SHUTDOWN.lock().unwrap().push(code);
}

pub fn misc_trusted_fn(param: usize) {
    MISC_TRUSTED_CALLS.lock().unwrap().push(param);
}

define_test_system! {
    mod misc {
        priority_levels: 8,
        idle_tasks: [0, 1],
        tasks: [
            IDLE0 => task_attr! { home_priority: 7, running_priority: 7 },
            IDLE1 => task_attr! { home_priority: 7, running_priority: 7, core: 1 },
            TM => task_attr! { home_priority: 3, running_priority: 3, autostart_modes: 1 },
        ],
        isrs: [],
        counters: [],
        alarms: [],
        tables: [],
        resources: [],
        spinlocks: [],
        apps: [
            APP0 => crate::AppAttr {
                core: 0, trusted: false, privileged: false, restart_task: None,
                tasks: &[2], isrs: &[], counters: &[], alarms: &[],
                schedule_tables: &[], resources: &[],
                startup_hook: None,
                shutdown_hook: Some(super::misc_shutdown_hook),
                error_hook: None,
            },
        ],
        trusted_fns: [
            crate::TrustedFnAttr {
                function: super::misc_trusted_fn,
                delay_violation: false,
                trusted: true,
            },
        ],
        hooks: crate::Hooks {
            startup: None,
            shutdown: Some(super::misc_shutdown_hook),
            error: None,
            pre_task: None, post_task: None, protection: None,
        },
    }
}
