//! Counter-driven jobs
//!
//! A *job* is the unit of work a counter can expire: the timed part of an
//! alarm, a schedule table, or anything else that wants a callback at an
//! absolute counter value. Jobs are statically embedded in their owning
//! objects; the counter's priority queue stores `(timestamp, job)` nodes so
//! that ordering decisions never have to chase the job's mutable state.
use core::fmt;

use crate::{
    counter,
    klock::{CpuLockCell, CpuLockGuard},
    utils::BinaryHeapCtx,
    CounterId, PortThreading, TickType,
};

/// Job callback function.
///
/// Called with CPU Lock active when the job expires, after the job has been
/// removed from the queue. The callback may re-insert the job (cyclic alarms,
/// schedule tables) and may wake up tasks; dispatching is taken care of by
/// the counter engine afterwards.
pub(crate) type JobFn<Traits> =
    fn(&'static JobCb<Traits>, CpuLockGuard<Traits>) -> CpuLockGuard<Traits>;

/// *Job control block* - the timed-expiry base embedded in alarms and
/// schedule tables.
pub struct JobCb<Traits: PortThreading> {
    /// The owning counter.
    pub counter: CounterId,

    /// Callback invoked on expiry.
    pub(crate) callback: JobFn<Traits>,

    /// The dense id of the owning object within its pool, passed back to
    /// the callback through the job reference.
    pub param: usize,

    /// The absolute counter value this job expires at. Meaningful while the
    /// job is linked, and kept afterwards for cyclic re-arming.
    pub(crate) expiration: CpuLockCell<Traits, TickType>,

    /// Whether the job is currently in its counter's queue.
    pub(crate) linked: CpuLockCell<Traits, bool>,
}

impl<Traits: PortThreading> JobCb<Traits> {
    pub(crate) const fn new(counter: CounterId, callback: JobFn<Traits>, param: usize) -> Self {
        Self {
            counter,
            callback,
            param,
            expiration: CpuLockCell::new(0),
            linked: CpuLockCell::new(false),
        }
    }
}

impl<Traits: PortThreading> fmt::Debug for JobCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobCb")
            .field("self", &(self as *const _))
            .field("counter", &self.counter)
            .field("param", &self.param)
            .finish_non_exhaustive()
    }
}

/// An entry of a counter's job queue.
pub struct JobNode<Traits: PortThreading> {
    /// The expiration timestamp the job was inserted with. Invariant:
    /// `at == job.expiration` while the node is in the queue.
    pub at: TickType,
    pub job: &'static JobCb<Traits>,
}

impl<Traits: PortThreading> Clone for JobNode<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: PortThreading> Copy for JobNode<Traits> {}

impl<Traits: PortThreading> fmt::Debug for JobNode<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobNode")
            .field("at", &self.at)
            .field("job", &(self.job as *const _))
            .finish()
    }
}

/// Comparator context for a counter's job queue. A job is "less" (expires
/// sooner) than another iff the other's timestamp lies in its future,
/// following the modular future-value rule of the owning counter.
pub(crate) struct JobHeapCtx {
    pub max_counting_value: TickType,
    pub max_differential_value: TickType,
}

impl<Traits: PortThreading> BinaryHeapCtx<JobNode<Traits>> for JobHeapCtx {
    #[inline]
    fn lt(&mut self, x: &JobNode<Traits>, y: &JobNode<Traits>) -> bool {
        counter::is_future_value(
            self.max_counting_value,
            self.max_differential_value,
            y.at,
            x.at,
        )
    }
}
