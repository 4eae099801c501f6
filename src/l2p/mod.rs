//! # Logical-to-Physical Map
//!
//! Two interchangeable backends implement the same contract behind the
//! [`L2p`] trait: a flat, always-resident table and a paged table with an
//! LRU-evicted resident set. The device picks one at construction.
//!
//! Pinning makes a range of entries resident and guarantees `get`/`set`
//! work on it until the matching `unpin`. A pin the backend cannot serve
//! right now comes back as deferred; the device parks it on a FIFO and
//! retries one per scheduler tick.

pub mod cache;
pub mod flat;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;

use crate::core::addr::Addr;

/// L2P subsystem errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum L2pError {
    /// Logical block outside the device capacity.
    #[error("logical block {0} out of range")]
    OutOfRange(u64),

    /// Page I/O against the backing region failed.
    #[error("logical-to-physical page I/O failed")]
    Io,

    /// The covering page was marked corrupted by an earlier I/O error.
    #[error("logical-to-physical page corrupted")]
    Corrupted,

    /// The device began halting while the request was in flight.
    #[error("device halting")]
    Aborted,
}

/// Completion of a whole-table operation (clear, persist).
pub type L2pCb = Box<dyn FnOnce(Result<(), L2pError>)>;

/// Completion of a pin request.
pub type PinCb = Box<dyn FnOnce(Result<(), L2pError>)>;

/// A pin request travelling through the backend.
pub struct PinCtx {
    /// First logical block of the pinned range.
    pub lba: u64,
    /// Number of logical blocks.
    pub count: u64,
    /// Completion callback.
    pub cb: Option<PinCb>,
}

impl PinCtx {
    /// Build a pin request.
    pub fn new(lba: u64, count: u64, cb: PinCb) -> Self {
        PinCtx {
            lba,
            count,
            cb: Some(cb),
        }
    }

    /// Fire the completion with `result`.
    pub fn complete(mut self, result: Result<(), L2pError>) {
        if let Some(cb) = self.cb.take() {
            cb(result);
        }
    }
}

/// Outcome of handing a pin to a backend.
pub enum PinOutcome {
    /// The backend took the request; the callback fires asynchronously.
    Accepted,
    /// The backend is out of resources; retry after it makes progress.
    Deferred(PinCtx),
}

/// Operation set shared by both backends.
pub trait L2p {
    /// Translate one logical block. The covering range must be resident
    /// (pinned on the cache backend).
    fn get(&self, lba: u64) -> Addr;

    /// Update one logical block. Same residency requirement as `get`.
    fn set(&mut self, lba: u64, addr: Addr);

    /// Make `[lba, lba + count)` resident.
    fn pin(&mut self, pin_ctx: PinCtx) -> PinOutcome;

    /// Release a previously pinned range.
    fn unpin(&mut self, lba: u64, count: u64);

    /// Fill the whole table with the invalid address and persist it.
    fn clear(&mut self, cb: L2pCb);

    /// Write the table back to its backing region.
    fn persist(&mut self, cb: L2pCb);

    /// Per-tick housekeeping (eviction, deferred page work).
    fn process(&mut self);

    /// Refuse new work and start draining.
    fn halt(&mut self);

    /// Whether the backend reached its drained state.
    fn is_halted(&self) -> bool;
}

/// Shared handle to the selected backend.
pub type L2pRef = Rc<RefCell<dyn L2p>>;

/// Device-level dispatch: the backend plus the deferred-pin FIFO.
pub struct L2pDispatch {
    backend: L2pRef,
    deferred: RefCell<VecDeque<PinCtx>>,
}

impl L2pDispatch {
    /// Wrap a backend.
    pub fn new(backend: L2pRef) -> Self {
        L2pDispatch {
            backend,
            deferred: RefCell::new(VecDeque::new()),
        }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &L2pRef {
        &self.backend
    }

    /// Translate one logical block.
    pub fn get(&self, lba: u64) -> Addr {
        self.backend.borrow().get(lba)
    }

    /// Update one logical block.
    pub fn set(&self, lba: u64, addr: Addr) {
        self.backend.borrow_mut().set(lba, addr);
    }

    /// Pin a range; a deferred outcome parks the request for `process`.
    pub fn pin(&self, lba: u64, count: u64, cb: PinCb) {
        let outcome = self.backend.borrow_mut().pin(PinCtx::new(lba, count, cb));
        if let PinOutcome::Deferred(ctx) = outcome {
            self.deferred.borrow_mut().push_back(ctx);
        }
    }

    /// Complete a pin request without pinning anything; used by request
    /// paths that already hold the range.
    pub fn pin_skip(&self, cb: PinCb) {
        cb(Ok(()));
    }

    /// Release a pinned range.
    pub fn unpin(&self, lba: u64, count: u64) {
        self.backend.borrow_mut().unpin(lba, count);
    }

    /// Fill the table with the invalid address.
    pub fn clear(&self, cb: L2pCb) {
        self.backend.borrow_mut().clear(cb);
    }

    /// Persist the table.
    pub fn persist(&self, cb: L2pCb) {
        self.backend.borrow_mut().persist(cb);
    }

    /// One scheduler tick: retry one deferred pin, then let the backend
    /// make progress.
    pub fn process(&self) {
        let next = self.deferred.borrow_mut().pop_front();
        if let Some(ctx) = next {
            let outcome = self.backend.borrow_mut().pin(ctx);
            if let PinOutcome::Deferred(ctx) = outcome {
                self.deferred.borrow_mut().push_back(ctx);
            }
        }
        self.backend.borrow_mut().process();
    }

    /// Start draining.
    pub fn halt(&self) {
        self.backend.borrow_mut().halt();
    }

    /// Drained: no deferred pins and the backend reports done.
    pub fn is_halted(&self) -> bool {
        self.deferred.borrow().is_empty() && self.backend.borrow().is_halted()
    }

    /// Number of parked pin requests.
    pub fn deferred_pins(&self) -> usize {
        self.deferred.borrow().len()
    }
}
