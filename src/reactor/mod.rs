//! # Cooperative Reactor
//!
//! The translation layer runs on a single core thread. Every asynchronous
//! operation is a task object: a boxed continuation enqueued on the owner
//! thread's message ring and executed by the next reactor tick. Block
//! device completions, metadata state-machine steps, and user-visible
//! callbacks all travel through the ring, which gives the crate its
//! ordering guarantee: within the core thread, memory order is program
//! order.
//!
//! Pollers are registered functions run round-robin on every tick after
//! the ring is drained. No task may block; every tick is bounded.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// A unit of deferred work executed by the reactor.
pub type Task = Box<dyn FnOnce()>;

/// A function polled on every reactor tick. Returns `true` when it made
/// progress, which keeps `run_until` spinning productively.
pub type Poller = Box<dyn FnMut() -> bool>;

#[derive(Default)]
struct ReactorState {
    ring: VecDeque<Task>,
    pollers: Vec<Poller>,
}

/// Single-threaded message ring plus poller registry.
#[derive(Default)]
pub struct Reactor {
    state: RefCell<ReactorState>,
}

/// Shared handle to the core-thread reactor.
pub type ReactorRef = Rc<Reactor>;

impl Reactor {
    /// Create a new reactor handle.
    pub fn new() -> ReactorRef {
        Rc::new(Reactor::default())
    }

    /// Enqueue a task on the message ring.
    ///
    /// This is the message-passing primitive: any context that wants to
    /// run code on the owner thread posts it here instead of calling into
    /// the owning structure directly.
    pub fn send_msg(&self, task: Task) {
        self.state.borrow_mut().ring.push_back(task);
    }

    /// Register a poller run on every tick.
    pub fn register_poller(&self, poller: Poller) {
        self.state.borrow_mut().pollers.push(poller);
    }

    /// Number of tasks waiting on the ring.
    pub fn pending(&self) -> usize {
        self.state.borrow().ring.len()
    }

    /// Run one scheduling round: drain the tasks that were enqueued before
    /// the tick started, then run every poller once.
    ///
    /// Tasks enqueued while the tick runs are left for the next round,
    /// which keeps a tick bounded even when completions re-arm themselves.
    pub fn tick(&self) -> bool {
        let mut progressed = false;

        let batch = self.state.borrow().ring.len();
        for _ in 0..batch {
            let task = self.state.borrow_mut().ring.pop_front();
            match task {
                Some(task) => {
                    task();
                    progressed = true;
                }
                None => break,
            }
        }

        let pollers = self.state.borrow().pollers.len();
        for i in 0..pollers {
            // A poller may enqueue messages or register nothing new; it
            // must not be called with the state borrowed.
            let mut poller = {
                let mut state = self.state.borrow_mut();
                if i >= state.pollers.len() {
                    break;
                }
                std::mem::replace(&mut state.pollers[i], Box::new(|| false))
            };
            let busy = poller();
            let mut state = self.state.borrow_mut();
            if i < state.pollers.len() {
                state.pollers[i] = poller;
            }
            progressed |= busy;
        }

        progressed
    }

    /// Tick until `cond` holds or the reactor stops making progress.
    ///
    /// Returns `true` when the condition was reached. Used by mount paths
    /// and tests to drive multi-step operations to completion.
    pub fn run_until(&self, mut cond: impl FnMut() -> bool) -> bool {
        loop {
            if cond() {
                return true;
            }
            let progressed = self.tick();
            if cond() {
                return true;
            }
            if !progressed && self.pending() == 0 {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_messages_run_in_order() {
        let reactor = Reactor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = Rc::clone(&order);
            reactor.send_msg(Box::new(move || order.borrow_mut().push(i)));
        }
        reactor.tick();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_tick_defers_rearmed_tasks() {
        let reactor = Reactor::new();
        let hits = Rc::new(Cell::new(0));

        let r2 = Rc::clone(&reactor);
        let h2 = Rc::clone(&hits);
        reactor.send_msg(Box::new(move || {
            h2.set(h2.get() + 1);
            let h3 = Rc::clone(&h2);
            r2.send_msg(Box::new(move || h3.set(h3.get() + 1)));
        }));

        reactor.tick();
        assert_eq!(hits.get(), 1);
        reactor.tick();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn test_run_until_stops_without_progress() {
        let reactor = Reactor::new();
        assert!(!reactor.run_until(|| false));

        let done = Rc::new(Cell::new(false));
        let d2 = Rc::clone(&done);
        reactor.send_msg(Box::new(move || d2.set(true)));
        assert!(reactor.run_until(|| done.get()));
    }

    #[test]
    fn test_pollers_run_each_tick() {
        let reactor = Reactor::new();
        let polls = Rc::new(Cell::new(0));
        let p2 = Rc::clone(&polls);
        reactor.register_poller(Box::new(move || {
            p2.set(p2.get() + 1);
            false
        }));

        reactor.tick();
        reactor.tick();
        assert_eq!(polls.get(), 2);
    }
}
